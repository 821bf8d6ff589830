//! # fanout-relay
//!
//! Multi-destination publish orchestration with cooperative attachment transfer.
//!
//! ## Design Philosophy
//!
//! fanout-relay is designed to be:
//! - **Failure-isolated** - One destination failing or hanging never affects its siblings
//! - **Broker-owned state** - A single reactor task owns attachment bytes and
//!   session state; workers only talk to it through messages
//! - **Library-first** - Destinations plug in through [`TargetAutomation`]
//! - **Event-driven** - Consumers subscribe to events, no polling required
//!
//! Large attachments are split into chunks. When several destinations run at
//! once, each fetches a contiguous share of the chunks and reports it to the
//! broker; once the session is complete every destination pulls the full
//! sequence. Anything that goes wrong on that path degrades to each
//! destination fetching every chunk itself.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use fanout_relay::{
//!     Config, ContentPayload, DispatchOptions, FileMetadata, FileRef, Relay, ResolvedPayload,
//!     TargetAutomation, TargetRef,
//! };
//!
//! struct Blog;
//!
//! #[async_trait::async_trait]
//! impl TargetAutomation for Blog {
//!     async fn publish(
//!         &self,
//!         _target: &TargetRef,
//!         payload: &ResolvedPayload,
//!     ) -> fanout_relay::Result<Option<serde_json::Value>> {
//!         println!("publishing {} with {} file(s)", payload.title, payload.files.len());
//!         Ok(None)
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let relay = Relay::new(Config::default()).await?;
//!     relay.register_destination("blog", Arc::new(Blog)).await;
//!
//!     // Subscribe to events
//!     let mut events = relay.subscribe();
//!     tokio::spawn(async move {
//!         while let Ok(event) = events.recv().await {
//!             println!("Event: {:?}", event);
//!         }
//!     });
//!
//!     let image = relay
//!         .ingest(vec![0u8; 8 * 1024 * 1024], FileMetadata {
//!             name: "cover.png".into(),
//!             mime_type: Some("image/png".into()),
//!             last_modified: None,
//!         })
//!         .await?;
//!
//!     let summary = relay
//!         .dispatch(
//!             vec![TargetRef::new("blog")],
//!             ContentPayload {
//!                 title: "Hello".into(),
//!                 body: "First post".into(),
//!                 files: vec![FileRef::from(&image)],
//!             },
//!             DispatchOptions::concurrent(),
//!         )
//!         .await?;
//!     println!("{} succeeded", summary.success_count);
//!
//!     relay.shutdown().await?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// File broker and distributed download sessions
pub mod broker;
/// Broker protocol and message channel
pub mod channel;
/// Configuration types
pub mod config;
/// Error types
pub mod error;
/// Progress aggregation
pub mod progress;
/// Top-level facade
pub mod relay;
/// Retry logic with exponential backoff
pub mod retry;
/// Publish job scheduling
pub mod scheduler;
/// Core types and events
pub mod types;
/// Bounded polling
pub mod wait;
/// Worker-side file agent
pub mod worker;

// Re-export commonly used types
pub use broker::{BrokerHandle, BrokerStats, DownloadSession, FileBroker, partition_chunks};
pub use channel::{BrokerRequest, BrokerResponse, ChannelClient, MessageChannel, RoutingDecision};
pub use config::{
    BrokerConfig, Config, ProgressConfig, RetryConfig, SchedulerConfig, WorkerConfig,
};
pub use error::{Error, Result};
pub use progress::ProgressAggregator;
pub use relay::Relay;
pub use scheduler::{DispatchOptions, PublishJobScheduler, TargetAutomation};
pub use types::{
    ContentPayload, DispatchMode, Event, FileDescriptor, FileId, FileMetadata, FileRef, JobId,
    JobSummary, LocalFile, ProgressRecord, ResolvedPayload, SessionId, Stage, TargetId,
    TargetRef, TargetResult, TargetStatus, TransferMode,
};
pub use wait::{WaitOutcome, poll_until};
pub use worker::WorkerFileAgent;

/// Helper function to run the relay with graceful signal handling.
///
/// Waits for a termination signal and then calls the relay's `shutdown()` method.
///
/// - **Unix:** listens for SIGTERM and SIGINT, with fallbacks if signal registration fails.
/// - **Windows/other:** listens for Ctrl+C via `tokio::signal::ctrl_c()`.
///
/// # Example
///
/// ```no_run
/// use fanout_relay::{Config, Relay, run_with_shutdown};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let relay = Relay::new(Config::default()).await?;
///
///     // Run with automatic signal handling
///     run_with_shutdown(relay).await?;
///
///     Ok(())
/// }
/// ```
pub async fn run_with_shutdown(relay: Relay) -> Result<()> {
    wait_for_signal().await;
    relay.shutdown().await
}

/// Resolve on the first of SIGINT or (on unix) SIGTERM.
///
/// A signal whose handler cannot be installed is logged and never fires, so
/// the other one still ends the wait.
async fn wait_for_signal() {
    let interrupt = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "SIGINT handler unavailable");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = interrupt => tracing::info!(signal = "SIGINT", "Shutting down relay"),
        () = terminate => tracing::info!(signal = "SIGTERM", "Shutting down relay"),
    }
}
