//! Top-level facade wiring the broker reactor, progress aggregator,
//! scheduler and event bus together.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;

use crate::broker::{BrokerHandle, BrokerStats, spawn_broker};
use crate::config::Config;
use crate::error::Result;
use crate::progress::ProgressAggregator;
use crate::scheduler::{DispatchOptions, PublishJobScheduler, TargetAutomation};
use crate::types::{
    ContentPayload, Event, FileDescriptor, FileId, FileMetadata, JobSummary, ProgressRecord,
    TargetId, TargetRef,
};
use crate::wait::{WaitOutcome, poll_until};

/// Time allowed for running jobs to finish during shutdown
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Multi-destination publisher (cloneable, shared state)
#[derive(Clone)]
pub struct Relay {
    config: Arc<Config>,
    broker: BrokerHandle,
    broker_task: Arc<Mutex<Option<JoinHandle<()>>>>,
    progress: ProgressAggregator,
    scheduler: PublishJobScheduler,
    event_tx: broadcast::Sender<Event>,
}

impl Relay {
    /// Validate `config` and start the broker reactor.
    ///
    /// Must be called inside a tokio runtime.
    pub async fn new(config: Config) -> Result<Self> {
        config.validate()?;

        // Buffer of 1000 events per subscriber
        let (event_tx, _rx) = broadcast::channel(1000);
        let progress = ProgressAggregator::new(config.progress.clone(), event_tx.clone());
        let (broker, broker_task) = spawn_broker(
            config.broker.clone(),
            progress.clone(),
            event_tx.clone(),
            config.worker.request_timeout,
        )?;
        let scheduler = PublishJobScheduler::new(
            broker.clone(),
            config.scheduler.clone(),
            config.worker.clone(),
            event_tx.clone(),
        );

        tracing::info!(
            direct_threshold_bytes = config.broker.direct_threshold_bytes,
            chunk_size = config.broker.chunk_size,
            max_concurrent_targets = config.scheduler.max_concurrent_targets,
            "Relay started"
        );

        Ok(Self {
            config: Arc::new(config),
            broker,
            broker_task: Arc::new(Mutex::new(Some(broker_task))),
            progress,
            scheduler,
            event_tx,
        })
    }

    /// Subscribe to the event bus
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.event_tx.subscribe()
    }

    /// Active configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Hand attachment bytes to the broker
    pub async fn ingest(&self, data: Vec<u8>, metadata: FileMetadata) -> Result<FileDescriptor> {
        self.broker.ingest(data, metadata).await
    }

    /// Drop an attachment once no session references it
    pub async fn release(&self, file_id: FileId) -> Result<()> {
        self.broker.release(file_id).await
    }

    /// Register (or replace) the automation for a destination
    pub async fn register_destination(
        &self,
        target: impl Into<TargetId>,
        automation: Arc<dyn TargetAutomation>,
    ) {
        self.scheduler.register(target, automation).await;
    }

    /// Remove a destination
    pub async fn unregister_destination(&self, target: &TargetId) -> bool {
        self.scheduler.unregister(target).await
    }

    /// Publish `payload` to `targets`; see [`PublishJobScheduler::dispatch`]
    pub async fn dispatch(
        &self,
        targets: Vec<TargetRef>,
        payload: ContentPayload,
        options: DispatchOptions,
    ) -> Result<JobSummary> {
        self.scheduler.dispatch(targets, payload, options).await
    }

    /// Latest progress per target
    pub fn progress_snapshot(&self) -> HashMap<TargetId, ProgressRecord> {
        self.progress.snapshot()
    }

    /// Broker registry counts
    pub async fn broker_stats(&self) -> Result<BrokerStats> {
        self.broker.stats().await
    }

    /// Gracefully shut down.
    ///
    /// 1. Stops accepting new jobs
    /// 2. Waits up to 30 seconds for running jobs to finish
    /// 3. Stops the broker reactor; later channel calls fail with `NoResponder`
    /// 4. Emits [`Event::Shutdown`]
    pub async fn shutdown(&self) -> Result<()> {
        tracing::info!("Initiating graceful shutdown");
        self.scheduler.stop_accepting();

        let scheduler = &self.scheduler;
        let drained: WaitOutcome<(), std::convert::Infallible> =
            poll_until(Duration::from_millis(100), SHUTDOWN_TIMEOUT, move || async move {
                Ok((scheduler.active_jobs() == 0).then_some(()))
            })
            .await;
        if drained.is_ready() {
            tracing::info!("All running jobs finished");
        } else {
            tracing::warn!(
                active_jobs = self.scheduler.active_jobs(),
                "Timeout waiting for jobs to finish, proceeding with shutdown"
            );
        }

        self.broker.shutdown();
        let task = self.broker_task.lock().await.take();
        if let Some(task) = task
            && let Err(e) = task.await
        {
            tracing::error!(error = %e, "Broker reactor task failed");
        }

        self.event_tx.send(Event::Shutdown).ok();
        tracing::info!("Graceful shutdown complete");
        Ok(())
    }
}
