//! Common test utilities for fanout-relay integration tests

#![allow(dead_code)]

use std::sync::Mutex;
use std::time::Duration;

use fanout_relay::{
    Config, Error, Event, ResolvedPayload, Result, RetryConfig, TargetAutomation, TargetRef,
};
use tokio::sync::broadcast;

/// One recorded automation invocation
#[derive(Clone, Debug)]
pub struct Published {
    pub target: String,
    pub title: String,
    pub files: Vec<Vec<u8>>,
}

/// Destination automation that records what it was asked to publish
#[derive(Default)]
pub struct RecordingAutomation {
    pub fail: bool,
    pub delay: Duration,
    published: Mutex<Vec<Published>>,
}

impl RecordingAutomation {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn delayed(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    pub fn published(&self) -> Vec<Published> {
        self.published.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl TargetAutomation for RecordingAutomation {
    async fn publish(
        &self,
        target: &TargetRef,
        payload: &ResolvedPayload,
    ) -> Result<Option<serde_json::Value>> {
        self.published.lock().unwrap().push(Published {
            target: target.id.to_string(),
            title: payload.title.clone(),
            files: payload.files.iter().map(|f| f.data.to_vec()).collect(),
        });
        tokio::time::sleep(self.delay).await;

        if self.fail {
            return Err(Error::TargetPublishFailure {
                target: target.id.clone(),
                reason: "composer rejected the post".to_string(),
            });
        }
        Ok(Some(serde_json::json!({ "url": format!("https://{}/p/1", target.id) })))
    }
}

/// Small thresholds so a few KiB exercise every transfer mode
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.broker.direct_threshold_bytes = 1024;
    config.broker.chunk_size = 256;
    config.worker.completion_wait = Duration::from_secs(10);
    config.worker.completion_poll_interval = Duration::from_millis(20);
    config.worker.retry = RetryConfig {
        max_attempts: 2,
        initial_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(50),
        backoff_multiplier: 2.0,
        jitter: false,
    };
    config.scheduler.inter_target_delay = Duration::ZERO;
    config.scheduler.target_timeout = Duration::from_secs(30);
    config
}

/// Deterministic, non-repeating-per-chunk test content
pub fn sample_bytes(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

/// Drain whatever events are already buffered
pub fn drain(rx: &mut broadcast::Receiver<Event>) -> Vec<Event> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
