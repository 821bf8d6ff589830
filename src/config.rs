//! Configuration types for fanout-relay

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::types::Stage;

/// File broker behavior (transfer thresholds and session lifetime)
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Files smaller than this are returned inline (default: 5 MiB)
    #[serde(default = "default_direct_threshold")]
    pub direct_threshold_bytes: u64,

    /// Chunk size for chunked and distributed transfer (default: 1 MiB)
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,

    /// How long a session lives without a completion report (default: 120 seconds)
    ///
    /// Every chunk report refreshes the deadline.
    #[serde(default = "default_session_ttl", with = "duration_serde")]
    pub session_ttl: Duration,

    /// Interval between expired-session sweeps (default: 5 seconds)
    #[serde(default = "default_reap_interval", with = "duration_serde")]
    pub reap_interval: Duration,

    /// Maximum number of open sessions (default: 64)
    ///
    /// Route requests that would exceed it get the chunked fallback.
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,

    /// Capacity of the broker's inbound command queue (default: 1024)
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            direct_threshold_bytes: default_direct_threshold(),
            chunk_size: default_chunk_size(),
            session_ttl: default_session_ttl(),
            reap_interval: default_reap_interval(),
            max_sessions: default_max_sessions(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

impl BrokerConfig {
    /// Reject values the broker cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(config_error("chunk size must be non-zero", "broker.chunk_size"));
        }
        if self.max_sessions == 0 {
            return Err(config_error(
                "at least one session must be allowed",
                "broker.max_sessions",
            ));
        }
        if self.queue_capacity == 0 {
            return Err(config_error(
                "queue capacity must be non-zero",
                "broker.queue_capacity",
            ));
        }
        if self.reap_interval.is_zero() {
            return Err(config_error(
                "reap interval must be non-zero",
                "broker.reap_interval",
            ));
        }
        Ok(())
    }
}

/// Worker-side transfer behavior
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Round-trip bound for a request to the broker (default: 30 seconds)
    #[serde(default = "default_request_timeout", with = "duration_serde")]
    pub request_timeout: Duration,

    /// Bound for enqueueing a fire-and-forget notification (default: 5 seconds)
    #[serde(default = "default_notify_timeout", with = "duration_serde")]
    pub notify_timeout: Duration,

    /// Maximum time to wait for a distributed session to complete (default: 120 seconds)
    #[serde(default = "default_completion_wait", with = "duration_serde")]
    pub completion_wait: Duration,

    /// Interval between completion queries (default: 500 ms)
    #[serde(default = "default_completion_poll", with = "millis_serde")]
    pub completion_poll_interval: Duration,

    /// Maximum concurrent chunk fetches per worker (default: 3)
    #[serde(default = "default_chunk_concurrency")]
    pub chunk_concurrency: usize,

    /// Attach a second local caller to an in-flight fetch instead of failing fast (default: true)
    #[serde(default = "default_true")]
    pub attach_to_in_flight: bool,

    /// Keep this worker's assigned chunks during distributed reassembly (default: false)
    ///
    /// When false the worker pulls the full chunk sequence from the broker again.
    #[serde(default)]
    pub reuse_assigned_chunks: bool,

    /// Retry behavior for chunk fetches
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            request_timeout: default_request_timeout(),
            notify_timeout: default_notify_timeout(),
            completion_wait: default_completion_wait(),
            completion_poll_interval: default_completion_poll(),
            chunk_concurrency: default_chunk_concurrency(),
            attach_to_in_flight: true,
            reuse_assigned_chunks: false,
            retry: RetryConfig::default(),
        }
    }
}

/// Publish job dispatch behavior
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Maximum targets running at once in concurrent mode (default: 8)
    #[serde(default = "default_max_concurrent_targets")]
    pub max_concurrent_targets: usize,

    /// Delay between targets in sequential mode (default: 2 seconds)
    #[serde(default = "default_inter_target_delay", with = "millis_serde")]
    pub inter_target_delay: Duration,

    /// Timeout for a single target invocation (default: 300 seconds)
    #[serde(default = "default_target_timeout", with = "duration_serde")]
    pub target_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_targets: default_max_concurrent_targets(),
            inter_target_delay: default_inter_target_delay(),
            target_timeout: default_target_timeout(),
        }
    }
}

/// Stage weights for overall progress (must sum to 100)
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressConfig {
    /// Weight of the acquisition stage (default: 40)
    #[serde(default = "default_acquisition_weight")]
    pub acquisition_weight: u32,

    /// Weight of the assembly stage (default: 30)
    #[serde(default = "default_assembly_weight")]
    pub assembly_weight: u32,

    /// Weight of the injection stage (default: 30)
    #[serde(default = "default_injection_weight")]
    pub injection_weight: u32,
}

impl ProgressConfig {
    /// Weight of a single stage
    pub fn weight(&self, stage: Stage) -> u32 {
        match stage {
            Stage::Acquisition => self.acquisition_weight,
            Stage::Assembly => self.assembly_weight,
            Stage::Injection => self.injection_weight,
        }
    }
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            acquisition_weight: default_acquisition_weight(),
            assembly_weight: default_assembly_weight(),
            injection_weight: default_injection_weight(),
        }
    }
}

/// Retry configuration for transient failures
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (default: 3)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial delay before first retry (default: 250 ms)
    #[serde(default = "default_initial_delay", with = "millis_serde")]
    pub initial_delay: Duration,

    /// Maximum delay between retries (default: 5 seconds)
    #[serde(default = "default_max_delay", with = "millis_serde")]
    pub max_delay: Duration,

    /// Multiplier for exponential backoff (default: 2.0)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Add random jitter to delays (default: true)
    #[serde(default = "default_true")]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: true,
        }
    }
}

/// Main configuration for [`crate::Relay`]
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    /// File broker settings
    #[serde(default)]
    pub broker: BrokerConfig,

    /// Worker transfer settings
    #[serde(default)]
    pub worker: WorkerConfig,

    /// Job dispatch settings
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Progress stage weights
    #[serde(default)]
    pub progress: ProgressConfig,
}

impl Config {
    /// Parse a JSON configuration document; missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Config = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Check invariants that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        self.broker.validate()?;
        if self.worker.chunk_concurrency == 0 {
            return Err(config_error(
                "chunk concurrency must be non-zero",
                "worker.chunk_concurrency",
            ));
        }
        if self.worker.completion_poll_interval.is_zero() {
            return Err(config_error(
                "completion poll interval must be non-zero",
                "worker.completion_poll_interval",
            ));
        }
        if self.scheduler.max_concurrent_targets == 0 {
            return Err(config_error(
                "max concurrent targets must be non-zero",
                "scheduler.max_concurrent_targets",
            ));
        }
        let total: u32 = Stage::ALL.iter().map(|s| self.progress.weight(*s)).sum();
        if total != 100 {
            return Err(config_error(
                &format!("stage weights must sum to 100, got {total}"),
                "progress",
            ));
        }
        Ok(())
    }
}

fn config_error(message: &str, key: &str) -> Error {
    Error::Config {
        message: message.to_string(),
        key: Some(key.to_string()),
    }
}

fn default_true() -> bool {
    true
}

fn default_direct_threshold() -> u64 {
    5 * 1024 * 1024
}

fn default_chunk_size() -> u64 {
    1024 * 1024
}

fn default_session_ttl() -> Duration {
    Duration::from_secs(120)
}

fn default_reap_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_max_sessions() -> usize {
    64
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_notify_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_completion_wait() -> Duration {
    Duration::from_secs(120)
}

fn default_completion_poll() -> Duration {
    Duration::from_millis(500)
}

fn default_chunk_concurrency() -> usize {
    3
}

fn default_max_concurrent_targets() -> usize {
    8
}

fn default_inter_target_delay() -> Duration {
    Duration::from_secs(2)
}

fn default_target_timeout() -> Duration {
    Duration::from_secs(300)
}

fn default_acquisition_weight() -> u32 {
    40
}

fn default_assembly_weight() -> u32 {
    30
}

fn default_injection_weight() -> u32 {
    30
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay() -> Duration {
    Duration::from_millis(250)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(5)
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

// Duration serialization helper (whole seconds)
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

// Duration serialization helper (milliseconds)
mod millis_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
