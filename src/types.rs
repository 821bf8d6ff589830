//! Core types for fanout-relay

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{Error, Result};

macro_rules! numeric_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl $name {
            /// Get the inner u64 value
            pub fn get(&self) -> u64 {
                self.0
            }
        }

        impl From<u64> for $name {
            fn from(id: u64) -> Self {
                Self(id)
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

numeric_id!(
    /// Identifier of a file ingested by the broker
    FileId
);
numeric_id!(
    /// Identifier of a distributed download session
    SessionId
);
numeric_id!(
    /// Identifier of a publish job
    JobId
);

/// Identifier of a destination surface (one worker context per target)
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TargetId(pub String);

impl TargetId {
    /// Create a new TargetId
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the id as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TargetId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TargetId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Attachment metadata, created when the broker ingests raw bytes
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDescriptor {
    /// File id
    pub file_id: FileId,
    /// Original file name
    pub name: String,
    /// MIME type
    pub mime_type: String,
    /// Total size in bytes
    pub size_bytes: u64,
    /// Size of every chunk except possibly the last
    pub chunk_size: u64,
    /// Number of chunks (`ceil(size_bytes / chunk_size)`)
    pub total_chunks: u32,
    /// Last-modified timestamp supplied at ingest
    pub last_modified: DateTime<Utc>,
    /// Lowercase hex SHA-256 of the full content
    pub sha256: String,
}

impl FileDescriptor {
    /// Byte range `[start, end)` covered by chunk `index`, or `None` if out of range.
    pub fn chunk_range(&self, index: u32) -> Option<(u64, u64)> {
        if index >= self.total_chunks {
            return None;
        }
        let start = u64::from(index) * self.chunk_size;
        let end = (start + self.chunk_size).min(self.size_bytes);
        Some((start, end))
    }
}

/// Caller-supplied metadata for [`crate::broker::FileBroker::ingest`]
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileMetadata {
    /// File name
    pub name: String,
    /// MIME type (default: application/octet-stream)
    #[serde(default)]
    pub mime_type: Option<String>,
    /// Last-modified time (default: ingest time)
    #[serde(default)]
    pub last_modified: Option<DateTime<Utc>>,
}

/// Reference to an ingested attachment inside a payload
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRef {
    /// File id returned by ingest
    pub file_id: FileId,
    /// Display name
    pub name: String,
}

impl From<&FileDescriptor> for FileRef {
    fn from(d: &FileDescriptor) -> Self {
        Self {
            file_id: d.file_id,
            name: d.name.clone(),
        }
    }
}

/// Content to publish; immutable once attached to a job
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentPayload {
    /// Title
    pub title: String,
    /// Body
    pub body: String,
    /// Attachments
    #[serde(default)]
    pub files: Vec<FileRef>,
}

impl ContentPayload {
    /// Ids of the attachments, in payload order
    pub fn file_ids(&self) -> Vec<FileId> {
        self.files.iter().map(|f| f.file_id).collect()
    }
}

/// One destination in a publish job
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetRef {
    /// Destination id (must have a registered automation)
    pub id: TargetId,
    /// Optional display label
    #[serde(default)]
    pub label: Option<String>,
}

impl TargetRef {
    /// Target reference without a label
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: TargetId::new(id),
            label: None,
        }
    }
}

/// How the scheduler launches targets
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchMode {
    /// One target at a time, in input order, with an inter-target delay
    Sequential,
    /// All targets at once, bounded by the concurrency limit
    #[default]
    Concurrent,
}

/// Terminal status of a target within a job
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetStatus {
    /// Automation reported success
    Succeeded,
    /// Automation (or attachment resolution) failed
    Failed,
    /// Invocation exceeded its timeout
    TimedOut,
    /// Skipped because an earlier target failed with stop-on-error set
    NotAttempted,
}

/// Outcome for one target; written exactly once per target per job
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TargetResult {
    /// Target id
    pub target_id: TargetId,
    /// True only for [`TargetStatus::Succeeded`]
    pub success: bool,
    /// Terminal status
    pub status: TargetStatus,
    /// Error message for non-successful outcomes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Wall time spent on this target
    pub duration_ms: u64,
    /// Opaque data returned by the automation (e.g. a post URL)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_payload: Option<serde_json::Value>,
}

impl TargetResult {
    /// Successful outcome
    pub fn succeeded(
        target_id: TargetId,
        duration_ms: u64,
        result_payload: Option<serde_json::Value>,
    ) -> Self {
        Self {
            target_id,
            success: true,
            status: TargetStatus::Succeeded,
            error: None,
            duration_ms,
            result_payload,
        }
    }

    /// Failed outcome with a status other than `Succeeded`
    pub fn failed(
        target_id: TargetId,
        status: TargetStatus,
        error: impl Into<String>,
        duration_ms: u64,
    ) -> Self {
        Self {
            target_id,
            success: false,
            status,
            error: Some(error.into()),
            duration_ms,
            result_payload: None,
        }
    }

    /// Placeholder for a target skipped by stop-on-error
    pub fn not_attempted(target_id: TargetId) -> Self {
        Self::failed(target_id, TargetStatus::NotAttempted, "not attempted", 0)
    }
}

/// Aggregated outcome of a publish job
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobSummary {
    /// Job id
    pub job_id: JobId,
    /// Results in target input order
    pub per_target: Vec<TargetResult>,
    /// Number of succeeded targets
    pub success_count: usize,
    /// Number of failed or timed-out targets
    pub failure_count: usize,
    /// Number of targets skipped by stop-on-error
    pub not_attempted_count: usize,
    /// Total job wall time
    pub duration_ms: u64,
}

/// One multi-target publish request and its per-target results
#[derive(Clone, Debug)]
pub struct PublishJob {
    /// Job id
    pub job_id: JobId,
    /// Targets in input order
    pub targets: Vec<TargetRef>,
    /// Content shared by every target
    pub payload: Arc<ContentPayload>,
    /// Dispatch mode
    pub mode: DispatchMode,
    /// Skip remaining targets after a failure (sequential mode only)
    pub stop_on_error: bool,
    results: HashMap<TargetId, TargetResult>,
}

impl PublishJob {
    /// Create a job with an empty result map
    pub fn new(
        job_id: JobId,
        targets: Vec<TargetRef>,
        payload: ContentPayload,
        mode: DispatchMode,
        stop_on_error: bool,
    ) -> Self {
        Self {
            job_id,
            targets,
            payload: Arc::new(payload),
            mode,
            stop_on_error,
            results: HashMap::new(),
        }
    }

    /// Record a target's result. A result is immutable once set.
    pub fn record(&mut self, result: TargetResult) -> Result<()> {
        if self.results.contains_key(&result.target_id) {
            return Err(Error::ResultAlreadyRecorded(result.target_id));
        }
        self.results.insert(result.target_id.clone(), result);
        Ok(())
    }

    /// Result recorded for a target, if any
    pub fn result(&self, target: &TargetId) -> Option<&TargetResult> {
        self.results.get(target)
    }

    /// True once every target has a result
    pub fn is_terminal(&self) -> bool {
        self.targets
            .iter()
            .all(|t| self.results.contains_key(&t.id))
    }

    /// Build the summary in target input order
    pub fn summary(&self, duration_ms: u64) -> JobSummary {
        let per_target: Vec<TargetResult> = self
            .targets
            .iter()
            .filter_map(|t| self.results.get(&t.id).cloned())
            .collect();
        let count = |status: TargetStatus| per_target.iter().filter(|r| r.status == status).count();

        JobSummary {
            job_id: self.job_id,
            success_count: count(TargetStatus::Succeeded),
            failure_count: count(TargetStatus::Failed) + count(TargetStatus::TimedOut),
            not_attempted_count: count(TargetStatus::NotAttempted),
            per_target,
            duration_ms,
        }
    }
}

/// Weighted progress stage of a worker
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    /// Downloading bytes from the broker
    Acquisition,
    /// Waiting for and merging chunks
    Assembly,
    /// Handing the finished file to the destination automation
    Injection,
}

impl Stage {
    /// All stages in execution order
    pub const ALL: [Stage; 3] = [Stage::Acquisition, Stage::Assembly, Stage::Injection];

    /// Wire name of the stage
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Acquisition => "acquisition",
            Stage::Assembly => "assembly",
            Stage::Injection => "injection",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Stage {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "acquisition" => Ok(Stage::Acquisition),
            "assembly" => Ok(Stage::Assembly),
            "injection" => Ok(Stage::Injection),
            other => Err(Error::InvalidStage(other.to_string())),
        }
    }
}

/// One target's latest progress
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProgressRecord {
    /// Target id
    pub target_id: TargetId,
    /// Current stage
    pub stage: Stage,
    /// Free-form sub-stage label (e.g. "chunk 3/9")
    pub sub_stage: String,
    /// Stage completion (0.0 to 100.0)
    pub stage_percent: f32,
    /// Weighted overall completion (0.0 to 100.0)
    pub overall_percent: f32,
    /// Human-readable message
    pub message: String,
    /// Time of the update
    pub updated_at: DateTime<Utc>,
}

/// Transfer mode chosen by the broker for a file
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferMode {
    /// Inline bytes in the routing response
    Direct,
    /// Cooperative download across active targets
    Distributed,
    /// Single consumer fetches every chunk itself
    Chunked,
}

/// A file materialised inside a worker
#[derive(Clone, Debug)]
pub struct LocalFile {
    /// Broker metadata
    pub descriptor: FileDescriptor,
    /// Full content
    pub data: Arc<[u8]>,
    /// How the bytes were obtained
    pub mode: TransferMode,
}

impl LocalFile {
    /// Content length
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// True for zero-length files
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Content payload whose attachments have been resolved to local bytes
#[derive(Clone, Debug)]
pub struct ResolvedPayload {
    /// Title
    pub title: String,
    /// Body
    pub body: String,
    /// Attachments in payload order
    pub files: Vec<LocalFile>,
}

/// Event emitted on the relay's broadcast bus
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// A target's consolidated progress changed
    Progress {
        /// Latest record
        record: ProgressRecord,
    },

    /// Broker opened a distributed session
    SessionCreated {
        /// Session id
        session_id: SessionId,
        /// File being distributed
        file_id: FileId,
        /// Participants in assignment order
        participants: Vec<TargetId>,
    },

    /// Every chunk of a session has been reported
    SessionCompleted {
        /// Session id
        session_id: SessionId,
    },

    /// Session removed after an explicit end
    SessionEnded {
        /// Session id
        session_id: SessionId,
    },

    /// Session reclaimed after its expiry elapsed
    SessionExpired {
        /// Session id
        session_id: SessionId,
        /// Completed chunk count at expiry
        completed_chunks: u32,
        /// Total chunk count
        total_chunks: u32,
    },

    /// Job accepted and dispatch started
    JobStarted {
        /// Job id
        job_id: JobId,
        /// Number of targets
        targets: usize,
        /// Dispatch mode
        mode: DispatchMode,
    },

    /// Target automation launched
    TargetStarted {
        /// Job id
        job_id: JobId,
        /// Target id
        target_id: TargetId,
    },

    /// Target reached a terminal result
    TargetFinished {
        /// Job id
        job_id: JobId,
        /// Result
        result: TargetResult,
    },

    /// Every target has a result
    JobFinished {
        /// Summary
        summary: JobSummary,
    },

    /// Relay shut down; no further events follow
    Shutdown,
}
