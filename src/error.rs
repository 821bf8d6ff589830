//! Error types for fanout-relay
//!
//! A single error enum covers transport, session, transfer and job-level
//! failures. Every payload is owned string or integer data so the type is
//! `Clone`: one in-flight fetch can hand the same outcome to every caller
//! attached to it.

use thiserror::Error;

use crate::types::{FileId, SessionId, TargetId};

/// Result type alias for fanout-relay operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for fanout-relay
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Error {
    /// No response arrived within the channel bound
    #[error("channel timeout: no response to {action} within {timeout_ms}ms")]
    ChannelTimeout {
        /// Action that was awaiting a response
        action: String,
        /// Bound that elapsed
        timeout_ms: u64,
    },

    /// The other end of the channel is gone (broker stopped or never started)
    #[error("no responder for {action}")]
    NoResponder {
        /// Action that could not be delivered
        action: String,
    },

    /// Routing or a session report referenced a target that is not active
    #[error("unknown target: {0}")]
    UnknownTarget(TargetId),

    /// Fewer than two active targets; callers fall back to chunked transfer
    #[error("insufficient participants: {active} active target(s), need at least 2")]
    InsufficientParticipants {
        /// Number of active targets observed
        active: usize,
    },

    /// Fetching a chunk failed (retryable)
    #[error("failed to fetch chunk {index} of file {file_id}: {reason}")]
    ChunkFetchFailure {
        /// File the chunk belongs to
        file_id: FileId,
        /// Chunk index
        index: u32,
        /// Underlying reason
        reason: String,
    },

    /// Reassembled size does not match the declared size
    #[error("assembly mismatch for file {file_id}: expected {expected} bytes, got {actual}")]
    AssemblyMismatch {
        /// File being assembled
        file_id: FileId,
        /// Declared size
        expected: u64,
        /// Reassembled size
        actual: u64,
    },

    /// Reassembled digest does not match the digest recorded at ingest
    #[error("checksum mismatch for file {file_id}")]
    ChecksumMismatch {
        /// File being assembled
        file_id: FileId,
    },

    /// Session was reclaimed (or never existed) before completion
    #[error("session {0} expired")]
    SessionExpired(SessionId),

    /// The external destination automation reported a failure
    #[error("publish to {target} failed: {reason}")]
    TargetPublishFailure {
        /// Destination that failed
        target: TargetId,
        /// Opaque reason surfaced by the automation
        reason: String,
    },

    /// No stored file with this id
    #[error("unknown file: {0}")]
    UnknownFile(FileId),

    /// Session id is not in the registry
    #[error("unknown session: {0}")]
    UnknownSession(SessionId),

    /// Chunk index is outside `[0, total_chunks)`
    #[error("chunk {index} out of range for file {file_id} ({total_chunks} chunks)")]
    ChunkOutOfRange {
        /// File the chunk was requested from
        file_id: FileId,
        /// Requested index
        index: u32,
        /// Number of chunks in the file
        total_chunks: u32,
    },

    /// A fetch for this file is already running in this worker
    #[error("fetch already in flight for file {0}")]
    FetchInFlight(FileId),

    /// Progress update named a stage that does not exist
    #[error("invalid stage: {0}")]
    InvalidStage(String),

    /// Wire command carried an action that is not part of the protocol
    #[error("unknown action: {0}")]
    UnknownAction(String),

    /// Job referenced a destination with no registered automation
    #[error("unknown destination: {0}")]
    UnknownDestination(TargetId),

    /// Job listed the same destination twice
    #[error("duplicate target in job: {0}")]
    DuplicateTarget(TargetId),

    /// A target already has a result for this job
    #[error("result already recorded for target {0}")]
    ResultAlreadyRecorded(TargetId),

    /// Broker answered with a response that does not fit the request
    #[error("unexpected response to {action}: {response}")]
    UnexpectedResponse {
        /// Action that was sent
        action: String,
        /// Response kind received
        response: String,
    },

    /// Broker refused to open another session
    #[error("session limit of {limit} reached")]
    SessionLimitReached {
        /// Configured maximum
        limit: usize,
    },

    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "broker.chunk_size")
        key: Option<String>,
    },

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Relay is shutting down
    #[error("shutdown in progress")]
    ShuttingDown,

    /// Other error
    #[error("{0}")]
    Other(String),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl Error {
    /// True for transport and session failures that the worker answers with
    /// the single-consumer fallback instead of surfacing immediately.
    pub fn triggers_fallback(&self) -> bool {
        matches!(
            self,
            Error::ChannelTimeout { .. }
                | Error::NoResponder { .. }
                | Error::UnknownTarget(_)
                | Error::InsufficientParticipants { .. }
                | Error::ChunkFetchFailure { .. }
                | Error::AssemblyMismatch { .. }
                | Error::ChecksumMismatch { .. }
                | Error::SessionExpired(_)
                | Error::UnknownSession(_)
                | Error::SessionLimitReached { .. }
                | Error::UnexpectedResponse { .. }
        )
    }
}
