//! Broker protocol commands and responses.
//!
//! One variant per action in the broker/worker RPC surface. On the wire a
//! command is a JSON object tagged by `action`; an action name outside the
//! protocol decodes to [`Error::UnknownAction`] instead of being ignored.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{Error, Result};
use crate::types::{FileDescriptor, FileId, SessionId, TargetId};

/// Wire names of every protocol action
pub const ACTIONS: [&str; 8] = [
    "getRoutingInfo",
    "startDistributedSession",
    "getMetadata",
    "getChunk",
    "reportChunkComplete",
    "queryCompletion",
    "endSession",
    "progressNotify",
];

/// Command sent from a worker context to the broker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum BrokerRequest {
    /// Ask how `file_id` should be transferred to `target`
    #[serde(rename_all = "camelCase")]
    GetRoutingInfo {
        /// File to route
        file_id: FileId,
        /// Requesting target
        target: TargetId,
    },

    /// Open a session over an explicit participant list
    #[serde(rename_all = "camelCase")]
    StartDistributedSession {
        /// File to distribute
        file_id: FileId,
        /// Participants in assignment order
        participants: Vec<TargetId>,
    },

    /// Fetch the descriptor of a stored file
    #[serde(rename_all = "camelCase")]
    GetMetadata {
        /// File id
        file_id: FileId,
    },

    /// Fetch one chunk's bytes
    #[serde(rename_all = "camelCase")]
    GetChunk {
        /// File id
        file_id: FileId,
        /// Chunk index
        index: u32,
    },

    /// Fire-and-forget: `target` holds chunk `index` of the session
    #[serde(rename_all = "camelCase")]
    ReportChunkComplete {
        /// Session id
        session_id: SessionId,
        /// Chunk index
        index: u32,
        /// Reporting target
        target: TargetId,
    },

    /// Ask whether every chunk of the session has been reported
    #[serde(rename_all = "camelCase")]
    QueryCompletion {
        /// Session id
        session_id: SessionId,
    },

    /// Fire-and-forget: the caller is done with the session
    #[serde(rename_all = "camelCase")]
    EndSession {
        /// Session id
        session_id: SessionId,
    },

    /// Fire-and-forget: per-stage progress from a worker
    #[serde(rename_all = "camelCase")]
    ProgressNotify {
        /// Reporting target
        target: TargetId,
        /// Stage wire name
        stage: String,
        /// Free-form sub-stage
        #[serde(default)]
        sub_stage: String,
        /// Stage completion, clamped to 0..=100 by the aggregator
        percent: f32,
        /// Human-readable message
        #[serde(default)]
        message: String,
    },
}

impl BrokerRequest {
    /// Wire name of the action
    pub fn action(&self) -> &'static str {
        match self {
            BrokerRequest::GetRoutingInfo { .. } => "getRoutingInfo",
            BrokerRequest::StartDistributedSession { .. } => "startDistributedSession",
            BrokerRequest::GetMetadata { .. } => "getMetadata",
            BrokerRequest::GetChunk { .. } => "getChunk",
            BrokerRequest::ReportChunkComplete { .. } => "reportChunkComplete",
            BrokerRequest::QueryCompletion { .. } => "queryCompletion",
            BrokerRequest::EndSession { .. } => "endSession",
            BrokerRequest::ProgressNotify { .. } => "progressNotify",
        }
    }

    /// True for fire-and-forget actions that never get a response
    pub fn is_notification(&self) -> bool {
        matches!(
            self,
            BrokerRequest::ReportChunkComplete { .. }
                | BrokerRequest::EndSession { .. }
                | BrokerRequest::ProgressNotify { .. }
        )
    }

    /// Decode a JSON command
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_slice(bytes)?;
        let action = value
            .get("action")
            .and_then(|a| a.as_str())
            .ok_or_else(|| Error::Serialization("missing \"action\" field".to_string()))?;
        if !ACTIONS.contains(&action) {
            tracing::warn!(action, "Rejected command with unknown action");
            return Err(Error::UnknownAction(action.to_string()));
        }
        Ok(serde_json::from_value(value)?)
    }

    /// Encode as a JSON command
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// Broker's transfer decision for one file and requester
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum RoutingDecision {
    /// File is small enough to ship inline
    Direct {
        /// File metadata
        descriptor: FileDescriptor,
        /// Full content
        data: Vec<u8>,
    },

    /// Requester participates in a cooperative download
    #[serde(rename_all = "camelCase")]
    Distributed {
        /// File metadata
        descriptor: FileDescriptor,
        /// Session to report into
        session_id: SessionId,
        /// Chunk indices assigned to the requester
        assigned: Vec<u32>,
    },

    /// Requester fetches every chunk itself
    Chunked {
        /// File metadata
        descriptor: FileDescriptor,
    },
}

impl RoutingDecision {
    /// Metadata of the routed file
    pub fn descriptor(&self) -> &FileDescriptor {
        match self {
            RoutingDecision::Direct { descriptor, .. }
            | RoutingDecision::Distributed { descriptor, .. }
            | RoutingDecision::Chunked { descriptor } => descriptor,
        }
    }
}

/// Description of a newly opened session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionDescriptor {
    /// Session id
    pub session_id: SessionId,
    /// Indices per participant
    pub chunk_assignment: BTreeMap<TargetId, Vec<u32>>,
    /// Number of chunks in the file
    pub total_chunks: u32,
    /// File metadata
    pub descriptor: FileDescriptor,
}

/// Broker reply to a [`BrokerRequest`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum BrokerResponse {
    /// Reply to `getRoutingInfo`
    Routing {
        /// Decision
        decision: RoutingDecision,
    },
    /// Reply to `startDistributedSession`
    SessionStarted {
        /// New session
        session: SessionDescriptor,
    },
    /// Reply to `getMetadata`
    Metadata {
        /// File metadata
        descriptor: FileDescriptor,
    },
    /// Reply to `getChunk`
    Chunk {
        /// Chunk index
        index: u32,
        /// Chunk bytes
        data: Vec<u8>,
    },
    /// Reply to `queryCompletion`
    Completion {
        /// True once every chunk has been reported
        complete: bool,
    },
    /// Acknowledgement for notifications delivered as requests
    Ack,
}

impl BrokerResponse {
    /// Short name of the response kind, for diagnostics
    pub fn kind(&self) -> &'static str {
        match self {
            BrokerResponse::Routing { .. } => "routing",
            BrokerResponse::SessionStarted { .. } => "sessionStarted",
            BrokerResponse::Metadata { .. } => "metadata",
            BrokerResponse::Chunk { .. } => "chunk",
            BrokerResponse::Completion { .. } => "completion",
            BrokerResponse::Ack => "ack",
        }
    }

    pub(crate) fn unexpected(self, action: &str) -> Error {
        Error::UnexpectedResponse {
            action: action.to_string(),
            response: self.kind().to_string(),
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_camel_case_wire_command() {
        let request = BrokerRequest::decode(
            br#"{"action":"reportChunkComplete","sessionId":3,"index":7,"target":"blog"}"#,
        )
        .unwrap();
        assert_eq!(
            request,
            BrokerRequest::ReportChunkComplete {
                session_id: SessionId(3),
                index: 7,
                target: TargetId::new("blog"),
            }
        );
        assert!(request.is_notification());
    }

    #[test]
    fn unknown_action_is_a_typed_error() {
        let err = BrokerRequest::decode(br#"{"action":"uploadEverything","fileId":1}"#).unwrap_err();
        assert_eq!(err, Error::UnknownAction("uploadEverything".to_string()));
    }

    #[test]
    fn missing_action_is_a_serialization_error() {
        let err = BrokerRequest::decode(br#"{"fileId":1}"#).unwrap_err();
        assert!(matches!(err, Error::Serialization(_)));
    }

    #[test]
    fn known_action_with_bad_fields_is_a_serialization_error() {
        let err = BrokerRequest::decode(br#"{"action":"getChunk","fileId":"x"}"#).unwrap_err();
        assert!(matches!(err, Error::Serialization(_)));
    }

    #[test]
    fn encode_uses_action_tag() {
        let request = BrokerRequest::QueryCompletion {
            session_id: SessionId(9),
        };
        let value: serde_json::Value = serde_json::from_slice(&request.encode().unwrap()).unwrap();
        assert_eq!(value["action"], "queryCompletion");
        assert_eq!(value["sessionId"], 9);
        assert!(!request.is_notification());
    }

    #[test]
    fn every_variant_action_is_listed() {
        let samples = [
            BrokerRequest::GetRoutingInfo {
                file_id: FileId(1),
                target: "a".into(),
            },
            BrokerRequest::GetMetadata { file_id: FileId(1) },
            BrokerRequest::EndSession {
                session_id: SessionId(1),
            },
            BrokerRequest::ProgressNotify {
                target: "a".into(),
                stage: "assembly".into(),
                sub_stage: String::new(),
                percent: 10.0,
                message: String::new(),
            },
        ];
        for sample in samples {
            assert!(ACTIONS.contains(&sample.action()));
            let decoded = BrokerRequest::decode(&sample.encode().unwrap()).unwrap();
            assert_eq!(decoded.action(), sample.action());
        }
    }
}
