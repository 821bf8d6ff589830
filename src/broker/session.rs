//! Distributed download session state.

use std::collections::{BTreeMap, HashMap};

use tokio::time::Instant;

use crate::error::{Error, Result};
use crate::types::{FileId, SessionId, TargetId};

/// Split `[0, total_chunks)` into contiguous blocks, one per participant.
///
/// Block sizes differ by at most one chunk; the remainder goes to the
/// earliest participants. With more participants than chunks the trailing
/// participants get empty blocks.
pub fn partition_chunks(total_chunks: u32, participants: &[TargetId]) -> Vec<(TargetId, Vec<u32>)> {
    if participants.is_empty() {
        return Vec::new();
    }
    let count = participants.len() as u32;
    let base = total_chunks / count;
    let remainder = total_chunks % count;

    let mut next = 0u32;
    participants
        .iter()
        .enumerate()
        .map(|(i, target)| {
            let size = base + u32::from((i as u32) < remainder);
            let block = (next..next + size).collect();
            next += size;
            (target.clone(), block)
        })
        .collect()
}

/// One distributed-transfer coordination unit, owned by the broker
#[derive(Debug, Clone)]
pub struct DownloadSession {
    /// Session id
    pub session_id: SessionId,
    /// File being distributed
    pub file_id: FileId,
    /// Participants in assignment order
    pub participants: Vec<TargetId>,
    /// Chunk indices assigned to each participant
    pub chunk_assignment: HashMap<TargetId, Vec<u32>>,
    /// Completed chunk index -> first target that reported it
    pub completed_chunks: BTreeMap<u32, TargetId>,
    /// Number of chunks in the file
    pub total_chunks: u32,
    /// Creation time
    pub created_at: Instant,
    /// Reclaim deadline, refreshed by every report
    pub expires_at: Instant,
    /// Set the first time a completion query observes the session complete
    pub reassembly_started: bool,
}

impl DownloadSession {
    pub(crate) fn new(
        session_id: SessionId,
        file_id: FileId,
        participants: Vec<TargetId>,
        total_chunks: u32,
        now: Instant,
        expires_at: Instant,
    ) -> Self {
        let chunk_assignment = partition_chunks(total_chunks, &participants)
            .into_iter()
            .collect();
        Self {
            session_id,
            file_id,
            participants,
            chunk_assignment,
            completed_chunks: BTreeMap::new(),
            total_chunks,
            created_at: now,
            expires_at,
            reassembly_started: false,
        }
    }

    /// Indices assigned to `target`, if it participates
    pub fn assigned_to(&self, target: &TargetId) -> Option<&[u32]> {
        self.chunk_assignment.get(target).map(Vec::as_slice)
    }

    /// True when every chunk has been reported
    pub fn is_complete(&self) -> bool {
        self.completed_chunks.len() == self.total_chunks as usize
    }

    /// Record that `target` holds chunk `index`.
    ///
    /// Returns `true` when this report newly completed the session. A repeat
    /// report for an index keeps the original reporter; the caller refreshes
    /// the expiry either way.
    pub(crate) fn record_chunk(&mut self, index: u32, target: &TargetId) -> Result<bool> {
        if index >= self.total_chunks {
            return Err(Error::ChunkOutOfRange {
                file_id: self.file_id,
                index,
                total_chunks: self.total_chunks,
            });
        }
        if !self.chunk_assignment.contains_key(target) {
            return Err(Error::UnknownTarget(target.clone()));
        }
        let was_complete = self.is_complete();
        self.completed_chunks
            .entry(index)
            .or_insert_with(|| target.clone());
        Ok(!was_complete && self.is_complete())
    }
}
