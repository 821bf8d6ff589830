//! File broker: the single authority over attachment bytes and session state.
//!
//! - [`FileBroker`] - the state machine (stored files, session registry,
//!   active-target registry). Every operation runs to completion on `&mut self`.
//! - [`session`] - [`DownloadSession`] and the chunk partition
//! - [`reactor`] - the task that owns a `FileBroker` and serves the message channel

mod reactor;
pub mod session;


pub use reactor::{BrokerHandle, BrokerStats, spawn_broker};
pub(crate) use reactor::Control;
pub use session::{DownloadSession, partition_chunks};

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use sha2::{Digest, Sha256};
use tokio::sync::broadcast;
use tokio::time::Instant;

use crate::channel::{RoutingDecision, SessionDescriptor};
use crate::config::BrokerConfig;
use crate::error::{Error, Result};
use crate::types::{Event, FileDescriptor, FileId, FileMetadata, SessionId, TargetId};

const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

/// Bytes and metadata of one ingested file
struct StoredFile {
    descriptor: FileDescriptor,
    data: Arc<[u8]>,
    /// Release requested while sessions still referenced the file
    release_pending: bool,
}

/// A target taking part in a running job
struct ActiveTarget {
    id: TargetId,
    /// Files its job carries that it has neither routed nor been drafted for
    pending: HashSet<FileId>,
}

/// Broker state machine
pub struct FileBroker {
    config: BrokerConfig,
    files: HashMap<FileId, StoredFile>,
    sessions: HashMap<SessionId, DownloadSession>,
    /// Ended complete sessions -> original expiry; completion queries still answer true
    finished: HashMap<SessionId, Instant>,
    /// Active targets in registration order
    active_targets: Vec<ActiveTarget>,
    next_file_id: u64,
    next_session_id: u64,
    event_tx: broadcast::Sender<Event>,
}

impl FileBroker {
    /// Create an empty broker. Fails on a config the broker cannot run with.
    pub fn new(config: BrokerConfig, event_tx: broadcast::Sender<Event>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            files: HashMap::new(),
            sessions: HashMap::new(),
            finished: HashMap::new(),
            active_targets: Vec::new(),
            next_file_id: 1,
            next_session_id: 1,
            event_tx,
        })
    }

    /// Take ownership of raw attachment bytes and describe them.
    pub fn ingest(&mut self, data: Vec<u8>, metadata: FileMetadata) -> Result<FileDescriptor> {
        let size_bytes = data.len() as u64;
        let total_chunks = u32::try_from(size_bytes.div_ceil(self.config.chunk_size)).map_err(|_| {
            Error::Config {
                message: format!(
                    "file of {size_bytes} bytes needs more than {} chunks of {} bytes",
                    u32::MAX,
                    self.config.chunk_size
                ),
                key: Some("broker.chunk_size".to_string()),
            }
        })?;

        let file_id = FileId(self.next_file_id);
        self.next_file_id += 1;

        let descriptor = FileDescriptor {
            file_id,
            name: metadata.name,
            mime_type: metadata
                .mime_type
                .unwrap_or_else(|| DEFAULT_MIME_TYPE.to_string()),
            size_bytes,
            chunk_size: self.config.chunk_size,
            total_chunks,
            last_modified: metadata.last_modified.unwrap_or_else(Utc::now),
            sha256: format!("{:x}", Sha256::digest(&data)),
        };

        tracing::info!(
            file_id = %file_id,
            name = %descriptor.name,
            size_bytes,
            total_chunks,
            "Ingested file"
        );

        self.files.insert(
            file_id,
            StoredFile {
                descriptor: descriptor.clone(),
                data: data.into(),
                release_pending: false,
            },
        );
        Ok(descriptor)
    }

    /// Decide how `file_id` reaches `requesting`, given the targets eligible to share it.
    ///
    /// Small files ship inline. Larger files are distributed when at least two
    /// targets are active; otherwise, or when no session can be opened, the
    /// requester gets the single-consumer chunked fallback.
    pub fn route_request(
        &mut self,
        file_id: FileId,
        requesting: &TargetId,
        active_targets: &[TargetId],
    ) -> Result<RoutingDecision> {
        let stored = self.files.get(&file_id).ok_or(Error::UnknownFile(file_id))?;
        if !active_targets.contains(requesting) {
            return Err(Error::UnknownTarget(requesting.clone()));
        }
        let descriptor = stored.descriptor.clone();

        if descriptor.size_bytes < self.config.direct_threshold_bytes {
            return Ok(RoutingDecision::Direct {
                data: stored.data.to_vec(),
                descriptor,
            });
        }

        if let Some(session) = self.joinable_session(file_id, requesting) {
            let assigned = session.assigned_to(requesting).unwrap_or_default().to_vec();
            tracing::debug!(
                file_id = %file_id,
                session_id = %session.session_id,
                target = %requesting,
                assigned = assigned.len(),
                "Joined existing session"
            );
            return Ok(RoutingDecision::Distributed {
                session_id: session.session_id,
                descriptor,
                assigned,
            });
        }

        if active_targets.len() < 2 {
            tracing::debug!(
                file_id = %file_id,
                target = %requesting,
                "{}, routing chunked",
                Error::InsufficientParticipants {
                    active: active_targets.len()
                }
            );
            return Ok(RoutingDecision::Chunked { descriptor });
        }

        match self.start_distributed_session(file_id, active_targets) {
            Ok(session) => {
                let assigned = session
                    .chunk_assignment
                    .get(requesting)
                    .cloned()
                    .unwrap_or_default();
                Ok(RoutingDecision::Distributed {
                    session_id: session.session_id,
                    descriptor,
                    assigned,
                })
            }
            Err(e) => {
                tracing::warn!(
                    file_id = %file_id,
                    target = %requesting,
                    error = %e,
                    "Could not open distributed session, routing chunked"
                );
                Ok(RoutingDecision::Chunked { descriptor })
            }
        }
    }

    /// Route `requesting` against the active targets that still need `file_id`.
    ///
    /// A target counts as a candidate while its job carries the file and it
    /// has not yet routed it or been placed in a session for it. Routing
    /// settles the requester for that file either way.
    pub fn route_active(
        &mut self,
        file_id: FileId,
        requesting: &TargetId,
    ) -> Result<RoutingDecision> {
        if !self.active_targets.iter().any(|t| &t.id == requesting) {
            return Err(Error::UnknownTarget(requesting.clone()));
        }
        let candidates = self.candidates(file_id, requesting);
        let decision = self.route_request(file_id, requesting, &candidates)?;
        self.settle(file_id, std::slice::from_ref(requesting));
        Ok(decision)
    }

    fn candidates(&self, file_id: FileId, requesting: &TargetId) -> Vec<TargetId> {
        self.active_targets
            .iter()
            .filter(|t| &t.id == requesting || t.pending.contains(&file_id))
            .map(|t| t.id.clone())
            .collect()
    }

    /// Drop `file_id` from the pending set of each of `targets`
    fn settle(&mut self, file_id: FileId, targets: &[TargetId]) {
        for active in self
            .active_targets
            .iter_mut()
            .filter(|t| targets.contains(&t.id))
        {
            active.pending.remove(&file_id);
        }
    }

    fn joinable_session(&self, file_id: FileId, target: &TargetId) -> Option<&DownloadSession> {
        self.sessions.values().find(|s| {
            s.file_id == file_id && !s.reassembly_started && s.chunk_assignment.contains_key(target)
        })
    }

    /// Open a session that partitions the file's chunks across `participants`.
    pub fn start_distributed_session(
        &mut self,
        file_id: FileId,
        participants: &[TargetId],
    ) -> Result<SessionDescriptor> {
        let descriptor = self
            .files
            .get(&file_id)
            .map(|f| f.descriptor.clone())
            .ok_or(Error::UnknownFile(file_id))?;

        if participants.len() < 2 {
            return Err(Error::InsufficientParticipants {
                active: participants.len(),
            });
        }
        if let Some(dup) = participants
            .iter()
            .enumerate()
            .find_map(|(i, t)| participants[..i].contains(t).then_some(t))
        {
            return Err(Error::DuplicateTarget(dup.clone()));
        }
        if self.sessions.len() >= self.config.max_sessions {
            return Err(Error::SessionLimitReached {
                limit: self.config.max_sessions,
            });
        }
        // A file may back several sessions only while none of them is reassembling
        if self
            .sessions
            .values()
            .any(|s| s.file_id == file_id && s.reassembly_started)
        {
            return Err(Error::Other(format!(
                "file {file_id} is already being reassembled"
            )));
        }

        let session_id = SessionId(self.next_session_id);
        self.next_session_id += 1;
        let now = Instant::now();
        let session = DownloadSession::new(
            session_id,
            file_id,
            participants.to_vec(),
            descriptor.total_chunks,
            now,
            now + self.config.session_ttl,
        );

        tracing::info!(
            session_id = %session_id,
            file_id = %file_id,
            participants = participants.len(),
            total_chunks = descriptor.total_chunks,
            "Opened distributed session"
        );
        self.event_tx
            .send(Event::SessionCreated {
                session_id,
                file_id,
                participants: participants.to_vec(),
            })
            .ok();

        let result = SessionDescriptor {
            session_id,
            chunk_assignment: session
                .chunk_assignment
                .iter()
                .map(|(t, c)| (t.clone(), c.clone()))
                .collect(),
            total_chunks: descriptor.total_chunks,
            descriptor,
        };
        self.sessions.insert(session_id, session);
        self.settle(file_id, participants);
        Ok(result)
    }

    /// Metadata of a stored file
    pub fn get_metadata(&self, file_id: FileId) -> Result<FileDescriptor> {
        self.files
            .get(&file_id)
            .map(|f| f.descriptor.clone())
            .ok_or(Error::UnknownFile(file_id))
    }

    /// Bytes of chunk `index`
    pub fn get_chunk(&self, file_id: FileId, index: u32) -> Result<Vec<u8>> {
        let stored = self.files.get(&file_id).ok_or(Error::UnknownFile(file_id))?;
        let (start, end) = stored
            .descriptor
            .chunk_range(index)
            .ok_or(Error::ChunkOutOfRange {
                file_id,
                index,
                total_chunks: stored.descriptor.total_chunks,
            })?;
        Ok(stored.data[start as usize..end as usize].to_vec())
    }

    /// Record that `target` holds chunk `index`. Idempotent apart from refreshing the expiry.
    pub fn report_chunk_complete(
        &mut self,
        session_id: SessionId,
        index: u32,
        target: &TargetId,
    ) -> Result<()> {
        let Some(session) = self.sessions.get_mut(&session_id) else {
            if self.finished.contains_key(&session_id) {
                return Ok(());
            }
            return Err(Error::UnknownSession(session_id));
        };

        let completed_now = session.record_chunk(index, target)?;
        session.expires_at = Instant::now() + self.config.session_ttl;
        tracing::debug!(
            session_id = %session_id,
            index,
            target = %target,
            completed = session.completed_chunks.len(),
            total = session.total_chunks,
            "Chunk reported"
        );

        if completed_now {
            tracing::info!(session_id = %session_id, "Distributed session complete");
            self.event_tx
                .send(Event::SessionCompleted { session_id })
                .ok();
        }
        Ok(())
    }

    /// True exactly when every chunk of the session has been reported.
    ///
    /// A session that was ended after completing still answers true until its
    /// expiry; an unknown or reclaimed session is [`Error::SessionExpired`].
    pub fn query_completion(&mut self, session_id: SessionId) -> Result<bool> {
        if let Some(session) = self.sessions.get_mut(&session_id) {
            let complete = session.is_complete();
            if complete && !session.reassembly_started {
                session.reassembly_started = true;
            }
            return Ok(complete);
        }
        if self.finished.contains_key(&session_id) {
            return Ok(true);
        }
        Err(Error::SessionExpired(session_id))
    }

    /// Remove a session from the registry. Ending an absent session is a no-op.
    pub fn end_session(&mut self, session_id: SessionId) {
        let Some(session) = self.sessions.remove(&session_id) else {
            return;
        };
        if session.is_complete() {
            self.finished.insert(session_id, session.expires_at);
        }
        tracing::info!(
            session_id = %session_id,
            file_id = %session.file_id,
            complete = session.is_complete(),
            "Session ended"
        );
        self.event_tx.send(Event::SessionEnded { session_id }).ok();
        self.drop_released_file(session.file_id);
    }

    /// Reclaim sessions and tombstones whose expiry is at or before `now`.
    pub fn reap_expired(&mut self, now: Instant) -> Vec<SessionId> {
        let expired: Vec<SessionId> = self
            .sessions
            .values()
            .filter(|s| s.expires_at <= now)
            .map(|s| s.session_id)
            .collect();

        for session_id in &expired {
            if let Some(session) = self.sessions.remove(session_id) {
                let completed_chunks = session.completed_chunks.len() as u32;
                tracing::warn!(
                    session_id = %session_id,
                    file_id = %session.file_id,
                    completed_chunks,
                    total_chunks = session.total_chunks,
                    "Session expired"
                );
                self.event_tx
                    .send(Event::SessionExpired {
                        session_id: *session_id,
                        completed_chunks,
                        total_chunks: session.total_chunks,
                    })
                    .ok();
                self.drop_released_file(session.file_id);
            }
        }

        self.finished.retain(|_, expires_at| *expires_at > now);
        expired
    }

    /// Drop a file's bytes now, or once the last session referencing it closes.
    pub fn release(&mut self, file_id: FileId) {
        let Some(stored) = self.files.get_mut(&file_id) else {
            return;
        };
        stored.release_pending = true;
        self.drop_released_file(file_id);
    }

    fn drop_released_file(&mut self, file_id: FileId) {
        let pending = self
            .files
            .get(&file_id)
            .is_some_and(|f| f.release_pending);
        let referenced = self.sessions.values().any(|s| s.file_id == file_id);
        if pending && !referenced {
            self.files.remove(&file_id);
            tracing::debug!(file_id = %file_id, "Released file");
        }
    }

    /// Mark a target active for the attachments in `files`.
    ///
    /// Re-activating keeps its original position and adds the new files.
    pub fn activate_target(&mut self, target: TargetId, files: impl IntoIterator<Item = FileId>) {
        match self.active_targets.iter_mut().find(|t| t.id == target) {
            Some(active) => active.pending.extend(files),
            None => {
                let pending: HashSet<FileId> = files.into_iter().collect();
                tracing::debug!(target = %target, files = pending.len(), "Target active");
                self.active_targets.push(ActiveTarget {
                    id: target,
                    pending,
                });
            }
        }
    }

    /// Mark a target inactive
    pub fn deactivate_target(&mut self, target: &TargetId) {
        self.active_targets.retain(|t| &t.id != target);
    }

    /// Active targets in registration order
    pub fn active_targets(&self) -> Vec<TargetId> {
        self.active_targets.iter().map(|t| t.id.clone()).collect()
    }

    /// Session by id, if still registered
    pub fn session(&self, session_id: SessionId) -> Option<&DownloadSession> {
        self.sessions.get(&session_id)
    }

    /// Counts for diagnostics
    pub fn stats(&self) -> BrokerStats {
        BrokerStats {
            files: self.files.len(),
            sessions: self.sessions.len(),
            active_targets: self.active_targets(),
        }
    }
}
