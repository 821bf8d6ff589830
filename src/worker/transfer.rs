//! One file acquisition: routing, then direct, distributed or chunked transfer.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::{StreamExt, stream};
use sha2::{Digest, Sha256};
use tracing::Instrument;

use super::{FileSlot, notify_progress};
use crate::channel::{BrokerRequest, BrokerResponse, MessageChannel, RoutingDecision};
use crate::config::WorkerConfig;
use crate::error::{Error, Result};
use crate::retry::fetch_with_retry;
use crate::types::{FileDescriptor, FileId, LocalFile, SessionId, Stage, TargetId, TransferMode};
use crate::wait::{WaitOutcome, poll_until};

/// Everything one acquisition needs, owned so the future can be shared
pub(super) struct Transfer {
    pub(super) target: TargetId,
    pub(super) channel: Arc<dyn MessageChannel>,
    pub(super) config: Arc<WorkerConfig>,
    pub(super) file_id: FileId,
    pub(super) slot: FileSlot,
}

impl Transfer {
    pub(super) async fn run(self) -> Result<LocalFile> {
        let decision = match self.route().await {
            Ok(decision) => decision,
            Err(e) if e.triggers_fallback() => {
                tracing::warn!(
                    file_id = %self.file_id,
                    target = %self.target,
                    error = %e,
                    "Routing failed, falling back to chunked transfer"
                );
                let descriptor = self.metadata().await?;
                return self.chunked(descriptor).await;
            }
            Err(e) => return Err(e),
        };

        let (descriptor, attempt) = match decision {
            RoutingDecision::Direct { descriptor, data } => {
                let attempt = self.direct(descriptor.clone(), data).await;
                (descriptor, attempt)
            }
            RoutingDecision::Distributed {
                descriptor,
                session_id,
                assigned,
            } => {
                let attempt = self.distributed(&descriptor, session_id, &assigned).await;
                (descriptor, attempt)
            }
            RoutingDecision::Chunked { descriptor } => return self.chunked(descriptor).await,
        };

        match attempt {
            Err(e) if e.triggers_fallback() => {
                tracing::warn!(
                    file_id = %self.file_id,
                    target = %self.target,
                    error = %e,
                    "Transfer failed, falling back to chunked transfer"
                );
                self.chunked(descriptor).await
            }
            other => other,
        }
    }

    async fn route(&self) -> Result<RoutingDecision> {
        let request = BrokerRequest::GetRoutingInfo {
            file_id: self.file_id,
            target: self.target.clone(),
        };
        match self.channel.request(request).await? {
            BrokerResponse::Routing { decision } => Ok(decision),
            other => Err(other.unexpected("getRoutingInfo")),
        }
    }

    async fn metadata(&self) -> Result<FileDescriptor> {
        let request = BrokerRequest::GetMetadata {
            file_id: self.file_id,
        };
        match self.channel.request(request).await? {
            BrokerResponse::Metadata { descriptor } => Ok(descriptor),
            other => Err(other.unexpected("getMetadata")),
        }
    }

    async fn direct(&self, descriptor: FileDescriptor, data: Vec<u8>) -> Result<LocalFile> {
        tracing::debug!(file_id = %self.file_id, target = %self.target, "Received file inline");
        self.progress(Stage::Acquisition, "direct", 100.0, "Received inline")
            .await;
        let file = verify(descriptor, data, TransferMode::Direct)?;
        self.progress(Stage::Assembly, "direct", 100.0, "Ready").await;
        Ok(file)
    }

    async fn distributed(
        &self,
        descriptor: &FileDescriptor,
        session_id: SessionId,
        assigned: &[u32],
    ) -> Result<LocalFile> {
        tracing::info!(
            file_id = %self.file_id,
            session_id = %session_id,
            target = %self.target,
            assigned = assigned.len(),
            total_chunks = descriptor.total_chunks,
            "Participating in distributed transfer"
        );

        let own = self
            .fetch_chunks(descriptor, assigned, Stage::Acquisition, Some(session_id))
            .await?;

        self.progress(Stage::Assembly, "waiting", 0.0, "Waiting for other participants")
            .await;
        self.await_completion(session_id).await?;

        // Own chunks only cover the assigned block; the rest comes from the broker
        let chunks = if self.config.reuse_assigned_chunks {
            let missing: Vec<u32> = (0..descriptor.total_chunks)
                .filter(|i| !own.contains_key(i))
                .collect();
            let mut chunks = self
                .fetch_chunks(descriptor, &missing, Stage::Assembly, None)
                .await?;
            chunks.extend(own);
            chunks
        } else {
            drop(own);
            let all: Vec<u32> = (0..descriptor.total_chunks).collect();
            self.fetch_chunks(descriptor, &all, Stage::Assembly, None)
                .await?
        };

        let file = assemble(descriptor.clone(), chunks, TransferMode::Distributed)?;

        if let Err(e) = self
            .channel
            .notify(BrokerRequest::EndSession { session_id })
            .await
        {
            tracing::warn!(session_id = %session_id, error = %e, "Could not end session");
        }
        self.progress(Stage::Assembly, "merge", 100.0, "Assembled").await;
        Ok(file)
    }

    async fn chunked(&self, descriptor: FileDescriptor) -> Result<LocalFile> {
        tracing::info!(
            file_id = %self.file_id,
            target = %self.target,
            total_chunks = descriptor.total_chunks,
            "Fetching every chunk"
        );
        let all: Vec<u32> = (0..descriptor.total_chunks).collect();
        let chunks = self
            .fetch_chunks(&descriptor, &all, Stage::Acquisition, None)
            .await?;

        self.progress(Stage::Assembly, "merge", 0.0, "Assembling").await;
        let file = assemble(descriptor, chunks, TransferMode::Chunked)?;
        self.progress(Stage::Assembly, "merge", 100.0, "Assembled").await;
        Ok(file)
    }

    /// Poll `queryCompletion` until every participant has reported.
    async fn await_completion(&self, session_id: SessionId) -> Result<()> {
        let channel = &self.channel;
        let outcome = poll_until(
            self.config.completion_poll_interval,
            self.config.completion_wait,
            move || async move {
                match channel
                    .request(BrokerRequest::QueryCompletion { session_id })
                    .await?
                {
                    BrokerResponse::Completion { complete } => Ok(complete.then_some(())),
                    other => Err(other.unexpected("queryCompletion")),
                }
            },
        )
        .await;

        match outcome {
            WaitOutcome::Ready(()) => Ok(()),
            WaitOutcome::TimedOut => Err(Error::ChannelTimeout {
                action: "queryCompletion".to_string(),
                timeout_ms: self.config.completion_wait.as_millis() as u64,
            }),
            WaitOutcome::Errored(e) => Err(e),
        }
    }

    /// Fetch `indices` with bounded parallelism, reporting each landed chunk
    /// into `session` when given. Stops at the first chunk that fails after retries.
    async fn fetch_chunks(
        &self,
        descriptor: &FileDescriptor,
        indices: &[u32],
        stage: Stage,
        session: Option<SessionId>,
    ) -> Result<BTreeMap<u32, Vec<u8>>> {
        let total = indices.len();
        let mut chunks = BTreeMap::new();
        if total == 0 {
            self.progress(stage, "chunks", 100.0, "Nothing to fetch").await;
            return Ok(chunks);
        }

        let mut landed = stream::iter(indices.iter().copied())
            .map(move |index| async move {
                let data = fetch_with_retry(&self.config.retry, |attempt| {
                    self.fetch_chunk(descriptor, index, attempt)
                })
                .instrument(tracing::debug_span!(
                    "chunk",
                    file_id = %descriptor.file_id,
                    index,
                    target = %self.target
                ))
                .await?;
                if let Some(session_id) = session {
                    self.channel
                        .notify(BrokerRequest::ReportChunkComplete {
                            session_id,
                            index,
                            target: self.target.clone(),
                        })
                        .await?;
                }
                Ok::<_, Error>((index, data))
            })
            .buffer_unordered(self.config.chunk_concurrency.max(1));

        while let Some(result) = landed.next().await {
            let (index, data) = result?;
            chunks.insert(index, data);
            let done = chunks.len();
            self.progress(
                stage,
                &format!("chunk {done}/{total}"),
                done as f32 * 100.0 / total as f32,
                "Fetching chunks",
            )
            .await;
        }
        Ok(chunks)
    }

    async fn fetch_chunk(
        &self,
        descriptor: &FileDescriptor,
        index: u32,
        attempt: u32,
    ) -> Result<Vec<u8>> {
        let file_id = descriptor.file_id;
        let (start, end) = descriptor.chunk_range(index).ok_or(Error::ChunkOutOfRange {
            file_id,
            index,
            total_chunks: descriptor.total_chunks,
        })?;

        let response = self
            .channel
            .request(BrokerRequest::GetChunk { file_id, index })
            .await?;
        match response {
            BrokerResponse::Chunk { index: got, data } if got == index => {
                let expected = end - start;
                if data.len() as u64 != expected {
                    return Err(Error::ChunkFetchFailure {
                        file_id,
                        index,
                        reason: format!("expected {expected} bytes, got {}", data.len()),
                    });
                }
                tracing::trace!(attempt, bytes = data.len(), "Fetched chunk");
                Ok(data)
            }
            BrokerResponse::Chunk { index: got, .. } => Err(Error::ChunkFetchFailure {
                file_id,
                index,
                reason: format!("broker answered with chunk {got}"),
            }),
            other => Err(other.unexpected("getChunk")),
        }
    }

    async fn progress(&self, stage: Stage, sub_stage: &str, percent: f32, message: &str) {
        let (stage, percent) = self.slot.scale(stage, percent);
        notify_progress(
            self.channel.as_ref(),
            &self.target,
            stage,
            sub_stage,
            percent,
            message,
        )
        .await;
    }
}

/// Concatenate chunks in index order and verify the result.
fn assemble(
    descriptor: FileDescriptor,
    chunks: BTreeMap<u32, Vec<u8>>,
    mode: TransferMode,
) -> Result<LocalFile> {
    let mut data = Vec::with_capacity(descriptor.size_bytes as usize);
    for chunk in chunks.into_values() {
        data.extend_from_slice(&chunk);
    }
    verify(descriptor, data, mode)
}

/// Check size and digest against the descriptor.
pub(super) fn verify(descriptor: FileDescriptor, data: Vec<u8>, mode: TransferMode) -> Result<LocalFile> {
    let actual = data.len() as u64;
    if actual != descriptor.size_bytes {
        return Err(Error::AssemblyMismatch {
            file_id: descriptor.file_id,
            expected: descriptor.size_bytes,
            actual,
        });
    }
    if format!("{:x}", Sha256::digest(&data)) != descriptor.sha256 {
        return Err(Error::ChecksumMismatch {
            file_id: descriptor.file_id,
        });
    }
    Ok(LocalFile {
        descriptor,
        data: data.into(),
        mode,
    })
}
