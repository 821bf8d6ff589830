//! Broker reactor: a single task that owns the [`FileBroker`] and processes
//! inbound commands strictly one at a time.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::FileBroker;
use crate::channel::{BrokerRequest, BrokerResponse, ChannelClient, Envelope};
use crate::config::{BrokerConfig, WorkerConfig};
use crate::error::{Error, Result};
use crate::progress::ProgressAggregator;
use crate::types::{Event, FileDescriptor, FileId, FileMetadata, TargetId};

/// Command from the process that owns the broker
pub(crate) enum Control {
    Ingest {
        data: Vec<u8>,
        metadata: FileMetadata,
        reply: oneshot::Sender<Result<FileDescriptor>>,
    },
    Release(FileId),
    /// Target starts running with these attachments; its previous progress is discarded
    ActivateTarget { target: TargetId, files: Vec<FileId> },
    /// Target reached a terminal result; its progress stream is closed
    DeactivateTarget(TargetId),
    Stats(oneshot::Sender<BrokerStats>),
}

/// Snapshot of broker registries
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerStats {
    /// Stored files
    pub files: usize,
    /// Open sessions
    pub sessions: usize,
    /// Active targets in registration order
    pub active_targets: Vec<TargetId>,
}

/// Owner-side handle to a running broker reactor (cloneable)
#[derive(Clone)]
pub struct BrokerHandle {
    tx: mpsc::Sender<Envelope>,
    cancel_token: CancellationToken,
    reply_timeout: Duration,
}

/// Spawn the broker reactor.
///
/// Progress notifications received from workers are applied to `progress`;
/// session lifecycle events go to `event_tx`. The config is validated before
/// anything is spawned.
pub fn spawn_broker(
    config: BrokerConfig,
    progress: ProgressAggregator,
    event_tx: broadcast::Sender<Event>,
    reply_timeout: Duration,
) -> Result<(BrokerHandle, tokio::task::JoinHandle<()>)> {
    let queue_capacity = config.queue_capacity;
    let reap_interval = config.reap_interval;
    let broker = FileBroker::new(config, event_tx)?;
    let (tx, rx) = mpsc::channel(queue_capacity);
    let cancel_token = CancellationToken::new();

    let task = tokio::spawn(run_reactor(
        broker,
        progress,
        rx,
        reap_interval,
        cancel_token.child_token(),
    ));

    Ok((
        BrokerHandle {
            tx,
            cancel_token,
            reply_timeout,
        },
        task,
    ))
}

async fn run_reactor(
    mut broker: FileBroker,
    progress: ProgressAggregator,
    mut rx: mpsc::Receiver<Envelope>,
    reap_interval: Duration,
    cancel_token: CancellationToken,
) {
    let mut reap = tokio::time::interval(reap_interval);
    reap.set_missed_tick_behavior(MissedTickBehavior::Skip);

    tracing::info!("Broker reactor started");
    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => break,
            _ = reap.tick() => {
                broker.reap_expired(Instant::now());
            }
            envelope = rx.recv() => {
                let Some(envelope) = envelope else {
                    // Every sender dropped
                    break;
                };
                handle_envelope(&mut broker, &progress, envelope);
            }
        }
    }
    tracing::info!("Broker reactor stopped");
}

fn handle_envelope(broker: &mut FileBroker, progress: &ProgressAggregator, envelope: Envelope) {
    match envelope {
        Envelope::Request { request, reply } => {
            let action = request.action();
            let result = dispatch(broker, progress, request);
            match reply {
                Some(reply) => {
                    // Requester may have timed out and dropped its slot
                    let _ = reply.send(result);
                }
                None => {
                    if let Err(e) = result {
                        tracing::warn!(action, error = %e, "Notification rejected");
                    }
                }
            }
        }
        Envelope::Control(control) => apply_control(broker, progress, control),
    }
}

fn dispatch(
    broker: &mut FileBroker,
    progress: &ProgressAggregator,
    request: BrokerRequest,
) -> Result<BrokerResponse> {
    match request {
        BrokerRequest::GetRoutingInfo { file_id, target } => {
            let decision = broker.route_active(file_id, &target)?;
            Ok(BrokerResponse::Routing { decision })
        }
        BrokerRequest::StartDistributedSession {
            file_id,
            participants,
        } => {
            let session = broker.start_distributed_session(file_id, &participants)?;
            Ok(BrokerResponse::SessionStarted { session })
        }
        BrokerRequest::GetMetadata { file_id } => Ok(BrokerResponse::Metadata {
            descriptor: broker.get_metadata(file_id)?,
        }),
        BrokerRequest::GetChunk { file_id, index } => Ok(BrokerResponse::Chunk {
            index,
            data: broker.get_chunk(file_id, index)?,
        }),
        BrokerRequest::ReportChunkComplete {
            session_id,
            index,
            target,
        } => {
            broker.report_chunk_complete(session_id, index, &target)?;
            Ok(BrokerResponse::Ack)
        }
        BrokerRequest::QueryCompletion { session_id } => Ok(BrokerResponse::Completion {
            complete: broker.query_completion(session_id)?,
        }),
        BrokerRequest::EndSession { session_id } => {
            broker.end_session(session_id);
            Ok(BrokerResponse::Ack)
        }
        BrokerRequest::ProgressNotify {
            target,
            stage,
            sub_stage,
            percent,
            message,
        } => {
            progress.update(&target, &stage, &sub_stage, percent, &message)?;
            Ok(BrokerResponse::Ack)
        }
    }
}

fn apply_control(broker: &mut FileBroker, progress: &ProgressAggregator, control: Control) {
    match control {
        Control::Ingest {
            data,
            metadata,
            reply,
        } => {
            let _ = reply.send(broker.ingest(data, metadata));
        }
        Control::Release(file_id) => broker.release(file_id),
        Control::ActivateTarget { target, files } => {
            progress.reset(&target);
            broker.activate_target(target, files);
        }
        Control::DeactivateTarget(target) => {
            broker.deactivate_target(&target);
            progress.finish(&target);
        }
        Control::Stats(reply) => {
            let _ = reply.send(broker.stats());
        }
    }
}

impl BrokerHandle {
    /// Message channel for a worker context
    pub fn client(&self, config: &WorkerConfig) -> ChannelClient {
        ChannelClient::new(self.tx.clone(), config)
    }

    /// Hand raw bytes to the broker
    pub async fn ingest(&self, data: Vec<u8>, metadata: FileMetadata) -> Result<FileDescriptor> {
        let (reply, rx) = oneshot::channel();
        self.send(Control::Ingest {
            data,
            metadata,
            reply,
        })
        .await?;
        self.await_reply("ingest", rx).await?
    }

    /// Drop a file once no session references it
    pub async fn release(&self, file_id: FileId) -> Result<()> {
        self.send(Control::Release(file_id)).await
    }

    /// Mark a target active for routing decisions on the attachments in `files`
    pub async fn activate(&self, target: TargetId, files: Vec<FileId>) -> Result<()> {
        self.send(Control::ActivateTarget { target, files }).await
    }

    /// Mark a target inactive and close its progress stream.
    ///
    /// Queued behind every notification the target already sent.
    pub async fn deactivate(&self, target: TargetId) -> Result<()> {
        self.send(Control::DeactivateTarget(target)).await
    }

    /// Registry counts
    pub async fn stats(&self) -> Result<BrokerStats> {
        let (reply, rx) = oneshot::channel();
        self.send(Control::Stats(reply)).await?;
        self.await_reply("stats", rx).await
    }

    /// Stop the reactor. Pending and later requests fail with `NoResponder`.
    pub fn shutdown(&self) {
        self.cancel_token.cancel();
    }

    /// True once [`BrokerHandle::shutdown`] was called
    pub fn is_shut_down(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    async fn send(&self, control: Control) -> Result<()> {
        if self.cancel_token.is_cancelled() {
            return Err(Error::ShuttingDown);
        }
        self.tx
            .send(Envelope::Control(control))
            .await
            .map_err(|_| Error::NoResponder {
                action: "control".to_string(),
            })
    }

    async fn await_reply<T>(&self, action: &str, rx: oneshot::Receiver<T>) -> Result<T> {
        match tokio::time::timeout(self.reply_timeout, rx).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Err(Error::NoResponder {
                action: action.to_string(),
            }),
            Err(_) => Err(Error::ChannelTimeout {
                action: action.to_string(),
                timeout_ms: self.reply_timeout.as_millis() as u64,
            }),
        }
    }
}
