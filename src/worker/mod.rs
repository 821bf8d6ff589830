//! Worker-side file agent.
//!
//! One [`WorkerFileAgent`] runs per destination context. It asks the broker
//! how to obtain each attachment and then:
//! - **direct** - takes the inline bytes
//! - **distributed** - fetches its assigned chunks, reports each one, waits for
//!   the session to complete, pulls the full sequence and ends the session
//! - **chunked** - fetches every chunk itself
//!
//! Transport and session failures on the first two paths fall back once to
//! the chunked path. A per-agent in-flight map keeps two local callers from
//! starting the same fetch twice.

mod transfer;


use std::collections::HashMap;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use tokio::sync::Mutex;

use crate::channel::{BrokerRequest, MessageChannel};
use crate::config::WorkerConfig;
use crate::error::{Error, Result};
use crate::types::{ContentPayload, FileId, LocalFile, ResolvedPayload, Stage, TargetId};
use transfer::Transfer;

type SharedFetch = Shared<BoxFuture<'static, Result<LocalFile>>>;

/// Obtains attachments for one destination (cloneable, shared state)
#[derive(Clone)]
pub struct WorkerFileAgent {
    target: TargetId,
    channel: Arc<dyn MessageChannel>,
    config: Arc<WorkerConfig>,
    /// Running and completed fetches; failed fetches are removed
    in_flight: Arc<Mutex<HashMap<FileId, SharedFetch>>>,
}

impl WorkerFileAgent {
    /// Create an agent for `target` talking to the broker over `channel`
    pub fn new(target: TargetId, channel: Arc<dyn MessageChannel>, config: WorkerConfig) -> Self {
        Self {
            target,
            channel,
            config: Arc::new(config),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Destination this agent works for
    pub fn target(&self) -> &TargetId {
        &self.target
    }

    /// Obtain a file's full content.
    ///
    /// A second call while the first is still running attaches to it, or fails
    /// with [`Error::FetchInFlight`] when `attach_to_in_flight` is off. A
    /// successful result is cached until [`WorkerFileAgent::evict`].
    pub async fn obtain_file(&self, file_id: FileId) -> Result<LocalFile> {
        self.obtain(file_id, FileSlot::SOLE).await
    }

    async fn obtain(&self, file_id: FileId, slot: FileSlot) -> Result<LocalFile> {
        let fetch = {
            let mut in_flight = self.in_flight.lock().await;
            match in_flight.get(&file_id) {
                Some(existing) if existing.peek().is_none() && !self.config.attach_to_in_flight => {
                    tracing::debug!(file_id = %file_id, target = %self.target, "Fetch already in flight");
                    return Err(Error::FetchInFlight(file_id));
                }
                Some(existing) => existing.clone(),
                None => {
                    let transfer = Transfer {
                        target: self.target.clone(),
                        channel: Arc::clone(&self.channel),
                        config: Arc::clone(&self.config),
                        file_id,
                        slot,
                    };
                    let fetch = transfer.run().boxed().shared();
                    in_flight.insert(file_id, fetch.clone());
                    fetch
                }
            }
        };

        let result = fetch.clone().await;
        if let Err(e) = &result {
            let mut in_flight = self.in_flight.lock().await;
            if in_flight
                .get(&file_id)
                .is_some_and(|current| current.ptr_eq(&fetch))
            {
                in_flight.remove(&file_id);
            }
            tracing::error!(file_id = %file_id, target = %self.target, error = %e, "Could not obtain file");
        }
        result
    }

    /// Obtain every attachment of `payload`, in payload order.
    ///
    /// Progress of the whole set is reported as one track, so the target's
    /// overall percentage only moves forward from file to file.
    pub async fn resolve_payload(&self, payload: &ContentPayload) -> Result<ResolvedPayload> {
        let count = payload.files.len();
        let mut files = Vec::with_capacity(count);
        for (index, file) in payload.files.iter().enumerate() {
            files.push(self.obtain(file.file_id, FileSlot { index, count }).await?);
        }
        Ok(ResolvedPayload {
            title: payload.title.clone(),
            body: payload.body.clone(),
            files,
        })
    }

    /// Forget a cached result. Returns false if nothing was cached.
    pub async fn evict(&self, file_id: FileId) -> bool {
        self.in_flight.lock().await.remove(&file_id).is_some()
    }

    /// Send a progress notification for this agent's target
    pub async fn report_progress(&self, stage: Stage, sub_stage: &str, percent: f32, message: &str) {
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

/// Position of one attachment among the attachments of a payload
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct FileSlot {
    index: usize,
    count: usize,
}

impl FileSlot {
    const SOLE: Self = Self { index: 0, count: 1 };

    /// Map a file-local stage percentage onto the payload-wide track.
    ///
    /// The track runs through acquisition for its first half and assembly
    /// for its second; each file owns an equal slice of it.
    fn scale(self, stage: Stage, percent: f32) -> (Stage, f32) {
        if self.count <= 1 {
            return (stage, percent);
        }
        let within = match stage {
            Stage::Acquisition => percent.clamp(0.0, 100.0) / 200.0,
            Stage::Assembly => 0.5 + percent.clamp(0.0, 100.0) / 200.0,
            Stage::Injection => return (stage, percent),
        };
        let track = (self.index as f32 + within) / self.count as f32;
        if track <= 0.5 {
            (Stage::Acquisition, track * 200.0)
        } else {
            (Stage::Assembly, (track - 0.5) * 200.0)
        }
    }
}

/// Fire-and-forget progress notification; a full or closed queue drops it
async fn notify_progress(
    channel: &dyn MessageChannel,
    target: &TargetId,
    stage: Stage,
    sub_stage: &str,
    percent: f32,
    message: &str,
) {
    let request = BrokerRequest::ProgressNotify {
        target: target.clone(),
        stage: stage.as_str().to_string(),
        sub_stage: sub_stage.to_string(),
        percent,
        message: message.to_string(),
    };
    if let Err(e) = channel.notify(request).await {
        tracing::debug!(target = %target, error = %e, "Dropped progress notification");
    }
}
