//! Publish job scheduler.
//!
//! Dispatches one content payload to many destinations. Each destination
//! runs in its own task behind a [`TargetAutomation`], with its own timeout,
//! and every outcome becomes exactly one [`TargetResult`]:
//!
//! - **Concurrent** - every target starts at once (bounded by
//!   `max_concurrent_targets`); results are collected without early termination.
//! - **Sequential** - targets run in input order with a fixed delay between
//!   them; with `stop_on_error` the rest are marked not attempted after a failure.
//!
//! A target is registered active with the broker while it runs, so attachment
//! routing can distribute large files across the targets running together.


use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::{OwnedSemaphorePermit, RwLock, Semaphore, broadcast};
use tokio::time::Instant;

use crate::broker::BrokerHandle;
use crate::config::{SchedulerConfig, WorkerConfig};
use crate::error::{Error, Result};
use crate::types::{
    ContentPayload, DispatchMode, Event, JobId, JobSummary, PublishJob, ResolvedPayload, Stage,
    TargetId, TargetRef, TargetResult, TargetStatus,
};
use crate::worker::WorkerFileAgent;

/// Destination-specific publish capability (external collaborator)
#[async_trait::async_trait]
pub trait TargetAutomation: Send + Sync {
    /// Publish resolved content to one destination.
    ///
    /// Returns opaque result data (e.g. a post URL) on success. Any error is
    /// recorded as a failed [`TargetResult`] and never affects sibling targets.
    async fn publish(
        &self,
        target: &TargetRef,
        payload: &ResolvedPayload,
    ) -> Result<Option<serde_json::Value>>;
}

/// Per-job dispatch options
#[derive(Clone, Debug, Default)]
pub struct DispatchOptions {
    /// Concurrent or sequential
    pub mode: DispatchMode,
    /// Skip remaining targets after a failure (sequential mode only)
    pub stop_on_error: bool,
    /// Override of the configured inter-target delay
    pub inter_target_delay: Option<Duration>,
    /// Override of the configured per-target timeout
    pub target_timeout: Option<Duration>,
}

impl DispatchOptions {
    /// Sequential dispatch
    pub fn sequential(stop_on_error: bool) -> Self {
        Self {
            mode: DispatchMode::Sequential,
            stop_on_error,
            ..Self::default()
        }
    }

    /// Concurrent dispatch
    pub fn concurrent() -> Self {
        Self::default()
    }
}

type Entry = (TargetRef, Arc<dyn TargetAutomation>);

/// Counts a dispatching job until dropped
struct ActiveJob(Arc<AtomicUsize>);

impl ActiveJob {
    fn enter(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(counter))
    }
}

impl Drop for ActiveJob {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Schedules publish jobs across registered destinations (cloneable, shared state)
#[derive(Clone)]
pub struct PublishJobScheduler {
    automations: Arc<RwLock<HashMap<TargetId, Arc<dyn TargetAutomation>>>>,
    broker: BrokerHandle,
    event_tx: broadcast::Sender<Event>,
    /// Bounds running targets across all jobs
    concurrency: Arc<Semaphore>,
    next_job_id: Arc<AtomicU64>,
    active_jobs: Arc<AtomicUsize>,
    accepting_new: Arc<AtomicBool>,
    config: SchedulerConfig,
    worker_config: WorkerConfig,
}

impl PublishJobScheduler {
    /// Create a scheduler whose workers talk to `broker`
    pub fn new(
        broker: BrokerHandle,
        config: SchedulerConfig,
        worker_config: WorkerConfig,
        event_tx: broadcast::Sender<Event>,
    ) -> Self {
        Self {
            automations: Arc::new(RwLock::new(HashMap::new())),
            broker,
            event_tx,
            concurrency: Arc::new(Semaphore::new(config.max_concurrent_targets.max(1))),
            next_job_id: Arc::new(AtomicU64::new(1)),
            active_jobs: Arc::new(AtomicUsize::new(0)),
            accepting_new: Arc::new(AtomicBool::new(true)),
            config,
            worker_config,
        }
    }

    /// Register (or replace) the automation for a destination
    pub async fn register(&self, target: impl Into<TargetId>, automation: Arc<dyn TargetAutomation>) {
        let target = target.into();
        tracing::info!(target = %target, "Registered destination");
        self.automations.write().await.insert(target, automation);
    }

    /// Remove a destination. Returns false if it was not registered.
    pub async fn unregister(&self, target: &TargetId) -> bool {
        self.automations.write().await.remove(target).is_some()
    }

    /// Registered destination ids, sorted
    pub async fn destinations(&self) -> Vec<TargetId> {
        let mut ids: Vec<TargetId> = self.automations.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Number of jobs currently dispatching
    pub fn active_jobs(&self) -> usize {
        self.active_jobs.load(Ordering::SeqCst)
    }

    /// Reject further jobs with [`Error::ShuttingDown`]
    pub fn stop_accepting(&self) {
        self.accepting_new.store(false, Ordering::SeqCst);
    }

    /// Publish `payload` to every target and collect one result per target.
    ///
    /// Only request misuse fails the call: an unknown destination
    /// ([`Error::UnknownDestination`]) or a target listed twice
    /// ([`Error::DuplicateTarget`]). Automation failures and timeouts are
    /// reported in the summary.
    pub async fn dispatch(
        &self,
        targets: Vec<TargetRef>,
        payload: ContentPayload,
        options: DispatchOptions,
    ) -> Result<JobSummary> {
        if !self.accepting_new.load(Ordering::SeqCst) || self.broker.is_shut_down() {
            return Err(Error::ShuttingDown);
        }
        let entries = self.resolve_targets(&targets).await?;

        let job_id = JobId(self.next_job_id.fetch_add(1, Ordering::SeqCst));
        let mut job = PublishJob::new(job_id, targets, payload, options.mode, options.stop_on_error);
        let target_timeout = options.target_timeout.unwrap_or(self.config.target_timeout);
        let started = Instant::now();

        let _active = ActiveJob::enter(&self.active_jobs);
        tracing::info!(
            job_id = %job_id,
            targets = entries.len(),
            mode = ?options.mode,
            stop_on_error = options.stop_on_error,
            "Publish job started"
        );
        self.event_tx
            .send(Event::JobStarted {
                job_id,
                targets: entries.len(),
                mode: options.mode,
            })
            .ok();

        let results = match options.mode {
            DispatchMode::Concurrent => {
                self.run_concurrent(job_id, entries, Arc::clone(&job.payload), target_timeout)
                    .await
            }
            DispatchMode::Sequential => {
                let delay = options
                    .inter_target_delay
                    .unwrap_or(self.config.inter_target_delay);
                self.run_sequential(
                    job_id,
                    entries,
                    Arc::clone(&job.payload),
                    target_timeout,
                    delay,
                    options.stop_on_error,
                )
                .await
            }
        };

        for result in results {
            if let Err(e) = job.record(result) {
                tracing::warn!(job_id = %job_id, error = %e, "Dropped duplicate target result");
            }
        }

        let summary = job.summary(started.elapsed().as_millis() as u64);
        tracing::info!(
            job_id = %job_id,
            succeeded = summary.success_count,
            failed = summary.failure_count,
            not_attempted = summary.not_attempted_count,
            duration_ms = summary.duration_ms,
            "Publish job finished"
        );
        self.event_tx
            .send(Event::JobFinished {
                summary: summary.clone(),
            })
            .ok();
        Ok(summary)
    }

    async fn resolve_targets(&self, targets: &[TargetRef]) -> Result<Vec<Entry>> {
        let automations = self.automations.read().await;
        let mut seen = HashSet::new();
        targets
            .iter()
            .map(|target| {
                if !seen.insert(&target.id) {
                    return Err(Error::DuplicateTarget(target.id.clone()));
                }
                automations
                    .get(&target.id)
                    .map(|automation| (target.clone(), Arc::clone(automation)))
                    .ok_or_else(|| Error::UnknownDestination(target.id.clone()))
            })
            .collect()
    }

    async fn run_concurrent(
        &self,
        job_id: JobId,
        entries: Vec<Entry>,
        payload: Arc<ContentPayload>,
        target_timeout: Duration,
    ) -> Vec<TargetResult> {
        // Every target that can start now is activated before any of them
        // routes an attachment, so they share one distributed session.
        let mut permits: Vec<Option<OwnedSemaphorePermit>> = Vec::with_capacity(entries.len());
        for (target, _) in &entries {
            let permit = Arc::clone(&self.concurrency).try_acquire_owned().ok();
            if permit.is_some() {
                self.activate(&target.id, &payload).await;
            }
            permits.push(permit);
        }

        let runs = entries
            .into_iter()
            .zip(permits)
            .map(|((target, automation), permit)| {
                let payload = Arc::clone(&payload);
                async move {
                    let _permit = match permit {
                        Some(permit) => Some(permit),
                        None => {
                            let permit = Arc::clone(&self.concurrency).acquire_owned().await.ok();
                            self.activate(&target.id, &payload).await;
                            permit
                        }
                    };
                    self.run_target(job_id, target, automation, payload, target_timeout)
                        .await
                }
            });
        join_all(runs).await
    }

    async fn run_sequential(
        &self,
        job_id: JobId,
        entries: Vec<Entry>,
        payload: Arc<ContentPayload>,
        target_timeout: Duration,
        delay: Duration,
        stop_on_error: bool,
    ) -> Vec<TargetResult> {
        let mut results = Vec::with_capacity(entries.len());
        let mut halted = false;

        for (target, automation) in entries {
            if halted {
                let result = TargetResult::not_attempted(target.id.clone());
                self.event_tx
                    .send(Event::TargetFinished {
                        job_id,
                        result: result.clone(),
                    })
                    .ok();
                results.push(result);
                continue;
            }
            if !results.is_empty() && !delay.is_zero() {
                tracing::debug!(job_id = %job_id, delay_ms = delay.as_millis() as u64, "Waiting before next target");
                tokio::time::sleep(delay).await;
            }

            let _permit = Arc::clone(&self.concurrency).acquire_owned().await.ok();
            self.activate(&target.id, &payload).await;
            let result = self
                .run_target(job_id, target, automation, Arc::clone(&payload), target_timeout)
                .await;

            if !result.success && stop_on_error {
                tracing::info!(
                    job_id = %job_id,
                    target = %result.target_id,
                    "Target failed, skipping remaining targets"
                );
                halted = true;
            }
            results.push(result);
        }
        results
    }

    /// Mark `target` active for the attachments it is about to route
    async fn activate(&self, target: &TargetId, payload: &ContentPayload) {
        if let Err(e) = self.broker.activate(target.clone(), payload.file_ids()).await {
            tracing::warn!(target = %target, error = %e, "Could not mark target active");
        }
    }

    /// Run one target in its own task, bounded by `target_timeout`, and
    /// convert every outcome into a result. The target is deactivated after.
    async fn run_target(
        &self,
        job_id: JobId,
        target: TargetRef,
        automation: Arc<dyn TargetAutomation>,
        payload: Arc<ContentPayload>,
        target_timeout: Duration,
    ) -> TargetResult {
        let target_id = target.id.clone();
        let started = Instant::now();
        tracing::info!(job_id = %job_id, target = %target_id, "Target started");
        self.event_tx
            .send(Event::TargetStarted {
                job_id,
                target_id: target_id.clone(),
            })
            .ok();

        let agent = WorkerFileAgent::new(
            target_id.clone(),
            Arc::new(self.broker.client(&self.worker_config)),
            self.worker_config.clone(),
        );
        let mut task = tokio::spawn(execute_target(agent, target, automation, payload));
        let outcome = tokio::time::timeout(target_timeout, &mut task).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let result = match outcome {
            Ok(Ok(Ok(result_payload))) => {
                TargetResult::succeeded(target_id.clone(), duration_ms, result_payload)
            }
            Ok(Ok(Err(e))) => {
                TargetResult::failed(target_id.clone(), TargetStatus::Failed, e.to_string(), duration_ms)
            }
            Ok(Err(join_error)) => TargetResult::failed(
                target_id.clone(),
                TargetStatus::Failed,
                format!("automation task failed: {join_error}"),
                duration_ms,
            ),
            Err(_) => {
                task.abort();
                TargetResult::failed(
                    target_id.clone(),
                    TargetStatus::TimedOut,
                    format!("timed out after {}ms", target_timeout.as_millis()),
                    duration_ms,
                )
            }
        };

        if let Err(e) = self.broker.deactivate(target_id.clone()).await {
            tracing::warn!(target = %target_id, error = %e, "Could not mark target inactive");
        }

        if result.success {
            tracing::info!(job_id = %job_id, target = %target_id, duration_ms, "Target succeeded");
        } else {
            tracing::error!(
                job_id = %job_id,
                target = %target_id,
                status = ?result.status,
                error = result.error.as_deref().unwrap_or_default(),
                duration_ms,
                "Target failed"
            );
        }
        self.event_tx
            .send(Event::TargetFinished {
                job_id,
                result: result.clone(),
            })
            .ok();
        result
    }
}

/// Resolve attachments, then hand the content to the automation.
async fn execute_target(
    agent: WorkerFileAgent,
    target: TargetRef,
    automation: Arc<dyn TargetAutomation>,
    payload: Arc<ContentPayload>,
) -> Result<Option<serde_json::Value>> {
    let resolved = agent.resolve_payload(&payload).await?;

    agent
        .report_progress(Stage::Injection, "publish", 0.0, "Publishing")
        .await;
    let result_payload = automation
        .publish(&target, &resolved)
        .await
        .map_err(|e| match e {
            Error::TargetPublishFailure { .. } => e,
            other => Error::TargetPublishFailure {
                target: target.id.clone(),
                reason: other.to_string(),
            },
        })?;
    agent
        .report_progress(Stage::Injection, "publish", 100.0, "Published")
        .await;
    Ok(result_payload)
}
