//! Scheduler (C9, §4.9): two independent pipelines draw tasks and dispatch downloads.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, instrument, warn};

use crate::engine::{self, DownloadOutcome, DownloadSpec, EngineError};
use crate::events::{Event, EventSink};
use crate::hash::IntegrityFailureCounter;
use crate::http::{HttpClient, RetryDecision, RetryPolicy};
use crate::model::{Pipeline, TaskKind};
use crate::queue::{TaskRecord, TaskStatus, TaskStore};
use crate::rate::{Channel, RateGovernor};

/// No pending item to claim right now; avoid busy-waiting on an empty queue.
const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// A task's declared download parameters, decoded from its opaque JSON payload.
///
/// Produced upstream by the Enumerator; the scheduler only needs enough to dispatch.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct TaskPayload {
    pub url: String,
    pub destination: PathBuf,
    #[serde(default)]
    pub declared_sha256: Option<String>,
    #[serde(default)]
    pub declared_size: Option<u64>,
    #[serde(default)]
    pub skip_existing: bool,
}

/// Runtime configuration for the two pipelines (§4.9, §6.1 `max_concurrent_downloads`).
#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    pub model_concurrency: usize,
    pub image_concurrency: usize,
}

impl SchedulerConfig {
    /// Derives pipeline ceilings from `max_concurrent_downloads` (§4.9, §9 Open Question a):
    /// model pipeline defaults to 1 (configurable up to the ceiling); image pipeline defaults
    /// to 2 (ceiling `2 × max_concurrent_downloads`).
    #[must_use]
    pub fn from_max_concurrent_downloads(max_concurrent_downloads: usize) -> Self {
        Self {
            model_concurrency: max_concurrent_downloads.max(1),
            image_concurrency: (max_concurrent_downloads * 2).max(2),
        }
    }
}

/// Dispatches work from the Task Store to the Download Engine across both pipelines.
#[derive(Clone)]
pub struct Scheduler {
    store: TaskStore,
    client: Arc<HttpClient>,
    rate: RateGovernor,
    root: PathBuf,
    model_semaphore: Arc<Semaphore>,
    image_semaphore: Arc<Semaphore>,
    hybrid_semaphore: Arc<Semaphore>,
    hybrid_safe_mode: Arc<AtomicBool>,
    global_halt: Arc<AtomicBool>,
    cancelled: Arc<AtomicBool>,
    retry_policy: RetryPolicy,
    events: EventSink,
}

/// Outcome tally for one `run()` call.
#[derive(Debug, Default, Clone, Copy)]
pub struct SchedulerStats {
    pub completed: u64,
    pub skipped: u64,
    pub failed: u64,
    pub requeued: u64,
}

impl Scheduler {
    #[must_use]
    pub fn new(
        store: TaskStore,
        client: Arc<HttpClient>,
        rate: RateGovernor,
        root: PathBuf,
        config: SchedulerConfig,
        events: EventSink,
    ) -> Self {
        Self {
            store,
            client,
            rate,
            root,
            model_semaphore: Arc::new(Semaphore::new(config.model_concurrency)),
            image_semaphore: Arc::new(Semaphore::new(config.image_concurrency)),
            hybrid_semaphore: Arc::new(Semaphore::new(1)),
            hybrid_safe_mode: Arc::new(AtomicBool::new(false)),
            global_halt: Arc::new(AtomicBool::new(false)),
            cancelled: Arc::new(AtomicBool::new(false)),
            retry_policy: RetryPolicy::default(),
            events,
        }
    }

    /// Collapses both pipeline semaphores to a single shared permit, emulating fully
    /// sequential operation (§4.9, §4.11). The Recovery Supervisor calls this.
    pub fn set_hybrid_safe_mode(&self, on: bool) {
        let was = self.hybrid_safe_mode.swap(on, Ordering::SeqCst);
        if was != on {
            self.events.emit(Event::SupervisorModeChanged {
                from: if was { "hybrid_safe".into() } else { "normal".into() },
                to: if on { "hybrid_safe".into() } else { "normal".into() },
                reason: "recovery supervisor".into(),
            });
        }
    }

    #[must_use]
    pub fn is_hybrid_safe_mode(&self) -> bool {
        self.hybrid_safe_mode.load(Ordering::SeqCst)
    }

    /// Halts all new dispatch until cleared (§4.11 `global_halt`).
    pub fn set_global_halt(&self, on: bool) {
        self.global_halt.store(on, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_global_halt(&self) -> bool {
        self.global_halt.load(Ordering::SeqCst)
    }

    /// Requests cancellation; in-flight workers stop at their next I/O yield point and
    /// owned tasks revert to `pending` (§4.9 Cancellation).
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Runs both pipelines to completion (until their task kinds are exhausted, cancelled,
    /// or halted).
    #[instrument(skip(self))]
    pub async fn run(&self) -> SchedulerStats {
        let model_kinds = [TaskKind::MetadataFetch, TaskKind::ModelFile];
        let image_kinds = [TaskKind::PreviewImage, TaskKind::GalleryImage, TaskKind::UserImage];

        let (model_stats, image_stats) = tokio::join!(
            self.run_pipeline(Pipeline::Model, &model_kinds, &self.model_semaphore),
            self.run_pipeline(Pipeline::Image, &image_kinds, &self.image_semaphore)
        );

        SchedulerStats {
            completed: model_stats.completed + image_stats.completed,
            skipped: model_stats.skipped + image_stats.skipped,
            failed: model_stats.failed + image_stats.failed,
            requeued: model_stats.requeued + image_stats.requeued,
        }
    }

    async fn run_pipeline(
        &self,
        pipeline: Pipeline,
        kinds: &[TaskKind],
        semaphore: &Arc<Semaphore>,
    ) -> SchedulerStats {
        let mut stats = SchedulerStats::default();
        let mut workers = JoinSet::new();

        loop {
            if self.cancelled.load(Ordering::SeqCst) || self.global_halt.load(Ordering::SeqCst) {
                break;
            }

            let permit = self.acquire_permit(semaphore).await;

            match self.store.claim(1, kinds).await {
                Ok(tasks) if !tasks.is_empty() => {
                    let task = tasks.into_iter().next().expect("claim returned at least one task");
                    let scheduler = self.clone();
                    workers.spawn(async move {
                        let outcome = scheduler.dispatch(task).await;
                        drop(permit);
                        outcome
                    });
                }
                Ok(_) => {
                    drop(permit);
                    if workers.is_empty() {
                        break;
                    }
                    if let Some(result) = workers.join_next().await {
                        accumulate(&mut stats, result);
                    } else {
                        tokio::time::sleep(IDLE_POLL_INTERVAL).await;
                    }
                }
                Err(err) => {
                    warn!(pipeline = ?pipeline, error = %err, "failed to claim tasks");
                    drop(permit);
                    tokio::time::sleep(IDLE_POLL_INTERVAL).await;
                }
            }
        }

        while let Some(result) = workers.join_next().await {
            accumulate(&mut stats, result);
        }

        stats
    }

    async fn acquire_permit(&self, pipeline_semaphore: &Arc<Semaphore>) -> OwnedSemaphorePermit {
        let semaphore = if self.hybrid_safe_mode.load(Ordering::SeqCst) {
            &self.hybrid_semaphore
        } else {
            pipeline_semaphore
        };
        Arc::clone(semaphore)
            .acquire_owned()
            .await
            .expect("semaphore is never closed")
    }

    async fn dispatch(&self, task: TaskRecord) -> TaskOutcome {
        let Some(kind) = task.task_kind() else {
            warn!(task_id = %task.id, kind = %task.kind, "unknown task kind, marking failed");
            let _ = self
                .store
                .complete(&task.id, TaskStatus::Failed, Some("unknown"), Some("unrecognized task kind"))
                .await;
            return TaskOutcome::Failed;
        };

        let payload: TaskPayload = match task.payload_as() {
            Ok(p) => p,
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "malformed task payload");
                let _ = self
                    .store
                    .complete(&task.id, TaskStatus::Failed, Some("malformed_payload"), Some(&e.to_string()))
                    .await;
                return TaskOutcome::Failed;
            }
        };

        let channel = channel_for(kind);
        let spec = DownloadSpec {
            url: payload.url,
            destination: payload.destination,
            declared_sha256: payload.declared_sha256,
            declared_size: payload.declared_size,
            skip_existing: payload.skip_existing,
        };

        let attempt = u32::try_from(task.attempts).unwrap_or(u32::MAX).saturating_add(1);

        let result = engine::download_file(
            &self.client,
            &self.rate,
            channel,
            &self.root,
            &task.id,
            kind.as_str(),
            &spec,
            &self.events,
        )
        .await;

        match result {
            Ok(DownloadOutcome::Skipped) => {
                let _ = self.store.complete(&task.id, TaskStatus::Skipped, None, None).await;
                TaskOutcome::Skipped
            }
            Ok(DownloadOutcome::Completed { .. }) => {
                let _ = self.store.complete(&task.id, TaskStatus::Done, None, None).await;
                TaskOutcome::Completed
            }
            Err(err) => self.handle_failure(&task, kind, channel, &err, attempt).await,
        }
    }

    async fn handle_failure(
        &self,
        task: &TaskRecord,
        kind: TaskKind,
        channel: Channel,
        err: &EngineError,
        attempt: u32,
    ) -> TaskOutcome {
        let failure_type = err.failure_type();
        let message = err.to_string();

        if failure_type == crate::http::FailureType::RateLimit429 {
            self.rate.record_rate_limited(channel).await;
        }

        let retry_after = if let EngineError::Http(http_err) = err {
            http_err.retry_after()
        } else {
            None
        };

        self.events.emit(Event::DownloadFailed {
            task_id: task.id.clone(),
            error_class: format!("{failure_type:?}"),
            message: message.clone(),
            attempt,
        });

        let is_integrity_failure = failure_type == crate::http::FailureType::Integrity;

        // Integrity failures have their own threshold (§4.3: quarantine after 3 *consecutive*
        // mismatches) rather than the generic per-class backoff schedule. The streak is
        // tracked on the task row itself (`integrity_failures`), separately from the
        // generic `attempts` counter `requeue` bumps on every failure class, so a task that
        // already retried past a couple of network failures isn't quarantined on its
        // first-ever digest mismatch.
        let decision = if is_integrity_failure {
            integrity_decision(task.integrity_failures)
        } else {
            self.retry_policy.decide(failure_type, attempt, retry_after)
        };

        match decision {
            RetryDecision::Retry(delay) => {
                debug!(task_id = %task.id, kind = %kind.as_str(), attempt, delay_s = delay.as_secs_f64(), "requeueing after failure");
                let _ = self
                    .store
                    .requeue(
                        &task.id,
                        delay,
                        Some(&format!("{failure_type:?}")),
                        Some(&message),
                        is_integrity_failure,
                    )
                    .await;
                TaskOutcome::Requeued
            }
            RetryDecision::GiveUp => {
                let terminal = if is_integrity_failure {
                    TaskStatus::Quarantined
                } else {
                    TaskStatus::Failed
                };
                let _ = self
                    .store
                    .complete(&task.id, terminal, Some(&format!("{failure_type:?}")), Some(&message))
                    .await;
                TaskOutcome::Failed
            }
        }
    }
}

const INTEGRITY_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Decides whether to retry or quarantine based on the task's consecutive integrity-failure
/// streak *before* this failure (§4.3: quarantine after 3 consecutive mismatches).
fn integrity_decision(consecutive_failures_before: i64) -> RetryDecision {
    let mut counter = IntegrityFailureCounter::new();
    for _ in 0..consecutive_failures_before.max(0) {
        counter.record_failure();
    }
    if counter.record_failure() {
        RetryDecision::GiveUp
    } else {
        RetryDecision::Retry(INTEGRITY_RETRY_DELAY)
    }
}

enum TaskOutcome {
    Completed,
    Skipped,
    Failed,
    Requeued,
}

fn channel_for(kind: TaskKind) -> Channel {
    match kind {
        TaskKind::MetadataFetch => Channel::ModelApi,
        TaskKind::ModelFile => Channel::ModelFile,
        TaskKind::PreviewImage | TaskKind::GalleryImage | TaskKind::UserImage => Channel::ImageFile,
    }
}

fn accumulate(stats: &mut SchedulerStats, result: Result<TaskOutcome, tokio::task::JoinError>) {
    match result {
        Ok(TaskOutcome::Completed) => stats.completed += 1,
        Ok(TaskOutcome::Skipped) => stats.skipped += 1,
        Ok(TaskOutcome::Failed) => stats.failed += 1,
        Ok(TaskOutcome::Requeued) => stats.requeued += 1,
        Err(join_err) => {
            warn!(error = %join_err, "scheduler worker task panicked");
        }
    }
}
