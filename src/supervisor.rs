//! Recovery Supervisor (C11, §4.11): watches the rolling failure rate and degrades gracefully.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{error, info, warn};

use crate::events::{Event, EventSink};
use crate::queue::{TaskStatus, TaskStore};
use crate::rate::{Channel, RateGovernor};
use crate::scheduler::{Scheduler, TaskPayload};

/// Window over which failure/timeout rates are computed (§4.11).
const WINDOW: Duration = Duration::from_secs(60);
const TIMEOUT_RATE_THRESHOLD: f64 = 0.01;
const SUSTAINED_ERROR_RATE_THRESHOLD: f64 = 0.05;
const SUSTAINED_MINUTES_THRESHOLD: u32 = 3;
const CRITICAL_ERROR_RATE_THRESHOLD: f64 = 0.20;
const MAX_CONSECUTIVE_FAILURES: u32 = 3;

#[derive(Debug, Clone, Copy)]
struct Outcome {
    timed_out: bool,
    failed: bool,
}

/// Rolling observation window plus the consecutive-minute counters the triggers need.
#[derive(Debug, Default)]
pub struct RecoverySupervisor {
    observations: VecDeque<(std::time::Instant, Outcome)>,
    consecutive_failures: u32,
    sustained_error_minutes: u32,
    last_minute_mark: Option<std::time::Instant>,
}

impl RecoverySupervisor {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one task outcome (§4.11).
    pub fn record(&mut self, timed_out: bool, failed: bool) {
        let now = std::time::Instant::now();
        self.observations.push_back((now, Outcome { timed_out, failed }));
        self.prune(now);

        if failed {
            self.consecutive_failures += 1;
        } else {
            self.consecutive_failures = 0;
        }
    }

    fn prune(&mut self, now: std::time::Instant) {
        while let Some((ts, _)) = self.observations.front() {
            if now.saturating_duration_since(*ts) > WINDOW {
                self.observations.pop_front();
            } else {
                break;
            }
        }
    }

    fn timeout_rate(&self) -> f64 {
        rate(&self.observations, |o| o.timed_out)
    }

    fn error_rate(&self) -> f64 {
        rate(&self.observations, |o| o.failed)
    }

    #[must_use]
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Evaluates the current window against the triggers in §4.11, applying side effects to
    /// `rate` and `scheduler`, and returns whatever event fired (for the caller's log/UI).
    pub async fn evaluate(
        &mut self,
        channel: Channel,
        rate: &RateGovernor,
        scheduler: &Scheduler,
        events: &EventSink,
    ) {
        if self.timeout_rate() > TIMEOUT_RATE_THRESHOLD {
            rate.record_rate_limited(channel).await;
            warn!(channel = ?channel, rate = self.timeout_rate(), "timeout rate exceeded threshold, halving channel rate");
        }

        let error_rate = self.error_rate();
        let now = std::time::Instant::now();
        if error_rate > SUSTAINED_ERROR_RATE_THRESHOLD {
            let elapsed_since_mark = self
                .last_minute_mark
                .map_or(Duration::MAX, |mark| now.saturating_duration_since(mark));
            if elapsed_since_mark >= Duration::from_secs(60) || self.last_minute_mark.is_none() {
                self.sustained_error_minutes += 1;
                self.last_minute_mark = Some(now);
            }
        } else {
            self.sustained_error_minutes = 0;
            self.last_minute_mark = None;
        }

        if self.sustained_error_minutes >= SUSTAINED_MINUTES_THRESHOLD && !scheduler.is_hybrid_safe_mode() {
            scheduler.set_hybrid_safe_mode(true);
            info!(error_rate, "entering hybrid safe mode after sustained error rate");
        }

        if error_rate > CRITICAL_ERROR_RATE_THRESHOLD
            || self.consecutive_failures >= MAX_CONSECUTIVE_FAILURES
        {
            if !scheduler.is_global_halt() {
                error!(error_rate, consecutive_failures = self.consecutive_failures, "CRITICAL: halting all pipelines");
                events.emit(Event::SupervisorModeChanged {
                    from: "running".to_string(),
                    to: "global_halt".to_string(),
                    reason: "error rate or consecutive-failure threshold exceeded".to_string(),
                });
            }
            scheduler.set_global_halt(true);
        }
    }
}

fn rate(observations: &VecDeque<(std::time::Instant, Outcome)>, pred: impl Fn(&Outcome) -> bool) -> f64 {
    if observations.is_empty() {
        return 0.0;
    }
    let hits = observations.iter().filter(|(_, o)| pred(o)).count();
    hits as f64 / observations.len() as f64
}

/// Scans the destination tree for orphaned `.tmp` files at startup (§4.11) and either
/// re-enqueues them with a resume offset or deletes them.
///
/// # Errors
/// Returns an I/O error if the tree cannot be walked, or a Task Store error if re-enqueueing
/// fails.
pub async fn recover_orphan_tmp_files(
    root: &Path,
    store: &TaskStore,
) -> std::io::Result<RecoveryReport> {
    let mut report = RecoveryReport::default();
    let mut stack = vec![root.to_path_buf()];

    while let Some(dir) = stack.pop() {
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(_) => continue,
        };

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                stack.push(path);
                continue;
            }
            if path.extension().and_then(|e| e.to_str()) != Some("tmp") {
                continue;
            }
            handle_orphan(&path, store, &mut report).await;
        }
    }

    Ok(report)
}

async fn handle_orphan(path: &Path, store: &TaskStore, report: &mut RecoveryReport) {
    let Ok(metadata) = tokio::fs::metadata(path).await else {
        return;
    };

    if metadata.len() == 0 {
        if tokio::fs::remove_file(path).await.is_ok() {
            report.deleted += 1;
        }
        return;
    }

    let final_path = final_path_for_tmp(path);
    let dest = final_path.to_string_lossy().into_owned();

    // No declared size is recoverable from a bare `.tmp` file alone; leave the orphan in
    // place for a future owning task to resume into, rather than guessing a size.
    let existing = store
        .list_by_status(TaskStatus::Pending)
        .await
        .unwrap_or_default();
    let owned = existing.iter().any(|t| {
        t.target_path.as_deref() == Some(dest.as_str())
    });

    if owned {
        report.left_for_resume += 1;
        return;
    }

    if tokio::fs::remove_file(path).await.is_ok() {
        report.deleted += 1;
    }
}

fn final_path_for_tmp(tmp_path: &Path) -> PathBuf {
    match tmp_path.to_str().and_then(|s| s.strip_suffix(".tmp")) {
        Some(stripped) => PathBuf::from(stripped),
        None => tmp_path.to_path_buf(),
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct RecoveryReport {
    pub deleted: u64,
    pub left_for_resume: u64,
}

/// Checks whether the emergency-stop sentinel exists (§6.3, §7).
#[must_use]
pub fn emergency_stop_requested(state_dir: &Path) -> bool {
    state_dir.join("emergency_stop").exists()
}
