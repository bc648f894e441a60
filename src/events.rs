//! Progress/Event Emitter (C12, §4.12): structured events for a caller-provided sink.
//!
//! Every event is also mirrored through `tracing` at an appropriate level so a plain
//! log tail carries the same audit trail without a sink attached.

use tokio::sync::mpsc;
use tracing::{info, warn};

/// A structured event describing download-engine and scheduler activity (§4.12).
#[derive(Debug, Clone)]
pub enum Event {
    DownloadStarted {
        task_id: String,
        kind: String,
        url: String,
        destination: String,
    },
    DownloadProgress {
        task_id: String,
        bytes_completed: u64,
        bytes_total: Option<u64>,
    },
    DownloadCompleted {
        task_id: String,
        bytes: u64,
        duration_s: f64,
        throughput_mbps: f64,
    },
    DownloadFailed {
        task_id: String,
        error_class: String,
        message: String,
        attempt: u32,
    },
    PipelineStats {
        pipeline: String,
        active: usize,
        queued: i64,
        throughput_mbps: f64,
        error_rate: f64,
    },
    SupervisorModeChanged {
        from: String,
        to: String,
        reason: String,
    },
}

/// Sink half of the event channel; clone freely, every clone feeds the same receiver.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<Event>,
}

impl EventSink {
    /// Emits an event to the sink and mirrors it into the tracing audit trail.
    pub fn emit(&self, event: Event) {
        audit_log(&event);
        // A closed receiver (no one is listening) is not an error for the emitter.
        let _ = self.tx.send(event);
    }
}

/// Creates a channel pair: an [`EventSink`] for producers and a receiver for the caller.
#[must_use]
pub fn channel() -> (EventSink, mpsc::UnboundedReceiver<Event>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (EventSink { tx }, rx)
}

fn audit_log(event: &Event) {
    match event {
        Event::DownloadStarted {
            task_id,
            kind,
            url,
            destination,
        } => info!(task_id, kind, url, destination, "download.started"),
        Event::DownloadProgress {
            task_id,
            bytes_completed,
            bytes_total,
        } => tracing::debug!(task_id, bytes_completed, ?bytes_total, "download.progress"),
        Event::DownloadCompleted {
            task_id,
            bytes,
            duration_s,
            throughput_mbps,
        } => info!(
            task_id,
            bytes, duration_s, throughput_mbps, "download.completed"
        ),
        Event::DownloadFailed {
            task_id,
            error_class,
            message,
            attempt,
        } => warn!(task_id, error_class, message, attempt, "download.failed"),
        Event::PipelineStats {
            pipeline,
            active,
            queued,
            throughput_mbps,
            error_rate,
        } => info!(
            pipeline,
            active, queued, throughput_mbps, error_rate, "pipeline.stats"
        ),
        Event::SupervisorModeChanged { from, to, reason } => {
            warn!(from, to, reason, "supervisor.mode_changed")
        }
    }
}
