//! Base-Model Filter (C7, §4.7): an opt-in whitelist gate on version `baseModel`.

use crate::events::{Event, EventSink};
use crate::model::Version;

/// Filters versions by a case-insensitive substring match against `baseModel`.
///
/// An empty whitelist disables filtering entirely (every version is admitted).
#[derive(Debug, Clone)]
pub struct BaseModelFilter {
    whitelist: Vec<String>,
    accepted: u64,
    rejected: u64,
}

impl BaseModelFilter {
    /// `whitelist` entries are matched lowercase; pass an empty slice to disable filtering.
    #[must_use]
    pub fn new(whitelist: &[String]) -> Self {
        Self {
            whitelist: whitelist.iter().map(|s| s.to_ascii_lowercase()).collect(),
            accepted: 0,
            rejected: 0,
        }
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        !self.whitelist.is_empty()
    }

    /// Decides whether `version` is admitted (§4.7): versions missing `baseModel` are
    /// rejected while filtering is active.
    pub fn admits(&mut self, version: &Version) -> bool {
        if !self.is_active() {
            self.accepted += 1;
            return true;
        }

        let admitted = match &version.base_model {
            Some(base_model) => {
                let lower = base_model.to_ascii_lowercase();
                self.whitelist.iter().any(|entry| lower.contains(entry.as_str()))
            }
            None => false,
        };

        if admitted {
            self.accepted += 1;
        } else {
            self.rejected += 1;
        }
        admitted
    }

    #[must_use]
    pub fn accepted(&self) -> u64 {
        self.accepted
    }

    #[must_use]
    pub fn rejected(&self) -> u64 {
        self.rejected
    }

    /// Emits the running accepted/rejected tally as a `pipeline.stats` event (§4.7).
    pub fn emit_stats(&self, events: &EventSink) {
        events.emit(Event::PipelineStats {
            pipeline: "filter".to_string(),
            active: 0,
            queued: 0,
            throughput_mbps: 0.0,
            error_rate: self.rejection_rate(),
        });
    }

    fn rejection_rate(&self) -> f64 {
        let total = self.accepted + self.rejected;
        if total == 0 {
            0.0
        } else {
            self.rejected as f64 / total as f64
        }
    }
}

/// Parses a whitelist file (§6.2): UTF-8, one entry per line, blank lines and `#`-prefixed
/// comments ignored.
#[must_use]
pub fn parse_whitelist_file(contents: &str) -> Vec<String> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect()
}
