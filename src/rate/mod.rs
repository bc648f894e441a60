//! Per-channel token-bucket admission control (C1, §4.1).
//!
//! Generalizes a per-domain fixed-delay limiter into one continuously
//! refilling token bucket per logical [`Channel`], with adaptive feedback on
//! 429/503 responses. `model-file`/`image-file` channels carry no per-request
//! token limit (§4.1) — their concurrency is governed by the Scheduler's
//! pipeline semaphores instead, so `acquire` is a no-op for them.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::instrument;

/// A logical rate-limit bucket (§4.1, GLOSSARY "Channel").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    ModelApi,
    ImageApi,
    ModelFile,
    ImageFile,
}

impl Channel {
    fn defaults(self) -> Option<(f64, f64)> {
        match self {
            // (tokens/sec, burst)
            Self::ModelApi => Some((0.5, 1.0)),
            Self::ImageApi => Some((2.0, 4.0)),
            Self::ModelFile | Self::ImageFile => None,
        }
    }
}

/// Restoration factor applied per minute of clean traffic after a 429/503 halving (§4.1).
const RESTORE_FACTOR_PER_MINUTE: f64 = 1.25;

struct BucketState {
    /// Configured (never-degraded) ceiling rate, tokens/sec.
    base_rate: f64,
    /// Current rate, which may be halved under sustained 429/503 pressure.
    current_rate: f64,
    capacity: f64,
    tokens: f64,
    last_update: Instant,
}

impl BucketState {
    fn new(base_rate: f64, capacity: f64) -> Self {
        Self {
            base_rate,
            current_rate: base_rate,
            capacity,
            tokens: capacity,
            last_update: Instant::now(),
        }
    }

    /// Advances the continuous refill/restore model to `now` without consuming a token.
    fn advance(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_update);
        let elapsed_secs = elapsed.as_secs_f64();
        if elapsed_secs <= 0.0 {
            return;
        }

        if self.current_rate < self.base_rate {
            let elapsed_minutes = elapsed_secs / 60.0;
            let restored = self.current_rate * RESTORE_FACTOR_PER_MINUTE.powf(elapsed_minutes);
            self.current_rate = restored.min(self.base_rate);
        }

        self.tokens = (self.tokens + elapsed_secs * self.current_rate).min(self.capacity);
        self.last_update = now;
    }

    /// Returns the wait needed before a token is available, consuming it once ready.
    fn acquire_delay(&mut self) -> Duration {
        let now = Instant::now();
        self.advance(now);

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            return Duration::ZERO;
        }

        let deficit = 1.0 - self.tokens;
        let rate = self.current_rate.max(f64::MIN_POSITIVE);
        let wait = Duration::from_secs_f64(deficit / rate);
        self.tokens = 0.0;
        wait
    }

    fn degrade(&mut self) {
        self.current_rate = (self.current_rate * 0.5).max(self.base_rate * 0.01);
    }
}

/// Shared, process-wide rate governor (§9 "Global mutable state").
#[derive(Debug, Clone, Default)]
pub struct RateGovernor {
    buckets: Arc<DashMap<Channel, Arc<Mutex<BucketState>>>>,
}

impl RateGovernor {
    /// Creates a governor with the spec defaults (§4.1); `overrides` replaces a channel's
    /// `(rate, burst)` when present, modeling `rate.model_api_rps`/`rate.image_api_rps` config.
    #[must_use]
    pub fn new(overrides: &[(Channel, f64, f64)]) -> Self {
        let governor = Self::default();
        for channel in [Channel::ModelApi, Channel::ImageApi] {
            let (rate, burst) = overrides
                .iter()
                .find(|(c, _, _)| *c == channel)
                .map(|(_, r, b)| (*r, *b))
                .or_else(|| channel.defaults())
                .unwrap_or((1.0, 1.0));
            governor
                .buckets
                .insert(channel, Arc::new(Mutex::new(BucketState::new(rate, burst))));
        }
        governor
    }

    /// Waits until a token is available for `channel`, then consumes one.
    ///
    /// A no-op for channels with no per-request token limit (`ModelFile`/`ImageFile`).
    #[instrument(skip(self))]
    pub async fn acquire(&self, channel: Channel) {
        let Some(bucket) = self.buckets.get(&channel) else {
            return;
        };
        let bucket = Arc::clone(&bucket);
        let wait = {
            let mut state = bucket.lock().await;
            state.acquire_delay()
        };
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
    }

    /// Records an HTTP 429/503 on `channel`, halving its current rate (§4.1).
    #[instrument(skip(self))]
    pub async fn record_rate_limited(&self, channel: Channel) {
        if let Some(bucket) = self.buckets.get(&channel) {
            let mut state = bucket.lock().await;
            state.advance(Instant::now());
            state.degrade();
        }
    }

    /// Returns the current effective rate for a channel, for tests and `pipeline.stats` events.
    pub async fn current_rate(&self, channel: Channel) -> Option<f64> {
        if let Some(bucket) = self.buckets.get(&channel) {
            let mut state = bucket.lock().await;
            state.advance(Instant::now());
            Some(state.current_rate)
        } else {
            None
        }
    }
}
