//! Composite channel quality scoring.
//!
//! A [`QualityMonitor`] folds every exchange outcome into four sub-metrics
//! and recomputes the weighted score on each report:
//!
//! ```text
//! overall = w_r * reliability
//!         + w_t * throughput
//!         + w_l * (1 - normalized_latency)
//!         + w_e * (1 - error_rate)
//! ```
//!
//! Reliability, throughput and latency are exponential moving averages whose
//! first sample seeds the average. Error rate is the failure fraction over a
//! bounded window of recent outcomes. Every input is sanitized so the score
//! stays finite and inside `[0, 1]` no matter what the transport reports.

use lifeline_core::{PoolConfig, QualityWeights};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Reliability assumed before the first exchange
const NEUTRAL_RELIABILITY: f64 = 0.5;

/// Exponential moving average seeded by its first sample.
#[derive(Debug, Clone, Copy)]
pub struct Ewma {
    alpha: f64,
    value: Option<f64>,
}

impl Ewma {
    /// New average with smoothing factor `alpha` (clamped to `(0, 1]`)
    pub fn new(alpha: f64) -> Self {
        let alpha = if alpha.is_finite() { alpha.clamp(f64::EPSILON, 1.0) } else { 1.0 };
        Self { alpha, value: None }
    }

    /// Fold one sample in; non-finite samples are ignored
    pub fn update(&mut self, sample: f64) {
        if !sample.is_finite() {
            return;
        }
        self.value = Some(match self.value {
            None => sample,
            Some(current) => self.alpha * sample + (1.0 - self.alpha) * current,
        });
    }

    /// Current value, if any sample was seen
    pub fn value(&self) -> Option<f64> {
        self.value
    }

    /// Current value or `default`
    pub fn value_or(&self, default: f64) -> f64 {
        self.value.unwrap_or(default)
    }
}

/// Immutable view of a channel's quality sub-metrics.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QualityMetrics {
    /// Delivery reliability EWMA (0..1)
    pub reliability: f64,
    /// Normalized throughput EWMA (0..1)
    pub throughput: f64,
    /// Latency EWMA in milliseconds
    pub latency_ms: f64,
    /// Failure fraction over the rolling window (0..1)
    pub error_rate: f64,
    /// EWMA of absolute latency deviation in milliseconds
    pub latency_jitter_ms: f64,
    /// Composite score (0..1)
    pub score: f64,
    /// Number of outcomes folded in so far
    pub samples: u64,
}

/// Per-channel quality monitor.
#[derive(Debug, Clone)]
pub struct QualityMonitor {
    weights: QualityWeights,
    latency_ceiling_ms: f64,
    throughput_reference_bps: f64,
    window: usize,
    reliability: Ewma,
    throughput: Ewma,
    latency_ms: Ewma,
    latency_jitter_ms: Ewma,
    outcomes: VecDeque<bool>,
    samples: u64,
    score: f64,
}

impl QualityMonitor {
    /// Create a monitor from pool tuning and score weights
    pub fn new(config: &PoolConfig, weights: &QualityWeights) -> Self {
        let mut monitor = Self {
            weights: weights.normalized(),
            latency_ceiling_ms: sanitize_positive(config.latency_ceiling_ms, 2_000.0),
            throughput_reference_bps: sanitize_positive(config.throughput_reference_bps, 16_384.0),
            window: config.error_window.max(1),
            reliability: Ewma::new(config.ewma_alpha),
            throughput: Ewma::new(config.ewma_alpha),
            latency_ms: Ewma::new(config.ewma_alpha),
            latency_jitter_ms: Ewma::new(config.ewma_alpha),
            outcomes: VecDeque::with_capacity(config.error_window.max(1)),
            samples: 0,
            score: 0.0,
        };
        monitor.recompute();
        monitor
    }

    /// Record a clean exchange
    pub fn record_success(&mut self, latency_ms: f64, bytes: u64) {
        let latency = self.sanitize_latency(latency_ms);

        let throughput = if latency > 0.0 {
            (bytes as f64 * 1_000.0 / latency) / self.throughput_reference_bps
        } else if bytes > 0 {
            1.0
        } else {
            0.0
        };

        if let Some(previous) = self.latency_ms.value() {
            self.latency_jitter_ms.update((latency - previous).abs());
        }
        self.latency_ms.update(latency);
        self.throughput.update(throughput.clamp(0.0, 1.0));
        self.reliability.update(1.0);
        self.push_outcome(true);
        self.recompute();
    }

    /// Fold received traffic into throughput only; `interval_ms` is the
    /// time since the previous activity on the channel
    pub fn record_inbound(&mut self, bytes: u64, interval_ms: u64) {
        let rate = bytes as f64 * 1_000.0 / interval_ms.max(1) as f64;
        self.throughput
            .update((rate / self.throughput_reference_bps).clamp(0.0, 1.0));
        self.recompute();
    }

    /// Record a failed exchange; timeouts also count as a ceiling-latency sample
    pub fn record_failure(&mut self, timed_out: bool) {
        if timed_out {
            let ceiling = self.latency_ceiling_ms;
            if let Some(previous) = self.latency_ms.value() {
                self.latency_jitter_ms.update((ceiling - previous).abs());
            }
            self.latency_ms.update(ceiling);
        }
        self.throughput.update(0.0);
        self.reliability.update(0.0);
        self.push_outcome(false);
        self.recompute();
    }

    /// Recompute the composite score from the current sub-metrics
    pub fn recompute(&mut self) -> f64 {
        let w = &self.weights;
        let raw = w.reliability * self.reliability()
            + w.throughput * self.throughput()
            + w.latency * (1.0 - self.normalized_latency())
            + w.error_rate * (1.0 - self.error_rate());
        self.score = if raw.is_finite() { raw.clamp(0.0, 1.0) } else { 0.0 };
        self.score
    }

    /// Composite score in `[0, 1]`
    pub fn score(&self) -> f64 {
        self.score
    }

    /// Reliability EWMA
    pub fn reliability(&self) -> f64 {
        self.reliability.value_or(NEUTRAL_RELIABILITY).clamp(0.0, 1.0)
    }

    /// Normalized throughput EWMA
    pub fn throughput(&self) -> f64 {
        self.throughput.value_or(0.0).clamp(0.0, 1.0)
    }

    /// Latency EWMA in milliseconds
    pub fn latency_ms(&self) -> f64 {
        self.latency_ms.value_or(0.0)
    }

    /// Latency normalized against the configured ceiling
    pub fn normalized_latency(&self) -> f64 {
        (self.latency_ms() / self.latency_ceiling_ms).clamp(0.0, 1.0)
    }

    /// Failure fraction over the rolling window
    pub fn error_rate(&self) -> f64 {
        if self.outcomes.is_empty() {
            return 0.0;
        }
        let failures = self.outcomes.iter().filter(|ok| !**ok).count();
        failures as f64 / self.outcomes.len() as f64
    }

    /// Snapshot of every sub-metric
    pub fn metrics(&self) -> QualityMetrics {
        QualityMetrics {
            reliability: self.reliability(),
            throughput: self.throughput(),
            latency_ms: self.latency_ms(),
            error_rate: self.error_rate(),
            latency_jitter_ms: self.latency_jitter_ms.value_or(0.0),
            score: self.score,
            samples: self.samples,
        }
    }

    fn push_outcome(&mut self, ok: bool) {
        if self.outcomes.len() == self.window {
            self.outcomes.pop_front();
        }
        self.outcomes.push_back(ok);
        self.samples = self.samples.saturating_add(1);
    }

    fn sanitize_latency(&self, latency_ms: f64) -> f64 {
        if latency_ms.is_finite() && latency_ms >= 0.0 {
            latency_ms
        } else {
            self.latency_ceiling_ms
        }
    }
}

fn sanitize_positive(value: f64, fallback: f64) -> f64 {
    if value.is_finite() && value > 0.0 {
        value
    } else {
        fallback
    }
}
