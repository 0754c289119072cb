//! Resource-exhaustion throttling.
//!
//! Once any of CPU, memory or network utilization crosses the critical
//! threshold, operations are metered through a token bucket until it drops
//! back under the recovery threshold. Exhaustion that outlasts the grace
//! period asks for one subsystem reset per episode.

use crate::handler::{Decision, EdgeCaseHandler, EdgeEvent, ResourceSample};
use lifeline_core::ExhaustionConfig;
use lifeline_mesh::Intent;
use tracing::{info, warn};

/// Handler name
pub const NAME: &str = "resource_exhaustion";

/// Token bucket driven by millisecond timestamps
#[derive(Debug, Clone)]
pub struct TokenBucket {
    tokens: f64,
    capacity: f64,
    refill_per_ms: f64,
    last_update: u64,
}

impl TokenBucket {
    /// Bucket of `capacity` tokens refilled at `per_second`
    pub fn new(capacity: f64, per_second: f64, now: u64) -> Self {
        let capacity = if capacity.is_finite() { capacity.max(1.0) } else { 1.0 };
        let per_second = if per_second.is_finite() { per_second.max(0.0) } else { 0.0 };
        Self {
            tokens: capacity,
            capacity,
            refill_per_ms: per_second / 1_000.0,
            last_update: now,
        }
    }

    fn refill(&mut self, now: u64) {
        let elapsed = now.saturating_sub(self.last_update) as f64;
        self.tokens = (self.tokens + elapsed * self.refill_per_ms).min(self.capacity);
        self.last_update = self.last_update.max(now);
    }

    /// Take one token, or report how long until one is available
    pub fn try_take(&mut self, now: u64) -> Result<(), u64> {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            return Ok(());
        }
        if self.refill_per_ms <= 0.0 {
            return Err(u64::MAX);
        }
        let missing = 1.0 - self.tokens;
        Err((missing / self.refill_per_ms).ceil() as u64)
    }

    /// Return one token taken by [`try_take`](Self::try_take)
    pub fn give_back(&mut self) {
        self.tokens = (self.tokens + 1.0).min(self.capacity);
    }

    /// Tokens available at `now`
    pub fn available(&mut self, now: u64) -> f64 {
        self.refill(now);
        self.tokens
    }
}

#[derive(Debug)]
struct Episode {
    started_at: u64,
    bucket: TokenBucket,
    /// Tokens handed out this episode
    outstanding: u64,
    reset_requested: bool,
}

/// Throttles operations while a resource is exhausted
#[derive(Debug)]
pub struct ResourceExhaustion {
    config: ExhaustionConfig,
    episode: Option<Episode>,
    last_sample: ResourceSample,
    last_reset_at: Option<u64>,
    throttled: u64,
}

impl ResourceExhaustion {
    /// Build from tuning
    pub fn new(config: &ExhaustionConfig) -> Self {
        Self {
            config: config.clone(),
            episode: None,
            last_sample: ResourceSample::default(),
            last_reset_at: None,
            throttled: 0,
        }
    }

    /// Whether an exhaustion episode is in progress
    pub fn is_exhausted(&self) -> bool {
        self.episode.is_some()
    }

    /// Operations throttled so far
    pub fn throttled(&self) -> u64 {
        self.throttled
    }

    fn maybe_reset(&mut self, now: u64) -> Option<Intent> {
        let grace = self.config.grace_period_ms;
        let cooldown = self.config.reset_cooldown_ms;
        let cooled_down = self
            .last_reset_at
            .map_or(true, |at| now.saturating_sub(at) >= cooldown);
        let episode = self.episode.as_mut()?;
        if episode.reset_requested || now.saturating_sub(episode.started_at) < grace || !cooled_down {
            return None;
        }

        episode.reset_requested = true;
        self.last_reset_at = Some(now);
        let sample = self.last_sample;
        warn!(
            cpu = sample.cpu,
            memory = sample.memory,
            network = sample.network,
            exhausted_ms = now.saturating_sub(episode.started_at),
            "Sustained resource exhaustion; requesting subsystem reset"
        );
        Some(Intent::ResetSubsystem {
            reason: format!(
                "resource exhaustion for {}ms (cpu {:.2}, memory {:.2}, network {:.2})",
                now.saturating_sub(episode.started_at),
                sample.cpu,
                sample.memory,
                sample.network
            ),
        })
    }
}

impl EdgeCaseHandler for ResourceExhaustion {
    fn name(&self) -> &'static str {
        NAME
    }

    fn should_allow(&mut self, event: &EdgeEvent, now: u64) -> Decision {
        if !matches!(event, EdgeEvent::Operation { .. } | EdgeEvent::ConnectAttempt { .. }) {
            return Decision::allow();
        }
        let Some(episode) = self.episode.as_mut() else {
            return Decision::allow();
        };
        match episode.bucket.try_take(now) {
            Ok(()) => {
                episode.outstanding += 1;
                Decision::allow()
            }
            Err(wait_ms) => {
                self.throttled += 1;
                Decision::defer(wait_ms)
            }
        }
    }

    fn release(&mut self, event: &EdgeEvent, _now: u64) {
        if !matches!(event, EdgeEvent::Operation { .. } | EdgeEvent::ConnectAttempt { .. }) {
            return;
        }
        if let Some(episode) = self.episode.as_mut().filter(|e| e.outstanding > 0) {
            episode.outstanding -= 1;
            episode.bucket.give_back();
        }
    }

    fn observe(&mut self, event: &EdgeEvent, now: u64) -> Vec<Intent> {
        let EdgeEvent::ResourceUsage(sample) = event else {
            return Vec::new();
        };
        self.last_sample = *sample;
        let peak = sample.peak();

        match &self.episode {
            None if peak >= self.config.critical_threshold => {
                let rate = self.config.throttled_ops_per_sec;
                self.episode = Some(Episode {
                    started_at: now,
                    bucket: TokenBucket::new(rate, rate, now),
                    outstanding: 0,
                    reset_requested: false,
                });
                warn!(peak, ops_per_sec = rate, "Resource exhaustion; throttling operations");
            }
            Some(episode) if peak < self.config.recovery_threshold => {
                info!(
                    peak,
                    exhausted_ms = now.saturating_sub(episode.started_at),
                    "Resource exhaustion cleared"
                );
                self.episode = None;
            }
            _ => {}
        }
        self.maybe_reset(now).into_iter().collect()
    }

    fn tick(&mut self, now: u64) -> Vec<Intent> {
        self.maybe_reset(now).into_iter().collect()
    }

    fn active_actions(&self, _now: u64) -> Vec<String> {
        match &self.episode {
            Some(episode) => vec![format!(
                "throttling to {} ops/s since {}{}",
                self.config.throttled_ops_per_sec,
                episode.started_at,
                if episode.reset_requested { "; subsystem reset requested" } else { "" }
            )],
            None => Vec::new(),
        }
    }

    fn reset(&mut self) {
        self.episode = None;
        self.throttled = 0;
    }
}
