//! Millisecond clocks.
//!
//! The pool core takes `now` as an argument; actors read it from a
//! [`Clock`]. [`TokioClock`] follows tokio's time source, so tests running
//! with a paused runtime see time move only when they advance it.

use lifeline_core::current_timestamp_ms;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Source of millisecond timestamps
pub trait Clock: Send + Sync + fmt::Debug {
    /// Current time in milliseconds
    fn now_ms(&self) -> u64;
}

/// Shared clock handle
pub type SharedClock = Arc<dyn Clock>;

/// Wall-clock anchored, tokio-driven clock
#[derive(Debug, Clone)]
pub struct TokioClock {
    origin: Instant,
    base_ms: u64,
}

impl TokioClock {
    /// Anchor at the current wall-clock time
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            base_ms: current_timestamp_ms(),
        }
    }

    /// Anchor at an explicit timestamp
    pub fn starting_at(base_ms: u64) -> Self {
        Self {
            origin: Instant::now(),
            base_ms,
        }
    }

    /// Shareable handle
    pub fn shared() -> SharedClock {
        Arc::new(Self::new())
    }
}

impl Default for TokioClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TokioClock {
    fn now_ms(&self) -> u64 {
        self.base_ms + self.origin.elapsed().as_millis() as u64
    }
}

/// Clock that only moves when told to
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    /// Start at `now_ms`
    pub fn new(now_ms: u64) -> Arc<Self> {
        Arc::new(Self {
            now: AtomicU64::new(now_ms),
        })
    }

    /// Move forward by `ms`
    pub fn advance(&self, ms: u64) {
        self.now.fetch_add(ms, Ordering::SeqCst);
    }

    /// Jump to `now_ms`
    pub fn set(&self, now_ms: u64) {
        self.now.store(now_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Periodic tick that does not burst after a stall
pub fn ticker(period: Duration) -> Interval {
    let mut interval = tokio::time::interval(period.max(Duration::from_millis(1)));
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

/// Cancellable periodic loop driver.
///
/// ```ignore
/// let mut ticker = Ticker::new(Duration::from_secs(1), token.clone());
/// while ticker.tick().await {
///     health_check().await;
/// }
/// ```
#[derive(Debug)]
pub struct Ticker {
    interval: Interval,
    shutdown: CancellationToken,
}

impl Ticker {
    /// Tick every `period` until `shutdown` is cancelled
    pub fn new(period: Duration, shutdown: CancellationToken) -> Self {
        Self {
            interval: ticker(period),
            shutdown,
        }
    }

    /// Wait for the next tick; `false` once cancelled
    pub async fn tick(&mut self) -> bool {
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => false,
            _ = self.interval.tick() => true,
        }
    }
}
