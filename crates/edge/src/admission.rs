//! Concurrent-operation admission control.
//!
//! [`AdmissionGate`] bounds how many operations are in flight. Waiters queue
//! in FIFO order on a tokio semaphore and give up after the configured
//! timeout. The limit adapts: permits are parked inside the gate to shrink
//! it and handed back to grow it, so no admitted operation is ever revoked.

use crate::error::{EdgeError, EdgeResult};
use crate::handler::{Decision, EdgeCaseHandler, EdgeEvent};
use lifeline_core::{AdmissionConfig, ResilienceConfig};
use lifeline_mesh::Intent;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

/// Handler name
pub const NAME: &str = "admission_control";

#[derive(Debug, Default)]
struct GateCounters {
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    waiting: AtomicUsize,
    admitted: AtomicU64,
    rejected: AtomicU64,
}

#[derive(Debug)]
struct Limit {
    current: usize,
    target: usize,
    parked: Vec<OwnedSemaphorePermit>,
}

/// Point-in-time gate statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdmissionStats {
    /// Limit currently enforced
    pub limit: usize,
    /// Configured ceiling
    pub max_limit: usize,
    /// Operations holding a permit
    pub in_flight: usize,
    /// Highest in-flight count seen
    pub peak_in_flight: usize,
    /// Callers queued for a permit
    pub waiting: usize,
    /// Permits granted so far
    pub admitted: u64,
    /// Requests that timed out in the queue
    pub rejected: u64,
}

/// Bounded, FIFO admission with an adjustable limit
#[derive(Debug)]
pub struct AdmissionGate {
    semaphore: Arc<Semaphore>,
    counters: Arc<GateCounters>,
    limit: Mutex<Limit>,
    max_limit: usize,
    min_limit: usize,
    acquire_timeout: Duration,
}

/// Held while an admitted operation runs; dropping it frees the slot
#[derive(Debug)]
pub struct AdmissionPermit {
    _permit: OwnedSemaphorePermit,
    counters: Arc<GateCounters>,
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        self.counters.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

struct WaitGuard<'a>(&'a GateCounters);

impl<'a> WaitGuard<'a> {
    fn enter(counters: &'a GateCounters) -> Self {
        counters.waiting.fetch_add(1, Ordering::SeqCst);
        Self(counters)
    }
}

impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        self.0.waiting.fetch_sub(1, Ordering::SeqCst);
    }
}

impl AdmissionGate {
    /// Gate allowing `max_limit` concurrent operations
    pub fn new(max_limit: usize, config: &AdmissionConfig) -> Self {
        let max_limit = max_limit.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(max_limit)),
            counters: Arc::new(GateCounters::default()),
            limit: Mutex::new(Limit {
                current: max_limit,
                target: max_limit,
                parked: Vec::new(),
            }),
            max_limit,
            min_limit: config.min_limit.clamp(1, max_limit),
            acquire_timeout: Duration::from_millis(config.acquire_timeout_ms),
        }
    }

    /// Gate sized from the full configuration
    pub fn from_config(config: &ResilienceConfig) -> Arc<Self> {
        Arc::new(Self::new(config.max_concurrent_operations, &config.edge.admission))
    }

    /// Wait in line for a permit, up to the configured timeout
    pub async fn acquire(&self) -> EdgeResult<AdmissionPermit> {
        self.acquire_within(self.acquire_timeout).await
    }

    /// Wait in line for a permit, up to `wait`
    pub async fn acquire_within(&self, wait: Duration) -> EdgeResult<AdmissionPermit> {
        let permit = {
            let _waiting = WaitGuard::enter(&self.counters);
            tokio::time::timeout(wait, self.semaphore.clone().acquire_owned()).await
        };
        match permit {
            Ok(Ok(permit)) => Ok(self.admit(permit)),
            Ok(Err(_)) => Err(EdgeError::Shutdown("admission gate closed".to_string())),
            Err(_) => {
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                debug!(waited_ms = wait.as_millis() as u64, "Admission timed out");
                Err(EdgeError::AdmissionTimeout {
                    waited_ms: wait.as_millis() as u64,
                })
            }
        }
    }

    /// Take a permit only if one is free right now
    pub fn try_acquire(&self) -> Option<AdmissionPermit> {
        self.semaphore
            .clone()
            .try_acquire_owned()
            .ok()
            .map(|permit| self.admit(permit))
    }

    fn admit(&self, permit: OwnedSemaphorePermit) -> AdmissionPermit {
        let now_in_flight = self.counters.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters
            .peak_in_flight
            .fetch_max(now_in_flight, Ordering::SeqCst);
        self.counters.admitted.fetch_add(1, Ordering::Relaxed);
        AdmissionPermit {
            _permit: permit,
            counters: Arc::clone(&self.counters),
        }
    }

    /// Limit currently enforced
    pub fn limit(&self) -> usize {
        self.limit.lock().current
    }

    /// Configured ceiling
    pub fn max_limit(&self) -> usize {
        self.max_limit
    }

    /// Floor for the adaptive limit
    pub fn min_limit(&self) -> usize {
        self.min_limit
    }

    /// Operations holding a permit
    pub fn in_flight(&self) -> usize {
        self.counters.in_flight.load(Ordering::SeqCst)
    }

    /// Callers waiting for a permit
    pub fn waiting(&self) -> usize {
        self.counters.waiting.load(Ordering::SeqCst)
    }

    /// Snapshot of gate statistics
    pub fn stats(&self) -> AdmissionStats {
        AdmissionStats {
            limit: self.limit(),
            max_limit: self.max_limit,
            in_flight: self.in_flight(),
            peak_in_flight: self.counters.peak_in_flight.load(Ordering::SeqCst),
            waiting: self.waiting(),
            admitted: self.counters.admitted.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
        }
    }

    /// Limit the gate is converging to
    pub fn target_limit(&self) -> usize {
        self.limit.lock().target
    }

    /// Set the limit, clamped to `[min_limit, max_limit]`.
    ///
    /// Shrinking parks free permits; permits still held by running
    /// operations are parked by later [`rebalance`](Self::rebalance) calls.
    /// Returns the limit now in force.
    pub fn set_limit(&self, target: usize) -> usize {
        let mut limit = self.limit.lock();
        limit.target = target.clamp(self.min_limit, self.max_limit);
        self.converge(&mut limit)
    }

    /// Park or release permits until the limit in force meets the target
    pub fn rebalance(&self) -> usize {
        let mut limit = self.limit.lock();
        self.converge(&mut limit)
    }

    fn converge(&self, limit: &mut Limit) -> usize {
        while limit.current > limit.target {
            match self.semaphore.clone().try_acquire_owned() {
                Ok(permit) => {
                    limit.parked.push(permit);
                    limit.current -= 1;
                }
                Err(_) => break,
            }
        }
        while limit.current < limit.target {
            // Dropping a parked permit returns it to the semaphore
            if limit.parked.pop().is_none() {
                break;
            }
            limit.current += 1;
        }
        limit.current
    }

    /// Fail every waiter and refuse new requests
    pub fn close(&self) {
        self.semaphore.close();
    }
}

/// Adapts the gate limit to sustained saturation
#[derive(Debug)]
pub struct AdmissionControl {
    gate: Arc<AdmissionGate>,
    pressure_window_ms: u64,
    saturated_since: Option<u64>,
    calm_since: Option<u64>,
}

impl AdmissionControl {
    /// Control the given gate
    pub fn new(gate: Arc<AdmissionGate>, config: &AdmissionConfig) -> Self {
        Self {
            gate,
            pressure_window_ms: config.pressure_window_ms,
            saturated_since: None,
            calm_since: None,
        }
    }

    /// The controlled gate
    pub fn gate(&self) -> &Arc<AdmissionGate> {
        &self.gate
    }

    fn saturated(&self) -> bool {
        self.gate.waiting() > 0 || self.gate.in_flight() >= self.gate.limit()
    }
}

impl EdgeCaseHandler for AdmissionControl {
    fn name(&self) -> &'static str {
        NAME
    }

    fn should_allow(&mut self, event: &EdgeEvent, _now: u64) -> Decision {
        // Queue depth beyond one full round of the limit will only time out
        match event {
            EdgeEvent::Operation { priority: false, .. }
                if self.gate.waiting() >= self.gate.limit() =>
            {
                Decision::defer(self.pressure_window_ms / 10)
            }
            _ => Decision::allow(),
        }
    }

    fn tick(&mut self, now: u64) -> Vec<Intent> {
        self.gate.rebalance();
        let target = self.gate.target_limit();
        if self.saturated() {
            self.calm_since = None;
            let since = *self.saturated_since.get_or_insert(now);
            if now.saturating_sub(since) >= self.pressure_window_ms && target > self.gate.min_limit() {
                let in_force = self.gate.set_limit(target - 1);
                self.saturated_since = Some(now);
                warn!(
                    target = target - 1,
                    in_force,
                    waiting = self.gate.waiting(),
                    "Sustained saturation; admission limit lowered"
                );
            }
        } else {
            self.saturated_since = None;
            let since = *self.calm_since.get_or_insert(now);
            if now.saturating_sub(since) >= self.pressure_window_ms && target < self.gate.max_limit() {
                let in_force = self.gate.set_limit(target + 1);
                self.calm_since = Some(now);
                info!(limit = in_force, "Pressure cleared; admission limit raised");
            }
        }
        Vec::new()
    }

    fn active_actions(&self, _now: u64) -> Vec<String> {
        let stats = self.gate.stats();
        let mut actions = Vec::new();
        if stats.limit < stats.max_limit {
            actions.push(format!(
                "admission limit reduced to {} of {}",
                stats.limit, stats.max_limit
            ));
        }
        if stats.waiting > 0 {
            actions.push(format!("{} operations queued for admission", stats.waiting));
        }
        actions
    }

    fn reset(&mut self) {
        self.gate.set_limit(self.gate.max_limit());
        self.saturated_since = None;
        self.calm_since = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn config() -> AdmissionConfig {
        AdmissionConfig {
            acquire_timeout_ms: 1_000,
            min_limit: 2,
            pressure_window_ms: 10_000,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_never_exceeds_limit() {
        let gate = Arc::new(AdmissionGate::new(4, &config()));
        let mut tasks = Vec::new();
        for _ in 0..32 {
            let gate = Arc::clone(&gate);
            tasks.push(tokio::spawn(async move {
                let _permit = gate.acquire_within(Duration::from_secs(60)).await.unwrap();
                assert!(gate.in_flight() <= 4);
                tokio::time::sleep(Duration::from_millis(10)).await;
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        let stats = gate.stats();
        assert_eq!(stats.peak_in_flight, 4);
        assert_eq!(stats.admitted, 32);
        assert_eq!(stats.in_flight, 0);
        assert_eq!(stats.waiting, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiter_times_out() {
        let gate = AdmissionGate::new(1, &config());
        let _held = gate.acquire().await.unwrap();
        let err = gate.acquire().await.unwrap_err();
        assert!(matches!(err, EdgeError::AdmissionTimeout { waited_ms: 1_000 }));
        assert_eq!(gate.stats().rejected, 1);
        assert_eq!(gate.waiting(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiters_served_in_order() {
        let gate = Arc::new(AdmissionGate::new(1, &config()));
        let held = gate.acquire().await.unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut tasks = Vec::new();
        for i in 0..3 {
            let gate = Arc::clone(&gate);
            let order = Arc::clone(&order);
            tasks.push(tokio::spawn(async move {
                let _permit = gate.acquire_within(Duration::from_secs(60)).await.unwrap();
                order.lock().push(i);
            }));
            // Let each task enqueue before the next
            tokio::task::yield_now().await;
        }
        drop(held);
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }

    #[test]
    fn test_limit_shrinks_and_grows_within_bounds() {
        let gate = AdmissionGate::new(8, &config());
        assert_eq!(gate.set_limit(1), 2);
        assert_eq!(gate.target_limit(), 2);
        let a = gate.try_acquire();
        let b = gate.try_acquire();
        assert!(a.is_some() && b.is_some());
        assert!(gate.try_acquire().is_none());
        drop((a, b));
        assert_eq!(gate.set_limit(100), 8);
    }

    #[test]
    fn test_shrink_waits_for_busy_permits() {
        let gate = AdmissionGate::new(2, &AdmissionConfig { min_limit: 1, ..config() });
        let a = gate.try_acquire().unwrap();
        let _b = gate.try_acquire().unwrap();
        assert_eq!(gate.set_limit(1), 2);
        drop(a);
        assert_eq!(gate.rebalance(), 1);
        assert!(gate.try_acquire().is_none());
    }

    #[test]
    fn test_control_lowers_limit_under_sustained_pressure() {
        let gate = Arc::new(AdmissionGate::new(4, &config()));
        let mut control = AdmissionControl::new(Arc::clone(&gate), &config());
        let held: Vec<_> = (0..4).filter_map(|_| gate.try_acquire()).collect();
        assert_eq!(held.len(), 4);

        control.tick(0);
        control.tick(5_000);
        assert_eq!(gate.limit(), 4);
        control.tick(10_000);
        // Every permit is busy, so the shrink is pending until one frees up
        assert_eq!(gate.target_limit(), 3);
        assert_eq!(gate.limit(), 4);
        drop(held);
        control.tick(20_000);
        assert!(gate.limit() < 4);
        assert_eq!(control.active_actions(20_000).len(), 1);

        // Calm for a full window: the limit climbs back
        let lowered = gate.limit();
        control.tick(30_000);
        control.tick(40_000);
        assert_eq!(gate.limit(), lowered + 1);

        control.reset();
        assert_eq!(gate.limit(), 4);
    }

    #[derive(Debug, Clone)]
    enum GateOp {
        Acquire,
        Release(usize),
        SetLimit(usize),
        Rebalance,
    }

    fn gate_op() -> impl Strategy<Value = GateOp> {
        prop_oneof![
            3 => Just(GateOp::Acquire),
            2 => any::<usize>().prop_map(GateOp::Release),
            2 => (0usize..12).prop_map(GateOp::SetLimit),
            1 => Just(GateOp::Rebalance),
        ]
    }

    proptest! {
        #[test]
        fn prop_limit_and_in_flight_stay_in_bounds(
            max in 1usize..9,
            ops in proptest::collection::vec(gate_op(), 1..120),
        ) {
            let gate = AdmissionGate::new(max, &AdmissionConfig { min_limit: 2, ..config() });
            let mut held = Vec::new();
            for op in ops {
                match op {
                    GateOp::Acquire => {
                        if let Some(permit) = gate.try_acquire() {
                            held.push(permit);
                        }
                    }
                    GateOp::Release(i) => {
                        if !held.is_empty() {
                            held.swap_remove(i % held.len());
                        }
                    }
                    GateOp::SetLimit(target) => {
                        gate.set_limit(target);
                    }
                    GateOp::Rebalance => {
                        gate.rebalance();
                    }
                }
                prop_assert_eq!(gate.in_flight(), held.len());
                prop_assert!(gate.in_flight() <= gate.limit());
                prop_assert!(gate.limit() <= gate.max_limit());
                prop_assert!(gate.limit() >= gate.min_limit());
                prop_assert!(gate.target_limit() <= gate.limit());
            }
        }
    }
}
