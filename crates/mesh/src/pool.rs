//! Channel pool: the single-writer core of the pool manager.
//!
//! [`ChannelPool`] owns every [`ChannelInstance`] and is the only code that
//! mutates one. It is synchronous and clock-free: every call
//! takes `now` in milliseconds, and side effects that need I/O are queued as
//! [`PoolEvent`]s and drained by the caller. The async
//! [`ChannelPoolManager`](crate::manager::ChannelPoolManager) wraps it in a
//! task so all operations on a peer are totally ordered.

use crate::channel::{
    ChannelHandle, ChannelInstance, ChannelSnapshot, ChannelState, QueuedMessage,
};
use crate::coordinator::LayerState;
use crate::error::{ErrorClass, FailureReason, MeshError, MeshResult};
use crate::event::{DeliveryFailure, EvictReason, EvictionReport, PoolEvent, ReadyMessage, Transition};
use crate::intent::Intent;
use crate::recovery::{RecoveryEngine, RecoveryPhase};
use bytes::Bytes;
use lifeline_core::{PeerId, PoolConfig, QualityWeights, ResilienceConfig};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use tracing::{debug, info, warn};

/// Transitions kept for diagnostics
const HISTORY_LIMIT: usize = 512;

/// Events and transition history produced by pool operations
#[derive(Debug, Default)]
struct Journal {
    outbox: Vec<PoolEvent>,
    history: VecDeque<Transition>,
}

impl Journal {
    fn record(&mut self, transition: Transition) {
        debug!(
            peer_id = %transition.peer_id,
            from = %transition.from,
            to = %transition.to,
            "Channel transition"
        );
        if self.history.len() == HISTORY_LIMIT {
            self.history.pop_front();
        }
        self.history.push_back(transition.clone());
        self.outbox.push(PoolEvent::Transitioned(transition));
    }

    fn emit(&mut self, event: PoolEvent) {
        self.outbox.push(event);
    }

    fn flush_queue(&mut self, channel: &mut ChannelInstance) {
        if channel.queue.is_empty() {
            return;
        }
        let messages: Vec<ReadyMessage> = channel.queue.drain(..).map(ReadyMessage::from).collect();
        debug!(peer_id = %channel.peer_id, count = messages.len(), "Flushing queued messages");
        self.emit(PoolEvent::QueueReady {
            peer_id: channel.peer_id.clone(),
            messages,
        });
    }
}

/// Per-state channel counts
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateCounts {
    /// Channels in `idle`
    pub idle: usize,
    /// Channels in `active`
    pub active: usize,
    /// Channels in `congested`
    pub congested: usize,
    /// Channels in `failed`
    pub failed: usize,
    /// Channels in `recovering`
    pub recovering: usize,
    /// Channels in `maintenance`
    pub maintenance: usize,
    /// Channels in `recovered`
    pub recovered: usize,
}

impl StateCounts {
    fn add(&mut self, state: ChannelState) {
        let slot = match state {
            ChannelState::Idle => &mut self.idle,
            ChannelState::Active => &mut self.active,
            ChannelState::Congested => &mut self.congested,
            ChannelState::Failed => &mut self.failed,
            ChannelState::Recovering => &mut self.recovering,
            ChannelState::Maintenance => &mut self.maintenance,
            ChannelState::Recovered => &mut self.recovered,
        };
        *slot += 1;
    }

    /// Count for one state
    pub fn get(&self, state: ChannelState) -> usize {
        match state {
            ChannelState::Idle => self.idle,
            ChannelState::Active => self.active,
            ChannelState::Congested => self.congested,
            ChannelState::Failed => self.failed,
            ChannelState::Recovering => self.recovering,
            ChannelState::Maintenance => self.maintenance,
            ChannelState::Recovered => self.recovered,
        }
    }
}

/// Aggregate pool health
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolHealthReport {
    /// When the report was built
    pub generated_at: u64,
    /// Channels in the pool
    pub total_channels: usize,
    /// Channels per state
    pub state_counts: StateCounts,
    /// Channels that may carry routed traffic
    pub routable_channels: usize,
    /// Degraded channels over total
    pub degraded_fraction: f64,
    /// Degraded fraction reached the emergency threshold
    pub emergency_mode: bool,
    /// Mean quality score (0 for an empty pool)
    pub average_quality: f64,
    /// Channels isolated by fatal errors
    pub isolated_channels: Vec<PeerId>,
    /// Channels inside a quarantine
    pub quarantined_channels: Vec<PeerId>,
    /// Mesh-layer state derived from the pool
    pub mesh_layer_state: LayerState,
    /// Per-channel detail, sorted by peer id
    pub channels: Vec<ChannelSnapshot>,
}

/// Owner of all channel instances
#[derive(Debug)]
pub struct ChannelPool {
    config: PoolConfig,
    weights: QualityWeights,
    emergency_threshold: f64,
    engine: RecoveryEngine,
    channels: HashMap<PeerId, ChannelInstance>,
    journal: Journal,
    next_message_id: u64,
    rng: StdRng,
}

fn ensure_channel<'a>(
    channels: &'a mut HashMap<PeerId, ChannelInstance>,
    config: &PoolConfig,
    weights: &QualityWeights,
    peer_id: &str,
    now: u64,
) -> &'a mut ChannelInstance {
    channels.entry(peer_id.to_string()).or_insert_with(|| {
        debug!(peer_id = %peer_id, "Channel created");
        ChannelInstance::new(peer_id.to_string(), config, weights, now)
    })
}

fn not_found(peer_id: &str) -> MeshError {
    MeshError::PeerNotFound {
        peer_id: peer_id.to_string(),
    }
}

fn enter_failed(
    channel: &mut ChannelInstance,
    engine: &RecoveryEngine,
    rng: &mut StdRng,
    journal: &mut Journal,
    now: u64,
) -> MeshResult<()> {
    let transition = channel.transition(ChannelState::Failed, now)?;
    journal.record(transition);

    let delay = engine.backoff_ms(channel.recovery.attempts, rng);
    let mut next_attempt = now.saturating_add(delay);
    if let Some(until) = channel.quarantined_until {
        next_attempt = next_attempt.max(until);
    }
    channel.recovery.phase = Some(RecoveryPhase::Detect);
    channel.recovery.deadline_ms = None;
    channel.recovery.clean_streak = 0;
    channel.recovery.next_attempt_at_ms = next_attempt;
    Ok(())
}

fn enter_recovering(
    channel: &mut ChannelInstance,
    engine: &RecoveryEngine,
    journal: &mut Journal,
    now: u64,
) -> MeshResult<u32> {
    let transition = channel.transition(ChannelState::Recovering, now)?;
    journal.record(transition);

    channel.recovery.attempts = channel.recovery.attempts.saturating_add(1);
    channel.recovery.phase = Some(RecoveryPhase::Remediate);
    channel.recovery.deadline_ms = Some(engine.deadline(now));
    channel.recovery.clean_streak = 0;
    Ok(channel.recovery.attempts)
}

impl ChannelPool {
    /// Create an empty pool
    pub fn new(config: &ResilienceConfig) -> Self {
        Self::with_rng(config, StdRng::from_entropy())
    }

    /// Create an empty pool with a deterministic jitter source
    pub fn with_seed(config: &ResilienceConfig, seed: u64) -> Self {
        Self::with_rng(config, StdRng::seed_from_u64(seed))
    }

    fn with_rng(config: &ResilienceConfig, rng: StdRng) -> Self {
        Self {
            config: config.pool.clone(),
            weights: config.quality_score_weights.normalized(),
            emergency_threshold: config.emergency_mode_threshold,
            engine: RecoveryEngine::new(&config.pool, config.auto_recovery_enabled),
            channels: HashMap::new(),
            journal: Journal::default(),
            next_message_id: 1,
            rng,
        }
    }

    /// Pool tuning in force
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Number of channels
    pub fn len(&self) -> usize {
        self.channels.len()
    }

    /// Whether the pool has no channels
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Whether a channel exists for `peer_id`
    pub fn contains(&self, peer_id: &str) -> bool {
        self.channels.contains_key(peer_id)
    }

    /// Snapshot of one channel
    pub fn channel(&self, peer_id: &str, now: u64) -> Option<ChannelSnapshot> {
        self.channels
            .get(peer_id)
            .map(|channel| channel.snapshot(&self.config, now))
    }

    /// Hand out a channel for one operation.
    ///
    /// Creates the channel on first sight. Acquiring a routable channel does
    /// not mutate it.
    pub fn acquire(&mut self, peer_id: &str, now: u64) -> MeshResult<ChannelHandle> {
        let channel = ensure_channel(&mut self.channels, &self.config, &self.weights, peer_id, now);

        if let Some(until) = channel.quarantined_until.filter(|until| now < *until) {
            return Err(MeshError::Quarantined {
                peer_id: peer_id.to_string(),
                until_ms: until,
            });
        }
        match channel.state {
            ChannelState::Maintenance => {
                return Err(MeshError::Maintenance {
                    peer_id: peer_id.to_string(),
                })
            }
            ChannelState::Failed | ChannelState::Recovering => {
                return Err(MeshError::CircuitOpen {
                    peer_id: peer_id.to_string(),
                    state: channel.state,
                })
            }
            _ if channel.needs_validation => {
                return Err(MeshError::CircuitOpen {
                    peer_id: peer_id.to_string(),
                    state: channel.state,
                })
            }
            _ => {}
        }

        Ok(ChannelHandle {
            peer_id: channel.peer_id.clone(),
            state: channel.state,
            quality_score: channel.quality.score(),
            budget: channel.timeout_profile.budget(&self.config),
        })
    }

    /// Transport reported a link to `peer_id`.
    ///
    /// Quarantined peers are rejected. A failed channel enters `recovering`
    /// and a verification probe is requested.
    pub fn peer_connected(&mut self, peer_id: &str, now: u64) -> MeshResult<ChannelState> {
        let channel = ensure_channel(&mut self.channels, &self.config, &self.weights, peer_id, now);

        if let Some(until) = channel.quarantined_until.filter(|until| now < *until) {
            debug!(peer_id = %peer_id, until_ms = until, "Rejected reconnect of quarantined peer");
            return Err(MeshError::Quarantined {
                peer_id: peer_id.to_string(),
                until_ms: until,
            });
        }
        channel.touch(now);

        if channel.state == ChannelState::Failed {
            let attempt = enter_recovering(channel, &self.engine, &mut self.journal, now)?;
            channel.last_probe_at = Some(now);
            info!(peer_id = %peer_id, attempt, "Peer reconnected, verifying channel");
            self.journal.emit(PoolEvent::ProbeRequested {
                peer_id: peer_id.to_string(),
            });
        }
        Ok(channel.state)
    }

    /// Transport reported the link to `peer_id` dropped
    pub fn peer_disconnected(
        &mut self,
        peer_id: &str,
        reason: &str,
        now: u64,
    ) -> MeshResult<Option<ChannelSnapshot>> {
        if !self.channels.contains_key(peer_id) {
            return Ok(None);
        }
        self.report_failure(peer_id, FailureReason::Disconnected(reason.to_string()), now)
            .map(Some)
    }

    /// Record a clean exchange and move the channel accordingly
    pub fn report_success(
        &mut self,
        peer_id: &str,
        latency_ms: f64,
        bytes: u64,
        now: u64,
    ) -> MeshResult<ChannelSnapshot> {
        let channel = self.channels.get_mut(peer_id).ok_or_else(|| not_found(peer_id))?;
        channel.touch(now);
        channel.consecutive_failures = 0;
        channel.quality.record_success(latency_ms, bytes);
        self.journal.emit(PoolEvent::ExchangeCompleted {
            peer_id: peer_id.to_string(),
            latency_ms,
        });

        let was_unvalidated = std::mem::take(&mut channel.needs_validation);
        let quarantined = channel.is_quarantined(now);
        let score = channel.quality.score();

        match channel.state {
            ChannelState::Idle if !quarantined => {
                let transition = channel.transition(ChannelState::Active, now)?;
                self.journal.record(transition);
            }
            ChannelState::Active if score < self.config.congestion_threshold => {
                let transition = channel.transition(ChannelState::Congested, now)?;
                self.journal.record(transition);
            }
            ChannelState::Congested if score >= self.config.congestion_threshold && !quarantined => {
                let transition = channel.transition(ChannelState::Active, now)?;
                self.journal.record(transition);
            }
            ChannelState::Recovering => {
                channel.recovery.phase = Some(RecoveryPhase::Verify);
                channel.recovery.clean_streak = channel.recovery.clean_streak.saturating_add(1);
                if self.engine.verified(channel.recovery.clean_streak) {
                    let transition = channel.transition(ChannelState::Recovered, now)?;
                    self.journal.record(transition);
                    channel.recovery.phase = None;
                    channel.recovery.deadline_ms = None;
                    info!(peer_id = %peer_id, "Channel recovery verified");
                    self.journal.flush_queue(channel);
                }
            }
            ChannelState::Recovered if !quarantined => {
                let transition = channel.transition(ChannelState::Active, now)?;
                self.journal.record(transition);
                channel.recovery.clear();
            }
            _ => {}
        }

        if was_unvalidated && channel.is_routable(now) {
            self.journal.flush_queue(channel);
        }
        Ok(channel.snapshot(&self.config, now))
    }

    /// Account traffic received from `peer_id`.
    ///
    /// Counts as activity and feeds throughput; it never moves the channel
    /// between states. Unknown peers are ignored.
    pub fn record_inbound(&mut self, peer_id: &str, bytes: u64, now: u64) -> Option<ChannelSnapshot> {
        let channel = self.channels.get_mut(peer_id)?;
        let interval = now.saturating_sub(channel.last_activity_at);
        channel.quality.record_inbound(bytes, interval);
        channel.touch(now);
        Some(channel.snapshot(&self.config, now))
    }

    /// Record a failed exchange and apply the error taxonomy
    pub fn report_failure(
        &mut self,
        peer_id: &str,
        reason: FailureReason,
        now: u64,
    ) -> MeshResult<ChannelSnapshot> {
        let channel = self.channels.get_mut(peer_id).ok_or_else(|| not_found(peer_id))?;
        let class = reason.class();
        channel.touch(now);
        self.journal.emit(PoolEvent::FailureObserved {
            peer_id: peer_id.to_string(),
            class,
        });

        if class == ErrorClass::Resource {
            // Local exhaustion is not the peer's fault; shedding handles it.
            channel.quality.recompute();
            channel.last_failure = Some(reason);
            return Ok(channel.snapshot(&self.config, now));
        }

        channel.quality.record_failure(reason == FailureReason::Timeout);
        channel.consecutive_failures = channel.consecutive_failures.saturating_add(1);
        channel.last_failure = Some(reason);

        let score = channel.quality.score();
        let streak_exceeded = channel.consecutive_failures >= self.config.failure_streak_threshold;
        let state = channel.state;

        match class {
            ErrorClass::Fatal => {
                channel.isolated = true;
                warn!(peer_id = %peer_id, "Fatal error, isolating channel");
                self.journal.emit(PoolEvent::ChannelIsolated {
                    peer_id: peer_id.to_string(),
                });
                if state != ChannelState::Failed {
                    enter_failed(channel, &self.engine, &mut self.rng, &mut self.journal, now)?;
                }
            }
            ErrorClass::Protocol => {
                if !matches!(state, ChannelState::Failed | ChannelState::Maintenance) {
                    warn!(peer_id = %peer_id, "Protocol error, opening circuit");
                    enter_failed(channel, &self.engine, &mut self.rng, &mut self.journal, now)?;
                }
            }
            ErrorClass::Transient => match state {
                ChannelState::Idle
                | ChannelState::Active
                | ChannelState::Congested
                | ChannelState::Recovered => {
                    if streak_exceeded || score < self.config.failure_threshold {
                        warn!(
                            peer_id = %peer_id,
                            streak = channel.consecutive_failures,
                            score,
                            "Opening circuit"
                        );
                        enter_failed(channel, &self.engine, &mut self.rng, &mut self.journal, now)?;
                    } else if score < self.config.congestion_threshold {
                        if state == ChannelState::Active {
                            let transition = channel.transition(ChannelState::Congested, now)?;
                            self.journal.record(transition);
                        } else if state == ChannelState::Recovered {
                            enter_failed(channel, &self.engine, &mut self.rng, &mut self.journal, now)?;
                        }
                    }
                }
                ChannelState::Recovering => {
                    debug!(peer_id = %peer_id, "Verification failed");
                    enter_failed(channel, &self.engine, &mut self.rng, &mut self.journal, now)?;
                }
                ChannelState::Failed | ChannelState::Maintenance => {}
            },
            ErrorClass::Resource => {}
        }

        Ok(channel.snapshot(&self.config, now))
    }

    /// Remove a channel; evicting an unknown peer is a no-op
    pub fn evict(&mut self, peer_id: &str, reason: EvictReason, _now: u64) -> Option<EvictionReport> {
        let mut channel = self.channels.remove(peer_id)?;
        let dropped: Vec<u64> = channel.queue.drain(..).map(|m| m.id).collect();
        if !dropped.is_empty() {
            self.journal.emit(PoolEvent::DeliveryFailed {
                peer_id: peer_id.to_string(),
                message_ids: dropped.clone(),
                reason: DeliveryFailure::ChannelEvicted(reason),
            });
        }

        info!(
            peer_id = %peer_id,
            state = %channel.state,
            reason = ?reason,
            dropped = dropped.len(),
            "Channel evicted"
        );
        let report = EvictionReport {
            peer_id: peer_id.to_string(),
            last_state: channel.state,
            reason,
            dropped_messages: dropped,
        };
        self.journal.emit(PoolEvent::Evicted(report.clone()));
        Some(report)
    }

    /// Hold an outbound message until the channel is routable again.
    ///
    /// The queue is bounded; on overflow the oldest message is reported as a
    /// delivery failure.
    pub fn enqueue(
        &mut self,
        peer_id: &str,
        payload: Bytes,
        priority: bool,
        now: u64,
    ) -> MeshResult<u64> {
        let channel = self.channels.get_mut(peer_id).ok_or_else(|| not_found(peer_id))?;
        let id = self.next_message_id;
        self.next_message_id += 1;

        if channel.queue.len() >= self.config.max_queued_per_channel.max(1) {
            if let Some(oldest) = channel.queue.pop_front() {
                self.journal.emit(PoolEvent::DeliveryFailed {
                    peer_id: peer_id.to_string(),
                    message_ids: vec![oldest.id],
                    reason: DeliveryFailure::QueueOverflow,
                });
            }
        }
        channel.queue.push_back(QueuedMessage {
            id,
            payload,
            priority,
            enqueued_at: now,
        });
        Ok(id)
    }

    /// Place a channel under administrative hold or release it.
    ///
    /// Releasing moves the channel to `recovered`; the next clean exchange
    /// promotes it to `active`.
    pub fn set_maintenance(&mut self, peer_id: &str, hold: bool, now: u64) -> MeshResult<ChannelState> {
        let channel = self.channels.get_mut(peer_id).ok_or_else(|| not_found(peer_id))?;
        match (hold, channel.state) {
            (true, ChannelState::Maintenance) | (false, ChannelState::Recovered) => {}
            (true, _) => {
                let transition = channel.transition(ChannelState::Maintenance, now)?;
                self.journal.record(transition);
                info!(peer_id = %peer_id, "Channel placed under maintenance");
            }
            (false, ChannelState::Maintenance) => {
                let transition = channel.transition(ChannelState::Recovered, now)?;
                self.journal.record(transition);
                channel.recovery.clear();
                info!(peer_id = %peer_id, "Channel released from maintenance");
                self.journal.flush_queue(channel);
            }
            (false, state) => {
                return Err(MeshError::InvalidTransition {
                    peer_id: peer_id.to_string(),
                    from: state,
                    to: ChannelState::Recovered,
                })
            }
        }
        Ok(channel.state)
    }

    /// Execute a handler intent
    pub fn apply(&mut self, intent: Intent, now: u64) {
        debug!(intent = intent.label(), peer_id = ?intent.peer_id(), "Applying intent");
        match intent {
            Intent::Quarantine {
                peer_id,
                duration_ms,
                level,
            } => {
                let channel =
                    ensure_channel(&mut self.channels, &self.config, &self.weights, &peer_id, now);
                let until = now.saturating_add(duration_ms);
                let until = channel.quarantined_until.map_or(until, |current| current.max(until));
                channel.quarantined_until = Some(until);
                warn!(peer_id = %peer_id, until_ms = until, level, "Peer quarantined");

                if matches!(
                    channel.state,
                    ChannelState::Idle
                        | ChannelState::Active
                        | ChannelState::Congested
                        | ChannelState::Recovering
                        | ChannelState::Recovered
                ) {
                    if let Err(e) =
                        enter_failed(channel, &self.engine, &mut self.rng, &mut self.journal, now)
                    {
                        warn!(peer_id = %peer_id, error = %e, "Could not fail quarantined channel");
                    }
                }
                channel.recovery.next_attempt_at_ms = channel.recovery.next_attempt_at_ms.max(until);
            }
            Intent::LiftQuarantine { peer_id } => {
                if let Some(channel) = self.channels.get_mut(&peer_id) {
                    channel.quarantined_until = None;
                    info!(peer_id = %peer_id, "Quarantine lifted");
                }
            }
            Intent::Evict { peer_id, reason } => {
                self.evict(&peer_id, reason, now);
            }
            Intent::ReleaseBuffers { peer_id } => {
                if let Some(channel) = self.channels.get_mut(&peer_id) {
                    let dropped: Vec<u64> = channel.queue.drain(..).map(|m| m.id).collect();
                    if !dropped.is_empty() {
                        self.journal.emit(PoolEvent::DeliveryFailed {
                            peer_id,
                            message_ids: dropped,
                            reason: DeliveryFailure::BuffersReleased,
                        });
                    }
                }
            }
            Intent::Revalidate { peer_ids } => {
                for peer_id in peer_ids {
                    if let Some(channel) = self.channels.get_mut(&peer_id) {
                        if channel.state.is_routable() {
                            channel.needs_validation = true;
                            channel.last_probe_at = Some(now);
                            self.journal.emit(PoolEvent::ProbeRequested { peer_id });
                        }
                    }
                }
            }
            Intent::SetTimeoutProfile { peer_id, profile } => {
                if let Some(channel) = self.channels.get_mut(&peer_id) {
                    if channel.timeout_profile != profile {
                        info!(peer_id = %peer_id, profile = ?profile, "Timeout profile changed");
                        channel.timeout_profile = profile;
                    }
                }
            }
            Intent::RouteAround {
                peer_id,
                duration_ms,
            } => {
                if let Some(channel) = self.channels.get_mut(&peer_id) {
                    channel.route_penalty_until = Some(now.saturating_add(duration_ms));
                }
            }
            Intent::ResetSubsystem { reason } => {
                warn!(reason = %reason, "Subsystem reset requested");
                self.reset(now);
            }
        }
    }

    /// Drive the recovery engine and the retention sweep
    pub fn tick(&mut self, now: u64) {
        let retention = self.config.retention_horizon_ms;
        let mut evictions: Vec<(PeerId, EvictReason)> = Vec::new();

        for channel in self.channels.values_mut() {
            match channel.state {
                ChannelState::Idle => {
                    if now.saturating_sub(channel.last_activity_at) >= retention {
                        evictions.push((channel.peer_id.clone(), EvictReason::Retention));
                    }
                }
                ChannelState::Failed => {
                    if now.saturating_sub(channel.last_transition_at) >= retention {
                        evictions.push((channel.peer_id.clone(), EvictReason::Retention));
                        continue;
                    }
                    if self.engine.exhausted(&channel.recovery) {
                        evictions.push((channel.peer_id.clone(), EvictReason::RecoveryExhausted));
                        continue;
                    }
                    if !self.engine.auto_recovery()
                        || channel.is_quarantined(now)
                        || now < channel.recovery.next_attempt_at_ms
                    {
                        continue;
                    }

                    channel.recovery.phase = Some(RecoveryPhase::Diagnose);
                    let diagnosis = self.engine.diagnose(channel.last_failure.as_ref());
                    channel.recovery.last_diagnosis = Some(diagnosis);

                    match self.engine.remediation_for(diagnosis) {
                        None => {
                            let delay = self.engine.backoff_ms(channel.recovery.attempts, &mut self.rng);
                            channel.recovery.next_attempt_at_ms = now.saturating_add(delay);
                            channel.recovery.phase = Some(RecoveryPhase::Detect);
                            debug!(peer_id = %channel.peer_id, ?diagnosis, "Recovery deferred");
                        }
                        Some(action) => {
                            match enter_recovering(channel, &self.engine, &mut self.journal, now) {
                                Ok(attempt) => {
                                    info!(
                                        peer_id = %channel.peer_id,
                                        ?diagnosis,
                                        ?action,
                                        attempt,
                                        "Recovery attempt"
                                    );
                                    self.journal.emit(PoolEvent::RemediationRequested {
                                        peer_id: channel.peer_id.clone(),
                                        action,
                                        attempt,
                                    });
                                }
                                Err(e) => {
                                    warn!(peer_id = %channel.peer_id, error = %e, "Recovery transition rejected");
                                }
                            }
                        }
                    }
                }
                ChannelState::Recovering => {
                    let expired = channel.recovery.deadline_ms.is_some_and(|deadline| now >= deadline);
                    if expired {
                        warn!(
                            peer_id = %channel.peer_id,
                            attempt = channel.recovery.attempts,
                            "Recovery timed out"
                        );
                        if let Err(e) =
                            enter_failed(channel, &self.engine, &mut self.rng, &mut self.journal, now)
                        {
                            warn!(peer_id = %channel.peer_id, error = %e, "Could not fail channel");
                        }
                    } else if self.engine.probe_due(channel.last_activity_at, channel.last_probe_at, now) {
                        channel.last_probe_at = Some(now);
                        self.journal.emit(PoolEvent::ProbeRequested {
                            peer_id: channel.peer_id.clone(),
                        });
                    }
                }
                ChannelState::Active | ChannelState::Congested | ChannelState::Recovered => {
                    if self.engine.probe_due(channel.last_activity_at, channel.last_probe_at, now) {
                        channel.last_probe_at = Some(now);
                        self.journal.emit(PoolEvent::ProbeRequested {
                            peer_id: channel.peer_id.clone(),
                        });
                    }
                }
                ChannelState::Maintenance => {}
            }
        }

        for (peer_id, reason) in evictions {
            self.evict(&peer_id, reason, now);
        }
    }

    /// Evict every channel
    pub fn reset(&mut self, now: u64) -> usize {
        let peers: Vec<PeerId> = self.channels.keys().cloned().collect();
        let evicted = peers.len();
        for peer_id in peers {
            self.evict(&peer_id, EvictReason::Emergency, now);
        }
        warn!(evicted, "Channel pool reset");
        self.journal.emit(PoolEvent::Reset { evicted });
        evicted
    }

    /// Best routable peers by score; route-penalized peers come last
    pub fn route_candidates(&self, limit: usize, now: u64) -> Vec<PeerId> {
        let mut candidates: Vec<(&ChannelInstance, bool)> = self
            .channels
            .values()
            .filter(|channel| channel.is_routable(now))
            .map(|channel| {
                let penalized = channel.route_penalty_until.is_some_and(|until| now < until);
                (channel, penalized)
            })
            .collect();
        candidates.sort_by(|(a, a_penalized), (b, b_penalized)| {
            a_penalized
                .cmp(b_penalized)
                .then_with(|| b.quality.score().total_cmp(&a.quality.score()))
                .then_with(|| a.peer_id.cmp(&b.peer_id))
        });
        candidates
            .into_iter()
            .take(limit)
            .map(|(channel, _)| channel.peer_id.clone())
            .collect()
    }

    /// Pool health report
    pub fn snapshot(&self, now: u64) -> PoolHealthReport {
        let mut counts = StateCounts::default();
        let mut channels: Vec<ChannelSnapshot> = Vec::with_capacity(self.channels.len());
        let mut degraded = 0usize;
        let mut routable = 0usize;
        let mut quality_sum = 0.0;
        let mut isolated = Vec::new();
        let mut quarantined = Vec::new();

        for channel in self.channels.values() {
            counts.add(channel.state);
            if channel.state.is_degraded() {
                degraded += 1;
            }
            if channel.is_routable(now) {
                routable += 1;
            }
            if channel.isolated {
                isolated.push(channel.peer_id.clone());
            }
            if channel.is_quarantined(now) {
                quarantined.push(channel.peer_id.clone());
            }
            quality_sum += channel.quality.score();
            channels.push(channel.snapshot(&self.config, now));
        }
        channels.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        isolated.sort();
        quarantined.sort();

        let total = self.channels.len();
        let degraded_fraction = if total == 0 { 0.0 } else { degraded as f64 / total as f64 };
        let emergency_mode = total > 0 && degraded_fraction >= self.emergency_threshold;
        let average_quality = if total == 0 { 0.0 } else { quality_sum / total as f64 };

        let mesh_layer_state = if total == 0 {
            LayerState::Disconnected
        } else if counts.active > 0 && !emergency_mode {
            LayerState::Ready
        } else if routable > 0 {
            LayerState::Connected
        } else if counts.recovering > 0 {
            LayerState::Reconnecting
        } else {
            LayerState::Failed
        };

        PoolHealthReport {
            generated_at: now,
            total_channels: total,
            state_counts: counts,
            routable_channels: routable,
            degraded_fraction,
            emergency_mode,
            average_quality,
            isolated_channels: isolated,
            quarantined_channels: quarantined,
            mesh_layer_state,
            channels,
        }
    }

    /// Recent transitions, oldest first
    pub fn transitions(&self) -> impl Iterator<Item = &Transition> {
        self.journal.history.iter()
    }

    /// Take the events produced since the last drain
    pub fn drain_events(&mut self) -> Vec<PoolEvent> {
        std::mem::take(&mut self.journal.outbox)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn pool() -> ChannelPool {
        ChannelPool::with_seed(&ResilienceConfig::default(), 11)
    }

    fn activate(pool: &mut ChannelPool, peer: &str, now: u64) {
        pool.acquire(peer, now).unwrap();
        pool.report_success(peer, 40.0, 4_096, now).unwrap();
    }

    #[test]
    fn test_ten_clean_exchanges_make_channel_active() {
        let mut pool = pool();
        pool.peer_connected("peer-a", 0).unwrap();
        let mut snapshot = None;
        for i in 0..10 {
            snapshot = Some(pool.report_success("peer-a", 50.0, 4_096, i * 100).unwrap());
        }
        let snapshot = snapshot.unwrap();
        assert_eq!(snapshot.state, ChannelState::Active);
        assert_eq!(snapshot.metrics.reliability, 1.0);
        assert!(snapshot.quality_score >= 0.9);
    }

    #[test]
    fn test_failure_streak_opens_circuit() {
        let mut pool = pool();
        activate(&mut pool, "peer-a", 0);
        for i in 1..=3 {
            pool.report_failure("peer-a", FailureReason::Timeout, i).unwrap();
        }
        let snapshot = pool.channel("peer-a", 4).unwrap();
        assert_eq!(snapshot.state, ChannelState::Failed);
        assert!(matches!(
            pool.acquire("peer-a", 5),
            Err(MeshError::CircuitOpen { .. })
        ));
    }

    #[test]
    fn test_protocol_error_fails_immediately() {
        let mut pool = pool();
        activate(&mut pool, "peer-a", 0);
        let snapshot = pool
            .report_failure("peer-a", FailureReason::MalformedFrame("short header".into()), 1)
            .unwrap();
        assert_eq!(snapshot.state, ChannelState::Failed);
    }

    #[test]
    fn test_resource_error_does_not_touch_state() {
        let mut pool = pool();
        activate(&mut pool, "peer-a", 0);
        pool.drain_events();
        let snapshot = pool
            .report_failure("peer-a", FailureReason::ResourceExhausted("oom".into()), 1)
            .unwrap();
        assert_eq!(snapshot.state, ChannelState::Active);
        assert_eq!(snapshot.consecutive_failures, 0);
        let events = pool.drain_events();
        assert!(events.iter().any(|e| matches!(
            e,
            PoolEvent::FailureObserved { class: ErrorClass::Resource, .. }
        )));
    }

    #[test]
    fn test_fatal_error_isolates_channel() {
        let mut pool = pool();
        activate(&mut pool, "peer-a", 0);
        pool.report_failure("peer-a", FailureReason::InvariantViolation("bad counter".into()), 1)
            .unwrap();
        let report = pool.snapshot(2);
        assert_eq!(report.isolated_channels, vec!["peer-a".to_string()]);
        assert_eq!(report.state_counts.failed, 1);
    }

    #[test]
    fn test_recovery_cycle_reaches_active() {
        let mut pool = pool();
        activate(&mut pool, "peer-a", 0);
        pool.report_failure("peer-a", FailureReason::ChecksumMismatch, 10).unwrap();
        pool.drain_events();

        // Backoff for attempt 0 is at most 625ms with default jitter.
        pool.tick(1_000);
        let events = pool.drain_events();
        assert!(events.iter().any(|e| matches!(
            e,
            PoolEvent::RemediationRequested {
                action: crate::recovery::RemediationAction::TransportReset,
                attempt: 1,
                ..
            }
        )));
        assert_eq!(pool.channel("peer-a", 1_000).unwrap().state, ChannelState::Recovering);

        for i in 0..3 {
            pool.report_success("peer-a", 30.0, 1_024, 1_100 + i).unwrap();
        }
        assert_eq!(pool.channel("peer-a", 1_200).unwrap().state, ChannelState::Recovered);
        pool.report_success("peer-a", 30.0, 1_024, 1_300).unwrap();
        let snapshot = pool.channel("peer-a", 1_300).unwrap();
        assert_eq!(snapshot.state, ChannelState::Active);
        assert_eq!(snapshot.recovery_attempts, 0);
    }

    #[test]
    fn test_recovering_times_out_back_to_failed() {
        let mut pool = pool();
        activate(&mut pool, "peer-a", 0);
        pool.report_failure("peer-a", FailureReason::ChecksumMismatch, 1).unwrap();
        pool.tick(1_000);
        assert_eq!(pool.channel("peer-a", 1_000).unwrap().state, ChannelState::Recovering);

        pool.tick(1_000 + 30_000);
        assert_eq!(pool.channel("peer-a", 31_000).unwrap().state, ChannelState::Failed);
    }

    #[test]
    fn test_exhausted_recovery_evicts_and_reports_queue() {
        let mut config = ResilienceConfig::default();
        config.pool.max_recovery_attempts = 1;
        let mut pool = ChannelPool::with_seed(&config, 3);
        activate(&mut pool, "peer-a", 0);
        pool.report_failure("peer-a", FailureReason::ChecksumMismatch, 1).unwrap();
        let id = pool.enqueue("peer-a", Bytes::from_static(b"hello"), false, 2).unwrap();

        pool.tick(1_000); // attempt 1
        pool.tick(31_000); // timed out -> failed
        pool.drain_events();
        pool.tick(31_001); // exhausted -> evicted

        assert!(!pool.contains("peer-a"));
        let events = pool.drain_events();
        assert!(events.iter().any(|e| matches!(
            e,
            PoolEvent::DeliveryFailed { message_ids, reason: DeliveryFailure::ChannelEvicted(EvictReason::RecoveryExhausted), .. }
                if message_ids == &vec![id]
        )));
    }

    #[test]
    fn test_auto_recovery_disabled_waits_for_transport() {
        let mut config = ResilienceConfig::default();
        config.auto_recovery_enabled = false;
        let mut pool = ChannelPool::with_seed(&config, 5);
        activate(&mut pool, "peer-a", 0);
        pool.report_failure("peer-a", FailureReason::ChecksumMismatch, 1).unwrap();
        pool.tick(60_000);
        assert_eq!(pool.channel("peer-a", 60_000).unwrap().state, ChannelState::Failed);

        assert_eq!(pool.peer_connected("peer-a", 60_001).unwrap(), ChannelState::Recovering);
    }

    #[test]
    fn test_quarantine_rejects_reconnect_until_expiry() {
        let mut pool = pool();
        activate(&mut pool, "peer-b", 0);
        pool.apply(
            Intent::Quarantine {
                peer_id: "peer-b".into(),
                duration_ms: 30_000,
                level: 0,
            },
            1_000,
        );
        assert_eq!(pool.channel("peer-b", 1_000).unwrap().state, ChannelState::Failed);

        assert!(matches!(
            pool.peer_connected("peer-b", 16_000),
            Err(MeshError::Quarantined { until_ms: 31_000, .. })
        ));
        // The engine must not start recovery inside the quarantine either.
        pool.tick(20_000);
        assert_eq!(pool.channel("peer-b", 20_000).unwrap().state, ChannelState::Failed);

        assert_eq!(pool.peer_connected("peer-b", 31_001).unwrap(), ChannelState::Recovering);
    }

    #[test]
    fn test_evict_is_idempotent() {
        let mut pool = pool();
        activate(&mut pool, "peer-a", 0);
        assert!(pool.evict("peer-a", EvictReason::Explicit, 1).is_some());
        pool.drain_events();
        assert!(pool.evict("peer-a", EvictReason::Explicit, 2).is_none());
        assert!(pool.drain_events().is_empty());
        assert!(pool.is_empty());
    }

    #[test]
    fn test_acquire_active_is_noop() {
        let mut pool = pool();
        activate(&mut pool, "peer-a", 0);
        let before = pool.channel("peer-a", 10).unwrap();
        pool.drain_events();
        let handle = pool.acquire("peer-a", 10).unwrap();
        assert_eq!(handle.state, ChannelState::Active);
        assert_eq!(pool.channel("peer-a", 10).unwrap(), before);
        assert!(pool.drain_events().is_empty());
    }

    #[test]
    fn test_queue_overflow_drops_oldest() {
        let mut config = ResilienceConfig::default();
        config.pool.max_queued_per_channel = 2;
        let mut pool = ChannelPool::with_seed(&config, 1);
        pool.acquire("peer-a", 0).unwrap();
        let first = pool.enqueue("peer-a", Bytes::from_static(b"1"), false, 0).unwrap();
        pool.enqueue("peer-a", Bytes::from_static(b"2"), false, 0).unwrap();
        pool.enqueue("peer-a", Bytes::from_static(b"3"), false, 0).unwrap();

        let events = pool.drain_events();
        assert!(events.iter().any(|e| matches!(
            e,
            PoolEvent::DeliveryFailed { message_ids, reason: DeliveryFailure::QueueOverflow, .. }
                if message_ids == &vec![first]
        )));
        assert_eq!(pool.channel("peer-a", 0).unwrap().queued_messages, 2);
    }

    #[test]
    fn test_queue_flushes_after_verification() {
        let mut pool = pool();
        activate(&mut pool, "peer-a", 0);
        pool.report_failure("peer-a", FailureReason::ChecksumMismatch, 1).unwrap();
        pool.enqueue("peer-a", Bytes::from_static(b"held"), true, 2).unwrap();
        pool.peer_connected("peer-a", 3).unwrap();
        pool.drain_events();

        for i in 0..3 {
            pool.report_success("peer-a", 20.0, 512, 10 + i).unwrap();
        }
        let events = pool.drain_events();
        assert!(events.iter().any(|e| matches!(
            e,
            PoolEvent::QueueReady { messages, .. } if messages.len() == 1 && messages[0].priority
        )));
    }

    #[test]
    fn test_emergency_mode_threshold() {
        let mut pool = pool();
        for i in 0..1_000 {
            let peer = format!("peer-{i:04}");
            pool.acquire(&peer, 0).unwrap();
            if i < 300 {
                pool.report_failure(&peer, FailureReason::ChecksumMismatch, 1).unwrap();
            } else {
                pool.report_success(&peer, 40.0, 4_096, 1).unwrap();
            }
        }
        let report = pool.snapshot(2);
        assert_eq!(report.total_channels, 1_000);
        assert_eq!(report.state_counts.failed, 300);
        assert!((report.degraded_fraction - 0.3).abs() < 1e-9);
        assert!(report.emergency_mode);
        assert_eq!(report.mesh_layer_state, LayerState::Connected);
    }

    #[test]
    fn test_maintenance_hold_and_release() {
        let mut pool = pool();
        activate(&mut pool, "peer-a", 0);
        assert_eq!(pool.set_maintenance("peer-a", true, 1).unwrap(), ChannelState::Maintenance);
        assert!(matches!(pool.acquire("peer-a", 2), Err(MeshError::Maintenance { .. })));
        assert_eq!(pool.set_maintenance("peer-a", false, 3).unwrap(), ChannelState::Recovered);
        pool.report_success("peer-a", 20.0, 512, 4).unwrap();
        assert_eq!(pool.channel("peer-a", 4).unwrap().state, ChannelState::Active);
    }

    #[test]
    fn test_revalidate_blocks_routing_until_probe() {
        let mut pool = pool();
        activate(&mut pool, "peer-a", 0);
        pool.apply(Intent::Revalidate { peer_ids: vec!["peer-a".into()] }, 5);
        assert!(matches!(pool.acquire("peer-a", 6), Err(MeshError::CircuitOpen { .. })));
        assert!(pool
            .drain_events()
            .iter()
            .any(|e| matches!(e, PoolEvent::ProbeRequested { peer_id } if peer_id == "peer-a")));

        pool.report_success("peer-a", 20.0, 512, 7).unwrap();
        assert!(pool.acquire("peer-a", 8).is_ok());
    }

    #[test]
    fn test_route_candidates_skip_penalized_first() {
        let mut pool = pool();
        activate(&mut pool, "peer-a", 0);
        activate(&mut pool, "peer-b", 0);
        pool.apply(
            Intent::RouteAround {
                peer_id: "peer-a".into(),
                duration_ms: 1_000,
            },
            0,
        );
        assert_eq!(pool.route_candidates(1, 10), vec!["peer-b".to_string()]);
        assert_eq!(pool.route_candidates(2, 10).len(), 2);
    }

    #[test]
    fn test_inbound_traffic_counts_as_activity() {
        let mut pool = pool();
        pool.peer_connected("peer-a", 0).unwrap();
        let before = pool.channel("peer-a", 0).unwrap();
        let after = pool.record_inbound("peer-a", 8_192, 500).unwrap();
        assert_eq!(after.last_activity_at, 500);
        assert!(after.metrics.throughput > before.metrics.throughput);
        assert_eq!(after.state, before.state);
        assert!(pool.record_inbound("peer-unknown", 8_192, 500).is_none());
    }

    #[test]
    fn test_inbound_traffic_holds_off_retention() {
        let mut pool = pool();
        pool.acquire("peer-busy", 0).unwrap();
        pool.record_inbound("peer-busy", 512, 400_000);
        pool.tick(600_000);
        assert!(pool.contains("peer-busy"));
    }

    #[test]
    fn test_retention_evicts_idle_channels() {
        let mut pool = pool();
        pool.acquire("peer-idle", 0).unwrap();
        pool.tick(600_000);
        assert!(!pool.contains("peer-idle"));
    }

    #[test]
    fn test_reset_evicts_everything() {
        let mut pool = pool();
        activate(&mut pool, "peer-a", 0);
        activate(&mut pool, "peer-b", 0);
        assert_eq!(pool.reset(1), 2);
        assert!(pool.is_empty());
        assert!(pool
            .drain_events()
            .iter()
            .any(|e| matches!(e, PoolEvent::Reset { evicted: 2 })));
    }

    #[derive(Debug, Clone)]
    enum Op {
        Connect,
        Success(u16, u16),
        Failure(u8),
        Quarantine(u16),
        Maintenance(bool),
        Tick(u16),
        Evict,
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            Just(Op::Connect),
            (any::<u16>(), any::<u16>()).prop_map(|(l, b)| Op::Success(l, b)),
            (0u8..5).prop_map(Op::Failure),
            any::<u16>().prop_map(Op::Quarantine),
            any::<bool>().prop_map(Op::Maintenance),
            any::<u16>().prop_map(Op::Tick),
            Just(Op::Evict),
        ]
    }

    fn failure(kind: u8) -> FailureReason {
        match kind {
            0 => FailureReason::Timeout,
            1 => FailureReason::Disconnected("drop".into()),
            2 => FailureReason::ChecksumMismatch,
            3 => FailureReason::ResourceExhausted("cpu".into()),
            _ => FailureReason::InvariantViolation("x".into()),
        }
    }

    proptest! {
        #[test]
        fn prop_only_documented_edges_and_quarantine_holds(
            ops in proptest::collection::vec(op_strategy(), 1..120)
        ) {
            let mut pool = ChannelPool::with_seed(&ResilienceConfig::default(), 99);
            let peer = "peer-p";
            let mut now = 0u64;
            let mut quarantine_until = 0u64;

            for op in ops {
                now += 50;
                match op {
                    Op::Connect => { let _ = pool.peer_connected(peer, now); }
                    Op::Success(l, b) => {
                        let _ = pool.report_success(peer, l as f64, b as u64, now);
                    }
                    Op::Failure(k) => { let _ = pool.report_failure(peer, failure(k), now); }
                    Op::Quarantine(d) => {
                        pool.apply(Intent::Quarantine {
                            peer_id: peer.into(),
                            duration_ms: d as u64,
                            level: 0,
                        }, now);
                        quarantine_until = quarantine_until.max(now + d as u64);
                    }
                    Op::Maintenance(hold) => { let _ = pool.set_maintenance(peer, hold, now); }
                    Op::Tick(advance) => { now += advance as u64; pool.tick(now); }
                    Op::Evict => {
                        pool.evict(peer, EvictReason::Explicit, now);
                        quarantine_until = 0;
                    }
                }
                if let Some(snapshot) = pool.channel(peer, now) {
                    prop_assert!(snapshot.quality_score >= 0.0 && snapshot.quality_score <= 1.0);
                    if now < quarantine_until {
                        prop_assert_ne!(snapshot.state, ChannelState::Active);
                    }
                }
            }

            for t in pool.transitions() {
                prop_assert!(t.from.can_transition_to(t.to), "illegal edge {:?} -> {:?}", t.from, t.to);
            }
        }
    }
}
