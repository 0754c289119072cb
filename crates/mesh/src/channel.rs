//! Channel instances and the lifecycle state graph.
//!
//! A channel is the logical path to one remote peer, independent of the
//! physical link underneath. Only the pool mutates a [`ChannelInstance`];
//! everything else works on [`ChannelSnapshot`]s.

use crate::error::{FailureReason, MeshError, MeshResult};
use crate::event::Transition;
use crate::quality::{QualityMetrics, QualityMonitor};
use crate::recovery::RecoveryState;
use bytes::Bytes;
use lifeline_core::{PeerId, PoolConfig, QualityWeights};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;

/// Lifecycle state of a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelState {
    /// Known peer, no successful exchange yet
    Idle,
    /// Healthy and routable
    Active,
    /// Usable but scoring below the congestion threshold
    Congested,
    /// Circuit open; excluded from routing
    Failed,
    /// Recovery engine engaged, bounded by a deadline
    Recovering,
    /// Administrative hold
    Maintenance,
    /// Recovery verified; promoted to active on the next clean exchange
    Recovered,
}

impl ChannelState {
    /// Every state, for exhaustive reports
    pub const ALL: [ChannelState; 7] = [
        ChannelState::Idle,
        ChannelState::Active,
        ChannelState::Congested,
        ChannelState::Failed,
        ChannelState::Recovering,
        ChannelState::Maintenance,
        ChannelState::Recovered,
    ];

    /// Whether `self -> to` is an edge of the lifecycle graph
    pub fn can_transition_to(self, to: ChannelState) -> bool {
        use ChannelState::*;
        matches!(
            (self, to),
            (Idle, Active)
                | (Idle, Failed)
                | (Idle, Maintenance)
                | (Active, Congested)
                | (Active, Failed)
                | (Active, Maintenance)
                | (Congested, Active)
                | (Congested, Failed)
                | (Congested, Maintenance)
                | (Failed, Recovering)
                | (Failed, Maintenance)
                | (Recovering, Recovered)
                | (Recovering, Failed)
                | (Recovering, Maintenance)
                | (Maintenance, Recovered)
                | (Maintenance, Failed)
                | (Recovered, Active)
                | (Recovered, Failed)
        )
    }

    /// Whether traffic may be routed over a channel in this state
    pub fn is_routable(self) -> bool {
        matches!(
            self,
            ChannelState::Idle | ChannelState::Active | ChannelState::Congested | ChannelState::Recovered
        )
    }

    /// Whether this state counts against pool health
    pub fn is_degraded(self) -> bool {
        matches!(
            self,
            ChannelState::Congested
                | ChannelState::Failed
                | ChannelState::Recovering
                | ChannelState::Maintenance
        )
    }
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChannelState::Idle => "idle",
            ChannelState::Active => "active",
            ChannelState::Congested => "congested",
            ChannelState::Failed => "failed",
            ChannelState::Recovering => "recovering",
            ChannelState::Maintenance => "maintenance",
            ChannelState::Recovered => "recovered",
        };
        f.write_str(name)
    }
}

/// Operation timeout and retry budget applied to a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutProfile {
    /// Default budget
    Standard,
    /// Longer timeouts and more retries for unstable links
    Conservative,
}

impl TimeoutProfile {
    /// Resolve the profile against pool tuning
    pub fn budget(self, config: &PoolConfig) -> OperationBudget {
        match self {
            TimeoutProfile::Standard => OperationBudget {
                timeout_ms: config.standard_timeout_ms,
                retry_budget: config.standard_retry_budget,
            },
            TimeoutProfile::Conservative => OperationBudget {
                timeout_ms: config.conservative_timeout_ms,
                retry_budget: config.conservative_retry_budget,
            },
        }
    }
}

/// Concrete timeout and retry count for one operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationBudget {
    /// Per-attempt timeout
    pub timeout_ms: u64,
    /// Transient retries after the first attempt
    pub retry_budget: u32,
}

/// Outbound message held while a channel's circuit is open
#[derive(Debug, Clone)]
pub struct QueuedMessage {
    /// Pool-assigned message id
    pub id: u64,
    /// Opaque framed payload
    pub payload: Bytes,
    /// Priority traffic bypasses backpressure
    pub priority: bool,
    /// When the message was queued
    pub enqueued_at: u64,
}

/// One channel per remote peer; owned by the pool.
#[derive(Debug)]
pub struct ChannelInstance {
    pub(crate) peer_id: PeerId,
    pub(crate) state: ChannelState,
    pub(crate) quality: QualityMonitor,
    pub(crate) consecutive_failures: u32,
    pub(crate) created_at: u64,
    pub(crate) last_transition_at: u64,
    pub(crate) last_activity_at: u64,
    pub(crate) last_probe_at: Option<u64>,
    pub(crate) quarantined_until: Option<u64>,
    pub(crate) last_failure: Option<FailureReason>,
    pub(crate) recovery: RecoveryState,
    pub(crate) timeout_profile: TimeoutProfile,
    pub(crate) route_penalty_until: Option<u64>,
    pub(crate) needs_validation: bool,
    pub(crate) isolated: bool,
    pub(crate) queue: VecDeque<QueuedMessage>,
}

impl ChannelInstance {
    /// Create an idle channel for a newly observed peer
    pub fn new(peer_id: PeerId, config: &PoolConfig, weights: &QualityWeights, now: u64) -> Self {
        Self {
            peer_id,
            state: ChannelState::Idle,
            quality: QualityMonitor::new(config, weights),
            consecutive_failures: 0,
            created_at: now,
            last_transition_at: now,
            last_activity_at: now,
            last_probe_at: None,
            quarantined_until: None,
            last_failure: None,
            recovery: RecoveryState::default(),
            timeout_profile: TimeoutProfile::Standard,
            route_penalty_until: None,
            needs_validation: false,
            isolated: false,
            queue: VecDeque::new(),
        }
    }

    /// Peer this channel leads to
    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    /// Current lifecycle state
    pub fn state(&self) -> ChannelState {
        self.state
    }

    /// Composite quality score
    pub fn quality_score(&self) -> f64 {
        self.quality.score()
    }

    /// Whether the peer is still inside its quarantine
    pub fn is_quarantined(&self, now: u64) -> bool {
        self.quarantined_until.is_some_and(|until| now < until)
    }

    /// Whether the channel may carry routed traffic right now
    pub fn is_routable(&self, now: u64) -> bool {
        self.state.is_routable() && !self.needs_validation && !self.is_quarantined(now)
    }

    /// Move along one edge of the state graph.
    ///
    /// Illegal edges, and any move to `active` while quarantined, are
    /// rejected without touching the channel.
    pub fn transition(&mut self, to: ChannelState, now: u64) -> MeshResult<Transition> {
        if !self.state.can_transition_to(to) {
            return Err(MeshError::InvalidTransition {
                peer_id: self.peer_id.clone(),
                from: self.state,
                to,
            });
        }
        if to == ChannelState::Active {
            if let Some(until) = self.quarantined_until.filter(|until| now < *until) {
                return Err(MeshError::Quarantined {
                    peer_id: self.peer_id.clone(),
                    until_ms: until,
                });
            }
        }

        let transition = Transition {
            peer_id: self.peer_id.clone(),
            from: self.state,
            to,
            at_ms: now,
        };
        self.state = to;
        self.last_transition_at = now;
        Ok(transition)
    }

    pub(crate) fn touch(&mut self, now: u64) {
        self.last_activity_at = self.last_activity_at.max(now);
    }

    /// Immutable view for other components
    pub fn snapshot(&self, config: &PoolConfig, now: u64) -> ChannelSnapshot {
        ChannelSnapshot {
            peer_id: self.peer_id.clone(),
            state: self.state,
            quality_score: self.quality.score(),
            metrics: self.quality.metrics(),
            consecutive_failures: self.consecutive_failures,
            created_at: self.created_at,
            last_transition_at: self.last_transition_at,
            last_activity_at: self.last_activity_at,
            quarantined_until: self.quarantined_until.filter(|until| now < *until),
            last_failure: self.last_failure.clone(),
            recovery_attempts: self.recovery.attempts,
            timeout_profile: self.timeout_profile,
            budget: self.timeout_profile.budget(config),
            route_penalized: self.route_penalty_until.is_some_and(|until| now < until),
            needs_validation: self.needs_validation,
            isolated: self.isolated,
            queued_messages: self.queue.len(),
            routable: self.is_routable(now),
        }
    }
}

/// Read-only copy of a channel handed to handlers, reports and callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelSnapshot {
    /// Remote peer
    pub peer_id: PeerId,
    /// Lifecycle state
    pub state: ChannelState,
    /// Composite quality score (0..1)
    pub quality_score: f64,
    /// Sub-metrics behind the score
    pub metrics: QualityMetrics,
    /// Current failure streak
    pub consecutive_failures: u32,
    /// When the channel was created
    pub created_at: u64,
    /// When the state last changed
    pub last_transition_at: u64,
    /// Last exchange or connect observed
    pub last_activity_at: u64,
    /// Active quarantine end, if any
    pub quarantined_until: Option<u64>,
    /// Most recent failure
    pub last_failure: Option<FailureReason>,
    /// Recovery attempts in the current failure episode
    pub recovery_attempts: u32,
    /// Timeout profile in force
    pub timeout_profile: TimeoutProfile,
    /// Resolved operation budget
    pub budget: OperationBudget,
    /// Whether routing currently avoids this peer
    pub route_penalized: bool,
    /// Awaiting a post-resume health probe
    pub needs_validation: bool,
    /// Isolated after a fatal error
    pub isolated: bool,
    /// Messages waiting for the circuit to close
    pub queued_messages: usize,
    /// Whether routed traffic may use the channel now
    pub routable: bool,
}

/// What `acquire` hands back: enough to run one operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelHandle {
    /// Remote peer
    pub peer_id: PeerId,
    /// State at acquisition time
    pub state: ChannelState,
    /// Score at acquisition time
    pub quality_score: f64,
    /// Timeout and retries for the operation
    pub budget: OperationBudget,
}
