//! The handler contract.
//!
//! A handler is a small, private state machine that watches [`EdgeEvent`]s
//! and answers two questions: should this operation go ahead now, and what
//! should the pool do about what was just observed. It never touches a
//! channel; corrective work leaves as [`Intent`]s.

use lifeline_core::PeerId;
use lifeline_mesh::{ChannelSnapshot, Intent};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Host memory pressure as reported by the platform
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryPressure {
    /// Nothing to do
    Normal,
    /// Shed what is cheap to rebuild
    Warning,
    /// Shed everything that is not carrying traffic
    Critical,
}

impl fmt::Display for MemoryPressure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MemoryPressure::Normal => "normal",
            MemoryPressure::Warning => "warning",
            MemoryPressure::Critical => "critical",
        };
        f.write_str(name)
    }
}

/// Utilization sample, each value in 0..1
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceSample {
    /// CPU utilization
    pub cpu: f64,
    /// Memory utilization
    pub memory: f64,
    /// Network utilization
    pub network: f64,
}

impl ResourceSample {
    /// The most exhausted resource; non-finite values count as zero
    pub fn peak(&self) -> f64 {
        [self.cpu, self.memory, self.network]
            .into_iter()
            .map(|v| if v.is_finite() { v.clamp(0.0, 1.0) } else { 0.0 })
            .fold(0.0, f64::max)
    }
}

/// Kind of operation asking for permission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    /// Outbound application message
    Send,
    /// Health probe
    Probe,
    /// Reconnect or session reset requested by recovery
    Remediate,
}

/// Everything handlers can see
#[derive(Debug, Clone)]
pub enum EdgeEvent {
    /// Someone wants to connect to a peer
    ConnectAttempt {
        /// Target peer
        peer_id: PeerId,
        /// Distinguishes concurrent attempts
        attempt_id: u64,
    },
    /// A connect attempt finished
    ConnectResolved {
        /// Target peer
        peer_id: PeerId,
        /// Attempt that finished
        attempt_id: u64,
        /// Whether the link came up
        success: bool,
    },
    /// Transport reported a link up
    PeerConnected {
        /// Remote peer
        peer_id: PeerId,
    },
    /// Transport reported a link down
    PeerDisconnected {
        /// Remote peer
        peer_id: PeerId,
    },
    /// App moved to the background
    Suspended {
        /// Channels known at suspend time
        channels: Vec<PeerId>,
    },
    /// App returned to the foreground
    Resumed,
    /// Memory pressure changed
    MemoryPressure {
        /// New level
        level: MemoryPressure,
        /// Channel set at the time of the report
        channels: Vec<ChannelSnapshot>,
    },
    /// Send-queue depth for a peer changed
    QueueDepth {
        /// Remote peer
        peer_id: PeerId,
        /// Sends in flight
        depth: usize,
    },
    /// An operation wants to run
    Operation {
        /// What it is
        kind: OperationKind,
        /// Target peer, if any
        peer_id: Option<PeerId>,
        /// Priority traffic
        priority: bool,
    },
    /// An exchange completed
    ExchangeObserved {
        /// Remote peer
        peer_id: PeerId,
        /// Measured latency (ceiling for timeouts)
        latency_ms: f64,
        /// Whether it succeeded
        success: bool,
    },
    /// Periodic utilization sample
    ResourceUsage(ResourceSample),
}

impl EdgeEvent {
    /// Short label for logs
    pub fn label(&self) -> &'static str {
        match self {
            EdgeEvent::ConnectAttempt { .. } => "connect_attempt",
            EdgeEvent::ConnectResolved { .. } => "connect_resolved",
            EdgeEvent::PeerConnected { .. } => "peer_connected",
            EdgeEvent::PeerDisconnected { .. } => "peer_disconnected",
            EdgeEvent::Suspended { .. } => "suspended",
            EdgeEvent::Resumed => "resumed",
            EdgeEvent::MemoryPressure { .. } => "memory_pressure",
            EdgeEvent::QueueDepth { .. } => "queue_depth",
            EdgeEvent::Operation { .. } => "operation",
            EdgeEvent::ExchangeObserved { .. } => "exchange_observed",
            EdgeEvent::ResourceUsage(_) => "resource_usage",
        }
    }
}

/// Answer to "may this go ahead"
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum Verdict {
    /// Go ahead
    Allow,
    /// Do not go ahead
    Deny {
        /// Why
        reason: String,
    },
    /// Try again later
    Defer {
        /// Suggested delay
        retry_after_ms: u64,
    },
}

/// A handler's verdict plus any intents it wants executed
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    /// Verdict
    pub verdict: Verdict,
    /// Corrective actions
    pub intents: Vec<Intent>,
    /// Handler whose verdict this is
    pub decided_by: Option<&'static str>,
}

impl Decision {
    /// Allow with no intents
    pub fn allow() -> Self {
        Self {
            verdict: Verdict::Allow,
            intents: Vec::new(),
            decided_by: None,
        }
    }

    /// Deny with a reason
    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            verdict: Verdict::Deny {
                reason: reason.into(),
            },
            intents: Vec::new(),
            decided_by: None,
        }
    }

    /// Defer for `retry_after_ms`
    pub fn defer(retry_after_ms: u64) -> Self {
        Self {
            verdict: Verdict::Defer { retry_after_ms },
            intents: Vec::new(),
            decided_by: None,
        }
    }

    /// Whether the verdict is `Allow`
    pub fn is_allowed(&self) -> bool {
        self.verdict == Verdict::Allow
    }

    /// Combine many decisions: any deny wins, otherwise the longest defer,
    /// otherwise allow. Intents are concatenated in order.
    pub fn combine(decisions: impl IntoIterator<Item = Decision>) -> Decision {
        let mut combined = Decision::allow();
        for decision in decisions {
            combined.intents.extend(decision.intents);
            let replace = match (&combined.verdict, &decision.verdict) {
                (Verdict::Deny { .. }, _) => false,
                (_, Verdict::Deny { .. }) => true,
                (Verdict::Defer { retry_after_ms: a }, Verdict::Defer { retry_after_ms: b }) => b > a,
                (Verdict::Allow, Verdict::Defer { .. }) => true,
                (_, Verdict::Allow) => false,
            };
            if replace {
                combined.verdict = decision.verdict;
                combined.decided_by = decision.decided_by;
            }
        }
        combined
    }
}

/// One mitigation policy
pub trait EdgeCaseHandler: Send + 'static {
    /// Stable handler name
    fn name(&self) -> &'static str;

    /// Decide whether the operation behind `event` may go ahead
    fn should_allow(&mut self, _event: &EdgeEvent, _now: u64) -> Decision {
        Decision::allow()
    }

    /// Give back what `should_allow` reserved for `event` when the combined
    /// verdict kept the operation from running
    fn release(&mut self, _event: &EdgeEvent, _now: u64) {}

    /// Update private state; return corrective intents
    fn observe(&mut self, _event: &EdgeEvent, _now: u64) -> Vec<Intent> {
        Vec::new()
    }

    /// Time-driven housekeeping
    fn tick(&mut self, _now: u64) -> Vec<Intent> {
        Vec::new()
    }

    /// Human-readable list of mitigations currently in force
    fn active_actions(&self, now: u64) -> Vec<String>;

    /// Forget all state
    fn reset(&mut self);
}
