//! Status and diagnostics reports

use lifeline_edge::{AdmissionStats, WorkerHealth};
use lifeline_mesh::{
    ChannelSnapshot, ChannelState, LayerStatus, MetricsSnapshot, OverallNetworkState,
    PoolHealthReport, Transition,
};
use lifeline_core::PeerId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Health of one channel as shown in the status report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelHealth {
    /// Remote peer
    pub peer_id: PeerId,
    /// Lifecycle state
    pub state: ChannelState,
    /// Composite quality score
    pub quality_score: f64,
    /// Whether routed traffic may use it
    pub routable: bool,
    /// Active quarantine end
    pub quarantined_until: Option<u64>,
    /// Messages waiting for the circuit to close
    pub queued_messages: usize,
}

impl From<&ChannelSnapshot> for ChannelHealth {
    fn from(snapshot: &ChannelSnapshot) -> Self {
        Self {
            peer_id: snapshot.peer_id.clone(),
            state: snapshot.state,
            quality_score: snapshot.quality_score,
            routable: snapshot.routable,
            quarantined_until: snapshot.quarantined_until,
            queued_messages: snapshot.queued_messages,
        }
    }
}

/// Summary for operators and the app UI
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemStatusReport {
    /// When the report was built
    pub generated_at: u64,
    /// Committed network state
    pub overall_state: OverallNetworkState,
    /// Whether the degraded fraction reached the emergency threshold
    pub emergency_mode: bool,
    /// Per-channel health, sorted by peer id
    pub per_channel_health: Vec<ChannelHealth>,
    /// Mitigations in force, keyed by handler
    pub active_handler_actions: BTreeMap<String, Vec<String>>,
}

/// Result of an emergency recovery
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmergencyRecoveryReport {
    /// When recovery ran
    pub performed_at: u64,
    /// Channels dropped from the pool
    pub evicted_channels: usize,
    /// Handlers that confirmed their reset
    pub handlers_reset: usize,
    /// Admission limit after recovery
    pub admission_limit: usize,
}

/// Health of every subsystem
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticsReport {
    /// When the report was built
    pub generated_at: u64,
    /// Committed network state
    pub overall_state: OverallNetworkState,
    /// Pool aggregate and per-channel detail
    pub pool: PoolHealthReport,
    /// Latest report and effective state per layer
    pub layers: Vec<LayerStatus>,
    /// Handler worker health
    pub handler_workers: Vec<WorkerHealth>,
    /// Admission gate statistics
    pub admission: AdmissionStats,
    /// Counter totals
    pub metrics: MetricsSnapshot,
    /// Most recent channel transitions
    pub recent_transitions: Vec<Transition>,
    /// Things an operator should look at
    pub issues: Vec<String>,
}

impl DiagnosticsReport {
    /// Whether nothing needs attention
    pub fn is_healthy(&self) -> bool {
        self.issues.is_empty()
    }
}

/// Collect what deserves an operator's attention
pub(crate) fn find_issues(
    pool: &PoolHealthReport,
    layers: &[LayerStatus],
    workers: &[WorkerHealth],
    admission: &AdmissionStats,
) -> Vec<String> {
    let mut issues = Vec::new();
    if pool.emergency_mode {
        issues.push(format!(
            "emergency mode: {:.0}% of channels degraded",
            pool.degraded_fraction * 100.0
        ));
    }
    for peer_id in &pool.isolated_channels {
        issues.push(format!("channel {peer_id} isolated after a fatal error"));
    }
    for layer in layers.iter().filter(|l| l.stale) {
        issues.push(format!("{} layer report is stale", layer.layer));
    }
    for worker in workers {
        if !worker.running {
            issues.push(format!("handler {} is not running", worker.handler));
        }
        if worker.intents_dropped > 0 {
            issues.push(format!(
                "handler {} dropped {} intents",
                worker.handler, worker.intents_dropped
            ));
        }
    }
    if admission.limit < admission.max_limit {
        issues.push(format!(
            "admission limit reduced to {} of {}",
            admission.limit, admission.max_limit
        ));
    }
    issues
}
