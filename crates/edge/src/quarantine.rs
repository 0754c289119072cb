//! Rapid-disconnect quarantine.
//!
//! A peer that drops N times inside the observation window is kept away
//! from reconnection for `base · 2^level`, capped. When the quarantine
//! ends the peer is on probation: one reconnect per probe interval until a
//! quiet period forgives it. Every quiet period also forgives one
//! escalation level.

use crate::handler::{Decision, EdgeCaseHandler, EdgeEvent, OperationKind};
use lifeline_core::{PeerId, QuarantineConfig};
use lifeline_mesh::Intent;
use std::collections::{HashMap, VecDeque};
use tracing::{debug, info};

/// Handler name
pub const NAME: &str = "rapid_disconnect_quarantine";

#[derive(Debug, Default)]
struct PeerRecord {
    disconnects: VecDeque<u64>,
    level: u32,
    quarantined_until: Option<u64>,
    last_probe_at: Option<u64>,
    /// Probation slot handed out by the last admission and the slot before it
    granted: Option<(u64, Option<u64>)>,
    quiet_since: u64,
}

impl PeerRecord {
    fn is_quarantined(&self, now: u64) -> bool {
        self.quarantined_until.is_some_and(|until| until > now)
    }

    fn on_probation(&self, now: u64, decay_after_ms: u64) -> bool {
        self.quarantined_until
            .is_some_and(|until| until <= now && now < until.saturating_add(decay_after_ms))
    }
}

/// Quarantines flapping peers with escalating durations
#[derive(Debug)]
pub struct RapidDisconnectQuarantine {
    config: QuarantineConfig,
    base_duration_ms: u64,
    peers: HashMap<PeerId, PeerRecord>,
}

impl RapidDisconnectQuarantine {
    /// Build from tuning and the base quarantine duration
    pub fn new(config: &QuarantineConfig, base_duration_ms: u64) -> Self {
        Self {
            config: config.clone(),
            base_duration_ms,
            peers: HashMap::new(),
        }
    }

    /// Duration for a quarantine at `level`
    pub fn duration_for(&self, level: u32) -> u64 {
        let factor = 1u64.checked_shl(level.min(32)).unwrap_or(u64::MAX);
        self.base_duration_ms
            .saturating_mul(factor)
            .min(self.config.max_duration_ms)
    }

    /// Current escalation level of a peer
    pub fn level(&self, peer_id: &str) -> u32 {
        self.peers.get(peer_id).map_or(0, |record| record.level)
    }

    /// End of the active quarantine, if any
    pub fn quarantined_until(&self, peer_id: &str, now: u64) -> Option<u64> {
        self.peers
            .get(peer_id)
            .filter(|record| record.is_quarantined(now))
            .and_then(|record| record.quarantined_until)
    }

    fn on_disconnect(&mut self, peer_id: &str, now: u64) -> Option<Intent> {
        let threshold = self.config.disconnect_threshold.max(1);
        let window_start = now.saturating_sub(self.config.window_ms);
        let max_level = self.config.max_level;

        let record = self.peers.entry(peer_id.to_string()).or_default();
        record.quiet_since = now;
        if record.is_quarantined(now) {
            return None;
        }

        record.disconnects.push_back(now);
        while record.disconnects.front().is_some_and(|&t| t < window_start) {
            record.disconnects.pop_front();
        }
        if record.disconnects.len() < threshold {
            return None;
        }

        let level = record.level;
        record.disconnects.clear();
        record.level = (level + 1).min(max_level);
        record.last_probe_at = None;
        record.granted = None;
        let duration_ms = self.duration_for(level);
        let until = now.saturating_add(duration_ms);
        if let Some(record) = self.peers.get_mut(peer_id) {
            record.quarantined_until = Some(until);
        }

        info!(
            peer_id = %peer_id,
            level,
            duration_ms,
            until,
            "Peer quarantined after rapid disconnects"
        );
        Some(Intent::Quarantine {
            peer_id: peer_id.to_string(),
            duration_ms,
            level,
        })
    }
}

impl EdgeCaseHandler for RapidDisconnectQuarantine {
    fn name(&self) -> &'static str {
        NAME
    }

    fn should_allow(&mut self, event: &EdgeEvent, now: u64) -> Decision {
        let peer_id = match event {
            EdgeEvent::ConnectAttempt { peer_id, .. } => peer_id,
            EdgeEvent::Operation {
                kind: OperationKind::Remediate,
                peer_id: Some(peer_id),
                ..
            } => peer_id,
            _ => return Decision::allow(),
        };
        let probe_interval = self.config.probe_interval_ms;
        let decay_after = self.config.decay_after_ms;
        let Some(record) = self.peers.get_mut(peer_id) else {
            return Decision::allow();
        };

        if let Some(until) = record.quarantined_until.filter(|&until| until > now) {
            return Decision::deny(format!("peer {peer_id} quarantined until {until}"));
        }
        if record.on_probation(now, decay_after) {
            if let Some(last) = record.last_probe_at {
                let next = last.saturating_add(probe_interval);
                if next > now {
                    return Decision::defer(next - now);
                }
            }
            record.granted = Some((now, record.last_probe_at));
            record.last_probe_at = Some(now);
            debug!(peer_id = %peer_id, "Probation reconnect admitted");
        }
        Decision::allow()
    }

    fn release(&mut self, event: &EdgeEvent, _now: u64) {
        let peer_id = match event {
            EdgeEvent::ConnectAttempt { peer_id, .. } => peer_id,
            EdgeEvent::Operation {
                kind: OperationKind::Remediate,
                peer_id: Some(peer_id),
                ..
            } => peer_id,
            _ => return,
        };
        let Some(record) = self.peers.get_mut(peer_id) else {
            return;
        };
        if let Some((granted_at, previous)) = record.granted.take() {
            if record.last_probe_at == Some(granted_at) {
                record.last_probe_at = previous;
                debug!(peer_id = %peer_id, "Probation slot returned");
            }
        }
    }

    fn observe(&mut self, event: &EdgeEvent, now: u64) -> Vec<Intent> {
        match event {
            EdgeEvent::PeerDisconnected { peer_id } => self.on_disconnect(peer_id, now).into_iter().collect(),
            _ => Vec::new(),
        }
    }

    fn tick(&mut self, now: u64) -> Vec<Intent> {
        let decay_after = self.config.decay_after_ms;
        let window = self.config.window_ms;
        self.peers.retain(|peer_id, record| {
            if record.is_quarantined(now) {
                return true;
            }
            let quiet_from = record
                .quarantined_until
                .map_or(record.quiet_since, |until| until.max(record.quiet_since));
            if record.level > 0 && now.saturating_sub(quiet_from) >= decay_after {
                record.level -= 1;
                record.quiet_since = now;
                debug!(peer_id = %peer_id, level = record.level, "Quarantine level decayed");
            }
            let window_start = now.saturating_sub(window);
            while record.disconnects.front().is_some_and(|&t| t < window_start) {
                record.disconnects.pop_front();
            }
            record.level > 0 || !record.disconnects.is_empty() || record.on_probation(now, decay_after)
        });
        Vec::new()
    }

    fn active_actions(&self, now: u64) -> Vec<String> {
        let mut actions = Vec::new();
        for (peer_id, record) in &self.peers {
            if let Some(until) = record.quarantined_until.filter(|&until| until > now) {
                actions.push(format!("{peer_id} quarantined until {until} (level {})", record.level));
            } else if record.on_probation(now, self.config.decay_after_ms) {
                actions.push(format!("{peer_id} on probation"));
            }
        }
        actions.sort();
        actions
    }

    fn reset(&mut self) {
        self.peers.clear();
    }
}
