//! Channel contention and backpressure.

use crate::handler::{Decision, EdgeCaseHandler, EdgeEvent, OperationKind};
use lifeline_core::{BackpressureConfig, PeerId};
use lifeline_mesh::Intent;
use std::collections::HashMap;
use tracing::debug;

/// Handler name
pub const NAME: &str = "backpressure";

/// Holds back non-priority sends to congested peers and routes around them
#[derive(Debug)]
pub struct Backpressure {
    config: BackpressureConfig,
    depths: HashMap<PeerId, usize>,
    routed_around: HashMap<PeerId, u64>,
}

impl Backpressure {
    /// Build from tuning
    pub fn new(config: &BackpressureConfig) -> Self {
        Self {
            config: config.clone(),
            depths: HashMap::new(),
            routed_around: HashMap::new(),
        }
    }

    /// Whether `peer_id` is over the depth threshold
    pub fn is_congested(&self, peer_id: &str) -> bool {
        self.depths
            .get(peer_id)
            .is_some_and(|&depth| depth > self.config.queue_depth_threshold)
    }
}

impl EdgeCaseHandler for Backpressure {
    fn name(&self) -> &'static str {
        NAME
    }

    fn should_allow(&mut self, event: &EdgeEvent, _now: u64) -> Decision {
        match event {
            EdgeEvent::Operation {
                kind: OperationKind::Send,
                peer_id: Some(peer_id),
                priority: false,
            } if self.is_congested(peer_id) => Decision::defer(self.config.defer_ms),
            _ => Decision::allow(),
        }
    }

    fn observe(&mut self, event: &EdgeEvent, now: u64) -> Vec<Intent> {
        let EdgeEvent::QueueDepth { peer_id, depth } = event else {
            return Vec::new();
        };
        if *depth == 0 {
            self.depths.remove(peer_id);
            return Vec::new();
        }
        self.depths.insert(peer_id.clone(), *depth);
        if *depth <= self.config.queue_depth_threshold {
            return Vec::new();
        }
        if self.routed_around.get(peer_id).is_some_and(|&until| until > now) {
            return Vec::new();
        }

        let duration_ms = self.config.route_around_ms;
        self.routed_around
            .insert(peer_id.clone(), now.saturating_add(duration_ms));
        debug!(peer_id = %peer_id, depth, duration_ms, "Routing around congested peer");
        vec![Intent::RouteAround {
            peer_id: peer_id.clone(),
            duration_ms,
        }]
    }

    fn tick(&mut self, now: u64) -> Vec<Intent> {
        self.routed_around.retain(|_, until| *until > now);
        Vec::new()
    }

    fn active_actions(&self, now: u64) -> Vec<String> {
        let mut actions: Vec<String> = self
            .routed_around
            .iter()
            .filter(|(_, &until)| until > now)
            .map(|(peer_id, until)| format!("routing around {peer_id} until {until}"))
            .collect();
        actions.sort();
        actions
    }

    fn reset(&mut self) {
        self.depths.clear();
        self.routed_around.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::Verdict;

    fn send(peer: &str, priority: bool) -> EdgeEvent {
        EdgeEvent::Operation {
            kind: OperationKind::Send,
            peer_id: Some(peer.to_string()),
            priority,
        }
    }

    fn depth(peer: &str, depth: usize) -> EdgeEvent {
        EdgeEvent::QueueDepth {
            peer_id: peer.to_string(),
            depth,
        }
    }

    #[test]
    fn test_deep_queue_defers_normal_but_not_priority() {
        let mut bp = Backpressure::new(&BackpressureConfig::default());
        let intents = bp.observe(&depth("peer-a", 40), 0);
        assert_eq!(
            intents,
            vec![Intent::RouteAround {
                peer_id: "peer-a".into(),
                duration_ms: 5_000,
            }]
        );

        assert_eq!(
            bp.should_allow(&send("peer-a", false), 1).verdict,
            Verdict::Defer { retry_after_ms: 200 }
        );
        assert!(bp.should_allow(&send("peer-a", true), 1).is_allowed());
        assert!(bp.should_allow(&send("peer-b", false), 1).is_allowed());
    }

    #[test]
    fn test_route_around_not_repeated_while_in_force() {
        let mut bp = Backpressure::new(&BackpressureConfig::default());
        assert_eq!(bp.observe(&depth("peer-a", 40), 0).len(), 1);
        assert!(bp.observe(&depth("peer-a", 45), 1_000).is_empty());
        bp.tick(5_000);
        assert_eq!(bp.observe(&depth("peer-a", 45), 5_001).len(), 1);
    }

    #[test]
    fn test_draining_queue_lifts_deferral() {
        let mut bp = Backpressure::new(&BackpressureConfig::default());
        bp.observe(&depth("peer-a", 40), 0);
        bp.observe(&depth("peer-a", 3), 10);
        assert!(bp.should_allow(&send("peer-a", false), 11).is_allowed());
        bp.observe(&depth("peer-a", 0), 12);
        assert!(!bp.is_congested("peer-a"));
    }
}
