//! Simultaneous-connection dedup.
//!
//! Two sides of a link often dial each other at the same moment. Only one
//! attempt per peer may be in flight; the rest are told to come back after
//! a randomized delay so retries do not collide again.

use crate::handler::{Decision, EdgeCaseHandler, EdgeEvent};
use lifeline_core::{DedupConfig, PeerId};
use lifeline_mesh::Intent;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use tracing::debug;

/// Handler name
pub const NAME: &str = "connection_dedup";

#[derive(Debug, Clone, Copy)]
struct ConnectLock {
    attempt_id: u64,
    expires_at: u64,
}

/// One in-flight connect attempt per peer
#[derive(Debug)]
pub struct ConnectionDedup {
    config: DedupConfig,
    locks: HashMap<PeerId, ConnectLock>,
    rng: StdRng,
    deferred: u64,
}

impl ConnectionDedup {
    /// Build with entropy-seeded jitter
    pub fn new(config: &DedupConfig) -> Self {
        Self::with_rng(config, StdRng::from_entropy())
    }

    /// Build with a fixed seed
    pub fn with_seed(config: &DedupConfig, seed: u64) -> Self {
        Self::with_rng(config, StdRng::seed_from_u64(seed))
    }

    fn with_rng(config: &DedupConfig, rng: StdRng) -> Self {
        Self {
            config: config.clone(),
            locks: HashMap::new(),
            rng,
            deferred: 0,
        }
    }

    /// Whether an unexpired lock is held for `peer_id`
    pub fn is_locked(&self, peer_id: &str, now: u64) -> bool {
        self.locks.get(peer_id).is_some_and(|lock| lock.expires_at > now)
    }

    /// Attempts deferred so far
    pub fn deferred(&self) -> u64 {
        self.deferred
    }

    fn jitter(&mut self) -> u64 {
        let ceiling = self.config.retry_jitter_ms.max(1);
        self.rng.gen_range(1..=ceiling)
    }
}

impl EdgeCaseHandler for ConnectionDedup {
    fn name(&self) -> &'static str {
        NAME
    }

    fn should_allow(&mut self, event: &EdgeEvent, now: u64) -> Decision {
        let EdgeEvent::ConnectAttempt {
            peer_id,
            attempt_id,
        } = event
        else {
            return Decision::allow();
        };

        match self.locks.get(peer_id).copied() {
            Some(lock) if lock.expires_at > now && lock.attempt_id != *attempt_id => {
                let retry_after_ms = self.jitter();
                self.deferred += 1;
                debug!(
                    peer_id = %peer_id,
                    holder = lock.attempt_id,
                    attempt_id,
                    retry_after_ms,
                    "Connect attempt already in flight"
                );
                Decision::defer(retry_after_ms)
            }
            _ => {
                self.locks.insert(
                    peer_id.clone(),
                    ConnectLock {
                        attempt_id: *attempt_id,
                        expires_at: now.saturating_add(self.config.lock_ttl_ms),
                    },
                );
                Decision::allow()
            }
        }
    }

    fn release(&mut self, event: &EdgeEvent, _now: u64) {
        if let EdgeEvent::ConnectAttempt {
            peer_id,
            attempt_id,
        } = event
        {
            if self.locks.get(peer_id).is_some_and(|lock| lock.attempt_id == *attempt_id) {
                self.locks.remove(peer_id);
            }
        }
    }

    fn observe(&mut self, event: &EdgeEvent, _now: u64) -> Vec<Intent> {
        match event {
            EdgeEvent::ConnectResolved {
                peer_id,
                attempt_id,
                ..
            } => {
                if self.locks.get(peer_id).is_some_and(|lock| lock.attempt_id == *attempt_id) {
                    self.locks.remove(peer_id);
                }
            }
            EdgeEvent::PeerConnected { peer_id } => {
                self.locks.remove(peer_id);
            }
            _ => {}
        }
        Vec::new()
    }

    fn tick(&mut self, now: u64) -> Vec<Intent> {
        self.locks.retain(|peer_id, lock| {
            let live = lock.expires_at > now;
            if !live {
                debug!(peer_id = %peer_id, attempt_id = lock.attempt_id, "Connect lock expired");
            }
            live
        });
        Vec::new()
    }

    fn active_actions(&self, now: u64) -> Vec<String> {
        let mut actions: Vec<String> = self
            .locks
            .iter()
            .filter(|(_, lock)| lock.expires_at > now)
            .map(|(peer_id, lock)| format!("connect to {peer_id} in flight (attempt {})", lock.attempt_id))
            .collect();
        actions.sort();
        actions
    }

    fn reset(&mut self) {
        self.locks.clear();
        self.deferred = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::Verdict;

    fn attempt(peer: &str, id: u64) -> EdgeEvent {
        EdgeEvent::ConnectAttempt {
            peer_id: peer.to_string(),
            attempt_id: id,
        }
    }

    #[test]
    fn test_second_attempt_is_deferred_with_jitter() {
        let config = DedupConfig::default();
        let mut dedup = ConnectionDedup::with_seed(&config, 7);

        assert!(dedup.should_allow(&attempt("peer-a", 1), 0).is_allowed());
        match dedup.should_allow(&attempt("peer-a", 2), 10).verdict {
            Verdict::Defer { retry_after_ms } => {
                assert!(retry_after_ms >= 1 && retry_after_ms <= config.retry_jitter_ms)
            }
            other => panic!("expected defer, got {other:?}"),
        }
        // Other peers are unaffected
        assert!(dedup.should_allow(&attempt("peer-b", 3), 10).is_allowed());
        assert_eq!(dedup.deferred(), 1);
    }

    #[test]
    fn test_resolution_releases_lock() {
        let mut dedup = ConnectionDedup::with_seed(&DedupConfig::default(), 1);
        dedup.should_allow(&attempt("peer-a", 1), 0);

        // A stale resolution for another attempt does not release
        dedup.observe(
            &EdgeEvent::ConnectResolved {
                peer_id: "peer-a".into(),
                attempt_id: 9,
                success: false,
            },
            5,
        );
        assert!(dedup.is_locked("peer-a", 5));

        dedup.observe(
            &EdgeEvent::ConnectResolved {
                peer_id: "peer-a".into(),
                attempt_id: 1,
                success: false,
            },
            6,
        );
        assert!(!dedup.is_locked("peer-a", 6));
        assert!(dedup.should_allow(&attempt("peer-a", 2), 7).is_allowed());
    }

    #[test]
    fn test_release_drops_only_own_lock() {
        let mut dedup = ConnectionDedup::with_seed(&DedupConfig::default(), 5);
        dedup.should_allow(&attempt("peer-a", 1), 0);
        dedup.release(&attempt("peer-a", 2), 1);
        assert!(dedup.is_locked("peer-a", 1));
        dedup.release(&attempt("peer-a", 1), 2);
        assert!(!dedup.is_locked("peer-a", 2));
    }

    #[test]
    fn test_lock_expires_after_ttl() {
        let config = DedupConfig {
            lock_ttl_ms: 100,
            retry_jitter_ms: 10,
        };
        let mut dedup = ConnectionDedup::with_seed(&config, 3);
        dedup.should_allow(&attempt("peer-a", 1), 0);
        assert!(!dedup.should_allow(&attempt("peer-a", 2), 50).is_allowed());
        assert!(dedup.should_allow(&attempt("peer-a", 2), 100).is_allowed());

        dedup.tick(500);
        assert!(dedup.active_actions(500).is_empty());
    }

    #[test]
    fn test_peer_connected_clears_lock() {
        let mut dedup = ConnectionDedup::with_seed(&DedupConfig::default(), 3);
        dedup.should_allow(&attempt("peer-a", 1), 0);
        assert_eq!(dedup.active_actions(0).len(), 1);
        dedup.observe(
            &EdgeEvent::PeerConnected {
                peer_id: "peer-a".into(),
            },
            1,
        );
        assert!(!dedup.is_locked("peer-a", 1));
    }
}
