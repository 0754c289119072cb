//! Network-instability adaptation.
//!
//! Volatility is the coefficient of variation of recent latencies. A peer
//! whose latency swings or whose error fraction climbs gets the
//! conservative timeout profile; it goes back to standard only once both
//! settle well below the trigger levels.

use crate::handler::{EdgeCaseHandler, EdgeEvent};
use lifeline_core::{InstabilityConfig, PeerId};
use lifeline_mesh::{Intent, TimeoutProfile};
use std::collections::{HashMap, VecDeque};
use tracing::info;

/// Handler name
pub const NAME: &str = "network_instability";

#[derive(Debug, Default)]
struct PeerSamples {
    samples: VecDeque<(f64, bool)>,
    conservative: bool,
}

impl PeerSamples {
    fn volatility(&self) -> f64 {
        let latencies: Vec<f64> = self
            .samples
            .iter()
            .filter(|(latency, ok)| *ok && latency.is_finite() && *latency >= 0.0)
            .map(|(latency, _)| *latency)
            .collect();
        if latencies.len() < 2 {
            return 0.0;
        }
        let n = latencies.len() as f64;
        let mean = latencies.iter().sum::<f64>() / n;
        if mean <= f64::EPSILON {
            return 0.0;
        }
        let variance = latencies.iter().map(|l| (l - mean).powi(2)).sum::<f64>() / n;
        variance.sqrt() / mean
    }

    fn error_rate(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let failures = self.samples.iter().filter(|(_, ok)| !ok).count();
        failures as f64 / self.samples.len() as f64
    }
}

/// Switches unstable peers to the conservative timeout profile
#[derive(Debug)]
pub struct NetworkInstability {
    config: InstabilityConfig,
    peers: HashMap<PeerId, PeerSamples>,
}

impl NetworkInstability {
    /// Build from tuning
    pub fn new(config: &InstabilityConfig) -> Self {
        Self {
            config: config.clone(),
            peers: HashMap::new(),
        }
    }

    /// Whether `peer_id` is on the conservative profile
    pub fn is_conservative(&self, peer_id: &str) -> bool {
        self.peers.get(peer_id).is_some_and(|p| p.conservative)
    }

    /// Current latency volatility of `peer_id`
    pub fn volatility(&self, peer_id: &str) -> f64 {
        self.peers.get(peer_id).map_or(0.0, PeerSamples::volatility)
    }
}

impl EdgeCaseHandler for NetworkInstability {
    fn name(&self) -> &'static str {
        NAME
    }

    fn observe(&mut self, event: &EdgeEvent, _now: u64) -> Vec<Intent> {
        match event {
            EdgeEvent::ExchangeObserved {
                peer_id,
                latency_ms,
                success,
            } => {
                let window = self.config.window.max(2);
                let entry = self.peers.entry(peer_id.clone()).or_default();
                entry.samples.push_back((*latency_ms, *success));
                while entry.samples.len() > window {
                    entry.samples.pop_front();
                }
                if entry.samples.len() < self.config.min_samples {
                    return Vec::new();
                }

                let volatility = entry.volatility();
                let error_rate = entry.error_rate();
                let profile = if !entry.conservative
                    && (volatility > self.config.volatility_threshold
                        || error_rate > self.config.error_rate_threshold)
                {
                    entry.conservative = true;
                    TimeoutProfile::Conservative
                } else if entry.conservative
                    && volatility < self.config.recovery_threshold
                    && error_rate < self.config.error_rate_threshold / 2.0
                {
                    entry.conservative = false;
                    TimeoutProfile::Standard
                } else {
                    return Vec::new();
                };

                info!(
                    peer_id = %peer_id,
                    volatility,
                    error_rate,
                    profile = ?profile,
                    "Timeout profile changed"
                );
                vec![Intent::SetTimeoutProfile {
                    peer_id: peer_id.clone(),
                    profile,
                }]
            }
            EdgeEvent::PeerDisconnected { peer_id } => {
                // Keep the verdict; drop samples from the dead link
                if let Some(entry) = self.peers.get_mut(peer_id) {
                    entry.samples.clear();
                }
                Vec::new()
            }
            _ => Vec::new(),
        }
    }

    fn active_actions(&self, _now: u64) -> Vec<String> {
        let mut actions: Vec<String> = self
            .peers
            .iter()
            .filter(|(_, p)| p.conservative)
            .map(|(peer_id, _)| format!("{peer_id} on conservative timeouts"))
            .collect();
        actions.sort();
        actions
    }

    fn reset(&mut self) {
        self.peers.clear();
    }
}
