//! Memory-pressure shedding.
//!
//! Idle channels are cheap to rebuild, so they go first. Active channels
//! are never touched.

use crate::handler::{EdgeCaseHandler, EdgeEvent, MemoryPressure};
use lifeline_core::MemoryConfig;
use lifeline_mesh::{ChannelSnapshot, ChannelState, EvictReason, Intent};
use tracing::{info, warn};

/// Handler name
pub const NAME: &str = "memory_pressure";

/// Sheds channels and buffers as memory pressure rises
#[derive(Debug)]
pub struct MemoryPressureShedding {
    config: MemoryConfig,
    level: MemoryPressure,
    last_shed: usize,
}

impl MemoryPressureShedding {
    /// Build from tuning
    pub fn new(config: &MemoryConfig) -> Self {
        Self {
            config: config.clone(),
            level: MemoryPressure::Normal,
            last_shed: 0,
        }
    }

    /// Last reported level
    pub fn level(&self) -> MemoryPressure {
        self.level
    }

    fn shed_warning(&self, channels: &[ChannelSnapshot], now: u64) -> Vec<Intent> {
        channels
            .iter()
            .filter(|c| c.state == ChannelState::Idle)
            .filter(|c| {
                c.quality_score < self.config.low_score_threshold
                    || now.saturating_sub(c.last_activity_at) > self.config.idle_grace_ms
            })
            .map(|c| Intent::Evict {
                peer_id: c.peer_id.clone(),
                reason: EvictReason::MemoryPressure,
            })
            .collect()
    }

    fn shed_critical(channels: &[ChannelSnapshot]) -> Vec<Intent> {
        let mut intents = Vec::new();
        for channel in channels {
            match channel.state {
                ChannelState::Active => {}
                ChannelState::Idle => intents.push(Intent::Evict {
                    peer_id: channel.peer_id.clone(),
                    reason: EvictReason::MemoryPressure,
                }),
                _ => intents.push(Intent::ReleaseBuffers {
                    peer_id: channel.peer_id.clone(),
                }),
            }
        }
        intents
    }
}

impl EdgeCaseHandler for MemoryPressureShedding {
    fn name(&self) -> &'static str {
        NAME
    }

    fn observe(&mut self, event: &EdgeEvent, now: u64) -> Vec<Intent> {
        let EdgeEvent::MemoryPressure { level, channels } = event else {
            return Vec::new();
        };
        self.level = *level;

        let intents = match level {
            MemoryPressure::Normal => Vec::new(),
            MemoryPressure::Warning => self.shed_warning(channels, now),
            MemoryPressure::Critical => Self::shed_critical(channels),
        };
        self.last_shed = intents.len();

        match level {
            MemoryPressure::Critical => warn!(
                channels = channels.len(),
                actions = intents.len(),
                "Critical memory pressure; shedding idle channels and buffers"
            ),
            MemoryPressure::Warning => info!(
                channels = channels.len(),
                actions = intents.len(),
                "Memory pressure warning; shedding stale idle channels"
            ),
            MemoryPressure::Normal => {}
        }
        intents
    }

    fn active_actions(&self, _now: u64) -> Vec<String> {
        if self.level == MemoryPressure::Normal {
            Vec::new()
        } else {
            vec![format!(
                "memory pressure {}; {} shedding actions issued",
                self.level, self.last_shed
            )]
        }
    }

    fn reset(&mut self) {
        self.level = MemoryPressure::Normal;
        self.last_shed = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lifeline_core::ResilienceConfig;
    use lifeline_mesh::ChannelPool;

    fn pool_with(idle: usize, active: usize, failed: usize) -> Vec<ChannelSnapshot> {
        let config = ResilienceConfig::default();
        let mut pool = ChannelPool::with_seed(&config, 11);
        for i in 0..idle {
            pool.acquire(&format!("idle-{i}"), 0).unwrap();
        }
        for i in 0..active {
            let peer = format!("active-{i}");
            pool.acquire(&peer, 0).unwrap();
            pool.report_success(&peer, 20.0, 1_024, 0).unwrap();
        }
        for i in 0..failed {
            let peer = format!("failed-{i}");
            pool.acquire(&peer, 0).unwrap();
            pool.report_failure(&peer, lifeline_mesh::FailureReason::ChecksumMismatch, 0)
                .unwrap();
        }
        pool.snapshot(0).channels
    }

    #[test]
    fn test_critical_evicts_every_idle_channel() {
        let channels = pool_with(50, 5, 2);
        let mut shedding = MemoryPressureShedding::new(&MemoryConfig::default());
        let intents = shedding.observe(
            &EdgeEvent::MemoryPressure {
                level: MemoryPressure::Critical,
                channels,
            },
            100,
        );

        let evicted = intents.iter().filter(|i| matches!(i, Intent::Evict { .. })).count();
        let released = intents
            .iter()
            .filter(|i| matches!(i, Intent::ReleaseBuffers { .. }))
            .count();
        assert_eq!(evicted, 50);
        assert_eq!(released, 2);
        assert!(intents
            .iter()
            .all(|i| !i.peer_id().unwrap_or_default().starts_with("active-")));
    }

    #[test]
    fn test_warning_spares_fresh_idle_channels() {
        let channels = pool_with(3, 1, 0);
        let mut shedding = MemoryPressureShedding::new(&MemoryConfig::default());
        let event = EdgeEvent::MemoryPressure {
            level: MemoryPressure::Warning,
            channels,
        };
        // New idle channels score neutral and are recent
        assert!(shedding.observe(&event, 1_000).is_empty());
        // Past the grace period they are shed
        assert_eq!(shedding.observe(&event, 120_000).len(), 3);
        assert_eq!(shedding.active_actions(120_000).len(), 1);
    }

    #[test]
    fn test_normal_clears_actions() {
        let mut shedding = MemoryPressureShedding::new(&MemoryConfig::default());
        shedding.observe(
            &EdgeEvent::MemoryPressure {
                level: MemoryPressure::Critical,
                channels: Vec::new(),
            },
            0,
        );
        assert_eq!(shedding.level(), MemoryPressure::Critical);
        shedding.observe(
            &EdgeEvent::MemoryPressure {
                level: MemoryPressure::Normal,
                channels: Vec::new(),
            },
            1,
        );
        assert!(shedding.active_actions(1).is_empty());
    }
}
