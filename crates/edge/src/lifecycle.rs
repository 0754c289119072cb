//! Background/foreground transitions.
//!
//! While the app is suspended the OS may have torn down links without
//! telling anyone. Operations are held back until resume, and every channel
//! known at suspend time must pass a probe before it is trusted again.

use crate::handler::{Decision, EdgeCaseHandler, EdgeEvent};
use lifeline_core::{LifecycleConfig, PeerId};
use lifeline_mesh::Intent;
use tracing::info;

/// Handler name
pub const NAME: &str = "lifecycle_transition";

/// Suspend/resume tracker
#[derive(Debug)]
pub struct LifecycleTransition {
    config: LifecycleConfig,
    suspended_at: Option<u64>,
    snapshot: Vec<PeerId>,
}

impl LifecycleTransition {
    /// Build from tuning
    pub fn new(config: &LifecycleConfig) -> Self {
        Self {
            config: config.clone(),
            suspended_at: None,
            snapshot: Vec::new(),
        }
    }

    /// Whether the app is currently suspended
    pub fn is_suspended(&self) -> bool {
        self.suspended_at.is_some()
    }
}

impl EdgeCaseHandler for LifecycleTransition {
    fn name(&self) -> &'static str {
        NAME
    }

    fn should_allow(&mut self, event: &EdgeEvent, _now: u64) -> Decision {
        match event {
            EdgeEvent::ConnectAttempt { .. } | EdgeEvent::Operation { .. } if self.is_suspended() => {
                Decision::defer(self.config.suspended_retry_ms)
            }
            _ => Decision::allow(),
        }
    }

    fn observe(&mut self, event: &EdgeEvent, now: u64) -> Vec<Intent> {
        match event {
            EdgeEvent::Suspended { channels } => {
                // A second suspend keeps the first snapshot and adds new peers
                if self.suspended_at.is_none() {
                    self.suspended_at = Some(now);
                    self.snapshot.clear();
                }
                for peer_id in channels {
                    if !self.snapshot.contains(peer_id) {
                        self.snapshot.push(peer_id.clone());
                    }
                }
                info!(channels = self.snapshot.len(), "Suspended; operations deferred");
                Vec::new()
            }
            EdgeEvent::Resumed => {
                let Some(since) = self.suspended_at.take() else {
                    return Vec::new();
                };
                let peer_ids = std::mem::take(&mut self.snapshot);
                info!(
                    channels = peer_ids.len(),
                    suspended_ms = now.saturating_sub(since),
                    "Resumed; revalidating channels"
                );
                if peer_ids.is_empty() {
                    Vec::new()
                } else {
                    vec![Intent::Revalidate { peer_ids }]
                }
            }
            _ => Vec::new(),
        }
    }

    fn active_actions(&self, _now: u64) -> Vec<String> {
        match self.suspended_at {
            Some(since) => vec![format!(
                "suspended since {since}; {} channels pending revalidation",
                self.snapshot.len()
            )],
            None => Vec::new(),
        }
    }

    fn reset(&mut self) {
        self.suspended_at = None;
        self.snapshot.clear();
    }
}
