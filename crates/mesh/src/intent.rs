//! Corrective intents issued by edge-case handlers.
//!
//! Handlers never touch a channel. They describe what should happen and the
//! pool manager executes it on its own task, so every channel keeps exactly
//! one writer.

use crate::channel::TimeoutProfile;
use crate::event::EvictReason;
use lifeline_core::PeerId;
use serde::{Deserialize, Serialize};

/// A corrective action for the pool to carry out
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "intent", rename_all = "snake_case")]
pub enum Intent {
    /// Exclude a peer from reconnection for `duration_ms`
    Quarantine {
        /// Flapping peer
        peer_id: PeerId,
        /// Quarantine length
        duration_ms: u64,
        /// Escalation level that produced the duration
        level: u32,
    },
    /// End a quarantine early
    LiftQuarantine {
        /// Peer to release
        peer_id: PeerId,
    },
    /// Remove a channel from the pool
    Evict {
        /// Peer to evict
        peer_id: PeerId,
        /// Recorded reason
        reason: EvictReason,
    },
    /// Drop buffered outbound messages of a channel
    ReleaseBuffers {
        /// Peer whose queue is released
        peer_id: PeerId,
    },
    /// Distrust these channels until a probe succeeds
    Revalidate {
        /// Peers to re-check
        peer_ids: Vec<PeerId>,
    },
    /// Change the operation budget of a channel
    SetTimeoutProfile {
        /// Affected peer
        peer_id: PeerId,
        /// New profile
        profile: TimeoutProfile,
    },
    /// Keep routed traffic away from a peer for a while
    RouteAround {
        /// Congested peer
        peer_id: PeerId,
        /// Penalty length
        duration_ms: u64,
    },
    /// Drop every channel and start over
    ResetSubsystem {
        /// Human-readable cause, logged and shown in diagnostics
        reason: String,
    },
}

impl Intent {
    /// Peer the intent targets, if it targets exactly one
    pub fn peer_id(&self) -> Option<&str> {
        match self {
            Intent::Quarantine { peer_id, .. }
            | Intent::LiftQuarantine { peer_id }
            | Intent::Evict { peer_id, .. }
            | Intent::ReleaseBuffers { peer_id }
            | Intent::SetTimeoutProfile { peer_id, .. }
            | Intent::RouteAround { peer_id, .. } => Some(peer_id),
            Intent::Revalidate { .. } | Intent::ResetSubsystem { .. } => None,
        }
    }

    /// Short label used in logs and status reports
    pub fn label(&self) -> &'static str {
        match self {
            Intent::Quarantine { .. } => "quarantine",
            Intent::LiftQuarantine { .. } => "lift_quarantine",
            Intent::Evict { .. } => "evict",
            Intent::ReleaseBuffers { .. } => "release_buffers",
            Intent::Revalidate { .. } => "revalidate",
            Intent::SetTimeoutProfile { .. } => "set_timeout_profile",
            Intent::RouteAround { .. } => "route_around",
            Intent::ResetSubsystem { .. } => "reset_subsystem",
        }
    }
}
