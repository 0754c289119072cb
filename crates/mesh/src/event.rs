//! Events published by the channel pool.
//!
//! The pool never performs transport I/O itself. Whatever needs to happen
//! outside the single-writer core (probes, reconnects, flushing queued
//! messages, telling the caller a message was dropped) leaves the pool as a
//! [`PoolEvent`].

use crate::channel::{ChannelState, QueuedMessage};
use crate::error::ErrorClass;
use crate::recovery::RemediationAction;
use bytes::Bytes;
use lifeline_core::PeerId;
use serde::{Deserialize, Serialize};

/// One edge taken in the channel state graph
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    /// Channel that moved
    pub peer_id: PeerId,
    /// Previous state
    pub from: ChannelState,
    /// New state
    pub to: ChannelState,
    /// When it happened
    pub at_ms: u64,
}

/// Why a channel left the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictReason {
    /// Explicit `evict` call
    Explicit,
    /// Idle or failed beyond the retention horizon
    Retention,
    /// Recovery attempts exhausted
    RecoveryExhausted,
    /// Memory-pressure shedding
    MemoryPressure,
    /// Emergency recovery or subsystem reset
    Emergency,
}

/// Why queued messages were dropped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryFailure {
    /// The channel was evicted
    ChannelEvicted(EvictReason),
    /// Buffers were force-released under memory pressure
    BuffersReleased,
    /// The per-channel queue overflowed
    QueueOverflow,
    /// The transport refused the message after the circuit closed
    SendFailed,
}

/// Result of evicting a channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvictionReport {
    /// Evicted peer
    pub peer_id: PeerId,
    /// State the channel was in
    pub last_state: ChannelState,
    /// Why it was evicted
    pub reason: EvictReason,
    /// Queued messages reported as delivery failures
    pub dropped_messages: Vec<u64>,
}

/// A queued message ready to be sent after the circuit closed
#[derive(Debug, Clone)]
pub struct ReadyMessage {
    /// Pool-assigned message id
    pub id: u64,
    /// Opaque framed payload
    pub payload: Bytes,
    /// Priority flag carried from the original send
    pub priority: bool,
}

impl From<QueuedMessage> for ReadyMessage {
    fn from(message: QueuedMessage) -> Self {
        Self {
            id: message.id,
            payload: message.payload,
            priority: message.priority,
        }
    }
}

/// Everything the pool publishes to the rest of the system
#[derive(Debug, Clone)]
pub enum PoolEvent {
    /// A channel moved along the state graph
    Transitioned(Transition),
    /// Detect phase: send a health probe to this peer
    ProbeRequested {
        /// Peer to probe
        peer_id: PeerId,
    },
    /// Remediate phase: reconnect or reset the transport for this peer
    RemediationRequested {
        /// Peer under recovery
        peer_id: PeerId,
        /// What the transport should do
        action: RemediationAction,
        /// Attempt number within the failure episode (1-based)
        attempt: u32,
    },
    /// A channel became routable again with messages waiting
    QueueReady {
        /// Peer whose queue drained
        peer_id: PeerId,
        /// Messages to send, oldest first
        messages: Vec<ReadyMessage>,
    },
    /// Queued messages will never be delivered
    DeliveryFailed {
        /// Target peer
        peer_id: PeerId,
        /// Dropped message ids
        message_ids: Vec<u64>,
        /// Why they were dropped
        reason: DeliveryFailure,
    },
    /// A channel was removed from the pool
    Evicted(EvictionReport),
    /// A failure report was classified
    FailureObserved {
        /// Peer that failed
        peer_id: PeerId,
        /// Taxonomy class
        class: ErrorClass,
    },
    /// A successful exchange completed
    ExchangeCompleted {
        /// Peer
        peer_id: PeerId,
        /// Measured latency
        latency_ms: f64,
    },
    /// A fatal error isolated this channel
    ChannelIsolated {
        /// Isolated peer
        peer_id: PeerId,
    },
    /// The pool was reset; every channel is gone
    Reset {
        /// Channels evicted by the reset
        evicted: usize,
    },
}
