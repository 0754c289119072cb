//! Transport seam.
//!
//! The raw transport (Bluetooth, Wi-Fi peer-to-peer, discovery) lives
//! outside this crate. The core only needs to send framed bytes, ask for a
//! reconnect or a session reset, and be told when links come and go.
//!
//! [`LoopbackTransport`] is an in-memory, scriptable implementation used by
//! tests and the demo node.

use crate::error::{FailureReason, MeshError, MeshResult};
use crate::frame::{encode_probe, FrameHeader, FRAME_TYPE_PROBE_ACK};
use async_trait::async_trait;
use bytes::Bytes;
use lifeline_core::PeerId;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::trace;

/// Result of one successful send
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SendReceipt {
    /// Round-trip or acknowledgement latency
    pub latency_ms: f64,
    /// Bytes written, headers included
    pub bytes: u64,
}

/// Link-level events delivered into the runtime
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A link to the peer is up
    PeerConnected {
        /// Remote peer
        peer_id: PeerId,
    },
    /// The link to the peer dropped
    PeerDisconnected {
        /// Remote peer
        peer_id: PeerId,
        /// Transport's explanation
        reason: String,
    },
    /// Raw bytes arrived from the peer
    DataReceived {
        /// Remote peer
        peer_id: PeerId,
        /// Possibly several frames, possibly a partial one
        bytes: Bytes,
    },
}

impl TransportEvent {
    /// Peer the event concerns
    pub fn peer_id(&self) -> &str {
        match self {
            TransportEvent::PeerConnected { peer_id }
            | TransportEvent::PeerDisconnected { peer_id, .. }
            | TransportEvent::DataReceived { peer_id, .. } => peer_id,
        }
    }
}

/// What the core needs from a transport
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Send one framed message
    async fn send(&self, peer_id: &str, frame: Bytes) -> MeshResult<SendReceipt>;

    /// Re-establish the link to `peer_id`
    async fn reconnect(&self, peer_id: &str) -> MeshResult<()>;

    /// Tear down and rebuild the session with `peer_id`
    async fn reset(&self, peer_id: &str) -> MeshResult<()>;

    /// Send a health probe
    async fn probe(&self, peer_id: &str, timestamp: u32) -> MeshResult<SendReceipt> {
        let frame = encode_probe(peer_id, timestamp)?;
        self.send(peer_id, frame).await
    }
}

/// Scripted behaviour for one loopback peer
#[derive(Debug, Clone)]
struct PeerScript {
    reachable: bool,
    hang: bool,
    latency_ms: f64,
    failures: VecDeque<FailureReason>,
}

impl Default for PeerScript {
    fn default() -> Self {
        Self {
            reachable: true,
            hang: false,
            latency_ms: 25.0,
            failures: VecDeque::new(),
        }
    }
}

#[derive(Debug, Default)]
struct LoopbackState {
    peers: HashMap<PeerId, PeerScript>,
    sent: Vec<(PeerId, Bytes)>,
    reconnects: Vec<PeerId>,
    resets: Vec<PeerId>,
}

/// In-memory transport with per-peer scripts
#[derive(Debug, Clone, Default)]
pub struct LoopbackTransport {
    state: Arc<Mutex<LoopbackState>>,
}

impl LoopbackTransport {
    /// Every peer reachable with 25ms latency
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the latency reported for `peer_id`
    pub fn set_latency(&self, peer_id: &str, latency_ms: f64) {
        self.state.lock().peers.entry(peer_id.to_string()).or_default().latency_ms = latency_ms;
    }

    /// Make `peer_id` reachable or not
    pub fn set_reachable(&self, peer_id: &str, reachable: bool) {
        self.state.lock().peers.entry(peer_id.to_string()).or_default().reachable = reachable;
    }

    /// Make sends to `peer_id` never complete
    pub fn set_hang(&self, peer_id: &str, hang: bool) {
        self.state.lock().peers.entry(peer_id.to_string()).or_default().hang = hang;
    }

    /// Fail the next send to `peer_id` with `reason`
    pub fn fail_next(&self, peer_id: &str, reason: FailureReason) {
        self.state
            .lock()
            .peers
            .entry(peer_id.to_string())
            .or_default()
            .failures
            .push_back(reason);
    }

    /// Frames delivered so far
    pub fn sent(&self) -> Vec<(PeerId, Bytes)> {
        self.state.lock().sent.clone()
    }

    /// Frames delivered to one peer
    pub fn sent_to(&self, peer_id: &str) -> usize {
        self.state.lock().sent.iter().filter(|(p, _)| p == peer_id).count()
    }

    /// Reconnects requested so far
    pub fn reconnects(&self) -> Vec<PeerId> {
        self.state.lock().reconnects.clone()
    }

    /// Session resets requested so far
    pub fn resets(&self) -> Vec<PeerId> {
        self.state.lock().resets.clone()
    }

    /// Build a probe answer as a peer would
    pub fn probe_ack(peer_id: &str, timestamp: u32) -> MeshResult<Bytes> {
        FrameHeader::new(FRAME_TYPE_PROBE_ACK, Bytes::copy_from_slice(peer_id.as_bytes()), 0, timestamp)
            .encode(&[])
    }

    fn script(&self, peer_id: &str) -> PeerScript {
        self.state.lock().peers.get(peer_id).cloned().unwrap_or_default()
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn send(&self, peer_id: &str, frame: Bytes) -> MeshResult<SendReceipt> {
        let (hang, outcome) = {
            let mut state = self.state.lock();
            let script = state.peers.entry(peer_id.to_string()).or_default();
            let outcome = if let Some(reason) = script.failures.pop_front() {
                Err(MeshError::transport(reason))
            } else if !script.reachable {
                Err(MeshError::transport(FailureReason::Disconnected(
                    "peer unreachable".to_string(),
                )))
            } else {
                Ok(SendReceipt {
                    latency_ms: script.latency_ms,
                    bytes: frame.len() as u64,
                })
            };
            let hang = script.hang;
            if outcome.is_ok() && !hang {
                state.sent.push((peer_id.to_string(), frame));
            }
            (hang, outcome)
        };

        if hang {
            std::future::pending::<()>().await;
        }
        trace!(peer_id = %peer_id, ok = outcome.is_ok(), "Loopback send");
        outcome
    }

    async fn reconnect(&self, peer_id: &str) -> MeshResult<()> {
        self.state.lock().reconnects.push(peer_id.to_string());
        if self.script(peer_id).reachable {
            Ok(())
        } else {
            Err(MeshError::transport(FailureReason::Disconnected(
                "peer unreachable".to_string(),
            )))
        }
    }

    async fn reset(&self, peer_id: &str) -> MeshResult<()> {
        self.state.lock().resets.push(peer_id.to_string());
        if self.script(peer_id).reachable {
            Ok(())
        } else {
            Err(MeshError::transport(FailureReason::Disconnected(
                "peer unreachable".to_string(),
            )))
        }
    }
}
