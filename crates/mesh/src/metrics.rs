//! Counters and per-peer flow accounting.
//!
//! [`MetricsCollector`] counts what the pool and runtime do. Counters are
//! plain atomics, and snapshots from several collectors merge by addition,
//! so the order in which tasks report never matters.
//!
//! [`FlowController`] tracks how many sends are in flight per peer. The
//! backpressure handler reads the depth to decide when to route around a
//! peer.

use crate::event::PoolEvent;
use lifeline_core::PeerId;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::ops::AddAssign;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Point-in-time counter values
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Successful exchanges
    pub exchanges_ok: u64,
    /// Failed exchanges
    pub exchanges_failed: u64,
    /// Payload bytes handed to the transport
    pub bytes_sent: u64,
    /// Bytes received from the transport
    pub bytes_received: u64,
    /// Messages held while a circuit was open
    pub messages_queued: u64,
    /// Messages that will never be delivered
    pub delivery_failures: u64,
    /// Channel state transitions
    pub transitions: u64,
    /// Channels evicted
    pub evictions: u64,
    /// Health probes requested
    pub probes: u64,
    /// Remediation attempts requested
    pub remediations: u64,
    /// Handler intents submitted to the pool
    pub intents: u64,
    /// Operations denied, deferred or throttled by handlers
    pub shed_operations: u64,
}

impl MetricsSnapshot {
    /// Combine two snapshots; commutative and associative
    pub fn merge(mut self, other: MetricsSnapshot) -> MetricsSnapshot {
        self += other;
        self
    }
}

impl AddAssign for MetricsSnapshot {
    fn add_assign(&mut self, other: MetricsSnapshot) {
        self.exchanges_ok += other.exchanges_ok;
        self.exchanges_failed += other.exchanges_failed;
        self.bytes_sent += other.bytes_sent;
        self.bytes_received += other.bytes_received;
        self.messages_queued += other.messages_queued;
        self.delivery_failures += other.delivery_failures;
        self.transitions += other.transitions;
        self.evictions += other.evictions;
        self.probes += other.probes;
        self.remediations += other.remediations;
        self.intents += other.intents;
        self.shed_operations += other.shed_operations;
    }
}

/// Lock-free counters shared between tasks
#[derive(Debug, Default)]
pub struct MetricsCollector {
    exchanges_ok: AtomicU64,
    exchanges_failed: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    messages_queued: AtomicU64,
    delivery_failures: AtomicU64,
    transitions: AtomicU64,
    evictions: AtomicU64,
    probes: AtomicU64,
    remediations: AtomicU64,
    intents: AtomicU64,
    shed_operations: AtomicU64,
}

fn bump(counter: &AtomicU64, by: u64) {
    counter.fetch_add(by, Ordering::Relaxed);
}

impl MetricsCollector {
    /// Shareable empty collector
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Count a pool event
    pub fn record_event(&self, event: &PoolEvent) {
        match event {
            PoolEvent::Transitioned(_) => bump(&self.transitions, 1),
            PoolEvent::ProbeRequested { .. } => bump(&self.probes, 1),
            PoolEvent::RemediationRequested { .. } => bump(&self.remediations, 1),
            PoolEvent::DeliveryFailed { message_ids, .. } => {
                bump(&self.delivery_failures, message_ids.len() as u64)
            }
            PoolEvent::Evicted(_) => bump(&self.evictions, 1),
            PoolEvent::ExchangeCompleted { .. } => bump(&self.exchanges_ok, 1),
            PoolEvent::FailureObserved { .. } => bump(&self.exchanges_failed, 1),
            PoolEvent::QueueReady { .. }
            | PoolEvent::ChannelIsolated { .. }
            | PoolEvent::Reset { .. } => {}
        }
    }

    /// Bytes handed to the transport
    pub fn record_sent(&self, bytes: usize) {
        bump(&self.bytes_sent, bytes as u64);
    }

    /// Bytes received from the transport
    pub fn record_received(&self, bytes: usize) {
        bump(&self.bytes_received, bytes as u64);
    }

    /// A message was queued behind an open circuit
    pub fn record_queued(&self) {
        bump(&self.messages_queued, 1);
    }

    /// An operation was denied, deferred or throttled
    pub fn record_shed(&self) {
        bump(&self.shed_operations, 1);
    }

    /// Current values
    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            exchanges_ok: load(&self.exchanges_ok),
            exchanges_failed: load(&self.exchanges_failed),
            bytes_sent: load(&self.bytes_sent),
            bytes_received: load(&self.bytes_received),
            messages_queued: load(&self.messages_queued),
            delivery_failures: load(&self.delivery_failures),
            transitions: load(&self.transitions),
            evictions: load(&self.evictions),
            probes: load(&self.probes),
            remediations: load(&self.remediations),
            intents: load(&self.intents),
            shed_operations: load(&self.shed_operations),
        }
    }
}

/// Per-peer in-flight send accounting
#[derive(Debug, Default)]
pub struct FlowController {
    depths: Mutex<HashMap<PeerId, usize>>,
}

/// One in-flight send; releases its slot on drop
#[derive(Debug)]
pub struct FlowPermit {
    controller: Arc<FlowController>,
    peer_id: PeerId,
    depth: usize,
}

impl FlowPermit {
    /// Queue depth including this send
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Peer the send targets
    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }
}

impl Drop for FlowPermit {
    fn drop(&mut self) {
        let mut depths = self.controller.depths.lock();
        if let Some(depth) = depths.get_mut(&self.peer_id) {
            *depth = depth.saturating_sub(1);
            if *depth == 0 {
                depths.remove(&self.peer_id);
            }
        }
    }
}

impl FlowController {
    /// Shareable empty controller
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register one in-flight send to `peer_id`
    pub fn begin(self: &Arc<Self>, peer_id: &str) -> FlowPermit {
        let mut depths = self.depths.lock();
        let depth = depths.entry(peer_id.to_string()).or_insert(0);
        *depth += 1;
        FlowPermit {
            controller: Arc::clone(self),
            peer_id: peer_id.to_string(),
            depth: *depth,
        }
    }

    /// Sends in flight to `peer_id`
    pub fn depth(&self, peer_id: &str) -> usize {
        self.depths.lock().get(peer_id).copied().unwrap_or(0)
    }

    /// Sends in flight across all peers
    pub fn total(&self) -> usize {
        self.depths.lock().values().sum()
    }

    /// Peers whose depth exceeds `threshold`, deepest first
    pub fn pressured(&self, threshold: usize) -> Vec<(PeerId, usize)> {
        let mut peers: Vec<(PeerId, usize)> = self
            .depths
            .lock()
            .iter()
            .filter(|(_, depth)| **depth > threshold)
            .map(|(peer, depth)| (peer.clone(), *depth))
            .collect();
        peers.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        peers
    }
}
