//! Channel Pool Manager
//!
//! Runs a [`ChannelPool`] on its own task. Every mutation arrives as a
//! command on one mailbox, so operations on a peer are totally ordered and
//! no lock is ever held across an await.
//!
//! # Channels
//!
//! - commands: request/reply via [`PoolHandle`], answered over `oneshot`
//! - intents: fire-and-forget corrective actions from edge-case handlers
//! - events: [`PoolEvent`] broadcast after every command, intent and tick

use crate::channel::{ChannelHandle, ChannelSnapshot, ChannelState};
use crate::clock::{ticker, SharedClock};
use crate::error::{FailureReason, MeshError, MeshResult};
use crate::event::{EvictReason, EvictionReport, PoolEvent, Transition};
use crate::intent::Intent;
use crate::pool::{ChannelPool, PoolHealthReport};
use bytes::Bytes;
use lifeline_core::{PeerId, ResilienceConfig};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

type Reply<T> = oneshot::Sender<T>;

/// Commands accepted by the manager task
enum PoolCommand {
    Acquire {
        peer_id: PeerId,
        reply: Reply<MeshResult<ChannelHandle>>,
    },
    PeerConnected {
        peer_id: PeerId,
        reply: Reply<MeshResult<ChannelState>>,
    },
    PeerDisconnected {
        peer_id: PeerId,
        reason: String,
        reply: Reply<MeshResult<Option<ChannelSnapshot>>>,
    },
    ReportSuccess {
        peer_id: PeerId,
        latency_ms: f64,
        bytes: u64,
        reply: Reply<MeshResult<ChannelSnapshot>>,
    },
    ReportFailure {
        peer_id: PeerId,
        reason: FailureReason,
        reply: Reply<MeshResult<ChannelSnapshot>>,
    },
    RecordInbound {
        peer_id: PeerId,
        bytes: u64,
        reply: Reply<Option<ChannelSnapshot>>,
    },
    Evict {
        peer_id: PeerId,
        reason: EvictReason,
        reply: Reply<Option<EvictionReport>>,
    },
    Enqueue {
        peer_id: PeerId,
        payload: Bytes,
        priority: bool,
        reply: Reply<MeshResult<u64>>,
    },
    SetMaintenance {
        peer_id: PeerId,
        hold: bool,
        reply: Reply<MeshResult<ChannelState>>,
    },
    Channel {
        peer_id: PeerId,
        reply: Reply<Option<ChannelSnapshot>>,
    },
    Snapshot {
        reply: Reply<PoolHealthReport>,
    },
    RouteCandidates {
        limit: usize,
        reply: Reply<Vec<PeerId>>,
    },
    Transitions {
        limit: usize,
        reply: Reply<Vec<Transition>>,
    },
    Reset {
        reply: Reply<usize>,
    },
    Tick {
        reply: Reply<()>,
    },
}

/// Cloneable front door to the manager task
#[derive(Debug, Clone)]
pub struct PoolHandle {
    commands: mpsc::Sender<PoolCommand>,
    intents: mpsc::Sender<Intent>,
    events: broadcast::Sender<PoolEvent>,
    call_timeout: Duration,
}

impl std::fmt::Debug for PoolCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PoolCommand::Acquire { .. } => "acquire",
            PoolCommand::PeerConnected { .. } => "peer_connected",
            PoolCommand::PeerDisconnected { .. } => "peer_disconnected",
            PoolCommand::ReportSuccess { .. } => "report_success",
            PoolCommand::ReportFailure { .. } => "report_failure",
            PoolCommand::RecordInbound { .. } => "record_inbound",
            PoolCommand::Evict { .. } => "evict",
            PoolCommand::Enqueue { .. } => "enqueue",
            PoolCommand::SetMaintenance { .. } => "set_maintenance",
            PoolCommand::Channel { .. } => "channel",
            PoolCommand::Snapshot { .. } => "snapshot",
            PoolCommand::RouteCandidates { .. } => "route_candidates",
            PoolCommand::Transitions { .. } => "transitions",
            PoolCommand::Reset { .. } => "reset",
            PoolCommand::Tick { .. } => "tick",
        };
        f.write_str(name)
    }
}

impl PoolHandle {
    async fn call<T>(&self, make: impl FnOnce(Reply<T>) -> PoolCommand) -> MeshResult<T> {
        let (tx, rx) = oneshot::channel();
        let command = make(tx);
        let exchange = async {
            self.commands
                .send(command)
                .await
                .map_err(|_| MeshError::Shutdown("channel pool manager stopped".to_string()))?;
            rx.await
                .map_err(|_| MeshError::Shutdown("channel pool manager dropped reply".to_string()))
        };
        match tokio::time::timeout(self.call_timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(MeshError::Timeout(format!(
                "channel pool call exceeded {}ms",
                self.call_timeout.as_millis()
            ))),
        }
    }

    /// Acquire a channel for one operation
    pub async fn acquire(&self, peer_id: &str) -> MeshResult<ChannelHandle> {
        let peer_id = peer_id.to_string();
        self.call(|reply| PoolCommand::Acquire { peer_id, reply }).await?
    }

    /// Transport link to `peer_id` came up
    pub async fn peer_connected(&self, peer_id: &str) -> MeshResult<ChannelState> {
        let peer_id = peer_id.to_string();
        self.call(|reply| PoolCommand::PeerConnected { peer_id, reply }).await?
    }

    /// Transport link to `peer_id` dropped
    pub async fn peer_disconnected(
        &self,
        peer_id: &str,
        reason: &str,
    ) -> MeshResult<Option<ChannelSnapshot>> {
        let peer_id = peer_id.to_string();
        let reason = reason.to_string();
        self.call(|reply| PoolCommand::PeerDisconnected {
            peer_id,
            reason,
            reply,
        })
        .await?
    }

    /// Record a clean exchange
    pub async fn report_success(
        &self,
        peer_id: &str,
        latency_ms: f64,
        bytes: u64,
    ) -> MeshResult<ChannelSnapshot> {
        let peer_id = peer_id.to_string();
        self.call(|reply| PoolCommand::ReportSuccess {
            peer_id,
            latency_ms,
            bytes,
            reply,
        })
        .await?
    }

    /// Record a failed exchange
    pub async fn report_failure(
        &self,
        peer_id: &str,
        reason: FailureReason,
    ) -> MeshResult<ChannelSnapshot> {
        let peer_id = peer_id.to_string();
        self.call(|reply| PoolCommand::ReportFailure {
            peer_id,
            reason,
            reply,
        })
        .await?
    }

    /// Account received traffic; `None` if the peer has no channel
    pub async fn record_inbound(&self, peer_id: &str, bytes: u64) -> MeshResult<Option<ChannelSnapshot>> {
        let peer_id = peer_id.to_string();
        self.call(|reply| PoolCommand::RecordInbound {
            peer_id,
            bytes,
            reply,
        })
        .await
    }

    /// Evict a channel; `None` if it was already gone
    pub async fn evict(&self, peer_id: &str, reason: EvictReason) -> MeshResult<Option<EvictionReport>> {
        let peer_id = peer_id.to_string();
        self.call(|reply| PoolCommand::Evict {
            peer_id,
            reason,
            reply,
        })
        .await
    }

    /// Hold a message until the channel is routable
    pub async fn enqueue(&self, peer_id: &str, payload: Bytes, priority: bool) -> MeshResult<u64> {
        let peer_id = peer_id.to_string();
        self.call(|reply| PoolCommand::Enqueue {
            peer_id,
            payload,
            priority,
            reply,
        })
        .await?
    }

    /// Place a channel under maintenance or release it
    pub async fn set_maintenance(&self, peer_id: &str, hold: bool) -> MeshResult<ChannelState> {
        let peer_id = peer_id.to_string();
        self.call(|reply| PoolCommand::SetMaintenance {
            peer_id,
            hold,
            reply,
        })
        .await?
    }

    /// Snapshot of one channel
    pub async fn channel(&self, peer_id: &str) -> MeshResult<Option<ChannelSnapshot>> {
        let peer_id = peer_id.to_string();
        self.call(|reply| PoolCommand::Channel { peer_id, reply })
            .await
    }

    /// Pool health report
    pub async fn snapshot(&self) -> MeshResult<PoolHealthReport> {
        self.call(|reply| PoolCommand::Snapshot { reply }).await
    }

    /// Best routable peers
    pub async fn route_candidates(&self, limit: usize) -> MeshResult<Vec<PeerId>> {
        self.call(|reply| PoolCommand::RouteCandidates { limit, reply })
            .await
    }

    /// Most recent `limit` transitions, oldest first
    pub async fn transitions(&self, limit: usize) -> MeshResult<Vec<Transition>> {
        self.call(|reply| PoolCommand::Transitions { limit, reply })
            .await
    }

    /// Evict every channel
    pub async fn reset(&self) -> MeshResult<usize> {
        self.call(|reply| PoolCommand::Reset { reply }).await
    }

    /// Run one maintenance pass now instead of waiting for the ticker
    pub async fn tick(&self) -> MeshResult<()> {
        self.call(|reply| PoolCommand::Tick { reply }).await
    }

    /// Queue an intent for execution
    pub async fn submit(&self, intent: Intent) -> MeshResult<()> {
        self.intents
            .send(intent)
            .await
            .map_err(|_| MeshError::Shutdown("channel pool manager stopped".to_string()))
    }

    /// Sender for handler workers
    pub fn intent_sender(&self) -> mpsc::Sender<Intent> {
        self.intents.clone()
    }

    /// Receive pool events from now on
    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.events.subscribe()
    }
}

/// Owner task of the channel pool
pub struct ChannelPoolManager {
    pool: ChannelPool,
    commands: mpsc::Receiver<PoolCommand>,
    intents: mpsc::Receiver<Intent>,
    events: broadcast::Sender<PoolEvent>,
    clock: SharedClock,
    tick_interval: Duration,
    shutdown: CancellationToken,
}

impl ChannelPoolManager {
    /// Build a manager around a fresh pool
    pub fn new(
        config: &ResilienceConfig,
        clock: SharedClock,
        shutdown: CancellationToken,
    ) -> (Self, PoolHandle) {
        Self::with_pool(ChannelPool::new(config), config, clock, shutdown)
    }

    /// Build a manager around an existing pool
    pub fn with_pool(
        pool: ChannelPool,
        config: &ResilienceConfig,
        clock: SharedClock,
        shutdown: CancellationToken,
    ) -> (Self, PoolHandle) {
        let capacity = config.pool.mailbox_capacity.max(1);
        let (command_tx, command_rx) = mpsc::channel(capacity);
        let (intent_tx, intent_rx) = mpsc::channel(capacity);
        let (event_tx, _) = broadcast::channel(capacity);

        let handle = PoolHandle {
            commands: command_tx,
            intents: intent_tx,
            events: event_tx.clone(),
            call_timeout: config.pool.call_timeout(),
        };
        let manager = Self {
            pool,
            commands: command_rx,
            intents: intent_rx,
            events: event_tx,
            clock,
            tick_interval: config.pool.tick_interval(),
            shutdown,
        };
        (manager, handle)
    }

    /// Spawn the manager task
    pub fn spawn(
        config: &ResilienceConfig,
        clock: SharedClock,
        shutdown: CancellationToken,
    ) -> (PoolHandle, JoinHandle<()>) {
        let (manager, handle) = Self::new(config, clock, shutdown);
        (handle, tokio::spawn(manager.run()))
    }

    /// Process commands, intents and ticks until cancelled
    pub async fn run(mut self) {
        info!(tick_ms = self.tick_interval.as_millis() as u64, "Channel pool manager started");
        let mut tick = ticker(self.tick_interval);

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                command = self.commands.recv() => match command {
                    Some(command) => self.handle(command),
                    None => {
                        debug!("All pool handles dropped");
                        break;
                    }
                },
                Some(intent) = self.intents.recv() => {
                    let now = self.clock.now_ms();
                    self.pool.apply(intent, now);
                }
                _ = tick.tick() => {
                    let now = self.clock.now_ms();
                    self.pool.tick(now);
                }
            }
            self.publish();
        }

        info!(channels = self.pool.len(), "Channel pool manager stopped");
    }

    fn handle(&mut self, command: PoolCommand) {
        let now = self.clock.now_ms();
        debug!(command = ?command, "Pool command");

        // A dropped reply receiver means the caller timed out; nothing to do.
        match command {
            PoolCommand::Acquire { peer_id, reply } => {
                let _ = reply.send(self.pool.acquire(&peer_id, now));
            }
            PoolCommand::PeerConnected { peer_id, reply } => {
                let _ = reply.send(self.pool.peer_connected(&peer_id, now));
            }
            PoolCommand::PeerDisconnected {
                peer_id,
                reason,
                reply,
            } => {
                let _ = reply.send(self.pool.peer_disconnected(&peer_id, &reason, now));
            }
            PoolCommand::ReportSuccess {
                peer_id,
                latency_ms,
                bytes,
                reply,
            } => {
                let _ = reply.send(self.pool.report_success(&peer_id, latency_ms, bytes, now));
            }
            PoolCommand::ReportFailure {
                peer_id,
                reason,
                reply,
            } => {
                let _ = reply.send(self.pool.report_failure(&peer_id, reason, now));
            }
            PoolCommand::RecordInbound {
                peer_id,
                bytes,
                reply,
            } => {
                let _ = reply.send(self.pool.record_inbound(&peer_id, bytes, now));
            }
            PoolCommand::Evict {
                peer_id,
                reason,
                reply,
            } => {
                let _ = reply.send(self.pool.evict(&peer_id, reason, now));
            }
            PoolCommand::Enqueue {
                peer_id,
                payload,
                priority,
                reply,
            } => {
                let _ = reply.send(self.pool.enqueue(&peer_id, payload, priority, now));
            }
            PoolCommand::SetMaintenance {
                peer_id,
                hold,
                reply,
            } => {
                let _ = reply.send(self.pool.set_maintenance(&peer_id, hold, now));
            }
            PoolCommand::Channel { peer_id, reply } => {
                let _ = reply.send(self.pool.channel(&peer_id, now));
            }
            PoolCommand::Snapshot { reply } => {
                let _ = reply.send(self.pool.snapshot(now));
            }
            PoolCommand::RouteCandidates { limit, reply } => {
                let _ = reply.send(self.pool.route_candidates(limit, now));
            }
            PoolCommand::Transitions { limit, reply } => {
                let all: Vec<Transition> = self.pool.transitions().cloned().collect();
                let skip = all.len().saturating_sub(limit);
                let _ = reply.send(all.into_iter().skip(skip).collect());
            }
            PoolCommand::Reset { reply } => {
                let _ = reply.send(self.pool.reset(now));
            }
            PoolCommand::Tick { reply } => {
                self.pool.tick(now);
                let _ = reply.send(());
            }
        }
    }

    fn publish(&mut self) {
        for event in self.pool.drain_events() {
            // Events are advisory; having no subscriber is fine.
            let _ = self.events.send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ManualClock, TokioClock};
    use std::sync::Arc;

    fn spawn_with(clock: SharedClock) -> (PoolHandle, CancellationToken, JoinHandle<()>) {
        let token = CancellationToken::new();
        let (handle, task) = ChannelPoolManager::spawn(&ResilienceConfig::default(), clock, token.clone());
        (handle, token, task)
    }

    #[tokio::test]
    async fn test_commands_are_applied_in_order() {
        let clock = ManualClock::new(0);
        let (handle, token, task) = spawn_with(clock.clone());

        handle.acquire("peer-a").await.unwrap();
        for _ in 0..5 {
            clock.advance(10);
            handle.report_success("peer-a", 20.0, 2_048).await.unwrap();
        }
        let snapshot = handle.channel("peer-a").await.unwrap().unwrap();
        assert_eq!(snapshot.state, ChannelState::Active);
        assert_eq!(snapshot.last_activity_at, 50);

        token.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_events_are_broadcast() {
        let (handle, token, task) = spawn_with(ManualClock::new(0));
        let mut events = handle.subscribe();

        handle.acquire("peer-a").await.unwrap();
        handle.report_success("peer-a", 20.0, 2_048).await.unwrap();

        let mut saw_transition = false;
        while let Ok(event) = events.try_recv() {
            if let PoolEvent::Transitioned(t) = event {
                assert_eq!(t.to, ChannelState::Active);
                saw_transition = true;
            }
        }
        assert!(saw_transition);

        token.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_intents_are_executed() {
        let (handle, token, task) = spawn_with(ManualClock::new(1_000));
        handle.acquire("peer-a").await.unwrap();
        handle
            .submit(Intent::Evict {
                peer_id: "peer-a".into(),
                reason: EvictReason::MemoryPressure,
            })
            .await
            .unwrap();

        // Intents and commands share one task; poll until the intent lands.
        let mut gone = false;
        for _ in 0..50 {
            if handle.channel("peer-a").await.unwrap().is_none() {
                gone = true;
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(gone);

        token.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_calls_fail_after_shutdown() {
        let (handle, token, task) = spawn_with(ManualClock::new(0));
        token.cancel();
        task.await.unwrap();

        assert!(matches!(
            handle.acquire("peer-a").await,
            Err(MeshError::Shutdown(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticker_drives_recovery() {
        let clock: SharedClock = Arc::new(TokioClock::starting_at(0));
        let (handle, token, task) = spawn_with(clock);
        let mut events = handle.subscribe();

        handle.acquire("peer-a").await.unwrap();
        handle.report_success("peer-a", 20.0, 2_048).await.unwrap();
        handle
            .report_failure("peer-a", FailureReason::ChecksumMismatch)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(2_500)).await;

        let mut remediation = false;
        while let Ok(event) = events.try_recv() {
            if matches!(event, PoolEvent::RemediationRequested { .. }) {
                remediation = true;
            }
        }
        assert!(remediation);
        let snapshot = handle.channel("peer-a").await.unwrap().unwrap();
        assert_eq!(snapshot.state, ChannelState::Recovering);

        token.cancel();
        task.await.unwrap();
    }
}
