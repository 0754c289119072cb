//! The resilience system facade.
//!
//! [`ResilienceSystem`] owns the pool manager, the network state
//! coordinator, the edge supervisor and the event router, and is the only
//! thing applications talk to. Handles are cheap to clone; every clone
//! drives the same tasks.

use crate::error::{RuntimeError, RuntimeResult};
use crate::inbound::{FrameAssembler, InboundFrame};
use crate::outcome::{ConnectOutcome, DeliveryFailureNotice, SendOutcome};
use crate::report::{
    find_issues, ChannelHealth, DiagnosticsReport, EmergencyRecoveryReport, SystemStatusReport,
};
use crate::router::{self, EventRouter};
use bytes::Bytes;
use futures::future::join_all;
use lifeline_core::{Layer, PeerId, ResilienceConfig};
use lifeline_edge::{
    default_handlers, exhaustion, AdmissionGate, Decision, EdgeError, EdgeEvent, EdgeSupervisor,
    MemoryPressure, OperationKind, ResourceSample, Verdict,
};
use lifeline_mesh::frame::{FrameHeader, FRAME_TYPE_DATA, FRAME_TYPE_PROBE, FRAME_TYPE_PROBE_ACK, MAX_FRAME_DATA};
use lifeline_mesh::{
    ChannelPoolManager, CoordinatorHandle, FailureReason, FlowController, Frame,
    LayerState, MeshError, MetricsCollector, MetricsSnapshot, NetworkStateCoordinator,
    OperationBudget, OverallNetworkState, PoolHandle, RecoveryEngine, SharedClock, Subscription,
    SubscriptionToken, TimeoutProfile, Transport, TransportEvent,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Buffered notices per broadcast subscriber
const NOTICE_CAPACITY: usize = 256;

/// Transitions included in a diagnostics report
const DIAGNOSTIC_TRANSITIONS: usize = 32;

/// State shared by the facade and the router's jobs
pub(crate) struct Inner {
    pub(crate) config: ResilienceConfig,
    pub(crate) pool: PoolHandle,
    pub(crate) coordinator: CoordinatorHandle,
    pub(crate) supervisor: EdgeSupervisor,
    pub(crate) gate: Arc<AdmissionGate>,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) clock: SharedClock,
    pub(crate) metrics: Arc<MetricsCollector>,
    pub(crate) flow: Arc<FlowController>,
    pub(crate) assembler: FrameAssembler,
    /// Outstanding probes: peer to send time
    pub(crate) pending_probes: Mutex<HashMap<PeerId, u64>>,
    pub(crate) shutdown: CancellationToken,
    retry: RecoveryEngine,
    /// Connects in flight: peer to leading attempt and its published outcome
    connecting: Mutex<HashMap<PeerId, (u64, Arc<ConnectOutcomeSender>)>>,
    delivery_failures: broadcast::Sender<DeliveryFailureNotice>,
    inbound: broadcast::Sender<InboundFrame>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    next_id: AtomicU64,
}

impl Inner {
    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Budget for an operation on `peer_id`
    pub(crate) async fn budget(&self, peer_id: &str) -> OperationBudget {
        match self.pool.channel(peer_id).await {
            Ok(Some(snapshot)) => snapshot.budget,
            _ => TimeoutProfile::Standard.budget(&self.config.pool),
        }
    }

    /// Report a clean exchange to the pool and the handlers
    pub(crate) async fn record_exchange(&self, peer_id: &str, latency_ms: f64, bytes: u64) {
        if let Err(e) = self.pool.report_success(peer_id, latency_ms, bytes).await {
            debug!(peer_id = %peer_id, error = %e, "Exchange not recorded");
        }
        self.supervisor
            .observe(EdgeEvent::ExchangeObserved {
                peer_id: peer_id.to_string(),
                latency_ms,
                success: true,
            })
            .await;
    }

    /// Report a failed exchange; `true` if the channel is still routable
    pub(crate) async fn record_failure(
        &self,
        peer_id: &str,
        reason: FailureReason,
        latency_ceiling_ms: u64,
    ) -> bool {
        self.supervisor
            .observe(EdgeEvent::ExchangeObserved {
                peer_id: peer_id.to_string(),
                latency_ms: latency_ceiling_ms as f64,
                success: false,
            })
            .await;
        match self.pool.report_failure(peer_id, reason).await {
            Ok(snapshot) => snapshot.routable,
            Err(e) => {
                debug!(peer_id = %peer_id, error = %e, "Failure not recorded");
                false
            }
        }
    }

    pub(crate) fn notify_delivery_failure(&self, notice: DeliveryFailureNotice) {
        // No subscribers is fine
        let _ = self.delivery_failures.send(notice);
    }

    /// Jittered delay after failed attempt `attempt` (1-based)
    fn backoff(&self, attempt: u32) -> Duration {
        let delay = self
            .retry
            .backoff_ms(attempt.saturating_sub(1), &mut rand::thread_rng());
        Duration::from_millis(delay)
    }
}

type ConnectOutcomeSender = watch::Sender<Option<ConnectOutcome>>;

/// Leadership of the in-flight connect to one peer.
///
/// Later callers for the same peer wait for the outcome published here.
/// The registration is dropped with the leader, outcome or not.
struct ConnectLead {
    inner: Arc<Inner>,
    peer_id: PeerId,
    attempt_id: u64,
    outcome: Arc<ConnectOutcomeSender>,
}

impl ConnectLead {
    /// Become leader for `peer_id`, or get a receiver for the current leader
    fn claim(
        inner: &Arc<Inner>,
        peer_id: &str,
        attempt_id: u64,
    ) -> Result<Self, watch::Receiver<Option<ConnectOutcome>>> {
        let mut connecting = inner.connecting.lock();
        if let Some((_, outcome)) = connecting.get(peer_id) {
            return Err(outcome.subscribe());
        }
        let (outcome, _) = watch::channel(None);
        let outcome = Arc::new(outcome);
        connecting.insert(peer_id.to_string(), (attempt_id, Arc::clone(&outcome)));
        Ok(Self {
            inner: Arc::clone(inner),
            peer_id: peer_id.to_string(),
            attempt_id,
            outcome,
        })
    }

    fn publish(&self, outcome: &ConnectOutcome) {
        self.outcome.send_replace(Some(outcome.clone()));
    }
}

impl Drop for ConnectLead {
    fn drop(&mut self) {
        let mut connecting = self.inner.connecting.lock();
        if connecting
            .get(&self.peer_id)
            .is_some_and(|(attempt_id, _)| *attempt_id == self.attempt_id)
        {
            connecting.remove(&self.peer_id);
        }
    }
}

/// Resolves the connect attempt with the dedup handler on every path
struct ConnectAttemptGuard {
    inner: Option<Arc<Inner>>,
    peer_id: PeerId,
    attempt_id: u64,
}

impl ConnectAttemptGuard {
    fn new(inner: &Arc<Inner>, peer_id: &str, attempt_id: u64) -> Self {
        Self {
            inner: Some(Arc::clone(inner)),
            peer_id: peer_id.to_string(),
            attempt_id,
        }
    }

    fn event(&self, success: bool) -> EdgeEvent {
        EdgeEvent::ConnectResolved {
            peer_id: self.peer_id.clone(),
            attempt_id: self.attempt_id,
            success,
        }
    }

    async fn resolve(mut self, success: bool) {
        if let Some(inner) = self.inner.take() {
            inner.supervisor.observe(self.event(success)).await;
        }
    }
}

impl Drop for ConnectAttemptGuard {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.take() {
            let event = self.event(false);
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                runtime.spawn(async move { inner.supervisor.observe(event).await });
            }
        }
    }
}

/// Entry point for applications
#[derive(Clone)]
pub struct ResilienceSystem {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ResilienceSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilienceSystem")
            .field("running", &self.is_running())
            .field("handlers", &self.inner.supervisor.handler_names())
            .finish()
    }
}

impl ResilienceSystem {
    /// Validate `config` and start every task.
    ///
    /// Must be called inside a Tokio runtime.
    pub fn start(
        config: ResilienceConfig,
        transport: Arc<dyn Transport>,
        clock: SharedClock,
    ) -> RuntimeResult<Self> {
        config.validate()?;
        let shutdown = CancellationToken::new();

        let (pool, pool_task) = ChannelPoolManager::spawn(&config, Arc::clone(&clock), shutdown.clone());
        let events = pool.subscribe();
        let (coordinator, coordinator_task) =
            NetworkStateCoordinator::spawn(&config, Arc::clone(&clock), shutdown.clone());
        let gate = AdmissionGate::from_config(&config);
        let supervisor = EdgeSupervisor::spawn(
            default_handlers(&config, Arc::clone(&gate)),
            &config.edge.workers,
            pool.intent_sender(),
            Arc::clone(&clock),
            shutdown.clone(),
        );
        let (delivery_failures, _) = broadcast::channel(NOTICE_CAPACITY);
        let (inbound, _) = broadcast::channel(NOTICE_CAPACITY);
        let report_interval = Duration::from_millis(config.pool.tick_interval_ms.max(1));
        let retry = RecoveryEngine::new(&config.pool, config.auto_recovery_enabled);

        let inner = Arc::new(Inner {
            config,
            pool,
            coordinator,
            supervisor,
            gate,
            transport,
            clock,
            metrics: MetricsCollector::shared(),
            flow: FlowController::shared(),
            assembler: FrameAssembler::default(),
            pending_probes: Mutex::new(HashMap::new()),
            shutdown,
            retry,
            connecting: Mutex::new(HashMap::new()),
            delivery_failures,
            inbound,
            tasks: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        });
        let router_task = EventRouter::spawn(Arc::clone(&inner), events, report_interval);
        inner
            .tasks
            .lock()
            .extend([pool_task, coordinator_task, router_task]);

        info!(
            handlers = inner.supervisor.handler_names().len(),
            max_concurrent_operations = inner.gate.max_limit(),
            "Resilience system started"
        );
        Ok(Self { inner })
    }

    /// Whether [`shutdown`](Self::shutdown) has not been called
    pub fn is_running(&self) -> bool {
        !self.inner.shutdown.is_cancelled()
    }

    fn ensure_running(&self) -> RuntimeResult<()> {
        if self.is_running() {
            Ok(())
        } else {
            Err(RuntimeError::ShutDown)
        }
    }

    /// Stop every task and wait for them
    pub async fn shutdown(&self) {
        if !self.is_running() {
            return;
        }
        info!("Resilience system shutting down");
        self.inner.shutdown.cancel();
        self.inner.gate.close();
        self.inner.supervisor.join().await;
        let tasks = std::mem::take(&mut *self.inner.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Task ended abnormally");
            }
        }
        info!("Resilience system stopped");
    }

    /// Feed a link-level event from the transport
    pub async fn handle_transport_event(&self, event: TransportEvent) -> RuntimeResult<()> {
        self.ensure_running()?;
        match event {
            TransportEvent::PeerConnected { peer_id } => {
                match self.inner.pool.peer_connected(&peer_id).await {
                    Ok(state) => debug!(peer_id = %peer_id, %state, "Peer connected"),
                    Err(MeshError::Quarantined { until_ms, .. }) => {
                        debug!(peer_id = %peer_id, until_ms, "Link from quarantined peer ignored");
                    }
                    Err(e) => return Err(e.into()),
                }
                self.inner
                    .supervisor
                    .observe(EdgeEvent::PeerConnected { peer_id })
                    .await;
            }
            TransportEvent::PeerDisconnected { peer_id, reason } => {
                self.inner.assembler.forget(&peer_id);
                self.inner.pool.peer_disconnected(&peer_id, &reason).await?;
                self.inner
                    .supervisor
                    .observe(EdgeEvent::PeerDisconnected { peer_id })
                    .await;
            }
            TransportEvent::DataReceived { peer_id, bytes } => {
                self.inner.metrics.record_received(bytes.len());
                match self.inner.assembler.push(&peer_id, &bytes) {
                    Ok(frames) => {
                        for frame in frames {
                            self.handle_frame(&peer_id, frame).await;
                        }
                    }
                    Err(e) => {
                        warn!(peer_id = %peer_id, error = %e, "Dropping malformed inbound stream");
                        if let Err(e) = self.inner.pool.report_failure(&peer_id, e.into()).await {
                            debug!(peer_id = %peer_id, error = %e, "Malformed stream from unknown peer");
                        }
                    }
                }
            }
        }
        Ok(())
    }

    async fn handle_frame(&self, peer_id: &str, frame: Frame) {
        match frame.header.frame_type {
            FRAME_TYPE_PROBE => {
                let ack = FrameHeader::new(
                    FRAME_TYPE_PROBE_ACK,
                    frame.header.id.clone(),
                    0,
                    frame.header.timestamp,
                )
                .encode(&[]);
                let ack = match ack {
                    Ok(ack) => ack,
                    Err(e) => {
                        debug!(peer_id = %peer_id, error = %e, "Probe answer not encodable");
                        return;
                    }
                };
                let wait = Duration::from_millis(self.inner.config.pool.standard_timeout_ms);
                match tokio::time::timeout(wait, self.inner.transport.send(peer_id, ack)).await {
                    Ok(Ok(_)) => debug!(peer_id = %peer_id, "Probe answered"),
                    Ok(Err(e)) => debug!(peer_id = %peer_id, error = %e, "Probe answer failed"),
                    Err(_) => debug!(peer_id = %peer_id, "Probe answer timed out"),
                }
            }
            FRAME_TYPE_PROBE_ACK => {
                let sent_at = self.inner.pending_probes.lock().remove(peer_id);
                if let Some(sent_at) = sent_at {
                    let latency = self.inner.clock.now_ms().saturating_sub(sent_at) as f64;
                    self.inner
                        .record_exchange(peer_id, latency, frame.wire_len() as u64)
                        .await;
                }
            }
            _ => {
                match self.inner.pool.record_inbound(peer_id, frame.wire_len() as u64).await {
                    Ok(Some(_)) => {}
                    Ok(None) => trace!(peer_id = %peer_id, "Inbound frame from peer without channel"),
                    Err(e) => debug!(peer_id = %peer_id, error = %e, "Inbound accounting failed"),
                }
                let _ = self.inner.inbound.send(InboundFrame {
                    peer_id: peer_id.to_string(),
                    frame,
                });
            }
        }
    }

    /// Establish a link to `peer_id` through the transport
    ///
    /// A connect to a peer that already has one in flight waits for that
    /// attempt and returns its outcome. If the leading attempt ends without
    /// one, the caller goes through admission itself.
    pub async fn connect(&self, peer_id: &str) -> RuntimeResult<ConnectOutcome> {
        self.ensure_running()?;
        let attempt_id = self.inner.next_id();
        let lead = match ConnectLead::claim(&self.inner, peer_id, attempt_id) {
            Ok(lead) => Some(lead),
            Err(leader) => {
                if let Some(outcome) = self.follow_connect(peer_id, leader).await {
                    return Ok(outcome);
                }
                ConnectLead::claim(&self.inner, peer_id, attempt_id).ok()
            }
        };

        let outcome = self.establish(peer_id, attempt_id).await?;
        if let Some(lead) = lead {
            lead.publish(&outcome);
        }
        Ok(outcome)
    }

    async fn follow_connect(
        &self,
        peer_id: &str,
        mut leader: watch::Receiver<Option<ConnectOutcome>>,
    ) -> Option<ConnectOutcome> {
        debug!(peer_id = %peer_id, "Connect already in flight, waiting for it");
        let wait = Duration::from_millis(self.inner.config.pool.standard_timeout_ms.saturating_mul(2));
        let joined = tokio::time::timeout(wait, leader.wait_for(Option::is_some)).await;
        match joined {
            Ok(Ok(outcome)) => (*outcome).clone(),
            Ok(Err(_)) => {
                debug!(peer_id = %peer_id, "Leading connect ended without an outcome");
                None
            }
            Err(_) => {
                debug!(peer_id = %peer_id, "Leading connect outlasted the wait");
                None
            }
        }
    }

    async fn establish(&self, peer_id: &str, attempt_id: u64) -> RuntimeResult<ConnectOutcome> {
        let inner = &self.inner;
        let guard = ConnectAttemptGuard::new(inner, peer_id, attempt_id);

        let decision = inner
            .supervisor
            .should_allow(EdgeEvent::ConnectAttempt {
                peer_id: peer_id.to_string(),
                attempt_id,
            })
            .await;
        match decision.verdict {
            Verdict::Allow => {}
            Verdict::Deny { reason } => return Ok(ConnectOutcome::Rejected { reason }),
            Verdict::Defer { retry_after_ms } => {
                return Ok(ConnectOutcome::Deferred { retry_after_ms })
            }
        }

        let permit = match inner.gate.acquire().await {
            Ok(permit) => permit,
            Err(EdgeError::AdmissionTimeout { waited_ms }) => {
                return Ok(ConnectOutcome::Deferred {
                    retry_after_ms: waited_ms,
                })
            }
            Err(e) => return Err(e.into()),
        };
        let wait = Duration::from_millis(inner.config.pool.standard_timeout_ms);
        let linked = tokio::time::timeout(wait, inner.transport.reconnect(peer_id)).await;
        drop(permit);

        let reason = match linked {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(FailureReason::from(e)),
            Err(_) => Some(FailureReason::Timeout),
        };
        if let Some(reason) = reason {
            guard.resolve(false).await;
            if inner.pool.channel(peer_id).await?.is_some() {
                inner.pool.report_failure(peer_id, reason.clone()).await?;
            }
            info!(peer_id = %peer_id, %reason, "Connect failed");
            return Ok(ConnectOutcome::Failed { reason });
        }

        match inner.pool.peer_connected(peer_id).await {
            Ok(state) => {
                guard.resolve(true).await;
                inner
                    .supervisor
                    .observe(EdgeEvent::PeerConnected {
                        peer_id: peer_id.to_string(),
                    })
                    .await;
                Ok(ConnectOutcome::Connected { state })
            }
            Err(MeshError::Quarantined { until_ms, .. }) => {
                guard.resolve(false).await;
                Ok(ConnectOutcome::Rejected {
                    reason: format!("quarantined until {until_ms}"),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Send `payload` to every target.
    ///
    /// With no targets the best routable peer is used. Each target resolves
    /// to its own [`SendOutcome`]; one failing target never fails the call.
    pub async fn send(
        &self,
        payload: Bytes,
        targets: &[PeerId],
        priority: bool,
    ) -> RuntimeResult<Vec<(PeerId, SendOutcome)>> {
        self.ensure_running()?;
        let targets = if targets.is_empty() {
            self.inner.pool.route_candidates(1).await?
        } else {
            targets.to_vec()
        };
        if targets.is_empty() {
            debug!("No routable peer for untargeted send");
        }

        let sends = targets.into_iter().map(|peer_id| {
            let payload = payload.clone();
            async move {
                let outcome = self.send_one(&peer_id, payload, priority).await;
                debug!(peer_id = %peer_id, outcome = outcome.label(), "Send resolved");
                (peer_id, outcome)
            }
        });
        Ok(join_all(sends).await)
    }

    async fn send_one(&self, peer_id: &str, payload: Bytes, priority: bool) -> SendOutcome {
        let inner = &self.inner;
        if payload.len() > MAX_FRAME_DATA {
            return SendOutcome::Rejected {
                reason: format!("payload of {} bytes exceeds the frame limit", payload.len()),
            };
        }

        let decision = inner
            .supervisor
            .should_allow(EdgeEvent::Operation {
                kind: OperationKind::Send,
                peer_id: Some(peer_id.to_string()),
                priority,
            })
            .await;
        if let Some(outcome) = held_back(decision) {
            inner.metrics.record_shed();
            return outcome;
        }

        let _permit = match inner.gate.acquire().await {
            Ok(permit) => permit,
            Err(EdgeError::AdmissionTimeout { waited_ms }) => {
                inner.metrics.record_shed();
                return SendOutcome::Deferred {
                    retry_after_ms: waited_ms,
                };
            }
            Err(e) => {
                return SendOutcome::Rejected {
                    reason: e.to_string(),
                }
            }
        };

        let message_id = inner.next_id();
        let header = FrameHeader::new(
            FRAME_TYPE_DATA,
            Bytes::from(format!("m{message_id}")),
            payload.len() as u32,
            (inner.clock.now_ms() / 1000) as u32,
        );
        let frame = match header.encode(&payload) {
            Ok(frame) => frame,
            Err(e) => return SendOutcome::Failed { reason: e.into() },
        };

        let handle = match inner.pool.acquire(peer_id).await {
            Ok(handle) => handle,
            Err(MeshError::CircuitOpen { .. }) | Err(MeshError::Maintenance { .. }) => {
                return match inner.pool.enqueue(peer_id, frame, priority).await {
                    Ok(message_id) => {
                        inner.metrics.record_queued();
                        SendOutcome::Queued { message_id }
                    }
                    Err(e) => SendOutcome::Failed { reason: e.into() },
                };
            }
            Err(MeshError::Quarantined { until_ms, .. }) => {
                return SendOutcome::Rejected {
                    reason: format!("quarantined until {until_ms}"),
                }
            }
            Err(e) => return SendOutcome::Failed { reason: e.into() },
        };

        let flow = inner.flow.begin(peer_id);
        let contended = flow.depth() > 1;
        if contended {
            self.observe_depth(peer_id, flow.depth()).await;
        }
        let outcome = self.transmit(peer_id, frame, handle.budget).await;
        drop(flow);
        if contended {
            self.observe_depth(peer_id, inner.flow.depth(peer_id)).await;
        }
        outcome
    }

    async fn observe_depth(&self, peer_id: &str, depth: usize) {
        self.inner
            .supervisor
            .observe(EdgeEvent::QueueDepth {
                peer_id: peer_id.to_string(),
                depth,
            })
            .await;
    }

    async fn transmit(&self, peer_id: &str, frame: Bytes, budget: OperationBudget) -> SendOutcome {
        let inner = &self.inner;
        let timeout = Duration::from_millis(budget.timeout_ms);
        let attempts = budget.retry_budget.saturating_add(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let sent = tokio::time::timeout(timeout, inner.transport.send(peer_id, frame.clone())).await;
            let reason = match sent {
                Ok(Ok(receipt)) => {
                    inner.metrics.record_sent(frame.len());
                    inner
                        .record_exchange(peer_id, receipt.latency_ms, receipt.bytes)
                        .await;
                    return SendOutcome::Delivered {
                        latency_ms: receipt.latency_ms,
                        attempts: attempt,
                    };
                }
                Ok(Err(e)) => FailureReason::from(e),
                Err(_) => FailureReason::Timeout,
            };

            let routable = inner
                .record_failure(peer_id, reason.clone(), budget.timeout_ms)
                .await;
            if !reason.is_retryable() || !routable || attempt >= attempts {
                return SendOutcome::Failed { reason };
            }
            let delay = inner.backoff(attempt);
            debug!(peer_id = %peer_id, attempt, %reason, delay_ms = delay.as_millis() as u64, "Retrying send");
            tokio::select! {
                _ = inner.shutdown.cancelled() => return SendOutcome::Failed { reason },
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Report the state of a layer; returns once the coordinator has evaluated it
    pub async fn report_layer_state(
        &self,
        layer: Layer,
        state: LayerState,
        peer_count: usize,
    ) -> RuntimeResult<()> {
        self.ensure_running()?;
        self.inner
            .coordinator
            .report_layer_state(layer, state, peer_count)
            .await?;
        Ok(())
    }

    /// Committed network state; never blocks
    pub fn current_state(&self) -> OverallNetworkState {
        self.inner.coordinator.current_state()
    }

    /// Receive committed network state changes
    pub async fn subscribe(&self) -> RuntimeResult<Subscription> {
        self.ensure_running()?;
        Ok(self.inner.coordinator.subscribe().await?)
    }

    /// Stop a subscription; `false` if the token was unknown
    pub async fn unsubscribe(&self, token: SubscriptionToken) -> RuntimeResult<bool> {
        Ok(self.inner.coordinator.unsubscribe(token).await?)
    }

    /// Receive notices about queued messages that will never be delivered
    pub fn subscribe_delivery_failures(&self) -> broadcast::Receiver<DeliveryFailureNotice> {
        self.inner.delivery_failures.subscribe()
    }

    /// Receive data frames from peers
    pub fn subscribe_inbound(&self) -> broadcast::Receiver<InboundFrame> {
        self.inner.inbound.subscribe()
    }

    /// The application went to the background
    pub async fn suspend(&self) -> RuntimeResult<()> {
        self.ensure_running()?;
        let channels = self
            .inner
            .pool
            .snapshot()
            .await?
            .channels
            .into_iter()
            .map(|c| c.peer_id)
            .collect::<Vec<_>>();
        info!(channels = channels.len(), "Suspending");
        self.inner
            .supervisor
            .observe(EdgeEvent::Suspended { channels })
            .await;
        Ok(())
    }

    /// The application is back in the foreground
    pub async fn resume(&self) -> RuntimeResult<()> {
        self.ensure_running()?;
        info!("Resuming");
        self.inner.supervisor.observe(EdgeEvent::Resumed).await;
        Ok(())
    }

    /// Memory pressure signal from the host
    pub async fn report_memory_pressure(&self, level: MemoryPressure) -> RuntimeResult<()> {
        self.ensure_running()?;
        let channels = self.inner.pool.snapshot().await?.channels;
        info!(%level, channels = channels.len(), "Memory pressure reported");
        self.inner
            .supervisor
            .observe(EdgeEvent::MemoryPressure { level, channels })
            .await;
        Ok(())
    }

    /// Resource usage sample from the host
    pub async fn report_resource_usage(&self, sample: ResourceSample) -> RuntimeResult<()> {
        self.ensure_running()?;
        self.inner
            .supervisor
            .observe(EdgeEvent::ResourceUsage(sample))
            .await;
        Ok(())
    }

    /// Counter totals
    pub fn metrics(&self) -> MetricsSnapshot {
        let mut snapshot = self.inner.metrics.snapshot();
        snapshot.intents = self
            .inner
            .supervisor
            .worker_health()
            .iter()
            .map(|w| w.intents_forwarded)
            .sum();
        snapshot
    }

    /// Direct access to the pool manager
    pub fn pool(&self) -> &PoolHandle {
        &self.inner.pool
    }

    /// Direct access to the admission gate
    pub fn admission(&self) -> &Arc<AdmissionGate> {
        &self.inner.gate
    }

    /// Network state, per-channel health and active mitigations
    pub async fn get_system_status_report(&self) -> RuntimeResult<SystemStatusReport> {
        self.ensure_running()?;
        let pool = self.inner.pool.snapshot().await?;
        let active_handler_actions = self.inner.supervisor.active_actions().await;
        Ok(SystemStatusReport {
            generated_at: self.inner.clock.now_ms(),
            overall_state: self.current_state(),
            emergency_mode: pool.emergency_mode,
            per_channel_health: pool.channels.iter().map(ChannelHealth::from).collect(),
            active_handler_actions,
        })
    }

    /// Drop every channel and clear all handler and admission state
    pub async fn perform_emergency_recovery(&self) -> RuntimeResult<EmergencyRecoveryReport> {
        self.ensure_running()?;
        warn!("Emergency recovery requested");
        let inner = &self.inner;
        let evicted_channels = inner.pool.reset().await?;
        inner.coordinator.reset().await?;
        let handlers_reset = inner.supervisor.reset().await;
        let admission_limit = inner.gate.set_limit(inner.gate.max_limit());
        inner.assembler.clear();
        inner.pending_probes.lock().clear();

        let report = EmergencyRecoveryReport {
            performed_at: inner.clock.now_ms(),
            evicted_channels,
            handlers_reset,
            admission_limit,
        };
        warn!(
            evicted = report.evicted_channels,
            handlers_reset = report.handlers_reset,
            admission_limit = report.admission_limit,
            "Emergency recovery complete"
        );
        Ok(report)
    }

    /// Health of every subsystem
    pub async fn perform_diagnostics(&self) -> RuntimeResult<DiagnosticsReport> {
        self.ensure_running()?;
        let inner = &self.inner;
        let pool = inner.pool.snapshot().await?;
        let layers = inner.coordinator.layer_reports().await?;
        let recent_transitions = inner.pool.transitions(DIAGNOSTIC_TRANSITIONS).await?;
        let handler_workers = inner.supervisor.worker_health();
        let admission = inner.gate.stats();
        let issues = find_issues(&pool, &layers, &handler_workers, &admission);

        Ok(DiagnosticsReport {
            generated_at: inner.clock.now_ms(),
            overall_state: self.current_state(),
            pool,
            layers,
            handler_workers,
            admission,
            metrics: self.metrics(),
            recent_transitions,
            issues,
        })
    }

    /// Run a probe now instead of waiting for the pool to ask
    pub async fn probe(&self, peer_id: &str) -> RuntimeResult<()> {
        self.ensure_running()?;
        router::probe(Arc::clone(&self.inner), peer_id.to_string()).await;
        Ok(())
    }
}

/// Outcome for an operation the handlers did not allow
fn held_back(decision: Decision) -> Option<SendOutcome> {
    match decision.verdict {
        Verdict::Allow => None,
        Verdict::Deny { reason } => Some(SendOutcome::Rejected { reason }),
        Verdict::Defer { retry_after_ms } if decision.decided_by == Some(exhaustion::NAME) => {
            Some(SendOutcome::Throttled { retry_after_ms })
        }
        Verdict::Defer { retry_after_ms } => Some(SendOutcome::Deferred { retry_after_ms }),
    }
}
