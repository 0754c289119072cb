//! Executes what the pool asks for.
//!
//! The pool never performs I/O. Probes, remediation and queue flushes
//! arrive here as [`PoolEvent`]s and run on their own tasks against the
//! transport. Their results go back to the pool as exchange reports.

use crate::outcome::DeliveryFailureNotice;
use crate::system::Inner;
use lifeline_core::{Layer, PeerId};
use lifeline_edge::{EdgeEvent, MemoryPressure, OperationKind};
use lifeline_mesh::{
    DeliveryFailure, ErrorClass, FailureReason, MeshError, PoolEvent, ReadyMessage, RemediationAction, Ticker,
};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Pool event consumer and mesh-layer reporter
pub(crate) struct EventRouter {
    inner: Arc<Inner>,
    events: broadcast::Receiver<PoolEvent>,
    report_interval: Duration,
}

impl EventRouter {
    pub(crate) fn spawn(
        inner: Arc<Inner>,
        events: broadcast::Receiver<PoolEvent>,
        report_interval: Duration,
    ) -> JoinHandle<()> {
        let router = Self {
            inner,
            events,
            report_interval,
        };
        tokio::spawn(router.run())
    }

    async fn run(mut self) {
        info!("Event router started");
        let mut ticker = Ticker::new(self.report_interval, self.inner.shutdown.clone());
        loop {
            tokio::select! {
                event = self.events.recv() => match event {
                    Ok(event) => self.route(event),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Event router lagged; pool events lost");
                    }
                    Err(RecvError::Closed) => break,
                },
                live = ticker.tick() => {
                    if !live {
                        break;
                    }
                    self.report_mesh_layer().await;
                }
            }
        }
        info!("Event router stopped");
    }

    fn route(&self, event: PoolEvent) {
        self.inner.metrics.record_event(&event);
        match event {
            PoolEvent::ProbeRequested { peer_id } => {
                self.spawn_job(probe(Arc::clone(&self.inner), peer_id));
            }
            PoolEvent::RemediationRequested {
                peer_id,
                action,
                attempt,
            } => {
                self.spawn_job(remediate(Arc::clone(&self.inner), peer_id, action, attempt));
            }
            PoolEvent::QueueReady { peer_id, messages } => {
                self.spawn_job(flush(Arc::clone(&self.inner), peer_id, messages));
            }
            PoolEvent::DeliveryFailed {
                peer_id,
                message_ids,
                reason,
            } => self.inner.notify_delivery_failure(DeliveryFailureNotice {
                peer_id,
                message_ids,
                reason,
            }),
            PoolEvent::Evicted(report) => {
                self.inner.assembler.forget(&report.peer_id);
                self.inner.pending_probes.lock().remove(&report.peer_id);
            }
            PoolEvent::ChannelIsolated { peer_id } => {
                warn!(peer_id = %peer_id, "Channel isolated; operator attention needed");
            }
            PoolEvent::Reset { evicted } => debug!(evicted, "Pool reset observed"),
            PoolEvent::FailureObserved {
                peer_id,
                class: ErrorClass::Resource,
            } => {
                self.spawn_job(shed_for_resource_failure(Arc::clone(&self.inner), peer_id));
            }
            PoolEvent::Transitioned(_)
            | PoolEvent::FailureObserved { .. }
            | PoolEvent::ExchangeCompleted { .. } => {}
        }
    }

    fn spawn_job(&self, job: impl Future<Output = ()> + Send + 'static) {
        let shutdown = self.inner.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = job => {}
            }
        });
    }

    async fn report_mesh_layer(&self) {
        let report = match self.inner.pool.snapshot().await {
            Ok(report) => report,
            Err(e) => {
                debug!(error = %e, "No pool snapshot for the mesh layer report");
                return;
            }
        };
        if let Err(e) = self
            .inner
            .coordinator
            .report_layer_state(Layer::Mesh, report.mesh_layer_state, report.routable_channels)
            .await
        {
            debug!(error = %e, "Mesh layer report not delivered");
        }
    }
}

/// A resource failure is a shedding signal, not a channel fault
async fn shed_for_resource_failure(inner: Arc<Inner>, peer: PeerId) {
    let channels = match inner.pool.snapshot().await {
        Ok(report) => report.channels,
        Err(e) => {
            debug!(peer_id = %peer, error = %e, "No snapshot for resource shedding");
            return;
        }
    };
    info!(peer_id = %peer, channels = channels.len(), "Resource exhaustion reported by transport");
    inner
        .supervisor
        .observe(EdgeEvent::MemoryPressure {
            level: MemoryPressure::Warning,
            channels,
        })
        .await;
}

fn failure_of(result: Result<Result<(), MeshError>, tokio::time::error::Elapsed>) -> Option<FailureReason> {
    match result {
        Ok(Ok(())) => None,
        Ok(Err(e)) => Some(e.into()),
        Err(_) => Some(FailureReason::Timeout),
    }
}

/// Send a health probe and report the exchange
pub(crate) async fn probe(inner: Arc<Inner>, peer_id: PeerId) {
    let decision = inner
        .supervisor
        .should_allow(EdgeEvent::Operation {
            kind: OperationKind::Probe,
            peer_id: Some(peer_id.clone()),
            priority: true,
        })
        .await;
    if !decision.is_allowed() {
        debug!(peer_id = %peer_id, decided_by = ?decision.decided_by, "Probe held back");
        return;
    }
    let _permit = match inner.gate.acquire().await {
        Ok(permit) => permit,
        Err(e) => {
            debug!(peer_id = %peer_id, error = %e, "Probe not admitted");
            return;
        }
    };

    let budget = inner.budget(&peer_id).await;
    let now = inner.clock.now_ms();
    inner.pending_probes.lock().insert(peer_id.clone(), now);
    let sent = tokio::time::timeout(
        Duration::from_millis(budget.timeout_ms),
        inner.transport.probe(&peer_id, (now / 1000) as u32),
    )
    .await;

    // Whichever of the receipt and the PROBE_ACK clears the pending entry
    // first records the exchange; the other is dropped.
    match sent {
        Ok(Ok(receipt)) => {
            if inner.pending_probes.lock().remove(&peer_id).is_some() {
                inner.record_exchange(&peer_id, receipt.latency_ms, receipt.bytes).await;
            }
        }
        Ok(Err(e)) => {
            inner.pending_probes.lock().remove(&peer_id);
            inner.record_failure(&peer_id, e.into(), budget.timeout_ms).await;
        }
        Err(_) => {
            inner.pending_probes.lock().remove(&peer_id);
            inner
                .record_failure(&peer_id, FailureReason::Timeout, budget.timeout_ms)
                .await;
        }
    }
}

/// Run one remediation attempt for a failed channel
pub(crate) async fn remediate(
    inner: Arc<Inner>,
    peer_id: PeerId,
    action: RemediationAction,
    attempt: u32,
) {
    let decision = inner
        .supervisor
        .should_allow(EdgeEvent::Operation {
            kind: OperationKind::Remediate,
            peer_id: Some(peer_id.clone()),
            priority: false,
        })
        .await;
    if !decision.is_allowed() {
        debug!(
            peer_id = %peer_id,
            attempt,
            decided_by = ?decision.decided_by,
            "Remediation held back until the next recovery tick"
        );
        return;
    }

    let outcome = {
        let _permit = match inner.gate.acquire().await {
            Ok(permit) => permit,
            Err(e) => {
                debug!(peer_id = %peer_id, error = %e, "Remediation not admitted");
                return;
            }
        };
        let wait = Duration::from_millis(inner.config.pool.standard_timeout_ms);
        let result = match action {
            RemediationAction::Reconnect => {
                tokio::time::timeout(wait, inner.transport.reconnect(&peer_id)).await
            }
            RemediationAction::TransportReset => {
                tokio::time::timeout(wait, inner.transport.reset(&peer_id)).await
            }
        };
        failure_of(result)
    };

    match outcome {
        None => {
            info!(peer_id = %peer_id, ?action, attempt, "Remediation succeeded; verifying");
            match inner.pool.peer_connected(&peer_id).await {
                Ok(state) => debug!(peer_id = %peer_id, %state, "Channel re-entered recovery"),
                Err(e) => {
                    debug!(peer_id = %peer_id, error = %e, "Pool refused the reconnect");
                    return;
                }
            }
            probe(inner, peer_id).await;
        }
        Some(reason) => {
            warn!(peer_id = %peer_id, ?action, attempt, %reason, "Remediation failed");
            if let Err(e) = inner.pool.report_failure(&peer_id, reason).await {
                debug!(peer_id = %peer_id, error = %e, "Remediation failure not recorded");
            }
        }
    }
}

/// Send messages released by a closing circuit, oldest first
async fn flush(inner: Arc<Inner>, peer_id: PeerId, messages: Vec<ReadyMessage>) {
    debug!(peer_id = %peer_id, count = messages.len(), "Flushing queued messages");
    let budget = inner.budget(&peer_id).await;
    let mut remaining = messages.into_iter();

    while let Some(message) = remaining.next() {
        let sent = tokio::time::timeout(
            Duration::from_millis(budget.timeout_ms),
            inner.transport.send(&peer_id, message.payload.clone()),
        )
        .await;
        let reason = match sent {
            Ok(Ok(receipt)) => {
                inner.metrics.record_sent(message.payload.len());
                inner.record_exchange(&peer_id, receipt.latency_ms, receipt.bytes).await;
                continue;
            }
            Ok(Err(e)) => FailureReason::from(e),
            Err(_) => FailureReason::Timeout,
        };

        inner.record_failure(&peer_id, reason.clone(), budget.timeout_ms).await;
        let message_ids: Vec<u64> = std::iter::once(message.id)
            .chain(remaining.map(|m| m.id))
            .collect();
        warn!(
            peer_id = %peer_id,
            %reason,
            dropped = message_ids.len(),
            "Queued messages could not be delivered"
        );
        inner.notify_delivery_failure(DeliveryFailureNotice {
            peer_id,
            message_ids,
            reason: DeliveryFailure::SendFailed,
        });
        return;
    }
}
