//! Handler workers and the supervisor that fans out to them.
//!
//! Each handler is owned by one [`HandlerWorker`] task, so handler state is
//! never shared. Events travel as `Arc<EdgeEvent>` to every worker; intents
//! a handler produces go straight to the pool's intent mailbox.
//!
//! The supervisor asks every worker for a verdict concurrently and waits at
//! most `decision_timeout` for each. A worker that does not answer is
//! treated as allowing the operation and is reported in
//! [`EdgeSupervisor::worker_health`].

use crate::error::{EdgeError, EdgeResult};
use crate::handler::{Decision, EdgeCaseHandler, EdgeEvent};
use futures::future::join_all;
use lifeline_core::WorkerConfig;
use lifeline_mesh::{Intent, SharedClock, Ticker};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

enum WorkerCommand {
    Decide {
        event: Arc<EdgeEvent>,
        reply: oneshot::Sender<Decision>,
    },
    Observe {
        event: Arc<EdgeEvent>,
    },
    Release {
        event: Arc<EdgeEvent>,
    },
    ActiveActions {
        reply: oneshot::Sender<Vec<String>>,
    },
    Reset {
        reply: oneshot::Sender<()>,
    },
}

#[derive(Debug, Default)]
struct WorkerStats {
    running: AtomicBool,
    decisions: AtomicU64,
    observed: AtomicU64,
    released: AtomicU64,
    intents_forwarded: AtomicU64,
    intents_dropped: AtomicU64,
    timeouts: AtomicU64,
    ticks: AtomicU64,
}

/// Health of one handler worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerHealth {
    /// Handler name
    pub handler: String,
    /// Whether the task is still running
    pub running: bool,
    /// Verdicts given
    pub decisions: u64,
    /// Events observed
    pub observed: u64,
    /// Reservations given back after a combined hold-back
    pub released: u64,
    /// Intents delivered to the pool
    pub intents_forwarded: u64,
    /// Intents lost to a full or closed intent mailbox
    pub intents_dropped: u64,
    /// Requests the worker did not answer in time
    pub timeouts: u64,
    /// Housekeeping ticks run
    pub ticks: u64,
    /// Commands waiting in the mailbox
    pub backlog: usize,
}

/// Task owning one handler
pub struct HandlerWorker {
    handler: Box<dyn EdgeCaseHandler>,
    commands: mpsc::Receiver<WorkerCommand>,
    intents: mpsc::Sender<Intent>,
    clock: SharedClock,
    tick_interval: Duration,
    shutdown: CancellationToken,
    stats: Arc<WorkerStats>,
}

impl HandlerWorker {
    /// Run until cancelled or every sender is gone
    pub async fn run(mut self) {
        let name = self.handler.name();
        self.stats.running.store(true, Ordering::SeqCst);
        debug!(handler = name, "Handler worker started");
        let mut ticker = Ticker::new(self.tick_interval, self.shutdown.clone());

        loop {
            tokio::select! {
                biased;
                command = self.commands.recv() => match command {
                    Some(command) => self.handle(command),
                    None => break,
                },
                live = ticker.tick() => {
                    if !live {
                        break;
                    }
                    let now = self.clock.now_ms();
                    let intents = self.handler.tick(now);
                    self.stats.ticks.fetch_add(1, Ordering::Relaxed);
                    self.forward(intents);
                }
            }
        }

        self.stats.running.store(false, Ordering::SeqCst);
        debug!(handler = name, "Handler worker stopped");
    }

    fn handle(&mut self, command: WorkerCommand) {
        let now = self.clock.now_ms();
        match command {
            WorkerCommand::Decide { event, reply } => {
                let mut decision = self.handler.should_allow(&event, now);
                decision.decided_by = Some(self.handler.name());
                self.stats.decisions.fetch_add(1, Ordering::Relaxed);
                self.forward(decision.intents.clone());
                let _ = reply.send(decision);
            }
            WorkerCommand::Observe { event } => {
                let intents = self.handler.observe(&event, now);
                self.stats.observed.fetch_add(1, Ordering::Relaxed);
                self.forward(intents);
            }
            WorkerCommand::Release { event } => {
                self.handler.release(&event, now);
                self.stats.released.fetch_add(1, Ordering::Relaxed);
            }
            WorkerCommand::ActiveActions { reply } => {
                let _ = reply.send(self.handler.active_actions(now));
            }
            WorkerCommand::Reset { reply } => {
                self.handler.reset();
                let _ = reply.send(());
            }
        }
    }

    fn forward(&self, intents: Vec<Intent>) {
        let name = self.handler.name();
        for intent in intents {
            let label = intent.label();
            let peer_id = intent.peer_id().map(str::to_string);
            match self.intents.try_send(intent) {
                Ok(()) => {
                    self.stats.intents_forwarded.fetch_add(1, Ordering::Relaxed);
                    info!(handler = name, intent = label, peer_id = ?peer_id, "Intent issued");
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    self.stats.intents_dropped.fetch_add(1, Ordering::Relaxed);
                    warn!(handler = name, intent = label, peer_id = ?peer_id, "Intent mailbox full; dropped");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    self.stats.intents_dropped.fetch_add(1, Ordering::Relaxed);
                    debug!(handler = name, intent = label, "Pool gone; intent dropped");
                }
            }
        }
    }
}

#[derive(Debug, Clone)]
struct WorkerSlot {
    name: &'static str,
    commands: mpsc::Sender<WorkerCommand>,
    stats: Arc<WorkerStats>,
}

impl WorkerSlot {
    async fn request<T>(
        &self,
        timeout: Duration,
        make: impl FnOnce(oneshot::Sender<T>) -> WorkerCommand,
    ) -> EdgeResult<T> {
        let (tx, rx) = oneshot::channel();
        let command = make(tx);
        let exchange = async {
            self.commands
                .send(command)
                .await
                .map_err(|_| EdgeError::Shutdown(format!("handler {} stopped", self.name)))?;
            rx.await
                .map_err(|_| EdgeError::Shutdown(format!("handler {} dropped reply", self.name)))
        };
        match tokio::time::timeout(timeout, exchange).await {
            Ok(result) => result,
            Err(_) => {
                self.stats.timeouts.fetch_add(1, Ordering::Relaxed);
                Err(EdgeError::HandlerTimeout { handler: self.name })
            }
        }
    }
}

/// Fans events out to handler workers and combines their verdicts
pub struct EdgeSupervisor {
    workers: Vec<WorkerSlot>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    decision_timeout: Duration,
}

impl std::fmt::Debug for WorkerCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            WorkerCommand::Decide { .. } => "decide",
            WorkerCommand::Observe { .. } => "observe",
            WorkerCommand::Release { .. } => "release",
            WorkerCommand::ActiveActions { .. } => "active_actions",
            WorkerCommand::Reset { .. } => "reset",
        };
        f.write_str(name)
    }
}

impl std::fmt::Debug for EdgeSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EdgeSupervisor")
            .field("handlers", &self.handler_names())
            .field("decision_timeout", &self.decision_timeout)
            .finish()
    }
}

impl EdgeSupervisor {
    /// Start one worker task per handler
    pub fn spawn(
        handlers: Vec<Box<dyn EdgeCaseHandler>>,
        config: &WorkerConfig,
        intents: mpsc::Sender<Intent>,
        clock: SharedClock,
        shutdown: CancellationToken,
    ) -> Self {
        let capacity = config.mailbox_capacity.max(1);
        let tick_interval = Duration::from_millis(config.tick_interval_ms.max(1));
        let mut workers = Vec::with_capacity(handlers.len());
        let mut tasks = Vec::with_capacity(handlers.len());

        for handler in handlers {
            let (tx, rx) = mpsc::channel(capacity);
            let stats = Arc::new(WorkerStats::default());
            workers.push(WorkerSlot {
                name: handler.name(),
                commands: tx,
                stats: Arc::clone(&stats),
            });
            let worker = HandlerWorker {
                handler,
                commands: rx,
                intents: intents.clone(),
                clock: Arc::clone(&clock),
                tick_interval,
                shutdown: shutdown.clone(),
                stats,
            };
            tasks.push(tokio::spawn(worker.run()));
        }

        info!(handlers = workers.len(), "Edge supervisor started");
        Self {
            workers,
            tasks: Mutex::new(tasks),
            decision_timeout: Duration::from_millis(config.decision_timeout_ms.max(1)),
        }
    }

    /// Names of the supervised handlers, in registration order
    pub fn handler_names(&self) -> Vec<&'static str> {
        self.workers.iter().map(|w| w.name).collect()
    }

    /// Ask every handler whether the operation behind `event` may proceed.
    ///
    /// Intents carried by the returned decision were already forwarded to
    /// the pool. When the combined verdict holds the operation back, every
    /// handler that allowed it is told to release what it reserved.
    pub async fn should_allow(&self, event: EdgeEvent) -> Decision {
        let event = Arc::new(event);
        let asks = self.workers.iter().map(|worker| {
            let event = Arc::clone(&event);
            async move {
                match worker
                    .request(self.decision_timeout, |reply| WorkerCommand::Decide { event, reply })
                    .await
                {
                    Ok(decision) => Some(decision),
                    Err(e) => {
                        warn!(handler = worker.name, error = %e, "No verdict; allowing");
                        None
                    }
                }
            }
        });
        let answers = join_all(asks).await;
        let reserved: Vec<bool> = answers
            .iter()
            .map(|answer| answer.as_ref().is_some_and(Decision::is_allowed))
            .collect();
        let decision = Decision::combine(answers.into_iter().map(|a| a.unwrap_or_else(Decision::allow)));
        if !decision.is_allowed() {
            debug!(
                event = event.label(),
                decided_by = ?decision.decided_by,
                verdict = ?decision.verdict,
                "Operation held back"
            );
            for (worker, _) in self.workers.iter().zip(reserved).filter(|(_, r)| *r) {
                let command = WorkerCommand::Release {
                    event: Arc::clone(&event),
                };
                self.deliver(worker, command, event.label()).await;
            }
        }
        decision
    }

    /// Deliver an observation to every handler
    pub async fn observe(&self, event: EdgeEvent) {
        let event = Arc::new(event);
        for worker in &self.workers {
            let command = WorkerCommand::Observe {
                event: Arc::clone(&event),
            };
            self.deliver(worker, command, event.label()).await;
        }
    }

    async fn deliver(&self, worker: &WorkerSlot, command: WorkerCommand, label: &'static str) {
        match tokio::time::timeout(self.decision_timeout, worker.commands.send(command)).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => debug!(handler = worker.name, event = label, "Worker stopped; command dropped"),
            Err(_) => {
                worker.stats.timeouts.fetch_add(1, Ordering::Relaxed);
                warn!(handler = worker.name, event = label, "Worker mailbox full; command dropped");
            }
        }
    }

    /// Mitigations currently in force, keyed by handler
    pub async fn active_actions(&self) -> BTreeMap<String, Vec<String>> {
        let asks = self.workers.iter().map(|worker| async move {
            let actions = worker
                .request(self.decision_timeout, |reply| WorkerCommand::ActiveActions { reply })
                .await;
            (worker.name, actions)
        });
        let mut all = BTreeMap::new();
        for (name, actions) in join_all(asks).await {
            match actions {
                Ok(actions) if !actions.is_empty() => {
                    all.insert(name.to_string(), actions);
                }
                Ok(_) => {}
                Err(e) => warn!(handler = name, error = %e, "Could not read active actions"),
            }
        }
        all
    }

    /// Clear every handler's state; returns how many handlers confirmed
    pub async fn reset(&self) -> usize {
        let asks = self.workers.iter().map(|worker| {
            worker.request(self.decision_timeout, |reply| WorkerCommand::Reset { reply })
        });
        let confirmed = join_all(asks).await.into_iter().filter(Result::is_ok).count();
        info!(confirmed, handlers = self.workers.len(), "Edge handlers reset");
        confirmed
    }

    /// Health of every worker
    pub fn worker_health(&self) -> Vec<WorkerHealth> {
        self.workers
            .iter()
            .map(|worker| {
                let stats = &worker.stats;
                WorkerHealth {
                    handler: worker.name.to_string(),
                    running: stats.running.load(Ordering::SeqCst) && !worker.commands.is_closed(),
                    decisions: stats.decisions.load(Ordering::Relaxed),
                    observed: stats.observed.load(Ordering::Relaxed),
                    released: stats.released.load(Ordering::Relaxed),
                    intents_forwarded: stats.intents_forwarded.load(Ordering::Relaxed),
                    intents_dropped: stats.intents_dropped.load(Ordering::Relaxed),
                    timeouts: stats.timeouts.load(Ordering::Relaxed),
                    ticks: stats.ticks.load(Ordering::Relaxed),
                    backlog: worker.commands.max_capacity() - worker.commands.capacity(),
                }
            })
            .collect()
    }

    /// Wait for every worker task to finish (after cancellation)
    pub async fn join(&self) {
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            let _ = task.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{OperationKind, Verdict};
    use lifeline_mesh::ManualClock;

    struct Gatekeeper {
        denied: bool,
        seen: usize,
    }

    impl EdgeCaseHandler for Gatekeeper {
        fn name(&self) -> &'static str {
            "gatekeeper"
        }

        fn should_allow(&mut self, _event: &EdgeEvent, _now: u64) -> Decision {
            if self.denied {
                Decision::deny("closed")
            } else {
                Decision::allow()
            }
        }

        fn observe(&mut self, event: &EdgeEvent, _now: u64) -> Vec<Intent> {
            self.seen += 1;
            if let EdgeEvent::PeerDisconnected { peer_id } = event {
                self.denied = true;
                return vec![Intent::ReleaseBuffers {
                    peer_id: peer_id.clone(),
                }];
            }
            Vec::new()
        }

        fn active_actions(&self, _now: u64) -> Vec<String> {
            if self.denied {
                vec![format!("closed after {} events", self.seen)]
            } else {
                Vec::new()
            }
        }

        fn reset(&mut self) {
            self.denied = false;
            self.seen = 0;
        }
    }

    struct Deferrer;

    impl EdgeCaseHandler for Deferrer {
        fn name(&self) -> &'static str {
            "deferrer"
        }

        fn should_allow(&mut self, _event: &EdgeEvent, _now: u64) -> Decision {
            Decision::defer(250)
        }

        fn active_actions(&self, _now: u64) -> Vec<String> {
            Vec::new()
        }

        fn reset(&mut self) {}
    }

    /// Reserves a slot per allowed operation
    #[derive(Default)]
    struct Ledger {
        held: usize,
    }

    impl EdgeCaseHandler for Ledger {
        fn name(&self) -> &'static str {
            "ledger"
        }

        fn should_allow(&mut self, _event: &EdgeEvent, _now: u64) -> Decision {
            self.held += 1;
            Decision::allow()
        }

        fn release(&mut self, _event: &EdgeEvent, _now: u64) {
            self.held -= 1;
        }

        fn active_actions(&self, _now: u64) -> Vec<String> {
            if self.held > 0 {
                vec![format!("{} held", self.held)]
            } else {
                Vec::new()
            }
        }

        fn reset(&mut self) {
            self.held = 0;
        }
    }

    struct Stuck;

    impl EdgeCaseHandler for Stuck {
        fn name(&self) -> &'static str {
            "stuck"
        }

        fn should_allow(&mut self, _event: &EdgeEvent, _now: u64) -> Decision {
            std::thread::sleep(Duration::from_millis(50));
            Decision::deny("too late")
        }

        fn active_actions(&self, _now: u64) -> Vec<String> {
            Vec::new()
        }

        fn reset(&mut self) {}
    }

    fn op() -> EdgeEvent {
        EdgeEvent::Operation {
            kind: OperationKind::Send,
            peer_id: Some("peer-a".into()),
            priority: false,
        }
    }

    fn spawn(
        handlers: Vec<Box<dyn EdgeCaseHandler>>,
        config: &WorkerConfig,
    ) -> (EdgeSupervisor, mpsc::Receiver<Intent>, CancellationToken) {
        let (tx, rx) = mpsc::channel(16);
        let token = CancellationToken::new();
        let supervisor = EdgeSupervisor::spawn(handlers, config, tx, ManualClock::new(0), token.clone());
        (supervisor, rx, token)
    }

    #[tokio::test]
    async fn test_verdicts_combine_and_intents_forward() {
        let (supervisor, mut intents, token) = spawn(
            vec![
                Box::new(Gatekeeper { denied: false, seen: 0 }),
                Box::new(Deferrer),
            ],
            &WorkerConfig::default(),
        );

        let decision = supervisor.should_allow(op()).await;
        assert_eq!(decision.verdict, Verdict::Defer { retry_after_ms: 250 });
        assert_eq!(decision.decided_by, Some("deferrer"));

        supervisor
            .observe(EdgeEvent::PeerDisconnected {
                peer_id: "peer-a".into(),
            })
            .await;
        assert_eq!(
            intents.recv().await,
            Some(Intent::ReleaseBuffers {
                peer_id: "peer-a".into()
            })
        );

        let decision = supervisor.should_allow(op()).await;
        assert_eq!(decision.decided_by, Some("gatekeeper"));
        assert!(matches!(decision.verdict, Verdict::Deny { .. }));

        let actions = supervisor.active_actions().await;
        assert_eq!(actions.len(), 1);
        assert!(actions.contains_key("gatekeeper"));

        assert_eq!(supervisor.reset().await, 2);
        assert!(supervisor.active_actions().await.is_empty());

        token.cancel();
        supervisor.join().await;
        assert!(supervisor.worker_health().iter().all(|h| !h.running));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_slow_handler_fails_open() {
        let config = WorkerConfig {
            decision_timeout_ms: 5,
            ..WorkerConfig::default()
        };
        let (supervisor, _intents, token) = spawn(vec![Box::new(Stuck)], &config);

        let decision = supervisor.should_allow(op()).await;
        assert!(decision.is_allowed());
        let health = supervisor.worker_health();
        assert_eq!(health[0].handler, "stuck");
        assert_eq!(health[0].timeouts, 1);
        token.cancel();
    }

    #[tokio::test]
    async fn test_held_back_operation_releases_reservations() {
        let (supervisor, _intents, token) = spawn(
            vec![Box::new(Ledger::default()), Box::new(Deferrer)],
            &WorkerConfig::default(),
        );
        let decision = supervisor.should_allow(op()).await;
        assert!(!decision.is_allowed());
        assert!(!supervisor.active_actions().await.contains_key("ledger"));
        assert_eq!(supervisor.worker_health()[0].released, 1);
        // The deferring handler reserved nothing
        assert_eq!(supervisor.worker_health()[1].released, 0);
        token.cancel();
    }

    #[tokio::test]
    async fn test_allowed_operation_keeps_reservations() {
        let (supervisor, _intents, token) =
            spawn(vec![Box::new(Ledger::default())], &WorkerConfig::default());
        assert!(supervisor.should_allow(op()).await.is_allowed());
        let actions = supervisor.active_actions().await;
        assert_eq!(actions["ledger"], vec!["1 held".to_string()]);
        assert_eq!(supervisor.worker_health()[0].released, 0);
        token.cancel();
    }

    #[tokio::test]
    async fn test_health_counts_activity() {
        let (supervisor, _intents, token) = spawn(
            vec![Box::new(Gatekeeper { denied: false, seen: 0 })],
            &WorkerConfig::default(),
        );
        supervisor.should_allow(op()).await;
        supervisor.observe(EdgeEvent::Resumed).await;
        // Round-trip so the observation is processed
        supervisor.active_actions().await;

        let health = &supervisor.worker_health()[0];
        assert!(health.running);
        assert_eq!(health.decisions, 1);
        assert_eq!(health.observed, 1);
        assert_eq!(supervisor.handler_names(), vec!["gatekeeper"]);
        token.cancel();
    }
}
