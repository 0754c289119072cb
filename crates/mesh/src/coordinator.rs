//! Network State Coordinator
//!
//! Joins the physical, mesh and application layer reports into one
//! [`OverallNetworkState`] and only publishes a new state after it has held
//! for the stabilization window.
//!
//! # Join rule
//!
//! First match wins, over the latest non-stale report of every layer:
//!
//! | Condition | Overall |
//! |---|---|
//! | any `failed` | `failed` |
//! | any `reconnecting` | `reconnecting` |
//! | any `connecting` | `connecting` |
//! | all `ready` | `ready` |
//! | all `connected` or better | `connected` |
//! | otherwise | `disconnected` |
//!
//! A layer that never reported, or whose report is older than the stale
//! timeout, counts as `disconnected`.

use crate::clock::{SharedClock, Ticker};
use crate::error::{MeshError, MeshResult};
use lifeline_core::{CoordinatorConfig, Layer, ResilienceConfig};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// State reported by one layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayerState {
    /// No connectivity
    Disconnected,
    /// Establishing connectivity
    Connecting,
    /// Connected but not yet usable end to end
    Connected,
    /// Fully usable
    Ready,
    /// Lost connectivity, trying to get it back
    Reconnecting,
    /// Gave up
    Failed,
}

/// Joined state of all three layers
pub type OverallNetworkState = LayerState;

impl LayerState {
    fn at_least_connected(self) -> bool {
        matches!(self, LayerState::Connected | LayerState::Ready)
    }

    /// Join rule over one state per layer
    pub fn join(states: &[LayerState]) -> OverallNetworkState {
        if states.is_empty() {
            return LayerState::Disconnected;
        }
        if states.contains(&LayerState::Failed) {
            LayerState::Failed
        } else if states.contains(&LayerState::Reconnecting) {
            LayerState::Reconnecting
        } else if states.contains(&LayerState::Connecting) {
            LayerState::Connecting
        } else if states.iter().all(|s| *s == LayerState::Ready) {
            LayerState::Ready
        } else if states.iter().all(|s| s.at_least_connected()) {
            LayerState::Connected
        } else {
            LayerState::Disconnected
        }
    }
}

impl fmt::Display for LayerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LayerState::Disconnected => "disconnected",
            LayerState::Connecting => "connecting",
            LayerState::Connected => "connected",
            LayerState::Ready => "ready",
            LayerState::Reconnecting => "reconnecting",
            LayerState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// One layer's report
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerStateReport {
    /// Reporting layer
    pub layer: Layer,
    /// Reported state
    pub state: LayerState,
    /// Peers visible at that layer
    pub peer_count: usize,
    /// When the report was made
    pub timestamp: u64,
}

/// Diagnostic view of one layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerStatus {
    /// Layer
    pub layer: Layer,
    /// Latest report, if any
    pub last_report: Option<LayerStateReport>,
    /// State used by the join rule
    pub effective_state: LayerState,
    /// Whether the latest report has gone stale
    pub stale: bool,
}

/// A committed change of the overall state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateChange {
    /// Previously committed state
    pub from: OverallNetworkState,
    /// Newly committed state
    pub to: OverallNetworkState,
    /// Commit time
    pub at_ms: u64,
}

/// Pure join + stabilization logic
#[derive(Debug, Clone)]
pub struct LayerAggregator {
    reports: BTreeMap<Layer, LayerStateReport>,
    stale_timeout_ms: u64,
    window_ms: u64,
    committed: OverallNetworkState,
    committed_at: u64,
    provisional: Option<(OverallNetworkState, u64)>,
}

impl LayerAggregator {
    /// Start `disconnected` at `now`
    pub fn new(stale_timeout_ms: u64, window_ms: u64, now: u64) -> Self {
        Self {
            reports: BTreeMap::new(),
            stale_timeout_ms,
            window_ms,
            committed: LayerState::Disconnected,
            committed_at: now,
            provisional: None,
        }
    }

    /// Build from configuration
    pub fn from_config(config: &ResilienceConfig, now: u64) -> Self {
        Self::new(
            config.coordinator.stale_report_timeout_ms,
            config.stabilization_window_ms,
            now,
        )
    }

    /// Record a report; one older than the layer's latest is ignored
    pub fn ingest(&mut self, report: LayerStateReport) -> bool {
        if let Some(existing) = self.reports.get(&report.layer) {
            if report.timestamp < existing.timestamp {
                debug!(layer = %report.layer, "Ignoring out-of-order layer report");
                return false;
            }
        }
        self.reports.insert(report.layer, report);
        true
    }

    fn is_stale(&self, report: &LayerStateReport, now: u64) -> bool {
        now.saturating_sub(report.timestamp) > self.stale_timeout_ms
    }

    /// State of each layer as the join rule sees it
    pub fn effective_states(&self, now: u64) -> [LayerState; 3] {
        Layer::ALL.map(|layer| match self.reports.get(&layer) {
            Some(report) if !self.is_stale(report, now) => report.state,
            _ => LayerState::Disconnected,
        })
    }

    /// Joined state before stabilization
    pub fn computed(&self, now: u64) -> OverallNetworkState {
        LayerState::join(&self.effective_states(now))
    }

    /// Re-evaluate; returns the change when a provisional state commits
    pub fn evaluate(&mut self, now: u64) -> Option<StateChange> {
        let computed = self.computed(now);
        if computed == self.committed {
            self.provisional = None;
            return None;
        }

        // `ready` holds only while every layer is ready; leaving it skips the dwell
        let leaving_ready = self.committed == LayerState::Ready;
        if !leaving_ready {
            let since = match self.provisional {
                Some((state, since)) if state == computed => since,
                _ => {
                    debug!(provisional = %computed, committed = %self.committed, "Provisional network state");
                    self.provisional = Some((computed, now));
                    now
                }
            };
            if now.saturating_sub(since) < self.window_ms {
                return None;
            }
        }

        let change = StateChange {
            from: self.committed,
            to: computed,
            at_ms: now,
        };
        self.committed = computed;
        self.committed_at = now;
        self.provisional = None;
        Some(change)
    }

    /// Last committed state
    pub fn committed(&self) -> OverallNetworkState {
        self.committed
    }

    /// When the committed state was committed
    pub fn committed_at(&self) -> u64 {
        self.committed_at
    }

    /// State waiting out the window, with its start time
    pub fn provisional(&self) -> Option<(OverallNetworkState, u64)> {
        self.provisional
    }

    /// Diagnostic view of every layer
    pub fn layer_statuses(&self, now: u64) -> Vec<LayerStatus> {
        Layer::ALL
            .iter()
            .map(|layer| {
                let last_report = self.reports.get(layer).cloned();
                let stale = last_report
                    .as_ref()
                    .is_some_and(|report| self.is_stale(report, now));
                let effective_state = match &last_report {
                    Some(report) if !stale => report.state,
                    _ => LayerState::Disconnected,
                };
                LayerStatus {
                    layer: *layer,
                    last_report,
                    effective_state,
                    stale,
                }
            })
            .collect()
    }

    /// Forget every report and return to `disconnected`
    pub fn reset(&mut self, now: u64) {
        self.reports.clear();
        self.committed = LayerState::Disconnected;
        self.committed_at = now;
        self.provisional = None;
    }
}

/// Identifies one subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubscriptionToken(pub u64);

impl fmt::Display for SubscriptionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Committed state changes for one subscriber
#[derive(Debug)]
pub struct Subscription {
    /// Pass to `unsubscribe`
    pub token: SubscriptionToken,
    /// Committed changes, in order
    pub receiver: mpsc::Receiver<StateChange>,
}

/// Buffered changes per subscriber
const SUBSCRIBER_CAPACITY: usize = 64;

enum CoordinatorCommand {
    Report {
        report: LayerStateReport,
        reply: oneshot::Sender<bool>,
    },
    Subscribe {
        reply: oneshot::Sender<Subscription>,
    },
    Unsubscribe {
        token: SubscriptionToken,
        reply: oneshot::Sender<bool>,
    },
    Layers {
        reply: oneshot::Sender<Vec<LayerStatus>>,
    },
    Reset {
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable front door to the coordinator task
#[derive(Debug, Clone)]
pub struct CoordinatorHandle {
    commands: mpsc::Sender<CoordinatorCommand>,
    state: watch::Receiver<OverallNetworkState>,
    clock: SharedClock,
    call_timeout: Duration,
}

impl fmt::Debug for CoordinatorCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoordinatorCommand::Report { report, .. } => write!(f, "report({})", report.layer),
            CoordinatorCommand::Subscribe { .. } => f.write_str("subscribe"),
            CoordinatorCommand::Unsubscribe { token, .. } => write!(f, "unsubscribe({token})"),
            CoordinatorCommand::Layers { .. } => f.write_str("layers"),
            CoordinatorCommand::Reset { .. } => f.write_str("reset"),
        }
    }
}

impl CoordinatorHandle {
    async fn send(&self, command: CoordinatorCommand) -> MeshResult<()> {
        match tokio::time::timeout(self.call_timeout, self.commands.send(command)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(MeshError::Shutdown("network state coordinator stopped".to_string())),
            Err(_) => Err(MeshError::Timeout("network state coordinator mailbox full".to_string())),
        }
    }

    async fn call<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> CoordinatorCommand) -> MeshResult<T> {
        let (tx, rx) = oneshot::channel();
        self.send(make(tx)).await?;
        match tokio::time::timeout(self.call_timeout, rx).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Err(MeshError::Shutdown("network state coordinator dropped reply".to_string())),
            Err(_) => Err(MeshError::Timeout("network state coordinator did not answer".to_string())),
        }
    }

    /// Report a layer's state, timestamped now
    pub async fn report_layer_state(
        &self,
        layer: Layer,
        state: LayerState,
        peer_count: usize,
    ) -> MeshResult<()> {
        let report = LayerStateReport {
            layer,
            state,
            peer_count,
            timestamp: self.clock.now_ms(),
        };
        self.report(report).await.map(|_| ())
    }

    /// Submit a pre-built report.
    ///
    /// Returns once the coordinator has ingested and evaluated it; `false`
    /// means it was older than the layer's latest report.
    pub async fn report(&self, report: LayerStateReport) -> MeshResult<bool> {
        self.call(|reply| CoordinatorCommand::Report { report, reply })
            .await
    }

    /// Receive committed changes from now on
    pub async fn subscribe(&self) -> MeshResult<Subscription> {
        self.call(|reply| CoordinatorCommand::Subscribe { reply }).await
    }

    /// Stop a subscription; `false` if the token was unknown
    pub async fn unsubscribe(&self, token: SubscriptionToken) -> MeshResult<bool> {
        self.call(|reply| CoordinatorCommand::Unsubscribe { token, reply })
            .await
    }

    /// Last committed state; never blocks
    pub fn current_state(&self) -> OverallNetworkState {
        *self.state.borrow()
    }

    /// Watch the committed state
    pub fn watch(&self) -> watch::Receiver<OverallNetworkState> {
        self.state.clone()
    }

    /// Latest report and effective state per layer
    pub async fn layer_reports(&self) -> MeshResult<Vec<LayerStatus>> {
        self.call(|reply| CoordinatorCommand::Layers { reply }).await
    }

    /// Forget all reports; subscribers are kept
    pub async fn reset(&self) -> MeshResult<()> {
        self.call(|reply| CoordinatorCommand::Reset { reply }).await
    }
}

/// Owner task of the layer aggregator
pub struct NetworkStateCoordinator {
    aggregator: LayerAggregator,
    commands: mpsc::Receiver<CoordinatorCommand>,
    state: watch::Sender<OverallNetworkState>,
    subscribers: HashMap<SubscriptionToken, mpsc::Sender<StateChange>>,
    next_token: u64,
    clock: SharedClock,
    tick_interval: Duration,
    shutdown: CancellationToken,
}

impl NetworkStateCoordinator {
    /// Build the coordinator and its handle
    pub fn new(
        config: &ResilienceConfig,
        clock: SharedClock,
        shutdown: CancellationToken,
    ) -> (Self, CoordinatorHandle) {
        let tuning: &CoordinatorConfig = &config.coordinator;
        let (command_tx, command_rx) = mpsc::channel(tuning.mailbox_capacity.max(1));
        let (state_tx, state_rx) = watch::channel(LayerState::Disconnected);

        let handle = CoordinatorHandle {
            commands: command_tx,
            state: state_rx,
            clock: clock.clone(),
            call_timeout: config.pool.call_timeout(),
        };
        let coordinator = Self {
            aggregator: LayerAggregator::from_config(config, clock.now_ms()),
            commands: command_rx,
            state: state_tx,
            subscribers: HashMap::new(),
            next_token: 1,
            clock,
            tick_interval: Duration::from_millis(tuning.tick_interval_ms.max(1)),
            shutdown,
        };
        (coordinator, handle)
    }

    /// Spawn the coordinator task
    pub fn spawn(
        config: &ResilienceConfig,
        clock: SharedClock,
        shutdown: CancellationToken,
    ) -> (CoordinatorHandle, JoinHandle<()>) {
        let (coordinator, handle) = Self::new(config, clock, shutdown);
        (handle, tokio::spawn(coordinator.run()))
    }

    /// Process reports until cancelled
    pub async fn run(mut self) {
        info!("Network state coordinator started");
        let mut ticker = Ticker::new(self.tick_interval, self.shutdown.clone());

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle(command),
                    None => break,
                },
                running = ticker.tick() => {
                    if !running {
                        break;
                    }
                }
            }
            self.evaluate();
        }

        info!(state = %self.aggregator.committed(), "Network state coordinator stopped");
    }

    fn handle(&mut self, command: CoordinatorCommand) {
        debug!(command = ?command, "Coordinator command");
        match command {
            CoordinatorCommand::Report { report, reply } => {
                debug!(
                    layer = %report.layer,
                    state = %report.state,
                    peers = report.peer_count,
                    "Layer report"
                );
                let accepted = self.aggregator.ingest(report);
                self.evaluate();
                let _ = reply.send(accepted);
            }
            CoordinatorCommand::Subscribe { reply } => {
                let token = SubscriptionToken(self.next_token);
                self.next_token += 1;
                let (tx, rx) = mpsc::channel(SUBSCRIBER_CAPACITY);
                self.subscribers.insert(token, tx);
                debug!(token = %token, "Subscriber added");
                let _ = reply.send(Subscription { token, receiver: rx });
            }
            CoordinatorCommand::Unsubscribe { token, reply } => {
                let removed = self.subscribers.remove(&token).is_some();
                let _ = reply.send(removed);
            }
            CoordinatorCommand::Layers { reply } => {
                let _ = reply.send(self.aggregator.layer_statuses(self.clock.now_ms()));
            }
            CoordinatorCommand::Reset { reply } => {
                let now = self.clock.now_ms();
                let previous = self.aggregator.committed();
                self.aggregator.reset(now);
                warn!(previous = %previous, "Network state coordinator reset");
                if previous != LayerState::Disconnected {
                    self.publish(StateChange {
                        from: previous,
                        to: LayerState::Disconnected,
                        at_ms: now,
                    });
                }
                let _ = reply.send(());
            }
        }
    }

    fn evaluate(&mut self) {
        let now = self.clock.now_ms();
        if let Some(change) = self.aggregator.evaluate(now) {
            info!(from = %change.from, to = %change.to, "Network state committed");
            self.publish(change);
        }
    }

    fn publish(&mut self, change: StateChange) {
        self.state.send_replace(change.to);
        self.subscribers.retain(|token, tx| match tx.try_send(change) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(token = %token, "Subscriber lagging, change dropped");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(token = %token, "Subscriber gone");
                false
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TokioClock;
    use proptest::prelude::*;
    use std::sync::Arc;

    fn report(layer: Layer, state: LayerState, timestamp: u64) -> LayerStateReport {
        LayerStateReport {
            layer,
            state,
            peer_count: 1,
            timestamp,
        }
    }

    #[test]
    fn test_join_rule_order() {
        use LayerState::*;
        assert_eq!(LayerState::join(&[Connecting, Connecting, Ready]), Connecting);
        assert_eq!(LayerState::join(&[Failed, Reconnecting, Ready]), Failed);
        assert_eq!(LayerState::join(&[Reconnecting, Connecting, Ready]), Reconnecting);
        assert_eq!(LayerState::join(&[Ready, Ready, Ready]), Ready);
        assert_eq!(LayerState::join(&[Ready, Connected, Ready]), Connected);
        assert_eq!(LayerState::join(&[Ready, Disconnected, Ready]), Disconnected);
    }

    #[test]
    fn test_connecting_layers_commit_after_window() {
        let mut agg = LayerAggregator::new(30_000, 5_000, 0);
        agg.ingest(report(Layer::Physical, LayerState::Connecting, 0));
        agg.ingest(report(Layer::Mesh, LayerState::Connecting, 0));
        agg.ingest(report(Layer::Application, LayerState::Ready, 0));

        assert_eq!(agg.evaluate(0), None);
        assert_eq!(agg.provisional(), Some((LayerState::Connecting, 0)));
        assert_eq!(agg.evaluate(4_999), None);
        let change = agg.evaluate(5_000).unwrap();
        assert_eq!(change.to, LayerState::Connecting);
        assert_eq!(agg.committed(), LayerState::Connecting);
    }

    #[test]
    fn test_change_during_window_restarts_dwell() {
        let mut agg = LayerAggregator::new(30_000, 5_000, 0);
        for layer in Layer::ALL {
            agg.ingest(report(layer, LayerState::Connecting, 0));
        }
        agg.evaluate(0);
        agg.ingest(report(Layer::Mesh, LayerState::Reconnecting, 3_000));
        agg.evaluate(3_000);
        assert_eq!(agg.provisional(), Some((LayerState::Reconnecting, 3_000)));

        assert_eq!(agg.evaluate(6_000), None);
        assert_eq!(agg.evaluate(8_000).map(|c| c.to), Some(LayerState::Reconnecting));
    }

    #[test]
    fn test_failed_layer_drops_ready_at_once() {
        let mut agg = LayerAggregator::new(30_000, 5_000, 0);
        for layer in Layer::ALL {
            agg.ingest(report(layer, LayerState::Ready, 0));
        }
        agg.evaluate(0);
        assert_eq!(agg.evaluate(5_000).map(|c| c.to), Some(LayerState::Ready));

        agg.ingest(report(Layer::Physical, LayerState::Failed, 5_100));
        let change = agg.evaluate(5_100).unwrap();
        assert_eq!(change.from, LayerState::Ready);
        assert_eq!(change.to, LayerState::Failed);
        assert_eq!(agg.committed(), LayerState::Failed);
        assert_eq!(agg.provisional(), None);
    }

    #[test]
    fn test_partial_regression_drops_ready_at_once() {
        let mut agg = LayerAggregator::new(30_000, 5_000, 0);
        for layer in Layer::ALL {
            agg.ingest(report(layer, LayerState::Ready, 0));
        }
        agg.evaluate(0);
        assert_eq!(agg.committed(), LayerState::Disconnected);
        agg.evaluate(5_000);
        assert_eq!(agg.committed(), LayerState::Ready);
        agg.ingest(report(Layer::Mesh, LayerState::Connected, 6_000));
        assert_eq!(agg.evaluate(6_000).map(|c| c.to), Some(LayerState::Connected));

        // Coming back still waits out the window
        agg.ingest(report(Layer::Mesh, LayerState::Ready, 6_500));
        assert_eq!(agg.evaluate(6_500), None);
        assert_eq!(agg.evaluate(11_499), None);
        assert_eq!(agg.evaluate(11_500).map(|c| c.to), Some(LayerState::Ready));
    }

    #[test]
    fn test_flapping_back_clears_provisional() {
        let mut agg = LayerAggregator::new(30_000, 5_000, 0);
        agg.evaluate(0);
        agg.ingest(report(Layer::Physical, LayerState::Connecting, 100));
        agg.evaluate(100);
        assert!(agg.provisional().is_some());
        agg.ingest(report(Layer::Physical, LayerState::Disconnected, 200));
        agg.evaluate(200);
        assert_eq!(agg.provisional(), None);
        assert_eq!(agg.committed(), LayerState::Disconnected);
    }

    #[test]
    fn test_stale_reports_count_as_disconnected() {
        let mut agg = LayerAggregator::new(1_000, 0, 0);
        for layer in Layer::ALL {
            agg.ingest(report(layer, LayerState::Ready, 0));
        }
        assert_eq!(agg.evaluate(500).map(|c| c.to), Some(LayerState::Ready));
        assert_eq!(agg.evaluate(1_001).map(|c| c.to), Some(LayerState::Disconnected));

        let statuses = agg.layer_statuses(1_001);
        assert!(statuses.iter().all(|s| s.stale));
    }

    #[test]
    fn test_out_of_order_report_ignored() {
        let mut agg = LayerAggregator::new(30_000, 0, 0);
        assert!(agg.ingest(report(Layer::Mesh, LayerState::Ready, 10)));
        assert!(!agg.ingest(report(Layer::Mesh, LayerState::Failed, 5)));
        assert_eq!(agg.effective_states(10)[1], LayerState::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn test_coordinator_publishes_after_window() {
        let clock: SharedClock = Arc::new(TokioClock::starting_at(0));
        let token = CancellationToken::new();
        let config = ResilienceConfig::default();
        let (handle, task) = NetworkStateCoordinator::spawn(&config, clock, token.clone());

        let mut subscription = handle.subscribe().await.unwrap();
        for layer in Layer::ALL {
            handle.report_layer_state(layer, LayerState::Ready, 3).await.unwrap();
        }

        tokio::time::sleep(Duration::from_millis(4_000)).await;
        assert_eq!(handle.current_state(), LayerState::Disconnected);

        tokio::time::sleep(Duration::from_millis(1_500)).await;
        assert_eq!(handle.current_state(), LayerState::Ready);

        let change = subscription.receiver.recv().await.unwrap();
        assert_eq!(change.from, LayerState::Disconnected);
        assert_eq!(change.to, LayerState::Ready);

        assert!(handle.unsubscribe(subscription.token).await.unwrap());
        assert!(!handle.unsubscribe(subscription.token).await.unwrap());

        token.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_report_is_evaluated_before_returning() {
        let clock = crate::clock::ManualClock::new(1_000);
        let shared: SharedClock = clock.clone();
        let token = CancellationToken::new();
        let mut config = ResilienceConfig::default();
        config.coordinator.tick_interval_ms = 3_600_000;
        let (handle, task) = NetworkStateCoordinator::spawn(&config, shared, token.clone());

        for layer in Layer::ALL {
            handle.report_layer_state(layer, LayerState::Ready, 1).await.unwrap();
        }
        let layers = handle.layer_reports().await.unwrap();
        assert!(layers.iter().all(|l| l.effective_state == LayerState::Ready));

        // The dwell started at the report time, not at the next evaluation
        clock.advance(5_000);
        handle.report_layer_state(Layer::Mesh, LayerState::Ready, 1).await.unwrap();
        assert_eq!(handle.current_state(), LayerState::Ready);

        let stale = LayerStateReport {
            layer: Layer::Mesh,
            state: LayerState::Failed,
            peer_count: 0,
            timestamp: 0,
        };
        assert!(!handle.report(stale).await.unwrap());
        assert_eq!(handle.current_state(), LayerState::Ready);

        token.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_returns_to_disconnected() {
        let clock: SharedClock = Arc::new(TokioClock::starting_at(0));
        let token = CancellationToken::new();
        let mut config = ResilienceConfig::default();
        config.stabilization_window_ms = 0;
        let (handle, task) = NetworkStateCoordinator::spawn(&config, clock, token.clone());

        for layer in Layer::ALL {
            handle.report_layer_state(layer, LayerState::Connected, 1).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(handle.current_state(), LayerState::Connected);

        handle.reset().await.unwrap();
        assert_eq!(handle.current_state(), LayerState::Disconnected);
        let layers = handle.layer_reports().await.unwrap();
        assert!(layers.iter().all(|l| l.last_report.is_none()));

        token.cancel();
        task.await.unwrap();
    }

    fn layer_state() -> impl Strategy<Value = LayerState> {
        prop_oneof![
            Just(LayerState::Disconnected),
            Just(LayerState::Connecting),
            Just(LayerState::Connected),
            Just(LayerState::Ready),
            Just(LayerState::Reconnecting),
            Just(LayerState::Failed),
        ]
    }

    proptest! {
        #[test]
        fn prop_ready_only_after_full_window(
            steps in proptest::collection::vec((0usize..3, layer_state(), 0u64..3_000), 1..80)
        ) {
            let window = 2_000;
            let mut agg = LayerAggregator::new(u64::MAX / 2, window, 0);
            let mut latest = [LayerState::Disconnected; 3];
            let mut ready_since: Option<u64> = None;
            let mut now = 0;
            agg.evaluate(now);

            for (layer_idx, state, advance) in steps {
                now += advance;
                // Let time pass before the report lands.
                let before = agg.committed();
                agg.evaluate(now);
                if ready_since.is_none() {
                    prop_assert_ne!(agg.committed(), LayerState::Ready);
                }
                if let Some(since) = ready_since {
                    if now - since >= window {
                        prop_assert_eq!(agg.committed(), LayerState::Ready);
                    }
                }
                if before != LayerState::Ready && agg.committed() == LayerState::Ready {
                    prop_assert!(ready_since.is_some_and(|since| now - since >= window));
                }

                latest[layer_idx] = state;
                agg.ingest(report(Layer::ALL[layer_idx], state, now));
                let all_ready = LayerState::join(&latest) == LayerState::Ready;
                ready_since = match (all_ready, ready_since) {
                    (true, Some(since)) => Some(since),
                    (true, None) => Some(now),
                    (false, _) => None,
                };

                let before = agg.committed();
                agg.evaluate(now);
                if ready_since.is_none() {
                    prop_assert_ne!(agg.committed(), LayerState::Ready);
                }
                if before != LayerState::Ready && agg.committed() == LayerState::Ready {
                    prop_assert!(ready_since.is_some_and(|since| now - since >= window));
                }
            }
        }
    }
}
