//! Lifeline Mesh - channel lifecycle and network state for unreliable meshes
//!
//! Keeps one health-scored state machine per remote peer and joins layer
//! reports into a single, stabilized network state. Links are assumed to be
//! flaky; nothing in here panics on bad network input.
//!
//! # Core Components
//!
//! - **Channel Pool**: per-peer state graph, quality scoring, circuit breaking
//!   ([`pool`], [`channel`], [`quality`])
//! - **Recovery Engine**: detect, diagnose, remediate, verify ([`recovery`])
//! - **Pool Manager**: single-writer actor around the pool ([`manager`])
//! - **Network State Coordinator**: layer join rule with hysteresis
//!   ([`coordinator`])
//! - **Frames and Transport**: boundary parsing and the transport seam
//!   ([`frame`], [`transport`])
//!
//! # Example Usage
//!
//! ```rust,no_run
//! use lifeline_core::ResilienceConfig;
//! use lifeline_mesh::{ChannelPoolManager, TokioClock};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn demo() -> Result<(), lifeline_mesh::MeshError> {
//! let config = ResilienceConfig::default();
//! let token = CancellationToken::new();
//! let (pool, _task) = ChannelPoolManager::spawn(&config, TokioClock::shared(), token.clone());
//!
//! pool.acquire("peer-a").await?;
//! pool.report_success("peer-a", 42.0, 4096).await?;
//! println!("{:?}", pool.snapshot().await?.mesh_layer_state);
//! token.cancel();
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod channel;
pub mod clock;
pub mod coordinator;
pub mod error;
pub mod event;
pub mod frame;
pub mod intent;
pub mod manager;
pub mod metrics;
pub mod pool;
pub mod quality;
pub mod recovery;
pub mod transport;

pub use channel::{
    ChannelHandle, ChannelInstance, ChannelSnapshot, ChannelState, OperationBudget, TimeoutProfile,
};
pub use clock::{Clock, ManualClock, SharedClock, Ticker, TokioClock};
pub use coordinator::{
    CoordinatorHandle, LayerAggregator, LayerState, LayerStateReport, LayerStatus,
    NetworkStateCoordinator, OverallNetworkState, StateChange, Subscription, SubscriptionToken,
};
pub use error::{ErrorClass, FailureReason, MeshError, MeshResult};
pub use event::{DeliveryFailure, EvictReason, EvictionReport, PoolEvent, ReadyMessage, Transition};
pub use frame::{split_frames, Frame, FrameHeader};
pub use intent::Intent;
pub use manager::{ChannelPoolManager, PoolHandle};
pub use metrics::{FlowController, FlowPermit, MetricsCollector, MetricsSnapshot};
pub use pool::{ChannelPool, PoolHealthReport, StateCounts};
pub use quality::{QualityMetrics, QualityMonitor};
pub use recovery::{Diagnosis, RecoveryEngine, RecoveryPhase, RemediationAction};
pub use transport::{LoopbackTransport, SendReceipt, Transport, TransportEvent};
