//! Lifeline Runtime - the resilience system facade
//!
//! Wires the channel pool, the network state coordinator and the edge-case
//! handlers into one [`ResilienceSystem`] and executes, against a
//! [`Transport`](lifeline_mesh::Transport), everything the pool asks for.
//!
//! # Example Usage
//!
//! ```rust,no_run
//! use bytes::Bytes;
//! use lifeline_core::ResilienceConfig;
//! use lifeline_mesh::{LoopbackTransport, TokioClock};
//! use lifeline_runtime::ResilienceSystem;
//! use std::sync::Arc;
//!
//! # async fn demo() -> Result<(), lifeline_runtime::RuntimeError> {
//! let system = ResilienceSystem::start(
//!     ResilienceConfig::default(),
//!     Arc::new(LoopbackTransport::new()),
//!     TokioClock::shared(),
//! )?;
//!
//! for (peer, outcome) in system.send(Bytes::from_static(b"hello"), &["peer-a".into()], false).await? {
//!     println!("{peer}: {}", outcome.label());
//! }
//! system.shutdown().await;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod error;
pub mod inbound;
pub mod outcome;
pub mod report;
mod router;
pub mod system;

pub use error::{RuntimeError, RuntimeResult};
pub use inbound::{FrameAssembler, InboundFrame};
pub use outcome::{ConnectOutcome, DeliveryFailureNotice, SendOutcome};
pub use report::{ChannelHealth, DiagnosticsReport, EmergencyRecoveryReport, SystemStatusReport};
pub use system::ResilienceSystem;
