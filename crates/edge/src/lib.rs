//! Lifeline Edge - mitigation policies for hostile link conditions
//!
//! Eight independent handlers watch what the mesh is doing and either hold
//! operations back or ask the channel pool for corrective action. None of
//! them touches a channel directly.
//!
//! # Handlers
//!
//! - **Connection dedup**: one in-flight connect per peer ([`dedup`])
//! - **Rapid-disconnect quarantine**: escalating exclusion of flapping peers
//!   ([`quarantine`])
//! - **Lifecycle transition**: suspend/resume revalidation ([`lifecycle`])
//! - **Memory pressure**: idle-channel and buffer shedding ([`memory`])
//! - **Backpressure**: defer and route around deep queues ([`backpressure`])
//! - **Network instability**: conservative timeouts for volatile links
//!   ([`instability`])
//! - **Admission control**: bounded in-flight operations ([`admission`])
//! - **Resource exhaustion**: token-bucket throttling ([`exhaustion`])
//!
//! Each handler runs on its own [`worker::HandlerWorker`] task under an
//! [`EdgeSupervisor`].

#![warn(missing_docs)]

pub mod admission;
pub mod backpressure;
pub mod dedup;
pub mod error;
pub mod exhaustion;
pub mod handler;
pub mod instability;
pub mod lifecycle;
pub mod memory;
pub mod quarantine;
pub mod worker;

pub use admission::{AdmissionControl, AdmissionGate, AdmissionPermit, AdmissionStats};
pub use backpressure::Backpressure;
pub use dedup::ConnectionDedup;
pub use error::{EdgeError, EdgeResult};
pub use exhaustion::{ResourceExhaustion, TokenBucket};
pub use handler::{
    Decision, EdgeCaseHandler, EdgeEvent, MemoryPressure, OperationKind, ResourceSample, Verdict,
};
pub use instability::NetworkInstability;
pub use lifecycle::LifecycleTransition;
pub use memory::MemoryPressureShedding;
pub use quarantine::RapidDisconnectQuarantine;
pub use worker::{EdgeSupervisor, HandlerWorker, WorkerHealth};

use lifeline_core::ResilienceConfig;
use std::sync::Arc;

/// The full handler set, wired to `gate` for admission control
pub fn default_handlers(
    config: &ResilienceConfig,
    gate: Arc<AdmissionGate>,
) -> Vec<Box<dyn EdgeCaseHandler>> {
    let edge = &config.edge;
    vec![
        Box::new(ConnectionDedup::new(&edge.dedup)),
        Box::new(RapidDisconnectQuarantine::new(
            &edge.quarantine,
            config.quarantine_base_duration_ms,
        )),
        Box::new(LifecycleTransition::new(&edge.lifecycle)),
        Box::new(MemoryPressureShedding::new(&edge.memory)),
        Box::new(Backpressure::new(&edge.backpressure)),
        Box::new(NetworkInstability::new(&edge.instability)),
        Box::new(AdmissionControl::new(gate, &edge.admission)),
        Box::new(ResourceExhaustion::new(&edge.exhaustion)),
    ]
}
