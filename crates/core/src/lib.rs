//! Core functionality for the Lifeline resilience core.
//!
//! This crate provides the configuration surface, logging setup, error types
//! and shared identifiers used across the Lifeline workspace.

#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod logging;
pub mod types;

pub use config::{
    AdmissionConfig, BackpressureConfig, CoordinatorConfig, DedupConfig, EdgeConfig,
    ExhaustionConfig, InstabilityConfig, LifecycleConfig, MemoryConfig, NodeConfig, PoolConfig,
    QualityWeights, QuarantineConfig, ResilienceConfig, WorkerConfig,
};
pub use error::{CoreError, Error, Result};
pub use types::{current_timestamp_ms, Layer, PeerId, TimestampMs};
