//! Error types for the runtime facade

use lifeline_core::CoreError;
use lifeline_edge::EdgeError;
use lifeline_mesh::MeshError;
use thiserror::Error;

/// Errors surfaced by [`crate::ResilienceSystem`]
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// Invalid configuration at start
    #[error("Configuration error: {0}")]
    Config(#[from] CoreError),

    /// Pool or coordinator failure
    #[error("Mesh error: {0}")]
    Mesh(#[from] MeshError),

    /// Handler or admission failure
    #[error("Edge error: {0}")]
    Edge(#[from] EdgeError),

    /// The system was shut down
    #[error("Resilience system is shut down")]
    ShutDown,
}

/// Result type for runtime operations
pub type RuntimeResult<T> = Result<T, RuntimeError>;
