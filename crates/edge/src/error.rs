//! Error types for edge-case handling

use lifeline_mesh::MeshError;
use thiserror::Error;

/// Errors raised by handler workers and the admission gate
#[derive(Debug, Error)]
pub enum EdgeError {
    /// No admission slot freed up in time
    #[error("Admission timed out after {waited_ms}ms")]
    AdmissionTimeout {
        /// How long the caller queued
        waited_ms: u64,
    },

    /// A handler did not answer in time
    #[error("Handler {handler} timed out")]
    HandlerTimeout {
        /// Handler that stayed silent
        handler: &'static str,
    },

    /// Worker or gate has shut down
    #[error("Component shut down: {0}")]
    Shutdown(String),

    /// Mesh error while executing an intent
    #[error("Mesh error: {0}")]
    Mesh(#[from] MeshError),
}

/// Result type for edge operations
pub type EdgeResult<T> = Result<T, EdgeError>;
