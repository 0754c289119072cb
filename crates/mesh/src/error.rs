//! Error types for Lifeline mesh operations.
//!
//! Two families live here: [`MeshError`], returned by pool, coordinator and
//! transport calls, and [`FailureReason`] / [`ErrorClass`], the taxonomy used
//! when a channel exchange fails. Failure reasons never cross into the
//! application layer; they are folded into channel health.

use crate::channel::ChannelState;
use lifeline_core::{CoreError, PeerId};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Errors that can occur in mesh operations.
#[derive(Debug, Error)]
pub enum MeshError {
    /// Peer not found
    #[error("Peer not found: {peer_id}")]
    PeerNotFound { peer_id: PeerId },

    /// Peer is quarantined and may not reconnect yet
    #[error("Peer {peer_id} quarantined until {until_ms}")]
    Quarantined { peer_id: PeerId, until_ms: u64 },

    /// Circuit breaker is open for this channel
    #[error("Circuit open for {peer_id} (state {state:?})")]
    CircuitOpen { peer_id: PeerId, state: ChannelState },

    /// Channel is held for maintenance
    #[error("Channel {peer_id} is under maintenance")]
    Maintenance { peer_id: PeerId },

    /// Transition outside the channel state graph
    #[error("Invalid transition for {peer_id}: {from:?} -> {to:?}")]
    InvalidTransition {
        peer_id: PeerId,
        from: ChannelState,
        to: ChannelState,
    },

    /// Malformed frame on the wire
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    /// Transport-level failure
    #[error("Transport error ({}): {reason}", reason.class())]
    Transport { reason: FailureReason },

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] CoreError),

    /// Timeout error
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Component has shut down
    #[error("Component shut down: {0}")]
    Shutdown(String),
}

impl MeshError {
    /// Transport failure with the given reason
    pub fn transport(reason: FailureReason) -> Self {
        MeshError::Transport { reason }
    }
}

/// Result type for mesh operations.
pub type MeshResult<T> = Result<T, MeshError>;

/// Failure taxonomy that decides how a failed exchange is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Timeout or transient I/O; retried with backoff
    Transient,
    /// Malformed frame or checksum mismatch; fails the channel at once
    Protocol,
    /// Memory/CPU exhaustion; handled by shedding, not per channel
    Resource,
    /// Internal invariant violation; isolates the channel
    Fatal,
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorClass::Transient => "transient",
            ErrorClass::Protocol => "protocol",
            ErrorClass::Resource => "resource",
            ErrorClass::Fatal => "fatal",
        };
        f.write_str(name)
    }
}

/// Why a single exchange with a peer failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum FailureReason {
    /// No answer within the operation timeout
    Timeout,
    /// Transient I/O failure
    Io(String),
    /// Link dropped by the transport
    Disconnected(String),
    /// Frame could not be parsed
    MalformedFrame(String),
    /// Frame integrity check failed
    ChecksumMismatch,
    /// Local resources exhausted
    ResourceExhausted(String),
    /// Internal invariant violated while handling the channel
    InvariantViolation(String),
}

impl FailureReason {
    /// Taxonomy class of this failure
    pub fn class(&self) -> ErrorClass {
        match self {
            FailureReason::Timeout | FailureReason::Io(_) | FailureReason::Disconnected(_) => {
                ErrorClass::Transient
            }
            FailureReason::MalformedFrame(_) | FailureReason::ChecksumMismatch => {
                ErrorClass::Protocol
            }
            FailureReason::ResourceExhausted(_) => ErrorClass::Resource,
            FailureReason::InvariantViolation(_) => ErrorClass::Fatal,
        }
    }

    /// Whether the caller may retry with backoff
    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Transient
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Timeout => f.write_str("timeout"),
            FailureReason::Io(detail) => write!(f, "io: {detail}"),
            FailureReason::Disconnected(detail) => write!(f, "disconnected: {detail}"),
            FailureReason::MalformedFrame(detail) => write!(f, "malformed frame: {detail}"),
            FailureReason::ChecksumMismatch => f.write_str("checksum mismatch"),
            FailureReason::ResourceExhausted(detail) => write!(f, "resource exhausted: {detail}"),
            FailureReason::InvariantViolation(detail) => {
                write!(f, "invariant violation: {detail}")
            }
        }
    }
}

/// Fold a mesh error into the failure taxonomy
impl From<MeshError> for FailureReason {
    fn from(err: MeshError) -> Self {
        match err {
            MeshError::MalformedFrame(reason) => FailureReason::MalformedFrame(reason),
            MeshError::Transport { reason } => reason,
            MeshError::Timeout(_) => FailureReason::Timeout,
            other => FailureReason::Io(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_classification() {
        assert_eq!(FailureReason::Timeout.class(), ErrorClass::Transient);
        assert_eq!(
            FailureReason::Disconnected("link lost".into()).class(),
            ErrorClass::Transient
        );
        assert_eq!(FailureReason::ChecksumMismatch.class(), ErrorClass::Protocol);
        assert_eq!(
            FailureReason::ResourceExhausted("oom".into()).class(),
            ErrorClass::Resource
        );
        assert_eq!(
            FailureReason::InvariantViolation("negative counter".into()).class(),
            ErrorClass::Fatal
        );
    }

    #[test]
    fn test_only_transient_is_retryable() {
        assert!(FailureReason::Io("reset".into()).is_retryable());
        assert!(!FailureReason::MalformedFrame("short".into()).is_retryable());
    }

    #[test]
    fn test_transport_error_display_mentions_class() {
        let err = MeshError::transport(FailureReason::ChecksumMismatch);
        assert!(err.to_string().contains("protocol"));
    }
}
