//! What callers get back.
//!
//! Per-channel errors never leak out of the runtime as raw errors. A send
//! or connect resolves to one of these values.

use lifeline_core::PeerId;
use lifeline_mesh::{ChannelState, DeliveryFailure, FailureReason};
use serde::{Deserialize, Serialize};

/// Result of sending to one target
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SendOutcome {
    /// Handed to the transport and acknowledged
    Delivered {
        /// Acknowledgement latency
        latency_ms: f64,
        /// Attempts used, the first included
        attempts: u32,
    },
    /// Held until the channel's circuit closes
    Queued {
        /// Pool-assigned message id, reported again on delivery failure
        message_id: u64,
    },
    /// A handler asked to retry later
    Deferred {
        /// Suggested delay
        retry_after_ms: u64,
    },
    /// Resource exhaustion is metering operations
    Throttled {
        /// Time until the next token
        retry_after_ms: u64,
    },
    /// Not attempted and will not be
    Rejected {
        /// Why
        reason: String,
    },
    /// Attempted and failed
    Failed {
        /// Last failure
        reason: FailureReason,
    },
}

impl SendOutcome {
    /// Whether the payload reached the peer
    pub fn is_delivered(&self) -> bool {
        matches!(self, SendOutcome::Delivered { .. })
    }

    /// Short label for logs
    pub fn label(&self) -> &'static str {
        match self {
            SendOutcome::Delivered { .. } => "delivered",
            SendOutcome::Queued { .. } => "queued",
            SendOutcome::Deferred { .. } => "deferred",
            SendOutcome::Throttled { .. } => "throttled",
            SendOutcome::Rejected { .. } => "rejected",
            SendOutcome::Failed { .. } => "failed",
        }
    }
}

/// Result of a connect request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ConnectOutcome {
    /// The link is up; channel state afterwards
    Connected {
        /// Channel state after the connect
        state: ChannelState,
    },
    /// Another attempt is in flight or a handler asked to wait
    Deferred {
        /// Suggested delay
        retry_after_ms: u64,
    },
    /// Quarantined or otherwise refused
    Rejected {
        /// Why
        reason: String,
    },
    /// The transport could not connect
    Failed {
        /// Transport failure
        reason: FailureReason,
    },
}

/// Messages that will never be delivered
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryFailureNotice {
    /// Target peer
    pub peer_id: PeerId,
    /// Ids from [`SendOutcome::Queued`]
    pub message_ids: Vec<u64>,
    /// Why they were dropped
    pub reason: DeliveryFailure,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcomes_serialize_tagged() {
        let json = serde_json::to_value(SendOutcome::Throttled { retry_after_ms: 200 }).unwrap();
        assert_eq!(json["outcome"], "throttled");
        assert_eq!(json["retry_after_ms"], 200);

        let json = serde_json::to_value(ConnectOutcome::Rejected {
            reason: "quarantined".into(),
        })
        .unwrap();
        assert_eq!(json["outcome"], "rejected");
    }

    #[test]
    fn test_labels() {
        assert_eq!(SendOutcome::Queued { message_id: 1 }.label(), "queued");
        assert!(SendOutcome::Delivered {
            latency_ms: 1.0,
            attempts: 1
        }
        .is_delivered());
        assert!(!SendOutcome::Failed {
            reason: FailureReason::Timeout
        }
        .is_delivered());
    }
}
