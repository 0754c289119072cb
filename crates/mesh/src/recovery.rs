//! Recovery Engine
//!
//! Failed channels are brought back in four phases:
//!
//! 1. **Detect** – periodic health probes on idle routable channels, and
//!    noticing when a failed channel is due for another attempt.
//! 2. **Diagnose** – classify the last failure.
//! 3. **Remediate** – reconnect (or reset the transport after protocol
//!    errors), spaced by randomized exponential backoff.
//! 4. **Verify** – a run of clean exchanges before the channel is trusted.
//!
//! The engine holds no channel table; it only makes decisions. The pool
//! applies them under its single-writer discipline.

use crate::error::FailureReason;
use lifeline_core::PoolConfig;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Phase the engine is in for one channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryPhase {
    /// Watching for the next attempt slot
    Detect,
    /// Classifying the failure
    Diagnose,
    /// Transport asked to reconnect or reset
    Remediate,
    /// Counting clean exchanges
    Verify,
}

/// Failure classification driving remediation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Diagnosis {
    /// Peer stopped answering
    Timeout,
    /// Malformed traffic; the transport session is suspect
    ProtocolError,
    /// Local exhaustion; reconnecting would not help yet
    ResourceExhaustion,
    /// Link dropped
    Disconnect,
    /// Invariant violation inside the core
    Fatal,
    /// No failure on record
    Unknown,
}

impl Diagnosis {
    /// Classify a recorded failure
    pub fn from_failure(failure: Option<&FailureReason>) -> Self {
        match failure {
            Some(FailureReason::Timeout) => Diagnosis::Timeout,
            Some(FailureReason::Io(_)) | Some(FailureReason::Disconnected(_)) => {
                Diagnosis::Disconnect
            }
            Some(FailureReason::MalformedFrame(_)) | Some(FailureReason::ChecksumMismatch) => {
                Diagnosis::ProtocolError
            }
            Some(FailureReason::ResourceExhausted(_)) => Diagnosis::ResourceExhaustion,
            Some(FailureReason::InvariantViolation(_)) => Diagnosis::Fatal,
            None => Diagnosis::Unknown,
        }
    }
}

/// What the transport is asked to do for a recovering channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemediationAction {
    /// Re-establish the link
    Reconnect,
    /// Tear down and rebuild the transport session
    TransportReset,
}

/// Per-channel recovery bookkeeping
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryState {
    /// Attempts in the current failure episode
    pub attempts: u32,
    /// Current phase, `None` while the channel is healthy
    pub phase: Option<RecoveryPhase>,
    /// Deadline of the current `recovering` stint
    pub deadline_ms: Option<u64>,
    /// Earliest time for the next attempt
    pub next_attempt_at_ms: u64,
    /// Clean exchanges seen during verification
    pub clean_streak: u32,
    /// Result of the last diagnosis
    pub last_diagnosis: Option<Diagnosis>,
}

impl RecoveryState {
    /// Forget the episode once the channel is healthy again
    pub fn clear(&mut self) {
        *self = RecoveryState::default();
    }
}

/// Decisions of the four-phase recovery process
#[derive(Debug, Clone)]
pub struct RecoveryEngine {
    backoff_base_ms: u64,
    backoff_max_ms: u64,
    jitter_fraction: f64,
    recovery_timeout_ms: u64,
    max_attempts: u32,
    verify_clean_exchanges: u32,
    probe_interval_ms: u64,
    auto_recovery: bool,
}

impl RecoveryEngine {
    /// Build the engine from pool tuning
    pub fn new(config: &PoolConfig, auto_recovery: bool) -> Self {
        Self {
            backoff_base_ms: config.backoff_base_ms.max(1),
            backoff_max_ms: config.backoff_max_ms.max(config.backoff_base_ms.max(1)),
            jitter_fraction: config.jitter_fraction.clamp(0.0, 1.0),
            recovery_timeout_ms: config.recovery_timeout_ms,
            max_attempts: config.max_recovery_attempts.max(1),
            verify_clean_exchanges: config.verify_clean_exchanges.max(1),
            probe_interval_ms: config.probe_interval_ms,
            auto_recovery,
        }
    }

    /// Whether failed channels are reconnected without outside help
    pub fn auto_recovery(&self) -> bool {
        self.auto_recovery
    }

    /// Attempts allowed per failure episode
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Whether the episode has used up its attempts
    pub fn exhausted(&self, state: &RecoveryState) -> bool {
        state.attempts >= self.max_attempts
    }

    /// Deadline for a `recovering` stint starting at `now`
    pub fn deadline(&self, now: u64) -> u64 {
        now.saturating_add(self.recovery_timeout_ms)
    }

    /// Whether an idle routable channel should be probed
    pub fn probe_due(&self, last_activity_at: u64, last_probe_at: Option<u64>, now: u64) -> bool {
        let reference = last_probe_at.map_or(last_activity_at, |p| p.max(last_activity_at));
        now.saturating_sub(reference) >= self.probe_interval_ms
    }

    /// Diagnose phase
    pub fn diagnose(&self, failure: Option<&FailureReason>) -> Diagnosis {
        Diagnosis::from_failure(failure)
    }

    /// Remediate phase: `None` means wait for the next slot instead
    pub fn remediation_for(&self, diagnosis: Diagnosis) -> Option<RemediationAction> {
        match diagnosis {
            Diagnosis::ResourceExhaustion => None,
            Diagnosis::ProtocolError | Diagnosis::Fatal => Some(RemediationAction::TransportReset),
            Diagnosis::Timeout | Diagnosis::Disconnect | Diagnosis::Unknown => {
                Some(RemediationAction::Reconnect)
            }
        }
    }

    /// Verify phase: enough clean exchanges to trust the channel
    pub fn verified(&self, clean_streak: u32) -> bool {
        clean_streak >= self.verify_clean_exchanges
    }

    /// Randomized exponential backoff before attempt `attempt + 1`.
    ///
    /// `base * 2^attempt`, capped at the ceiling, then spread by
    /// `±jitter_fraction`; never exceeds the ceiling.
    pub fn backoff_ms<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> u64 {
        let exponential = self
            .backoff_base_ms
            .saturating_mul(1u64 << attempt.min(32))
            .min(self.backoff_max_ms);
        if self.jitter_fraction == 0.0 {
            return exponential;
        }
        let spread = exponential as f64 * self.jitter_fraction;
        let jittered = exponential as f64 + rng.gen_range(-spread..=spread);
        (jittered.max(0.0) as u64).min(self.backoff_max_ms)
    }
}
