//! Configuration management for Lifeline.
//!
//! Every recognized option has a default so a partial TOML file (or none at
//! all) yields a usable configuration. Durations are carried as milliseconds,
//! matching the timestamps used throughout the mesh layer.

use crate::error::{CoreError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Top-level configuration for the resilience core.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    /// Upper bound on concurrently admitted operations
    pub max_concurrent_operations: usize,
    /// Fraction of degraded channels that switches the pool into emergency mode
    pub emergency_mode_threshold: f64,
    /// Whether the recovery engine reconnects failed channels on its own
    pub auto_recovery_enabled: bool,
    /// First-level quarantine duration for flapping peers
    pub quarantine_base_duration_ms: u64,
    /// Dwell time before a computed network state is committed
    pub stabilization_window_ms: u64,
    /// Weights of the composite quality score
    pub quality_score_weights: QualityWeights,
    /// Channel pool tuning
    pub pool: PoolConfig,
    /// Network state coordinator tuning
    pub coordinator: CoordinatorConfig,
    /// Edge-case handler tuning
    pub edge: EdgeConfig,
    /// Node identity and logging
    pub node: NodeConfig,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            max_concurrent_operations: 16,
            emergency_mode_threshold: 0.25,
            auto_recovery_enabled: true,
            quarantine_base_duration_ms: 30_000,
            stabilization_window_ms: 5_000,
            quality_score_weights: QualityWeights::default(),
            pool: PoolConfig::default(),
            coordinator: CoordinatorConfig::default(),
            edge: EdgeConfig::default(),
            node: NodeConfig::default(),
        }
    }
}

/// Weights of the composite quality score.
///
/// The weights do not need to sum to one in the file; [`QualityWeights::normalized`]
/// rescales them before use.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityWeights {
    /// Weight of the delivery reliability EWMA
    pub reliability: f64,
    /// Weight of normalized throughput
    pub throughput: f64,
    /// Weight of `1 - normalized latency`
    pub latency: f64,
    /// Weight of `1 - error rate`
    pub error_rate: f64,
}

impl Default for QualityWeights {
    fn default() -> Self {
        Self {
            reliability: 0.4,
            throughput: 0.25,
            latency: 0.2,
            error_rate: 0.15,
        }
    }
}

impl QualityWeights {
    /// Sum of all weights
    pub fn total(&self) -> f64 {
        self.reliability + self.throughput + self.latency + self.error_rate
    }

    /// Weights rescaled to sum to exactly one.
    ///
    /// Falls back to the defaults when the weights are unusable (non-finite,
    /// negative or all zero); [`ResilienceConfig::validate`] rejects such
    /// files up front, this only guards hand-built values.
    pub fn normalized(&self) -> Self {
        let parts = [self.reliability, self.throughput, self.latency, self.error_rate];
        let total = self.total();
        if parts.iter().any(|w| !w.is_finite() || *w < 0.0) || !(total > 0.0) {
            return Self::default();
        }
        Self {
            reliability: self.reliability / total,
            throughput: self.throughput / total,
            latency: self.latency / total,
            error_rate: self.error_rate / total,
        }
    }
}

/// Channel pool, quality monitor and recovery engine tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Consecutive failures (K) that open the circuit
    pub failure_streak_threshold: u32,
    /// Score below which a usable channel is congested
    pub congestion_threshold: f64,
    /// Score below which a channel is failed outright
    pub failure_threshold: f64,
    /// EWMA smoothing factor for reliability, throughput and latency
    pub ewma_alpha: f64,
    /// Number of recent outcomes in the error-rate window
    pub error_window: usize,
    /// Latency treated as fully degraded when normalizing
    pub latency_ceiling_ms: f64,
    /// Throughput (bytes/s) treated as fully healthy when normalizing
    pub throughput_reference_bps: f64,
    /// Clean exchanges required to verify a recovering channel
    pub verify_clean_exchanges: u32,
    /// Bounded duration of the recovering state
    pub recovery_timeout_ms: u64,
    /// Recovery attempts before a channel is evicted
    pub max_recovery_attempts: u32,
    /// Idle time after which a routable channel gets a health probe
    pub probe_interval_ms: u64,
    /// First reconnect backoff
    pub backoff_base_ms: u64,
    /// Backoff ceiling
    pub backoff_max_ms: u64,
    /// Jitter as a fraction of the backoff (0.25 = ±25%)
    pub jitter_fraction: f64,
    /// Idle or failed channels older than this are evicted
    pub retention_horizon_ms: u64,
    /// Outbound messages held per channel while its circuit is open
    pub max_queued_per_channel: usize,
    /// Period of the recovery/retention ticker
    pub tick_interval_ms: u64,
    /// Operation timeout under the standard profile
    pub standard_timeout_ms: u64,
    /// Transient retries under the standard profile
    pub standard_retry_budget: u32,
    /// Operation timeout under the conservative profile
    pub conservative_timeout_ms: u64,
    /// Transient retries under the conservative profile
    pub conservative_retry_budget: u32,
    /// Capacity of the pool manager mailbox
    pub mailbox_capacity: usize,
    /// Timeout for a single call into the pool manager
    pub call_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            failure_streak_threshold: 3,
            congestion_threshold: 0.3,
            failure_threshold: 0.1,
            ewma_alpha: 0.3,
            error_window: 20,
            latency_ceiling_ms: 2_000.0,
            throughput_reference_bps: 16_384.0,
            verify_clean_exchanges: 3,
            recovery_timeout_ms: 30_000,
            max_recovery_attempts: 5,
            probe_interval_ms: 15_000,
            backoff_base_ms: 500,
            backoff_max_ms: 30_000,
            jitter_fraction: 0.25,
            retention_horizon_ms: 600_000,
            max_queued_per_channel: 64,
            tick_interval_ms: 1_000,
            standard_timeout_ms: 5_000,
            standard_retry_budget: 2,
            conservative_timeout_ms: 15_000,
            conservative_retry_budget: 5,
            mailbox_capacity: 1_024,
            call_timeout_ms: 2_000,
        }
    }
}

impl PoolConfig {
    /// Timeout for a single call into the pool manager
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    /// Period of the recovery ticker
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }
}

/// Network state coordinator tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Reports older than this are treated as `disconnected`
    pub stale_report_timeout_ms: u64,
    /// Period at which dwell expiry and staleness are re-evaluated
    pub tick_interval_ms: u64,
    /// Capacity of the coordinator mailbox
    pub mailbox_capacity: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            stale_report_timeout_ms: 30_000,
            tick_interval_ms: 250,
            mailbox_capacity: 256,
        }
    }
}

/// Tuning for the eight edge-case handlers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EdgeConfig {
    /// Simultaneous-connection dedup
    pub dedup: DedupConfig,
    /// Rapid-disconnect quarantine
    pub quarantine: QuarantineConfig,
    /// Background/foreground transitions
    pub lifecycle: LifecycleConfig,
    /// Memory-pressure shedding
    pub memory: MemoryConfig,
    /// Channel contention/backpressure
    pub backpressure: BackpressureConfig,
    /// Network-instability adaptation
    pub instability: InstabilityConfig,
    /// Concurrent-operation admission control
    pub admission: AdmissionConfig,
    /// Resource-exhaustion throttling
    pub exhaustion: ExhaustionConfig,
    /// Worker plumbing shared by all handlers
    pub workers: WorkerConfig,
}

/// Simultaneous-connection dedup tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    /// In-flight attempt lock expiry
    pub lock_ttl_ms: u64,
    /// Upper bound of the randomized retry delay handed to waiters
    pub retry_jitter_ms: u64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            lock_ttl_ms: 10_000,
            retry_jitter_ms: 250,
        }
    }
}

/// Rapid-disconnect quarantine tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QuarantineConfig {
    /// Disconnects (N) within the window that trigger a quarantine
    pub disconnect_threshold: usize,
    /// Observation window (W)
    pub window_ms: u64,
    /// Highest escalation level (duration doubles per level)
    pub max_level: u32,
    /// Ceiling on any single quarantine
    pub max_duration_ms: u64,
    /// Minimum spacing of reconnect attempts while on probation
    pub probe_interval_ms: u64,
    /// Quiet period after which one escalation level is forgiven
    pub decay_after_ms: u64,
}

impl Default for QuarantineConfig {
    fn default() -> Self {
        Self {
            disconnect_threshold: 5,
            window_ms: 10_000,
            max_level: 5,
            max_duration_ms: 600_000,
            probe_interval_ms: 5_000,
            decay_after_ms: 300_000,
        }
    }
}

/// Background/foreground transition tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// Retry delay handed to operations attempted while suspended
    pub suspended_retry_ms: u64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            suspended_retry_ms: 1_000,
        }
    }
}

/// Memory-pressure shedding tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Idle channels scoring below this are shed at warning level
    pub low_score_threshold: f64,
    /// Idle channels untouched for this long are shed at warning level
    pub idle_grace_ms: u64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            low_score_threshold: 0.3,
            idle_grace_ms: 60_000,
        }
    }
}

/// Channel contention/backpressure tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackpressureConfig {
    /// Send-queue depth above which non-priority traffic is held back
    pub queue_depth_threshold: usize,
    /// How long a congested peer is routed around
    pub route_around_ms: u64,
    /// Retry delay handed to deferred non-priority sends
    pub defer_ms: u64,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            queue_depth_threshold: 32,
            route_around_ms: 5_000,
            defer_ms: 200,
        }
    }
}

/// Network-instability adaptation tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InstabilityConfig {
    /// Samples kept per peer
    pub window: usize,
    /// Samples required before a verdict
    pub min_samples: usize,
    /// Latency coefficient of variation that marks a peer unstable
    pub volatility_threshold: f64,
    /// Error fraction that marks a peer unstable
    pub error_rate_threshold: f64,
    /// Volatility below which a peer returns to the standard profile
    pub recovery_threshold: f64,
}

impl Default for InstabilityConfig {
    fn default() -> Self {
        Self {
            window: 16,
            min_samples: 5,
            volatility_threshold: 0.5,
            error_rate_threshold: 0.3,
            recovery_threshold: 0.25,
        }
    }
}

/// Admission control tuning. The limit itself is
/// [`ResilienceConfig::max_concurrent_operations`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    /// How long a queued request waits for a slot
    pub acquire_timeout_ms: u64,
    /// Floor the adaptive limit never drops below
    pub min_limit: usize,
    /// Saturation must persist this long before the limit is lowered
    pub pressure_window_ms: u64,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            acquire_timeout_ms: 5_000,
            min_limit: 2,
            pressure_window_ms: 10_000,
        }
    }
}

/// Resource-exhaustion throttling tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExhaustionConfig {
    /// Utilization (0..1) at which a resource counts as exhausted
    pub critical_threshold: f64,
    /// Utilization below which exhaustion clears
    pub recovery_threshold: f64,
    /// Sustained exhaustion before a subsystem reset is requested
    pub grace_period_ms: u64,
    /// Operation rate allowed while exhausted
    pub throttled_ops_per_sec: f64,
    /// Minimum spacing between two subsystem resets
    pub reset_cooldown_ms: u64,
}

impl Default for ExhaustionConfig {
    fn default() -> Self {
        Self {
            critical_threshold: 0.9,
            recovery_threshold: 0.8,
            grace_period_ms: 30_000,
            throttled_ops_per_sec: 5.0,
            reset_cooldown_ms: 60_000,
        }
    }
}

/// Handler worker plumbing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Capacity of each handler worker mailbox
    pub mailbox_capacity: usize,
    /// How long the supervisor waits for one handler's verdict
    pub decision_timeout_ms: u64,
    /// Period of the handler tick
    pub tick_interval_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            mailbox_capacity: 256,
            decision_timeout_ms: 500,
            tick_interval_ms: 1_000,
        }
    }
}

/// Node identity and logging.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Local node identifier
    pub node_id: String,
    /// Fallback log filter when `RUST_LOG` is unset
    pub log_level: String,
    /// Emit JSON logs instead of human-readable lines
    pub json_logs: bool,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: "node-001".to_string(),
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

impl ResilienceConfig {
    /// Load and validate a TOML configuration file.
    #[cfg(feature = "toml")]
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate a TOML document.
    #[cfg(feature = "toml")]
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| CoreError::ConfigParse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a JSON configuration file (the format the node launcher writes).
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self =
            serde_json::from_str(&content).map_err(|e| CoreError::ConfigParse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would make the core misbehave.
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_operations == 0 {
            return Err(CoreError::invalid("max_concurrent_operations", "must be at least 1"));
        }
        check_fraction("emergency_mode_threshold", self.emergency_mode_threshold)?;
        if self.emergency_mode_threshold == 0.0 {
            return Err(CoreError::invalid(
                "emergency_mode_threshold",
                "must be greater than zero",
            ));
        }
        if self.quarantine_base_duration_ms == 0 {
            return Err(CoreError::invalid("quarantine_base_duration_ms", "must be positive"));
        }

        let w = &self.quality_score_weights;
        for (field, value) in [
            ("quality_score_weights.reliability", w.reliability),
            ("quality_score_weights.throughput", w.throughput),
            ("quality_score_weights.latency", w.latency),
            ("quality_score_weights.error_rate", w.error_rate),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(CoreError::invalid(field, "must be a finite non-negative number"));
            }
        }
        if w.total() <= 0.0 {
            return Err(CoreError::invalid("quality_score_weights", "must not all be zero"));
        }

        let p = &self.pool;
        if p.failure_streak_threshold == 0 {
            return Err(CoreError::invalid("pool.failure_streak_threshold", "must be at least 1"));
        }
        check_fraction("pool.congestion_threshold", p.congestion_threshold)?;
        check_fraction("pool.failure_threshold", p.failure_threshold)?;
        if p.failure_threshold > p.congestion_threshold {
            return Err(CoreError::invalid(
                "pool.failure_threshold",
                "must not exceed pool.congestion_threshold",
            ));
        }
        if !(p.ewma_alpha > 0.0 && p.ewma_alpha <= 1.0) {
            return Err(CoreError::invalid("pool.ewma_alpha", "must be in (0, 1]"));
        }
        if p.error_window == 0 {
            return Err(CoreError::invalid("pool.error_window", "must be at least 1"));
        }
        if !(p.latency_ceiling_ms.is_finite() && p.latency_ceiling_ms > 0.0) {
            return Err(CoreError::invalid("pool.latency_ceiling_ms", "must be positive"));
        }
        if !(p.throughput_reference_bps.is_finite() && p.throughput_reference_bps > 0.0) {
            return Err(CoreError::invalid("pool.throughput_reference_bps", "must be positive"));
        }
        if p.verify_clean_exchanges == 0 {
            return Err(CoreError::invalid("pool.verify_clean_exchanges", "must be at least 1"));
        }
        if p.max_recovery_attempts == 0 {
            return Err(CoreError::invalid("pool.max_recovery_attempts", "must be at least 1"));
        }
        if p.backoff_base_ms == 0 || p.backoff_base_ms > p.backoff_max_ms {
            return Err(CoreError::invalid(
                "pool.backoff_base_ms",
                "must be positive and not exceed pool.backoff_max_ms",
            ));
        }
        check_fraction("pool.jitter_fraction", p.jitter_fraction)?;
        if p.mailbox_capacity == 0 {
            return Err(CoreError::invalid("pool.mailbox_capacity", "must be at least 1"));
        }

        if self.coordinator.mailbox_capacity == 0 {
            return Err(CoreError::invalid("coordinator.mailbox_capacity", "must be at least 1"));
        }

        let e = &self.edge;
        if e.quarantine.disconnect_threshold == 0 {
            return Err(CoreError::invalid(
                "edge.quarantine.disconnect_threshold",
                "must be at least 1",
            ));
        }
        check_fraction("edge.memory.low_score_threshold", e.memory.low_score_threshold)?;
        if e.instability.window < e.instability.min_samples || e.instability.min_samples < 2 {
            return Err(CoreError::invalid(
                "edge.instability.window",
                "window must hold at least min_samples (>= 2) samples",
            ));
        }
        if e.instability.recovery_threshold > e.instability.volatility_threshold {
            return Err(CoreError::invalid(
                "edge.instability.recovery_threshold",
                "must not exceed volatility_threshold",
            ));
        }
        if e.admission.min_limit == 0 {
            return Err(CoreError::invalid("edge.admission.min_limit", "must be at least 1"));
        }
        check_fraction("edge.exhaustion.critical_threshold", e.exhaustion.critical_threshold)?;
        check_fraction("edge.exhaustion.recovery_threshold", e.exhaustion.recovery_threshold)?;
        if e.exhaustion.recovery_threshold > e.exhaustion.critical_threshold {
            return Err(CoreError::invalid(
                "edge.exhaustion.recovery_threshold",
                "must not exceed critical_threshold",
            ));
        }
        if !(e.exhaustion.throttled_ops_per_sec.is_finite() && e.exhaustion.throttled_ops_per_sec > 0.0) {
            return Err(CoreError::invalid(
                "edge.exhaustion.throttled_ops_per_sec",
                "must be positive",
            ));
        }
        if e.workers.mailbox_capacity == 0 {
            return Err(CoreError::invalid("edge.workers.mailbox_capacity", "must be at least 1"));
        }
        Ok(())
    }

    /// Stabilization window as a [`Duration`]
    pub fn stabilization_window(&self) -> Duration {
        Duration::from_millis(self.stabilization_window_ms)
    }

    /// Base quarantine duration as a [`Duration`]
    pub fn quarantine_base_duration(&self) -> Duration {
        Duration::from_millis(self.quarantine_base_duration_ms)
    }
}

fn check_fraction(field: &str, value: f64) -> Result<()> {
    if value.is_finite() && (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(CoreError::invalid(field, "must be within [0, 1]"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = ResilienceConfig::default();
        config.validate().unwrap();
        assert_eq!(config.pool.failure_streak_threshold, 3);
        assert_eq!(config.stabilization_window(), Duration::from_secs(5));
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = ResilienceConfig::from_toml_str(
            r#"
            max_concurrent_operations = 4
            emergency_mode_threshold = 0.5

            [quality_score_weights]
            reliability = 2.0
            throughput = 1.0
            latency = 1.0
            error_rate = 0.0

            [pool]
            failure_streak_threshold = 5
            "#,
        )
        .unwrap();

        assert_eq!(config.max_concurrent_operations, 4);
        assert_eq!(config.pool.failure_streak_threshold, 5);
        assert_eq!(config.pool.congestion_threshold, 0.3);
        assert!(config.auto_recovery_enabled);

        let weights = config.quality_score_weights.normalized();
        assert!((weights.reliability - 0.5).abs() < 1e-9);
        assert!((weights.total() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_reject_zero_concurrency() {
        let mut config = ResilienceConfig::default();
        config.max_concurrent_operations = 0;
        assert!(matches!(
            config.validate(),
            Err(CoreError::InvalidConfig { ref field, .. }) if field == "max_concurrent_operations"
        ));
    }

    #[test]
    fn test_reject_inverted_thresholds() {
        let mut config = ResilienceConfig::default();
        config.pool.failure_threshold = 0.5;
        config.pool.congestion_threshold = 0.3;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_reject_negative_weight() {
        let result = ResilienceConfig::from_toml_str(
            r#"
            [quality_score_weights]
            reliability = -1.0
            "#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_malformed_toml_is_parse_error() {
        let result = ResilienceConfig::from_toml_str("max_concurrent_operations = \"many\"");
        assert!(matches!(result, Err(CoreError::ConfigParse(_))));
    }

    #[test]
    fn test_normalized_falls_back_on_zero_weights() {
        let weights = QualityWeights {
            reliability: 0.0,
            throughput: 0.0,
            latency: 0.0,
            error_rate: 0.0,
        };
        assert_eq!(weights.normalized(), QualityWeights::default());
    }

    #[test]
    fn test_from_file_roundtrip() {
        let path = std::env::temp_dir().join(format!(
            "lifeline-config-{}.toml",
            std::process::id()
        ));
        std::fs::write(&path, "auto_recovery_enabled = false\n").unwrap();
        let config = ResilienceConfig::from_file(&path).unwrap();
        assert!(!config.auto_recovery_enabled);
        let _ = std::fs::remove_file(&path);
    }
}
