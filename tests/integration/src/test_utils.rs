//! Test utilities for end-to-end resilience tests

use lifeline_core::ResilienceConfig;
use lifeline_mesh::{LoopbackTransport, ManualClock, SharedClock};
use lifeline_runtime::ResilienceSystem;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// How long [`wait_until`] polls before giving up
const WAIT_LIMIT: Duration = Duration::from_secs(5);

/// Initialize tracing only if not already initialized
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt::try_init();
}

/// Defaults with fast backoff and no background remediation
pub fn test_config() -> ResilienceConfig {
    let mut config = ResilienceConfig::default();
    config.auto_recovery_enabled = false;
    config.pool.backoff_base_ms = 5;
    config.pool.backoff_max_ms = 20;
    config
}

/// A running system with its scripted transport and manual clock
pub struct Harness {
    pub system: ResilienceSystem,
    pub transport: LoopbackTransport,
    pub clock: Arc<ManualClock>,
}

impl Harness {
    /// Start a system at t = 1000ms
    pub fn start(config: ResilienceConfig) -> Self {
        init_tracing();
        let transport = LoopbackTransport::new();
        let clock = ManualClock::new(1_000);
        let shared: SharedClock = clock.clone();
        let system = ResilienceSystem::start(config, Arc::new(transport.clone()), shared)
            .expect("Failed to start resilience system");
        Self {
            system,
            transport,
            clock,
        }
    }

    /// Stop every task
    pub async fn shutdown(self) {
        self.system.shutdown().await;
    }
}

/// Poll `check` until it holds; panics after a few seconds of real time
pub async fn wait_until<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + WAIT_LIMIT;
    while !check().await {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
