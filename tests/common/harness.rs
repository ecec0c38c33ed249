//! In-memory orchestration harness

use modhub_core::config::{BackoffConfig, ConfigManager, ModHubConfig};
use modhub_core::{InMemoryDocumentStore, ManualClock, OrchestrationContext};
use std::sync::Arc;
use std::time::Duration;

/// Configuration tuned for fast, deterministic tests
pub fn fast_config() -> ModHubConfig {
    let mut config = ModHubConfig::default();
    config.message_bus.worker_count = 2;
    config.message_bus.max_delivery_attempts = 3;
    config.message_bus.backoff = BackoffConfig {
        initial_delay_ms: 1,
        max_delay_ms: 5,
        multiplier: 2.0,
    };
    config.message_bus.default_sync_timeout_ms = 2_000;
    config.workflow.step_timeout_ms = 2_000;
    config.workflow.sla_sweep_enabled = false;
    config.shutdown.drain_timeout_ms = 2_000;
    config
}

/// An orchestration context over an in-memory store and a manual clock
pub struct TestHarness {
    pub ctx: OrchestrationContext,
    pub clock: Arc<ManualClock>,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_config(fast_config())
    }

    pub fn with_config(config: ModHubConfig) -> Self {
        modhub_core::logging::init_tracing();
        let manager = ConfigManager::from_config(config, "test").expect("test configuration");
        let clock = Arc::new(ManualClock::default());
        let ctx = OrchestrationContext::new(
            manager,
            Arc::new(InMemoryDocumentStore::new()),
            clock.clone(),
        );
        Self { ctx, clock }
    }

    /// Harness with bus workers already running
    pub fn started() -> Self {
        let harness = Self::new();
        harness.ctx.start();
        harness
    }

    /// A fresh context over this harness's store and clock, as after a process restart
    pub fn restarted(&self) -> Self {
        let manager =
            ConfigManager::from_config(fast_config(), "test").expect("test configuration");
        let ctx = OrchestrationContext::new(
            manager,
            Arc::clone(self.ctx.store()),
            self.clock.clone(),
        );
        Self {
            ctx,
            clock: self.clock.clone(),
        }
    }

    pub fn advance(&self, by: chrono::Duration) {
        self.clock.advance(by);
    }
}

/// Poll `condition` until it holds or `timeout` passes
pub async fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
