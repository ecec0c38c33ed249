//! # ModHub Configuration System
//!
//! YAML-based configuration with environment overrides.
//!
//! ## Architecture
//!
//! - **Base file**: `config/modhub.yaml`
//! - **Environment overrides**: `config/modhub.<environment>.yaml`
//! - **Process overrides**: `MODHUB_<SECTION>__<KEY>` environment variables
//! - **Explicit Validation**: invalid values are rejected, never silently clamped
//!
//! Retry counts, backoff curves, SLA sweep interval, step timeout and message TTL
//! are all configuration, not invariants.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use modhub_core::config::ConfigManager;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = ConfigManager::load()?;
//! let workers = manager.config().message_bus.worker_count;
//! let sweep = manager.config().workflow.sla_sweep_interval();
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod loader;

use serde::{Deserialize, Serialize};
use std::time::Duration;

pub use error::{ConfigResult, ConfigurationError};
pub use loader::ConfigManager;

/// Root configuration structure mirroring `config/modhub.yaml`
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ModHubConfig {
    /// Message bus delivery, retry and garbage collection
    pub message_bus: MessageBusConfig,

    /// Workflow engine timeouts and SLA sweep
    pub workflow: WorkflowConfig,

    /// Module registry policy
    pub registry: RegistryConfig,

    /// Persistence backend selection
    pub persistence: PersistenceConfig,

    /// Drain behaviour on shutdown
    pub shutdown: ShutdownConfig,
}

/// Message bus configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MessageBusConfig {
    /// Number of delivery workers pulling from the ready queue
    pub worker_count: usize,
    /// Total delivery attempts (first try included) before dead-lettering
    pub max_delivery_attempts: u32,
    pub backoff: BackoffConfig,
    /// Default wait for synchronous sends
    pub default_sync_timeout_ms: u64,
    /// Terminal messages older than this are garbage-collected
    pub message_ttl_seconds: u64,
    pub gc_interval_seconds: u64,
}

impl Default for MessageBusConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            max_delivery_attempts: 5,
            backoff: BackoffConfig::default(),
            default_sync_timeout_ms: 5_000,
            message_ttl_seconds: 3_600,
            gc_interval_seconds: 60,
        }
    }
}

impl MessageBusConfig {
    pub fn default_sync_timeout(&self) -> Duration {
        Duration::from_millis(self.default_sync_timeout_ms)
    }

    pub fn message_ttl(&self) -> Duration {
        Duration::from_secs(self.message_ttl_seconds)
    }

    pub fn gc_interval(&self) -> Duration {
        Duration::from_secs(self.gc_interval_seconds)
    }
}

/// Exponential backoff between delivery attempts
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 100,
            max_delay_ms: 10_000,
            multiplier: 2.0,
        }
    }
}

impl BackoffConfig {
    /// Delay before retry number `retry` (1-based), capped at `max_delay_ms`
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(32) as i32;
        let raw = self.initial_delay_ms as f64 * self.multiplier.powi(exponent);
        let capped = raw.min(self.max_delay_ms as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }
}

/// Workflow engine configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WorkflowConfig {
    /// Upper bound on a step action's module invocation
    pub step_timeout_ms: u64,
    pub sla_sweep_interval_seconds: u64,
    pub sla_sweep_enabled: bool,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            step_timeout_ms: 30_000,
            sla_sweep_interval_seconds: 60,
            sla_sweep_enabled: true,
        }
    }
}

impl WorkflowConfig {
    pub fn step_timeout(&self) -> Duration {
        Duration::from_millis(self.step_timeout_ms)
    }

    pub fn sla_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sla_sweep_interval_seconds)
    }
}

/// Module registry configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// When a target declares no dependencies, accept messages from any module
    pub permissive_empty_dependencies: bool,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            permissive_empty_dependencies: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PersistenceBackend {
    #[default]
    Memory,
    Postgres,
}

/// Persistence configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PersistenceConfig {
    pub backend: PersistenceBackend,
    /// Postgres URL; `${DATABASE_URL}` defers to the environment variable
    pub database_url: Option<String>,
    pub max_connections: u32,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            backend: PersistenceBackend::Memory,
            database_url: None,
            max_connections: 10,
        }
    }
}

impl PersistenceConfig {
    /// Resolve the database URL, expanding `${DATABASE_URL}`
    pub fn resolved_database_url(&self) -> Option<String> {
        match self.database_url.as_deref() {
            Some("${DATABASE_URL}") | None => std::env::var("DATABASE_URL").ok(),
            Some(url) if url.is_empty() => None,
            Some(url) => Some(url.to_string()),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ShutdownConfig {
    pub drain_timeout_ms: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            drain_timeout_ms: 5_000,
        }
    }
}

impl ShutdownConfig {
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

impl ModHubConfig {
    /// Validate the configuration for correctness
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        let bus = &self.message_bus;
        if bus.worker_count == 0 {
            return Err(ConfigurationError::invalid_value(
                "message_bus.worker_count",
                "0",
                "at least one delivery worker is required",
            ));
        }

        if bus.max_delivery_attempts == 0 {
            return Err(ConfigurationError::invalid_value(
                "message_bus.max_delivery_attempts",
                "0",
                "must allow at least one delivery attempt",
            ));
        }

        if bus.backoff.multiplier < 1.0 {
            return Err(ConfigurationError::invalid_value(
                "message_bus.backoff.multiplier",
                bus.backoff.multiplier.to_string(),
                "backoff multiplier must be >= 1.0",
            ));
        }

        if bus.backoff.initial_delay_ms > bus.backoff.max_delay_ms {
            return Err(ConfigurationError::invalid_value(
                "message_bus.backoff.initial_delay_ms",
                bus.backoff.initial_delay_ms.to_string(),
                "initial delay exceeds max_delay_ms",
            ));
        }

        if bus.default_sync_timeout_ms == 0 {
            return Err(ConfigurationError::invalid_value(
                "message_bus.default_sync_timeout_ms",
                "0",
                "synchronous sends need a positive timeout",
            ));
        }

        if bus.gc_interval_seconds == 0 {
            return Err(ConfigurationError::invalid_value(
                "message_bus.gc_interval_seconds",
                "0",
                "garbage collection interval must be positive",
            ));
        }

        if self.workflow.step_timeout_ms == 0 {
            return Err(ConfigurationError::invalid_value(
                "workflow.step_timeout_ms",
                "0",
                "step actions need a positive timeout",
            ));
        }

        if self.workflow.sla_sweep_enabled && self.workflow.sla_sweep_interval_seconds == 0 {
            return Err(ConfigurationError::invalid_value(
                "workflow.sla_sweep_interval_seconds",
                "0",
                "sweep interval must be positive when the sweep is enabled",
            ));
        }

        if self.persistence.backend == PersistenceBackend::Postgres {
            if self.persistence.resolved_database_url().is_none() {
                return Err(ConfigurationError::missing_required_field(
                    "persistence.database_url",
                    "postgres persistence backend",
                ));
            }
            if self.persistence.max_connections == 0 {
                return Err(ConfigurationError::invalid_value(
                    "persistence.max_connections",
                    "0",
                    "pool size must be greater than 0",
                ));
            }
        }

        Ok(())
    }
}
