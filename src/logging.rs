//! # Structured Logging Module
//!
//! Environment-aware console logging using the tracing ecosystem.
//!
//! This module provides:
//! - Console logging initialised exactly once per process
//! - Environment-based log level (`RUST_LOG` still wins when set)
//! - Optional JSON output (`MODHUB_LOG_FORMAT=json`) for log shippers
//! - Domain-specific structured logging macros
//!
//! Message and workflow logs always carry `correlation_id` when one exists so a
//! single request can be followed across modules.

use std::io::IsTerminal;
use std::sync::OnceLock;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

static TRACING_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Initialize tracing with console output.
///
/// Safe to call more than once; later calls are no-ops. If another global
/// subscriber is already installed it is left in place.
pub fn init_tracing() {
    TRACING_INITIALIZED.get_or_init(|| {
        let environment = get_environment();
        let log_level = get_log_level(&environment);
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log_level));
        let json = std::env::var("MODHUB_LOG_FORMAT")
            .map(|v| v.eq_ignore_ascii_case("json"))
            .unwrap_or(false);

        let console_layer = if json {
            fmt::layer()
                .json()
                .with_target(true)
                .with_thread_ids(true)
                .with_filter(filter)
                .boxed()
        } else {
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_level(true)
                .with_ansi(IsTerminal::is_terminal(&std::io::stdout()))
                .with_filter(filter)
                .boxed()
        };

        if tracing_subscriber::registry()
            .with(console_layer)
            .try_init()
            .is_err()
        {
            tracing::debug!(
                "Global tracing subscriber already initialized - continuing with existing subscriber"
            );
        } else {
            tracing::info!(
                environment = %environment,
                log_level = %log_level,
                json_output = json,
                "Console logging initialized"
            );
        }
    });
}

/// Get current environment from environment variables
pub fn get_environment() -> String {
    std::env::var("MODHUB_ENV")
        .or_else(|_| std::env::var("APP_ENV"))
        .unwrap_or_else(|_| "development".to_string())
}

/// Get log level based on environment
pub fn get_log_level(environment: &str) -> String {
    match environment {
        "production" => "info".to_string(),
        _ => "debug".to_string(),
    }
}

/// Log configuration events
#[macro_export]
macro_rules! log_config {
    ($level:ident, $operation:expr $(,)?) => {
        tracing::$level!(
            operation = %$operation,
            timestamp = %chrono::Utc::now().to_rfc3339(),
            "{}", $operation
        );
    };
    ($level:ident, $operation:expr, $($key:ident: $value:expr),+ $(,)?) => {
        tracing::$level!(
            operation = %$operation,
            $($key = ?$value,)*
            timestamp = %chrono::Utc::now().to_rfc3339(),
            "{}", $operation
        );
    };
}

/// Log module registry operations
#[macro_export]
macro_rules! log_registry {
    ($level:ident, $operation:expr, module: $module:expr $(, $key:ident: $value:expr)* $(,)?) => {
        tracing::$level!(
            operation = %$operation,
            module = %$module,
            $($key = ?$value,)*
            "📚 REGISTRY: {}", $operation
        );
    };
}

/// Log shared model schema and record operations
#[macro_export]
macro_rules! log_shared_model {
    ($level:ident, $operation:expr, model: $model:expr $(, $key:ident: $value:expr)* $(,)?) => {
        tracing::$level!(
            model = %$model,
            operation = %$operation,
            $($key = ?$value,)*
            "💾 SHARED MODELS: {}", $operation
        );
    };
}

/// Log message bus operations with message identity first
#[macro_export]
macro_rules! log_bus {
    ($level:ident, $operation:expr, message_id: $id:expr, correlation_id: $cid:expr $(, $key:ident: $value:expr)* $(,)?) => {
        tracing::$level!(
            correlation_id = ?$cid,
            message_id = %$id,
            operation = %$operation,
            $($key = ?$value,)*
            "📨 BUS: {}", $operation
        );
    };
    ($level:ident, $operation:expr $(, $key:ident: $value:expr)* $(,)?) => {
        tracing::$level!(
            operation = %$operation,
            $($key = ?$value,)*
            "📨 BUS: {}", $operation
        );
    };
}

/// Log workflow engine operations
#[macro_export]
macro_rules! log_workflow {
    ($level:ident, $operation:expr, instance_id: $iid:expr $(, $key:ident: $value:expr)* $(,)?) => {
        tracing::$level!(
            instance_id = %$iid,
            operation = %$operation,
            $($key = ?$value,)*
            "🔀 WORKFLOW: {}", $operation
        );
    };
    ($level:ident, $operation:expr $(, $key:ident: $value:expr)* $(,)?) => {
        tracing::$level!(
            operation = %$operation,
            $($key = ?$value,)*
            "🔀 WORKFLOW: {}", $operation
        );
    };
}

/// Log migration operations
#[macro_export]
macro_rules! log_migration {
    ($level:ident, $operation:expr, module: $module:expr $(, $key:ident: $value:expr)* $(,)?) => {
        tracing::$level!(
            module = %$module,
            operation = %$operation,
            $($key = ?$value,)*
            "🧱 MIGRATION: {}", $operation
        );
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_mapping() {
        assert_eq!(get_log_level("test"), "debug");
        assert_eq!(get_log_level("development"), "debug");
        assert_eq!(get_log_level("production"), "info");
        assert_eq!(get_log_level("unknown"), "debug");
    }

    #[test]
    fn test_init_is_idempotent() {
        init_tracing();
        init_tracing();
        crate::log_config!(debug, "idempotent init", attempts: 2);
    }

    #[test]
    fn test_domain_macros_expand() {
        init_tracing();
        let id = uuid::Uuid::new_v4();
        crate::log_shared_model!(info, "Record created", model: "Invoice", id: id, actor: "clerk");
        crate::log_shared_model!(debug, "Model defined", model: String::from("Permit"));
        crate::log_registry!(debug, "Module refreshed from store", module: "Billing");
        crate::log_migration!(debug, "Unit applied", module: "Billing", unit: "a");
    }
}
