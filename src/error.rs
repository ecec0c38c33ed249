//! # Error Handling
//!
//! Top-level error wrapping every subsystem's error enum. Subsystem APIs return
//! their own error types; `ModHubError` is what the orchestration context and
//! binaries surface.

use crate::config::ConfigurationError;
use crate::messaging::DeliveryError;
use crate::migration::MigrationError;
use crate::registry::RegistrationError;
use crate::shared_model::SharedModelError;
use crate::store::StoreError;
use crate::workflow::WorkflowError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ModHubError {
    #[error("Registration error: {0}")]
    Registration(#[from] RegistrationError),

    #[error("Delivery error: {0}")]
    Delivery(#[from] DeliveryError),

    #[error("Shared model error: {0}")]
    SharedModel(#[from] SharedModelError),

    #[error("Workflow error: {0}")]
    Workflow(#[from] WorkflowError),

    #[error("Migration error: {0}")]
    Migration(#[from] MigrationError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Orchestration error: {0}")]
    Orchestration(String),
}

impl ModHubError {
    pub fn orchestration(message: impl Into<String>) -> Self {
        Self::Orchestration(message.into())
    }
}

pub type Result<T> = std::result::Result<T, ModHubError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subsystem_errors_convert() {
        let err: ModHubError = RegistrationError::not_found("Billing").into();
        assert!(err.to_string().starts_with("Registration error:"));

        let err: ModHubError = DeliveryError::ShuttingDown.into();
        assert_eq!(err.to_string(), "Delivery error: Message bus is shutting down");
    }
}
