//! Registration error types.

use crate::store::StoreError;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RegistrationError {
    #[error("Module '{name}' is already registered")]
    DuplicateName { name: String },

    #[error("Module '{module}' depends on '{dependency}': {reason}")]
    DependencyUnmet {
        module: String,
        dependency: String,
        reason: String,
    },

    #[error("Invalid module descriptor for '{name}': {reason}")]
    InvalidDescriptor { name: String, reason: String },

    #[error("Module '{name}' is not registered")]
    NotFound { name: String },

    #[error("Module '{name}' is still required by {dependents:?}")]
    HasDependents {
        name: String,
        dependents: Vec<String>,
    },

    #[error("Registry persistence failed: {0}")]
    Store(#[from] StoreError),
}

impl RegistrationError {
    pub fn dependency_unmet(
        module: impl Into<String>,
        dependency: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::DependencyUnmet {
            module: module.into(),
            dependency: dependency.into(),
            reason: reason.into(),
        }
    }

    pub fn invalid_descriptor(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidDescriptor {
            name: name.into(),
            reason: reason.into(),
        }
    }

    pub fn not_found(name: impl Into<String>) -> Self {
        Self::NotFound { name: name.into() }
    }
}

pub type RegistrationResult<T> = Result<T, RegistrationError>;
