//! Workflow error types.

use super::instance::InstanceStatus;
use crate::messaging::DeliveryError;
use crate::store::StoreError;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum WorkflowError {
    #[error("Instance {instance_id} is at step '{current_step}', cannot execute '{requested_step}'")]
    InvalidTransition {
        instance_id: Uuid,
        current_step: String,
        requested_step: String,
    },

    #[error("Instance {instance_id} is {status} and accepts no further steps")]
    InstanceTerminated {
        instance_id: Uuid,
        status: InstanceStatus,
    },

    #[error("Step '{step_id}' of instance {instance_id} timed out after {timeout_ms}ms")]
    StepTimeout {
        instance_id: Uuid,
        step_id: String,
        timeout_ms: u64,
    },

    #[error("Invalid workflow template '{template_id}': {reason}")]
    InvalidTemplate { template_id: String, reason: String },

    #[error("Workflow template '{template_id}' not found")]
    TemplateNotFound { template_id: String },

    #[error("Workflow instance {instance_id} not found")]
    InstanceNotFound { instance_id: Uuid },

    #[error("Step '{step_id}' of instance {instance_id} has no transition for outcome {outcome:?}")]
    UnknownOutcome {
        instance_id: Uuid,
        step_id: String,
        outcome: Option<String>,
    },

    #[error("Action for step '{step_id}' of instance {instance_id} failed: {error}")]
    ActionFailed {
        instance_id: Uuid,
        step_id: String,
        error: DeliveryError,
    },

    #[error("Instance {instance_id} changed concurrently (expected revision {expected_revision})")]
    RevisionConflict {
        instance_id: Uuid,
        expected_revision: i64,
    },

    #[error("Workflow persistence failed: {0}")]
    Store(#[from] StoreError),
}

impl WorkflowError {
    pub fn invalid_template(template_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidTemplate {
            template_id: template_id.into(),
            reason: reason.into(),
        }
    }

    pub fn template_not_found(template_id: impl Into<String>) -> Self {
        Self::TemplateNotFound {
            template_id: template_id.into(),
        }
    }
}

pub type WorkflowResult<T> = Result<T, WorkflowError>;
