//! # Messaging Error Types
//!
//! Delivery errors returned to senders and handler errors returned by modules.
//!
//! Permanent errors (`TargetNotRegistered`, `DependencyNotSatisfied`,
//! `UnknownMessageType`, `Rejected`) are never retried. `Transient` failures are
//! retried with backoff and dead-lettered once attempts are exhausted.

use super::message::MessageId;
use crate::store::StoreError;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DeliveryError {
    #[error("Target module '{target}' is not registered")]
    TargetNotRegistered { target: String },

    #[error("Module '{target}' does not accept messages from '{sender}'")]
    DependencyNotSatisfied { sender: String, target: String },

    #[error("Transient delivery failure to '{target}': {message}")]
    Transient { target: String, message: String },

    #[error("No reply for message {message_id} within {timeout_ms}ms (message remains queued)")]
    DeliveryTimeout {
        message_id: MessageId,
        timeout_ms: u64,
    },

    #[error("Module '{target}' has no handler for message type '{message_type}'")]
    UnknownMessageType {
        target: String,
        message_type: String,
    },

    #[error("Module '{target}' rejected the message: {reason}")]
    Rejected { target: String, reason: String },

    #[error("Message bus is shutting down")]
    ShuttingDown,

    #[error("Message {message_id} not found")]
    MessageNotFound { message_id: MessageId },

    #[error("Message persistence failed: {0}")]
    Store(#[from] StoreError),
}

impl DeliveryError {
    pub fn transient(target: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transient {
            target: target.into(),
            message: message.into(),
        }
    }

    pub fn rejected(target: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Rejected {
            target: target.into(),
            reason: reason.into(),
        }
    }

    pub fn target_not_registered(target: impl Into<String>) -> Self {
        Self::TargetNotRegistered {
            target: target.into(),
        }
    }

    /// Whether resubmitting the same message could succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Transient { .. } | Self::DeliveryTimeout { .. } | Self::Store(_)
        )
    }

    /// Whether the target will refuse this message however often it is sent
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            Self::TargetNotRegistered { .. }
                | Self::DependencyNotSatisfied { .. }
                | Self::UnknownMessageType { .. }
                | Self::Rejected { .. }
        )
    }
}

/// Error a module handler returns for one message
#[derive(Error, Debug, Clone, PartialEq)]
pub enum HandlerError {
    /// Retry later; counts against `max_delivery_attempts`
    #[error("transient: {0}")]
    Transient(String),

    /// The module will never accept this message
    #[error("permanent: {0}")]
    Permanent(String),

    #[error("unknown message type: {0}")]
    UnknownMessageType(String),
}

impl HandlerError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent(message.into())
    }
}

pub type DeliveryResult<T> = Result<T, DeliveryError>;
