//! # Workflow Engine
//!
//! Cross-module workflows: validated step-graph templates, per-instance state
//! with history, bounded module actions, and SLA escalation.

pub mod engine;
pub mod errors;
pub mod instance;
pub mod sla;
pub mod template;

pub use engine::{StepInput, WorkflowEngine};
pub use errors::{WorkflowError, WorkflowResult};
pub use instance::{HistoryEntry, InstanceFilter, InstanceStatus, WorkflowInstance};
pub use sla::{SlaMonitor, SlaSweepReport};
pub use template::{Step, StepAction, StepType, Transitions, WorkflowTemplate};
