//! # System Constants
//!
//! Collection names, system message types and reserved sender identities shared
//! across the orchestration subsystems.

/// DocumentStore collections
pub mod collections {
    pub const MODULES: &str = "modules";
    pub const MESSAGES: &str = "messages";
    pub const DEAD_LETTERS: &str = "dead_letters";
    pub const MODEL_SCHEMAS: &str = "model_schemas";
    pub const SHARED_RECORDS: &str = "shared_records";
    pub const WORKFLOW_TEMPLATES: &str = "workflow_templates";
    pub const WORKFLOW_INSTANCES: &str = "workflow_instances";
    pub const MIGRATIONS: &str = "migrations";
    pub const MIGRATION_RUNS: &str = "migration_runs";
}

/// Message types emitted by the orchestration layer itself
pub mod message_types {
    pub const RECORD_CREATED: &str = "record_created";
    pub const RECORD_UPDATED: &str = "record_updated";
    pub const RECORD_ARCHIVED: &str = "record_archived";
}

/// Reserved sender names for orchestration components
pub mod system_senders {
    pub const WORKFLOW_ENGINE: &str = "workflow_engine";
    pub const SHARED_MODELS: &str = "shared_models";
}

/// Workflow outcome and actor names with special meaning
pub mod workflow {
    /// Outcome recorded when the SLA sweep escalates an instance
    pub const SLA_BREACH_OUTCOME: &str = "sla_breach";
    /// Outcome recorded on the step that was open when an instance was cancelled
    pub const CANCELLED_OUTCOME: &str = "cancelled";
    /// Outcome recorded when a step action fails permanently
    pub const ERROR_OUTCOME: &str = "error";
    /// Actor recorded for automatic transitions
    pub const SYSTEM_ACTOR: &str = "system:sla_monitor";
}
