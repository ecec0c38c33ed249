//! # Operator Diagnostics
//!
//! Read-only views that separate the things an operator must act on from
//! normal completions: dead-lettered messages, failed or incomplete migration
//! runs, modules flagged for intervention and stuck workflow instances.

use crate::clock::SharedClock;
use crate::error::Result;
use crate::messaging::{BusStats, DeadLetter, MessageBus};
use crate::migration::{MigrationManager, MigrationRun, MigrationRunStatus};
use crate::registry::ModuleRegistry;
use crate::workflow::{InstanceFilter, InstanceStatus, WorkflowEngine, WorkflowInstance};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Dead letter as shown to operators
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeadLetterSummary {
    pub message_id: String,
    pub sender: String,
    pub target: String,
    pub message_type: String,
    pub attempts: u32,
    pub reason: String,
    pub dead_lettered_at: DateTime<Utc>,
    pub requeue_count: u32,
}

impl From<&DeadLetter> for DeadLetterSummary {
    fn from(entry: &DeadLetter) -> Self {
        Self {
            message_id: entry.message.id.to_string(),
            sender: entry.message.sender.to_string(),
            target: entry.message.target.clone(),
            message_type: entry.message.message_type.clone(),
            attempts: entry.message.attempts,
            reason: entry.reason.clone(),
            dead_lettered_at: entry.dead_lettered_at,
            requeue_count: entry.requeue_count,
        }
    }
}

/// Workflow instance needing attention
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StalledInstance {
    pub instance_id: Uuid,
    pub template_id: String,
    pub current_step: String,
    pub status: InstanceStatus,
    pub since: DateTime<Utc>,
    pub reason: Option<String>,
}

impl From<&WorkflowInstance> for StalledInstance {
    fn from(instance: &WorkflowInstance) -> Self {
        Self {
            instance_id: instance.id,
            template_id: instance.template_id.clone(),
            current_step: instance.current_step.clone(),
            status: instance.status,
            since: instance.step_entered_at(),
            reason: instance.status_reason.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InterventionFlag {
    pub module: String,
    pub reason: Option<String>,
}

/// Everything needing operator attention at one point in time
#[derive(Debug, Clone, Serialize)]
pub struct OperatorReport {
    pub generated_at: DateTime<Utc>,
    pub dead_letters: Vec<DeadLetterSummary>,
    pub failed_migrations: Vec<MigrationRun>,
    pub incomplete_rollbacks: Vec<MigrationRun>,
    pub modules_needing_intervention: Vec<InterventionFlag>,
    pub overdue_instances: Vec<StalledInstance>,
    pub failed_instances: Vec<StalledInstance>,
    pub bus: BusStats,
}

impl OperatorReport {
    /// True when nothing needs an operator
    pub fn is_clean(&self) -> bool {
        self.dead_letters.is_empty()
            && self.failed_migrations.is_empty()
            && self.incomplete_rollbacks.is_empty()
            && self.modules_needing_intervention.is_empty()
            && self.overdue_instances.is_empty()
            && self.failed_instances.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct Diagnostics {
    registry: Arc<ModuleRegistry>,
    bus: MessageBus,
    workflows: Arc<WorkflowEngine>,
    migrations: Arc<MigrationManager>,
    clock: SharedClock,
}

impl Diagnostics {
    pub fn new(
        registry: Arc<ModuleRegistry>,
        bus: MessageBus,
        workflows: Arc<WorkflowEngine>,
        migrations: Arc<MigrationManager>,
        clock: SharedClock,
    ) -> Self {
        Self {
            registry,
            bus,
            workflows,
            migrations,
            clock,
        }
    }

    pub async fn dead_letters(&self) -> Result<Vec<DeadLetterSummary>> {
        let entries = self.bus.dead_letters().await?;
        Ok(entries.iter().map(DeadLetterSummary::from).collect())
    }

    /// Failed runs and incomplete rollbacks, as two separate lists
    pub async fn problem_migrations(&self) -> Result<(Vec<MigrationRun>, Vec<MigrationRun>)> {
        let runs = self.migrations.failed_runs().await?;
        Ok(runs
            .into_iter()
            .partition(|run| run.status == MigrationRunStatus::Failed))
    }

    pub fn modules_needing_intervention(&self) -> Vec<InterventionFlag> {
        self.registry
            .list()
            .into_iter()
            .filter(|m| m.needs_intervention())
            .map(|m| InterventionFlag {
                module: m.name,
                reason: m.status_reason,
            })
            .collect()
    }

    pub async fn overdue_instances(&self) -> Result<Vec<StalledInstance>> {
        let instances = self
            .workflows
            .list_instances(
                &InstanceFilter::new()
                    .status(InstanceStatus::Active)
                    .overdue(true),
            )
            .await?;
        Ok(instances.iter().map(StalledInstance::from).collect())
    }

    pub async fn failed_instances(&self) -> Result<Vec<StalledInstance>> {
        let instances = self
            .workflows
            .list_instances(&InstanceFilter::new().status(InstanceStatus::Failed))
            .await?;
        Ok(instances.iter().map(StalledInstance::from).collect())
    }

    pub async fn report(&self) -> Result<OperatorReport> {
        let (failed_migrations, incomplete_rollbacks) = self.problem_migrations().await?;
        let report = OperatorReport {
            generated_at: self.clock.now(),
            dead_letters: self.dead_letters().await?,
            failed_migrations,
            incomplete_rollbacks,
            modules_needing_intervention: self.modules_needing_intervention(),
            overdue_instances: self.overdue_instances().await?,
            failed_instances: self.failed_instances().await?,
            bus: self.bus.stats(),
        };
        debug!(
            dead_letters = report.dead_letters.len(),
            failed_migrations = report.failed_migrations.len(),
            incomplete_rollbacks = report.incomplete_rollbacks.len(),
            overdue_instances = report.overdue_instances.len(),
            "Operator report generated"
        );
        Ok(report)
    }
}
