//! # SLA Monitor
//!
//! ## Architecture: Compare-and-Swap Claiming
//!
//! The monitor periodically scans active instances and compares each
//! instance's dwell time at its current step with that step's SLA. A breached
//! instance is either moved to the step's escalation target (outcome
//! `sla_breach`, actor `system:sla_monitor`) or flagged overdue.
//!
//! Every change is written with the instance revision the sweep read. When a
//! step execution or another sweep gets there first, the write is rejected and
//! the instance is left for the next pass, so one breach escalates once.
//!
//! ## Key Features
//!
//! - **Injected clock**: dwell time is measured against the engine clock, so
//!   tests drive breaches by advancing a manual clock
//! - **Overdue flag set once**: a breached step without escalation target is
//!   flagged a single time and the flag clears when the instance moves on
//! - **Shutdown aware**: the loop stops when the shutdown channel fires

use super::engine::WorkflowEngine;
use super::errors::{WorkflowError, WorkflowResult};
use super::instance::{InstanceFilter, InstanceStatus, WorkflowInstance};
use crate::constants::workflow as outcomes;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

/// What one sweep changed
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SlaSweepReport {
    pub examined: usize,
    pub escalated: Vec<Uuid>,
    pub flagged_overdue: Vec<Uuid>,
    /// Breaches skipped because the instance changed during the sweep
    pub conflicts: usize,
}

impl SlaSweepReport {
    pub fn changed(&self) -> usize {
        self.escalated.len() + self.flagged_overdue.len()
    }
}

enum Breach {
    Escalate(Uuid),
    FlagOverdue(Uuid),
}

#[derive(Debug, Clone)]
pub struct SlaMonitor {
    engine: Arc<WorkflowEngine>,
}

impl SlaMonitor {
    pub fn new(engine: Arc<WorkflowEngine>) -> Self {
        Self { engine }
    }

    /// Run one pass over all active instances
    #[instrument(skip(self))]
    pub async fn sweep_once(&self) -> WorkflowResult<SlaSweepReport> {
        let now = self.engine.now();
        let active = self
            .engine
            .list_instances(&InstanceFilter::new().status(InstanceStatus::Active))
            .await?;

        let mut report = SlaSweepReport {
            examined: active.len(),
            ..SlaSweepReport::default()
        };
        for instance in active {
            let Some((updated, breach)) = self.apply_breach(instance, now) else {
                continue;
            };
            match self.engine.commit_instance(updated).await {
                Ok(_) => match breach {
                    Breach::Escalate(id) => report.escalated.push(id),
                    Breach::FlagOverdue(id) => report.flagged_overdue.push(id),
                },
                Err(WorkflowError::RevisionConflict { instance_id, .. }) => {
                    debug!(instance_id = %instance_id, "🔀 WORKFLOW: Breach already claimed");
                    report.conflicts += 1;
                }
                Err(error) => return Err(error),
            }
        }

        if report.changed() > 0 {
            crate::log_workflow!(info, "SLA sweep applied breaches",
                examined: report.examined,
                escalated: report.escalated.len(),
                flagged_overdue: report.flagged_overdue.len(),
                conflicts: report.conflicts
            );
        }
        Ok(report)
    }

    /// Spawn the periodic sweep
    pub fn start(&self, shutdown: &broadcast::Sender<()>) -> JoinHandle<()> {
        let monitor = self.clone();
        let mut shutdown = shutdown.subscribe();
        let period = self.engine.config().sla_sweep_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(error) = monitor.sweep_once().await {
                            warn!(error = %error, "🔀 WORKFLOW: SLA sweep failed");
                        }
                    }
                    _ = shutdown.recv() => break,
                }
            }
            debug!("SLA sweep loop stopped");
        })
    }

    fn apply_breach(
        &self,
        mut instance: WorkflowInstance,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Option<(WorkflowInstance, Breach)> {
        let template = self.engine.template_arc(&instance.template_id)?;
        let step = template.get_step(&instance.current_step)?;
        let sla = step.sla_duration()?;
        if now - instance.step_entered_at() <= sla {
            return None;
        }

        match &step.escalation_target {
            Some(target) => {
                let Some(next) = template.get_step(target) else {
                    warn!(
                        instance_id = %instance.id,
                        escalation_target = %target,
                        "🔀 WORKFLOW: Escalation target missing from template"
                    );
                    return None;
                };
                crate::log_workflow!(info, "SLA breached, escalating",
                    instance_id: instance.id,
                    step: step.id,
                    escalation_target: target
                );
                let id = instance.id;
                instance.advance(
                    target,
                    next.is_end(),
                    Some(outcomes::SLA_BREACH_OUTCOME.to_string()),
                    Some(outcomes::SYSTEM_ACTOR.to_string()),
                    now,
                );
                Some((instance, Breach::Escalate(id)))
            }
            None if !instance.overdue => {
                crate::log_workflow!(info, "SLA breached, flagging overdue",
                    instance_id: instance.id,
                    step: step.id
                );
                instance.overdue = true;
                instance.updated_at = now;
                let id = instance.id;
                Some((instance, Breach::FlagOverdue(id)))
            }
            None => None,
        }
    }
}
