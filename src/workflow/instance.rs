//! Workflow instance state and history.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Active,
    Completed,
    Cancelled,
    Failed,
}

impl InstanceStatus {
    /// Terminal instances never change again
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Active)
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Completed => write!(f, "completed"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl FromStr for InstanceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "active" => Ok(Self::Active),
            "completed" => Ok(Self::Completed),
            "cancelled" => Ok(Self::Cancelled),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid instance status: {s}")),
        }
    }
}

/// One visit to a step. `exited_at` stays empty while the instance waits there.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub step_id: String,
    pub entered_at: DateTime<Utc>,
    pub exited_at: Option<DateTime<Utc>>,
    pub outcome: Option<String>,
    pub actor: Option<String>,
}

impl HistoryEntry {
    pub(crate) fn enter(step_id: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            step_id: step_id.into(),
            entered_at: at,
            exited_at: None,
            outcome: None,
            actor: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.exited_at.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowInstance {
    pub id: Uuid,
    pub template_id: String,
    pub current_step: String,
    pub status: InstanceStatus,
    pub history: Vec<HistoryEntry>,
    pub data: Map<String, Value>,
    /// Set once when an SLA without escalation target is breached
    pub overdue: bool,
    /// Bumped by exactly one on every persisted change
    pub revision: i64,
    pub status_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowInstance {
    pub(crate) fn new(
        template_id: impl Into<String>,
        start_step: impl Into<String>,
        data: Map<String, Value>,
        now: DateTime<Utc>,
    ) -> Self {
        let start_step = start_step.into();
        Self {
            id: Uuid::new_v4(),
            template_id: template_id.into(),
            history: vec![HistoryEntry::enter(&start_step, now)],
            current_step: start_step,
            status: InstanceStatus::Active,
            data,
            overdue: false,
            revision: 1,
            status_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == InstanceStatus::Active
    }

    /// When the instance arrived at its current step
    pub fn step_entered_at(&self) -> DateTime<Utc> {
        self.history
            .last()
            .map(|entry| entry.entered_at)
            .unwrap_or(self.created_at)
    }

    /// Step ids in visit order
    pub fn path(&self) -> Vec<&str> {
        self.history.iter().map(|e| e.step_id.as_str()).collect()
    }

    pub(crate) fn close_current(
        &mut self,
        outcome: Option<String>,
        actor: Option<String>,
        at: DateTime<Utc>,
    ) {
        if let Some(entry) = self.history.last_mut().filter(|e| e.is_open()) {
            entry.exited_at = Some(at);
            entry.outcome = outcome;
            entry.actor = actor;
        }
    }

    /// Close the current entry and enter `next`. Entering an end step completes the instance.
    pub(crate) fn advance(
        &mut self,
        next: &str,
        next_is_end: bool,
        outcome: Option<String>,
        actor: Option<String>,
        at: DateTime<Utc>,
    ) {
        self.close_current(outcome, actor, at);
        let mut entry = HistoryEntry::enter(next, at);
        if next_is_end {
            entry.exited_at = Some(at);
            self.status = InstanceStatus::Completed;
        }
        self.history.push(entry);
        self.current_step = next.to_string();
        self.overdue = false;
        self.updated_at = at;
    }

    pub(crate) fn terminate(
        &mut self,
        status: InstanceStatus,
        outcome: &str,
        actor: Option<String>,
        reason: impl Into<String>,
        at: DateTime<Utc>,
    ) {
        self.close_current(Some(outcome.to_string()), actor, at);
        self.status = status;
        self.status_reason = Some(reason.into());
        self.updated_at = at;
    }

    pub(crate) fn merge_data(&mut self, data: Map<String, Value>) {
        self.data.extend(data);
    }
}

/// Instance listing filter
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InstanceFilter {
    pub template_id: Option<String>,
    pub status: Option<InstanceStatus>,
    pub overdue: Option<bool>,
    pub current_step: Option<String>,
}

impl InstanceFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn template(mut self, template_id: impl Into<String>) -> Self {
        self.template_id = Some(template_id.into());
        self
    }

    pub fn status(mut self, status: InstanceStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn overdue(mut self, overdue: bool) -> Self {
        self.overdue = Some(overdue);
        self
    }

    pub fn at_step(mut self, step_id: impl Into<String>) -> Self {
        self.current_step = Some(step_id.into());
        self
    }

    pub(crate) fn to_document_filter(&self) -> crate::store::DocumentFilter {
        let mut filter = crate::store::DocumentFilter::new();
        if let Some(template_id) = &self.template_id {
            filter = filter.field_eq("template_id", template_id.as_str());
        }
        if let Some(status) = self.status {
            filter = filter.field_eq("status", status.to_string());
        }
        if let Some(overdue) = self.overdue {
            filter = filter.field_eq("overdue", overdue);
        }
        if let Some(step) = &self.current_step {
            filter = filter.field_eq("current_step", step.as_str());
        }
        filter
    }
}
