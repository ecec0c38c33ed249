//! # Workflow Templates
//!
//! Templates are directed graphs: steps are nodes, transitions are labeled
//! edges. A template is validated once, at registration, so the engine can
//! trust every edge it follows at runtime.

use super::errors::{WorkflowError, WorkflowResult};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    Start,
    Task,
    Decision,
    End,
}

impl StepType {
    /// Only task and decision steps may carry an SLA
    pub fn supports_sla(&self) -> bool {
        matches!(self, Self::Task | Self::Decision)
    }
}

impl fmt::Display for StepType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Start => write!(f, "start"),
            Self::Task => write!(f, "task"),
            Self::Decision => write!(f, "decision"),
            Self::End => write!(f, "end"),
        }
    }
}

/// Module invocation bound to a step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepAction {
    pub module: String,
    pub message_type: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transitions {
    #[default]
    None,
    Unconditional(String),
    ByOutcome(BTreeMap<String, String>),
}

impl Transitions {
    /// Every step id this step can move to
    pub fn targets(&self) -> Vec<&str> {
        match self {
            Self::None => Vec::new(),
            Self::Unconditional(next) => vec![next.as_str()],
            Self::ByOutcome(map) => map.values().map(String::as_str).collect(),
        }
    }

    /// Resolve the next step for an outcome.
    ///
    /// An unconditional edge accepts any outcome. An outcome map with a single
    /// entry is followed when no outcome is given.
    pub fn resolve(&self, outcome: Option<&str>) -> Option<&str> {
        match (self, outcome) {
            (Self::None, _) => None,
            (Self::Unconditional(next), _) => Some(next),
            (Self::ByOutcome(map), Some(outcome)) => map.get(outcome).map(String::as_str),
            (Self::ByOutcome(map), None) if map.len() == 1 => {
                map.values().next().map(String::as_str)
            }
            (Self::ByOutcome(_), None) => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Self::None => true,
            Self::Unconditional(_) => false,
            Self::ByOutcome(map) => map.is_empty(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub id: String,
    pub name: String,
    pub step_type: StepType,
    #[serde(default)]
    pub assignee_role: Option<String>,
    #[serde(default)]
    pub action: Option<StepAction>,
    #[serde(default)]
    pub transitions: Transitions,
    /// Maximum dwell time in seconds
    #[serde(default)]
    pub sla_seconds: Option<u64>,
    #[serde(default)]
    pub escalation_target: Option<String>,
}

impl Step {
    fn new(id: impl Into<String>, step_type: StepType) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            step_type,
            assignee_role: None,
            action: None,
            transitions: Transitions::None,
            sla_seconds: None,
            escalation_target: None,
        }
    }

    pub fn start(id: impl Into<String>) -> Self {
        Self::new(id, StepType::Start)
    }

    pub fn task(id: impl Into<String>) -> Self {
        Self::new(id, StepType::Task)
    }

    pub fn decision(id: impl Into<String>) -> Self {
        Self::new(id, StepType::Decision)
    }

    pub fn end(id: impl Into<String>) -> Self {
        Self::new(id, StepType::End)
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn assignee(mut self, role: impl Into<String>) -> Self {
        self.assignee_role = Some(role.into());
        self
    }

    pub fn action(mut self, module: impl Into<String>, message_type: impl Into<String>) -> Self {
        self.action = Some(StepAction {
            module: module.into(),
            message_type: message_type.into(),
        });
        self
    }

    /// Move to `next` whatever the outcome
    pub fn then(mut self, next: impl Into<String>) -> Self {
        self.transitions = Transitions::Unconditional(next.into());
        self
    }

    /// Move to `next` when the step reports `outcome`
    pub fn on(mut self, outcome: impl Into<String>, next: impl Into<String>) -> Self {
        let mut map = match std::mem::take(&mut self.transitions) {
            Transitions::ByOutcome(map) => map,
            _ => BTreeMap::new(),
        };
        map.insert(outcome.into(), next.into());
        self.transitions = Transitions::ByOutcome(map);
        self
    }

    pub fn sla(mut self, sla: Duration) -> Self {
        self.sla_seconds = Some(sla.as_secs());
        self
    }

    pub fn escalate_to(mut self, step_id: impl Into<String>) -> Self {
        self.escalation_target = Some(step_id.into());
        self
    }

    pub fn sla_duration(&self) -> Option<chrono::Duration> {
        self.sla_seconds
            .and_then(|s| i64::try_from(s).ok())
            .map(chrono::Duration::seconds)
    }

    pub fn is_end(&self) -> bool {
        self.step_type == StepType::End
    }

    fn edges(&self) -> impl Iterator<Item = &str> {
        self.transitions
            .targets()
            .into_iter()
            .chain(self.escalation_target.as_deref())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowTemplate {
    pub id: String,
    pub name: String,
    pub steps: Vec<Step>,
}

impl WorkflowTemplate {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            steps: Vec::new(),
        }
    }

    pub fn step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    pub fn get_step(&self, id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == id)
    }

    pub fn start_step(&self) -> Option<&Step> {
        self.steps.iter().find(|s| s.step_type == StepType::Start)
    }

    /// Check the graph once so runtime transitions never meet a dangling edge
    pub fn validate(&self) -> WorkflowResult<()> {
        let invalid = |reason: String| WorkflowError::invalid_template(&self.id, reason);

        if self.id.trim().is_empty() {
            return Err(invalid("template id must not be empty".to_string()));
        }

        let mut steps: HashMap<&str, &Step> = HashMap::with_capacity(self.steps.len());
        for step in &self.steps {
            if steps.insert(step.id.as_str(), step).is_some() {
                return Err(invalid(format!("step '{}' is defined twice", step.id)));
            }
        }

        let starts: Vec<&Step> = self
            .steps
            .iter()
            .filter(|s| s.step_type == StepType::Start)
            .collect();
        let start = match starts.as_slice() {
            [start] => *start,
            [] => return Err(invalid("template has no start step".to_string())),
            _ => return Err(invalid(format!("template has {} start steps", starts.len()))),
        };

        for step in &self.steps {
            for target in step.transitions.targets() {
                if !steps.contains_key(target) {
                    return Err(invalid(format!(
                        "step '{}' transitions to undefined step '{target}'",
                        step.id
                    )));
                }
            }

            match (step.is_end(), step.transitions.is_empty()) {
                (true, false) => {
                    return Err(invalid(format!("end step '{}' has outgoing transitions", step.id)))
                }
                (false, true) => {
                    return Err(invalid(format!("step '{}' has no outgoing transitions", step.id)))
                }
                _ => {}
            }

            if step.is_end() && step.action.is_some() {
                return Err(invalid(format!("end step '{}' cannot bind an action", step.id)));
            }

            if step.sla_seconds.is_some() && !step.step_type.supports_sla() {
                return Err(invalid(format!(
                    "{} step '{}' cannot declare an SLA",
                    step.step_type, step.id
                )));
            }

            if let Some(target) = &step.escalation_target {
                if step.sla_seconds.is_none() {
                    return Err(invalid(format!(
                        "step '{}' has an escalation target but no SLA",
                        step.id
                    )));
                }
                if !steps.contains_key(target.as_str()) {
                    return Err(invalid(format!(
                        "step '{}' escalates to undefined step '{target}'",
                        step.id
                    )));
                }
                if target == &start.id {
                    return Err(invalid(format!(
                        "step '{}' escalates to the start step",
                        step.id
                    )));
                }
            }
        }

        let reachable = Self::reach(start.id.as_str(), |id| {
            steps.get(id).map(|s| s.edges().collect()).unwrap_or_default()
        });
        if let Some(orphan) = self.steps.iter().find(|s| !reachable.contains(s.id.as_str())) {
            return Err(invalid(format!(
                "step '{}' is unreachable from start",
                orphan.id
            )));
        }

        let mut predecessors: HashMap<&str, Vec<&str>> = HashMap::new();
        for step in &self.steps {
            for target in step.edges() {
                predecessors.entry(target).or_default().push(step.id.as_str());
            }
        }
        let mut can_finish: HashSet<&str> = HashSet::new();
        for end in self.steps.iter().filter(|s| s.is_end()) {
            can_finish.extend(Self::reach(end.id.as_str(), |id| {
                predecessors.get(id).cloned().unwrap_or_default()
            }));
        }
        if let Some(stuck) = self.steps.iter().find(|s| !can_finish.contains(s.id.as_str())) {
            return Err(invalid(format!(
                "step '{}' cannot reach an end step",
                stuck.id
            )));
        }

        Ok(())
    }

    fn reach<'a>(from: &'a str, next: impl Fn(&'a str) -> Vec<&'a str>) -> HashSet<&'a str> {
        let mut seen = HashSet::from([from]);
        let mut queue = VecDeque::from([from]);
        while let Some(id) = queue.pop_front() {
            for target in next(id) {
                if seen.insert(target) {
                    queue.push_back(target);
                }
            }
        }
        seen
    }
}
