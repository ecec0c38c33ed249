//! # Workflow Engine
//!
//! Runs cross-module workflows defined as validated step graphs.
//!
//! ## Execution
//!
//! An instance waits at its current step until `execute_step` is called for
//! exactly that step. Steps that bind an action invoke the owning module with a
//! synchronous bus call from the `workflow_engine` system sender, bounded by
//! `workflow.step_timeout`. The reply decides the outcome:
//!
//! - a JSON string is the outcome itself
//! - an object may carry `outcome` and a `data` object merged into instance data
//! - anything else falls back to the outcome supplied with the input
//!
//! Steps without an action take their outcome from the input.
//!
//! ## Failure handling
//!
//! Timeouts and transient delivery failures leave the instance where it was so
//! the step can be resubmitted; nothing is retried automatically. Permanent
//! failures (handler rejection, unknown message type, target gone) mark the
//! instance `failed`.
//!
//! ## Concurrency
//!
//! Instances are persisted with a revision that grows by one per change. Every
//! write is a compare-and-swap on that revision, shared with the SLA sweep, so
//! two writers racing on one instance never both succeed.

use super::errors::{WorkflowError, WorkflowResult};
use super::instance::{InstanceFilter, InstanceStatus, WorkflowInstance};
use super::template::{Step, StepAction, WorkflowTemplate};
use crate::clock::SharedClock;
use crate::config::WorkflowConfig;
use crate::constants::{collections, system_senders, workflow as outcomes};
use crate::messaging::{DeliveryError, MessageBus, MessageSource, SendOptions};
use crate::store::{DocumentFilter, DocumentStore, StoreError};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{instrument, warn};
use uuid::Uuid;

const CANCEL_ATTEMPTS: usize = 3;

/// Caller-supplied input for one step execution
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepInput {
    pub actor: Option<String>,
    pub outcome: Option<String>,
    #[serde(default)]
    pub data: Map<String, Value>,
}

impl StepInput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn by(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    pub fn outcome(mut self, outcome: impl Into<String>) -> Self {
        self.outcome = Some(outcome.into());
        self
    }

    pub fn field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }
}

pub struct WorkflowEngine {
    store: Arc<dyn DocumentStore>,
    bus: MessageBus,
    clock: SharedClock,
    config: WorkflowConfig,
    templates: RwLock<HashMap<String, Arc<WorkflowTemplate>>>,
}

impl fmt::Debug for WorkflowEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowEngine")
            .field("templates", &self.templates.read().len())
            .field("config", &self.config)
            .finish()
    }
}

impl WorkflowEngine {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        bus: MessageBus,
        clock: SharedClock,
        config: WorkflowConfig,
    ) -> Self {
        Self {
            store,
            bus,
            clock,
            config,
            templates: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &WorkflowConfig {
        &self.config
    }

    /// Validate and register a template. Template ids are immutable once registered.
    pub async fn register_template(&self, template: WorkflowTemplate) -> WorkflowResult<()> {
        template.validate()?;
        if self.templates.read().contains_key(&template.id) {
            return Err(WorkflowError::invalid_template(
                &template.id,
                "template is already registered",
            ));
        }

        let body = serde_json::to_value(&template).map_err(StoreError::from)?;
        match self
            .store
            .insert(collections::WORKFLOW_TEMPLATES, &template.id, body)
            .await
        {
            Ok(_) => {}
            Err(StoreError::DuplicateKey { .. }) => {
                return Err(WorkflowError::invalid_template(
                    &template.id,
                    "template is already registered",
                ));
            }
            Err(error) => return Err(error.into()),
        }

        crate::log_workflow!(info, "Template registered",
            template_id: template.id,
            steps: template.steps.len()
        );
        self.templates
            .write()
            .insert(template.id.clone(), Arc::new(template));
        Ok(())
    }

    /// Restore templates persisted by an earlier process
    pub async fn load_templates(&self) -> WorkflowResult<usize> {
        let documents = self
            .store
            .select(collections::WORKFLOW_TEMPLATES, &DocumentFilter::new())
            .await?;
        let mut templates = HashMap::with_capacity(documents.len());
        for document in &documents {
            let template: WorkflowTemplate = document.decode()?;
            templates.insert(template.id.clone(), Arc::new(template));
        }
        let count = templates.len();
        *self.templates.write() = templates;
        Ok(count)
    }

    pub fn template(&self, template_id: &str) -> Option<WorkflowTemplate> {
        self.templates
            .read()
            .get(template_id)
            .map(|t| WorkflowTemplate::clone(t))
    }

    /// Registered template ids, sorted
    pub fn template_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.templates.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Start a new instance at the template's start step
    #[instrument(skip(self, initial_data))]
    pub async fn create_instance(
        &self,
        template_id: &str,
        initial_data: Value,
    ) -> WorkflowResult<WorkflowInstance> {
        let template = self.require_template(template_id)?;
        let start = template.start_step().ok_or_else(|| {
            WorkflowError::invalid_template(template_id, "template has no start step")
        })?;
        let data = match initial_data {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("input".to_string(), other);
                map
            }
        };

        let instance = WorkflowInstance::new(template_id, &start.id, data, self.clock.now());
        let body = serde_json::to_value(&instance).map_err(StoreError::from)?;
        self.store
            .insert(collections::WORKFLOW_INSTANCES, &instance.id.to_string(), body)
            .await?;

        crate::log_workflow!(info, "Instance created",
            instance_id: instance.id,
            template_id: template_id,
            step: instance.current_step
        );
        Ok(instance)
    }

    /// Execute the instance's current step and move along the matching transition
    #[instrument(skip(self, input))]
    pub async fn execute_step(
        &self,
        instance_id: Uuid,
        step_id: &str,
        input: StepInput,
    ) -> WorkflowResult<WorkflowInstance> {
        let mut instance = self.require_instance(instance_id).await?;
        if instance.status.is_terminal() {
            return Err(WorkflowError::InstanceTerminated {
                instance_id,
                status: instance.status,
            });
        }
        if instance.current_step != step_id {
            return Err(WorkflowError::InvalidTransition {
                instance_id,
                current_step: instance.current_step.clone(),
                requested_step: step_id.to_string(),
            });
        }

        let template = self.require_template(&instance.template_id)?;
        let step = Self::require_step(&template, step_id)?;

        let mut outcome = input.outcome.clone();
        instance.merge_data(input.data.clone());
        if let Some(action) = &step.action {
            match self.invoke(&instance, step, action, &input).await {
                Ok(reply) => {
                    let (reply_outcome, reply_data) = interpret_reply(reply);
                    if reply_outcome.is_some() {
                        outcome = reply_outcome;
                    }
                    instance.merge_data(reply_data);
                }
                Err(error) => return Err(self.action_failed(instance, step, &input, error).await),
            }
        }

        let next_id = step
            .transitions
            .resolve(outcome.as_deref())
            .ok_or_else(|| WorkflowError::UnknownOutcome {
                instance_id,
                step_id: step_id.to_string(),
                outcome: outcome.clone(),
            })?;
        let next = Self::require_step(&template, next_id)?;

        instance.advance(
            next_id,
            next.is_end(),
            outcome.clone(),
            input.actor.clone(),
            self.clock.now(),
        );
        let instance = self.commit_instance(instance).await?;

        crate::log_workflow!(info, "Step executed",
            instance_id: instance_id,
            step: step_id,
            outcome: outcome,
            next_step: next_id,
            status: instance.status
        );
        Ok(instance)
    }

    /// Cancel an instance from any non-terminal state
    #[instrument(skip(self, reason))]
    pub async fn cancel_instance(
        &self,
        instance_id: Uuid,
        reason: &str,
        actor: &str,
    ) -> WorkflowResult<WorkflowInstance> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut instance = self.require_instance(instance_id).await?;
            if instance.status.is_terminal() {
                return Err(WorkflowError::InstanceTerminated {
                    instance_id,
                    status: instance.status,
                });
            }

            instance.terminate(
                InstanceStatus::Cancelled,
                outcomes::CANCELLED_OUTCOME,
                Some(actor.to_string()),
                reason,
                self.clock.now(),
            );
            match self.commit_instance(instance).await {
                Ok(instance) => {
                    crate::log_workflow!(info, "Instance cancelled",
                        instance_id: instance_id,
                        actor: actor,
                        reason: reason
                    );
                    return Ok(instance);
                }
                Err(WorkflowError::RevisionConflict { .. }) if attempt < CANCEL_ATTEMPTS => {
                    continue
                }
                Err(error) => return Err(error),
            }
        }
    }

    pub async fn get_instance(
        &self,
        instance_id: Uuid,
    ) -> WorkflowResult<Option<WorkflowInstance>> {
        match self
            .store
            .get(collections::WORKFLOW_INSTANCES, &instance_id.to_string())
            .await?
        {
            Some(document) => {
                let mut instance: WorkflowInstance = document.decode()?;
                instance.revision = document.version;
                Ok(Some(instance))
            }
            None => Ok(None),
        }
    }

    /// Instances matching the filter, ordered by id
    pub async fn list_instances(
        &self,
        filter: &InstanceFilter,
    ) -> WorkflowResult<Vec<WorkflowInstance>> {
        let documents = self
            .store
            .select(collections::WORKFLOW_INSTANCES, &filter.to_document_filter())
            .await?;
        let mut instances = Vec::with_capacity(documents.len());
        for document in &documents {
            let mut instance: WorkflowInstance = document.decode()?;
            instance.revision = document.version;
            instances.push(instance);
        }
        Ok(instances)
    }

    pub(super) fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub(super) fn template_arc(&self, template_id: &str) -> Option<Arc<WorkflowTemplate>> {
        self.templates.read().get(template_id).cloned()
    }

    /// Persist `instance` if nobody changed it since it was read at `instance.revision`
    pub(super) async fn commit_instance(
        &self,
        mut instance: WorkflowInstance,
    ) -> WorkflowResult<WorkflowInstance> {
        let expected_revision = instance.revision;
        instance.revision = expected_revision + 1;
        let body = serde_json::to_value(&instance).map_err(StoreError::from)?;
        let affected = self
            .store
            .update_where(
                collections::WORKFLOW_INSTANCES,
                &instance.id.to_string(),
                expected_revision,
                body,
            )
            .await?;
        if affected == 0 {
            crate::log_workflow!(debug, "Stale instance write rejected",
                instance_id: instance.id,
                expected_revision: expected_revision
            );
            return Err(WorkflowError::RevisionConflict {
                instance_id: instance.id,
                expected_revision,
            });
        }
        Ok(instance)
    }

    fn require_template(&self, template_id: &str) -> WorkflowResult<Arc<WorkflowTemplate>> {
        self.template_arc(template_id)
            .ok_or_else(|| WorkflowError::template_not_found(template_id))
    }

    fn require_step<'a>(template: &'a WorkflowTemplate, step_id: &str) -> WorkflowResult<&'a Step> {
        template.get_step(step_id).ok_or_else(|| {
            WorkflowError::invalid_template(
                &template.id,
                format!("step '{step_id}' is not defined"),
            )
        })
    }

    async fn require_instance(&self, instance_id: Uuid) -> WorkflowResult<WorkflowInstance> {
        self.get_instance(instance_id)
            .await?
            .ok_or(WorkflowError::InstanceNotFound { instance_id })
    }

    async fn invoke(
        &self,
        instance: &WorkflowInstance,
        step: &Step,
        action: &StepAction,
        input: &StepInput,
    ) -> Result<Option<Value>, DeliveryError> {
        let payload = json!({
            "instance_id": instance.id,
            "template_id": instance.template_id,
            "step_id": step.id,
            "actor": input.actor,
            "outcome": input.outcome,
            "input": input.data,
            "data": instance.data,
        });
        let options = SendOptions::new()
            .with_timeout(self.config.step_timeout())
            .with_correlation_id(instance.id.to_string());
        let receipt = self
            .bus
            .send(
                MessageSource::system(system_senders::WORKFLOW_ENGINE),
                &action.module,
                &action.message_type,
                payload,
                options,
            )
            .await?;
        Ok(receipt.reply)
    }

    async fn action_failed(
        &self,
        mut instance: WorkflowInstance,
        step: &Step,
        input: &StepInput,
        error: DeliveryError,
    ) -> WorkflowError {
        let instance_id = instance.id;
        if let DeliveryError::DeliveryTimeout { .. } = error {
            crate::log_workflow!(warn, "Step action timed out",
                instance_id: instance_id,
                step: step.id,
                timeout_ms: self.config.step_timeout_ms
            );
            return WorkflowError::StepTimeout {
                instance_id,
                step_id: step.id.clone(),
                timeout_ms: self.config.step_timeout_ms,
            };
        }

        if error.is_permanent() {
            instance.terminate(
                InstanceStatus::Failed,
                outcomes::ERROR_OUTCOME,
                input.actor.clone(),
                error.to_string(),
                self.clock.now(),
            );
            match self.commit_instance(instance).await {
                Ok(_) => {
                    crate::log_workflow!(error, "Instance failed",
                        instance_id: instance_id,
                        step: step.id,
                        error: error.to_string()
                    );
                }
                Err(commit_error) => warn!(
                    instance_id = %instance_id,
                    error = %commit_error,
                    "🔀 WORKFLOW: Could not record instance failure"
                ),
            }
        } else {
            crate::log_workflow!(warn, "Step action failed, instance left for resubmission",
                instance_id: instance_id,
                step: step.id,
                error: error.to_string()
            );
        }

        WorkflowError::ActionFailed {
            instance_id,
            step_id: step.id.clone(),
            error,
        }
    }
}

fn interpret_reply(reply: Option<Value>) -> (Option<String>, Map<String, Value>) {
    match reply {
        Some(Value::String(outcome)) => (Some(outcome), Map::new()),
        Some(Value::Object(mut reply)) => {
            let outcome = reply
                .get("outcome")
                .and_then(Value::as_str)
                .map(str::to_string);
            let data = match reply.remove("data") {
                Some(Value::Object(data)) => data,
                _ => Map::new(),
            };
            (outcome, data)
        }
        _ => (None, Map::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::config::{BackoffConfig, MessageBusConfig, RegistryConfig};
    use crate::messaging::{HandlerError, HandlerTable};
    use crate::registry::{ModuleDescriptor, ModuleRegistry};
    use crate::store::InMemoryDocumentStore;
    use crate::workflow::template::Step;
    use tokio::sync::broadcast;

    struct Harness {
        engine: WorkflowEngine,
        bus: MessageBus,
        _shutdown: broadcast::Sender<()>,
    }

    async fn harness(step_timeout_ms: u64) -> Harness {
        let store: Arc<dyn DocumentStore> = Arc::new(InMemoryDocumentStore::new());
        let registry = Arc::new(ModuleRegistry::new(
            Arc::clone(&store),
            RegistryConfig::default(),
        ));
        registry
            .register(ModuleDescriptor::new("Inspections", "1.0"))
            .await
            .unwrap();
        let bus = MessageBus::new(
            registry,
            Arc::clone(&store),
            Arc::new(SystemClock),
            MessageBusConfig {
                worker_count: 2,
                max_delivery_attempts: 1,
                backoff: BackoffConfig {
                    initial_delay_ms: 1,
                    max_delay_ms: 1,
                    multiplier: 1.0,
                },
                ..MessageBusConfig::default()
            },
        );
        let (shutdown, _) = broadcast::channel(1);
        bus.start_workers(&shutdown);

        let engine = WorkflowEngine::new(
            store,
            bus.clone(),
            Arc::new(SystemClock),
            WorkflowConfig {
                step_timeout_ms,
                ..WorkflowConfig::default()
            },
        );
        engine
            .register_template(
                WorkflowTemplate::new("inspection", "Inspection")
                    .step(Step::start("start").then("inspect"))
                    .step(
                        Step::task("inspect")
                            .action("Inspections", "inspect")
                            .on("pass", "passed")
                            .on("fail", "failed"),
                    )
                    .step(Step::end("passed"))
                    .step(Step::end("failed")),
            )
            .await
            .unwrap();
        Harness {
            engine,
            bus,
            _shutdown: shutdown,
        }
    }

    async fn at_inspect(h: &Harness) -> WorkflowInstance {
        let instance = h
            .engine
            .create_instance("inspection", json!({"site": "12 Elm"}))
            .await
            .unwrap();
        h.engine
            .execute_step(instance.id, "start", StepInput::new().by("clerk"))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_action_reply_selects_transition() {
        let h = harness(1_000).await;
        h.bus.attach_handler(
            "Inspections",
            Arc::new(HandlerTable::new().on("inspect", |payload| async move {
                assert_eq!(payload["data"]["site"], "12 Elm");
                Ok(json!({"outcome": "pass", "data": {"score": 97}}))
            })),
        );

        let instance = at_inspect(&h).await;
        assert_eq!(instance.current_step, "inspect");
        assert_eq!(instance.revision, 2);

        let done = h
            .engine
            .execute_step(instance.id, "inspect", StepInput::new().by("inspector"))
            .await
            .unwrap();
        assert_eq!(done.status, InstanceStatus::Completed);
        assert_eq!(done.path(), vec!["start", "inspect", "passed"]);
        assert_eq!(done.data.get("score"), Some(&json!(97)));
        assert_eq!(done.history[1].outcome.as_deref(), Some("pass"));

        let err = h
            .engine
            .execute_step(done.id, "passed", StepInput::new())
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::InstanceTerminated { .. }));
    }

    #[tokio::test]
    async fn test_wrong_step_is_invalid_transition() {
        let h = harness(1_000).await;
        let instance = h
            .engine
            .create_instance("inspection", json!({}))
            .await
            .unwrap();
        let err = h
            .engine
            .execute_step(instance.id, "inspect", StepInput::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            WorkflowError::InvalidTransition { ref current_step, .. } if current_step == "start"
        ));
    }

    #[tokio::test]
    async fn test_unknown_outcome_keeps_instance_in_place() {
        let h = harness(1_000).await;
        h.bus.attach_handler(
            "Inspections",
            Arc::new(HandlerTable::new().on("inspect", |_| async { Ok(json!("maybe")) })),
        );
        let instance = at_inspect(&h).await;
        let err = h
            .engine
            .execute_step(instance.id, "inspect", StepInput::new())
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::UnknownOutcome { .. }));
        let reloaded = h.engine.get_instance(instance.id).await.unwrap().unwrap();
        assert_eq!(reloaded.current_step, "inspect");
        assert_eq!(reloaded.revision, instance.revision);
    }

    #[tokio::test]
    async fn test_step_timeout_leaves_instance_active() {
        let h = harness(50).await;
        h.bus.attach_handler(
            "Inspections",
            Arc::new(HandlerTable::new().on("inspect", |_| async {
                tokio::time::sleep(std::time::Duration::from_millis(500)).await;
                Ok(json!("pass"))
            })),
        );
        let instance = at_inspect(&h).await;
        let err = h
            .engine
            .execute_step(instance.id, "inspect", StepInput::new())
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::StepTimeout { timeout_ms: 50, .. }));
        let reloaded = h.engine.get_instance(instance.id).await.unwrap().unwrap();
        assert!(reloaded.is_active());
        assert_eq!(reloaded.current_step, "inspect");
    }

    #[tokio::test]
    async fn test_permanent_action_failure_fails_instance() {
        let h = harness(1_000).await;
        h.bus.attach_handler(
            "Inspections",
            Arc::new(HandlerTable::new().on("inspect", |_| async {
                Err(HandlerError::permanent("site does not exist"))
            })),
        );
        let instance = at_inspect(&h).await;
        let err = h
            .engine
            .execute_step(instance.id, "inspect", StepInput::new())
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::ActionFailed { .. }));

        let reloaded = h.engine.get_instance(instance.id).await.unwrap().unwrap();
        assert_eq!(reloaded.status, InstanceStatus::Failed);
        assert_eq!(
            reloaded.history.last().unwrap().outcome.as_deref(),
            Some(outcomes::ERROR_OUTCOME)
        );
    }

    #[tokio::test]
    async fn test_cancel_and_list() {
        let h = harness(1_000).await;
        let a = h.engine.create_instance("inspection", json!({})).await.unwrap();
        let b = h.engine.create_instance("inspection", json!({})).await.unwrap();

        let cancelled = h.engine.cancel_instance(a.id, "duplicate", "ops").await.unwrap();
        assert_eq!(cancelled.status, InstanceStatus::Cancelled);
        assert_eq!(cancelled.status_reason.as_deref(), Some("duplicate"));
        assert!(matches!(
            h.engine.cancel_instance(a.id, "again", "ops").await,
            Err(WorkflowError::InstanceTerminated { .. })
        ));

        let active = h
            .engine
            .list_instances(&InstanceFilter::new().status(InstanceStatus::Active))
            .await
            .unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, b.id);
    }

    #[tokio::test]
    async fn test_stale_revision_is_rejected() {
        let h = harness(1_000).await;
        let instance = h.engine.create_instance("inspection", json!({})).await.unwrap();
        h.engine
            .execute_step(instance.id, "start", StepInput::new())
            .await
            .unwrap();
        let err = h.engine.commit_instance(instance).await.unwrap_err();
        assert!(matches!(
            err,
            WorkflowError::RevisionConflict { expected_revision: 1, .. }
        ));
    }

    #[tokio::test]
    async fn test_duplicate_and_unknown_templates() {
        let h = harness(1_000).await;
        let again = h.engine.template("inspection").unwrap();
        assert!(matches!(
            h.engine.register_template(again).await,
            Err(WorkflowError::InvalidTemplate { .. })
        ));
        assert!(matches!(
            h.engine.create_instance("nope", json!({})).await,
            Err(WorkflowError::TemplateNotFound { .. })
        ));
        assert!(matches!(
            h.engine
                .execute_step(Uuid::new_v4(), "start", StepInput::new())
                .await,
            Err(WorkflowError::InstanceNotFound { .. })
        ));
    }
}
