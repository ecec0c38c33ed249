//! Test handlers and fixtures

use async_trait::async_trait;
use modhub_core::messaging::{HandlerError, ModuleHandler};
use modhub_core::registry::ModuleDescriptor;
use modhub_core::workflow::{Step, WorkflowTemplate};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

/// Handler that records every message it receives and replies with a fixed value
#[derive(Debug, Clone)]
pub struct RecordingHandler {
    received: Arc<Mutex<Vec<(String, Value)>>>,
    reply: Value,
    transient_failures: Arc<Mutex<u32>>,
}

impl Default for RecordingHandler {
    fn default() -> Self {
        Self::replying(json!({"ok": true}))
    }
}

impl RecordingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn replying(reply: Value) -> Self {
        Self {
            received: Arc::new(Mutex::new(Vec::new())),
            reply,
            transient_failures: Arc::new(Mutex::new(0)),
        }
    }

    /// Fail the next `count` deliveries with a transient error
    pub fn failing_first(self, count: u32) -> Self {
        *self.transient_failures.lock() = count;
        self
    }

    pub fn received(&self) -> Vec<(String, Value)> {
        self.received.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.received.lock().len()
    }

    pub fn as_handler(&self) -> Arc<dyn ModuleHandler> {
        Arc::new(self.clone())
    }
}

#[async_trait]
impl ModuleHandler for RecordingHandler {
    async fn handle(&self, message_type: &str, payload: Value) -> Result<Value, HandlerError> {
        {
            let mut remaining = self.transient_failures.lock();
            if *remaining > 0 {
                *remaining -= 1;
                return Err(HandlerError::transient("downstream unavailable"));
            }
        }
        self.received
            .lock()
            .push((message_type.to_string(), payload));
        Ok(self.reply.clone())
    }
}

/// Billing has no dependencies; Permits depends on Billing
pub fn billing_and_permits() -> Vec<ModuleDescriptor> {
    vec![
        ModuleDescriptor::new("Billing", "1.0"),
        ModuleDescriptor::new("Permits", "1.0").depends_on("Billing", ">=1.0"),
    ]
}

/// Permit review with a two-day SLA on the review step
pub fn permit_review_template() -> WorkflowTemplate {
    WorkflowTemplate::new("permit_review", "Permit review")
        .step(Step::start("submitted").then("review"))
        .step(
            Step::decision("review")
                .assignee("reviewer")
                .on("approved", "approved")
                .on("rejected", "rejected")
                .sla(Duration::from_secs(2 * 24 * 60 * 60))
                .escalate_to("supervisor_review"),
        )
        .step(
            Step::decision("supervisor_review")
                .assignee("supervisor")
                .on("approved", "approved")
                .on("rejected", "rejected"),
        )
        .step(Step::end("approved"))
        .step(Step::end("rejected"))
}
