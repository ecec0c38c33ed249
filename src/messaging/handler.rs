//! # Module Handlers
//!
//! The capability each domain module exposes to the bus, and a routing table
//! that dispatches on message type.

use super::errors::HandlerError;
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

/// Implemented by every domain module attached to the bus
#[async_trait]
pub trait ModuleHandler: Send + Sync {
    /// Handle one message and return its reply payload
    async fn handle(&self, message_type: &str, payload: Value) -> Result<Value, HandlerError>;
}

type RouteFn = Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value, HandlerError>> + Send + Sync>;

/// Message type to handler routing.
///
/// Types without a route fail with [`HandlerError::UnknownMessageType`], which
/// the bus treats as permanent.
///
/// ```rust
/// use modhub_core::messaging::{HandlerTable, ModuleHandler};
/// use serde_json::json;
///
/// # async fn example() {
/// let table = HandlerTable::new().on("ping", |_payload| async { Ok(json!("pong")) });
/// assert_eq!(table.handle("ping", json!({})).await.unwrap(), json!("pong"));
/// assert!(table.handle("pong", json!({})).await.is_err());
/// # }
/// ```
#[derive(Clone, Default)]
pub struct HandlerTable {
    routes: HashMap<String, RouteFn>,
}

impl std::fmt::Debug for HandlerTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerTable")
            .field("message_types", &self.message_types())
            .finish()
    }
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route `message_type` to `handler`, replacing any previous route
    pub fn on<F, Fut>(mut self, message_type: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
    {
        let route: RouteFn = Arc::new(move |payload| handler(payload).boxed());
        self.routes.insert(message_type.into(), route);
        self
    }

    pub fn handles(&self, message_type: &str) -> bool {
        self.routes.contains_key(message_type)
    }

    /// Routed message types, sorted
    pub fn message_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.routes.keys().cloned().collect();
        types.sort();
        types
    }
}

#[async_trait]
impl ModuleHandler for HandlerTable {
    async fn handle(&self, message_type: &str, payload: Value) -> Result<Value, HandlerError> {
        match self.routes.get(message_type) {
            Some(route) => route(payload).await,
            None => Err(HandlerError::UnknownMessageType(message_type.to_string())),
        }
    }
}
