//! Change units: the ordered, individually compensable steps of a migration.

use super::errors::ChangeUnitError;
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// One atomic change moving a module's schema or data forward.
///
/// `compensate` undoes `apply`. It is only called for units whose `apply`
/// succeeded and is never retried automatically.
#[async_trait]
pub trait ChangeUnit: Send + Sync {
    fn id(&self) -> &str;

    async fn apply(&self) -> Result<(), ChangeUnitError>;

    async fn compensate(&self) -> Result<(), ChangeUnitError>;
}

type UnitFn = Arc<dyn Fn() -> BoxFuture<'static, Result<(), ChangeUnitError>> + Send + Sync>;

/// [`ChangeUnit`] built from a pair of async closures
#[derive(Clone)]
pub struct FnChangeUnit {
    id: String,
    apply: UnitFn,
    compensate: UnitFn,
}

impl FnChangeUnit {
    pub fn new<A, AF, C, CF>(id: impl Into<String>, apply: A, compensate: C) -> Self
    where
        A: Fn() -> AF + Send + Sync + 'static,
        AF: Future<Output = Result<(), ChangeUnitError>> + Send + 'static,
        C: Fn() -> CF + Send + Sync + 'static,
        CF: Future<Output = Result<(), ChangeUnitError>> + Send + 'static,
    {
        Self {
            id: id.into(),
            apply: Arc::new(move || apply().boxed()),
            compensate: Arc::new(move || compensate().boxed()),
        }
    }

    pub fn into_arc(self) -> Arc<dyn ChangeUnit> {
        Arc::new(self)
    }
}

impl fmt::Debug for FnChangeUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnChangeUnit").field("id", &self.id).finish()
    }
}

#[async_trait]
impl ChangeUnit for FnChangeUnit {
    fn id(&self) -> &str {
        &self.id
    }

    async fn apply(&self) -> Result<(), ChangeUnitError> {
        (self.apply)().await
    }

    async fn compensate(&self) -> Result<(), ChangeUnitError> {
        (self.compensate)().await
    }
}
