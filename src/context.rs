//! # Orchestration Context
//!
//! Explicitly constructed owner of every orchestration subsystem and the
//! background tasks that drive them. There are no process-wide singletons;
//! tests and embedders build as many contexts as they need.
//!
//! ## Lifecycle
//!
//! ```text
//! new / from_config ──► restore (optional) ──► start ──► ... ──► shutdown
//!                                                │                   │
//!                                   bus workers, message GC,   stop accepting sends,
//!                                   SLA sweep                  drain, stop tasks
//! ```

use crate::clock::{SharedClock, SystemClock};
use crate::config::{ConfigManager, ConfigurationError, ModHubConfig, PersistenceBackend};
use crate::diagnostics::Diagnostics;
use crate::error::Result;
use crate::messaging::{MessageBus, ModuleHandler};
use crate::migration::MigrationManager;
use crate::registry::{ModuleDescriptor, ModuleRegistry, RegisteredModule};
use crate::shared_model::SharedModelRegistry;
use crate::store::{DocumentStore, InMemoryDocumentStore};
use crate::workflow::{SlaMonitor, WorkflowEngine};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub struct OrchestrationContext {
    config: Arc<ConfigManager>,
    store: Arc<dyn DocumentStore>,
    clock: SharedClock,
    registry: Arc<ModuleRegistry>,
    bus: MessageBus,
    shared_models: Arc<SharedModelRegistry>,
    workflows: Arc<WorkflowEngine>,
    migrations: Arc<MigrationManager>,
    sla_monitor: SlaMonitor,
    shutdown: broadcast::Sender<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    running: AtomicBool,
}

impl fmt::Debug for OrchestrationContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OrchestrationContext")
            .field("environment", &self.config.environment())
            .field("running", &self.running.load(Ordering::Acquire))
            .field("background_tasks", &self.tasks.lock().len())
            .finish()
    }
}

impl OrchestrationContext {
    /// Wire every subsystem over the given store and clock
    pub fn new(
        config: Arc<ConfigManager>,
        store: Arc<dyn DocumentStore>,
        clock: SharedClock,
    ) -> Self {
        let settings: &ModHubConfig = config.config();
        let registry = Arc::new(ModuleRegistry::new(
            Arc::clone(&store),
            settings.registry.clone(),
        ));
        let bus = MessageBus::new(
            Arc::clone(&registry),
            Arc::clone(&store),
            Arc::clone(&clock),
            settings.message_bus.clone(),
        );
        let shared_models = Arc::new(SharedModelRegistry::new(
            Arc::clone(&store),
            Arc::clone(&registry),
            bus.clone(),
            Arc::clone(&clock),
        ));
        let workflows = Arc::new(WorkflowEngine::new(
            Arc::clone(&store),
            bus.clone(),
            Arc::clone(&clock),
            settings.workflow.clone(),
        ));
        let migrations = Arc::new(MigrationManager::new(
            Arc::clone(&store),
            Arc::clone(&registry),
            Arc::clone(&clock),
        ));
        let sla_monitor = SlaMonitor::new(Arc::clone(&workflows));
        let (shutdown, _) = broadcast::channel(1);

        Self {
            config,
            store,
            clock,
            registry,
            bus,
            shared_models,
            workflows,
            migrations,
            sla_monitor,
            shutdown,
            tasks: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
        }
    }

    /// Build a context with the persistence backend named in configuration
    pub async fn from_config(config: Arc<ConfigManager>) -> Result<Self> {
        crate::logging::init_tracing();
        let persistence = &config.config().persistence;
        let store: Arc<dyn DocumentStore> = match persistence.backend {
            PersistenceBackend::Memory => Arc::new(InMemoryDocumentStore::new()),
            PersistenceBackend::Postgres => Self::connect_postgres(&config).await?,
        };
        info!(
            environment = %config.environment(),
            backend = ?persistence.backend,
            "Orchestration context created"
        );
        Ok(Self::new(config, store, Arc::new(SystemClock)))
    }

    #[cfg(feature = "postgres")]
    async fn connect_postgres(config: &ConfigManager) -> Result<Arc<dyn DocumentStore>> {
        let persistence = &config.config().persistence;
        let url = persistence.resolved_database_url().ok_or_else(|| {
            ConfigurationError::missing_required_field(
                "persistence.database_url",
                "postgres backend",
            )
        })?;
        let store =
            crate::store::PgDocumentStore::connect(&url, persistence.max_connections).await?;
        Ok(Arc::new(store))
    }

    #[cfg(not(feature = "postgres"))]
    async fn connect_postgres(_config: &ConfigManager) -> Result<Arc<dyn DocumentStore>> {
        Err(ConfigurationError::invalid_value(
            "persistence.backend",
            "postgres",
            "built without the `postgres` feature",
        )
        .into())
    }

    /// Reload registrations, schemas, templates and undelivered messages
    /// persisted by an earlier process
    pub async fn restore(&self) -> Result<()> {
        let modules = self.registry.load_from_store().await?;
        let models = self.shared_models.load_schemas().await?;
        let templates = self.workflows.load_templates().await?;
        let messages = self.bus.recover_queued().await?;
        info!(
            modules,
            models,
            templates,
            messages,
            "Orchestration state restored"
        );
        Ok(())
    }

    /// Register a module and attach its message handler
    pub async fn install_module(
        &self,
        descriptor: ModuleDescriptor,
        handler: Arc<dyn ModuleHandler>,
    ) -> Result<RegisteredModule> {
        let module = self.registry.register(descriptor).await?;
        self.bus.attach_handler(&module.name, handler);
        Ok(module)
    }

    /// Unregister a module that nothing depends on and detach its handler
    pub async fn uninstall_module(&self, name: &str) -> Result<RegisteredModule> {
        let module = self.registry.unregister(name).await?;
        self.bus.detach_handler(name);
        Ok(module)
    }

    /// Spawn bus workers, message GC and (when enabled) the SLA sweep.
    ///
    /// Calling `start` on a running context does nothing.
    pub fn start(&self) {
        if self.running.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut tasks = self.tasks.lock();
        tasks.extend(self.bus.start_workers(&self.shutdown));
        tasks.push(self.bus.start_gc_loop(&self.shutdown));
        if self.config.config().workflow.sla_sweep_enabled {
            tasks.push(self.sla_monitor.start(&self.shutdown));
        }
        info!(background_tasks = tasks.len(), "Orchestration context started");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Stop accepting sends, drain queued messages, then stop background tasks.
    ///
    /// Returns `true` when the bus drained before `shutdown.drain_timeout`.
    pub async fn shutdown(&self) -> bool {
        let drained = self
            .bus
            .drain(self.config.config().shutdown.drain_timeout())
            .await;

        let _ = self.shutdown.send(());
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for result in futures::future::join_all(tasks).await {
            if let Err(error) = result {
                warn!(error = %error, "Background task ended abnormally");
            }
        }
        self.running.store(false, Ordering::Release);
        info!(drained, "Orchestration context stopped");
        drained
    }

    pub fn diagnostics(&self) -> Diagnostics {
        Diagnostics::new(
            Arc::clone(&self.registry),
            self.bus.clone(),
            Arc::clone(&self.workflows),
            Arc::clone(&self.migrations),
            Arc::clone(&self.clock),
        )
    }

    pub fn config(&self) -> &ModHubConfig {
        self.config.config()
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    pub fn registry(&self) -> &Arc<ModuleRegistry> {
        &self.registry
    }

    pub fn bus(&self) -> &MessageBus {
        &self.bus
    }

    pub fn shared_models(&self) -> &Arc<SharedModelRegistry> {
        &self.shared_models
    }

    pub fn workflows(&self) -> &Arc<WorkflowEngine> {
        &self.workflows
    }

    pub fn migrations(&self) -> &Arc<MigrationManager> {
        &self.migrations
    }

    pub fn sla_monitor(&self) -> &SlaMonitor {
        &self.sla_monitor
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::{HandlerTable, SendOptions};
    use serde_json::json;

    fn context() -> OrchestrationContext {
        let config = ConfigManager::from_config(ModHubConfig::default(), "test").unwrap();
        OrchestrationContext::new(
            config,
            Arc::new(InMemoryDocumentStore::new()),
            Arc::new(SystemClock),
        )
    }

    #[tokio::test]
    async fn test_install_start_and_shutdown() {
        let ctx = context();
        ctx.install_module(
            ModuleDescriptor::new("Echo", "1.0"),
            Arc::new(HandlerTable::new().on("echo", |payload| async move { Ok(payload) })),
        )
        .await
        .unwrap();
        ctx.start();
        ctx.start();
        assert!(ctx.is_running());

        let receipt = ctx
            .bus()
            .send("Echo", "Echo", "echo", json!({"n": 1}), SendOptions::sync())
            .await
            .unwrap();
        assert_eq!(receipt.reply, Some(json!({"n": 1})));

        assert!(ctx.shutdown().await);
        assert!(!ctx.is_running());
        assert!(ctx.diagnostics().report().await.unwrap().is_clean());
    }

    #[tokio::test]
    async fn test_restore_reloads_registrations() {
        let ctx = context();
        ctx.registry()
            .register(ModuleDescriptor::new("Billing", "1.0"))
            .await
            .unwrap();

        let config = ConfigManager::from_config(ModHubConfig::default(), "test").unwrap();
        let second = OrchestrationContext::new(
            config,
            Arc::clone(ctx.store()),
            Arc::new(SystemClock),
        );
        assert!(!second.registry().contains("Billing"));
        second.restore().await.unwrap();
        assert!(second.registry().contains("Billing"));
    }
}
