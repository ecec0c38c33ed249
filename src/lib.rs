#![allow(clippy::doc_markdown)] // Allow technical terms like PostgreSQL, JSONB in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # ModHub Core
//!
//! Orchestration layer for independently developed domain modules (permits,
//! licenses, benefits, inspections and the like).
//!
//! ## Overview
//!
//! Domain modules stay small and boring. Everything that spans modules lives
//! here: who may talk to whom, how messages get delivered, which entities are
//! shared and how concurrent edits are resolved, how multi-module workflows
//! move forward, and how a module's schema evolves without tearing.
//!
//! ## Architecture
//!
//! ```text
//! ModuleRegistry ◄──── dependency policy ──── MessageBus ◄──── WorkflowEngine
//!       ▲                                          ▲                 ▲
//!       │ version pointer                          │ notifications   │ SLA sweep
//!       │                                          │                 │
//! MigrationManager                        SharedModelRegistry    SlaMonitor
//!       │                                          │                 │
//!       └────────────────── DocumentStore ─────────┴─────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! - [`registry`] - Module registration, versions and dependency checks
//! - [`messaging`] - Message bus, handlers, retry and dead letters
//! - [`shared_model`] - Shared schemas and optimistically versioned records
//! - [`workflow`] - Templates, instances, step execution and SLA escalation
//! - [`migration`] - Migration ledger, runs and rollbacks
//! - [`store`] - Persistence boundary (in-memory and PostgreSQL)
//! - [`context`] - Explicit owner of all subsystems and background tasks
//! - [`diagnostics`] - Operator views of things needing attention
//! - [`config`] - YAML + environment configuration
//! - [`error`] - Top-level error type
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use modhub_core::config::ConfigManager;
//! use modhub_core::context::OrchestrationContext;
//! use modhub_core::messaging::HandlerTable;
//! use modhub_core::registry::ModuleDescriptor;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ConfigManager::load()?;
//! let ctx = OrchestrationContext::from_config(config).await?;
//!
//! let handler = HandlerTable::new().on("invoice_paid", |payload| async move { Ok(payload) });
//! ctx.install_module(ModuleDescriptor::new("Billing", "1.0"), Arc::new(handler))
//!     .await?;
//! ctx.start();
//!
//! // ... run the application ...
//!
//! ctx.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod clock;
pub mod config;
pub mod constants;
pub mod context;
pub mod diagnostics;
pub mod error;
pub mod logging;
pub mod messaging;
pub mod migration;
pub mod registry;
pub mod shared_model;
pub mod store;
pub mod workflow;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::{ConfigManager, ConfigurationError, ModHubConfig};
pub use context::OrchestrationContext;
pub use error::{ModHubError, Result};
pub use messaging::{
    DeliveryError, HandlerError, HandlerTable, MessageBus, MessageSource, ModuleHandler,
    SendOptions,
};
pub use migration::{ChangeUnit, FnChangeUnit, MigrationError, MigrationManager};
pub use registry::{ModuleDescriptor, ModuleRegistry, RegistrationError};
pub use shared_model::{
    ConflictError, FieldSpec, SharedModelError, SharedModelRegistry, ValidationError,
};
pub use store::{DocumentStore, InMemoryDocumentStore, StoreError};
pub use workflow::{Step, StepInput, WorkflowEngine, WorkflowError, WorkflowTemplate};
