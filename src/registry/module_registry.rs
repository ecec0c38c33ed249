//! # Module Registry
//!
//! Tracks registered modules, their versions, declared dependencies and status.
//!
//! ## Overview
//!
//! The registry is the source of truth the message bus consults on every send.
//! Lookups are synchronous and served from an in-process cache guarded by a
//! `parking_lot::RwLock`; every mutation is persisted to the `modules`
//! collection of the [`DocumentStore`] so a restarted process can
//! [`ModuleRegistry::load_from_store`].
//!
//! ## Dependency Policy
//!
//! A module that declares a non-empty dependency list only accepts messages from
//! the modules it names. An empty list accepts any sender unless
//! `registry.permissive_empty_dependencies` is switched off.
//!
//! ## Usage
//!
//! ```rust
//! use modhub_core::config::RegistryConfig;
//! use modhub_core::registry::{ModuleDescriptor, ModuleRegistry};
//! use modhub_core::store::InMemoryDocumentStore;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = ModuleRegistry::new(
//!     Arc::new(InMemoryDocumentStore::new()),
//!     RegistryConfig::default(),
//! );
//! registry.register(ModuleDescriptor::new("Billing", "1.0")).await?;
//! registry
//!     .register(ModuleDescriptor::new("Permits", "1.0").depends_on("Billing", ">=1.0"))
//!     .await?;
//!
//! assert!(registry.check_dependency_satisfied("Permits", "Billing"));
//! assert_eq!(registry.get_dependents("Billing"), vec!["Permits".to_string()]);
//! # Ok(())
//! # }
//! ```

use super::errors::{RegistrationError, RegistrationResult};
use super::version::{ModuleVersion, VersionConstraint};
use crate::config::RegistryConfig;
use crate::constants::collections;
use crate::store::{DocumentFilter, DocumentStore, StoreError};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

const STATUS_WRITE_ATTEMPTS: usize = 3;

/// What a module declares about itself at install time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleDescriptor {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub dependencies: Vec<DependencyDeclaration>,
    #[serde(default)]
    pub description: Option<String>,
}

/// A dependency as written by the module author, e.g. `("Billing", "^1.0")`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DependencyDeclaration {
    pub name: String,
    pub constraint: String,
}

impl ModuleDescriptor {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            dependencies: Vec::new(),
            description: None,
        }
    }

    pub fn depends_on(mut self, name: impl Into<String>, constraint: impl Into<String>) -> Self {
        self.dependencies.push(DependencyDeclaration {
            name: name.into(),
            constraint: constraint.into(),
        });
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleStatus {
    Registered,
    /// A rollback could not be completed; migrations are refused until cleared
    NeedsIntervention,
}

impl fmt::Display for ModuleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Registered => write!(f, "registered"),
            Self::NeedsIntervention => write!(f, "needs_intervention"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleDependency {
    pub name: String,
    pub constraint: VersionConstraint,
}

/// A module as tracked by the registry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisteredModule {
    pub name: String,
    pub version: ModuleVersion,
    pub dependencies: Vec<ModuleDependency>,
    pub description: Option<String>,
    pub status: ModuleStatus,
    pub status_reason: Option<String>,
    pub registered_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RegisteredModule {
    pub fn depends_on(&self, name: &str) -> bool {
        self.dependencies.iter().any(|d| d.name == name)
    }

    pub fn needs_intervention(&self) -> bool {
        self.status == ModuleStatus::NeedsIntervention
    }
}

pub struct ModuleRegistry {
    modules: RwLock<HashMap<String, RegisteredModule>>,
    store: Arc<dyn DocumentStore>,
    config: RegistryConfig,
}

impl fmt::Debug for ModuleRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleRegistry")
            .field("modules", &self.modules.read().len())
            .field("config", &self.config)
            .finish()
    }
}

impl ModuleRegistry {
    pub fn new(store: Arc<dyn DocumentStore>, config: RegistryConfig) -> Self {
        Self {
            modules: RwLock::new(HashMap::new()),
            store,
            config,
        }
    }

    /// Register a module after validating its descriptor and dependencies
    pub async fn register(
        &self,
        descriptor: ModuleDescriptor,
    ) -> RegistrationResult<RegisteredModule> {
        let (version, dependencies) = Self::parse_descriptor(&descriptor)?;
        let now = Utc::now();
        let module = RegisteredModule {
            name: descriptor.name.clone(),
            version,
            dependencies,
            description: descriptor.description,
            status: ModuleStatus::Registered,
            status_reason: None,
            registered_at: now,
            updated_at: now,
        };

        {
            let mut modules = self.modules.write();
            if modules.contains_key(&module.name) {
                return Err(RegistrationError::DuplicateName {
                    name: module.name.clone(),
                });
            }
            for dependency in &module.dependencies {
                let Some(registered) = modules.get(&dependency.name) else {
                    return Err(RegistrationError::dependency_unmet(
                        &module.name,
                        &dependency.name,
                        "dependency is not registered",
                    ));
                };
                if !dependency.constraint.matches(&registered.version) {
                    return Err(RegistrationError::dependency_unmet(
                        &module.name,
                        &dependency.name,
                        format!(
                            "registered version {} does not satisfy {}",
                            registered.version, dependency.constraint
                        ),
                    ));
                }
            }
            modules.insert(module.name.clone(), module.clone());
        }

        if let Err(error) = self.persist(&module).await {
            self.modules.write().remove(&module.name);
            return Err(error);
        }

        crate::log_registry!(info, "Module registered",
            module: module.name,
            version: module.version.to_string(),
            dependencies: module.dependencies.len()
        );
        Ok(module)
    }

    /// Remove a module nobody depends on
    pub async fn unregister(&self, name: &str) -> RegistrationResult<RegisteredModule> {
        let removed = {
            let mut modules = self.modules.write();
            if !modules.contains_key(name) {
                return Err(RegistrationError::not_found(name));
            }
            let mut dependents: Vec<String> = modules
                .values()
                .filter(|m| m.depends_on(name))
                .map(|m| m.name.clone())
                .collect();
            if !dependents.is_empty() {
                dependents.sort();
                return Err(RegistrationError::HasDependents {
                    name: name.to_string(),
                    dependents,
                });
            }
            modules.remove(name)
        };
        let Some(removed) = removed else {
            return Err(RegistrationError::not_found(name));
        };

        if let Err(error) = self.store.delete(collections::MODULES, name).await {
            self.modules.write().insert(name.to_string(), removed);
            return Err(error.into());
        }

        crate::log_registry!(info, "Module unregistered", module: name);
        Ok(removed)
    }

    pub fn get(&self, name: &str) -> Option<RegisteredModule> {
        self.modules.read().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.modules.read().contains_key(name)
    }

    /// All registered modules ordered by name
    pub fn list(&self) -> Vec<RegisteredModule> {
        let mut modules: Vec<RegisteredModule> = self.modules.read().values().cloned().collect();
        modules.sort_by(|a, b| a.name.cmp(&b.name));
        modules
    }

    pub fn version_of(&self, name: &str) -> Option<ModuleVersion> {
        self.modules.read().get(name).map(|m| m.version.clone())
    }

    /// Whether `sender` may message `target` under the dependency policy.
    ///
    /// Returns false when the target is not registered.
    pub fn check_dependency_satisfied(&self, target: &str, sender: &str) -> bool {
        let modules = self.modules.read();
        let Some(target) = modules.get(target) else {
            return false;
        };
        if target.dependencies.is_empty() {
            return self.config.permissive_empty_dependencies;
        }
        target.depends_on(sender)
    }

    /// Names of modules declaring `name` as a dependency, sorted
    pub fn get_dependents(&self, name: &str) -> Vec<String> {
        let mut dependents: Vec<String> = self
            .modules
            .read()
            .values()
            .filter(|m| m.depends_on(name))
            .map(|m| m.name.clone())
            .collect();
        dependents.sort();
        dependents
    }

    pub async fn mark_needs_intervention(
        &self,
        name: &str,
        reason: impl Into<String>,
    ) -> RegistrationResult<()> {
        let reason = reason.into();
        self.write_status(name, ModuleStatus::NeedsIntervention, Some(reason.clone()))
            .await?;
        crate::log_registry!(warn, "Module flagged for manual intervention",
            module: name,
            reason: reason
        );
        Ok(())
    }

    pub async fn clear_intervention(&self, name: &str) -> RegistrationResult<()> {
        self.write_status(name, ModuleStatus::Registered, None).await?;
        crate::log_registry!(info, "Module intervention cleared", module: name);
        Ok(())
    }

    /// Re-read one module from the store into the cache.
    ///
    /// Used after another subsystem changed the persisted record, such as a
    /// migration moving the version pointer.
    pub async fn refresh(&self, name: &str) -> RegistrationResult<Option<RegisteredModule>> {
        match self.store.get(collections::MODULES, name).await? {
            Some(document) => {
                let module: RegisteredModule = document.decode()?;
                self.modules.write().insert(name.to_string(), module.clone());
                crate::log_registry!(debug, "Module refreshed from store",
                    module: name,
                    version: module.version.to_string()
                );
                Ok(Some(module))
            }
            None => {
                self.modules.write().remove(name);
                Ok(None)
            }
        }
    }

    /// Populate the cache from previously persisted registrations
    pub async fn load_from_store(&self) -> RegistrationResult<usize> {
        let documents = self
            .store
            .select(collections::MODULES, &DocumentFilter::new())
            .await?;
        let mut loaded = HashMap::with_capacity(documents.len());
        for document in &documents {
            let module: RegisteredModule = document.decode()?;
            loaded.insert(module.name.clone(), module);
        }
        let count = loaded.len();
        *self.modules.write() = loaded;
        crate::log_registry!(info, "Registry loaded from store", module: "*", count: count);
        Ok(count)
    }

    /// Change the status on the stored record, guarded by its store version.
    ///
    /// The cached copy may lag behind the store (a migration moves the version
    /// pointer directly), so only the status fields of the stored record change.
    async fn write_status(
        &self,
        name: &str,
        status: ModuleStatus,
        reason: Option<String>,
    ) -> RegistrationResult<RegisteredModule> {
        let mut expected_version = 0;
        for _ in 0..STATUS_WRITE_ATTEMPTS {
            let document = self
                .store
                .get(collections::MODULES, name)
                .await?
                .ok_or_else(|| RegistrationError::not_found(name))?;
            let mut module: RegisteredModule = document.decode()?;
            module.status = status;
            module.status_reason = reason.clone();
            module.updated_at = Utc::now();
            let body = serde_json::to_value(&module).map_err(StoreError::from)?;

            expected_version = document.version;
            let updated = self
                .store
                .update_where(collections::MODULES, name, expected_version, body)
                .await?;
            if updated == 1 {
                self.modules.write().insert(name.to_string(), module.clone());
                return Ok(module);
            }
        }
        Err(StoreError::predicate_failed(collections::MODULES, name, expected_version).into())
    }

    async fn persist(&self, module: &RegisteredModule) -> RegistrationResult<()> {
        let body = serde_json::to_value(module).map_err(crate::store::StoreError::from)?;
        self.store
            .upsert(collections::MODULES, &module.name, body)
            .await?;
        Ok(())
    }

    fn parse_descriptor(
        descriptor: &ModuleDescriptor,
    ) -> RegistrationResult<(ModuleVersion, Vec<ModuleDependency>)> {
        let name = descriptor.name.trim();
        if name.is_empty() || name != descriptor.name || name.chars().any(char::is_whitespace) {
            return Err(RegistrationError::invalid_descriptor(
                &descriptor.name,
                "module name must be non-empty and contain no whitespace",
            ));
        }

        let version = descriptor
            .version
            .parse::<ModuleVersion>()
            .map_err(|e| RegistrationError::invalid_descriptor(name, e))?;

        let mut seen = HashSet::new();
        let mut dependencies = Vec::with_capacity(descriptor.dependencies.len());
        for declaration in &descriptor.dependencies {
            if declaration.name == name {
                return Err(RegistrationError::invalid_descriptor(
                    name,
                    "a module cannot depend on itself",
                ));
            }
            if !seen.insert(declaration.name.as_str()) {
                return Err(RegistrationError::invalid_descriptor(
                    name,
                    format!("dependency '{}' declared twice", declaration.name),
                ));
            }
            let constraint = declaration
                .constraint
                .parse::<VersionConstraint>()
                .map_err(|e| RegistrationError::invalid_descriptor(name, e))?;
            dependencies.push(ModuleDependency {
                name: declaration.name.clone(),
                constraint,
            });
        }

        Ok((version, dependencies))
    }
}
