//! # Migration Manager
//!
//! Executes ledger paths for a module and keeps its version pointer honest.
//!
//! ## Run lifecycle
//!
//! ```text
//! plan path ──► apply units in order ──► all ok ──► commit {run record, version pointer}
//!                      │
//!                 first failure
//!                      │
//!                      ▼
//!       compensate applied units in reverse ──► all ok ──► run `failed`
//!                                              │
//!                                     any compensation failed
//!                                              │
//!                                              ▼
//!                            run `rollback_incomplete`, module needs intervention
//! ```
//!
//! The run record and the module's version pointer are written in a single
//! `DocumentStore::commit` batch, so a pointer never moves without its run
//! record and never moves for a run that did not finish. If that batch cannot
//! be committed after the units ran, the units are compensated as if one of them
//! had failed and the run is recorded `failed` (or `rollback_incomplete`).
//! Runs for the same module are serialized.

use super::errors::{ChangeUnitError, MigrationError, MigrationResult};
use super::ledger::{LedgerEntry, MigrationEdge, MigrationLedger, MigrationPath};
use super::unit::ChangeUnit;
use crate::clock::SharedClock;
use crate::constants::collections;
use crate::registry::{ModuleRegistry, ModuleVersion, RegisteredModule};
use crate::store::{DocumentFilter, DocumentStore, StoreError, WriteOperation};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::instrument;
use uuid::Uuid;

const POINTER_COMMIT_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationDirection {
    Upgrade,
    Rollback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationRunStatus {
    Applied,
    Failed,
    RolledBack,
    RollbackIncomplete,
}

impl MigrationRunStatus {
    /// Runs an operator should look at
    pub fn is_problem(&self) -> bool {
        matches!(self, Self::Failed | Self::RollbackIncomplete)
    }
}

impl fmt::Display for MigrationRunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Applied => write!(f, "applied"),
            Self::Failed => write!(f, "failed"),
            Self::RolledBack => write!(f, "rolled_back"),
            Self::RollbackIncomplete => write!(f, "rollback_incomplete"),
        }
    }
}

/// Where a ledger edge stands for its module
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationStatus {
    Pending,
    Applied,
    RolledBack,
    Failed,
}

impl fmt::Display for MigrationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Applied => write!(f, "applied"),
            Self::RolledBack => write!(f, "rolled_back"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// A ledger edge with its current status
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EdgeStatus {
    pub edge: MigrationEdge,
    pub status: MigrationStatus,
}

/// Audit record of one migration or rollback run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationRun {
    pub id: Uuid,
    pub module: String,
    pub direction: MigrationDirection,
    pub from_version: ModuleVersion,
    pub to_version: ModuleVersion,
    pub status: MigrationRunStatus,
    pub edges: Vec<String>,
    pub applied_units: Vec<String>,
    pub compensated_units: Vec<String>,
    pub failed_unit: Option<String>,
    pub compensation_failures: Vec<String>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

pub struct MigrationManager {
    store: Arc<dyn DocumentStore>,
    registry: Arc<ModuleRegistry>,
    clock: SharedClock,
    ledger: MigrationLedger,
    module_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl fmt::Debug for MigrationManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MigrationManager")
            .field("active_module_locks", &self.module_locks.len())
            .finish()
    }
}

impl MigrationManager {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        registry: Arc<ModuleRegistry>,
        clock: SharedClock,
    ) -> Self {
        Self {
            store,
            registry,
            clock,
            ledger: MigrationLedger::new(),
            module_locks: DashMap::new(),
        }
    }

    /// Append a ledger edge without executing it
    #[instrument(skip(self, description, units))]
    pub async fn create_migration(
        &self,
        module: &str,
        from_version: &str,
        to_version: &str,
        description: &str,
        units: Vec<Arc<dyn ChangeUnit>>,
    ) -> MigrationResult<MigrationEdge> {
        if !self.registry.contains(module) {
            return Err(MigrationError::module_not_found(module));
        }
        let from = parse_version(module, from_version)?;
        let to = parse_version(module, to_version)?;
        if to <= from {
            return Err(MigrationError::invalid(
                module,
                format!("target version {to} must be newer than {from}"),
            ));
        }
        if units.is_empty() {
            return Err(MigrationError::invalid(module, "a migration needs at least one unit"));
        }
        let mut seen = HashSet::with_capacity(units.len());
        for unit in &units {
            if !seen.insert(unit.id().to_string()) {
                return Err(MigrationError::invalid(
                    module,
                    format!("unit id '{}' appears twice", unit.id()),
                ));
            }
        }

        let edge = MigrationEdge {
            id: MigrationEdge::edge_id(module, &from, &to),
            module: module.to_string(),
            from_version: from.clone(),
            to_version: to,
            description: description.to_string(),
            unit_ids: units.iter().map(|u| u.id().to_string()).collect(),
            created_at: self.clock.now(),
        };
        self.ledger.add(LedgerEntry {
            edge: edge.clone(),
            units,
        })?;

        let persisted = match serde_json::to_value(&edge) {
            Ok(body) => self
                .store
                .upsert(collections::MIGRATIONS, &edge.id, body)
                .await
                .map(|_| ()),
            Err(error) => Err(StoreError::from(error)),
        };
        if let Err(error) = persisted {
            self.ledger.remove(module, &from);
            return Err(error.into());
        }

        crate::log_migration!(info, "Migration created",
            module: module,
            edge: edge.id,
            units: edge.unit_ids.len()
        );
        Ok(edge)
    }

    /// Ordered edges from `from_version` to `to_version`
    pub fn get_migration_path(
        &self,
        module: &str,
        from_version: &str,
        to_version: &str,
    ) -> MigrationResult<MigrationPath> {
        let from = parse_version(module, from_version)?;
        let to = parse_version(module, to_version)?;
        let edges = self
            .ledger
            .plan(module, &from, &to)?
            .into_iter()
            .map(|entry| entry.edge)
            .collect();
        Ok(MigrationPath {
            module: module.to_string(),
            from_version: from,
            to_version: to,
            edges,
        })
    }

    /// Move `module` forward to `to_version`.
    ///
    /// Fails with `UnitFailed` after compensating the units this run applied,
    /// or `RollbackIncomplete` when a compensation also failed.
    #[instrument(skip(self))]
    pub async fn run_migrations(
        &self,
        module: &str,
        to_version: &str,
    ) -> MigrationResult<MigrationRun> {
        let lock = self.module_lock(module);
        let _guard = lock.lock().await;

        let current = self.ready_module(module).await?;
        let to = parse_version(module, to_version)?;
        let plan = self.ledger.plan(module, &current.version, &to)?;
        let started_at = self.clock.now();
        let mut run = self.new_run(
            module,
            MigrationDirection::Upgrade,
            &current.version,
            &to,
            &plan,
            started_at,
        );

        if plan.is_empty() {
            crate::log_migration!(info, "Module already at target version",
                module: module,
                version: to.to_string()
            );
            return Ok(run);
        }

        let mut applied: Vec<Arc<dyn ChangeUnit>> = Vec::new();
        let mut failure: Option<(String, ChangeUnitError)> = None;
        'edges: for entry in &plan {
            for unit in &entry.units {
                match unit.apply().await {
                    Ok(()) => {
                        crate::log_migration!(debug, "Unit applied",
                            module: module,
                            run_id: run.id,
                            unit: unit.id()
                        );
                        run.applied_units.push(unit.id().to_string());
                        applied.push(Arc::clone(unit));
                    }
                    Err(error) => {
                        failure = Some((unit.id().to_string(), error));
                        break 'edges;
                    }
                }
            }
        }

        let Some((failed_unit, error)) = failure else {
            run.status = MigrationRunStatus::Applied;
            run.finished_at = self.clock.now();
            if let Err(error) = self.commit_with_pointer(&run, &to).await {
                applied.reverse();
                return Err(self.abandon_upgrade(run, &applied, error).await);
            }
            crate::log_migration!(info, "Migration run applied",
                module: module,
                run_id: run.id,
                from: run.from_version.to_string(),
                to: run.to_version.to_string(),
                units: run.applied_units.len()
            );
            return Ok(run);
        };

        crate::log_migration!(warn, "Unit failed, compensating applied units",
            module: module,
            run_id: run.id,
            unit: failed_unit,
            error: error.to_string()
        );
        run.failed_unit = Some(failed_unit.clone());
        run.error = Some(error.to_string());
        applied.reverse();
        self.compensate(&mut run, &applied).await;

        if run.compensation_failures.is_empty() {
            run.status = MigrationRunStatus::Failed;
            run.finished_at = self.clock.now();
            self.record_run(&run).await?;
            return Err(MigrationError::UnitFailed {
                module: module.to_string(),
                run_id: run.id,
                unit_id: failed_unit,
                error: error.to_string(),
            });
        }

        Err(self.rollback_incomplete(run).await)
    }

    /// Move `module` back to `to_version` by compensating every unit on the
    /// path in reverse order
    #[instrument(skip(self))]
    pub async fn rollback_migrations(
        &self,
        module: &str,
        to_version: &str,
    ) -> MigrationResult<MigrationRun> {
        let lock = self.module_lock(module);
        let _guard = lock.lock().await;

        let current = self.ready_module(module).await?;
        let to = parse_version(module, to_version)?;
        if to > current.version {
            return Err(MigrationError::no_path(
                module,
                &current.version,
                &to,
                "rollback target is newer than the current version",
            ));
        }
        let plan = self.ledger.plan(module, &to, &current.version)?;
        let started_at = self.clock.now();
        let mut run = self.new_run(
            module,
            MigrationDirection::Rollback,
            &current.version,
            &to,
            &plan,
            started_at,
        );
        if plan.is_empty() {
            return Ok(run);
        }

        let units: Vec<Arc<dyn ChangeUnit>> = plan
            .iter()
            .rev()
            .flat_map(|entry| entry.units.iter().rev().cloned())
            .collect();
        self.compensate(&mut run, &units).await;

        if !run.compensation_failures.is_empty() {
            return Err(self.rollback_incomplete(run).await);
        }

        run.status = MigrationRunStatus::RolledBack;
        run.finished_at = self.clock.now();
        if let Err(error) = self.commit_with_pointer(&run, &to).await {
            return Err(self.abandon_rollback(run, error).await);
        }
        crate::log_migration!(info, "Module rolled back",
            module: module,
            run_id: run.id,
            from: run.from_version.to_string(),
            to: run.to_version.to_string()
        );
        Ok(run)
    }

    /// Runs of `module`, oldest first
    pub async fn runs(&self, module: &str) -> MigrationResult<Vec<MigrationRun>> {
        self.select_runs(DocumentFilter::new().field_eq("module", module))
            .await
    }

    /// Failed and incomplete runs across all modules, oldest first
    pub async fn failed_runs(&self) -> MigrationResult<Vec<MigrationRun>> {
        let mut runs = self.select_runs(DocumentFilter::new()).await?;
        runs.retain(|run| run.status.is_problem());
        Ok(runs)
    }

    /// Ledger edges of `module` ordered by source version
    pub fn ledger(&self, module: &str) -> Vec<MigrationEdge> {
        self.ledger.edges(module)
    }

    /// Ledger edges of `module` with their status.
    ///
    /// An edge at or below the module's current version is applied. Otherwise
    /// the most recent run that covered it decides: a failed or incomplete run
    /// makes it failed, a rollback makes it rolled back, anything else pending.
    pub async fn migration_status(&self, module: &str) -> MigrationResult<Vec<EdgeStatus>> {
        let current = self
            .registry
            .version_of(module)
            .ok_or_else(|| MigrationError::module_not_found(module))?;
        let runs = self.runs(module).await?;

        Ok(self
            .ledger
            .edges(module)
            .into_iter()
            .map(|edge| {
                let status = if edge.to_version <= current {
                    MigrationStatus::Applied
                } else {
                    match runs.iter().rev().find(|run| run.edges.contains(&edge.id)) {
                        Some(run) if run.status.is_problem() => MigrationStatus::Failed,
                        Some(run) if run.status == MigrationRunStatus::RolledBack => {
                            MigrationStatus::RolledBack
                        }
                        _ => MigrationStatus::Pending,
                    }
                };
                EdgeStatus { edge, status }
            })
            .collect())
    }

    fn module_lock(&self, module: &str) -> Arc<Mutex<()>> {
        Arc::clone(
            self.module_locks
                .entry(module.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .value(),
        )
    }

    async fn ready_module(&self, module: &str) -> MigrationResult<RegisteredModule> {
        let current = self
            .registry
            .refresh(module)
            .await?
            .ok_or_else(|| MigrationError::module_not_found(module))?;
        if current.needs_intervention() {
            return Err(MigrationError::NeedsIntervention {
                module: module.to_string(),
                reason: current
                    .status_reason
                    .clone()
                    .unwrap_or_else(|| "flagged by an earlier run".to_string()),
            });
        }
        Ok(current)
    }

    fn new_run(
        &self,
        module: &str,
        direction: MigrationDirection,
        from: &ModuleVersion,
        to: &ModuleVersion,
        plan: &[LedgerEntry],
        started_at: DateTime<Utc>,
    ) -> MigrationRun {
        MigrationRun {
            id: Uuid::new_v4(),
            module: module.to_string(),
            direction,
            from_version: from.clone(),
            to_version: to.clone(),
            status: match direction {
                MigrationDirection::Upgrade => MigrationRunStatus::Applied,
                MigrationDirection::Rollback => MigrationRunStatus::RolledBack,
            },
            edges: plan.iter().map(|e| e.edge.id.clone()).collect(),
            applied_units: Vec::new(),
            compensated_units: Vec::new(),
            failed_unit: None,
            compensation_failures: Vec::new(),
            error: None,
            started_at,
            finished_at: started_at,
        }
    }

    /// Best-effort: every unit is attempted even after a compensation fails
    async fn compensate(&self, run: &mut MigrationRun, units: &[Arc<dyn ChangeUnit>]) {
        for unit in units {
            match unit.compensate().await {
                Ok(()) => run.compensated_units.push(unit.id().to_string()),
                Err(error) => {
                    crate::log_migration!(error, "Compensation failed",
                        module: run.module,
                        run_id: run.id,
                        unit: unit.id(),
                        error: error.to_string()
                    );
                    run.compensation_failures.push(unit.id().to_string());
                }
            }
        }
    }

    async fn rollback_incomplete(&self, mut run: MigrationRun) -> MigrationError {
        run.status = MigrationRunStatus::RollbackIncomplete;
        run.finished_at = self.clock.now();
        let reason = format!(
            "run {} could not compensate units {:?}",
            run.id, run.compensation_failures
        );
        if let Err(error) = self.record_run(&run).await {
            crate::log_migration!(error, "Could not record incomplete rollback",
                module: run.module,
                run_id: run.id,
                error: error.to_string()
            );
        }
        self.flag_for_intervention(&run.module, reason).await;
        MigrationError::RollbackIncomplete {
            module: run.module,
            run_id: run.id,
            failed_units: run.compensation_failures,
        }
    }

    /// Units of an upgrade ran but the pointer did not move. Undo them so the
    /// stored version still describes the module.
    async fn abandon_upgrade(
        &self,
        mut run: MigrationRun,
        applied: &[Arc<dyn ChangeUnit>],
        cause: MigrationError,
    ) -> MigrationError {
        crate::log_migration!(error, "Version pointer commit failed, compensating applied units",
            module: run.module,
            run_id: run.id,
            error: cause.to_string()
        );
        run.error = Some(format!("version pointer commit failed: {cause}"));
        self.compensate(&mut run, applied).await;
        if !run.compensation_failures.is_empty() {
            return self.rollback_incomplete(run).await;
        }

        run.status = MigrationRunStatus::Failed;
        run.finished_at = self.clock.now();
        if let Err(error) = self.record_run(&run).await {
            crate::log_migration!(error, "Could not record compensated run",
                module: run.module,
                run_id: run.id,
                error: error.to_string()
            );
            let reason = format!(
                "run {} was compensated after a failed pointer commit but left no record",
                run.id
            );
            self.flag_for_intervention(&run.module, reason).await;
        }
        MigrationError::CommitFailed {
            module: run.module,
            run_id: run.id,
            error: cause.to_string(),
        }
    }

    /// Units of a rollback were compensated but the pointer did not move back.
    async fn abandon_rollback(
        &self,
        mut run: MigrationRun,
        cause: MigrationError,
    ) -> MigrationError {
        run.status = MigrationRunStatus::RollbackIncomplete;
        run.error = Some(format!("version pointer commit failed: {cause}"));
        run.finished_at = self.clock.now();
        if let Err(error) = self.record_run(&run).await {
            crate::log_migration!(error, "Could not record incomplete rollback",
                module: run.module,
                run_id: run.id,
                error: error.to_string()
            );
        }
        let reason = format!(
            "run {} compensated every unit down to {} but the version pointer was not moved",
            run.id, run.to_version
        );
        self.flag_for_intervention(&run.module, reason).await;
        MigrationError::CommitFailed {
            module: run.module,
            run_id: run.id,
            error: cause.to_string(),
        }
    }

    async fn flag_for_intervention(&self, module: &str, reason: String) {
        if let Err(error) = self.registry.mark_needs_intervention(module, reason).await {
            crate::log_migration!(error, "Could not flag module for intervention",
                module: module,
                error: error.to_string()
            );
        }
    }

    async fn record_run(&self, run: &MigrationRun) -> MigrationResult<()> {
        let body = serde_json::to_value(run).map_err(StoreError::from)?;
        self.store
            .insert(collections::MIGRATION_RUNS, &run.id.to_string(), body)
            .await?;
        Ok(())
    }

    /// Write the run record and move the version pointer in one batch
    async fn commit_with_pointer(
        &self,
        run: &MigrationRun,
        to: &ModuleVersion,
    ) -> MigrationResult<()> {
        let run_body = serde_json::to_value(run).map_err(StoreError::from)?;
        let mut attempt = 0;
        loop {
            attempt += 1;
            let document = self
                .store
                .get(collections::MODULES, &run.module)
                .await?
                .ok_or_else(|| MigrationError::module_not_found(&run.module))?;
            let mut module: RegisteredModule = document.decode()?;
            module.version = to.clone();
            module.updated_at = run.finished_at;
            let module_body = serde_json::to_value(&module).map_err(StoreError::from)?;

            let batch = vec![
                WriteOperation::Insert {
                    collection: collections::MIGRATION_RUNS.to_string(),
                    key: run.id.to_string(),
                    body: run_body.clone(),
                },
                WriteOperation::UpdateWhere {
                    collection: collections::MODULES.to_string(),
                    key: run.module.clone(),
                    expected_version: document.version,
                    body: module_body,
                },
            ];
            match self.store.commit(batch).await {
                Ok(()) => break,
                // The registry rewrote the module record between read and commit
                Err(StoreError::PredicateFailed { .. }) if attempt < POINTER_COMMIT_ATTEMPTS => {
                    continue
                }
                Err(error) => return Err(error.into()),
            }
        }
        if let Err(error) = self.registry.refresh(&run.module).await {
            crate::log_migration!(warn, "Registry cache not refreshed after commit",
                module: run.module,
                error: error.to_string()
            );
        }
        Ok(())
    }

    async fn select_runs(&self, filter: DocumentFilter) -> MigrationResult<Vec<MigrationRun>> {
        let documents = self
            .store
            .select(collections::MIGRATION_RUNS, &filter)
            .await?;
        let mut runs = Vec::with_capacity(documents.len());
        for document in &documents {
            runs.push(document.decode::<MigrationRun>()?);
        }
        runs.sort_by(|a, b| a.started_at.cmp(&b.started_at).then(a.id.cmp(&b.id)));
        Ok(runs)
    }
}

fn parse_version(module: &str, version: &str) -> MigrationResult<ModuleVersion> {
    version
        .parse()
        .map_err(|_| MigrationError::invalid(module, format!("invalid version '{version}'")))
}
