//! # Migration Ledger
//!
//! Per-module chains of `from -> to` edges. Each version has at most one
//! outgoing edge, so a path between two versions is unique and walking it is
//! deterministic.

use super::errors::{MigrationError, MigrationResult};
use super::unit::ChangeUnit;
use crate::registry::ModuleVersion;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Persisted description of one ledger edge
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationEdge {
    pub id: String,
    pub module: String,
    pub from_version: ModuleVersion,
    pub to_version: ModuleVersion,
    pub description: String,
    pub unit_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl MigrationEdge {
    pub fn edge_id(module: &str, from: &ModuleVersion, to: &ModuleVersion) -> String {
        format!("{module}:{from}->{to}")
    }
}

/// Ordered edges between two versions of one module
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MigrationPath {
    pub module: String,
    pub from_version: ModuleVersion,
    pub to_version: ModuleVersion,
    pub edges: Vec<MigrationEdge>,
}

impl MigrationPath {
    /// Unit ids in execution order
    pub fn unit_ids(&self) -> Vec<&str> {
        self.edges
            .iter()
            .flat_map(|e| e.unit_ids.iter().map(String::as_str))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }
}

#[derive(Clone)]
pub(crate) struct LedgerEntry {
    pub(crate) edge: MigrationEdge,
    pub(crate) units: Vec<Arc<dyn ChangeUnit>>,
}

#[derive(Default)]
pub(crate) struct MigrationLedger {
    modules: RwLock<HashMap<String, BTreeMap<ModuleVersion, LedgerEntry>>>,
}

impl MigrationLedger {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add(&self, entry: LedgerEntry) -> MigrationResult<()> {
        let mut modules = self.modules.write();
        let chain = modules.entry(entry.edge.module.clone()).or_default();
        if chain.contains_key(&entry.edge.from_version) {
            return Err(MigrationError::DuplicateEdge {
                module: entry.edge.module.clone(),
                from: entry.edge.from_version.to_string(),
            });
        }
        chain.insert(entry.edge.from_version.clone(), entry);
        Ok(())
    }

    pub(crate) fn remove(&self, module: &str, from: &ModuleVersion) {
        if let Some(chain) = self.modules.write().get_mut(module) {
            chain.remove(from);
        }
    }

    /// Edges of `module` ordered by source version
    pub(crate) fn edges(&self, module: &str) -> Vec<MigrationEdge> {
        self.modules
            .read()
            .get(module)
            .map(|chain| chain.values().map(|e| e.edge.clone()).collect())
            .unwrap_or_default()
    }

    /// Walk the chain from `from` until `to`
    pub(crate) fn plan(
        &self,
        module: &str,
        from: &ModuleVersion,
        to: &ModuleVersion,
    ) -> MigrationResult<Vec<LedgerEntry>> {
        if from == to {
            return Ok(Vec::new());
        }
        if to < from {
            return Err(MigrationError::no_path(
                module,
                from,
                to,
                "target precedes source; migrations only move forward",
            ));
        }

        let modules = self.modules.read();
        let Some(chain) = modules.get(module) else {
            return Err(MigrationError::no_path(module, from, to, "module has no migrations"));
        };

        let mut steps = Vec::new();
        let mut current = from.clone();
        while &current != to {
            let Some(entry) = chain.get(&current) else {
                return Err(MigrationError::no_path(
                    module,
                    from,
                    to,
                    format!("no migration from {current}"),
                ));
            };
            if &entry.edge.to_version > to {
                return Err(MigrationError::no_path(
                    module,
                    from,
                    to,
                    format!(
                        "migration from {current} jumps past the target to {}",
                        entry.edge.to_version
                    ),
                ));
            }
            current = entry.edge.to_version.clone();
            steps.push(entry.clone());
        }
        Ok(steps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::unit::FnChangeUnit;

    fn v(s: &str) -> ModuleVersion {
        s.parse().unwrap()
    }

    fn entry(module: &str, from: &str, to: &str) -> LedgerEntry {
        let unit = FnChangeUnit::new(
            format!("{from}-{to}"),
            || async { Ok(()) },
            || async { Ok(()) },
        );
        LedgerEntry {
            edge: MigrationEdge {
                id: MigrationEdge::edge_id(module, &v(from), &v(to)),
                module: module.to_string(),
                from_version: v(from),
                to_version: v(to),
                description: String::new(),
                unit_ids: vec![format!("{from}-{to}")],
                created_at: Utc::now(),
            },
            units: vec![unit.into_arc()],
        }
    }

    fn plan_ids(ledger: &MigrationLedger, from: &str, to: &str) -> MigrationResult<Vec<String>> {
        ledger
            .plan("Billing", &v(from), &v(to))
            .map(|steps| steps.into_iter().map(|s| s.edge.id).collect())
    }

    #[test]
    fn test_plan_walks_chain_in_order() {
        let ledger = MigrationLedger::new();
        ledger.add(entry("Billing", "1.1", "1.2")).unwrap();
        ledger.add(entry("Billing", "1.0", "1.1")).unwrap();

        assert_eq!(
            plan_ids(&ledger, "1.0", "1.2").unwrap(),
            vec!["Billing:1.0->1.1", "Billing:1.1->1.2"]
        );
        assert_eq!(plan_ids(&ledger, "1.1", "1.2").unwrap().len(), 1);
        assert!(plan_ids(&ledger, "1.2", "1.2").unwrap().is_empty());
    }

    #[test]
    fn test_broken_chain_and_backwards_target() {
        let ledger = MigrationLedger::new();
        ledger.add(entry("Billing", "1.0", "1.1")).unwrap();
        ledger.add(entry("Billing", "1.2", "1.3")).unwrap();

        assert!(matches!(
            plan_ids(&ledger, "1.0", "1.3"),
            Err(MigrationError::NoPathFound { .. })
        ));
        assert!(matches!(
            plan_ids(&ledger, "1.1", "1.0"),
            Err(MigrationError::NoPathFound { .. })
        ));
    }

    #[test]
    fn test_overshooting_edge_is_no_path() {
        let ledger = MigrationLedger::new();
        ledger.add(entry("Billing", "1.0", "2.0")).unwrap();
        assert!(matches!(
            plan_ids(&ledger, "1.0", "1.5"),
            Err(MigrationError::NoPathFound { .. })
        ));
    }

    #[test]
    fn test_one_edge_per_source_version() {
        let ledger = MigrationLedger::new();
        ledger.add(entry("Billing", "1.0", "1.1")).unwrap();
        assert!(matches!(
            ledger.add(entry("Billing", "1.0", "1.2")),
            Err(MigrationError::DuplicateEdge { .. })
        ));
        ledger.remove("Billing", &v("1.0"));
        ledger.add(entry("Billing", "1.0", "1.2")).unwrap();
        assert_eq!(ledger.edges("Billing").len(), 1);
    }
}
