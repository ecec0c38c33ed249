//! # Module Migrations
//!
//! Versioned, ordered, rollback-capable schema and data migrations per module.
//!
//! ```text
//! migration
//! ├── MigrationLedger   (one `from -> to` edge per source version)
//! ├── ChangeUnit        (apply / compensate pair)
//! └── MigrationManager  (runs, rollbacks, atomic version pointer)
//! ```

pub mod errors;
pub mod ledger;
pub mod manager;
pub mod unit;

pub use errors::{ChangeUnitError, MigrationError, MigrationResult};
pub use ledger::{MigrationEdge, MigrationPath};
pub use manager::{
    EdgeStatus, MigrationDirection, MigrationManager, MigrationRun, MigrationRunStatus,
    MigrationStatus,
};
pub use unit::{ChangeUnit, FnChangeUnit};
