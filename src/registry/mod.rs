//! # Module Registry
//!
//! Registration, versioning and dependency policy for domain modules.
//!
//! ## Architecture
//!
//! ```text
//! registry
//! ├── ModuleRegistry     (registered modules, dependency checks, status)
//! ├── ModuleVersion      (dotted numeric versions)
//! └── VersionConstraint  (*, =, >=, >, <=, <, ^)
//! ```

pub mod errors;
pub mod module_registry;
pub mod version;

pub use errors::{RegistrationError, RegistrationResult};
pub use module_registry::{
    DependencyDeclaration, ModuleDependency, ModuleDescriptor, ModuleRegistry, ModuleStatus,
    RegisteredModule,
};
pub use version::{ModuleVersion, VersionConstraint};
