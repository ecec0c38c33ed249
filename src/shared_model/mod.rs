//! # Shared Models
//!
//! Centrally registered schemas and optimistically versioned records for
//! entities that several modules read and write.

pub mod errors;
pub mod registry;
pub mod schema;

pub use errors::{
    ConflictError, RecordNotFound, SharedModelError, SharedModelResult, ValidationError,
};
pub use registry::{RecordFilter, RecordStatus, SharedModelRegistry, SharedRecord};
pub use schema::{FieldSpec, FieldType, ModelSchema};
