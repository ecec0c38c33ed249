//! Shared test infrastructure for integration tests
//!
//! - `harness`: in-memory orchestration contexts with a controllable clock
//! - `builders`: recording handlers and canned module/template fixtures
//! - `strategies`: proptest strategies for versions and migration chains

#![allow(dead_code)]

pub mod builders;
pub mod harness;
pub mod strategies;

pub use builders::*;
pub use harness::*;
