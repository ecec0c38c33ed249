//! Proptest strategies for property-based tests

use proptest::prelude::*;

/// Strategy for generating dotted version strings like `2.7.13`
pub fn version_strategy() -> impl Strategy<Value = String> {
    (0u64..5, 0u64..20, 0u64..20)
        .prop_map(|(major, minor, patch)| format!("{major}.{minor}.{patch}"))
}

/// Strategy for generating version-constraint operators
pub fn constraint_operator_strategy() -> impl Strategy<Value = &'static str> {
    prop::sample::select(vec!["", "=", ">=", ">", "<=", "<", "^"])
}

/// Strategy for generating strictly increasing version chains (at least two versions)
pub fn migration_chain_strategy() -> impl Strategy<Value = Vec<String>> {
    prop::collection::btree_set(0u64..50, 2..8)
        .prop_map(|minors| minors.into_iter().map(|minor| format!("1.{minor}")).collect())
}

/// Strategy for generating module names that are valid registry keys
pub fn module_name_strategy() -> impl Strategy<Value = String> {
    "[A-Z][a-z]{2,10}"
}

/// Strategy for generating review outcomes, including ones no transition declares
pub fn review_outcomes_strategy() -> impl Strategy<Value = Vec<String>> {
    prop::collection::vec(
        prop::sample::select(vec!["approved", "rejected", "revise", "escalate", "unknown"])
            .prop_map(str::to_string),
        1..10,
    )
}
