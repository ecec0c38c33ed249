//! Property-based tests for version ordering and dependency constraints

mod common;

use common::strategies::*;
use modhub_core::registry::{ModuleDescriptor, ModuleVersion, VersionConstraint};
use proptest::prelude::*;

fn parse(s: &str) -> ModuleVersion {
    s.parse().expect("strategy produces valid versions")
}

proptest! {
    /// Versions survive a display/parse cycle and order by numeric components
    #[test]
    fn test_version_ordering_is_numeric(a in version_strategy(), b in version_strategy()) {
        let (va, vb) = (parse(&a), parse(&b));
        prop_assert_eq!(parse(&va.to_string()), va.clone());

        let numeric = |v: &ModuleVersion| {
            let parts = v.parts();
            (
                parts.first().copied().unwrap_or(0),
                parts.get(1).copied().unwrap_or(0),
                parts.get(2).copied().unwrap_or(0),
            )
        };
        prop_assert_eq!(va.cmp(&vb), numeric(&va).cmp(&numeric(&vb)));
    }

    /// Each constraint operator agrees with the plain comparison it names
    #[test]
    fn test_constraints_match_their_comparison(
        op in constraint_operator_strategy(),
        bound in version_strategy(),
        candidate in version_strategy(),
    ) {
        let constraint: VersionConstraint = format!("{op}{bound}").parse().unwrap();
        let (bound, candidate) = (parse(&bound), parse(&candidate));
        let expected = match op {
            "" | ">=" => candidate >= bound,
            "=" => candidate == bound,
            ">" => candidate > bound,
            "<=" => candidate <= bound,
            "<" => candidate < bound,
            "^" => candidate.major() == bound.major() && candidate >= bound,
            other => unreachable!("unexpected operator {other}"),
        };
        prop_assert_eq!(constraint.matches(&candidate), expected);
        let reparsed: VersionConstraint = constraint.to_string().parse().unwrap();
        prop_assert_eq!(reparsed, constraint);
    }

    /// A sender may reach a target exactly when the target declares it
    #[test]
    fn test_dependency_policy_follows_declarations(
        declared in prop::collection::btree_set(module_name_strategy(), 1..4),
        sender in module_name_strategy(),
    ) {
        let allowed = tokio_test::block_on(async {
            let harness = common::TestHarness::new();
            let registry = harness.ctx.registry();
            let mut target = ModuleDescriptor::new("Permit_hub", "1.0");
            for name in &declared {
                registry.register(ModuleDescriptor::new(name.as_str(), "1.0")).await.unwrap();
                target = target.depends_on(name.as_str(), "*");
            }
            registry.register(target).await.unwrap();
            registry.check_dependency_satisfied("Permit_hub", &sender)
        });
        prop_assert_eq!(allowed, declared.contains(&sender));
    }
}
