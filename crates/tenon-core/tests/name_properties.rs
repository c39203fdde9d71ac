//! Property tests for name derivation.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use proptest::prelude::*;
use tenon_core::name::MAX_NAME_LENGTH;
use tenon_core::{child_name, validate_dns_label};

fn arb_label() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9-]{0,40}[a-z0-9]"
}

proptest! {
    // A child name derived from any pair of valid labels is itself a valid
    // label, no matter how long the inputs get.
    #[test]
    fn child_names_are_always_valid_labels(parent in arb_label(), suffix in arb_label()) {
        let name = child_name(&parent, &suffix);
        prop_assert!(name.len() <= MAX_NAME_LENGTH);
        prop_assert!(validate_dns_label(&name).is_ok());
    }

    // Derivation is a pure function of its inputs.
    #[test]
    fn child_names_are_deterministic(parent in arb_label(), suffix in arb_label()) {
        prop_assert_eq!(child_name(&parent, &suffix), child_name(&parent, &suffix));
    }

    // Distinct suffixes never collide under the same parent, even when both
    // derivations truncate.
    #[test]
    fn distinct_suffixes_do_not_collide(
        parent in arb_label(),
        a in arb_label(),
        b in arb_label(),
    ) {
        prop_assume!(a != b);
        prop_assert_ne!(child_name(&parent, &a), child_name(&parent, &b));
    }
}
