//! Correlation-id transform behavior, example-based and property-based.

use mqbridge_core::{transform_correlation_id, CorrelationIdPolicy};
use proptest::prelude::*;

#[test]
fn hex_transform_of_prefixed_id() {
    let policy = CorrelationIdPolicy {
        to_hex: true,
        ..CorrelationIdPolicy::default()
    };
    assert_eq!(transform_correlation_id("ID:abc", &policy), "ID:616263");
}

#[test]
fn truncation_keeps_prefix_and_tail() {
    let policy = CorrelationIdPolicy {
        max_length: Some(5),
        ..CorrelationIdPolicy::default()
    };
    assert_eq!(transform_correlation_id("ID:1234567", &policy), "ID:34567");
    // An id without the prefix gains it when truncated.
    assert_eq!(transform_correlation_id("1234567", &policy), "ID:34567");
}

#[test]
fn hex_transform_leaves_unprefixed_ids_alone() {
    let policy = CorrelationIdPolicy {
        to_hex: true,
        ..CorrelationIdPolicy::default()
    };
    assert_eq!(transform_correlation_id("abc", &policy), "abc");
}

proptest! {
    #[test]
    fn hex_output_is_prefixed_hex(id in "[a-zA-Z0-9]{1,24}") {
        let policy = CorrelationIdPolicy {
            to_hex: true,
            ..CorrelationIdPolicy::default()
        };
        let out = transform_correlation_id(&format!("ID:{id}"), &policy);
        prop_assert!(out.starts_with("ID:"));
        prop_assert!(!out[3..].is_empty());
        prop_assert!(out[3..].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn truncation_bounds_length_and_keeps_tail(
        id in "[a-z0-9]{1,40}",
        max_length in 1usize..16,
        prefixed: bool,
    ) {
        let policy = CorrelationIdPolicy {
            max_length: Some(max_length),
            ..CorrelationIdPolicy::default()
        };
        let input = if prefixed { format!("ID:{id}") } else { id.clone() };
        let out = transform_correlation_id(&input, &policy);
        if id.len() > max_length {
            prop_assert!(out.starts_with("ID:"));
            let tail = &out[3..];
            prop_assert_eq!(tail.len(), max_length);
            prop_assert!(id.ends_with(tail));
        } else {
            prop_assert_eq!(out, input);
        }
    }

    #[test]
    fn no_policy_is_identity(id in "[ -~]{0,40}") {
        let policy = CorrelationIdPolicy::default();
        prop_assert_eq!(transform_correlation_id(&id, &policy), id);
    }

    #[test]
    fn transform_is_idempotent_free_of_panics(
        id in "[ -~]{0,40}",
        to_hex: bool,
        max_length in proptest::option::of(1usize..16),
    ) {
        let policy = CorrelationIdPolicy {
            to_hex,
            max_length,
            ..CorrelationIdPolicy::default()
        };
        let _ = transform_correlation_id(&id, &policy);
    }
}
