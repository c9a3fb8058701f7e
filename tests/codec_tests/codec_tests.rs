//! Tests for the value codec
//!
//! These tests verify:
//! - Round trips of scalars, lists and maps
//! - Aliasing is preserved (same handle, not just equal content)
//! - Cycles, including self-reference and mutual reference
//! - Rejection of malformed input
//! - Round trips of random value trees (proptest)

use proptest::prelude::*;
use shmcache::codec::{self, decode, decode_number_or_zero, encode};
use shmcache::{CacheError, Value};

// =============================================================================
// Helper Functions
// =============================================================================

fn round_trip(value: &Value) -> Value {
    decode(&encode(value).unwrap()).unwrap()
}

fn arb_value() -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<f64>()
            .prop_filter("NaN never equals itself", |n| !n.is_nan())
            .prop_map(Value::Number),
        ".{0,24}".prop_map(Value::String),
    ];
    leaf.prop_recursive(4, 64, 8, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..8).prop_map(Value::list),
            prop::collection::vec(("[a-z]{0,6}", inner), 0..8)
                .prop_map(|entries: Vec<(String, Value)>| Value::map(entries)),
        ]
    })
}

// =============================================================================
// Scalar and Structure Tests
// =============================================================================

#[test]
fn test_scalars_round_trip() {
    for value in [
        Value::Null,
        Value::Bool(false),
        Value::Bool(true),
        Value::Number(0.0),
        Value::Number(-1.25e300),
        Value::Number(f64::INFINITY),
        Value::from(""),
        Value::from("héllo ✓"),
    ] {
        assert_eq!(round_trip(&value), value);
    }
}

#[test]
fn test_nested_structure_round_trip() {
    let value = Value::map([
        ("name", Value::from("cache")),
        (
            "tags",
            Value::list(vec![Value::from("a"), Value::Null, Value::from(3)]),
        ),
        ("inner", Value::map([("ok", Value::Bool(true))])),
    ]);
    let back = round_trip(&value);
    assert_eq!(back, value);
    assert_eq!(back.get("tags").unwrap().at(2), Some(Value::Number(3.0)));
}

#[test]
fn test_map_key_order_preserved() {
    let value = Value::map([("z", Value::Null), ("a", Value::Null), ("m", Value::Null)]);
    let back = round_trip(&value);
    let keys: Vec<String> = back
        .as_map()
        .unwrap()
        .borrow()
        .iter()
        .map(|(k, _)| k.clone())
        .collect();
    assert_eq!(keys, vec!["z", "a", "m"]);
}

#[test]
fn test_long_string_uses_multi_byte_length() {
    let value = Value::String("x".repeat(1000));
    let bytes = encode(&value).unwrap();
    assert_eq!(bytes.len(), 1 + 2 + 1000);
    assert_eq!(round_trip(&value), value);
}

// =============================================================================
// Aliasing and Cycle Tests
// =============================================================================

#[test]
fn test_shared_sublist_stays_shared() {
    let shared = Value::list(vec![Value::from(1), Value::from(2)]);
    let value = Value::map([("left", shared.clone()), ("right", shared)]);

    let back = round_trip(&value);
    let left = back.get("left").unwrap();
    let right = back.get("right").unwrap();
    assert!(left.same(&right));

    // Mutating through one alias is visible through the other
    left.push(Value::from(3));
    assert_eq!(right.len(), Some(3));
}

#[test]
fn test_equal_but_distinct_lists_stay_distinct() {
    let value = Value::list(vec![Value::empty_list(), Value::empty_list()]);
    let back = round_trip(&value);
    assert!(!back.at(0).unwrap().same(&back.at(1).unwrap()));
}

#[test]
fn test_self_referencing_list() {
    let value = Value::list(vec![Value::from("head")]);
    value.push(value.clone());

    let back = round_trip(&value);
    assert!(back.at(1).unwrap().same(&back));
    assert_eq!(back.at(0), Some(Value::from("head")));
}

#[test]
fn test_mutual_cycle_through_maps() {
    let a = Value::map([("name", Value::from("a"))]);
    let b = Value::map([("name", Value::from("b"))]);
    a.insert("peer", b.clone());
    b.insert("peer", a.clone());
    let root = Value::list(vec![a, b]);

    let back = round_trip(&root);
    let a = back.at(0).unwrap();
    let b = back.at(1).unwrap();
    assert!(a.get("peer").unwrap().same(&b));
    assert!(b.get("peer").unwrap().same(&a));
    assert!(a.get("peer").unwrap().get("peer").unwrap().same(&a));
}

#[test]
fn test_cycle_encoding_is_finite() {
    let value = Value::empty_map();
    value.insert("me", value.clone());
    value.insert("again", value.clone());
    let bytes = encode(&value).unwrap();
    assert!(bytes.len() < 32);
}

// =============================================================================
// Malformed Input Tests
// =============================================================================

#[test]
fn test_malformed_input_is_codec_error() {
    let cases: [&[u8]; 5] = [
        &[],
        &[0xFF],
        &[codec::TAG_STRING, 3, b'a'],
        &[codec::TAG_STRING, 2, 0xC3, 0x28],
        &[codec::TAG_LIST, 1, codec::TAG_BACKREF, 9],
    ];
    for bytes in cases {
        assert!(matches!(decode(bytes), Err(CacheError::Codec(_))), "{:?}", bytes);
    }
}

#[test]
fn test_excessive_nesting_rejected() {
    let mut value = Value::Null;
    for _ in 0..codec::MAX_DEPTH + 2 {
        value = Value::list(vec![value]);
    }
    assert!(matches!(encode(&value), Err(CacheError::Codec(_))));

    // Decoding enforces the same bound
    let mut bytes = vec![codec::TAG_LIST, 1];
    bytes = bytes.repeat(codec::MAX_DEPTH + 2);
    bytes.push(codec::TAG_NULL);
    assert!(matches!(decode(&bytes), Err(CacheError::Codec(_))));
}

// =============================================================================
// Counter Decoding Tests
// =============================================================================

#[test]
fn test_counter_reads_numbers_only() {
    assert_eq!(decode_number_or_zero(&encode(&Value::from(41)).unwrap()), 41.0);
    assert_eq!(decode_number_or_zero(&encode(&Value::from("oops")).unwrap()), 0.0);
    assert_eq!(decode_number_or_zero(&encode(&Value::Bool(true)).unwrap()), 0.0);
    assert_eq!(
        decode_number_or_zero(&encode(&Value::list(vec![Value::from(5)])).unwrap()),
        0.0
    );
}

// =============================================================================
// Property Tests
// =============================================================================

proptest! {
    #[test]
    fn prop_round_trip_preserves_structure(value in arb_value()) {
        let bytes = encode(&value).unwrap();
        let back = decode(&bytes).unwrap();
        prop_assert_eq!(&back, &value);
        prop_assert_eq!(encode(&back).unwrap(), bytes);
    }
}
