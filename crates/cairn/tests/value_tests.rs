//! Value system tests: conversion, append/prepend semantics, null vs
//! empty, reversal round-trips, and comparison.

use std::cmp::Ordering;

use cairn::{
    name::{Name, Names},
    value::{self, Value},
};
use pretty_assertions::assert_eq;

fn names(words: &[&str]) -> Names {
    words.iter().map(|w| Name::from_value(*w)).collect()
}

// ============================================================================
// Simple type conversion
// ============================================================================

#[test]
fn bool_converts_only_true_false() {
    let mut v = Value::null_value();
    v.assign(names(&["true"]), Some(value::BOOL)).unwrap();
    assert_eq!(v.as_bool(), Some(true));

    let mut v = Value::null_value();
    assert!(v.assign(names(&["yes"]), Some(value::BOOL)).is_err());
}

#[test]
fn uint64_accepts_decimal_and_hex() {
    let mut v = Value::null_value();
    v.assign(names(&["42"]), Some(value::UINT64)).unwrap();
    assert_eq!(v.as_uint(), Some(42));

    let mut v = Value::null_value();
    v.assign(names(&["0x10"]), Some(value::UINT64)).unwrap();
    assert_eq!(v.as_uint(), Some(16));

    let mut v = Value::null_value();
    assert!(v.assign(names(&["forty"]), Some(value::UINT64)).is_err());
}

#[test]
fn uint64_append_adds() {
    let mut v = Value::from_uint(41);
    v.append(names(&["1"]), None).unwrap();
    assert_eq!(v.as_uint(), Some(42));
}

#[test]
fn bool_append_ors() {
    let mut v = Value::from_bool(false);
    v.append(names(&["true"]), None).unwrap();
    assert_eq!(v.as_bool(), Some(true));
    v.append(names(&["false"]), None).unwrap();
    assert_eq!(v.as_bool(), Some(true), "OR semantics, not last-wins");
}

#[test]
fn string_append_and_prepend_concatenate() {
    let mut v = Value::from_string("bar");
    v.append(names(&["baz"]), None).unwrap();
    v.prepend(names(&["foo"]), None).unwrap();
    assert_eq!(v.as_str(), Some("foobarbaz"));
}

// ============================================================================
// Null vs empty
// ============================================================================

#[test]
fn null_and_empty_are_distinct() {
    let null = Value::null_value();
    assert!(null.is_null());
    assert!(null.empty());

    let mut empty = Value::null_value();
    empty.assign(Names::new(), Some(value::STRINGS)).unwrap();
    assert!(!empty.is_null(), "an empty list is not null");
    assert!(empty.empty());
}

#[test]
fn empty_names_typify_to_empty_instance() {
    let mut v = Value::from_names(Names::new());
    v.typify(value::STRING).unwrap();
    assert_eq!(v.as_str(), Some(""));
}

#[test]
fn typify_rejects_empty_for_non_empty_types() {
    let mut v = Value::from_names(Names::new());
    assert!(v.typify(value::UINT64).is_err());
}

#[test]
fn untyped_null_adopts_appended_type() {
    let mut v = Value::null_value();
    v.append(names(&["7"]), Some(value::UINT64)).unwrap();
    assert_eq!(v.typ, Some(value::UINT64));
    assert_eq!(v.as_uint(), Some(7));
}

// ============================================================================
// Reversal round-trips
// ============================================================================

#[test]
fn simple_types_round_trip_through_names() {
    for (t, text) in [
        (value::BOOL, "true"),
        (value::UINT64, "42"),
        (value::STRING, "hello"),
        (value::TARGET_TRIPLET, "x86_64-linux-gnu"),
        (value::PROJECT_NAME, "proj"),
    ] {
        let mut v = Value::null_value();
        v.assign(names(&[text]), Some(t)).unwrap();
        let ns = v.reverse();
        let mut rt = Value::null_value();
        rt.assign(ns, Some(t)).unwrap();
        assert_eq!(v.compare(&rt), Ordering::Equal, "round-trip of {text}");
    }
}

#[test]
fn strings_vector_round_trips() {
    let mut v = Value::null_value();
    v.assign(names(&["a", "b", "c"]), Some(value::STRINGS)).unwrap();
    assert_eq!(v.as_strings(), Some(vec!["a".to_owned(), "b".to_owned(), "c".to_owned()]));

    let ns = v.reverse();
    assert_eq!(ns.len(), 3);
    let mut rt = Value::null_value();
    rt.assign(ns, Some(value::STRINGS)).unwrap();
    assert_eq!(v.compare(&rt), Ordering::Equal);
}

#[test]
fn untypify_reverses_in_place() {
    let mut v = Value::from_uint(5);
    v.untypify();
    assert_eq!(v.typ, None);
    assert_eq!(v.as_names().map(Vec::len), Some(1));
}

// ============================================================================
// Maps
// ============================================================================

#[test]
fn map_converts_pairs_and_merges_rhs_wins() {
    let t = value::find_type("map<string,string>").unwrap();
    let mut a = Name::from_value("k");
    a.pair = b'@';
    let mut v = Value::null_value();
    v.assign(vec![a.clone(), Name::from_value("v1")], Some(t)).unwrap();

    v.append(vec![a, Name::from_value("v2")], None).unwrap();
    let ns = v.reverse();
    assert_eq!(ns.len(), 2);
    assert_eq!(ns[1].value, "v2", "append replaces on key collision");
}

#[test]
fn map_rejects_non_pairs() {
    let t = value::find_type("map<string,string>").unwrap();
    let mut v = Value::null_value();
    assert!(v.assign(names(&["loose"]), Some(t)).is_err());
}

// ============================================================================
// Comparison
// ============================================================================

#[test]
fn null_compares_equal_and_less_than_non_null() {
    let null_a = Value::null_value();
    let null_b = Value::null_typed(value::STRING);
    assert_eq!(null_a.compare(&null_b), Ordering::Equal);

    let v = Value::from_uint(0);
    assert_eq!(null_a.compare(&v), Ordering::Less);
    assert_eq!(v.compare(&null_a), Ordering::Greater);
}

#[test]
fn assignment_preserves_extra() {
    let mut v = Value::null_value();
    v.extra = 0x2;
    v.assign(names(&["x"]), Some(value::STRING)).unwrap();
    assert_eq!(v.extra, 0x2);
}

#[test]
fn append_to_wrong_type_fails() {
    let mut v = Value::from_uint(1);
    let e = v.append(names(&["x"]), Some(value::STRING)).unwrap_err();
    assert!(e.contains("append"), "diagnostic names the operation: {e}");
}
