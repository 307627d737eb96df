//! Variable pool and map tests: tightening inserts, aliases, patterns,
//! override variables, and per-entry versions.

use cairn::{
    value,
    variable::{OverrideKind, VariableMap, VariablePool, Visibility},
};
use pretty_assertions::assert_eq;

// ============================================================================
// Pool insertion and tightening
// ============================================================================

#[test]
fn insert_is_idempotent() {
    let mut pool = VariablePool::new();
    let a = pool.insert("foo");
    let b = pool.insert("foo");
    assert_eq!(a, b);
    assert_eq!(pool.len(), 1);
}

#[test]
fn visibility_tightens_but_never_relaxes() {
    let mut pool = VariablePool::new();
    let v = pool
        .insert_full("foo", None, Some(Visibility::Project), None)
        .unwrap();
    // Narrowing project -> scope is fine.
    pool.insert_full("foo", None, Some(Visibility::Scope), None).unwrap();
    assert_eq!(pool.get(v).visibility, Visibility::Scope);
    // Widening back is not.
    assert!(pool.insert_full("foo", None, Some(Visibility::Global), None).is_err());
}

#[test]
fn null_type_can_become_concrete_but_not_change() {
    let mut pool = VariablePool::new();
    let v = pool.insert_full("foo", None, None, None).unwrap();
    pool.insert_full("foo", Some(value::STRING), None, None).unwrap();
    assert_eq!(pool.get(v).typ, Some(value::STRING));
    assert!(pool.insert_full("foo", Some(value::UINT64), None, None).is_err());
}

#[test]
fn overridability_cannot_be_granted_later() {
    let mut pool = VariablePool::new();
    pool.insert_full("foo", None, None, Some(false)).unwrap();
    assert!(pool.insert_full("foo", None, None, Some(true)).is_err());
}

// ============================================================================
// Aliases
// ============================================================================

#[test]
fn alias_lookup_reports_storage_variable() {
    let mut pool = VariablePool::new();
    let orig = pool.insert("orig");
    let alias = pool.insert_alias(orig, "alias").unwrap();

    let mut map = VariableMap::new();
    map.set_names(&pool, alias, vec![cairn::Name::from_value("v")]).unwrap();

    // Looking up through the original finds the alias's storage.
    let (entry, storage) = map.lookup(&pool, orig).expect("found through alias");
    assert_eq!(storage, alias);
    assert_eq!(entry.value.display(), "v");
}

#[test]
fn overridable_variables_cannot_be_aliased() {
    let mut pool = VariablePool::new();
    let v = pool.insert_full("cfg", None, None, Some(true)).unwrap();
    assert!(pool.insert_alias(v, "cfg2").is_err());
}

// ============================================================================
// Patterns
// ============================================================================

#[test]
fn pattern_applies_defaults_at_insertion() {
    let mut pool = VariablePool::new();
    pool.insert_pattern("config.**", None, Some(Visibility::Global), Some(true), false, false)
        .unwrap();
    let v = pool.insert("config.foo.bar");
    assert_eq!(pool.get(v).visibility, Visibility::Global);
    assert!(pool.get(v).overridable);
}

#[test]
fn single_star_matches_single_component_stems_only() {
    let mut pool = VariablePool::new();
    pool.insert_pattern("x.*", Some(value::UINT64), None, None, false, false).unwrap();
    let single = pool.insert("x.a");
    let multi = pool.insert("x.a.b");
    assert_eq!(pool.get(single).typ, Some(value::UINT64));
    assert_eq!(pool.get(multi).typ, None, "'*' must not match multi-component stems");
}

#[test]
fn single_component_names_never_pattern_match() {
    let mut pool = VariablePool::new();
    pool.insert_pattern("**", Some(value::STRING), None, None, false, false).unwrap();
    let v = pool.insert("plain");
    assert_eq!(pool.get(v).typ, None);
}

#[test]
fn more_specific_pattern_wins() {
    let mut pool = VariablePool::new();
    pool.insert_pattern("a.**", Some(value::STRING), None, None, false, false).unwrap();
    pool.insert_pattern("a.b.**", Some(value::UINT64), None, None, false, false).unwrap();
    let v = pool.insert("a.b.c");
    assert_eq!(pool.get(v).typ, Some(value::UINT64));
}

#[test]
fn specificity_tie_breaks_by_reverse_insertion_order() {
    let mut pool = VariablePool::new();
    // Same prefix+suffix length, same multi-ness.
    pool.insert_pattern("aa.**", Some(value::STRING), None, None, false, false).unwrap();
    pool.insert_pattern("aa.**", Some(value::UINT64), None, None, false, false).unwrap();
    let v = pool.insert("aa.x.y");
    assert_eq!(pool.get(v).typ, Some(value::UINT64), "later insertion wins ties");
}

#[test]
fn star_more_specific_than_double_star_at_equal_length() {
    let mut pool = VariablePool::new();
    pool.insert_pattern("p.**", Some(value::STRING), None, None, false, false).unwrap();
    pool.insert_pattern("p.*", Some(value::UINT64), None, None, false, false).unwrap();
    let v = pool.insert("p.x");
    assert_eq!(pool.get(v).typ, Some(value::UINT64));
}

#[test]
fn retrospective_pattern_updates_existing_variables() {
    let mut pool = VariablePool::new();
    let v = pool.insert("mod.opt");
    assert_eq!(pool.get(v).typ, None);
    pool.insert_pattern("mod.*", Some(value::STRING), None, None, true, false).unwrap();
    assert_eq!(pool.get(v).typ, Some(value::STRING));
}

// ============================================================================
// Override variables
// ============================================================================

#[test]
fn override_names_encode_position_and_operator() {
    let mut pool = VariablePool::new();
    let base = pool.insert_full("config.x", None, None, Some(true)).unwrap();
    let o0 = pool.insert_override(base, 0, OverrideKind::Assign);
    let o1 = pool.insert_override(base, 1, OverrideKind::Append);
    assert_eq!(pool.get(o0).name, "config.x.0.__override");
    assert_eq!(pool.get(o1).name, "config.x.1.__suffix");
    assert_eq!(pool.get(base).overrides, vec![o0, o1]);
    assert!(pool.get(o0).typ.is_none(), "override variables stay untyped");
}

// ============================================================================
// Variable map
// ============================================================================

#[test]
fn modification_bumps_version() {
    let mut pool = VariablePool::new();
    let v = pool.insert("x");
    let mut map = VariableMap::new();
    let e = map.assign(&pool, v);
    assert_eq!(e.version, 0);
    e.modify().assign(vec![cairn::Name::from_value("1")], None).unwrap();
    let e = map.assign(&pool, v);
    assert_eq!(e.version, 1);
}

#[test]
fn iteration_is_ascending_and_namespace_ranges_work() {
    let mut pool = VariablePool::new();
    let mut map = VariableMap::new();
    for name in ["b.x", "a.y", "b.y", "a.x", "c"] {
        let v = pool.insert(name);
        map.set_names(&pool, v, vec![cairn::Name::from_value("1")]).unwrap();
    }
    let order: Vec<&str> = map.iter().map(|(n, _)| n.as_str()).collect();
    assert_eq!(order, vec!["a.x", "a.y", "b.x", "b.y", "c"]);

    let ns: Vec<&str> = map.namespace("b").map(|(n, _)| n.as_str()).collect();
    assert_eq!(ns, vec!["b.x", "b.y"]);
}
