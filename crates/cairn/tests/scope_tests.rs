//! Scope lookup tests: the walk, visibility bounds, target type/pattern
//! specific variables, and command-line override application.

mod common;

use cairn::{DirPath, Storage, scope, value};
use common::{parse_into, scratch_root, test_ctx, test_ctx_with};
use pretty_assertions::assert_eq;

// ============================================================================
// The walk
// ============================================================================

#[test]
fn lookup_walks_to_parent_scopes() {
    let t = test_ctx();
    let root = scratch_root(&t.ctx, "/p");
    parse_into(&t, root, "x = from-root\n");

    let (sub, _) = t.ctx.scopes.insert(&DirPath::new("/p/sub"));
    sub.links.write().root = Some(root);

    let var = t.ctx.var_pool().find("x").unwrap();
    let l = scope::find(&t.ctx, sub.id, var).unwrap();
    assert_eq!(l.value.unwrap().display(), "from-root");
    assert_eq!(l.storage, Storage::Scope(root));
}

#[test]
fn inner_scope_shadows_outer() {
    let t = test_ctx();
    let root = scratch_root(&t.ctx, "/p");
    parse_into(&t, root, "x = outer\nsub/:\n{\nx = inner\n}\n");

    let sub_id = t.ctx.scopes.find(&DirPath::new("/p/sub"));
    let var = t.ctx.var_pool().find("x").unwrap();
    let l = scope::find(&t.ctx, sub_id, var).unwrap();
    assert_eq!(l.value.unwrap().display(), "inner");
}

#[test]
fn scope_visibility_stops_the_walk() {
    let t = test_ctx();
    let root = scratch_root(&t.ctx, "/p");
    {
        let mut pool = t.ctx.var_pool_mut();
        pool.insert_full("local", None, Some(cairn::variable::Visibility::Scope), None).unwrap();
    }
    parse_into(&t, root, "local = set-at-root\n");

    let (sub, _) = t.ctx.scopes.insert(&DirPath::new("/p/sub"));
    sub.links.write().root = Some(root);

    let var = t.ctx.var_pool().find("local").unwrap();
    let l = scope::find(&t.ctx, sub.id, var).unwrap();
    assert!(!l.defined(), "scope visibility must not inherit");
    assert_eq!(l.storage, Storage::Undefined);
}

#[test]
fn undefined_lookup_is_empty_not_an_error() {
    let t = test_ctx();
    let root = scratch_root(&t.ctx, "/p");
    let var = {
        let mut pool = t.ctx.var_pool_mut();
        pool.insert("never.set")
    };
    let l = scope::find(&t.ctx, root, var).unwrap();
    assert!(!l.defined());
}

// ============================================================================
// Target type/pattern-specific variables
// ============================================================================

#[test]
fn pattern_variable_append_composes_on_lookup() {
    let t = test_ctx();
    let root = scratch_root(&t.ctx, "/p");
    parse_into(&t, root, "poptions = -DBASE\nexe{*}: poptions += -DFOO\nexe{hello}:\n");

    let tt = t.ctx.target_types();
    let exe = tt.find("exe").unwrap();
    drop(tt);
    let target = t
        .ctx
        .targets
        .snapshot()
        .into_iter()
        .find(|x| x.key.typ == exe && x.key.name == "hello")
        .unwrap();
    let var = t.ctx.var_pool().find("poptions").unwrap();
    let l = target.find_var(&t.ctx, var).unwrap();
    assert_eq!(l.value.unwrap().display(), "-DBASE -DFOO");
    assert!(matches!(l.storage, Storage::Cache(_)), "composed values live in the cache");
}

#[test]
fn pattern_variable_applies_to_matching_names_only() {
    let t = test_ctx();
    let root = scratch_root(&t.ctx, "/p");
    parse_into(&t, root, "exe{h*}: mark = yes\nexe{hello}:\nexe{world}:\n");

    let tt = t.ctx.target_types();
    let exe = tt.find("exe").unwrap();
    drop(tt);
    let var = t.ctx.var_pool().find("mark").unwrap();
    for (name, expect) in [("hello", true), ("world", false)] {
        let target = t
            .ctx
            .targets
            .snapshot()
            .into_iter()
            .find(|x| x.key.typ == exe && x.key.name == name)
            .unwrap();
        let l = target.find_var(&t.ctx, var).unwrap();
        assert_eq!(l.defined(), expect, "pattern match for {name}");
    }
}

// ============================================================================
// Overrides
// ============================================================================

#[test]
fn override_then_append_wins_over_buildfile_assignment() {
    let t = test_ctx_with(vec!["config.x=1".to_owned(), "config.x+=2".to_owned()]);
    let root = scratch_root(&t.ctx, "/p");
    parse_into(&t, root, "config.x = 9\n");

    let var = t.ctx.var_pool().find("config.x").unwrap();
    let l = scope::find(&t.ctx, root, var).unwrap();
    assert_eq!(l.value.unwrap().display(), "1 2");
    assert!(matches!(l.storage, Storage::Cache(_)));
}

#[test]
fn prefix_override_prepends_to_stem() {
    let t = test_ctx_with(vec!["config.x=+0".to_owned()]);
    let root = scratch_root(&t.ctx, "/p");
    parse_into(&t, root, "config.x = 1 2\n");

    let var = t.ctx.var_pool().find("config.x").unwrap();
    let l = scope::find(&t.ctx, root, var).unwrap();
    assert_eq!(l.value.unwrap().display(), "0 1 2");
}

#[test]
fn scoped_override_does_not_leak_to_siblings() {
    let t = test_ctx_with(vec!["/p/sub1/@config.x=83".to_owned()]);
    let root = scratch_root(&t.ctx, "/p");
    parse_into(&t, root, "config.x = 10\n");
    for sub in ["/p/sub1", "/p/sub2"] {
        let (s, _) = t.ctx.scopes.insert(&DirPath::new(sub));
        s.links.write().root = Some(root);
    }

    let var = t.ctx.var_pool().find("config.x").unwrap();
    let sub1 = t.ctx.scopes.find(&DirPath::new("/p/sub1"));
    let sub2 = t.ctx.scopes.find(&DirPath::new("/p/sub2"));
    let l1 = scope::find(&t.ctx, sub1, var).unwrap();
    let l2 = scope::find(&t.ctx, sub2, var).unwrap();
    assert_eq!(l1.value.unwrap().display(), "83");
    assert_eq!(l2.value.unwrap().display(), "10", "sibling sees the stem only");
}

#[test]
fn non_overridable_variables_reject_overrides() {
    let stderr = cairn::Capture::new();
    let stdout = cairn::Capture::new();
    let diag = cairn::Diagnostics::new(1)
        .with_writers(Box::new(stderr.clone()), Box::new(stdout.clone()));
    // `project` is entered non-overridable by the context itself.
    let config = cairn::ContextConfig {
        jobs: 1,
        overrides: vec!["project=evil".to_owned()],
        diag: Some(diag),
        ..cairn::ContextConfig::default()
    };
    assert!(cairn::Context::new(config).is_err());
}

#[test]
fn override_with_typed_variable_applies_through_the_type() {
    let t = test_ctx_with(vec!["config.jobs=4".to_owned()]);
    let root = scratch_root(&t.ctx, "/p");
    {
        let mut pool = t.ctx.var_pool_mut();
        pool.insert_full("config.jobs", Some(value::UINT64), None, None).unwrap();
    }
    parse_into(&t, root, "config.jobs = [uint64] 1\n");
    let var = t.ctx.var_pool().find("config.jobs").unwrap();
    let l = scope::find(&t.ctx, root, var).unwrap();
    assert_eq!(l.value.unwrap().as_uint(), Some(4));
}

// ============================================================================
// Storage reporting
// ============================================================================

#[test]
fn storage_is_reachable_from_the_queried_scope() {
    let t = test_ctx();
    let root = scratch_root(&t.ctx, "/p");
    parse_into(&t, root, "x = v\n");
    let (sub, _) = t.ctx.scopes.insert(&DirPath::new("/p/a/b"));
    sub.links.write().root = Some(root);

    let var = t.ctx.var_pool().find("x").unwrap();
    let l = scope::find(&t.ctx, sub.id, var).unwrap();
    // The storage scope must be on the walk from sub to the root.
    match l.storage {
        Storage::Scope(sid) => {
            let mut cur = Some(sub.id);
            let mut found = false;
            while let Some(id) = cur {
                if id == sid {
                    found = true;
                    break;
                }
                cur = t.ctx.scopes.get(id).parent();
            }
            assert!(found, "storage scope not on the walk");
        }
        other => panic!("unexpected storage {other:?}"),
    }
    assert_eq!(l.var, Some(var));
}
