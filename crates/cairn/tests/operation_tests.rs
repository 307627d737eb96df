//! Operation driver tests: match/apply/execute over a real (temporary)
//! filesystem with a synthetic copy rule, dependency ordering, the
//! depdb-backed out-of-date decision, and failure propagation.

mod common;

use std::sync::Arc;

use cairn::{
    Context, DirPath,
    depdb::DepDb,
    diag::Result,
    operation::{self, Action, CLEAN, PERFORM, UPDATE},
    rule::{Recipe, Rule, clean_recipe, depdb_path},
    target::{self, MTIME_NONEXISTENT, Target, TargetState},
};
use common::{TestCtx, parse_into, scratch_root, test_ctx};
use pretty_assertions::assert_eq;

/// Copies its first prerequisite over the target, recording the source
/// in the depdb.
struct CopyRule;

impl Rule for CopyRule {
    fn name(&self) -> &'static str {
        "copy"
    }

    fn matches(&self, ctx: &Arc<Context>, _a: Action, t: &Arc<Target>, _hint: &str) -> bool {
        ctx.target_types().get(t.key.typ).file && !t.core.read().prerequisites.is_empty()
    }

    fn apply(&self, ctx: &Arc<Context>, a: Action, t: &Arc<Target>) -> Result<Recipe> {
        t.derive_path(ctx);
        operation::match_prerequisites(ctx, a, t)?;
        if a.operation == CLEAN {
            return Ok(clean_recipe());
        }
        Ok(Recipe::from_fn(|ctx, a, t| {
            let (_state, prereq_mtime) = operation::execute_prerequisites(ctx, a, t)?;
            let out = t.path().expect("path derived in apply");

            let src = {
                let prereqs = t.state(a).data.lock().prerequisite_targets.clone();
                let id = prereqs.iter().find_map(|pt| pt.target).expect("one prerequisite");
                let p = ctx.targets.get(id);
                p.path().expect("prerequisite has a path")
            };

            let mut db = DepDb::open(depdb_path(&out))?;
            let mut miss = false;
            miss |= !db.expect("copy 1")?;
            miss |= !db.expect(&src.to_string_lossy())?;
            db.close()?;

            let tm = t.load_mtime();
            if !miss && tm != MTIME_NONEXISTENT && prereq_mtime <= tm {
                return Ok(TargetState::Unchanged);
            }
            std::fs::copy(&src, &out)?;
            t.set_mtime(target::file_mtime(&out));
            Ok(TargetState::Changed)
        }))
    }
}

fn setup(dir: &std::path::Path, buildfile: &str) -> (TestCtx, cairn::ScopeId) {
    let t = test_ctx();
    let root = scratch_root(&t.ctx, &dir.to_string_lossy());
    {
        let s = t.ctx.scopes.get(root);
        let rule: Arc<dyn Rule> = Arc::new(CopyRule);
        let mut rules = s.rules.write();
        rules.insert(0, UPDATE, target::FILE, "", rule.clone());
        rules.insert(0, CLEAN, target::FILE, "", rule);
    }
    parse_into(&t, root, buildfile);
    (t, root)
}

fn update_target(t: &TestCtx, _root: cairn::ScopeId, name: &str) -> Result<TargetState> {
    let target = t
        .ctx
        .targets
        .snapshot()
        .into_iter()
        .find(|x| x.key.name == name)
        .expect("target declared");
    operation::perform(&t.ctx, Action::new(PERFORM, UPDATE), &[target])
}

// ============================================================================
// Update / out-of-date decision
// ============================================================================

#[test]
fn first_update_runs_second_is_unchanged() {
    let td = tempfile::tempdir().unwrap();
    std::fs::write(td.path().join("src.txt"), "v1").unwrap();
    let bf = "file{out.txt}: file{src.txt}\n";

    let (t, root) = setup(td.path(), bf);
    assert_eq!(update_target(&t, root, "out").unwrap(), TargetState::Changed);
    assert_eq!(std::fs::read_to_string(td.path().join("out.txt")).unwrap(), "v1");

    // A fresh context (same on-disk state) sees everything up to date.
    let (t2, root2) = setup(td.path(), bf);
    assert_eq!(update_target(&t2, root2, "out").unwrap(), TargetState::Unchanged);
    assert!(t2.stderr.take().contains("is up to date"));
}

#[test]
fn touched_input_forces_rerun() {
    let td = tempfile::tempdir().unwrap();
    let src = td.path().join("src.txt");
    std::fs::write(&src, "v1").unwrap();
    let bf = "file{out.txt}: file{src.txt}\n";

    let (t, root) = setup(td.path(), bf);
    update_target(&t, root, "out").unwrap();

    // Make the input strictly newer than the output.
    let future = std::time::SystemTime::now() + std::time::Duration::from_secs(5);
    std::fs::write(&src, "v2").unwrap();
    let f = std::fs::File::options().write(true).open(&src).unwrap();
    f.set_modified(future).unwrap();

    let (t2, root2) = setup(td.path(), bf);
    assert_eq!(update_target(&t2, root2, "out").unwrap(), TargetState::Changed);
    assert_eq!(std::fs::read_to_string(td.path().join("out.txt")).unwrap(), "v2");
}

#[test]
fn changed_depdb_input_set_forces_rerun() {
    let td = tempfile::tempdir().unwrap();
    std::fs::write(td.path().join("a.txt"), "a").unwrap();
    std::fs::write(td.path().join("b.txt"), "b").unwrap();

    let (t, root) = setup(td.path(), "file{out.txt}: file{a.txt}\n");
    update_target(&t, root, "out").unwrap();

    // Same mtimes, different recorded input: the depdb mismatch triggers.
    let (t2, root2) = setup(td.path(), "file{out.txt}: file{b.txt}\n");
    assert_eq!(update_target(&t2, root2, "out").unwrap(), TargetState::Changed);
    assert_eq!(std::fs::read_to_string(td.path().join("out.txt")).unwrap(), "b");
}

// ============================================================================
// Dependency chains
// ============================================================================

#[test]
fn chain_executes_prerequisites_first() {
    let td = tempfile::tempdir().unwrap();
    std::fs::write(td.path().join("src.txt"), "chain").unwrap();
    let bf = "file{mid.txt}: file{src.txt}\nfile{out.txt}: file{mid.txt}\n";

    let (t, root) = setup(td.path(), bf);
    assert_eq!(update_target(&t, root, "out").unwrap(), TargetState::Changed);
    assert_eq!(std::fs::read_to_string(td.path().join("out.txt")).unwrap(), "chain");
}

#[test]
fn clean_removes_outputs_and_depdb() {
    let td = tempfile::tempdir().unwrap();
    std::fs::write(td.path().join("src.txt"), "x").unwrap();
    let bf = "file{out.txt}: file{src.txt}\n";

    let (t, root) = setup(td.path(), bf);
    update_target(&t, root, "out").unwrap();
    assert!(td.path().join("out.txt").exists());
    assert!(td.path().join("out.txt.d").exists());

    let (t2, _root2) = setup(td.path(), bf);
    let target = t2
        .ctx
        .targets
        .snapshot()
        .into_iter()
        .find(|x| x.key.name == "out")
        .unwrap();
    let st = operation::perform(&t2.ctx, Action::new(PERFORM, CLEAN), &[target]).unwrap();
    assert_eq!(st, TargetState::Changed);
    assert!(!td.path().join("out.txt").exists());
    assert!(!td.path().join("out.txt.d").exists());
}

// ============================================================================
// Failures and cycles
// ============================================================================

#[test]
fn missing_source_fails_match_with_diagnostic() {
    let td = tempfile::tempdir().unwrap();
    let (t, root) = setup(td.path(), "file{out.txt}: file{missing.txt}\n");
    let e = update_target(&t, root, "out").unwrap_err();
    let text = format!("{e}\n{}", t.stderr.take());
    assert!(text.contains("no rule"), "diagnostic names the unmatchable target: {text}");
}

#[test]
fn dependency_cycle_is_detected() {
    let td = tempfile::tempdir().unwrap();
    let (t, root) = setup(td.path(), "alias{a}: alias{b}\nalias{b}: alias{a}\n");
    let e = update_target(&t, root, "a").unwrap_err();
    let text = format!("{e}\n{}", t.stderr.take());
    assert!(text.contains("cycle"), "cycle diagnostic expected: {text}");
}

#[test]
fn failed_prerequisite_fails_dependent_without_running_its_recipe() {
    let td = tempfile::tempdir().unwrap();
    std::fs::write(td.path().join("src.txt"), "x").unwrap();
    // `mid` depends on a missing file; `out` depends on `mid`.
    let bf = "file{mid.txt}: file{missing.txt}\nfile{out.txt}: file{mid.txt}\n";
    let (t, root) = setup(td.path(), bf);
    assert!(update_target(&t, root, "out").is_err());
    assert!(!td.path().join("out.txt").exists(), "dependent recipe must not run");
}

// ============================================================================
// Prerequisite inclusion control
// ============================================================================

#[test]
fn excluded_prerequisites_are_skipped() {
    let td = tempfile::tempdir().unwrap();
    // The prerequisite does not exist and has no rule, but it is
    // excluded, so the dependent still matches and executes.
    let bf = "alias{a}: alias{phantom}: include = false\n";
    let (t, root) = setup(td.path(), bf);
    assert_eq!(update_target(&t, root, "a").unwrap(), TargetState::Unchanged);
}

// ============================================================================
// Ad hoc members
// ============================================================================

#[test]
fn adhoc_member_chain_links_and_reuses() {
    let td = tempfile::tempdir().unwrap();
    let (t, _root) = setup(td.path(), "file{main.txt}:\n");
    let primary = t
        .ctx
        .targets
        .snapshot()
        .into_iter()
        .find(|x| x.key.name == "main")
        .unwrap();

    let doc = cairn::target::add_adhoc_member(&t.ctx, &primary, cairn::target::DOC, "main", Some("map")).unwrap();
    let exe = cairn::target::add_adhoc_member(&t.ctx, &primary, cairn::target::EXE, "main", None).unwrap();
    assert_ne!(doc.id, exe.id);

    // Members chain off the primary and re-attaching by type reuses the
    // existing member.
    let members = primary.adhoc_members(&t.ctx);
    assert_eq!(members.len(), 2);
    let again = cairn::target::add_adhoc_member(&t.ctx, &primary, cairn::target::DOC, "main", Some("map")).unwrap();
    assert_eq!(again.id, doc.id);
    assert_eq!(primary.adhoc_members(&t.ctx).len(), 2);
}

// ============================================================================
// Default dir{} targets
// ============================================================================

#[test]
fn declared_targets_hang_off_the_dir_target() {
    let td = tempfile::tempdir().unwrap();
    std::fs::write(td.path().join("src.txt"), "x").unwrap();
    let (t, _root) = setup(td.path(), "file{out.txt}: file{src.txt}\n");

    let dir_target = t
        .ctx
        .targets
        .snapshot()
        .into_iter()
        .find(|x| x.key.typ == target::DIR)
        .expect("default dir target");
    let st = operation::perform(&t.ctx, Action::new(PERFORM, UPDATE), &[dir_target]).unwrap();
    assert_eq!(st, TargetState::Changed);
    assert!(td.path().join("out.txt").exists());
}
