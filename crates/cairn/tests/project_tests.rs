//! End-to-end project tests through the driver: bootstrap, loading,
//! subdirectory scopes, configure/disfigure, and import.

mod common;

use std::path::Path;

use cairn::{DirPath, TargetState, driver, scope};
use common::{TestCtx, test_ctx, test_ctx_with};
use pretty_assertions::assert_eq;

fn write(root: &Path, rel: &str, content: &str) {
    let p = root.join(rel);
    std::fs::create_dir_all(p.parent().unwrap()).unwrap();
    std::fs::write(p, content).unwrap();
}

fn run(t: &TestCtx, dir: &Path, buildspec: &str) -> cairn::diag::Result<TargetState> {
    driver::run(&t.ctx, &DirPath::new(dir), buildspec)
}

// ============================================================================
// Bootstrap and the empty project
// ============================================================================

#[test]
fn empty_project_updates_to_nothing() {
    let td = tempfile::tempdir().unwrap();
    write(td.path(), "build/bootstrap.build", "project = empty\n");

    let t = test_ctx();
    let st = run(&t, td.path(), "").unwrap();
    assert_eq!(st, TargetState::Unchanged);
    assert!(t.stderr.take().contains("info: no target to update"));
}

#[test]
fn bootstrap_establishes_roots_and_project_name() {
    let td = tempfile::tempdir().unwrap();
    write(td.path(), "build/bootstrap.build", "project = hello\n");
    write(td.path(), "buildfile", "print $src_root\n");

    let t = test_ctx();
    run(&t, td.path(), "").unwrap();
    let printed = t.stdout.take();
    assert!(printed.trim_end().ends_with('/'), "src_root renders as a directory: {printed}");

    let root_id = t.ctx.scopes.find(&DirPath::new(td.path()));
    let root = t.ctx.scopes.get(root_id);
    let extra = root.root_extra().expect("project root");
    assert_eq!(extra.data.read().project.as_ref().map(ToString::to_string), Some("hello".to_owned()));
}

#[test]
fn missing_project_is_a_lookup_error() {
    let td = tempfile::tempdir().unwrap();
    let t = test_ctx();
    let e = run(&t, td.path(), "").unwrap_err();
    assert_eq!(e.kind, cairn::ErrorKind::Lookup);
    assert!(e.to_string().contains("no project found"));
}

// ============================================================================
// root.build and modules
// ============================================================================

#[test]
fn root_build_is_loaded_once() {
    let td = tempfile::tempdir().unwrap();
    write(td.path(), "build/bootstrap.build", "project = p\n");
    write(td.path(), "build/root.build", "print root-loaded\n");
    write(td.path(), "buildfile", "");

    let t = test_ctx();
    run(&t, td.path(), "").unwrap();
    assert_eq!(t.stdout.take(), "root-loaded\n");
}

#[test]
fn using_unknown_module_fails_with_known_list() {
    let td = tempfile::tempdir().unwrap();
    write(td.path(), "build/bootstrap.build", "project = p\n");
    write(td.path(), "build/root.build", "using nonesuch\n");

    let t = test_ctx();
    let e = run(&t, td.path(), "").unwrap_err();
    assert_eq!(e.kind, cairn::ErrorKind::Lookup);
    assert!(e.to_string().contains("known modules"));
}

#[test]
fn optional_using_of_unknown_module_is_fine() {
    let td = tempfile::tempdir().unwrap();
    write(td.path(), "build/bootstrap.build", "project = p\n");
    write(td.path(), "build/root.build", "using? nonesuch\n");
    write(td.path(), "buildfile", "");

    let t = test_ctx();
    assert!(run(&t, td.path(), "").is_ok());
}

#[test]
fn cxx_module_registers_types_and_variables() {
    let td = tempfile::tempdir().unwrap();
    write(td.path(), "build/bootstrap.build", "project = p\n");
    write(td.path(), "build/root.build", "using cxx\n");
    write(td.path(), "buildfile", "");

    let t = test_ctx();
    run(&t, td.path(), "").unwrap();
    let tt = t.ctx.target_types();
    for n in ["cxx", "hxx", "obje", "liba", "libs"] {
        assert!(tt.find(n).is_some(), "type {n} registered");
    }
    drop(tt);
    assert!(t.ctx.var_pool().find("cxx.poptions").is_some());
}

// ============================================================================
// Subdirectory scopes and includes
// ============================================================================

#[test]
fn include_switches_scope_and_loads_once() {
    let td = tempfile::tempdir().unwrap();
    write(td.path(), "build/bootstrap.build", "project = p\n");
    write(td.path(), "buildfile", "include sub/\ninclude sub/\n");
    write(td.path(), "sub/buildfile", "print sub-loaded\nprint $out_base\n");

    let t = test_ctx();
    run(&t, td.path(), "").unwrap();
    let out = t.stdout.take();
    assert_eq!(out.matches("sub-loaded").count(), 1, "include is once-set");
    assert!(out.contains("sub"), "out_base reflects the subdirectory: {out}");
}

#[test]
fn cyclic_include_is_a_semantic_error() {
    let td = tempfile::tempdir().unwrap();
    write(td.path(), "build/bootstrap.build", "project = p\n");
    write(td.path(), "buildfile", "source a.build\n");
    write(td.path(), "a.build", "source b.build\n");
    write(td.path(), "b.build", "source a.build\n");

    let t = test_ctx();
    let e = run(&t, td.path(), "").unwrap_err();
    assert_eq!(e.kind, cairn::ErrorKind::Semantic);
    assert!(e.to_string().contains("cyclic"));
}

#[test]
fn pattern_variable_reaches_subdirectory_targets() {
    let td = tempfile::tempdir().unwrap();
    write(td.path(), "build/bootstrap.build", "project = p\n");
    write(td.path(), "build/root.build", "exe{*}: poptions += -DFOO\n");
    write(td.path(), "buildfile", "include sub/\n");
    write(td.path(), "sub/buildfile", "exe{app}:\n");

    let t = test_ctx();
    run(&t, td.path(), "").unwrap();
    let tt = t.ctx.target_types();
    let exe = tt.find("exe").unwrap();
    drop(tt);
    let target = t
        .ctx
        .targets
        .snapshot()
        .into_iter()
        .find(|x| x.key.typ == exe && x.key.name == "app")
        .expect("declared in subdir");
    let var = t.ctx.var_pool().find("poptions").unwrap();
    let l = target.find_var(&t.ctx, var).unwrap();
    assert_eq!(l.value.unwrap().display(), "-DFOO");
}

// ============================================================================
// Configure / disfigure
// ============================================================================

#[test]
fn configure_persists_config_variables() {
    let td = tempfile::tempdir().unwrap();
    write(td.path(), "build/bootstrap.build", "project = p\n");
    write(td.path(), "buildfile", "");

    let t = test_ctx_with(vec!["config.answer=42".to_owned()]);
    run(&t, td.path(), "configure(./)").unwrap();

    let saved = std::fs::read_to_string(td.path().join("build/config.build")).unwrap();
    assert!(saved.contains("config.answer = 42"), "saved: {saved}");

    // A later run picks the saved configuration up during bootstrap.
    write(td.path(), "buildfile", "print $config.answer\n");
    let t = test_ctx();
    run(&t, td.path(), "").unwrap();
    assert_eq!(t.stdout.take(), "42\n");

    // Disfigure removes it.
    let t = test_ctx();
    run(&t, td.path(), "disfigure(./)").unwrap();
    assert!(!td.path().join("build/config.build").exists());
}

// ============================================================================
// Import
// ============================================================================

#[test]
fn import_subproject_via_export_stub() {
    let td = tempfile::tempdir().unwrap();
    write(td.path(), "build/bootstrap.build", "project = outer\n");
    write(td.path(), "libx/build/bootstrap.build", "project = libx\n");
    write(td.path(), "libx/build/export.build", "export libx-result\n");
    write(td.path(), "buildfile", "import v = libx%file{anything}\nprint $v\n");

    let t = test_ctx();
    run(&t, td.path(), "").unwrap();
    assert_eq!(t.stdout.take().trim_end(), "libx-result");
}

#[test]
fn unresolved_qualified_import_names_project_and_target() {
    let td = tempfile::tempdir().unwrap();
    write(td.path(), "build/bootstrap.build", "project = p\n");
    write(td.path(), "buildfile", "import nosuchproj%file{gadget}\n");

    let t = test_ctx();
    let e = run(&t, td.path(), "").unwrap_err();
    let text = e.to_string();
    assert!(text.contains("nosuchproj"), "project named: {text}");
    assert!(text.contains("gadget"), "target named: {text}");
    assert!(text.contains("config.import.nosuchproj"), "hint given: {text}");
}

#[test]
fn optional_import_of_unresolved_is_empty() {
    let td = tempfile::tempdir().unwrap();
    write(td.path(), "build/bootstrap.build", "project = p\n");
    write(td.path(), "buildfile", "import? v = nosuchproj%file{gadget}\nprint $v\n");

    let t = test_ctx();
    run(&t, td.path(), "").unwrap();
    assert_eq!(t.stdout.take(), "\n", "an empty (but defined) value");
}

#[cfg(unix)]
#[test]
fn phase2_import_resolves_executables_from_path() {
    use std::os::unix::fs::PermissionsExt;

    let td = tempfile::tempdir().unwrap();
    let bindir = td.path().join("bin");
    std::fs::create_dir_all(&bindir).unwrap();
    let exe = bindir.join("cairn-test-tool");
    std::fs::write(&exe, "#!/bin/sh\necho hi\n").unwrap();
    std::fs::set_permissions(&exe, std::fs::Permissions::from_mode(0o755)).unwrap();

    write(td.path(), "proj/build/bootstrap.build", "project = p\n");
    write(td.path(), "proj/buildfile", "import tool = foo%exe{cairn-test-tool}\nprint $tool\n");

    let old_path = std::env::var_os("PATH").unwrap_or_default();
    let mut paths = vec![bindir.clone()];
    paths.extend(std::env::split_paths(&old_path));
    let joined = std::env::join_paths(paths).unwrap();
    // SAFETY: tests in this binary run in-process; the variable is
    // restored before the test returns and no other thread reads the
    // environment concurrently at this point.
    unsafe { std::env::set_var("PATH", &joined) };

    let t = test_ctx();
    let r = run(&t, &td.path().join("proj"), "");

    // SAFETY: see above.
    unsafe { std::env::set_var("PATH", &old_path) };

    r.unwrap();
    let printed = t.stdout.take();
    assert!(printed.contains("cairn-test-tool"), "resolved name printed: {printed}");

    // The resolved target carries its process path.
    let target = t
        .ctx
        .targets
        .snapshot()
        .into_iter()
        .find(|x| x.key.name == "cairn-test-tool")
        .expect("imported target");
    let var = t.ctx.var_pool().find("process_path").unwrap();
    let l = target.find_var(&t.ctx, var).unwrap();
    assert!(l.value.unwrap().display().contains("bin"));
}

// ============================================================================
// Scope lookup through the driver (storage property)
// ============================================================================

#[test]
fn lookup_storage_is_scope_map_of_the_walk() {
    let td = tempfile::tempdir().unwrap();
    write(td.path(), "build/bootstrap.build", "project = p\n");
    write(td.path(), "buildfile", "x = 1\ninclude sub/\n");
    write(td.path(), "sub/buildfile", "");

    let t = test_ctx();
    run(&t, td.path(), "").unwrap();
    let sub = t.ctx.scopes.find(&DirPath::new(td.path().join("sub")));
    let var = t.ctx.var_pool().find("x").unwrap();
    let l = scope::find(&t.ctx, sub, var).unwrap();
    let root = t.ctx.scopes.find(&DirPath::new(td.path()));
    assert_eq!(l.storage, cairn::Storage::Scope(root));
}
