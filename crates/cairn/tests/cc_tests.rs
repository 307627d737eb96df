//! C toolchain tests: compile + link end to end against the system
//! compiler. Skipped (trivially passing) when no `cc` is available.

mod common;

use std::path::Path;

use cairn::{DirPath, TargetState, driver};
use common::{TestCtx, test_ctx};
use pretty_assertions::assert_eq;

fn have_cc() -> bool {
    std::process::Command::new("cc")
        .arg("--version")
        .output()
        .is_ok_and(|o| o.status.success())
}

fn write(root: &Path, rel: &str, content: &str) {
    let p = root.join(rel);
    std::fs::create_dir_all(p.parent().unwrap()).unwrap();
    std::fs::write(p, content).unwrap();
}

fn run(t: &TestCtx, dir: &Path, buildspec: &str) -> cairn::diag::Result<TargetState> {
    driver::run(&t.ctx, &DirPath::new(dir), buildspec)
}

const HELLO_C: &str = "\
#include \"greeting.h\"
#include <stdio.h>

int main(void)
{
  printf(\"%s\\n\", GREETING);
  return 0;
}
";

fn c_project(td: &Path) {
    write(td, "build/bootstrap.build", "project = hello\n");
    write(td, "build/root.build", "using c\n");
    write(td, "buildfile", "exe{hello}: obj{hello}\nobj{hello}: c{hello}\n");
    write(td, "greeting.h", "#define GREETING \"hi\"\n");
    write(td, "hello.c", HELLO_C);
}

#[test]
fn compile_and_link_then_unchanged() {
    if !have_cc() {
        return;
    }
    let td = tempfile::tempdir().unwrap();
    c_project(td.path());

    let t = test_ctx();
    assert_eq!(run(&t, td.path(), "").unwrap(), TargetState::Changed);
    let exe = td.path().join("hello");
    assert!(exe.exists(), "linked output exists");
    assert!(td.path().join("hello.o.d").exists(), "compile depdb written");

    // The produced binary runs.
    let out = std::process::Command::new(&exe).output().unwrap();
    assert_eq!(String::from_utf8_lossy(&out.stdout), "hi\n");

    // Second run, fresh context: everything is up to date, nothing
    // respawns (the object mtime is unchanged).
    let before = std::fs::metadata(td.path().join("hello.o")).unwrap().modified().unwrap();
    let t2 = test_ctx();
    assert_eq!(run(&t2, td.path(), "").unwrap(), TargetState::Unchanged);
    let after = std::fs::metadata(td.path().join("hello.o")).unwrap().modified().unwrap();
    assert_eq!(before, after, "no recompilation on an unchanged project");
}

#[test]
fn touched_header_recompiles() {
    if !have_cc() {
        return;
    }
    let td = tempfile::tempdir().unwrap();
    c_project(td.path());

    let t = test_ctx();
    run(&t, td.path(), "").unwrap();

    // The header was discovered dynamically; touching it re-runs the
    // compiler even though the buildfile never mentions it.
    let future = std::time::SystemTime::now() + std::time::Duration::from_secs(5);
    write(td.path(), "greeting.h", "#define GREETING \"hello there\"\n");
    let f = std::fs::File::options().write(true).open(td.path().join("greeting.h")).unwrap();
    f.set_modified(future).unwrap();

    let t2 = test_ctx();
    assert_eq!(run(&t2, td.path(), "").unwrap(), TargetState::Changed);
    let out = std::process::Command::new(td.path().join("hello")).output().unwrap();
    assert_eq!(String::from_utf8_lossy(&out.stdout), "hello there\n");
}

#[test]
fn changed_options_relink() {
    if !have_cc() {
        return;
    }
    let td = tempfile::tempdir().unwrap();
    c_project(td.path());

    let t = test_ctx();
    run(&t, td.path(), "").unwrap();

    // A poptions change invalidates through the depdb option hash.
    write(td.path(), "build/root.build", "using c\nc.poptions += -DEXTRA\n");
    let t2 = test_ctx();
    assert_eq!(run(&t2, td.path(), "").unwrap(), TargetState::Changed);
}

#[test]
fn clean_removes_built_artifacts() {
    if !have_cc() {
        return;
    }
    let td = tempfile::tempdir().unwrap();
    c_project(td.path());

    let t = test_ctx();
    run(&t, td.path(), "").unwrap();
    assert!(td.path().join("hello").exists());

    let t2 = test_ctx();
    assert_eq!(run(&t2, td.path(), "clean").unwrap(), TargetState::Changed);
    assert!(!td.path().join("hello").exists());
    assert!(!td.path().join("hello.o").exists());
    assert!(!td.path().join("hello.o.d").exists());
}

#[test]
fn source_chaining_synthesizes_objects() {
    if !have_cc() {
        return;
    }
    let td = tempfile::tempdir().unwrap();
    write(td.path(), "build/bootstrap.build", "project = direct\n");
    write(td.path(), "build/root.build", "using c\n");
    // No explicit obj{}: the link rule chains the source itself.
    write(td.path(), "buildfile", "exe{hello}: c{hello}\n");
    write(td.path(), "greeting.h", "#define GREETING \"chained\"\n");
    write(td.path(), "hello.c", HELLO_C);

    let t = test_ctx();
    assert_eq!(run(&t, td.path(), "").unwrap(), TargetState::Changed);
    let out = std::process::Command::new(td.path().join("hello")).output().unwrap();
    assert_eq!(String::from_utf8_lossy(&out.stdout), "chained\n");
}

#[test]
fn dry_run_spawns_nothing() {
    if !have_cc() {
        return;
    }
    let td = tempfile::tempdir().unwrap();
    c_project(td.path());

    let stderr = cairn::Capture::new();
    let stdout = cairn::Capture::new();
    let diag =
        cairn::Diagnostics::new(1).with_writers(Box::new(stderr.clone()), Box::new(stdout.clone()));
    let config = cairn::ContextConfig {
        jobs: 1,
        dry_run: true,
        diag: Some(diag),
        ..cairn::ContextConfig::default()
    };
    let ctx = cairn::Context::new(config).unwrap();
    driver::run(&ctx, &DirPath::new(td.path()), "").unwrap();
    assert!(!td.path().join("hello").exists(), "dry run must not produce outputs");
    assert!(stderr.take().contains("ld hello"), "commands are still reported");
}
