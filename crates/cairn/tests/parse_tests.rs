//! Buildfile parser tests: assignments, typing, expansion, evaluation
//! contexts, conditionals, groups, and directives.

mod common;

use cairn::{DirPath, scope, value};
use common::{parse_err, parse_into, scratch_root, test_ctx};
use pretty_assertions::assert_eq;

fn lookup_display(t: &common::TestCtx, root: cairn::ScopeId, name: &str) -> String {
    let var = t.ctx.var_pool().find(name).expect("variable interned");
    let l = scope::find(&t.ctx, root, var).expect("lookup");
    l.value.map_or_else(|| "<undefined>".to_owned(), |v| v.display())
}

// ============================================================================
// Variable assignment and typing
// ============================================================================

#[test]
fn uint64_typing_and_append() {
    let t = test_ctx();
    let root = scratch_root(&t.ctx, "/p");
    parse_into(&t, root, "x = [uint64] 41\nx += 1\nprint $x\n");
    assert_eq!(t.stdout.take(), "42\n");
}

#[test]
fn plain_assignment_stays_untyped() {
    let t = test_ctx();
    let root = scratch_root(&t.ctx, "/p");
    parse_into(&t, root, "x = a b c\n");
    assert_eq!(lookup_display(&t, root, "x"), "a b c");
}

#[test]
fn prepend_operator() {
    let t = test_ctx();
    let root = scratch_root(&t.ctx, "/p");
    parse_into(&t, root, "x = b\nx =+ a\nprint $x\n");
    assert_eq!(t.stdout.take(), "a b\n");
}

#[test]
fn null_attribute() {
    let t = test_ctx();
    let root = scratch_root(&t.ctx, "/p");
    parse_into(&t, root, "x = [null]\nprint $x\n");
    assert_eq!(t.stdout.take(), "[null]\n");
}

#[test]
fn typed_variable_declaration() {
    let t = test_ctx();
    let root = scratch_root(&t.ctx, "/p");
    parse_into(&t, root, "[string] greeting = hello\nprint $greeting\n");
    let var = t.ctx.var_pool().find("greeting").unwrap();
    assert_eq!(t.ctx.var_pool().get(var).typ, Some(value::STRING));
    assert_eq!(t.stdout.take(), "hello\n");
}

#[test]
fn variable_expansion_concatenates() {
    let t = test_ctx();
    let root = scratch_root(&t.ctx, "/p");
    parse_into(&t, root, "stem = hello\nfile = $stem.c\nprint $file\n");
    assert_eq!(t.stdout.take(), "hello.c\n");
}

#[test]
fn undefined_expansion_is_empty() {
    let t = test_ctx();
    let root = scratch_root(&t.ctx, "/p");
    // The expansion contributes nothing; surrounding text concatenates.
    parse_into(&t, root, "print a${undefined_variable_42}b\n");
    assert_eq!(t.stdout.take(), "ab\n");
}

// ============================================================================
// Evaluation contexts
// ============================================================================

#[test]
fn comparison_promotes_untyped_operand() {
    let t = test_ctx();
    let root = scratch_root(&t.ctx, "/p");
    parse_into(&t, root, "x = [uint64] 10\ny = ($x == 10)\nprint $y\n");
    assert_eq!(t.stdout.take(), "true\n");
}

#[test]
fn ternary_and_logic() {
    let t = test_ctx();
    let root = scratch_root(&t.ctx, "/p");
    parse_into(&t, root, "b = [bool] true\nr = ($b ? yes : no)\nprint $r\n");
    assert_eq!(t.stdout.take(), "yes\n");
}

#[test]
fn short_circuit_skips_errors() {
    let t = test_ctx();
    let root = scratch_root(&t.ctx, "/p");
    // The second operand calls an unknown function; it must not be
    // evaluated when the first already decides.
    parse_into(&t, root, "b = (true || $no_such_function(1))\nprint $b\n");
    assert_eq!(t.stdout.take(), "true\n");
}

#[test]
fn comparison_operators() {
    let t = test_ctx();
    let root = scratch_root(&t.ctx, "/p");
    parse_into(
        &t,
        root,
        "a = [uint64] 2\nprint ($a < 10)\nprint ($a >= 2)\nprint ($a != 2)\n",
    );
    assert_eq!(t.stdout.take(), "true\ntrue\nfalse\n");
}

// ============================================================================
// Conditionals and assertions
// ============================================================================

#[test]
fn if_elif_else() {
    let t = test_ctx();
    let root = scratch_root(&t.ctx, "/p");
    let text = "\
x = [uint64] 2
if ($x == 1)
{
  print one
}
elif ($x == 2)
{
  print two
}
else
{
  print many
}
";
    parse_into(&t, root, text);
    assert_eq!(t.stdout.take(), "two\n");
}

#[test]
fn negated_if() {
    let t = test_ctx();
    let root = scratch_root(&t.ctx, "/p");
    parse_into(&t, root, "if! false\n{\nprint taken\n}\n");
    assert_eq!(t.stdout.take(), "taken\n");
}

#[test]
fn untaken_branch_is_not_evaluated() {
    let t = test_ctx();
    let root = scratch_root(&t.ctx, "/p");
    let text = "\
if false
{
  x = $no_such_function(boom)
  print unreachable
}
print done
";
    parse_into(&t, root, text);
    assert_eq!(t.stdout.take(), "done\n");
}

#[test]
fn assert_passes_and_fails() {
    let t = test_ctx();
    let root = scratch_root(&t.ctx, "/p");
    parse_into(&t, root, "assert true\n");

    let e = parse_err(&t, root, "assert false message here\n");
    assert_eq!(e.kind, cairn::ErrorKind::Semantic);
    assert!(e.to_string().contains("message here"));
}

#[test]
fn negated_assert() {
    let t = test_ctx();
    let root = scratch_root(&t.ctx, "/p");
    parse_into(&t, root, "assert! false\n");
    assert!(parse_err(&t, root, "assert! true\n").to_string().contains("assertion failed"));
}

// ============================================================================
// Names: groups, crossing, pairs
// ============================================================================

#[test]
fn group_crossing() {
    let t = test_ctx();
    let root = scratch_root(&t.ctx, "/p");
    parse_into(&t, root, "x = {a b}{c d}\nprint $x\n");
    assert_eq!(t.stdout.take(), "a/c a/d b/c b/d\n");
}

#[test]
fn typed_group_distributes() {
    let t = test_ctx();
    let root = scratch_root(&t.ctx, "/p");
    parse_into(&t, root, "exe{one two}: \n");
    let tt = t.ctx.target_types();
    let exe = tt.find("exe").unwrap();
    drop(tt);
    let found = t
        .ctx
        .targets
        .snapshot()
        .into_iter()
        .filter(|x| x.key.typ == exe)
        .map(|x| x.key.name.clone())
        .collect::<Vec<_>>();
    assert!(found.contains(&"one".to_owned()) && found.contains(&"two".to_owned()));
}

#[test]
fn nested_type_in_group_is_an_error() {
    let t = test_ctx();
    let root = scratch_root(&t.ctx, "/p");
    let e = parse_err(&t, root, "x = exe{file{a}}\n");
    assert_eq!(e.kind, cairn::ErrorKind::Parse);
}

#[test]
fn pair_names() {
    let t = test_ctx();
    let root = scratch_root(&t.ctx, "/p");
    parse_into(&t, root, "x = a@b\nprint $x\n");
    assert_eq!(t.stdout.take(), "a@b\n");
}

#[test]
fn quoted_names_keep_spaces() {
    let t = test_ctx();
    let root = scratch_root(&t.ctx, "/p");
    parse_into(&t, root, "x = 'hello world'\nprint $x\n");
    assert_eq!(t.stdout.take(), "'hello world'\n");
}

// ============================================================================
// Directives
// ============================================================================

#[test]
fn define_derives_target_type() {
    let t = test_ctx();
    let root = scratch_root(&t.ctx, "/p");
    parse_into(&t, root, "define script: file\nscript{install}: \n");
    let tt = t.ctx.target_types();
    let script = tt.find("script").expect("derived type registered");
    assert!(tt.is_a(script, cairn::target::FILE));
}

#[test]
fn define_duplicate_fails() {
    let t = test_ctx();
    let root = scratch_root(&t.ctx, "/p");
    let e = parse_err(&t, root, "define exe: file\n");
    assert_eq!(e.kind, cairn::ErrorKind::Semantic);
}

#[test]
fn unknown_directive_position_is_statement() {
    let t = test_ctx();
    let root = scratch_root(&t.ctx, "/p");
    // `printx` is not a directive; as a statement it needs ':' or '='.
    let e = parse_err(&t, root, "printx\n");
    assert_eq!(e.kind, cairn::ErrorKind::Parse);
}

// ============================================================================
// Target declarations
// ============================================================================

#[test]
fn dependency_line_records_prerequisites_in_order() {
    let t = test_ctx();
    let root = scratch_root(&t.ctx, "/p");
    parse_into(&t, root, "exe{app}: file{zz} file{aa} file{mm}\n");
    let tt = t.ctx.target_types();
    let exe = tt.find("exe").unwrap();
    drop(tt);
    let target = t
        .ctx
        .targets
        .snapshot()
        .into_iter()
        .find(|x| x.key.typ == exe && x.key.name == "app")
        .expect("declared");
    let prereqs: Vec<String> =
        target.core.read().prerequisites.iter().map(|p| p.name.clone()).collect();
    assert_eq!(prereqs, vec!["zz", "aa", "mm"], "declaration order is preserved");
}

#[test]
fn target_block_variables() {
    let t = test_ctx();
    let root = scratch_root(&t.ctx, "/p");
    let text = "\
exe{app}:
{
  opts = fast small
}
";
    parse_into(&t, root, text);
    let tt = t.ctx.target_types();
    let exe = tt.find("exe").unwrap();
    drop(tt);
    let target = t
        .ctx
        .targets
        .snapshot()
        .into_iter()
        .find(|x| x.key.typ == exe && x.key.name == "app")
        .unwrap();
    let var = t.ctx.var_pool().find("opts").unwrap();
    let l = target.find_var(&t.ctx, var).unwrap();
    assert_eq!(l.value.unwrap().display(), "fast small");
    assert!(matches!(l.storage, cairn::Storage::Target(_)));
}

#[test]
fn target_specific_variable_line() {
    let t = test_ctx();
    let root = scratch_root(&t.ctx, "/p");
    parse_into(&t, root, "exe{app}: flavor = blue\n");
    let tt = t.ctx.target_types();
    let exe = tt.find("exe").unwrap();
    drop(tt);
    let target = t
        .ctx
        .targets
        .snapshot()
        .into_iter()
        .find(|x| x.key.typ == exe && x.key.name == "app")
        .unwrap();
    let var = t.ctx.var_pool().find("flavor").unwrap();
    let l = target.find_var(&t.ctx, var).unwrap();
    assert_eq!(l.value.unwrap().display(), "blue");
}

// ============================================================================
// Builtin functions
// ============================================================================

#[test]
fn type_null_empty_functions() {
    let t = test_ctx();
    let root = scratch_root(&t.ctx, "/p");
    let text = "\
x = [uint64] 5
e =
print $type($x)
print $null($x)
print $empty($e)
print $string($x)
";
    parse_into(&t, root, text);
    assert_eq!(t.stdout.take(), "uint64\nfalse\ntrue\n5\n");
}

#[test]
fn path_functions() {
    let t = test_ctx();
    let root = scratch_root(&t.ctx, "/p");
    parse_into(&t, root, "f = dir/file.txt\nprint $path.leaf($f)\nprint $path.base(file.txt)\n");
    assert_eq!(t.stdout.take(), "file.txt\nfile\n");
}

#[test]
fn unknown_function_is_a_parse_error() {
    let t = test_ctx();
    let root = scratch_root(&t.ctx, "/p");
    let e = parse_err(&t, root, "x = $definitely_not_a_function(1)\n");
    assert_eq!(e.kind, cairn::ErrorKind::Parse);
    assert!(e.to_string().contains("definitely_not_a_function"));
}

// ============================================================================
// Buildspec
// ============================================================================

#[test]
fn buildspec_forms() {
    use cairn::parse::parse_buildspec;
    let e = parse_buildspec("update").unwrap();
    assert_eq!(e[0].operation.as_deref(), Some("update"));

    let e = parse_buildspec("clean(tests/ doc/)").unwrap();
    assert_eq!(e[0].operation.as_deref(), Some("clean"));
    assert_eq!(e[0].targets, vec!["tests/", "doc/"]);

    let e = parse_buildspec("configure(update(./))").unwrap();
    assert_eq!(e[0].meta_operation.as_deref(), Some("configure"));
    assert_eq!(e[0].operation.as_deref(), Some("update"));
    assert_eq!(e[0].targets, vec!["./"]);

    let e = parse_buildspec("update(a/), clean(b/)").unwrap();
    assert_eq!(e.len(), 2);
}
