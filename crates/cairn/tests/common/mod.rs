//! Shared helpers for the integration tests: a serial context with
//! captured diagnostics and a scratch project root scope.

use std::sync::Arc;

use cairn::{
    Capture, Context, ContextConfig, Diagnostics, DirPath,
    scope::{RootExtra, ScopeId},
};

pub struct TestCtx {
    pub ctx: Arc<Context>,
    pub stderr: Capture,
    pub stdout: Capture,
}

/// A serial context whose stderr/stdout diagnostics are captured.
pub fn test_ctx() -> TestCtx {
    test_ctx_with(Vec::new())
}

pub fn test_ctx_with(overrides: Vec<String>) -> TestCtx {
    let stderr = Capture::new();
    let stdout = Capture::new();
    let diag = Diagnostics::new(1).with_writers(Box::new(stderr.clone()), Box::new(stdout.clone()));
    let config = ContextConfig { jobs: 1, overrides, diag: Some(diag), ..ContextConfig::default() };
    let ctx = Context::new(config).expect("context");
    TestCtx { ctx, stderr, stdout }
}

/// Create a scope at `dir` and promote it to a project root so parsing
/// and lookup have somewhere to live.
pub fn scratch_root(ctx: &Arc<Context>, dir: &str) -> ScopeId {
    let (s, _) = ctx.scopes.insert(&DirPath::new(dir));
    s.links.write().root = Some(s.id);
    *s.root_extra.write() = Some(Arc::new(RootExtra::new()));
    s.id
}

/// Parse buildfile text into a scratch root.
pub fn parse_into(t: &TestCtx, root: ScopeId, text: &str) {
    cairn::parse::parse_buildfile_text(&t.ctx, text, "buildfile", root, root).expect("parse");
}

pub fn parse_err(t: &TestCtx, root: ScopeId, text: &str) -> cairn::Error {
    cairn::parse::parse_buildfile_text(&t.ctx, text, "buildfile", root, root)
        .expect_err("expected parse failure")
}
