//! The rule interface and the built-in rules.
//!
//! A rule is matched against `(action, target)` pairs; a successful match
//! is committed by `apply`, which may mutate the target (set its path,
//! attach ad hoc members, resolve prerequisites) and returns the recipe
//! that realizes the action during the execute phase.

use std::sync::Arc;

use indexmap::IndexMap;

use crate::{
    context::Context,
    diag::{self, Error},
    operation::{self, Action},
    target::{self, Target, TargetState, TargetTypeId},
};

/// The callable that realizes an action on a target.
#[derive(Clone)]
pub enum Recipe {
    /// Nothing to do; the target is unchanged.
    Noop,
    /// Delegate the outcome to the target's group.
    Group,
    Fn(Arc<RecipeFn>),
}

pub type RecipeFn = dyn Fn(&Arc<Context>, Action, &Arc<Target>) -> diag::Result<TargetState> + Send + Sync;

impl Recipe {
    pub fn from_fn<F>(f: F) -> Self
    where
        F: Fn(&Arc<Context>, Action, &Arc<Target>) -> diag::Result<TargetState> + Send + Sync + 'static,
    {
        Self::Fn(Arc::new(f))
    }
}

/// A build rule. `matches` is a stateless applicability check; `apply`
/// commits to the match and constructs the recipe.
pub trait Rule: Send + Sync {
    fn name(&self) -> &'static str;

    fn matches(&self, ctx: &Arc<Context>, a: Action, t: &Arc<Target>, hint: &str) -> bool;

    fn apply(&self, ctx: &Arc<Context>, a: Action, t: &Arc<Target>) -> diag::Result<Recipe>;
}

/// One registration in a scope's rule map.
#[derive(Clone)]
pub struct RuleEntry {
    pub hint: String,
    pub rule: Arc<dyn Rule>,
}

/// Per-scope rule registrations keyed by (meta-operation, operation) and
/// target type. Meta-operation 0 registers for any meta-operation;
/// registration order is preserved and is the tie-break among equally
/// hinted candidates.
#[derive(Default)]
pub struct RuleMap {
    map: IndexMap<(u8, u8), IndexMap<TargetTypeId, Vec<RuleEntry>>>,
}

impl RuleMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(
        &mut self,
        meta_operation: u8,
        operation: u8,
        typ: TargetTypeId,
        hint: &str,
        rule: Arc<dyn Rule>,
    ) {
        self.map
            .entry((meta_operation, operation))
            .or_default()
            .entry(typ)
            .or_default()
            .push(RuleEntry { hint: hint.to_owned(), rule });
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Candidates for `(meta, op, type)`, any-meta registrations after the
    /// exact ones, sorted so that longer hint matches come first.
    pub fn candidates(&self, meta_operation: u8, operation: u8, typ: TargetTypeId, hint: &str) -> Vec<RuleEntry> {
        let mut r: Vec<RuleEntry> = Vec::new();
        for key in [(meta_operation, operation), (0u8, operation)] {
            if key.0 == 0 && meta_operation == 0 {
                continue; // already collected
            }
            if let Some(by_type) = self.map.get(&key) {
                if let Some(entries) = by_type.get(&typ) {
                    r.extend(entries.iter().filter(|e| hint_matches(&e.hint, hint)).cloned());
                }
            }
        }
        if meta_operation == 0 {
            if let Some(by_type) = self.map.get(&(0, operation)) {
                if let Some(entries) = by_type.get(&typ) {
                    r.extend(entries.iter().filter(|e| hint_matches(&e.hint, hint)).cloned());
                }
            }
        }
        r.sort_by_key(|e| std::cmp::Reverse(e.hint.len()));
        r
    }
}

fn hint_matches(registered: &str, requested: &str) -> bool {
    requested.is_empty() || registered.is_empty() || registered.starts_with(requested)
}

/// Matches any target and does nothing. Registered for operations that
/// have no work for a type (e.g. `clean` on source files).
pub struct NoopRule;

impl Rule for NoopRule {
    fn name(&self) -> &'static str {
        "noop"
    }

    fn matches(&self, _ctx: &Arc<Context>, _a: Action, _t: &Arc<Target>, _hint: &str) -> bool {
        true
    }

    fn apply(&self, _ctx: &Arc<Context>, _a: Action, _t: &Arc<Target>) -> diag::Result<Recipe> {
        Ok(Recipe::Noop)
    }
}

/// Matches existing files that no other rule claims: the target is up to
/// date if the file exists, and an error otherwise.
pub struct FileRule;

impl Rule for FileRule {
    fn name(&self) -> &'static str {
        "file"
    }

    fn matches(&self, ctx: &Arc<Context>, _a: Action, t: &Arc<Target>, _hint: &str) -> bool {
        if !ctx.target_types().get(t.key.typ).file {
            return false;
        }
        match t.path() {
            Some(p) => p.exists(),
            None => {
                let file = ctx.target_types().file_name(t.key.typ, &t.key.name, t.key.ext.as_deref());
                t.key.dir.join_file(file).exists()
            }
        }
    }

    fn apply(&self, ctx: &Arc<Context>, _a: Action, t: &Arc<Target>) -> diag::Result<Recipe> {
        t.derive_path(ctx);
        Ok(Recipe::from_fn(|ctx, _a, t| {
            let m = t.load_mtime();
            if m == target::MTIME_NONEXISTENT {
                let tn = ctx.target_types().get(t.key.typ).name.clone();
                return Err(Error::lookup(format!("no rule to update {tn}{{{}}}", t.key.name))
                    .note(format!("file {} does not exist", t.path().unwrap_or_default().display())));
            }
            Ok(TargetState::Unchanged)
        }))
    }
}

/// `alias{}` (and `dir{}`): match and execute prerequisites, no file of
/// its own.
pub struct AliasRule;

impl Rule for AliasRule {
    fn name(&self) -> &'static str {
        "alias"
    }

    fn matches(&self, _ctx: &Arc<Context>, _a: Action, _t: &Arc<Target>, _hint: &str) -> bool {
        true
    }

    fn apply(&self, ctx: &Arc<Context>, a: Action, t: &Arc<Target>) -> diag::Result<Recipe> {
        operation::match_prerequisites(ctx, a, t)?;
        Ok(Recipe::from_fn(|ctx, a, t| {
            let (state, _) = operation::execute_prerequisites(ctx, a, t)?;
            Ok(state)
        }))
    }
}

/// `fsdir{}`: create the directory on update, remove it (when empty) on
/// clean.
pub struct FsdirRule;

impl Rule for FsdirRule {
    fn name(&self) -> &'static str {
        "fsdir"
    }

    fn matches(&self, _ctx: &Arc<Context>, _a: Action, _t: &Arc<Target>, _hint: &str) -> bool {
        true
    }

    fn apply(&self, ctx: &Arc<Context>, a: Action, t: &Arc<Target>) -> diag::Result<Recipe> {
        operation::match_prerequisites(ctx, a, t)?;
        if a.operation == operation::CLEAN {
            return Ok(Recipe::from_fn(|ctx, a, t| {
                let (prereq_state, _) = operation::execute_prerequisites(ctx, a, t)?;
                let dir = t.out_dir().as_path().to_path_buf();
                if dir.is_dir() && std::fs::read_dir(&dir)?.next().is_none() {
                    if ctx.dry_run {
                        ctx.diag.progress(1, &format!("rmdir {}", dir.display()));
                    } else {
                        ctx.diag.progress(2, &format!("rmdir {}", dir.display()));
                        std::fs::remove_dir(&dir)?;
                    }
                    return Ok(TargetState::Changed);
                }
                Ok(prereq_state)
            }));
        }
        Ok(Recipe::from_fn(|ctx, a, t| {
            let (prereq_state, _) = operation::execute_prerequisites(ctx, a, t)?;
            let dir = t.out_dir().as_path().to_path_buf();
            if dir.is_dir() {
                return Ok(prereq_state);
            }
            if ctx.dry_run {
                ctx.diag.progress(1, &format!("mkdir {}", dir.display()));
            } else {
                ctx.diag.progress(2, &format!("mkdir {}", dir.display()));
                std::fs::create_dir_all(&dir)?;
            }
            Ok(TargetState::Changed)
        }))
    }
}

/// The standard clean recipe for file targets produced in the out tree:
/// remove the file and its depdb.
pub fn clean_recipe() -> Recipe {
    Recipe::from_fn(|ctx, a, t| {
        let (prereq_state, _) = operation::execute_prerequisites(ctx, a, t)?;
        let mut state = prereq_state;
        let Some(p) = t.path() else { return Ok(state) };
        let mut removed = false;
        for f in [p.clone(), depdb_path(&p)] {
            if f.exists() {
                ctx.diag.progress(2, &format!("rm {}", f.display()));
                if !ctx.dry_run {
                    std::fs::remove_file(&f)?;
                }
                removed = true;
            }
        }
        if removed {
            ctx.diag.progress(1, &format!("rm {}", p.display()));
            state = state.max(TargetState::Changed);
        }
        t.set_mtime(target::MTIME_NONEXISTENT);
        Ok(state)
    })
}

/// The depdb file sits next to its target.
pub fn depdb_path(target_path: &std::path::Path) -> std::path::PathBuf {
    let mut s = target_path.as_os_str().to_owned();
    s.push(".d");
    std::path::PathBuf::from(s)
}
