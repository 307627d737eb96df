//! Actions and the operation driver: recursive match, parallel execute,
//! and dependency-edge iteration.
//!
//! Within one action on one target, match happens-before apply
//! happens-before recipe. Across the graph, a target's recipe observes
//! all direct non-ad-hoc prerequisite recipes completed. Sibling
//! completion order is unspecified, but `prerequisite_targets` preserves
//! declaration order for rules that care (linker input order).

use std::{cell::RefCell, fmt, sync::Arc};

use crate::{
    context::Context,
    diag::{self, Error},
    rule::Recipe,
    scheduler::{RunPhase, TaskCount, new_count},
    target::{
        Include, MTIME_NONEXISTENT, PrereqTarget, Progress, Target, TargetId, TargetState,
    },
};

// Meta-operation ids, stable for the context lifetime.
pub const NOOP_META: u8 = 0;
pub const PERFORM: u8 = 1;
pub const CONFIGURE: u8 = 2;
pub const DISFIGURE: u8 = 3;
pub const DUMP: u8 = 4;
pub const INFO: u8 = 5;

// Operation ids.
pub const DEFAULT: u8 = 1;
pub const UPDATE: u8 = 2;
pub const CLEAN: u8 = 3;

pub fn meta_operation_name(id: u8) -> &'static str {
    match id {
        PERFORM => "perform",
        CONFIGURE => "configure",
        DISFIGURE => "disfigure",
        DUMP => "dump",
        INFO => "info",
        _ => "noop",
    }
}

pub fn parse_meta_operation(name: &str) -> Option<u8> {
    Some(match name {
        "perform" => PERFORM,
        "configure" => CONFIGURE,
        "disfigure" => DISFIGURE,
        "dump" => DUMP,
        "info" => INFO,
        _ => return None,
    })
}

pub fn operation_name(id: u8) -> &'static str {
    match id {
        UPDATE => "update",
        CLEAN => "clean",
        _ => "default",
    }
}

pub fn parse_operation(name: &str) -> Option<u8> {
    Some(match name {
        "default" => DEFAULT,
        "update" => UPDATE,
        "clean" => CLEAN,
        _ => return None,
    })
}

/// What to do with a target in a given cycle: the meta-operation and
/// operation pair, plus the outer operation when this action runs as a
/// pre/post operation of another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Action {
    pub meta_operation: u8,
    pub operation: u8,
    pub outer_operation: u8,
}

impl Action {
    pub fn new(meta_operation: u8, operation: u8) -> Self {
        Self { meta_operation, operation, outer_operation: 0 }
    }

    #[must_use]
    pub fn with_outer(mut self, outer: u8) -> Self {
        self.outer_operation = outer;
        self
    }

    pub fn inner(self) -> Self {
        Self { outer_operation: 0, ..self }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", meta_operation_name(self.meta_operation), operation_name(self.operation))
    }
}

thread_local! {
    /// Targets being matched/executed synchronously by this thread; a
    /// re-entry is a dependency cycle.
    static CHAIN: RefCell<Vec<TargetId>> = const { RefCell::new(Vec::new()) };
}

struct ChainGuard;

fn chain_enter(ctx: &Context, t: &Target) -> diag::Result<ChainGuard> {
    let cycle = CHAIN.with(|c| {
        let mut c = c.borrow_mut();
        if c.contains(&t.id) {
            return true;
        }
        c.push(t.id);
        false
    });
    if cycle {
        let tn = ctx.target_types().get(t.key.typ).name.clone();
        return Err(Error::cycle(format!(
            "dependency cycle detected involving target {tn}{{{}}}",
            t.key.name
        )));
    }
    Ok(ChainGuard)
}

impl Drop for ChainGuard {
    fn drop(&mut self) {
        CHAIN.with(|c| {
            c.borrow_mut().pop();
        });
    }
}

/// Enqueue matching of a target, bracketed by the target's busy counter.
pub fn match_async(ctx: &Arc<Context>, a: Action, t: &Arc<Target>, count: &TaskCount) {
    if ctx.fail.get() {
        return;
    }
    let ctx2 = ctx.clone();
    let t2 = t.clone();
    t.state(a).count.fetch_add(1, std::sync::atomic::Ordering::AcqRel);
    ctx.sched.spawn(count, move || {
        if let Err(e) = match_direct(&ctx2, a, &t2) {
            ctx2.fail_with(&e);
            t2.state(a).set_progress(Progress::Failed);
            t2.state(a).set_result(TargetState::Failed);
        }
        t2.state(a).count.fetch_sub(1, std::sync::atomic::Ordering::AcqRel);
    });
}

/// Match a target for an action: select a rule, apply it, store the
/// recipe. Idempotent; concurrent calls wait for the first to finish.
pub fn match_direct(ctx: &Arc<Context>, a: Action, t: &Arc<Target>) -> diag::Result<()> {
    let st = t.state(a);
    loop {
        match st.progress() {
            Progress::Applied | Progress::Executed => return Ok(()),
            Progress::Failed => {
                return Err(Error::semantic(format!(
                    "failed to match target {}",
                    t.key.name
                )));
            }
            Progress::Busy => {
                // Another worker is matching; help the pool along.
                let g = chain_enter(ctx, t)?;
                drop(g);
                std::thread::yield_now();
            }
            Progress::Unknown | Progress::Postponed => {
                if !st.try_progress(Progress::Unknown, Progress::Busy)
                    && !st.try_progress(Progress::Postponed, Progress::Busy)
                {
                    continue;
                }
                let _g = chain_enter(ctx, t)?;
                match match_impl(ctx, a, t) {
                    Ok(()) => {
                        st.set_progress(Progress::Applied);
                        return Ok(());
                    }
                    Err(e) => {
                        st.set_progress(Progress::Failed);
                        st.set_result(TargetState::Failed);
                        return Err(e);
                    }
                }
            }
        }
    }
}

fn match_impl(ctx: &Arc<Context>, a: Action, t: &Arc<Target>) -> diag::Result<()> {
    // Walk the scope chain consulting rule maps over the target's type
    // chain; the first rule whose `matches` agrees wins.
    let hint = String::new();
    let type_chain = ctx.target_types().chain(t.key.typ);

    let mut scope = Some(t.base_scope);
    let mut selected = None;
    'outer: while let Some(sid) = scope {
        let s = ctx.scopes.get(sid);
        for action in [a, a.inner()] {
            for typ in &type_chain {
                let candidates =
                    s.rules
                        .read()
                        .candidates(action.meta_operation, action.operation, *typ, &hint);
                for entry in candidates {
                    if entry.rule.matches(ctx, a, t, &entry.hint) {
                        selected = Some(entry.rule);
                        break 'outer;
                    }
                }
            }
            if a.outer_operation == 0 {
                break; // no distinct inner action to retry with
            }
        }
        scope = s.parent();
    }

    let Some(rule) = selected else {
        let tn = ctx.target_types().get(t.key.typ).name.clone();
        return Err(Error::lookup(format!(
            "no rule to {} target {tn}{{{}}}",
            operation_name(a.operation),
            t.key.name
        ))
        .note(format!("consider loading a module that provides a {tn}{{}} rule")));
    };

    tracing::debug!(target: "cairn::match", rule = rule.name(), name = %t.key.name, "matched");
    let recipe = rule.apply(ctx, a, t)?;
    let mut data = t.state(a).data.lock();
    data.rule = Some(rule);
    data.recipe = Some(recipe);
    Ok(())
}

/// Resolve and match this target's declared prerequisites, populating
/// `prerequisite_targets[a]` in declaration order. Called by rules from
/// `apply`.
pub fn match_prerequisites(ctx: &Arc<Context>, a: Action, t: &Arc<Target>) -> diag::Result<()> {
    let include_var = {
        let pool = ctx.var_pool();
        pool.find("include")
    };

    let mut resolved = Vec::new();
    {
        let core = t.core.read();
        for p in &core.prerequisites {
            let mut include = Include::Normal;
            let mut adhoc = false;
            if let Some(var) = include_var {
                let pool = ctx.var_pool();
                if let Some((e, _)) = p.vars.lookup(&pool, var) {
                    let ns = e.value.reverse();
                    for n in &ns {
                        match n.value.as_str() {
                            "false" => include = Include::Excluded,
                            "adhoc" => {
                                include = Include::Adhoc;
                                adhoc = true;
                            }
                            _ => {}
                        }
                    }
                }
            }
            let pt = if include == Include::Excluded {
                PrereqTarget { target: None, include, adhoc, unmatched: false, data: 0 }
            } else {
                let pt = crate::target::search(ctx, t.base_scope, p)?;
                PrereqTarget { target: Some(pt.id), include, adhoc, unmatched: false, data: 0 }
            };
            resolved.push(pt);
        }
    }

    // Asynchronously match everything we resolved.
    let count = new_count();
    for pt in &resolved {
        if let Some(id) = pt.target {
            let pt_arc = ctx.targets.get(id);
            match_async(ctx, a, &pt_arc, &count);
        }
    }
    ctx.sched.wait(&count);
    if ctx.fail.get() && !ctx.keep_going {
        return Err(Error::semantic(format!(
            "failed to match prerequisites of target {}",
            t.key.name
        )));
    }

    t.state(a).data.lock().prerequisite_targets = resolved;
    Ok(())
}

/// Enqueue execution of a matched target.
pub fn execute_async(ctx: &Arc<Context>, a: Action, t: &Arc<Target>, count: &TaskCount) {
    if ctx.fail.get() && !ctx.keep_going {
        return;
    }
    let ctx2 = ctx.clone();
    let t2 = t.clone();
    t.state(a).count.fetch_add(1, std::sync::atomic::Ordering::AcqRel);
    ctx.sched.spawn(count, move || {
        if let Err(e) = execute_direct(&ctx2, a, &t2) {
            ctx2.fail_with(&e);
        }
        t2.state(a).count.fetch_sub(1, std::sync::atomic::Ordering::AcqRel);
    });
}

/// Execute a matched target once, waiting if another worker already is.
pub fn execute_direct(ctx: &Arc<Context>, a: Action, t: &Arc<Target>) -> diag::Result<TargetState> {
    let st = t.state(a);
    loop {
        match st.progress() {
            Progress::Executed => {
                let r = st.result();
                if r == TargetState::Failed {
                    return Err(target_failed(ctx, t));
                }
                return Ok(r);
            }
            Progress::Failed => return Err(target_failed(ctx, t)),
            Progress::Applied => {
                if !st.try_progress(Progress::Applied, Progress::Busy) {
                    continue;
                }
                let _g = chain_enter(ctx, t)?;
                let r = execute_impl(ctx, a, t);
                match r {
                    Ok(state) => {
                        st.set_result(state);
                        st.set_progress(Progress::Executed);
                        return Ok(state);
                    }
                    Err(e) => {
                        st.set_result(TargetState::Failed);
                        st.set_progress(Progress::Executed);
                        return Err(e);
                    }
                }
            }
            Progress::Busy => {
                let g = chain_enter(ctx, t)?;
                drop(g);
                std::thread::yield_now();
            }
            Progress::Unknown | Progress::Postponed => {
                return Err(Error::internal(format!(
                    "target {} executed before being matched",
                    t.key.name
                )));
            }
        }
    }
}

fn target_failed(ctx: &Arc<Context>, t: &Arc<Target>) -> Error {
    let tn = ctx.target_types().get(t.key.typ).name.clone();
    Error::semantic(format!("failed to update target {tn}{{{}}}", t.key.name))
}

fn execute_impl(ctx: &Arc<Context>, a: Action, t: &Arc<Target>) -> diag::Result<TargetState> {
    let recipe = t.state(a).data.lock().recipe.clone();
    match recipe {
        None | Some(Recipe::Noop) => Ok(TargetState::Unchanged),
        Some(Recipe::Group) => {
            let group = t.core.read().group;
            match group {
                Some(g) => {
                    let gt = ctx.targets.get(g);
                    execute_direct(ctx, a, &gt)
                }
                None => Ok(TargetState::Unchanged),
            }
        }
        Some(Recipe::Fn(f)) => f(ctx, a, t),
    }
}

/// Execute all direct prerequisites of a target and wait for them.
///
/// Ad hoc prerequisites are still executed but do not contribute to the
/// aggregate state or the returned max mtime; unmatched and excluded
/// entries are skipped. Returns the aggregate state and the maximum
/// prerequisite mtime (for the standard out-of-date check).
pub fn execute_prerequisites(
    ctx: &Arc<Context>,
    a: Action,
    t: &Arc<Target>,
) -> diag::Result<(TargetState, u64)> {
    let prereqs: Vec<PrereqTarget> = t.state(a).data.lock().prerequisite_targets.clone();

    let count = new_count();
    for pt in &prereqs {
        if pt.include == Include::Excluded || pt.unmatched {
            continue;
        }
        if let Some(id) = pt.target {
            let p = ctx.targets.get(id);
            // Serial-safe: execute_async runs inline in serial mode, so
            // cycles surface through the thread-local chain.
            execute_async(ctx, a, &p, &count);
        }
    }
    ctx.sched.wait(&count);

    let mut state = TargetState::Unchanged;
    let mut mtime = MTIME_NONEXISTENT;
    for pt in &prereqs {
        if pt.include == Include::Excluded || pt.unmatched {
            continue;
        }
        let Some(id) = pt.target else { continue };
        let p = ctx.targets.get(id);
        let ps = p.state(a);
        match ps.progress() {
            Progress::Executed => {
                let r = ps.result();
                if r == TargetState::Failed {
                    return Err(prereq_failed(ctx, t, &p));
                }
                if pt.include != Include::Adhoc && !pt.adhoc {
                    state = state.max(r);
                    if ctx.target_types().get(p.key.typ).file {
                        mtime = mtime.max(p.load_mtime());
                    }
                }
            }
            Progress::Failed => return Err(prereq_failed(ctx, t, &p)),
            _ => {
                return Err(Error::internal(format!(
                    "prerequisite {} of {} not executed",
                    p.key.name, t.key.name
                )));
            }
        }
    }
    Ok((state, mtime))
}

fn prereq_failed(ctx: &Arc<Context>, t: &Arc<Target>, p: &Arc<Target>) -> Error {
    let tn = ctx.target_types().get(t.key.typ).name.clone();
    let pn = ctx.target_types().get(p.key.typ).name.clone();
    Error::semantic(format!(
        "failed to update target {tn}{{{}}}",
        t.key.name
    ))
    .note(format!("prerequisite {pn}{{{}}} failed", p.key.name))
}

/// Perform one (meta-operation, operation) over a set of requested
/// targets: match wave, execute wave, and the summary diagnostics.
pub fn perform(ctx: &Arc<Context>, a: Action, targets: &[Arc<Target>]) -> diag::Result<TargetState> {
    if targets.is_empty() {
        ctx.diag.info("no target to update");
        return Ok(TargetState::Unchanged);
    }

    {
        let _phase = ctx.phase.lock(RunPhase::Match);
        let count = new_count();
        for t in targets {
            match_async(ctx, a, t, &count);
        }
        ctx.sched.wait(&count);
    }
    if ctx.fail.get() && !ctx.keep_going {
        return Err(Error::semantic(format!("failed to {a}")));
    }

    let mut state = TargetState::Unchanged;
    {
        let _phase = ctx.phase.lock(RunPhase::Execute);
        let count = new_count();
        for t in targets {
            if t.state(a).progress() == Progress::Applied {
                execute_async(ctx, a, t, &count);
            }
        }
        ctx.sched.wait(&count);
    }

    let mut trivial = true;
    for t in targets {
        let st = t.state(a);
        state = state.max(st.result());
        trivial = trivial
            && st.data.lock().prerequisite_targets.is_empty()
            && !ctx.target_types().get(t.key.typ).file;
    }

    if ctx.fail.get() || state == TargetState::Failed {
        return Err(Error::semantic(format!(
            "failed to {} some targets",
            operation_name(a.operation)
        )));
    }

    if state == TargetState::Unchanged {
        if trivial {
            ctx.diag.info("no target to update");
        } else {
            for t in targets {
                let tn = ctx.target_types().get(t.key.typ).name.clone();
                ctx.diag.info(&format!("target {tn}{{{}}} is up to date", t.key.name));
            }
        }
    }
    Ok(state)
}
