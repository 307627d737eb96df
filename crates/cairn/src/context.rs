//! The build context: the root object owning pools, scopes, targets, the
//! scheduler, and diagnostics.
//!
//! There are no module-level singletons; every operation receives the
//! context explicitly. The context is created once per driver invocation
//! and everything arena-allocated inside it lives until it is dropped.

use std::{path::PathBuf, sync::Arc};

use ahash::AHashMap;
use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::{
    diag::{self, Diagnostics, Error},
    function::FunctionMap,
    name::{Name, Names},
    scope::{CacheEntry, ScopeMap, Storage, VariableOverride},
    scheduler::{FailFlag, PhaseMutex, Scheduler},
    target::{TargetSet, TargetTypes},
    value,
    variable::{OverrideKind, Variable, VariableId, VariablePool, Visibility},
};

/// Construction options for a context; the driver fills this from the
/// command line.
pub struct ContextConfig {
    pub jobs: usize,
    pub verbosity: u8,
    pub dry_run: bool,
    pub keep_going: bool,
    /// Emit the `dump` meta-operation as JSON instead of text.
    pub dump_json: bool,
    /// Raw command-line variable overrides, in order
    /// (`name=value`, `name+=value`, `name=+value`, `dir/@name=value`).
    pub overrides: Vec<String>,
    /// Custom diagnostics sink (tests capture output through this).
    pub diag: Option<Diagnostics>,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            jobs: std::thread::available_parallelism().map_or(1, |n| n.get()),
            verbosity: 1,
            dry_run: false,
            keep_going: false,
            dump_json: false,
            overrides: Vec::new(),
            diag: None,
        }
    }
}

impl ContextConfig {
    /// A serial context with captured-friendly defaults, used by tests.
    pub fn serial() -> Self {
        Self { jobs: 1, ..Self::default() }
    }
}

/// Cached metadata extracted from an imported executable, keyed by its
/// effective path.
pub type MetadataCache = Mutex<AHashMap<PathBuf, Arc<Vec<(String, Names)>>>>;

pub struct Context {
    pub scopes: ScopeMap,
    pub targets: TargetSet,
    var_pool: RwLock<VariablePool>,
    target_types: RwLock<TargetTypes>,
    pub sched: Scheduler,
    pub phase: PhaseMutex,
    pub diag: Diagnostics,
    pub functions: FunctionMap,
    pub dry_run: bool,
    pub keep_going: bool,
    pub dump_json: bool,
    pub fail: FailFlag,
    overrides: Vec<VariableOverride>,
    global_override_cache: Mutex<AHashMap<(VariableId, Storage), CacheEntry>>,
    pub import_metadata: MetadataCache,
    /// Value emitted by `export` while an export stub is being sourced.
    pub export_stash: Mutex<Option<Names>>,
    /// Buildfiles on the active include chain (load is single-threaded);
    /// re-entry is a cyclic include.
    pub include_stack: Mutex<Vec<PathBuf>>,
}

impl Context {
    pub fn new(config: ContextConfig) -> diag::Result<Arc<Self>> {
        let diagnostics = config.diag.unwrap_or_else(|| Diagnostics::new(config.verbosity));
        let mut pool = VariablePool::new();
        enter_builtin_variables(&mut pool)?;

        let mut overrides = Vec::new();
        for (i, spec) in config.overrides.iter().enumerate() {
            overrides.push(enter_override(&mut pool, spec, u32::try_from(i).unwrap_or(u32::MAX))?);
        }

        let ctx = Arc::new(Self {
            scopes: ScopeMap::new(),
            targets: TargetSet::new(),
            var_pool: RwLock::new(pool),
            target_types: RwLock::new(TargetTypes::new()),
            sched: Scheduler::new(config.jobs),
            phase: PhaseMutex::new(),
            diag: diagnostics,
            functions: FunctionMap::with_builtins(),
            dry_run: config.dry_run,
            keep_going: config.keep_going,
            dump_json: config.dump_json,
            fail: FailFlag::new(),
            overrides,
            global_override_cache: Mutex::new(AHashMap::new()),
            import_metadata: Mutex::new(AHashMap::new()),
            export_stash: Mutex::new(None),
            include_stack: Mutex::new(Vec::new()),
        });
        register_builtin_rules(&ctx);
        Ok(ctx)
    }

    pub fn var_pool(&self) -> RwLockReadGuard<'_, VariablePool> {
        self.var_pool.read()
    }

    /// Write access to the pool; only meaningful during the load phase.
    pub fn var_pool_mut(&self) -> RwLockWriteGuard<'_, VariablePool> {
        self.var_pool.write()
    }

    /// Clone of an interned variable (cheap; used where holding the pool
    /// guard across other lookups would invert lock order).
    pub fn var(&self, id: VariableId) -> Variable {
        self.var_pool.read().get(id).clone()
    }

    pub fn target_types(&self) -> RwLockReadGuard<'_, TargetTypes> {
        self.target_types.read()
    }

    pub fn target_types_mut(&self) -> RwLockWriteGuard<'_, TargetTypes> {
        self.target_types.write()
    }

    pub fn overrides(&self) -> &[VariableOverride] {
        &self.overrides
    }

    pub fn global_override_cache(&self) -> &Mutex<AHashMap<(VariableId, Storage), CacheEntry>> {
        &self.global_override_cache
    }

    /// Report an error and mark the context failed (unless `keep_going`).
    pub fn fail_with(&self, e: &Error) {
        self.diag.error(e);
        if !self.keep_going {
            self.fail.set();
        }
    }
}

/// The rules every context starts with, registered in the global scope:
/// existing files are up to date, aliases and directories pass through to
/// their prerequisites, `fsdir{}` maps to mkdir/rmdir.
fn register_builtin_rules(ctx: &Arc<Context>) {
    use crate::{
        operation::{CLEAN, UPDATE},
        rule::{AliasRule, FileRule, FsdirRule, NoopRule, Rule},
        target::{ALIAS, FILE, FSDIR},
    };
    let g = ctx.scopes.global();
    let mut rules = g.rules.write();
    let file: Arc<dyn Rule> = Arc::new(FileRule);
    let alias: Arc<dyn Rule> = Arc::new(AliasRule);
    let fsdir: Arc<dyn Rule> = Arc::new(FsdirRule);
    let noop: Arc<dyn Rule> = Arc::new(NoopRule);
    for op in [UPDATE, CLEAN] {
        rules.insert(0, op, ALIAS, "", alias.clone());
        rules.insert(0, op, FSDIR, "", fsdir.clone());
    }
    rules.insert(0, UPDATE, FILE, "", file);
    rules.insert(0, CLEAN, FILE, "", noop);
}

/// Variables the engine itself relies on, entered before any buildfile is
/// parsed. Config-namespace variables are overridable with global
/// visibility via a pattern.
fn enter_builtin_variables(pool: &mut VariablePool) -> diag::Result<()> {
    let enter = |pool: &mut VariablePool, name: &str, typ, vis| {
        pool.insert_full(name, typ, Some(vis), Some(false))
            .map_err(Error::internal)
    };
    enter(pool, "project", Some(value::PROJECT_NAME), Visibility::Project)?;
    enter(pool, "amalgamation", None, Visibility::Project)?;
    enter(pool, "subprojects", None, Visibility::Project)?;
    enter(pool, "src_root", Some(value::DIR_PATH), Visibility::Project)?;
    enter(pool, "out_root", Some(value::DIR_PATH), Visibility::Project)?;
    enter(pool, "src_base", Some(value::DIR_PATH), Visibility::Scope)?;
    enter(pool, "out_base", Some(value::DIR_PATH), Visibility::Scope)?;
    enter(pool, "build.meta_operation", Some(value::STRING), Visibility::Global)?;
    enter(pool, "build.operation", Some(value::STRING), Visibility::Global)?;

    // All configuration variables are overridable from the command line
    // and visible from any scope.
    pool.insert_pattern("config.**", None, Some(Visibility::Global), Some(true), false, false)
        .map_err(Error::internal)?;
    Ok(())
}

/// Parse one command-line override spec and enter its synthetic variable.
fn enter_override(pool: &mut VariablePool, spec: &str, position: u32) -> diag::Result<VariableOverride> {
    let usage = || Error::semantic(format!("invalid variable override '{spec}'")).note("expected [dir/@]name=value, name+=value, or name=+value");

    // Optional scope directory prefix `dir/@`.
    let (dir, rest) = match spec.find("/@") {
        Some(i) => (Some(crate::path::DirPath::new(&spec[..i])), &spec[i + 2..]),
        None => (None, spec),
    };

    // The operator: the first '=' decides, with +=/=+ look-around.
    let eq = rest.find('=').ok_or_else(usage)?;
    let (name, kind, vstart) = if eq > 0 && rest.as_bytes()[eq - 1] == b'+' {
        (&rest[..eq - 1], OverrideKind::Append, eq + 1)
    } else if rest.len() > eq + 1 && rest.as_bytes()[eq + 1] == b'+' {
        (&rest[..eq], OverrideKind::Prepend, eq + 2)
    } else {
        (&rest[..eq], OverrideKind::Assign, eq + 1)
    };
    if name.is_empty() {
        return Err(usage());
    }

    let var = pool
        .insert_full(name, None, None, Some(true))
        .map_err(Error::semantic)?;
    if !pool.get(var).overridable {
        return Err(Error::semantic(format!("variable '{name}' cannot be overridden")));
    }
    let ovr = pool.insert_override(var, position, kind);

    let value: Names = rest[vstart..]
        .split_whitespace()
        .map(Name::from_value)
        .collect();

    Ok(VariableOverride { var, ovr, kind, position, dir, value })
}
