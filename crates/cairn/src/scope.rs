//! Scopes: directory-keyed containers of variables, target types, and
//! rules, plus the variable lookup walk with override application.
//!
//! Scopes are arena-allocated and referred to by `ScopeId`; back-links
//! (parent, project root, strong amalgamation) are non-owning ids. Instead
//! of handing out references into shared maps, lookups return an owned
//! `Lookup` carrying a value clone, the storage variable, and a storage
//! descriptor — the safe rendition of the modify-original/override-on-
//! query model: stored values are only written during load (or under the
//! scope lock for implied insertions), and everything composed at lookup
//! time lives in mutex-guarded caches keyed by stem identity and version.

use std::{
    collections::{BTreeMap, BTreeSet},
    path::PathBuf,
    sync::Arc,
};

use ahash::AHashMap;
use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};

use crate::{
    context::Context,
    diag::{self, Error},
    name::{Names, ProjectName},
    path::{DirPath, path_match},
    rule::RuleMap,
    target::{TargetId, TargetTypeId},
    value::{EXTRA_APPEND, EXTRA_PREPEND, Value},
    variable::{OverrideKind, VariableId, VariableMap, VariablePool, Visibility},
};

/// Index into the context's scope arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScopeId(u32);

impl ScopeId {
    pub fn new(index: usize) -> Self {
        Self(u32::try_from(index).expect("scope arena overflow"))
    }

    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// The global scope is always the first arena entry.
pub const GLOBAL_SCOPE: ScopeId = ScopeId(0);

/// Scope back-links and the source-directory mapping, set during project
/// loading.
#[derive(Debug, Clone, Default)]
pub struct Links {
    pub parent: Option<ScopeId>,
    /// The project root scope this scope belongs to (self for roots).
    pub root: Option<ScopeId>,
    /// The closest strong (source-containing) amalgamation root.
    pub strong: Option<ScopeId>,
    pub src_path: Option<DirPath>,
}

/// Project-level state carried only by root scopes. Established during
/// bootstrap; the variable-like fields are not mutated afterwards.
pub struct RootExtra {
    pub data: RwLock<RootData>,
    /// Override application cache, keyed by (variable, stem storage).
    pub override_cache: Mutex<AHashMap<(VariableId, Storage), CacheEntry>>,
    /// Buildfiles already sourced into this project (`source_once` set).
    pub sourced: Mutex<BTreeSet<PathBuf>>,
}

impl RootExtra {
    pub fn new() -> Self {
        Self {
            data: RwLock::new(RootData::default()),
            override_cache: Mutex::new(AHashMap::new()),
            sourced: Mutex::new(BTreeSet::new()),
        }
    }
}

impl Default for RootExtra {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Default)]
pub struct RootData {
    pub project: Option<ProjectName>,
    /// Out directory of the containing project, if any.
    pub amalgamation: Option<DirPath>,
    pub amalgamation_disabled: bool,
    pub subprojects: BTreeMap<String, DirPath>,
    pub subprojects_disabled: bool,
    /// Alternative file/directory naming scheme, fixed at first encounter.
    pub altn: bool,
    /// Modules loaded with `using`, in order.
    pub modules: Vec<String>,
    /// Bootstrap completed; optional module loads are rejected earlier.
    pub bootstrapped: bool,
    pub root_loaded: bool,
}

/// An entry of the override (and pattern composition) cache.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub value: Value,
    pub version: u64,
    pub stem_version: u64,
}

/// Target type/pattern-specific variables of one scope: per target type, a
/// list of (pattern, variable map) entries in insertion order.
#[derive(Default)]
pub struct VariableTypeMap {
    map: IndexMap<TargetTypeId, Vec<PatternEntry>>,
}

pub struct PatternEntry {
    pub pattern: String,
    pub vars: VariableMap,
}

impl VariableTypeMap {
    pub fn entry(&mut self, typ: TargetTypeId, pattern: &str) -> &mut VariableMap {
        let entries = self.map.entry(typ).or_default();
        if let Some(i) = entries.iter().position(|e| e.pattern == pattern) {
            return &mut entries[i].vars;
        }
        entries.push(PatternEntry { pattern: pattern.to_owned(), vars: VariableMap::new() });
        &mut entries.last_mut().expect("just pushed").vars
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&TargetTypeId, &Vec<PatternEntry>)> {
        self.map.iter()
    }

    /// Find the most specific match for `(type chain, target name)`:
    /// smaller inheritance distance first, then later-inserted patterns.
    fn find(
        &self,
        type_chain: &[TargetTypeId],
        tname: &str,
        pool: &VariablePool,
        var: VariableId,
    ) -> Option<(Value, u64, u16, VariableId)> {
        for t in type_chain {
            let Some(entries) = self.map.get(t) else { continue };
            for e in entries.iter().rev() {
                if !path_match(&e.pattern, tname) {
                    continue;
                }
                if let Some((entry, storage)) = e.vars.lookup(pool, var) {
                    return Some((entry.value.clone(), entry.version, entry.value.extra, storage));
                }
            }
        }
        None
    }
}

/// A directory-keyed container of variables, target-type registrations,
/// and rules.
pub struct Scope {
    pub id: ScopeId,
    pub out_path: DirPath,
    pub links: RwLock<Links>,
    pub vars: RwLock<VariableMap>,
    pub target_vars: RwLock<VariableTypeMap>,
    /// Target types registered (or `define`d) in this scope, by name.
    pub target_types: RwLock<AHashMap<String, TargetTypeId>>,
    pub rules: RwLock<RuleMap>,
    pub root_extra: RwLock<Option<Arc<RootExtra>>>,
}

impl Scope {
    fn new(id: ScopeId, out_path: DirPath) -> Self {
        Self {
            id,
            out_path,
            links: RwLock::new(Links::default()),
            vars: RwLock::new(VariableMap::new()),
            target_vars: RwLock::new(VariableTypeMap::default()),
            target_types: RwLock::new(AHashMap::new()),
            rules: RwLock::new(RuleMap::new()),
            root_extra: RwLock::new(None),
        }
    }

    pub fn is_root(&self) -> bool {
        self.root_extra.read().is_some()
    }

    pub fn root_extra(&self) -> Option<Arc<RootExtra>> {
        self.root_extra.read().clone()
    }

    /// The source directory corresponding to this scope's out directory.
    pub fn src_path(&self) -> Option<DirPath> {
        self.links.read().src_path.clone()
    }

    pub fn parent(&self) -> Option<ScopeId> {
        self.links.read().parent
    }

    pub fn root(&self) -> Option<ScopeId> {
        self.links.read().root
    }

    /// The project name if this is (or belongs to) a named project root.
    pub fn project(&self, ctx: &Context) -> Option<ProjectName> {
        let root = self.root()?;
        let rs = ctx.scopes.get(root);
        let extra = rs.root_extra()?;
        let d = extra.data.read();
        d.project.clone()
    }
}

/// The scope arena plus the out-directory index with longest-prefix
/// lookup. Mutated during load and, for implied scopes, during match
/// under the write locks.
pub struct ScopeMap {
    arena: RwLock<Vec<Arc<Scope>>>,
    by_out: RwLock<BTreeMap<DirPath, ScopeId>>,
}

impl ScopeMap {
    /// Create the map with the global scope at index 0.
    pub fn new() -> Self {
        let global = Arc::new(Scope::new(GLOBAL_SCOPE, DirPath::current()));
        Self {
            arena: RwLock::new(vec![global]),
            by_out: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn get(&self, id: ScopeId) -> Arc<Scope> {
        self.arena.read()[id.index()].clone()
    }

    pub fn global(&self) -> Arc<Scope> {
        self.get(GLOBAL_SCOPE)
    }

    /// Find existing or insert a scope for this out directory, resolving
    /// the parent to the nearest existing enclosing scope. Scopes are
    /// created top-down during loading, so the parent link is final.
    pub fn insert(&self, out: &DirPath) -> (Arc<Scope>, bool) {
        if let Some(&id) = self.by_out.read().get(out) {
            return (self.get(id), false);
        }
        let mut arena = self.arena.write();
        let mut index = self.by_out.write();
        if let Some(&id) = index.get(out) {
            return (arena[id.index()].clone(), false);
        }
        let id = ScopeId::new(arena.len());
        let scope = Arc::new(Scope::new(id, out.clone()));
        let parent = find_enclosing(&index, out).unwrap_or(GLOBAL_SCOPE);
        {
            let mut links = scope.links.write();
            links.parent = Some(parent);
            links.root = arena
                .get(parent.index())
                .and_then(|p: &Arc<Scope>| p.links.read().root);
        }
        arena.push(scope.clone());
        index.insert(out.clone(), id);
        (scope, true)
    }

    /// The scope whose out directory is the longest prefix of `dir`
    /// (falling back to the global scope).
    pub fn find(&self, dir: &DirPath) -> ScopeId {
        find_enclosing_or_self(&self.by_out.read(), dir).unwrap_or(GLOBAL_SCOPE)
    }

    /// Snapshot of all scopes in creation order.
    pub fn snapshot(&self) -> Vec<Arc<Scope>> {
        self.arena.read().clone()
    }
}

impl Default for ScopeMap {
    fn default() -> Self {
        Self::new()
    }
}

fn find_enclosing(index: &BTreeMap<DirPath, ScopeId>, out: &DirPath) -> Option<ScopeId> {
    let mut d = out.directory();
    loop {
        if let Some(&id) = index.get(&d) {
            return Some(id);
        }
        if d.is_empty() || d.depth() <= 1 {
            return None;
        }
        d = d.directory();
    }
}

fn find_enclosing_or_self(index: &BTreeMap<DirPath, ScopeId>, dir: &DirPath) -> Option<ScopeId> {
    if let Some(&id) = index.get(dir) {
        return Some(id);
    }
    find_enclosing(index, dir)
}

/// Identity of the map a looked-up value physically lives in (or was
/// composed into).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Storage {
    Undefined,
    Scope(ScopeId),
    TargetPattern(ScopeId),
    Target(TargetId),
    Prerequisite(TargetId),
    /// Composed by override application or pattern append/prepend; the id
    /// is the root scope owning the cache (global scope for global
    /// overrides).
    Cache(ScopeId),
}

/// Variable lookup result: binding of a variable to a value.
#[derive(Debug, Clone)]
pub struct Lookup {
    /// `None` if undefined. A defined value can still be NULL.
    pub value: Option<Value>,
    /// The storage variable: the looked-up variable or one of its aliases.
    pub var: Option<VariableId>,
    pub storage: Storage,
    pub version: u64,
}

impl Lookup {
    pub fn undefined() -> Self {
        Self { value: None, var: None, storage: Storage::Undefined, version: 0 }
    }

    pub fn defined(&self) -> bool {
        self.value.is_some()
    }

    /// Defined and not NULL.
    pub fn is_set(&self) -> bool {
        self.value.as_ref().is_some_and(|v| !v.null)
    }

    pub fn value_ref(&self) -> Option<&Value> {
        self.value.as_ref().filter(|v| !v.null)
    }

    /// Reverse the value to names; undefined and NULL yield empty.
    pub fn to_names(&self) -> Names {
        self.value_ref().map(Value::reverse).unwrap_or_default()
    }

    pub fn as_bool(&self) -> bool {
        self.value_ref().and_then(|v| v.to_bool().ok()).unwrap_or(false)
    }
}

/// Target identity for target type/pattern-specific lookup.
#[derive(Debug, Clone, Copy)]
pub struct TargetVarKey<'a> {
    pub typ: TargetTypeId,
    pub name: &'a str,
}

/// Full lookup: original walk plus override application.
pub fn find(ctx: &Context, scope: ScopeId, var: VariableId) -> diag::Result<Lookup> {
    find_with_target(ctx, scope, var, None)
}

pub fn find_with_target(
    ctx: &Context,
    scope: ScopeId,
    var: VariableId,
    tkey: Option<TargetVarKey<'_>>,
) -> diag::Result<Lookup> {
    let (overridable, has_overrides) = {
        let pool = ctx.var_pool();
        let v = pool.get(var);
        (v.overridable, !v.overrides.is_empty())
    };
    let stem = find_original(ctx, scope, var, tkey)?;
    if !overridable || !has_overrides {
        return Ok(stem.0);
    }
    find_override(ctx, scope, var, stem.0)
}

/// The documented walk without override application. Returns the lookup
/// and the chain depth at which it was found (for cache keying).
pub fn find_original(
    ctx: &Context,
    scope: ScopeId,
    var: VariableId,
    tkey: Option<TargetVarKey<'_>>,
) -> diag::Result<(Lookup, usize)> {
    let chain = chain_of(ctx, scope);
    let type_chain = tkey.map(|tk| ctx.target_types().chain(tk.typ));
    find_in_chain(ctx, &chain, 0, var, tkey, type_chain.as_deref(), None)
}

fn chain_of(ctx: &Context, scope: ScopeId) -> Vec<Arc<Scope>> {
    let mut chain = Vec::new();
    let mut cur = Some(scope);
    while let Some(id) = cur {
        let s = ctx.scopes.get(id);
        cur = s.parent();
        chain.push(s);
        if cur == Some(id) {
            break; // self-parented (defensive against a malformed arena)
        }
    }
    if chain.last().is_none_or(|s| s.id != GLOBAL_SCOPE) {
        chain.push(ctx.scopes.global());
    }
    chain
}

fn find_in_chain(
    ctx: &Context,
    chain: &[Arc<Scope>],
    start: usize,
    var: VariableId,
    tkey: Option<TargetVarKey<'_>>,
    type_chain: Option<&[TargetTypeId]>,
    // Chain index whose pattern map is excluded: the stem search for an
    // incomplete pattern value must not find that value again.
    skip_target_vars_at: Option<usize>,
) -> diag::Result<(Lookup, usize)> {
    let pool = ctx.var_pool();
    let (vis, typ) = {
        let v = pool.get(var);
        (v.visibility, v.typ)
    };

    for (i, s) in chain.iter().enumerate().skip(start) {
        // Target type/pattern-specific variables are more specific than
        // the scope's own and are consulted first.
        if let (Some(tk), Some(tc)) = (tkey, type_chain) {
            if skip_target_vars_at != Some(i) {
                let found = s.target_vars.read().find(tc, tk.name, &pool, var);
                if let Some((mut value, version, extra, storage_var)) = found {
                    drop_typify(&mut value, typ, &pool, var)?;
                    if extra & (EXTRA_APPEND | EXTRA_PREPEND) != 0 {
                        // An incomplete pattern value: compose with the
                        // stem found by continuing the walk without it.
                        drop(pool);
                        let (stem, _) =
                            find_in_chain(ctx, chain, i, var, tkey, type_chain, Some(i))?;
                        return compose_pattern(ctx, s, var, value, version, extra, stem)
                            .map(|l| (l, i + 1));
                    }
                    return Ok((
                        Lookup {
                            value: Some(value),
                            var: Some(storage_var),
                            storage: Storage::TargetPattern(s.id),
                            version,
                        },
                        i + 1,
                    ));
                }
            }
        }

        // The scope's own variables (with alias probing).
        if let Some((entry, storage_var)) = s.vars.read().lookup(&pool, var) {
            let mut value = entry.value.clone();
            let version = entry.version;
            drop_typify(&mut value, typ, &pool, var)?;
            return Ok((
                Lookup { value: Some(value), var: Some(storage_var), storage: Storage::Scope(s.id), version },
                i + 1,
            ));
        }

        // Visibility bounds the walk upward.
        match vis {
            Visibility::Scope => break,
            Visibility::Project | Visibility::Target | Visibility::Prereq => {
                if s.is_root() {
                    break;
                }
            }
            Visibility::Global => {}
        }
    }
    Ok((Lookup::undefined(), chain.len()))
}

fn drop_typify(
    value: &mut Value,
    typ: Option<crate::value::ValueTypeId>,
    pool: &VariablePool,
    var: VariableId,
) -> diag::Result<()> {
    if let Some(t) = typ {
        if value.typ.is_none() && !value.null {
            value
                .typify(t)
                .map_err(|e| Error::semantic(format!("variable '{}': {e}", pool.get(var).name)))?;
        }
    }
    Ok(())
}

/// Apply an incomplete (append/prepend marked) pattern value onto its
/// stem, caching the composition in the scope root's cache.
fn compose_pattern(
    ctx: &Context,
    scope: &Arc<Scope>,
    var: VariableId,
    pattern_value: Value,
    pattern_version: u64,
    extra: u16,
    stem: Lookup,
) -> diag::Result<Lookup> {
    let typ = {
        let pool = ctx.var_pool();
        pool.get(var).typ
    };
    let mut result = match &stem.value {
        Some(v) if !v.null => v.clone(),
        _ => Value::null_value(),
    };
    // Type agreement: both typed must agree; otherwise one side converts.
    if let (Some(st), Some(pt)) = (result.typ, pattern_value.typ) {
        if st != pt {
            return Err(Error::semantic(format!(
                "pattern value type {} conflicts with stem type {}",
                crate::value::get(pt).name,
                crate::value::get(st).name
            )));
        }
    }
    let ns = pattern_value.reverse();
    let r = if extra & EXTRA_PREPEND != 0 {
        result.prepend(ns, typ.or(pattern_value.typ))
    } else {
        result.append(ns, typ.or(pattern_value.typ))
    };
    r.map_err(|e| {
        let pool = ctx.var_pool();
        Error::semantic(format!("variable '{}': {e}", pool.get(var).name))
    })?;

    let version = pattern_version.wrapping_mul(31).wrapping_add(stem.version);
    let cache_root = scope.root().unwrap_or(GLOBAL_SCOPE);
    cache_insert(ctx, cache_root, var, stem.storage, result.clone(), version, stem.version);
    Ok(Lookup {
        value: Some(result),
        var: Some(var),
        storage: Storage::Cache(cache_root),
        version,
    })
}

fn cache_insert(
    ctx: &Context,
    root: ScopeId,
    var: VariableId,
    stem_storage: Storage,
    value: Value,
    version: u64,
    stem_version: u64,
) {
    let s = ctx.scopes.get(root);
    let extra = s.root_extra();
    let cache = match &extra {
        Some(e) => &e.override_cache,
        None => ctx.global_override_cache(),
    };
    cache
        .lock()
        .insert((var, stem_storage), CacheEntry { value, version, stem_version });
}

/// A command-line variable override: the original variable, its synthetic
/// override variable, the operator, the command-line position, an optional
/// scope directory, and the (untyped) value.
#[derive(Debug, Clone)]
pub struct VariableOverride {
    pub var: VariableId,
    pub ovr: VariableId,
    pub kind: OverrideKind,
    pub position: u32,
    /// Scope directory this override is confined to; `None` for global.
    pub dir: Option<DirPath>,
    pub value: Names,
}

/// Apply the override chain for `var` onto the stem. Overrides apply
/// outer-scope first, inner last; within one applicability class in
/// command-line order. The composed result is cached keyed by
/// `(variable, stem storage)` and invalidated by the stem version.
fn find_override(
    ctx: &Context,
    scope: ScopeId,
    var: VariableId,
    stem: Lookup,
) -> diag::Result<Lookup> {
    let s = ctx.scopes.get(scope);
    let out_path = s.out_path.clone();
    let cache_root = if s.is_root() { Some(s.id) } else { s.root() };

    // Applicable overrides: global ones always; scoped ones when the
    // queried scope is inside the override directory.
    let mut applicable: Vec<&VariableOverride> = ctx
        .overrides()
        .iter()
        .filter(|o| o.var == var)
        .filter(|o| match &o.dir {
            None => true,
            Some(d) => d.contains(&out_path),
        })
        .collect();
    if applicable.is_empty() {
        return Ok(stem);
    }
    // Outer (global, shallow dirs) first, inner last; command-line order
    // within the same depth.
    applicable.sort_by_key(|o| (o.dir.as_ref().map_or(0, DirPath::depth), o.position));

    // Cache probe.
    let cache_scope = cache_root.unwrap_or(GLOBAL_SCOPE);
    {
        let rs = ctx.scopes.get(cache_scope);
        let extra = rs.root_extra();
        let cache = match &extra {
            Some(e) => &e.override_cache,
            None => ctx.global_override_cache(),
        };
        if let Some(e) = cache.lock().get(&(var, stem.storage)) {
            if e.stem_version == stem.version {
                return Ok(Lookup {
                    value: Some(e.value.clone()),
                    var: Some(var),
                    storage: Storage::Cache(cache_scope),
                    version: e.version,
                });
            }
        }
    }

    let typ = {
        let pool = ctx.var_pool();
        pool.get(var).typ
    };
    let mut result = match &stem.value {
        Some(v) if !v.null => v.clone(),
        _ => Value::null_value(),
    };
    for o in &applicable {
        let ns = o.value.clone();
        let r = match o.kind {
            OverrideKind::Assign => {
                result = Value::null_value();
                result.assign(ns, typ)
            }
            OverrideKind::Prepend => result.prepend(ns, typ),
            OverrideKind::Append => result.append(ns, typ),
        };
        r.map_err(|e| {
            let pool = ctx.var_pool();
            Error::semantic(format!("override of variable '{}': {e}", pool.get(var).name))
        })?;
    }

    let version = stem.version.wrapping_add(1);
    cache_insert(ctx, cache_scope, var, stem.storage, result.clone(), version, stem.version);
    Ok(Lookup {
        value: Some(result),
        var: Some(var),
        storage: Storage::Cache(cache_scope),
        version,
    })
}

/// Assign into a scope's variables, converting through the variable's
/// type; used by the parser and modules.
pub fn assign(
    ctx: &Context,
    scope: &Scope,
    var: VariableId,
    value: Value,
) -> diag::Result<()> {
    let pool = ctx.var_pool();
    scope.vars.write().set(&pool, var, value);
    Ok(())
}
