//! The target model: target types, targets, prerequisites, and the
//! concurrent target set.
//!
//! Targets are arena-allocated behind `Arc` and never relocated or deleted
//! for the lifetime of the context; everything else refers to them by
//! `TargetId` or a cloned `Arc`. The `(dir, out)` pair distinguishes
//! out-of-tree variants of the same source target (`out` is empty for a
//! target that lives in its own directory).

use std::{
    any::Any,
    path::{Path, PathBuf},
    sync::{
        Arc, OnceLock,
        atomic::{AtomicU8, AtomicU32, AtomicU64, Ordering},
    },
    time::{SystemTime, UNIX_EPOCH},
};

use ahash::AHashMap;
use parking_lot::{Mutex, RwLock};

use crate::{
    context::Context,
    diag::{self, Error},
    name::ProjectName,
    operation::Action,
    path::DirPath,
    rule::{Recipe, Rule},
    scope::{self, Lookup, ScopeId, Storage, TargetVarKey},
    variable::{VariableId, VariableMap},
};

/// Index into the context's target-type registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TargetTypeId(u16);

impl TargetTypeId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

pub const TARGET: TargetTypeId = TargetTypeId(0);
pub const MTIME_TARGET: TargetTypeId = TargetTypeId(1);
pub const PATH_TARGET: TargetTypeId = TargetTypeId(2);
pub const FILE: TargetTypeId = TargetTypeId(3);
pub const ALIAS: TargetTypeId = TargetTypeId(4);
pub const DIR: TargetTypeId = TargetTypeId(5);
pub const FSDIR: TargetTypeId = TargetTypeId(6);
pub const EXE: TargetTypeId = TargetTypeId(7);
pub const DOC: TargetTypeId = TargetTypeId(8);
pub const GROUP: TargetTypeId = TargetTypeId(9);

/// A registered target type. Types form single-inheritance chains rooted
/// at the abstract `target`.
#[derive(Debug, Clone)]
pub struct TargetTypeInfo {
    pub name: String,
    pub base: Option<TargetTypeId>,
    /// File-based: has a path and an mtime.
    pub file: bool,
    /// Directory-based (`dir{}`, `fsdir{}`): the name is a directory.
    pub dir_based: bool,
    /// Default extension completed onto extension-less names. An empty
    /// string means "no extension" (e.g. `exe{}` on POSIX).
    pub default_ext: Option<String>,
}

/// The context-wide target type registry. `define`-derived types are
/// appended here and made visible through the defining scope.
pub struct TargetTypes {
    list: Vec<TargetTypeInfo>,
    index: AHashMap<String, TargetTypeId>,
}

impl TargetTypes {
    pub fn new() -> Self {
        let mut tt = Self { list: Vec::new(), index: AHashMap::new() };
        // Order must match the id constants above.
        tt.insert("target", None, false, false, None);
        tt.insert("mtime_target", Some(TARGET), false, false, None);
        tt.insert("path_target", Some(MTIME_TARGET), false, false, None);
        tt.insert("file", Some(PATH_TARGET), true, false, Some(""));
        tt.insert("alias", Some(TARGET), false, false, None);
        tt.insert("dir", Some(ALIAS), false, true, None);
        tt.insert("fsdir", Some(TARGET), false, true, None);
        tt.insert("exe", Some(FILE), true, false, Some(""));
        tt.insert("doc", Some(FILE), true, false, Some(""));
        tt.insert("group", Some(TARGET), false, false, None);
        tt
    }

    /// Register a type, idempotently by name. A re-registration with a
    /// different base keeps the first registration (callers report the
    /// conflict where it matters, in `define`).
    pub fn insert(
        &mut self,
        name: &str,
        base: Option<TargetTypeId>,
        file: bool,
        dir_based: bool,
        default_ext: Option<&str>,
    ) -> TargetTypeId {
        if let Some(&id) = self.index.get(name) {
            return id;
        }
        let id = TargetTypeId(u16::try_from(self.list.len()).expect("target type registry overflow"));
        self.list.push(TargetTypeInfo {
            name: name.to_owned(),
            base,
            file,
            dir_based,
            default_ext: default_ext.map(str::to_owned),
        });
        self.index.insert(name.to_owned(), id);
        id
    }

    /// Derive a new type from a base, inheriting its properties
    /// (the `define N: B` directive).
    pub fn derive(&mut self, name: &str, base: TargetTypeId) -> Option<TargetTypeId> {
        if self.index.contains_key(name) {
            return None;
        }
        let b = self.get(base).clone();
        Some(self.insert(name, Some(base), b.file, b.dir_based, b.default_ext.as_deref()))
    }

    pub fn get(&self, id: TargetTypeId) -> &TargetTypeInfo {
        &self.list[id.index()]
    }

    pub fn find(&self, name: &str) -> Option<TargetTypeId> {
        self.index.get(name).copied()
    }

    /// True if `t` is `base` or derives from it.
    pub fn is_a(&self, t: TargetTypeId, base: TargetTypeId) -> bool {
        let mut cur = Some(t);
        while let Some(c) = cur {
            if c == base {
                return true;
            }
            cur = self.get(c).base;
        }
        false
    }

    /// The inheritance chain from `t` up to the root, most derived first.
    pub fn chain(&self, t: TargetTypeId) -> Vec<TargetTypeId> {
        let mut r = Vec::new();
        let mut cur = Some(t);
        while let Some(c) = cur {
            r.push(c);
            cur = self.get(c).base;
        }
        r
    }

    /// Split a spelled target name into name and extension for file-based
    /// types (`c{hello.c}` and `c{hello}` address the same target).
    pub fn split_name(&self, t: TargetTypeId, name: &str) -> (String, Option<String>) {
        if !self.get(t).file {
            return (name.to_owned(), None);
        }
        match name.rfind('.') {
            Some(i) if i > 0 => (name[..i].to_owned(), Some(name[i + 1..].to_owned())),
            _ => (name.to_owned(), None),
        }
    }

    /// The file name a target renders to, completing the default
    /// extension when none was spelled.
    pub fn file_name(&self, t: TargetTypeId, name: &str, ext: Option<&str>) -> String {
        let e = ext.map(str::to_owned).or_else(|| self.get(t).default_ext.clone()).unwrap_or_default();
        if e.is_empty() {
            name.to_owned()
        } else {
            format!("{name}.{e}")
        }
    }
}

impl Default for TargetTypes {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolve a target type name in a scope: scope-registered (and
/// `define`d) names shadow the context registry.
pub fn find_target_type(ctx: &Context, scope: ScopeId, name: &str) -> Option<TargetTypeId> {
    let mut cur = Some(scope);
    while let Some(id) = cur {
        let s = ctx.scopes.get(id);
        if let Some(&t) = s.target_types.read().get(name) {
            return Some(t);
        }
        cur = s.parent();
    }
    ctx.target_types().find(name)
}

/// Target identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TargetKey {
    pub typ: TargetTypeId,
    pub dir: DirPath,
    /// Out directory for out-of-tree variants of a source target; empty
    /// when `dir` already is the out directory.
    pub out: DirPath,
    pub name: String,
    pub ext: Option<String>,
}

/// Index into the context's target arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TargetId(u32);

impl TargetId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// How a prerequisite entry participates in its dependent's action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Include {
    Normal,
    /// Updated if possible but does not contribute to the out-of-date
    /// decision.
    Adhoc,
    Excluded,
}

/// A prerequisite as declared (unresolved); resolution to a target is
/// cached.
#[derive(Debug)]
pub struct Prerequisite {
    pub project: Option<ProjectName>,
    pub typ: TargetTypeId,
    pub dir: DirPath,
    pub out: DirPath,
    pub name: String,
    pub ext: Option<String>,
    /// Scope the prerequisite was declared in.
    pub scope: ScopeId,
    /// Prerequisite-specific variables (`prereq` visibility).
    pub vars: VariableMap,
    cached: OnceLock<TargetId>,
}

impl Prerequisite {
    pub fn new(
        typ: TargetTypeId,
        dir: DirPath,
        name: String,
        ext: Option<String>,
        scope: ScopeId,
    ) -> Self {
        Self {
            project: None,
            typ,
            dir,
            out: DirPath::current(),
            name,
            ext,
            scope,
            vars: VariableMap::new(),
            cached: OnceLock::new(),
        }
    }

    pub fn cached_target(&self) -> Option<TargetId> {
        self.cached.get().copied()
    }

    pub fn cache_target(&self, t: TargetId) {
        self.cached.get_or_init(|| t);
    }
}

/// Match progress of one target for one action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Progress {
    Unknown = 0,
    Postponed = 1,
    Busy = 2,
    Applied = 3,
    Executed = 4,
    Failed = 5,
}

impl Progress {
    pub fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Postponed,
            2 => Self::Busy,
            3 => Self::Applied,
            4 => Self::Executed,
            5 => Self::Failed,
            _ => Self::Unknown,
        }
    }
}

/// Result state of one target for one action. The order is the
/// aggregation order: unchanged < changed < failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, strum::Display)]
#[strum(serialize_all = "snake_case")]
#[repr(u8)]
pub enum TargetState {
    Unknown = 0,
    Unchanged = 1,
    Changed = 2,
    Failed = 3,
}

impl TargetState {
    pub fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Unchanged,
            2 => Self::Changed,
            3 => Self::Failed,
            _ => Self::Unknown,
        }
    }
}

/// A resolved prerequisite slot in declaration order. `data` is an opaque
/// rule-specific slot (link-whole flags and the like).
#[derive(Debug, Clone)]
pub struct PrereqTarget {
    pub target: Option<TargetId>,
    pub include: Include,
    pub adhoc: bool,
    /// Set by `apply` when the dependent no longer needs this
    /// prerequisite executed for the current action.
    pub unmatched: bool,
    pub data: usize,
}

/// The mutexed per-action slot holding what match/apply produced.
#[derive(Default)]
pub struct OpData {
    pub rule: Option<Arc<dyn Rule>>,
    pub recipe: Option<Recipe>,
    pub prerequisite_targets: Vec<PrereqTarget>,
    /// Action-specific variables.
    pub vars: VariableMap,
    /// Rule match data passed from `apply` to the recipe.
    pub match_data: Option<Box<dyn Any + Send>>,
}

/// Per-action atomic state: the busy counter brackets asynchronous work,
/// `progress` tracks the match/execute machine, `result` the outcome.
pub struct OpState {
    pub count: AtomicU32,
    progress: AtomicU8,
    result: AtomicU8,
    pub data: Mutex<OpData>,
}

impl OpState {
    fn new() -> Self {
        Self {
            count: AtomicU32::new(0),
            progress: AtomicU8::new(0),
            result: AtomicU8::new(0),
            data: Mutex::new(OpData::default()),
        }
    }

    pub fn progress(&self) -> Progress {
        Progress::from_u8(self.progress.load(Ordering::Acquire))
    }

    pub fn set_progress(&self, p: Progress) {
        self.progress.store(p as u8, Ordering::Release);
    }

    /// Transition only if currently `from`; returns false if someone else
    /// got there first.
    pub fn try_progress(&self, from: Progress, to: Progress) -> bool {
        self.progress
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn result(&self) -> TargetState {
        TargetState::from_u8(self.result.load(Ordering::Acquire))
    }

    pub fn set_result(&self, s: TargetState) {
        self.result.store(s as u8, Ordering::Release);
    }
}

/// Load/match-mutable portions of a target, written under the phase
/// discipline (load: parser; match: the applying rule, which owns the
/// target through the busy state).
#[derive(Default)]
pub struct TargetCore {
    pub prerequisites: Vec<Prerequisite>,
    pub group: Option<TargetId>,
    pub members: Vec<TargetId>,
    /// Head of the ad hoc member chain.
    pub adhoc_member: Option<TargetId>,
    pub path: Option<PathBuf>,
    pub vars: VariableMap,
    /// True if this target was only ever implied (created as a
    /// prerequisite or scope placeholder, never declared).
    pub implied: bool,
}

/// Mtime encoding in an atomic: 0 unknown, 1 nonexistent, otherwise
/// nanoseconds since the epoch.
pub const MTIME_UNKNOWN: u64 = 0;
pub const MTIME_NONEXISTENT: u64 = 1;

pub struct Target {
    pub id: TargetId,
    pub key: TargetKey,
    /// Base scope (by out directory).
    pub base_scope: ScopeId,
    pub core: RwLock<TargetCore>,
    /// Inner and outer action slots.
    pub opstate: [OpState; 2],
    mtime: AtomicU64,
}

impl Target {
    pub fn state(&self, a: Action) -> &OpState {
        &self.opstate[usize::from(a.outer_operation != 0)]
    }

    pub fn name(&self) -> &str {
        &self.key.name
    }

    /// Effective out directory: `out` if set, else `dir`.
    pub fn out_dir(&self) -> &DirPath {
        if self.key.out.is_empty() { &self.key.dir } else { &self.key.out }
    }

    /// The assigned file path, if any rule (or search) set one.
    pub fn path(&self) -> Option<PathBuf> {
        self.core.read().path.clone()
    }

    pub fn set_path(&self, p: PathBuf) {
        self.core.write().path = Some(p);
    }

    /// Compute and set the default path `dir/name[.ext]`.
    pub fn derive_path(&self, ctx: &Context) -> PathBuf {
        let file = ctx
            .target_types()
            .file_name(self.key.typ, &self.key.name, self.key.ext.as_deref());
        let p = self.key.dir.join_file(file);
        self.core.write().path.get_or_insert_with(|| p.clone());
        self.path().unwrap_or(p)
    }

    pub fn mtime(&self) -> u64 {
        self.mtime.load(Ordering::Acquire)
    }

    pub fn set_mtime(&self, m: u64) {
        self.mtime.store(m, Ordering::Release);
    }

    /// Load the mtime from the filesystem if not yet known.
    pub fn load_mtime(&self) -> u64 {
        let m = self.mtime();
        if m != MTIME_UNKNOWN {
            return m;
        }
        let m = self.path().map_or(MTIME_NONEXISTENT, |p| file_mtime(&p));
        self.set_mtime(m);
        m
    }

    /// Target variable lookup: own vars, group vars, then the scope walk
    /// with target type/pattern-specific lookup.
    pub fn find_var(&self, ctx: &Context, var: VariableId) -> diag::Result<Lookup> {
        {
            let pool = ctx.var_pool();
            let core = self.core.read();
            if let Some((e, sv)) = core.vars.lookup(&pool, var) {
                return Ok(Lookup {
                    value: Some(e.value.clone()),
                    var: Some(sv),
                    storage: Storage::Target(self.id),
                    version: e.version,
                });
            }
            if let Some(g) = core.group {
                drop(core);
                let gt = ctx.targets.get(g);
                let gcore = gt.core.read();
                if let Some((e, sv)) = gcore.vars.lookup(&pool, var) {
                    return Ok(Lookup {
                        value: Some(e.value.clone()),
                        var: Some(sv),
                        storage: Storage::Target(g),
                        version: e.version,
                    });
                }
            }
        }
        scope::find_with_target(
            ctx,
            self.base_scope,
            var,
            Some(TargetVarKey { typ: self.key.typ, name: &self.key.name }),
        )
    }

    /// Walk the ad hoc member chain.
    pub fn adhoc_members(&self, ctx: &Context) -> Vec<Arc<Target>> {
        let mut r = Vec::new();
        let mut cur = self.core.read().adhoc_member;
        while let Some(id) = cur {
            let m = ctx.targets.get(id);
            cur = m.core.read().adhoc_member;
            r.push(m);
        }
        r
    }
}

/// Read a file's mtime in the atomic encoding.
pub fn file_mtime(p: &Path) -> u64 {
    match std::fs::metadata(p).and_then(|m| m.modified()) {
        Ok(t) => t
            .duration_since(UNIX_EPOCH)
            .map(|d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX).max(2))
            .unwrap_or(MTIME_NONEXISTENT),
        Err(_) => MTIME_NONEXISTENT,
    }
}

/// The current time in the atomic mtime encoding.
pub fn now_mtime() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX).max(2))
        .unwrap_or(MTIME_NONEXISTENT)
}

/// The concurrent insert-only target set. Lookup takes the read lock;
/// insertion briefly takes both write locks.
pub struct TargetSet {
    index: RwLock<AHashMap<TargetKey, TargetId>>,
    arena: RwLock<Vec<Arc<Target>>>,
}

impl TargetSet {
    pub fn new() -> Self {
        Self { index: RwLock::new(AHashMap::new()), arena: RwLock::new(Vec::new()) }
    }

    pub fn get(&self, id: TargetId) -> Arc<Target> {
        self.arena.read()[id.index()].clone()
    }

    pub fn find(&self, key: &TargetKey) -> Option<Arc<Target>> {
        let id = *self.index.read().get(key)?;
        Some(self.get(id))
    }

    /// Find existing or insert; returns the target and whether it was
    /// inserted.
    pub fn insert(&self, ctx: &Context, key: TargetKey, implied: bool) -> (Arc<Target>, bool) {
        if let Some(t) = self.find(&key) {
            if !implied {
                t.core.write().implied = false;
            }
            return (t, false);
        }
        let mut index = self.index.write();
        if let Some(&id) = index.get(&key) {
            return (self.arena.read()[id.index()].clone(), false);
        }
        let base_scope = ctx.scopes.find(if key.out.is_empty() { &key.dir } else { &key.out });
        let mut arena = self.arena.write();
        let id = TargetId(u32::try_from(arena.len()).expect("target arena overflow"));
        let t = Arc::new(Target {
            id,
            key: key.clone(),
            base_scope,
            core: RwLock::new(TargetCore { implied, ..TargetCore::default() }),
            opstate: [OpState::new(), OpState::new()],
            mtime: AtomicU64::new(MTIME_UNKNOWN),
        });
        arena.push(t.clone());
        index.insert(key, id);
        (t, true)
    }

    pub fn len(&self) -> usize {
        self.arena.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.arena.read().is_empty()
    }

    pub fn snapshot(&self) -> Vec<Arc<Target>> {
        self.arena.read().clone()
    }
}

impl Default for TargetSet {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolve a prerequisite to a target, creating an implied one if needed.
///
/// Resolution order: an existing target in the out directory, an existing
/// target for the source variant, a file present in the source directory
/// (declared as a source target), and finally an implied target in the
/// out directory for some rule to produce.
pub fn search(ctx: &Context, base: ScopeId, p: &Prerequisite) -> diag::Result<Arc<Target>> {
    if let Some(id) = p.cached_target() {
        return Ok(ctx.targets.get(id));
    }
    let scope = ctx.scopes.get(base);
    let (name, ext) = {
        let tt = ctx.target_types();
        let (n, e) = tt.split_name(p.typ, &p.name);
        (n, e.or_else(|| p.ext.clone()))
    };

    let out_dir = if p.dir.is_absolute() { p.dir.clone() } else { scope.out_path.join(p.dir.as_path()) };

    // Existing out target.
    let out_key = TargetKey {
        typ: p.typ,
        dir: out_dir.clone(),
        out: DirPath::current(),
        name: name.clone(),
        ext: ext.clone(),
    };
    if let Some(t) = ctx.targets.find(&out_key) {
        p.cache_target(t.id);
        return Ok(t);
    }

    // Source-tree variant.
    if let Some(src) = scope.src_path() {
        let src_dir = if p.dir.is_absolute() { p.dir.clone() } else { src.join(p.dir.as_path()) };
        let out_half = if src_dir == out_dir { DirPath::current() } else { out_dir.clone() };
        let src_key = TargetKey {
            typ: p.typ,
            dir: src_dir.clone(),
            out: out_half.clone(),
            name: name.clone(),
            ext: ext.clone(),
        };
        if let Some(t) = ctx.targets.find(&src_key) {
            p.cache_target(t.id);
            return Ok(t);
        }
        // A file on disk in the source directory.
        let file = ctx.target_types().file_name(p.typ, &name, ext.as_deref());
        let fp = src_dir.join_file(&file);
        if ctx.target_types().get(p.typ).file && fp.exists() {
            let (t, _) = ctx.targets.insert(ctx, src_key, true);
            t.set_path(fp);
            p.cache_target(t.id);
            return Ok(t);
        }
    }

    // Implied target in out.
    let (t, _) = ctx.targets.insert(ctx, out_key, true);
    p.cache_target(t.id);
    Ok(t)
}

/// Attach an ad hoc member of the given type to a primary target, reusing
/// an existing chain entry of that type if present.
pub fn add_adhoc_member(
    ctx: &Context,
    primary: &Arc<Target>,
    typ: TargetTypeId,
    name: &str,
    ext: Option<&str>,
) -> diag::Result<Arc<Target>> {
    // Reuse an existing chain member of this type.
    for m in primary.adhoc_members(ctx) {
        if m.key.typ == typ {
            return Ok(m);
        }
    }
    let key = TargetKey {
        typ,
        dir: primary.key.dir.clone(),
        out: primary.key.out.clone(),
        name: name.to_owned(),
        ext: ext.map(str::to_owned),
    };
    let (member, _) = ctx.targets.insert(ctx, key, true);
    if member.id == primary.id {
        return Err(Error::internal("ad hoc member resolves to its primary target"));
    }
    {
        let mut mc = member.core.write();
        mc.group = Some(primary.id);
    }
    // Append to the chain tail.
    let mut tail = primary.clone();
    loop {
        let next = tail.core.read().adhoc_member;
        match next {
            Some(id) => tail = ctx.targets.get(id),
            None => break,
        }
    }
    tail.core.write().adhoc_member = Some(member.id);
    Ok(member)
}
