//! Project discovery and loading: roots, bootstrap, buildfile sourcing,
//! and import.
//!
//! A project is identified by its `build/bootstrap.build` file (or the
//! alternative naming `build2/bootstrap.build2`; the scheme is detected
//! on first encounter and fixed for the project). When building out of
//! source, the out root carries `build/bootstrap/src-root.build`, a
//! pointer buildfile recording the source root.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use crate::{
    context::Context,
    diag::{self, Error, Location},
    name::{Name, Names},
    parse,
    path::DirPath,
    scope::{self, RootExtra, ScopeId},
    target::{self, EXE, TargetKey},
    value::Value,
};

/// File and directory names of a naming scheme.
#[derive(Debug, Clone, Copy)]
pub struct Naming {
    pub altn: bool,
}

impl Naming {
    pub fn std() -> Self {
        Self { altn: false }
    }

    pub fn build_dir(self) -> &'static str {
        if self.altn { "build2" } else { "build" }
    }

    pub fn buildfile(self) -> &'static str {
        if self.altn { "build2file" } else { "buildfile" }
    }

    pub fn ext(self) -> &'static str {
        if self.altn { "build2" } else { "build" }
    }

    pub fn bootstrap_file(self, root: &DirPath) -> PathBuf {
        root.join(self.build_dir()).join_file(format!("bootstrap.{}", self.ext()))
    }

    pub fn root_file(self, root: &DirPath) -> PathBuf {
        root.join(self.build_dir()).join_file(format!("root.{}", self.ext()))
    }

    pub fn export_file(self, root: &DirPath) -> PathBuf {
        root.join(self.build_dir()).join_file(format!("export.{}", self.ext()))
    }

    pub fn config_file(self, root: &DirPath) -> PathBuf {
        root.join(self.build_dir()).join_file(format!("config.{}", self.ext()))
    }

    pub fn src_root_file(self, out_root: &DirPath) -> PathBuf {
        out_root
            .join(self.build_dir())
            .join("bootstrap")
            .join_file(format!("src-root.{}", self.ext()))
    }

    pub fn out_root_file(self, src_root: &DirPath) -> PathBuf {
        src_root
            .join(self.build_dir())
            .join("bootstrap")
            .join_file(format!("out-root.{}", self.ext()))
    }

    pub fn hooks_dir(self, root: &DirPath, which: &str) -> DirPath {
        root.join(self.build_dir()).join(which)
    }
}

fn detect_naming(dir: &DirPath) -> Option<Naming> {
    for naming in [Naming { altn: false }, Naming { altn: true }] {
        if naming.bootstrap_file(dir).exists() {
            return Some(naming);
        }
    }
    None
}

fn is_out_root(dir: &DirPath) -> Option<Naming> {
    for naming in [Naming { altn: false }, Naming { altn: true }] {
        if naming.src_root_file(dir).exists() {
            return Some(naming);
        }
    }
    None
}

/// The discovered roots of the project containing `start`.
#[derive(Debug, Clone)]
pub struct Project {
    pub src_root: DirPath,
    pub out_root: DirPath,
    pub naming: Naming,
}

/// Walk up from the start directory looking for a source root or an out
/// root pointer.
pub fn discover(start: &DirPath) -> diag::Result<Project> {
    let mut d = start.clone();
    loop {
        if let Some(naming) = is_out_root(&d) {
            let src_root = read_pointer(&naming.src_root_file(&d), "src_root")?;
            return Ok(Project { src_root, out_root: d, naming });
        }
        if let Some(naming) = detect_naming(&d) {
            // In source, unless a forwarding pointer redirects out.
            let out_root = match read_pointer_opt(&naming.out_root_file(&d), "out_root")? {
                Some(o) => o,
                None => d.clone(),
            };
            return Ok(Project { src_root: d, out_root, naming });
        }
        if d.depth() <= 1 {
            return Err(Error::lookup(format!(
                "no project found in {start} or any of its parent directories"
            ))
            .note("a project root contains build/bootstrap.build"));
        }
        d = d.directory();
    }
}

/// Read a single-assignment pointer buildfile (`src-root.build` /
/// `out-root.build`).
fn read_pointer(path: &Path, var: &str) -> diag::Result<DirPath> {
    read_pointer_opt(path, var)?.ok_or_else(|| {
        Error::semantic(format!("no {var} variable in {}", path.display()))
    })
}

fn read_pointer_opt(path: &Path, var: &str) -> diag::Result<Option<DirPath>> {
    if !path.exists() {
        return Ok(None);
    }
    let text = std::fs::read_to_string(path)
        .map_err(|e| Error::resource(format!("cannot read {}: {e}", path.display())))?;
    for line in text.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix(var) {
            if let Some(v) = rest.trim_start().strip_prefix('=') {
                let v = v.trim().trim_matches('\'').trim_matches('"');
                return Ok(Some(DirPath::new(v)));
            }
        }
    }
    Ok(None)
}

/// Create (or find) the root scope for a project and run its bootstrap:
/// `bootstrap.build`, pre/post hooks, saved configuration, subproject
/// and amalgamation discovery.
pub fn bootstrap(ctx: &Arc<Context>, project: &Project) -> diag::Result<ScopeId> {
    let (scope, inserted) = ctx.scopes.insert(&project.out_root);
    if !inserted && scope.is_root() {
        return Ok(scope.id);
    }

    {
        let mut links = scope.links.write();
        links.root = Some(scope.id);
        links.src_path = Some(project.src_root.clone());
    }
    let extra = Arc::new(RootExtra::new());
    extra.data.write().altn = project.naming.altn;
    *scope.root_extra.write() = Some(extra.clone());

    // Root-level variables the buildfiles (and engine) read.
    {
        let mut pool = ctx.var_pool_mut();
        let src_root_v = pool.insert("src_root");
        let out_root_v = pool.insert("out_root");
        let src_base_v = pool.insert("src_base");
        let out_base_v = pool.insert("out_base");
        drop(pool);
        let pool = ctx.var_pool();
        let mut vars = scope.vars.write();
        vars.set(&pool, src_root_v, Value::from_dir(project.src_root.clone()));
        vars.set(&pool, out_root_v, Value::from_dir(project.out_root.clone()));
        vars.set(&pool, src_base_v, Value::from_dir(project.src_root.clone()));
        vars.set(&pool, out_base_v, Value::from_dir(project.out_root.clone()));
    }

    // Pre hooks, bootstrap.build, post hooks.
    source_hooks(ctx, scope.id, project, "bootstrap", "pre")?;
    let bf = project.naming.bootstrap_file(&project.src_root);
    if bf.exists() {
        source_file(ctx, scope.id, scope.id, &bf, true)?;
    }

    // Saved configuration from a previous `configure`.
    let cf = project.naming.config_file(&project.out_root);
    if cf.exists() {
        source_file(ctx, scope.id, scope.id, &cf, true)?;
    }

    finish_bootstrap(ctx, scope.id, project)?;
    extra.data.write().bootstrapped = true;
    source_hooks(ctx, scope.id, project, "bootstrap", "post")?;
    Ok(scope.id)
}

/// Read back what bootstrap.build assigned and fix the project-level
/// invariants in `root_extra`.
fn finish_bootstrap(ctx: &Arc<Context>, root: ScopeId, project: &Project) -> diag::Result<()> {
    let scope = ctx.scopes.get(root);
    let extra = scope.root_extra().ok_or_else(|| Error::internal("root scope without root_extra"))?;

    let project_name = {
        let pool = ctx.var_pool();
        let Some(v) = pool.find("project") else { return Err(Error::internal("project variable not entered")) };
        drop(pool);
        let l = scope::find(ctx, root, v)?;
        match l.value_ref() {
            Some(val) => {
                let coerced = val
                    .coerce(crate::value::PROJECT_NAME)
                    .map_err(Error::semantic)?;
                coerced.as_project().cloned()
            }
            None => None,
        }
    };

    // Subprojects: an explicit `subprojects = ...` wins; otherwise scan
    // one level of source subdirectories for nested projects.
    let mut subprojects = std::collections::BTreeMap::new();
    let mut subprojects_disabled = false;
    {
        let pool = ctx.var_pool();
        let explicit = pool
            .find("subprojects")
            .and_then(|v| {
                drop(pool);
                scope::find(ctx, root, v).ok()
            });
        match explicit {
            Some(l) if l.defined() => {
                if l.is_set() {
                    for n in l.to_names() {
                        if n.directory() {
                            let name = n.dir.leaf().to_owned();
                            subprojects.insert(name, n.dir.clone());
                        } else if !n.value.is_empty() {
                            subprojects.insert(n.value.clone(), DirPath::new(&n.value));
                        }
                    }
                } else {
                    subprojects_disabled = true;
                }
            }
            _ => {
                for (name, dir) in scan_subprojects(&project.src_root, project.naming) {
                    subprojects.insert(name, dir);
                }
            }
        }
    }

    // Amalgamation: the nearest enclosing project, unless disabled.
    let mut amalgamation = None;
    let mut amalgamation_disabled = false;
    {
        let pool = ctx.var_pool();
        let explicit = pool.find("amalgamation").and_then(|v| {
            drop(pool);
            scope::find(ctx, root, v).ok()
        });
        if let Some(l) = explicit {
            if l.defined() && !l.is_set() {
                amalgamation_disabled = true;
            } else if l.is_set() {
                let ns = l.to_names();
                if let Some(n) = ns.first() {
                    amalgamation = Some(n.dir.clone());
                }
            }
        }
    }
    if amalgamation.is_none() && !amalgamation_disabled && project.out_root.depth() > 1 {
        let mut d = project.out_root.directory();
        while d.depth() > 0 {
            if is_out_root(&d).is_some() || detect_naming(&d).is_some() {
                amalgamation = Some(d);
                break;
            }
            if d.depth() <= 1 {
                break;
            }
            d = d.directory();
        }
    }

    let mut data = extra.data.write();
    data.project = project_name;
    data.subprojects = subprojects;
    data.subprojects_disabled = subprojects_disabled;
    data.amalgamation = amalgamation;
    data.amalgamation_disabled = amalgamation_disabled;
    Ok(())
}

/// One-level scan for nested projects, naming each by its `project =`
/// assignment (falling back to the directory name).
fn scan_subprojects(src_root: &DirPath, naming: Naming) -> Vec<(String, DirPath)> {
    let mut r = Vec::new();
    let Ok(entries) = std::fs::read_dir(src_root.as_path()) else { return r };
    let mut items: Vec<_> = entries.flatten().collect();
    items.sort_by_key(std::fs::DirEntry::file_name);
    for e in items {
        if !e.file_type().is_ok_and(|t| t.is_dir()) {
            continue;
        }
        let dname = e.file_name().to_string_lossy().into_owned();
        if dname == naming.build_dir() {
            continue;
        }
        let sub = src_root.join(&dname);
        let bf = naming.bootstrap_file(&sub);
        if !bf.exists() {
            continue;
        }
        let name = std::fs::read_to_string(&bf)
            .ok()
            .and_then(|text| {
                text.lines().find_map(|l| {
                    let l = l.trim();
                    l.strip_prefix("project")
                        .and_then(|r| r.trim_start().strip_prefix('='))
                        .map(|v| v.trim().to_owned())
                })
            })
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| dname.clone());
        r.push((name, DirPath::new(&dname)));
    }
    r
}

/// Load `root.build` and its hooks (idempotent).
pub fn load_root(ctx: &Arc<Context>, root: ScopeId) -> diag::Result<()> {
    let scope = ctx.scopes.get(root);
    let extra = scope.root_extra().ok_or_else(|| Error::internal("load_root on non-root scope"))?;
    {
        let data = extra.data.read();
        if data.root_loaded {
            return Ok(());
        }
    }
    let naming = Naming { altn: extra.data.read().altn };
    let src_root = scope.src_path().unwrap_or_else(|| scope.out_path.clone());
    let project = Project { src_root: src_root.clone(), out_root: scope.out_path.clone(), naming };

    source_hooks(ctx, root, &project, "root", "pre")?;
    let rf = naming.root_file(&src_root);
    if rf.exists() {
        source_file(ctx, root, root, &rf, true)?;
    }
    source_hooks(ctx, root, &project, "root", "post")?;
    extra.data.write().root_loaded = true;
    Ok(())
}

/// Source `pre-*.build` / `post-*.build` hook files from
/// `build/<which>/`.
fn source_hooks(
    ctx: &Arc<Context>,
    root: ScopeId,
    project: &Project,
    which: &str,
    prefix: &str,
) -> diag::Result<()> {
    let dir = project.naming.hooks_dir(&project.src_root, which);
    let Ok(entries) = std::fs::read_dir(dir.as_path()) else { return Ok(()) };
    let mut files: Vec<PathBuf> = entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| {
            p.file_name().and_then(|n| n.to_str()).is_some_and(|n| {
                n.starts_with(&format!("{prefix}-")) && n.ends_with(&format!(".{}", project.naming.ext()))
            })
        })
        .collect();
    files.sort();
    for f in files {
        source_file(ctx, root, root, &f, true)?;
    }
    Ok(())
}

/// Source a buildfile into the given scopes, with cyclic-include
/// detection and an optional once-set.
pub fn source_file(
    ctx: &Arc<Context>,
    root: ScopeId,
    base: ScopeId,
    path: &Path,
    once: bool,
) -> diag::Result<()> {
    let canonical = path.to_path_buf();
    {
        let stack = ctx.include_stack.lock();
        if stack.contains(&canonical) {
            return Err(Error::semantic(format!(
                "cyclic inclusion of {}",
                canonical.display()
            )));
        }
    }
    if once {
        let rs = ctx.scopes.get(root);
        if let Some(extra) = rs.root_extra() {
            let mut sourced = extra.sourced.lock();
            if !sourced.insert(canonical.clone()) {
                return Ok(());
            }
        }
    }

    let text = std::fs::read_to_string(path)
        .map_err(|e| Error::resource(format!("cannot read {}: {e}", path.display())))?;
    ctx.include_stack.lock().push(canonical.clone());
    let r = parse::parse_buildfile_text(ctx, &text, &path.to_string_lossy(), root, base);
    ctx.include_stack.lock().pop();
    r
}

/// Enter a (sub)directory scope below the current one, wiring links and
/// the base-directory variables.
pub fn switch_scope(ctx: &Arc<Context>, root: ScopeId, cur: ScopeId, dir: &DirPath) -> diag::Result<ScopeId> {
    let cur_s = ctx.scopes.get(cur);
    let out = if dir.is_absolute() { dir.clone() } else { cur_s.out_path.join(dir.as_path()) };
    let (scope, _) = ctx.scopes.insert(&out);

    let root_s = ctx.scopes.get(root);
    let src = root_s.src_path().and_then(|src_root| {
        out.relative_to(&root_s.out_path).map(|rel| src_root.join(rel.as_path()))
    });
    {
        let mut links = scope.links.write();
        if links.root.is_none() {
            links.root = Some(root);
        }
        if links.src_path.is_none() {
            links.src_path = src.clone();
        }
    }
    {
        let mut pool = ctx.var_pool_mut();
        let src_base_v = pool.insert("src_base");
        let out_base_v = pool.insert("out_base");
        drop(pool);
        let pool = ctx.var_pool();
        let mut vars = scope.vars.write();
        vars.set(&pool, out_base_v, Value::from_dir(out.clone()));
        if let Some(s) = src {
            vars.set(&pool, src_base_v, Value::from_dir(s));
        }
    }
    Ok(scope.id)
}

/// The `include` directive: load a buildfile with scope switching and
/// out-of-source mapping; a directory name loads its `buildfile`.
pub fn include(ctx: &Arc<Context>, root: ScopeId, base: ScopeId, n: &Name, loc: &Location) -> diag::Result<()> {
    let (dir, file) = include_target(ctx, root, base, n)?;
    let sub = switch_scope(ctx, root, base, &dir)?;
    source_file(ctx, root, sub, &file, true).map_err(|e| match e.location {
        Some(_) => e,
        None => e.at(loc.clone()),
    })
}

/// The `source` directive: load without scope switching.
pub fn source(ctx: &Arc<Context>, root: ScopeId, base: ScopeId, n: &Name, loc: &Location) -> diag::Result<()> {
    let (_, file) = include_target(ctx, root, base, n)?;
    source_file(ctx, root, base, &file, false).map_err(|e| match e.location {
        Some(_) => e,
        None => e.at(loc.clone()),
    })
}

/// Resolve an include/source name to (scope dir, buildfile path) against
/// the base scope's source directory.
fn include_target(
    ctx: &Arc<Context>,
    root: ScopeId,
    base: ScopeId,
    n: &Name,
) -> diag::Result<(DirPath, PathBuf)> {
    let base_s = ctx.scopes.get(base);
    let root_s = ctx.scopes.get(root);
    let naming = root_s
        .root_extra()
        .map_or(Naming::std(), |e| Naming { altn: e.data.read().altn });

    let src_base = base_s.src_path().unwrap_or_else(|| base_s.out_path.clone());
    if n.directory() || n.value.is_empty() {
        let dir = if n.dir.is_absolute() { n.dir.clone() } else { base_s.out_path.join(n.dir.as_path()) };
        let src_dir = if n.dir.is_absolute() { n.dir.clone() } else { src_base.join(n.dir.as_path()) };
        Ok((dir, src_dir.join_file(naming.buildfile())))
    } else {
        let dir = if n.dir.is_absolute() { n.dir.clone() } else { base_s.out_path.join(n.dir.as_path()) };
        let src_dir = if n.dir.is_absolute() { n.dir.clone() } else { src_base.join(n.dir.as_path()) };
        Ok((dir, src_dir.join_file(&n.value)))
    }
}

/// `import`: resolve a (possibly project-qualified) name to names in the
/// current context, per the documented resolution order.
pub fn import(
    ctx: &Arc<Context>,
    base: ScopeId,
    n: &Name,
    optional: bool,
    metadata: bool,
    _immediate: bool,
    loc: &Location,
) -> diag::Result<Names> {
    // Ad hoc: absolute or directory names resolve as-is.
    if n.dir.is_absolute() || (n.directory() && !n.dir.is_empty()) {
        return Ok(vec![n.clone()]);
    }

    // Project-local: unqualified names stay in the current project.
    let Some(proj) = &n.project else {
        return Ok(vec![n.clone()]);
    };
    if proj.as_str().is_empty() {
        return Ok(vec![strip_project(n)]);
    }

    let base_s = ctx.scopes.get(base);
    let root = base_s.root().unwrap_or(base);

    // 1. config.import.<proj>.<name>[.<type>] and config.import.<proj>.
    {
        let candidates = [
            format!("config.import.{}.{}.{}", proj, n.value, n.typ),
            format!("config.import.{}.{}", proj, n.value),
            format!("config.import.{proj}"),
        ];
        for cname in candidates {
            let var = {
                let pool = ctx.var_pool();
                pool.find(&cname)
            };
            let Some(var) = var else { continue };
            let l = scope::find(ctx, base, var)?;
            if !l.is_set() {
                continue;
            }
            let ns = l.to_names();
            // A directory value points at the project's out root; a
            // target name replaces the import wholesale.
            if let Some(first) = ns.first() {
                if first.directory() {
                    let sub = Project {
                        src_root: first.dir.clone(),
                        out_root: first.dir.clone(),
                        naming: detect_naming(&first.dir).unwrap_or(Naming::std()),
                    };
                    return import_from_project(ctx, &sub, n, metadata, loc);
                }
                return Ok(ns);
            }
        }
    }

    // 2. Subprojects of this root and of the outer amalgamations.
    let mut cur = Some(root);
    while let Some(rid) = cur {
        let rs = ctx.scopes.get(rid);
        let Some(extra) = rs.root_extra() else { break };
        let (subdir, amalg, disabled) = {
            let data = extra.data.read();
            (
                data.subprojects.get(proj.as_str()).or_else(|| data.subprojects.get(proj.base())).cloned(),
                data.amalgamation.clone(),
                data.amalgamation_disabled,
            )
        };
        if let Some(rel) = subdir {
            let src_root = rs.src_path().unwrap_or_else(|| rs.out_path.clone()).join(rel.as_path());
            let out_root = rs.out_path.join(rel.as_path());
            let naming = detect_naming(&src_root).unwrap_or(Naming::std());
            let sub = Project { src_root, out_root, naming };
            return import_from_project(ctx, &sub, n, metadata, loc);
        }
        if disabled {
            break;
        }
        cur = match amalg {
            Some(dir) => {
                let (s, _) = ctx.scopes.insert(&dir);
                if s.is_root() {
                    Some(s.id)
                } else if let Some(naming) = detect_naming(&dir).or_else(|| is_out_root(&dir)) {
                    let p = discover(&dir).unwrap_or(Project {
                        src_root: dir.clone(),
                        out_root: dir.clone(),
                        naming,
                    });
                    Some(bootstrap(ctx, &p)?)
                } else {
                    None
                }
            }
            None => None,
        };
    }

    // 3. Phase 2: rule-based resolution — executables are searched in
    // PATH.
    if ctx.target_types().is_a(exe_type(ctx, base, n), EXE) {
        if let Some(found) = search_path(&n.value) {
            let dir = DirPath::new(found.parent().unwrap_or_else(|| Path::new("/")));
            let key = TargetKey {
                typ: EXE,
                dir: dir.clone(),
                out: DirPath::current(),
                name: n.value.clone(),
                ext: None,
            };
            let (t, _) = ctx.targets.insert(ctx, key, true);
            t.set_path(found.clone());
            {
                let mut pool = ctx.var_pool_mut();
                let v = pool.insert("process_path");
                drop(pool);
                let pool = ctx.var_pool();
                t.core.write().vars.set(&pool, v, Value::from_path(found.clone()));
            }
            if metadata {
                extract_metadata(ctx, &t, &found, &n.value, loc)?;
            }
            let mut r = n.clone();
            r.project = None;
            r.dir = dir;
            return Ok(vec![r]);
        }
    }

    if optional {
        return Ok(Names::new());
    }
    Err(Error::lookup(format!(
        "unable to import target {n}",
    ))
    .at(loc.clone())
    .note(format!("project {proj} is not configured, not a subproject, and no rule resolved it"))
    .note(format!("specify config.import.{proj} to configure it")))
}

fn exe_type(ctx: &Arc<Context>, base: ScopeId, n: &Name) -> crate::target::TargetTypeId {
    if n.typed() {
        target::find_target_type(ctx, base, &n.typ).unwrap_or(target::FILE)
    } else {
        target::FILE
    }
}

fn strip_project(n: &Name) -> Name {
    let mut r = n.clone();
    r.project = None;
    r
}

/// Bootstrap the named project and source its export stub; the stub's
/// `export` directive leaves the result in the context stash.
fn import_from_project(
    ctx: &Arc<Context>,
    sub: &Project,
    n: &Name,
    _metadata: bool,
    loc: &Location,
) -> diag::Result<Names> {
    let root = bootstrap(ctx, sub)?;
    load_root(ctx, root)?;

    let ef = sub.naming.export_file(&sub.src_root);
    if !ef.exists() {
        // No stub: resolve to the name rooted in the project's out dir.
        let mut r = strip_project(n);
        r.dir = sub.out_root.join(r.dir.as_path());
        return Ok(vec![r]);
    }

    *ctx.export_stash.lock() = None;
    source_file(ctx, root, root, &ef, false)?;
    let exported = ctx.export_stash.lock().take().unwrap_or_default();
    if exported.is_empty() {
        return Err(Error::semantic(format!(
            "export stub {} did not export anything for {n}",
            ef.display()
        ))
        .at(loc.clone()));
    }
    // Root exported target references in the subproject's out directory;
    // plain word values pass through untouched.
    let mut out = Names::with_capacity(exported.len());
    for mut e in exported {
        if (e.typed() || !e.dir.is_empty()) && !e.dir.is_absolute() {
            e.dir = sub.out_root.join(e.dir.as_path());
        }
        out.push(e);
    }
    Ok(out)
}

fn search_path(name: &str) -> Option<PathBuf> {
    let paths = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&paths) {
        let candidate = dir.join(name);
        if candidate.is_file() {
            return Some(candidate);
        }
        #[cfg(windows)]
        {
            let exe = dir.join(format!("{name}.exe"));
            if exe.is_file() {
                return Some(exe);
            }
        }
    }
    None
}

/// Maximum metadata output read from an imported executable.
const METADATA_LIMIT: usize = 64 * 1024;

/// Run `<exe> --build2-metadata=1` and parse the output: a signature
/// line `# build2 buildfile <key>` followed by buildfile text assigning
/// variables on the imported target. Cached by effective path.
pub fn extract_metadata(
    ctx: &Arc<Context>,
    t: &Arc<crate::target::Target>,
    exe: &Path,
    key: &str,
    loc: &Location,
) -> diag::Result<()> {
    let cached = ctx.import_metadata.lock().get(exe).cloned();
    let vars: Arc<Vec<(String, Names)>> = match cached {
        Some(v) => v,
        None => {
            let output = std::process::Command::new(exe)
                .arg("--build2-metadata=1")
                .output()
                .map_err(|e| {
                    Error::resource(format!("cannot execute {}: {e}", exe.display())).at(loc.clone())
                })?;
            if !output.status.success() {
                return Err(Error::child(format!(
                    "{} exited with {} while extracting metadata",
                    exe.display(),
                    output.status
                ))
                .at(loc.clone()));
            }
            let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
            if text.len() > METADATA_LIMIT {
                return Err(Error::semantic(format!(
                    "metadata output of {} exceeds 64KiB",
                    exe.display()
                ))
                .at(loc.clone()));
            }
            let Some(nl) = text.find('\n') else {
                return Err(metadata_signature_error(exe, loc));
            };
            let first = text[..nl].trim().to_owned();
            let expected = format!("# build2 buildfile {key}");
            if first != expected {
                return Err(metadata_signature_error(exe, loc));
            }
            text.drain(..=nl);

            parse::parse_metadata(ctx, &text, &format!("<metadata:{}>", exe.display()), t)?;
            // Snapshot the assigned variables for the cache.
            let snapshot: Vec<(String, Names)> = {
                let core = t.core.read();
                core.vars
                    .iter()
                    .map(|(name, e)| (name.clone(), e.value.reverse()))
                    .collect()
            };
            let arc = Arc::new(snapshot);
            ctx.import_metadata.lock().insert(exe.to_path_buf(), arc.clone());
            return Ok(());
        }
    };

    // Replay the cached variables onto this target.
    let mut pool = ctx.var_pool_mut();
    let ids: Vec<_> = vars.iter().map(|(name, _)| pool.insert(name)).collect();
    drop(pool);
    let pool = ctx.var_pool();
    let mut core = t.core.write();
    for ((_, ns), id) in vars.iter().zip(ids) {
        core.vars.set(&pool, id, Value::from_names(ns.clone()));
    }
    Ok(())
}

fn metadata_signature_error(exe: &Path, loc: &Location) -> Error {
    Error::semantic(format!(
        "invalid metadata signature in output of {}",
        exe.display()
    ))
    .at(loc.clone())
    .note("expected first line '# build2 buildfile <name>'")
}

/// Persist the current `config.*` variables of a root scope to
/// `build/config.build` (the `configure` meta-operation).
pub fn configure(ctx: &Arc<Context>, root: ScopeId) -> diag::Result<()> {
    let scope = ctx.scopes.get(root);
    let naming = scope
        .root_extra()
        .map_or(Naming::std(), |e| Naming { altn: e.data.read().altn });
    let path = naming.config_file(&scope.out_path);

    let mut lines = vec![
        "# Created automatically by the configure meta-operation.".to_owned(),
        "#".to_owned(),
    ];
    {
        // Persist the effective values: in-scope assignments with the
        // command-line overrides applied on top.
        let mut names: std::collections::BTreeSet<String> = scope
            .vars
            .read()
            .namespace("config")
            .map(|(n, _)| n.clone())
            .collect();
        {
            let pool = ctx.var_pool();
            for o in ctx.overrides() {
                let n = &pool.get(o.var).name;
                if n.starts_with("config.") {
                    names.insert(n.clone());
                }
            }
        }
        for name in names {
            if name.contains(".__") {
                continue; // synthetic override variables
            }
            let Some(var) = ctx.var_pool().find(&name) else { continue };
            let l = crate::scope::find(ctx, root, var)?;
            if let Some(v) = l.value_ref() {
                lines.push(format!("{name} = {}", v.display()));
            }
        }
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&path, lines.join("\n") + "\n")?;
    ctx.diag.progress(1, &format!("save {}", path.display()));
    Ok(())
}

/// Remove the persisted configuration (the `disfigure` meta-operation).
pub fn disfigure(ctx: &Arc<Context>, root: ScopeId) -> diag::Result<()> {
    let scope = ctx.scopes.get(root);
    let naming = scope
        .root_extra()
        .map_or(Naming::std(), |e| Naming { altn: e.data.read().altn });
    let path = naming.config_file(&scope.out_path);
    if path.exists() {
        std::fs::remove_file(&path)?;
        ctx.diag.progress(1, &format!("rm {}", path.display()));
    }
    Ok(())
}
