//! High-level driver: buildspec execution against a start directory.
//!
//! The CLI is a thin wrapper over [`run`]; tests drive end-to-end
//! scenarios through it as well.

use std::sync::Arc;

use crate::{
    context::Context,
    diag::{self, Error},
    dump, file, operation,
    parse::{self, BuildspecEntry},
    path::DirPath,
    scheduler::RunPhase,
    scope::ScopeId,
    target::{self, DIR, Target, TargetKey, TargetState},
};

/// Execute a buildspec (defaulting to `update(./)`) with the project
/// containing `start`.
pub fn run(ctx: &Arc<Context>, start: &DirPath, buildspec: &str) -> diag::Result<TargetState> {
    let mut entries = parse::parse_buildspec(buildspec)?;
    if entries.is_empty() {
        entries.push(BuildspecEntry::default());
    }

    let mut overall = TargetState::Unchanged;
    for e in entries {
        let meta = match &e.meta_operation {
            Some(m) => operation::parse_meta_operation(m)
                .ok_or_else(|| Error::lookup(format!("unknown meta-operation '{m}'")))?,
            None => operation::PERFORM,
        };
        let op = match &e.operation {
            Some(o) => operation::parse_operation(o)
                .ok_or_else(|| Error::lookup(format!("unknown operation '{o}'")))?,
            None => operation::DEFAULT,
        };
        // The default operation of perform is update.
        let op = if op == operation::DEFAULT { operation::UPDATE } else { op };

        let specs: Vec<String> =
            if e.targets.is_empty() { vec!["./".to_owned()] } else { e.targets.clone() };

        let (root, targets) = {
            let _phase = ctx.phase.lock(RunPhase::Load);
            load_targets(ctx, start, &specs)?
        };

        match meta {
            operation::CONFIGURE => file::configure(ctx, root)?,
            operation::DISFIGURE => file::disfigure(ctx, root)?,
            operation::DUMP => {
                if ctx.dump_json {
                    let json = dump::dump_json(ctx)?;
                    let rendered = serde_json::to_string_pretty(&json)
                        .map_err(|e| Error::internal(format!("dump serialization: {e}")))?;
                    for line in rendered.lines() {
                        ctx.diag.print(line);
                    }
                } else {
                    let text = dump::dump_text(ctx)?;
                    for line in text.lines() {
                        ctx.diag.print(line);
                    }
                }
            }
            operation::INFO => print_info(ctx, root),
            _ => {
                let a = operation::Action::new(meta, op);
                let st = operation::perform(ctx, a, &targets)?;
                overall = overall.max(st);
            }
        }
    }
    Ok(overall)
}

/// Discover and load the project, then resolve the target specs.
fn load_targets(
    ctx: &Arc<Context>,
    start: &DirPath,
    specs: &[String],
) -> diag::Result<(ScopeId, Vec<Arc<Target>>)> {
    let project = file::discover(start)?;
    let root = file::bootstrap(ctx, &project)?;
    file::load_root(ctx, root)?;

    // The project's top-level buildfile.
    let rs = ctx.scopes.get(root);
    let naming = rs
        .root_extra()
        .map_or(file::Naming::std(), |e| file::Naming { altn: e.data.read().altn });
    let bf = project.src_root.join_file(naming.buildfile());
    if bf.exists() {
        file::source_file(ctx, root, root, &bf, true)?;
    }

    let mut targets = Vec::new();
    for spec in specs {
        targets.push(resolve_target(ctx, root, start, spec, naming)?);
    }
    Ok((root, targets))
}

fn resolve_target(
    ctx: &Arc<Context>,
    root: ScopeId,
    start: &DirPath,
    spec: &str,
    naming: file::Naming,
) -> diag::Result<Arc<Target>> {
    let (dir_s, typ_s, name_s) = split_target_spec(spec)?;

    let rel = DirPath::new(dir_s);
    let dir = if rel.is_absolute() { rel } else { start.join(rel.as_path()) };

    // Make sure the directory's buildfile is loaded so its targets and
    // scope variables exist.
    let scope = file::switch_scope(ctx, root, root, &dir)?;
    let s = ctx.scopes.get(scope);
    if let Some(src) = s.src_path() {
        let bf = src.join_file(naming.buildfile());
        if bf.exists() {
            file::source_file(ctx, root, scope, &bf, true)?;
        }
    }

    if name_s.is_empty() && typ_s.is_none() {
        let key = TargetKey {
            typ: DIR,
            dir,
            out: DirPath::current(),
            name: String::new(),
            ext: None,
        };
        let (t, _) = ctx.targets.insert(ctx, key, true);
        return Ok(t);
    }

    let typ = match &typ_s {
        Some(tn) => target::find_target_type(ctx, scope, tn)
            .ok_or_else(|| Error::lookup(format!("unknown target type '{tn}'")))?,
        None => target::FILE,
    };
    let (name, ext) = ctx.target_types().split_name(typ, &name_s);
    let key = TargetKey { typ, dir, out: DirPath::current(), name, ext };
    // Prefer an already-declared target (possibly in the source tree).
    if let Some(t) = ctx.targets.find(&key) {
        return Ok(t);
    }
    let (t, _) = ctx.targets.insert(ctx, key, true);
    Ok(t)
}

/// `dir/`, `name`, `type{name}`, `dir/type{name}`.
fn split_target_spec(spec: &str) -> diag::Result<(&str, Option<String>, String)> {
    if let Some(open) = spec.find('{') {
        let Some(stripped) = spec[open + 1..].strip_suffix('}') else {
            return Err(Error::parse(
                crate::diag::Location::new("<buildspec>", 1, 1),
                format!("unterminated target type in '{spec}'"),
            ));
        };
        let prefix = &spec[..open];
        let (dir, typ) = match prefix.rfind('/') {
            Some(i) => (&prefix[..=i], &prefix[i + 1..]),
            None => ("", prefix),
        };
        return Ok((dir, Some(typ.to_owned()), stripped.to_owned()));
    }
    if spec.ends_with('/') {
        return Ok((spec, None, String::new()));
    }
    match spec.rfind('/') {
        Some(i) => Ok((&spec[..=i], None, spec[i + 1..].to_owned())),
        None => Ok(("", None, spec.to_owned())),
    }
}

fn print_info(ctx: &Arc<Context>, root: ScopeId) {
    let s = ctx.scopes.get(root);
    let Some(extra) = s.root_extra() else {
        ctx.diag.print("not a project root");
        return;
    };
    let data = extra.data.read();
    let project = data.project.as_ref().map_or_else(|| "<unnamed>".to_owned(), ToString::to_string);
    ctx.diag.print(&format!("project: {project}"));
    if let Some(src) = s.src_path() {
        ctx.diag.print(&format!("src_root: {src}"));
    }
    ctx.diag.print(&format!("out_root: {}", s.out_path));
    if let Some(a) = &data.amalgamation {
        ctx.diag.print(&format!("amalgamation: {a}"));
    }
    if !data.subprojects.is_empty() {
        let subs: Vec<String> = data
            .subprojects
            .iter()
            .map(|(n, d)| format!("{n}@{d}"))
            .collect();
        ctx.diag.print(&format!("subprojects: {}", subs.join(" ")));
    }
    if !data.modules.is_empty() {
        ctx.diag.print(&format!("modules: {}", data.modules.join(" ")));
    }
    ctx.diag.print("meta-operations: perform configure disfigure dump info");
    ctx.diag.print("operations: update clean");
}
