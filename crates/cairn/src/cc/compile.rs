//! The compile rule: source to object (or module interface) with
//! dynamic header-dependency extraction.
//!
//! The recipe consults the depdb for the rule identity, the compiler
//! checksum, the target triplet, the option set, and the extracted
//! header set; any mismatch (or a newer input) re-runs the preprocessor
//! to refresh the header list and then the compiler itself.

use std::{
    path::{Path, PathBuf},
    process::Command,
    sync::Arc,
};

use crate::{
    context::Context,
    depdb::{self, DepDb},
    diag::{self, Error},
    operation::{self, Action, CLEAN},
    rule::{Recipe, Rule, clean_recipe, depdb_path},
    target::{self, MTIME_NONEXISTENT, Target, TargetState, TargetTypeId},
};

use super::common::{CcConfig, Lang};

pub struct CompileRule {
    lang: Lang,
}

impl CompileRule {
    pub fn new(lang: Lang) -> Self {
        Self { lang }
    }

    fn src_type(&self, ctx: &Arc<Context>) -> Option<TargetTypeId> {
        ctx.target_types().find(self.lang.src_type())
    }

    /// A declared source prerequisite of our language, on the target or
    /// its group.
    fn has_source(&self, ctx: &Arc<Context>, t: &Arc<Target>) -> bool {
        let Some(st) = self.src_type(ctx) else { return false };
        let own = t.core.read().prerequisites.iter().any(|p| p.typ == st);
        if own {
            return true;
        }
        let group = t.core.read().group;
        match group {
            Some(g) => ctx.targets.get(g).core.read().prerequisites.iter().any(|p| p.typ == st),
            None => false,
        }
    }
}

impl Rule for CompileRule {
    fn name(&self) -> &'static str {
        match self.lang {
            Lang::C => "c.compile",
            Lang::Cxx => "cxx.compile",
        }
    }

    fn matches(&self, ctx: &Arc<Context>, _a: Action, t: &Arc<Target>, _hint: &str) -> bool {
        self.has_source(ctx, t)
    }

    fn apply(&self, ctx: &Arc<Context>, a: Action, t: &Arc<Target>) -> diag::Result<Recipe> {
        t.derive_path(ctx);

        // Sources declared on the group resolve through us.
        let st = self.src_type(ctx);
        {
            let group = t.core.read().group;
            if let (Some(st), Some(g)) = (st, group) {
                let own_has = t.core.read().prerequisites.iter().any(|p| p.typ == st);
                if !own_has {
                    let gp = ctx.targets.get(g);
                    let copies: Vec<_> = {
                        let gcore = gp.core.read();
                        gcore
                            .prerequisites
                            .iter()
                            .map(|p| {
                                let mut c = target::Prerequisite::new(
                                    p.typ,
                                    p.dir.clone(),
                                    p.name.clone(),
                                    p.ext.clone(),
                                    p.scope,
                                );
                                c.project = p.project.clone();
                                c.vars = p.vars.clone();
                                c
                            })
                            .collect()
                    };
                    t.core.write().prerequisites.extend(copies);
                }
            }
        }

        operation::match_prerequisites(ctx, a, t)?;

        // Module interfaces participate for import discovery only; the
        // dependent need not block on their update for this action.
        {
            let bmi_types: Vec<TargetTypeId> = {
                let tt = ctx.target_types();
                ["bmi", "bmie", "bmia", "bmis"].iter().filter_map(|n| tt.find(n)).collect()
            };
            let mut data = t.state(a).data.lock();
            for pt in &mut data.prerequisite_targets {
                if let Some(id) = pt.target {
                    let p = ctx.targets.get(id);
                    if bmi_types.contains(&p.key.typ) {
                        pt.unmatched = true;
                    }
                }
            }
        }

        if a.operation == CLEAN {
            return Ok(clean_recipe());
        }

        let lang = self.lang;
        Ok(Recipe::from_fn(move |ctx, a, t| compile(ctx, a, t, lang)))
    }
}

fn compile(ctx: &Arc<Context>, a: Action, t: &Arc<Target>, lang: Lang) -> diag::Result<TargetState> {
    let (_prereq_state, prereq_mtime) = operation::execute_prerequisites(ctx, a, t)?;

    let cfg = CcConfig::load(ctx, t, lang)?;
    let out = t
        .path()
        .ok_or_else(|| Error::internal(format!("object target {} has no path", t.key.name)))?;
    let src = source_path(ctx, a, t, lang)?;

    if ctx.dry_run {
        // No depdb writes and no spawns; the decision degrades to mtimes.
        let tm = t.load_mtime();
        if tm == MTIME_NONEXISTENT || prereq_mtime > tm || target::file_mtime(&src) > tm {
            ctx.diag.progress(1, &format!("{} {}", lang.name(), file_leaf(&src)));
            return Ok(TargetState::Changed);
        }
        return Ok(TargetState::Unchanged);
    }

    let options = cfg.compile_options();
    let mut db = DepDb::open(depdb_path(&out))?;
    let mut miss = false;
    miss |= !db.expect(&format!("{}.compile 1", lang.var()))?;
    miss |= !db.expect(&cfg.checksum)?;
    miss |= !db.expect(cfg.triplet.as_str())?;
    miss |= !db.expect(&depdb::checksum(&options))?;
    miss |= !db.expect(&src.to_string_lossy())?;

    let tmtime = t.load_mtime();
    let mut outdated = miss || tmtime == MTIME_NONEXISTENT || prereq_mtime > tmtime;
    if !outdated && target::file_mtime(&src) > tmtime {
        outdated = true;
    }

    // Validate the stored header set.
    let mut headers: Vec<PathBuf> = Vec::new();
    if !outdated {
        while let Some(line) = db.read()? {
            let h = PathBuf::from(&line);
            let m = target::file_mtime(&h);
            if m == MTIME_NONEXISTENT || m > tmtime {
                outdated = true;
                break;
            }
            headers.push(h);
        }
    }

    if !outdated {
        db.close()?;
        return Ok(TargetState::Unchanged);
    }

    // Refresh the header set by preprocessing.
    headers = extract_headers(ctx, &cfg, &options, &src)?;
    for h in &headers {
        db.write(&h.to_string_lossy())?;
    }
    db.close()?;

    ctx.diag.progress(1, &format!("{} {}", lang.name(), file_leaf(&src)));
    let mut cmd = Command::new(&cfg.path);
    cmd.args(&options).arg("-c").arg(&src).arg("-o").arg(&out);
    ctx.diag.progress(2, &render(&cmd));
    run_tool(ctx, &mut cmd)?;
    t.set_mtime(target::file_mtime(&out));
    Ok(TargetState::Changed)
}

fn source_path(ctx: &Arc<Context>, a: Action, t: &Arc<Target>, lang: Lang) -> diag::Result<PathBuf> {
    let st = ctx
        .target_types()
        .find(lang.src_type())
        .ok_or_else(|| Error::internal("source target type not registered"))?;
    let prereqs = t.state(a).data.lock().prerequisite_targets.clone();
    for pt in prereqs {
        let Some(id) = pt.target else { continue };
        let p = ctx.targets.get(id);
        if p.key.typ == st {
            if let Some(path) = p.path() {
                return Ok(path);
            }
            let file = ctx.target_types().file_name(p.key.typ, &p.key.name, p.key.ext.as_deref());
            return Ok(p.key.dir.join_file(file));
        }
    }
    let tn = ctx.target_types().get(t.key.typ).name.clone();
    Err(Error::semantic(format!(
        "no {} source prerequisite for {tn}{{{}}}",
        lang.name(),
        t.key.name
    )))
}

/// Run the compiler in preprocess mode and parse the emitted makefile
/// dependencies into header paths.
fn extract_headers(
    ctx: &Arc<Context>,
    cfg: &CcConfig,
    options: &[String],
    src: &Path,
) -> diag::Result<Vec<PathBuf>> {
    if ctx.dry_run && !src.exists() {
        return Ok(Vec::new());
    }
    let mut cmd = Command::new(&cfg.path);
    cmd.args(options).arg("-M").arg("-MG").arg(src);
    ctx.diag.progress(3, &render(&cmd));
    let output = cmd
        .output()
        .map_err(|e| Error::resource(format!("cannot execute {}: {e}", cfg.path.display())))?;
    if !output.status.success() {
        return Err(child_error(&cfg.path, &output));
    }
    Ok(parse_make_deps(&String::from_utf8_lossy(&output.stdout), src))
}

fn parse_make_deps(text: &str, src: &Path) -> Vec<PathBuf> {
    let joined = text.replace("\\\n", " ").replace("\\\r\n", " ");
    let Some(colon) = joined.find(':') else { return Vec::new() };
    joined[colon + 1..]
        .split_whitespace()
        .filter(|p| Path::new(p) != src)
        .map(PathBuf::from)
        .collect()
}

pub(super) fn file_leaf(p: &Path) -> String {
    p.file_name().map_or_else(|| p.display().to_string(), |n| n.to_string_lossy().into_owned())
}

pub(super) fn render(cmd: &Command) -> String {
    let mut s = cmd.get_program().to_string_lossy().into_owned();
    for a in cmd.get_args() {
        s.push(' ');
        s.push_str(&a.to_string_lossy());
    }
    s
}

pub(super) fn child_error(tool: &Path, output: &std::process::Output) -> Error {
    let stderr = String::from_utf8_lossy(&output.stderr);
    let mut e = Error::child(format!("{} exited with {}", tool.display(), output.status));
    for line in stderr.lines().take(20) {
        e = e.note(line.to_owned());
    }
    e
}

pub(super) fn run_tool(_ctx: &Arc<Context>, cmd: &mut Command) -> diag::Result<()> {
    let output = cmd.output().map_err(|e| {
        Error::resource(format!(
            "cannot execute {}: {e}",
            cmd.get_program().to_string_lossy()
        ))
    })?;
    if !output.status.success() {
        return Err(child_error(Path::new(cmd.get_program()), &output));
    }
    // Warnings and the like go straight through.
    let stderr = String::from_utf8_lossy(&output.stderr);
    if !stderr.trim().is_empty() {
        eprint!("{stderr}");
    }
    Ok(())
}
