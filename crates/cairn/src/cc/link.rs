//! The link rule: object files, static/shared libraries, and executables.
//!
//! Prerequisites are processed in two passes: the first (inside the
//! shared prerequisite match) searches and matches everything in
//! parallel; the second finalizes source chains — synthesizing object
//! targets for source prerequisites, picking group members, and
//! verifying that a synthesized dependency is compatible with any
//! pre-existing target — before the new targets are matched.

use std::{path::PathBuf, process::Command, sync::Arc};

use crate::{
    context::Context,
    depdb::{self, DepDb},
    diag::{self, Error},
    operation::{self, Action, CLEAN},
    path::DirPath,
    rule::{Recipe, Rule, clean_recipe, depdb_path},
    scheduler::new_count,
    target::{self, MTIME_NONEXISTENT, Target, TargetKey, TargetState, TargetTypeId},
};

use super::{
    common::{CcConfig, Lang, lookup_string},
    compile::{file_leaf, render, run_tool},
};

/// Windows command lines beyond this spill into an argument file.
const CMDLINE_LIMIT: usize = 32_000;

/// Marks a static library prerequisite to be linked whole, through the
/// opaque prerequisite data slot.
pub const LINK_WHOLE: usize = 0x1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkKind {
    Exe,
    Liba,
    Libs,
}

pub struct LinkRule {
    lang: Lang,
}

impl LinkRule {
    pub fn new(lang: Lang) -> Self {
        Self { lang }
    }

    fn kind(&self, ctx: &Arc<Context>, t: &Arc<Target>) -> Option<LinkKind> {
        let tt = ctx.target_types();
        let name = &tt.get(t.key.typ).name;
        match name.as_str() {
            "exe" => Some(LinkKind::Exe),
            "liba" => Some(LinkKind::Liba),
            "libs" => Some(LinkKind::Libs),
            _ => None,
        }
    }

    fn linkable_types(&self, ctx: &Arc<Context>) -> LinkTypes {
        let tt = ctx.target_types();
        LinkTypes {
            src: tt.find(self.lang.src_type()),
            other_src: tt.find(if self.lang == Lang::C { "cxx" } else { "c" }),
            obj: tt.find("obj"),
            obje: tt.find("obje"),
            obja: tt.find("obja"),
            objs: tt.find("objs"),
            lib: tt.find("lib"),
            liba: tt.find("liba"),
            libs: tt.find("libs"),
        }
    }
}

struct LinkTypes {
    src: Option<TargetTypeId>,
    other_src: Option<TargetTypeId>,
    obj: Option<TargetTypeId>,
    obje: Option<TargetTypeId>,
    obja: Option<TargetTypeId>,
    objs: Option<TargetTypeId>,
    lib: Option<TargetTypeId>,
    liba: Option<TargetTypeId>,
    libs: Option<TargetTypeId>,
}

impl LinkTypes {
    fn member_for(&self, kind: LinkKind) -> Option<TargetTypeId> {
        match kind {
            LinkKind::Exe => self.obje,
            LinkKind::Liba => self.obja,
            LinkKind::Libs => self.objs,
        }
    }

    fn is_object(&self, t: TargetTypeId) -> bool {
        [self.obje, self.obja, self.objs].contains(&Some(t))
    }

    fn is_source(&self, t: TargetTypeId) -> bool {
        self.src == Some(t) || self.other_src == Some(t)
    }
}

impl Rule for LinkRule {
    fn name(&self) -> &'static str {
        match self.lang {
            Lang::C => "c.link",
            Lang::Cxx => "cxx.link",
        }
    }

    fn matches(&self, ctx: &Arc<Context>, _a: Action, t: &Arc<Target>, _hint: &str) -> bool {
        if self.kind(ctx, t).is_none() {
            return false;
        }
        let types = self.linkable_types(ctx);
        let check = |p: &target::Prerequisite| {
            types.is_source(p.typ)
                || types.is_object(p.typ)
                || types.obj == Some(p.typ)
                || types.lib == Some(p.typ)
                || types.liba == Some(p.typ)
                || types.libs == Some(p.typ)
        };
        if t.core.read().prerequisites.iter().any(check) {
            return true;
        }
        let group = t.core.read().group;
        group.is_some_and(|g| ctx.targets.get(g).core.read().prerequisites.iter().any(check))
    }

    fn apply(&self, ctx: &Arc<Context>, a: Action, t: &Arc<Target>) -> diag::Result<Recipe> {
        let kind = self
            .kind(ctx, t)
            .ok_or_else(|| Error::internal("link rule applied to a non-linkable target"))?;
        let cfg = CcConfig::load(ctx, t, self.lang)?;
        t.set_path(output_path(ctx, t, kind, &cfg));

        // A library member links its group's prerequisites.
        {
            let group = t.core.read().group;
            if let Some(g) = group {
                let own_empty = t.core.read().prerequisites.is_empty();
                if own_empty {
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

        // Pass 1: search and match everything declared, in parallel.
        operation::match_prerequisites(ctx, a, t)?;

        // Pass 2: finalize source chains and group member selection.
        let types = self.linkable_types(ctx);
        let mut to_match = Vec::new();
        {
            let mut data = t.state(a).data.lock();
            for pt in &mut data.prerequisite_targets {
                let Some(id) = pt.target else { continue };
                let p = ctx.targets.get(id);

                if types.is_source(p.key.typ) {
                    let member_t = types
                        .member_for(kind)
                        .ok_or_else(|| Error::internal("object types not registered"))?;
                    let member = synthesize_object(ctx, t, &p, member_t)?;
                    pt.target = Some(member.id);
                    pt.data = id.index(); // original source, for diagnostics
                    to_match.push(member);
                } else if types.obj == Some(p.key.typ) {
                    let member_t = types
                        .member_for(kind)
                        .ok_or_else(|| Error::internal("object types not registered"))?;
                    let member = group_member(ctx, &p, member_t)?;
                    pt.target = Some(member.id);
                    to_match.push(member);
                } else if types.lib == Some(p.key.typ) {
                    let member_t = match kind {
                        LinkKind::Liba => types.liba,
                        LinkKind::Exe | LinkKind::Libs => types.libs,
                    }
                    .ok_or_else(|| Error::internal("library types not registered"))?;
                    let member = group_member(ctx, &p, member_t)?;
                    pt.target = Some(member.id);
                    to_match.push(member);
                }
            }
        }

        let count = new_count();
        for m in &to_match {
            operation::match_async(ctx, a, m, &count);
        }
        ctx.sched.wait(&count);
        if ctx.fail.get() && !ctx.keep_going {
            return Err(Error::semantic(format!(
                "failed to match synthesized dependencies of {}",
                t.key.name
            )));
        }

        if a.operation == CLEAN {
            return Ok(clean_recipe());
        }
        let lang = self.lang;
        Ok(Recipe::from_fn(move |ctx, a, t| link(ctx, a, t, lang, kind)))
    }
}

/// Synthesize (or verify) the object target compiled from a source
/// prerequisite.
fn synthesize_object(
    ctx: &Arc<Context>,
    t: &Arc<Target>,
    src: &Arc<Target>,
    member_t: TargetTypeId,
) -> diag::Result<Arc<Target>> {
    let key = TargetKey {
        typ: member_t,
        dir: t.out_dir().clone(),
        out: DirPath::current(),
        name: src.key.name.clone(),
        ext: None,
    };
    let (member, inserted) = ctx.targets.insert(ctx, key, true);
    let has_src = member.core.read().prerequisites.iter().any(|p| {
        p.typ == src.key.typ && p.name == src.key.name
    });
    if inserted || !has_src {
        let other = member
            .core
            .read()
            .prerequisites
            .iter()
            .find(|p| {
                let tt = ctx.target_types();
                tt.get(p.typ).file && p.typ != src.key.typ && !p.name.is_empty()
            })
            .map(|p| format!("{}{{{}}}", ctx.target_types().get(p.typ).name, p.name));
        if let Some(existing) = other {
            let mn = ctx.target_types().get(member_t).name.clone();
            let sn = ctx.target_types().get(src.key.typ).name.clone();
            return Err(Error::semantic(format!(
                "synthesized dependency {mn}{{{}}} would be incompatible with existing target",
                member.key.name
            ))
            .note(format!("existing source prerequisite {existing}"))
            .note(format!("while chaining {sn}{{{}}}", src.key.name)));
        }
        member.core.write().prerequisites.push(target::Prerequisite::new(
            src.key.typ,
            src.key.dir.clone(),
            src.key.name.clone(),
            src.key.ext.clone(),
            src.base_scope,
        ));
    }
    Ok(member)
}

/// Pick (creating if necessary) a group's member of the given type.
fn group_member(
    ctx: &Arc<Context>,
    group: &Arc<Target>,
    member_t: TargetTypeId,
) -> diag::Result<Arc<Target>> {
    let key = TargetKey {
        typ: member_t,
        dir: group.key.dir.clone(),
        out: group.key.out.clone(),
        name: group.key.name.clone(),
        ext: None,
    };
    let (member, inserted) = ctx.targets.insert(ctx, key, true);
    if inserted {
        let mut mc = member.core.write();
        mc.group = Some(group.id);
        drop(mc);
        let mut gc = group.core.write();
        if !gc.members.contains(&member.id) {
            gc.members.push(member.id);
        }
    }
    Ok(member)
}

fn output_path(ctx: &Arc<Context>, t: &Arc<Target>, kind: LinkKind, cfg: &CcConfig) -> PathBuf {
    let windows = cfg.triplet.class() == "windows";
    let macos = cfg.triplet.class() == "macos";
    let file = match kind {
        LinkKind::Exe => {
            if windows {
                format!("{}.exe", t.key.name)
            } else {
                t.key.name.clone()
            }
        }
        LinkKind::Liba => format!("lib{}.a", t.key.name),
        LinkKind::Libs => {
            if windows {
                format!("{}.dll", t.key.name)
            } else if macos {
                format!("lib{}.dylib", t.key.name)
            } else {
                format!("lib{}.so", t.key.name)
            }
        }
    };
    let _ = ctx;
    t.out_dir().join_file(file)
}

fn link(
    ctx: &Arc<Context>,
    a: Action,
    t: &Arc<Target>,
    lang: Lang,
    kind: LinkKind,
) -> diag::Result<TargetState> {
    let (_state, prereq_mtime) = operation::execute_prerequisites(ctx, a, t)?;

    let cfg = CcConfig::load(ctx, t, lang)?;
    let out = t
        .path()
        .ok_or_else(|| Error::internal(format!("link target {} has no path", t.key.name)))?;

    // Inputs in declaration order.
    let mut inputs: Vec<String> = Vec::new();
    let mut whole: Vec<bool> = Vec::new();
    {
        let prereqs = t.state(a).data.lock().prerequisite_targets.clone();
        let type_names: Vec<String> = {
            let tt = ctx.target_types();
            prereqs
                .iter()
                .filter_map(|pt| pt.target)
                .map(|id| tt.get(ctx.targets.get(id).key.typ).name.clone())
                .collect()
        };
        let mut i = 0;
        for pt in &prereqs {
            let Some(id) = pt.target else { continue };
            let tn = &type_names[i];
            i += 1;
            if !matches!(tn.as_str(), "obje" | "obja" | "objs" | "liba" | "libs") {
                continue;
            }
            let p = ctx.targets.get(id);
            let Some(path) = p.path() else { continue };
            inputs.push(path.to_string_lossy().into_owned());
            whole.push(pt.data & LINK_WHOLE != 0 && tn == "liba");
        }
    }

    if ctx.dry_run {
        let tm = t.load_mtime();
        if tm == MTIME_NONEXISTENT || prereq_mtime > tm {
            ctx.diag.progress(1, &format!("ld {}", file_leaf(&out)));
            return Ok(TargetState::Changed);
        }
        return Ok(TargetState::Unchanged);
    }

    let options = cfg.link_options();
    let mut db = DepDb::open(depdb_path(&out))?;
    let mut miss = false;
    miss |= !db.expect(&format!("{}.link 1", lang.var()))?;
    miss |= !db.expect(&cfg.checksum)?;
    miss |= !db.expect(cfg.triplet.as_str())?;
    miss |= !db.expect(&depdb::checksum(options.iter().chain(cfg.libs.iter())))?;
    miss |= !db.expect(&depdb::checksum(&inputs))?;
    db.close()?;

    let tmtime = t.load_mtime();
    let outdated = miss || tmtime == MTIME_NONEXISTENT || prereq_mtime > tmtime;
    if !outdated {
        return Ok(TargetState::Unchanged);
    }

    let mut args: Vec<String> = Vec::new();
    let program: PathBuf;
    match kind {
        LinkKind::Exe => {
            program = cfg.path.clone();
            args.extend(options.clone());
            args.push("-o".to_owned());
            args.push(out.to_string_lossy().into_owned());
            push_inputs(&mut args, &inputs, &whole);
            args.extend(cfg.libs.clone());
        }
        LinkKind::Liba => {
            program = PathBuf::from("ar");
            args.push("rcs".to_owned());
            args.push(out.to_string_lossy().into_owned());
            args.extend(inputs.clone());
        }
        LinkKind::Libs => {
            program = cfg.path.clone();
            args.push("-shared".to_owned());
            args.extend(options.clone());
            if let Some(version) = lookup_string(ctx, t, "version")? {
                let major = version.split('.').next().unwrap_or(&version);
                if cfg.triplet.class() == "linux" {
                    args.push(format!("-Wl,-soname,{}.{major}", file_leaf(&out)));
                }
            }
            args.push("-o".to_owned());
            args.push(out.to_string_lossy().into_owned());
            push_inputs(&mut args, &inputs, &whole);
            args.extend(cfg.libs.clone());
        }
    }

    ctx.diag.progress(1, &format!("ld {}", file_leaf(&out)));

    // Spill long command lines into an argument file where the platform
    // demands it.
    let total: usize = args.iter().map(|a| a.len() + 3).sum::<usize>() + 64;
    let mut cmd = Command::new(&program);
    if total > CMDLINE_LIMIT && cfg.triplet.class() == "windows" {
        let rsp = {
            let mut p = out.as_os_str().to_owned();
            p.push(".rsp");
            PathBuf::from(p)
        };
        let content = args.iter().map(|a| quote_arg(a)).collect::<Vec<_>>().join("\n");
        std::fs::write(&rsp, content)?;
        cmd.arg(format!("@{}", rsp.display()));
    } else {
        cmd.args(&args);
    }
    ctx.diag.progress(2, &render(&cmd));
    run_tool(ctx, &mut cmd).map_err(|e| {
        if e.notes.is_empty() {
            e
        } else {
            e.note(format!("while linking {}", out.display()))
        }
    })?;
    t.set_mtime(target::file_mtime(&out));
    Ok(TargetState::Changed)
}

fn push_inputs(args: &mut Vec<String>, inputs: &[String], whole: &[bool]) {
    for (i, input) in inputs.iter().enumerate() {
        if whole.get(i).copied().unwrap_or(false) {
            args.push("-Wl,--whole-archive".to_owned());
            args.push(input.clone());
            args.push("-Wl,--no-whole-archive".to_owned());
        } else {
            args.push(input.clone());
        }
    }
}

fn quote_arg(a: &str) -> String {
    if a.contains(' ') {
        format!("\"{a}\"")
    } else {
        a.to_owned()
    }
}
