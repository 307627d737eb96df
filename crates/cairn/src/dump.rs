//! The `dump` meta-operation (and directive): render the loaded state —
//! scope variables in ascending order, targets, and their prerequisites
//! — as text or JSON.

use std::sync::Arc;

use serde_json::{Map, Value as Json, json};

use crate::{context::Context, diag, scope::ScopeId};

/// Text dump of one scope.
pub fn dump_scope_text(ctx: &Arc<Context>, scope: ScopeId) -> diag::Result<String> {
    let s = ctx.scopes.get(scope);
    let mut out = String::new();
    out.push_str(&format!("{}\n{{\n", s.out_path));
    {
        let vars = s.vars.read();
        for (name, e) in vars.iter() {
            if name.contains(".__") {
                continue; // synthetic override variables
            }
            out.push_str(&format!("  {name} = {}\n", e.value.display()));
        }
    }
    {
        let tv = s.target_vars.read();
        let tt = ctx.target_types();
        for (typ, entries) in tv.iter() {
            for pe in entries {
                for (name, e) in pe.vars.iter() {
                    out.push_str(&format!(
                        "  {}{{{}}}: {name} = {}\n",
                        tt.get(*typ).name,
                        pe.pattern,
                        e.value.display()
                    ));
                }
            }
        }
    }
    for t in ctx.targets.snapshot() {
        if t.base_scope != scope {
            continue;
        }
        let tt = ctx.target_types();
        let tn = tt.get(t.key.typ).name.clone();
        let core = t.core.read();
        if core.implied && core.prerequisites.is_empty() {
            continue;
        }
        let prereqs: Vec<String> = core
            .prerequisites
            .iter()
            .map(|p| format!("{}{{{}}}", tt.get(p.typ).name, p.name))
            .collect();
        out.push_str(&format!("  {tn}{{{}}}: {}\n", t.key.name, prereqs.join(" ")));
    }
    out.push_str("}\n");
    Ok(out)
}

/// Text dump of every scope, ascending by out directory.
pub fn dump_text(ctx: &Arc<Context>) -> diag::Result<String> {
    let mut scopes = ctx.scopes.snapshot();
    scopes.sort_by(|a, b| a.out_path.cmp(&b.out_path));
    let mut out = String::new();
    for s in scopes {
        out.push_str(&dump_scope_text(ctx, s.id)?);
    }
    Ok(out)
}

/// JSON dump of every scope.
pub fn dump_json(ctx: &Arc<Context>) -> diag::Result<Json> {
    let mut scopes_json = Vec::new();
    let mut scopes = ctx.scopes.snapshot();
    scopes.sort_by(|a, b| a.out_path.cmp(&b.out_path));
    for s in scopes {
        let mut vars = Map::new();
        {
            let v = s.vars.read();
            for (name, e) in v.iter() {
                if name.contains(".__") {
                    continue;
                }
                vars.insert(name.clone(), Json::String(e.value.display()));
            }
        }
        let mut targets = Vec::new();
        for t in ctx.targets.snapshot() {
            if t.base_scope != s.id {
                continue;
            }
            let tt = ctx.target_types();
            let core = t.core.read();
            if core.implied && core.prerequisites.is_empty() {
                continue;
            }
            targets.push(json!({
                "type": tt.get(t.key.typ).name,
                "name": t.key.name,
                "dir": t.key.dir.to_string(),
                "prerequisites": core
                    .prerequisites
                    .iter()
                    .map(|p| json!({
                        "type": tt.get(p.typ).name,
                        "name": p.name,
                    }))
                    .collect::<Vec<_>>(),
            }));
        }
        scopes_json.push(json!({
            "out_path": s.out_path.to_string(),
            "variables": Json::Object(vars),
            "targets": targets,
        }));
    }
    Ok(json!({ "scopes": scopes_json }))
}
