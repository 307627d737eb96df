//! Build system modules loaded with the `using` directive.
//!
//! Modules are built in: `config` (configuration persistence, implicit),
//! `bin` (binary target types), and the `c`/`cxx` language modules that
//! layer on the shared cc core. Loading is idempotent per project root.

use std::sync::Arc;

use crate::{
    cc,
    context::Context,
    diag::{self, Error, Location},
    scope::ScopeId,
};

/// Load a named module into the project rooted at `root`. Returns false
/// when an optional (`using?`) module is unknown.
pub fn load(
    ctx: &Arc<Context>,
    root: ScopeId,
    _base: ScopeId,
    name: &str,
    optional: bool,
    loc: &Location,
) -> diag::Result<bool> {
    let scope = ctx.scopes.get(root);
    let extra = scope
        .root_extra()
        .ok_or_else(|| Error::semantic("'using' outside a project").at(loc.clone()))?;

    {
        let data = extra.data.read();
        if optional && !data.bootstrapped {
            return Err(Error::semantic(format!(
                "optional module '{name}' loaded during bootstrap"
            ))
            .at(loc.clone()));
        }
        if data.modules.iter().any(|m| m == name) {
            return Ok(true);
        }
    }

    let known = match name {
        // Configuration persistence is wired into bootstrap; loading the
        // module only records the intent.
        "config" => true,
        "bin" => {
            cc::init_bin(ctx, root)?;
            true
        }
        "c" => {
            cc::init_lang(ctx, root, cc::Lang::C)?;
            true
        }
        "cxx" => {
            cc::init_lang(ctx, root, cc::Lang::Cxx)?;
            true
        }
        "cc" => {
            cc::init_bin(ctx, root)?;
            cc::init_lang(ctx, root, cc::Lang::C)?;
            cc::init_lang(ctx, root, cc::Lang::Cxx)?;
            true
        }
        _ => false,
    };

    if !known {
        if optional {
            return Ok(false);
        }
        return Err(Error::lookup(format!("unknown module '{name}'"))
            .at(loc.clone())
            .note("known modules: config, bin, c, cxx, cc"));
    }

    extra.data.write().modules.push(name.to_owned());
    Ok(true)
}
