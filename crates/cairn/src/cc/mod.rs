//! The C/C++ toolchain: target types, configuration, and the compile and
//! link rules plumbed into the engine.
//!
//! This is the canonical instance of the rule interface: the compile
//! rule extracts header dependencies dynamically and feeds them into the
//! depdb; the link rule composes object files and libraries, chaining
//! source prerequisites through synthesized object targets.

mod common;
mod compile;
mod link;

use std::sync::Arc;

use crate::{
    context::Context,
    diag::{self, Error},
    operation::{CLEAN, UPDATE},
    scope::ScopeId,
    target::{EXE, FILE, GROUP, TARGET},
    value,
    variable::Visibility,
};

pub use common::{CcConfig, Lang};
pub use compile::CompileRule;
pub use link::LinkRule;

/// Register the binary target types (`obj{}`, `lib{}` and their
/// members) and the group pass-through rules. Idempotent.
pub fn init_bin(ctx: &Arc<Context>, root: ScopeId) -> diag::Result<()> {
    let (obj, bmi, lib, libul) = {
        let mut tt = ctx.target_types_mut();
        // Object file groups and members; member extensions keep the
        // three variants of one source distinct within a directory.
        let obj = tt.insert("obj", Some(GROUP), false, false, None);
        tt.insert("obje", Some(FILE), true, false, Some("o"));
        tt.insert("obja", Some(FILE), true, false, Some("a.o"));
        tt.insert("objs", Some(FILE), true, false, Some("s.o"));
        // Module interfaces.
        let bmi = tt.insert("bmi", Some(GROUP), false, false, None);
        tt.insert("bmie", Some(FILE), true, false, Some("bmi"));
        tt.insert("bmia", Some(FILE), true, false, Some("a.bmi"));
        tt.insert("bmis", Some(FILE), true, false, Some("s.bmi"));
        // Libraries.
        let lib = tt.insert("lib", Some(GROUP), false, false, None);
        tt.insert("liba", Some(FILE), true, false, Some("a"));
        tt.insert("libs", Some(FILE), true, false, Some("so"));
        let libul = tt.insert("libul", Some(TARGET), false, false, None);
        (obj, bmi, lib, libul)
    };

    // Group targets build through the member a dependent selects; on
    // their own they have nothing to do.
    let scope = ctx.scopes.get(root);
    let noop: Arc<dyn crate::rule::Rule> = Arc::new(crate::rule::NoopRule);
    let mut rules = scope.rules.write();
    for op in [UPDATE, CLEAN] {
        for t in [obj, bmi, lib, libul] {
            rules.insert(0, op, t, "", noop.clone());
        }
    }
    Ok(())
}

/// Register a language module: source/header target types, the
/// configuration variables, and the compile/link rules on the project
/// root.
pub fn init_lang(ctx: &Arc<Context>, root: ScopeId, lang: Lang) -> diag::Result<()> {
    init_bin(ctx, root)?;

    {
        let mut tt = ctx.target_types_mut();
        match lang {
            Lang::C => {
                tt.insert("c", Some(FILE), true, false, Some("c"));
                tt.insert("h", Some(FILE), true, false, Some("h"));
            }
            Lang::Cxx => {
                tt.insert("cxx", Some(FILE), true, false, Some("cxx"));
                tt.insert("hxx", Some(FILE), true, false, Some("hxx"));
                tt.insert("ixx", Some(FILE), true, false, Some("ixx"));
                tt.insert("txx", Some(FILE), true, false, Some("txx"));
                tt.insert("mxx", Some(FILE), true, false, Some("mxx"));
            }
        }
    }

    {
        let mut pool = ctx.var_pool_mut();
        let p = lang.var();
        let enter = |pool: &mut crate::variable::VariablePool, name: String| -> diag::Result<()> {
            pool.insert_full(&name, Some(value::STRINGS), Some(Visibility::Project), Some(false))
                .map_err(Error::semantic)?;
            Ok(())
        };
        for ns in [p, "cc"] {
            enter(&mut pool, format!("{ns}.poptions"))?;
            enter(&mut pool, format!("{ns}.coptions"))?;
            enter(&mut pool, format!("{ns}.loptions"))?;
            enter(&mut pool, format!("{ns}.libs"))?;
        }
        pool.insert_full(&format!("{p}.std"), Some(value::STRING), Some(Visibility::Project), Some(false))
            .map_err(Error::semantic)?;
        pool.insert_full("cc.target", Some(value::STRING), Some(Visibility::Project), Some(false))
            .map_err(Error::semantic)?;
    }

    let scope = ctx.scopes.get(root);
    let compile: Arc<dyn crate::rule::Rule> = Arc::new(CompileRule::new(lang));
    let link: Arc<dyn crate::rule::Rule> = Arc::new(LinkRule::new(lang));
    let (obje, obja, objs, bmie, liba, libs) = {
        let tt = ctx.target_types();
        (
            tt.find("obje").expect("bin types registered"),
            tt.find("obja").expect("bin types registered"),
            tt.find("objs").expect("bin types registered"),
            tt.find("bmie").expect("bin types registered"),
            tt.find("liba").expect("bin types registered"),
            tt.find("libs").expect("bin types registered"),
        )
    };
    let mut rules = scope.rules.write();
    for op in [UPDATE, CLEAN] {
        for t in [obje, obja, objs, bmie] {
            rules.insert(0, op, t, lang.var(), compile.clone());
        }
        for t in [EXE, liba, libs] {
            rules.insert(0, op, t, lang.var(), link.clone());
        }
    }
    Ok(())
}
