//! Shared compiler configuration for the compile and link rules.

use std::{path::PathBuf, sync::Arc};

use crate::{
    context::Context,
    depdb,
    diag::{self, Error},
    path::TargetTriplet,
    target::Target,
};

/// The language axis of the cc rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lang {
    C,
    Cxx,
}

impl Lang {
    /// Diagnostic name (`c`, `c++`).
    pub fn name(self) -> &'static str {
        match self {
            Self::C => "c",
            Self::Cxx => "c++",
        }
    }

    /// Variable namespace prefix (`c`, `cxx`).
    pub fn var(self) -> &'static str {
        match self {
            Self::C => "c",
            Self::Cxx => "cxx",
        }
    }

    pub fn default_compiler(self) -> &'static str {
        match self {
            Self::C => "cc",
            Self::Cxx => "c++",
        }
    }

    /// The source target type of this language.
    pub fn src_type(self) -> &'static str {
        match self {
            Self::C => "c",
            Self::Cxx => "cxx",
        }
    }

    pub fn module_type(self) -> Option<&'static str> {
        match self {
            Self::C => None,
            Self::Cxx => Some("mxx"),
        }
    }
}

/// Environment variables that participate in compiler identity: a change
/// to any of these invalidates compiled output via the depdb checksum.
const IDENTITY_ENV: &[&str] = &[
    "CPATH",
    "C_INCLUDE_PATH",
    "CPLUS_INCLUDE_PATH",
    "OBJC_INCLUDE_PATH",
    "LIBRARY_PATH",
    "INCLUDE",
    "LIB",
    "SDKROOT",
    "MACOSX_DEPLOYMENT_TARGET",
];

/// Resolved compiler configuration for one (target, language) pair.
pub struct CcConfig {
    pub path: PathBuf,
    /// Identity of the compiler: path, mtime, and the identity
    /// environment.
    pub checksum: String,
    pub triplet: TargetTriplet,
    pub poptions: Vec<String>,
    pub coptions: Vec<String>,
    pub loptions: Vec<String>,
    pub libs: Vec<String>,
    pub std: Option<String>,
}

impl CcConfig {
    pub fn load(ctx: &Arc<Context>, t: &Arc<Target>, lang: Lang) -> diag::Result<Self> {
        let p = lang.var();

        let compiler = lookup_string(ctx, t, &format!("config.{p}"))?
            .unwrap_or_else(|| lang.default_compiler().to_owned());
        let path = resolve_compiler(&compiler)
            .ok_or_else(|| Error::lookup(format!("compiler '{compiler}' not found in PATH")))?;

        let mut id: Vec<String> = vec![
            path.to_string_lossy().into_owned(),
            crate::target::file_mtime(&path).to_string(),
        ];
        for e in IDENTITY_ENV {
            if let Ok(v) = std::env::var(e) {
                id.push(format!("{e}={v}"));
            }
        }
        let checksum = depdb::checksum(&id);

        let triplet = match lookup_string(ctx, t, "cc.target")? {
            Some(s) => TargetTriplet::parse(&s).map_err(Error::semantic)?,
            None => TargetTriplet::host(),
        };

        let mut poptions = lookup_strings(ctx, t, "cc.poptions")?;
        poptions.extend(lookup_strings(ctx, t, &format!("{p}.poptions"))?);
        let mut coptions = lookup_strings(ctx, t, "cc.coptions")?;
        coptions.extend(lookup_strings(ctx, t, &format!("{p}.coptions"))?);
        let mut loptions = lookup_strings(ctx, t, "cc.loptions")?;
        loptions.extend(lookup_strings(ctx, t, &format!("{p}.loptions"))?);
        let mut libs = lookup_strings(ctx, t, "cc.libs")?;
        libs.extend(lookup_strings(ctx, t, &format!("{p}.libs"))?);
        let std = lookup_string(ctx, t, &format!("{p}.std"))?;

        Ok(Self { path, checksum, triplet, poptions, coptions, loptions, libs, std })
    }

    /// The compile-phase options in command-line order.
    pub fn compile_options(&self) -> Vec<String> {
        let mut r = Vec::new();
        if let Some(std) = &self.std {
            r.push(format!("-std={std}"));
        }
        r.extend(self.poptions.iter().cloned());
        r.extend(self.coptions.iter().cloned());
        r
    }

    /// The link-phase options (libraries excluded; those go last).
    pub fn link_options(&self) -> Vec<String> {
        self.loptions.clone()
    }
}

fn resolve_compiler(name: &str) -> Option<PathBuf> {
    let p = PathBuf::from(name);
    if p.is_absolute() {
        return p.is_file().then_some(p);
    }
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|d| d.join(name))
        .find(|c| c.is_file())
}

/// A variable's value on the target (through the full lookup walk) as a
/// vector of strings.
pub fn lookup_strings(ctx: &Arc<Context>, t: &Arc<Target>, name: &str) -> diag::Result<Vec<String>> {
    let var = {
        let pool = ctx.var_pool();
        pool.find(name)
    };
    let Some(var) = var else { return Ok(Vec::new()) };
    let l = t.find_var(ctx, var)?;
    let Some(v) = l.value_ref() else { return Ok(Vec::new()) };
    if let Some(s) = v.as_strings() {
        return Ok(s);
    }
    Ok(v.reverse().iter().map(ToString::to_string).collect())
}

pub fn lookup_string(ctx: &Arc<Context>, t: &Arc<Target>, name: &str) -> diag::Result<Option<String>> {
    let var = {
        let pool = ctx.var_pool();
        pool.find(name)
    };
    let Some(var) = var else { return Ok(None) };
    let l = t.find_var(ctx, var)?;
    let Some(v) = l.value_ref() else { return Ok(None) };
    if let Some(s) = v.as_str() {
        return Ok(Some(s.to_owned()));
    }
    Ok(Some(v.display()))
}
