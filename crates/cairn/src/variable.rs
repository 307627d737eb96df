//! Variables: the interned pool, patterns, overrides, and the map.
//!
//! Variables are interned once per context and referred to by `VariableId`
//! everywhere else. Insertion is idempotent and *tightening*: later
//! insertions may narrow visibility and supply a type where there was
//! none, but never disagree with an established type or relax
//! overridability.
//!
//! Command-line overrides are synthetic variables whose names encode the
//! original variable, the override's command-line position, and the
//! operator (`__override`, `__prefix`, `__suffix`). Their values stay
//! untyped until applied at lookup time.

use std::fmt;

use ahash::AHashMap;
use strum::{Display, EnumString};

use crate::{
    name::Names,
    value::{Value, ValueTypeId},
};

/// Index into the context's variable pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VariableId(u32);

impl VariableId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Where a variable's value may be set. The order is from least to most
/// restrictive; insertion may move down the list but never up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum Visibility {
    /// All outer scopes.
    Global,
    /// This project, no outer projects.
    Project,
    /// This scope only.
    Scope,
    /// Target and target type/pattern-specific.
    Target,
    /// Prerequisite-specific.
    Prereq,
}

/// The override operator encoded in a synthetic override variable's name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverrideKind {
    Assign,
    Prepend,
    Append,
}

impl OverrideKind {
    pub fn suffix(self) -> &'static str {
        match self {
            Self::Assign => "__override",
            Self::Prepend => "__prefix",
            Self::Append => "__suffix",
        }
    }
}

/// An interned variable. Two variables are the same iff their names match,
/// which the pool guarantees by construction.
#[derive(Debug, Clone)]
pub struct Variable {
    pub name: String,
    /// Other pool entries this variable is an alias of (the circular ring
    /// materialized as a set of ids; empty for most variables).
    pub aliases: Vec<VariableId>,
    pub typ: Option<ValueTypeId>,
    pub visibility: Visibility,
    pub overridable: bool,
    /// Synthetic override variables, in command-line order.
    pub overrides: Vec<VariableId>,
    /// For a synthetic override: the original variable, the command-line
    /// position, and the operator.
    pub override_info: Option<(VariableId, u32, OverrideKind)>,
}

impl Variable {
    pub fn is_override(&self) -> bool {
        self.override_info.is_some()
    }
}

impl fmt::Display for Variable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// A visibility/type/overridability default applied to matching variable
/// names at insertion time.
#[derive(Debug, Clone)]
pub struct Pattern {
    pub prefix: String,
    pub suffix: String,
    /// `**`: match multi-component stems too.
    pub multi: bool,
    /// If true, individual insertions of a matching variable must agree
    /// with the pattern; if false the pattern is a fallback.
    pub match_required: bool,
    pub typ: Option<ValueTypeId>,
    pub visibility: Option<Visibility>,
    pub overridable: Option<bool>,
    /// Insertion sequence number; later patterns win specificity ties.
    seq: u32,
}

impl Pattern {
    /// Specificity: larger prefix+suffix first, then `*` over `**`, then
    /// reverse insertion order.
    fn specificity(&self) -> (usize, bool, u32) {
        (self.prefix.len() + self.suffix.len(), !self.multi, self.seq)
    }

    fn matches(&self, name: &str) -> bool {
        // Only multi-component variable names are considered.
        if !name.contains('.') {
            return false;
        }
        let stem = match (self.prefix.as_str(), self.suffix.as_str()) {
            ("", "") => Some(name),
            (p, "") => name.strip_prefix(p).and_then(|r| r.strip_prefix('.')),
            ("", s) => name.strip_suffix(s).and_then(|r| r.strip_suffix('.')),
            (p, s) => name
                .strip_prefix(p)
                .and_then(|r| r.strip_prefix('.'))
                .and_then(|r| r.strip_suffix(s))
                .and_then(|r| r.strip_suffix('.')),
        };
        match stem {
            Some(stem) => !stem.is_empty() && (self.multi || !stem.contains('.')),
            None => false,
        }
    }
}

/// The interned variable pool. Mutated only during the load phase.
#[derive(Default)]
pub struct VariablePool {
    vars: Vec<Variable>,
    index: AHashMap<String, VariableId>,
    patterns: Vec<Pattern>,
    pattern_seq: u32,
}

impl VariablePool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: VariableId) -> &Variable {
        &self.vars[id.index()]
    }

    pub fn find(&self, name: &str) -> Option<VariableId> {
        self.index.get(name).copied()
    }

    /// Find existing or insert new with the defaults (untyped,
    /// non-overridable, project visibility), letting patterns override the
    /// defaults.
    pub fn insert(&mut self, name: &str) -> VariableId {
        self.insert_full(name, None, None, None)
            .unwrap_or_else(|_| self.index[name])
    }

    /// Find existing or insert, tightening. Errors on a type conflict, a
    /// visibility widening, an overridability relaxation, or a
    /// match-required pattern disagreement.
    pub fn insert_full(
        &mut self,
        name: &str,
        typ: Option<ValueTypeId>,
        visibility: Option<Visibility>,
        overridable: Option<bool>,
    ) -> Result<VariableId, String> {
        if let Some(&id) = self.index.get(name) {
            self.update(id, typ, visibility, overridable)?;
            return Ok(id);
        }

        // Apply the most specific matching pattern for unspecified
        // properties; a match-required pattern also constrains specified
        // ones.
        let (mut typ, mut vis, mut ovr) = (typ, visibility, overridable);
        if let Some(p) = self.best_pattern(name) {
            if p.match_required {
                if let (Some(t), Some(pt)) = (typ, p.typ) {
                    if t != pt {
                        return Err(format!(
                            "variable '{name}' type conflicts with pattern requirement"
                        ));
                    }
                }
            }
            typ = typ.or(p.typ);
            vis = vis.or(p.visibility);
            ovr = ovr.or(p.overridable);
        }

        let id = VariableId(u32::try_from(self.vars.len()).unwrap_or(u32::MAX));
        self.vars.push(Variable {
            name: name.to_owned(),
            aliases: Vec::new(),
            typ,
            visibility: vis.unwrap_or(Visibility::Project),
            overridable: ovr.unwrap_or(false),
            overrides: Vec::new(),
            override_info: None,
        });
        self.index.insert(name.to_owned(), id);
        Ok(id)
    }

    fn update(
        &mut self,
        id: VariableId,
        typ: Option<ValueTypeId>,
        visibility: Option<Visibility>,
        overridable: Option<bool>,
    ) -> Result<(), String> {
        let var = &mut self.vars[id.index()];
        if let Some(t) = typ {
            match var.typ {
                None => var.typ = Some(t),
                Some(cur) if cur == t => {}
                Some(cur) => {
                    return Err(format!(
                        "variable '{}' type mismatch: {} vs {}",
                        var.name,
                        crate::value::get(cur).name,
                        crate::value::get(t).name
                    ));
                }
            }
        }
        if let Some(v) = visibility {
            if v < var.visibility {
                return Err(format!(
                    "variable '{}' visibility cannot be relaxed from {} to {v}",
                    var.name, var.visibility
                ));
            }
            var.visibility = v;
        }
        if let Some(o) = overridable {
            if o && !var.overridable {
                return Err(format!("variable '{}' cannot become overridable", var.name));
            }
            var.overridable = o;
        }
        Ok(())
    }

    /// Alias an existing variable under a new name. The alias copies the
    /// final type and visibility; overridable aliased variables are
    /// rejected (overrides would not apply across alias names).
    pub fn insert_alias(&mut self, of: VariableId, name: &str) -> Result<VariableId, String> {
        if self.vars[of.index()].overridable {
            return Err(format!(
                "cannot alias overridable variable '{}'",
                self.vars[of.index()].name
            ));
        }
        if let Some(&existing) = self.index.get(name) {
            if self.vars[existing.index()].aliases.contains(&of) {
                return Ok(existing);
            }
            return Err(format!("variable '{name}' already exists, cannot alias"));
        }
        let (typ, vis) = {
            let v = &self.vars[of.index()];
            (v.typ, v.visibility)
        };
        let id = VariableId(u32::try_from(self.vars.len()).unwrap_or(u32::MAX));
        self.vars.push(Variable {
            name: name.to_owned(),
            aliases: Vec::new(),
            typ,
            visibility: vis,
            overridable: false,
            overrides: Vec::new(),
            override_info: None,
        });
        self.index.insert(name.to_owned(), id);

        // Link every ring member to every other so alias lookup is a small
        // linear scan regardless of entry point.
        let mut ring = self.vars[of.index()].aliases.clone();
        ring.push(of);
        for &m in &ring {
            self.vars[m.index()].aliases.push(id);
        }
        self.vars[id.index()].aliases = ring;
        Ok(id)
    }

    /// Insert a variable pattern (`[<prefix>.](*|**)[.<suffix>]`). With
    /// `retro`, apply it to existing matching variables unless a more
    /// specific pattern already covers them.
    pub fn insert_pattern(
        &mut self,
        pattern: &str,
        typ: Option<ValueTypeId>,
        visibility: Option<Visibility>,
        overridable: Option<bool>,
        retro: bool,
        match_required: bool,
    ) -> Result<(), String> {
        let (prefix, rest) = match pattern.find('*') {
            Some(i) => (&pattern[..i], &pattern[i..]),
            None => return Err(format!("invalid variable pattern '{pattern}'")),
        };
        let multi = rest.starts_with("**");
        let suffix = rest.trim_start_matches('*');
        let prefix = prefix.strip_suffix('.').map(str::to_owned).unwrap_or_else(|| {
            if prefix.is_empty() { String::new() } else { prefix.to_owned() }
        });
        let suffix = suffix.strip_prefix('.').unwrap_or(suffix).to_owned();

        let p = Pattern {
            prefix,
            suffix,
            multi,
            match_required,
            typ,
            visibility,
            overridable,
            seq: self.pattern_seq,
        };
        self.pattern_seq += 1;

        if retro {
            let spec = p.specificity();
            for i in 0..self.vars.len() {
                let name = self.vars[i].name.clone();
                if !p.matches(&name) {
                    continue;
                }
                let covered = self
                    .patterns
                    .iter()
                    .any(|q| q.matches(&name) && q.specificity() > spec);
                if !covered {
                    let id = VariableId(u32::try_from(i).unwrap_or(u32::MAX));
                    self.update(id, p.typ, p.visibility, p.overridable)?;
                }
            }
        }

        self.patterns.push(p);
        Ok(())
    }

    fn best_pattern(&self, name: &str) -> Option<&Pattern> {
        self.patterns
            .iter()
            .filter(|p| p.matches(name))
            .max_by_key(|p| p.specificity())
    }

    /// Enter a synthetic override variable for `base` and record it on the
    /// original, in command-line order.
    pub fn insert_override(
        &mut self,
        base: VariableId,
        position: u32,
        kind: OverrideKind,
    ) -> VariableId {
        let name = format!("{}.{}.{}", self.vars[base.index()].name, position, kind.suffix());
        if let Some(&id) = self.index.get(&name) {
            return id;
        }
        let visibility = self.vars[base.index()].visibility;
        let id = VariableId(u32::try_from(self.vars.len()).unwrap_or(u32::MAX));
        self.vars.push(Variable {
            name: name.clone(),
            aliases: Vec::new(),
            typ: None, // overrides stay untyped until applied
            visibility,
            overridable: false,
            overrides: Vec::new(),
            override_info: Some((base, position, kind)),
        });
        self.index.insert(name, id);
        self.vars[base.index()].overrides.push(id);
        id
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }
}

/// One entry of a variable map.
#[derive(Debug, Clone)]
pub struct VarEntry {
    pub var: VariableId,
    pub value: Value,
    /// Incremented on every direct modification; the caches key their
    /// invalidation off this.
    pub version: u64,
}

impl VarEntry {
    /// Mutable access that bumps the version.
    pub fn modify(&mut self) -> &mut Value {
        self.version += 1;
        &mut self.value
    }
}

/// A name-ordered variable-to-value map with per-entry versions.
///
/// Ascending iteration order is guaranteed (predictable dump output);
/// namespace queries return the sub-range sharing a dotted prefix.
#[derive(Debug, Clone, Default)]
pub struct VariableMap {
    map: std::collections::BTreeMap<String, VarEntry>,
}

impl VariableMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Direct lookup, probing aliases; returns the entry together with the
    /// storage variable that physically holds the value.
    pub fn lookup(&self, pool: &VariablePool, var: VariableId) -> Option<(&VarEntry, VariableId)> {
        let v = pool.get(var);
        if let Some(e) = self.map.get(&v.name) {
            return Some((e, var));
        }
        for &alias in &v.aliases {
            if let Some(e) = self.map.get(&pool.get(alias).name) {
                return Some((e, alias));
            }
        }
        None
    }

    pub fn lookup_name(&self, name: &str) -> Option<&VarEntry> {
        self.map.get(name)
    }

    /// Return a value suitable for assignment, inserting a NULL one (typed
    /// if the variable is) when not yet set. The caller mutates through
    /// [`VarEntry::modify`].
    pub fn assign(&mut self, pool: &VariablePool, var: VariableId) -> &mut VarEntry {
        let v = pool.get(var);
        self.map.entry(v.name.clone()).or_insert_with(|| VarEntry {
            var,
            value: match v.typ {
                Some(t) => Value::null_typed(t),
                None => Value::null_value(),
            },
            version: 0,
        })
    }

    /// Insert, reporting whether a new (NULL) entry was created.
    pub fn insert(&mut self, pool: &VariablePool, var: VariableId) -> (&mut VarEntry, bool) {
        let v = pool.get(var);
        let mut inserted = false;
        let e = self.map.entry(v.name.clone()).or_insert_with(|| {
            inserted = true;
            VarEntry {
                var,
                value: match v.typ {
                    Some(t) => Value::null_typed(t),
                    None => Value::null_value(),
                },
                version: 0,
            }
        });
        (e, inserted)
    }

    /// Assign an already-built value directly.
    pub fn set(&mut self, pool: &VariablePool, var: VariableId, value: Value) {
        let e = self.assign(pool, var);
        *e.modify() = value;
    }

    /// Assign names, converting through the variable's type if any.
    pub fn set_names(
        &mut self,
        pool: &VariablePool,
        var: VariableId,
        ns: Names,
    ) -> Result<(), String> {
        let typ = pool.get(var).typ;
        let e = self.assign(pool, var);
        e.modify().assign(ns, typ)
    }

    /// The entries whose names start with `<ns>.`, ascending.
    pub fn namespace<'a>(&'a self, ns: &str) -> impl Iterator<Item = (&'a String, &'a VarEntry)> {
        let lo = format!("{ns}.");
        let hi = format!("{ns}/"); // '/' is the char after '.' in ASCII
        self.map.range(lo..hi)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &VarEntry)> {
        self.map.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }
}
