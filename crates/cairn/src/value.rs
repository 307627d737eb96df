//! The typed value system.
//!
//! A value is either untyped (holding a vector of names, the parser's
//! universal currency) or typed, in which case its data is an instance of
//! one of the registered value types. Untyped values become typed through
//! *typification*: converting the held names via the type's `assign`
//! callback. Reversal goes the other way, back to names, and is what
//! `print` and `dump` render.
//!
//! The registry is a static table: the value-type set is closed (the
//! `define` directive derives *target* types, not value types), so a
//! lazily built static avoids threading a registry through every
//! conversion. Each entry carries function pointers for the
//! operations a type supports; a missing `append`/`prepend` pointer means
//! the type does not support that operation.

use std::{cmp::Ordering, collections::BTreeMap, path::PathBuf, sync::LazyLock};

use smallvec::SmallVec;

use crate::{
    name::{Name, NamePair, Names, ProjectName, display_names},
    path::{DirPath, TargetTriplet},
};

/// Index into the static value-type registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ValueTypeId(u8);

impl ValueTypeId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

pub const BOOL: ValueTypeId = ValueTypeId(0);
pub const UINT64: ValueTypeId = ValueTypeId(1);
pub const STRING: ValueTypeId = ValueTypeId(2);
pub const PATH: ValueTypeId = ValueTypeId(3);
pub const DIR_PATH: ValueTypeId = ValueTypeId(4);
pub const NAME: ValueTypeId = ValueTypeId(5);
pub const NAME_PAIR: ValueTypeId = ValueTypeId(6);
pub const TARGET_TRIPLET: ValueTypeId = ValueTypeId(7);
pub const PROJECT_NAME: ValueTypeId = ValueTypeId(8);
pub const STRINGS: ValueTypeId = ValueTypeId(9);
pub const PATHS: ValueTypeId = ValueTypeId(10);
pub const DIR_PATHS: ValueTypeId = ValueTypeId(11);
pub const UINT64S: ValueTypeId = ValueTypeId(12);
pub const NAMES: ValueTypeId = ValueTypeId(13);
pub const STRING_MAP: ValueTypeId = ValueTypeId(14);
pub const PROJECT_DIR_MAP: ValueTypeId = ValueTypeId(15);

/// Conversion failure; the caller wraps it with the variable name and
/// source location for diagnostics.
pub type ConvertResult<T> = std::result::Result<T, String>;

type AssignFn = Box<dyn Fn(Names) -> ConvertResult<ValueData> + Send + Sync>;
type CombineFn = Box<dyn Fn(&mut ValueData, Names) -> ConvertResult<()> + Send + Sync>;

/// A registered value type.
pub struct ValueType {
    pub name: &'static str,
    /// Base type: a value can be inspected as its base but derived/base
    /// values never assign to each other.
    pub base: Option<ValueTypeId>,
    /// Element type for containers.
    pub element: Option<ValueTypeId>,
    pub assign: AssignFn,
    pub append: Option<CombineFn>,
    pub prepend: Option<CombineFn>,
    /// True if the type can be constructed from empty names.
    pub empty_value: bool,
}

/// Runtime representation of a typed value (plus the untyped `Names` and
/// the null `None` forms).
///
/// NOTE: variant order matters only for derived same-variant comparison;
/// cross-variant comparison never happens because assignment across
/// concrete types is rejected before data is touched.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum ValueData {
    #[default]
    None,
    Names(Names),
    Bool(bool),
    UInt(u64),
    String(String),
    Path(PathBuf),
    Dir(DirPath),
    Name(Name),
    Pair(NamePair),
    Triplet(TargetTriplet),
    Project(ProjectName),
    Vector(Vec<ValueData>),
    Map(BTreeMap<String, ValueData>),
}

static TYPES: LazyLock<Vec<ValueType>> = LazyLock::new(build_registry);

/// The registered type table; indices are the `ValueTypeId` constants.
pub fn types() -> &'static [ValueType] {
    &TYPES
}

pub fn get(id: ValueTypeId) -> &'static ValueType {
    &TYPES[id.index()]
}

/// Look a type up by its buildfile attribute name (`[uint64]`, `[paths]`,
/// `[map<string,string>]`, ...).
pub fn find_type(name: &str) -> Option<ValueTypeId> {
    TYPES.iter().position(|t| t.name == name).map(|i| ValueTypeId(u8::try_from(i).unwrap_or(u8::MAX)))
}

fn build_registry() -> Vec<ValueType> {
    vec![
        ValueType {
            name: "bool",
            base: None,
            element: None,
            assign: Box::new(assign_bool),
            append: Some(Box::new(append_bool)), // OR
            prepend: None,
            empty_value: false,
        },
        ValueType {
            name: "uint64",
            base: None,
            element: None,
            assign: Box::new(assign_uint),
            append: Some(Box::new(append_uint)), // ADD
            prepend: None,
            empty_value: false,
        },
        ValueType {
            name: "string",
            base: None,
            element: None,
            assign: Box::new(assign_string),
            append: Some(Box::new(append_string)),
            prepend: Some(Box::new(prepend_string)),
            empty_value: true,
        },
        ValueType {
            name: "path",
            base: None,
            element: None,
            assign: Box::new(assign_path),
            append: Some(Box::new(append_path)), // combine
            prepend: Some(Box::new(prepend_path)),
            empty_value: true,
        },
        ValueType {
            name: "dir_path",
            base: Some(PATH),
            element: None,
            assign: Box::new(assign_dir),
            append: Some(Box::new(append_dir)),
            prepend: Some(Box::new(prepend_dir)),
            empty_value: true,
        },
        ValueType {
            name: "name",
            base: None,
            element: None,
            assign: Box::new(assign_name),
            append: None,
            prepend: None,
            empty_value: true,
        },
        ValueType {
            name: "name_pair",
            base: None,
            element: None,
            assign: Box::new(assign_pair),
            append: None,
            prepend: None,
            empty_value: true,
        },
        ValueType {
            name: "target_triplet",
            base: None,
            element: None,
            assign: Box::new(assign_triplet),
            append: None,
            prepend: None,
            empty_value: true,
        },
        ValueType {
            name: "project_name",
            base: None,
            element: None,
            assign: Box::new(assign_project),
            append: None,
            prepend: None,
            empty_value: true,
        },
        vector_type("strings", STRING),
        vector_type("paths", PATH),
        vector_type("dir_paths", DIR_PATH),
        vector_type("uint64s", UINT64),
        vector_type("names", NAME),
        map_type("map<string,string>", STRING, STRING),
        map_type("map<project_name,dir_path>", PROJECT_NAME, DIR_PATH),
    ]
}

/// Convert a single name (with an optional pair partner) through the given
/// element type's assign callback.
fn convert_element(t: ValueTypeId, mut n: Name, pair: Option<Name>) -> ConvertResult<ValueData> {
    let mut ns = Names::new();
    match pair {
        Some(second) => {
            n.pair = b'@';
            ns.push(n);
            ns.push(second);
        }
        None => ns.push(n),
    }
    (get(t).assign)(ns)
}

fn convert_vector(element: ValueTypeId, ns: Names, out: &mut Vec<ValueData>) -> ConvertResult<()> {
    let mut it = ns.into_iter();
    while let Some(n) = it.next() {
        let pair = if n.pair != 0 { it.next() } else { None };
        out.push(convert_element(element, n, pair)?);
    }
    Ok(())
}

fn vector_type(name: &'static str, element: ValueTypeId) -> ValueType {
    ValueType {
        name,
        base: None,
        element: Some(element),
        assign: Box::new(move |ns| {
            let mut v = Vec::new();
            convert_vector(element, ns, &mut v)?;
            Ok(ValueData::Vector(v))
        }),
        append: Some(Box::new(move |data, ns| {
            let ValueData::Vector(v) = data else { return Err("vector value expected".to_owned()) };
            convert_vector(element, ns, v)
        })),
        prepend: Some(Box::new(move |data, ns| {
            let ValueData::Vector(v) = data else { return Err("vector value expected".to_owned()) };
            let mut head = Vec::new();
            convert_vector(element, ns, &mut head)?;
            head.append(v);
            *v = head;
            Ok(())
        })),
        empty_value: true,
    }
}

fn convert_map(
    key_t: ValueTypeId,
    val_t: ValueTypeId,
    ns: Names,
    m: &mut BTreeMap<String, ValueData>,
    replace: bool,
) -> ConvertResult<()> {
    let mut it = ns.into_iter();
    while let Some(mut n) = it.next() {
        if n.pair == 0 {
            return Err(format!("expected pair in map value, got '{n}'"));
        }
        n.pair = 0;
        let v = it.next().ok_or_else(|| "dangling pair in map value".to_owned())?;
        let key = match convert_element(key_t, n, None)? {
            ValueData::String(s) => s,
            ValueData::Project(p) => p.as_str().to_owned(),
            other => {
                let mut ns = Names::new();
                reverse_data(&other, &mut ns);
                display_names(&ns)
            }
        };
        let val = convert_element(val_t, v, None)?;
        if replace {
            m.insert(key, val);
        } else {
            m.entry(key).or_insert(val);
        }
    }
    Ok(())
}

fn map_type(name: &'static str, key: ValueTypeId, value: ValueTypeId) -> ValueType {
    ValueType {
        name,
        base: None,
        element: None,
        assign: Box::new(move |ns| {
            let mut m = BTreeMap::new();
            convert_map(key, value, ns, &mut m, true)?;
            Ok(ValueData::Map(m))
        }),
        append: Some(Box::new(move |data, ns| {
            let ValueData::Map(m) = data else { return Err("map value expected".to_owned()) };
            convert_map(key, value, ns, m, true) // RHS wins
        })),
        prepend: Some(Box::new(move |data, ns| {
            let ValueData::Map(m) = data else { return Err("map value expected".to_owned()) };
            convert_map(key, value, ns, m, false) // LHS wins
        })),
        empty_value: true,
    }
}

fn expect_one(mut ns: Names) -> ConvertResult<(Name, Option<Name>)> {
    match ns.len() {
        0 => Err("expected name, got empty value".to_owned()),
        1 => Ok((ns.remove(0), None)),
        2 if ns[0].pair != 0 => {
            let second = ns.remove(1);
            Ok((ns.remove(0), Some(second)))
        }
        _ => Err(format!("expected single name, got '{}'", display_names(&ns))),
    }
}

fn simple_string(n: Name) -> ConvertResult<String> {
    if n.qualified() || n.typed() {
        return Err(format!("name '{n}' is not a valid string"));
    }
    if n.dir.is_empty() {
        Ok(n.value)
    } else if n.value.is_empty() {
        Ok(n.dir.to_string())
    } else {
        Ok(format!("{}{}", n.dir, n.value))
    }
}

fn assign_bool(ns: Names) -> ConvertResult<ValueData> {
    let (n, _) = expect_one(ns)?;
    match n.value.as_str() {
        "true" if n.simple() => Ok(ValueData::Bool(true)),
        "false" if n.simple() => Ok(ValueData::Bool(false)),
        _ => Err(format!("name '{n}' is not a valid bool")),
    }
}

fn append_bool(data: &mut ValueData, ns: Names) -> ConvertResult<()> {
    let ValueData::Bool(old) = data else { return Err("bool value expected".to_owned()) };
    let ValueData::Bool(rhs) = assign_bool(ns)? else { unreachable!() };
    *old = *old || rhs;
    Ok(())
}

fn assign_uint(ns: Names) -> ConvertResult<ValueData> {
    let (n, _) = expect_one(ns)?;
    if !n.simple() {
        return Err(format!("name '{n}' is not a valid uint64"));
    }
    let parsed = if let Some(hex) = n.value.strip_prefix("0x") {
        u64::from_str_radix(hex, 16)
    } else {
        n.value.parse::<u64>()
    };
    parsed.map(ValueData::UInt).map_err(|_| format!("name '{n}' is not a valid uint64"))
}

fn append_uint(data: &mut ValueData, ns: Names) -> ConvertResult<()> {
    let ValueData::UInt(old) = data else { return Err("uint64 value expected".to_owned()) };
    let ValueData::UInt(rhs) = assign_uint(ns)? else { unreachable!() };
    *old = old.wrapping_add(rhs);
    Ok(())
}

fn assign_string(ns: Names) -> ConvertResult<ValueData> {
    if ns.is_empty() {
        return Ok(ValueData::String(String::new()));
    }
    let (n, pair) = expect_one(ns)?;
    if pair.is_some() {
        return Err(format!("pair '{n}@...' is not a valid string"));
    }
    simple_string(n).map(ValueData::String)
}

fn append_string(data: &mut ValueData, ns: Names) -> ConvertResult<()> {
    let ValueData::String(old) = data else { return Err("string value expected".to_owned()) };
    let ValueData::String(rhs) = assign_string(ns)? else { unreachable!() };
    old.push_str(&rhs);
    Ok(())
}

fn prepend_string(data: &mut ValueData, ns: Names) -> ConvertResult<()> {
    let ValueData::String(old) = data else { return Err("string value expected".to_owned()) };
    let ValueData::String(mut rhs) = assign_string(ns)? else { unreachable!() };
    rhs.push_str(old);
    *old = rhs;
    Ok(())
}

fn name_to_path(n: Name) -> ConvertResult<PathBuf> {
    if n.qualified() || n.typed() {
        return Err(format!("name '{n}' is not a valid path"));
    }
    if n.value.is_empty() {
        Ok(n.dir.as_path().to_path_buf())
    } else if n.dir.is_empty() {
        Ok(PathBuf::from(n.value))
    } else {
        Ok(n.dir.join_file(&n.value))
    }
}

fn assign_path(ns: Names) -> ConvertResult<ValueData> {
    if ns.is_empty() {
        return Ok(ValueData::Path(PathBuf::new()));
    }
    let (n, _) = expect_one(ns)?;
    name_to_path(n).map(ValueData::Path)
}

fn append_path(data: &mut ValueData, ns: Names) -> ConvertResult<()> {
    let ValueData::Path(old) = data else { return Err("path value expected".to_owned()) };
    let ValueData::Path(rhs) = assign_path(ns)? else { unreachable!() };
    *old = old.join(rhs);
    Ok(())
}

fn prepend_path(data: &mut ValueData, ns: Names) -> ConvertResult<()> {
    let ValueData::Path(old) = data else { return Err("path value expected".to_owned()) };
    let ValueData::Path(rhs) = assign_path(ns)? else { unreachable!() };
    *old = rhs.join(&*old);
    Ok(())
}

fn assign_dir(ns: Names) -> ConvertResult<ValueData> {
    if ns.is_empty() {
        return Ok(ValueData::Dir(DirPath::current()));
    }
    let (n, _) = expect_one(ns)?;
    if n.qualified() || n.typed() {
        return Err(format!("name '{n}' is not a valid dir_path"));
    }
    if n.value.is_empty() {
        Ok(ValueData::Dir(n.dir))
    } else {
        Ok(ValueData::Dir(n.dir.join(&n.value)))
    }
}

fn append_dir(data: &mut ValueData, ns: Names) -> ConvertResult<()> {
    let ValueData::Dir(old) = data else { return Err("dir_path value expected".to_owned()) };
    let ValueData::Dir(rhs) = assign_dir(ns)? else { unreachable!() };
    *old = old.join(rhs.as_path());
    Ok(())
}

fn prepend_dir(data: &mut ValueData, ns: Names) -> ConvertResult<()> {
    let ValueData::Dir(old) = data else { return Err("dir_path value expected".to_owned()) };
    let ValueData::Dir(rhs) = assign_dir(ns)? else { unreachable!() };
    *old = rhs.join(old.as_path());
    Ok(())
}

fn assign_name(ns: Names) -> ConvertResult<ValueData> {
    if ns.is_empty() {
        return Ok(ValueData::Name(Name::default()));
    }
    let (mut n, pair) = expect_one(ns)?;
    if pair.is_some() {
        return Err(format!("pair '{n}@...' is not a valid name"));
    }
    n.pair = 0;
    Ok(ValueData::Name(n))
}

fn assign_pair(ns: Names) -> ConvertResult<ValueData> {
    if ns.is_empty() {
        return Ok(ValueData::Pair(NamePair::default()));
    }
    let (mut n, pair) = expect_one(ns)?;
    n.pair = 0;
    // A single name can be usage-specifically either half; we store it as
    // the first with an empty second.
    Ok(ValueData::Pair(NamePair { first: n, second: pair.unwrap_or_default() }))
}

fn assign_triplet(ns: Names) -> ConvertResult<ValueData> {
    if ns.is_empty() {
        return Ok(ValueData::Triplet(TargetTriplet::default()));
    }
    let (n, _) = expect_one(ns)?;
    if !n.simple() {
        return Err(format!("name '{n}' is not a valid target triplet"));
    }
    TargetTriplet::parse(&n.value).map(ValueData::Triplet)
}

fn assign_project(ns: Names) -> ConvertResult<ValueData> {
    if ns.is_empty() {
        return Ok(ValueData::Project(ProjectName::default()));
    }
    let (n, _) = expect_one(ns)?;
    if !n.simple() {
        return Err(format!("name '{n}' is not a valid project name"));
    }
    ProjectName::new(n.value).map(ValueData::Project)
}

fn reverse_data(data: &ValueData, out: &mut Names) {
    match data {
        ValueData::None => {}
        ValueData::Names(ns) => out.extend(ns.iter().cloned()),
        ValueData::Bool(b) => out.push(Name::from_value(if *b { "true" } else { "false" })),
        ValueData::UInt(u) => out.push(Name::from_value(u.to_string())),
        ValueData::String(s) => out.push(Name::from_value(s.clone())),
        ValueData::Path(p) => out.push(Name::from_value(p.to_string_lossy().into_owned())),
        ValueData::Dir(d) => out.push(Name::from_dir(d.clone())),
        ValueData::Name(n) => out.push(n.clone()),
        ValueData::Pair(p) => {
            let mut first = p.first.clone();
            first.pair = b'@';
            out.push(first);
            out.push(p.second.clone());
        }
        ValueData::Triplet(t) => out.push(Name::from_value(t.as_str())),
        ValueData::Project(p) => out.push(Name::from_value(p.as_str())),
        ValueData::Vector(v) => {
            for e in v {
                reverse_data(e, out);
            }
        }
        ValueData::Map(m) => {
            for (k, v) in m {
                let mut key = Name::from_value(k.clone());
                key.pair = b'@';
                out.push(key);
                let before = out.len();
                reverse_data(v, out);
                if out.len() == before {
                    out.push(Name::default());
                }
            }
        }
    }
}

fn data_empty(data: &ValueData) -> bool {
    match data {
        ValueData::None => true,
        ValueData::Names(ns) => ns.is_empty(),
        ValueData::Bool(_) | ValueData::UInt(_) => false,
        ValueData::String(s) => s.is_empty(),
        ValueData::Path(p) => p.as_os_str().is_empty(),
        ValueData::Dir(d) => d.is_empty(),
        ValueData::Name(n) => n.empty(),
        ValueData::Pair(p) => p.is_empty(),
        ValueData::Triplet(t) => t.as_str().is_empty(),
        ValueData::Project(p) => p.as_str().is_empty(),
        ValueData::Vector(v) => v.is_empty(),
        ValueData::Map(m) => m.is_empty(),
    }
}

/// Marker bits stored in `Value::extra` by target type/pattern-specific
/// variable assignment. Opaque to everything else.
pub const EXTRA_PREPEND: u16 = 0x1;
pub const EXTRA_APPEND: u16 = 0x2;

/// A value of a variable, function argument, or evaluation result.
#[derive(Debug, Clone, Default)]
pub struct Value {
    /// `None` means not (yet) typed.
    pub typ: Option<ValueTypeId>,
    /// True if there is no value. Distinct from empty: an empty list is
    /// non-null.
    pub null: bool,
    /// Extra flag bits associated with the value; copied on clone but not
    /// reset on assignment.
    pub extra: u16,
    pub data: ValueData,
}

impl Value {
    /// An untyped NULL value.
    pub fn null_value() -> Self {
        Self { typ: None, null: true, extra: 0, data: ValueData::None }
    }

    /// A typed NULL value.
    pub fn null_typed(t: ValueTypeId) -> Self {
        Self { typ: Some(t), null: true, extra: 0, data: ValueData::None }
    }

    /// An untyped value holding names.
    pub fn from_names(ns: Names) -> Self {
        Self { typ: None, null: false, extra: 0, data: ValueData::Names(ns) }
    }

    pub fn from_bool(b: bool) -> Self {
        Self { typ: Some(BOOL), null: false, extra: 0, data: ValueData::Bool(b) }
    }

    pub fn from_uint(u: u64) -> Self {
        Self { typ: Some(UINT64), null: false, extra: 0, data: ValueData::UInt(u) }
    }

    pub fn from_string(s: impl Into<String>) -> Self {
        Self { typ: Some(STRING), null: false, extra: 0, data: ValueData::String(s.into()) }
    }

    pub fn from_dir(d: DirPath) -> Self {
        Self { typ: Some(DIR_PATH), null: false, extra: 0, data: ValueData::Dir(d) }
    }

    pub fn from_path(p: PathBuf) -> Self {
        Self { typ: Some(PATH), null: false, extra: 0, data: ValueData::Path(p) }
    }

    pub fn from_strings(v: Vec<String>) -> Self {
        Self {
            typ: Some(STRINGS),
            null: false,
            extra: 0,
            data: ValueData::Vector(v.into_iter().map(ValueData::String).collect()),
        }
    }

    pub fn is_null(&self) -> bool {
        self.null
    }

    /// Type-independent emptiness; a NULL value reports empty.
    pub fn empty(&self) -> bool {
        self.null || data_empty(&self.data)
    }

    /// Assign raw names. If the value (or the requested type) is typed the
    /// names are converted; otherwise they are stored as-is. `extra` is
    /// preserved.
    pub fn assign(&mut self, ns: Names, typ: Option<ValueTypeId>) -> ConvertResult<()> {
        let t = typ.or(self.typ);
        match t {
            Some(t) => {
                let vt = get(t);
                if ns.is_empty() && !vt.empty_value {
                    return Err(format!("empty value in {} assignment", vt.name));
                }
                self.data = (vt.assign)(ns)?;
                self.typ = Some(t);
            }
            None => {
                self.data = ValueData::Names(ns);
            }
        }
        self.null = false;
        Ok(())
    }

    /// Append raw names. An untyped NULL value adopts the requested type;
    /// an untyped non-NULL value extends its name vector.
    pub fn append(&mut self, ns: Names, typ: Option<ValueTypeId>) -> ConvertResult<()> {
        if self.null {
            return self.assign(ns, typ.or(self.typ));
        }
        match self.typ {
            None => {
                if let Some(t) = typ {
                    // Retype the accumulated names first, then append.
                    let old = std::mem::take(&mut self.data);
                    let ValueData::Names(old_ns) = old else { return Err("untyped value expected".to_owned()) };
                    self.assign(old_ns, Some(t))?;
                    return self.append(ns, Some(t));
                }
                let ValueData::Names(v) = &mut self.data else { return Err("untyped value expected".to_owned()) };
                v.extend(ns);
                Ok(())
            }
            Some(t) => {
                if let Some(rt) = typ {
                    if rt != t {
                        return Err(format!(
                            "append of {} value to {} value",
                            get(rt).name,
                            get(t).name
                        ));
                    }
                }
                let vt = get(t);
                let append = vt.append.as_ref().ok_or_else(|| format!("type {} does not support append", vt.name))?;
                append(&mut self.data, ns)
            }
        }
    }

    /// Prepend raw names, mirroring `append`.
    pub fn prepend(&mut self, ns: Names, typ: Option<ValueTypeId>) -> ConvertResult<()> {
        if self.null {
            return self.assign(ns, typ.or(self.typ));
        }
        match self.typ {
            None => {
                if let Some(t) = typ {
                    let old = std::mem::take(&mut self.data);
                    let ValueData::Names(old_ns) = old else { return Err("untyped value expected".to_owned()) };
                    self.assign(old_ns, Some(t))?;
                    return self.prepend(ns, Some(t));
                }
                let ValueData::Names(v) = &mut self.data else { return Err("untyped value expected".to_owned()) };
                let mut head = ns;
                head.append(v);
                *v = head;
                Ok(())
            }
            Some(t) => {
                if let Some(rt) = typ {
                    if rt != t {
                        return Err(format!(
                            "prepend of {} value to {} value",
                            get(rt).name,
                            get(t).name
                        ));
                    }
                }
                let vt = get(t);
                let prepend = vt.prepend.as_ref().ok_or_else(|| format!("type {} does not support prepend", vt.name))?;
                prepend(&mut self.data, ns)
            }
        }
    }

    /// Give an untyped value a type by converting its names. A no-op when
    /// the value already has the requested type; a different concrete type
    /// is an error.
    pub fn typify(&mut self, t: ValueTypeId) -> ConvertResult<()> {
        match self.typ {
            Some(cur) if cur == t => Ok(()),
            Some(cur) => Err(format!("value type is {}, requested {}", get(cur).name, get(t).name)),
            None => {
                if self.null {
                    self.typ = Some(t);
                    return Ok(());
                }
                let old = std::mem::replace(&mut self.data, ValueData::None);
                let ValueData::Names(ns) = old else { return Err("untyped value expected".to_owned()) };
                self.data = (get(t).assign)(ns)?;
                self.typ = Some(t);
                Ok(())
            }
        }
    }

    /// Remove the type, reversing the data back to names.
    pub fn untypify(&mut self) {
        if self.typ.is_some() && !self.null {
            let mut ns = Names::new();
            reverse_data(&self.data, &mut ns);
            self.data = ValueData::Names(ns);
        }
        self.typ = None;
    }

    /// Reverse to names. A NULL value reverses to no names.
    pub fn reverse(&self) -> Names {
        let mut ns = Names::new();
        if !self.null {
            reverse_data(&self.data, &mut ns);
        }
        ns
    }

    /// Compare, with the documented NULL ordering: NULL values compare
    /// equal among themselves and less than any non-NULL value.
    pub fn compare(&self, other: &Self) -> Ordering {
        match (self.null, other.null) {
            (true, true) => Ordering::Equal,
            (true, false) => Ordering::Less,
            (false, true) => Ordering::Greater,
            (false, false) => self.data.cmp(&other.data),
        }
    }

    /// The `print` rendering: `[null]` for NULL, otherwise the reversed
    /// names.
    pub fn display(&self) -> String {
        if self.null {
            "[null]".to_owned()
        } else {
            display_names(&self.reverse())
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match &self.data {
            ValueData::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_uint(&self) -> Option<u64> {
        match &self.data {
            ValueData::UInt(u) => Some(*u),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match &self.data {
            ValueData::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_dir(&self) -> Option<&DirPath> {
        match &self.data {
            ValueData::Dir(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_path(&self) -> Option<&std::path::Path> {
        match &self.data {
            ValueData::Path(p) => Some(p),
            ValueData::Dir(d) => Some(d.as_path()),
            _ => None,
        }
    }

    pub fn as_names(&self) -> Option<&Names> {
        match &self.data {
            ValueData::Names(ns) => Some(ns),
            _ => None,
        }
    }

    pub fn as_triplet(&self) -> Option<&TargetTriplet> {
        match &self.data {
            ValueData::Triplet(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_project(&self) -> Option<&ProjectName> {
        match &self.data {
            ValueData::Project(p) => Some(p),
            _ => None,
        }
    }

    /// Strings-vector view; elements that are not strings render through
    /// their natural representation.
    pub fn as_strings(&self) -> Option<Vec<String>> {
        match &self.data {
            ValueData::Vector(v) => Some(
                v.iter()
                    .map(|e| match e {
                        ValueData::String(s) => s.clone(),
                        ValueData::Dir(d) => d.to_string(),
                        other => {
                            let mut ns = Names::new();
                            reverse_data(other, &mut ns);
                            display_names(&ns)
                        }
                    })
                    .collect(),
            ),
            _ => None,
        }
    }

    /// Convert to `bool`, accepting an untyped value holding a bool name.
    /// Used by `if`/`assert` conditions.
    pub fn to_bool(&self) -> ConvertResult<bool> {
        if self.null {
            return Err("null value in boolean context".to_owned());
        }
        match &self.data {
            ValueData::Bool(b) => Ok(*b),
            ValueData::Names(_) => {
                let mut v = self.clone();
                v.typify(BOOL)?;
                Ok(v.as_bool().unwrap_or(false))
            }
            _ => Err(format!("{} value in boolean context", self.type_name())),
        }
    }

    pub fn type_name(&self) -> &'static str {
        self.typ.map_or("<untyped>", |t| get(t).name)
    }

    /// A typed clone: typifies untyped values, verifies typed ones.
    pub fn coerce(&self, t: ValueTypeId) -> ConvertResult<Self> {
        let mut v = self.clone();
        v.typify(t)?;
        Ok(v)
    }
}

/// A value pack: the arguments of a buildfile function call. Usually one.
pub type Values = SmallVec<[Value; 1]>;
