//! Builtin buildfile functions, callable as `$f(args)`.
//!
//! Functions receive a value pack (one value per comma-separated
//! argument) and return a value. The registry is keyed by the (optionally
//! dotted-qualified) function name.

use ahash::AHashMap;

use crate::{
    context::Context,
    diag::{self, Error, Location},
    name::Name,
    path::DirPath,
    value::{Value, Values},
};

pub type FunctionImpl = fn(&Context, &Location, Values) -> diag::Result<Value>;

pub struct FunctionMap {
    map: AHashMap<&'static str, FunctionImpl>,
}

impl FunctionMap {
    pub fn with_builtins() -> Self {
        let mut map: AHashMap<&'static str, FunctionImpl> = AHashMap::new();
        map.insert("type", fn_type);
        map.insert("null", fn_null);
        map.insert("empty", fn_empty);
        map.insert("string", fn_string);
        map.insert("identity", fn_identity);
        map.insert("quote", fn_quote);
        map.insert("path.directory", fn_path_directory);
        map.insert("path.leaf", fn_path_leaf);
        map.insert("path.base", fn_path_base);
        map.insert("name.name", fn_name_name);
        map.insert("name.extension", fn_name_extension);
        Self { map }
    }

    pub fn find(&self, name: &str) -> Option<FunctionImpl> {
        self.map.get(name).copied()
    }

    pub fn call(
        &self,
        ctx: &Context,
        name: &str,
        loc: &Location,
        args: Values,
    ) -> diag::Result<Value> {
        match self.find(name) {
            Some(f) => f(ctx, loc, args),
            None => Err(Error::parse(loc.clone(), format!("unknown function '{name}'"))),
        }
    }
}

fn one(loc: &Location, name: &str, mut args: Values) -> diag::Result<Value> {
    if args.len() != 1 {
        return Err(Error::parse(
            loc.clone(),
            format!("function '{name}' expects one argument, got {}", args.len()),
        ));
    }
    Ok(args.remove(0))
}

fn fn_type(_ctx: &Context, loc: &Location, args: Values) -> diag::Result<Value> {
    let v = one(loc, "type", args)?;
    let n = if v.typ.is_some() { v.type_name() } else { "" };
    Ok(Value::from_string(n))
}

fn fn_null(_ctx: &Context, loc: &Location, args: Values) -> diag::Result<Value> {
    let v = one(loc, "null", args)?;
    Ok(Value::from_bool(v.null))
}

fn fn_empty(_ctx: &Context, loc: &Location, args: Values) -> diag::Result<Value> {
    let v = one(loc, "empty", args)?;
    Ok(Value::from_bool(v.empty()))
}

fn fn_string(_ctx: &Context, loc: &Location, args: Values) -> diag::Result<Value> {
    let v = one(loc, "string", args)?;
    if v.null {
        return Err(Error::parse(loc.clone(), "null value passed to string()"));
    }
    Ok(Value::from_string(v.display()))
}

fn fn_identity(_ctx: &Context, loc: &Location, args: Values) -> diag::Result<Value> {
    one(loc, "identity", args)
}

fn fn_quote(_ctx: &Context, loc: &Location, args: Values) -> diag::Result<Value> {
    let v = one(loc, "quote", args)?;
    let s = v.display();
    let quoted = if s.contains([' ', '\t']) { format!("'{s}'") } else { s };
    Ok(Value::from_string(quoted))
}

fn first_name(loc: &Location, name: &str, v: &Value) -> diag::Result<Name> {
    v.reverse()
        .into_iter()
        .next()
        .ok_or_else(|| Error::parse(loc.clone(), format!("empty value passed to {name}()")))
}

fn fn_path_directory(_ctx: &Context, loc: &Location, args: Values) -> diag::Result<Value> {
    let v = one(loc, "path.directory", args)?;
    let n = first_name(loc, "path.directory", &v)?;
    let d = if n.value.is_empty() {
        n.dir.directory()
    } else if n.dir.is_empty() {
        DirPath::new(std::path::Path::new(&n.value).parent().unwrap_or_else(|| std::path::Path::new("")))
    } else {
        n.dir
    };
    Ok(Value::from_dir(d))
}

fn fn_path_leaf(_ctx: &Context, loc: &Location, args: Values) -> diag::Result<Value> {
    let v = one(loc, "path.leaf", args)?;
    let n = first_name(loc, "path.leaf", &v)?;
    let leaf = if n.value.is_empty() {
        n.dir.leaf().to_owned()
    } else {
        std::path::Path::new(&n.value)
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or(&n.value)
            .to_owned()
    };
    Ok(Value::from_string(leaf))
}

fn fn_path_base(_ctx: &Context, loc: &Location, args: Values) -> diag::Result<Value> {
    let v = one(loc, "path.base", args)?;
    let n = first_name(loc, "path.base", &v)?;
    let base = match n.value.rfind('.') {
        Some(i) if i > 0 => n.value[..i].to_owned(),
        _ => n.value,
    };
    Ok(Value::from_string(base))
}

fn fn_name_name(_ctx: &Context, loc: &Location, args: Values) -> diag::Result<Value> {
    let v = one(loc, "name.name", args)?;
    let n = first_name(loc, "name.name", &v)?;
    Ok(Value::from_string(n.value))
}

fn fn_name_extension(_ctx: &Context, loc: &Location, args: Values) -> diag::Result<Value> {
    let v = one(loc, "name.extension", args)?;
    let n = first_name(loc, "name.extension", &v)?;
    let ext = match n.value.rfind('.') {
        Some(i) => n.value[i + 1..].to_owned(),
        None => String::new(),
    };
    Ok(Value::from_string(ext))
}
