#![doc = include_str!("../../../README.md")]

pub mod cc;
pub mod context;
pub mod depdb;
pub mod diag;
pub mod driver;
pub mod dump;
pub mod file;
pub mod function;
pub mod lex;
pub mod module;
pub mod name;
pub mod operation;
pub mod parse;
pub mod path;
pub mod rule;
pub mod scheduler;
pub mod scope;
pub mod target;
pub mod value;
pub mod variable;

pub use crate::{
    context::{Context, ContextConfig},
    diag::{Capture, Diagnostics, Error, ErrorKind, Location},
    driver::run,
    name::{Name, Names, ProjectName},
    operation::Action,
    path::{DirPath, TargetTriplet, path_match},
    scope::{Lookup, ScopeId, Storage},
    target::{Target, TargetKey, TargetState},
    value::Value,
};
