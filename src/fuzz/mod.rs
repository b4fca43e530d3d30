//! Fuzz-provider model shared by harness synthesis and regression recreation.
//!
//! A harness pulls typed values out of a byte stream through
//! `atheris.FuzzedDataProvider`. The same consumption sequence is replayed
//! in-process by [`Reader`] over every retained corpus file, producing the
//! name→value mappings the regression stage substitutes back into tests.

pub mod corpus;
pub mod provider;
pub mod reader;

pub use provider::FuzzedDataProvider;
pub use reader::Reader;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write as _;

/// Variable the harness binds the provider to.
pub const PROVIDER_VAR: &str = "fdp";

/// Bytes consumed per integer binding.
pub const INT_WIDTH: usize = 8;

/// Maximum characters consumed per string binding.
pub const STRING_WIDTH: usize = 50;

/// Runtime type of a literal constant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrimitiveKind {
    Int,
    Float,
    Str,
    Bool,
}

impl PrimitiveKind {
    /// Provider method that produces a value of this kind.
    pub fn provider_method(self) -> &'static str {
        match self {
            PrimitiveKind::Int => "ConsumeInt",
            PrimitiveKind::Float => "ConsumeRegularFloat",
            PrimitiveKind::Str => "ConsumeString",
            PrimitiveKind::Bool => "ConsumeBool",
        }
    }

    /// Width argument passed to the provider, if the method takes one.
    pub fn width(self) -> Option<usize> {
        match self {
            PrimitiveKind::Int => Some(INT_WIDTH),
            PrimitiveKind::Str => Some(STRING_WIDTH),
            PrimitiveKind::Float | PrimitiveKind::Bool => None,
        }
    }
}

/// `fdp.ConsumeInt(8)`, `fdp.ConsumeBool()`, ...
pub fn provider_call(kind: PrimitiveKind) -> String {
    match kind.width() {
        Some(width) => format!("{}.{}({})", PROVIDER_VAR, kind.provider_method(), width),
        None => format!("{}.{}()", PROVIDER_VAR, kind.provider_method()),
    }
}

/// A concrete primitive value decoded from fuzz input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl Value {
    pub fn kind(&self) -> PrimitiveKind {
        match self {
            Value::Bool(_) => PrimitiveKind::Bool,
            Value::Int(_) => PrimitiveKind::Int,
            Value::Float(_) => PrimitiveKind::Float,
            Value::Str(_) => PrimitiveKind::Str,
        }
    }

    /// Python literal spelling of the value.
    pub fn to_python(&self) -> String {
        match self {
            Value::Bool(true) => "True".to_string(),
            Value::Bool(false) => "False".to_string(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) if f.is_nan() => "float(\"nan\")".to_string(),
            Value::Float(f) if f.is_infinite() => {
                if *f > 0.0 {
                    "float(\"inf\")".to_string()
                } else {
                    "float(\"-inf\")".to_string()
                }
            }
            Value::Float(f) => format!("{:?}", f),
            Value::Str(s) => python_string(s),
        }
    }
}

/// Double-quoted Python string literal.
fn python_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 || c as u32 == 0x7f => {
                let _ = write!(out, "\\x{:02x}", c as u32);
            }
            c if c.is_control() => {
                let _ = write!(out, "\\u{:04x}", c as u32);
            }
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

/// A literal assignment replaced by a provider call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConstantBinding {
    pub name: String,
    pub kind: PrimitiveKind,
}

impl ConstantBinding {
    pub fn new(name: impl Into<String>, kind: PrimitiveKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }
}

/// One decoded fuzz input: binding name → value.
pub type CorpusEntry = BTreeMap<String, Value>;
