//! Statement-level syntax tree for Python test files.
//!
//! The tree models statements structurally (functions, blocks, assignments,
//! asserts, `with` blocks, imports) and keeps expressions as original source
//! text, except for the right-hand side of simple-name assignments which is
//! classified so literal constants can be found and replaced.

use crate::fuzz::{PrimitiveKind, Value};

/// A parsed source file.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Module {
    pub body: Vec<Stmt>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    Import(Import),
    FunctionDef(FunctionDef),
    Assign(Assign),
    /// `assert <test>[, <msg>]`; holds the text after the keyword.
    Assert(String),
    With(With),
    /// Any other compound statement: `if`/`elif`/`else`, `for`, `while`,
    /// `try`/`except`/`finally`, `class`, `match`.
    Block(Block),
    /// Any other simple statement, kept verbatim.
    Simple(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Import {
    /// `import a.b as c, d`
    Plain(Vec<Alias>),
    /// `from ..pkg import a as b, c` / `from pkg import *`
    From {
        module: String,
        names: Vec<Alias>,
        star: bool,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Alias {
    pub name: String,
    pub asname: Option<String>,
}

impl Alias {
    pub fn new(name: impl Into<String>, asname: Option<String>) -> Self {
        Self {
            name: name.into(),
            asname,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Decorator {
    /// Expression text after `@`.
    pub text: String,
    /// Last attribute/name of the decorator callee: `xfail` for
    /// `@pytest.mark.xfail(reason="...")`.
    pub tail: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FunctionDef {
    pub decorators: Vec<Decorator>,
    pub is_async: bool,
    pub name: String,
    /// Parameter list text between the parentheses.
    pub params: String,
    pub returns: Option<String>,
    pub body: Vec<Stmt>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Assign {
    pub target: String,
    /// Further names of a chained assignment: `y` in `x = y = 5`.
    pub chained: Vec<String>,
    pub value: Expr,
}

impl Assign {
    pub fn new(target: impl Into<String>, value: Expr) -> Self {
        Self {
            target: target.into(),
            chained: Vec::new(),
            value,
        }
    }
}

/// Right-hand side of a simple-name assignment.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// A primitive constant, with its original spelling.
    Literal { kind: PrimitiveKind, text: String },
    /// A concrete value spliced in by a rewrite.
    Value(Value),
    /// `fdp.ConsumeXxx(...)` call on the fuzz provider.
    Provider(PrimitiveKind),
    /// Anything else, verbatim.
    Source(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct With {
    pub is_async: bool,
    pub items: Vec<WithItem>,
    pub body: Vec<Stmt>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WithItem {
    pub context: String,
    /// Attribute name of the called context manager: `raises` for
    /// `pytest.raises(ValueError)`.
    pub call_attr: Option<String>,
    pub alias: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    pub decorators: Vec<Decorator>,
    pub clauses: Vec<Clause>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Clause {
    /// Header text without the trailing colon, e.g. `elif x > 1`.
    pub header: String,
    pub body: Vec<Stmt>,
}

impl Clause {
    pub fn new(header: impl Into<String>, body: Vec<Stmt>) -> Self {
        Self {
            header: header.into(),
            body,
        }
    }
}

impl Module {
    /// Find a top-level function by name.
    pub fn function(&self, name: &str) -> Option<&FunctionDef> {
        self.body.iter().find_map(|stmt| match stmt {
            Stmt::FunctionDef(f) if f.name == name => Some(f),
            _ => None,
        })
    }

    /// Top-level import statements, in source order.
    pub fn imports(&self) -> Vec<Import> {
        self.body
            .iter()
            .filter_map(|stmt| match stmt {
                Stmt::Import(import) => Some(import.clone()),
                _ => None,
            })
            .collect()
    }
}

impl FunctionDef {
    pub fn has_decorator(&self, tail: &str) -> bool {
        self.decorators
            .iter()
            .any(|d| d.tail.as_deref() == Some(tail))
    }
}

impl Stmt {
    /// Mutable access to every statement list nested directly in this
    /// statement (function body, block clauses, `with` body).
    pub fn child_bodies_mut(&mut self) -> Vec<&mut Vec<Stmt>> {
        match self {
            Stmt::FunctionDef(f) => vec![&mut f.body],
            Stmt::With(w) => vec![&mut w.body],
            Stmt::Block(b) => b.clauses.iter_mut().map(|c| &mut c.body).collect(),
            _ => Vec::new(),
        }
    }
}
