//! Render a syntax tree back to source.
//!
//! Output uses four-space indentation, two blank lines around top-level
//! functions and classes and one blank line between nested definitions.
//! Statement text captured by the parser is emitted verbatim.

use super::ast::{Block, Decorator, Expr, FunctionDef, Import, Module, Stmt, With};
use crate::fuzz::provider_call;

const INDENT: &str = "    ";

/// Render a module to source text ending in a single newline.
pub fn unparse(module: &Module) -> String {
    let mut out = String::new();
    let mut previous: Option<&Stmt> = None;
    for stmt in &module.body {
        if let Some(prev) = previous {
            if is_definition(prev) || is_definition(stmt) {
                out.push_str("\n\n");
            }
        }
        write_stmt(&mut out, stmt, 0);
        previous = Some(stmt);
    }
    out
}

fn is_definition(stmt: &Stmt) -> bool {
    match stmt {
        Stmt::FunctionDef(_) => true,
        Stmt::Block(block) => block
            .clauses
            .first()
            .is_some_and(|c| c.header.starts_with("class")),
        _ => false,
    }
}

fn line(out: &mut String, level: usize, text: &str) {
    for _ in 0..level {
        out.push_str(INDENT);
    }
    out.push_str(text);
    out.push('\n');
}

fn write_body(out: &mut String, body: &[Stmt], level: usize) {
    if body.is_empty() {
        line(out, level, "pass");
        return;
    }
    let mut previous: Option<&Stmt> = None;
    for stmt in body {
        if let Some(prev) = previous {
            if matches!(prev, Stmt::FunctionDef(_)) || matches!(stmt, Stmt::FunctionDef(_)) {
                out.push('\n');
            }
        }
        write_stmt(out, stmt, level);
        previous = Some(stmt);
    }
}

fn write_decorators(out: &mut String, decorators: &[Decorator], level: usize) {
    for decorator in decorators {
        line(out, level, &format!("@{}", decorator.text));
    }
}

fn write_stmt(out: &mut String, stmt: &Stmt, level: usize) {
    match stmt {
        Stmt::Import(import) => line(out, level, &import_text(import)),
        Stmt::FunctionDef(function) => write_function(out, function, level),
        Stmt::Assign(assign) => line(
            out,
            level,
            &format!(
                "{} = {}{}",
                assign.target,
                assign
                    .chained
                    .iter()
                    .map(|name| format!("{} = ", name))
                    .collect::<String>(),
                expr_text(&assign.value)
            ),
        ),
        Stmt::Assert(test) => line(out, level, &format!("assert {}", test)),
        Stmt::With(with) => write_with(out, with, level),
        Stmt::Block(block) => write_block(out, block, level),
        Stmt::Simple(text) => line(out, level, text),
    }
}

fn write_function(out: &mut String, function: &FunctionDef, level: usize) {
    write_decorators(out, &function.decorators, level);
    let prefix = if function.is_async { "async def" } else { "def" };
    let returns = function
        .returns
        .as_ref()
        .map(|r| format!(" -> {}", r))
        .unwrap_or_default();
    line(
        out,
        level,
        &format!("{} {}({}){}:", prefix, function.name, function.params, returns),
    );
    write_body(out, &function.body, level + 1);
}

fn write_with(out: &mut String, with: &With, level: usize) {
    let items: Vec<String> = with
        .items
        .iter()
        .map(|item| match &item.alias {
            Some(alias) => format!("{} as {}", item.context, alias),
            None => item.context.clone(),
        })
        .collect();
    let prefix = if with.is_async { "async with" } else { "with" };
    line(out, level, &format!("{} {}:", prefix, items.join(", ")));
    write_body(out, &with.body, level + 1);
}

fn write_block(out: &mut String, block: &Block, level: usize) {
    write_decorators(out, &block.decorators, level);
    for clause in &block.clauses {
        line(out, level, &format!("{}:", clause.header));
        write_body(out, &clause.body, level + 1);
    }
}

pub fn import_text(import: &Import) -> String {
    match import {
        Import::Plain(aliases) => format!("import {}", aliases_text(aliases)),
        Import::From { module, star: true, .. } => format!("from {} import *", module),
        Import::From { module, names, .. } => {
            format!("from {} import {}", module, aliases_text(names))
        }
    }
}

fn aliases_text(aliases: &[super::ast::Alias]) -> String {
    aliases
        .iter()
        .map(|alias| match &alias.asname {
            Some(asname) => format!("{} as {}", alias.name, asname),
            None => alias.name.clone(),
        })
        .collect::<Vec<_>>()
        .join(", ")
}

pub fn expr_text(expr: &Expr) -> String {
    match expr {
        Expr::Literal { text, .. } => text.clone(),
        Expr::Value(value) => value.to_python(),
        Expr::Provider(kind) => provider_call(*kind),
        Expr::Source(text) => text.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::python::parse_module;

    fn roundtrip(source: &str) -> String {
        unparse(&parse_module(source).unwrap())
    }

    #[test]
    fn test_unparse_normalizes_indentation() {
        let source = "def test_a():\n  x = 1\n  if x:\n     y = 2\n";
        assert_eq!(
            roundtrip(source),
            "def test_a():\n    x = 1\n    if x:\n        y = 2\n"
        );
    }

    #[test]
    fn test_unparse_is_stable() {
        let source = r#"import pytest
import pkg.mod as module_0


def test_case_0():
    int_0 = 5
    with pytest.raises(ValueError):
        module_0.f(int_0)
    assert int_0 == 5
"#;
        let once = roundtrip(source);
        assert_eq!(once, source);
        assert_eq!(roundtrip(&once), once);
    }

    #[test]
    fn test_unparse_blank_lines_around_definitions() {
        let source = "import a\ndef f():\n    pass\nx = 1\n";
        assert_eq!(
            roundtrip(source),
            "import a\n\n\ndef f():\n    pass\n\n\nx = 1\n"
        );
    }

    #[test]
    fn test_unparse_block_clauses() {
        let source = "try:\n    a()\nexcept ValueError as e:\n    b(e)\nelse:\n    c()\nfinally:\n    d()\n";
        assert_eq!(roundtrip(source), source);
    }

    #[test]
    fn test_unparse_inline_suite_expands() {
        assert_eq!(roundtrip("if x: y = 1; z = 2\n"), "if x:\n    y = 1\n    z = 2\n");
    }

    #[test]
    fn test_unparse_empty_body_gets_pass() {
        let mut module = parse_module("def test_a():\n    assert True\n").unwrap();
        if let Stmt::FunctionDef(f) = &mut module.body[0] {
            f.body.clear();
        }
        assert_eq!(unparse(&module), "def test_a():\n    pass\n");
    }

    #[test]
    fn test_unparse_decorators_and_async() {
        let source = "@pytest.mark.xfail(strict=True)\nasync def test_a(x, y=2) -> None:\n    await x\n";
        assert_eq!(roundtrip(source), source);
    }

    #[test]
    fn test_import_text_forms() {
        let module = parse_module(
            "import a.b as c, d\nfrom .. import x\nfrom pkg import (y as z,\n    w)\nfrom m import *\n",
        )
        .unwrap();
        let rendered: Vec<String> = module.imports().iter().map(import_text).collect();
        assert_eq!(
            rendered,
            vec![
                "import a.b as c, d",
                "from .. import x",
                "from pkg import y as z, w",
                "from m import *",
            ]
        );
    }
}
