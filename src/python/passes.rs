//! Rewrite passes over the statement tree.
//!
//! Each pass is a standalone function over a statement list or module; the
//! harness synthesizer and the regression recreator compose them in order.

use super::ast::{Expr, Import, Module, Stmt, With};
use super::lexer::{lex, StringFlavor, TokenKind};
use crate::fuzz::{ConstantBinding, CorpusEntry};
use std::collections::HashSet;

// ============================================================================
// Assertion stripping
// ============================================================================

/// Remove every `assert` and unwrap every `with ....raises(...)` block to
/// its body, at any depth. Idempotent.
pub fn strip_assertions(body: &mut Vec<Stmt>) {
    let mut out = Vec::with_capacity(body.len());
    for mut stmt in std::mem::take(body) {
        if matches!(stmt, Stmt::Assert(_)) {
            continue;
        }
        for child in stmt.child_bodies_mut() {
            strip_assertions(child);
        }
        match stmt {
            Stmt::With(with) if is_raises_block(&with) => out.extend(with.body),
            other => out.push(other),
        }
    }
    *body = out;
}

fn is_raises_block(with: &With) -> bool {
    with.items
        .iter()
        .any(|item| item.call_attr.as_deref() == Some("raises"))
}

// ============================================================================
// Literal substitution
// ============================================================================

/// Replace every primitive-literal assignment with a provider call.
///
/// Returns the bindings in the order the sites appear in `body`, which is
/// the order the rewritten body consumes them. Nested function and class
/// bodies are separate scopes and are left alone.
pub fn substitute_literals(body: &mut [Stmt]) -> Vec<ConstantBinding> {
    let mut bindings = Vec::new();
    visit_literal_sites(body, &mut |target: &str, value: &mut Expr| {
        if let Expr::Literal { kind, .. } = value {
            bindings.push(ConstantBinding::new(target, *kind));
            *value = Expr::Provider(*kind);
        }
    });
    bindings
}

/// Replace literal assignments whose target appears in `entry` with the
/// recorded value. Targets missing from `entry` keep their literal.
pub fn apply_values(body: &mut [Stmt], entry: &CorpusEntry) {
    visit_literal_sites(body, &mut |target: &str, value: &mut Expr| {
        let Expr::Literal { kind, .. } = *value else {
            return;
        };
        match entry.get(target) {
            Some(concrete) if concrete.kind() == kind => *value = Expr::Value(concrete.clone()),
            Some(concrete) => tracing::debug!(
                "Keeping literal {}: corpus holds a {:?}, not a {:?}",
                target,
                concrete.kind(),
                kind
            ),
            None => {}
        }
    });
}

fn visit_literal_sites(body: &mut [Stmt], visit: &mut dyn FnMut(&str, &mut Expr)) {
    for stmt in body.iter_mut() {
        match stmt {
            Stmt::Assign(assign) => visit(&assign.target, &mut assign.value),
            Stmt::FunctionDef(_) => {}
            Stmt::Block(block)
                if block
                    .clauses
                    .first()
                    .is_some_and(|c| c.header.starts_with("class")) => {}
            other => {
                for child in other.child_bodies_mut() {
                    visit_literal_sites(child, visit);
                }
            }
        }
    }
}

// ============================================================================
// Unused import pruning
// ============================================================================

/// Drop imported names that nothing in the module references.
///
/// Star imports and `__future__` imports are always kept. Imports nested in
/// blocks are pruned against the same module-wide usage set.
pub fn prune_unused_imports(module: &mut Module) {
    let mut used = HashSet::new();
    for stmt in &module.body {
        collect_used_names(stmt, &mut used);
    }
    prune_body(&mut module.body, &used);
}

fn prune_body(body: &mut Vec<Stmt>, used: &HashSet<String>) {
    body.retain_mut(|stmt| match stmt {
        Stmt::Import(import) => prune_import(import, used),
        other => {
            for child in other.child_bodies_mut() {
                prune_body(child, used);
            }
            true
        }
    });
}

/// Returns whether anything of the import survives.
fn prune_import(import: &mut Import, used: &HashSet<String>) -> bool {
    match import {
        Import::Plain(aliases) => {
            aliases.retain(|alias| {
                let bound = alias
                    .asname
                    .as_deref()
                    .unwrap_or_else(|| alias.name.split('.').next().unwrap_or(&alias.name));
                used.contains(bound)
            });
            !aliases.is_empty()
        }
        Import::From { star: true, .. } => true,
        Import::From { module, .. } if module == "__future__" => true,
        Import::From { names, .. } => {
            names.retain(|alias| used.contains(alias.asname.as_deref().unwrap_or(&alias.name)));
            !names.is_empty()
        }
    }
}

fn collect_used_names(stmt: &Stmt, used: &mut HashSet<String>) {
    match stmt {
        Stmt::Import(_) => {}
        Stmt::FunctionDef(f) => {
            for decorator in &f.decorators {
                names_in(&decorator.text, used);
            }
            names_in(&f.params, used);
            if let Some(returns) = &f.returns {
                names_in(returns, used);
            }
            f.body.iter().for_each(|s| collect_used_names(s, used));
        }
        Stmt::Assign(assign) => {
            if let Expr::Source(text) = &assign.value {
                names_in(text, used);
            }
        }
        Stmt::Assert(text) | Stmt::Simple(text) => names_in(text, used),
        Stmt::With(with) => {
            for item in &with.items {
                names_in(&item.context, used);
            }
            with.body.iter().for_each(|s| collect_used_names(s, used));
        }
        Stmt::Block(block) => {
            for decorator in &block.decorators {
                names_in(&decorator.text, used);
            }
            for clause in &block.clauses {
                names_in(&clause.header, used);
                clause.body.iter().for_each(|s| collect_used_names(s, used));
            }
        }
    }
}

/// Names referenced in an expression fragment, skipping attribute names.
fn names_in(text: &str, used: &mut HashSet<String>) {
    match lex(text) {
        Ok(tokens) => {
            let mut after_dot = false;
            for token in tokens {
                match &token.kind {
                    TokenKind::Name(name) if !after_dot => {
                        used.insert(name.clone());
                    }
                    TokenKind::String(StringFlavor::Format) => {
                        for field in format_fields(&text[token.span.start..token.span.end]) {
                            names_in(field, used);
                        }
                    }
                    _ => {}
                }
                after_dot = token.is_op(".");
            }
        }
        // Over-approximate rather than drop an import that is in use.
        Err(_) => {
            for word in text.split(|c: char| !(c.is_alphanumeric() || c == '_')) {
                if !word.is_empty() {
                    used.insert(word.to_string());
                }
            }
        }
    }
}

/// Expressions inside the `{...}` replacement fields of an f-string token,
/// without their conversion or format spec. `{{` and `}}` are escapes.
fn format_fields(literal: &str) -> Vec<&str> {
    let bytes = literal.as_bytes();
    let mut fields = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'{' if bytes.get(i + 1) == Some(&b'{') => i += 2,
            b'{' => {
                let start = i + 1;
                let mut depth = 0usize;
                let mut end = None;
                let mut j = start;
                while j < bytes.len() {
                    match bytes[j] {
                        b'(' | b'[' | b'{' => depth += 1,
                        b')' | b']' => depth = depth.saturating_sub(1),
                        b'}' if depth > 0 => depth -= 1,
                        b'}' => break,
                        b'!' if depth == 0 && bytes.get(j + 1) != Some(&b'=') => {
                            end.get_or_insert(j);
                        }
                        b':' if depth == 0 => {
                            end.get_or_insert(j);
                        }
                        _ => {}
                    }
                    j += 1;
                }
                let field = &literal[start..end.unwrap_or(j).min(literal.len())];
                if !field.trim().is_empty() {
                    fields.push(field);
                }
                i = j + 1;
            }
            _ => i += 1,
        }
    }
    fields
}
