//! Fuzz harness synthesis.
//!
//! Turns each eligible test function of a generated test file into a
//! standalone atheris harness. Literal assignments become provider calls, the
//! body runs under a blanket `except Exception`, and a `fuzz_reader` function
//! replays the same consumption sequence. The same sequence is saved next to
//! the harness as a bindings sidecar so the corpus can be decoded in-process.

use crate::fuzz::corpus::write_bindings;
use crate::fuzz::{ConstantBinding, PROVIDER_VAR};
use crate::python::ast::{
    Alias, Assign, Block, Clause, Expr, FunctionDef, Import, Module, Stmt, With, WithItem,
};
use crate::python::lexer::lex;
use crate::python::passes::{prune_unused_imports, strip_assertions, substitute_literals};
use crate::python::{parse_module, unparse, SyntaxError};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Prefix a function name needs to be considered a test.
pub const TEST_PREFIX: &str = "test_";

/// Decorator tail that marks an expected failure.
const XFAIL: &str = "xfail";

/// Parameter carrying the raw fuzz input.
const DATA_PARAM: &str = "data";

const READER_NAME: &str = "fuzz_reader";

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("failed to parse {path} (line {line}): {source}")]
    Syntax {
        path: PathBuf,
        line: usize,
        source: SyntaxError,
    },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// A synthesized harness for one test function.
#[derive(Debug, Clone, PartialEq)]
pub struct Harness {
    pub test_name: String,
    /// `<test file stem>_<test name>`
    pub stem: String,
    pub source: String,
    pub bindings: Vec<ConstantBinding>,
}

impl Harness {
    pub fn file_name(&self) -> String {
        format!("{}.py", self.stem)
    }
}

/// Top-level test functions not marked as expected failures, in source order.
pub fn discover_tests(module: &Module) -> Vec<String> {
    module
        .body
        .iter()
        .filter_map(|stmt| match stmt {
            Stmt::FunctionDef(f) if f.name.starts_with(TEST_PREFIX) && !f.has_decorator(XFAIL) => {
                Some(f.name.clone())
            }
            _ => None,
        })
        .collect()
}

/// Synthesize one harness per eligible test function in `source`.
///
/// Functions without literal assignments have nothing to fuzz and are skipped.
pub fn synthesize(source: &str, file_stem: &str) -> Result<Vec<Harness>, SyntaxError> {
    let parsed = parse_module(source)?;
    let mut harnesses = Vec::new();
    for test_name in discover_tests(&parsed) {
        match synthesize_function(parsed.clone(), &test_name, file_stem) {
            Some(harness) => harnesses.push(harness),
            None => tracing::debug!("Skipping {}: no literal assignments to fuzz", test_name),
        }
    }
    Ok(harnesses)
}

/// Synthesize harnesses for a test file and write them into `out_dir`,
/// each with its bindings sidecar. Returns the harness paths.
pub fn write_harnesses(test_file: &Path, out_dir: &Path) -> Result<Vec<PathBuf>, HarnessError> {
    let io_err = |path: &Path| {
        let path = path.to_path_buf();
        move |source: std::io::Error| HarnessError::Io { path, source }
    };

    let source = std::fs::read_to_string(test_file).map_err(io_err(test_file))?;
    let stem = test_file
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let harnesses = synthesize(&source, &stem).map_err(|e| HarnessError::Syntax {
        path: test_file.to_path_buf(),
        line: e.line(&source),
        source: e,
    })?;

    std::fs::create_dir_all(out_dir).map_err(io_err(out_dir))?;
    let mut written = Vec::with_capacity(harnesses.len());
    for harness in harnesses {
        let path = out_dir.join(harness.file_name());
        std::fs::write(&path, &harness.source).map_err(io_err(&path))?;
        write_bindings(&path, &harness.bindings).map_err(io_err(&path))?;
        tracing::debug!(
            "Wrote harness {} ({} bindings)",
            path.display(),
            harness.bindings.len()
        );
        written.push(path);
    }
    Ok(written)
}

fn synthesize_function(module: Module, test_name: &str, file_stem: &str) -> Option<Harness> {
    let mut imports = vec![Stmt::Import(Import::Plain(vec![Alias::new("sys", None)]))];
    let mut body = vec![Stmt::Import(Import::Plain(vec![Alias::new("atheris", None)]))];
    let mut bindings = Vec::new();

    for stmt in module.body {
        match stmt {
            Stmt::Import(_) => imports.push(stmt),
            Stmt::FunctionDef(f) if f.name == test_name => {
                let (function, found) = fuzz_target(f);
                bindings = found;
                body.push(Stmt::FunctionDef(function));
            }
            Stmt::FunctionDef(_) => {}
            other => body.push(other),
        }
    }

    if bindings.is_empty() {
        return None;
    }

    body.push(Stmt::FunctionDef(reader_function(&bindings)));
    body.push(main_block(imports, test_name));

    let mut module = Module { body };
    prune_unused_imports(&mut module);

    Some(Harness {
        test_name: test_name.to_string(),
        stem: format!("{}_{}", file_stem, test_name),
        source: unparse(&module),
        bindings,
    })
}

/// Rewrite the test into a fuzz target; returns it with its bindings.
fn fuzz_target(mut function: FunctionDef) -> (FunctionDef, Vec<ConstantBinding>) {
    strip_assertions(&mut function.body);

    // Hoist before substituting so the bindings follow the consumption order.
    let (mut guarded, rest): (Vec<Stmt>, Vec<Stmt>) = function
        .body
        .into_iter()
        .partition(|stmt| {
            matches!(
                stmt,
                Stmt::Assign(Assign {
                    value: Expr::Literal { .. },
                    ..
                })
            )
        });
    guarded.extend(rest);
    let bindings = substitute_literals(&mut guarded);

    function.params = append_param(&function.params, DATA_PARAM);
    function.body = vec![
        provider_assignment(),
        Stmt::Block(Block {
            decorators: Vec::new(),
            clauses: vec![
                Clause::new("try", guarded),
                Clause::new("except Exception", vec![Stmt::Simple("pass".to_string())]),
            ],
        }),
    ];
    (function, bindings)
}

fn provider_assignment() -> Stmt {
    Stmt::Assign(Assign::new(
        PROVIDER_VAR,
        Expr::Source(format!("atheris.FuzzedDataProvider({})", DATA_PARAM)),
    ))
}

fn reader_function(bindings: &[ConstantBinding]) -> FunctionDef {
    let mut body = vec![provider_assignment()];
    body.extend(bindings.iter().map(|binding| {
        Stmt::Assign(Assign::new(
            binding.name.clone(),
            Expr::Provider(binding.kind),
        ))
    }));

    let entries: Vec<String> = bindings
        .iter()
        .map(|binding| format!("\"{}\": {}", binding.name, binding.name))
        .collect();
    body.push(Stmt::Assign(Assign::new(
        DATA_PARAM,
        Expr::Source(format!("{{{}}}", entries.join(", "))),
    )));
    body.push(Stmt::Simple(format!("return {}", DATA_PARAM)));

    FunctionDef {
        decorators: Vec::new(),
        is_async: false,
        name: READER_NAME.to_string(),
        params: DATA_PARAM.to_string(),
        returns: None,
        body,
    }
}

fn main_block(imports: Vec<Stmt>, test_name: &str) -> Stmt {
    let instrumented = Stmt::With(With {
        is_async: false,
        items: vec![WithItem {
            context: "atheris.instrument_imports()".to_string(),
            call_attr: Some("instrument_imports".to_string()),
            alias: None,
        }],
        body: imports,
    });
    Stmt::Block(Block {
        decorators: Vec::new(),
        clauses: vec![Clause::new(
            "if __name__ == \"__main__\"",
            vec![
                instrumented,
                Stmt::Simple(format!("atheris.Setup(sys.argv, {})", test_name)),
                Stmt::Simple("atheris.Fuzz()".to_string()),
            ],
        )],
    })
}

/// Add a positional parameter after the existing positional ones.
fn append_param(params: &str, name: &str) -> String {
    let trimmed = params.trim_end();
    if trimmed.trim().is_empty() {
        return name.to_string();
    }

    // Insert before `*args` / `**kwargs` / keyword-only marker.
    if let Ok(tokens) = lex(trimmed) {
        let mut depth = 0usize;
        let mut at_param_start = true;
        for token in &tokens {
            if depth == 0 && at_param_start && (token.is_op("*") || token.is_op("**")) {
                let (head, tail) = trimmed.split_at(token.span.start);
                return format!("{}{}, {}", head, name, tail);
            }
            at_param_start = false;
            if token.is_op("(") || token.is_op("[") || token.is_op("{") {
                depth += 1;
            } else if token.is_op(")") || token.is_op("]") || token.is_op("}") {
                depth = depth.saturating_sub(1);
            } else if depth == 0 && token.is_op(",") {
                at_param_start = true;
            }
        }
    }

    if trimmed.ends_with(',') {
        format!("{} {}", trimmed, name)
    } else {
        format!("{}, {}", trimmed, name)
    }
}
