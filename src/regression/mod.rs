//! Regression test recreation from decoded fuzz corpora.
//!
//! Each corpus entry becomes one assertion-free copy of the original test
//! with its literal assignments set to the fuzz-discovered values.

use crate::fuzz::corpus::{corpus_file, read_corpus};
use crate::fuzz::CorpusEntry;
use crate::harness::discover_tests;
use crate::python::ast::{Module, Stmt};
use crate::python::passes::{apply_values, prune_unused_imports, strip_assertions};
use crate::python::{parse_module, unparse, SyntaxError};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RecreateError {
    #[error("test function `{0}` not found")]
    FunctionNotFound(String),

    #[error("failed to parse test file: {0}")]
    Syntax(#[from] SyntaxError),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Build a regression file from `source` and the corpora of its tests,
/// keyed by test function name.
///
/// Returns `Ok(None)` when every corpus is empty: there is nothing to
/// recreate, which is not an error.
pub fn recreate(
    source: &str,
    corpora: &BTreeMap<String, Vec<CorpusEntry>>,
) -> Result<Option<String>, RecreateError> {
    let corpora: BTreeMap<&str, &Vec<CorpusEntry>> = corpora
        .iter()
        .filter(|(_, entries)| !entries.is_empty())
        .map(|(name, entries)| (name.as_str(), entries))
        .collect();
    if corpora.is_empty() {
        return Ok(None);
    }

    let parsed = parse_module(source)?;
    if let Some(missing) = corpora.keys().find(|name| parsed.function(name).is_none()) {
        return Err(RecreateError::FunctionNotFound(missing.to_string()));
    }

    let mut body: Vec<Stmt> = parsed
        .imports()
        .into_iter()
        .map(Stmt::Import)
        .collect();

    for stmt in &parsed.body {
        let Stmt::FunctionDef(function) = stmt else {
            continue;
        };
        let Some(entries) = corpora.get(function.name.as_str()) else {
            continue;
        };

        let mut stripped = function.clone();
        strip_assertions(&mut stripped.body);
        for (i, entry) in entries.iter().enumerate() {
            let mut instance = stripped.clone();
            instance.name = format!("{}_{}", function.name, i);
            apply_values(&mut instance.body, entry);
            body.push(Stmt::FunctionDef(instance));
        }
    }

    let mut module = Module { body };
    prune_unused_imports(&mut module);
    Ok(Some(unparse(&module)))
}

/// Recreate regression tests for one test file, reading each test's corpus
/// from `results_dir`, and write them to `out`.
///
/// Returns the number of regression tests written, or `None` when there
/// was nothing to recreate (no file is written then).
pub fn recreate_file(
    test_file: &Path,
    results_dir: &Path,
    out: &Path,
) -> Result<Option<usize>, RecreateError> {
    let source = std::fs::read_to_string(test_file).map_err(|source| RecreateError::Io {
        path: test_file.to_path_buf(),
        source,
    })?;
    let stem = test_file
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();

    let mut corpora = BTreeMap::new();
    for test_name in discover_tests(&parse_module(&source)?) {
        let path = corpus_file(results_dir, &format!("{}_{}", stem, test_name));
        let entries = read_corpus(&path).map_err(|source| RecreateError::Io {
            path: path.clone(),
            source,
        })?;
        if !entries.is_empty() {
            corpora.insert(test_name, entries);
        }
    }
    let count: usize = corpora.values().map(Vec::len).sum();

    let Some(recreated) = recreate(&source, &corpora)? else {
        tracing::info!("No tests to recreate for {}", test_file.display());
        return Ok(None);
    };

    if let Some(parent) = out.parent() {
        std::fs::create_dir_all(parent).map_err(|source| RecreateError::Io {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    std::fs::write(out, recreated).map_err(|source| RecreateError::Io {
        path: out.to_path_buf(),
        source,
    })?;
    Ok(Some(count))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fuzz::corpus::write_corpus;
    use crate::fuzz::Value;

    const SOURCE: &str = r#"import pytest
import os
import pkg.mod as module_0


def test_case_0():
    int_0 = 5
    with pytest.raises(ValueError):
        module_0.f(int_0)
    assert int_0 == 5


def test_case_1():
    str_0 = "abc"
    flag = True
    module_0.g(str_0, flag)
"#;

    fn entry(pairs: &[(&str, Value)]) -> CorpusEntry {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn corpora(pairs: Vec<(&str, Vec<CorpusEntry>)>) -> BTreeMap<String, Vec<CorpusEntry>> {
        pairs
            .into_iter()
            .map(|(name, entries)| (name.to_string(), entries))
            .collect()
    }

    // =========================================================================
    // recreate
    // =========================================================================

    #[test]
    fn test_recreate_one_test_per_entry() {
        let corpora = corpora(vec![(
            "test_case_0",
            vec![
                entry(&[("int_0", Value::Int(-7))]),
                entry(&[("int_0", Value::Int(0))]),
            ],
        )]);

        let recreated = recreate(SOURCE, &corpora).unwrap().unwrap();

        assert_eq!(
            recreated,
            r#"import pkg.mod as module_0


def test_case_0_0():
    int_0 = -7
    module_0.f(int_0)


def test_case_0_1():
    int_0 = 0
    module_0.f(int_0)
"#
        );
        assert!(parse_module(&recreated).is_ok());
    }

    #[test]
    fn test_recreate_function_count_matches_entries() {
        let corpora = corpora(vec![
            ("test_case_0", vec![entry(&[("int_0", Value::Int(1))])]),
            (
                "test_case_1",
                vec![
                    entry(&[("str_0", Value::Str("x".into()))]),
                    entry(&[("flag", Value::Bool(false))]),
                    entry(&[]),
                ],
            ),
        ]);

        let recreated = recreate(SOURCE, &corpora).unwrap().unwrap();
        let module = parse_module(&recreated).unwrap();
        let names: Vec<&str> = module
            .body
            .iter()
            .filter_map(|s| match s {
                Stmt::FunctionDef(f) => Some(f.name.as_str()),
                _ => None,
            })
            .collect();

        assert_eq!(
            names,
            vec!["test_case_0_0", "test_case_1_0", "test_case_1_1", "test_case_1_2"]
        );
        // Missing keys keep the original literal; falsy values are applied.
        assert!(recreated.contains("    str_0 = \"x\"\n    flag = True\n"));
        assert!(recreated.contains("    str_0 = \"abc\"\n    flag = False\n"));
    }

    #[test]
    fn test_recreate_empty_corpora_is_nothing() {
        assert_eq!(recreate(SOURCE, &BTreeMap::new()).unwrap(), None);
        let empty = corpora(vec![("test_case_0", Vec::new())]);
        assert_eq!(recreate(SOURCE, &empty).unwrap(), None);
    }

    #[test]
    fn test_recreate_missing_function() {
        let corpora = corpora(vec![("test_gone", vec![entry(&[])])]);
        let err = recreate(SOURCE, &corpora).unwrap_err();
        assert!(matches!(err, RecreateError::FunctionNotFound(name) if name == "test_gone"));
    }

    // =========================================================================
    // recreate_file
    // =========================================================================

    #[test]
    fn test_recreate_file_reads_results_layout() {
        let dir = tempfile::TempDir::new().unwrap();
        let test_file = dir.path().join("test_mod.py");
        std::fs::write(&test_file, SOURCE).unwrap();
        let results = dir.path().join("results");
        write_corpus(
            &corpus_file(&results, "test_mod_test_case_1"),
            &[entry(&[("str_0", Value::Str("q".into()))])],
        )
        .unwrap();
        let out = dir.path().join("regression").join("test_mod.py");

        let written = recreate_file(&test_file, &results, &out).unwrap();

        assert_eq!(written, Some(1));
        let content = std::fs::read_to_string(&out).unwrap();
        assert!(content.contains("def test_case_1_0():"));
        assert!(!content.contains("test_case_0"));
    }

    #[test]
    fn test_recreate_file_without_corpora_writes_nothing() {
        let dir = tempfile::TempDir::new().unwrap();
        let test_file = dir.path().join("test_mod.py");
        std::fs::write(&test_file, SOURCE).unwrap();
        let out = dir.path().join("out.py");

        assert_eq!(recreate_file(&test_file, &dir.path().join("none"), &out).unwrap(), None);
        assert!(!out.exists());
    }
}
