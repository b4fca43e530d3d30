//! Working directory layout of one run.
//!
//! ```text
//! <root>/
//!   tests/<module>/                              first generation pass
//!   intermediate/harnesses/<module>/             harnesses + bindings sidecars
//!   intermediate/fuzz-results/<module>/<harness>/  raw corpus + decoded corpus
//!   intermediate/regression/<module>/            recreated regression tests
//!   final-tests/<module>/                        seeded second pass (`*_1.py`)
//!   logs/<stage>/<module>.log
//!   report-<n>/                                  evaluation pass n
//!   summary.json
//! ```

use super::Stage;
use crate::discovery::Module;
use crate::report::ReportDir;
use std::io;
use std::path::{Path, PathBuf};

pub const SUMMARY_FILE: &str = "summary.json";

#[derive(Debug, Clone)]
pub struct RunLayout {
    root: PathBuf,
}

impl RunLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Root of the first-pass tests of every module
    pub fn tests_root(&self) -> PathBuf {
        self.root.join("tests")
    }

    pub fn tests_dir(&self, module: &Module) -> PathBuf {
        self.tests_root().join(module.as_str())
    }

    pub fn harness_dir(&self, module: &Module) -> PathBuf {
        self.root
            .join("intermediate")
            .join("harnesses")
            .join(module.as_str())
    }

    /// Parent of the per-harness result directories of a module
    pub fn fuzz_results_dir(&self, module: &Module) -> PathBuf {
        self.root
            .join("intermediate")
            .join("fuzz-results")
            .join(module.as_str())
    }

    pub fn regression_dir(&self, module: &Module) -> PathBuf {
        self.root
            .join("intermediate")
            .join("regression")
            .join(module.as_str())
    }

    /// Root of the second-pass tests of every module
    pub fn final_tests_root(&self) -> PathBuf {
        self.root.join("final-tests")
    }

    pub fn final_tests_dir(&self, module: &Module) -> PathBuf {
        self.final_tests_root().join(module.as_str())
    }

    pub fn logs_dir(&self, stage: Stage) -> PathBuf {
        self.root.join("logs").join(stage.as_str())
    }

    pub fn log_file(&self, stage: Stage, name: &str) -> PathBuf {
        self.logs_dir(stage).join(format!("{}.log", name))
    }

    pub fn report_dir(&self, pass: u8) -> ReportDir {
        ReportDir::new(self.root.join(format!("report-{}", pass)))
    }

    pub fn summary_file(&self) -> PathBuf {
        self.root.join(SUMMARY_FILE)
    }

    /// Create the per-module directories every stage expects to exist.
    pub fn create(&self, modules: &[Module]) -> io::Result<()> {
        std::fs::create_dir_all(self.root.join("logs"))?;
        for module in modules {
            for dir in [
                self.tests_dir(module),
                self.harness_dir(module),
                self.fuzz_results_dir(module),
                self.regression_dir(module),
                self.final_tests_dir(module),
            ] {
                std::fs::create_dir_all(dir)?;
            }
        }
        Ok(())
    }
}

/// `*.py` files directly inside `dir`, sorted. A missing directory has none.
pub fn python_files(dir: &Path) -> io::Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_file() && path.extension().is_some_and(|ext| ext == "py"))
        .collect();
    files.sort();
    Ok(files)
}

/// Rename every `<stem>.py` in `dir` to `<stem>_1.py`.
pub fn rename_second_pass(dir: &Path) -> io::Result<usize> {
    let files = python_files(dir)?;
    for file in &files {
        let stem = file
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let renamed = file.with_file_name(format!("{}_1.py", stem));
        std::fs::rename(file, &renamed)?;
        tracing::debug!("Renamed {} to {}", file.display(), renamed.display());
    }
    Ok(files.len())
}
