//! Module discovery.
//!
//! Selects the Python files of the target project with include/exclude glob
//! patterns and turns their root-relative paths into dotted module names.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

use crate::config::ModulesConfig;

/// Fully-qualified module name, e.g. `flutils.validators`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Module(String);

impl Module {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `a/b/c.py` ⇒ `a.b.c`; `None` for anything that is not a `.py` file.
    pub fn from_relative_path(relative: &str) -> Option<Self> {
        let stem = relative.strip_suffix(".py")?;
        if stem.is_empty() {
            return None;
        }
        Some(Self(stem.replace(['/', '\\'], ".")))
    }
}

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Find the modules of `root` selected by `config`: sorted, deduplicated and
/// truncated to `config.max`.
pub fn discover_modules(root: &Path, config: &ModulesConfig) -> Result<Vec<Module>> {
    let skip_dirs = ["__pycache__", ".git", ".venv", "venv", "build", "dist"];
    let mut modules = Vec::new();

    for entry in walkdir::WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| {
            if e.path() == root {
                return true;
            }
            let name = e.file_name().to_string_lossy();
            !name.starts_with('.') && !skip_dirs.contains(&name.as_ref())
        })
    {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(relative) = entry.path().strip_prefix(root) else {
            continue;
        };
        let relative = relative.to_string_lossy().replace('\\', "/");

        let included = config
            .include
            .iter()
            .any(|pattern| glob_match::glob_match(pattern, &relative));
        let excluded = config
            .exclude
            .iter()
            .any(|pattern| glob_match::glob_match(pattern, &relative));
        if !included || excluded {
            continue;
        }

        if let Some(module) = Module::from_relative_path(&relative) {
            modules.push(module);
        }
    }

    modules.sort();
    modules.dedup();
    if let Some(max) = config.max {
        modules.truncate(max);
    }

    tracing::debug!("Discovered {} modules under {}", modules.len(), root.display());
    Ok(modules)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn touch(root: &Path, relative: &str) {
        let path = root.join(relative);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, "").unwrap();
    }

    fn modules_config(include: &[&str], exclude: &[&str], max: Option<usize>) -> ModulesConfig {
        ModulesConfig {
            include: include.iter().map(|s| s.to_string()).collect(),
            exclude: exclude.iter().map(|s| s.to_string()).collect(),
            max,
        }
    }

    fn names(modules: &[Module]) -> Vec<&str> {
        modules.iter().map(Module::as_str).collect()
    }

    // =========================================================================
    // Module names
    // =========================================================================

    #[test]
    fn test_module_from_relative_path() {
        assert_eq!(
            Module::from_relative_path("pkg/sub/mod.py"),
            Some(Module::new("pkg.sub.mod"))
        );
        assert_eq!(Module::from_relative_path("pkg/readme.md"), None);
        assert_eq!(Module::from_relative_path(".py"), None);
    }

    #[test]
    fn test_module_serializes_as_string() {
        let json = serde_json::to_string(&Module::new("a.b")).unwrap();
        assert_eq!(json, "\"a.b\"");
    }

    // =========================================================================
    // Discovery
    // =========================================================================

    #[test]
    fn test_discover_include_exclude_sorted() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), "pkg/zeta.py");
        touch(dir.path(), "pkg/alpha.py");
        touch(dir.path(), "pkg/sub/beta.py");
        touch(dir.path(), "pkg/tests/test_alpha.py");
        touch(dir.path(), "pkg/notes.txt");
        touch(dir.path(), "other/gamma.py");

        let config = modules_config(&["pkg/**/*.py"], &["**/tests/**"], None);
        let modules = discover_modules(dir.path(), &config).unwrap();

        assert_eq!(names(&modules), vec!["pkg.alpha", "pkg.sub.beta", "pkg.zeta"]);
    }

    #[test]
    fn test_discover_overlapping_patterns_dedupe() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), "a.py");

        let config = modules_config(&["*.py", "**/*.py"], &[], None);
        let modules = discover_modules(dir.path(), &config).unwrap();

        assert_eq!(names(&modules), vec!["a"]);
    }

    #[test]
    fn test_discover_truncates_after_sorting() {
        let dir = TempDir::new().unwrap();
        for name in ["c.py", "a.py", "b.py"] {
            touch(dir.path(), name);
        }

        let config = modules_config(&["*.py"], &[], Some(2));
        let modules = discover_modules(dir.path(), &config).unwrap();

        assert_eq!(names(&modules), vec!["a", "b"]);
    }

    #[test]
    fn test_discover_skips_hidden_and_cache_dirs() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), ".venv/lib/x.py");
        touch(dir.path(), "pkg/__pycache__/y.py");
        touch(dir.path(), "pkg/z.py");

        let config = modules_config(&["**/*.py"], &[], None);
        let modules = discover_modules(dir.path(), &config).unwrap();

        assert_eq!(names(&modules), vec!["pkg.z"]);
    }

    #[test]
    fn test_discover_nothing_matches() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), "a.py");
        let config = modules_config(&["src/**/*.py"], &[], None);
        assert!(discover_modules(dir.path(), &config).unwrap().is_empty());
    }
}
