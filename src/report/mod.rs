//! Evaluation report aggregation.
//!
//! Merges the coverage tool's JSON and the per-module mutation reports of
//! one evaluation pass into a single `report.json` (and a `report.html`
//! with one table row per module).

use crate::discovery::Module;
use crate::persist::write_json;
use anyhow::{Context, Result};
use askama::Template;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const COVERAGE_FILE: &str = "coverage.json";
pub const MUTATION_REPORT_FILE: &str = "report.json";
pub const REPORT_FILE: &str = "report.json";
pub const HTML_REPORT_FILE: &str = "report.html";

/// Mutant counters as written by the mutation tool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationCounts {
    #[serde(default)]
    pub total: u64,
    #[serde(default)]
    pub killed: u64,
    #[serde(default)]
    pub survived: u64,
    #[serde(default)]
    pub skipped: u64,
    #[serde(default)]
    pub suspicious: u64,
    #[serde(default)]
    pub timeout: u64,
}

impl MutationCounts {
    fn add(&mut self, other: &MutationCounts) {
        self.total += other.total;
        self.killed += other.killed;
        self.survived += other.survived;
        self.skipped += other.skipped;
        self.suspicious += other.suspicious;
        self.timeout += other.timeout;
    }

    pub fn killed_percent(&self) -> f64 {
        killed_percent(self.killed, self.total)
    }
}

/// The mutation tool writes either one counter object or a list of them.
#[derive(Deserialize)]
#[serde(untagged)]
enum MutationReportFile {
    One(MutationCounts),
    Many(Vec<MutationCounts>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleRow {
    pub module: Module,
    #[serde(flatten)]
    pub counts: MutationCounts,
    pub killed_percent: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageReport {
    pub total: u64,
    pub killed: u64,
    pub survived: u64,
    pub skipped: u64,
    pub suspicious: u64,
    pub timeout: u64,
    /// Global kill rate: sum of kills over sum of mutants
    pub killed_percent: f64,
    /// Mean of the per-module kill rates
    pub arithmetic_mean_killed: f64,
    /// `totals.percent_covered` of the coverage tool
    pub coverage: Option<f64>,
    pub modules: Vec<ModuleRow>,
}

pub fn killed_percent(killed: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        killed as f64 / total as f64 * 100.0
    }
}

/// Aggregate per-module counters.
///
/// Modules without any mutant have no kill rate and are left out of the
/// arithmetic mean.
pub fn aggregate(rows: Vec<(Module, MutationCounts)>, coverage: Option<f64>) -> StageReport {
    let mut sum = MutationCounts::default();
    let mut rates = Vec::new();
    let mut modules = Vec::with_capacity(rows.len());

    for (module, counts) in rows {
        sum.add(&counts);
        if counts.total > 0 {
            rates.push(counts.killed_percent());
        }
        modules.push(ModuleRow {
            module,
            counts,
            killed_percent: counts.killed_percent(),
        });
    }

    let arithmetic_mean_killed = if rates.is_empty() {
        0.0
    } else {
        rates.iter().sum::<f64>() / rates.len() as f64
    };

    StageReport {
        total: sum.total,
        killed: sum.killed,
        survived: sum.survived,
        skipped: sum.skipped,
        suspicious: sum.suspicious,
        timeout: sum.timeout,
        killed_percent: sum.killed_percent(),
        arithmetic_mean_killed,
        coverage,
        modules,
    }
}

/// Counters of one mutation report; an array is summed.
pub fn read_mutation_report(path: &Path) -> Result<MutationCounts> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read mutation report {:?}", path))?;
    let parsed: MutationReportFile = serde_json::from_str(&contents)
        .with_context(|| format!("Failed to parse mutation report {:?}", path))?;
    Ok(match parsed {
        MutationReportFile::One(counts) => counts,
        MutationReportFile::Many(all) => {
            let mut sum = MutationCounts::default();
            for counts in &all {
                sum.add(counts);
            }
            sum
        }
    })
}

/// `totals.percent_covered` from a coverage JSON report.
pub fn read_coverage(path: &Path) -> Result<f64> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read coverage report {:?}", path))?;
    let value: serde_json::Value = serde_json::from_str(&contents)
        .with_context(|| format!("Failed to parse coverage report {:?}", path))?;
    value
        .pointer("/totals/percent_covered")
        .and_then(serde_json::Value::as_f64)
        .with_context(|| format!("No totals.percent_covered in {:?}", path))
}

/// Paths inside one `report-<n>` directory.
#[derive(Debug, Clone)]
pub struct ReportDir {
    root: PathBuf,
}

impl ReportDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn coverage_dir(&self) -> PathBuf {
        self.root.join("coverage")
    }

    /// Data shared from the coverage run to the mutation runs
    pub fn share_dir(&self) -> PathBuf {
        self.root.join("share-data")
    }

    pub fn mutation_dir(&self, module: &Module) -> PathBuf {
        self.root.join("mutation").join(module.as_str())
    }

    pub fn report_file(&self) -> PathBuf {
        self.root.join(REPORT_FILE)
    }

    pub fn html_file(&self) -> PathBuf {
        self.root.join(HTML_REPORT_FILE)
    }

    /// Modules with a mutation directory, sorted.
    pub fn modules_on_disk(&self) -> Result<Vec<Module>> {
        let dir = self.root.join("mutation");
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut modules: Vec<Module> = std::fs::read_dir(&dir)
            .with_context(|| format!("Failed to read {:?}", dir))?
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().is_dir())
            .map(|entry| Module::new(entry.file_name().to_string_lossy()))
            .collect();
        modules.sort();
        Ok(modules)
    }

    /// Read whatever the tools left behind for `modules`.
    ///
    /// Missing or unreadable reports are logged and skipped.
    pub fn collect(&self, modules: &[Module]) -> StageReport {
        let coverage_path = self.coverage_dir().join(COVERAGE_FILE);
        let coverage = if coverage_path.exists() {
            match read_coverage(&coverage_path) {
                Ok(percent) => Some(percent),
                Err(e) => {
                    tracing::warn!("Ignoring coverage report: {:#}", e);
                    None
                }
            }
        } else {
            tracing::warn!("No coverage report at {}", coverage_path.display());
            None
        };

        let mut rows = Vec::new();
        for module in modules {
            let path = self.mutation_dir(module).join(MUTATION_REPORT_FILE);
            if !path.exists() {
                tracing::warn!("Result for {} does not exist", module);
                continue;
            }
            match read_mutation_report(&path) {
                Ok(counts) => rows.push((module.clone(), counts)),
                Err(e) => tracing::warn!("Ignoring mutation report of {}: {:#}", module, e),
            }
        }

        aggregate(rows, coverage)
    }

    /// Write `report.json` and `report.html`.
    pub fn write(&self, report: &StageReport) -> Result<()> {
        let path = self.report_file();
        write_json(&path, report).with_context(|| format!("Failed to write {:?}", path))?;
        let html = self.html_file();
        let rendered = render_html(report).context("Failed to render HTML report")?;
        std::fs::write(&html, rendered).with_context(|| format!("Failed to write {:?}", html))?;
        Ok(())
    }
}

/// One table of per-module rows under a single summary header.
#[derive(Template)]
#[template(path = "report.html")]
struct ReportTemplate<'a> {
    report: &'a StageReport,
}

pub fn render_html(report: &StageReport) -> askama::Result<String> {
    ReportTemplate { report }.render()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn counts(total: u64, killed: u64) -> MutationCounts {
        MutationCounts {
            total,
            killed,
            survived: total - killed,
            ..MutationCounts::default()
        }
    }

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 0.01
    }

    // =========================================================================
    // Aggregation
    // =========================================================================

    #[test]
    fn test_global_rate_differs_from_mean_rate() {
        let report = aggregate(
            vec![
                (Module::new("a"), counts(10, 5)),
                (Module::new("b"), counts(100, 80)),
            ],
            None,
        );

        assert_eq!(report.total, 110);
        assert_eq!(report.killed, 85);
        assert_eq!(report.survived, 25);
        assert!(approx(report.killed_percent, 77.27));
        assert!(approx(report.arithmetic_mean_killed, 65.0));
        assert_eq!(report.modules.len(), 2);
        assert!(approx(report.modules[0].killed_percent, 50.0));
    }

    #[test]
    fn test_equal_totals_give_equal_rates() {
        let report = aggregate(
            vec![(Module::new("a"), counts(10, 2)), (Module::new("b"), counts(10, 8))],
            None,
        );
        assert!(approx(report.killed_percent, report.arithmetic_mean_killed));
    }

    #[test]
    fn test_zero_total_module_not_in_mean() {
        let report = aggregate(
            vec![(Module::new("a"), counts(0, 0)), (Module::new("b"), counts(4, 3))],
            Some(81.5),
        );
        assert!(approx(report.arithmetic_mean_killed, 75.0));
        assert_eq!(report.coverage, Some(81.5));
    }

    #[test]
    fn test_empty_aggregate() {
        let report = aggregate(Vec::new(), None);
        assert_eq!(report.total, 0);
        assert_eq!(report.killed_percent, 0.0);
        assert_eq!(report.arithmetic_mean_killed, 0.0);
    }

    // =========================================================================
    // Tool output parsing
    // =========================================================================

    #[test]
    fn test_mutation_report_object_or_array() {
        let dir = TempDir::new().unwrap();
        let object = dir.path().join("one.json");
        std::fs::write(
            &object,
            r#"{"total": 7, "killed": 4, "survived": 2, "skipped": 0, "suspicious": 1, "timeout": 0}"#,
        )
        .unwrap();
        let array = dir.path().join("many.json");
        std::fs::write(
            &array,
            r#"[{"total": 3, "killed": 1, "timeout": 1}, {"total": 2, "killed": 2}]"#,
        )
        .unwrap();

        let one = read_mutation_report(&object).unwrap();
        assert_eq!((one.total, one.killed, one.suspicious), (7, 4, 1));

        let many = read_mutation_report(&array).unwrap();
        assert_eq!((many.total, many.killed, many.timeout), (5, 3, 1));
    }

    #[test]
    fn test_read_coverage() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("coverage.json");
        std::fs::write(&path, r#"{"meta": {}, "totals": {"percent_covered": 64.5}}"#).unwrap();
        assert_eq!(read_coverage(&path).unwrap(), 64.5);

        std::fs::write(&path, r#"{"totals": {}}"#).unwrap();
        assert!(read_coverage(&path).is_err());
    }

    // =========================================================================
    // Report directory
    // =========================================================================

    #[test]
    fn test_collect_and_write() {
        let dir = TempDir::new().unwrap();
        let report_dir = ReportDir::new(dir.path().join("report-1"));
        let a = Module::new("pkg.a");
        let b = Module::new("pkg.b");

        std::fs::create_dir_all(report_dir.coverage_dir()).unwrap();
        std::fs::write(
            report_dir.coverage_dir().join(COVERAGE_FILE),
            r#"{"totals": {"percent_covered": 50.0}}"#,
        )
        .unwrap();
        std::fs::create_dir_all(report_dir.mutation_dir(&a)).unwrap();
        std::fs::write(
            report_dir.mutation_dir(&a).join(MUTATION_REPORT_FILE),
            r#"{"total": 10, "killed": 5}"#,
        )
        .unwrap();

        std::fs::create_dir_all(report_dir.mutation_dir(&b)).unwrap();
        assert_eq!(report_dir.modules_on_disk().unwrap(), vec![a.clone(), b.clone()]);

        let report = report_dir.collect(&[a.clone(), b]);
        assert_eq!(report.modules.len(), 1);
        assert_eq!(report.modules[0].module, a);
        assert_eq!(report.coverage, Some(50.0));

        report_dir.write(&report).unwrap();
        let written: StageReport =
            serde_json::from_str(&std::fs::read_to_string(report_dir.report_file()).unwrap())
                .unwrap();
        assert_eq!(written, report);
        let html = std::fs::read_to_string(report_dir.html_file()).unwrap();
        assert!(html.contains("<h1>5 / 10 killed, arithmetic_mean: 50.0</h1>"));
        assert!(html.contains("<td>pkg.a</td>"));
    }

    #[test]
    fn test_html_report_rows_and_escaping() {
        let report = aggregate(
            vec![
                (Module::new("pkg.<b>&c"), counts(4, 3)),
                (Module::new("pkg.d"), counts(10, 5)),
            ],
            Some(40.5),
        );

        let html = render_html(&report).unwrap();

        assert!(html.contains("<h1>8 / 14 killed, arithmetic_mean: 62.5</h1>"));
        assert!(html.contains("<h2>coverage: 40.5%</h2>"));
        assert!(html.contains("<td>pkg.&lt;b&gt;&amp;c</td><td>4</td><td>3</td><td>1</td>"));
        assert!(!html.contains("<b>"));
        assert_eq!(html.matches("<tr><td>").count(), 2);
    }

    #[test]
    fn test_report_schema_fields() {
        let report = aggregate(vec![(Module::new("a"), counts(4, 1))], Some(10.0));
        let json = serde_json::to_value(&report).unwrap();
        for key in [
            "total",
            "killed",
            "survived",
            "skipped",
            "timeout",
            "killed_percent",
            "arithmetic_mean_killed",
            "coverage",
        ] {
            assert!(json.get(key).is_some(), "missing {}", key);
        }
        assert_eq!(json["modules"][0]["module"], "a");
        assert_eq!(json["modules"][0]["total"], 4);
    }
}
