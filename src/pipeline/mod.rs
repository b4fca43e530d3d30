//! Multi-stage run orchestration.
//!
//! Stages run strictly one after another. Inside a stage the per-module
//! work fans out over the [`WorkerPool`] and fans back in before the next
//! stage starts. Modules that fail in a stage are marked unhealthy in the
//! [`RunContext`] and skipped from then on; the rest of the run continues.

pub mod layout;
pub mod pool;
pub mod stages;

pub use layout::RunLayout;
pub use pool::{TaskPanicked, WorkerPool};
pub use stages::Pipeline;

use crate::discovery::Module;
use crate::sandbox::SandboxError;
use chrono::Utc;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Stage {
    BuildImage,
    GenerateTests,
    EvaluateFirst,
    SynthesizeHarnesses,
    RunFuzzCampaigns,
    RecreateRegression,
    GenerateSeededTests,
    EvaluateSecond,
    Done,
}

impl Stage {
    /// The stage after this one; without fuzzing the run ends after the
    /// first evaluation.
    pub fn next(self, fuzzing: bool) -> Stage {
        match self {
            Self::BuildImage => Self::GenerateTests,
            Self::GenerateTests => Self::EvaluateFirst,
            Self::EvaluateFirst if fuzzing => Self::SynthesizeHarnesses,
            Self::EvaluateFirst => Self::Done,
            Self::SynthesizeHarnesses => Self::RunFuzzCampaigns,
            Self::RunFuzzCampaigns => Self::RecreateRegression,
            Self::RecreateRegression => Self::GenerateSeededTests,
            Self::GenerateSeededTests => Self::EvaluateSecond,
            Self::EvaluateSecond | Self::Done => Self::Done,
        }
    }

    /// Directory name under `logs/`
    pub fn as_str(self) -> &'static str {
        match self {
            Self::BuildImage => "build-image",
            Self::GenerateTests => "generate-1",
            Self::EvaluateFirst => "evaluate-1",
            Self::SynthesizeHarnesses => "synthesize",
            Self::RunFuzzCampaigns => "fuzz",
            Self::RecreateRegression => "recreate",
            Self::GenerateSeededTests => "generate-2",
            Self::EvaluateSecond => "evaluate-2",
            Self::Done => "done",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Health {
    Healthy,
    Unhealthy { stage: Stage, reason: String },
}

/// Why one module dropped out of the run.
#[derive(Debug, Error)]
pub enum ModuleFailure {
    #[error("no fuzz harness could be synthesized")]
    NoHarness,

    #[error("fuzzing discovered no inputs")]
    NoCorpus,

    #[error("test function `{0}` not found")]
    FunctionNotFound(String),

    #[error("no tests to recreate")]
    NothingToRecreate,

    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    #[error(transparent)]
    Panicked(#[from] TaskPanicked),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl ModuleFailure {
    pub fn io(path: &std::path::Path) -> impl FnOnce(std::io::Error) -> Self {
        let path = path.to_path_buf();
        move |source| Self::Io { path, source }
    }

    pub fn is_interrupt(&self) -> bool {
        matches!(self, Self::Sandbox(SandboxError::Interrupted))
    }
}

/// Run-fatal conditions.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("no modules to test")]
    NoModules,

    #[error("failed to build image: {0}")]
    ImageBuild(#[source] SandboxError),

    #[error("run interrupted")]
    Interrupted,

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Explicit per-run state handed from stage to stage.
#[derive(Debug)]
pub struct RunContext {
    pub modules: Vec<Module>,
    pub health: BTreeMap<Module, Health>,
    pub reports: Vec<PathBuf>,
    pub stage: Stage,
    pub fuzzing: bool,
    started_at: chrono::DateTime<Utc>,
}

impl RunContext {
    pub fn new(modules: Vec<Module>, fuzzing: bool) -> Self {
        let health = modules
            .iter()
            .map(|m| (m.clone(), Health::Healthy))
            .collect();
        Self {
            modules,
            health,
            reports: Vec::new(),
            stage: Stage::BuildImage,
            fuzzing,
            started_at: Utc::now(),
        }
    }

    pub fn is_healthy(&self, module: &Module) -> bool {
        matches!(self.health.get(module), Some(Health::Healthy))
    }

    /// Mark `module` unhealthy; the first failure wins.
    pub fn mark_unhealthy(&mut self, module: &Module, stage: Stage, reason: &ModuleFailure) {
        if !self.is_healthy(module) {
            return;
        }
        tracing::warn!("Module {} failed in {}: {}", module, stage, reason);
        self.health.insert(
            module.clone(),
            Health::Unhealthy {
                stage,
                reason: reason.to_string(),
            },
        );
    }

    /// Healthy modules for `stage`, logging each one skipped.
    pub fn healthy_modules(&self, stage: Stage) -> Vec<Module> {
        self.modules
            .iter()
            .filter(|module| match self.health.get(*module) {
                Some(Health::Unhealthy {
                    stage: failed_in,
                    reason,
                }) => {
                    tracing::warn!(
                        "Skipping {} in {}: unhealthy since {} ({})",
                        module,
                        stage,
                        failed_in,
                        reason
                    );
                    false
                }
                _ => true,
            })
            .cloned()
            .collect()
    }

    pub fn summary(&self, interrupted: bool) -> RunSummary {
        RunSummary {
            started_at: self.started_at.to_rfc3339(),
            finished_at: Utc::now().to_rfc3339(),
            last_stage: self.stage,
            fuzzing: self.fuzzing,
            interrupted,
            modules: self.health.clone(),
            reports: self.reports.clone(),
        }
    }
}

/// Contents of `summary.json`.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub started_at: String,
    pub finished_at: String,
    pub last_stage: Stage,
    pub fuzzing: bool,
    pub interrupted: bool,
    pub modules: BTreeMap<Module, Health>,
    pub reports: Vec<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    // =========================================================================
    // Stage transitions
    // =========================================================================

    #[test]
    fn test_stage_sequence_with_fuzzing() {
        let mut stage = Stage::BuildImage;
        let mut seen = vec![stage];
        while stage != Stage::Done {
            stage = stage.next(true);
            seen.push(stage);
        }
        assert_eq!(
            seen,
            vec![
                Stage::BuildImage,
                Stage::GenerateTests,
                Stage::EvaluateFirst,
                Stage::SynthesizeHarnesses,
                Stage::RunFuzzCampaigns,
                Stage::RecreateRegression,
                Stage::GenerateSeededTests,
                Stage::EvaluateSecond,
                Stage::Done,
            ]
        );
    }

    #[test]
    fn test_fuzzing_disabled_ends_after_first_evaluation() {
        assert_eq!(Stage::EvaluateFirst.next(false), Stage::Done);
        assert_eq!(Stage::Done.next(true), Stage::Done);
    }

    // =========================================================================
    // Run context
    // =========================================================================

    #[test]
    fn test_unhealthy_modules_skipped() {
        let a = Module::new("a");
        let b = Module::new("b");
        let mut ctx = RunContext::new(vec![a.clone(), b.clone()], true);

        ctx.mark_unhealthy(&a, Stage::SynthesizeHarnesses, &ModuleFailure::NoHarness);

        assert!(!ctx.is_healthy(&a));
        assert_eq!(ctx.healthy_modules(Stage::RunFuzzCampaigns), vec![b]);
    }

    #[test]
    fn test_first_failure_wins() {
        let a = Module::new("a");
        let mut ctx = RunContext::new(vec![a.clone()], true);

        ctx.mark_unhealthy(&a, Stage::RunFuzzCampaigns, &ModuleFailure::NoCorpus);
        ctx.mark_unhealthy(&a, Stage::RecreateRegression, &ModuleFailure::NothingToRecreate);

        assert_eq!(
            ctx.health[&a],
            Health::Unhealthy {
                stage: Stage::RunFuzzCampaigns,
                reason: "fuzzing discovered no inputs".into(),
            }
        );
    }

    #[test]
    fn test_summary_serialization() {
        let a = Module::new("pkg.a");
        let mut ctx = RunContext::new(vec![a.clone(), Module::new("pkg.b")], false);
        ctx.mark_unhealthy(&a, Stage::RunFuzzCampaigns, &ModuleFailure::NoCorpus);

        let json = serde_json::to_value(ctx.summary(false)).unwrap();

        assert_eq!(json["modules"]["pkg.a"]["status"], "unhealthy");
        assert_eq!(json["modules"]["pkg.a"]["stage"], "run-fuzz-campaigns");
        assert_eq!(json["modules"]["pkg.b"]["status"], "healthy");
        assert_eq!(json["last_stage"], "build-image");
        assert!(json["started_at"].as_str().is_some());
    }
}
