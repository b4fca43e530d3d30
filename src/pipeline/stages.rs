//! The pipeline stages.

use super::layout::{python_files, rename_second_pass};
use super::{
    ModuleFailure, PipelineError, RunContext, RunLayout, RunSummary, Stage, TaskPanicked,
    WorkerPool,
};
use crate::config::Config;
use crate::discovery::Module;
use crate::fuzz::corpus::{corpus_file, decode_dir, load_reader, raw_corpus_dir, write_corpus};
use crate::harness::write_harnesses;
use crate::persist::write_json;
use crate::regression::{recreate_file, RecreateError};
use crate::sandbox::{ExecutionResult, Executor, ImageBuild, Mount, SandboxError, WorkItem};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

// Container-side paths.
const GENERATED_TESTS_MOUNT: &str = "/workplace/pynguin-results";
const SEED_TESTS_MOUNT: &str = "/workplace/seed-tests";
const TESTS_MOUNT: &str = "/workplace/tests";
const COVERAGE_MOUNT: &str = "/workplace/cov_report";
const SHARE_MOUNT: &str = "/workplace/share_data";
const MUTATION_MOUNT: &str = "/workplace/mutmut_report";
const HARNESS_MOUNT: &str = "/workplace/harnesses";
const RESULTS_MOUNT: &str = "/workplace/fuzz-results";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pass {
    First,
    Second,
}

struct Shared {
    config: Config,
    image: ImageBuild,
    layout: RunLayout,
    executor: Executor,
}

pub struct Pipeline {
    shared: Arc<Shared>,
    pool: WorkerPool,
}

type ToolOutcome = Result<Result<ExecutionResult, SandboxError>, TaskPanicked>;
type ModuleOutcome = Result<Result<usize, ModuleFailure>, TaskPanicked>;

impl Pipeline {
    pub fn new(
        config: Config,
        image: ImageBuild,
        layout: RunLayout,
        executor: Executor,
        pool: WorkerPool,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                image,
                layout,
                executor,
            }),
            pool,
        }
    }

    /// Run every stage for `modules` and write `summary.json`.
    ///
    /// The summary is written whether the run completes or not.
    pub async fn run(&self, modules: Vec<Module>) -> Result<RunSummary, PipelineError> {
        if modules.is_empty() {
            tracing::error!("No modules to test");
            return Err(PipelineError::NoModules);
        }
        let layout = &self.shared.layout;
        layout.create(&modules).map_err(|source| PipelineError::Io {
            path: layout.root().to_path_buf(),
            source,
        })?;
        tracing::info!(
            "Testing {} modules in {} with {} workers",
            modules.len(),
            layout.root().display(),
            self.pool.workers()
        );

        let mut ctx = RunContext::new(modules, self.shared.config.fuzzing.enabled);
        let result = self.run_stages(&mut ctx).await;

        let summary = ctx.summary(matches!(result, Err(PipelineError::Interrupted)));
        let path = layout.summary_file();
        if let Err(source) = write_json(&path, &summary) {
            if result.is_ok() {
                return Err(PipelineError::Io { path, source });
            }
            tracing::warn!("Failed to write {}: {}", path.display(), source);
        }
        result.map(|()| summary)
    }

    async fn run_stages(&self, ctx: &mut RunContext) -> Result<(), PipelineError> {
        let mut stage = Stage::BuildImage;
        while stage != Stage::Done {
            if self.shared.executor.interrupt().is_triggered() {
                return Err(PipelineError::Interrupted);
            }
            ctx.stage = stage;
            tracing::info!("Stage {}", stage);

            match stage {
                Stage::BuildImage => self.build_image().await?,
                Stage::GenerateTests => self.generate(ctx, Pass::First).await?,
                Stage::EvaluateFirst => self.evaluate(ctx, Pass::First).await?,
                Stage::SynthesizeHarnesses => self.synthesize(ctx).await?,
                Stage::RunFuzzCampaigns => self.fuzz(ctx).await?,
                Stage::RecreateRegression => self.recreate(ctx).await?,
                Stage::GenerateSeededTests => self.generate(ctx, Pass::Second).await?,
                Stage::EvaluateSecond => self.evaluate(ctx, Pass::Second).await?,
                Stage::Done => {}
            }
            stage = stage.next(ctx.fuzzing);
        }
        ctx.stage = Stage::Done;
        tracing::info!("Run finished, {} reports written", ctx.reports.len());
        Ok(())
    }

    async fn build_image(&self) -> Result<(), PipelineError> {
        let shared = &self.shared;
        let log_path = shared.layout.log_file(Stage::BuildImage, "build");
        match shared.executor.build_image(&shared.image, &log_path).await {
            Ok(()) => Ok(()),
            Err(SandboxError::Interrupted) => Err(PipelineError::Interrupted),
            Err(e) => {
                tracing::error!("Image build failed, see {}", log_path.display());
                Err(PipelineError::ImageBuild(e))
            }
        }
    }

    /// Run sandboxed tool items over the pool.
    async fn run_tools(&self, items: Vec<(Module, WorkItem)>) -> Vec<(Module, ToolOutcome)> {
        let executor = self.shared.executor.clone();
        self.pool
            .run_all(items, move |(_, item)| {
                let executor = executor.clone();
                async move { executor.run(&item).await }
            })
            .await
            .into_iter()
            .map(|((module, _), outcome)| (module, outcome))
            .collect()
    }

    async fn generate(&self, ctx: &mut RunContext, pass: Pass) -> Result<(), PipelineError> {
        let shared = &self.shared;
        let (stage, modules) = match pass {
            Pass::First => (Stage::GenerateTests, ctx.modules.clone()),
            Pass::Second => (
                Stage::GenerateSeededTests,
                ctx.healthy_modules(Stage::GenerateSeededTests),
            ),
        };
        let budgets = &shared.config.budgets;
        let (seconds, iterations) = match pass {
            Pass::First => (
                budgets.first_generation_seconds,
                budgets.first_generation_iterations,
            ),
            Pass::Second => (
                budgets.second_generation_seconds,
                budgets.second_generation_iterations,
            ),
        };

        let items = modules
            .iter()
            .map(|module| {
                let out_dir = match pass {
                    Pass::First => shared.layout.tests_dir(module),
                    Pass::Second => shared.layout.final_tests_dir(module),
                };
                let mut item = WorkItem::new(
                    "generate",
                    &shared.image.tag,
                    &shared.config.tools.generate,
                )
                    .module(module.clone())
                    .mount(Mount::read_write(out_dir, GENERATED_TESTS_MOUNT))
                    .env("module_name", module)
                    .env("maximum_search_time", seconds)
                    .env("maximum_iterations", iterations)
                    .env("output_dir", GENERATED_TESTS_MOUNT)
                    .timeout(budgets.timeout(seconds))
                    .log_path(shared.layout.log_file(stage, module.as_str()));
                if pass == Pass::Second {
                    item = item
                        .mount(Mount::read_only(
                            shared.layout.regression_dir(module),
                            SEED_TESTS_MOUNT,
                        ))
                        .env("seed_dir", SEED_TESTS_MOUNT);
                }
                (module.clone(), item)
            })
            .collect();

        let outcomes = self.run_tools(items).await;
        let interrupted = log_tool_outcomes(stage, &outcomes);
        if interrupted {
            return Err(PipelineError::Interrupted);
        }

        if pass == Pass::Second {
            for module in &modules {
                let dir = shared.layout.final_tests_dir(module);
                if let Err(source) = rename_second_pass(&dir) {
                    ctx.mark_unhealthy(module, stage, &ModuleFailure::Io { path: dir, source });
                }
            }
        }
        Ok(())
    }

    /// Coverage over every test directory of the pass, then one mutation
    /// run per module, then the merged report.
    async fn evaluate(&self, ctx: &mut RunContext, pass: Pass) -> Result<(), PipelineError> {
        let shared = &self.shared;
        let layout = &shared.layout;
        let (stage, number, modules, test_roots) = match pass {
            Pass::First => (
                Stage::EvaluateFirst,
                1,
                ctx.modules.clone(),
                vec![layout.tests_root()],
            ),
            Pass::Second => (
                Stage::EvaluateSecond,
                2,
                ctx.healthy_modules(Stage::EvaluateSecond),
                vec![layout.tests_root(), layout.final_tests_root()],
            ),
        };
        let report_dir = layout.report_dir(number);
        let mut dirs = vec![report_dir.coverage_dir(), report_dir.share_dir()];
        dirs.extend(modules.iter().map(|m| report_dir.mutation_dir(m)));
        for dir in dirs {
            std::fs::create_dir_all(&dir)
                .map_err(|source| PipelineError::Io { path: dir, source })?;
        }

        let budgets = &shared.config.budgets;
        let timeout = budgets.timeout(budgets.mutation_seconds);
        let with_tests = |mut item: WorkItem| {
            for (i, root) in test_roots.iter().enumerate() {
                item = item.mount(Mount::read_only(root, format!("{}/{}", TESTS_MOUNT, i)));
            }
            item
        };

        let coverage = with_tests(
            WorkItem::new("coverage", &shared.image.tag, &shared.config.tools.coverage)
                .mount(Mount::read_write(report_dir.coverage_dir(), COVERAGE_MOUNT))
                .mount(Mount::read_write(report_dir.share_dir(), SHARE_MOUNT))
                .timeout(timeout)
                .log_path(layout.log_file(stage, "coverage")),
        );
        match shared.executor.run(&coverage).await {
            Err(SandboxError::Interrupted) => return Err(PipelineError::Interrupted),
            Err(e) => tracing::warn!("Coverage run in {} failed: {}", stage, e),
            Ok(result) if !result.success() => {
                tracing::warn!("Coverage run in {} exited with {}", stage, result.exit_code)
            }
            Ok(_) => {}
        }

        let items = modules
            .iter()
            .map(|module| {
                let item = with_tests(
                    WorkItem::new("mutation", &shared.image.tag, &shared.config.tools.mutation)
                        .module(module.clone())
                        .mount(Mount::read_only(report_dir.share_dir(), SHARE_MOUNT))
                        .mount(Mount::read_write(report_dir.mutation_dir(module), MUTATION_MOUNT))
                        .env("module_name", module)
                        .timeout(timeout)
                        .log_path(layout.log_file(stage, module.as_str())),
                );
                (module.clone(), item)
            })
            .collect();
        let outcomes = self.run_tools(items).await;
        if log_tool_outcomes(stage, &outcomes) {
            return Err(PipelineError::Interrupted);
        }

        let report = report_dir.collect(&modules);
        tracing::info!(
            "Report {}: {} / {} killed ({:.2}%), arithmetic mean {:.2}%",
            number,
            report.killed,
            report.total,
            report.killed_percent,
            report.arithmetic_mean_killed
        );
        match report_dir.write(&report) {
            Ok(()) => ctx.reports.push(report_dir.report_file()),
            Err(e) => tracing::warn!("Failed to write report {}: {:#}", number, e),
        }
        Ok(())
    }

    async fn synthesize(&self, ctx: &mut RunContext) -> Result<(), PipelineError> {
        let stage = Stage::SynthesizeHarnesses;
        let shared = Arc::clone(&self.shared);
        let outcomes = self
            .pool
            .run_all(ctx.healthy_modules(stage), move |module| {
                let shared = Arc::clone(&shared);
                async move {
                    blocking(move || synthesize_module(&shared.layout, &module)).await
                }
            })
            .await;
        settle(ctx, stage, outcomes)
    }

    async fn fuzz(&self, ctx: &mut RunContext) -> Result<(), PipelineError> {
        let stage = Stage::RunFuzzCampaigns;
        let layout = &self.shared.layout;
        let mut items = Vec::new();
        for module in ctx.healthy_modules(stage) {
            let dir = layout.harness_dir(&module);
            match python_files(&dir) {
                Ok(harnesses) if harnesses.is_empty() => {
                    ctx.mark_unhealthy(&module, stage, &ModuleFailure::NoHarness)
                }
                Ok(harnesses) => {
                    items.extend(harnesses.into_iter().map(|h| (module.clone(), h)))
                }
                Err(source) => {
                    ctx.mark_unhealthy(&module, stage, &ModuleFailure::Io { path: dir, source })
                }
            }
        }

        let shared = Arc::clone(&self.shared);
        let outcomes = self
            .pool
            .run_all(items, move |(module, harness)| {
                let shared = Arc::clone(&shared);
                async move { fuzz_harness(&shared, &module, &harness).await }
            })
            .await;

        let mut discovered: BTreeMap<Module, usize> = BTreeMap::new();
        let mut interrupted = false;
        for ((module, harness), outcome) in outcomes {
            let found = discovered.entry(module.clone()).or_default();
            match outcome.map_err(ModuleFailure::from).and_then(|r| r) {
                Ok(count) => *found += count,
                Err(failure) if failure.is_interrupt() => interrupted = true,
                Err(failure) => {
                    tracing::warn!("Fuzzing {} of {} failed: {}", harness.display(), module, failure)
                }
            }
        }
        if interrupted {
            return Err(PipelineError::Interrupted);
        }

        for (module, count) in discovered {
            if count == 0 {
                ctx.mark_unhealthy(&module, stage, &ModuleFailure::NoCorpus);
            } else {
                tracing::info!("Fuzzing discovered {} inputs for {}", count, module);
            }
        }
        Ok(())
    }

    async fn recreate(&self, ctx: &mut RunContext) -> Result<(), PipelineError> {
        let stage = Stage::RecreateRegression;
        let shared = Arc::clone(&self.shared);
        let outcomes = self
            .pool
            .run_all(ctx.healthy_modules(stage), move |module| {
                let shared = Arc::clone(&shared);
                async move {
                    blocking(move || recreate_module(&shared.layout, &module)).await
                }
            })
            .await;
        settle(ctx, stage, outcomes)
    }
}

/// Log every tool outcome; true if any run was interrupted.
fn log_tool_outcomes(stage: Stage, outcomes: &[(Module, ToolOutcome)]) -> bool {
    let mut interrupted = false;
    for (module, outcome) in outcomes {
        match outcome {
            Ok(Ok(result)) if !result.success() => {
                tracing::warn!("{} of {} exited with {}", stage, module, result.exit_code)
            }
            Ok(Ok(_)) => {}
            Ok(Err(SandboxError::Interrupted)) => interrupted = true,
            Ok(Err(e)) => tracing::warn!("{} of {} failed: {}", stage, module, e),
            Err(e) => tracing::warn!("{} of {} failed: {}", stage, module, e),
        }
    }
    interrupted
}

/// Fan in the outcomes of in-process module jobs.
fn settle(
    ctx: &mut RunContext,
    stage: Stage,
    outcomes: Vec<(Module, ModuleOutcome)>,
) -> Result<(), PipelineError> {
    let mut interrupted = false;
    for (module, outcome) in outcomes {
        match outcome.map_err(ModuleFailure::from).and_then(|r| r) {
            Ok(_) => {}
            Err(failure) if failure.is_interrupt() => interrupted = true,
            Err(failure) => ctx.mark_unhealthy(&module, stage, &failure),
        }
    }
    if interrupted {
        return Err(PipelineError::Interrupted);
    }
    Ok(())
}

fn synthesize_module(layout: &RunLayout, module: &Module) -> Result<usize, ModuleFailure> {
    let tests_dir = layout.tests_dir(module);
    let out_dir = layout.harness_dir(module);
    let mut written = 0;
    for file in python_files(&tests_dir).map_err(ModuleFailure::io(&tests_dir))? {
        match write_harnesses(&file, &out_dir) {
            Ok(paths) => written += paths.len(),
            Err(e) => tracing::warn!("Skipping {} of {}: {}", file.display(), module, e),
        }
    }
    if written == 0 {
        return Err(ModuleFailure::NoHarness);
    }
    tracing::info!("Synthesized {} harnesses for {}", written, module);
    Ok(written)
}

/// Run one fuzz campaign and decode whatever inputs it retained, also when
/// the campaign timed out or failed.
async fn fuzz_harness(
    shared: &Shared,
    module: &Module,
    harness: &Path,
) -> Result<usize, ModuleFailure> {
    let layout = &shared.layout;
    let budgets = &shared.config.budgets;
    let stem = harness
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let results = layout.fuzz_results_dir(module);
    let corpus_dir = raw_corpus_dir(&results, &stem);
    tokio::fs::create_dir_all(&corpus_dir)
        .await
        .map_err(ModuleFailure::io(&corpus_dir))?;

    let command = format!(
        "{} {}/{}.py -atheris_runs={} -max_total_time={} {}/corpus",
        shared.config.tools.fuzz,
        HARNESS_MOUNT,
        stem,
        budgets.fuzz_iterations,
        budgets.fuzz_seconds,
        RESULTS_MOUNT
    );
    let log_path: PathBuf = layout
        .logs_dir(Stage::RunFuzzCampaigns)
        .join(module.as_str())
        .join(format!("{}.log", stem));
    let item = WorkItem::new("fuzz", &shared.image.tag, command)
        .module(module.clone())
        .mount(Mount::read_only(layout.harness_dir(module), HARNESS_MOUNT))
        .mount(Mount::read_write(results.join(&stem), RESULTS_MOUNT))
        .env("test_name", &stem)
        .env("atheris_runs", budgets.fuzz_iterations)
        .env("atheris_max_run_time", budgets.fuzz_seconds)
        .timeout(budgets.timeout(budgets.fuzz_seconds))
        .log_path(log_path);

    match shared.executor.run(&item).await {
        Ok(result) if !result.success() => {
            tracing::warn!("Fuzzing {} exited with {}", stem, result.exit_code)
        }
        Ok(_) => {}
        Err(SandboxError::Interrupted) => return Err(SandboxError::Interrupted.into()),
        Err(e) => tracing::warn!("Fuzzing {} failed: {}", stem, e),
    }

    let harness = harness.to_path_buf();
    let out = corpus_file(&results, &stem);
    blocking(move || decode_corpus(&harness, &corpus_dir, &out)).await
}

/// Replay the harness reader over every raw input and write the corpus file.
fn decode_corpus(harness: &Path, corpus_dir: &Path, out: &Path) -> Result<usize, ModuleFailure> {
    let reader = load_reader(harness).map_err(ModuleFailure::io(harness))?;
    let entries = decode_dir(&reader, corpus_dir).map_err(ModuleFailure::io(corpus_dir))?;
    write_corpus(out, &entries).map_err(ModuleFailure::io(out))?;
    tracing::debug!(
        "{} inputs retained by {} ({} bindings each)",
        entries.len(),
        harness.display(),
        reader.steps().len()
    );
    Ok(entries.len())
}

/// Run synchronous filesystem and parsing work on the blocking pool.
async fn blocking<T, F>(work: F) -> Result<T, ModuleFailure>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, ModuleFailure> + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| ModuleFailure::Panicked(TaskPanicked(e.to_string())))?
}

fn recreate_module(layout: &RunLayout, module: &Module) -> Result<usize, ModuleFailure> {
    let tests_dir = layout.tests_dir(module);
    let results = layout.fuzz_results_dir(module);
    let out_dir = layout.regression_dir(module);
    let mut recreated = 0;
    for file in python_files(&tests_dir).map_err(ModuleFailure::io(&tests_dir))? {
        let Some(name) = file.file_name() else {
            continue;
        };
        match recreate_file(&file, &results, &out_dir.join(name)) {
            Ok(Some(count)) => recreated += count,
            Ok(None) => {}
            Err(RecreateError::FunctionNotFound(name)) => {
                return Err(ModuleFailure::FunctionNotFound(name))
            }
            Err(e) => tracing::warn!("Skipping {} of {}: {}", file.display(), module, e),
        }
    }
    if recreated == 0 {
        return Err(ModuleFailure::NothingToRecreate);
    }
    tracing::info!("Recreated {} regression tests for {}", recreated, module);
    Ok(recreated)
}
