mod config;
mod discovery;
mod fuzz;
mod harness;
mod interrupt;
mod persist;
mod pipeline;
mod python;
mod regression;
mod report;
mod sandbox;

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use crate::config::Config;
use crate::discovery::discover_modules;
use crate::interrupt::Interrupt;
use crate::pipeline::{Pipeline, PipelineError, RunLayout, WorkerPool};
use crate::report::ReportDir;
use crate::sandbox::{DockerCli, Executor};

/// Exit status of a run stopped by Ctrl-C.
const INTERRUPTED_EXIT_CODE: u8 = 130;

#[derive(Parser)]
#[command(name = "fuzzgraft")]
#[command(version)]
#[command(about = "Generate, fuzz and strengthen Python test suites in sandboxes")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full pipeline
    Run {
        /// Stop after the first evaluation
        #[arg(long)]
        no_fuzzing: bool,

        /// Worker pool size (overrides the config)
        #[arg(short, long)]
        workers: Option<usize>,
    },
    /// List the modules selected for testing
    Modules,
    /// Turn the tests of one file into fuzz harnesses
    Synthesize {
        file: PathBuf,

        #[arg(short, long)]
        out: PathBuf,
    },
    /// Rebuild regression tests of one file from decoded fuzz corpora
    Recreate {
        file: PathBuf,

        /// Directory holding `<harness>/<harness>.json` corpora
        #[arg(short, long)]
        results: PathBuf,

        #[arg(short, long)]
        out: PathBuf,
    },
    /// Re-aggregate the tool outputs of an evaluation directory
    Report { dir: PathBuf },
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    let config_path = cli.config.clone().or_else(Config::default_config_path);
    let mut config = Config::load(cli.config.as_deref())?;

    // Initialize logging
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.general.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    tracing::debug!(
        "Config path: {}",
        config_path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none, using defaults)".to_string())
    );

    match cli.command.unwrap_or(Commands::Run {
        no_fuzzing: false,
        workers: None,
    }) {
        Commands::Run {
            no_fuzzing,
            workers,
        } => {
            if no_fuzzing {
                config.fuzzing.enabled = false;
            }
            if let Some(workers) = workers {
                config.workers = workers;
            }
            return run(config).await;
        }
        Commands::Modules => {
            let root = config.target_root()?;
            for module in discover_modules(&root, &config.modules)? {
                println!("{}", module);
            }
        }
        Commands::Synthesize { file, out } => {
            let written = harness::write_harnesses(&file, &out)?;
            if written.is_empty() {
                tracing::info!("No eligible test functions in {}", file.display());
            }
            for path in written {
                println!("{}", path.display());
            }
        }
        Commands::Recreate { file, results, out } => {
            match regression::recreate_file(&file, &results, &out)? {
                Some(count) => println!("{} regression tests written to {}", count, out.display()),
                None => println!("No tests to recreate"),
            }
        }
        Commands::Report { dir } => {
            let report_dir = ReportDir::new(dir);
            let modules = report_dir.modules_on_disk()?;
            let report = report_dir.collect(&modules);
            report_dir.write(&report)?;
            println!(
                "{}",
                serde_json::to_string_pretty(&report).context("Failed to serialize report")?
            );
        }
    }

    Ok(ExitCode::SUCCESS)
}

async fn run(config: Config) -> anyhow::Result<ExitCode> {
    let interrupt = Interrupt::new();
    {
        let interrupt = interrupt.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                interrupt.trigger();
            }
        });
    }

    let target_root = config.target_root()?;
    let modules = discover_modules(&target_root, &config.modules)?;
    let working_dir = config.resolve_working_dir()?;
    let workers = config.resolve_workers().await;
    let image = config.image_build()?;
    tracing::info!("Target root: {}", target_root.display());
    tracing::info!("Working directory: {}", working_dir.display());

    let executor = Executor::new(Arc::new(DockerCli::default()), interrupt);
    let pipeline = Pipeline::new(
        config,
        image,
        RunLayout::new(working_dir),
        executor,
        WorkerPool::new(workers),
    );

    match pipeline.run(modules).await {
        Ok(summary) => {
            for report in &summary.reports {
                tracing::info!("Report written to {}", report.display());
            }
            Ok(ExitCode::SUCCESS)
        }
        Err(PipelineError::Interrupted) => {
            tracing::error!("Run interrupted");
            Ok(ExitCode::from(INTERRUPTED_EXIT_CODE))
        }
        Err(e) => Err(e.into()),
    }
}
