use crate::sandbox::ImageBuild;
use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use sysinfo::System;

/// File name looked up in the current directory.
pub const LOCAL_CONFIG_FILE: &str = "fuzzgraft.toml";

/// Build argument naming the project directory to copy into the image.
const TARGET_PROGRAM_ROOT_ARG: &str = "TARGET_PROGRAM_ROOT";

/// `working_dir` value that asks for a fresh `./working_dir_<n>`.
pub const DEFAULT_WORKING_DIR: &str = "DEFAULT";

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Root of the Python project under test
    #[serde(default = "default_target_root")]
    pub target_root: PathBuf,

    /// Per-run working directory; absent or `"DEFAULT"` picks a fresh one
    #[serde(default)]
    pub working_dir: Option<String>,

    /// Worker pool size; 0 derives it from idle CPU capacity
    #[serde(default)]
    pub workers: usize,

    /// General settings
    #[serde(default)]
    pub general: GeneralConfig,

    /// Which modules of the target to test
    #[serde(default)]
    pub modules: ModulesConfig,

    /// Sandbox image build settings
    #[serde(default)]
    pub image: ImageConfig,

    /// Per-tool time and iteration budgets
    #[serde(default)]
    pub budgets: BudgetsConfig,

    #[serde(default)]
    pub fuzzing: FuzzingConfig,

    /// Commands run inside the sandbox for each tool
    #[serde(default)]
    pub tools: ToolsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModulesConfig {
    /// Glob patterns, relative to the target root, selecting module files
    #[serde(default = "default_include")]
    pub include: Vec<String>,

    /// Glob patterns removing files from the selection
    #[serde(default = "default_exclude")]
    pub exclude: Vec<String>,

    /// Keep at most this many modules after sorting
    #[serde(default)]
    pub max: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageConfig {
    #[serde(default = "default_image_tag")]
    pub tag: String,

    /// Dockerfile path, relative to the build context
    #[serde(default = "default_dockerfile")]
    pub dockerfile: PathBuf,

    /// Build context directory
    #[serde(default = "default_context")]
    pub context: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetsConfig {
    #[serde(default = "default_generation_seconds")]
    pub first_generation_seconds: u64,

    #[serde(default = "default_generation_iterations")]
    pub first_generation_iterations: u64,

    #[serde(default = "default_generation_seconds")]
    pub second_generation_seconds: u64,

    #[serde(default = "default_generation_iterations")]
    pub second_generation_iterations: u64,

    #[serde(default = "default_mutation_seconds")]
    pub mutation_seconds: u64,

    #[serde(default = "default_fuzz_seconds")]
    pub fuzz_seconds: u64,

    #[serde(default = "default_fuzz_iterations")]
    pub fuzz_iterations: u64,

    /// Slack added to every tool budget before the sandbox is stopped
    #[serde(default = "default_grace_seconds")]
    pub grace_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FuzzingConfig {
    /// Run harness synthesis, fuzzing, recreation and the second pass
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Test generator; reads `module_name`, `maximum_search_time`,
    /// `maximum_iterations`
    #[serde(default = "default_generate_command")]
    pub generate: String,

    /// Coverage run over every mounted test directory
    #[serde(default = "default_coverage_command")]
    pub coverage: String,

    /// Mutation run for one module; reads `module_name`
    #[serde(default = "default_mutation_command")]
    pub mutation: String,

    /// Interpreter that runs a fuzz harness
    #[serde(default = "default_fuzz_command")]
    pub fuzz: String,
}

// Default value functions
fn default_target_root() -> PathBuf {
    PathBuf::from(".")
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_include() -> Vec<String> {
    vec!["**/*.py".to_string()]
}

fn default_exclude() -> Vec<String> {
    vec![
        "**/tests/**".to_string(),
        "**/test_*.py".to_string(),
        "setup.py".to_string(),
    ]
}

fn default_image_tag() -> String {
    "fuzzgraft:latest".to_string()
}

fn default_dockerfile() -> PathBuf {
    PathBuf::from("docker/Dockerfile")
}

fn default_context() -> PathBuf {
    PathBuf::from(".")
}

fn default_generation_seconds() -> u64 {
    600
}

fn default_generation_iterations() -> u64 {
    1000
}

fn default_mutation_seconds() -> u64 {
    1800
}

fn default_fuzz_seconds() -> u64 {
    300
}

fn default_fuzz_iterations() -> u64 {
    100_000
}

fn default_grace_seconds() -> u64 {
    300
}

fn default_enabled() -> bool {
    true
}

fn default_generate_command() -> String {
    "bash /usr/src/scripts/create_test_with_pynguin.sh".to_string()
}

fn default_coverage_command() -> String {
    "bash /usr/src/scripts/create_cov_report.sh".to_string()
}

fn default_mutation_command() -> String {
    "bash /usr/src/scripts/evaluate_with_mutmut.sh".to_string()
}

fn default_fuzz_command() -> String {
    "python".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            target_root: default_target_root(),
            working_dir: None,
            workers: 0,
            general: GeneralConfig::default(),
            modules: ModulesConfig::default(),
            image: ImageConfig::default(),
            budgets: BudgetsConfig::default(),
            fuzzing: FuzzingConfig::default(),
            tools: ToolsConfig::default(),
        }
    }
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

impl Default for ModulesConfig {
    fn default() -> Self {
        Self {
            include: default_include(),
            exclude: default_exclude(),
            max: None,
        }
    }
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            tag: default_image_tag(),
            dockerfile: default_dockerfile(),
            context: default_context(),
        }
    }
}

impl Default for BudgetsConfig {
    fn default() -> Self {
        Self {
            first_generation_seconds: default_generation_seconds(),
            first_generation_iterations: default_generation_iterations(),
            second_generation_seconds: default_generation_seconds(),
            second_generation_iterations: default_generation_iterations(),
            mutation_seconds: default_mutation_seconds(),
            fuzz_seconds: default_fuzz_seconds(),
            fuzz_iterations: default_fuzz_iterations(),
            grace_seconds: default_grace_seconds(),
        }
    }
}

impl Default for FuzzingConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
        }
    }
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            generate: default_generate_command(),
            coverage: default_coverage_command(),
            mutation: default_mutation_command(),
            fuzz: default_fuzz_command(),
        }
    }
}

impl BudgetsConfig {
    /// Sandbox timeout for a tool budget: the budget plus the grace period.
    pub fn timeout(&self, budget_seconds: u64) -> Duration {
        Duration::from_secs(budget_seconds.saturating_add(self.grace_seconds))
    }
}

impl Config {
    /// Load configuration from file, or use defaults if not found
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = path.map(PathBuf::from).or_else(Self::default_config_path);

        let config = if let Some(ref path) = config_path {
            if path.exists() {
                let contents = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read config from {:?}", path))?;
                toml::from_str(&contents)
                    .with_context(|| format!("Failed to parse config from {:?}", path))?
            } else {
                Config::default()
            }
        } else {
            Config::default()
        };

        Ok(config)
    }

    /// `./fuzzgraft.toml` if present, else the platform config file
    pub fn default_config_path() -> Option<PathBuf> {
        let local = PathBuf::from(LOCAL_CONFIG_FILE);
        if local.exists() {
            return Some(local);
        }
        ProjectDirs::from("com", "fuzzgraft", "fuzzgraft")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Absolute target root
    pub fn target_root(&self) -> Result<PathBuf> {
        absolute(&self.target_root)
    }

    /// Absolute working directory for this run.
    ///
    /// Absent or `"DEFAULT"` picks the first `./working_dir_<n>` that does
    /// not exist yet.
    pub fn resolve_working_dir(&self) -> Result<PathBuf> {
        let path = match self.working_dir.as_deref() {
            None | Some(DEFAULT_WORKING_DIR) | Some("") => first_free_working_dir(Path::new("."))?,
            Some(dir) => PathBuf::from(dir),
        };
        absolute(&path)
    }

    /// Image build with absolute paths. The target root is passed as the
    /// `TARGET_PROGRAM_ROOT` build argument, relative to the context when it
    /// lies inside it.
    pub fn image_build(&self) -> Result<ImageBuild> {
        let context = absolute(&self.image.context)?;
        let dockerfile = context.join(&self.image.dockerfile);
        let target_root = self.target_root()?;
        let program_root = target_root
            .strip_prefix(&context)
            .map(Path::to_path_buf)
            .unwrap_or(target_root);
        let program_root = match program_root.to_string_lossy().into_owned() {
            empty if empty.is_empty() => ".".to_string(),
            root => root,
        };

        Ok(ImageBuild {
            tag: self.image.tag.clone(),
            dockerfile,
            context,
            build_args: vec![(TARGET_PROGRAM_ROOT_ARG.to_string(), program_root)],
        })
    }

    /// Pool size: the configured value, or three quarters of the idle CPU
    /// capacity (at least one).
    pub async fn resolve_workers(&self) -> usize {
        if self.workers > 0 {
            return self.workers;
        }
        let mut system = System::new_all();
        // Usage is a delta between two refreshes.
        tokio::time::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL).await;
        system.refresh_cpu_all();
        let cpus = system.cpus();
        if cpus.is_empty() {
            return 1;
        }
        let busy: f32 = cpus.iter().map(|cpu| cpu.cpu_usage()).sum::<f32>() / 100.0;
        workers_from_idle(cpus.len() as f32 - busy)
    }
}

fn workers_from_idle(idle_cores: f32) -> usize {
    ((idle_cores * 3.0 / 4.0).floor() as usize).max(1)
}

fn first_free_working_dir(base: &Path) -> Result<PathBuf> {
    (1..10_000)
        .map(|i| base.join(format!("working_dir_{}", i)))
        .find(|candidate| !candidate.exists())
        .context("No free working_dir_<n> directory name left")
}

fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    let cwd = std::env::current_dir().context("Failed to read current directory")?;
    Ok(cwd.join(path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    // =========================================================================
    // Default value tests
    // =========================================================================

    #[test]
    fn test_default_budgets() {
        let budgets = BudgetsConfig::default();
        assert_eq!(budgets.grace_seconds, 300);
        assert_eq!(budgets.fuzz_iterations, 100_000);
        assert_eq!(budgets.timeout(60), Duration::from_secs(360));
    }

    #[test]
    fn test_default_general_config() {
        let config = GeneralConfig::default();
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_default_fuzzing_enabled() {
        assert!(Config::default().fuzzing.enabled);
    }

    // =========================================================================
    // Config parsing tests
    // =========================================================================

    #[test]
    fn test_parse_minimal_config() {
        let toml = r#"
target_root = "/src/project"
workers = 4

[general]
log_level = "debug"

[budgets]
fuzz_seconds = 60
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.target_root, PathBuf::from("/src/project"));
        assert_eq!(config.workers, 4);
        assert_eq!(config.general.log_level, "debug");
        assert_eq!(config.budgets.fuzz_seconds, 60);
        // Defaults should still apply
        assert_eq!(config.budgets.grace_seconds, 300);
        assert_eq!(config.image.tag, "fuzzgraft:latest");
    }

    #[test]
    fn test_parse_modules_and_tools() {
        let toml = r#"
[modules]
include = ["flutils/**/*.py"]
exclude = ["flutils/__init__.py"]
max = 3

[fuzzing]
enabled = false

[tools]
fuzz = "python3"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.modules.include, vec!["flutils/**/*.py"]);
        assert_eq!(config.modules.exclude, vec!["flutils/__init__.py"]);
        assert_eq!(config.modules.max, Some(3));
        assert!(!config.fuzzing.enabled);
        assert_eq!(config.tools.fuzz, "python3");
        assert_eq!(config.tools.generate, default_generate_command());
    }

    #[test]
    fn test_empty_config() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.target_root, PathBuf::from("."));
        assert_eq!(config.workers, 0);
        assert!(config.working_dir.is_none());
        assert_eq!(config.modules.include, default_include());
    }

    // =========================================================================
    // Resolution tests
    // =========================================================================

    #[test]
    fn test_resolve_explicit_working_dir() {
        let config = Config {
            working_dir: Some("/tmp/run".to_string()),
            ..Default::default()
        };
        assert_eq!(config.resolve_working_dir().unwrap(), PathBuf::from("/tmp/run"));
    }

    #[test]
    fn test_resolve_relative_working_dir_is_absolute() {
        let config = Config {
            working_dir: Some("runs/one".to_string()),
            ..Default::default()
        };
        let resolved = config.resolve_working_dir().unwrap();
        assert!(resolved.is_absolute());
        assert!(resolved.ends_with("runs/one"));
    }

    #[test]
    fn test_first_free_working_dir() {
        let temp_dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(temp_dir.path().join("working_dir_1")).unwrap();
        std::fs::create_dir(temp_dir.path().join("working_dir_2")).unwrap();

        let free = first_free_working_dir(temp_dir.path()).unwrap();
        assert_eq!(free, temp_dir.path().join("working_dir_3"));
    }

    #[test]
    fn test_image_build_relative_program_root() {
        let mut config = Config::default();
        config.image.context = PathBuf::from("/ctx");
        config.target_root = PathBuf::from("/ctx/project");

        let build = config.image_build().unwrap();

        assert_eq!(build.context, PathBuf::from("/ctx"));
        assert_eq!(build.dockerfile, PathBuf::from("/ctx/docker/Dockerfile"));
        assert_eq!(
            build.build_args,
            vec![("TARGET_PROGRAM_ROOT".to_string(), "project".to_string())]
        );
    }

    #[test]
    fn test_image_build_target_is_context() {
        let mut config = Config::default();
        config.image.context = PathBuf::from("/ctx");
        config.target_root = PathBuf::from("/ctx");

        let build = config.image_build().unwrap();

        assert_eq!(build.build_args[0].1, ".");
    }

    #[tokio::test]
    async fn test_workers_explicit() {
        let config = Config {
            workers: 6,
            ..Default::default()
        };
        assert_eq!(config.resolve_workers().await, 6);
    }

    #[test]
    fn test_workers_from_idle() {
        assert_eq!(workers_from_idle(8.0), 6);
        assert_eq!(workers_from_idle(2.5), 1);
        assert_eq!(workers_from_idle(0.2), 1);
    }

    #[tokio::test]
    async fn test_cpu_sampling_yields_to_runtime() {
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        tokio::spawn(async move { flag.store(true, Ordering::SeqCst) });

        let workers = Config::default().resolve_workers().await;

        assert!(workers >= 1);
        assert!(ran.load(Ordering::SeqCst));
    }

    // =========================================================================
    // File I/O tests
    // =========================================================================

    #[test]
    fn test_config_load_nonexistent() {
        let temp_file = tempfile::NamedTempFile::new().unwrap();
        std::fs::remove_file(temp_file.path()).unwrap();

        let config = Config::load(Some(temp_file.path())).unwrap();
        assert_eq!(config.budgets.grace_seconds, 300);
    }

    #[test]
    fn test_config_load_valid_file() {
        let temp_file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(
            temp_file.path(),
            "working_dir = \"DEFAULT\"\n[image]\ntag = \"custom:1\"\n",
        )
        .unwrap();

        let config = Config::load(Some(temp_file.path())).unwrap();
        assert_eq!(config.working_dir.as_deref(), Some(DEFAULT_WORKING_DIR));
        assert_eq!(config.image.tag, "custom:1");
    }

    #[test]
    fn test_config_load_invalid_toml() {
        let temp_file = tempfile::NamedTempFile::new().unwrap();

        std::fs::write(temp_file.path(), "invalid {{{{ toml").unwrap();

        let result = Config::load(Some(temp_file.path()));
        assert!(result.is_err());
    }
}
