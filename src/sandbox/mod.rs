//! Sandboxed tool execution.
//!
//! A [`WorkItem`] describes one containerised tool invocation. The
//! [`Executor`] runs it through a [`ContainerRuntime`] with an enforced
//! timeout and always tears the container down again.

pub mod docker;
pub mod executor;
pub mod mounts;

#[cfg(test)]
pub mod fake;

pub use docker::DockerCli;
pub use executor::Executor;
pub use mounts::MountRegistry;

use crate::discovery::Module;
use async_trait::async_trait;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountMode {
    ReadOnly,
    ReadWrite,
}

impl MountMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ReadOnly => "ro",
            Self::ReadWrite => "rw",
        }
    }
}

/// A host directory bound into the container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub host: PathBuf,
    pub container: String,
    pub mode: MountMode,
}

impl Mount {
    pub fn read_only(host: impl Into<PathBuf>, container: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            container: container.into(),
            mode: MountMode::ReadOnly,
        }
    }

    pub fn read_write(host: impl Into<PathBuf>, container: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            container: container.into(),
            mode: MountMode::ReadWrite,
        }
    }

    pub fn is_writable(&self) -> bool {
        self.mode == MountMode::ReadWrite
    }
}

/// One sandboxed invocation.
#[derive(Debug, Clone)]
pub struct WorkItem {
    /// Tool name, used for logging (`generate`, `fuzz`, ...)
    pub tool: String,
    pub module: Option<Module>,
    pub image: String,
    pub mounts: Vec<Mount>,
    /// `KEY=value` pairs
    pub env: Vec<String>,
    /// Shell command run inside the container
    pub command: String,
    pub timeout: Duration,
    /// Where log snapshots and the final log are written
    pub log_path: Option<PathBuf>,
}

impl WorkItem {
    pub fn new(tool: impl Into<String>, image: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            tool: tool.into(),
            module: None,
            image: image.into(),
            mounts: Vec::new(),
            env: Vec::new(),
            command: command.into(),
            timeout: Duration::from_secs(600),
            log_path: None,
        }
    }

    pub fn module(mut self, module: Module) -> Self {
        self.module = Some(module);
        self
    }

    pub fn mount(mut self, mount: Mount) -> Self {
        self.mounts.push(mount);
        self
    }

    pub fn env(mut self, key: &str, value: impl fmt::Display) -> Self {
        self.env.push(format!("{}={}", key, value));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn log_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_path = Some(path.into());
        self
    }

    /// `tool` or `tool/module`
    pub fn label(&self) -> String {
        match &self.module {
            Some(module) => format!("{}/{}", self.tool, module),
            None => self.tool.clone(),
        }
    }

    pub fn writable_mounts(&self) -> impl Iterator<Item = &Mount> {
        self.mounts.iter().filter(|m| m.is_writable())
    }
}

/// Outcome of a sandboxed run that terminated on its own.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionResult {
    pub exit_code: i64,
    pub log: Vec<u8>,
    pub elapsed: Duration,
}

impl ExecutionResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("mount source {0} is not an absolute path")]
    InvalidMount(PathBuf),

    #[error("writable mount {path} is already held by {holder}")]
    MountConflict { path: PathBuf, holder: String },

    #[error("sandbox timed out after {timeout:?}")]
    Timeout {
        timeout: Duration,
        log: Vec<u8>,
        elapsed: Duration,
    },

    #[error("sandbox interrupted")]
    Interrupted,

    #[error("container runtime error: {0}")]
    Runtime(String),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl SandboxError {
    pub fn io(path: &Path) -> impl FnOnce(std::io::Error) -> Self {
        let path = path.to_path_buf();
        move |source| Self::Io { path, source }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    Running,
    Exited(i64),
}

/// Image to build before any tool runs.
#[derive(Debug, Clone)]
pub struct ImageBuild {
    pub tag: String,
    pub dockerfile: PathBuf,
    pub context: PathBuf,
    pub build_args: Vec<(String, String)>,
}

/// Container lifecycle primitives the executor is built on.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Build an image and return the build output.
    async fn build_image(&self, build: &ImageBuild) -> Result<Vec<u8>, SandboxError>;

    /// Create and start a detached container, returning its id.
    async fn start(&self, item: &WorkItem) -> Result<String, SandboxError>;

    async fn state(&self, id: &str) -> Result<ContainerState, SandboxError>;

    /// Combined stdout and stderr so far.
    async fn logs(&self, id: &str) -> Result<Vec<u8>, SandboxError>;

    async fn stop(&self, id: &str) -> Result<(), SandboxError>;

    async fn remove(&self, id: &str) -> Result<(), SandboxError>;

    /// Fire-and-forget removal for when the async cleanup path never ran.
    fn force_remove_detached(&self, id: &str);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_work_item_builder() {
        let item = WorkItem::new("generate", "img:latest", "bash run.sh")
            .module(Module::new("pkg.mod"))
            .mount(Mount::read_only("/a", "/workplace/a"))
            .mount(Mount::read_write("/b", "/workplace/b"))
            .env("module_name", "pkg.mod")
            .env("maximum_iterations", 10)
            .timeout(Duration::from_secs(5));

        assert_eq!(item.label(), "generate/pkg.mod");
        assert_eq!(item.env, vec!["module_name=pkg.mod", "maximum_iterations=10"]);
        assert_eq!(
            item.writable_mounts().map(|m| m.host.as_path()).collect::<Vec<_>>(),
            vec![Path::new("/b")]
        );
        assert_eq!(item.timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_label_without_module() {
        assert_eq!(WorkItem::new("coverage", "img", "true").label(), "coverage");
    }
}
