//! Sandbox lifecycle: start, poll, time out, tear down.

use super::{
    ContainerRuntime, ContainerState, ExecutionResult, ImageBuild, MountRegistry, SandboxError,
    WorkItem,
};
use crate::interrupt::Interrupt;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Default delay between container state checks.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Runs work items through a container runtime. Cheap to clone.
#[derive(Clone)]
pub struct Executor {
    runtime: Arc<dyn ContainerRuntime>,
    mounts: MountRegistry,
    interrupt: Interrupt,
    poll_interval: Duration,
}

enum Outcome {
    Exited(i64),
    TimedOut,
    Interrupted,
    Failed(SandboxError),
}

/// Removes the container if the run future is dropped before cleanup.
struct CleanupGuard {
    runtime: Arc<dyn ContainerRuntime>,
    id: String,
    armed: bool,
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        if self.armed {
            tracing::warn!("Container {} abandoned, forcing removal", short_id(&self.id));
            self.runtime.force_remove_detached(&self.id);
        }
    }
}

impl Executor {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, interrupt: Interrupt) -> Self {
        Self {
            runtime,
            mounts: MountRegistry::new(),
            interrupt,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    #[cfg(test)]
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn interrupt(&self) -> &Interrupt {
        &self.interrupt
    }

    #[cfg(test)]
    pub fn mounts(&self) -> &MountRegistry {
        &self.mounts
    }

    /// Build the tool image, writing the build output to `log_path`.
    pub async fn build_image(&self, build: &ImageBuild, log_path: &Path) -> Result<(), SandboxError> {
        tracing::info!("Building image {}", build.tag);
        let output = self.runtime.build_image(build).await;
        let log = match &output {
            Ok(log) => log.clone(),
            Err(e) => e.to_string().into_bytes(),
        };
        write_log(log_path, &log).await;
        output.map(|_| ())
    }

    /// Run one work item to completion.
    ///
    /// Mounts are validated and leased before the container is created. The
    /// container is stopped and removed on every path out of this function,
    /// including when the log cannot be fetched.
    pub async fn run(&self, item: &WorkItem) -> Result<ExecutionResult, SandboxError> {
        let label = item.label();
        let _lease = self.mounts.acquire(&item.mounts, &label)?;
        if self.interrupt.is_triggered() {
            return Err(SandboxError::Interrupted);
        }

        let id = self.runtime.start(item).await?;
        let mut guard = CleanupGuard {
            runtime: Arc::clone(&self.runtime),
            id: id.clone(),
            armed: true,
        };
        tracing::info!("Running {}, container: {}", label, short_id(&id));

        let started = Instant::now();
        let deadline = started + item.timeout;
        let outcome = loop {
            match self.runtime.state(&id).await {
                Ok(ContainerState::Exited(code)) => break Outcome::Exited(code),
                Ok(ContainerState::Running) => {}
                Err(e) => break Outcome::Failed(e),
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break Outcome::TimedOut;
            }

            if let Some(path) = &item.log_path {
                if let Ok(log) = self.runtime.logs(&id).await {
                    write_log(path, &log).await;
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval.min(remaining)) => {}
                _ = self.interrupt.wait() => break Outcome::Interrupted,
            }
            tracing::debug!("{} still running after {:?}", label, started.elapsed());
        };
        let elapsed = started.elapsed();

        if !matches!(outcome, Outcome::Exited(_)) {
            if let Err(e) = self.runtime.stop(&id).await {
                tracing::warn!("Failed to stop container {}: {}", short_id(&id), e);
            }
        }

        let log = match self.runtime.logs(&id).await {
            Ok(log) => log,
            Err(e) => {
                tracing::warn!("Failed to fetch logs of {}: {}", label, e);
                Vec::new()
            }
        };
        if let Some(path) = &item.log_path {
            write_log(path, &log).await;
        }

        match self.runtime.remove(&id).await {
            Ok(()) => guard.armed = false,
            Err(e) => tracing::warn!("Failed to remove container {}: {}", short_id(&id), e),
        }
        drop(guard);

        match outcome {
            Outcome::Exited(exit_code) => {
                tracing::info!(
                    "{} exited with {}, time used: {:.2} seconds",
                    label,
                    exit_code,
                    elapsed.as_secs_f64()
                );
                Ok(ExecutionResult {
                    exit_code,
                    log,
                    elapsed,
                })
            }
            Outcome::TimedOut => {
                tracing::warn!("{} timed out after {:?}", label, item.timeout);
                Err(SandboxError::Timeout {
                    timeout: item.timeout,
                    log,
                    elapsed,
                })
            }
            Outcome::Interrupted => Err(SandboxError::Interrupted),
            Outcome::Failed(e) => Err(e),
        }
    }
}

async fn write_log(path: &Path, log: &[u8]) {
    if let Some(parent) = path.parent() {
        if let Err(e) = tokio::fs::create_dir_all(parent).await {
            tracing::warn!("Failed to create log directory {}: {}", parent.display(), e);
            return;
        }
    }
    if let Err(e) = tokio::fs::write(path, log).await {
        tracing::warn!("Failed to write log {}: {}", path.display(), e);
    }
}

fn short_id(id: &str) -> &str {
    id.get(..10).unwrap_or(id)
}
