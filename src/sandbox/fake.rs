//! In-memory container runtime for tests.
//!
//! A script closure decides, per started work item, how the container
//! behaves. It may also write files into the item's host mounts to play the
//! part of the tool.

use super::{ContainerRuntime, ContainerState, ImageBuild, SandboxError, WorkItem};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Default)]
pub struct FakeRun {
    /// `None` never exits on its own
    pub exit_code: Option<i64>,
    pub runtime: Duration,
    pub log: Vec<u8>,
}

impl FakeRun {
    pub fn exits(code: i64) -> Self {
        Self {
            exit_code: Some(code),
            ..Self::default()
        }
    }

    pub fn hangs() -> Self {
        Self::default()
    }

    pub fn after(mut self, runtime: Duration) -> Self {
        self.runtime = runtime;
        self
    }

    pub fn with_log(mut self, log: &str) -> Self {
        self.log = log.as_bytes().to_vec();
        self
    }
}

struct Container {
    started_at: Instant,
    run: FakeRun,
    stopped: bool,
    removed: bool,
}

#[derive(Default)]
struct State {
    containers: HashMap<String, Container>,
    started: Vec<WorkItem>,
    built: Vec<String>,
    stops: usize,
}

type Script = dyn Fn(&WorkItem) -> FakeRun + Send + Sync;

pub struct FakeRuntime {
    script: Box<Script>,
    state: Mutex<State>,
    fail_logs: bool,
    fail_build: bool,
}

impl FakeRuntime {
    pub fn new(script: impl Fn(&WorkItem) -> FakeRun + Send + Sync + 'static) -> Self {
        Self {
            script: Box::new(script),
            state: Mutex::new(State::default()),
            fail_logs: false,
            fail_build: false,
        }
    }

    pub fn failing_logs(mut self) -> Self {
        self.fail_logs = true;
        self
    }

    pub fn failing_build(mut self) -> Self {
        self.fail_build = true;
        self
    }

    pub fn started(&self) -> Vec<WorkItem> {
        self.state.lock().unwrap().started.clone()
    }

    pub fn built(&self) -> Vec<String> {
        self.state.lock().unwrap().built.clone()
    }

    pub fn stop_count(&self) -> usize {
        self.state.lock().unwrap().stops
    }

    /// Containers started and not yet removed
    pub fn live_containers(&self) -> usize {
        self.state
            .lock()
            .unwrap()
            .containers
            .values()
            .filter(|c| !c.removed)
            .count()
    }

    fn with_container<T>(
        &self,
        id: &str,
        f: impl FnOnce(&mut Container) -> T,
    ) -> Result<T, SandboxError> {
        let mut state = self.state.lock().unwrap();
        state
            .containers
            .get_mut(id)
            .map(f)
            .ok_or_else(|| SandboxError::Runtime(format!("no such container: {}", id)))
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn build_image(&self, build: &ImageBuild) -> Result<Vec<u8>, SandboxError> {
        if self.fail_build {
            return Err(SandboxError::Runtime("build failed".into()));
        }
        self.state.lock().unwrap().built.push(build.tag.clone());
        Ok(b"built\n".to_vec())
    }

    async fn start(&self, item: &WorkItem) -> Result<String, SandboxError> {
        let run = (self.script)(item);
        let mut state = self.state.lock().unwrap();
        let id = format!("fake{:012}", state.started.len());
        state.started.push(item.clone());
        state.containers.insert(
            id.clone(),
            Container {
                started_at: Instant::now(),
                run,
                stopped: false,
                removed: false,
            },
        );
        Ok(id)
    }

    async fn state(&self, id: &str) -> Result<ContainerState, SandboxError> {
        self.with_container(id, |c| {
            if c.stopped {
                return ContainerState::Exited(137);
            }
            match c.run.exit_code {
                Some(code) if c.started_at.elapsed() >= c.run.runtime => {
                    ContainerState::Exited(code)
                }
                _ => ContainerState::Running,
            }
        })
    }

    async fn logs(&self, id: &str) -> Result<Vec<u8>, SandboxError> {
        if self.fail_logs {
            return Err(SandboxError::Runtime("logs unavailable".into()));
        }
        self.with_container(id, |c| c.run.log.clone())
    }

    async fn stop(&self, id: &str) -> Result<(), SandboxError> {
        self.with_container(id, |c| c.stopped = true)?;
        self.state.lock().unwrap().stops += 1;
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<(), SandboxError> {
        self.with_container(id, |c| c.removed = true)
    }

    fn force_remove_detached(&self, id: &str) {
        let _ = self.with_container(id, |c| c.removed = true);
    }
}
