//! Docker runtime driven through the `docker` command-line client.

use super::{ContainerRuntime, ContainerState, ImageBuild, SandboxError, WorkItem};
use async_trait::async_trait;
use std::process::{Output, Stdio};
use tokio::process::Command;

/// Seconds `docker stop` waits before killing.
const STOP_GRACE_SECONDS: u32 = 10;

#[derive(Debug, Clone)]
pub struct DockerCli {
    binary: String,
}

impl Default for DockerCli {
    fn default() -> Self {
        Self {
            binary: "docker".to_string(),
        }
    }
}

impl DockerCli {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    async fn docker(&self, args: &[String]) -> Result<Output, SandboxError> {
        let output = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| SandboxError::Runtime(format!("failed to run {}: {}", self.binary, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(SandboxError::Runtime(format!(
                "{} {} failed: {}",
                self.binary,
                args.first().map(String::as_str).unwrap_or_default(),
                stderr.trim()
            )));
        }
        Ok(output)
    }
}

/// Arguments for `docker build`.
fn build_args(build: &ImageBuild) -> Vec<String> {
    let mut args = vec![
        "build".to_string(),
        "-t".to_string(),
        build.tag.clone(),
        "-f".to_string(),
        build.dockerfile.to_string_lossy().into_owned(),
    ];
    for (key, value) in &build.build_args {
        args.push("--build-arg".to_string());
        args.push(format!("{}={}", key, value));
    }
    args.push(build.context.to_string_lossy().into_owned());
    args
}

/// Arguments for a detached `docker run` of a work item.
fn run_args(item: &WorkItem) -> Vec<String> {
    let mut args = vec!["run".to_string(), "-d".to_string()];
    for mount in &item.mounts {
        args.push("-v".to_string());
        args.push(format!(
            "{}:{}:{}",
            mount.host.display(),
            mount.container,
            mount.mode.as_str()
        ));
    }
    for env in &item.env {
        args.push("-e".to_string());
        args.push(env.clone());
    }
    args.push(item.image.clone());
    args.extend(["sh".to_string(), "-c".to_string(), item.command.clone()]);
    args
}

/// Parse `docker inspect -f '{{.State.Running}} {{.State.ExitCode}}'`.
fn parse_state(output: &str) -> Result<ContainerState, SandboxError> {
    let mut parts = output.split_whitespace();
    match (parts.next(), parts.next().map(str::parse::<i64>)) {
        (Some("true"), _) => Ok(ContainerState::Running),
        (Some("false"), Some(Ok(code))) => Ok(ContainerState::Exited(code)),
        _ => Err(SandboxError::Runtime(format!(
            "unexpected container state: {:?}",
            output.trim()
        ))),
    }
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn build_image(&self, build: &ImageBuild) -> Result<Vec<u8>, SandboxError> {
        let output = self.docker(&build_args(build)).await?;
        let mut log = output.stdout;
        log.extend_from_slice(&output.stderr);
        Ok(log)
    }

    async fn start(&self, item: &WorkItem) -> Result<String, SandboxError> {
        let output = self.docker(&run_args(item)).await?;
        let id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if id.is_empty() {
            return Err(SandboxError::Runtime("docker run returned no container id".into()));
        }
        Ok(id)
    }

    async fn state(&self, id: &str) -> Result<ContainerState, SandboxError> {
        let args = [
            "inspect".to_string(),
            "-f".to_string(),
            "{{.State.Running}} {{.State.ExitCode}}".to_string(),
            id.to_string(),
        ];
        let output = self.docker(&args).await?;
        parse_state(&String::from_utf8_lossy(&output.stdout))
    }

    async fn logs(&self, id: &str) -> Result<Vec<u8>, SandboxError> {
        let output = self.docker(&["logs".to_string(), id.to_string()]).await?;
        let mut log = output.stdout;
        log.extend_from_slice(&output.stderr);
        Ok(log)
    }

    async fn stop(&self, id: &str) -> Result<(), SandboxError> {
        let args = [
            "stop".to_string(),
            "-t".to_string(),
            STOP_GRACE_SECONDS.to_string(),
            id.to_string(),
        ];
        self.docker(&args).await.map(|_| ())
    }

    async fn remove(&self, id: &str) -> Result<(), SandboxError> {
        self.docker(&["rm".to_string(), "-f".to_string(), id.to_string()])
            .await
            .map(|_| ())
    }

    fn force_remove_detached(&self, id: &str) {
        let spawned = std::process::Command::new(&self.binary)
            .args(["rm", "-f", id])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn();
        if let Err(e) = spawned {
            tracing::warn!("Failed to spawn removal of container {}: {}", id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::Mount;
    use std::path::PathBuf;

    #[test]
    fn test_run_args() {
        let item = WorkItem::new("fuzz", "fuzzgraft:latest", "python /workplace/h.py")
            .mount(Mount::read_only("/w/harnesses", "/workplace/harnesses"))
            .mount(Mount::read_write("/w/results", "/workplace/results"))
            .env("test_name", "h");

        assert_eq!(
            run_args(&item),
            vec![
                "run",
                "-d",
                "-v",
                "/w/harnesses:/workplace/harnesses:ro",
                "-v",
                "/w/results:/workplace/results:rw",
                "-e",
                "test_name=h",
                "fuzzgraft:latest",
                "sh",
                "-c",
                "python /workplace/h.py",
            ]
        );
    }

    #[test]
    fn test_build_args() {
        let build = ImageBuild {
            tag: "fuzzgraft:latest".into(),
            dockerfile: PathBuf::from("/ctx/docker/Dockerfile"),
            context: PathBuf::from("/ctx"),
            build_args: vec![("TARGET_PROGRAM_ROOT".into(), "project".into())],
        };

        assert_eq!(
            build_args(&build),
            vec![
                "build",
                "-t",
                "fuzzgraft:latest",
                "-f",
                "/ctx/docker/Dockerfile",
                "--build-arg",
                "TARGET_PROGRAM_ROOT=project",
                "/ctx",
            ]
        );
    }

    #[test]
    fn test_parse_state() {
        assert_eq!(parse_state("true 0\n").unwrap(), ContainerState::Running);
        assert_eq!(parse_state("false 2\n").unwrap(), ContainerState::Exited(2));
        assert!(parse_state("").is_err());
        assert!(parse_state("false x").is_err());
    }
}
