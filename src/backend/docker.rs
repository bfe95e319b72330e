//! `docker` command-line backend.
//!
//! Runs code with `docker exec -i`, inspects containers with
//! `docker inspect`, and starts services with `docker compose up -d`.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, instrument, warn};

use super::process::run_with_timeout;
use super::{ContainerDiscovery, ContainerState, ExecError, ProcessExec, ProcessOutput};
use crate::config::ComposeConfig;

/// Budget for a single `docker inspect`.
const INSPECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Backend that shells out to the `docker` CLI.
#[derive(Debug, Clone)]
pub struct DockerCli {
    program: String,
    compose: ComposeConfig,
}

impl DockerCli {
    /// Create a backend using `docker` from `PATH`.
    pub fn new(compose: ComposeConfig) -> Self {
        Self {
            program: "docker".into(),
            compose,
        }
    }

    /// Use a different executable (e.g. `podman`).
    #[must_use]
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    /// Arguments for `docker compose ... up -d <services>`.
    fn compose_up_args(&self, services: &[String]) -> Vec<String> {
        let mut args = vec!["compose".to_string()];
        if let Some(env_file) = &self.compose.env_file {
            args.push("--env-file".into());
            args.push(env_file.to_string_lossy().into_owned());
        }
        for file in &self.compose.files {
            let path = PathBuf::from(file);
            let resolved = match &self.compose.project_dir {
                Some(dir) if path.is_relative() => dir.join(path),
                _ => path,
            };
            args.push("-f".into());
            args.push(resolved.to_string_lossy().into_owned());
        }
        args.push("up".into());
        args.push("-d".into());
        args.extend(services.iter().cloned());
        args
    }
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new(ComposeConfig::default())
    }
}

#[async_trait]
impl ProcessExec for DockerCli {
    #[instrument(skip(self, command, stdin), fields(timeout = ?timeout))]
    async fn exec(
        &self,
        container: &str,
        command: &[String],
        stdin: &str,
        timeout: Duration,
    ) -> Result<ProcessOutput, ExecError> {
        debug!(container = %container, code_len = stdin.len(), "Executing in container");

        let mut cmd = Command::new(&self.program);
        cmd.arg("exec").arg("-i").arg(container).args(command);

        let output = run_with_timeout(cmd, stdin, timeout).await?;

        // docker exits 1 (newer) or 125 (older) when the container is gone
        if output.exit_code != 0 && is_missing(&output.stderr) {
            return Err(ExecError::NoSuchContainer(container.to_string()));
        }
        Ok(output)
    }
}

#[async_trait]
impl ContainerDiscovery for DockerCli {
    async fn state(&self, container: &str) -> Result<ContainerState, ExecError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(["inspect", container, "--format", "{{.State.Status}}"]);

        let output = run_with_timeout(cmd, "", INSPECT_TIMEOUT).await?;
        if output.exit_code == 0 {
            let status = output.stdout.trim();
            return Ok(if status == "running" {
                ContainerState::Running
            } else {
                ContainerState::Stopped(status.to_string())
            });
        }
        if is_missing(&output.stderr) {
            return Ok(ContainerState::Missing);
        }
        if output.stderr.to_ascii_lowercase().contains("permission denied") {
            return Err(ExecError::Transport(format!(
                "permission denied accessing docker: {}",
                output.stderr.trim()
            )));
        }
        Err(ExecError::Transport(format!(
            "docker inspect failed for {container}: {}",
            output.stderr.trim()
        )))
    }

    async fn start_services(&self, services: &[String], wait: Duration) -> Result<(), ExecError> {
        let args = self.compose_up_args(services);
        info!(services = ?services, "Starting services via compose");

        let mut cmd = Command::new(&self.program);
        cmd.args(&args);
        if let Some(dir) = &self.compose.project_dir {
            cmd.current_dir(dir);
        }

        let output = run_with_timeout(cmd, "", wait).await?;
        if output.exit_code != 0 {
            warn!(stderr = %output.stderr.trim(), "Compose up failed");
            return Err(ExecError::Transport(format!(
                "compose up failed ({}): {}",
                output.exit_code,
                output.stderr.trim()
            )));
        }
        Ok(())
    }
}

fn is_missing(stderr: &str) -> bool {
    let lowered = stderr.to_ascii_lowercase();
    lowered.contains("no such container") || lowered.contains("no such object")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compose_args_resolve_relative_files() {
        let backend = DockerCli::new(ComposeConfig {
            project_dir: Some(PathBuf::from("/srv/stack")),
            files: vec!["docker-compose.yml".into(), "/abs/override.yml".into()],
            env_file: Some(PathBuf::from("/srv/stack/.env")),
        });
        let args = backend.compose_up_args(&["database".into(), "script-runner".into()]);
        assert_eq!(
            args,
            vec![
                "compose",
                "--env-file",
                "/srv/stack/.env",
                "-f",
                "/srv/stack/docker-compose.yml",
                "-f",
                "/abs/override.yml",
                "up",
                "-d",
                "database",
                "script-runner",
            ]
        );
    }

    #[test]
    fn compose_args_without_files() {
        let backend = DockerCli::default();
        let args = backend.compose_up_args(&["web".into()]);
        assert_eq!(args, vec!["compose", "up", "-d", "web"]);
    }

    #[test]
    fn missing_container_detection() {
        assert!(is_missing("Error: No such container: acme-web-1"));
        assert!(is_missing("Error: No such object: acme-web-1"));
        assert!(!is_missing("permission denied"));
    }

    #[tokio::test]
    async fn missing_program_is_a_spawn_error() {
        let backend = DockerCli::default().with_program("/nonexistent/docker");
        let err = backend.state("anything").await.unwrap_err();
        assert!(matches!(err, ExecError::Spawn { .. }));
    }

    #[tokio::test]
    async fn test_inspect_real_docker() {
        // Requires a reachable docker daemon, skip in CI
        if std::env::var("ODOO_INSPECT_DOCKER_TEST").is_err() {
            return;
        }
        let backend = DockerCli::default();
        let state = backend
            .state("odoo-inspect-definitely-not-a-container")
            .await
            .unwrap();
        assert_eq!(state, ContainerState::Missing);
    }
}
