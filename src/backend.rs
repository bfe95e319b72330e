//! External collaborators the execution core orchestrates.
//!
//! The core never talks to a container runtime directly. It goes through
//! two seams: [`ProcessExec`] runs a command inside a named container, and
//! [`ContainerDiscovery`] reports container state and starts services.
//! [`DockerCli`] implements both with the `docker` command line.

mod docker;
pub mod process;

pub use docker::DockerCli;

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

/// Captured output of a finished process.
#[derive(Debug, Clone, Default)]
pub struct ProcessOutput {
    /// Exit code of the process (0 = success, -1 when killed by a signal).
    pub exit_code: i32,
    /// Captured stdout.
    pub stdout: String,
    /// Captured stderr.
    pub stderr: String,
}

/// Failures raised by the collaborators themselves, before any output exists.
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("no such container: {0}")]
    NoSuchContainer(String),

    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("process timed out after {0:?}")]
    Timeout(Duration),

    #[error("transport error: {0}")]
    Transport(String),
}

/// Observed state of a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "status", rename_all = "snake_case")]
pub enum ContainerState {
    Running,
    /// Exists but is not running; carries the runtime's status word.
    Stopped(String),
    Missing,
}

impl ContainerState {
    pub const fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }

    pub fn label(&self) -> &str {
        match self {
            Self::Running => "running",
            Self::Stopped(status) => status,
            Self::Missing => "missing",
        }
    }
}

/// Runs a command inside a container.
#[async_trait]
pub trait ProcessExec: Send + Sync {
    /// Execute `command` in `container`, feeding `stdin`, bounded by `timeout`.
    ///
    /// On timeout the local process is killed and reaped before returning
    /// [`ExecError::Timeout`].
    async fn exec(
        &self,
        container: &str,
        command: &[String],
        stdin: &str,
        timeout: Duration,
    ) -> Result<ProcessOutput, ExecError>;
}

/// Discovers containers and starts services on demand.
#[async_trait]
pub trait ContainerDiscovery: Send + Sync {
    /// Current state of `container`.
    async fn state(&self, container: &str) -> Result<ContainerState, ExecError>;

    /// Start `services`, waiting at most `wait` for the action to complete.
    async fn start_services(&self, services: &[String], wait: Duration) -> Result<(), ExecError>;
}
