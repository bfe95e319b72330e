//! Execution manager: run code inside the runtime container and return a
//! single well-formed JSON value or a classified failure.
//!
//! Container names are resolved once per role and cached for the lifetime
//! of the manager. A cached name is dropped when the runtime reports the
//! container as gone, and the next call re-resolves it. Re-resolution is
//! single-flight per role, so a burst of concurrent calls against a stopped
//! stack triggers one start-on-demand action, not one per call.

pub mod harness;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, instrument, warn};

use crate::backend::{ContainerDiscovery, ContainerState, ExecError, ProcessExec, ProcessOutput};
use crate::config::Config;

/// Role a container plays in the runtime stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerRole {
    Primary,
    Web,
    ScriptRunner,
    Database,
}

impl ContainerRole {
    pub const ALL: [Self; 4] = [Self::Primary, Self::Web, Self::ScriptRunner, Self::Database];

    /// Compose service name segment used by the naming convention.
    pub const fn slug(self) -> &'static str {
        match self {
            Self::Primary => "odoo",
            Self::Web => "web",
            Self::ScriptRunner => "script-runner",
            Self::Database => "database",
        }
    }
}

impl fmt::Display for ContainerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.slug())
    }
}

/// A resolved container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContainerRef {
    pub name: String,
    pub role: ContainerRole,
}

/// One execution, owned by the manager for the duration of the call.
#[derive(Debug)]
pub struct ExecutionRequest {
    code: String,
    timeout: Duration,
    target: ContainerRef,
}

impl ExecutionRequest {
    pub fn new(code: impl Into<String>, timeout: Duration, target: ContainerRef) -> Self {
        Self {
            code: code.into(),
            timeout,
            target,
        }
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    pub const fn target(&self) -> &ContainerRef {
        &self.target
    }
}

/// Failure classes surfaced to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ExecutionErrorKind {
    /// The container could not be found, started, or entered.
    ContainerUnavailable,
    /// The execution exceeded its time budget and was killed.
    Timeout,
    /// The process ran but produced no parseable result.
    MalformedOutput,
    /// The executed code itself raised.
    ExecutedCodeError,
}

impl ExecutionErrorKind {
    /// Whether a caller may retry, assuming the executed code is read-only.
    pub const fn is_retryable(self) -> bool {
        matches!(self, Self::ContainerUnavailable | Self::Timeout)
    }
}

impl fmt::Display for ExecutionErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::ContainerUnavailable => "ContainerUnavailable",
            Self::Timeout => "Timeout",
            Self::MalformedOutput => "MalformedOutput",
            Self::ExecutedCodeError => "ExecutedCodeError",
        };
        f.write_str(name)
    }
}

/// A classified failure with the raw process output kept for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionFailure {
    pub kind: ExecutionErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub traceback: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container: Option<String>,
    pub raw_stdout: String,
    pub raw_stderr: String,
    pub exit_code: i32,
}

impl ExecutionFailure {
    pub fn new(kind: ExecutionErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            error_type: None,
            traceback: None,
            container: None,
            raw_stdout: String::new(),
            raw_stderr: String::new(),
            exit_code: -1,
        }
    }

    #[must_use]
    pub fn in_container(mut self, name: &str) -> Self {
        self.container = Some(name.to_string());
        self
    }

    #[must_use]
    pub fn with_output(mut self, output: &ProcessOutput) -> Self {
        self.raw_stdout.clone_from(&output.stdout);
        self.raw_stderr.clone_from(&output.stderr);
        self.exit_code = output.exit_code;
        self
    }
}

impl fmt::Display for ExecutionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for ExecutionFailure {}

/// Outcome of one harnessed execution.
#[derive(Debug, Clone)]
pub enum ExecutionResult {
    Success { value: Value },
    Failure(ExecutionFailure),
}

impl ExecutionResult {
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub fn into_result(self) -> Result<Value, ExecutionFailure> {
        match self {
            Self::Success { value } => Ok(value),
            Self::Failure(failure) => Err(failure),
        }
    }
}

/// Output of a raw (non-harnessed) command.
#[derive(Debug, Clone, Serialize)]
pub struct CommandOutcome {
    pub container: String,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// State of one role's container, as reported by `container_status`.
#[derive(Debug, Clone, Serialize)]
pub struct RoleStatus {
    pub role: ContainerRole,
    pub container: Option<String>,
    pub state: String,
    pub running: bool,
}

/// Bounded exponential backoff for idempotent executions.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based).
    fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Runs code inside the runtime container.
pub struct ExecutionManager {
    config: Arc<Config>,
    exec: Arc<dyn ProcessExec>,
    discovery: Arc<dyn ContainerDiscovery>,
    resolved: RwLock<HashMap<ContainerRole, ContainerRef>>,
    /// Per-role re-resolution lock; one start-on-demand in flight per role.
    flights: Mutex<HashMap<ContainerRole, Arc<Mutex<()>>>>,
    retry: RetryPolicy,
}

impl ExecutionManager {
    pub fn new(
        config: Arc<Config>,
        exec: Arc<dyn ProcessExec>,
        discovery: Arc<dyn ContainerDiscovery>,
    ) -> Self {
        Self {
            config,
            exec,
            discovery,
            resolved: RwLock::new(HashMap::new()),
            flights: Mutex::new(HashMap::new()),
            retry: RetryPolicy::default(),
        }
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Default timeout for harnessed executions.
    pub fn default_timeout(&self) -> Duration {
        self.config.timeouts.execute()
    }

    /// Run `code` in the execution container.
    ///
    /// `timeout` falls back to the configured default when `None`.
    pub async fn execute(&self, code: &str, timeout: Option<Duration>) -> ExecutionResult {
        let timeout = self.effective_timeout(timeout);
        let target = match self.resolve(self.config.exec_role).await {
            Ok(target) => target,
            Err(failure) => return ExecutionResult::Failure(failure),
        };
        let request = ExecutionRequest::new(code, timeout, target);
        self.run_request(&request).await
    }

    /// Run read-only `code`, retrying `ContainerUnavailable` and `Timeout`
    /// with bounded backoff.
    pub async fn execute_idempotent(&self, code: &str, timeout: Option<Duration>) -> ExecutionResult {
        let mut attempt = 1;
        loop {
            let result = self.execute(code, timeout).await;
            let retryable = match &result {
                ExecutionResult::Failure(failure) => failure.kind.is_retryable(),
                ExecutionResult::Success { .. } => false,
            };
            if !retryable || attempt >= self.retry.max_attempts {
                return result;
            }
            let delay = self.retry.delay(attempt);
            warn!(attempt, delay = ?delay, "Retrying idempotent execution");
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    /// Run a raw command in `role`'s container without the result harness.
    pub async fn run_command(
        &self,
        role: ContainerRole,
        command: &[String],
        timeout: Option<Duration>,
    ) -> Result<CommandOutcome, ExecutionFailure> {
        let timeout = self.effective_timeout(timeout);
        let target = self.resolve(role).await?;
        info!(container = %target.name, command = ?command, "Running command");

        match self.exec.exec(&target.name, command, "", timeout).await {
            Ok(output) => Ok(CommandOutcome {
                container: target.name,
                exit_code: output.exit_code,
                stdout: output.stdout,
                stderr: output.stderr,
            }),
            Err(e) => Err(self.classify_exec_error(e, &target).await),
        }
    }

    #[instrument(skip(self, request), fields(container = %request.target.name, timeout = ?request.timeout))]
    async fn run_request(&self, request: &ExecutionRequest) -> ExecutionResult {
        let wrapped = harness::wrap(request.code());
        let command = self.config.shell_command();
        debug!(code_len = request.code.len(), "Executing harnessed code");

        let outcome = self
            .exec
            .exec(&request.target.name, &command, &wrapped, request.timeout)
            .await;

        match outcome {
            Ok(output) => self.classify_output(output, &request.target).await,
            Err(e) => ExecutionResult::Failure(self.classify_exec_error(e, &request.target).await),
        }
    }

    async fn classify_exec_error(&self, error: ExecError, target: &ContainerRef) -> ExecutionFailure {
        let failure = match error {
            ExecError::NoSuchContainer(name) => {
                self.invalidate(target.role).await;
                ExecutionFailure::new(
                    ExecutionErrorKind::ContainerUnavailable,
                    format!("Container {name} not found. Ensure the stack is running (docker compose up -d)"),
                )
            }
            ExecError::Spawn { program, source } => ExecutionFailure::new(
                ExecutionErrorKind::ContainerUnavailable,
                format!("Cannot launch {program}: {source}"),
            ),
            ExecError::Timeout(after) => ExecutionFailure::new(
                ExecutionErrorKind::Timeout,
                format!("Execution timed out after {}s", after.as_secs_f64()),
            ),
            ExecError::Transport(message) => {
                ExecutionFailure::new(ExecutionErrorKind::MalformedOutput, message)
            }
        };
        warn!(kind = %failure.kind, message = %failure.message, "Execution failed");
        failure.in_container(&target.name)
    }

    async fn classify_output(&self, output: ProcessOutput, target: &ContainerRef) -> ExecutionResult {
        if let Some(message) = runtime_failure(&output) {
            if matches!(output.exit_code, 125 | 137) {
                self.invalidate(target.role).await;
            }
            warn!(exit_code = output.exit_code, message = %message, "Container runtime failure");
            return ExecutionResult::Failure(
                ExecutionFailure::new(ExecutionErrorKind::ContainerUnavailable, message)
                    .in_container(&target.name)
                    .with_output(&output),
            );
        }

        if let Some(envelope) = harness::extract_last_json(&output.stdout) {
            return match harness::interpret(envelope) {
                Ok(value) => {
                    debug!("Execution succeeded");
                    ExecutionResult::Success { value }
                }
                Err(code_error) => {
                    let mut failure = ExecutionFailure::new(
                        ExecutionErrorKind::ExecutedCodeError,
                        code_error.message,
                    )
                    .in_container(&target.name)
                    .with_output(&output);
                    failure.error_type = code_error.error_type;
                    failure.traceback = code_error.traceback;
                    ExecutionResult::Failure(failure)
                }
            };
        }

        let failure = if output.exit_code == 0 {
            ExecutionFailure::new(
                ExecutionErrorKind::MalformedOutput,
                "Process produced no JSON result line",
            )
        } else {
            let mut failure = ExecutionFailure::new(
                ExecutionErrorKind::ExecutedCodeError,
                self.diagnose_exit(&output),
            );
            if let Some((error_type, _)) = harness::traceback_summary(&output.stderr) {
                failure.error_type = Some(error_type);
            }
            failure
        };
        warn!(kind = %failure.kind, exit_code = output.exit_code, "Execution produced no result");
        ExecutionResult::Failure(failure.in_container(&target.name).with_output(&output))
    }

    fn diagnose_exit(&self, output: &ProcessOutput) -> String {
        let stderr = output.stderr.to_ascii_lowercase();
        let db = &self.config.database;
        if stderr.contains("database") && stderr.contains("does not exist") {
            format!("Database '{}' does not exist. Check ODOO_DB_NAME", db.name)
        } else if stderr.contains("could not connect") {
            format!(
                "Cannot connect to database at {}:{}. Check the database is running",
                db.host, db.port
            )
        } else if let Some((error_type, message)) = harness::traceback_summary(&output.stderr) {
            format!("{error_type}: {message}")
        } else {
            let last = output
                .stderr
                .lines()
                .rev()
                .map(str::trim)
                .find(|l| !l.is_empty())
                .unwrap_or("no output");
            format!("Command failed with exit code {}: {last}", output.exit_code)
        }
    }

    fn effective_timeout(&self, timeout: Option<Duration>) -> Duration {
        match timeout {
            Some(t) if t.is_zero() => {
                warn!("Zero timeout requested, using the configured default");
                self.default_timeout()
            }
            Some(t) => t,
            None => self.default_timeout(),
        }
    }

    /// Resolve `role` to a running container, starting services if allowed.
    pub async fn resolve(&self, role: ContainerRole) -> Result<ContainerRef, ExecutionFailure> {
        if let Some(cached) = self.cached(role).await {
            return Ok(cached);
        }

        let flight = self.flight(role).await;
        let _guard = flight.lock().await;

        // Another caller may have finished resolving while we waited
        if let Some(cached) = self.cached(role).await {
            return Ok(cached);
        }

        let candidates = self.candidates(role);
        if candidates.is_empty() {
            return Err(ExecutionFailure::new(
                ExecutionErrorKind::ContainerUnavailable,
                format!(
                    "No container name can be derived for role '{role}'. Set ODOO_PROJECT_NAME or a container override"
                ),
            ));
        }

        if let Some(found) = self.find_running(role, &candidates).await {
            return Ok(self.remember(found).await);
        }

        if !self.config.autostart {
            return Err(ExecutionFailure::new(
                ExecutionErrorKind::ContainerUnavailable,
                format!("No running container for role '{role}' (tried {candidates:?}) and autostart is disabled"),
            ));
        }

        let services = self.config.essential_services(role);
        info!(role = %role, services = ?services, "Container not running, starting services");
        if let Err(e) = self
            .discovery
            .start_services(&services, self.config.timeouts.startup_wait())
            .await
        {
            return Err(ExecutionFailure::new(
                ExecutionErrorKind::ContainerUnavailable,
                format!("Failed to start services {services:?}: {e}"),
            ));
        }

        match self.find_running(role, &candidates).await {
            Some(found) => Ok(self.remember(found).await),
            None => Err(ExecutionFailure::new(
                ExecutionErrorKind::ContainerUnavailable,
                format!("No running container for role '{role}' after start (tried {candidates:?})"),
            )),
        }
    }

    /// Cheap availability check: cache or a running candidate, never starts anything.
    pub async fn probe(&self) -> bool {
        let role = self.config.exec_role;
        if self.cached(role).await.is_some() {
            return true;
        }
        let candidates = self.candidates(role);
        match self.find_running(role, &candidates).await {
            Some(found) => {
                self.remember(found).await;
                true
            }
            None => false,
        }
    }

    /// Report every role's container and state.
    pub async fn container_status(&self) -> Vec<RoleStatus> {
        let mut statuses = Vec::with_capacity(ContainerRole::ALL.len());
        for role in ContainerRole::ALL {
            let mut status = RoleStatus {
                role,
                container: None,
                state: "missing".into(),
                running: false,
            };
            for candidate in self.candidates(role) {
                match self.discovery.state(&candidate).await {
                    Ok(ContainerState::Missing) => {}
                    Ok(state) => {
                        status.running = state.is_running();
                        status.state = state.label().to_string();
                        status.container = Some(candidate);
                        break;
                    }
                    Err(e) => {
                        status.state = format!("error: {e}");
                        status.container = Some(candidate);
                        break;
                    }
                }
            }
            statuses.push(status);
        }
        statuses
    }

    /// Drop the cached container for `role`.
    pub async fn invalidate(&self, role: ContainerRole) {
        if self.resolved.write().await.remove(&role).is_some() {
            info!(role = %role, "Invalidated cached container");
        }
    }

    /// Drop every cached container (session teardown).
    pub async fn clear(&self) {
        self.resolved.write().await.clear();
        self.flights.lock().await.clear();
    }

    async fn cached(&self, role: ContainerRole) -> Option<ContainerRef> {
        self.resolved.read().await.get(&role).cloned()
    }

    async fn remember(&self, found: ContainerRef) -> ContainerRef {
        info!(role = %found.role, container = %found.name, "Resolved container");
        self.resolved
            .write()
            .await
            .insert(found.role, found.clone());
        found
    }

    async fn flight(&self, role: ContainerRole) -> Arc<Mutex<()>> {
        let mut flights = self.flights.lock().await;
        Arc::clone(flights.entry(role).or_insert_with(|| Arc::new(Mutex::new(()))))
    }

    fn candidates(&self, role: ContainerRole) -> Vec<String> {
        self.config
            .container_candidates(role)
            .into_iter()
            .filter(|name| {
                let safe = is_safe_container_name(name);
                if !safe {
                    warn!(container = %name, "Skipping unsafe container name");
                }
                safe
            })
            .collect()
    }

    async fn find_running(&self, role: ContainerRole, candidates: &[String]) -> Option<ContainerRef> {
        for candidate in candidates {
            match self.discovery.state(candidate).await {
                Ok(ContainerState::Running) => {
                    return Some(ContainerRef {
                        name: candidate.clone(),
                        role,
                    })
                }
                Ok(state) => debug!(container = %candidate, state = %state.label(), "Candidate not running"),
                Err(e) => debug!(container = %candidate, error = %e, "Candidate inspection failed"),
            }
        }
        None
    }
}

/// Exit codes that come from the container runtime rather than the code.
fn runtime_failure(output: &ProcessOutput) -> Option<String> {
    let stderr = output.stderr.to_ascii_lowercase();
    match output.exit_code {
        125 if stderr.contains("executable file not found") => Some(
            "Runtime executable not found in container; check the configured shell command"
                .to_string(),
        ),
        125 => Some(format!("Docker exec failed: {}", output.stderr.trim())),
        126 => Some(format!(
            "Permission denied executing command in container: {}",
            output.stderr.trim()
        )),
        137 => Some(
            "Container killed the process (likely out of memory). Reduce the data size or raise memory limits"
                .to_string(),
        ),
        _ => None,
    }
}

/// Container names are passed as process arguments; keep them boring.
pub fn is_safe_container_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
}
