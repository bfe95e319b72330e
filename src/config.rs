//! Configuration for the inspection daemon.
//!
//! A base configuration may be supplied as JSON (a `--config` file or the
//! `ODOO_INSPECT_CONFIG` environment variable). The conventional `ODOO_*`
//! environment variables are then layered on top.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::exec::ContainerRole;

/// Top-level configuration for the daemon.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Compose project name; containers are named `{prefix}-{service}-1`.
    pub container_prefix: Option<String>,

    /// Explicit container names that bypass the naming convention.
    pub containers: ContainerOverrides,

    /// Role whose container runs harnessed code.
    pub exec_role: ContainerRole,

    /// Database connection used by the runtime shell.
    pub database: DatabaseConfig,

    /// Addons path as seen from inside the container (comma separated).
    pub addons_path: String,

    /// Addon roots on the host, scanned by the static strategy.
    pub host_addons_paths: Vec<PathBuf>,

    /// Compose settings used for start-on-demand.
    pub compose: ComposeConfig,

    /// Whether missing containers may be started through compose.
    pub autostart: bool,

    /// Include raw process output in failure payloads.
    pub enhanced_errors: bool,

    /// Per-operation timeouts.
    pub timeouts: TimeoutConfig,

    /// Response budget in estimated tokens.
    pub max_response_tokens: usize,

    /// Entities resolved per remote detail round trip.
    pub registry_batch_size: usize,

    /// Replaces the default `odoo-bin shell` invocation when set.
    pub shell_command: Option<Vec<String>>,
}

/// Per-role container name overrides.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ContainerOverrides {
    pub primary: Option<String>,
    pub web: Option<String>,
    pub script_runner: Option<String>,
    pub database: Option<String>,
}

impl ContainerOverrides {
    /// Override configured for `role`, if any.
    pub fn get(&self, role: ContainerRole) -> Option<&str> {
        let value = match role {
            ContainerRole::Primary => self.primary.as_deref(),
            ContainerRole::Web => self.web.as_deref(),
            ContainerRole::ScriptRunner => self.script_runner.as_deref(),
            ContainerRole::Database => self.database.as_deref(),
        };
        value.map(str::trim).filter(|v| !v.is_empty())
    }
}

/// Database settings passed to the runtime shell.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub name: String,
    pub host: String,
    pub port: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            name: "odoo".into(),
            host: "database".into(),
            port: "5432".into(),
        }
    }
}

/// Compose invocation settings for starting services.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ComposeConfig {
    /// Directory compose runs from.
    pub project_dir: Option<PathBuf>,

    /// Compose files, relative to `project_dir` unless absolute.
    pub files: Vec<String>,

    /// Env file passed with `--env-file`.
    pub env_file: Option<PathBuf>,
}

/// Timeouts in seconds, exposed as `Duration`s.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Default budget for one harnessed execution.
    pub execute_seconds: u64,

    /// Budget for the availability probe used by `auto` mode.
    pub probe_seconds: u64,

    /// Cold-start wait after a start-on-demand action.
    pub startup_wait_seconds: u64,

    /// Default budget for module install/update runs.
    pub module_update_seconds: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            execute_seconds: default_execute_timeout(),
            probe_seconds: 3,
            startup_wait_seconds: 600,
            module_update_seconds: 600,
        }
    }
}

/// Every timeout is at least this long; zero would expire every call at once.
const MIN_TIMEOUT_SECS: u64 = 1;

impl TimeoutConfig {
    pub const fn execute(&self) -> Duration {
        at_least_min(self.execute_seconds)
    }

    pub const fn probe(&self) -> Duration {
        at_least_min(self.probe_seconds)
    }

    pub const fn startup_wait(&self) -> Duration {
        at_least_min(self.startup_wait_seconds)
    }

    pub const fn module_update(&self) -> Duration {
        at_least_min(self.module_update_seconds)
    }
}

const fn at_least_min(secs: u64) -> Duration {
    if secs < MIN_TIMEOUT_SECS {
        Duration::from_secs(MIN_TIMEOUT_SECS)
    } else {
        Duration::from_secs(secs)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            container_prefix: None,
            containers: ContainerOverrides::default(),
            exec_role: ContainerRole::ScriptRunner,
            database: DatabaseConfig::default(),
            addons_path: default_addons_path(),
            host_addons_paths: Vec::new(),
            compose: ComposeConfig::default(),
            autostart: true,
            enhanced_errors: false,
            timeouts: TimeoutConfig::default(),
            max_response_tokens: default_max_response_tokens(),
            registry_batch_size: default_batch_size(),
            shell_command: None,
        }
    }
}

impl Config {
    /// Load configuration from an optional JSON file, `ODOO_INSPECT_CONFIG`,
    /// and the `ODOO_*` environment variables, in that order.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = if let Some(path) = path {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            serde_json::from_str(&raw)
                .with_context(|| format!("Failed to parse config file {}", path.display()))?
        } else if let Ok(raw) = std::env::var("ODOO_INSPECT_CONFIG") {
            serde_json::from_str(&raw).context("Failed to parse ODOO_INSPECT_CONFIG")?
        } else {
            Self::default()
        };

        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Layer environment-style overrides onto this configuration.
    ///
    /// `lookup` maps a variable name to its value; unparsable numeric values
    /// are ignored with a warning.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(v) = get("ODOO_PROJECT_NAME") {
            self.container_prefix = Some(v);
        }
        if let Some(v) = get("ODOO_CONTAINER_NAME") {
            self.containers.primary = Some(v);
        }
        if let Some(v) = get("ODOO_SCRIPT_RUNNER_CONTAINER") {
            self.containers.script_runner = Some(v);
        }
        if let Some(v) = get("ODOO_WEB_CONTAINER") {
            self.containers.web = Some(v);
        }
        if let Some(v) = get("ODOO_DB_NAME") {
            self.database.name = v;
        }
        if let Some(v) = get("ODOO_DB_HOST") {
            self.database.host = v;
        }
        if let Some(v) = get("ODOO_DB_PORT") {
            self.database.port = v;
        }
        if let Some(v) = get("ODOO_ADDONS_PATH") {
            self.addons_path = v;
        }
        if let Some(v) = get("ODOO_HOST_ADDONS_PATH") {
            self.host_addons_paths = split_list(&v).into_iter().map(PathBuf::from).collect();
        }
        if let Some(v) = get("ODOO_PROJECT_DIR") {
            self.compose.project_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = get("ODOO_COMPOSE_FILES") {
            self.compose.files = split_list(&v);
        }
        if let Some(v) = get("ODOO_ENV_FILE") {
            self.compose.env_file = Some(PathBuf::from(v));
        }
        if let Some(v) = get("ODOO_MCP_ENHANCED_ERRORS") {
            self.enhanced_errors = parse_bool(&v);
        }
        if let Some(v) = get("ODOO_AUTOSTART") {
            self.autostart = parse_bool(&v);
        }
        if let Some(v) = get("ODOO_EXEC_TIMEOUT") {
            match v.parse::<u64>() {
                Ok(0) => warn!("Ignoring ODOO_EXEC_TIMEOUT=0"),
                Ok(secs) => self.timeouts.execute_seconds = secs,
                Err(e) => warn!(value = %v, error = %e, "Ignoring invalid ODOO_EXEC_TIMEOUT"),
            }
        }
        if let Some(v) = get("ODOO_MAX_RESPONSE_TOKENS") {
            match v.parse() {
                Ok(tokens) => self.max_response_tokens = tokens,
                Err(e) => warn!(value = %v, error = %e, "Ignoring invalid ODOO_MAX_RESPONSE_TOKENS"),
            }
        }
    }

    /// Whether any container name can be derived at all.
    pub fn has_container_targets(&self) -> bool {
        self.prefix().is_some()
            || [
                ContainerRole::Primary,
                ContainerRole::Web,
                ContainerRole::ScriptRunner,
            ]
            .into_iter()
            .any(|role| self.containers.get(role).is_some())
    }

    fn prefix(&self) -> Option<&str> {
        self.container_prefix
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty())
    }

    /// Compose service name backing `role`.
    ///
    /// The database service follows the DB host when it is a bare service
    /// name; `None` means the database is not a container in this stack.
    pub fn service_name(&self, role: ContainerRole) -> Option<String> {
        match role {
            ContainerRole::Database => {
                let host = self.database.host.trim();
                let is_service = !host.is_empty()
                    && !matches!(host.to_ascii_lowercase().as_str(), "localhost" | "127.0.0.1")
                    && !host.contains('.')
                    && host.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
                is_service.then(|| host.to_string())
            }
            other => Some(other.slug().to_string()),
        }
    }

    /// Container names to try for `role`, most specific first, deduplicated.
    pub fn container_candidates(&self, role: ContainerRole) -> Vec<String> {
        let mut candidates = Vec::new();
        if let Some(name) = self.containers.get(role) {
            candidates.push(name.to_string());
        }
        if matches!(role, ContainerRole::ScriptRunner) {
            if let Some(name) = self.containers.get(ContainerRole::Primary) {
                candidates.push(name.to_string());
            }
        }
        if let Some(prefix) = self.prefix() {
            if let Some(service) = self.service_name(role) {
                candidates.push(format!("{prefix}-{service}-1"));
            }
            if matches!(role, ContainerRole::Primary | ContainerRole::ScriptRunner) {
                candidates.push(format!("{prefix}-odoo-1"));
                candidates.push(format!("{prefix}-app-1"));
            }
        }

        let mut unique: Vec<String> = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            if !unique.contains(&candidate) {
                unique.push(candidate);
            }
        }
        unique
    }

    /// Services started together when `role` has to be brought up.
    pub fn essential_services(&self, role: ContainerRole) -> Vec<String> {
        let mut services = Vec::new();
        for service in [
            self.service_name(ContainerRole::Database),
            self.service_name(ContainerRole::ScriptRunner),
            self.service_name(role),
        ]
        .into_iter()
        .flatten()
        {
            if !services.contains(&service) {
                services.push(service);
            }
        }
        services
    }

    /// Command that starts an interactive runtime shell reading code on stdin.
    pub fn shell_command(&self) -> Vec<String> {
        if let Some(custom) = self.shell_command.as_ref().filter(|c| !c.is_empty()) {
            return custom.clone();
        }
        vec![
            "/odoo/odoo-bin".into(),
            "shell".into(),
            "--database".into(),
            self.database.name.clone(),
            "--db_host".into(),
            self.database.host.clone(),
            "--db_port".into(),
            self.database.port.clone(),
            "--addons-path".into(),
            self.addons_path.clone(),
            "--no-http".into(),
        ]
    }

    /// Command that installs or updates `modules` and exits.
    pub fn module_command(&self, modules: &[String], install: bool) -> Vec<String> {
        vec![
            "/odoo/odoo-bin".into(),
            format!("--database={}", self.database.name),
            format!("--db_host={}", self.database.host),
            format!("--db_port={}", self.database.port),
            format!("--addons-path={}", self.addons_path),
            "--stop-after-init".into(),
            if install { "-i" } else { "-u" }.into(),
            modules.join(","),
        ]
    }

    /// Create a config from a JSON string (for testing).
    #[cfg(test)]
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).context("Failed to parse JSON")?;
        Ok(config)
    }
}

fn split_list(raw: &str) -> Vec<String> {
    let parts: Vec<String> = raw
        .split([',', ':'])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect();
    debug!(count = parts.len(), "Parsed list override");
    parts
}

fn parse_bool(raw: &str) -> bool {
    matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn default_addons_path() -> String {
    "/opt/project/addons,/odoo/addons,/volumes/enterprise".into()
}

const fn default_execute_timeout() -> u64 {
    60
}

const fn default_max_response_tokens() -> usize {
    25_000
}

const fn default_batch_size() -> usize {
    50
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply_to_empty_json() {
        let config = Config::from_json("{}").unwrap();
        assert!(config.container_prefix.is_none());
        assert_eq!(config.exec_role, ContainerRole::ScriptRunner);
        assert_eq!(config.database.name, "odoo");
        assert_eq!(config.timeouts.execute(), Duration::from_secs(60));
        assert_eq!(config.timeouts.module_update(), Duration::from_secs(600));
        assert_eq!(config.timeouts.startup_wait(), Duration::from_secs(600));
        assert_eq!(config.max_response_tokens, 25_000);
        assert!(config.autostart);
        assert!(!config.enhanced_errors);
    }

    #[test]
    fn zero_timeouts_are_floored() {
        let json = r#"{ "timeouts": { "execute_seconds": 0, "probe_seconds": 0, "module_update_seconds": 0 } }"#;
        let config = Config::from_json(json).unwrap();
        assert_eq!(config.timeouts.execute(), Duration::from_secs(1));
        assert_eq!(config.timeouts.probe(), Duration::from_secs(1));
        assert_eq!(config.timeouts.module_update(), Duration::from_secs(1));

        let mut config = Config::default();
        config.apply_overrides(lookup(&[("ODOO_EXEC_TIMEOUT", "0")]));
        assert_eq!(config.timeouts.execute_seconds, 60);
        config.apply_overrides(lookup(&[("ODOO_EXEC_TIMEOUT", "5")]));
        assert_eq!(config.timeouts.execute_seconds, 5);
    }

    #[test]
    fn parse_partial_json() {
        let json = r#"{
            "container_prefix": "acme",
            "database": { "name": "prod" },
            "timeouts": { "execute_seconds": 15 },
            "enhanced_errors": true
        }"#;
        let config = Config::from_json(json).unwrap();
        assert_eq!(config.container_prefix.as_deref(), Some("acme"));
        assert_eq!(config.database.name, "prod");
        // Unspecified nested fields keep their defaults
        assert_eq!(config.database.port, "5432");
        assert_eq!(config.timeouts.execute_seconds, 15);
        assert_eq!(config.timeouts.probe_seconds, 3);
        assert!(config.enhanced_errors);
    }

    #[test]
    fn env_overrides_win_over_json() {
        let mut config = Config::from_json(r#"{"container_prefix": "json"}"#).unwrap();
        config.apply_overrides(lookup(&[
            ("ODOO_PROJECT_NAME", "env"),
            ("ODOO_MCP_ENHANCED_ERRORS", "true"),
            ("ODOO_HOST_ADDONS_PATH", "/a,/b:/c"),
            ("ODOO_EXEC_TIMEOUT", "90"),
        ]));
        assert_eq!(config.container_prefix.as_deref(), Some("env"));
        assert!(config.enhanced_errors);
        assert_eq!(
            config.host_addons_paths,
            vec![PathBuf::from("/a"), PathBuf::from("/b"), PathBuf::from("/c")]
        );
        assert_eq!(config.timeouts.execute_seconds, 90);
    }

    #[test]
    fn invalid_numeric_override_is_ignored() {
        let mut config = Config::default();
        config.apply_overrides(lookup(&[("ODOO_EXEC_TIMEOUT", "soon")]));
        assert_eq!(config.timeouts.execute_seconds, 60);
    }

    #[test]
    fn candidates_follow_naming_convention() {
        let mut config = Config::default();
        config.container_prefix = Some("acme".into());
        assert_eq!(
            config.container_candidates(ContainerRole::ScriptRunner),
            vec!["acme-script-runner-1", "acme-odoo-1", "acme-app-1"]
        );
        assert_eq!(config.container_candidates(ContainerRole::Web), vec!["acme-web-1"]);
        assert_eq!(
            config.container_candidates(ContainerRole::Database),
            vec!["acme-database-1"]
        );
    }

    #[test]
    fn overrides_come_first_and_dedupe() {
        let mut config = Config::default();
        config.container_prefix = Some("acme".into());
        config.containers.script_runner = Some("acme-script-runner-1".into());
        config.containers.primary = Some("custom".into());
        assert_eq!(
            config.container_candidates(ContainerRole::ScriptRunner),
            vec!["acme-script-runner-1", "custom", "acme-odoo-1", "acme-app-1"]
        );
    }

    #[test]
    fn no_prefix_no_candidates() {
        let config = Config::default();
        assert!(!config.has_container_targets());
        assert!(config.container_candidates(ContainerRole::ScriptRunner).is_empty());
    }

    #[test]
    fn database_service_only_for_bare_hosts() {
        let mut config = Config::default();
        config.container_prefix = Some("acme".into());
        config.database.host = "localhost".into();
        assert!(config.service_name(ContainerRole::Database).is_none());
        config.database.host = "db.internal".into();
        assert!(config.service_name(ContainerRole::Database).is_none());
        config.database.host = "postgres".into();
        assert_eq!(
            config.container_candidates(ContainerRole::Database),
            vec!["acme-postgres-1"]
        );
    }

    #[test]
    fn essential_services_are_unique() {
        let config = Config::default();
        assert_eq!(
            config.essential_services(ContainerRole::ScriptRunner),
            vec!["database", "script-runner"]
        );
        assert_eq!(
            config.essential_services(ContainerRole::Web),
            vec!["database", "script-runner", "web"]
        );
    }

    #[test]
    fn shell_command_uses_database_settings() {
        let mut config = Config::default();
        config.database.name = "prod".into();
        let cmd = config.shell_command();
        assert_eq!(cmd[0], "/odoo/odoo-bin");
        assert_eq!(cmd[1], "shell");
        assert!(cmd.windows(2).any(|w| w[0] == "--database" && w[1] == "prod"));
        assert_eq!(cmd.last().map(String::as_str), Some("--no-http"));

        config.shell_command = Some(vec!["python3".into(), "-".into()]);
        assert_eq!(config.shell_command(), vec!["python3", "-"]);
    }

    #[test]
    fn module_command_switches_install_flag() {
        let config = Config::default();
        let modules = vec!["sale".to_string(), "stock".to_string()];
        let update = config.module_command(&modules, false);
        assert!(update.contains(&"-u".to_string()));
        assert_eq!(update.last().map(String::as_str), Some("sale,stock"));
        let install = config.module_command(&modules, true);
        assert!(install.contains(&"-i".to_string()));
        assert!(install.contains(&"--stop-after-init".to_string()));
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"container_prefix": "filed", "registry_batch_size": 10}"#)
            .unwrap();
        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.registry_batch_size, 10);
    }

    #[test]
    fn load_missing_file_fails() {
        let result = Config::load(Some(Path::new("/nonexistent/config.json")));
        assert!(result.is_err());
    }
}
