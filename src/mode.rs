//! Mode resolution: decide per call whether to answer from the live runtime
//! or from static analysis of the addon sources.
//!
//! | requested  | live backend | decision                        |
//! |------------|--------------|---------------------------------|
//! | `fs`       | any          | `Static`, `Requested`           |
//! | `db`       | any          | `Static`, `Requested` (reserved)|
//! | `registry` | available    | `Live`, `Requested`             |
//! | `registry` | unavailable  | error, no fallback              |
//! | `auto`     | available    | `Live`, `Requested`             |
//! | `auto`     | unavailable  | `Static`, `Fallback`            |
//!
//! Decisions are computed fresh on every call and never cached.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rmcp::schemars;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::exec::ExecutionManager;

/// Mode asked for by the caller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum RequestedMode {
    #[default]
    Auto,
    Fs,
    Registry,
    Db,
}

impl FromStr for RequestedMode {
    type Err = ModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "auto" => Ok(Self::Auto),
            "fs" => Ok(Self::Fs),
            "registry" => Ok(Self::Registry),
            "db" => Ok(Self::Db),
            other => Err(ModeError::UnknownMode(other.to_string())),
        }
    }
}

impl fmt::Display for RequestedMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Auto => "auto",
            Self::Fs => "fs",
            Self::Registry => "registry",
            Self::Db => "db",
        };
        f.write_str(name)
    }
}

/// Strategy chosen for one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    Live,
    Static,
}

/// Why the strategy was chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DecisionReason {
    Requested,
    Fallback,
    Unavailable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ModeDecision {
    pub chosen: Strategy,
    pub reason: DecisionReason,
}

impl ModeDecision {
    const fn new(chosen: Strategy, reason: DecisionReason) -> Self {
        Self { chosen, reason }
    }

    /// Name reported back to callers as `mode_used`.
    pub const fn mode_used(&self) -> &'static str {
        match self.chosen {
            Strategy::Live => "registry",
            Strategy::Static => "fs",
        }
    }

    /// Static answers are best effort.
    pub const fn data_quality(&self) -> &'static str {
        match self.chosen {
            Strategy::Live => "complete",
            Strategy::Static => "approximate",
        }
    }
}

#[derive(Debug, Error)]
pub enum ModeError {
    #[error("unknown mode '{0}', expected one of auto, fs, registry, db")]
    UnknownMode(String),

    #[error("live registry requested but the runtime is unavailable: {reason}")]
    LiveUnavailable {
        decision: ModeDecision,
        reason: String,
    },
}

/// Availability check against the live backend.
#[async_trait]
pub trait AvailabilityProbe: Send + Sync {
    /// Cheap presence check. Must not start anything.
    async fn is_available(&self) -> bool;

    /// Make the live backend usable, starting it if allowed.
    async fn ensure_available(&self) -> Result<(), String>;
}

#[async_trait]
impl AvailabilityProbe for ExecutionManager {
    async fn is_available(&self) -> bool {
        self.probe().await
    }

    async fn ensure_available(&self) -> Result<(), String> {
        self.resolve(self.config().exec_role)
            .await
            .map(|_| ())
            .map_err(|failure| failure.message)
    }
}

pub struct ModeResolver {
    probe: Arc<dyn AvailabilityProbe>,
    probe_timeout: Duration,
}

impl ModeResolver {
    pub fn new(probe: Arc<dyn AvailabilityProbe>, probe_timeout: Duration) -> Self {
        Self {
            probe,
            probe_timeout,
        }
    }

    pub async fn resolve(&self, requested: RequestedMode) -> Result<ModeDecision, ModeError> {
        let decision = match requested {
            RequestedMode::Fs | RequestedMode::Db => {
                ModeDecision::new(Strategy::Static, DecisionReason::Requested)
            }
            RequestedMode::Registry => {
                if let Err(reason) = self.probe.ensure_available().await {
                    warn!(reason = %reason, "Live registry requested but unavailable");
                    return Err(ModeError::LiveUnavailable {
                        decision: ModeDecision::new(Strategy::Live, DecisionReason::Unavailable),
                        reason,
                    });
                }
                ModeDecision::new(Strategy::Live, DecisionReason::Requested)
            }
            RequestedMode::Auto => {
                if self.probe_once().await {
                    ModeDecision::new(Strategy::Live, DecisionReason::Requested)
                } else {
                    info!("Live backend unavailable, falling back to static analysis");
                    ModeDecision::new(Strategy::Static, DecisionReason::Fallback)
                }
            }
        };
        debug!(requested = %requested, decision = ?decision, "Resolved mode");
        Ok(decision)
    }

    /// One bounded probe; a probe that overruns counts as unavailable.
    async fn probe_once(&self) -> bool {
        match tokio::time::timeout(self.probe_timeout, self.probe.is_available()).await {
            Ok(available) => available,
            Err(_) => {
                warn!(timeout = ?self.probe_timeout, "Availability probe timed out");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::{MockDiscovery, MockExec};
    use crate::backend::{ContainerDiscovery, ProcessExec};
    use crate::config::Config;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedProbe {
        available: bool,
        delay: Duration,
        ensure_calls: AtomicUsize,
    }

    impl FixedProbe {
        fn new(available: bool) -> Self {
            Self {
                available,
                delay: Duration::ZERO,
                ensure_calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl AvailabilityProbe for FixedProbe {
        async fn is_available(&self) -> bool {
            tokio::time::sleep(self.delay).await;
            self.available
        }

        async fn ensure_available(&self) -> Result<(), String> {
            self.ensure_calls.fetch_add(1, Ordering::SeqCst);
            if self.available {
                Ok(())
            } else {
                Err("no container".into())
            }
        }
    }

    fn resolver(probe: FixedProbe) -> ModeResolver {
        ModeResolver::new(Arc::new(probe), Duration::from_millis(200))
    }

    #[tokio::test]
    async fn fs_and_db_are_static_requested() {
        let resolver = resolver(FixedProbe::new(true));
        for mode in [RequestedMode::Fs, RequestedMode::Db] {
            let decision = resolver.resolve(mode).await.unwrap();
            assert_eq!(decision.chosen, Strategy::Static);
            assert_eq!(decision.reason, DecisionReason::Requested);
        }
    }

    #[tokio::test]
    async fn auto_prefers_live() {
        let decision = resolver(FixedProbe::new(true))
            .resolve(RequestedMode::Auto)
            .await
            .unwrap();
        assert_eq!(decision.chosen, Strategy::Live);
        assert_eq!(decision.mode_used(), "registry");
    }

    #[tokio::test]
    async fn auto_falls_back_when_unavailable() {
        let decision = resolver(FixedProbe::new(false))
            .resolve(RequestedMode::Auto)
            .await
            .unwrap();
        assert_eq!(decision, ModeDecision::new(Strategy::Static, DecisionReason::Fallback));
        assert_eq!(decision.data_quality(), "approximate");
    }

    #[tokio::test]
    async fn auto_treats_slow_probe_as_unavailable() {
        let mut probe = FixedProbe::new(true);
        probe.delay = Duration::from_secs(5);
        let decision = resolver(probe).resolve(RequestedMode::Auto).await.unwrap();
        assert_eq!(decision.reason, DecisionReason::Fallback);
    }

    #[tokio::test]
    async fn registry_fails_without_fallback() {
        let err = resolver(FixedProbe::new(false))
            .resolve(RequestedMode::Registry)
            .await
            .unwrap_err();
        match err {
            ModeError::LiveUnavailable { decision, reason } => {
                assert_eq!(decision.chosen, Strategy::Live);
                assert_eq!(decision.reason, DecisionReason::Unavailable);
                assert_eq!(reason, "no container");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn registry_is_live_when_available() {
        let probe = Arc::new(FixedProbe::new(true));
        let resolver = ModeResolver::new(Arc::clone(&probe) as Arc<dyn AvailabilityProbe>, Duration::from_secs(1));
        let decision = resolver.resolve(RequestedMode::Registry).await.unwrap();
        assert_eq!(decision, ModeDecision::new(Strategy::Live, DecisionReason::Requested));
        assert_eq!(probe.ensure_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn auto_with_unreachable_manager_never_errors() {
        // No prefix configured: nothing can be resolved at all
        let discovery = Arc::new(MockDiscovery::default());
        let manager = ExecutionManager::new(
            Arc::new(Config::default()),
            Arc::new(MockExec::stdout("{}")) as Arc<dyn ProcessExec>,
            Arc::clone(&discovery) as Arc<dyn ContainerDiscovery>,
        );
        let resolver = ModeResolver::new(Arc::new(manager), Duration::from_secs(1));

        let decision = resolver.resolve(RequestedMode::Auto).await.unwrap();
        assert_eq!(decision.chosen, Strategy::Static);
        assert_eq!(decision.reason, DecisionReason::Fallback);
        assert!(resolver.resolve(RequestedMode::Registry).await.is_err());
        assert_eq!(discovery.starts(), 0);
    }

    #[test]
    fn parse_modes() {
        assert_eq!("AUTO".parse::<RequestedMode>().unwrap(), RequestedMode::Auto);
        assert_eq!("".parse::<RequestedMode>().unwrap(), RequestedMode::Auto);
        assert_eq!(" fs ".parse::<RequestedMode>().unwrap(), RequestedMode::Fs);
        assert_eq!("registry".parse::<RequestedMode>().unwrap(), RequestedMode::Registry);
        assert!(matches!(
            "live".parse::<RequestedMode>(),
            Err(ModeError::UnknownMode(m)) if m == "live"
        ));
    }

    #[test]
    fn deserialize_lowercase() {
        let mode: RequestedMode = serde_json::from_str("\"db\"").unwrap();
        assert_eq!(mode, RequestedMode::Db);
    }
}
