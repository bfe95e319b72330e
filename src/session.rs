//! Per-server session state.
//!
//! One `InspectSession` is built at startup and shared by every tool call.
//! It owns the execution manager (and with it the cached container names),
//! the mode resolver, and both registry handles. The static registry is
//! built on first use and then kept read-only for the rest of the session.

use std::sync::Arc;

use tokio::sync::OnceCell;
use tracing::{info, warn};

use crate::backend::{ContainerDiscovery, ProcessExec};
use crate::config::Config;
use crate::exec::ExecutionManager;
use crate::mode::{ModeDecision, ModeError, ModeResolver, RequestedMode, Strategy};
use crate::registry::{InMemoryRegistry, Registry, RemoteRegistry};
use crate::size_guard::SizeGuard;
use crate::static_index;

pub struct InspectSession {
    config: Arc<Config>,
    manager: Arc<ExecutionManager>,
    resolver: ModeResolver,
    live: Registry,
    static_registry: OnceCell<Arc<InMemoryRegistry>>,
    size_guard: SizeGuard,
}

impl InspectSession {
    pub fn new(
        config: Config,
        exec: Arc<dyn ProcessExec>,
        discovery: Arc<dyn ContainerDiscovery>,
    ) -> Self {
        let config = Arc::new(config);
        let manager = Arc::new(ExecutionManager::new(Arc::clone(&config), exec, discovery));
        Self::with_manager(config, manager)
    }

    /// Build around an existing manager (tests tune its retry policy).
    pub fn with_manager(config: Arc<Config>, manager: Arc<ExecutionManager>) -> Self {
        if !config.has_container_targets() {
            warn!("No container prefix or override configured; live calls will be unavailable");
        }
        let resolver = ModeResolver::new(
            Arc::clone(&manager) as Arc<dyn crate::mode::AvailabilityProbe>,
            config.timeouts.probe(),
        );
        let live = Registry::Remote(RemoteRegistry::new(
            Arc::clone(&manager),
            config.registry_batch_size,
        ));
        let size_guard = SizeGuard::new(config.max_response_tokens);
        Self {
            config,
            manager,
            resolver,
            live,
            static_registry: OnceCell::new(),
            size_guard,
        }
    }

    /// Use `registry` as the static source instead of scanning addon roots.
    #[must_use]
    pub fn with_static_registry(self, registry: InMemoryRegistry) -> Self {
        let cell = OnceCell::new();
        if cell.set(Arc::new(registry)).is_err() {
            warn!("Static registry already initialized");
        }
        Self {
            static_registry: cell,
            ..self
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn manager(&self) -> &ExecutionManager {
        &self.manager
    }

    pub const fn size_guard(&self) -> &SizeGuard {
        &self.size_guard
    }

    pub async fn decide(&self, requested: RequestedMode) -> Result<ModeDecision, ModeError> {
        self.resolver.resolve(requested).await
    }

    /// Registry backing `strategy`.
    pub async fn registry_for(&self, strategy: Strategy) -> Registry {
        match strategy {
            Strategy::Live => self.live.clone(),
            Strategy::Static => Registry::InMemory(self.static_registry().await),
        }
    }

    async fn static_registry(&self) -> Arc<InMemoryRegistry> {
        let registry = self
            .static_registry
            .get_or_init(|| async {
                let roots = self.config.host_addons_paths.clone();
                if roots.is_empty() {
                    warn!("No host addons path configured (ODOO_HOST_ADDONS_PATH); static index is empty");
                }
                match tokio::task::spawn_blocking(move || static_index::build_index(&roots)).await {
                    Ok(registry) => Arc::new(registry),
                    Err(e) => {
                        warn!(error = %e, "Static index build failed");
                        Arc::new(InMemoryRegistry::default())
                    }
                }
            })
            .await;
        Arc::clone(registry)
    }

    /// Release cached container names.
    pub async fn shutdown(&self) {
        self.manager.clear().await;
        info!("Session shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::{MockDiscovery, MockExec};
    use crate::exec::ContainerRole;
    use std::fs;

    fn session(config: Config) -> InspectSession {
        InspectSession::new(
            config,
            Arc::new(MockExec::stdout("{\"success\": true, \"value\": []}")),
            Arc::new(MockDiscovery::with_running(&["acme-script-runner-1"])),
        )
    }

    #[tokio::test]
    async fn static_registry_is_scanned_once_from_host_roots() {
        let dir = tempfile::tempdir().unwrap();
        let addon = dir.path().join("stock");
        fs::create_dir_all(&addon).unwrap();
        fs::write(addon.join("__manifest__.py"), "{}").unwrap();
        fs::write(
            addon.join("models.py"),
            "class StockMove(models.Model):\n    _name = 'stock.move'\n",
        )
        .unwrap();

        let mut config = Config::default();
        config.host_addons_paths = vec![dir.path().to_path_buf()];
        let session = session(config);

        let registry = session.registry_for(Strategy::Static).await;
        assert_eq!(registry.count().await.unwrap(), 1);
        assert!(!registry.is_live());

        // Later sources are not picked up: the snapshot is fixed per session
        fs::write(
            addon.join("more.py"),
            "class StockPicking(models.Model):\n    _name = 'stock.picking'\n",
        )
        .unwrap();
        let again = session.registry_for(Strategy::Static).await;
        assert_eq!(again.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn live_strategy_uses_remote_registry() {
        let mut config = Config::default();
        config.container_prefix = Some("acme".into());
        let session = session(config);
        assert!(session.registry_for(Strategy::Live).await.is_live());
    }

    #[tokio::test]
    async fn injected_static_registry_is_used() {
        let session = session(Config::default()).with_static_registry(
            InMemoryRegistry::from_entities([crate::registry::Entity::named("x.y")]),
        );
        let registry = session.registry_for(Strategy::Static).await;
        assert_eq!(registry.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn shutdown_releases_cached_containers() {
        let mut config = Config::default();
        config.container_prefix = Some("acme".into());
        let session = session(config);
        session.manager().resolve(ContainerRole::ScriptRunner).await.unwrap();
        assert!(session.manager().probe().await);

        session.shutdown().await;
        // Probe re-inspects rather than answering from the cache
        assert!(session.manager().probe().await);
    }

    #[tokio::test]
    async fn auto_falls_back_without_containers() {
        let session = session(Config::default());
        let decision = session.decide(RequestedMode::Auto).await.unwrap();
        assert_eq!(decision.chosen, Strategy::Static);
    }
}
