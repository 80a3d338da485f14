mod reconcile;

pub use reconcile::{SyncReport, parse_service_id};

use crate::config::{BridgeConfig, DeregisterCheck};
use crate::domain::{
    ContainerRuntime, DeadContainer, HostResolver, RegistryAdapter, SIGNALED_EXIT_BIT, Service,
    short_id,
};
use crate::infra::SystemResolver;
use crate::services::{AdapterFactories, Extractor};
use anyhow::Result;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{error, info};

#[derive(Debug, Default)]
struct BridgeState {
    /// Registered services per container id.
    services: HashMap<String, Vec<Service>>,
    /// Exited containers still inside their TTL grace window.
    dead: HashMap<String, DeadContainer>,
}

/// Keeps registry entries in step with the containers running on this host.
///
/// Every operation that touches tracked state holds the state lock for its
/// whole duration, registry calls included, so add, remove, refresh and sync
/// never interleave.
pub struct Bridge {
    runtime: Arc<dyn ContainerRuntime>,
    registry: Arc<dyn RegistryAdapter>,
    resolver: Arc<dyn HostResolver>,
    config: BridgeConfig,
    state: Mutex<BridgeState>,
}

impl Bridge {
    /// Builds a bridge whose registry adapter is chosen by the URI scheme.
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        factories: &AdapterFactories,
        registry_uri: &str,
        config: BridgeConfig,
    ) -> Result<Self> {
        let registry = factories.build(registry_uri)?;
        Ok(Self::with_registry(runtime, Arc::from(registry), config))
    }

    pub fn with_registry(
        runtime: Arc<dyn ContainerRuntime>,
        registry: Arc<dyn RegistryAdapter>,
        config: BridgeConfig,
    ) -> Self {
        Self {
            runtime,
            registry,
            resolver: Arc::new(SystemResolver),
            config,
            state: Mutex::new(BridgeState::default()),
        }
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn HostResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn ping(&self) -> Result<()> {
        self.registry.ping()
    }

    /// Registers the services of a container. A container that is already
    /// tracked is left alone; one inside its TTL grace window is revived from
    /// its snapshot without being inspected again.
    pub fn add(&self, container_id: &str, quiet: bool) {
        let mut state = self.lock_state();
        self.add_locked(&mut state, container_id, quiet);
    }

    /// Stops tracking a container.
    ///
    /// With `deregister` the tracked services and any dead snapshot are
    /// deregistered. Without it the services move into the dead cache when a
    /// TTL is configured, or are dropped from tracking while staying in the
    /// registry when it is not.
    pub fn remove(&self, container_id: &str, deregister: bool) {
        let mut state = self.lock_state();
        let services = state.services.remove(container_id);

        if deregister {
            if let Some(services) = &services {
                self.deregister_all(container_id, services);
            }
            if let Some(dead) = state.dead.remove(container_id) {
                self.deregister_all(container_id, &dead.services);
            }
            return;
        }

        if self.config.refresh_ttl == 0 {
            return;
        }
        if let Some(services) = services.filter(|services| !services.is_empty()) {
            info!(
                container_id = short_id(container_id),
                ttl = self.config.refresh_ttl,
                "keeping services of exited container until TTL expires"
            );
            state.dead.insert(
                container_id.to_string(),
                DeadContainer::new(self.config.refresh_ttl, services),
            );
        }
    }

    /// Removes a container after it exited, deregistering according to the
    /// configured exit policy.
    pub fn remove_on_exit(&self, container_id: &str) {
        let deregister = self.should_deregister(container_id);
        self.remove(container_id, deregister);
    }

    /// Ages the dead cache by one refresh interval and refreshes every tracked
    /// service with the registry.
    pub fn refresh(&self) {
        let mut state = self.lock_state();
        let elapsed = self.config.refresh_interval;

        state.dead.retain(|container_id, dead| {
            let expired = dead.decay(elapsed);
            if expired {
                info!(container_id = short_id(container_id), "dead container TTL expired");
            }
            !expired
        });

        for (container_id, services) in &state.services {
            for service in services {
                match self.registry.refresh(service) {
                    Ok(()) => info!(
                        container_id = short_id(container_id),
                        service_id = %service.id,
                        "refreshed service"
                    ),
                    Err(e) => error!(service_id = %service.id, error = %e, "refresh failed"),
                }
            }
        }
    }

    /// Services currently tracked for a container.
    pub fn tracked_services(&self, container_id: &str) -> Vec<Service> {
        self.lock_state()
            .services
            .get(container_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn tracked_containers(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock_state().services.keys().cloned().collect();
        ids.sort_unstable();
        ids
    }

    pub fn dead_container(&self, container_id: &str) -> Option<DeadContainer> {
        self.lock_state().dead.get(container_id).cloned()
    }

    fn lock_state(&self) -> MutexGuard<'_, BridgeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn add_locked(&self, state: &mut BridgeState, container_id: &str, quiet: bool) -> usize {
        if let Some(dead) = state.dead.remove(container_id) {
            info!(container_id = short_id(container_id), "reviving services of dead container");
            state.services.insert(container_id.to_string(), dead.services);
        }

        if state.services.contains_key(container_id) {
            info!(container_id = short_id(container_id), "container already exists, ignoring");
            return 0;
        }

        let container = match self.runtime.inspect_container(container_id) {
            Ok(container) => container,
            Err(e) => {
                error!(
                    container_id = short_id(container_id),
                    error = %e,
                    "unable to inspect container"
                );
                return 0;
            }
        };

        let extractor = Extractor::new(&self.config, self.runtime.as_ref(), self.resolver.as_ref());
        let mut registered = Vec::new();
        for service in extractor.extract(&container, quiet) {
            if let Err(e) = self.registry.register(&service) {
                error!(service_id = %service.id, error = %e, "register failed");
                continue;
            }
            info!(
                container_id = short_id(&container.id),
                service_id = %service.id,
                "added service"
            );
            registered.push(service);
        }

        let count = registered.len();
        if count > 0 {
            state.services.insert(container.id.clone(), registered);
        }
        count
    }

    fn deregister_all(&self, container_id: &str, services: &[Service]) {
        for service in services {
            match self.registry.deregister(service) {
                Ok(()) => info!(
                    container_id = short_id(container_id),
                    service_id = %service.id,
                    "removed service"
                ),
                Err(e) => error!(service_id = %service.id, error = %e, "deregister failed"),
            }
        }
    }

    fn should_deregister(&self, container_id: &str) -> bool {
        if self.config.deregister_check == DeregisterCheck::Always {
            return true;
        }

        match self.runtime.inspect_container(container_id) {
            Err(e) => {
                error!(
                    container_id = short_id(container_id),
                    error = %e,
                    "error fetching container status on exit"
                );
                false
            }
            Ok(container) if container.state.running => {
                info!(container_id = short_id(container_id), "not removing container, still running");
                false
            }
            Ok(container) => {
                let code = container.state.exit_code;
                code == 0 || code & SIGNALED_EXIT_BIT == SIGNALED_EXIT_BIT
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{MockRegistry, MockRuntime, StaticResolver};

    fn bridge(config: BridgeConfig) -> (Bridge, Arc<MockRuntime>, Arc<MockRegistry>) {
        let runtime = Arc::new(MockRuntime::new());
        let registry = Arc::new(MockRegistry::new());
        let bridge = Bridge::with_registry(runtime.clone(), registry.clone(), config)
            .with_resolver(Arc::new(StaticResolver::new("10.0.0.1")));
        (bridge, runtime, registry)
    }

    fn ttl_config() -> BridgeConfig {
        BridgeConfig {
            refresh_ttl: 30,
            refresh_interval: 10,
            ..BridgeConfig::new("thishost")
        }
    }

    #[test]
    fn test_add_is_idempotent() {
        let (bridge, runtime, registry) = bridge(BridgeConfig::new("thishost"));
        runtime.add_published("c1", "web", "nginx", &[("80/tcp", "8080")]);

        bridge.add("c1", false);
        let first = bridge.tracked_services("c1");
        bridge.add("c1", false);

        assert_eq!(first.len(), 1);
        assert_eq!(bridge.tracked_services("c1"), first);
        assert_eq!(registry.calls_of("register").len(), 1);
        assert_eq!(runtime.get_commands(), vec!["inspect:c1"]);
    }

    #[test]
    fn test_failed_register_is_not_tracked() {
        let (bridge, runtime, registry) = bridge(BridgeConfig::new("thishost"));
        runtime.add_published("c1", "web", "nginx", &[("80/tcp", "8080")]);
        registry.set_fail_on("register");

        bridge.add("c1", false);

        assert!(bridge.tracked_services("c1").is_empty());
        assert!(bridge.tracked_containers().is_empty());
    }

    #[test]
    fn test_inspect_failure_creates_no_state() {
        let (bridge, _runtime, registry) = bridge(BridgeConfig::new("thishost"));

        bridge.add("missing", false);

        assert!(bridge.tracked_containers().is_empty());
        assert!(registry.calls().is_empty());
    }

    #[test]
    fn test_remove_with_intent_deregisters() {
        let (bridge, runtime, registry) = bridge(BridgeConfig::new("thishost"));
        runtime.add_published("c1", "web", "nginx", &[("80/tcp", "8080")]);
        bridge.add("c1", false);

        bridge.remove("c1", true);

        assert!(bridge.tracked_services("c1").is_empty());
        assert_eq!(
            registry.calls_of("deregister"),
            vec!["deregister:thishost:web:80".to_string()]
        );
    }

    #[test]
    fn test_remove_without_ttl_leaves_registry_entry() {
        let (bridge, runtime, registry) = bridge(BridgeConfig::new("thishost"));
        runtime.add_published("c1", "web", "nginx", &[("80/tcp", "8080")]);
        bridge.add("c1", false);

        bridge.remove("c1", false);

        assert!(bridge.tracked_services("c1").is_empty());
        assert!(bridge.dead_container("c1").is_none());
        assert!(registry.calls_of("deregister").is_empty());
    }

    #[test]
    fn test_ttl_grace_window_expires_after_refreshes() {
        let (bridge, runtime, _registry) = bridge(ttl_config());
        runtime.add_published("c1", "web", "nginx", &[("80/tcp", "8080")]);
        bridge.add("c1", false);

        bridge.remove("c1", false);
        assert_eq!(bridge.dead_container("c1").map(|d| d.ttl), Some(30));
        assert!(bridge.tracked_services("c1").is_empty());

        bridge.refresh();
        bridge.refresh();
        assert_eq!(bridge.dead_container("c1").map(|d| d.ttl), Some(10));

        bridge.refresh();
        assert!(bridge.dead_container("c1").is_none());
    }

    #[test]
    fn test_add_revives_dead_container_without_inspect() {
        let (bridge, runtime, registry) = bridge(ttl_config());
        runtime.add_published("c1", "web", "nginx", &[("80/tcp", "8080")]);
        bridge.add("c1", false);
        let before = bridge.tracked_services("c1");
        bridge.remove("c1", false);
        bridge.refresh();

        bridge.add("c1", false);

        assert_eq!(bridge.tracked_services("c1"), before);
        assert!(bridge.dead_container("c1").is_none());
        assert_eq!(runtime.get_commands(), vec!["inspect:c1"]);
        assert_eq!(registry.calls_of("register").len(), 1);
    }

    #[test]
    fn test_remove_with_intent_also_clears_dead_snapshot() {
        let (bridge, runtime, registry) = bridge(ttl_config());
        runtime.add_published("c1", "web", "nginx", &[("80/tcp", "8080")]);
        bridge.add("c1", false);
        bridge.remove("c1", false);

        bridge.remove("c1", true);

        assert!(bridge.dead_container("c1").is_none());
        assert_eq!(registry.calls_of("deregister").len(), 1);
    }

    #[test]
    fn test_refresh_continues_past_failures() {
        let (bridge, runtime, registry) = bridge(ttl_config());
        runtime.add_published("c1", "web", "nginx", &[("80/tcp", "8080"), ("443/tcp", "8443")]);
        bridge.add("c1", false);
        registry.set_fail_on("refresh");

        bridge.refresh();

        assert_eq!(registry.calls_of("refresh").len(), 2);
        assert_eq!(bridge.tracked_services("c1").len(), 2);
    }

    #[test]
    fn test_remove_on_exit_policies() {
        let config = BridgeConfig {
            deregister_check: DeregisterCheck::OnSuccess,
            ..BridgeConfig::new("thishost")
        };
        let (bridge, runtime, _registry) = bridge(config);

        runtime.add_published("ok", "ok", "img", &[("80/tcp", "80")]);
        runtime.set_exit("ok", false, 0);
        assert!(bridge.should_deregister("ok"));

        runtime.add_published("killed", "killed", "img", &[("80/tcp", "80")]);
        runtime.set_exit("killed", false, 137);
        assert!(bridge.should_deregister("killed"));

        runtime.add_published("crashed", "crashed", "img", &[("80/tcp", "80")]);
        runtime.set_exit("crashed", false, 1);
        assert!(!bridge.should_deregister("crashed"));

        runtime.add_published("alive", "alive", "img", &[("80/tcp", "80")]);
        runtime.set_exit("alive", true, 0);
        assert!(!bridge.should_deregister("alive"));

        assert!(!bridge.should_deregister("gone"));
    }

    #[test]
    fn test_always_policy_skips_inspect() {
        let (bridge, runtime, _registry) = bridge(BridgeConfig::new("thishost"));

        assert!(bridge.should_deregister("anything"));
        assert!(runtime.get_commands().is_empty());
    }
}
