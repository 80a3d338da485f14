use crate::domain::{
    ContainerConfig, ContainerDetails, ContainerRuntime, ContainerStatus, ContainerSummary,
    HostConfig, HostResolver, ListFilter, NetworkSettings, PortBinding, RegistryAdapter, Service,
};
use anyhow::{Result, bail};
use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use std::sync::RwLock;

/// Address given to containers created through [`MockRuntime::add_published`].
pub const MOCK_CONTAINER_IP: &str = "172.17.0.2";

#[derive(Debug, Clone)]
struct MockContainer {
    details: ContainerDetails,
    /// Runtime status string as used by listing filters.
    status: String,
}

/// In-memory container runtime recording every call it serves.
#[derive(Debug, Default)]
pub struct MockRuntime {
    containers: RwLock<BTreeMap<String, MockContainer>>,
    commands: RwLock<Vec<String>>,
    fail_on: RwLock<Option<String>>,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a running container exactly as given.
    pub fn add_container(&self, details: ContainerDetails) {
        self.containers.write().unwrap().insert(
            details.id.clone(),
            MockContainer {
                details,
                status: "running".to_string(),
            },
        );
    }

    /// Adds a running bridge-networked container publishing each
    /// `(port_key, host_port)` pair on `0.0.0.0`.
    pub fn add_published(&self, id: &str, name: &str, image: &str, ports: &[(&str, &str)]) {
        let mut details = ContainerDetails {
            id: id.to_string(),
            name: format!("/{name}"),
            config: ContainerConfig {
                hostname: id.chars().take(12).collect(),
                image: image.to_string(),
                ..ContainerConfig::default()
            },
            host_config: HostConfig {
                network_mode: "bridge".to_string(),
            },
            state: ContainerStatus {
                running: true,
                exit_code: 0,
            },
            network_settings: NetworkSettings {
                ip_address: MOCK_CONTAINER_IP.to_string(),
                ..NetworkSettings::default()
            },
        };

        for (key, host_port) in ports {
            details
                .config
                .exposed_ports
                .insert(key.to_string(), serde_json::json!({}));
            details.network_settings.ports.insert(
                key.to_string(),
                Some(vec![PortBinding::new("0.0.0.0", *host_port)]),
            );
        }

        self.add_container(details);
    }

    /// Edits a container's inspect data in place.
    pub fn update(&self, id: &str, edit: impl FnOnce(&mut ContainerDetails)) {
        if let Some(container) = self.containers.write().unwrap().get_mut(id) {
            edit(&mut container.details);
        }
    }

    pub fn set_env(&self, id: &str, env: &[&str]) {
        self.update(id, |details| {
            details.config.env = env.iter().map(|entry| entry.to_string()).collect();
        });
    }

    pub fn set_label(&self, id: &str, key: &str, value: &str) {
        self.update(id, |details| {
            details
                .config
                .labels
                .insert(key.to_string(), value.to_string());
        });
    }

    /// Sets the running flag and exit code; a stopped container is listed as exited.
    pub fn set_exit(&self, id: &str, running: bool, exit_code: i64) {
        if let Some(container) = self.containers.write().unwrap().get_mut(id) {
            container.details.state.running = running;
            container.details.state.exit_code = exit_code;
            container.status = if running { "running" } else { "exited" }.to_string();
        }
    }

    /// Overrides the listing status, e.g. `created` or `paused`.
    pub fn set_status(&self, id: &str, status: &str) {
        if let Some(container) = self.containers.write().unwrap().get_mut(id) {
            container.status = status.to_string();
            container.details.state.running = status == "running";
        }
    }

    pub fn stop(&self, id: &str) {
        self.set_exit(id, false, 0);
    }

    pub fn remove(&self, id: &str) {
        self.containers.write().unwrap().remove(id);
    }

    /// Makes every call of `operation` (`list` or `inspect`) fail.
    pub fn set_fail_on(&self, operation: &str) {
        *self.fail_on.write().unwrap() = Some(operation.to_string());
    }

    pub fn clear_failures(&self) {
        *self.fail_on.write().unwrap() = None;
    }

    pub fn get_commands(&self) -> Vec<String> {
        self.commands.read().unwrap().clone()
    }

    pub fn clear_commands(&self) {
        self.commands.write().unwrap().clear();
    }

    fn record_command(&self, cmd: &str) {
        self.commands.write().unwrap().push(cmd.to_string());
    }

    fn check_fail(&self, operation: &str) -> Result<()> {
        if let Some(ref fail_on) = *self.fail_on.read().unwrap() {
            if fail_on == operation {
                bail!("Mock failure on: {}", operation);
            }
        }
        Ok(())
    }
}

impl ContainerRuntime for MockRuntime {
    fn list_containers(&self, filter: ListFilter) -> Result<Vec<ContainerSummary>> {
        let label = match filter {
            ListFilter::Running => "running",
            ListFilter::NonExited => "non-exited",
        };
        self.record_command(&format!("list:{label}"));
        self.check_fail("list")?;

        Ok(self
            .containers
            .read()
            .unwrap()
            .values()
            .filter(|container| match filter {
                ListFilter::Running => container.status == "running",
                ListFilter::NonExited => {
                    ListFilter::NON_EXITED_STATES.contains(&container.status.as_str())
                }
            })
            .map(|container| ContainerSummary::new(container.details.id.clone()))
            .collect())
    }

    fn inspect_container(&self, id: &str) -> Result<ContainerDetails> {
        self.record_command(&format!("inspect:{id}"));
        self.check_fail("inspect")?;

        let containers = self.containers.read().unwrap();
        let found = containers.get(id).or_else(|| {
            containers
                .values()
                .find(|container| container.details.trimmed_name() == id)
        });
        match found {
            Some(container) => Ok(container.details.clone()),
            None => bail!("no such container: {id}"),
        }
    }
}

/// Registry double that records calls and remembers what it holds.
#[derive(Debug, Default)]
pub struct MockRegistry {
    calls: RwLock<Vec<String>>,
    /// Operation → remaining failures; `None` fails forever.
    failures: RwLock<HashMap<String, Option<usize>>>,
    registered: RwLock<BTreeMap<String, Service>>,
    remote: RwLock<Vec<Service>>,
}

impl MockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every call so far, as `op` or `op:<service id>`.
    pub fn calls(&self) -> Vec<String> {
        self.calls.read().unwrap().clone()
    }

    pub fn calls_of(&self, operation: &str) -> Vec<String> {
        let prefix = format!("{operation}:");
        self.calls()
            .into_iter()
            .filter(|call| call == operation || call.starts_with(&prefix))
            .collect()
    }

    pub fn clear_calls(&self) {
        self.calls.write().unwrap().clear();
    }

    pub fn set_fail_on(&self, operation: &str) {
        self.failures
            .write()
            .unwrap()
            .insert(operation.to_string(), None);
    }

    /// Fails the next `times` calls of `operation`, then succeeds.
    pub fn set_fail_on_times(&self, operation: &str, times: usize) {
        self.failures
            .write()
            .unwrap()
            .insert(operation.to_string(), Some(times));
    }

    pub fn clear_failures(&self) {
        self.failures.write().unwrap().clear();
    }

    /// Adds an entry that was registered by someone else.
    pub fn add_remote(&self, id: &str, name: &str) {
        self.remote
            .write()
            .unwrap()
            .push(Service::remote(id, name));
    }

    pub fn registered_ids(&self) -> Vec<String> {
        self.registered.read().unwrap().keys().cloned().collect()
    }

    fn record(&self, operation: &str, service: Option<&Service>) -> Result<()> {
        let call = match service {
            Some(service) => format!("{operation}:{}", service.id),
            None => operation.to_string(),
        };
        self.calls.write().unwrap().push(call);

        let mut failures = self.failures.write().unwrap();
        match failures.get_mut(operation) {
            Some(None) => bail!("Mock failure on: {}", operation),
            Some(Some(0)) | None => Ok(()),
            Some(Some(remaining)) => {
                *remaining -= 1;
                bail!("Mock failure on: {}", operation)
            }
        }
    }
}

impl RegistryAdapter for MockRegistry {
    fn ping(&self) -> Result<()> {
        self.record("ping", None)
    }

    fn register(&self, service: &Service) -> Result<()> {
        self.record("register", Some(service))?;
        self.registered
            .write()
            .unwrap()
            .insert(service.id.clone(), service.clone());
        Ok(())
    }

    fn deregister(&self, service: &Service) -> Result<()> {
        self.record("deregister", Some(service))?;
        self.registered.write().unwrap().remove(&service.id);
        self.remote
            .write()
            .unwrap()
            .retain(|remote| remote.id != service.id);
        Ok(())
    }

    fn refresh(&self, service: &Service) -> Result<()> {
        self.record("refresh", Some(service))
    }

    fn services(&self) -> Result<Vec<Service>> {
        self.record("services", None)?;
        let mut services: Vec<Service> = self.registered.read().unwrap().values().cloned().collect();
        services.extend(self.remote.read().unwrap().iter().cloned());
        Ok(services)
    }
}

/// Resolver answering every lookup with one fixed address.
#[derive(Debug, Clone, Default)]
pub struct StaticResolver {
    ip: Option<IpAddr>,
}

impl StaticResolver {
    pub fn new(ip: &str) -> Self {
        Self {
            ip: Some(ip.parse().expect("static resolver needs a literal IP")),
        }
    }

    pub fn unresolvable() -> Self {
        Self::default()
    }
}

impl HostResolver for StaticResolver {
    fn resolve(&self, _host: &str) -> Option<IpAddr> {
        self.ip
    }
}
