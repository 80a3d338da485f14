use crate::config::BridgeConfig;
use crate::domain::{
    ContainerDetails, ContainerRuntime, HostResolver, PortBinding, Service, ServicePort, short_id,
};
use crate::services::metadata::{combine_tags, service_metadata};
use std::collections::BTreeMap;
use tracing::{error, info};

const ANY_ADDRESS: &str = "0.0.0.0";

/// Turns an inspected container into candidate service records.
pub struct Extractor<'a> {
    config: &'a BridgeConfig,
    runtime: &'a dyn ContainerRuntime,
    resolver: &'a dyn HostResolver,
}

impl<'a> Extractor<'a> {
    pub fn new(
        config: &'a BridgeConfig,
        runtime: &'a dyn ContainerRuntime,
        resolver: &'a dyn HostResolver,
    ) -> Self {
        Self {
            config,
            runtime,
            resolver,
        }
    }

    /// Every service the container should register, in port order.
    pub fn extract(&self, container: &ContainerDetails, quiet: bool) -> Vec<Service> {
        let ports = service_ports(container);
        if ports.is_empty() {
            if !quiet {
                info!(container_id = short_id(&container.id), "ignored: no published ports");
            }
            return Vec::new();
        }

        let usable: Vec<ServicePort> = ports
            .into_values()
            .filter(|port| {
                let keep = self.config.internal || port.is_published();
                if !keep && !quiet {
                    info!(
                        container_id = short_id(&container.id),
                        port = %port.exposed_port,
                        "ignored: port not published on host"
                    );
                }
                keep
            })
            .collect();

        let is_group = usable.len() > 1;
        usable
            .into_iter()
            .filter_map(|port| {
                let exposed_port = port.exposed_port.clone();
                let service = self.new_service(container, port, is_group);
                if service.is_none() && !quiet {
                    info!(
                        container_id = short_id(&container.id),
                        port = %exposed_port,
                        "ignored: service on port"
                    );
                }
                service
            })
            .collect()
    }

    /// Builds the service for one port, or `None` when it is ignored or unnamed
    /// under explicit naming.
    pub fn new_service(
        &self,
        container: &ContainerDetails,
        mut port: ServicePort,
        is_group: bool,
    ) -> Option<Service> {
        let hostname = if self.config.hostname.is_empty() {
            port.host_ip.clone()
        } else {
            self.config.hostname.clone()
        };

        if port.host_ip == ANY_ADDRESS {
            if let Some(ip) = self.resolver.resolve(&hostname) {
                port.host_ip = ip.to_string();
            }
        }
        if let Some(host_ip) = &self.config.host_ip {
            port.host_ip = host_ip.clone();
        }

        let metadata = service_metadata(&container.config, &port.exposed_port);
        if metadata.get("ignore").is_some() {
            return None;
        }

        let mut name = match metadata.get("name") {
            Some(name) => name.to_string(),
            None if self.config.explicit => return None,
            None => default_name(&container.config.image),
        };
        if is_group && !metadata.is_port_scoped("name") {
            name = format!("{name}-{}", port.exposed_port);
        }

        let mut id = format!("{hostname}:{}:{}", port.container_name, port.exposed_port);

        let (mut ip, service_port): (String, u16) = if self.config.internal {
            (port.exposed_ip.clone(), port.exposed_port.parse().unwrap_or(0))
        } else {
            (port.host_ip.clone(), port.host_port.parse().unwrap_or(0))
        };

        if let Some(label) = &self.config.use_ip_from_label {
            match container.config.labels.get(label).filter(|v| !v.is_empty()) {
                Some(value) => {
                    ip = strip_prefix_len(value).to_string();
                    info!(ip = %ip, label = %label, "using container IP from label");
                }
                None => info!(label = %label, "label not found in container configuration"),
            }
        }

        if let Some(target) = container.network_mode().linked_container() {
            info!(network_container_id = short_id(target), "detected container network mode");
            match self.runtime.inspect_container(target) {
                Ok(network_container) => {
                    ip = network_container.primary_ip();
                    info!(ip = %ip, "using network container IP");
                }
                Err(e) => error!(
                    network_container_id = short_id(target),
                    error = %e,
                    "unable to inspect network container"
                ),
            }
        }

        let udp = port.is_udp().then_some("udp");
        let tags = combine_tags(
            [
                metadata.get("tags").unwrap_or_default(),
                self.config.force_tags.as_str(),
            ]
            .into_iter()
            .chain(udp),
        );
        if udp.is_some() {
            id.push_str(":udp");
        }
        if let Some(explicit_id) = metadata.get("id") {
            id = explicit_id.to_string();
        }

        Some(Service {
            id,
            name,
            ip,
            port: service_port,
            tags,
            attrs: metadata.into_attrs(),
            ttl: self.config.refresh_ttl,
            origin: port,
        })
    }
}

/// Exposed ports with a default binding, overlaid by the runtime's published
/// bindings, keyed by `<port>/<proto>`.
pub fn service_ports(container: &ContainerDetails) -> BTreeMap<String, ServicePort> {
    let mut ports = BTreeMap::new();

    for key in container.config.exposed_ports.keys() {
        let (exposed, _) = split_port_key(key);
        let default_binding = [PortBinding::new(ANY_ADDRESS, exposed)];
        ports.insert(key.clone(), service_port(container, key, &default_binding));
    }

    for (key, bindings) in &container.network_settings.ports {
        let bindings = bindings.as_deref().unwrap_or_default();
        ports.insert(key.clone(), service_port(container, key, bindings));
    }

    ports
}

fn service_port(container: &ContainerDetails, key: &str, bindings: &[PortBinding]) -> ServicePort {
    let (mut host_ip, host_port) = bindings
        .first()
        .map(|binding| (binding.host_ip.clone(), binding.host_port.clone()))
        .unwrap_or_default();
    if host_ip.is_empty() {
        host_ip = ANY_ADDRESS.to_string();
    }

    // Overlay and other user-defined networks publish on the network's own address.
    if let Some(endpoint) = container
        .network_mode()
        .user_network()
        .and_then(|network| container.network_settings.networks.get(network))
    {
        host_ip = endpoint.ip_address.clone();
    }

    let (exposed_port, protocol) = split_port_key(key);

    ServicePort {
        host_port,
        host_ip,
        exposed_port: exposed_port.to_string(),
        exposed_ip: container.primary_ip(),
        protocol: protocol.to_string(),
        container_id: container.id.clone(),
        container_name: container.trimmed_name().to_string(),
        container_hostname: container.config.hostname.clone(),
    }
}

fn split_port_key(key: &str) -> (&str, &str) {
    key.split_once('/').unwrap_or((key, "tcp"))
}

/// Image basename without registry path, tag or digest.
fn default_name(image: &str) -> String {
    let base = image.rsplit('/').next().unwrap_or(image);
    let base = base.split('@').next().unwrap_or(base);
    base.split(':').next().unwrap_or(base).to_string()
}

fn strip_prefix_len(value: &str) -> &str {
    value.rsplit_once('/').map_or(value, |(ip, _)| ip)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_name_strips_path_and_tag() {
        assert_eq!(default_name("nginx"), "nginx");
        assert_eq!(default_name("nginx:1.25"), "nginx");
        assert_eq!(default_name("registry:5000/team/api:v2"), "api");
        assert_eq!(default_name("redis@sha256:abcd"), "redis");
    }

    #[test]
    fn test_split_port_key_defaults_to_tcp() {
        assert_eq!(split_port_key("80/udp"), ("80", "udp"));
        assert_eq!(split_port_key("80"), ("80", "tcp"));
    }

    #[test]
    fn test_strip_prefix_len() {
        assert_eq!(strip_prefix_len("10.0.0.5/24"), "10.0.0.5");
        assert_eq!(strip_prefix_len("10.0.0.5"), "10.0.0.5");
    }
}
