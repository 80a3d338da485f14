use serde::{Deserialize, Deserializer};
use std::collections::BTreeMap;

/// Docker marks exit codes of signal-terminated processes with this bit.
pub const SIGNALED_EXIT_BIT: i64 = 128;

/// First 12 characters of a container id, for logs.
pub fn short_id(id: &str) -> &str {
    id.get(..12).unwrap_or(id)
}

/// Which containers a listing should return.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListFilter {
    /// Running containers only (the runtime's default listing).
    Running,
    /// Every container that has not exited: created, restarting, running, paused.
    NonExited,
}

impl ListFilter {
    pub const NON_EXITED_STATES: [&'static str; 4] = ["created", "restarting", "running", "paused"];
}

/// One row of a container listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSummary {
    pub id: String,
}

impl ContainerSummary {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

/// A lifecycle event from the runtime's event feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerEvent {
    pub kind: String,
    pub action: String,
    pub actor_id: String,
}

impl ContainerEvent {
    pub const CONTAINER: &'static str = "container";

    pub fn container(action: impl Into<String>, actor_id: impl Into<String>) -> Self {
        Self {
            kind: Self::CONTAINER.to_string(),
            action: action.into(),
            actor_id: actor_id.into(),
        }
    }

    pub fn is_container(&self) -> bool {
        self.kind == Self::CONTAINER
    }
}

/// Inspect output for one container, in the Docker/Podman inspect JSON shape.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ContainerDetails {
    #[serde(rename = "Id")]
    pub id: String,
    #[serde(rename = "Name", default)]
    pub name: String,
    #[serde(rename = "Config", default, deserialize_with = "null_default")]
    pub config: ContainerConfig,
    #[serde(rename = "HostConfig", default, deserialize_with = "null_default")]
    pub host_config: HostConfig,
    #[serde(rename = "State", default, deserialize_with = "null_default")]
    pub state: ContainerStatus,
    #[serde(rename = "NetworkSettings", default, deserialize_with = "null_default")]
    pub network_settings: NetworkSettings,
}

impl ContainerDetails {
    /// Container name with Docker's leading slash removed.
    pub fn trimmed_name(&self) -> &str {
        self.name.strip_prefix('/').unwrap_or(&self.name)
    }

    /// The container's address on its primary network.
    pub fn primary_ip(&self) -> String {
        if !self.network_settings.ip_address.is_empty() {
            return self.network_settings.ip_address.clone();
        }

        self.network_settings
            .networks
            .values()
            .map(|endpoint| endpoint.ip_address.as_str())
            .find(|ip| !ip.is_empty())
            .unwrap_or_default()
            .to_string()
    }

    pub fn network_mode(&self) -> NetworkMode<'_> {
        NetworkMode(&self.host_config.network_mode)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ContainerConfig {
    #[serde(rename = "Hostname", default)]
    pub hostname: String,
    #[serde(rename = "Image", default)]
    pub image: String,
    #[serde(rename = "Env", default, deserialize_with = "null_default")]
    pub env: Vec<String>,
    #[serde(rename = "Labels", default, deserialize_with = "null_default")]
    pub labels: BTreeMap<String, String>,
    #[serde(rename = "ExposedPorts", default, deserialize_with = "null_default")]
    pub exposed_ports: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HostConfig {
    #[serde(rename = "NetworkMode", default)]
    pub network_mode: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ContainerStatus {
    #[serde(rename = "Running", default)]
    pub running: bool,
    #[serde(rename = "ExitCode", default)]
    pub exit_code: i64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NetworkSettings {
    #[serde(rename = "IPAddress", default)]
    pub ip_address: String,
    /// Published bindings keyed by `<port>/<proto>`; `None` for exposed-only ports.
    #[serde(rename = "Ports", default, deserialize_with = "null_default")]
    pub ports: BTreeMap<String, Option<Vec<PortBinding>>>,
    #[serde(rename = "Networks", default, deserialize_with = "null_default")]
    pub networks: BTreeMap<String, EndpointSettings>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct PortBinding {
    #[serde(rename = "HostIp", default)]
    pub host_ip: String,
    #[serde(rename = "HostPort", default)]
    pub host_port: String,
}

impl PortBinding {
    pub fn new(host_ip: impl Into<String>, host_port: impl Into<String>) -> Self {
        Self {
            host_ip: host_ip.into(),
            host_port: host_port.into(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EndpointSettings {
    #[serde(rename = "IPAddress", default)]
    pub ip_address: String,
}

/// View over a container's `HostConfig.NetworkMode` string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkMode<'a>(pub &'a str);

impl<'a> NetworkMode<'a> {
    pub fn is_none(&self) -> bool {
        self.0 == "none"
    }

    pub fn is_bridge(&self) -> bool {
        self.0 == "bridge"
    }

    pub fn is_host(&self) -> bool {
        self.0 == "host"
    }

    pub fn is_default(&self) -> bool {
        self.0 == "default" || self.0.is_empty()
    }

    /// Target container id when the namespace is shared via `container:<id>`.
    pub fn linked_container(&self) -> Option<&'a str> {
        self.0
            .strip_prefix("container:")
            .filter(|id| !id.is_empty())
    }

    /// User-defined network name, if the mode names one.
    pub fn user_network(&self) -> Option<&'a str> {
        if self.is_bridge() || self.is_host() || self.is_default() || self.is_none() {
            return None;
        }
        if self.linked_container().is_some() {
            return None;
        }
        Some(self.0)
    }
}

fn null_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inspect_tolerates_null_fields() {
        let json = r#"{
            "Id": "abc123",
            "Name": "/web",
            "Config": {"Hostname": "web", "Image": "nginx:1.25", "Env": null, "Labels": null, "ExposedPorts": {"80/tcp": {}}},
            "HostConfig": {"NetworkMode": "bridge"},
            "State": {"Running": true, "ExitCode": 0},
            "NetworkSettings": {
                "IPAddress": "",
                "Ports": {"80/tcp": [{"HostIp": "0.0.0.0", "HostPort": "8080"}], "443/tcp": null},
                "Networks": {"bridge": {"IPAddress": "172.17.0.2"}}
            }
        }"#;

        let details: ContainerDetails = serde_json::from_str(json).unwrap();

        assert_eq!(details.trimmed_name(), "web");
        assert!(details.config.env.is_empty());
        assert!(details.config.labels.is_empty());
        assert_eq!(details.primary_ip(), "172.17.0.2");
        assert_eq!(details.network_settings.ports["443/tcp"], None);
        assert_eq!(
            details.network_settings.ports["80/tcp"],
            Some(vec![PortBinding::new("0.0.0.0", "8080")])
        );
    }

    #[test]
    fn test_short_id() {
        assert_eq!(short_id("0123456789abcdef"), "0123456789ab");
        assert_eq!(short_id("abc"), "abc");
    }

    #[test]
    fn test_network_mode_classification() {
        assert!(NetworkMode("bridge").user_network().is_none());
        assert!(NetworkMode("host").user_network().is_none());
        assert!(NetworkMode("default").user_network().is_none());
        assert_eq!(NetworkMode("container:deadbeef").linked_container(), Some("deadbeef"));
        assert!(NetworkMode("container:deadbeef").user_network().is_none());
        assert_eq!(NetworkMode("overlay_net").user_network(), Some("overlay_net"));
    }
}
