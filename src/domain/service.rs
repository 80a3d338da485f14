use std::collections::BTreeMap;

/// Raw facts about one exposed or published port of an inspected container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServicePort {
    pub host_port: String,
    pub host_ip: String,
    pub exposed_port: String,
    pub exposed_ip: String,
    pub protocol: String,
    pub container_id: String,
    /// Container name without the leading slash.
    pub container_name: String,
    pub container_hostname: String,
}

impl ServicePort {
    pub fn is_udp(&self) -> bool {
        self.protocol == "udp"
    }

    pub fn is_published(&self) -> bool {
        !self.host_port.is_empty()
    }
}

/// A registrable endpoint derived from one container port.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Service {
    pub id: String,
    pub name: String,
    pub ip: String,
    pub port: u16,
    pub tags: Vec<String>,
    pub attrs: BTreeMap<String, String>,
    pub ttl: u64,
    pub origin: ServicePort,
}

impl Service {
    /// A service as reported back by a registry listing, without local origin.
    pub fn remote(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            ..Self::default()
        }
    }
}

/// Services retained for a container that exited without deregistration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadContainer {
    /// Seconds left before the snapshot is purged.
    pub ttl: i64,
    pub services: Vec<Service>,
}

impl DeadContainer {
    pub fn new(ttl: u64, services: Vec<Service>) -> Self {
        Self {
            ttl: i64::try_from(ttl).unwrap_or(i64::MAX),
            services,
        }
    }

    /// Counts down by `elapsed` seconds and reports whether the entry expired.
    pub fn decay(&mut self, elapsed: u64) -> bool {
        self.ttl = self
            .ttl
            .saturating_sub(i64::try_from(elapsed).unwrap_or(i64::MAX));
        self.ttl <= 0
    }
}
