use super::{ContainerDetails, ContainerSummary, ListFilter, Service};
use anyhow::Result;
use std::fmt::Debug;
use std::net::IpAddr;
use url::Url;

/// Trait for container runtime operations
pub trait ContainerRuntime: Send + Sync + Debug {
    /// List containers matching the filter
    fn list_containers(&self, filter: ListFilter) -> Result<Vec<ContainerSummary>>;

    /// Inspect a single container by id or name
    fn inspect_container(&self, id: &str) -> Result<ContainerDetails>;
}

/// A service directory backend.
///
/// Calls are synchronous and never retried by the adapter itself; the bridge
/// decides what to do with failures. `services` is only used for cleanup and
/// may return an empty list when the backend cannot enumerate entries.
pub trait RegistryAdapter: Send + Sync + Debug {
    fn ping(&self) -> Result<()>;

    fn register(&self, service: &Service) -> Result<()>;

    fn deregister(&self, service: &Service) -> Result<()>;

    fn refresh(&self, service: &Service) -> Result<()>;

    fn services(&self) -> Result<Vec<Service>>;
}

/// Builds a registry adapter for a URI whose scheme it was registered under.
pub trait AdapterFactory: Send + Sync {
    fn build(&self, uri: &Url) -> Result<Box<dyn RegistryAdapter>>;
}

/// Resolves a hostname to an address.
pub trait HostResolver: Send + Sync + Debug {
    fn resolve(&self, host: &str) -> Option<IpAddr>;
}
