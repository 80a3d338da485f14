mod container;
mod service;
pub mod traits;

pub use container::{
    ContainerConfig, ContainerDetails, ContainerEvent, ContainerStatus, ContainerSummary,
    EndpointSettings, HostConfig, ListFilter, NetworkMode, NetworkSettings, PortBinding,
    SIGNALED_EXIT_BIT, short_id,
};
pub use service::{DeadContainer, Service, ServicePort};
pub use traits::{AdapterFactory, ContainerRuntime, HostResolver, RegistryAdapter};
