pub mod cli;
pub mod config;
pub mod domain;
pub mod infra;
pub mod services;

// Make test_support available for integration tests
pub mod test_support;

pub use config::{BridgeConfig, DeregisterCheck};
pub use domain::{ContainerRuntime, HostResolver, RegistryAdapter, Service};
pub use infra::{CliRuntime, SystemResolver, builtin_factories};
pub use services::{AdapterFactories, Bridge, DaemonOptions, RetryPolicy, SyncReport};
