mod adapter_factories;
mod bridge;
pub mod daemon;
mod extractor;
pub mod metadata;

pub use adapter_factories::AdapterFactories;
pub use bridge::{Bridge, SyncReport, parse_service_id};
pub use daemon::{DaemonOptions, RetryPolicy};
pub use extractor::{Extractor, service_ports};
