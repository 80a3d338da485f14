pub mod cli_runtime;
pub mod consul_adapter;
pub mod consul_client;
pub mod consulkv_adapter;
pub mod dns;
pub mod event_feed;
pub mod telegram_adapter;
pub mod zookeeper_adapter;

use crate::services::AdapterFactories;

pub use cli_runtime::CliRuntime;
pub use consul_client::ConsulClient;
pub use dns::SystemResolver;
pub use event_feed::{FeedItem, parse_event};

/// Factory table with every backend compiled into this binary.
pub fn builtin_factories() -> AdapterFactories {
    let mut factories = AdapterFactories::new();
    consul_adapter::register(&mut factories);
    consulkv_adapter::register(&mut factories);
    telegram_adapter::register(&mut factories);
    zookeeper_adapter::register(&mut factories);
    factories
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_schemes() {
        assert_eq!(
            builtin_factories().schemes(),
            vec!["consul", "consul-tls", "consulkv", "telegram", "zookeeper"]
        );
    }
}
