use crate::domain::{AdapterFactory, RegistryAdapter};
use anyhow::{Context, Result, bail};
use std::collections::HashMap;
use std::sync::Arc;
use url::Url;

/// Scheme → factory table, filled by each backend's `register` call at startup.
///
/// Entries are only ever added; the table is handed to the bridge by
/// reference once populated.
#[derive(Default)]
pub struct AdapterFactories {
    factories: HashMap<String, Arc<dyn AdapterFactory>>,
}

impl AdapterFactories {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a factory under a scheme. A scheme that is already taken
    /// keeps its first factory.
    pub fn register(&mut self, scheme: &str, factory: Arc<dyn AdapterFactory>) -> &mut Self {
        self.factories
            .entry(scheme.to_string())
            .or_insert(factory);
        self
    }

    pub fn lookup(&self, scheme: &str) -> Option<Arc<dyn AdapterFactory>> {
        self.factories.get(scheme).cloned()
    }

    pub fn schemes(&self) -> Vec<&str> {
        let mut schemes: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        schemes.sort_unstable();
        schemes
    }

    /// Parses the registry URI and builds the adapter for its scheme.
    pub fn build(&self, uri: &str) -> Result<Box<dyn RegistryAdapter>> {
        let parsed = Url::parse(uri).with_context(|| format!("bad adapter uri: {uri}"))?;

        let Some(factory) = self.lookup(parsed.scheme()) else {
            bail!(
                "unrecognized adapter: {uri} (known schemes: {})",
                self.schemes().join(", ")
            );
        };

        tracing::info!(scheme = parsed.scheme(), uri = %parsed, "using adapter");
        factory.build(&parsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MockRegistry;

    struct MockFactory;

    impl AdapterFactory for MockFactory {
        fn build(&self, _uri: &Url) -> Result<Box<dyn RegistryAdapter>> {
            Ok(Box::new(MockRegistry::new()))
        }
    }

    struct FailingFactory;

    impl AdapterFactory for FailingFactory {
        fn build(&self, _uri: &Url) -> Result<Box<dyn RegistryAdapter>> {
            bail!("should not be used")
        }
    }

    #[test]
    fn test_build_by_scheme() {
        let mut factories = AdapterFactories::new();
        factories.register("mock", Arc::new(MockFactory));

        assert!(factories.build("mock://localhost:1234/path").is_ok());
    }

    #[test]
    fn test_unknown_scheme_is_error() {
        let mut factories = AdapterFactories::new();
        factories.register("mock", Arc::new(MockFactory));

        let err = factories.build("etcd://localhost").unwrap_err();
        assert!(err.to_string().contains("unrecognized adapter"));
    }

    #[test]
    fn test_malformed_uri_is_error() {
        let factories = AdapterFactories::new();

        let err = factories.build("not a uri").unwrap_err();
        assert!(err.to_string().contains("bad adapter uri"));
    }

    #[test]
    fn test_first_registration_wins() {
        let mut factories = AdapterFactories::new();
        factories
            .register("mock", Arc::new(MockFactory))
            .register("mock", Arc::new(FailingFactory));

        assert!(factories.build("mock://x").is_ok());
        assert_eq!(factories.schemes(), vec!["mock"]);
    }
}
