use crate::domain::{AdapterFactory, RegistryAdapter, Service};
use crate::services::AdapterFactories;
use anyhow::{Context, Result, anyhow};
use serde::Serialize;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::{Builder, Runtime};
use tokio::time;
use tracing::{debug, info, warn};
use url::Url;
use zookeeper_client as zk;

const DEFAULT_PORT: u16 = 2181;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

pub fn register(factories: &mut AdapterFactories) {
    factories.register("zookeeper", Arc::new(ZookeeperFactory));
}

/// Connects to `zookeeper://host[:port]/<base>` and makes sure `<base>` exists.
pub struct ZookeeperFactory;

impl AdapterFactory for ZookeeperFactory {
    fn build(&self, uri: &Url) -> Result<Box<dyn RegistryAdapter>> {
        let cluster = cluster_address(uri)?;
        // The session keeps ephemeral nodes alive only while its heartbeat
        // task runs, so the client gets a runtime with its own worker.
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("zookeeper")
            .enable_all()
            .build()
            .context("building zookeeper runtime")?;
        let client = runtime
            .block_on(async { time::timeout(CONNECT_TIMEOUT, zk::Client::connect(&cluster)).await })
            .with_context(|| format!("connecting to zookeeper at {cluster} timed out"))?
            .with_context(|| format!("connecting to zookeeper at {cluster}"))?;
        info!(cluster = %cluster, "zookeeper: connected");

        let adapter = ZookeeperAdapter {
            runtime,
            client,
            base: base_path(uri.path()),
        };
        if adapter.base != "/" {
            adapter.ensure_node(&adapter.base)?;
        }
        Ok(Box::new(adapter))
    }
}

/// Publishes each service as an ephemeral znode under `<base>/<name>`.
///
/// Nodes vanish with the session, so nothing is listed back for cleanup.
pub struct ZookeeperAdapter {
    runtime: Runtime,
    client: zk::Client,
    base: String,
}

impl std::fmt::Debug for ZookeeperAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ZookeeperAdapter")
            .field("base", &self.base)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Serialize)]
struct ZnodeBody<'a> {
    #[serde(rename = "Name")]
    name: &'a str,
    #[serde(rename = "IP")]
    ip: &'a str,
    #[serde(rename = "PublicPort")]
    public_port: u16,
    #[serde(rename = "PrivatePort")]
    private_port: u16,
    #[serde(rename = "ContainerID")]
    container_id: &'a str,
    #[serde(rename = "Tags")]
    tags: &'a [String],
    #[serde(rename = "Attrs")]
    attrs: &'a BTreeMap<String, String>,
}

impl<'a> ZnodeBody<'a> {
    fn new(service: &'a Service) -> Self {
        Self {
            name: &service.name,
            ip: &service.ip,
            public_port: service.port,
            private_port: service.origin.exposed_port.parse().unwrap_or(0),
            container_id: &service.origin.container_hostname,
            tags: &service.tags,
            attrs: &service.attrs,
        }
    }
}

impl ZookeeperAdapter {
    fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.runtime.block_on(future)
    }

    /// Creates a persistent empty node at `path` unless one is there already.
    fn ensure_node(&self, path: &str) -> Result<()> {
        let options = zk::CreateMode::Persistent.with_acls(zk::Acls::anyone_all());
        match self.block_on(self.client.create(path, &[], &options)) {
            Ok(_) | Err(zk::Error::NodeExists) => Ok(()),
            Err(e) => Err(e).with_context(|| format!("creating zookeeper node {path}")),
        }
    }

    fn write_service(&self, service: &Service) -> Result<()> {
        let parent = service_path(&self.base, &service.name);
        self.ensure_node(&parent)?;

        let node = node_path(&self.base, service);
        let body = serde_json::to_vec(&ZnodeBody::new(service)).context("encoding znode body")?;
        let options = zk::CreateMode::Ephemeral.with_acls(zk::Acls::anyone_all());
        match self.block_on(self.client.create(&node, &body, &options)) {
            Ok(_) => {
                debug!(path = %node, "zookeeper: created service node");
                Ok(())
            }
            Err(zk::Error::NodeExists) => self
                .block_on(self.client.set_data(&node, &body, None))
                .map(|_| ())
                .with_context(|| format!("updating zookeeper node {node}")),
            Err(e) => Err(e).with_context(|| format!("registering zookeeper node {node}")),
        }
    }
}

impl RegistryAdapter for ZookeeperAdapter {
    fn ping(&self) -> Result<()> {
        self.block_on(self.client.check_stat(&self.base))
            .with_context(|| format!("checking zookeeper path {}", self.base))?;
        Ok(())
    }

    fn register(&self, service: &Service) -> Result<()> {
        self.write_service(service)
    }

    fn deregister(&self, service: &Service) -> Result<()> {
        let node = node_path(&self.base, service);
        match self.block_on(self.client.delete(&node, None)) {
            Ok(()) | Err(zk::Error::NoNode) => {}
            Err(e) => return Err(e).with_context(|| format!("deleting zookeeper node {node}")),
        }

        let parent = service_path(&self.base, &service.name);
        let children = match self.block_on(self.client.list_children(&parent)) {
            Ok(children) => children,
            Err(zk::Error::NoNode) => return Ok(()),
            Err(e) => return Err(e).with_context(|| format!("listing zookeeper node {parent}")),
        };
        if children.is_empty() {
            match self.block_on(self.client.delete(&parent, None)) {
                Ok(()) | Err(zk::Error::NoNode) | Err(zk::Error::NotEmpty) => {}
                Err(e) => warn!(path = %parent, error = %e, "zookeeper: failed to delete service node"),
            }
        }
        Ok(())
    }

    fn refresh(&self, service: &Service) -> Result<()> {
        self.write_service(service)
    }

    fn services(&self) -> Result<Vec<Service>> {
        Ok(Vec::new())
    }
}

fn cluster_address(uri: &Url) -> Result<String> {
    let host = uri
        .host_str()
        .filter(|host| !host.is_empty())
        .ok_or_else(|| anyhow!("zookeeper uri {uri} has no host"))?;
    Ok(format!("{host}:{}", uri.port().unwrap_or(DEFAULT_PORT)))
}

/// Absolute base path without a trailing slash; `/` when empty.
fn base_path(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    }
}

fn service_path(base: &str, name: &str) -> String {
    if base == "/" {
        format!("/{name}")
    } else {
        format!("{base}/{name}")
    }
}

fn node_path(base: &str, service: &Service) -> String {
    format!(
        "{}/{}:{}",
        service_path(base, &service.name),
        service.ip,
        service.port
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ServicePort;

    fn service() -> Service {
        Service {
            id: "host:web:80".into(),
            name: "web".into(),
            ip: "10.0.0.5".into(),
            port: 8080,
            tags: vec!["prod".into()],
            attrs: [("region".to_string(), "eu".to_string())].into(),
            origin: ServicePort {
                exposed_port: "80".into(),
                container_hostname: "0123456789ab".into(),
                ..ServicePort::default()
            },
            ..Service::default()
        }
    }

    #[test]
    fn test_base_path_normalization() {
        assert_eq!(base_path(""), "/");
        assert_eq!(base_path("/"), "/");
        assert_eq!(base_path("/services/"), "/services");
        assert_eq!(base_path("/a/b"), "/a/b");
    }

    #[test]
    fn test_node_paths() {
        assert_eq!(service_path("/", "web"), "/web");
        assert_eq!(service_path("/services", "web"), "/services/web");
        assert_eq!(node_path("/services", &service()), "/services/web/10.0.0.5:8080");
        assert_eq!(node_path("/", &service()), "/web/10.0.0.5:8080");
    }

    #[test]
    fn test_znode_body_shape() {
        let svc = service();

        let json = serde_json::to_value(ZnodeBody::new(&svc)).unwrap();

        assert_eq!(
            json,
            serde_json::json!({
                "Name": "web",
                "IP": "10.0.0.5",
                "PublicPort": 8080,
                "PrivatePort": 80,
                "ContainerID": "0123456789ab",
                "Tags": ["prod"],
                "Attrs": {"region": "eu"},
            })
        );
    }

    #[test]
    fn test_cluster_address_defaults_port() {
        let uri = Url::parse("zookeeper://zk1/services").unwrap();
        assert_eq!(cluster_address(&uri).unwrap(), "zk1:2181");

        let uri = Url::parse("zookeeper://zk1:2182").unwrap();
        assert_eq!(cluster_address(&uri).unwrap(), "zk1:2182");
    }

    #[test]
    fn test_factory_rejects_uri_without_host() {
        let uri = Url::parse("zookeeper:/services").unwrap();

        assert!(ZookeeperFactory.build(&uri).is_err());
    }

    #[test]
    fn test_registers_scheme() {
        let mut factories = AdapterFactories::new();
        register(&mut factories);

        assert_eq!(factories.schemes(), vec!["zookeeper"]);
    }
}
