use crate::domain::{AdapterFactory, RegistryAdapter, Service};
use crate::infra::ConsulClient;
use crate::services::AdapterFactories;
use anyhow::Result;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, info};
use url::Url;

pub fn register(factories: &mut AdapterFactories) {
    factories.register("consulkv", Arc::new(ConsulKvFactory));
}

pub struct ConsulKvFactory;

impl AdapterFactory for ConsulKvFactory {
    fn build(&self, uri: &Url) -> Result<Box<dyn RegistryAdapter>> {
        Ok(Box::new(ConsulKvAdapter {
            client: ConsulClient::from_uri(uri, false)?,
            prefix: key_prefix(uri.path()),
        }))
    }
}

/// Writes `<prefix>/<name>/<id> = ip:port` entries into the Consul KV store.
///
/// The KV store cannot be enumerated back into services, so cleanup never
/// sees entries written here.
#[derive(Debug)]
pub struct ConsulKvAdapter {
    client: ConsulClient,
    prefix: Vec<String>,
}

impl ConsulKvAdapter {
    fn key_url(&self, service: &Service) -> Result<Url> {
        let mut segments: Vec<&str> = vec!["v1", "kv"];
        segments.extend(self.prefix.iter().map(String::as_str));
        segments.push(&service.name);
        segments.push(&service.id);
        self.client.endpoint(&segments)
    }
}

impl RegistryAdapter for ConsulKvAdapter {
    fn ping(&self) -> Result<()> {
        let leader = self.client.leader()?;
        info!(leader = %leader, "consulkv: current leader");
        Ok(())
    }

    fn register(&self, service: &Service) -> Result<()> {
        let url = self.key_url(service)?;
        let value = address(&service.ip, service.port);
        debug!(key = %url.path(), value = %value, "consulkv: writing service key");
        self.client
            .put_body(url, value, &format!("writing kv entry for {}", service.id))
    }

    fn deregister(&self, service: &Service) -> Result<()> {
        let url = self.key_url(service)?;
        self.client
            .delete(url, &format!("deleting kv entry for {}", service.id))
    }

    fn refresh(&self, _service: &Service) -> Result<()> {
        Ok(())
    }

    fn services(&self) -> Result<Vec<Service>> {
        Ok(Vec::new())
    }
}

fn key_prefix(path: &str) -> Vec<String> {
    path.split('/')
        .filter(|segment| !segment.is_empty())
        .map(str::to_string)
        .collect()
}

/// `ip:port`, with IPv6 hosts bracketed.
fn address(ip: &str, port: u16) -> String {
    match ip.parse::<IpAddr>() {
        Ok(IpAddr::V6(_)) => format!("[{ip}]:{port}"),
        _ => format!("{ip}:{port}"),
    }
}
