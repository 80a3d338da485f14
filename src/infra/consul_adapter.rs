use crate::domain::{AdapterFactory, RegistryAdapter, Service, short_id};
use crate::infra::ConsulClient;
use crate::services::AdapterFactories;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::info;
use url::Url;

const DEFAULT_INTERVAL: &str = "10s";

/// Registers the `consul` and `consul-tls` schemes.
pub fn register(factories: &mut AdapterFactories) {
    let factory = Arc::new(ConsulFactory);
    factories
        .register("consul", factory.clone())
        .register("consul-tls", factory);
}

pub struct ConsulFactory;

impl AdapterFactory for ConsulFactory {
    fn build(&self, uri: &Url) -> Result<Box<dyn RegistryAdapter>> {
        let client = ConsulClient::from_uri(uri, uri.scheme() == "consul-tls")?;
        Ok(Box::new(ConsulAdapter { client }))
    }
}

/// Registers services with a Consul agent's service catalog.
#[derive(Debug)]
pub struct ConsulAdapter {
    client: ConsulClient,
}

#[derive(Debug, Serialize)]
struct AgentServiceRegistration<'a> {
    #[serde(rename = "ID")]
    id: &'a str,
    #[serde(rename = "Name")]
    name: &'a str,
    #[serde(rename = "Port")]
    port: u16,
    #[serde(rename = "Tags")]
    tags: &'a [String],
    #[serde(rename = "Address")]
    address: &'a str,
    #[serde(rename = "Check", skip_serializing_if = "Option::is_none")]
    check: Option<AgentServiceCheck>,
    #[serde(rename = "Meta")]
    meta: &'a BTreeMap<String, String>,
}

/// Health check definition in Consul's agent API shape.
#[derive(Debug, Default, PartialEq, Eq, Serialize)]
pub struct AgentServiceCheck {
    #[serde(rename = "Status", skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(rename = "HTTP", skip_serializing_if = "Option::is_none")]
    pub http: Option<String>,
    #[serde(rename = "Method", skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(rename = "Timeout", skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
    #[serde(rename = "Args", skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(rename = "TTL", skip_serializing_if = "Option::is_none")]
    pub ttl: Option<String>,
    #[serde(rename = "TCP", skip_serializing_if = "Option::is_none")]
    pub tcp: Option<String>,
    #[serde(rename = "GRPC", skip_serializing_if = "Option::is_none")]
    pub grpc: Option<String>,
    #[serde(rename = "GRPCUseTLS", skip_serializing_if = "std::ops::Not::not")]
    pub grpc_use_tls: bool,
    #[serde(rename = "TLSSkipVerify", skip_serializing_if = "std::ops::Not::not")]
    pub tls_skip_verify: bool,
    #[serde(rename = "Interval", skip_serializing_if = "Option::is_none")]
    pub interval: Option<String>,
    #[serde(
        rename = "DeregisterCriticalServiceAfter",
        skip_serializing_if = "Option::is_none"
    )]
    pub deregister_critical_service_after: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AgentService {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "Service", default)]
    service: String,
    #[serde(rename = "Tags", default)]
    tags: Option<Vec<String>>,
    #[serde(rename = "Port", default)]
    port: u16,
    #[serde(rename = "Address", default)]
    address: String,
}

impl RegistryAdapter for ConsulAdapter {
    fn ping(&self) -> Result<()> {
        let leader = self.client.leader()?;
        info!(leader = %leader, "consul: current leader");
        Ok(())
    }

    fn register(&self, service: &Service) -> Result<()> {
        let registration = AgentServiceRegistration {
            id: &service.id,
            name: &service.name,
            port: service.port,
            tags: &service.tags,
            address: &service.ip,
            check: build_check(service),
            meta: &service.attrs,
        };

        let mut url = self.client.endpoint(&["v1", "agent", "service", "register"])?;
        url.query_pairs_mut()
            .append_pair("replace-existing-checks", "true");
        self.client
            .put_json(url, &registration, &format!("registering {}", service.id))
    }

    fn deregister(&self, service: &Service) -> Result<()> {
        let url = self
            .client
            .endpoint(&["v1", "agent", "service", "deregister", &service.id])?;
        self.client
            .put_body(url, String::new(), &format!("deregistering {}", service.id))
    }

    fn refresh(&self, _service: &Service) -> Result<()> {
        Ok(())
    }

    fn services(&self) -> Result<Vec<Service>> {
        let url = self.client.endpoint(&["v1", "agent", "services"])?;
        let services: HashMap<String, AgentService> =
            self.client.get_json(url, "listing consul services")?;

        Ok(services
            .into_values()
            .map(|entry| Service {
                tags: entry.tags.unwrap_or_default(),
                port: entry.port,
                ip: entry.address,
                ..Service::remote(entry.id, entry.service)
            })
            .collect())
    }
}

/// Health check described by the service's `check_*` attributes, if any.
pub fn build_check(service: &Service) -> Option<AgentServiceCheck> {
    let attr = |key: &str| {
        service
            .attrs
            .get(key)
            .map(String::as_str)
            .filter(|value| !value.is_empty())
    };
    let owned = |key: &str| attr(key).map(str::to_string);
    let endpoint = format!("{}:{}", service.ip, service.port);

    let mut check = AgentServiceCheck {
        status: owned("check_initial_status"),
        ..AgentServiceCheck::default()
    };

    if let Some(path) = attr("check_http") {
        check.http = Some(format!("http://{endpoint}{path}"));
        check.timeout = owned("check_timeout");
        check.method = owned("check_http_method");
    } else if let Some(path) = attr("check_https") {
        check.http = Some(format!("https://{endpoint}{path}"));
        check.timeout = owned("check_timeout");
        check.method = owned("check_https_method");
    } else if let Some(cmd) = attr("check_cmd") {
        check.args = vec![
            "check-cmd".to_string(),
            short_id(&service.origin.container_id).to_string(),
            service.origin.exposed_port.clone(),
            cmd.to_string(),
        ];
    } else if let Some(script) = attr("check_script") {
        check.args = vec![interpolate(script, service)];
    } else if let Some(ttl) = attr("check_ttl") {
        check.ttl = Some(ttl.to_string());
    } else if attr("check_tcp").is_some() {
        check.tcp = Some(endpoint);
        check.timeout = owned("check_timeout");
    } else if attr("check_grpc").is_some() {
        check.grpc = Some(endpoint);
        check.timeout = owned("check_timeout");
        if attr("check_grpc_use_tls").is_some() {
            check.grpc_use_tls = true;
            check.tls_skip_verify = attr("check_tls_skip_verify").is_some();
        }
    } else {
        return None;
    }

    // TTL checks are pushed by the service itself and take no interval.
    if check.ttl.is_none() {
        check.interval = Some(owned("check_interval").unwrap_or_else(|| DEFAULT_INTERVAL.to_string()));
    }
    check.deregister_critical_service_after = owned("check_deregister_after");

    Some(check)
}

fn interpolate(script: &str, service: &Service) -> String {
    script
        .replace("$SERVICE_IP", &service.ip)
        .replace("$SERVICE_PORT", &service.port.to_string())
}
