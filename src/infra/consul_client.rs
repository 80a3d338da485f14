use anyhow::{Context, Result, anyhow};
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::{Certificate, Identity, Method};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::env;
use std::fs;
use std::time::Duration;
use url::Url;

const DEFAULT_ADDRESS: &str = "127.0.0.1:8500";
const TOKEN_HEADER: &str = "X-Consul-Token";

/// Minimal blocking client for the Consul HTTP API.
#[derive(Debug, Clone)]
pub struct ConsulClient {
    http: Client,
    base: Url,
    token: Option<String>,
}

impl ConsulClient {
    /// Builds a client for the agent named by the URI host. `tls` switches
    /// to https and loads `CONSUL_CACERT`, `CONSUL_CLIENT_CERT` and
    /// `CONSUL_CLIENT_KEY` when set.
    pub fn from_uri(uri: &Url, tls: bool) -> Result<Self> {
        let address = agent_address(uri, env::var("CONSUL_HTTP_ADDR").ok().as_deref());
        let scheme = if tls { "https" } else { "http" };
        let base = Url::parse(&format!("{scheme}://{address}/"))
            .with_context(|| format!("invalid consul address {address}"))?;

        let mut builder = Client::builder().connect_timeout(Duration::from_secs(30));
        if tls {
            if let Ok(path) = env::var("CONSUL_CACERT") {
                let pem = fs::read(&path).with_context(|| format!("reading CA cert {path}"))?;
                builder = builder.add_root_certificate(
                    Certificate::from_pem(&pem).context("parsing CONSUL_CACERT")?,
                );
            }
            if let (Ok(cert), Ok(key)) = (env::var("CONSUL_CLIENT_CERT"), env::var("CONSUL_CLIENT_KEY")) {
                let cert = fs::read(&cert).with_context(|| format!("reading client cert {cert}"))?;
                let key = fs::read(&key).with_context(|| format!("reading client key {key}"))?;
                builder = builder.identity(
                    Identity::from_pkcs8_pem(&cert, &key).context("loading consul client identity")?,
                );
            }
        }

        let client = Self {
            http: builder.build().context("building consul http client")?,
            base,
            token: None,
        };
        let token = env::var("CONSUL_HTTP_TOKEN")
            .or_else(|_| env::var("CONSUL_ACL_TOKEN"))
            .ok()
            .filter(|token| !token.is_empty());

        Ok(match token {
            Some(token) => client.with_token(token),
            None => client,
        })
    }

    /// Sends `token` as the ACL token on every request.
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn base(&self) -> &Url {
        &self.base
    }

    /// URL for `segments` below the agent address, each segment escaped.
    pub fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| anyhow!("consul address cannot carry a path"))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// Current raft leader, used as a liveness probe.
    pub fn leader(&self) -> Result<String> {
        let url = self.endpoint(&["v1", "status", "leader"])?;
        self.send(self.request(Method::GET, url), "fetching consul leader")?
            .json()
            .context("decoding consul leader")
    }

    pub fn put_json<T: Serialize>(&self, url: Url, body: &T, context: &str) -> Result<()> {
        self.send(self.request(Method::PUT, url).json(body), context)?;
        Ok(())
    }

    pub fn put_body(&self, url: Url, body: String, context: &str) -> Result<()> {
        self.send(self.request(Method::PUT, url).body(body), context)?;
        Ok(())
    }

    pub fn delete(&self, url: Url, context: &str) -> Result<()> {
        self.send(self.request(Method::DELETE, url), context)?;
        Ok(())
    }

    pub fn get_json<T: DeserializeOwned>(&self, url: Url, context: &str) -> Result<T> {
        self.send(self.request(Method::GET, url), context)?
            .json()
            .with_context(|| format!("decoding response ({context})"))
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let request = self.http.request(method, url);
        match &self.token {
            Some(token) => request.header(TOKEN_HEADER, token),
            None => request,
        }
    }

    fn send(&self, request: RequestBuilder, context: &str) -> Result<Response> {
        request
            .send()
            .with_context(|| context.to_string())?
            .error_for_status()
            .with_context(|| context.to_string())
    }
}

/// `host:port` of the agent: the URI host, else `CONSUL_HTTP_ADDR`, else the
/// local agent.
fn agent_address(uri: &Url, from_env: Option<&str>) -> String {
    match (uri.host_str(), uri.port()) {
        (Some(host), Some(port)) if !host.is_empty() => format!("{host}:{port}"),
        (Some(host), None) if !host.is_empty() => format!("{host}:8500"),
        _ => from_env
            .map(|addr| {
                addr.trim_start_matches("http://")
                    .trim_start_matches("https://")
                    .trim_end_matches('/')
            })
            .filter(|addr| !addr.is_empty())
            .map_or_else(|| DEFAULT_ADDRESS.to_string(), str::to_string),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_from_uri() {
        let client = ConsulClient::from_uri(&Url::parse("consul://10.0.0.2:8600").unwrap(), false).unwrap();
        assert_eq!(client.base().as_str(), "http://10.0.0.2:8600/");

        let client = ConsulClient::from_uri(&Url::parse("consul://agent").unwrap(), false).unwrap();
        assert_eq!(client.base().as_str(), "http://agent:8500/");

        assert_eq!(agent_address(&Url::parse("consul:").unwrap(), None), "127.0.0.1:8500");
    }

    #[test]
    fn test_env_address_used_without_host() {
        let uri = Url::parse("consul:").unwrap();

        assert_eq!(agent_address(&uri, Some("10.1.1.1:8500")), "10.1.1.1:8500");
        assert_eq!(agent_address(&uri, Some("http://agent.local:8600/")), "agent.local:8600");
        assert_eq!(agent_address(&uri, Some("")), "127.0.0.1:8500");
    }

    #[test]
    fn test_uri_host_beats_env_address() {
        let uri = Url::parse("consul://agent:8501").unwrap();

        assert_eq!(agent_address(&uri, Some("10.1.1.1:8500")), "agent:8501");
    }

    #[test]
    fn test_tls_uses_https() {
        let client = ConsulClient::from_uri(&Url::parse("consul-tls://agent:8501").unwrap(), true).unwrap();

        assert_eq!(client.base().scheme(), "https");
    }

    #[test]
    fn test_endpoint_escapes_segments() {
        let client = ConsulClient::from_uri(&Url::parse("consul://agent:8500").unwrap(), false).unwrap();

        let url = client
            .endpoint(&["v1", "agent", "service", "deregister", "host:web:80 x"])
            .unwrap();

        assert_eq!(
            url.as_str(),
            "http://agent:8500/v1/agent/service/deregister/host:web:80%20x"
        );
    }
}
