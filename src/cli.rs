use crate::config::{BridgeConfig, DeregisterCheck, system_hostname};
use crate::services::{DaemonOptions, RetryPolicy};
use anyhow::{Result, bail};
use clap::Parser;
use std::time::Duration;

#[derive(Debug, Parser)]
#[command(
    name = "registrar",
    version,
    about = "Registers containers with a service registry as they start and stop"
)]
pub struct Cli {
    /// IP for ports mapped to the host
    #[arg(long, env = "REGISTRAR_IP")]
    pub ip: Option<String>,

    /// Use internal ports instead of published ones
    #[arg(long, env = "REGISTRAR_INTERNAL")]
    pub internal: bool,

    /// Only register containers which have SERVICE_NAME label set
    #[arg(long, env = "REGISTRAR_EXPLICIT")]
    pub explicit: bool,

    /// Use IP which is stored in a label assigned to the container
    #[arg(long, env = "REGISTRAR_USE_IP_FROM_LABEL")]
    pub use_ip_from_label: Option<String>,

    /// Append tags for all registered services (comma separated)
    #[arg(long, env = "REGISTRAR_TAGS", default_value = "")]
    pub tags: String,

    /// TTL for services in seconds (default is no expiry)
    #[arg(long, env = "REGISTRAR_TTL", default_value_t = 0)]
    pub ttl: u64,

    /// Frequency with which service TTLs are refreshed, in seconds
    #[arg(long, env = "REGISTRAR_TTL_REFRESH", default_value_t = 0)]
    pub ttl_refresh: u64,

    /// Frequency with which services are resynchronized, in seconds
    #[arg(long, env = "REGISTRAR_RESYNC", default_value_t = 0)]
    pub resync: u64,

    /// Deregister exited services "always" or "on-success"
    #[arg(long, env = "REGISTRAR_DEREGISTER", default_value_t = DeregisterCheck::Always)]
    pub deregister: DeregisterCheck,

    /// Max retry attempts to establish a connection with the registry. Use -1 for infinite retries
    #[arg(
        long,
        env = "REGISTRAR_RETRY_ATTEMPTS",
        default_value_t = 0,
        allow_negative_numbers = true
    )]
    pub retry_attempts: i64,

    /// Interval (in milliseconds) between retry attempts
    #[arg(long, env = "REGISTRAR_RETRY_INTERVAL", default_value_t = 2000)]
    pub retry_interval: u64,

    /// Remove dangling services
    #[arg(long, env = "REGISTRAR_CLEANUP")]
    pub cleanup: bool,

    /// Enable debug logging
    #[arg(long, env = "REGISTRAR_DEBUG")]
    pub debug: bool,

    /// Container runtime command line to drive (docker or podman)
    #[arg(long, env = "REGISTRAR_RUNTIME", default_value = "docker")]
    pub runtime: String,

    /// Hostname used in service ids (default: this machine's hostname)
    #[arg(long, env = "REGISTRAR_HOSTNAME")]
    pub hostname: Option<String>,

    /// Registry URI, e.g. consul://localhost:8500
    #[arg(value_name = "REGISTRY_URI")]
    pub registry_uri: String,
}

impl Cli {
    /// Default `tracing` filter when `RUST_LOG` is unset.
    pub fn default_log_filter(&self) -> &'static str {
        if self.debug {
            "registrar=debug"
        } else {
            "registrar=info"
        }
    }

    /// Validates the flags and splits them into bridge and process settings.
    pub fn into_config(self) -> Result<(BridgeConfig, DaemonOptions)> {
        if self.retry_interval == 0 {
            bail!("--retry-interval must be greater than 0");
        }
        if self.retry_attempts < RetryPolicy::UNBOUNDED {
            bail!("--retry-attempts must be -1 (unbounded) or a non-negative count");
        }

        let hostname = match self.hostname.filter(|name| !name.is_empty()) {
            Some(hostname) => hostname,
            None => system_hostname()?,
        };

        let config = BridgeConfig {
            hostname,
            host_ip: self.ip.filter(|ip| !ip.is_empty()),
            internal: self.internal,
            explicit: self.explicit,
            use_ip_from_label: self.use_ip_from_label.filter(|label| !label.is_empty()),
            force_tags: self.tags,
            refresh_ttl: self.ttl,
            refresh_interval: self.ttl_refresh,
            deregister_check: self.deregister,
            cleanup: self.cleanup,
        };
        config.validate()?;

        let options = DaemonOptions {
            registry_uri: self.registry_uri,
            runtime_program: self.runtime,
            refresh_interval: Duration::from_secs(self.ttl_refresh),
            resync_interval: Duration::from_secs(self.resync),
            retry: RetryPolicy {
                attempts: self.retry_attempts,
                interval: Duration::from_millis(self.retry_interval),
            },
        };

        Ok((config, options))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<(BridgeConfig, DaemonOptions)> {
        let mut argv = vec!["registrar", "--hostname", "thishost"];
        argv.extend_from_slice(args);
        Cli::try_parse_from(argv)?.into_config()
    }

    #[test]
    fn test_defaults() {
        let (config, options) = parse(&["consul://localhost:8500"]).unwrap();

        assert_eq!(config.hostname, "thishost");
        assert_eq!(config.deregister_check, DeregisterCheck::Always);
        assert_eq!(config.host_ip, None);
        assert_eq!(options.registry_uri, "consul://localhost:8500");
        assert_eq!(options.runtime_program, "docker");
        assert_eq!(options.retry, RetryPolicy::default());
        assert!(options.refresh_interval.is_zero());
    }

    #[test]
    fn test_full_flag_set() {
        let (config, options) = parse(&[
            "--ip",
            "192.168.0.10",
            "--internal",
            "--tags",
            "a,b",
            "--ttl",
            "30",
            "--ttl-refresh",
            "10",
            "--resync",
            "60",
            "--deregister",
            "on-success",
            "--retry-attempts",
            "-1",
            "--retry-interval",
            "500",
            "--cleanup",
            "--runtime",
            "podman",
            "consulkv://agent/services",
        ])
        .unwrap();

        assert_eq!(config.host_ip.as_deref(), Some("192.168.0.10"));
        assert!(config.internal);
        assert!(config.cleanup);
        assert_eq!(config.force_tags, "a,b");
        assert_eq!(config.deregister_check, DeregisterCheck::OnSuccess);
        assert_eq!(options.refresh_interval, Duration::from_secs(10));
        assert_eq!(options.resync_interval, Duration::from_secs(60));
        assert_eq!(options.retry.attempts, RetryPolicy::UNBOUNDED);
        assert_eq!(options.retry.interval, Duration::from_millis(500));
        assert_eq!(options.runtime_program, "podman");
    }

    #[test]
    fn test_ttl_requires_refresh() {
        assert!(parse(&["--ttl", "30", "consul://"]).is_err());
        assert!(parse(&["--ttl-refresh", "10", "consul://"]).is_err());
        assert!(parse(&["--ttl", "10", "--ttl-refresh", "10", "consul://"]).is_err());
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(parse(&["--deregister", "sometimes", "consul://"]).is_err());
        assert!(parse(&["--retry-interval", "0", "consul://"]).is_err());
        assert!(parse(&["--retry-attempts", "-2", "consul://"]).is_err());
    }

    #[test]
    fn test_registry_uri_is_required() {
        assert!(Cli::try_parse_from(["registrar"]).is_err());
    }

    #[test]
    fn test_debug_changes_log_filter() {
        let cli = Cli::try_parse_from(["registrar", "--debug", "consul://"]).unwrap();

        assert_eq!(cli.default_log_filter(), "registrar=debug");
    }
}
