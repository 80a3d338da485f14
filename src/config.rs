use anyhow::{Context, Result, bail};
use std::fmt;
use std::str::FromStr;

/// When an exited container's services are deregistered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DeregisterCheck {
    /// Every exit deregisters.
    #[default]
    Always,
    /// Only clean exits (code 0 or killed by a signal) deregister.
    OnSuccess,
}

impl FromStr for DeregisterCheck {
    type Err = String;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        match value {
            "always" => Ok(Self::Always),
            "on-success" => Ok(Self::OnSuccess),
            other => Err(format!(
                "deregister must be \"always\" or \"on-success\", got \"{other}\""
            )),
        }
    }
}

impl fmt::Display for DeregisterCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Always => write!(f, "always"),
            Self::OnSuccess => write!(f, "on-success"),
        }
    }
}

/// Immutable policy the bridge runs with.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BridgeConfig {
    /// Hostname encoded into default service ids.
    pub hostname: String,
    /// Forces the IP of every published port.
    pub host_ip: Option<String>,
    /// Register container-network addresses instead of published ones.
    pub internal: bool,
    /// Only register services that carry an explicit name.
    pub explicit: bool,
    /// Label holding the IP to register.
    pub use_ip_from_label: Option<String>,
    /// Comma-separated tags appended to every service.
    pub force_tags: String,
    /// Service TTL in seconds; 0 disables the dead-container grace window.
    pub refresh_ttl: u64,
    /// Seconds between refresh passes.
    pub refresh_interval: u64,
    pub deregister_check: DeregisterCheck,
    /// Remove stale containers and dangling registry entries during sync.
    pub cleanup: bool,
}

impl BridgeConfig {
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            ..Self::default()
        }
    }

    /// Rejects TTL settings the refresh loop cannot honour.
    pub fn validate(&self) -> Result<()> {
        if (self.refresh_ttl == 0) != (self.refresh_interval == 0) {
            bail!("--ttl and --ttl-refresh must be specified together or not at all");
        }
        if self.refresh_ttl > 0 && self.refresh_ttl <= self.refresh_interval {
            bail!("--ttl must be greater than --ttl-refresh");
        }
        Ok(())
    }
}

/// The machine's hostname as reported by the OS.
pub fn system_hostname() -> Result<String> {
    let hostname = hostname::get().context("reading system hostname")?;
    Ok(hostname.to_string_lossy().into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deregister_check_parse() {
        assert_eq!("always".parse::<DeregisterCheck>(), Ok(DeregisterCheck::Always));
        assert_eq!(
            "on-success".parse::<DeregisterCheck>(),
            Ok(DeregisterCheck::OnSuccess)
        );
        assert!("sometimes".parse::<DeregisterCheck>().is_err());
        assert_eq!(DeregisterCheck::OnSuccess.to_string(), "on-success");
    }

    #[test]
    fn test_ttl_must_come_with_refresh_interval() {
        let mut config = BridgeConfig::new("host");
        config.refresh_ttl = 30;
        assert!(config.validate().is_err());

        config.refresh_ttl = 0;
        config.refresh_interval = 10;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_ttl_must_exceed_refresh_interval() {
        let mut config = BridgeConfig::new("host");
        config.refresh_ttl = 10;
        config.refresh_interval = 10;
        assert!(config.validate().is_err());

        config.refresh_ttl = 30;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_defaults_are_valid() {
        assert!(BridgeConfig::default().validate().is_ok());
    }
}
