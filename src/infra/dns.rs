use crate::domain::HostResolver;
use std::net::{IpAddr, ToSocketAddrs};

/// Resolves names through the operating system resolver, preferring IPv4.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemResolver;

impl HostResolver for SystemResolver {
    fn resolve(&self, host: &str) -> Option<IpAddr> {
        if host.is_empty() {
            return None;
        }
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Some(ip);
        }

        let addresses: Vec<IpAddr> = (host, 0)
            .to_socket_addrs()
            .ok()?
            .map(|addr| addr.ip())
            .collect();

        addresses
            .iter()
            .find(|ip| ip.is_ipv4())
            .or_else(|| addresses.first())
            .copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_literal_addresses_resolve_to_themselves() {
        assert_eq!(
            SystemResolver.resolve("192.168.1.10"),
            Some("192.168.1.10".parse().unwrap())
        );
        assert_eq!(SystemResolver.resolve(""), None);
    }

    #[test]
    fn test_localhost_resolves() {
        assert!(SystemResolver.resolve("localhost").is_some());
    }
}
