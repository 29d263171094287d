//! Hostname routing.
//!
//! Exact host match first, then one-label-less wildcard (`*.suffix`).
//! Misses from public addresses are counted as probes and blacklisted per
//! IP before the connection is dropped.

use std::collections::HashMap;
use std::net::IpAddr;

/// Where a matched host forwards to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backend {
    pub host: String,
    pub port: u16,
}

impl Backend {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Host → backend table.
#[derive(Debug, Default)]
pub struct HostTable {
    exact: HashMap<String, Backend>,
    wildcard: HashMap<String, Backend>,
}

impl HostTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a hostname. `*.suffix` registers a wildcard matching any
    /// host exactly one label below `suffix`.
    pub fn insert(&mut self, host: &str, backend: Backend) {
        match host.strip_prefix("*.") {
            Some(suffix) => {
                self.wildcard.insert(suffix.to_lowercase(), backend);
            }
            None => {
                self.exact.insert(host.to_lowercase(), backend);
            }
        }
    }

    /// Exact match beats wildcard; a port suffix on the header is ignored.
    pub fn lookup(&self, host: &str) -> Option<&Backend> {
        let name = host.split(':').next().unwrap_or(host).to_lowercase();
        if let Some(backend) = self.exact.get(&name) {
            return Some(backend);
        }
        let (_, suffix) = name.split_once('.')?;
        self.wildcard.get(suffix)
    }

    pub fn is_empty(&self) -> bool {
        self.exact.is_empty() && self.wildcard.is_empty()
    }
}

/// RFC1918, loopback and link-local addresses. Probes from these are not
/// counted unless the proxy is verbose.
pub fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_private() || v4.is_loopback() || v4.is_link_local() || v4.is_unspecified()
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unspecified()
                // fe80::/10 link-local, fc00::/7 unique-local
                || (v6.segments()[0] & 0xffc0) == 0xfe80
                || (v6.segments()[0] & 0xfe00) == 0xfc00
                || v6.to_ipv4_mapped().map(|v4| is_private_ip(&IpAddr::V4(v4))).unwrap_or(false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend(port: u16) -> Backend {
        Backend {
            host: "127.0.0.1".into(),
            port,
        }
    }

    #[test]
    fn exact_beats_wildcard() {
        let mut table = HostTable::new();
        table.insert("example.net", backend(9000));
        table.insert("*.example.net", backend(9001));

        assert_eq!(table.lookup("example.net"), Some(&backend(9000)));
        assert_eq!(table.lookup("www.example.net"), Some(&backend(9001)));
        assert_eq!(table.lookup("EXAMPLE.NET"), Some(&backend(9000)));
    }

    #[test]
    fn wildcard_is_one_label_deep() {
        let mut table = HostTable::new();
        table.insert("*.example.net", backend(9001));

        assert_eq!(table.lookup("a.example.net"), Some(&backend(9001)));
        // Two labels below the suffix miss: only `b.example.net`'s own
        // wildcard would catch `a.b.example.net`.
        assert_eq!(table.lookup("a.b.example.net"), None);
        assert_eq!(table.lookup("example.net"), None);
    }

    #[test]
    fn port_suffix_is_ignored() {
        let mut table = HostTable::new();
        table.insert("example.net", backend(9000));
        assert_eq!(table.lookup("example.net:8443"), Some(&backend(9000)));
    }

    #[test]
    fn unknown_hosts_miss() {
        let table = HostTable::new();
        assert_eq!(table.lookup("nowhere.invalid"), None);
    }

    #[test]
    fn private_ranges_are_recognized() {
        let private = ["10.1.2.3", "192.168.0.9", "172.16.4.4", "127.0.0.1", "169.254.0.5", "::1", "fe80::1", "fd00::1"];
        for ip in private {
            assert!(is_private_ip(&ip.parse().unwrap()), "{ip}");
        }
        let public = ["203.0.113.9", "8.8.8.8", "2001:db8::1"];
        for ip in public {
            assert!(!is_private_ip(&ip.parse().unwrap()), "{ip}");
        }
    }
}
