//! Peer fingerprints
//!
//! A fingerprint identifies the host a connection comes from, independent of
//! its source port, and is the key sandboxes are pooled under.

use std::hash::Hasher;
use std::net::{IpAddr, SocketAddr};

use fnv::FnvHasher;

/// Stable, port-independent identifier of a remote host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(u64);

impl Fingerprint {
    /// Fingerprint of a host address
    pub fn from_ip(ip: IpAddr) -> Self {
        // v4-mapped v6 peers are the same host as their v4 form
        let ip = match ip {
            IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(IpAddr::V6(v6)),
            v4 => v4,
        };

        let mut hasher = FnvHasher::default();
        hasher.write(ip.to_string().as_bytes());
        Fingerprint(hasher.finish())
    }

    /// Fingerprint of a peer, ignoring its port
    pub fn from_peer(addr: SocketAddr) -> Self {
        Self::from_ip(addr.ip())
    }

    /// Sandbox name for this fingerprint
    pub fn sandbox_name(&self, prefix: &str) -> String {
        format!("{}-{}", prefix, self)
    }

    /// Recover the fingerprint from a sandbox name built by `sandbox_name`
    pub fn from_sandbox_name(name: &str, prefix: &str) -> Option<Self> {
        let hex = name.strip_prefix(prefix)?.strip_prefix('-')?;
        // only names this crate renders: exactly 16 lowercase hex digits
        if hex.len() != 16 || !hex.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
            return None;
        }
        u64::from_str_radix(hex, 16).ok().map(Fingerprint)
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_independent() {
        let a: SocketAddr = "192.0.2.7:40000".parse().unwrap();
        let b: SocketAddr = "192.0.2.7:51234".parse().unwrap();
        assert_eq!(Fingerprint::from_peer(a), Fingerprint::from_peer(b));
    }

    #[test]
    fn test_hosts_differ() {
        let a: SocketAddr = "192.0.2.7:40000".parse().unwrap();
        let b: SocketAddr = "192.0.2.8:40000".parse().unwrap();
        assert_ne!(Fingerprint::from_peer(a), Fingerprint::from_peer(b));
    }

    #[test]
    fn test_mapped_v6_matches_v4() {
        let v4: SocketAddr = "198.51.100.1:1000".parse().unwrap();
        let mapped: SocketAddr = "[::ffff:198.51.100.1]:2000".parse().unwrap();
        assert_eq!(Fingerprint::from_peer(v4), Fingerprint::from_peer(mapped));
    }

    #[test]
    fn test_sandbox_name_round_trip() {
        let fp = Fingerprint::from_ip("203.0.113.9".parse().unwrap());
        let name = fp.sandbox_name("honeytrap");
        assert!(name.starts_with("honeytrap-"));
        assert_eq!(name.len(), "honeytrap-".len() + 16);
        assert_eq!(Fingerprint::from_sandbox_name(&name, "honeytrap"), Some(fp));
    }

    #[test]
    fn test_foreign_names_rejected() {
        assert_eq!(Fingerprint::from_sandbox_name("honeytrap", "honeytrap"), None);
        assert_eq!(Fingerprint::from_sandbox_name("other-0000000000000001", "honeytrap"), None);
        assert_eq!(Fingerprint::from_sandbox_name("honeytrap-xyz", "honeytrap"), None);
        assert_eq!(Fingerprint::from_sandbox_name("honeytrap-zzzzzzzzzzzzzzzz", "honeytrap"), None);
    }

    #[test]
    fn test_non_canonical_hex_rejected() {
        // from_str_radix alone would accept both
        assert_eq!(Fingerprint::from_sandbox_name("honeytrap-+bcdef0123456789", "honeytrap"), None);
        assert_eq!(Fingerprint::from_sandbox_name("honeytrap-0123456789ABCDEF", "honeytrap"), None);
        assert!(Fingerprint::from_sandbox_name("honeytrap-0123456789abcdef", "honeytrap").is_some());
    }
}
