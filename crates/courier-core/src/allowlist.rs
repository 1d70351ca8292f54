//! IP allowlist parsing and matching.
//!
//! Entries are single addresses or CIDR blocks, IPv4 or IPv6. A bare address
//! is treated as a host route (`/32` or `/128`).

use std::net::IpAddr;

use ipnetwork::IpNetwork;

use crate::error::{CoreError, Result};

/// Parsed, validated allowlist.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IpAllowlist {
    networks: Vec<IpNetwork>,
}

impl IpAllowlist {
    /// Parses every entry, failing on the first malformed one.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Validation` naming the offending entry.
    pub fn parse<S: AsRef<str>>(entries: &[S]) -> Result<Self> {
        let networks = entries
            .iter()
            .map(|entry| parse_entry(entry.as_ref()))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { networks })
    }

    /// Whether `addr` falls inside any entry.
    pub fn contains(&self, addr: IpAddr) -> bool {
        self.networks.iter().any(|network| network.contains(addr))
    }

    /// Whether the list has no entries.
    pub fn is_empty(&self) -> bool {
        self.networks.is_empty()
    }

    /// Canonical string form of each entry, in input order.
    pub fn to_strings(&self) -> Vec<String> {
        self.networks.iter().map(ToString::to_string).collect()
    }
}

fn parse_entry(entry: &str) -> Result<IpNetwork> {
    let trimmed = entry.trim();
    if let Ok(addr) = trimmed.parse::<IpAddr>() {
        return Ok(IpNetwork::from(addr));
    }
    trimmed
        .parse::<IpNetwork>()
        .map_err(|e| CoreError::validation(format!("invalid IP or CIDR entry '{entry}': {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_addresses_and_cidr_blocks() {
        let list = IpAllowlist::parse(&["10.0.0.0/8", "192.168.1.10", "2001:db8::/32"]).unwrap();

        assert!(list.contains("10.20.30.40".parse().unwrap()));
        assert!(list.contains("192.168.1.10".parse().unwrap()));
        assert!(!list.contains("192.168.1.11".parse().unwrap()));
        assert!(list.contains("2001:db8::1".parse().unwrap()));
        assert!(!list.contains("2001:db9::1".parse().unwrap()));
    }

    #[test]
    fn rejects_malformed_entries() {
        for bad in ["10.0.0.0/33", "not-an-ip", "300.1.1.1", ""] {
            let err = IpAllowlist::parse(&[bad]).unwrap_err();
            assert!(matches!(err, CoreError::Validation(_)), "{bad} should be rejected");
        }
    }

    #[test]
    fn canonical_strings_keep_order() {
        let list = IpAllowlist::parse(&["192.168.1.10", "10.0.0.0/8"]).unwrap();
        assert_eq!(list.to_strings(), vec!["192.168.1.10/32", "10.0.0.0/8"]);
    }

    #[test]
    fn empty_list_matches_nothing() {
        let list = IpAllowlist::parse::<&str>(&[]).unwrap();
        assert!(list.is_empty());
        assert!(!list.contains("127.0.0.1".parse().unwrap()));
    }
}
