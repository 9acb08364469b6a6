//! Transport address normalization.
//!
//! # Responsibilities
//! - Collapse IPv4-mapped IPv6 addresses (`::ffff:a.b.c.d`) to plain IPv4
//! - Describe both ends of an accepted connection as a family/address pair
//!
//! # Design Decisions
//! - Dual-stack sockets report IPv4 peers in mapped form; callers always see
//!   the canonical IPv4 address and family

use std::fmt;
use std::net::{IpAddr, SocketAddr};

/// Address family of a connection, after canonicalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IpFamily {
    V4,
    V6,
}

impl fmt::Display for IpFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IpFamily::V4 => f.write_str("IPv4"),
            IpFamily::V6 => f.write_str("IPv6"),
        }
    }
}

/// Collapse an IPv4-mapped IPv6 address into its IPv4 form.
///
/// Any other address is returned unchanged.
pub fn canonical_ip(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(v6),
        },
        v4 => v4,
    }
}

/// Family of an address after canonicalization.
pub fn family_of(ip: IpAddr) -> IpFamily {
    match canonical_ip(ip) {
        IpAddr::V4(_) => IpFamily::V4,
        IpAddr::V6(_) => IpFamily::V6,
    }
}

/// Both endpoints of an accepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocketInfo {
    pub family: IpFamily,
    pub local_address: IpAddr,
    pub local_port: u16,
    pub remote_address: IpAddr,
    pub remote_port: u16,
}

impl SocketInfo {
    /// Build from the raw socket addresses reported by the transport.
    ///
    /// The family follows the local side, which is what the listener bound.
    pub fn from_addrs(local: SocketAddr, remote: SocketAddr) -> Self {
        let local_address = canonical_ip(local.ip());
        Self {
            family: family_of(local_address),
            local_address,
            local_port: local.port(),
            remote_address: canonical_ip(remote.ip()),
            remote_port: remote.port(),
        }
    }

    /// Remote endpoint as a socket address.
    pub fn remote(&self) -> SocketAddr {
        SocketAddr::new(self.remote_address, self.remote_port)
    }

    /// Local endpoint as a socket address.
    pub fn local(&self) -> SocketAddr {
        SocketAddr::new(self.local_address, self.local_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[test]
    fn mapped_ipv6_collapses_to_ipv4() {
        let mapped: IpAddr = "::ffff:192.168.1.7".parse().unwrap();
        assert_eq!(canonical_ip(mapped), IpAddr::V4(Ipv4Addr::new(192, 168, 1, 7)));
        assert_eq!(family_of(mapped), IpFamily::V4);
    }

    #[test]
    fn plain_addresses_unchanged() {
        let v6 = IpAddr::V6(Ipv6Addr::LOCALHOST);
        assert_eq!(canonical_ip(v6), v6);
        assert_eq!(family_of(v6), IpFamily::V6);

        let v4 = IpAddr::V4(Ipv4Addr::LOCALHOST);
        assert_eq!(canonical_ip(v4), v4);
    }

    #[test]
    fn socket_info_from_dual_stack() {
        let local: SocketAddr = "[::ffff:127.0.0.1]:8443".parse().unwrap();
        let remote: SocketAddr = "[::ffff:10.0.0.2]:51000".parse().unwrap();
        let info = SocketInfo::from_addrs(local, remote);

        assert_eq!(info.family, IpFamily::V4);
        assert_eq!(info.local_port, 8443);
        assert_eq!(info.remote(), "10.0.0.2:51000".parse::<SocketAddr>().unwrap());
        assert_eq!(info.family.to_string(), "IPv4");
    }
}
