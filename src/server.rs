use std::net::{IpAddr, SocketAddr};

use crate::address::parse_socket_addr;

pub const DOT_PORT: u16 = 853;
pub const DNS_PORT: u16 = 53;

/// Transport protocol an upstream server speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Protocol {
    Udp,
    Tcp,
    Tls,
}

/// An upstream DNS server identity.
///
/// Immutable once constructed. Two servers are interchangeable for pool
/// membership when [`addr_eq`] holds (address and port); private-DNS state
/// is keyed by [`ServerIdentity`] instead, which binds the expected
/// certificate hostname and protocol but ignores the port.
///
/// [`addr_eq`]: DnsServer::addr_eq
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DnsServer {
    pub addr: SocketAddr,
    /// Expected name on the server certificate, for DoT servers configured
    /// by hostname. Empty means opportunistic (no name to verify).
    pub hostname: String,
    pub protocol: Protocol,
    /// Pinned SHA-256 certificate digests. When non-empty, a presented
    /// certificate must match one of these.
    pub fingerprints: Vec<Vec<u8>>,
}

impl DnsServer {
    pub fn new(addr: SocketAddr) -> Self {
        DnsServer {
            addr,
            hostname: String::new(),
            protocol: Protocol::Tls,
            fingerprints: Vec::new(),
        }
    }

    pub fn udp(addr: SocketAddr) -> Self {
        DnsServer {
            addr,
            hostname: String::new(),
            protocol: Protocol::Udp,
            fingerprints: Vec::new(),
        }
    }

    /// Parses a configured server string (`ip` or `ip:port`), defaulting to
    /// the DoT port.
    pub fn parse_tls(s: &str, hostname: &str) -> std::io::Result<Self> {
        Ok(DnsServer {
            addr: parse_socket_addr(s, DOT_PORT)?,
            hostname: hostname.to_string(),
            protocol: Protocol::Tls,
            fingerprints: Vec::new(),
        })
    }

    pub fn ip(&self) -> IpAddr {
        self.addr.ip()
    }

    /// Pool-membership equality: same address and port.
    pub fn addr_eq(&self, other: &DnsServer) -> bool {
        self.addr == other.addr
    }

    /// True if the server was configured with an expected hostname, i.e. the
    /// operator opted into strict certificate matching.
    pub fn explicitly_configured(&self) -> bool {
        !self.hostname.is_empty()
    }

    pub fn identity(&self) -> ServerIdentity {
        ServerIdentity {
            ip: self.addr.ip(),
            hostname: self.hostname.clone(),
            protocol: self.protocol,
        }
    }
}

impl std::fmt::Display for DnsServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.hostname.is_empty() {
            write!(f, "{}", self.addr)
        } else {
            write!(f, "{} ({})", self.addr, self.hostname)
        }
    }
}

/// Key for private-DNS validation state: address, expected hostname and
/// protocol. The port is deliberately not part of the identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServerIdentity {
    pub ip: IpAddr,
    pub hostname: String,
    pub protocol: Protocol,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server(s: &str) -> DnsServer {
        DnsServer::parse_tls(s, "").unwrap()
    }

    #[test]
    fn test_default_port() {
        assert_eq!(server("192.0.2.1").addr.port(), DOT_PORT);
        assert_eq!(server("192.0.2.1:5353").addr.port(), 5353);
    }

    #[test]
    fn test_addr_eq_includes_port() {
        assert!(server("192.0.2.1").addr_eq(&server("192.0.2.1")));
        assert!(!server("192.0.2.1").addr_eq(&server("192.0.2.1:5353")));
        assert!(!server("192.0.2.1").addr_eq(&server("192.0.2.2")));
        assert!(!server("2001:db8::1").addr_eq(&server("2001:db8::2")));
    }

    #[test]
    fn test_name_distinguishes_servers() {
        let s1 = DnsServer::parse_tls("192.0.2.1", "dns.example.com").unwrap();
        let s2 = DnsServer::parse_tls("192.0.2.1", "dns.example.org").unwrap();
        let s3 = server("192.0.2.1");
        assert_ne!(s1, s2);
        assert_ne!(s1, s3);
        assert!(s1.addr_eq(&s2));
        assert!(s1.explicitly_configured());
        assert!(!s3.explicitly_configured());
    }

    #[test]
    fn test_identity_ignores_port() {
        let s1 = DnsServer::parse_tls("127.0.0.1:853", "dns.example.com").unwrap();
        let s2 = DnsServer::parse_tls("127.0.0.1:5353", "dns.example.com").unwrap();
        assert_eq!(s1.identity(), s2.identity());

        let other_ip = DnsServer::parse_tls("127.0.0.2:853", "dns.example.com").unwrap();
        assert_ne!(s1.identity(), other_ip.identity());
    }

    #[test]
    fn test_identity_binds_hostname_and_protocol() {
        let named = DnsServer::parse_tls("127.0.0.1", "dns.example.com").unwrap();
        let other_name = DnsServer::parse_tls("127.0.0.1", "other.example.com").unwrap();
        let unnamed = server("127.0.0.1");
        assert_ne!(named.identity(), other_name.identity());
        assert_ne!(named.identity(), unnamed.identity());

        let mut udp = named.clone();
        udp.protocol = Protocol::Udp;
        assert_ne!(named.identity(), udp.identity());
    }
}
