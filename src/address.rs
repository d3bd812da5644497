use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// Parses a textual IP address, rejecting anything that is not a plain
/// numeric IPv4 or IPv6 address. Hostnames are not addresses here: every
/// configuration path that accepts server strings must fail with an invalid
/// argument before any state is touched.
pub fn parse_ip_addr(s: &str) -> std::io::Result<IpAddr> {
    let mut dots = 0;
    let mut possible_ipv4 = true;
    let mut possible_ipv6 = true;
    for b in s.as_bytes().iter() {
        let c = *b;
        if c == b':' {
            possible_ipv4 = false;
        } else if c == b'.' {
            possible_ipv6 = false;
            dots += 1;
            if dots > 3 {
                possible_ipv4 = false;
                break;
            }
        } else if (c >= b'A' && c <= b'F') || (c >= b'a' && c <= b'f') || c == b'%' {
            possible_ipv4 = false;
        } else if c < b'0' || c > b'9' {
            possible_ipv4 = false;
            possible_ipv6 = false;
            break;
        }
    }

    if possible_ipv4 && dots == 3 {
        if let Ok(addr) = s.parse::<Ipv4Addr>() {
            return Ok(IpAddr::V4(addr));
        }
    }

    if possible_ipv6 {
        if let Ok(addr) = s.parse::<Ipv6Addr>() {
            return Ok(IpAddr::V6(addr));
        }
    }

    Err(std::io::Error::new(
        std::io::ErrorKind::InvalidInput,
        format!("Failed to parse address: {}", s),
    ))
}

/// Parses `ip`, `ip:port` or `[ipv6]:port`, filling in `default_port` when
/// the string carries no port.
pub fn parse_socket_addr(s: &str, default_port: u16) -> std::io::Result<SocketAddr> {
    if let Some(rest) = s.strip_prefix('[') {
        // Bracketed IPv6, optionally with a port.
        let (addr_str, port) = match rest.find(']') {
            Some(i) => {
                let tail = &rest[i + 1..];
                let port = if tail.is_empty() {
                    default_port
                } else if let Some(p) = tail.strip_prefix(':') {
                    p.parse::<u16>().map_err(|_| {
                        std::io::Error::new(
                            std::io::ErrorKind::InvalidInput,
                            format!("Invalid port: {}", s),
                        )
                    })?
                } else {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::InvalidInput,
                        format!("Invalid socket address: {}", s),
                    ));
                };
                (&rest[..i], port)
            }
            None => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("Unterminated bracket: {}", s),
                ))
            }
        };
        let addr = parse_ip_addr(addr_str)?;
        if !addr.is_ipv6() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("Expected an IPv6 address: {}", s),
            ));
        }
        return Ok(SocketAddr::new(addr, port));
    }

    match s.rfind(':') {
        // A single ':' with digits after it can only be ipv4:port; more than
        // one ':' means the whole string is an IPv6 address.
        Some(i) if !s[..i].contains(':') => {
            let port = s[i + 1..].parse::<u16>().map_err(|_| {
                std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("Invalid port: {}", s),
                )
            })?;
            Ok(SocketAddr::new(parse_ip_addr(&s[..i])?, port))
        }
        _ => Ok(SocketAddr::new(parse_ip_addr(s)?, default_port)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ipv4() {
        assert_eq!(
            parse_ip_addr("192.0.2.1").unwrap(),
            IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1))
        );
        assert_eq!(
            parse_ip_addr("127.0.2.2").unwrap(),
            IpAddr::V4(Ipv4Addr::new(127, 0, 2, 2))
        );
    }

    #[test]
    fn test_parse_ipv6() {
        assert_eq!(
            parse_ip_addr("2001:db8::1").unwrap(),
            "2001:db8::1".parse::<Ipv6Addr>().unwrap()
        );
        assert_eq!(parse_ip_addr("::1").unwrap(), IpAddr::V6(Ipv6Addr::LOCALHOST));
    }

    #[test]
    fn test_reject_hostnames() {
        assert!(parse_ip_addr("dns.google").is_err());
        assert!(parse_ip_addr("invalid_addr").is_err());
        assert!(parse_ip_addr("").is_err());
        assert!(parse_ip_addr("192.0.2").is_err());
        assert!(parse_ip_addr("192.0.2.1.5").is_err());
        assert!(parse_ip_addr("1.1.1.one").is_err());
    }

    #[test]
    fn test_socket_addr_with_default_port() {
        assert_eq!(
            parse_socket_addr("192.0.2.1", 853).unwrap(),
            "192.0.2.1:853".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(
            parse_socket_addr("2001:db8::1", 853).unwrap(),
            "[2001:db8::1]:853".parse::<SocketAddr>().unwrap()
        );
    }

    #[test]
    fn test_socket_addr_explicit_port() {
        assert_eq!(
            parse_socket_addr("192.0.2.1:5353", 853).unwrap(),
            "192.0.2.1:5353".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(
            parse_socket_addr("[2001:db8::1]:5353", 853).unwrap(),
            "[2001:db8::1]:5353".parse::<SocketAddr>().unwrap()
        );
    }

    #[test]
    fn test_socket_addr_rejects_garbage() {
        assert!(parse_socket_addr("192.0.2.1:", 853).is_err());
        assert!(parse_socket_addr("[192.0.2.1]:853", 853).is_err());
        assert!(parse_socket_addr("[2001:db8::1", 853).is_err());
        assert!(parse_socket_addr("example.com:853", 853).is_err());
    }
}
