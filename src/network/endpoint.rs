//! Endpoint description: where to connect or listen, and which IP families may be used.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

/// Allowed IP family (or families) for a socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum IpMode {
    #[serde(alias = "ipv4")]
    V4,
    #[serde(alias = "ipv6")]
    V6,
    #[default]
    Both,
}

impl IpMode {
    pub fn allows_v4(&self) -> bool {
        matches!(self, IpMode::V4 | IpMode::Both)
    }

    pub fn allows_v6(&self) -> bool {
        matches!(self, IpMode::V6 | IpMode::Both)
    }

    pub fn allows(&self, ip: &IpAddr) -> bool {
        match ip {
            IpAddr::V4(_) => self.allows_v4(),
            IpAddr::V6(_) => self.allows_v6(),
        }
    }
}

impl fmt::Display for IpMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IpMode::V4 => write!(f, "IPv4"),
            IpMode::V6 => write!(f, "IPv6"),
            IpMode::Both => write!(f, "IPv4/IPv6"),
        }
    }
}

/// A host (literal IP or DNS name), a port and the permitted families.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    host: String,
    port: u16,
    ip_mode: IpMode,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16, ip_mode: IpMode) -> Self {
        let host = host.into();
        // Bracketed IPv6 literals are accepted but stored bare
        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .map(str::to_string)
            .unwrap_or(host);
        Self {
            host,
            port,
            ip_mode,
        }
    }

    /// Endpoint for an already-known socket address; the mode pins its family.
    pub fn from_socket_addr(addr: SocketAddr) -> Self {
        let ip_mode = if addr.is_ipv4() {
            IpMode::V4
        } else {
            IpMode::V6
        };
        Self::new(addr.ip().to_string(), addr.port(), ip_mode)
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn ip_mode(&self) -> IpMode {
        self.ip_mode
    }

    /// The host parsed as a literal IP, if it is one.
    pub fn literal_ip(&self) -> Option<IpAddr> {
        self.host.parse().ok()
    }

    /// True when the endpoint can only ever be reached over IPv6.
    pub fn is_ipv6_only(&self) -> bool {
        match self.literal_ip() {
            Some(IpAddr::V6(v6)) => v6.to_ipv4_mapped().is_none(),
            Some(IpAddr::V4(_)) => false,
            None => self.ip_mode == IpMode::V6,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for Endpoint {
    type Err = String;

    /// Parses `host:port`, `[v6]:port` or a bare socket address.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(addr) = s.parse::<SocketAddr>() {
            return Ok(Self::new(addr.ip().to_string(), addr.port(), IpMode::Both));
        }
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| format!("Missing port in endpoint '{}'", s))?;
        let port = port
            .parse::<u16>()
            .map_err(|e| format!("Invalid port in endpoint '{}': {}", s, e))?;
        if host.is_empty() {
            return Err(format!("Missing host in endpoint '{}'", s));
        }
        Ok(Self::new(host, port, IpMode::Both))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_endpoints() {
        let ep: Endpoint = "203.0.113.5:24100".parse().unwrap();
        assert_eq!(ep.host(), "203.0.113.5");
        assert_eq!(ep.port(), 24100);
        assert!(!ep.is_ipv6_only());

        let ep: Endpoint = "[2001:db8::1]:24100".parse().unwrap();
        assert_eq!(ep.host(), "2001:db8::1");
        assert!(ep.is_ipv6_only());
        assert_eq!(ep.to_string(), "[2001:db8::1]:24100");

        let ep: Endpoint = "seed.example.org:24100".parse().unwrap();
        assert!(ep.literal_ip().is_none());

        assert!("no-port".parse::<Endpoint>().is_err());
        assert!(":24100".parse::<Endpoint>().is_err());
    }

    #[test]
    fn test_ipv4_mapped_is_not_ipv6_only() {
        let ep = Endpoint::new("::ffff:192.0.2.1", 1, IpMode::Both);
        assert!(!ep.is_ipv6_only());
    }

    #[test]
    fn test_ip_mode_allows() {
        let v4: IpAddr = "192.0.2.1".parse().unwrap();
        let v6: IpAddr = "2001:db8::1".parse().unwrap();
        assert!(IpMode::V4.allows(&v4) && !IpMode::V4.allows(&v6));
        assert!(IpMode::V6.allows(&v6) && !IpMode::V6.allows(&v4));
        assert!(IpMode::Both.allows(&v4) && IpMode::Both.allows(&v6));
    }
}
