//! # Peer Addresses
//!
//! A peer is identified by its transport endpoint, written as
//! `scheme "://" host ":" port`. The serialized form is canonical: the
//! port is always explicit, so structural equality of two addresses is
//! exactly byte equality of their wire encoding.
//!
//! An address can additionally be *orchestrator-wrapped*. The wrapped
//! form marks the caller side of a protocol: it routes upward through
//! parent relays instead of through the dial-able endpoint, and it
//! displays as the underlying endpoint so that consumers see the
//! high-level source of a message rather than the hop that carried it.

use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs};
use std::str::FromStr;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

/// Default port applied when an `http` address omits one. `https`
/// addresses must always carry an explicit port.
const DEFAULT_HTTP_PORT: u16 = 80;

/// Transport scheme of an address. `https` connections require an
/// explicit port on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }
}

/// Canonical peer identity: endpoint plus the orchestrator marker.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address {
    scheme: Scheme,
    host: String,
    port: u16,
    orchestrator: bool,
}

impl Address {
    /// Builds a plain address from its parts.
    pub fn new(scheme: Scheme, host: impl Into<String>, port: u16) -> Self {
        Self {
            scheme,
            host: host.into(),
            port,
            orchestrator: false,
        }
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// True for the caller-side form that routing tables deliver
    /// upward instead of dialing.
    pub fn is_orchestrator(&self) -> bool {
        self.orchestrator
    }

    /// Returns the orchestrator-wrapped form of this address.
    pub fn wrap_orchestrator(&self) -> Self {
        Self {
            orchestrator: true,
            ..self.clone()
        }
    }

    /// Returns the plain endpoint underneath, dropping the marker.
    pub fn unwrap(&self) -> Self {
        Self {
            orchestrator: false,
            ..self.clone()
        }
    }

    /// Resolves the endpoint to a socket address for dialing.
    ///
    /// Orchestrator-wrapped addresses are not dial-able: they only
    /// exist as routing destinations that flow through parent relays.
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        if self.orchestrator {
            return Err(anyhow!("orchestrator address {} is not dialable", self));
        }

        let endpoint = format!("{}:{}", self.host, self.port);
        if let Ok(addr) = endpoint.parse::<SocketAddr>() {
            return Ok(addr);
        }

        endpoint
            .to_socket_addrs()
            .with_context(|| format!("failed to resolve {}", endpoint))?
            .next()
            .ok_or_else(|| anyhow!("no socket address for {}", endpoint))
    }
}

impl FromStr for Address {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (scheme, rest) = s
            .split_once("://")
            .with_context(|| format!("address {:?} is missing a scheme", s))?;

        let scheme = match scheme {
            "http" => Scheme::Http,
            "https" => Scheme::Https,
            other => return Err(anyhow!("unrecognized scheme {:?}", other)),
        };

        if rest.is_empty() {
            return Err(anyhow!("address {:?} has an empty endpoint", s));
        }

        // IPv6 hosts are bracketed, so the port separator is the last
        // colon after the closing bracket.
        let (host, port) = match rest.rfind(':') {
            Some(idx) if !rest[idx..].contains(']') => {
                let port = rest[idx + 1..]
                    .parse::<u16>()
                    .with_context(|| format!("invalid port in address {:?}", s))?;
                (&rest[..idx], port)
            }
            _ => match scheme {
                Scheme::Http => (rest, DEFAULT_HTTP_PORT),
                Scheme::Https => {
                    return Err(anyhow!("https address {:?} requires an explicit port", s));
                }
            },
        };

        if host.is_empty() {
            return Err(anyhow!("address {:?} has an empty host", s));
        }

        Ok(Address {
            scheme,
            host: host.to_string(),
            port,
            orchestrator: false,
        })
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // The orchestrator form intentionally prints as its underlying
        // endpoint: consumers should see where a message came from, not
        // the relay mechanics.
        write!(f, "{}://{}:{}", self.scheme.as_str(), self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_roundtrip() {
        let addr: Address = "http://127.0.0.1:2000".parse().unwrap();
        assert_eq!(addr.scheme(), Scheme::Http);
        assert_eq!(addr.host(), "127.0.0.1");
        assert_eq!(addr.port(), 2000);
        assert_eq!(addr.to_string(), "http://127.0.0.1:2000");
    }

    #[test]
    fn http_port_defaults() {
        let addr: Address = "http://example.com".parse().unwrap();
        assert_eq!(addr.port(), 80);
        assert_eq!(addr.to_string(), "http://example.com:80");
    }

    #[test]
    fn https_requires_port() {
        assert!("https://example.com".parse::<Address>().is_err());
        let addr: Address = "https://example.com:443".parse().unwrap();
        assert_eq!(addr.port(), 443);
    }

    #[test]
    fn rejects_malformed() {
        assert!("ftp://a:1".parse::<Address>().is_err());
        assert!("127.0.0.1:2000".parse::<Address>().is_err());
        assert!("http://".parse::<Address>().is_err());
        assert!("http://host:notaport".parse::<Address>().is_err());
    }

    #[test]
    fn ipv6_host() {
        let addr: Address = "http://[::1]:2000".parse().unwrap();
        assert_eq!(addr.host(), "[::1]");
        assert_eq!(addr.port(), 2000);
        assert!(addr.socket_addr().is_ok());
    }

    #[test]
    fn equality_is_canonical() {
        let a: Address = "http://127.0.0.1:80".parse().unwrap();
        let b: Address = "http://127.0.0.1".parse().unwrap();
        assert_eq!(a, b);

        let a_bytes = bincode::serialize(&a).unwrap();
        let b_bytes = bincode::serialize(&b).unwrap();
        assert_eq!(a_bytes, b_bytes);
    }

    #[test]
    fn orchestrator_wrap_is_distinct_but_displays_inner() {
        let plain: Address = "http://127.0.0.1:2000".parse().unwrap();
        let wrapped = plain.wrap_orchestrator();

        assert_ne!(plain, wrapped);
        assert!(wrapped.is_orchestrator());
        assert_eq!(wrapped.to_string(), plain.to_string());
        assert_eq!(wrapped.unwrap(), plain);
        assert!(wrapped.socket_addr().is_err());
    }
}
