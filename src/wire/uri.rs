//! Acceptor URI grammar, ordering, and the registry-side wildcard
//! transformation (§6).
//!
//! Grammar: `scheme "://" host [ ":" port ] [ "/" path ]`. Accepted schemes
//! are `silkit` (default port 8500), `tcp`, `local`. IPv6 hosts MUST be
//! bracketed. A `local` URI's authority is empty; its path is the absolute
//! socket file path.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use crate::error::{Error, ErrorKind, Result};

const DEFAULT_SILKIT_PORT: u16 = 8500;

#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub enum AcceptorUri {
    /// `local://<path>`: an OS local-domain (Unix) socket.
    Local { path: String },
    /// `tcp://<host>:<port>` or `silkit://<host>:<port>`.
    Tcp { host: Host, port: u16 },
}

#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub enum Host {
    V4(Ipv4Addr),
    V6(Ipv6Addr),
    Name(String),
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Host::V4(ip) => write!(f, "{}", ip),
            Host::V6(ip) => write!(f, "[{}]", ip),
            Host::Name(n) => write!(f, "{}", n),
        }
    }
}

impl Host {
    fn is_wildcard(&self) -> bool {
        match self {
            Host::V4(ip) => ip.is_unspecified(),
            Host::V6(ip) => ip.is_unspecified(),
            Host::Name(_) => false,
        }
    }

    fn is_loopback(&self) -> bool {
        match self {
            Host::V4(ip) => ip.is_loopback(),
            Host::V6(ip) => ip.is_loopback(),
            Host::Name(n) => n == "localhost",
        }
    }
}

impl fmt::Display for AcceptorUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AcceptorUri::Local { path } => write!(f, "local://{}", path),
            AcceptorUri::Tcp { host, port } => write!(f, "tcp://{}:{}", host, port),
        }
    }
}

impl AcceptorUri {
    pub fn from_socket_addr(addr: SocketAddr) -> Self {
        let host = match addr.ip() {
            IpAddr::V4(ip) => Host::V4(ip),
            IpAddr::V6(ip) => Host::V6(ip),
        };
        AcceptorUri::Tcp { host, port: addr.port() }
    }

    pub fn local(path: impl Into<String>) -> Self {
        AcceptorUri::Local { path: path.into() }
    }

    /// Parses a URI of the grammar `scheme "://" host [ ":" port ] [ "/" path ]`.
    pub fn parse(s: &str) -> Result<Self> {
        let bad = || Error::msg(ErrorKind::Configuration, format!("malformed acceptor URI: {}", s));

        let (scheme, rest) = s.split_once("://").ok_or_else(bad)?;
        match scheme {
            "local" => Ok(AcceptorUri::Local { path: rest.to_string() }),
            "tcp" | "silkit" => {
                let default_port = if scheme == "silkit" { DEFAULT_SILKIT_PORT } else { 0 };
                let (authority, _path) = rest.split_once('/').unwrap_or((rest, ""));

                if let Some(bracket_end) = authority.strip_prefix('[') {
                    let (v6, port_part) = bracket_end.split_once(']').ok_or_else(bad)?;
                    let host = v6.parse::<Ipv6Addr>().map_err(|_| bad())?;
                    let port = match port_part.strip_prefix(':') {
                        Some(p) => p.parse::<u16>().map_err(|_| bad())?,
                        None if default_port != 0 => default_port,
                        None => return Err(bad()),
                    };
                    return Ok(AcceptorUri::Tcp { host: Host::V6(host), port });
                }

                let (host_part, port) = match authority.rsplit_once(':') {
                    Some((h, p)) => (h, p.parse::<u16>().map_err(|_| bad())?),
                    None if default_port != 0 => (authority, default_port),
                    None => return Err(bad()),
                };
                let host = if let Ok(v4) = host_part.parse::<Ipv4Addr>() {
                    Host::V4(v4)
                } else {
                    Host::Name(host_part.to_string())
                };
                Ok(AcceptorUri::Tcp { host, port })
            }
            _ => Err(bad()),
        }
    }

    fn rank(&self, audience_is_local: bool) -> u8 {
        match self {
            AcceptorUri::Local { .. } => 0,
            AcceptorUri::Tcp { host, .. } if host.is_loopback() => {
                if audience_is_local {
                    1
                } else {
                    2
                }
            }
            AcceptorUri::Tcp { .. } => {
                if audience_is_local {
                    2
                } else {
                    1
                }
            }
        }
    }
}

/// Orders `uris` in place: local-domain first; then loopback before
/// routable addresses if `audience_is_local` (the audience connected via
/// local-domain or loopback), otherwise routable before loopback.
pub fn order_for_audience(uris: &mut Vec<AcceptorUri>, audience_is_local: bool) {
    uris.sort_by_key(|u| u.rank(audience_is_local));
}

/// Orders `uris` in place using the connect-attempt order: local-domain
/// first, then loopback TCP, then routable TCP (§4.3 direct connect).
pub fn order_for_connect_attempts(uris: &mut Vec<AcceptorUri>) {
    order_for_audience(uris, true);
}

/// Drops wildcard-host URIs, replacing each with a concrete address derived
/// from the remote address the advertised peer used to dial the registry,
/// preserving the advertised port.
///
/// `advertiser_remote` is the socket address the registry observed when the
/// advertised peer connected to it; `audience_local` is the local address
/// the audience peer used for its own registry connection, used only to
/// classify the audience as local vs. remote for ordering purposes.
pub fn transform_for_audience(
    uris: &[AcceptorUri],
    advertiser_remote: SocketAddr,
    audience_local: SocketAddr,
) -> Vec<AcceptorUri> {
    let audience_is_local = audience_local.ip().is_loopback();

    let mut out: Vec<AcceptorUri> = uris
        .iter()
        .map(|u| match u {
            AcceptorUri::Tcp { host, port } if host.is_wildcard() => {
                AcceptorUri::Tcp { host: concrete_host(advertiser_remote), port: *port }
            }
            other => other.clone(),
        })
        .collect();

    order_for_audience(&mut out, audience_is_local);
    out
}

fn concrete_host(addr: SocketAddr) -> Host {
    match addr.ip() {
        IpAddr::V4(ip) => Host::V4(ip),
        IpAddr::V6(ip) => Host::V6(ip),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_local() {
        let uri = AcceptorUri::parse("local:///tmp/sock").unwrap();
        assert_eq!(uri, AcceptorUri::Local { path: "/tmp/sock".into() });
    }

    #[test]
    fn parses_tcp_v4() {
        let uri = AcceptorUri::parse("tcp://127.0.0.1:7500").unwrap();
        assert_eq!(
            uri,
            AcceptorUri::Tcp { host: Host::V4("127.0.0.1".parse().unwrap()), port: 7500 }
        );
    }

    #[test]
    fn parses_tcp_v6_bracketed() {
        let uri = AcceptorUri::parse("tcp://[::1]:7500").unwrap();
        assert_eq!(
            uri,
            AcceptorUri::Tcp { host: Host::V6("::1".parse().unwrap()), port: 7500 }
        );
    }

    #[test]
    fn silkit_scheme_defaults_port() {
        let uri = AcceptorUri::parse("silkit://registry.local").unwrap();
        assert_eq!(
            uri,
            AcceptorUri::Tcp { host: Host::Name("registry.local".into()), port: DEFAULT_SILKIT_PORT }
        );
    }

    #[test]
    fn rejects_bad_scheme() {
        assert!(AcceptorUri::parse("ftp://host:1").is_err());
    }

    #[test]
    fn ordering_puts_local_first() {
        let mut uris = vec![
            AcceptorUri::parse("tcp://10.0.0.2:1").unwrap(),
            AcceptorUri::parse("local:///tmp/a").unwrap(),
            AcceptorUri::parse("tcp://127.0.0.1:1").unwrap(),
        ];
        order_for_connect_attempts(&mut uris);
        assert!(matches!(uris[0], AcceptorUri::Local { .. }));
    }

    #[test]
    fn wildcard_is_replaced() {
        let uris = vec![AcceptorUri::Tcp { host: Host::V4(Ipv4Addr::UNSPECIFIED), port: 9 }];
        let remote: SocketAddr = "203.0.113.9:55000".parse().unwrap();
        let local: SocketAddr = "203.0.113.1:1234".parse().unwrap();
        let out = transform_for_audience(&uris, remote, local);
        assert_eq!(out, vec![AcceptorUri::Tcp { host: Host::V4("203.0.113.9".parse().unwrap()), port: 9 }]);
    }
}
