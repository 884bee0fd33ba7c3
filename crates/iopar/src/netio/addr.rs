//! Netio addresses.
//!
//! ```text
//! /run/lights.sock      Unix path
//! @lights               Unix abstract name
//! 10.0.0.2:6060         UDP over IPv4
//! [fe80::1]:6060        UDP over IPv6
//! ```
//!
//! Anything from the first `#` or `?` on is an anchor and is cut before
//! resolution. An empty Unix name means `@netio-<pid>`.

use core::fmt;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;

use crate::error::{IoError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Family {
    Unix,
    Inet,
    Inet6,
}

impl Family {
    /// Family selected by a spec or bind prefix.
    pub(crate) fn from_prefix(prefix: &str) -> Option<Self> {
        match prefix {
            "unix" => Some(Self::Unix),
            "udp" | "udp4" => Some(Self::Inet),
            "udp6" => Some(Self::Inet6),
            _ => None,
        }
    }

    /// Guess the family from the shape of an address.
    fn detect(addr: &str) -> Option<Self> {
        if addr.starts_with('@') || addr.contains('/') {
            Some(Self::Unix)
        } else if addr.starts_with('[') {
            Some(Self::Inet6)
        } else if addr.contains('.') {
            Some(Self::Inet)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) enum UnixName {
    Path(PathBuf),
    Abstract(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) enum PeerAddr {
    Unix(UnixName),
    Inet(SocketAddr),
}

impl PeerAddr {
    pub(crate) fn family(&self) -> Family {
        match self {
            Self::Unix(_) => Family::Unix,
            Self::Inet(SocketAddr::V4(_)) => Family::Inet,
            Self::Inet(SocketAddr::V6(_)) => Family::Inet6,
        }
    }

    /// Default name of the subscribing Unix socket of process `pid`.
    pub(crate) fn autobind_unix(pid: u32, attempt: u32) -> Self {
        let name = if attempt == 0 {
            format!("netio-{pid}")
        } else {
            format!("netio-{pid}-{attempt}")
        };
        Self::Unix(UnixName::Abstract(name.into_bytes()))
    }
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unix(UnixName::Path(path)) => write!(f, "{}", path.display()),
            Self::Unix(UnixName::Abstract(name)) => {
                write!(f, "@{}", String::from_utf8_lossy(name))
            }
            Self::Inet(addr) => write!(f, "{addr}"),
        }
    }
}

/// Cut the anchor (`#...` or `?...`).
pub(crate) fn strip_anchor(uri: &str) -> &str {
    uri.find(['#', '?']).map_or(uri, |at| &uri[..at])
}

/// Resolve `uri` for `family`, or for the detected family when `None`.
pub(crate) fn parse_uri(uri: &str, family: Option<Family>, pid: u32) -> Result<PeerAddr> {
    let addr = strip_anchor(uri);
    let family = family
        .or_else(|| Family::detect(addr))
        .ok_or_else(|| IoError::address(uri, "cannot tell the address family"))?;
    match family {
        Family::Unix => Ok(PeerAddr::Unix(unix_name(addr, pid))),
        Family::Inet | Family::Inet6 => resolve_inet(uri, addr, family),
    }
}

fn unix_name(addr: &str, pid: u32) -> UnixName {
    if addr.is_empty() {
        return UnixName::Abstract(format!("netio-{pid}").into_bytes());
    }
    match addr.strip_prefix('@') {
        Some(name) => UnixName::Abstract(name.as_bytes().to_vec()),
        None => UnixName::Path(PathBuf::from(addr)),
    }
}

fn resolve_inet(uri: &str, addr: &str, family: Family) -> Result<PeerAddr> {
    // `[v6]` without a port and `host` without a port mean port 0.
    let with_port = if addr.starts_with('[') {
        match addr.rfind(']') {
            Some(end) if addr[end + 1..].starts_with(':') => addr.to_owned(),
            Some(_) => format!("{addr}:0"),
            None => return Err(IoError::address(uri, "unterminated `[`")),
        }
    } else if addr.contains(':') {
        addr.to_owned()
    } else {
        format!("{addr}:0")
    };
    let candidates = with_port
        .to_socket_addrs()
        .map_err(|err| IoError::address(uri, err.to_string()))?;
    candidates
        .into_iter()
        .find(|candidate| match family {
            Family::Inet => candidate.is_ipv4(),
            _ => candidate.is_ipv6(),
        })
        .map(PeerAddr::Inet)
        .ok_or_else(|| IoError::address(uri, "no address of the requested family"))
}
