//! Family-agnostic peer addresses.
//!
//! A benchmark target is an IPv4 or IPv6 socket address or a UNIX-domain
//! path. Multicast classification is per family; UNIX is never multicast.
//! Hostname resolution goes through the system resolver (getaddrinfo), and
//! absolute filesystem paths take precedence over network resolution.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4, SocketAddrV6, ToSocketAddrs};
use std::path::PathBuf;

use socket2::SockAddr;

use crate::error::{PulseError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SockKind {
    Dgram,
    Stream,
}

/// A resolved peer. Equality and hashing are value-based on the derived enum,
/// so no sockaddr padding ever participates.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PeerAddr {
    V4(SocketAddrV4),
    V6(SocketAddrV6),
    Unix(PathBuf),
}

impl PeerAddr {
    pub fn from_socket_addr(sa: SocketAddr) -> Self {
        match sa {
            SocketAddr::V4(a) => PeerAddr::V4(a),
            SocketAddr::V6(a) => PeerAddr::V6(a),
        }
    }

    pub fn ip(&self) -> Option<IpAddr> {
        match self {
            PeerAddr::V4(a) => Some(IpAddr::V4(*a.ip())),
            PeerAddr::V6(a) => Some(IpAddr::V6(*a.ip())),
            PeerAddr::Unix(_) => None,
        }
    }

    pub fn port(&self) -> Option<u16> {
        match self {
            PeerAddr::V4(a) => Some(a.port()),
            PeerAddr::V6(a) => Some(a.port()),
            PeerAddr::Unix(_) => None,
        }
    }

    pub fn set_port(&mut self, port: u16) {
        match self {
            PeerAddr::V4(a) => a.set_port(port),
            PeerAddr::V6(a) => a.set_port(port),
            PeerAddr::Unix(_) => {}
        }
    }

    /// IN_MULTICAST / IN6_IS_ADDR_MULTICAST; UNIX paths are never multicast.
    pub fn is_multicast(&self) -> bool {
        match self {
            PeerAddr::V4(a) => a.ip().is_multicast(),
            PeerAddr::V6(a) => a.ip().is_multicast(),
            PeerAddr::Unix(_) => false,
        }
    }

    pub fn is_unix(&self) -> bool {
        matches!(self, PeerAddr::Unix(_))
    }

    pub fn to_sock_addr(&self) -> Result<SockAddr> {
        match self {
            PeerAddr::V4(a) => Ok(SockAddr::from(*a)),
            PeerAddr::V6(a) => Ok(SockAddr::from(*a)),
            PeerAddr::Unix(p) => SockAddr::unix(p)
                .map_err(|e| PulseError::socket_err(format!("unix path {}", p.display()), e)),
        }
    }

    pub fn from_sock_addr(sa: &SockAddr) -> Option<PeerAddr> {
        if let Some(std_addr) = sa.as_socket() {
            return Some(PeerAddr::from_socket_addr(std_addr));
        }
        if sa.domain() == socket2::Domain::UNIX {
            // Unnamed/abstract peers come back as an empty path.
            let path = sa.as_pathname().map(PathBuf::from).unwrap_or_default();
            return Some(PeerAddr::Unix(path));
        }
        None
    }
}

impl std::fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerAddr::V4(a) => write!(f, "{}", a),
            PeerAddr::V6(a) => write!(f, "{}", a),
            PeerAddr::Unix(p) => write!(f, "{}", p.display()),
        }
    }
}

/// Interface selector for multicast RX/TX: IPv4 by address, IPv6 by index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum McIface {
    V4(Ipv4Addr),
    V6Index(u32),
}

/// Absolute POSIX paths (or drive-letter paths on Windows) denote UNIX-domain
/// sockets and take precedence over hostname resolution.
pub fn is_unix_path(s: &str) -> bool {
    #[cfg(windows)]
    {
        let b = s.as_bytes();
        return b.len() >= 3 && b[0].is_ascii_alphabetic() && b[1] == b':' && (b[2] == b'\\' || b[2] == b'/');
    }
    #[cfg(not(windows))]
    s.starts_with('/')
}

/// Resolve `host` to a peer. IPv6 is preferred when both families resolve.
pub fn resolve_host(host: &str, port: u16) -> Result<PeerAddr> {
    if is_unix_path(host) {
        return Ok(PeerAddr::Unix(PathBuf::from(host)));
    }
    let addrs: Vec<SocketAddr> = (host, port)
        .to_socket_addrs()
        .map_err(|e| PulseError::NotExist(format!("cannot resolve '{}': {}", host, e)))?
        .collect();
    addrs
        .iter()
        .find(|a| a.is_ipv6())
        .or_else(|| addrs.first())
        .map(|a| PeerAddr::from_socket_addr(*a))
        .ok_or_else(|| PulseError::NotExist(format!("'{}' resolved to no addresses", host)))
}

// ---------------------------------------------------------------------------
// Socket specs
// ---------------------------------------------------------------------------

/// One target parsed from the command line or a feedfile line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedEntry {
    pub kind: SockKind,
    pub addr: PeerAddr,
    /// Source filter for source-specific multicast membership.
    pub mc_source: Option<IpAddr>,
}

/// One socket to create, possibly carrying extra multicast memberships that
/// were folded onto it.
#[derive(Debug, Clone)]
pub struct SocketSpec {
    pub kind: SockKind,
    pub addr: PeerAddr,
    pub mc_source: Option<IpAddr>,
    pub memberships: Vec<(PeerAddr, Option<IpAddr>)>,
}

impl SocketSpec {
    pub fn new(kind: SockKind, addr: PeerAddr) -> Self {
        SocketSpec { kind, addr, mc_source: None, memberships: Vec::new() }
    }
}

fn family_key(addr: &PeerAddr) -> u8 {
    match addr {
        PeerAddr::V4(_) => 4,
        PeerAddr::V6(_) => 6,
        PeerAddr::Unix(_) => 0,
    }
}

/// Fold feed entries into socket specs. Duplicate `(proto, family, port)`
/// triples join the first matching socket as extra multicast memberships when
/// both sides are multicast groups; non-multicast duplicates are ignored.
pub fn group_entries(entries: Vec<FeedEntry>) -> Vec<SocketSpec> {
    let mut specs: Vec<SocketSpec> = Vec::new();
    'next: for e in entries {
        for spec in specs.iter_mut() {
            let same_triple = spec.kind == e.kind
                && family_key(&spec.addr) == family_key(&e.addr)
                && spec.addr.port() == e.addr.port();
            if !same_triple {
                continue;
            }
            if spec.addr == e.addr {
                continue 'next; // exact duplicate
            }
            if spec.addr.is_multicast() && e.addr.is_multicast() {
                if !spec.memberships.iter().any(|(a, _)| *a == e.addr) {
                    spec.memberships.push((e.addr, e.mc_source));
                }
                continue 'next;
            }
        }
        let mut spec = SocketSpec::new(e.kind, e.addr);
        spec.mc_source = e.mc_source;
        specs.push(spec);
    }
    specs
}
