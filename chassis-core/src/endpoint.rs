//! Endpoint abstraction for transport-agnostic socket addressing.
//!
//! Endpoints use the `transport://address` form. The transport token selects
//! the delivery mechanism (in-process, inter-process file, reliable unicast,
//! reliable multicast) and the address part is mechanism specific.

use std::fmt;
use std::net::IpAddr;
use std::path::PathBuf;
use std::str::FromStr;

/// Host part of a `tcp://` endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Host {
    /// `*`: every interface (bind only)
    Wildcard,
    /// Literal IPv4 or IPv6 address
    Addr(IpAddr),
    /// Anything else: an interface or DNS name that still needs resolving
    Name(String),
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Wildcard => write!(f, "*"),
            Self::Addr(IpAddr::V6(addr)) => write!(f, "[{addr}]"),
            Self::Addr(addr) => write!(f, "{addr}"),
            Self::Name(name) => write!(f, "{name}"),
        }
    }
}

/// Port part of a `tcp://` endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Port {
    /// `*` or `0`: pick an ephemeral port at bind time
    Wildcard,
    /// Explicit port number
    Number(u16),
}

impl fmt::Display for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Wildcard => write!(f, "*"),
            Self::Number(n) => write!(f, "{n}"),
        }
    }
}

/// Transport endpoint address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Endpoint {
    /// Reliable unicast: `tcp://host:port`
    Tcp { host: Host, port: Port },
    /// Inter-process file: `ipc:///path/to/socket`
    Ipc(PathBuf),
    /// In-process: `inproc://name`
    Inproc(String),
    /// Reliable multicast: `pgm://interface;group:port`
    Pgm(String),
    /// Encapsulated reliable multicast: `epgm://interface;group:port`
    Epgm(String),
}

impl Endpoint {
    /// Parse an endpoint from a string.
    ///
    /// Supported formats:
    /// - `tcp://127.0.0.1:5555`, `tcp://[::1]:5555`, `tcp://*:*`
    /// - `ipc:///tmp/socket.sock`
    /// - `inproc://name`
    /// - `pgm://eth0;239.192.1.1:5555`, `epgm://...`
    ///
    /// # Examples
    ///
    /// ```
    /// use chassis_core::endpoint::Endpoint;
    ///
    /// let endpoint = Endpoint::parse("tcp://127.0.0.1:5555").unwrap();
    /// assert!(endpoint.is_tcp());
    ///
    /// let endpoint = Endpoint::parse("tcp://127.0.0.1:*").unwrap();
    /// assert!(endpoint.is_wildcard());
    ///
    /// let endpoint = Endpoint::parse("inproc://my-endpoint").unwrap();
    /// assert!(matches!(endpoint, Endpoint::Inproc(_)));
    /// ```
    pub fn parse(s: &str) -> Result<Self, EndpointError> {
        s.parse()
    }

    /// Returns true if this is a TCP endpoint.
    pub fn is_tcp(&self) -> bool {
        matches!(self, Endpoint::Tcp { .. })
    }

    /// Returns true if this is an inproc endpoint.
    pub fn is_inproc(&self) -> bool {
        matches!(self, Endpoint::Inproc(_))
    }

    /// Returns true if this is a multicast endpoint.
    pub fn is_multicast(&self) -> bool {
        matches!(self, Endpoint::Pgm(_) | Endpoint::Epgm(_))
    }

    /// Returns true if binding must resolve part of the address.
    pub fn is_wildcard(&self) -> bool {
        match self {
            Endpoint::Tcp { host, port } => {
                *host == Host::Wildcard || *port == Port::Wildcard
            }
            _ => false,
        }
    }

    /// Check that the endpoint can be connected to without name resolution.
    ///
    /// Unicast endpoints must carry a literal IPv4/IPv6 address: host names
    /// are rejected so that callers resolve them on their own terms.
    pub fn check_connectable(&self) -> Result<(), EndpointError> {
        match self {
            Endpoint::Tcp { host, .. } => match host {
                Host::Addr(_) => Ok(()),
                other => Err(EndpointError::UnresolvedHost(other.to_string())),
            },
            _ => Ok(()),
        }
    }
}

fn parse_tcp(addr: &str) -> Result<Endpoint, EndpointError> {
    let invalid = || EndpointError::InvalidTcpAddress(addr.to_string());
    let (host, port) = addr.rsplit_once(':').ok_or_else(invalid)?;
    if host.is_empty() {
        return Err(invalid());
    }

    let port = match port {
        "*" | "0" => Port::Wildcard,
        digits => Port::Number(digits.parse::<u16>().map_err(|_| invalid())?),
    };

    let host = if host == "*" {
        Host::Wildcard
    } else if let Some(v6) = host.strip_prefix('[').and_then(|h| h.strip_suffix(']')) {
        Host::Addr(v6.parse::<IpAddr>().map_err(|_| invalid())?)
    } else if let Ok(ip) = host.parse::<IpAddr>() {
        Host::Addr(ip)
    } else {
        Host::Name(host.to_string())
    };

    Ok(Endpoint::Tcp { host, port })
}

impl FromStr for Endpoint {
    type Err = EndpointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(addr) = s.strip_prefix("tcp://") {
            parse_tcp(addr)
        } else if let Some(path) = s.strip_prefix("ipc://") {
            if path.is_empty() {
                Err(EndpointError::InvalidIpcPath(s.to_string()))
            } else {
                Ok(Endpoint::Ipc(PathBuf::from(path)))
            }
        } else if let Some(name) = s.strip_prefix("inproc://") {
            if name.is_empty() {
                Err(EndpointError::InvalidInprocName(
                    "inproc name cannot be empty".to_string(),
                ))
            } else {
                Ok(Endpoint::Inproc(name.to_string()))
            }
        } else if let Some(addr) = s.strip_prefix("pgm://") {
            Ok(Endpoint::Pgm(addr.to_string()))
        } else if let Some(addr) = s.strip_prefix("epgm://") {
            Ok(Endpoint::Epgm(addr.to_string()))
        } else {
            Err(EndpointError::InvalidScheme(s.to_string()))
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Tcp { host, port } => write!(f, "tcp://{host}:{port}"),
            Endpoint::Ipc(path) => write!(f, "ipc://{}", path.display()),
            Endpoint::Inproc(name) => write!(f, "inproc://{name}"),
            Endpoint::Pgm(addr) => write!(f, "pgm://{addr}"),
            Endpoint::Epgm(addr) => write!(f, "epgm://{addr}"),
        }
    }
}

/// Errors that can occur when parsing or using endpoints.
#[derive(Debug, thiserror::Error)]
pub enum EndpointError {
    #[error("Invalid scheme in endpoint: {0} (expected tcp://, ipc://, inproc://, pgm:// or epgm://)")]
    InvalidScheme(String),

    #[error("Invalid TCP address: {0}")]
    InvalidTcpAddress(String),

    #[error("Invalid inproc name: {0}")]
    InvalidInprocName(String),

    #[error("Invalid IPC path: {0}")]
    InvalidIpcPath(String),

    #[error("{0} is not a literal IPv4 or IPv6 address; resolve host names before connecting")]
    UnresolvedHost(String),
}
