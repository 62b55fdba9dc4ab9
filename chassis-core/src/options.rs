//! Socket configuration options
//!
//! Two views on the same configuration: [`SocketOptions`] is the builder used
//! when a socket is created, [`SocketOption`]/[`OptionValue`] are the dynamic
//! keys and values behind `getsockopt`/`setsockopt`.

use std::fmt;
use std::io;
use std::time::Duration;

use bytes::Bytes;

use crate::error::native;

/// Socket configuration options.
///
/// # Examples
///
/// ```
/// use chassis_core::options::SocketOptions;
///
/// let opts = SocketOptions::default()
///     .with_send_hwm(16)
///     .with_recv_hwm(16);
/// assert_eq!(opts.send_hwm, 16);
/// ```
#[derive(Debug, Clone)]
pub struct SocketOptions {
    /// High water mark for sending (messages per peer pipe)
    ///
    /// When every pipe is full, load-balancing patterns report would-block and
    /// broadcasting patterns drop.
    /// - Default: 1000 messages
    pub send_hwm: usize,

    /// High water mark for receiving (messages)
    /// - Default: 1000 messages
    pub recv_hwm: usize,

    /// Routing id announced to ROUTER peers on connect.
    ///
    /// If None, the peer assigns `0x00` followed by a counter.
    pub routing_id: Option<Bytes>,

    /// Linger period reported through `getsockopt(Linger)`
    /// - `None`: infinite (-1)
    pub linger: Option<Duration>,

    /// ROUTER mandatory mode
    ///
    /// - `false` (default): silently drop messages to unknown peers
    /// - `true`: report `EHOSTUNREACH` instead
    pub router_mandatory: bool,
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self {
            send_hwm: 1000,
            recv_hwm: 1000,
            routing_id: None,
            linger: None,
            router_mandatory: false,
        }
    }
}

impl SocketOptions {
    /// Create new socket options with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the send high water mark (0 is treated as 1).
    pub fn with_send_hwm(mut self, hwm: usize) -> Self {
        self.send_hwm = hwm.max(1);
        self
    }

    /// Set the receive high water mark (0 is treated as 1).
    pub fn with_recv_hwm(mut self, hwm: usize) -> Self {
        self.recv_hwm = hwm.max(1);
        self
    }

    /// Set the routing id.
    pub fn with_routing_id(mut self, id: Bytes) -> Self {
        self.routing_id = Some(id);
        self
    }

    /// Set the linger period.
    pub fn with_linger(mut self, linger: Option<Duration>) -> Self {
        self.linger = linger;
        self
    }

    /// Enable or disable ROUTER mandatory mode.
    pub fn with_router_mandatory(mut self, enabled: bool) -> Self {
        self.router_mandatory = enabled;
        self
    }

    /// Validate a caller-chosen routing id.
    ///
    /// Identities must be 1-255 bytes long and must not start with a null
    /// byte, which is reserved for auto-generated ids.
    pub fn validate_routing_id(id: &[u8]) -> io::Result<()> {
        if id.is_empty() || id.len() > 255 || id[0] == 0x00 {
            return Err(native(libc::EINVAL));
        }
        Ok(())
    }
}

/// Option keys understood by `getsockopt`/`setsockopt`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocketOption {
    /// Socket type (read-only, integer)
    Type,
    /// Last bound endpoint with wildcards resolved (read-only, string)
    LastEndpoint,
    /// Send high water mark (integer)
    SendHwm,
    /// Receive high water mark (integer)
    RecvHwm,
    /// Routing id (bytes)
    RoutingId,
    /// Linger in milliseconds, -1 for infinite (integer)
    Linger,
    /// ROUTER mandatory mode (integer 0/1)
    RouterMandatory,
    /// Add a prefix filter (SUB only, write-only, bytes)
    Subscribe,
    /// Remove a prefix filter (SUB only, write-only, bytes)
    Unsubscribe,
    /// Current readiness flags (read-only, integer)
    Events,
    /// Readiness notification descriptor (read-only, integer)
    Fd,
}

impl SocketOption {
    /// Whether the option accepts `setsockopt`.
    #[must_use]
    pub const fn is_writable(self) -> bool {
        matches!(
            self,
            Self::SendHwm
                | Self::RecvHwm
                | Self::RoutingId
                | Self::Linger
                | Self::RouterMandatory
                | Self::Subscribe
                | Self::Unsubscribe
        )
    }

    /// Whether the option answers `getsockopt`.
    #[must_use]
    pub const fn is_readable(self) -> bool {
        !matches!(self, Self::Subscribe | Self::Unsubscribe)
    }
}

/// Dynamically typed option value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptionValue {
    Int(i64),
    Bytes(Bytes),
    Str(String),
}

impl OptionValue {
    /// Integer payload, or `EINVAL`.
    pub fn as_int(&self) -> io::Result<i64> {
        match self {
            Self::Int(v) => Ok(*v),
            _ => Err(native(libc::EINVAL)),
        }
    }

    /// Byte payload (strings are taken as their UTF-8 bytes), or `EINVAL`.
    pub fn as_bytes(&self) -> io::Result<Bytes> {
        match self {
            Self::Bytes(b) => Ok(b.clone()),
            Self::Str(s) => Ok(Bytes::copy_from_slice(s.as_bytes())),
            Self::Int(_) => Err(native(libc::EINVAL)),
        }
    }

    /// String payload, or `EINVAL`.
    pub fn as_str(&self) -> io::Result<&str> {
        match self {
            Self::Str(s) => Ok(s),
            _ => Err(native(libc::EINVAL)),
        }
    }
}

impl From<i64> for OptionValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<Bytes> for OptionValue {
    fn from(v: Bytes) -> Self {
        Self::Bytes(v)
    }
}

impl From<&'static [u8]> for OptionValue {
    fn from(v: &'static [u8]) -> Self {
        Self::Bytes(Bytes::from_static(v))
    }
}

impl From<String> for OptionValue {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

impl From<&str> for OptionValue {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}

impl fmt::Display for OptionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v}"),
            Self::Bytes(b) => write!(f, "{b:?}"),
            Self::Str(s) => write!(f, "{s}"),
        }
    }
}
