//! Messaging-pattern types of message-queue sockets.
//!
//! The numeric values follow the usual message-queue `TYPE` option numbering
//! so that `getsockopt(Type)` reports familiar codes.

use std::fmt;

/// Messaging pattern of a socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SocketType {
    /// Exclusive bidirectional peer
    Pair = 0,

    /// Broadcasting side of publish-subscribe
    Pub = 1,

    /// Filtering side of publish-subscribe
    Sub = 2,

    /// Asynchronous requester (load-balances outbound, fair-queues inbound)
    Dealer = 5,

    /// Identity-routing replier
    Router = 6,

    /// Receiving side of a pipeline
    Pull = 7,

    /// Sending side of a pipeline
    Push = 8,
}

impl SocketType {
    /// Get the socket type as a string name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pair => "PAIR",
            Self::Pub => "PUB",
            Self::Sub => "SUB",
            Self::Dealer => "DEALER",
            Self::Router => "ROUTER",
            Self::Pull => "PULL",
            Self::Push => "PUSH",
        }
    }

    /// Convert a raw `TYPE` option value back into a socket type.
    #[must_use]
    pub const fn from_raw(raw: i64) -> Option<Self> {
        match raw {
            0 => Some(Self::Pair),
            1 => Some(Self::Pub),
            2 => Some(Self::Sub),
            5 => Some(Self::Dealer),
            6 => Some(Self::Router),
            7 => Some(Self::Pull),
            8 => Some(Self::Push),
            _ => None,
        }
    }

    /// Raw `TYPE` option value.
    #[must_use]
    pub const fn as_raw(self) -> i64 {
        self as i64
    }

    /// Whether `send_multipart` is meaningful for this pattern.
    #[must_use]
    pub const fn can_send(self) -> bool {
        !matches!(self, Self::Sub | Self::Pull)
    }

    /// Whether `recv_multipart` is meaningful for this pattern.
    #[must_use]
    pub const fn can_recv(self) -> bool {
        !matches!(self, Self::Pub | Self::Push)
    }

    /// Check if this socket type is compatible with the given peer type.
    pub fn is_compatible(&self, peer: SocketType) -> bool {
        matches!(
            (self, peer),
            (Self::Pair, Self::Pair)
                | (Self::Pub, Self::Sub)
                | (Self::Sub, Self::Pub)
                | (Self::Dealer, Self::Router)
                | (Self::Router, Self::Dealer)
                | (Self::Dealer, Self::Dealer)
                | (Self::Router, Self::Router)
                | (Self::Push, Self::Pull)
                | (Self::Pull, Self::Push)
        )
    }
}

impl fmt::Display for SocketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
