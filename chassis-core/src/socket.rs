//! Message-queue socket contract.
//!
//! [`MqSocket`] is the opaque transport primitive everything above this crate
//! talks to: non-blocking send/receive of multi-part byte messages, endpoint
//! management, dynamic options, and a level-triggered readiness check paired
//! with a notification descriptor for the poller.
//!
//! All methods report native failures as `io::Error` values carrying the
//! errno the message-queue library would use (`EAGAIN`, `ENOTSOCK`,
//! `EADDRINUSE`, ...).

use std::fmt;
use std::io;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;

use crate::options::{OptionValue, SocketOption};
use crate::poll::PollFlags;
use crate::socket_type::SocketType;

/// Opaque message-queue socket.
pub trait MqSocket: Send + Sync + fmt::Debug {
    /// Process-unique identity of this socket object.
    fn id(&self) -> u64;

    fn socket_type(&self) -> SocketType;

    /// Readiness notification descriptor.
    ///
    /// It becomes readable when `events()` may have changed. Fails with
    /// `ENOTSOCK` once the socket is closed.
    fn fd(&self) -> io::Result<RawFd>;

    /// Current level-triggered readiness (resets the notification descriptor).
    fn events(&self) -> io::Result<PollFlags>;

    /// Send one whole message; `WouldBlock` if it cannot be queued now.
    fn send_multipart(&self, frames: &[Bytes]) -> io::Result<()>;

    /// Receive one whole message; `WouldBlock` if none is queued.
    fn recv_multipart(&self) -> io::Result<Vec<Bytes>>;

    /// Bind and return the endpoint with wildcards resolved.
    fn bind(&self, endpoint: &str) -> io::Result<String>;

    fn unbind(&self, endpoint: &str) -> io::Result<()>;

    fn connect(&self, endpoint: &str) -> io::Result<()>;

    fn disconnect(&self, endpoint: &str) -> io::Result<()>;

    fn get_option(&self, option: SocketOption) -> io::Result<OptionValue>;

    fn set_option(&self, option: SocketOption, value: OptionValue) -> io::Result<()>;

    /// Release the socket. Closing twice is a no-op.
    fn close(&self) -> io::Result<()>;

    fn is_closed(&self) -> bool;
}

static NEXT_SOCKET_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate a process-unique socket id, shared by every backend.
pub(crate) fn next_socket_id() -> u64 {
    NEXT_SOCKET_ID.fetch_add(1, Ordering::Relaxed)
}

/// Sum of frame lengths of a message.
#[must_use]
pub fn message_len(frames: &[Bytes]) -> usize {
    frames.iter().map(Bytes::len).sum()
}
