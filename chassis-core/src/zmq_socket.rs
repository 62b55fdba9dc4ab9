//! libzmq backend.
//!
//! [`ZmqSocket`] adapts a `zmq::Socket` to [`MqSocket`]. The socket is not
//! thread-safe, so it sits behind a mutex; every call is non-blocking
//! (`DONTWAIT`), and libzmq's own `ZMQ_FD`/`ZMQ_EVENTS` pair provides the
//! notification descriptor and the level-triggered readiness check.

use std::fmt;
use std::io;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::error::native;
use crate::options::{OptionValue, SocketOption, SocketOptions};
use crate::poll::PollFlags;
use crate::socket::{next_socket_id, MqSocket};
use crate::socket_type::SocketType;

/// Native errno of a libzmq failure.
fn zmq_error(e: zmq::Error) -> io::Error {
    io::Error::from_raw_os_error(e.to_raw())
}

fn zmq_type(socket_type: SocketType) -> zmq::SocketType {
    match socket_type {
        SocketType::Pair => zmq::PAIR,
        SocketType::Pub => zmq::PUB,
        SocketType::Sub => zmq::SUB,
        SocketType::Dealer => zmq::DEALER,
        SocketType::Router => zmq::ROUTER,
        SocketType::Pull => zmq::PULL,
        SocketType::Push => zmq::PUSH,
    }
}

fn int_option(value: &OptionValue) -> io::Result<i32> {
    i32::try_from(value.as_int()?).map_err(|_| native(libc::EINVAL))
}

/// Message-queue socket backed by libzmq.
pub struct ZmqSocket {
    id: u64,
    socket_type: SocketType,
    socket: Mutex<Option<zmq::Socket>>,
    // libzmq has no getter for ROUTER_MANDATORY.
    router_mandatory: AtomicBool,
}

impl ZmqSocket {
    /// Create a socket in `ctx` and apply `options`.
    ///
    /// An unset linger becomes zero so that closing never blocks on unsent
    /// messages.
    pub fn open(ctx: &zmq::Context, socket_type: SocketType, options: SocketOptions) -> io::Result<Self> {
        let socket = ctx.socket(zmq_type(socket_type)).map_err(zmq_error)?;
        let hwm = |v: usize| i32::try_from(v).unwrap_or(i32::MAX);
        socket.set_sndhwm(hwm(options.send_hwm)).map_err(zmq_error)?;
        socket.set_rcvhwm(hwm(options.recv_hwm)).map_err(zmq_error)?;
        let linger = options
            .linger
            .map_or(0, |d| i32::try_from(d.as_millis()).unwrap_or(i32::MAX));
        socket.set_linger(linger).map_err(zmq_error)?;
        if let Some(id) = &options.routing_id {
            SocketOptions::validate_routing_id(id)?;
            socket.set_identity(id).map_err(zmq_error)?;
        }
        if options.router_mandatory && socket_type == SocketType::Router {
            socket.set_router_mandatory(true).map_err(zmq_error)?;
        }
        let id = next_socket_id();
        trace!("[ZMQ] created {} socket #{}", socket_type, id);
        Ok(Self {
            id,
            socket_type,
            socket: Mutex::new(Some(socket)),
            router_mandatory: AtomicBool::new(options.router_mandatory),
        })
    }

    fn with_socket<T>(&self, f: impl FnOnce(&zmq::Socket) -> zmq::Result<T>) -> io::Result<T> {
        let guard = self.socket.lock();
        let socket = guard.as_ref().ok_or_else(|| native(libc::ENOTSOCK))?;
        f(socket).map_err(zmq_error)
    }
}

impl MqSocket for ZmqSocket {
    fn id(&self) -> u64 {
        self.id
    }

    fn socket_type(&self) -> SocketType {
        self.socket_type
    }

    fn fd(&self) -> io::Result<RawFd> {
        self.with_socket(zmq::Socket::get_fd)
    }

    fn events(&self) -> io::Result<PollFlags> {
        let events = self.with_socket(zmq::Socket::get_events)?;
        let mut flags = PollFlags::NONE;
        if events.contains(zmq::POLLIN) {
            flags |= PollFlags::POLLIN;
        }
        if events.contains(zmq::POLLOUT) {
            flags |= PollFlags::POLLOUT;
        }
        if events.contains(zmq::POLLERR) {
            flags |= PollFlags::POLLERR;
        }
        Ok(flags)
    }

    fn send_multipart(&self, frames: &[Bytes]) -> io::Result<()> {
        if frames.is_empty() {
            return Err(native(libc::EINVAL));
        }
        self.with_socket(|s| s.send_multipart(frames.iter().map(|f| &f[..]), zmq::DONTWAIT))
    }

    fn recv_multipart(&self) -> io::Result<Vec<Bytes>> {
        let parts = self.with_socket(|s| s.recv_multipart(zmq::DONTWAIT))?;
        Ok(parts.into_iter().map(Bytes::from).collect())
    }

    fn bind(&self, endpoint: &str) -> io::Result<String> {
        let resolved = self.with_socket(|s| {
            s.bind(endpoint)?;
            s.get_last_endpoint()
        })?;
        let resolved = resolved.map_err(|_| native(libc::EINVAL))?;
        debug!("[ZMQ] #{} bound {}", self.id, resolved);
        Ok(resolved)
    }

    fn unbind(&self, endpoint: &str) -> io::Result<()> {
        self.with_socket(|s| s.unbind(endpoint))
    }

    fn connect(&self, endpoint: &str) -> io::Result<()> {
        self.with_socket(|s| s.connect(endpoint))
    }

    fn disconnect(&self, endpoint: &str) -> io::Result<()> {
        self.with_socket(|s| s.disconnect(endpoint))
    }

    fn get_option(&self, option: SocketOption) -> io::Result<OptionValue> {
        match option {
            SocketOption::Type => Ok(OptionValue::Int(self.socket_type.as_raw())),
            SocketOption::LastEndpoint => {
                let endpoint = self.with_socket(zmq::Socket::get_last_endpoint)?;
                Ok(OptionValue::Str(endpoint.map_err(|_| native(libc::EINVAL))?))
            }
            SocketOption::SendHwm => self
                .with_socket(zmq::Socket::get_sndhwm)
                .map(|v| OptionValue::Int(i64::from(v))),
            SocketOption::RecvHwm => self
                .with_socket(zmq::Socket::get_rcvhwm)
                .map(|v| OptionValue::Int(i64::from(v))),
            SocketOption::RoutingId => self
                .with_socket(zmq::Socket::get_identity)
                .map(|v| OptionValue::Bytes(Bytes::from(v))),
            SocketOption::Linger => self
                .with_socket(zmq::Socket::get_linger)
                .map(|v| OptionValue::Int(i64::from(v))),
            SocketOption::RouterMandatory => {
                self.with_socket(|_| Ok(()))?;
                Ok(OptionValue::Int(i64::from(self.router_mandatory.load(Ordering::Relaxed))))
            }
            SocketOption::Events => self.events().map(|ev| OptionValue::Int(i64::from(ev.bits()))),
            SocketOption::Fd => self.fd().map(|fd| OptionValue::Int(i64::from(fd))),
            SocketOption::Subscribe | SocketOption::Unsubscribe => Err(native(libc::EINVAL)),
        }
    }

    fn set_option(&self, option: SocketOption, value: OptionValue) -> io::Result<()> {
        match option {
            SocketOption::Subscribe | SocketOption::Unsubscribe => {
                if self.socket_type != SocketType::Sub {
                    return Err(native(libc::EINVAL));
                }
                let filter = value.as_bytes()?;
                if option == SocketOption::Subscribe {
                    self.with_socket(|s| s.set_subscribe(&filter))
                } else {
                    self.with_socket(|s| s.set_unsubscribe(&filter))
                }
            }
            SocketOption::SendHwm => {
                let hwm = int_option(&value)?.max(1);
                self.with_socket(|s| s.set_sndhwm(hwm))
            }
            SocketOption::RecvHwm => {
                let hwm = int_option(&value)?.max(1);
                self.with_socket(|s| s.set_rcvhwm(hwm))
            }
            SocketOption::RoutingId => {
                let id = value.as_bytes()?;
                SocketOptions::validate_routing_id(&id)?;
                self.with_socket(|s| s.set_identity(&id))
            }
            SocketOption::Linger => {
                let ms = int_option(&value)?;
                if ms < -1 {
                    return Err(native(libc::EINVAL));
                }
                self.with_socket(|s| s.set_linger(ms))
            }
            SocketOption::RouterMandatory => {
                let enabled = value.as_int()? != 0;
                self.with_socket(|s| s.set_router_mandatory(enabled))?;
                self.router_mandatory.store(enabled, Ordering::Relaxed);
                Ok(())
            }
            SocketOption::Type | SocketOption::LastEndpoint | SocketOption::Events | SocketOption::Fd => {
                Err(native(libc::EINVAL))
            }
        }
    }

    fn close(&self) -> io::Result<()> {
        if self.socket.lock().take().is_some() {
            debug!("[ZMQ] closed {} socket #{}", self.socket_type, self.id);
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.socket.lock().is_none()
    }
}

impl fmt::Debug for ZmqSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ZmqSocket")
            .field("id", &self.id)
            .field("type", &self.socket_type)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    fn recv_within(socket: &ZmqSocket, timeout: Duration) -> io::Result<Vec<Bytes>> {
        let deadline = Instant::now() + timeout;
        loop {
            match socket.recv_multipart() {
                Err(e) if e.kind() == io::ErrorKind::WouldBlock && Instant::now() < deadline => {
                    std::thread::sleep(Duration::from_millis(1));
                }
                other => return other,
            }
        }
    }

    #[test]
    fn test_dealer_router_over_tcp() {
        let ctx = zmq::Context::new();
        let router = ZmqSocket::open(&ctx, SocketType::Router, SocketOptions::default()).unwrap();
        let dealer = ZmqSocket::open(
            &ctx,
            SocketType::Dealer,
            SocketOptions::new().with_routing_id(Bytes::from_static(b"client-1")),
        )
        .unwrap();

        let endpoint = router.bind("tcp://127.0.0.1:*").unwrap();
        assert!(endpoint.starts_with("tcp://127.0.0.1:"));
        assert!(!endpoint.ends_with('*'));
        dealer.connect(&endpoint).unwrap();

        dealer.send_multipart(&[Bytes::from_static(b"hello")]).unwrap();
        let received = recv_within(&router, Duration::from_secs(2)).unwrap();
        assert_eq!(received, [Bytes::from_static(b"client-1"), Bytes::from_static(b"hello")]);

        router
            .send_multipart(&[received[0].clone(), Bytes::from_static(b"world")])
            .unwrap();
        assert_eq!(
            recv_within(&dealer, Duration::from_secs(2)).unwrap(),
            [Bytes::from_static(b"world")]
        );
    }

    #[test]
    fn test_options_and_close() {
        let ctx = zmq::Context::new();
        let sock = ZmqSocket::open(&ctx, SocketType::Router, SocketOptions::default()).unwrap();
        assert_eq!(sock.get_option(SocketOption::Linger).unwrap(), OptionValue::Int(0));
        sock.set_option(SocketOption::SendHwm, OptionValue::Int(10)).unwrap();
        assert_eq!(sock.get_option(SocketOption::SendHwm).unwrap(), OptionValue::Int(10));
        sock.set_option(SocketOption::RouterMandatory, OptionValue::Int(1)).unwrap();
        assert_eq!(sock.get_option(SocketOption::RouterMandatory).unwrap(), OptionValue::Int(1));
        let err = sock
            .set_option(SocketOption::Subscribe, OptionValue::from("x"))
            .unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EINVAL));
        assert!(sock.fd().is_ok());

        sock.close().unwrap();
        sock.close().unwrap();
        assert!(sock.is_closed());
        assert_eq!(sock.fd().unwrap_err().raw_os_error(), Some(libc::ENOTSOCK));
        assert_eq!(
            sock.send_multipart(&[Bytes::from_static(b"x")]).unwrap_err().raw_os_error(),
            Some(libc::ENOTSOCK)
        );
    }

    #[test]
    fn test_recv_would_block() {
        let ctx = zmq::Context::new();
        let pull = ZmqSocket::open(&ctx, SocketType::Pull, SocketOptions::default()).unwrap();
        pull.bind("inproc://zmq-would-block").unwrap();
        let err = pull.recv_multipart().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
        assert!(!pull.events().unwrap().contains(PollFlags::POLLIN));
    }
}
