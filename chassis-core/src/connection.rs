//! Connection factory.
//!
//! [`create_connection`] creates (or adopts) a socket, wires it into a
//! [`Transport`] for a freshly built protocol, then performs the requested
//! binds and connects in order.
//!
//! # Examples
//!
//! ```no_run
//! use std::rc::Rc;
//! use chassis_core::connection::{create_connection, ConnectionOptions};
//! use chassis_core::reactor::EventLoop;
//! use chassis_core::socket_type::SocketType;
//! # use chassis_core::transport::{Protocol, Transport};
//! # struct Echo;
//! # impl Protocol for Echo {
//! #     fn connection_made(&self, _t: Transport) {}
//! #     fn connection_lost(&self, _e: Option<std::io::Error>) {}
//! #     fn msg_received(&self, _m: Vec<bytes::Bytes>) {}
//! # }
//!
//! let lp = EventLoop::new()?;
//! let (transport, _protocol) = lp.run_until(create_connection(
//!     &lp,
//!     || Echo,
//!     SocketType::Router,
//!     ConnectionOptions::new().bind("tcp://127.0.0.1:*"),
//! ))??;
//! println!("bound at {:?}", transport.bindings());
//! # Ok::<(), chassis_core::error::Error>(())
//! ```

use std::rc::Rc;
use std::sync::Arc;

use futures::channel::oneshot;
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::context::Context;
use crate::reactor::EventLoop;
use crate::socket::MqSocket;
use crate::socket_type::SocketType;
use crate::transport::{Protocol, Transport};

/// One or more endpoint strings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Endpoints(Vec<String>);

impl Endpoints {
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl From<&str> for Endpoints {
    fn from(s: &str) -> Self {
        Self(vec![s.to_string()])
    }
}

impl From<String> for Endpoints {
    fn from(s: String) -> Self {
        Self(vec![s])
    }
}

impl From<Vec<String>> for Endpoints {
    fn from(v: Vec<String>) -> Self {
        Self(v)
    }
}

impl From<Vec<&str>> for Endpoints {
    fn from(v: Vec<&str>) -> Self {
        Self(v.into_iter().map(str::to_string).collect())
    }
}

impl From<&[&str]> for Endpoints {
    fn from(v: &[&str]) -> Self {
        Self(v.iter().map(|s| (*s).to_string()).collect())
    }
}

impl<const N: usize> From<[&str; N]> for Endpoints {
    fn from(v: [&str; N]) -> Self {
        Self(v.iter().map(|s| (*s).to_string()).collect())
    }
}

/// What [`create_connection`] should do with the socket.
#[derive(Debug, Clone, Default)]
pub struct ConnectionOptions {
    pub bind: Endpoints,
    pub connect: Endpoints,
    /// Adopt this socket instead of creating one.
    pub socket: Option<Arc<dyn MqSocket>>,
    /// Context new sockets are created in (the process-wide libzmq context if
    /// unset).
    pub context: Option<Context>,
}

impl ConnectionOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn bind(mut self, endpoints: impl Into<Endpoints>) -> Self {
        self.bind.0.extend(endpoints.into().0);
        self
    }

    #[must_use]
    pub fn connect(mut self, endpoints: impl Into<Endpoints>) -> Self {
        self.connect.0.extend(endpoints.into().0);
        self
    }

    #[must_use]
    pub fn socket(mut self, socket: Arc<dyn MqSocket>) -> Self {
        self.socket = Some(socket);
        self
    }

    #[must_use]
    pub fn context(mut self, context: Context) -> Self {
        self.context = Some(context);
        self
    }
}

fn open_socket(socket_type: SocketType, options: &ConnectionOptions) -> Result<Arc<dyn MqSocket>> {
    if let Some(socket) = &options.socket {
        if socket.socket_type() != socket_type {
            return Err(Error::invalid_argument(format!(
                "Invalid socket type: expected {socket_type}, got {}",
                socket.socket_type()
            )));
        }
        return Ok(socket.clone());
    }
    let context = options.context.clone().unwrap_or_else(Context::instance);
    Ok(context.socket(socket_type)?)
}

/// Create a transport of `socket_type` wired to the protocol built by
/// `protocol_factory`.
///
/// Binds run before connects, each in the order given. If any of them fails
/// the socket is closed and that first error is returned.
pub async fn create_connection<P, F>(
    lp: &EventLoop,
    protocol_factory: F,
    socket_type: SocketType,
    options: ConnectionOptions,
) -> Result<(Transport, Rc<P>)>
where
    P: Protocol,
    F: FnOnce() -> P,
{
    let socket = open_socket(socket_type, &options)?;
    let protocol = Rc::new(protocol_factory());

    let (waiter, wired) = oneshot::channel();
    let transport = match Transport::new(lp, socket.clone(), protocol.clone(), Some(waiter)) {
        Ok(transport) => transport,
        Err(e) => {
            let _ = socket.close();
            return Err(e);
        }
    };
    if wired.await.is_err() {
        transport.abort();
        return Err(Error::Closed);
    }

    let configured = (|| -> Result<()> {
        for endpoint in options.bind.iter() {
            let real = transport.bind(endpoint)?;
            trace!("[CONNECT] {} bound at {}", socket_type, real);
        }
        for endpoint in options.connect.iter() {
            transport.connect(endpoint)?;
            trace!("[CONNECT] {} connected to {}", socket_type, endpoint);
        }
        Ok(())
    })();

    if let Err(e) = configured {
        debug!("[CONNECT] setup of {} failed: {}", socket_type, e);
        transport.close();
        if let Err(close_err) = socket.close() {
            debug!("[CONNECT] ignoring close error: {}", close_err);
        }
        return Err(e);
    }

    lp.track_socket(socket);
    Ok((transport, protocol))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::cell::{Cell, RefCell};
    use std::io;

    #[derive(Debug, Default)]
    struct Recorder {
        made: Cell<bool>,
        lost: Cell<bool>,
        received: RefCell<Vec<Vec<Bytes>>>,
    }

    impl Protocol for Recorder {
        fn connection_made(&self, _transport: Transport) {
            self.made.set(true);
        }
        fn connection_lost(&self, _exc: Option<io::Error>) {
            self.lost.set(true);
        }
        fn msg_received(&self, msg: Vec<Bytes>) {
            self.received.borrow_mut().push(msg);
        }
    }

    #[test]
    fn test_endpoints_conversions() {
        assert_eq!(Endpoints::from("inproc://a").len(), 1);
        assert_eq!(Endpoints::from(["inproc://a", "inproc://b"]).len(), 2);
        assert_eq!(Endpoints::from(vec!["x".to_string()]).len(), 1);
        let opts = ConnectionOptions::new().bind("inproc://a").bind(["inproc://b"]);
        assert_eq!(opts.bind.iter().collect::<Vec<_>>(), ["inproc://a", "inproc://b"]);
    }

    #[test]
    fn test_create_binds_and_tracks() {
        let lp = EventLoop::new().unwrap();
        let ctx = Context::memory();
        let (transport, protocol) = lp
            .run_until(create_connection(
                &lp,
                Recorder::default,
                SocketType::Pull,
                ConnectionOptions::new()
                    .context(ctx.clone())
                    .bind(["inproc://factory-a", "inproc://factory"]),
            ))
            .unwrap()
            .unwrap();

        assert!(protocol.made.get());
        let bindings = transport.bindings();
        assert_eq!(bindings.len(), 2);
        assert!(bindings.contains("inproc://factory"));
        assert_eq!(ctx.endpoints().len(), 2);
        assert_eq!(lp.tracked_sockets().len(), 1);
    }

    #[test]
    fn test_default_context_listens_on_tcp() {
        let lp = EventLoop::new().unwrap();
        let (transport, _protocol) = lp
            .run_until(create_connection(
                &lp,
                Recorder::default,
                SocketType::Router,
                ConnectionOptions::new().bind("tcp://127.0.0.1:*"),
            ))
            .unwrap()
            .unwrap();

        let bound = transport.bindings().into_iter().next().unwrap();
        assert!(bound.starts_with("tcp://127.0.0.1:") && !bound.ends_with('*'));
        let port: u16 = bound.rsplit(':').next().unwrap().parse().unwrap();
        std::net::TcpStream::connect(("127.0.0.1", port)).unwrap();
        lp.close().unwrap();
    }

    #[test]
    fn test_memory_context_refuses_tcp() {
        let lp = EventLoop::new().unwrap();
        let result = lp
            .run_until(create_connection(
                &lp,
                Recorder::default,
                SocketType::Router,
                ConnectionOptions::new()
                    .context(Context::memory())
                    .bind("tcp://127.0.0.1:*"),
            ))
            .unwrap();
        let err = result.unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EPROTONOSUPPORT));
        assert!(lp.tracked_sockets().is_empty());
    }

    #[test]
    fn test_adopted_socket_type_mismatch() {
        let lp = EventLoop::new().unwrap();
        let ctx = Context::memory();
        let sock = ctx.socket(SocketType::Push).unwrap();
        let result = lp
            .run_until(create_connection(
                &lp,
                Recorder::default,
                SocketType::Pull,
                ConnectionOptions::new().socket(sock),
            ))
            .unwrap();
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn test_failed_bind_closes_socket() {
        let lp = EventLoop::new().unwrap();
        let ctx = Context::memory();
        let sock = ctx.socket(SocketType::Pull).unwrap();
        let adopted: Arc<dyn MqSocket> = sock.clone();
        let result = lp
            .run_until(create_connection(
                &lp,
                Recorder::default,
                SocketType::Pull,
                ConnectionOptions::new()
                    .socket(adopted)
                    .bind(["inproc://dup", "inproc://dup"]),
            ))
            .unwrap();

        let err = result.unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EADDRINUSE));
        assert!(sock.is_closed());
        assert!(ctx.endpoints().is_empty());
    }

    #[test]
    fn test_connect_rejects_hostname() {
        let lp = EventLoop::new().unwrap();
        let result = lp
            .run_until(create_connection(
                &lp,
                Recorder::default,
                SocketType::Dealer,
                ConnectionOptions::new()
                    .context(Context::memory())
                    .connect("tcp://example.com:5555"),
            ))
            .unwrap();
        assert!(matches!(result, Err(Error::Endpoint(_))));
    }
}
