//! Socket factory.
//!
//! A [`Context`] creates [`MqSocket`]s on one of two backends:
//!
//! - **libzmq** ([`Context::new`], [`Context::instance`]): real ZeroMQ sockets
//!   through the `zmq` crate; `tcp://` and `ipc://` endpoints reach other
//!   processes
//! - **memory** ([`Context::memory`]): process-local sockets that only speak
//!   `inproc://`, wired through a per-context registry
//!
//! Sockets of one context reach each other over `inproc://`; endpoints of
//! different contexts never collide.

use std::fmt;
use std::io;
use std::sync::Arc;

use once_cell::sync::Lazy;

use crate::memory::MemorySocket;
use crate::options::SocketOptions;
use crate::registry::Registry;
use crate::socket::MqSocket;
use crate::socket_type::SocketType;
use crate::zmq_socket::ZmqSocket;

static DEFAULT_CONTEXT: Lazy<Context> = Lazy::new(Context::new);

#[derive(Clone)]
enum Backend {
    Zmq(zmq::Context),
    Memory(Arc<Registry>),
}

/// Factory and endpoint namespace for message-queue sockets.
#[derive(Clone)]
pub struct Context {
    backend: Backend,
}

impl Context {
    /// A fresh libzmq context.
    pub fn new() -> Self {
        Self {
            backend: Backend::Zmq(zmq::Context::new()),
        }
    }

    /// A fresh in-memory context (`inproc://` only).
    pub fn memory() -> Self {
        Self {
            backend: Backend::Memory(Arc::new(Registry::new())),
        }
    }

    /// The process-wide shared libzmq context.
    pub fn instance() -> Self {
        DEFAULT_CONTEXT.clone()
    }

    pub fn is_memory(&self) -> bool {
        matches!(self.backend, Backend::Memory(_))
    }

    /// Create a socket of the given type with default options.
    pub fn socket(&self, socket_type: SocketType) -> io::Result<Arc<dyn MqSocket>> {
        self.socket_with_options(socket_type, SocketOptions::default())
    }

    pub fn socket_with_options(
        &self,
        socket_type: SocketType,
        options: SocketOptions,
    ) -> io::Result<Arc<dyn MqSocket>> {
        let socket: Arc<dyn MqSocket> = match &self.backend {
            Backend::Zmq(ctx) => Arc::new(ZmqSocket::open(ctx, socket_type, options)?),
            Backend::Memory(registry) => MemorySocket::open(registry.clone(), socket_type, options)?,
        };
        Ok(socket)
    }

    /// Endpoints currently bound in an in-memory context.
    ///
    /// libzmq keeps no such table; its contexts report nothing.
    pub fn endpoints(&self) -> Vec<String> {
        match &self.backend {
            Backend::Zmq(_) => Vec::new(),
            Backend::Memory(registry) => registry.list_endpoints(),
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.backend {
            Backend::Zmq(_) => f.debug_struct("Context").field("backend", &"zmq").finish(),
            Backend::Memory(registry) => f
                .debug_struct("Context")
                .field("backend", &"memory")
                .field("endpoints", &registry.list_endpoints())
                .finish(),
        }
    }
}
