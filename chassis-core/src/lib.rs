//! Chassis Core
//!
//! This crate contains the runtime building blocks the RPC layer sits on:
//! - Message-queue socket contract (`socket`), socket factory (`context`),
//!   libzmq backend (`zmq_socket`) and in-memory `inproc://` backend (`memory`)
//! - Native poll adapter (`poll`) and readiness multiplexer (`selector`)
//! - Single-threaded event loop on a tokio current-thread runtime (`reactor`)
//! - Flow-controlled message transport (`transport`)
//! - Connection factory (`connection`)
//! - Endpoints, socket types, options and subscription matching
//! - Error types (`error`)

// poll.rs needs raw libc calls for the native poll primitive
#![cfg_attr(not(test), deny(unsafe_code))]
// Allow some pedantic lints that are intentional in this crate
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::items_after_statements)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::needless_pass_by_ref_mut)]
#![allow(clippy::match_same_arms)]
pub mod connection;
pub mod context;
pub mod endpoint;
pub mod error;
pub mod memory;
pub mod options;
pub mod poll;
pub mod reactor;
pub mod selector;
pub mod signaler;
pub mod socket;
pub mod socket_type;
pub mod subscription;
pub mod transport;
pub mod zmq_socket;

mod registry;

pub use error::{Error, Result};

// Optional: a small prelude to make downstream crates ergonomic.
// Keep it minimal to avoid API lock-in.
pub mod prelude {
    pub use crate::connection::{create_connection, ConnectionOptions, Endpoints};
    pub use crate::endpoint::Endpoint;
    pub use crate::error::{Error, Result};
    pub use crate::context::Context;
    pub use crate::memory::MemorySocket;
    pub use crate::options::{OptionValue, SocketOption, SocketOptions};
    pub use crate::poll::{Handle, PollFlags};
    pub use crate::reactor::{AbortHandle, ErrorContext, EventLoop, JoinHandle};
    pub use crate::selector::{Interest, Selector, SelectorKey};
    pub use crate::socket::MqSocket;
    pub use crate::socket_type::SocketType;
    pub use crate::transport::{Protocol, Transport, TransportState, WriteBufferLimits};
    pub use crate::zmq_socket::ZmqSocket;
}
