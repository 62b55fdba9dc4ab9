//! # Chassis
//!
//! Asynchronous RPC over ZeroMQ-style message sockets.
//!
//! ## Architecture
//!
//! Chassis is split in two layers:
//!
//! - **`chassis-core`**: readiness multiplexer, single-threaded event loop on
//!   tokio, libzmq and in-memory sockets, flow-controlled transports and the
//!   connection factory
//! - **`chassis-rpc`**: msgpack codec, handler trees, request-reply,
//!   pipeline and publish-subscribe patterns
//! - **`chassis`**: public API surface (this crate)
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use chassis::prelude::*;
//! use chassis::{args, kwargs};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let lp = EventLoop::new()?;
//! let handler = Namespace::new().endpoint(Endpoint::new(
//!     "add",
//!     Signature::new()
//!         .param(Param::new("a").annotate(coerce::int()))
//!         .param(Param::new("b").annotate(coerce::int())),
//!     |a| {
//!         a.int("a")?
//!             .checked_add(a.int("b")?)
//!             .ok_or_else(|| HandlerError::new("calc::Overflow", vec![], "integer overflow"))
//!     },
//! )?);
//!
//! lp.run_until(async {
//!     let server = serve_rpc(&lp, handler, RpcServerConfig::new().bind("tcp://127.0.0.1:*")).await?;
//!     let addr = server.transport()?.bindings().into_iter().next().unwrap_or_default();
//!     let client = connect_rpc(&lp, RpcClientConfig::new().connect(addr)).await?;
//!
//!     let sum = client.call().attr("add").call(args![1, 2], kwargs! {}).await?;
//!     assert_eq!(sum, Value::Int(3));
//!     Ok::<_, Box<dyn std::error::Error>>(())
//! })??;
//! # Ok(())
//! # }
//! ```
//!
//! ## Threading
//!
//! An [`EventLoop`](chassis_core::reactor::EventLoop) and everything attached
//! to it stay on the thread that created them. Run one loop per thread and
//! share a [`Context`](chassis_core::context::Context) between them to reach
//! each other over `inproc://`.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod dev_tracing;

pub use bytes::Bytes;
pub use chassis_core;
pub use chassis_rpc;
pub use chassis_rpc::{args, kwargs};

/// Everything needed to write clients and servers.
pub mod prelude {
    pub use bytes::Bytes;
    pub use chassis_core::prelude::{
        Context, ConnectionOptions, EventLoop, JoinHandle, Protocol, SocketType, Transport,
        WriteBufferLimits,
    };
    pub use chassis_rpc::prelude::*;
}
