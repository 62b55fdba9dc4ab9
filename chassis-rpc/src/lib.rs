//! # Chassis RPC
//!
//! Remote calls over [`chassis_core`] transports, in three patterns:
//! - **request-reply** (`rpc`): DEALER client, ROUTER server, one reply per call
//! - **pipeline** (`pipeline`): PUSH client, PULL server, fire-and-forget
//! - **publish-subscribe** (`pubsub`): PUB client, SUB servers filtering by topic
//!
//! Servers expose a tree of handlers (`handler`); each endpoint declares a
//! signature whose annotations validate incoming arguments (`signature`).
//! Values are msgpack-encoded (`codec`), with an extension table for typed
//! values, and handler failures travel back as qualified type names the
//! client rebuilds through an error table (`error`).
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use chassis_core::reactor::EventLoop;
//! use chassis_rpc::prelude::*;
//! use chassis_rpc::{args, kwargs};
//!
//! let lp = EventLoop::new()?;
//! let handler = Namespace::new().endpoint(Endpoint::new(
//!     "greet",
//!     Signature::new().param(Param::new("name").annotate(coerce::string())),
//!     |a| Ok(format!("hello, {}", a.str("name")?)),
//! )?);
//!
//! lp.run_until(async {
//!     let _server = serve_rpc(&lp, handler, RpcServerConfig::new().bind("tcp://127.0.0.1:5555")).await?;
//!     let client = connect_rpc(&lp, RpcClientConfig::new().connect("tcp://127.0.0.1:5555")).await?;
//!     let reply = client.call().attr("greet").call(args!["world"], kwargs! {}).await?;
//!     println!("{reply}");
//!     Ok::<_, Box<dyn std::error::Error>>(())
//! })??;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

#![deny(unsafe_code)]
// Allow some pedantic lints
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::match_same_arms)]

pub mod call;
pub mod codec;
pub mod config;
pub mod error;
pub mod handler;
pub mod pipeline;
pub mod pubsub;
pub mod rpc;
pub mod service;
pub mod signature;
pub mod value;

pub use error::{
    CallError, CodecError, ErrorTable, GenericError, HandlerError, NotFoundError, ParametersError,
    RemoteError, ServiceClosedError, SignatureError,
};
pub use value::{Kwargs, Object, Value};

pub mod prelude {
    pub use crate::call::MethodCall;
    pub use crate::codec::{Codec, TranslationTable};
    pub use crate::config::{
        ClientConfig, PipelineClientConfig, PipelineServerConfig, PubSubClientConfig,
        PubSubServerConfig, RpcClientConfig, RpcServerConfig, ServerConfig,
    };
    pub use crate::error::{CallError, ErrorTable, HandlerError, NotFoundError, ParametersError};
    pub use crate::handler::{Endpoint, Handler, Namespace};
    pub use crate::pipeline::{connect_pipeline, serve_pipeline, PipelineClient};
    pub use crate::pubsub::{connect_pubsub, serve_pubsub, PubSubClient, Topic};
    pub use crate::rpc::{connect_rpc, serve_rpc, RpcClient};
    pub use crate::service::Service;
    pub use crate::signature::{coerce, BoundArgs, Param, Signature};
    pub use crate::value::{Kwargs, Object, Value};
}
