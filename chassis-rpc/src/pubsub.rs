//! Publish-subscribe pattern (PUB client → SUB server).
//!
//! Messages travel as `[topic, name, args, kwargs]`. Servers only receive
//! topics matching one of their subscribed prefixes; an empty topic reaches
//! servers subscribed to the empty prefix.
//!
//! # Examples
//!
//! ```no_run
//! use chassis_core::reactor::EventLoop;
//! use chassis_rpc::config::PubSubClientConfig;
//! use chassis_rpc::pubsub::connect_pubsub;
//! use chassis_rpc::{args, kwargs};
//!
//! let lp = EventLoop::new()?;
//! lp.run_until(async {
//!     let client = connect_pubsub(&lp, PubSubClientConfig::new().connect("tcp://127.0.0.1:5556")).await?;
//!     client.publish("temperature").attr("report").call(args![21.5], kwargs! {}).await?;
//!     Ok::<_, Box<dyn std::error::Error>>(())
//! })??;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use std::rc::Rc;

use bytes::Bytes;
use chassis_core::connection::create_connection;
use chassis_core::reactor::EventLoop;
use chassis_core::socket_type::SocketType;
use futures::future::{ready, Ready};
use tracing::debug;

use crate::call::{Invoke, MethodCall};
use crate::config::{PubSubClientConfig, PubSubServerConfig};
use crate::error::CallError;
use crate::handler::Handler;
use crate::pipeline::{NotifyProtocol, NotifyServerProtocol};
use crate::service::{service_methods, ServerCore, Service};
use crate::value::{Kwargs, Value};

/// Topic of a published message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Topic(Bytes);

impl Topic {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<&str> for Topic {
    fn from(s: &str) -> Self {
        Self(Bytes::copy_from_slice(s.as_bytes()))
    }
}

impl From<String> for Topic {
    fn from(s: String) -> Self {
        Self(Bytes::from(s))
    }
}

impl From<&[u8]> for Topic {
    fn from(b: &[u8]) -> Self {
        Self(Bytes::copy_from_slice(b))
    }
}

impl From<Bytes> for Topic {
    fn from(b: Bytes) -> Self {
        Self(b)
    }
}

/// `None` publishes on the empty topic.
impl<T: Into<Topic>> From<Option<T>> for Topic {
    fn from(t: Option<T>) -> Self {
        t.map(Into::into).unwrap_or_default()
    }
}

/// Client side of the publish-subscribe pattern.
#[derive(Clone)]
pub struct PubSubClient {
    service: Service,
    protocol: Rc<NotifyProtocol>,
}

service_methods!(PubSubClient);

impl PubSubClient {
    /// Start building a call published on `topic`.
    pub fn publish(&self, topic: impl Into<Topic>) -> MethodCall<Publisher> {
        MethodCall::new(Publisher {
            protocol: self.protocol.clone(),
            topic: topic.into(),
        })
    }
}

/// Call target bound to one topic.
#[derive(Clone)]
pub struct Publisher {
    protocol: Rc<NotifyProtocol>,
    topic: Topic,
}

impl Publisher {
    pub fn topic(&self) -> &Topic {
        &self.topic
    }
}

impl Invoke for Publisher {
    /// Already complete when returned.
    type Output = Ready<Result<(), CallError>>;

    fn invoke(&self, name: String, args: Vec<Value>, kwargs: Kwargs) -> Self::Output {
        ready(
            self.protocol
                .send(Some(self.topic.0.clone()), name, &args, &kwargs),
        )
    }

    fn fail(&self, error: CallError) -> Self::Output {
        ready(Err(error))
    }
}

/// Connect a publishing client (PUB socket).
pub async fn connect_pubsub(
    lp: &EventLoop,
    config: PubSubClientConfig,
) -> chassis_core::Result<PubSubClient> {
    let protocol_config = config.clone();
    let (_, protocol) = create_connection(
        lp,
        move || NotifyProtocol::new(&protocol_config),
        SocketType::Pub,
        config.connection,
    )
    .await?;
    Ok(PubSubClient {
        service: Service::new(protocol.clone()),
        protocol,
    })
}

/// Serve `handler` to published messages (SUB socket).
///
/// The server receives nothing until it subscribes; `config.subscribe`
/// filters are applied before this returns, more can be added through
/// [`Service::transport`].
pub async fn serve_pubsub(
    lp: &EventLoop,
    handler: impl Handler + 'static,
    config: PubSubServerConfig,
) -> chassis_core::Result<Service> {
    let handler: Rc<dyn Handler> = Rc::new(handler);
    let core = Rc::new(ServerCore::new(lp, handler, &config));
    let (transport, protocol) = create_connection(
        lp,
        move || NotifyServerProtocol {
            core,
            skip: 1,
            kind: "pubsub",
        },
        SocketType::Sub,
        config.connection,
    )
    .await?;

    for filter in config.subscribe {
        if let Err(e) = transport.subscribe(filter.clone()) {
            transport.close();
            return Err(e);
        }
        debug!(topic = ?filter, "[RPC] Subscribed");
    }
    Ok(Service::new(protocol))
}
