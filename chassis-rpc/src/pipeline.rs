//! Pipeline pattern (PUSH client → PULL server).
//!
//! Notifications travel as `[name, args, kwargs]` with no correlation header
//! and no reply. The client's call completes as soon as the message is
//! handed to the transport; the server only logs what handlers return.
//!
//! # Examples
//!
//! ```no_run
//! use chassis_core::reactor::EventLoop;
//! use chassis_rpc::config::PipelineClientConfig;
//! use chassis_rpc::pipeline::connect_pipeline;
//! use chassis_rpc::{args, kwargs};
//!
//! let lp = EventLoop::new()?;
//! lp.run_until(async {
//!     let client = connect_pipeline(&lp, PipelineClientConfig::new().connect("tcp://127.0.0.1:5555")).await?;
//!     client.notify().attr("record").call(args![42], kwargs! {}).await?;
//!     Ok::<_, Box<dyn std::error::Error>>(())
//! })??;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use std::io;
use std::rc::Rc;

use bytes::Bytes;
use chassis_core::connection::create_connection;
use chassis_core::reactor::EventLoop;
use chassis_core::socket_type::SocketType;
use chassis_core::transport::{Protocol, Transport};
use futures::future::{ready, Ready};

use crate::call::{Invoke, MethodCall};
use crate::codec::Codec;
use crate::config::{ClientConfig, PipelineClientConfig, PipelineServerConfig};
use crate::error::{CallError, CodecError, ServiceClosedError};
use crate::handler::Handler;
use crate::service::{log_malformed, service_methods, HasBase, ProtocolBase, Request, ServerCore, Service};
use crate::value::{Kwargs, Value};

/// Client protocol for patterns without a reply channel.
pub(crate) struct NotifyProtocol {
    base: ProtocolBase,
    codec: Codec,
}

impl NotifyProtocol {
    pub(crate) fn new(config: &ClientConfig) -> Self {
        Self {
            base: ProtocolBase::default(),
            codec: Codec::new(config.translation_table.clone()),
        }
    }

    /// Pack and write `[prefix.., name, args, kwargs]`.
    pub(crate) fn send(
        &self,
        prefix: Option<Bytes>,
        name: String,
        args: &[Value],
        kwargs: &Kwargs,
    ) -> Result<(), CallError> {
        let transport = self.base.transport().ok_or(ServiceClosedError)?;
        let mut frames = Vec::with_capacity(4);
        frames.extend(prefix);
        frames.push(Bytes::from(name));
        frames.push(self.codec.pack_args(args)?);
        frames.push(self.codec.pack_kwargs(kwargs)?);
        transport.write(frames)?;
        Ok(())
    }
}

impl HasBase for NotifyProtocol {
    fn base(&self) -> &ProtocolBase {
        &self.base
    }
}

impl Protocol for NotifyProtocol {
    fn connection_made(&self, transport: Transport) {
        self.base.connection_made(transport);
    }

    fn connection_lost(&self, _exc: Option<io::Error>) {
        self.base.connection_lost();
    }

    fn msg_received(&self, msg: Vec<Bytes>) {
        log_malformed("unexpected", &msg, &"client sockets do not receive");
    }
}

/// Client side of the pipeline pattern.
#[derive(Clone)]
pub struct PipelineClient {
    service: Service,
    protocol: Rc<NotifyProtocol>,
}

service_methods!(PipelineClient);

impl PipelineClient {
    /// Start building a notification.
    pub fn notify(&self) -> MethodCall<PipelineClient> {
        MethodCall::new(self.clone())
    }
}

impl Invoke for PipelineClient {
    /// Already complete when returned.
    type Output = Ready<Result<(), CallError>>;

    fn invoke(&self, name: String, args: Vec<Value>, kwargs: Kwargs) -> Self::Output {
        ready(self.protocol.send(None, name, &args, &kwargs))
    }

    fn fail(&self, error: CallError) -> Self::Output {
        ready(Err(error))
    }
}

/// Connect a pipeline client (PUSH socket).
pub async fn connect_pipeline(
    lp: &EventLoop,
    config: PipelineClientConfig,
) -> chassis_core::Result<PipelineClient> {
    let protocol_config = config.clone();
    let (_, protocol) = create_connection(
        lp,
        move || NotifyProtocol::new(&protocol_config),
        SocketType::Push,
        config.connection,
    )
    .await?;
    Ok(PipelineClient {
        service: Service::new(protocol.clone()),
        protocol,
    })
}

/// Server protocol for patterns without a reply channel.
pub(crate) struct NotifyServerProtocol {
    pub(crate) core: Rc<ServerCore>,
    /// Leading frames to strip before `[name, args, kwargs]`.
    pub(crate) skip: usize,
    pub(crate) kind: &'static str,
}

impl NotifyServerProtocol {
    fn decode(&self, msg: &[Bytes]) -> Result<Request, CodecError> {
        match msg.get(self.skip..) {
            Some([name, args, kwargs]) => Request::decode(&self.core.codec, name, args, kwargs),
            _ => Err(CodecError::Decode(format!(
                "expected {} frames, got {}",
                self.skip + 3,
                msg.len()
            ))),
        }
    }
}

impl HasBase for NotifyServerProtocol {
    fn base(&self) -> &ProtocolBase {
        &self.core.base
    }
}

impl Protocol for NotifyServerProtocol {
    fn connection_made(&self, transport: Transport) {
        self.core.base.connection_made(transport);
    }

    fn connection_lost(&self, _exc: Option<io::Error>) {
        self.core.connection_lost();
    }

    fn msg_received(&self, msg: Vec<Bytes>) {
        let request = match self.decode(&msg) {
            Ok(request) => request,
            Err(e) => {
                log_malformed(self.kind, &msg, &e);
                return;
            }
        };

        match self.core.prepare(&request) {
            Ok(prepared) => {
                let outcome = prepared.endpoint.invoke(prepared.args);
                self.core.run(outcome, prepared.returns, move |core, result| {
                    core.process_call_result(&request, result);
                });
            }
            Err(e) => self.core.log_rejected(&request, &e),
        }
    }
}

/// Serve `handler` over the pipeline pattern (PULL socket).
pub async fn serve_pipeline(
    lp: &EventLoop,
    handler: impl Handler + 'static,
    config: PipelineServerConfig,
) -> chassis_core::Result<Service> {
    let handler: Rc<dyn Handler> = Rc::new(handler);
    let core = Rc::new(ServerCore::new(lp, handler, &config));
    let (_, protocol) = create_connection(
        lp,
        move || NotifyServerProtocol {
            core,
            skip: 0,
            kind: "pipeline",
        },
        SocketType::Pull,
        config.connection,
    )
    .await?;
    Ok(Service::new(protocol))
}
