//! Machinery shared by every pattern: the service handle, the base
//! protocol state, and the server core that dispatches, validates, runs and
//! logs handler calls.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};

use bytes::Bytes;
use chassis_core::reactor::{AbortHandle, EventLoop, WeakEventLoop};
use chassis_core::transport::Transport;
use futures::channel::oneshot;
use futures::future::{self, FutureExt, LocalBoxFuture};
use hashbrown::{HashMap, HashSet};
use tracing::{debug, error, warn};

use crate::codec::Codec;
use crate::config::ServerConfig;
use crate::error::{CodecError, HandlerError, ServiceClosedError};
use crate::handler::{dispatch, Endpoint, Handler, HandlerResult, Outcome};
use crate::signature::{BoundArgs, Coercer};
use crate::value::{Kwargs, Value};

/// Transport bookkeeping every pattern protocol carries.
#[derive(Default)]
pub(crate) struct ProtocolBase {
    transport: RefCell<Option<Transport>>,
    closed: Cell<bool>,
    close_waiters: RefCell<Vec<oneshot::Sender<()>>>,
}

impl ProtocolBase {
    pub(crate) fn connection_made(&self, transport: Transport) {
        *self.transport.borrow_mut() = Some(transport);
    }

    pub(crate) fn connection_lost(&self) {
        self.transport.borrow_mut().take();
        self.closed.set(true);
        for waiter in self.close_waiters.borrow_mut().drain(..) {
            let _ = waiter.send(());
        }
    }

    pub(crate) fn transport(&self) -> Option<Transport> {
        self.transport.borrow().clone()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.get()
    }

    fn closed_waiter(&self) -> Option<oneshot::Receiver<()>> {
        if self.closed.get() {
            return None;
        }
        let (tx, rx) = oneshot::channel();
        self.close_waiters.borrow_mut().push(tx);
        Some(rx)
    }
}

pub(crate) trait HasBase {
    fn base(&self) -> &ProtocolBase;
}

/// Handle on a connected client or server.
#[derive(Clone)]
pub struct Service {
    protocol: Rc<dyn HasBase>,
}

impl Service {
    pub(crate) fn new(protocol: Rc<dyn HasBase>) -> Self {
        Self { protocol }
    }

    /// The live transport, or [`ServiceClosedError`] once it is gone.
    pub fn transport(&self) -> Result<Transport, ServiceClosedError> {
        self.protocol.base().transport().ok_or(ServiceClosedError)
    }

    /// Close the transport. Calling it again is a no-op.
    pub fn close(&self) {
        if let Some(transport) = self.protocol.base().transport() {
            transport.close();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.protocol.base().is_closed()
    }

    /// Wait until the connection is lost.
    pub async fn wait_closed(&self) {
        let waiter = self.protocol.base().closed_waiter();
        if let Some(rx) = waiter {
            let _ = rx.await;
        }
    }
}

impl fmt::Debug for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Service")
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Forward the [`Service`] surface from a client or server type.
macro_rules! service_methods {
    ($ty:ty) => {
        impl $ty {
            /// The underlying service handle.
            pub fn service(&self) -> &$crate::service::Service {
                &self.service
            }

            pub fn transport(
                &self,
            ) -> Result<::chassis_core::transport::Transport, $crate::error::ServiceClosedError> {
                self.service.transport()
            }

            pub fn close(&self) {
                self.service.close();
            }

            pub fn is_closed(&self) -> bool {
                self.service.is_closed()
            }

            pub async fn wait_closed(&self) {
                self.service.wait_closed().await;
            }
        }
    };
}

pub(crate) use service_methods;

/// Method name and arguments of one inbound call, as received.
#[derive(Debug, Clone)]
pub(crate) struct Request {
    pub(crate) name: String,
    pub(crate) args: Vec<Value>,
    pub(crate) kwargs: Kwargs,
}

impl Request {
    pub(crate) fn decode(
        codec: &Codec,
        name: &Bytes,
        args: &Bytes,
        kwargs: &Bytes,
    ) -> Result<Self, CodecError> {
        let name = std::str::from_utf8(name)
            .map_err(|_| CodecError::InvalidUtf8)?
            .to_string();
        Ok(Self {
            name,
            args: codec.unpack_args(args)?,
            kwargs: codec.unpack_kwargs(kwargs)?,
        })
    }

    fn args_repr(&self) -> String {
        Value::Array(self.args.clone()).to_string()
    }

    fn kwargs_repr(&self) -> String {
        Value::from(self.kwargs.clone()).to_string()
    }
}

/// A request that passed dispatch and argument validation.
pub(crate) struct Prepared {
    pub(crate) endpoint: Rc<Endpoint>,
    pub(crate) args: BoundArgs,
    pub(crate) returns: Option<Coercer>,
}

/// Dispatch, validation, execution and logging shared by all servers.
pub(crate) struct ServerCore {
    pub(crate) base: ProtocolBase,
    pub(crate) codec: Codec,
    lp: WeakEventLoop,
    handler: Rc<dyn Handler>,
    log_exceptions: bool,
    exclude_log_exceptions: HashSet<String>,
    pending: RefCell<HashMap<u64, AbortHandle>>,
    next_task: Cell<u64>,
}

impl ServerCore {
    pub(crate) fn new(lp: &EventLoop, handler: Rc<dyn Handler>, config: &ServerConfig) -> Self {
        Self {
            base: ProtocolBase::default(),
            codec: Codec::new(config.translation_table.clone()),
            lp: lp.downgrade(),
            handler,
            log_exceptions: config.log_exceptions,
            exclude_log_exceptions: config.exclude_log_exceptions.clone(),
            pending: RefCell::new(HashMap::new()),
            next_task: Cell::new(0),
        }
    }

    /// Resolve the method and bind its arguments.
    pub(crate) fn prepare(&self, request: &Request) -> Result<Prepared, HandlerError> {
        let endpoint = dispatch(self.handler.as_ref(), &request.name)?;
        let (args, returns) = endpoint
            .signature()
            .check_args(request.args.clone(), request.kwargs.clone())?;
        Ok(Prepared {
            endpoint,
            args,
            returns,
        })
    }

    /// Drive `outcome` to completion and hand the result to `on_done`.
    ///
    /// Both kinds of outcome run as tracked tasks, so a synchronous result
    /// completes on a later loop iteration. Tasks still tracked when the
    /// connection is lost are aborted and `on_done` never runs for them.
    pub(crate) fn run<F>(self: &Rc<Self>, outcome: Outcome, returns: Option<Coercer>, on_done: F)
    where
        F: FnOnce(&ServerCore, HandlerResult) + 'static,
    {
        let Some(lp) = self.lp.upgrade() else {
            debug!("[RPC] Event loop is gone, dropping call");
            return;
        };
        let fut: LocalBoxFuture<'static, HandlerResult> = match outcome {
            Outcome::Ready(result) => future::ready(result).boxed_local(),
            Outcome::Pending(fut) => fut,
        };
        let weak: Weak<Self> = Rc::downgrade(self);
        let id = self.next_task.get();
        self.next_task.set(id.wrapping_add(1));
        let task = lp.spawn_local(async move {
            let result = fut.await;
            if let Some(core) = weak.upgrade() {
                if core.pending.borrow_mut().remove(&id).is_some() {
                    on_done(&core, apply_returns(result, returns.as_ref()));
                }
            }
        });
        self.pending.borrow_mut().insert(id, task.abort_handle());
    }

    /// Log a failed handler call if exception logging covers its type.
    pub(crate) fn try_log(&self, request: &Request, error: &HandlerError) {
        if !self.log_exceptions || self.exclude_log_exceptions.contains(&error.type_name) {
            return;
        }
        error!(
            method = %request.name,
            args = %request.args_repr(),
            kwargs = %request.kwargs_repr(),
            error = %error,
            details = ?error,
            "[RPC] An exception from method {:?} call occurred",
            request.name
        );
    }

    /// Logging for patterns without a reply channel.
    pub(crate) fn process_call_result(&self, request: &Request, result: HandlerResult) {
        match result {
            Ok(Value::Nil) => {}
            Ok(value) => warn!(
                method = %request.name,
                "[RPC] Handler {:?} returned {}, the value is discarded",
                request.name,
                value
            ),
            Err(e) => self.try_log(request, &e),
        }
    }

    /// Log a request that failed dispatch or validation on a server without
    /// a reply channel.
    pub(crate) fn log_rejected(&self, request: &Request, error: &HandlerError) {
        error!(
            method = %request.name,
            args = %request.args_repr(),
            kwargs = %request.kwargs_repr(),
            error = %error,
            "[RPC] Call to {:?} rejected",
            request.name
        );
    }

    /// Abort running handler tasks and release close waiters.
    pub(crate) fn connection_lost(&self) {
        let tasks: Vec<AbortHandle> = self.pending.borrow_mut().drain().map(|(_, t)| t).collect();
        for task in tasks {
            task.abort();
        }
        self.base.connection_lost();
    }

    pub(crate) fn pending_count(&self) -> usize {
        self.pending.borrow().len()
    }
}

fn apply_returns(result: HandlerResult, returns: Option<&Coercer>) -> HandlerResult {
    match returns {
        Some(coerce) => result.and_then(|v| coerce(v).map_err(HandlerError::from)),
        None => result,
    }
}

/// Log an inbound message that could not be decoded.
pub(crate) fn log_malformed(kind: &str, msg: &[Bytes], error: &dyn fmt::Display) {
    error!(
        critical = true,
        frames = ?msg,
        error = %error,
        "[RPC] Cannot unpack {} message, dropping it",
        kind
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::Namespace;
    use crate::signature::{coerce, Param, Signature};
    use crate::{args, kwargs};
    use std::time::Duration;

    fn core(lp: &EventLoop) -> Rc<ServerCore> {
        let root = Namespace::new()
            .endpoint(
                Endpoint::new(
                    "double",
                    Signature::new()
                        .param(Param::new("x").annotate(coerce::int()))
                        .returns(coerce::string()),
                    |a| Ok(a.int("x")? * 2),
                )
                .unwrap(),
            )
            .endpoint(
                Endpoint::new_async("forever", Signature::new(), |_| {
                    futures::future::pending::<Result<(), HandlerError>>()
                })
                .unwrap(),
            );
        Rc::new(ServerCore::new(lp, Rc::new(root), &ServerConfig::new()))
    }

    fn request(name: &str, args: Vec<Value>) -> Request {
        Request {
            name: name.into(),
            args,
            kwargs: kwargs! {},
        }
    }

    #[test]
    fn test_prepare_rejects_unknown_and_invalid() {
        let lp = EventLoop::new().unwrap();
        let core = core(&lp);
        let err = core.prepare(&request("missing", args![])).err().unwrap();
        assert_eq!(err.type_name, "chassis_rpc::NotFoundError");
        let err = core.prepare(&request("double", args!["x"])).err().unwrap();
        assert_eq!(err.type_name, "chassis_rpc::ParametersError");
    }

    #[test]
    fn test_sync_result_completes_on_next_tick_with_return_annotation() {
        let lp = EventLoop::new().unwrap();
        let core = core(&lp);
        let prepared = core.prepare(&request("double", args!["21"])).unwrap();
        let seen = Rc::new(RefCell::new(None));
        let sink = seen.clone();
        core.run(prepared.endpoint.invoke(prepared.args), prepared.returns, move |_, r| {
            *sink.borrow_mut() = Some(r);
        });
        assert!(seen.borrow().is_none());
        lp.run_until(lp.sleep(Duration::from_millis(1))).unwrap();
        assert_eq!(seen.borrow_mut().take().unwrap().unwrap(), Value::from("42"));
    }

    #[test]
    fn test_connection_lost_cancels_queued_sync_reply() {
        let lp = EventLoop::new().unwrap();
        let core = core(&lp);
        let prepared = core.prepare(&request("double", args![2])).unwrap();
        let ran = Rc::new(Cell::new(false));
        let flag = ran.clone();
        core.run(prepared.endpoint.invoke(prepared.args), prepared.returns, move |_, _| {
            flag.set(true)
        });
        assert_eq!(core.pending_count(), 1);

        core.connection_lost();
        lp.run_until(lp.sleep(Duration::from_millis(1))).unwrap();
        assert!(!ran.get());
        assert_eq!(core.pending_count(), 0);
        assert_eq!(lp.task_count(), 0);
    }

    #[test]
    fn test_connection_lost_aborts_pending_tasks() {
        let lp = EventLoop::new().unwrap();
        let core = core(&lp);
        let prepared = core.prepare(&request("forever", args![])).unwrap();
        let ran = Rc::new(Cell::new(false));
        let flag = ran.clone();
        core.run(prepared.endpoint.invoke(prepared.args), None, move |_, _| flag.set(true));
        lp.run_until(lp.sleep(Duration::from_millis(1))).unwrap();
        assert_eq!(core.pending_count(), 1);

        core.connection_lost();
        lp.run_until(lp.sleep(Duration::from_millis(1))).unwrap();
        assert_eq!(core.pending_count(), 0);
        assert!(!ran.get());
        assert!(core.base.is_closed());
        assert_eq!(lp.task_count(), 0);
    }

    #[test]
    fn test_wait_closed_resolves_on_connection_lost() {
        let lp = EventLoop::new().unwrap();
        let core = core(&lp);
        let service = Service::new(Rc::new(Holder(core.clone())));
        assert!(service.transport().is_err());

        let waiter = lp.spawn_local({
            let service = service.clone();
            async move { service.wait_closed().await }
        });
        lp.run_until(lp.sleep(Duration::from_millis(1))).unwrap();
        core.connection_lost();
        lp.run_until(waiter).unwrap().unwrap();
        assert!(service.is_closed());
        lp.run_until(service.wait_closed()).unwrap();
    }

    struct Holder(Rc<ServerCore>);

    impl HasBase for Holder {
        fn base(&self) -> &ProtocolBase {
            &self.0.base
        }
    }
}
