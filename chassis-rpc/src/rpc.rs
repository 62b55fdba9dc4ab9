//! Request-reply pattern (DEALER client → ROUTER server).
//!
//! Requests travel as `[header, name, args, kwargs]`; the server answers
//! `[peer, header, payload]` where the reply header echoes the request id
//! and carries an error flag. Error payloads are `[type name, args, repr]`
//! triples the client rebuilds through its [`ErrorTable`].
//!
//! # Pending calls
//!
//! Every outstanding request owns an entry in the client's call table:
//!
//! - *in flight*: the entry exists and its future is still waiting;
//! - *resolved*: a reply arrived and was delivered, the entry is gone;
//! - *cancelled*: the future timed out or was dropped; the entry moves to a
//!   bounded tombstone list so a late reply is dropped with a debug log;
//! - *evicted*: the connection was lost; every entry is removed and every
//!   future completes with [`CallError::Cancelled`].
//!
//! A reply whose id has neither an entry nor a tombstone (never issued,
//! already resolved, evicted, or a tombstone pushed out by newer ones) is
//! logged as critical and dropped.
//!
//! # Examples
//!
//! ```no_run
//! use chassis_core::reactor::EventLoop;
//! use chassis_rpc::config::{RpcClientConfig, RpcServerConfig};
//! use chassis_rpc::error::HandlerError;
//! use chassis_rpc::handler::{Endpoint, Namespace};
//! use chassis_rpc::rpc::{connect_rpc, serve_rpc};
//! use chassis_rpc::signature::{coerce, Param, Signature};
//! use chassis_rpc::{args, kwargs};
//!
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
//! let sum = lp.run_until(async {
//!     let server = serve_rpc(&lp, handler, RpcServerConfig::new().bind("inproc://calc")).await?;
//!     let client = connect_rpc(&lp, RpcClientConfig::new().connect("inproc://calc")).await?;
//!     let sum = client.call().attr("add").call(args![1, 2], kwargs! {}).await?;
//!     client.close();
//!     server.close();
//!     Ok::<_, Box<dyn std::error::Error>>(sum)
//! })??;
//! assert_eq!(sum.as_i64(), Some(3));
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use std::cell::{Cell, RefCell};
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::collections::VecDeque;
use std::rc::{Rc, Weak};
use std::task::{Context, Poll};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::{BufMut, Bytes, BytesMut};
use chassis_core::connection::create_connection;
use chassis_core::reactor::{EventLoop, Sleep, WeakEventLoop};
use chassis_core::socket_type::SocketType;
use chassis_core::transport::{Protocol, Transport};
use futures::channel::oneshot;
use hashbrown::{HashMap, HashSet};
use tracing::{debug, error, trace, warn};

use crate::call::{Invoke, MethodCall};
use crate::codec::{Codec, TranslationTable};
use crate::config::{RpcClientConfig, RpcServerConfig};
use crate::error::{CallError, CodecError, ErrorTable, HandlerError, ServiceClosedError};
use crate::handler::{Handler, Outcome};
use crate::service::{log_malformed, service_methods, HasBase, ProtocolBase, Request, ServerCore, Service};
use crate::value::{Kwargs, Value};

/// Encoded size of a [`RequestHeader`].
pub const REQUEST_HEADER_LEN: usize = 16;
/// Encoded size of a [`ResponseHeader`].
pub const RESPONSE_HEADER_LEN: usize = 17;
/// Cancelled request ids remembered for late replies.
pub const MAX_TOMBSTONES: usize = 1024;

/// Request header: `pid % 2^16`, nonce, request id, send time.
///
/// Native byte order, no padding.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RequestHeader {
    pub pid: u16,
    pub nonce: u16,
    pub req_id: u32,
    pub timestamp: f64,
}

/// Reply header: the request header fields plus an error flag.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResponseHeader {
    pub pid: u16,
    pub nonce: u16,
    pub req_id: u32,
    pub timestamp: f64,
    pub is_error: bool,
}

fn put_common(buf: &mut BytesMut, pid: u16, nonce: u16, req_id: u32, timestamp: f64) {
    buf.put_slice(&pid.to_ne_bytes());
    buf.put_slice(&nonce.to_ne_bytes());
    buf.put_slice(&req_id.to_ne_bytes());
    buf.put_slice(&timestamp.to_ne_bytes());
}

fn get_common(data: &[u8]) -> (u16, u16, u32, f64) {
    let mut pid = [0u8; 2];
    let mut nonce = [0u8; 2];
    let mut req_id = [0u8; 4];
    let mut timestamp = [0u8; 8];
    pid.copy_from_slice(&data[0..2]);
    nonce.copy_from_slice(&data[2..4]);
    req_id.copy_from_slice(&data[4..8]);
    timestamp.copy_from_slice(&data[8..16]);
    (
        u16::from_ne_bytes(pid),
        u16::from_ne_bytes(nonce),
        u32::from_ne_bytes(req_id),
        f64::from_ne_bytes(timestamp),
    )
}

fn bad_header(expected: usize, got: usize) -> CodecError {
    CodecError::Decode(format!("header must be {expected} bytes, got {got}"))
}

impl RequestHeader {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(REQUEST_HEADER_LEN);
        put_common(&mut buf, self.pid, self.nonce, self.req_id, self.timestamp);
        buf.freeze()
    }

    pub fn decode(data: &[u8]) -> Result<Self, CodecError> {
        if data.len() != REQUEST_HEADER_LEN {
            return Err(bad_header(REQUEST_HEADER_LEN, data.len()));
        }
        let (pid, nonce, req_id, timestamp) = get_common(data);
        Ok(Self {
            pid,
            nonce,
            req_id,
            timestamp,
        })
    }
}

impl ResponseHeader {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(RESPONSE_HEADER_LEN);
        put_common(&mut buf, self.pid, self.nonce, self.req_id, self.timestamp);
        buf.put_u8(u8::from(self.is_error));
        buf.freeze()
    }

    pub fn decode(data: &[u8]) -> Result<Self, CodecError> {
        if data.len() != RESPONSE_HEADER_LEN {
            return Err(bad_header(RESPONSE_HEADER_LEN, data.len()));
        }
        let (pid, nonce, req_id, timestamp) = get_common(data);
        let is_error = match data[16] {
            0 => false,
            1 => true,
            other => return Err(CodecError::Decode(format!("invalid error flag {other}"))),
        };
        Ok(Self {
            pid,
            nonce,
            req_id,
            timestamp,
            is_error,
        })
    }
}

/// `(pid % 2^16, random nonce)` identifying this side of a connection.
fn id_prefix() -> (u16, u16) {
    ((std::process::id() % 0x1_0000) as u16, rand::random::<u16>())
}

fn now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}

type Reply = Result<Value, CallError>;

/// Ids of cancelled calls, oldest first.
#[derive(Default)]
struct Tombstones {
    order: VecDeque<u32>,
    ids: HashSet<u32>,
}

impl Tombstones {
    fn insert(&mut self, req_id: u32) {
        if !self.ids.insert(req_id) {
            return;
        }
        self.order.push_back(req_id);
        if self.order.len() > MAX_TOMBSTONES {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
    }

    fn remove(&mut self, req_id: u32) -> bool {
        if !self.ids.remove(&req_id) {
            return false;
        }
        self.order.retain(|id| *id != req_id);
        true
    }

    fn contains(&self, req_id: u32) -> bool {
        self.ids.contains(&req_id)
    }

    fn clear(&mut self) {
        self.order.clear();
        self.ids.clear();
    }
}

pub(crate) struct ClientProtocol {
    base: ProtocolBase,
    lp: WeakEventLoop,
    codec: Codec,
    error_table: ErrorTable,
    calls: RefCell<HashMap<u32, oneshot::Sender<Reply>>>,
    tombstones: RefCell<Tombstones>,
    counter: Cell<u32>,
    pid: u16,
    nonce: u16,
}

impl ClientProtocol {
    fn new(
        lp: &EventLoop,
        translation_table: Option<TranslationTable>,
        error_table: Option<ErrorTable>,
    ) -> Self {
        let (pid, nonce) = id_prefix();
        Self {
            base: ProtocolBase::default(),
            lp: lp.downgrade(),
            codec: Codec::new(translation_table),
            error_table: error_table.unwrap_or_default(),
            calls: RefCell::new(HashMap::new()),
            tombstones: RefCell::new(Tombstones::default()),
            counter: Cell::new(0),
            pid,
            nonce,
        }
    }

    /// Next request id, wrapping at 2^32 and skipping ids still in the
    /// table or remembered as cancelled.
    fn next_id(&self) -> u32 {
        let calls = self.calls.borrow();
        let tombstones = self.tombstones.borrow();
        loop {
            let id = self.counter.get().wrapping_add(1);
            self.counter.set(id);
            if !calls.contains_key(&id) && !tombstones.contains(id) {
                return id;
            }
        }
    }

    /// Forget an outstanding call whose future gave up waiting.
    fn cancel(&self, req_id: u32) {
        if self.calls.borrow_mut().remove(&req_id).is_some() {
            self.tombstones.borrow_mut().insert(req_id);
        }
    }

    fn decode_reply(&self, msg: &[Bytes]) -> Result<(ResponseHeader, Reply), CodecError> {
        let [header, payload] = msg else {
            return Err(CodecError::Decode(format!("expected 2 frames, got {}", msg.len())));
        };
        let header = ResponseHeader::decode(header)?;
        let value = self.codec.unpack(payload)?;
        if !header.is_error {
            return Ok((header, Ok(value)));
        }
        let mut parts = match value {
            Value::Array(parts) => parts,
            other => return Err(CodecError::unexpected("error triple", &other)),
        };
        let (Some(Value::Str(repr)), Some(Value::Array(args)), Some(Value::Str(type_name)), None) =
            (parts.pop(), parts.pop(), parts.pop(), parts.pop())
        else {
            return Err(CodecError::Decode("malformed error payload".into()));
        };
        Ok((header, Err(self.error_table.translate(&type_name, args, repr))))
    }
}

impl HasBase for ClientProtocol {
    fn base(&self) -> &ProtocolBase {
        &self.base
    }
}

impl Protocol for ClientProtocol {
    fn connection_made(&self, transport: Transport) {
        self.base.connection_made(transport);
    }

    fn connection_lost(&self, exc: Option<io::Error>) {
        let evicted = std::mem::take(&mut *self.calls.borrow_mut());
        self.tombstones.borrow_mut().clear();
        if !evicted.is_empty() {
            debug!(
                calls = evicted.len(),
                error = ?exc,
                "[RPC] Connection lost, cancelling pending calls"
            );
        }
        drop(evicted);
        self.base.connection_lost();
    }

    fn msg_received(&self, msg: Vec<Bytes>) {
        let (header, reply) = match self.decode_reply(&msg) {
            Ok(decoded) => decoded,
            Err(e) => {
                log_malformed("reply", &msg, &e);
                return;
            }
        };
        let req_id = header.req_id;
        let entry = self.calls.borrow_mut().remove(&req_id);
        let Some(tx) = entry else {
            if self.tombstones.borrow_mut().remove(req_id) {
                debug!(
                    req_id,
                    "[RPC] The future for request #{} has been cancelled, skip the received result",
                    req_id
                );
            } else {
                error!(critical = true, req_id, "[RPC] Unknown answer id: {}", req_id);
            }
            return;
        };
        if tx.is_canceled() {
            debug!(
                req_id,
                "[RPC] The future for request #{} has been cancelled, skip the received result",
                req_id
            );
            return;
        }
        trace!(req_id, "[RPC] Reply received");
        let _ = tx.send(reply);
    }
}

/// Client side of the request-reply pattern.
#[derive(Clone)]
pub struct RpcClient {
    service: Service,
    protocol: Rc<ClientProtocol>,
    timeout: Option<Duration>,
}

service_methods!(RpcClient);

impl RpcClient {
    /// Start building a call.
    pub fn call(&self) -> MethodCall<RpcClient> {
        MethodCall::new(self.clone())
    }

    /// Start building a call with its own timeout.
    pub fn with_timeout(&self, timeout: Duration) -> MethodCall<RpcClient> {
        MethodCall::new(RpcClient {
            timeout: Some(timeout),
            ..self.clone()
        })
    }

    /// Default timeout applied to calls.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Calls still waiting for their reply.
    pub fn pending_calls(&self) -> usize {
        self.protocol.calls.borrow().len()
    }

    /// Cancelled calls whose late reply would still be recognised.
    pub fn cancelled_calls(&self) -> usize {
        self.protocol.tombstones.borrow().order.len()
    }

    fn send(&self, name: String, args: Vec<Value>, kwargs: Kwargs) -> Result<CallFuture, CallError> {
        let proto = &self.protocol;
        let transport = proto.base.transport().ok_or(ServiceClosedError)?;
        let args = proto.codec.pack_args(&args)?;
        let kwargs = proto.codec.pack_kwargs(&kwargs)?;

        let req_id = proto.next_id();
        let header = RequestHeader {
            pid: proto.pid,
            nonce: proto.nonce,
            req_id,
            timestamp: now(),
        };
        let (tx, rx) = oneshot::channel();
        proto.calls.borrow_mut().insert(req_id, tx);
        if let Err(e) = transport.write(vec![header.encode(), Bytes::from(name), args, kwargs]) {
            proto.calls.borrow_mut().remove(&req_id);
            return Err(e.into());
        }

        let timeout = match (self.timeout, proto.lp.upgrade()) {
            (Some(delay), Some(lp)) => Some(lp.sleep(delay)),
            _ => None,
        };
        Ok(CallFuture {
            req_id: Some(req_id),
            protocol: Rc::downgrade(proto),
            state: CallState::Waiting { rx, timeout },
        })
    }
}

impl Invoke for RpcClient {
    type Output = CallFuture;

    fn invoke(&self, name: String, args: Vec<Value>, kwargs: Kwargs) -> CallFuture {
        self.send(name, args, kwargs)
            .unwrap_or_else(|e| self.fail(e))
    }

    fn fail(&self, error: CallError) -> CallFuture {
        CallFuture {
            req_id: None,
            protocol: Weak::new(),
            state: CallState::Failed(Some(error)),
        }
    }
}

enum CallState {
    Failed(Option<CallError>),
    Waiting {
        rx: oneshot::Receiver<Reply>,
        timeout: Option<Sleep>,
    },
    Done,
}

/// Completion of one remote call.
///
/// Dropping it before completion cancels the call; the reply, if it ever
/// arrives, is discarded.
#[must_use = "futures do nothing unless polled"]
pub struct CallFuture {
    req_id: Option<u32>,
    protocol: Weak<ClientProtocol>,
    state: CallState,
}

impl CallFuture {
    /// The request id, if the request was sent.
    pub fn request_id(&self) -> Option<u32> {
        self.req_id
    }
}

impl Future for CallFuture {
    type Output = Reply;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Reply> {
        let this = self.get_mut();
        let reply = match &mut this.state {
            CallState::Failed(error) => Err(error.take().unwrap_or(CallError::Cancelled)),
            CallState::Done => Err(CallError::Cancelled),
            CallState::Waiting { rx, timeout } => match Pin::new(&mut *rx).poll(cx) {
                Poll::Ready(Ok(reply)) => reply,
                Poll::Ready(Err(oneshot::Canceled)) => Err(CallError::Cancelled),
                Poll::Pending => match timeout.as_mut().map(|sleep| Pin::new(sleep).poll(cx)) {
                    Some(Poll::Ready(())) => {
                        give_up(this.req_id, &this.protocol);
                        Err(CallError::Timeout)
                    }
                    _ => return Poll::Pending,
                },
            },
        };
        this.state = CallState::Done;
        Poll::Ready(reply)
    }
}

/// Move a still-waiting call to the cancelled list.
fn give_up(req_id: Option<u32>, protocol: &Weak<ClientProtocol>) {
    if let (Some(req_id), Some(protocol)) = (req_id, protocol.upgrade()) {
        protocol.cancel(req_id);
    }
}

impl Drop for CallFuture {
    fn drop(&mut self) {
        if matches!(self.state, CallState::Waiting { .. }) {
            give_up(self.req_id, &self.protocol);
        }
    }
}

/// Connect a request-reply client (DEALER socket).
pub async fn connect_rpc(lp: &EventLoop, config: RpcClientConfig) -> chassis_core::Result<RpcClient> {
    let RpcClientConfig {
        connection,
        translation_table,
        error_table,
        timeout,
    } = config;
    let (_, protocol) = create_connection(
        lp,
        || ClientProtocol::new(lp, translation_table, error_table),
        SocketType::Dealer,
        connection,
    )
    .await?;
    Ok(RpcClient {
        service: Service::new(protocol.clone()),
        protocol,
        timeout,
    })
}

struct ServerProtocol {
    core: Rc<ServerCore>,
    pid: u16,
    nonce: u16,
}

impl HasBase for ServerProtocol {
    fn base(&self) -> &ProtocolBase {
        &self.core.base
    }
}

impl Protocol for ServerProtocol {
    fn connection_made(&self, transport: Transport) {
        self.core.base.connection_made(transport);
    }

    fn connection_lost(&self, _exc: Option<io::Error>) {
        self.core.connection_lost();
    }

    fn msg_received(&self, msg: Vec<Bytes>) {
        let (peer, header, request) = match decode_request(&self.core.codec, &msg) {
            Ok(decoded) => decoded,
            Err(e) => {
                log_malformed("request", &msg, &e);
                return;
            }
        };

        let (outcome, returns) = match self.core.prepare(&request) {
            Ok(prepared) => (prepared.endpoint.invoke(prepared.args), prepared.returns),
            Err(e) => (Outcome::Ready(Err(e)), None),
        };
        let reply = ReplyTo {
            peer,
            req_id: header.req_id,
            pid: self.pid,
            nonce: self.nonce,
        };
        self.core.run(outcome, returns, move |core, result| {
            reply.send(core, &request, result);
        });
    }
}

fn decode_request(codec: &Codec, msg: &[Bytes]) -> Result<(Bytes, RequestHeader, Request), CodecError> {
    let [peer, header, name, args, kwargs] = msg else {
        return Err(CodecError::Decode(format!("expected 5 frames, got {}", msg.len())));
    };
    let header = RequestHeader::decode(header)?;
    let request = Request::decode(codec, name, args, kwargs)?;
    Ok((peer.clone(), header, request))
}

/// Where and how to answer one request.
struct ReplyTo {
    peer: Bytes,
    req_id: u32,
    pid: u16,
    nonce: u16,
}

impl ReplyTo {
    fn send(self, core: &ServerCore, request: &Request, result: Result<Value, HandlerError>) {
        let Some(transport) = core.base.transport() else {
            debug!(req_id = self.req_id, "[RPC] Transport is gone, reply dropped");
            return;
        };
        let packed = match result {
            Ok(value) => core.codec.pack(&value).map_err(HandlerError::from),
            Err(e) => Err(e),
        };
        let (is_error, payload) = match packed {
            Ok(payload) => (false, payload),
            Err(e) => {
                core.try_log(request, &e);
                let payload = core.codec.pack(&e.to_value()).or_else(|_| {
                    let bare = HandlerError::new(e.type_name.clone(), Vec::new(), e.message.clone());
                    core.codec.pack(&bare.to_value())
                });
                match payload {
                    Ok(payload) => (true, payload),
                    Err(pack_error) => {
                        error!(req_id = self.req_id, error = %pack_error, "[RPC] Cannot pack error reply");
                        return;
                    }
                }
            }
        };
        let header = ResponseHeader {
            pid: self.pid,
            nonce: self.nonce,
            req_id: self.req_id,
            timestamp: now(),
            is_error,
        };
        if let Err(e) = transport.write(vec![self.peer, header.encode(), payload]) {
            warn!(req_id = self.req_id, error = %e, "[RPC] Cannot send reply");
        }
    }
}

/// Serve `handler` over request-reply (ROUTER socket).
pub async fn serve_rpc(
    lp: &EventLoop,
    handler: impl Handler + 'static,
    config: RpcServerConfig,
) -> chassis_core::Result<Service> {
    let handler: Rc<dyn Handler> = Rc::new(handler);
    let core = Rc::new(ServerCore::new(lp, handler, &config));
    let (pid, nonce) = id_prefix();
    let (_, protocol) = create_connection(
        lp,
        move || ServerProtocol { core, pid, nonce },
        SocketType::Router,
        config.connection,
    )
    .await?;
    Ok(Service::new(protocol))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{args, kwargs};
    use chassis_core::context::Context as MqContext;

    #[test]
    fn test_header_layout() {
        let header = RequestHeader {
            pid: 0x0102,
            nonce: 0x0304,
            req_id: 7,
            timestamp: 1.5,
        };
        let bytes = header.encode();
        assert_eq!(bytes.len(), REQUEST_HEADER_LEN);
        assert_eq!(&bytes[0..2], &0x0102u16.to_ne_bytes());
        assert_eq!(&bytes[4..8], &7u32.to_ne_bytes());
        assert_eq!(RequestHeader::decode(&bytes).unwrap(), header);
        assert!(RequestHeader::decode(&bytes[..15]).is_err());

        let reply = ResponseHeader {
            pid: 1,
            nonce: 2,
            req_id: u32::MAX,
            timestamp: 2.0,
            is_error: true,
        };
        let bytes = reply.encode();
        assert_eq!(bytes.len(), RESPONSE_HEADER_LEN);
        assert_eq!(bytes[16], 1);
        assert_eq!(ResponseHeader::decode(&bytes).unwrap(), reply);
    }

    #[test]
    fn test_request_ids_are_unique_and_wrap() {
        let lp = EventLoop::new().unwrap();
        let proto = ClientProtocol::new(&lp, None, None);
        let ids: Vec<u32> = (0..1000).map(|_| proto.next_id()).collect();
        let unique: hashbrown::HashSet<u32> = ids.iter().copied().collect();
        assert_eq!(unique.len(), ids.len());
        assert_eq!(ids[0], 1);

        proto.counter.set(u32::MAX);
        assert_eq!(proto.next_id(), 0);
    }

    #[test]
    fn test_outstanding_ids_are_skipped_after_wrap() {
        let lp = EventLoop::new().unwrap();
        let proto = ClientProtocol::new(&lp, None, None);
        let (tx, _rx) = oneshot::channel();
        proto.calls.borrow_mut().insert(0, tx);
        proto.counter.set(u32::MAX);
        assert_eq!(proto.next_id(), 1);
    }

    #[test]
    fn test_call_after_close_fails_immediately() {
        let lp = EventLoop::new().unwrap();
        let ctx = MqContext::memory();
        let client = lp
            .run_until(connect_rpc(&lp, RpcClientConfig::new().context(ctx).connect("inproc://nobody")))
            .unwrap()
            .unwrap();
        client.close();
        lp.run_until(client.wait_closed()).unwrap();

        let fut = client.call().attr("add").call(args![1, 2], kwargs! {});
        assert_eq!(fut.request_id(), None);
        let err = lp.run_until(fut).unwrap().unwrap_err();
        assert!(matches!(err, CallError::ServiceClosed(_)));
        assert!(client.transport().is_err());
    }

    #[test]
    fn test_unknown_and_cancelled_replies_are_dropped() {
        let lp = EventLoop::new().unwrap();
        let proto = ClientProtocol::new(&lp, None, None);
        let codec = Codec::default();
        let reply = |req_id| {
            let header = ResponseHeader {
                pid: 1,
                nonce: 1,
                req_id,
                timestamp: 0.0,
                is_error: false,
            };
            vec![header.encode(), codec.pack(&Value::Int(3)).unwrap()]
        };

        proto.msg_received(reply(99));

        let (tx, rx) = oneshot::channel();
        proto.calls.borrow_mut().insert(5, tx);
        drop(rx);
        proto.msg_received(reply(5));
        assert!(proto.calls.borrow().is_empty());

        let (tx, mut rx) = oneshot::channel();
        proto.calls.borrow_mut().insert(6, tx);
        proto.msg_received(reply(6));
        assert_eq!(rx.try_recv().unwrap().unwrap().unwrap(), Value::Int(3));
    }

    #[test]
    fn test_error_reply_is_translated() {
        let lp = EventLoop::new().unwrap();
        let proto = ClientProtocol::new(&lp, None, None);
        let codec = Codec::default();
        let header = ResponseHeader {
            pid: 1,
            nonce: 1,
            req_id: 1,
            timestamp: 0.0,
            is_error: true,
        };
        let err = HandlerError::from(crate::error::NotFoundError::new("ns.missing"));
        let (tx, mut rx) = oneshot::channel();
        proto.calls.borrow_mut().insert(1, tx);
        proto.msg_received(vec![header.encode(), codec.pack(&err.to_value()).unwrap()]);

        let err = rx.try_recv().unwrap().unwrap().unwrap_err();
        let not_found = err.downcast_ref::<crate::error::NotFoundError>().unwrap();
        assert_eq!(not_found.name, "ns.missing");
    }

    #[test]
    fn test_connection_lost_evicts_calls() {
        let lp = EventLoop::new().unwrap();
        let proto = ClientProtocol::new(&lp, None, None);
        let (tx, rx) = oneshot::channel();
        proto.calls.borrow_mut().insert(1, tx);
        let fut = CallFuture {
            req_id: Some(1),
            protocol: Weak::new(),
            state: CallState::Waiting { rx, timeout: None },
        };
        proto.connection_lost(None);
        assert!(proto.calls.borrow().is_empty());
        assert!(matches!(lp.run_until(fut).unwrap(), Err(CallError::Cancelled)));
        assert!(proto.base.is_closed());
    }

    #[test]
    fn test_cancelled_call_becomes_tombstone() {
        let lp = EventLoop::new().unwrap();
        let proto = Rc::new(ClientProtocol::new(&lp, None, None));
        let (tx, rx) = oneshot::channel();
        proto.calls.borrow_mut().insert(3, tx);
        let fut = CallFuture {
            req_id: Some(3),
            protocol: Rc::downgrade(&proto),
            state: CallState::Waiting { rx, timeout: None },
        };
        drop(fut);
        assert!(proto.calls.borrow().is_empty());
        assert!(proto.tombstones.borrow().contains(3));

        proto.counter.set(2);
        assert_eq!(proto.next_id(), 4);
    }

    #[test]
    fn test_tombstones_are_bounded() {
        let mut tombstones = Tombstones::default();
        for id in 0..(MAX_TOMBSTONES as u32 + 10) {
            tombstones.insert(id);
        }
        assert_eq!(tombstones.order.len(), MAX_TOMBSTONES);
        assert!(!tombstones.contains(9));
        assert!(tombstones.contains(10));
        assert!(tombstones.remove(10));
        assert!(!tombstones.remove(10));
    }
}
