//! Message transport over one message-queue socket.
//!
//! A [`Transport`] owns exactly one [`MqSocket`] and mediates all I/O on it
//! for a [`Protocol`]:
//!
//! - **Reads** are readiness driven: each readable event receives one whole
//!   multi-part message and hands it to `Protocol::msg_received`.
//! - **Writes** try an immediate non-blocking send while the buffer is empty.
//!   Otherwise the message is queued (FIFO) and drained by the writer
//!   callback.
//! - **Flow control** notifies the protocol once when buffered bytes cross the
//!   high-water mark (`pause_writing`) and once when they drop back to the
//!   low-water mark (`resume_writing`).
//!
//! # States
//!
//! `Open` → `Closing` on [`Transport::close`]; `Closing` → `Closed` once the
//! buffer is drained. [`Transport::abort`] and fatal I/O errors discard the
//! buffer and schedule `connection_lost` for the next loop turn.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::rc::Rc;
use std::sync::Arc;

use bytes::Bytes;
use futures::channel::oneshot;
use hashbrown::HashSet;
use tracing::{debug, trace};

use crate::endpoint::Endpoint;
use crate::error::{Error, Result};
use crate::options::{OptionValue, SocketOption};
use crate::poll::Handle;
use crate::reactor::{ErrorContext, EventLoop};
use crate::socket::{message_len, MqSocket};
use crate::socket_type::SocketType;

/// Default high-water mark of the write buffer, in bytes.
pub const DEFAULT_HIGH_WATER: usize = 64 * 1024;

/// Callbacks a transport delivers to its protocol.
///
/// All methods take `&self`: a protocol may call back into its transport
/// (for example write from `msg_received`) while being notified.
pub trait Protocol: 'static {
    /// The transport is wired and ready.
    fn connection_made(&self, transport: Transport);

    /// The transport is gone; `None` for a clean close.
    fn connection_lost(&self, exc: Option<io::Error>);

    /// One whole multi-part message arrived.
    fn msg_received(&self, msg: Vec<Bytes>);

    /// Buffered bytes crossed the high-water mark.
    fn pause_writing(&self) {}

    /// Buffered bytes dropped to the low-water mark.
    fn resume_writing(&self) {}

    /// Name used in error reports.
    fn protocol_name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Open,
    Closing,
    Closed,
}

/// Flow-control thresholds of the write buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteBufferLimits {
    pub high: usize,
    pub low: usize,
}

impl Default for WriteBufferLimits {
    fn default() -> Self {
        Self {
            high: DEFAULT_HIGH_WATER,
            low: DEFAULT_HIGH_WATER / 4,
        }
    }
}

impl WriteBufferLimits {
    /// Derive limits the usual way: a missing `high` is `4 * low` (or the
    /// default), a missing `low` is `high / 4`.
    pub fn new(high: Option<usize>, low: Option<usize>) -> Result<Self> {
        let high = match (high, low) {
            (Some(high), _) => high,
            (None, Some(low)) => low.saturating_mul(4),
            (None, None) => DEFAULT_HIGH_WATER,
        };
        let low = low.unwrap_or(high / 4);
        if low > high {
            return Err(Error::invalid_argument(format!(
                "high ({high}) must be >= low ({low}) must be >= 0"
            )));
        }
        Ok(Self { high, low })
    }
}

struct TransportInner {
    lp: RefCell<Option<EventLoop>>,
    socket: Arc<dyn MqSocket>,
    handle: Handle,
    socket_type: SocketType,
    protocol: RefCell<Option<Rc<dyn Protocol>>>,
    protocol_name: &'static str,
    buffer: RefCell<VecDeque<(usize, Vec<Bytes>)>>,
    buffer_size: Cell<usize>,
    limits: Cell<WriteBufferLimits>,
    closing: Cell<bool>,
    closed: Cell<bool>,
    conn_lost: Cell<u32>,
    paused: Cell<bool>,
    protocol_paused: Cell<bool>,
    bindings: RefCell<HashSet<String>>,
    connections: RefCell<HashSet<String>>,
    subscriptions: RefCell<HashSet<Bytes>>,
}

/// Shared handle to a message transport.
#[derive(Clone)]
pub struct Transport {
    inner: Rc<TransportInner>,
}

/// Copy an I/O error (the original goes to the protocol, the copy to the
/// exception handler).
fn copy_error(e: &io::Error) -> io::Error {
    match e.raw_os_error() {
        Some(errno) => io::Error::from_raw_os_error(errno),
        None => io::Error::new(e.kind(), e.to_string()),
    }
}

/// Retry a socket call while it reports an interrupt.
fn retry_interrupted<T>(mut op: impl FnMut() -> io::Result<T>) -> io::Result<T> {
    loop {
        match op() {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            other => return other,
        }
    }
}

impl Transport {
    /// Wire `socket` to `protocol` on `lp`.
    ///
    /// Registers for readability immediately and schedules
    /// `connection_made` (then `waiter`) for the next loop turn.
    pub fn new(
        lp: &EventLoop,
        socket: Arc<dyn MqSocket>,
        protocol: Rc<dyn Protocol>,
        waiter: Option<oneshot::Sender<()>>,
    ) -> Result<Self> {
        let transport = Self {
            inner: Rc::new(TransportInner {
                lp: RefCell::new(Some(lp.clone())),
                handle: Handle::Socket(socket.clone()),
                socket_type: socket.socket_type(),
                socket,
                protocol_name: protocol.protocol_name(),
                protocol: RefCell::new(Some(protocol.clone())),
                buffer: RefCell::new(VecDeque::new()),
                buffer_size: Cell::new(0),
                limits: Cell::new(WriteBufferLimits::default()),
                closing: Cell::new(false),
                closed: Cell::new(false),
                conn_lost: Cell::new(0),
                paused: Cell::new(false),
                protocol_paused: Cell::new(false),
                bindings: RefCell::new(HashSet::new()),
                connections: RefCell::new(HashSet::new()),
                subscriptions: RefCell::new(HashSet::new()),
            }),
        };

        lp.add_reader(transport.inner.handle.clone(), transport.callback(Self::read_ready))?;
        let made = transport.clone();
        lp.call_soon(move || protocol.connection_made(made));
        if let Some(waiter) = waiter {
            lp.call_soon(move || {
                let _ = waiter.send(());
            });
        }
        trace!("[TRANSPORT] created over {:?}", transport.inner.handle);
        Ok(transport)
    }

    /// Loop callback holding only a weak reference to the transport.
    fn callback(&self, f: fn(&Transport)) -> impl Fn() + 'static {
        let weak = Rc::downgrade(&self.inner);
        move || {
            if let Some(inner) = weak.upgrade() {
                f(&Transport { inner });
            }
        }
    }

    fn event_loop(&self) -> Option<EventLoop> {
        self.inner.lp.borrow().clone()
    }

    fn protocol(&self) -> Option<Rc<dyn Protocol>> {
        self.inner.protocol.borrow().clone()
    }

    fn add_reader(&self) {
        if let Some(lp) = self.event_loop() {
            if let Err(e) = lp.add_reader(self.inner.handle.clone(), self.callback(Self::read_ready)) {
                debug!("[TRANSPORT] add_reader failed: {}", e);
            }
        }
    }

    fn remove_reader(&self) {
        if let Some(lp) = self.event_loop() {
            if let Err(e) = lp.remove_reader(&self.inner.handle) {
                debug!("[TRANSPORT] remove_reader failed: {}", e);
            }
        }
    }

    fn add_writer(&self) {
        if let Some(lp) = self.event_loop() {
            if let Err(e) = lp.add_writer(self.inner.handle.clone(), self.callback(Self::write_ready)) {
                debug!("[TRANSPORT] add_writer failed: {}", e);
            }
        }
    }

    fn remove_writer(&self) {
        if let Some(lp) = self.event_loop() {
            if let Err(e) = lp.remove_writer(&self.inner.handle) {
                debug!("[TRANSPORT] remove_writer failed: {}", e);
            }
        }
    }

    pub fn state(&self) -> TransportState {
        if self.inner.closed.get() {
            TransportState::Closed
        } else if self.inner.closing.get() {
            TransportState::Closing
        } else {
            TransportState::Open
        }
    }

    pub fn is_closing(&self) -> bool {
        self.inner.closing.get()
    }

    pub fn socket_type(&self) -> SocketType {
        self.inner.socket_type
    }

    /// The underlying socket.
    pub fn socket(&self) -> Arc<dyn MqSocket> {
        self.inner.socket.clone()
    }

    /// Whether the two handles refer to the same transport.
    pub fn ptr_eq(&self, other: &Transport) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    // ---- writing ----

    /// Send a message, or buffer it if the socket cannot take it now.
    ///
    /// Empty messages are ignored. Writing to a closed transport is an error;
    /// native send failures are fatal to the transport and are not returned.
    pub fn write(&self, msg: Vec<Bytes>) -> Result<()> {
        if msg.is_empty() {
            return Ok(());
        }
        if self.inner.closed.get() {
            return Err(Error::Closed);
        }
        let len = message_len(&msg);

        if self.inner.buffer.borrow().is_empty() {
            match self.inner.socket.send_multipart(&msg) {
                Ok(()) => return Ok(()),
                Err(e) if crate::error::is_retryable(&e) => self.add_writer(),
                Err(e) => {
                    self.fatal_error(e, "Fatal write error on zmq socket transport");
                    return Ok(());
                }
            }
        }

        self.inner.buffer.borrow_mut().push_back((len, msg));
        self.inner.buffer_size.set(self.inner.buffer_size.get() + len);
        self.maybe_pause_protocol();
        Ok(())
    }

    fn write_ready(&self) {
        let Some((len, msg)) = self.inner.buffer.borrow_mut().pop_front() else {
            self.remove_writer();
            return;
        };
        match self.inner.socket.send_multipart(&msg) {
            Err(e) if crate::error::is_retryable(&e) => {
                self.inner.buffer.borrow_mut().push_front((len, msg));
            }
            Err(e) => self.fatal_error(e, "Fatal write error on zmq socket transport"),
            Ok(()) => {
                self.inner.buffer_size.set(self.inner.buffer_size.get() - len);
                self.maybe_resume_protocol();
                if self.inner.buffer.borrow().is_empty() {
                    self.remove_writer();
                    if self.inner.closing.get() {
                        self.call_connection_lost(None);
                    }
                }
            }
        }
    }

    /// Bytes currently buffered.
    pub fn get_write_buffer_size(&self) -> usize {
        self.inner.buffer_size.get()
    }

    pub fn get_write_buffer_limits(&self) -> WriteBufferLimits {
        self.inner.limits.get()
    }

    /// Set the flow-control thresholds; see [`WriteBufferLimits::new`].
    pub fn set_write_buffer_limits(&self, high: Option<usize>, low: Option<usize>) -> Result<()> {
        self.inner.limits.set(WriteBufferLimits::new(high, low)?);
        self.maybe_pause_protocol();
        Ok(())
    }

    fn maybe_pause_protocol(&self) {
        if self.get_write_buffer_size() <= self.inner.limits.get().high {
            return;
        }
        if !self.inner.protocol_paused.replace(true) {
            if let Some(protocol) = self.protocol() {
                protocol.pause_writing();
            }
        }
    }

    fn maybe_resume_protocol(&self) {
        if self.inner.protocol_paused.get()
            && self.get_write_buffer_size() <= self.inner.limits.get().low
        {
            self.inner.protocol_paused.set(false);
            if let Some(protocol) = self.protocol() {
                protocol.resume_writing();
            }
        }
    }

    // ---- reading ----

    fn read_ready(&self) {
        match self.inner.socket.recv_multipart() {
            Ok(msg) => {
                if let Some(protocol) = self.protocol() {
                    protocol.msg_received(msg);
                }
            }
            Err(e) if crate::error::is_retryable(&e) => {}
            Err(e) => self.fatal_error(e, "Fatal read error on zmq socket transport"),
        }
    }

    pub fn pause_reading(&self) -> Result<()> {
        if self.inner.closing.get() {
            return Err(Error::invalid_state("Cannot pause_reading() when closing"));
        }
        if self.inner.paused.get() {
            return Err(Error::invalid_state("Already paused"));
        }
        self.inner.paused.set(true);
        self.remove_reader();
        Ok(())
    }

    pub fn resume_reading(&self) -> Result<()> {
        if !self.inner.paused.get() {
            return Err(Error::invalid_state("Not paused"));
        }
        self.inner.paused.set(false);
        if self.inner.closing.get() {
            return Ok(());
        }
        self.add_reader();
        Ok(())
    }

    // ---- closing ----

    /// Close once the buffer is drained. Calling it again is a no-op.
    pub fn close(&self) {
        if self.inner.closing.replace(true) {
            return;
        }
        if !self.inner.paused.get() {
            self.remove_reader();
        }
        if self.inner.buffer.borrow().is_empty() {
            self.inner.conn_lost.set(self.inner.conn_lost.get() + 1);
            self.schedule_connection_lost(None);
        }
    }

    /// Close immediately, discarding buffered messages.
    pub fn abort(&self) {
        self.force_close(None);
    }

    fn force_close(&self, exc: Option<io::Error>) {
        if self.inner.conn_lost.get() > 0 {
            return;
        }
        if !self.inner.buffer.borrow().is_empty() {
            self.inner.buffer.borrow_mut().clear();
            self.inner.buffer_size.set(0);
            self.remove_writer();
        }
        if !self.inner.closing.replace(true) && !self.inner.paused.get() {
            self.remove_reader();
        }
        self.inner.conn_lost.set(self.inner.conn_lost.get() + 1);
        self.schedule_connection_lost(exc);
    }

    fn fatal_error(&self, exc: io::Error, message: &str) {
        if let Some(lp) = self.event_loop() {
            lp.call_exception_handler(ErrorContext {
                message: message.to_string(),
                error: Some(copy_error(&exc)),
                transport: Some(format!("{self:?}")),
                protocol: Some(self.inner.protocol_name.to_string()),
            });
        }
        self.force_close(Some(exc));
    }

    fn schedule_connection_lost(&self, exc: Option<io::Error>) {
        match self.event_loop() {
            Some(lp) => {
                let transport = self.clone();
                lp.call_soon(move || transport.call_connection_lost(exc));
            }
            None => self.call_connection_lost(exc),
        }
    }

    fn call_connection_lost(&self, exc: Option<io::Error>) {
        if self.inner.closed.replace(true) {
            return;
        }
        let protocol = self.inner.protocol.borrow_mut().take();
        if let Some(protocol) = protocol {
            protocol.connection_lost(exc);
        }
        self.remove_reader();
        self.remove_writer();
        if !self.inner.socket.is_closed() {
            if let Err(e) = self.inner.socket.close() {
                debug!("[TRANSPORT] error closing socket: {}", e);
            }
        }
        self.inner.lp.borrow_mut().take();
        debug!("[TRANSPORT] {:?} closed", self.inner.handle);
    }

    // ---- endpoints ----

    /// Bind and return the endpoint with wildcards resolved.
    pub fn bind(&self, endpoint: &str) -> Result<String> {
        self.inner.socket.bind(endpoint)?;
        let real = match self.getsockopt(SocketOption::LastEndpoint)? {
            OptionValue::Str(s) => s.trim_end_matches('\0').to_string(),
            other => other.to_string(),
        };
        self.inner.bindings.borrow_mut().insert(real.clone());
        Ok(real)
    }

    pub fn unbind(&self, endpoint: &str) -> Result<()> {
        self.inner.socket.unbind(endpoint)?;
        self.inner.bindings.borrow_mut().remove(endpoint);
        Ok(())
    }

    pub fn bindings(&self) -> HashSet<String> {
        self.inner.bindings.borrow().clone()
    }

    /// Connect to `endpoint`.
    ///
    /// Unicast endpoints must name a literal IPv4/IPv6 address.
    pub fn connect(&self, endpoint: &str) -> Result<String> {
        if endpoint.starts_with("tcp://") {
            if let Ok(parsed) = Endpoint::parse(endpoint) {
                parsed.check_connectable()?;
            }
        }
        self.inner.socket.connect(endpoint)?;
        self.inner.connections.borrow_mut().insert(endpoint.to_string());
        Ok(endpoint.to_string())
    }

    pub fn disconnect(&self, endpoint: &str) -> Result<()> {
        self.inner.socket.disconnect(endpoint)?;
        self.inner.connections.borrow_mut().remove(endpoint);
        Ok(())
    }

    pub fn connections(&self) -> HashSet<String> {
        self.inner.connections.borrow().clone()
    }

    // ---- subscriptions ----

    fn check_sub(&self) -> Result<()> {
        if self.inner.socket_type != SocketType::Sub {
            return Err(Error::not_supported("Not supported ZMQ socket type"));
        }
        Ok(())
    }

    /// Add a prefix filter (SUB only). Subscribing twice is a no-op.
    pub fn subscribe(&self, filter: impl Into<Bytes>) -> Result<()> {
        self.check_sub()?;
        let filter = filter.into();
        if self.inner.subscriptions.borrow().contains(&filter) {
            return Ok(());
        }
        self.setsockopt(SocketOption::Subscribe, OptionValue::Bytes(filter))
    }

    /// Remove a prefix filter (SUB only). Unknown filters are ignored.
    pub fn unsubscribe(&self, filter: impl Into<Bytes>) -> Result<()> {
        self.check_sub()?;
        let filter = filter.into();
        if !self.inner.subscriptions.borrow().contains(&filter) {
            return Ok(());
        }
        self.setsockopt(SocketOption::Unsubscribe, OptionValue::Bytes(filter))
    }

    pub fn subscriptions(&self) -> HashSet<Bytes> {
        self.inner.subscriptions.borrow().clone()
    }

    // ---- options ----

    pub fn getsockopt(&self, option: SocketOption) -> Result<OptionValue> {
        Ok(retry_interrupted(|| self.inner.socket.get_option(option))?)
    }

    /// Set an option; `Subscribe`/`Unsubscribe` also update the tracked set.
    pub fn setsockopt(&self, option: SocketOption, value: OptionValue) -> Result<()> {
        retry_interrupted(|| self.inner.socket.set_option(option, value.clone()))?;
        match option {
            SocketOption::Subscribe => {
                self.inner.subscriptions.borrow_mut().insert(value.as_bytes()?);
            }
            SocketOption::Unsubscribe => {
                self.inner.subscriptions.borrow_mut().remove(&value.as_bytes()?);
            }
            _ => {}
        }
        Ok(())
    }
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport")
            .field("socket", &self.inner.handle)
            .field("state", &self.state())
            .field("buffer_size", &self.get_write_buffer_size())
            .field("paused", &self.inner.paused.get())
            .finish()
    }
}
