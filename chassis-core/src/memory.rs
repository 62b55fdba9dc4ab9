//! In-memory message-queue backend.
//!
//! [`MemorySocket`] implements [`MqSocket`] with process-local pipes: every
//! connection between two sockets is a pair of bounded `flume` channels whose
//! capacity is the sender's high water mark. Routing follows the usual
//! messaging-pattern rules:
//!
//! - DEALER / PUSH: round-robin over pipes that have room, would-block when
//!   every pipe is full or none is attached
//! - ROUTER: inbound messages are prefixed with the peer's routing id, outbound
//!   messages are routed by their first frame (unknown peer or full pipe: drop)
//! - PUB: fan-out to every SUB peer whose filters match the first frame (full
//!   pipes drop), filtering happens on the publisher side
//! - SUB / PULL: fair-queue inbound
//! - PAIR: exactly one peer
//!
//! Each socket owns a [`Signaler`] that is pinged whenever its readiness may
//! have changed, so the native poller can block on it.
//!
//! Only `inproc://` endpoints exist here; sockets are created through
//! [`Context::memory`](crate::context::Context::memory).

use std::fmt;
use std::io;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use flume::{Receiver, Sender, TryRecvError, TrySendError};
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::endpoint::Endpoint;
use crate::error::native;
use crate::options::{OptionValue, SocketOption, SocketOptions};
use crate::poll::PollFlags;
use crate::registry::{reaches, Registry};
use crate::signaler::Signaler;
use crate::socket::{next_socket_id, MqSocket};
use crate::socket_type::SocketType;
use crate::subscription::SubscriptionTrie;

type Message = Vec<Bytes>;

struct Pipe {
    peer: Weak<MemorySocket>,
    peer_id: u64,
    /// Identity of the peer as seen from this side.
    routing_id: Bytes,
    tx: Sender<Message>,
    rx: Receiver<Message>,
    peer_signaler: Arc<Signaler>,
    /// Filters of a SUB peer, consulted before fan-out.
    peer_subs: Option<Arc<Mutex<SubscriptionTrie>>>,
    /// Endpoint as known on this side (connect string, or resolved bind).
    endpoint: String,
    /// Connect string of the connecting side.
    connect_endpoint: String,
    outgoing: bool,
}

impl Pipe {
    fn is_dead(&self) -> bool {
        self.tx.is_disconnected() && self.rx.is_empty()
    }
}

struct State {
    options: SocketOptions,
    pipes: Vec<Pipe>,
    next_out: usize,
    next_in: usize,
    bound: Vec<String>,
    connected: Vec<String>,
    last_endpoint: String,
    next_peer_id: u32,
}

impl State {
    fn prune(&mut self) {
        self.pipes.retain(|p| !p.is_dead());
    }

    fn auto_routing_id(&mut self) -> Bytes {
        self.next_peer_id = self.next_peer_id.wrapping_add(1);
        let mut id = BytesMut::with_capacity(5);
        id.put_u8(0);
        id.put_u32(self.next_peer_id);
        id.freeze()
    }
}

/// Process-local message-queue socket.
pub struct MemorySocket {
    id: u64,
    socket_type: SocketType,
    me: Weak<MemorySocket>,
    registry: Arc<Registry>,
    signaler: Arc<Signaler>,
    subscriptions: Arc<Mutex<SubscriptionTrie>>,
    closed: AtomicBool,
    state: Mutex<State>,
}

fn closed_error() -> io::Error {
    native(libc::ENOTSOCK)
}

impl MemorySocket {
    pub(crate) fn open(
        registry: Arc<Registry>,
        socket_type: SocketType,
        options: SocketOptions,
    ) -> io::Result<Arc<Self>> {
        let signaler = Arc::new(Signaler::new()?);
        let id = next_socket_id();
        trace!("[MEMORY] created {} socket #{}", socket_type, id);
        Ok(Arc::new_cyclic(|me| Self {
            id,
            socket_type,
            me: me.clone(),
            registry,
            signaler,
            subscriptions: Arc::new(Mutex::new(SubscriptionTrie::new())),
            closed: AtomicBool::new(false),
            state: Mutex::new(State {
                options,
                pipes: Vec::new(),
                next_out: 0,
                next_in: 0,
                bound: Vec::new(),
                connected: Vec::new(),
                last_endpoint: String::new(),
                next_peer_id: 0,
            }),
        }))
    }

    pub(crate) fn id_value(&self) -> u64 {
        self.id
    }

    pub(crate) fn is_closed_flag(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn check_open(&self) -> io::Result<()> {
        if self.is_closed_flag() {
            Err(closed_error())
        } else {
            Ok(())
        }
    }

    fn this(&self) -> io::Result<Arc<MemorySocket>> {
        self.me.upgrade().ok_or_else(closed_error)
    }

    /// Wire `connector` to `binder`.
    ///
    /// Never holds both socket locks at once.
    pub(crate) fn attach(connector: &Arc<MemorySocket>, binder: &Arc<MemorySocket>, raw: &str) {
        if !connector.socket_type.is_compatible(binder.socket_type) {
            debug!(
                "[MEMORY] refusing {} -> {} on {}",
                connector.socket_type, binder.socket_type, raw
            );
            return;
        }
        if connector.is_closed_flag() || binder.is_closed_flag() {
            return;
        }

        let bound_endpoint = {
            let st = binder.state.lock();
            st.bound
                .iter()
                .find(|b| match (Endpoint::parse(raw), Endpoint::parse(b)) {
                    (Ok(t), Ok(b)) => reaches(&t, &b),
                    _ => false,
                })
                .cloned()
                .unwrap_or_else(|| raw.to_string())
        };

        let (c_opts, c_view_of_b, c_pair_busy) = {
            let mut st = connector.state.lock();
            st.prune();
            let busy = connector.socket_type == SocketType::Pair && !st.pipes.is_empty();
            let view = st.auto_routing_id();
            (st.options.clone(), view, busy)
        };
        let (b_opts, b_view_of_c, b_pair_busy) = {
            let mut st = binder.state.lock();
            st.prune();
            let busy = binder.socket_type == SocketType::Pair && !st.pipes.is_empty();
            let view = st.auto_routing_id();
            (st.options.clone(), view, busy)
        };
        if c_pair_busy || b_pair_busy {
            debug!("[MEMORY] PAIR already connected, ignoring {}", raw);
            return;
        }

        let (c_to_b_tx, c_to_b_rx) = flume::bounded(c_opts.send_hwm);
        let (b_to_c_tx, b_to_c_rx) = flume::bounded(b_opts.send_hwm);

        let connector_pipe = Pipe {
            peer: Arc::downgrade(binder),
            peer_id: binder.id,
            routing_id: b_opts.routing_id.clone().unwrap_or(c_view_of_b),
            tx: c_to_b_tx,
            rx: b_to_c_rx,
            peer_signaler: binder.signaler.clone(),
            peer_subs: (binder.socket_type == SocketType::Sub)
                .then(|| binder.subscriptions.clone()),
            endpoint: raw.to_string(),
            connect_endpoint: raw.to_string(),
            outgoing: true,
        };
        let binder_pipe = Pipe {
            peer: Arc::downgrade(connector),
            peer_id: connector.id,
            routing_id: c_opts.routing_id.clone().unwrap_or(b_view_of_c),
            tx: b_to_c_tx,
            rx: c_to_b_rx,
            peer_signaler: connector.signaler.clone(),
            peer_subs: (connector.socket_type == SocketType::Sub)
                .then(|| connector.subscriptions.clone()),
            endpoint: bound_endpoint,
            connect_endpoint: raw.to_string(),
            outgoing: false,
        };

        connector.state.lock().pipes.push(connector_pipe);
        binder.state.lock().pipes.push(binder_pipe);
        trace!(
            "[MEMORY] attached #{} ({}) -> #{} ({}) via {}",
            connector.id, connector.socket_type, binder.id, binder.socket_type, raw
        );
        connector.signaler.signal();
        binder.signaler.signal();
    }

    /// Detach pipes matching `pred`, waking peers and re-parking connectors
    /// whose bound side went away.
    fn detach_where(&self, pred: impl Fn(&Pipe) -> bool) {
        let removed: Vec<Pipe> = {
            let mut st = self.state.lock();
            let (gone, kept): (Vec<Pipe>, Vec<Pipe>) =
                std::mem::take(&mut st.pipes).into_iter().partition(|p| pred(p));
            st.pipes = kept;
            gone
        };
        for pipe in removed {
            let Pipe {
                peer,
                peer_signaler,
                connect_endpoint,
                outgoing,
                tx,
                rx,
                ..
            } = pipe;
            drop((tx, rx));
            peer_signaler.signal();
            if !outgoing {
                if let Some(peer) = peer.upgrade() {
                    peer.drop_pipe_to(self.id);
                    let still_wanted = peer.state.lock().connected.contains(&connect_endpoint);
                    if still_wanted && !peer.is_closed_flag() {
                        self.registry.requeue(&connect_endpoint, &peer);
                    }
                }
            }
        }
    }

    /// Remove the (now disconnected) pipe to `peer_id` once its backlog is gone.
    fn drop_pipe_to(&self, peer_id: u64) {
        let mut st = self.state.lock();
        st.pipes.retain(|p| !(p.peer_id == peer_id && p.is_dead()));
    }

    fn send_round_robin(st: &mut State, frames: &[Bytes]) -> io::Result<()> {
        let n = st.pipes.len();
        for step in 0..n {
            let idx = (st.next_out + step) % n;
            let pipe = &st.pipes[idx];
            match pipe.tx.try_send(frames.to_vec()) {
                Ok(()) => {
                    pipe.peer_signaler.signal();
                    st.next_out = idx + 1;
                    return Ok(());
                }
                Err(TrySendError::Full(_) | TrySendError::Disconnected(_)) => continue,
            }
        }
        Err(native(libc::EAGAIN))
    }

    fn send_routed(st: &mut State, frames: &[Bytes]) -> io::Result<()> {
        let Some((identity, body)) = frames.split_first() else {
            return Err(native(libc::EINVAL));
        };
        let mandatory = st.options.router_mandatory;
        let Some(pipe) = st.pipes.iter().find(|p| p.routing_id == *identity) else {
            if mandatory {
                return Err(native(libc::EHOSTUNREACH));
            }
            trace!("[MEMORY] ROUTER dropping message for unknown peer");
            return Ok(());
        };
        match pipe.tx.try_send(body.to_vec()) {
            Ok(()) => pipe.peer_signaler.signal(),
            Err(TrySendError::Full(_)) if mandatory => return Err(native(libc::EAGAIN)),
            Err(_) => trace!("[MEMORY] ROUTER dropping message, peer pipe unavailable"),
        }
        Ok(())
    }

    fn send_fan_out(st: &mut State, frames: &[Bytes]) {
        let topic: &[u8] = frames.first().map_or(&[], |f| &f[..]);
        for pipe in &st.pipes {
            let wanted = pipe
                .peer_subs
                .as_ref()
                .is_some_and(|subs| subs.lock().matches(topic));
            if !wanted {
                continue;
            }
            match pipe.tx.try_send(frames.to_vec()) {
                Ok(()) => pipe.peer_signaler.signal(),
                Err(_) => trace!("[MEMORY] PUB dropping message for slow subscriber"),
            }
        }
    }

    fn writable(&self, st: &State) -> bool {
        match self.socket_type {
            SocketType::Router | SocketType::Pub => true,
            SocketType::Dealer | SocketType::Push | SocketType::Pair => st
                .pipes
                .iter()
                .any(|p| !p.tx.is_disconnected() && !p.tx.is_full()),
            SocketType::Sub | SocketType::Pull => false,
        }
    }
}

impl MqSocket for MemorySocket {
    fn id(&self) -> u64 {
        self.id
    }

    fn socket_type(&self) -> SocketType {
        self.socket_type
    }

    fn fd(&self) -> io::Result<RawFd> {
        self.check_open()?;
        self.signaler.fd()
    }

    fn events(&self) -> io::Result<PollFlags> {
        self.check_open()?;
        self.signaler.drain();
        let mut st = self.state.lock();
        st.prune();
        let mut flags = PollFlags::NONE;
        if self.socket_type.can_recv() && st.pipes.iter().any(|p| !p.rx.is_empty()) {
            flags |= PollFlags::POLLIN;
        }
        if self.writable(&st) {
            flags |= PollFlags::POLLOUT;
        }
        Ok(flags)
    }

    fn send_multipart(&self, frames: &[Bytes]) -> io::Result<()> {
        self.check_open()?;
        if !self.socket_type.can_send() {
            return Err(native(libc::ENOTSUP));
        }
        if frames.is_empty() {
            return Err(native(libc::EINVAL));
        }
        let mut st = self.state.lock();
        st.prune();
        match self.socket_type {
            SocketType::Dealer | SocketType::Push | SocketType::Pair => {
                Self::send_round_robin(&mut st, frames)
            }
            SocketType::Router => Self::send_routed(&mut st, frames),
            SocketType::Pub => {
                Self::send_fan_out(&mut st, frames);
                Ok(())
            }
            SocketType::Sub | SocketType::Pull => Err(native(libc::ENOTSUP)),
        }
    }

    fn recv_multipart(&self) -> io::Result<Vec<Bytes>> {
        self.check_open()?;
        if !self.socket_type.can_recv() {
            return Err(native(libc::ENOTSUP));
        }
        let mut st = self.state.lock();
        let n = st.pipes.len();
        for step in 0..n {
            let idx = (st.next_in + step) % n;
            let pipe = &st.pipes[idx];
            match pipe.rx.try_recv() {
                Ok(mut msg) => {
                    pipe.peer_signaler.signal();
                    if self.socket_type == SocketType::Router {
                        msg.insert(0, pipe.routing_id.clone());
                    }
                    st.next_in = idx + 1;
                    return Ok(msg);
                }
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => continue,
            }
        }
        st.prune();
        Err(native(libc::EAGAIN))
    }

    fn bind(&self, endpoint: &str) -> io::Result<String> {
        self.check_open()?;
        let me = self.this()?;
        let (resolved, satisfied) = self.registry.bind(endpoint, &me)?;
        {
            let mut st = self.state.lock();
            st.bound.push(resolved.clone());
            st.last_endpoint = resolved.clone();
        }
        debug!("[MEMORY] #{} bound {}", self.id, resolved);
        for pending in satisfied {
            if let Some(connector) = pending.socket.upgrade() {
                MemorySocket::attach(&connector, &me, &pending.raw);
            }
        }
        Ok(resolved)
    }

    fn unbind(&self, endpoint: &str) -> io::Result<()> {
        self.check_open()?;
        {
            let mut st = self.state.lock();
            let pos = st
                .bound
                .iter()
                .position(|b| b == endpoint)
                .ok_or_else(|| native(libc::ENOENT))?;
            st.bound.remove(pos);
        }
        self.registry.unbind(endpoint);
        self.detach_where(|p| !p.outgoing && p.endpoint == endpoint);
        debug!("[MEMORY] #{} unbound {}", self.id, endpoint);
        Ok(())
    }

    fn connect(&self, endpoint: &str) -> io::Result<()> {
        self.check_open()?;
        let me = self.this()?;
        let found = self.registry.connect(endpoint, &me)?;
        self.state.lock().connected.push(endpoint.to_string());
        match found {
            Some(binder) => MemorySocket::attach(&me, &binder, endpoint),
            None => debug!("[MEMORY] #{} waiting for {} to be bound", self.id, endpoint),
        }
        Ok(())
    }

    fn disconnect(&self, endpoint: &str) -> io::Result<()> {
        self.check_open()?;
        {
            let mut st = self.state.lock();
            let pos = st
                .connected
                .iter()
                .position(|c| c == endpoint)
                .ok_or_else(|| native(libc::ENOENT))?;
            st.connected.remove(pos);
        }
        self.registry.cancel_pending(self.id, Some(endpoint));
        self.detach_where(|p| p.outgoing && p.endpoint == endpoint);
        Ok(())
    }

    fn get_option(&self, option: SocketOption) -> io::Result<OptionValue> {
        self.check_open()?;
        if option == SocketOption::Events {
            return self.events().map(|ev| OptionValue::Int(i64::from(ev.bits())));
        }
        let st = self.state.lock();
        let value = match option {
            SocketOption::Type => OptionValue::Int(self.socket_type.as_raw()),
            SocketOption::LastEndpoint => OptionValue::Str(st.last_endpoint.clone()),
            SocketOption::SendHwm => OptionValue::Int(st.options.send_hwm as i64),
            SocketOption::RecvHwm => OptionValue::Int(st.options.recv_hwm as i64),
            SocketOption::RoutingId => {
                OptionValue::Bytes(st.options.routing_id.clone().unwrap_or_default())
            }
            SocketOption::Linger => OptionValue::Int(
                st.options
                    .linger
                    .map_or(-1, |d| d.as_millis().min(i64::MAX as u128) as i64),
            ),
            SocketOption::RouterMandatory => OptionValue::Int(i64::from(st.options.router_mandatory)),
            SocketOption::Fd => OptionValue::Int(i64::from(self.signaler.fd()?)),
            SocketOption::Subscribe | SocketOption::Unsubscribe | SocketOption::Events => {
                return Err(native(libc::EINVAL))
            }
        };
        Ok(value)
    }

    fn set_option(&self, option: SocketOption, value: OptionValue) -> io::Result<()> {
        self.check_open()?;
        match option {
            SocketOption::Subscribe | SocketOption::Unsubscribe => {
                if self.socket_type != SocketType::Sub {
                    return Err(native(libc::EINVAL));
                }
                let filter = value.as_bytes()?;
                let mut subs = self.subscriptions.lock();
                if option == SocketOption::Subscribe {
                    subs.subscribe(filter);
                } else {
                    subs.unsubscribe(&filter);
                }
                return Ok(());
            }
            _ => {}
        }

        let mut st = self.state.lock();
        match option {
            SocketOption::SendHwm | SocketOption::RecvHwm => {
                let hwm = usize::try_from(value.as_int()?).map_err(|_| native(libc::EINVAL))?;
                if option == SocketOption::SendHwm {
                    st.options.send_hwm = hwm.max(1);
                } else {
                    st.options.recv_hwm = hwm.max(1);
                }
            }
            SocketOption::RoutingId => {
                let id = value.as_bytes()?;
                SocketOptions::validate_routing_id(&id)?;
                st.options.routing_id = Some(id);
            }
            SocketOption::Linger => {
                let ms = value.as_int()?;
                st.options.linger = match ms {
                    -1 => None,
                    ms if ms >= 0 => Some(Duration::from_millis(ms as u64)),
                    _ => return Err(native(libc::EINVAL)),
                };
            }
            SocketOption::RouterMandatory => {
                st.options.router_mandatory = value.as_int()? != 0;
            }
            _ => return Err(native(libc::EINVAL)),
        }
        Ok(())
    }

    fn close(&self) -> io::Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let bound = {
            let mut st = self.state.lock();
            st.connected.clear();
            std::mem::take(&mut st.bound)
        };
        for endpoint in &bound {
            self.registry.unbind(endpoint);
        }
        self.registry.cancel_pending(self.id, None);
        self.detach_where(|_| true);
        self.signaler.signal();
        self.signaler.close();
        debug!("[MEMORY] closed {} socket #{}", self.socket_type, self.id);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.is_closed_flag()
    }
}

impl fmt::Debug for MemorySocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemorySocket")
            .field("id", &self.id)
            .field("type", &self.socket_type)
            .field("closed", &self.is_closed_flag())
            .finish()
    }
}

impl Drop for MemorySocket {
    fn drop(&mut self) {
        if !self.is_closed_flag() {
            let bound = std::mem::take(&mut self.state.get_mut().bound);
            for endpoint in &bound {
                self.registry.unbind(endpoint);
            }
        }
    }
}
