//! Single-threaded event loop on a tokio current-thread runtime.
//!
//! [`EventLoop`] owns a current-thread [`Runtime`] and a [`LocalSet`], and
//! layers the callback-style API the transports need on top of them:
//!
//! - **callbacks**: `call_soon` queues a closure for the next turn, `call_later`
//!   after a delay
//! - **tasks**: `spawn_local` runs a `!Send` future on the local set, returning
//!   an abortable [`JoinHandle`]
//! - **timers**: `sleep` wraps `tokio::time::sleep`
//! - **I/O**: `add_reader`/`add_writer` attach callbacks to a [`Handle`]
//!   through the [`Selector`]
//!
//! While `run_until` drives the caller's future, a dispatcher runs next to it:
//! it runs queued callbacks, level-checks the selector without blocking and
//! queues the reader/writer callbacks of ready handles. With nothing to do it
//! parks on the notification descriptors of the registered handles, each
//! wrapped in an [`AsyncFd`], until one of them or a new callback wakes it.
//!
//! Sockets created for the loop (see [`crate::connection`]) are tracked and
//! closed together by [`EventLoop::close`].

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use std::time::{Duration, Instant};

use futures::future::{self, FutureExt, LocalBoxFuture};
use hashbrown::HashMap;
use tokio::io::unix::AsyncFd;
use tokio::runtime::{Builder, Runtime};
use tokio::sync::Notify;
use tokio::task::LocalSet;
use tracing::{debug, error, trace};

pub use futures::future::Aborted;

use crate::error::{Error, Result};
use crate::poll::Handle;
use crate::selector::{Interest, Selector};
use crate::socket::MqSocket;

type Callback = Box<dyn FnOnce()>;

/// Callback attached to a readiness event.
///
/// A removed callback is marked cancelled so that an invocation already
/// queued for this turn does not run.
pub struct IoCallback {
    cb: Box<dyn Fn()>,
    cancelled: Cell<bool>,
}

impl IoCallback {
    fn new(cb: impl Fn() + 'static) -> Rc<Self> {
        Rc::new(Self {
            cb: Box::new(cb),
            cancelled: Cell::new(false),
        })
    }

    fn run(&self) {
        if !self.cancelled.get() {
            (self.cb)();
        }
    }
}

/// Selector data: the reader and writer attached to one handle.
#[derive(Clone, Default)]
pub struct IoHandlers {
    reader: Option<Rc<IoCallback>>,
    writer: Option<Rc<IoCallback>>,
}

impl IoHandlers {
    fn interest(&self) -> Interest {
        let mut events = Interest::NONE;
        if self.reader.is_some() {
            events = events | Interest::READ;
        }
        if self.writer.is_some() {
            events = events | Interest::WRITE;
        }
        events
    }
}

/// Context handed to the exception handler.
#[derive(Debug, Default)]
pub struct ErrorContext {
    pub message: String,
    pub error: Option<io::Error>,
    pub transport: Option<String>,
    pub protocol: Option<String>,
}

type ExceptionHandler = Rc<dyn Fn(&EventLoop, &ErrorContext)>;

/// Default exception handler: log the context at error level.
pub fn default_exception_handler(_lp: &EventLoop, context: &ErrorContext) {
    error!(
        error = ?context.error,
        transport = context.transport.as_deref().unwrap_or("-"),
        protocol = context.protocol.as_deref().unwrap_or("-"),
        "{}",
        context.message
    );
}

/// A descriptor registered with the runtime's reactor. Not owned: closing
/// stays with the socket or the caller.
struct WatchedFd(RawFd);

impl AsRawFd for WatchedFd {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

struct Watch {
    fd: Rc<AsyncFd<WatchedFd>>,
    interest: tokio::io::Interest,
}

fn runtime_interest(events: Interest) -> tokio::io::Interest {
    match (events.is_readable(), events.is_writable()) {
        (false, true) => tokio::io::Interest::WRITABLE,
        (true, true) => tokio::io::Interest::READABLE | tokio::io::Interest::WRITABLE,
        _ => tokio::io::Interest::READABLE,
    }
}

/// Decrements the live task count when a spawned future is dropped.
struct TaskGuard(Rc<Cell<usize>>);

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.0.set(self.0.get().saturating_sub(1));
    }
}

// Field order matters: the local set and the watched descriptors must be
// released before the runtime that drives them.
struct LoopInner {
    local: RefCell<Option<LocalSet>>,
    watched: RefCell<HashMap<RawFd, Watch>>,
    selector: RefCell<Selector<IoHandlers>>,
    ready: RefCell<VecDeque<Callback>>,
    wake: Rc<Notify>,
    tasks: Rc<Cell<usize>>,
    exception_handler: RefCell<Option<ExceptionHandler>>,
    sockets: RefCell<Vec<Arc<dyn MqSocket>>>,
    running: Cell<bool>,
    closed: Cell<bool>,
    runtime: Runtime,
}

/// Handle to a single-threaded event loop. Clones share the loop.
#[derive(Clone)]
pub struct EventLoop {
    inner: Rc<LoopInner>,
}

/// Non-owning loop reference.
#[derive(Clone)]
pub struct WeakEventLoop {
    inner: Weak<LoopInner>,
}

impl WeakEventLoop {
    pub fn upgrade(&self) -> Option<EventLoop> {
        self.inner.upgrade().map(|inner| EventLoop { inner })
    }
}

/// Aborts a spawned task or timer. Cloneable; holds nothing once the loop
/// is closed.
#[derive(Clone, Debug, Default)]
pub struct AbortHandle {
    task: Option<tokio::task::AbortHandle>,
}

impl AbortHandle {
    pub fn abort(&self) {
        if let Some(task) = &self.task {
            task.abort();
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, tokio::task::AbortHandle::is_finished)
    }
}

/// Handle of a `call_later` timer.
pub struct TimerHandle {
    abort: AbortHandle,
    cancelled: Cell<bool>,
}

impl TimerHandle {
    pub fn cancel(&self) {
        self.cancelled.set(true);
        self.abort.abort();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.get()
    }
}

/// Future returned by [`EventLoop::sleep`].
#[must_use = "futures do nothing unless polled"]
pub struct Sleep {
    inner: Pin<Box<tokio::time::Sleep>>,
}

impl Future for Sleep {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        self.inner.as_mut().poll(cx)
    }
}

/// Handle of a spawned task.
///
/// Awaiting it yields the task's output, or `Err(Aborted)` if the task was
/// aborted before completing. Dropping the handle detaches the task. A panic
/// inside the task resumes in the awaiting task.
pub struct JoinHandle<T> {
    task: Option<tokio::task::JoinHandle<T>>,
    aborted: Cell<bool>,
}

impl<T> JoinHandle<T> {
    /// Cancel the task at its next suspension point.
    pub fn abort(&self) {
        self.aborted.set(true);
        if let Some(task) = &self.task {
            task.abort();
        }
    }

    /// Whether `abort` was called through this handle.
    pub fn is_aborted(&self) -> bool {
        self.aborted.get()
    }

    /// A cloneable handle that can only abort.
    pub fn abort_handle(&self) -> AbortHandle {
        AbortHandle {
            task: self.task.as_ref().map(tokio::task::JoinHandle::abort_handle),
        }
    }
}

impl<T> Future for JoinHandle<T> {
    type Output = std::result::Result<T, Aborted>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let Some(task) = self.task.as_mut() else {
            return Poll::Ready(Err(Aborted));
        };
        match ready!(Pin::new(task).poll(cx)) {
            Ok(output) => Poll::Ready(Ok(output)),
            Err(e) if e.is_cancelled() => Poll::Ready(Err(Aborted)),
            Err(e) => std::panic::resume_unwind(e.into_panic()),
        }
    }
}

impl EventLoop {
    pub fn new() -> Result<Self> {
        let runtime = Builder::new_current_thread().enable_all().build()?;
        Ok(Self {
            inner: Rc::new(LoopInner {
                local: RefCell::new(Some(LocalSet::new())),
                watched: RefCell::new(HashMap::new()),
                selector: RefCell::new(Selector::new()),
                ready: RefCell::new(VecDeque::new()),
                wake: Rc::new(Notify::new()),
                tasks: Rc::new(Cell::new(0)),
                exception_handler: RefCell::new(None),
                sockets: RefCell::new(Vec::new()),
                running: Cell::new(false),
                closed: Cell::new(false),
                runtime,
            }),
        })
    }

    pub fn downgrade(&self) -> WeakEventLoop {
        WeakEventLoop {
            inner: Rc::downgrade(&self.inner),
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.get()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.get()
    }

    pub fn time(&self) -> Instant {
        Instant::now()
    }

    /// Run `callback` on the next loop turn.
    pub fn call_soon(&self, callback: impl FnOnce() + 'static) {
        if self.is_closed() {
            return;
        }
        self.inner.ready.borrow_mut().push_back(Box::new(callback));
        self.inner.wake.notify_one();
    }

    /// Spawn onto the local set; nothing is spawned once the loop is closed.
    fn spawn_task<F>(&self, future: F) -> Option<tokio::task::JoinHandle<F::Output>>
    where
        F: Future + 'static,
        F::Output: 'static,
    {
        let local = self.inner.local.borrow();
        let local = local.as_ref()?;
        let _enter = self.inner.runtime.enter();
        Some(local.spawn_local(future))
    }

    /// Run `callback` once `delay` has elapsed.
    pub fn call_later(&self, delay: Duration, callback: impl FnOnce() + 'static) -> TimerHandle {
        let sleep = self.sleep(delay);
        let task = self.spawn_task(async move {
            sleep.await;
            callback();
        });
        TimerHandle {
            abort: AbortHandle {
                task: task.as_ref().map(tokio::task::JoinHandle::abort_handle),
            },
            cancelled: Cell::new(false),
        }
    }

    /// A future that completes once `delay` has elapsed.
    pub fn sleep(&self, delay: Duration) -> Sleep {
        let _enter = self.inner.runtime.enter();
        Sleep {
            inner: Box::pin(tokio::time::sleep(delay)),
        }
    }

    /// Spawn a task on this loop.
    pub fn spawn_local<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + 'static,
        F::Output: 'static,
    {
        let count = self.inner.tasks.clone();
        count.set(count.get() + 1);
        let guard = TaskGuard(count);
        JoinHandle {
            task: self.spawn_task(async move {
                let _guard = guard;
                future.await
            }),
            aborted: Cell::new(false),
        }
    }

    /// Number of spawned tasks that have not completed.
    pub fn task_count(&self) -> usize {
        self.inner.tasks.get()
    }

    /// Register `fd` with the runtime reactor, or update what is awaited on it.
    fn watch(&self, handle: &Handle, fd: RawFd, events: Interest) -> Result<()> {
        // A socket's notification descriptor only ever signals readability.
        let (registration, interest) = match handle {
            Handle::Socket(_) => (tokio::io::Interest::READABLE, tokio::io::Interest::READABLE),
            Handle::Fd(_) => (
                tokio::io::Interest::READABLE | tokio::io::Interest::WRITABLE,
                runtime_interest(events),
            ),
        };
        let mut watched = self.inner.watched.borrow_mut();
        if let Some(watch) = watched.get_mut(&fd) {
            watch.interest = interest;
            return Ok(());
        }
        let _enter = self.inner.runtime.enter();
        let async_fd = AsyncFd::with_interest(WatchedFd(fd), registration)?;
        watched.insert(
            fd,
            Watch {
                fd: Rc::new(async_fd),
                interest,
            },
        );
        Ok(())
    }

    fn unwatch(&self, fd: RawFd) {
        self.inner.watched.borrow_mut().remove(&fd);
    }

    fn set_io_handlers(&self, handle: Handle, update: impl FnOnce(&mut IoHandlers)) -> Result<()> {
        if self.is_closed() {
            return Err(Error::invalid_state("Event loop is closed"));
        }
        let mut selector = self.inner.selector.borrow_mut();
        let existing = selector.get_key(&handle).map(|k| k.data.clone());
        match existing {
            Some(mut handlers) => {
                update(&mut handlers);
                let events = handlers.interest();
                if events.is_empty() {
                    let key = selector.unregister(&handle)?;
                    self.unwatch(key.fd);
                } else {
                    let fd = selector.modify(&handle, events, handlers)?.fd;
                    self.watch(&handle, fd, events)?;
                }
            }
            None => {
                let mut handlers = IoHandlers::default();
                update(&mut handlers);
                let events = handlers.interest();
                if !events.is_empty() {
                    let fd = selector.register(handle.clone(), events, handlers)?.fd;
                    if let Err(e) = self.watch(&handle, fd, events) {
                        let _ = selector.unregister(&handle);
                        return Err(e);
                    }
                }
            }
        }
        Ok(())
    }

    /// Call `callback` whenever `handle` is readable. Replaces a previous reader.
    pub fn add_reader(&self, handle: Handle, callback: impl Fn() + 'static) -> Result<()> {
        let cb = IoCallback::new(callback);
        self.set_io_handlers(handle, |h| {
            if let Some(old) = h.reader.replace(cb) {
                old.cancelled.set(true);
            }
        })
    }

    /// Stop watching `handle` for readability. Returns false if no reader was set.
    pub fn remove_reader(&self, handle: &Handle) -> Result<bool> {
        if self.is_closed() {
            return Ok(false);
        }
        let has_reader = self
            .inner
            .selector
            .borrow()
            .get_key(handle)
            .is_some_and(|k| k.data.reader.is_some());
        if !has_reader {
            return Ok(false);
        }
        self.set_io_handlers(handle.clone(), |h| {
            if let Some(old) = h.reader.take() {
                old.cancelled.set(true);
            }
        })?;
        Ok(true)
    }

    /// Call `callback` whenever `handle` is writable. Replaces a previous writer.
    pub fn add_writer(&self, handle: Handle, callback: impl Fn() + 'static) -> Result<()> {
        let cb = IoCallback::new(callback);
        self.set_io_handlers(handle, |h| {
            if let Some(old) = h.writer.replace(cb) {
                old.cancelled.set(true);
            }
        })
    }

    /// Stop watching `handle` for writability. Returns false if no writer was set.
    pub fn remove_writer(&self, handle: &Handle) -> Result<bool> {
        if self.is_closed() {
            return Ok(false);
        }
        let has_writer = self
            .inner
            .selector
            .borrow()
            .get_key(handle)
            .is_some_and(|k| k.data.writer.is_some());
        if !has_writer {
            return Ok(false);
        }
        self.set_io_handlers(handle.clone(), |h| {
            if let Some(old) = h.writer.take() {
                old.cancelled.set(true);
            }
        })?;
        Ok(true)
    }

    pub fn set_exception_handler(&self, handler: impl Fn(&EventLoop, &ErrorContext) + 'static) {
        *self.inner.exception_handler.borrow_mut() = Some(Rc::new(handler));
    }

    /// Restore the default (logging) exception handler.
    pub fn clear_exception_handler(&self) {
        self.inner.exception_handler.borrow_mut().take();
    }

    /// Report an error that has no caller to propagate to.
    pub fn call_exception_handler(&self, context: ErrorContext) {
        let handler = self.inner.exception_handler.borrow().clone();
        match handler {
            Some(handler) => handler(self, &context),
            None => default_exception_handler(self, &context),
        }
    }

    /// Take ownership of a socket so that `close()` releases it.
    pub fn track_socket(&self, socket: Arc<dyn MqSocket>) {
        let mut sockets = self.inner.sockets.borrow_mut();
        sockets.retain(|s| !s.is_closed());
        if !sockets.iter().any(|s| s.id() == socket.id()) {
            sockets.push(socket);
        }
    }

    /// Sockets tracked by this loop that are still open.
    pub fn tracked_sockets(&self) -> Vec<Arc<dyn MqSocket>> {
        self.inner
            .sockets
            .borrow()
            .iter()
            .filter(|s| !s.is_closed())
            .cloned()
            .collect()
    }

    /// Close the loop: drop pending work, close tracked sockets and the selector.
    pub fn close(&self) -> Result<()> {
        if self.is_running() {
            return Err(Error::invalid_state("Cannot close a running event loop"));
        }
        if self.inner.closed.replace(true) {
            return Ok(());
        }
        {
            let _enter = self.inner.runtime.enter();
            let local = self.inner.local.borrow_mut().take();
            drop(local);
            let ready = std::mem::take(&mut *self.inner.ready.borrow_mut());
            drop(ready);
            self.inner.watched.borrow_mut().clear();
        }

        let sockets = std::mem::take(&mut *self.inner.sockets.borrow_mut());
        for socket in sockets {
            if let Err(e) = socket.close() {
                debug!("[LOOP] error closing socket #{}: {}", socket.id(), e);
            }
        }
        self.inner.selector.borrow_mut().close();
        debug!("[LOOP] closed");
        Ok(())
    }

    fn run_callbacks(&self) {
        let n = self.inner.ready.borrow().len();
        for _ in 0..n {
            let Some(cb) = self.inner.ready.borrow_mut().pop_front() else {
                break;
            };
            cb();
        }
    }

    /// Queue the callbacks of every handle that is ready right now.
    fn dispatch_ready(&self) -> Result<()> {
        let events = self.inner.selector.borrow_mut().select(Some(Duration::ZERO))?;
        for (key, ready) in events {
            if ready.is_readable() {
                if let Some(reader) = key.data.reader.clone() {
                    self.call_soon(move || reader.run());
                }
            }
            if ready.is_writable() {
                if let Some(writer) = key.data.writer.clone() {
                    self.call_soon(move || writer.run());
                }
            }
        }
        Ok(())
    }

    /// Park until a watched descriptor signals or a callback is queued.
    fn wait_for_activity(&self) -> LocalBoxFuture<'static, ()> {
        let mut waits: Vec<LocalBoxFuture<'static, ()>> = self
            .inner
            .watched
            .borrow()
            .values()
            .map(|watch| {
                let fd = watch.fd.clone();
                let interest = watch.interest;
                async move {
                    match fd.ready(interest).await {
                        Ok(mut guard) => guard.clear_ready(),
                        // The runtime is shutting down.
                        Err(_) => future::pending::<()>().await,
                    }
                }
                .boxed_local()
            })
            .collect();
        let wake = self.inner.wake.clone();
        waits.push(async move { wake.notified().await }.boxed_local());
        future::select_all(waits).map(|_| ()).boxed_local()
    }

    /// Callback and readiness dispatch; only returns on selector failure.
    async fn dispatch(&self) -> Error {
        loop {
            self.run_callbacks();
            if let Err(e) = self.dispatch_ready() {
                return e;
            }
            if self.inner.ready.borrow().is_empty() {
                trace!("[LOOP] idle, waiting on {} descriptors", self.inner.watched.borrow().len());
                self.wait_for_activity().await;
            } else {
                tokio::task::yield_now().await;
            }
        }
    }

    /// Drive the loop until `future` completes and return its output.
    pub fn run_until<F: Future>(&self, future: F) -> Result<F::Output> {
        if self.is_closed() {
            return Err(Error::invalid_state("Event loop is closed"));
        }
        if self.inner.running.replace(true) {
            return Err(Error::invalid_state("This event loop is already running"));
        }
        let _running = RunningGuard(self);

        let local = self.inner.local.borrow();
        let local = local
            .as_ref()
            .ok_or_else(|| Error::invalid_state("Event loop is closed"))?;
        local.block_on(&self.inner.runtime, async {
            tokio::select! {
                biased;
                output = future => Ok(output),
                e = self.dispatch() => Err(e),
            }
        })
    }
}

struct RunningGuard<'a>(&'a EventLoop);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.inner.running.set(false);
    }
}

impl fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoop")
            .field("running", &self.is_running())
            .field("closed", &self.is_closed())
            .field("tasks", &self.task_count())
            .finish()
    }
}
