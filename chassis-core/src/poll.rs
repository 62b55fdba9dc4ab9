//! Native poll primitive over message-queue sockets and plain descriptors.
//!
//! Message-queue sockets expose readiness as level-triggered flags
//! (`events()`) plus a notification descriptor (`fd()`). The poller checks the
//! flags directly, and when nothing is ready it blocks in `poll(2)` on the
//! notification descriptors of every registered socket together with the
//! registered plain descriptors.
//!
//! The flag space is the message-queue library's own: [`PollFlags::POLLIN`],
//! [`PollFlags::POLLOUT`], [`PollFlags::POLLERR`]. Translation from/to the
//! generic read/write interest lives in the selector.

#![allow(unsafe_code)]

use std::fmt;
use std::io;
use std::ops::{BitAnd, BitOr, BitOrAssign};
use std::os::fd::RawFd;
use std::sync::Arc;
use std::time::{Duration, Instant};

use smallvec::SmallVec;

use crate::error::native;
use crate::socket::MqSocket;

/// Message-queue readiness flags.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PollFlags(u8);

impl PollFlags {
    pub const NONE: Self = Self(0);
    pub const POLLIN: Self = Self(1);
    pub const POLLOUT: Self = Self(2);
    pub const POLLERR: Self = Self(4);

    #[must_use]
    pub const fn bits(self) -> u8 {
        self.0
    }

    /// Build from raw bits, rejecting unknown ones.
    #[must_use]
    pub const fn from_bits(bits: u8) -> Option<Self> {
        if bits & !0b111 == 0 {
            Some(Self(bits))
        } else {
            None
        }
    }

    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    #[must_use]
    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for PollFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for PollFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for PollFlags {
    type Output = Self;
    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl fmt::Debug for PollFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: SmallVec<[&str; 3]> = SmallVec::new();
        if self.contains(Self::POLLIN) {
            names.push("POLLIN");
        }
        if self.contains(Self::POLLOUT) {
            names.push("POLLOUT");
        }
        if self.contains(Self::POLLERR) {
            names.push("POLLERR");
        }
        if names.is_empty() {
            write!(f, "PollFlags(NONE)")
        } else {
            write!(f, "PollFlags({})", names.join("|"))
        }
    }
}

/// Something that can be polled: a message-queue socket or a plain descriptor.
#[derive(Clone)]
pub enum Handle {
    Socket(Arc<dyn MqSocket>),
    Fd(RawFd),
}

impl Handle {
    /// Descriptor the handle is keyed by.
    ///
    /// For sockets this is the notification descriptor, which is no longer
    /// available once the socket is closed.
    pub fn key_fd(&self) -> io::Result<RawFd> {
        match self {
            Self::Socket(s) => s.fd(),
            Self::Fd(fd) => Ok(*fd),
        }
    }

    /// Identity comparison (same socket object, or same descriptor number).
    #[must_use]
    pub fn same_as(&self, other: &Handle) -> bool {
        match (self, other) {
            (Self::Socket(a), Self::Socket(b)) => a.id() == b.id(),
            (Self::Fd(a), Self::Fd(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Socket(s) => write!(f, "Socket({}#{})", s.socket_type(), s.id()),
            Self::Fd(fd) => write!(f, "Fd({fd})"),
        }
    }
}

impl From<RawFd> for Handle {
    fn from(fd: RawFd) -> Self {
        Self::Fd(fd)
    }
}

impl From<Arc<dyn MqSocket>> for Handle {
    fn from(socket: Arc<dyn MqSocket>) -> Self {
        Self::Socket(socket)
    }
}

struct PollItem {
    handle: Handle,
    events: PollFlags,
}

/// Poll set over sockets and descriptors.
#[derive(Default)]
pub struct NativePoller {
    items: Vec<PollItem>,
}

fn fd_is_open(fd: RawFd) -> bool {
    // SAFETY: F_GETFD only inspects the descriptor table entry.
    unsafe { libc::fcntl(fd, libc::F_GETFD) != -1 }
}

fn ceil_millis(d: Duration) -> libc::c_int {
    let ms = d.as_nanos().div_ceil(1_000_000);
    ms.min(libc::c_int::MAX as u128) as libc::c_int
}

impl NativePoller {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    fn position(&self, handle: &Handle) -> Option<usize> {
        self.items.iter().position(|i| i.handle.same_as(handle))
    }

    fn validate(handle: &Handle) -> io::Result<()> {
        match handle {
            Handle::Socket(s) if s.is_closed() => Err(native(libc::ENOTSOCK)),
            Handle::Socket(_) => Ok(()),
            Handle::Fd(fd) if *fd < 0 || !fd_is_open(*fd) => Err(native(libc::EBADF)),
            Handle::Fd(_) => Ok(()),
        }
    }

    pub fn register(&mut self, handle: Handle, events: PollFlags) -> io::Result<()> {
        Self::validate(&handle)?;
        if self.position(&handle).is_some() {
            return Err(native(libc::EEXIST));
        }
        self.items.push(PollItem { handle, events });
        Ok(())
    }

    pub fn modify(&mut self, handle: &Handle, events: PollFlags) -> io::Result<()> {
        let pos = self.position(handle).ok_or_else(|| native(libc::ENOENT))?;
        Self::validate(handle)?;
        self.items[pos].events = events;
        Ok(())
    }

    pub fn unregister(&mut self, handle: &Handle) -> io::Result<()> {
        let pos = self.position(handle).ok_or_else(|| native(libc::ENOENT))?;
        self.items.swap_remove(pos);
        Ok(())
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    /// Level-check every registered socket.
    fn check_sockets(&self, ready: &mut Vec<(Handle, PollFlags)>) {
        for item in &self.items {
            if let Handle::Socket(socket) = &item.handle {
                let flags = match socket.events() {
                    Ok(ev) => ev & item.events,
                    Err(_) => PollFlags::POLLERR,
                };
                if !flags.is_empty() {
                    ready.push((item.handle.clone(), flags));
                }
            }
        }
    }

    /// Wait for readiness.
    ///
    /// `None` blocks until something is ready, a zero timeout only checks.
    /// An interrupted wait is reported as `Interrupted`.
    pub fn poll(&self, timeout: Option<Duration>) -> io::Result<Vec<(Handle, PollFlags)>> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let mut ready = Vec::new();
            self.check_sockets(&mut ready);

            let wait = if ready.is_empty() {
                deadline.map(|d| d.saturating_duration_since(Instant::now()))
            } else {
                Some(Duration::ZERO)
            };

            let mut pollfds: SmallVec<[libc::pollfd; 8]> = SmallVec::new();
            let mut owners: SmallVec<[usize; 8]> = SmallVec::new();
            for (idx, item) in self.items.iter().enumerate() {
                let (fd, events) = match &item.handle {
                    Handle::Socket(s) => match s.fd() {
                        Ok(fd) => (fd, libc::POLLIN),
                        Err(_) => continue,
                    },
                    Handle::Fd(fd) => {
                        let mut events = 0;
                        if item.events.contains(PollFlags::POLLIN) {
                            events |= libc::POLLIN;
                        }
                        if item.events.contains(PollFlags::POLLOUT) {
                            events |= libc::POLLOUT;
                        }
                        (*fd, events)
                    }
                };
                pollfds.push(libc::pollfd {
                    fd,
                    events,
                    revents: 0,
                });
                owners.push(idx);
            }

            let wait_ms = wait.map_or(-1, ceil_millis);
            // SAFETY: `pollfds` is a valid, exclusively borrowed array of
            // `pollfds.len()` entries for the duration of the call.
            let rc = unsafe {
                libc::poll(
                    pollfds.as_mut_ptr(),
                    pollfds.len() as libc::nfds_t,
                    wait_ms,
                )
            };
            if rc < 0 {
                return Err(io::Error::last_os_error());
            }

            let mut socket_signalled = false;
            for (pfd, &idx) in pollfds.iter().zip(owners.iter()) {
                if pfd.revents == 0 {
                    continue;
                }
                let item = &self.items[idx];
                match &item.handle {
                    Handle::Socket(_) => socket_signalled = true,
                    Handle::Fd(_) => {
                        let mut flags = PollFlags::NONE;
                        if pfd.revents & (libc::POLLIN | libc::POLLHUP) != 0 {
                            flags |= PollFlags::POLLIN;
                        }
                        if pfd.revents & libc::POLLOUT != 0 {
                            flags |= PollFlags::POLLOUT;
                        }
                        if pfd.revents & (libc::POLLERR | libc::POLLNVAL) != 0 {
                            flags |= PollFlags::POLLERR;
                        }
                        let flags = flags & (item.events | PollFlags::POLLERR);
                        if !flags.is_empty() {
                            ready.push((item.handle.clone(), flags));
                        }
                    }
                }
            }

            if socket_signalled && !ready.iter().any(|(h, _)| matches!(h, Handle::Socket(_))) {
                self.check_sockets(&mut ready);
            }

            if !ready.is_empty() {
                return Ok(ready);
            }
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return Ok(ready);
                }
            }
            tracing::trace!("[POLL] spurious wakeup, polling again");
        }
    }
}

impl fmt::Debug for NativePoller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.items.iter().map(|i| (&i.handle, i.events)))
            .finish()
    }
}
