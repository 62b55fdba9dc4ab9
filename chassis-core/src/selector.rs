//! Readiness multiplexer.
//!
//! [`Selector`] keeps a registry of [`Handle`]s (message-queue sockets or
//! plain descriptors) with a generic read/write interest mask and caller data,
//! and answers "what is ready" by running the [`NativePoller`].
//!
//! Registrations are keyed by descriptor (a socket's notification descriptor,
//! or the plain fd). A closed socket no longer has a descriptor; such handles
//! are still found by an identity scan so they can be unregistered.

use std::fmt;
use std::io;
use std::ops::{BitAnd, BitOr};
use std::os::fd::RawFd;
use std::time::Duration;

use hashbrown::HashMap;
use tracing::trace;

use crate::error::{Error, Result};
use crate::poll::{Handle, NativePoller, PollFlags};

/// Generic readiness interest.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Interest(u8);

impl Interest {
    pub const NONE: Self = Self(0);
    pub const READ: Self = Self(1);
    pub const WRITE: Self = Self(2);
    pub const BOTH: Self = Self(3);

    /// Build from raw bits, rejecting unknown ones.
    #[must_use]
    pub const fn from_bits(bits: u8) -> Option<Self> {
        if bits & !0b11 == 0 {
            Some(Self(bits))
        } else {
            None
        }
    }

    #[must_use]
    pub const fn bits(self) -> u8 {
        self.0
    }

    #[must_use]
    pub const fn is_readable(self) -> bool {
        self.0 & Self::READ.0 != 0
    }

    #[must_use]
    pub const fn is_writable(self) -> bool {
        self.0 & Self::WRITE.0 != 0
    }

    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Interest expressed in the native poller's flag space.
    #[must_use]
    pub fn to_native(self) -> PollFlags {
        let mut flags = PollFlags::NONE;
        if self.is_readable() {
            flags |= PollFlags::POLLIN;
        }
        if self.is_writable() {
            flags |= PollFlags::POLLOUT;
        }
        flags
    }

    /// Native readiness as generic interest; an error reports both directions
    /// so the caller re-checks and fails fast.
    #[must_use]
    pub fn from_native(flags: PollFlags) -> Self {
        if flags.contains(PollFlags::POLLERR) {
            return Self::BOTH;
        }
        let mut bits = 0;
        if flags.contains(PollFlags::POLLIN) {
            bits |= Self::READ.0;
        }
        if flags.contains(PollFlags::POLLOUT) {
            bits |= Self::WRITE.0;
        }
        Self(bits)
    }
}

impl BitOr for Interest {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitAnd for Interest {
    type Output = Self;
    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl fmt::Debug for Interest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.is_readable(), self.is_writable()) {
            (true, true) => write!(f, "READ|WRITE"),
            (true, false) => write!(f, "READ"),
            (false, true) => write!(f, "WRITE"),
            (false, false) => write!(f, "NONE"),
        }
    }
}

/// One registration.
#[derive(Clone)]
pub struct SelectorKey<D> {
    pub handle: Handle,
    pub fd: RawFd,
    pub events: Interest,
    pub data: D,
}

impl<D> fmt::Debug for SelectorKey<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SelectorKey")
            .field("handle", &self.handle)
            .field("fd", &self.fd)
            .field("events", &self.events)
            .finish_non_exhaustive()
    }
}

pub struct Selector<D> {
    poller: Option<NativePoller>,
    keys: HashMap<RawFd, SelectorKey<D>>,
}

fn check_events(events: Interest) -> Result<()> {
    if events.is_empty() {
        return Err(Error::invalid_argument(format!("Invalid events: {events:?}")));
    }
    Ok(())
}

impl<D> Selector<D> {
    pub fn new() -> Self {
        Self {
            poller: Some(NativePoller::new()),
            keys: HashMap::new(),
        }
    }

    fn poller_mut(&mut self) -> Result<&mut NativePoller> {
        self.poller
            .as_mut()
            .ok_or_else(|| Error::invalid_state("Selector is closed"))
    }

    /// Find the descriptor a handle is registered under.
    fn find_fd(&self, handle: &Handle) -> Option<RawFd> {
        if let Ok(fd) = handle.key_fd() {
            if self.keys.get(&fd).is_some_and(|k| k.handle.same_as(handle)) {
                return Some(fd);
            }
        }
        self.keys
            .iter()
            .find(|(_, key)| key.handle.same_as(handle))
            .map(|(fd, _)| *fd)
    }

    /// Register interest in `handle`.
    ///
    /// Rejects an empty mask and handles that are already registered. Nothing
    /// is recorded if the native registration fails.
    pub fn register(&mut self, handle: Handle, events: Interest, data: D) -> Result<&SelectorKey<D>> {
        check_events(events)?;
        if self.find_fd(&handle).is_some() {
            return Err(Error::invalid_argument(format!(
                "{handle:?} is already registered"
            )));
        }
        let fd = handle.key_fd()?;
        if self.keys.contains_key(&fd) {
            return Err(Error::invalid_argument(format!(
                "descriptor {fd} is already registered"
            )));
        }
        self.poller_mut()?.register(handle.clone(), events.to_native())?;
        trace!("[SELECTOR] registered {:?} for {:?}", handle, events);
        Ok(self.keys.entry(fd).or_insert(SelectorKey {
            handle,
            fd,
            events,
            data,
        }))
    }

    /// Remove the registration of `handle` and return it.
    ///
    /// If the native poller refuses, the registration is kept.
    pub fn unregister(&mut self, handle: &Handle) -> Result<SelectorKey<D>> {
        let fd = self
            .find_fd(handle)
            .ok_or_else(|| Error::invalid_argument(format!("{handle:?} is not registered")))?;
        let key = self
            .keys
            .remove(&fd)
            .ok_or_else(|| Error::invalid_argument(format!("{handle:?} is not registered")))?;
        let result = match self.poller.as_mut() {
            Some(poller) => poller.unregister(&key.handle),
            None => Ok(()),
        };
        if let Err(e) = result {
            self.keys.insert(fd, key);
            return Err(e.into());
        }
        trace!("[SELECTOR] unregistered {:?}", handle);
        Ok(key)
    }

    /// Change interest and data of a registered handle.
    ///
    /// The native poller is only touched when the mask changes.
    pub fn modify(&mut self, handle: &Handle, events: Interest, data: D) -> Result<&SelectorKey<D>> {
        check_events(events)?;
        let fd = self
            .find_fd(handle)
            .ok_or_else(|| Error::invalid_argument(format!("{handle:?} is not registered")))?;
        let current = self.keys.get(&fd).map(|k| k.events);
        if current != Some(events) {
            let native_handle = self.keys[&fd].handle.clone();
            self.poller_mut()?.modify(&native_handle, events.to_native())?;
        }
        let key = self
            .keys
            .get_mut(&fd)
            .ok_or_else(|| Error::invalid_argument(format!("{handle:?} is not registered")))?;
        key.events = events;
        key.data = data;
        Ok(key)
    }

    pub fn get_key(&self, handle: &Handle) -> Option<&SelectorKey<D>> {
        self.find_fd(handle).and_then(|fd| self.keys.get(&fd))
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.poller.is_none()
    }

    /// Drop every registration and the native poller.
    pub fn close(&mut self) {
        self.keys.clear();
        if let Some(mut poller) = self.poller.take() {
            poller.clear();
        }
    }
}

impl<D: Clone> Selector<D> {
    /// Wait for readiness.
    ///
    /// `None` blocks until something is ready; a zero timeout only checks. An
    /// interrupted wait yields an empty list.
    pub fn select(&mut self, timeout: Option<Duration>) -> Result<Vec<(SelectorKey<D>, Interest)>> {
        let poller = self
            .poller
            .as_ref()
            .ok_or_else(|| Error::invalid_state("Selector is closed"))?;
        let fired = match poller.poll(timeout) {
            Ok(fired) => fired,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut ready = Vec::with_capacity(fired.len());
        for (handle, flags) in fired {
            let Some(key) = self.get_key(&handle) else {
                continue;
            };
            let events = Interest::from_native(flags) & key.events;
            if !events.is_empty() {
                ready.push((key.clone(), events));
            }
        }
        Ok(ready)
    }
}

impl<D> Default for Selector<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D> fmt::Debug for Selector<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Selector")
            .field("keys", &self.keys.values().collect::<Vec<_>>())
            .field("closed", &self.is_closed())
            .finish()
    }
}
