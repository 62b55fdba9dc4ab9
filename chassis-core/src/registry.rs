//! Endpoint registry for the in-memory message-queue backend.
//!
//! `inproc://` names are bound into a per-context table; every other scheme
//! is refused with `EPROTONOSUPPORT`. Connects that find no bound peer wait
//! in a pending list and are attached when a matching bind appears.

use std::io;
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::endpoint::Endpoint;
use crate::error::native;
use crate::memory::MemorySocket;

struct Bound {
    endpoint: Endpoint,
    socket: Weak<MemorySocket>,
}

/// A connect waiting for its endpoint to be bound.
pub(crate) struct PendingConnect {
    pub endpoint: Endpoint,
    pub raw: String,
    pub socket: Weak<MemorySocket>,
}

#[derive(Default)]
pub(crate) struct Registry {
    endpoints: DashMap<String, Bound>,
    // Also serializes bind against connect so a pending connect is never missed.
    pending: Mutex<Vec<PendingConnect>>,
}

fn parse(raw: &str) -> io::Result<Endpoint> {
    Endpoint::parse(raw).map_err(|_| native(libc::EINVAL))
}

fn check_scheme(endpoint: &Endpoint) -> io::Result<()> {
    match endpoint {
        Endpoint::Inproc(_) => Ok(()),
        _ => Err(native(libc::EPROTONOSUPPORT)),
    }
}

/// Whether a connect to `target` reaches a socket bound at `bound`.
pub(crate) fn reaches(target: &Endpoint, bound: &Endpoint) -> bool {
    match (target, bound) {
        (Endpoint::Inproc(a), Endpoint::Inproc(b)) => a == b,
        _ => false,
    }
}

fn live(socket: &Weak<MemorySocket>) -> Option<Arc<MemorySocket>> {
    socket.upgrade().filter(|s| !s.is_closed_flag())
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    fn is_taken(&self, key: &str) -> bool {
        self.endpoints
            .get(key)
            .is_some_and(|b| live(&b.socket).is_some())
    }

    /// Bind `socket` at `raw`.
    ///
    /// Returns the endpoint and the pending connects it now satisfies.
    pub fn bind(
        &self,
        raw: &str,
        socket: &Arc<MemorySocket>,
    ) -> io::Result<(String, Vec<PendingConnect>)> {
        let endpoint = parse(raw)?;
        check_scheme(&endpoint)?;

        let mut pending = self.pending.lock();
        let key = endpoint.to_string();
        if self.is_taken(&key) {
            return Err(native(libc::EADDRINUSE));
        }
        self.endpoints.insert(
            key.clone(),
            Bound {
                endpoint: endpoint.clone(),
                socket: Arc::downgrade(socket),
            },
        );

        let mut satisfied = Vec::new();
        let mut i = 0;
        while i < pending.len() {
            if pending[i].socket.strong_count() == 0 {
                pending.swap_remove(i);
            } else if reaches(&pending[i].endpoint, &endpoint) {
                satisfied.push(pending.swap_remove(i));
            } else {
                i += 1;
            }
        }
        Ok((key, satisfied))
    }

    pub fn unbind(&self, endpoint: &str) {
        self.endpoints.remove(endpoint);
    }

    /// Find the socket bound for a connect, or park the connect as pending.
    pub fn connect(
        &self,
        raw: &str,
        socket: &Arc<MemorySocket>,
    ) -> io::Result<Option<Arc<MemorySocket>>> {
        let endpoint = parse(raw)?;
        check_scheme(&endpoint)?;

        let mut pending = self.pending.lock();
        let found = self.endpoints.iter().find_map(|entry| {
            if reaches(&endpoint, &entry.endpoint) {
                live(&entry.socket)
            } else {
                None
            }
        });
        if found.is_none() {
            pending.push(PendingConnect {
                endpoint,
                raw: raw.to_string(),
                socket: Arc::downgrade(socket),
            });
        }
        Ok(found)
    }

    /// Park a connect again after the peer it was attached to went away.
    pub fn requeue(&self, raw: &str, socket: &Arc<MemorySocket>) {
        let Ok(endpoint) = parse(raw) else {
            return;
        };
        let found = {
            let mut pending = self.pending.lock();
            let found = self.endpoints.iter().find_map(|entry| {
                if reaches(&endpoint, &entry.endpoint) {
                    live(&entry.socket)
                } else {
                    None
                }
            });
            if found.is_none() {
                pending.push(PendingConnect {
                    endpoint,
                    raw: raw.to_string(),
                    socket: Arc::downgrade(socket),
                });
            }
            found
        };
        if let Some(binder) = found {
            MemorySocket::attach(socket, &binder, raw);
        }
    }

    /// Drop pending connects of one socket (all of them, or one endpoint).
    pub fn cancel_pending(&self, socket_id: u64, raw: Option<&str>) -> bool {
        let mut pending = self.pending.lock();
        let before = pending.len();
        pending.retain(|p| {
            let mine = p.socket.upgrade().is_some_and(|s| s.id_value() == socket_id);
            !(mine && raw.map_or(true, |r| r == p.raw))
        });
        pending.len() != before
    }

    /// Currently bound endpoints, for diagnostics.
    pub fn list_endpoints(&self) -> Vec<String> {
        self.endpoints
            .iter()
            .filter(|entry| live(&entry.socket).is_some())
            .map(|entry| entry.key().clone())
            .collect()
    }
}
