//! Readiness notification descriptor for in-memory sockets.
//!
//! A socket owns one [`Signaler`]: a non-blocking Unix socket pair whose read
//! end becomes readable whenever something relevant to the socket's readiness
//! changed. Pollers wait on the read end, drain it, then re-check the socket's
//! level-triggered `events()`.

use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;

use parking_lot::Mutex;

#[derive(Debug)]
pub struct Signaler {
    reader: Mutex<Option<UnixStream>>,
    writer: Mutex<Option<UnixStream>>,
    fd: RawFd,
}

impl Signaler {
    pub fn new() -> io::Result<Self> {
        let (reader, writer) = UnixStream::pair()?;
        reader.set_nonblocking(true)?;
        writer.set_nonblocking(true)?;
        let fd = reader.as_raw_fd();
        Ok(Self {
            reader: Mutex::new(Some(reader)),
            writer: Mutex::new(Some(writer)),
            fd,
        })
    }

    /// Descriptor to poll for readability, or `ENOTSOCK` once closed.
    pub fn fd(&self) -> io::Result<RawFd> {
        if self.reader.lock().is_some() {
            Ok(self.fd)
        } else {
            Err(crate::error::native(libc::ENOTSOCK))
        }
    }

    /// Wake any poller waiting on this signaler.
    ///
    /// A full pipe already guarantees a wakeup, so would-block is ignored.
    pub fn signal(&self) {
        if let Some(writer) = self.writer.lock().as_mut() {
            match writer.write(&[1u8]) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => tracing::trace!("[SIGNALER] signal failed: {}", e),
            }
        }
    }

    /// Consume all pending wakeups.
    pub fn drain(&self) {
        let mut guard = self.reader.lock();
        let Some(reader) = guard.as_mut() else {
            return;
        };
        let mut buf = [0u8; 64];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
    }

    /// Release both descriptors.
    pub fn close(&self) {
        self.writer.lock().take();
        self.reader.lock().take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_and_drain() {
        let signaler = Signaler::new().unwrap();
        signaler.signal();
        signaler.signal();
        signaler.drain();
        signaler.drain();
        assert!(signaler.fd().is_ok());
    }

    #[test]
    fn test_closed_signaler_has_no_fd() {
        let signaler = Signaler::new().unwrap();
        signaler.close();
        let err = signaler.fd().unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ENOTSOCK));
        signaler.signal();
        signaler.drain();
    }
}
