//! Byte-stream access to an [`Interface`].
//!
//! Reads behave like blocking reads: on would-block the reader arms the
//! readiness worker, waits, and tries again. Writes never wait: when the
//! device queue is full the payload is dropped and `Ok(0)` is returned.

use std::io::{self, Read, Write};
use std::sync::Arc;

use tracing::trace;

use crate::device::Interface;

/// Callback invoked with the length of every dropped write.
pub type DropHook = Arc<dyn Fn(usize) + Send + Sync>;

impl Interface {
    /// Receive one packet, waiting until one is available.
    ///
    /// Returns `Ok(0)` for an empty buffer, at end-of-stream, and once the
    /// interface has been closed (including by another thread while this call
    /// was waiting).
    pub fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        let consumer = self.consumer();
        loop {
            let result = match self.file().as_ref() {
                Some(mut file) => file.read(buf),
                None => return Ok(0),
            };

            match result {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if !consumer.wait_ready() {
                        trace!(device = %self.name(), "readiness worker gone, ending read");
                        return Ok(0);
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Send one packet without waiting.
    ///
    /// An empty buffer and a full device queue both return `Ok(0)`; in the
    /// latter case the packet is lost and the drop hook, if any, is called.
    pub fn send(&self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        let result = match self.file().as_ref() {
            Some(mut file) => file.write(buf),
            None => return Err(io::Error::from_raw_os_error(libc::EBADF)),
        };

        match result {
            Ok(0) => Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                trace!(device = %self.name(), len = buf.len(), "device queue full, dropping packet");
                if let Some(hook) = self.drop_hook() {
                    hook(buf.len());
                }
                Ok(0)
            }
            Err(e) => Err(e),
        }
    }
}

impl Read for &Interface {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.recv(buf)
    }
}

impl Read for Interface {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.recv(buf)
    }
}

impl Write for &Interface {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.send(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Write for Interface {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.send(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
