//! Async interface driven by tokio's reactor.
//!
//! Converting an [`Interface`] stops its readiness worker and registers the
//! device with tokio instead. Configure the interface before converting it.

use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::Arc;

use tokio::io::unix::AsyncFd;
use tracing::{debug, trace};

use crate::control::DeviceControl;
use crate::device::{Interface, Mode};
use crate::error::{Error, Result};
use crate::stream::DropHook;

/// A TUN/TAP interface for use inside a tokio runtime.
pub struct AsyncInterface {
    fd: AsyncFd<File>,
    name: String,
    mode: Mode,
    persistent: bool,
    mtu: u32,
    // Keeps a custom control alive for as long as the device it manages.
    _control: Arc<dyn DeviceControl>,
    on_drop: Option<DropHook>,
}

impl Interface {
    /// Hand the device over to tokio.
    ///
    /// Must be called from within a tokio runtime.
    pub fn into_async(self) -> Result<AsyncInterface> {
        let name = self.name().to_string();
        let file = self.detach().ok_or_else(|| {
            Error::Io(io::Error::from_raw_os_error(libc::EBADF))
                .with_context(format!("converting closed interface {name}"))
        })?;

        let fd = AsyncFd::new(file)
            .map_err(|e| Error::Io(e).with_context(format!("registering {name} with tokio")))?;

        debug!(device = %name, "interface handed to tokio");

        Ok(AsyncInterface {
            fd,
            mode: self.mode(),
            persistent: self.is_persistent(),
            mtu: self.mtu(),
            _control: Arc::clone(self.control()),
            on_drop: self.drop_hook().cloned(),
            name,
        })
    }
}

impl AsyncInterface {
    /// Get the device name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the device mode.
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Check if the device is persistent.
    pub fn is_persistent(&self) -> bool {
        self.persistent
    }

    /// The MTU at conversion time.
    pub fn mtu(&self) -> u32 {
        self.mtu
    }

    /// Receive one packet.
    pub async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        loop {
            let mut guard = self.fd.readable().await?;

            match guard.try_io(|inner| {
                let mut file = inner.get_ref();
                file.read(buf)
            }) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }

    /// Send one packet without waiting; a full device queue drops it.
    pub fn send(&self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        let mut file = self.fd.get_ref();
        match file.write(buf) {
            Ok(0) => Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                trace!(device = %self.name, len = buf.len(), "device queue full, dropping packet");
                if let Some(hook) = &self.on_drop {
                    hook(buf.len());
                }
                Ok(0)
            }
            Err(e) => Err(e),
        }
    }
}

impl AsRawFd for AsyncInterface {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.get_ref().as_raw_fd()
    }
}

impl std::fmt::Debug for AsyncInterface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncInterface")
            .field("name", &self.name)
            .field("mode", &self.mode)
            .field("fd", &self.as_raw_fd())
            .finish_non_exhaustive()
    }
}
