//! Common test utilities for integration tests.
//!
//! Provides `LoopbackControl`, a [`DeviceControl`] that hands out one end of a
//! `SOCK_SEQPACKET` socketpair instead of a kernel device, so the readiness
//! and lifecycle paths can be exercised without root. The other end plays the
//! kernel side of the link.

#![allow(dead_code)]

use std::fs::File;
use std::io;
use std::net::Ipv4Addr;
use std::os::fd::{BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tunmux::{Allocated, DeviceControl, Error, LinkFlags, Mode, Result};

/// What the loopback "kernel" has been told so far.
#[derive(Debug, Default)]
pub struct LinkState {
    pub mode: Option<Mode>,
    pub name: Option<String>,
    pub persistent: bool,
    pub flags: LinkFlags,
    pub mtu: u32,
    pub address: Option<(Ipv4Addr, Ipv4Addr)>,
    pub destination: Option<Ipv4Addr>,
    /// Operation name that should fail with `EINVAL` (or `EPERM` for
    /// `allocate`).
    pub fail_on: Option<&'static str>,
    /// The far end of the last allocated device.
    pub peer: Option<File>,
    /// Hand out the write end of a pipe as the device, so reads fail.
    pub write_only: bool,
}

/// Shared handle to a [`LinkState`].
#[derive(Debug, Clone, Default)]
pub struct LoopbackControl {
    state: Arc<Mutex<LinkState>>,
}

impl LoopbackControl {
    pub fn new() -> Self {
        let control = Self::default();
        control.state().mtu = 1500;
        control
    }

    /// Make `operation` fail.
    pub fn failing(operation: &'static str) -> Self {
        let control = Self::new();
        control.state().fail_on = Some(operation);
        control
    }

    /// Allocate devices that cannot be read from.
    pub fn write_only() -> Self {
        let control = Self::new();
        control.state().write_only = true;
        control
    }

    pub fn state(&self) -> MutexGuard<'_, LinkState> {
        self.state.lock().unwrap()
    }

    /// Take the far end of the device.
    pub fn take_peer(&self) -> File {
        self.state().peer.take().expect("no device allocated")
    }

    fn check(&self, operation: &'static str) -> Result<()> {
        if self.state().fail_on == Some(operation) {
            let errno = if operation == "allocate" {
                libc::EPERM
            } else {
                libc::EINVAL
            };
            return Err(Error::ioctl(operation, io::Error::from_raw_os_error(errno)));
        }
        Ok(())
    }
}

impl DeviceControl for LoopbackControl {
    fn allocate(&self, mode: Mode, name: &str) -> Result<Allocated> {
        self.check("allocate")?;

        let (device, peer) = if self.state().write_only {
            let (read, write) = pipe()?;
            (write, read)
        } else {
            seqpacket_pair()?
        };
        let name = name.replace("%d", "0");

        let mut state = self.state();
        state.mode = Some(mode);
        state.name = Some(name.clone());
        state.peer = Some(peer);

        Ok(Allocated { file: device, name })
    }

    fn set_persistent(&self, _fd: BorrowedFd<'_>, persistent: bool) -> Result<()> {
        self.check("set_persistent")?;
        self.state().persistent = persistent;
        Ok(())
    }

    fn flags(&self, _name: &str) -> Result<LinkFlags> {
        self.check("flags")?;
        Ok(self.state().flags)
    }

    fn replace_flags(&self, _name: &str, flags: LinkFlags) -> Result<()> {
        self.check("replace_flags")?;
        self.state().flags = flags;
        Ok(())
    }

    fn mtu(&self, _name: &str) -> Result<u32> {
        self.check("mtu")?;
        Ok(self.state().mtu)
    }

    fn set_mtu(&self, _name: &str, mtu: u32) -> Result<()> {
        self.check("set_mtu")?;
        self.state().mtu = mtu;
        Ok(())
    }

    fn set_address(&self, _name: &str, address: Ipv4Addr, netmask: Ipv4Addr) -> Result<()> {
        self.check("set_address")?;
        self.state().address = Some((address, netmask));
        Ok(())
    }

    fn set_destination_address(&self, _name: &str, address: Ipv4Addr) -> Result<()> {
        self.check("set_destination_address")?;
        self.state().destination = Some(address);
        Ok(())
    }
}

/// A connected `SOCK_SEQPACKET` pair: message boundaries are kept, like a
/// TUN/TAP descriptor.
pub fn seqpacket_pair() -> Result<(File, File)> {
    let mut fds = [0 as libc::c_int; 2];
    let ret = unsafe {
        libc::socketpair(
            libc::AF_UNIX,
            libc::SOCK_SEQPACKET | libc::SOCK_CLOEXEC,
            0,
            fds.as_mut_ptr(),
        )
    };
    if ret < 0 {
        return Err(Error::Io(io::Error::last_os_error()));
    }
    let (a, b) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
    Ok((File::from(a), File::from(b)))
}

/// A non-blocking pipe as `(read end, write end)`.
pub fn pipe() -> Result<(File, File)> {
    let mut fds = [0 as libc::c_int; 2];
    let ret = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC | libc::O_NONBLOCK) };
    if ret < 0 {
        return Err(Error::Io(io::Error::last_os_error()));
    }
    let (r, w) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
    Ok((File::from(r), File::from(w)))
}

/// Shrink the send buffer so a few writes fill the queue.
pub fn shrink_send_buffer(fd: RawFd) {
    let size: libc::c_int = 4096;
    let ret = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_SNDBUF,
            &size as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    assert_eq!(ret, 0, "setsockopt: {}", io::Error::last_os_error());
}

/// Number of descriptors open in this process.
pub fn open_fds() -> usize {
    std::fs::read_dir("/proc/self/fd").unwrap().count()
}

/// Upper bound for anything that is expected to finish promptly.
pub const PROMPT: Duration = Duration::from_secs(5);

/// Check if running as root.
pub fn is_root() -> bool {
    unsafe { libc::geteuid() == 0 }
}

/// Skip the test if not running as root.
///
/// Use this at the beginning of integration tests that require root privileges.
#[macro_export]
macro_rules! require_root {
    () => {
        if !crate::common::is_root() {
            eprintln!("Skipping test: requires root");
            return Ok(());
        }
    };
}

/// Install a `tracing` subscriber once; `RUST_LOG` controls the output.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .with_test_writer()
        .try_init();
}
