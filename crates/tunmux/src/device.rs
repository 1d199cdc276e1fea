//! TUN/TAP interface lifecycle and configuration.

use std::fmt;
use std::fs::File;
use std::io;
use std::net::Ipv4Addr;
use std::os::fd::{AsFd, AsRawFd, RawFd};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard};

use tracing::debug;

use crate::control::{Allocated, DeviceControl, KernelControl, LinkFlags};
use crate::error::{Error, Result};
use crate::readiness::{self, Consumer, Readiness};
use crate::stream::DropHook;
use crate::util::{addr, ifname};

/// MTU assumed when the kernel cannot be asked.
pub const DEFAULT_MTU: u32 = 1500;

/// Largest MTU a TUN/TAP link accepts.
pub const MAX_MTU: u32 = 65535;

// TUN/TAP flags (from linux/if_tun.h)
/// TUN device (Layer 3).
const IFF_TUN: libc::c_short = 0x0001;
/// TAP device (Layer 2).
const IFF_TAP: libc::c_short = 0x0002;

/// Device mode (TUN or TAP).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mode {
    /// TUN device - operates at Layer 3 (IP packets).
    Tun,
    /// TAP device - operates at Layer 2 (Ethernet frames).
    Tap,
}

impl Mode {
    /// Get the ifreq flag for this mode.
    pub(crate) fn flag(&self) -> libc::c_short {
        match self {
            Mode::Tun => IFF_TUN,
            Mode::Tap => IFF_TAP,
        }
    }

    /// Get the mode name.
    pub fn name(&self) -> &'static str {
        match self {
            Mode::Tun => "tun",
            Mode::Tap => "tap",
        }
    }
}

/// Administrative link state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    /// `IFF_UP` set.
    Up,
    /// `IFF_UP` cleared.
    Down,
}

/// Builder for creating interfaces.
#[derive(Clone, Default)]
pub struct InterfaceBuilder {
    name: Option<String>,
    mode: Option<Mode>,
    persistent: bool,
    control: Option<Arc<dyn DeviceControl>>,
    on_drop: Option<DropHook>,
}

impl InterfaceBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the device name.
    ///
    /// If not specified, the kernel picks the next free `tunN`/`tapN`.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set the device mode (TUN or TAP).
    pub fn mode(mut self, mode: Mode) -> Self {
        self.mode = Some(mode);
        self
    }

    /// Make the device persistent (survives close).
    pub fn persistent(mut self, persistent: bool) -> Self {
        self.persistent = persistent;
        self
    }

    /// Use a custom device control instead of [`KernelControl`].
    pub fn control(mut self, control: impl DeviceControl) -> Self {
        self.control = Some(Arc::new(control));
        self
    }

    /// Call `hook` with the payload length whenever a write is dropped
    /// because the device queue is full.
    pub fn on_drop(mut self, hook: impl Fn(usize) + Send + Sync + 'static) -> Self {
        self.on_drop = Some(Arc::new(hook));
        self
    }

    /// Allocate, configure and start watching the device.
    ///
    /// On failure, everything allocated so far is released.
    pub fn create(self) -> Result<Interface> {
        let mode = self.mode.ok_or(Error::NoModeSpecified)?;
        let requested = self
            .name
            .unwrap_or_else(|| format!("{}%d", mode.name()));
        ifname::validate(&requested)?;

        let control = self
            .control
            .unwrap_or_else(|| Arc::new(KernelControl::new()));

        let Allocated { file, name } = control
            .allocate(mode, &requested)
            .map_err(|e| e.into_allocation(&requested))?;
        debug!(device = %name, mode = mode.name(), "device allocated");

        // From here on, an early return drops `file`, which releases the
        // device node.
        let started = configure(control.as_ref(), &file, mode, &name, self.persistent)
            .and_then(|()| readiness::start(file.as_raw_fd(), &name));
        let (readiness, consumer) = match started {
            Ok(started) => started,
            Err(err) => {
                if self.persistent {
                    // Best effort: do not leave a half-configured persistent device.
                    if let Err(undo) = control.set_persistent(file.as_fd(), false) {
                        debug!(device = %name, error = %undo, "clearing persistence failed");
                    }
                }
                return Err(err);
            }
        };

        let mtu = control.mtu(&name).unwrap_or_else(|err| {
            debug!(device = %name, error = %err, "MTU query failed, assuming default");
            DEFAULT_MTU
        });

        debug!(device = %name, mtu, persistent = self.persistent, "interface created");

        Ok(Interface {
            mode,
            name,
            persistent: self.persistent,
            mtu: AtomicU32::new(mtu),
            file: RwLock::new(Some(file)),
            consumer: Mutex::new(consumer),
            lifecycle: Mutex::new(Some(readiness)),
            control,
            on_drop: self.on_drop,
        })
    }
}

impl fmt::Debug for InterfaceBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterfaceBuilder")
            .field("name", &self.name)
            .field("mode", &self.mode)
            .field("persistent", &self.persistent)
            .field("custom_control", &self.control.is_some())
            .finish_non_exhaustive()
    }
}

/// Everything between allocation and starting the readiness worker.
fn configure(
    control: &dyn DeviceControl,
    file: &File,
    mode: Mode,
    name: &str,
    persistent: bool,
) -> Result<()> {
    if persistent {
        control
            .set_persistent(file.as_fd(), true)
            .map_err(|e| e.with_context(format!("making {name} persistent")))?;
    }

    set_nonblocking(file).map_err(|e| e.with_context(format!("setting {name} non-blocking")))?;

    match mode {
        Mode::Tun => control
            .init_tunnel_link(name)
            .map_err(|e| e.with_context(format!("initializing tunnel link {name}"))),
        Mode::Tap => control
            .set_flags(name, LinkFlags::UP)
            .map_err(|e| e.with_context(format!("bringing {name} up"))),
    }
}

/// Set `O_NONBLOCK` on the device descriptor.
fn set_nonblocking(file: &File) -> Result<()> {
    let fd = file.as_raw_fd();

    // Get the current flags so they can be combined with `O_NONBLOCK`.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags == -1 {
        return Err(Error::Io(io::Error::last_os_error()));
    }

    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } == -1 {
        return Err(Error::Io(io::Error::last_os_error()));
    }

    Ok(())
}

/// A TUN/TAP interface.
///
/// Reads and writes go through [`std::io::Read`] and [`std::io::Write`], on
/// both `Interface` and `&Interface`. A read that finds nothing waits for the
/// readiness worker instead of spinning; a write that finds the device queue
/// full drops the payload and reports zero bytes written.
///
/// Only one read is served at a time. Concurrent readers are serialized.
pub struct Interface {
    mode: Mode,
    name: String,
    persistent: bool,
    mtu: AtomicU32,
    file: RwLock<Option<File>>,
    consumer: Mutex<Consumer>,
    lifecycle: Mutex<Option<Readiness>>,
    control: Arc<dyn DeviceControl>,
    on_drop: Option<DropHook>,
}

impl Interface {
    /// Create a new builder.
    pub fn builder() -> InterfaceBuilder {
        InterfaceBuilder::new()
    }

    /// Create an interface through the kernel.
    pub fn create(mode: Mode, name: &str, persistent: bool) -> Result<Self> {
        InterfaceBuilder::new()
            .mode(mode)
            .name(name)
            .persistent(persistent)
            .create()
    }

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

    /// The last MTU set through this interface, or the MTU the device had at
    /// creation.
    pub fn mtu(&self) -> u32 {
        self.mtu.load(Ordering::Relaxed)
    }

    /// Ask the kernel for the current MTU.
    pub fn query_mtu(&self) -> Result<u32> {
        self.control
            .mtu(&self.name)
            .map_err(|e| e.with_context(format!("reading MTU of {}", self.name)))
    }

    /// Set the MTU.
    pub fn set_mtu(&self, mtu: u32) -> Result<()> {
        if mtu == 0 || mtu > MAX_MTU {
            return Err(Error::InvalidMtu(mtu));
        }

        self.control
            .set_mtu(&self.name, mtu)
            .map_err(|e| e.with_context(format!("setting MTU {mtu} on {}", self.name)))?;
        self.mtu.store(mtu, Ordering::Relaxed);

        debug!(device = %self.name, mtu, "MTU set");
        Ok(())
    }

    /// Set the IPv4 address and netmask from dotted-quad strings.
    pub fn set_address(&self, address: &str, netmask: &str) -> Result<()> {
        let address = addr::parse_ipv4(address)?;
        let netmask = addr::parse_netmask(netmask)?;
        self.set_ipv4(address, netmask)
    }

    /// Set the IPv4 address and netmask from `s_addr` values (network byte
    /// order, as produced by `htonl`).
    pub fn set_binary_address(&self, address: u32, netmask: u32) -> Result<()> {
        let netmask = addr::from_s_addr(netmask);
        addr::check_netmask(netmask)?;
        self.set_ipv4(addr::from_s_addr(address), netmask)
    }

    /// Set the IPv4 address and netmask.
    pub fn set_ipv4(&self, address: Ipv4Addr, netmask: Ipv4Addr) -> Result<()> {
        self.control
            .set_address(&self.name, address, netmask)
            .map_err(|e| {
                e.with_context(format!(
                    "setting address {address}/{netmask} on {}",
                    self.name
                ))
            })?;

        debug!(device = %self.name, %address, %netmask, "address set");
        Ok(())
    }

    /// Add `flags` to the interface flags.
    pub fn set_flags(&self, flags: LinkFlags) -> Result<()> {
        self.control.set_flags(&self.name, flags).map_err(|e| {
            e.with_context(format!("setting flags {:#x} on {}", flags.bits(), self.name))
        })
    }

    /// Current interface flags.
    pub fn flags(&self) -> Result<LinkFlags> {
        self.control
            .flags(&self.name)
            .map_err(|e| e.with_context(format!("reading flags of {}", self.name)))
    }

    /// Bring the link administratively up or down.
    pub fn set_state(&self, state: State) -> Result<()> {
        let result = match state {
            State::Up => self.control.set_flags(&self.name, LinkFlags::UP),
            State::Down => self.control.clear_flags(&self.name, LinkFlags::UP),
        };
        result.map_err(|e| e.with_context(format!("setting {} {state:?}", self.name)))
    }

    /// Point-to-point configuration, available on TUN devices only.
    pub fn tunnel(&self) -> Option<Tunnel<'_>> {
        (self.mode == Mode::Tun).then_some(Tunnel { iface: self })
    }

    /// Get the raw file descriptor, or `None` once closed.
    pub fn as_raw_fd(&self) -> Option<RawFd> {
        self.file().as_ref().map(AsRawFd::as_raw_fd)
    }

    /// Check if the interface has been closed.
    pub fn is_closed(&self) -> bool {
        self.file().is_none()
    }

    /// Stop the readiness worker and close the device.
    ///
    /// Safe to call more than once and from several threads; only the first
    /// call has an effect. A read blocked on another thread returns `Ok(0)`.
    pub fn close(&self) {
        let mut lifecycle = self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(mut readiness) = lifecycle.take() else {
            return;
        };

        // Readers observe the terminal state before the worker is stopped.
        let file = self
            .file
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        readiness.shutdown();

        // The worker is joined; nothing references the descriptor anymore.
        drop(file);

        debug!(device = %self.name, "interface closed");
    }

    pub(crate) fn file(&self) -> RwLockReadGuard<'_, Option<File>> {
        self.file.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn consumer(&self) -> MutexGuard<'_, Consumer> {
        self.consumer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn drop_hook(&self) -> Option<&DropHook> {
        self.on_drop.as_ref()
    }

    /// Stop the worker and hand the device file to another readiness source.
    #[cfg(feature = "async")]
    pub(crate) fn detach(&self) -> Option<File> {
        let mut lifecycle = self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner);
        let mut readiness = lifecycle.take()?;
        let file = self
            .file
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        readiness.shutdown();
        file
    }

    #[cfg(feature = "async")]
    pub(crate) fn control(&self) -> &Arc<dyn DeviceControl> {
        &self.control
    }
}

impl Drop for Interface {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for Interface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Interface")
            .field("name", &self.name)
            .field("mode", &self.mode)
            .field("persistent", &self.persistent)
            .field("mtu", &self.mtu())
            .field("fd", &self.as_raw_fd())
            .finish_non_exhaustive()
    }
}

/// Point-to-point settings of a TUN interface.
#[derive(Debug, Clone, Copy)]
pub struct Tunnel<'a> {
    iface: &'a Interface,
}

impl Tunnel<'_> {
    /// Set the remote address from a dotted-quad string.
    pub fn set_destination_address(&self, address: &str) -> Result<()> {
        self.set_destination(addr::parse_ipv4(address)?)
    }

    /// Set the remote address from an `s_addr` value (network byte order).
    pub fn set_binary_destination_address(&self, address: u32) -> Result<()> {
        self.set_destination(addr::from_s_addr(address))
    }

    /// Set the remote address.
    pub fn set_destination(&self, address: Ipv4Addr) -> Result<()> {
        let name = self.iface.name();
        self.iface
            .control
            .set_destination_address(name, address)
            .map_err(|e| e.with_context(format!("setting destination {address} on {name}")))?;

        debug!(device = %name, %address, "destination set");
        Ok(())
    }
}
