//! TUN/TAP devices as blocking byte streams.
//!
//! This crate creates and configures TUN (network tunnel) and TAP (ethernet
//! tunnel) devices on Linux and exposes them through [`std::io::Read`] and
//! [`std::io::Write`]. The device descriptor is non-blocking; a read that
//! finds no packet parks on a per-interface readiness worker (one epoll set,
//! one thread) instead of holding a thread in `read(2)`.
//!
//! # Overview
//!
//! - [`Interface`] owns the device and its readiness worker and carries the
//!   configuration API (MTU, addresses, flags, link state).
//! - [`DeviceControl`] is the privileged side: allocation and ioctls.
//!   [`KernelControl`] is the default implementation.
//! - Writes never block. When the device queue is full the packet is dropped,
//!   `Ok(0)` is returned and the optional drop hook is called.
//!
//! # Example
//!
//! ```ignore
//! use std::io::Read;
//! use tunmux::{Interface, Mode};
//!
//! let tap = Interface::builder()
//!     .name("tap0")
//!     .mode(Mode::Tap)
//!     .on_drop(|len| eprintln!("dropped {len} bytes"))
//!     .create()?;
//!
//! tap.set_mtu(1300)?;
//! tap.set_address("10.0.0.1", "255.255.255.0")?;
//!
//! let mut buf = [0u8; 1522];
//! let n = (&tap).read(&mut buf)?;
//! println!("frame of {n} bytes");
//!
//! tap.close();
//! ```
//!
//! # Tunnels
//!
//! Point-to-point settings only exist on TUN devices:
//!
//! ```ignore
//! let tun = Interface::create(Mode::Tun, "tun0", false)?;
//! if let Some(p2p) = tun.tunnel() {
//!     p2p.set_destination_address("10.0.0.2")?;
//! }
//! ```
//!
//! # Features
//!
//! - `async` - [`AsyncInterface`] driven by tokio's reactor

mod control;
mod device;
mod error;
mod readiness;
mod stream;
pub mod util;

#[cfg(feature = "async")]
mod async_io;

pub use control::{Allocated, DeviceControl, KernelControl, LinkFlags};
pub use device::{DEFAULT_MTU, Interface, InterfaceBuilder, MAX_MTU, Mode, State, Tunnel};
pub use error::{Error, Result};
pub use stream::DropHook;

#[cfg(feature = "async")]
pub use async_io::AsyncInterface;

/// The path to the TUN device.
pub const TUN_DEVICE_PATH: &str = "/dev/net/tun";
