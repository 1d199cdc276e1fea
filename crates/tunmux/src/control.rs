//! Privileged device control.
//!
//! [`DeviceControl`] is everything the interface lifecycle needs from the
//! kernel: allocating the device node and configuring the link. The core never
//! issues these requests itself, so tests can substitute their own
//! implementation. [`KernelControl`] is the Linux implementation built on
//! `/dev/net/tun` and the classic `SIOC*IF*` ioctls.

use std::fs::{File, OpenOptions};
use std::net::Ipv4Addr;
use std::ops::{BitAnd, BitOr, BitOrAssign, Not};
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd};

use crate::TUN_DEVICE_PATH;
use crate::device::Mode;
use crate::error::{Error, Result};
use crate::util::{addr, ifname};

// TUN/TAP ioctl constants
const TUNSETIFF: libc::c_ulong = 0x400454ca;
const TUNSETPERSIST: libc::c_ulong = 0x400454cb;

/// No protocol information.
const IFF_NO_PI: libc::c_short = 0x1000;

/// Interface flags as carried by `SIOCGIFFLAGS`/`SIOCSIFFLAGS`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct LinkFlags(u16);

impl LinkFlags {
    /// No flags.
    pub const EMPTY: Self = Self(0);
    /// Interface is administratively up.
    pub const UP: Self = Self(libc::IFF_UP as u16);
    /// Broadcast address valid.
    pub const BROADCAST: Self = Self(libc::IFF_BROADCAST as u16);
    /// Point-to-point link.
    pub const POINTOPOINT: Self = Self(libc::IFF_POINTOPOINT as u16);
    /// Resources allocated.
    pub const RUNNING: Self = Self(libc::IFF_RUNNING as u16);
    /// No ARP protocol.
    pub const NOARP: Self = Self(libc::IFF_NOARP as u16);
    /// Supports multicast.
    pub const MULTICAST: Self = Self(libc::IFF_MULTICAST as u16);

    /// Flags applied when bringing up a point-to-point tunnel link.
    pub const TUNNEL_LINK: Self =
        Self(Self::UP.0 | Self::POINTOPOINT.0 | Self::RUNNING.0 | Self::NOARP.0);

    /// Build from raw `IFF_*` bits.
    pub const fn from_bits(bits: u16) -> Self {
        Self(bits)
    }

    /// Raw `IFF_*` bits.
    pub const fn bits(self) -> u16 {
        self.0
    }

    /// Check whether all of `other` is set.
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    fn as_short(self) -> libc::c_short {
        self.0 as libc::c_short
    }
}

impl BitOr for LinkFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for LinkFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for LinkFlags {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl Not for LinkFlags {
    type Output = Self;

    fn not(self) -> Self {
        Self(!self.0)
    }
}

/// A freshly allocated device node.
#[derive(Debug)]
pub struct Allocated {
    /// The device file; closing it releases the device unless it is persistent.
    pub file: File,
    /// The name the kernel gave the device.
    pub name: String,
}

/// Privileged control over TUN/TAP devices.
///
/// Every method takes the device name (or its descriptor) and primitive
/// values, and reports the system error unchanged. Context is attached by the
/// caller.
pub trait DeviceControl: Send + Sync + 'static {
    /// Allocate a device of the given mode.
    fn allocate(&self, mode: Mode, name: &str) -> Result<Allocated>;

    /// Mark the device as persistent (or not).
    fn set_persistent(&self, fd: BorrowedFd<'_>, persistent: bool) -> Result<()>;

    /// Current interface flags.
    fn flags(&self, name: &str) -> Result<LinkFlags>;

    /// Overwrite the interface flags.
    fn replace_flags(&self, name: &str, flags: LinkFlags) -> Result<()>;

    /// Current MTU.
    fn mtu(&self, name: &str) -> Result<u32>;

    /// Set the MTU.
    fn set_mtu(&self, name: &str, mtu: u32) -> Result<()>;

    /// Set the local IPv4 address and netmask.
    fn set_address(&self, name: &str, address: Ipv4Addr, netmask: Ipv4Addr) -> Result<()>;

    /// Set the remote end of a point-to-point link.
    fn set_destination_address(&self, name: &str, address: Ipv4Addr) -> Result<()>;

    /// Add `flags` to the interface flags.
    fn set_flags(&self, name: &str, flags: LinkFlags) -> Result<()> {
        let current = self.flags(name)?;
        self.replace_flags(name, current | flags)
    }

    /// Remove `flags` from the interface flags.
    fn clear_flags(&self, name: &str, flags: LinkFlags) -> Result<()> {
        let current = self.flags(name)?;
        self.replace_flags(name, current & !flags)
    }

    /// Bring a point-to-point tunnel link up at the IP layer.
    fn init_tunnel_link(&self, name: &str) -> Result<()> {
        self.set_flags(name, LinkFlags::TUNNEL_LINK)
    }
}

/// [`DeviceControl`] backed by the Linux kernel.
///
/// Requires `CAP_NET_ADMIN`.
#[derive(Debug, Clone, Copy, Default)]
pub struct KernelControl {
    packet_info: bool,
}

impl KernelControl {
    /// Create a kernel control without packet information headers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Prefix every packet with the 4-byte flags/protocol header.
    pub fn packet_info(mut self, value: bool) -> Self {
        self.packet_info = value;
        self
    }

    fn ifreq_ioctl(
        &self,
        ioctl: &'static str,
        request: libc::c_ulong,
        ifr: &mut libc::ifreq,
    ) -> Result<()> {
        let sock = control_socket()?;
        let ret = unsafe { libc::ioctl(sock.as_raw_fd(), request, ifr as *mut libc::ifreq) };
        if ret < 0 {
            return Err(Error::last_ioctl(ioctl));
        }
        Ok(())
    }

    fn set_sockaddr(
        &self,
        ioctl: &'static str,
        request: libc::c_ulong,
        name: &str,
        address: Ipv4Addr,
    ) -> Result<()> {
        let mut ifr = ifname::ifreq(name);
        let sin = addr::sockaddr_in(address);
        // SAFETY: sockaddr_in and sockaddr have the same size, and every
        // address member of the ifreq union shares this storage.
        unsafe {
            std::ptr::write(
                &raw mut ifr.ifr_ifru.ifru_addr as *mut libc::sockaddr_in,
                sin,
            );
        }
        self.ifreq_ioctl(ioctl, request, &mut ifr)
    }
}

impl DeviceControl for KernelControl {
    fn allocate(&self, mode: Mode, name: &str) -> Result<Allocated> {
        ifname::validate(name)?;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(TUN_DEVICE_PATH)?;

        let mut ifr = ifname::ifreq(name);
        let mut flags = mode.flag();
        if !self.packet_info {
            flags |= IFF_NO_PI;
        }
        ifr.ifr_ifru.ifru_flags = flags;

        let ret = unsafe { libc::ioctl(file.as_raw_fd(), TUNSETIFF, &mut ifr as *mut libc::ifreq) };
        if ret < 0 {
            return Err(Error::last_ioctl("TUNSETIFF"));
        }

        Ok(Allocated {
            file,
            name: ifname::from_ifreq(&ifr),
        })
    }

    fn set_persistent(&self, fd: BorrowedFd<'_>, persistent: bool) -> Result<()> {
        let value = libc::c_int::from(persistent);
        let ret = unsafe { libc::ioctl(fd.as_raw_fd(), TUNSETPERSIST, value as libc::c_ulong) };
        if ret < 0 {
            return Err(Error::last_ioctl("TUNSETPERSIST"));
        }
        Ok(())
    }

    fn flags(&self, name: &str) -> Result<LinkFlags> {
        let mut ifr = ifname::ifreq(name);
        self.ifreq_ioctl("SIOCGIFFLAGS", libc::SIOCGIFFLAGS, &mut ifr)?;
        let bits = unsafe { ifr.ifr_ifru.ifru_flags };
        Ok(LinkFlags::from_bits(bits as u16))
    }

    fn replace_flags(&self, name: &str, flags: LinkFlags) -> Result<()> {
        let mut ifr = ifname::ifreq(name);
        ifr.ifr_ifru.ifru_flags = flags.as_short();
        self.ifreq_ioctl("SIOCSIFFLAGS", libc::SIOCSIFFLAGS, &mut ifr)
    }

    fn mtu(&self, name: &str) -> Result<u32> {
        let mut ifr = ifname::ifreq(name);
        self.ifreq_ioctl("SIOCGIFMTU", libc::SIOCGIFMTU, &mut ifr)?;
        let mtu = unsafe { ifr.ifr_ifru.ifru_mtu };
        Ok(mtu as u32)
    }

    fn set_mtu(&self, name: &str, mtu: u32) -> Result<()> {
        let mut ifr = ifname::ifreq(name);
        ifr.ifr_ifru.ifru_mtu = libc::c_int::try_from(mtu).map_err(|_| Error::InvalidMtu(mtu))?;
        self.ifreq_ioctl("SIOCSIFMTU", libc::SIOCSIFMTU, &mut ifr)
    }

    fn set_address(&self, name: &str, address: Ipv4Addr, netmask: Ipv4Addr) -> Result<()> {
        self.set_sockaddr("SIOCSIFADDR", libc::SIOCSIFADDR, name, address)?;
        self.set_sockaddr("SIOCSIFNETMASK", libc::SIOCSIFNETMASK, name, netmask)
    }

    fn set_destination_address(&self, name: &str, address: Ipv4Addr) -> Result<()> {
        self.set_sockaddr("SIOCSIFDSTADDR", libc::SIOCSIFDSTADDR, name, address)
    }
}

/// Open the `AF_INET` datagram socket the `SIOC*IF*` ioctls are issued on.
fn control_socket() -> Result<OwnedFd> {
    let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM | libc::SOCK_CLOEXEC, 0) };
    if fd < 0 {
        return Err(Error::Io(std::io::Error::last_os_error()));
    }
    // SAFETY: fd was just returned by socket() and is owned by nobody else.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_link_flags_ops() {
        let flags = LinkFlags::UP | LinkFlags::MULTICAST;
        assert!(flags.contains(LinkFlags::UP));
        assert!(!flags.contains(LinkFlags::NOARP));
        assert_eq!((flags & !LinkFlags::UP), LinkFlags::MULTICAST);
        assert!(LinkFlags::TUNNEL_LINK.contains(LinkFlags::UP | LinkFlags::POINTOPOINT));
        assert_eq!(LinkFlags::UP.bits(), libc::IFF_UP as u16);
    }

    /// Records flag writes to check the provided methods.
    struct FlagStore(Mutex<LinkFlags>);

    impl DeviceControl for FlagStore {
        fn allocate(&self, _mode: Mode, _name: &str) -> Result<Allocated> {
            Err(Error::Io(std::io::Error::from_raw_os_error(libc::ENOTSUP)))
        }
        fn set_persistent(&self, _fd: BorrowedFd<'_>, _persistent: bool) -> Result<()> {
            Ok(())
        }
        fn flags(&self, _name: &str) -> Result<LinkFlags> {
            Ok(*self.0.lock().unwrap())
        }
        fn replace_flags(&self, _name: &str, flags: LinkFlags) -> Result<()> {
            *self.0.lock().unwrap() = flags;
            Ok(())
        }
        fn mtu(&self, _name: &str) -> Result<u32> {
            Ok(1500)
        }
        fn set_mtu(&self, _name: &str, _mtu: u32) -> Result<()> {
            Ok(())
        }
        fn set_address(&self, _name: &str, _a: Ipv4Addr, _m: Ipv4Addr) -> Result<()> {
            Ok(())
        }
        fn set_destination_address(&self, _name: &str, _a: Ipv4Addr) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_set_and_clear_flags_preserve_others() {
        let store = FlagStore(Mutex::new(LinkFlags::BROADCAST | LinkFlags::MULTICAST));

        store.set_flags("t0", LinkFlags::UP).unwrap();
        assert_eq!(
            store.flags("t0").unwrap(),
            LinkFlags::BROADCAST | LinkFlags::MULTICAST | LinkFlags::UP
        );

        store.clear_flags("t0", LinkFlags::UP).unwrap();
        assert_eq!(
            store.flags("t0").unwrap(),
            LinkFlags::BROADCAST | LinkFlags::MULTICAST
        );
    }

    #[test]
    fn test_init_tunnel_link() {
        let store = FlagStore(Mutex::new(LinkFlags::EMPTY));
        store.init_tunnel_link("tun0").unwrap();
        assert_eq!(store.flags("tun0").unwrap(), LinkFlags::TUNNEL_LINK);
    }

    #[test]
    fn test_kernel_control_rejects_bad_name() {
        let err = KernelControl::new()
            .allocate(Mode::Tun, "name_that_is_too_long")
            .unwrap_err();
        assert!(matches!(err, Error::NameTooLong { .. }));
    }
}
