//! IPv4 address and netmask parsing.

use std::net::Ipv4Addr;

use crate::error::{Error, Result};

/// Parse a dotted-quad IPv4 address.
pub fn parse_ipv4(s: &str) -> Result<Ipv4Addr> {
    s.trim()
        .parse()
        .map_err(|_| Error::InvalidAddress(s.to_string()))
}

/// Parse a dotted-quad netmask, rejecting non-contiguous masks.
pub fn parse_netmask(s: &str) -> Result<Ipv4Addr> {
    let mask = parse_ipv4(s)?;
    check_netmask(mask)?;
    Ok(mask)
}

/// Reject netmasks whose one bits are not a contiguous prefix.
pub fn check_netmask(mask: Ipv4Addr) -> Result<()> {
    if netmask_prefix(mask).is_none() {
        return Err(Error::InvalidAddress(format!(
            "{mask} is not a contiguous netmask"
        )));
    }
    Ok(())
}

/// Prefix length of a contiguous netmask.
pub fn netmask_prefix(mask: Ipv4Addr) -> Option<u8> {
    let bits = u32::from(mask);
    let ones = bits.leading_ones();
    if bits.checked_shl(ones).unwrap_or(0) != 0 {
        return None;
    }
    Some(ones as u8)
}

/// Decode an `s_addr` value: the address in network byte order, stored in a
/// native `u32`.
pub fn from_s_addr(s_addr: u32) -> Ipv4Addr {
    Ipv4Addr::from(u32::from_be(s_addr))
}

/// Build a `sockaddr_in` for an ioctl request.
pub(crate) fn sockaddr_in(addr: Ipv4Addr) -> libc::sockaddr_in {
    libc::sockaddr_in {
        sin_family: libc::AF_INET as libc::sa_family_t,
        sin_port: 0,
        sin_addr: libc::in_addr {
            s_addr: u32::from(addr).to_be(),
        },
        sin_zero: [0; 8],
    }
}
