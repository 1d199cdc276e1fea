//! Interface name validation and `ifreq` packing.

use crate::error::{Error, Result};

/// Maximum interface name length (including null terminator).
pub const IFNAMSIZ: usize = libc::IFNAMSIZ;

/// Validate an interface name.
pub fn validate(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::InvalidName("empty name".to_string()));
    }

    if name.len() >= IFNAMSIZ {
        return Err(Error::NameTooLong {
            name: name.to_string(),
            len: name.len(),
        });
    }

    if name.contains('/') || name.contains('\0') {
        return Err(Error::InvalidName(format!(
            "{name:?} contains invalid characters"
        )));
    }

    if name.chars().any(|c| c.is_whitespace()) {
        return Err(Error::InvalidName(format!("{name:?} contains whitespace")));
    }

    Ok(())
}

/// Build a zeroed `ifreq` carrying `name`.
///
/// The name must already have passed [`validate`].
pub fn ifreq(name: &str) -> libc::ifreq {
    let mut ifr: libc::ifreq = unsafe { std::mem::zeroed() };
    for (dst, src) in ifr.ifr_name.iter_mut().zip(name.as_bytes()) {
        *dst = *src as libc::c_char;
    }
    ifr
}

/// Read the (possibly kernel-assigned) name back out of an `ifreq`.
pub fn from_ifreq(ifr: &libc::ifreq) -> String {
    let bytes: Vec<u8> = ifr
        .ifr_name
        .iter()
        .take_while(|&&c| c != 0)
        .map(|&c| c as u8)
        .collect();
    String::from_utf8_lossy(&bytes).into_owned()
}
