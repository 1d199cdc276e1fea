//! Shared utilities for tunmux.

pub mod addr;
pub mod ifname;

pub use addr::{check_netmask, from_s_addr, netmask_prefix, parse_ipv4, parse_netmask};
