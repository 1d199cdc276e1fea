//! Reflect every ethernet frame arriving on a TAP device back to its sender.
//!
//! Run with: cargo run -p tunmux --example tap_echo
//!
//! Requires root privileges.
//!
//! Examples:
//!   sudo cargo run -p tunmux --example tap_echo -- tap0 10.200.0.1/255.255.255.0
//!   sudo RUST_LOG=tunmux=trace cargo run -p tunmux --example tap_echo -- tap0

use std::env;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tunmux::{Interface, Mode};

/// Destination and source MAC addresses.
const MAC_HEADER: usize = 12;

fn main() -> tunmux::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .init();

    let args: Vec<String> = env::args().collect();
    let name = args.get(1).map(String::as_str).unwrap_or("tap0");

    let dropped = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&dropped);

    let tap = Interface::builder()
        .name(name)
        .mode(Mode::Tap)
        .on_drop(move |_| {
            counter.fetch_add(1, Ordering::Relaxed);
        })
        .create()?;

    if let Some((address, netmask)) = args.get(2).and_then(|arg| arg.split_once('/')) {
        tap.set_address(address, netmask)?;
        println!("{} address {}/{}", tap.name(), address, netmask);
    }

    println!("Echoing frames on {} (MTU {})", tap.name(), tap.mtu());

    // MTU plus ethernet header, VLAN tag and FCS.
    let mut buf = vec![0u8; tap.mtu() as usize + 22];
    let mut frames = 0usize;
    loop {
        let n = tap.recv(&mut buf)?;
        if n == 0 {
            break;
        }
        if n < MAC_HEADER {
            continue;
        }

        let (dst, src) = buf[..MAC_HEADER].split_at_mut(6);
        dst.swap_with_slice(src);
        tap.send(&buf[..n])?;

        frames += 1;
        if frames % 100 == 0 {
            println!(
                "{} frames echoed, {} dropped",
                frames,
                dropped.load(Ordering::Relaxed)
            );
        }
    }

    println!("{} closed after {} frames", tap.name(), frames);
    Ok(())
}
