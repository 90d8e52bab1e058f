//! Process-level enable gate and fixed sizing.
//!
//! The accelerated path is opt-in: constructors fail with
//! [`Error::Disabled`](crate::Error::Disabled) unless the gate is switched on,
//! either through the `RINGTUN_IO_URING` environment variable or
//! programmatically via [`set_enabled`] (for applications that carry their own
//! flag parsing). A programmatic setting takes precedence over the
//! environment.

use std::sync::atomic::{AtomicU8, Ordering};

/// Largest possible UDP datagram, and the VPN's per-packet maximum payload.
/// Every slot buffer is this size.
pub const MAX_SEGMENT_SIZE: usize = (1 << 16) - 1;

/// Environment variable that switches the accelerated path on.
/// Any value other than `0` or the empty string enables it.
pub const ENABLE_ENV: &str = "RINGTUN_IO_URING";

/// Slots per direction on the UDP adapter.
pub(crate) const UDP_SLOTS: usize = 8;

/// Read slots on the file adapter. The tun driver serializes concurrent
/// preadv calls, so more than one only adds kernel-side contention.
pub(crate) const FILE_READ_SLOTS: usize = 1;

/// Write slots on the file adapter.
pub(crate) const FILE_WRITE_SLOTS: usize = 8;

/// Submission queue depth for every ring; must cover the slot count.
pub(crate) const RING_DEPTH: u32 = 8;

const GATE_ENV: u8 = 0;
const GATE_OFF: u8 = 1;
const GATE_ON: u8 = 2;

static GATE: AtomicU8 = AtomicU8::new(GATE_ENV);

/// Force the accelerated path on or off for this process, overriding the
/// environment.
pub fn set_enabled(on: bool) {
    GATE.store(if on { GATE_ON } else { GATE_OFF }, Ordering::Relaxed);
}

/// Whether the accelerated path is switched on.
pub fn enabled() -> bool {
    match GATE.load(Ordering::Relaxed) {
        GATE_ON => true,
        GATE_OFF => false,
        _ => match std::env::var(ENABLE_ENV) {
            Ok(v) => !v.is_empty() && v != "0",
            Err(_) => false,
        },
    }
}
