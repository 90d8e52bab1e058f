//! io_uring-backed packet I/O for userspace VPN data planes.
//!
//! A VPN data plane spends its life in two syscalls: reading/writing
//! datagrams on a UDP socket, and reading/writing IP frames on a TUN
//! character device. This crate replaces both with a batched
//! submission/completion model: a fixed pool of pre-allocated request slots
//! is kept perpetually in flight against a pair of io_uring rings per
//! endpoint, and user-level calls reap or submit one operation and copy
//! between slot and caller buffers.
//!
//! Two adapters share the design:
//!
//! - [`UdpConn`] adapts an already-bound UDP socket, conveying peer
//!   addresses in both directions.
//! - [`TunDevice`] adapts a TUN character device through [`FileConn`],
//!   adding the 4-byte packet-information header framing the device expects.
//!
//! The accelerated path is opt-in (see [`config`]) and degrades to a
//! well-defined error set so callers can fall back to conventional sockets:
//! [`Error::Disabled`] when the gate is off, [`Error::Unsupported`] when the
//! kernel lacks an opcode.
//!
//! ```no_run
//! use std::net::UdpSocket;
//!
//! ringtun::set_enabled(true);
//! let socket = UdpSocket::bind("0.0.0.0:51820")?;
//! let conn = ringtun::UdpConn::new(socket)?;
//!
//! let mut packet = [0u8; ringtun::MAX_SEGMENT_SIZE];
//! let (n, peer) = conn.recv_from(&mut packet)?;
//! conn.send_to(&packet[..n], peer)?;
//! conn.close();
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

mod addr;
pub mod config;
mod error;
mod file;
mod probe;
mod ring;
mod slot;
mod tun;
mod udp;

pub use config::{ENABLE_ENV, MAX_SEGMENT_SIZE, set_enabled};
pub use error::{Error, Result};
pub use file::FileConn;
pub use tun::{PI_HEADER_LEN, TunDevice};
pub use udp::UdpConn;

use io_uring::opcode;

/// Whether the accelerated path can work here: the process-level gate is on
/// and the kernel supports every opcode the adapters use.
pub fn available() -> bool {
    config::enabled()
        && [
            opcode::RecvMsg::CODE,
            opcode::SendMsg::CODE,
            opcode::Readv::CODE,
            opcode::Writev::CODE,
            opcode::AsyncCancel::CODE,
        ]
        .into_iter()
        .all(probe::supports)
}
