//! TUN framing shim: packet-oriented reads and writes over the file
//! adapter, with the 4-byte packet-information header the tun device
//! expects around each IP frame.
//!
//! The caller reserves `PI_HEADER_LEN` bytes of scratch in front of every
//! packet (the usual VPN buffer layout); read and write both operate on
//! `buf[offset - 4..]` so no extra copy is needed for the header.

use std::fs::File;
use std::io;

use crossbeam_channel::Receiver;

use crate::error::{Error, Result};
use crate::file::FileConn;

/// Length of the packet-information header.
pub const PI_HEADER_LEN: usize = 4;

const ETHERTYPE_IPV4: [u8; 2] = [0x08, 0x00];
const ETHERTYPE_IPV6: [u8; 2] = [0x86, 0xdd];

/// The PI header for a packet whose first byte is `first`: two zero flag
/// bytes, then the EtherType chosen from the IP version nibble.
fn pi_header(first: u8) -> [u8; PI_HEADER_LEN] {
    let ethertype = if first >> 4 == 6 {
        ETHERTYPE_IPV6
    } else {
        ETHERTYPE_IPV4
    };
    [0, 0, ethertype[0], ethertype[1]]
}

/// A layer-3 TUN device accelerated through the file adapter.
pub struct TunDevice {
    file: FileConn,
    /// Errors surfaced by the outer device wrapper (link state, device
    /// teardown). Checked before each read.
    errors: Option<Receiver<io::Error>>,
}

impl TunDevice {
    /// Wrap an already-open TUN character device.
    pub fn new(device: File) -> Result<TunDevice> {
        Ok(TunDevice {
            file: FileConn::new(device)?,
            errors: None,
        })
    }

    /// Wrap a TUN device whose outer wrapper reports asynchronous errors on
    /// a channel. The channel is polled before each read and exposed via
    /// [`errors`](TunDevice::errors).
    pub fn with_error_channel(device: File, errors: Receiver<io::Error>) -> Result<TunDevice> {
        Ok(TunDevice {
            file: FileConn::new(device)?,
            errors: Some(errors),
        })
    }

    /// The device wrapper's error channel, if one was supplied.
    pub fn errors(&self) -> Option<&Receiver<io::Error>> {
        self.errors.as_ref()
    }

    /// A new handle to the backing device file, while it is still open.
    pub fn file(&self) -> Option<File> {
        self.file.try_clone_file()
    }

    /// Read one IP packet into `buf[offset..]`.
    ///
    /// The 4 bytes at `buf[offset - 4..offset]` are scratch for the PI
    /// header and may be overwritten. Returns the packet length, header
    /// excluded.
    ///
    /// # Panics
    ///
    /// Panics if `offset < PI_HEADER_LEN` or `offset > buf.len()`.
    pub fn read(&self, buf: &mut [u8], offset: usize) -> Result<usize> {
        assert!((PI_HEADER_LEN..=buf.len()).contains(&offset));
        if let Some(rx) = &self.errors
            && let Ok(e) = rx.try_recv()
        {
            return Err(Error::Syscall(e));
        }
        let n = self.file.read(&mut buf[offset - PI_HEADER_LEN..])?;
        Ok(n.saturating_sub(PI_HEADER_LEN))
    }

    /// Write the IP packet at `buf[offset..]` to the device.
    ///
    /// The 4 bytes at `buf[offset - 4..offset]` are overwritten with the PI
    /// header; the version nibble of `buf[offset]` selects the EtherType.
    /// Returns the number of bytes written, header included.
    ///
    /// # Panics
    ///
    /// Panics if `offset < PI_HEADER_LEN` or `offset >= buf.len()`.
    pub fn write(&self, buf: &mut [u8], offset: usize) -> Result<usize> {
        assert!(offset >= PI_HEADER_LEN && offset < buf.len());
        let header = pi_header(buf[offset]);
        buf[offset - PI_HEADER_LEN..offset].copy_from_slice(&header);
        self.file.write(&buf[offset - PI_HEADER_LEN..])
    }

    /// Shut the device down. Idempotent.
    pub fn close(&self) {
        self.file.close();
    }
}
