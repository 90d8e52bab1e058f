//! File adapter: readv/writev over a pair of io_uring rings.
//!
//! Same request-pool shape as the UDP adapter, with two deviations. The read
//! ring carries exactly one slot: the tun driver serializes concurrent
//! preadv calls, so extra slots only pile up behind a kernel-side lock. And
//! close needs no cancellation loop: closing the underlying descriptor is
//! enough to complete in-kernel reads with a bad-fd errno, which maps to the
//! ordinary closed error.

use std::fs::File;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam_channel::{Receiver, Sender, bounded};
use io_uring::opcode;
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::config::{self, FILE_READ_SLOTS, FILE_WRITE_SLOTS, MAX_SEGMENT_SIZE, RING_DEPTH};
use crate::error::{Error, Result};
use crate::probe;
use crate::ring::{Reaped, Ring};
use crate::slot::{Slot, slot_array};

fn is_bad_fd(errno: i32) -> bool {
    // The tun driver reports EBADFD once the device descriptor is gone;
    // EBADF appears when the fd number itself was closed first.
    errno == libc::EBADF || errno == libc::EBADFD
}

/// A character-device file accelerated by a pair of io_uring rings.
pub struct FileConn {
    // Rings before slots: drop order tears the kernel side down first.
    read_ring: Ring,
    write_ring: Ring,
    read_slots: Box<[Slot]>,
    write_slots: Box<[Slot]>,
    free_write_tx: Sender<usize>,
    free_write_rx: Receiver<usize>,
    /// The open device. Taken and dropped by `close`; must outlive the
    /// rings otherwise.
    file: Mutex<Option<File>>,
    raw_fd: RawFd,
    closed: AtomicBool,
}

impl std::fmt::Debug for FileConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileConn")
            .field("raw_fd", &self.raw_fd)
            .field("closed", &self.closed.load(std::sync::atomic::Ordering::Relaxed))
            .finish()
    }
}

impl FileConn {
    /// Adapt an already-open character device, taking ownership of it.
    pub fn new(file: File) -> Result<FileConn> {
        if !config::enabled() {
            return Err(Error::Disabled);
        }
        for (name, code) in [
            ("readv", opcode::Readv::CODE),
            ("writev", opcode::Writev::CODE),
        ] {
            if !probe::supports(code) {
                return Err(Error::Unsupported(name));
            }
        }

        let raw_fd = file.as_raw_fd();
        let read_ring = Ring::new(raw_fd, RING_DEPTH)?;
        let write_ring = Ring::new(raw_fd, RING_DEPTH)?;
        let read_slots = slot_array(FILE_READ_SLOTS);
        let write_slots = slot_array(FILE_WRITE_SLOTS);

        let (free_write_tx, free_write_rx) = bounded(FILE_WRITE_SLOTS);
        for idx in 0..FILE_WRITE_SLOTS {
            let _ = free_write_tx.send(idx);
        }

        let conn = FileConn {
            read_ring,
            write_ring,
            read_slots,
            write_slots,
            free_write_tx,
            free_write_rx,
            file: Mutex::new(Some(file)),
            raw_fd,
            closed: AtomicBool::new(false),
        };

        for idx in 0..FILE_READ_SLOTS {
            conn.submit_read(idx)?;
        }
        debug!(fd = raw_fd, "file adapter up");
        Ok(conn)
    }

    /// A new handle to the underlying device, while it is still open.
    pub fn try_clone_file(&self) -> Option<File> {
        self.file.lock().as_ref().and_then(|f| f.try_clone().ok())
    }

    /// Read one transfer from the device into `buf`.
    ///
    /// Returns the transfer's full length; a shorter `buf` truncates the
    /// copy but not the reported length.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        let (res, tag) = match self.read_ring.reap(true)? {
            Reaped::Completion { res, tag } => (res, tag),
            Reaped::Empty => unreachable!("blocking reap returned empty"),
        };
        let idx = tag as usize;
        let slot = &self.read_slots[idx];
        slot.mark_reaped();

        if res < 0 {
            if is_bad_fd(-res) {
                // The device went away under us: ordinary shutdown.
                return Err(Error::Closed);
            }
            if -res != libc::ECANCELED {
                // Best-effort resubmit so the slot isn't leaked.
                if let Err(e) = self.submit_read(idx) {
                    trace!(slot = idx, error = %e, "resubmit after failed readv also failed");
                }
            }
            return Err(Error::from_cqe(res));
        }

        let n = res as usize;
        let take = n.min(buf.len());
        buf[..take].copy_from_slice(slot.payload(take));
        self.submit_read(idx)?;
        Ok(n)
    }

    /// Write one transfer to the device.
    ///
    /// Best-effort like the UDP send path: a kernel-level failure surfaces
    /// on a later call that has to wait for a slot.
    pub fn write(&self, buf: &[u8]) -> Result<usize> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        if buf.len() > MAX_SEGMENT_SIZE {
            return Err(Error::Syscall(std::io::Error::from_raw_os_error(
                libc::EMSGSIZE,
            )));
        }

        let idx = match self.free_write_rx.try_recv() {
            Ok(idx) => idx,
            Err(_) => match self.write_ring.reap(true)? {
                Reaped::Completion { res, tag } => {
                    let idx = tag as usize;
                    self.write_slots[idx].mark_reaped();
                    if res < 0 {
                        let _ = self.free_write_tx.send(idx);
                        if is_bad_fd(-res) {
                            return Err(Error::Closed);
                        }
                        return Err(Error::from_cqe(res));
                    }
                    idx
                }
                Reaped::Empty => unreachable!("blocking reap returned empty"),
            },
        };

        let slot = &self.write_slots[idx];
        slot.fill_payload(buf);
        slot.mark_in_kernel();
        if let Err(e) = self.write_ring.submit_writev(slot.iovec_ptr(), idx as u64) {
            slot.unmark_in_kernel();
            let _ = self.free_write_tx.send(idx);
            return Err(e);
        }

        if let Ok(Reaped::Completion { res, tag }) = self.write_ring.reap(false) {
            let idx = tag as usize;
            self.write_slots[idx].mark_reaped();
            if res < 0 {
                trace!(slot = idx, errno = -res, "reclaimed write slot from failed writev");
            }
            let _ = self.free_write_tx.send(idx);
        }

        Ok(buf.len())
    }

    /// Shut the adapter down. Idempotent.
    ///
    /// Closing the descriptor completes in-kernel reads with a bad-fd errno,
    /// so unlike the UDP adapter there is no cancellation loop to run.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(fd = self.raw_fd, "closing file adapter");
        drop(self.file.lock().take());
    }

    fn submit_read(&self, idx: usize) -> Result<()> {
        let slot = &self.read_slots[idx];
        slot.reset_for_read();
        slot.mark_in_kernel();
        if let Err(e) = self.read_ring.submit_readv(slot.iovec_ptr(), idx as u64) {
            slot.unmark_in_kernel();
            return Err(e);
        }
        Ok(())
    }
}

impl Drop for FileConn {
    fn drop(&mut self) {
        self.close();
        // Reap whatever completions the closed descriptor produced so no
        // slot is still kernel-referenced when the buffers are freed. The
        // rings' own teardown (field order) covers anything that remains.
        while let Ok(Reaped::Completion { tag, .. }) = self.read_ring.reap(false) {
            self.read_slots[tag as usize].mark_reaped();
        }
        while let Ok(Reaped::Completion { tag, .. }) = self.write_ring.reap(false) {
            self.write_slots[tag as usize].mark_reaped();
        }
    }
}
