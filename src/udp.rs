//! UDP adapter: packet-oriented reads and writes over a pair of io_uring
//! rings.
//!
//! All eight recv slots are lodged in the kernel at construction and
//! resubmitted after every completion, so a datagram is already waiting in a
//! slot buffer by the time a reader asks for it. Send slots rotate through a
//! bounded free-slot channel; a writer that finds the channel empty pays for
//! one blocking reap, which is also where errors from earlier sends surface.
//!
//! Shutdown is the delicate part: readers park inside a blocking reap and
//! cannot be interrupted directly, so `close` cancels the in-kernel recv
//! operations and polls until every reader has drained. See `close` for why
//! this is a busy-wait rather than a lock.

use std::net::{SocketAddr, UdpSocket};
use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, bounded};
use io_uring::opcode;
use socket2::SockRef;
use tracing::{debug, trace, warn};

use crate::addr;
use crate::config::{self, MAX_SEGMENT_SIZE, RING_DEPTH, UDP_SLOTS};
use crate::error::{Error, Result};
use crate::probe;
use crate::ring::{Reaped, Ring};
use crate::slot::{Slot, slot_array};

/// How long `close` keeps re-issuing cancellations for completions nobody
/// reaped before giving up and leaving teardown to the ring's own cleanup.
const CLOSE_DRAIN_ROUNDS: u32 = 100;

/// A UDP socket accelerated by a pair of io_uring rings.
///
/// Any number of threads may call [`recv_from`](UdpConn::recv_from) and
/// [`send_to`](UdpConn::send_to) concurrently. [`close`](UdpConn::close) may
/// be called from any thread, once or many times.
pub struct UdpConn {
    // Rings are declared before the slot arrays: drop tears the rings (and
    // with them every outstanding kernel reference) down before the slot
    // buffers are freed.
    recv_ring: Ring,
    send_ring: Ring,
    recv_slots: Box<[Slot]>,
    send_slots: Box<[Slot]>,
    /// Indices of send slots not currently in the kernel.
    free_send_tx: Sender<usize>,
    free_send_rx: Receiver<usize>,
    /// Duplicated descriptor; the caller's socket stays untouched.
    _fd: OwnedFd,
    local: SocketAddr,
    is4: bool,
    closed: AtomicBool,
    /// In-progress `recv_from` calls. Incremented before the closed check;
    /// see `close`.
    reads: AtomicI32,
}

impl std::fmt::Debug for UdpConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpConn")
            .field("local", &self.local)
            .field("is4", &self.is4)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl UdpConn {
    /// Adapt an already-bound UDP socket, consuming it.
    ///
    /// The descriptor is duplicated and the duplicate owned by the adapter;
    /// the original socket is returned to the OS.
    pub fn new(socket: UdpSocket) -> Result<UdpConn> {
        Self::from_socket(&socket)
    }

    /// Adapt any bound datagram socket.
    ///
    /// Fails with [`Error::NotDatagram`] for stream or other socket types,
    /// without touching the caller's descriptor.
    pub fn from_socket<S: AsFd>(socket: &S) -> Result<UdpConn> {
        if !config::enabled() {
            return Err(Error::Disabled);
        }
        let sref = SockRef::from(socket);
        if sref.r#type().map_err(Error::Setup)? != socket2::Type::DGRAM {
            return Err(Error::NotDatagram);
        }
        let local = sref
            .local_addr()
            .map_err(Error::Setup)?
            .as_socket()
            .ok_or(Error::NotDatagram)?;
        for (name, code) in [
            ("recvmsg", opcode::RecvMsg::CODE),
            ("sendmsg", opcode::SendMsg::CODE),
            ("async-cancel", opcode::AsyncCancel::CODE),
        ] {
            if !probe::supports(code) {
                return Err(Error::Unsupported(name));
            }
        }
        let fd = socket
            .as_fd()
            .try_clone_to_owned()
            .map_err(Error::Setup)?;
        let is4 = local.is_ipv4();

        let recv_ring = Ring::new(fd.as_raw_fd(), RING_DEPTH)?;
        let send_ring = Ring::new(fd.as_raw_fd(), RING_DEPTH)?;

        let recv_slots = slot_array(UDP_SLOTS);
        let send_slots = slot_array(UDP_SLOTS);
        for slot in recv_slots.iter().chain(send_slots.iter()) {
            slot.bind_msghdr(is4);
        }

        let (free_send_tx, free_send_rx) = bounded(UDP_SLOTS);
        for idx in 0..UDP_SLOTS {
            let _ = free_send_tx.send(idx);
        }

        let conn = UdpConn {
            recv_ring,
            send_ring,
            recv_slots,
            send_slots,
            free_send_tx,
            free_send_rx,
            _fd: fd,
            local,
            is4,
            closed: AtomicBool::new(false),
            reads: AtomicI32::new(0),
        };

        // Keep every recv slot perpetually in flight.
        for idx in 0..UDP_SLOTS {
            conn.submit_recv(idx)?;
        }
        debug!(%local, slots = UDP_SLOTS, "udp adapter up");
        Ok(conn)
    }

    /// The local address the socket was bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    /// Receive one datagram.
    ///
    /// Returns the datagram's full length and the peer address; if `buf` is
    /// shorter than the datagram, the copy is truncated to `buf` but the
    /// full length is still reported.
    pub fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)> {
        // Register the read before checking closed: once close has stored
        // the flag and then observes reads == 0, it knows no reader is
        // hidden between these two steps still about to touch a slot.
        self.reads.fetch_add(1, Ordering::SeqCst);
        let result = self.recv_from_inner(buf);
        self.reads.fetch_sub(1, Ordering::SeqCst);
        result
    }

    fn recv_from_inner(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        let (res, tag) = match self.recv_ring.reap(true)? {
            Reaped::Completion { res, tag } => (res, tag),
            Reaped::Empty => unreachable!("blocking reap returned empty"),
        };
        let idx = tag as usize;
        let slot = &self.recv_slots[idx];
        slot.mark_reaped();

        if res < 0 {
            if -res == libc::ECANCELED {
                // Close is cancelling our in-flight recvs; do not resubmit.
                return Err(Error::from_cqe(res));
            }
            // The syscall itself failed. Best-effort resubmit so the slot
            // isn't leaked out of rotation, then surface the errno.
            if let Err(e) = self.submit_recv(idx) {
                trace!(slot = idx, error = %e, "resubmit after failed recvmsg also failed");
            }
            return Err(Error::from_cqe(res));
        }

        let n = res as usize;
        let peer = addr::decode(slot.sockaddr_ptr()).map_err(Error::Ring)?;
        let take = n.min(buf.len());
        buf[..take].copy_from_slice(slot.payload(take));

        // Hand the slot straight back to the kernel. An error here bubbles
        // up and typically closes the whole adapter, so the lost datagram
        // doesn't matter.
        self.submit_recv(idx)?;
        Ok((n, peer))
    }

    /// Send one datagram to `peer`.
    ///
    /// Best-effort UDP semantics: returns the full payload length once the
    /// operation is submitted. A kernel-level send failure surfaces on a
    /// later call that has to wait for a slot.
    pub fn send_to(&self, buf: &[u8], peer: SocketAddr) -> Result<usize> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        if peer.is_ipv4() != self.is4 {
            return Err(Error::AddressFamily);
        }
        if buf.len() > MAX_SEGMENT_SIZE {
            return Err(Error::Syscall(std::io::Error::from_raw_os_error(
                libc::EMSGSIZE,
            )));
        }

        let idx = match self.free_send_rx.try_recv() {
            Ok(idx) => idx,
            Err(_) => {
                // No free slot; reclaim one from the kernel, which is also
                // where a previous send's failure comes home.
                match self.send_ring.reap(true)? {
                    Reaped::Completion { res, tag } => {
                        let idx = tag as usize;
                        self.send_slots[idx].mark_reaped();
                        if res < 0 {
                            // Don't leak the index.
                            let _ = self.free_send_tx.send(idx);
                            return Err(Error::from_cqe(res));
                        }
                        idx
                    }
                    Reaped::Empty => unreachable!("blocking reap returned empty"),
                }
            }
        };

        let slot = &self.send_slots[idx];
        let namelen = addr::encode(slot.sockaddr_ptr(), &peer);
        // SAFETY: slot is held by this thread; namelen matches the family
        // just encoded.
        unsafe {
            (*slot.msghdr_ptr()).msg_namelen = namelen;
        }
        slot.fill_payload(buf);

        slot.mark_in_kernel();
        if let Err(e) = self.send_ring.submit_sendmsg(slot.msghdr_ptr(), idx as u64) {
            slot.unmark_in_kernel();
            let _ = self.free_send_tx.send(idx);
            return Err(e);
        }

        // Opportunistically reclaim one completed slot so the next writer
        // usually skips the blocking reap.
        if let Ok(Reaped::Completion { res, tag }) = self.send_ring.reap(false) {
            let idx = tag as usize;
            self.send_slots[idx].mark_reaped();
            if res < 0 {
                trace!(slot = idx, errno = -res, "reclaimed send slot from failed sendmsg");
            }
            let _ = self.free_send_tx.send(idx);
        }

        Ok(buf.len())
    }

    /// Shut the adapter down. Idempotent; concurrent and repeated calls
    /// beyond the first are no-ops.
    ///
    /// Readers parked in the blocking reap hold no lock we could take, and a
    /// reader/writer lock cannot work here: readers would hold the shared
    /// side across the reap while we need the exclusive side to submit the
    /// very cancellations that unblock them. Instead: store the closed flag,
    /// then poll: cancel every in-kernel recv, sleep a millisecond, repeat
    /// until the in-progress read count drains. Each cancellation produces a
    /// completion that wakes a reader, which then observes the flag and
    /// leaves.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(local = %self.local, "closing udp adapter");

        loop {
            for (idx, slot) in self.recv_slots.iter().enumerate() {
                if slot.in_kernel() != 0
                    && let Err(e) = self.recv_ring.submit_cancel(idx as u64)
                {
                    trace!(slot = idx, error = %e, "cancel submission failed");
                }
            }
            if self.reads.load(Ordering::SeqCst) == 0 {
                break;
            }
            thread::sleep(Duration::from_millis(1));
        }

        // No reader remains, so nobody else will reap the completions of
        // recvs that were cancelled without a waiting reader. Drain them
        // here so every slot is out of the kernel before the buffers go
        // away with the adapter.
        let mut rounds = 0;
        while self.recv_slots.iter().any(|s| s.in_kernel() != 0) {
            match self.recv_ring.reap(false) {
                Ok(Reaped::Completion { tag, .. }) => {
                    self.recv_slots[tag as usize].mark_reaped();
                }
                Ok(Reaped::Empty) => {
                    rounds += 1;
                    if rounds > CLOSE_DRAIN_ROUNDS {
                        warn!("recv slots still in kernel after close drain");
                        break;
                    }
                    for (idx, slot) in self.recv_slots.iter().enumerate() {
                        if slot.in_kernel() != 0 {
                            let _ = self.recv_ring.submit_cancel(idx as u64);
                        }
                    }
                    thread::sleep(Duration::from_millis(1));
                }
                Err(_) => break,
            }
        }
    }

    /// Submit (or resubmit) one recv slot to the kernel.
    ///
    /// The in-kernel mark goes up before the SQE is pushed (the kernel may
    /// complete and another thread reap before this function returns) and
    /// is rolled back only if the submission never reached the kernel. Every
    /// submission path, including the best-effort resubmit after an op-level
    /// failure, is counted identically.
    fn submit_recv(&self, idx: usize) -> Result<()> {
        let slot = &self.recv_slots[idx];
        slot.reset_for_recv(self.is4);
        slot.mark_in_kernel();
        if let Err(e) = self.recv_ring.submit_recvmsg(slot.msghdr_ptr(), idx as u64) {
            slot.unmark_in_kernel();
            return Err(e);
        }
        Ok(())
    }
}

impl Drop for UdpConn {
    fn drop(&mut self) {
        // &mut self proves no reader or writer remains; close() degenerates
        // to the completion drain that makes freeing the buffers safe.
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Construct an adapter over a fresh loopback socket, or None when the
    /// accelerated path can't run here (gate off is overridden for tests;
    /// kernel support may still be missing).
    fn loopback_conn() -> Option<UdpConn> {
        config::set_enabled(true);
        let socket = UdpSocket::bind("127.0.0.1:0").ok()?;
        match UdpConn::new(socket) {
            Ok(conn) => Some(conn),
            Err(Error::Unsupported(_)) | Err(Error::Setup(_)) => None,
            Err(e) => panic!("unexpected construction error: {e}"),
        }
    }

    #[test]
    fn send_churn_conserves_slots() {
        let Some(conn) = loopback_conn() else {
            return;
        };
        let sink = UdpSocket::bind("127.0.0.1:0").unwrap();
        let sink_addr = sink.local_addr().unwrap();

        let payload = [0xabu8; 512];
        for _ in 0..64 {
            assert_eq!(conn.send_to(&payload, sink_addr).unwrap(), 512);
        }

        // Let the remaining sends complete, then reclaim every slot: the
        // free channel plus in-kernel counts must account for all of them,
        // with no index duplicated or lost.
        let mut free = Vec::new();
        let deadline = std::time::Instant::now() + Duration::from_secs(1);
        while free.len() < UDP_SLOTS && std::time::Instant::now() < deadline {
            match conn.free_send_rx.try_recv() {
                Ok(idx) => free.push(idx),
                Err(_) => {
                    if let Ok(Reaped::Completion { tag, .. }) = conn.send_ring.reap(false) {
                        conn.send_slots[tag as usize].mark_reaped();
                        let _ = conn.free_send_tx.send(tag as usize);
                    } else {
                        thread::sleep(Duration::from_millis(1));
                    }
                }
            }
        }
        free.sort_unstable();
        assert_eq!(free, (0..UDP_SLOTS).collect::<Vec<_>>());
        assert!(conn.send_slots.iter().all(|s| s.in_kernel() == 0));
        conn.close();
    }

    #[test]
    fn recv_slots_all_in_kernel_after_construction() {
        let Some(conn) = loopback_conn() else {
            return;
        };
        assert!(conn.recv_slots.iter().all(|s| s.in_kernel() == 1));
        conn.close();
        assert!(conn.recv_slots.iter().all(|s| s.in_kernel() == 0));
    }

    #[test]
    fn family_mismatch_consumes_no_slot() {
        let Some(conn) = loopback_conn() else {
            return;
        };
        let v6_peer: SocketAddr = "[::1]:4242".parse().unwrap();
        assert!(matches!(
            conn.send_to(b"x", v6_peer),
            Err(Error::AddressFamily)
        ));
        assert_eq!(conn.free_send_rx.len(), UDP_SLOTS);
        conn.close();
    }

    #[test]
    fn oversized_payload_rejected() {
        let Some(conn) = loopback_conn() else {
            return;
        };
        let peer = conn.local_addr();
        let big = vec![0u8; MAX_SEGMENT_SIZE + 1];
        assert!(matches!(conn.send_to(&big, peer), Err(Error::Syscall(_))));
        assert_eq!(conn.free_send_rx.len(), UDP_SLOTS);
        conn.close();
    }
}
