//! Pre-allocated request slots recycled through a ring.
//!
//! A slot is everything one in-flight operation needs, allocated once at
//! adapter construction with a stable heap address: the data buffer, the
//! iovec describing it, inline sockaddr storage for datagram peers, and the
//! msghdr binding them for the kernel. The slot index doubles as the
//! io_uring user_data tag, so completions map straight back here.
//!
//! Ownership protocol: while `in_kernel > 0` the kernel owns the record and
//! user code must not touch it except to request cancellation. Between a
//! reap and the following resubmit, exactly one user thread holds the slot.

use std::cell::UnsafeCell;
use std::mem;
use std::sync::atomic::{AtomicI32, Ordering};

use crate::config::MAX_SEGMENT_SIZE;

/// The kernel-visible part of a slot. Field addresses are wired into the
/// msghdr at construction, so the record lives behind a `Box` and never
/// moves.
#[repr(C)]
struct Request {
    msg: libc::msghdr,
    iov: libc::iovec,
    addr: libc::sockaddr_storage,
    buf: [u8; MAX_SEGMENT_SIZE],
}

pub(crate) struct Slot {
    req: Box<UnsafeCell<Request>>,
    /// How many times this slot is currently lodged in the kernel (0 or 1 in
    /// steady state). Release on submit, acquire on reap: submission
    /// happens-before the matching completion's processing.
    in_kernel: AtomicI32,
}

// SAFETY: the request record is raw memory shared with the kernel. All
// mutation goes through the UnsafeCell pointer and is serialized by the
// ownership protocol above: the kernel writes only while in_kernel > 0, and
// a single user thread holds the slot between reap and resubmit. The
// atomic counter carries the ordering.
unsafe impl Send for Slot {}
unsafe impl Sync for Slot {}

impl Slot {
    /// Allocate a zeroed slot and wire the iovec to the buffer.
    pub(crate) fn new() -> Slot {
        // SAFETY: Request is all plain data; the zero pattern is valid.
        let req: Box<UnsafeCell<Request>> = unsafe { Box::new_zeroed().assume_init() };
        // SAFETY: sole owner during construction.
        unsafe {
            let r = req.get();
            (*r).iov.iov_base = (*r).buf.as_mut_ptr().cast();
            (*r).iov.iov_len = MAX_SEGMENT_SIZE;
        }
        Slot {
            req,
            in_kernel: AtomicI32::new(0),
        }
    }

    /// Bind the msghdr for datagram use: one iovec plus the inline address
    /// record, sized for the bound socket's family.
    pub(crate) fn bind_msghdr(&self, v4: bool) {
        // SAFETY: called at construction, before the slot is shared.
        unsafe {
            let r = self.req.get();
            (*r).msg.msg_name = (&raw mut (*r).addr).cast();
            (*r).msg.msg_namelen = Self::addr_len(v4);
            (*r).msg.msg_iov = &raw mut (*r).iov;
            (*r).msg.msg_iovlen = 1;
        }
    }

    fn addr_len(v4: bool) -> libc::socklen_t {
        if v4 {
            mem::size_of::<libc::sockaddr_in>() as libc::socklen_t
        } else {
            mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t
        }
    }

    pub(crate) fn msghdr_ptr(&self) -> *mut libc::msghdr {
        // SAFETY: pointer projection only, no dereference.
        unsafe { &raw mut (*self.req.get()).msg }
    }

    pub(crate) fn iovec_ptr(&self) -> *const libc::iovec {
        // SAFETY: pointer projection only, no dereference.
        unsafe { &raw const (*self.req.get()).iov }
    }

    pub(crate) fn sockaddr_ptr(&self) -> *mut libc::sockaddr_storage {
        // SAFETY: pointer projection only, no dereference.
        unsafe { &raw mut (*self.req.get()).addr }
    }

    /// Restore the in-out msghdr fields a completed recvmsg clobbered.
    /// Must run before every inbound resubmission.
    pub(crate) fn reset_for_recv(&self, v4: bool) {
        // SAFETY: caller holds the slot (in_kernel == 0 for this thread's
        // reap/resubmit window).
        unsafe {
            let r = self.req.get();
            (*r).msg.msg_namelen = Self::addr_len(v4);
            (*r).iov.iov_len = MAX_SEGMENT_SIZE;
        }
    }

    /// First `n` bytes of the slot buffer, after a completed inbound op.
    pub(crate) fn payload(&self, n: usize) -> &[u8] {
        debug_assert!(n <= MAX_SEGMENT_SIZE);
        // SAFETY: caller holds the slot; the kernel wrote and released these
        // bytes (acquire load on in_kernel ordered the write).
        unsafe { &(&(*self.req.get()).buf)[..n] }
    }

    /// Copy an outbound payload into the slot buffer and size the iovec to
    /// it.
    pub(crate) fn fill_payload(&self, data: &[u8]) {
        debug_assert!(data.len() <= MAX_SEGMENT_SIZE);
        // SAFETY: caller holds the slot, about to submit.
        unsafe {
            let r = self.req.get();
            (&mut (*r).buf)[..data.len()].copy_from_slice(data);
            (*r).iov.iov_len = data.len();
        }
    }

    /// Set the iovec length for an inbound file read (full buffer).
    pub(crate) fn reset_for_read(&self) {
        // SAFETY: caller holds the slot.
        unsafe {
            (*self.req.get()).iov.iov_len = MAX_SEGMENT_SIZE;
        }
    }

    pub(crate) fn mark_in_kernel(&self) {
        self.in_kernel.fetch_add(1, Ordering::Release);
    }

    /// Roll back `mark_in_kernel` when a submission never reached the kernel.
    pub(crate) fn unmark_in_kernel(&self) {
        self.in_kernel.fetch_sub(1, Ordering::Release);
    }

    /// Record that this slot's completion was reaped.
    pub(crate) fn mark_reaped(&self) {
        self.in_kernel.fetch_sub(1, Ordering::Acquire);
    }

    pub(crate) fn in_kernel(&self) -> i32 {
        self.in_kernel.load(Ordering::Acquire)
    }
}

/// Build the fixed slot array for one direction.
pub(crate) fn slot_array(count: usize) -> Box<[Slot]> {
    (0..count).map(|_| Slot::new()).collect()
}
