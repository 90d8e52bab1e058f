//! Ring primitive: one `io_uring` instance per transfer direction.
//!
//! Every adapter owns two rings so completions never need demultiplexing by
//! operation type; a completion reaped from the recv ring is always a
//! `recvmsg` (or a cancellation of one), and so on.
//!
//! The ring is shared by any number of reader/writer threads plus the
//! closer, so the submission and completion queues each get their own lock.
//! Neither lock is held across the blocking wait, which is what allows the
//! close path to submit cancellations while readers are parked in
//! [`Ring::reap`].

use std::io;
use std::os::fd::RawFd;

use io_uring::types::Fd;
use io_uring::{IoUring, opcode, squeue};
use parking_lot::Mutex;

use crate::error::{Error, Result};

/// user_data carried by cancel SQEs themselves. Their completions are ring
/// bookkeeping, not slot completions, and are consumed inside [`Ring::reap`].
/// Slot tags are small indices and can never collide with this.
const CANCEL_TAG: u64 = u64::MAX;

/// One completion, matched back to its slot by tag.
pub(crate) enum Reaped {
    /// `res` is the raw syscall result: bytes transferred, or a negative
    /// errno if the kernel executed the operation and it failed.
    Completion { res: i32, tag: u64 },
    /// Non-blocking reap found nothing ready.
    Empty,
}

pub(crate) struct Ring {
    ring: IoUring,
    /// Descriptor every operation on this ring targets.
    fd: RawFd,
    /// Serializes submission queue access across submitting threads.
    sq: Mutex<()>,
    /// Serializes completion queue access across reaping threads.
    cq: Mutex<()>,
}

impl Ring {
    /// Build a ring of the given depth for operations against `fd`.
    pub(crate) fn new(fd: RawFd, depth: u32) -> Result<Ring> {
        let ring = IoUring::builder().build(depth).map_err(Error::Setup)?;
        Ok(Ring {
            ring,
            fd,
            sq: Mutex::new(()),
            cq: Mutex::new(()),
        })
    }

    /// Enqueue a `recvmsg` referencing the slot's pre-built msghdr.
    ///
    /// The caller must have marked the slot in-kernel already: the kernel may
    /// complete and deliver before this returns.
    pub(crate) fn submit_recvmsg(&self, msg: *mut libc::msghdr, tag: u64) -> Result<()> {
        let entry = opcode::RecvMsg::new(Fd(self.fd), msg).build().user_data(tag);
        self.push_and_submit(entry)
    }

    /// Enqueue a `sendmsg` referencing the slot's pre-built msghdr.
    pub(crate) fn submit_sendmsg(&self, msg: *const libc::msghdr, tag: u64) -> Result<()> {
        let entry = opcode::SendMsg::new(Fd(self.fd), msg).build().user_data(tag);
        self.push_and_submit(entry)
    }

    /// Enqueue a single-iovec `readv` into the slot buffer.
    pub(crate) fn submit_readv(&self, iov: *const libc::iovec, tag: u64) -> Result<()> {
        let entry = opcode::Readv::new(Fd(self.fd), iov, 1).build().user_data(tag);
        self.push_and_submit(entry)
    }

    /// Enqueue a single-iovec `writev` from the slot buffer.
    pub(crate) fn submit_writev(&self, iov: *const libc::iovec, tag: u64) -> Result<()> {
        let entry = opcode::Writev::new(Fd(self.fd), iov, 1).build().user_data(tag);
        self.push_and_submit(entry)
    }

    /// Request cancellation of the in-flight operation tagged `target`.
    ///
    /// Best-effort: the cancel's own completion is discarded by `reap`; the
    /// canceled operation completes with `-ECANCELED` under its own tag.
    pub(crate) fn submit_cancel(&self, target: u64) -> Result<()> {
        let entry = opcode::AsyncCancel::new(target)
            .build()
            .user_data(CANCEL_TAG);
        self.push_and_submit(entry)
    }

    /// Fetch one completion.
    ///
    /// Blocking mode parks in `submit_and_wait` until a completion exists,
    /// retrying transparently when the wait is interrupted. Non-blocking mode
    /// returns [`Reaped::Empty`] immediately when nothing is ready.
    pub(crate) fn reap(&self, block: bool) -> Result<Reaped> {
        loop {
            {
                let _guard = self.cq.lock();
                // SAFETY: completion queue access is serialized by `cq`.
                let queue = unsafe { self.ring.completion_shared() };
                for cqe in queue {
                    if cqe.user_data() == CANCEL_TAG {
                        continue;
                    }
                    return Ok(Reaped::Completion {
                        res: cqe.result(),
                        tag: cqe.user_data(),
                    });
                }
            }
            if !block {
                return Ok(Reaped::Empty);
            }
            // Also flushes any SQEs pushed but not yet submitted.
            match self.ring.submitter().submit_and_wait(1) {
                Ok(_) => {}
                Err(e)
                    if e.kind() == io::ErrorKind::Interrupted
                        || e.raw_os_error() == Some(libc::EAGAIN) => {}
                Err(e) => return Err(Error::Ring(e)),
            }
        }
    }

    /// Push one SQE and tell the kernel about it. On a full submission queue,
    /// flushes once and retries before giving up.
    fn push_and_submit(&self, entry: squeue::Entry) -> Result<()> {
        {
            let _guard = self.sq.lock();
            // SAFETY: submission queue access is serialized by `sq`, and the
            // entry references slot memory that stays alive until its
            // completion is reaped (the in-kernel counter discipline).
            unsafe {
                let mut queue = self.ring.submission_shared();
                if queue.push(&entry).is_err() {
                    drop(queue);
                    self.ring.submitter().submit().map_err(Error::Ring)?;
                    self.ring
                        .submission_shared()
                        .push(&entry)
                        .map_err(|_| Error::Ring(io::Error::other("submission queue full")))?;
                }
            }
        }
        self.ring.submitter().submit().map_err(Error::Ring)?;
        Ok(())
    }
}
