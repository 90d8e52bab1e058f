use std::io;

use thiserror::Error;

/// Errors returned by the ringtun adapters.
#[derive(Debug, Error)]
pub enum Error {
    /// The accelerated path is switched off for this process.
    #[error("io_uring support is disabled")]
    Disabled,
    /// The kernel lacks a required io_uring opcode.
    #[error("kernel does not support io_uring opcode {0}")]
    Unsupported(&'static str),
    /// Ring or slot initialization failed.
    #[error("ring setup failed: {0}")]
    Setup(#[source] io::Error),
    /// Operation attempted after close.
    #[error("connection closed")]
    Closed,
    /// The provided socket is not a datagram socket.
    #[error("socket is not a datagram socket")]
    NotDatagram,
    /// The peer address family does not match the bound socket's family.
    #[error("peer address family does not match the bound socket")]
    AddressFamily,
    /// An in-kernel operation was canceled; surfaced only while the adapter
    /// is closing.
    #[error("operation canceled during close: {0}")]
    Canceled(#[source] io::Error),
    /// The kernel executed the operation and it failed.
    #[error("syscall failed: {0}")]
    Syscall(#[source] io::Error),
    /// The submission/completion machinery itself failed. Fatal for the
    /// call; callers typically close the adapter.
    #[error("ring failure: {0}")]
    Ring(#[source] io::Error),
}

impl Error {
    /// True for the errors an orderly shutdown produces.
    pub fn is_closed(&self) -> bool {
        matches!(self, Error::Closed | Error::Canceled(_))
    }

    /// Classify a negative CQE result.
    pub(crate) fn from_cqe(res: i32) -> Error {
        debug_assert!(res < 0);
        let err = io::Error::from_raw_os_error(-res);
        if -res == libc::ECANCELED {
            Error::Canceled(err)
        } else {
            Error::Syscall(err)
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
