//! Process-wide io_uring capability cache.
//!
//! Each opcode is probed against the kernel at most once per process, by
//! registering an `io_uring` probe on a short-lived ring. Results are
//! memoized so repeated adapter construction never re-enters the kernel.

use std::collections::BTreeMap;

use io_uring::{IoUring, Probe};
use parking_lot::Mutex;

static CAPABILITIES: Mutex<BTreeMap<u8, bool>> = Mutex::new(BTreeMap::new());

/// Whether the running kernel supports the given io_uring opcode.
///
/// The first query for an opcode probes the kernel; later queries return the
/// cached answer. A kernel without io_uring at all reports every opcode as
/// unsupported.
pub(crate) fn supports(code: u8) -> bool {
    let mut table = CAPABILITIES.lock();
    if let Some(&known) = table.get(&code) {
        return known;
    }
    let supported = probe_kernel(code);
    table.insert(code, supported);
    supported
}

fn probe_kernel(code: u8) -> bool {
    let Ok(ring) = IoUring::<io_uring::squeue::Entry>::builder().build(2) else {
        return false;
    };
    let mut probe = Probe::new();
    if ring.submitter().register_probe(&mut probe).is_err() {
        return false;
    }
    probe.is_supported(code)
}
