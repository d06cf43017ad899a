//! Per-process queue-id allocation.
//!
//! Grounded on `SHMClient.py`'s module-level `new_qid()` / `_DQIds`: each
//! process hands out a monotonically increasing id per port so repeated
//! connections from the same pid get distinct buffer/lock names. Reified
//! here as an explicit `QidAllocator` value rather than a module dict
//! (spec design note §9), with a `OnceLock`-backed process-wide default
//! for callers that don't want to thread one through explicitly --
//! mirroring `cylo::instance_manager`'s `global_instance_manager()`.

use std::collections::HashMap;
use std::sync::OnceLock;

use parking_lot::Mutex;

#[derive(Default)]
pub struct QidAllocator {
    next: Mutex<HashMap<u16, u64>>,
}

impl QidAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the next qid for `port`.
    pub fn next_qid(&self, port: u16) -> u64 {
        let mut guard = self.next.lock();
        let qid = guard.entry(port).or_insert(0);
        let current = *qid;
        *qid += 1;
        current
    }
}

static GLOBAL: OnceLock<QidAllocator> = OnceLock::new();

/// The process-wide default allocator. Optional convenience; prefer
/// constructing a `QidAllocator` explicitly when one is already at hand.
pub fn global() -> &'static QidAllocator {
    GLOBAL.get_or_init(QidAllocator::new)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qids_increase_monotonically_per_port() {
        let allocator = QidAllocator::new();
        let port = 55001;
        let first = allocator.next_qid(port);
        let second = allocator.next_qid(port);
        let third = allocator.next_qid(port);
        assert_eq!([first, second, third], [first, first + 1, first + 2]);
    }

    #[test]
    fn ports_have_independent_counters() {
        let allocator = QidAllocator::new();
        let a = allocator.next_qid(1);
        let b = allocator.next_qid(2);
        assert_eq!(a, 0);
        assert_eq!(b, 0);
        assert_eq!(allocator.next_qid(1), 1);
    }

    #[test]
    fn global_allocator_is_shared() {
        let a = global().next_qid(55099);
        let b = global().next_qid(55099);
        assert_eq!(b, a + 1);
    }
}
