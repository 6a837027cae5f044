use std::{
    ops::Add,
    sync::atomic::{AtomicUsize, Ordering},
};

use crate::db::AllocKind;

/// Event counters kept by every backend. Updated with relaxed atomics; a
/// snapshot is consistent per field, not across fields.
#[derive(Debug, Default)]
pub struct Counters {
    heap_allocs: AtomicUsize,
    stack_allocs: AtomicUsize,
    global_allocs: AtomicUsize,
    frees: AtomicUsize,
    stack_frees: AtomicUsize,
    addr_reuses: AtomicUsize,
    null_allocs: AtomicUsize,
    zero_count_allocs: AtomicUsize,
    unknown_id_allocs: AtomicUsize,
    null_frees: AtomicUsize,
    unregistered_frees: AtomicUsize,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CountersSnapshot {
    pub heap_allocs: usize,
    pub stack_allocs: usize,
    pub global_allocs: usize,
    pub frees: usize,
    pub stack_frees: usize,
    pub addr_reuses: usize,
    pub null_allocs: usize,
    pub zero_count_allocs: usize,
    pub unknown_id_allocs: usize,
    pub null_frees: usize,
    pub unregistered_frees: usize,
}

fn bump(counter: &AtomicUsize) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl Counters {
    pub fn alloc(&self, kind: AllocKind) {
        bump(match kind {
            AllocKind::Heap => &self.heap_allocs,
            AllocKind::Stack => &self.stack_allocs,
            AllocKind::Global => &self.global_allocs,
        })
    }

    pub fn free(&self) {
        bump(&self.frees)
    }

    pub fn stack_frees(&self, n: usize) {
        self.stack_frees.fetch_add(n, Ordering::Relaxed);
    }

    pub fn addr_reuse(&self) {
        bump(&self.addr_reuses)
    }

    pub fn null_alloc(&self) {
        bump(&self.null_allocs)
    }

    pub fn zero_count_alloc(&self) {
        bump(&self.zero_count_allocs)
    }

    pub fn unknown_id_alloc(&self) {
        bump(&self.unknown_id_allocs)
    }

    pub fn null_free(&self) {
        bump(&self.null_frees)
    }

    pub fn unregistered_free(&self) {
        bump(&self.unregistered_frees)
    }

    pub fn snapshot(&self) -> CountersSnapshot {
        let load = |c: &AtomicUsize| c.load(Ordering::Relaxed);
        CountersSnapshot {
            heap_allocs: load(&self.heap_allocs),
            stack_allocs: load(&self.stack_allocs),
            global_allocs: load(&self.global_allocs),
            frees: load(&self.frees),
            stack_frees: load(&self.stack_frees),
            addr_reuses: load(&self.addr_reuses),
            null_allocs: load(&self.null_allocs),
            zero_count_allocs: load(&self.zero_count_allocs),
            unknown_id_allocs: load(&self.unknown_id_allocs),
            null_frees: load(&self.null_frees),
            unregistered_frees: load(&self.unregistered_frees),
        }
    }
}

/// Combines the counters of a backend and the trackers it delegates to.
impl Add for CountersSnapshot {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self {
            heap_allocs: self.heap_allocs + rhs.heap_allocs,
            stack_allocs: self.stack_allocs + rhs.stack_allocs,
            global_allocs: self.global_allocs + rhs.global_allocs,
            frees: self.frees + rhs.frees,
            stack_frees: self.stack_frees + rhs.stack_frees,
            addr_reuses: self.addr_reuses + rhs.addr_reuses,
            null_allocs: self.null_allocs + rhs.null_allocs,
            zero_count_allocs: self.zero_count_allocs + rhs.zero_count_allocs,
            unknown_id_allocs: self.unknown_id_allocs + rhs.unknown_id_allocs,
            null_frees: self.null_frees + rhs.null_frees,
            unregistered_frees: self.unregistered_frees + rhs.unregistered_frees,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshots_add_up() {
        let a = Counters::default();
        a.alloc(AllocKind::Heap);
        a.alloc(AllocKind::Stack);
        a.stack_frees(3);
        let b = Counters::default();
        b.alloc(AllocKind::Heap);
        b.null_free();

        let sum = a.snapshot() + b.snapshot();
        assert_eq!(sum.heap_allocs, 2);
        assert_eq!(sum.stack_allocs, 1);
        assert_eq!(sum.stack_frees, 3);
        assert_eq!(sum.null_frees, 1);
        assert_eq!(sum.frees, 0);
    }
}
