//! Tracking backends: who owns which address right now.
//!
//! Both backends answer the same question through [`Tracker::find`]: which
//! live allocation starts at or before an address. Bounds and subobject
//! resolution happen afterwards in [`crate::resolve`].

use bitflags::bitflags;

use crate::{db::{AllocId, AllocKind}, resolve::PointerInfo};

pub mod counters;
pub mod map;

pub use counters::{Counters, CountersSnapshot};
pub use map::MapTracker;

bitflags! {
    /// Outcome of an allocation event. `OK` may be combined with warnings.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AllocState: u32 {
        const OK = 1 << 0;
        const ADDR_SKIPPED = 1 << 1;
        const NULL_PTR = 1 << 2;
        const ZERO_COUNT = 1 << 3;
        const NULL_ZERO = 1 << 4;
        const ADDR_REUSE = 1 << 5;
        const UNKNOWN_ID = 1 << 6;
    }
}

bitflags! {
    /// Outcome of a free event.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FreeState: u32 {
        const OK = 1 << 0;
        const ADDR_SKIPPED = 1 << 1;
        const NULL_PTR = 1 << 2;
        const UNREG_ADDR = 1 << 3;
    }
}

/// The contract shared by all backends.
pub trait Tracker: Send + Sync {
    /// Record `count` elements of allocation site `alloc_id` at `addr`.
    fn on_alloc(
        &self,
        addr: usize,
        alloc_id: AllocId,
        count: usize,
        kind: AllocKind,
        return_addr: usize,
    ) -> AllocState;

    /// Forget the allocation starting at `addr`.
    fn on_free(&self, addr: usize, return_addr: usize) -> FreeState;

    /// Forget the `n` most recent stack allocations of the calling thread.
    fn on_scope_exit(&self, n: usize);

    /// The live allocation with the greatest base address `<= addr`.
    fn find(&self, addr: usize) -> Option<PointerInfo>;

    fn counters(&self) -> CountersSnapshot;
}
