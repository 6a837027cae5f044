use std::{
    cell::RefCell,
    collections::BTreeMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use hashbrown::HashMap;
use log::{error, trace, warn};
use parking_lot::RwLock;

use super::{AllocState, Counters, CountersSnapshot, FreeState, Tracker};
use crate::{
    db::{AllocId, AllocKind, TypeDb},
    resolve::PointerInfo,
};

static NEXT_TRACKER_ID: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    /// Stack allocations of this thread, per tracker, in allocation order.
    static STACK_ALLOCS: RefCell<HashMap<usize, Vec<usize>>> = RefCell::new(HashMap::new());
}

#[derive(Debug, Clone, Copy)]
struct LiveAllocation {
    info: PointerInfo,
    kind: AllocKind,
}

/// Tracks live allocations in an ordered map keyed by base address.
pub struct MapTracker {
    id: usize,
    db: Arc<TypeDb>,
    live: RwLock<BTreeMap<usize, LiveAllocation>>,
    counters: Counters,
}

impl MapTracker {
    pub fn new(db: Arc<TypeDb>) -> Self {
        Self {
            id: NEXT_TRACKER_ID.fetch_add(1, Ordering::Relaxed),
            db,
            live: RwLock::new(BTreeMap::new()),
            counters: Counters::default(),
        }
    }

    /// Number of live allocations across all threads.
    pub fn live_count(&self) -> usize {
        self.live.read().len()
    }

    /// Number of stack allocations the calling thread still holds.
    pub fn stack_depth(&self) -> usize {
        STACK_ALLOCS.with(|stacks| stacks.borrow().get(&self.id).map_or(0, Vec::len))
    }

    fn push_stack(&self, addr: usize) {
        STACK_ALLOCS.with(|stacks| stacks.borrow_mut().entry(self.id).or_default().push(addr));
    }

    /// Take the `n` most recent stack entries, newest first.
    fn pop_stack(&self, n: usize) -> Vec<usize> {
        STACK_ALLOCS.with(|stacks| {
            let mut stacks = stacks.borrow_mut();
            let Some(stack) = stacks.get_mut(&self.id) else {
                if n > 0 {
                    error!("Stack is smaller than requested de-allocation count: 0 < {n}");
                }
                return Vec::new();
            };
            let n = if n > stack.len() {
                error!(
                    "Stack is smaller than requested de-allocation count: {} < {n}",
                    stack.len()
                );
                stack.len()
            } else {
                n
            };
            let start = stack.len() - n;
            stack.drain(start..).rev().collect()
        })
    }
}

impl Drop for MapTracker {
    fn drop(&mut self) {
        // only the dropping thread's list is reachable from here
        let _ = STACK_ALLOCS.try_with(|stacks| stacks.borrow_mut().remove(&self.id));
    }
}

impl Tracker for MapTracker {
    fn on_alloc(
        &self,
        addr: usize,
        alloc_id: AllocId,
        count: usize,
        kind: AllocKind,
        return_addr: usize,
    ) -> AllocState {
        let Ok(descriptor) = self.db.get_allocation(alloc_id) else {
            error!("Allocation of unknown id {alloc_id} at {addr:#x} (called from {return_addr:#x})");
            self.counters.unknown_id_alloc();
            return AllocState::UNKNOWN_ID | AllocState::ADDR_SKIPPED;
        };

        let mut state = AllocState::empty();
        match (addr, count) {
            (0, 0) => {
                error!("Zero-size allocation at nullptr (called from {return_addr:#x})");
                self.counters.null_alloc();
                return AllocState::NULL_ZERO | AllocState::ADDR_SKIPPED;
            }
            (0, _) => {
                error!("Nullptr allocation of {count} elements (called from {return_addr:#x})");
                self.counters.null_alloc();
                return AllocState::NULL_PTR | AllocState::ADDR_SKIPPED;
            }
            (_, 0) => {
                warn!("Zero-size allocation at {addr:#x} (called from {return_addr:#x})");
                self.counters.zero_count_alloc();
                state |= AllocState::ZERO_COUNT;
            }
            _ => {}
        }

        let info = PointerInfo {
            base_addr: addr,
            alloc_id,
            type_id: descriptor.type_id,
            count,
            return_addr,
        };
        let previous = self.live.write().insert(addr, LiveAllocation { info, kind });
        if let Some(previous) = previous {
            warn!(
                "Address {addr:#x} reused: [{} x {}] replaces [{} x {}]",
                count,
                self.db.type_name(descriptor.type_id),
                previous.info.count,
                self.db.type_name(previous.info.type_id)
            );
            self.counters.addr_reuse();
            state |= AllocState::ADDR_REUSE;
        }
        if kind == AllocKind::Stack {
            self.push_stack(addr);
        }
        self.counters.alloc(kind);
        trace!("Alloc {addr:#x} [{count} x {}]", descriptor.type_id);
        state | AllocState::OK
    }

    fn on_free(&self, addr: usize, return_addr: usize) -> FreeState {
        if addr == 0 {
            error!("Free on nullptr (called from {return_addr:#x})");
            self.counters.null_free();
            return FreeState::NULL_PTR | FreeState::ADDR_SKIPPED;
        }
        match self.live.write().remove(&addr) {
            Some(removed) => {
                if removed.kind == AllocKind::Stack {
                    warn!("Explicit free of stack allocation {addr:#x}");
                }
                self.counters.free();
                trace!("Free {addr:#x}");
                FreeState::OK
            }
            None => {
                error!("Free on unregistered address {addr:#x} (called from {return_addr:#x})");
                self.counters.unregistered_free();
                FreeState::UNREG_ADDR | FreeState::ADDR_SKIPPED
            }
        }
    }

    fn on_scope_exit(&self, n: usize) {
        let addrs = self.pop_stack(n);
        if addrs.is_empty() {
            return;
        }
        let mut live = self.live.write();
        for addr in &addrs {
            if live.remove(addr).is_none() {
                warn!("Stack allocation {addr:#x} was already removed");
            }
        }
        drop(live);
        self.counters.stack_frees(addrs.len());
    }

    fn find(&self, addr: usize) -> Option<PointerInfo> {
        self.live
            .read()
            .range(..=addr)
            .next_back()
            .map(|(_, live)| live.info)
    }

    fn counters(&self) -> CountersSnapshot {
        self.counters.snapshot()
    }
}
