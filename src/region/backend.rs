use std::{
    cell::RefCell,
    ptr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use hashbrown::HashMap;
use log::{debug, error, trace, warn};

use super::{HeapRegions, RegionConfig, RegionError, StackArena};
use crate::{
    db::{AllocId, AllocKind, TypeDb},
    resolve::PointerInfo,
    tracker::{AllocState, Counters, CountersSnapshot, FreeState, MapTracker, Tracker},
};

static NEXT_BACKEND_ID: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    /// Per backend, one entry for every stack allocation of this thread:
    /// `true` if it lives in the arena, `false` if the fallback tracks it.
    static STACK_ORIGINS: RefCell<HashMap<usize, Vec<bool>>> = RefCell::new(HashMap::new());
}

/// Region allocator backend. Heap allocations made through
/// [`RegionBackend::malloc`] and stack allocations inside the arena carry
/// their allocation id in memory. Everything else (globals, oversized
/// requests, stacks outside the arena) is tracked by a fallback
/// [`MapTracker`].
pub struct RegionBackend {
    id: usize,
    db: Arc<TypeDb>,
    heap: HeapRegions,
    stack: StackArena,
    fallback: MapTracker,
    counters: Counters,
}

impl RegionBackend {
    pub fn new(db: Arc<TypeDb>, config: RegionConfig) -> Result<Self, RegionError> {
        config.validate().map_err(RegionError::Config)?;
        let heap = HeapRegions::new(config.heap)?;
        let stack = StackArena::new(config.stack)?;
        Ok(Self {
            id: NEXT_BACKEND_ID.fetch_add(1, Ordering::Relaxed),
            fallback: MapTracker::new(Arc::clone(&db)),
            db,
            heap,
            stack,
            counters: Counters::default(),
        })
    }

    pub fn heap(&self) -> &HeapRegions {
        &self.heap
    }

    pub fn stack(&self) -> &StackArena {
        &self.stack
    }

    /// Allocate `size` bytes holding `count` elements of allocation site
    /// `alloc_id`. Requests the regions cannot serve go to the system
    /// allocator and are tracked by the fallback.
    pub fn malloc(&self, alloc_id: AllocId, count: usize, size: usize, return_addr: usize) -> *mut u8 {
        if self.db.get_allocation(alloc_id).is_ok() {
            if let Some(ptr) = self.heap.allocate(alloc_id, count, size) {
                if count == 0 {
                    warn!("Zero-size allocation at {ptr:p} (called from {return_addr:#x})");
                    self.counters.zero_count_alloc();
                }
                self.counters.alloc(AllocKind::Heap);
                trace!("Region alloc {ptr:p} [{count} x {alloc_id}]");
                return ptr;
            }
            debug!("Region allocator cannot serve {size} bytes, falling back to malloc");
        }
        // SAFETY: plain malloc
        let ptr = unsafe { libc::malloc(size) } as *mut u8;
        self.fallback
            .on_alloc(ptr as usize, alloc_id, count, AllocKind::Heap, return_addr);
        ptr
    }

    /// [`RegionBackend::malloc`] for `num * size` zeroed bytes.
    pub fn calloc(&self, alloc_id: AllocId, count: usize, num: usize, size: usize, return_addr: usize) -> *mut u8 {
        let Some(total) = num.checked_mul(size) else {
            error!("calloc of {num} x {size} bytes overflows (called from {return_addr:#x})");
            return ptr::null_mut();
        };
        let ptr = self.malloc(alloc_id, count, total, return_addr);
        if !ptr.is_null() {
            // SAFETY: `ptr` holds at least `total` bytes
            unsafe { ptr::write_bytes(ptr, 0, total) };
        }
        ptr
    }

    /// Move `addr` into a new allocation of `size` bytes tagged with
    /// `alloc_id`. A null `addr` allocates; a zero `size` frees.
    ///
    /// # Safety
    /// `addr` must be null or a live pointer returned by this backend.
    pub unsafe fn realloc(
        &self,
        alloc_id: AllocId,
        count: usize,
        addr: *mut u8,
        size: usize,
        return_addr: usize,
    ) -> *mut u8 {
        if addr.is_null() {
            return self.malloc(alloc_id, count, size, return_addr);
        }
        if size == 0 {
            // SAFETY: passed to caller
            unsafe { self.free(addr, return_addr) };
            return ptr::null_mut();
        }
        let old_size = match self.heap.usable_size(addr as usize) {
            Some(usable) => usable,
            // SAFETY: passed to caller, so `addr` came from libc::malloc
            None => unsafe { libc::malloc_usable_size(addr as *mut libc::c_void) },
        };
        let new = self.malloc(alloc_id, count, size, return_addr);
        if new.is_null() {
            return new;
        }
        // SAFETY: both allocations are live, distinct and large enough
        unsafe {
            ptr::copy_nonoverlapping(addr, new, old_size.min(size));
            self.free(addr, return_addr);
        }
        new
    }

    /// Release `addr`. A corrupted or repeated free of region memory aborts
    /// the process.
    ///
    /// # Safety
    /// `addr` must be null or a pointer returned by this backend that has
    /// not been freed through the system allocator yet.
    pub unsafe fn free(&self, addr: *mut u8, return_addr: usize) -> FreeState {
        if addr.is_null() {
            return self.fallback.on_free(0, return_addr);
        }
        if self.heap.free(addr as usize) {
            self.counters.free();
            trace!("Region free {addr:p}");
            return FreeState::OK;
        }
        let state = self.fallback.on_free(addr as usize, return_addr);
        // the memory is the program's to release either way
        // SAFETY: passed to caller
        unsafe { libc::free(addr as *mut libc::c_void) };
        state
    }

    fn push_origin(&self, in_arena: bool) {
        STACK_ORIGINS.with(|origins| origins.borrow_mut().entry(self.id).or_default().push(in_arena));
    }

    /// Pop `n` stack origins; returns how many of them the fallback holds.
    fn pop_origins(&self, n: usize) -> (usize, usize) {
        STACK_ORIGINS.with(|origins| {
            let mut origins = origins.borrow_mut();
            let stack = origins.entry(self.id).or_default();
            if n > stack.len() {
                error!(
                    "Stack is smaller than requested de-allocation count: {} < {n}",
                    stack.len()
                );
            }
            let start = stack.len().saturating_sub(n);
            let popped = stack.len() - start;
            let in_fallback = stack.drain(start..).filter(|in_arena| !in_arena).count();
            (popped, in_fallback)
        })
    }

    /// Tag the arena slot of a stack allocation whose user data starts at
    /// `addr`. `None` if the slot header would fall outside the views.
    fn alloc_in_arena(&self, addr: usize, alloc_id: AllocId, count: usize) -> Option<AllocState> {
        let Ok(descriptor) = self.db.get_allocation(alloc_id) else {
            error!("Allocation of unknown id {alloc_id} at {addr:#x}");
            self.counters.unknown_id_alloc();
            return Some(AllocState::UNKNOWN_ID | AllocState::ADDR_SKIPPED);
        };
        let Some(base_ptr_offset) = descriptor.base_ptr_offset else {
            error!("Missing base pointer offset for stack allocation at {addr:#x} with allocation id {alloc_id}");
            return Some(AllocState::ADDR_SKIPPED);
        };
        let Some(slot) = addr.checked_sub(base_ptr_offset).filter(|&slot| self.stack.is_instrumented(slot)) else {
            error!("Stack allocation at {addr:#x} with allocation id {alloc_id} has its slot outside the arena");
            return None;
        };
        let runtime_count = descriptor.static_count.is_none().then_some(count);
        // SAFETY: arena views are always mapped read/write, and the
        // instrumented frame owns the slot in front of its allocation
        unsafe { self.stack.write_header(slot, alloc_id, runtime_count) };
        self.counters.alloc(AllocKind::Stack);
        let mut state = AllocState::OK;
        if count == 0 {
            warn!("Zero-size stack allocation at {addr:#x}");
            self.counters.zero_count_alloc();
            state |= AllocState::ZERO_COUNT;
        }
        Some(state)
    }
}

impl Drop for RegionBackend {
    fn drop(&mut self) {
        let _ = STACK_ORIGINS.try_with(|origins| origins.borrow_mut().remove(&self.id));
    }
}

impl Tracker for RegionBackend {
    fn on_alloc(
        &self,
        addr: usize,
        alloc_id: AllocId,
        count: usize,
        kind: AllocKind,
        return_addr: usize,
    ) -> AllocState {
        match kind {
            // tagged by `malloc` already
            AllocKind::Heap if self.heap.contains(addr) => AllocState::OK,
            AllocKind::Stack => {
                let arena_state = if self.stack.is_instrumented(addr) {
                    self.alloc_in_arena(addr, alloc_id, count)
                } else {
                    None
                };
                let (state, in_arena) = match arena_state {
                    Some(state) => (state, true),
                    None => (self.fallback.on_alloc(addr, alloc_id, count, kind, return_addr), false),
                };
                if !state.contains(AllocState::ADDR_SKIPPED) {
                    self.push_origin(in_arena);
                }
                state
            }
            AllocKind::Heap | AllocKind::Global => self.fallback.on_alloc(addr, alloc_id, count, kind, return_addr),
        }
    }

    fn on_free(&self, addr: usize, return_addr: usize) -> FreeState {
        if self.heap.contains(addr) {
            if self.heap.free(addr) {
                self.counters.free();
            }
            return FreeState::OK;
        }
        self.fallback.on_free(addr, return_addr)
    }

    fn on_scope_exit(&self, n: usize) {
        let (popped, in_fallback) = self.pop_origins(n);
        // arena slots die with their frame, nothing to remove
        self.counters.stack_frees(popped - in_fallback);
        self.fallback.on_scope_exit(in_fallback);
    }

    fn find(&self, addr: usize) -> Option<PointerInfo> {
        self.heap
            .find(&self.db, addr)
            .or_else(|| self.stack.find(&self.db, addr))
            .or_else(|| self.fallback.find(addr))
    }

    fn counters(&self) -> CountersSnapshot {
        self.counters.snapshot() + self.fallback.counters()
    }
}
