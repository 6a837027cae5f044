//! Thread stacks in an instrumented arena.
//!
//! All thread stacks live in one memfd. The memfd is mapped once as the
//! stack memory proper and once more per stack size class ("views"), each
//! followed by an inaccessible guard. Instrumented code places a stack
//! allocation of `size` bytes in a slot aligned to its size class and
//! hands out the address in that class's view; masking an address inside a
//! view with the view's slot size then finds the slot header, exactly like
//! the heap regions.
//!
//! ```plaintext
//! begin
//! +---------------+-------+ +---------------+-------+ +-----
//! | stacks (fd)   | guard | | view 0 (fd)   | guard | | view 1 ...
//! +---------------+-------+ +---------------+-------+ +-----
//! |<----------- view_stride -------------->|
//! ```

use std::{ffi::c_char, ptr, thread::ThreadId};

use log::{debug, error, warn};
use parking_lot::Mutex;

use super::{
    config::{StackConfig, COUNT_OFFSET},
    RegionError,
};
use crate::{
    arch::stack::{on_stack, STACK_ALIGN},
    db::{AllocId, TypeDb},
    os::mem::{MemFd, MmapRegion},
    resolve::PointerInfo,
    util::{hint::fatal, num::align_down},
};

/// A thread stack handed out by [`StackArena::acquire`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackSlot {
    pub index: usize,
    pub begin: usize,
    pub end: usize,
}

#[derive(Debug)]
pub struct StackArena {
    config: StackConfig,
    begin: usize,
    views_begin: usize,
    views_end: usize,
    owners: Mutex<Vec<Option<ThreadId>>>,
    _fd: MemFd,
    _region: MmapRegion,
}

impl StackArena {
    pub fn new(config: StackConfig) -> Result<Self, RegionError> {
        let stride = config.view_stride();
        let region = MmapRegion::reserve_aligned(config.reservation_size(), config.max_slot)?;
        let begin = region.aligned_start(config.max_slot);
        let fd = MemFd::create(c"alloctype_stack", config.region_size())?;

        for view in 0..=config.class_count() {
            let view_begin = begin + view * stride;
            region.map_shared(view_begin, config.region_size(), &fd)?;
            region.protect_none(view_begin + config.region_size(), config.guard_size)?;
        }

        let mut owners = vec![None; config.thread_count];
        // stack 0 belongs to the main thread once it is relocated
        owners[0] = Some(std::thread::current().id());
        let views_begin = begin + stride;
        let views_end = begin + config.reservation_size();
        debug!(
            "Stack arena at {begin:#x}, {} stacks of {:#x} bytes, views {views_begin:#x}..{views_end:#x}",
            config.thread_count, config.stack_size
        );
        Ok(Self {
            config,
            begin,
            views_begin,
            views_end,
            owners: Mutex::new(owners),
            _fd: fd,
            _region: region,
        })
    }

    pub fn config(&self) -> &StackConfig {
        &self.config
    }

    fn slot(&self, index: usize) -> StackSlot {
        let begin = self.begin + index * self.config.stack_size;
        StackSlot {
            index,
            begin,
            end: begin + self.config.stack_size,
        }
    }

    /// The stack reserved for the main thread.
    pub fn main_stack(&self) -> StackSlot {
        self.slot(0)
    }

    /// Whether `addr` lies in the stack memory itself (not a view).
    pub fn is_stack_memory(&self, addr: usize) -> bool {
        self.begin <= addr && addr < self.begin + self.config.region_size()
    }

    /// Whether `addr` lies in one of the size class views.
    pub fn is_instrumented(&self, addr: usize) -> bool {
        self.views_begin <= addr && addr < self.views_end
    }

    /// Claim a free stack for the calling thread.
    pub fn acquire(&self) -> Result<StackSlot, RegionError> {
        let me = std::thread::current().id();
        let mut owners = self.owners.lock();
        let index = owners
            .iter()
            .skip(1)
            .position(Option::is_none)
            .map(|i| i + 1)
            .ok_or(RegionError::StacksExhausted)?;
        owners[index] = Some(me);
        Ok(self.slot(index))
    }

    /// Return the stack owned by the calling thread.
    pub fn release(&self) -> Result<(), RegionError> {
        let me = std::thread::current().id();
        let mut owners = self.owners.lock();
        match owners.iter().skip(1).position(|owner| *owner == Some(me)) {
            Some(i) => {
                owners[i + 1] = None;
                Ok(())
            }
            None => {
                error!("Stack released by a thread that does not own one");
                Err(RegionError::UnknownThread)
            }
        }
    }

    /// Run `f` on a stack from the arena, so that its stack allocations can
    /// be resolved. The stack is returned afterwards, even if `f` panics.
    pub fn run_on_stack<F, R>(&self, f: F) -> Result<R, RegionError>
    where
        F: FnOnce() -> R,
    {
        struct Release<'a>(&'a StackArena);
        impl Drop for Release<'_> {
            fn drop(&mut self) {
                let _ = self.0.release();
            }
        }

        let slot = self.acquire()?;
        let _release = Release(self);
        let top = align_down(slot.end, STACK_ALIGN);
        // SAFETY: the slot is exclusively ours until `_release` drops, and
        // `stack_size` bytes are mapped read/write below `top`
        Ok(unsafe { on_stack(top, f) })
    }

    /// Run a thread's start routine on an arena stack. When every stack is
    /// taken the routine runs where it is and its stack allocations go to
    /// the fallback.
    pub fn run_thread<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        let mut f = Some(f);
        match self.run_on_stack(|| f.take().map(|f| f())) {
            Ok(Some(result)) => result,
            Ok(None) => fatal(format_args!("thread routine was consumed without running")),
            Err(err) => {
                warn!("Thread runs on its own stack: {err}");
                match f.take() {
                    Some(f) => f(),
                    None => fatal(format_args!("thread routine was consumed without running")),
                }
            }
        }
    }

    /// Address of the view of stack address `addr` for an allocation of
    /// `size` bytes.
    pub fn alias(&self, addr: usize, size: usize) -> Option<usize> {
        if !self.is_stack_memory(addr) || self.config.class_for(size) >= self.config.class_count() {
            return None;
        }
        Some(addr + self.config.view_offset_for(size))
    }

    /// Tag the stack slot at `slot` (stack memory or a view) with
    /// `alloc_id`, plus the runtime element `count` for VLAs.
    ///
    /// # Safety
    /// - `slot` must be the start of a slot of the calling thread's stack
    ///   that is not in use
    pub unsafe fn write_header(&self, slot: usize, alloc_id: AllocId, count: Option<usize>) {
        debug_assert!(self.is_stack_memory(slot) || self.is_instrumented(slot));
        // SAFETY: passed to caller
        unsafe {
            ptr::write_unaligned(slot as *mut AllocId, alloc_id);
            if let Some(count) = count {
                ptr::write_unaligned((slot + COUNT_OFFSET) as *mut usize, count);
            }
        }
    }

    /// Recover the stack allocation containing view address `addr`.
    pub fn find(&self, db: &TypeDb, addr: usize) -> Option<PointerInfo> {
        if !self.is_instrumented(addr) {
            return None;
        }
        let stride = self.config.view_stride();
        let class = (addr - self.views_begin) / stride;
        let view_begin = self.views_begin + class * stride;
        if addr - view_begin >= self.config.region_size() || class >= self.config.class_count() {
            return None;
        }
        let slot = align_down(addr, self.config.min_slot << class);
        // SAFETY: the whole view is mapped read/write
        let alloc_id = unsafe { ptr::read_unaligned(slot as *const AllocId) };
        let descriptor = match db.get_allocation(alloc_id) {
            Ok(descriptor) => descriptor,
            Err(_) => {
                error!("Found invalid allocation id {alloc_id} at {addr:#x}");
                return None;
            }
        };
        let Some(base_ptr_offset) = descriptor.base_ptr_offset else {
            error!("Missing base pointer offset for stack allocation at {addr:#x} with allocation id {alloc_id}");
            return None;
        };
        let count = match descriptor.static_count {
            Some(count) => count,
            // SAFETY: as above
            None => unsafe { ptr::read_unaligned((slot + COUNT_OFFSET) as *const usize) },
        };
        Some(PointerInfo {
            base_addr: slot + base_ptr_offset,
            alloc_id,
            type_id: descriptor.type_id,
            count,
            return_addr: 0,
        })
    }

    /// Move the main thread's stack into slot 0. `stack_begin` is the
    /// current stack pointer; the stack is taken to end just after the null
    /// terminating `envp`, the top of what the process entry set up. Returns
    /// the new stack pointer.
    ///
    /// # Safety
    /// - `envp` must be the environment array handed to `main`
    /// - as for [`relocate`], with `[stack_begin, end of envp)` as old range
    pub unsafe fn copy_main_stack(&self, envp: *const *const c_char, stack_begin: usize) -> Result<usize, RegionError> {
        let mut len = 0;
        // SAFETY: `envp` is null terminated
        while !unsafe { *envp.add(len) }.is_null() {
            len += 1;
        }
        // SAFETY: one past the terminator, still inside the array's stack page
        let stack_end = unsafe { envp.add(len + 1) } as usize;
        if stack_end <= stack_begin {
            return Err(RegionError::EmptyStack {
                begin: stack_begin,
                end: stack_end,
            });
        }
        // SAFETY: passed to caller
        unsafe { self.relocate_main_stack(stack_begin, stack_end) }
    }

    /// Copy the live stack `[old_begin, old_end)` so that it ends at the top
    /// of the main stack slot, rebasing pointers into the old range. Returns
    /// the new stack begin.
    ///
    /// # Safety
    /// See [`relocate`].
    pub unsafe fn relocate_main_stack(&self, old_begin: usize, old_end: usize) -> Result<usize, RegionError> {
        let main = self.main_stack();
        if old_end - old_begin > main.end - main.begin {
            return Err(RegionError::StackTooLarge {
                size: old_end - old_begin,
            });
        }
        // SAFETY: passed to caller; the main slot is large enough
        Ok(unsafe { relocate(old_begin, old_end, main.end) })
    }
}

/// Copy `[old_begin, old_end)` to just below `new_end` (16 byte aligned)
/// and rewrite every word of the copy that points into the old range by the
/// relocation distance. Returns the new begin.
///
/// Any word that merely looks like an old stack address is rewritten too;
/// this is accepted as unlikely.
///
/// # Safety
/// - `[old_begin, old_end)` must be readable, both ends word aligned
/// - the `old_end - old_begin` bytes below `new_end` must be writable and
///   must not overlap the old range
pub unsafe fn relocate(old_begin: usize, old_end: usize, new_end: usize) -> usize {
    const WORD: usize = std::mem::size_of::<usize>();
    debug_assert!(old_begin % WORD == 0 && old_end % WORD == 0);

    let size = old_end - old_begin;
    let new_begin = align_down(new_end - size, STACK_ALIGN);
    if new_begin % STACK_ALIGN != old_begin % STACK_ALIGN {
        warn!("Relocated stack changes alignment: {old_begin:#x} -> {new_begin:#x}");
    }
    // SAFETY: passed to caller
    unsafe { ptr::copy_nonoverlapping(old_begin as *const u8, new_begin as *mut u8, size) };

    let offset = new_begin.wrapping_sub(old_begin);
    for i in (0..size / WORD).rev() {
        let word = (new_begin + i * WORD) as *mut usize;
        // SAFETY: inside the copy we just made
        unsafe {
            let value = *word;
            if old_begin <= value && value < old_end {
                *word = value.wrapping_add(offset);
            }
        }
    }
    debug!("Relocated stack {old_begin:#x}..{old_end:#x} to {new_begin:#x}");
    new_begin
}
