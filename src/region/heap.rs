//! Segregated heap regions with the allocation id stored in front of every
//! pointer.
//!
//! ```plaintext
//! region i (slot size = min_slot << i), aligned to max_slot
//! +-------------+-------------+-------------+-- ... --+
//! | slot 0      | slot 1      | slot 2      |         |
//! +-------------+-------------+-------------+-- ... --+
//!
//! slot (aligned to its own size)
//! +------------+------+--------+---------------------+
//! | alloc_id   | live | count  | user data ...       |
//! +------------+------+--------+---------------------+
//! 0            4      8        min_alignment
//! ```
//!
//! Since slots are aligned to their size, `addr & !(slot_size - 1)` finds
//! the header of any address inside a slot without a lookup structure.

use std::{
    ptr, slice,
    sync::atomic::{AtomicUsize, Ordering},
};

use bytemuck::{Pod, Zeroable};
use crossbeam::utils::CachePadded;
use log::{debug, error};
use parking_lot::Mutex;

use super::{config::HeapConfig, RegionError};
use crate::{
    db::{AllocId, TypeDb},
    os::mem::MmapRegion,
    resolve::PointerInfo,
    util::{assert::aligned_to, num::align_down},
};

/// Marks a slot as handed out; cleared on free.
const LIVE: u32 = 0xa110_c8ed;

#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
struct SlotHeader {
    alloc_id: AllocId,
    live: u32,
    count: u64,
}

const HEADER_SIZE: usize = std::mem::size_of::<SlotHeader>();

/// # Safety
/// `slot` must be readable for `HEADER_SIZE` bytes
unsafe fn read_header(slot: usize) -> SlotHeader {
    // SAFETY: passed to caller
    let bytes = unsafe { slice::from_raw_parts(slot as *const u8, HEADER_SIZE) };
    bytemuck::pod_read_unaligned(bytes)
}

/// # Safety
/// `slot` must be writable for `HEADER_SIZE` bytes and not in use by anyone
/// else
unsafe fn write_header(slot: usize, header: SlotHeader) {
    let bytes = bytemuck::bytes_of(&header);
    // SAFETY: passed to caller
    unsafe { ptr::copy_nonoverlapping(bytes.as_ptr(), slot as *mut u8, HEADER_SIZE) }
}

#[derive(Debug)]
struct SizeClass {
    begin: usize,
    end: usize,
    slot_size: usize,
    /// Next never-used slot. May run past `end` once the region is full.
    bump: CachePadded<AtomicUsize>,
    /// Freed slots, reused last-in first-out
    free: Mutex<Vec<usize>>,
}

impl SizeClass {
    fn new(begin: usize, region_size: usize, slot_size: usize) -> Self {
        Self {
            begin,
            end: begin + region_size,
            slot_size,
            bump: CachePadded::new(AtomicUsize::new(begin)),
            free: Mutex::new(Vec::new()),
        }
    }

    fn high_water(&self) -> usize {
        self.bump.load(Ordering::Acquire).min(self.end)
    }

    fn take_slot(&self) -> Option<usize> {
        if let Some(slot) = self.free.lock().pop() {
            return Some(slot);
        }
        let slot = self.bump.fetch_add(self.slot_size, Ordering::AcqRel);
        if slot + self.slot_size > self.end {
            debug!("Heap region for {} byte slots is exhausted", self.slot_size);
            return None;
        }
        Some(slot)
    }

    fn release_slot(&self, slot: usize, addr: usize) -> Result<(), RegionError> {
        if !aligned_to(slot, self.slot_size) || slot < self.begin || slot >= self.high_water() {
            return Err(RegionError::InvalidFree { addr });
        }
        let mut free = self.free.lock();
        // SAFETY: `slot` is below the high-water mark, so it was handed out
        // at some point and its header is mapped
        let mut header = unsafe { read_header(slot) };
        if header.live != LIVE {
            return Err(RegionError::DoubleFree { addr });
        }
        header.live = 0;
        // SAFETY: the slot is ours again; the lock orders concurrent frees
        unsafe { write_header(slot, header) };
        free.push(slot);
        Ok(())
    }
}

/// All heap size classes, carved out of one address space reservation.
#[derive(Debug)]
pub struct HeapRegions {
    config: HeapConfig,
    classes: Vec<SizeClass>,
    begin: usize,
    end: usize,
    // keeps the reservation alive
    _region: MmapRegion,
}

impl HeapRegions {
    pub fn new(config: HeapConfig) -> Result<Self, RegionError> {
        let region = MmapRegion::reserve_aligned(config.reservation_size(), config.max_slot)?;
        let begin = region.aligned_start(config.max_slot);
        let classes = (0..config.class_count())
            .map(|i| SizeClass::new(begin + i * config.region_size, config.region_size, config.slot_size(i)))
            .collect();
        let end = begin + config.reservation_size();
        debug!(
            "Heap regions at {begin:#x}..{end:#x}, slots {}..={} bytes",
            config.min_slot, config.max_slot
        );
        Ok(Self {
            config,
            classes,
            begin,
            end,
            _region: region,
        })
    }

    pub fn contains(&self, addr: usize) -> bool {
        self.begin <= addr && addr < self.end
    }

    /// Bytes of user data before each pointer.
    pub fn header_size(&self) -> usize {
        self.config.min_alignment
    }

    fn class_of(&self, addr: usize) -> &SizeClass {
        &self.classes[(addr - self.begin) / self.config.region_size]
    }

    /// Allocate `size` bytes tagged with `alloc_id` and `count`. `None` if
    /// the request is too large or its size class is exhausted; callers fall
    /// back to the system allocator.
    pub fn allocate(&self, alloc_id: AllocId, count: usize, size: usize) -> Option<*mut u8> {
        let required = size.checked_add(self.header_size())?;
        let class = &self.classes[self.config.class_for(required)?];
        let slot = class.take_slot()?;
        let header = SlotHeader {
            alloc_id,
            live: LIVE,
            count: count as u64,
        };
        // SAFETY: `take_slot` hands out each slot to one owner at a time
        unsafe { write_header(slot, header) };
        Some((slot + self.header_size()) as *mut u8)
    }

    /// Bytes usable behind a pointer returned by [`HeapRegions::allocate`].
    pub fn usable_size(&self, addr: usize) -> Option<usize> {
        if !self.contains(addr) {
            return None;
        }
        Some(self.class_of(addr).slot_size - self.header_size())
    }

    /// Free `addr`. `Ok(false)` if the address does not belong to the
    /// regions at all; an error for corrupted or repeated frees.
    pub fn try_free(&self, addr: usize) -> Result<bool, RegionError> {
        if !self.contains(addr) {
            return Ok(false);
        }
        let slot = addr.wrapping_sub(self.header_size());
        if !self.contains(slot) {
            return Err(RegionError::InvalidFree { addr });
        }
        self.class_of(slot).release_slot(slot, addr)?;
        Ok(true)
    }

    /// Like [`HeapRegions::try_free`], but a corrupted or repeated free
    /// aborts the process: the heap can no longer be trusted.
    pub fn free(&self, addr: usize) -> bool {
        match self.try_free(addr) {
            Ok(ours) => ours,
            Err(err) => crate::util::hint::fatal(format_args!("{err}")),
        }
    }

    /// Recover the allocation containing `addr` from its slot header.
    pub fn find(&self, db: &TypeDb, addr: usize) -> Option<PointerInfo> {
        if !self.contains(addr) {
            return None;
        }
        let class = self.class_of(addr);
        let slot = align_down(addr, class.slot_size);
        if slot >= class.high_water() {
            return None;
        }
        // SAFETY: slots below the high-water mark are mapped
        let header = unsafe { read_header(slot) };
        if header.live != LIVE {
            return None;
        }
        let descriptor = match db.get_allocation(header.alloc_id) {
            Ok(descriptor) => descriptor,
            Err(_) => {
                error!("Found invalid allocation id {} at {addr:#x}", header.alloc_id);
                return None;
            }
        };
        Some(PointerInfo {
            base_addr: slot + descriptor.base_ptr_offset.unwrap_or(self.header_size()),
            alloc_id: header.alloc_id,
            type_id: descriptor.type_id,
            count: header.count as usize,
            return_addr: 0,
        })
    }
}
