//! Geometry of the region allocator. All sizes are powers of two.

use crate::util::{
    assert::is_power_of_two,
    num::{align_up, log2ceil, next_power_of_two, round_up},
};

/// Bytes between a slot's allocation id and its embedded element count.
pub const COUNT_OFFSET: usize = {
    let id = std::mem::size_of::<u32>();
    let align = std::mem::align_of::<usize>();
    if id > align {
        id
    } else {
        align
    }
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeapConfig {
    /// Address space per size class
    pub region_size: usize,
    pub min_slot: usize,
    pub max_slot: usize,
    /// Alignment of every pointer handed out, also the header size
    pub min_alignment: usize,
}

impl HeapConfig {
    pub fn class_count(&self) -> usize {
        (log2ceil(self.max_slot) - log2ceil(self.min_slot) + 1) as usize
    }

    /// Size class serving a request of `required` bytes (header included).
    pub fn class_for(&self, required: usize) -> Option<usize> {
        let slot = next_power_of_two(required).max(self.min_slot);
        if slot > self.max_slot {
            return None;
        }
        Some((log2ceil(slot) - log2ceil(self.min_slot)) as usize)
    }

    pub fn slot_size(&self, class: usize) -> usize {
        self.min_slot << class
    }

    /// Bytes covered by all size class regions together.
    pub fn reservation_size(&self) -> usize {
        self.class_count() * self.region_size
    }

    fn validate(&self) -> Result<(), String> {
        for (name, v) in [
            ("region_size", self.region_size),
            ("min_slot", self.min_slot),
            ("max_slot", self.max_slot),
            ("min_alignment", self.min_alignment),
        ] {
            if !is_power_of_two(v) {
                return Err(format!("heap {name} = {v:#x} is not a power of two"));
            }
        }
        if self.min_slot <= self.min_alignment || self.max_slot <= self.min_slot || self.region_size < self.max_slot {
            return Err("heap sizes must satisfy min_alignment < min_slot < max_slot <= region_size".into());
        }
        if self.min_alignment < COUNT_OFFSET + std::mem::size_of::<u64>() {
            return Err("heap min_alignment is too small to hold the slot header".into());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackConfig {
    /// Number of thread stacks, the main thread included
    pub thread_count: usize,
    pub stack_size: usize,
    pub min_slot: usize,
    pub max_slot: usize,
    /// Inaccessible bytes after every view of the stack memory
    pub guard_size: usize,
}

impl StackConfig {
    /// Bytes of stack memory shared by all views
    pub fn region_size(&self) -> usize {
        self.thread_count * self.stack_size
    }

    pub fn class_count(&self) -> usize {
        (log2ceil(self.max_slot) - log2ceil(self.min_slot) + 1) as usize
    }

    /// Distance between consecutive views; keeps every view aligned to
    /// `max_slot` and leaves room for the guard.
    pub fn view_stride(&self) -> usize {
        round_up(self.region_size() + self.guard_size, self.max_slot)
    }

    pub fn class_for(&self, size: usize) -> usize {
        let slot = next_power_of_two(size).max(self.min_slot);
        (log2ceil(slot) - log2ceil(self.min_slot)) as usize
    }

    /// Slot size (and alignment) of a stack allocation of `size` bytes.
    pub fn slot_size_for(&self, size: usize) -> usize {
        next_power_of_two(size).max(self.min_slot)
    }

    /// Offset from a stack address to its view for allocations of `size`.
    pub fn view_offset_for(&self, size: usize) -> usize {
        (self.class_for(size) + 1) * self.view_stride()
    }

    /// Offset from the allocation id to the user data of a slot.
    pub fn base_ptr_offset_for(&self, alignment: usize, is_vla: bool) -> usize {
        if is_vla {
            next_power_of_two(COUNT_OFFSET + std::mem::size_of::<usize>()).max(alignment)
        } else {
            std::mem::size_of::<u32>().max(alignment)
        }
    }

    /// Stack memory plus one view per size class, each with its guard.
    pub fn reservation_size(&self) -> usize {
        (self.class_count() + 1) * self.view_stride()
    }

    fn validate(&self) -> Result<(), String> {
        for (name, v) in [
            ("stack_size", self.stack_size),
            ("min_slot", self.min_slot),
            ("max_slot", self.max_slot),
            ("region_size", self.region_size()),
        ] {
            if !is_power_of_two(v) {
                return Err(format!("stack {name} = {v:#x} is not a power of two"));
            }
        }
        if self.thread_count < 2 {
            return Err("stack thread_count must leave room beside the main stack".into());
        }
        if self.max_slot <= self.min_slot || self.max_slot > self.stack_size {
            return Err("stack sizes must satisfy min_slot < max_slot <= stack_size".into());
        }
        if self.min_slot <= std::mem::size_of::<u32>() {
            return Err("stack min_slot is too small to hold an allocation id".into());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionConfig {
    pub heap: HeapConfig,
    pub stack: StackConfig,
}

impl Default for RegionConfig {
    fn default() -> Self {
        let page = *crate::os::mem::PAGE_SIZE;
        let stack_size = 1 << 24; // 16MB
        Self {
            heap: HeapConfig {
                region_size: 1 << 32, // 4GB
                min_slot: 1 << 5,
                max_slot: 1 << 30, // 1GB
                min_alignment: 16,
            },
            stack: StackConfig {
                thread_count: 16,
                stack_size,
                min_slot: 1 << 3,
                max_slot: stack_size >> 1,
                guard_size: 2 * page,
            },
        }
    }
}

impl RegionConfig {
    /// A configuration small enough to map many times over, for tests and
    /// memory-constrained hosts.
    pub fn small() -> Self {
        let page = *crate::os::mem::PAGE_SIZE;
        let stack_size = align_up(1 << 18, page);
        Self {
            heap: HeapConfig {
                region_size: 1 << 22,
                min_slot: 1 << 5,
                max_slot: 1 << 16,
                min_alignment: 16,
            },
            stack: StackConfig {
                thread_count: 4,
                stack_size,
                min_slot: 1 << 3,
                max_slot: stack_size >> 1,
                guard_size: 2 * page,
            },
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        self.heap.validate()?;
        self.stack.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn presets_are_valid() {
        assert_eq!(RegionConfig::default().validate(), Ok(()));
        assert_eq!(RegionConfig::small().validate(), Ok(()));
        assert_eq!(COUNT_OFFSET, 8);
    }

    #[test]
    fn heap_classes() {
        let heap = RegionConfig::default().heap;
        assert_eq!(heap.class_count(), 26);
        assert_eq!(heap.class_for(1), Some(0));
        assert_eq!(heap.class_for(32), Some(0));
        assert_eq!(heap.class_for(33), Some(1));
        assert_eq!(heap.slot_size(1), 64);
        assert_eq!(heap.class_for(1 << 30), Some(25));
        assert_eq!(heap.class_for((1 << 30) + 1), None);
    }

    #[test]
    fn stack_geometry() {
        let stack = RegionConfig::default().stack;
        assert_eq!(stack.region_size(), 1 << 28);
        assert_eq!(stack.class_count(), 21);
        assert_eq!(stack.slot_size_for(3), 8);
        assert_eq!(stack.slot_size_for(24), 32);
        assert_eq!(stack.class_for(24), 2);
        assert_eq!(stack.view_offset_for(8), stack.view_stride());
        assert_eq!(stack.view_stride() % stack.max_slot, 0);
        assert!(stack.view_stride() >= stack.region_size() + stack.guard_size);
        assert_eq!(stack.base_ptr_offset_for(8, false), 8);
        assert_eq!(stack.base_ptr_offset_for(2, false), 4);
        assert_eq!(stack.base_ptr_offset_for(8, true), 16);
        assert_eq!(stack.base_ptr_offset_for(64, true), 64);
    }

    #[test]
    fn invalid_geometry_is_rejected() {
        let mut config = RegionConfig::small();
        config.heap.min_slot = 48;
        assert!(config.validate().is_err());

        let mut config = RegionConfig::small();
        config.stack.thread_count = 1;
        assert!(config.validate().is_err());
    }
}
