use std::{
    ffi::CStr,
    io,
    os::fd::{AsRawFd, FromRawFd, OwnedFd},
    ptr,
};

use libc::{
    c_void, ftruncate, memfd_create, mmap, mprotect, munmap, MAP_ANONYMOUS, MAP_FAILED, MAP_FIXED,
    MAP_NORESERVE, MAP_PRIVATE, MAP_SHARED, MFD_CLOEXEC, PROT_NONE, PROT_READ, PROT_WRITE,
};
use log::debug;
use once_cell::sync::Lazy;

use crate::util::{
    hint::cold,
    num::{align_up, round_up},
};

pub static PAGE_SIZE: Lazy<usize> = Lazy::new(page_size::get);

fn os_error(what: &str) -> io::Error {
    cold(|| {
        let err = io::Error::last_os_error();
        io::Error::new(err.kind(), format!("{what}: {err}"))
    })
}

/// A reservation of virtual address space, unmapped on drop.
#[derive(Debug)]
pub struct MmapRegion {
    ptr: *mut u8,
    size: usize,
}

// SAFETY: the region is just a range of addresses; synchronising access to
// its contents is up to the users of the region
unsafe impl Send for MmapRegion {}
unsafe impl Sync for MmapRegion {}

impl MmapRegion {
    /// `mmap()` a read/write, page-aligned region of at least `size` bytes
    /// without reserving swap, so untouched pages cost nothing.
    pub fn reserve(size: usize) -> io::Result<MmapRegion> {
        if size == 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "cannot mmap() 0 bytes"));
        }
        let size = round_up(size, *PAGE_SIZE);
        // SAFETY: a fresh anonymous mapping does not alias anything
        let ptr = unsafe {
            mmap(
                ptr::null_mut(),
                size,
                PROT_READ | PROT_WRITE,
                MAP_NORESERVE | MAP_ANONYMOUS | MAP_PRIVATE,
                -1,
                0,
            )
        };
        if ptr == MAP_FAILED {
            return Err(os_error("mmap"));
        }
        debug!("Reserved {size:#x} bytes at {ptr:p}");
        Ok(MmapRegion {
            ptr: ptr as *mut u8,
            size,
        })
    }

    /// Reserve enough space that `size` bytes starting at
    /// [`MmapRegion::aligned_start`] fit in the region.
    pub fn reserve_aligned(size: usize, align: usize) -> io::Result<MmapRegion> {
        Self::reserve(size + align)
    }

    pub fn start(&self) -> usize {
        self.ptr as usize
    }

    pub fn end(&self) -> usize {
        self.start() + self.size
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn contains(&self, addr: usize) -> bool {
        self.start() <= addr && addr < self.end()
    }

    /// First address inside the region aligned to `align` (a power of two).
    pub fn aligned_start(&self, align: usize) -> usize {
        align_up(self.start(), align)
    }

    /// Make `[addr, addr + len)` inaccessible, e.g. as a guard.
    pub fn protect_none(&self, addr: usize, len: usize) -> io::Result<()> {
        self.check_bounds(addr, len)?;
        // SAFETY: the range lies inside our own mapping
        if unsafe { mprotect(addr as *mut c_void, len, PROT_NONE) } != 0 {
            return Err(os_error("mprotect"));
        }
        Ok(())
    }

    /// Replace `[addr, addr + len)` with a shared view of `fd` from offset 0.
    /// Every view of the same file sees the same bytes.
    pub fn map_shared(&self, addr: usize, len: usize, fd: &MemFd) -> io::Result<()> {
        self.check_bounds(addr, len)?;
        // SAFETY: MAP_FIXED only replaces pages of our own mapping
        let mapped = unsafe {
            mmap(
                addr as *mut c_void,
                len,
                PROT_READ | PROT_WRITE,
                MAP_FIXED | MAP_SHARED | MAP_NORESERVE,
                fd.as_raw_fd(),
                0,
            )
        };
        if mapped == MAP_FAILED {
            return Err(os_error("mmap(MAP_FIXED)"));
        }
        Ok(())
    }

    fn check_bounds(&self, addr: usize, len: usize) -> io::Result<()> {
        if addr < self.start() || addr + len > self.end() || addr % *PAGE_SIZE != 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("range {addr:#x}+{len:#x} is not page aligned inside {:#x}+{:#x}", self.start(), self.size),
            ));
        }
        Ok(())
    }
}

impl Drop for MmapRegion {
    fn drop(&mut self) {
        // SAFETY:
        // - `ptr` is page aligned, as returned by mmap()
        // - the whole range still belongs to us: MAP_FIXED remaps only ever
        //   replaced pages inside it
        unsafe {
            munmap(self.ptr as *mut c_void, self.size);
        }
    }
}

/// An anonymous in-memory file, used to map the same memory at several
/// addresses.
#[derive(Debug)]
pub struct MemFd {
    fd: OwnedFd,
    size: usize,
}

impl MemFd {
    pub fn create(name: &CStr, size: usize) -> io::Result<MemFd> {
        // SAFETY: `name` is a valid C string
        let raw = unsafe { memfd_create(name.as_ptr(), MFD_CLOEXEC) };
        if raw < 0 {
            return Err(os_error("memfd_create"));
        }
        // SAFETY: we just created `raw` and nobody else owns it
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };
        let len = libc::off_t::try_from(size)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "memfd too large"))?;
        // SAFETY: `fd` is an open memfd
        if unsafe { ftruncate(fd.as_raw_fd(), len) } != 0 {
            return Err(os_error("ftruncate"));
        }
        Ok(MemFd { fd, size })
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }
}

impl AsRawFd for MemFd {
    fn as_raw_fd(&self) -> std::os::fd::RawFd {
        self.fd.as_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reservations_are_page_rounded() {
        let region = MmapRegion::reserve(100).unwrap();
        assert_eq!(region.len(), *PAGE_SIZE);
        assert!(region.contains(region.start()));
        assert!(!region.contains(region.end()));
        // SAFETY: inside the fresh read/write mapping
        unsafe {
            (region.start() as *mut u64).write(42);
            assert_eq!((region.start() as *const u64).read(), 42);
        }
        assert!(MmapRegion::reserve(0).is_err());
    }

    #[test]
    fn aligned_start_is_inside() {
        let align = 1 << 20;
        let region = MmapRegion::reserve_aligned(align, align).unwrap();
        let start = region.aligned_start(align);
        assert_eq!(start % align, 0);
        assert!(start + align <= region.end());
    }

    #[test]
    fn shared_views_alias() {
        let page = *PAGE_SIZE;
        let region = MmapRegion::reserve(4 * page).unwrap();
        let fd = MemFd::create(c"alloctype-test", page).unwrap();
        region.map_shared(region.start(), page, &fd).unwrap();
        region.map_shared(region.start() + 2 * page, page, &fd).unwrap();
        region.protect_none(region.start() + page, page).unwrap();
        // SAFETY: both pages are mapped read/write onto the same file page
        unsafe {
            (region.start() as *mut u32).add(3).write(0xdead_beef);
            let alias = (region.start() + 2 * page) as *const u32;
            assert_eq!(alias.add(3).read(), 0xdead_beef);
        }
        assert!(region.map_shared(region.start() + 1, page, &fd).is_err());
        assert!(region.protect_none(region.end(), page).is_err());
    }
}
