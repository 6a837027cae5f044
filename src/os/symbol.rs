//! Naming code addresses through the dynamic linker.

use std::{
    ffi::{c_void, CStr},
    fmt, mem,
};

/// The exported symbol a code address belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeSymbol {
    pub name: Option<String>,
    pub offset: usize,
    pub object: String,
}

impl fmt::Display for CodeSymbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{name}+{:#x} in {}", self.offset, self.object),
            None => write!(f, "{} ({:#x})", self.object, self.offset),
        }
    }
}

/// Look `addr` up with `dladdr`. Only symbols in dynamic symbol tables are
/// found; otherwise the offset is relative to the object's load address.
pub fn symbolize(addr: usize) -> Option<CodeSymbol> {
    if addr == 0 {
        return None;
    }
    // SAFETY: `Dl_info` is plain data, all-zero is a valid value
    let mut info: libc::Dl_info = unsafe { mem::zeroed() };
    // SAFETY: `dladdr` only reads its own tables and writes `info`
    if unsafe { libc::dladdr(addr as *const c_void, &mut info) } == 0 || info.dli_fname.is_null() {
        return None;
    }
    // SAFETY: non-null strings from `dladdr` stay valid while the object is loaded
    let object = unsafe { CStr::from_ptr(info.dli_fname) }.to_string_lossy().into_owned();
    if info.dli_sname.is_null() {
        return Some(CodeSymbol {
            name: None,
            offset: addr.wrapping_sub(info.dli_fbase as usize),
            object,
        });
    }
    // SAFETY: as above
    let name = unsafe { CStr::from_ptr(info.dli_sname) }.to_string_lossy().into_owned();
    Some(CodeSymbol {
        name: Some(name),
        offset: addr.wrapping_sub(info.dli_saddr as usize),
        object,
    })
}
