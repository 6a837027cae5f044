//! The C interface: instrumentation callbacks and runtime queries.
//!
//! All entry points share one process-wide [`Runtime`], created on first use
//! from the environment (see [`crate::config`]). Queries report through
//! out-pointers and return a [`StatusCode`]; out-pointers are only written
//! on success.
//!
//! The plain event callbacks (`alloctype_alloc`, `alloctype_alloc_stack`,
//! `alloctype_alloc_global`, `alloctype_free`) record a return address of 0,
//! since the callee has no portable way to read its caller's. Instrumentation
//! that wants call sites in [`CPointerInfo::return_addr`] and in free
//! diagnostics passes `__builtin_return_address(0)` to `alloctype_alloc_from`
//! and `alloctype_free_from` instead.

use std::{
    ffi::{c_char, c_int, c_void},
    ptr,
};

use log::error;
use once_cell::sync::OnceCell;

use crate::{
    config::{init_logging, Config},
    db::{AllocId, AllocKind, TypeId},
    error::{Status, StatusCode},
    resolve::PointerInfo,
    runtime::Runtime,
    tracker::Tracker,
};

static RUNTIME: OnceCell<Option<Runtime>> = OnceCell::new();

fn runtime() -> Option<&'static Runtime> {
    RUNTIME
        .get_or_init(|| {
            let config = Config::from_env();
            init_logging(config.log_level);
            match Runtime::from_config(config) {
                Ok(runtime) => Some(runtime),
                Err(err) => {
                    error!("Runtime disabled: {err}");
                    None
                }
            }
        })
        .as_ref()
}

/// A struct layout as handed to C. The arrays stay owned by the type
/// database and live as long as the process.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct CStructLayout {
    pub type_id: c_int,
    pub name: *const c_char,
    pub extent: usize,
    pub num_members: usize,
    pub offsets: *const usize,
    pub member_types: *const c_int,
    pub count: *const usize,
}

impl CStructLayout {
    pub const fn empty() -> Self {
        Self {
            type_id: -1,
            name: ptr::null(),
            extent: 0,
            num_members: 0,
            offsets: ptr::null(),
            member_types: ptr::null(),
            count: ptr::null(),
        }
    }
}

impl From<&crate::db::StructLayout> for CStructLayout {
    fn from(layout: &crate::db::StructLayout) -> Self {
        Self {
            type_id: layout.type_id as c_int,
            name: layout.c_name().as_ptr(),
            extent: layout.extent,
            num_members: layout.num_members(),
            offsets: layout.offsets().as_ptr(),
            member_types: layout.member_types().as_ptr(),
            count: layout.counts().as_ptr(),
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct CPointerInfo {
    pub type_id: c_int,
    pub count: usize,
    pub base_addr: *const c_void,
    pub return_addr: *const c_void,
}

impl From<PointerInfo> for CPointerInfo {
    fn from(info: PointerInfo) -> Self {
        Self {
            type_id: info.type_id as c_int,
            count: info.count,
            base_addr: info.base_addr as *const c_void,
            return_addr: info.return_addr as *const c_void,
        }
    }
}

/// Store `value` through `out` unless it is null.
///
/// # Safety
/// `out` must be null or valid for writes.
unsafe fn write_out<T>(out: *mut T, value: T) {
    if !out.is_null() {
        // SAFETY: passed to caller
        unsafe { out.write(value) };
    }
}

fn type_id_from_c(type_id: c_int) -> Result<TypeId, Status> {
    TypeId::try_from(type_id).map_err(|_| Status::InvalidTypeId)
}

fn alloc_kind_from_c(kind: c_int) -> Option<AllocKind> {
    match kind {
        0 => Some(AllocKind::Heap),
        1 => Some(AllocKind::Stack),
        2 => Some(AllocKind::Global),
        _ => None,
    }
}

fn on_alloc(addr: *const c_void, alloc_id: AllocId, count: usize, kind: AllocKind, return_addr: usize) {
    if let Some(runtime) = runtime() {
        runtime.on_alloc(addr as usize, alloc_id, count, kind, return_addr);
    }
}

/// Record a heap allocation. The return address is recorded as 0, see
/// `alloctype_alloc_from`.
#[no_mangle]
pub extern "C" fn alloctype_alloc(addr: *const c_void, alloc_id: AllocId, count: usize) {
    on_alloc(addr, alloc_id, count, AllocKind::Heap, 0)
}

#[no_mangle]
pub extern "C" fn alloctype_alloc_stack(addr: *const c_void, alloc_id: AllocId, count: usize) {
    on_alloc(addr, alloc_id, count, AllocKind::Stack, 0)
}

#[no_mangle]
pub extern "C" fn alloctype_alloc_global(addr: *const c_void, alloc_id: AllocId, count: usize) {
    on_alloc(addr, alloc_id, count, AllocKind::Global, 0)
}

/// Like the other allocation callbacks, with the kind passed as 0 (heap),
/// 1 (stack) or 2 (global) and the caller's return address recorded.
#[no_mangle]
pub extern "C" fn alloctype_alloc_from(
    addr: *const c_void,
    alloc_id: AllocId,
    count: usize,
    kind: c_int,
    return_addr: *const c_void,
) {
    if let Some(runtime) = runtime() {
        alloc_from(runtime, addr, alloc_id, count, kind, return_addr);
    }
}

fn alloc_from<B: Tracker>(
    runtime: &Runtime<B>,
    addr: *const c_void,
    alloc_id: AllocId,
    count: usize,
    kind: c_int,
    return_addr: *const c_void,
) {
    match alloc_kind_from_c(kind) {
        Some(kind) => {
            runtime.on_alloc(addr as usize, alloc_id, count, kind, return_addr as usize);
        }
        None => error!("Allocation {addr:p} has invalid kind {kind}"),
    }
}

#[no_mangle]
pub extern "C" fn alloctype_free(addr: *const c_void) {
    if let Some(runtime) = runtime() {
        runtime.on_free(addr as usize, 0);
    }
}

/// Like `alloctype_free`, naming the caller's return address in
/// diagnostics.
#[no_mangle]
pub extern "C" fn alloctype_free_from(addr: *const c_void, return_addr: *const c_void) {
    if let Some(runtime) = runtime() {
        runtime.on_free(addr as usize, return_addr as usize);
    }
}

#[no_mangle]
pub extern "C" fn alloctype_leave_scope(count: usize) {
    if let Some(runtime) = runtime() {
        runtime.on_scope_exit(count);
    }
}

unsafe fn pointer_info<B: Tracker>(runtime: &Runtime<B>, addr: *const c_void, out: *mut CPointerInfo) -> StatusCode {
    match runtime.resolve(addr as usize) {
        Ok(info) => {
            // SAFETY: passed to caller
            unsafe { write_out(out, info.into()) };
            StatusCode::Ok
        }
        Err(status) => status.into(),
    }
}

unsafe fn containing_info<B: Tracker>(
    runtime: &Runtime<B>,
    addr: *const c_void,
    out: *mut CPointerInfo,
    offset: *mut usize,
) -> StatusCode {
    match runtime.containing_info(addr as usize) {
        Ok((info, within)) => {
            // SAFETY: passed to caller
            unsafe {
                write_out(out, info.into());
                write_out(offset, within);
            }
            StatusCode::Ok
        }
        Err(status) => status.into(),
    }
}

unsafe fn subtype_info<B: Tracker>(
    runtime: &Runtime<B>,
    base_addr: *const c_void,
    offset: usize,
    container: *const CStructLayout,
    out: *mut CPointerInfo,
    sub_offset: *mut usize,
) -> StatusCode {
    // SAFETY: passed to caller
    let Some(container) = (unsafe { container.as_ref() }) else {
        return StatusCode::Error;
    };
    let result = type_id_from_c(container.type_id)
        .and_then(|type_id| runtime.struct_layout(type_id))
        .and_then(|layout| runtime.subtype_info(base_addr as usize, offset, layout));
    match result {
        Ok((subtype, within)) => {
            let info = CPointerInfo {
                type_id: subtype.type_id as c_int,
                count: subtype.count,
                base_addr: subtype.base_addr as *const c_void,
                return_addr: ptr::null(),
            };
            // SAFETY: passed to caller
            unsafe {
                write_out(out, info);
                write_out(sub_offset, within);
            }
            StatusCode::Ok
        }
        Err(status) => status.into(),
    }
}

unsafe fn resolve_type_id<B: Tracker>(runtime: &Runtime<B>, type_id: c_int, out: *mut CStructLayout) -> StatusCode {
    match type_id_from_c(type_id).and_then(|type_id| runtime.struct_layout(type_id)) {
        Ok(layout) => {
            // SAFETY: passed to caller
            unsafe { write_out(out, layout.into()) };
            StatusCode::Ok
        }
        Err(status) => status.into(),
    }
}

/// Copy `s` into memory owned by the C allocator.
fn c_strdup(s: &str) -> *mut c_char {
    let len = s.len();
    // SAFETY: the buffer holds `len + 1` bytes
    unsafe {
        let buf = libc::malloc(len + 1) as *mut c_char;
        if !buf.is_null() {
            ptr::copy_nonoverlapping(s.as_ptr() as *const c_char, buf, len);
            buf.add(len).write(0);
        }
        buf
    }
}

unsafe fn source_location<B: Tracker>(
    runtime: &Runtime<B>,
    addr: *const c_void,
    file: *mut *mut c_char,
    function: *mut *mut c_char,
    line: *mut u32,
) -> StatusCode {
    match runtime.source_location(addr as usize) {
        Ok(Some(location)) => {
            // SAFETY: passed to caller
            unsafe {
                write_out(file, c_strdup(&location.file));
                write_out(function, c_strdup(&location.function));
                write_out(line, location.line);
            }
            StatusCode::Ok
        }
        Ok(None) => StatusCode::Error,
        Err(status) => status.into(),
    }
}

/// Type and remaining element count at `addr`.
///
/// # Safety
/// `out` must be null or valid for writes.
#[no_mangle]
pub unsafe extern "C" fn alloctype_get_pointer_info(addr: *const c_void, out: *mut CPointerInfo) -> StatusCode {
    match runtime() {
        // SAFETY: passed to caller
        Some(runtime) => unsafe { pointer_info(runtime, addr, out) },
        None => StatusCode::Error,
    }
}

/// The allocation element containing `addr`, and the byte offset of `addr`
/// inside it.
///
/// # Safety
/// `out` and `offset` must be null or valid for writes.
#[no_mangle]
pub unsafe extern "C" fn alloctype_get_containing_info(
    addr: *const c_void,
    out: *mut CPointerInfo,
    offset: *mut usize,
) -> StatusCode {
    match runtime() {
        // SAFETY: passed to caller
        Some(runtime) => unsafe { containing_info(runtime, addr, out, offset) },
        None => StatusCode::Error,
    }
}

/// The member of the struct `container` at `base_addr` that contains byte
/// `offset`, and the offset inside (an element of) that member.
///
/// # Safety
/// `container` must be null or point to a layout from
/// [`alloctype_resolve_type_id`]; `out` and `sub_offset` must be null or
/// valid for writes.
#[no_mangle]
pub unsafe extern "C" fn alloctype_get_subtype_info(
    base_addr: *const c_void,
    offset: usize,
    container: *const CStructLayout,
    out: *mut CPointerInfo,
    sub_offset: *mut usize,
) -> StatusCode {
    match runtime() {
        // SAFETY: passed to caller
        Some(runtime) => unsafe { subtype_info(runtime, base_addr, offset, container, out, sub_offset) },
        None => StatusCode::Error,
    }
}

/// # Safety
/// `out` must be null or valid for writes.
#[no_mangle]
pub unsafe extern "C" fn alloctype_resolve_type_id(type_id: c_int, out: *mut CStructLayout) -> StatusCode {
    match runtime() {
        // SAFETY: passed to caller
        Some(runtime) => unsafe { resolve_type_id(runtime, type_id, out) },
        None => StatusCode::Error,
    }
}

fn type_query(type_id: c_int, query: impl FnOnce(&Runtime, TypeId) -> bool) -> bool {
    match (runtime(), TypeId::try_from(type_id)) {
        (Some(runtime), Ok(type_id)) => query(runtime, type_id),
        _ => false,
    }
}

#[no_mangle]
pub extern "C" fn alloctype_is_valid_type(type_id: c_int) -> bool {
    type_query(type_id, |rt, id| rt.db().is_valid(id))
}

#[no_mangle]
pub extern "C" fn alloctype_is_struct_type(type_id: c_int) -> bool {
    type_query(type_id, |rt, id| rt.db().is_struct(id))
}

#[no_mangle]
pub extern "C" fn alloctype_is_builtin_type(type_id: c_int) -> bool {
    type_query(type_id, |rt, id| rt.db().is_builtin(id))
}

#[no_mangle]
pub extern "C" fn alloctype_is_userdefined_type(type_id: c_int) -> bool {
    type_query(type_id, |rt, id| rt.db().is_user_defined(id))
}

#[no_mangle]
pub extern "C" fn alloctype_is_vector_type(type_id: c_int) -> bool {
    type_query(type_id, |rt, id| rt.db().is_vector(id))
}

/// Size of the type in bytes, 0 for invalid ids.
#[no_mangle]
pub extern "C" fn alloctype_get_type_size(type_id: c_int) -> usize {
    match (runtime(), type_id_from_c(type_id)) {
        (Some(runtime), Ok(type_id)) => runtime.db().type_size(type_id).unwrap_or(0),
        _ => 0,
    }
}

/// Printable name of the type. The string lives as long as the process.
#[no_mangle]
pub extern "C" fn alloctype_get_type_name(type_id: c_int) -> *const c_char {
    match (runtime(), type_id_from_c(type_id)) {
        (Some(runtime), Ok(type_id)) => runtime.db().c_type_name(type_id).as_ptr(),
        _ => c"<invalid>".as_ptr(),
    }
}

/// Where the allocation containing `addr` was made. The strings are
/// allocated with `malloc` and must be released with `free`.
///
/// # Safety
/// `file`, `function` and `line` must be null or valid for writes.
#[no_mangle]
pub unsafe extern "C" fn alloctype_get_source_location(
    addr: *const c_void,
    file: *mut *mut c_char,
    function: *mut *mut c_char,
    line: *mut u32,
) -> StatusCode {
    match runtime() {
        // SAFETY: passed to caller
        Some(runtime) => unsafe { source_location(runtime, addr, file, function, line) },
        None => StatusCode::Error,
    }
}

#[no_mangle]
pub extern "C" fn alloctype_status_name(status: StatusCode) -> *const c_char {
    status.name().as_ptr()
}

#[cfg(feature = "region-allocator")]
mod allocator {
    use std::ffi::{c_char, c_int, c_void};

    use log::{error, info};

    use super::runtime;
    use crate::{arch::stack::pivot, db::AllocId};

    unsafe extern "C" fn copy_main_stack(envp: usize, sp: usize) -> usize {
        let Some(runtime) = runtime() else {
            return sp;
        };
        // SAFETY: `envp` comes from `alloctype_allocator_setup_main_stack`
        match unsafe { runtime.backend().stack().copy_main_stack(envp as *const *const c_char, sp) } {
            Ok(new_sp) => {
                info!("Main stack moved from {sp:#x} to {new_sp:#x}");
                new_sp
            }
            Err(err) => {
                error!("Main stack stays in place: {err}");
                sp
            }
        }
    }

    /// Move the main thread's stack into the instrumented stack arena. Must
    /// be called at the start of `main`, with `main`'s arguments, before
    /// any other thread exists.
    ///
    /// # Safety
    /// `envp` must be the environment array the process was started with.
    #[no_mangle]
    pub unsafe extern "C" fn alloctype_allocator_setup_main_stack(
        _argc: c_int,
        _argv: *mut *mut c_char,
        envp: *mut *mut c_char,
    ) {
        // SAFETY: `copy_main_stack` either copies the whole stack up to the
        // end of `envp` or leaves it in place
        unsafe { pivot(copy_main_stack, envp as usize) }
    }

    /// Run a thread start routine on an arena stack. Thread creation wraps
    /// every start routine in this.
    #[no_mangle]
    pub extern "C" fn alloctype_allocator_run_thread(
        routine: extern "C" fn(*mut c_void) -> *mut c_void,
        arg: *mut c_void,
    ) -> *mut c_void {
        match runtime() {
            Some(runtime) => runtime.backend().stack().run_thread(|| routine(arg)),
            None => routine(arg),
        }
    }

    /// The address instrumented code uses for a stack allocation of `size`
    /// bytes placed at `addr` in the arena, or `addr` itself if the
    /// allocation stays untracked by the arena.
    #[no_mangle]
    pub extern "C" fn alloctype_allocator_stack_alias(addr: *mut c_void, size: usize) -> *mut c_void {
        runtime()
            .and_then(|runtime| runtime.backend().stack().alias(addr as usize, size))
            .map_or(addr, |view| view as *mut c_void)
    }

    /// Allocate `size` bytes for `count` elements of allocation site
    /// `alloc_id`.
    #[no_mangle]
    pub extern "C" fn alloctype_allocator_malloc(alloc_id: AllocId, count: usize, size: usize) -> *mut c_void {
        match runtime() {
            Some(runtime) => runtime.backend().malloc(alloc_id, count, size, 0) as *mut c_void,
            // SAFETY: plain system allocation
            None => unsafe { libc::malloc(size) },
        }
    }

    #[no_mangle]
    pub extern "C" fn alloctype_allocator_calloc(
        alloc_id: AllocId,
        count: usize,
        num: usize,
        size: usize,
    ) -> *mut c_void {
        match runtime() {
            Some(runtime) => runtime.backend().calloc(alloc_id, count, num, size, 0) as *mut c_void,
            // SAFETY: plain system allocation
            None => unsafe { libc::calloc(num, size) },
        }
    }

    /// # Safety
    /// `addr` must be null or a live pointer from one of the
    /// `alloctype_allocator_*` functions.
    #[no_mangle]
    pub unsafe extern "C" fn alloctype_allocator_realloc(
        alloc_id: AllocId,
        count: usize,
        addr: *mut c_void,
        size: usize,
    ) -> *mut c_void {
        match runtime() {
            // SAFETY: passed to caller
            Some(runtime) => unsafe { runtime.backend().realloc(alloc_id, count, addr as *mut u8, size, 0) as *mut c_void },
            // SAFETY: passed to caller
            None => unsafe { libc::realloc(addr, size) },
        }
    }

    /// # Safety
    /// `addr` must be null or a live pointer from one of the
    /// `alloctype_allocator_*` functions.
    #[no_mangle]
    pub unsafe extern "C" fn alloctype_allocator_free(addr: *mut c_void) {
        match runtime() {
            // SAFETY: passed to caller
            Some(runtime) => unsafe {
                runtime.backend().free(addr as *mut u8, 0);
            },
            // SAFETY: passed to caller
            None => unsafe { libc::free(addr) },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{ffi::CStr, sync::Arc};

    use super::*;
    use crate::{
        db::{
            builtin,
            tests::{basic_member, plain_struct},
            AllocationDescriptor, SourceLocation, TypeDb,
        },
        tracker::MapTracker,
    };

    struct Setup {
        runtime: Runtime<MapTracker>,
        alloc_id: AllocId,
        pair: TypeId,
    }

    fn setup() -> Setup {
        let mut db = TypeDb::new();
        let pair = db.register_struct(plain_struct(
            "Pair",
            16,
            vec![
                basic_member("i", builtin::INT32, 0, 4),
                basic_member("d", builtin::DOUBLE, 8, 8),
            ],
        ));
        let alloc_id = db.register_allocation(AllocationDescriptor::new(pair, AllocKind::Heap).with_location(
            SourceLocation {
                file: "pairs.c".into(),
                function: "make_pairs".into(),
                line: 7,
            },
        ));
        let db = Arc::new(db);
        Setup {
            runtime: Runtime::with_backend(Arc::clone(&db), MapTracker::new(db), Config::default()),
            alloc_id,
            pair,
        }
    }

    fn empty_info() -> CPointerInfo {
        CPointerInfo {
            type_id: -1,
            count: 0,
            base_addr: ptr::null(),
            return_addr: ptr::null(),
        }
    }

    #[test]
    fn pointer_queries() {
        let Setup { runtime, alloc_id, pair } = setup();
        let p = 0x4000;
        runtime.on_alloc(p, alloc_id, 3, AllocKind::Heap, 0x1234);

        let mut info = empty_info();
        let status = unsafe { pointer_info(&runtime, (p + 16) as *const c_void, &mut info) };
        assert_eq!(status, StatusCode::Ok);
        assert_eq!((info.type_id, info.count), (pair as c_int, 2));
        assert_eq!(info.return_addr as usize, 0x1234);

        let mut offset = usize::MAX;
        let status = unsafe { containing_info(&runtime, (p + 20) as *const c_void, &mut info, &mut offset) };
        assert_eq!(status, StatusCode::Ok);
        assert_eq!((info.base_addr as usize, offset), (p + 16, 4));

        let mut untouched = empty_info();
        let status = unsafe { pointer_info(&runtime, (p + 4) as *const c_void, &mut untouched) };
        assert_eq!(status, StatusCode::BadAlignment);
        assert_eq!(untouched.type_id, -1);

        assert_eq!(
            unsafe { pointer_info(&runtime, ptr::null(), ptr::null_mut()) },
            StatusCode::UnknownAddress
        );
    }

    #[test]
    fn explicit_return_addresses_are_reported() {
        let Setup { runtime, alloc_id, .. } = setup();
        let p = 0x6000;
        alloc_from(&runtime, p as *const c_void, alloc_id, 2, 0, 0x4242 as *const c_void);
        alloc_from(&runtime, 0x7000 as *const c_void, alloc_id, 2, 7, 0x4242 as *const c_void);

        let mut info = empty_info();
        assert_eq!(unsafe { pointer_info(&runtime, p as *const c_void, &mut info) }, StatusCode::Ok);
        assert_eq!((info.count, info.return_addr as usize), (2, 0x4242));
        assert_eq!(
            unsafe { pointer_info(&runtime, 0x7000 as *const c_void, &mut info) },
            StatusCode::UnknownAddress
        );
    }

    #[test]
    fn layouts_and_subtypes() {
        let Setup { runtime, pair, .. } = setup();
        let mut layout = CStructLayout::empty();
        assert_eq!(unsafe { resolve_type_id(&runtime, pair as c_int, &mut layout) }, StatusCode::Ok);
        assert_eq!(layout.num_members, 2);
        assert_eq!(layout.extent, 16);
        let name = unsafe { CStr::from_ptr(layout.name) };
        assert_eq!(name.to_str().unwrap(), "Pair");
        let offsets = unsafe { std::slice::from_raw_parts(layout.offsets, layout.num_members) };
        let types = unsafe { std::slice::from_raw_parts(layout.member_types, layout.num_members) };
        let counts = unsafe { std::slice::from_raw_parts(layout.count, layout.num_members) };
        assert_eq!(offsets, &[0, 8]);
        assert_eq!(types, &[builtin::INT32 as c_int, builtin::DOUBLE as c_int]);
        assert_eq!(counts, &[1, 1]);

        let mut info = empty_info();
        let mut offset = 0;
        let base = 0x8000 as *const c_void;
        let status = unsafe { subtype_info(&runtime, base, 8, &layout, &mut info, &mut offset) };
        assert_eq!(status, StatusCode::Ok);
        assert_eq!((info.type_id, info.base_addr as usize, offset), (builtin::DOUBLE as c_int, 0x8008, 0));

        // inside the double, and in the padding after the int
        let status = unsafe { subtype_info(&runtime, base, 10, &layout, &mut info, &mut offset) };
        assert_eq!(status, StatusCode::BadAlignment);
        assert_eq!(info.base_addr as usize, 0x8008);
        let status = unsafe { subtype_info(&runtime, base, 5, &layout, &mut info, &mut offset) };
        assert_eq!(status, StatusCode::BadAlignment);
        let status = unsafe { subtype_info(&runtime, base, 16, &layout, &mut info, &mut offset) };
        assert_eq!(status, StatusCode::BadOffset);

        assert_eq!(
            unsafe { resolve_type_id(&runtime, builtin::DOUBLE as c_int, &mut layout) },
            StatusCode::WrongKind
        );
        assert_eq!(unsafe { resolve_type_id(&runtime, -3, &mut layout) }, StatusCode::InvalidTypeId);
        assert_eq!(
            unsafe { subtype_info(&runtime, base, 0, ptr::null(), &mut info, &mut offset) },
            StatusCode::Error
        );
    }

    #[test]
    fn source_locations_are_copied() {
        let Setup { runtime, alloc_id, .. } = setup();
        let p = 0x5000;
        runtime.on_alloc(p, alloc_id, 1, AllocKind::Heap, 0);

        let mut file = ptr::null_mut();
        let mut function = ptr::null_mut();
        let mut line = 0;
        let status = unsafe { source_location(&runtime, (p + 8) as *const c_void, &mut file, &mut function, &mut line) };
        assert_eq!(status, StatusCode::Ok);
        unsafe {
            assert_eq!(CStr::from_ptr(file).to_str().unwrap(), "pairs.c");
            assert_eq!(CStr::from_ptr(function).to_str().unwrap(), "make_pairs");
            libc::free(file as *mut c_void);
            libc::free(function as *mut c_void);
        }
        assert_eq!(line, 7);

        for addr in [0x10, p + 16, 0x5555_0000] {
            let status = unsafe {
                source_location(&runtime, addr as *const c_void, &mut file, &mut function, &mut line)
            };
            assert_eq!(status, StatusCode::UnknownAddress, "{addr:#x}");
        }
    }

    #[test]
    fn conversions_from_c() {
        assert_eq!(type_id_from_c(-1), Err(Status::InvalidTypeId));
        assert_eq!(type_id_from_c(6), Ok(6));
        assert_eq!(alloc_kind_from_c(1), Some(AllocKind::Stack));
        assert_eq!(alloc_kind_from_c(3), None);
        let name = unsafe { CStr::from_ptr(alloctype_status_name(StatusCode::BadOffset)) };
        assert_eq!(name.to_str().unwrap(), "bad offset");
    }
}
