//! Switching the stack pointer of the current thread.
//!
//! Two capabilities are offered. [`on_stack`] runs a closure with the stack
//! pointer moved to the top of some other memory, then returns to the old
//! stack. [`pivot`] moves the live stack for good: a callback copies it and
//! the caller continues on the copy.

use std::panic::{self, AssertUnwindSafe};

use crate::util::hint::fatal;

/// Whether [`on_stack`] actually pivots on this architecture.
pub const SUPPORTED: bool = cfg!(any(target_arch = "x86_64", target_arch = "aarch64"));

/// Alignment the ABI requires of the stack pointer at a call.
pub const STACK_ALIGN: usize = 16;

struct Frame<F, R> {
    f: Option<F>,
    result: Option<std::thread::Result<R>>,
}

extern "C" fn trampoline<F, R>(frame: *mut Frame<F, R>)
where
    F: FnOnce() -> R,
{
    // SAFETY: `frame` lives in the caller's frame on the old stack, which is
    // untouched until we return
    let frame = unsafe { &mut *frame };
    if let Some(f) = frame.f.take() {
        // resumed by `on_stack` once we are back on the old stack
        frame.result = Some(panic::catch_unwind(AssertUnwindSafe(f)));
    }
}

/// Run `f` with the stack pointer set to `top`, switching back afterwards.
/// Panics inside `f` are carried back and resumed on the original stack.
///
/// # Safety
/// - `top` must be the upper end of a writable region, aligned to
///   [`STACK_ALIGN`], that is large enough for everything `f` does
/// - nothing else may use that region while `f` runs
pub unsafe fn on_stack<F, R>(top: usize, f: F) -> R
where
    F: FnOnce() -> R,
{
    debug_assert_eq!(top % STACK_ALIGN, 0);
    let mut frame = Frame { f: Some(f), result: None };
    let entry = trampoline::<F, R> as extern "C" fn(*mut Frame<F, R>) as usize;
    let arg = &mut frame as *mut Frame<F, R> as usize;

    // SAFETY: requirements passed to the caller
    unsafe { switch_and_call(top, entry, arg) };

    match frame.result {
        Some(Ok(result)) => result,
        Some(Err(payload)) => panic::resume_unwind(payload),
        None => fatal(format_args!("stack switch returned without running the closure")),
    }
}

// `alloctype_stack_switch(arg, entry, top)` calls `entry(arg)` with the
// stack pointer at `top`. The frame pointer keeps the old stack pointer, and
// the CFI describes the caller's frame through it, so unwinders and
// backtraces walk from the new stack straight back onto the old one.
#[cfg(target_arch = "x86_64")]
std::arch::global_asm!(
    ".text",
    ".globl alloctype_stack_switch",
    ".hidden alloctype_stack_switch",
    ".type alloctype_stack_switch, @function",
    ".p2align 4",
    "alloctype_stack_switch:",
    ".cfi_startproc",
    "push rbp",
    ".cfi_def_cfa_offset 16",
    ".cfi_offset rbp, -16",
    "mov rbp, rsp",
    ".cfi_def_cfa_register rbp",
    "mov rsp, rdx",
    "call rsi",
    "mov rsp, rbp",
    "pop rbp",
    ".cfi_def_cfa rsp, 8",
    "ret",
    ".cfi_endproc",
    ".size alloctype_stack_switch, . - alloctype_stack_switch",
);

#[cfg(target_arch = "aarch64")]
std::arch::global_asm!(
    ".text",
    ".globl alloctype_stack_switch",
    ".hidden alloctype_stack_switch",
    ".type alloctype_stack_switch, %function",
    ".p2align 2",
    "alloctype_stack_switch:",
    ".cfi_startproc",
    "stp x29, x30, [sp, #-16]!",
    ".cfi_def_cfa_offset 16",
    ".cfi_offset x29, -16",
    ".cfi_offset x30, -8",
    "mov x29, sp",
    ".cfi_def_cfa_register x29",
    "mov sp, x2",
    "blr x1",
    "mov sp, x29",
    ".cfi_def_cfa sp, 16",
    "ldp x29, x30, [sp], #16",
    ".cfi_def_cfa_offset 0",
    ".cfi_restore x29",
    ".cfi_restore x30",
    "ret",
    ".cfi_endproc",
    ".size alloctype_stack_switch, . - alloctype_stack_switch",
);

#[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
extern "C" {
    fn alloctype_stack_switch(arg: usize, entry: usize, top: usize);
}

#[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
unsafe fn switch_and_call(top: usize, entry: usize, arg: usize) {
    // SAFETY: `entry` is a `trampoline` instantiation taking `arg`; `top`
    // is passed to the caller
    unsafe { alloctype_stack_switch(arg, entry, top) }
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
unsafe fn switch_and_call(_top: usize, entry: usize, arg: usize) {
    log::warn!("Stack switching is not supported on this architecture, staying on the current stack");
    // SAFETY: `entry` is a `trampoline` instantiation taking `arg`
    let entry: extern "C" fn(usize) = unsafe { std::mem::transmute(entry) };
    entry(arg);
}

/// Relocation callback for [`pivot`]: receives the argument and the stack
/// pointer, returns where the stack memory from that pointer upwards now
/// lives.
pub type Relocate = unsafe extern "C" fn(arg: usize, sp: usize) -> usize;

// `alloctype_stack_pivot(arg, relocate)` saves the frame pointer, calls
// `relocate(arg, sp)` and returns on the stack it hands back. The saved
// frame pointer and return address are read from the new stack.
#[cfg(target_arch = "x86_64")]
std::arch::global_asm!(
    ".text",
    ".globl alloctype_stack_pivot",
    ".hidden alloctype_stack_pivot",
    ".type alloctype_stack_pivot, @function",
    ".p2align 4",
    "alloctype_stack_pivot:",
    ".cfi_startproc",
    "push rbp",
    ".cfi_def_cfa_offset 16",
    ".cfi_offset rbp, -16",
    "mov rbp, rsp",
    ".cfi_def_cfa_register rbp",
    "mov rax, rsi",
    "mov rsi, rsp",
    "call rax",
    "mov rsp, rax",
    ".cfi_def_cfa rsp, 16",
    "pop rbp",
    ".cfi_def_cfa rsp, 8",
    "ret",
    ".cfi_endproc",
    ".size alloctype_stack_pivot, . - alloctype_stack_pivot",
);

#[cfg(target_arch = "aarch64")]
std::arch::global_asm!(
    ".text",
    ".globl alloctype_stack_pivot",
    ".hidden alloctype_stack_pivot",
    ".type alloctype_stack_pivot, %function",
    ".p2align 2",
    "alloctype_stack_pivot:",
    ".cfi_startproc",
    "stp x29, x30, [sp, #-16]!",
    ".cfi_def_cfa_offset 16",
    ".cfi_offset x29, -16",
    ".cfi_offset x30, -8",
    "mov x29, sp",
    ".cfi_def_cfa_register x29",
    "mov x2, x1",
    "mov x1, sp",
    "blr x2",
    "mov sp, x0",
    ".cfi_def_cfa sp, 16",
    "ldp x29, x30, [sp], #16",
    ".cfi_def_cfa_offset 0",
    ".cfi_restore x29",
    ".cfi_restore x30",
    "ret",
    ".cfi_endproc",
    ".size alloctype_stack_pivot, . - alloctype_stack_pivot",
);

#[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
extern "C" {
    fn alloctype_stack_pivot(arg: usize, relocate: Relocate);
}

/// Call `relocate(arg, sp)` with the current stack pointer (16 byte
/// aligned, everything above it belongs to live frames) and continue on the
/// stack pointer it returns. Returning `sp` unchanged stays put.
///
/// # Safety
/// - the returned address must hold an exact copy of the memory from `sp`
///   up to the outermost frame that will ever be returned to, with pointers
///   into the old range rebased
/// - values held in callee-saved registers other than the frame pointer are
///   not rebased
#[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
#[inline(never)]
pub unsafe fn pivot(relocate: Relocate, arg: usize) {
    // SAFETY: passed to caller
    unsafe { alloctype_stack_pivot(arg, relocate) }
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
pub unsafe fn pivot(_relocate: Relocate, _arg: usize) {
    log::warn!("Stack pivoting is not supported on this architecture, staying on the current stack");
}
