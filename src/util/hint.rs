/// Mark a diagnostic path as `#[cold]`, so the happy path stays tight.
#[cold]
pub fn cold<R, F: FnOnce() -> R>(f: F) -> R {
    f()
}

/// Log `msg` and abort the process. Used where continuing would mean
/// operating on a corrupted heap.
#[cold]
pub fn fatal(msg: std::fmt::Arguments<'_>) -> ! {
    log::error!("{msg}");
    eprintln!("alloctype: {msg}");
    std::process::abort()
}
