use std::cell::Cell;

thread_local! {
    static IN_RUNTIME: Cell<bool> = const { Cell::new(false) };
}

/// Marks the current thread as executing runtime code. Events raised while
/// a guard is held (the runtime's own allocations, log output) are not
/// tracked.
#[derive(Debug)]
pub struct ScopeGuard {
    _not_send: std::marker::PhantomData<*const ()>,
}

impl ScopeGuard {
    /// `None` if the current thread is already inside the runtime.
    pub fn enter() -> Option<Self> {
        let entered = IN_RUNTIME
            .try_with(|flag| !flag.replace(true))
            // thread-locals are gone during thread teardown
            .unwrap_or(false);
        entered.then_some(Self {
            _not_send: std::marker::PhantomData,
        })
    }

    pub fn is_active() -> bool {
        IN_RUNTIME.try_with(Cell::get).unwrap_or(true)
    }
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        let _ = IN_RUNTIME.try_with(|flag| flag.set(false));
    }
}
