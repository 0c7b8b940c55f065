//! Scoped control over gradient tracking.
//!
//! The flag is thread local and only changed through guards, which restore the
//! previous value when dropped, on every exit path.

use std::{cell::Cell, marker::PhantomData};

thread_local! {
    static GRAD_ENABLED: Cell<bool> = const { Cell::new(true) };
}

/// Returns whether gradient tracking is enabled on this thread.
pub fn is_grad_enabled() -> bool {
    GRAD_ENABLED.with(Cell::get)
}

fn swap_grad_enabled(enabled: bool) -> bool {
    GRAD_ENABLED.with(|flag| flag.replace(enabled))
}

/// Disables gradient tracking until dropped.
#[must_use = "gradient tracking is re-enabled as soon as the guard is dropped"]
pub struct NoGradGuard {
    prev: bool,
    _not_send: PhantomData<*const ()>,
}

impl NoGradGuard {
    /// Creates a new `NoGradGuard`, disabling gradient tracking.
    pub fn new() -> Self {
        Self {
            prev: swap_grad_enabled(false),
            _not_send: PhantomData,
        }
    }
}

impl Default for NoGradGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for NoGradGuard {
    fn drop(&mut self) {
        swap_grad_enabled(self.prev);
    }
}

/// Enables gradient tracking until dropped, even inside a `NoGradGuard` scope.
#[must_use = "gradient tracking is disabled again as soon as the guard is dropped"]
pub struct EnableGradGuard {
    prev: bool,
    _not_send: PhantomData<*const ()>,
}

impl EnableGradGuard {
    /// Creates a new `EnableGradGuard`, enabling gradient tracking.
    pub fn new() -> Self {
        Self {
            prev: swap_grad_enabled(true),
            _not_send: PhantomData,
        }
    }
}

impl Default for EnableGradGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for EnableGradGuard {
    fn drop(&mut self) {
        swap_grad_enabled(self.prev);
    }
}
