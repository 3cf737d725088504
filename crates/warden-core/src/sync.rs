//! Lock helpers.

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Acquire a mutex, recovering the guard if another thread panicked while holding it.
///
/// All maps guarded this way stay consistent across a panic because every
/// critical section is a single insert, remove or lookup.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
