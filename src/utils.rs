use std::sync::{Mutex, MutexGuard};

/// Locks `mutex`, recovering the data if a panicking holder poisoned it.
/// Callbacks and work run under `catch_unwind`, so a poisoned lock only means
/// one operation died halfway.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
