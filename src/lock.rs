use std::sync::{Mutex, MutexGuard};

/// Lock `mutex`, recovering the data if a previous holder panicked.
///
/// Guarded state in this crate is only ever replaced wholesale, never left
/// half-updated, so a poisoned lock still holds consistent data.
pub fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
  mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
