use std::sync::{Mutex, MutexGuard};

/// Lock `lock`, taking the data back (and clearing the poison flag) if a
/// previous holder panicked.
pub(crate) fn lock_or_recover<'a, T>(lock: &'a Mutex<T>, what: &str) -> MutexGuard<'a, T> {
    lock.lock().unwrap_or_else(|poisoned| {
        tracing::warn!("recovering poisoned lock: {what}");
        lock.clear_poison();
        poisoned.into_inner()
    })
}
