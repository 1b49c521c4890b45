use std::panic::Location;
use std::sync::{Mutex, MutexGuard};

/// Locks `mutex`, recovering the guard if a previous holder panicked.
///
/// The caches guarded this way only ever hold fully-constructed entries, so a
/// poisoned lock still protects consistent data.
#[track_caller]
pub(crate) fn lock<'a, T>(mutex: &'a Mutex<T>, context: &'static str) -> MutexGuard<'a, T> {
    mutex.lock().unwrap_or_else(|err| {
        let loc = Location::caller();
        tracing::error!(
            target: "jinject.jdwp",
            context,
            file = loc.file(),
            line = loc.line(),
            error = %err,
            "mutex poisoned; continuing with recovered guard"
        );
        err.into_inner()
    })
}
