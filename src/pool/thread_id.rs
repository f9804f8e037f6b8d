// src/pool/thread_id.rs
use std::cell::Cell;
use std::sync::atomic::{AtomicU64, Ordering};

// Process-unique ids handed out lazily, one per OS thread.
static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static DEFAULT_ID: u64 = NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed);
    static RESPONSIBLE_ID: Cell<Option<u64>> = const { Cell::new(None) };
}

/// The identity under which backend opens and closes on this thread are
/// recorded. Defaults to a process-unique id of the thread itself.
pub fn responsible_thread_id() -> u64 {
    RESPONSIBLE_ID
        .with(Cell::get)
        .unwrap_or_else(|| DEFAULT_ID.with(|id| *id))
}

/// Override the responsible id of the current thread. The pool saves and
/// restores this around every backend open and close, so a caller-installed
/// id survives pool traffic on the same thread.
pub fn set_responsible_thread_id(id: u64) {
    RESPONSIBLE_ID.with(|cell| cell.set(Some(id)));
}

/// Install `id` for the lifetime of the returned guard, restoring the
/// previous id on drop (including unwinds out of a backend call).
pub(crate) fn swap_responsible_thread_id(id: u64) -> ResponsibleIdGuard {
    let previous = responsible_thread_id();
    set_responsible_thread_id(id);
    ResponsibleIdGuard { previous }
}

pub(crate) struct ResponsibleIdGuard {
    previous: u64,
}

impl Drop for ResponsibleIdGuard {
    fn drop(&mut self) {
        set_responsible_thread_id(self.previous);
    }
}
