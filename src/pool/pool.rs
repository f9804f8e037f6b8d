// src/pool/pool.rs
use std::cell::Cell;
use std::ops::Deref;
use std::sync::{Arc, OnceLock};

use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, warn};

use crate::backend::{DatasetOpener, PooledDataset};
use crate::config::PoolConfig;
use crate::error::{PoolError, Result};
use crate::pool::entry::{cache_key, CacheEntry, EntrySnapshot, REFCOUNT_OPENING};
use crate::pool::thread_id;
use crate::types::Access;

thread_local! {
    // While non-zero on this thread, ref/unref of the pool itself are
    // no-ops. Incremented around every backend open and close so that proxy
    // datasets constructed inside an opener do not keep the pool alive.
    static SUPPRESS_POOL_REFCOUNT: Cell<u32> = const { Cell::new(0) };
}

fn pool_refcount_suppressed() -> bool {
    SUPPRESS_POOL_REFCOUNT.with(Cell::get) > 0
}

pub(crate) fn suppress_pool_refcount() -> SuppressRefcountGuard {
    SUPPRESS_POOL_REFCOUNT.with(|c| c.set(c.get() + 1));
    SuppressRefcountGuard
}

pub(crate) struct SuppressRefcountGuard;

impl Drop for SuppressRefcountGuard {
    fn drop(&mut self) {
        SUPPRESS_POOL_REFCOUNT.with(|c| c.set(c.get() - 1));
    }
}

struct PoolState {
    in_destruction: bool,
    /// Live-proxy count; the pool's contents are torn down when it reaches
    /// zero.
    refcount: i32,
    max_size: usize,
    max_ram_usage: u64,
    ram_usage: u64,
    entries: Vec<CacheEntry>,
    /// Most recently used slot.
    first: Option<usize>,
    /// Least recently used slot.
    last: Option<usize>,
}

impl PoolState {
    fn unlink(&mut self, slot: usize) {
        let (prev, next) = {
            let entry = &mut self.entries[slot];
            (entry.prev.take(), entry.next.take())
        };
        match prev {
            Some(p) => self.entries[p].next = next,
            None => self.first = next,
        }
        match next {
            Some(n) => self.entries[n].prev = prev,
            None => self.last = prev,
        }
    }

    fn push_front(&mut self, slot: usize) {
        self.entries[slot].prev = None;
        self.entries[slot].next = self.first;
        if let Some(old_first) = self.first {
            self.entries[old_first].prev = Some(slot);
        }
        self.first = Some(slot);
        if self.last.is_none() {
            self.last = Some(slot);
        }
    }

    fn move_to_front(&mut self, slot: usize) {
        if self.first == Some(slot) {
            return;
        }
        self.unlink(slot);
        self.push_front(slot);
    }

    fn new_slot_front(&mut self) -> usize {
        let slot = self.entries.len();
        self.entries.push(CacheEntry::empty());
        self.push_front(slot);
        slot
    }

    /// Walk from the most recently used end and keep the last match, i.e.
    /// the least recently used entry with refcount zero. With `require_ram`
    /// only entries currently charged against the RAM budget qualify.
    fn lru_zero_ref_candidate(&self, require_ram: bool) -> Option<usize> {
        let mut cur = self.first;
        let mut candidate = None;
        while let Some(slot) = cur {
            let entry = &self.entries[slot];
            if entry.refcount == 0 && (!require_ram || entry.ram_usage > 0) {
                candidate = Some(slot);
            }
            cur = entry.next;
        }
        candidate
    }

    /// Empty a slot in place: uncharge its RAM, clear key and owner, and
    /// take out the handle so it can be closed outside the lock. The slot
    /// keeps its position in the LRU list.
    fn clear_slot(&mut self, slot: usize) -> Option<ClosePlan> {
        let entry = &mut self.entries[slot];
        self.ram_usage -= entry.ram_usage;
        entry.ram_usage = 0;
        entry.key = None;
        entry.owner = None;
        let dataset = entry.dataset.take();
        let opener = entry.opener.take();
        match (dataset, opener) {
            (Some(dataset), Some(opener)) => Some(ClosePlan {
                dataset,
                opener,
                responsible_id: entry.responsible_id,
            }),
            _ => None,
        }
    }
}

/// A handle taken out of a cleared slot, to be closed with the pool lock
/// released, under the identity of the thread that opened it.
struct ClosePlan {
    dataset: Arc<dyn PooledDataset>,
    opener: Arc<dyn DatasetOpener>,
    responsible_id: u64,
}

impl ClosePlan {
    fn run(self) {
        let _id = thread_id::swap_responsible_thread_id(self.responsible_id);
        let _suppress = suppress_pool_refcount();
        self.opener.close(self.dataset);
    }
}

/// Aggregate counters of a pool, taken under the pool lock.
#[derive(Debug, Clone, Copy)]
pub struct PoolStats {
    pub size: usize,
    pub max_size: usize,
    pub ram_usage: u64,
    pub max_ram_usage: u64,
    pub refcount: i32,
}

/// A bounded pool of open dataset handles with LRU eviction.
///
/// The pool multiplexes an unbounded set of logical datasets through at most
/// `max_size` slots, closing the least recently used idle handle when a new
/// one is needed, and additionally closing idle handles while the summed RAM
/// estimates exceed the RAM budget. All operations are thread-safe; the
/// single internal lock is released around backend opens and closes, so an
/// opener may recursively acquire from the pool.
pub struct DatasetPool {
    state: Mutex<PoolState>,
}

static GLOBAL_POOL: OnceLock<Arc<DatasetPool>> = OnceLock::new();

impl DatasetPool {
    pub fn with_config(config: &PoolConfig) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(PoolState {
                in_destruction: false,
                refcount: 0,
                max_size: config.clamped_max_size(),
                max_ram_usage: config.max_ram_usage.bytes(),
                ram_usage: 0,
                entries: Vec::new(),
                first: None,
                last: None,
            }),
        })
    }

    /// The process-wide pool, lazily built from [`PoolConfig::from_env`].
    pub fn global() -> Arc<Self> {
        Arc::clone(GLOBAL_POOL.get_or_init(|| Self::with_config(&PoolConfig::from_env())))
    }

    /// Register a live proxy. No-op while the current thread is inside a
    /// backend open or close.
    pub fn add_ref(&self) {
        let mut state = self.state.lock();
        if !pool_refcount_suppressed() {
            state.refcount += 1;
        }
    }

    /// Drop a live-proxy reference; tears the pool's contents down when the
    /// last one goes away. No-op while inside a backend open or close.
    pub fn unref(&self) {
        let mut state = self.state.lock();
        if pool_refcount_suppressed() {
            return;
        }
        debug_assert!(state.refcount > 0, "unref of an unreferenced pool");
        state.refcount -= 1;
        if state.refcount == 0 {
            self.destroy_contents(state);
        }
    }

    /// Suspend teardown: `unref` (and `add_ref`) on this thread become
    /// no-ops until [`force_destroy`](Self::force_destroy) rebalances.
    pub fn prevent_destroy(&self) {
        SUPPRESS_POOL_REFCOUNT.with(|c| c.set(c.get() + 1));
    }

    /// Rebalance a prior [`prevent_destroy`](Self::prevent_destroy) and tear
    /// the pool down regardless of its refcount.
    pub fn force_destroy(&self) {
        SUPPRESS_POOL_REFCOUNT.with(|c| {
            debug_assert!(c.get() > 0, "force_destroy without prevent_destroy");
            c.set(c.get().saturating_sub(1));
        });
        debug_assert!(!pool_refcount_suppressed());
        let mut state = self.state.lock();
        state.refcount = 0;
        self.destroy_contents(state);
    }

    /// Borrow a handle for `descriptor`, opening it through `opener` if
    /// needed.
    ///
    /// A matching entry is reused and promoted to the head of the LRU list.
    /// With `shared` the request only matches an entry opened by the current
    /// responsible thread for the same owner tag; without it, only an entry
    /// nobody currently references. On a miss with `force_open` unset the
    /// call returns `Ok(None)`; otherwise a slot is allocated or the least
    /// recently used idle slot is recycled, and the backend opener runs with
    /// the pool lock released.
    pub fn acquire(
        &self,
        opener: &Arc<dyn DatasetOpener>,
        descriptor: &str,
        options: &[String],
        access: Access,
        shared: bool,
        force_open: bool,
        owner: Option<&str>,
    ) -> Result<Option<PoolGuard<'_>>> {
        let responsible_id = thread_id::responsible_thread_id();
        let key = cache_key(descriptor, options);

        let mut state = self.state.lock();
        if state.in_destruction {
            return Ok(None);
        }

        let mut cur = state.first;
        let mut hit = None;
        while let Some(slot) = cur {
            let entry = &state.entries[slot];
            cur = entry.next;
            // refcount < 0 marks an open in progress; never match it
            if entry.refcount >= 0
                && entry.key.as_deref() == Some(key.as_str())
                && ((shared
                    && entry.responsible_id == responsible_id
                    && entry.owner.as_deref() == owner)
                    || (!shared && entry.refcount == 0))
            {
                hit = Some(slot);
                break;
            }
        }
        if let Some(slot) = hit {
            state.move_to_front(slot);
            let entry = &mut state.entries[slot];
            if let Some(dataset) = entry.dataset.clone() {
                entry.refcount += 1;
                return Ok(Some(PoolGuard {
                    pool: self,
                    slot,
                    dataset,
                }));
            }
        }

        if !force_open {
            return Ok(None);
        }

        let (slot, victim_close) = if state.entries.len() == state.max_size {
            // recycle the least recently used idle slot
            match state.lru_zero_ref_candidate(false) {
                Some(victim) => {
                    let close = state.clear_slot(victim);
                    state.move_to_front(victim);
                    (victim, close)
                }
                None => {
                    warn!(
                        max_size = state.max_size,
                        descriptor, "dataset pool exhausted, no idle entry to recycle"
                    );
                    return Err(PoolError::Exhausted {
                        max_size: state.max_size,
                    });
                }
            }
        } else {
            (state.new_slot_front(), None)
        };

        {
            let entry = &mut state.entries[slot];
            entry.key = Some(key);
            entry.owner = owner.map(str::to_owned);
            entry.responsible_id = responsible_id;
            entry.refcount = REFCOUNT_OPENING;
            entry.ram_usage = 0;
            entry.opener = Some(Arc::clone(opener));
        }

        // Release the lock across the expensive backend calls. The sentinel
        // refcount keeps concurrent lookups away from this slot.
        drop(state);

        if let Some(close) = victim_close {
            close.run();
        }

        let opened = {
            let _suppress = suppress_pool_refcount();
            opener.open(descriptor, options, access)
        };

        let mut state = self.state.lock();
        if state.in_destruction || slot >= state.entries.len() {
            // The pool was torn down while the backend call was in flight
            drop(state);
            if let Ok(dataset) = opened {
                let _suppress = suppress_pool_refcount();
                opener.close(dataset);
            }
            return Ok(None);
        }
        match opened {
            Ok(dataset) => {
                let ram_usage = dataset.estimated_ram_usage();
                {
                    let entry = &mut state.entries[slot];
                    entry.dataset = Some(Arc::clone(&dataset));
                    entry.refcount = 1;
                    entry.ram_usage = ram_usage;
                }
                state.ram_usage += ram_usage;
                debug!(descriptor, ram_usage, "opened pooled dataset");

                if state.max_ram_usage > 0 && ram_usage > 0 {
                    state = self.relieve_ram_pressure(state, slot);
                }
                drop(state);

                Ok(Some(PoolGuard {
                    pool: self,
                    slot,
                    dataset,
                }))
            }
            Err(source) => {
                // Return the slot empty and reusable
                let entry = &mut state.entries[slot];
                entry.key = None;
                entry.owner = None;
                entry.dataset = None;
                entry.opener = None;
                entry.refcount = 0;
                entry.ram_usage = 0;
                Err(PoolError::OpenFailed {
                    descriptor: descriptor.to_owned(),
                    source,
                })
            }
        }
    }

    /// Close idle handles until the RAM budget is met. The just-opened slot
    /// is pinned (refcount 1) and therefore never selected; the loop also
    /// stops once the remaining usage is the just-opened entry's own.
    fn relieve_ram_pressure<'a>(
        &'a self,
        mut state: MutexGuard<'a, PoolState>,
        just_opened: usize,
    ) -> MutexGuard<'a, PoolState> {
        loop {
            if just_opened >= state.entries.len() {
                // Torn down while the previous victim was being closed
                return state;
            }
            if state.ram_usage <= state.max_ram_usage
                || state.ram_usage == state.entries[just_opened].ram_usage
            {
                return state;
            }
            let Some(victim) = state.lru_zero_ref_candidate(true) else {
                return state;
            };
            // The emptied slot keeps its place in the list for recycling
            let close = state.clear_slot(victim);
            drop(state);
            if let Some(close) = close {
                close.run();
            }
            state = self.state.lock();
        }
    }

    pub(crate) fn release_slot(&self, slot: usize) {
        let mut state = self.state.lock();
        // Slots only vanish on teardown; a late release is then a no-op
        let Some(entry) = state.entries.get_mut(slot) else {
            return;
        };
        debug_assert!(entry.refcount > 0, "release of an unreferenced pool entry");
        entry.refcount -= 1;
    }

    /// If an idle open entry exists for this key and owner, close its handle
    /// under the opener thread's identity and leave the slot empty in place.
    pub fn close_if_idle(&self, descriptor: &str, options: &[String], owner: Option<&str>) {
        let mut state = self.state.lock();
        if state.in_destruction {
            return;
        }
        let key = cache_key(descriptor, options);
        let mut cur = state.first;
        while let Some(slot) = cur {
            let entry = &state.entries[slot];
            cur = entry.next;
            if entry.refcount == 0
                && entry.key.as_deref() == Some(key.as_str())
                && entry.owner.as_deref() == owner
                && entry.dataset.is_some()
            {
                let close = state.clear_slot(slot);
                drop(state);
                if let Some(close) = close {
                    close.run();
                }
                return;
            }
        }
    }

    /// Per-slot view in LRU order (most recently used first).
    pub fn entries_snapshot(&self) -> Vec<EntrySnapshot> {
        let state = self.state.lock();
        let mut snapshot = Vec::with_capacity(state.entries.len());
        let mut cur = state.first;
        while let Some(slot) = cur {
            let entry = &state.entries[slot];
            cur = entry.next;
            snapshot.push(EntrySnapshot {
                key: entry.key.clone(),
                owner: entry.owner.clone(),
                open: entry.dataset.is_some(),
                refcount: entry.refcount,
                ram_usage: entry.ram_usage,
                responsible_id: entry.responsible_id,
            });
        }
        snapshot
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.state.lock();
        PoolStats {
            size: state.entries.len(),
            max_size: state.max_size,
            ram_usage: state.ram_usage,
            max_ram_usage: state.max_ram_usage,
            refcount: state.refcount,
        }
    }

    /// Close every handle under its recorded opener identity and empty the
    /// list. Concurrent pool operations observe `in_destruction` and no-op.
    fn destroy_contents<'a>(&'a self, mut state: MutexGuard<'a, PoolState>) {
        state.in_destruction = true;
        loop {
            let Some(slot) = state.entries.iter().position(|e| e.dataset.is_some()) else {
                break;
            };
            debug_assert!(
                state.entries[slot].refcount == 0,
                "pool torn down with a referenced entry"
            );
            let close = state.clear_slot(slot);
            drop(state);
            if let Some(close) = close {
                close.run();
            }
            state = self.state.lock();
        }
        state.entries.clear();
        state.first = None;
        state.last = None;
        state.ram_usage = 0;
        state.in_destruction = false;
    }
}

/// A borrowed pool entry. The underlying handle stays pinned (refcount held)
/// until the guard drops; eviction is lazy, so the handle may or may not
/// still be open in the pool afterwards.
pub struct PoolGuard<'a> {
    pool: &'a DatasetPool,
    slot: usize,
    dataset: Arc<dyn PooledDataset>,
}

impl PoolGuard<'_> {
    pub fn dataset(&self) -> &Arc<dyn PooledDataset> {
        &self.dataset
    }
}

impl Deref for PoolGuard<'_> {
    type Target = dyn PooledDataset;

    fn deref(&self) -> &Self::Target {
        self.dataset.as_ref()
    }
}

impl Drop for PoolGuard<'_> {
    fn drop(&mut self) {
        self.pool.release_slot(self.slot);
    }
}
