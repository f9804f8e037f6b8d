// src/pool/entry.rs
use std::sync::Arc;

use crate::backend::{DatasetOpener, PooledDataset};

/// Sentinel refcount marking an entry whose handle is being opened. The
/// matching predicate only considers entries with `refcount >= 0`, so an
/// in-flight open is never matched or evicted.
pub(crate) const REFCOUNT_OPENING: i32 = -1;

/// One slot of the pool's LRU list. A slot may be empty (no handle, no key)
/// and still keep its place in the list; recycling refills it in place.
pub(crate) struct CacheEntry {
    /// Descriptor and open options joined into the cache key; `None` for an
    /// empty slot.
    pub key: Option<String>,
    pub owner: Option<String>,
    pub dataset: Option<Arc<dyn PooledDataset>>,
    /// Opener that produced `dataset`; the same opener closes it.
    pub opener: Option<Arc<dyn DatasetOpener>>,
    /// Responsible id of the thread that opened `dataset`.
    pub responsible_id: u64,
    pub ram_usage: u64,
    pub refcount: i32,
    pub prev: Option<usize>,
    pub next: Option<usize>,
}

impl CacheEntry {
    pub fn empty() -> Self {
        Self {
            key: None,
            owner: None,
            dataset: None,
            opener: None,
            responsible_id: 0,
            ram_usage: 0,
            refcount: 0,
            prev: None,
            next: None,
        }
    }
}

/// Build the cache key for a descriptor and its ordered open options.
pub(crate) fn cache_key(descriptor: &str, options: &[String]) -> String {
    let mut key = String::from(descriptor);
    for option in options {
        key.push_str("||");
        key.push_str(option);
    }
    key
}

/// Read-only view of one slot, reported in LRU order (most recently used
/// first) by [`DatasetPool::entries_snapshot`](crate::pool::DatasetPool::entries_snapshot).
#[derive(Debug, Clone)]
pub struct EntrySnapshot {
    pub key: Option<String>,
    pub owner: Option<String>,
    pub open: bool,
    pub refcount: i32,
    pub ram_usage: u64,
    pub responsible_id: u64,
}
