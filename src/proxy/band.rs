// src/proxy/band.rs
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::backend::PooledBand;
use crate::error::{PoolError, Result};
use crate::proxy::dataset::ProxyDataset;
use crate::types::{ColorTable, DataType};

/// How a band's operations reach the backend: directly as band `n` of the
/// pooled dataset, or through that main band's overview or mask band. Child
/// routes pin the main dataset exactly once per operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BandRoute {
    Main,
    Overview(usize),
    Mask,
}

/// Shared state of one proxy band: the declared layout plus the caches that
/// accumulate for the proxy's lifetime.
pub(crate) struct BandCore {
    band_number: usize,
    route: BandRoute,
    data_type: DataType,
    size: (usize, usize),
    /// `(0, 0)` until the first successful acquisition backfills it.
    block_size: Mutex<(usize, usize)>,
    metadata_domains: Mutex<HashMap<String, Option<Vec<String>>>>,
    metadata_items: Mutex<HashMap<(String, String), Option<String>>>,
    overviews: Mutex<HashMap<usize, Arc<BandCore>>>,
    mask: Mutex<Option<Arc<BandCore>>>,
    /// Outstanding acquisitions routed through the main band; child routes
    /// only. Must be balanced when the band goes away.
    underlying_refs: AtomicUsize,
}

impl BandCore {
    pub(crate) fn new(
        band_number: usize,
        route: BandRoute,
        data_type: DataType,
        block_size: (usize, usize),
        size: (usize, usize),
    ) -> Self {
        Self {
            band_number,
            route,
            data_type,
            size,
            block_size: Mutex::new(block_size),
            metadata_domains: Mutex::new(HashMap::new()),
            metadata_items: Mutex::new(HashMap::new()),
            overviews: Mutex::new(HashMap::new()),
            mask: Mutex::new(None),
            underlying_refs: AtomicUsize::new(0),
        }
    }
}

impl Drop for BandCore {
    fn drop(&mut self) {
        if self.route != BandRoute::Main {
            debug_assert_eq!(
                self.underlying_refs.load(Ordering::SeqCst),
                0,
                "proxy band dropped with the main band still referenced"
            );
        }
    }
}

/// Per-band proxy. Cheap to clone; clones share the same caches.
#[derive(Clone)]
pub struct ProxyBand {
    dataset: Arc<ProxyDataset>,
    core: Arc<BandCore>,
}

impl ProxyBand {
    pub(crate) fn new(dataset: Arc<ProxyDataset>, core: Arc<BandCore>) -> Self {
        Self { dataset, core }
    }

    /// Acquire the pooled dataset, resolve this band (following the
    /// overview/mask route if any), run `f` against it, release. Returns
    /// `Ok(None)` when no handle is available (pool teardown, or the route
    /// target does not exist on the backend).
    fn with_band<R>(
        &self,
        force_open: bool,
        f: impl FnOnce(&dyn PooledBand) -> R,
    ) -> Result<Option<R>> {
        let Some(guard) = self.dataset.acquire(force_open)? else {
            return Ok(None);
        };
        let dataset = guard.dataset();
        let Some(main) = dataset.band(self.core.band_number) else {
            return Err(PoolError::BandOutOfRange {
                band: self.core.band_number,
                count: dataset.band_count(),
            });
        };

        let target = match self.core.route {
            BandRoute::Main => {
                // Backfill a deferred block size now that a real handle is
                // at hand
                let mut block_size = self.core.block_size.lock();
                if block_size.0 == 0 || block_size.1 == 0 {
                    *block_size = main.block_size();
                }
                main
            }
            BandRoute::Overview(index) => match main.overview(index) {
                Some(band) => band,
                None => return Ok(None),
            },
            BandRoute::Mask => match main.mask_band() {
                Some(band) => band,
                None => return Ok(None),
            },
        };

        if self.core.route != BandRoute::Main {
            self.core.underlying_refs.fetch_add(1, Ordering::SeqCst);
        }
        let result = f(target);
        if self.core.route != BandRoute::Main {
            self.core.underlying_refs.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(Some(result))
    }

    fn backend_error(&self, source: anyhow::Error) -> PoolError {
        PoolError::Backend {
            descriptor: self.dataset.descriptor().to_owned(),
            source,
        }
    }

    pub fn band_number(&self) -> usize {
        self.core.band_number
    }

    pub fn band_type(&self) -> DataType {
        self.core.data_type
    }

    pub fn size(&self) -> (usize, usize) {
        self.core.size
    }

    /// The declared or discovered block size. `(0, 0)` until the band's
    /// first successful acquisition if it was registered deferred.
    pub fn block_size(&self) -> (usize, usize) {
        *self.core.block_size.lock()
    }

    pub fn read_window(
        &self,
        window: (isize, isize),
        window_size: (usize, usize),
    ) -> Result<Option<Vec<f64>>> {
        match self.with_band(true, |band| band.read_window(window, window_size))? {
            Some(read) => read.map(Some).map_err(|e| self.backend_error(e)),
            None => Ok(None),
        }
    }

    pub fn no_data_value(&self) -> Result<Option<f64>> {
        Ok(self.with_band(true, |band| band.no_data_value())?.flatten())
    }

    pub fn description(&self) -> Result<Option<String>> {
        self.with_band(true, |band| band.description())
    }

    /// Metadata of one domain; the first read is kept for the proxy band's
    /// lifetime, like the dataset-level cache.
    pub fn metadata_domain(&self, domain: &str) -> Result<Option<Vec<String>>> {
        if let Some(cached) = self.core.metadata_domains.lock().get(domain) {
            return Ok(cached.clone());
        }
        let Some(result) = self.with_band(true, |band| band.metadata_domain(domain))? else {
            return Ok(None);
        };
        let mut cache = self.core.metadata_domains.lock();
        Ok(cache.entry(domain.to_owned()).or_insert(result).clone())
    }

    pub fn metadata_item(&self, key: &str, domain: &str) -> Result<Option<String>> {
        let cache_key = (key.to_owned(), domain.to_owned());
        if let Some(cached) = self.core.metadata_items.lock().get(&cache_key) {
            return Ok(cached.clone());
        }
        let Some(result) = self.with_band(true, |band| band.metadata_item(key, domain))? else {
            return Ok(None);
        };
        let mut cache = self.core.metadata_items.lock();
        Ok(cache.entry(cache_key).or_insert(result).clone())
    }

    /// Category names, re-read from the backend on every call and returned
    /// as an owned copy.
    pub fn category_names(&self) -> Result<Option<Vec<String>>> {
        Ok(self
            .with_band(true, |band| band.category_names())?
            .flatten())
    }

    /// Owned copy of the backend's color table, refreshed on every call.
    pub fn color_table(&self) -> Result<Option<ColorTable>> {
        Ok(self.with_band(true, |band| band.color_table())?.flatten())
    }

    pub fn unit(&self) -> Result<Option<String>> {
        self.with_band(true, |band| band.unit())
    }

    pub fn overview_count(&self) -> Result<Option<usize>> {
        self.with_band(true, |band| band.overview_count())
    }

    /// Proxy for overview `index` of this band. The child proxy routes its
    /// acquisitions through this band, pinning the pooled dataset exactly
    /// once per operation; it is constructed on first use and cached.
    pub fn overview(&self, index: usize) -> Result<Option<ProxyBand>> {
        if let Some(core) = self.core.overviews.lock().get(&index) {
            return Ok(Some(ProxyBand::new(
                Arc::clone(&self.dataset),
                Arc::clone(core),
            )));
        }
        let layout = self.with_band(true, |band| {
            band.overview(index)
                .map(|o| (o.band_type(), o.block_size(), o.size()))
        })?;
        match layout.flatten() {
            Some((data_type, block_size, size)) => {
                let child = Arc::new(BandCore::new(
                    self.core.band_number,
                    BandRoute::Overview(index),
                    data_type,
                    block_size,
                    size,
                ));
                let mut cache = self.core.overviews.lock();
                let core = Arc::clone(cache.entry(index).or_insert(child));
                Ok(Some(ProxyBand::new(Arc::clone(&self.dataset), core)))
            }
            None => Ok(None),
        }
    }

    /// Proxy for this band's mask band, constructed on first use and cached.
    pub fn mask_band(&self) -> Result<Option<ProxyBand>> {
        if let Some(core) = self.core.mask.lock().as_ref() {
            return Ok(Some(ProxyBand::new(
                Arc::clone(&self.dataset),
                Arc::clone(core),
            )));
        }
        let layout = self.with_band(true, |band| {
            band.mask_band()
                .map(|m| (m.band_type(), m.block_size(), m.size()))
        })?;
        match layout.flatten() {
            Some((data_type, block_size, size)) => {
                let child = Arc::new(BandCore::new(
                    self.core.band_number,
                    BandRoute::Mask,
                    data_type,
                    block_size,
                    size,
                ));
                let mut cache = self.core.mask.lock();
                let core = Arc::clone(cache.get_or_insert(child));
                Ok(Some(ProxyBand::new(Arc::clone(&self.dataset), core)))
            }
            None => Ok(None),
        }
    }

    /// Pre-declare the mask band layout without touching the backend.
    pub fn declare_mask_band(&self, data_type: DataType, block_size: (usize, usize)) {
        let mut mask = self.core.mask.lock();
        debug_assert!(mask.is_none(), "mask band already declared");
        mask.get_or_insert(Arc::new(BandCore::new(
            self.core.band_number,
            BandRoute::Mask,
            data_type,
            block_size,
            self.core.size,
        )));
    }

    /// Read the mask band layout from the backend unless one is already
    /// declared.
    pub fn discover_mask_band(&self) -> Result<()> {
        if self.core.mask.lock().is_some() {
            return Ok(());
        }
        self.mask_band().map(|_| ())
    }

    pub fn mask_flags(&self) -> Result<Option<u32>> {
        self.with_band(true, |band| band.mask_flags())
    }

    /// Flush the band if its dataset is currently open; never opens a closed
    /// dataset just to flush it.
    pub fn flush_cache(&self) -> Result<()> {
        match self.with_band(false, |band| band.flush_cache())? {
            Some(result) => result.map_err(|e| self.backend_error(e)),
            None => Ok(()),
        }
    }
}
