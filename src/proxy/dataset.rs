// src/proxy/dataset.rs
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::warn;

use crate::backend::{DatasetOpener, PooledDataset};
use crate::error::{PoolError, Result};
use crate::pool::thread_id;
use crate::pool::{DatasetPool, PoolGuard};
use crate::proxy::band::{BandCore, BandRoute, ProxyBand};
use crate::types::{Access, DataType, Gcp, GeoTransform, SpatialRef};

/// User-visible handle for one logical dataset.
///
/// The proxy holds no backend handle of its own. Every forwarded operation
/// borrows one from the pool, delegates, and returns it; the handle may be
/// evicted between two operations. Results that the backend hands out by
/// reference are copied into proxy-owned caches so they stay valid for the
/// proxy's lifetime.
pub struct ProxyDataset {
    pool: Arc<DatasetPool>,
    opener: Arc<dyn DatasetOpener>,
    descriptor: String,
    options: Vec<String>,
    access: Access,
    shared: bool,
    owner: Option<String>,
    /// Responsible id of the creating thread; installed around every
    /// acquisition so handles opened on behalf of this proxy are recorded
    /// against its creator.
    responsible_id: u64,
    raster_size: (usize, usize),
    srs_override: Mutex<Option<SpatialRef>>,
    gt_override: Mutex<Option<GeoTransform>>,
    metadata_domains: Mutex<HashMap<String, Option<Vec<String>>>>,
    metadata_items: Mutex<HashMap<(String, String), Option<String>>>,
    bands: Mutex<Vec<Arc<BandCore>>>,
}

impl ProxyDataset {
    /// Proxy with caller-supplied dimensions. No backend access occurs; the
    /// dataset is only opened when an operation needs it.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        opener: Arc<dyn DatasetOpener>,
        descriptor: impl Into<String>,
        options: &[String],
        raster_size: (usize, usize),
        access: Access,
        shared: bool,
        projection: Option<SpatialRef>,
        geo_transform: Option<GeoTransform>,
        owner: Option<&str>,
    ) -> Arc<Self> {
        Arc::new(Self::build(
            DatasetPool::global(),
            opener,
            descriptor.into(),
            options,
            raster_size,
            access,
            shared,
            projection,
            geo_transform,
            owner,
        ))
    }

    /// Same as [`new`](Self::new) against an explicit pool.
    #[allow(clippy::too_many_arguments)]
    pub fn new_in(
        pool: Arc<DatasetPool>,
        opener: Arc<dyn DatasetOpener>,
        descriptor: impl Into<String>,
        options: &[String],
        raster_size: (usize, usize),
        access: Access,
        shared: bool,
        projection: Option<SpatialRef>,
        geo_transform: Option<GeoTransform>,
        owner: Option<&str>,
    ) -> Arc<Self> {
        Arc::new(Self::build(
            pool,
            opener,
            descriptor.into(),
            options,
            raster_size,
            access,
            shared,
            projection,
            geo_transform,
            owner,
        ))
    }

    /// Proxy whose dimensions, georeferencing and band layout are read from
    /// the backend with a single acquisition, then released.
    pub fn open(
        opener: Arc<dyn DatasetOpener>,
        descriptor: impl Into<String>,
        options: &[String],
        access: Access,
        shared: bool,
        owner: Option<&str>,
    ) -> Result<Arc<Self>> {
        Self::open_in(
            DatasetPool::global(),
            opener,
            descriptor,
            options,
            access,
            shared,
            owner,
        )
    }

    /// Same as [`open`](Self::open) against an explicit pool.
    pub fn open_in(
        pool: Arc<DatasetPool>,
        opener: Arc<dyn DatasetOpener>,
        descriptor: impl Into<String>,
        options: &[String],
        access: Access,
        shared: bool,
        owner: Option<&str>,
    ) -> Result<Arc<Self>> {
        let mut this = Self::build(
            pool,
            opener,
            descriptor.into(),
            options,
            (0, 0),
            access,
            shared,
            None,
            None,
            owner,
        );

        let (raster_size, projection, geo_transform, band_layout) = {
            let Some(guard) = this.acquire(true)? else {
                return Err(PoolError::OpenFailed {
                    descriptor: this.descriptor.clone(),
                    source: anyhow::anyhow!("dataset pool is being torn down"),
                });
            };
            let dataset = guard.dataset();
            let band_count = dataset.band_count();
            let mut band_layout = Vec::with_capacity(band_count);
            for index in 1..=band_count {
                let band = dataset.band(index).ok_or(PoolError::BandOutOfRange {
                    band: index,
                    count: band_count,
                })?;
                band_layout.push((band.band_type(), band.block_size()));
            }
            (
                dataset.raster_size(),
                dataset.projection(),
                dataset.geo_transform(),
                band_layout,
            )
        };

        this.raster_size = raster_size;
        *this.srs_override.get_mut() = projection;
        *this.gt_override.get_mut() = geo_transform;
        let bands = this.bands.get_mut();
        for (data_type, block_size) in band_layout {
            let number = bands.len() + 1;
            bands.push(Arc::new(BandCore::new(
                number,
                BandRoute::Main,
                data_type,
                block_size,
                raster_size,
            )));
        }
        Ok(Arc::new(this))
    }

    #[allow(clippy::too_many_arguments)]
    fn build(
        pool: Arc<DatasetPool>,
        opener: Arc<dyn DatasetOpener>,
        descriptor: String,
        options: &[String],
        raster_size: (usize, usize),
        access: Access,
        shared: bool,
        projection: Option<SpatialRef>,
        geo_transform: Option<GeoTransform>,
        owner: Option<&str>,
    ) -> Self {
        pool.add_ref();
        Self {
            pool,
            opener,
            descriptor,
            options: options.to_vec(),
            access,
            shared,
            owner: owner.map(str::to_owned),
            responsible_id: thread_id::responsible_thread_id(),
            raster_size,
            srs_override: Mutex::new(projection),
            gt_override: Mutex::new(geo_transform),
            metadata_domains: Mutex::new(HashMap::new()),
            metadata_items: Mutex::new(HashMap::new()),
            bands: Mutex::new(Vec::new()),
        }
    }

    /// Borrow the backend handle, pretending to be the thread that created
    /// this proxy so that auxiliary opens inside the backend are recorded
    /// against the creator and closed under the same identity later.
    pub(crate) fn acquire(&self, force_open: bool) -> Result<Option<PoolGuard<'_>>> {
        let _id = thread_id::swap_responsible_thread_id(self.responsible_id);
        self.pool.acquire(
            &self.opener,
            &self.descriptor,
            &self.options,
            self.access,
            self.shared,
            force_open,
            self.owner.as_deref(),
        )
    }

    fn with_dataset<R>(
        &self,
        force_open: bool,
        f: impl FnOnce(&dyn PooledDataset) -> R,
    ) -> Result<Option<R>> {
        match self.acquire(force_open)? {
            Some(guard) => Ok(Some(f(&*guard))),
            None => Ok(None),
        }
    }

    pub fn descriptor(&self) -> &str {
        &self.descriptor
    }

    pub fn options(&self) -> &[String] {
        &self.options
    }

    pub fn access(&self) -> Access {
        self.access
    }

    pub fn is_shared(&self) -> bool {
        self.shared
    }

    pub fn owner(&self) -> Option<&str> {
        self.owner.as_deref()
    }

    pub fn raster_size(&self) -> (usize, usize) {
        self.raster_size
    }

    pub fn band_count(&self) -> usize {
        self.bands.lock().len()
    }

    /// Register a band description, block size `(0, 0)` meaning "read from
    /// the backend on the band's first acquisition".
    pub fn add_band(&self, data_type: DataType, block_size: (usize, usize)) {
        let mut bands = self.bands.lock();
        let number = bands.len() + 1;
        bands.push(Arc::new(BandCore::new(
            number,
            BandRoute::Main,
            data_type,
            block_size,
            self.raster_size,
        )));
    }

    /// The proxy band for 1-based index `band`.
    pub fn band(self: &Arc<Self>, band: usize) -> Result<ProxyBand> {
        let bands = self.bands.lock();
        if band == 0 || band > bands.len() {
            return Err(PoolError::BandOutOfRange {
                band,
                count: bands.len(),
            });
        }
        Ok(ProxyBand::new(Arc::clone(self), Arc::clone(&bands[band - 1])))
    }

    /// Spatial reference supplied at construction (or discovered by
    /// [`open`](Self::open)) if any, else read from the backend.
    pub fn spatial_ref(&self) -> Result<Option<SpatialRef>> {
        if let Some(srs) = self.srs_override.lock().clone() {
            return Ok(Some(srs));
        }
        Ok(self.with_dataset(true, |ds| ds.projection())?.flatten())
    }

    /// Drop the construction-time spatial reference; later reads go to the
    /// backend.
    pub fn clear_spatial_ref_override(&self) {
        *self.srs_override.lock() = None;
    }

    pub fn geo_transform(&self) -> Result<Option<GeoTransform>> {
        if let Some(gt) = *self.gt_override.lock() {
            return Ok(Some(gt));
        }
        Ok(self.with_dataset(true, |ds| ds.geo_transform())?.flatten())
    }

    /// Drop the construction-time geotransform; later reads go to the
    /// backend.
    pub fn clear_geo_transform_override(&self) {
        *self.gt_override.lock() = None;
    }

    /// Metadata of one domain. The first successful read is kept for the
    /// proxy's lifetime; later calls return the stored copy even if the
    /// backend would answer differently by then.
    pub fn metadata_domain(&self, domain: &str) -> Result<Option<Vec<String>>> {
        if let Some(cached) = self.metadata_domains.lock().get(domain) {
            return Ok(cached.clone());
        }
        let Some(result) = self.with_dataset(true, |ds| ds.metadata_domain(domain))? else {
            return Ok(None);
        };
        let mut cache = self.metadata_domains.lock();
        Ok(cache.entry(domain.to_owned()).or_insert(result).clone())
    }

    /// Single metadata item; cached like [`metadata_domain`](Self::metadata_domain).
    pub fn metadata_item(&self, key: &str, domain: &str) -> Result<Option<String>> {
        let cache_key = (key.to_owned(), domain.to_owned());
        if let Some(cached) = self.metadata_items.lock().get(&cache_key) {
            return Ok(cached.clone());
        }
        let Some(result) = self.with_dataset(true, |ds| ds.metadata_item(key, domain))? else {
            return Ok(None);
        };
        let mut cache = self.metadata_items.lock();
        Ok(cache.entry(cache_key).or_insert(result).clone())
    }

    /// Ground control points, re-read from the backend on every call (the
    /// backend may rebuild the list).
    pub fn gcps(&self) -> Result<Vec<Gcp>> {
        Ok(self.with_dataset(true, |ds| ds.gcps())?.unwrap_or_default())
    }

    pub fn gcp_spatial_ref(&self) -> Result<Option<SpatialRef>> {
        Ok(self
            .with_dataset(true, |ds| ds.gcp_spatial_ref())?
            .flatten())
    }

    /// Flush the backend handle if it is currently open; never opens a
    /// closed dataset just to flush it.
    pub fn flush_cache(&self) -> Result<()> {
        match self.acquire(false)? {
            Some(guard) => guard.flush_cache().map_err(|source| PoolError::Backend {
                descriptor: self.descriptor.clone(),
                source,
            }),
            None => Ok(()),
        }
    }

    /// The raw backend handle. The pool may evict and close it at any point
    /// after this call returns; use at your own risk.
    pub fn internal_handle(&self) -> Result<Option<Arc<dyn PooledDataset>>> {
        warn!(
            descriptor = %self.descriptor,
            "internal_handle() cannot be safely called on a proxy dataset; \
             the returned handle may be invalidated at any time"
        );
        Ok(self.acquire(true)?.map(|guard| Arc::clone(guard.dataset())))
    }
}

impl Drop for ProxyDataset {
    fn drop(&mut self) {
        self.pool
            .close_if_idle(&self.descriptor, &self.options, self.owner.as_deref());
        self.pool.unref();
    }
}
