// tests/common/mod.rs
#![allow(dead_code)]
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use raster_pool::pool::thread_id;
use raster_pool::{
    Access, DataType, DatasetOpener, Gcp, GeoTransform, PooledBand, PooledDataset, SpatialRef,
};

/// Scripted behavior for one descriptor of the mock backend.
#[derive(Debug, Clone)]
pub struct DatasetSpec {
    pub size: (usize, usize),
    pub band_count: usize,
    pub band_type: DataType,
    pub block_size: (usize, usize),
    pub ram: u64,
    pub fail: bool,
    pub overview_count: usize,
    pub gcp_count: usize,
    pub projection: Option<String>,
    pub geo_transform: Option<GeoTransform>,
}

impl Default for DatasetSpec {
    fn default() -> Self {
        Self {
            size: (16, 16),
            band_count: 1,
            band_type: DataType::Float32,
            block_size: (8, 8),
            ram: 0,
            fail: false,
            overview_count: 2,
            gcp_count: 0,
            projection: Some("LOCAL_CS[\"mock\"]".to_string()),
            geo_transform: Some([0.0, 1.0, 0.0, 0.0, 0.0, -1.0]),
        }
    }
}

type OpenHook = Arc<dyn Fn(&str) + Send + Sync>;

/// Mock backend recording every open and close together with the responsible
/// thread id observed at the time of the call. Datasets report a generation
/// counter in their metadata so tests can tell a reopened handle from the
/// original one.
pub struct MockOpener {
    specs: Mutex<HashMap<String, DatasetSpec>>,
    opens: Mutex<Vec<(String, u64)>>,
    closes: Arc<Mutex<Vec<(String, u64)>>>,
    open_counts: Mutex<HashMap<String, usize>>,
    hook: Mutex<Option<OpenHook>>,
}

impl MockOpener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            specs: Mutex::new(HashMap::new()),
            opens: Mutex::new(Vec::new()),
            closes: Arc::new(Mutex::new(Vec::new())),
            open_counts: Mutex::new(HashMap::new()),
            hook: Mutex::new(None),
        })
    }

    /// Script `descriptor` to behave per `spec`; unscripted descriptors get
    /// the default spec.
    pub fn script(&self, descriptor: &str, spec: DatasetSpec) {
        self.specs.lock().insert(descriptor.to_string(), spec);
    }

    /// Run `hook` inside every subsequent open, before the handle is built.
    /// The hook may re-enter the pool.
    pub fn set_open_hook(&self, hook: impl Fn(&str) + Send + Sync + 'static) {
        *self.hook.lock() = Some(Arc::new(hook));
    }

    pub fn opens_of(&self, descriptor: &str) -> usize {
        self.opens
            .lock()
            .iter()
            .filter(|(d, _)| d == descriptor)
            .count()
    }

    pub fn closes_of(&self, descriptor: &str) -> usize {
        self.closes
            .lock()
            .iter()
            .filter(|(d, _)| d == descriptor)
            .count()
    }

    /// `(descriptor, responsible id)` pairs in open order.
    pub fn opens(&self) -> Vec<(String, u64)> {
        self.opens.lock().clone()
    }

    /// `(descriptor, responsible id)` pairs in close order.
    pub fn closes(&self) -> Vec<(String, u64)> {
        self.closes.lock().clone()
    }
}

impl DatasetOpener for MockOpener {
    fn open(
        &self,
        descriptor: &str,
        _options: &[String],
        _access: Access,
    ) -> anyhow::Result<Arc<dyn PooledDataset>> {
        let spec = self
            .specs
            .lock()
            .get(descriptor)
            .cloned()
            .unwrap_or_default();
        self.opens
            .lock()
            .push((descriptor.to_string(), thread_id::responsible_thread_id()));

        let hook = self.hook.lock().clone();
        if let Some(hook) = hook {
            hook(descriptor);
        }

        if spec.fail {
            anyhow::bail!("scripted open failure for '{descriptor}'");
        }

        let generation = {
            let mut counts = self.open_counts.lock();
            let count = counts.entry(descriptor.to_string()).or_insert(0);
            *count += 1;
            *count
        };
        Ok(Arc::new(MockDataset::build(
            descriptor,
            spec,
            generation,
            Arc::clone(&self.closes),
        )))
    }
}

pub struct MockDataset {
    descriptor: String,
    spec: DatasetSpec,
    generation: usize,
    bands: Vec<MockBand>,
    closes: Arc<Mutex<Vec<(String, u64)>>>,
}

impl MockDataset {
    fn build(
        descriptor: &str,
        spec: DatasetSpec,
        generation: usize,
        closes: Arc<Mutex<Vec<(String, u64)>>>,
    ) -> Self {
        let bands = (1..=spec.band_count)
            .map(|number| MockBand::build(&spec, number))
            .collect();
        Self {
            descriptor: descriptor.to_string(),
            spec,
            generation,
            bands,
            closes,
        }
    }
}

impl Drop for MockDataset {
    fn drop(&mut self) {
        // The pool closes handles with the opener thread's identity
        // installed, so the id recorded here is the one the close ran under.
        self.closes
            .lock()
            .push((self.descriptor.clone(), thread_id::responsible_thread_id()));
    }
}

impl PooledDataset for MockDataset {
    fn raster_size(&self) -> (usize, usize) {
        self.spec.size
    }

    fn band_count(&self) -> usize {
        self.bands.len()
    }

    fn band(&self, index: usize) -> Option<&dyn PooledBand> {
        index
            .checked_sub(1)
            .and_then(|i| self.bands.get(i))
            .map(|b| b as &dyn PooledBand)
    }

    fn projection(&self) -> Option<SpatialRef> {
        self.spec.projection.as_deref().map(SpatialRef::from_wkt)
    }

    fn geo_transform(&self) -> Option<GeoTransform> {
        self.spec.geo_transform
    }

    fn metadata_domain(&self, domain: &str) -> Option<Vec<String>> {
        match domain {
            "" => Some(vec![format!("GENERATION=gen-{}", self.generation)]),
            _ => None,
        }
    }

    fn metadata_item(&self, key: &str, domain: &str) -> Option<String> {
        match (key, domain) {
            ("GENERATION", "") => Some(format!("gen-{}", self.generation)),
            _ => None,
        }
    }

    fn gcps(&self) -> Vec<Gcp> {
        (0..self.spec.gcp_count)
            .map(|i| Gcp {
                id: format!("gcp{i}"),
                info: format!("gen-{}", self.generation),
                pixel: i as f64,
                line: i as f64,
                x: i as f64 * 10.0,
                y: i as f64 * 10.0,
                z: 0.0,
            })
            .collect()
    }

    fn gcp_spatial_ref(&self) -> Option<SpatialRef> {
        if self.spec.gcp_count > 0 {
            self.spec.projection.as_deref().map(SpatialRef::from_wkt)
        } else {
            None
        }
    }

    fn estimated_ram_usage(&self) -> u64 {
        self.spec.ram
    }
}

pub struct MockBand {
    number: usize,
    band_type: DataType,
    size: (usize, usize),
    block_size: (usize, usize),
    overviews: Vec<MockBand>,
    mask: Option<Box<MockBand>>,
}

impl MockBand {
    fn build(spec: &DatasetSpec, number: usize) -> Self {
        let overviews = (0..spec.overview_count)
            .map(|level| MockBand {
                number,
                band_type: spec.band_type,
                size: (
                    (spec.size.0 >> (level + 1)).max(1),
                    (spec.size.1 >> (level + 1)).max(1),
                ),
                block_size: spec.block_size,
                overviews: Vec::new(),
                mask: None,
            })
            .collect();
        let mask = Box::new(MockBand {
            number,
            band_type: DataType::UInt8,
            size: spec.size,
            block_size: spec.block_size,
            overviews: Vec::new(),
            mask: None,
        });
        Self {
            number,
            band_type: spec.band_type,
            size: spec.size,
            block_size: spec.block_size,
            overviews,
            mask: Some(mask),
        }
    }
}

impl PooledBand for MockBand {
    fn band_type(&self) -> DataType {
        self.band_type
    }

    fn size(&self) -> (usize, usize) {
        self.size
    }

    fn block_size(&self) -> (usize, usize) {
        self.block_size
    }

    fn read_window(
        &self,
        _window: (isize, isize),
        window_size: (usize, usize),
    ) -> anyhow::Result<Vec<f64>> {
        Ok(vec![self.number as f64; window_size.0 * window_size.1])
    }

    fn description(&self) -> String {
        format!("band {}", self.number)
    }

    fn metadata_item(&self, key: &str, domain: &str) -> Option<String> {
        match (key, domain) {
            ("BAND", "") => Some(self.number.to_string()),
            _ => None,
        }
    }

    fn unit(&self) -> String {
        "dn".to_string()
    }

    fn overview_count(&self) -> usize {
        self.overviews.len()
    }

    fn overview(&self, index: usize) -> Option<&dyn PooledBand> {
        self.overviews.get(index).map(|b| b as &dyn PooledBand)
    }

    fn mask_band(&self) -> Option<&dyn PooledBand> {
        self.mask.as_deref().map(|b| b as &dyn PooledBand)
    }
}

/// The mock as the trait object the pool consumes.
pub fn opener_of(mock: &Arc<MockOpener>) -> Arc<dyn DatasetOpener> {
    Arc::clone(mock) as Arc<dyn DatasetOpener>
}
