// src/backend.rs
use std::sync::Arc;

use crate::types::{Access, ColorTable, DataType, Gcp, GeoTransform, SpatialRef};

/// The primitive that materializes dataset handles for the pool.
///
/// `open` runs with the pool lock released, so an implementation is free to
/// construct further proxy datasets (and thereby re-enter the pool) while it
/// resolves auxiliary inputs. `close` is invoked while the responsible thread
/// id recorded at open time is installed on the current thread, so an
/// implementation keying thread-local state off that id sees the same
/// identity on both sides.
pub trait DatasetOpener: Send + Sync {
    fn open(
        &self,
        descriptor: &str,
        options: &[String],
        access: Access,
    ) -> anyhow::Result<Arc<dyn PooledDataset>>;

    /// Dispose of a handle the pool is done with. The default drops it.
    fn close(&self, dataset: Arc<dyn PooledDataset>) {
        drop(dataset);
    }
}

/// Read surface of an open dataset handle.
///
/// Band indices are 1-based. `estimated_ram_usage` may report 0, meaning the
/// backend cannot estimate; such handles do not participate in the pool's RAM
/// accounting.
pub trait PooledDataset: Send + Sync {
    fn raster_size(&self) -> (usize, usize);

    fn band_count(&self) -> usize;

    fn band(&self, index: usize) -> Option<&dyn PooledBand>;

    fn projection(&self) -> Option<SpatialRef> {
        None
    }

    fn geo_transform(&self) -> Option<GeoTransform> {
        None
    }

    /// All `KEY=VALUE` entries of one metadata domain, or `None` when the
    /// domain is absent. The empty string names the default domain.
    fn metadata_domain(&self, _domain: &str) -> Option<Vec<String>> {
        None
    }

    fn metadata_item(&self, _key: &str, _domain: &str) -> Option<String> {
        None
    }

    fn gcps(&self) -> Vec<Gcp> {
        Vec::new()
    }

    fn gcp_spatial_ref(&self) -> Option<SpatialRef> {
        None
    }

    /// Bytes of RAM the open handle is expected to consume; 0 when the
    /// backend cannot tell.
    fn estimated_ram_usage(&self) -> u64 {
        0
    }

    fn flush_cache(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Read surface of one band of an open dataset handle.
pub trait PooledBand: Send + Sync {
    fn band_type(&self) -> DataType;

    fn size(&self) -> (usize, usize);

    fn block_size(&self) -> (usize, usize);

    /// Read a window of pixels, upcast to `f64`, in row-major order.
    fn read_window(
        &self,
        window: (isize, isize),
        window_size: (usize, usize),
    ) -> anyhow::Result<Vec<f64>>;

    fn no_data_value(&self) -> Option<f64> {
        None
    }

    fn description(&self) -> String {
        String::new()
    }

    fn metadata_domain(&self, _domain: &str) -> Option<Vec<String>> {
        None
    }

    fn metadata_item(&self, _key: &str, _domain: &str) -> Option<String> {
        None
    }

    fn category_names(&self) -> Option<Vec<String>> {
        None
    }

    fn color_table(&self) -> Option<ColorTable> {
        None
    }

    fn unit(&self) -> String {
        String::new()
    }

    fn overview_count(&self) -> usize {
        0
    }

    fn overview(&self, _index: usize) -> Option<&dyn PooledBand> {
        None
    }

    fn mask_band(&self) -> Option<&dyn PooledBand> {
        None
    }

    /// Validity-mask flags; `0x01` (all valid) by default.
    fn mask_flags(&self) -> u32 {
        0x01
    }

    fn flush_cache(&self) -> anyhow::Result<()> {
        Ok(())
    }
}
