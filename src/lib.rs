// src/lib.rs
pub mod backend;
pub mod config;
pub mod error;
pub mod pool;
pub mod proxy;
pub mod types;

pub use backend::{DatasetOpener, PooledBand, PooledDataset};
pub use config::{PoolConfig, RamSize};
pub use error::{PoolError, Result};
pub use pool::{DatasetPool, EntrySnapshot, PoolGuard, PoolStats};
pub use proxy::{ProxyBand, ProxyDataset};
pub use types::{Access, ColorEntry, ColorTable, DataType, Gcp, GeoTransform, SpatialRef};

// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
