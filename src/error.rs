// src/error.rs
use thiserror::Error;

/// Errors surfaced by the dataset pool and the proxy objects built on it.
#[derive(Debug, Error)]
pub enum PoolError {
    /// The backend opener failed to materialize a dataset handle. The slot
    /// reserved for the attempt has been returned to the pool.
    #[error("failed to open dataset '{descriptor}'")]
    OpenFailed {
        descriptor: String,
        #[source]
        source: anyhow::Error,
    },

    /// Every cache entry is pinned and the pool is at capacity. Too many
    /// threads are running for the current pool size, or too many proxy
    /// datasets are opened in a cascaded way.
    #[error(
        "dataset pool exhausted: all {max_size} entries are referenced; \
         try increasing RASTER_POOL_MAX_SIZE"
    )]
    Exhausted { max_size: usize },

    /// The proxy references a band index the dataset does not have.
    #[error("band index {band} out of range (dataset has {count} bands)")]
    BandOutOfRange { band: usize, count: usize },

    /// A forwarded operation failed inside the backend handle.
    #[error("backend operation failed on '{descriptor}'")]
    Backend {
        descriptor: String,
        #[source]
        source: anyhow::Error,
    },
}

pub type Result<T> = std::result::Result<T, PoolError>;
