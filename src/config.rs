// src/config.rs
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use serde::{Deserialize, Deserializer};
use sysinfo::System;

pub const MAX_SIZE_ENV: &str = "RASTER_POOL_MAX_SIZE";
pub const MAX_RAM_USAGE_ENV: &str = "RASTER_POOL_MAX_RAM_USAGE";

/// Hard bounds on the entry-count budget. The lower bound leaves room for one
/// entry for the caller plus one for a reentrant open.
pub const MIN_POOL_SIZE: usize = 2;
pub const MAX_POOL_SIZE: usize = 1000;

/// A byte count that parses from a plain integer or an integer with an `MB`
/// or `GB` suffix. A value of zero disables RAM accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct RamSize(pub u64);

impl RamSize {
    pub const UNLIMITED: RamSize = RamSize(0);

    pub fn bytes(&self) -> u64 {
        self.0
    }

    pub fn is_unlimited(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for RamSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RamSize {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let digits = s
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(s.len());
        let value = s[..digits]
            .parse::<u64>()
            .map_err(|e| format!("invalid RAM size '{s}': {e}"))?;
        match s[digits..].trim() {
            "" => Ok(Self(value)),
            "MB" => Ok(Self(value << 20)),
            "GB" => Ok(Self(value << 30)),
            other => Err(format!("invalid RAM size suffix '{other}' in '{s}'")),
        }
    }
}

impl<'de> Deserialize<'de> for RamSize {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct RamSizeVisitor;

        impl serde::de::Visitor<'_> for RamSizeVisitor {
            type Value = RamSize;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a byte count or a string like \"512MB\" or \"2GB\"")
            }

            fn visit_u64<E: serde::de::Error>(self, v: u64) -> Result<RamSize, E> {
                Ok(RamSize(v))
            }

            fn visit_str<E: serde::de::Error>(self, v: &str) -> Result<RamSize, E> {
                v.parse().map_err(serde::de::Error::custom)
            }
        }

        deserializer.deserialize_any(RamSizeVisitor)
    }
}

/// Budgets for one dataset pool.
#[derive(Debug, Clone, Deserialize)]
pub struct PoolConfig {
    /// Maximum number of cache entries, clamped to
    /// [`MIN_POOL_SIZE`, `MAX_POOL_SIZE`] when the pool is built.
    #[serde(default = "default_max_size")]
    pub max_size: usize,
    /// RAM budget for open handles; zero disables RAM-pressure eviction.
    #[serde(default = "default_max_ram_usage")]
    pub max_ram_usage: RamSize,
}

fn default_max_size() -> usize {
    100
}

fn default_max_ram_usage() -> RamSize {
    // Try to not consume more than 25% of the physical RAM
    static QUARTER_OF_RAM: OnceLock<u64> = OnceLock::new();
    let bytes = *QUARTER_OF_RAM.get_or_init(|| {
        let mut sys = System::new();
        sys.refresh_memory();
        sys.total_memory() / 4
    });
    RamSize(bytes)
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: default_max_size(),
            max_ram_usage: default_max_ram_usage(),
        }
    }
}

impl PoolConfig {
    /// Defaults overridden by the `RASTER_POOL_MAX_SIZE` and
    /// `RASTER_POOL_MAX_RAM_USAGE` environment variables. Unparseable values
    /// fall back to the defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(raw) = std::env::var(MAX_SIZE_ENV) {
            if let Ok(size) = raw.trim().parse::<usize>() {
                config.max_size = size;
            }
        }
        if let Ok(raw) = std::env::var(MAX_RAM_USAGE_ENV) {
            if let Ok(ram) = raw.parse::<RamSize>() {
                config.max_ram_usage = ram;
            }
        }
        config
    }

    pub fn clamped_max_size(&self) -> usize {
        self.max_size.clamp(MIN_POOL_SIZE, MAX_POOL_SIZE)
    }
}
