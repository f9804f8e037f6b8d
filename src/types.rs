// src/types.rs
use std::fmt;

/// Access mode requested when a dataset handle is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Access {
    #[default]
    ReadOnly,
    Update,
}

/// Pixel data type of a raster band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DataType {
    #[default]
    Unknown,
    UInt8,
    UInt16,
    Int16,
    UInt32,
    Int32,
    Float32,
    Float64,
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DataType::Unknown => "Unknown",
            DataType::UInt8 => "UInt8",
            DataType::UInt16 => "UInt16",
            DataType::Int16 => "Int16",
            DataType::UInt32 => "UInt32",
            DataType::Int32 => "Int32",
            DataType::Float32 => "Float32",
            DataType::Float64 => "Float64",
        };
        f.write_str(name)
    }
}

/// Affine transform mapping pixel/line coordinates to georeferenced
/// coordinates, in the usual six-coefficient layout.
pub type GeoTransform = [f64; 6];

/// A coordinate reference system carried as its WKT representation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpatialRef(String);

impl SpatialRef {
    pub fn from_wkt(wkt: impl Into<String>) -> Self {
        Self(wkt.into())
    }

    pub fn wkt(&self) -> &str {
        &self.0
    }
}

/// One entry of a band color table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColorEntry {
    pub c1: i16,
    pub c2: i16,
    pub c3: i16,
    pub c4: i16,
}

/// Color table attached to a raster band.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ColorTable {
    pub entries: Vec<ColorEntry>,
}

/// A ground control point tying a pixel/line location to a georeferenced
/// position.
#[derive(Debug, Clone, PartialEq)]
pub struct Gcp {
    pub id: String,
    pub info: String,
    pub pixel: f64,
    pub line: f64,
    pub x: f64,
    pub y: f64,
    pub z: f64,
}
