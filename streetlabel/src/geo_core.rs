use anyhow::Result;
use serde::{Deserialize, Serialize};

/// Bounding box in WGS84 degrees (EPSG:4326)
/// Axis order follows Overpass QL: south, west, north, east
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub south: f64, // min latitude
    pub west: f64,  // min longitude
    pub north: f64, // max latitude
    pub east: f64,  // max longitude
}

impl BoundingBox {
    pub fn new(south: f64, west: f64, north: f64, east: f64) -> Self {
        BoundingBox {
            south,
            west,
            north,
            east,
        }
    }

    /// Check the box is well formed (ordered, inside WGS84 bounds)
    pub fn validate(&self) -> Result<()> {
        let values = [self.south, self.west, self.north, self.east];
        if values.iter().any(|v| !v.is_finite()) {
            anyhow::bail!("Bounding box contains a non-finite coordinate: {:?}", self);
        }
        if !(-90.0..=90.0).contains(&self.south) || !(-90.0..=90.0).contains(&self.north) {
            anyhow::bail!("Latitude out of range in bounding box: {:?}", self);
        }
        if !(-180.0..=180.0).contains(&self.west) || !(-180.0..=180.0).contains(&self.east) {
            anyhow::bail!("Longitude out of range in bounding box: {:?}", self);
        }
        if self.south > self.north {
            anyhow::bail!(
                "South ({}) must not be greater than north ({})",
                self.south,
                self.north
            );
        }
        if self.west > self.east {
            anyhow::bail!(
                "West ({}) must not be greater than east ({})",
                self.west,
                self.east
            );
        }
        Ok(())
    }

    /// Overpass QL bbox filter: `south,west,north,east`
    pub fn to_overpass_filter(&self) -> String {
        format!("{},{},{},{}", self.south, self.west, self.north, self.east)
    }

    /// Fragment used in output file names, e.g. `40.7_-74.0_40.71_-73.99`
    pub fn file_fragment(&self) -> String {
        // Debug formatting keeps a decimal point on integral values (40.0, not 40)
        format!(
            "{:?}_{:?}_{:?}_{:?}",
            self.south, self.west, self.north, self.east
        )
    }
}
