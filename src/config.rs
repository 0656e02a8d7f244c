// src/config.rs
//
// Runtime configuration. Every field has a default so a bare binary runs;
// a JSON file supplied via --config overrides individual fields.
// Validation happens once at startup — a bad config never fails a request.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::errors::Error;

/// Fusion weights. Must sum to exactly 1.0 (validated at startup).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FusionWeights {
    pub ml: f64,
    pub geo: f64,
    pub rules: f64,
    pub open_water: f64,
    pub hotspot: f64,
}

impl Default for FusionWeights {
    fn default() -> Self {
        Self {
            ml: 0.5,
            geo: 0.2,
            rules: 0.15,
            open_water: 0.05,
            hotspot: 0.1,
        }
    }
}

impl FusionWeights {
    pub fn sum(&self) -> f64 {
        self.ml + self.geo + self.rules + self.open_water + self.hotspot
    }
}

/// Axis-aligned lat/lon box used as the likely-inland guard for open-water
/// detection.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BoundingBox {
    pub lat_min: f64,
    pub lat_max: f64,
    pub lon_min: f64,
    pub lon_max: f64,
}

impl BoundingBox {
    pub fn contains(&self, lat: f64, lon: f64) -> bool {
        self.lat_min <= lat && lat <= self.lat_max && self.lon_min <= lon && lon <= self.lon_max
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Capacity of each session's FIFO sample window.
    pub window_capacity: usize,
    /// Hotspot grid resolution in degrees (~2.2 km at the equator by default).
    pub grid_size: f64,
    /// Cell radius of the hotspot neighborhood query.
    pub hotspot_radius_cells: i64,
    pub hotspot_alert_threshold: f64,
    /// Open-water: minimum distance from any static zone, in km.
    pub open_water_distance_km: f64,
    /// Open-water false-positive guard; points inside are never flagged.
    /// Defaults to the India mainland box; customize per deployment.
    pub inland_bbox: Option<BoundingBox>,
    /// Group dispersion threshold in km.
    pub group_dispersion_km: f64,
    /// Inactivity rule threshold in minutes.
    pub inactivity_gap_minutes: f64,
    /// Cadence of the dynamic-zone expiry sweep.
    pub sweep_interval_secs: u64,
    /// Terminal alerts fire at or above this fused risk.
    pub alert_threshold: f64,
    pub weights: FusionWeights,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            window_capacity: 120,
            grid_size: crate::hotspot::DEFAULT_GRID_SIZE,
            hotspot_radius_cells: crate::hotspot::DEFAULT_RADIUS_CELLS,
            hotspot_alert_threshold: 0.6,
            open_water_distance_km: 20.0,
            inland_bbox: Some(BoundingBox {
                lat_min: 6.0,
                lat_max: 38.0,
                lon_min: 68.0,
                lon_max: 98.0,
            }),
            group_dispersion_km: 10.0,
            inactivity_gap_minutes: 10.0,
            sweep_interval_secs: 30,
            alert_threshold: 0.6,
            weights: FusionWeights::default(),
        }
    }
}

impl Config {
    /// Load from an optional JSON file, then validate.
    pub fn load(path: Option<&Path>) -> Result<Self, Error> {
        let config = match path {
            Some(p) => {
                let raw = std::fs::read_to_string(p).map_err(|e| {
                    Error::Configuration(format!("cannot read {}: {e}", p.display()))
                })?;
                serde_json::from_str(&raw).map_err(|e| {
                    Error::Configuration(format!("cannot parse {}: {e}", p.display()))
                })?
            }
            None => Self::default(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), Error> {
        let sum = self.weights.sum();
        if (sum - 1.0).abs() > 1e-9 {
            return Err(Error::Configuration(format!(
                "fusion weights must sum to 1.0, got {sum}"
            )));
        }
        if self.window_capacity < 10 {
            return Err(Error::Configuration(format!(
                "window_capacity must be >= 10, got {}",
                self.window_capacity
            )));
        }
        if !(self.grid_size > 0.0) {
            return Err(Error::Configuration(format!(
                "grid_size must be positive, got {}",
                self.grid_size
            )));
        }
        if self.hotspot_radius_cells < 0 {
            return Err(Error::Configuration(
                "hotspot_radius_cells must be >= 0".into(),
            ));
        }
        if self.sweep_interval_secs == 0 {
            return Err(Error::Configuration(
                "sweep_interval_secs must be positive".into(),
            ));
        }
        Ok(())
    }
}
