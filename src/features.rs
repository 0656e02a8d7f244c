// src/features.rs
//
// Fixed-schema engineered feature vector, recomputed from the whole session
// window on every ingest. Field names and order are the serving/training
// contract: model artifacts must declare exactly this list or fail to load.
// Window-global features (entropy, route deviation) make incremental
// maintenance not worth it over a capped window.

use chrono::{Datelike, Timelike};

use crate::geo::haversine_km;
use crate::hotspot::HotspotIndex;
use crate::state::window::TrackPoint;

/// Canonical feature order. Must stay in lockstep with
/// [`FeatureVector::as_array`].
pub const FIELD_NAMES: [&str; 13] = [
    "avg_speed",
    "max_speed",
    "std_speed",
    "total_distance",
    "route_deviation_ratio",
    "isolated_stops",
    "night_fraction",
    "location_entropy",
    "hour",
    "day_of_week",
    "time_since_last",
    "crime_rate_local",
    "event_density_local",
];

/// Stop detection: consecutive pair closer than this ...
const STOP_DISTANCE_KM: f64 = 0.2;
/// ... dwelling longer than this.
const STOP_DWELL_SECS: i64 = 300;

/// Guard against division by zero for coincident first/last points.
const ROUTE_EPSILON: f64 = 1e-6;

#[derive(Debug, Clone, Default, PartialEq, serde::Serialize)]
pub struct FeatureVector {
    /// km/h over consecutive pairs with positive elapsed time.
    pub avg_speed: f64,
    pub max_speed: f64,
    pub std_speed: f64,
    /// Sum of consecutive great-circle distances, km.
    pub total_distance: f64,
    /// total_distance / (straight-line first→last + epsilon).
    pub route_deviation_ratio: f64,
    /// Consecutive segments under 0.2 km lasting over 300 s.
    pub isolated_stops: u32,
    /// Fraction of samples with local hour <6 or >22.
    pub night_fraction: f64,
    /// Shannon entropy (natural log) over ~110 m cells.
    pub location_entropy: f64,
    /// From the most recent sample.
    pub hour: u32,
    /// Monday = 0, from the most recent sample.
    pub day_of_week: u32,
    /// Minutes between the two most recent samples; 0 with fewer than 2.
    pub time_since_last: f64,
    /// Mean hotspot severity over the newest <=10 samples.
    pub crime_rate_local: f64,
    /// Mean log1p(report count) over the newest <=10 samples.
    pub event_density_local: f64,
}

impl FeatureVector {
    /// Values in [`FIELD_NAMES`] order, as fed to the model capabilities.
    pub fn as_array(&self) -> [f64; 13] {
        [
            self.avg_speed,
            self.max_speed,
            self.std_speed,
            self.total_distance,
            self.route_deviation_ratio,
            self.isolated_stops as f64,
            self.night_fraction,
            self.location_entropy,
            self.hour as f64,
            self.day_of_week as f64,
            self.time_since_last,
            self.crime_rate_local,
            self.event_density_local,
        ]
    }
}

/// Compute the full vector from a window snapshot. Points are re-sorted by
/// timestamp so late-arriving samples cannot produce negative speeds.
pub fn compute(
    points: &[TrackPoint],
    hotspot: Option<&HotspotIndex>,
    radius_cells: i64,
) -> FeatureVector {
    let mut features = FeatureVector::default();
    if points.is_empty() {
        return features;
    }

    let mut pts = points.to_vec();
    pts.sort_by_key(|p| p.timestamp);

    let newest = pts[pts.len() - 1];
    features.hour = newest.timestamp.hour();
    features.day_of_week = newest.timestamp.weekday().num_days_from_monday();

    // Kinematics over consecutive pairs.
    let mut speeds: Vec<f64> = Vec::new();
    let mut total_distance = 0.0;
    for pair in pts.windows(2) {
        let dist = haversine_km(pair[0].lat, pair[0].lon, pair[1].lat, pair[1].lon);
        total_distance += dist;
        let dt_secs = (pair[1].timestamp - pair[0].timestamp).num_seconds();
        if dt_secs > 0 {
            speeds.push(dist / (dt_secs as f64 / 3600.0));
        }
    }
    features.total_distance = total_distance;
    if !speeds.is_empty() {
        let mean = speeds.iter().sum::<f64>() / speeds.len() as f64;
        let var = speeds.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / speeds.len() as f64;
        features.avg_speed = mean;
        features.max_speed = speeds.iter().cloned().fold(0.0, f64::max);
        features.std_speed = var.sqrt();
    }

    if pts.len() >= 2 {
        let first = pts[0];
        let straight = haversine_km(first.lat, first.lon, newest.lat, newest.lon);
        features.route_deviation_ratio = total_distance / (straight + ROUTE_EPSILON);

        let gap_secs = (newest.timestamp - pts[pts.len() - 2].timestamp).num_seconds();
        features.time_since_last = (gap_secs as f64 / 60.0).max(0.0);
    }

    features.isolated_stops = pts
        .windows(2)
        .filter(|pair| {
            let dist = haversine_km(pair[0].lat, pair[0].lon, pair[1].lat, pair[1].lon);
            let dt = (pair[1].timestamp - pair[0].timestamp).num_seconds();
            dist < STOP_DISTANCE_KM && dt > STOP_DWELL_SECS
        })
        .count() as u32;

    let night = pts
        .iter()
        .filter(|p| p.timestamp.hour() < 6 || p.timestamp.hour() > 22)
        .count();
    features.night_fraction = night as f64 / pts.len() as f64;

    features.location_entropy = location_entropy(&pts);

    if let Some(index) = hotspot {
        let tail = &pts[pts.len().saturating_sub(10)..];
        let mut severity_sum = 0.0;
        let mut density_sum = 0.0;
        for p in tail {
            let (severity, count) = index.query(p.lat, p.lon, radius_cells);
            severity_sum += severity;
            density_sum += (count as f64).ln_1p();
        }
        features.crime_rate_local = severity_sum / tail.len() as f64;
        features.event_density_local = density_sum / tail.len() as f64;
    }

    features
}

/// Shannon entropy (natural log) of the empirical distribution of samples
/// rounded to 3 decimal degrees.
fn location_entropy(points: &[TrackPoint]) -> f64 {
    use std::collections::HashMap;
    let mut counts: HashMap<(i64, i64), usize> = HashMap::new();
    for p in points {
        let key = ((p.lat * 1000.0).round() as i64, (p.lon * 1000.0).round() as i64);
        *counts.entry(key).or_default() += 1;
    }
    let n = points.len() as f64;
    counts
        .values()
        .map(|&c| {
            let prob = c as f64 / n;
            -prob * prob.ln()
        })
        .sum()
}
