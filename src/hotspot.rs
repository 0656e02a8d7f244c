// src/hotspot.rs
//
// Grid-aggregated incident severity/density index. Built once from raw
// reports (or restored from a JSON snapshot), then read-only — a reload is
// published by swapping the Arc that owns it, never by mutating in place.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::errors::Error;

pub const DEFAULT_GRID_SIZE: f64 = 0.02; // ~2.2 km at the equator
pub const DEFAULT_RADIUS_CELLS: i64 = 1; // centre cell plus immediate neighbours

/// Raw incident report consumed at index build time.
#[derive(Debug, Clone, Deserialize)]
pub struct IncidentReport {
    pub lat: f64,
    pub lon: f64,
    /// Severity in [0,1].
    pub severity: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct HotspotCell {
    pub count: u64,
    pub severity_sum: f64,
    pub max_severity: f64,
}

#[derive(Debug, Clone)]
pub struct HotspotIndex {
    grid_size: f64,
    scale: i64,
    cells: HashMap<(i64, i64), HotspotCell>,
}

fn grid_scale(grid_size: f64) -> i64 {
    ((1.0 / grid_size.max(1e-6)).round() as i64).max(1)
}

impl HotspotIndex {
    pub fn build(reports: &[IncidentReport], grid_size: f64) -> Self {
        let scale = grid_scale(grid_size);
        let mut cells: HashMap<(i64, i64), HotspotCell> = HashMap::new();
        for report in reports {
            let key = cell_indices(report.lat, report.lon, scale);
            let cell = cells.entry(key).or_default();
            cell.count += 1;
            cell.severity_sum += report.severity;
            if report.severity > cell.max_severity {
                cell.max_severity = report.severity;
            }
        }
        Self {
            grid_size,
            scale,
            cells,
        }
    }

    /// Aggregate severity and report count over the (2r+1)² neighbourhood
    /// centred on the point's cell. (0.0, 0) when nothing is in range.
    pub fn query(&self, lat: f64, lon: f64, radius_cells: i64) -> (f64, u64) {
        let (lat_idx, lon_idx) = cell_indices(lat, lon, self.scale);
        let mut total_count = 0u64;
        let mut total_severity = 0.0f64;
        for dlat in -radius_cells..=radius_cells {
            for dlon in -radius_cells..=radius_cells {
                if let Some(cell) = self.cells.get(&(lat_idx + dlat, lon_idx + dlon)) {
                    if cell.count == 0 {
                        continue;
                    }
                    total_count += cell.count;
                    total_severity += cell.severity_sum;
                }
            }
        }
        if total_count == 0 {
            return (0.0, 0);
        }
        (total_severity / total_count as f64, total_count)
    }

    pub fn grid_size(&self) -> f64 {
        self.grid_size
    }

    pub fn n_cells(&self) -> usize {
        self.cells.len()
    }

    // ── Snapshot persistence ──────────────────────────────────────────────────
    // Same JSON shape as the original artifact: cells keyed "lat|lon".

    pub fn save(&self, path: &Path) -> Result<(), Error> {
        let snapshot = Snapshot {
            grid_size: self.grid_size,
            scale: self.scale,
            cells: self
                .cells
                .iter()
                .map(|(&(lat_idx, lon_idx), cell)| {
                    (
                        format!("{lat_idx}|{lon_idx}"),
                        SnapshotCell {
                            lat_idx,
                            lon_idx,
                            count: cell.count,
                            severity_sum: cell.severity_sum,
                            max_severity: cell.max_severity,
                        },
                    )
                })
                .collect(),
        };
        let raw = serde_json::to_string_pretty(&snapshot)
            .map_err(|e| Error::Data(format!("hotspot snapshot encode: {e}")))?;
        std::fs::write(path, raw)
            .map_err(|e| Error::Data(format!("hotspot snapshot write {}: {e}", path.display())))?;
        info!(cells = self.cells.len(), "saved hotspot index to {}", path.display());
        Ok(())
    }

    /// Restore a snapshot. `Ok(None)` when the path does not exist.
    pub fn load(path: &Path) -> Result<Option<Self>, Error> {
        if !path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::Data(format!("hotspot snapshot read {}: {e}", path.display())))?;
        let snapshot: Snapshot = serde_json::from_str(&raw)
            .map_err(|e| Error::Data(format!("hotspot snapshot parse {}: {e}", path.display())))?;
        let cells = snapshot
            .cells
            .into_values()
            .map(|c| {
                (
                    (c.lat_idx, c.lon_idx),
                    HotspotCell {
                        count: c.count,
                        severity_sum: c.severity_sum,
                        max_severity: c.max_severity,
                    },
                )
            })
            .collect();
        Ok(Some(Self {
            grid_size: snapshot.grid_size,
            scale: snapshot.scale,
            cells,
        }))
    }
}

fn cell_indices(lat: f64, lon: f64, scale: i64) -> (i64, i64) {
    (
        (lat * scale as f64).round() as i64,
        (lon * scale as f64).round() as i64,
    )
}

/// Read a JSON array of raw reports (index build input).
pub fn load_reports(path: &Path) -> Result<Vec<IncidentReport>, Error> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| Error::Data(format!("reports read {}: {e}", path.display())))?;
    serde_json::from_str(&raw).map_err(|e| Error::Data(format!("reports parse {}: {e}", path.display())))
}

#[derive(Serialize, Deserialize)]
struct Snapshot {
    grid_size: f64,
    scale: i64,
    cells: HashMap<String, SnapshotCell>,
}

#[derive(Serialize, Deserialize)]
struct SnapshotCell {
    lat_idx: i64,
    lon_idx: i64,
    count: u64,
    severity_sum: f64,
    max_severity: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reports() -> Vec<IncidentReport> {
        vec![
            IncidentReport { lat: 12.97, lon: 77.59, severity: 0.8 },
            IncidentReport { lat: 12.97, lon: 77.59, severity: 0.4 },
            IncidentReport { lat: 12.99, lon: 77.61, severity: 0.6 },
        ]
    }

    #[test]
    fn empty_index_answers_zero() {
        let index = HotspotIndex::build(&[], DEFAULT_GRID_SIZE);
        assert_eq!(index.query(12.97, 77.59, DEFAULT_RADIUS_CELLS), (0.0, 0));
    }

    #[test]
    fn accumulates_count_and_severity_per_cell() {
        let index = HotspotIndex::build(&reports(), DEFAULT_GRID_SIZE);
        let (avg, count) = index.query(12.97, 77.59, 0);
        assert_eq!(count, 2);
        assert!((avg - 0.6).abs() < 1e-9);
    }

    #[test]
    fn neighbourhood_query_aggregates_adjacent_cells() {
        let index = HotspotIndex::build(&reports(), DEFAULT_GRID_SIZE);
        let (avg, count) = index.query(12.97, 77.59, 1);
        assert_eq!(count, 3);
        assert!((avg - (0.8 + 0.4 + 0.6) / 3.0).abs() < 1e-9);
    }

    #[test]
    fn far_away_point_sees_nothing() {
        let index = HotspotIndex::build(&reports(), DEFAULT_GRID_SIZE);
        assert_eq!(index.query(-33.86, 151.2, 1), (0.0, 0));
    }

    #[test]
    fn snapshot_round_trip_preserves_queries() {
        let dir = std::env::temp_dir().join("georisk_hotspot_test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("hotspot_index.json");

        let index = HotspotIndex::build(&reports(), DEFAULT_GRID_SIZE);
        index.save(&path).unwrap();
        let restored = HotspotIndex::load(&path).unwrap().unwrap();

        for &(lat, lon) in &[(12.97, 77.59), (12.99, 77.61), (0.0, 0.0)] {
            assert_eq!(index.query(lat, lon, 1), restored.query(lat, lon, 1));
        }
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn load_of_missing_path_is_none() {
        let missing = std::env::temp_dir().join("georisk_no_such_index.json");
        assert!(HotspotIndex::load(&missing).unwrap().is_none());
    }
}
