// src/state/zones.rs
//
// Geofence registry: durable file-loaded zones plus TTL-limited dynamic
// zones, with the periodic expiry sweep.
//
// Locking discipline:
//   - static zones: RwLock<Arc<Vec<_>>> — a reload swaps the Arc, so
//     concurrent readers never observe a half-built set
//   - dynamic zones: RwLock<Vec<_>> shared by upsert (request path) and
//     the sweep (background path); locate reads under the same lock
//
// Membership is contains-or-intersects, so a point exactly on a polygon
// boundary counts as inside.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use geo::{Contains, CoordsIter, Intersects, Point};
use parking_lot::RwLock;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::errors::Error;
use crate::events::{RiskLevel, ZoneMatch};

/// Distance reported when no static zones are loaded.
pub const NO_STATIC_ZONE_KM: f64 = 9999.0;

/// Zone record as it appears in the zones file and in upsert payloads.
#[derive(Debug, Clone, Deserialize)]
pub struct ZoneSpec {
    pub zone_id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub risk_level: RiskLevel,
    pub geojson: geojson::Geometry,
}

#[derive(Debug, Clone)]
struct StaticZone {
    zone_id: String,
    name: String,
    risk_level: RiskLevel,
    geometry: geo::Geometry<f64>,
}

#[derive(Debug, Clone)]
struct DynamicZone {
    zone_id: String,
    name: String,
    risk_level: RiskLevel,
    geometry: geo::Geometry<f64>,
    expires_at: DateTime<Utc>,
}

pub struct GeofenceRegistry {
    static_zones: RwLock<Arc<Vec<StaticZone>>>,
    dynamic_zones: RwLock<Vec<DynamicZone>>,
    sweep_interval: StdDuration,
}

impl GeofenceRegistry {
    pub fn new(sweep_interval: StdDuration) -> Self {
        Self {
            static_zones: RwLock::new(Arc::new(Vec::new())),
            dynamic_zones: RwLock::new(Vec::new()),
            sweep_interval,
        }
    }

    /// Replace the static set. Zones with invalid geometry are skipped with
    /// a warning; the batch never fails as a whole. Returns the number of
    /// zones actually loaded.
    pub fn load_static(&self, specs: Vec<ZoneSpec>) -> usize {
        let mut zones = Vec::with_capacity(specs.len());
        for spec in specs {
            match parse_geometry(&spec.geojson) {
                Ok(geometry) => zones.push(StaticZone {
                    name: spec.name.unwrap_or_else(|| spec.zone_id.clone()),
                    zone_id: spec.zone_id,
                    risk_level: spec.risk_level,
                    geometry,
                }),
                Err(e) => warn!("skipping invalid zone {}: {e}", spec.zone_id),
            }
        }
        let loaded = zones.len();
        *self.static_zones.write() = Arc::new(zones);
        info!(zones = loaded, "static zone set replaced");
        loaded
    }

    /// Load (or reload) the static set from a JSON zones file.
    pub fn load_static_file(&self, path: &std::path::Path) -> Result<usize, Error> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::Data(format!("zones read {}: {e}", path.display())))?;
        let specs: Vec<ZoneSpec> = serde_json::from_str(&raw)
            .map_err(|e| Error::Data(format!("zones parse {}: {e}", path.display())))?;
        Ok(self.load_static(specs))
    }

    /// Insert or replace a dynamic zone with `expires_at = now + ttl`.
    /// Replacing keeps the zone's original position in the lookup order.
    pub fn upsert_dynamic(
        &self,
        spec: ZoneSpec,
        ttl_seconds: i64,
    ) -> Result<DateTime<Utc>, Error> {
        let geometry = parse_geometry(&spec.geojson)?;
        let expires_at = Utc::now() + Duration::seconds(ttl_seconds);
        let zone = DynamicZone {
            name: spec.name.unwrap_or_else(|| spec.zone_id.clone()),
            zone_id: spec.zone_id,
            risk_level: spec.risk_level,
            geometry,
            expires_at,
        };

        let mut dynamic = self.dynamic_zones.write();
        match dynamic.iter_mut().find(|z| z.zone_id == zone.zone_id) {
            Some(existing) => *existing = zone,
            None => dynamic.push(zone),
        }
        Ok(expires_at)
    }

    /// First matching zone: dynamic zones first (insertion order), then
    /// static zones (file order). Boundary points count as inside.
    pub fn locate(&self, lat: f64, lon: f64) -> Option<ZoneMatch> {
        let point = Point::new(lon, lat);

        for zone in self.dynamic_zones.read().iter() {
            if contains_or_touches(&zone.geometry, point) {
                return Some(ZoneMatch {
                    zone_id: zone.zone_id.clone(),
                    name: zone.name.clone(),
                    risk_level: zone.risk_level,
                    dynamic: true,
                });
            }
        }

        let static_zones = Arc::clone(&self.static_zones.read());
        for zone in static_zones.iter() {
            if contains_or_touches(&zone.geometry, point) {
                return Some(ZoneMatch {
                    zone_id: zone.zone_id.clone(),
                    name: zone.name.clone(),
                    risk_level: zone.risk_level,
                    dynamic: false,
                });
            }
        }
        None
    }

    /// Remove every dynamic zone whose TTL has elapsed. Returns how many
    /// were dropped.
    pub fn sweep_expired(&self, now: DateTime<Utc>) -> usize {
        let mut dynamic = self.dynamic_zones.write();
        let before = dynamic.len();
        dynamic.retain(|z| z.expires_at > now);
        let removed = before - dynamic.len();
        if removed > 0 {
            debug!(removed, "expired dynamic zones removed");
        }
        removed
    }

    /// Fixed-cadence expiry sweep. Runs until process shutdown.
    pub async fn sweep_loop(self: Arc<Self>) {
        loop {
            tokio::time::sleep(self.sweep_interval).await;
            let removed = self.sweep_expired(Utc::now());
            if removed > 0 {
                info!(removed, "dynamic zone sweep");
            }
        }
    }

    /// Minimum great-circle distance from the point to any vertex of any
    /// static zone (vertex approximation, not true edge distance).
    pub fn nearest_static_distance_km(&self, lat: f64, lon: f64) -> f64 {
        let static_zones = Arc::clone(&self.static_zones.read());
        if static_zones.is_empty() {
            return NO_STATIC_ZONE_KM;
        }
        let mut min_km = NO_STATIC_ZONE_KM;
        for zone in static_zones.iter() {
            for coord in zone.geometry.coords_iter() {
                let d = crate::geo::haversine_km(lat, lon, coord.y, coord.x);
                if d < min_km {
                    min_km = d;
                }
            }
        }
        min_km
    }

    pub fn n_static(&self) -> usize {
        self.static_zones.read().len()
    }

    pub fn n_dynamic(&self) -> usize {
        self.dynamic_zones.read().len()
    }
}

fn contains_or_touches(geometry: &geo::Geometry<f64>, point: Point<f64>) -> bool {
    geometry.contains(&point) || geometry.intersects(&point)
}

fn parse_geometry(geometry: &geojson::Geometry) -> Result<geo::Geometry<f64>, Error> {
    let parsed = geo::Geometry::<f64>::try_from(geometry)
        .map_err(|e| Error::Data(format!("invalid geometry: {e}")))?;
    match parsed {
        geo::Geometry::Polygon(_) | geo::Geometry::MultiPolygon(_) => Ok(parsed),
        _ => Err(Error::Data("zone geometry must be Polygon or MultiPolygon".into())),
    }
}
