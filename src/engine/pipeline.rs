// src/engine/pipeline.rs
//
// Orchestration: validate -> window -> features -> fuse -> persist. One
// pipeline instance is shared across every ingest task; all state behind
// it is concurrent, so &self is enough everywhere.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::config::Config;
use crate::engine::fusion::FusionEngine;
use crate::errors::Error;
use crate::events::{FusedResult, Sample, ZoneMatch};
use crate::features;
use crate::hotspot::HotspotIndex;
use crate::model::Capabilities;
use crate::state::groups::GroupTracker;
use crate::state::window::{SessionStore, TrackPoint};
use crate::state::zones::{GeofenceRegistry, ZoneSpec};

pub struct RiskPipeline {
    sessions: SessionStore,
    registry: Arc<GeofenceRegistry>,
    hotspot: Option<Arc<HotspotIndex>>,
    fusion: FusionEngine,
    capabilities: Capabilities,
    config: Config,
}

impl RiskPipeline {
    pub fn new(
        config: Config,
        registry: Arc<GeofenceRegistry>,
        hotspot: Option<Arc<HotspotIndex>>,
        capabilities: Capabilities,
    ) -> Self {
        let groups = Arc::new(GroupTracker::new(config.group_dispersion_km));
        let fusion = FusionEngine::new(
            config.clone(),
            Arc::clone(&registry),
            groups,
            capabilities.clone(),
        );
        Self {
            sessions: SessionStore::new(config.window_capacity),
            registry,
            hotspot,
            fusion,
            capabilities,
            config,
        }
    }

    /// Score one sample. Validation happens before any state mutation, so
    /// a rejected sample leaves every store untouched.
    pub fn ingest_and_score(&self, sample: &Sample) -> Result<FusedResult, Error> {
        validate(sample)?;

        let snapshot = self.sessions.ingest(
            &sample.session_id,
            TrackPoint {
                lat: sample.lat,
                lon: sample.lon,
                timestamp: sample.timestamp,
            },
        );

        let features = features::compute(
            &snapshot.points,
            self.hotspot.as_deref(),
            self.config.hotspot_radius_cells,
        );

        let result = self.fusion.score(
            sample,
            &features,
            snapshot.previous_seen,
            snapshot.points.len(),
        );

        if let Some(sink) = &self.capabilities.sink {
            sink.save(&result, sample);
        }
        Ok(result)
    }

    /// Score a batch in input order. One bad sample fails the whole batch
    /// before it, matching all-or-nothing request semantics.
    pub fn score_batch(&self, samples: &[Sample]) -> Result<Vec<FusedResult>, Error> {
        samples.iter().map(|s| self.ingest_and_score(s)).collect()
    }

    pub fn upsert_zone(&self, spec: ZoneSpec, ttl_seconds: i64) -> Result<DateTime<Utc>, Error> {
        self.registry.upsert_dynamic(spec, ttl_seconds)
    }

    pub fn locate_zone(&self, lat: f64, lon: f64) -> Option<ZoneMatch> {
        self.registry.locate(lat, lon)
    }

    pub fn reload_static_zones(&self, path: &std::path::Path) -> Result<usize, Error> {
        self.registry.load_static_file(path)
    }

    pub fn n_sessions(&self) -> usize {
        self.sessions.n_sessions()
    }

    pub fn total_samples(&self) -> u64 {
        self.sessions.total_samples()
    }
}

fn validate(sample: &Sample) -> Result<(), Error> {
    if !sample.lat.is_finite() || !(-90.0..=90.0).contains(&sample.lat) {
        return Err(Error::Validation(format!(
            "latitude out of range: {}",
            sample.lat
        )));
    }
    if !sample.lon.is_finite() || !(-180.0..=180.0).contains(&sample.lon) {
        return Err(Error::Validation(format!(
            "longitude out of range: {}",
            sample.lon
        )));
    }
    Ok(())
}
