// src/engine/fusion.rs
//
// Deterministic weighted fusion of the independent risk signals.
//
// Weight distribution (sum = 1.00, validated at startup):
//   ml          0.50 — logistic anomaly score from the anomaly model
//   geo         0.20 — matched-zone risk weight (high 1.0 / medium 0.6 / low 0.2)
//   rules       0.15 — inactivity OR group dispersion
//   open_water  0.05 — coarse off-shore heuristic
//   hotspot     0.10 — incident-hotspot neighbourhood score
//
// Steps run in a fixed order and each appends at most one reason code, so
// the reason list is deterministic and tests can assert on it.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::config::Config;
use crate::events::{FusedResult, HotspotDetail, ReasonCode, RiskLevel, Sample};
use crate::features::FeatureVector;
use crate::model::Capabilities;
use crate::state::groups::GroupTracker;
use crate::state::zones::GeofenceRegistry;

/// Density scale cap: log1p(15) reports in the neighbourhood saturates the
/// density component.
fn density_scale() -> f64 {
    15.0f64.ln_1p()
}

fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

fn round3(x: f64) -> f64 {
    (x * 1000.0).round() / 1000.0
}

pub struct FusionEngine {
    registry: Arc<GeofenceRegistry>,
    groups: Arc<GroupTracker>,
    capabilities: Capabilities,
    config: Config,
}

impl FusionEngine {
    pub fn new(
        config: Config,
        registry: Arc<GeofenceRegistry>,
        groups: Arc<GroupTracker>,
        capabilities: Capabilities,
    ) -> Self {
        Self {
            registry,
            groups,
            capabilities,
            config,
        }
    }

    /// Fuse every signal for one sample. Never fails: capability errors
    /// degrade the affected signal and the rest of the pipeline proceeds.
    pub fn score(
        &self,
        sample: &Sample,
        features: &FeatureVector,
        previous_seen: Option<DateTime<Utc>>,
        window_len: usize,
    ) -> FusedResult {
        // 1. Anomaly model. Unavailable or failing => neutral zero score.
        let (anomaly_score, decision_score, anomaly_flag) = match &self.capabilities.anomaly {
            Some(model) => match model.score(features) {
                Ok(verdict) => (
                    sigmoid(-verdict.decision_score),
                    verdict.decision_score,
                    verdict.is_anomalous,
                ),
                Err(e) => {
                    warn!("anomaly model failed, degrading: {e}");
                    (0.0, 0.0, false)
                }
            },
            None => (0.0, 0.0, false),
        };

        // 2. Density model. Unknown distance falls back to the anomaly flag.
        let (cluster_distance, cluster_flag) = match &self.capabilities.density {
            Some(model) => match model.nearest_core_distance(features) {
                Ok(Some(distance)) => (Some(distance), distance > model.eps()),
                Ok(None) => (None, anomaly_flag),
                Err(e) => {
                    warn!("density model failed, degrading: {e}");
                    (None, anomaly_flag)
                }
            },
            None => (None, anomaly_flag),
        };

        // 3. Geofence membership.
        let zone = self.registry.locate(sample.lat, sample.lon);
        let geo_weight = zone.as_ref().map(|z| z.risk_level.weight()).unwrap_or(0.0);
        let geo_flag = zone
            .as_ref()
            .map(|z| z.risk_level != RiskLevel::Low)
            .unwrap_or(false);

        // 4. Open water: far from every static zone and outside the
        // likely-inland box.
        let open_water_flag = zone.is_none()
            && self.registry.nearest_static_distance_km(sample.lat, sample.lon)
                > self.config.open_water_distance_km
            && !self
                .config
                .inland_bbox
                .map(|bbox| bbox.contains(sample.lat, sample.lon))
                .unwrap_or(false);

        // 5. Inactivity against the previously recorded timestamp. The
        // window already updated last-seen unconditionally at ingest.
        let inactivity_flag = previous_seen
            .map(|prev| {
                let gap_minutes = (sample.timestamp - prev).num_seconds() as f64 / 60.0;
                gap_minutes > self.config.inactivity_gap_minutes
            })
            .unwrap_or(false);

        // 6. Group dispersion, only when the sample carries a group.
        let group_flag = sample
            .group_id
            .as_deref()
            .map(|group_id| {
                self.groups.observe(
                    group_id,
                    &sample.user_id,
                    sample.lat,
                    sample.lon,
                    sample.timestamp,
                )
            })
            .unwrap_or(false);

        // 7. Hotspot sub-score.
        let crime_rate = features.crime_rate_local;
        let density_log = features.event_density_local;
        let density_scaled = if density_log > 0.0 {
            (density_log / density_scale()).min(1.0)
        } else {
            0.0
        };
        let hotspot_score = (0.7 * crime_rate + 0.3 * density_scaled).min(1.0);
        let hotspot_flag = hotspot_score >= self.config.hotspot_alert_threshold;

        // 8. Weighted fusion.
        let w = &self.config.weights;
        let rules_score = if inactivity_flag || group_flag { 1.0 } else { 0.0 };
        let final_risk = round3(
            (w.ml * anomaly_score
                + w.geo * geo_weight
                + w.rules * rules_score
                + w.open_water * if open_water_flag { 1.0 } else { 0.0 }
                + w.hotspot * hotspot_score)
                .clamp(0.0, 1.0),
        );

        // 9. Reason codes, fixed order.
        let mut reasons = Vec::new();
        if anomaly_flag {
            reasons.push(ReasonCode::MlAnomaly);
        }
        if cluster_flag {
            reasons.push(ReasonCode::ClusterNoise);
        }
        if geo_flag {
            if let Some(z) = &zone {
                reasons.push(ReasonCode::in_zone(z.risk_level));
            }
        }
        if open_water_flag {
            reasons.push(ReasonCode::OpenWater);
        }
        if inactivity_flag {
            reasons.push(ReasonCode::InactivityGt10m);
        }
        if group_flag {
            reasons.push(ReasonCode::GroupDistanceGt10km);
        }
        if hotspot_flag {
            reasons.push(ReasonCode::LocalHotspot);
        }
        if crime_rate >= 0.7 {
            reasons.push(ReasonCode::CrimeHotspotHigh);
        }
        if density_log >= 8.0f64.ln_1p() {
            reasons.push(ReasonCode::EventDensityHigh);
        }

        let factors = self
            .capabilities
            .explainer
            .as_ref()
            .map(|e| e.explain(features))
            .unwrap_or_default();

        FusedResult {
            session_id: sample.session_id.clone(),
            user_id: sample.user_id.clone(),
            group_id: sample.group_id.clone(),
            lat: sample.lat,
            lon: sample.lon,
            timestamp: sample.timestamp,
            anomaly_score,
            decision_score,
            cluster_distance,
            final_risk,
            reasons,
            factors,
            zone,
            anomaly_flag,
            cluster_flag,
            geo_flag,
            open_water_flag,
            inactivity_flag,
            group_flag,
            hotspot_flag,
            hotspot: HotspotDetail {
                score: hotspot_score,
                crime_rate,
                density_log,
                threshold: self.config.hotspot_alert_threshold,
            },
            window_len,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::Error;
    use crate::events::RiskLevel;
    use crate::model::{AnomalyModel, AnomalyVerdict, DensityModel};
    use crate::state::zones::ZoneSpec;
    use chrono::{Duration, TimeZone};
    use std::time::Duration as StdDuration;

    struct StubAnomaly {
        decision_score: f64,
        is_anomalous: bool,
        fail: bool,
    }

    impl AnomalyModel for StubAnomaly {
        fn score(&self, _features: &FeatureVector) -> Result<AnomalyVerdict, Error> {
            if self.fail {
                return Err(Error::Capability("stub down".into()));
            }
            Ok(AnomalyVerdict {
                decision_score: self.decision_score,
                is_anomalous: self.is_anomalous,
            })
        }
    }

    struct StubDensity {
        distance: Option<f64>,
        eps: f64,
    }

    impl DensityModel for StubDensity {
        fn nearest_core_distance(&self, _f: &FeatureVector) -> Result<Option<f64>, Error> {
            Ok(self.distance)
        }
        fn eps(&self) -> f64 {
            self.eps
        }
    }

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 9, 7, 10, 0, 0).unwrap()
    }

    fn sample(lat: f64, lon: f64, group_id: Option<&str>) -> Sample {
        Sample {
            session_id: "s1".into(),
            user_id: "u1".into(),
            group_id: group_id.map(String::from),
            lat,
            lon,
            timestamp: ts(),
        }
    }

    fn square(lat_min: f64, lon_min: f64, lat_max: f64, lon_max: f64) -> geojson::Geometry {
        geojson::Geometry::new(geojson::Value::Polygon(vec![vec![
            vec![lon_min, lat_min],
            vec![lon_max, lat_min],
            vec![lon_max, lat_max],
            vec![lon_min, lat_max],
            vec![lon_min, lat_min],
        ]]))
    }

    fn engine(capabilities: Capabilities) -> FusionEngine {
        let config = Config::default();
        FusionEngine::new(
            config.clone(),
            Arc::new(GeofenceRegistry::new(StdDuration::from_secs(30))),
            Arc::new(GroupTracker::new(config.group_dispersion_km)),
            capabilities,
        )
    }

    fn engine_with_registry(
        capabilities: Capabilities,
        registry: Arc<GeofenceRegistry>,
    ) -> FusionEngine {
        let config = Config::default();
        FusionEngine::new(
            config.clone(),
            registry,
            Arc::new(GroupTracker::new(config.group_dispersion_km)),
            capabilities,
        )
    }

    #[test]
    fn no_capabilities_yields_neutral_bounded_result() {
        let e = engine(Capabilities::default());
        let r = e.score(&sample(20.0, 78.0, None), &FeatureVector::default(), None, 1);
        assert_eq!(r.anomaly_score, 0.0);
        assert!(!r.anomaly_flag);
        assert!(r.reasons.is_empty());
        assert_eq!(r.final_risk, 0.0);
        assert!(r.factors.is_empty());
    }

    #[test]
    fn anomaly_score_is_logistic_of_negated_decision() {
        let capabilities = Capabilities {
            anomaly: Some(Arc::new(StubAnomaly {
                decision_score: -2.0,
                is_anomalous: true,
                fail: false,
            })),
            ..Capabilities::default()
        };
        let e = engine(capabilities);
        let r = e.score(&sample(20.0, 78.0, None), &FeatureVector::default(), None, 1);
        assert!((r.anomaly_score - sigmoid(2.0)).abs() < 1e-12);
        assert!(r.anomaly_flag);
        assert_eq!(r.reasons, vec![ReasonCode::MlAnomaly, ReasonCode::ClusterNoise]);
        // 0.5 * sigmoid(2) rounded to 3 decimals
        assert!((r.final_risk - round3(0.5 * sigmoid(2.0))).abs() < 1e-12);
    }

    #[test]
    fn failing_anomaly_model_degrades_to_zero() {
        let capabilities = Capabilities {
            anomaly: Some(Arc::new(StubAnomaly {
                decision_score: -5.0,
                is_anomalous: true,
                fail: true,
            })),
            ..Capabilities::default()
        };
        let e = engine(capabilities);
        let r = e.score(&sample(20.0, 78.0, None), &FeatureVector::default(), None, 1);
        assert_eq!(r.anomaly_score, 0.0);
        assert!(!r.anomaly_flag);
        assert_eq!(r.final_risk, 0.0);
    }

    #[test]
    fn cluster_flag_from_distance_vs_eps() {
        let capabilities = Capabilities {
            density: Some(Arc::new(StubDensity {
                distance: Some(1.5),
                eps: 0.9,
            })),
            ..Capabilities::default()
        };
        let e = engine(capabilities);
        let r = e.score(&sample(20.0, 78.0, None), &FeatureVector::default(), None, 1);
        assert!(r.cluster_flag);
        assert_eq!(r.cluster_distance, Some(1.5));
        assert_eq!(r.reasons, vec![ReasonCode::ClusterNoise]);
    }

    #[test]
    fn unknown_distance_falls_back_to_anomaly_flag() {
        let capabilities = Capabilities {
            anomaly: Some(Arc::new(StubAnomaly {
                decision_score: 1.0,
                is_anomalous: false,
                fail: false,
            })),
            density: Some(Arc::new(StubDensity {
                distance: None,
                eps: 0.9,
            })),
            ..Capabilities::default()
        };
        let e = engine(capabilities);
        let r = e.score(&sample(20.0, 78.0, None), &FeatureVector::default(), None, 1);
        assert!(!r.cluster_flag);
        assert!(r.cluster_distance.is_none());
    }

    #[test]
    fn high_zone_sets_geo_flag_and_weight() {
        let registry = Arc::new(GeofenceRegistry::new(StdDuration::from_secs(30)));
        registry.load_static(vec![ZoneSpec {
            zone_id: "danger".into(),
            name: None,
            risk_level: RiskLevel::High,
            geojson: square(19.0, 77.0, 21.0, 79.0),
        }]);
        let e = engine_with_registry(Capabilities::default(), registry);
        let r = e.score(&sample(20.0, 78.0, None), &FeatureVector::default(), None, 1);
        assert!(r.geo_flag);
        assert_eq!(r.zone.as_ref().unwrap().zone_id, "danger");
        assert_eq!(r.reasons, vec![ReasonCode::InZoneHigh]);
        assert_eq!(r.final_risk, 0.2); // geo weight 0.2 * level weight 1.0
    }

    #[test]
    fn low_zone_contributes_weight_without_flag_or_reason() {
        let registry = Arc::new(GeofenceRegistry::new(StdDuration::from_secs(30)));
        registry.load_static(vec![ZoneSpec {
            zone_id: "calm".into(),
            name: None,
            risk_level: RiskLevel::Low,
            geojson: square(19.0, 77.0, 21.0, 79.0),
        }]);
        let e = engine_with_registry(Capabilities::default(), registry);
        let r = e.score(&sample(20.0, 78.0, None), &FeatureVector::default(), None, 1);
        assert!(!r.geo_flag);
        assert!(r.zone.is_some());
        assert!(r.reasons.is_empty());
        assert_eq!(r.final_risk, round3(0.2 * 0.2));
    }

    #[test]
    fn open_water_needs_no_zone_far_distance_and_offshore_point() {
        // No static zones loaded: nearest distance is the 9999 sentinel,
        // and (-10, 78) sits outside the default inland box.
        let e = engine(Capabilities::default());
        let r = e.score(&sample(-10.0, 78.0, None), &FeatureVector::default(), None, 1);
        assert!(r.open_water_flag);
        assert_eq!(r.reasons, vec![ReasonCode::OpenWater]);
        assert_eq!(r.final_risk, 0.05);

        // Same situation inside the inland box: guarded.
        let r = e.score(&sample(20.0, 78.0, None), &FeatureVector::default(), None, 1);
        assert!(!r.open_water_flag);
    }

    #[test]
    fn inactivity_gap_over_threshold_flags() {
        let e = engine(Capabilities::default());
        let prev = ts() - Duration::minutes(11);
        let r = e.score(&sample(20.0, 78.0, None), &FeatureVector::default(), Some(prev), 2);
        assert!(r.inactivity_flag);
        assert_eq!(r.reasons, vec![ReasonCode::InactivityGt10m]);
        assert_eq!(r.final_risk, 0.15);

        let recent = ts() - Duration::minutes(5);
        let r = e.score(&sample(20.0, 78.0, None), &FeatureVector::default(), Some(recent), 2);
        assert!(!r.inactivity_flag);
    }

    #[test]
    fn group_dispersion_flags_only_with_group_id() {
        let e = engine(Capabilities::default());
        // First member far to the north.
        let far = Sample {
            user_id: "u2".into(),
            lat: 20.2,
            ..sample(20.0, 78.0, Some("g1"))
        };
        e.score(&far, &FeatureVector::default(), None, 1);

        let r = e.score(&sample(20.0, 78.0, Some("g1")), &FeatureVector::default(), None, 1);
        assert!(r.group_flag);
        assert_eq!(r.reasons, vec![ReasonCode::GroupDistanceGt10km]);

        // Without a group id the tracker is not consulted.
        let r = e.score(&sample(20.0, 78.0, None), &FeatureVector::default(), None, 1);
        assert!(!r.group_flag);
    }

    #[test]
    fn hotspot_score_composition_and_reasons() {
        let e = engine(Capabilities::default());
        let features = FeatureVector {
            crime_rate_local: 0.8,
            event_density_local: 9.0f64.ln_1p(),
            ..FeatureVector::default()
        };
        let r = e.score(&sample(20.0, 78.0, None), &features, None, 1);

        let density_scaled: f64 = (9.0f64.ln_1p() / 15.0f64.ln_1p()).min(1.0);
        let expected = (0.7 * 0.8 + 0.3 * density_scaled).min(1.0);
        assert!((r.hotspot.score - expected).abs() < 1e-12);
        assert!(r.hotspot_flag);
        assert_eq!(
            r.reasons,
            vec![
                ReasonCode::LocalHotspot,
                ReasonCode::CrimeHotspotHigh,
                ReasonCode::EventDensityHigh,
            ]
        );
    }

    #[test]
    fn all_signals_firing_stays_within_unit_interval() {
        let registry = Arc::new(GeofenceRegistry::new(StdDuration::from_secs(30)));
        registry.load_static(vec![ZoneSpec {
            zone_id: "danger".into(),
            name: None,
            risk_level: RiskLevel::High,
            geojson: square(19.0, 77.0, 21.0, 79.0),
        }]);
        let capabilities = Capabilities {
            anomaly: Some(Arc::new(StubAnomaly {
                decision_score: -50.0,
                is_anomalous: true,
                fail: false,
            })),
            density: Some(Arc::new(StubDensity {
                distance: Some(10.0),
                eps: 0.9,
            })),
            ..Capabilities::default()
        };
        let e = engine_with_registry(capabilities, registry);
        let features = FeatureVector {
            crime_rate_local: 1.0,
            event_density_local: 100.0,
            ..FeatureVector::default()
        };
        let prev = ts() - Duration::minutes(30);
        let r = e.score(&sample(20.0, 78.0, None), &features, Some(prev), 5);

        assert!(r.final_risk <= 1.0 && r.final_risk >= 0.0);
        // ml 0.5*~1 + geo 0.2 + rules 0.15 + hotspot 0.1 = ~0.95 (no open water in zone)
        assert!((r.final_risk - 0.95).abs() < 0.005, "got {}", r.final_risk);
        assert_eq!(
            r.reasons,
            vec![
                ReasonCode::MlAnomaly,
                ReasonCode::ClusterNoise,
                ReasonCode::InZoneHigh,
                ReasonCode::InactivityGt10m,
                ReasonCode::LocalHotspot,
                ReasonCode::CrimeHotspotHigh,
                ReasonCode::EventDensityHigh,
            ]
        );
    }
}
