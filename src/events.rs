// src/events.rs
//
// Domain types flowing through the pipeline: incoming samples, zone
// metadata, reason codes, and the fused output record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One geolocation sample for a tracked session. Immutable once ingested.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sample {
    pub session_id: String,
    pub user_id: String,
    #[serde(default)]
    pub group_id: Option<String>,
    pub lat: f64,
    pub lon: f64,
    pub timestamp: DateTime<Utc>,
}

// ── Zones ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    /// Contribution of a matched zone to the fused score.
    pub fn weight(self) -> f64 {
        match self {
            Self::High => 1.0,
            Self::Medium => 0.6,
            Self::Low => 0.2,
        }
    }
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
        }
    }
}

/// Zone metadata returned by a successful locate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZoneMatch {
    pub zone_id: String,
    pub name: String,
    pub risk_level: RiskLevel,
    pub dynamic: bool,
}

// ── Reason codes ──────────────────────────────────────────────────────────────

/// Human-readable reason codes, appended in detection order. The order is
/// deterministic and part of the observable contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReasonCode {
    #[serde(rename = "ml_anomaly")]
    MlAnomaly,
    #[serde(rename = "cluster_noise")]
    ClusterNoise,
    #[serde(rename = "in_zone_low")]
    InZoneLow,
    #[serde(rename = "in_zone_medium")]
    InZoneMedium,
    #[serde(rename = "in_zone_high")]
    InZoneHigh,
    #[serde(rename = "open_water")]
    OpenWater,
    #[serde(rename = "inactivity_gt_10m")]
    InactivityGt10m,
    #[serde(rename = "group_distance_gt_10km")]
    GroupDistanceGt10km,
    #[serde(rename = "local_hotspot")]
    LocalHotspot,
    #[serde(rename = "crime_hotspot_high")]
    CrimeHotspotHigh,
    #[serde(rename = "event_density_high")]
    EventDensityHigh,
}

impl ReasonCode {
    pub fn in_zone(level: RiskLevel) -> Self {
        match level {
            RiskLevel::Low => Self::InZoneLow,
            RiskLevel::Medium => Self::InZoneMedium,
            RiskLevel::High => Self::InZoneHigh,
        }
    }
}

impl std::fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::MlAnomaly => "ml_anomaly",
            Self::ClusterNoise => "cluster_noise",
            Self::InZoneLow => "in_zone_low",
            Self::InZoneMedium => "in_zone_medium",
            Self::InZoneHigh => "in_zone_high",
            Self::OpenWater => "open_water",
            Self::InactivityGt10m => "inactivity_gt_10m",
            Self::GroupDistanceGt10km => "group_distance_gt_10km",
            Self::LocalHotspot => "local_hotspot",
            Self::CrimeHotspotHigh => "crime_hotspot_high",
            Self::EventDensityHigh => "event_density_high",
        };
        write!(f, "{s}")
    }
}

// ── Fused output ──────────────────────────────────────────────────────────────

/// One attributed feature from the explanation capability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Factor {
    pub name: String,
    pub contribution: f64,
    pub weight: f64,
}

/// Hotspot sub-scores carried alongside the fused score.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct HotspotDetail {
    pub score: f64,
    pub crime_rate: f64,
    pub density_log: f64,
    pub threshold: f64,
}

/// Fused output for one scored sample.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FusedResult {
    pub session_id: String,
    pub user_id: String,
    pub group_id: Option<String>,
    pub lat: f64,
    pub lon: f64,
    pub timestamp: DateTime<Utc>,

    /// Model decision score mapped to [0,1] via logistic of its negation.
    pub anomaly_score: f64,
    /// Raw model-space decision score (more negative = more anomalous).
    pub decision_score: f64,
    pub cluster_distance: Option<f64>,
    /// Final fused risk in [0,1], rounded to 3 decimals.
    pub final_risk: f64,

    pub reasons: Vec<ReasonCode>,
    pub factors: Vec<Factor>,
    pub zone: Option<ZoneMatch>,

    pub anomaly_flag: bool,
    pub cluster_flag: bool,
    pub geo_flag: bool,
    pub open_water_flag: bool,
    pub inactivity_flag: bool,
    pub group_flag: bool,
    pub hotspot_flag: bool,

    pub hotspot: HotspotDetail,
    /// Points currently held in this session's window.
    pub window_len: usize,
}
