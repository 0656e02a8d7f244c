// src/state/groups.rs
//
// Latest-position-per-member group tracker. No staleness eviction:
// members persist until process exit; groups are small so the O(n²)
// pairwise check is fine.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::geo::haversine_km;

type MemberPositions = HashMap<String, (f64, f64, DateTime<Utc>)>;

pub struct GroupTracker {
    groups: DashMap<String, MemberPositions>,
    dispersion_km: f64,
}

impl GroupTracker {
    pub fn new(dispersion_km: f64) -> Self {
        Self {
            groups: DashMap::new(),
            dispersion_km,
        }
    }

    /// Record the member's latest position, then check every pair in the
    /// group. Returns true when any pair exceeds the dispersion threshold.
    /// Holding the entry guard keeps record-and-check atomic per group.
    pub fn observe(
        &self,
        group_id: &str,
        user_id: &str,
        lat: f64,
        lon: f64,
        timestamp: DateTime<Utc>,
    ) -> bool {
        let mut members = self.groups.entry(group_id.to_string()).or_default();
        members.insert(user_id.to_string(), (lat, lon, timestamp));

        let positions: Vec<&(f64, f64, DateTime<Utc>)> = members.values().collect();
        for i in 0..positions.len() {
            for j in (i + 1)..positions.len() {
                let (lat_a, lon_a, _) = *positions[i];
                let (lat_b, lon_b, _) = *positions[j];
                if haversine_km(lat_a, lon_a, lat_b, lon_b) > self.dispersion_km {
                    return true;
                }
            }
        }
        false
    }

    pub fn n_groups(&self) -> usize {
        self.groups.len()
    }

    pub fn group_size(&self, group_id: &str) -> usize {
        self.groups.get(group_id).map(|m| m.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 9, 7, 10, 0, 0).unwrap()
    }

    #[test]
    fn single_member_never_disperses() {
        let tracker = GroupTracker::new(10.0);
        assert!(!tracker.observe("g1", "u1", 12.97, 77.59, now()));
    }

    #[test]
    fn pair_15_km_apart_flags() {
        let tracker = GroupTracker::new(10.0);
        tracker.observe("g1", "u1", 0.0, 0.0, now());
        // 15 km north: ~0.135 degrees of latitude
        assert!(tracker.observe("g1", "u2", 0.135, 0.0, now()));
    }

    #[test]
    fn pair_5_km_apart_does_not_flag() {
        let tracker = GroupTracker::new(10.0);
        tracker.observe("g1", "u1", 0.0, 0.0, now());
        // 5 km north: ~0.045 degrees of latitude
        assert!(!tracker.observe("g1", "u2", 0.045, 0.0, now()));
    }

    #[test]
    fn latest_position_wins() {
        let tracker = GroupTracker::new(10.0);
        tracker.observe("g1", "u1", 0.0, 0.0, now());
        assert!(tracker.observe("g1", "u2", 0.2, 0.0, now()));
        // u2 rejoins the group; the old far position is overwritten.
        assert!(!tracker.observe("g1", "u2", 0.001, 0.0, now()));
        assert_eq!(tracker.group_size("g1"), 2);
    }

    #[test]
    fn groups_are_independent() {
        let tracker = GroupTracker::new(10.0);
        tracker.observe("g1", "u1", 0.0, 0.0, now());
        assert!(!tracker.observe("g2", "u2", 50.0, 50.0, now()));
        assert_eq!(tracker.n_groups(), 2);
    }
}
