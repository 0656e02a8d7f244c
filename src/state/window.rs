// src/state/window.rs
//
// Bounded per-session sample windows.
// DashMap = sharded concurrent HashMap, so sessions ingest in parallel;
// the per-window RwLock serialises same-session writers and keeps FIFO
// order intact. Windows are created lazily and never destroyed — capacity
// bounds memory per session, callers bound the number of active sessions.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrackPoint {
    pub lat: f64,
    pub lon: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug)]
struct SessionWindow {
    points: VecDeque<TrackPoint>,
    capacity: usize,
    last_seen: Option<DateTime<Utc>>,
}

impl SessionWindow {
    fn new(capacity: usize) -> Self {
        Self {
            points: VecDeque::with_capacity(capacity),
            capacity,
            last_seen: None,
        }
    }

    /// Append, evicting the oldest point once full. Returns the timestamp
    /// recorded by the previous ingest (for the inactivity rule).
    fn push(&mut self, point: TrackPoint) -> Option<DateTime<Utc>> {
        let previous = self.last_seen;
        if self.points.len() == self.capacity {
            self.points.pop_front();
        }
        self.points.push_back(point);
        self.last_seen = Some(point.timestamp);
        previous
    }
}

/// Consistent view of one session taken at ingest time, handed to the
/// feature computation outside any lock.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub points: Vec<TrackPoint>,
    /// Timestamp of the previous ingest for this session, before this one.
    pub previous_seen: Option<DateTime<Utc>>,
}

pub struct SessionStore {
    sessions: DashMap<String, Arc<RwLock<SessionWindow>>>,
    capacity: usize,
    total_samples: AtomicU64,
}

impl SessionStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            capacity,
            total_samples: AtomicU64::new(0),
        }
    }

    pub fn ingest(&self, session_id: &str, point: TrackPoint) -> SessionSnapshot {
        self.total_samples.fetch_add(1, Ordering::Relaxed);
        let window = self
            .sessions
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(SessionWindow::new(self.capacity))))
            .clone();

        let mut w = window.write();
        let previous_seen = w.push(point);
        SessionSnapshot {
            points: w.points.iter().copied().collect(),
            previous_seen,
        }
    }

    pub fn window_len(&self, session_id: &str) -> usize {
        self.sessions
            .get(session_id)
            .map(|w| w.read().points.len())
            .unwrap_or(0)
    }

    pub fn n_sessions(&self) -> usize {
        self.sessions.len()
    }

    pub fn total_samples(&self) -> u64 {
        self.total_samples.load(Ordering::Relaxed)
    }
}
