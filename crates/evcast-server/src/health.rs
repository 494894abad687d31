//! `/health` endpoint.

use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::coordinator::StatsSnapshot;

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Always `"ok"` while the server is running.
    pub status: String,
    pub started_at: DateTime<Utc>,
    pub uptime_secs: u64,
    /// Currently registered clients.
    pub connections: usize,
    /// Events in the store.
    pub events: usize,
    pub commits: u64,
    pub rejections: u64,
    /// Snapshots fanned out after commits.
    pub broadcasts: u64,
    pub evictions: u64,
}

/// Assemble the `/health` body from the server's counters.
pub fn health_check(
    started_at: DateTime<Utc>,
    start_instant: Instant,
    connections: usize,
    events: usize,
    stats: StatsSnapshot,
    evictions: u64,
) -> HealthResponse {
    HealthResponse {
        status: "ok".into(),
        started_at,
        uptime_secs: start_instant.elapsed().as_secs(),
        connections,
        events,
        commits: stats.commits,
        rejections: stats.rejections,
        broadcasts: stats.broadcasts,
        evictions,
    }
}
