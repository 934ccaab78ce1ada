use std::collections::HashMap;

use parking_lot::Mutex;
use tracing::{info, warn};

use super::types::{HealthStatus, ServerHealth, ServerKey};

/// Consecutive failures at which a server is marked unhealthy.
pub const UNHEALTHY_THRESHOLD: u32 = 3;
const SMOOTHING: f64 = 0.9;

/// Process-wide view of server health, shared by every worker.
#[derive(Default)]
pub struct ServerHealthTracker {
    health: Mutex<HashMap<ServerKey, ServerHealth>>,
}

impl ServerHealthTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update_health(
        &self,
        server: &ServerKey,
        success: bool,
        response_time_ms: Option<u64>,
    ) {
        let mut map = self.health.lock();
        let health = map
            .entry(server.clone())
            .or_insert_with(|| ServerHealth::new(server.clone()));
        let before = health.status;

        if success {
            health.success_count += 1;
            health.consecutive_failures = 0;
            health.status = HealthStatus::Healthy;

            if let Some(rt) = response_time_ms.filter(|rt| *rt > 0) {
                let rt = rt as f64;
                health.avg_response_time_ms = Some(match health.avg_response_time_ms {
                    Some(avg) => avg * SMOOTHING + rt * (1.0 - SMOOTHING),
                    None => rt,
                });
            }
        } else {
            health.failure_count += 1;
            health.consecutive_failures += 1;
            health.status = if health.consecutive_failures >= UNHEALTHY_THRESHOLD {
                HealthStatus::Unhealthy
            } else {
                HealthStatus::Degraded
            };
        }
        health.last_check = chrono::Utc::now().timestamp();

        if before != health.status {
            match health.status {
                HealthStatus::Unhealthy => warn!(
                    server = %server,
                    consecutive_failures = health.consecutive_failures,
                    "Server marked unhealthy"
                ),
                status => info!(
                    server = %server,
                    from = before.as_str(),
                    to = status.as_str(),
                    "Server health changed"
                ),
            }
        }
    }

    pub fn get_health(&self, server: &ServerKey) -> ServerHealth {
        self.health
            .lock()
            .get(server)
            .cloned()
            .unwrap_or_else(|| ServerHealth::new(server.clone()))
    }

    pub fn score(health: &ServerHealth) -> f64 {
        let mut score = match health.status {
            HealthStatus::Healthy => 100.0,
            HealthStatus::Degraded => 50.0,
            HealthStatus::Unhealthy => 10.0,
            HealthStatus::Unknown => 0.0,
        };
        if health.success_count + health.failure_count > 0 {
            score *= health.success_rate();
        }
        if let Some(avg) = health.avg_response_time_ms.filter(|avg| *avg > 0.0) {
            score *= 1000.0 / avg;
        }
        score
    }

    /// Highest-scoring candidate; ties go to the earliest in `candidates`.
    pub fn get_best_server<'a>(&self, candidates: &'a [ServerKey]) -> Option<&'a ServerKey> {
        let map = self.health.lock();
        let mut best: Option<&ServerKey> = None;
        let mut best_score = -1.0;
        for candidate in candidates {
            let score = map.get(candidate).map(Self::score).unwrap_or(0.0);
            if score > best_score {
                best_score = score;
                best = Some(candidate);
            }
        }
        best
    }

    /// Candidates ordered best first, stable for equal scores.
    pub fn rank(&self, candidates: &[ServerKey]) -> Vec<ServerKey> {
        let map = self.health.lock();
        let mut scored: Vec<(f64, &ServerKey)> = candidates
            .iter()
            .map(|c| (map.get(c).map(Self::score).unwrap_or(0.0), c))
            .collect();
        scored.sort_by(|a, b| b.0.total_cmp(&a.0));
        scored.into_iter().map(|(_, c)| c.clone()).collect()
    }

    pub fn is_healthy(&self, server: &ServerKey) -> bool {
        matches!(
            self.get_health(server).status,
            HealthStatus::Healthy | HealthStatus::Degraded
        )
    }

    pub fn snapshot(&self) -> Vec<ServerHealth> {
        let mut all: Vec<_> = self.health.lock().values().cloned().collect();
        all.sort_by(|a, b| a.server.cmp(&b.server));
        all
    }

    /// Reloads persisted records, replacing any in-memory entry.
    pub fn restore(&self, records: impl IntoIterator<Item = ServerHealth>) {
        let mut map = self.health.lock();
        for record in records {
            map.insert(record.server.clone(), record);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(host: &str) -> ServerKey {
        ServerKey::new(host, 563)
    }

    #[test]
    fn test_three_failures_then_success() {
        let tracker = ServerHealthTracker::new();
        let server = key("news.a");

        tracker.update_health(&server, false, None);
        assert_eq!(tracker.get_health(&server).status, HealthStatus::Degraded);
        assert!(tracker.is_healthy(&server));
        tracker.update_health(&server, false, None);
        assert_eq!(tracker.get_health(&server).status, HealthStatus::Degraded);
        tracker.update_health(&server, false, None);

        let health = tracker.get_health(&server);
        assert_eq!(health.status, HealthStatus::Unhealthy);
        assert_eq!(health.consecutive_failures, 3);
        assert!(!tracker.is_healthy(&server));

        tracker.update_health(&server, true, Some(50));
        let health = tracker.get_health(&server);
        assert_eq!(health.status, HealthStatus::Healthy);
        assert_eq!(health.consecutive_failures, 0);
        assert_eq!(health.failure_count, 3);
        assert_eq!(health.success_count, 1);
    }

    #[test]
    fn test_response_time_smoothing() {
        let tracker = ServerHealthTracker::new();
        let server = key("news.a");
        tracker.update_health(&server, true, Some(100));
        assert_eq!(tracker.get_health(&server).avg_response_time_ms, Some(100.0));
        tracker.update_health(&server, true, Some(200));
        let avg = tracker.get_health(&server).avg_response_time_ms.unwrap();
        assert!((avg - 110.0).abs() < 1e-9);
        tracker.update_health(&server, true, None);
        let avg = tracker.get_health(&server).avg_response_time_ms.unwrap();
        assert!((avg - 110.0).abs() < 1e-9);
    }

    #[test]
    fn test_best_server_prefers_fast_and_reliable() {
        let tracker = ServerHealthTracker::new();
        let (a, b, c) = (key("a"), key("b"), key("c"));
        tracker.update_health(&a, true, Some(200));
        tracker.update_health(&b, true, Some(50));
        tracker.update_health(&c, false, None);

        let candidates = vec![a.clone(), b.clone(), c.clone()];
        assert_eq!(tracker.get_best_server(&candidates), Some(&b));
        assert_eq!(tracker.rank(&candidates), vec![b, a, c]);
    }

    #[test]
    fn test_unknown_servers_tie_to_first_seen() {
        let tracker = ServerHealthTracker::new();
        let candidates = vec![key("x"), key("y")];
        assert_eq!(tracker.get_best_server(&candidates), Some(&candidates[0]));
        assert_eq!(tracker.get_best_server(&[]), None);
    }

    #[test]
    fn test_snapshot_restore() {
        let tracker = ServerHealthTracker::new();
        tracker.update_health(&key("a"), true, Some(10));
        tracker.update_health(&key("b"), false, None);

        let restored = ServerHealthTracker::new();
        restored.restore(tracker.snapshot());
        assert_eq!(restored.get_health(&key("b")).failure_count, 1);
        assert_eq!(restored.snapshot().len(), 2);
    }
}
