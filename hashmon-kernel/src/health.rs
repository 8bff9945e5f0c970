use crate::config::MonitorConfig;
use crate::history::HistoryStore;
use crate::hub::BroadcastHub;
use crate::registry::InstanceRegistry;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Serialize, Deserialize)]
pub struct MonitorHealth {
    pub uptime_seconds: u64,
    pub instances_tracked: u32,
    pub viewers_connected: u32,
    pub reports_accepted: u64,
    pub instances_evicted: u64,
    pub history_rows_pruned: u64,
    pub history_status: String,
    pub liveness_window_seconds: u64,
    pub retention_days: u64,
    pub memory_usage_mb: f32,
}

/// Compteurs de vie du process, exposés sur /system/health.
#[derive(Clone)]
pub struct HealthTracker {
    start_time: Instant,
    reports_accepted: Arc<AtomicU64>,
    instances_evicted: Arc<AtomicU64>,
    history_rows_pruned: Arc<AtomicU64>,
}

impl HealthTracker {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            reports_accepted: Arc::new(AtomicU64::new(0)),
            instances_evicted: Arc::new(AtomicU64::new(0)),
            history_rows_pruned: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn mark_report_accepted(&self) {
        self.reports_accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mark_evictions(&self, count: u64) {
        self.instances_evicted.fetch_add(count, Ordering::Relaxed);
    }

    pub fn mark_pruned(&self, count: u64) {
        self.history_rows_pruned.fetch_add(count, Ordering::Relaxed);
    }

    pub fn get_health(
        &self,
        registry: &InstanceRegistry,
        hub: &BroadcastHub,
        history: &HistoryStore,
        cfg: &MonitorConfig,
    ) -> MonitorHealth {
        let history_status = match history.ping() {
            Ok(()) => "ok".to_string(),
            Err(_) => "unavailable".to_string(),
        };

        MonitorHealth {
            uptime_seconds: self.start_time.elapsed().as_secs(),
            instances_tracked: registry.len() as u32,
            viewers_connected: hub.viewer_count() as u32,
            reports_accepted: self.reports_accepted.load(Ordering::Relaxed),
            instances_evicted: self.instances_evicted.load(Ordering::Relaxed),
            history_rows_pruned: self.history_rows_pruned.load(Ordering::Relaxed),
            history_status,
            liveness_window_seconds: cfg.liveness_window_seconds,
            retention_days: cfg.retention_days,
            memory_usage_mb: resident_memory_mb().unwrap_or(0.0),
        }
    }
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new()
    }
}

// VmRSS depuis /proc/self/status ; None hors Linux.
fn resident_memory_mb() -> Option<f32> {
    #[cfg(target_os = "linux")]
    {
        let status = std::fs::read_to_string("/proc/self/status").ok()?;
        let line = status.lines().find(|l| l.starts_with("VmRSS:"))?;
        let kb: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
        return Some(kb as f32 / 1024.0);
    }
    #[allow(unreachable_code)]
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::InstanceRegistry;
    use time::Duration;

    #[test]
    fn counters_accumulate() {
        let tracker = HealthTracker::new();
        tracker.mark_report_accepted();
        tracker.mark_report_accepted();
        tracker.mark_evictions(3);
        tracker.mark_pruned(10);

        let cfg = MonitorConfig::default();
        let registry = InstanceRegistry::new(Duration::seconds(30));
        let hub = BroadcastHub::new(4);
        let history = HistoryStore::open_in_memory(Duration::days(7)).unwrap();

        let health = tracker.get_health(&registry, &hub, &history, &cfg);
        assert_eq!(health.reports_accepted, 2);
        assert_eq!(health.instances_evicted, 3);
        assert_eq!(health.history_rows_pruned, 10);
        assert_eq!(health.instances_tracked, 0);
        assert_eq!(health.history_status, "ok");
        assert_eq!(health.liveness_window_seconds, 30);
    }
}
