use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::fs;
use tracing::{debug, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub port: u16,
    pub database_path: String,
    /// Fenêtre de liveness : une instance sans rapport depuis plus longtemps
    /// est considérée inactive (lecture) puis évincée (reaper).
    pub liveness_window_seconds: u64,
    pub liveness_sweep_seconds: u64,
    pub retention_days: u64,
    pub retention_sweep_seconds: u64,
    pub history_interval_seconds: u64,
    pub broadcast_capacity: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            port: 5000,
            database_path: "hashrate.db".into(),
            liveness_window_seconds: 30,
            liveness_sweep_seconds: 5,
            retention_days: 7,
            retention_sweep_seconds: 3600,
            history_interval_seconds: 10,
            broadcast_capacity: 256,
        }
    }
}

impl MonitorConfig {
    pub fn liveness_window(&self) -> time::Duration {
        time::Duration::seconds(self.liveness_window_seconds as i64)
    }

    pub fn retention(&self) -> time::Duration {
        time::Duration::days(self.retention_days as i64)
    }
}

pub async fn load_config() -> MonitorConfig {
    let path = std::env::var("HASHMON_CONFIG").unwrap_or_else(|_| "hashmon.yaml".into());
    let mut cfg = if Path::new(&path).exists() {
        let txt = fs::read_to_string(&path).await.unwrap_or_default();
        if txt.trim().is_empty() {
            MonitorConfig::default()
        } else {
            serde_yaml::from_str(&txt).unwrap_or_else(|e| {
                warn!("config invalide ({path}): {e}, utilisation des défauts");
                MonitorConfig::default()
            })
        }
    } else {
        debug!("pas de {path}, config par défaut");
        MonitorConfig::default()
    };
    apply_env_overrides(&mut cfg);
    cfg
}

// Surface env documentée : PORT, DATABASE_PATH, LIVENESS_WINDOW (secondes),
// RETENTION_DAYS. Le reste ne se règle que par fichier YAML.
fn apply_env_overrides(cfg: &mut MonitorConfig) {
    if let Some(v) = env_u64("PORT") {
        cfg.port = v.min(u16::MAX as u64) as u16;
    }
    if let Ok(v) = std::env::var("DATABASE_PATH") {
        if !v.trim().is_empty() {
            cfg.database_path = v;
        }
    }
    if let Some(v) = env_u64("LIVENESS_WINDOW") {
        cfg.liveness_window_seconds = v;
    }
    if let Some(v) = env_u64("RETENTION_DAYS") {
        cfg.retention_days = v;
    }
}

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok()?.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_policy() {
        let cfg = MonitorConfig::default();
        assert_eq!(cfg.liveness_window_seconds, 30);
        assert_eq!(cfg.retention_days, 7);
        assert_eq!(cfg.liveness_window(), time::Duration::seconds(30));
        assert_eq!(cfg.retention(), time::Duration::days(7));
    }

    #[test]
    fn partial_yaml_keeps_defaults_for_missing_keys() {
        let cfg: MonitorConfig = serde_yaml::from_str("port: 8080\nretention_days: 3\n").unwrap();
        assert_eq!(cfg.port, 8080);
        assert_eq!(cfg.retention_days, 3);
        assert_eq!(cfg.liveness_window_seconds, 30);
        assert_eq!(cfg.database_path, "hashrate.db");
    }
}
