use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Rapport validé tel que soumis par une instance génératrice.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceReport {
    pub instance_id: String,
    pub total_hashes: u64,
    pub overall_hashrate: f64,
    pub recent_hashrate: f64,
    pub gpu_count: u32,
    pub gpu_available: bool,
    /// Horodatage côté producteur (informatif, pas utilisé pour la liveness)
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

/// Dernier rapport connu pour un instance_id, enrichi du last_seen serveur.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceState {
    #[serde(flatten)]
    pub report: InstanceReport,
    /// Adresse source vue par le serveur (X-Forwarded-For prioritaire)
    #[serde(default)]
    pub ip: Option<String>,
    /// Horodatage d'acceptation côté serveur ; seule base de la liveness
    #[serde(with = "time::serde::rfc3339")]
    pub last_seen: OffsetDateTime,
}

/// Statistiques de flotte dérivées des instances vivantes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregateSnapshot {
    pub total_instances: u32,
    pub total_hashrate: f64,
    pub total_hashes: u64,
    pub total_gpus: u32,
    pub avg_hashrate: f64,
}

/// Point de série temporelle persisté. `instance_id = None` marque la ligne
/// agrégat flotte, `Some(id)` un échantillon par instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryPoint {
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub instance_id: Option<String>,
    pub total_instances: u32,
    pub total_hashrate: f64,
    pub total_hashes: u64,
    pub total_gpus: u32,
}
