/**
 * REAPER - Tâches périodiques d'entretien
 *
 * RÔLE : Trois boucles indépendantes sur timers séparés :
 * - balayage liveness : évince les instances muettes et pousse la mise à
 *   jour aux viewers si quelque chose a changé
 * - enregistreur d'historique : persiste l'instantané courant (c'est lui
 *   qui borne la croissance du stockage, pas le volume de rapports)
 * - balayage rétention : purge l'historique expiré
 *
 * Chaque tick est idempotent ; un tick raté ou une erreur ne fait que
 * retarder l'entretien, jamais corrompre l'état.
 */

use crate::aggregate::aggregate;
use crate::health::HealthTracker;
use crate::history::{HistoryError, HistoryStore};
use crate::hub::{BroadcastHub, PushMessage};
use crate::registry::{InstanceRegistry, SharedRegistry};
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tracing::{error, info};

pub fn spawn_liveness_sweep(
    registry: SharedRegistry,
    hub: Arc<BroadcastHub>,
    health: HealthTracker,
    every: Duration,
) {
    info!(interval_seconds = every.as_secs(), "starting liveness sweep");
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        loop {
            interval.tick().await;
            liveness_sweep_once(&registry, &hub, &health, OffsetDateTime::now_utc());
        }
    });
}

/// Évince les instances périmées ; si au moins une l'a été, recalcule
/// l'agrégat et le pousse aux viewers pour refléter les départs même sans
/// nouveau rapport entrant.
pub fn liveness_sweep_once(
    registry: &InstanceRegistry,
    hub: &BroadcastHub,
    health: &HealthTracker,
    now: OffsetDateTime,
) -> usize {
    let removed = registry.evict_stale(now);
    if removed > 0 {
        health.mark_evictions(removed as u64);
        let instances = registry.live_instances(now);
        let stats = aggregate(&instances);
        info!(removed, live = instances.len(), "evicted stale instances");
        hub.publish(PushMessage::InstancesUpdate { instances, stats });
    }
    removed
}

pub fn spawn_history_recorder(registry: SharedRegistry, history: Arc<HistoryStore>, every: Duration) {
    info!(interval_seconds = every.as_secs(), "starting history recorder");
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        loop {
            interval.tick().await;
            if let Err(e) = record_once(&registry, &history, OffsetDateTime::now_utc()) {
                error!("history append failed, retrying next tick: {e}");
            }
        }
    });
}

/// Persiste l'instantané courant (ligne flotte + instances vivantes).
pub fn record_once(
    registry: &InstanceRegistry,
    history: &HistoryStore,
    now: OffsetDateTime,
) -> Result<(), HistoryError> {
    let instances = registry.live_instances(now);
    let stats = aggregate(&instances);
    history.record_snapshot(now, &instances, &stats)
}

pub fn spawn_retention_sweep(history: Arc<HistoryStore>, health: HealthTracker, every: Duration) {
    info!(interval_seconds = every.as_secs(), "starting retention sweep");
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        loop {
            interval.tick().await;
            match history.prune(OffsetDateTime::now_utc()) {
                Ok(0) => {}
                Ok(removed) => {
                    health.mark_pruned(removed as u64);
                    info!(removed, "pruned expired history rows");
                }
                Err(e) => error!("history prune failed, retrying next tick: {e}"),
            }
        }
    });
}
