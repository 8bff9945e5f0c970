/**
 * INSTANCE REGISTRY - Vue vivante de la flotte de générateurs
 *
 * RÔLE : Source de vérité "qui est vivant". Dernier rapport connu par
 * instance_id, remplacé à chaque nouveau rapport (last-write-wins).
 *
 * FONCTIONNEMENT :
 * - DashMap : exclusivité par clé via les shards, deux instance_id
 *   différents ne se bloquent jamais mutuellement
 * - Lecture (live_instances/all) = copie instantanée, jamais d'éviction
 * - Éviction = evict_stale, appelée uniquement par le reaper
 *
 * La frontière de liveness est exclusive : une instance vue il y a
 * exactement liveness_window n'est plus vivante.
 */

use crate::models::InstanceState;
use dashmap::DashMap;
use std::sync::Arc;
use time::{Duration, OffsetDateTime};

pub struct InstanceRegistry {
    instances: DashMap<String, InstanceState>,
    liveness_window: Duration,
}

impl InstanceRegistry {
    pub fn new(liveness_window: Duration) -> Self {
        Self {
            instances: DashMap::new(),
            liveness_window,
        }
    }

    pub fn liveness_window(&self) -> Duration {
        self.liveness_window
    }

    /// Insère ou remplace l'entrée de `state.report.instance_id`.
    pub fn upsert(&self, state: InstanceState) {
        self.instances
            .insert(state.report.instance_id.clone(), state);
    }

    /// Entrées avec `now - last_seen < liveness_window`. Lecture pure :
    /// les entrées périmées restent en place jusqu'au passage du reaper.
    pub fn live_instances(&self, now: OffsetDateTime) -> Vec<InstanceState> {
        self.instances
            .iter()
            .filter(|entry| now - entry.last_seen < self.liveness_window)
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Supprime les entrées périmées et retourne combien l'ont été.
    /// Réservé au reaper. Le comptage se fait dans la closure : des upserts
    /// concurrents peuvent faire grossir la map pendant le retain, un diff
    /// de longueurs serait faux.
    pub fn evict_stale(&self, now: OffsetDateTime) -> usize {
        let mut removed = 0;
        self.instances.retain(|_, state| {
            let live = now - state.last_seen < self.liveness_window;
            if !live {
                removed += 1;
            }
            live
        });
        removed
    }

    /// Instantané complet, périmées comprises.
    pub fn all(&self) -> Vec<InstanceState> {
        self.instances
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn get(&self, instance_id: &str) -> Option<InstanceState> {
        self.instances.get(instance_id).map(|e| e.value().clone())
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }
}

pub type SharedRegistry = Arc<InstanceRegistry>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::InstanceReport;

    fn state(id: &str, hashes: u64, rate: f64, last_seen: OffsetDateTime) -> InstanceState {
        InstanceState {
            report: InstanceReport {
                instance_id: id.into(),
                total_hashes: hashes,
                overall_hashrate: rate,
                recent_hashrate: rate,
                gpu_count: 0,
                gpu_available: false,
                timestamp: last_seen,
            },
            ip: None,
            last_seen,
        }
    }

    fn registry() -> InstanceRegistry {
        InstanceRegistry::new(Duration::seconds(30))
    }

    #[test]
    fn last_write_wins_per_instance() {
        let reg = registry();
        let now = OffsetDateTime::now_utc();
        reg.upsert(state("a", 100, 50.0, now - Duration::seconds(1)));
        reg.upsert(state("b", 500, 10.0, now));
        reg.upsert(state("a", 200, 60.0, now));

        assert_eq!(reg.len(), 2);
        let a = reg.get("a").unwrap();
        assert_eq!(a.report.total_hashes, 200);
        assert_eq!(a.report.recent_hashrate, 60.0);
    }

    #[test]
    fn liveness_boundary_is_exclusive() {
        let reg = registry();
        let now = OffsetDateTime::now_utc();
        reg.upsert(state("fresh", 1, 1.0, now - Duration::seconds(29)));
        reg.upsert(state("edge", 1, 1.0, now - Duration::seconds(30)));
        reg.upsert(state("old", 1, 1.0, now - Duration::seconds(31)));

        let live = reg.live_instances(now);
        let ids: Vec<_> = live.iter().map(|s| s.report.instance_id.as_str()).collect();
        assert_eq!(ids, vec!["fresh"]);
    }

    #[test]
    fn live_read_does_not_evict() {
        let reg = registry();
        let now = OffsetDateTime::now_utc();
        reg.upsert(state("old", 1, 1.0, now - Duration::seconds(45)));

        assert!(reg.live_instances(now).is_empty());
        // l'entrée périmée reste visible via all() tant que le reaper n'est pas passé
        assert_eq!(reg.all().len(), 1);
    }

    #[test]
    fn evict_stale_removes_only_expired() {
        let reg = registry();
        let now = OffsetDateTime::now_utc();
        reg.upsert(state("a", 1, 1.0, now - Duration::seconds(31)));
        reg.upsert(state("b", 1, 1.0, now - Duration::seconds(5)));

        assert_eq!(reg.evict_stale(now), 1);
        assert_eq!(reg.all().len(), 1);
        assert!(reg.get("a").is_none());
        assert!(reg.get("b").is_some());
        // idempotent au même instant
        assert_eq!(reg.evict_stale(now), 0);
    }

    #[test]
    fn evict_count_is_exact_under_concurrent_upserts() {
        let reg = Arc::new(InstanceRegistry::new(Duration::seconds(30)));
        let now = OffsetDateTime::now_utc();
        for i in 0..5000 {
            reg.upsert(state(&format!("stale-{i}"), 1, 1.0, now - Duration::seconds(60)));
        }

        // des producteurs concurrents insèrent des entrées fraîches pendant l'éviction
        let writer = {
            let reg = Arc::clone(&reg);
            std::thread::spawn(move || {
                for i in 0..5000 {
                    reg.upsert(state(&format!("fresh-{i}"), 1, 1.0, OffsetDateTime::now_utc()));
                }
            })
        };

        let mut removed = 0;
        for _ in 0..100 {
            removed += reg.evict_stale(OffsetDateTime::now_utc());
            if removed >= 5000 {
                break;
            }
        }
        writer.join().unwrap();

        assert_eq!(removed, 5000);
        assert_eq!(reg.evict_stale(OffsetDateTime::now_utc()), 0);
        assert_eq!(reg.len(), 5000);
    }

    #[test]
    fn scenario_instance_ages_out_then_is_evicted() {
        let reg = registry();
        let t0 = OffsetDateTime::now_utc();
        reg.upsert(state("a", 100, 50.0, t0));

        assert_eq!(reg.live_instances(t0 + Duration::seconds(10)).len(), 1);
        assert!(reg.live_instances(t0 + Duration::seconds(31)).is_empty());
        assert_eq!(reg.all().len(), 1);

        assert_eq!(reg.evict_stale(t0 + Duration::seconds(35)), 1);
        assert!(reg.all().is_empty());
    }
}
