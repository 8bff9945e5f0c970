use crate::models::{AggregateSnapshot, InstanceState};

/// Calcule les statistiques de flotte à partir d'une liste d'instances.
/// Fonction pure : l'appelant choisit de ne passer que les instances vivantes
/// quand il veut la sémantique "actuellement actives".
pub fn aggregate(instances: &[InstanceState]) -> AggregateSnapshot {
    let total_instances = instances.len() as u32;
    let total_hashrate: f64 = instances.iter().map(|i| i.report.recent_hashrate).sum();
    let total_hashes: u64 = instances.iter().map(|i| i.report.total_hashes).sum();
    let total_gpus: u32 = instances.iter().map(|i| i.report.gpu_count).sum();
    let avg_hashrate = if total_instances == 0 {
        0.0
    } else {
        total_hashrate / total_instances as f64
    };

    AggregateSnapshot {
        total_instances,
        total_hashrate,
        total_hashes,
        total_gpus,
        avg_hashrate,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::InstanceReport;
    use time::OffsetDateTime;

    fn state(id: &str, hashes: u64, rate: f64, gpus: u32) -> InstanceState {
        let now = OffsetDateTime::now_utc();
        InstanceState {
            report: InstanceReport {
                instance_id: id.into(),
                total_hashes: hashes,
                overall_hashrate: rate,
                recent_hashrate: rate,
                gpu_count: gpus,
                gpu_available: gpus > 0,
                timestamp: now,
            },
            ip: None,
            last_seen: now,
        }
    }

    #[test]
    fn empty_input_yields_all_zero_snapshot() {
        assert_eq!(aggregate(&[]), AggregateSnapshot::default());
    }

    #[test]
    fn sums_and_average_over_instances() {
        let snap = aggregate(&[state("a", 200, 60.0, 2), state("b", 100, 40.0, 0)]);
        assert_eq!(snap.total_instances, 2);
        assert_eq!(snap.total_hashrate, 100.0);
        assert_eq!(snap.total_hashes, 300);
        assert_eq!(snap.total_gpus, 2);
        assert_eq!(snap.avg_hashrate, 50.0);
    }

    #[test]
    fn invariant_under_permutation() {
        let a = state("a", 10, 1.5, 1);
        let b = state("b", 20, 2.5, 2);
        let c = state("c", 30, 3.5, 3);
        let fwd = aggregate(&[a.clone(), b.clone(), c.clone()]);
        let rev = aggregate(&[c, a, b]);
        assert_eq!(fwd, rev);
    }

    #[test]
    fn single_instance_matches_its_own_report() {
        let snap = aggregate(&[state("a", 200, 60.0, 0)]);
        assert_eq!(snap.total_instances, 1);
        assert_eq!(snap.total_hashrate, 60.0);
        assert_eq!(snap.total_hashes, 200);
    }
}
