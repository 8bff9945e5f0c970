/**
 * HISTORY STORE - Série temporelle bornée des agrégats de flotte
 *
 * RÔLE : Persistance SQLite append-only des instantanés (ligne flotte +
 * une ligne par instance vivante), pour les courbes de tendance et le
 * résumé 24h du dashboard.
 *
 * FONCTIONNEMENT :
 * - L'écriture est pilotée par le tick périodique du reaper, jamais par
 *   le chemin d'ingestion : la croissance dépend du tick, pas du volume
 *   de rapports
 * - prune() supprime les lignes plus vieilles que la rétention (7 jours
 *   par défaut), idempotent
 * - Best-effort par rapport à l'état vivant : une erreur est loggée et
 *   retentée au tick suivant, jamais propagée vers l'ingestion
 */

use crate::models::{AggregateSnapshot, HistoryPoint, InstanceState};
use crate::state::{new_state, Shared};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    ts INTEGER NOT NULL,
    instance_id TEXT,
    total_instances INTEGER NOT NULL,
    total_hashrate REAL NOT NULL,
    total_hashes INTEGER NOT NULL,
    total_gpus INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_history_instance_ts ON history(instance_id, ts);
CREATE INDEX IF NOT EXISTS idx_history_ts ON history(ts);
";

/// Limite de lignes par requête, héritée du dashboard d'origine.
const QUERY_LIMIT: i64 = 1000;

#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
    #[error("storage unavailable: {0}")]
    Storage(#[from] rusqlite::Error),
}

/// Résumé min/max/moyenne sur une plage temporelle (lignes flotte).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RangeSummary {
    pub samples: u64,
    pub min_hashrate: f64,
    pub max_hashrate: f64,
    pub avg_hashrate: f64,
    /// total_hashes de la dernière ligne flotte moins celui de la première,
    /// plancher à zéro (la flotte peut rétrécir entre deux points).
    pub total_hashes_delta: u64,
    pub unique_instances: u64,
}

pub struct HistoryStore {
    conn: Shared<Connection>,
    retention: Duration,
}

impl HistoryStore {
    pub fn open(path: &str, retention: Duration) -> Result<Self, HistoryError> {
        Self::init(Connection::open(path)?, retention)
    }

    pub fn open_in_memory(retention: Duration) -> Result<Self, HistoryError> {
        Self::init(Connection::open_in_memory()?, retention)
    }

    fn init(conn: Connection, retention: Duration) -> Result<Self, HistoryError> {
        conn.busy_timeout(std::time::Duration::from_millis(5_000))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: new_state(conn),
            retention,
        })
    }

    pub fn retention(&self) -> Duration {
        self.retention
    }

    /// Insère un point unique. Append-only, jamais de mutation après écriture.
    pub fn append(&self, point: &HistoryPoint) -> Result<(), HistoryError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO history (ts, instance_id, total_instances, total_hashrate, total_hashes, total_gpus)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                point.timestamp.unix_timestamp(),
                point.instance_id,
                point.total_instances,
                point.total_hashrate,
                point.total_hashes as i64,
                point.total_gpus,
            ],
        )?;
        Ok(())
    }

    /// Écrit en une transaction la ligne flotte et une ligne par instance
    /// vivante. Appelé par le tick d'enregistrement du reaper.
    pub fn record_snapshot(
        &self,
        now: OffsetDateTime,
        instances: &[InstanceState],
        stats: &AggregateSnapshot,
    ) -> Result<(), HistoryError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO history (ts, instance_id, total_instances, total_hashrate, total_hashes, total_gpus)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            let ts = now.unix_timestamp();
            stmt.execute(params![
                ts,
                Option::<String>::None,
                stats.total_instances,
                stats.total_hashrate,
                stats.total_hashes as i64,
                stats.total_gpus,
            ])?;
            for inst in instances {
                stmt.execute(params![
                    ts,
                    inst.report.instance_id,
                    1u32,
                    inst.report.recent_hashrate,
                    inst.report.total_hashes as i64,
                    inst.report.gpu_count,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Points en ordre chronologique croissant. `instance_id = None` lit la
    /// série flotte, `Some(id)` la série d'une instance.
    pub fn query(
        &self,
        instance_id: Option<&str>,
        since: OffsetDateTime,
        until: OffsetDateTime,
    ) -> Result<Vec<HistoryPoint>, HistoryError> {
        let conn = self.conn.lock();
        let (since, until) = (since.unix_timestamp(), until.unix_timestamp());
        let points = match instance_id {
            Some(id) => {
                let mut stmt = conn.prepare(
                    "SELECT ts, instance_id, total_instances, total_hashrate, total_hashes, total_gpus
                     FROM history
                     WHERE instance_id = ?1 AND ts >= ?2 AND ts <= ?3
                     ORDER BY ts ASC LIMIT ?4",
                )?;
                let rows = stmt.query_map(params![id, since, until, QUERY_LIMIT], row_to_point)?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            }
            None => {
                let mut stmt = conn.prepare(
                    "SELECT ts, instance_id, total_instances, total_hashrate, total_hashes, total_gpus
                     FROM history
                     WHERE instance_id IS NULL AND ts >= ?1 AND ts <= ?2
                     ORDER BY ts ASC LIMIT ?3",
                )?;
                let rows = stmt.query_map(params![since, until, QUERY_LIMIT], row_to_point)?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            }
        };
        Ok(points)
    }

    /// Résumé agrégé de la plage, style "dernières 24h".
    pub fn summary(
        &self,
        since: OffsetDateTime,
        until: OffsetDateTime,
    ) -> Result<RangeSummary, HistoryError> {
        let conn = self.conn.lock();
        let (since, until) = (since.unix_timestamp(), until.unix_timestamp());

        let (samples, min_hashrate, max_hashrate, avg_hashrate) = conn.query_row(
            "SELECT COUNT(*), MIN(total_hashrate), MAX(total_hashrate), AVG(total_hashrate)
             FROM history WHERE instance_id IS NULL AND ts >= ?1 AND ts <= ?2",
            params![since, until],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, Option<f64>>(1)?,
                    row.get::<_, Option<f64>>(2)?,
                    row.get::<_, Option<f64>>(3)?,
                ))
            },
        )?;

        let first_hashes: Option<i64> = conn
            .query_row(
                "SELECT total_hashes FROM history
                 WHERE instance_id IS NULL AND ts >= ?1 AND ts <= ?2
                 ORDER BY ts ASC LIMIT 1",
                params![since, until],
                |row| row.get(0),
            )
            .optional()?;
        let last_hashes: Option<i64> = conn
            .query_row(
                "SELECT total_hashes FROM history
                 WHERE instance_id IS NULL AND ts >= ?1 AND ts <= ?2
                 ORDER BY ts DESC LIMIT 1",
                params![since, until],
                |row| row.get(0),
            )
            .optional()?;

        let unique_instances: i64 = conn.query_row(
            "SELECT COUNT(DISTINCT instance_id) FROM history
             WHERE instance_id IS NOT NULL AND ts >= ?1 AND ts <= ?2",
            params![since, until],
            |row| row.get(0),
        )?;

        let delta = match (first_hashes, last_hashes) {
            (Some(first), Some(last)) => (last - first).max(0) as u64,
            _ => 0,
        };

        Ok(RangeSummary {
            samples: samples.max(0) as u64,
            min_hashrate: min_hashrate.unwrap_or(0.0),
            max_hashrate: max_hashrate.unwrap_or(0.0),
            avg_hashrate: avg_hashrate.unwrap_or(0.0),
            total_hashes_delta: delta,
            unique_instances: unique_instances.max(0) as u64,
        })
    }

    /// Supprime les points plus vieux que `now - retention`. Idempotent.
    pub fn prune(&self, now: OffsetDateTime) -> Result<usize, HistoryError> {
        let cutoff = (now - self.retention).unix_timestamp();
        let conn = self.conn.lock();
        let removed = conn.execute("DELETE FROM history WHERE ts < ?1", params![cutoff])?;
        Ok(removed)
    }

    /// Sonde de santé : la base répond-elle ?
    pub fn ping(&self) -> Result<(), HistoryError> {
        let conn = self.conn.lock();
        conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
        Ok(())
    }
}

fn row_to_point(row: &Row<'_>) -> rusqlite::Result<HistoryPoint> {
    Ok(HistoryPoint {
        timestamp: OffsetDateTime::from_unix_timestamp(row.get::<_, i64>(0)?)
            .unwrap_or(OffsetDateTime::UNIX_EPOCH),
        instance_id: row.get(1)?,
        total_instances: row.get(2)?,
        total_hashrate: row.get(3)?,
        total_hashes: row.get::<_, i64>(4)?.max(0) as u64,
        total_gpus: row.get(5)?,
    })
}
