/**
 * API REST HASHMON - Surface HTTP du moniteur
 *
 * RÔLE : Ingestion des rapports producteurs et lectures dashboard.
 *
 * ROUTES :
 * - POST /api/hashrate             ingestion d'un rapport (400 + kind si invalide)
 * - GET  /api/instances[?all=true] instances vivantes (ou instantané complet)
 * - GET  /api/stats                agrégat de flotte courant
 * - GET  /api/history[?hours=N]    série flotte (24h par défaut)
 * - GET  /api/history/{id}         série d'une instance
 * - GET  /api/summary[?hours=N]    état courant + résumé de plage
 * - GET  /system/health            santé détaillée du process
 * - GET  /health                   sonde de vie (aucune dépendance stockage)
 * - GET  /ws                       canal push viewers
 *
 * L'ingestion n'écrit jamais l'historique : la persistance est pilotée
 * par le tick du reaper.
 */

use crate::aggregate::aggregate;
use crate::config::MonitorConfig;
use crate::health::{HealthTracker, MonitorHealth};
use crate::history::{HistoryError, HistoryStore};
use crate::hub::{BroadcastHub, PushMessage};
use crate::models::{HistoryPoint, InstanceState};
use crate::registry::SharedRegistry;
use crate::validate::validate;
use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use time::{format_description::well_known::Rfc3339, Duration, OffsetDateTime};
use tracing::{error, info, warn};

#[derive(Clone)]
pub struct AppState {
    pub registry: SharedRegistry,
    pub history: Arc<HistoryStore>,
    pub hub: Arc<BroadcastHub>,
    pub health: HealthTracker,
    pub cfg: MonitorConfig,
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/system/health", get(get_system_health))
        .route("/api/hashrate", post(receive_hashrate))
        .route("/api/instances", get(get_instances))
        .route("/api/stats", get(get_stats))
        .route("/api/history", get(get_fleet_history))
        .route("/api/history/{instance_id}", get(get_instance_history))
        .route("/api/summary", get(get_summary))
        .route("/ws", get(crate::hub::ws_handler))
        .with_state(app_state)
}

#[derive(serde::Serialize)]
struct InstanceView {
    instance_id: String,
    total_hashes: u64,
    overall_hashrate: f64,
    recent_hashrate: f64,
    gpu_count: u32,
    gpu_available: bool,
    ip: Option<String>,
    last_seen: String, // RFC3339 pour l'API
    stale: bool,
    age_seconds: i64,
}

fn to_view(state: &InstanceState, now: OffsetDateTime, window: Duration) -> InstanceView {
    let age = now - state.last_seen;
    InstanceView {
        instance_id: state.report.instance_id.clone(),
        total_hashes: state.report.total_hashes,
        overall_hashrate: state.report.overall_hashrate,
        recent_hashrate: state.report.recent_hashrate,
        gpu_count: state.report.gpu_count,
        gpu_available: state.report.gpu_available,
        ip: state.ip.clone(),
        last_seen: state.last_seen.format(&Rfc3339).unwrap_or_default(),
        stale: age >= window,
        age_seconds: age.whole_seconds().max(0),
    }
}

type ApiError = (StatusCode, Json<Value>);

fn storage_error(e: HistoryError) -> ApiError {
    error!("history query failed: {e}");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": e.to_string(), "kind": "storage_unavailable" })),
    )
}

/// Adresse source d'un producteur : premier élément de X-Forwarded-For
/// si un proxy est devant, sinon le pair TCP.
fn client_ip(headers: &HeaderMap, peer: SocketAddr) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| peer.ip().to_string())
}

// POST /api/hashrate (ingestion producteur)
async fn receive_hashrate(
    State(app): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(raw): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let report = validate(&raw).map_err(|e| {
        warn!(kind = e.kind(), "rejected hashrate report: {e}");
        (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": e.to_string(), "kind": e.kind() })),
        )
    })?;

    // last_seen est estampillé ici, après validation, au moment du commit
    let now = OffsetDateTime::now_utc();
    let state = InstanceState {
        report,
        ip: Some(client_ip(&headers, peer)),
        last_seen: now,
    };
    info!(
        instance = %state.report.instance_id,
        hashrate = state.report.recent_hashrate,
        "hashrate report accepted"
    );

    app.registry.upsert(state.clone());
    app.health.mark_report_accepted();

    let stats = aggregate(&app.registry.live_instances(now));
    app.hub.publish(PushMessage::HashrateUpdate {
        instance: state,
        stats,
    });

    Ok(Json(json!({ "status": "success" })))
}

#[derive(Debug, Deserialize)]
struct InstancesParams {
    #[serde(default)]
    all: bool,
}

// GET /api/instances (liste vivante, ?all=true pour l'instantané complet)
async fn get_instances(
    State(app): State<AppState>,
    Query(params): Query<InstancesParams>,
) -> Json<Vec<InstanceView>> {
    let now = OffsetDateTime::now_utc();
    let window = app.registry.liveness_window();
    let list = if params.all {
        app.registry.all()
    } else {
        app.registry.live_instances(now)
    };
    Json(list.iter().map(|s| to_view(s, now, window)).collect())
}

// GET /api/stats (agrégat courant)
async fn get_stats(State(app): State<AppState>) -> Json<crate::models::AggregateSnapshot> {
    let now = OffsetDateTime::now_utc();
    Json(aggregate(&app.registry.live_instances(now)))
}

#[derive(Debug, Deserialize)]
struct RangeParams {
    hours: Option<u64>,
}

fn range_of(params: &RangeParams, now: OffsetDateTime) -> (OffsetDateTime, OffsetDateTime) {
    // borné à un an, la rétention purge bien avant
    let hours = params.hours.unwrap_or(24).clamp(1, 24 * 365);
    (now - Duration::hours(hours as i64), now)
}

// GET /api/history (série flotte)
async fn get_fleet_history(
    State(app): State<AppState>,
    Query(params): Query<RangeParams>,
) -> Result<Json<Vec<HistoryPoint>>, ApiError> {
    let now = OffsetDateTime::now_utc();
    let (since, until) = range_of(&params, now);
    let points = app.history.query(None, since, until).map_err(storage_error)?;
    Ok(Json(points))
}

// GET /api/history/{instance_id}
async fn get_instance_history(
    State(app): State<AppState>,
    Path(instance_id): Path<String>,
    Query(params): Query<RangeParams>,
) -> Result<Json<Vec<HistoryPoint>>, ApiError> {
    let now = OffsetDateTime::now_utc();
    let (since, until) = range_of(&params, now);
    let points = app
        .history
        .query(Some(&instance_id), since, until)
        .map_err(storage_error)?;
    Ok(Json(points))
}

// GET /api/summary (courant + plage)
async fn get_summary(
    State(app): State<AppState>,
    Query(params): Query<RangeParams>,
) -> Result<Json<Value>, ApiError> {
    let now = OffsetDateTime::now_utc();
    let (since, until) = range_of(&params, now);

    let stats = aggregate(&app.registry.live_instances(now));
    let range = app.history.summary(since, until).map_err(storage_error)?;

    Ok(Json(json!({
        "current": {
            "active_instances": stats.total_instances,
            "total_hashrate": stats.total_hashrate,
            "total_gpus": stats.total_gpus,
            "avg_hashrate": stats.avg_hashrate,
        },
        "range": range,
    })))
}

// GET /system/health (état du process)
async fn get_system_health(State(app): State<AppState>) -> Json<MonitorHealth> {
    Json(
        app.health
            .get_health(&app.registry, &app.hub, &app.history, &app.cfg),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::InstanceReport;

    #[test]
    fn view_flags_stale_entries() {
        let now = OffsetDateTime::now_utc();
        let state = InstanceState {
            report: InstanceReport {
                instance_id: "a".into(),
                total_hashes: 1,
                overall_hashrate: 1.0,
                recent_hashrate: 1.0,
                gpu_count: 0,
                gpu_available: false,
                timestamp: now,
            },
            ip: Some("203.0.113.9".into()),
            last_seen: now - Duration::seconds(40),
        };
        let view = to_view(&state, now, Duration::seconds(30));
        assert!(view.stale);
        assert_eq!(view.age_seconds, 40);
        assert_eq!(view.ip.as_deref(), Some("203.0.113.9"));
        assert!(!view.last_seen.is_empty());

        let fresh = InstanceState {
            last_seen: now,
            ..state
        };
        assert!(!to_view(&fresh, now, Duration::seconds(30)).stale);
    }

    // chemin d'ingestion complet hors transport : validation → registre → agrégat
    #[test]
    fn scenario_sequential_reports_keep_last_values() {
        use crate::registry::InstanceRegistry;

        let registry = InstanceRegistry::new(Duration::seconds(30));
        let t0 = OffsetDateTime::now_utc();
        for (hashes, rate, at) in [(100u64, 50.0, t0 - Duration::seconds(1)), (200, 60.0, t0)] {
            let report = validate(&json!({
                "instance_id": "a",
                "total_hashes": hashes,
                "recent_hashrate": rate,
                "gpu_count": 0,
                "gpu_available": false,
            }))
            .unwrap();
            registry.upsert(InstanceState {
                report,
                ip: None,
                last_seen: at,
            });
        }

        let live = registry.live_instances(t0);
        assert_eq!(live.len(), 1);
        let stats = aggregate(&live);
        assert_eq!(stats.total_instances, 1);
        assert_eq!(stats.total_hashrate, 60.0);
        assert_eq!(stats.total_hashes, 200);
    }

    #[test]
    fn client_ip_prefers_forwarded_header() {
        let peer: SocketAddr = "192.0.2.10:5432".parse().unwrap();

        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "203.0.113.9, 10.0.0.1".parse().unwrap());
        assert_eq!(client_ip(&headers, peer), "203.0.113.9");

        // sans proxy devant, on retombe sur le pair TCP
        assert_eq!(client_ip(&HeaderMap::new(), peer), "192.0.2.10");

        // un en-tête vide ne masque pas le pair
        let mut empty = HeaderMap::new();
        empty.insert("x-forwarded-for", "".parse().unwrap());
        assert_eq!(client_ip(&empty, peer), "192.0.2.10");
    }

    #[test]
    fn range_defaults_to_last_24_hours() {
        let now = OffsetDateTime::now_utc();
        let (since, until) = range_of(&RangeParams { hours: None }, now);
        assert_eq!(until - since, Duration::hours(24));
        let (since, _) = range_of(&RangeParams { hours: Some(0) }, now);
        assert_eq!(now - since, Duration::hours(1)); // clampé
    }
}
