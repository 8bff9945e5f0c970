/**
 * HASHMON KERNEL - Point d'entrée du serveur de monitoring
 *
 * RÔLE : Bootstrap complet : config, registre d'instances, historique
 * SQLite, hub de diffusion, reaper périodique, puis serveur HTTP axum.
 *
 * ARCHITECTURE : ingestion REST → validation → registre → agrégat →
 * push WebSocket ; entretien (éviction, historique, purge) par tâches
 * de fond indépendantes.
 */

mod aggregate;
mod config;
mod health;
mod history;
mod http;
mod hub;
mod models;
mod reaper;
mod registry;
mod state;
mod validate;

use crate::health::HealthTracker;
use crate::history::HistoryStore;
use crate::http::AppState;
use crate::hub::BroadcastHub;
use crate::registry::{InstanceRegistry, SharedRegistry};
use anyhow::Context;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // .env facultatif, puis logs pilotés par RUST_LOG
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cfg = config::load_config().await;
    info!(
        port = cfg.port,
        database = %cfg.database_path,
        liveness_window = cfg.liveness_window_seconds,
        retention_days = cfg.retention_days,
        "configuration loaded"
    );

    let registry: SharedRegistry = Arc::new(InstanceRegistry::new(cfg.liveness_window()));
    let history = Arc::new(
        HistoryStore::open(&cfg.database_path, cfg.retention())
            .with_context(|| format!("failed to open history store at {}", cfg.database_path))?,
    );
    let hub = Arc::new(BroadcastHub::new(cfg.broadcast_capacity));
    let health = HealthTracker::new();

    reaper::spawn_liveness_sweep(
        registry.clone(),
        hub.clone(),
        health.clone(),
        Duration::from_secs(cfg.liveness_sweep_seconds),
    );
    reaper::spawn_history_recorder(
        registry.clone(),
        history.clone(),
        Duration::from_secs(cfg.history_interval_seconds),
    );
    reaper::spawn_retention_sweep(
        history.clone(),
        health.clone(),
        Duration::from_secs(cfg.retention_sweep_seconds),
    );

    let addr = SocketAddr::from(([0, 0, 0, 0], cfg.port));
    let app = http::build_router(AppState {
        registry,
        history,
        hub,
        health,
        cfg,
    });

    info!(%addr, "hashmon kernel listening");
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    // ConnectInfo expose le pair TCP aux handlers (adresse source des producteurs)
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .context("server exited")?;
    Ok(())
}
