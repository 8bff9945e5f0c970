/**
 * BROADCAST HUB - Fan-out des mises à jour vers les viewers connectés
 *
 * RÔLE : Diffuser chaque changement d'état (rapport accepté, éviction)
 * vers toutes les sessions WebSocket, sans jamais bloquer l'ingestion.
 *
 * FONCTIONNEMENT :
 * - Canal broadcast borné : publish() ne bloque pas, chaque session a
 *   son receiver FIFO indépendant
 * - Session en retard : elle saute ses messages les plus anciens
 *   (Lagged), les autres sessions et les producteurs ne voient rien
 * - Connexion : un initial_data complet, puis les deltas ; un échec
 *   d'envoi est loggé et ne termine que cette session
 * - Resynchronisation = reconnexion (nouvel initial_data)
 */

use crate::aggregate::aggregate;
use crate::http::AppState;
use crate::models::{AggregateSnapshot, InstanceState};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Messages poussés aux viewers, taggés par `type` sur le fil.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PushMessage {
    /// Envoyé une seule fois, à la connexion.
    InitialData {
        instances: Vec<InstanceState>,
        stats: AggregateSnapshot,
    },
    /// Un rapport vient d'être accepté.
    HashrateUpdate {
        instance: InstanceState,
        stats: AggregateSnapshot,
    },
    /// Changement piloté par la liveness (évictions) : liste complète
    /// pour que le viewer retire les instances disparues.
    InstancesUpdate {
        instances: Vec<InstanceState>,
        stats: AggregateSnapshot,
    },
}

pub struct BroadcastHub {
    tx: broadcast::Sender<PushMessage>,
}

impl BroadcastHub {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Best-effort : aucun viewer connecté n'est pas une erreur.
    pub fn publish(&self, msg: PushMessage) {
        let _ = self.tx.send(msg);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PushMessage> {
        self.tx.subscribe()
    }

    pub fn viewer_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

// GET /ws : canal de push vers un viewer
pub async fn ws_handler(ws: WebSocketUpgrade, State(app): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| viewer_session(socket, app))
}

async fn viewer_session(socket: WebSocket, app: AppState) {
    let session_id = Uuid::new_v4();
    // s'abonner avant l'initial sync pour ne pas rater les deltas intermédiaires
    let mut rx = app.hub.subscribe();
    let (mut sink, mut stream) = socket.split();

    let now = OffsetDateTime::now_utc();
    let instances = app.registry.live_instances(now);
    let stats = aggregate(&instances);
    if send_json(&mut sink, &PushMessage::InitialData { instances, stats })
        .await
        .is_err()
    {
        debug!(%session_id, "viewer dropped before initial sync");
        return;
    }
    info!(%session_id, "viewer connected");

    loop {
        tokio::select! {
            msg = rx.recv() => match msg {
                Ok(msg) => {
                    if send_json(&mut sink, &msg).await.is_err() {
                        warn!(%session_id, "delivery failed, dropping viewer session");
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(%session_id, skipped, "slow viewer, oldest updates dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {} // canal unidirectionnel, on ignore le reste
                Some(Err(_)) => break,
            },
        }
    }
    info!(%session_id, "viewer disconnected");
}

async fn send_json(
    sink: &mut SplitSink<WebSocket, Message>,
    msg: &PushMessage,
) -> Result<(), axum::Error> {
    match serde_json::to_string(msg) {
        Ok(payload) => sink.send(Message::Text(payload.into())).await,
        Err(e) => {
            warn!("push message serialization failed: {e}");
            Ok(())
        }
    }
}
