//! Topic-scoped WebSocket relay standing in for a public pub/sub broker.
//!
//! Every text frame a socket sends is fanned out to every socket on the same
//! topic, the sender included. The relay never looks inside frames.

use std::collections::HashMap;
use std::sync::Arc;

use axum::Router;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::{SinkExt, StreamExt};
use tokio::sync::broadcast;
use tower_http::cors::CorsLayer;

const TOPIC_CAPACITY: usize = 256;

/// Registry holds all live topics.
#[derive(Default)]
pub struct Registry {
    /// topic -> fan-out channel
    topics: DashMap<String, broadcast::Sender<String>>,
    /// topic -> socket_id of the host
    hosts: DashMap<String, String>,
}

impl Registry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Subscribes to `topic`, creating it if needed. The receiver is taken
    /// while the entry is locked so a concurrent cleanup cannot drop the
    /// topic in between.
    fn subscribe(&self, topic: &str) -> (broadcast::Sender<String>, broadcast::Receiver<String>) {
        let tx = self
            .topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0);
        let rx = tx.subscribe();
        (tx.clone(), rx)
    }

    /// Claims `topic` for a host socket. Fails if another host holds it.
    fn claim_host(&self, topic: &str, socket_id: &str) -> bool {
        match self.hosts.entry(topic.to_string()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(socket_id.to_string());
                true
            }
        }
    }

    fn release_host(&self, topic: &str, socket_id: &str) {
        self.hosts.remove_if(topic, |_, owner| owner == socket_id);
    }

    fn drop_if_empty(&self, topic: &str) {
        if self.topics.remove_if(topic, |_, tx| tx.receiver_count() == 0).is_some() {
            tracing::debug!("Topic {} removed", topic);
        }
    }
}

pub fn router(registry: Arc<Registry>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .layer(CorsLayer::permissive())
        .with_state(registry)
}

/// Binds `port` on all interfaces and serves until the process exits.
pub async fn serve(port: u16) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;
    tracing::info!("Bitwin relay running on port {}", port);
    axum::serve(listener, router(Registry::new())).await
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(registry): State<Arc<Registry>>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let Some(topic) = params.get("topic").filter(|t| !t.is_empty()).cloned() else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    let is_host = params.get("role").is_some_and(|r| r == "host");
    let socket_id = uuid::Uuid::new_v4().to_string();

    if is_host && !registry.claim_host(&topic, &socket_id) {
        tracing::warn!("Refused second host on {}", topic);
        return StatusCode::CONFLICT.into_response();
    }

    // Subscribe before the upgrade response so the client never misses
    // frames published right after its connect resolves.
    let (tx, rx) = registry.subscribe(&topic);

    let failed_registry = registry.clone();
    let failed_topic = topic.clone();
    let failed_socket = socket_id.clone();
    ws.on_failed_upgrade(move |e| {
        tracing::warn!("WebSocket upgrade failed: {}", e);
        failed_registry.release_host(&failed_topic, &failed_socket);
    })
    .on_upgrade(move |socket| handle_socket(socket, registry, Peer { topic, socket_id, is_host, tx, rx }))
}

/// One upgraded socket and its place on a topic.
struct Peer {
    topic: String,
    socket_id: String,
    is_host: bool,
    tx: broadcast::Sender<String>,
    rx: broadcast::Receiver<String>,
}

async fn handle_socket(socket: WebSocket, registry: Arc<Registry>, peer: Peer) {
    let Peer {
        topic,
        socket_id,
        is_host,
        tx,
        mut rx,
    } = peer;
    let (mut sender, mut receiver) = socket.split();

    tracing::info!("WebSocket connected: {} on {} (host: {})", socket_id, topic, is_host);

    // Forward topic traffic to this socket.
    let forward_task = tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(frame) => {
                    if sender.send(Message::Text(frame.into())).await.is_err() {
                        return;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("Socket lagged, {} frames dropped", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    });

    // Publish whatever this socket sends.
    while let Some(Ok(msg)) = receiver.next().await {
        match msg {
            Message::Text(text) => {
                let _ = tx.send(text.to_string());
            }
            Message::Close(_) => break,
            _ => continue,
        }
    }

    tracing::info!("WebSocket disconnected: {}", socket_id);
    forward_task.abort();
    let _ = forward_task.await;
    drop(tx);

    if is_host {
        registry.release_host(&topic, &socket_id);
    }
    registry.drop_if_empty(&topic);
}
