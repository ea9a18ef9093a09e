//! Room-scoped publish/subscribe transports.
//!
//! A [`Connector`] opens a [`Transport`] bound to one topic. Every frame sent
//! on a transport is delivered to every transport open on the same topic,
//! the sender included, with no ordering or delivery guarantee beyond what
//! the underlying channel happens to give.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::error::TransportError;
use crate::types::Role;

const LOCAL_CHANNEL_CAPACITY: usize = 256;

/// A connection to one topic. Frames are JSON text.
#[async_trait]
pub trait Transport: Send {
    async fn send(&mut self, frame: String) -> Result<(), TransportError>;

    /// Next inbound frame; `None` once the transport is closed.
    async fn recv(&mut self) -> Option<Result<String, TransportError>>;

    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Opens transports. Resolves once the topic subscription is live.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// A `Host` connection claims the topic; a second claim fails with
    /// [`TransportError::HostTaken`] until the first host closes.
    async fn connect(&self, topic: &str, role: Role) -> Result<Box<dyn Transport>, TransportError>;
}

// ─── In-process bus ───────────────────────────────────────────────

/// Shared in-process bus. Clones see the same topics.
#[derive(Clone, Default)]
pub struct LocalBus {
    topics: Arc<DashMap<String, broadcast::Sender<String>>>,
    hosts: Arc<DashSet<String>>,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn channel(&self, topic: &str) -> broadcast::Sender<String> {
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(LOCAL_CHANNEL_CAPACITY).0)
            .clone()
    }
}

#[async_trait]
impl Connector for LocalBus {
    async fn connect(&self, topic: &str, role: Role) -> Result<Box<dyn Transport>, TransportError> {
        let host_claim = if role == Role::Host {
            if !self.hosts.insert(topic.to_string()) {
                return Err(TransportError::HostTaken);
            }
            Some(HostClaim {
                hosts: self.hosts.clone(),
                topic: topic.to_string(),
            })
        } else {
            None
        };

        let tx = self.channel(topic);
        let rx = tx.subscribe();
        tracing::debug!("Local transport opened on {} as {}", topic, role);
        Ok(Box::new(LocalTransport {
            tx: Some(tx),
            rx,
            _host_claim: host_claim,
        }))
    }
}

/// Releases a host claim when dropped.
struct HostClaim {
    hosts: Arc<DashSet<String>>,
    topic: String,
}

impl Drop for HostClaim {
    fn drop(&mut self) {
        self.hosts.remove(&self.topic);
    }
}

struct LocalTransport {
    tx: Option<broadcast::Sender<String>>,
    rx: broadcast::Receiver<String>,
    _host_claim: Option<HostClaim>,
}

#[async_trait]
impl Transport for LocalTransport {
    async fn send(&mut self, frame: String) -> Result<(), TransportError> {
        let tx = self.tx.as_ref().ok_or(TransportError::Closed)?;
        // No receivers just means nobody is listening; the frame is lost.
        let _ = tx.send(frame);
        Ok(())
    }

    async fn recv(&mut self) -> Option<Result<String, TransportError>> {
        self.tx.as_ref()?;
        loop {
            match self.rx.recv().await {
                Ok(frame) => return Some(Ok(frame)),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("Local transport lagged, {} frames lost", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.tx = None;
        self._host_claim = None;
        Ok(())
    }
}

// ─── WebSocket relay client ───────────────────────────────────────

/// Connects to a [`relay`](crate::relay) over WebSocket.
#[derive(Debug, Clone)]
pub struct RelayConnector {
    base_url: String,
}

impl RelayConnector {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, topic: &str, role: Role) -> String {
        format!("{}/ws?topic={}&role={}", self.base_url, topic, role)
    }
}

#[async_trait]
impl Connector for RelayConnector {
    async fn connect(&self, topic: &str, role: Role) -> Result<Box<dyn Transport>, TransportError> {
        let url = self.url(topic, role);
        let (stream, _) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| match e {
                tokio_tungstenite::tungstenite::Error::Http(ref resp)
                    if resp.status() == tokio_tungstenite::tungstenite::http::StatusCode::CONFLICT =>
                {
                    TransportError::HostTaken
                }
                other => TransportError::WebSocket(other),
            })?;
        tracing::info!("Connected to relay {} on {}", self.base_url, topic);
        Ok(Box::new(RelayTransport { stream }))
    }
}

struct RelayTransport {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Transport for RelayTransport {
    async fn send(&mut self, frame: String) -> Result<(), TransportError> {
        self.stream.send(WsMessage::Text(frame.into())).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Option<Result<String, TransportError>> {
        loop {
            match self.stream.next().await? {
                Ok(WsMessage::Text(text)) => return Some(Ok(text.to_string())),
                Ok(WsMessage::Close(_)) => return None,
                Ok(_) => continue,
                Err(e) => return Some(Err(e.into())),
            }
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        match self.stream.close(None).await {
            Ok(()) | Err(tokio_tungstenite::tungstenite::Error::ConnectionClosed) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
