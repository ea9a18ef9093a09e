//! Session service: room lifecycle, sender tagging, self-echo filtering and
//! fan-out of inbound messages to listeners.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::config::Settings;
use crate::error::SessionError;
use crate::transport::{Connector, Transport};
use crate::types::*;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

type Listeners = DashMap<u64, mpsc::UnboundedSender<Message>>;

/// Inbound messages for one listener. Dropping it unsubscribes.
pub struct Subscription {
    id: u64,
    listeners: Weak<Listeners>,
    rx: mpsc::UnboundedReceiver<Message>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<Message> {
        self.rx.recv().await
    }

    #[cfg(test)]
    pub fn try_recv(&mut self) -> Option<Message> {
        self.rx.try_recv().ok()
    }

    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(listeners) = self.listeners.upgrade() {
            listeners.remove(&self.id);
        }
    }
}

/// A live connection to one room.
struct Link {
    room: RoomCode,
    out_tx: mpsc::UnboundedSender<String>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
    resend_task: Option<JoinHandle<()>>,
}

impl Drop for Link {
    fn drop(&mut self) {
        if let Some(task) = self.resend_task.take() {
            task.abort();
        }
    }
}

pub struct SessionService<C: Connector> {
    connector: C,
    settings: Settings,
    session_id: String,
    listeners: Arc<Listeners>,
    next_listener: AtomicU64,
    link: Option<Link>,
}

impl<C: Connector> SessionService<C> {
    pub fn new(connector: C, settings: Settings) -> Self {
        let session_id = uuid::Uuid::new_v4().simple().to_string();
        tracing::info!("Session service initialized with ID: {}", session_id);
        Self {
            connector,
            settings,
            session_id,
            listeners: Arc::new(DashMap::new()),
            next_listener: AtomicU64::new(0),
            link: None,
        }
    }

    pub fn generate_room_code(&self) -> RoomCode {
        RoomCode::generate(&mut rand::rng())
    }

    /// Room this service is currently connected to.
    pub fn room(&self) -> Option<&RoomCode> {
        self.link.as_ref().map(|l| &l.room)
    }

    pub fn is_connected(&self) -> bool {
        self.link.as_ref().is_some_and(|l| !l.out_tx.is_closed())
    }

    /// Registers a listener for every inbound message not sent by us.
    pub fn subscribe(&self) -> Subscription {
        let id = self.next_listener.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners.insert(id, tx);
        Subscription {
            id,
            listeners: Arc::downgrade(&self.listeners),
            rx,
        }
    }

    /// Makes this client the addressable endpoint for `room`.
    pub async fn host(&mut self, room: RoomCode, player: &Player) -> Result<(), SessionError> {
        self.disconnect().await;
        let topic = self.settings.topic(&room);
        let transport = self.connector.connect(&topic, Role::Host).await?;
        self.open_link(transport, room, Arc::new(AtomicBool::new(false)));
        tracing::info!("Hosting {} as {}", topic, player.name);
        Ok(())
    }

    /// Connects to `room` and publishes a JOIN. Resolves once the JOIN is
    /// handed to the transport; there is no acknowledgment from the host.
    pub async fn join_room(&mut self, room: RoomCode, player: &Player) -> Result<(), SessionError> {
        self.disconnect().await;
        let topic = self.settings.topic(&room);
        let transport = self.connector.connect(&topic, Role::Joiner).await?;
        let heard_peer = Arc::new(AtomicBool::new(false));
        self.open_link(transport, room.clone(), heard_peer.clone());
        tracing::info!("Joined {} as {}", topic, player.name);

        let join = Message::Join(JoinPayload {
            room_id: room,
            player_name: player.name.clone(),
            player_avatar: player.avatar.clone(),
        });
        let frame = self.encode(&join)?;
        self.push(frame.clone())?;

        if self.settings.join_attempts > 1 {
            let resend = spawn_join_resend(
                self.link_sender()?,
                frame,
                heard_peer,
                self.settings.join_attempts - 1,
                self.settings.join_retry_interval(),
            );
            if let Some(link) = self.link.as_mut() {
                link.resend_task = Some(resend);
            }
        }
        Ok(())
    }

    /// Publishes `message` to the current room.
    pub fn send(&self, message: Message) -> Result<(), SessionError> {
        tracing::debug!("Sending {}", message.kind());
        let frame = self.encode(&message)?;
        self.push(frame)
    }

    pub fn start_game(&self, config: RoundConfig) -> Result<(), SessionError> {
        self.send(Message::StartGame(config))
    }

    pub fn send_finished(&self, attempts: u32) -> Result<(), SessionError> {
        let room_id = self.current_room()?;
        self.send(Message::PlayerFinished(FinishedPayload { room_id, attempts }))
    }

    pub fn restart_game(&self) -> Result<(), SessionError> {
        let room_id = self.current_room()?;
        self.send(Message::Restart(RoomPayload { room_id }))
    }

    pub fn request_rematch(&self, requester_name: &str) -> Result<(), SessionError> {
        let room_id = self.current_room()?;
        self.send(Message::RematchRequest(RematchPayload {
            room_id,
            requester_name: requester_name.to_string(),
        }))
    }

    pub fn accept_rematch(&self) -> Result<(), SessionError> {
        let room_id = self.current_room()?;
        self.send(Message::RematchAccepted(RoomPayload { room_id }))
    }

    pub fn decline_rematch(&self) -> Result<(), SessionError> {
        let room_id = self.current_room()?;
        self.send(Message::RematchDeclined(RoomPayload { room_id }))
    }

    pub fn send_power_up_effect(&self, effect: Effect, duration: Duration) -> Result<(), SessionError> {
        let room_id = self.current_room()?;
        self.send(Message::PowerUpEffect(EffectPayload {
            room_id,
            effect,
            duration: duration.as_millis() as u64,
        }))
    }

    /// Releases the transport. Safe to call when not connected.
    pub async fn disconnect(&mut self) {
        let Some(mut link) = self.link.take() else {
            return;
        };
        if let Some(task) = link.resend_task.take() {
            task.abort();
        }
        if let Some(shutdown) = link.shutdown_tx.take() {
            let _ = shutdown.send(());
        }
        let task = &mut link.task;
        if tokio::time::timeout(SHUTDOWN_TIMEOUT, &mut *task).await.is_err() {
            tracing::warn!("Transport task did not stop in time, aborting");
            task.abort();
        }
        tracing::info!("Disconnected from {}", link.room);
    }

    fn open_link(&mut self, transport: Box<dyn Transport>, room: RoomCode, heard_peer: Arc<AtomicBool>) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(transport_loop(
            transport,
            out_rx,
            shutdown_rx,
            self.session_id.clone(),
            self.listeners.clone(),
            heard_peer,
        ));
        self.link = Some(Link {
            room,
            out_tx,
            shutdown_tx: Some(shutdown_tx),
            task,
            resend_task: None,
        });
    }

    fn current_room(&self) -> Result<RoomCode, SessionError> {
        self.room().cloned().ok_or(SessionError::NotConnected)
    }

    fn link_sender(&self) -> Result<mpsc::UnboundedSender<String>, SessionError> {
        self.link
            .as_ref()
            .map(|l| l.out_tx.clone())
            .ok_or(SessionError::NotConnected)
    }

    fn encode(&self, message: &Message) -> Result<String, SessionError> {
        let envelope = Envelope {
            sender_id: Some(self.session_id.clone()),
            message: message.clone(),
        };
        Ok(serde_json::to_string(&envelope)?)
    }

    fn push(&self, frame: String) -> Result<(), SessionError> {
        let Some(link) = self.link.as_ref() else {
            tracing::warn!("Cannot send, not connected");
            return Err(SessionError::NotConnected);
        };
        link.out_tx.send(frame).map_err(|_| {
            tracing::warn!("Cannot send, transport closed");
            SessionError::NotConnected
        })
    }
}

/// Re-publishes a JOIN until the peer is heard from or attempts run out.
fn spawn_join_resend(
    out_tx: mpsc::UnboundedSender<String>,
    frame: String,
    heard_peer: Arc<AtomicBool>,
    resends: u32,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        for attempt in 1..=resends {
            tokio::time::sleep(interval).await;
            if heard_peer.load(Ordering::Acquire) {
                return;
            }
            tracing::debug!("Resending JOIN ({}/{})", attempt, resends);
            if out_tx.send(frame.clone()).is_err() {
                return;
            }
        }
    })
}

/// Moves frames between the transport and the service until shutdown or
/// until the transport goes away.
async fn transport_loop(
    mut transport: Box<dyn Transport>,
    mut out_rx: mpsc::UnboundedReceiver<String>,
    mut shutdown_rx: oneshot::Receiver<()>,
    session_id: String,
    listeners: Arc<Listeners>,
    heard_peer: Arc<AtomicBool>,
) {
    loop {
        tokio::select! {
            biased;

            // Queued frames go out before a shutdown is honored.
            frame = out_rx.recv() => {
                let Some(frame) = frame else {
                    let _ = transport.close().await;
                    break;
                };
                if let Err(e) = transport.send(frame).await {
                    tracing::error!("Transport send error: {}", e);
                    break;
                }
            }

            _ = &mut shutdown_rx => {
                let _ = transport.close().await;
                break;
            }

            incoming = transport.recv() => {
                match incoming {
                    Some(Ok(frame)) => {
                        let envelope: Envelope = match serde_json::from_str(&frame) {
                            Ok(e) => e,
                            Err(e) => {
                                tracing::warn!("Failed to parse message: {}", e);
                                continue;
                            }
                        };
                        if envelope.sender_id.as_deref() == Some(session_id.as_str()) {
                            continue;
                        }
                        tracing::debug!(
                            "Received {} from {}",
                            envelope.message.kind(),
                            envelope.sender_id.as_deref().unwrap_or("peer")
                        );
                        heard_peer.store(true, Ordering::Release);
                        fan_out(&listeners, envelope.message);
                    }
                    Some(Err(e)) => {
                        tracing::error!("Transport receive error: {}", e);
                        break;
                    }
                    None => {
                        tracing::info!("Transport closed by remote");
                        break;
                    }
                }
            }
        }
    }
}

fn fan_out(listeners: &Listeners, message: Message) {
    listeners.retain(|_, tx| tx.send(message.clone()).is_ok());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LocalBus;

    fn room() -> RoomCode {
        RoomCode::parse("AB3XZ").unwrap()
    }

    fn player(name: &str) -> Player {
        Player::new(name, "🐸").unwrap()
    }

    async fn next(sub: &mut Subscription) -> Message {
        tokio::time::timeout(Duration::from_secs(2), sub.recv())
            .await
            .expect("timed out waiting for message")
            .expect("subscription closed")
    }

    async fn assert_silent(sub: &mut Subscription) {
        let got = tokio::time::timeout(Duration::from_millis(100), sub.recv()).await;
        assert!(got.is_err(), "unexpected message: {:?}", got);
    }

    #[tokio::test]
    async fn join_is_delivered_to_host_only() {
        let bus = LocalBus::new();
        let mut host = SessionService::new(bus.clone(), Settings::default());
        let mut joiner = SessionService::new(bus, Settings::default());
        let mut host_inbox = host.subscribe();
        let mut joiner_inbox = joiner.subscribe();

        host.host(room(), &player("ana")).await.unwrap();
        joiner.join_room(room(), &player("bob")).await.unwrap();

        let Message::Join(join) = next(&mut host_inbox).await else {
            panic!("expected JOIN");
        };
        assert_eq!(join.player_name, "BOB");
        assert_eq!(join.room_id, room());
        // The joiner's own JOIN echo is filtered out.
        assert_silent(&mut joiner_inbox).await;
    }

    #[tokio::test]
    async fn every_listener_gets_a_copy() {
        let bus = LocalBus::new();
        let mut host = SessionService::new(bus.clone(), Settings::default());
        let mut joiner = SessionService::new(bus, Settings::default());
        let mut first = joiner.subscribe();
        let mut second = joiner.subscribe();

        host.host(room(), &player("ana")).await.unwrap();
        joiner.join_room(room(), &player("bob")).await.unwrap();
        host.send_finished(4).unwrap();

        for inbox in [&mut first, &mut second] {
            assert_eq!(
                next(inbox).await,
                Message::PlayerFinished(FinishedPayload {
                    room_id: room(),
                    attempts: 4
                })
            );
        }
    }

    #[tokio::test]
    async fn unsubscribed_listener_is_removed() {
        let bus = LocalBus::new();
        let mut host = SessionService::new(bus.clone(), Settings::default());
        let mut joiner = SessionService::new(bus, Settings::default());
        let kept = joiner.subscribe();
        let dropped = joiner.subscribe();
        assert_eq!(joiner.listeners.len(), 2);
        dropped.unsubscribe();
        assert_eq!(joiner.listeners.len(), 1);

        host.host(room(), &player("ana")).await.unwrap();
        joiner.join_room(room(), &player("bob")).await.unwrap();
        host.restart_game().unwrap();
        let mut kept = kept;
        assert_eq!(next(&mut kept).await, Message::Restart(RoomPayload { room_id: room() }));
    }

    #[tokio::test]
    async fn second_host_fails() {
        let bus = LocalBus::new();
        let mut first = SessionService::new(bus.clone(), Settings::default());
        let mut second = SessionService::new(bus, Settings::default());
        first.host(room(), &player("ana")).await.unwrap();
        let err = second.host(room(), &player("eve")).await.unwrap_err();
        assert!(matches!(err, SessionError::Transport(crate::error::TransportError::HostTaken)));
        assert!(!second.is_connected());
    }

    #[tokio::test]
    async fn disconnect_is_idempotent_and_stops_traffic() {
        let bus = LocalBus::new();
        let mut host = SessionService::new(bus.clone(), Settings::default());
        let mut joiner = SessionService::new(bus, Settings::default());
        let mut joiner_inbox = joiner.subscribe();

        host.host(room(), &player("ana")).await.unwrap();
        joiner.join_room(room(), &player("bob")).await.unwrap();
        joiner.disconnect().await;
        joiner.disconnect().await;

        assert!(!joiner.is_connected());
        assert!(matches!(joiner.send_finished(1), Err(SessionError::NotConnected)));
        host.send_finished(2).unwrap();
        assert_silent(&mut joiner_inbox).await;

        // The host claim is released, so the room can be hosted again.
        host.disconnect().await;
        host.host(room(), &player("ana")).await.unwrap();
    }

    #[tokio::test]
    async fn join_resends_until_host_answers() {
        let settings = Settings {
            join_attempts: 3,
            join_retry_ms: 20,
            ..Settings::default()
        };
        let bus = LocalBus::new();
        let mut host = SessionService::new(bus.clone(), settings.clone());
        let mut joiner = SessionService::new(bus, settings);
        let mut host_inbox = host.subscribe();

        host.host(room(), &player("ana")).await.unwrap();
        joiner.join_room(room(), &player("bob")).await.unwrap();

        assert!(matches!(next(&mut host_inbox).await, Message::Join(_)));
        assert!(matches!(next(&mut host_inbox).await, Message::Join(_)));
        host.restart_game().unwrap();
        // One resend may already be in flight when the host answers.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let mut extra = 0;
        while host_inbox.try_recv().is_some() {
            extra += 1;
        }
        assert!(extra <= 1);
    }

    #[tokio::test]
    async fn foreign_frames_without_sender_are_delivered() {
        let bus = LocalBus::new();
        let mut service = SessionService::new(bus.clone(), Settings::default());
        let mut inbox = service.subscribe();
        service.host(room(), &player("ana")).await.unwrap();

        let mut raw = bus
            .connect(&Settings::default().topic(&room()), Role::Joiner)
            .await
            .unwrap();
        raw.send("not json".into()).await.unwrap();
        raw.send(r#"{"type":"RESTART","payload":{"roomId":"AB3XZ"}}"#.into())
            .await
            .unwrap();
        assert_eq!(next(&mut inbox).await, Message::Restart(RoomPayload { room_id: room() }));
    }
}
