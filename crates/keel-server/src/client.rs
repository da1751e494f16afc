use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use keel_core::Topic;

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
pub const CLIENT_TIMEOUT: Duration = Duration::from_secs(90);

/// Unique client identifier.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ClientId(pub String);

impl Default for ClientId {
    fn default() -> Self {
        Self(format!("client_{}", Uuid::now_v7()))
    }
}

impl ClientId {
    pub fn new() -> Self {
        Self::default()
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A connected observer.
pub struct Client {
    pub id: ClientId,
    tx: mpsc::Sender<String>,
    authenticated: AtomicBool,
    topics: Mutex<HashSet<Topic>>,
    last_pong: AtomicU64,
}

impl Client {
    fn new(id: ClientId, tx: mpsc::Sender<String>, authenticated: bool) -> Self {
        Self {
            id,
            tx,
            authenticated: AtomicBool::new(authenticated),
            topics: Mutex::new(HashSet::new()),
            last_pong: AtomicU64::new(now_secs()),
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::Relaxed)
    }

    pub fn set_authenticated(&self, value: bool) {
        self.authenticated.store(value, Ordering::Relaxed);
    }

    /// Returns false when the topic was already subscribed.
    pub fn subscribe(&self, topic: Topic) -> bool {
        self.topics.lock().insert(topic)
    }

    pub fn unsubscribe(&self, topic: Topic) -> bool {
        self.topics.lock().remove(&topic)
    }

    pub fn is_subscribed(&self, topic: Topic) -> bool {
        self.topics.lock().contains(&topic)
    }

    pub fn record_pong(&self) {
        self.last_pong.store(now_secs(), Ordering::Relaxed);
    }

    pub fn is_alive(&self) -> bool {
        let last = self.last_pong.load(Ordering::Relaxed);
        now_secs().saturating_sub(last) < CLIENT_TIMEOUT.as_secs()
    }

    /// Queue a frame without waiting. A full queue drops the frame.
    pub fn send(&self, message: String) -> bool {
        match self.tx.try_send(message) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(msg)) => {
                tracing::warn!(
                    client_id = %self.id,
                    msg_len = msg.len(),
                    "send queue full, dropping message"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Registry of all connected observers.
pub struct ClientRegistry {
    clients: DashMap<ClientId, Arc<Client>>,
    max_send_queue: usize,
}

impl ClientRegistry {
    pub fn new(max_send_queue: usize) -> Self {
        Self {
            clients: DashMap::new(),
            max_send_queue,
        }
    }

    /// Register a new client and return its id plus the receiving end of
    /// its send queue. `authenticated` is true when the hub has no secret.
    pub fn register(&self, authenticated: bool) -> (ClientId, mpsc::Receiver<String>) {
        let id = ClientId::new();
        let (tx, rx) = mpsc::channel(self.max_send_queue.max(1));
        let client = Arc::new(Client::new(id.clone(), tx, authenticated));
        self.clients.insert(id.clone(), client);
        (id, rx)
    }

    /// Remove a client, releasing its subscriptions.
    pub fn unregister(&self, id: &ClientId) -> bool {
        match self.clients.remove(id) {
            Some((_, client)) => {
                client.topics.lock().clear();
                true
            }
            None => false,
        }
    }

    pub fn get(&self, id: &ClientId) -> Option<Arc<Client>> {
        self.clients.get(id).map(|c| Arc::clone(c.value()))
    }

    /// Fan a frame out to every client subscribed to `topic`.
    /// Returns the number of clients it was queued for.
    pub fn broadcast(&self, topic: Topic, message: &str) -> usize {
        let targets: Vec<Arc<Client>> = self
            .clients
            .iter()
            .filter(|entry| entry.value().is_subscribed(topic))
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        targets
            .iter()
            .filter(|client| client.send(message.to_string()))
            .count()
    }

    /// Number of connected clients.
    pub fn count(&self) -> usize {
        self.clients.len()
    }

    /// Remove clients that haven't answered a ping within the timeout.
    pub fn cleanup_dead_clients(&self) -> usize {
        let dead: Vec<ClientId> = self
            .clients
            .iter()
            .filter(|entry| !entry.value().is_alive())
            .map(|entry| entry.key().clone())
            .collect();

        let mut removed = 0;
        for id in dead {
            if self.unregister(&id) {
                removed += 1;
                tracing::info!(client_id = %id, "cleaned up dead client");
            }
        }
        removed
    }
}

/// Drive one WebSocket: a writer draining the send queue (plus heartbeat
/// pings) and a reader forwarding text frames to the hub.
pub async fn handle_ws_connection(
    socket: WebSocket,
    client_id: ClientId,
    mut rx: mpsc::Receiver<String>,
    registry: Arc<ClientRegistry>,
    on_message: mpsc::Sender<(ClientId, String)>,
    shutdown: CancellationToken,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let writer_cid = client_id.clone();
    let writer = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(HEARTBEAT_INTERVAL);
        ping_interval.tick().await;

        loop {
            tokio::select! {
                msg = rx.recv() => {
                    let Some(text) = msg else { break };
                    if ws_tx.send(WsMessage::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                _ = ping_interval.tick() => {
                    if ws_tx.send(WsMessage::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                    tracing::trace!(client_id = %writer_cid, "sent ping");
                }
            }
        }
        let _ = ws_tx.close().await;
    });

    let reader_cid = client_id.clone();
    let reader_registry = Arc::clone(&registry);
    let reader = tokio::spawn(async move {
        while let Some(frame) = ws_rx.next().await {
            let msg = match frame {
                Ok(msg) => msg,
                Err(e) => {
                    tracing::debug!(client_id = %reader_cid, error = %e, "socket error");
                    break;
                }
            };
            match msg {
                WsMessage::Text(text) => {
                    if on_message
                        .send((reader_cid.clone(), text.to_string()))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                WsMessage::Pong(_) => {
                    if let Some(client) = reader_registry.get(&reader_cid) {
                        client.record_pong();
                    }
                }
                WsMessage::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = writer => {},
        _ = reader => {},
        _ = shutdown.cancelled() => {},
    }

    registry.unregister(&client_id);
    tracing::info!(client_id = %client_id, "client disconnected");
}

/// Periodically drop clients whose heartbeat has lapsed.
pub fn start_cleanup_task(
    registry: Arc<ClientRegistry>,
    interval: Duration,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let removed = registry.cleanup_dead_clients();
                    if removed > 0 {
                        tracing::info!(removed, "dead client cleanup");
                    }
                }
                _ = shutdown.cancelled() => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_id_unique() {
        let a = ClientId::new();
        let b = ClientId::new();
        assert_ne!(a, b);
        assert!(a.0.starts_with("client_"));
    }

    #[test]
    fn register_and_unregister() {
        let registry = ClientRegistry::new(32);
        let (id1, _rx1) = registry.register(true);
        let (id2, _rx2) = registry.register(false);
        assert_eq!(registry.count(), 2);
        assert!(registry.get(&id1).unwrap().is_authenticated());
        assert!(!registry.get(&id2).unwrap().is_authenticated());

        assert!(registry.unregister(&id1));
        assert!(!registry.unregister(&id1));
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn broadcast_reaches_only_subscribers() {
        let registry = ClientRegistry::new(32);
        let (id1, mut rx1) = registry.register(true);
        let (id2, mut rx2) = registry.register(true);
        let (_id3, mut rx3) = registry.register(true);

        registry.get(&id1).unwrap().subscribe(Topic::SessionStatus);
        registry.get(&id2).unwrap().subscribe(Topic::SessionStatus);
        registry.get(&id2).unwrap().subscribe(Topic::ContextStatus);

        assert_eq!(registry.broadcast(Topic::SessionStatus, "hello"), 2);
        assert_eq!(rx1.try_recv().unwrap(), "hello");
        assert_eq!(rx2.try_recv().unwrap(), "hello");
        assert!(rx3.try_recv().is_err());
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let registry = ClientRegistry::new(32);
        let (id, mut rx) = registry.register(true);
        let client = registry.get(&id).unwrap();
        assert!(client.subscribe(Topic::RealityChecks));
        assert!(!client.subscribe(Topic::RealityChecks));
        assert!(client.unsubscribe(Topic::RealityChecks));
        assert_eq!(registry.broadcast(Topic::RealityChecks, "x"), 0);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn unregister_releases_subscriptions() {
        let registry = ClientRegistry::new(32);
        let (id, _rx) = registry.register(true);
        let client = registry.get(&id).unwrap();
        client.subscribe(Topic::ProjectStatus);
        registry.unregister(&id);
        assert!(!client.is_subscribed(Topic::ProjectStatus));
    }

    #[test]
    fn full_queue_drops_without_blocking() {
        let registry = ClientRegistry::new(2);
        let (id, _rx) = registry.register(true);
        let client = registry.get(&id).unwrap();
        assert!(client.send("msg1".into()));
        assert!(client.send("msg2".into()));
        assert!(!client.send("msg3".into()));
    }

    #[test]
    fn stale_pong_is_swept() {
        let registry = ClientRegistry::new(4);
        let (id, _rx) = registry.register(true);
        let (_live, _rx2) = registry.register(true);
        let client = registry.get(&id).unwrap();
        assert!(client.is_alive());

        client
            .last_pong
            .store(now_secs() - CLIENT_TIMEOUT.as_secs() - 1, Ordering::Relaxed);
        assert!(!client.is_alive());
        assert_eq!(registry.cleanup_dead_clients(), 1);
        assert_eq!(registry.count(), 1);
    }
}
