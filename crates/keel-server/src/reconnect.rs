//! Observer client that keeps a subscription to the hub alive across
//! disconnects.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use rand::Rng;
use secrecy::{ExposeSecret, SecretString};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use keel_core::Topic;

use crate::protocol::{ClientMessage, HubMessage};

#[derive(Clone, Debug)]
pub struct ReconnectConfig {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Fraction of the delay added or removed at random.
    pub jitter_factor: f64,
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter_factor: 0.2,
            max_attempts: 3,
        }
    }
}

impl ReconnectConfig {
    /// Delay before retry `attempt` (0-based): `base * 2^attempt`, capped,
    /// then jittered.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as f64;
        let exp = base_ms * 2f64.powi(attempt.min(31) as i32);
        let capped = exp.min(self.max_delay.as_millis() as f64);

        let jitter_range = capped * self.jitter_factor.clamp(0.0, 1.0);
        let jitter = if jitter_range > 0.0 {
            rand::thread_rng().gen_range(-jitter_range..=jitter_range)
        } else {
            0.0
        };
        Duration::from_millis((capped + jitter).max(0.0) as u64)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ReconnectError {
    #[error("gave up after {attempts} connection attempts: {last_error}")]
    Exhausted { attempts: u32, last_error: String },

    #[error("connection closed")]
    Closed,

    #[error("hub rejected credentials: {0}")]
    Rejected(String),

    #[error("websocket error: {0}")]
    Socket(String),
}

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// One live connection to the hub.
pub struct HubConnection {
    socket: Socket,
}

impl HubConnection {
    pub async fn send(&mut self, message: &ClientMessage) -> Result<(), ReconnectError> {
        let json = serde_json::to_string(message).map_err(|e| ReconnectError::Socket(e.to_string()))?;
        self.socket
            .send(Message::text(json))
            .await
            .map_err(|e| ReconnectError::Socket(e.to_string()))
    }

    /// Next hub message. `Ok(None)` means the hub closed the connection.
    pub async fn next_message(&mut self) -> Result<Option<HubMessage>, ReconnectError> {
        while let Some(frame) = self.socket.next().await {
            match frame.map_err(|e| ReconnectError::Socket(e.to_string()))? {
                Message::Text(text) => match serde_json::from_str(text.as_str()) {
                    Ok(msg) => return Ok(Some(msg)),
                    Err(e) => tracing::debug!(error = %e, "ignoring unrecognised hub frame"),
                },
                Message::Close(_) => return Ok(None),
                _ => {}
            }
        }
        Ok(None)
    }
}

/// Reconnecting observer: authenticates, subscribes to its topics and
/// forwards every hub message to a channel.
pub struct HubClient {
    url: String,
    auth: Option<SecretString>,
    topics: Vec<Topic>,
    config: ReconnectConfig,
}

impl HubClient {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            auth: None,
            topics: Vec::new(),
            config: ReconnectConfig::default(),
        }
    }

    pub fn with_auth(mut self, token: SecretString) -> Self {
        self.auth = Some(token);
        self
    }

    pub fn with_topics(mut self, topics: impl IntoIterator<Item = Topic>) -> Self {
        self.topics = topics.into_iter().collect();
        self
    }

    pub fn with_config(mut self, config: ReconnectConfig) -> Self {
        self.config = config;
        self
    }

    /// Connect with backoff, authenticate and subscribe.
    pub async fn connect(&self) -> Result<HubConnection, ReconnectError> {
        let mut attempt = 0;
        self.connect_from(&mut attempt).await
    }

    /// Retry loop shared by [`connect`](Self::connect) and
    /// [`run`](Self::run). `attempt` carries over between calls and is
    /// left at the number of attempts spent. Only rejected credentials end
    /// the loop early.
    async fn connect_from(&self, attempt: &mut u32) -> Result<HubConnection, ReconnectError> {
        let mut last_error = String::new();
        while *attempt < self.config.max_attempts {
            if *attempt > 0 {
                let delay = self.config.delay(*attempt - 1);
                tracing::debug!(attempt = *attempt, delay_ms = delay.as_millis() as u64, "retrying hub connection");
                tokio::time::sleep(delay).await;
            }
            *attempt += 1;
            let result = match tokio_tungstenite::connect_async(self.url.as_str()).await {
                Ok((socket, _)) => {
                    let mut conn = HubConnection { socket };
                    self.handshake(&mut conn).await.map(|()| conn)
                }
                Err(e) => Err(ReconnectError::Socket(e.to_string())),
            };
            match result {
                Ok(conn) => {
                    tracing::info!(url = %self.url, attempt = *attempt, "connected to hub");
                    return Ok(conn);
                }
                Err(e @ ReconnectError::Rejected(_)) => return Err(e),
                Err(e) => {
                    tracing::warn!(url = %self.url, attempt = *attempt, error = %e, "hub connection failed");
                    last_error = e.to_string();
                }
            }
        }

        tracing::error!(
            url = %self.url,
            attempts = self.config.max_attempts,
            error = %last_error,
            "giving up on hub connection"
        );
        Err(ReconnectError::Exhausted {
            attempts: self.config.max_attempts,
            last_error,
        })
    }

    async fn handshake(&self, conn: &mut HubConnection) -> Result<(), ReconnectError> {
        if let Some(token) = &self.auth {
            conn.send(&ClientMessage::Authenticate {
                auth: token.expose_secret().to_string(),
            })
            .await?;
            match conn.next_message().await? {
                Some(HubMessage::Auth {
                    authenticated: true,
                    ..
                }) => {}
                Some(HubMessage::Auth { message, .. }) => return Err(ReconnectError::Rejected(message)),
                Some(other) => {
                    return Err(ReconnectError::Socket(format!(
                        "unexpected reply to authenticate: {other:?}"
                    )))
                }
                None => return Err(ReconnectError::Closed),
            }
        }
        for topic in &self.topics {
            conn.send(&ClientMessage::Subscribe {
                topic: topic.as_str().to_string(),
            })
            .await?;
        }
        Ok(())
    }

    /// Forward hub messages to `tx`, reconnecting whenever the connection
    /// drops. Returns `Ok` once `tx` is closed; rejected credentials and
    /// exhausted retries are returned as errors.
    ///
    /// The attempt counter survives a drop and is reset only after the hub
    /// delivers a message, so a hub that accepts and immediately closes
    /// still runs into the backoff and the attempt limit.
    pub async fn run(&self, tx: mpsc::Sender<HubMessage>) -> Result<(), ReconnectError> {
        let mut attempt = 0;
        loop {
            let mut conn = self.connect_from(&mut attempt).await?;
            loop {
                match conn.next_message().await {
                    Ok(Some(msg)) => {
                        attempt = 0;
                        if tx.send(msg).await.is_err() {
                            return Ok(());
                        }
                    }
                    Ok(None) => {
                        tracing::warn!(url = %self.url, attempt, "hub closed the connection, reconnecting");
                        break;
                    }
                    Err(e) => {
                        tracing::warn!(url = %self.url, attempt, error = %e, "hub connection lost, reconnecting");
                        break;
                    }
                }
            }
        }
    }
}
