use std::sync::Arc;

use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{StreamExt, StreamMap};
use tokio_util::sync::CancellationToken;

use keel_core::StateEvent;

use crate::hub::Hub;

/// Merges every manager's state channel and forwards each event to the
/// clients subscribed to its topic.
pub struct EventBridge {
    hub: Arc<Hub>,
}

impl EventBridge {
    pub fn new(hub: Arc<Hub>) -> Self {
        Self { hub }
    }

    /// Spawn the forwarding task. It ends when every channel has closed or
    /// `shutdown` fires.
    pub fn start(
        &self,
        channels: Vec<(&'static str, broadcast::Receiver<StateEvent>)>,
        shutdown: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let hub = Arc::clone(&self.hub);
        let mut streams = StreamMap::new();
        for (source, rx) in channels {
            streams.insert(source, BroadcastStream::new(rx));
        }

        tokio::spawn(async move {
            loop {
                let next = tokio::select! {
                    next = streams.next() => next,
                    _ = shutdown.cancelled() => break,
                };
                match next {
                    Some((_, Ok(event))) => {
                        let delivered = hub.publish(&event);
                        tracing::trace!(topic = %event.topic(), delivered, "forwarded state event");
                    }
                    Some((source, Err(BroadcastStreamRecvError::Lagged(n)))) => {
                        tracing::warn!(source, skipped = n, "event bridge lagged, dropped events");
                    }
                    None => {
                        tracing::info!("event bridge channels closed");
                        break;
                    }
                }
            }
        })
    }
}

/// Create a bridge over `channels` and start it.
pub fn create_bridge(
    hub: Arc<Hub>,
    channels: Vec<(&'static str, broadcast::Receiver<StateEvent>)>,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    EventBridge::new(hub).start(channels, shutdown)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Authenticator;
    use crate::client::ClientRegistry;
    use keel_core::session::SessionKind;
    use keel_engine::session::{ScopeInput, StartSession};
    use keel_engine::Services;
    use keel_settings::KeelSettings;
    use keel_store::Database;
    use std::time::Duration;

    #[tokio::test]
    async fn manager_events_reach_subscribers() {
        let mut settings = KeelSettings::default();
        settings.reality.workspace_root = Some(std::env::temp_dir().to_string_lossy().into_owned());
        let services = Arc::new(Services::new(Database::in_memory().unwrap(), settings));
        let registry = Arc::new(ClientRegistry::new(16));
        let hub = Arc::new(Hub::new(
            Arc::clone(&services),
            Arc::clone(&registry),
            Arc::new(Authenticator::from_token(None)),
        ));

        let (id, mut rx) = registry.register(true);
        registry
            .get(&id)
            .unwrap()
            .subscribe(keel_core::Topic::ProjectStatus);

        let shutdown = CancellationToken::new();
        let handle = create_bridge(hub, services.subscribe_all(), shutdown.clone());

        services
            .sessions
            .start_session(StartSession {
                project: "alpha".into(),
                kind: SessionKind::Bugfix,
                scope: ScopeInput {
                    lines: 50,
                    tests: 1,
                    docs: 0,
                },
                budget: None,
                phase: None,
                continuing_from: None,
            })
            .unwrap();

        let frame = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["topic"], "project.status");
        assert_eq!(value["data"]["project"]["name"], "alpha");

        shutdown.cancel();
        handle.await.unwrap();
    }
}
