//! Inbound message handling: authentication, subscriptions and tool calls.

use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use keel_core::{StateEvent, Topic};
use keel_engine::Services;

use crate::auth::Authenticator;
use crate::client::{Client, ClientId, ClientRegistry};
use crate::protocol::{codes, ClientMessage, HubMessage};
use crate::topics;

pub struct Hub {
    services: Arc<Services>,
    registry: Arc<ClientRegistry>,
    auth: Arc<Authenticator>,
}

impl Hub {
    pub fn new(
        services: Arc<Services>,
        registry: Arc<ClientRegistry>,
        auth: Arc<Authenticator>,
    ) -> Self {
        Self {
            services,
            registry,
            auth,
        }
    }

    pub fn registry(&self) -> &Arc<ClientRegistry> {
        &self.registry
    }

    /// Handle one raw frame from a client. Errors are answered on the
    /// connection; nothing here closes it.
    pub async fn handle(&self, client_id: &ClientId, raw: &str) {
        let Some(client) = self.registry.get(client_id) else {
            debug!(client_id = %client_id, "message from unregistered client");
            return;
        };

        let message: ClientMessage = match serde_json::from_str(raw) {
            Ok(msg) => msg,
            Err(e) => {
                debug!(client_id = %client_id, error = %e, "unparseable message");
                reply(
                    &client,
                    HubMessage::error(None, codes::PARSE_ERROR, format!("invalid message: {e}")),
                );
                return;
            }
        };

        if !client.is_authenticated() && !matches!(message, ClientMessage::Authenticate { .. }) {
            let request_id = match &message {
                ClientMessage::Execute { request_id, .. } => request_id.clone(),
                _ => None,
            };
            reply(
                &client,
                HubMessage::error(
                    request_id,
                    codes::UNAUTHENTICATED,
                    format!("authenticate before sending '{}'", message.kind()),
                ),
            );
            return;
        }

        match message {
            ClientMessage::Authenticate { auth } => self.authenticate(&client, &auth),
            ClientMessage::Subscribe { topic } => self.subscribe(&client, &topic),
            ClientMessage::Unsubscribe { topic } => {
                let Some(topic) = parse_topic(&client, &topic) else {
                    return;
                };
                client.unsubscribe(topic);
                reply(
                    &client,
                    HubMessage::Unsubscribed {
                        topic: topic.as_str().to_string(),
                    },
                );
            }
            ClientMessage::Ping => {
                client.record_pong();
                reply(&client, HubMessage::Pong);
            }
            ClientMessage::Execute {
                tool,
                params,
                request_id,
            } => self.execute(&client, &tool, params, request_id).await,
        }
    }

    fn authenticate(&self, client: &Client, presented: &str) {
        let ok = self.auth.verify(presented);
        client.set_authenticated(ok);
        let message = if ok {
            "authenticated"
        } else {
            warn!(client_id = %client.id, "authentication failed");
            "invalid credentials"
        };
        reply(
            client,
            HubMessage::Auth {
                authenticated: ok,
                message: message.to_string(),
            },
        );
    }

    fn subscribe(&self, client: &Client, topic: &str) {
        let Some(topic) = parse_topic(client, topic) else {
            return;
        };
        client.subscribe(topic);
        debug!(client_id = %client.id, %topic, "subscribed");
        if let Some(event) = self.current(topic) {
            reply(client, HubMessage::event(topic.as_str(), event.payload()));
        }
    }

    async fn execute(&self, client: &Client, name: &str, params: Value, request_id: Option<String>) {
        let Some(tool) = self.services.registry.get(name) else {
            reply(
                client,
                HubMessage::error(
                    request_id,
                    codes::TOOL_NOT_FOUND,
                    format!("unknown tool: {name}"),
                ),
            );
            return;
        };

        let started = Instant::now();
        let outcome = tool.execute(params).await.map_err(|e| e.in_tool(name));
        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        let error = match outcome {
            Ok(data) => {
                info!(client_id = %client.id, tool = name, duration_ms, "tool executed");
                reply(
                    client,
                    HubMessage::Result {
                        request_id: request_id.clone(),
                        data,
                    },
                );
                None
            }
            Err(e) => {
                warn!(client_id = %client.id, tool = name, error = %e, "tool failed");
                reply(client, HubMessage::tool_error(request_id.clone(), &e));
                Some(e.to_string())
            }
        };

        let success = error.is_none();
        self.publish(&StateEvent::ToolExecuted {
            tool: name.to_string(),
            request_id,
            success,
            duration_ms,
            error,
        });

        if success {
            for topic in self.services.registry.affected_topics(name) {
                if let Some(event) = self.current(topic) {
                    self.publish(&event);
                }
            }
        }
    }

    /// Fan an event out to the subscribers of its topic.
    pub fn publish(&self, event: &StateEvent) -> usize {
        let topic = event.topic();
        match HubMessage::event(topic.as_str(), event.payload()).to_json() {
            Some(json) => self.registry.broadcast(topic, &json),
            None => 0,
        }
    }

    fn current(&self, topic: Topic) -> Option<StateEvent> {
        match topics::snapshot(&self.services, topic) {
            Ok(event) => event,
            Err(e) => {
                warn!(%topic, error = %e, "failed to read topic snapshot");
                None
            }
        }
    }
}

fn parse_topic(client: &Client, raw: &str) -> Option<Topic> {
    match raw.parse::<Topic>() {
        Ok(topic) => Some(topic),
        Err(e) => {
            reply(client, HubMessage::error(None, codes::INVALID_TOPIC, e));
            None
        }
    }
}

fn reply(client: &Client, message: HubMessage) {
    if let Some(json) = message.to_json() {
        client.send(json);
    }
}

/// Process client frames one at a time so each mutation and its publish
/// complete before the next frame is looked at.
pub async fn process_messages(hub: Arc<Hub>, mut rx: mpsc::Receiver<(ClientId, String)>) {
    while let Some((client_id, raw)) = rx.recv().await {
        hub.handle(&client_id, &raw).await;
    }
    debug!("hub message channel closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_settings::KeelSettings;
    use keel_store::Database;
    use serde_json::json;

    fn hub(token: Option<&str>) -> Hub {
        let mut settings = KeelSettings::default();
        settings.reality.workspace_root = Some(std::env::temp_dir().to_string_lossy().into_owned());
        let services = Services::new(Database::in_memory().unwrap(), settings);
        Hub::new(
            Arc::new(services),
            Arc::new(ClientRegistry::new(64)),
            Arc::new(Authenticator::from_token(token)),
        )
    }

    fn connect(hub: &Hub) -> (ClientId, mpsc::Receiver<String>) {
        hub.registry().register(hub.auth.is_open())
    }

    fn next(rx: &mut mpsc::Receiver<String>) -> Value {
        serde_json::from_str(&rx.try_recv().expect("a queued frame")).unwrap()
    }

    fn drain(rx: &mut mpsc::Receiver<String>) -> Vec<Value> {
        let mut out = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            out.push(serde_json::from_str(&frame).unwrap());
        }
        out
    }

    #[tokio::test]
    async fn unauthenticated_clients_may_only_authenticate() {
        let hub = hub(Some("s3cret"));
        let (id, mut rx) = connect(&hub);

        hub.handle(&id, r#"{"type":"execute","tool":"list_sessions","requestId":"r2"}"#)
            .await;
        let frame = next(&mut rx);
        assert_eq!(frame["code"], "UNAUTHENTICATED");
        assert_eq!(frame["requestId"], "r2");

        hub.handle(&id, r#"{"type":"authenticate","auth":"nope"}"#)
            .await;
        assert_eq!(next(&mut rx)["authenticated"], false);

        hub.handle(&id, r#"{"type":"authenticate","auth":"s3cret"}"#)
            .await;
        assert_eq!(next(&mut rx)["authenticated"], true);

        hub.handle(&id, r#"{"type":"execute","tool":"list_sessions","requestId":"r3"}"#)
            .await;
        let frame = next(&mut rx);
        assert_eq!(frame["type"], "result");
        assert_eq!(frame["data"]["sessions"], json!([]));
    }

    #[tokio::test]
    async fn execute_broadcasts_outcome_and_affected_topics() {
        let hub = hub(None);
        let (caller, mut caller_rx) = connect(&hub);
        let (watcher, mut watcher_rx) = connect(&hub);
        for topic in ["tool:execution", "session.status", "context.status"] {
            hub.handle(
                &watcher,
                &json!({ "type": "subscribe", "topic": topic }).to_string(),
            )
            .await;
        }
        // session.status snapshot only; the others have no value yet
        assert_eq!(drain(&mut watcher_rx).len(), 1);

        let start = json!({
            "type": "execute",
            "tool": "start_session",
            "requestId": "r1",
            "params": { "project": "alpha", "kind": "feature", "scope": { "lines": 100 } }
        });
        hub.handle(&caller, &start.to_string()).await;
        let result = next(&mut caller_rx);
        assert_eq!(result["type"], "result");
        assert_eq!(result["requestId"], "r1");

        let frames = drain(&mut watcher_rx);
        let topics: Vec<&str> = frames.iter().filter_map(|f| f["topic"].as_str()).collect();
        assert_eq!(topics, vec!["tool:execution", "session.status", "context.status"]);
        assert_eq!(frames[0]["data"]["tool"], "start_session");
        assert_eq!(frames[0]["data"]["requestId"], "r1");
        assert_eq!(frames[0]["data"]["success"], true);
        assert_eq!(frames[1]["data"]["session"]["project"], "alpha");
    }

    #[tokio::test]
    async fn failed_tool_reports_root_code() {
        let hub = hub(None);
        let (id, mut rx) = connect(&hub);
        hub.handle(&id, r#"{"type":"subscribe","topic":"tool:execution"}"#)
            .await;
        hub.handle(
            &id,
            r#"{"type":"execute","tool":"get_session_status","params":{"session_id":"sess_x"},"requestId":"r5"}"#,
        )
        .await;
        let frames = drain(&mut rx);
        assert_eq!(frames[0]["type"], "error");
        assert_eq!(frames[0]["code"], "SESSION_NOT_FOUND");
        assert_eq!(frames[0]["requestId"], "r5");
        assert_eq!(frames[1]["topic"], "tool:execution");
        assert_eq!(frames[1]["data"]["success"], false);
        assert!(frames[1]["data"]["error"]
            .as_str()
            .unwrap()
            .contains("get_session_status"));

        hub.handle(
            &id,
            r#"{"type":"execute","tool":"start_session","params":{"project":"alpha"},"requestId":"r6"}"#,
        )
        .await;
        assert_eq!(drain(&mut rx)[0]["code"], "INVALID_PARAMETERS");
    }

    #[tokio::test]
    async fn unsubscribe_confirms_and_stops_delivery() {
        let hub = hub(None);
        let (id, mut rx) = connect(&hub);
        hub.handle(&id, r#"{"type":"subscribe","topic":"tool:execution"}"#)
            .await;
        hub.handle(&id, r#"{"type":"unsubscribe","topic":"tool:execution"}"#)
            .await;
        assert_eq!(
            next(&mut rx),
            json!({ "type": "unsubscribed", "topic": "tool:execution" })
        );
        hub.handle(&id, r#"{"type":"execute","tool":"list_sessions"}"#)
            .await;
        let frames = drain(&mut rx);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["type"], "result");
    }
}
