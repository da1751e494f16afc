use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use keel_core::Topic;
use keel_engine::Services;
use keel_server::protocol::HubMessage;
use keel_server::{start, HubClient, ServerConfig, ServerHandle};
use keel_settings::KeelSettings;
use keel_store::Database;

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct Harness {
    handle: ServerHandle,
    _workspace: tempfile::TempDir,
}

impl Harness {
    async fn start(auth_token: Option<&str>) -> Self {
        let workspace = tempfile::tempdir().unwrap();
        let mut settings = KeelSettings::default();
        settings.reality.workspace_root = Some(workspace.path().to_string_lossy().into_owned());
        let services = Arc::new(Services::new(Database::in_memory().unwrap(), settings));
        let config = ServerConfig {
            port: 0,
            auth_token: auth_token.map(str::to_string),
            advisory_interval_secs: 0,
            ..Default::default()
        };
        let handle = start(config, services).await.unwrap();
        Self {
            handle,
            _workspace: workspace,
        }
    }

    fn url(&self) -> String {
        format!("ws://127.0.0.1:{}/ws", self.handle.port)
    }

    async fn connect(&self) -> Ws {
        let (ws, _) = tokio_tungstenite::connect_async(self.url()).await.unwrap();
        ws
    }
}

async fn send(ws: &mut Ws, value: Value) {
    ws.send(Message::text(value.to_string())).await.unwrap();
}

async fn recv(ws: &mut Ws) -> Value {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("hub reply in time")
            .expect("open socket")
            .unwrap();
        if let Message::Text(text) = frame {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

#[tokio::test]
async fn health_reports_checks() {
    let h = Harness::start(None).await;
    let resp = reqwest::get(format!("http://127.0.0.1:{}/health", h.handle.port))
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "healthy");
    for check in ["database", "websocket", "filesystem"] {
        assert_eq!(body["checks"][check], "ok", "{check}");
    }
    h.handle.shutdown().await;
}

#[tokio::test]
async fn subscribe_pushes_null_session_then_changes() {
    let h = Harness::start(None).await;
    let mut observer = h.connect().await;
    send(&mut observer, json!({ "type": "subscribe", "topic": "session.status" })).await;
    let first = recv(&mut observer).await;
    assert_eq!(
        first,
        json!({ "type": "event", "topic": "session.status", "data": { "session": null } })
    );

    let mut actor = h.connect().await;
    send(
        &mut actor,
        json!({
            "type": "execute",
            "tool": "start_session",
            "requestId": "s1",
            "params": { "project": "alpha", "kind": "feature", "scope": { "lines": 300, "tests": 3 } }
        }),
    )
    .await;
    let result = recv(&mut actor).await;
    assert_eq!(result["type"], "result");
    assert_eq!(result["requestId"], "s1");
    let session_id = result["data"]["session"]["id"].as_str().unwrap().to_string();

    let change = recv(&mut observer).await;
    assert_eq!(change["topic"], "session.status");
    assert_eq!(change["data"]["session"]["id"], session_id.as_str());

    h.handle.shutdown().await;
}

#[tokio::test]
async fn errors_keep_the_connection_open() {
    let h = Harness::start(None).await;
    let mut ws = h.connect().await;

    ws.send(Message::text("{oops")).await.unwrap();
    assert_eq!(recv(&mut ws).await["code"], "PARSE_ERROR");

    send(
        &mut ws,
        json!({ "type": "execute", "tool": "teleport", "requestId": "x1", "params": {} }),
    )
    .await;
    let err = recv(&mut ws).await;
    assert_eq!(err["type"], "error");
    assert_eq!(err["code"], "TOOL_NOT_FOUND");
    assert_eq!(err["requestId"], "x1");

    send(&mut ws, json!({ "type": "subscribe", "topic": "nowhere" })).await;
    assert_eq!(recv(&mut ws).await["code"], "INVALID_TOPIC");

    send(&mut ws, json!({ "type": "ping" })).await;
    assert_eq!(recv(&mut ws).await, json!({ "type": "pong" }));

    h.handle.shutdown().await;
}

#[tokio::test]
async fn hub_client_authenticates_and_subscribes() {
    let h = Harness::start(Some("token")).await;
    let client = HubClient::new(h.url())
        .with_auth("token".to_string().into())
        .with_topics([Topic::SessionStatus]);

    let (tx, mut rx) = tokio::sync::mpsc::channel(8);
    let task = tokio::spawn(async move { client.run(tx).await });

    let msg = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    match msg {
        HubMessage::Event { topic, data } => {
            assert_eq!(topic, "session.status");
            assert_eq!(data, json!({ "session": null }));
        }
        other => panic!("unexpected {other:?}"),
    }

    drop(rx);
    task.abort();
    h.handle.shutdown().await;
}
