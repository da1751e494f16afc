use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use keel_engine::Services;
use keel_settings::ServerSettings;

use crate::auth::Authenticator;
use crate::client::{self, ClientId, ClientRegistry};
use crate::event_bridge;
use crate::hub::{self, Hub};

const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);
const INBOUND_QUEUE: usize = 1024;

/// Server configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub max_send_queue: usize,
    pub auth_token: Option<String>,
    /// Seconds between advisory runs; 0 disables them.
    pub advisory_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::from(&ServerSettings::default())
    }
}

impl From<&ServerSettings> for ServerConfig {
    fn from(s: &ServerSettings) -> Self {
        Self {
            host: s.host.clone(),
            port: s.port,
            max_send_queue: s.max_send_queue,
            auth_token: s.auth_token.clone(),
            advisory_interval_secs: s.advisory_interval_secs,
        }
    }
}

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub services: Arc<Services>,
    pub client_registry: Arc<ClientRegistry>,
    pub message_tx: mpsc::Sender<(ClientId, String)>,
    pub open_auth: bool,
    pub shutdown: CancellationToken,
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Bind the listener and start every background task.
pub async fn start(config: ServerConfig, services: Arc<Services>) -> Result<ServerHandle, std::io::Error> {
    let shutdown = CancellationToken::new();
    let auth = Arc::new(Authenticator::from_token(config.auth_token.as_deref()));
    if auth.is_open() {
        tracing::warn!("no auth token configured, every client is trusted");
    }

    let client_registry = Arc::new(ClientRegistry::new(config.max_send_queue));
    let hub = Arc::new(Hub::new(
        Arc::clone(&services),
        Arc::clone(&client_registry),
        Arc::clone(&auth),
    ));

    let bridge = event_bridge::create_bridge(
        Arc::clone(&hub),
        services.subscribe_all(),
        shutdown.clone(),
    );
    let cleanup = client::start_cleanup_task(
        Arc::clone(&client_registry),
        CLEANUP_INTERVAL,
        shutdown.clone(),
    );

    let (msg_tx, msg_rx) = mpsc::channel::<(ClientId, String)>(INBOUND_QUEUE);
    let processor = tokio::spawn(hub::process_messages(Arc::clone(&hub), msg_rx));

    let mut tasks = vec![bridge, cleanup, processor];
    if config.advisory_interval_secs > 0 {
        tasks.push(start_advisory_ticker(
            Arc::clone(&services),
            Duration::from_secs(config.advisory_interval_secs),
            shutdown.clone(),
        ));
    }

    let app_state = AppState {
        services,
        client_registry,
        message_tx: msg_tx,
        open_auth: auth.is_open(),
        shutdown: shutdown.clone(),
    };
    let router = build_router(app_state);

    let listener = tokio::net::TcpListener::bind((config.host.as_str(), config.port)).await?;
    let local_addr = listener.local_addr()?;
    tracing::info!(addr = %local_addr, "keel hub listening");

    let server_shutdown = shutdown.clone();
    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router)
            .with_graceful_shutdown(server_shutdown.cancelled_owned())
            .await
        {
            tracing::error!(error = %e, "server terminated");
        }
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        addr: local_addr,
        shutdown,
        server,
        tasks,
    })
}

/// Handle returned by [`start`]; keeps the background tasks alive.
pub struct ServerHandle {
    pub port: u16,
    pub addr: SocketAddr,
    shutdown: CancellationToken,
    server: JoinHandle<()>,
    tasks: Vec<JoinHandle<()>>,
}

impl ServerHandle {
    /// Stop accepting connections, close every client and wait for the
    /// background tasks to finish.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        if let Err(e) = self.server.await {
            tracing::warn!(error = %e, "server task failed");
        }
        for task in self.tasks {
            task.abort();
            let _ = task.await;
        }
        tracing::info!("keel hub stopped");
    }
}

/// Run the advisory agents on the active session at a fixed interval.
/// Results reach subscribers through the orchestrator's channel.
fn start_advisory_ticker(
    services: Arc<Services>,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.cancelled() => break,
            }
            match services.sessions.active_session() {
                Ok(Some(session)) => match services.advisory.run(Some(&session.id)).await {
                    Ok(report) => tracing::debug!(
                        session_id = %session.id,
                        suggestions = report.suggestions.len(),
                        "periodic advisory run"
                    ),
                    Err(e) => tracing::warn!(session_id = %session.id, error = %e, "periodic advisory run failed"),
                },
                Ok(None) => tracing::trace!("no active session, advisory tick skipped"),
                Err(e) => tracing::warn!(error = %e, "advisory tick could not read sessions"),
            }
        }
    })
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (client_id, rx) = state.client_registry.register(state.open_auth);
    tracing::info!(client_id = %client_id, "client connected");

    client::handle_ws_connection(
        socket,
        client_id,
        rx,
        state.client_registry,
        state.message_tx,
        state.shutdown,
    )
    .await;
}

/// Health check HTTP endpoint.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let database = match state.services.db.ping() {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(error = %e, "health: database unavailable");
            false
        }
    };
    let websocket = !state.message_tx.is_closed();
    let filesystem = state.services.settings.reality.workspace_root().is_dir();
    let healthy = database && websocket && filesystem;

    let check = |ok: bool| if ok { "ok" } else { "error" };
    let body = json!({
        "status": if healthy { "healthy" } else { "degraded" },
        "checks": {
            "database": check(database),
            "websocket": check(websocket),
            "filesystem": check(filesystem),
        },
        "clients": state.client_registry.count(),
    });
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}
