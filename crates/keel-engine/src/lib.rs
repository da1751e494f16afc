pub mod advisory;
pub mod context;
pub mod project;
pub mod reality;
pub mod registry;
pub mod services;
pub mod session;
pub mod tools;

pub use registry::ToolRegistry;
pub use services::Services;

use keel_core::ids::SessionId;
use keel_core::session::Session;
use keel_core::{KeelError, StateEvent};
use keel_store::{Database, SessionRepo};
use tokio::sync::broadcast;

/// Capacity of each manager's event channel. Slow bridges see `Lagged`.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Load a session, mapping absence to `SessionNotFound`.
pub(crate) fn load_session(db: &Database, id: &SessionId) -> Result<Session, KeelError> {
    db.with_conn(|conn| SessionRepo::find(conn, id))?
        .ok_or_else(|| KeelError::SessionNotFound(id.to_string()))
}

/// Publish without caring whether anyone is listening.
pub(crate) fn publish(events: &broadcast::Sender<StateEvent>, event: StateEvent) {
    let topic = event.topic();
    if events.send(event).is_err() {
        tracing::trace!(%topic, "no subscribers for state event");
    }
}
