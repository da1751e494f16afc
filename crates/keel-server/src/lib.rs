//! WebSocket hub distributing state changes to observers and executing
//! tools on their behalf.

pub mod auth;
pub mod client;
pub mod event_bridge;
pub mod hub;
pub mod protocol;
pub mod reconnect;
pub mod server;
pub mod topics;

pub use reconnect::{HubClient, ReconnectConfig, ReconnectError};
pub use server::{start, ServerConfig, ServerHandle};
