pub mod advisory;
pub mod context;
pub mod errors;
pub mod events;
pub mod ids;
pub mod project;
pub mod reality;
pub mod session;
pub mod tokens;
pub mod tools;

pub use errors::KeelError;
pub use events::{StateEvent, Topic};
