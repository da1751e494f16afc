pub mod blockers;
pub mod checkpoints;
pub mod database;
pub mod documents;
pub mod error;
pub mod memory;
pub mod projects;
pub mod reality;
pub mod row_helpers;
pub mod schema;
pub mod sessions;
pub mod usage;

pub use blockers::BlockerRepo;
pub use checkpoints::CheckpointRepo;
pub use database::Database;
pub use documents::DocumentRepo;
pub use error::StoreError;
pub use memory::{DecisionRepo, SymbolRepo};
pub use projects::ProjectRepo;
pub use reality::RealityRepo;
pub use sessions::SessionRepo;
pub use usage::UsageRepo;

pub use rusqlite::Connection;
