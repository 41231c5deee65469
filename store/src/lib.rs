//! Persistence core for statekeeper.
//!
//! ## Layout
//!
//! - [`engine`] owns the single SQLite connection, the schema and its version
//!   row, and exposes `query` / `execute` / `transaction`.
//! - [`legacy`] promotes the flat JSON documents into the relational schema
//!   exactly once, gated by the `migration_status` table.
//! - [`dual`] is the load/save contract every domain store shares: prefer the
//!   database when it is enabled and present, otherwise the flat file.
//! - [`domain`] holds one [`dual::StoreAdapter`] per stateful domain.
//!
//! Nothing here spawns threads. Every call blocks the caller for the duration
//! of its I/O; hosts offload saves to their own background workers.

pub mod config;
pub mod domain;
pub mod dual;
pub mod engine;
mod error;
mod json_file;
pub mod legacy;
pub mod time;

#[cfg(test)]
mod integration_tests;

pub use config::StorageConfig;
pub use dual::{Backend, DualModeStore, StoreAdapter, StoreHandle};
pub use engine::{EngineTuning, SqlParam, StorageEngine};
pub use error::PersistenceError;
pub use legacy::{ImportReport, ImportStatus, LegacyImporter};
pub use time::{TimestampCodec, TimestampFallback};
