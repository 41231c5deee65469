//! Embedded SQLite storage engine.
//!
//! ## Connection setup
//!
//! [`StorageEngine::initialize`] opens (or creates) the database file and
//! configures it with:
//! - **Foreign keys enabled** so history rows cascade with their parent.
//! - **WAL journal** with `synchronous = NORMAL`.
//! - **Bounded page cache** sized by [`EngineTuning::cache_size_kib`].
//!
//! It then runs every `CREATE TABLE IF NOT EXISTS` in [`schema`] followed by
//! the versioned index migrations, which are applied once and recorded in
//! `db_version`.
//!
//! ## Access
//!
//! | Call | Failure surfaces as |
//! |------|---------------------|
//! | [`StorageEngine::query`] | `None` |
//! | [`StorageEngine::execute`] | `0` rows |
//! | [`StorageEngine::transaction`] | `Err`, with everything rolled back |
//!
//! Every failure is logged before it is returned. Parameters are bound
//! positionally from [`SqlParam`] values.

mod database;
mod params;
pub mod schema;

pub use database::{EngineTuning, StorageEngine};
pub use params::{date_column, timestamp_column, uuid_column, SqlParam};
