//! The two-backend load/save contract shared by every domain store.
//!
//! A [`DualModeStore`] prefers the relational backend when it is enabled and
//! its file is present, and otherwise reads and writes a JSON document in the
//! data directory. The choice is re-evaluated on every call, and a relational
//! failure falls back to the file within the same call. Only one backend is
//! touched per successful call.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use rusqlite::Connection;
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, error, warn};

use crate::config::StorageConfig;
use crate::engine::StorageEngine;
use crate::json_file::JsonDocument;
use crate::time::TimestampCodec;
use crate::PersistenceError;

/// Per-domain half of the contract: how one state type maps onto SQL and
/// onto its flat-file document.
///
/// The relational write methods are always called inside a transaction (or a
/// savepoint of one) and must not call back into the [`StorageEngine`].
pub trait StoreAdapter: Send + Sync {
    type State: Default + Send;
    type Document: Serialize + DeserializeOwned + Default;

    /// Name used in logs and import reports.
    const NAME: &'static str;
    /// Flat-file name inside the data directory.
    const FILE_NAME: &'static str;

    /// Read the full state. `None` means the read failed.
    fn load_relational(&self, engine: &StorageEngine) -> Option<Self::State>;

    /// Persist `state` so that a following load returns it.
    fn write_relational(&self, conn: &Connection, state: &Self::State)
        -> Result<(), PersistenceError>;

    /// Merge `state` into the tables without removing or overwriting anything
    /// already there. Returns the number of rows written.
    fn merge_relational(&self, conn: &Connection, state: &Self::State)
        -> Result<usize, PersistenceError>;

    fn decode(&self, doc: Self::Document, timestamps: &TimestampCodec) -> Self::State;

    fn encode(&self, state: &Self::State) -> Self::Document;
}

/// Which backend served a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Relational,
    FlatFile,
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backend::Relational => f.write_str("relational"),
            Backend::FlatFile => f.write_str("flat-file"),
        }
    }
}

/// Shared context handed to every store: the engine, the data directory,
/// the runtime "relational enabled" switch and the timestamp codec.
#[derive(Clone)]
pub struct StoreHandle {
    engine: Arc<StorageEngine>,
    data_dir: PathBuf,
    relational_enabled: Arc<AtomicBool>,
    timestamps: TimestampCodec,
}

impl StoreHandle {
    pub fn new(engine: Arc<StorageEngine>, config: &StorageConfig) -> Self {
        Self {
            engine,
            data_dir: config.data_dir.clone(),
            relational_enabled: Arc::new(AtomicBool::new(config.database_enabled)),
            timestamps: TimestampCodec::new(config.timestamp_fallback),
        }
    }

    pub fn engine(&self) -> &Arc<StorageEngine> {
        &self.engine
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn timestamps(&self) -> &TimestampCodec {
        &self.timestamps
    }

    pub fn relational_enabled(&self) -> bool {
        self.relational_enabled.load(Ordering::Acquire)
    }

    /// Flip the relational backend on or off for every store sharing this
    /// handle. Takes effect on their next call.
    pub fn set_relational_enabled(&self, enabled: bool) {
        self.relational_enabled.store(enabled, Ordering::Release);
    }

    /// Enabled in configuration, file present, and engine open.
    pub fn relational_available(&self) -> bool {
        self.relational_enabled() && self.engine.database_exists() && self.engine.is_open()
    }

    pub fn backend(&self) -> Backend {
        if self.relational_available() {
            Backend::Relational
        } else {
            Backend::FlatFile
        }
    }
}

/// Load/save front for one domain, generic over its [`StoreAdapter`].
pub struct DualModeStore<A: StoreAdapter> {
    adapter: A,
    handle: StoreHandle,
    file: JsonDocument<A::Document>,
    update_lock: Mutex<()>,
}

impl<A: StoreAdapter> DualModeStore<A> {
    pub fn new(adapter: A, handle: StoreHandle) -> Self {
        let file = JsonDocument::new(handle.data_dir().join(A::FILE_NAME));
        Self {
            adapter,
            handle,
            file,
            update_lock: Mutex::new(()),
        }
    }

    pub fn adapter(&self) -> &A {
        &self.adapter
    }

    pub fn handle(&self) -> &StoreHandle {
        &self.handle
    }

    pub fn file_path(&self) -> &Path {
        self.file.path()
    }

    pub fn active_backend(&self) -> Backend {
        self.handle.backend()
    }

    /// Load the full state from whichever backend is active.
    ///
    /// Never fails: a relational failure falls back to the file, and an
    /// unreadable file yields the empty state (logged).
    pub fn load(&self) -> A::State {
        if self.handle.relational_available() {
            match self.adapter.load_relational(self.handle.engine()) {
                Some(state) => {
                    debug!(store = A::NAME, "Loaded from database");
                    return state;
                }
                None => warn!(
                    store = A::NAME,
                    "Database read failed, falling back to flat file"
                ),
            }
        }
        self.load_file()
    }

    fn load_file(&self) -> A::State {
        match self.file.load() {
            Ok(Some(doc)) => {
                debug!(store = A::NAME, path = %self.file.path().display(), "Loaded from flat file");
                self.adapter.decode(doc, self.handle.timestamps())
            }
            Ok(None) => A::State::default(),
            Err(e) => {
                error!(
                    store = A::NAME,
                    path = %self.file.path().display(),
                    error = %e,
                    "Failed to read flat file, starting from empty state"
                );
                A::State::default()
            }
        }
    }

    /// Persist the full state, overwriting what the backend held.
    ///
    /// Returns the backend that took the write. `Err` only when the
    /// relational write (if attempted) and the flat-file write both failed.
    pub fn save(&self, state: &A::State) -> Result<Backend, PersistenceError> {
        if self.handle.relational_available() {
            let written = self
                .handle
                .engine()
                .transaction(|tx| self.adapter.write_relational(tx, state));
            match written {
                Ok(()) => return Ok(Backend::Relational),
                Err(e) => warn!(
                    store = A::NAME,
                    error = %e,
                    "Database write failed, falling back to flat file"
                ),
            }
        }

        match self.file.save(&self.adapter.encode(state)) {
            Ok(()) => Ok(Backend::FlatFile),
            Err(e) => {
                error!(
                    store = A::NAME,
                    path = %self.file.path().display(),
                    error = %e,
                    "Failed to write flat file, state not persisted"
                );
                Err(e)
            }
        }
    }

    /// Read-modify-write under this store's own lock.
    ///
    /// Concurrent `update` calls on the same store are serialized, so none of
    /// them loses another's change. Plain `save` calls are not covered.
    pub fn update<R, F>(&self, f: F) -> (R, Result<Backend, PersistenceError>)
    where
        F: FnOnce(&mut A::State) -> R,
    {
        let _guard = self
            .update_lock
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut state = self.load();
        let out = f(&mut state);
        let saved = self.save(&state);
        (out, saved)
    }
}
