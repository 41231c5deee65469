//! Opening the persistence core from configuration.

use std::sync::Arc;

use store::{ImportReport, LegacyImporter, StorageConfig, StorageEngine, StoreHandle};
use tracing::{info, warn};

/// The opened core: configuration plus the shared store handle.
pub struct Storage {
    pub config: StorageConfig,
    pub handle: StoreHandle,
}

impl Storage {
    pub fn engine(&self) -> &StorageEngine {
        self.handle.engine()
    }

    pub fn close(&self) {
        self.handle.engine().close();
    }
}

/// Build the engine and handle. A database that fails to open is logged and
/// left closed; every store then runs on flat files.
pub fn open(config: StorageConfig) -> Storage {
    open_inner(config, true)
}

/// Like [`open`], but a database file that does not exist yet stays absent.
pub fn open_existing(config: StorageConfig) -> Storage {
    open_inner(config, false)
}

fn open_inner(config: StorageConfig, create: bool) -> Storage {
    info!(
        data_dir = %config.data_dir.display(),
        database_enabled = config.database_enabled,
        "Opening storage"
    );

    let engine = Arc::new(StorageEngine::new(
        config.database_path(),
        config.engine_tuning(),
    ));
    if config.database_enabled {
        if !create && !engine.database_exists() {
            info!(path = %engine.database_path().display(), "No database file, not creating one");
        } else if !engine.initialize() {
            warn!("Database unavailable, continuing with flat files");
        }
    }

    let handle = StoreHandle::new(engine, &config);
    info!(backend = %handle.backend(), "Storage ready");
    Storage { config, handle }
}

/// Run the one-time legacy import when the database is in use.
///
/// A failed import is logged by the importer and retried on the next start,
/// so it does not stop the host.
pub fn import_legacy(storage: &Storage) -> Option<ImportReport> {
    if !storage.handle.relational_available() {
        return None;
    }
    LegacyImporter::from_handle(&storage.handle).run().ok()
}
