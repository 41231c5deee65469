use std::fmt;
use std::path::PathBuf;

use store::engine::schema::{CURRENT_SCHEMA_VERSION, DOMAIN_TABLES};
use store::{Backend, LegacyImporter};

use crate::bootstrap::Storage;

/// What `statekeeper status` prints.
#[derive(Debug)]
pub struct StatusReport {
    pub data_dir: PathBuf,
    pub database_path: PathBuf,
    pub database_enabled: bool,
    pub database_present: bool,
    pub backend: Backend,
    pub schema_version: Option<i64>,
    pub legacy_import_completed: bool,
    pub legacy_files: Vec<PathBuf>,
    /// Row count per domain table, `None` when it could not be read.
    pub tables: Vec<(&'static str, Option<i64>)>,
}

pub fn gather(storage: &Storage) -> StatusReport {
    let engine = storage.engine();
    let importer = LegacyImporter::from_handle(&storage.handle);
    let open = engine.is_open();

    let tables = DOMAIN_TABLES
        .iter()
        .map(|&table| {
            let count = open
                .then(|| {
                    engine
                        .query_row(&format!("SELECT COUNT(*) FROM {table}"), &[], |row| {
                            row.get::<_, i64>(0)
                        })
                        .flatten()
                })
                .flatten();
            (table, count)
        })
        .collect();

    StatusReport {
        data_dir: storage.config.data_dir.clone(),
        database_path: engine.database_path().to_path_buf(),
        database_enabled: storage.config.database_enabled,
        database_present: engine.database_exists(),
        backend: storage.handle.backend(),
        schema_version: engine.schema_version(),
        legacy_import_completed: open && importer.is_completed(),
        legacy_files: importer.legacy_files(),
        tables,
    }
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "data directory:  {}", self.data_dir.display())?;
        writeln!(
            f,
            "database:        {} ({}{})",
            self.database_path.display(),
            if self.database_enabled { "enabled" } else { "disabled" },
            if self.database_present { "" } else { ", missing" },
        )?;
        writeln!(f, "active backend:  {}", self.backend)?;
        match self.schema_version {
            Some(v) => writeln!(f, "schema version:  {v} (binary expects {CURRENT_SCHEMA_VERSION})")?,
            None => writeln!(f, "schema version:  unknown")?,
        }
        writeln!(
            f,
            "legacy import:   {}",
            if self.legacy_import_completed { "completed" } else { "pending" }
        )?;
        for path in &self.legacy_files {
            writeln!(f, "  legacy file    {}", path.display())?;
        }
        if self.tables.iter().any(|(_, c)| c.is_some()) {
            writeln!(f, "rows:")?;
            for (table, count) in &self.tables {
                match count {
                    Some(n) => writeln!(f, "  {table:<20} {n}")?,
                    None => writeln!(f, "  {table:<20} ?")?,
                }
            }
        }
        Ok(())
    }
}
