//! The single connection handle and its lock.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use rusqlite::{params_from_iter, Connection, Row, Rows, Transaction, TransactionBehavior};
use tracing::{error, info, warn};

use super::params::SqlParam;
use super::schema;
use crate::PersistenceError;

/// Connection-level tuning applied on every open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineTuning {
    /// Upper bound of the page cache, in KiB.
    pub cache_size_kib: u32,
    /// How long a statement waits on a locked file before failing.
    pub busy_timeout: Duration,
}

impl Default for EngineTuning {
    fn default() -> Self {
        Self {
            cache_size_kib: 8192,
            busy_timeout: Duration::from_secs(5),
        }
    }
}

/// Owns the database file and its only connection.
///
/// The connection sits behind one exclusive lock, so queries, executes and
/// transactions are serialized. `rusqlite::Connection` is not `Sync`, which
/// rules out shared read access to the same handle.
///
/// The lock is not reentrant: a [`transaction`](Self::transaction) body must
/// use the transaction it is handed and never call back into the engine.
pub struct StorageEngine {
    path: PathBuf,
    tuning: EngineTuning,
    conn: Mutex<Option<Connection>>,
}

impl StorageEngine {
    /// Create a closed engine for the database file at `path`.
    pub fn new(path: impl Into<PathBuf>, tuning: EngineTuning) -> Self {
        Self {
            path: path.into(),
            tuning,
            conn: Mutex::new(None),
        }
    }

    /// Open (or create) the database, apply tuning, create the tables and run
    /// pending schema steps.
    ///
    /// Returns `false` on failure. The engine then stays closed and every
    /// other call degrades to its empty result, which callers treat as
    /// "use the flat-file backend".
    pub fn initialize(&self) -> bool {
        let mut guard = self.lock();
        if guard.is_some() {
            return true;
        }

        match self.open_connection() {
            Ok(conn) => {
                *guard = Some(conn);
                info!(path = %self.path.display(), "Database ready");
                true
            }
            Err(e) => {
                error!(path = %self.path.display(), error = %e, "Failed to initialize database");
                false
            }
        }
    }

    fn open_connection(&self) -> Result<Connection, PersistenceError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut conn = Connection::open(&self.path)?;
        conn.busy_timeout(self.tuning.busy_timeout)?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        let journal_mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        if !journal_mode.eq_ignore_ascii_case("wal") {
            warn!(journal_mode, "Database did not switch to WAL journal mode");
        }
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "cache_size", -i64::from(self.tuning.cache_size_kib))?;

        schema::create_tables(&conn)?;
        if let Some(upgrade) = schema::upgrade(&mut conn)? {
            info!(from = upgrade.from, to = upgrade.to, "Database schema upgraded");
        }

        Ok(conn)
    }

    /// Release the connection. Safe to call when already closed.
    pub fn close(&self) {
        let Some(conn) = self.lock().take() else {
            return;
        };
        match conn.close() {
            Ok(()) => info!(path = %self.path.display(), "Database closed"),
            Err((_, e)) => warn!(error = %e, "Database did not close cleanly"),
        }
    }

    pub fn is_open(&self) -> bool {
        self.lock().is_some()
    }

    /// Whether the database file exists on disk.
    pub fn database_exists(&self) -> bool {
        self.path.is_file()
    }

    pub fn database_path(&self) -> &Path {
        &self.path
    }

    /// Stored schema version, `None` when the engine is closed.
    pub fn schema_version(&self) -> Option<i64> {
        self.with_connection(|conn| Ok(schema::stored_version(conn)?))
            .ok()
    }

    /// Run `sql` and hand the result set to `map`.
    ///
    /// Returns `None` on any failure, including a closed engine. An empty
    /// result set is still `Some`.
    pub fn query<T, F>(&self, sql: &str, params: &[SqlParam], map: F) -> Option<T>
    where
        F: FnOnce(&mut Rows<'_>) -> rusqlite::Result<T>,
    {
        let result = self.with_connection(|conn| {
            let mut stmt = conn.prepare_cached(sql)?;
            let mut rows = stmt.query(params_from_iter(params.iter()))?;
            let value = map(&mut rows)?;
            Ok(value)
        });
        match result {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(sql, error = %e, "Query failed");
                None
            }
        }
    }

    /// Map every row of `sql` through `map_row`.
    pub fn query_rows<T, F>(&self, sql: &str, params: &[SqlParam], mut map_row: F) -> Option<Vec<T>>
    where
        F: FnMut(&Row<'_>) -> rusqlite::Result<T>,
    {
        self.query(sql, params, |rows| {
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                out.push(map_row(row)?);
            }
            Ok(out)
        })
    }

    /// Map the first row of `sql`, `Some(None)` when there is none.
    pub fn query_row<T, F>(&self, sql: &str, params: &[SqlParam], map_row: F) -> Option<Option<T>>
    where
        F: FnOnce(&Row<'_>) -> rusqlite::Result<T>,
    {
        self.query(sql, params, |rows| match rows.next()? {
            Some(row) => map_row(row).map(Some),
            None => Ok(None),
        })
    }

    /// Run a write statement. Returns the affected row count, `0` on failure.
    pub fn execute(&self, sql: &str, params: &[SqlParam]) -> usize {
        let result = self.with_connection(|conn| {
            let mut stmt = conn.prepare_cached(sql)?;
            Ok(stmt.execute(params_from_iter(params.iter()))?)
        });
        match result {
            Ok(changed) => changed,
            Err(e) => {
                warn!(sql, error = %e, "Execute failed");
                0
            }
        }
    }

    /// Run `body` inside one transaction, holding the lock throughout.
    ///
    /// Commits when `body` returns `Ok`; rolls back when it returns `Err` or
    /// unwinds. Either way the connection is back in auto-commit mode before
    /// the lock is released.
    pub fn transaction<T, F>(&self, body: F) -> Result<T, PersistenceError>
    where
        F: FnOnce(&mut Transaction<'_>) -> Result<T, PersistenceError>,
    {
        let mut guard = self.lock();
        let Some(conn) = guard.as_mut() else {
            warn!("Transaction requested on a closed database");
            return Err(PersistenceError::Closed);
        };

        let outcome = match conn.transaction_with_behavior(TransactionBehavior::Immediate) {
            Ok(mut tx) => match body(&mut tx) {
                Ok(value) => tx.commit().map(|()| value).map_err(PersistenceError::from),
                Err(e) => {
                    if let Err(rollback) = tx.rollback() {
                        error!(error = %rollback, "Rollback failed");
                    }
                    Err(e)
                }
            },
            Err(e) => Err(e.into()),
        };
        debug_assert!(conn.is_autocommit());

        if let Err(e) = &outcome {
            warn!(error = %e, "Transaction rolled back");
        }
        outcome
    }

    fn with_connection<T, F>(&self, f: F) -> Result<T, PersistenceError>
    where
        F: FnOnce(&Connection) -> Result<T, PersistenceError>,
    {
        let guard = self.lock();
        let conn = guard.as_ref().ok_or(PersistenceError::Closed)?;
        f(conn)
    }

    fn lock(&self) -> MutexGuard<'_, Option<Connection>> {
        // A panic inside a transaction body poisons the lock, but the
        // transaction has already rolled back on unwind.
        self.conn.lock().unwrap_or_else(|poisoned| {
            warn!("Database lock was poisoned, recovering");
            poisoned.into_inner()
        })
    }
}

impl Drop for StorageEngine {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sql_params;
    use tempfile::TempDir;

    fn open_engine(dir: &TempDir) -> StorageEngine {
        let engine = StorageEngine::new(dir.path().join("state.db"), EngineTuning::default());
        assert!(engine.initialize());
        engine
    }

    fn count(engine: &StorageEngine, table: &str) -> i64 {
        engine
            .query_row(&format!("SELECT COUNT(*) FROM {table}"), &[], |row| row.get(0))
            .flatten()
            .unwrap()
    }

    #[test]
    fn test_initialize_creates_file_and_schema() {
        let dir = TempDir::new().unwrap();
        let engine = StorageEngine::new(dir.path().join("nested/state.db"), EngineTuning::default());
        assert!(!engine.database_exists());
        assert!(engine.initialize());
        assert!(engine.database_exists());
        assert!(engine.is_open());
        assert_eq!(engine.schema_version(), Some(schema::CURRENT_SCHEMA_VERSION));
    }

    #[test]
    fn test_pragmas_applied() {
        let dir = TempDir::new().unwrap();
        let engine = open_engine(&dir);
        let fk: i64 = engine
            .query_row("PRAGMA foreign_keys", &[], |row| row.get(0))
            .flatten()
            .unwrap();
        let mode: String = engine
            .query_row("PRAGMA journal_mode", &[], |row| row.get(0))
            .flatten()
            .unwrap();
        assert_eq!(fk, 1);
        assert_eq!(mode.to_lowercase(), "wal");
    }

    #[test]
    fn test_initialize_failure_leaves_engine_closed() {
        let dir = TempDir::new().unwrap();
        // A directory where the file should be cannot be opened as a database.
        let path = dir.path().join("occupied");
        std::fs::create_dir_all(&path).unwrap();
        let engine = StorageEngine::new(&path, EngineTuning::default());

        assert!(!engine.initialize());
        assert!(!engine.is_open());
        assert_eq!(engine.execute("DELETE FROM cooldowns", &[]), 0);
        assert!(engine.query_rows("SELECT 1", &[], |row| row.get::<_, i64>(0)).is_none());
        assert!(matches!(
            engine.transaction(|_| Ok(())),
            Err(PersistenceError::Closed)
        ));
    }

    #[test]
    fn test_close_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let engine = open_engine(&dir);
        engine.close();
        engine.close();
        assert!(!engine.is_open());
        assert!(engine.database_exists());
        assert_eq!(engine.schema_version(), None);
    }

    #[test]
    fn test_query_error_returns_none() {
        let dir = TempDir::new().unwrap();
        let engine = open_engine(&dir);
        assert!(engine
            .query_rows("SELECT nope FROM missing_table", &[], |row| row.get::<_, i64>(0))
            .is_none());
        assert_eq!(
            engine.query_rows("SELECT kind FROM cooldowns", &[], |row| row.get::<_, String>(0)),
            Some(vec![])
        );
    }

    #[test]
    fn test_execute_reports_affected_rows() {
        let dir = TempDir::new().unwrap();
        let engine = open_engine(&dir);
        let changed = engine.execute(
            "INSERT INTO blacklist (external_id) VALUES (?1), (?2)",
            sql_params!["100", "200"],
        );
        assert_eq!(changed, 2);
        assert_eq!(engine.execute("INSERT INTO nowhere VALUES (1)", &[]), 0);
    }

    #[test]
    fn test_sequential_cooldown_writes_are_visible_in_order() {
        let dir = TempDir::new().unwrap();
        let engine = open_engine(&dir);
        let upsert = "INSERT INTO cooldowns (kind, identifier, last_used) VALUES (?1, ?2, ?3) \
                      ON CONFLICT(kind, identifier) DO UPDATE SET last_used = excluded.last_used";

        assert_eq!(
            engine.execute(upsert, sql_params!["reputation", "alice", "2024-01-01T10:00:00"]),
            1
        );
        assert_eq!(
            engine.execute(upsert, sql_params!["reputation", "alice", "2024-01-01T11:00:00"]),
            1
        );

        let last: String = engine
            .query_row(
                "SELECT last_used FROM cooldowns WHERE kind = ?1 AND identifier = ?2",
                sql_params!["reputation", "alice"],
                |row| row.get(0),
            )
            .flatten()
            .unwrap();
        assert_eq!(last, "2024-01-01T11:00:00");
        assert_eq!(count(&engine, "cooldowns"), 1);
    }

    #[test]
    fn test_transaction_commits() {
        let dir = TempDir::new().unwrap();
        let engine = open_engine(&dir);
        let inserted = engine
            .transaction(|tx| {
                tx.execute("INSERT INTO whitelist (external_id) VALUES ('1')", [])?;
                tx.execute("INSERT INTO whitelist (external_id) VALUES ('2')", [])?;
                Ok(2)
            })
            .unwrap();
        assert_eq!(inserted, 2);
        assert_eq!(count(&engine, "whitelist"), 2);
    }

    #[test]
    fn test_transaction_error_rolls_back_partial_writes() {
        let dir = TempDir::new().unwrap();
        let engine = open_engine(&dir);
        engine.execute("INSERT INTO whitelist (external_id) VALUES ('keep')", &[]);

        let result: Result<(), _> = engine.transaction(|tx| {
            tx.execute("INSERT INTO whitelist (external_id) VALUES ('a')", [])?;
            tx.execute("DELETE FROM whitelist WHERE external_id = 'keep'", [])?;
            Err(PersistenceError::Import("boom".to_string()))
        });

        assert!(result.is_err());
        let ids = engine
            .query_rows("SELECT external_id FROM whitelist", &[], |row| row.get::<_, String>(0))
            .unwrap();
        assert_eq!(ids, vec!["keep".to_string()]);
    }

    #[test]
    fn test_transaction_panic_rolls_back_and_engine_recovers() {
        let dir = TempDir::new().unwrap();
        let engine = open_engine(&dir);

        let panicked = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _: Result<(), PersistenceError> = engine.transaction(|tx| {
                tx.execute("INSERT INTO whitelist (external_id) VALUES ('x')", [])?;
                panic!("body failed");
            });
        }));

        assert!(panicked.is_err());
        assert_eq!(count(&engine, "whitelist"), 0);
        assert_eq!(
            engine.execute("INSERT INTO whitelist (external_id) VALUES ('y')", &[]),
            1
        );
    }

    #[test]
    fn test_reopen_does_not_rerun_schema_steps() {
        let dir = TempDir::new().unwrap();
        let engine = open_engine(&dir);
        engine.execute("DROP INDEX idx_join_log_actor", &[]);
        engine.close();

        let reopened = open_engine(&dir);
        let present: i64 = reopened
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'index' AND name = 'idx_join_log_actor'",
                &[],
                |row| row.get(0),
            )
            .flatten()
            .unwrap();
        assert_eq!(present, 0);
        assert_eq!(reopened.schema_version(), Some(schema::CURRENT_SCHEMA_VERSION));
    }

    #[test]
    fn test_engine_is_shareable_across_threads() {
        let dir = TempDir::new().unwrap();
        let engine = std::sync::Arc::new(open_engine(&dir));

        let handles: Vec<_> = (0..4)
            .map(|worker| {
                let engine = engine.clone();
                std::thread::spawn(move || {
                    for i in 0..25 {
                        engine.execute(
                            "INSERT INTO blacklist (external_id) VALUES (?1)",
                            sql_params![format!("{worker}-{i}")],
                        );
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(count(&engine, "blacklist"), 100);
    }
}
