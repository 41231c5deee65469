//! One-time promotion of the flat JSON documents into the relational schema.
//!
//! The run is gated by the `legacy_json` row of `migration_status`. Once that
//! row says completed, later runs return immediately without touching the
//! data directory. Every entity group is imported inside its own savepoint of
//! a single transaction: a group that fails is rolled back and reported, the
//! others still land, and the completion mark is written in the same
//! transaction.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rusqlite::{params, OptionalExtension, Transaction};
use tracing::{error, info, warn};

use crate::domain::{
    CooldownAdapter, GameStatsAdapter, IdentityAdapter, ReputationAdapter, StatisticsAdapter,
};
use crate::dual::{StoreAdapter, StoreHandle};
use crate::engine::{schema, StorageEngine};
use crate::json_file::JsonDocument;
use crate::sql_params;
use crate::time::{self, format_timestamp, TimestampCodec, TimestampFallback};
use crate::PersistenceError;

pub const LEGACY_MIGRATION_KIND: &str = "legacy_json";

/// Files the importer looks for, in import order. Payments never had a
/// legacy file.
pub const LEGACY_FILES: [&str; 5] = [
    <IdentityAdapter as StoreAdapter>::FILE_NAME,
    <ReputationAdapter as StoreAdapter>::FILE_NAME,
    <StatisticsAdapter as StoreAdapter>::FILE_NAME,
    <GameStatsAdapter as StoreAdapter>::FILE_NAME,
    <CooldownAdapter as StoreAdapter>::FILE_NAME,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportStatus {
    /// Marked completed by an earlier run; nothing was read.
    AlreadyCompleted,
    /// No legacy file present; marked completed.
    NothingToImport,
    Imported,
    /// Marked completed, but at least one group was rolled back.
    ImportedWithWarnings,
}

impl fmt::Display for ImportStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ImportStatus::AlreadyCompleted => "already completed",
            ImportStatus::NothingToImport => "nothing to import",
            ImportStatus::Imported => "imported",
            ImportStatus::ImportedWithWarnings => "imported with warnings",
        };
        f.write_str(s)
    }
}

/// Outcome of one entity group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupReport {
    pub group: &'static str,
    /// Whether the legacy file existed.
    pub present: bool,
    pub rows: usize,
    /// Set when the group was skipped or rolled back.
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportReport {
    pub status: ImportStatus,
    pub groups: Vec<GroupReport>,
    /// Timestamps that parsed in neither accepted format.
    pub timestamp_fallbacks: u64,
}

impl ImportReport {
    fn without_groups(status: ImportStatus) -> Self {
        Self {
            status,
            groups: Vec::new(),
            timestamp_fallbacks: 0,
        }
    }

    pub fn rows_imported(&self) -> usize {
        self.groups.iter().map(|g| g.rows).sum()
    }

    pub fn warnings(&self) -> impl Iterator<Item = &GroupReport> {
        self.groups.iter().filter(|g| g.error.is_some())
    }
}

impl fmt::Display for ImportReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "legacy import: {}", self.status)?;
        for g in &self.groups {
            match (&g.error, g.present) {
                (Some(e), _) => writeln!(f, "  {:<12} failed: {e}", g.group)?,
                (None, true) => writeln!(f, "  {:<12} {} rows", g.group, g.rows)?,
                (None, false) => writeln!(f, "  {:<12} no file", g.group)?,
            }
        }
        if self.timestamp_fallbacks > 0 {
            writeln!(
                f,
                "  {} timestamps could not be parsed and were substituted",
                self.timestamp_fallbacks
            )?;
        }
        Ok(())
    }
}

/// A decoded group waiting for the transaction.
enum Staged<S> {
    Missing,
    Unreadable(String),
    Loaded(S),
}

pub struct LegacyImporter {
    engine: Arc<StorageEngine>,
    data_dir: PathBuf,
    fallback: TimestampFallback,
}

impl LegacyImporter {
    pub fn new(
        engine: Arc<StorageEngine>,
        data_dir: impl Into<PathBuf>,
        fallback: TimestampFallback,
    ) -> Self {
        Self {
            engine,
            data_dir: data_dir.into(),
            fallback,
        }
    }

    pub fn from_handle(handle: &StoreHandle) -> Self {
        Self::new(
            handle.engine().clone(),
            handle.data_dir(),
            handle.timestamps().fallback(),
        )
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Whether the completion mark is set. `false` also when the engine
    /// cannot answer.
    pub fn is_completed(&self) -> bool {
        self.engine
            .query_row(
                "SELECT completed FROM migration_status WHERE migration_kind = ?1",
                sql_params![LEGACY_MIGRATION_KIND],
                |row| row.get::<_, bool>(0),
            )
            .flatten()
            .unwrap_or(false)
    }

    /// Legacy files currently present in the data directory.
    pub fn legacy_files(&self) -> Vec<PathBuf> {
        LEGACY_FILES
            .iter()
            .map(|name| self.data_dir.join(name))
            .filter(|path| path.is_file())
            .collect()
    }

    /// Clear the completion mark so the next run imports again. Rows already
    /// imported stay; a rerun only adds what is missing.
    pub fn reset_status(&self) -> bool {
        self.engine.execute(
            "DELETE FROM migration_status WHERE migration_kind = ?1",
            sql_params![LEGACY_MIGRATION_KIND],
        ) > 0
    }

    /// Run the import if it has not completed yet.
    ///
    /// On `Err` nothing was committed and the status stays unmarked, so the
    /// next start retries.
    pub fn run(&self) -> Result<ImportReport, PersistenceError> {
        self.run_inner().inspect_err(|e| {
            error!(
                data_dir = %self.data_dir.display(),
                error = %e,
                "Legacy import failed, will retry on next start"
            );
        })
    }

    fn run_inner(&self) -> Result<ImportReport, PersistenceError> {
        let completed = self.engine.transaction(|tx| {
            tx.execute_batch(schema::CREATE_MIGRATION_STATUS_TABLE)?;
            let done = tx
                .query_row(
                    "SELECT completed FROM migration_status WHERE migration_kind = ?1",
                    [LEGACY_MIGRATION_KIND],
                    |row| row.get::<_, bool>(0),
                )
                .optional()?;
            Ok(done.unwrap_or(false))
        })?;
        if completed {
            info!("Legacy import already completed, skipping");
            return Ok(ImportReport::without_groups(ImportStatus::AlreadyCompleted));
        }

        let files = self.legacy_files();
        if files.is_empty() {
            self.engine.transaction(|tx| mark_completed(tx))?;
            info!(data_dir = %self.data_dir.display(), "No legacy files found, nothing to import");
            return Ok(ImportReport::without_groups(ImportStatus::NothingToImport));
        }

        info!(
            data_dir = %self.data_dir.display(),
            files = files.len(),
            "Starting legacy import"
        );

        let codec = TimestampCodec::new(self.fallback);
        let identities = self.stage(&IdentityAdapter, &codec);
        let reputation = self.stage(&ReputationAdapter, &codec);
        let statistics = self.stage(&StatisticsAdapter, &codec);
        let game_stats = self.stage(&GameStatsAdapter, &codec);
        let cooldowns = self.stage(&CooldownAdapter, &codec);

        let groups = self.engine.transaction(|tx| {
            let groups = vec![
                import_group(tx, &IdentityAdapter, identities)?,
                import_group(tx, &ReputationAdapter, reputation)?,
                import_group(tx, &StatisticsAdapter, statistics)?,
                import_group(tx, &GameStatsAdapter, game_stats)?,
                import_group(tx, &CooldownAdapter, cooldowns)?,
            ];
            mark_completed(tx)?;
            Ok(groups)
        })?;

        let status = if groups.iter().any(|g| g.error.is_some()) {
            ImportStatus::ImportedWithWarnings
        } else {
            ImportStatus::Imported
        };
        let report = ImportReport {
            status,
            groups,
            timestamp_fallbacks: codec.substituted(),
        };

        if report.timestamp_fallbacks > 0 {
            warn!(
                count = report.timestamp_fallbacks,
                fallback = %self.fallback,
                "Some legacy timestamps were substituted, their original times are lost"
            );
        }
        info!(
            rows = report.rows_imported(),
            failed_groups = report.warnings().count(),
            status = %report.status,
            "Legacy import completed"
        );
        Ok(report)
    }

    fn stage<A: StoreAdapter>(&self, adapter: &A, codec: &TimestampCodec) -> Staged<A::State> {
        let file = JsonDocument::<A::Document>::new(self.data_dir.join(A::FILE_NAME));
        match file.load() {
            Ok(Some(doc)) => Staged::Loaded(adapter.decode(doc, codec)),
            Ok(None) => Staged::Missing,
            Err(e) => {
                warn!(
                    group = A::NAME,
                    path = %file.path().display(),
                    error = %e,
                    "Legacy file unreadable, skipping group"
                );
                Staged::Unreadable(e.to_string())
            }
        }
    }
}

fn import_group<A: StoreAdapter>(
    tx: &mut Transaction<'_>,
    adapter: &A,
    staged: Staged<A::State>,
) -> Result<GroupReport, PersistenceError> {
    let mut report = GroupReport {
        group: A::NAME,
        present: true,
        rows: 0,
        error: None,
    };
    let state = match staged {
        Staged::Missing => {
            report.present = false;
            return Ok(report);
        }
        Staged::Unreadable(e) => {
            report.error = Some(e);
            return Ok(report);
        }
        Staged::Loaded(state) => state,
    };

    let sp = tx.savepoint()?;
    match adapter.merge_relational(&sp, &state) {
        Ok(rows) => {
            sp.commit()?;
            info!(group = A::NAME, rows, "Imported legacy group");
            report.rows = rows;
        }
        Err(e) => {
            // Dropping the savepoint rolls back this group's writes only.
            drop(sp);
            warn!(group = A::NAME, error = %e, "Legacy group rolled back");
            report.error = Some(e.to_string());
        }
    }
    Ok(report)
}

fn mark_completed(tx: &Transaction<'_>) -> Result<(), PersistenceError> {
    tx.execute(
        "INSERT INTO migration_status (migration_kind, completed, completed_at) VALUES (?1, 1, ?2) \
         ON CONFLICT(migration_kind) DO UPDATE SET completed = 1, completed_at = excluded.completed_at",
        params![LEGACY_MIGRATION_KIND, format_timestamp(&time::now())],
    )?;
    Ok(())
}
