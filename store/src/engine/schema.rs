//! Database schema definitions and the index migration ladder.
//!
//! Tables are created with `CREATE TABLE IF NOT EXISTS` on every start.
//! Indexes and table rebuilds live in [`SCHEMA_MIGRATIONS`] and run exactly
//! once per version step; the highest applied step is recorded in `db_version`.

use rusqlite::{Connection, OptionalExtension};
use tracing::{info, warn};

pub const CREATE_IDENTITIES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS identities (
    external_id TEXT PRIMARY KEY,
    display_name TEXT NOT NULL,
    registered_at TEXT NOT NULL,
    gender TEXT,
    unlinked INTEGER NOT NULL DEFAULT 0 CHECK (unlinked IN (0, 1)),
    original_name TEXT
)
"#;

pub const CREATE_HIDDEN_NAMES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS hidden_names (
    display_name TEXT PRIMARY KEY COLLATE NOCASE
)
"#;

pub const CREATE_BLACKLIST_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS blacklist (
    external_id TEXT PRIMARY KEY
)
"#;

pub const CREATE_WHITELIST_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS whitelist (
    external_id TEXT PRIMARY KEY
)
"#;

pub const CREATE_REPUTATION_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS reputation (
    player_name TEXT PRIMARY KEY COLLATE NOCASE,
    positive INTEGER NOT NULL DEFAULT 0 CHECK (positive >= 0),
    negative INTEGER NOT NULL DEFAULT 0 CHECK (negative >= 0)
)
"#;

pub const CREATE_REPUTATION_HISTORY_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS reputation_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    player_name TEXT NOT NULL COLLATE NOCASE
        REFERENCES reputation(player_name) ON DELETE CASCADE,
    source_name TEXT NOT NULL,
    is_positive INTEGER NOT NULL CHECK (is_positive IN (0, 1)),
    created_at TEXT NOT NULL,
    reason TEXT
)
"#;

pub const CREATE_JOIN_LOG_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS join_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    actor_id TEXT NOT NULL,
    display_name TEXT NOT NULL,
    joined_at TEXT NOT NULL,
    UNIQUE (actor_id, joined_at)
)
"#;

pub const CREATE_DAILY_PLAYTIME_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS daily_playtime (
    actor_id TEXT NOT NULL,
    play_date TEXT NOT NULL,
    minutes INTEGER NOT NULL DEFAULT 0 CHECK (minutes >= 0),
    PRIMARY KEY (actor_id, play_date)
)
"#;

pub const CREATE_GAME_STATS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS game_stats (
    external_id TEXT PRIMARY KEY,
    games_played INTEGER NOT NULL DEFAULT 0,
    wins INTEGER NOT NULL DEFAULT 0,
    losses INTEGER NOT NULL DEFAULT 0,
    total_earned INTEGER NOT NULL DEFAULT 0,
    total_time_secs INTEGER NOT NULL DEFAULT 0
)
"#;

pub const CREATE_COOLDOWNS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS cooldowns (
    kind TEXT NOT NULL,
    identifier TEXT NOT NULL,
    last_used TEXT NOT NULL,
    PRIMARY KEY (kind, identifier)
)
"#;

pub const CREATE_PAYMENTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS payments (
    id TEXT PRIMARY KEY,
    sender TEXT NOT NULL,
    receiver TEXT NOT NULL,
    amount REAL NOT NULL,
    created_at TEXT NOT NULL,
    status TEXT NOT NULL
)
"#;

pub const CREATE_MIGRATION_STATUS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS migration_status (
    migration_kind TEXT PRIMARY KEY,
    completed INTEGER NOT NULL DEFAULT 0 CHECK (completed IN (0, 1)),
    completed_at TEXT
)
"#;

pub const CREATE_DB_VERSION_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS db_version (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    version INTEGER NOT NULL
)
"#;

/// Index DDL per schema version, applied in ascending order.
pub const SCHEMA_MIGRATIONS: &[(i64, &[&str])] = &[
    (
        1,
        &[
            "CREATE INDEX IF NOT EXISTS idx_identities_name ON identities(display_name COLLATE NOCASE)",
            "CREATE INDEX IF NOT EXISTS idx_reputation_history_player ON reputation_history(player_name)",
            "CREATE INDEX IF NOT EXISTS idx_join_log_joined_at ON join_log(joined_at)",
            "CREATE INDEX IF NOT EXISTS idx_join_log_actor ON join_log(actor_id)",
            "CREATE INDEX IF NOT EXISTS idx_daily_playtime_date ON daily_playtime(play_date)",
        ],
    ),
    (
        2,
        &[
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_identities_active_name \
             ON identities(display_name COLLATE NOCASE) WHERE unlinked = 0",
            "CREATE INDEX IF NOT EXISTS idx_payments_sender ON payments(sender)",
            "CREATE INDEX IF NOT EXISTS idx_payments_receiver ON payments(receiver)",
            "CREATE INDEX IF NOT EXISTS idx_payments_created_at ON payments(created_at)",
        ],
    ),
    (
        3,
        // Rebuild without the (player, source, time) key: one source may
        // give several events within the same second.
        &[
            "CREATE TABLE reputation_history_rebuild (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                player_name TEXT NOT NULL COLLATE NOCASE
                    REFERENCES reputation(player_name) ON DELETE CASCADE,
                source_name TEXT NOT NULL,
                is_positive INTEGER NOT NULL CHECK (is_positive IN (0, 1)),
                created_at TEXT NOT NULL,
                reason TEXT
            )",
            "INSERT INTO reputation_history_rebuild \
             (id, player_name, source_name, is_positive, created_at, reason) \
             SELECT id, player_name, source_name, is_positive, created_at, reason \
             FROM reputation_history",
            "DROP TABLE reputation_history",
            "ALTER TABLE reputation_history_rebuild RENAME TO reputation_history",
            "CREATE INDEX IF NOT EXISTS idx_reputation_history_player ON reputation_history(player_name)",
        ],
    ),
];

/// Version the running binary expects.
pub const CURRENT_SCHEMA_VERSION: i64 = 3;

/// Domain tables in creation order (parents before children).
pub const DOMAIN_TABLES: &[&str] = &[
    "identities",
    "hidden_names",
    "blacklist",
    "whitelist",
    "reputation",
    "reputation_history",
    "join_log",
    "daily_playtime",
    "game_stats",
    "cooldowns",
    "payments",
];

/// All table creation statements.
pub fn all_table_statements() -> [&'static str; 13] {
    [
        CREATE_IDENTITIES_TABLE,
        CREATE_HIDDEN_NAMES_TABLE,
        CREATE_BLACKLIST_TABLE,
        CREATE_WHITELIST_TABLE,
        CREATE_REPUTATION_TABLE,
        CREATE_REPUTATION_HISTORY_TABLE,
        CREATE_JOIN_LOG_TABLE,
        CREATE_DAILY_PLAYTIME_TABLE,
        CREATE_GAME_STATS_TABLE,
        CREATE_COOLDOWNS_TABLE,
        CREATE_PAYMENTS_TABLE,
        CREATE_MIGRATION_STATUS_TABLE,
        CREATE_DB_VERSION_TABLE,
    ]
}

/// Result of a schema upgrade that actually ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchemaUpgrade {
    pub from: i64,
    pub to: i64,
}

pub(crate) fn create_tables(conn: &Connection) -> rusqlite::Result<()> {
    for stmt in all_table_statements() {
        conn.execute_batch(stmt)?;
    }
    Ok(())
}

/// Stored schema version, `0` when no version row exists yet.
pub(crate) fn stored_version(conn: &Connection) -> rusqlite::Result<i64> {
    Ok(conn
        .query_row("SELECT version FROM db_version WHERE id = 1", [], |row| {
            row.get(0)
        })
        .optional()?
        .unwrap_or(0))
}

/// Apply every index step newer than the stored version, then record the new
/// version. Returns `None` when nothing was pending.
pub(crate) fn upgrade(conn: &mut Connection) -> rusqlite::Result<Option<SchemaUpgrade>> {
    let from = stored_version(conn)?;
    if from > CURRENT_SCHEMA_VERSION {
        warn!(
            stored = from,
            expected = CURRENT_SCHEMA_VERSION,
            "Database schema is newer than this binary, leaving it untouched"
        );
        return Ok(None);
    }

    let pending: Vec<&(i64, &[&str])> = SCHEMA_MIGRATIONS
        .iter()
        .filter(|(version, _)| *version > from)
        .collect();
    if pending.is_empty() {
        return Ok(None);
    }

    let tx = conn.transaction()?;
    for (version, statements) in &pending {
        for stmt in statements.iter() {
            tx.execute_batch(stmt)?;
        }
        info!(version, "Applied schema step");
    }
    tx.execute(
        "INSERT INTO db_version (id, version) VALUES (1, ?1) \
         ON CONFLICT(id) DO UPDATE SET version = excluded.version \
         WHERE excluded.version > db_version.version",
        [CURRENT_SCHEMA_VERSION],
    )?;
    tx.commit()?;

    Ok(Some(SchemaUpgrade {
        from,
        to: CURRENT_SCHEMA_VERSION,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        create_tables(&conn).unwrap();
        conn
    }

    #[test]
    fn test_ladder_is_ascending_and_ends_at_current() {
        let versions: Vec<i64> = SCHEMA_MIGRATIONS.iter().map(|(v, _)| *v).collect();
        assert!(versions.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(versions.last().copied(), Some(CURRENT_SCHEMA_VERSION));
    }

    #[test]
    fn test_create_tables_is_idempotent() {
        let conn = fresh();
        create_tables(&conn).unwrap();
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, all_table_statements().len() as i64);
    }

    #[test]
    fn test_upgrade_runs_once() {
        let mut conn = fresh();
        assert_eq!(stored_version(&conn).unwrap(), 0);

        let first = upgrade(&mut conn).unwrap();
        assert_eq!(first, Some(SchemaUpgrade { from: 0, to: CURRENT_SCHEMA_VERSION }));
        assert_eq!(stored_version(&conn).unwrap(), CURRENT_SCHEMA_VERSION);

        assert_eq!(upgrade(&mut conn).unwrap(), None);
    }

    #[test]
    fn test_upgrade_from_partial_version_applies_only_newer_steps() {
        let mut conn = fresh();
        conn.execute("INSERT INTO db_version (id, version) VALUES (1, 1)", [])
            .unwrap();

        let upgrade = upgrade(&mut conn).unwrap().unwrap();
        assert_eq!(upgrade.from, 1);

        let index_count = |name: &str| -> i64 {
            conn.query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'index' AND name = ?1",
                [name],
                |row| row.get(0),
            )
            .unwrap()
        };
        assert_eq!(index_count("idx_join_log_actor"), 0);
        assert_eq!(index_count("idx_payments_sender"), 1);
    }

    #[test]
    fn test_history_rebuild_keeps_rows_and_allows_same_second_events() {
        let mut conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE reputation_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                player_name TEXT NOT NULL COLLATE NOCASE
                    REFERENCES reputation(player_name) ON DELETE CASCADE,
                source_name TEXT NOT NULL,
                is_positive INTEGER NOT NULL CHECK (is_positive IN (0, 1)),
                created_at TEXT NOT NULL,
                reason TEXT,
                UNIQUE (player_name, source_name, created_at)
            );",
        )
        .unwrap();
        create_tables(&conn).unwrap();
        conn.execute("INSERT INTO db_version (id, version) VALUES (1, 2)", [])
            .unwrap();
        let insert = "INSERT INTO reputation_history \
                      (player_name, source_name, is_positive, created_at) \
                      VALUES ('alice', 'bob', ?1, '2024-01-01T12:00:00')";
        conn.execute(insert, [1]).unwrap();
        assert!(conn.execute(insert, [0]).is_err());

        upgrade(&mut conn).unwrap().unwrap();
        conn.execute(insert, [0]).unwrap();

        let rows: Vec<(i64, bool)> = conn
            .prepare("SELECT id, is_positive FROM reputation_history ORDER BY id")
            .unwrap()
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(rows, vec![(1, true), (2, false)]);
        let indexed: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master \
                 WHERE type = 'index' AND name = 'idx_reputation_history_player'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(indexed, 1);
    }

    #[test]
    fn test_newer_version_is_never_lowered() {
        let mut conn = fresh();
        conn.execute("INSERT INTO db_version (id, version) VALUES (1, 99)", [])
            .unwrap();
        assert_eq!(upgrade(&mut conn).unwrap(), None);
        assert_eq!(stored_version(&conn).unwrap(), 99);
    }

    #[test]
    fn test_active_name_is_unique_case_insensitively() {
        let mut conn = fresh();
        upgrade(&mut conn).unwrap();
        let insert = "INSERT INTO identities (external_id, display_name, registered_at, unlinked) \
                      VALUES (?1, ?2, '2024-01-01T00:00:00', ?3)";
        conn.execute(insert, rusqlite::params!["1", "Alice", 0]).unwrap();
        assert!(conn.execute(insert, rusqlite::params!["2", "alice", 0]).is_err());
        // An unlinked record may share the name.
        conn.execute(insert, rusqlite::params!["3", "ALICE", 1]).unwrap();
    }
}
