//! Last-use timestamps per `(kind, identifier)`.
//!
//! Rows are only ever upserted. An absent entry means no cooldown is
//! running.

use std::collections::BTreeMap;

use chrono::{Duration, NaiveDateTime};
use rusqlite::{params, Connection};

use crate::dual::StoreAdapter;
use crate::engine::{timestamp_column, StorageEngine};
use crate::sql_params;
use crate::time::{format_timestamp, TimestampCodec};
use crate::PersistenceError;

const UPSERT_COOLDOWN: &str = "INSERT INTO cooldowns (kind, identifier, last_used) VALUES (?1, ?2, ?3) \
     ON CONFLICT(kind, identifier) DO UPDATE SET last_used = excluded.last_used";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CooldownTable {
    entries: BTreeMap<String, BTreeMap<String, NaiveDateTime>>,
}

impl CooldownTable {
    pub fn touch(&mut self, kind: &str, identifier: &str, at: NaiveDateTime) {
        self.entries
            .entry(kind.to_string())
            .or_default()
            .insert(identifier.to_string(), at);
    }

    pub fn last_used(&self, kind: &str, identifier: &str) -> Option<NaiveDateTime> {
        self.entries.get(kind)?.get(identifier).copied()
    }

    /// Time left before `identifier` may act again, `None` when free.
    pub fn remaining(
        &self,
        kind: &str,
        identifier: &str,
        cooldown: Duration,
        now: NaiveDateTime,
    ) -> Option<Duration> {
        let ends = self.last_used(kind, identifier)? + cooldown;
        (ends > now).then(|| ends - now)
    }

    pub fn is_active(
        &self,
        kind: &str,
        identifier: &str,
        cooldown: Duration,
        now: NaiveDateTime,
    ) -> bool {
        self.remaining(kind, identifier, cooldown, now).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CooldownAdapter;

impl CooldownAdapter {
    fn upsert_all(conn: &Connection, state: &CooldownTable) -> rusqlite::Result<usize> {
        let mut upsert = conn.prepare_cached(UPSERT_COOLDOWN)?;
        let mut written = 0;
        for (kind, ids) in &state.entries {
            for (id, at) in ids {
                written += upsert.execute(params![kind, id, format_timestamp(at)])?;
            }
        }
        Ok(written)
    }
}

impl StoreAdapter for CooldownAdapter {
    type State = CooldownTable;
    /// kind -> identifier -> timestamp text
    type Document = BTreeMap<String, BTreeMap<String, String>>;

    const NAME: &'static str = "cooldowns";
    const FILE_NAME: &'static str = "cooldowns.json";

    fn load_relational(&self, engine: &StorageEngine) -> Option<CooldownTable> {
        let rows = engine.query_rows(
            "SELECT kind, identifier, last_used FROM cooldowns",
            &[],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    timestamp_column(row, 2)?,
                ))
            },
        )?;
        let mut table = CooldownTable::default();
        for (kind, id, at) in rows {
            table.touch(&kind, &id, at);
        }
        Some(table)
    }

    fn write_relational(
        &self,
        conn: &Connection,
        state: &CooldownTable,
    ) -> Result<(), PersistenceError> {
        Self::upsert_all(conn, state)?;
        Ok(())
    }

    fn merge_relational(
        &self,
        conn: &Connection,
        state: &CooldownTable,
    ) -> Result<usize, PersistenceError> {
        Ok(Self::upsert_all(conn, state)?)
    }

    fn decode(&self, doc: Self::Document, timestamps: &TimestampCodec) -> CooldownTable {
        let mut table = CooldownTable::default();
        for (kind, ids) in doc {
            for (id, raw) in ids {
                let context = format!("cooldown {kind}/{id}");
                if let Some(at) = timestamps.decode(&raw, &context) {
                    table.touch(&kind, &id, at);
                }
            }
        }
        table
    }

    fn encode(&self, state: &CooldownTable) -> Self::Document {
        state
            .entries
            .iter()
            .map(|(kind, ids)| {
                let ids = ids.iter().map(|(id, at)| (id.clone(), format_timestamp(at))).collect();
                (kind.clone(), ids)
            })
            .collect()
    }
}

/// Record a use directly in the database. Returns false if nothing was
/// written.
pub fn touch(engine: &StorageEngine, kind: &str, identifier: &str, at: NaiveDateTime) -> bool {
    engine.execute(UPSERT_COOLDOWN, sql_params![kind, identifier, at]) > 0
}

/// Outer `None` when the query failed, inner `None` when no cooldown exists.
pub fn last_used(engine: &StorageEngine, kind: &str, identifier: &str) -> Option<Option<NaiveDateTime>> {
    engine.query_row(
        "SELECT last_used FROM cooldowns WHERE kind = ?1 AND identifier = ?2",
        sql_params![kind, identifier],
        |row| timestamp_column(row, 0),
    )
}
