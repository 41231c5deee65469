//! Join log and daily playtime.
//!
//! Besides the [`StatisticsAdapter`], this module carries a few queries that
//! go straight to the engine. They exist for reports over ranges that would
//! be wasteful to answer from a full in-memory load.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{NaiveDate, NaiveDateTime};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::dual::StoreAdapter;
use crate::engine::{date_column, timestamp_column, uuid_column, StorageEngine};
use crate::sql_params;
use crate::time::{format_date, format_timestamp, parse_date, TimestampCodec};
use crate::PersistenceError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinRecord {
    pub actor_id: Uuid,
    pub display_name: String,
    pub joined_at: NaiveDateTime,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlayStatistics {
    joins: Vec<JoinRecord>,
    playtime: BTreeMap<Uuid, BTreeMap<NaiveDate, u32>>,
}

impl PlayStatistics {
    /// Append a join. A second join of the same actor at the same second is
    /// ignored.
    pub fn record_join(&mut self, actor_id: Uuid, display_name: &str, at: NaiveDateTime) -> bool {
        if self
            .joins
            .iter()
            .any(|j| j.actor_id == actor_id && j.joined_at == at)
        {
            return false;
        }
        self.joins.push(JoinRecord {
            actor_id,
            display_name: display_name.to_string(),
            joined_at: at,
        });
        true
    }

    /// Add `minutes` to the actor's total for `date`.
    pub fn add_playtime(&mut self, actor_id: Uuid, date: NaiveDate, minutes: u32) -> u32 {
        let total = self
            .playtime
            .entry(actor_id)
            .or_default()
            .entry(date)
            .or_insert(0);
        *total = total.saturating_add(minutes);
        *total
    }

    pub fn minutes_on(&self, actor_id: Uuid, date: NaiveDate) -> u32 {
        self.playtime
            .get(&actor_id)
            .and_then(|days| days.get(&date))
            .copied()
            .unwrap_or(0)
    }

    pub fn total_minutes(&self, actor_id: Uuid) -> u64 {
        self.playtime
            .get(&actor_id)
            .map(|days| days.values().map(|m| u64::from(*m)).sum())
            .unwrap_or(0)
    }

    /// Distinct actors who joined in `[from, to)`.
    pub fn unique_visitors(&self, from: NaiveDateTime, to: NaiveDateTime) -> usize {
        self.joins
            .iter()
            .filter(|j| j.joined_at >= from && j.joined_at < to)
            .map(|j| j.actor_id)
            .collect::<BTreeSet<_>>()
            .len()
    }

    pub fn joins(&self) -> &[JoinRecord] {
        &self.joins
    }

    pub fn is_empty(&self) -> bool {
        self.joins.is_empty() && self.playtime.is_empty()
    }

    fn sort_joins(&mut self) {
        self.joins.sort_by(|a, b| a.joined_at.cmp(&b.joined_at));
    }
}

// ── Flat-file document ──────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatisticsDocument {
    #[serde(default)]
    pub joins: Vec<JoinEntry>,
    /// actor id -> date -> minutes
    #[serde(default)]
    pub playtime: BTreeMap<String, BTreeMap<String, u32>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinEntry {
    pub uuid: String,
    pub name: String,
    pub timestamp: String,
}

// ── Adapter ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default)]
pub struct StatisticsAdapter;

impl StatisticsAdapter {
    fn insert_joins(conn: &Connection, state: &PlayStatistics) -> rusqlite::Result<usize> {
        let mut insert = conn.prepare_cached(
            "INSERT OR IGNORE INTO join_log (actor_id, display_name, joined_at) VALUES (?1, ?2, ?3)",
        )?;
        let mut written = 0;
        for join in &state.joins {
            written += insert.execute(params![
                join.actor_id.to_string(),
                join.display_name,
                format_timestamp(&join.joined_at),
            ])?;
        }
        Ok(written)
    }

    fn upsert_playtime(
        conn: &Connection,
        state: &PlayStatistics,
        on_conflict: &str,
    ) -> rusqlite::Result<usize> {
        let mut upsert = conn.prepare(&format!(
            "INSERT INTO daily_playtime (actor_id, play_date, minutes) VALUES (?1, ?2, ?3) \
             ON CONFLICT(actor_id, play_date) DO UPDATE SET {on_conflict}"
        ))?;
        let mut written = 0;
        for (actor, days) in &state.playtime {
            for (date, minutes) in days {
                written += upsert.execute(params![actor.to_string(), format_date(date), minutes])?;
            }
        }
        Ok(written)
    }
}

impl StoreAdapter for StatisticsAdapter {
    type State = PlayStatistics;
    type Document = StatisticsDocument;

    const NAME: &'static str = "statistics";
    const FILE_NAME: &'static str = "statistics.json";

    fn load_relational(&self, engine: &StorageEngine) -> Option<PlayStatistics> {
        let joins = engine.query_rows(
            "SELECT actor_id, display_name, joined_at FROM join_log ORDER BY joined_at, id",
            &[],
            |row| {
                Ok(JoinRecord {
                    actor_id: uuid_column(row, 0)?,
                    display_name: row.get(1)?,
                    joined_at: timestamp_column(row, 2)?,
                })
            },
        )?;
        let days = engine.query_rows(
            "SELECT actor_id, play_date, minutes FROM daily_playtime",
            &[],
            |row| Ok((uuid_column(row, 0)?, date_column(row, 1)?, row.get::<_, u32>(2)?)),
        )?;

        let mut stats = PlayStatistics {
            joins,
            ..PlayStatistics::default()
        };
        for (actor, date, minutes) in days {
            stats.playtime.entry(actor).or_default().insert(date, minutes);
        }
        Some(stats)
    }

    /// Joins are append-only, so an overwrite never removes logged rows;
    /// playtime totals are replaced.
    fn write_relational(
        &self,
        conn: &Connection,
        state: &PlayStatistics,
    ) -> Result<(), PersistenceError> {
        Self::insert_joins(conn, state)?;
        Self::upsert_playtime(conn, state, "minutes = excluded.minutes")?;
        Ok(())
    }

    fn merge_relational(
        &self,
        conn: &Connection,
        state: &PlayStatistics,
    ) -> Result<usize, PersistenceError> {
        let joins = Self::insert_joins(conn, state)?;
        let days = Self::upsert_playtime(conn, state, "minutes = max(minutes, excluded.minutes)")?;
        Ok(joins + days)
    }

    fn decode(&self, doc: StatisticsDocument, timestamps: &TimestampCodec) -> PlayStatistics {
        let mut stats = PlayStatistics::default();
        for entry in doc.joins {
            let Ok(actor) = Uuid::parse_str(&entry.uuid) else {
                warn!(uuid = %entry.uuid, "Skipping join with invalid actor id");
                continue;
            };
            let context = format!("join of {}", entry.name);
            if let Some(at) = timestamps.decode(&entry.timestamp, &context) {
                stats.record_join(actor, &entry.name, at);
            }
        }
        stats.sort_joins();

        for (raw_actor, days) in doc.playtime {
            let Ok(actor) = Uuid::parse_str(&raw_actor) else {
                warn!(uuid = %raw_actor, "Skipping playtime with invalid actor id");
                continue;
            };
            for (raw_date, minutes) in days {
                match parse_date(&raw_date) {
                    Some(date) => {
                        stats.add_playtime(actor, date, minutes);
                    }
                    None => warn!(actor = %actor, date = %raw_date, "Skipping playtime with invalid date"),
                }
            }
        }
        stats
    }

    fn encode(&self, state: &PlayStatistics) -> StatisticsDocument {
        StatisticsDocument {
            joins: state
                .joins
                .iter()
                .map(|j| JoinEntry {
                    uuid: j.actor_id.to_string(),
                    name: j.display_name.clone(),
                    timestamp: format_timestamp(&j.joined_at),
                })
                .collect(),
            playtime: state
                .playtime
                .iter()
                .map(|(actor, days)| {
                    let days = days.iter().map(|(d, m)| (format_date(d), *m)).collect();
                    (actor.to_string(), days)
                })
                .collect(),
        }
    }
}

// ── Direct queries ──────────────────────────────────────────────────────

/// Distinct actors in the join log for `[from, to)`. `None` if the query
/// failed.
pub fn unique_visitors(engine: &StorageEngine, from: NaiveDateTime, to: NaiveDateTime) -> Option<u64> {
    engine
        .query_row(
            "SELECT COUNT(DISTINCT actor_id) FROM join_log WHERE joined_at >= ?1 AND joined_at < ?2",
            sql_params![from, to],
            |row| row.get::<_, i64>(0),
        )
        .map(|count| count.map_or(0, |c| u64::try_from(c).unwrap_or(0)))
}

/// Add minutes to one day's total without loading the rest. Returns false
/// if nothing was written.
pub fn add_playtime(engine: &StorageEngine, actor_id: Uuid, date: NaiveDate, minutes: u32) -> bool {
    engine.execute(
        "INSERT INTO daily_playtime (actor_id, play_date, minutes) VALUES (?1, ?2, ?3) \
         ON CONFLICT(actor_id, play_date) DO UPDATE SET minutes = minutes + excluded.minutes",
        sql_params![actor_id, date, minutes],
    ) > 0
}

/// Actors with the most minutes played over `[from, to]`, highest first.
pub fn top_playtime(
    engine: &StorageEngine,
    from: NaiveDate,
    to: NaiveDate,
    limit: u32,
) -> Option<Vec<(Uuid, u64)>> {
    engine.query_rows(
        "SELECT actor_id, SUM(minutes) AS total FROM daily_playtime \
         WHERE play_date >= ?1 AND play_date <= ?2 \
         GROUP BY actor_id ORDER BY total DESC, actor_id LIMIT ?3",
        sql_params![from, to, limit],
        |row| {
            let total: i64 = row.get(1)?;
            Ok((uuid_column(row, 0)?, u64::try_from(total).unwrap_or(0)))
        },
    )
}
