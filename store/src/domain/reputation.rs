//! Per-player reputation counters and the events that produced them.

use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};

use chrono::NaiveDateTime;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};

use super::prune_missing;
use crate::dual::StoreAdapter;
use crate::engine::{timestamp_column, StorageEngine};
use crate::time::{format_timestamp, TimestampCodec};
use crate::PersistenceError;

/// One reputation change given by `source`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReputationEvent {
    pub source: String,
    pub positive: bool,
    pub at: NaiveDateTime,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reputation {
    /// Display name as first seen.
    pub name: String,
    pub positive: u32,
    pub negative: u32,
    /// Chronological.
    pub history: Vec<ReputationEvent>,
}

impl Reputation {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            positive: 0,
            negative: 0,
            history: Vec::new(),
        }
    }

    pub fn score(&self) -> i64 {
        i64::from(self.positive) - i64::from(self.negative)
    }

    fn push_event(&mut self, event: ReputationEvent) {
        let idx = self.history.partition_point(|e| e.at <= event.at);
        self.history.insert(idx, event);
    }
}

/// Reputation entries keyed by lowercased display name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReputationBook {
    entries: BTreeMap<String, Reputation>,
}

impl ReputationBook {
    /// Count one event against `target`, creating the entry on first use.
    pub fn record(
        &mut self,
        target: &str,
        source: &str,
        positive: bool,
        reason: Option<String>,
        at: NaiveDateTime,
    ) -> &Reputation {
        let entry = self
            .entries
            .entry(target.to_lowercase())
            .or_insert_with(|| Reputation::new(target));
        if positive {
            entry.positive = entry.positive.saturating_add(1);
        } else {
            entry.negative = entry.negative.saturating_add(1);
        }
        entry.push_event(ReputationEvent {
            source: source.to_string(),
            positive,
            at,
            reason,
        });
        entry
    }

    pub fn get(&self, name: &str) -> Option<&Reputation> {
        self.entries.get(&name.to_lowercase())
    }

    /// Drop the entry with its whole history.
    pub fn reset(&mut self, name: &str) -> Option<Reputation> {
        self.entries.remove(&name.to_lowercase())
    }

    /// When `source` last gave reputation to `target`.
    pub fn last_given(&self, target: &str, source: &str) -> Option<NaiveDateTime> {
        self.get(target)?
            .history
            .iter()
            .rev()
            .find(|e| e.source.eq_ignore_ascii_case(source))
            .map(|e| e.at)
    }

    pub fn entries(&self) -> impl Iterator<Item = &Reputation> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn entry_mut(&mut self, name: &str) -> &mut Reputation {
        self.entries
            .entry(name.to_lowercase())
            .or_insert_with(|| Reputation::new(name))
    }
}

// ── Flat-file document ──────────────────────────────────────────────────

pub type ReputationDocument = BTreeMap<String, ReputationRecord>;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReputationRecord {
    #[serde(default)]
    pub positive: u32,
    #[serde(default)]
    pub negative: u32,
    /// Keyed by source name.
    #[serde(default)]
    pub history: BTreeMap<String, OneOrMany<HistoryRecord>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub positive: bool,
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Older files hold a single entry per source, newer ones a list.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

impl<T> OneOrMany<T> {
    pub fn into_vec(self) -> Vec<T> {
        match self {
            OneOrMany::One(item) => vec![item],
            OneOrMany::Many(items) => items,
        }
    }
}

impl<T> From<Vec<T>> for OneOrMany<T> {
    fn from(mut items: Vec<T>) -> Self {
        if items.len() == 1 {
            if let Some(item) = items.pop() {
                return OneOrMany::One(item);
            }
        }
        OneOrMany::Many(items)
    }
}

// ── Adapter ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default)]
pub struct ReputationAdapter;

const INSERT_HISTORY: &str = "INSERT INTO reputation_history \
     (player_name, source_name, is_positive, created_at, reason) VALUES (?1, ?2, ?3, ?4, ?5)";

const COUNT_HISTORY: &str = "SELECT COUNT(*) FROM reputation_history \
     WHERE player_name = ?1 AND source_name = ?2 AND is_positive = ?3 \
     AND created_at = ?4 AND reason IS ?5";

impl ReputationAdapter {
    fn insert_history<'a>(
        conn: &Connection,
        owner: &str,
        events: impl IntoIterator<Item = &'a ReputationEvent>,
    ) -> rusqlite::Result<usize> {
        let mut insert = conn.prepare_cached(INSERT_HISTORY)?;
        let mut written = 0;
        for event in events {
            written += insert.execute(params![
                owner,
                event.source,
                event.positive,
                format_timestamp(&event.at),
                event.reason,
            ])?;
        }
        Ok(written)
    }

    /// Events of `entry` with no stored counterpart. Identical events are
    /// matched by multiplicity, so a rerun adds nothing and two same-second
    /// events are both kept.
    fn missing_history<'a>(
        conn: &Connection,
        entry: &'a Reputation,
    ) -> rusqlite::Result<Vec<&'a ReputationEvent>> {
        let mut count = conn.prepare_cached(COUNT_HISTORY)?;
        let mut stored: HashMap<&ReputationEvent, i64> = HashMap::new();
        let mut missing = Vec::new();
        for event in &entry.history {
            let left = match stored.entry(event) {
                Entry::Occupied(slot) => slot.into_mut(),
                Entry::Vacant(slot) => slot.insert(count.query_row(
                    params![
                        entry.name,
                        event.source,
                        event.positive,
                        format_timestamp(&event.at),
                        event.reason,
                    ],
                    |row| row.get(0),
                )?),
            };
            if *left > 0 {
                *left -= 1;
            } else {
                missing.push(event);
            }
        }
        Ok(missing)
    }
}

impl StoreAdapter for ReputationAdapter {
    type State = ReputationBook;
    type Document = ReputationDocument;

    const NAME: &'static str = "reputation";
    const FILE_NAME: &'static str = "reputation.json";

    fn load_relational(&self, engine: &StorageEngine) -> Option<ReputationBook> {
        let counts = engine.query_rows(
            "SELECT player_name, positive, negative FROM reputation",
            &[],
            |row| Ok((row.get::<_, String>(0)?, row.get::<_, u32>(1)?, row.get::<_, u32>(2)?)),
        )?;
        let events = engine.query_rows(
            "SELECT player_name, source_name, is_positive, created_at, reason \
             FROM reputation_history ORDER BY created_at, id",
            &[],
            |row| {
                let owner: String = row.get(0)?;
                let event = ReputationEvent {
                    source: row.get(1)?,
                    positive: row.get(2)?,
                    at: timestamp_column(row, 3)?,
                    reason: row.get(4)?,
                };
                Ok((owner, event))
            },
        )?;

        let mut book = ReputationBook::default();
        for (name, positive, negative) in counts {
            let entry = book.entry_mut(&name);
            entry.positive = positive;
            entry.negative = negative;
        }
        for (owner, event) in events {
            // Already ordered, append directly.
            book.entry_mut(&owner).history.push(event);
        }
        Some(book)
    }

    fn write_relational(
        &self,
        conn: &Connection,
        state: &ReputationBook,
    ) -> Result<(), PersistenceError> {
        prune_missing(conn, "reputation", "player_name", |name| {
            state.entries.contains_key(&name.to_lowercase())
        })?;

        let mut upsert = conn.prepare_cached(
            "INSERT INTO reputation (player_name, positive, negative) VALUES (?1, ?2, ?3) \
             ON CONFLICT(player_name) DO UPDATE SET \
             positive = excluded.positive, negative = excluded.negative",
        )?;
        let mut clear = conn.prepare_cached("DELETE FROM reputation_history WHERE player_name = ?1")?;
        for entry in state.entries.values() {
            upsert.execute(params![entry.name, entry.positive, entry.negative])?;
            clear.execute([&entry.name])?;
            Self::insert_history(conn, &entry.name, &entry.history)?;
        }
        Ok(())
    }

    fn merge_relational(
        &self,
        conn: &Connection,
        state: &ReputationBook,
    ) -> Result<usize, PersistenceError> {
        // Counts only ever move up.
        let mut upsert = conn.prepare_cached(
            "INSERT INTO reputation (player_name, positive, negative) VALUES (?1, ?2, ?3) \
             ON CONFLICT(player_name) DO UPDATE SET \
             positive = max(positive, excluded.positive), \
             negative = max(negative, excluded.negative)",
        )?;
        let mut written = 0;
        for entry in state.entries.values() {
            written += upsert.execute(params![entry.name, entry.positive, entry.negative])?;
            let missing = Self::missing_history(conn, entry)?;
            written += Self::insert_history(conn, &entry.name, missing)?;
        }
        Ok(written)
    }

    fn decode(&self, doc: ReputationDocument, timestamps: &TimestampCodec) -> ReputationBook {
        let mut book = ReputationBook::default();
        for (name, record) in doc {
            let entry = book.entry_mut(&name);
            entry.positive = entry.positive.saturating_add(record.positive);
            entry.negative = entry.negative.saturating_add(record.negative);

            for (source, items) in record.history {
                for item in items.into_vec() {
                    let context = format!("reputation {name} from {source}");
                    let Some(at) = timestamps.decode(&item.timestamp, &context) else {
                        continue;
                    };
                    entry.push_event(ReputationEvent {
                        source: source.clone(),
                        positive: item.positive,
                        at,
                        reason: item.reason,
                    });
                }
            }
        }
        book
    }

    fn encode(&self, state: &ReputationBook) -> ReputationDocument {
        state
            .entries
            .values()
            .map(|entry| {
                let mut by_source: BTreeMap<String, Vec<HistoryRecord>> = BTreeMap::new();
                for event in &entry.history {
                    by_source
                        .entry(event.source.clone())
                        .or_default()
                        .push(HistoryRecord {
                            positive: event.positive,
                            timestamp: format_timestamp(&event.at),
                            reason: event.reason.clone(),
                        });
                }
                let record = ReputationRecord {
                    positive: entry.positive,
                    negative: entry.negative,
                    history: by_source
                        .into_iter()
                        .map(|(source, items)| (source, items.into()))
                        .collect(),
                };
                (entry.name.clone(), record)
            })
            .collect()
    }
}
