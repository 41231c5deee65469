//! Per-player minigame totals. Mutated only through
//! [`DualModeStore::update`](crate::DualModeStore::update).

use std::collections::BTreeMap;
use std::time::Duration;

use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};

use super::prune_missing;
use crate::dual::StoreAdapter;
use crate::engine::StorageEngine;
use crate::time::TimestampCodec;
use crate::PersistenceError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GameOutcome {
    Win,
    Loss,
    Draw,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct GameStats {
    pub games_played: u64,
    pub wins: u64,
    pub losses: u64,
    pub total_earned: i64,
    pub total_time_secs: u64,
}

impl GameStats {
    pub fn draws(&self) -> u64 {
        self.games_played.saturating_sub(self.wins.saturating_add(self.losses))
    }

    /// Wins over finished games, `0.0` before the first game.
    pub fn win_rate(&self) -> f64 {
        if self.games_played == 0 {
            0.0
        } else {
            self.wins as f64 / self.games_played as f64
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GameStatsTable {
    players: BTreeMap<String, GameStats>,
}

impl GameStatsTable {
    pub fn record_game(
        &mut self,
        external_id: &str,
        outcome: GameOutcome,
        earned: i64,
        duration: Duration,
    ) -> GameStats {
        let stats = self.players.entry(external_id.to_string()).or_default();
        stats.games_played = stats.games_played.saturating_add(1);
        match outcome {
            GameOutcome::Win => stats.wins = stats.wins.saturating_add(1),
            GameOutcome::Loss => stats.losses = stats.losses.saturating_add(1),
            GameOutcome::Draw => {}
        }
        stats.total_earned = stats.total_earned.saturating_add(earned);
        stats.total_time_secs = stats.total_time_secs.saturating_add(duration.as_secs());
        *stats
    }

    pub fn get(&self, external_id: &str) -> Option<&GameStats> {
        self.players.get(external_id)
    }

    pub fn remove(&mut self, external_id: &str) -> Option<GameStats> {
        self.players.remove(external_id)
    }

    /// Highest earners first.
    pub fn top_earners(&self, limit: usize) -> Vec<(&str, &GameStats)> {
        let mut ranked: Vec<_> = self.players.iter().map(|(k, v)| (k.as_str(), v)).collect();
        ranked.sort_by(|a, b| b.1.total_earned.cmp(&a.1.total_earned).then(a.0.cmp(b.0)));
        ranked.truncate(limit);
        ranked
    }

    pub fn len(&self) -> usize {
        self.players.len()
    }

    pub fn is_empty(&self) -> bool {
        self.players.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct GameStatsAdapter;

impl GameStatsAdapter {
    fn upsert_all(
        conn: &Connection,
        state: &GameStatsTable,
        on_conflict: &str,
    ) -> rusqlite::Result<usize> {
        let mut upsert = conn.prepare(&format!(
            "INSERT INTO game_stats \
             (external_id, games_played, wins, losses, total_earned, total_time_secs) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6) ON CONFLICT(external_id) {on_conflict}"
        ))?;
        let mut written = 0;
        for (id, s) in &state.players {
            written += upsert.execute(params![
                id,
                clamp(s.games_played),
                clamp(s.wins),
                clamp(s.losses),
                s.total_earned,
                clamp(s.total_time_secs),
            ])?;
        }
        Ok(written)
    }
}

const OVERWRITE_TOTALS: &str = "DO UPDATE SET \
     games_played = excluded.games_played, wins = excluded.wins, losses = excluded.losses, \
     total_earned = excluded.total_earned, total_time_secs = excluded.total_time_secs";

fn clamp(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn unclamp(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

impl StoreAdapter for GameStatsAdapter {
    type State = GameStatsTable;
    type Document = BTreeMap<String, GameStats>;

    const NAME: &'static str = "game_stats";
    const FILE_NAME: &'static str = "game_stats.json";

    fn load_relational(&self, engine: &StorageEngine) -> Option<GameStatsTable> {
        let rows = engine.query_rows(
            "SELECT external_id, games_played, wins, losses, total_earned, total_time_secs \
             FROM game_stats",
            &[],
            |row| {
                let stats = GameStats {
                    games_played: unclamp(row.get(1)?),
                    wins: unclamp(row.get(2)?),
                    losses: unclamp(row.get(3)?),
                    total_earned: row.get(4)?,
                    total_time_secs: unclamp(row.get(5)?),
                };
                Ok((row.get::<_, String>(0)?, stats))
            },
        )?;
        Some(GameStatsTable {
            players: rows.into_iter().collect(),
        })
    }

    fn write_relational(
        &self,
        conn: &Connection,
        state: &GameStatsTable,
    ) -> Result<(), PersistenceError> {
        prune_missing(conn, "game_stats", "external_id", |id| {
            state.players.contains_key(id)
        })?;
        Self::upsert_all(conn, state, OVERWRITE_TOTALS)?;
        Ok(())
    }

    fn merge_relational(
        &self,
        conn: &Connection,
        state: &GameStatsTable,
    ) -> Result<usize, PersistenceError> {
        // Stored totals are newer than any legacy file.
        Ok(Self::upsert_all(conn, state, "DO NOTHING")?)
    }

    fn decode(&self, doc: BTreeMap<String, GameStats>, _: &TimestampCodec) -> GameStatsTable {
        GameStatsTable { players: doc }
    }

    fn encode(&self, state: &GameStatsTable) -> BTreeMap<String, GameStats> {
        state.players.clone()
    }
}
