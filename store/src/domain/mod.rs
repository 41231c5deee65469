//! Domain state types and their [`StoreAdapter`](crate::StoreAdapter)s.
//!
//! | Adapter | State | Tables | Flat file |
//! |---------|-------|--------|-----------|
//! | [`IdentityAdapter`] | [`IdentityRegistry`] | `identities`, `hidden_names`, `blacklist`, `whitelist` | `identities.json` |
//! | [`ReputationAdapter`] | [`ReputationBook`] | `reputation`, `reputation_history` | `reputation.json` |
//! | [`StatisticsAdapter`] | [`PlayStatistics`] | `join_log`, `daily_playtime` | `statistics.json` |
//! | [`GameStatsAdapter`] | [`GameStatsTable`] | `game_stats` | `game_stats.json` |
//! | [`CooldownAdapter`] | [`CooldownTable`] | `cooldowns` | `cooldowns.json` |
//! | [`PaymentAdapter`] | [`PaymentLedger`] | `payments` | `payments.json` |

pub mod cooldowns;
pub mod game_stats;
pub mod identity;
pub mod payments;
pub mod reputation;
pub mod statistics;

pub use cooldowns::{CooldownAdapter, CooldownTable};
pub use game_stats::{GameOutcome, GameStats, GameStatsAdapter, GameStatsTable};
pub use identity::{Identity, IdentityAdapter, IdentityRegistry};
pub use payments::{Payment, PaymentAdapter, PaymentLedger, PaymentStatus};
pub use reputation::{Reputation, ReputationAdapter, ReputationBook, ReputationEvent};
pub use statistics::{JoinRecord, PlayStatistics, StatisticsAdapter};

use rusqlite::Connection;

/// Delete every row of `table` whose `key` column is rejected by `keep`.
///
/// Used by overwrite saves so that entries dropped from memory also leave
/// the table. `table` and `key` are compile-time identifiers, never input.
pub(crate) fn prune_missing<F>(
    conn: &Connection,
    table: &str,
    key: &str,
    keep: F,
) -> rusqlite::Result<usize>
where
    F: Fn(&str) -> bool,
{
    let existing: Vec<String> = {
        let mut stmt = conn.prepare(&format!("SELECT {key} FROM {table}"))?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        rows.collect::<rusqlite::Result<_>>()?
    };

    let mut delete = conn.prepare(&format!("DELETE FROM {table} WHERE {key} = ?1"))?;
    let mut removed = 0;
    for stale in existing.iter().filter(|k| !keep(k)) {
        removed += delete.execute([stale])?;
    }
    Ok(removed)
}
