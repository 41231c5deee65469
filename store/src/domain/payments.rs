//! Append-only payment ledger. Recorded payments are never changed; the
//! relational write only ever inserts.

use std::fmt;
use std::str::FromStr;

use chrono::NaiveDateTime;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::dual::StoreAdapter;
use crate::engine::{timestamp_column, uuid_column, StorageEngine};
use crate::sql_params;
use crate::time::{format_timestamp, TimestampCodec};
use crate::PersistenceError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentStatus {
    Completed,
    Failed,
    Refunded,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Completed => "completed",
            PaymentStatus::Failed => "failed",
            PaymentStatus::Refunded => "refunded",
        }
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PaymentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "completed" => Ok(PaymentStatus::Completed),
            "failed" => Ok(PaymentStatus::Failed),
            "refunded" => Ok(PaymentStatus::Refunded),
            other => Err(format!("unknown payment status: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Payment {
    pub id: Uuid,
    pub sender: String,
    pub receiver: String,
    pub amount: f64,
    pub created_at: NaiveDateTime,
    pub status: PaymentStatus,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PaymentLedger {
    payments: Vec<Payment>,
}

impl PaymentLedger {
    /// Append a payment under a fresh id.
    pub fn record(
        &mut self,
        sender: &str,
        receiver: &str,
        amount: f64,
        status: PaymentStatus,
        at: NaiveDateTime,
    ) -> &Payment {
        let idx = self.payments.len();
        self.payments.push(Payment {
            id: Uuid::new_v4(),
            sender: sender.to_string(),
            receiver: receiver.to_string(),
            amount,
            created_at: at,
            status,
        });
        &self.payments[idx]
    }

    pub fn get(&self, id: Uuid) -> Option<&Payment> {
        self.payments.iter().find(|p| p.id == id)
    }

    pub fn sent_by<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Payment> + 'a {
        self.payments
            .iter()
            .filter(move |p| p.sender.eq_ignore_ascii_case(name))
    }

    pub fn received_by<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Payment> + 'a {
        self.payments
            .iter()
            .filter(move |p| p.receiver.eq_ignore_ascii_case(name))
    }

    /// Sum of completed payments to `name`.
    pub fn total_received(&self, name: &str) -> f64 {
        self.received_by(name)
            .filter(|p| p.status == PaymentStatus::Completed)
            .map(|p| p.amount)
            .sum()
    }

    pub fn payments(&self) -> &[Payment] {
        &self.payments
    }

    pub fn len(&self) -> usize {
        self.payments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payments.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentRecord {
    pub id: String,
    pub sender: String,
    pub receiver: String,
    pub amount: f64,
    pub timestamp: String,
    pub status: String,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PaymentAdapter;

const SELECT_PAYMENTS: &str =
    "SELECT id, sender, receiver, amount, created_at, status FROM payments";

fn payment_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Payment> {
    let raw_status: String = row.get(5)?;
    let status = raw_status.parse().map_err(|e: String| {
        rusqlite::Error::FromSqlConversionFailure(5, rusqlite::types::Type::Text, e.into())
    })?;
    Ok(Payment {
        id: uuid_column(row, 0)?,
        sender: row.get(1)?,
        receiver: row.get(2)?,
        amount: row.get(3)?,
        created_at: timestamp_column(row, 4)?,
        status,
    })
}

impl StoreAdapter for PaymentAdapter {
    type State = PaymentLedger;
    type Document = Vec<PaymentRecord>;

    const NAME: &'static str = "payments";
    const FILE_NAME: &'static str = "payments.json";

    fn load_relational(&self, engine: &StorageEngine) -> Option<PaymentLedger> {
        let payments = engine.query_rows(
            &format!("{SELECT_PAYMENTS} ORDER BY created_at, rowid"),
            &[],
            payment_row,
        )?;
        Some(PaymentLedger { payments })
    }

    fn write_relational(
        &self,
        conn: &Connection,
        state: &PaymentLedger,
    ) -> Result<(), PersistenceError> {
        self.merge_relational(conn, state)?;
        Ok(())
    }

    fn merge_relational(
        &self,
        conn: &Connection,
        state: &PaymentLedger,
    ) -> Result<usize, PersistenceError> {
        let mut insert = conn.prepare_cached(
            "INSERT OR IGNORE INTO payments (id, sender, receiver, amount, created_at, status) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )?;
        let mut written = 0;
        for p in &state.payments {
            written += insert.execute(params![
                p.id.to_string(),
                p.sender,
                p.receiver,
                p.amount,
                format_timestamp(&p.created_at),
                p.status.as_str(),
            ])?;
        }
        Ok(written)
    }

    fn decode(&self, doc: Vec<PaymentRecord>, timestamps: &TimestampCodec) -> PaymentLedger {
        let mut ledger = PaymentLedger::default();
        for record in doc {
            let parsed = (
                Uuid::parse_str(&record.id),
                record.status.parse::<PaymentStatus>(),
            );
            let (Ok(id), Ok(status)) = parsed else {
                warn!(id = %record.id, status = %record.status, "Skipping malformed payment");
                continue;
            };
            let context = format!("payment {id}");
            let Some(created_at) = timestamps.decode(&record.timestamp, &context) else {
                continue;
            };
            ledger.payments.push(Payment {
                id,
                sender: record.sender,
                receiver: record.receiver,
                amount: record.amount,
                created_at,
                status,
            });
        }
        ledger
    }

    fn encode(&self, state: &PaymentLedger) -> Vec<PaymentRecord> {
        state
            .payments
            .iter()
            .map(|p| PaymentRecord {
                id: p.id.to_string(),
                sender: p.sender.clone(),
                receiver: p.receiver.clone(),
                amount: p.amount,
                timestamp: format_timestamp(&p.created_at),
                status: p.status.as_str().to_string(),
            })
            .collect()
    }
}

/// Most recent payments sent or received by `name`, newest first.
pub fn history_for(engine: &StorageEngine, name: &str, limit: u32) -> Option<Vec<Payment>> {
    engine.query_rows(
        &format!(
            "{SELECT_PAYMENTS} WHERE sender = ?1 COLLATE NOCASE OR receiver = ?1 COLLATE NOCASE \
             ORDER BY created_at DESC, rowid DESC LIMIT ?2"
        ),
        sql_params![name, limit],
        payment_row,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineTuning;
    use chrono::NaiveDate;

    fn at(d: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, d)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap()
    }

    #[test]
    fn test_record_assigns_unique_ids() {
        let mut ledger = PaymentLedger::default();
        let first = ledger.record("alice", "bob", 10.0, PaymentStatus::Completed, at(1)).id;
        let second = ledger.record("alice", "bob", 10.0, PaymentStatus::Completed, at(1)).id;
        assert_ne!(first, second);
        assert_eq!(ledger.get(first).unwrap().amount, 10.0);
    }

    #[test]
    fn test_filters_and_totals() {
        let mut ledger = PaymentLedger::default();
        ledger.record("alice", "bob", 10.0, PaymentStatus::Completed, at(1));
        ledger.record("carol", "Bob", 5.5, PaymentStatus::Completed, at(2));
        ledger.record("alice", "bob", 99.0, PaymentStatus::Failed, at(3));

        assert_eq!(ledger.sent_by("ALICE").count(), 2);
        assert_eq!(ledger.received_by("bob").count(), 3);
        assert_eq!(ledger.total_received("bob"), 15.5);
    }

    #[test]
    fn test_status_parsing() {
        assert_eq!("Refunded".parse::<PaymentStatus>(), Ok(PaymentStatus::Refunded));
        assert!("pending".parse::<PaymentStatus>().is_err());
    }

    #[test]
    fn test_history_for_orders_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        let engine = StorageEngine::new(dir.path().join("pay.db"), EngineTuning::default());
        assert!(engine.initialize());

        let mut ledger = PaymentLedger::default();
        ledger.record("alice", "bob", 1.0, PaymentStatus::Completed, at(1));
        ledger.record("bob", "carol", 2.0, PaymentStatus::Completed, at(2));
        ledger.record("dave", "erin", 3.0, PaymentStatus::Completed, at(3));
        ledger.record("carol", "BOB", 4.0, PaymentStatus::Refunded, at(4));
        engine
            .transaction(|tx| PaymentAdapter.write_relational(tx, &ledger))
            .unwrap();

        let history = history_for(&engine, "Bob", 2).unwrap();
        let amounts: Vec<_> = history.iter().map(|p| p.amount).collect();
        assert_eq!(amounts, vec![4.0, 2.0]);
        assert_eq!(history[0].status, PaymentStatus::Refunded);

        // Re-saving the same ledger inserts nothing new.
        let again = engine
            .transaction(|tx| PaymentAdapter.merge_relational(tx, &ledger))
            .unwrap();
        assert_eq!(again, 0);
    }
}
