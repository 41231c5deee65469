//! Timestamp text codec shared by the database columns and the flat files.
//!
//! Everything is written in one canonical form, `YYYY-MM-DDTHH:MM:SS`. On
//! read two forms are accepted: the canonical one (fractional seconds
//! tolerated) and the older `YYYY-MM-DD HH:MM:SS` that earlier versions wrote
//! into the flat files. Text matching neither is resolved by the configured
//! [`TimestampFallback`], and every such resolution is logged as a loss of
//! historical accuracy.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{Local, NaiveDate, NaiveDateTime, SubsecRound};
use tracing::warn;

/// Canonical storage format.
pub const STORAGE_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";
/// Accepted on read; `%.f` makes the fractional part optional.
const PRIMARY_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f";
const SECONDARY_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
/// Format of calendar-day keys (daily playtime).
pub const DATE_FORMAT: &str = "%Y-%m-%d";

/// Current local time truncated to whole seconds.
pub fn now() -> NaiveDateTime {
    Local::now().naive_local().trunc_subsecs(0)
}

pub fn format_timestamp(ts: &NaiveDateTime) -> String {
    ts.format(STORAGE_FORMAT).to_string()
}

pub fn format_date(date: &NaiveDate) -> String {
    date.format(DATE_FORMAT).to_string()
}

/// Parse `raw` with the primary format, then the secondary one.
pub fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    NaiveDateTime::parse_from_str(raw, PRIMARY_FORMAT)
        .or_else(|_| NaiveDateTime::parse_from_str(raw, SECONDARY_FORMAT))
        .ok()
        .map(|ts| ts.trunc_subsecs(0))
}

pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(raw.trim(), DATE_FORMAT).ok()
}

/// What to substitute for a timestamp that parses in neither format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimestampFallback {
    /// Use the current time. Keeps the record, loses its history.
    #[default]
    Now,
    /// Use 1970-01-01T00:00:00 so the record sorts as "unknown, old".
    Epoch,
    /// Drop the record.
    Skip,
}

impl FromStr for TimestampFallback {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "now" => Ok(Self::Now),
            "epoch" => Ok(Self::Epoch),
            "skip" => Ok(Self::Skip),
            other => Err(format!("unknown timestamp fallback: {other}")),
        }
    }
}

impl fmt::Display for TimestampFallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Now => "now",
            Self::Epoch => "epoch",
            Self::Skip => "skip",
        };
        f.write_str(s)
    }
}

/// Lenient timestamp reader used while decoding flat-file documents.
///
/// Clones share the fallback counter, so a report can tell how many values
/// were substituted across every decoder that used the same codec.
#[derive(Debug, Clone, Default)]
pub struct TimestampCodec {
    fallback: TimestampFallback,
    substituted: Arc<AtomicU64>,
}

impl TimestampCodec {
    pub fn new(fallback: TimestampFallback) -> Self {
        Self {
            fallback,
            substituted: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn fallback(&self) -> TimestampFallback {
        self.fallback
    }

    /// Decode `raw`, applying the fallback when neither format matches.
    ///
    /// Returns `None` only when the fallback is [`TimestampFallback::Skip`].
    /// `context` names the record in the log line.
    pub fn decode(&self, raw: &str, context: &str) -> Option<NaiveDateTime> {
        if let Some(ts) = parse_timestamp(raw) {
            return Some(ts);
        }

        self.substituted.fetch_add(1, Ordering::Relaxed);
        let substitute = match self.fallback {
            TimestampFallback::Now => Some(now()),
            TimestampFallback::Epoch => Some(NaiveDateTime::default()),
            TimestampFallback::Skip => None,
        };
        warn!(
            raw,
            context,
            fallback = %self.fallback,
            "Unparseable timestamp, original time is lost"
        );
        substitute
    }

    /// Number of values resolved by the fallback so far.
    pub fn substituted(&self) -> u64 {
        self.substituted.load(Ordering::Relaxed)
    }
}
