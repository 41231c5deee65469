//! Positional parameter values and typed column readers.

use chrono::{NaiveDate, NaiveDateTime};
use rusqlite::types::{ToSqlOutput, Type, Value, ValueRef};
use rusqlite::{Row, ToSql};
use uuid::Uuid;

use crate::time::{format_date, format_timestamp, parse_date, parse_timestamp};

/// A query parameter, bound according to its runtime type.
///
/// Booleans bind as `0`/`1` and timestamps as canonical ISO-8601 text so that
/// every column written through the engine has one representation.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlParam {
    Null,
    Text(String),
    Int(i32),
    Long(i64),
    Double(f64),
    Bool(bool),
    Timestamp(NaiveDateTime),
}

impl ToSql for SqlParam {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            SqlParam::Null => ToSqlOutput::Owned(Value::Null),
            SqlParam::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
            SqlParam::Int(v) => ToSqlOutput::Owned(Value::Integer(i64::from(*v))),
            SqlParam::Long(v) => ToSqlOutput::Owned(Value::Integer(*v)),
            SqlParam::Double(v) => ToSqlOutput::Owned(Value::Real(*v)),
            SqlParam::Bool(b) => ToSqlOutput::Owned(Value::Integer(i64::from(*b))),
            SqlParam::Timestamp(ts) => ToSqlOutput::Owned(Value::Text(format_timestamp(ts))),
        })
    }
}

impl From<&str> for SqlParam {
    fn from(value: &str) -> Self {
        SqlParam::Text(value.to_string())
    }
}

impl From<String> for SqlParam {
    fn from(value: String) -> Self {
        SqlParam::Text(value)
    }
}

impl From<&String> for SqlParam {
    fn from(value: &String) -> Self {
        SqlParam::Text(value.clone())
    }
}

impl From<i32> for SqlParam {
    fn from(value: i32) -> Self {
        SqlParam::Int(value)
    }
}

impl From<u32> for SqlParam {
    fn from(value: u32) -> Self {
        SqlParam::Long(i64::from(value))
    }
}

impl From<i64> for SqlParam {
    fn from(value: i64) -> Self {
        SqlParam::Long(value)
    }
}

impl From<u64> for SqlParam {
    fn from(value: u64) -> Self {
        SqlParam::Long(i64::try_from(value).unwrap_or(i64::MAX))
    }
}

impl From<f64> for SqlParam {
    fn from(value: f64) -> Self {
        SqlParam::Double(value)
    }
}

impl From<bool> for SqlParam {
    fn from(value: bool) -> Self {
        SqlParam::Bool(value)
    }
}

impl From<NaiveDateTime> for SqlParam {
    fn from(value: NaiveDateTime) -> Self {
        SqlParam::Timestamp(value)
    }
}

impl From<&NaiveDateTime> for SqlParam {
    fn from(value: &NaiveDateTime) -> Self {
        SqlParam::Timestamp(*value)
    }
}

impl From<NaiveDate> for SqlParam {
    fn from(value: NaiveDate) -> Self {
        SqlParam::Text(format_date(&value))
    }
}

impl From<Uuid> for SqlParam {
    fn from(value: Uuid) -> Self {
        SqlParam::Text(value.to_string())
    }
}

impl<T: Into<SqlParam>> From<Option<T>> for SqlParam {
    fn from(value: Option<T>) -> Self {
        value.map_or(SqlParam::Null, Into::into)
    }
}

/// Build a `&[SqlParam]` slice from heterogeneous values.
///
/// ```
/// let params = store::sql_params!["alice", 5_i64, true];
/// assert_eq!(params.len(), 3);
/// ```
#[macro_export]
macro_rules! sql_params {
    () => {
        &[] as &[$crate::SqlParam]
    };
    ($($param:expr),+ $(,)?) => {
        &[$($crate::SqlParam::from($param)),+] as &[$crate::SqlParam]
    };
}

fn conversion_failure(idx: usize, raw: String, what: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        Type::Text,
        format!("invalid {what}: {raw:?}").into(),
    )
}

/// Read a timestamp column written in either accepted text format.
pub fn timestamp_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<NaiveDateTime> {
    let raw: String = row.get(idx)?;
    parse_timestamp(&raw).ok_or_else(|| conversion_failure(idx, raw, "timestamp"))
}

pub fn date_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<NaiveDate> {
    let raw: String = row.get(idx)?;
    parse_date(&raw).ok_or_else(|| conversion_failure(idx, raw, "date"))
}

pub fn uuid_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Uuid> {
    let raw: String = row.get(idx)?;
    Uuid::parse_str(&raw).map_err(|_| conversion_failure(idx, raw, "uuid"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bool_and_timestamp_bind_as_canonical_values() {
        let ts = NaiveDate::from_ymd_opt(2024, 1, 1)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap();
        assert_eq!(
            SqlParam::from(true).to_sql().unwrap(),
            ToSqlOutput::Owned(Value::Integer(1))
        );
        assert_eq!(
            SqlParam::from(ts).to_sql().unwrap(),
            ToSqlOutput::Owned(Value::Text("2024-01-01T12:00:00".to_string()))
        );
    }

    #[test]
    fn none_binds_null() {
        let reason: Option<String> = None;
        assert_eq!(SqlParam::from(reason), SqlParam::Null);
        assert_eq!(SqlParam::from(Some("why")), SqlParam::Text("why".to_string()));
    }

    #[test]
    fn macro_builds_mixed_slice() {
        let params = crate::sql_params!["alice", 3_i32, 7_u64, 1.5_f64];
        assert_eq!(
            params,
            &[
                SqlParam::Text("alice".to_string()),
                SqlParam::Int(3),
                SqlParam::Long(7),
                SqlParam::Double(1.5),
            ]
        );
    }
}
