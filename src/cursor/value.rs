// ABOUTME: Typed, totally ordered cursor boundary values and their text/JSON forms
// ABOUTME: Converts between result-set cells, bound parameters and checkpoint contents

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::fmt;
use std::str::FromStr;

use crate::db::types::{ColumnKind, SqlValue, TIMESTAMP_FORMAT};

/// Comparison domain of an increment column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorKind {
    Integer,
    Decimal,
    Text,
    Timestamp,
}

impl CursorKind {
    /// Cursor kind for a column, `None` when the column cannot drive a cursor.
    pub fn of(kind: ColumnKind) -> Option<Self> {
        match kind {
            ColumnKind::Integer => Some(CursorKind::Integer),
            ColumnKind::Decimal => Some(CursorKind::Decimal),
            ColumnKind::Text => Some(CursorKind::Text),
            ColumnKind::DateTime => Some(CursorKind::Timestamp),
            ColumnKind::Other => None,
        }
    }
}

/// Last-seen value of an increment column.
///
/// All values of one cursor share a kind, so the derived ordering only ever
/// compares within a variant.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CursorValue {
    Integer(i64),
    Decimal(Decimal),
    Text(String),
    Timestamp(NaiveDateTime),
}

impl CursorValue {
    /// Starting point when nothing else is known: `0`, `""` or the Unix epoch.
    pub fn zero(kind: CursorKind) -> Self {
        match kind {
            CursorKind::Integer => CursorValue::Integer(0),
            CursorKind::Decimal => CursorValue::Decimal(Decimal::ZERO),
            CursorKind::Text => CursorValue::Text(String::new()),
            CursorKind::Timestamp => CursorValue::Timestamp(NaiveDateTime::default()),
        }
    }

    pub fn kind(&self) -> CursorKind {
        match self {
            CursorValue::Integer(_) => CursorKind::Integer,
            CursorValue::Decimal(_) => CursorKind::Decimal,
            CursorValue::Text(_) => CursorKind::Text,
            CursorValue::Timestamp(_) => CursorKind::Timestamp,
        }
    }

    /// Parse a configured or persisted start value.
    pub fn parse(kind: CursorKind, text: &str) -> Result<Self, String> {
        let trimmed = text.trim();
        match kind {
            CursorKind::Integer => trimmed
                .parse::<i64>()
                .map(CursorValue::Integer)
                .map_err(|e| format!("'{}' is not an integer: {}", text, e)),
            CursorKind::Decimal => Decimal::from_str(trimmed)
                .or_else(|_| Decimal::from_scientific(trimmed))
                .map(CursorValue::Decimal)
                .map_err(|e| format!("'{}' is not a decimal: {}", text, e)),
            CursorKind::Text => Ok(CursorValue::Text(text.to_string())),
            CursorKind::Timestamp => parse_timestamp(trimmed)
                .map(CursorValue::Timestamp)
                .ok_or_else(|| format!("'{}' is not a date or timestamp", text)),
        }
    }

    /// Read the cursor value out of a result cell. NULL yields `None`.
    pub fn from_sql(kind: CursorKind, value: &SqlValue) -> Option<Self> {
        match (kind, value) {
            (_, SqlValue::Null) => None,
            (CursorKind::Integer, SqlValue::Integer(i)) => Some(CursorValue::Integer(*i)),
            (CursorKind::Integer, SqlValue::Decimal(d)) if d.fract().is_zero() => {
                d.to_i64().map(CursorValue::Integer)
            }
            (CursorKind::Integer, SqlValue::Real(f)) if f.fract() == 0.0 => {
                Some(CursorValue::Integer(*f as i64))
            }
            (CursorKind::Decimal, SqlValue::Decimal(d)) => Some(CursorValue::Decimal(*d)),
            (CursorKind::Decimal, SqlValue::Integer(i)) => {
                Some(CursorValue::Decimal(Decimal::from(*i)))
            }
            (CursorKind::Decimal, SqlValue::Real(f)) => {
                Decimal::try_from(*f).ok().map(CursorValue::Decimal)
            }
            (CursorKind::Timestamp, SqlValue::Timestamp(ts)) => Some(CursorValue::Timestamp(*ts)),
            (CursorKind::Timestamp, SqlValue::TimestampTz(ts)) => {
                Some(CursorValue::Timestamp(ts.naive_utc()))
            }
            (CursorKind::Timestamp, SqlValue::Date(d)) => {
                Some(CursorValue::Timestamp(d.and_time(chrono::NaiveTime::MIN)))
            }
            // SQLite applications sometimes store Unix seconds in DATETIME columns
            (CursorKind::Timestamp, SqlValue::Integer(secs)) => {
                DateTime::from_timestamp(*secs, 0).map(|dt| CursorValue::Timestamp(dt.naive_utc()))
            }
            (kind, other) => other
                .to_text()
                .and_then(|text| CursorValue::parse(kind, &text).ok()),
        }
    }

    /// Bound parameter form of the value.
    pub fn to_sql_value(&self) -> SqlValue {
        match self {
            CursorValue::Integer(i) => SqlValue::Integer(*i),
            CursorValue::Decimal(d) => SqlValue::Decimal(*d),
            CursorValue::Text(s) => SqlValue::Text(s.clone()),
            CursorValue::Timestamp(ts) => SqlValue::Timestamp(*ts),
        }
    }

    /// Checkpoint form: integers stay JSON numbers, everything else is text.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            CursorValue::Integer(i) => serde_json::Value::from(*i),
            other => serde_json::Value::String(other.to_string()),
        }
    }

    pub fn from_json(kind: CursorKind, value: &serde_json::Value) -> Result<Self, String> {
        match value {
            serde_json::Value::String(s) => CursorValue::parse(kind, s),
            serde_json::Value::Number(n) => CursorValue::parse(kind, &n.to_string()),
            other => Err(format!("unexpected checkpoint value {}", other)),
        }
    }
}

impl fmt::Display for CursorValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CursorValue::Integer(i) => write!(f, "{}", i),
            CursorValue::Decimal(d) => write!(f, "{}", d.normalize()),
            CursorValue::Text(s) => f.write_str(s),
            CursorValue::Timestamp(ts) => write!(f, "{}", ts.format(TIMESTAMP_FORMAT)),
        }
    }
}

fn parse_timestamp(text: &str) -> Option<NaiveDateTime> {
    if let Ok(ts) = NaiveDateTime::parse_from_str(text, TIMESTAMP_FORMAT) {
        return Some(ts);
    }
    if let Ok(ts) = NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(ts);
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
        return Some(ts.naive_utc());
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .map(|d| d.and_time(chrono::NaiveTime::MIN))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(y: i32, m: u32, d: u32, h: u32, mi: u32, s: u32) -> CursorValue {
        CursorValue::Timestamp(
            NaiveDate::from_ymd_opt(y, m, d)
                .unwrap()
                .and_hms_opt(h, mi, s)
                .unwrap(),
        )
    }

    #[test]
    fn test_zero_values() {
        assert_eq!(CursorValue::zero(CursorKind::Integer), CursorValue::Integer(0));
        assert_eq!(
            CursorValue::zero(CursorKind::Text),
            CursorValue::Text(String::new())
        );
        assert_eq!(
            CursorValue::zero(CursorKind::Timestamp).to_string(),
            "1970-01-01 00:00:00"
        );
    }

    #[test]
    fn test_parse_timestamp_forms() {
        let expected = ts(2020, 1, 1, 0, 0, 0);
        for text in [
            "2020-01-01",
            "2020-01-01 00:00:00",
            "2020-01-01T00:00:00",
            "2020-01-01T00:00:00Z",
            "2020-01-01T02:00:00+02:00",
        ] {
            assert_eq!(
                CursorValue::parse(CursorKind::Timestamp, text).unwrap(),
                expected,
                "{}",
                text
            );
        }
        assert!(CursorValue::parse(CursorKind::Timestamp, "yesterday").is_err());
    }

    #[test]
    fn test_ordering_within_kind() {
        assert!(ts(2019, 6, 1, 0, 0, 0) < ts(2020, 1, 1, 0, 0, 0));
        assert!(CursorValue::Integer(9) < CursorValue::Integer(10));
        // lexical, not numeric
        assert!(CursorValue::Text("9".into()) > CursorValue::Text("10".into()));
        let a = CursorValue::parse(CursorKind::Decimal, "1.50").unwrap();
        let b = CursorValue::parse(CursorKind::Decimal, "1.5").unwrap();
        assert_eq!(a.cmp(&b), std::cmp::Ordering::Equal);
    }

    #[test]
    fn test_from_sql_conversions() {
        assert_eq!(
            CursorValue::from_sql(CursorKind::Integer, &SqlValue::Integer(5)),
            Some(CursorValue::Integer(5))
        );
        assert_eq!(
            CursorValue::from_sql(
                CursorKind::Timestamp,
                &SqlValue::Text("2019-10-14 08:00:00".into())
            ),
            Some(ts(2019, 10, 14, 8, 0, 0))
        );
        assert_eq!(
            CursorValue::from_sql(CursorKind::Decimal, &SqlValue::Real(2.5)),
            Some(CursorValue::Decimal(Decimal::new(25, 1)))
        );
        assert_eq!(CursorValue::from_sql(CursorKind::Integer, &SqlValue::Null), None);
    }

    #[test]
    fn test_json_form() {
        assert_eq!(CursorValue::Integer(42).to_json(), serde_json::json!(42));
        let t = ts(2021, 1, 1, 12, 30, 0);
        assert_eq!(t.to_json(), serde_json::json!("2021-01-01 12:30:00"));
        assert_eq!(
            CursorValue::from_json(CursorKind::Timestamp, &t.to_json()).unwrap(),
            t
        );
        assert_eq!(
            CursorValue::from_json(CursorKind::Integer, &serde_json::json!(7)).unwrap(),
            CursorValue::Integer(7)
        );
        assert!(CursorValue::from_json(CursorKind::Integer, &serde_json::json!([1])).is_err());
    }
}
