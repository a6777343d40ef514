// ABOUTME: Dynamically typed cell values and column metadata shared by all backends
// ABOUTME: Converts rows to JSON record bodies and classifies declared SQL types

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use rust_decimal::Decimal;
use serde_json::Value as JsonValue;
use std::sync::Arc;

/// Text layout used whenever a timestamp travels as a string (parameters, checkpoints).
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";

/// A single cell value, either read from a result set or bound as a parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Bool(bool),
    Integer(i64),
    Real(f64),
    Decimal(Decimal),
    Text(String),
    Timestamp(NaiveDateTime),
    TimestampTz(DateTime<Utc>),
    Date(NaiveDate),
    Json(JsonValue),
    Uuid(uuid::Uuid),
    Bytes(Vec<u8>),
}

impl SqlValue {
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }

    /// Text rendering of the value, `None` for NULL.
    ///
    /// Used for server-side casts of bound parameters and as the key of an
    /// identity partition.
    pub fn to_text(&self) -> Option<String> {
        match self {
            SqlValue::Null => None,
            SqlValue::Bool(b) => Some(b.to_string()),
            SqlValue::Integer(i) => Some(i.to_string()),
            SqlValue::Real(f) => Some(f.to_string()),
            SqlValue::Decimal(d) => Some(d.normalize().to_string()),
            SqlValue::Text(s) => Some(s.clone()),
            SqlValue::Timestamp(ts) => Some(ts.format(TIMESTAMP_FORMAT).to_string()),
            SqlValue::TimestampTz(ts) => Some(ts.to_rfc3339()),
            SqlValue::Date(d) => Some(d.format("%Y-%m-%d").to_string()),
            SqlValue::Json(v) => Some(v.to_string()),
            SqlValue::Uuid(u) => Some(u.to_string()),
            SqlValue::Bytes(b) => Some(base64::Engine::encode(
                &base64::engine::general_purpose::STANDARD,
                b,
            )),
        }
    }

    /// Convert the value to JSON for a record body.
    ///
    /// Maps:
    /// - integers and finite floats → number
    /// - decimals → string (lossless)
    /// - timestamps and dates → string
    /// - BLOB/BYTEA → object with base64-encoded data
    pub fn to_json(&self) -> JsonValue {
        match self {
            SqlValue::Null => JsonValue::Null,
            SqlValue::Bool(b) => JsonValue::Bool(*b),
            SqlValue::Integer(i) => JsonValue::Number((*i).into()),
            SqlValue::Real(f) => serde_json::Number::from_f64(*f)
                .map(JsonValue::Number)
                // JSON can't represent NaN or Infinity
                .unwrap_or_else(|| JsonValue::String(f.to_string())),
            SqlValue::Json(v) => v.clone(),
            SqlValue::Bytes(b) => {
                let encoded = base64::Engine::encode(&base64::engine::general_purpose::STANDARD, b);
                serde_json::json!({
                    "_type": "blob",
                    "data": encoded
                })
            }
            other => other
                .to_text()
                .map(JsonValue::String)
                .unwrap_or(JsonValue::Null),
        }
    }
}

/// One result row: column labels shared across the result set plus the values.
#[derive(Debug, Clone)]
pub struct SqlRow {
    columns: Arc<Vec<String>>,
    values: Vec<SqlValue>,
}

impl SqlRow {
    pub fn new(columns: Arc<Vec<String>>, values: Vec<SqlValue>) -> Self {
        Self { columns, values }
    }

    /// Value of the column with the given label.
    pub fn get(&self, label: &str) -> Option<&SqlValue> {
        self.columns
            .iter()
            .position(|c| c == label)
            .and_then(|idx| self.values.get(idx))
    }

    /// Value at a positional index.
    pub fn get_index(&self, idx: usize) -> Option<&SqlValue> {
        self.values.get(idx)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &SqlValue)> {
        self.columns
            .iter()
            .map(String::as_str)
            .zip(self.values.iter())
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// JSON object keyed by column label, with NULL columns omitted.
    pub fn to_json_object(&self) -> serde_json::Map<String, JsonValue> {
        let mut obj = serde_json::Map::new();
        for (label, value) in self.iter() {
            if !value.is_null() {
                obj.insert(label.to_string(), value.to_json());
            }
        }
        obj
    }
}

/// Coarse classification of a declared column type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColumnKind {
    Integer,
    Decimal,
    Text,
    DateTime,
    Other,
}

impl ColumnKind {
    /// Classify a declared type name as reported by the database catalog.
    ///
    /// Accepts PostgreSQL `information_schema` names ("timestamp without time zone",
    /// "character varying", "double precision") as well as SQLite declared types
    /// ("DATETIME", "VARCHAR(50)", "INTEGER").
    pub fn from_declared_type(declared: &str) -> Self {
        let t = declared.trim().to_ascii_lowercase();
        if t.starts_with("timestamp") || t == "date" || t.contains("datetime") {
            ColumnKind::DateTime
        } else if t.contains("interval") || t.contains("point") {
            ColumnKind::Other
        } else if t.contains("int") || t.contains("serial") {
            ColumnKind::Integer
        } else if t.contains("numeric")
            || t.contains("decimal")
            || t.contains("real")
            || t.contains("double")
            || t.contains("float")
        {
            ColumnKind::Decimal
        } else if t.contains("char") || t.contains("text") || t.contains("clob") || t == "name" {
            ColumnKind::Text
        } else {
            ColumnKind::Other
        }
    }

    /// Whether a column of this kind can drive an increment cursor.
    pub fn supports_increment(&self) -> bool {
        !matches!(self, ColumnKind::Other)
    }
}

/// Information about a table column as seen in the live schema.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnInfo {
    pub name: String,
    /// Declared type as reported by the catalog
    pub data_type: String,
    /// Type name usable as a cast target for bound parameters
    pub cast_type: String,
    pub kind: ColumnKind,
    pub is_nullable: bool,
}

impl ColumnInfo {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        let data_type = data_type.into();
        Self {
            name: name.into(),
            kind: ColumnKind::from_declared_type(&data_type),
            cast_type: data_type.clone(),
            data_type,
            is_nullable: true,
        }
    }

    pub fn with_cast_type(mut self, cast_type: impl Into<String>) -> Self {
        self.cast_type = cast_type.into();
        self
    }

    pub fn with_nullable(mut self, is_nullable: bool) -> Self {
        self.is_nullable = is_nullable;
        self
    }
}
