//! Value types for snowcache-upstream
//!
//! Warehouse cells arrive as [`Value`]s. The cache keeps strings only, so every
//! value passes through [`Value::to_cell`] before it is stored:
//! - NULL becomes the empty string
//! - numbers, booleans, dates and timestamps get a canonical text form
//! - semi-structured values (VARIANT, OBJECT, ARRAY) are rejected

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write as _;

use crate::error::{Error, Result};

/// SQL value as returned by an upstream cursor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// SQL NULL
    Null,
    /// Boolean value
    Bool(bool),
    /// 32-bit signed integer
    Int32(i32),
    /// 64-bit signed integer (NUMBER(38,0) that fits)
    Int64(i64),
    /// 64-bit floating point (FLOAT, DOUBLE)
    Float64(f64),
    /// Fixed-point number (NUMBER(p,s))
    Decimal(Decimal),
    /// Text (VARCHAR, CHAR, TEXT)
    String(String),
    /// Binary data (BINARY, VARBINARY)
    Bytes(Vec<u8>),
    /// Date without time
    Date(NaiveDate),
    /// Time without date
    Time(NaiveTime),
    /// Timestamp without timezone (TIMESTAMP_NTZ)
    DateTime(NaiveDateTime),
    /// Timestamp with timezone (TIMESTAMP_TZ / TIMESTAMP_LTZ)
    DateTimeTz(DateTime<Utc>),
    /// Semi-structured value (VARIANT)
    Json(serde_json::Value),
    /// ARRAY
    Array(Vec<Value>),
    /// OBJECT
    Object(BTreeMap<String, Value>),
}

impl Value {
    /// Check if value is NULL
    #[inline]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Whether the value is semi-structured and cannot be cached as a cell
    pub fn is_composite(&self) -> bool {
        match self {
            Self::Array(_) | Self::Object(_) => true,
            Self::Json(j) => j.is_array() || j.is_object(),
            _ => false,
        }
    }

    /// Warehouse type name, used in error messages
    pub fn sql_type(&self) -> &'static str {
        match self {
            Self::Null => "NULL",
            Self::Bool(_) => "BOOLEAN",
            Self::Int32(_) => "INTEGER",
            Self::Int64(_) => "BIGINT",
            Self::Float64(_) => "FLOAT",
            Self::Decimal(_) => "NUMBER",
            Self::String(_) => "VARCHAR",
            Self::Bytes(_) => "BINARY",
            Self::Date(_) => "DATE",
            Self::Time(_) => "TIME",
            Self::DateTime(_) => "TIMESTAMP_NTZ",
            Self::DateTimeTz(_) => "TIMESTAMP_TZ",
            Self::Json(_) => "VARIANT",
            Self::Array(_) => "ARRAY",
            Self::Object(_) => "OBJECT",
        }
    }

    /// Try to convert to i64
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int32(n) => Some(i64::from(*n)),
            Self::Int64(n) => Some(*n),
            Self::Float64(n) if n.is_finite() => Some(*n as i64),
            Self::Decimal(d) => d.to_string().parse().ok(),
            Self::String(s) => s.trim().parse().ok(),
            Self::Json(serde_json::Value::Number(n)) => n.as_i64(),
            _ => None,
        }
    }

    /// Try to borrow as string
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Render the value as a cache cell.
    ///
    /// Fails with [`Error::TypeConversion`] for composite values.
    pub fn to_cell(&self) -> Result<String> {
        let cell = match self {
            Self::Null => String::new(),
            Self::Bool(b) => b.to_string(),
            Self::Int32(n) => n.to_string(),
            Self::Int64(n) => n.to_string(),
            Self::Float64(n) => n.to_string(),
            Self::Decimal(d) => d.normalize().to_string(),
            Self::String(s) => s.clone(),
            Self::Bytes(b) => hex_lower(b),
            Self::Date(d) => d.format("%Y-%m-%d").to_string(),
            Self::Time(t) => t.format("%H:%M:%S%.f").to_string(),
            Self::DateTime(dt) => dt.format("%Y-%m-%d %H:%M:%S%.f").to_string(),
            Self::DateTimeTz(dt) => dt.to_rfc3339(),
            Self::Json(j) => match j {
                serde_json::Value::Null => String::new(),
                serde_json::Value::Bool(b) => b.to_string(),
                serde_json::Value::Number(n) => n.to_string(),
                serde_json::Value::String(s) => s.clone(),
                serde_json::Value::Array(_) | serde_json::Value::Object(_) => {
                    return Err(unsupported(self));
                }
            },
            Self::Array(_) | Self::Object(_) => return Err(unsupported(self)),
        };
        Ok(cell)
    }
}

fn unsupported(value: &Value) -> Error {
    Error::type_conversion(format!(
        "{} values cannot be cached; cast the column to VARCHAR",
        value.sql_type()
    ))
}

fn hex_lower(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(out, "{:02x}", b);
    }
    out
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Int32(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int64(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float64(v)
    }
}

impl From<Decimal> for Value {
    fn from(v: Decimal) -> Self {
        Self::Decimal(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::String(v.to_owned())
    }
}

impl From<NaiveDate> for Value {
    fn from(v: NaiveDate) -> Self {
        Self::Date(v)
    }
}

impl From<NaiveDateTime> for Value {
    fn from(v: NaiveDateTime) -> Self {
        Self::DateTime(v)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Self::DateTimeTz(v)
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        Self::Json(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(val) => val.into(),
            None => Self::Null,
        }
    }
}

/// One result row, positional
pub type Row = Vec<Value>;

/// Column description captured from the cursor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnMetadata {
    /// Column name as reported by the warehouse
    pub name: String,
    /// Warehouse type name, if the driver reports one
    pub type_name: Option<String>,
    /// Whether the column is nullable
    pub nullable: bool,
}

impl ColumnMetadata {
    /// Create basic column metadata
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_name: None,
            nullable: true,
        }
    }

    /// Set the type name
    pub fn with_type(mut self, type_name: impl Into<String>) -> Self {
        self.type_name = Some(type_name.into());
        self
    }
}
