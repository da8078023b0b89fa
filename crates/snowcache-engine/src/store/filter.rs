//! Filter compilation
//!
//! Request column names are resolved against the session's original header
//! and turned into positional `col_<k>` references; every value is bound as a
//! parameter. Nothing from a request is ever spliced into SQL text.

use std::collections::BTreeMap;
use std::fmt;

use rusqlite::types::Value as SqlValue;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// Physical name of the `idx`-th cached column
pub fn column_name(idx: usize) -> String {
    format!("col_{}", idx)
}

/// Resolve a request column name to its position in `header`.
///
/// Exact match wins, then ASCII case-insensitive. Duplicate names resolve to
/// the first occurrence. Physical `col_<k>` names are not accepted unless the
/// header itself contains that name.
pub fn resolve_column(header: &[String], name: &str) -> Result<usize> {
    header
        .iter()
        .position(|h| h == name)
        .or_else(|| header.iter().position(|h| h.eq_ignore_ascii_case(name)))
        .ok_or_else(|| EngineError::UnknownColumn(name.to_string()))
}

/// Predicate operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[allow(missing_docs)]
pub enum FilterOp {
    #[serde(rename = "=")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "contains")]
    Contains,
    #[serde(rename = "starts_with")]
    StartsWith,
    #[serde(rename = "ends_with")]
    EndsWith,
    #[serde(rename = "in")]
    In,
    #[serde(rename = "is_null")]
    IsNull,
    #[serde(rename = "is_not_null")]
    IsNotNull,
}

impl FilterOp {
    fn comparison(&self) -> Option<&'static str> {
        match self {
            Self::Lt => Some("<"),
            Self::Le => Some("<="),
            Self::Gt => Some(">"),
            Self::Ge => Some(">="),
            _ => None,
        }
    }
}

impl fmt::Display for FilterOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Eq => "=",
            Self::Ne => "!=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::Contains => "contains",
            Self::StartsWith => "starts_with",
            Self::EndsWith => "ends_with",
            Self::In => "in",
            Self::IsNull => "is_null",
            Self::IsNotNull => "is_not_null",
        };
        f.write_str(s)
    }
}

/// One `{column, op, value}` predicate.
///
/// `value` may be a string, number, boolean, null or (for `in`) a list; `in`
/// also accepts a comma-separated string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtendedFilter {
    /// Original column name
    pub column: String,
    /// Operator
    pub op: FilterOp,
    /// Operand
    #[serde(default)]
    pub value: serde_json::Value,
}

impl ExtendedFilter {
    /// Create a predicate
    pub fn new(column: impl Into<String>, op: FilterOp, value: impl Into<serde_json::Value>) -> Self {
        Self {
            column: column.into(),
            op,
            value: value.into(),
        }
    }

    fn scalar(&self) -> String {
        scalar_text(&self.value)
    }

    fn list(&self) -> Vec<String> {
        match &self.value {
            serde_json::Value::Array(items) => items.iter().map(scalar_text).collect(),
            serde_json::Value::String(s) => s
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
            serde_json::Value::Null => Vec::new(),
            other => vec![scalar_text(other)],
        }
    }
}

fn scalar_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Null => String::new(),
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Compiled `WHERE` fragment with its bound parameters
#[derive(Debug, Default, Clone, PartialEq)]
pub struct WhereClause {
    conditions: Vec<String>,
    params: Vec<SqlValue>,
}

impl WhereClause {
    /// Compile equality filters and predicates against `header`.
    ///
    /// `filters` maps a column to its allowed values (OR within a column, AND
    /// across columns); an empty list leaves the column unconstrained.
    /// Predicates are ANDed with the filters.
    pub fn build(
        header: &[String],
        filters: &BTreeMap<String, Vec<String>>,
        extended: &[ExtendedFilter],
    ) -> Result<Self> {
        let mut clause = Self::default();

        for (column, allowed) in filters {
            let col = column_name(resolve_column(header, column)?);
            if allowed.is_empty() {
                continue;
            }
            clause.push_in(&col, allowed.iter().cloned());
        }

        for filter in extended {
            let col = column_name(resolve_column(header, &filter.column)?);
            clause.push_predicate(&col, filter);
        }
        Ok(clause)
    }

    /// Add `col <> ''`, the cached form of "not null"
    pub fn require_non_empty(&mut self, col: &str) {
        self.conditions.push(format!("{} <> ''", col));
    }

    /// `WHERE ...` or the empty string
    pub fn sql(&self) -> String {
        if self.conditions.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", self.conditions.join(" AND "))
        }
    }

    /// Bound parameters in placeholder order
    pub fn params(&self) -> &[SqlValue] {
        &self.params
    }

    /// Whether no condition applies
    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    fn bind(&mut self, value: SqlValue) -> String {
        self.params.push(value);
        format!("?{}", self.params.len())
    }

    fn push_in(&mut self, col: &str, values: impl IntoIterator<Item = String>) {
        let placeholders: Vec<String> = values
            .into_iter()
            .map(|v| self.bind(SqlValue::Text(v)))
            .collect();
        if placeholders.is_empty() {
            self.conditions.push("0".to_string());
        } else {
            self.conditions
                .push(format!("{} IN ({})", col, placeholders.join(", ")));
        }
    }

    fn push_like(&mut self, col: &str, pattern: String) {
        let p = self.bind(SqlValue::Text(pattern));
        self.conditions
            .push(format!("{} LIKE {} ESCAPE '\\'", col, p));
    }

    fn push_predicate(&mut self, col: &str, filter: &ExtendedFilter) {
        match filter.op {
            FilterOp::Eq => {
                let p = self.bind(SqlValue::Text(filter.scalar()));
                self.conditions.push(format!("{} = {}", col, p));
            }
            FilterOp::Ne => {
                let p = self.bind(SqlValue::Text(filter.scalar()));
                self.conditions.push(format!("{} <> {}", col, p));
            }
            FilterOp::Lt | FilterOp::Le | FilterOp::Gt | FilterOp::Ge => {
                let cmp = filter.op.comparison().unwrap_or("=");
                let operand = filter.scalar();
                match operand.trim().parse::<f64>() {
                    Ok(n) if n.is_finite() => {
                        let p = self.bind(SqlValue::Real(n));
                        self.conditions.push(format!(
                            "({col} <> '' AND CAST({col} AS REAL) {cmp} {p})",
                            col = col,
                            cmp = cmp,
                            p = p
                        ));
                    }
                    _ => {
                        let p = self.bind(SqlValue::Text(operand));
                        self.conditions.push(format!("{} {} {}", col, cmp, p));
                    }
                }
            }
            FilterOp::Contains => {
                self.push_like(col, format!("%{}%", escape_like(&filter.scalar())))
            }
            FilterOp::StartsWith => {
                self.push_like(col, format!("{}%", escape_like(&filter.scalar())))
            }
            FilterOp::EndsWith => {
                self.push_like(col, format!("%{}", escape_like(&filter.scalar())))
            }
            FilterOp::In => self.push_in(col, filter.list()),
            FilterOp::IsNull => self.conditions.push(format!("{} = ''", col)),
            FilterOp::IsNotNull => self.require_non_empty(col),
        }
    }
}

fn escape_like(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}
