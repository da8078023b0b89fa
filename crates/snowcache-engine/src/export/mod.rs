//! Export encoders
//!
//! Cached rows are pushed one at a time into an [`ExportEncoder`], which
//! writes them straight to its output:
//!
//! - `csv`: RFC 4180 quoting, CRLF line endings, header row first
//! - `tsv` / `clipboard`: tab separated, cells sanitised against control
//!   characters and formula injection
//! - `xlsx`: a single `sheet1` worksheet streamed into a zip container, with
//!   an optional embedded chart
//!
//! All cells arrive as strings (the cache does not keep upstream types).

mod delimited;
mod xlsx;

use std::fmt;
use std::io::{Seek, Write};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::store::filter::resolve_column;
use crate::store::ScanQuery;

pub use delimited::{escape_csv_field, sanitize_tsv_cell, DelimitedWriter};
pub use xlsx::XlsxWriter;

/// Longest filename handed back to callers, extension included
pub const MAX_FILENAME_LEN: usize = 120;

/// Prefix of generated filenames
pub const DEFAULT_FILENAME_PREFIX: &str = "query_results";

/// Export format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    /// Comma separated values
    Csv,
    /// Tab separated values
    Tsv,
    /// Office Open XML workbook
    Xlsx,
    /// TSV body sized for the clipboard
    Clipboard,
}

impl ExportFormat {
    /// Format name
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Csv => "csv",
            Self::Tsv => "tsv",
            Self::Xlsx => "xlsx",
            Self::Clipboard => "clipboard",
        }
    }

    /// File extension, without the dot
    pub const fn extension(&self) -> &'static str {
        match self {
            Self::Csv => "csv",
            Self::Tsv | Self::Clipboard => "tsv",
            Self::Xlsx => "xlsx",
        }
    }

    /// MIME type
    pub const fn content_type(&self) -> &'static str {
        match self {
            Self::Csv => "text/csv; charset=utf-8",
            Self::Tsv | Self::Clipboard => "text/tab-separated-values; charset=utf-8",
            Self::Xlsx => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        }
    }
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ExportFormat {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "csv" => Ok(Self::Csv),
            "tsv" => Ok(Self::Tsv),
            "xlsx" | "excel" => Ok(Self::Xlsx),
            "clipboard" => Ok(Self::Clipboard),
            other => Err(EngineError::Validation(format!(
                "unsupported export format '{}'",
                other
            ))),
        }
    }
}

/// Chart kind
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChartType {
    /// Clustered columns
    #[default]
    Bar,
    /// Lines with markers
    Line,
    /// X/Y scatter
    Scatter,
}

/// Chart requested by the caller, by original column names
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChartSpec {
    /// Kind of chart
    #[serde(default)]
    pub chart_type: ChartType,
    /// Category (or X) column
    pub x_column: String,
    /// Value columns, one series each
    pub y_columns: Vec<String>,
    /// Chart title
    #[serde(default)]
    pub title: Option<String>,
    /// X axis label
    #[serde(default)]
    pub x_label: Option<String>,
    /// Y axis label
    #[serde(default)]
    pub y_label: Option<String>,
}

impl ChartSpec {
    /// Resolve column names against the session header
    pub fn resolve(&self, header: &[String]) -> Result<ResolvedChart> {
        if self.y_columns.is_empty() {
            return Err(EngineError::Validation(
                "chart needs at least one y column".to_string(),
            ));
        }
        let x = resolve_column(header, &self.x_column)?;
        let ys = self
            .y_columns
            .iter()
            .map(|c| resolve_column(header, c))
            .collect::<Result<Vec<_>>>()?;
        Ok(ResolvedChart {
            chart_type: self.chart_type,
            x,
            ys,
            title: self.title.clone(),
            x_label: self.x_label.clone(),
            y_label: self.y_label.clone(),
        })
    }
}

/// Chart with column positions in place of names
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedChart {
    /// Kind of chart
    pub chart_type: ChartType,
    /// Category column position
    pub x: usize,
    /// Value column positions
    pub ys: Vec<usize>,
    /// Chart title
    pub title: Option<String>,
    /// X axis label
    pub x_label: Option<String>,
    /// Y axis label
    pub y_label: Option<String>,
}

/// An export request against a cached session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportRequest {
    /// Output format
    pub format: ExportFormat,
    /// Requested filename; generated when absent
    #[serde(default)]
    pub filename: Option<String>,
    /// Filters and sort applied to the exported rows
    #[serde(default, flatten)]
    pub scan: ScanQuery,
    /// Optional chart (xlsx only)
    #[serde(default)]
    pub chart: Option<ChartSpec>,
}

impl ExportRequest {
    /// Export everything in `format`
    pub fn new(format: ExportFormat) -> Self {
        Self {
            format,
            filename: None,
            scan: ScanQuery::default(),
            chart: None,
        }
    }

    /// Set the filename
    pub fn with_filename(mut self, name: impl Into<String>) -> Self {
        self.filename = Some(name.into());
        self
    }

    /// Set filters and sort
    pub fn with_scan(mut self, scan: ScanQuery) -> Self {
        self.scan = scan;
        self
    }

    /// Request a chart
    pub fn with_chart(mut self, chart: ChartSpec) -> Self {
        self.chart = Some(chart);
        self
    }
}

/// What an export produced
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportSummary {
    /// Sanitised filename
    pub filename: String,
    /// MIME type
    pub content_type: String,
    /// Data rows written, header excluded
    pub rows: u64,
    /// Whether a chart was embedded
    pub chart_embedded: bool,
}

/// Push-style encoder for one export
pub enum ExportEncoder<W: Write + Seek> {
    /// CSV, TSV and clipboard
    Delimited(DelimitedWriter<W>),
    /// Workbook
    Xlsx(Box<XlsxWriter<W>>),
}

impl<W: Write + Seek> ExportEncoder<W> {
    /// Start an export, writing the header immediately.
    ///
    /// `chart` is only honoured for [`ExportFormat::Xlsx`].
    pub fn new(
        format: ExportFormat,
        header: &[String],
        chart: Option<ResolvedChart>,
        out: W,
    ) -> Result<Self> {
        Ok(match format {
            ExportFormat::Csv => Self::Delimited(DelimitedWriter::csv(header, out)?),
            ExportFormat::Tsv | ExportFormat::Clipboard => {
                Self::Delimited(DelimitedWriter::tsv(header, out)?)
            }
            ExportFormat::Xlsx => Self::Xlsx(Box::new(XlsxWriter::new(header, chart, out)?)),
        })
    }

    /// Append one data row
    pub fn write_row(&mut self, row: &[String]) -> Result<()> {
        match self {
            Self::Delimited(w) => w.write_row(row),
            Self::Xlsx(w) => w.write_row(row),
        }
    }

    /// Data rows written so far
    pub fn rows_written(&self) -> u64 {
        match self {
            Self::Delimited(w) => w.rows_written(),
            Self::Xlsx(w) => w.rows_written(),
        }
    }

    /// Whether the output will carry a chart
    pub fn has_chart(&self) -> bool {
        match self {
            Self::Delimited(_) => false,
            Self::Xlsx(w) => w.has_chart(),
        }
    }

    /// Flush trailing parts and hand back the output
    pub fn finish(self) -> Result<W> {
        match self {
            Self::Delimited(w) => w.finish(),
            Self::Xlsx(w) => w.finish(),
        }
    }
}

/// Produce a safe download filename.
///
/// Reserved characters `\ / : * ? " < > |` and control characters become
/// `_`, the extension is appended when missing and the result is cut to
/// [`MAX_FILENAME_LEN`] characters. Without a usable name the default is
/// `<prefix>_<YYYYMMDD_HHMMSS>.<ext>`.
pub fn sanitize_filename(
    requested: Option<&str>,
    prefix: &str,
    extension: &str,
    now: DateTime<Utc>,
) -> String {
    let cleaned: String = requested
        .unwrap_or_default()
        .chars()
        .map(|c| match c {
            '\\' | '/' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let cleaned = cleaned.trim().trim_matches('.').trim();

    let stem = if cleaned.is_empty() {
        format!("{}_{}", prefix, now.format("%Y%m%d_%H%M%S"))
    } else {
        cleaned.to_string()
    };

    let suffix = format!(".{}", extension);
    let stem = if stem.to_ascii_lowercase().ends_with(&suffix.to_ascii_lowercase()) {
        stem[..stem.len() - suffix.len()].to_string()
    } else {
        stem
    };

    let budget = MAX_FILENAME_LEN.saturating_sub(suffix.chars().count());
    let stem: String = stem.chars().take(budget).collect();
    format!("{}{}", stem.trim_end(), suffix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::io::Cursor;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap()
    }

    // ==================== Format Tests ====================

    #[test]
    fn test_format_metadata() {
        assert_eq!(ExportFormat::Csv.extension(), "csv");
        assert_eq!(ExportFormat::Clipboard.extension(), "tsv");
        assert!(ExportFormat::Xlsx.content_type().contains("spreadsheetml"));
        assert_eq!("XLSX".parse::<ExportFormat>().unwrap(), ExportFormat::Xlsx);
        assert!("pdf".parse::<ExportFormat>().is_err());
        assert_eq!(
            serde_json::to_string(&ExportFormat::Clipboard).unwrap(),
            "\"clipboard\""
        );
    }

    // ==================== Filename Tests ====================

    #[test]
    fn test_default_filename() {
        assert_eq!(
            sanitize_filename(None, "query_results", "csv", now()),
            "query_results_20240309_140507.csv"
        );
        assert_eq!(
            sanitize_filename(Some("  "), "query_results", "xlsx", now()),
            "query_results_20240309_140507.xlsx"
        );
    }

    #[test]
    fn test_reserved_characters_replaced() {
        assert_eq!(
            sanitize_filename(Some(r#"a\b/c:d*e?f"g<h>i|j"#), "p", "csv", now()),
            "a_b_c_d_e_f_g_h_i_j.csv"
        );
        assert_eq!(sanitize_filename(Some("report.CSV"), "p", "csv", now()), "report.csv");
    }

    #[test]
    fn test_long_filename_trimmed() {
        let long = "x".repeat(300);
        let name = sanitize_filename(Some(&long), "p", "xlsx", now());
        assert_eq!(name.chars().count(), MAX_FILENAME_LEN);
        assert!(name.ends_with(".xlsx"));
    }

    // ==================== Chart Tests ====================

    #[test]
    fn test_chart_resolution() {
        let header = vec!["region".to_string(), "amount".to_string()];
        let spec = ChartSpec {
            chart_type: ChartType::Line,
            x_column: "Region".into(),
            y_columns: vec!["amount".into()],
            title: None,
            x_label: None,
            y_label: None,
        };
        let resolved = spec.resolve(&header).unwrap();
        assert_eq!(resolved.x, 0);
        assert_eq!(resolved.ys, vec![1]);

        let bad = ChartSpec {
            y_columns: vec!["nope".into()],
            ..spec.clone()
        };
        assert!(matches!(bad.resolve(&header), Err(EngineError::UnknownColumn(_))));

        let empty = ChartSpec {
            y_columns: vec![],
            ..spec
        };
        assert!(matches!(empty.resolve(&header), Err(EngineError::Validation(_))));
    }

    // ==================== Encoder Tests ====================

    #[test]
    fn test_encoder_dispatch() {
        let header = vec!["a".to_string(), "b".to_string()];
        let mut enc = ExportEncoder::new(ExportFormat::Csv, &header, None, Cursor::new(Vec::new())).unwrap();
        enc.write_row(&["1".to_string(), "x,y".to_string()]).unwrap();
        assert_eq!(enc.rows_written(), 1);
        assert!(!enc.has_chart());
        let out = enc.finish().unwrap().into_inner();
        assert_eq!(String::from_utf8(out).unwrap(), "a,b\r\n1,\"x,y\"\r\n");
    }
}
