//! CSV and TSV writers

use std::borrow::Cow;
use std::io::Write;

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dialect {
    Csv,
    Tsv,
}

/// Writes a header and rows as CSV or TSV
pub struct DelimitedWriter<W: Write> {
    out: W,
    dialect: Dialect,
    rows: u64,
    line: String,
}

impl<W: Write> DelimitedWriter<W> {
    /// Comma separated, CRLF terminated, RFC 4180 quoting
    pub fn csv(header: &[String], out: W) -> Result<Self> {
        Self::start(Dialect::Csv, header, out)
    }

    /// Tab separated, LF terminated, sanitised cells
    pub fn tsv(header: &[String], out: W) -> Result<Self> {
        Self::start(Dialect::Tsv, header, out)
    }

    fn start(dialect: Dialect, header: &[String], out: W) -> Result<Self> {
        let mut writer = Self {
            out,
            dialect,
            rows: 0,
            line: String::new(),
        };
        writer.write_line(header)?;
        Ok(writer)
    }

    /// Append one data row
    pub fn write_row(&mut self, row: &[String]) -> Result<()> {
        self.write_line(row)?;
        self.rows += 1;
        Ok(())
    }

    /// Data rows written
    pub fn rows_written(&self) -> u64 {
        self.rows
    }

    /// Flush and return the output
    pub fn finish(mut self) -> Result<W> {
        self.out.flush()?;
        Ok(self.out)
    }

    fn write_line(&mut self, cells: &[String]) -> Result<()> {
        self.line.clear();
        for (i, cell) in cells.iter().enumerate() {
            match self.dialect {
                Dialect::Csv => {
                    if i > 0 {
                        self.line.push(',');
                    }
                    self.line.push_str(&escape_csv_field(cell, ','));
                }
                Dialect::Tsv => {
                    if i > 0 {
                        self.line.push('\t');
                    }
                    let clean = sanitize_tsv_cell(cell);
                    self.line.push_str(&quote_tsv(&clean));
                }
            }
        }
        self.line.push_str(match self.dialect {
            Dialect::Csv => "\r\n",
            Dialect::Tsv => "\n",
        });
        self.out.write_all(self.line.as_bytes())?;
        Ok(())
    }
}

/// Quote a CSV field if it contains the delimiter, a quote or a line break
pub fn escape_csv_field(field: &str, delimiter: char) -> Cow<'_, str> {
    if field.contains(delimiter) || field.contains('"') || field.contains('\n') || field.contains('\r') {
        Cow::Owned(format!("\"{}\"", field.replace('"', "\"\"")))
    } else {
        Cow::Borrowed(field)
    }
}

/// Clean one cell for tab separated or spreadsheet output.
///
/// Line breaks become `\n`, tabs become spaces, other control characters are
/// dropped. A cell starting with `=`, `+`, `-` or `@` gets a leading `'` so
/// spreadsheets do not evaluate it, unless the whole cell is a plain number
/// such as `-12.5`.
pub fn sanitize_tsv_cell(cell: &str) -> Cow<'_, str> {
    let needs_cleaning = cell.chars().any(|c| c.is_control() && c != '\n');
    let mut out: Cow<'_, str> = if needs_cleaning {
        let normalised = cell.replace("\r\n", "\n");
        Cow::Owned(
            normalised
                .chars()
                .filter_map(|c| match c {
                    '\r' | '\n' => Some('\n'),
                    '\t' => Some(' '),
                    c if c.is_control() => None,
                    c => Some(c),
                })
                .collect(),
        )
    } else {
        Cow::Borrowed(cell)
    };

    if starts_like_formula(&out) && !is_plain_number(&out) {
        out = Cow::Owned(format!("'{}", out));
    }
    out
}

fn starts_like_formula(cell: &str) -> bool {
    matches!(cell.chars().next(), Some('=' | '+' | '-' | '@'))
}

/// `-?digits[.digits][e[+-]digits]`, as written by the cache for numbers
pub(crate) fn is_plain_number(cell: &str) -> bool {
    let body = cell.strip_prefix('-').unwrap_or(cell);
    let (mantissa, exponent) = match body.find(['e', 'E']) {
        Some(pos) => (&body[..pos], Some(&body[pos + 1..])),
        None => (body, None),
    };
    let (int, frac) = match mantissa.split_once('.') {
        Some((i, f)) => (i, Some(f)),
        None => (mantissa, None),
    };
    let digits = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());

    if !digits(int) {
        return false;
    }
    if let Some(f) = frac {
        if !digits(f) {
            return false;
        }
    }
    match exponent {
        Some(e) => digits(e.strip_prefix(['+', '-']).unwrap_or(e)),
        None => true,
    }
}

fn quote_tsv(cell: &str) -> Cow<'_, str> {
    if cell.contains('\n') || cell.starts_with('"') {
        Cow::Owned(format!("\"{}\"", cell.replace('"', "\"\"")))
    } else {
        Cow::Borrowed(cell)
    }
}
