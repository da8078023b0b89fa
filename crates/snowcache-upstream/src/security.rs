//! Statement and identifier hygiene for snowcache-upstream.
//!
//! Provides:
//! - Identifier validation for cache table names built from session ids
//! - Double-quote identifier quoting
//! - A scanner that splits statements into code, quoted text and comments
//! - Stripping of trailing comments and terminators before a statement is
//!   wrapped in a sub-select

use std::ops::Range;

use crate::error::Error;

/// Validate a SQL identifier (cache table or column names).
///
/// Enforces strict character rules:
/// - Must not be empty
/// - Maximum 255 characters
/// - Must start with ASCII letter or underscore
/// - May only contain ASCII alphanumeric characters and underscores
///
/// # Examples
///
/// ```
/// use snowcache_upstream::security::validate_sql_identifier;
///
/// assert!(validate_sql_identifier("cache_alice_20240101120000_001").is_ok());
/// assert!(validate_sql_identifier("_private").is_ok());
///
/// // Rejects injection attempts
/// assert!(validate_sql_identifier("x; DROP TABLE users--").is_err());
/// assert!(validate_sql_identifier("").is_err());
/// assert!(validate_sql_identifier("123abc").is_err());
/// ```
pub fn validate_sql_identifier(name: &str) -> crate::Result<()> {
    if name.is_empty() {
        return Err(Error::config("SQL identifier cannot be empty"));
    }

    if name.len() > 255 {
        return Err(Error::config(format!(
            "SQL identifier too long: {} chars (max 255)",
            name.len()
        )));
    }

    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => {
            return Err(Error::config(format!(
                "Invalid SQL identifier '{}': must start with a letter or underscore",
                name
            )));
        }
    }

    if let Some(c) = chars.find(|c| !c.is_ascii_alphanumeric() && *c != '_') {
        return Err(Error::config(format!(
            "Invalid SQL identifier '{}': contains invalid character '{}'",
            name, c
        )));
    }

    Ok(())
}

/// Quote an identifier with double quotes, doubling embedded quotes.
///
/// ```
/// use snowcache_upstream::security::quote_identifier;
///
/// assert_eq!(quote_identifier("col_0"), "\"col_0\"");
/// assert_eq!(quote_identifier("a\"b"), "\"a\"\"b\"");
/// ```
pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Kind of a [`sql_segments`] piece
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlSegment {
    /// Plain SQL text
    Code,
    /// String literal or quoted identifier, quotes included
    Quoted,
    /// `-- line` (without its newline) or `/* block */` comment
    Comment,
}

/// Split `stmt` into byte ranges of code, quoted text and comments.
///
/// Doubled quotes inside a literal are an escaped quote. Fails on an
/// unterminated literal or block comment.
///
/// ```
/// use snowcache_upstream::security::{sql_segments, SqlSegment};
///
/// let stmt = "SELECT 'a' -- x";
/// let kinds: Vec<_> = sql_segments(stmt).unwrap().into_iter().map(|(k, _)| k).collect();
/// assert_eq!(kinds, vec![SqlSegment::Code, SqlSegment::Quoted, SqlSegment::Code, SqlSegment::Comment]);
/// ```
pub fn sql_segments(stmt: &str) -> crate::Result<Vec<(SqlSegment, Range<usize>)>> {
    let mut segments = Vec::new();
    let mut chars = stmt.char_indices().peekable();
    let mut code_start = 0;

    let push_code = |segments: &mut Vec<(SqlSegment, Range<usize>)>, from: usize, to: usize| {
        if to > from {
            segments.push((SqlSegment::Code, from..to));
        }
    };

    while let Some((at, c)) = chars.next() {
        let next = chars.peek().map(|&(_, n)| n);
        let (kind, end) = match (c, next) {
            ('\'', _) | ('"', _) => {
                let mut end = None;
                while let Some((i, n)) = chars.next() {
                    if n == c {
                        if chars.peek().map(|&(_, q)| q) == Some(c) {
                            chars.next();
                            continue;
                        }
                        end = Some(i + n.len_utf8());
                        break;
                    }
                }
                let end = end.ok_or_else(|| Error::syntax("unterminated quoted string"))?;
                (SqlSegment::Quoted, end)
            }
            ('-', Some('-')) => {
                let mut end = stmt.len();
                while let Some(&(i, n)) = chars.peek() {
                    if n == '\n' {
                        end = i;
                        break;
                    }
                    chars.next();
                }
                (SqlSegment::Comment, end)
            }
            ('/', Some('*')) => {
                chars.next();
                let mut prev = '\0';
                let mut end = None;
                for (i, n) in chars.by_ref() {
                    if prev == '*' && n == '/' {
                        end = Some(i + 1);
                        break;
                    }
                    prev = n;
                }
                let end = end.ok_or_else(|| Error::syntax("unterminated block comment"))?;
                (SqlSegment::Comment, end)
            }
            _ => continue,
        };
        push_code(&mut segments, code_start, at);
        segments.push((kind, at..end));
        code_start = end;
    }
    push_code(&mut segments, code_start, stmt.len());
    Ok(segments)
}

/// Replace literals, quoted identifiers and comments with a space so keyword
/// checks only see SQL code.
///
/// ```
/// use snowcache_upstream::security::mask_literals_and_comments;
///
/// assert_eq!(mask_literals_and_comments("SELECT 'x;y' -- drop").unwrap(), "SELECT    ");
/// ```
pub fn mask_literals_and_comments(stmt: &str) -> crate::Result<String> {
    let mut out = String::with_capacity(stmt.len());
    for (kind, range) in sql_segments(stmt)? {
        match kind {
            SqlSegment::Code => out.push_str(&stmt[range]),
            SqlSegment::Quoted | SqlSegment::Comment => out.push(' '),
        }
    }
    Ok(out)
}

/// Remove trailing comments, whitespace and `;` terminators.
///
/// Text the scanner cannot split (an unterminated literal) only loses
/// trailing whitespace and `;`; the warehouse reports the real error.
///
/// ```
/// use snowcache_upstream::security::strip_statement_terminator;
///
/// assert_eq!(strip_statement_terminator("SELECT 1 ;\n"), "SELECT 1");
/// assert_eq!(strip_statement_terminator("SELECT 1;;"), "SELECT 1");
/// assert_eq!(strip_statement_terminator("SELECT 1; -- note"), "SELECT 1");
/// assert_eq!(strip_statement_terminator("SELECT 1 /* a */ -- b"), "SELECT 1");
/// ```
pub fn strip_statement_terminator(stmt: &str) -> &str {
    let is_tail = |c: char| c.is_whitespace() || c == ';';
    let Ok(segments) = sql_segments(stmt) else {
        return stmt.trim_end_matches(is_tail);
    };

    let mut end = 0;
    for (kind, range) in segments.into_iter().rev() {
        match kind {
            SqlSegment::Comment => continue,
            SqlSegment::Quoted => {
                end = range.end;
                break;
            }
            SqlSegment::Code => {
                let kept = stmt[range.clone()].trim_end_matches(is_tail).len();
                if kept > 0 {
                    end = range.start + kept;
                    break;
                }
            }
        }
    }
    &stmt[..end]
}

/// Wrap a statement so the warehouse returns only its row count.
///
/// The statement sits on its own lines so nothing in it can reach the
/// closing parenthesis.
pub fn count_statement(stmt: &str) -> String {
    format!(
        "SELECT COUNT(*) FROM (\n{}\n) AS snowcache_count",
        strip_statement_terminator(stmt).trim_start()
    )
}
