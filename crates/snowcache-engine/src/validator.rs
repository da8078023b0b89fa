//! Statement validation
//!
//! The engine runs every statement past a [`StatementValidator`] before any
//! session exists. [`SelectOnlyValidator`] is the bundled implementation: one
//! read-only `SELECT` or `WITH` statement, nothing else.

use snowcache_upstream::security::mask_literals_and_comments;

/// Validator contract: `Ok(())` or a human-readable rejection reason
pub trait StatementValidator: Send + Sync {
    /// Check `stmt`
    fn validate(&self, stmt: &str) -> Result<(), String>;
}

/// Keywords that modify data or schema
const FORBIDDEN: &[&str] = &[
    "INSERT", "UPDATE", "DELETE", "MERGE", "CREATE", "ALTER", "DROP", "TRUNCATE", "GRANT",
    "REVOKE", "COPY", "CALL", "ATTACH", "DETACH", "PRAGMA", "VACUUM",
];

/// Accepts a single read-only `SELECT`/`WITH` statement
#[derive(Debug, Default, Clone, Copy)]
pub struct SelectOnlyValidator;

impl StatementValidator for SelectOnlyValidator {
    fn validate(&self, stmt: &str) -> Result<(), String> {
        let code = mask_literals_and_comments(stmt).map_err(|e| e.to_string())?;
        let body = code.trim_end_matches(|c: char| c.is_whitespace() || c == ';');

        if body.trim().is_empty() {
            return Err("statement is empty".to_string());
        }
        if body.contains(';') {
            return Err("only one statement may be executed at a time".to_string());
        }

        let words: Vec<String> = body
            .split(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
            .filter(|w| !w.is_empty())
            .map(|w| w.to_ascii_uppercase())
            .collect();

        match words.first().map(String::as_str) {
            Some("SELECT") | Some("WITH") => {}
            Some(other) => {
                return Err(format!("only SELECT statements are allowed, found {}", other))
            }
            None => return Err("statement is empty".to_string()),
        }

        if let Some(word) = words.iter().find(|w| FORBIDDEN.contains(&w.as_str())) {
            return Err(format!("{} is not allowed in a query", word));
        }
        Ok(())
    }
}
