//! Input validation and SQL text escaping
//!
//! Object names derived from the naming convention are interpolated into DDL
//! that cannot be parameterized (`CREATE QUEUE`, `SEND ... MESSAGE TYPE`), so
//! every identifier passes through here first.

use crate::error::{Result, TableWatchError};
use regex::Regex;
use std::sync::LazyLock;

/// SQL Server `sysname` limit
pub const MAX_IDENTIFIER_LENGTH: usize = 128;

/// Regex for naming-convention tokens
static TOKEN_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("valid token regex"));

/// Validator for identifiers and tokens
pub struct Validator;

impl Validator {
    /// Validate a schema, table or column name.
    ///
    /// Names are always bracket-quoted, so only emptiness, length and control
    /// characters are rejected.
    pub fn validate_identifier(name: &str) -> Result<()> {
        if name.trim().is_empty() {
            return Err(TableWatchError::config("Identifier cannot be empty"));
        }

        if name.chars().count() > MAX_IDENTIFIER_LENGTH {
            return Err(TableWatchError::config(format!(
                "Identifier too long: {} chars (max: {})",
                name.chars().count(),
                MAX_IDENTIFIER_LENGTH
            )));
        }

        if name.chars().any(|c| c.is_control()) {
            return Err(TableWatchError::config(format!(
                "Identifier '{}' contains control characters",
                name.escape_debug()
            )));
        }

        Ok(())
    }

    /// Validate a naming-convention token (generated or caller supplied).
    pub fn validate_token(token: &str, max_len: usize) -> Result<()> {
        if token.is_empty() {
            return Err(TableWatchError::config("Naming convention cannot be empty"));
        }

        if token.len() > max_len {
            return Err(TableWatchError::config(format!(
                "Naming convention too long: {} chars (max: {})",
                token.len(),
                max_len
            )));
        }

        if !TOKEN_REGEX.is_match(token) {
            return Err(TableWatchError::config(format!(
                "Invalid naming convention '{}': must start with letter/underscore and contain only alphanumeric characters and underscores",
                token
            )));
        }

        Ok(())
    }
}

/// Quote an identifier with brackets, escaping `]`.
pub fn quote_identifier(name: &str) -> String {
    format!("[{}]", name.replace(']', "]]"))
}

/// Quote a two-part name: `[schema].[object]`.
pub fn quote_qualified(schema: &str, name: &str) -> String {
    format!("{}.{}", quote_identifier(schema), quote_identifier(name))
}

/// Quote a Unicode string literal: `N'...'`.
pub fn quote_literal(value: &str) -> String {
    format!("N'{}'", value.replace('\'', "''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_identifiers() {
        assert!(Validator::validate_identifier("Customers").is_ok());
        assert!(Validator::validate_identifier("Order Details").is_ok());
        assert!(Validator::validate_identifier("weird]name").is_ok());
    }

    #[test]
    fn test_invalid_identifiers() {
        assert!(Validator::validate_identifier("").is_err());
        assert!(Validator::validate_identifier("   ").is_err());
        assert!(Validator::validate_identifier(&"a".repeat(129)).is_err());
        assert!(Validator::validate_identifier("bad\nname").is_err());
    }

    #[test]
    fn test_tokens() {
        assert!(Validator::validate_token("Customers_0a1b", 100).is_ok());
        assert!(Validator::validate_token("_x", 100).is_ok());
        assert!(Validator::validate_token("", 100).is_err());
        assert!(Validator::validate_token("1abc", 100).is_err());
        assert!(Validator::validate_token("a-b", 100).is_err());
        assert!(Validator::validate_token("a];DROP TABLE x;--", 100).is_err());
        assert!(Validator::validate_token(&"a".repeat(101), 100).is_err());
    }

    #[test]
    fn test_quoting() {
        assert_eq!(quote_identifier("Customers"), "[Customers]");
        assert_eq!(quote_identifier("a]b"), "[a]]b]");
        assert_eq!(quote_qualified("dbo", "T"), "[dbo].[T]");
        assert_eq!(quote_literal("O'Brien"), "N'O''Brien'");
    }
}
