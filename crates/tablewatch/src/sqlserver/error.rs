//! SQL Server error types

use crate::error::TableWatchError;
use thiserror::Error;

/// Login failed for user
const LOGIN_FAILED: u32 = 18456;

/// Cannot open database requested by the login
const CANNOT_OPEN_DATABASE: u32 = 4060;

/// SQL Server-specific errors
#[derive(Error, Debug)]
pub enum SqlServerError {
    /// TDS protocol error
    #[error("TDS protocol error: {0}")]
    Tds(String),

    /// Authentication failure
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Network failure or connection loss
    #[error("Connection error: {0}")]
    Connection(String),

    /// Connect did not complete in time
    #[error("Connection to {0} timed out")]
    ConnectTimeout(String),

    /// The server rejected a statement
    #[error("Query failed (error {code}): {message}")]
    QueryFailed { code: u32, message: String },

    /// A result column had an unexpected type
    #[error("Unexpected result: {0}")]
    UnexpectedResult(String),
}

impl From<tiberius::error::Error> for SqlServerError {
    fn from(err: tiberius::error::Error) -> Self {
        use tiberius::error::Error;

        match err {
            Error::Server(token) => match token.code() {
                LOGIN_FAILED | CANNOT_OPEN_DATABASE => {
                    SqlServerError::Authentication(token.message().to_string())
                }
                code => SqlServerError::QueryFailed {
                    code,
                    message: token.message().to_string(),
                },
            },
            Error::Io { message, .. } => SqlServerError::Connection(message),
            Error::Tls(message) => SqlServerError::Connection(message),
            Error::Routing { host, port } => {
                SqlServerError::Connection(format!("server requested routing to {}:{}", host, port))
            }
            Error::Protocol(message) => SqlServerError::Tds(message.to_string()),
            Error::Conversion(message) => SqlServerError::UnexpectedResult(message.to_string()),
            other => SqlServerError::Tds(other.to_string()),
        }
    }
}

impl From<SqlServerError> for TableWatchError {
    fn from(err: SqlServerError) -> Self {
        match err {
            SqlServerError::Authentication(msg) => TableWatchError::InvalidConnectionString(msg),
            SqlServerError::Connection(msg) | SqlServerError::Tds(msg) => {
                TableWatchError::Connection(msg)
            }
            SqlServerError::ConnectTimeout(target) => {
                TableWatchError::Connection(format!("connection to {} timed out", target))
            }
            SqlServerError::QueryFailed { .. } | SqlServerError::UnexpectedResult(_) => {
                TableWatchError::Query(err.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = SqlServerError::QueryFailed {
            code: 208,
            message: "Invalid object name 'dbo.q'".to_string(),
        };
        assert!(err.to_string().contains("208"));
        assert!(err.to_string().contains("Invalid object name"));
    }

    #[test]
    fn test_conversion_to_crate_error() {
        let err: TableWatchError = SqlServerError::Connection("reset".to_string()).into();
        assert!(matches!(err, TableWatchError::Connection(_)));
        assert!(err.is_fatal());

        let err: TableWatchError = SqlServerError::Authentication("Login failed".to_string()).into();
        assert!(matches!(err, TableWatchError::InvalidConnectionString(_)));

        let err: TableWatchError = SqlServerError::QueryFailed {
            code: 1205,
            message: "deadlock victim".to_string(),
        }
        .into();
        assert!(matches!(err, TableWatchError::Query(_)));
        assert!(!err.is_fatal());
        assert!(err.is_retriable());
    }
}
