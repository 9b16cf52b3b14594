//! Error types for subscriptions
//!
//! Validation errors are returned synchronously from `build()` / `start()`.
//! Runtime errors raised by the listener are delivered through the error
//! callback and classified as fatal or recoverable.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error categories for metrics and alerting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Subscription setup was rejected before anything was provisioned
    Validation,
    /// Database-side failures (queries, DDL)
    Database,
    /// Network / connection failures
    Network,
    /// Payload decoding failures
    Decode,
    /// Configuration errors
    Configuration,
    /// Other/unknown errors
    Other,
}

/// Errors raised by a table subscription
#[derive(Error, Debug)]
pub enum TableWatchError {
    /// The connection could not be opened or authenticated
    #[error("Invalid connection string: {0}")]
    InvalidConnectionString(String),

    /// Target table or schema does not exist
    #[error("Table '{schema}.{table}' does not exist")]
    NotExistingTable { schema: String, table: String },

    /// A field-to-column mapping is blank, duplicated or points nowhere
    #[error("Model to table mapping error: {0}")]
    ModelToTableMapper(String),

    /// No model field resolves to a table column
    #[error("No match between model '{model}' and columns of table '{table}'")]
    NoMatchBetweenModelAndTableColumns { model: String, table: String },

    /// Malformed or invalid update-of list
    #[error("Update-of list error: {0}")]
    UpdateOf(String),

    /// Update-of list supplied while update notifications are disabled
    #[error("DML trigger type error: {0}")]
    DmlTriggerType(String),

    /// Service Broker is disabled on the database
    #[error("Service Broker not enabled on database '{0}'. Run: ALTER DATABASE [{0}] SET ENABLE_BROKER")]
    ServiceBrokerNotEnabled(String),

    /// The login lacks permissions required to provision objects
    #[error("User lacks required permissions: {}", .0.join(", "))]
    UserWithNoPermission(Vec<String>),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Connection lost or refused at runtime
    #[error("Connection error: {0}")]
    Connection(String),

    /// Query or DDL failed
    #[error("Query failed: {0}")]
    Query(String),

    /// A change message could not be decoded into the model
    #[error("Decode error: {0}")]
    Decode(String),

    /// A change callback panicked
    #[error("Dispatch error: {0}")]
    Dispatch(String),

    /// Operation not valid in the current state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TableWatchError {
    /// Create a mapper error
    pub fn mapper(msg: impl Into<String>) -> Self {
        Self::ModelToTableMapper(msg.into())
    }

    /// Create an update-of error
    pub fn update_of(msg: impl Into<String>) -> Self {
        Self::UpdateOf(msg.into())
    }

    /// Create a config error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a connection error
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    /// Create a query error
    pub fn query(msg: impl Into<String>) -> Self {
        Self::Query(msg.into())
    }

    /// Create a decode error
    pub fn decode(msg: impl Into<String>) -> Self {
        Self::Decode(msg.into())
    }

    /// Create an invalid state error
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    /// Whether the error ends the receive loop.
    ///
    /// Only connection loss is fatal; decode and dispatch failures affect a
    /// single message.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Connection(_) => true,
            Self::Io(e) => {
                use std::io::ErrorKind;
                matches!(
                    e.kind(),
                    ErrorKind::ConnectionReset
                        | ErrorKind::ConnectionAborted
                        | ErrorKind::BrokenPipe
                        | ErrorKind::UnexpectedEof
                        | ErrorKind::NotConnected
                )
            }
            _ => false,
        }
    }

    /// Check if this error is retriable.
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::Connection(_) => true,
            Self::Query(msg) => {
                let msg = msg.to_lowercase();
                msg.contains("deadlock") || msg.contains("timeout")
            }
            Self::Io(_) => true,
            _ => false,
        }
    }

    /// Whether this error was raised by subscription validation.
    pub fn is_validation(&self) -> bool {
        self.category() == ErrorCategory::Validation
    }

    /// Get the error category for metrics and alerting.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::InvalidConnectionString(_)
            | Self::NotExistingTable { .. }
            | Self::ModelToTableMapper(_)
            | Self::NoMatchBetweenModelAndTableColumns { .. }
            | Self::UpdateOf(_)
            | Self::DmlTriggerType(_)
            | Self::ServiceBrokerNotEnabled(_)
            | Self::UserWithNoPermission(_) => ErrorCategory::Validation,
            Self::Config(_) => ErrorCategory::Configuration,
            Self::Connection(_) | Self::Io(_) => ErrorCategory::Network,
            Self::Query(_) => ErrorCategory::Database,
            Self::Decode(_) | Self::Json(_) => ErrorCategory::Decode,
            Self::Dispatch(_) | Self::InvalidState(_) => ErrorCategory::Other,
        }
    }

    /// Get a metric-safe error code.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidConnectionString(_) => "invalid_connection_string",
            Self::NotExistingTable { .. } => "not_existing_table",
            Self::ModelToTableMapper(_) => "model_to_table_mapper",
            Self::NoMatchBetweenModelAndTableColumns { .. } => "no_matching_columns",
            Self::UpdateOf(_) => "update_of",
            Self::DmlTriggerType(_) => "dml_trigger_type",
            Self::ServiceBrokerNotEnabled(_) => "service_broker_not_enabled",
            Self::UserWithNoPermission(_) => "missing_permission",
            Self::Config(_) => "config_error",
            Self::Connection(_) => "connection_error",
            Self::Query(_) => "query_error",
            Self::Decode(_) => "decode_error",
            Self::Dispatch(_) => "dispatch_error",
            Self::InvalidState(_) => "invalid_state",
            Self::Json(_) => "json_error",
            Self::Io(_) => "io_error",
        }
    }
}

/// Result type for subscription operations
pub type Result<T> = std::result::Result<T, TableWatchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TableWatchError::NotExistingTable {
            schema: "dbo".to_string(),
            table: "Customers".to_string(),
        };
        assert!(err.to_string().contains("dbo.Customers"));

        let err = TableWatchError::UserWithNoPermission(vec![
            "CREATE QUEUE".to_string(),
            "CREATE SERVICE".to_string(),
        ]);
        assert!(err.to_string().contains("CREATE QUEUE, CREATE SERVICE"));
    }

    #[test]
    fn test_fatal_classification() {
        assert!(TableWatchError::connection("reset by peer").is_fatal());
        assert!(TableWatchError::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset"
        ))
        .is_fatal());

        assert!(!TableWatchError::decode("bad int").is_fatal());
        assert!(!TableWatchError::query("Invalid object name").is_fatal());
        assert!(!TableWatchError::Dispatch("panic".into()).is_fatal());
    }

    #[test]
    fn test_error_category() {
        assert!(TableWatchError::update_of("empty").is_validation());
        assert!(TableWatchError::DmlTriggerType("x".into()).is_validation());
        assert!(TableWatchError::InvalidConnectionString("x".into()).is_validation());
        assert_eq!(
            TableWatchError::decode("x").category(),
            ErrorCategory::Decode
        );
        assert_eq!(
            TableWatchError::connection("x").category(),
            ErrorCategory::Network
        );
    }

    #[test]
    fn test_error_code() {
        assert_eq!(TableWatchError::update_of("x").error_code(), "update_of");
        assert_eq!(
            TableWatchError::mapper("x").error_code(),
            "model_to_table_mapper"
        );
        assert!(TableWatchError::query("deadlock victim").is_retriable());
        assert!(!TableWatchError::config("x").is_retriable());
    }
}
