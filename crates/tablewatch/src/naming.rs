//! Naming convention for provisioned database objects
//!
//! One token per subscription prefixes every object name, so several
//! subscriptions can watch the same table without colliding:
//!
//! | Role | Name |
//! |------|------|
//! | Message type | `{token}/Insert`, `{token}/Update`, `{token}/Delete` |
//! | Contract | `{token}` |
//! | Queue | `[schema].[{token}]` |
//! | Service | `{token}` |
//! | Trigger | `[schema].[tr_{token}_Sender]` |

use crate::error::Result;
use crate::event::ChangeType;
use crate::validation::{Validator, MAX_IDENTIFIER_LENGTH};
use std::fmt;
use uuid::Uuid;

/// Maximum length of the table-derived prefix
const MAX_PREFIX_LENGTH: usize = 60;

/// Longest decoration added around the token (`tr_` + `_Sender`)
const MAX_DECORATION_LENGTH: usize = 10;

/// Maximum token length that keeps every composed name within `sysname`
pub const MAX_TOKEN_LENGTH: usize = MAX_IDENTIFIER_LENGTH - MAX_DECORATION_LENGTH;

/// Role of a provisioned object within a subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectRole {
    /// Message type carrying one kind of change
    MessageType(ChangeType),
    /// Contract binding the message types
    Contract,
    /// Queue receiving the messages
    Queue,
    /// Service exposing the queue
    Service,
    /// Row-level trigger on the watched table
    Trigger,
}

/// Token shared by all objects of one subscription
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NamingConvention {
    token: String,
    adopted: bool,
}

impl NamingConvention {
    /// Generate a fresh token for a table.
    ///
    /// The prefix keeps names recognizable in the catalog; the UUID part makes
    /// concurrent subscriptions on the same table collision-free.
    pub fn generate(table: &str) -> Self {
        let mut prefix: String = table
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .take(MAX_PREFIX_LENGTH)
            .collect();

        if !prefix.starts_with(|c: char| c.is_ascii_alphabetic() || c == '_') {
            prefix.insert(0, '_');
        }

        Self {
            token: format!("{}_{}", prefix, Uuid::new_v4().simple()),
            adopted: false,
        }
    }

    /// Adopt a token produced by an earlier subscription.
    ///
    /// The provisioner skips creation for adopted conventions and only attaches
    /// the listener to the existing queue.
    pub fn adopt(token: impl Into<String>) -> Result<Self> {
        let token = token.into();
        Validator::validate_token(&token, MAX_TOKEN_LENGTH)?;
        Ok(Self {
            token,
            adopted: true,
        })
    }

    /// The raw token
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Whether the objects already existed when the subscription was built
    pub fn is_adopted(&self) -> bool {
        self.adopted
    }

    /// Unqualified object name for a role
    pub fn compose(&self, role: ObjectRole) -> String {
        match role {
            ObjectRole::MessageType(change) => format!("{}/{}", self.token, change),
            ObjectRole::Contract | ObjectRole::Queue | ObjectRole::Service => self.token.clone(),
            ObjectRole::Trigger => format!("tr_{}_Sender", self.token),
        }
    }

    /// Message type name for a change type
    pub fn message_type(&self, change: ChangeType) -> String {
        self.compose(ObjectRole::MessageType(change))
    }
}

impl fmt::Display for NamingConvention {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_generate_is_unique() {
        let tokens: HashSet<String> = (0..1000)
            .map(|_| NamingConvention::generate("Customers").token().to_string())
            .collect();
        assert_eq!(tokens.len(), 1000);
    }

    #[test]
    fn test_generate_sanitizes_prefix() {
        let naming = NamingConvention::generate("Order Details-2024");
        assert!(naming.token().starts_with("Order_Details_2024_"));
        assert!(Validator::validate_token(naming.token(), MAX_TOKEN_LENGTH).is_ok());

        let naming = NamingConvention::generate("2024sales");
        assert!(naming.token().starts_with("_2024sales_"));
    }

    #[test]
    fn test_generate_respects_length_limits() {
        let naming = NamingConvention::generate(&"x".repeat(200));
        assert!(naming.token().len() <= MAX_TOKEN_LENGTH);

        for role in [
            ObjectRole::MessageType(ChangeType::Update),
            ObjectRole::Contract,
            ObjectRole::Queue,
            ObjectRole::Service,
            ObjectRole::Trigger,
        ] {
            assert!(naming.compose(role).len() <= MAX_IDENTIFIER_LENGTH);
        }
    }

    #[test]
    fn test_compose() {
        let naming = NamingConvention::adopt("Customers_abc").unwrap();
        assert!(naming.is_adopted());
        assert_eq!(
            naming.compose(ObjectRole::MessageType(ChangeType::Insert)),
            "Customers_abc/Insert"
        );
        assert_eq!(naming.compose(ObjectRole::Queue), "Customers_abc");
        assert_eq!(
            naming.compose(ObjectRole::Trigger),
            "tr_Customers_abc_Sender"
        );
        assert_eq!(naming.to_string(), "Customers_abc");
    }

    #[test]
    fn test_adopt_rejects_bad_tokens() {
        assert!(NamingConvention::adopt("").is_err());
        assert!(NamingConvention::adopt("x]; DROP TABLE t").is_err());
        assert!(NamingConvention::adopt("a".repeat(MAX_TOKEN_LENGTH + 1)).is_err());
    }
}
