//! Connection and subscription configuration
//!
//! # Security Note
//!
//! [`ConnectionString`] implements a custom `Debug` and `Display` that redact
//! the password so it never reaches logs.

use crate::decoder::Culture;
use crate::error::{Result, TableWatchError};
use crate::interest::DmlTriggerFilter;
use crate::listener::ListenerTimeouts;
use crate::provisioner::PayloadScope;
use crate::validation::Validator;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Default SQL Server port
pub const DEFAULT_PORT: u16 = 1433;

/// Default schema of the watched table
pub const DEFAULT_SCHEMA: &str = "dbo";

/// Connection attempts made for provisioning, listening and teardown
pub const DEFAULT_CONNECT_RETRIES: u32 = 3;

/// Parsed ADO.NET style connection string
///
/// ```rust
/// use tablewatch::ConnectionString;
///
/// let conn: ConnectionString = "Server=db,1433;Database=shop;User Id=app;Password=secret"
///     .parse()
///     .unwrap();
/// assert_eq!(conn.host, "db");
/// assert!(!conn.redacted().contains("secret"));
/// ```
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionString {
    pub host: String,
    pub port: u16,
    /// Named instance (`Server=host\INSTANCE`)
    pub instance: Option<String>,
    pub database: String,
    pub username: String,
    pub password: Option<String>,
    pub application_name: String,
    pub encrypt: bool,
    pub trust_server_certificate: bool,
    pub connect_timeout: Duration,
}

impl Default for ConnectionString {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: DEFAULT_PORT,
            instance: None,
            database: String::new(),
            username: String::new(),
            password: None,
            application_name: "tablewatch".to_string(),
            encrypt: true,
            trust_server_certificate: false,
            connect_timeout: Duration::from_secs(15),
        }
    }
}

impl ConnectionString {
    /// Parse `key=value;...` pairs
    pub fn parse(raw: &str) -> Result<Self> {
        let mut conn = Self::default();
        let mut server_seen = false;

        for (key, value) in split_pairs(raw)? {
            let key = key.as_str();
            let value = value.as_str();

            match key.to_ascii_lowercase().as_str() {
                "server" | "data source" | "address" | "addr" | "network address" => {
                    conn.parse_server(value)?;
                    server_seen = true;
                }
                "database" | "initial catalog" => conn.database = value.to_string(),
                "user id" | "uid" | "user" => conn.username = value.to_string(),
                "password" | "pwd" => conn.password = Some(value.to_string()),
                "application name" | "app" => conn.application_name = value.to_string(),
                "encrypt" => conn.encrypt = parse_bool(key, value)?,
                "trustservercertificate" | "trust server certificate" => {
                    conn.trust_server_certificate = parse_bool(key, value)?
                }
                "connect timeout" | "connection timeout" | "timeout" => {
                    let secs: u64 = value.parse().map_err(|_| {
                        TableWatchError::InvalidConnectionString(format!(
                            "invalid connect timeout '{}'",
                            value
                        ))
                    })?;
                    conn.connect_timeout = Duration::from_secs(secs);
                }
                "integrated security" | "trusted_connection" => {
                    if parse_bool(key, value)? {
                        return Err(TableWatchError::InvalidConnectionString(
                            "integrated security is not supported, use SQL Server authentication"
                                .to_string(),
                        ));
                    }
                }
                other => {
                    tracing::debug!("Ignoring connection string key '{}'", other);
                }
            }
        }

        if !server_seen {
            return Err(TableWatchError::InvalidConnectionString(
                "Server is required".to_string(),
            ));
        }
        conn.validate()?;
        Ok(conn)
    }

    fn parse_server(&mut self, value: &str) -> Result<()> {
        let value = value.strip_prefix("tcp:").unwrap_or(value);
        let (host_part, port) = match value.rsplit_once(',') {
            Some((host, port)) => {
                let port = port.trim().parse::<u16>().map_err(|_| {
                    TableWatchError::InvalidConnectionString(format!("invalid port '{}'", port))
                })?;
                (host.trim(), port)
            }
            None => (value, DEFAULT_PORT),
        };

        let (host, instance) = match host_part.split_once('\\') {
            Some((host, instance)) => (host, Some(instance.to_string())),
            None => (host_part, None),
        };

        self.host = match host {
            "." | "(local)" => "localhost".to_string(),
            h => h.to_string(),
        };
        self.port = port;
        self.instance = instance;
        Ok(())
    }

    /// Check required fields
    pub fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            return Err(TableWatchError::InvalidConnectionString(
                "Server is required".to_string(),
            ));
        }
        if self.database.is_empty() {
            return Err(TableWatchError::InvalidConnectionString(
                "Database is required".to_string(),
            ));
        }
        if self.username.is_empty() {
            return Err(TableWatchError::InvalidConnectionString(
                "User Id is required".to_string(),
            ));
        }
        if self.password.is_none() {
            return Err(TableWatchError::InvalidConnectionString(
                "Password is required for SQL Server authentication".to_string(),
            ));
        }
        Ok(())
    }

    /// `host,port/database` for logs
    pub fn target(&self) -> String {
        match &self.instance {
            Some(instance) => format!("{}\\{}/{}", self.host, instance, self.database),
            None => format!("{}:{}/{}", self.host, self.port, self.database),
        }
    }

    /// Connection string with the password masked
    pub fn redacted(&self) -> String {
        let mut parts = vec![
            match &self.instance {
                Some(instance) => format!("Server={}\\{}", self.host, instance),
                None => format!("Server={},{}", self.host, self.port),
            },
            format!("Database={}", self.database),
            format!("User Id={}", self.username),
        ];
        if self.password.is_some() {
            parts.push("Password=[REDACTED]".to_string());
        }
        parts.push(format!("Application Name={}", self.application_name));
        parts.push(format!("Encrypt={}", self.encrypt));
        if self.trust_server_certificate {
            parts.push("TrustServerCertificate=true".to_string());
        }
        parts.join(";")
    }
}

/// Split `key=value` pairs. A value wrapped in `'`, `"` or `{}` may hold
/// `;`; a doubled closing character inside it stands for itself.
fn split_pairs(raw: &str) -> Result<Vec<(String, String)>> {
    let mut pairs = Vec::new();
    let mut chars = raw.chars().peekable();

    loop {
        let mut key = String::new();
        while let Some(&c) = chars.peek() {
            if c == '=' || c == ';' {
                break;
            }
            key.push(c);
            chars.next();
        }
        let key = key.trim().to_string();

        match chars.next() {
            Some('=') => {}
            end => {
                if !key.is_empty() {
                    return Err(TableWatchError::InvalidConnectionString(format!(
                        "'{}' is not a key=value pair",
                        key
                    )));
                }
                if end.is_none() {
                    break;
                }
                continue;
            }
        }

        while chars.peek().is_some_and(|c| c.is_whitespace()) {
            chars.next();
        }

        let close = match chars.peek() {
            Some('\'') => Some('\''),
            Some('"') => Some('"'),
            Some('{') => Some('}'),
            _ => None,
        };

        let mut value = String::new();
        match close {
            Some(close) => {
                chars.next();
                let mut terminated = false;
                while let Some(c) = chars.next() {
                    if c != close {
                        value.push(c);
                    } else if chars.peek() == Some(&close) {
                        value.push(close);
                        chars.next();
                    } else {
                        terminated = true;
                        break;
                    }
                }
                if !terminated {
                    return Err(TableWatchError::InvalidConnectionString(format!(
                        "unterminated quoted value for '{}'",
                        key
                    )));
                }
                for c in chars.by_ref() {
                    if c == ';' {
                        break;
                    }
                    if !c.is_whitespace() {
                        return Err(TableWatchError::InvalidConnectionString(format!(
                            "unexpected '{}' after quoted value for '{}'",
                            c, key
                        )));
                    }
                }
            }
            None => {
                for c in chars.by_ref() {
                    if c == ';' {
                        break;
                    }
                    value.push(c);
                }
                value = value.trim().to_string();
            }
        }

        pairs.push((key, value));
    }

    Ok(pairs)
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "yes" | "1" | "sspi" | "mandatory" | "strict" => Ok(true),
        "false" | "no" | "0" | "optional" => Ok(false),
        _ => Err(TableWatchError::InvalidConnectionString(format!(
            "invalid boolean '{}' for '{}'",
            value,
            key.trim()
        ))),
    }
}

impl FromStr for ConnectionString {
    type Err = TableWatchError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Debug for ConnectionString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionString")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("instance", &self.instance)
            .field("database", &self.database)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .field("application_name", &self.application_name)
            .field("encrypt", &self.encrypt)
            .field("trust_server_certificate", &self.trust_server_certificate)
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}

impl fmt::Display for ConnectionString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.redacted())
    }
}

/// What happens to the database objects when the subscription stops
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TeardownPolicy {
    /// `stop()` and `dispose()` drop the objects
    #[default]
    OnStop,
    /// `stop()` keeps them, `dispose()` drops them
    OnDispose,
    /// Objects survive stop, dispose and inactivity for a later reattach
    Never,
}

impl TeardownPolicy {
    pub fn on_stop(&self) -> bool {
        matches!(self, Self::OnStop)
    }

    pub fn on_dispose(&self) -> bool {
        !matches!(self, Self::Never)
    }
}

/// Validated subscription settings
#[derive(Debug, Clone)]
pub struct SubscriptionOptions {
    pub schema: String,
    /// Watched table; the model's table name when unset
    pub table: Option<String>,
    pub update_of: Option<Vec<String>>,
    pub notify_on: DmlTriggerFilter,
    pub include_old_values: bool,
    pub payload_scope: PayloadScope,
    /// Token of existing objects to reattach to
    pub naming_convention: Option<String>,
    pub teardown: TeardownPolicy,
    pub culture: Option<Culture>,
    pub timeouts: ListenerTimeouts,
    pub connect_retries: u32,
}

impl Default for SubscriptionOptions {
    fn default() -> Self {
        Self {
            schema: DEFAULT_SCHEMA.to_string(),
            table: None,
            update_of: None,
            notify_on: DmlTriggerFilter::all(),
            include_old_values: false,
            payload_scope: PayloadScope::default(),
            naming_convention: None,
            teardown: TeardownPolicy::default(),
            culture: None,
            timeouts: ListenerTimeouts::default(),
            connect_retries: DEFAULT_CONNECT_RETRIES,
        }
    }
}

impl SubscriptionOptions {
    /// Create a new builder
    pub fn builder() -> SubscriptionOptionsBuilder {
        SubscriptionOptionsBuilder::default()
    }

    /// Checks that need no database
    pub fn validate(&self) -> Result<()> {
        Validator::validate_identifier(&self.schema)?;
        if let Some(table) = &self.table {
            Validator::validate_identifier(table)?;
        }
        self.timeouts.validate()?;
        if self.connect_retries == 0 {
            return Err(TableWatchError::config("connect retries must be at least 1"));
        }
        crate::interest::validate_update_of(self.update_of.as_deref(), self.notify_on)?;
        Ok(())
    }
}

/// Builder for [`SubscriptionOptions`]
#[derive(Debug, Default)]
pub struct SubscriptionOptionsBuilder {
    options: SubscriptionOptions,
}

impl SubscriptionOptionsBuilder {
    /// Schema of the table (default: dbo)
    pub fn schema(mut self, schema: impl Into<String>) -> Self {
        self.options.schema = schema.into();
        self
    }

    /// Table to watch
    pub fn table(mut self, table: impl Into<String>) -> Self {
        self.options.table = Some(table.into());
        self
    }

    /// Only notify updates that change one of these columns
    pub fn update_of<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.options.update_of = Some(columns.into_iter().map(Into::into).collect());
        self
    }

    /// DML operations that produce notifications
    pub fn notify_on(mut self, filter: DmlTriggerFilter) -> Self {
        self.options.notify_on = filter;
        self
    }

    /// Carry the previous row image on updates
    pub fn include_old_values(mut self, include: bool) -> Self {
        self.options.include_old_values = include;
        self
    }

    /// Columns carried by Update payloads
    pub fn payload_scope(mut self, scope: PayloadScope) -> Self {
        self.options.payload_scope = scope;
        self
    }

    /// Reattach to objects created under this token
    pub fn naming_convention(mut self, token: impl Into<String>) -> Self {
        self.options.naming_convention = Some(token.into());
        self
    }

    /// Teardown policy
    pub fn teardown_policy(mut self, policy: TeardownPolicy) -> Self {
        self.options.teardown = policy;
        self
    }

    /// Culture used to parse text columns
    pub fn culture(mut self, culture: Culture) -> Self {
        self.options.culture = Some(culture);
        self
    }

    /// Upper bound of one receive (default: 5s)
    pub fn receive_timeout(mut self, timeout: Duration) -> Self {
        self.options.timeouts.receive_timeout = timeout;
        self
    }

    /// Inactivity before the objects are dropped (default: 180s)
    pub fn idle_teardown(mut self, timeout: Duration) -> Self {
        self.options.timeouts.idle_teardown = timeout;
        self
    }

    /// Connection attempts (default: 3)
    pub fn connect_retries(mut self, retries: u32) -> Self {
        self.options.connect_retries = retries;
        self
    }

    /// Build the options
    pub fn build(self) -> Result<SubscriptionOptions> {
        self.options.validate()?;
        Ok(self.options)
    }
}
