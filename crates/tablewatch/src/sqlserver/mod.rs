//! SQL Server backend
//!
//! Implements [`SqlSession`](crate::session::SqlSession) over TDS with Tiberius.
//!
//! # Requirements
//!
//! - Service Broker enabled on the database:
//!   `ALTER DATABASE [db] SET ENABLE_BROKER WITH ROLLBACK IMMEDIATE`
//! - A login with `CREATE MESSAGE TYPE`, `CREATE CONTRACT`, `CREATE QUEUE`,
//!   `CREATE SERVICE` and `ALTER` on the table's schema
//!
//! # Example
//!
//! ```rust,ignore
//! use tablewatch::sqlserver::SqlServerSessionFactory;
//! use tablewatch::{ConnectionString, SessionFactory};
//!
//! let conn: ConnectionString = "Server=localhost,1433;Database=shop;User Id=sa;Password=secret"
//!     .parse()?;
//! let factory = SqlServerSessionFactory::new(conn);
//! let mut session = factory.connect().await?;
//! session.verify_service_broker().await?;
//! ```

mod error;
mod session;

pub use error::SqlServerError;
pub use session::{SqlServerSession, SqlServerSessionFactory};
