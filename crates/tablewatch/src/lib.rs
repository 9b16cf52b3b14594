//! # tablewatch - Row-level change notifications for SQL Server
//!
//! Watches one table and delivers every committed INSERT, UPDATE and DELETE
//! as a typed [`ChangeEvent`], using nothing but a trigger and Service Broker.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  trigger   ┌─────────────┐  WAITFOR(RECEIVE)  ┌────────────┐
//! │ watched table├───────────▶│ broker queue├───────────────────▶│  listener  │
//! └──────────────┘  JSON rows └─────────────┘                    └─────┬──────┘
//!                                                                      │ decode
//!                                                                      ▼
//!                                                          on_changed(ChangeEvent<T>)
//! ```
//!
//! A [`Subscription`] validates the connection, the broker, the permissions,
//! the table and the model mapping up front. `start()` then creates message
//! types, contract, queue, service and trigger under one
//! [`NamingConvention`] token and spawns the listener; `stop()` and
//! `dispose()` drop them again.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use serde::Deserialize;
//! use tablewatch::{FieldKind, ModelField, Subscription, TableModel};
//!
//! #[derive(Debug, Default, Deserialize)]
//! #[serde(default)]
//! struct Customer {
//!     id: i32,
//!     name: String,
//! }
//!
//! impl TableModel for Customer {
//!     fn fields() -> Vec<ModelField> {
//!         vec![
//!             ModelField::new("id", FieldKind::I32),
//!             ModelField::new("name", FieldKind::String),
//!         ]
//!     }
//! }
//!
//! # async fn example() -> tablewatch::Result<()> {
//! let mut subscription = Subscription::<Customer>::builder(
//!     "Server=localhost,1433;Database=shop;User Id=app;Password=secret",
//! )
//! .table("Customers")
//! .on_changed(|event| println!("{}: {:?}", event.change_type, event.entity))
//! .build()
//! .await?;
//!
//! subscription.start().await?;
//! subscription.dispose().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod decoder;
pub mod error;
pub mod event;
pub mod interest;
pub mod listener;
pub mod mapper;
pub mod model;
pub mod naming;
pub mod provisioner;
pub mod schema;
pub mod session;
pub mod sqlserver;
pub mod status;
pub mod subscription;
pub mod validation;

pub use config::{ConnectionString, SubscriptionOptions, TeardownPolicy};
pub use decoder::{Culture, RecordDecoder};
pub use error::{ErrorCategory, Result, TableWatchError};
pub use event::{ChangeEvent, ChangeType};
pub use interest::{DmlTriggerFilter, InterestSet};
pub use listener::{ListenerMetricsSnapshot, ListenerTimeouts};
pub use mapper::{ColumnMapping, ModelToTableMapper};
pub use model::{FieldKind, ModelField, RawRecord, TableModel};
pub use naming::NamingConvention;
pub use provisioner::{ObjectKind, ObjectProvisioner, PayloadScope, ProvisionedObject, TeardownReport};
pub use schema::{ColumnDescriptor, TableDescriptor};
pub use session::{SessionFactory, SqlSession};
pub use status::SubscriptionStatus;
pub use subscription::{Subscription, SubscriptionBuilder};
