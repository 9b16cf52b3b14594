//! tablewatch CLI - watch a SQL Server table from the command line
//!
//! Prints every change as one JSON line. The connection string comes from
//! `--connection` or `TABLEWATCH_CONNECTION_STRING`.

use anyhow::Context;
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::sync::Arc;
use std::time::Duration;
use tablewatch::sqlserver::SqlServerSessionFactory;
use tablewatch::{
    ConnectionString, Culture, DmlTriggerFilter, NamingConvention, ObjectProvisioner, RawRecord,
    SessionFactory, Subscription, SubscriptionBuilder,
};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "tablewatch")]
#[command(about = "Row-level change notifications for SQL Server tables")]
#[command(version)]
struct Cli {
    /// ADO.NET style connection string
    #[arg(long, env = "TABLEWATCH_CONNECTION_STRING", hide_env_values = true)]
    connection: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Watch a table and print changes until Ctrl-C
    Watch {
        #[command(flatten)]
        target: WatchArgs,

        /// Keep the objects on exit so a later run can reattach
        #[arg(long)]
        keep: bool,
    },

    /// Print the DDL a watch would execute
    Script {
        #[command(flatten)]
        target: WatchArgs,
    },

    /// List objects left behind by a subscription
    Check {
        /// Naming convention token of the subscription
        #[arg(long)]
        naming: String,

        /// Schema of the watched table
        #[arg(long, default_value = "dbo")]
        schema: String,
    },

    /// Drop objects left behind by a subscription
    Cleanup {
        /// Naming convention token of the subscription
        #[arg(long)]
        naming: String,

        /// Schema of the watched table
        #[arg(long, default_value = "dbo")]
        schema: String,
    },
}

#[derive(Args)]
struct WatchArgs {
    /// Table to watch
    #[arg(short, long)]
    table: String,

    /// Schema of the table
    #[arg(long, default_value = "dbo")]
    schema: String,

    /// Only notify updates changing one of these columns
    #[arg(long, value_delimiter = ',')]
    update_of: Option<Vec<String>>,

    /// Operations to notify
    #[arg(long, value_enum, value_delimiter = ',', default_value = "insert,update,delete")]
    notify: Vec<Operation>,

    /// Include previous values on updates
    #[arg(long)]
    old_values: bool,

    /// Reattach to objects created under this token
    #[arg(long)]
    naming: Option<String>,

    /// Culture for text columns (e.g. en-US, de-DE)
    #[arg(long)]
    culture: Option<String>,

    /// Seconds one receive waits
    #[arg(long, default_value = "5")]
    receive_timeout: u64,

    /// Seconds of inactivity before the objects are dropped
    #[arg(long, default_value = "180")]
    idle_teardown: u64,
}

#[derive(Clone, Copy, ValueEnum)]
enum Operation {
    Insert,
    Update,
    Delete,
}

impl WatchArgs {
    fn filter(&self) -> DmlTriggerFilter {
        self.notify
            .iter()
            .fold(DmlTriggerFilter::empty(), |acc, op| {
                acc | match op {
                    Operation::Insert => DmlTriggerFilter::INSERT,
                    Operation::Update => DmlTriggerFilter::UPDATE,
                    Operation::Delete => DmlTriggerFilter::DELETE,
                }
            })
    }

    fn apply(&self, mut builder: SubscriptionBuilder<RawRecord>) -> anyhow::Result<SubscriptionBuilder<RawRecord>> {
        builder = builder
            .table(&self.table)
            .schema(&self.schema)
            .notify_on(self.filter())
            .include_old_values(self.old_values)
            .receive_timeout(Duration::from_secs(self.receive_timeout))
            .idle_teardown(Duration::from_secs(self.idle_teardown));

        if let Some(columns) = &self.update_of {
            builder = builder.update_of(columns.iter().cloned());
        }
        if let Some(token) = &self.naming {
            builder = builder.naming_convention(token);
        }
        if let Some(name) = &self.culture {
            builder = builder.culture(Culture::named(name)?);
        }
        Ok(builder)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Watch { target, keep } => watch(&cli.connection, target, keep).await?,

        Commands::Script { target } => {
            let builder = target.apply(Subscription::<RawRecord>::builder(&cli.connection))?;
            let subscription = builder.build().await.context("validating subscription")?;
            for statement in subscription.provisioning_script() {
                println!("-- {}", statement.object);
                println!("{}", statement.sql.trim_end());
                println!("GO");
            }
        }

        Commands::Check { naming, schema } => {
            let naming = NamingConvention::adopt(naming)?;
            let mut session = connect(&cli.connection).await?;
            let remaining =
                ObjectProvisioner::remaining_objects(session.as_mut(), &naming, &schema).await?;
            if remaining.is_empty() {
                println!("✓ No objects left for '{}'", naming);
            } else {
                println!("Objects left for '{}':", naming);
                for object in remaining {
                    println!("  • {}", object);
                }
            }
        }

        Commands::Cleanup { naming, schema } => {
            let naming = NamingConvention::adopt(naming)?;
            let mut session = connect(&cli.connection).await?;
            let report = ObjectProvisioner::teardown(session.as_mut(), &naming, &schema).await;
            if report.is_clean() {
                println!("✓ Dropped objects of '{}'", naming);
            } else {
                for (object, error) in &report.failures {
                    println!("✗ {}: {}", object, error);
                }
                anyhow::bail!("{} object(s) could not be dropped", report.failures.len());
            }
        }
    }

    Ok(())
}

async fn connect(raw: &str) -> anyhow::Result<Box<dyn tablewatch::SqlSession>> {
    let conn = ConnectionString::parse(raw)?;
    info!("Connecting to {}", conn.target());
    let factory: Arc<dyn SessionFactory> = Arc::new(SqlServerSessionFactory::new(conn));
    Ok(factory.connect().await?)
}

async fn watch(connection: &str, target: WatchArgs, keep: bool) -> anyhow::Result<()> {
    let mut builder = target
        .apply(Subscription::<RawRecord>::builder(connection))?
        .on_changed(|event| {
            let line = serde_json::json!({
                "change": event.change_type,
                "row": event.raw_values,
                "old": event.old_entity,
            });
            println!("{}", line);
        })
        .on_error(|e| warn!("{}", e))
        .on_status_changed(|status| info!("Status: {}", status));
    if keep {
        builder = builder.keep_for_reattach();
    }

    let mut subscription = builder.build().await.context("validating subscription")?;
    let token = subscription.naming_convention().token().to_string();
    subscription.start().await.context("starting subscription")?;
    info!(
        "Watching {} as '{}' (Ctrl-C to stop)",
        subscription.table().qualified_name(),
        token
    );

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    let metrics = subscription.metrics();
    subscription.dispose().await?;
    info!("{}", serde_json::to_string(&metrics)?);
    if keep {
        println!("Objects kept; reattach with --naming {}", token);
    }
    Ok(())
}
