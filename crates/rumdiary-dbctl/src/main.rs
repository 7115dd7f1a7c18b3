//! Operator CLI for the RumDiary datastore.
//!
//! ```text
//! rumdiary-dbctl [--config <path>] migrate   # connect and apply migrations
//! rumdiary-dbctl [--config <path>] clear     # remove every record of every model
//! rumdiary-dbctl [--config <path>] count     # print `<model> <count>` per model
//! ```
//!
//! Configuration comes from the optional file plus `RUMDIARY_DATABASE__*`
//! and `DATABASE_URL`. Ctrl-C cancels the running command.

mod error;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use futures::StreamExt;
use rumdiary_db::{DatabaseConfig, Datastore, Model, SearchCriteria};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::error::CtlError;

#[derive(Parser, Debug)]
#[command(
    name = "rumdiary-dbctl",
    author,
    version,
    about = "Operator tool for the RumDiary datastore"
)]
struct Cli {
    /// Configuration file (TOML or YAML)
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    /// Connect and apply pending migrations
    Migrate,
    /// Remove every record of every model
    Clear,
    /// Print `<model> <count>` for each model
    Count,
}

#[tokio::main]
async fn main() -> Result<(), CtlError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .init();

    let cli = Cli::parse();
    let config = DatabaseConfig::load(cli.config.as_deref())?.with_run_migrations(true);
    info!(
        command = ?cli.command,
        max_connections = config.max_connections,
        "rumdiary-dbctl starting"
    );

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, cancelling");
            on_interrupt.cancel();
        }
    });

    let datastore = Datastore::init(&config, None);
    let outcome = run(&datastore, cli.command, &cancel).await;
    datastore.close().await;
    outcome
}

async fn run(datastore: &Datastore, command: Command, cancel: &CancellationToken) -> Result<(), CtlError> {
    match command {
        Command::Migrate => {
            datastore.connection().connect(cancel).await?;
            info!("Migrations applied");
        }
        Command::Clear => datastore.clear(cancel).await?,
        Command::Count => {
            for model in datastore.models().all() {
                let count = count_records(model, cancel).await?;
                println!("{} {count}", model.name());
            }
        }
    }
    Ok(())
}

async fn count_records(model: &Model, cancel: &CancellationToken) -> Result<u64, CtlError> {
    let mut cursor = model.get_stream(SearchCriteria::all(), cancel).await?;
    let mut count: u64 = 0;
    while let Some(record) = cursor.next().await {
        record?;
        count = count.saturating_add(1);
    }
    Ok(count)
}
