//! `statekeeper` - host for the persistence core.
//!
//! Opens the storage engine from configuration, runs the one-time legacy
//! import, and keeps the domain stores saved while the process runs.
//!
//! ```text
//! statekeeper [--data-dir DIR] [--no-database] [--log-dir DIR] [run]
//! statekeeper migrate [--force]
//! statekeeper status
//! ```

mod autosave;
mod bootstrap;
mod status;
mod stores;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use store::{LegacyImporter, StorageConfig};
use tokio::sync::Mutex;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

use stores::Stores;

#[derive(Parser)]
#[command(name = "statekeeper", about = "Persistence host for per-player game state")]
struct Cli {
    /// Data directory. Overrides STATEKEEPER_DATA_DIR.
    #[arg(long, global = true, value_name = "DIR")]
    data_dir: Option<PathBuf>,

    /// Keep everything in flat files and never open the database.
    #[arg(long, global = true)]
    no_database: bool,

    /// Also write logs to a daily rolling file in this directory.
    #[arg(long, global = true, value_name = "DIR")]
    log_dir: Option<PathBuf>,

    /// Defaults to `run`.
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Import the legacy flat files into the database.
    Migrate {
        /// Clear the completion mark first, so an import that already ran
        /// runs again. Rows already present are kept.
        #[arg(short, long)]
        force: bool,
    },
    /// Show schema, import and backend status.
    Status,
    /// Load every store and autosave until interrupted.
    Run,
}

impl Cli {
    fn storage_config(&self) -> StorageConfig {
        let mut config = StorageConfig::from_env();
        if let Some(dir) = &self.data_dir {
            config.data_dir = dir.clone();
        }
        if self.no_database {
            config.database_enabled = false;
        }
        config
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _log_guard = init_tracing(cli.log_dir.as_deref())?;
    let config = cli.storage_config();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Migrate { force } => migrate(config, force),
        Commands::Status => {
            let storage = bootstrap::open_existing(config);
            print!("{}", status::gather(&storage));
            storage.close();
            Ok(())
        }
        Commands::Run => run(config).await,
    }
}

fn init_tracing(log_dir: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create log directory {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, "statekeeper");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(true)
                .with_line_number(true);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    Ok(guard)
}

fn migrate(config: StorageConfig, force: bool) -> Result<()> {
    if !config.database_enabled {
        bail!("the database backend is disabled, nothing to migrate into");
    }
    let storage = bootstrap::open(config);
    if !storage.engine().is_open() {
        bail!(
            "could not open the database at {}",
            storage.engine().database_path().display()
        );
    }

    let importer = LegacyImporter::from_handle(&storage.handle);
    if force && importer.reset_status() {
        tracing::info!("Cleared legacy import mark");
    }
    let report = importer.run().context("legacy import failed")?;
    print!("{report}");
    storage.close();
    Ok(())
}

async fn run(config: StorageConfig) -> Result<()> {
    let autosave_every = config.autosave_interval;
    let storage = tokio::task::spawn_blocking(move || {
        let storage = bootstrap::open(config);
        bootstrap::import_legacy(&storage);
        storage
    })
    .await
    .context("storage startup panicked")?;

    let stores = Arc::new(Stores::new(storage.handle.clone()));
    let snapshot = {
        let stores = Arc::clone(&stores);
        tokio::task::spawn_blocking(move || stores.load())
            .await
            .context("initial load panicked")?
    };
    let state = Arc::new(Mutex::new(snapshot));

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C, shutting down");
        }
    };
    let passes = autosave::run_until(stores, state, autosave_every, shutdown).await?;

    storage.close();
    tracing::info!(passes, "Stopped");
    Ok(())
}
