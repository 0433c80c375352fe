//! CLI entry point for refsync.

use anyhow::{Context, Result};
use clap::Parser;
use refsync_core::{Config, Updater};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

mod cli;

use cli::Args;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();

    // Determine log level based on verbose/quiet flags
    // Priority: RUST_LOG env var > quiet flag > verbose flag > default (info)
    let default_level = if args.quiet {
        "error"
    } else {
        match args.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    tracing_subscriber::fmt().with_env_filter(filter).init();

    debug!(?args, "CLI arguments parsed");

    let mut config = Config::load(&args.config_file)
        .with_context(|| format!("loading {}", args.config_file.display()))?;

    // CLI overrides take precedence over the configuration file.
    if let Some(directory) = args.database_directory {
        let lock_name = config
            .lock_file
            .file_name()
            .map(std::ffi::OsStr::to_os_string)
            .unwrap_or_else(|| std::ffi::OsString::from(".refsync.lock"));
        config.lock_file = directory.join(lock_name);
        config.database_directory = directory;
    }
    if let Some(parallelism) = args.parallelism {
        config.parallelism = usize::from(parallelism);
    }
    if !args.editions.is_empty() {
        config.edition_ids = args.editions;
    }
    config.output |= args.output;
    config.verbose = args.verbose > 0;

    config.validate().context("invalid configuration")?;

    info!(
        editions = config.edition_ids.len(),
        directory = %config.database_directory.display(),
        "refsync starting"
    );

    // A single Ctrl-C aborts in-flight and pending jobs; writes that already
    // renamed into place stay.
    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling update run");
            signal_cancel.cancel();
        }
    });

    let updater = Updater::new(config)?;
    updater.run(&cancel).await?;

    info!("update run complete");
    Ok(())
}
