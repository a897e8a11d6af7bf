mod app;
mod cache;
mod commands;
mod config;
mod error;
mod event;
mod github;
mod model;
mod sync;

use clap::Parser;
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use crate::model::ProjectRef;

#[derive(Parser, Debug)]
#[command(name = "hubsync")]
#[command(about = "A local mirror of GitHub issue trackers, kept fresh by conditional polling")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/hubsync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Repository to open, as OWNER/REPO
  #[arg(short, long)]
  project: Option<String>,

  /// Do not read or write the local snapshot cache
  #[arg(long)]
  no_cache: bool,
}

/// Log to a daily rolling file; stdout belongs to the command loop.
fn init_logging() -> Result<WorkerGuard> {
  let log_dir = dirs::data_dir()
    .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
    .ok_or_else(|| eyre!("Could not determine data directory"))?
    .join("hubsync")
    .join("logs");

  let appender = tracing_appender::rolling::daily(log_dir, "hubsync.log");
  let (writer, guard) = tracing_appender::non_blocking(appender);

  let filter = EnvFilter::try_from_env("HUBSYNC_LOG").unwrap_or_else(|_| EnvFilter::new("info"));

  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(writer)
    .with_ansi(false)
    .init();

  Ok(guard)
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _guard = init_logging()?;

  // Load configuration
  let config = config::Config::load(args.config.as_deref())?;

  // Command line project wins over the configured default
  let initial = args
    .project
    .as_deref()
    .or(config.default_project.as_deref())
    .map(str::parse::<ProjectRef>)
    .transpose()?;

  // Initialize and run the app
  let mut app = app::App::new(config, !args.no_cache)?;
  app.run(initial).await?;

  Ok(())
}
