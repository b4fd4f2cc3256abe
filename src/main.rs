mod commands;

use clap::Parser;
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use ims::api::{CachedImsClient, ImsClient};
use ims::cache::QueryClient;
use ims::config::Config;
use ims::db::SqliteTokenStore;
use ims::session::SessionContext;

#[derive(Parser, Debug)]
#[command(name = "ims")]
#[command(about = "Command-line console for the IMS inventory API")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/ims/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// API base URL, e.g. http://localhost:8000/api/v1
  #[arg(long)]
  api_url: Option<String>,

  #[command(subcommand)]
  command: commands::Command,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let mut config = Config::load(args.config.as_deref())?;
  if let Some(url) = args.api_url {
    config.api.base_url = url;
  }

  // Keep the guard alive so buffered log lines are flushed on exit
  let _log_guard = init_logging(config.log_file.as_deref())?;

  let session = SessionContext::new(SqliteTokenStore::open()?)?;
  let client = ImsClient::connect(&config.api, session)?;
  let queries = QueryClient::new(config.query.max_entries).with_defaults(config.query.options());
  let api = CachedImsClient::new(client, queries);

  commands::run(&api, args.command, &config).await
}

/// Log to `target` (a file path, or `stderr`), filtered by IMS_LOG.
fn init_logging(target: Option<&str>) -> Result<Option<WorkerGuard>> {
  let filter = EnvFilter::try_from_env("IMS_LOG").unwrap_or_else(|_| EnvFilter::new("info"));

  if target == Some("stderr") {
    tracing_subscriber::fmt()
      .with_env_filter(filter)
      .with_writer(std::io::stderr)
      .try_init()
      .map_err(|e| eyre!("Failed to initialize logging: {}", e))?;
    return Ok(None);
  }

  let path = match target {
    Some(p) => PathBuf::from(p),
    None => dirs::data_dir()
      .ok_or_else(|| eyre!("Could not determine data directory"))?
      .join("ims")
      .join("ims.log"),
  };
  let dir = path
    .parent()
    .filter(|p| !p.as_os_str().is_empty())
    .map(PathBuf::from)
    .unwrap_or_else(|| PathBuf::from("."));
  let file_name = path
    .file_name()
    .ok_or_else(|| eyre!("Invalid log file path: {}", path.display()))?;
  std::fs::create_dir_all(&dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", dir.display(), e))?;

  let appender = tracing_appender::rolling::never(&dir, file_name);
  let (writer, guard) = tracing_appender::non_blocking(appender);
  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(writer)
    .with_ansi(false)
    .try_init()
    .map_err(|e| eyre!("Failed to initialize logging: {}", e))?;

  Ok(Some(guard))
}
