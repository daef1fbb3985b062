use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use offline_cache::cache::{CacheSource, SweepReport};
use offline_cache::config::Config;
use offline_cache::lifecycle::ControlMessage;
use offline_cache::queue::QueueItemType;
use offline_cache::{logging, HttpCacheSystem, SYNC_TAG};
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "offline-cache")]
#[command(about = "Offline-capable HTTP response cache with a deferred-write queue")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/offline-cache/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Answer a request through the cache
  Fetch {
    /// Absolute URL or path relative to the origin
    url: String,
    #[arg(short = 'X', long, default_value = "GET")]
    method: String,
    /// Print the response body
    #[arg(short, long)]
    body: bool,
  },
  /// Pre-fetch the static manifest into the current generation
  Install,
  /// Install if needed, then activate even without skip_waiting
  Activate,
  /// Delete expired entries and enforce region byte budgets
  Sweep,
  /// Queue a write for later replay
  Enqueue {
    /// diary_create, diary_update, diary_delete or settings_update
    item_type: String,
    /// JSON payload
    data: String,
  },
  /// Replay queued writes against the backend
  Drain,
  /// List queued writes
  Queue,
  /// Print the cache generation
  Version,
  /// Send a control message, e.g. '{"type":"SKIP_WAITING"}'
  Message { json: String },
  /// Serve: install, then sweep and drain periodically until Ctrl-C
  Run,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;
  let _log_guard = logging::init(&config.log)?;

  let system = HttpCacheSystem::from_config(&config)?;

  match args.command {
    Command::Fetch { url, method, body } => {
      system.start().await;
      let request = system.request(&method, &url)?;
      let Some(result) = system.handle(&request).await else {
        println!("{} {} is not intercepted", request.method, request.url);
        return Ok(());
      };

      let cached_at = result
        .cached_at
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| "-".to_string());
      println!(
        "{} {} ({} bytes, {}, cached at {})",
        result.data.status,
        request.url,
        result.data.size_bytes(),
        source_label(result.source),
        cached_at
      );
      if body {
        println!("{}", String::from_utf8_lossy(&result.data.body));
      }
    }
    Command::Install => {
      let stored = system.install().await?;
      println!("Cached {} static assets ({:?})", stored, system.lifecycle().state());
    }
    Command::Activate => {
      if !system.lifecycle().resume(system.layer()).await? {
        system.install().await?;
      }
      if !system.lifecycle().is_running() {
        print_sweep(&system.activate().await?);
      }
      println!("{} is running", system.version());
    }
    Command::Sweep => print_sweep(&system.sweep().await),
    Command::Enqueue { item_type, data } => {
      let kind = QueueItemType::parse(&item_type)
        .ok_or_else(|| eyre!("Unknown item type '{}'", item_type))?;
      let data = serde_json::from_str(&data).map_err(|e| eyre!("Invalid JSON payload: {}", e))?;
      let id = system.enqueue(kind, data).await?;
      println!("Queued item {}", id);
    }
    Command::Drain => {
      let report = system.drain().await;
      println!(
        "Replayed {} of {} ({} failed, {} skipped)",
        report.succeeded, report.attempted, report.failed, report.skipped
      );
    }
    Command::Queue => {
      for item in system.queue().items()? {
        println!(
          "{:>6}  {:<16} {}  {}",
          item.id,
          item.item_type,
          item.enqueued_at.format("%Y-%m-%d %H:%M:%S"),
          item.data
        );
      }
    }
    Command::Version => println!("{}", system.version()),
    Command::Message { json } => {
      let message: ControlMessage =
        serde_json::from_str(&json).map_err(|e| eyre!("Invalid control message: {}", e))?;
      if message == ControlMessage::SkipWaiting && !system.lifecycle().resume(system.layer()).await? {
        system.install().await?;
      }
      if let Some(reply) = system.handle_message(message).await? {
        println!("{}", serde_json::to_string(&reply)?);
      }
    }
    Command::Run => run(&system, &config).await?,
  }

  Ok(())
}

async fn run(system: &HttpCacheSystem, config: &Config) -> Result<()> {
  system.start().await;
  info!(version = system.version(), "Running");

  let mut sweep = tokio::time::interval(Duration::from_secs(config.intervals.sweep_secs.max(1)));
  let mut drain = tokio::time::interval(Duration::from_secs(config.intervals.drain_secs.max(1)));

  loop {
    tokio::select! {
      _ = sweep.tick() => {
        system.sweep().await;
      }
      _ = drain.tick() => {
        system.on_sync(SYNC_TAG).await;
      }
      _ = tokio::signal::ctrl_c() => {
        info!("Shutting down");
        break;
      }
    }
  }

  Ok(())
}

fn source_label(source: CacheSource) -> &'static str {
  match source {
    CacheSource::Network => "network",
    CacheSource::CacheFresh => "cache",
    CacheSource::CacheStale => "stale cache",
    CacheSource::Offline => "offline",
    CacheSource::Unavailable => "unavailable",
  }
}

fn print_sweep(report: &SweepReport) {
  for region in &report.regions {
    println!(
      "{:<32} expired {:>4}  evicted {:>4}  {:.1} MB -> {:.1} MB",
      region.region_name,
      region.expired_removed,
      region.evicted,
      region.bytes_before as f64 / (1024.0 * 1024.0),
      region.bytes_after as f64 / (1024.0 * 1024.0)
    );
  }
}
