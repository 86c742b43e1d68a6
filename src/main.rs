mod config;
mod logging;

use chrono::DateTime;
use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use offsync::cache::SqliteStore;
use offsync::clock::SystemClock;
use offsync::connectivity::ConnectivityFlag;
use offsync::queue::{DrainReason, NewOperation, OperationKind};
use offsync::transport::HttpTransport;
use offsync::{
  CacheOptions, DrainReport, InvalidationTarget, OfflineClient, Params, QueuedOperation,
  WriteOptions, WriteOutcome,
};

#[derive(Parser, Debug)]
#[command(name = "offsync")]
#[command(about = "Cache-first HTTP client that queues writes while offline")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/offsync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Skip the connectivity check and behave as if the network were down
  #[arg(long)]
  offline: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Read an endpoint, cache first
  Get {
    endpoint: String,
    /// Query parameter, `name=value` (value parsed as JSON when it can be)
    #[arg(short = 'p', long = "param", value_parser = parse_param)]
    params: Vec<(String, Value)>,
    /// Bypass the cache entirely
    #[arg(long)]
    no_cache: bool,
    /// Skip the cache lookup but still store the response
    #[arg(long)]
    refresh: bool,
    /// TTL for the stored response
    #[arg(long)]
    max_age_ms: Option<u64>,
  },
  /// Create a resource
  Post(WriteArgs),
  /// Update a resource
  Put(WriteArgs),
  /// Delete a resource
  Delete(WriteArgs),
  /// Queue a write without trying the network
  Enqueue {
    #[arg(value_parser = parse_kind)]
    kind: OperationKind,
    #[command(flatten)]
    write: WriteArgs,
  },
  /// List pending and failed operations
  Queue,
  /// Replay pending operations
  Sync,
  /// Move a failed operation back to the pending queue
  Requeue { id: String },
  /// Drop a failed operation
  Discard { id: String },
  /// Invalidate one cached read
  Invalidate {
    endpoint: String,
    #[arg(short = 'p', long = "param", value_parser = parse_param)]
    params: Vec<(String, Value)>,
  },
  /// Cache counters
  Stats,
  /// Purge expired cache records
  Cleanup,
  /// Clear the cache (and the queue with --queue)
  Clear {
    #[arg(long)]
    queue: bool,
  },
  /// Connectivity and sync summary
  Status,
}

#[derive(clap::Args, Debug)]
struct WriteArgs {
  endpoint: String,
  /// Request body; `@path` reads it from a file
  #[arg(short, long)]
  data: Option<String>,
  /// Queue the write if the network is unavailable
  #[arg(short, long)]
  queue: bool,
  /// Cached read to invalidate on success, `endpoint` or `endpoint?name=value&...`
  #[arg(long = "invalidate", value_parser = parse_target)]
  invalidate: Vec<InvalidationTarget>,
}

impl WriteArgs {
  fn body(&self) -> Result<Option<Vec<u8>>> {
    match self.data.as_deref() {
      None => Ok(None),
      Some(data) => match data.strip_prefix('@') {
        Some(path) => std::fs::read(path)
          .map(Some)
          .map_err(|e| eyre!("Failed to read {}: {}", path, e)),
        None => Ok(Some(data.as_bytes().to_vec())),
      },
    }
  }

  fn options(&self) -> WriteOptions {
    WriteOptions {
      can_queue: self.queue,
      invalidate: self.invalidate.clone(),
    }
  }
}

fn parse_value(raw: &str) -> Value {
  serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn parse_param(raw: &str) -> Result<(String, Value), String> {
  let (name, value) = raw
    .split_once('=')
    .ok_or_else(|| format!("expected name=value, got '{}'", raw))?;
  if name.is_empty() {
    return Err(format!("empty parameter name in '{}'", raw));
  }
  Ok((name.to_string(), parse_value(value)))
}

fn parse_target(raw: &str) -> Result<InvalidationTarget, String> {
  let (endpoint, query) = match raw.split_once('?') {
    Some((endpoint, query)) => (endpoint, query),
    None => (raw, ""),
  };
  let params = query
    .split('&')
    .filter(|pair| !pair.is_empty())
    .map(parse_param)
    .collect::<Result<Vec<_>, _>>()?;
  Ok(InvalidationTarget::new(endpoint, params.into_iter().collect()))
}

fn parse_kind(raw: &str) -> Result<OperationKind, String> {
  match raw.to_ascii_lowercase().as_str() {
    "create" | "post" => Ok(OperationKind::Create),
    "update" | "put" => Ok(OperationKind::Update),
    "delete" => Ok(OperationKind::Delete),
    _ => Err(format!("unknown operation kind '{}'", raw)),
  }
}

fn format_ms(ms: i64) -> String {
  DateTime::from_timestamp_millis(ms)
    .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
    .unwrap_or_else(|| ms.to_string())
}

fn print_body(body: &[u8]) {
  match serde_json::from_slice::<Value>(body) {
    Ok(json) => match serde_json::to_string_pretty(&json) {
      Ok(pretty) => println!("{}", pretty),
      Err(_) => println!("{}", String::from_utf8_lossy(body)),
    },
    Err(_) => println!("{}", String::from_utf8_lossy(body)),
  }
}

fn print_operation(op: &QueuedOperation) {
  println!(
    "{}  {:<6} {:<30} attempts {}/{}  queued {}{}",
    op.id,
    op.kind.method().as_str(),
    op.endpoint,
    op.attempt_count,
    op.max_attempts,
    format_ms(op.enqueued_at_ms),
    op.last_error
      .as_deref()
      .map(|e| format!("  last error: {}", e))
      .unwrap_or_default(),
  );
}

fn print_report(report: &DrainReport) {
  match report.reason {
    DrainReason::Offline => println!("Offline, nothing replayed"),
    DrainReason::AlreadyRunning => println!("A sync is already running"),
    DrainReason::Completed | DrainReason::WentOffline => {
      println!(
        "Replayed {}: {} succeeded, {} will retry, {} failed permanently; {} pending",
        report.processed(),
        report.succeeded(),
        report.retry_later(),
        report.permanently_failed(),
        report.remaining,
      );
      if report.reason == DrainReason::WentOffline {
        println!("Connection lost during sync");
      }
    }
  }
}

fn print_write(outcome: WriteOutcome) {
  match outcome {
    WriteOutcome::Sent(response) => print_body(&response.body),
    WriteOutcome::Queued(op) => {
      eprintln!("Offline, queued for sync:");
      print_operation(&op);
    }
  }
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = config::Config::load(args.config.as_deref())?;
  let _log_guard = logging::init(&config.log)?;

  let store = match &config.storage.path {
    Some(path) => SqliteStore::open_at(path)?,
    None => SqliteStore::open()?,
  };

  let token = config::Config::get_api_token();
  let transport = HttpTransport::new(
    &config.api.base_url,
    config.timeout(),
    config.request_headers(token.as_deref()),
  )?;

  let online = !args.offline && transport.ping(&config.api.ping_endpoint).await;
  debug!(online, "connectivity checked");
  let probe = Arc::new(ConnectivityFlag::new(online));

  let client = OfflineClient::new(
    Arc::new(store),
    Arc::new(transport),
    probe,
    Arc::new(SystemClock),
    config.client_options(),
  )?;

  // Start-up housekeeping
  match client.cleanup_cache() {
    Ok(0) => {}
    Ok(purged) => info!(purged, "removed expired cache records"),
    Err(e) => warn!(error = %e, "cache cleanup failed"),
  }
  if let Some(report) = client.on_reconnect().await? {
    if report.processed() > 0 {
      print_report(&report);
    }
  }

  run(&client, args.command).await
}

async fn run(client: &OfflineClient, command: Command) -> Result<()> {
  match command {
    Command::Get {
      endpoint,
      params,
      no_cache,
      refresh,
      max_age_ms,
    } => {
      let params: Params = params.into_iter().collect();
      let mut options = if no_cache {
        CacheOptions::no_cache()
      } else {
        CacheOptions::default()
      };
      if refresh {
        options = options.refresh();
      }
      if let Some(ms) = max_age_ms {
        options = options.with_max_age(Duration::from_millis(ms));
      }

      let result = client.get(&endpoint, &params, options).await?;
      match result.cached_at_ms {
        Some(at) => eprintln!("[{} from {}]", result.source.label(), format_ms(at)),
        None => eprintln!("[{}]", result.source.label()),
      }
      print_body(&result.data);
    }
    Command::Post(write) => {
      let body = write.body()?.unwrap_or_default();
      print_write(client.post(&write.endpoint, body, write.options()).await?);
    }
    Command::Put(write) => {
      let body = write.body()?.unwrap_or_default();
      print_write(client.put(&write.endpoint, body, write.options()).await?);
    }
    Command::Delete(write) => {
      let body = write.body()?;
      print_write(client.delete(&write.endpoint, body, write.options()).await?);
    }
    Command::Enqueue { kind, write } => {
      let operation = NewOperation::new(kind, write.endpoint.clone(), write.body()?)
        .with_invalidation(write.invalidate.clone());
      print_operation(&client.enqueue(operation)?);
    }
    Command::Queue => {
      let pending = client.queued_operations()?;
      let failed = client.failed_operations()?;
      println!("Pending ({})", pending.len());
      pending.iter().for_each(print_operation);
      if !failed.is_empty() {
        println!("Failed ({})", failed.len());
        failed.iter().for_each(print_operation);
      }
    }
    Command::Sync => {
      let report = client.process_queued_operations().await?;
      print_report(&report);
    }
    Command::Requeue { id } => print_operation(&client.requeue_failed(&id)?),
    Command::Discard { id } => {
      let op = client.discard_failed(&id)?;
      println!("Discarded {}", op.id);
    }
    Command::Invalidate { endpoint, params } => {
      let params: Params = params.into_iter().collect();
      client.invalidate_cache(&endpoint, &params)?;
    }
    Command::Stats => {
      let stats = client.cache_stats()?;
      println!("Cached records:  {}", stats.total_items);
      println!("In memory:       {}", stats.memory_items);
      if stats.average_age_hours() > 0 {
        println!("Average age:     {}h", stats.average_age_hours());
      } else {
        println!("Average age:     {}m", stats.average_age_minutes());
      }
    }
    Command::Cleanup => {
      let purged = client.cleanup_cache()?;
      println!("Removed {} expired records", purged);
    }
    Command::Clear { queue } => {
      client.clear_cache()?;
      if queue {
        let dropped = client.clear_queue()?;
        println!("Cache cleared, {} queued operations dropped", dropped);
      } else {
        println!("Cache cleared");
      }
    }
    Command::Status => {
      let status = client.sync_status()?;
      println!(
        "Network:   {}",
        if client.is_online() { "online" } else { "offline" }
      );
      println!("Sync:      {:?}", status.phase);
      println!("Pending:   {}", status.pending);
      println!("Failed:    {}", status.failed);
      println!(
        "Last sync: {}",
        status
          .last_drain_ms
          .map(format_ms)
          .unwrap_or_else(|| "never".to_string())
      );
      if status.is_synced() {
        println!("All changes synced");
      }
    }
  }

  Ok(())
}
