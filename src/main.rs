use clap::{Parser, Subcommand};
use color_eyre::Result;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use emosync::cache::{CacheManager, KeyValueRepository, SqliteRepository};
use emosync::config::Config;
use emosync::queue::OperationQueue;
use emosync::records::RecordStore;
use emosync::{logging, SyncStatus};

#[derive(Parser, Debug)]
#[command(name = "emosync")]
#[command(about = "Inspect the local state of the emotion sync engine")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/emosync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Count local records per sync status
  Status,
  /// List pending operations in drain order
  Queue,
  /// Remove every cached entry
  ClearCache,
}

fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;
  let _guard = logging::init(&config.log)?;

  let db_path = SqliteRepository::default_path(config.data_dir.as_deref())?;
  let repository: Arc<dyn KeyValueRepository> = Arc::new(SqliteRepository::open(&db_path)?);
  tracing::debug!(path = %db_path.display(), "opened repository");

  match args.command {
    Command::Status => print_status(repository)?,
    Command::Queue => print_queue(repository),
    Command::ClearCache => {
      let cache = CacheManager::new(repository);
      let removed = cache.clear();
      println!("Removed {} cached entries", removed);
    }
  }

  Ok(())
}

fn print_status(repository: Arc<dyn KeyValueRepository>) -> Result<()> {
  let records = RecordStore::load(repository)?;

  let mut counts: BTreeMap<String, usize> = BTreeMap::new();
  for status in [
    SyncStatus::NotSynced,
    SyncStatus::Syncing,
    SyncStatus::Synced,
    SyncStatus::SyncFailed,
    SyncStatus::Conflict,
  ] {
    counts.insert(status.to_string(), 0);
  }
  for local in records.all() {
    *counts.entry(local.record.sync_status.to_string()).or_default() += 1;
  }

  println!("{} records", records.len());
  for (status, count) in counts {
    println!("  {:<12} {}", status, count);
  }
  Ok(())
}

fn print_queue(repository: Arc<dyn KeyValueRepository>) {
  let queue = OperationQueue::new(repository);
  let pending = queue.pending();
  if pending.is_empty() {
    println!("No pending operations");
    return;
  }

  for op in pending {
    println!(
      "{:>4}  {:<16} {:<48} {}",
      op.priority,
      op.intent.to_string(),
      op.path,
      op.description
    );
  }
}
