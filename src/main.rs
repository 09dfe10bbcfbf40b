use async_trait::async_trait;
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use satchel::cache::SqliteStorage;
use satchel::config::Config;
use satchel::loader::LoadOptions;
use satchel::platform::{
  HeartbeatProbe, HttpProbe, ManualReachability, PolledReachability, Reachability,
};
use satchel::remote::{cache_key, PortalClient};
use satchel::sync::{AbsenceNote, WriteOp};
use satchel::{Collaborators, SatchelContext};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use url::Url;

#[derive(Parser, Debug)]
#[command(name = "satchel")]
#[command(about = "Offline-aware data loading for the school portal")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/satchel/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Load a JSON document through the cache tiers
  Get {
    url: Url,
    /// Cache lifetime in minutes (default from config)
    #[arg(long)]
    ttl_minutes: Option<u64>,
    /// Skip both cache tiers and hit the network
    #[arg(long)]
    bypass: bool,
  },
  /// Show connectivity state
  Status,
  /// Inspect or flush the offline write queue
  Queue {
    #[command(subcommand)]
    action: QueueAction,
  },
  /// Turn the force-offline override on or off
  Offline { mode: Toggle },
}

#[derive(Subcommand, Debug)]
enum QueueAction {
  /// List queued writes
  List,
  /// Replay queued writes now
  Flush,
  /// Queue an absence note
  AddNote {
    #[arg(long)]
    student: String,
    /// Day of absence (YYYY-MM-DD)
    #[arg(long)]
    date: NaiveDate,
    #[arg(long)]
    reason: String,
  },
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum Toggle {
  On,
  Off,
}

/// Probe used when no heartbeat endpoint is configured.
struct Unconfigured;

#[async_trait]
impl HeartbeatProbe for Unconfigured {
  async fn probe(&self) -> Result<()> {
    Err(eyre!("No heartbeat URL configured"))
  }
}

fn init_logging() -> Result<WorkerGuard> {
  let log_dir = dirs::data_dir()
    .ok_or_else(|| eyre!("Could not determine data directory"))?
    .join("satchel")
    .join("logs");
  std::fs::create_dir_all(&log_dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", log_dir.display(), e))?;

  let appender = tracing_appender::rolling::daily(&log_dir, "satchel.log");
  let (writer, guard) = tracing_appender::non_blocking(appender);
  let filter = EnvFilter::try_from_env("SATCHEL_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(writer)
    .with_ansi(false)
    .init();

  Ok(guard)
}

fn reachability(config: &Config, heartbeat_url: Option<&Url>) -> Arc<dyn Reachability> {
  let addr = heartbeat_url
    .and_then(|url| Some(format!("{}:{}", url.host_str()?, url.port_or_known_default()?)));
  match addr {
    Some(addr) => Arc::new(PolledReachability::spawn(
      addr,
      config.heartbeat.poll_interval(),
      config.heartbeat.timeout(),
    )),
    None => Arc::new(ManualReachability::new(true)),
  }
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;
  let _guard = init_logging()?;

  let args = Args::parse();
  let config = Config::load(args.config.as_deref())?;

  let http = reqwest::Client::builder()
    .user_agent(concat!("satchel/", env!("CARGO_PKG_VERSION")))
    .build()
    .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;
  let portal = PortalClient::new(http.clone(), config.api_base_url()?);

  let heartbeat_url = config.heartbeat_url()?;
  let probe: Arc<dyn HeartbeatProbe> = match &heartbeat_url {
    Some(url) => Arc::new(HttpProbe::new(http, url.clone())),
    None => Arc::new(Unconfigured),
  };
  let store = match &config.cache.db_path {
    Some(path) => SqliteStorage::open_at(path)?,
    None => SqliteStorage::open()?,
  };

  let context = SatchelContext::new(
    &config,
    Collaborators {
      store: Arc::new(store),
      reachability: reachability(&config, heartbeat_url.as_ref()),
      probe,
      replayer: Arc::new(portal.clone()),
    },
  );

  let result = run(&context, &portal, args.command).await;
  context.shutdown().await;
  result
}

async fn run(context: &SatchelContext, portal: &PortalClient, command: Command) -> Result<()> {
  match command {
    Command::Get {
      url,
      ttl_minutes,
      bypass,
    } => {
      let ttl = ttl_minutes.map_or(context.default_ttl(), |minutes| {
        std::time::Duration::from_secs(minutes.saturating_mul(60))
      });
      let fetcher = {
        let portal = portal.clone();
        let url = url.clone();
        move || {
          let portal = portal.clone();
          let url = url.clone();
          async move { portal.fetch_json(&url).await }
        }
      };
      let options = LoadOptions::new(cache_key(&url), fetcher)
        .with_ttl(ttl)
        .bypass_cache(bypass)
        .on_sync_state(|state| tracing::debug!(?state, "sync state"));

      let value = context
        .loader()
        .load(options)
        .await
        .ok_or_else(|| eyre!("Nothing cached for {} and the fetch failed", url))?;
      println!("{}", serde_json::to_string_pretty(&value)?);

      // Let the background refresh land in the cache before exiting
      context.loader().settle().await;
    }
    Command::Status => {
      context.start().await;
      let state = context.monitor().state();
      println!("status:     {}", state.status);
      println!("offline:    {}", state.is_offline);
      println!("queued:     {}", state.queued_count);
      match state.last_heartbeat {
        Some(at) => println!("heartbeat:  {}", at.to_rfc3339()),
        None => println!("heartbeat:  never"),
      }
    }
    Command::Queue { action } => match action {
      QueueAction::List => {
        let pending = context.queue().pending().await?;
        if pending.is_empty() {
          println!("Queue is empty");
        }
        for item in pending {
          println!(
            "#{:<4} {:<15} queued {}  attempts {}",
            item.id,
            item.op.kind(),
            item.enqueued_at.to_rfc3339(),
            item.attempts
          );
        }
      }
      QueueAction::Flush => {
        let report = context.queue().flush_all().await;
        if report.skipped {
          println!("Flush skipped; {} write(s) still queued", report.remaining);
        } else {
          println!(
            "Replayed {}, failed {}, remaining {}",
            report.replayed, report.failed, report.remaining
          );
        }
      }
      QueueAction::AddNote {
        student,
        date,
        reason,
      } => {
        let item = context
          .queue()
          .enqueue(WriteOp::AbsenceNote(AbsenceNote {
            student_id: student,
            date,
            reason,
          }))
          .await?;
        println!("Queued #{}", item.id);
      }
    },
    Command::Offline { mode } => {
      let enabled = matches!(mode, Toggle::On);
      context.set_force_offline(enabled).await?;
      println!("Force-offline {}", if enabled { "on" } else { "off" });
    }
  }

  Ok(())
}
