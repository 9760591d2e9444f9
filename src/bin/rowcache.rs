use clap::{Parser, Subcommand};
use colored::Colorize;
use comfy_table::Table;
use rowcache::cache::adapter::Cmdable;
use rowcache::cache::{reap_once, CacheClient, CacheError, CmdableAdapter};
use rowcache::config::{BackendType, Config};
use rowcache::db;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(name = "rowcache", about = "Cache and pub/sub on a SQL store", version)]
struct Args {
  #[arg(short, long, global = true)]
  config: Option<String>,
  #[arg(long, global = true, env = "ROWCACHE_SQLITE_PATH")]
  sqlite: Option<String>,
  #[arg(long, global = true, env = "ROWCACHE_PG_URL")]
  pg_url: Option<String>,
  #[arg(long, global = true)]
  log_level: Option<String>,
  #[arg(long, global = true, default_value = "table")]
  format: OutputFormat,
  #[command(subcommand)]
  command: Commands,
}

#[derive(Clone, Copy, Default, clap::ValueEnum)]
enum OutputFormat {
  #[default]
  Table,
  Json,
}

#[derive(Subcommand)]
enum Commands {
  /// Read a key
  Get { key: String },
  /// Write a key
  Set {
    key: String,
    value: String,
    /// Seconds to live, 0 never expires
    #[arg(long, default_value_t = 0)]
    ttl: u64,
  },
  /// Delete keys atomically
  Del {
    #[arg(required = true)]
    keys: Vec<String>,
  },
  /// Count live keys
  Exists { keys: Vec<String> },
  /// Reset a key's expiry
  Expire { key: String, seconds: u64 },
  /// Show a key's remaining time to live
  Ttl { key: String },
  /// Increment an integer key
  Incr {
    key: String,
    #[arg(long, default_value_t = 1, allow_hyphen_values = true)]
    by: i64,
  },
  /// Set hash fields: FIELD VALUE [FIELD VALUE ...]
  Hset {
    key: String,
    #[arg(required = true)]
    pairs: Vec<String>,
  },
  /// Show every field of a hash
  Hgetall { key: String },
  /// Page through a hash
  Hscan {
    key: String,
    #[arg(long, default_value_t = 0)]
    cursor: u64,
    #[arg(long, default_value = "*")]
    pattern: String,
    #[arg(long, default_value_t = 10)]
    count: i64,
  },
  /// Append a message to a channel
  Publish { channel: String, message: String },
  /// Print messages from a channel until interrupted
  Subscribe {
    channel: String,
    /// Durable subscriber id
    #[arg(long)]
    id: Option<String>,
  },
  /// Run one reaper pass
  Reap,
  /// Run the reaper until SIGINT or SIGTERM
  Serve,
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
  let args = Args::parse();

  // Load config: explicit path > auto-detect > defaults
  let mut config = if let Some(path) = &args.config {
    Config::from_file(path)?
  } else {
    Config::find_and_load()?.unwrap_or_default()
  };

  if let Some(url) = args.pg_url {
    config.postgres.url = url;
    config.backend = BackendType::Postgres;
  }
  if let Some(path) = args.sqlite {
    config.sqlite.path = path;
    config.backend = BackendType::Sqlite;
  }
  if let Some(level) = args.log_level {
    config.logging.level = level;
  }

  tracing_subscriber::registry()
    .with(
      tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| config.logging.level.clone().into()),
    )
    .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
    .init();

  // Only the long-running command keeps a background reaper.
  let serving = matches!(args.command, Commands::Serve);
  let backend = db::open(&config, serving && config.reaper.enabled).await?;
  let cmd = CmdableAdapter::new(backend.client.clone());

  let outcome = run(args.command, args.format, &cmd, &backend, &config).await;
  backend.client.close().await?;

  if let Err(e) = outcome {
    eprintln!("{}: {}", "Error".red(), e);
    std::process::exit(1);
  }
  Ok(())
}

async fn run(
  command: Commands,
  format: OutputFormat,
  cmd: &CmdableAdapter,
  backend: &db::Backend,
  config: &Config,
) -> Result<(), CacheError> {
  let client = cmd.client();
  match command {
    Commands::Get { key } => println!("{}", cmd.get(&key).await.into_result()?),
    Commands::Set { key, value, ttl } => {
      let status = cmd
        .set(&key, value.as_bytes(), Duration::from_secs(ttl))
        .await
        .into_result()?;
      println!("{}", status.green());
    }
    Commands::Del { keys } => {
      let keys: Vec<&str> = keys.iter().map(String::as_str).collect();
      println!("{}", cmd.del(&keys).await.into_result()?);
    }
    Commands::Exists { keys } => {
      let keys: Vec<&str> = keys.iter().map(String::as_str).collect();
      println!("{}", cmd.exists(&keys).await.into_result()?);
    }
    Commands::Expire { key, seconds } => {
      let updated = cmd
        .expire(&key, Duration::from_secs(seconds))
        .await
        .into_result()?;
      println!("{}", updated);
    }
    Commands::Ttl { key } => match client.ttl(&key).await? {
      Some(d) => println!("{}ms", d.as_millis()),
      None => println!("{}", "never expires".dimmed()),
    },
    Commands::Incr { key, by } => println!("{}", cmd.incr_by(&key, by).await.into_result()?),
    Commands::Hset { key, pairs } => {
      let pairs: Vec<&str> = pairs.iter().map(String::as_str).collect();
      println!("{}", cmd.hset(&key, &pairs).await.into_result()?);
    }
    Commands::Hgetall { key } => {
      let map = cmd.hget_all(&key).await.into_result()?;
      let sorted: BTreeMap<String, String> = map.into_iter().collect();
      print_fields(format, sorted.into_iter().collect());
    }
    Commands::Hscan {
      key,
      cursor,
      pattern,
      count,
    } => {
      let (flat, next) = client.scan_map_stream(&key, cursor, &pattern, count).await?;
      let fields = flat
        .chunks_exact(2)
        .map(|pair| (pair[0].clone(), pair[1].clone()))
        .collect();
      print_fields(format, fields);
      eprintln!("{} {}", "next cursor:".dimmed(), next);
    }
    Commands::Publish { channel, message } => {
      client.publish(&channel, &message).await?;
      println!("{}", "OK".green());
    }
    Commands::Subscribe { channel, id } => {
      let mut sub = match id {
        Some(id) => client.subscribe_as(&channel, &id).await?,
        None => client.subscribe(&channel).await?,
      };
      eprintln!(
        "{} {} as {}",
        "Subscribed to".green(),
        sub.channel(),
        sub.subscriber()
      );
      let shutdown = shutdown_signal();
      tokio::pin!(shutdown);
      loop {
        tokio::select! {
          _ = &mut shutdown => break,
          message = sub.recv() => match message {
            Some(message) => println!("{}", message),
            None => break,
          },
        }
      }
      sub.detach().await;
    }
    Commands::Reap => {
      let retention = Duration::from_secs(config.reaper.message_retention_secs);
      let stats = reap_once(backend.expiry.as_ref(), retention).await?;
      println!(
        "removed {} expired keys, {} old messages",
        stats.expired, stats.messages
      );
    }
    Commands::Serve => {
      tracing::info!("Reaper running against {:?} backend", config.backend);
      shutdown_signal().await;
    }
  }
  Ok(())
}

fn print_fields(format: OutputFormat, fields: Vec<(String, String)>) {
  match format {
    OutputFormat::Json => {
      let map: serde_json::Map<String, serde_json::Value> = fields
        .into_iter()
        .map(|(k, v)| (k, serde_json::Value::String(v)))
        .collect();
      println!("{}", serde_json::Value::Object(map));
    }
    OutputFormat::Table => {
      let mut table = Table::new();
      table.set_header(vec!["field", "value"]);
      for (field, value) in fields {
        table.add_row(vec![field, value]);
      }
      println!("{table}");
    }
  }
}

async fn shutdown_signal() {
  let ctrl_c = async {
    if let Err(e) = tokio::signal::ctrl_c().await {
      tracing::error!("Failed to install Ctrl+C handler: {}", e);
      std::future::pending::<()>().await;
    }
  };

  #[cfg(unix)]
  let terminate = async {
    match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
      Ok(mut signal) => {
        signal.recv().await;
      }
      Err(e) => {
        tracing::error!("Failed to install SIGTERM handler: {}", e);
        std::future::pending::<()>().await;
      }
    }
  };

  #[cfg(not(unix))]
  let terminate = std::future::pending::<()>();

  tokio::select! {
    _ = ctrl_c => tracing::info!("Received SIGINT"),
    _ = terminate => tracing::info!("Received SIGTERM"),
  }
}
