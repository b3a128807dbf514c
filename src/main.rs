use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use cronkeeper::telemetry;
use cronkeeper::{AgentConfig, MemoryStore, SharedStore, WorkerBuilder};
use tokio::signal;
use tracing::{error, info, warn};

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// etcd when this build can talk to it.
#[cfg(feature = "etcd")]
const DEFAULT_STORE: StoreKind = StoreKind::Etcd;
#[cfg(not(feature = "etcd"))]
const DEFAULT_STORE: StoreKind = StoreKind::Memory;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum StoreKind {
  /// etcd cluster from the `[etcd]` section.
  Etcd,
  /// In-process store; single node, nothing persists.
  Memory,
}

/// Distributed cron worker.
#[derive(Debug, Parser)]
#[command(name = "cronkeeper", version, about)]
struct Cli {
  /// Configuration file (TOML). Built-in defaults apply when omitted.
  #[arg(short, long, value_name = "FILE")]
  config: Option<PathBuf>,

  /// Overrides the node hostname.
  #[arg(long)]
  hostname: Option<String>,

  /// Fire newly loaded jobs right away, then follow their schedules.
  #[arg(long)]
  immediately_run: bool,

  #[arg(long, value_enum, default_value_t = DEFAULT_STORE)]
  store: StoreKind,
}

#[tokio::main]
async fn main() -> Result<()> {
  let cli = Cli::parse();

  let mut config = match &cli.config {
    Some(path) => AgentConfig::load(path)?,
    None => AgentConfig::default(),
  };
  if let Some(hostname) = cli.hostname {
    config.worker.hostname = Some(hostname);
  }
  if cli.immediately_run {
    config.worker.immediately_run = true;
  }

  telemetry::init_tracing(&config.log.level, config.log.json);
  telemetry::install_panic_hook();

  let store = connect(cli.store, &config).await?;
  let handle = WorkerBuilder::new(store)
    .config(config.worker)
    .build()
    .context("invalid worker configuration")?
    .run()
    .await
    .context("worker failed to start")?;
  info!(node = %handle.node(), "Worker running.");

  wait_for_shutdown_signal().await;

  info!("Shutdown signal received, stopping worker.");
  match handle.shutdown_graceful(Some(SHUTDOWN_TIMEOUT)).await {
    Ok(()) => info!("Worker stopped."),
    Err(e) => {
      error!(error = %e, "Graceful shutdown failed, forcing.");
      if let Err(e) = handle.shutdown_force(Some(Duration::from_secs(5))).await {
        warn!(error = %e, "Forced shutdown failed.");
      }
    }
  }
  Ok(())
}

async fn connect(kind: StoreKind, config: &AgentConfig) -> Result<SharedStore> {
  match kind {
    StoreKind::Memory => {
      warn!("Using the in-memory store; job definitions live only in this process.");
      Ok(Arc::new(MemoryStore::new()))
    }
    #[cfg(feature = "etcd")]
    StoreKind::Etcd => {
      let store = cronkeeper::EtcdStore::connect(&config.etcd, config.worker.req_timeout())
        .await
        .context("connecting to etcd")?;
      Ok(Arc::new(store))
    }
    #[cfg(not(feature = "etcd"))]
    StoreKind::Etcd => {
      let _ = config;
      anyhow::bail!("this build has no etcd support; rebuild with `--features etcd` or pass `--store memory`")
    }
  }
}

async fn wait_for_shutdown_signal() {
  let ctrl_c = async {
    if let Err(e) = signal::ctrl_c().await {
      error!(error = %e, "Installing the Ctrl-C handler failed.");
      std::future::pending::<()>().await;
    }
  };

  #[cfg(unix)]
  let terminate = async {
    match signal::unix::signal(signal::unix::SignalKind::terminate()) {
      Ok(mut stream) => {
        stream.recv().await;
      }
      Err(e) => {
        error!(error = %e, "Installing the SIGTERM handler failed.");
        std::future::pending::<()>().await;
      }
    }
  };
  #[cfg(not(unix))]
  let terminate = std::future::pending::<()>();

  tokio::select! {
    _ = ctrl_c => {},
    _ = terminate => {},
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn default_store_is_usable_in_this_build() {
    let cli = Cli::parse_from(["cronkeeper"]);
    assert_eq!(cli.store, DEFAULT_STORE);
    #[cfg(not(feature = "etcd"))]
    assert_eq!(cli.store, StoreKind::Memory);
  }

  #[test]
  fn store_can_be_chosen_explicitly() {
    let cli = Cli::parse_from(["cronkeeper", "--store", "etcd", "--hostname", "db-1"]);
    assert_eq!(cli.store, StoreKind::Etcd);
    assert_eq!(cli.hostname.as_deref(), Some("db-1"));
  }
}
