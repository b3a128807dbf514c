//! Agent configuration, read from a TOML file with a default for every field.
//!
//! ```toml
//! [worker]
//! jobs_prefix = "/worker/jobs/"
//! lock_ttl_secs = 10
//! immediately_run = false
//!
//! [etcd]
//! endpoints = ["http://127.0.0.1:2379"]
//!
//! [log]
//! level = "info"
//! ```

use crate::error::ConfigError;

use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
  pub worker: WorkerConfig,
  pub etcd: EtcdConfig,
  pub log: LogConfig,
}

impl AgentConfig {
  pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
      path: path.display().to_string(),
      source,
    })?;
    Self::parse(&text, &path.display().to_string())
  }

  /// Parses configuration text; `origin` only labels errors.
  pub fn parse(text: &str, origin: &str) -> Result<Self, ConfigError> {
    toml::from_str(text).map_err(|source| ConfigError::Parse {
      path: origin.to_string(),
      source,
    })
  }
}

/// `[worker]`: key layout, timing and execution settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
  pub jobs_prefix: String,
  pub once_prefix: String,
  pub lock_prefix: String,
  pub interval_lock_prefix: String,
  pub proc_prefix: String,
  pub result_prefix: String,

  /// Overrides the discovered hostname.
  pub hostname: Option<String>,
  /// Overrides the discovered outbound IP.
  pub ip: Option<IpAddr>,

  pub req_timeout_secs: u64,
  pub lock_ttl_secs: u64,
  pub lock_wait_secs: u64,
  pub proc_ttl_secs: u64,
  pub result_ttl_secs: u64,

  /// Fire newly loaded Cmds right away instead of at their first natural occurrence.
  pub immediately_run: bool,
  pub shell: String,
  pub max_output_bytes: usize,
  /// How many processed once-run revisions are remembered for deduplication.
  pub once_dedup_capacity: usize,
}

impl Default for WorkerConfig {
  fn default() -> Self {
    Self {
      jobs_prefix: "/worker/jobs/".to_string(),
      once_prefix: "/worker/once/".to_string(),
      lock_prefix: "/worker/lock/".to_string(),
      interval_lock_prefix: "/worker/interval/".to_string(),
      proc_prefix: "/worker/proc/".to_string(),
      result_prefix: "/worker/result/".to_string(),
      hostname: None,
      ip: None,
      req_timeout_secs: 3,
      lock_ttl_secs: 10,
      lock_wait_secs: 3,
      proc_ttl_secs: 30,
      result_ttl_secs: 600,
      immediately_run: false,
      shell: "/bin/bash".to_string(),
      max_output_bytes: 64 * 1024,
      once_dedup_capacity: 1024,
    }
  }
}

impl WorkerConfig {
  pub fn req_timeout(&self) -> Duration {
    Duration::from_secs(self.req_timeout_secs)
  }

  pub fn lock_ttl(&self) -> Duration {
    Duration::from_secs(self.lock_ttl_secs)
  }

  pub fn lock_wait(&self) -> Duration {
    Duration::from_secs(self.lock_wait_secs)
  }

  pub fn proc_ttl(&self) -> Duration {
    Duration::from_secs(self.proc_ttl_secs)
  }

  pub fn result_ttl(&self) -> Duration {
    Duration::from_secs(self.result_ttl_secs)
  }
}

/// `[etcd]`: cluster connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EtcdConfig {
  pub endpoints: Vec<String>,
  pub username: Option<String>,
  pub password: Option<String>,
  pub connect_timeout_secs: u64,
}

impl Default for EtcdConfig {
  fn default() -> Self {
    Self {
      endpoints: vec!["http://127.0.0.1:2379".to_string()],
      username: None,
      password: None,
      connect_timeout_secs: 5,
    }
  }
}

/// `[log]`: `RUST_LOG` takes precedence over `level` when set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
  pub level: String,
  pub json: bool,
}

impl Default for LogConfig {
  fn default() -> Self {
    Self {
      level: "info".to_string(),
      json: false,
    }
  }
}
