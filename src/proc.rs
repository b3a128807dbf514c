//! Process tracking: lease-bound records of in-flight executions and remote kill.
//!
//! Every running child is published under
//! `{proc_prefix}{node_id}/{job_id}/{task_id}/{pid}` with a JSON value
//! `{"time": .., "killed": false}`, attached to a renewed lease so a crashed
//! node leaves nothing behind once the lease runs out. Setting `killed` to
//! `true` on a record asks the owning node to terminate that process group.

use crate::error::{JobError, StoreError};
use crate::job::JobId;
use crate::store::{KeyValue, LeaseId, LeaseKeeper, SharedStore};
use crate::task::TaskId;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// One execution attempt of a job on a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Process {
  pub pid: u32,
  pub job_id: JobId,
  pub task_id: TaskId,
  pub node_id: String,
  pub time: DateTime<Utc>,
  pub killed: bool,
}

/// The stored value of a process record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessValue {
  pub time: DateTime<Utc>,
  #[serde(default)]
  pub killed: bool,
}

impl Process {
  pub fn key(&self, prefix: &str) -> String {
    format!(
      "{prefix}{}/{}/{}/{}",
      self.node_id, self.job_id, self.task_id, self.pid
    )
  }

  pub fn value(&self) -> ProcessValue {
    ProcessValue {
      time: self.time,
      killed: self.killed,
    }
  }

  /// Decodes a record found under `prefix`.
  pub fn from_kv(prefix: &str, kv: &KeyValue) -> Result<Self, JobError> {
    let invalid = |reason: &str| JobError::Decode {
      key: kv.key.clone(),
      reason: reason.to_string(),
    };
    let rest = kv
      .key
      .strip_prefix(prefix)
      .ok_or_else(|| invalid("key is outside the process prefix"))?;
    let parts: Vec<&str> = rest.split('/').collect();
    let [node_id, job_id, task_id, pid] = parts.as_slice() else {
      return Err(invalid("expected node/job/task/pid"));
    };
    let task_id = task_id.parse().map_err(|_| invalid("task id is not a number"))?;
    let pid = pid.parse().map_err(|_| invalid("pid is not a number"))?;
    let value: ProcessValue =
      serde_json::from_str(&kv.value).map_err(|e| invalid(&e.to_string()))?;

    Ok(Self {
      pid,
      job_id: job_id.to_string(),
      task_id,
      node_id: node_id.to_string(),
      time: value.time,
      killed: value.killed,
    })
  }
}

#[derive(Debug)]
struct Tracked {
  job_id: JobId,
  task_id: TaskId,
  kill: CancellationToken,
}

/// Publishes process records for this node and delivers kill requests to local children.
pub struct ProcessTracker {
  store: SharedStore,
  prefix: String,
  node_id: String,
  ttl: Duration,
  running: Mutex<HashMap<u32, Tracked>>,
}

impl fmt::Debug for ProcessTracker {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ProcessTracker")
      .field("prefix", &self.prefix)
      .field("node_id", &self.node_id)
      .field("ttl", &self.ttl)
      .field("running", &self.running.lock().len())
      .finish_non_exhaustive()
  }
}

impl ProcessTracker {
  pub fn new(
    store: SharedStore,
    prefix: impl Into<String>,
    node_id: impl Into<String>,
    ttl: Duration,
  ) -> Self {
    Self {
      store,
      prefix: prefix.into(),
      node_id: node_id.into(),
      ttl,
      running: Mutex::new(HashMap::new()),
    }
  }

  /// The prefix holding this node's process records; the kill watch covers it.
  pub fn node_prefix(&self) -> String {
    format!("{}{}/", self.prefix, self.node_id)
  }

  pub fn prefix(&self) -> &str {
    &self.prefix
  }

  /// Number of children currently registered on this node.
  pub fn running_count(&self) -> usize {
    self.running.lock().len()
  }

  /// Registers a started child and publishes its record.
  ///
  /// `kill` is cancelled when a kill request for this process arrives.
  /// Publishing is best-effort: on failure the child still runs and can still
  /// be killed locally, it is just invisible to the cluster.
  pub async fn start(
    self: &Arc<Self>,
    job_id: &JobId,
    task_id: TaskId,
    pid: u32,
    kill: CancellationToken,
  ) -> ProcessGuard {
    self.running.lock().insert(
      pid,
      Tracked {
        job_id: job_id.clone(),
        task_id,
        kill,
      },
    );

    let process = Process {
      pid,
      job_id: job_id.clone(),
      task_id,
      node_id: self.node_id.clone(),
      time: Utc::now(),
      killed: false,
    };
    let key = process.key(&self.prefix);
    let mut guard = ProcessGuard {
      tracker: self.clone(),
      pid,
      key,
      lease: None,
      keeper: None,
      stopped: false,
    };

    match self.publish(&process, &guard.key).await {
      Ok(lease) => {
        guard.lease = Some(lease);
        guard.keeper = Some(LeaseKeeper::spawn(self.store.clone(), lease, self.ttl));
        debug!(key = %guard.key, lease, "Process record published.");
      }
      Err(e) => warn!(key = %guard.key, error = %e, "Publishing process record failed."),
    }
    guard
  }

  async fn publish(&self, process: &Process, key: &str) -> Result<LeaseId, StoreError> {
    let value = serde_json::to_string(&process.value())
      .map_err(|e| StoreError::Request(e.to_string()))?;
    let lease = self.store.grant_lease(self.ttl).await?;
    if let Err(e) = self.store.put(key, value, Some(lease)).await {
      let _ = self.store.revoke_lease(lease).await;
      return Err(e);
    }
    Ok(lease)
  }

  /// Delivers a kill request to the matching local child.
  ///
  /// Returns `false` (and logs) when no such child runs here; the record is
  /// then left to expire with its lease.
  pub fn kill(&self, process: &Process) -> bool {
    let running = self.running.lock();
    match running.get(&process.pid) {
      Some(tracked) if tracked.job_id == process.job_id && tracked.task_id == process.task_id => {
        info!(pid = process.pid, job_id = %process.job_id, task_id = process.task_id, "Killing process on request.");
        tracked.kill.cancel();
        true
      }
      _ => {
        warn!(pid = process.pid, job_id = %process.job_id, task_id = process.task_id, "Kill requested for a process not running on this node.");
        false
      }
    }
  }

  fn unregister(&self, pid: u32) {
    self.running.lock().remove(&pid);
  }
}

/// Keeps a process record alive while the child runs.
///
/// [`stop`](Self::stop) removes the record; dropping the guard without
/// stopping it removes it in the background.
pub struct ProcessGuard {
  tracker: Arc<ProcessTracker>,
  pid: u32,
  key: String,
  lease: Option<LeaseId>,
  keeper: Option<LeaseKeeper>,
  stopped: bool,
}

impl fmt::Debug for ProcessGuard {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ProcessGuard")
      .field("pid", &self.pid)
      .field("key", &self.key)
      .field("lease", &self.lease)
      .finish_non_exhaustive()
  }
}

impl ProcessGuard {
  pub fn key(&self) -> &str {
    &self.key
  }

  /// Unregisters the child and deletes its record. Failures are only logged.
  pub async fn stop(mut self) {
    self.stopped = true;
    self.keeper.take();
    self.tracker.unregister(self.pid);
    let store = self.tracker.store.clone();
    remove_record(store, self.key.clone(), self.lease.take()).await;
  }
}

impl Drop for ProcessGuard {
  fn drop(&mut self) {
    if self.stopped {
      return;
    }
    self.keeper.take();
    self.tracker.unregister(self.pid);
    if let Ok(runtime) = tokio::runtime::Handle::try_current() {
      let store = self.tracker.store.clone();
      runtime.spawn(remove_record(store, self.key.clone(), self.lease.take()));
    }
  }
}

async fn remove_record(store: SharedStore, key: String, lease: Option<LeaseId>) {
  if let Err(e) = store.delete(&key).await {
    warn!(%key, error = %e, "Deleting process record failed, it will expire with its lease.");
  }
  if let Some(lease) = lease {
    if let Err(e) = store.revoke_lease(lease).await {
      debug!(%key, lease, error = %e, "Revoking process lease failed.");
    }
  }
}
