use crate::error::StoreError;
use crate::job::{Job, JobId};
use crate::store::SharedStore;
use crate::task::{Task, TaskId};

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Execution status of a task. `Processing` is the only non-terminal one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
  Processing,
  Success,
  Failed,
  Timeout,
}

impl TaskStatus {
  pub fn is_terminal(self) -> bool {
    self != TaskStatus::Processing
  }
}

impl fmt::Display for TaskStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      TaskStatus::Processing => "processing",
      TaskStatus::Success => "success",
      TaskStatus::Failed => "failed",
      TaskStatus::Timeout => "timeout",
    };
    f.write_str(name)
  }
}

/// The record written under `{result_prefix}{job_id}/{task_id}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskResult {
  pub task_id: TaskId,
  pub status: TaskStatus,
  pub job: Job,
  pub logs: String,
  /// Node id (`ip:hostname`) the task ran on.
  pub run_on: String,
  pub executed_at: DateTime<Utc>,
  /// Set once a terminal status is written.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub finished_at: Option<DateTime<Utc>>,
}

/// Writes task results with a bounded retention lease.
pub struct ResultStore {
  store: SharedStore,
  prefix: String,
  ttl: Duration,
}

impl fmt::Debug for ResultStore {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ResultStore")
      .field("prefix", &self.prefix)
      .field("ttl", &self.ttl)
      .finish_non_exhaustive()
  }
}

impl ResultStore {
  pub fn new(store: SharedStore, prefix: impl Into<String>, ttl: Duration) -> Self {
    Self {
      store,
      prefix: prefix.into(),
      ttl,
    }
  }

  pub fn key(&self, job_id: &JobId, task_id: TaskId) -> String {
    format!("{}{}/{}", self.prefix, job_id, task_id)
  }

  /// Writes the current status of `task`. Later writes for the same task replace earlier ones.
  pub async fn set_status(
    &self,
    task: &Task,
    status: TaskStatus,
    logs: String,
  ) -> Result<(), StoreError> {
    let record = TaskResult {
      task_id: task.id,
      status,
      job: (*task.job).clone(),
      logs,
      run_on: task.run_on.clone(),
      executed_at: task.executed_at,
      finished_at: status.is_terminal().then(Utc::now),
    };
    let value = serde_json::to_string(&record).map_err(|e| StoreError::Request(e.to_string()))?;
    let key = self.key(&task.job.id, task.id);

    // One retention lease per task: a later write renews the one already attached.
    let attached = self.store.get(&key).await?.map(|kv| kv.lease).filter(|lease| *lease != 0);
    let (lease, granted) = match attached {
      Some(lease) if self.store.keep_alive(lease).await.is_ok() => (lease, false),
      _ => (self.store.grant_lease(self.ttl).await?, true),
    };
    if let Err(e) = self.store.put(&key, value, Some(lease)).await {
      if granted {
        let _ = self.store.revoke_lease(lease).await;
      }
      return Err(e);
    }
    debug!(%key, %status, lease, "Task result written.");
    Ok(())
  }

  /// Reads a stored result back.
  pub async fn get(&self, job_id: &JobId, task_id: TaskId) -> Result<Option<TaskResult>, StoreError> {
    let key = self.key(job_id, task_id);
    let Some(kv) = self.store.get(&key).await? else {
      return Ok(None);
    };
    match serde_json::from_str(&kv.value) {
      Ok(record) => Ok(Some(record)),
      Err(e) => {
        warn!(%key, error = %e, "Stored task result is not valid JSON.");
        Err(StoreError::Request(e.to_string()))
      }
    }
  }

  /// Every stored result for `job_id`.
  pub async fn list(&self, job_id: &JobId) -> Result<Vec<TaskResult>, StoreError> {
    let prefix = format!("{}{}/", self.prefix, job_id);
    let (kvs, _) = self.store.get_prefix(&prefix).await?;
    Ok(
      kvs
        .iter()
        .filter_map(|kv| serde_json::from_str(&kv.value).ok())
        .collect(),
    )
  }
}
