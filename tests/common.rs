//! tests/common.rs
//! Shared helpers for integration tests.
#![allow(dead_code)]

use std::future::Future;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use cronkeeper::proc::ProcessTracker;
use cronkeeper::store::{KeyValue, LeaseId, Revision, WatchStream};
use cronkeeper::{
  Job, KvStore, MemoryStore, NodeIdentity, ResultStore, StoreError, TaskResult, TaskStatus,
  WorkerBuilder, WorkerConfig, WorkerHandle,
};
use tracing_subscriber::fmt::TestWriter;

pub const JOBS: &str = "/worker/jobs/";
pub const RESULTS: &str = "/worker/result/";
pub const LOCKS: &str = "/worker/lock/";
pub const PROCS: &str = "/worker/proc/";

// Initializes tracing subscriber for test output.
pub fn setup_tracing() {
  // Use try_init to avoid panic if called multiple times
  let _ = tracing_subscriber::fmt()
    .with_max_level(tracing::Level::DEBUG)
    .with_writer(TestWriter::new())
    .with_test_writer()
    .try_init();
}

pub fn test_store() -> Arc<MemoryStore> {
  Arc::new(MemoryStore::new())
}

pub fn test_node(hostname: &str, last_octet: u8) -> NodeIdentity {
  NodeIdentity::new(hostname, IpAddr::V4(Ipv4Addr::new(10, 0, 0, last_octet)))
}

// Short TTLs so lease expiry and failover fit in a test.
pub fn test_config() -> WorkerConfig {
  WorkerConfig {
    lock_ttl_secs: 2,
    lock_wait_secs: 1,
    proc_ttl_secs: 2,
    result_ttl_secs: 120,
    shell: "/bin/sh".to_string(),
    ..WorkerConfig::default()
  }
}

pub async fn start_worker(
  store: &Arc<MemoryStore>,
  node: NodeIdentity,
  config: WorkerConfig,
) -> WorkerHandle {
  WorkerBuilder::new(store.clone())
    .config(config)
    .node(node)
    .build()
    .expect("worker config should be valid")
    .run()
    .await
    .expect("worker should start")
}

pub async fn put_job(store: &Arc<MemoryStore>, job: serde_json::Value) -> String {
  let id = job["id"].as_str().expect("test jobs carry an id").to_string();
  let key = format!("{JOBS}{id}");
  store
    .put(&key, job.to_string(), None)
    .await
    .expect("put job");
  key
}

pub fn result_store(store: &Arc<MemoryStore>) -> ResultStore {
  ResultStore::new(store.clone(), RESULTS, StdDuration::from_secs(120))
}

pub async fn results_for(store: &Arc<MemoryStore>, job_id: &str) -> Vec<TaskResult> {
  result_store(store)
    .list(&job_id.to_string())
    .await
    .expect("list results")
}

pub async fn count_with_status(store: &Arc<MemoryStore>, job_id: &str, status: TaskStatus) -> usize {
  results_for(store, job_id)
    .await
    .iter()
    .filter(|r| r.status == status)
    .count()
}

pub fn tracker(store: &Arc<MemoryStore>, node: &NodeIdentity, ttl: StdDuration) -> Arc<ProcessTracker> {
  Arc::new(ProcessTracker::new(store.clone(), PROCS, node.id(), ttl))
}

pub fn shell_job(id: &str, command: &str) -> Job {
  Job {
    id: id.to_string(),
    name: id.to_string(),
    command: command.to_string(),
    ..Job::default()
  }
}

// Polls `check` every 50ms until it returns true or `timeout` elapses.
pub async fn wait_until<F, Fut>(timeout: StdDuration, mut check: F) -> bool
where
  F: FnMut() -> Fut,
  Fut: Future<Output = bool>,
{
  let deadline = tokio::time::Instant::now() + timeout;
  loop {
    if check().await {
      return true;
    }
    if tokio::time::Instant::now() >= deadline {
      return false;
    }
    tokio::time::sleep(StdDuration::from_millis(50)).await;
  }
}

// --- Fault injection ---

/// Wraps a [`MemoryStore`] and misbehaves on demand.
pub struct FaultyStore {
  inner: Arc<MemoryStore>,
  /// Lock-prefix reads answer this late, with the claims as they were when asked.
  lock_read_delay: Option<StdDuration>,
  fail_puts: AtomicBool,
}

impl FaultyStore {
  pub fn wrap(inner: &Arc<MemoryStore>) -> Self {
    Self {
      inner: inner.clone(),
      lock_read_delay: None,
      fail_puts: AtomicBool::new(false),
    }
  }

  pub fn with_lock_read_delay(mut self, delay: StdDuration) -> Self {
    self.lock_read_delay = Some(delay);
    self
  }

  pub fn fail_puts(&self, fail: bool) {
    self.fail_puts.store(fail, Ordering::SeqCst);
  }
}

#[async_trait]
impl KvStore for FaultyStore {
  async fn get(&self, key: &str) -> Result<Option<KeyValue>, StoreError> {
    self.inner.get(key).await
  }

  async fn get_prefix(&self, prefix: &str) -> Result<(Vec<KeyValue>, Revision), StoreError> {
    let read = self.inner.get_prefix(prefix).await;
    if let Some(delay) = self.lock_read_delay.filter(|_| prefix.starts_with(LOCKS)) {
      tokio::time::sleep(delay).await;
    }
    read
  }

  async fn put(&self, key: &str, value: String, lease: Option<LeaseId>) -> Result<(), StoreError> {
    if self.fail_puts.load(Ordering::SeqCst) {
      return Err(StoreError::Request("put rejected".to_string()));
    }
    self.inner.put(key, value, lease).await
  }

  async fn delete(&self, key: &str) -> Result<(), StoreError> {
    self.inner.delete(key).await
  }

  async fn grant_lease(&self, ttl: StdDuration) -> Result<LeaseId, StoreError> {
    self.inner.grant_lease(ttl).await
  }

  async fn keep_alive(&self, lease: LeaseId) -> Result<(), StoreError> {
    self.inner.keep_alive(lease).await
  }

  async fn revoke_lease(&self, lease: LeaseId) -> Result<(), StoreError> {
    self.inner.revoke_lease(lease).await
  }

  async fn watch_prefix(
    &self,
    prefix: &str,
    start_revision: Option<Revision>,
  ) -> Result<WatchStream, StoreError> {
    self.inner.watch_prefix(prefix, start_revision).await
  }

  async fn lock(&self, name: &str, lease: LeaseId) -> Result<String, StoreError> {
    self.inner.lock(name, lease).await
  }

  async fn unlock(&self, key: &str) -> Result<(), StoreError> {
    self.inner.unlock(key).await
  }
}
