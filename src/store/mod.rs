//! The watchable, strongly consistent key-value store the worker coordinates through.
//!
//! [`KvStore`] captures the handful of etcd v3 primitives the worker needs:
//! prefix reads with a revision, lease-bound puts, ordered prefix watches
//! and the lease-bound lock service. [`MemoryStore`] implements it in-process
//! (tests, single-node mode); `EtcdStore` implements it on a real cluster
//! behind the `etcd` feature.

mod memory;
#[cfg(feature = "etcd")]
mod etcd;

pub use memory::MemoryStore;
#[cfg(feature = "etcd")]
pub use self::etcd::EtcdStore;

use crate::error::StoreError;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Store revision (monotonic across the whole keyspace).
pub type Revision = i64;

/// Lease identifier.
pub type LeaseId = i64;

/// A shared, type-erased store handle.
pub type SharedStore = Arc<dyn KvStore>;

/// One key with its metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
  pub key: String,
  pub value: String,
  pub create_revision: Revision,
  pub mod_revision: Revision,
  /// `0` when the key is not attached to a lease.
  pub lease: LeaseId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
  Put,
  Delete,
}

/// A change notification delivered by a watch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
  pub kind: EventKind,
  /// For deletes, `value` is empty and `mod_revision` is the deletion revision.
  pub kv: KeyValue,
}

impl WatchEvent {
  pub fn is_delete(&self) -> bool {
    self.kind == EventKind::Delete
  }
}

/// Receiving end of a prefix watch. Events arrive in revision order.
pub type WatchStream = mpsc::Receiver<WatchEvent>;

#[async_trait]
pub trait KvStore: Send + Sync + 'static {
  async fn get(&self, key: &str) -> Result<Option<KeyValue>, StoreError>;

  /// Reads every key under `prefix` together with the store revision of the read.
  async fn get_prefix(&self, prefix: &str) -> Result<(Vec<KeyValue>, Revision), StoreError>;

  async fn put(&self, key: &str, value: String, lease: Option<LeaseId>) -> Result<(), StoreError>;

  async fn delete(&self, key: &str) -> Result<(), StoreError>;

  async fn grant_lease(&self, ttl: Duration) -> Result<LeaseId, StoreError>;

  /// Renews `lease` once. Fails with [`StoreError::LeaseNotFound`] once it has expired.
  async fn keep_alive(&self, lease: LeaseId) -> Result<(), StoreError>;

  /// Revokes `lease`, deleting every key attached to it.
  async fn revoke_lease(&self, lease: LeaseId) -> Result<(), StoreError>;

  /// Watches every key under `prefix`, starting at `start_revision` when given
  /// (otherwise at the next revision). A dropped connection is re-established
  /// by the implementation; the stream only ends when the store shuts down.
  async fn watch_prefix(
    &self,
    prefix: &str,
    start_revision: Option<Revision>,
  ) -> Result<WatchStream, StoreError>;

  /// Blocks until the lock `name` is owned through `lease`; returns the
  /// ownership key. Revoking the lease abandons the claim.
  async fn lock(&self, name: &str, lease: LeaseId) -> Result<String, StoreError>;

  async fn unlock(&self, key: &str) -> Result<(), StoreError>;
}

/// Keeps a lease alive in the background until dropped.
///
/// Renews every `ttl / 3`. When a renewal fails, the `lost` channel flips to
/// `true` and renewals stop; the lease will expire on the store side.
#[derive(Debug)]
pub struct LeaseKeeper {
  lost_rx: watch::Receiver<bool>,
  task: JoinHandle<()>,
}

impl LeaseKeeper {
  pub fn spawn(store: SharedStore, lease: LeaseId, ttl: Duration) -> Self {
    let (lost_tx, lost_rx) = watch::channel(false);
    let period = (ttl / 3).max(Duration::from_millis(100));
    let task = tokio::spawn(async move {
      let mut ticker = tokio::time::interval(period);
      ticker.tick().await; // first tick completes immediately
      loop {
        ticker.tick().await;
        if let Err(e) = store.keep_alive(lease).await {
          warn!(lease, error = %e, "Lease renewal failed; lease will expire.");
          let _ = lost_tx.send(true);
          break;
        }
        debug!(lease, "Lease renewed.");
      }
    });
    Self { lost_rx, task }
  }

  /// A receiver that turns `true` once renewal has failed.
  pub fn lost(&self) -> watch::Receiver<bool> {
    self.lost_rx.clone()
  }
}

impl Drop for LeaseKeeper {
  fn drop(&mut self) {
    self.task.abort();
  }
}

/// Last `/`-separated segment of a key.
pub fn last_segment(key: &str) -> &str {
  key.rsplit('/').next().unwrap_or(key)
}
