use crate::error::LockError;
use crate::store::{LeaseId, LeaseKeeper, SharedStore};

use std::fmt;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info, warn};

struct Held {
  key: String,
  lease: LeaseId,
  /// `None` for one-shot holds that are left to expire.
  keeper: Option<LeaseKeeper>,
}

/// A named, lease-bound, cluster-wide mutual exclusion token.
///
/// [`lock`](Self::lock) holds the lock until [`unlock`](Self::unlock) (or
/// until the lease can no longer be renewed). [`lock_once`](Self::lock_once)
/// takes an unrenewed hold that simply expires.
pub struct DistributedLock {
  store: SharedStore,
  name: String,
  ttl: Duration,
  held: Mutex<Option<Held>>,
}

impl fmt::Debug for DistributedLock {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("DistributedLock")
      .field("name", &self.name)
      .field("ttl", &self.ttl)
      .field("held", &self.is_held())
      .finish()
  }
}

impl DistributedLock {
  pub fn new(store: SharedStore, name: impl Into<String>, ttl: Duration) -> Self {
    Self {
      store,
      name: name.into(),
      ttl,
      held: Mutex::new(None),
    }
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn is_held(&self) -> bool {
    self.held.lock().is_some()
  }

  /// Whether any node owns or is queued for this lock right now.
  pub async fn is_contended(&self) -> Result<bool, LockError> {
    let (claims, _) = self.store.get_prefix(&format!("{}/", self.name)).await?;
    Ok(!claims.is_empty())
  }

  /// Acquires the lock, waiting at most `wait`. Already holding it is a success.
  ///
  /// The lease is renewed in the background for as long as the lock is held.
  ///
  /// # Errors
  ///
  /// - [`LockError::Busy`]: another holder kept it for the whole wait.
  /// - [`LockError::Store`]: the store failed.
  pub async fn lock(&self, wait: Duration) -> Result<(), LockError> {
    if self.is_held() {
      return Ok(());
    }

    let lease = self.store.grant_lease(self.ttl).await?;
    let keeper = LeaseKeeper::spawn(self.store.clone(), lease, self.ttl);
    let key = self.acquire(lease, wait).await?;

    debug!(lock = %self.name, %key, lease, "Lock acquired.");
    *self.held.lock() = Some(Held {
      key,
      lease,
      keeper: Some(keeper),
    });
    Ok(())
  }

  /// Takes the lock for `hold` without renewing it, waiting at most `wait`.
  ///
  /// A previous one-shot hold by this handle is released first, so the same
  /// node can take consecutive windows back to back.
  pub async fn lock_once(&self, wait: Duration, hold: Duration) -> Result<(), LockError> {
    let previous = self.held.lock().take();
    if let Some(previous) = previous {
      self.release(previous).await;
    }

    let lease = self.store.grant_lease(hold.max(Duration::from_secs(1))).await?;
    let key = self.acquire(lease, wait).await?;
    debug!(lock = %self.name, %key, lease, ?hold, "One-shot lock window taken.");
    *self.held.lock() = Some(Held {
      key,
      lease,
      keeper: None,
    });
    Ok(())
  }

  async fn acquire(&self, lease: LeaseId, wait: Duration) -> Result<String, LockError> {
    match tokio::time::timeout(wait, self.store.lock(&self.name, lease)).await {
      Ok(Ok(key)) => Ok(key),
      Ok(Err(e)) => {
        self.abandon(lease).await;
        Err(e.into())
      }
      Err(_) => {
        self.abandon(lease).await;
        Err(LockError::Busy(self.name.clone()))
      }
    }
  }

  // Revoking the lease withdraws a queued claim along with it.
  async fn abandon(&self, lease: LeaseId) {
    if let Err(e) = self.store.revoke_lease(lease).await {
      debug!(lock = %self.name, lease, error = %e, "Revoking unused lock lease failed.");
    }
  }

  /// A receiver that flips to `true` when renewal of the held lease fails.
  /// `None` when the lock is not held or the hold is not renewed.
  pub fn lost(&self) -> Option<watch::Receiver<bool>> {
    self
      .held
      .lock()
      .as_ref()
      .and_then(|held| held.keeper.as_ref().map(LeaseKeeper::lost))
  }

  /// Releases the lock. Safe to call when not held.
  pub async fn unlock(&self) {
    let held = self.held.lock().take();
    match held {
      Some(held) => {
        self.release(held).await;
        info!(lock = %self.name, "Lock released.");
      }
      None => debug!(lock = %self.name, "Unlock on a lock that is not held."),
    }
  }

  async fn release(&self, held: Held) {
    // Stop renewing before giving the lease back.
    drop(held.keeper);
    if let Err(e) = self.store.unlock(&held.key).await {
      warn!(lock = %self.name, key = %held.key, error = %e, "Unlock failed, revoking lease.");
    }
    if let Err(e) = self.store.revoke_lease(held.lease).await {
      debug!(lock = %self.name, lease = held.lease, error = %e, "Lease revoke after unlock failed.");
    }
  }
}
