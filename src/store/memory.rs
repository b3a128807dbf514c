use super::{EventKind, KeyValue, KvStore, LeaseId, Revision, WatchEvent, WatchStream};
use crate::error::StoreError;

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

const EVENT_HISTORY: usize = 8192;
// Smaller than the history so a lagging watch can catch up by replaying it.
const EVENT_CHANNEL_BOUND: usize = 1024;
const WATCH_STREAM_BOUND: usize = 256;
const REAP_PERIOD: Duration = Duration::from_millis(50);

#[derive(Debug)]
struct Lease {
  ttl: Duration,
  deadline: Instant,
  keys: HashSet<String>,
}

#[derive(Debug, Default)]
struct State {
  revision: Revision,
  next_lease: LeaseId,
  kvs: BTreeMap<String, KeyValue>,
  leases: HashMap<LeaseId, Lease>,
  history: VecDeque<WatchEvent>,
}

#[derive(Debug)]
struct Inner {
  state: Mutex<State>,
  events: broadcast::Sender<WatchEvent>,
  // Bumped on every mutation; lock waiters park on it.
  changed: watch::Sender<Revision>,
  renewals_blocked: AtomicBool,
}

impl Inner {
  /// Appends an event to the history and publishes it. Must be called with `state` locked.
  fn publish(&self, state: &mut State, event: WatchEvent) {
    if state.history.len() == EVENT_HISTORY {
      state.history.pop_front();
    }
    state.history.push_back(event.clone());
    // No receivers is fine.
    let _ = self.events.send(event);
  }

  fn put_locked(&self, state: &mut State, key: &str, value: String, lease: Option<LeaseId>) -> Result<(), StoreError> {
    if let Some(lease_id) = lease {
      if !state.leases.contains_key(&lease_id) {
        return Err(StoreError::LeaseNotFound(lease_id));
      }
    }

    state.revision += 1;
    let revision = state.revision;
    let previous = state.kvs.get(key).cloned();
    if let Some(prev) = &previous {
      if prev.lease != 0 && Some(prev.lease) != lease {
        if let Some(old_lease) = state.leases.get_mut(&prev.lease) {
          old_lease.keys.remove(key);
        }
      }
    }
    if let Some(lease_id) = lease {
      if let Some(entry) = state.leases.get_mut(&lease_id) {
        entry.keys.insert(key.to_string());
      }
    }

    let kv = KeyValue {
      key: key.to_string(),
      value,
      create_revision: previous.map(|p| p.create_revision).unwrap_or(revision),
      mod_revision: revision,
      lease: lease.unwrap_or(0),
    };
    state.kvs.insert(key.to_string(), kv.clone());
    self.publish(state, WatchEvent {
      kind: EventKind::Put,
      kv,
    });
    self.changed.send_replace(revision);
    Ok(())
  }

  /// Deletes `keys` in a single revision. Must be called with `state` locked.
  fn delete_locked(&self, state: &mut State, keys: &[String]) {
    let existing: Vec<KeyValue> = keys.iter().filter_map(|k| state.kvs.remove(k)).collect();
    if existing.is_empty() {
      return;
    }
    state.revision += 1;
    let revision = state.revision;
    for kv in existing {
      if kv.lease != 0 {
        if let Some(lease) = state.leases.get_mut(&kv.lease) {
          lease.keys.remove(&kv.key);
        }
      }
      self.publish(state, WatchEvent {
        kind: EventKind::Delete,
        kv: KeyValue {
          key: kv.key,
          value: String::new(),
          create_revision: 0,
          mod_revision: revision,
          lease: 0,
        },
      });
    }
    self.changed.send_replace(revision);
  }

  fn revoke_locked(&self, state: &mut State, lease: LeaseId) -> bool {
    match state.leases.remove(&lease) {
      Some(entry) => {
        let keys: Vec<String> = entry.keys.into_iter().collect();
        self.delete_locked(state, &keys);
        true
      }
      None => false,
    }
  }

  fn reap_expired(&self) {
    let now = Instant::now();
    let mut state = self.state.lock();
    let expired: Vec<LeaseId> = state
      .leases
      .iter()
      .filter(|(_, lease)| lease.deadline <= now)
      .map(|(id, _)| *id)
      .collect();
    for lease in expired {
      debug!(lease, "Lease expired.");
      self.revoke_locked(&mut state, lease);
    }
  }
}

/// What a watch has already handed out: everything before `revision`, plus
/// `keys` at `revision` itself (one delete revision can span several keys).
#[derive(Debug)]
struct Delivered {
  revision: Revision,
  keys: Vec<String>,
  whole_revision: bool,
}

impl Delivered {
  /// Nothing at or before `revision` is to be delivered.
  fn through(revision: Revision) -> Self {
    Self {
      revision,
      keys: Vec::new(),
      whole_revision: true,
    }
  }

  fn covers(&self, event: &WatchEvent) -> bool {
    let revision = event.kv.mod_revision;
    revision < self.revision
      || (revision == self.revision && (self.whole_revision || self.keys.contains(&event.kv.key)))
  }

  fn record(&mut self, event: &WatchEvent) {
    if event.kv.mod_revision != self.revision {
      self.revision = event.kv.mod_revision;
      self.keys.clear();
      self.whole_revision = false;
    }
    self.keys.push(event.kv.key.clone());
  }
}

/// An in-process [`KvStore`] with etcd-like semantics.
///
/// Supports revisions, TTL leases (expired by a background reaper), ordered
/// prefix watches that can replay from a recent revision, and the lease-bound
/// lock primitive. Must be created inside a Tokio runtime.
#[derive(Debug)]
pub struct MemoryStore {
  inner: Arc<Inner>,
  reaper: JoinHandle<()>,
}

impl MemoryStore {
  pub fn new() -> Self {
    let (events, _) = broadcast::channel(EVENT_CHANNEL_BOUND);
    let (changed, _) = watch::channel(0);
    let inner = Arc::new(Inner {
      state: Mutex::new(State {
        next_lease: 0x1000,
        ..State::default()
      }),
      events,
      changed,
      renewals_blocked: AtomicBool::new(false),
    });

    let reaper_inner = inner.clone();
    let reaper = tokio::spawn(async move {
      let mut ticker = tokio::time::interval(REAP_PERIOD);
      loop {
        ticker.tick().await;
        reaper_inner.reap_expired();
      }
    });

    Self { inner, reaper }
  }

  /// Current store revision.
  pub fn revision(&self) -> Revision {
    self.inner.state.lock().revision
  }

  /// Makes every `keep_alive` call fail while `blocked` is true, as if this
  /// client had lost its connection. Leases then run out on their TTL.
  pub fn block_renewals(&self, blocked: bool) {
    self.inner.renewals_blocked.store(blocked, AtomicOrdering::SeqCst);
  }

  /// Number of live leases.
  pub fn lease_count(&self) -> usize {
    self.inner.state.lock().leases.len()
  }
}

impl Default for MemoryStore {
  fn default() -> Self {
    Self::new()
  }
}

impl Drop for MemoryStore {
  fn drop(&mut self) {
    self.reaper.abort();
  }
}

#[async_trait]
impl KvStore for MemoryStore {
  async fn get(&self, key: &str) -> Result<Option<KeyValue>, StoreError> {
    Ok(self.inner.state.lock().kvs.get(key).cloned())
  }

  async fn get_prefix(&self, prefix: &str) -> Result<(Vec<KeyValue>, Revision), StoreError> {
    let state = self.inner.state.lock();
    let kvs = state
      .kvs
      .range(prefix.to_string()..)
      .take_while(|(k, _)| k.starts_with(prefix))
      .map(|(_, kv)| kv.clone())
      .collect();
    Ok((kvs, state.revision))
  }

  async fn put(&self, key: &str, value: String, lease: Option<LeaseId>) -> Result<(), StoreError> {
    let mut state = self.inner.state.lock();
    self.inner.put_locked(&mut state, key, value, lease)
  }

  async fn delete(&self, key: &str) -> Result<(), StoreError> {
    let mut state = self.inner.state.lock();
    self.inner.delete_locked(&mut state, &[key.to_string()]);
    Ok(())
  }

  async fn grant_lease(&self, ttl: Duration) -> Result<LeaseId, StoreError> {
    let mut state = self.inner.state.lock();
    state.next_lease += 1;
    let id = state.next_lease;
    state.leases.insert(id, Lease {
      ttl,
      deadline: Instant::now() + ttl,
      keys: HashSet::new(),
    });
    trace!(lease = id, ?ttl, "Lease granted.");
    Ok(id)
  }

  async fn keep_alive(&self, lease: LeaseId) -> Result<(), StoreError> {
    if self.inner.renewals_blocked.load(AtomicOrdering::SeqCst) {
      return Err(StoreError::Connection("renewals blocked".to_string()));
    }
    let mut state = self.inner.state.lock();
    match state.leases.get_mut(&lease) {
      Some(entry) => {
        entry.deadline = Instant::now() + entry.ttl;
        Ok(())
      }
      None => Err(StoreError::LeaseNotFound(lease)),
    }
  }

  async fn revoke_lease(&self, lease: LeaseId) -> Result<(), StoreError> {
    let mut state = self.inner.state.lock();
    if self.inner.revoke_locked(&mut state, lease) {
      Ok(())
    } else {
      Err(StoreError::LeaseNotFound(lease))
    }
  }

  async fn watch_prefix(
    &self,
    prefix: &str,
    start_revision: Option<Revision>,
  ) -> Result<WatchStream, StoreError> {
    let (tx, rx) = mpsc::channel(WATCH_STREAM_BOUND);
    let prefix = prefix.to_string();

    // Subscribe and read the backlog under the same lock so nothing falls in between.
    let (mut live, backlog, mut delivered) = {
      let state = self.inner.state.lock();
      let live = self.inner.events.subscribe();
      let delivered = Delivered::through(match start_revision {
        Some(start) => start - 1,
        None => state.revision,
      });
      let backlog: Vec<WatchEvent> = match start_revision {
        Some(start) => {
          if let Some(oldest) = state.history.front() {
            if oldest.kv.mod_revision > start {
              warn!(%prefix, start, oldest = oldest.kv.mod_revision, "Watch start revision is older than retained history.");
            }
          }
          state
            .history
            .iter()
            .filter(|e| e.kv.mod_revision >= start && e.kv.key.starts_with(&prefix))
            .cloned()
            .collect()
        }
        None => Vec::new(),
      };
      (live, backlog, delivered)
    };

    let inner = self.inner.clone();
    tokio::spawn(async move {
      let mut pending: VecDeque<WatchEvent> = backlog.into();
      loop {
        while let Some(event) = pending.pop_front() {
          if delivered.covers(&event) {
            continue;
          }
          delivered.record(&event);
          if tx.send(event).await.is_err() {
            trace!(%prefix, "Watch receiver dropped.");
            return;
          }
        }
        match live.recv().await {
          Ok(event) if event.kv.key.starts_with(&prefix) => pending.push_back(event),
          Ok(_) => {}
          Err(broadcast::error::RecvError::Lagged(skipped)) => {
            // Resubscribe and replay from history under the lock so nothing falls in between.
            let state = inner.state.lock();
            live = inner.events.subscribe();
            if let Some(oldest) = state.history.front() {
              if oldest.kv.mod_revision > delivered.revision + 1 {
                warn!(%prefix, oldest = oldest.kv.mod_revision, "Lagging watch fell behind retained history; events were lost.");
              }
            }
            pending.extend(
              state
                .history
                .iter()
                .filter(|e| e.kv.key.starts_with(&prefix) && !delivered.covers(e))
                .cloned(),
            );
            debug!(%prefix, skipped, replayed = pending.len(), "Watch lagged behind, replayed from history.");
          }
          Err(broadcast::error::RecvError::Closed) => return,
        }
      }
    });

    Ok(rx)
  }

  async fn lock(&self, name: &str, lease: LeaseId) -> Result<String, StoreError> {
    let key = format!("{name}/{lease:x}");
    let waiters_prefix = format!("{name}/");
    let mut changed = self.inner.changed.subscribe();

    {
      let mut state = self.inner.state.lock();
      if !state.kvs.contains_key(&key) {
        self.inner.put_locked(&mut state, &key, String::new(), Some(lease))?;
      }
    }

    loop {
      {
        let state = self.inner.state.lock();
        if !state.kvs.contains_key(&key) {
          // Our claim vanished with its lease.
          return Err(StoreError::LeaseNotFound(lease));
        }
        let owner = state
          .kvs
          .range(waiters_prefix.clone()..)
          .take_while(|(k, _)| k.starts_with(&waiters_prefix))
          .min_by_key(|(_, kv)| kv.create_revision)
          .map(|(k, _)| k.clone());
        if owner.as_deref() == Some(key.as_str()) {
          return Ok(key);
        }
      }
      changed
        .changed()
        .await
        .map_err(|_| StoreError::Request("store closed".to_string()))?;
    }
  }

  async fn unlock(&self, key: &str) -> Result<(), StoreError> {
    self.delete(key).await
  }
}
