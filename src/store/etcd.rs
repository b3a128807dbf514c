use super::{EventKind, KeyValue, KvStore, LeaseId, Revision, WatchEvent, WatchStream};
use crate::config::EtcdConfig;
use crate::error::StoreError;

use std::time::Duration;

use async_trait::async_trait;
use etcd_client::{
  Client, ConnectOptions, EventType, GetOptions, LockOptions, PutOptions, WatchOptions,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const WATCH_STREAM_BOUND: usize = 256;
const WATCH_RETRY_MIN: Duration = Duration::from_millis(200);
const WATCH_RETRY_MAX: Duration = Duration::from_secs(10);

fn request_err(e: etcd_client::Error) -> StoreError {
  StoreError::Request(e.to_string())
}

fn convert_kv(kv: &etcd_client::KeyValue) -> KeyValue {
  KeyValue {
    key: String::from_utf8_lossy(kv.key()).into_owned(),
    value: String::from_utf8_lossy(kv.value()).into_owned(),
    create_revision: kv.create_revision(),
    mod_revision: kv.mod_revision(),
    lease: kv.lease(),
  }
}

/// Where a reconnected watch picks up after one response.
///
/// Events move it past the last delivered revision. A response without events
/// is a progress notification whose header revision has been fully delivered.
fn resume_after(next: Revision, header_revision: Option<Revision>, last_event: Option<Revision>) -> Revision {
  match last_event {
    Some(revision) => revision + 1,
    None => header_revision.map_or(next, |header| next.max(header + 1)),
  }
}

/// [`KvStore`] on an etcd v3 cluster.
///
/// `etcd_client::Client` is a cheap clone over one gRPC channel, so every
/// call clones it instead of serializing on a mutex.
#[derive(Clone)]
pub struct EtcdStore {
  client: Client,
  request_timeout: Duration,
}

impl std::fmt::Debug for EtcdStore {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("EtcdStore")
      .field("request_timeout", &self.request_timeout)
      .finish_non_exhaustive()
  }
}

impl EtcdStore {
  pub async fn connect(config: &EtcdConfig, request_timeout: Duration) -> Result<Self, StoreError> {
    let mut options = ConnectOptions::new()
      .with_connect_timeout(Duration::from_secs(config.connect_timeout_secs))
      .with_keep_alive(Duration::from_secs(10), Duration::from_secs(5));
    if let (Some(user), Some(password)) = (&config.username, &config.password) {
      options = options.with_user(user.clone(), password.clone());
    }

    let client = Client::connect(&config.endpoints, Some(options))
      .await
      .map_err(|e| StoreError::Connection(e.to_string()))?;
    info!(endpoints = ?config.endpoints, "Connected to etcd.");
    Ok(Self {
      client,
      request_timeout,
    })
  }

  async fn bounded<T, F>(&self, fut: F) -> Result<T, StoreError>
  where
    F: std::future::Future<Output = Result<T, etcd_client::Error>>,
  {
    match tokio::time::timeout(self.request_timeout, fut).await {
      Ok(result) => result.map_err(request_err),
      Err(_) => Err(StoreError::Timeout),
    }
  }

  /// The revision right after the current one, read without fetching any value.
  async fn next_revision(&self, prefix: &str) -> Result<Revision, StoreError> {
    let mut client = self.client.clone();
    let resp = self
      .bounded(client.get(prefix, Some(GetOptions::new().with_prefix().with_count_only())))
      .await?;
    Ok(resp.header().map(|h| h.revision()).unwrap_or_default() + 1)
  }
}

#[async_trait]
impl KvStore for EtcdStore {
  async fn get(&self, key: &str) -> Result<Option<KeyValue>, StoreError> {
    let mut client = self.client.clone();
    let resp = self.bounded(client.get(key, None)).await?;
    Ok(resp.kvs().first().map(convert_kv))
  }

  async fn get_prefix(&self, prefix: &str) -> Result<(Vec<KeyValue>, Revision), StoreError> {
    let mut client = self.client.clone();
    let resp = self
      .bounded(client.get(prefix, Some(GetOptions::new().with_prefix())))
      .await?;
    let revision = resp.header().map(|h| h.revision()).unwrap_or_default();
    Ok((resp.kvs().iter().map(convert_kv).collect(), revision))
  }

  async fn put(&self, key: &str, value: String, lease: Option<LeaseId>) -> Result<(), StoreError> {
    let mut client = self.client.clone();
    let options = lease.map(|id| PutOptions::new().with_lease(id));
    self.bounded(client.put(key, value, options)).await?;
    Ok(())
  }

  async fn delete(&self, key: &str) -> Result<(), StoreError> {
    let mut client = self.client.clone();
    self.bounded(client.delete(key, None)).await?;
    Ok(())
  }

  async fn grant_lease(&self, ttl: Duration) -> Result<LeaseId, StoreError> {
    let mut client = self.client.clone();
    let ttl_secs = ttl.as_secs().max(1) as i64;
    let resp = self.bounded(client.lease_grant(ttl_secs, None)).await?;
    Ok(resp.id())
  }

  async fn keep_alive(&self, lease: LeaseId) -> Result<(), StoreError> {
    let mut client = self.client.clone();
    let (mut keeper, mut stream) = self.bounded(client.lease_keep_alive(lease)).await?;
    self.bounded(keeper.keep_alive()).await?;
    match self.bounded(stream.message()).await? {
      Some(resp) if resp.ttl() > 0 => Ok(()),
      _ => Err(StoreError::LeaseNotFound(lease)),
    }
  }

  async fn revoke_lease(&self, lease: LeaseId) -> Result<(), StoreError> {
    let mut client = self.client.clone();
    self.bounded(client.lease_revoke(lease)).await?;
    Ok(())
  }

  async fn watch_prefix(
    &self,
    prefix: &str,
    start_revision: Option<Revision>,
  ) -> Result<WatchStream, StoreError> {
    let (tx, rx) = mpsc::channel(WATCH_STREAM_BOUND);
    let client = self.client.clone();
    let prefix = prefix.to_string();

    // A pinned start revision lets a reconnect resume even before the first event.
    let start_revision = match start_revision {
      Some(start) => start,
      None => self.next_revision(&prefix).await?,
    };
    // Establish the first watch eagerly so connection errors reach the caller.
    let options = WatchOptions::new()
      .with_prefix()
      .with_progress_notify()
      .with_start_revision(start_revision);
    let first = client
      .clone()
      .watch(prefix.as_str(), Some(options))
      .await
      .map_err(|e| StoreError::Connection(e.to_string()))?;

    tokio::spawn(async move {
      let mut next_revision = start_revision;
      let mut backoff = WATCH_RETRY_MIN;
      let mut current = Some(first);

      loop {
        let (_watcher, mut stream) = match current.take() {
          Some(pair) => pair,
          None => {
            let options = WatchOptions::new()
              .with_prefix()
              .with_progress_notify()
              .with_start_revision(next_revision);
            match client.clone().watch(prefix.as_str(), Some(options)).await {
              Ok(pair) => {
                info!(%prefix, from = ?next_revision, "Watch re-established.");
                pair
              }
              Err(e) => {
                warn!(%prefix, error = %e, retry_in = ?backoff, "Watch reconnect failed.");
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(WATCH_RETRY_MAX);
                continue;
              }
            }
          }
        };

        loop {
          match stream.message().await {
            Ok(Some(resp)) => {
              backoff = WATCH_RETRY_MIN;
              if resp.canceled() {
                warn!(%prefix, compact = resp.compact_revision(), "Watch canceled by server.");
                if resp.compact_revision() > 0 {
                  next_revision = resp.compact_revision();
                }
                break;
              }
              next_revision = resume_after(
                next_revision,
                resp.header().map(|h| h.revision()),
                resp.events().iter().filter_map(|e| e.kv()).map(|kv| kv.mod_revision()).last(),
              );
              for event in resp.events() {
                let Some(kv) = event.kv() else { continue };
                let converted = convert_kv(kv);
                let kind = match event.event_type() {
                  EventType::Put => EventKind::Put,
                  EventType::Delete => EventKind::Delete,
                };
                if tx
                  .send(WatchEvent {
                    kind,
                    kv: converted,
                  })
                  .await
                  .is_err()
                {
                  debug!(%prefix, "Watch receiver dropped.");
                  return;
                }
              }
            }
            Ok(None) => {
              warn!(%prefix, "Watch stream ended.");
              break;
            }
            Err(e) => {
              warn!(%prefix, error = %e, "Watch stream failed.");
              break;
            }
          }
        }

        if tx.is_closed() {
          return;
        }
        tokio::time::sleep(backoff).await;
      }
    });

    Ok(rx)
  }

  async fn lock(&self, name: &str, lease: LeaseId) -> Result<String, StoreError> {
    let mut client = self.client.clone();
    // Blocks until owned; the caller bounds the wait.
    let resp = client
      .lock(name, Some(LockOptions::new().with_lease(lease)))
      .await
      .map_err(request_err)?;
    Ok(String::from_utf8_lossy(resp.key()).into_owned())
  }

  async fn unlock(&self, key: &str) -> Result<(), StoreError> {
    let mut client = self.client.clone();
    self.bounded(client.unlock(key)).await?;
    Ok(())
  }
}
