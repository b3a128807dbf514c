//! The job registry: keeps this node's schedule in step with the job definitions in the store.
//!
//! [`Worker::run`] loads every definition, opens four prefix watches (job
//! definitions, lock releases, once-run requests for this host, and kill flags
//! for this node's processes) and hands their events to a single
//! reconciliation actor. Only the actor touches the job and Cmd maps; watch
//! tasks and lock attempts merely send it [`RegistryEvent`]s.

use crate::command::{RegistryCommand, RegistryEvent, ShutdownMode};
use crate::config::WorkerConfig;
use crate::cron::{CronEngine, EntryId, EntrySnapshot, JobFuture, Runnable};
use crate::error::{BuildError, LockError, QueryError, ShutdownError, WorkerError};
use crate::exec::Executor;
use crate::job::{Cmd, CmdId, Job, JobId, OnceRequest};
use crate::lock::DistributedLock;
use crate::metrics::{AgentMetrics, MetricsSnapshot};
use crate::node::NodeIdentity;
use crate::proc::{Process, ProcessTracker};
use crate::result::ResultStore;
use crate::schedule::{ImmediatelyFirst, Schedule};
use crate::store::{self, KeyValue, Revision, SharedStore, WatchStream};
use crate::task::{self, JobServices, JobSlot, TaskIdGenerator};
use crate::telemetry;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::RwLock;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

const COMMAND_CHANNEL_BOUND: usize = 128;
const EVENT_CHANNEL_BOUND: usize = 1024;

// --- Query Types ---

/// Point-in-time view of one Cmd scheduled on this node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CmdSummary {
  pub id: CmdId,
  pub spec: String,
  pub entry_id: EntryId,
  pub next_fire: Option<DateTime<Utc>>,
  /// A firing of this Cmd is in flight.
  pub running: bool,
}

/// What the registry knows about one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobDetails {
  pub job: Job,
  /// The job has Cmds scheduled on this node.
  pub scheduled: bool,
  /// This node holds the job's Alone lock.
  pub lock_held: bool,
  pub cmds: Vec<CmdSummary>,
}

// --- Builder ---

/// Configures and validates a [`Worker`].
///
/// ```no_run
/// use std::sync::Arc;
/// use cronkeeper::{MemoryStore, WorkerBuilder, WorkerConfig};
///
/// # async fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let store = Arc::new(MemoryStore::new());
/// let handle = WorkerBuilder::new(store)
///   .config(WorkerConfig::default())
///   .build()?
///   .run()
///   .await?;
/// handle.shutdown_graceful(None).await?;
/// # Ok(())
/// # }
/// ```
pub struct WorkerBuilder {
  store: SharedStore,
  config: WorkerConfig,
  node: Option<NodeIdentity>,
  metrics: Option<AgentMetrics>,
}

impl WorkerBuilder {
  pub fn new(store: SharedStore) -> Self {
    Self {
      store,
      config: WorkerConfig::default(),
      node: None,
      metrics: None,
    }
  }

  pub fn config(mut self, config: WorkerConfig) -> Self {
    self.config = config;
    self
  }

  /// Uses a fixed node identity instead of discovering one.
  pub fn node(mut self, node: NodeIdentity) -> Self {
    self.node = Some(node);
    self
  }

  /// Fires newly loaded Cmds right away, then follows their schedules.
  pub fn immediately_run(mut self, enabled: bool) -> Self {
    self.config.immediately_run = enabled;
    self
  }

  /// Shares an existing metrics registry instead of creating one.
  pub fn metrics(mut self, metrics: AgentMetrics) -> Self {
    self.metrics = Some(metrics);
    self
  }

  /// Validates the configuration and resolves the node identity.
  ///
  /// # Errors
  ///
  /// - [`BuildError::InvalidPrefix`]: a key prefix is empty or not `/`-terminated.
  /// - [`BuildError::ZeroDuration`]: a TTL, wait or timeout is zero.
  /// - [`BuildError::NodeIdentity`]: the hostname could not be read.
  pub fn build(self) -> Result<Worker, BuildError> {
    let WorkerBuilder {
      store,
      config,
      node,
      metrics,
    } = self;

    let prefixes = [
      ("jobs_prefix", &config.jobs_prefix),
      ("once_prefix", &config.once_prefix),
      ("lock_prefix", &config.lock_prefix),
      ("interval_lock_prefix", &config.interval_lock_prefix),
      ("proc_prefix", &config.proc_prefix),
      ("result_prefix", &config.result_prefix),
    ];
    for (name, prefix) in prefixes {
      if prefix.is_empty() || !prefix.ends_with('/') {
        return Err(BuildError::InvalidPrefix(name));
      }
    }

    let durations = [
      ("req_timeout_secs", config.req_timeout_secs),
      ("lock_ttl_secs", config.lock_ttl_secs),
      ("lock_wait_secs", config.lock_wait_secs),
      ("proc_ttl_secs", config.proc_ttl_secs),
      ("result_ttl_secs", config.result_ttl_secs),
    ];
    for (name, secs) in durations {
      if secs == 0 {
        return Err(BuildError::ZeroDuration(name));
      }
    }

    let node = match node {
      Some(node) => node,
      None => NodeIdentity::discover(config.hostname.as_deref(), config.ip)?,
    };

    Ok(Worker {
      store,
      config,
      node,
      metrics: metrics.unwrap_or_default(),
    })
  }
}

// --- Worker ---

/// A configured, not yet running job registry.
pub struct Worker {
  store: SharedStore,
  config: WorkerConfig,
  node: NodeIdentity,
  metrics: AgentMetrics,
}

impl Worker {
  pub fn builder(store: SharedStore) -> WorkerBuilder {
    WorkerBuilder::new(store)
  }

  pub fn node(&self) -> &NodeIdentity {
    &self.node
  }

  /// Loads the job set, opens the watches and starts the reconciliation actor.
  ///
  /// The definition watch resumes right after the revision of the initial
  /// read, so no change between load and watch is lost.
  ///
  /// # Errors
  ///
  /// - [`WorkerError::InitialLoad`]: the initial read failed.
  /// - [`WorkerError::Watch`]: a watch could not be opened.
  pub async fn run(self) -> Result<WorkerHandle, WorkerError> {
    let Worker {
      store,
      config,
      node,
      metrics,
    } = self;
    // Recovered panics in job runs are only useful with their backtrace.
    telemetry::install_panic_hook();

    let tracker = Arc::new(ProcessTracker::new(
      store.clone(),
      config.proc_prefix.clone(),
      node.id(),
      config.proc_ttl(),
    ));
    let once_prefix = format!("{}{}/", config.once_prefix, node.hostname);
    let kill_prefix = tracker.node_prefix();

    let (kvs, revision) = store
      .get_prefix(&config.jobs_prefix)
      .await
      .map_err(WorkerError::InitialLoad)?;
    info!(jobs = kvs.len(), revision, "Initial job definitions loaded.");

    let job_stream = open_watch(&store, &config.jobs_prefix, Some(revision + 1)).await?;
    let lock_stream = open_watch(&store, &config.lock_prefix, None).await?;
    let once_stream = open_watch(&store, &once_prefix, None).await?;
    let kill_stream = open_watch(&store, &kill_prefix, None).await?;

    let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_BOUND);
    let forwarders = vec![
      tokio::spawn(forward_jobs(job_stream, event_tx.clone())),
      tokio::spawn(forward_lock_releases(
        lock_stream,
        config.lock_prefix.clone(),
        event_tx.clone(),
      )),
      tokio::spawn(forward_once(once_stream, event_tx.clone(), metrics.clone())),
      tokio::spawn(forward_kills(
        kill_stream,
        tracker.prefix().to_string(),
        event_tx.clone(),
      )),
    ];

    let engine = CronEngine::start(metrics.clone());
    let services = Arc::new(JobServices {
      node: node.clone(),
      tracker,
      results: ResultStore::new(
        store.clone(),
        config.result_prefix.clone(),
        config.result_ttl(),
      ),
      executor: Executor::new(config.shell.clone(), config.max_output_bytes),
      ids: TaskIdGenerator::new(node.machine_id()),
      metrics: metrics.clone(),
      lock_wait: config.lock_wait(),
    });

    let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_BOUND);
    let (shutdown_tx, shutdown_rx) = watch::channel(None);

    let mut registry = Registry {
      store,
      once_seen: OnceDedup::new(config.once_dedup_capacity),
      config,
      node: node.clone(),
      services,
      engine,
      metrics: metrics.clone(),
      known: HashMap::new(),
      keys: HashMap::new(),
      jobs: HashMap::new(),
      pending_locks: HashMap::new(),
      retry_on_busy: HashSet::new(),
      next_attempt: 0,
      forwarders,
      event_tx,
      event_rx,
      cmd_rx,
      shutdown_rx,
    };
    for kv in kvs {
      registry.handle_job_put(kv);
    }

    let actor = tokio::spawn(async move {
      registry.run().await;
    });

    Ok(WorkerHandle {
      cmd_tx,
      shutdown_tx: Arc::new(shutdown_tx),
      actor: Arc::new(Mutex::new(Some(actor))),
      node,
    })
  }
}

async fn open_watch(
  store: &SharedStore,
  prefix: &str,
  start: Option<Revision>,
) -> Result<WatchStream, WorkerError> {
  store
    .watch_prefix(prefix, start)
    .await
    .map_err(|source| WorkerError::Watch {
      prefix: prefix.to_string(),
      source,
    })
}

// --- Handle ---

/// Handle to a running job registry. Clones share the same registry.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
  cmd_tx: mpsc::Sender<RegistryCommand>,
  shutdown_tx: Arc<watch::Sender<Option<ShutdownMode>>>,
  actor: Arc<Mutex<Option<JoinHandle<()>>>>,
  node: NodeIdentity,
}

impl WorkerHandle {
  pub fn node(&self) -> &NodeIdentity {
    &self.node
  }

  /// Every Cmd currently scheduled on this node, ordered by Cmd id.
  pub async fn list_cmds(&self) -> Result<Vec<CmdSummary>, QueryError> {
    let (responder, response_rx) = oneshot::channel();
    self
      .cmd_tx
      .send(RegistryCommand::ListCmds { responder })
      .await
      .map_err(|_| QueryError::WorkerShutdown)?;
    response_rx.await.map_err(|_| QueryError::ResponseFailed)
  }

  /// Details of a job whose definition this node has seen.
  ///
  /// # Errors
  ///
  /// - [`QueryError::JobNotFound`]: no valid definition with this id is known.
  pub async fn job(&self, job_id: impl Into<JobId>) -> Result<JobDetails, QueryError> {
    let (responder, response_rx) = oneshot::channel();
    self
      .cmd_tx
      .send(RegistryCommand::GetJob {
        job_id: job_id.into(),
        responder,
      })
      .await
      .map_err(|_| QueryError::WorkerShutdown)?;
    response_rx.await.map_err(|_| QueryError::ResponseFailed)?
  }

  /// Ids of the Alone jobs whose lock this node holds.
  pub async fn held_locks(&self) -> Result<Vec<JobId>, QueryError> {
    let (responder, response_rx) = oneshot::channel();
    self
      .cmd_tx
      .send(RegistryCommand::HeldLocks { responder })
      .await
      .map_err(|_| QueryError::WorkerShutdown)?;
    response_rx.await.map_err(|_| QueryError::ResponseFailed)
  }

  pub async fn metrics_snapshot(&self) -> Result<MetricsSnapshot, QueryError> {
    let (responder, response_rx) = oneshot::channel();
    self
      .cmd_tx
      .send(RegistryCommand::GetMetricsSnapshot { responder })
      .await
      .map_err(|_| QueryError::WorkerShutdown)?;
    response_rx.await.map_err(|_| QueryError::ResponseFailed)
  }

  /// Stops the watches, waits for in-flight firings, removes every Cmd and
  /// releases every held lock.
  ///
  /// # Errors
  ///
  /// - [`ShutdownError::SignalFailed`]: the registry had already stopped on its own.
  /// - [`ShutdownError::Timeout`]: shutdown did not finish within `timeout`.
  /// - [`ShutdownError::TaskPanic`]: the registry task panicked.
  pub async fn shutdown_graceful(&self, timeout: Option<Duration>) -> Result<(), ShutdownError> {
    self.shutdown(ShutdownMode::Graceful, timeout).await
  }

  /// Like [`shutdown_graceful`](Self::shutdown_graceful), but aborts in-flight
  /// firings, which kills their child processes.
  pub async fn shutdown_force(&self, timeout: Option<Duration>) -> Result<(), ShutdownError> {
    self.shutdown(ShutdownMode::Force, timeout).await
  }

  async fn shutdown(&self, mode: ShutdownMode, timeout: Option<Duration>) -> Result<(), ShutdownError> {
    let Some(actor) = self.actor.lock().await.take() else {
      debug!("Worker already shut down.");
      return Ok(());
    };
    info!(?mode, "Initiating worker shutdown...");
    self
      .shutdown_tx
      .send(Some(mode))
      .map_err(|_| ShutdownError::SignalFailed)?;

    let joined = match timeout {
      Some(limit) => tokio::time::timeout(limit, actor).await.map_err(|_| {
        error!(?limit, "Worker shutdown timed out.");
        ShutdownError::Timeout
      })?,
      None => actor.await,
    };
    joined.map_err(|e| {
      error!(error = ?e, "Registry task panicked.");
      ShutdownError::TaskPanic
    })
  }
}

// --- Watch Forwarders ---

async fn forward_jobs(mut stream: WatchStream, tx: mpsc::Sender<RegistryEvent>) {
  while let Some(event) = stream.recv().await {
    let mapped = if event.is_delete() {
      RegistryEvent::JobDeleted(event.kv.key)
    } else {
      RegistryEvent::JobPut(event.kv)
    };
    if tx.send(mapped).await.is_err() {
      return;
    }
  }
  debug!("Job definition watch ended.");
}

async fn forward_lock_releases(
  mut stream: WatchStream,
  prefix: String,
  tx: mpsc::Sender<RegistryEvent>,
) {
  while let Some(event) = stream.recv().await {
    if !event.is_delete() {
      continue;
    }
    // Lock keys are `{lock_prefix}{job_id}/{lease}`.
    let job_id = event
      .kv
      .key
      .strip_prefix(&prefix)
      .and_then(|rest| rest.split('/').next())
      .filter(|id| !id.is_empty());
    let Some(job_id) = job_id else {
      continue;
    };
    if tx
      .send(RegistryEvent::LockReleased(job_id.to_string()))
      .await
      .is_err()
    {
      return;
    }
  }
  debug!("Lock watch ended.");
}

async fn forward_once(
  mut stream: WatchStream,
  tx: mpsc::Sender<RegistryEvent>,
  metrics: AgentMetrics,
) {
  while let Some(event) = stream.recv().await {
    if event.is_delete() {
      continue;
    }
    let kv = event.kv;
    let request = match OnceRequest::from_kv(&kv) {
      Ok(request) => request,
      Err(e) => {
        AgentMetrics::incr(&metrics.invalid_definitions);
        warn!(key = %kv.key, error = %e, "Skipping malformed once-run request.");
        continue;
      }
    };
    let event = RegistryEvent::OnceRequested {
      mod_revision: kv.mod_revision,
      key: kv.key,
      request,
    };
    if tx.send(event).await.is_err() {
      return;
    }
  }
  debug!("Once-run watch ended.");
}

async fn forward_kills(mut stream: WatchStream, prefix: String, tx: mpsc::Sender<RegistryEvent>) {
  while let Some(event) = stream.recv().await {
    if event.is_delete() {
      continue;
    }
    match Process::from_kv(&prefix, &event.kv) {
      Ok(process) if process.killed => {
        if tx.send(RegistryEvent::KillRequested(process)).await.is_err() {
          return;
        }
      }
      Ok(_) => {}
      Err(e) => debug!(key = %event.kv.key, error = %e, "Ignoring unreadable process record."),
    }
  }
  debug!("Kill watch ended.");
}

// --- Reconciliation Actor ---

struct ScheduledCmd {
  spec: String,
  entry_id: EntryId,
  slot: JobSlot,
}

/// A job with Cmds scheduled on this node.
#[derive(Default)]
struct JobEntry {
  lock: Option<Arc<DistributedLock>>,
  lock_attempt: u64,
  lost_watch: Option<JoinHandle<()>>,
  cmds: HashMap<CmdId, ScheduledCmd>,
}

/// Remembers processed once-run deliveries by `(key, mod_revision)`, oldest evicted first.
struct OnceDedup {
  capacity: usize,
  order: VecDeque<(String, Revision)>,
  seen: HashSet<(String, Revision)>,
}

impl OnceDedup {
  fn new(capacity: usize) -> Self {
    Self {
      capacity: capacity.max(1),
      order: VecDeque::new(),
      seen: HashSet::new(),
    }
  }

  /// Records the delivery; `false` if it was already recorded.
  fn first_delivery(&mut self, key: &str, revision: Revision) -> bool {
    let id = (key.to_string(), revision);
    if self.seen.contains(&id) {
      return false;
    }
    if self.order.len() >= self.capacity {
      if let Some(oldest) = self.order.pop_front() {
        self.seen.remove(&oldest);
      }
    }
    self.order.push_back(id.clone());
    self.seen.insert(id);
    true
  }
}

struct Registry {
  store: SharedStore,
  config: WorkerConfig,
  node: NodeIdentity,
  services: Arc<JobServices>,
  engine: CronEngine,
  metrics: AgentMetrics,
  /// Every valid definition seen, scheduled here or not.
  known: HashMap<JobId, Arc<Job>>,
  /// Store key to job id, for resolving deletes.
  keys: HashMap<String, JobId>,
  jobs: HashMap<JobId, JobEntry>,
  /// Outstanding Alone-lock attempts by attempt number.
  pending_locks: HashMap<JobId, u64>,
  /// Jobs whose lock was released while an attempt was in flight.
  retry_on_busy: HashSet<JobId>,
  next_attempt: u64,
  once_seen: OnceDedup,
  forwarders: Vec<JoinHandle<()>>,
  event_tx: mpsc::Sender<RegistryEvent>,
  event_rx: mpsc::Receiver<RegistryEvent>,
  cmd_rx: mpsc::Receiver<RegistryCommand>,
  shutdown_rx: watch::Receiver<Option<ShutdownMode>>,
}

impl Registry {
  async fn run(&mut self) {
    info!(
      node = %self.node,
      known = self.known.len(),
      scheduled = self.jobs.len(),
      "Job registry started."
    );

    let mode = loop {
      tokio::select! {
        biased;

        Ok(()) = self.shutdown_rx.changed() => {
          let requested = *self.shutdown_rx.borrow();
          if let Some(mode) = requested {
            info!(?mode, "Job registry received shutdown signal.");
            break mode;
          }
        }

        maybe_cmd = self.cmd_rx.recv() => match maybe_cmd {
          Some(cmd) => self.handle_command(cmd).await,
          None => {
            warn!("All worker handles dropped. Stopping gracefully.");
            break ShutdownMode::Graceful;
          }
        },

        Some(event) = self.event_rx.recv() => self.handle_event(event),
      }
    };

    self.stop(mode).await;
  }

  async fn stop(&mut self, mode: ShutdownMode) {
    for forwarder in self.forwarders.drain(..) {
      forwarder.abort();
    }
    if let Err(e) = self.engine.shutdown(mode, None).await {
      warn!(error = %e, "Cron engine shutdown failed.");
    }

    let mut locks = Vec::new();
    for (_, entry) in self.jobs.drain() {
      if let Some(watcher) = entry.lost_watch {
        watcher.abort();
      }
      locks.extend(entry.lock);
    }
    // Attempts that won after the loop stopped must not keep their lock.
    self.event_rx.close();
    while let Ok(event) = self.event_rx.try_recv() {
      if let RegistryEvent::LockAcquired { lock, .. } = event {
        locks.push(Arc::new(lock));
      }
    }
    self.pending_locks.clear();
    self.retry_on_busy.clear();

    join_all(locks.iter().map(|lock| lock.unlock())).await;
    info!(released_locks = locks.len(), "Job registry stopped.");
  }

  // --- Queries ---

  async fn handle_command(&mut self, cmd: RegistryCommand) {
    match cmd {
      RegistryCommand::ListCmds { responder } => {
        let summaries = self.cmd_summaries(None).await;
        let _ = responder.send(summaries);
      }
      RegistryCommand::GetJob { job_id, responder } => {
        let result = match self.known.get(&job_id).cloned() {
          Some(job) => {
            let entry = self.jobs.get(&job_id);
            Ok(JobDetails {
              job: (*job).clone(),
              scheduled: entry.is_some(),
              lock_held: entry.is_some_and(|e| e.lock.is_some()),
              cmds: self.cmd_summaries(Some(&job_id)).await,
            })
          }
          None => Err(QueryError::JobNotFound(job_id)),
        };
        let _ = responder.send(result);
      }
      RegistryCommand::HeldLocks { responder } => {
        let mut held: Vec<JobId> = self
          .jobs
          .iter()
          .filter(|(_, entry)| entry.lock.is_some())
          .map(|(id, _)| id.clone())
          .collect();
        held.sort();
        let _ = responder.send(held);
      }
      RegistryCommand::GetMetricsSnapshot { responder } => {
        let _ = responder.send(self.metrics.snapshot());
      }
    }
  }

  async fn cmd_summaries(&self, only: Option<&JobId>) -> Vec<CmdSummary> {
    let snapshots: HashMap<EntryId, EntrySnapshot> = match self.engine.entries().await {
      Ok(entries) => entries.into_iter().map(|s| (s.id, s)).collect(),
      Err(e) => {
        warn!(error = %e, "Cron engine did not answer the entries query.");
        HashMap::new()
      }
    };

    let mut summaries: Vec<CmdSummary> = self
      .jobs
      .iter()
      .filter(|(job_id, _)| only.map_or(true, |wanted| wanted == *job_id))
      .flat_map(|(_, entry)| entry.cmds.iter())
      .map(|(id, cmd)| {
        let snapshot = snapshots.get(&cmd.entry_id);
        CmdSummary {
          id: id.clone(),
          spec: cmd.spec.clone(),
          entry_id: cmd.entry_id,
          next_fire: snapshot.and_then(|s| s.next_fire),
          running: snapshot.is_some_and(|s| s.running),
        }
      })
      .collect();
    summaries.sort_by(|a, b| a.id.cmp(&b.id));
    summaries
  }

  // --- Events ---

  fn handle_event(&mut self, event: RegistryEvent) {
    trace!(?event, "Registry event.");
    match event {
      RegistryEvent::JobPut(kv) => self.handle_job_put(kv),
      RegistryEvent::JobDeleted(key) => {
        let job_id = self
          .keys
          .remove(&key)
          .unwrap_or_else(|| store::last_segment(&key).to_string());
        info!(job_id = %job_id, %key, "Job definition deleted.");
        self.forget(&job_id);
      }
      RegistryEvent::LockReleased(job_id) => self.handle_lock_released(job_id),
      RegistryEvent::LockAcquired {
        job_id,
        attempt,
        lock,
      } => self.handle_lock_acquired(job_id, attempt, Arc::new(lock)),
      RegistryEvent::LockBusy { job_id, attempt } => {
        if self.pending_locks.get(&job_id) != Some(&attempt) {
          return;
        }
        self.pending_locks.remove(&job_id);
        AgentMetrics::incr(&self.metrics.locks_busy);
        if self.retry_on_busy.remove(&job_id) {
          debug!(job_id = %job_id, attempt, "Lock was released during the attempt, trying again.");
          self.handle_lock_released(job_id);
        } else {
          info!(job_id = %job_id, attempt, "Alone job is held by another node, not scheduling it here.");
        }
      }
      RegistryEvent::LockLost { job_id, attempt } => {
        let held = self
          .jobs
          .get(&job_id)
          .is_some_and(|e| e.lock.is_some() && e.lock_attempt == attempt);
        if !held {
          return;
        }
        AgentMetrics::incr(&self.metrics.locks_lost);
        warn!(job_id = %job_id, attempt, "Alone lock lost, unscheduling the job until it is released.");
        if let Some(entry) = self.jobs.remove(&job_id) {
          self.drop_entry(&job_id, entry);
        }
      }
      RegistryEvent::OnceRequested {
        key,
        mod_revision,
        request,
      } => self.handle_once(key, mod_revision, request),
      RegistryEvent::KillRequested(process) => {
        if self.services.tracker.kill(&process) {
          AgentMetrics::incr(&self.metrics.kills_delivered);
        } else {
          AgentMetrics::incr(&self.metrics.kills_failed);
        }
      }
    }
  }

  fn handle_job_put(&mut self, kv: KeyValue) {
    let job = match Job::from_kv(&kv) {
      Ok(job) => Arc::new(job),
      Err(e) => {
        AgentMetrics::incr(&self.metrics.invalid_definitions);
        warn!(key = %kv.key, error = %e, "Skipping malformed job definition.");
        return;
      }
    };
    debug!(job_id = %job.id, key = %kv.key, revision = kv.mod_revision, "Job definition received.");

    if let Some(previous) = self.keys.insert(kv.key.clone(), job.id.clone()) {
      if previous != job.id {
        info!(key = %kv.key, old = %previous, new = %job.id, "Job id changed under the same key.");
        self.forget(&previous);
      }
    }
    self.known.insert(job.id.clone(), job.clone());
    self.apply(job);
  }

  /// Brings the local schedule of `job` in line with its current definition.
  fn apply(&mut self, job: Arc<Job>) {
    let (cmds, invalid) = job.cmds(&self.node);
    for (timer_id, e) in invalid {
      AgentMetrics::incr(&self.metrics.invalid_definitions);
      warn!(job_id = %job.id, timer_id = %timer_id, error = %e, "Dropping timer with an invalid spec.");
    }

    if cmds.is_empty() {
      self.pending_locks.remove(&job.id);
      self.retry_on_busy.remove(&job.id);
      if let Some(entry) = self.jobs.remove(&job.id) {
        info!(job_id = %job.id, "Job has nothing to run on this node, unscheduled.");
        self.drop_entry(&job.id, entry);
      } else {
        debug!(job_id = %job.id, "Job has nothing to run on this node.");
      }
      return;
    }

    if job.is_alone() {
      let held = self.jobs.get(&job.id).map(|entry| entry.lock.is_some());
      match held {
        Some(true) => self.sync_cmds(&job, cmds),
        Some(false) => {
          info!(job_id = %job.id, "Job became Alone, unscheduling until its lock is acquired.");
          if let Some(entry) = self.jobs.remove(&job.id) {
            self.drop_entry(&job.id, entry);
          }
          self.start_lock_attempt(&job.id);
        }
        None if self.pending_locks.contains_key(&job.id) => {
          debug!(job_id = %job.id, "Lock attempt already in flight.");
        }
        None => self.start_lock_attempt(&job.id),
      }
      return;
    }

    // Invalidates an attempt started while the job was still Alone.
    self.pending_locks.remove(&job.id);
    self.retry_on_busy.remove(&job.id);
    let entry = self.jobs.entry(job.id.clone()).or_default();
    if let Some(lock) = entry.lock.take() {
      info!(job_id = %job.id, "Job is no longer Alone, releasing its lock.");
      if let Some(watcher) = entry.lost_watch.take() {
        watcher.abort();
      }
      spawn_unlock(lock);
    }
    self.sync_cmds(&job, cmds);
  }

  /// Diffs the scheduled Cmds of `job` against `cmds` by identity.
  ///
  /// Unchanged Cmds keep their engine entry and only see the new definition;
  /// Cmds whose spec changed are rescheduled; the rest are added or removed.
  fn sync_cmds(&mut self, job: &Arc<Job>, cmds: Vec<Cmd>) {
    let Some(entry) = self.jobs.get_mut(&job.id) else {
      return;
    };
    let mut wanted: HashMap<CmdId, Cmd> = cmds.into_iter().map(|c| (c.id.clone(), c)).collect();

    let engine = &self.engine;
    entry.cmds.retain(|id, scheduled| {
      let unchanged = wanted.get(id).is_some_and(|cmd| cmd.spec == scheduled.spec);
      if unchanged {
        *scheduled.slot.write() = job.clone();
        wanted.remove(id);
        true
      } else {
        engine.remove(scheduled.entry_id);
        debug!(cmd = %id, entry_id = scheduled.entry_id, "Cmd unscheduled.");
        false
      }
    });

    for (id, cmd) in wanted {
      match schedule_cmd(&self.engine, &self.services, &self.store, &self.config, job, cmd) {
        Ok(scheduled) => {
          info!(cmd = %id, entry_id = scheduled.entry_id, spec = %scheduled.spec, "Cmd scheduled.");
          entry.cmds.insert(id, scheduled);
        }
        Err(e) => error!(cmd = %id, error = %e, "Scheduling Cmd failed."),
      }
    }
  }

  /// Drops every trace of a job: definition, pending attempt, Cmds and lock.
  fn forget(&mut self, job_id: &JobId) {
    self.known.remove(job_id);
    self.pending_locks.remove(job_id);
    self.retry_on_busy.remove(job_id);
    if let Some(entry) = self.jobs.remove(job_id) {
      self.drop_entry(job_id, entry);
    }
  }

  fn drop_entry(&self, job_id: &JobId, entry: JobEntry) {
    for (id, cmd) in entry.cmds {
      self.engine.remove(cmd.entry_id);
      debug!(cmd = %id, entry_id = cmd.entry_id, "Cmd unscheduled.");
    }
    if let Some(watcher) = entry.lost_watch {
      watcher.abort();
    }
    if let Some(lock) = entry.lock {
      debug!(job_id = %job_id, "Releasing Alone lock.");
      spawn_unlock(lock);
    }
  }

  // --- Alone Locks ---

  fn start_lock_attempt(&mut self, job_id: &JobId) {
    self.next_attempt += 1;
    let attempt = self.next_attempt;
    self.pending_locks.insert(job_id.clone(), attempt);

    let lock = DistributedLock::new(
      self.store.clone(),
      format!("{}{}", self.config.lock_prefix, job_id),
      self.config.lock_ttl(),
    );
    let wait = self.config.lock_wait();
    let tx = self.event_tx.clone();
    let job_id = job_id.clone();
    debug!(job_id = %job_id, attempt, "Trying to acquire Alone lock.");

    tokio::spawn(async move {
      // Any existing claim means busy; never queue behind one.
      let outcome = match lock.is_contended().await {
        Ok(true) => Err(LockError::Busy(lock.name().to_string())),
        Ok(false) | Err(_) => lock.lock(wait).await,
      };
      let event = match outcome {
        Ok(()) => RegistryEvent::LockAcquired {
          job_id,
          attempt,
          lock,
        },
        Err(LockError::Busy(_)) => RegistryEvent::LockBusy { job_id, attempt },
        Err(e) => {
          warn!(job_id = %job_id, attempt, error = %e, "Alone lock attempt failed.");
          RegistryEvent::LockBusy { job_id, attempt }
        }
      };
      if let Err(mpsc::error::SendError(event)) = tx.send(event).await {
        if let RegistryEvent::LockAcquired { lock, .. } = event {
          lock.unlock().await;
        }
      }
    });
  }

  fn handle_lock_released(&mut self, job_id: JobId) {
    if self.jobs.contains_key(&job_id) {
      trace!(job_id = %job_id, "Lock release ignored, job already held here.");
      return;
    }
    if self.pending_locks.contains_key(&job_id) {
      // The attempt may already have seen the old claim.
      trace!(job_id = %job_id, "Lock released during an attempt, retrying if it comes back busy.");
      self.retry_on_busy.insert(job_id);
      return;
    }
    let Some(job) = self.known.get(&job_id).filter(|job| job.is_alone()).cloned() else {
      return;
    };
    debug!(job_id = %job_id, "Alone lock released elsewhere, trying to take over.");
    self.apply(job);
  }

  fn handle_lock_acquired(&mut self, job_id: JobId, attempt: u64, lock: Arc<DistributedLock>) {
    let current = self.pending_locks.get(&job_id) == Some(&attempt);
    if current {
      self.pending_locks.remove(&job_id);
      self.retry_on_busy.remove(&job_id);
    }
    let job = self.known.get(&job_id).filter(|job| job.is_alone()).cloned();

    let job = match job {
      Some(job) if current && !self.jobs.contains_key(&job_id) => job,
      _ => {
        debug!(job_id = %job_id, attempt, "Stale lock acquisition, releasing.");
        spawn_unlock(lock);
        return;
      }
    };
    let (cmds, _) = job.cmds(&self.node);
    if cmds.is_empty() {
      spawn_unlock(lock);
      return;
    }

    AgentMetrics::incr(&self.metrics.locks_acquired);
    info!(job_id = %job_id, attempt, "Alone lock acquired, scheduling the job on this node.");
    let entry = JobEntry {
      lost_watch: self.watch_lock_loss(&job_id, attempt, &lock),
      lock: Some(lock),
      lock_attempt: attempt,
      cmds: HashMap::new(),
    };
    self.jobs.insert(job_id, entry);
    self.sync_cmds(&job, cmds);
  }

  fn watch_lock_loss(
    &self,
    job_id: &JobId,
    attempt: u64,
    lock: &DistributedLock,
  ) -> Option<JoinHandle<()>> {
    let mut lost = lock.lost()?;
    let tx = self.event_tx.clone();
    let job_id = job_id.clone();
    Some(tokio::spawn(async move {
      loop {
        if *lost.borrow_and_update() {
          break;
        }
        // The keeper went away with the lock.
        if lost.changed().await.is_err() {
          return;
        }
      }
      let _ = tx.send(RegistryEvent::LockLost { job_id, attempt }).await;
    }))
  }

  // --- Once Runs ---

  fn handle_once(&mut self, key: String, mod_revision: Revision, request: OnceRequest) {
    if !self.once_seen.first_delivery(&key, mod_revision) {
      AgentMetrics::incr(&self.metrics.once_duplicates);
      debug!(%key, mod_revision, "Duplicate once-run delivery ignored.");
      return;
    }

    let task_id = request.task_id;
    let job = if request.job.has_target() {
      Arc::new(request.job)
    } else {
      match self.known.get(&request.job.id) {
        Some(job) => job.clone(),
        None => {
          warn!(%key, job_id = %request.job.id, "Once-run names an unknown job and carries no command, ignored.");
          return;
        }
      }
    };

    AgentMetrics::incr(&self.metrics.once_runs);
    info!(job_id = %job.id, %key, ?task_id, "Once-run requested.");
    task::spawn_once(self.services.clone(), job, task_id);
  }
}

fn schedule_cmd(
  engine: &CronEngine,
  services: &Arc<JobServices>,
  store: &SharedStore,
  config: &WorkerConfig,
  job: &Arc<Job>,
  cmd: Cmd,
) -> Result<ScheduledCmd, QueryError> {
  let slot: JobSlot = Arc::new(RwLock::new(job.clone()));
  let schedule: Arc<dyn Schedule> = if config.immediately_run {
    Arc::new(ImmediatelyFirst::new(cmd.schedule.clone()))
  } else {
    cmd.schedule.clone()
  };
  let window = Arc::new(DistributedLock::new(
    store.clone(),
    format!(
      "{}{}/{}",
      config.interval_lock_prefix, cmd.id.job_id, cmd.id.timer_id
    ),
    config.lock_ttl(),
  ));

  let runnable: Runnable = {
    let services = services.clone();
    let cmd_id = cmd.id.clone();
    let slot = slot.clone();
    let schedule = schedule.clone();
    Arc::new(move || -> JobFuture {
      Box::pin(task::run_cmd(
        services.clone(),
        cmd_id.clone(),
        slot.clone(),
        schedule.clone(),
        window.clone(),
      ))
    })
  };

  let entry_id = engine.schedule(cmd.id.to_string(), schedule, runnable)?;
  Ok(ScheduledCmd {
    spec: cmd.spec,
    entry_id,
    slot,
  })
}

fn spawn_unlock(lock: Arc<DistributedLock>) {
  tokio::spawn(async move {
    lock.unlock().await;
  });
}
