//! The cron engine: one timing loop over a handle-based priority queue.
//!
//! Entries are added and removed through a cheap, cloneable [`CronEngine`]
//! handle without restarting the loop. Each due entry runs on its own Tokio
//! task, so a slow run never delays the others. A run that is still in flight
//! when its entry comes due again causes that firing to be skipped, and a
//! panic inside a run is recovered at the call site.

use crate::command::{EngineCommand, ShutdownMode};
use crate::error::{JobError, QueryError, ShutdownError};
use crate::metrics::AgentMetrics;
use crate::schedule::Schedule;
use crate::telemetry::panic_message;

use std::cmp::Reverse;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use priority_queue::PriorityQueue;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::sleep;
use tracing::{debug, error, info, info_span, trace, warn, Instrument};

/// Opaque handle to a scheduled entry.
pub type EntryId = u64;

/// The future produced by one run of an entry.
pub type JobFuture = Pin<Box<dyn Future<Output = Result<(), JobError>> + Send>>;

/// What an entry runs each time it fires.
pub type Runnable = Arc<dyn Fn() -> JobFuture + Send + Sync>;

const IDLE_SLEEP: Duration = Duration::from_secs(60 * 60 * 24 * 7);
const MIN_SLEEP: Duration = Duration::from_millis(1);

/// Point-in-time view of one entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntrySnapshot {
  pub id: EntryId,
  pub name: String,
  pub next_fire: Option<DateTime<Utc>>,
  pub running: bool,
}

// --- Handle ---

/// Handle to a running cron engine. Clones share the same engine.
#[derive(Debug, Clone)]
pub struct CronEngine {
  cmd_tx: mpsc::UnboundedSender<EngineCommand>,
  shutdown_tx: Arc<watch::Sender<Option<ShutdownMode>>>,
  next_id: Arc<AtomicU64>,
  loop_handle: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl CronEngine {
  /// Spawns the timing loop on the current Tokio runtime.
  pub fn start(metrics: AgentMetrics) -> Self {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (shutdown_tx, shutdown_rx) = watch::channel(None);

    let mut coordinator = Coordinator {
      entries: HashMap::new(),
      pq: PriorityQueue::new(),
      cmd_rx,
      shutdown_rx,
      in_flight: JoinSet::new(),
      metrics,
    };
    let loop_handle = tokio::spawn(async move {
      coordinator.run().await;
    });

    Self {
      cmd_tx,
      shutdown_tx: Arc::new(shutdown_tx),
      next_id: Arc::new(AtomicU64::new(1)),
      loop_handle: Arc::new(Mutex::new(Some(loop_handle))),
    }
  }

  /// Adds an entry. Its first fire time is computed from the current time.
  ///
  /// # Errors
  ///
  /// - [`QueryError::EngineShutdown`]: the timing loop has stopped.
  pub fn schedule<S: Schedule>(
    &self,
    name: impl Into<String>,
    schedule: S,
    runnable: Runnable,
  ) -> Result<EntryId, QueryError> {
    let id = self.next_id.fetch_add(1, AtomicOrdering::Relaxed);
    self
      .cmd_tx
      .send(EngineCommand::Schedule {
        id,
        name: name.into(),
        schedule: Arc::new(schedule),
        runnable,
      })
      .map_err(|_| QueryError::EngineShutdown)?;
    Ok(id)
  }

  /// Removes an entry. Removing an unknown entry is a no-op; a run already in
  /// flight is not interrupted.
  pub fn remove(&self, id: EntryId) {
    if self.cmd_tx.send(EngineCommand::Remove(id)).is_err() {
      debug!(entry_id = id, "Remove ignored, cron engine already stopped.");
    }
  }

  /// Snapshots every entry, ordered by id.
  pub async fn entries(&self) -> Result<Vec<EntrySnapshot>, QueryError> {
    let (responder, response_rx) = oneshot::channel();
    self
      .cmd_tx
      .send(EngineCommand::Entries { responder })
      .map_err(|_| QueryError::EngineShutdown)?;
    response_rx.await.map_err(|_| QueryError::ResponseFailed)
  }

  /// Stops the timing loop.
  ///
  /// `Graceful` waits for in-flight runs, `Force` aborts them. Calling this
  /// on an engine that is already stopped succeeds.
  ///
  /// # Errors
  ///
  /// - [`ShutdownError::Timeout`]: the loop did not finish within `timeout`.
  /// - [`ShutdownError::TaskPanic`]: the loop task panicked.
  pub async fn shutdown(
    &self,
    mode: ShutdownMode,
    timeout: Option<Duration>,
  ) -> Result<(), ShutdownError> {
    let Some(handle) = self.loop_handle.lock().await.take() else {
      debug!("Cron engine already shut down.");
      return Ok(());
    };
    info!(?mode, "Shutting down cron engine.");
    // The loop may already have exited on its own; joining below still works.
    let _ = self.shutdown_tx.send(Some(mode));

    let joined = match timeout {
      Some(limit) => tokio::time::timeout(limit, handle)
        .await
        .map_err(|_| ShutdownError::Timeout)?,
      None => handle.await,
    };
    joined.map_err(|e| {
      error!(error = ?e, "Cron engine loop panicked.");
      ShutdownError::TaskPanic
    })
  }
}

// --- Timing Loop ---

struct Entry {
  name: String,
  schedule: Arc<dyn Schedule>,
  runnable: Runnable,
  next: Option<DateTime<Utc>>,
  running: Arc<AtomicBool>,
}

/// Clears an entry's in-flight flag when its run ends, however it ends.
struct RunningGuard(Arc<AtomicBool>);

impl Drop for RunningGuard {
  fn drop(&mut self) {
    self.0.store(false, AtomicOrdering::Release);
  }
}

struct Coordinator {
  entries: HashMap<EntryId, Entry>,
  pq: PriorityQueue<EntryId, Reverse<DateTime<Utc>>>,
  cmd_rx: mpsc::UnboundedReceiver<EngineCommand>,
  shutdown_rx: watch::Receiver<Option<ShutdownMode>>,
  in_flight: JoinSet<()>,
  metrics: AgentMetrics,
}

impl Coordinator {
  async fn run(&mut self) {
    info!("Cron engine started.");

    let mode = loop {
      let sleep_duration = self.calculate_sleep();

      tokio::select! {
        biased;

        Ok(()) = self.shutdown_rx.changed() => {
          let requested = *self.shutdown_rx.borrow();
          if let Some(mode) = requested {
            info!(?mode, "Cron engine received shutdown signal.");
            break mode;
          }
        }

        maybe_cmd = self.cmd_rx.recv() => match maybe_cmd {
          Some(cmd) => self.handle_command(cmd),
          None => {
            warn!("All cron engine handles dropped. Stopping gracefully.");
            break ShutdownMode::Graceful;
          }
        },

        Some(joined) = self.in_flight.join_next(), if !self.in_flight.is_empty() => {
          Self::log_join(joined);
        }

        _ = sleep(sleep_duration) => {
          trace!("Timer fired.");
          self.fire_due();
        }
      }
    };

    match mode {
      ShutdownMode::Force => {
        info!(in_flight = self.in_flight.len(), "Aborting in-flight runs.");
        self.in_flight.abort_all();
      }
      ShutdownMode::Graceful => {
        info!(in_flight = self.in_flight.len(), "Waiting for in-flight runs to complete.");
      }
    }
    while let Some(joined) = self.in_flight.join_next().await {
      Self::log_join(joined);
    }
    self
      .metrics
      .entries_scheduled_current
      .store(0, AtomicOrdering::Relaxed);
    info!("Cron engine stopped.");
  }

  fn log_join(joined: Result<(), JoinError>) {
    if let Err(e) = joined {
      if e.is_cancelled() {
        debug!("In-flight run was aborted.");
      } else {
        error!(error = ?e, "In-flight run task failed.");
      }
    }
  }

  fn handle_command(&mut self, cmd: EngineCommand) {
    match cmd {
      EngineCommand::Schedule {
        id,
        name,
        schedule,
        runnable,
      } => {
        let next = schedule.next_after(Utc::now());
        let Some(next_fire) = next else {
          warn!(entry_id = id, %name, "Schedule yields no fire time, entry discarded.");
          return;
        };
        debug!(entry_id = id, %name, %next_fire, "Entry scheduled.");
        self.entries.insert(
          id,
          Entry {
            name,
            schedule,
            runnable,
            next,
            running: Arc::new(AtomicBool::new(false)),
          },
        );
        self.pq.push(id, Reverse(next_fire));
      }
      EngineCommand::Remove(id) => {
        if let Some(entry) = self.entries.remove(&id) {
          self.pq.remove(&id);
          debug!(entry_id = id, name = %entry.name, "Entry removed.");
        } else {
          trace!(entry_id = id, "Remove for unknown entry.");
        }
      }
      EngineCommand::Entries { responder } => {
        let mut snapshots: Vec<EntrySnapshot> = self
          .entries
          .iter()
          .map(|(id, entry)| EntrySnapshot {
            id: *id,
            name: entry.name.clone(),
            next_fire: entry.next,
            running: entry.running.load(AtomicOrdering::Acquire),
          })
          .collect();
        snapshots.sort_by_key(|s| s.id);
        let _ = responder.send(snapshots);
      }
    }
    self
      .metrics
      .entries_scheduled_current
      .store(self.entries.len(), AtomicOrdering::Relaxed);
  }

  fn calculate_sleep(&self) -> Duration {
    match self.pq.peek() {
      Some((_, Reverse(next_fire))) => {
        let now = Utc::now();
        if *next_fire <= now {
          Duration::ZERO
        } else {
          (*next_fire - now)
            .to_std()
            .map(|d| d.max(MIN_SLEEP))
            .unwrap_or(MIN_SLEEP)
        }
      }
      None => IDLE_SLEEP,
    }
  }

  /// Fires every entry due at or before now and reinserts it at its next time.
  fn fire_due(&mut self) {
    let now = Utc::now();
    loop {
      let id = match self.pq.peek() {
        Some((id, Reverse(at))) if *at <= now => *id,
        _ => break,
      };
      self.pq.pop();

      let Some(entry) = self.entries.get_mut(&id) else {
        trace!(entry_id = id, "Popped an entry that no longer exists.");
        continue;
      };

      Self::fire(id, entry, &mut self.in_flight, &self.metrics);

      let next = entry.schedule.next_after(now);
      entry.next = next;
      match next {
        Some(next_fire) => {
          self.pq.push(id, Reverse(next_fire));
        }
        None => {
          info!(entry_id = id, name = %entry.name, "Schedule exhausted, entry retired.");
          self.entries.remove(&id);
        }
      }
    }
    self
      .metrics
      .entries_scheduled_current
      .store(self.entries.len(), AtomicOrdering::Relaxed);
  }

  fn fire(id: EntryId, entry: &Entry, in_flight: &mut JoinSet<()>, metrics: &AgentMetrics) {
    if entry.running.swap(true, AtomicOrdering::AcqRel) {
      AgentMetrics::incr(&metrics.entries_skipped_running);
      info!(entry_id = id, name = %entry.name, "Previous run still in flight, skipping this firing.");
      return;
    }
    AgentMetrics::incr(&metrics.entries_fired);

    let guard = RunningGuard(entry.running.clone());
    let runnable = entry.runnable.clone();
    let metrics = metrics.clone();
    let span = info_span!("cron_entry", entry_id = id, name = %entry.name);

    in_flight.spawn(
      async move {
        let _guard = guard;
        let outcome = AssertUnwindSafe(async move { runnable().await })
          .catch_unwind()
          .await;
        match outcome {
          Ok(Ok(())) => debug!("Run completed."),
          Ok(Err(e)) => warn!(error = %e, "Run finished with an error."),
          Err(payload) => {
            AgentMetrics::incr(&metrics.entries_panicked);
            error!(panic = %panic_message(payload.as_ref()), "Run panicked, recovered.");
          }
        }
      }
      .instrument(span),
    );
  }
}
