use crate::cron::{EntryId, EntrySnapshot, Runnable};
use crate::error::QueryError;
use crate::job::{JobId, OnceRequest};
use crate::lock::DistributedLock;
use crate::metrics::MetricsSnapshot;
use crate::proc::Process;
use crate::schedule::Schedule;
use crate::store::{KeyValue, Revision};
use crate::worker::{CmdSummary, JobDetails};

use std::sync::Arc;

use tokio::sync::oneshot;

/// Requested shutdown mode, broadcast over a `watch` channel.
/// `None` on the channel means the component is running normally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
  /// Stop firing new runs and wait for in-flight ones to complete.
  Graceful,
  /// Stop as soon as possible, aborting in-flight runs.
  Force,
}

// --- Cron Engine ---

/// Commands sent from a [`crate::cron::CronEngine`] handle to its timing loop.
pub(crate) enum EngineCommand {
  Schedule {
    id: EntryId,
    name: String,
    schedule: Arc<dyn Schedule>,
    runnable: Runnable,
  },
  Remove(EntryId),
  Entries {
    responder: oneshot::Sender<Vec<EntrySnapshot>>,
  },
}

impl std::fmt::Debug for EngineCommand {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      EngineCommand::Schedule { id, name, schedule, .. } => f
        .debug_struct("Schedule")
        .field("id", id)
        .field("name", name)
        .field("schedule", schedule)
        .finish_non_exhaustive(),
      EngineCommand::Remove(id) => f.debug_tuple("Remove").field(id).finish(),
      EngineCommand::Entries { .. } => f.write_str("Entries"),
    }
  }
}

// --- Job Registry ---

/// Typed events fed to the registry actor.
///
/// Watch tasks and lock-attempt tasks only ever produce these; the actor is
/// the single owner of the job and cmd maps.
#[derive(Debug)]
pub(crate) enum RegistryEvent {
  /// A job definition was created or modified.
  JobPut(KeyValue),
  /// A job definition key was deleted; carries the store key.
  JobDeleted(String),
  /// A lock key under the lock prefix was deleted.
  LockReleased(JobId),
  LockAcquired {
    job_id: JobId,
    attempt: u64,
    lock: DistributedLock,
  },
  LockBusy {
    job_id: JobId,
    attempt: u64,
  },
  /// Renewal of a held lock's lease failed.
  LockLost {
    job_id: JobId,
    attempt: u64,
  },
  OnceRequested {
    key: String,
    mod_revision: Revision,
    request: OnceRequest,
  },
  KillRequested(Process),
}

/// Queries sent from a [`crate::worker::WorkerHandle`] to the registry actor.
#[derive(Debug)]
pub(crate) enum RegistryCommand {
  ListCmds {
    responder: oneshot::Sender<Vec<CmdSummary>>,
  },
  GetJob {
    job_id: JobId,
    responder: oneshot::Sender<Result<JobDetails, QueryError>>,
  },
  HeldLocks {
    responder: oneshot::Sender<Vec<JobId>>,
  },
  GetMetricsSnapshot {
    responder: oneshot::Sender<MetricsSnapshot>,
  },
}
