//! Tasks: one per firing or once-run, from `processing` to a terminal result.

use crate::error::{JobError, LockError};
use crate::exec::{AttemptOutcome, Executor};
use crate::job::{CmdId, Job, JobKind};
use crate::lock::DistributedLock;
use crate::metrics::AgentMetrics;
use crate::node::NodeIdentity;
use crate::proc::ProcessTracker;
use crate::result::{ResultStore, TaskStatus};
use crate::schedule::Schedule;
use crate::telemetry::panic_message;

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{error, info, info_span, warn, Instrument};

/// Unique, roughly time-ordered task identifier.
pub type TaskId = u64;

/// The job definition a scheduled Cmd runs with; swapped in place when the job is modified.
pub type JobSlot = Arc<RwLock<Arc<Job>>>;

const INTERVAL_LOCK_WAIT: Duration = Duration::from_millis(500);

// --- Task Ids ---

const SEQUENCE_BITS: u32 = 8;
const MACHINE_BITS: u32 = 16;
const SEQUENCE_MASK: u64 = (1 << SEQUENCE_BITS) - 1;

#[derive(Debug, Default)]
struct IdState {
  elapsed: u64,
  sequence: u64,
}

/// Sonyflake-style id generator.
///
/// Layout (high to low): 39 bits of 10 ms units since 2020-01-01 UTC,
/// 8 bits of sequence, 16 bits of machine id. Ids from one generator are
/// strictly increasing; when a 10 ms unit runs out of sequence numbers the
/// generator borrows from the next unit instead of sleeping.
#[derive(Debug)]
pub struct TaskIdGenerator {
  machine_id: u16,
  epoch: DateTime<Utc>,
  state: Mutex<IdState>,
}

impl TaskIdGenerator {
  pub fn new(machine_id: u16) -> Self {
    // 2020-01-01T00:00:00Z
    let epoch = DateTime::from_timestamp(1_577_836_800, 0).unwrap_or_default();
    Self {
      machine_id,
      epoch,
      state: Mutex::new(IdState::default()),
    }
  }

  pub fn next_id(&self) -> TaskId {
    let now_units = ((Utc::now() - self.epoch).num_milliseconds().max(0) / 10) as u64;
    let mut state = self.state.lock();
    if now_units > state.elapsed {
      state.elapsed = now_units;
      state.sequence = 0;
    } else {
      state.sequence = (state.sequence + 1) & SEQUENCE_MASK;
      if state.sequence == 0 {
        state.elapsed += 1;
      }
    }
    (state.elapsed << (SEQUENCE_BITS + MACHINE_BITS))
      | (state.sequence << MACHINE_BITS)
      | u64::from(self.machine_id)
  }
}

// --- Task ---

/// One execution of a job.
#[derive(Debug, Clone)]
pub struct Task {
  pub id: TaskId,
  pub job: Arc<Job>,
  /// Node id (`ip:hostname`) executing the task.
  pub run_on: String,
  pub executed_at: DateTime<Utc>,
}

/// Collaborators a task needs, passed explicitly instead of living inside the job.
#[derive(Debug)]
pub struct JobServices {
  pub node: NodeIdentity,
  pub tracker: Arc<ProcessTracker>,
  pub results: ResultStore,
  pub executor: Executor,
  pub ids: TaskIdGenerator,
  pub metrics: AgentMetrics,
  pub lock_wait: Duration,
}

/// Runs one task of `job` to completion and persists its result.
///
/// Writes `processing`, runs the retry loop, then writes the final attempt's
/// status and logs. A panic inside execution is recovered and persisted as
/// `failed`. Returns the terminal status, or an error when it is not `success`.
pub async fn run_task(
  services: &JobServices,
  job: Arc<Job>,
  task_id: Option<TaskId>,
) -> Result<TaskStatus, JobError> {
  let task = Task {
    id: task_id.unwrap_or_else(|| services.ids.next_id()),
    run_on: services.node.id(),
    executed_at: Utc::now(),
    job,
  };
  let job_id = task.job.id.clone();
  AgentMetrics::incr(&services.metrics.tasks_started);
  info!(job_id = %job_id, task_id = task.id, "Task started.");

  if let Err(e) = services
    .results
    .set_status(&task, TaskStatus::Processing, String::new())
    .await
  {
    warn!(job_id = %job_id, task_id = task.id, error = %e, "Writing processing status failed.");
  }

  let started = Instant::now();
  let execution = services
    .executor
    .run_with_retry(&task.job, task.id, &services.tracker, &services.metrics);
  let outcome = match AssertUnwindSafe(execution).catch_unwind().await {
    Ok(outcome) => outcome,
    Err(payload) => {
      let panicked = JobError::Panicked(job_id.clone(), panic_message(payload.as_ref()));
      AgentMetrics::incr(&services.metrics.tasks_panicked);
      error!(task_id = task.id, error = %panicked, "Task panicked, recorded as failed.");
      AttemptOutcome {
        status: TaskStatus::Failed,
        logs: panicked.to_string(),
        killed: false,
        attempts: 1,
      }
    }
  };
  let elapsed = started.elapsed();
  services.metrics.task_execution_duration.record(elapsed);

  let counter = match outcome.status {
    TaskStatus::Success => &services.metrics.tasks_succeeded,
    TaskStatus::Timeout => &services.metrics.tasks_timed_out,
    _ => &services.metrics.tasks_failed,
  };
  AgentMetrics::incr(counter);

  if let Err(e) = services
    .results
    .set_status(&task, outcome.status, outcome.logs)
    .await
  {
    warn!(job_id = %job_id, task_id = task.id, error = %e, "Writing final status failed.");
  }
  info!(
    job_id = %job_id,
    task_id = task.id,
    status = %outcome.status,
    attempts = outcome.attempts,
    duration_ms = elapsed.as_millis() as u64,
    "Task finished."
  );

  match outcome.status {
    TaskStatus::Success => Ok(TaskStatus::Success),
    status => Err(JobError::Unsuccessful {
      job_id,
      task_id: task.id,
      status,
    }),
  }
}

/// Runs one scheduled firing of a Cmd.
///
/// Interval-limited jobs first take a one-shot window lock that lasts until
/// the Cmd's next fire; when another node holds the window, the firing is skipped.
pub async fn run_cmd(
  services: Arc<JobServices>,
  cmd_id: CmdId,
  slot: JobSlot,
  schedule: Arc<dyn Schedule>,
  window: Arc<DistributedLock>,
) -> Result<(), JobError> {
  let job = slot.read().clone();

  if job.job_type == JobKind::Interval {
    let now = Utc::now();
    let hold = schedule
      .next_after(now)
      .and_then(|next| (next - now).to_std().ok())
      .unwrap_or(Duration::from_secs(1));
    let wait = services.lock_wait.min(INTERVAL_LOCK_WAIT);
    if let Err(e) = window.lock_once(wait, hold).await {
      AgentMetrics::incr(&services.metrics.tasks_skipped_interval);
      match &e {
        LockError::Busy(_) => info!(cmd = %cmd_id, "Interval already claimed by another node, skipping."),
        LockError::Store(_) => warn!(cmd = %cmd_id, error = %e, "Interval lock failed, skipping."),
      }
      return Err(JobError::Skipped(job.id.clone(), e.to_string()));
    }
  }

  run_task(&services, job, None).await.map(|_| ())
}

/// Runs a once-run request on a detached task.
pub fn spawn_once(services: Arc<JobServices>, job: Arc<Job>, task_id: Option<TaskId>) -> JoinHandle<()> {
  let span = info_span!("once_run", job_id = %job.id);
  tokio::spawn(
    async move {
      let job_id = job.id.clone();
      let run = AssertUnwindSafe(run_task(&services, job, task_id)).catch_unwind();
      match run.await {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => warn!(error = %e, "Once-run unsuccessful."),
        Err(payload) => {
          AgentMetrics::incr(&services.metrics.tasks_panicked);
          error!(job_id = %job_id, panic = %panic_message(payload.as_ref()), "Once-run panicked, recovered.");
        }
      }
    }
    .instrument(span),
  )
}
