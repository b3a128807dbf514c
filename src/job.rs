//! Job, Timer and Cmd data model.
//!
//! Jobs are stored as JSON under the jobs prefix. A job with `n` enabled
//! timers that apply to this node materializes into `n` [`Cmd`]s, which are
//! what the cron engine actually schedules.

use crate::error::{JobError, ScheduleError};
use crate::node::NodeIdentity;
use crate::schedule::{self, TimerSchedule};
use crate::store::{self, KeyValue};

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Job identity, unique within the jobs prefix.
pub type JobId = String;

// --- Job Type ---

/// How a job is coordinated across the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "JobKindRepr", into = "u8")]
pub enum JobKind {
  /// Runs on every node its allow-lists name.
  #[default]
  Normal,
  /// Single instance cluster-wide: only the lock holder schedules it.
  Alone,
  /// At most one cluster-wide execution per schedule interval.
  Interval,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum JobKindRepr {
  Code(u8),
  Name(String),
}

impl TryFrom<JobKindRepr> for JobKind {
  type Error = String;

  fn try_from(repr: JobKindRepr) -> Result<Self, Self::Error> {
    match repr {
      JobKindRepr::Code(0) => Ok(JobKind::Normal),
      JobKindRepr::Code(1) => Ok(JobKind::Alone),
      JobKindRepr::Code(2) => Ok(JobKind::Interval),
      JobKindRepr::Code(other) => Err(format!("unknown job type {other}")),
      JobKindRepr::Name(name) => match name.to_ascii_lowercase().as_str() {
        "normal" | "common" => Ok(JobKind::Normal),
        "alone" | "single" => Ok(JobKind::Alone),
        "interval" => Ok(JobKind::Interval),
        other => Err(format!("unknown job type '{other}'")),
      },
    }
  }
}

impl From<JobKind> for u8 {
  fn from(kind: JobKind) -> Self {
    match kind {
      JobKind::Normal => 0,
      JobKind::Alone => 1,
      JobKind::Interval => 2,
    }
  }
}

// --- Timer ---

/// One schedule rule of a job.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Timer {
  pub id: String,
  /// Cron spec, see [`crate::schedule::parse`].
  #[serde(alias = "cron")]
  pub timer: String,
  /// Narrows the job's allow-list; empty means no further restriction.
  pub nodes: Vec<String>,
  pub pause: bool,
}

// --- Job ---

/// A job definition as stored in the key-value store.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Job {
  pub id: JobId,
  pub name: String,
  pub group: String,
  #[serde(alias = "cmd")]
  pub command: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub script: Option<PathBuf>,
  /// Unix account to run as; empty runs as the agent's own user.
  pub user: String,
  #[serde(alias = "rules")]
  pub timers: Vec<Timer>,
  pub pause: bool,
  /// Hard timeout in seconds; `0` is unbounded.
  pub timeout: u64,
  pub retry: u32,
  /// Seconds between retry attempts.
  pub interval: u64,
  #[serde(alias = "kind")]
  pub job_type: JobKind,
  pub nodes: Vec<String>,
}

impl Job {
  /// Decodes the job stored at `kv`. An empty `id` is taken from the key.
  pub fn from_kv(kv: &KeyValue) -> Result<Self, JobError> {
    let mut job: Job = serde_json::from_str(&kv.value).map_err(|e| JobError::Decode {
      key: kv.key.clone(),
      reason: e.to_string(),
    })?;
    if job.id.is_empty() {
      job.id = store::last_segment(&kv.key).to_string();
    }
    job.validate(&kv.key)?;
    Ok(job)
  }

  pub(crate) fn validate(&self, key: &str) -> Result<(), JobError> {
    if self.id.is_empty() {
      return Err(JobError::MissingId(key.to_string()));
    }
    if !self.has_target() {
      return Err(JobError::MissingCommand(self.id.clone()));
    }
    Ok(())
  }

  pub fn has_target(&self) -> bool {
    !self.command.trim().is_empty() || self.script.is_some()
  }

  pub fn is_alone(&self) -> bool {
    self.job_type == JobKind::Alone
  }

  pub fn timeout(&self) -> Option<Duration> {
    (self.timeout > 0).then(|| Duration::from_secs(self.timeout))
  }

  pub fn retry_interval(&self) -> Duration {
    Duration::from_secs(self.interval)
  }

  /// Materializes the Cmds this job contributes on `node`.
  ///
  /// A paused job, or one whose allow-list excludes `node`, yields nothing.
  /// Timers with an invalid spec are returned separately and do not prevent
  /// the others from being scheduled.
  pub fn cmds(&self, node: &NodeIdentity) -> (Vec<Cmd>, Vec<(String, ScheduleError)>) {
    let mut cmds = Vec::new();
    let mut invalid = Vec::new();
    if self.pause || !node.matches(&self.nodes) {
      return (cmds, invalid);
    }

    for (index, timer) in self.timers.iter().enumerate() {
      if timer.pause || !node.matches(&timer.nodes) {
        continue;
      }
      let timer_id = if timer.id.is_empty() {
        index.to_string()
      } else {
        timer.id.clone()
      };
      match schedule::parse(&timer.timer) {
        Ok(parsed) => cmds.push(Cmd {
          id: CmdId {
            job_id: self.id.clone(),
            timer_id,
          },
          spec: timer.timer.clone(),
          schedule: Arc::new(parsed),
        }),
        Err(e) => invalid.push((timer_id, e)),
      }
    }
    (cmds, invalid)
  }
}

// --- Cmd ---

/// Identity of a scheduled (job, timer) pairing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CmdId {
  pub job_id: JobId,
  pub timer_id: String,
}

impl fmt::Display for CmdId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}/{}", self.job_id, self.timer_id)
  }
}

/// A materialized (job, timer) pairing with its parsed schedule.
#[derive(Debug, Clone)]
pub struct Cmd {
  pub id: CmdId,
  /// The spec string the schedule was parsed from; a change forces a reschedule.
  pub spec: String,
  pub schedule: Arc<TimerSchedule>,
}

// --- Once Requests ---

/// Payload of a once-run request: a job snapshot plus an optional caller-chosen task id.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OnceRequest {
  #[serde(flatten)]
  pub job: Job,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub task_id: Option<u64>,
}

impl OnceRequest {
  /// Decodes a once-run request. The job id falls back to the key's last segment.
  pub fn from_kv(kv: &KeyValue) -> Result<Self, JobError> {
    let mut request: OnceRequest = if kv.value.trim().is_empty() {
      OnceRequest::default()
    } else {
      serde_json::from_str(&kv.value).map_err(|e| JobError::Decode {
        key: kv.key.clone(),
        reason: e.to_string(),
      })?
    };
    if request.job.id.is_empty() {
      request.job.id = store::last_segment(&kv.key).to_string();
    }
    if request.job.id.is_empty() {
      return Err(JobError::MissingId(kv.key.clone()));
    }
    Ok(request)
  }
}
