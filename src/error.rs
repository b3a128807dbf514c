use crate::job::JobId;

use std::io;

use thiserror::Error;

/// Errors produced while parsing a timer spec into a [`crate::schedule::TimerSchedule`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScheduleError {
  #[error("empty timer spec")]
  Empty,
  #[error("expected 6 fields (sec min hour dom month dow), found {0} in '{1}'")]
  FieldCount(usize, String),
  #[error("day-of-week value {0} out of range 0-6")]
  DayOfWeekRange(u32),
  #[error("unrecognized descriptor '{0}'")]
  UnknownDescriptor(String),
  #[error("invalid @every duration '{0}'")]
  InvalidDuration(String),
  #[error("invalid cron expression '{spec}': {reason}")]
  Invalid { spec: String, reason: String },
}

/// Errors returned by a [`crate::store::KvStore`] implementation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
  #[error("store connection failed: {0}")]
  Connection(String),
  #[error("store request failed: {0}")]
  Request(String),
  #[error("lease {0} not found or expired")]
  LeaseNotFound(i64),
  #[error("store request timed out")]
  Timeout,
}

/// Errors from the distributed lock.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LockError {
  /// The bounded wait elapsed while another holder owned the lock.
  #[error("lock '{0}' is held by another node")]
  Busy(String),
  #[error("lock store error: {0}")]
  Store(#[from] StoreError),
}

/// Errors about a single job: decoding its definition or running it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JobError {
  #[error("job '{key}' is not valid JSON: {reason}")]
  Decode { key: String, reason: String },
  #[error("job '{0}' has no id")]
  MissingId(String),
  #[error("job '{0}' has neither command nor script")]
  MissingCommand(JobId),
  #[error("job {job_id} task {task_id} ended with status {status}")]
  Unsuccessful {
    job_id: JobId,
    task_id: u64,
    status: crate::result::TaskStatus,
  },
  #[error("job {0} skipped this firing: {1}")]
  Skipped(JobId, String),
  #[error("job {0} panicked: {1}")]
  Panicked(JobId, String),
}

/// Errors raised while building a [`crate::worker::Worker`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BuildError {
  #[error("key prefix `{0}` must be non-empty and end with '/'")]
  InvalidPrefix(&'static str),
  #[error("`{0}` must be greater than zero")]
  ZeroDuration(&'static str),
  #[error("node identity could not be determined: {0}")]
  NodeIdentity(String),
}

/// Errors raised while starting the worker.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WorkerError {
  #[error("initial job load failed: {0}")]
  InitialLoad(StoreError),
  #[error("failed to watch '{prefix}': {source}")]
  Watch { prefix: String, source: StoreError },
}

/// Errors related to querying the running worker through its handle.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueryError {
  #[error("worker is no longer accepting commands")]
  WorkerShutdown,
  #[error("cron engine is stopped")]
  EngineShutdown,
  #[error("worker dropped the query without answering")]
  ResponseFailed,
  #[error("no job with id {0}")]
  JobNotFound(JobId),
}

/// Errors related to shutting down the cron engine or the worker.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ShutdownError {
  #[error("shutdown already requested")]
  SignalFailed,
  #[error("in-flight tasks did not finish before the shutdown deadline")]
  Timeout,
  #[error("background task panicked while stopping")]
  TaskPanic,
}

/// Errors loading the agent configuration file.
#[derive(Error, Debug)]
pub enum ConfigError {
  #[error("cannot read config file {path}: {source}")]
  Read { path: String, source: io::Error },
  #[error("cannot parse config file {path}: {source}")]
  Parse {
    path: String,
    source: toml::de::Error,
  },
}
