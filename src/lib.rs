//! CronKeeper: a per-node distributed cron worker.
//!
//! Each node runs one [`Worker`]. It keeps a local cron schedule in step with
//! job definitions held in a watchable key-value store (etcd in production,
//! [`MemoryStore`] in tests and single-node mode), runs each firing as an OS
//! process with a timeout and a retry policy, and records the outcome.
//!
//! # Features
//!
//! - Six-field cron specs with seconds plus `@hourly`-style and `@every <duration>` descriptors.
//! - A single timer loop over a handle-based priority queue; Cmds are added
//!   and removed without restarting it, a still-running Cmd skips its next
//!   firing, and panics are recovered where a firing runs.
//! - Alone jobs: a lease-bound distributed lock makes sure at most one node
//!   schedules them; the other nodes take over when the lock is released.
//! - Interval jobs: at most one cluster-wide execution per schedule interval.
//! - Process records with leases, so a crashed node leaves no permanent
//!   "running" state, and remote kill through a `killed` flag.
//! - Once-run requests, deduplicated per store revision.
//! - Task results with status, logs and timestamps, kept for a bounded time.
//! - Metrics snapshots, structured `tracing` logs, graceful and forced shutdown.
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use cronkeeper::{KvStore, MemoryStore, WorkerBuilder, WorkerConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!   let store = Arc::new(MemoryStore::new());
//!   let handle = WorkerBuilder::new(store.clone())
//!     .config(WorkerConfig::default())
//!     .build()?
//!     .run()
//!     .await?;
//!
//!   // Any writer can define jobs; the worker picks them up through its watch.
//!   store
//!     .put(
//!       "/worker/jobs/backup",
//!       r#"{"id":"backup","command":"echo hello","timers":[{"id":"t1","timer":"*/5 * * * * *"}]}"#
//!         .to_string(),
//!       None,
//!     )
//!     .await?;
//!
//!   tokio::time::sleep(Duration::from_secs(12)).await;
//!   println!("{:#?}", handle.list_cmds().await?);
//!   println!("{:#?}", handle.metrics_snapshot().await?);
//!
//!   handle.shutdown_graceful(Some(Duration::from_secs(10))).await?;
//!   Ok(())
//! }
//! ```
//!
//! # Store layout
//!
//! | Prefix (default) | Contents |
//! |---|---|
//! | `/worker/jobs/` | Job definitions (JSON) |
//! | `/worker/lock/` | Alone-job locks |
//! | `/worker/interval/` | Interval-job windows |
//! | `/worker/once/{hostname}/` | Once-run requests for one host |
//! | `/worker/proc/{ip:hostname}/{job}/{task}/{pid}` | In-flight processes, `{"time","killed"}` |
//! | `/worker/result/{job}/{task}` | Task results |

pub mod command;
pub mod config;
pub mod cron;
pub mod error;
pub mod exec;
pub mod job;
pub mod lock;
pub mod metrics;
pub mod node;
pub mod proc;
pub mod result;
pub mod schedule;
pub mod store;
pub mod task;
pub mod telemetry;
pub mod worker;

// --- Public Re-exports ---

pub use config::{AgentConfig, EtcdConfig, LogConfig, WorkerConfig};
pub use cron::{CronEngine, EntryId, EntrySnapshot};
pub use command::ShutdownMode;
pub use error::{
  BuildError, ConfigError, JobError, LockError, QueryError, ScheduleError, ShutdownError,
  StoreError, WorkerError,
};
pub use job::{Cmd, CmdId, Job, JobId, JobKind, OnceRequest, Timer};
pub use lock::DistributedLock;
pub use metrics::{AgentMetrics, MetricsSnapshot};
pub use node::NodeIdentity;
pub use result::{ResultStore, TaskResult, TaskStatus};
pub use schedule::{ImmediatelyFirst, Schedule, TimerSchedule};
pub use store::{KvStore, MemoryStore, SharedStore};
#[cfg(feature = "etcd")]
pub use store::EtcdStore;
pub use task::TaskId;
pub use worker::{CmdSummary, JobDetails, Worker, WorkerBuilder, WorkerHandle};
