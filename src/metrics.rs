use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

// --- Duration accumulator ---

/// Lock-free count and total of observed durations. No buckets.
#[derive(Debug, Default)]
pub struct SimpleHistogram {
  count: AtomicUsize,
  sum_micros: AtomicUsize,
}

impl SimpleHistogram {
  pub fn record(&self, duration: Duration) {
    self.count.fetch_add(1, Ordering::Relaxed);
    self.sum_micros.fetch_add(
      duration.as_micros().try_into().unwrap_or(usize::MAX),
      Ordering::Relaxed,
    );
  }

  pub fn get_count(&self) -> usize {
    self.count.load(Ordering::Relaxed)
  }

  /// Total in microseconds, saturating.
  pub fn get_sum_micros(&self) -> usize {
    self.sum_micros.load(Ordering::Relaxed)
  }
}

// --- Main Metrics Struct (Internal State) ---

/// Counters shared by the cron engine, the task pipeline and the job registry.
///
/// Cloning only clones the `Arc`s, so every clone observes the same values.
#[derive(Debug, Clone, Default)]
pub struct AgentMetrics {
  // --- Cron engine ---
  /// Entries currently held by the cron engine (gauge).
  pub entries_scheduled_current: Arc<AtomicUsize>,
  /// Times an entry's runnable was started.
  pub entries_fired: Arc<AtomicUsize>,
  /// Firings skipped because the previous run of the same entry was still in flight.
  pub entries_skipped_running: Arc<AtomicUsize>,
  /// Panics recovered at the cron engine's call site.
  pub entries_panicked: Arc<AtomicUsize>,

  // --- Tasks ---
  pub tasks_started: Arc<AtomicUsize>,
  pub tasks_succeeded: Arc<AtomicUsize>,
  pub tasks_failed: Arc<AtomicUsize>,
  pub tasks_timed_out: Arc<AtomicUsize>,
  /// Attempts beyond the first one.
  pub task_retries: Arc<AtomicUsize>,
  /// Firings of interval-limited jobs skipped because another node ran this interval.
  pub tasks_skipped_interval: Arc<AtomicUsize>,
  /// Panics recovered inside the task pipeline and persisted as `failed`.
  pub tasks_panicked: Arc<AtomicUsize>,

  // --- Registry ---
  pub once_runs: Arc<AtomicUsize>,
  /// Once-run deliveries ignored as duplicates of an already processed revision.
  pub once_duplicates: Arc<AtomicUsize>,
  pub locks_acquired: Arc<AtomicUsize>,
  pub locks_busy: Arc<AtomicUsize>,
  pub locks_lost: Arc<AtomicUsize>,
  pub kills_delivered: Arc<AtomicUsize>,
  pub kills_failed: Arc<AtomicUsize>,
  /// Job definitions or timers rejected as malformed.
  pub invalid_definitions: Arc<AtomicUsize>,

  // --- Histograms ---
  /// Wall time of a whole task, all attempts included.
  pub task_execution_duration: Arc<SimpleHistogram>,
}

impl AgentMetrics {
  pub fn new() -> Self {
    Self::default()
  }

  /// Creates a point-in-time snapshot of all metric values.
  pub fn snapshot(&self) -> MetricsSnapshot {
    let order = Ordering::Relaxed;

    MetricsSnapshot {
      entries_scheduled_current: self.entries_scheduled_current.load(order),
      entries_fired: self.entries_fired.load(order),
      entries_skipped_running: self.entries_skipped_running.load(order),
      entries_panicked: self.entries_panicked.load(order),
      tasks_started: self.tasks_started.load(order),
      tasks_succeeded: self.tasks_succeeded.load(order),
      tasks_failed: self.tasks_failed.load(order),
      tasks_timed_out: self.tasks_timed_out.load(order),
      task_retries: self.task_retries.load(order),
      tasks_skipped_interval: self.tasks_skipped_interval.load(order),
      tasks_panicked: self.tasks_panicked.load(order),
      once_runs: self.once_runs.load(order),
      once_duplicates: self.once_duplicates.load(order),
      locks_acquired: self.locks_acquired.load(order),
      locks_busy: self.locks_busy.load(order),
      locks_lost: self.locks_lost.load(order),
      kills_delivered: self.kills_delivered.load(order),
      kills_failed: self.kills_failed.load(order),
      invalid_definitions: self.invalid_definitions.load(order),
      task_execution_duration_count: self.task_execution_duration.get_count(),
      task_execution_duration_sum_micros: self.task_execution_duration.get_sum_micros(),
    }
  }

  pub(crate) fn incr(counter: &AtomicUsize) {
    counter.fetch_add(1, Ordering::Relaxed);
  }
}

// --- Metrics Snapshot Struct (Public Data) ---

/// A snapshot of the agent's metrics at a specific point in time.
#[derive(Debug, Clone, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub struct MetricsSnapshot {
  // Cron engine
  pub entries_scheduled_current: usize,
  pub entries_fired: usize,
  pub entries_skipped_running: usize,
  pub entries_panicked: usize,
  // Tasks
  pub tasks_started: usize,
  pub tasks_succeeded: usize,
  pub tasks_failed: usize,
  pub tasks_timed_out: usize,
  pub task_retries: usize,
  pub tasks_skipped_interval: usize,
  pub tasks_panicked: usize,
  // Registry
  pub once_runs: usize,
  pub once_duplicates: usize,
  pub locks_acquired: usize,
  pub locks_busy: usize,
  pub locks_lost: usize,
  pub kills_delivered: usize,
  pub kills_failed: usize,
  pub invalid_definitions: usize,
  // Histogram Data
  pub task_execution_duration_count: usize,
  pub task_execution_duration_sum_micros: usize,
}

impl MetricsSnapshot {
  /// Mean task duration, if any task completed.
  pub fn mean_execution_duration(&self) -> Option<Duration> {
    if self.task_execution_duration_count == 0 {
      None
    } else {
      let micros =
        self.task_execution_duration_sum_micros as f64 / self.task_execution_duration_count as f64;
      Some(Duration::from_micros(micros as u64))
    }
  }
}
