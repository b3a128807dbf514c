//! Executor: runs a job's command or script as a child process group.

use crate::job::Job;
use crate::metrics::AgentMetrics;
use crate::proc::ProcessTracker;
use crate::result::TaskStatus;
use crate::task::TaskId;

use std::io;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const READ_CHUNK: usize = 8 * 1024;
const OUTPUT_DRAIN_GRACE: Duration = Duration::from_secs(1);

/// Outcome of a single attempt, or of the last attempt of a retried run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptOutcome {
  pub status: TaskStatus,
  pub logs: String,
  /// The attempt was ended by a kill request.
  pub killed: bool,
  /// Number of attempts made, including this one.
  pub attempts: u32,
}

impl AttemptOutcome {
  fn failed(logs: impl Into<String>) -> Self {
    Self {
      status: TaskStatus::Failed,
      logs: logs.into(),
      killed: false,
      attempts: 1,
    }
  }
}

/// Merged stdout/stderr, capped at a fixed size.
#[derive(Debug)]
struct OutputBuffer {
  data: Vec<u8>,
  limit: usize,
  dropped: usize,
}

impl OutputBuffer {
  fn new(limit: usize) -> Self {
    Self {
      data: Vec::new(),
      limit,
      dropped: 0,
    }
  }

  fn push(&mut self, chunk: &[u8]) {
    let room = self.limit.saturating_sub(self.data.len());
    let take = room.min(chunk.len());
    self.data.extend_from_slice(&chunk[..take]);
    self.dropped += chunk.len() - take;
  }

  fn render(&self) -> String {
    let mut text = String::from_utf8_lossy(&self.data).into_owned();
    if self.dropped > 0 {
      text.push_str(&format!("\n[output truncated, {} bytes dropped]", self.dropped));
    }
    text
  }
}

/// Runs job commands through a shell.
#[derive(Debug, Clone)]
pub struct Executor {
  shell: String,
  max_output: usize,
}

impl Executor {
  pub fn new(shell: impl Into<String>, max_output: usize) -> Self {
    Self {
      shell: shell.into(),
      max_output,
    }
  }

  /// Runs `job` with its retry policy: stop at the first success, make at
  /// most `retry + 1` attempts and sleep `interval` seconds between them.
  /// A killed attempt ends the run without further retries.
  pub async fn run_with_retry(
    &self,
    job: &Job,
    task_id: TaskId,
    tracker: &Arc<ProcessTracker>,
    metrics: &AgentMetrics,
  ) -> AttemptOutcome {
    let max_attempts = job.retry.saturating_add(1);
    let mut attempt = 1;
    loop {
      let mut outcome = self.run(job, task_id, tracker).await;
      outcome.attempts = attempt;
      if outcome.status == TaskStatus::Success || outcome.killed || attempt >= max_attempts {
        return outcome;
      }

      AgentMetrics::incr(&metrics.task_retries);
      warn!(
        job_id = %job.id,
        task_id,
        attempt,
        max_attempts,
        status = %outcome.status,
        "Attempt unsuccessful, retrying."
      );
      if job.interval > 0 {
        tokio::time::sleep(job.retry_interval()).await;
      }
      attempt += 1;
    }
  }

  /// Runs one attempt of `job`.
  ///
  /// Exit code 0 is `Success`, hitting the job timeout is `Timeout`, and
  /// anything else (non-zero exit, a missing target, a spawn error, a kill)
  /// is `Failed`. Never panics on a bad target.
  pub async fn run(&self, job: &Job, task_id: TaskId, tracker: &Arc<ProcessTracker>) -> AttemptOutcome {
    let mut command = match self.build_command(job) {
      Ok(command) => command,
      Err(reason) => {
        warn!(job_id = %job.id, task_id, %reason, "Job target is not runnable.");
        return AttemptOutcome::failed(reason);
      }
    };

    let mut child = match command.spawn() {
      Ok(child) => child,
      Err(e) => {
        warn!(job_id = %job.id, task_id, error = %e, "Spawning job process failed.");
        return AttemptOutcome::failed(format!("spawn failed: {e}"));
      }
    };
    let Some(pid) = child.id() else {
      return AttemptOutcome::failed("process exited before its pid was known");
    };
    info!(job_id = %job.id, task_id, pid, "Job process started.");

    let output = Arc::new(Mutex::new(OutputBuffer::new(self.max_output)));
    let readers = [
      child.stdout.take().map(|s| drain(s, output.clone())),
      child.stderr.take().map(|s| drain(s, output.clone())),
    ];

    let kill = CancellationToken::new();
    let guard = tracker.start(&job.id, task_id, pid, kill.clone()).await;

    let timeout = job.timeout();
    let deadline = async {
      match timeout {
        Some(limit) => tokio::time::sleep(limit).await,
        None => std::future::pending::<()>().await,
      }
    };

    let (status, killed, note) = tokio::select! {
      waited = child.wait() => match waited {
        Ok(exit) => (classify(exit), false, None),
        Err(e) => (TaskStatus::Failed, false, Some(format!("waiting for process failed: {e}"))),
      },
      _ = deadline => {
        warn!(job_id = %job.id, task_id, pid, ?timeout, "Job timed out, killing process group.");
        terminate(pid, &mut child).await;
        (TaskStatus::Timeout, false, Some(format!("timed out after {}s", job.timeout)))
      },
      _ = kill.cancelled() => {
        warn!(job_id = %job.id, task_id, pid, record = guard.key(), "Kill requested, killing process group.");
        terminate(pid, &mut child).await;
        (TaskStatus::Failed, true, Some("killed on request".to_string()))
      },
    };

    guard.stop().await;

    for mut reader in readers.into_iter().flatten() {
      // Grandchildren can keep the pipe open after the group leader exits.
      if tokio::time::timeout(OUTPUT_DRAIN_GRACE, &mut reader).await.is_err() {
        debug!(job_id = %job.id, task_id, "Output reader did not finish in time.");
        reader.abort();
      }
    }

    let mut logs = output.lock().render();
    if let Some(note) = note {
      if !logs.is_empty() && !logs.ends_with('\n') {
        logs.push('\n');
      }
      logs.push_str(&note);
    }
    debug!(job_id = %job.id, task_id, pid, %status, "Job process finished.");
    AttemptOutcome {
      status,
      logs,
      killed,
      attempts: 1,
    }
  }

  fn build_command(&self, job: &Job) -> Result<Command, String> {
    let mut command = Command::new(&self.shell);
    match &job.script {
      Some(script) => {
        check_target(script)?;
        command.arg(script);
      }
      None => {
        let first = job.command.split_whitespace().next().unwrap_or_default();
        if first.starts_with('/') {
          check_target(Path::new(first))?;
        }
        command.arg("-c").arg(&job.command);
      }
    }

    command
      .stdin(Stdio::null())
      .stdout(Stdio::piped())
      .stderr(Stdio::piped())
      .kill_on_drop(true);

    #[cfg(unix)]
    {
      command.process_group(0);
      if !job.user.is_empty() {
        let (uid, gid) =
          lookup_user(&job.user).map_err(|e| format!("cannot run as user '{}': {e}", job.user))?;
        command.uid(uid).gid(gid);
      }
    }
    Ok(command)
  }
}

fn check_target(path: &Path) -> Result<(), String> {
  match std::fs::metadata(path) {
    Ok(meta) if meta.is_dir() => Err(format!("{} is a directory", path.display())),
    Ok(_) => Ok(()),
    Err(e) => Err(format!("{}: {e}", path.display())),
  }
}

fn classify(exit: ExitStatus) -> TaskStatus {
  if exit.success() {
    TaskStatus::Success
  } else {
    TaskStatus::Failed
  }
}

fn drain<R>(mut source: R, output: Arc<Mutex<OutputBuffer>>) -> JoinHandle<()>
where
  R: AsyncRead + Unpin + Send + 'static,
{
  tokio::spawn(async move {
    let mut chunk = vec![0u8; READ_CHUNK];
    loop {
      match source.read(&mut chunk).await {
        Ok(0) => break,
        Ok(n) => output.lock().push(&chunk[..n]),
        Err(e) => {
          debug!(error = %e, "Reading job output failed.");
          break;
        }
      }
    }
  })
}

/// Kills the whole process group led by `pid`, then reaps the leader.
async fn terminate(pid: u32, child: &mut Child) {
  #[cfg(unix)]
  {
    // Safety: the group id is our child's pid, set with process_group(0).
    let rc = unsafe { libc::killpg(pid as libc::pid_t, libc::SIGKILL) };
    if rc != 0 {
      let e = io::Error::last_os_error();
      warn!(pid, error = %e, "killpg failed, killing the leader only.");
      let _ = child.start_kill();
    }
  }
  #[cfg(not(unix))]
  {
    let _ = pid;
    let _ = child.start_kill();
  }
  if let Err(e) = child.wait().await {
    warn!(pid, error = %e, "Reaping killed process failed.");
  }
}

#[cfg(unix)]
fn lookup_user(name: &str) -> io::Result<(u32, u32)> {
  use std::ffi::CString;

  let c_name = CString::new(name)
    .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "user name contains NUL"))?;
  let mut buf = vec![0 as libc::c_char; 16 * 1024];
  // Safety: passwd is plain old data; getpwnam_r fills it and points into buf.
  let mut pwd: libc::passwd = unsafe { std::mem::zeroed() };
  let mut found: *mut libc::passwd = std::ptr::null_mut();
  let rc = unsafe {
    libc::getpwnam_r(
      c_name.as_ptr(),
      &mut pwd,
      buf.as_mut_ptr(),
      buf.len(),
      &mut found,
    )
  };
  if rc != 0 {
    return Err(io::Error::from_raw_os_error(rc));
  }
  if found.is_null() {
    return Err(io::Error::new(io::ErrorKind::NotFound, "no such user"));
  }
  Ok((pwd.pw_uid, pwd.pw_gid))
}
