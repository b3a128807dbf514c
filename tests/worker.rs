//! tests/worker.rs
//! End-to-end registry behaviour against the in-memory store.

mod common;

use std::sync::Arc;
use std::time::Duration as StdDuration;

use cronkeeper::proc::{Process, ProcessValue};
use cronkeeper::{
  BuildError, KvStore, MemoryStore, QueryError, TaskStatus, WorkerBuilder, WorkerConfig,
  WorkerHandle,
};
use serde_json::json;
use tokio::time::sleep;

use crate::common::{
  count_with_status, put_job, result_store, results_for, setup_tracing, start_worker, test_config,
  test_node, test_store, wait_until, FaultyStore, JOBS, LOCKS, PROCS,
};

const NEVER: &str = "0 0 0 1 1 *";
const WAIT: StdDuration = StdDuration::from_secs(5);

async fn cmd_count(handle: &WorkerHandle) -> usize {
  handle.list_cmds().await.map(|cmds| cmds.len()).unwrap_or(0)
}

async fn holds(handle: &WorkerHandle, job_id: &str) -> bool {
  handle
    .held_locks()
    .await
    .map(|held| held.iter().any(|id| id == job_id))
    .unwrap_or(false)
}

async fn lock_claims(store: &Arc<MemoryStore>, job_id: &str) -> usize {
  store
    .get_prefix(&format!("{LOCKS}{job_id}/"))
    .await
    .map(|(kvs, _)| kvs.len())
    .unwrap_or(0)
}

#[tokio::test]
async fn scheduled_job_runs_and_records_success() {
  setup_tracing();
  let store = test_store();
  let handle = start_worker(&store, test_node("alpha", 1), test_config()).await;

  put_job(
    &store,
    json!({"id": "J1", "command": "/bin/true", "timers": [{"id": "t1", "timer": "* * * * * *"}]}),
  )
  .await;

  let succeeded = wait_until(WAIT, || {
    let store = store.clone();
    async move { count_with_status(&store, "J1", TaskStatus::Success).await >= 1 }
  })
  .await;
  assert!(succeeded, "J1 should run within a few seconds");

  let cmds = handle.list_cmds().await.unwrap();
  assert_eq!(cmds.len(), 1);
  assert_eq!(cmds[0].id.to_string(), "J1/t1");
  assert!(cmds[0].next_fire.is_some());

  let details = handle.job("J1").await.unwrap();
  assert!(details.scheduled);
  assert!(!details.lock_held);

  let record = &results_for(&store, "J1").await[0];
  assert_eq!(record.run_on, "10.0.0.1:alpha");
  assert_eq!(record.job.id, "J1");

  let metrics = handle.metrics_snapshot().await.unwrap();
  assert!(metrics.tasks_succeeded >= 1);
  assert!(metrics.mean_execution_duration().is_some());
  handle.shutdown_graceful(Some(WAIT)).await.unwrap();
}

#[tokio::test]
async fn deleted_job_stops_firing() {
  setup_tracing();
  let store = test_store();
  let handle = start_worker(&store, test_node("alpha", 1), test_config()).await;

  let key = put_job(
    &store,
    json!({"id": "doomed", "command": "true", "timers": [{"id": "t", "timer": "* * * * * *"}]}),
  )
  .await;
  assert!(
    wait_until(WAIT, || {
      let store = store.clone();
      async move { !results_for(&store, "doomed").await.is_empty() }
    })
    .await
  );

  store.delete(&key).await.unwrap();
  assert!(
    wait_until(WAIT, || {
      let handle = handle.clone();
      async move { cmd_count(&handle).await == 0 }
    })
    .await
  );
  assert!(matches!(handle.job("doomed").await, Err(QueryError::JobNotFound(_))));

  // Let a firing that was already in flight finish.
  sleep(StdDuration::from_millis(500)).await;
  let settled = results_for(&store, "doomed").await.len();
  sleep(StdDuration::from_secs(2)).await;
  assert_eq!(results_for(&store, "doomed").await.len(), settled);

  handle.shutdown_graceful(Some(WAIT)).await.unwrap();
}

#[tokio::test]
async fn malformed_definitions_and_timers_are_skipped() {
  setup_tracing();
  let store = test_store();
  let handle = start_worker(&store, test_node("alpha", 1), test_config()).await;

  store
    .put(&format!("{JOBS}garbage"), "{not json".to_string(), None)
    .await
    .unwrap();
  put_job(
    &store,
    json!({"id": "partial", "command": "true", "timers": [
      {"id": "good", "timer": NEVER},
      {"id": "bad", "timer": "99 * * * * *"}
    ]}),
  )
  .await;

  assert!(
    wait_until(WAIT, || {
      let handle = handle.clone();
      async move { cmd_count(&handle).await == 1 }
    })
    .await
  );
  let cmds = handle.list_cmds().await.unwrap();
  assert_eq!(cmds[0].id.timer_id, "good");

  let metrics = handle.metrics_snapshot().await.unwrap();
  assert_eq!(metrics.invalid_definitions, 2);
  assert!(matches!(handle.job("garbage").await, Err(QueryError::JobNotFound(_))));
  handle.shutdown_graceful(Some(WAIT)).await.unwrap();
}

#[tokio::test]
async fn modify_keeps_unchanged_cmds_and_reschedules_changed_ones() {
  setup_tracing();
  let store = test_store();
  let handle = start_worker(&store, test_node("alpha", 1), test_config()).await;

  put_job(
    &store,
    json!({"id": "evolving", "command": "echo v1", "timers": [
      {"id": "a", "timer": NEVER},
      {"id": "b", "timer": NEVER}
    ]}),
  )
  .await;
  assert!(
    wait_until(WAIT, || {
      let handle = handle.clone();
      async move { cmd_count(&handle).await == 2 }
    })
    .await
  );
  let before = handle.list_cmds().await.unwrap();

  // Same timers, new command: entries survive and see the new definition.
  put_job(
    &store,
    json!({"id": "evolving", "command": "echo v2", "timers": [
      {"id": "a", "timer": NEVER},
      {"id": "b", "timer": NEVER}
    ]}),
  )
  .await;
  assert!(
    wait_until(WAIT, || {
      let handle = handle.clone();
      async move {
        handle
          .job("evolving")
          .await
          .map(|d| d.job.command == "echo v2")
          .unwrap_or(false)
      }
    })
    .await
  );
  let same = handle.list_cmds().await.unwrap();
  assert_eq!(
    same.iter().map(|c| c.entry_id).collect::<Vec<_>>(),
    before.iter().map(|c| c.entry_id).collect::<Vec<_>>()
  );

  // Timer `a` changes spec, `b` is removed, `c` is new.
  put_job(
    &store,
    json!({"id": "evolving", "command": "echo v3", "timers": [
      {"id": "a", "timer": "0 0 12 1 1 *"},
      {"id": "c", "timer": NEVER}
    ]}),
  )
  .await;
  assert!(
    wait_until(WAIT, || {
      let handle = handle.clone();
      async move {
        let cmds = handle.list_cmds().await.unwrap_or_default();
        cmds.iter().map(|c| c.id.timer_id.as_str()).collect::<Vec<_>>() == vec!["a", "c"]
      }
    })
    .await
  );
  let after = handle.list_cmds().await.unwrap();
  assert_eq!(after[0].spec, "0 0 12 1 1 *");
  assert_ne!(after[0].entry_id, before[0].entry_id);

  // A malformed modify keeps the current schedule.
  store
    .put(&format!("{JOBS}evolving"), "{oops".to_string(), None)
    .await
    .unwrap();
  sleep(StdDuration::from_millis(300)).await;
  assert_eq!(handle.list_cmds().await.unwrap(), after);

  handle.shutdown_graceful(Some(WAIT)).await.unwrap();
}

#[tokio::test]
async fn node_lists_and_pause_control_local_scheduling() {
  setup_tracing();
  let store = test_store();
  let handle = start_worker(&store, test_node("alpha", 1), test_config()).await;

  put_job(
    &store,
    json!({"id": "targeted", "command": "true", "nodes": ["beta"], "timers": [{"timer": NEVER}]}),
  )
  .await;
  assert!(
    wait_until(WAIT, || {
      let handle = handle.clone();
      async move { handle.job("targeted").await.is_ok() }
    })
    .await
  );
  assert!(!handle.job("targeted").await.unwrap().scheduled);

  put_job(
    &store,
    json!({"id": "targeted", "command": "true", "nodes": ["beta", "10.0.0.1"], "timers": [{"timer": NEVER}]}),
  )
  .await;
  assert!(
    wait_until(WAIT, || {
      let handle = handle.clone();
      async move { cmd_count(&handle).await == 1 }
    })
    .await
  );

  put_job(
    &store,
    json!({"id": "targeted", "command": "true", "pause": true, "timers": [{"timer": NEVER}]}),
  )
  .await;
  assert!(
    wait_until(WAIT, || {
      let handle = handle.clone();
      async move { cmd_count(&handle).await == 0 }
    })
    .await
  );
  let details = handle.job("targeted").await.unwrap();
  assert!(details.job.pause);
  assert!(!details.scheduled);

  handle.shutdown_graceful(Some(WAIT)).await.unwrap();
}

#[tokio::test]
async fn running_worker_reports_panics_with_backtraces() {
  setup_tracing();
  let store = test_store();
  let handle = start_worker(&store, test_node("alpha", 1), test_config()).await;
  assert!(cronkeeper::telemetry::panic_hook_installed());
  handle.shutdown_graceful(Some(WAIT)).await.unwrap();
}

#[tokio::test]
async fn definitions_present_at_startup_are_scheduled() {
  setup_tracing();
  let store = test_store();
  put_job(
    &store,
    json!({"id": "preloaded", "command": "true", "timers": [{"id": "t", "timer": NEVER}]}),
  )
  .await;

  let handle = start_worker(&store, test_node("alpha", 1), test_config()).await;
  let cmds = handle.list_cmds().await.unwrap();
  assert_eq!(cmds.len(), 1);
  assert_eq!(cmds[0].id.job_id, "preloaded");
  handle.shutdown_graceful(Some(WAIT)).await.unwrap();
}

#[tokio::test]
async fn job_id_change_under_same_key_forgets_the_old_id() {
  setup_tracing();
  let store = test_store();
  let handle = start_worker(&store, test_node("alpha", 1), test_config()).await;
  let key = format!("{JOBS}slot");

  let first = json!({"id": "old-id", "command": "true", "timers": [{"timer": NEVER}]});
  store.put(&key, first.to_string(), None).await.unwrap();
  assert!(
    wait_until(WAIT, || {
      let handle = handle.clone();
      async move { handle.job("old-id").await.is_ok() }
    })
    .await
  );

  let second = json!({"id": "new-id", "command": "true", "timers": [{"timer": NEVER}]});
  store.put(&key, second.to_string(), None).await.unwrap();
  assert!(
    wait_until(WAIT, || {
      let handle = handle.clone();
      async move { handle.job("new-id").await.is_ok() }
    })
    .await
  );
  assert!(matches!(handle.job("old-id").await, Err(QueryError::JobNotFound(_))));
  assert_eq!(cmd_count(&handle).await, 1);

  store.delete(&key).await.unwrap();
  assert!(
    wait_until(WAIT, || {
      let handle = handle.clone();
      async move { handle.job("new-id").await.is_err() }
    })
    .await
  );
  handle.shutdown_graceful(Some(WAIT)).await.unwrap();
}

#[tokio::test]
async fn alone_job_runs_on_one_node_and_fails_over() {
  setup_tracing();
  let store = test_store();
  let alpha = start_worker(&store, test_node("alpha", 1), test_config()).await;
  let beta = start_worker(&store, test_node("beta", 2), test_config()).await;

  put_job(
    &store,
    json!({"id": "solo", "command": "true", "job_type": 1, "timers": [{"id": "t", "timer": NEVER}]}),
  )
  .await;

  let one_holder = wait_until(WAIT, || {
    let (alpha, beta) = (alpha.clone(), beta.clone());
    async move { holds(&alpha, "solo").await ^ holds(&beta, "solo").await }
  })
  .await;
  assert!(one_holder, "exactly one node should hold the Alone lock");

  // The loser neither holds nor schedules it, and stays that way.
  sleep(StdDuration::from_millis(1500)).await;
  let (holder, standby) = if holds(&alpha, "solo").await {
    (alpha, beta)
  } else {
    (beta, alpha)
  };
  assert!(!holds(&standby, "solo").await);
  assert_eq!(cmd_count(&standby).await, 0);
  assert_eq!(cmd_count(&holder).await, 1);
  assert!(holder.job("solo").await.unwrap().lock_held);
  assert_eq!(lock_claims(&store, "solo").await, 1);

  holder.shutdown_graceful(Some(WAIT)).await.unwrap();
  let took_over = wait_until(WAIT, || {
    let standby = standby.clone();
    async move { holds(&standby, "solo").await }
  })
  .await;
  assert!(took_over, "the standby node should take the job over");
  assert_eq!(cmd_count(&standby).await, 1);

  standby.shutdown_graceful(Some(WAIT)).await.unwrap();
}

#[tokio::test]
async fn release_during_a_busy_attempt_is_not_lost() {
  setup_tracing();
  let store = test_store();
  let alpha = start_worker(&store, test_node("alpha", 1), test_config()).await;

  put_job(
    &store,
    json!({"id": "solo", "command": "true", "job_type": 1, "timers": [{"id": "t", "timer": NEVER}]}),
  )
  .await;
  assert!(
    wait_until(WAIT, || {
      let alpha = alpha.clone();
      async move { holds(&alpha, "solo").await }
    })
    .await
  );

  // Beta's first attempt sees alpha's claim, then reports busy only after alpha let go.
  let slow = Arc::new(FaultyStore::wrap(&store).with_lock_read_delay(StdDuration::from_millis(800)));
  let beta = WorkerBuilder::new(slow)
    .config(test_config())
    .node(test_node("beta", 2))
    .build()
    .unwrap()
    .run()
    .await
    .unwrap();
  sleep(StdDuration::from_millis(200)).await;
  alpha.shutdown_graceful(Some(WAIT)).await.unwrap();

  let took_over = wait_until(WAIT, || {
    let beta = beta.clone();
    async move { holds(&beta, "solo").await }
  })
  .await;
  assert!(took_over, "beta should retry after the release it saw mid-attempt");
  assert_eq!(cmd_count(&beta).await, 1);
  assert_eq!(lock_claims(&store, "solo").await, 1);

  beta.shutdown_graceful(Some(WAIT)).await.unwrap();
}

#[tokio::test]
async fn alone_job_becoming_normal_releases_its_lock() {
  setup_tracing();
  let store = test_store();
  let handle = start_worker(&store, test_node("alpha", 1), test_config()).await;

  put_job(
    &store,
    json!({"id": "flip", "command": "true", "job_type": "alone", "timers": [{"id": "t", "timer": NEVER}]}),
  )
  .await;
  assert!(
    wait_until(WAIT, || {
      let handle = handle.clone();
      async move { holds(&handle, "flip").await }
    })
    .await
  );

  put_job(
    &store,
    json!({"id": "flip", "command": "true", "job_type": "normal", "timers": [{"id": "t", "timer": NEVER}]}),
  )
  .await;
  assert!(
    wait_until(WAIT, || {
      let store = store.clone();
      async move { lock_claims(&store, "flip").await == 0 }
    })
    .await
  );
  assert!(!holds(&handle, "flip").await);
  assert_eq!(cmd_count(&handle).await, 1);

  handle.shutdown_graceful(Some(WAIT)).await.unwrap();
}

#[tokio::test]
async fn shutdown_releases_locks_and_closes_the_handle() {
  setup_tracing();
  let store = test_store();
  let handle = start_worker(&store, test_node("alpha", 1), test_config()).await;

  put_job(
    &store,
    json!({"id": "held", "command": "true", "job_type": 1, "timers": [{"timer": NEVER}]}),
  )
  .await;
  assert!(
    wait_until(WAIT, || {
      let handle = handle.clone();
      async move { holds(&handle, "held").await }
    })
    .await
  );

  handle.shutdown_graceful(Some(WAIT)).await.unwrap();
  assert!(
    wait_until(WAIT, || {
      let store = store.clone();
      async move { lock_claims(&store, "held").await == 0 }
    })
    .await
  );
  assert!(matches!(handle.list_cmds().await, Err(QueryError::WorkerShutdown)));
  // Shutting down twice is fine.
  handle.shutdown_force(Some(WAIT)).await.unwrap();
}

#[tokio::test]
async fn once_run_executes_with_requested_task_id() {
  setup_tracing();
  let store = test_store();
  let handle = start_worker(&store, test_node("alpha", 1), test_config()).await;
  let key = "/worker/once/alpha/adhoc";
  let request = json!({"id": "adhoc", "command": "echo once", "task_id": 42}).to_string();

  store.put(key, request.clone(), None).await.unwrap();
  let results = result_store(&store);
  assert!(
    wait_until(WAIT, || {
      let results = &results;
      async move {
        matches!(
          results.get(&"adhoc".to_string(), 42).await,
          Ok(Some(record)) if record.status == TaskStatus::Success
        )
      }
    })
    .await
  );
  let record = results.get(&"adhoc".to_string(), 42).await.unwrap().unwrap();
  assert!(record.logs.contains("once"));

  // A new revision of the same request is a new request.
  store.put(key, request, None).await.unwrap();
  assert!(
    wait_until(WAIT, || {
      let handle = handle.clone();
      async move {
        handle
          .metrics_snapshot()
          .await
          .map(|m| m.once_runs == 2)
          .unwrap_or(false)
      }
    })
    .await
  );

  // Requests for another host are not seen here.
  store
    .put("/worker/once/beta/adhoc", json!({"command": "true", "task_id": 43}).to_string(), None)
    .await
    .unwrap();
  sleep(StdDuration::from_millis(500)).await;
  assert!(results.get(&"adhoc".to_string(), 43).await.unwrap().is_none());
  assert_eq!(handle.metrics_snapshot().await.unwrap().once_runs, 2);

  handle.shutdown_graceful(Some(WAIT)).await.unwrap();
}

#[tokio::test]
async fn once_run_without_command_uses_the_known_definition() {
  setup_tracing();
  let store = test_store();
  let handle = start_worker(&store, test_node("alpha", 1), test_config()).await;

  put_job(
    &store,
    json!({"id": "manual", "command": "echo paused-run", "pause": true, "timers": [{"timer": NEVER}]}),
  )
  .await;
  assert!(
    wait_until(WAIT, || {
      let handle = handle.clone();
      async move { handle.job("manual").await.is_ok() }
    })
    .await
  );

  store.put("/worker/once/alpha/manual", String::new(), None).await.unwrap();
  assert!(
    wait_until(WAIT, || {
      let store = store.clone();
      async move { count_with_status(&store, "manual", TaskStatus::Success).await == 1 }
    })
    .await
  );
  assert!(results_for(&store, "manual").await[0].logs.contains("paused-run"));

  // Unknown job with no command: nothing runs.
  store.put("/worker/once/alpha/ghost", String::new(), None).await.unwrap();
  sleep(StdDuration::from_millis(500)).await;
  assert!(results_for(&store, "ghost").await.is_empty());

  handle.shutdown_graceful(Some(WAIT)).await.unwrap();
}

#[tokio::test]
async fn kill_flag_in_the_store_terminates_the_process() {
  setup_tracing();
  let store = test_store();
  let handle = start_worker(&store, test_node("alpha", 1), test_config()).await;

  store
    .put(
      "/worker/once/alpha/sleepy",
      json!({"id": "sleepy", "command": "sleep 30", "task_id": 7}).to_string(),
      None,
    )
    .await
    .unwrap();

  let prefix = format!("{PROCS}10.0.0.1:alpha/sleepy/7/");
  assert!(
    wait_until(WAIT, || {
      let store = store.clone();
      let prefix = prefix.clone();
      async move { !store.get_prefix(&prefix).await.unwrap().0.is_empty() }
    })
    .await
  );
  let (records, _) = store.get_prefix(&prefix).await.unwrap();
  let kv = records[0].clone();
  let process = Process::from_kv(PROCS, &kv).unwrap();
  let killed = ProcessValue {
    time: process.time,
    killed: true,
  };
  store
    .put(&kv.key, serde_json::to_string(&killed).unwrap(), Some(kv.lease))
    .await
    .unwrap();

  let results = result_store(&store);
  assert!(
    wait_until(WAIT, || {
      let results = &results;
      async move {
        matches!(
          results.get(&"sleepy".to_string(), 7).await,
          Ok(Some(record)) if record.status == TaskStatus::Failed
        )
      }
    })
    .await
  );
  let record = results.get(&"sleepy".to_string(), 7).await.unwrap().unwrap();
  assert!(record.logs.contains("killed on request"));
  assert_eq!(handle.metrics_snapshot().await.unwrap().kills_delivered, 1);
  // The record goes away with the process.
  assert!(store.get_prefix(&prefix).await.unwrap().0.is_empty());

  handle.shutdown_graceful(Some(WAIT)).await.unwrap();
}

#[tokio::test]
async fn interval_job_runs_once_per_interval_across_nodes() {
  setup_tracing();
  let store = test_store();
  let alpha = start_worker(&store, test_node("alpha", 1), test_config()).await;
  let beta = start_worker(&store, test_node("beta", 2), test_config()).await;

  put_job(
    &store,
    json!({"id": "tick", "command": "true", "job_type": 2, "timers": [{"id": "t", "timer": "*/2 * * * * *"}]}),
  )
  .await;
  sleep(StdDuration::from_millis(5200)).await;

  let runs = results_for(&store, "tick").await.len();
  let skipped = alpha.metrics_snapshot().await.unwrap().tasks_skipped_interval
    + beta.metrics_snapshot().await.unwrap().tasks_skipped_interval;
  assert!((1..=3).contains(&runs), "one run per two-second interval, got {runs}");
  assert!(skipped >= 1, "the other node should skip claimed intervals");

  alpha.shutdown_graceful(Some(WAIT)).await.unwrap();
  beta.shutdown_graceful(Some(WAIT)).await.unwrap();
}

#[tokio::test]
async fn immediately_run_fires_new_cmds_at_once() {
  setup_tracing();
  let store = test_store();
  let handle = WorkerBuilder::new(store.clone())
    .config(test_config())
    .node(test_node("alpha", 1))
    .immediately_run(true)
    .build()
    .unwrap()
    .run()
    .await
    .unwrap();

  put_job(
    &store,
    json!({"id": "eager", "command": "true", "timers": [{"timer": NEVER}]}),
  )
  .await;
  assert!(
    wait_until(StdDuration::from_secs(3), || {
      let store = store.clone();
      async move { count_with_status(&store, "eager", TaskStatus::Success).await == 1 }
    })
    .await,
    "a Jan-1-only schedule should still fire right away"
  );
  handle.shutdown_graceful(Some(WAIT)).await.unwrap();
}

#[tokio::test]
async fn builder_rejects_invalid_configuration() {
  setup_tracing();
  let store = test_store();

  let bad_prefix = WorkerConfig {
    jobs_prefix: "/worker/jobs".to_string(),
    ..test_config()
  };
  let err = WorkerBuilder::new(store.clone())
    .config(bad_prefix)
    .node(test_node("alpha", 1))
    .build()
    .err();
  assert_eq!(err, Some(BuildError::InvalidPrefix("jobs_prefix")));

  let zero_ttl = WorkerConfig {
    lock_ttl_secs: 0,
    ..test_config()
  };
  let err = WorkerBuilder::new(store.clone())
    .config(zero_ttl)
    .node(test_node("alpha", 1))
    .build()
    .err();
  assert_eq!(err, Some(BuildError::ZeroDuration("lock_ttl_secs")));

  let discovered = WorkerBuilder::new(store)
    .config(WorkerConfig {
      hostname: Some("configured-host".to_string()),
      ..test_config()
    })
    .build()
    .unwrap();
  assert_eq!(discovered.node().hostname, "configured-host");
}
