//! tests/proc.rs
//! Process records: publication, removal, crash expiry and kill delivery.

mod common;

use std::time::Duration as StdDuration;

use chrono::Utc;
use cronkeeper::proc::{Process, ProcessValue};
use cronkeeper::store::KeyValue;
use cronkeeper::KvStore;
use tokio_util::sync::CancellationToken;

use crate::common::{setup_tracing, test_node, test_store, tracker, wait_until, PROCS};

#[tokio::test]
async fn record_is_published_and_removed_on_stop() {
  setup_tracing();
  let store = test_store();
  let node = test_node("alpha", 1);
  let tracker = tracker(&store, &node, StdDuration::from_secs(2));

  let guard = tracker
    .start(&"backup".to_string(), 77, 4242, CancellationToken::new())
    .await;
  let expected_key = format!("{PROCS}10.0.0.1:alpha/backup/77/4242");
  assert_eq!(guard.key(), expected_key);
  assert_eq!(tracker.running_count(), 1);

  let kv = store.get(&expected_key).await.unwrap().expect("record published");
  assert_ne!(kv.lease, 0, "records are lease-bound");
  let value: ProcessValue = serde_json::from_str(&kv.value).unwrap();
  assert!(!value.killed);

  guard.stop().await;
  assert_eq!(tracker.running_count(), 0);
  assert!(store.get(&expected_key).await.unwrap().is_none());
  assert_eq!(store.lease_count(), 0);
}

#[tokio::test]
async fn dropped_guard_removes_record_in_background() {
  setup_tracing();
  let store = test_store();
  let node = test_node("alpha", 1);
  let tracker = tracker(&store, &node, StdDuration::from_secs(2));

  let guard = tracker
    .start(&"report".to_string(), 5, 100, CancellationToken::new())
    .await;
  let key = guard.key().to_string();
  drop(guard);

  assert_eq!(tracker.running_count(), 0);
  let removed = wait_until(StdDuration::from_secs(1), || {
    let store = store.clone();
    let key = key.clone();
    async move { store.get(&key).await.unwrap().is_none() }
  })
  .await;
  assert!(removed);
}

#[tokio::test]
async fn crashed_node_records_expire_with_their_lease() {
  setup_tracing();
  let store = test_store();
  let node = test_node("doomed", 9);
  let tracker = tracker(&store, &node, StdDuration::from_secs(1));

  let guard = tracker
    .start(&"sync".to_string(), 1, 999, CancellationToken::new())
    .await;
  let key = guard.key().to_string();

  // The node stops renewing and never cleans up.
  store.block_renewals(true);
  std::mem::forget(guard);

  let expired = wait_until(StdDuration::from_secs(3), || {
    let store = store.clone();
    let key = key.clone();
    async move { store.get(&key).await.unwrap().is_none() }
  })
  .await;
  store.block_renewals(false);
  assert!(expired, "no permanent running state after a crash");
}

#[tokio::test]
async fn kill_cancels_only_the_matching_child() {
  setup_tracing();
  let store = test_store();
  let node = test_node("alpha", 1);
  let tracker = tracker(&store, &node, StdDuration::from_secs(2));

  let token = CancellationToken::new();
  let guard = tracker.start(&"long".to_string(), 12, 3000, token.clone()).await;

  let mut request = Process {
    pid: 3000,
    job_id: "long".to_string(),
    task_id: 99,
    node_id: node.id(),
    time: Utc::now(),
    killed: true,
  };
  assert!(!tracker.kill(&request), "task id mismatch is not delivered");
  assert!(!token.is_cancelled());

  request.task_id = 12;
  assert!(tracker.kill(&request));
  assert!(token.is_cancelled());

  request.pid = 3001;
  assert!(!tracker.kill(&request), "unknown pid is not delivered");
  guard.stop().await;
}

#[test]
fn process_is_decoded_from_its_record() {
  setup_tracing();
  let kv = KeyValue {
    key: format!("{PROCS}10.0.0.2:beta/nightly/123/456"),
    value: r#"{"time":"2024-03-14T10:00:00Z","killed":true}"#.to_string(),
    create_revision: 3,
    mod_revision: 4,
    lease: 7,
  };
  let process = Process::from_kv(PROCS, &kv).unwrap();
  assert_eq!(process.node_id, "10.0.0.2:beta");
  assert_eq!(process.job_id, "nightly");
  assert_eq!(process.task_id, 123);
  assert_eq!(process.pid, 456);
  assert!(process.killed);
  assert_eq!(process.key(PROCS), kv.key);

  // `killed` defaults to false.
  let fresh = KeyValue {
    value: r#"{"time":"2024-03-14T10:00:00Z"}"#.to_string(),
    ..kv.clone()
  };
  assert!(!Process::from_kv(PROCS, &fresh).unwrap().killed);

  for bad_key in [
    format!("{PROCS}10.0.0.2:beta/nightly/123"),
    format!("{PROCS}10.0.0.2:beta/nightly/abc/456"),
    "/elsewhere/a/b/1/2".to_string(),
  ] {
    let bad = KeyValue {
      key: bad_key,
      ..kv.clone()
    };
    assert!(Process::from_kv(PROCS, &bad).is_err());
  }

  let garbage = KeyValue {
    value: "not json".to_string(),
    ..kv
  };
  assert!(Process::from_kv(PROCS, &garbage).is_err());
}
