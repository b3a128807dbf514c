//! tests/config.rs
//! Loading the agent configuration file.

mod common;

use std::io::Write;
use std::time::Duration as StdDuration;

use cronkeeper::{AgentConfig, ConfigError, WorkerConfig};

use crate::common::setup_tracing;

#[test]
fn partial_file_keeps_defaults_for_the_rest() {
  setup_tracing();
  let config = AgentConfig::parse(
    r#"
      [worker]
      lock_ttl_secs = 4
      hostname = "alpha"
      ip = "10.1.2.3"

      [log]
      json = true
    "#,
    "inline",
  )
  .unwrap();

  assert_eq!(config.worker.lock_ttl(), StdDuration::from_secs(4));
  assert_eq!(config.worker.hostname.as_deref(), Some("alpha"));
  assert_eq!(config.worker.ip.map(|ip| ip.to_string()).as_deref(), Some("10.1.2.3"));
  assert_eq!(config.worker.jobs_prefix, "/worker/jobs/");
  assert_eq!(config.worker.lock_wait(), StdDuration::from_secs(3));
  assert_eq!(config.etcd.endpoints, vec!["http://127.0.0.1:2379".to_string()]);
  assert!(config.log.json);
  assert_eq!(config.log.level, "info");
}

#[test]
fn empty_file_is_all_defaults() {
  let config = AgentConfig::parse("", "empty").unwrap();
  assert_eq!(config, AgentConfig::default());
  let worker = WorkerConfig::default();
  assert_eq!(worker.proc_ttl(), StdDuration::from_secs(30));
  assert_eq!(worker.result_ttl(), StdDuration::from_secs(600));
  assert_eq!(worker.req_timeout(), StdDuration::from_secs(3));
  assert!(!worker.immediately_run);
}

#[test]
fn loads_from_disk() {
  setup_tracing();
  let mut file = tempfile::NamedTempFile::new().unwrap();
  writeln!(
    file,
    "[worker]\nimmediately_run = true\nshell = \"/bin/sh\"\n\n[etcd]\nendpoints = [\"http://etcd-1:2379\", \"http://etcd-2:2379\"]"
  )
  .unwrap();

  let config = AgentConfig::load(file.path()).unwrap();
  assert!(config.worker.immediately_run);
  assert_eq!(config.worker.shell, "/bin/sh");
  assert_eq!(config.etcd.endpoints.len(), 2);
}

#[test]
fn unreadable_and_malformed_files_are_reported() {
  let dir = tempfile::tempdir().unwrap();
  let missing = AgentConfig::load(dir.path().join("absent.toml"));
  assert!(matches!(missing, Err(ConfigError::Read { .. })));

  let bad = AgentConfig::parse("[worker]\nlock_ttl_secs = \"ten\"", "bad.toml");
  match bad {
    Err(ConfigError::Parse { path, .. }) => assert_eq!(path, "bad.toml"),
    other => panic!("expected a parse error, got {other:?}"),
  }
}
