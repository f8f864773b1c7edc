//! Registry behaviour with real child processes.
//!
//! Mock interpreters are small shell scripts written to a temp directory.

#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{sleep, timeout};

use ridian::artifacts::DirectoryStore;
use ridian::config::Settings;
use ridian::eval::{EvaluationRequest, Evaluator};
use ridian::session::SessionRegistry;
use ridian::SessionError;

const TEST_TIMEOUT: Duration = Duration::from_secs(5);

fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).expect("write mock script");
    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();
    path
}

fn settings_for(script: &Path) -> Settings {
    Settings {
        executable_path: script.to_string_lossy().into_owned(),
        interpreter_args: Vec::new(),
        ..Settings::default()
    }
}

#[tokio::test]
async fn test_resolve_is_idempotent_and_writes_preamble_once() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("stdin.log");
    let script = write_script(
        dir.path(),
        "mock_r.sh",
        &format!("exec cat >> '{}'", log.display()),
    );
    let registry = SessionRegistry::new(settings_for(&script));

    let first = registry.resolve("notes/a.md").await.unwrap();
    let second = registry.resolve("notes/a.md").await.unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert!(first.pid().is_some());
    assert_eq!(registry.len().await, 1);

    sleep(Duration::from_millis(200)).await;
    let written = std::fs::read_to_string(&log).unwrap();
    assert_eq!(written.matches("user_env <- new.env()").count(), 1);

    assert_eq!(registry.kill_all().await, 1);
    assert!(registry.is_empty().await);
}

#[tokio::test]
async fn test_distinct_keys_get_distinct_processes() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(dir.path(), "mock_r.sh", "exec cat > /dev/null");
    let registry = SessionRegistry::new(settings_for(&script));

    let a = registry.resolve("a.md").await.unwrap();
    let b = registry.resolve("b.md").await.unwrap();
    assert!(!Arc::ptr_eq(&a, &b));
    assert_ne!(a.pid(), b.pid());
    assert_eq!(registry.keys().await, vec!["a.md", "b.md"]);

    assert_eq!(registry.kill_all().await, 2);
}

#[tokio::test]
async fn test_exited_session_is_replaced() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(dir.path(), "mock_r.sh", "read line\nexit 0");
    let registry = SessionRegistry::new(settings_for(&script));

    let first = registry.resolve("doc.md").await.unwrap();
    timeout(TEST_TIMEOUT, async {
        while !first.is_closed() {
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("mock interpreter exits");

    let second = registry.resolve("doc.md").await.unwrap();
    assert!(!Arc::ptr_eq(&first, &second));
    registry.kill_all().await;
}

#[tokio::test]
async fn test_kill_fails_in_flight_evaluation() {
    let dir = tempfile::tempdir().unwrap();
    let artifacts = tempfile::tempdir().unwrap();
    let script = write_script(dir.path(), "mock_r.sh", "exec cat > /dev/null");
    let registry = Arc::new(SessionRegistry::new(settings_for(&script)));
    let evaluator = Evaluator::new(
        Arc::clone(&registry),
        Arc::new(DirectoryStore::new(artifacts.path())),
    );

    let request = EvaluationRequest::new("Sys.sleep(60)", "slow");
    let evaluation = evaluator.evaluate("doc.md", &request);
    let killer = async {
        while registry.get("doc.md").await.is_none() {
            sleep(Duration::from_millis(20)).await;
        }
        sleep(Duration::from_millis(100)).await;
        assert!(registry.kill("doc.md").await);
    };

    let (result, ()) = timeout(TEST_TIMEOUT, async { tokio::join!(evaluation, killer) })
        .await
        .unwrap();
    assert!(matches!(result, Err(SessionError::ProcessExited)));
    assert!(registry.is_empty().await);
}

#[tokio::test]
async fn test_missing_executable_leaves_registry_empty() {
    let registry = SessionRegistry::new(Settings {
        executable_path: "/definitely/not/here/R".to_string(),
        ..Settings::default()
    });
    let err = registry.resolve("doc.md").await.unwrap_err();
    assert!(matches!(err, SessionError::ProcessUnavailable { .. }));
    assert!(registry.is_empty().await);
}
