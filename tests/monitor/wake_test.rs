//! Change notification tests against the real platform watcher.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;

use devops_agent::monitor::wake::spawn_change_watcher;

#[tokio::test]
async fn append_to_watched_file_wakes() {
    let dir = tempfile::tempdir().expect("tempdir");
    let log = dir.path().join("app.log");
    std::fs::write(&log, "start\n").expect("write log");

    let wake = Arc::new(Notify::new());
    let _watcher = spawn_change_watcher(&[log.clone()], Arc::clone(&wake)).expect("watcher");

    std::fs::write(&log, "start\nERROR: boom\n").expect("rewrite log");
    let woken = tokio::time::timeout(Duration::from_secs(5), wake.notified()).await;
    assert!(woken.is_ok(), "no wake after change");
}

#[tokio::test]
async fn unrelated_file_does_not_wake() {
    let dir = tempfile::tempdir().expect("tempdir");
    let log = dir.path().join("app.log");
    std::fs::write(&log, "start\n").expect("write log");

    let wake = Arc::new(Notify::new());
    let _watcher = spawn_change_watcher(&[log], Arc::clone(&wake)).expect("watcher");

    std::fs::write(dir.path().join("other.txt"), "noise\n").expect("write other");
    let woken = tokio::time::timeout(Duration::from_millis(500), wake.notified()).await;
    assert!(woken.is_err(), "woken by an unrelated file");
}

#[tokio::test]
async fn missing_directory_is_skipped() {
    let dir = tempfile::tempdir().expect("tempdir");
    let log = dir.path().join("absent/app.log");
    let watcher = spawn_change_watcher(&[log], Arc::new(Notify::new()));
    assert!(watcher.is_ok());
}
