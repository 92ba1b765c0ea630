//! End-to-end monitor loop tests with a scripted provider.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use devops_agent::config::{AgentConfig, AnalysisConfig, PatternSpec};
use devops_agent::monitor::analysis::AnalysisClient;
use devops_agent::monitor::engine::{LoopState, MonitorLoop, MonitorSettings};
use devops_agent::monitor::patterns::PatternMatcher;
use devops_agent::monitor::sink::{RecordOutcome, ResultSink, SinkRecord};
use devops_agent::monitor::source::{CursorStore, LogSource};

use crate::mock_provider::{reply, ScriptedProvider, Step};

#[derive(Default)]
struct RecordingSink {
    records: Mutex<Vec<SinkRecord>>,
}

impl RecordingSink {
    fn records(&self) -> Vec<SinkRecord> {
        self.records.lock().expect("records lock").clone()
    }
}

impl ResultSink for RecordingSink {
    fn emit(&self, record: &SinkRecord) {
        self.records
            .lock()
            .expect("records lock")
            .push(record.clone());
    }
}

fn append(path: &Path, text: &str) {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .expect("open log");
    file.write_all(text.as_bytes()).expect("append");
}

fn settings() -> MonitorSettings {
    MonitorSettings {
        scan_interval: Duration::from_secs(3600),
        cooldown: Duration::from_secs(60),
        context_lines: 5,
        max_workers: 2,
        shutdown_grace: Duration::from_secs(1),
        cursor_store: None,
    }
}

fn analysis_config() -> AnalysisConfig {
    AnalysisConfig {
        jitter: 0.0,
        requests_per_minute: 600,
        ..AnalysisConfig::default()
    }
}

fn build(
    paths: &[PathBuf],
    provider: &Arc<ScriptedProvider>,
    settings: MonitorSettings,
) -> (MonitorLoop, Arc<RecordingSink>) {
    let matcher = PatternMatcher::new(&[
        PatternSpec::Plain("error:".to_owned()),
        PatternSpec::Plain("fatal".to_owned()),
    ])
    .expect("patterns");
    let client = Arc::new(AnalysisClient::new(provider.clone(), &analysis_config()));
    let sink = Arc::new(RecordingSink::default());
    let sources = paths.iter().cloned().map(LogSource::new).collect();
    let monitor = MonitorLoop::new(sources, matcher, client, sink.clone(), settings);
    (monitor, sink)
}

#[tokio::test]
async fn repeated_error_is_analyzed_once_then_suppressed() {
    let dir = tempfile::tempdir().expect("tempdir");
    let log = dir.path().join("app.log");
    append(&log, "INFO ok\nERROR: disk full\nERROR: disk full\n");

    let provider = Arc::new(ScriptedProvider::always(reply("free some space")));
    let (mut monitor, sink) = build(&[log.clone()], &provider, settings());

    let summary = monitor.tick().await;

    assert_eq!(summary.lines_read, 3);
    assert_eq!(summary.matches, 2);
    assert_eq!(summary.analyzed, 1);
    assert_eq!(summary.suppressed, 1);
    assert_eq!(summary.failed, 0);
    assert_eq!(provider.calls(), 1);
    assert_eq!(monitor.state(), LoopState::Idle);

    let records = sink.records();
    assert_eq!(records.len(), 2);
    match &records[0].outcome {
        RecordOutcome::Analyzed { text, attempts, .. } => {
            assert_eq!(text, "free some space");
            assert_eq!(*attempts, 1);
        }
        other => panic!("expected analysis, got {other:?}"),
    }
    assert_eq!(records[0].line.as_deref(), Some("ERROR: disk full"));
    assert!(records[0].correlation_id.is_some());
    assert!(records[1].suppressed);
    assert_eq!(records[1].occurrence, 2);
    assert_eq!(records[0].signature, records[1].signature);

    // Context sent to the model includes the preceding line.
    let prompt = provider.prompts().pop().expect("prompt");
    assert!(prompt.contains("INFO ok\nERROR: disk full"));
}

#[tokio::test]
async fn lines_are_read_once() {
    let dir = tempfile::tempdir().expect("tempdir");
    let log = dir.path().join("app.log");
    append(&log, "ERROR: first\n");

    let provider = Arc::new(ScriptedProvider::always(reply("ok")));
    let (mut monitor, sink) = build(&[log.clone()], &provider, settings());

    monitor.tick().await;
    let second = monitor.tick().await;
    assert_eq!(second.lines_read, 0);
    assert_eq!(sink.records().len(), 1);

    append(&log, "FATAL: second\n");
    let third = monitor.tick().await;
    assert_eq!(third.lines_read, 1);
    assert_eq!(third.analyzed, 1);
    assert_eq!(provider.calls(), 2);
}

#[tokio::test]
async fn missing_source_is_reported_and_others_continue() {
    let dir = tempfile::tempdir().expect("tempdir");
    let present = dir.path().join("present.log");
    let missing = dir.path().join("missing.log");
    append(&present, "ERROR: boom\n");

    let provider = Arc::new(ScriptedProvider::always(reply("ok")));
    let (mut monitor, sink) = build(&[missing.clone(), present], &provider, settings());

    let summary = monitor.tick().await;
    assert_eq!(summary.source_errors, 1);
    assert_eq!(summary.analyzed, 1);

    let records = sink.records();
    let unavailable: Vec<_> = records
        .iter()
        .filter(|r| matches!(r.outcome, RecordOutcome::SourceUnavailable { .. }))
        .collect();
    assert_eq!(unavailable.len(), 1);
    assert_eq!(unavailable[0].source_id, missing.display().to_string());
}

#[tokio::test]
async fn repeated_auth_failures_are_escalated() {
    let dir = tempfile::tempdir().expect("tempdir");
    let log = dir.path().join("app.log");
    append(&log, "ERROR: one\nERROR: two\nERROR: three\n");

    let provider = Arc::new(ScriptedProvider::always(Step::Status(401)));
    let (mut monitor, sink) = build(&[log], &provider, settings());

    let summary = monitor.tick().await;
    assert_eq!(summary.failed, 3);
    assert_eq!(provider.calls(), 3);

    let escalated: Vec<bool> = sink
        .records()
        .iter()
        .map(|r| match &r.outcome {
            RecordOutcome::Failed {
                escalated,
                error_kind,
                ..
            } => {
                assert_eq!(error_kind, "auth");
                *escalated
            }
            other => panic!("expected failure, got {other:?}"),
        })
        .collect();
    assert_eq!(escalated, vec![false, false, true]);
}

#[tokio::test]
async fn success_resets_auth_failure_count() {
    let dir = tempfile::tempdir().expect("tempdir");
    let log = dir.path().join("app.log");
    append(&log, "ERROR: a\nERROR: b\nERROR: c\nERROR: d\n");

    let provider = Arc::new(ScriptedProvider::new(
        vec![Step::Status(401), Step::Status(401), reply("ok")],
        Step::Status(401),
    ));
    let (mut monitor, sink) = build(&[log], &provider, settings());
    monitor.tick().await;

    let escalated = sink.records().iter().any(|r| {
        matches!(
            r.outcome,
            RecordOutcome::Failed {
                escalated: true,
                ..
            }
        )
    });
    assert!(!escalated);
}

#[tokio::test]
async fn cursors_are_persisted_after_each_tick() {
    let dir = tempfile::tempdir().expect("tempdir");
    let log = dir.path().join("app.log");
    append(&log, "INFO a\nINFO b\n");
    let state = dir.path().join("state/cursors.json");

    let provider = Arc::new(ScriptedProvider::always(reply("ok")));
    let settings = MonitorSettings {
        cursor_store: Some(CursorStore::new(state.clone())),
        ..settings()
    };
    let (mut monitor, _sink) = build(&[log.clone()], &provider, settings);
    monitor.tick().await;

    let saved = CursorStore::new(state).load().expect("load cursors");
    let len = std::fs::metadata(&log).expect("metadata").len();
    assert_eq!(saved.get(&log).map(|c| c.byte_offset), Some(len));
}

#[tokio::test]
async fn from_config_resumes_saved_cursors() {
    let dir = tempfile::tempdir().expect("tempdir");
    let log = dir.path().join("app.log");
    let state = dir.path().join("cursors.json");
    append(&log, "ERROR: before restart\n");

    let mut config = AgentConfig::with_credentials("sk-or-test", "mock/model");
    config.error_monitoring.log_files = vec![log.clone()];
    config.analysis = analysis_config();

    let provider = Arc::new(ScriptedProvider::always(reply("ok")));
    let sink = Arc::new(RecordingSink::default());
    let mut first =
        MonitorLoop::from_config(&config, provider.clone(), sink.clone(), Some(state.clone()))
            .expect("build monitor");
    first.tick().await;
    first.stop();
    assert_eq!(first.state(), LoopState::Stopped);

    append(&log, "ERROR: after restart\n");
    let mut second = MonitorLoop::from_config(&config, provider.clone(), sink.clone(), Some(state))
        .expect("build monitor");
    let summary = second.tick().await;
    assert_eq!(summary.lines_read, 1);

    let lines: Vec<_> = sink.records().iter().filter_map(|r| r.line.clone()).collect();
    assert_eq!(lines, vec!["ERROR: before restart", "ERROR: after restart"]);
}

#[tokio::test(start_paused = true)]
async fn shutdown_aborts_hung_analyses_after_grace() {
    let dir = tempfile::tempdir().expect("tempdir");
    let log = dir.path().join("app.log");
    append(&log, "ERROR: stuck\n");

    let provider = Arc::new(ScriptedProvider::always(Step::Hang));
    let (mut monitor, sink) = build(&[log], &provider, settings());
    let handle = monitor.handle();

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.shutdown();
    });
    let summary = monitor.tick().await;

    assert_eq!(monitor.state(), LoopState::Stopped);
    assert_eq!(summary.analyzed, 0);
    assert!(sink.records().is_empty());

    // A stopped loop does no further work.
    assert_eq!(monitor.tick().await, Default::default());
}

#[tokio::test]
async fn run_ticks_immediately_and_stops_on_shutdown() {
    let dir = tempfile::tempdir().expect("tempdir");
    let log = dir.path().join("app.log");
    append(&log, "ERROR: at startup\n");

    let provider = Arc::new(ScriptedProvider::always(reply("ok")));
    let (monitor, sink) = build(&[log.clone()], &provider, settings());
    let handle = monitor.handle();
    let running = tokio::spawn(monitor.run());

    wait_for_records(&sink, 1).await;

    append(&log, "FATAL: woken\n");
    handle.wake();
    wait_for_records(&sink, 2).await;

    handle.shutdown();
    tokio::time::timeout(Duration::from_secs(5), running)
        .await
        .expect("loop should stop")
        .expect("loop task");
    assert_eq!(provider.calls(), 2);
}

async fn wait_for_records(sink: &RecordingSink, n: usize) {
    let waited = tokio::time::timeout(Duration::from_secs(5), async {
        while sink.records().len() < n {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {n} records");
}

#[tokio::test(start_paused = true)]
async fn shutdown_drops_work_waiting_for_a_worker() {
    let dir = tempfile::tempdir().expect("tempdir");
    let first = dir.path().join("first.log");
    let second = dir.path().join("second.log");
    append(&first, "ERROR: disk full\n");
    append(&second, "ERROR: permission denied\n");

    let provider = Arc::new(ScriptedProvider::always(Step::Slow(
        Duration::from_secs(2),
        "ok".to_owned(),
    )));
    let settings = MonitorSettings {
        max_workers: 1,
        shutdown_grace: Duration::from_secs(10),
        ..settings()
    };
    let (mut monitor, sink) = build(&[first, second], &provider, settings);
    let handle = monitor.handle();

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.shutdown();
    });
    let summary = monitor.tick().await;

    // The in-flight analysis finishes within the grace period; the queued
    // one never reaches the provider.
    assert_eq!(provider.calls(), 1);
    assert_eq!(summary.analyzed, 1);
    assert_eq!(sink.records().len(), 1);
    assert_eq!(monitor.state(), LoopState::Stopped);
}

#[tokio::test(start_paused = true)]
async fn workers_stay_bounded_and_sources_keep_file_order() {
    let dir = tempfile::tempdir().expect("tempdir");
    let sources = [
        ("a.log", ["apple", "apricot", "avocado"]),
        ("b.log", ["banana", "blueberry", "boysenberry"]),
        ("c.log", ["cherry", "coconut", "cranberry"]),
    ];
    let mut paths = Vec::new();
    for (name, words) in &sources {
        let path = dir.path().join(name);
        for word in words {
            append(&path, &format!("INFO tick\nERROR: {word} failed\n"));
        }
        paths.push(path);
    }

    let provider = Arc::new(ScriptedProvider::always(Step::Slow(
        Duration::from_millis(50),
        "ok".to_owned(),
    )));
    let settings = MonitorSettings {
        context_lines: 1,
        max_workers: 2,
        ..settings()
    };
    let (mut monitor, _sink) = build(&paths, &provider, settings);

    let summary = monitor.tick().await;
    assert_eq!(summary.analyzed, 9);
    assert_eq!(provider.peak_in_flight(), 2);

    let prompts = provider.prompts();
    let position = |word: &str| {
        let needle = format!("ERROR: {word} failed");
        prompts
            .iter()
            .position(|p| p.contains(&needle))
            .unwrap_or_else(|| panic!("{word} never analyzed"))
    };
    for (_, words) in &sources {
        let order: Vec<usize> = words.iter().map(|w| position(w)).collect();
        assert!(order.windows(2).all(|w| w[0] < w[1]), "{words:?} ran as {order:?}");
    }
}
