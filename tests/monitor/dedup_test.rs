//! Suppression window tests.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};

use devops_agent::monitor::dedup::{DedupDecision, Deduplicator, ErrorSignature};
use devops_agent::monitor::patterns::Severity;
use devops_agent::monitor::LogEvent;

fn event(line: &str) -> LogEvent {
    LogEvent {
        source_id: "/var/log/app.log".to_owned(),
        raw_line: line.to_owned(),
        byte_offset: 0,
        timestamp: Utc::now(),
        matched_pattern: "error:".to_owned(),
        severity: Severity::High,
    }
}

fn t0() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2024-05-01T12:00:00Z")
        .expect("valid timestamp")
        .with_timezone(&Utc)
}

fn secs(n: i64) -> TimeDelta {
    TimeDelta::seconds(n)
}

#[test]
fn first_occurrence_is_analyzed_and_repeat_suppressed() {
    let dedup = Deduplicator::new(Duration::from_secs(60));
    let e = event("ERROR: disk full");

    assert!(dedup.check_at(&e, t0()).is_analyze());
    match dedup.check_at(&e, t0() + secs(5)) {
        DedupDecision::Suppress {
            occurrence,
            first_seen,
            signature,
        } => {
            assert_eq!(occurrence, 2);
            assert_eq!(first_seen, t0());
            assert_eq!(signature, ErrorSignature::of("ERROR: disk full"));
        }
        other => panic!("expected suppression, got {other:?}"),
    }
    match dedup.check_at(&e, t0() + secs(6)) {
        DedupDecision::Suppress { occurrence, .. } => assert_eq!(occurrence, 3),
        other => panic!("expected suppression, got {other:?}"),
    }
}

#[test]
fn window_reopens_after_cooldown() {
    let dedup = Deduplicator::new(Duration::from_secs(60));
    let e = event("ERROR: disk full");

    assert!(dedup.should_analyze_at(&e, t0()));
    assert!(!dedup.should_analyze_at(&e, t0() + secs(60)));
    assert!(dedup.should_analyze_at(&e, t0() + secs(121)));

    let sig = ErrorSignature::of(&e.raw_line);
    let entry = dedup.entry(&sig).expect("entry");
    assert_eq!(entry.count, 1);
    assert_eq!(entry.first_seen, t0() + secs(121));
}

#[test]
fn repeats_keep_extending_the_cooldown() {
    let dedup = Deduplicator::new(Duration::from_secs(60));
    let e = event("ERROR: disk full");

    assert!(dedup.should_analyze_at(&e, t0()));
    assert!(!dedup.should_analyze_at(&e, t0() + secs(40)));
    // 80s after the first hit but only 40s after the last one.
    assert!(!dedup.should_analyze_at(&e, t0() + secs(80)));

    let entry = dedup.entry(&ErrorSignature::of(&e.raw_line)).expect("entry");
    assert_eq!(entry.count, 3);
    assert_eq!(entry.first_seen, t0());
    assert_eq!(entry.last_seen, t0() + secs(80));
}

#[test]
fn steady_burst_is_analyzed_once() {
    let dedup = Deduplicator::new(Duration::from_secs(60));
    let e = event("ERROR: connection reset");

    let granted: Vec<i64> = (0..600)
        .step_by(5)
        .filter(|s| dedup.should_analyze_at(&e, t0() + secs(*s)))
        .collect();
    assert_eq!(granted, vec![0]);

    // A quiet spell longer than the cooldown reopens the window.
    assert!(dedup.should_analyze_at(&e, t0() + secs(595 + 61)));
}

#[test]
fn volatile_tokens_do_not_split_signatures() {
    let dedup = Deduplicator::new(Duration::from_secs(600));
    let a = event("2024-05-01T12:00:01Z ERROR: timeout after 3012ms talking to 10.0.0.4:5432");
    let b = event("2024-05-01T12:03:17Z ERROR: timeout after 87ms talking to 10.0.0.9:5432");

    assert_eq!(
        ErrorSignature::of(&a.raw_line),
        ErrorSignature::of(&b.raw_line)
    );
    assert!(dedup.should_analyze_at(&a, t0()));
    assert!(!dedup.should_analyze_at(&b, t0() + secs(1)));
}

#[test]
fn distinct_errors_are_tracked_separately() {
    let dedup = Deduplicator::new(Duration::from_secs(600));
    assert!(dedup.should_analyze_at(&event("ERROR: disk full"), t0()));
    assert!(dedup.should_analyze_at(&event("ERROR: permission denied"), t0()));
    assert_eq!(dedup.len(), 2);
}

#[test]
fn purge_removes_only_expired_entries() {
    let dedup = Deduplicator::new(Duration::from_secs(60));
    dedup.check_at(&event("ERROR: old"), t0());
    dedup.check_at(&event("ERROR: recurring"), t0());
    dedup.check_at(&event("ERROR: recurring"), t0() + secs(50));

    assert_eq!(dedup.purge_expired_at(t0() + secs(70)), 1);
    assert_eq!(dedup.len(), 1);
    assert!(dedup.entry(&ErrorSignature::of("ERROR: recurring")).is_some());
}

#[test]
fn record_attaches_last_result() {
    let dedup = Deduplicator::new(Duration::from_secs(60));
    let e = event("ERROR: disk full");
    let sig = dedup.check_at(&e, t0()).signature().clone();

    dedup.record(&sig, "free some space");
    let entry = dedup.entry(&sig).expect("entry");
    assert_eq!(entry.last_analysis_result.as_deref(), Some("free some space"));
}

#[test]
fn zero_cooldown_disables_suppression() {
    let dedup = Deduplicator::new(Duration::ZERO);
    let e = event("ERROR: disk full");
    assert!(dedup.should_analyze_at(&e, t0()));
    assert!(dedup.should_analyze_at(&e, t0()));
}
