//! Continuous log monitoring.
//!
//! Data flows leaf to root: [`source::LogSource`] yields new lines,
//! [`patterns::PatternMatcher`] turns matching lines into [`LogEvent`]s,
//! [`dedup::Deduplicator`] decides whether an event deserves a live analysis,
//! [`analysis::AnalysisClient`] asks the model, and every outcome lands in a
//! [`sink::ResultSink`]. [`engine::MonitorLoop`] drives the whole pipeline.

use chrono::{DateTime, Utc};
use serde::Serialize;

pub mod analysis;
pub mod dedup;
pub mod engine;
pub mod patterns;
pub mod rate_limit;
pub mod sink;
pub mod source;
pub mod wake;

pub use analysis::{AnalysisClient, AnalysisError, AnalysisRequest, AnalysisResult, RetryPolicy};
pub use dedup::{DedupDecision, Deduplicator, ErrorSignature};
pub use engine::{LoopState, MonitorHandle, MonitorLoop, MonitorSettings, TickSummary};
pub use patterns::{PatternMatcher, Severity};
pub use rate_limit::TokenBucket;
pub use sink::{ResultSink, SinkRecord};
pub use source::{CursorStore, LogSource, SourceCursor, SourceError};

/// A log line that matched an error pattern.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogEvent {
    /// Source the line came from.
    pub source_id: String,
    /// The line as read, without its newline.
    pub raw_line: String,
    /// Offset of the line within the source file.
    pub byte_offset: u64,
    /// When the line was classified.
    pub timestamp: DateTime<Utc>,
    /// Source text of the pattern that matched.
    pub matched_pattern: String,
    /// Severity of that pattern.
    pub severity: Severity,
}
