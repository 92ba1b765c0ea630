//! Destinations for monitoring outcomes.
//!
//! Every event the monitor handles ends as exactly one [`SinkRecord`]:
//! analyzed, suppressed, failed, or a source that could not be read.

use std::io::Write;
use std::path::Path;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::analysis::{AnalysisError, AnalysisResult};
use super::dedup::ErrorSignature;
use super::patterns::Severity;
use super::LogEvent;

/// What happened to an event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RecordOutcome {
    /// The model answered.
    Analyzed {
        /// Model text (markdown).
        text: String,
        /// Time to answer, retries included.
        latency_ms: u64,
        /// HTTP attempts made.
        attempts: u32,
    },
    /// A repeat within the cooldown window; no analysis was requested.
    Suppressed {
        /// First occurrence in the current window.
        first_seen: DateTime<Utc>,
    },
    /// Analysis ended in a terminal error.
    Failed {
        /// `auth`, `request` or `transient`.
        error_kind: String,
        /// Error detail.
        message: String,
        /// HTTP attempts made.
        attempts: u32,
        /// Set once authentication has failed repeatedly.
        escalated: bool,
    },
    /// The source could not be read this tick.
    SourceUnavailable {
        /// Read error detail.
        message: String,
    },
}

/// One structured result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SinkRecord {
    /// When the record was produced.
    pub timestamp: DateTime<Utc>,
    /// Source the event came from.
    pub source_id: String,
    /// Severity of the matched line.
    pub severity: Option<Severity>,
    /// Deduplication signature of the matched line.
    pub signature: Option<ErrorSignature>,
    /// The matched line.
    pub line: Option<String>,
    /// Whether analysis was skipped as a repeat.
    pub suppressed: bool,
    /// Position of the event within its cooldown window (1 = analyzed one).
    pub occurrence: u64,
    /// Correlation id of the analysis request, if one was made.
    pub correlation_id: Option<Uuid>,
    /// Outcome details.
    #[serde(flatten)]
    pub outcome: RecordOutcome,
}

impl SinkRecord {
    fn for_event(event: &LogEvent, signature: &ErrorSignature, outcome: RecordOutcome) -> Self {
        Self {
            timestamp: Utc::now(),
            source_id: event.source_id.clone(),
            severity: Some(event.severity),
            signature: Some(signature.clone()),
            line: Some(event.raw_line.clone()),
            suppressed: false,
            occurrence: 1,
            correlation_id: None,
            outcome,
        }
    }

    /// A successful or failed analysis.
    pub fn from_result(
        event: &LogEvent,
        signature: &ErrorSignature,
        result: &AnalysisResult,
        escalated: bool,
    ) -> Self {
        let outcome = match &result.outcome {
            Ok(text) => RecordOutcome::Analyzed {
                text: text.clone(),
                latency_ms: u64::try_from(result.latency.as_millis()).unwrap_or(u64::MAX),
                attempts: result.attempts,
            },
            Err(e) => failed_outcome(e, result.attempts, escalated),
        };
        Self {
            correlation_id: Some(result.correlation_id),
            ..Self::for_event(event, signature, outcome)
        }
    }

    /// A repeat that was not analyzed.
    pub fn suppressed(
        event: &LogEvent,
        signature: &ErrorSignature,
        occurrence: u64,
        first_seen: DateTime<Utc>,
    ) -> Self {
        Self {
            suppressed: true,
            occurrence,
            ..Self::for_event(event, signature, RecordOutcome::Suppressed { first_seen })
        }
    }

    /// A source that failed to read.
    pub fn source_unavailable(source_id: &str, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            source_id: source_id.to_owned(),
            severity: None,
            signature: None,
            line: None,
            suppressed: false,
            occurrence: 0,
            correlation_id: None,
            outcome: RecordOutcome::SourceUnavailable {
                message: message.into(),
            },
        }
    }
}

fn failed_outcome(error: &AnalysisError, attempts: u32, escalated: bool) -> RecordOutcome {
    RecordOutcome::Failed {
        error_kind: error.kind().to_owned(),
        message: error.to_string(),
        attempts,
        escalated,
    }
}

/// Receives records. Implementations must not block for long; they run on
/// analysis workers.
pub trait ResultSink: Send + Sync {
    /// Deliver one record. Delivery failures are logged, never returned.
    fn emit(&self, record: &SinkRecord);
}

// ---------------------------------------------------------------------------
// Implementations
// ---------------------------------------------------------------------------

/// Emits records as structured `tracing` events.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl ResultSink for TracingSink {
    fn emit(&self, record: &SinkRecord) {
        let signature = record.signature.as_ref().map(ErrorSignature::as_str);
        match &record.outcome {
            RecordOutcome::Analyzed {
                latency_ms,
                attempts,
                ..
            } => info!(
                source = %record.source_id,
                signature,
                correlation_id = ?record.correlation_id,
                latency_ms,
                attempts,
                "error analyzed"
            ),
            RecordOutcome::Suppressed { first_seen } => info!(
                source = %record.source_id,
                signature,
                occurrence = record.occurrence,
                first_seen = %first_seen,
                "duplicate error suppressed"
            ),
            RecordOutcome::Failed {
                error_kind,
                message,
                attempts,
                escalated,
            } => error!(
                source = %record.source_id,
                signature,
                correlation_id = ?record.correlation_id,
                error_kind = %error_kind,
                attempts,
                escalated,
                error = %message,
                "error analysis failed"
            ),
            RecordOutcome::SourceUnavailable { message } => warn!(
                source = %record.source_id,
                error = %message,
                "log source unavailable"
            ),
        }
    }
}

/// Appends one JSON object per record to a file.
pub struct JsonlSink {
    writer: Mutex<Box<dyn Write + Send>>,
}

impl std::fmt::Debug for JsonlSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonlSink").finish_non_exhaustive()
    }
}

impl JsonlSink {
    /// Open (or create) `path` for appending.
    ///
    /// # Errors
    ///
    /// Returns an error if the file or its parent directory cannot be created.
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        Ok(Self::from_writer(Box::new(file)))
    }

    /// Write to an arbitrary writer (for testing).
    pub fn from_writer(writer: Box<dyn Write + Send>) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }
}

impl ResultSink for JsonlSink {
    fn emit(&self, record: &SinkRecord) {
        let line = match serde_json::to_string(record) {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "failed to serialize sink record");
                return;
            }
        };
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(e) = writeln!(writer, "{line}").and_then(|()| writer.flush()) {
            warn!(error = %e, "failed to write sink record");
        }
    }
}

/// Prints human-readable records, for the `check` command.
pub struct ConsoleSink {
    writer: Mutex<Box<dyn Write + Send>>,
}

impl std::fmt::Debug for ConsoleSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsoleSink").finish_non_exhaustive()
    }
}

impl Default for ConsoleSink {
    fn default() -> Self {
        Self::from_writer(Box::new(std::io::stdout()))
    }
}

impl ConsoleSink {
    /// Print to stdout.
    pub fn stdout() -> Self {
        Self::default()
    }

    /// Print to an arbitrary writer (for testing).
    pub fn from_writer(writer: Box<dyn Write + Send>) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }
}

fn render(record: &SinkRecord) -> String {
    let severity = record.severity.map_or("-", Severity::label);
    let line = record.line.as_deref().unwrap_or_default();
    match &record.outcome {
        RecordOutcome::Analyzed { text, .. } => format!(
            "## [{severity}] {source}\n\n> {line}\n\n{text}\n",
            source = record.source_id
        ),
        RecordOutcome::Suppressed { first_seen } => format!(
            "- [{severity}] {source}: suppressed, occurrence {n} since {first_seen}: {line}\n",
            source = record.source_id,
            n = record.occurrence,
            first_seen = first_seen.format("%Y-%m-%d %H:%M:%S UTC")
        ),
        RecordOutcome::Failed {
            message, escalated, ..
        } => {
            let hint = if *escalated {
                " (authentication failing repeatedly, check the API key)"
            } else {
                ""
            };
            format!(
                "- [{severity}] {source}: analysis failed: {message}{hint}\n  > {line}\n",
                source = record.source_id
            )
        }
        RecordOutcome::SourceUnavailable { message } => {
            format!("- {source}: unavailable: {message}\n", source = record.source_id)
        }
    }
}

impl ResultSink for ConsoleSink {
    fn emit(&self, record: &SinkRecord) {
        let text = render(record);
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(e) = writer.write_all(text.as_bytes()).and_then(|()| writer.flush()) {
            warn!(error = %e, "failed to print record");
        }
    }
}

/// Forwards every record to several sinks in order.
#[derive(Default)]
pub struct FanoutSink {
    sinks: Vec<Box<dyn ResultSink>>,
}

impl std::fmt::Debug for FanoutSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FanoutSink")
            .field("sinks", &self.sinks.len())
            .finish()
    }
}

impl FanoutSink {
    /// An empty fan-out.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a sink.
    #[must_use]
    pub fn with(mut self, sink: impl ResultSink + 'static) -> Self {
        self.sinks.push(Box::new(sink));
        self
    }
}

impl ResultSink for FanoutSink {
    fn emit(&self, record: &SinkRecord) {
        for sink in &self.sinks {
            sink.emit(record);
        }
    }
}
