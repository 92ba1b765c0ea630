//! The monitoring loop.
//!
//! A single coordinating task polls every source, classifies new lines and
//! consults the deduplicator. Resulting work is queued per source and handed
//! to a bounded pool of workers: queues run concurrently, items within one
//! queue run in file order. The loop ticks every `scan_interval`, or early
//! when woken.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{watch, Notify, Semaphore};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::{AgentConfig, ConfigError, ErrorMonitoringConfig};
use crate::providers::LlmProvider;

use super::analysis::{AnalysisClient, AnalysisError, AnalysisRequest};
use super::dedup::{DedupDecision, Deduplicator, ErrorSignature};
use super::patterns::PatternMatcher;
use super::sink::{ResultSink, SinkRecord};
use super::source::{CursorStore, LogSource};
use super::LogEvent;

/// Consecutive auth failures after which records are marked escalated.
const AUTH_ESCALATION_THRESHOLD: u32 = 3;

/// Loop tuning, usually derived from `[error_monitoring]`.
#[derive(Debug, Clone)]
pub struct MonitorSettings {
    /// Time between ticks.
    pub scan_interval: Duration,
    /// Minimum time between live analyses of one signature.
    pub cooldown: Duration,
    /// Lines of context kept per source, the matched line included.
    pub context_lines: usize,
    /// Upper bound on concurrent analyses.
    pub max_workers: usize,
    /// Time in-flight analyses get after shutdown is requested.
    pub shutdown_grace: Duration,
    /// Where cursors are persisted after each tick, if anywhere.
    pub cursor_store: Option<CursorStore>,
}

impl MonitorSettings {
    /// Settings from the config section, persisting cursors to `cursor_path`
    /// when given and enabled.
    pub fn from_config(config: &ErrorMonitoringConfig, cursor_path: Option<PathBuf>) -> Self {
        Self {
            scan_interval: Duration::from_secs(config.scan_interval.max(1)),
            cooldown: Duration::from_secs(config.cooldown_secs),
            context_lines: config.context_lines,
            max_workers: config.max_workers.max(1),
            shutdown_grace: Duration::from_secs(config.shutdown_grace_secs),
            cursor_store: cursor_path
                .filter(|_| config.persist_cursors)
                .map(CursorStore::new),
        }
    }
}

/// Where the loop is in its cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    /// Waiting for the next tick.
    Idle,
    /// Reading sources.
    Polling,
    /// Waiting on analysis workers.
    Processing,
    /// Shut down; no further ticks run.
    Stopped,
}

/// Counters for one tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickSummary {
    /// Complete lines read across all sources.
    pub lines_read: usize,
    /// Lines that matched a pattern.
    pub matches: usize,
    /// Matches the model answered.
    pub analyzed: usize,
    /// Matches suppressed as repeats.
    pub suppressed: usize,
    /// Matches whose analysis failed.
    pub failed: usize,
    /// Sources that could not be read.
    pub source_errors: usize,
    /// Sources found rotated or truncated.
    pub rotations: usize,
}

/// Controls a running loop from other tasks.
#[derive(Debug, Clone)]
pub struct MonitorHandle {
    shutdown_tx: Arc<watch::Sender<bool>>,
    wake: Arc<Notify>,
}

impl MonitorHandle {
    /// Ask the loop to stop. In-flight analyses get the grace period.
    pub fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }

    /// Run the next tick now instead of waiting for the interval.
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    /// The notifier behind [`wake`](Self::wake), for change watchers.
    pub fn wake_signal(&self) -> Arc<Notify> {
        Arc::clone(&self.wake)
    }
}

#[derive(Debug)]
struct SourceSlot {
    source: LogSource,
    context: VecDeque<String>,
}

#[derive(Debug)]
enum WorkItem {
    Analyze {
        event: LogEvent,
        signature: ErrorSignature,
        request: AnalysisRequest,
    },
    Suppress {
        event: LogEvent,
        signature: ErrorSignature,
        occurrence: u64,
        first_seen: DateTime<Utc>,
    },
}

#[derive(Debug, Default, Clone, Copy)]
struct QueueCounts {
    analyzed: usize,
    suppressed: usize,
    failed: usize,
}

impl QueueCounts {
    fn merge(&mut self, other: Self) {
        self.analyzed = self.analyzed.saturating_add(other.analyzed);
        self.suppressed = self.suppressed.saturating_add(other.suppressed);
        self.failed = self.failed.saturating_add(other.failed);
    }
}

/// State shared with workers.
struct Shared {
    client: Arc<AnalysisClient>,
    dedup: Arc<Deduplicator>,
    sink: Arc<dyn ResultSink>,
    cancelled: AtomicBool,
    auth_failures: AtomicU32,
}

/// Periodic poll, classify, deduplicate, analyze pipeline.
pub struct MonitorLoop {
    slots: Vec<SourceSlot>,
    matcher: PatternMatcher,
    shared: Arc<Shared>,
    semaphore: Arc<Semaphore>,
    settings: MonitorSettings,
    state: LoopState,
    wake: Arc<Notify>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    shutdown_rx: watch::Receiver<bool>,
}

impl std::fmt::Debug for MonitorLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MonitorLoop")
            .field("sources", &self.slots.len())
            .field("patterns", &self.matcher.len())
            .field("state", &self.state)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl MonitorLoop {
    /// Assemble a loop from its parts.
    pub fn new(
        sources: Vec<LogSource>,
        matcher: PatternMatcher,
        client: Arc<AnalysisClient>,
        sink: Arc<dyn ResultSink>,
        settings: MonitorSettings,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let slots = sources
            .into_iter()
            .map(|source| SourceSlot {
                source,
                context: VecDeque::new(),
            })
            .collect();
        Self {
            slots,
            matcher,
            shared: Arc::new(Shared {
                client,
                dedup: Arc::new(Deduplicator::new(settings.cooldown)),
                sink,
                cancelled: AtomicBool::new(false),
                auth_failures: AtomicU32::new(0),
            }),
            semaphore: Arc::new(Semaphore::new(settings.max_workers.max(1))),
            settings,
            state: LoopState::Idle,
            wake: Arc::new(Notify::new()),
            shutdown_tx: Arc::new(shutdown_tx),
            shutdown_rx,
        }
    }

    /// Build the full pipeline from configuration.
    ///
    /// Saved cursors are picked up from `cursor_path` when persistence is
    /// enabled; an unreadable cursor file is logged and ignored.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if a log pattern does not compile or none are
    /// configured.
    pub fn from_config(
        config: &AgentConfig,
        provider: Arc<dyn LlmProvider>,
        sink: Arc<dyn ResultSink>,
        cursor_path: Option<PathBuf>,
    ) -> Result<Self, ConfigError> {
        let monitoring = &config.error_monitoring;
        let matcher = PatternMatcher::new(&monitoring.log_patterns)?;
        let settings = MonitorSettings::from_config(monitoring, cursor_path);

        let mut saved = match &settings.cursor_store {
            Some(store) => store.load().unwrap_or_else(|e| {
                warn!(error = %e, "ignoring unreadable cursor state");
                Default::default()
            }),
            None => Default::default(),
        };
        let sources = monitoring
            .log_files
            .iter()
            .map(|path| {
                let cursor = saved.remove(path);
                LogSource::open(path.clone(), monitoring.tail_only, cursor)
            })
            .collect();

        let client = Arc::new(AnalysisClient::new(provider, &config.analysis));
        Ok(Self::new(sources, matcher, client, sink, settings))
    }

    /// A handle for shutdown and wake-up from other tasks.
    pub fn handle(&self) -> MonitorHandle {
        MonitorHandle {
            shutdown_tx: Arc::clone(&self.shutdown_tx),
            wake: Arc::clone(&self.wake),
        }
    }

    /// Current state.
    pub fn state(&self) -> LoopState {
        self.state
    }

    /// The suppression map.
    pub fn deduplicator(&self) -> &Deduplicator {
        &self.shared.dedup
    }

    /// Paths of every monitored source.
    pub fn source_paths(&self) -> Vec<PathBuf> {
        self.slots
            .iter()
            .map(|slot| slot.source.path().to_owned())
            .collect()
    }

    /// Run one poll-and-process cycle.
    pub async fn tick(&mut self) -> TickSummary {
        let mut summary = TickSummary::default();
        if self.state == LoopState::Stopped {
            return summary;
        }

        self.state = LoopState::Polling;
        let queues = self.poll_sources(&mut summary);

        self.state = LoopState::Processing;
        let counts = self.process(queues).await;
        summary.analyzed = counts.analyzed;
        summary.suppressed = counts.suppressed;
        summary.failed = counts.failed;

        let purged = self.shared.dedup.purge_expired();
        if purged > 0 {
            debug!(purged, "expired suppression entries removed");
        }
        self.save_cursors();

        self.state = if self.shared.cancelled.load(Ordering::SeqCst) {
            LoopState::Stopped
        } else {
            LoopState::Idle
        };
        summary
    }

    /// Tick every `scan_interval` (or on wake) until shutdown.
    pub async fn run(mut self) {
        info!(
            sources = self.slots.len(),
            patterns = self.matcher.len(),
            interval_secs = self.settings.scan_interval.as_secs(),
            "monitor started"
        );

        let mut interval = tokio::time::interval(self.settings.scan_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut shutdown_rx = self.shutdown_rx.clone();
        let wake = Arc::clone(&self.wake);

        loop {
            if *shutdown_rx.borrow() || self.state == LoopState::Stopped {
                break;
            }
            tokio::select! {
                _ = interval.tick() => {}
                () = wake.notified() => {
                    debug!("woken early");
                }
                result = shutdown_rx.changed() => {
                    if result.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                    continue;
                }
            }

            let summary = self.tick().await;
            if summary.matches > 0 || summary.source_errors > 0 || summary.rotations > 0 {
                info!(
                    lines = summary.lines_read,
                    matches = summary.matches,
                    analyzed = summary.analyzed,
                    suppressed = summary.suppressed,
                    failed = summary.failed,
                    source_errors = summary.source_errors,
                    rotations = summary.rotations,
                    "tick complete"
                );
            } else {
                debug!(lines = summary.lines_read, "tick complete");
            }
        }

        self.stop();
        info!("monitor stopped");
    }

    /// Mark the loop stopped and persist cursors.
    pub fn stop(&mut self) {
        self.shared.cancelled.store(true, Ordering::SeqCst);
        self.save_cursors();
        self.state = LoopState::Stopped;
    }

    fn poll_sources(&mut self, summary: &mut TickSummary) -> Vec<Vec<WorkItem>> {
        let context_cap = self.settings.context_lines.max(1);
        let mut queues = Vec::new();

        for slot in &mut self.slots {
            let poll = slot.source.poll();

            if poll.rotated {
                summary.rotations = summary.rotations.saturating_add(1);
                slot.context.clear();
                info!(source = %slot.source.id(), "log source rotated, reading from start");
            }
            if let Some(e) = poll.warning {
                summary.source_errors = summary.source_errors.saturating_add(1);
                self.shared
                    .sink
                    .emit(&SinkRecord::source_unavailable(slot.source.id(), e.to_string()));
                continue;
            }

            let mut items = Vec::new();
            for line in poll.lines {
                summary.lines_read = summary.lines_read.saturating_add(1);
                slot.context.push_back(line.text);
                while slot.context.len() > context_cap {
                    slot.context.pop_front();
                }
                let Some(text) = slot.context.back() else {
                    continue;
                };
                let Some(event) = self
                    .matcher
                    .match_line(slot.source.id(), line.byte_offset, text)
                else {
                    continue;
                };
                summary.matches = summary.matches.saturating_add(1);

                let item = match self.shared.dedup.check_at(&event, event.timestamp) {
                    DedupDecision::Analyze { signature } => {
                        let context = slot.context.iter().cloned().collect();
                        WorkItem::Analyze {
                            request: AnalysisRequest::for_event(&event, context),
                            event,
                            signature,
                        }
                    }
                    DedupDecision::Suppress {
                        signature,
                        occurrence,
                        first_seen,
                    } => WorkItem::Suppress {
                        event,
                        signature,
                        occurrence,
                        first_seen,
                    },
                };
                items.push(item);
            }

            if !items.is_empty() {
                queues.push(items);
            }
        }

        queues
    }

    async fn process(&mut self, queues: Vec<Vec<WorkItem>>) -> QueueCounts {
        let mut counts = QueueCounts::default();
        if queues.is_empty() {
            return counts;
        }

        let mut workers = JoinSet::new();
        for items in queues {
            let shared = Arc::clone(&self.shared);
            let semaphore = Arc::clone(&self.semaphore);
            workers.spawn(run_queue(shared, semaphore, items));
        }

        let mut shutdown_rx = self.shutdown_rx.clone();
        loop {
            tokio::select! {
                joined = workers.join_next() => match joined {
                    Some(Ok(done)) => counts.merge(done),
                    Some(Err(e)) => warn!(error = %e, "analysis worker ended abnormally"),
                    None => break,
                },
                () = shutdown_requested(&mut shutdown_rx) => {
                    self.drain_with_grace(&mut workers, &mut counts).await;
                    break;
                }
            }
        }
        counts
    }

    async fn drain_with_grace(
        &self,
        workers: &mut JoinSet<QueueCounts>,
        counts: &mut QueueCounts,
    ) {
        self.shared.cancelled.store(true, Ordering::SeqCst);
        info!(
            in_flight = workers.len(),
            grace_secs = self.settings.shutdown_grace.as_secs(),
            "shutdown requested, waiting for in-flight analyses"
        );

        let deadline = tokio::time::sleep(self.settings.shutdown_grace);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                joined = workers.join_next() => match joined {
                    Some(Ok(done)) => counts.merge(done),
                    Some(Err(e)) => warn!(error = %e, "analysis worker ended abnormally"),
                    None => return,
                },
                () = &mut deadline => {
                    warn!(aborted = workers.len(), "grace period elapsed, aborting analyses");
                    workers.abort_all();
                    while workers.join_next().await.is_some() {}
                    return;
                }
            }
        }
    }

    fn save_cursors(&self) {
        let Some(store) = &self.settings.cursor_store else {
            return;
        };
        if let Err(e) = store.save(self.slots.iter().map(|slot| slot.source.cursor())) {
            warn!(error = %e, "failed to persist cursors");
        }
    }
}

/// Resolves once shutdown has been requested.
async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

/// Process one source's queue in order.
async fn run_queue(
    shared: Arc<Shared>,
    semaphore: Arc<Semaphore>,
    items: Vec<WorkItem>,
) -> QueueCounts {
    let mut counts = QueueCounts::default();
    for item in items {
        if shared.cancelled.load(Ordering::SeqCst) {
            debug!("shutdown in progress, dropping queued work");
            break;
        }
        match item {
            WorkItem::Suppress {
                event,
                signature,
                occurrence,
                first_seen,
            } => {
                shared.sink.emit(&SinkRecord::suppressed(
                    &event, &signature, occurrence, first_seen,
                ));
                counts.suppressed = counts.suppressed.saturating_add(1);
            }
            WorkItem::Analyze {
                event,
                signature,
                request,
            } => {
                let Ok(_permit) = semaphore.acquire().await else {
                    break;
                };
                // Shutdown may have arrived while waiting for a worker slot.
                if shared.cancelled.load(Ordering::SeqCst) {
                    debug!("shutdown in progress, dropping queued work");
                    break;
                }
                let result = shared.client.analyze(&request).await;
                let escalated = track_auth(&shared, &result.outcome);
                match &result.outcome {
                    Ok(text) => {
                        shared.dedup.record(&signature, text.clone());
                        counts.analyzed = counts.analyzed.saturating_add(1);
                    }
                    Err(e) => {
                        shared.dedup.record(&signature, e.to_string());
                        counts.failed = counts.failed.saturating_add(1);
                    }
                }
                shared
                    .sink
                    .emit(&SinkRecord::from_result(&event, &signature, &result, escalated));
            }
        }
    }
    counts
}

/// Update the consecutive auth failure count. Returns whether this outcome
/// should be marked escalated.
fn track_auth<T>(shared: &Shared, outcome: &Result<T, AnalysisError>) -> bool {
    match outcome {
        Ok(_) => {
            shared.auth_failures.store(0, Ordering::SeqCst);
            false
        }
        Err(e) if e.is_auth() => {
            let consecutive = shared
                .auth_failures
                .fetch_add(1, Ordering::SeqCst)
                .saturating_add(1);
            if consecutive >= AUTH_ESCALATION_THRESHOLD {
                error!(
                    consecutive,
                    "authentication failing repeatedly, check the API key"
                );
                true
            } else {
                false
            }
        }
        Err(_) => false,
    }
}
