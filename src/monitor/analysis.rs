//! Remote analysis of error excerpts with retry, backoff and rate limiting.
//!
//! Every outbound attempt takes a token from the shared [`TokenBucket`] and
//! runs under its own timeout. Failures are classified once per attempt:
//! auth and malformed-request errors end the request immediately, anything
//! transient is retried on an exponential schedule with jitter.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::AnalysisConfig;
use crate::prompts;
use crate::providers::{CompletionRequest, LlmProvider, Message, ProviderError};

use super::patterns::Severity;
use super::rate_limit::TokenBucket;
use super::LogEvent;

// ---------------------------------------------------------------------------
// Request / result types
// ---------------------------------------------------------------------------

/// One unit of analysis work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnalysisRequest {
    /// Unique id carried through logs and sink records.
    pub correlation_id: Uuid,
    /// Source the excerpt came from.
    pub source_id: String,
    /// Severity of the matched line, when produced by the monitor.
    pub severity: Option<Severity>,
    /// Context lines, oldest first, ending with the matched line.
    pub excerpt: Vec<String>,
}

impl AnalysisRequest {
    /// A request for a matched event with its preceding context.
    pub fn for_event(event: &LogEvent, context: Vec<String>) -> Self {
        Self {
            correlation_id: Uuid::new_v4(),
            source_id: event.source_id.clone(),
            severity: Some(event.severity),
            excerpt: context,
        }
    }

    /// A request for free text pasted or piped by the user.
    pub fn one_shot(source_id: impl Into<String>, text: &str) -> Self {
        Self {
            correlation_id: Uuid::new_v4(),
            source_id: source_id.into(),
            severity: None,
            excerpt: text.lines().map(str::to_owned).collect(),
        }
    }
}

/// Terminal failure of an analysis request.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AnalysisError {
    /// The endpoint rejected the credential (401/403). Not retried.
    #[error("authentication rejected (HTTP {status}): {message}")]
    Auth {
        /// HTTP status.
        status: u16,
        /// Sanitized error detail.
        message: String,
    },
    /// The request itself was unacceptable or the answer unparseable. Not retried.
    #[error("request rejected: {message}")]
    Request {
        /// HTTP status, when the failure came from one.
        status: Option<u16>,
        /// Sanitized error detail.
        message: String,
    },
    /// Transient failures persisted through every retry.
    #[error("gave up after {attempts} attempts: {message}")]
    Transient {
        /// Detail of the last failure.
        message: String,
        /// Attempts made, the first one included.
        attempts: u32,
    },
}

impl AnalysisError {
    /// Short machine-readable kind used in sink records.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Auth { .. } => "auth",
            Self::Request { .. } => "request",
            Self::Transient { .. } => "transient",
        }
    }

    /// Whether this is an authentication failure.
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Auth { .. })
    }
}

/// Outcome of one request, after all retries.
#[derive(Debug, Clone)]
pub struct AnalysisResult {
    /// Id of the request this answers.
    pub correlation_id: Uuid,
    /// Model text, or the terminal error.
    pub outcome: Result<String, AnalysisError>,
    /// HTTP attempts made.
    pub attempts: u32,
    /// Wall time from first attempt to final outcome, backoff included.
    pub latency: Duration,
}

impl AnalysisResult {
    /// Whether the model answered.
    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }

    /// Model text on success.
    pub fn text(&self) -> Option<&str> {
        self.outcome.as_deref().ok()
    }
}

// ---------------------------------------------------------------------------
// Retry policy
// ---------------------------------------------------------------------------

/// Exponential backoff schedule.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries allowed after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub initial_backoff: Duration,
    /// Upper bound for any single delay, before jitter.
    pub max_backoff: Duration,
    /// Relative jitter applied to each delay (0.1 = +/-10%).
    pub jitter: f64,
}

impl RetryPolicy {
    /// Build from the `[analysis]` section.
    pub fn from_config(config: &AnalysisConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_secs(config.max_backoff_secs),
            jitter: config.jitter.clamp(0.0, 1.0),
        }
    }

    /// Delay before retry number `retry` (1-based), without jitter.
    pub fn base_delay(&self, retry: u32) -> Duration {
        let factor = 2_u32
            .checked_pow(retry.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    /// Delay before retry number `retry` (1-based), with jitter.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let base = self.base_delay(retry);
        if self.jitter <= 0.0 {
            return base;
        }
        let spread = rand::thread_rng().gen_range(-self.jitter..=self.jitter);
        base.mul_f64((1.0 + spread).max(0.0))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&AnalysisConfig::default())
    }
}

// ---------------------------------------------------------------------------
// Excerpt bounding
// ---------------------------------------------------------------------------

/// Join `lines` into an excerpt of at most `max_bytes`, dropping the oldest
/// lines first. If even the newest line alone is too long, its tail is kept.
pub fn truncate_excerpt(lines: &[String], max_bytes: usize) -> String {
    let mut kept: Vec<&str> = Vec::new();
    let mut used = 0_usize;
    for line in lines.iter().rev() {
        let separator = usize::from(!kept.is_empty());
        let cost = line.len().saturating_add(separator);
        if used.saturating_add(cost) > max_bytes {
            break;
        }
        used = used.saturating_add(cost);
        kept.push(line);
    }

    if kept.is_empty() {
        return lines
            .last()
            .map(|line| tail(line, max_bytes).to_owned())
            .unwrap_or_default();
    }

    kept.reverse();
    kept.join("\n")
}

fn tail(line: &str, max_bytes: usize) -> &str {
    let mut start = line.len().saturating_sub(max_bytes);
    while !line.is_char_boundary(start) {
        start = start.saturating_add(1);
    }
    line.get(start..).unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Per-attempt failure classification.
enum AttemptFailure {
    Fatal(AnalysisError),
    Retryable(String),
}

fn classify_failure(error: ProviderError) -> AttemptFailure {
    match error {
        ProviderError::HttpStatus { status, body } => match status {
            401 | 403 => AttemptFailure::Fatal(AnalysisError::Auth {
                status,
                message: body,
            }),
            429 | 500..=599 => AttemptFailure::Retryable(format!("HTTP {status}: {body}")),
            _ => AttemptFailure::Fatal(AnalysisError::Request {
                status: Some(status),
                message: body,
            }),
        },
        ProviderError::Parse(message) => AttemptFailure::Fatal(AnalysisError::Request {
            status: None,
            message,
        }),
        ProviderError::Request(e) if e.is_builder() => {
            AttemptFailure::Fatal(AnalysisError::Request {
                status: None,
                message: e.to_string(),
            })
        }
        ProviderError::Request(e) => AttemptFailure::Retryable(e.to_string()),
    }
}

/// Sends excerpts to the model.
///
/// Cheap to share behind an `Arc`; all mutable state lives in the token
/// bucket.
pub struct AnalysisClient {
    provider: Arc<dyn LlmProvider>,
    policy: RetryPolicy,
    limiter: Arc<TokenBucket>,
    attempt_timeout: Duration,
    max_excerpt_bytes: usize,
    max_tokens: u32,
}

impl std::fmt::Debug for AnalysisClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnalysisClient")
            .field("model", &self.provider.model_id())
            .field("policy", &self.policy)
            .field("attempt_timeout", &self.attempt_timeout)
            .field("max_excerpt_bytes", &self.max_excerpt_bytes)
            .finish_non_exhaustive()
    }
}

impl AnalysisClient {
    /// Build a client around `provider` with settings from `config`.
    pub fn new(provider: Arc<dyn LlmProvider>, config: &AnalysisConfig) -> Self {
        Self {
            provider,
            policy: RetryPolicy::from_config(config),
            limiter: Arc::new(TokenBucket::new(config.requests_per_minute)),
            attempt_timeout: Duration::from_secs(config.request_timeout_secs.max(1)),
            max_excerpt_bytes: config.max_excerpt_bytes,
            max_tokens: config.max_tokens,
        }
    }

    /// Replace the retry policy.
    #[must_use]
    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Share an existing rate limiter instead of the client's own.
    #[must_use]
    pub fn with_limiter(mut self, limiter: Arc<TokenBucket>) -> Self {
        self.limiter = limiter;
        self
    }

    /// Retry policy in effect.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Diagnose an error excerpt.
    pub async fn analyze(&self, request: &AnalysisRequest) -> AnalysisResult {
        let excerpt = truncate_excerpt(&request.excerpt, self.max_excerpt_bytes);
        let origin = request
            .severity
            .map(|severity| (request.source_id.as_str(), severity));
        let prompt = prompts::error_analysis(&excerpt, origin);
        debug!(
            correlation_id = %request.correlation_id,
            source = %request.source_id,
            excerpt_bytes = excerpt.len(),
            "requesting analysis"
        );
        self.run(request.correlation_id, prompt).await
    }

    /// Send a free-form prompt through the same retry path.
    pub async fn ask(&self, prompt: String) -> AnalysisResult {
        self.run(Uuid::new_v4(), prompt).await
    }

    async fn run(&self, correlation_id: Uuid, prompt: String) -> AnalysisResult {
        let completion = CompletionRequest {
            messages: vec![Message::user(prompt)],
            system: Some(prompts::SYSTEM_PROMPT.to_owned()),
            max_tokens: Some(self.max_tokens),
        };
        let started = Instant::now();
        let mut attempts = 0_u32;

        let outcome = loop {
            attempts = attempts.saturating_add(1);
            self.limiter.acquire().await;

            let failure = match tokio::time::timeout(
                self.attempt_timeout,
                self.provider.complete(completion.clone()),
            )
            .await
            {
                Ok(Ok(response)) => break Ok(response.text),
                Ok(Err(e)) => classify_failure(e),
                Err(_) => AttemptFailure::Retryable(format!(
                    "attempt timed out after {}s",
                    self.attempt_timeout.as_secs()
                )),
            };

            match failure {
                AttemptFailure::Fatal(error) => break Err(error),
                AttemptFailure::Retryable(message) if attempts > self.policy.max_retries => {
                    break Err(AnalysisError::Transient { message, attempts });
                }
                AttemptFailure::Retryable(message) => {
                    let delay = self.policy.delay_for(attempts);
                    warn!(
                        correlation_id = %correlation_id,
                        attempt = attempts,
                        delay_ms = delay.as_millis(),
                        error = %message,
                        "transient analysis failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        };

        AnalysisResult {
            correlation_id,
            outcome,
            attempts,
            latency: started.elapsed(),
        }
    }
}
