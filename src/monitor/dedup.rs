//! Cooldown-based suppression of repeated errors.
//!
//! Lines are reduced to an [`ErrorSignature`] by stripping volatile tokens,
//! so "connection to 10.0.0.4 failed after 3012ms" and "connection to
//! 10.0.0.9 failed after 87ms" count as the same fault.

use std::collections::HashMap;
use std::sync::{LazyLock, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Serialize;
use sha2::{Digest, Sha256};

use super::LogEvent;

/// Hex characters kept from the SHA-256 digest.
const SIGNATURE_LEN: usize = 16;

/// Volatile token patterns, applied in order. Earlier, more specific
/// patterns run before the generic number rule eats their digits.
static VOLATILE_TOKENS: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    [
        (
            r"\d{4}-\d{2}-\d{2}[t ]\d{2}:\d{2}:\d{2}(?:[.,]\d+)?(?:z|[+-]\d{2}:?\d{2})?",
            "<ts>",
        ),
        (r"\b[a-z]{3}\s+\d{1,2}\s+\d{2}:\d{2}:\d{2}\b", "<ts>"),
        (r"\b\d{2}:\d{2}:\d{2}(?:[.,]\d+)?\b", "<ts>"),
        (
            r"\b[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}\b",
            "<uuid>",
        ),
        (r"\b0x[0-9a-f]+\b", "<hex>"),
        (r"\b\d{1,3}(?:\.\d{1,3}){3}(?::\d+)?\b", "<ip>"),
        (r"\b[0-9a-f]{12,}\b", "<hex>"),
        (r"\d+", "<n>"),
    ]
    .into_iter()
    .filter_map(|(pattern, placeholder)| Regex::new(pattern).ok().map(|re| (re, placeholder)))
    .collect()
});

/// Reduce a line to its stable shape: lowercase, volatile tokens replaced
/// with placeholders, whitespace collapsed.
pub fn normalize(line: &str) -> String {
    let mut text = line.to_lowercase();
    for (regex, placeholder) in VOLATILE_TOKENS.iter() {
        text = regex.replace_all(&text, *placeholder).into_owned();
    }
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Normalized fingerprint of an error line.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct ErrorSignature(String);

impl ErrorSignature {
    /// Fingerprint a raw line.
    pub fn of(line: &str) -> Self {
        let digest = Sha256::digest(normalize(line).as_bytes());
        let mut hex = hex::encode(digest);
        hex.truncate(SIGNATURE_LEN);
        Self(hex)
    }

    /// Hex form.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ErrorSignature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Book-keeping for one signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuppressionEntry {
    /// Signature this entry tracks.
    pub signature: ErrorSignature,
    /// First occurrence since the entry was last analyzed.
    pub first_seen: DateTime<Utc>,
    /// Most recent occurrence. The cooldown is measured from here.
    pub last_seen: DateTime<Utc>,
    /// Occurrences in the current window, the analyzed one included.
    pub count: u64,
    /// Text of the last analysis recorded for this signature.
    pub last_analysis_result: Option<String>,
}

/// Verdict for one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DedupDecision {
    /// First occurrence in a window; send it for analysis.
    Analyze {
        /// Event signature.
        signature: ErrorSignature,
    },
    /// Repeat within the window; record it without analysis.
    Suppress {
        /// Event signature.
        signature: ErrorSignature,
        /// Position of this event in the window (2 for the first repeat).
        occurrence: u64,
        /// First occurrence in the window.
        first_seen: DateTime<Utc>,
    },
}

impl DedupDecision {
    /// Signature of the event the decision is about.
    pub fn signature(&self) -> &ErrorSignature {
        match self {
            Self::Analyze { signature } | Self::Suppress { signature, .. } => signature,
        }
    }

    /// Whether the event should go to the model.
    pub fn is_analyze(&self) -> bool {
        matches!(self, Self::Analyze { .. })
    }
}

/// Suppression map shared by the monitor loop.
#[derive(Debug)]
pub struct Deduplicator {
    cooldown: chrono::Duration,
    entries: Mutex<HashMap<ErrorSignature, SuppressionEntry>>,
}

impl Deduplicator {
    /// A deduplicator with the given cooldown window. A zero window
    /// disables suppression.
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown: chrono::Duration::from_std(cooldown).unwrap_or(chrono::Duration::MAX),
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Decide on `event` using the current time.
    pub fn check(&self, event: &LogEvent) -> DedupDecision {
        self.check_at(event, Utc::now())
    }

    /// Decide on `event` as of `now`.
    pub fn check_at(&self, event: &LogEvent, now: DateTime<Utc>) -> DedupDecision {
        let signature = ErrorSignature::of(&event.raw_line);
        let mut entries = self.lock();

        match entries.get_mut(&signature) {
            Some(entry) if !self.is_expired(entry, now) => {
                entry.count = entry.count.saturating_add(1);
                entry.last_seen = now;
                DedupDecision::Suppress {
                    signature,
                    occurrence: entry.count,
                    first_seen: entry.first_seen,
                }
            }
            _ => {
                let last_analysis_result = entries
                    .remove(&signature)
                    .and_then(|old| old.last_analysis_result);
                entries.insert(
                    signature.clone(),
                    SuppressionEntry {
                        signature: signature.clone(),
                        first_seen: now,
                        last_seen: now,
                        count: 1,
                        last_analysis_result,
                    },
                );
                DedupDecision::Analyze { signature }
            }
        }
    }

    /// Whether `event` should be analyzed now.
    pub fn should_analyze(&self, event: &LogEvent) -> bool {
        self.check(event).is_analyze()
    }

    /// Whether `event` should be analyzed as of `now`.
    pub fn should_analyze_at(&self, event: &LogEvent, now: DateTime<Utc>) -> bool {
        self.check_at(event, now).is_analyze()
    }

    /// Attach an analysis outcome to the signature's entry, if still present.
    pub fn record(&self, signature: &ErrorSignature, result: impl Into<String>) {
        if let Some(entry) = self.lock().get_mut(signature) {
            entry.last_analysis_result = Some(result.into());
        }
    }

    /// Snapshot of one entry.
    pub fn entry(&self, signature: &ErrorSignature) -> Option<SuppressionEntry> {
        self.lock().get(signature).cloned()
    }

    /// Drop every entry quiet for longer than the cooldown as of `now`.
    /// Returns how many were removed.
    pub fn purge_expired_at(&self, now: DateTime<Utc>) -> usize {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|_, entry| !self.is_expired(entry, now));
        before.saturating_sub(entries.len())
    }

    /// Drop expired entries using the current time.
    pub fn purge_expired(&self) -> usize {
        self.purge_expired_at(Utc::now())
    }

    /// Number of tracked signatures.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether no signatures are tracked.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn is_expired(&self, entry: &SuppressionEntry, now: DateTime<Utc>) -> bool {
        if self.cooldown <= chrono::Duration::zero() {
            return true;
        }
        now.signed_duration_since(entry.last_seen) > self.cooldown
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ErrorSignature, SuppressionEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
