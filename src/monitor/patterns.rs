//! Log line classification against the configured error patterns.
//!
//! Patterns are compiled once, case-insensitively, and evaluated most severe
//! first. The first pattern that matches decides the severity.

use std::cmp::Reverse;

use chrono::Utc;
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

use crate::config::{ConfigError, PatternSpec};

use super::LogEvent;

/// Severity level attached to a matched line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Information only, no action needed.
    Low,
    /// May need attention soon.
    Medium,
    /// Needs attention now.
    High,
    /// System is down or at risk.
    Critical,
}

impl Severity {
    /// Return a numeric rank for sorting (higher = more severe).
    pub fn rank(self) -> u8 {
        match self {
            Self::Low => 0,
            Self::Medium => 1,
            Self::High => 2,
            Self::Critical => 3,
        }
    }

    /// Lowercase label used in records and prompts.
    pub fn label(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    /// Guess a severity from the keywords in a pattern's source text.
    pub fn infer(pattern: &str) -> Self {
        let lower = pattern.to_lowercase();
        if ["fatal", "critical", "panic"]
            .iter()
            .any(|kw| lower.contains(kw))
        {
            Self::Critical
        } else if lower.contains("error") {
            Self::High
        } else if lower.contains("exception") {
            Self::Medium
        } else if lower.contains("fail") {
            Self::Low
        } else {
            Self::Medium
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// A compiled pattern.
#[derive(Debug, Clone)]
struct Pattern {
    id: String,
    regex: Regex,
    severity: Severity,
}

/// Result of a successful classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification<'a> {
    /// Severity of the winning pattern.
    pub severity: Severity,
    /// Source text of the winning pattern.
    pub pattern_id: &'a str,
}

/// Ordered, immutable set of compiled patterns.
#[derive(Debug, Clone)]
pub struct PatternMatcher {
    patterns: Vec<Pattern>,
}

impl PatternMatcher {
    /// Compile `specs` into a matcher.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidPattern`] for the first pattern that does
    /// not compile, or [`ConfigError::Missing`] for an empty set.
    pub fn new(specs: &[PatternSpec]) -> Result<Self, ConfigError> {
        if specs.is_empty() {
            return Err(ConfigError::Missing("error_monitoring.log_patterns"));
        }

        let mut patterns = specs
            .iter()
            .map(|spec| {
                let source = spec.regex();
                let regex = RegexBuilder::new(source)
                    .case_insensitive(true)
                    .build()
                    .map_err(|e| ConfigError::InvalidPattern {
                        pattern: source.to_owned(),
                        source: e,
                    })?;
                let severity = match spec {
                    PatternSpec::Plain(text) => Severity::infer(text),
                    PatternSpec::Detailed { severity, .. } => *severity,
                };
                Ok(Pattern {
                    id: source.to_owned(),
                    regex,
                    severity,
                })
            })
            .collect::<Result<Vec<_>, ConfigError>>()?;

        // Stable: equal severities keep their configured order.
        patterns.sort_by_key(|p| Reverse(p.severity.rank()));

        Ok(Self { patterns })
    }

    /// Classify a single line. `None` means no pattern matched.
    pub fn classify(&self, line: &str) -> Option<Classification<'_>> {
        self.patterns
            .iter()
            .find(|p| p.regex.is_match(line))
            .map(|p| Classification {
                severity: p.severity,
                pattern_id: &p.id,
            })
    }

    /// Classify a line and build a [`LogEvent`] when it matches.
    pub fn match_line(&self, source_id: &str, byte_offset: u64, line: &str) -> Option<LogEvent> {
        self.classify(line).map(|c| LogEvent {
            source_id: source_id.to_owned(),
            raw_line: line.to_owned(),
            byte_offset,
            timestamp: Utc::now(),
            matched_pattern: c.pattern_id.to_owned(),
            severity: c.severity,
        })
    }

    /// Pattern ids in evaluation order.
    pub fn evaluation_order(&self) -> Vec<&str> {
        self.patterns.iter().map(|p| p.id.as_str()).collect()
    }

    /// Number of compiled patterns.
    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    /// Whether the matcher holds no patterns. Always false once constructed.
    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}
