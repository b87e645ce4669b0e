//! Failure classification and approach-flaw detection.
//!
//! The analyzer looks at the most recent error records of a phase's current
//! revision epoch and decides whether the failures form a stable pattern (an
//! approach flaw that warrants replanning) or are isolated (retry instead).
//!
//! A window is a flaw when either:
//! - every record shares the same `error_type`, or
//! - similarity detection is enabled and every pair of messages in the window
//!   is a near-duplicate (ratio ≥ threshold), each message being at least
//!   `min_message_length` characters long.
//!
//! Hard ceilings on per-phase and per-run replans stop runaway loops.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::phase::ErrorRecord;
use crate::similarity;

pub const DEFAULT_WINDOW: usize = 3;
pub const DEFAULT_SIMILARITY_THRESHOLD: f64 = 0.8;
pub const DEFAULT_MIN_MESSAGE_LENGTH: usize = 30;
pub const DEFAULT_MAX_REPLANS_PER_PHASE: u32 = 2;
pub const DEFAULT_MAX_REPLANS_PER_RUN: u32 = 5;

/// Error types that terminate a phase immediately.
pub const FATAL_ERROR_TYPES: &[&str] = &[
    "scope_violation",
    "protected_path_violation",
    "permission_denied",
];

/// Whether a failure may be retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    Recoverable,
    Fatal,
}

/// Classify an error type. Anything unrecognized is recoverable.
pub fn classify(error_type: &str) -> FailureClass {
    if FATAL_ERROR_TYPES.contains(&error_type) {
        FailureClass::Fatal
    } else {
        FailureClass::Recoverable
    }
}

/// Analyzer tuning. The similarity constants are empirical, hence configurable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplanConfig {
    #[serde(default = "default_window")]
    pub window: usize,
    #[serde(default = "default_similarity_enabled")]
    pub similarity_enabled: bool,
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f64,
    #[serde(default = "default_min_message_length")]
    pub min_message_length: usize,
    #[serde(default = "default_max_replans_per_phase")]
    pub max_replans_per_phase: u32,
    #[serde(default = "default_max_replans_per_run")]
    pub max_replans_per_run: u32,
}

fn default_window() -> usize {
    DEFAULT_WINDOW
}

fn default_similarity_enabled() -> bool {
    true
}

fn default_similarity_threshold() -> f64 {
    DEFAULT_SIMILARITY_THRESHOLD
}

fn default_min_message_length() -> usize {
    DEFAULT_MIN_MESSAGE_LENGTH
}

fn default_max_replans_per_phase() -> u32 {
    DEFAULT_MAX_REPLANS_PER_PHASE
}

fn default_max_replans_per_run() -> u32 {
    DEFAULT_MAX_REPLANS_PER_RUN
}

impl Default for ReplanConfig {
    fn default() -> Self {
        Self {
            window: default_window(),
            similarity_enabled: default_similarity_enabled(),
            similarity_threshold: default_similarity_threshold(),
            min_message_length: default_min_message_length(),
            max_replans_per_phase: default_max_replans_per_phase(),
            max_replans_per_run: default_max_replans_per_run(),
        }
    }
}

/// Outcome of a replan check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplanVerdict {
    pub replan: bool,
    pub flaw_type: Option<String>,
}

impl ReplanVerdict {
    pub fn no() -> Self {
        Self {
            replan: false,
            flaw_type: None,
        }
    }

    pub fn flaw(flaw_type: &str) -> Self {
        Self {
            replan: true,
            flaw_type: Some(flaw_type.to_string()),
        }
    }

    pub fn as_tuple(&self) -> (bool, Option<&str>) {
        (self.replan, self.flaw_type.as_deref())
    }
}

impl fmt::Display for ReplanVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.flaw_type {
            Some(t) if self.replan => write!(f, "replan ({})", t),
            _ => write!(f, "no replan"),
        }
    }
}

/// Deterministic approach-flaw detector.
#[derive(Debug, Clone, Default)]
pub struct ReplanAnalyzer {
    config: ReplanConfig,
}

impl ReplanAnalyzer {
    pub fn new(config: ReplanConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ReplanConfig {
        &self.config
    }

    /// Whether the replan ceilings still permit a replan.
    pub fn replan_permitted(&self, replans_for_phase: u32, replans_for_run: u32) -> bool {
        replans_for_phase < self.config.max_replans_per_phase
            && replans_for_run < self.config.max_replans_per_run
    }

    /// Decide whether `history` shows a stable approach flaw.
    ///
    /// `history` is expected to be ordered by attempt index and already scoped
    /// to the approach under consideration.
    pub fn should_replan(
        &self,
        history: &[ErrorRecord],
        replans_for_phase: u32,
        replans_for_run: u32,
    ) -> ReplanVerdict {
        if !self.replan_permitted(replans_for_phase, replans_for_run) {
            tracing::debug!(
                replans_for_phase,
                replans_for_run,
                "replan ceiling reached"
            );
            return ReplanVerdict::no();
        }

        let window = self.config.window.max(1);
        if history.len() < window {
            return ReplanVerdict::no();
        }
        let recent = &history[history.len() - window..];

        let first_type = &recent[0].error_type;
        if recent.iter().all(|r| &r.error_type == first_type) {
            return ReplanVerdict::flaw(first_type);
        }

        if self.config.similarity_enabled && self.messages_near_duplicate(recent) {
            let latest = &recent[recent.len() - 1].error_type;
            return ReplanVerdict::flaw(latest);
        }

        ReplanVerdict::no()
    }

    fn messages_near_duplicate(&self, recent: &[ErrorRecord]) -> bool {
        let min_len = self.config.min_message_length;
        if recent
            .iter()
            .any(|r| r.error_details.trim().chars().count() < min_len)
        {
            return false;
        }
        recent.iter().enumerate().all(|(i, a)| {
            recent[i + 1..].iter().all(|b| {
                similarity::ratio(&a.error_details, &b.error_details)
                    >= self.config.similarity_threshold
            })
        })
    }
}
