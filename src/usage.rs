//! Deterministic usage accounting.
//!
//! Usage events are immutable records appended to a per-run JSONL log. Totals
//! are a pure, order-independent sum over a set of events, so the same event
//! set always yields identical totals no matter how it was read back.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::anchor::Budgets;

pub const USAGE_LOG_FILE: &str = "usage.jsonl";

/// One discrete unit of resource consumption.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageEvent {
    /// Opaque id. Re-recording an existing id is a no-op.
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub tokens_used: u64,
    #[serde(default)]
    pub context_chars_used: u64,
    #[serde(default)]
    pub sot_chars_used: u64,
}

impl UsageEvent {
    pub fn new(event_id: impl Into<String>, tokens_used: u64, context_chars_used: u64) -> Self {
        Self {
            event_id: event_id.into(),
            timestamp: Utc::now(),
            tokens_used,
            context_chars_used,
            sot_chars_used: 0,
        }
    }

    pub fn with_sot_chars(mut self, sot_chars_used: u64) -> Self {
        self.sot_chars_used = sot_chars_used;
        self
    }

    /// Event id for one charged attempt of a phase.
    pub fn attempt_id(run_id: &str, phase_id: &str, attempt_index: u32) -> String {
        format!("{}:{}:{}", run_id, phase_id, attempt_index)
    }
}

/// Order-independent sum over a set of usage events.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UsageTotals {
    pub tokens_used: u64,
    pub context_chars_used: u64,
    pub sot_chars_used: u64,
    pub event_count: u64,
}

/// Sum a set of events. Saturates instead of overflowing.
pub fn aggregate<'a, I>(events: I) -> UsageTotals
where
    I: IntoIterator<Item = &'a UsageEvent>,
{
    events
        .into_iter()
        .fold(UsageTotals::default(), |acc, e| UsageTotals {
            tokens_used: acc.tokens_used.saturating_add(e.tokens_used),
            context_chars_used: acc.context_chars_used.saturating_add(e.context_chars_used),
            sot_chars_used: acc.sot_chars_used.saturating_add(e.sot_chars_used),
            event_count: acc.event_count.saturating_add(1),
        })
}

/// Path of the usage log for a run under the artifact root.
pub fn usage_log_path(root: &Path, run_id: &str) -> PathBuf {
    root.join("runs").join(run_id).join(USAGE_LOG_FILE)
}

/// Load the usage events recorded for a run.
///
/// A missing log yields an empty set. Duplicate ids keep the first occurrence.
pub fn load_events(root: &Path, run_id: &str) -> Result<Vec<UsageEvent>> {
    read_log(&usage_log_path(root, run_id))
}

fn read_log(path: &Path) -> Result<Vec<UsageEvent>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read usage log: {}", path.display()))?;

    let mut seen = HashSet::new();
    let mut events = Vec::new();
    for (lineno, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let event: UsageEvent = serde_json::from_str(line).with_context(|| {
            format!(
                "Failed to parse usage event at {}:{}",
                path.display(),
                lineno + 1
            )
        })?;
        if seen.insert(event.event_id.clone()) {
            events.push(event);
        }
    }
    Ok(events)
}

/// Append-only usage log for one run.
pub struct UsageLog {
    path: PathBuf,
}

impl UsageLog {
    pub fn new(root: &Path, run_id: &str) -> Self {
        Self {
            path: usage_log_path(root, run_id),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append an event unless its id is already recorded.
    ///
    /// Returns `false` when the event was a duplicate.
    pub fn record(&self, event: &UsageEvent) -> Result<bool> {
        let existing = read_log(&self.path)?;
        if existing.iter().any(|e| e.event_id == event.event_id) {
            return Ok(false);
        }
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).context("Failed to create usage log directory")?;
        }
        let mut line = serde_json::to_string(event).context("Failed to serialize usage event")?;
        line.push('\n');
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .context("Failed to open usage log")?
            .write_all(line.as_bytes())
            .context("Failed to write usage event")?;
        Ok(true)
    }

    pub fn totals(&self) -> Result<UsageTotals> {
        Ok(aggregate(&read_log(&self.path)?))
    }
}

/// Budget ceilings checked against usage totals. A ceiling of 0 is unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BudgetLimits {
    pub max_tokens: u64,
    pub max_context_chars: u64,
    pub max_sot_chars: u64,
}

impl BudgetLimits {
    pub fn from_anchor(budgets: &Budgets, max_tokens: u64) -> Self {
        Self {
            max_tokens,
            max_context_chars: budgets.max_context_chars,
            max_sot_chars: budgets.max_sot_chars,
        }
    }
}

/// Fraction of budget left in the tightest dimension, clamped to [0, 1].
pub fn remaining_fraction(totals: &UsageTotals, limits: &BudgetLimits) -> f64 {
    [
        (totals.tokens_used, limits.max_tokens),
        (totals.context_chars_used, limits.max_context_chars),
        (totals.sot_chars_used, limits.max_sot_chars),
    ]
    .iter()
    .filter(|(_, limit)| *limit > 0)
    .map(|(used, limit)| 1.0 - (*used as f64 / *limit as f64))
    .fold(1.0_f64, f64::min)
    .clamp(0.0, 1.0)
}

/// Per-decision-cycle cache of budget checks keyed by totals.
///
/// Owned by the caller and reset at phase boundaries.
#[derive(Debug, Default)]
pub struct BudgetCache {
    entries: HashMap<UsageTotals, f64>,
    hits: u64,
}

impl BudgetCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn remaining_fraction(&mut self, totals: &UsageTotals, limits: &BudgetLimits) -> f64 {
        if let Some(cached) = self.entries.get(totals) {
            self.hits += 1;
            return *cached;
        }
        let fraction = remaining_fraction(totals, limits);
        self.entries.insert(*totals, fraction);
        fraction
    }

    pub fn hits(&self) -> u64 {
        self.hits
    }

    pub fn reset(&mut self) {
        self.entries.clear();
        self.hits = 0;
    }
}
