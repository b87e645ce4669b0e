//! Phase definition, state machine states, and JSON loading.
//!
//! This module provides:
//! - `Phase`: one unit of change work driven through bounded attempts
//! - `PhaseState`: lifecycle states, with `Complete` and `Failed` terminal
//! - `ErrorRecord`: one entry of a phase's rolling error history
//! - `PhasesFile`: the `phases.json` format that seeds a run

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

/// Default attempt ceiling for a phase.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Default handler kind for phases that do not name one.
pub const DEFAULT_PHASE_KIND: &str = "build";

/// Lifecycle state of a phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseState {
    #[default]
    Queued,
    Executing,
    AwaitingAudit,
    Complete,
    Failed,
    /// Halted awaiting operator input.
    Blocked,
}

impl PhaseState {
    /// No further attempts occur once a phase reaches a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }
}

impl fmt::Display for PhaseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Queued => "queued",
            Self::Executing => "executing",
            Self::AwaitingAudit => "awaiting_audit",
            Self::Complete => "complete",
            Self::Failed => "failed",
            Self::Blocked => "blocked",
        };
        write!(f, "{}", s)
    }
}

/// Why a phase ended in `Failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", tag = "code", content = "detail")]
pub enum FailureReason {
    /// An attempt was requested after the ceiling had already been reached.
    AttemptsExhausted,
    /// The final permitted attempt failed without a detected approach flaw.
    MaxAttemptsExhausted,
    /// A single attempt hit an unrecoverable condition.
    Fatal(String),
    /// The stuck resolution policy chose to stop.
    Stopped,
}

impl FailureReason {
    pub fn code(&self) -> &'static str {
        match self {
            Self::AttemptsExhausted => "ATTEMPTS_EXHAUSTED",
            Self::MaxAttemptsExhausted => "MAX_ATTEMPTS_EXHAUSTED",
            Self::Fatal(_) => "FATAL",
            Self::Stopped => "STOPPED",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fatal(detail) => write!(f, "FAILED: FATAL ({})", detail),
            other => write!(f, "FAILED: {}", other.code()),
        }
    }
}

/// One failed attempt in a phase's error history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub attempt_index: u32,
    pub error_type: String,
    pub error_details: String,
    pub timestamp: DateTime<Utc>,
    /// Revision epoch the attempt ran under.
    #[serde(default)]
    pub revision_epoch: u32,
}

impl ErrorRecord {
    pub fn new(
        attempt_index: u32,
        error_type: impl Into<String>,
        error_details: impl Into<String>,
        revision_epoch: u32,
    ) -> Self {
        Self {
            attempt_index,
            error_type: error_type.into(),
            error_details: error_details.into(),
            timestamp: Utc::now(),
            revision_epoch,
        }
    }
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

fn default_kind() -> String {
    DEFAULT_PHASE_KIND.to_string()
}

/// A single unit of change work within a run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Phase {
    pub id: String,
    pub run_id: String,
    /// Free-text goal handed to the generation capability.
    pub goal: String,
    /// Ordered target deliverables.
    #[serde(default)]
    pub deliverables: Vec<String>,
    /// Handler kind tag, resolved through the handler registry.
    #[serde(default = "default_kind")]
    pub kind: String,
    #[serde(default)]
    pub state: PhaseState,
    #[serde(default)]
    pub attempt_index: u32,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// 0 = base tier; capped at one escalation per phase lifetime.
    #[serde(default)]
    pub escalation_level: u32,
    /// Current execution tier name. Empty means the routing table's base tier.
    #[serde(default)]
    pub tier: String,
    #[serde(default)]
    pub revision_epoch: u32,
    #[serde(default)]
    pub replan_count: u32,
    #[serde(default)]
    pub error_history: Vec<ErrorRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<FailureReason>,
    /// Success criteria postponed by applied scope reductions.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deferred_criteria: Vec<String>,
}

impl Phase {
    /// Create a queued phase with default ceilings.
    pub fn new(id: &str, run_id: &str, goal: &str, deliverables: Vec<String>) -> Self {
        Self {
            id: id.to_string(),
            run_id: run_id.to_string(),
            goal: goal.to_string(),
            deliverables,
            kind: default_kind(),
            state: PhaseState::Queued,
            attempt_index: 0,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            escalation_level: 0,
            tier: String::new(),
            revision_epoch: 0,
            replan_count: 0,
            error_history: Vec::new(),
            failure_reason: None,
            deferred_criteria: Vec::new(),
        }
    }

    pub fn with_kind(mut self, kind: &str) -> Self {
        self.kind = kind.to_string();
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn attempts_remaining(&self) -> u32 {
        self.max_attempts.saturating_sub(self.attempt_index)
    }

    /// Errors recorded under the current revision epoch, oldest first.
    pub fn current_epoch_errors(&self) -> Vec<&ErrorRecord> {
        self.error_history
            .iter()
            .filter(|e| e.revision_epoch == self.revision_epoch)
            .collect()
    }

    /// Count of trailing failures under the current revision epoch.
    pub fn consecutive_failures(&self) -> u32 {
        self.current_epoch_errors().len() as u32
    }

    /// Mark the phase failed with the given reason.
    pub fn fail(&mut self, reason: FailureReason) {
        self.state = PhaseState::Failed;
        self.failure_reason = Some(reason);
    }

    /// Record a replan: bump the revision epoch and the phase replan count.
    pub fn begin_revision(&mut self) {
        self.revision_epoch += 1;
        self.replan_count += 1;
    }
}

/// Represents the full phases.json file format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhasesFile {
    pub run_id: String,
    /// Timestamp when phases were generated
    pub generated_at: String,
    pub phases: Vec<Phase>,
}

impl PhasesFile {
    /// Load phases from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read phases file: {}", path.display()))?;

        let phases_file: PhasesFile = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse phases JSON: {}", path.display()))?;

        Ok(phases_file)
    }

    /// Save phases to a JSON file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content =
            serde_json::to_string_pretty(self).context("Failed to serialize phases to JSON")?;

        std::fs::write(path, content)
            .with_context(|| format!("Failed to write phases file: {}", path.display()))?;

        Ok(())
    }

    /// Get a specific phase by id.
    pub fn get_phase(&self, id: &str) -> Option<&Phase> {
        self.phases.iter().find(|p| p.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_phase_new_defaults() {
        let phase = Phase::new("p1", "run-1", "Add parser", vec!["src/parser.rs".into()]);

        assert_eq!(phase.state, PhaseState::Queued);
        assert_eq!(phase.attempt_index, 0);
        assert_eq!(phase.max_attempts, 5);
        assert_eq!(phase.kind, "build");
        assert_eq!(phase.attempts_remaining(), 5);
        assert!(!phase.is_terminal());
    }

    #[test]
    fn test_terminal_states() {
        assert!(PhaseState::Complete.is_terminal());
        assert!(PhaseState::Failed.is_terminal());
        assert!(!PhaseState::Blocked.is_terminal());
        assert!(!PhaseState::AwaitingAudit.is_terminal());
    }

    #[test]
    fn test_failure_reason_display() {
        assert_eq!(
            FailureReason::MaxAttemptsExhausted.to_string(),
            "FAILED: MAX_ATTEMPTS_EXHAUSTED"
        );
        assert_eq!(
            FailureReason::AttemptsExhausted.to_string(),
            "FAILED: ATTEMPTS_EXHAUSTED"
        );
        assert!(
            FailureReason::Fatal("protected path".into())
                .to_string()
                .contains("protected path")
        );
    }

    #[test]
    fn test_current_epoch_errors_ignore_previous_approach() {
        let mut phase = Phase::new("p1", "run-1", "goal", vec![]);
        phase
            .error_history
            .push(ErrorRecord::new(0, "auditor_reject", "old approach", 0));
        phase.begin_revision();
        phase
            .error_history
            .push(ErrorRecord::new(1, "builder_error", "new approach", 1));

        let current = phase.current_epoch_errors();
        assert_eq!(current.len(), 1);
        assert_eq!(current[0].error_type, "builder_error");
        assert_eq!(phase.consecutive_failures(), 1);
        assert_eq!(phase.replan_count, 1);
    }

    #[test]
    fn test_phase_deserialization_with_defaults() {
        let json = r#"{
            "id": "p1",
            "run_id": "run-1",
            "goal": "Write docs"
        }"#;

        let phase: Phase = serde_json::from_str(json).unwrap();
        assert_eq!(phase.max_attempts, DEFAULT_MAX_ATTEMPTS);
        assert_eq!(phase.kind, "build");
        assert!(phase.deliverables.is_empty());
        assert!(phase.failure_reason.is_none());
    }

    #[test]
    fn test_failure_reason_serialization() {
        let json = serde_json::to_string(&FailureReason::MaxAttemptsExhausted).unwrap();
        assert!(json.contains("MAX_ATTEMPTS_EXHAUSTED"));
        let parsed: FailureReason = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, FailureReason::MaxAttemptsExhausted);
    }

    #[test]
    fn test_phases_file_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("phases.json");

        let pf = PhasesFile {
            run_id: "run-1".into(),
            generated_at: "2026-01-23T12:00:00Z".into(),
            phases: vec![
                Phase::new("p1", "run-1", "Scaffold", vec!["Cargo.toml".into()]),
                Phase::new("p2", "run-1", "Docs", vec![]).with_kind("docs"),
            ],
        };
        pf.save(&path).unwrap();

        let loaded = PhasesFile::load(&path).unwrap();
        assert_eq!(loaded.phases.len(), 2);
        assert_eq!(loaded.get_phase("p2").unwrap().kind, "docs");
        assert!(loaded.get_phase("p9").is_none());
    }

    #[test]
    fn test_phases_file_load_invalid_json() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("phases.json");
        fs::write(&path, "{ invalid json }").unwrap();

        let result = PhasesFile::load(&path);
        assert!(
            result
                .unwrap_err()
                .to_string()
                .contains("Failed to parse phases JSON")
        );
    }
}
