//! Typed error hierarchy for the buildpilot core.
//!
//! One enum per subsystem:
//! - `LockError`: lease, run-lock and subsystem-lock failures
//! - `AnchorError`: intention anchor parsing and validation
//! - `StoreError`: persistent store reads, writes and compare-and-set
//! - `CapabilityError`: external generation/audit invocations
//! - `OrchestratorError`: phase orchestration failures that escape an attempt

use std::path::PathBuf;
use thiserror::Error;

/// Errors from the lock manager.
#[derive(Debug, Error)]
pub enum LockError {
    #[error("Lock '{resource}' is held by {holder}")]
    Held { resource: String, holder: String },

    #[error("Timed out after {waited_ms}ms waiting for lock '{resource}'")]
    Timeout { resource: String, waited_ms: u64 },

    #[error("Timed out acquiring lock '{failed}' (held before failure: {held_before:?})")]
    PartialAcquire {
        failed: String,
        held_before: Vec<String>,
    },

    #[error("Run {run_id} is already being driven by another process ({path})")]
    RunLocked { run_id: String, path: PathBuf },

    #[error("Lease on '{resource}' is no longer owned by {owner}: {detail}")]
    OwnershipLost {
        resource: String,
        owner: String,
        detail: String,
    },

    #[error("Unknown subsystem '{0}'. Valid values: queue, runs, archive, docs")]
    UnknownSubsystem(String),

    #[error("Lock I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Corrupt lease file at {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl LockError {
    /// Contention errors the caller may retry or route around.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Held { .. } | Self::Timeout { .. } | Self::PartialAcquire { .. } | Self::RunLocked { .. }
        )
    }
}

/// Errors from intention anchor construction.
#[derive(Debug, Error)]
pub enum AnchorError {
    #[error("Invalid intention anchor: {0}")]
    Parse(String),

    #[error("Intention anchor requires a non-empty north_star")]
    MissingNorthStar,

    #[error("Intention anchor has a blank entry in {field}")]
    BlankEntry { field: &'static str },

    #[error("Failed to read intention anchor at {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors from the persistent store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Phase {phase_id} not found in run {run_id}")]
    PhaseNotFound { run_id: String, phase_id: String },

    #[error("Intention anchor not found for run {run_id}")]
    AnchorNotFound { run_id: String },

    #[error(
        "Attempt counter for phase {phase_id} changed concurrently (expected {expected}, found {actual})"
    )]
    Conflict {
        phase_id: String,
        expected: u32,
        actual: u32,
    },

    #[error("Store I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid {kind} id '{id}': must be a single path component")]
    InvalidId { kind: &'static str, id: String },

    #[error("Corrupt store record at {path}: {message}")]
    Corrupt { path: PathBuf, message: String },

    #[error(transparent)]
    Anchor(#[from] AnchorError),
}

/// Errors from an external capability invocation.
#[derive(Debug, Error)]
pub enum CapabilityError {
    #[error("Failed to spawn capability command '{command}': {source}")]
    SpawnFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Capability timed out after {secs}s and was terminated")]
    Timeout { secs: u64 },

    #[error("Capability exited with non-zero code {exit_code}: {stderr}")]
    NonZeroExit { exit_code: i32, stderr: String },

    #[error("Capability returned malformed output: {0}")]
    MalformedOutput(String),

    #[error("Capability I/O error: {0}")]
    Io(#[source] std::io::Error),
}

impl CapabilityError {
    /// Error type recorded in a phase's error history for this failure.
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::Timeout { .. } => "capability_timeout",
            Self::SpawnFailed { .. } | Self::Io(_) => "infra_error",
            Self::NonZeroExit { .. } | Self::MalformedOutput(_) => "builder_error",
        }
    }
}

/// Errors that escape the orchestrator (everything an attempt cannot absorb).
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Phase {phase_id} has kind '{kind}' with no registered handler")]
    UnregisteredKind { phase_id: String, kind: String },

    #[error("Routing table has no tier named '{0}'")]
    UnknownTier(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Anchor(#[from] AnchorError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
