//! Persistent run state.
//!
//! [`PhaseStore`] is the single source of truth for phases, anchors, counters,
//! routing snapshots, usage and proof records. [`FileStore`] keeps each run in
//! its own directory:
//!
//! ```text
//! <root>/runs/<run_id>/
//!   phases.json      ordered phase rows
//!   anchor.json      intention anchor
//!   counters.json    run-level replan/escalation counters
//!   routing.json     frozen routing snapshot
//!   usage.jsonl      usage events
//!   state.log        phase transition journal
//!   proofs/<phase>/attempt-<n>.json
//! ```
//!
//! Every read-modify-write takes an exclusive `flock` on `<run>/.store.lock`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::anchor::IntentionAnchor;
use crate::errors::StoreError;
use crate::lock::{FileGuard, write_atomic};
use crate::orchestrator::proof::ProofRecord;
use crate::phase::{Phase, PhasesFile};
use crate::router::RoutingSnapshot;
use crate::usage::{UsageEvent, UsageLog, load_events, usage_log_path};

const PHASES_FILE: &str = "phases.json";
const ANCHOR_FILE: &str = "anchor.json";
const COUNTERS_FILE: &str = "counters.json";
const ROUTING_FILE: &str = "routing.json";
const STATE_LOG: &str = "state.log";
const STORE_GUARD: &str = ".store.lock";

/// Run-level replan and escalation counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounters {
    #[serde(default)]
    pub replans: u32,
    #[serde(default)]
    pub escalations: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

/// One line of the transition journal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionEntry {
    pub phase_id: String,
    pub attempt_index: u32,
    pub status: String,
    pub timestamp: DateTime<Utc>,
}

/// Storage operations the orchestrator relies on.
///
/// Callbacks take `&mut dyn FnMut` so the trait stays object safe.
pub trait PhaseStore: Send + Sync {
    fn load_phase(&self, run_id: &str, phase_id: &str) -> Result<Phase, StoreError>;

    fn list_phases(&self, run_id: &str) -> Result<Vec<Phase>, StoreError>;

    /// Apply `update` to the stored phase and persist it.
    fn update_phase(
        &self,
        run_id: &str,
        phase_id: &str,
        update: &mut dyn FnMut(&mut Phase),
    ) -> Result<Phase, StoreError>;

    /// Atomically advance `attempt_index` from `expected` to `expected + 1`,
    /// applying `update` in the same write. Fails with `StoreError::Conflict`
    /// if the stored counter is not `expected`.
    fn compare_and_set_attempt(
        &self,
        run_id: &str,
        phase_id: &str,
        expected: u32,
        update: &mut dyn FnMut(&mut Phase),
    ) -> Result<Phase, StoreError>;

    fn load_anchor(&self, run_id: &str) -> Result<IntentionAnchor, StoreError>;

    fn load_counters(&self, run_id: &str) -> Result<RunCounters, StoreError>;

    fn update_counters(
        &self,
        run_id: &str,
        update: &mut dyn FnMut(&mut RunCounters),
    ) -> Result<RunCounters, StoreError>;

    fn load_routing(&self, run_id: &str) -> Result<Option<RoutingSnapshot>, StoreError>;

    fn save_routing(&self, snapshot: &RoutingSnapshot) -> Result<(), StoreError>;

    /// Append a usage event unless its id is already recorded.
    fn record_usage(&self, run_id: &str, event: &UsageEvent) -> Result<bool, StoreError>;

    fn usage_events(&self, run_id: &str) -> Result<Vec<UsageEvent>, StoreError>;

    fn save_proof(&self, proof: &ProofRecord) -> Result<PathBuf, StoreError>;

    fn record_transition(
        &self,
        run_id: &str,
        phase_id: &str,
        attempt_index: u32,
        status: &str,
    ) -> Result<(), StoreError>;
}

/// Check that a run or phase id can name a directory under the store root.
///
/// Ids become path components, so separators, `.`/`..` and empty ids are
/// rejected.
pub fn check_id(kind: &'static str, id: &str) -> Result<(), StoreError> {
    let invalid = id.trim().is_empty()
        || id == "."
        || id == ".."
        || id.contains(['/', '\\', '\0']);
    if invalid {
        return Err(StoreError::InvalidId {
            kind,
            id: id.to_string(),
        });
    }
    Ok(())
}

/// JSON-file implementation of [`PhaseStore`].
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn run_dir(&self, run_id: &str) -> PathBuf {
        self.root.join("runs").join(run_id)
    }

    pub fn proof_path(&self, run_id: &str, phase_id: &str, attempt_index: u32) -> PathBuf {
        self.run_dir(run_id)
            .join("proofs")
            .join(phase_id)
            .join(format!("attempt-{}.json", attempt_index))
    }

    pub fn run_exists(&self, run_id: &str) -> bool {
        self.run_dir(run_id).join(PHASES_FILE).exists()
    }

    /// Run ids with a phases file, sorted.
    pub fn list_runs(&self) -> Result<Vec<String>, StoreError> {
        let runs_dir = self.root.join("runs");
        let entries = match fs::read_dir(&runs_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(StoreError::Io {
                    path: runs_dir,
                    source,
                });
            }
        };
        let mut runs: Vec<String> = entries
            .filter_map(|e| e.ok())
            .filter(|e| e.path().join(PHASES_FILE).exists())
            .filter_map(|e| e.file_name().to_str().map(String::from))
            .collect();
        runs.sort();
        Ok(runs)
    }

    /// Create a run from an anchor and its phases.
    ///
    /// Phases are re-homed to `run_id`. Fails if the run already exists.
    pub fn create_run(
        &self,
        run_id: &str,
        anchor: &IntentionAnchor,
        mut phases: Vec<Phase>,
    ) -> Result<(), StoreError> {
        for phase in &phases {
            check_id("phase", &phase.id)?;
        }
        let _guard = self.guard(run_id)?;
        let phases_path = self.run_dir(run_id).join(PHASES_FILE);
        if phases_path.exists() {
            return Err(StoreError::Corrupt {
                path: phases_path,
                message: format!("run {} already exists", run_id),
            });
        }
        anchor.validate()?;
        for phase in &mut phases {
            phase.run_id = run_id.to_string();
        }
        let file = PhasesFile {
            run_id: run_id.to_string(),
            generated_at: Utc::now().to_rfc3339(),
            phases,
        };
        self.write_json(&self.run_dir(run_id).join(ANCHOR_FILE), anchor)?;
        self.write_json(&phases_path, &file)?;
        tracing::info!(run_id, anchor_digest = %anchor.digest(), "run created");
        Ok(())
    }

    /// Read back the transition journal for a run.
    pub fn transitions(&self, run_id: &str) -> Result<Vec<TransitionEntry>, StoreError> {
        let path = self.run_dir(run_id).join(STATE_LOG);
        let content = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(StoreError::Io { path, source }),
        };

        let mut entries = Vec::new();
        for line in content.lines().filter(|l| !l.trim().is_empty()) {
            let parts: Vec<&str> = line.split('|').collect();
            let parsed = match parts.as_slice() {
                [phase, attempt, status, ts] => attempt.parse::<u32>().ok().zip(
                    DateTime::parse_from_rfc3339(ts).ok(),
                )
                .map(|(attempt_index, ts)| TransitionEntry {
                    phase_id: phase.to_string(),
                    attempt_index,
                    status: status.to_string(),
                    timestamp: ts.with_timezone(&Utc),
                }),
                _ => None,
            };
            match parsed {
                Some(entry) => entries.push(entry),
                None => {
                    return Err(StoreError::Corrupt {
                        path,
                        message: format!("malformed journal line '{}'", line),
                    });
                }
            }
        }
        Ok(entries)
    }

    fn guard(&self, run_id: &str) -> Result<FileGuard, StoreError> {
        check_id("run", run_id)?;
        let path = self.run_dir(run_id).join(STORE_GUARD);
        FileGuard::acquire(&path).map_err(|source| StoreError::Io { path, source })
    }

    fn read_json<T: serde::de::DeserializeOwned>(&self, path: &Path) -> Result<Option<T>, StoreError> {
        let content = match fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(StoreError::Io {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };
        serde_json::from_str(&content)
            .map(Some)
            .map_err(|e| StoreError::Corrupt {
                path: path.to_path_buf(),
                message: e.to_string(),
            })
    }

    fn write_json<T: Serialize>(&self, path: &Path, value: &T) -> Result<(), StoreError> {
        let content = serde_json::to_vec_pretty(value).map_err(|e| StoreError::Corrupt {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        write_atomic(path, &content).map_err(|source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    fn read_phases(&self, run_id: &str) -> Result<(PathBuf, PhasesFile), StoreError> {
        check_id("run", run_id)?;
        let path = self.run_dir(run_id).join(PHASES_FILE);
        let file = self
            .read_json::<PhasesFile>(&path)?
            .ok_or_else(|| StoreError::PhaseNotFound {
                run_id: run_id.to_string(),
                phase_id: "*".to_string(),
            })?;
        Ok((path, file))
    }

    fn mutate_phase(
        &self,
        run_id: &str,
        phase_id: &str,
        expected_attempt: Option<u32>,
        update: &mut dyn FnMut(&mut Phase),
    ) -> Result<Phase, StoreError> {
        let _guard = self.guard(run_id)?;
        let (path, mut file) = self.read_phases(run_id)?;
        let phase = file
            .phases
            .iter_mut()
            .find(|p| p.id == phase_id)
            .ok_or_else(|| StoreError::PhaseNotFound {
                run_id: run_id.to_string(),
                phase_id: phase_id.to_string(),
            })?;

        if let Some(expected) = expected_attempt {
            if phase.attempt_index != expected {
                return Err(StoreError::Conflict {
                    phase_id: phase_id.to_string(),
                    expected,
                    actual: phase.attempt_index,
                });
            }
            phase.attempt_index = expected + 1;
        }
        update(phase);
        let updated = phase.clone();
        self.write_json(&path, &file)?;
        Ok(updated)
    }
}

impl PhaseStore for FileStore {
    fn load_phase(&self, run_id: &str, phase_id: &str) -> Result<Phase, StoreError> {
        let (_, file) = self.read_phases(run_id)?;
        file.phases
            .into_iter()
            .find(|p| p.id == phase_id)
            .ok_or_else(|| StoreError::PhaseNotFound {
                run_id: run_id.to_string(),
                phase_id: phase_id.to_string(),
            })
    }

    fn list_phases(&self, run_id: &str) -> Result<Vec<Phase>, StoreError> {
        Ok(self.read_phases(run_id)?.1.phases)
    }

    fn update_phase(
        &self,
        run_id: &str,
        phase_id: &str,
        update: &mut dyn FnMut(&mut Phase),
    ) -> Result<Phase, StoreError> {
        self.mutate_phase(run_id, phase_id, None, update)
    }

    fn compare_and_set_attempt(
        &self,
        run_id: &str,
        phase_id: &str,
        expected: u32,
        update: &mut dyn FnMut(&mut Phase),
    ) -> Result<Phase, StoreError> {
        self.mutate_phase(run_id, phase_id, Some(expected), update)
    }

    fn load_anchor(&self, run_id: &str) -> Result<IntentionAnchor, StoreError> {
        check_id("run", run_id)?;
        let path = self.run_dir(run_id).join(ANCHOR_FILE);
        if !path.exists() {
            return Err(StoreError::AnchorNotFound {
                run_id: run_id.to_string(),
            });
        }
        Ok(IntentionAnchor::load(&path)?)
    }

    fn load_counters(&self, run_id: &str) -> Result<RunCounters, StoreError> {
        let path = self.run_dir(run_id).join(COUNTERS_FILE);
        Ok(self.read_json(&path)?.unwrap_or_default())
    }

    fn update_counters(
        &self,
        run_id: &str,
        update: &mut dyn FnMut(&mut RunCounters),
    ) -> Result<RunCounters, StoreError> {
        let _guard = self.guard(run_id)?;
        let path = self.run_dir(run_id).join(COUNTERS_FILE);
        let mut counters: RunCounters = self.read_json(&path)?.unwrap_or_default();
        update(&mut counters);
        counters.updated_at = Some(Utc::now());
        self.write_json(&path, &counters)?;
        Ok(counters)
    }

    fn load_routing(&self, run_id: &str) -> Result<Option<RoutingSnapshot>, StoreError> {
        self.read_json(&self.run_dir(run_id).join(ROUTING_FILE))
    }

    fn save_routing(&self, snapshot: &RoutingSnapshot) -> Result<(), StoreError> {
        let _guard = self.guard(&snapshot.run_id)?;
        self.write_json(&self.run_dir(&snapshot.run_id).join(ROUTING_FILE), snapshot)
    }

    fn record_usage(&self, run_id: &str, event: &UsageEvent) -> Result<bool, StoreError> {
        let _guard = self.guard(run_id)?;
        UsageLog::new(&self.root, run_id)
            .record(event)
            .map_err(|e| StoreError::Corrupt {
                path: usage_log_path(&self.root, run_id),
                message: format!("{:#}", e),
            })
    }

    fn usage_events(&self, run_id: &str) -> Result<Vec<UsageEvent>, StoreError> {
        load_events(&self.root, run_id).map_err(|e| StoreError::Corrupt {
            path: usage_log_path(&self.root, run_id),
            message: format!("{:#}", e),
        })
    }

    fn save_proof(&self, proof: &ProofRecord) -> Result<PathBuf, StoreError> {
        let path = self.proof_path(&proof.run_id, &proof.phase_id, proof.attempt_index);
        self.write_json(&path, proof)?;
        Ok(path)
    }

    fn record_transition(
        &self,
        run_id: &str,
        phase_id: &str,
        attempt_index: u32,
        status: &str,
    ) -> Result<(), StoreError> {
        let path = self.run_dir(run_id).join(STATE_LOG);
        let entry = format!(
            "{}|{}|{}|{}\n",
            phase_id,
            attempt_index,
            status,
            Utc::now().to_rfc3339()
        );
        let io_err = |source| StoreError::Io {
            path: path.clone(),
            source,
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(io_err)?
            .write_all(entry.as_bytes())
            .map_err(io_err)
    }
}
