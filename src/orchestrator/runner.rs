//! Attempt execution and the drive loop.
//!
//! [`PhaseOrchestrator::execute_attempt`] runs exactly one bounded attempt:
//! generate, record usage, check touched paths, audit, then classify and
//! persist the result through the store. Stuck handling on top of a failed
//! attempt lives in `resolution.rs`.

use anyhow::anyhow;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::timeout;

use crate::anchor::IntentionAnchor;
use crate::capability::{
    AuditCapability, AuditVerdict, GenerationCapability, GenerationOutput, GenerationRequest,
};
use crate::config::Config;
use crate::errors::{CapabilityError, OrchestratorError};
use crate::lock::{LeaseConfig, LeaseManager, Owner, RunLock, Subsystem, SubsystemLocks};
use crate::orchestrator::handlers::HandlerRegistry;
use crate::orchestrator::proof::ProofRecord;
use crate::phase::{ErrorRecord, FailureReason, Phase, PhaseState};
use crate::replan::{FailureClass, ReplanAnalyzer, ReplanConfig, classify};
use crate::router::{RoutingSnapshot, TierRouter, TierTable};
use crate::orchestrator::resolution::needs_human;
use crate::store::{PhaseStore, RunCounters, check_id};
use crate::stuck::{StuckConfig, StuckPolicy, StuckResolution};
use crate::usage::{BudgetCache, UsageEvent};

pub const DEFAULT_CAPABILITY_TIMEOUT_SECS: u64 = 900;
pub const DEFAULT_MAX_OUTPUT_BUDGET: u64 = 200_000;

/// Error type recorded when a rejection carries no classification.
pub const AUDITOR_REJECT: &str = "auditor_reject";
pub const PROTECTED_PATH_VIOLATION: &str = "protected_path_violation";
pub const SCOPE_VIOLATION: &str = "scope_violation";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    Complete,
    Failed,
    ReplanRequested,
    Blocked,
    /// Recoverable failure; the phase stays queued for another attempt.
    Retry,
}

impl AttemptStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Complete => "complete",
            Self::Failed => "failed",
            Self::ReplanRequested => "replan_requested",
            Self::Blocked => "blocked",
            Self::Retry => "retry",
        }
    }

    pub fn should_continue(&self) -> bool {
        matches!(self, Self::Retry | Self::ReplanRequested)
    }
}

impl fmt::Display for AttemptStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Snapshot of a phase's counters plus the run's, taken after a step.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PhaseCounters {
    pub attempt_index: u32,
    pub max_attempts: u32,
    pub revision_epoch: u32,
    pub replan_count: u32,
    pub escalation_level: u32,
    pub tier: String,
    pub run: RunCounters,
}

impl PhaseCounters {
    pub fn new(phase: &Phase, run: RunCounters) -> Self {
        Self {
            attempt_index: phase.attempt_index,
            max_attempts: phase.max_attempts,
            revision_epoch: phase.revision_epoch,
            replan_count: phase.replan_count,
            escalation_level: phase.escalation_level,
            tier: phase.tier.clone(),
            run,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttemptOutcome {
    pub status: AttemptStatus,
    pub counters: PhaseCounters,
    pub should_continue: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<FailureReason>,
    /// The error recorded by this attempt, if it failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorRecord>,
}

/// Result of one [`advance`](PhaseOrchestrator::advance) step.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepOutcome {
    pub status: AttemptStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolution: Option<StuckResolution>,
    pub should_continue: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<FailureReason>,
    pub counters: PhaseCounters,
}

impl StepOutcome {
    pub(crate) fn from_attempt(outcome: AttemptOutcome) -> Self {
        Self {
            status: outcome.status,
            resolution: None,
            should_continue: outcome.should_continue,
            reason: outcome.reason,
            counters: outcome.counters,
        }
    }
}

/// Tunables for one orchestrator instance.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub max_output_budget: u64,
    /// Run-wide token ceiling; 0 is unlimited.
    pub max_tokens: u64,
    pub capability_timeout: Duration,
    pub replan: ReplanConfig,
    pub stuck: StuckConfig,
    pub lease: LeaseConfig,
    pub routing: TierTable,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            max_output_budget: DEFAULT_MAX_OUTPUT_BUDGET,
            max_tokens: 0,
            capability_timeout: Duration::from_secs(DEFAULT_CAPABILITY_TIMEOUT_SECS),
            replan: ReplanConfig::default(),
            stuck: StuckConfig::default(),
            lease: LeaseConfig::default(),
            routing: TierTable::default(),
        }
    }
}

impl OrchestratorSettings {
    pub fn from_config(config: &Config) -> Self {
        let toml = &config.toml;
        Self {
            max_output_budget: toml.orchestrator.max_output_budget,
            max_tokens: toml.orchestrator.max_tokens,
            capability_timeout: config.capability_timeout(),
            replan: toml.replan.clone(),
            stuck: toml.stuck.clone(),
            lease: config.lease_config(),
            routing: toml.routing.clone(),
        }
    }
}

/// Drives phases of a run through bounded attempts.
pub struct PhaseOrchestrator {
    pub(crate) root: PathBuf,
    pub(crate) store: Arc<dyn PhaseStore>,
    generator: Arc<dyn GenerationCapability>,
    auditor: Arc<dyn AuditCapability>,
    handlers: HandlerRegistry,
    pub(crate) analyzer: ReplanAnalyzer,
    pub(crate) policy: StuckPolicy,
    locks: LeaseManager,
    owner: Owner,
    pub(crate) settings: OrchestratorSettings,
    pub(crate) budget_cache: Mutex<BudgetCache>,
}

impl PhaseOrchestrator {
    pub fn new(
        root: &Path,
        store: Arc<dyn PhaseStore>,
        generator: Arc<dyn GenerationCapability>,
        auditor: Arc<dyn AuditCapability>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            root: root.to_path_buf(),
            store,
            generator,
            auditor,
            handlers: HandlerRegistry::with_defaults(),
            analyzer: ReplanAnalyzer::new(settings.replan.clone()),
            policy: StuckPolicy::new(settings.stuck.clone()),
            locks: LeaseManager::for_root(root, settings.lease.clone()),
            owner: Owner::current("orchestrator"),
            settings,
            budget_cache: Mutex::new(BudgetCache::new()),
        }
    }

    pub fn with_handlers(mut self, handlers: HandlerRegistry) -> Self {
        self.handlers = handlers;
        self
    }

    pub fn with_owner(mut self, owner: Owner) -> Self {
        self.owner = owner;
        self
    }

    pub fn store(&self) -> &Arc<dyn PhaseStore> {
        &self.store
    }

    pub fn handlers(&self) -> &HandlerRegistry {
        &self.handlers
    }

    pub fn owner(&self) -> &Owner {
        &self.owner
    }

    /// Check every phase of the run against the handler registry.
    pub fn validate_run(&self, run_id: &str) -> Result<Vec<Phase>, OrchestratorError> {
        let phases = self.store.list_phases(run_id)?;
        self.handlers.validate(&phases)?;
        Ok(phases)
    }

    /// Router over the run's frozen routing snapshot, capturing it on first use.
    pub fn router(&self, run_id: &str) -> Result<TierRouter, OrchestratorError> {
        let snapshot = match self.store.load_routing(run_id)? {
            Some(snapshot) => snapshot,
            None => {
                let snapshot = RoutingSnapshot::capture(run_id, &self.settings.routing);
                self.store.save_routing(&snapshot)?;
                tracing::info!(
                    run_id,
                    version = snapshot.table.version,
                    tiers = snapshot.table.tiers.len(),
                    "routing snapshot captured"
                );
                snapshot
            }
        };
        Ok(TierRouter::new(snapshot))
    }

    pub fn run_counters(&self, run_id: &str) -> Result<RunCounters, OrchestratorError> {
        Ok(self.store.load_counters(run_id)?)
    }

    pub(crate) fn counters(&self, phase: &Phase) -> Result<PhaseCounters, OrchestratorError> {
        let run = self.store.load_counters(&phase.run_id)?;
        Ok(PhaseCounters::new(phase, run))
    }

    fn outcome(
        &self,
        phase: &Phase,
        status: AttemptStatus,
        reason: Option<FailureReason>,
        error: Option<ErrorRecord>,
    ) -> Result<AttemptOutcome, OrchestratorError> {
        Ok(AttemptOutcome {
            status,
            counters: self.counters(phase)?,
            should_continue: status.should_continue(),
            reason,
            error,
        })
    }

    pub(crate) fn reset_budget_cache(&self) {
        self.budget_cache
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .reset();
    }

    /// Run `f` while holding the `runs` subsystem lease.
    pub(crate) async fn with_runs_lock<T>(
        &self,
        f: impl FnOnce() -> Result<T, OrchestratorError>,
    ) -> Result<T, OrchestratorError> {
        let locks = self.locks.clone();
        let owner = self.owner.clone();
        let wait = self.settings.lease.acquire_timeout;
        let guard = tokio::task::spawn_blocking(move || {
            SubsystemLocks::acquire(&locks, &[Subsystem::Runs], &owner, wait)
        })
        .await
        .map_err(|e| anyhow!("lock task failed: {}", e))??;
        let result = f();
        guard.release();
        result
    }

    async fn generate(
        &self,
        request: &GenerationRequest,
    ) -> Result<GenerationOutput, CapabilityError> {
        let limit = self.settings.capability_timeout;
        match timeout(limit, self.generator.generate(request)).await {
            Ok(result) => result,
            Err(_) => Err(CapabilityError::Timeout {
                secs: limit.as_secs(),
            }),
        }
    }

    async fn review(&self, artifact: &str, task: &str) -> Result<AuditVerdict, CapabilityError> {
        let limit = self.settings.capability_timeout;
        match timeout(limit, self.auditor.review(artifact, task)).await {
            Ok(result) => result,
            Err(_) => Err(CapabilityError::Timeout {
                secs: limit.as_secs(),
            }),
        }
    }

    /// Execute one attempt of a phase.
    ///
    /// A phase that is terminal, blocked or out of attempts returns without
    /// calling either capability and without writing anything.
    pub async fn execute_attempt(
        &self,
        run_id: &str,
        phase_id: &str,
    ) -> Result<AttemptOutcome, OrchestratorError> {
        let phase = self.store.load_phase(run_id, phase_id)?;

        match phase.state {
            PhaseState::Complete => {
                return self.outcome(&phase, AttemptStatus::Complete, None, None);
            }
            PhaseState::Failed => {
                let reason = phase.failure_reason.clone();
                return self.outcome(&phase, AttemptStatus::Failed, reason, None);
            }
            PhaseState::Blocked => {
                return self.outcome(&phase, AttemptStatus::Blocked, None, None);
            }
            _ => {}
        }
        if phase.attempt_index >= phase.max_attempts {
            tracing::warn!(
                run_id,
                phase_id,
                attempt_index = phase.attempt_index,
                max_attempts = phase.max_attempts,
                "no attempts remaining"
            );
            return self.outcome(
                &phase,
                AttemptStatus::Failed,
                Some(FailureReason::AttemptsExhausted),
                None,
            );
        }

        let handler = self.handlers.resolve(&phase)?;
        let anchor = self.store.load_anchor(run_id)?;
        let router = self.router(run_id)?;
        let tier = router.resolve(&phase.tier)?.clone();
        let attempt = phase.attempt_index;
        let epoch = phase.revision_epoch;
        let started_at = Utc::now();

        let tier_name = tier.name.clone();
        let phase = self.store.update_phase(run_id, phase_id, &mut |p| {
            p.state = PhaseState::Executing;
            if p.tier.is_empty() {
                p.tier = tier_name.clone();
            }
        })?;
        self.store
            .record_transition(run_id, phase_id, attempt, "executing")?;
        tracing::info!(run_id, phase_id, attempt, tier = %tier.name, "attempt started");

        let task = handler.task_description(&phase, &anchor);
        let request = GenerationRequest {
            run_id: run_id.to_string(),
            phase_id: phase_id.to_string(),
            attempt_index: attempt,
            task_description: task.clone(),
            allowed_scope: anchor.scope.allowed_paths.clone(),
            max_output_budget: self.settings.max_output_budget,
            target: tier.target.clone(),
        };

        let mut touched_paths = Vec::new();
        let mut tokens_used = 0;
        let mut verdict = None;
        let failure = match self.generate(&request).await {
            Err(err) => {
                tracing::warn!(run_id, phase_id, attempt, error = %err, "generation failed");
                Some((err.error_type().to_string(), err.to_string()))
            }
            Ok(output) => {
                let event = UsageEvent::new(
                    UsageEvent::attempt_id(run_id, phase_id, attempt),
                    output.tokens_used,
                    output.context_chars,
                );
                if !self.store.record_usage(run_id, &event)? {
                    tracing::debug!(event_id = %event.event_id, "usage already recorded");
                }
                touched_paths = output.touched_paths.clone();
                tokens_used = output.tokens_used;

                if let Some(reported) = output.error {
                    Some((reported.error_type, reported.details))
                } else if let Some(violation) = path_violation(&anchor, &output.touched_paths) {
                    Some(violation)
                } else {
                    self.store.update_phase(run_id, phase_id, &mut |p| {
                        p.state = PhaseState::AwaitingAudit;
                    })?;
                    self.store
                        .record_transition(run_id, phase_id, attempt, "awaiting_audit")?;
                    match self.review(&output.artifact, &task).await {
                        Err(err) => Some((err.error_type().to_string(), err.to_string())),
                        Ok(v) => {
                            let failure = (!v.approved).then(|| {
                                (
                                    v.error_type.clone().unwrap_or_else(|| AUDITOR_REJECT.into()),
                                    rejection_details(&v),
                                )
                            });
                            verdict = Some(v);
                            failure
                        }
                    }
                }
            }
        };

        let (status, reason, error, phase) = match &failure {
            None => {
                let phase =
                    self.store
                        .compare_and_set_attempt(run_id, phase_id, attempt, &mut |p| {
                            p.state = PhaseState::Complete;
                            p.failure_reason = None;
                        })?;
                tracing::info!(run_id, phase_id, attempt, "phase complete");
                (AttemptStatus::Complete, None, None, phase)
            }
            Some((error_type, details)) => {
                let record = ErrorRecord::new(attempt, error_type.as_str(), details.as_str(), epoch);
                let (status, reason, phase) = self.record_failure(run_id, phase_id, &record).await?;
                (status, reason, Some(record), phase)
            }
        };

        let proof = ProofRecord {
            run_id: run_id.to_string(),
            phase_id: phase_id.to_string(),
            attempt_index: attempt,
            revision_epoch: epoch,
            tier: tier.name.clone(),
            target: tier.target.clone(),
            status: status.as_str().to_string(),
            error_type: failure.as_ref().map(|(t, _)| t.clone()),
            error_details: failure.as_ref().map(|(_, d)| d.clone()),
            touched_paths,
            tokens_used,
            verdict,
            anchor_digest: anchor.digest(),
            started_at,
            finished_at: Utc::now(),
        };
        let proof_path = self.store.save_proof(&proof)?;
        self.store
            .record_transition(run_id, phase_id, attempt, status.as_str())?;
        tracing::debug!(path = %proof_path.display(), "proof written");

        self.outcome(&phase, status, reason, error)
    }

    /// Persist a failed attempt and decide what it means for the phase.
    async fn record_failure(
        &self,
        run_id: &str,
        phase_id: &str,
        record: &ErrorRecord,
    ) -> Result<(AttemptStatus, Option<FailureReason>, Phase), OrchestratorError> {
        let attempt = record.attempt_index;

        if classify(&record.error_type) == FailureClass::Fatal {
            let reason = FailureReason::Fatal(format!(
                "{}: {}",
                record.error_type, record.error_details
            ));
            let phase = self
                .store
                .compare_and_set_attempt(run_id, phase_id, attempt, &mut |p| {
                    p.error_history.push(record.clone());
                    p.fail(reason.clone());
                })?;
            tracing::error!(
                run_id,
                phase_id,
                attempt,
                error_type = %record.error_type,
                "fatal failure"
            );
            return Ok((AttemptStatus::Failed, Some(reason), phase));
        }

        // Safety and ambiguity outrank attempt exhaustion.
        if needs_human(&record.error_type) {
            let phase = self
                .store
                .compare_and_set_attempt(run_id, phase_id, attempt, &mut |p| {
                    p.error_history.push(record.clone());
                    p.state = PhaseState::Blocked;
                })?;
            tracing::warn!(
                run_id,
                phase_id,
                attempt,
                error_type = %record.error_type,
                "phase blocked pending human review"
            );
            return Ok((AttemptStatus::Blocked, None, phase));
        }

        let phase = self
            .store
            .compare_and_set_attempt(run_id, phase_id, attempt, &mut |p| {
                p.error_history.push(record.clone());
                p.state = PhaseState::Queued;
                if p.attempt_index >= p.max_attempts {
                    p.fail(FailureReason::MaxAttemptsExhausted);
                }
            })?;
        if phase.state == PhaseState::Failed {
            tracing::warn!(run_id, phase_id, attempt, "max attempts exhausted");
            return Ok((
                AttemptStatus::Failed,
                Some(FailureReason::MaxAttemptsExhausted),
                phase,
            ));
        }

        match self.consult_analyzer(run_id, phase_id).await {
            Ok(Some(phase)) => Ok((AttemptStatus::ReplanRequested, None, phase)),
            Ok(None) => Ok((AttemptStatus::Retry, None, phase)),
            Err(OrchestratorError::Lock(err)) if err.is_retryable() => {
                tracing::warn!(run_id, phase_id, error = %err, "analyzer skipped, runs lock busy");
                Ok((AttemptStatus::Retry, None, phase))
            }
            Err(err) => Err(err),
        }
    }

    /// Run the replan analyzer over the current approach's errors and, on a
    /// positive verdict, start a new revision epoch.
    async fn consult_analyzer(
        &self,
        run_id: &str,
        phase_id: &str,
    ) -> Result<Option<Phase>, OrchestratorError> {
        self.with_runs_lock(|| {
            let phase = self.store.load_phase(run_id, phase_id)?;
            let counters = self.store.load_counters(run_id)?;
            let history: Vec<ErrorRecord> =
                phase.current_epoch_errors().into_iter().cloned().collect();
            let verdict =
                self.analyzer
                    .should_replan(&history, phase.replan_count, counters.replans);
            let Some(flaw) = verdict.flaw_type else {
                return Ok(None);
            };

            self.store.update_counters(run_id, &mut |c| {
                c.replans += 1;
            })?;
            let phase = self
                .store
                .update_phase(run_id, phase_id, &mut |p| p.begin_revision())?;
            tracing::info!(
                run_id,
                phase_id,
                flaw_type = %flaw,
                revision_epoch = phase.revision_epoch,
                "approach flaw detected, replan requested"
            );
            Ok(Some(phase))
        })
        .await
    }

    /// Advance one phase until it stops asking to continue.
    ///
    /// Holds the run lock for the whole loop; a second driver of the same
    /// run fails immediately.
    pub async fn drive(&self, run_id: &str, phase_id: &str) -> Result<StepOutcome, OrchestratorError> {
        self.drive_observed(run_id, phase_id, &mut |_| {}).await
    }

    /// [`drive`](Self::drive), reporting every step to `on_step`.
    pub async fn drive_observed(
        &self,
        run_id: &str,
        phase_id: &str,
        on_step: &mut dyn FnMut(&StepOutcome),
    ) -> Result<StepOutcome, OrchestratorError> {
        check_id("run", run_id)?;
        let _run_lock = RunLock::acquire(&self.root, run_id, self.owner.as_str())?;
        self.validate_run(run_id)?;
        self.drive_locked(run_id, phase_id, on_step).await
    }

    /// Drive every phase of the run in order, stopping at the first phase
    /// that does not complete.
    pub async fn drive_run(
        &self,
        run_id: &str,
    ) -> Result<Vec<(String, StepOutcome)>, OrchestratorError> {
        self.drive_run_observed(run_id, &mut |_, _| {}).await
    }

    pub async fn drive_run_observed(
        &self,
        run_id: &str,
        on_step: &mut dyn FnMut(&str, &StepOutcome),
    ) -> Result<Vec<(String, StepOutcome)>, OrchestratorError> {
        check_id("run", run_id)?;
        let _run_lock = RunLock::acquire(&self.root, run_id, self.owner.as_str())?;
        let phases = self.validate_run(run_id)?;
        let mut results = Vec::new();
        for phase in phases {
            let mut report = |step: &StepOutcome| on_step(&phase.id, step);
            let step = self.drive_locked(run_id, &phase.id, &mut report).await?;
            let complete = step.status == AttemptStatus::Complete;
            results.push((phase.id, step));
            if !complete {
                break;
            }
        }
        Ok(results)
    }

    async fn drive_locked(
        &self,
        run_id: &str,
        phase_id: &str,
        on_step: &mut dyn FnMut(&StepOutcome),
    ) -> Result<StepOutcome, OrchestratorError> {
        loop {
            let step = self.advance_locked(run_id, phase_id).await?;
            tracing::debug!(
                run_id,
                phase_id,
                status = %step.status,
                attempt_index = step.counters.attempt_index,
                "step finished"
            );
            on_step(&step);
            if !step.should_continue {
                return Ok(step);
            }
        }
    }
}

/// First touched path that is protected or out of scope, as a fatal error.
fn path_violation(anchor: &IntentionAnchor, touched: &[String]) -> Option<(String, String)> {
    if let Some(path) = touched.iter().find(|p| anchor.is_protected(p)) {
        return Some((
            PROTECTED_PATH_VIOLATION.to_string(),
            format!("touched protected path {}", path),
        ));
    }
    touched.iter().find(|p| !anchor.is_in_scope(p)).map(|path| {
        (
            SCOPE_VIOLATION.to_string(),
            format!("touched out-of-scope path {}", path),
        )
    })
}

fn rejection_details(verdict: &AuditVerdict) -> String {
    if verdict.issues.is_empty() {
        "rejected by auditor".to_string()
    } else {
        verdict.issues.join("; ")
    }
}
