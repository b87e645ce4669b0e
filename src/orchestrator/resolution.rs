//! Stuck handling between attempts.
//!
//! After a recoverable failure, [`PhaseOrchestrator::advance`] asks the stuck
//! policy what to do. A resolution that turns out not to apply (no next tier,
//! invalid scope cut, replan ceiling, busy lock) is excluded and the policy is
//! asked again, so every step ends in a resolution that was actually carried
//! out.

use crate::anchor::IntentionAnchor;
use crate::errors::OrchestratorError;
use crate::lock::RunLock;
use crate::orchestrator::runner::{AttemptStatus, PhaseOrchestrator, StepOutcome};
use crate::phase::{FailureReason, Phase, PhaseState};
use crate::scope;
use crate::store::check_id;
use crate::stuck::{StuckReason, StuckResolution, StuckSignal};
use crate::usage::{BudgetLimits, aggregate};

/// Error types that hand the phase to a human regardless of counters.
pub const SAFETY_RISK: &str = "safety_risk";
pub const AMBIGUITY: &str = "ambiguity";

fn reason_for_error(error_type: &str) -> Option<StuckReason> {
    match error_type {
        SAFETY_RISK => Some(StuckReason::SafetyRisk),
        AMBIGUITY => Some(StuckReason::Ambiguity),
        _ => None,
    }
}

/// Whether a failure of this type goes to an operator whatever the counters say.
pub(crate) fn needs_human(error_type: &str) -> bool {
    reason_for_error(error_type).is_some_and(|r| r.needs_human())
}

impl PhaseOrchestrator {
    /// Execute one attempt and, if it failed recoverably, apply stuck handling.
    ///
    /// Holds the run lock for the duration of the step, so it fails with
    /// `LockError::RunLocked` while another process drives the run.
    pub async fn advance(
        &self,
        run_id: &str,
        phase_id: &str,
    ) -> Result<StepOutcome, OrchestratorError> {
        check_id("run", run_id)?;
        let _run_lock = RunLock::acquire(&self.root, run_id, self.owner().as_str())?;
        self.advance_locked(run_id, phase_id).await
    }

    /// [`advance`](Self::advance) for a caller that already holds the run lock.
    pub(crate) async fn advance_locked(
        &self,
        run_id: &str,
        phase_id: &str,
    ) -> Result<StepOutcome, OrchestratorError> {
        let outcome = self.execute_attempt(run_id, phase_id).await?;
        if outcome.status == AttemptStatus::Blocked
            && outcome
                .error
                .as_ref()
                .is_some_and(|e| needs_human(&e.error_type))
        {
            let phase = self.store.load_phase(run_id, phase_id)?;
            self.store
                .record_transition(run_id, phase_id, phase.attempt_index, "stuck_needs_human")?;
            self.reset_budget_cache();
            return self.step(&phase, AttemptStatus::Blocked, StuckResolution::NeedsHuman, None);
        }
        if outcome.status != AttemptStatus::Retry {
            if !outcome.should_continue {
                self.reset_budget_cache();
            }
            return Ok(StepOutcome::from_attempt(outcome));
        }

        let phase = self.store.load_phase(run_id, phase_id)?;
        let anchor = self.store.load_anchor(run_id)?;
        let budget = self.budget_remaining(run_id, &anchor)?;
        let Some(reason) = self.stuck_reason(&phase, budget) else {
            return Ok(StepOutcome::from_attempt(outcome));
        };

        let signal = StuckSignal {
            reason,
            iterations_used: phase.attempt_index,
            budget_remaining_fraction: budget,
            escalations_used: phase.escalation_level,
            consecutive_failures: phase.consecutive_failures(),
            replan_attempted: phase.replan_count > 0,
        };
        tracing::info!(
            run_id,
            phase_id,
            reason = %signal.reason,
            consecutive_failures = signal.consecutive_failures,
            budget_remaining = signal.budget_remaining_fraction,
            "phase is stuck"
        );

        let mut excluded = Vec::new();
        loop {
            let resolution = self.policy.decide_excluding(&signal, &excluded);
            match self
                .apply_resolution(run_id, phase_id, resolution, &anchor, budget)
                .await?
            {
                Some(step) => {
                    self.store.record_transition(
                        run_id,
                        phase_id,
                        phase.attempt_index,
                        &format!("stuck_{}", resolution),
                    )?;
                    if !step.should_continue {
                        self.reset_budget_cache();
                    }
                    return Ok(step);
                }
                None => {
                    tracing::info!(run_id, phase_id, %resolution, "resolution not applicable");
                    excluded.push(resolution);
                }
            }
        }
    }

    fn budget_remaining(
        &self,
        run_id: &str,
        anchor: &IntentionAnchor,
    ) -> Result<f64, OrchestratorError> {
        let events = self.store.usage_events(run_id)?;
        let totals = aggregate(&events);
        let limits = BudgetLimits::from_anchor(&anchor.budgets, self.settings.max_tokens);
        let mut cache = self
            .budget_cache
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(cache.remaining_fraction(&totals, &limits))
    }

    fn stuck_reason(&self, phase: &Phase, budget: f64) -> Option<StuckReason> {
        let latest = phase.current_epoch_errors().last().copied();
        if let Some(reason) = latest.and_then(|e| reason_for_error(&e.error_type)) {
            return Some(reason);
        }
        if !self.policy.is_stuck(phase.consecutive_failures(), budget) {
            return None;
        }
        if budget < self.policy.config().low_budget_threshold {
            Some(StuckReason::BudgetLow)
        } else {
            Some(StuckReason::RepeatedFailure)
        }
    }

    fn step(
        &self,
        phase: &Phase,
        status: AttemptStatus,
        resolution: StuckResolution,
        reason: Option<FailureReason>,
    ) -> Result<StepOutcome, OrchestratorError> {
        Ok(StepOutcome {
            status,
            resolution: Some(resolution),
            should_continue: status.should_continue() && phase.attempts_remaining() > 0,
            reason,
            counters: self.counters(phase)?,
        })
    }

    /// Carry out `resolution`. `None` means it does not apply right now.
    async fn apply_resolution(
        &self,
        run_id: &str,
        phase_id: &str,
        resolution: StuckResolution,
        anchor: &IntentionAnchor,
        budget: f64,
    ) -> Result<Option<StepOutcome>, OrchestratorError> {
        match resolution {
            StuckResolution::NeedsHuman => {
                let phase = self.store.update_phase(run_id, phase_id, &mut |p| {
                    p.state = PhaseState::Blocked;
                })?;
                tracing::warn!(run_id, phase_id, "phase blocked pending human review");
                self.step(&phase, AttemptStatus::Blocked, resolution, None)
                    .map(Some)
            }
            StuckResolution::Stop => {
                let phase = self.store.update_phase(run_id, phase_id, &mut |p| {
                    p.fail(FailureReason::Stopped);
                })?;
                tracing::warn!(run_id, phase_id, "phase stopped");
                self.step(
                    &phase,
                    AttemptStatus::Failed,
                    resolution,
                    Some(FailureReason::Stopped),
                )
                .map(Some)
            }
            StuckResolution::ReduceScope => self.reduce_scope(run_id, phase_id, anchor, budget),
            StuckResolution::Replan => self.replan(run_id, phase_id).await,
            StuckResolution::EscalateModel => self.escalate(run_id, phase_id, anchor).await,
            StuckResolution::Continue => {
                let phase = self.store.load_phase(run_id, phase_id)?;
                self.step(&phase, AttemptStatus::Retry, resolution, None)
                    .map(Some)
            }
        }
    }

    fn reduce_scope(
        &self,
        run_id: &str,
        phase_id: &str,
        anchor: &IntentionAnchor,
        budget: f64,
    ) -> Result<Option<StepOutcome>, OrchestratorError> {
        let phase = self.store.load_phase(run_id, phase_id)?;
        let proposal = scope::propose(anchor, &phase, budget);
        let validation = scope::validate(&proposal, anchor);
        if !validation.valid {
            tracing::info!(
                run_id,
                phase_id,
                reason = validation.reason.as_deref().unwrap_or(""),
                "scope reduction rejected"
            );
            return Ok(None);
        }

        let mut applied = validation;
        let phase = self.store.update_phase(run_id, phase_id, &mut |p| {
            applied = scope::apply(p, &proposal, anchor);
        })?;
        if !applied.valid {
            return Ok(None);
        }
        tracing::info!(
            run_id,
            phase_id,
            kept = proposal.kept.len(),
            dropped = proposal.dropped.len(),
            deferred = proposal.rationale.success_criteria_deferred.len(),
            "scope reduced"
        );
        self.step(
            &phase,
            AttemptStatus::Retry,
            StuckResolution::ReduceScope,
            None,
        )
        .map(Some)
    }

    async fn replan(
        &self,
        run_id: &str,
        phase_id: &str,
    ) -> Result<Option<StepOutcome>, OrchestratorError> {
        let result = self
            .with_runs_lock(|| {
                let phase = self.store.load_phase(run_id, phase_id)?;
                let counters = self.store.load_counters(run_id)?;
                if !self
                    .analyzer
                    .replan_permitted(phase.replan_count, counters.replans)
                {
                    return Ok(None);
                }
                self.store.update_counters(run_id, &mut |c| {
                    c.replans += 1;
                })?;
                let phase = self
                    .store
                    .update_phase(run_id, phase_id, &mut |p| p.begin_revision())?;
                Ok(Some(phase))
            })
            .await;

        match result {
            Ok(Some(phase)) => {
                tracing::info!(run_id, phase_id, revision_epoch = phase.revision_epoch, "replan requested");
                self.step(
                    &phase,
                    AttemptStatus::ReplanRequested,
                    StuckResolution::Replan,
                    None,
                )
                .map(Some)
            }
            Ok(None) => Ok(None),
            Err(OrchestratorError::Lock(err)) if err.is_retryable() => {
                tracing::warn!(run_id, phase_id, error = %err, "replan skipped, runs lock busy");
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    async fn escalate(
        &self,
        run_id: &str,
        phase_id: &str,
        anchor: &IntentionAnchor,
    ) -> Result<Option<StepOutcome>, OrchestratorError> {
        let router = self.router(run_id)?;
        let max_escalations = self.policy.config().max_escalations_per_phase;

        let result = self
            .with_runs_lock(|| {
                let phase = self.store.load_phase(run_id, phase_id)?;
                if phase.escalation_level >= max_escalations {
                    return Ok(None);
                }
                let Some(next) = router.escalate(&phase.tier, anchor.safety_profile()) else {
                    return Ok(None);
                };
                let next_tier = next.name.clone();
                self.store.update_counters(run_id, &mut |c| {
                    c.escalations += 1;
                })?;
                let phase = self.store.update_phase(run_id, phase_id, &mut |p| {
                    p.escalation_level += 1;
                    p.tier = next_tier.clone();
                })?;
                Ok(Some(phase))
            })
            .await;

        match result {
            Ok(Some(phase)) => {
                tracing::info!(run_id, phase_id, tier = %phase.tier, "model escalated");
                self.step(
                    &phase,
                    AttemptStatus::Retry,
                    StuckResolution::EscalateModel,
                    None,
                )
                .map(Some)
            }
            Ok(None) => Ok(None),
            Err(OrchestratorError::Lock(err)) if err.is_retryable() => {
                tracing::warn!(run_id, phase_id, error = %err, "escalation skipped, runs lock busy");
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::capability::{GenerationOutput, ReportedError};
    use crate::orchestrator::testing::*;
    use crate::orchestrator::{AttemptStatus, OrchestratorSettings};
    use crate::phase::{FailureReason, PhaseState};
    use crate::store::PhaseStore;
    use crate::stuck::StuckResolution;

    use super::{AMBIGUITY, SAFETY_RISK};

    fn deliverables() -> Vec<String> {
        vec![
            "src/lexer.rs".into(),
            "src/token.rs".into(),
            "src/span.rs".into(),
            "tests/lexer.rs".into(),
        ]
    }

    #[tokio::test]
    async fn test_single_failure_is_plain_retry() {
        let fx = Fixture::new(deliverables());
        fx.auditor.push(reject_with("lint", "unused import"));

        let step = fx.orchestrator().advance(RUN, PHASE).await.unwrap();

        assert_eq!(step.status, AttemptStatus::Retry);
        assert_eq!(step.resolution, None);
        assert!(step.should_continue);
    }

    #[tokio::test]
    async fn test_repeated_failure_replans_first() {
        let fx = Fixture::new(deliverables());
        let orchestrator = fx.orchestrator();
        fx.auditor.push(reject_with("lint", "unused import"));
        fx.auditor.push(reject_with("type_error", "mismatched types"));

        orchestrator.advance(RUN, PHASE).await.unwrap();
        let step = orchestrator.advance(RUN, PHASE).await.unwrap();

        assert_eq!(step.status, AttemptStatus::ReplanRequested);
        assert_eq!(step.resolution, Some(StuckResolution::Replan));
        assert_eq!(step.counters.revision_epoch, 1);
        assert_eq!(step.counters.run.replans, 1);
        assert!(step.should_continue);

        let journal = fx.store.transitions(RUN).unwrap();
        assert_eq!(journal.last().unwrap().status, "stuck_replan");
    }

    #[tokio::test]
    async fn test_after_replan_escalates_to_next_tier() {
        let fx = Fixture::new(deliverables());
        fx.store
            .update_phase(RUN, PHASE, &mut |p| p.begin_revision())
            .unwrap();
        let orchestrator = fx.orchestrator();
        fx.auditor.push(reject_with("lint", "unused import"));
        fx.auditor.push(reject_with("type_error", "mismatched types"));

        orchestrator.advance(RUN, PHASE).await.unwrap();
        let step = orchestrator.advance(RUN, PHASE).await.unwrap();

        assert_eq!(step.resolution, Some(StuckResolution::EscalateModel));
        assert_eq!(step.status, AttemptStatus::Retry);
        assert_eq!(step.counters.tier, "standard");
        assert_eq!(step.counters.escalation_level, 1);
        assert_eq!(step.counters.run.escalations, 1);

        // The escalated tier's target is what the next attempt asks for.
        orchestrator.advance(RUN, PHASE).await.unwrap();
        assert_eq!(fx.generator.last_request().unwrap().target, "standard");
    }

    #[tokio::test]
    async fn test_escalation_blocked_by_strict_profile_falls_through() {
        let fx = Fixture::new(deliverables());
        fx.store
            .update_phase(RUN, PHASE, &mut |p| {
                p.begin_revision();
                p.tier = "standard".into();
            })
            .unwrap();
        let orchestrator = fx.orchestrator();
        fx.auditor.push(reject_with("lint", "unused import"));
        fx.auditor.push(reject_with("type_error", "mismatched types"));

        orchestrator.advance(RUN, PHASE).await.unwrap();
        let step = orchestrator.advance(RUN, PHASE).await.unwrap();

        assert_eq!(step.resolution, Some(StuckResolution::Continue));
        assert_eq!(step.counters.tier, "standard");
        assert_eq!(step.counters.run.escalations, 0);
    }

    #[tokio::test]
    async fn test_run_replan_ceiling_falls_through_to_escalation() {
        let fx = Fixture::new(deliverables());
        let mut settings = test_settings();
        settings.replan.max_replans_per_run = 0;
        let orchestrator = fx.orchestrator_with(settings);
        fx.auditor.push(reject_with("lint", "unused import"));
        fx.auditor.push(reject_with("type_error", "mismatched types"));

        orchestrator.advance(RUN, PHASE).await.unwrap();
        let step = orchestrator.advance(RUN, PHASE).await.unwrap();

        assert_eq!(step.resolution, Some(StuckResolution::EscalateModel));
        assert_eq!(step.counters.run.replans, 0);
    }

    #[tokio::test]
    async fn test_safety_risk_blocks_phase() {
        let fx = Fixture::new(deliverables());
        fx.generator.push(Ok(GenerationOutput {
            error: Some(ReportedError {
                error_type: "safety_risk".into(),
                details: "asked to disable auth checks".into(),
            }),
            ..Default::default()
        }));
        let orchestrator = fx.orchestrator();

        let step = orchestrator.advance(RUN, PHASE).await.unwrap();

        assert_eq!(step.status, AttemptStatus::Blocked);
        assert_eq!(step.resolution, Some(StuckResolution::NeedsHuman));
        assert!(!step.should_continue);
        assert_eq!(
            fx.store.load_phase(RUN, PHASE).unwrap().state,
            PhaseState::Blocked
        );

        let again = orchestrator.execute_attempt(RUN, PHASE).await.unwrap();
        assert_eq!(again.status, AttemptStatus::Blocked);
        assert_eq!(fx.generator.calls(), 1);
    }

    #[tokio::test]
    async fn test_safety_risk_on_last_attempt_waits_for_operator() {
        for error_type in [SAFETY_RISK, AMBIGUITY] {
            let fx = Fixture::with_max_attempts(deliverables(), 1);
            fx.generator.push(Ok(GenerationOutput {
                error: Some(ReportedError {
                    error_type: error_type.into(),
                    details: "asked to disable auth checks".into(),
                }),
                ..Default::default()
            }));

            let step = fx.orchestrator().advance(RUN, PHASE).await.unwrap();

            assert_eq!(step.status, AttemptStatus::Blocked, "{error_type}");
            assert_eq!(step.resolution, Some(StuckResolution::NeedsHuman));
            assert_eq!(step.reason, None);
            assert!(!step.should_continue);
            let phase = fx.store.load_phase(RUN, PHASE).unwrap();
            assert_eq!(phase.state, PhaseState::Blocked);
            assert_eq!(phase.failure_reason, None);

            let journal = fx.store.transitions(RUN).unwrap();
            assert_eq!(journal.last().unwrap().status, "stuck_needs_human");
        }
    }

    #[tokio::test]
    async fn test_iteration_ceiling_stops_phase() {
        let fx = Fixture::new(deliverables());
        let mut settings: OrchestratorSettings = test_settings();
        settings.stuck.max_iterations = 2;
        let orchestrator = fx.orchestrator_with(settings);
        fx.auditor.push(reject_with("lint", "unused import"));
        fx.auditor.push(reject_with("type_error", "mismatched types"));

        orchestrator.advance(RUN, PHASE).await.unwrap();
        let step = orchestrator.advance(RUN, PHASE).await.unwrap();

        assert_eq!(step.status, AttemptStatus::Failed);
        assert_eq!(step.reason, Some(FailureReason::Stopped));
        assert!(!step.should_continue);
    }

    #[tokio::test]
    async fn test_low_budget_reduces_scope() {
        let mut anchor = test_anchor();
        anchor.budgets.max_context_chars = 100;
        let fx = Fixture::with_anchor(anchor, deliverables(), 5);
        fx.generator.push(Ok(GenerationOutput {
            context_chars: 90,
            touched_paths: vec!["src/lexer.rs".into()],
            ..Default::default()
        }));
        fx.auditor.push(reject_with("lint", "unused import"));

        let step = fx.orchestrator().advance(RUN, PHASE).await.unwrap();

        assert_eq!(step.resolution, Some(StuckResolution::ReduceScope));
        assert_eq!(step.status, AttemptStatus::Retry);
        let phase = fx.store.load_phase(RUN, PHASE).unwrap();
        assert_eq!(phase.deliverables, vec!["src/lexer.rs".to_string()]);
        assert_eq!(phase.deferred_criteria.len(), 2);
        assert_eq!(phase.revision_epoch, 1);
        assert_eq!(phase.replan_count, 0);
    }

    #[tokio::test]
    async fn test_low_budget_with_single_deliverable_falls_through() {
        let mut anchor = test_anchor();
        anchor.budgets.max_context_chars = 100;
        let fx = Fixture::with_anchor(anchor, vec!["src/lexer.rs".into()], 5);
        fx.generator.push(Ok(GenerationOutput {
            context_chars: 90,
            ..Default::default()
        }));
        fx.auditor.push(reject_with("lint", "unused import"));

        let step = fx.orchestrator().advance(RUN, PHASE).await.unwrap();

        assert_eq!(step.resolution, Some(StuckResolution::Replan));
        assert_eq!(
            fx.store.load_phase(RUN, PHASE).unwrap().deliverables.len(),
            1
        );
    }

    #[tokio::test]
    async fn test_drive_terminates_within_max_attempts() {
        let fx = Fixture::with_max_attempts(deliverables(), 4);

        let step = fx.orchestrator().drive(RUN, PHASE).await.unwrap();

        assert_eq!(step.status, AttemptStatus::Failed);
        assert!(fx.generator.calls() <= 4);
        let phase = fx.store.load_phase(RUN, PHASE).unwrap();
        assert!(phase.attempt_index <= phase.max_attempts);
    }
}
