//! Scope reduction negotiation.
//!
//! When budget runs low the negotiator proposes cutting a phase's deliverables
//! back to a leading subset. A proposal is only ever applied after it passes
//! [`validate`], which checks it against the intention anchor: some criteria
//! must survive, every `must` constraint must be acknowledged, and deferred
//! criteria are listed explicitly rather than dropped silently.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::anchor::IntentionAnchor;
use crate::phase::Phase;

/// Structural justification for a reduction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeRationale {
    pub success_criteria_preserved: Vec<String>,
    pub success_criteria_deferred: Vec<String>,
    /// `must` constraints acknowledged as still satisfied.
    pub constraints_satisfied: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScopeReductionProposal {
    pub phase_id: String,
    pub original: Vec<String>,
    pub kept: Vec<String>,
    pub dropped: Vec<String>,
    pub rationale: ScopeRationale,
    pub budget_remaining: f64,
    pub created_at: DateTime<Utc>,
}

/// Result of [`validate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopeValidation {
    pub valid: bool,
    pub reason: Option<String>,
}

impl ScopeValidation {
    fn ok() -> Self {
        Self {
            valid: true,
            reason: None,
        }
    }

    fn reject(reason: impl Into<String>) -> Self {
        Self {
            valid: false,
            reason: Some(reason.into()),
        }
    }

    pub fn as_tuple(&self) -> (bool, Option<&str>) {
        (self.valid, self.reason.as_deref())
    }
}

/// Number of leading items to keep out of `len` for the given budget share.
fn leading_share(len: usize, budget_remaining: f64, max: usize) -> usize {
    if len == 0 {
        return 0;
    }
    let share = (len as f64 * budget_remaining.clamp(0.0, 1.0)).ceil() as usize;
    share.clamp(1, max.max(1))
}

/// Propose cutting `plan` back in proportion to `budget_remaining`.
///
/// Earlier deliverables and criteria are higher priority and are kept first.
pub fn propose(
    anchor: &IntentionAnchor,
    phase: &Phase,
    budget_remaining: f64,
) -> ScopeReductionProposal {
    let plan = &phase.deliverables;
    let keep = leading_share(plan.len(), budget_remaining, plan.len().saturating_sub(1));
    let (kept, dropped) = plan.split_at(keep.min(plan.len()));

    let criteria = &anchor.success_criteria;
    let preserve = leading_share(criteria.len(), budget_remaining, criteria.len());
    let (preserved, deferred) = criteria.split_at(preserve.min(criteria.len()));

    ScopeReductionProposal {
        phase_id: phase.id.clone(),
        original: plan.clone(),
        kept: kept.to_vec(),
        dropped: dropped.to_vec(),
        rationale: ScopeRationale {
            success_criteria_preserved: preserved.to_vec(),
            success_criteria_deferred: deferred.to_vec(),
            constraints_satisfied: anchor.constraints.must.clone(),
        },
        budget_remaining,
        created_at: Utc::now(),
    }
}

/// Hard gate for a proposal against the anchor.
pub fn validate(proposal: &ScopeReductionProposal, anchor: &IntentionAnchor) -> ScopeValidation {
    let rationale = &proposal.rationale;

    if rationale.success_criteria_preserved.is_empty() {
        return ScopeValidation::reject("no success criterion is preserved");
    }

    let acknowledged: HashSet<&str> = rationale
        .constraints_satisfied
        .iter()
        .map(String::as_str)
        .collect();
    let missing: Vec<&str> = anchor
        .constraints
        .must
        .iter()
        .map(String::as_str)
        .filter(|m| !acknowledged.contains(m))
        .collect();
    if !missing.is_empty() {
        return ScopeValidation::reject(format!(
            "must constraints not acknowledged: {}",
            missing.join(", ")
        ));
    }

    if proposal.kept.is_empty() {
        return ScopeValidation::reject("no deliverable is kept");
    }
    if proposal.dropped.is_empty() {
        return ScopeValidation::reject("no deliverable is dropped");
    }

    let mut recombined: Vec<&String> = proposal.kept.iter().chain(&proposal.dropped).collect();
    let mut original: Vec<&String> = proposal.original.iter().collect();
    recombined.sort();
    original.sort();
    if recombined != original {
        return ScopeValidation::reject("kept and dropped do not partition the original deliverables");
    }

    let known: HashSet<&str> = anchor.success_criteria.iter().map(String::as_str).collect();
    let preserved: HashSet<&str> = rationale
        .success_criteria_preserved
        .iter()
        .map(String::as_str)
        .collect();
    let deferred: HashSet<&str> = rationale
        .success_criteria_deferred
        .iter()
        .map(String::as_str)
        .collect();

    if let Some(unknown) = rationale
        .success_criteria_preserved
        .iter()
        .chain(&rationale.success_criteria_deferred)
        .find(|c| !known.contains(c.as_str()))
    {
        return ScopeValidation::reject(format!("unknown success criterion '{}'", unknown));
    }
    if let Some(both) = rationale
        .success_criteria_preserved
        .iter()
        .find(|c| deferred.contains(c.as_str()))
    {
        return ScopeValidation::reject(format!(
            "success criterion '{}' is both preserved and deferred",
            both
        ));
    }
    if let Some(omitted) = anchor
        .success_criteria
        .iter()
        .find(|c| !preserved.contains(c.as_str()) && !deferred.contains(c.as_str()))
    {
        return ScopeValidation::reject(format!(
            "success criterion '{}' is neither preserved nor deferred",
            omitted
        ));
    }

    ScopeValidation::ok()
}

/// Validate and, if valid, apply `proposal` to `phase`.
///
/// Applying narrows deliverables to the kept set, records deferred criteria
/// and starts a new revision epoch. A rejected proposal leaves the phase as is.
pub fn apply(
    phase: &mut Phase,
    proposal: &ScopeReductionProposal,
    anchor: &IntentionAnchor,
) -> ScopeValidation {
    let validation = validate(proposal, anchor);
    if !validation.valid {
        return validation;
    }
    if phase.deliverables != proposal.original {
        return ScopeValidation::reject("phase deliverables changed since the proposal was made");
    }
    phase.deliverables = proposal.kept.clone();
    for criterion in &proposal.rationale.success_criteria_deferred {
        if !phase.deferred_criteria.contains(criterion) {
            phase.deferred_criteria.push(criterion.clone());
        }
    }
    phase.revision_epoch += 1;
    validation
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anchor::Constraints;

    fn anchor() -> IntentionAnchor {
        let mut anchor = IntentionAnchor::new(
            "Ship the parser",
            vec!["parses input".into(), "reports errors".into(), "is fast".into()],
        )
        .unwrap();
        anchor.constraints = Constraints {
            must: vec!["no unsafe".into(), "keep public API".into()],
            ..Default::default()
        };
        anchor
    }

    fn phase() -> Phase {
        Phase::new(
            "p1",
            "run-1",
            "Parser",
            vec![
                "lexer".into(),
                "parser".into(),
                "errors".into(),
                "benchmarks".into(),
            ],
        )
    }

    #[test]
    fn test_propose_keeps_leading_share() {
        let proposal = propose(&anchor(), &phase(), 0.5);
        assert_eq!(proposal.kept, vec!["lexer", "parser"]);
        assert_eq!(proposal.dropped, vec!["errors", "benchmarks"]);
        assert_eq!(
            proposal.rationale.success_criteria_preserved,
            vec!["parses input", "reports errors"]
        );
        assert_eq!(proposal.rationale.success_criteria_deferred, vec!["is fast"]);
        assert!(validate(&proposal, &anchor()).valid);
    }

    #[test]
    fn test_propose_always_keeps_and_drops_something() {
        let low = propose(&anchor(), &phase(), 0.0);
        assert_eq!(low.kept.len(), 1);
        assert_eq!(low.dropped.len(), 3);

        let high = propose(&anchor(), &phase(), 1.0);
        assert_eq!(high.kept.len(), 3);
        assert_eq!(high.dropped.len(), 1);
    }

    #[test]
    fn test_partial_must_acknowledgment_rejected() {
        let mut proposal = propose(&anchor(), &phase(), 0.5);
        proposal.rationale.constraints_satisfied = vec!["no unsafe".into()];
        let validation = validate(&proposal, &anchor());
        assert!(!validation.valid);
        assert!(validation.reason.unwrap().contains("keep public API"));
    }

    #[test]
    fn test_no_preserved_criterion_rejected() {
        let mut proposal = propose(&anchor(), &phase(), 0.5);
        proposal.rationale.success_criteria_preserved.clear();
        proposal.rationale.success_criteria_deferred = anchor().success_criteria;
        assert_eq!(
            validate(&proposal, &anchor()).as_tuple(),
            (false, Some("no success criterion is preserved"))
        );
    }

    #[test]
    fn test_noop_reduction_rejected() {
        let mut single = phase();
        single.deliverables = vec!["lexer".into()];
        let proposal = propose(&anchor(), &single, 0.5);
        assert!(proposal.dropped.is_empty());
        assert_eq!(
            validate(&proposal, &anchor()).as_tuple(),
            (false, Some("no deliverable is dropped"))
        );
    }

    #[test]
    fn test_empty_kept_rejected() {
        let mut proposal = propose(&anchor(), &phase(), 0.5);
        proposal.dropped = proposal.original.clone();
        proposal.kept.clear();
        assert!(!validate(&proposal, &anchor()).valid);
    }

    #[test]
    fn test_silently_omitted_criterion_rejected() {
        let mut proposal = propose(&anchor(), &phase(), 0.5);
        proposal.rationale.success_criteria_deferred.clear();
        let validation = validate(&proposal, &anchor());
        assert!(!validation.valid);
        assert!(validation.reason.unwrap().contains("is fast"));
    }

    #[test]
    fn test_invented_deliverable_rejected() {
        let mut proposal = propose(&anchor(), &phase(), 0.5);
        proposal.kept.push("rewrite everything".into());
        assert!(!validate(&proposal, &anchor()).valid);
    }

    #[test]
    fn test_unknown_criterion_rejected() {
        let mut proposal = propose(&anchor(), &phase(), 0.5);
        proposal
            .rationale
            .success_criteria_deferred
            .push("made up".into());
        assert!(!validate(&proposal, &anchor()).valid);
    }

    #[test]
    fn test_rejection_reason_names_first_listed_offender() {
        let mut proposal = propose(&anchor(), &phase(), 0.5);
        proposal.rationale.success_criteria_deferred = vec![
            "is fast".into(),
            "alpha".into(),
            "beta".into(),
            "gamma".into(),
        ];
        for _ in 0..10 {
            assert_eq!(
                validate(&proposal, &anchor()).as_tuple(),
                (false, Some("unknown success criterion 'alpha'"))
            );
        }

        let mut proposal = propose(&anchor(), &phase(), 0.5);
        proposal.rationale.success_criteria_deferred = vec![
            "is fast".into(),
            "reports errors".into(),
            "parses input".into(),
        ];
        assert_eq!(
            validate(&proposal, &anchor()).as_tuple(),
            (
                false,
                Some("success criterion 'parses input' is both preserved and deferred")
            )
        );
    }

    #[test]
    fn test_apply_mutates_phase() {
        let mut p = phase();
        let proposal = propose(&anchor(), &p, 0.25);
        let validation = apply(&mut p, &proposal, &anchor());
        assert!(validation.valid);
        assert_eq!(p.deliverables, vec!["lexer"]);
        assert_eq!(p.revision_epoch, 1);
        assert_eq!(p.deferred_criteria, vec!["reports errors", "is fast"]);
        assert_eq!(p.replan_count, 0);
    }

    #[test]
    fn test_apply_rejected_leaves_phase_untouched() {
        let mut p = phase();
        let mut proposal = propose(&anchor(), &p, 0.5);
        proposal.rationale.constraints_satisfied.clear();
        let before = p.clone();
        assert!(!apply(&mut p, &proposal, &anchor()).valid);
        assert_eq!(p, before);
    }

    #[test]
    fn test_apply_stale_proposal_rejected() {
        let mut p = phase();
        let proposal = propose(&anchor(), &p, 0.5);
        p.deliverables.pop();
        assert!(!apply(&mut p, &proposal, &anchor()).valid);
    }
}
