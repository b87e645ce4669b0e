//! Stuck resolution policy.
//!
//! Given a stuck signal, picks exactly one resolution by strict precedence:
//!
//! 1. safety or ambiguity concern → `NeedsHuman`
//! 2. iteration ceiling reached → `Stop`
//! 3. budget below the low-budget threshold → `ReduceScope`
//! 4. replan not yet attempted → `Replan`
//! 5. escalations remaining → `EscalateModel`
//! 6. otherwise → `Continue`
//!
//! When the caller cannot carry out a resolution (a rejected scope proposal, a
//! capped replan, no eligible tier) it asks again with that resolution excluded.

use serde::{Deserialize, Serialize};
use std::fmt;

pub const DEFAULT_LOW_BUDGET_THRESHOLD: f64 = 0.2;
pub const DEFAULT_MAX_ITERATIONS: u32 = 5;
pub const DEFAULT_MAX_ESCALATIONS_PER_PHASE: u32 = 1;
pub const DEFAULT_CONSECUTIVE_FAILURE_THRESHOLD: u32 = 2;

/// Why a phase is considered stuck.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StuckReason {
    SafetyRisk,
    Ambiguity,
    RepeatedFailure,
    BudgetLow,
}

impl StuckReason {
    /// Reasons that always require an operator.
    pub fn needs_human(&self) -> bool {
        matches!(self, Self::SafetyRisk | Self::Ambiguity)
    }
}

impl fmt::Display for StuckReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::SafetyRisk => "safety_risk",
            Self::Ambiguity => "ambiguity",
            Self::RepeatedFailure => "repeated_failure",
            Self::BudgetLow => "budget_low",
        };
        write!(f, "{}", s)
    }
}

/// The fixed set of resolutions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StuckResolution {
    NeedsHuman,
    Stop,
    ReduceScope,
    Replan,
    EscalateModel,
    Continue,
}

impl StuckResolution {
    /// Resolutions a caller may skip on fall-through.
    pub fn is_excludable(&self) -> bool {
        !matches!(self, Self::NeedsHuman | Self::Stop)
    }
}

impl fmt::Display for StuckResolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NeedsHuman => "needs_human",
            Self::Stop => "stop",
            Self::ReduceScope => "reduce_scope",
            Self::Replan => "replan",
            Self::EscalateModel => "escalate_model",
            Self::Continue => "continue",
        };
        write!(f, "{}", s)
    }
}

/// Inputs to one policy decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StuckSignal {
    pub reason: StuckReason,
    pub iterations_used: u32,
    pub budget_remaining_fraction: f64,
    pub escalations_used: u32,
    pub consecutive_failures: u32,
    pub replan_attempted: bool,
}

/// Policy thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StuckConfig {
    #[serde(default = "default_low_budget_threshold")]
    pub low_budget_threshold: f64,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    #[serde(default = "default_max_escalations_per_phase")]
    pub max_escalations_per_phase: u32,
    /// Failures within one approach before the phase counts as stuck.
    #[serde(default = "default_consecutive_failure_threshold")]
    pub consecutive_failure_threshold: u32,
}

fn default_low_budget_threshold() -> f64 {
    DEFAULT_LOW_BUDGET_THRESHOLD
}

fn default_max_iterations() -> u32 {
    DEFAULT_MAX_ITERATIONS
}

fn default_max_escalations_per_phase() -> u32 {
    DEFAULT_MAX_ESCALATIONS_PER_PHASE
}

fn default_consecutive_failure_threshold() -> u32 {
    DEFAULT_CONSECUTIVE_FAILURE_THRESHOLD
}

impl Default for StuckConfig {
    fn default() -> Self {
        Self {
            low_budget_threshold: default_low_budget_threshold(),
            max_iterations: default_max_iterations(),
            max_escalations_per_phase: default_max_escalations_per_phase(),
            consecutive_failure_threshold: default_consecutive_failure_threshold(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct StuckPolicy {
    config: StuckConfig,
}

impl StuckPolicy {
    pub fn new(config: StuckConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &StuckConfig {
        &self.config
    }

    /// Whether a phase with these counters should consult the policy at all.
    pub fn is_stuck(&self, consecutive_failures: u32, budget_remaining_fraction: f64) -> bool {
        consecutive_failures >= self.config.consecutive_failure_threshold
            || budget_remaining_fraction < self.config.low_budget_threshold
    }

    pub fn decide(&self, signal: &StuckSignal) -> StuckResolution {
        self.decide_excluding(signal, &[])
    }

    /// Same precedence as [`decide`](Self::decide), skipping `excluded`.
    ///
    /// `NeedsHuman` and `Stop` are never skipped.
    pub fn decide_excluding(
        &self,
        signal: &StuckSignal,
        excluded: &[StuckResolution],
    ) -> StuckResolution {
        let allowed = |r: StuckResolution| !(r.is_excludable() && excluded.contains(&r));

        if signal.reason.needs_human() {
            return StuckResolution::NeedsHuman;
        }
        if signal.iterations_used >= self.config.max_iterations {
            return StuckResolution::Stop;
        }
        if signal.budget_remaining_fraction < self.config.low_budget_threshold
            && allowed(StuckResolution::ReduceScope)
        {
            return StuckResolution::ReduceScope;
        }
        if !signal.replan_attempted && allowed(StuckResolution::Replan) {
            return StuckResolution::Replan;
        }
        if signal.escalations_used < self.config.max_escalations_per_phase
            && allowed(StuckResolution::EscalateModel)
        {
            return StuckResolution::EscalateModel;
        }
        StuckResolution::Continue
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signal(reason: StuckReason) -> StuckSignal {
        StuckSignal {
            reason,
            iterations_used: 1,
            budget_remaining_fraction: 0.9,
            escalations_used: 0,
            consecutive_failures: 2,
            replan_attempted: false,
        }
    }

    #[test]
    fn test_safety_risk_always_needs_human() {
        let policy = StuckPolicy::default();
        for iterations in [0, 5, 100] {
            for budget in [0.0, 0.1, 0.5, 1.0] {
                for escalations in [0, 1, 3] {
                    let s = StuckSignal {
                        iterations_used: iterations,
                        budget_remaining_fraction: budget,
                        escalations_used: escalations,
                        replan_attempted: iterations % 2 == 0,
                        ..signal(StuckReason::SafetyRisk)
                    };
                    assert_eq!(policy.decide(&s), StuckResolution::NeedsHuman);
                }
            }
        }
    }

    #[test]
    fn test_ambiguity_needs_human() {
        assert_eq!(
            StuckPolicy::default().decide(&signal(StuckReason::Ambiguity)),
            StuckResolution::NeedsHuman
        );
    }

    #[test]
    fn test_iteration_ceiling_beats_budget() {
        let s = StuckSignal {
            iterations_used: 5,
            budget_remaining_fraction: 0.05,
            ..signal(StuckReason::RepeatedFailure)
        };
        assert_eq!(StuckPolicy::default().decide(&s), StuckResolution::Stop);
    }

    #[test]
    fn test_low_budget_reduces_scope() {
        let s = StuckSignal {
            budget_remaining_fraction: 0.1,
            ..signal(StuckReason::BudgetLow)
        };
        assert_eq!(StuckPolicy::default().decide(&s), StuckResolution::ReduceScope);
    }

    #[test]
    fn test_replan_before_escalation() {
        let policy = StuckPolicy::default();
        let s = signal(StuckReason::RepeatedFailure);
        assert_eq!(policy.decide(&s), StuckResolution::Replan);

        let s = StuckSignal {
            replan_attempted: true,
            ..s
        };
        assert_eq!(policy.decide(&s), StuckResolution::EscalateModel);

        let s = StuckSignal {
            escalations_used: 1,
            ..s
        };
        assert_eq!(policy.decide(&s), StuckResolution::Continue);
    }

    #[test]
    fn test_fall_through_skips_excluded() {
        let policy = StuckPolicy::default();
        let s = StuckSignal {
            budget_remaining_fraction: 0.1,
            ..signal(StuckReason::BudgetLow)
        };
        assert_eq!(
            policy.decide_excluding(&s, &[StuckResolution::ReduceScope]),
            StuckResolution::Replan
        );
        assert_eq!(
            policy.decide_excluding(
                &s,
                &[StuckResolution::ReduceScope, StuckResolution::Replan]
            ),
            StuckResolution::EscalateModel
        );
        assert_eq!(
            policy.decide_excluding(
                &s,
                &[
                    StuckResolution::ReduceScope,
                    StuckResolution::Replan,
                    StuckResolution::EscalateModel
                ]
            ),
            StuckResolution::Continue
        );
    }

    #[test]
    fn test_stop_and_needs_human_cannot_be_excluded() {
        let policy = StuckPolicy::default();
        let s = StuckSignal {
            iterations_used: 9,
            ..signal(StuckReason::RepeatedFailure)
        };
        assert_eq!(
            policy.decide_excluding(&s, &[StuckResolution::Stop]),
            StuckResolution::Stop
        );
        assert_eq!(
            policy.decide_excluding(
                &signal(StuckReason::SafetyRisk),
                &[StuckResolution::NeedsHuman]
            ),
            StuckResolution::NeedsHuman
        );
    }

    #[test]
    fn test_is_stuck() {
        let policy = StuckPolicy::default();
        assert!(!policy.is_stuck(1, 0.9));
        assert!(policy.is_stuck(2, 0.9));
        assert!(policy.is_stuck(0, 0.1));
    }

    #[test]
    fn test_resolution_display() {
        assert_eq!(StuckResolution::EscalateModel.to_string(), "escalate_model");
        assert_eq!(StuckReason::SafetyRisk.to_string(), "safety_risk");
    }
}
