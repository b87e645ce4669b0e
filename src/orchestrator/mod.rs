pub mod handlers;
pub mod proof;
mod resolution;
pub mod runner;

#[cfg(test)]
pub(crate) mod testing;

pub use handlers::{BuildHandler, DocsHandler, HandlerRegistry, PhaseHandler, TestHandler};
pub use proof::ProofRecord;
pub use resolution::{AMBIGUITY, SAFETY_RISK};
pub use runner::{
    AttemptOutcome, AttemptStatus, OrchestratorSettings, PhaseCounters, PhaseOrchestrator,
    StepOutcome,
};
