//! Phase-kind handlers.
//!
//! Each phase names a `kind`; the registry maps that tag to the handler that
//! renders the task description sent to the generation capability. The
//! registry is checked against every phase of a run before driving starts, so
//! an unknown kind fails fast instead of surfacing mid-run.

use std::collections::HashMap;
use std::fmt::Write;
use std::sync::Arc;

use crate::anchor::IntentionAnchor;
use crate::errors::OrchestratorError;
use crate::phase::Phase;

/// Renders the generation task for one kind of phase.
pub trait PhaseHandler: Send + Sync {
    fn kind(&self) -> &'static str;

    /// One-line instruction placed ahead of the shared task body.
    fn directive(&self) -> &'static str;

    fn task_description(&self, phase: &Phase, anchor: &IntentionAnchor) -> String {
        render_task(self.directive(), phase, anchor)
    }
}

pub struct BuildHandler;

impl PhaseHandler for BuildHandler {
    fn kind(&self) -> &'static str {
        "build"
    }

    fn directive(&self) -> &'static str {
        "Implement the deliverables below as a single coherent change."
    }
}

pub struct TestHandler;

impl PhaseHandler for TestHandler {
    fn kind(&self) -> &'static str {
        "test"
    }

    fn directive(&self) -> &'static str {
        "Write or repair tests covering the deliverables below. Do not change behaviour under test."
    }
}

pub struct DocsHandler;

impl PhaseHandler for DocsHandler {
    fn kind(&self) -> &'static str {
        "docs"
    }

    fn directive(&self) -> &'static str {
        "Update documentation for the deliverables below. Source changes are out of scope."
    }
}

/// Shared task body: goal, deliverables, anchor context, and the failures of
/// the approach being replaced.
pub fn render_task(directive: &str, phase: &Phase, anchor: &IntentionAnchor) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{}", directive);
    let _ = writeln!(out);
    let _ = writeln!(out, "## Goal\n{}", phase.goal);
    let _ = writeln!(out, "\n## North star\n{}", anchor.north_star);

    if !phase.deliverables.is_empty() {
        let _ = writeln!(out, "\n## Deliverables");
        for d in &phase.deliverables {
            let _ = writeln!(out, "- {}", d);
        }
    }

    let active: Vec<&String> = anchor
        .success_criteria
        .iter()
        .filter(|c| !phase.deferred_criteria.contains(c))
        .collect();
    if !active.is_empty() {
        let _ = writeln!(out, "\n## Success criteria");
        for c in active {
            let _ = writeln!(out, "- {}", c);
        }
    }
    if !phase.deferred_criteria.is_empty() {
        let _ = writeln!(out, "\n## Deferred (do not address now)");
        for c in &phase.deferred_criteria {
            let _ = writeln!(out, "- {}", c);
        }
    }

    let constraints = &anchor.constraints;
    if !constraints.must.is_empty() || !constraints.must_not.is_empty() {
        let _ = writeln!(out, "\n## Constraints");
        for m in &constraints.must {
            let _ = writeln!(out, "- MUST: {}", m);
        }
        for m in &constraints.must_not {
            let _ = writeln!(out, "- MUST NOT: {}", m);
        }
    }

    if !anchor.scope.allowed_paths.is_empty() || !anchor.risk_profile.protected_paths.is_empty() {
        let _ = writeln!(out, "\n## Scope");
        for p in &anchor.scope.allowed_paths {
            let _ = writeln!(out, "- may touch: {}", p);
        }
        for p in &anchor.scope.out_of_scope {
            let _ = writeln!(out, "- out of scope: {}", p);
        }
        for p in &anchor.risk_profile.protected_paths {
            let _ = writeln!(out, "- protected: {}", p);
        }
    }

    if phase.revision_epoch > 0 {
        let previous: Vec<_> = phase
            .error_history
            .iter()
            .filter(|e| e.revision_epoch + 1 == phase.revision_epoch)
            .collect();
        let _ = writeln!(
            out,
            "\n## Revision {}\nThe previous approach was abandoned. Take a different approach.",
            phase.revision_epoch
        );
        for e in previous {
            let _ = writeln!(out, "- attempt {}: {} ({})", e.attempt_index, e.error_type, e.error_details);
        }
    } else if let Some(last) = phase.error_history.last() {
        let _ = writeln!(
            out,
            "\n## Previous attempt\n{}: {}",
            last.error_type, last.error_details
        );
    }

    out
}

/// Lookup table from phase kind to handler.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn PhaseHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the `build`, `test` and `docs` handlers.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(BuildHandler));
        registry.register(Arc::new(TestHandler));
        registry.register(Arc::new(DocsHandler));
        registry
    }

    /// Register a handler, replacing any previous one for the same kind.
    pub fn register(&mut self, handler: Arc<dyn PhaseHandler>) {
        self.handlers.insert(handler.kind().to_string(), handler);
    }

    pub fn get(&self, kind: &str) -> Option<Arc<dyn PhaseHandler>> {
        self.handlers.get(kind).cloned()
    }

    pub fn resolve(&self, phase: &Phase) -> Result<Arc<dyn PhaseHandler>, OrchestratorError> {
        self.get(&phase.kind)
            .ok_or_else(|| OrchestratorError::UnregisteredKind {
                phase_id: phase.id.clone(),
                kind: phase.kind.clone(),
            })
    }

    /// Fail on the first phase whose kind has no handler.
    pub fn validate(&self, phases: &[Phase]) -> Result<(), OrchestratorError> {
        for phase in phases {
            self.resolve(phase)?;
        }
        Ok(())
    }

    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        kinds.sort();
        kinds
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}
