//! Scripted capability doubles and a file-backed fixture for orchestrator tests.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

use crate::anchor::IntentionAnchor;
use crate::capability::{
    AuditCapability, AuditVerdict, GenerationCapability, GenerationOutput, GenerationRequest,
};
use crate::errors::CapabilityError;
use crate::lock::LeaseConfig;
use crate::orchestrator::{OrchestratorSettings, PhaseOrchestrator};
use crate::phase::Phase;
use crate::store::FileStore;

pub const RUN: &str = "run-1";
pub const PHASE: &str = "p1";

/// Returns scripted results in order, then a small in-scope default output.
#[derive(Default)]
pub struct ScriptedGenerator {
    script: Mutex<VecDeque<Result<GenerationOutput, CapabilityError>>>,
    delay: Mutex<Option<Duration>>,
    calls: AtomicUsize,
    requests: Mutex<Vec<GenerationRequest>>,
}

impl ScriptedGenerator {
    pub fn push(&self, result: Result<GenerationOutput, CapabilityError>) {
        self.script.lock().unwrap().push_back(result);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_request(&self) -> Option<GenerationRequest> {
        self.requests.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl GenerationCapability for ScriptedGenerator {
    async fn generate(
        &self,
        request: &GenerationRequest,
    ) -> Result<GenerationOutput, CapabilityError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request.clone());
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let next = self.script.lock().unwrap().pop_front();
        next.unwrap_or_else(|| Ok(default_output()))
    }
}

pub fn default_output() -> GenerationOutput {
    GenerationOutput {
        artifact: "diff --git a/src/lib.rs b/src/lib.rs".into(),
        touched_paths: vec!["src/lib.rs".into()],
        tokens_used: 10,
        context_chars: 10,
        error: None,
    }
}

/// Returns scripted verdicts in order, then rejects.
#[derive(Default)]
pub struct ScriptedAuditor {
    verdicts: Mutex<VecDeque<AuditVerdict>>,
    calls: AtomicUsize,
}

impl ScriptedAuditor {
    pub fn push(&self, verdict: AuditVerdict) {
        self.verdicts.lock().unwrap().push_back(verdict);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AuditCapability for ScriptedAuditor {
    async fn review(
        &self,
        _artifact: &str,
        _original_task: &str,
    ) -> Result<AuditVerdict, CapabilityError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self.verdicts.lock().unwrap().pop_front();
        Ok(next.unwrap_or_else(|| reject_with("auditor_reject", "no verdict scripted")))
    }
}

pub fn reject_with(error_type: &str, details: &str) -> AuditVerdict {
    AuditVerdict {
        error_type: Some(error_type.to_string()),
        ..AuditVerdict::reject(vec![details.to_string()])
    }
}

pub fn test_anchor() -> IntentionAnchor {
    let mut anchor = IntentionAnchor::new(
        "Ship a fast parser",
        vec![
            "parses valid input".into(),
            "reports errors".into(),
            "is fast".into(),
        ],
    )
    .unwrap();
    anchor.constraints.must.push("no unsafe".into());
    anchor.scope.allowed_paths = vec!["src/".into(), "tests/".into()];
    anchor.risk_profile.protected_paths.push(".github/".into());
    anchor
}

pub fn test_settings() -> OrchestratorSettings {
    OrchestratorSettings {
        capability_timeout: Duration::from_secs(5),
        lease: LeaseConfig {
            ttl: Duration::from_secs(30),
            acquire_timeout: Duration::from_millis(500),
            poll_interval: Duration::from_millis(10),
        },
        ..OrchestratorSettings::default()
    }
}

pub struct Fixture {
    pub dir: TempDir,
    pub store: Arc<FileStore>,
    pub generator: Arc<ScriptedGenerator>,
    pub auditor: Arc<ScriptedAuditor>,
}

impl Fixture {
    pub fn new(deliverables: Vec<String>) -> Self {
        Self::with_anchor(test_anchor(), deliverables, crate::phase::DEFAULT_MAX_ATTEMPTS)
    }

    pub fn with_max_attempts(deliverables: Vec<String>, max_attempts: u32) -> Self {
        Self::with_anchor(test_anchor(), deliverables, max_attempts)
    }

    pub fn with_anchor(anchor: IntentionAnchor, deliverables: Vec<String>, max_attempts: u32) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FileStore::new(dir.path()));
        let phase = Phase::new(PHASE, RUN, "Add a lexer", deliverables).with_max_attempts(max_attempts);
        store.create_run(RUN, &anchor, vec![phase]).unwrap();
        Self {
            dir,
            store,
            generator: Arc::new(ScriptedGenerator::default()),
            auditor: Arc::new(ScriptedAuditor::default()),
        }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn orchestrator(&self) -> PhaseOrchestrator {
        self.orchestrator_with(test_settings())
    }

    pub fn orchestrator_with(&self, settings: OrchestratorSettings) -> PhaseOrchestrator {
        PhaseOrchestrator::new(
            self.root(),
            self.store.clone(),
            self.generator.clone(),
            self.auditor.clone(),
            settings,
        )
    }
}
