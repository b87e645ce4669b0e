//! Configuration for buildpilot.
//!
//! Settings are read from `buildpilot.toml` at the project root and layered:
//! file → environment (`BUILDPILOT_*`, `.env` honoured) → CLI flags.
//!
//! # Configuration File Format
//!
//! ```toml
//! [orchestrator]
//! max_attempts = 5
//! capability_timeout_secs = 900
//! max_output_budget = 200000
//! max_tokens = 0            # 0 = unlimited
//!
//! [replan]
//! window = 3
//! similarity_enabled = true
//! similarity_threshold = 0.8
//! min_message_length = 30
//! max_replans_per_phase = 2
//! max_replans_per_run = 5
//!
//! [stuck]
//! low_budget_threshold = 0.2
//! max_iterations = 5
//! max_escalations_per_phase = 1
//! consecutive_failure_threshold = 2
//!
//! [locks]
//! ttl_secs = 300
//! acquire_timeout_ms = 5000
//! poll_interval_ms = 100
//!
//! [routing]
//! version = 1
//!
//! [[routing.tiers]]
//! name = "economy"
//! target = "small-model"
//!
//! [[routing.tiers]]
//! name = "frontier"
//! target = "large-model"
//! strict_ok = false
//!
//! [capability]
//! generate_cmd = "./agents/generate.sh"
//! audit_cmd = "./agents/audit.sh"
//!
//! [phases.overrides."docs-*"]
//! max_attempts = 3
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::lock::LeaseConfig;
use crate::phase::DEFAULT_MAX_ATTEMPTS;
use crate::replan::ReplanConfig;
use crate::router::TierTable;
use crate::stuck::StuckConfig;

pub const CONFIG_FILE: &str = "buildpilot.toml";
pub const DEFAULT_ARTIFACT_DIR: &str = ".buildpilot";

pub const GENERATE_CMD_ENV: &str = "BUILDPILOT_GENERATE_CMD";
pub const AUDIT_CMD_ENV: &str = "BUILDPILOT_AUDIT_CMD";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorSection {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_capability_timeout_secs")]
    pub capability_timeout_secs: u64,
    #[serde(default = "default_max_output_budget")]
    pub max_output_budget: u64,
    /// Token ceiling for a run. 0 disables the token dimension.
    #[serde(default)]
    pub max_tokens: u64,
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

fn default_capability_timeout_secs() -> u64 {
    900
}

fn default_max_output_budget() -> u64 {
    200_000
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            capability_timeout_secs: default_capability_timeout_secs(),
            max_output_budget: default_max_output_budget(),
            max_tokens: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocksSection {
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_ttl_secs() -> u64 {
    crate::lock::lease::DEFAULT_LEASE_TTL_SECS
}

fn default_acquire_timeout_ms() -> u64 {
    crate::lock::lease::DEFAULT_ACQUIRE_TIMEOUT_MS
}

fn default_poll_interval_ms() -> u64 {
    crate::lock::lease::DEFAULT_POLL_INTERVAL_MS
}

impl Default for LocksSection {
    fn default() -> Self {
        Self {
            ttl_secs: default_ttl_secs(),
            acquire_timeout_ms: default_acquire_timeout_ms(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl LocksSection {
    pub fn lease_config(&self) -> LeaseConfig {
        LeaseConfig {
            ttl: Duration::from_secs(self.ttl_secs),
            acquire_timeout: Duration::from_millis(self.acquire_timeout_ms),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilitySection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generate_cmd: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audit_cmd: Option<String>,
}

/// Settings that can be overridden for phases whose id matches a pattern.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
    /// Starting tier for matching phases.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tier: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhasesSection {
    #[serde(default)]
    pub overrides: BTreeMap<String, PhaseOverride>,
}

/// The complete buildpilot.toml structure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BuildpilotToml {
    #[serde(default)]
    pub orchestrator: OrchestratorSection,
    #[serde(default)]
    pub replan: ReplanConfig,
    #[serde(default)]
    pub stuck: StuckConfig,
    #[serde(default)]
    pub locks: LocksSection,
    #[serde(default)]
    pub routing: TierTable,
    #[serde(default)]
    pub capability: CapabilitySection,
    #[serde(default)]
    pub phases: PhasesSection,
}

impl BuildpilotToml {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse buildpilot.toml")
    }

    /// Load `buildpilot.toml` from `project_dir`, or defaults if absent.
    pub fn load_or_default(project_dir: &Path) -> Result<Self> {
        let path = project_dir.join(CONFIG_FILE);
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content =
            toml::to_string_pretty(self).context("Failed to serialize buildpilot.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Generation command: environment overrides the file.
    pub fn generate_cmd(&self) -> Option<String> {
        std::env::var(GENERATE_CMD_ENV)
            .ok()
            .filter(|v| !v.trim().is_empty())
            .or_else(|| self.capability.generate_cmd.clone())
    }

    /// Audit command: environment overrides the file.
    pub fn audit_cmd(&self) -> Option<String> {
        std::env::var(AUDIT_CMD_ENV)
            .ok()
            .filter(|v| !v.trim().is_empty())
            .or_else(|| self.capability.audit_cmd.clone())
    }

    /// Effective settings for a phase, applying matching overrides in key order.
    pub fn phase_settings(&self, phase_id: &str) -> PhaseSettings {
        let mut settings = PhaseSettings {
            max_attempts: self.orchestrator.max_attempts,
            tier: None,
        };
        for (pattern, override_cfg) in &self.phases.overrides {
            if pattern_matches(pattern, phase_id) {
                if let Some(max_attempts) = override_cfg.max_attempts {
                    settings.max_attempts = max_attempts;
                }
                if let Some(ref tier) = override_cfg.tier {
                    settings.tier = Some(tier.clone());
                }
            }
        }
        settings
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.orchestrator.max_attempts == 0 {
            warnings.push("orchestrator.max_attempts is 0: every phase fails immediately".into());
        }
        if self.orchestrator.capability_timeout_secs == 0 {
            warnings.push("orchestrator.capability_timeout_secs must be greater than 0".into());
        }
        if !(0.0..=1.0).contains(&self.replan.similarity_threshold) {
            warnings.push(format!(
                "replan.similarity_threshold {} is outside [0, 1]",
                self.replan.similarity_threshold
            ));
        }
        if self.replan.window == 0 {
            warnings.push("replan.window must be at least 1".into());
        }
        if !(0.0..=1.0).contains(&self.stuck.low_budget_threshold) {
            warnings.push(format!(
                "stuck.low_budget_threshold {} is outside [0, 1]",
                self.stuck.low_budget_threshold
            ));
        }
        if self.locks.poll_interval_ms == 0 {
            warnings.push("locks.poll_interval_ms must be greater than 0".into());
        }
        warnings.extend(self.routing.validate());

        for (pattern, override_cfg) in &self.phases.overrides {
            if let Some(ref tier) = override_cfg.tier
                && !self.routing.tiers.is_empty()
                && !self.routing.tiers.iter().any(|t| &t.name == tier)
            {
                warnings.push(format!(
                    "Override for pattern '{}' names unknown tier '{}'",
                    pattern, tier
                ));
            }
        }
        warnings
    }
}

/// Resolved settings for a specific phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseSettings {
    pub max_attempts: u32,
    pub tier: Option<String>,
}

/// Case-insensitive glob match of a phase id (`*` and `?`).
pub fn pattern_matches(pattern: &str, name: &str) -> bool {
    let pattern: Vec<char> = pattern.to_lowercase().chars().collect();
    let name: Vec<char> = name.to_lowercase().chars().collect();
    glob_match(&pattern, &name)
}

fn glob_match(pattern: &[char], text: &[char]) -> bool {
    match pattern.split_first() {
        None => text.is_empty(),
        Some(('*', rest)) => (0..=text.len()).any(|i| glob_match(rest, &text[i..])),
        Some(('?', rest)) => !text.is_empty() && glob_match(rest, &text[1..]),
        Some((c, rest)) => text.first() == Some(c) && glob_match(rest, &text[1..]),
    }
}

/// Runtime configuration: the parsed file plus resolved paths and CLI flags.
#[derive(Debug, Clone)]
pub struct Config {
    pub project_dir: PathBuf,
    /// Artifact root holding `runs/`, `locks/` and `logs/`.
    pub root: PathBuf,
    pub toml: BuildpilotToml,
    pub verbose: bool,
    pub yes: bool,
}

impl Config {
    pub fn new(project_dir: PathBuf, root: Option<PathBuf>) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;
        let toml = BuildpilotToml::load_or_default(&project_dir)?;
        let root = root.unwrap_or_else(|| project_dir.join(DEFAULT_ARTIFACT_DIR));
        Ok(Self {
            project_dir,
            root,
            toml,
            verbose: false,
            yes: false,
        })
    }

    pub fn with_cli_args(
        project_dir: PathBuf,
        root: Option<PathBuf>,
        verbose: bool,
        yes: bool,
    ) -> Result<Self> {
        let mut config = Self::new(project_dir, root)?;
        config.verbose = verbose;
        config.yes = yes;
        Ok(config)
    }

    pub fn config_file(&self) -> PathBuf {
        self.project_dir.join(CONFIG_FILE)
    }

    pub fn log_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn lease_config(&self) -> LeaseConfig {
        self.toml.locks.lease_config()
    }

    pub fn capability_timeout(&self) -> Duration {
        Duration::from_secs(self.toml.orchestrator.capability_timeout_secs)
    }

    pub fn validate(&self) -> Vec<String> {
        self.toml.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tempfile::tempdir;

    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    #[test]
    fn test_parse_empty_uses_defaults() {
        let config = BuildpilotToml::parse("").unwrap();
        assert_eq!(config.orchestrator.max_attempts, 5);
        assert_eq!(config.replan.window, 3);
        assert_eq!(config.replan.similarity_threshold, 0.8);
        assert_eq!(config.replan.min_message_length, 30);
        assert_eq!(config.stuck.low_budget_threshold, 0.2);
        assert_eq!(config.stuck.max_escalations_per_phase, 1);
        assert_eq!(config.routing, TierTable::default());
        assert!(config.validate().is_empty());
    }

    #[test]
    fn test_parse_full_config() {
        let content = r#"
[orchestrator]
max_attempts = 7
max_tokens = 50000

[replan]
similarity_enabled = false
similarity_threshold = 0.9

[stuck]
consecutive_failure_threshold = 3

[locks]
ttl_secs = 60

[routing]
version = 4

[[routing.tiers]]
name = "small"
target = "s"

[[routing.tiers]]
name = "large"
target = "l"
strict_ok = false

[capability]
generate_cmd = "gen.sh"
"#;
        let config = BuildpilotToml::parse(content).unwrap();
        assert_eq!(config.orchestrator.max_attempts, 7);
        assert_eq!(config.orchestrator.max_tokens, 50_000);
        assert!(!config.replan.similarity_enabled);
        assert_eq!(config.replan.similarity_threshold, 0.9);
        assert_eq!(config.replan.window, 3);
        assert_eq!(config.stuck.consecutive_failure_threshold, 3);
        assert_eq!(config.locks.lease_config().ttl, Duration::from_secs(60));
        assert_eq!(config.routing.version, 4);
        assert_eq!(config.routing.tiers.len(), 2);
        assert!(!config.routing.tiers[1].strict_ok);
        assert_eq!(config.capability.generate_cmd.as_deref(), Some("gen.sh"));
    }

    #[test]
    fn test_parse_invalid_toml() {
        let err = BuildpilotToml::parse("[orchestrator\nmax_attempts = ").unwrap_err();
        assert!(err.to_string().contains("Failed to parse buildpilot.toml"));
    }

    #[test]
    fn test_validate_reports_bad_values() {
        let mut config = BuildpilotToml::default();
        config.replan.similarity_threshold = 1.5;
        config.orchestrator.max_attempts = 0;
        let warnings = config.validate();
        assert_eq!(warnings.len(), 2);
        assert!(warnings.iter().any(|w| w.contains("similarity_threshold")));
    }

    #[test]
    fn test_phase_overrides() {
        let content = r#"
[phases.overrides."docs-*"]
max_attempts = 2
tier = "standard"
"#;
        let config = BuildpilotToml::parse(content).unwrap();
        let docs = config.phase_settings("docs-api");
        assert_eq!(docs.max_attempts, 2);
        assert_eq!(docs.tier.as_deref(), Some("standard"));

        let other = config.phase_settings("build-core");
        assert_eq!(other.max_attempts, 5);
        assert!(other.tier.is_none());
    }

    #[test]
    fn test_override_with_unknown_tier_warns() {
        let content = r#"
[phases.overrides."x"]
tier = "mythical"
"#;
        let config = BuildpilotToml::parse(content).unwrap();
        assert!(config.validate().iter().any(|w| w.contains("mythical")));
    }

    #[test]
    fn test_pattern_matches() {
        assert!(pattern_matches("docs-*", "docs-api"));
        assert!(pattern_matches("DOCS-*", "docs-"));
        assert!(!pattern_matches("docs-*", "docs"));
        assert!(pattern_matches("p?", "p1"));
        assert!(!pattern_matches("p?", "p10"));
        assert!(pattern_matches("*-init", "db-init"));
        assert!(pattern_matches("*", ""));
    }

    #[test]
    fn test_env_overrides_capability_commands() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut config = BuildpilotToml::default();
        config.capability.generate_cmd = Some("from-file".into());

        // SAFETY: serialized by ENV_MUTEX
        unsafe { std::env::set_var(GENERATE_CMD_ENV, "from-env") };
        assert_eq!(config.generate_cmd().as_deref(), Some("from-env"));
        unsafe { std::env::remove_var(GENERATE_CMD_ENV) };
        assert_eq!(config.generate_cmd().as_deref(), Some("from-file"));
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempdir().unwrap();
        let mut config = BuildpilotToml::default();
        config.orchestrator.max_attempts = 9;
        config.save(&dir.path().join(CONFIG_FILE)).unwrap();

        let loaded = BuildpilotToml::load_or_default(dir.path()).unwrap();
        assert_eq!(loaded.orchestrator.max_attempts, 9);
        assert_eq!(loaded.routing.tiers.len(), 3);
    }

    #[test]
    fn test_config_paths() {
        let dir = tempdir().unwrap();
        let config = Config::new(dir.path().to_path_buf(), None).unwrap();
        assert!(config.root.ends_with(DEFAULT_ARTIFACT_DIR));
        assert!(config.log_dir().ends_with("logs"));
        assert!(config.config_file().ends_with(CONFIG_FILE));
    }
}
