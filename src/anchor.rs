//! Intention anchor: the durable, schema-closed statement of what a run is for.
//!
//! Every struct in the anchor rejects unknown fields, so a typo in a run's
//! declaration fails construction instead of being silently absorbed. A missing
//! risk classification resolves to [`SafetyProfile::Strict`].

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::Path;

use crate::errors::AnchorError;

pub const DEFAULT_MAX_CONTEXT_CHARS: u64 = 100_000;
pub const DEFAULT_MAX_SOT_CHARS: u64 = 4_000;

/// Risk posture for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SafetyProfile {
    Normal,
    /// Absence of a classification maps here.
    #[default]
    Strict,
}

impl fmt::Display for SafetyProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Normal => write!(f, "normal"),
            Self::Strict => write!(f, "strict"),
        }
    }
}

impl std::str::FromStr for SafetyProfile {
    type Err = AnchorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "normal" => Ok(Self::Normal),
            "strict" => Ok(Self::Strict),
            _ => Err(AnchorError::Parse(format!(
                "Invalid safety profile '{}'. Valid values: normal, strict",
                s
            ))),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Constraints {
    #[serde(default)]
    pub must: Vec<String>,
    #[serde(default)]
    pub must_not: Vec<String>,
    #[serde(default)]
    pub preferences: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Scope {
    #[serde(default)]
    pub allowed_paths: Vec<String>,
    #[serde(default)]
    pub out_of_scope: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Budgets {
    #[serde(default = "default_max_context_chars")]
    pub max_context_chars: u64,
    #[serde(default = "default_max_sot_chars")]
    pub max_sot_chars: u64,
}

fn default_max_context_chars() -> u64 {
    DEFAULT_MAX_CONTEXT_CHARS
}

fn default_max_sot_chars() -> u64 {
    DEFAULT_MAX_SOT_CHARS
}

impl Default for Budgets {
    fn default() -> Self {
        Self {
            max_context_chars: DEFAULT_MAX_CONTEXT_CHARS,
            max_sot_chars: DEFAULT_MAX_SOT_CHARS,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RiskProfile {
    #[serde(default)]
    pub safety_profile: SafetyProfile,
    #[serde(default)]
    pub protected_paths: Vec<String>,
}

fn default_version() -> u32 {
    1
}

/// The authoritative declaration of what a run is trying to achieve.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IntentionAnchor {
    #[serde(default = "default_version")]
    pub version: u32,
    pub north_star: String,
    /// Ordered: earlier entries have higher priority when scope must be cut.
    #[serde(default)]
    pub success_criteria: Vec<String>,
    #[serde(default)]
    pub constraints: Constraints,
    #[serde(default)]
    pub scope: Scope,
    #[serde(default)]
    pub budgets: Budgets,
    #[serde(default)]
    pub risk_profile: RiskProfile,
}

impl IntentionAnchor {
    /// Build a minimal anchor. Risk profile defaults to strict.
    pub fn new(north_star: &str, success_criteria: Vec<String>) -> Result<Self, AnchorError> {
        let anchor = Self {
            version: 1,
            north_star: north_star.to_string(),
            success_criteria,
            constraints: Constraints::default(),
            scope: Scope::default(),
            budgets: Budgets::default(),
            risk_profile: RiskProfile::default(),
        };
        anchor.validate()?;
        Ok(anchor)
    }

    pub fn from_json(content: &str) -> Result<Self, AnchorError> {
        let anchor: Self =
            serde_json::from_str(content).map_err(|e| AnchorError::Parse(e.to_string()))?;
        anchor.validate()?;
        Ok(anchor)
    }

    pub fn from_yaml(content: &str) -> Result<Self, AnchorError> {
        let anchor: Self =
            serde_yaml::from_str(content).map_err(|e| AnchorError::Parse(e.to_string()))?;
        anchor.validate()?;
        Ok(anchor)
    }

    /// Load from a `.json`, `.yaml` or `.yml` file.
    pub fn load(path: &Path) -> Result<Self, AnchorError> {
        let content = std::fs::read_to_string(path).map_err(|source| AnchorError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => Self::from_yaml(&content),
            _ => Self::from_json(&content),
        }
    }

    pub fn to_json(&self) -> Result<String, AnchorError> {
        serde_json::to_string_pretty(self).map_err(|e| AnchorError::Parse(e.to_string()))
    }

    pub fn validate(&self) -> Result<(), AnchorError> {
        if self.north_star.trim().is_empty() {
            return Err(AnchorError::MissingNorthStar);
        }
        if self.success_criteria.iter().any(|c| c.trim().is_empty()) {
            return Err(AnchorError::BlankEntry {
                field: "success_criteria",
            });
        }
        if self.constraints.must.iter().any(|c| c.trim().is_empty()) {
            return Err(AnchorError::BlankEntry {
                field: "constraints.must",
            });
        }
        Ok(())
    }

    /// Produce the next version of this anchor. The original is left untouched.
    pub fn revise<F>(&self, f: F) -> Result<Self, AnchorError>
    where
        F: FnOnce(&mut IntentionAnchor),
    {
        let mut next = self.clone();
        f(&mut next);
        next.version = self.version + 1;
        next.validate()?;
        Ok(next)
    }

    pub fn safety_profile(&self) -> SafetyProfile {
        self.risk_profile.safety_profile
    }

    /// SHA-256 of the canonical JSON form.
    pub fn digest(&self) -> String {
        let canonical = serde_json::to_vec(self).unwrap_or_default();
        hex::encode(Sha256::digest(&canonical))
    }

    pub fn is_protected(&self, path: &str) -> bool {
        self.risk_profile
            .protected_paths
            .iter()
            .any(|p| path_has_prefix(path, p))
    }

    /// A path is in scope when it matches no out-of-scope prefix and, if an
    /// allow-list is declared, matches one of its prefixes.
    pub fn is_in_scope(&self, path: &str) -> bool {
        if self
            .scope
            .out_of_scope
            .iter()
            .any(|p| path_has_prefix(path, p))
        {
            return false;
        }
        self.scope.allowed_paths.is_empty()
            || self
                .scope
                .allowed_paths
                .iter()
                .any(|p| path_has_prefix(path, p))
    }
}

fn path_has_prefix(path: &str, prefix: &str) -> bool {
    let path = path.trim_start_matches("./");
    let prefix = prefix.trim_start_matches("./").trim_end_matches('/');
    if prefix.is_empty() {
        return false;
    }
    path == prefix || path.starts_with(&format!("{}/", prefix))
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL_ANCHOR: &str = r#"{
        "north_star": "Ship a streaming JSON parser",
        "success_criteria": ["parses RFC 8259", "streams input", "has benchmarks"],
        "constraints": {
            "must": ["no unsafe code", "keep public API"],
            "must_not": ["add network deps"],
            "preferences": ["small diffs"]
        },
        "scope": {"allowed_paths": ["src/"], "out_of_scope": ["src/legacy"]},
        "budgets": {"max_context_chars": 50000},
        "risk_profile": {"safety_profile": "normal", "protected_paths": ["src/auth"]}
    }"#;

    #[test]
    fn test_parse_full_anchor() {
        let anchor = IntentionAnchor::from_json(FULL_ANCHOR).unwrap();
        assert_eq!(anchor.version, 1);
        assert_eq!(anchor.success_criteria.len(), 3);
        assert_eq!(anchor.constraints.must.len(), 2);
        assert_eq!(anchor.budgets.max_context_chars, 50_000);
        assert_eq!(anchor.budgets.max_sot_chars, DEFAULT_MAX_SOT_CHARS);
        assert_eq!(anchor.safety_profile(), SafetyProfile::Normal);
    }

    #[test]
    fn test_unknown_top_level_field_rejected() {
        let json = r#"{"north_star": "x", "sucess_criteria": ["typo"]}"#;
        let err = IntentionAnchor::from_json(json).unwrap_err();
        assert!(matches!(err, AnchorError::Parse(_)));
        assert!(err.to_string().contains("sucess_criteria"));
    }

    #[test]
    fn test_unknown_nested_field_rejected() {
        let json = r#"{"north_star": "x", "constraints": {"must": [], "should": ["y"]}}"#;
        assert!(IntentionAnchor::from_json(json).is_err());

        let json = r#"{"north_star": "x", "budgets": {"max_tokens": 10}}"#;
        assert!(IntentionAnchor::from_json(json).is_err());
    }

    #[test]
    fn test_missing_risk_profile_is_strict() {
        let anchor = IntentionAnchor::from_json(r#"{"north_star": "x"}"#).unwrap();
        assert_eq!(anchor.safety_profile(), SafetyProfile::Strict);

        let anchor =
            IntentionAnchor::from_json(r#"{"north_star": "x", "risk_profile": {}}"#).unwrap();
        assert_eq!(anchor.safety_profile(), SafetyProfile::Strict);
    }

    #[test]
    fn test_blank_north_star_rejected() {
        let err = IntentionAnchor::from_json(r#"{"north_star": "   "}"#).unwrap_err();
        assert!(matches!(err, AnchorError::MissingNorthStar));
        assert!(IntentionAnchor::from_json(r#"{}"#).is_err());
    }

    #[test]
    fn test_yaml_anchor() {
        let yaml = "north_star: Faster builds\nsuccess_criteria:\n  - cache hits\n";
        let anchor = IntentionAnchor::from_yaml(yaml).unwrap();
        assert_eq!(anchor.success_criteria, vec!["cache hits"]);

        let bad = "north_star: x\nextra: 1\n";
        assert!(IntentionAnchor::from_yaml(bad).is_err());
    }

    #[test]
    fn test_revise_bumps_version_and_revalidates() {
        let anchor = IntentionAnchor::new("goal", vec!["a".into()]).unwrap();
        let next = anchor
            .revise(|a| a.success_criteria.push("b".into()))
            .unwrap();
        assert_eq!(next.version, 2);
        assert_eq!(anchor.version, 1);
        assert_eq!(next.success_criteria.len(), 2);

        assert!(anchor.revise(|a| a.north_star.clear()).is_err());
    }

    #[test]
    fn test_digest_is_stable_and_content_sensitive() {
        let a = IntentionAnchor::from_json(FULL_ANCHOR).unwrap();
        let b = IntentionAnchor::from_json(FULL_ANCHOR).unwrap();
        assert_eq!(a.digest(), b.digest());
        assert_eq!(a.digest().len(), 64);

        let c = a.revise(|x| x.north_star.push('!')).unwrap();
        assert_ne!(a.digest(), c.digest());
    }

    #[test]
    fn test_scope_and_protection() {
        let anchor = IntentionAnchor::from_json(FULL_ANCHOR).unwrap();
        assert!(anchor.is_in_scope("src/lib.rs"));
        assert!(!anchor.is_in_scope("src/legacy/old.rs"));
        assert!(!anchor.is_in_scope("build.rs"));
        assert!(anchor.is_protected("src/auth/token.rs"));
        assert!(!anchor.is_protected("src/authz.rs"));
    }

    #[test]
    fn test_safety_profile_from_str() {
        assert_eq!(
            "STRICT".parse::<SafetyProfile>().unwrap(),
            SafetyProfile::Strict
        );
        assert!("lenient".parse::<SafetyProfile>().is_err());
    }
}
