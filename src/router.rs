//! Model tier routing.
//!
//! A [`TierTable`] lists execution tiers from cheapest to most capable. At run
//! start the table is frozen into a [`RoutingSnapshot`] that the store persists
//! beside the run, so a restarted run keeps routing exactly as it began even if
//! the configured table has since changed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::anchor::SafetyProfile;
use crate::errors::OrchestratorError;

/// One execution tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierEntry {
    pub name: String,
    /// Opaque target handed to the capability (model id, endpoint, profile).
    pub target: String,
    /// Whether this tier may be selected under the strict safety profile.
    #[serde(default = "default_strict_ok")]
    pub strict_ok: bool,
}

fn default_strict_ok() -> bool {
    true
}

impl TierEntry {
    pub fn new(name: &str, target: &str, strict_ok: bool) -> Self {
        Self {
            name: name.to_string(),
            target: target.to_string(),
            strict_ok,
        }
    }
}

/// Versioned tier list, ordered cheap to capable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierTable {
    #[serde(default = "default_table_version")]
    pub version: u32,
    #[serde(default)]
    pub tiers: Vec<TierEntry>,
}

fn default_table_version() -> u32 {
    1
}

impl Default for TierTable {
    fn default() -> Self {
        Self {
            version: 1,
            tiers: vec![
                TierEntry::new("economy", "economy", true),
                TierEntry::new("standard", "standard", true),
                TierEntry::new("frontier", "frontier", false),
            ],
        }
    }
}

impl TierTable {
    /// Validate the table and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.tiers.is_empty() {
            warnings.push("Routing table has no tiers; the built-in table will be used".into());
        }
        for (i, tier) in self.tiers.iter().enumerate() {
            if tier.name.trim().is_empty() {
                warnings.push(format!("Routing tier #{} has an empty name", i + 1));
            }
            if self.tiers[..i].iter().any(|t| t.name == tier.name) {
                warnings.push(format!("Routing tier '{}' is declared twice", tier.name));
            }
        }
        warnings
    }
}

/// A run-scoped, immutable copy of the routing table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingSnapshot {
    pub run_id: String,
    pub captured_at: DateTime<Utc>,
    pub table: TierTable,
}

impl RoutingSnapshot {
    /// Freeze `table` for `run_id`. An empty table falls back to the built-in one.
    pub fn capture(run_id: &str, table: &TierTable) -> Self {
        let table = if table.tiers.is_empty() {
            TierTable::default()
        } else {
            table.clone()
        };
        Self {
            run_id: run_id.to_string(),
            captured_at: Utc::now(),
            table,
        }
    }
}

/// Tier selection over one run's snapshot.
#[derive(Debug, Clone)]
pub struct TierRouter {
    snapshot: RoutingSnapshot,
}

impl TierRouter {
    pub fn new(snapshot: RoutingSnapshot) -> Self {
        Self { snapshot }
    }

    pub fn snapshot(&self) -> &RoutingSnapshot {
        &self.snapshot
    }

    pub fn version(&self) -> u32 {
        self.snapshot.table.version
    }

    /// The cheapest tier; phases start here.
    pub fn base_tier(&self) -> Option<&TierEntry> {
        self.snapshot.table.tiers.first()
    }

    /// Look up a tier by name. An empty name means the base tier.
    pub fn resolve(&self, name: &str) -> Result<&TierEntry, OrchestratorError> {
        let found = if name.is_empty() {
            self.base_tier()
        } else {
            self.snapshot.table.tiers.iter().find(|t| t.name == name)
        };
        found.ok_or_else(|| OrchestratorError::UnknownTier(name.to_string()))
    }

    /// The nominal next tier after `current`, if it may be used under `profile`.
    ///
    /// Returns `None` when `current` is the last (or an unknown) tier, or when
    /// the next tier is not cleared for strict runs.
    pub fn escalate(&self, current: &str, profile: SafetyProfile) -> Option<&TierEntry> {
        let tiers = &self.snapshot.table.tiers;
        let position = if current.is_empty() {
            Some(0)
        } else {
            tiers.iter().position(|t| t.name == current)
        };
        let Some(position) = position else {
            tracing::warn!(tier = current, "escalation requested from unknown tier");
            return None;
        };
        let next = tiers.get(position + 1)?;
        if profile == SafetyProfile::Strict && !next.strict_ok {
            tracing::info!(
                from = current,
                to = %next.name,
                "next tier is not cleared for strict runs"
            );
            return None;
        }
        Some(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn router() -> TierRouter {
        TierRouter::new(RoutingSnapshot::capture("run-1", &TierTable::default()))
    }

    #[test]
    fn test_escalate_to_next_tier() {
        let r = router();
        assert_eq!(
            r.escalate("economy", SafetyProfile::Strict).map(|t| t.name.as_str()),
            Some("standard")
        );
        assert_eq!(
            r.escalate("", SafetyProfile::Normal).map(|t| t.name.as_str()),
            Some("standard")
        );
    }

    #[test]
    fn test_strict_refuses_unsuitable_tier() {
        let r = router();
        assert!(r.escalate("standard", SafetyProfile::Strict).is_none());
        assert_eq!(
            r.escalate("standard", SafetyProfile::Normal).map(|t| t.name.as_str()),
            Some("frontier")
        );
    }

    #[test]
    fn test_no_tier_after_last() {
        assert!(router().escalate("frontier", SafetyProfile::Normal).is_none());
        assert!(router().escalate("nonexistent", SafetyProfile::Normal).is_none());
    }

    #[test]
    fn test_resolve() {
        let r = router();
        assert_eq!(r.resolve("").unwrap().name, "economy");
        assert_eq!(r.resolve("frontier").unwrap().target, "frontier");
        assert!(matches!(
            r.resolve("mystery"),
            Err(OrchestratorError::UnknownTier(_))
        ));
    }

    #[test]
    fn test_empty_table_falls_back_to_builtin() {
        let empty = TierTable {
            version: 7,
            tiers: vec![],
        };
        let snapshot = RoutingSnapshot::capture("run-1", &empty);
        assert_eq!(snapshot.table, TierTable::default());
        assert!(!empty.validate().is_empty());
    }

    #[test]
    fn test_snapshot_is_independent_of_source_table() {
        let mut table = TierTable::default();
        let r = TierRouter::new(RoutingSnapshot::capture("run-1", &table));
        table.tiers.clear();
        assert_eq!(r.base_tier().unwrap().name, "economy");
    }

    #[test]
    fn test_validate_duplicate_names() {
        let table = TierTable {
            version: 1,
            tiers: vec![
                TierEntry::new("a", "x", true),
                TierEntry::new("a", "y", true),
            ],
        };
        let warnings = table.validate();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("declared twice"));
    }

    #[test]
    fn test_strict_ok_defaults_true_when_parsed() {
        let tier: TierEntry = serde_json::from_str(r#"{"name":"a","target":"b"}"#).unwrap();
        assert!(tier.strict_ok);
    }
}
