//! Per-attempt proof records.
//!
//! One JSON file per executed attempt, written whether the attempt passed or
//! failed, so a run can be audited after the fact without replaying it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::capability::AuditVerdict;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProofRecord {
    pub run_id: String,
    pub phase_id: String,
    pub attempt_index: u32,
    pub revision_epoch: u32,
    pub tier: String,
    pub target: String,
    /// Attempt status as journaled (`complete`, `retry`, ...).
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_details: Option<String>,
    #[serde(default)]
    pub touched_paths: Vec<String>,
    #[serde(default)]
    pub tokens_used: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verdict: Option<AuditVerdict>,
    pub anchor_digest: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl ProofRecord {
    pub fn duration_ms(&self) -> i64 {
        (self.finished_at - self.started_at).num_milliseconds()
    }

    pub fn passed(&self) -> bool {
        self.error_type.is_none() && self.verdict.as_ref().is_some_and(|v| v.approved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_passed_requires_approved_verdict_and_no_error() {
        let now = Utc::now();
        let mut record = ProofRecord {
            run_id: "r".into(),
            phase_id: "p1".into(),
            attempt_index: 0,
            revision_epoch: 0,
            tier: "economy".into(),
            target: "economy".into(),
            status: "complete".into(),
            error_type: None,
            error_details: None,
            touched_paths: vec![],
            tokens_used: 10,
            verdict: Some(AuditVerdict::approve()),
            anchor_digest: "abc".into(),
            started_at: now,
            finished_at: now + chrono::Duration::milliseconds(1500),
        };
        assert!(record.passed());
        assert_eq!(record.duration_ms(), 1500);

        record.verdict = Some(AuditVerdict::reject(vec!["nope".into()]));
        assert!(!record.passed());

        record.verdict = None;
        record.error_type = Some("builder_error".into());
        assert!(!record.passed());
    }

    #[test]
    fn test_optional_fields_are_omitted() {
        let now = Utc::now();
        let record = ProofRecord {
            run_id: "r".into(),
            phase_id: "p1".into(),
            attempt_index: 2,
            revision_epoch: 1,
            tier: "standard".into(),
            target: "standard".into(),
            status: "retry".into(),
            error_type: None,
            error_details: None,
            touched_paths: vec![],
            tokens_used: 0,
            verdict: None,
            anchor_digest: "abc".into(),
            started_at: now,
            finished_at: now,
        };
        let json = serde_json::to_string(&record).unwrap();
        assert!(!json.contains("error_type"));
        assert!(!json.contains("verdict"));
    }
}
