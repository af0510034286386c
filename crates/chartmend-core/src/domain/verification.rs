//! Verification outcomes for staged fixes.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Outcome of re-checking one violation against a staged fix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationStatus {
    /// Violation present before the fix and absent after.
    Verified,
    /// Violation still present after the fix.
    Unresolved,
    /// Could not be determined (render failure, unknown rule, baseline clean).
    Unverified,
    /// Verification was never attempted.
    NotRun,
}

impl VerificationStatus {
    /// Precedence when folding many results into one: higher wins.
    fn severity_rank(self) -> u8 {
        match self {
            VerificationStatus::Verified => 0,
            VerificationStatus::NotRun => 1,
            VerificationStatus::Unresolved => 2,
            VerificationStatus::Unverified => 3,
        }
    }
}

impl std::fmt::Display for VerificationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            VerificationStatus::Verified => "verified",
            VerificationStatus::Unresolved => "unresolved",
            VerificationStatus::Unverified => "unverified",
            VerificationStatus::NotRun => "not_run",
        };
        f.write_str(s)
    }
}

/// Result of verifying a single violation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationResult {
    pub status: VerificationStatus,
    pub note: String,
    pub before_has_violation: Option<bool>,
    pub after_has_violation: Option<bool>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub suggestions: Vec<String>,
}

impl VerificationResult {
    pub fn not_run(note: impl Into<String>) -> Self {
        Self {
            status: VerificationStatus::NotRun,
            note: note.into(),
            before_has_violation: None,
            after_has_violation: None,
            suggestions: Vec::new(),
        }
    }

    pub fn unverified(note: impl Into<String>) -> Self {
        Self {
            status: VerificationStatus::Unverified,
            ..Self::not_run(note)
        }
    }

    pub fn is_verified(&self) -> bool {
        self.status == VerificationStatus::Verified
    }
}

impl Default for VerificationResult {
    fn default() -> Self {
        Self::not_run("")
    }
}

/// Aggregate verification of every violation a staged bundle addresses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleVerification {
    pub status: VerificationStatus,
    pub note: String,
    /// Keyed by [`crate::domain::Violation::key`].
    pub per_violation: BTreeMap<String, VerificationResult>,
    /// Rules that fire after the fix but not before it.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub introduced_rule_ids: Vec<String>,
    #[serde(default)]
    pub parent_only_render: bool,
}

impl BundleVerification {
    /// Fold per-violation results into a bundle verdict.
    ///
    /// The bundle is `verified` only when it is non-empty, every constituent
    /// is verified, and no new rule started firing.
    pub fn aggregate(
        per_violation: BTreeMap<String, VerificationResult>,
        introduced_rule_ids: Vec<String>,
        parent_only_render: bool,
    ) -> Self {
        if per_violation.is_empty() {
            return Self {
                status: VerificationStatus::Unverified,
                note: "Bundle verification: no violations to verify.".to_string(),
                per_violation,
                introduced_rule_ids,
                parent_only_render,
            };
        }

        let count = |status: VerificationStatus| {
            per_violation
                .values()
                .filter(|r| r.status == status)
                .count()
        };
        let mut status = per_violation
            .values()
            .map(|r| r.status)
            .max_by_key(|s| s.severity_rank())
            .unwrap_or(VerificationStatus::Unverified);

        let mut note = format!(
            "Bundle verification: {} verified, {} unresolved, {} unverified.",
            count(VerificationStatus::Verified),
            count(VerificationStatus::Unresolved),
            count(VerificationStatus::Unverified),
        );
        let not_run = count(VerificationStatus::NotRun);
        if not_run > 0 {
            note.push_str(&format!(" {not_run} not run."));
        }
        if !introduced_rule_ids.is_empty() {
            note.push_str(&format!(
                " New violations introduced: {}.",
                introduced_rule_ids.join(", ")
            ));
            if status == VerificationStatus::Verified {
                status = VerificationStatus::Unresolved;
            }
        }

        Self {
            status,
            note,
            per_violation,
            introduced_rule_ids,
            parent_only_render,
        }
    }

    pub fn is_verified(&self) -> bool {
        self.status == VerificationStatus::Verified
    }
}
