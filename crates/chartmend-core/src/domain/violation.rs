//! Violations emitted by the rules engine.

use serde::{Deserialize, Serialize};

use super::chart::AnalysisSource;
use super::verification::VerificationResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Error,
    Warning,
    Info,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Severity::Error => "error",
            Severity::Warning => "warning",
            Severity::Info => "info",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Resources,
    Probes,
    Availability,
    Security,
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Category::Resources => "resources",
            Category::Probes => "probes",
            Category::Availability => "availability",
            Category::Security => "security",
        })
    }
}

/// One rule firing against one workload of one chart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Violation {
    pub rule_id: String,
    pub rule_name: String,
    pub chart_name: String,
    pub workload: String,
    pub description: String,
    pub severity: Severity,
    pub category: Category,
    pub current_value: String,
    pub recommended_value: String,
    pub fix_available: bool,
    pub analysis_source: AnalysisSource,
    verification: VerificationResult,
}

impl Violation {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        rule_id: impl Into<String>,
        rule_name: impl Into<String>,
        chart_name: impl Into<String>,
        workload: impl Into<String>,
        description: impl Into<String>,
        severity: Severity,
        category: Category,
        analysis_source: AnalysisSource,
    ) -> Self {
        Self {
            rule_id: rule_id.into(),
            rule_name: rule_name.into(),
            chart_name: chart_name.into(),
            workload: workload.into(),
            description: description.into(),
            severity,
            category,
            current_value: String::new(),
            recommended_value: String::new(),
            fix_available: false,
            analysis_source,
            verification: VerificationResult::default(),
        }
    }

    /// Stable identity used to key bundle verification results.
    pub fn key(&self) -> String {
        format!("{}::{}::{}", self.chart_name, self.rule_id, self.workload)
    }

    pub fn verification(&self) -> &VerificationResult {
        &self.verification
    }

    pub(crate) fn record_verification(&mut self, result: VerificationResult) {
        self.verification = result;
    }
}
