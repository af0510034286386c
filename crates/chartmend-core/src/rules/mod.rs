//! Policy rules evaluated against chart workloads.
//!
//! Each rule is a pure predicate over a [`WorkloadSpec`], optionally paired
//! with a deterministic fix generator that returns a values overlay. Rules
//! are registered once into an ordered [`RuleRegistry`]; evaluation order is
//! registration order.

pub mod availability;
pub mod engine;
pub mod fix;
pub mod probes;
pub mod resources;
pub mod security;

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;

use crate::domain::{Category, RuleError, Severity, WorkloadSpec};

pub use engine::{ChartReport, RuleFailure, RulesEngine};
pub use fix::{strip_fixed_fields, FixOptions, ProbePort, ProbeSettings, RatioStrategy, RatioTarget};

// ---------------------------------------------------------------------------
// Thresholds
// ---------------------------------------------------------------------------

/// Resource fields the optimizer must never modify.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceField {
    CpuRequest,
    CpuLimit,
    MemoryRequest,
    MemoryLimit,
}

impl ResourceField {
    /// `(section, key)` of this field under a `resources` mapping.
    pub fn path(self) -> (&'static str, &'static str) {
        match self {
            ResourceField::CpuRequest => ("requests", "cpu"),
            ResourceField::CpuLimit => ("limits", "cpu"),
            ResourceField::MemoryRequest => ("requests", "memory"),
            ResourceField::MemoryLimit => ("limits", "memory"),
        }
    }
}

/// Tunable thresholds shared by the standard rule set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleThresholds {
    /// Limit/request ratio above which RES002/RES003 fire.
    pub limit_request_ratio: f64,
    pub low_cpu_millicores: f64,
    pub low_memory_mib: f64,
    /// Minimum evictions a PDB must allow.
    pub pdb_blocking: i64,
    pub cpu_bump_min_millicores: f64,
    pub memory_bump_min_mib: f64,
    pub burstable_target_ratio: f64,
    pub fixed_resource_fields: BTreeSet<ResourceField>,
}

impl Default for RuleThresholds {
    fn default() -> Self {
        Self {
            limit_request_ratio: 2.0,
            low_cpu_millicores: 10.0,
            low_memory_mib: 32.0,
            pdb_blocking: 1,
            cpu_bump_min_millicores: 100.0,
            memory_bump_min_mib: 128.0,
            burstable_target_ratio: 1.5,
            fixed_resource_fields: [ResourceField::CpuLimit, ResourceField::MemoryLimit]
                .into_iter()
                .collect(),
        }
    }
}

impl RuleThresholds {
    pub fn is_fixed(&self, field: ResourceField) -> bool {
        self.fixed_resource_fields.contains(&field)
    }
}

// ---------------------------------------------------------------------------
// Rule trait
// ---------------------------------------------------------------------------

/// What a rule reports for one workload; the engine turns it into a
/// [`crate::domain::Violation`].
#[derive(Debug, Clone, PartialEq)]
pub struct Finding {
    pub description: String,
    pub current_value: String,
    pub recommended_value: String,
    /// Overrides the rule's default severity for this finding.
    pub severity: Option<Severity>,
}

impl Finding {
    pub fn new(
        description: impl Into<String>,
        current_value: impl Into<String>,
        recommended_value: impl Into<String>,
    ) -> Self {
        Self {
            description: description.into(),
            current_value: current_value.into(),
            recommended_value: recommended_value.into(),
            severity: None,
        }
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = Some(severity);
        self
    }
}

/// A named, categorized predicate over a workload.
pub trait Rule: Send + Sync {
    fn id(&self) -> &'static str;

    fn name(&self) -> &'static str;

    fn category(&self) -> Category;

    fn severity(&self) -> Severity;

    fn auto_fixable(&self) -> bool {
        true
    }

    /// Evaluate the rule. Must not touch shared state.
    fn evaluate(&self, workload: &WorkloadSpec) -> Result<Vec<Finding>, RuleError>;

    /// Deterministic values overlay that resolves this rule's finding.
    fn fix(&self, _workload: &WorkloadSpec, _options: &FixOptions) -> Option<serde_json::Value> {
        None
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Ordered, immutable-after-build set of rules.
#[derive(Clone)]
pub struct RuleRegistry {
    rules: Vec<Arc<dyn Rule>>,
    thresholds: RuleThresholds,
}

impl std::fmt::Debug for RuleRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuleRegistry")
            .field("rules", &self.ids())
            .field("thresholds", &self.thresholds)
            .finish()
    }
}

impl RuleRegistry {
    pub fn empty(thresholds: RuleThresholds) -> Self {
        Self {
            rules: Vec::new(),
            thresholds,
        }
    }

    /// The built-in rule catalogue in evaluation order, with ratio fixes
    /// raising requests.
    pub fn standard(thresholds: &RuleThresholds) -> Self {
        Self::for_options(thresholds, &FixOptions::default())
    }

    /// The built-in catalogue for a run that fixes with `options`. The ratio
    /// rules stay silent when the side their fix would move is protected.
    pub fn for_options(thresholds: &RuleThresholds, options: &FixOptions) -> Self {
        let t = thresholds.clone();
        let target = options.ratio_target;
        let mut registry = Self::empty(t.clone());
        let rules: Vec<Arc<dyn Rule>> = vec![
            Arc::new(resources::NoResourceRequests::new(t.clone())),
            Arc::new(resources::CpuLimitRequestRatio::new(t.clone(), target)),
            Arc::new(resources::MemoryLimitRequestRatio::new(t.clone(), target)),
            Arc::new(resources::NoCpuLimit::new(t.clone())),
            Arc::new(resources::NoMemoryLimit::new(t.clone())),
            Arc::new(resources::LowCpuRequest::new(t.clone())),
            Arc::new(resources::NoMemoryRequest::new(t.clone())),
            Arc::new(resources::LowMemoryRequest::new(t.clone())),
            Arc::new(probes::MissingProbe::liveness()),
            Arc::new(probes::MissingProbe::readiness()),
            Arc::new(probes::MissingProbe::startup()),
            Arc::new(availability::NoPodDisruptionBudget),
            Arc::new(availability::NoPodAntiAffinity),
            Arc::new(availability::BlockingPdb::new(t.pdb_blocking)),
            Arc::new(availability::MissingTopologySpread),
            Arc::new(availability::SingleReplica),
            Arc::new(security::RunningAsRoot),
        ];
        registry.rules = rules;
        registry
    }

    /// Append a rule. Ids must be unique.
    pub fn register(&mut self, rule: Arc<dyn Rule>) -> Result<(), RuleError> {
        if self.get(rule.id()).is_some() {
            return Err(RuleError::Evaluation {
                rule_id: rule.id().to_string(),
                message: "rule id already registered".to_string(),
            });
        }
        self.rules.push(rule);
        Ok(())
    }

    pub fn get(&self, rule_id: &str) -> Option<&Arc<dyn Rule>> {
        self.rules.iter().find(|r| r.id() == rule_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Rule>> {
        self.rules.iter()
    }

    pub fn ids(&self) -> Vec<&'static str> {
        self.rules.iter().map(|r| r.id()).collect()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn thresholds(&self) -> &RuleThresholds {
        &self.thresholds
    }
}
