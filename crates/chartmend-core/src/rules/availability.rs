//! Availability rules (AVL001-AVL005).

use serde_json::{json, Value};

use super::fix::FixOptions;
use super::{Finding, Rule};
use crate::domain::{Category, IntOrString, RuleError, Severity, WorkloadSpec};

fn replicas_or_default(w: &WorkloadSpec) -> i64 {
    w.replicas.unwrap_or(1)
}

fn app_selector(w: &WorkloadSpec) -> Value {
    json!({"matchLabels": {"app": w.chart_name}})
}

pub struct NoPodDisruptionBudget;

impl Rule for NoPodDisruptionBudget {
    fn id(&self) -> &'static str {
        "AVL001"
    }
    fn name(&self) -> &'static str {
        "No Pod Disruption Budget"
    }
    fn category(&self) -> Category {
        Category::Availability
    }
    fn severity(&self) -> Severity {
        Severity::Warning
    }

    fn evaluate(&self, w: &WorkloadSpec) -> Result<Vec<Finding>, RuleError> {
        let replicas = replicas_or_default(w);
        let has_pdb = w.pdb.as_ref().is_some_and(|p| p.enabled);
        if replicas <= 1 || has_pdb {
            return Ok(vec![]);
        }
        Ok(vec![Finding::new(
            "Workload does not have a PodDisruptionBudget configured",
            "none",
            "podDisruptionBudget.maxUnavailable=1",
        )])
    }

    fn fix(&self, w: &WorkloadSpec, _options: &FixOptions) -> Option<Value> {
        Some(json!({
            "podDisruptionBudget": {
                "enabled": true,
                "maxUnavailable": 1,
                "unhealthyPodEvictionPolicy": "AlwaysAllow",
                "labelSelector": app_selector(w),
            }
        }))
    }
}

pub struct NoPodAntiAffinity;

impl Rule for NoPodAntiAffinity {
    fn id(&self) -> &'static str {
        "AVL002"
    }
    fn name(&self) -> &'static str {
        "No Pod Anti-Affinity"
    }
    fn category(&self) -> Category {
        Category::Availability
    }
    fn severity(&self) -> Severity {
        Severity::Info
    }

    fn evaluate(&self, w: &WorkloadSpec) -> Result<Vec<Finding>, RuleError> {
        if replicas_or_default(w) <= 1 || w.has_anti_affinity {
            return Ok(vec![]);
        }
        Ok(vec![Finding::new(
            "Workload does not have pod anti-affinity for high availability",
            "none",
            "preferred podAntiAffinity on kubernetes.io/hostname",
        )])
    }

    fn fix(&self, w: &WorkloadSpec, _options: &FixOptions) -> Option<Value> {
        Some(json!({
            "affinity": {
                "podAntiAffinity": {
                    "preferredDuringSchedulingIgnoredDuringExecution": [{
                        "weight": 100,
                        "podAffinityTerm": {
                            "labelSelector": app_selector(w),
                            "topologyKey": "kubernetes.io/hostname",
                        }
                    }]
                }
            }
        }))
    }
}

/// A PDB that allows fewer evictions than the configured minimum.
pub struct BlockingPdb {
    min_evictions: i64,
}

impl BlockingPdb {
    pub fn new(min_evictions: i64) -> Self {
        Self { min_evictions }
    }

    fn max_unavailable_blocks(&self, value: &IntOrString, replicas: i64) -> bool {
        value
            .resolve(replicas)
            .is_some_and(|allowed| allowed < self.min_evictions)
    }

    fn min_available_blocks(&self, value: &IntOrString, replicas: i64) -> bool {
        if let Some(pct) = value.percent() {
            return pct >= 100;
        }
        value
            .resolve(replicas)
            .is_some_and(|min| replicas - min < self.min_evictions)
    }
}

impl Rule for BlockingPdb {
    fn id(&self) -> &'static str {
        "AVL003"
    }
    fn name(&self) -> &'static str {
        "Blocking PDB Configuration"
    }
    fn category(&self) -> Category {
        Category::Availability
    }
    fn severity(&self) -> Severity {
        Severity::Error
    }

    fn evaluate(&self, w: &WorkloadSpec) -> Result<Vec<Finding>, RuleError> {
        let Some(pdb) = w.pdb.as_ref().filter(|p| p.enabled) else {
            return Ok(vec![]);
        };
        let replicas = replicas_or_default(w);
        let mut findings = Vec::new();
        if let Some(max) = &pdb.max_unavailable {
            if self.max_unavailable_blocks(max, replicas) {
                findings.push(Finding::new(
                    format!(
                        "PDB maxUnavailable={max} allows fewer than {} disruption(s), which can block node drains",
                        self.min_evictions
                    ),
                    format!("maxUnavailable={max}"),
                    format!("maxUnavailable={}", self.min_evictions),
                ));
            }
        }
        if let Some(min) = &pdb.min_available {
            if self.min_available_blocks(min, replicas) {
                findings.push(Finding::new(
                    format!(
                        "PDB minAvailable={min} blocks evictions for {replicas} replica workload"
                    ),
                    format!("minAvailable={min}"),
                    format!("maxUnavailable={}", self.min_evictions),
                ));
            }
        }
        Ok(findings)
    }

    fn fix(&self, w: &WorkloadSpec, _options: &FixOptions) -> Option<Value> {
        let mut pdb = json!({
            "maxUnavailable": self.min_evictions,
            "unhealthyPodEvictionPolicy": "AlwaysAllow",
        });
        if w.pdb.as_ref().is_some_and(|p| p.min_available.is_some()) {
            pdb["minAvailable"] = Value::Null;
        }
        Some(json!({ "podDisruptionBudget": pdb }))
    }
}

pub struct MissingTopologySpread;

impl Rule for MissingTopologySpread {
    fn id(&self) -> &'static str {
        "AVL004"
    }
    fn name(&self) -> &'static str {
        "Missing Topology Spread"
    }
    fn category(&self) -> Category {
        Category::Availability
    }
    fn severity(&self) -> Severity {
        Severity::Info
    }

    fn evaluate(&self, w: &WorkloadSpec) -> Result<Vec<Finding>, RuleError> {
        if replicas_or_default(w) <= 1 || w.has_topology_spread {
            return Ok(vec![]);
        }
        Ok(vec![Finding::new(
            "No topologySpreadConstraints defined for a multi-replica workload, which may lead to uneven pod distribution",
            "none",
            "topologySpreadConstraints maxSkew=1 on kubernetes.io/hostname",
        )])
    }

    fn fix(&self, w: &WorkloadSpec, _options: &FixOptions) -> Option<Value> {
        Some(json!({
            "topologySpreadConstraints": [{
                "maxSkew": 1,
                "topologyKey": "kubernetes.io/hostname",
                "whenUnsatisfiable": "ScheduleAnyway",
                "labelSelector": app_selector(w),
            }]
        }))
    }
}

pub struct SingleReplica;

impl Rule for SingleReplica {
    fn id(&self) -> &'static str {
        "AVL005"
    }
    fn name(&self) -> &'static str {
        "Single Replica (No Redundancy)"
    }
    fn category(&self) -> Category {
        Category::Availability
    }
    fn severity(&self) -> Severity {
        Severity::Warning
    }

    fn evaluate(&self, w: &WorkloadSpec) -> Result<Vec<Finding>, RuleError> {
        if w.replicas != Some(1) {
            return Ok(vec![]);
        }
        Ok(vec![Finding::new(
            "Chart runs with a single replica, providing no redundancy during failures or deployments",
            "1",
            "2",
        )])
    }

    fn fix(&self, _w: &WorkloadSpec, _options: &FixOptions) -> Option<Value> {
        Some(json!({"replicaCount": 2}))
    }
}
