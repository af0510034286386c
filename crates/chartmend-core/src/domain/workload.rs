//! Typed container view that rules evaluate.
//!
//! A [`WorkloadSpec`] is built once per chart, either from the chart's
//! values mapping or from the documents produced by `helm template`, and is
//! then shared read-only by every rule.

use serde::{Deserialize, Serialize};
use serde_yaml::Value;

use super::quantity::{parse_cpu_millicores, parse_memory_mib, scalar_to_quantity};

/// Label used for the single workload derived from a values file.
pub const VALUES_WORKLOAD: &str = "values";

const WORKLOAD_KINDS: [&str; 6] = [
    "Deployment",
    "StatefulSet",
    "DaemonSet",
    "ReplicaSet",
    "Job",
    "CronJob",
];

/// Raw resource quantities for one container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSpec {
    pub cpu_request: Option<String>,
    pub cpu_limit: Option<String>,
    pub memory_request: Option<String>,
    pub memory_limit: Option<String>,
}

impl ResourceSpec {
    fn from_value(resources: Option<&Value>) -> Self {
        let pick = |section: &str, key: &str| {
            resources
                .and_then(|r| r.get(section))
                .and_then(|s| s.get(key))
                .and_then(scalar_to_quantity)
        };
        Self {
            cpu_request: pick("requests", "cpu"),
            cpu_limit: pick("limits", "cpu"),
            memory_request: pick("requests", "memory"),
            memory_limit: pick("limits", "memory"),
        }
    }

    pub fn cpu_request_millis(&self) -> Option<f64> {
        self.cpu_request.as_deref().and_then(parse_cpu_millicores)
    }

    pub fn cpu_limit_millis(&self) -> Option<f64> {
        self.cpu_limit.as_deref().and_then(parse_cpu_millicores)
    }

    pub fn memory_request_mib(&self) -> Option<f64> {
        self.memory_request.as_deref().and_then(parse_memory_mib)
    }

    pub fn memory_limit_mib(&self) -> Option<f64> {
        self.memory_limit.as_deref().and_then(parse_memory_mib)
    }
}

/// Which health probes a container declares.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeSet {
    pub liveness: bool,
    pub readiness: bool,
    pub startup: bool,
}

/// PDB field that may be an absolute count or a percentage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IntOrString {
    Int(i64),
    String(String),
}

impl IntOrString {
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n.as_i64().map(IntOrString::Int),
            Value::String(s) => Some(IntOrString::String(s.trim().to_string())),
            _ => None,
        }
    }

    /// Resolve against a replica count. Percentages round down.
    pub fn resolve(&self, replicas: i64) -> Option<i64> {
        match self {
            IntOrString::Int(v) => Some(*v),
            IntOrString::String(s) => match s.strip_suffix('%') {
                Some(pct) => pct.trim().parse::<i64>().ok().map(|p| replicas * p / 100),
                None => s.parse::<i64>().ok(),
            },
        }
    }

    pub fn percent(&self) -> Option<i64> {
        match self {
            IntOrString::String(s) => s.strip_suffix('%').and_then(|p| p.trim().parse().ok()),
            IntOrString::Int(_) => None,
        }
    }
}

impl std::fmt::Display for IntOrString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IntOrString::Int(v) => write!(f, "{v}"),
            IntOrString::String(s) => f.write_str(s),
        }
    }
}

/// PodDisruptionBudget settings attached to a workload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PdbSpec {
    pub enabled: bool,
    pub min_available: Option<IntOrString>,
    pub max_unavailable: Option<IntOrString>,
}

impl PdbSpec {
    fn from_values(value: &Value) -> Option<Self> {
        match value {
            Value::Null => None,
            Value::Bool(enabled) => Some(Self {
                enabled: *enabled,
                min_available: None,
                max_unavailable: None,
            }),
            Value::Mapping(_) => Some(Self {
                enabled: value.get("enabled").and_then(Value::as_bool).unwrap_or(true),
                min_available: value.get("minAvailable").and_then(IntOrString::from_value),
                max_unavailable: value
                    .get("maxUnavailable")
                    .and_then(IntOrString::from_value),
            }),
            _ => None,
        }
    }

    fn from_manifest(doc: &Value) -> Self {
        let spec = doc.get("spec");
        Self {
            enabled: true,
            min_available: spec
                .and_then(|s| s.get("minAvailable"))
                .and_then(IntOrString::from_value),
            max_unavailable: spec
                .and_then(|s| s.get("maxUnavailable"))
                .and_then(IntOrString::from_value),
        }
    }
}

/// Everything a rule needs to know about one container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkloadSpec {
    pub chart_name: String,
    /// `Kind/name:container` for rendered workloads, `values` otherwise.
    pub workload: String,
    pub replicas: Option<i64>,
    pub resources: ResourceSpec,
    pub probes: ProbeSet,
    pub pdb: Option<PdbSpec>,
    pub has_anti_affinity: bool,
    pub has_topology_spread: bool,
    pub run_as_user: Option<i64>,
    pub qos_class: Option<String>,
}

impl WorkloadSpec {
    /// An empty spec for the given chart, useful as a builder base.
    pub fn new(chart_name: impl Into<String>, workload: impl Into<String>) -> Self {
        Self {
            chart_name: chart_name.into(),
            workload: workload.into(),
            replicas: None,
            resources: ResourceSpec::default(),
            probes: ProbeSet::default(),
            pdb: None,
            has_anti_affinity: false,
            has_topology_spread: false,
            run_as_user: None,
            qos_class: None,
        }
    }

    /// Build the single workload view described by a chart's values mapping.
    pub fn from_values(chart_name: &str, values: &Value) -> Self {
        let mut spec = Self::new(chart_name, VALUES_WORKLOAD);
        spec.replicas = values
            .get("replicaCount")
            .or_else(|| values.get("replicas"))
            .and_then(Value::as_i64);
        spec.resources = ResourceSpec::from_value(values.get("resources"));
        let probes = values.get("probes");
        spec.probes = ProbeSet {
            liveness: probe_declared(values.get("livenessProbe"))
                || probe_declared(probes.and_then(|p| p.get("liveness"))),
            readiness: probe_declared(values.get("readinessProbe"))
                || probe_declared(probes.and_then(|p| p.get("readiness"))),
            startup: probe_declared(values.get("startupProbe"))
                || probe_declared(probes.and_then(|p| p.get("startup"))),
        };
        spec.pdb = values
            .get("podDisruptionBudget")
            .or_else(|| values.get("pdb"))
            .and_then(PdbSpec::from_values);
        spec.has_anti_affinity = has_anti_affinity(values.get("affinity"));
        spec.has_topology_spread = non_empty_seq(values.get("topologySpreadConstraints"));
        spec.run_as_user = values
            .get("securityContext")
            .and_then(|sc| sc.get("runAsUser"))
            .or_else(|| {
                values
                    .get("podSecurityContext")
                    .and_then(|sc| sc.get("runAsUser"))
            })
            .and_then(Value::as_i64);
        spec
    }

    /// Build one workload view per container of every rendered workload.
    ///
    /// Init containers are not evaluated. A rendered PodDisruptionBudget is
    /// attached to every workload whose pod labels its selector matches.
    pub fn from_rendered(chart_name: &str, docs: &[Value]) -> Vec<Self> {
        let pdbs: Vec<&Value> = docs
            .iter()
            .filter(|d| kind_of(d) == Some("PodDisruptionBudget"))
            .collect();

        let mut specs = Vec::new();
        for doc in docs {
            let Some(kind) = kind_of(doc) else { continue };
            if !WORKLOAD_KINDS.contains(&kind) {
                continue;
            }
            let name = doc
                .get("metadata")
                .and_then(|m| m.get("name"))
                .and_then(Value::as_str)
                .unwrap_or("unnamed");
            let template = pod_template(doc, kind);
            let Some(pod_spec) = template.and_then(|t| t.get("spec")) else {
                continue;
            };
            let pod_labels = template
                .and_then(|t| t.get("metadata"))
                .and_then(|m| m.get("labels"));
            let replicas = match kind {
                "Deployment" | "StatefulSet" | "ReplicaSet" => doc
                    .get("spec")
                    .and_then(|s| s.get("replicas"))
                    .and_then(Value::as_i64),
                _ => None,
            };
            let pdb = pdbs
                .iter()
                .find(|pdb| selector_matches(pdb, pod_labels))
                .map(|pdb| PdbSpec::from_manifest(pdb));
            let pod_run_as_user = pod_spec
                .get("securityContext")
                .and_then(|sc| sc.get("runAsUser"))
                .and_then(Value::as_i64);
            let has_anti = has_anti_affinity(pod_spec.get("affinity"));
            let has_spread = non_empty_seq(pod_spec.get("topologySpreadConstraints"));

            let containers = pod_spec
                .get("containers")
                .and_then(Value::as_sequence)
                .map(Vec::as_slice)
                .unwrap_or_default();
            for container in containers {
                let container_name = container
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or("container");
                let mut spec =
                    Self::new(chart_name, format!("{kind}/{name}:{container_name}"));
                spec.replicas = replicas;
                spec.resources = ResourceSpec::from_value(container.get("resources"));
                spec.probes = ProbeSet {
                    liveness: probe_declared(container.get("livenessProbe")),
                    readiness: probe_declared(container.get("readinessProbe")),
                    startup: probe_declared(container.get("startupProbe")),
                };
                spec.pdb = pdb.clone();
                spec.has_anti_affinity = has_anti;
                spec.has_topology_spread = has_spread;
                spec.run_as_user = container
                    .get("securityContext")
                    .and_then(|sc| sc.get("runAsUser"))
                    .and_then(Value::as_i64)
                    .or(pod_run_as_user);
                specs.push(spec);
            }
        }
        specs
    }

    /// Explicit QoS class if known, otherwise whether no quantity is set at all.
    pub fn is_best_effort(&self) -> bool {
        if let Some(qos) = &self.qos_class {
            return qos.eq_ignore_ascii_case("besteffort");
        }
        let r = &self.resources;
        let any_positive = [
            r.cpu_request_millis(),
            r.cpu_limit_millis(),
            r.memory_request_mib(),
            r.memory_limit_mib(),
        ]
        .into_iter()
        .flatten()
        .any(|v| v > 0.0);
        !any_positive
    }
}

fn kind_of(doc: &Value) -> Option<&str> {
    doc.get("kind").and_then(Value::as_str)
}

fn pod_template<'a>(doc: &'a Value, kind: &str) -> Option<&'a Value> {
    let spec = doc.get("spec")?;
    if kind == "CronJob" {
        spec.get("jobTemplate")?.get("spec")?.get("template")
    } else {
        spec.get("template")
    }
}

fn selector_matches(pdb: &Value, pod_labels: Option<&Value>) -> bool {
    let Some(match_labels) = pdb
        .get("spec")
        .and_then(|s| s.get("selector"))
        .and_then(|s| s.get("matchLabels"))
        .and_then(Value::as_mapping)
    else {
        return true;
    };
    let Some(labels) = pod_labels.and_then(Value::as_mapping) else {
        return match_labels.is_empty();
    };
    match_labels
        .iter()
        .all(|(key, value)| labels.get(key) == Some(value))
}

fn probe_declared(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(Value::Mapping(m)) => {
            !m.is_empty()
                && m.get("enabled").and_then(Value::as_bool) != Some(false)
        }
        Some(_) => true,
    }
}

fn has_anti_affinity(affinity: Option<&Value>) -> bool {
    let Some(anti) = affinity.and_then(|a| a.get("podAntiAffinity")) else {
        return false;
    };
    non_empty_seq(anti.get("preferredDuringSchedulingIgnoredDuringExecution"))
        || non_empty_seq(anti.get("requiredDuringSchedulingIgnoredDuringExecution"))
}

fn non_empty_seq(value: Option<&Value>) -> bool {
    value
        .and_then(Value::as_sequence)
        .is_some_and(|seq| !seq.is_empty())
}
