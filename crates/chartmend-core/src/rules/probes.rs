//! Health probe rules (PRB001-PRB003).

use serde_json::{json, Value};

use super::fix::{build_http_probe, FixOptions, ProbeDefaults};
use super::{Finding, Rule};
use crate::domain::{Category, RuleError, Severity, WorkloadSpec};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProbeKind {
    Liveness,
    Readiness,
    Startup,
}

/// Fires when a container declares no probe of the given kind.
pub struct MissingProbe {
    kind: ProbeKind,
}

impl MissingProbe {
    pub fn liveness() -> Self {
        Self {
            kind: ProbeKind::Liveness,
        }
    }

    pub fn readiness() -> Self {
        Self {
            kind: ProbeKind::Readiness,
        }
    }

    pub fn startup() -> Self {
        Self {
            kind: ProbeKind::Startup,
        }
    }

    fn values_key(&self) -> &'static str {
        match self.kind {
            ProbeKind::Liveness => "livenessProbe",
            ProbeKind::Readiness => "readinessProbe",
            ProbeKind::Startup => "startupProbe",
        }
    }

    fn label(&self) -> &'static str {
        match self.kind {
            ProbeKind::Liveness => "liveness",
            ProbeKind::Readiness => "readiness",
            ProbeKind::Startup => "startup",
        }
    }

    fn defaults(&self) -> ProbeDefaults {
        match self.kind {
            ProbeKind::Liveness => ProbeDefaults {
                path: "/health",
                initial_delay: 15,
                timeout: 3,
                period: 10,
                failure_threshold: 3,
            },
            ProbeKind::Readiness => ProbeDefaults {
                path: "/ready",
                initial_delay: 5,
                timeout: 3,
                period: 5,
                failure_threshold: 3,
            },
            ProbeKind::Startup => ProbeDefaults {
                path: "/health",
                initial_delay: 5,
                timeout: 3,
                period: 5,
                failure_threshold: 30,
            },
        }
    }
}

impl Rule for MissingProbe {
    fn id(&self) -> &'static str {
        match self.kind {
            ProbeKind::Liveness => "PRB001",
            ProbeKind::Readiness => "PRB002",
            ProbeKind::Startup => "PRB003",
        }
    }

    fn name(&self) -> &'static str {
        match self.kind {
            ProbeKind::Liveness => "Missing Liveness Probe",
            ProbeKind::Readiness => "Missing Readiness Probe",
            ProbeKind::Startup => "Missing Startup Probe",
        }
    }

    fn category(&self) -> Category {
        Category::Probes
    }

    fn severity(&self) -> Severity {
        match self.kind {
            ProbeKind::Startup => Severity::Info,
            _ => Severity::Warning,
        }
    }

    fn evaluate(&self, w: &WorkloadSpec) -> Result<Vec<Finding>, RuleError> {
        let present = match self.kind {
            ProbeKind::Liveness => w.probes.liveness,
            ProbeKind::Readiness => w.probes.readiness,
            ProbeKind::Startup => w.probes.startup,
        };
        if present {
            return Ok(vec![]);
        }
        Ok(vec![Finding::new(
            format!("Container does not have a {} probe defined", self.label()),
            "none",
            format!("{} with httpGet {}", self.values_key(), self.defaults().path),
        )])
    }

    fn fix(&self, _w: &WorkloadSpec, options: &FixOptions) -> Option<Value> {
        let probe = build_http_probe(&self.defaults(), &options.probe);
        Some(json!({ self.values_key(): probe }))
    }
}
