//! Security rules.

use serde_json::{json, Value};

use super::fix::FixOptions;
use super::{Finding, Rule};
use crate::domain::{Category, RuleError, Severity, WorkloadSpec};

pub struct RunningAsRoot;

impl Rule for RunningAsRoot {
    fn id(&self) -> &'static str {
        "SEC001"
    }
    fn name(&self) -> &'static str {
        "Running As Root"
    }
    fn category(&self) -> Category {
        Category::Security
    }
    fn severity(&self) -> Severity {
        Severity::Error
    }

    fn evaluate(&self, w: &WorkloadSpec) -> Result<Vec<Finding>, RuleError> {
        if w.run_as_user != Some(0) {
            return Ok(vec![]);
        }
        Ok(vec![Finding::new(
            "Container runs as root (runAsUser=0), which is a security risk",
            "runAsUser=0",
            "runAsNonRoot=true, runAsUser=1000",
        )])
    }

    fn fix(&self, _w: &WorkloadSpec, _options: &FixOptions) -> Option<Value> {
        Some(json!({
            "securityContext": {
                "runAsNonRoot": true,
                "runAsUser": 1000,
            }
        }))
    }
}
