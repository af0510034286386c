//! Resource request/limit rules (RES001-RES008).

use serde_json::{json, Value};

use super::fix::{FixOptions, RatioTarget};
use super::{Finding, ResourceField, Rule, RuleThresholds};
use crate::domain::quantity::{
    double_cpu, double_memory, format_cpu, format_memory, parse_cpu_millicores, parse_memory_mib,
};
use crate::domain::{Category, RuleError, Severity, WorkloadSpec};

/// Parse an optional quantity, turning a present-but-garbage value into an error.
fn parsed(
    rule_id: &str,
    field: &str,
    raw: Option<&str>,
    parse: fn(&str) -> Option<f64>,
) -> Result<Option<f64>, RuleError> {
    match raw {
        None => Ok(None),
        Some(s) => parse(s).map(Some).ok_or_else(|| RuleError::BadQuantity {
            rule_id: rule_id.to_string(),
            field: field.to_string(),
            value: s.to_string(),
        }),
    }
}

// ---------------------------------------------------------------------------
// RES001
// ---------------------------------------------------------------------------

pub struct NoResourceRequests {
    thresholds: RuleThresholds,
}

impl NoResourceRequests {
    pub fn new(thresholds: RuleThresholds) -> Self {
        Self { thresholds }
    }
}

impl Rule for NoResourceRequests {
    fn id(&self) -> &'static str {
        "RES001"
    }
    fn name(&self) -> &'static str {
        "No Resource Requests"
    }
    fn category(&self) -> Category {
        Category::Resources
    }
    fn severity(&self) -> Severity {
        Severity::Error
    }

    fn evaluate(&self, w: &WorkloadSpec) -> Result<Vec<Finding>, RuleError> {
        if self.thresholds.is_fixed(ResourceField::CpuRequest)
            && self.thresholds.is_fixed(ResourceField::MemoryRequest)
        {
            return Ok(vec![]);
        }
        if w.resources.cpu_request.is_some() || w.resources.memory_request.is_some() {
            return Ok(vec![]);
        }
        let finding = if w.is_best_effort() {
            Finding::new(
                "BestEffort workload has no resource requests, which increases eviction risk under node pressure",
                "none",
                "requests: cpu=100m, memory=128Mi",
            )
            .with_severity(Severity::Warning)
        } else {
            Finding::new(
                "Container has no resource requests, which prevents effective scheduling",
                "none",
                "requests: cpu=100m, memory=128Mi",
            )
        };
        Ok(vec![finding])
    }

    fn fix(&self, _w: &WorkloadSpec, _options: &FixOptions) -> Option<Value> {
        Some(json!({
            "resources": {
                "requests": {"cpu": "100m", "memory": "128Mi"},
                "limits": {"cpu": "500m", "memory": "512Mi"},
            }
        }))
    }
}

// ---------------------------------------------------------------------------
// RES002 / RES003: limit/request ratio
// ---------------------------------------------------------------------------

/// Shared shape of the CPU and memory ratio rules.
struct RatioRule {
    id: &'static str,
    name: &'static str,
    label: &'static str,
    request_field: ResourceField,
    limit_field: ResourceField,
    target: RatioTarget,
    parse: fn(&str) -> Option<f64>,
    format: fn(f64) -> String,
}

impl RatioRule {
    /// The field a fix for this rule rewrites.
    fn moved_field(&self, target: RatioTarget) -> ResourceField {
        match target {
            RatioTarget::Request => self.request_field,
            RatioTarget::Limit => self.limit_field,
        }
    }

    fn quantities<'a>(&self, w: &'a WorkloadSpec) -> (Option<&'a str>, Option<&'a str>) {
        let r = &w.resources;
        match self.request_field {
            ResourceField::CpuRequest => (r.cpu_request.as_deref(), r.cpu_limit.as_deref()),
            _ => (r.memory_request.as_deref(), r.memory_limit.as_deref()),
        }
    }

    fn evaluate(&self, t: &RuleThresholds, w: &WorkloadSpec) -> Result<Vec<Finding>, RuleError> {
        if t.is_fixed(self.moved_field(self.target)) {
            return Ok(vec![]);
        }
        if w.is_best_effort() {
            return Ok(vec![]);
        }
        let (raw_request, raw_limit) = self.quantities(w);
        let (section, key) = self.request_field.path();
        let request = parsed(self.id, &format!("{section}.{key}"), raw_request, self.parse)?;
        let (section, key) = self.limit_field.path();
        let limit = parsed(self.id, &format!("{section}.{key}"), raw_limit, self.parse)?;

        let (Some(request), Some(limit)) = (request, limit) else {
            return Ok(vec![]);
        };
        if request <= 0.0 || limit <= 0.0 {
            return Ok(vec![]);
        }
        let ratio = limit / request;
        if ratio <= t.limit_request_ratio {
            return Ok(vec![]);
        }
        Ok(vec![Finding::new(
            format!(
                "{} limit ({}) is {:.1}x the request ({}), above the {:.1}x threshold",
                self.label,
                raw_limit.unwrap_or_default(),
                ratio,
                raw_request.unwrap_or_default(),
                t.limit_request_ratio
            ),
            format!("{ratio:.1}"),
            format!("<= {:.1}", t.limit_request_ratio),
        )])
    }

    fn fix(&self, t: &RuleThresholds, w: &WorkloadSpec, options: &FixOptions) -> Option<Value> {
        let (raw_request, raw_limit) = self.quantities(w);
        let request = raw_request.and_then(self.parse).filter(|v| *v > 0.0)?;
        let limit = raw_limit.and_then(self.parse).filter(|v| *v > 0.0)?;
        let multiplier = options.ratio_strategy.multiplier(t.burstable_target_ratio);
        let value = match options.ratio_target {
            RatioTarget::Request => (self.format)(limit / multiplier),
            RatioTarget::Limit => (self.format)(request * multiplier),
        };
        let (section, key) = self.moved_field(options.ratio_target).path();
        Some(json!({ "resources": { section: { key: value } } }))
    }
}

pub struct CpuLimitRequestRatio {
    thresholds: RuleThresholds,
    inner: RatioRule,
}

impl CpuLimitRequestRatio {
    pub fn new(thresholds: RuleThresholds, target: RatioTarget) -> Self {
        Self {
            thresholds,
            inner: RatioRule {
                id: "RES002",
                name: "High CPU Limit/Request Ratio",
                label: "CPU",
                request_field: ResourceField::CpuRequest,
                limit_field: ResourceField::CpuLimit,
                target,
                parse: parse_cpu_millicores,
                format: format_cpu,
            },
        }
    }
}

impl Rule for CpuLimitRequestRatio {
    fn id(&self) -> &'static str {
        self.inner.id
    }
    fn name(&self) -> &'static str {
        self.inner.name
    }
    fn category(&self) -> Category {
        Category::Resources
    }
    fn severity(&self) -> Severity {
        Severity::Warning
    }
    fn evaluate(&self, w: &WorkloadSpec) -> Result<Vec<Finding>, RuleError> {
        self.inner.evaluate(&self.thresholds, w)
    }
    fn fix(&self, w: &WorkloadSpec, options: &FixOptions) -> Option<Value> {
        self.inner.fix(&self.thresholds, w, options)
    }
}

pub struct MemoryLimitRequestRatio {
    thresholds: RuleThresholds,
    inner: RatioRule,
}

impl MemoryLimitRequestRatio {
    pub fn new(thresholds: RuleThresholds, target: RatioTarget) -> Self {
        Self {
            thresholds,
            inner: RatioRule {
                id: "RES003",
                name: "High Memory Limit/Request Ratio",
                label: "Memory",
                request_field: ResourceField::MemoryRequest,
                limit_field: ResourceField::MemoryLimit,
                target,
                parse: parse_memory_mib,
                format: format_memory,
            },
        }
    }
}

impl Rule for MemoryLimitRequestRatio {
    fn id(&self) -> &'static str {
        self.inner.id
    }
    fn name(&self) -> &'static str {
        self.inner.name
    }
    fn category(&self) -> Category {
        Category::Resources
    }
    fn severity(&self) -> Severity {
        Severity::Warning
    }
    fn evaluate(&self, w: &WorkloadSpec) -> Result<Vec<Finding>, RuleError> {
        self.inner.evaluate(&self.thresholds, w)
    }
    fn fix(&self, w: &WorkloadSpec, options: &FixOptions) -> Option<Value> {
        self.inner.fix(&self.thresholds, w, options)
    }
}

// ---------------------------------------------------------------------------
// RES004 / RES005: missing limits
// ---------------------------------------------------------------------------

pub struct NoCpuLimit {
    thresholds: RuleThresholds,
}

impl NoCpuLimit {
    pub fn new(thresholds: RuleThresholds) -> Self {
        Self { thresholds }
    }
}

impl Rule for NoCpuLimit {
    fn id(&self) -> &'static str {
        "RES004"
    }
    fn name(&self) -> &'static str {
        "No CPU Limits"
    }
    fn category(&self) -> Category {
        Category::Resources
    }
    fn severity(&self) -> Severity {
        Severity::Warning
    }

    fn evaluate(&self, w: &WorkloadSpec) -> Result<Vec<Finding>, RuleError> {
        if self.thresholds.is_fixed(ResourceField::CpuLimit) || w.resources.cpu_limit.is_some() {
            return Ok(vec![]);
        }
        let recommended = double_cpu(w.resources.cpu_request.as_deref().unwrap_or("100m"));
        Ok(vec![Finding::new(
            "Container has no CPU limits defined, which can lead to resource starvation",
            "none",
            recommended,
        )])
    }

    fn fix(&self, w: &WorkloadSpec, _options: &FixOptions) -> Option<Value> {
        let limit = double_cpu(w.resources.cpu_request.as_deref().unwrap_or("100m"));
        Some(json!({"resources": {"limits": {"cpu": limit}}}))
    }
}

pub struct NoMemoryLimit {
    thresholds: RuleThresholds,
}

impl NoMemoryLimit {
    pub fn new(thresholds: RuleThresholds) -> Self {
        Self { thresholds }
    }
}

impl Rule for NoMemoryLimit {
    fn id(&self) -> &'static str {
        "RES005"
    }
    fn name(&self) -> &'static str {
        "No Memory Limits"
    }
    fn category(&self) -> Category {
        Category::Resources
    }
    fn severity(&self) -> Severity {
        Severity::Warning
    }

    fn evaluate(&self, w: &WorkloadSpec) -> Result<Vec<Finding>, RuleError> {
        if self.thresholds.is_fixed(ResourceField::MemoryLimit)
            || w.resources.memory_limit.is_some()
        {
            return Ok(vec![]);
        }
        let recommended = double_memory(w.resources.memory_request.as_deref().unwrap_or("128Mi"));
        Ok(vec![Finding::new(
            "Container has no memory limits defined, which can lead to OOM kills",
            "none",
            recommended,
        )])
    }

    fn fix(&self, w: &WorkloadSpec, _options: &FixOptions) -> Option<Value> {
        let limit = double_memory(w.resources.memory_request.as_deref().unwrap_or("128Mi"));
        Some(json!({"resources": {"limits": {"memory": limit}}}))
    }
}

// ---------------------------------------------------------------------------
// RES006 / RES008: very low requests
// ---------------------------------------------------------------------------

pub struct LowCpuRequest {
    thresholds: RuleThresholds,
}

impl LowCpuRequest {
    pub fn new(thresholds: RuleThresholds) -> Self {
        Self { thresholds }
    }
}

impl Rule for LowCpuRequest {
    fn id(&self) -> &'static str {
        "RES006"
    }
    fn name(&self) -> &'static str {
        "Very Low CPU Request"
    }
    fn category(&self) -> Category {
        Category::Resources
    }
    fn severity(&self) -> Severity {
        Severity::Warning
    }

    /// Fires only when the limit is low or absent; otherwise RES002 owns it.
    fn evaluate(&self, w: &WorkloadSpec) -> Result<Vec<Finding>, RuleError> {
        let t = &self.thresholds;
        let request = parsed(
            self.id(),
            "requests.cpu",
            w.resources.cpu_request.as_deref(),
            parse_cpu_millicores,
        )?;
        let Some(request) = request.filter(|r| *r > 0.0 && *r < t.low_cpu_millicores) else {
            return Ok(vec![]);
        };
        let limit = w.resources.cpu_limit_millis();
        if limit.is_some_and(|l| l >= t.cpu_bump_min_millicores) {
            return Ok(vec![]);
        }
        Ok(vec![Finding::new(
            format!(
                "CPU request ({}) is below {}, which may cause CPU throttling",
                format_cpu(request),
                format_cpu(t.low_cpu_millicores)
            ),
            format_cpu(request),
            format_cpu(t.cpu_bump_min_millicores),
        )])
    }

    fn fix(&self, _w: &WorkloadSpec, _options: &FixOptions) -> Option<Value> {
        let bump = format_cpu(self.thresholds.cpu_bump_min_millicores);
        Some(json!({"resources": {"requests": {"cpu": bump}}}))
    }
}

pub struct LowMemoryRequest {
    thresholds: RuleThresholds,
}

impl LowMemoryRequest {
    pub fn new(thresholds: RuleThresholds) -> Self {
        Self { thresholds }
    }
}

impl Rule for LowMemoryRequest {
    fn id(&self) -> &'static str {
        "RES008"
    }
    fn name(&self) -> &'static str {
        "Very Low Memory Request"
    }
    fn category(&self) -> Category {
        Category::Resources
    }
    fn severity(&self) -> Severity {
        Severity::Warning
    }

    fn evaluate(&self, w: &WorkloadSpec) -> Result<Vec<Finding>, RuleError> {
        let t = &self.thresholds;
        let request = parsed(
            self.id(),
            "requests.memory",
            w.resources.memory_request.as_deref(),
            parse_memory_mib,
        )?;
        let Some(request) = request.filter(|r| *r > 0.0 && *r < t.low_memory_mib) else {
            return Ok(vec![]);
        };
        let limit = w.resources.memory_limit_mib();
        if limit.is_some_and(|l| l >= t.memory_bump_min_mib) {
            return Ok(vec![]);
        }
        Ok(vec![Finding::new(
            format!(
                "Memory request ({}) is below {}, which may cause OOM kills",
                format_memory(request),
                format_memory(t.low_memory_mib)
            ),
            format_memory(request),
            format_memory(t.memory_bump_min_mib),
        )])
    }

    fn fix(&self, _w: &WorkloadSpec, _options: &FixOptions) -> Option<Value> {
        let bump = format_memory(self.thresholds.memory_bump_min_mib);
        Some(json!({"resources": {"requests": {"memory": bump}}}))
    }
}

// ---------------------------------------------------------------------------
// RES007
// ---------------------------------------------------------------------------

pub struct NoMemoryRequest {
    thresholds: RuleThresholds,
}

impl NoMemoryRequest {
    pub fn new(thresholds: RuleThresholds) -> Self {
        Self { thresholds }
    }
}

impl Rule for NoMemoryRequest {
    fn id(&self) -> &'static str {
        "RES007"
    }
    fn name(&self) -> &'static str {
        "No Memory Request"
    }
    fn category(&self) -> Category {
        Category::Resources
    }
    fn severity(&self) -> Severity {
        Severity::Warning
    }

    fn evaluate(&self, w: &WorkloadSpec) -> Result<Vec<Finding>, RuleError> {
        if self.thresholds.is_fixed(ResourceField::MemoryRequest) {
            return Ok(vec![]);
        }
        // RES001 covers the case where both requests are missing.
        if w.resources.cpu_request.is_none() || w.resources.memory_request.is_some() {
            return Ok(vec![]);
        }
        Ok(vec![Finding::new(
            "Container does not have a memory request defined",
            "none",
            "128Mi",
        )])
    }

    fn fix(&self, _w: &WorkloadSpec, _options: &FixOptions) -> Option<Value> {
        Some(json!({"resources": {"requests": {"memory": "128Mi"}}}))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::VALUES_WORKLOAD;
    use crate::rules::fix::RatioStrategy;

    fn workload(cpu_req: Option<&str>, cpu_lim: Option<&str>) -> WorkloadSpec {
        let mut w = WorkloadSpec::new("api", VALUES_WORKLOAD);
        w.resources.cpu_request = cpu_req.map(String::from);
        w.resources.cpu_limit = cpu_lim.map(String::from);
        w.resources.memory_request = Some("128Mi".into());
        w.resources.memory_limit = Some("256Mi".into());
        w
    }

    fn unprotected() -> RuleThresholds {
        RuleThresholds {
            fixed_resource_fields: Default::default(),
            ..RuleThresholds::default()
        }
    }

    #[test]
    fn test_cpu_ratio_fires_above_threshold() {
        let rule = CpuLimitRequestRatio::new(RuleThresholds::default(), RatioTarget::Request);
        let findings = rule
            .evaluate(&workload(Some("100m"), Some("800m")))
            .expect("evaluate");
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].current_value, "8.0");
        assert!(findings[0].description.contains("8.0x"));
    }

    #[test]
    fn test_cpu_ratio_at_threshold_passes() {
        let rule = CpuLimitRequestRatio::new(RuleThresholds::default(), RatioTarget::Request);
        let findings = rule
            .evaluate(&workload(Some("100m"), Some("200m")))
            .expect("evaluate");
        assert!(findings.is_empty());
    }

    #[test]
    fn test_cpu_ratio_bad_quantity_is_error() {
        let rule = CpuLimitRequestRatio::new(RuleThresholds::default(), RatioTarget::Request);
        let err = rule
            .evaluate(&workload(Some("a-lot"), Some("800m")))
            .unwrap_err();
        assert!(matches!(err, RuleError::BadQuantity { .. }));
    }

    #[test]
    fn test_cpu_ratio_fix_raises_request_by_default() {
        let rule = CpuLimitRequestRatio::new(RuleThresholds::default(), RatioTarget::Request);
        let fix = rule
            .fix(&workload(Some("100m"), Some("900m")), &FixOptions::default())
            .expect("fix");
        assert_eq!(fix, json!({"resources": {"requests": {"cpu": "600m"}}}));
    }

    #[test]
    fn test_cpu_ratio_fix_can_lower_limit() {
        let rule = CpuLimitRequestRatio::new(RuleThresholds::default(), RatioTarget::Request);
        let options = FixOptions {
            ratio_target: RatioTarget::Limit,
            ratio_strategy: RatioStrategy::Burstable20,
            ..FixOptions::default()
        };
        let fix = rule
            .fix(&workload(Some("100m"), Some("800m")), &options)
            .expect("fix");
        assert_eq!(fix, json!({"resources": {"limits": {"cpu": "200m"}}}));
    }

    #[test]
    fn test_memory_ratio() {
        let rule = MemoryLimitRequestRatio::new(RuleThresholds::default(), RatioTarget::Request);
        let mut w = workload(Some("100m"), Some("100m"));
        w.resources.memory_limit = Some("1Gi".into());
        let findings = rule.evaluate(&w).expect("evaluate");
        assert_eq!(findings[0].current_value, "8.0");
    }

    #[test]
    fn test_no_requests_best_effort_downgrades_severity() {
        let rule = NoResourceRequests::new(RuleThresholds::default());
        let w = WorkloadSpec::new("api", VALUES_WORKLOAD);
        let findings = rule.evaluate(&w).expect("evaluate");
        assert_eq!(findings[0].severity, Some(Severity::Warning));

        let mut limited = WorkloadSpec::new("api", VALUES_WORKLOAD);
        limited.resources.cpu_limit = Some("1".into());
        let findings = rule.evaluate(&limited).expect("evaluate");
        assert_eq!(findings[0].severity, None);
    }

    #[test]
    fn test_missing_limits_skipped_when_protected() {
        let w = workload(Some("100m"), None);
        assert!(NoCpuLimit::new(RuleThresholds::default())
            .evaluate(&w)
            .expect("evaluate")
            .is_empty());
        let findings = NoCpuLimit::new(unprotected()).evaluate(&w).expect("evaluate");
        assert_eq!(findings[0].recommended_value, "200m");
    }

    fn fixing(fields: &[ResourceField]) -> RuleThresholds {
        RuleThresholds {
            fixed_resource_fields: fields.iter().copied().collect(),
            ..RuleThresholds::default()
        }
    }

    #[test]
    fn test_cpu_ratio_skipped_when_request_fixed() {
        let w = workload(Some("100m"), Some("800m"));
        let fixed = fixing(&[ResourceField::CpuRequest]);
        let rule = CpuLimitRequestRatio::new(fixed.clone(), RatioTarget::Request);
        assert!(rule.evaluate(&w).expect("evaluate").is_empty());

        // the limit is still free to move
        let rule = CpuLimitRequestRatio::new(fixed, RatioTarget::Limit);
        assert_eq!(rule.evaluate(&w).expect("evaluate").len(), 1);
    }

    #[test]
    fn test_memory_ratio_follows_ratio_target() {
        let mut w = workload(None, None);
        w.resources.memory_limit = Some("1Gi".into());
        // default thresholds protect the limit only
        let by_request =
            MemoryLimitRequestRatio::new(RuleThresholds::default(), RatioTarget::Request);
        assert_eq!(by_request.evaluate(&w).expect("evaluate").len(), 1);
        let by_limit = MemoryLimitRequestRatio::new(RuleThresholds::default(), RatioTarget::Limit);
        assert!(by_limit.evaluate(&w).expect("evaluate").is_empty());
    }

    #[test]
    fn test_missing_memory_limit_skipped_when_protected() {
        let mut w = workload(Some("100m"), Some("200m"));
        w.resources.memory_limit = None;
        assert!(NoMemoryLimit::new(fixing(&[ResourceField::MemoryLimit]))
            .evaluate(&w)
            .expect("evaluate")
            .is_empty());
        let findings = NoMemoryLimit::new(unprotected()).evaluate(&w).expect("evaluate");
        assert_eq!(findings[0].recommended_value, "256Mi");
    }

    #[test]
    fn test_missing_cpu_limit_fires_when_only_memory_protected() {
        let w = workload(Some("100m"), None);
        let findings = NoCpuLimit::new(fixing(&[ResourceField::MemoryLimit]))
            .evaluate(&w)
            .expect("evaluate");
        assert_eq!(findings.len(), 1);
    }

    #[test]
    fn test_no_memory_request_skipped_when_protected() {
        let mut w = workload(Some("100m"), None);
        w.resources.memory_request = None;
        assert!(NoMemoryRequest::new(fixing(&[ResourceField::MemoryRequest]))
            .evaluate(&w)
            .expect("evaluate")
            .is_empty());
        assert_eq!(
            NoMemoryRequest::new(unprotected()).evaluate(&w).expect("evaluate").len(),
            1
        );
    }

    #[test]
    fn test_low_cpu_request_defers_to_ratio_rule() {
        let rule = LowCpuRequest::new(RuleThresholds::default());
        assert_eq!(
            rule.evaluate(&workload(Some("5m"), None)).expect("evaluate").len(),
            1
        );
        assert!(rule
            .evaluate(&workload(Some("5m"), Some("500m")))
            .expect("evaluate")
            .is_empty());
    }

    #[test]
    fn test_low_memory_request() {
        let rule = LowMemoryRequest::new(RuleThresholds::default());
        let mut w = workload(None, None);
        w.resources.memory_request = Some("16Mi".into());
        w.resources.memory_limit = Some("64Mi".into());
        let findings = rule.evaluate(&w).expect("evaluate");
        assert_eq!(findings[0].current_value, "16Mi");
        assert_eq!(findings[0].recommended_value, "128Mi");
    }

    #[test]
    fn test_no_memory_request_requires_cpu_request() {
        let rule = NoMemoryRequest::new(RuleThresholds::default());
        let mut w = workload(Some("100m"), None);
        w.resources.memory_request = None;
        assert_eq!(rule.evaluate(&w).expect("evaluate").len(), 1);
        w.resources.cpu_request = None;
        assert!(rule.evaluate(&w).expect("evaluate").is_empty());
    }
}
