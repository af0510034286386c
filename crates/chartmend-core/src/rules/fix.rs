//! Options and helpers for deterministic fix generation.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeSet;

use super::ResourceField;

/// Rules whose request bumps are applied even when the field is protected.
const STRIP_EXEMPT_RULES: [&str; 2] = ["RES006", "RES008"];

/// Target limit/request ratio for ratio fixes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RatioStrategy {
    /// Ratio equal to the configured burstable target (1.5 by default).
    #[default]
    #[serde(rename = "burstable_1_5")]
    Burstable15,
    #[serde(rename = "burstable_2_0")]
    Burstable20,
    /// request == limit.
    #[serde(rename = "guaranteed")]
    Guaranteed,
}

impl RatioStrategy {
    pub fn multiplier(self, burstable_target: f64) -> f64 {
        match self {
            RatioStrategy::Burstable15 => burstable_target,
            RatioStrategy::Burstable20 => 2.0,
            RatioStrategy::Guaranteed => 1.0,
        }
    }
}

/// Which side of the ratio a ratio fix moves.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RatioTarget {
    /// Raise the request; the limit is assumed intentional.
    #[default]
    Request,
    /// Lower the limit.
    Limit,
}

/// Probe port as a number or a named container port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ProbePort {
    Number(u16),
    Name(String),
}

/// Per-violation overrides for inserted HTTP probes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeSettings {
    pub path: Option<String>,
    pub port: Option<ProbePort>,
    /// `HTTP` or `HTTPS`; anything else is ignored.
    pub scheme: Option<String>,
    pub host: Option<String>,
    /// `Name: value`
    pub header: Option<String>,
    pub initial_delay_seconds: Option<u32>,
    pub timeout_seconds: Option<u32>,
    pub period_seconds: Option<u32>,
    pub success_threshold: Option<u32>,
    pub failure_threshold: Option<u32>,
    pub termination_grace_period_seconds: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FixOptions {
    pub ratio_strategy: RatioStrategy,
    pub ratio_target: RatioTarget,
    pub probe: ProbeSettings,
}

/// Built-in probe shape before overrides.
pub(crate) struct ProbeDefaults {
    pub path: &'static str,
    pub initial_delay: u32,
    pub timeout: u32,
    pub period: u32,
    pub failure_threshold: u32,
}

pub(crate) fn build_http_probe(defaults: &ProbeDefaults, settings: &ProbeSettings) -> Value {
    let mut http_get = Map::new();
    http_get.insert("path".into(), json!(defaults.path));
    http_get.insert("port".into(), json!("http"));

    if let Some(path) = settings.path.as_deref().map(str::trim).filter(|p| !p.is_empty()) {
        http_get.insert("path".into(), json!(path));
    }
    match &settings.port {
        Some(ProbePort::Number(n)) => {
            http_get.insert("port".into(), json!(n));
        }
        Some(ProbePort::Name(name)) if !name.trim().is_empty() => {
            http_get.insert("port".into(), json!(name.trim()));
        }
        _ => {}
    }
    if let Some(scheme) = settings.scheme.as_deref().map(|s| s.trim().to_ascii_uppercase()) {
        if scheme == "HTTP" || scheme == "HTTPS" {
            http_get.insert("scheme".into(), json!(scheme));
        }
    }
    if let Some(host) = settings.host.as_deref().map(str::trim).filter(|h| !h.is_empty()) {
        http_get.insert("host".into(), json!(host));
    }
    if let Some((name, value)) = settings.header.as_deref().and_then(|h| h.split_once(':')) {
        let (name, value) = (name.trim(), value.trim());
        if !name.is_empty() && !value.is_empty() {
            http_get.insert(
                "httpHeaders".into(),
                json!([{ "name": name, "value": value }]),
            );
        }
    }

    let mut probe = Map::new();
    probe.insert("httpGet".into(), Value::Object(http_get));
    probe.insert("initialDelaySeconds".into(), json!(defaults.initial_delay));
    probe.insert("timeoutSeconds".into(), json!(defaults.timeout));
    probe.insert("periodSeconds".into(), json!(defaults.period));
    probe.insert("failureThreshold".into(), json!(defaults.failure_threshold));

    let overrides = [
        ("initialDelaySeconds", settings.initial_delay_seconds),
        ("timeoutSeconds", settings.timeout_seconds),
        ("periodSeconds", settings.period_seconds),
        ("successThreshold", settings.success_threshold),
        ("failureThreshold", settings.failure_threshold),
        (
            "terminationGracePeriodSeconds",
            settings.termination_grace_period_seconds,
        ),
    ];
    for (key, value) in overrides {
        if let Some(v) = value.filter(|v| *v > 0) {
            probe.insert(key.into(), json!(v));
        }
    }
    Value::Object(probe)
}

/// Remove protected resource keys from a fix overlay.
///
/// Returns `None` when nothing is left to apply.
pub fn strip_fixed_fields(
    mut fix: Value,
    fixed: &BTreeSet<ResourceField>,
    rule_id: &str,
) -> Option<Value> {
    if fixed.is_empty() || STRIP_EXEMPT_RULES.contains(&rule_id) {
        return Some(fix);
    }
    let Some(root) = fix.as_object_mut() else {
        return Some(fix);
    };
    let Some(resources) = root.get_mut("resources").and_then(Value::as_object_mut) else {
        return Some(fix);
    };

    for field in fixed {
        let (section, key) = field.path();
        let now_empty = match resources.get_mut(section).and_then(Value::as_object_mut) {
            Some(sub) => {
                sub.remove(key);
                sub.is_empty()
            }
            None => false,
        };
        if now_empty {
            resources.remove(section);
        }
    }

    if resources.is_empty() {
        root.remove("resources");
    }
    if root.is_empty() {
        None
    } else {
        Some(fix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed(fields: &[ResourceField]) -> BTreeSet<ResourceField> {
        fields.iter().copied().collect()
    }

    #[test]
    fn test_strip_removes_protected_limit() {
        let fix = json!({"resources": {"requests": {"cpu": "100m"}, "limits": {"cpu": "500m"}}});
        let out = strip_fixed_fields(fix, &fixed(&[ResourceField::CpuLimit]), "RES001")
            .expect("requests remain");
        assert_eq!(out, json!({"resources": {"requests": {"cpu": "100m"}}}));
    }

    #[test]
    fn test_strip_to_nothing_returns_none() {
        let fix = json!({"resources": {"limits": {"memory": "512Mi"}}});
        assert!(strip_fixed_fields(fix, &fixed(&[ResourceField::MemoryLimit]), "RES005").is_none());
    }

    #[test]
    fn test_strip_exempt_rule_untouched() {
        let fix = json!({"resources": {"requests": {"cpu": "100m"}}});
        let out = strip_fixed_fields(fix.clone(), &fixed(&[ResourceField::CpuRequest]), "RES006");
        assert_eq!(out, Some(fix));
    }

    #[test]
    fn test_strip_keeps_non_resource_keys() {
        let fix = json!({"resources": {"limits": {"cpu": "1"}}, "replicaCount": 2});
        let out = strip_fixed_fields(fix, &fixed(&[ResourceField::CpuLimit]), "RES004");
        assert_eq!(out, Some(json!({"replicaCount": 2})));
    }

    #[test]
    fn test_probe_overrides() {
        let defaults = ProbeDefaults {
            path: "/health",
            initial_delay: 15,
            timeout: 3,
            period: 10,
            failure_threshold: 3,
        };
        let settings = ProbeSettings {
            path: Some(" /livez ".into()),
            port: Some(ProbePort::Number(8080)),
            scheme: Some("https".into()),
            header: Some("X-Probe: yes".into()),
            period_seconds: Some(20),
            failure_threshold: Some(0),
            ..ProbeSettings::default()
        };
        let probe = build_http_probe(&defaults, &settings);
        assert_eq!(probe["httpGet"]["path"], "/livez");
        assert_eq!(probe["httpGet"]["port"], 8080);
        assert_eq!(probe["httpGet"]["scheme"], "HTTPS");
        assert_eq!(probe["httpGet"]["httpHeaders"][0]["name"], "X-Probe");
        assert_eq!(probe["periodSeconds"], 20);
        assert_eq!(probe["failureThreshold"], 3);
    }

    #[test]
    fn test_ratio_strategy_serde_names() {
        let s: RatioStrategy = serde_json::from_str("\"burstable_2_0\"").expect("parse");
        assert_eq!(s, RatioStrategy::Burstable20);
        assert_eq!(RatioStrategy::Guaranteed.multiplier(1.5), 1.0);
        assert_eq!(RatioStrategy::default().multiplier(1.5), 1.5);
    }
}
