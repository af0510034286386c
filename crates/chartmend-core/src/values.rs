//! Values-file overlays: deep merge, overlay diffing, and atomic apply.

use serde_json::{Map as JsonMap, Value as JsonValue};
use serde_yaml::Value as YamlValue;
use std::path::Path;

use crate::domain::{ChartmendError, Result};
use crate::tree::write_atomic;

/// Merge `overlay` into `base`. Mappings merge key by key; anything else
/// (including sequences and explicit nulls) replaces.
pub fn deep_merge(base: &mut YamlValue, overlay: &YamlValue) {
    match (base, overlay) {
        (YamlValue::Mapping(base_map), YamlValue::Mapping(overlay_map)) => {
            for (key, value) in overlay_map {
                let nested = value.is_mapping()
                    && base_map.get(key).is_some_and(YamlValue::is_mapping);
                match base_map.get_mut(key) {
                    Some(existing) if nested => deep_merge(existing, value),
                    _ => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base, overlay) => *base = overlay.clone(),
    }
}

/// Deep-merge one JSON overlay into another; the later overlay wins on
/// conflicting leaves.
pub fn merge_json_overlay(
    base: &mut JsonMap<String, JsonValue>,
    overlay: &JsonMap<String, JsonValue>,
) {
    for (key, value) in overlay {
        match (base.get_mut(key), value) {
            (Some(JsonValue::Object(existing)), JsonValue::Object(incoming)) => {
                merge_json_overlay(existing, incoming)
            }
            _ => {
                base.insert(key.clone(), value.clone());
            }
        }
    }
}

/// Minimal overlay that turns `before` into `after` under [`deep_merge`].
///
/// Removed keys are expressed as explicit nulls.
pub fn overlay_patch(before: &YamlValue, after: &YamlValue) -> JsonMap<String, JsonValue> {
    let mut out = JsonMap::new();
    let (Some(before_map), Some(after_map)) = (before.as_mapping(), after.as_mapping()) else {
        return out;
    };
    for (key, after_value) in after_map {
        let Some(key_str) = key_string(key) else {
            continue;
        };
        match before_map.get(key) {
            Some(before_value) if before_value == after_value => {}
            Some(before_value) if before_value.is_mapping() && after_value.is_mapping() => {
                let nested = overlay_patch(before_value, after_value);
                if !nested.is_empty() {
                    out.insert(key_str, JsonValue::Object(nested));
                }
            }
            _ => {
                out.insert(key_str, yaml_to_json(after_value));
            }
        }
    }
    for key in before_map.keys() {
        if !after_map.contains_key(key) {
            if let Some(key_str) = key_string(key) {
                out.insert(key_str, JsonValue::Null);
            }
        }
    }
    out
}

fn key_string(key: &YamlValue) -> Option<String> {
    match key {
        YamlValue::String(s) => Some(s.clone()),
        YamlValue::Number(n) => Some(n.to_string()),
        YamlValue::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn yaml_to_json(value: &YamlValue) -> JsonValue {
    serde_json::to_value(value).unwrap_or(JsonValue::Null)
}

/// Parse values text, apply `patch`, and return the re-serialized YAML.
pub fn merge_values_text(text: &str, patch: &JsonMap<String, JsonValue>) -> Result<String> {
    let mut current: YamlValue = if text.trim().is_empty() {
        YamlValue::Mapping(Default::default())
    } else {
        serde_yaml::from_str(text)?
    };
    if current.is_null() {
        current = YamlValue::Mapping(Default::default());
    }
    if !current.is_mapping() {
        return Err(ChartmendError::InvalidChart(
            "values document is not a mapping".to_string(),
        ));
    }
    let overlay = serde_yaml::to_value(patch)?;
    deep_merge(&mut current, &overlay);
    Ok(serde_yaml::to_string(&current)?)
}

/// Deep-merge `patch` into the values file at `values_path`, atomically.
///
/// On any failure the file is left untouched.
pub fn apply_values_patch(values_path: &Path, patch: &JsonMap<String, JsonValue>) -> Result<()> {
    let text = std::fs::read_to_string(values_path)?;
    let merged = merge_values_text(&text, patch)?;
    write_atomic(values_path, merged.as_bytes())?;
    Ok(())
}
