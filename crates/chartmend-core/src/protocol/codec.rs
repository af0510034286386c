//! Recover and validate contract documents from free-form LLM output.

use regex::Regex;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::OnceLock;

use super::{
    FullFixResponse, PatchFile, PatchResult, ProtocolError, StructuredPatchResponse,
    FULL_FIX_RESPONSE_SCHEMA, PATCH_RESPONSE_SCHEMA,
};

fn code_block_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)```(?:json|javascript|js|txt|yaml|yml)?\s*([\s\S]*?)\s*```")
            .expect("static regex")
    })
}

/// Parse a `patch_response.v1` document.
pub fn parse_structured_patch(raw: &str) -> Result<StructuredPatchResponse, ProtocolError> {
    parse_document(raw, PATCH_RESPONSE_SCHEMA, |r: &StructuredPatchResponse| {
        validate_patches(r.result, &r.patches)
    })
}

/// Parse a `full_fix_response.v1` document.
pub fn parse_full_fix(raw: &str) -> Result<FullFixResponse, ProtocolError> {
    parse_document(raw, FULL_FIX_RESPONSE_SCHEMA, |r: &FullFixResponse| {
        validate_patches(r.result, &r.template_patches)?;
        if r.result == PatchResult::Error && !r.values_patch.is_empty() {
            return Err("values_patch must be empty when result=error".to_string());
        }
        Ok(())
    })
}

/// Every expected rule id must appear exactly once in `violation_coverage`.
pub fn check_coverage<I, S>(response: &FullFixResponse, rule_ids: I) -> Result<(), ProtocolError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let expected: BTreeSet<String> = rule_ids
        .into_iter()
        .map(|id| normalize_rule_id(id.as_ref()))
        .filter(|id| !id.is_empty())
        .collect();
    let mut seen: BTreeMap<String, usize> = BTreeMap::new();
    for record in &response.violation_coverage {
        *seen.entry(normalize_rule_id(&record.rule_id)).or_default() += 1;
    }

    let missing: Vec<&str> = expected
        .iter()
        .filter(|id| !seen.contains_key(*id))
        .map(String::as_str)
        .collect();
    let duplicate: Vec<&str> = seen
        .iter()
        .filter(|(_, n)| **n > 1)
        .map(|(id, _)| id.as_str())
        .collect();
    let unexpected: Vec<&str> = seen
        .keys()
        .filter(|id| !expected.contains(*id))
        .map(String::as_str)
        .collect();

    let mut problems = Vec::new();
    if !missing.is_empty() {
        problems.push(format!("missing {}", missing.join(", ")));
    }
    if !duplicate.is_empty() {
        problems.push(format!("duplicate {}", duplicate.join(", ")));
    }
    if !unexpected.is_empty() {
        problems.push(format!("unexpected {}", unexpected.join(", ")));
    }
    if problems.is_empty() {
        Ok(())
    } else {
        Err(ProtocolError::CoverageMismatch(problems.join("; ")))
    }
}

fn normalize_rule_id(id: &str) -> String {
    id.trim().to_ascii_uppercase()
}

fn validate_patches(result: PatchResult, patches: &[PatchFile]) -> Result<(), String> {
    if result == PatchResult::Error && !patches.is_empty() {
        return Err("patches must be empty when result=error".to_string());
    }
    for patch in patches {
        if patch.file.trim().is_empty() {
            return Err("patch file path must not be empty".to_string());
        }
        match (patch.has_diff(), patch.has_content()) {
            (false, false) => {
                return Err(format!(
                    "{}: patch must include unified_diff or updated_content",
                    patch.file
                ))
            }
            (true, true) => {
                return Err(format!(
                    "{}: patch must not include both unified_diff and updated_content",
                    patch.file
                ))
            }
            _ => {}
        }
    }
    Ok(())
}

fn parse_document<T, F>(raw: &str, schema: &str, validate: F) -> Result<T, ProtocolError>
where
    T: DeserializeOwned,
    F: Fn(&T) -> Result<(), String>,
{
    let payloads = json_payloads(raw)?;
    // A candidate carrying the right schema_version explains the failure
    // better than any nested object that lacks one.
    let mut schema_error = None;
    let mut validation_error = None;
    for payload in payloads {
        let version = payload.get("schema_version").and_then(Value::as_str);
        if version != Some(schema) {
            if schema_error.is_none() {
                schema_error = Some(format!(
                    "schema_version must be {schema:?}, got {}",
                    version
                        .map(|v| format!("{v:?}"))
                        .unwrap_or_else(|| "none".to_string())
                ));
            }
            continue;
        }
        let outcome = serde_json::from_value::<T>(payload)
            .map_err(|e| e.to_string())
            .and_then(|doc| validate(&doc).map(|()| doc));
        match outcome {
            Ok(doc) => return Ok(doc),
            Err(e) => {
                validation_error.get_or_insert(e);
            }
        }
    }
    Err(ProtocolError::SchemaMismatch(
        validation_error
            .or(schema_error)
            .unwrap_or_else(|| "no candidate object".to_string()),
    ))
}

/// Decoded JSON objects in candidate order: whole text, fenced blocks, then
/// balanced `{...}` spans of each.
fn json_payloads(raw: &str) -> Result<Vec<Value>, ProtocolError> {
    let normalized = raw.trim();
    if normalized.is_empty() {
        return Err(ProtocolError::Empty);
    }

    let mut candidates = vec![normalized.to_string()];
    for caps in code_block_pattern().captures_iter(normalized) {
        if let Some(block) = caps.get(1) {
            let block = block.as_str().trim();
            if !block.is_empty() {
                candidates.push(block.to_string());
            }
        }
    }

    let mut seen = HashSet::new();
    let mut payloads = Vec::new();
    let mut decode_error = None;
    let mut consider = |text: &str, payloads: &mut Vec<Value>| {
        if !seen.insert(text.to_string()) {
            return;
        }
        match serde_json::from_str::<Value>(text) {
            Ok(value @ Value::Object(_)) => payloads.push(value),
            Ok(_) => decode_error = Some("top-level JSON value must be an object".to_string()),
            Err(e) => decode_error = Some(e.to_string()),
        }
    };
    for candidate in &candidates {
        consider(candidate, &mut payloads);
        for object in balanced_objects(candidate) {
            consider(object, &mut payloads);
        }
    }

    if !payloads.is_empty() {
        return Ok(payloads);
    }
    Err(ProtocolError::InvalidJson(
        decode_error.unwrap_or_else(|| "response is not valid JSON".to_string()),
    ))
}

/// Balanced brace spans ordered by where they open, ignoring braces inside
/// strings. One pass over the text.
fn balanced_objects(text: &str) -> Vec<&str> {
    let mut open = Vec::new();
    let mut spans = Vec::new();
    let mut in_string = false;
    let mut escaped = false;
    for (i, b) in text.bytes().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            // quotes in prose outside any object do not start a string
            b'"' if !open.is_empty() => in_string = true,
            b'{' => open.push(i),
            b'}' => {
                if let Some(start) = open.pop() {
                    spans.push((start, i + 1));
                }
            }
            _ => {}
        }
    }
    spans.sort_unstable();
    spans.into_iter().map(|(start, end)| &text[start..end]).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{CoverageRecord, CoverageStatus};

    const OK_PATCH: &str = r#"{"schema_version":"patch_response.v1","result":"ok","summary":"raise request","patches":[{"file":"values.yaml","purpose":"ratio","unified_diff":"--- a/values.yaml\n+++ b/values.yaml\n@@ -1 +1 @@\n-a: 1\n+a: 2\n"}]}"#;

    #[test]
    fn test_parse_plain_json() {
        let r = parse_structured_patch(OK_PATCH).expect("parse");
        assert_eq!(r.result, PatchResult::Ok);
        assert_eq!(r.patches.len(), 1);
        assert_eq!(r.patches[0].file, "values.yaml");
    }

    #[test]
    fn test_parse_fenced_json_with_prose() {
        let raw = format!("Here is the fix:\n```json\n{OK_PATCH}\n```\nDone.");
        assert_eq!(parse_structured_patch(&raw).expect("parse").summary, "raise request");
    }

    #[test]
    fn test_parse_wrapped_object_without_fence() {
        let raw = format!("Sure! {OK_PATCH} Let me know.");
        assert!(parse_structured_patch(&raw).is_ok());
    }

    #[test]
    fn test_braces_inside_strings_do_not_confuse_extraction() {
        let raw = r#"noise {"schema_version":"full_fix_response.v1","result":"no_change","summary":"a } b { c"} tail"#;
        let r = parse_full_fix(raw).expect("parse");
        assert_eq!(r.result, PatchResult::NoChange);
        assert_eq!(r.summary, "a } b { c");
    }

    #[test]
    fn test_empty_response() {
        assert_eq!(parse_full_fix("   \n"), Err(ProtocolError::Empty));
    }

    #[test]
    fn test_invalid_json() {
        match parse_full_fix("not json at all") {
            Err(ProtocolError::InvalidJson(_)) => {}
            other => panic!("expected InvalidJson, got {:?}", other),
        }
    }

    #[test]
    fn test_wrong_schema_version() {
        let raw = r#"{"schema_version":"patch_response.v1","result":"ok","summary":""}"#;
        match parse_full_fix(raw) {
            Err(ProtocolError::SchemaMismatch(msg)) => {
                assert!(msg.contains("full_fix_response.v1"))
            }
            other => panic!("expected SchemaMismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_patch_without_content_rejected() {
        let raw = r#"{"schema_version":"full_fix_response.v1","result":"ok","summary":"","template_patches":[{"file":"templates/deployment.yaml"}]}"#;
        assert!(matches!(parse_full_fix(raw), Err(ProtocolError::SchemaMismatch(_))));
    }

    #[test]
    fn test_patch_with_both_fields_rejected() {
        let raw = r#"{"schema_version":"full_fix_response.v1","result":"ok","summary":"","template_patches":[{"file":"templates/a.yaml","unified_diff":"@@","updated_content":"x"}]}"#;
        match parse_full_fix(raw) {
            Err(ProtocolError::SchemaMismatch(msg)) => assert!(msg.contains("both")),
            other => panic!("expected SchemaMismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_error_result_with_patches_rejected() {
        let raw = r#"{"schema_version":"full_fix_response.v1","result":"error","summary":"","error":"no","template_patches":[{"file":"templates/a.yaml","updated_content":"x"}]}"#;
        assert!(parse_full_fix(raw).is_err());
    }

    #[test]
    fn test_nested_objects_do_not_mask_validation_error() {
        let raw = r#"```json
{"schema_version":"full_fix_response.v1","result":"error","summary":"","error":"no","template_patches":[{"file":"templates/a.yaml","updated_content":"x"}]}
```"#;
        match parse_full_fix(raw) {
            Err(ProtocolError::SchemaMismatch(msg)) => {
                assert_eq!(msg, "patches must be empty when result=error")
            }
            other => panic!("expected SchemaMismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_empty_updated_content_is_content() {
        let raw = r#"{"schema_version":"full_fix_response.v1","result":"ok","summary":"","template_patches":[{"file":"templates/a.yaml","updated_content":""}]}"#;
        let r = parse_full_fix(raw).expect("parse");
        assert_eq!(r.template_patches[0].updated_content.as_deref(), Some(""));
    }

    #[test]
    fn test_balanced_objects_nested_in_opening_order() {
        let spans = balanced_objects(r#"say "hi" {"a":{"b":1},"c":"}"} {"d":2}"#);
        assert_eq!(spans, vec![r#"{"a":{"b":1},"c":"}"}"#, r#"{"b":1}"#, r#"{"d":2}"#]);
    }

    #[test]
    fn test_brace_heavy_output_is_scanned_once() {
        let raw = "{".repeat(200_000);
        assert!(balanced_objects(&raw).is_empty());
        assert!(matches!(parse_full_fix(&raw), Err(ProtocolError::InvalidJson(_))));
    }

    #[test]
    fn test_unknown_result_rejected() {
        let raw = r#"{"schema_version":"patch_response.v1","result":"maybe","summary":""}"#;
        assert!(matches!(parse_structured_patch(raw), Err(ProtocolError::SchemaMismatch(_))));
    }

    #[test]
    fn test_first_valid_candidate_wins() {
        let raw = r#"draft: {"schema_version":"full_fix_response.v1","result":"bogus"}
final: {"schema_version":"full_fix_response.v1","result":"ok","summary":"second","values_patch":{"replicaCount":2}}"#;
        let r = parse_full_fix(raw).expect("parse");
        assert_eq!(r.summary, "second");
        assert_eq!(r.values_patch["replicaCount"], 2);
    }

    #[test]
    fn test_serialized_response_parses_back() {
        let mut response = FullFixResponse::ok("lower cpu limit");
        response
            .values_patch
            .insert("replicaCount".into(), serde_json::json!(2));
        response.violation_coverage.push(CoverageRecord {
            rule_id: "AVL005".into(),
            status: CoverageStatus::Addressed,
            note: String::new(),
        });
        let text = serde_json::to_string_pretty(&response).expect("serialize");
        assert_eq!(parse_full_fix(&text).expect("parse"), response);
    }

    fn coverage(ids: &[&str]) -> FullFixResponse {
        let mut r = FullFixResponse::ok("");
        r.violation_coverage = ids
            .iter()
            .map(|id| CoverageRecord {
                rule_id: id.to_string(),
                status: CoverageStatus::Addressed,
                note: String::new(),
            })
            .collect();
        r
    }

    #[test]
    fn test_coverage_complete() {
        check_coverage(&coverage(&["RES002", "prb001"]), ["PRB001", "RES002", "RES002"])
            .expect("covered");
    }

    #[test]
    fn test_coverage_missing_rule() {
        match check_coverage(&coverage(&["RES002"]), ["RES002", "PRB001"]) {
            Err(ProtocolError::CoverageMismatch(msg)) => assert!(msg.contains("missing PRB001")),
            other => panic!("expected CoverageMismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_coverage_duplicate_and_unexpected() {
        match check_coverage(&coverage(&["RES002", "RES002", "SEC001"]), ["RES002"]) {
            Err(ProtocolError::CoverageMismatch(msg)) => {
                assert!(msg.contains("duplicate RES002"));
                assert!(msg.contains("unexpected SEC001"));
            }
            other => panic!("expected CoverageMismatch, got {:?}", other),
        }
    }
}
