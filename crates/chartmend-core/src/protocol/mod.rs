//! The JSON contract between chartmend and an LLM CLI.
//!
//! Two response documents exist: `patch_response.v1` for targeted diffs and
//! `full_fix_response.v1` for whole-chart bundles. Parsing and coverage
//! checks live in [`codec`]; prompt construction lives in [`prompt`].

pub mod codec;
pub mod prompt;

use serde::{Deserialize, Serialize};

pub use codec::{check_coverage, parse_full_fix, parse_structured_patch};
pub use prompt::{
    build_direct_edit_prompt, build_full_fix_prompt, build_structured_patch_prompt,
    canonical_guidance_block, default_full_fix_template, format_patch_preview_markdown,
    is_full_fix_template, normalize_system_prompt_override, validate_prompt_template,
    with_system_prompt_override, FullFixPromptInput, DEFAULT_FULL_FIX_SYSTEM_PROMPT_TEMPLATE,
};

pub const PATCH_RESPONSE_SCHEMA: &str = "patch_response.v1";
pub const FULL_FIX_RESPONSE_SCHEMA: &str = "full_fix_response.v1";

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("empty LLM response")]
    Empty,

    #[error("LLM JSON payload is invalid: {0}")]
    InvalidJson(String),

    #[error("LLM response schema validation failed: {0}")]
    SchemaMismatch(String),

    #[error("violation coverage mismatch: {0}")]
    CoverageMismatch(String),
}

/// Top-level outcome reported by the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatchResult {
    Ok,
    NoChange,
    Error,
}

impl PatchResult {
    pub fn as_str(self) -> &'static str {
        match self {
            PatchResult::Ok => "ok",
            PatchResult::NoChange => "no_change",
            PatchResult::Error => "error",
        }
    }
}

impl std::fmt::Display for PatchResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One file change. Exactly one of `unified_diff` / `updated_content` is set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchFile {
    /// Path relative to the chart root.
    pub file: String,
    #[serde(default)]
    pub purpose: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub unified_diff: String,
    /// Full replacement text; `Some("")` empties the file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_content: Option<String>,
}

impl PatchFile {
    pub fn diff(
        file: impl Into<String>,
        purpose: impl Into<String>,
        diff: impl Into<String>,
    ) -> Self {
        Self {
            file: file.into(),
            purpose: purpose.into(),
            unified_diff: diff.into(),
            updated_content: None,
        }
    }

    pub fn content(
        file: impl Into<String>,
        purpose: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            file: file.into(),
            purpose: purpose.into(),
            unified_diff: String::new(),
            updated_content: Some(content.into()),
        }
    }

    pub fn has_diff(&self) -> bool {
        !self.unified_diff.trim().is_empty()
    }

    pub fn has_content(&self) -> bool {
        self.updated_content.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructuredPatchResponse {
    pub schema_version: String,
    pub result: PatchResult,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub patches: Vec<PatchFile>,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default)]
    pub error: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoverageStatus {
    #[default]
    Addressed,
    Unchanged,
    NotApplicable,
    Error,
}

/// What the model claims to have done about one rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoverageRecord {
    pub rule_id: String,
    #[serde(default)]
    pub status: CoverageStatus,
    #[serde(default)]
    pub note: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FullFixResponse {
    pub schema_version: String,
    pub result: PatchResult,
    #[serde(default)]
    pub summary: String,
    /// Overlay deep-merged into the chart's values file.
    #[serde(default)]
    pub values_patch: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub template_patches: Vec<PatchFile>,
    #[serde(default)]
    pub violation_coverage: Vec<CoverageRecord>,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default)]
    pub error: String,
}

impl FullFixResponse {
    /// An `ok` response with no changes yet; callers fill in the patches.
    pub fn ok(summary: impl Into<String>) -> Self {
        Self {
            schema_version: FULL_FIX_RESPONSE_SCHEMA.to_string(),
            result: PatchResult::Ok,
            summary: summary.into(),
            values_patch: serde_json::Map::new(),
            template_patches: Vec::new(),
            violation_coverage: Vec::new(),
            warnings: Vec::new(),
            error: String::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.values_patch.is_empty() && self.template_patches.is_empty()
    }
}
