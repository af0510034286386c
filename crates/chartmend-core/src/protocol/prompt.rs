//! Prompt construction for the patch contracts.

use serde_json::{Map, Value};

use super::StructuredPatchResponse;
use crate::config::MAX_SYSTEM_PROMPT_CHARS;
use crate::domain::Violation;

pub const TOKEN_VIOLATIONS: &str = "{{VIOLATIONS}}";
pub const TOKEN_SEED_YAML: &str = "{{SEED_YAML}}";
pub const TOKEN_ALLOWED_FILES: &str = "{{ALLOWED_FILES}}";
pub const TOKEN_RETRY_BLOCK: &str = "{{RETRY_BLOCK}}";
pub const TOKEN_CANONICAL_GUIDANCE: &str = "{{CANONICAL_GUIDANCE}}";

pub const REQUIRED_TOKENS: [&str; 3] = [TOKEN_VIOLATIONS, TOKEN_SEED_YAML, TOKEN_ALLOWED_FILES];
pub const TEMPLATE_TOKENS: [&str; 5] = [
    TOKEN_VIOLATIONS,
    TOKEN_SEED_YAML,
    TOKEN_ALLOWED_FILES,
    TOKEN_RETRY_BLOCK,
    TOKEN_CANONICAL_GUIDANCE,
];

const DEFAULT_GUIDANCE: &str =
    "- Use existing chart key names from values/template wiring and standard Kubernetes field naming.";

/// Per-rule hints about which values keys to touch.
const CANONICAL_GUIDANCE: [(&str, &str); 6] = [
    ("AVL005", "Use `replicaCount` for replica scaling."),
    ("PRB001", "Use `livenessProbe` under workload container config."),
    ("PRB002", "Use `readinessProbe` under workload container config."),
    ("PRB003", "Use `startupProbe` under workload container config."),
    (
        "RES002",
        "Treat current CPU limit as correct; increase only request so `resources.requests.cpu` is about 85% of `resources.limits.cpu`.",
    ),
    (
        "RES003",
        "Treat current memory limit as correct; increase only request so `resources.requests.memory` is about 85% of `resources.limits.memory`.",
    ),
];

/// Built-in template for direct-edit runs. Tokens are substituted per chart.
pub const DEFAULT_FULL_FIX_SYSTEM_PROMPT_TEMPLATE: &str = "\
You are editing Helm chart files directly on disk.
The current process CWD is an isolated staged copy of the chart. Edit files in-place only inside this staged copy.

Goal:
Address all listed violations with minimal safe changes.

Violations:
{{VIOLATIONS}}

Seed deterministic values patch (optional guidance):
{{SEED_YAML}}

STRICT edit scope (existing files only):
{{ALLOWED_FILES}}

Hard constraints:
- Never use absolute paths.
- Never use `..` path traversal.
- Edit only allowlisted files.
- Do not create, delete, or rename files.
- Put concrete configuration values in the selected values file from STRICT edit scope (for example `values.yaml` or `values-automation.yaml`).
- In templates, wire only through .Values references (for example with toYaml/include); do not hardcode final config values.
- Use canonical Kubernetes/value key names and nesting (for example `replicaCount`, `resources.requests/limits`, probe keys).
- Do not invent alias keys or suffixed names (for example `resourcesAutomation`, `replicaCountAutomation`).
- Keep key casing and hierarchy aligned with existing `.Values` usage in templates.
- For probe rules, modify only containers[*] probe wiring; never initContainers[*].
- If a violation needs wiring, update both values keys and template `.Values` references in the same run.
- Do not make no-op or unrelated edits; change only what is required for the listed violations.
- Treat seed YAML as guidance only; prefer listed violations and existing chart wiring patterns when they conflict.
Canonical key guidance for selected rules:
{{CANONICAL_GUIDANCE}}
{{RETRY_BLOCK}}
Output only a concise execution summary text (no JSON, no markdown fences).
Include changed file paths in summary if any.";

const PATCH_CONTRACT: &str = r#"{
  "schema_version": "patch_response.v1",
  "result": "ok | no_change | error",
  "summary": "short explanation",
  "patches": [
    {
      "file": "relative/path.yaml",
      "purpose": "why this patch",
      "unified_diff": "--- a/file\n+++ b/file\n@@ ..."
    }
  ],
  "warnings": ["optional warnings"],
  "error": "non-empty only when result=error"
}"#;

const FULL_FIX_CONTRACT: &str = r#"{
  "schema_version": "full_fix_response.v1",
  "result": "ok | no_change | error",
  "summary": "short explanation",
  "values_patch": { "partial": "overlay deep-merged into the values file" },
  "template_patches": [
    {
      "file": "templates/deployment.yaml",
      "purpose": "why this patch",
      "unified_diff": "--- a/templates/deployment.yaml\n+++ b/templates/deployment.yaml\n@@ ...",
      "updated_content": "full file content (set instead of unified_diff)"
    }
  ],
  "violation_coverage": [
    { "rule_id": "RES002", "status": "addressed | unchanged | not_applicable | error", "note": "" }
  ],
  "warnings": ["optional warnings"],
  "error": "non-empty only when result=error"
}"#;

const FULL_FIX_RULES: &str = "\
Rules:
- `values_patch` is a partial overlay deep-merged into the target values file; use null to delete a key.
- Every `template_patches[].file` must be one of the allowed template files.
- Each template patch sets exactly one of `unified_diff` or `updated_content`.
- `violation_coverage` lists every violation rule_id exactly once.
- If no change is needed: set `result` to `no_change` and leave both patch fields empty.
- If unable to produce a safe fix: set `result` to `error` and explain in `error`.";

/// Everything a full-fix prompt is built from.
#[derive(Debug, Clone)]
pub struct FullFixPromptInput<'a> {
    pub chart_name: &'a str,
    pub rel_values_path: &'a str,
    pub values_text: &'a str,
    pub rendered_excerpt: Option<&'a str>,
    pub violations: &'a [Violation],
    pub seed_patch: &'a Map<String, Value>,
    /// Template files the model may touch, relative to the chart root.
    pub template_files: &'a [String],
    /// Validation failure from the previous attempt, if any.
    pub retry_error: &'a str,
    /// Configured system prompt: a full template or a free-text override.
    pub system_prompt: &'a str,
}

/// CRLF to LF, trimmed, capped at [`MAX_SYSTEM_PROMPT_CHARS`].
pub fn normalize_system_prompt_override(raw: &str) -> String {
    raw.replace("\r\n", "\n")
        .trim()
        .chars()
        .take(MAX_SYSTEM_PROMPT_CHARS)
        .collect()
}

/// Prepend configured override instructions to `base`.
pub fn with_system_prompt_override(base: &str, override_text: &str) -> String {
    let override_text = normalize_system_prompt_override(override_text);
    let base = base.trim();
    if override_text.is_empty() {
        return base.to_string();
    }
    format!(
        "Additional system instructions (configured override):\n{override_text}\n\n\
         Treat the override above as strict requirements while also following \
         the JSON contract and safety rules below.\n\n{base}"
    )
    .trim()
    .to_string()
}

/// Whether configured text is a template (mentions any token) rather than
/// a free-text override.
pub fn is_full_fix_template(text: &str) -> bool {
    let text = text.trim();
    TEMPLATE_TOKENS.iter().any(|t| text.contains(t))
}

/// Required tokens missing from a template. Free-text overrides pass.
pub fn validate_prompt_template(text: &str) -> Result<(), Vec<&'static str>> {
    let text = text.trim();
    if text.is_empty() || !is_full_fix_template(text) {
        return Ok(());
    }
    let missing: Vec<&'static str> = REQUIRED_TOKENS
        .iter()
        .copied()
        .filter(|t| !text.contains(t))
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(missing)
    }
}

/// The default template with guidance for every known rule filled in.
pub fn default_full_fix_template() -> String {
    let all = CANONICAL_GUIDANCE
        .iter()
        .map(|(id, text)| format!("- {id}: {text}"))
        .collect::<Vec<_>>()
        .join("\n");
    DEFAULT_FULL_FIX_SYSTEM_PROMPT_TEMPLATE.replace(TOKEN_CANONICAL_GUIDANCE, &all)
}

/// Guidance lines for the distinct rules among `violations`.
pub fn canonical_guidance_block(violations: &[Violation]) -> String {
    let mut seen = Vec::new();
    let mut lines = Vec::new();
    for v in violations {
        let id = v.rule_id.trim().to_ascii_uppercase();
        if id.is_empty() || seen.contains(&id) {
            continue;
        }
        if let Some((_, text)) = CANONICAL_GUIDANCE.iter().find(|(rule, _)| *rule == id) {
            lines.push(format!("- {id}: {text}"));
        }
        seen.push(id);
    }
    if lines.is_empty() {
        DEFAULT_GUIDANCE.to_string()
    } else {
        lines.join("\n")
    }
}

fn violation_lines(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(|v| {
            format!(
                "- {} ({}): current={}; recommended={}",
                v.rule_id, v.rule_name, v.current_value, v.recommended_value
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn allowed_files_block(rel_values_path: &str, template_files: &[String]) -> String {
    std::iter::once(format!(
        "Target values file for this run (write concrete values here): {rel_values_path}"
    ))
    .chain(std::iter::once(format!("- {rel_values_path}")))
    .chain(template_files.iter().map(|f| format!("- {f}")))
    .collect::<Vec<_>>()
    .join("\n")
}

fn retry_block(retry_error: &str) -> String {
    let err = retry_error.trim();
    if err.is_empty() {
        return String::new();
    }
    format!(
        "Previous attempt failed validation:\n- {err}\n\
         Apply constrained edits only and avoid any out-of-scope file changes.\n"
    )
}

fn seed_yaml(seed: &Map<String, Value>) -> String {
    if seed.is_empty() {
        return "{}".to_string();
    }
    match serde_yaml::to_string(seed) {
        Ok(text) if !text.trim().is_empty() => text.trim_end().to_string(),
        _ => "{}".to_string(),
    }
}

fn render_template(template: &str, input: &FullFixPromptInput<'_>) -> String {
    template
        .replace(TOKEN_VIOLATIONS, &violation_lines(input.violations))
        .replace(TOKEN_SEED_YAML, &seed_yaml(input.seed_patch))
        .replace(
            TOKEN_ALLOWED_FILES,
            &allowed_files_block(input.rel_values_path, input.template_files),
        )
        .replace(
            TOKEN_CANONICAL_GUIDANCE,
            &canonical_guidance_block(input.violations),
        )
        .replace(TOKEN_RETRY_BLOCK, retry_block(input.retry_error).trim())
        .trim()
        .to_string()
}

/// Strict contract prompt for a `patch_response.v1` answer.
pub fn build_structured_patch_prompt(
    task: &str,
    allowed_files: &[String],
    context_blocks: &[(String, String)],
    system_prompt_override: &str,
) -> String {
    let allowed = if allowed_files.is_empty() {
        "- (none)".to_string()
    } else {
        allowed_files
            .iter()
            .map(|f| format!("- {f}"))
            .collect::<Vec<_>>()
            .join("\n")
    };
    let mut parts = vec![
        "You are generating patch proposals for Helm chart files.".to_string(),
        "Return output as a single JSON object only.".to_string(),
        "Do not use markdown, code fences, prose, or extra keys.".to_string(),
        String::new(),
        "Task:".to_string(),
        task.trim().to_string(),
        String::new(),
        "Allowed files (strict allowlist):".to_string(),
        allowed,
        String::new(),
        "JSON response contract:".to_string(),
        PATCH_CONTRACT.to_string(),
        String::new(),
        "Rules:".to_string(),
        "- Every `patches[].file` must be one of the allowed files.".to_string(),
        "- Every `patches[].unified_diff` must be a valid unified diff for that same file."
            .to_string(),
        "- If no change is needed: set `result` to `no_change` and `patches` to [].".to_string(),
        "- If unable to produce safe patch: set `result` to `error` and explain in `error`."
            .to_string(),
    ];
    if !context_blocks.is_empty() {
        parts.push(String::new());
        for (title, content) in context_blocks {
            let title = if title.trim().is_empty() { "Context" } else { title.trim() };
            parts.push(format!("## {title}"));
            parts.push(content.trim_end().to_string());
            parts.push(String::new());
        }
    }
    with_system_prompt_override(&parts.join("\n"), system_prompt_override)
}

/// Prompt asking for a `full_fix_response.v1` bundle covering every violation.
pub fn build_full_fix_prompt(input: &FullFixPromptInput<'_>) -> String {
    let contract = format!("JSON response contract:\n{FULL_FIX_CONTRACT}\n\n{FULL_FIX_RULES}");
    let configured = input.system_prompt.trim();
    if is_full_fix_template(configured) {
        let rendered = render_template(&normalize_system_prompt_override(configured), input);
        return format!(
            "{rendered}\n\nReturn output as a single JSON object only.\n\n{contract}"
        );
    }

    let mut parts = vec![
        format!(
            "You are generating a full fix for Helm chart `{}`.",
            input.chart_name
        ),
        "Return output as a single JSON object only.".to_string(),
        "Do not use markdown, code fences, prose, or extra keys.".to_string(),
        String::new(),
        "Goal:".to_string(),
        "Address all listed violations with minimal safe changes.".to_string(),
        String::new(),
        "Violations:".to_string(),
        violation_lines(input.violations),
        String::new(),
        "Seed deterministic values patch (optional guidance):".to_string(),
        seed_yaml(input.seed_patch),
        String::new(),
        "Allowed files (strict allowlist):".to_string(),
        allowed_files_block(input.rel_values_path, input.template_files),
        String::new(),
        format!("## Current values ({})", input.rel_values_path),
        input.values_text.trim_end().to_string(),
        String::new(),
    ];
    if let Some(excerpt) = input.rendered_excerpt.filter(|e| !e.trim().is_empty()) {
        parts.push("## Rendered manifests (excerpt)".to_string());
        parts.push(excerpt.trim_end().to_string());
        parts.push(String::new());
    }
    parts.push("Canonical key guidance for selected rules:".to_string());
    parts.push(canonical_guidance_block(input.violations));
    parts.push(String::new());
    let retry = retry_block(input.retry_error);
    if !retry.is_empty() {
        parts.push(retry);
    }
    parts.push(contract);

    with_system_prompt_override(&parts.join("\n"), configured)
}

/// Prompt for a provider editing the staged copy in place.
pub fn build_direct_edit_prompt(input: &FullFixPromptInput<'_>) -> String {
    let configured = input.system_prompt.trim();
    if is_full_fix_template(configured) {
        return render_template(&normalize_system_prompt_override(configured), input);
    }
    with_system_prompt_override(
        &render_template(DEFAULT_FULL_FIX_SYSTEM_PROMPT_TEMPLATE, input),
        configured,
    )
}

/// Operator-facing markdown for a parsed patch response.
pub fn format_patch_preview_markdown(response: &StructuredPatchResponse) -> String {
    let mut lines = vec![
        "### AI Patch Result".to_string(),
        format!("- **Result:** `{}`", response.result.as_str().to_ascii_uppercase()),
        format!("- **Summary:** {}", response.summary),
    ];
    if !response.warnings.is_empty() {
        lines.push(String::new());
        lines.push("### Warnings".to_string());
        lines.extend(response.warnings.iter().map(|w| format!("- {w}")));
    }
    if !response.error.is_empty() {
        lines.push(String::new());
        lines.push("### Error".to_string());
        lines.push(response.error.clone());
    }
    if !response.patches.is_empty() {
        lines.push(String::new());
        lines.push("### Patch Preview".to_string());
        for patch in &response.patches {
            let purpose = if patch.purpose.is_empty() {
                "No purpose provided."
            } else {
                patch.purpose.as_str()
            };
            let (fence, body) = match &patch.updated_content {
                Some(content) if !patch.has_diff() => ("```yaml", content.trim_end()),
                _ => ("```diff", patch.unified_diff.trim_end()),
            };
            lines.push(format!("- **File:** `{}`", patch.file));
            lines.push(format!("- **Purpose:** {purpose}"));
            lines.push(fence.to_string());
            lines.push(body.to_string());
            lines.push("```".to_string());
            lines.push(String::new());
        }
    }
    lines.join("\n").trim().to_string()
}
