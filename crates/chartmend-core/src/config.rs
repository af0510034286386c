//! Optimizer settings: the read-only snapshot every pipeline stage consumes.
//!
//! Settings load from a TOML or JSON file and may then be overridden by
//! `CHARTMEND_*` environment variables.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::llm::LlmProvider;
use crate::rules::{FixOptions, RuleThresholds};

/// Upper bound on the configured system prompt, in characters.
pub const MAX_SYSTEM_PROMPT_CHARS: usize = 12_000;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("unsupported settings format: {0} (expected .toml or .json)")]
    UnsupportedFormat(PathBuf),

    #[error("invalid value for {key}: {value}")]
    InvalidOverride { key: String, value: String },

    #[error("invalid settings: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisSourceSetting {
    /// Render when possible, fall back to values.
    #[default]
    Auto,
    Rendered,
    Values,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderSetting {
    #[default]
    Codex,
    Claude,
    /// Walk `ai_fix_provider_order`.
    Auto,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FixMode {
    /// The model answers with a `full_fix_response.v1` JSON document.
    #[default]
    Structured,
    /// The model edits a staged copy of the chart in place.
    DirectEdit,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerSettings {
    pub optimizer_analysis_source: AnalysisSourceSetting,
    pub verify_fixes_with_render: bool,
    pub helm_template_timeout_seconds: u64,
    pub helm_binary: String,
    pub ai_fix_llm_provider: ProviderSetting,
    pub ai_fix_provider_order: Vec<LlmProvider>,
    pub ai_fix_codex_model: String,
    pub ai_fix_claude_model: String,
    pub ai_fix_full_fix_system_prompt: String,
    pub ai_fix_bulk_parallelism: usize,
    pub ai_fix_timeout_seconds: u64,
    pub ai_fix_mode: FixMode,
    pub ai_fix_direct_edit_attempts: u32,
    pub codex_binary: String,
    pub claude_binary: String,
    pub max_workers: usize,
    pub thresholds: RuleThresholds,
    pub fix_options: FixOptions,
}

impl Default for OptimizerSettings {
    fn default() -> Self {
        Self {
            optimizer_analysis_source: AnalysisSourceSetting::Auto,
            verify_fixes_with_render: true,
            helm_template_timeout_seconds: 30,
            helm_binary: "helm".to_string(),
            ai_fix_llm_provider: ProviderSetting::Codex,
            ai_fix_provider_order: vec![LlmProvider::Codex, LlmProvider::Claude],
            ai_fix_codex_model: "auto".to_string(),
            ai_fix_claude_model: "auto".to_string(),
            ai_fix_full_fix_system_prompt: String::new(),
            ai_fix_bulk_parallelism: 2,
            ai_fix_timeout_seconds: 120,
            ai_fix_mode: FixMode::Structured,
            ai_fix_direct_edit_attempts: 1,
            codex_binary: "codex".to_string(),
            claude_binary: "claude".to_string(),
            max_workers: 0,
            thresholds: RuleThresholds::default(),
            fix_options: FixOptions::default(),
        }
    }
}

impl OptimizerSettings {
    /// Load settings from a `.toml` or `.json` file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let parse_err = |message: String| ConfigError::Parse {
            path: path.to_path_buf(),
            message,
        };
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase);
        match ext.as_deref() {
            Some("toml") => toml::from_str(&text).map_err(|e| parse_err(e.to_string())),
            Some("json") => serde_json::from_str(&text).map_err(|e| parse_err(e.to_string())),
            _ => Err(ConfigError::UnsupportedFormat(path.to_path_buf())),
        }
    }

    /// Apply `CHARTMEND_*` environment overrides.
    pub fn apply_env_overrides(self) -> Result<Self, ConfigError> {
        self.apply_overrides_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary key lookup.
    pub fn apply_overrides_from<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn invalid(key: &str, value: &str) -> ConfigError {
            ConfigError::InvalidOverride {
                key: key.to_string(),
                value: value.to_string(),
            }
        }
        fn parse_enum<T: serde::de::DeserializeOwned>(
            key: &str,
            value: &str,
        ) -> Result<T, ConfigError> {
            serde_json::from_value(serde_json::Value::String(value.trim().to_ascii_lowercase()))
                .map_err(|_| invalid(key, value))
        }

        if let Some(v) = lookup("CHARTMEND_ANALYSIS_SOURCE") {
            self.optimizer_analysis_source = parse_enum("CHARTMEND_ANALYSIS_SOURCE", &v)?;
        }
        if let Some(v) = lookup("CHARTMEND_VERIFY_WITH_RENDER") {
            self.verify_fixes_with_render = match v.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                _ => return Err(invalid("CHARTMEND_VERIFY_WITH_RENDER", &v)),
            };
        }
        if let Some(v) = lookup("CHARTMEND_HELM_TIMEOUT_SECONDS") {
            self.helm_template_timeout_seconds = v
                .trim()
                .parse()
                .map_err(|_| invalid("CHARTMEND_HELM_TIMEOUT_SECONDS", &v))?;
        }
        if let Some(v) = lookup("CHARTMEND_HELM_BINARY") {
            self.helm_binary = v;
        }
        if let Some(v) = lookup("CHARTMEND_LLM_PROVIDER") {
            self.ai_fix_llm_provider = parse_enum("CHARTMEND_LLM_PROVIDER", &v)?;
        }
        if let Some(v) = lookup("CHARTMEND_CODEX_MODEL") {
            self.ai_fix_codex_model = v;
        }
        if let Some(v) = lookup("CHARTMEND_CLAUDE_MODEL") {
            self.ai_fix_claude_model = v;
        }
        if let Some(v) = lookup("CHARTMEND_BULK_PARALLELISM") {
            self.ai_fix_bulk_parallelism = v
                .trim()
                .parse()
                .map_err(|_| invalid("CHARTMEND_BULK_PARALLELISM", &v))?;
        }
        if let Some(v) = lookup("CHARTMEND_AI_TIMEOUT_SECONDS") {
            self.ai_fix_timeout_seconds = v
                .trim()
                .parse()
                .map_err(|_| invalid("CHARTMEND_AI_TIMEOUT_SECONDS", &v))?;
        }
        if let Some(v) = lookup("CHARTMEND_FIX_MODE") {
            self.ai_fix_mode = parse_enum("CHARTMEND_FIX_MODE", &v)?;
        }
        if let Some(v) = lookup("CHARTMEND_MAX_WORKERS") {
            self.max_workers = v
                .trim()
                .parse()
                .map_err(|_| invalid("CHARTMEND_MAX_WORKERS", &v))?;
        }
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ai_fix_bulk_parallelism == 0 {
            return Err(ConfigError::Invalid(
                "ai_fix_bulk_parallelism must be at least 1".to_string(),
            ));
        }
        if self.helm_template_timeout_seconds == 0 || self.ai_fix_timeout_seconds == 0 {
            return Err(ConfigError::Invalid("timeouts must be positive".to_string()));
        }
        if self.ai_fix_direct_edit_attempts == 0 {
            return Err(ConfigError::Invalid(
                "ai_fix_direct_edit_attempts must be at least 1".to_string(),
            ));
        }
        if self.ai_fix_llm_provider == ProviderSetting::Auto
            && self.ai_fix_provider_order.is_empty()
        {
            return Err(ConfigError::Invalid(
                "ai_fix_provider_order must not be empty when provider is auto".to_string(),
            ));
        }
        let t = &self.thresholds;
        if t.limit_request_ratio <= 0.0 || t.burstable_target_ratio <= 0.0 || t.pdb_blocking < 0 {
            return Err(ConfigError::Invalid("rule thresholds must be positive".to_string()));
        }
        if self.ai_fix_full_fix_system_prompt.chars().count() > MAX_SYSTEM_PROMPT_CHARS {
            tracing::warn!(
                limit = MAX_SYSTEM_PROMPT_CHARS,
                "system prompt override exceeds limit and will be truncated"
            );
        }
        Ok(())
    }

    /// Providers to try, in order.
    pub fn provider_chain(&self) -> Vec<LlmProvider> {
        match self.ai_fix_llm_provider {
            ProviderSetting::Codex => vec![LlmProvider::Codex],
            ProviderSetting::Claude => vec![LlmProvider::Claude],
            ProviderSetting::Auto => {
                let mut chain = Vec::new();
                for p in &self.ai_fix_provider_order {
                    if !chain.contains(p) {
                        chain.push(*p);
                    }
                }
                chain
            }
        }
    }

    /// Model flag for a provider; `auto` and blank mean the CLI default.
    pub fn model_for(&self, provider: LlmProvider) -> Option<String> {
        let raw = match provider {
            LlmProvider::Codex => &self.ai_fix_codex_model,
            LlmProvider::Claude => &self.ai_fix_claude_model,
        };
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("auto") {
            None
        } else {
            Some(trimmed.to_string())
        }
    }

    pub fn helm_timeout(&self) -> Duration {
        Duration::from_secs(self.helm_template_timeout_seconds)
    }

    pub fn ai_fix_timeout(&self) -> Duration {
        Duration::from_secs(self.ai_fix_timeout_seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let s = OptimizerSettings::default();
        assert_eq!(s.optimizer_analysis_source, AnalysisSourceSetting::Auto);
        assert!(s.verify_fixes_with_render);
        assert_eq!(s.helm_template_timeout_seconds, 30);
        assert_eq!(s.ai_fix_bulk_parallelism, 2);
        assert_eq!(s.provider_chain(), vec![LlmProvider::Codex]);
        assert_eq!(s.model_for(LlmProvider::Codex), None);
        s.validate().expect("defaults are valid");
    }

    #[test]
    fn test_load_toml_partial() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("chartmend.toml");
        std::fs::write(
            &path,
            r#"
ai_fix_llm_provider = "auto"
ai_fix_claude_model = "sonnet"
ai_fix_bulk_parallelism = 4

[thresholds]
limit_request_ratio = 3.0
fixed_resource_fields = []
"#,
        )
        .expect("write");
        let s = OptimizerSettings::load(&path).expect("load");
        assert_eq!(s.ai_fix_llm_provider, ProviderSetting::Auto);
        assert_eq!(
            s.provider_chain(),
            vec![LlmProvider::Codex, LlmProvider::Claude]
        );
        assert_eq!(s.model_for(LlmProvider::Claude).as_deref(), Some("sonnet"));
        assert_eq!(s.ai_fix_bulk_parallelism, 4);
        assert_eq!(s.thresholds.limit_request_ratio, 3.0);
        assert!(s.thresholds.fixed_resource_fields.is_empty());
        assert_eq!(s.helm_template_timeout_seconds, 30);
    }

    #[test]
    fn test_load_json() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"ai_fix_mode": "direct_edit", "max_workers": 3}"#)
            .expect("write");
        let s = OptimizerSettings::load(&path).expect("load");
        assert_eq!(s.ai_fix_mode, FixMode::DirectEdit);
        assert_eq!(s.max_workers, 3);
    }

    #[test]
    fn test_load_unknown_extension() {
        let err = OptimizerSettings::load(Path::new("/tmp/chartmend.ini")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. } | ConfigError::UnsupportedFormat(_)));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("CHARTMEND_LLM_PROVIDER", "Claude"),
            ("CHARTMEND_VERIFY_WITH_RENDER", "false"),
            ("CHARTMEND_BULK_PARALLELISM", "5"),
            ("CHARTMEND_ANALYSIS_SOURCE", "values"),
        ]
        .into_iter()
        .collect();
        let s = OptimizerSettings::default()
            .apply_overrides_from(|k| env.get(k).map(|v| v.to_string()))
            .expect("overrides");
        assert_eq!(s.provider_chain(), vec![LlmProvider::Claude]);
        assert!(!s.verify_fixes_with_render);
        assert_eq!(s.ai_fix_bulk_parallelism, 5);
        assert_eq!(s.optimizer_analysis_source, AnalysisSourceSetting::Values);
    }

    #[test]
    fn test_bad_env_override_rejected() {
        let err = OptimizerSettings::default()
            .apply_overrides_from(|k| (k == "CHARTMEND_FIX_MODE").then(|| "yolo".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidOverride { .. }));
    }

    #[test]
    fn test_zero_parallelism_invalid() {
        let s = OptimizerSettings {
            ai_fix_bulk_parallelism: 0,
            ..OptimizerSettings::default()
        };
        assert!(s.validate().is_err());
    }

    #[test]
    fn test_auto_chain_dedupes() {
        let s = OptimizerSettings {
            ai_fix_llm_provider: ProviderSetting::Auto,
            ai_fix_provider_order: vec![
                LlmProvider::Claude,
                LlmProvider::Claude,
                LlmProvider::Codex,
            ],
            ..OptimizerSettings::default()
        };
        assert_eq!(s.provider_chain(), vec![LlmProvider::Claude, LlmProvider::Codex]);
    }
}
