//! Non-interactive LLM CLI invocation.
//!
//! The orchestrator talks to providers only through [`LlmInvoker`], so tests
//! substitute a scripted fake and production uses [`CliLlmRunner`].

pub mod runner;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub use runner::{tail_text, CliLlmRunner, ProviderCapability};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LlmProvider {
    Codex,
    Claude,
}

impl LlmProvider {
    pub const ALL: [LlmProvider; 2] = [LlmProvider::Codex, LlmProvider::Claude];

    pub fn as_str(self) -> &'static str {
        match self {
            LlmProvider::Codex => "codex",
            LlmProvider::Claude => "claude",
        }
    }
}

impl std::fmt::Display for LlmProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for LlmProvider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "codex" => Ok(LlmProvider::Codex),
            "claude" => Ok(LlmProvider::Claude),
            other => Err(format!("unknown provider: {other}")),
        }
    }
}

/// Outcome of a single prompt-in, text-out CLI run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LlmCliResult {
    /// Exit code 0.
    pub ok: bool,
    pub provider: LlmProvider,
    pub command: Vec<String>,
    /// `None` when the process never started or was cancelled.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub error_message: String,
    pub timed_out: bool,
    pub duration_ms: u64,
}

impl LlmCliResult {
    pub fn failed(provider: LlmProvider, command: Vec<String>, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            provider,
            command,
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            error_message: message.into(),
            timed_out: false,
            duration_ms: 0,
        }
    }
}

/// Outcome of a provider editing a workspace in place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LlmDirectEditResult {
    pub ok: bool,
    pub provider: LlmProvider,
    pub command: Vec<String>,
    /// Attempts actually made.
    pub attempts: u32,
    /// Workspace-relative paths whose content changed, sorted.
    pub changed_rel_paths: Vec<String>,
    pub error_message: String,
    pub stdout_tail: String,
    pub stderr_tail: String,
    pub log_text: String,
    pub timed_out: bool,
}

impl LlmDirectEditResult {
    pub fn failed(provider: LlmProvider, message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            ok: false,
            provider,
            command: Vec::new(),
            attempts: 0,
            changed_rel_paths: Vec::new(),
            log_text: message.clone(),
            error_message: message,
            stdout_tail: String::new(),
            stderr_tail: String::new(),
            timed_out: false,
        }
    }
}

#[async_trait]
pub trait LlmInvoker: Send + Sync {
    /// Send `prompt` on stdin and capture the answer. Never panics or errors;
    /// failures come back in the result.
    async fn run_structured_patch(
        &self,
        provider: LlmProvider,
        prompt: &str,
        timeout: Duration,
        model: Option<&str>,
        cancel: &CancellationToken,
    ) -> LlmCliResult;

    /// Let the provider edit `workspace` directly, retrying up to `attempts`
    /// times while it exits non-zero without touching any file.
    #[allow(clippy::too_many_arguments)]
    async fn run_direct_edit(
        &self,
        provider: LlmProvider,
        workspace: &Path,
        prompt: &str,
        timeout: Duration,
        model: Option<&str>,
        attempts: u32,
        cancel: &CancellationToken,
    ) -> LlmDirectEditResult;

    /// Whether the provider can be launched at all.
    fn is_available(&self, _provider: LlmProvider) -> bool {
        true
    }
}
