//! [`LlmInvoker`] backed by the `codex` and `claude` command-line tools.

use async_trait::async_trait;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use super::{LlmCliResult, LlmDirectEditResult, LlmInvoker, LlmProvider};
use crate::config::OptimizerSettings;
use crate::process::{run_process, CommandSpec, ProcessOutcome};
use crate::tree::{changed_paths, snapshot_tree};

/// Variables that make a nested agent CLI refuse to start.
const NESTED_SESSION_ENV: [&str; 3] = ["CLAUDECODE", "CLAUDE_CODE_SESSION", "CLAUDE_CODE_ENTRY"];

const TAIL_MAX_LINES: usize = 120;
const TAIL_MAX_CHARS: usize = 5000;

/// Exit code reported for a run killed by its timeout.
const TIMEOUT_EXIT_CODE: i32 = 124;

/// Whether a provider binary resolves on `PATH`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProviderCapability {
    pub provider: LlmProvider,
    pub binary: PathBuf,
    pub resolved: Option<PathBuf>,
}

impl ProviderCapability {
    pub fn available(&self) -> bool {
        self.resolved.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct CliLlmRunner {
    codex_binary: PathBuf,
    claude_binary: PathBuf,
}

impl Default for CliLlmRunner {
    fn default() -> Self {
        Self::new("codex", "claude")
    }
}

impl CliLlmRunner {
    pub fn new(codex_binary: impl Into<PathBuf>, claude_binary: impl Into<PathBuf>) -> Self {
        Self {
            codex_binary: codex_binary.into(),
            claude_binary: claude_binary.into(),
        }
    }

    pub fn from_settings(settings: &OptimizerSettings) -> Self {
        Self::new(&settings.codex_binary, &settings.claude_binary)
    }

    pub fn binary(&self, provider: LlmProvider) -> &Path {
        match provider {
            LlmProvider::Codex => &self.codex_binary,
            LlmProvider::Claude => &self.claude_binary,
        }
    }

    /// Resolve every provider binary with `which`.
    pub fn detect_capabilities(&self) -> Vec<ProviderCapability> {
        LlmProvider::ALL
            .iter()
            .map(|&provider| {
                let binary = self.binary(provider).to_path_buf();
                let resolved = which::which(&binary).ok();
                ProviderCapability {
                    provider,
                    binary,
                    resolved,
                }
            })
            .collect()
    }

    fn base_command(&self, provider: LlmProvider, timeout: Duration) -> CommandSpec {
        let spec = CommandSpec::new(self.binary(provider), timeout)
            .env("CI", "1")
            .env("TERM", "dumb")
            .env("NO_COLOR", "1");
        NESTED_SESSION_ENV
            .iter()
            .fold(spec, |spec, key| spec.env_remove(*key))
    }

    /// Command for a prompt-in, JSON-out run.
    pub fn structured_command(
        &self,
        provider: LlmProvider,
        timeout: Duration,
        model: Option<&str>,
    ) -> CommandSpec {
        let spec = self.base_command(provider, timeout);
        match provider {
            LlmProvider::Codex => {
                let spec = spec.args([
                    "exec",
                    "--ephemeral",
                    "--color",
                    "never",
                    "--skip-git-repo-check",
                ]);
                with_model(spec, model).arg("-")
            }
            LlmProvider::Claude => with_model(spec.args(["-p", "--output-format", "text"]), model),
        }
    }

    /// Command for an in-place edit of `workspace`.
    pub fn direct_edit_command(
        &self,
        provider: LlmProvider,
        workspace: &Path,
        timeout: Duration,
        model: Option<&str>,
    ) -> CommandSpec {
        let spec = self.base_command(provider, timeout).cwd(workspace);
        match provider {
            LlmProvider::Codex => {
                let spec = spec.args([
                    "exec",
                    "--ephemeral",
                    "--color",
                    "never",
                    "--skip-git-repo-check",
                    "--full-auto",
                ]);
                with_model(spec, model)
                    .arg("--cd")
                    .arg(workspace.as_os_str())
                    .arg("-")
            }
            LlmProvider::Claude => {
                let spec = spec.args([
                    "-p",
                    "--output-format",
                    "text",
                    "--permission-mode",
                    "bypassPermissions",
                    "--allowedTools",
                    "Read,Write,Edit",
                ]);
                with_model(spec, model)
            }
        }
    }
}

fn with_model(spec: CommandSpec, model: Option<&str>) -> CommandSpec {
    match model.map(str::trim).filter(|m| !m.is_empty()) {
        Some(m) => spec.arg("--model").arg(m),
        None => spec,
    }
}

fn command_vec(spec: &CommandSpec) -> Vec<String> {
    std::iter::once(spec.program.to_string_lossy().into_owned())
        .chain(spec.args.iter().map(|a| a.to_string_lossy().into_owned()))
        .collect()
}

/// Last lines of `text`, bounded by line count and then by characters.
pub fn tail_text(text: &str) -> String {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    let lines: Vec<&str> = trimmed.lines().collect();
    let start = lines.len().saturating_sub(TAIL_MAX_LINES);
    let tail = lines[start..].join("\n");
    let count = tail.chars().count();
    let tail: String = if count > TAIL_MAX_CHARS {
        tail.chars().skip(count - TAIL_MAX_CHARS).collect()
    } else {
        tail
    };
    tail.trim().to_string()
}

#[allow(clippy::too_many_arguments)]
fn direct_edit_log(
    provider: LlmProvider,
    attempt: u32,
    command: &[String],
    cwd: &Path,
    exit_code: i32,
    changed: &[String],
    error_message: &str,
    stdout_tail: &str,
    stderr_tail: &str,
) -> String {
    let mut lines = vec![
        format!("Provider: {provider}"),
        format!("Attempt: {attempt}"),
        format!("Command: {}", command.join(" ")),
        format!("CWD: {}", cwd.display()),
        format!("Exit Code: {exit_code}"),
        format!("Changed Files ({}):", changed.len()),
    ];
    lines.extend(changed.iter().map(|p| format!("- {p}")));
    if !error_message.is_empty() {
        lines.push(format!("Error: {error_message}"));
    }
    if !stdout_tail.is_empty() {
        lines.extend([String::new(), "STDOUT (tail):".to_string(), stdout_tail.to_string()]);
    }
    if !stderr_tail.is_empty() {
        lines.extend([String::new(), "STDERR (tail):".to_string(), stderr_tail.to_string()]);
    }
    lines.join("\n").trim().to_string()
}

/// One direct-edit attempt, flattened from its process outcome.
struct AttemptRun {
    ok: bool,
    exit_code: i32,
    error_message: String,
    stdout_tail: String,
    stderr_tail: String,
    /// A completed non-zero exit may be retried; launch failures may not.
    retryable: bool,
    timed_out: bool,
}

impl AttemptRun {
    fn from_outcome(provider: LlmProvider, outcome: ProcessOutcome) -> Self {
        let failed = |exit_code: i32, message: String| AttemptRun {
            ok: false,
            exit_code,
            error_message: message,
            stdout_tail: String::new(),
            stderr_tail: String::new(),
            retryable: false,
            timed_out: false,
        };
        match outcome {
            ProcessOutcome::Completed(out) => {
                let ok = out.success();
                let error_message = if ok {
                    String::new()
                } else {
                    exit_detail(provider, out.exit_code, &out.stdout, &out.stderr)
                };
                AttemptRun {
                    ok,
                    exit_code: out.exit_code,
                    error_message,
                    stdout_tail: tail_text(&out.stdout),
                    stderr_tail: tail_text(&out.stderr),
                    retryable: true,
                    timed_out: false,
                }
            }
            ProcessOutcome::SpawnFailed(e) => failed(-1, format!("Binary not found: {e}")),
            ProcessOutcome::WaitFailed(e) => failed(-1, e.to_string()),
            ProcessOutcome::TimedOut { after } => AttemptRun {
                timed_out: true,
                ..failed(
                    TIMEOUT_EXIT_CODE,
                    format!("{provider} timed out after {}s", after.as_secs()),
                )
            },
            ProcessOutcome::Cancelled => failed(-1, "cancelled".to_string()),
        }
    }
}

/// stderr (or stdout) tail of a failed run, or a generic exit message.
fn exit_detail(provider: LlmProvider, exit_code: i32, stdout: &str, stderr: &str) -> String {
    let detail = if stderr.trim().is_empty() {
        tail_text(stdout)
    } else {
        tail_text(stderr)
    };
    if detail.is_empty() {
        format!("{provider} exited with code {exit_code}")
    } else {
        detail
    }
}

#[async_trait]
impl LlmInvoker for CliLlmRunner {
    #[instrument(skip(self, prompt, cancel), fields(provider = %provider))]
    async fn run_structured_patch(
        &self,
        provider: LlmProvider,
        prompt: &str,
        timeout: Duration,
        model: Option<&str>,
        cancel: &CancellationToken,
    ) -> LlmCliResult {
        let spec = self.structured_command(provider, timeout, model).stdin(prompt);
        let command = command_vec(&spec);
        match run_process(&spec, cancel).await {
            ProcessOutcome::Completed(out) => {
                let ok = out.success();
                let error_message = if ok {
                    String::new()
                } else {
                    exit_detail(provider, out.exit_code, &out.stdout, &out.stderr)
                };
                if !ok {
                    warn!(exit_code = out.exit_code, "provider CLI failed");
                }
                LlmCliResult {
                    ok,
                    provider,
                    command,
                    exit_code: Some(out.exit_code),
                    stdout: out.stdout,
                    stderr: out.stderr,
                    error_message,
                    timed_out: false,
                    duration_ms: out.duration_ms,
                }
            }
            ProcessOutcome::SpawnFailed(e) => {
                warn!(error = %e, "provider CLI could not be started");
                LlmCliResult::failed(
                    provider,
                    command,
                    format!("{} could not be started: {e}", self.binary(provider).display()),
                )
            }
            ProcessOutcome::WaitFailed(e) => LlmCliResult::failed(provider, command, e.to_string()),
            ProcessOutcome::TimedOut { after } => {
                warn!(timeout_secs = after.as_secs(), "provider CLI timed out");
                LlmCliResult {
                    exit_code: Some(TIMEOUT_EXIT_CODE),
                    timed_out: true,
                    duration_ms: after.as_millis() as u64,
                    ..LlmCliResult::failed(
                        provider,
                        command,
                        format!("{provider} timed out after {}s", after.as_secs()),
                    )
                }
            }
            ProcessOutcome::Cancelled => LlmCliResult::failed(provider, command, "cancelled"),
        }
    }

    #[instrument(
        skip(self, prompt, cancel),
        fields(provider = %provider, workspace = %workspace.display())
    )]
    async fn run_direct_edit(
        &self,
        provider: LlmProvider,
        workspace: &Path,
        prompt: &str,
        timeout: Duration,
        model: Option<&str>,
        attempts: u32,
        cancel: &CancellationToken,
    ) -> LlmDirectEditResult {
        if !workspace.is_dir() {
            return LlmDirectEditResult::failed(
                provider,
                format!("Direct-edit working directory not found: {}", workspace.display()),
            );
        }
        let spec = self
            .direct_edit_command(provider, workspace, timeout, model)
            .stdin(prompt);
        let command = command_vec(&spec);
        let max_attempts = attempts.max(1);
        let mut result = LlmDirectEditResult::failed(provider, "provider was not run");

        for attempt in 1..=max_attempts {
            let before = match snapshot_tree(workspace) {
                Ok(s) => s,
                Err(e) => {
                    return LlmDirectEditResult::failed(provider, format!("snapshot failed: {e}"))
                }
            };
            let outcome = run_process(&spec, cancel).await;
            let after = match snapshot_tree(workspace) {
                Ok(s) => s,
                Err(e) => {
                    return LlmDirectEditResult::failed(provider, format!("snapshot failed: {e}"))
                }
            };
            let changed = changed_paths(&before, &after);

            let run = AttemptRun::from_outcome(provider, outcome);
            let AttemptRun {
                ok,
                exit_code,
                error_message,
                stdout_tail,
                stderr_tail,
                retryable,
                timed_out,
            } = run;

            let log_text = direct_edit_log(
                provider,
                attempt,
                &command,
                workspace,
                exit_code,
                &changed,
                &error_message,
                &stdout_tail,
                &stderr_tail,
            );
            let done = ok || !changed.is_empty() || !retryable;
            result = LlmDirectEditResult {
                ok,
                provider,
                command: command.clone(),
                attempts: attempt,
                changed_rel_paths: changed,
                error_message,
                stdout_tail,
                stderr_tail,
                log_text,
                timed_out,
            };
            if done {
                break;
            }
            debug!(attempt, "provider failed without edits, retrying");
        }
        result
    }

    fn is_available(&self, provider: LlmProvider) -> bool {
        which::which(self.binary(provider)).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(spec: &CommandSpec) -> Vec<String> {
        command_vec(spec)
    }

    #[test]
    fn test_codex_structured_command() {
        let runner = CliLlmRunner::default();
        let spec =
            runner.structured_command(LlmProvider::Codex, Duration::from_secs(5), Some("o4"));
        assert_eq!(
            strings(&spec),
            vec![
                "codex",
                "exec",
                "--ephemeral",
                "--color",
                "never",
                "--skip-git-repo-check",
                "--model",
                "o4",
                "-"
            ]
        );
        assert!(spec.env.contains(&("CI".to_string(), "1".to_string())));
        assert!(spec.env_remove.contains(&"CLAUDECODE".to_string()));
    }

    #[test]
    fn test_claude_direct_edit_command() {
        let runner = CliLlmRunner::new("codex", "/opt/bin/claude");
        let spec = runner.direct_edit_command(
            LlmProvider::Claude,
            Path::new("/tmp/ws"),
            Duration::from_secs(5),
            None,
        );
        assert_eq!(
            strings(&spec),
            vec![
                "/opt/bin/claude",
                "-p",
                "--output-format",
                "text",
                "--permission-mode",
                "bypassPermissions",
                "--allowedTools",
                "Read,Write,Edit"
            ]
        );
        assert_eq!(spec.cwd.as_deref(), Some(Path::new("/tmp/ws")));
    }

    #[test]
    fn test_codex_direct_edit_command_sets_cd() {
        let runner = CliLlmRunner::default();
        let spec = runner.direct_edit_command(
            LlmProvider::Codex,
            Path::new("/tmp/ws"),
            Duration::from_secs(5),
            Some("  "),
        );
        let args = strings(&spec);
        assert!(args.contains(&"--full-auto".to_string()));
        assert!(!args.contains(&"--model".to_string()));
        assert_eq!(&args[args.len() - 3..], ["--cd", "/tmp/ws", "-"]);
    }

    #[test]
    fn test_tail_text_bounds() {
        let text = (0..200).map(|i| format!("line {i}")).collect::<Vec<_>>().join("\n");
        let tail = tail_text(&text);
        assert_eq!(tail.lines().count(), TAIL_MAX_LINES);
        assert!(tail.ends_with("line 199"));
        let wide = "x".repeat(TAIL_MAX_CHARS * 2);
        assert_eq!(tail_text(&wide).len(), TAIL_MAX_CHARS);
        assert_eq!(tail_text("  \n "), "");
    }

    #[test]
    fn test_direct_edit_log_layout() {
        let log = direct_edit_log(
            LlmProvider::Codex,
            1,
            &["codex".to_string(), "exec".to_string()],
            Path::new("/ws"),
            0,
            &["values.yaml".to_string()],
            "",
            "done",
            "",
        );
        assert!(log.starts_with(
            "Provider: codex\nAttempt: 1\nCommand: codex exec\nCWD: /ws\nExit Code: 0"
        ));
        assert!(log.contains("Changed Files (1):\n- values.yaml"));
        assert!(log.ends_with("STDOUT (tail):\ndone"));
    }

    #[tokio::test]
    async fn test_missing_binary_is_reported_not_raised() {
        let runner = CliLlmRunner::new("/nonexistent/codex", "/nonexistent/claude");
        let r = runner
            .run_structured_patch(
                LlmProvider::Codex,
                "prompt",
                Duration::from_secs(1),
                None,
                &CancellationToken::new(),
            )
            .await;
        assert!(!r.ok);
        assert_eq!(r.exit_code, None);
        assert!(r.error_message.contains("could not be started"));
        assert!(!runner.is_available(LlmProvider::Codex));
    }
}
