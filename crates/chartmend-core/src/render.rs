//! Chart rendering through `helm template`.
//!
//! [`ChartRenderer`] is the seam the verifier and analyzer depend on;
//! [`HelmRenderer`] is the production implementation. Render problems are
//! reported as data in [`RenderResult`], never as `Err`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::config::OptimizerSettings;
use crate::process::{run_process, CommandSpec, ProcessOutcome};
use crate::tree::copy_tree;

/// stderr fragments helm prints when declared sub-charts are not vendored.
const MISSING_DEPENDENCY_MARKERS: [&str; 3] = [
    "missing in charts/",
    "found in Chart.yaml, but missing in charts/",
    "dependencies are missing",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RenderErrorKind {
    HelmMissing,
    ValuesMissing,
    Timeout,
    Cancelled,
    RenderFailed,
    ParseError,
    ParentRenderFailed,
    ParentRenderSetupFailed,
}

impl RenderErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RenderErrorKind::HelmMissing => "helm_missing",
            RenderErrorKind::ValuesMissing => "values_missing",
            RenderErrorKind::Timeout => "timeout",
            RenderErrorKind::Cancelled => "cancelled",
            RenderErrorKind::RenderFailed => "render_failed",
            RenderErrorKind::ParseError => "parse_error",
            RenderErrorKind::ParentRenderFailed => "parent_render_failed",
            RenderErrorKind::ParentRenderSetupFailed => "parent_render_setup_failed",
        }
    }

    /// Failure came from the parent-chart-only fallback.
    pub fn is_parent_only(self) -> bool {
        matches!(
            self,
            RenderErrorKind::ParentRenderFailed | RenderErrorKind::ParentRenderSetupFailed
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderResult {
    pub ok: bool,
    pub chart_dir: PathBuf,
    pub values_file: PathBuf,
    /// Non-empty rendered documents in output order.
    pub docs: Vec<serde_yaml::Value>,
    pub stdout: String,
    pub stderr: String,
    pub error_kind: Option<RenderErrorKind>,
    pub error_message: Option<String>,
    pub parent_only_render_attempted: bool,
    /// Rendered with sub-chart dependencies stripped.
    pub parent_only_render: bool,
}

impl RenderResult {
    fn new(chart_dir: &Path, values_file: &Path) -> Self {
        Self {
            ok: false,
            chart_dir: chart_dir.to_path_buf(),
            values_file: values_file.to_path_buf(),
            docs: Vec::new(),
            stdout: String::new(),
            stderr: String::new(),
            error_kind: None,
            error_message: None,
            parent_only_render_attempted: false,
            parent_only_render: false,
        }
    }

    fn failed(mut self, kind: RenderErrorKind, message: impl Into<String>) -> Self {
        self.ok = false;
        self.error_kind = Some(kind);
        self.error_message = Some(message.into());
        self
    }

    /// Successful result built from already-parsed documents.
    pub fn from_docs(chart_dir: &Path, values_file: &Path, docs: Vec<serde_yaml::Value>) -> Self {
        Self {
            ok: true,
            docs,
            ..Self::new(chart_dir, values_file)
        }
    }

    /// Failed result with the given kind.
    pub fn failure(
        chart_dir: &Path,
        values_file: &Path,
        kind: RenderErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self::new(chart_dir, values_file).failed(kind, message)
    }

    /// `kind: message` for operator-facing notes.
    pub fn error_summary(&self) -> String {
        match (&self.error_kind, &self.error_message) {
            (Some(kind), Some(msg)) if !msg.trim().is_empty() => {
                format!("{}: {}", kind.as_str(), msg.trim())
            }
            (Some(kind), _) => kind.as_str().to_string(),
            (None, Some(msg)) => msg.clone(),
            (None, None) => "unknown render error".to_string(),
        }
    }
}

/// Split multi-document YAML, dropping empty documents.
pub fn parse_documents(stdout: &str) -> Result<Vec<serde_yaml::Value>, serde_yaml::Error> {
    use serde::Deserialize as _;
    let mut docs = Vec::new();
    for document in serde_yaml::Deserializer::from_str(stdout) {
        let value = serde_yaml::Value::deserialize(document)?;
        if !value.is_null() {
            docs.push(value);
        }
    }
    Ok(docs)
}

#[async_trait]
pub trait ChartRenderer: Send + Sync {
    /// Render `chart_dir` with `values_file`, bounded by `timeout`.
    async fn render(&self, chart_dir: &Path, values_file: &Path, timeout: Duration) -> RenderResult;
}

/// Renders charts by invoking the `helm` CLI.
#[derive(Debug, Clone)]
pub struct HelmRenderer {
    helm_binary: PathBuf,
    cancel: CancellationToken,
}

impl HelmRenderer {
    pub fn new(helm_binary: impl Into<PathBuf>) -> Self {
        Self {
            helm_binary: helm_binary.into(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn from_settings(settings: &OptimizerSettings) -> Self {
        Self::new(&settings.helm_binary)
    }

    /// Abort in-flight renders when `cancel` fires.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    async fn run_template(
        &self,
        chart_dir: &Path,
        values_file: &Path,
        timeout: Duration,
    ) -> RenderResult {
        let result = RenderResult::new(chart_dir, values_file);
        let spec = CommandSpec::new(&self.helm_binary, timeout)
            .arg("template")
            .arg(chart_dir.as_os_str())
            .arg("--values")
            .arg(values_file.as_os_str());

        let output = match run_process(&spec, &self.cancel).await {
            ProcessOutcome::Completed(output) => output,
            ProcessOutcome::SpawnFailed(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return result.failed(
                    RenderErrorKind::HelmMissing,
                    format!("{} not found", self.helm_binary.display()),
                );
            }
            ProcessOutcome::SpawnFailed(e) | ProcessOutcome::WaitFailed(e) => {
                return result.failed(RenderErrorKind::RenderFailed, e.to_string());
            }
            ProcessOutcome::TimedOut { after } => {
                return result.failed(
                    RenderErrorKind::Timeout,
                    format!("helm template timed out after {}s", after.as_secs()),
                );
            }
            ProcessOutcome::Cancelled => {
                return result.failed(RenderErrorKind::Cancelled, "render cancelled");
            }
        };

        let (success, exit_code) = (output.success(), output.exit_code);
        let mut result = RenderResult {
            stdout: output.stdout,
            stderr: output.stderr,
            ..result
        };
        if !success {
            let message = first_line(&result.stderr)
                .unwrap_or_else(|| format!("helm exited with code {exit_code}"));
            return result.failed(RenderErrorKind::RenderFailed, message);
        }
        match parse_documents(&result.stdout) {
            Ok(docs) => {
                result.ok = true;
                result.docs = docs;
                result
            }
            Err(e) => result.failed(RenderErrorKind::ParseError, e.to_string()),
        }
    }

    /// Render a temporary copy with `dependencies` stripped from Chart.yaml.
    async fn render_parent_only(
        &self,
        chart_dir: &Path,
        values_file: &Path,
        timeout: Duration,
    ) -> RenderResult {
        let setup = || -> std::io::Result<(tempfile::TempDir, PathBuf, PathBuf)> {
            let workspace = tempfile::Builder::new()
                .prefix("chartmend-parent-render-")
                .tempdir()?;
            let name = chart_dir
                .file_name()
                .map(|n| n.to_os_string())
                .unwrap_or_else(|| "chart".into());
            let copy = workspace.path().join(name);
            copy_tree(chart_dir, &copy)?;
            strip_dependencies(&copy.join("Chart.yaml"))?;
            let lock = copy.join("Chart.lock");
            if lock.exists() {
                std::fs::remove_file(lock)?;
            }
            let values = match values_file.strip_prefix(chart_dir) {
                Ok(rel) => copy.join(rel),
                Err(_) => values_file.to_path_buf(),
            };
            Ok((workspace, copy, values))
        };

        let (_workspace, copy, copied_values) = match setup() {
            Ok(parts) => parts,
            Err(e) => {
                return RenderResult::failure(
                    chart_dir,
                    values_file,
                    RenderErrorKind::ParentRenderSetupFailed,
                    e.to_string(),
                )
            }
        };

        let rendered = self.run_template(&copy, &copied_values, timeout).await;
        let mut result = RenderResult {
            chart_dir: chart_dir.to_path_buf(),
            values_file: values_file.to_path_buf(),
            parent_only_render_attempted: true,
            ..rendered
        };
        if result.ok {
            result.parent_only_render = true;
        } else if result.error_kind != Some(RenderErrorKind::Timeout)
            && result.error_kind != Some(RenderErrorKind::Cancelled)
        {
            result.error_kind = Some(RenderErrorKind::ParentRenderFailed);
        }
        result
    }
}

#[async_trait]
impl ChartRenderer for HelmRenderer {
    #[instrument(skip(self), fields(chart = %chart_dir.display()))]
    async fn render(
        &self,
        chart_dir: &Path,
        values_file: &Path,
        timeout: Duration,
    ) -> RenderResult {
        if !values_file.is_file() {
            return RenderResult::failure(
                chart_dir,
                values_file,
                RenderErrorKind::ValuesMissing,
                format!("values file not found: {}", values_file.display()),
            );
        }

        let result = self.run_template(chart_dir, values_file, timeout).await;
        let missing_deps = result.error_kind == Some(RenderErrorKind::RenderFailed)
            && MISSING_DEPENDENCY_MARKERS
                .iter()
                .any(|m| result.stderr.contains(m));
        if !missing_deps {
            if let Some(kind) = result.error_kind {
                warn!(kind = kind.as_str(), "helm template failed");
            }
            return result;
        }

        debug!("sub-chart dependencies missing, retrying parent chart only");
        let fallback = self.render_parent_only(chart_dir, values_file, timeout).await;
        if !fallback.ok {
            warn!(error = %fallback.error_summary(), "parent-only render failed");
        }
        fallback
    }
}

fn first_line(text: &str) -> Option<String> {
    text.lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .map(str::to_string)
}

fn strip_dependencies(chart_yaml: &Path) -> std::io::Result<()> {
    let text = std::fs::read_to_string(chart_yaml)?;
    let mut meta: serde_yaml::Value =
        serde_yaml::from_str(&text).map_err(std::io::Error::other)?;
    if let Some(map) = meta.as_mapping_mut() {
        map.remove("dependencies");
    }
    let out = serde_yaml::to_string(&meta).map_err(std::io::Error::other)?;
    std::fs::write(chart_yaml, out)
}
