//! Shared fixtures: chart builders, a values-driven renderer and a scripted
//! LLM invoker.

#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use chartmend_core::llm::{LlmCliResult, LlmDirectEditResult, LlmInvoker, LlmProvider};
use chartmend_core::render::{ChartRenderer, RenderErrorKind, RenderResult};

pub const DEPLOYMENT_TEMPLATE: &str = "apiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: {{ .Chart.Name }}\nspec:\n  replicas: {{ .Values.replicaCount }}\n";

/// Write a minimal chart named `name` under `root` and return its directory.
pub fn write_chart(root: &Path, name: &str, values_yaml: &str) -> PathBuf {
    let dir = root.join(name);
    fs::create_dir_all(dir.join("templates")).unwrap();
    fs::write(
        dir.join("Chart.yaml"),
        format!("apiVersion: v2\nname: {name}\nversion: 0.1.0\n"),
    )
    .unwrap();
    fs::write(dir.join("values.yaml"), values_yaml).unwrap();
    fs::write(dir.join("templates/deployment.yaml"), DEPLOYMENT_TEMPLATE).unwrap();
    dir
}

pub fn values_with_cpu(limit: &str) -> String {
    format!(
        "replicaCount: 2\nresources:\n  requests:\n    cpu: 100m\n    memory: 128Mi\n  limits:\n    cpu: {limit}\n    memory: 128Mi\n"
    )
}

/// A `full_fix_response.v1` document that addresses `rule_ids`.
pub fn full_fix_json(values_patch: Value, rule_ids: &[&str]) -> String {
    let coverage: Vec<Value> = rule_ids
        .iter()
        .map(|id| json!({"rule_id": id, "status": "addressed", "note": "fixed"}))
        .collect();
    json!({
        "schema_version": "full_fix_response.v1",
        "result": "ok",
        "summary": "Adjusted resources.",
        "values_patch": values_patch,
        "template_patches": [],
        "violation_coverage": coverage,
        "warnings": [],
        "error": ""
    })
    .to_string()
}

// ---------------------------------------------------------------------------
// Renderer
// ---------------------------------------------------------------------------

/// Renders one Deployment straight from the values file, the way a simple
/// chart template would.
#[derive(Default)]
pub struct ValuesRenderer {
    pub fail_with: Option<RenderErrorKind>,
    pub parent_only: bool,
    pub calls: AtomicUsize,
}

impl ValuesRenderer {
    pub fn failing(kind: RenderErrorKind) -> Self {
        Self {
            fail_with: Some(kind),
            ..Self::default()
        }
    }
}

#[async_trait]
impl ChartRenderer for ValuesRenderer {
    async fn render(
        &self,
        chart_dir: &Path,
        values_file: &Path,
        _timeout: Duration,
    ) -> RenderResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(kind) = self.fail_with {
            return RenderResult::failure(chart_dir, values_file, kind, "scripted failure");
        }
        let values: serde_yaml::Value =
            serde_yaml::from_str(&fs::read_to_string(values_file).unwrap()).unwrap();
        let values = serde_json::to_value(&values).unwrap();
        let name = chart_dir.file_name().unwrap().to_string_lossy().into_owned();
        let doc = json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {"name": name},
            "spec": {
                "replicas": values.get("replicaCount").cloned().unwrap_or(json!(1)),
                "template": {
                    "metadata": {"labels": {"app": name}},
                    "spec": {
                        "containers": [{
                            "name": "app",
                            "resources": values.get("resources").cloned().unwrap_or(json!({})),
                        }]
                    }
                }
            }
        });
        let doc: serde_yaml::Value = serde_yaml::to_value(&doc).unwrap();
        let mut result = RenderResult::from_docs(chart_dir, values_file, vec![doc]);
        result.parent_only_render = self.parent_only;
        result.parent_only_render_attempted = self.parent_only;
        result
    }
}

// ---------------------------------------------------------------------------
// LLM
// ---------------------------------------------------------------------------

type EditFn = dyn Fn(&Path) + Send + Sync;

/// Scripted provider answers, with an in-flight counter for concurrency
/// assertions.
#[derive(Default)]
pub struct ScriptedLlm {
    /// stdout per provider; `Err` makes the run fail with that message.
    pub answers: HashMap<LlmProvider, Result<String, String>>,
    pub unavailable: HashSet<LlmProvider>,
    pub edit: Option<Arc<EditFn>>,
    pub delay: Duration,
    pub prompts: Mutex<Vec<(LlmProvider, String)>>,
    in_flight: AtomicUsize,
    pub peak: AtomicUsize,
}

impl ScriptedLlm {
    pub fn answering(provider: LlmProvider, stdout: impl Into<String>) -> Self {
        let mut llm = Self::default();
        llm.answers.insert(provider, Ok(stdout.into()));
        llm
    }

    pub fn with_answer(mut self, provider: LlmProvider, answer: Result<String, String>) -> Self {
        self.answers.insert(provider, answer);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_edit(mut self, edit: impl Fn(&Path) + Send + Sync + 'static) -> Self {
        self.edit = Some(Arc::new(edit));
        self
    }

    pub fn calls(&self) -> Vec<LlmProvider> {
        self.prompts.lock().unwrap().iter().map(|(p, _)| *p).collect()
    }

    async fn enter(&self, provider: LlmProvider, prompt: &str, cancel: &CancellationToken) -> bool {
        self.prompts
            .lock()
            .unwrap()
            .push((provider, prompt.to_string()));
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let cancelled = tokio::select! {
            _ = tokio::time::sleep(self.delay) => false,
            _ = cancel.cancelled() => true,
        };
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        !cancelled
    }
}

#[async_trait]
impl LlmInvoker for ScriptedLlm {
    async fn run_structured_patch(
        &self,
        provider: LlmProvider,
        prompt: &str,
        _timeout: Duration,
        _model: Option<&str>,
        cancel: &CancellationToken,
    ) -> LlmCliResult {
        let command = vec![provider.to_string()];
        if !self.enter(provider, prompt, cancel).await {
            return LlmCliResult::failed(provider, command, "cancelled");
        }
        match self.answers.get(&provider) {
            Some(Ok(stdout)) => LlmCliResult {
                ok: true,
                provider,
                command,
                exit_code: Some(0),
                stdout: stdout.clone(),
                stderr: String::new(),
                error_message: String::new(),
                timed_out: false,
                duration_ms: self.delay.as_millis() as u64,
            },
            Some(Err(message)) => LlmCliResult {
                exit_code: Some(1),
                ..LlmCliResult::failed(provider, command, message.clone())
            },
            None => LlmCliResult::failed(provider, command, "no scripted answer"),
        }
    }

    async fn run_direct_edit(
        &self,
        provider: LlmProvider,
        workspace: &Path,
        prompt: &str,
        _timeout: Duration,
        _model: Option<&str>,
        _attempts: u32,
        cancel: &CancellationToken,
    ) -> LlmDirectEditResult {
        if !self.enter(provider, prompt, cancel).await {
            return LlmDirectEditResult::failed(provider, "cancelled");
        }
        if let Some(Err(message)) = self.answers.get(&provider) {
            return LlmDirectEditResult::failed(provider, message.clone());
        }
        if let Some(edit) = &self.edit {
            edit(workspace);
        }
        LlmDirectEditResult {
            ok: true,
            provider,
            command: vec![provider.to_string()],
            attempts: 1,
            changed_rel_paths: Vec::new(),
            error_message: String::new(),
            stdout_tail: String::new(),
            stderr_tail: String::new(),
            log_text: format!("Provider: {provider}"),
            timed_out: false,
        }
    }

    fn is_available(&self, provider: LlmProvider) -> bool {
        !self.unavailable.contains(&provider)
    }
}

// ---------------------------------------------------------------------------
// Fake binaries
// ---------------------------------------------------------------------------

/// Write an executable `/bin/sh` script named `name` into `dir`.
#[cfg(unix)]
pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;
    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}
