//! AI remediation attempts.
//!
//! One attempt walks `Prompting → RunningCli → Parsing → Staging` and ends in
//! `Done` or `Failed`. Providers are tried in the configured order until one
//! CLI run succeeds; the winning answer is staged into a private workspace
//! and handed back for verification.

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use serde_json::{Map, Value};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

use crate::config::{FixMode, OptimizerSettings};
use crate::domain::{AnalysisSource, ChartInfo, Violation};
use crate::llm::{LlmInvoker, LlmProvider};
use crate::obs;
use crate::protocol::{
    build_direct_edit_prompt, build_full_fix_prompt, build_structured_patch_prompt,
    check_coverage, parse_full_fix, parse_structured_patch, CoverageRecord, CoverageStatus,
    FullFixPromptInput, FullFixResponse, PatchResult, StructuredPatchResponse,
};
use crate::render::ChartRenderer;
use crate::rules::{FixOptions, RulesEngine};
use crate::staging::{template_files, SourceGuard, StagedArtifact};
use crate::values::merge_json_overlay;

/// Kinds worth showing the model from a rendered chart.
const EXCERPT_KINDS: [&str; 7] = [
    "Deployment",
    "StatefulSet",
    "DaemonSet",
    "ReplicaSet",
    "Job",
    "CronJob",
    "PodDisruptionBudget",
];
const EXCERPT_MAX_CHARS: usize = 6000;

// ---------------------------------------------------------------------------
// Attempt state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptState {
    Prompting,
    RunningCli,
    Parsing,
    Staging,
    Done,
    Failed,
}

impl AttemptState {
    pub fn as_str(self) -> &'static str {
        match self {
            AttemptState::Prompting => "prompting",
            AttemptState::RunningCli => "running_cli",
            AttemptState::Parsing => "parsing",
            AttemptState::Staging => "staging",
            AttemptState::Done => "done",
            AttemptState::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, AttemptState::Done | AttemptState::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Transition {
    pub from: AttemptState,
    pub to: AttemptState,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FixStatus {
    Ok,
    NoChange,
    Error,
}

impl FixStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            FixStatus::Ok => "ok",
            FixStatus::NoChange => "no_change",
            FixStatus::Error => "error",
        }
    }
}

/// Outcome of one remediation attempt for one chart.
#[derive(Debug, Serialize)]
pub struct AiFullFixResult {
    /// `true` for `ok` and `no_change`.
    pub ok: bool,
    pub status: FixStatus,
    pub attempt_id: Uuid,
    pub chart_name: String,
    pub provider: Option<LlmProvider>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub prompt: String,
    pub response: Option<FullFixResponse>,
    pub note: String,
    pub tried_providers: Vec<LlmProvider>,
    pub errors: Vec<String>,
    /// Unparsed provider output, kept when parsing or coverage fails.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub raw_output_text: String,
    /// Staged workspace; dropping the result discards it.
    #[serde(skip)]
    pub staged_artifact: Option<StagedArtifact>,
    pub transitions: Vec<Transition>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl AiFullFixResult {
    pub fn is_staged(&self) -> bool {
        self.staged_artifact
            .as_ref()
            .is_some_and(StagedArtifact::has_changes)
    }
}

/// Book-keeping for one attempt; consumed into an [`AiFullFixResult`].
struct Attempt {
    id: Uuid,
    chart_name: String,
    state: AttemptState,
    transitions: Vec<Transition>,
    started: Instant,
    started_at: DateTime<Utc>,
    prompt: String,
    tried: Vec<LlmProvider>,
    errors: Vec<String>,
    raw_output: String,
}

impl Attempt {
    fn begin(chart_name: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            chart_name: chart_name.to_string(),
            state: AttemptState::Prompting,
            transitions: Vec::new(),
            started: Instant::now(),
            started_at: Utc::now(),
            prompt: String::new(),
            tried: Vec::new(),
            errors: Vec::new(),
            raw_output: String::new(),
        }
    }

    fn advance(&mut self, to: AttemptState) {
        if self.state == to || self.state.is_terminal() {
            return;
        }
        obs::emit_fix_transition(&self.id.to_string(), self.state.as_str(), to.as_str());
        self.transitions.push(Transition {
            from: self.state,
            to,
            at: Utc::now(),
        });
        self.state = to;
    }

    fn provider_failed(&mut self, provider: LlmProvider, message: impl std::fmt::Display) {
        obs::emit_provider_failed(&self.id.to_string(), provider.as_str(), &message);
        self.errors.push(format!("{provider}: {message}"));
    }

    fn fail(self, note: impl Into<String>) -> AiFullFixResult {
        self.finish(FixStatus::Error, None, None, None, note)
    }

    fn finish(
        mut self,
        status: FixStatus,
        provider: Option<LlmProvider>,
        response: Option<FullFixResponse>,
        staged_artifact: Option<StagedArtifact>,
        note: impl Into<String>,
    ) -> AiFullFixResult {
        let terminal = if status == FixStatus::Error {
            AttemptState::Failed
        } else {
            AttemptState::Done
        };
        self.advance(terminal);
        let note = note.into();
        obs::emit_fix_finished(
            &self.id.to_string(),
            status.as_str(),
            provider.map(LlmProvider::as_str),
            self.started.elapsed().as_millis() as u64,
        );
        if status == FixStatus::Error {
            warn!(chart = %self.chart_name, note = %note, "fix attempt failed");
        }
        AiFullFixResult {
            ok: status != FixStatus::Error,
            status,
            attempt_id: self.id,
            chart_name: self.chart_name,
            provider,
            prompt: self.prompt,
            response,
            note,
            tried_providers: self.tried,
            errors: self.errors,
            raw_output_text: self.raw_output,
            staged_artifact,
            transitions: self.transitions,
            started_at: self.started_at,
            finished_at: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Batch types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct FixRequest {
    pub chart: ChartInfo,
    pub violations: Vec<Violation>,
}

#[derive(Debug)]
pub struct BatchOutcome {
    /// Finished attempts, in request order.
    pub results: Vec<AiFullFixResult>,
    /// Charts whose attempt never started because the batch was cancelled.
    pub not_started: Vec<String>,
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

pub struct AiFixOrchestrator {
    engine: Arc<RulesEngine>,
    llm: Arc<dyn LlmInvoker>,
    renderer: Option<Arc<dyn ChartRenderer>>,
}

impl AiFixOrchestrator {
    pub fn new(engine: Arc<RulesEngine>, llm: Arc<dyn LlmInvoker>) -> Self {
        Self {
            engine,
            llm,
            renderer: None,
        }
    }

    /// Include a rendered excerpt in prompts for charts analyzed from a render.
    pub fn with_renderer(mut self, renderer: Arc<dyn ChartRenderer>) -> Self {
        self.renderer = Some(renderer);
        self
    }

    /// Overlay of every deterministic rule fix for `violations`.
    pub fn seed_patch(
        &self,
        chart: &ChartInfo,
        violations: &[Violation],
        options: &FixOptions,
    ) -> Map<String, Value> {
        let mut seed = Map::new();
        for violation in violations {
            if let Some(Value::Object(fix)) = self.engine.generate_fix(chart, violation, options) {
                merge_json_overlay(&mut seed, &fix);
            }
        }
        seed
    }

    /// Run one remediation attempt for `chart`.
    pub async fn generate_full_fix(
        &self,
        chart: &ChartInfo,
        violations: &[Violation],
        settings: &OptimizerSettings,
        cancel: &CancellationToken,
    ) -> AiFullFixResult {
        let attempt = Attempt::begin(&chart.name);
        let span = obs::attempt_span(&attempt.id.to_string(), &chart.name);
        self.run_attempt(attempt, chart, violations, settings, cancel)
            .instrument(span)
            .await
    }

    async fn run_attempt(
        &self,
        mut attempt: Attempt,
        chart: &ChartInfo,
        violations: &[Violation],
        settings: &OptimizerSettings,
        cancel: &CancellationToken,
    ) -> AiFullFixResult {
        let providers = settings.provider_chain();
        obs::emit_fix_started(
            &attempt.id.to_string(),
            &chart.name,
            violations.len(),
            &providers.iter().map(|p| p.to_string()).collect::<Vec<_>>(),
        );

        if let Err(note) = check_preconditions(chart, violations) {
            return attempt.fail(note);
        }
        let rel_values_path = match chart.rel_values_path() {
            Ok(rel) => rel,
            Err(e) => return attempt.fail(e.to_string()),
        };
        let values_text = match fs::read_to_string(&chart.values_file) {
            Ok(text) => text,
            Err(e) => return attempt.fail(format!("Failed to read values file: {e}")),
        };

        let seed = self.seed_patch(chart, violations, &settings.fix_options);
        let excerpt = self.rendered_excerpt(chart, settings).await;
        let templates = template_files(&chart.chart_dir);
        let input = FullFixPromptInput {
            chart_name: &chart.name,
            rel_values_path: &rel_values_path,
            values_text: &values_text,
            rendered_excerpt: excerpt.as_deref(),
            violations,
            seed_patch: &seed,
            template_files: &templates,
            retry_error: "",
            system_prompt: &settings.ai_fix_full_fix_system_prompt,
        };

        match settings.ai_fix_mode {
            FixMode::Structured => {
                attempt.prompt = build_full_fix_prompt(&input);
                self.run_structured(attempt, chart, violations, &providers, settings, cancel)
                    .await
            }
            FixMode::DirectEdit => {
                attempt.prompt = build_direct_edit_prompt(&input);
                self.run_direct_edit(attempt, chart, violations, &providers, settings, cancel)
                    .await
            }
        }
    }

    async fn run_structured(
        &self,
        mut attempt: Attempt,
        chart: &ChartInfo,
        violations: &[Violation],
        providers: &[LlmProvider],
        settings: &OptimizerSettings,
        cancel: &CancellationToken,
    ) -> AiFullFixResult {
        attempt.advance(AttemptState::RunningCli);
        let mut winner = None;
        for &provider in providers {
            if cancel.is_cancelled() {
                return attempt.fail("Cancelled before a provider succeeded.");
            }
            attempt.tried.push(provider);
            let model = settings.model_for(provider);
            let run = self
                .llm
                .run_structured_patch(
                    provider,
                    &attempt.prompt,
                    settings.ai_fix_timeout(),
                    model.as_deref(),
                    cancel,
                )
                .await;
            if run.ok {
                debug!(%provider, duration_ms = run.duration_ms, "provider answered");
                winner = Some((provider, run));
                break;
            }
            let message = if run.error_message.is_empty() {
                format!("exit code {:?}", run.exit_code)
            } else {
                run.error_message.clone()
            };
            attempt.provider_failed(provider, message);
        }
        let Some((provider, run)) = winner else {
            let note = format!("All providers failed: {}", attempt.errors.join("; "));
            return attempt.fail(note);
        };

        attempt.advance(AttemptState::Parsing);
        let response = match parse_full_fix(&run.stdout) {
            Ok(response) => response,
            Err(e) => {
                attempt.raw_output = run.stdout;
                return attempt.fail(format!("Invalid full-fix response from {provider}: {e}"));
            }
        };
        if response.result != PatchResult::Error {
            let expected = violations.iter().map(|v| v.rule_id.as_str());
            if let Err(e) = check_coverage(&response, expected) {
                attempt.raw_output = run.stdout;
                return attempt.fail(format!("Response from {provider} rejected: {e}"));
            }
        }

        match response.result {
            PatchResult::NoChange => {
                let note = format!("{provider} reported no change: {}", response.summary);
                return attempt.finish(
                    FixStatus::NoChange,
                    Some(provider),
                    Some(response),
                    None,
                    note,
                );
            }
            PatchResult::Error => {
                let note = format!("{provider} returned an error: {}", response.error);
                attempt.errors.push(note.clone());
                return attempt.finish(FixStatus::Error, Some(provider), Some(response), None, note);
            }
            PatchResult::Ok => {}
        }

        attempt.advance(AttemptState::Staging);
        let mut artifact = match StagedArtifact::create(&chart.chart_dir, &chart.values_file) {
            Ok(artifact) => artifact,
            Err(e) => return attempt.fail(format!("Failed to stage workspace: {e}")),
        };
        if let Err(e) = artifact.apply_response(&response) {
            attempt.raw_output = run.stdout;
            return attempt.fail(format!("Failed to stage response from {provider}: {e}"));
        }
        artifact.provider = Some(provider);
        artifact.execution_log = format!(
            "Command: {}\nExit code: {:?}\nDuration: {}ms\n\nStderr:\n{}",
            run.command.join(" "),
            run.exit_code,
            run.duration_ms,
            run.stderr.trim(),
        );

        if !artifact.has_changes() {
            let note = format!("{provider} proposed changes that leave the chart unchanged.");
            return attempt.finish(FixStatus::NoChange, Some(provider), Some(response), None, note);
        }
        info!(%provider, changed = artifact.changed_rel_paths.len(), "full fix staged");
        let note = format!("Full fix generated using `{provider}`.");
        attempt.finish(FixStatus::Ok, Some(provider), Some(response), Some(artifact), note)
    }

    async fn run_direct_edit(
        &self,
        mut attempt: Attempt,
        chart: &ChartInfo,
        violations: &[Violation],
        providers: &[LlmProvider],
        settings: &OptimizerSettings,
        cancel: &CancellationToken,
    ) -> AiFullFixResult {
        attempt.advance(AttemptState::RunningCli);
        let mut staged = None;
        for &provider in providers {
            if cancel.is_cancelled() {
                return attempt.fail("Cancelled before a provider succeeded.");
            }
            attempt.tried.push(provider);
            if !self.llm.is_available(provider) {
                attempt.provider_failed(
                    provider,
                    "direct-edit backend unavailable, skipping provider",
                );
                continue;
            }

            let mut artifact = match StagedArtifact::create(&chart.chart_dir, &chart.values_file) {
                Ok(artifact) => artifact,
                Err(e) => return attempt.fail(format!("Failed to stage workspace: {e}")),
            };
            let guard = match SourceGuard::capture(&chart.chart_dir) {
                Ok(guard) => guard,
                Err(e) => return attempt.fail(format!("Failed to snapshot source chart: {e}")),
            };

            let model = settings.model_for(provider);
            let run = self
                .llm
                .run_direct_edit(
                    provider,
                    &artifact.staged_chart_dir,
                    &attempt.prompt,
                    settings.ai_fix_timeout(),
                    model.as_deref(),
                    settings.ai_fix_direct_edit_attempts,
                    cancel,
                )
                .await;

            if let Err(e) = guard.verify_untouched() {
                attempt.provider_failed(provider, e);
                continue;
            }
            if !run.ok {
                attempt.provider_failed(provider, &run.error_message);
                continue;
            }
            match artifact.collect_direct_edits() {
                Ok(discarded) => {
                    if !discarded.is_empty() {
                        attempt.errors.push(format!(
                            "{provider}: discarded out-of-scope edits: {}",
                            discarded.join(", ")
                        ));
                    }
                }
                Err(e) => {
                    attempt.provider_failed(provider, e);
                    continue;
                }
            }
            artifact.provider = Some(provider);
            artifact.execution_log = format!(
                "{}\n\nStaged workspace: {}",
                run.log_text,
                artifact.staged_chart_dir.display()
            );
            staged = Some((provider, artifact));
            break;
        }
        let Some((provider, artifact)) = staged else {
            let note = format!("All providers failed: {}", attempt.errors.join("; "));
            return attempt.fail(note);
        };

        attempt.advance(AttemptState::Parsing);
        let response = match artifact.derive_response(
            violations,
            format!("Direct edit by {provider} in staged workspace."),
        ) {
            Ok(response) => response,
            Err(e) => return attempt.fail(format!("Failed to read staged edits: {e}")),
        };

        attempt.advance(AttemptState::Staging);
        if !artifact.has_changes() {
            let note = format!("{provider} made no in-scope changes.");
            return attempt.finish(FixStatus::NoChange, Some(provider), Some(response), None, note);
        }
        let note = format!("Direct-edit full fix generated using `{provider}`.");
        attempt.finish(FixStatus::Ok, Some(provider), Some(response), Some(artifact), note)
    }

    async fn rendered_excerpt(
        &self,
        chart: &ChartInfo,
        settings: &OptimizerSettings,
    ) -> Option<String> {
        if chart.analysis_source != AnalysisSource::Rendered {
            return None;
        }
        let renderer = self.renderer.as_ref()?;
        let rendered = renderer
            .render(&chart.chart_dir, &chart.values_file, settings.helm_timeout())
            .await;
        if !rendered.ok {
            debug!(chart = %chart.name, error = %rendered.error_summary(), "no rendered excerpt");
            return None;
        }
        let mut excerpt = String::new();
        for doc in &rendered.docs {
            let kind = doc.get("kind").and_then(serde_yaml::Value::as_str);
            if !kind.is_some_and(|k| EXCERPT_KINDS.contains(&k)) {
                continue;
            }
            if let Ok(text) = serde_yaml::to_string(doc) {
                excerpt.push_str("---\n");
                excerpt.push_str(&text);
            }
        }
        if excerpt.is_empty() {
            return None;
        }
        if excerpt.chars().count() > EXCERPT_MAX_CHARS {
            excerpt = excerpt.chars().take(EXCERPT_MAX_CHARS).collect();
            excerpt.push_str("\n# ... truncated\n");
        }
        Some(excerpt)
    }

    // ---- targeted preview ----

    /// Ask the provider chain for a `patch_response.v1` diff against the
    /// values file that resolves one violation. Nothing is staged.
    pub async fn preview_patch(
        &self,
        chart: &ChartInfo,
        violation: &Violation,
        settings: &OptimizerSettings,
        cancel: &CancellationToken,
    ) -> Result<(LlmProvider, StructuredPatchResponse), String> {
        let rel_values_path = chart.rel_values_path().map_err(|e| e.to_string())?;
        let values_text = fs::read_to_string(&chart.values_file)
            .map_err(|e| format!("Failed to read values file: {e}"))?;
        let task = format!(
            "Resolve {} ({}) for workload `{}` of chart `{}`: {} Current: {}. Recommended: {}.",
            violation.rule_id,
            violation.rule_name,
            violation.workload,
            chart.name,
            violation.description,
            violation.current_value,
            violation.recommended_value,
        );
        let mut context = vec![(rel_values_path.clone(), values_text)];
        let seed = self.seed_patch(chart, std::slice::from_ref(violation), &settings.fix_options);
        if !seed.is_empty() {
            let hint = serde_json::to_string_pretty(&seed).map_err(|e| e.to_string())?;
            context.push(("Deterministic suggestion".to_string(), hint));
        }
        let allowed = vec![rel_values_path];
        let prompt = build_structured_patch_prompt(
            &task,
            &allowed,
            &context,
            &settings.ai_fix_full_fix_system_prompt,
        );

        let mut errors = Vec::new();
        for provider in settings.provider_chain() {
            if cancel.is_cancelled() {
                errors.push("cancelled".to_string());
                break;
            }
            let model = settings.model_for(provider);
            let run = self
                .llm
                .run_structured_patch(
                    provider,
                    &prompt,
                    settings.ai_fix_timeout(),
                    model.as_deref(),
                    cancel,
                )
                .await;
            if !run.ok {
                errors.push(format!("{provider}: {}", run.error_message));
                continue;
            }
            let response =
                parse_structured_patch(&run.stdout).map_err(|e| format!("{provider}: {e}"))?;
            if let Some(bad) = response.patches.iter().find(|p| !allowed.contains(&p.file)) {
                return Err(format!("{provider}: patch targets {} outside the allowlist", bad.file));
            }
            return Ok((provider, response));
        }
        Err(format!("All providers failed: {}", errors.join("; ")))
    }

    // ---- batch ----

    /// Run many attempts with at most `ai_fix_bulk_parallelism` in flight.
    ///
    /// Once `cancel` fires no new attempt starts; in-flight attempts see the
    /// same token and kill their subprocesses.
    pub async fn generate_full_fix_batch(
        &self,
        requests: Vec<FixRequest>,
        settings: &OptimizerSettings,
        cancel: &CancellationToken,
    ) -> BatchOutcome {
        let parallelism = settings.ai_fix_bulk_parallelism.max(1);
        info!(charts = requests.len(), parallelism, "starting fix batch");

        let mut outcomes: Vec<(usize, Result<AiFullFixResult, String>)> =
            stream::iter(requests.into_iter().enumerate())
                .map(|(index, request)| async move {
                    if cancel.is_cancelled() {
                        return (index, Err(request.chart.name));
                    }
                    let result = self
                        .generate_full_fix(&request.chart, &request.violations, settings, cancel)
                        .await;
                    (index, Ok(result))
                })
                .buffer_unordered(parallelism)
                .collect()
                .await;
        outcomes.sort_by_key(|(index, _)| *index);

        let mut batch = BatchOutcome {
            results: Vec::new(),
            not_started: Vec::new(),
        };
        for (_, outcome) in outcomes {
            match outcome {
                Ok(result) => batch.results.push(result),
                Err(chart) => batch.not_started.push(chart),
            }
        }
        if !batch.not_started.is_empty() {
            warn!(skipped = batch.not_started.len(), "fix batch cancelled");
        }
        batch
    }

    // ---- deterministic ----

    /// Stage a bundle built only from rule fix generators.
    pub fn build_deterministic_fix(
        &self,
        chart: &ChartInfo,
        violations: &[Violation],
        options: &FixOptions,
    ) -> AiFullFixResult {
        let mut attempt = Attempt::begin(&chart.name);
        let _span = obs::AttemptSpan::enter(&attempt.id.to_string(), &chart.name);
        if let Err(note) = check_preconditions(chart, violations) {
            return attempt.fail(note);
        }

        let mut response = FullFixResponse::ok("Deterministic fix from rule generators.");
        let mut seen = std::collections::BTreeSet::new();
        for violation in violations {
            let fix = self.engine.generate_fix(chart, violation, options);
            let covered = matches!(fix, Some(Value::Object(_)));
            if let Some(Value::Object(fix)) = fix {
                merge_json_overlay(&mut response.values_patch, &fix);
            }
            if seen.insert(violation.rule_id.clone()) {
                response.violation_coverage.push(CoverageRecord {
                    rule_id: violation.rule_id.clone(),
                    status: if covered {
                        CoverageStatus::Addressed
                    } else {
                        CoverageStatus::NotApplicable
                    },
                    note: if covered {
                        String::new()
                    } else {
                        "No deterministic fix available.".to_string()
                    },
                });
            }
        }
        if response.values_patch.is_empty() {
            response.result = PatchResult::NoChange;
            return attempt.finish(
                FixStatus::NoChange,
                None,
                Some(response),
                None,
                "No deterministic fix available for these violations.",
            );
        }

        attempt.advance(AttemptState::Staging);
        let mut artifact = match StagedArtifact::create(&chart.chart_dir, &chart.values_file) {
            Ok(artifact) => artifact,
            Err(e) => return attempt.fail(format!("Failed to stage workspace: {e}")),
        };
        if let Err(e) = artifact.apply_response(&response) {
            return attempt.fail(format!("Failed to stage deterministic fix: {e}"));
        }
        if !artifact.has_changes() {
            return attempt.finish(
                FixStatus::NoChange,
                None,
                Some(response),
                None,
                "Deterministic fix leaves the values file unchanged.",
            );
        }
        artifact.execution_log = "Deterministic fix from rule generators.".to_string();
        attempt.finish(
            FixStatus::Ok,
            None,
            Some(response),
            Some(artifact),
            "Deterministic fix staged.",
        )
    }
}

fn check_preconditions(chart: &ChartInfo, violations: &[Violation]) -> Result<(), String> {
    if !chart.chart_dir.is_dir() {
        return Err(format!("Chart directory not found: {}", chart.chart_dir.display()));
    }
    if !chart.values_file.is_file() {
        return Err(format!("Values file not found: {}", chart.values_file.display()));
    }
    if violations.is_empty() {
        return Err("No violations to fix.".to_string());
    }
    if !is_within(&chart.chart_dir, &chart.values_file) {
        return Err("Values file must live inside the chart directory.".to_string());
    }
    Ok(())
}

fn is_within(root: &Path, path: &Path) -> bool {
    match (root.canonicalize(), path.canonicalize()) {
        (Ok(root), Ok(path)) => path.starts_with(root),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attempt_transitions_are_ordered_and_stop_at_terminal() {
        let mut attempt = Attempt::begin("demo");
        attempt.advance(AttemptState::RunningCli);
        attempt.advance(AttemptState::RunningCli);
        attempt.advance(AttemptState::Parsing);
        let result = attempt.fail("boom");

        let path: Vec<_> = result.transitions.iter().map(|t| t.to).collect();
        assert_eq!(
            path,
            vec![AttemptState::RunningCli, AttemptState::Parsing, AttemptState::Failed]
        );
        assert_eq!(result.status, FixStatus::Error);
        assert!(!result.ok);
        assert_eq!(result.note, "boom");
    }

    #[test]
    fn test_preconditions_reject_missing_values_and_empty_violations() {
        let dir = tempfile::tempdir().unwrap();
        let chart = ChartInfo {
            name: "demo".into(),
            chart_dir: dir.path().to_path_buf(),
            values_file: dir.path().join("values.yaml"),
            analysis_source: AnalysisSource::Values,
            workloads: Vec::new(),
            parent_only_render: false,
        };
        let err = check_preconditions(&chart, &[]).unwrap_err();
        assert!(err.starts_with("Values file not found"), "{err}");

        fs::write(dir.path().join("values.yaml"), "a: 1\n").unwrap();
        let err = check_preconditions(&chart, &[]).unwrap_err();
        assert_eq!(err, "No violations to fix.");
    }

    #[test]
    fn test_result_serialization_skips_workspace() {
        let result =
            Attempt::begin("demo").finish(FixStatus::NoChange, None, None, None, "nothing");
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["status"], "no_change");
        assert!(json.get("staged_artifact").is_none());
        assert_eq!(json["transitions"][0]["to"], "done");
    }
}
