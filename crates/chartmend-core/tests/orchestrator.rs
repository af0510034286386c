//! Attempt state machine, provider fallback and bounded batch execution.

mod common;

use chartmend_core::config::{FixMode, ProviderSetting};
use chartmend_core::llm::LlmProvider;
use chartmend_core::orchestrator::AttemptState;
use chartmend_core::{
    AiFixOrchestrator, ChartInfo, FixRequest, FixStatus, OptimizerSettings, RuleRegistry,
    RulesEngine, Violation,
};
use common::{full_fix_json, values_with_cpu, write_chart, ScriptedLlm};
use serde_json::json;
use std::fs;
use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn engine() -> Arc<RulesEngine> {
    Arc::new(RulesEngine::new(RuleRegistry::standard(&Default::default())))
}

fn ratio_violation(engine: &RulesEngine, chart: &ChartInfo) -> Vec<Violation> {
    engine
        .check_chart(chart)
        .into_iter()
        .filter(|v| v.rule_id == "RES002")
        .collect()
}

fn chart_fixture(root: &Path, name: &str) -> ChartInfo {
    let dir = write_chart(root, name, &values_with_cpu("800m"));
    ChartInfo::from_values_file(&dir, &dir.join("values.yaml")).unwrap()
}

fn auto_settings() -> OptimizerSettings {
    OptimizerSettings {
        ai_fix_llm_provider: ProviderSetting::Auto,
        ..OptimizerSettings::default()
    }
}

#[tokio::test]
async fn test_falls_back_to_next_provider_on_cli_failure() {
    let root = tempfile::tempdir().unwrap();
    let chart = chart_fixture(root.path(), "api");
    let engine = engine();
    let violations = ratio_violation(&engine, &chart);
    let answer = full_fix_json(json!({"resources": {"limits": {"cpu": "200m"}}}), &["RES002"]);
    let llm = Arc::new(
        ScriptedLlm::answering(LlmProvider::Claude, answer)
            .with_answer(LlmProvider::Codex, Err("rate limited".to_string())),
    );
    let orchestrator = AiFixOrchestrator::new(engine, llm.clone());

    let result = orchestrator
        .generate_full_fix(&chart, &violations, &auto_settings(), &CancellationToken::new())
        .await;

    assert_eq!(result.status, FixStatus::Ok, "{}", result.note);
    assert_eq!(result.provider, Some(LlmProvider::Claude));
    assert_eq!(result.tried_providers, vec![LlmProvider::Codex, LlmProvider::Claude]);
    assert_eq!(result.errors, vec!["codex: rate limited".to_string()]);
    assert_eq!(llm.calls(), vec![LlmProvider::Codex, LlmProvider::Claude]);
    let states: Vec<_> = result.transitions.iter().map(|t| t.to).collect();
    assert_eq!(
        states,
        vec![
            AttemptState::RunningCli,
            AttemptState::Parsing,
            AttemptState::Staging,
            AttemptState::Done
        ]
    );
}

#[tokio::test]
async fn test_invalid_json_is_an_error_with_raw_output_kept() {
    let root = tempfile::tempdir().unwrap();
    let chart = chart_fixture(root.path(), "api");
    let engine = engine();
    let violations = ratio_violation(&engine, &chart);
    let llm = Arc::new(ScriptedLlm::answering(LlmProvider::Codex, "I think you should lower it."));
    let orchestrator = AiFixOrchestrator::new(engine, llm);

    let result = orchestrator
        .generate_full_fix(
            &chart,
            &violations,
            &OptimizerSettings::default(),
            &CancellationToken::new(),
        )
        .await;

    assert_eq!(result.status, FixStatus::Error);
    assert!(!result.ok);
    assert!(result.note.starts_with("Invalid full-fix response from codex"), "{}", result.note);
    assert_eq!(result.raw_output_text, "I think you should lower it.");
    assert!(result.staged_artifact.is_none());
    assert_eq!(result.transitions.last().map(|t| t.to), Some(AttemptState::Failed));
}

#[tokio::test]
async fn test_coverage_mismatch_is_rejected() {
    let root = tempfile::tempdir().unwrap();
    let chart = chart_fixture(root.path(), "api");
    let engine = engine();
    let violations = ratio_violation(&engine, &chart);
    let answer = full_fix_json(json!({"resources": {"limits": {"cpu": "200m"}}}), &["RES003"]);
    let llm = Arc::new(ScriptedLlm::answering(LlmProvider::Codex, answer));
    let orchestrator = AiFixOrchestrator::new(engine, llm);

    let result = orchestrator
        .generate_full_fix(
            &chart,
            &violations,
            &OptimizerSettings::default(),
            &CancellationToken::new(),
        )
        .await;

    assert_eq!(result.status, FixStatus::Error);
    assert!(result.note.contains("coverage"), "{}", result.note);
    assert!(result.staged_artifact.is_none());
}

#[tokio::test]
async fn test_no_change_response_skips_staging() {
    let root = tempfile::tempdir().unwrap();
    let chart = chart_fixture(root.path(), "api");
    let engine = engine();
    let violations = ratio_violation(&engine, &chart);
    let answer = json!({
        "schema_version": "full_fix_response.v1",
        "result": "no_change",
        "summary": "Ratio is intentional.",
        "violation_coverage": [{"rule_id": "RES002", "status": "unchanged"}]
    })
    .to_string();
    let llm = Arc::new(ScriptedLlm::answering(LlmProvider::Codex, answer));
    let orchestrator = AiFixOrchestrator::new(engine, llm);

    let result = orchestrator
        .generate_full_fix(
            &chart,
            &violations,
            &OptimizerSettings::default(),
            &CancellationToken::new(),
        )
        .await;

    assert_eq!(result.status, FixStatus::NoChange);
    assert!(result.ok);
    assert!(result.staged_artifact.is_none());
}

#[tokio::test]
async fn test_preconditions_fail_without_violations() {
    let root = tempfile::tempdir().unwrap();
    let chart = chart_fixture(root.path(), "api");
    let llm = Arc::new(ScriptedLlm::default());
    let orchestrator = AiFixOrchestrator::new(engine(), llm.clone());

    let result = orchestrator
        .generate_full_fix(&chart, &[], &OptimizerSettings::default(), &CancellationToken::new())
        .await;

    assert_eq!(result.status, FixStatus::Error);
    assert_eq!(result.note, "No violations to fix.");
    assert!(llm.calls().is_empty());
}

#[tokio::test]
async fn test_prompt_embeds_deterministic_seed() {
    let root = tempfile::tempdir().unwrap();
    let chart = chart_fixture(root.path(), "api");
    let engine = engine();
    let violations = ratio_violation(&engine, &chart);
    let seed = AiFixOrchestrator::new(engine.clone(), Arc::new(ScriptedLlm::default())).seed_patch(
        &chart,
        &violations,
        &Default::default(),
    );
    assert!(seed.contains_key("resources"), "{seed:?}");

    let llm = Arc::new(ScriptedLlm::answering(LlmProvider::Codex, "{}"));
    let orchestrator = AiFixOrchestrator::new(engine, llm.clone());
    orchestrator
        .generate_full_fix(
            &chart,
            &violations,
            &OptimizerSettings::default(),
            &CancellationToken::new(),
        )
        .await;

    let prompts = llm.prompts.lock().unwrap();
    let (_, prompt) = &prompts[0];
    assert!(prompt.contains("full_fix_response.v1"));
    let seed_yaml = serde_yaml::to_string(&seed).unwrap();
    assert!(
        prompt.contains(&format!("(optional guidance):\n{}", seed_yaml.trim_end())),
        "seed patch missing from prompt"
    );
}

#[tokio::test]
async fn test_direct_edit_stages_in_scope_changes_only() {
    let root = tempfile::tempdir().unwrap();
    let chart = chart_fixture(root.path(), "api");
    let engine = engine();
    let violations = ratio_violation(&engine, &chart);
    let llm = Arc::new(ScriptedLlm::default().with_edit(|workspace: &Path| {
        let values = workspace.join("values.yaml");
        let text = fs::read_to_string(&values).unwrap().replace("cpu: 800m", "cpu: 200m");
        fs::write(values, text).unwrap();
        fs::write(workspace.join("Chart.yaml"), "name: hijacked\n").unwrap();
    }));
    let settings = OptimizerSettings {
        ai_fix_mode: FixMode::DirectEdit,
        ..OptimizerSettings::default()
    };
    let orchestrator = AiFixOrchestrator::new(engine, llm);

    let result = orchestrator
        .generate_full_fix(&chart, &violations, &settings, &CancellationToken::new())
        .await;

    assert_eq!(result.status, FixStatus::Ok, "{}", result.note);
    let artifact = result.staged_artifact.as_ref().unwrap();
    assert_eq!(artifact.changed_rel_paths, vec!["values.yaml".to_string()]);
    assert!(result.errors.iter().any(|e| e.contains("Chart.yaml")));
    let response = result.response.as_ref().unwrap();
    assert_eq!(response.values_patch["resources"]["limits"]["cpu"], "200m");
    assert_eq!(
        fs::read_to_string(chart.values_file).unwrap(),
        values_with_cpu("800m"),
        "source chart must stay untouched"
    );
}

#[tokio::test]
async fn test_direct_edit_skips_unavailable_provider() {
    let root = tempfile::tempdir().unwrap();
    let chart = chart_fixture(root.path(), "api");
    let engine = engine();
    let violations = ratio_violation(&engine, &chart);
    let mut llm = ScriptedLlm::default();
    llm.unavailable.insert(LlmProvider::Codex);
    let llm = Arc::new(llm);
    let settings = OptimizerSettings {
        ai_fix_mode: FixMode::DirectEdit,
        ..auto_settings()
    };
    let orchestrator = AiFixOrchestrator::new(engine, llm.clone());

    let result = orchestrator
        .generate_full_fix(&chart, &violations, &settings, &CancellationToken::new())
        .await;

    assert_eq!(result.tried_providers, vec![LlmProvider::Codex, LlmProvider::Claude]);
    assert_eq!(llm.calls(), vec![LlmProvider::Claude]);
    assert!(result.errors[0].starts_with("codex: direct-edit backend unavailable"));
    assert_eq!(result.status, FixStatus::NoChange, "{}", result.note);
}

#[test]
fn test_deterministic_fix_stages_rule_overlay() {
    let root = tempfile::tempdir().unwrap();
    let chart = chart_fixture(root.path(), "api");
    let engine = engine();
    let violations = ratio_violation(&engine, &chart);
    let orchestrator = AiFixOrchestrator::new(engine, Arc::new(ScriptedLlm::default()));

    let result = orchestrator.build_deterministic_fix(&chart, &violations, &Default::default());

    assert_eq!(result.status, FixStatus::Ok, "{}", result.note);
    assert_eq!(result.provider, None);
    let artifact = result.staged_artifact.as_ref().unwrap();
    assert_eq!(artifact.changed_rel_paths, vec!["values.yaml".to_string()]);
}

// ---------------------------------------------------------------------------
// Batch
// ---------------------------------------------------------------------------

fn batch_requests(root: &Path, engine: &RulesEngine, count: usize) -> Vec<FixRequest> {
    (0..count)
        .map(|i| {
            let chart = chart_fixture(root, &format!("svc-{i:02}"));
            let violations = ratio_violation(engine, &chart);
            FixRequest { chart, violations }
        })
        .collect()
}

#[tokio::test]
async fn test_batch_respects_parallelism() {
    let root = tempfile::tempdir().unwrap();
    let engine = engine();
    let requests = batch_requests(root.path(), &engine, 10);
    let answer = full_fix_json(json!({"resources": {"limits": {"cpu": "200m"}}}), &["RES002"]);
    let llm = Arc::new(
        ScriptedLlm::answering(LlmProvider::Codex, answer).with_delay(Duration::from_millis(50)),
    );
    let orchestrator = AiFixOrchestrator::new(engine, llm.clone());
    let settings = OptimizerSettings {
        ai_fix_bulk_parallelism: 2,
        ..OptimizerSettings::default()
    };

    let outcome = orchestrator
        .generate_full_fix_batch(requests, &settings, &CancellationToken::new())
        .await;

    assert_eq!(outcome.results.len(), 10);
    assert!(outcome.not_started.is_empty());
    assert_eq!(llm.peak.load(Ordering::SeqCst), 2);
    let names: Vec<_> = outcome.results.iter().map(|r| r.chart_name.as_str()).collect();
    assert_eq!(names[0], "svc-00");
    assert_eq!(names[9], "svc-09");
    assert!(outcome.results.iter().all(|r| r.status == FixStatus::Ok));
    let dirs: std::collections::HashSet<_> = outcome
        .results
        .iter()
        .map(|r| r.staged_artifact.as_ref().unwrap().staged_chart_dir.clone())
        .collect();
    assert_eq!(dirs.len(), 10, "every attempt stages into its own workspace");
}

#[tokio::test]
async fn test_cancelled_batch_reports_unstarted_charts() {
    let root = tempfile::tempdir().unwrap();
    let engine = engine();
    let requests = batch_requests(root.path(), &engine, 6);
    let llm = Arc::new(
        ScriptedLlm::answering(LlmProvider::Codex, "{}").with_delay(Duration::from_secs(30)),
    );
    let orchestrator = AiFixOrchestrator::new(engine, llm);
    let settings = OptimizerSettings {
        ai_fix_bulk_parallelism: 2,
        ..OptimizerSettings::default()
    };
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let outcome = orchestrator
        .generate_full_fix_batch(requests, &settings, &cancel)
        .await;

    assert_eq!(outcome.results.len(), 2);
    assert!(outcome.results.iter().all(|r| r.status == FixStatus::Error));
    assert_eq!(outcome.not_started.len(), 4);
    assert_eq!(outcome.not_started[0], "svc-02");
}

fn structured_patch_json(file: &str) -> String {
    json!({
        "schema_version": "patch_response.v1",
        "result": "ok",
        "summary": "Lower the CPU limit.",
        "patches": [{
            "file": file,
            "purpose": "bring the ratio under 2.0",
            "updated_content": values_with_cpu("200m"),
        }],
    })
    .to_string()
}

#[tokio::test]
async fn test_preview_patch_restricted_to_values_file() {
    let root = tempfile::tempdir().unwrap();
    let engine = engine();
    let chart = chart_fixture(root.path(), "web");
    let violation = ratio_violation(&engine, &chart).remove(0);
    let llm = Arc::new(ScriptedLlm::answering(
        LlmProvider::Codex,
        structured_patch_json("values.yaml"),
    ));
    let orchestrator = AiFixOrchestrator::new(engine, llm.clone());

    let (provider, response) = orchestrator
        .preview_patch(&chart, &violation, &OptimizerSettings::default(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(provider, LlmProvider::Codex);
    assert_eq!(response.patches.len(), 1);
    assert!(response.patches[0]
        .updated_content
        .as_deref()
        .is_some_and(|c| c.contains("cpu: 200m")));
    let prompts = llm.prompts.lock().unwrap();
    assert!(prompts[0].1.contains("Deterministic suggestion"));
    // preview never stages or edits the chart
    assert!(fs::read_to_string(&chart.values_file).unwrap().contains("800m"));
}

#[tokio::test]
async fn test_preview_patch_rejects_files_outside_allowlist() {
    let root = tempfile::tempdir().unwrap();
    let engine = engine();
    let chart = chart_fixture(root.path(), "web");
    let violation = ratio_violation(&engine, &chart).remove(0);
    let llm = Arc::new(ScriptedLlm::answering(
        LlmProvider::Codex,
        structured_patch_json("templates/deployment.yaml"),
    ));
    let orchestrator = AiFixOrchestrator::new(engine, llm);

    let err = orchestrator
        .preview_patch(&chart, &violation, &OptimizerSettings::default(), &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(err.contains("outside the allowlist"), "{err}");
}
