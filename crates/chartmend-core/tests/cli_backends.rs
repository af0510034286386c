//! `helm`, `codex` and `claude` replaced by shell scripts.
#![cfg(unix)]

mod common;

use chartmend_core::llm::{LlmInvoker, LlmProvider};
use chartmend_core::{parse_full_fix, ChartRenderer, CliLlmRunner, HelmRenderer, RenderErrorKind};
use common::{full_fix_json, values_with_cpu, write_chart, write_script};
use serde_json::json;
use std::fs;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const MANIFEST: &str = r#"cat <<'EOF'
---
# Source: web/templates/deployment.yaml
apiVersion: apps/v1
kind: Deployment
metadata:
  name: web
spec:
  replicas: 3
  template:
    spec:
      containers:
        - name: app
          image: web:1.0
---
EOF"#;

// ---------------------------------------------------------------------------
// helm
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_helm_template_documents_are_parsed() {
    let root = tempfile::tempdir().unwrap();
    let chart_dir = write_chart(root.path(), "web", &values_with_cpu("800m"));
    let helm = write_script(root.path(), "helm", MANIFEST);

    let result = HelmRenderer::new(&helm)
        .render(&chart_dir, &chart_dir.join("values.yaml"), Duration::from_secs(10))
        .await;

    assert!(result.ok, "{}", result.error_summary());
    assert_eq!(result.docs.len(), 1);
    assert_eq!(result.docs[0]["kind"], "Deployment");
    assert!(!result.parent_only_render_attempted);
}

#[tokio::test]
async fn test_helm_failure_reports_first_stderr_line() {
    let root = tempfile::tempdir().unwrap();
    let chart_dir = write_chart(root.path(), "web", &values_with_cpu("800m"));
    let helm = write_script(
        root.path(),
        "helm",
        "echo 'Error: template: web/templates/deployment.yaml:4: bad' >&2\necho 'more' >&2\nexit 1",
    );

    let result = HelmRenderer::new(&helm)
        .render(&chart_dir, &chart_dir.join("values.yaml"), Duration::from_secs(10))
        .await;

    assert!(!result.ok);
    assert_eq!(result.error_kind, Some(RenderErrorKind::RenderFailed));
    assert_eq!(
        result.error_message.as_deref(),
        Some("Error: template: web/templates/deployment.yaml:4: bad")
    );
}

#[tokio::test]
async fn test_helm_timeout() {
    let root = tempfile::tempdir().unwrap();
    let chart_dir = write_chart(root.path(), "web", &values_with_cpu("800m"));
    let helm = write_script(root.path(), "helm", "sleep 5");

    let result = HelmRenderer::new(&helm)
        .render(&chart_dir, &chart_dir.join("values.yaml"), Duration::from_millis(200))
        .await;

    assert_eq!(result.error_kind, Some(RenderErrorKind::Timeout));
}

#[tokio::test]
async fn test_missing_subcharts_fall_back_to_parent_only_render() {
    let root = tempfile::tempdir().unwrap();
    let chart_dir = write_chart(root.path(), "web", &values_with_cpu("800m"));
    fs::write(
        chart_dir.join("Chart.yaml"),
        "apiVersion: v2\nname: web\nversion: 0.1.0\ndependencies:\n  - name: redis\n    version: 17.0.0\n",
    )
    .unwrap();
    let body = format!(
        "if grep -q dependencies \"$2/Chart.yaml\"; then\n  echo 'Error: found in Chart.yaml, but missing in charts/ directory: redis' >&2\n  exit 1\nfi\n{MANIFEST}"
    );
    let helm = write_script(root.path(), "helm", &body);

    let result = HelmRenderer::new(&helm)
        .render(&chart_dir, &chart_dir.join("values.yaml"), Duration::from_secs(10))
        .await;

    assert!(result.ok, "{}", result.error_summary());
    assert!(result.parent_only_render_attempted);
    assert!(result.parent_only_render);
    assert_eq!(result.chart_dir, chart_dir);
    // the real Chart.yaml keeps its dependencies
    let meta = fs::read_to_string(chart_dir.join("Chart.yaml")).unwrap();
    assert!(meta.contains("redis"));
}

#[tokio::test]
async fn test_parent_only_render_failure_is_labelled() {
    let root = tempfile::tempdir().unwrap();
    let chart_dir = write_chart(root.path(), "web", &values_with_cpu("800m"));
    let helm = write_script(
        root.path(),
        "helm",
        "echo 'Error: found in Chart.yaml, but missing in charts/ directory: redis' >&2\nexit 1",
    );

    let result = HelmRenderer::new(&helm)
        .render(&chart_dir, &chart_dir.join("values.yaml"), Duration::from_secs(10))
        .await;

    assert!(!result.ok);
    assert!(result.parent_only_render_attempted);
    assert_eq!(result.error_kind, Some(RenderErrorKind::ParentRenderFailed));
}

// ---------------------------------------------------------------------------
// codex / claude
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_structured_run_captures_stdout() {
    let root = tempfile::tempdir().unwrap();
    let answer = full_fix_json(json!({"resources": {"limits": {"cpu": "200m"}}}), &["RES002"]);
    let codex = write_script(
        root.path(),
        "codex",
        &format!("cat > /dev/null\necho 'thinking...'\ncat <<'EOF'\n```json\n{answer}\n```\nEOF"),
    );
    let runner = CliLlmRunner::new(&codex, root.path().join("claude"));

    let result = runner
        .run_structured_patch(
            LlmProvider::Codex,
            "fix it",
            Duration::from_secs(10),
            None,
            &CancellationToken::new(),
        )
        .await;

    assert!(result.ok, "{}", result.error_message);
    assert_eq!(result.exit_code, Some(0));
    let parsed = parse_full_fix(&result.stdout).unwrap();
    assert_eq!(parsed.values_patch["resources"]["limits"]["cpu"], "200m");
    assert!(runner.is_available(LlmProvider::Codex));
    assert!(!runner.is_available(LlmProvider::Claude));
}

#[tokio::test]
async fn test_structured_run_failure_uses_stderr_tail() {
    let root = tempfile::tempdir().unwrap();
    let claude = write_script(
        root.path(),
        "claude",
        "cat > /dev/null\necho 'quota exceeded' >&2\nexit 3",
    );
    let runner = CliLlmRunner::new(root.path().join("codex"), &claude);

    let result = runner
        .run_structured_patch(
            LlmProvider::Claude,
            "fix it",
            Duration::from_secs(10),
            Some("sonnet"),
            &CancellationToken::new(),
        )
        .await;

    assert!(!result.ok);
    assert_eq!(result.exit_code, Some(3));
    assert_eq!(result.error_message, "quota exceeded");
    assert!(result.command.contains(&"sonnet".to_string()));
}

#[tokio::test]
async fn test_structured_run_timeout() {
    let root = tempfile::tempdir().unwrap();
    let codex = write_script(root.path(), "codex", "sleep 5");
    let runner = CliLlmRunner::new(&codex, root.path().join("claude"));

    let result = runner
        .run_structured_patch(
            LlmProvider::Codex,
            "fix it",
            Duration::from_millis(200),
            None,
            &CancellationToken::new(),
        )
        .await;

    assert!(!result.ok);
    assert!(result.timed_out);
    assert_eq!(result.exit_code, Some(124));
}

#[tokio::test]
async fn test_direct_edit_reports_changed_files() {
    let root = tempfile::tempdir().unwrap();
    let chart_dir = write_chart(root.path(), "web", &values_with_cpu("800m"));
    let bin = tempfile::tempdir().unwrap();
    let codex = write_script(
        bin.path(),
        "codex",
        "cat > /dev/null\nprintf 'replicaCount: 2\\n' > values.yaml\necho 'edited values.yaml'",
    );
    let runner = CliLlmRunner::new(&codex, bin.path().join("claude"));

    let result = runner
        .run_direct_edit(
            LlmProvider::Codex,
            &chart_dir,
            "fix it",
            Duration::from_secs(10),
            None,
            2,
            &CancellationToken::new(),
        )
        .await;

    assert!(result.ok, "{}", result.error_message);
    assert_eq!(result.attempts, 1);
    assert_eq!(result.changed_rel_paths, vec!["values.yaml".to_string()]);
    assert!(result.log_text.contains("Changed Files (1):\n- values.yaml"));
    assert_eq!(result.stdout_tail, "edited values.yaml");
}

#[tokio::test]
async fn test_direct_edit_retries_failures_without_edits() {
    let root = tempfile::tempdir().unwrap();
    let chart_dir = write_chart(root.path(), "web", &values_with_cpu("800m"));
    let bin = tempfile::tempdir().unwrap();
    let claude = write_script(
        bin.path(),
        "claude",
        "cat > /dev/null\necho 'overloaded' >&2\nexit 1",
    );
    let runner = CliLlmRunner::new(bin.path().join("codex"), &claude);

    let result = runner
        .run_direct_edit(
            LlmProvider::Claude,
            &chart_dir,
            "fix it",
            Duration::from_secs(10),
            None,
            3,
            &CancellationToken::new(),
        )
        .await;

    assert!(!result.ok);
    assert_eq!(result.attempts, 3);
    assert!(result.changed_rel_paths.is_empty());
    assert_eq!(result.error_message, "overloaded");
}
