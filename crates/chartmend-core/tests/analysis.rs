mod common;

use chartmend_core::{
    analyze_chart, analyze_charts, discover_charts, AnalysisSource, AnalysisSourceSetting,
    OptimizerSettings, RenderErrorKind,
};
use common::{values_with_cpu, write_chart, ValuesRenderer};

fn settings(mode: AnalysisSourceSetting) -> OptimizerSettings {
    OptimizerSettings {
        optimizer_analysis_source: mode,
        ..OptimizerSettings::default()
    }
}

#[tokio::test]
async fn test_auto_prefers_rendered_workloads() {
    let root = tempfile::tempdir().unwrap();
    let chart_dir = write_chart(root.path(), "web", &values_with_cpu("800m"));

    let chart = analyze_chart(
        &settings(AnalysisSourceSetting::Auto),
        &ValuesRenderer::default(),
        &chart_dir,
        None,
    )
    .await
    .unwrap();

    assert_eq!(chart.analysis_source, AnalysisSource::Rendered);
    assert_eq!(chart.workloads.len(), 1);
    assert_eq!(chart.workloads[0].replicas, Some(2));
}

#[tokio::test]
async fn test_auto_falls_back_to_values_on_render_failure() {
    let root = tempfile::tempdir().unwrap();
    let chart_dir = write_chart(root.path(), "web", &values_with_cpu("800m"));

    let chart = analyze_chart(
        &settings(AnalysisSourceSetting::Auto),
        &ValuesRenderer::failing(RenderErrorKind::Timeout),
        &chart_dir,
        None,
    )
    .await
    .unwrap();

    assert_eq!(chart.analysis_source, AnalysisSource::Values);
}

#[tokio::test]
async fn test_rendered_mode_surfaces_render_failure() {
    let root = tempfile::tempdir().unwrap();
    let chart_dir = write_chart(root.path(), "web", &values_with_cpu("800m"));

    let err = analyze_chart(
        &settings(AnalysisSourceSetting::Rendered),
        &ValuesRenderer::failing(RenderErrorKind::RenderFailed),
        &chart_dir,
        None,
    )
    .await
    .unwrap_err();

    assert!(err.to_string().contains("render_failed"), "{err}");
}

#[tokio::test]
async fn test_values_mode_never_renders() {
    let root = tempfile::tempdir().unwrap();
    let chart_dir = write_chart(root.path(), "web", &values_with_cpu("800m"));
    let renderer = ValuesRenderer::default();

    let chart = analyze_chart(
        &settings(AnalysisSourceSetting::Values),
        &renderer,
        &chart_dir,
        None,
    )
    .await
    .unwrap();

    assert_eq!(chart.analysis_source, AnalysisSource::Values);
    assert_eq!(renderer.calls.load(std::sync::atomic::Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_analyze_charts_keeps_discovery_order() {
    let root = tempfile::tempdir().unwrap();
    for name in ["zeta", "alpha", "mid"] {
        write_chart(root.path(), name, &values_with_cpu("200m"));
    }
    std::fs::create_dir_all(root.path().join("broken")).unwrap();
    std::fs::write(root.path().join("broken/Chart.yaml"), "name: broken\n").unwrap();

    let dirs = discover_charts(root.path());
    let results = analyze_charts(
        &settings(AnalysisSourceSetting::Auto),
        &ValuesRenderer::default(),
        &dirs,
    )
    .await;

    let names: Vec<_> = results
        .iter()
        .map(|(dir, _)| dir.file_name().unwrap().to_string_lossy().into_owned())
        .collect();
    assert_eq!(names, vec!["alpha", "broken", "mid", "zeta"]);
    assert!(results[1].1.is_err(), "chart without values.yaml must fail");
    assert!(results.iter().filter(|(_, r)| r.is_ok()).count() == 3);
}
