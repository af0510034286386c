//! Chart discovery and analysis-source selection.

use futures::stream::{self, StreamExt};
use std::path::{Path, PathBuf};
use tracing::{debug, instrument, warn};
use walkdir::WalkDir;

use crate::config::{AnalysisSourceSetting, OptimizerSettings};
use crate::domain::{ChartInfo, ChartmendError, Result};
use crate::render::ChartRenderer;

const DEFAULT_VALUES_FILE: &str = "values.yaml";
const DEFAULT_RENDER_CONCURRENCY: usize = 4;

/// Every chart directory under `root`, sorted. Vendored sub-charts under a
/// `charts/` directory are not listed separately.
pub fn discover_charts(root: &Path) -> Vec<PathBuf> {
    let mut charts: Vec<PathBuf> = WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || e.file_name() != "charts")
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file() && e.file_name() == "Chart.yaml")
        .filter_map(|e| e.path().parent().map(Path::to_path_buf))
        .collect();
    charts.sort();
    charts
}

/// Build a [`ChartInfo`] the way `optimizer_analysis_source` asks for.
///
/// `values` renders nothing; `rendered` fails when the render fails; `auto`
/// renders and falls back to the values file when the render fails or
/// yields no workloads.
#[instrument(skip(settings, renderer), fields(chart_dir = %chart_dir.display()))]
pub async fn analyze_chart(
    settings: &OptimizerSettings,
    renderer: &dyn ChartRenderer,
    chart_dir: &Path,
    values_file: Option<&Path>,
) -> Result<ChartInfo> {
    let values_file = values_file
        .map(Path::to_path_buf)
        .unwrap_or_else(|| chart_dir.join(DEFAULT_VALUES_FILE));
    if !values_file.is_file() {
        return Err(ChartmendError::InvalidChart(format!(
            "values file not found: {}",
            values_file.display()
        )));
    }

    let mode = settings.optimizer_analysis_source;
    if mode == AnalysisSourceSetting::Values {
        return ChartInfo::from_values_file(chart_dir, &values_file);
    }

    let rendered = renderer
        .render(chart_dir, &values_file, settings.helm_timeout())
        .await;
    if !rendered.ok {
        if mode == AnalysisSourceSetting::Rendered {
            return Err(ChartmendError::Render(rendered.error_summary()));
        }
        warn!(error = %rendered.error_summary(), "render failed, analyzing values file");
        return ChartInfo::from_values_file(chart_dir, &values_file);
    }

    let chart = ChartInfo::from_rendered(
        chart_dir,
        &values_file,
        &rendered.docs,
        rendered.parent_only_render,
    )?;
    if chart.workloads.is_empty() && mode == AnalysisSourceSetting::Auto {
        debug!("render produced no workloads, analyzing values file");
        return ChartInfo::from_values_file(chart_dir, &values_file);
    }
    Ok(chart)
}

/// Analyze many charts, a few renders at a time. Results keep input order.
pub async fn analyze_charts(
    settings: &OptimizerSettings,
    renderer: &dyn ChartRenderer,
    chart_dirs: &[PathBuf],
) -> Vec<(PathBuf, Result<ChartInfo>)> {
    let concurrency = match settings.max_workers {
        0 => DEFAULT_RENDER_CONCURRENCY,
        n => n,
    };
    stream::iter(chart_dirs.iter().cloned())
        .map(|dir| async move {
            let info = analyze_chart(settings, renderer, &dir, None).await;
            (dir, info)
        })
        .buffered(concurrency)
        .collect()
        .await
}
