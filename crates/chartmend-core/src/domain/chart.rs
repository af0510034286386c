//! Chart identity and the workloads extracted from it.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use super::error::{ChartmendError, Result};
use super::workload::WorkloadSpec;

/// Where a chart's workload view came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisSource {
    Values,
    Rendered,
}

/// A chart ready for rule evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChartInfo {
    pub name: String,
    pub chart_dir: PathBuf,
    pub values_file: PathBuf,
    pub analysis_source: AnalysisSource,
    pub workloads: Vec<WorkloadSpec>,
    /// Rendered without sub-charts; sub-chart workloads are not represented.
    #[serde(default)]
    pub parent_only_render: bool,
}

impl ChartInfo {
    /// Analyze a chart from its values file alone.
    pub fn from_values_file(chart_dir: &Path, values_file: &Path) -> Result<Self> {
        let name = read_chart_name(chart_dir)?;
        let values = load_values(values_file)?;
        let workload = WorkloadSpec::from_values(&name, &values);
        Ok(Self {
            name,
            chart_dir: chart_dir.to_path_buf(),
            values_file: values_file.to_path_buf(),
            analysis_source: AnalysisSource::Values,
            workloads: vec![workload],
            parent_only_render: false,
        })
    }

    /// Analyze a chart from documents produced by a successful render.
    pub fn from_rendered(
        chart_dir: &Path,
        values_file: &Path,
        docs: &[serde_yaml::Value],
        parent_only_render: bool,
    ) -> Result<Self> {
        let name = read_chart_name(chart_dir)?;
        let workloads = WorkloadSpec::from_rendered(&name, docs);
        Ok(Self {
            name,
            chart_dir: chart_dir.to_path_buf(),
            values_file: values_file.to_path_buf(),
            analysis_source: AnalysisSource::Rendered,
            workloads,
            parent_only_render,
        })
    }

    /// Values file path relative to the chart root, `/`-separated.
    pub fn rel_values_path(&self) -> Result<String> {
        rel_path(&self.chart_dir, &self.values_file)
    }
}

/// Relative, `/`-separated path of `path` under `root`.
pub fn rel_path(root: &Path, path: &Path) -> Result<String> {
    let rel = path.strip_prefix(root).map_err(|_| {
        ChartmendError::InvalidChart(format!(
            "{} is not inside chart directory {}",
            path.display(),
            root.display()
        ))
    })?;
    Ok(rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/"))
}

/// Chart name from `Chart.yaml`, falling back to the directory name.
pub fn read_chart_name(chart_dir: &Path) -> Result<String> {
    if !chart_dir.is_dir() {
        return Err(ChartmendError::InvalidChart(format!(
            "chart directory not found: {}",
            chart_dir.display()
        )));
    }
    let chart_yaml = chart_dir.join("Chart.yaml");
    if chart_yaml.is_file() {
        let text = std::fs::read_to_string(&chart_yaml)?;
        let meta: serde_yaml::Value = serde_yaml::from_str(&text)?;
        if let Some(name) = meta.get("name").and_then(serde_yaml::Value::as_str) {
            if !name.trim().is_empty() {
                return Ok(name.trim().to_string());
            }
        }
    }
    Ok(chart_dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "chart".to_string()))
}

/// Load a values file; an empty file is an empty mapping.
pub fn load_values(values_file: &Path) -> Result<serde_yaml::Value> {
    let text = std::fs::read_to_string(values_file)?;
    if text.trim().is_empty() {
        return Ok(serde_yaml::Value::Mapping(Default::default()));
    }
    let value: serde_yaml::Value = serde_yaml::from_str(&text)?;
    match value {
        serde_yaml::Value::Null => Ok(serde_yaml::Value::Mapping(Default::default())),
        serde_yaml::Value::Mapping(_) => Ok(value),
        _ => Err(ChartmendError::InvalidChart(format!(
            "values file {} is not a mapping",
            values_file.display()
        ))),
    }
}
