//! Private chart workspaces for candidate fixes.
//!
//! A [`StagedArtifact`] owns a temporary copy of a chart. Candidate changes
//! are applied to the copy only; the source chart is touched exclusively by
//! the applier. Dropping the artifact removes the workspace.

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Component, Path, PathBuf};

use tempfile::TempDir;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::domain::{load_values, rel_path, Violation};
use crate::llm::LlmProvider;
use crate::protocol::{CoverageRecord, CoverageStatus, FullFixResponse, PatchFile, PatchResult};
use crate::tree::{changed_paths, copy_tree, hash_file, is_ignored, snapshot_tree};
use crate::values::{merge_values_text, overlay_patch};

const STAGE_PREFIX: &str = "chartmend-stage-";
const TEMPLATE_EXTENSIONS: [&str; 4] = ["yaml", "yml", "tpl", "txt"];

#[derive(Debug, thiserror::Error)]
pub enum StagingError {
    #[error("path rejected: {0}")]
    PathRejected(String),

    #[error("failed to apply patch to {file}: {message}")]
    PatchFailed { file: String, message: String },

    #[error("values patch could not be applied: {0}")]
    ValuesPatch(String),

    #[error("unsafe source-chart mutation detected and reverted ({0})")]
    SourceMutated(String),

    #[error("{0}")]
    FileSetChanged(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Normalize a model-supplied path and reject anything escaping the chart.
pub fn normalize_rel_path(raw: &str) -> Result<String, StagingError> {
    let cleaned = raw.trim().replace('\\', "/");
    let cleaned = cleaned.trim_start_matches("./");
    if cleaned.is_empty() {
        return Err(StagingError::PathRejected("empty path".to_string()));
    }
    let path = Path::new(cleaned);
    let mut parts = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
            Component::CurDir => {}
            Component::ParentDir => {
                return Err(StagingError::PathRejected(format!("`..` in {raw}")));
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(StagingError::PathRejected(format!("absolute path {raw}")));
            }
        }
    }
    Ok(parts.join("/"))
}

/// Only the values file and template sources may change.
pub fn in_scope(rel: &str, rel_values_path: &str) -> bool {
    if rel == rel_values_path {
        return true;
    }
    let Some(rest) = rel.strip_prefix("templates/") else {
        return false;
    };
    !rest.is_empty()
        && Path::new(rest)
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| TEMPLATE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
}

/// Template files under `chart_dir/templates` that fixes may edit, sorted.
pub fn template_files(chart_dir: &Path) -> Vec<String> {
    let root = chart_dir.join("templates");
    if !root.is_dir() {
        return Vec::new();
    }
    let mut out: Vec<String> = WalkDir::new(&root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| rel_path(chart_dir, e.path()).ok())
        .filter(|rel| !is_ignored(rel) && in_scope(rel, ""))
        .collect();
    out.sort();
    out
}

fn read_text_or_empty(path: &Path) -> std::io::Result<String> {
    match fs::read_to_string(path) {
        Ok(text) => Ok(text),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
        Err(e) => Err(e),
    }
}

/// Unified diff between two texts with `a/` and `b/` headers.
pub fn unified_diff(rel: &str, original: &str, updated: &str) -> String {
    let patch = diffy::create_patch(original, updated).to_string();
    let hunks = patch.splitn(3, '\n').nth(2).unwrap_or("");
    format!("--- a/{rel}\n+++ b/{rel}\n{hunks}")
}

/// A chart copy carrying candidate changes.
#[derive(Debug)]
pub struct StagedArtifact {
    workspace: TempDir,
    pub source_chart_dir: PathBuf,
    pub staged_chart_dir: PathBuf,
    pub rel_values_path: String,
    /// Sorted, relative to the chart root.
    pub changed_rel_paths: Vec<String>,
    /// sha256 of each changed source file before modification; `None` when
    /// the change creates the file.
    pub source_hashes: BTreeMap<String, Option<String>>,
    pub provider: Option<LlmProvider>,
    pub execution_log: String,
}

/// Paths that differ between the source chart and the staged copy.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct WorkspaceDelta {
    pub touched: Vec<String>,
    pub created: Vec<String>,
    pub deleted: Vec<String>,
}

impl StagedArtifact {
    /// Copy `chart_dir` into a fresh `chartmend-stage-*` workspace.
    pub fn create(chart_dir: &Path, values_file: &Path) -> Result<Self, StagingError> {
        let rel_values_path = rel_path(chart_dir, values_file)
            .map_err(|e| StagingError::PathRejected(e.to_string()))
            .and_then(|rel| normalize_rel_path(&rel))?;
        let workspace = tempfile::Builder::new().prefix(STAGE_PREFIX).tempdir()?;
        let name = chart_dir
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "chart".into());
        let staged_chart_dir = workspace.path().join(name);
        copy_tree(chart_dir, &staged_chart_dir)?;
        debug!(staged = %staged_chart_dir.display(), "chart staged");
        Ok(Self {
            workspace,
            source_chart_dir: chart_dir.to_path_buf(),
            staged_chart_dir,
            rel_values_path,
            changed_rel_paths: Vec::new(),
            source_hashes: BTreeMap::new(),
            provider: None,
            execution_log: String::new(),
        })
    }

    pub fn stage_root(&self) -> &Path {
        self.workspace.path()
    }

    pub fn staged_values_file(&self) -> PathBuf {
        self.staged_chart_dir.join(&self.rel_values_path)
    }

    pub fn source_values_file(&self) -> PathBuf {
        self.source_chart_dir.join(&self.rel_values_path)
    }

    pub fn has_changes(&self) -> bool {
        !self.changed_rel_paths.is_empty()
    }

    fn checked_rel(&self, raw: &str) -> Result<String, StagingError> {
        let rel = normalize_rel_path(raw)?;
        if !in_scope(&rel, &self.rel_values_path) {
            return Err(StagingError::PathRejected(format!("{rel} is outside the editable scope")));
        }
        Ok(rel)
    }

    /// Apply a parsed full-fix bundle to the staged copy.
    pub fn apply_response(&mut self, response: &FullFixResponse) -> Result<(), StagingError> {
        let mut touched = BTreeSet::new();

        if !response.values_patch.is_empty() {
            let path = self.staged_values_file();
            let text = fs::read_to_string(&path)?;
            let merged = merge_values_text(&text, &response.values_patch)
                .map_err(|e| StagingError::ValuesPatch(e.to_string()))?;
            fs::write(&path, merged)?;
            touched.insert(self.rel_values_path.clone());
        }

        for patch in &response.template_patches {
            let rel = self.checked_rel(&patch.file)?;
            self.apply_file_patch(&rel, patch)?;
            touched.insert(rel);
        }

        self.record_changes(touched)
    }

    fn apply_file_patch(&self, rel: &str, patch: &PatchFile) -> Result<(), StagingError> {
        let target = self.staged_chart_dir.join(rel);
        if let Some(content) = &patch.updated_content {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&target, content)?;
            return Ok(());
        }

        let failed = |message: String| StagingError::PatchFailed {
            file: rel.to_string(),
            message,
        };
        let original = read_text_or_empty(&self.source_chart_dir.join(rel))?;
        let current = read_text_or_empty(&target)?;
        let parsed =
            diffy::Patch::from_str(&patch.unified_diff).map_err(|e| failed(e.to_string()))?;
        let patched = diffy::apply(&original, &parsed).map_err(|e| failed(e.to_string()))?;
        let merged = if current == original {
            patched
        } else {
            diffy::merge(&original, &current, &patched).map_err(|_| {
                failed("conflicts with an earlier patch to the same file".to_string())
            })?
        };
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&target, merged)?;
        Ok(())
    }

    /// Keep only paths whose staged bytes differ from the source and record
    /// their source hashes.
    fn record_changes(&mut self, touched: BTreeSet<String>) -> Result<(), StagingError> {
        let mut changed: BTreeSet<String> = self.changed_rel_paths.iter().cloned().collect();
        for rel in touched {
            let staged = hash_file(&self.staged_chart_dir.join(&rel))?;
            let source = hash_file(&self.source_chart_dir.join(&rel))?;
            if staged == source {
                changed.remove(&rel);
                self.source_hashes.remove(&rel);
            } else {
                self.source_hashes.insert(rel.clone(), source);
                changed.insert(rel);
            }
        }
        self.changed_rel_paths = changed.into_iter().collect();
        Ok(())
    }

    /// Compare the staged copy against the source chart.
    pub fn delta(&self) -> Result<WorkspaceDelta, StagingError> {
        let before = snapshot_tree(&self.source_chart_dir)?;
        let after = snapshot_tree(&self.staged_chart_dir)?;
        Ok(diff_snapshots(&before, &after))
    }

    /// Reconcile in-place edits made by a provider: revert out-of-scope
    /// edits, reject created or deleted files, and record what remains.
    ///
    /// Returns the discarded out-of-scope paths.
    pub fn collect_direct_edits(&mut self) -> Result<Vec<String>, StagingError> {
        let delta = self.delta()?;
        let discarded: Vec<String> = delta
            .touched
            .iter()
            .filter(|rel| !in_scope(rel, &self.rel_values_path))
            .cloned()
            .collect();
        if !discarded.is_empty() {
            warn!(paths = %sample(&discarded), "discarding out-of-scope edits");
            restore_paths(&self.staged_chart_dir, &self.source_chart_dir, &discarded)?;
        }

        let delta = self.delta()?;
        if !delta.created.is_empty() {
            return Err(StagingError::FileSetChanged(format!(
                "File creation is forbidden in direct-edit mode: {}",
                sample(&delta.created)
            )));
        }
        if !delta.deleted.is_empty() {
            return Err(StagingError::FileSetChanged(format!(
                "File deletion is forbidden in direct-edit mode: {}",
                sample(&delta.deleted)
            )));
        }
        self.record_changes(delta.touched.into_iter().collect())?;
        Ok(discarded)
    }

    /// Express the staged changes as a `full_fix_response.v1` document.
    pub fn derive_response(
        &self,
        violations: &[Violation],
        summary: impl Into<String>,
    ) -> Result<FullFixResponse, StagingError> {
        let mut response = FullFixResponse::ok(summary);
        for rel in &self.changed_rel_paths {
            if *rel == self.rel_values_path {
                let before = load_values(&self.source_values_file())
                    .map_err(|e| StagingError::ValuesPatch(e.to_string()))?;
                let after = load_values(&self.staged_values_file())
                    .map_err(|e| StagingError::ValuesPatch(format!("staged values file: {e}")))?;
                response.values_patch = overlay_patch(&before, &after);
                continue;
            }
            let original = read_text_or_empty(&self.source_chart_dir.join(rel))?;
            let updated = fs::read_to_string(self.staged_chart_dir.join(rel))?;
            response.template_patches.push(PatchFile::diff(
                rel.clone(),
                "Edited directly by LLM in staged workspace.",
                unified_diff(rel, &original, &updated),
            ));
        }

        let (status, note) = if self.has_changes() {
            (CoverageStatus::Addressed, "Changes were produced in staged workspace.")
        } else {
            response.result = PatchResult::NoChange;
            (CoverageStatus::Unchanged, "No file changes produced.")
        };
        let mut seen = BTreeSet::new();
        for v in violations {
            if seen.insert(v.rule_id.clone()) {
                response.violation_coverage.push(CoverageRecord {
                    rule_id: v.rule_id.clone(),
                    status,
                    note: note.to_string(),
                });
            }
        }
        Ok(response)
    }
}

fn sample(paths: &[String]) -> String {
    let mut out = paths.iter().take(3).cloned().collect::<Vec<_>>().join(", ");
    if paths.len() > 3 {
        out.push_str("...");
    }
    out
}

fn diff_snapshots(
    before: &BTreeMap<String, String>,
    after: &BTreeMap<String, String>,
) -> WorkspaceDelta {
    let mut delta = WorkspaceDelta::default();
    for rel in changed_paths(before, after) {
        match (before.contains_key(&rel), after.contains_key(&rel)) {
            (false, true) => delta.created.push(rel.clone()),
            (true, false) => delta.deleted.push(rel.clone()),
            _ => {}
        }
        delta.touched.push(rel);
    }
    delta
}

/// Make `paths` under `target_root` match `snapshot_root` again.
fn restore_paths(
    target_root: &Path,
    snapshot_root: &Path,
    paths: &[String],
) -> std::io::Result<()> {
    for rel in paths {
        let target = target_root.join(rel);
        let snapshot = snapshot_root.join(rel);
        if snapshot.is_file() {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(&snapshot, &target)?;
        } else if target.exists() {
            fs::remove_file(&target)?;
        }
    }
    Ok(())
}

/// Snapshot of the real chart taken before a provider runs, so mutations of
/// the source can be detected and undone.
#[derive(Debug)]
pub struct SourceGuard {
    copy: TempDir,
    chart_dir: PathBuf,
    hashes: BTreeMap<String, String>,
}

impl SourceGuard {
    pub fn capture(chart_dir: &Path) -> Result<Self, StagingError> {
        let copy = tempfile::Builder::new().prefix(STAGE_PREFIX).tempdir()?;
        copy_tree(chart_dir, copy.path())?;
        let hashes = snapshot_tree(chart_dir)?;
        Ok(Self {
            copy,
            chart_dir: chart_dir.to_path_buf(),
            hashes,
        })
    }

    /// Revert any change to the source chart since capture.
    ///
    /// Returns `Err(SourceMutated)` listing the reverted paths when the
    /// source had been touched.
    pub fn verify_untouched(&self) -> Result<(), StagingError> {
        let now = snapshot_tree(&self.chart_dir)?;
        let touched = changed_paths(&self.hashes, &now);
        if touched.is_empty() {
            return Ok(());
        }
        restore_paths(&self.chart_dir, self.copy.path(), &touched)?;
        Err(StagingError::SourceMutated(sample(&touched)))
    }
}
