//! Commit a verified staged bundle into the real chart directory.
//!
//! Guarded by optimistic concurrency: every changed path must still hash to
//! what it was when the bundle was staged. Files are first copied into
//! sibling temporaries, then renamed into place; a failed rename rolls back
//! the renames that already happened.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{info, instrument, warn};

use crate::domain::BundleVerification;
use crate::obs;
use crate::staging::{in_scope, normalize_rel_path, StagedArtifact};
use crate::tree::{hash_file, write_atomic};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplyErrorKind {
    NotVerified,
    IntegrityConflict,
    PathRejected,
    CopyFailed,
    CommitFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplyStatus {
    Ok,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct ApplyResult {
    pub ok: bool,
    pub status: ApplyStatus,
    pub error_kind: Option<ApplyErrorKind>,
    /// Chart-relative paths written; empty unless `ok`.
    pub touched_files: Vec<String>,
    pub errors: Vec<String>,
    pub applied_at: Option<DateTime<Utc>>,
}

impl ApplyResult {
    fn applied(touched_files: Vec<String>) -> Self {
        Self {
            ok: true,
            status: ApplyStatus::Ok,
            error_kind: None,
            touched_files,
            errors: Vec::new(),
            applied_at: Some(Utc::now()),
        }
    }

    fn refused(kind: ApplyErrorKind, errors: Vec<String>) -> Self {
        Self {
            ok: false,
            status: ApplyStatus::Error,
            error_kind: Some(kind),
            touched_files: Vec::new(),
            errors,
            applied_at: None,
        }
    }
}

/// A staged file copied next to its target, waiting to be renamed.
struct Prepared {
    rel: String,
    target: PathBuf,
    temp: NamedTempFile,
    original: Option<Vec<u8>>,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct FixApplier;

impl FixApplier {
    pub fn new() -> Self {
        Self
    }

    /// Write every changed path of `artifact` into `chart_dir`, or nothing.
    #[instrument(skip_all, fields(chart_dir = %chart_dir.display()))]
    pub fn apply_bundle(
        &self,
        artifact: &StagedArtifact,
        verification: &BundleVerification,
        chart_dir: &Path,
    ) -> ApplyResult {
        let result = self.apply_inner(artifact, verification, chart_dir);
        obs::emit_apply_completed(
            &chart_dir.display().to_string(),
            result.ok,
            result.touched_files.len(),
        );
        result
    }

    fn apply_inner(
        &self,
        artifact: &StagedArtifact,
        verification: &BundleVerification,
        chart_dir: &Path,
    ) -> ApplyResult {
        if !verification.is_verified() {
            return ApplyResult::refused(
                ApplyErrorKind::NotVerified,
                vec![format!(
                    "Bundle verification is {}; refusing to apply. {}",
                    verification.status, verification.note
                )],
            );
        }

        let mut rels = Vec::with_capacity(artifact.changed_rel_paths.len());
        for raw in &artifact.changed_rel_paths {
            match normalize_rel_path(raw) {
                Ok(rel) if in_scope(&rel, &artifact.rel_values_path) => rels.push(rel),
                Ok(rel) => {
                    return ApplyResult::refused(
                        ApplyErrorKind::PathRejected,
                        vec![format!("{rel} is outside the editable scope")],
                    )
                }
                Err(e) => {
                    return ApplyResult::refused(ApplyErrorKind::PathRejected, vec![e.to_string()])
                }
            }
        }

        let conflicts = integrity_conflicts(artifact, chart_dir, &rels);
        if !conflicts.is_empty() {
            warn!(files = conflicts.len(), "chart changed since staging");
            return ApplyResult::refused(ApplyErrorKind::IntegrityConflict, conflicts);
        }

        // ---- prepare ----
        let mut prepared = Vec::with_capacity(rels.len());
        let mut created_dirs = Vec::new();
        for rel in &rels {
            match prepare(artifact, chart_dir, rel, &mut created_dirs) {
                Ok(p) => prepared.push(p),
                Err(e) => {
                    let mut errors = vec![format!("Failed to prepare {rel}: {e}")];
                    errors.extend(
                        prepared
                            .iter()
                            .map(|p| format!("Discarded prepared copy of {}", p.rel)),
                    );
                    drop(prepared);
                    errors.extend(remove_created_dirs(&created_dirs));
                    return ApplyResult::refused(ApplyErrorKind::CopyFailed, errors);
                }
            }
        }

        // ---- commit ----
        let mut committed: Vec<(PathBuf, Option<Vec<u8>>)> = Vec::with_capacity(prepared.len());
        let mut pending = prepared.into_iter();
        while let Some(Prepared {
            rel,
            target,
            temp,
            original,
        }) = pending.next()
        {
            if let Err(e) = temp.persist(&target) {
                let mut errors = vec![format!("Failed to commit {rel}: {}", e.error)];
                errors.extend(rollback(&committed));
                // remaining temporaries live in the created directories
                drop(e);
                drop(pending);
                errors.extend(remove_created_dirs(&created_dirs));
                return ApplyResult::refused(ApplyErrorKind::CommitFailed, errors);
            }
            committed.push((target, original));
        }

        info!(files = rels.len(), "bundle applied");
        ApplyResult::applied(rels)
    }
}

fn integrity_conflicts(
    artifact: &StagedArtifact,
    chart_dir: &Path,
    rels: &[String],
) -> Vec<String> {
    let mut conflicts = Vec::new();
    for rel in rels {
        let Some(expected) = artifact.source_hashes.get(rel) else {
            conflicts.push(format!("{rel}: no recorded source hash"));
            continue;
        };
        match hash_file(&chart_dir.join(rel)) {
            Ok(current) if current == *expected => {}
            Ok(None) => conflicts.push(format!("{rel}: removed since staging")),
            Ok(Some(_)) if expected.is_none() => {
                conflicts.push(format!("{rel}: created since staging"))
            }
            Ok(Some(_)) => conflicts.push(format!("{rel}: modified since staging")),
            Err(e) => conflicts.push(format!("{rel}: {e}")),
        }
    }
    conflicts
}

/// Copy one staged file next to its target. Directories it had to create
/// are appended to `created_dirs`, outermost first.
fn prepare(
    artifact: &StagedArtifact,
    chart_dir: &Path,
    rel: &str,
    created_dirs: &mut Vec<PathBuf>,
) -> std::io::Result<Prepared> {
    let target = chart_dir.join(rel);
    let staged = fs::read(artifact.staged_chart_dir.join(rel))?;
    let original = match fs::read(&target) {
        Ok(bytes) => Some(bytes),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => return Err(e),
    };
    let dir = target.parent().unwrap_or(chart_dir);
    let missing: Vec<&Path> = dir.ancestors().take_while(|d| !d.exists()).collect();
    for d in missing.into_iter().rev() {
        fs::create_dir(d)?;
        created_dirs.push(d.to_path_buf());
    }
    let mut temp = NamedTempFile::new_in(dir)?;
    temp.write_all(&staged)?;
    temp.as_file().sync_all()?;
    Ok(Prepared {
        rel: rel.to_string(),
        target,
        temp,
        original,
    })
}

/// Remove directories an aborted apply created, innermost first. Only
/// failures are reported.
fn remove_created_dirs(created_dirs: &[PathBuf]) -> Vec<String> {
    created_dirs
        .iter()
        .rev()
        .filter_map(|dir| {
            fs::remove_dir(dir)
                .err()
                .map(|e| format!("Failed to remove {}: {e}", dir.display()))
        })
        .collect()
}

/// Put committed targets back the way they were; one note per target.
fn rollback(committed: &[(PathBuf, Option<Vec<u8>>)]) -> Vec<String> {
    let mut errors = Vec::new();
    for (target, original) in committed.iter().rev() {
        let restored = match original {
            Some(bytes) => write_atomic(target, bytes),
            None => fs::remove_file(target),
        };
        if let Err(e) = restored {
            errors.push(format!("Rollback of {} failed: {e}", target.display()));
        } else {
            errors.push(format!("Rolled back {}", target.display()));
        }
    }
    errors
}
