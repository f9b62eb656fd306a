//! Restore runs.
//!
//! Paths are restored in manifest order and the first failure stops the run,
//! leaving earlier paths restored and everything after reported as skipped.
//! Database failures are collected and do not stop the remaining databases.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Instant;

use tokio::process::Command;
use tracing::{error, info, warn};

use super::manifest::{BackupManifest, DbArchive, PathArchive};
use super::report::{ArtifactKind, RunMode, RunReport};
use super::SyncContext;
use crate::config::path_basename;
use crate::fs::tree::replace_contents;
use crate::resolver::{check_complete, resolve, ResolvedBackup, RestoreSelector};
use crate::storage::{object_key, RegionListings, MANIFEST_FILE_NAME};
use crate::utils::{ResolveError, RestoreError, Result, StorageError};

#[derive(Debug, Clone)]
pub struct RestoreRequest {
    pub selector: RestoreSelector,

    /// Script run after the restore with `<timestamp> <env>`
    pub extra: Option<PathBuf>,

    /// Accept a backup sealed in one region only
    pub force: bool,
}

pub async fn run_restore(ctx: &SyncContext, request: &RestoreRequest) -> Result<RunReport> {
    let started = Instant::now();
    let mut report = RunReport::new(RunMode::Restore, ctx.env);

    let listings = ctx.regions.listings().await;
    let resolved = resolve(&request.selector, &listings, request.force)?;
    report.timestamp = Some(resolved.timestamp);
    report.degraded = resolved.degraded;

    info!(
        timestamp = %resolved.timestamp,
        selector = %request.selector,
        authority = %resolved.authority,
        degraded = resolved.degraded,
        "Restore point resolved"
    );

    let scratch = ctx.create_scratch(&resolved.timestamp).await?;
    let outcome = restore_from(ctx, &resolved, &listings, request, &scratch, &mut report).await;
    ctx.remove_scratch(&scratch).await;
    outcome?;

    report.duration = started.elapsed();
    Ok(report)
}

async fn restore_from(
    ctx: &SyncContext,
    resolved: &ResolvedBackup,
    listings: &RegionListings,
    request: &RestoreRequest,
    scratch: &Path,
    report: &mut RunReport,
) -> Result<()> {
    let manifest = fetch_manifest(ctx, resolved, scratch).await?;
    check_complete(resolved, &manifest, listings)?;

    let mut aborted: Option<String> = None;

    for archive in &manifest.path_archives {
        let name = archive.source_path.display().to_string();
        if let Some(reason) = &aborted {
            report.skipped(ArtifactKind::PathRestore, name, reason);
            continue;
        }
        match restore_path(ctx, resolved, archive, scratch).await {
            Ok(()) => {
                info!(path = %name, "Path restored");
                report.succeeded(ArtifactKind::PathRestore, name, Some(archive.size_bytes));
            }
            Err(e) => {
                error!(error = %e, "Path restore failed, aborting remaining steps");
                aborted = Some(format!("aborted after failure of {}", name));
                report.restore_failed(e);
            }
        }
    }

    for archive in &manifest.db_archives {
        if let Some(reason) = &aborted {
            report.skipped(ArtifactKind::DatabaseRestore, archive.db_name.clone(), reason);
            continue;
        }
        match restore_database(ctx, resolved, archive, scratch).await {
            Ok(()) => {
                info!(db = %archive.db_name, "Database restored");
                report.succeeded(
                    ArtifactKind::DatabaseRestore,
                    archive.db_name.clone(),
                    Some(archive.size_bytes),
                );
            }
            Err(e) => {
                error!(error = %e, "Database restore failed");
                report.restore_failed(e);
            }
        }
    }

    if let Some(script) = &request.extra {
        let name = script.display().to_string();
        match &aborted {
            Some(reason) => report.skipped(ArtifactKind::Hook, name, reason),
            None => match run_hook(ctx, script, resolved).await {
                Ok(()) => report.succeeded(ArtifactKind::Hook, name, None),
                Err(reason) => {
                    warn!(script = %name, error = %reason, "Post-restore script failed");
                    report.failed(ArtifactKind::Hook, name, reason);
                }
            },
        }
    }

    Ok(())
}

async fn fetch_manifest(
    ctx: &SyncContext,
    resolved: &ResolvedBackup,
    scratch: &Path,
) -> Result<BackupManifest> {
    let local = scratch.join(MANIFEST_FILE_NAME);
    let key = object_key(&resolved.timestamp, MANIFEST_FILE_NAME);
    let unreadable = |reason: String| ResolveError::ManifestUnreadable {
        timestamp: resolved.timestamp,
        reason,
    };

    download(ctx, resolved, &key, &local)
        .await
        .map_err(|e| unreadable(e.to_string()))?;
    let bytes = tokio::fs::read(&local).await?;
    let manifest = BackupManifest::from_json(&bytes).map_err(|e| unreadable(e.to_string()))?;

    if manifest.environment != ctx.env {
        return Err(unreadable(format!(
            "manifest belongs to environment {}",
            manifest.environment
        ))
        .into());
    }

    Ok(manifest)
}

/// Download from the authoritative region, falling back to the other one
/// when it was verified to hold the backup.
async fn download(
    ctx: &SyncContext,
    resolved: &ResolvedBackup,
    key: &str,
    local: &Path,
) -> std::result::Result<(), StorageError> {
    let primary_attempt = ctx.regions.get(resolved.authority).get(key, local).await;
    match primary_attempt {
        Ok(()) => Ok(()),
        Err(e) if resolved.other_region_verified => {
            let other = resolved.authority.other();
            warn!(key, error = %e, fallback = %other, "Download failed, trying other region");
            ctx.regions.get(other).get(key, local).await
        }
        Err(e) => Err(e),
    }
}

async fn restore_path(
    ctx: &SyncContext,
    resolved: &ResolvedBackup,
    archive: &PathArchive,
    scratch: &Path,
) -> std::result::Result<(), RestoreError> {
    let target = archive.source_path.clone();
    let failed = |reason: String| RestoreError::PathRestoreFailed {
        path: target.clone(),
        reason,
    };

    let local = scratch.join(&archive.archive_file_name);
    let key = object_key(&resolved.timestamp, &archive.archive_file_name);
    download(ctx, resolved, &key, &local)
        .await
        .map_err(|e| failed(e.to_string()))?;

    let basename = path_basename(&target).unwrap_or_else(|| "root".to_string());
    let staging = scratch.join("staging").join(basename);
    let archiver = Arc::clone(&ctx.archiver);
    let destination = target.clone();

    let moved = tokio::task::spawn_blocking(move || {
        archiver.extract(&local, &staging)?;
        replace_contents(&staging, &destination)
    })
    .await
    .map_err(|e| failed(format!("restore task panicked: {}", e)))?
    .map_err(|e| failed(e.to_string()))?;

    info!(path = %target.display(), entries = moved, "Path contents replaced");
    Ok(())
}

async fn restore_database(
    ctx: &SyncContext,
    resolved: &ResolvedBackup,
    archive: &DbArchive,
    scratch: &Path,
) -> std::result::Result<(), RestoreError> {
    let failed = |reason: String| RestoreError::DatabaseRestoreFailed {
        db: archive.db_name.clone(),
        reason,
    };

    if !ctx.config.databases_enabled() {
        return Err(failed("no database password configured".to_string()));
    }

    let local = scratch.join(&archive.archive_file_name);
    let key = object_key(&resolved.timestamp, &archive.archive_file_name);
    download(ctx, resolved, &key, &local)
        .await
        .map_err(|e| failed(e.to_string()))?;

    ctx.database
        .restore(&archive.db_name, &local)
        .await
        .map_err(|e| failed(e.to_string()))
}

/// Run the post-restore script with `<timestamp> <env>`.
async fn run_hook(
    ctx: &SyncContext,
    script: &Path,
    resolved: &ResolvedBackup,
) -> std::result::Result<(), String> {
    let timeout = ctx.config.hook_timeout();
    info!(script = %script.display(), "Running post-restore script");

    let child = Command::new(script)
        .arg(resolved.timestamp.to_string())
        .arg(ctx.env.as_str())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| format!("failed to start: {}", e))?;

    let output = tokio::time::timeout(timeout, child.wait_with_output())
        .await
        .map_err(|_| format!("timed out after {}s", timeout.as_secs()))?
        .map_err(|e| e.to_string())?;

    for line in String::from_utf8_lossy(&output.stdout).lines() {
        info!(script = %script.display(), "{}", line);
    }

    if output.status.success() {
        Ok(())
    } else {
        Err(format!(
            "{}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        ))
    }
}
