//! Backup runs.
//!
//! `Init -> Building -> Uploading -> Pruning -> Done`, with `Failed`
//! reachable from every non-terminal phase. Nothing is pruned unless the new
//! backup is sealed in both regions, and a failed upload leaves no object
//! under the new timestamp in either region.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::NaiveDateTime;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use super::manifest::BackupManifest;
use super::report::{ArtifactKind, RunMode, RunReport};
use super::SyncContext;
use crate::archive::ArchiveBuilder;
use crate::retention::{expired, RetentionPolicy};
use crate::storage::{object_key, timestamp_prefix, Region, MANIFEST_FILE_NAME};
use crate::timestamp::BackupTimestamp;
use crate::utils::{Result, StorageError, SyncError};

const TIMESTAMP_ATTEMPTS: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupPhase {
    Init,
    Building,
    Uploading,
    Pruning,
    Done,
    Failed,
}

impl BackupPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, BackupPhase::Done | BackupPhase::Failed)
    }

    pub fn can_advance_to(self, next: BackupPhase) -> bool {
        use BackupPhase::*;
        match (self, next) {
            (Init, Building) | (Building, Uploading) | (Uploading, Pruning) | (Pruning, Done) => {
                true
            }
            (from, Failed) => !from.is_terminal(),
            _ => false,
        }
    }
}

struct PhaseTracker {
    phase: BackupPhase,
    timestamp: BackupTimestamp,
}

impl PhaseTracker {
    fn advance(&mut self, next: BackupPhase) {
        debug_assert!(
            self.phase.can_advance_to(next),
            "illegal transition {:?} -> {:?}",
            self.phase,
            next
        );
        info!(timestamp = %self.timestamp, from = ?self.phase, to = ?next, "Backup phase");
        self.phase = next;
    }
}

/// Run one backup of every configured path and database.
pub async fn run_backup(ctx: &SyncContext) -> Result<RunReport> {
    let started = Instant::now();
    let timestamp = claim_timestamp(ctx).await?;
    let mut report = RunReport::new(RunMode::Backup, ctx.env);
    report.timestamp = Some(timestamp);

    let mut tracker = PhaseTracker {
        phase: BackupPhase::Init,
        timestamp,
    };
    let scratch = ctx.create_scratch(&timestamp).await?;

    tracker.advance(BackupPhase::Building);
    let builder = ArchiveBuilder::new(
        Arc::clone(&ctx.config),
        ctx.env,
        Arc::clone(&ctx.archiver),
        Arc::clone(&ctx.database),
    );
    let manifest = match builder.build(timestamp, &scratch).await {
        Ok(manifest) => manifest,
        Err(e) => {
            error!(%timestamp, error = %e, "Archive build failed, nothing uploaded");
            tracker.advance(BackupPhase::Failed);
            report.fatal = Some(e.to_string());
            ctx.remove_scratch(&scratch).await;
            report.duration = started.elapsed();
            return Ok(report);
        }
    };

    tracker.advance(BackupPhase::Uploading);
    if let Err(reason) = upload(ctx, &manifest, &scratch, &mut report).await {
        tracker.advance(BackupPhase::Failed);
        rollback(ctx, &timestamp, &mut report).await;
        report.fatal = Some(format!("{}; backup {} rolled back", reason, timestamp));
        ctx.remove_scratch(&scratch).await;
        report.duration = started.elapsed();
        return Ok(report);
    }

    tracker.advance(BackupPhase::Pruning);
    let policy = RetentionPolicy::new(ctx.config.backup.retention_days);
    prune(ctx, &timestamp, policy, BackupTimestamp::now().datetime(), &mut report).await;

    tracker.advance(BackupPhase::Done);
    ctx.remove_scratch(&scratch).await;
    report.duration = started.elapsed();

    info!(
        %timestamp,
        archives = manifest.archive_files().len(),
        total_bytes = manifest.total_bytes(),
        "Backup complete"
    );
    Ok(report)
}

/// A timestamp with no object under its prefix in either region. Runs that
/// start within the same second wait for the next one.
async fn claim_timestamp(ctx: &SyncContext) -> Result<BackupTimestamp> {
    let mut timestamp = BackupTimestamp::now();

    for _ in 0..TIMESTAMP_ATTEMPTS {
        let prefix = timestamp_prefix(&timestamp);
        let mut taken = false;
        for gateway in ctx.regions.iter() {
            if !gateway.list(&prefix).await?.is_empty() {
                debug!(%timestamp, region = %gateway.region(), "Timestamp already in use");
                taken = true;
                break;
            }
        }
        if !taken {
            return Ok(timestamp);
        }

        while BackupTimestamp::now() <= timestamp {
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
        timestamp = BackupTimestamp::now();
    }

    Err(SyncError::Io(std::io::Error::new(
        std::io::ErrorKind::AlreadyExists,
        format!("no free backup timestamp after {} attempts", TIMESTAMP_ATTEMPTS),
    )))
}

/// Upload every archive to both regions, then seal with the manifest.
/// Returns the reason of the first failure once every upload has settled.
async fn upload(
    ctx: &SyncContext,
    manifest: &BackupManifest,
    scratch: &Path,
    report: &mut RunReport,
) -> std::result::Result<(), String> {
    let semaphore = Arc::new(Semaphore::new(ctx.config.performance.max_parallel_jobs));
    let mut handles = Vec::new();

    let archives = manifest
        .path_archives
        .iter()
        .map(|a| (ArtifactKind::PathArchive, &a.archive_file_name, a.size_bytes))
        .chain(
            manifest
                .db_archives
                .iter()
                .map(|a| (ArtifactKind::DatabaseArchive, &a.archive_file_name, a.size_bytes)),
        );

    for (kind, file_name, size_bytes) in archives {
        let sem = Arc::clone(&semaphore);
        let regions = ctx.regions.clone();
        let key = object_key(&manifest.timestamp, file_name);
        let local = scratch.join(file_name);

        let handle = tokio::spawn(async move {
            let _permit = sem
                .acquire_owned()
                .await
                .map_err(|e| format!("worker pool closed: {}", e))?;
            for gateway in regions.iter() {
                gateway.put(&key, &local).await.map_err(|e| e.to_string())?;
            }
            Ok::<(), String>(())
        });
        handles.push((kind, file_name.clone(), size_bytes, handle));
    }

    let mut first_failure = None;
    for (kind, file_name, size_bytes, handle) in handles {
        let outcome = match handle.await {
            Ok(outcome) => outcome,
            Err(e) => Err(format!("upload task panicked: {}", e)),
        };
        match outcome {
            Ok(()) => {
                info!(archive = %file_name, size_bytes, "Archive stored in both regions");
                report.succeeded(kind, file_name, Some(size_bytes));
            }
            Err(reason) => {
                error!(archive = %file_name, error = %reason, "Archive upload failed");
                report.failed(kind, file_name.clone(), &reason);
                first_failure.get_or_insert(format!("upload of {} failed", file_name));
            }
        }
    }

    if let Some(reason) = first_failure {
        return Err(reason);
    }

    let manifest_path = scratch.join(MANIFEST_FILE_NAME);
    let json = manifest
        .to_json()
        .map_err(|e| format!("manifest serialization failed: {}", e))?;
    tokio::fs::write(&manifest_path, &json)
        .await
        .map_err(|e| format!("manifest write failed: {}", e))?;

    let key = object_key(&manifest.timestamp, MANIFEST_FILE_NAME);
    for gateway in ctx.regions.iter() {
        if let Err(e) = gateway.put(&key, &manifest_path).await {
            error!(region = %gateway.region(), error = %e, "Manifest upload failed");
            report.failed(ArtifactKind::Manifest, MANIFEST_FILE_NAME, &e);
            return Err(format!("manifest upload to {} failed", gateway.region()));
        }
    }
    report.succeeded(ArtifactKind::Manifest, MANIFEST_FILE_NAME, Some(json.len() as u64));

    Ok(())
}

/// Delete everything stored under `timestamp` in both regions.
async fn rollback(ctx: &SyncContext, timestamp: &BackupTimestamp, report: &mut RunReport) {
    let prefix = timestamp_prefix(timestamp);
    warn!(%timestamp, "Rolling back partial backup");

    for gateway in ctx.regions.iter() {
        let outcome = gateway.delete_prefix(&prefix).await;
        info!(
            region = %gateway.region(),
            deleted = outcome.deleted.len(),
            failures = outcome.failures.len(),
            "Rollback"
        );
        for failure in outcome.failures {
            error!(error = %failure, "Rollback left an object behind");
            report.warn(format!("rollback: {}", failure));
        }
    }
}

/// Purge backups past the retention window from both regions.
pub(crate) async fn prune(
    ctx: &SyncContext,
    current: &BackupTimestamp,
    policy: RetentionPolicy,
    now: NaiveDateTime,
    report: &mut RunReport,
) {
    let listings = ctx.regions.listings().await;
    let mut prefixes = Vec::new();

    for region in Region::ALL {
        match listings.get(region) {
            Ok(listing) => prefixes.extend(listing.prefixes()),
            Err(e) => {
                warn!(region = %region, error = %e, "Cannot list region for pruning");
                report.failed(ArtifactKind::Prune, format!("retention ({})", region), e);
            }
        }
    }

    let outcome = expired(&prefixes, policy, now);
    for entry in &outcome.malformed {
        warn!(prefix = %entry, "Ignoring unrecognised prefix during pruning");
        report.warn(format!("retention ignored unrecognised prefix '{}'", entry));
    }

    for timestamp in outcome.expired.iter().filter(|ts| *ts != current) {
        let prefix = timestamp_prefix(timestamp);
        let mut failures: Vec<StorageError> = Vec::new();
        let mut deleted = 0;

        for gateway in ctx.regions.iter() {
            let result = gateway.delete_prefix(&prefix).await;
            deleted += result.deleted.len();
            failures.extend(result.failures);
        }

        if failures.is_empty() {
            info!(%timestamp, objects = deleted, "Expired backup pruned");
            report.succeeded(ArtifactKind::Prune, format!("prune {}", timestamp), None);
        } else {
            for failure in &failures {
                error!(%timestamp, error = %failure, "Prune failed");
            }
            report.failed(
                ArtifactKind::Prune,
                format!("prune {}", timestamp),
                format!("{} object(s) could not be deleted: {}", failures.len(), failures[0]),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_transitions() {
        use BackupPhase::*;
        assert!(Init.can_advance_to(Building));
        assert!(Uploading.can_advance_to(Pruning));
        assert!(Pruning.can_advance_to(Failed));
        assert!(!Building.can_advance_to(Pruning));
        assert!(!Done.can_advance_to(Failed));
        assert!(!Failed.can_advance_to(Building));
    }
}
