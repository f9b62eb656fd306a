//! Archive creation for backup runs.
//!
//! [`Archiver`] is the compress/extract seam for directory trees;
//! [`ArchiveBuilder`] turns the configured paths and databases into archive
//! files in the run's scratch directory and describes them in a
//! [`BackupManifest`].

pub mod tar_zstd;

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::Semaphore;
use tracing::{error, info, warn};

use crate::config::{path_basename, Config, Environment};
use crate::database::{without_system_schemas, DatabaseTool};
use crate::executor::manifest::{
    db_archive_name, path_archive_name, BackupManifest, DbArchive, PathArchive,
};
use crate::timestamp::BackupTimestamp;
use crate::utils::ArchiveError;

pub use tar_zstd::TarZstdArchiver;

/// What a finished archive contains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ArchiveStats {
    pub size_bytes: u64,
    pub file_count: usize,
}

/// Compress a directory tree into one file and back. Blocking; callers run
/// it on the blocking pool.
pub trait Archiver: Send + Sync {
    /// Archive the contents of `source` (not the directory itself) to `dest`,
    /// skipping names that contain any of `exclude`.
    fn compress(&self, source: &Path, dest: &Path, exclude: &[String]) -> io::Result<ArchiveStats>;

    /// Unpack `archive` into `dest`, creating it if needed.
    fn extract(&self, archive: &Path, dest: &Path) -> io::Result<()>;
}

pub struct ArchiveBuilder {
    config: Arc<Config>,
    env: Environment,
    archiver: Arc<dyn Archiver>,
    database: Arc<dyn DatabaseTool>,
}

impl ArchiveBuilder {
    pub fn new(
        config: Arc<Config>,
        env: Environment,
        archiver: Arc<dyn Archiver>,
        database: Arc<dyn DatabaseTool>,
    ) -> Self {
        Self {
            config,
            env,
            archiver,
            database,
        }
    }

    /// Databases to dump: the configured list, or every user database when
    /// the list is empty. Nothing without a database password.
    pub async fn databases(&self) -> Result<Vec<String>, ArchiveError> {
        let configured = &self.config.backup.databases;

        if !self.config.databases_enabled() {
            if !configured.is_empty() {
                warn!(
                    count = configured.len(),
                    "No database password configured, skipping database dumps"
                );
            }
            return Ok(Vec::new());
        }

        if !configured.is_empty() {
            return Ok(configured.clone());
        }

        let listed = self
            .database
            .list_databases()
            .await
            .map_err(|e| ArchiveError::DiscoveryFailed(e.to_string()))?;
        let databases = without_system_schemas(listed);
        info!(count = databases.len(), databases = ?databases, "Discovered databases");
        Ok(databases)
    }

    /// Archive every configured path and dump every database into `scratch`.
    ///
    /// All tasks are allowed to settle before the first failure is returned;
    /// files already written stay in `scratch` for the caller to remove.
    pub async fn build(
        &self,
        timestamp: BackupTimestamp,
        scratch: &Path,
    ) -> Result<BackupManifest, ArchiveError> {
        let databases = self.databases().await?;
        let service = self.config.service.name.clone();
        let semaphore = Arc::new(Semaphore::new(self.config.performance.max_parallel_jobs));

        info!(
            %timestamp,
            paths = self.config.backup.paths.len(),
            databases = databases.len(),
            workers = self.config.performance.max_parallel_jobs,
            "Building archives"
        );

        let mut path_handles = Vec::with_capacity(self.config.backup.paths.len());
        for source in &self.config.backup.paths {
            let sem = Arc::clone(&semaphore);
            let archiver = Arc::clone(&self.archiver);
            let exclude = self.config.backup.exclude.clone();
            let basename = path_basename(source).unwrap_or_default();
            let file_name = path_archive_name(&service, &basename, &timestamp);
            let dest = scratch.join(&file_name);
            let source_path = source.clone();

            let handle = tokio::spawn(async move {
                let source = source_path;
                let _permit = sem.acquire_owned().await.map_err(|e| unreadable(&source, e))?;

                let task_source = source.clone();
                let stats = tokio::task::spawn_blocking(move || {
                    archiver.compress(&task_source, &dest, &exclude)
                })
                .await
                .map_err(|e| unreadable(&source, e))?
                .map_err(|e| unreadable(&source, e))?;

                info!(
                    path = %source.display(),
                    archive = %file_name,
                    size_bytes = stats.size_bytes,
                    files = stats.file_count,
                    "Path archived"
                );

                Ok::<_, ArchiveError>(PathArchive {
                    source_path: source,
                    archive_file_name: file_name,
                    size_bytes: stats.size_bytes,
                    file_count: stats.file_count,
                })
            });
            path_handles.push((source.clone(), handle));
        }

        let mut db_handles = Vec::with_capacity(databases.len());
        for db in databases {
            let sem = Arc::clone(&semaphore);
            let tool = Arc::clone(&self.database);
            let file_name = db_archive_name(&service, &db, &timestamp);
            let dest = scratch.join(&file_name);
            let task_db = db.clone();

            let handle = tokio::spawn(async move {
                let db = task_db;
                let _permit = sem.acquire_owned().await.map_err(|e| dump_failed(&db, e))?;

                let raw_bytes = tool.dump(&db, &dest).await.map_err(|e| dump_failed(&db, e))?;
                if raw_bytes == 0 {
                    return Err(dump_failed(&db, "dump produced no output"));
                }
                let size_bytes = tokio::fs::metadata(&dest)
                    .await
                    .map_err(|e| dump_failed(&db, e))?
                    .len();

                info!(db = %db, archive = %file_name, raw_bytes, size_bytes, "Database archived");

                Ok(DbArchive {
                    db_name: db,
                    archive_file_name: file_name,
                    size_bytes,
                })
            });
            db_handles.push((db, handle));
        }

        let mut manifest = BackupManifest::new(&service, self.env, timestamp);
        let mut first_error = None;

        for (source, handle) in path_handles {
            match handle.await {
                Ok(Ok(archive)) => manifest.path_archives.push(archive),
                Ok(Err(e)) => {
                    error!(path = %source.display(), error = %e, "Path archive failed");
                    first_error.get_or_insert(e);
                }
                Err(e) => {
                    error!(path = %source.display(), error = %e, "Path archive task panicked");
                    first_error.get_or_insert(unreadable(&source, e));
                }
            }
        }

        for (db, handle) in db_handles {
            match handle.await {
                Ok(Ok(archive)) => manifest.db_archives.push(archive),
                Ok(Err(e)) => {
                    error!(db = %db, error = %e, "Database dump failed");
                    first_error.get_or_insert(e);
                }
                Err(e) => {
                    error!(db = %db, error = %e, "Database dump task panicked");
                    first_error.get_or_insert(dump_failed(&db, e));
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(manifest),
        }
    }
}

fn unreadable(path: &Path, reason: impl ToString) -> ArchiveError {
    ArchiveError::PathUnreadable {
        path: PathBuf::from(path),
        reason: reason.to_string(),
    }
}

fn dump_failed(db: &str, reason: impl ToString) -> ArchiveError {
    ArchiveError::DatabaseDumpFailed {
        db: db.to_string(),
        reason: reason.to_string(),
    }
}
