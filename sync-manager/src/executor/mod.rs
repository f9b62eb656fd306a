//! Run orchestration.
//!
//! A [`SyncContext`] carries everything a run needs: the validated
//! configuration, the target environment, both storage regions and the
//! archive and database tools. The three run modes live in their own
//! modules and all return a [`RunReport`].

pub mod backup;
pub mod lock;
pub mod manifest;
pub mod report;
pub mod restore;
pub mod show;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::archive::{Archiver, TarZstdArchiver};
use crate::config::{Config, Environment};
use crate::database::{DatabaseTool, MariaDbTool};
use crate::resolver::RestoreSelector;
use crate::storage::RegionPair;
use crate::timestamp::BackupTimestamp;
use crate::utils::{ArchiveError, Result};

pub use lock::RunLock;
pub use report::{RunMode, RunReport, Verdict};
pub use restore::RestoreRequest;

/// What an invocation was asked to do.
#[derive(Debug, Clone)]
pub enum Mode {
    Backup,
    Restore(RestoreRequest),
    Show { selector: RestoreSelector },
}

pub struct SyncContext {
    pub config: Arc<Config>,
    pub env: Environment,
    pub regions: RegionPair,
    pub archiver: Arc<dyn Archiver>,
    pub database: Arc<dyn DatabaseTool>,
}

impl SyncContext {
    pub fn new(
        config: Arc<Config>,
        env: Environment,
        regions: RegionPair,
        archiver: Arc<dyn Archiver>,
        database: Arc<dyn DatabaseTool>,
    ) -> Self {
        Self {
            config,
            env,
            regions,
            archiver,
            database,
        }
    }

    /// Production wiring: S3 in both regions, tar+zstd archives, MariaDB.
    pub async fn connect(config: Arc<Config>, env: Environment) -> Self {
        let regions = RegionPair::connect(&config, env).await;
        let database = MariaDbTool::new(config.database.clone(), config.subprocess_timeout());
        Self::new(
            config,
            env,
            regions,
            Arc::new(TarZstdArchiver::default()),
            Arc::new(database),
        )
    }

    pub fn lock(&self) -> Result<RunLock> {
        RunLock::acquire(&self.config.scratch_root(), &self.config.service.name, self.env)
    }

    /// `{scratch}/{env}`: parent of every run directory of this environment
    pub fn scratch_env_dir(&self) -> PathBuf {
        self.config.scratch_root().join(self.env.as_str())
    }

    /// `{scratch}/{env}/{timestamp}`
    pub fn scratch_dir(&self, timestamp: &BackupTimestamp) -> PathBuf {
        self.scratch_env_dir().join(timestamp.to_string())
    }

    pub(crate) async fn create_scratch(
        &self,
        timestamp: &BackupTimestamp,
    ) -> std::result::Result<PathBuf, ArchiveError> {
        let dir = self.scratch_dir(timestamp);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|source| ArchiveError::Scratch {
                path: dir.clone(),
                source,
            })?;
        debug!(scratch = %dir.display(), "Scratch directory created");
        Ok(dir)
    }

    /// Best effort; a leftover scratch directory is logged, not fatal.
    pub(crate) async fn remove_scratch(&self, dir: &Path) {
        match tokio::fs::remove_dir_all(dir).await {
            Ok(()) => debug!(scratch = %dir.display(), "Scratch directory removed"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(scratch = %dir.display(), error = %e, "Failed to remove scratch directory"),
        }
    }
}

/// Run `mode`. Backups and restores hold the run lock for their whole
/// duration; show only reads and takes no lock.
pub async fn run(ctx: &SyncContext, mode: Mode) -> Result<RunReport> {
    info!(
        service = %ctx.config.service.name,
        env = %ctx.env,
        primary = %ctx.regions.primary.describe(),
        secondary = %ctx.regions.secondary.describe(),
        "Run starting"
    );

    match mode {
        Mode::Backup => {
            let _lock = ctx.lock()?;
            backup::run_backup(ctx).await
        }
        Mode::Restore(request) => {
            let _lock = ctx.lock()?;
            restore::run_restore(ctx, &request).await
        }
        Mode::Show { selector } => show::run_show(ctx, &selector).await,
    }
}
