//! Backup manifest.
//!
//! Serialized as `{timestamp}/manifest.json` in both regions once every
//! archive of the run is stored; a timestamp without it is not a backup.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::config::Environment;
use crate::storage::object_key;
use crate::timestamp::BackupTimestamp;

pub const MANIFEST_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupManifest {
    pub version: u32,
    pub service: String,
    pub environment: Environment,
    pub timestamp: BackupTimestamp,
    pub host: String,
    pub path_archives: Vec<PathArchive>,
    pub db_archives: Vec<DbArchive>,
}

/// Archive of one source directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PathArchive {
    pub source_path: PathBuf,
    pub archive_file_name: String,
    pub size_bytes: u64,
    pub file_count: usize,
}

/// Compressed dump of one database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbArchive {
    pub db_name: String,
    pub archive_file_name: String,
    pub size_bytes: u64,
}

impl BackupManifest {
    pub fn new(service: &str, environment: Environment, timestamp: BackupTimestamp) -> Self {
        Self {
            version: MANIFEST_VERSION,
            service: service.to_string(),
            environment,
            timestamp,
            host: hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_else(|_| "unknown".to_string()),
            path_archives: Vec::new(),
            db_archives: Vec::new(),
        }
    }

    /// Archive file names, paths first, in manifest order
    pub fn archive_files(&self) -> Vec<&str> {
        self.path_archives
            .iter()
            .map(|a| a.archive_file_name.as_str())
            .chain(self.db_archives.iter().map(|a| a.archive_file_name.as_str()))
            .collect()
    }

    /// Object keys of every archive
    pub fn object_keys(&self) -> Vec<String> {
        self.archive_files()
            .into_iter()
            .map(|file| object_key(&self.timestamp, file))
            .collect()
    }

    pub fn total_bytes(&self) -> u64 {
        self.path_archives.iter().map(|a| a.size_bytes).sum::<u64>()
            + self.db_archives.iter().map(|a| a.size_bytes).sum::<u64>()
    }

    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec_pretty(self)
    }

    pub fn from_json(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }
}

/// `{service}-{basename}-{timestamp}.tar.zst`
pub fn path_archive_name(service: &str, basename: &str, timestamp: &BackupTimestamp) -> String {
    format!("{}-{}-{}.tar.zst", service, basename, timestamp)
}

/// `{service}-{db}-{timestamp}.sql.zst`
pub fn db_archive_name(service: &str, db: &str, timestamp: &BackupTimestamp) -> String {
    format!("{}-{}-{}.sql.zst", service, db, timestamp)
}
