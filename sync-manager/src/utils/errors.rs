//! Error taxonomy for backup, restore and show runs.
//!
//! Each stage of a run has its own error type so callers can decide how far a
//! failure propagates: configuration and resolve errors stop a run before any
//! side effect, archive errors stop a backup before upload, storage errors
//! are scoped to one object, and restore errors are collected per artifact.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use crate::storage::Region;
use crate::timestamp::BackupTimestamp;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load configuration from {path}: {source}")]
    Load {
        path: PathBuf,
        #[source]
        source: config::ConfigError,
    },

    #[error("Missing mandatory setting: {0}")]
    Missing(&'static str),

    #[error("Invalid setting {key}: {reason}")]
    Invalid { key: String, reason: String },
}

#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("Path {path} is unreadable: {reason}")]
    PathUnreadable { path: PathBuf, reason: String },

    #[error("Dump of database {db} failed: {reason}")]
    DatabaseDumpFailed { db: String, reason: String },

    #[error("Database discovery failed: {0}")]
    DiscoveryFailed(String),

    #[error("Scratch directory {path} unusable: {source}")]
    Scratch {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Which storage operation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageErrorKind {
    UploadFailed,
    DownloadFailed,
    NotFound,
    DeleteFailed,
    ListFailed,
}

impl fmt::Display for StorageErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            StorageErrorKind::UploadFailed => "upload failed",
            StorageErrorKind::DownloadFailed => "download failed",
            StorageErrorKind::NotFound => "object not found",
            StorageErrorKind::DeleteFailed => "delete failed",
            StorageErrorKind::ListFailed => "listing failed",
        };
        f.write_str(label)
    }
}

#[derive(Error, Debug, Clone)]
#[error("{kind} for '{key}' in {region} region: {detail}")]
pub struct StorageError {
    pub kind: StorageErrorKind,
    pub region: Region,
    pub key: String,
    pub detail: String,
}

impl StorageError {
    pub fn new(
        kind: StorageErrorKind,
        region: Region,
        key: impl Into<String>,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            region,
            key: key.into(),
            detail: detail.into(),
        }
    }
}

#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("No backups found in {region} region")]
    NoBackupsFound { region: Region },

    #[error("Backup {timestamp} does not exist on storage, check the available points with --show")]
    BackupNotFound { timestamp: String },

    #[error("Backup {timestamp} is missing from the {missing_in} region (use --force to restore from a single region)")]
    RegionMismatch {
        timestamp: BackupTimestamp,
        missing_in: Region,
    },

    #[error("Backup {timestamp} is incomplete, missing: {}", missing.join(", "))]
    Incomplete {
        timestamp: BackupTimestamp,
        missing: Vec<String>,
    },

    #[error("Manifest of backup {timestamp} is unreadable: {reason}")]
    ManifestUnreadable {
        timestamp: BackupTimestamp,
        reason: String,
    },

    #[error("Neither region could be listed (primary: {primary}; secondary: {secondary})")]
    Unavailable {
        primary: StorageError,
        secondary: StorageError,
    },
}

#[derive(Error, Debug, Clone)]
pub enum RestoreError {
    #[error("Restore of path {path} failed: {reason}")]
    PathRestoreFailed { path: PathBuf, reason: String },

    #[error("Restore of database {db} failed: {reason}")]
    DatabaseRestoreFailed { db: String, reason: String },
}

/// Fatal errors that end a run before a report can be produced.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Archive(#[from] ArchiveError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error("Another run holds the lock {path}")]
    LockBusy { path: PathBuf },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SyncError>;
