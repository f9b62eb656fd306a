//! Utility modules shared by every run mode.

pub mod errors;
pub mod logger;

pub use errors::{
    ArchiveError, ConfigError, ResolveError, RestoreError, Result, StorageError,
    StorageErrorKind, SyncError,
};
