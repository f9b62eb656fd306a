//! sync-manager library
//!
//! Backup and restore of container paths and MariaDB databases to two
//! object-storage regions, with retention and restore point selection.

pub mod archive;
pub mod config;
pub mod database;
pub mod executor;
pub mod fs;
pub mod resolver;
pub mod retention;
pub mod shutdown;
pub mod storage;
pub mod timestamp;
pub mod utils;

// Re-export commonly used types
pub use config::{Config, Environment};
pub use executor::{Mode, RunReport, SyncContext, Verdict};
pub use timestamp::BackupTimestamp;
pub use utils::errors::SyncError;
pub type Result<T> = std::result::Result<T, SyncError>;
