//! Two-region object storage.
//!
//! Every backup lives under `{timestamp}/` in two buckets, one per region. The
//! [`ObjectStore`] trait is the narrow client seam (S3 in production, memory in
//! tests); [`StorageGateway`] binds a store to one region, enforces the call
//! timeout and turns client failures into [`StorageError`]s that carry the
//! region and key.

pub mod memory;
pub mod s3;

use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::{Config, Environment};
use crate::timestamp::BackupTimestamp;
use crate::utils::{StorageError, StorageErrorKind};

pub use memory::InMemoryObjectStore;
pub use s3::S3ObjectStore;

/// Object name of the manifest that seals a backup.
pub const MANIFEST_FILE_NAME: &str = "manifest.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Region {
    Primary,
    Secondary,
}

impl Region {
    pub const ALL: [Region; 2] = [Region::Primary, Region::Secondary];

    pub fn as_str(&self) -> &'static str {
        match self {
            Region::Primary => "primary",
            Region::Secondary => "secondary",
        }
    }

    pub fn other(&self) -> Region {
        match self {
            Region::Primary => Region::Secondary,
            Region::Secondary => Region::Primary,
        }
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Bucket, endpoint and credentials for one `(region, environment)` pair.
#[derive(Clone)]
pub struct StorageLocation {
    pub region: Region,
    pub bucket_name: String,
    pub region_name: String,
    pub endpoint: String,
    pub access_key: String,
    pub secret_key: String,
    pub force_path_style: bool,
}

impl fmt::Debug for StorageLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageLocation")
            .field("region", &self.region)
            .field("bucket_name", &self.bucket_name)
            .field("region_name", &self.region_name)
            .field("endpoint", &self.endpoint)
            .field("access_key", &"<redacted>")
            .field("secret_key", &"<redacted>")
            .finish()
    }
}

/// Failure reported by an object store client.
#[derive(Error, Debug)]
pub enum StoreFailure {
    #[error("object not found")]
    NotFound,

    #[error("{0}")]
    Backend(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Minimal object-storage client bound to one bucket.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Human-readable target, for logs
    fn describe(&self) -> String;

    async fn put(&self, key: &str, local: &Path) -> Result<(), StoreFailure>;

    async fn get(&self, key: &str, local: &Path) -> Result<(), StoreFailure>;

    /// Every key starting with `prefix`, in any order
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreFailure>;

    /// Deleting a missing key succeeds
    async fn delete(&self, key: &str) -> Result<(), StoreFailure>;
}

pub fn object_key(timestamp: &BackupTimestamp, file_name: &str) -> String {
    format!("{}/{}", timestamp, file_name)
}

pub fn timestamp_prefix(timestamp: &BackupTimestamp) -> String {
    format!("{}/", timestamp)
}

/// Outcome of deleting every object under a prefix.
#[derive(Debug, Default)]
pub struct PrefixDeletion {
    pub deleted: Vec<String>,
    pub failures: Vec<StorageError>,
}

/// Object store bound to a region, with timeouts and error context.
#[derive(Clone)]
pub struct StorageGateway {
    region: Region,
    store: Arc<dyn ObjectStore>,
    timeout: Duration,
}

impl StorageGateway {
    pub fn new(region: Region, store: Arc<dyn ObjectStore>, timeout: Duration) -> Self {
        Self {
            region,
            store,
            timeout,
        }
    }

    pub fn region(&self) -> Region {
        self.region
    }

    pub fn describe(&self) -> String {
        self.store.describe()
    }

    pub async fn put(&self, key: &str, local: &Path) -> Result<(), StorageError> {
        debug!(region = %self.region, key, file = %local.display(), "storage.put");
        self.call(StorageErrorKind::UploadFailed, key, self.store.put(key, local))
            .await
    }

    pub async fn get(&self, key: &str, local: &Path) -> Result<(), StorageError> {
        debug!(region = %self.region, key, file = %local.display(), "storage.get");
        self.call(StorageErrorKind::DownloadFailed, key, self.store.get(key, local))
            .await
    }

    /// Keys under `prefix`, sorted. Each call re-lists.
    pub async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let mut keys = self
            .call(StorageErrorKind::ListFailed, prefix, self.store.list(prefix))
            .await?;
        keys.sort();
        Ok(keys)
    }

    pub async fn delete(&self, key: &str) -> Result<(), StorageError> {
        debug!(region = %self.region, key, "storage.delete");
        self.call(StorageErrorKind::DeleteFailed, key, self.store.delete(key))
            .await
    }

    /// Delete every object under `prefix`. Per-key failures are collected so a
    /// stuck object does not keep the others alive.
    pub async fn delete_prefix(&self, prefix: &str) -> PrefixDeletion {
        let mut outcome = PrefixDeletion::default();

        let keys = match self.list(prefix).await {
            Ok(keys) => keys,
            Err(e) => {
                outcome.failures.push(e);
                return outcome;
            }
        };

        for key in keys {
            match self.delete(&key).await {
                Ok(()) => outcome.deleted.push(key),
                Err(e) => {
                    warn!(region = %self.region, key = %key, error = %e, "Failed to delete object");
                    outcome.failures.push(e);
                }
            }
        }

        outcome
    }

    /// Classify the whole bucket into sealed, partial and malformed entries.
    pub async fn listing(&self) -> Result<RegionListing, StorageError> {
        let keys = self.list("").await?;
        Ok(RegionListing::from_keys(keys))
    }

    async fn call<T, F>(&self, kind: StorageErrorKind, key: &str, fut: F) -> Result<T, StorageError>
    where
        F: Future<Output = Result<T, StoreFailure>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(StoreFailure::NotFound)) if kind == StorageErrorKind::DownloadFailed => Err(
                StorageError::new(StorageErrorKind::NotFound, self.region, key, "no such key"),
            ),
            Ok(Err(e)) => Err(StorageError::new(kind, self.region, key, e.to_string())),
            Err(_) => Err(StorageError::new(
                kind,
                self.region,
                key,
                format!("timed out after {:?}", self.timeout),
            )),
        }
    }
}

/// What one region holds, derived from a full key listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegionListing {
    /// Every key in the bucket
    pub keys: BTreeSet<String>,

    /// Timestamps whose manifest is present
    pub sealed: BTreeSet<BackupTimestamp>,

    /// Timestamps with objects but no manifest (failed or interrupted runs)
    pub partial: BTreeSet<BackupTimestamp>,

    /// Top-level prefixes that are not backup timestamps
    pub malformed: BTreeSet<String>,
}

impl RegionListing {
    pub fn from_keys<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut listing = RegionListing::default();
        let mut seen = BTreeSet::new();

        for key in keys {
            let key = key.into();
            let (prefix, rest) = key.split_once('/').unwrap_or((key.as_str(), ""));
            match BackupTimestamp::parse(prefix) {
                Some(ts) => {
                    if rest == MANIFEST_FILE_NAME {
                        listing.sealed.insert(ts);
                    }
                    seen.insert(ts);
                }
                None => {
                    listing.malformed.insert(prefix.to_string());
                }
            }
            listing.keys.insert(key);
        }

        listing.partial = seen.difference(&listing.sealed).copied().collect();
        listing
    }

    /// Every timestamp with at least one object
    pub fn timestamps(&self) -> BTreeSet<BackupTimestamp> {
        self.sealed.union(&self.partial).copied().collect()
    }

    /// Raw top-level prefixes, valid or not, as retention sees them
    pub fn prefixes(&self) -> Vec<String> {
        self.timestamps()
            .iter()
            .map(|ts| ts.to_string())
            .chain(self.malformed.iter().cloned())
            .collect()
    }

    pub fn has_key(&self, key: &str) -> bool {
        self.keys.contains(key)
    }
}

/// Listing attempt for both regions; either side may have failed.
#[derive(Debug)]
pub struct RegionListings {
    pub primary: Result<RegionListing, StorageError>,
    pub secondary: Result<RegionListing, StorageError>,
}

impl RegionListings {
    pub fn get(&self, region: Region) -> &Result<RegionListing, StorageError> {
        match region {
            Region::Primary => &self.primary,
            Region::Secondary => &self.secondary,
        }
    }
}

/// The primary and secondary gateways of one environment.
#[derive(Clone)]
pub struct RegionPair {
    pub primary: StorageGateway,
    pub secondary: StorageGateway,
}

impl RegionPair {
    pub fn new(primary: StorageGateway, secondary: StorageGateway) -> Self {
        Self { primary, secondary }
    }

    /// S3 gateways for both regions of `env`.
    pub async fn connect(config: &Config, env: Environment) -> Self {
        let timeout = config.storage_timeout();
        let primary = S3ObjectStore::connect(&config.storage_location(Region::Primary, env)).await;
        let secondary =
            S3ObjectStore::connect(&config.storage_location(Region::Secondary, env)).await;

        Self {
            primary: StorageGateway::new(Region::Primary, Arc::new(primary), timeout),
            secondary: StorageGateway::new(Region::Secondary, Arc::new(secondary), timeout),
        }
    }

    pub fn get(&self, region: Region) -> &StorageGateway {
        match region {
            Region::Primary => &self.primary,
            Region::Secondary => &self.secondary,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &StorageGateway> {
        [&self.primary, &self.secondary].into_iter()
    }

    /// List both regions concurrently.
    pub async fn listings(&self) -> RegionListings {
        let (primary, secondary) = tokio::join!(self.primary.listing(), self.secondary.listing());
        RegionListings { primary, secondary }
    }
}
