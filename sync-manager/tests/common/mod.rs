#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use sync_manager::archive::TarZstdArchiver;
use sync_manager::config::{Config, Environment};
use sync_manager::database::{DatabaseTool, ToolError};
use sync_manager::executor::SyncContext;
use sync_manager::storage::{InMemoryObjectStore, Region, RegionPair, StorageGateway};
use tempfile::TempDir;

const BASE_CONFIG: &str = r#"
[service]
name = "wordpress"

[database]
username = "root"
password = "secret"

[s3]
access_key = "AK"
secret_key = "SK"
access_key_dev = "AKD"
secret_key_dev = "SKD"

[regions.primary]
name = "gra"
endpoint = "http://primary.invalid"

[regions.secondary]
name = "sbg"
endpoint = "http://secondary.invalid"
"#;

/// Database tool keeping dumps and restores in memory.
#[derive(Default)]
pub struct FakeDatabase {
    pub contents: Mutex<HashMap<String, Vec<u8>>>,
    pub restored: Mutex<HashMap<String, Vec<u8>>>,
    pub failing_restores: Mutex<Vec<String>>,
}

impl FakeDatabase {
    pub fn with(databases: &[(&str, &[u8])]) -> Self {
        let fake = Self::default();
        {
            let mut contents = fake.contents.lock().unwrap();
            for (db, bytes) in databases {
                contents.insert(db.to_string(), bytes.to_vec());
            }
        }
        fake
    }

    pub fn fail_restore_of(&self, db: &str) {
        self.failing_restores.lock().unwrap().push(db.to_string());
    }
}

#[async_trait]
impl DatabaseTool for FakeDatabase {
    async fn list_databases(&self) -> Result<Vec<String>, ToolError> {
        Ok(self.contents.lock().unwrap().keys().cloned().collect())
    }

    async fn dump(&self, db: &str, dest: &Path) -> Result<u64, ToolError> {
        let bytes = self
            .contents
            .lock()
            .unwrap()
            .get(db)
            .cloned()
            .ok_or_else(|| ToolError::Exit {
                command: "mariadb-dump".to_string(),
                status: "exit status: 2".to_string(),
                stderr: format!("Unknown database '{}'", db),
            })?;
        tokio::fs::write(dest, zstd::encode_all(bytes.as_slice(), 3)?).await?;
        Ok(bytes.len() as u64)
    }

    async fn restore(&self, db: &str, source: &Path) -> Result<(), ToolError> {
        if self.failing_restores.lock().unwrap().iter().any(|d| d == db) {
            return Err(ToolError::Exit {
                command: "mariadb".to_string(),
                status: "exit status: 1".to_string(),
                stderr: "ERROR 1045 (28000): Access denied".to_string(),
            });
        }
        let compressed = tokio::fs::read(source).await?;
        let bytes = zstd::decode_all(compressed.as_slice())?;
        self.restored.lock().unwrap().insert(db.to_string(), bytes);
        Ok(())
    }
}

pub struct Harness {
    pub temp: TempDir,
    pub primary: Arc<InMemoryObjectStore>,
    pub secondary: Arc<InMemoryObjectStore>,
    pub database: Arc<FakeDatabase>,
    pub ctx: SyncContext,
}

impl Harness {
    /// One source directory per name under a fresh temp dir, plus the given
    /// databases.
    pub fn new(sources: &[&str], databases: &[(&str, &[u8])]) -> Self {
        Self::with_config(sources, databases, |_| {})
    }

    pub fn with_config<F>(sources: &[&str], databases: &[(&str, &[u8])], tweak: F) -> Self
    where
        F: FnOnce(&mut Config),
    {
        let temp = TempDir::new().unwrap();

        let mut config = Config::from_toml_str(BASE_CONFIG).unwrap();
        config.backup.paths = sources
            .iter()
            .map(|name| {
                let path = temp.path().join("sources").join(name);
                std::fs::create_dir_all(&path).unwrap();
                path
            })
            .collect();
        config.backup.databases = databases.iter().map(|(db, _)| db.to_string()).collect();
        config.backup.scratch_dir = Some(temp.path().join("scratch"));
        tweak(&mut config);
        config.validate(Environment::Prod).unwrap();

        let primary = Arc::new(InMemoryObjectStore::new());
        let secondary = Arc::new(InMemoryObjectStore::new());
        let database = Arc::new(FakeDatabase::with(databases));

        let regions = RegionPair::new(
            StorageGateway::new(Region::Primary, primary.clone(), Duration::from_secs(10)),
            StorageGateway::new(Region::Secondary, secondary.clone(), Duration::from_secs(10)),
        );

        let ctx = SyncContext::new(
            Arc::new(config),
            Environment::Prod,
            regions,
            Arc::new(TarZstdArchiver::default()),
            database.clone(),
        );

        Self {
            temp,
            primary,
            secondary,
            database,
            ctx,
        }
    }

    pub fn source(&self, name: &str) -> PathBuf {
        self.temp.path().join("sources").join(name)
    }

    /// Store a sealed backup with one archive in the given regions.
    pub async fn seed_backup(&self, timestamp: &str, regions: &[Region]) {
        for region in regions {
            let store = self.store(*region);
            store
                .insert(
                    &format!("{}/wordpress-old-{}.tar.zst", timestamp, timestamp),
                    b"old".to_vec(),
                )
                .await;
            store
                .insert(&format!("{}/manifest.json", timestamp), b"{}".to_vec())
                .await;
        }
    }

    pub fn store(&self, region: Region) -> &Arc<InMemoryObjectStore> {
        match region {
            Region::Primary => &self.primary,
            Region::Secondary => &self.secondary,
        }
    }
}

pub fn write_file(path: PathBuf, bytes: &[u8]) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, bytes).unwrap();
}

/// Relative path -> contents (`None` for directories) of everything under
/// `root`.
pub fn snapshot(root: &Path) -> BTreeMap<PathBuf, Option<Vec<u8>>> {
    walkdir::WalkDir::new(root)
        .min_depth(1)
        .into_iter()
        .map(|entry| {
            let entry = entry.unwrap();
            let relative = entry.path().strip_prefix(root).unwrap().to_path_buf();
            let contents = if entry.file_type().is_dir() {
                None
            } else {
                Some(std::fs::read(entry.path()).unwrap())
            };
            (relative, contents)
        })
        .collect()
}
