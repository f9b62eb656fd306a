//! Configuration management for sync-manager.
//!
//! Loads a TOML file through the `config` crate, layers
//! `SYNC_MANAGER__SECTION__KEY` environment variables on top, then applies the
//! named credential variables (`S3_BACKUP_ACCESS_KEY`, `DATABASE_PASSWORD`,
//! ...) that container deployments inject. The result is validated once and
//! shared read-only for the whole run.

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::storage::{Region, StorageLocation};
use crate::utils::ConfigError;

pub const DEFAULT_CONFIG_FILE: &str = "sync-manager.toml";

/// Target environment of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Dev,
    Prod,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Dev => "dev",
            Environment::Prod => "prod",
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub service: ServiceConfig,

    #[serde(default)]
    pub backup: BackupConfig,

    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub s3: S3Config,

    pub regions: RegionsConfig,

    #[serde(default)]
    pub timeouts: TimeoutConfig,

    #[serde(default)]
    pub performance: PerformanceConfig,

    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Service name, used in bucket and archive names
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackupConfig {
    /// Directories archived on every backup
    #[serde(default)]
    pub paths: Vec<PathBuf>,

    /// Databases dumped on every backup (empty = discover with credentials)
    #[serde(default)]
    pub databases: Vec<String>,

    /// Days a backup is kept before pruning
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,

    /// Local scratch directory (default: `temp/` next to the config file)
    #[serde(default)]
    pub scratch_dir: Option<PathBuf>,

    /// File names skipped while archiving (substring match)
    #[serde(default)]
    pub exclude: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_host")]
    pub host: String,

    #[serde(default)]
    pub username: String,

    #[serde(default)]
    pub password: String,

    #[serde(default = "default_dump_command")]
    pub dump_command: String,

    #[serde(default = "default_client_command")]
    pub client_command: String,

    #[serde(default = "default_admin_command")]
    pub admin_command: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct S3Config {
    #[serde(default)]
    pub access_key: String,

    #[serde(default)]
    pub secret_key: String,

    #[serde(default)]
    pub access_key_dev: String,

    #[serde(default)]
    pub secret_key_dev: String,

    /// Path-style addressing, required by most non-AWS providers
    #[serde(default = "default_true")]
    pub force_path_style: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegionsConfig {
    pub primary: RegionEndpoint,
    pub secondary: RegionEndpoint,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegionEndpoint {
    /// Provider region name (e.g. `gra`)
    pub name: String,

    /// S3 endpoint URL
    pub endpoint: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    #[serde(default = "default_storage_secs")]
    pub storage_secs: u64,

    #[serde(default = "default_subprocess_secs")]
    pub subprocess_secs: u64,

    #[serde(default = "default_hook_secs")]
    pub hook_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceConfig {
    /// Upper bound on concurrent archive/upload tasks
    #[serde(default = "default_max_parallel_jobs")]
    pub max_parallel_jobs: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values
fn default_retention_days() -> u32 {
    30
}

fn default_db_host() -> String {
    "localhost".to_string()
}

fn default_dump_command() -> String {
    "mariadb-dump".to_string()
}

fn default_client_command() -> String {
    "mariadb".to_string()
}

fn default_admin_command() -> String {
    "mariadb-admin".to_string()
}

fn default_true() -> bool {
    true
}

fn default_storage_secs() -> u64 {
    600
}

fn default_subprocess_secs() -> u64 {
    3600
}

fn default_hook_secs() -> u64 {
    600
}

fn default_max_parallel_jobs() -> usize {
    4
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            host: default_db_host(),
            username: String::new(),
            password: String::new(),
            dump_command: default_dump_command(),
            client_command: default_client_command(),
            admin_command: default_admin_command(),
        }
    }
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            access_key: String::new(),
            secret_key: String::new(),
            access_key_dev: String::new(),
            secret_key_dev: String::new(),
            force_path_style: true,
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            storage_secs: default_storage_secs(),
            subprocess_secs: default_subprocess_secs(),
            hook_secs: default_hook_secs(),
        }
    }
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            max_parallel_jobs: default_max_parallel_jobs(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Location of the config file when `--config` is not given: next to the
/// executable, as the tool is shipped inside the container image.
pub fn default_config_path() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(DEFAULT_CONFIG_FILE)))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE))
}

impl Config {
    /// Load configuration from a TOML file with process environment overrides
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        Self::from_file_with_env(path, |key| std::env::var(key).ok())
    }

    /// Load configuration, resolving named overrides through `lookup`
    pub fn from_file_with_env<F>(path: &Path, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let source = config::File::from(path).format(config::FileFormat::Toml);
        let mut config = Self::build(source, path)?;
        config.apply_env_overrides(lookup);
        if config.backup.scratch_dir.is_none() {
            let base = path.parent().unwrap_or_else(|| Path::new("."));
            config.backup.scratch_dir = Some(base.join("temp"));
        }
        Ok(config)
    }

    /// Parse configuration from TOML text; overrides are not applied
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let source = config::File::from_str(content, config::FileFormat::Toml);
        Self::build(source, Path::new("<inline>"))
    }

    fn build<S>(source: S, path: &Path) -> Result<Self, ConfigError>
    where
        S: config::Source + Send + Sync + 'static,
    {
        let load_error = |source| ConfigError::Load {
            path: path.to_path_buf(),
            source,
        };

        config::Config::builder()
            .add_source(source)
            .add_source(
                config::Environment::with_prefix("SYNC_MANAGER")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("backup.paths")
                    .with_list_parse_key("backup.databases")
                    .with_list_parse_key("backup.exclude"),
            )
            .build()
            .map_err(load_error)?
            .try_deserialize()
            .map_err(load_error)
    }

    /// Apply the credential variables understood by container deployments.
    /// Empty values are ignored so an unset secret never blanks the file value.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(list) = get("PATH_LIST") {
            self.backup.paths = split_list(&list).into_iter().map(PathBuf::from).collect();
        }
        if let Some(list) = get("DATABASE_NAME") {
            self.backup.databases = split_list(&list);
        }
        if let Some(v) = get("DATABASE_USERNAME") {
            self.database.username = v;
        }
        if let Some(v) = get("DATABASE_PASSWORD") {
            self.database.password = v;
        }
        if let Some(v) = get("DATABASE_HOST") {
            self.database.host = v;
        }
        if let Some(v) = get("S3_BACKUP_ACCESS_KEY") {
            self.s3.access_key = v;
        }
        if let Some(v) = get("S3_BACKUP_SECRET_KEY") {
            self.s3.secret_key = v;
        }
        if let Some(v) = get("S3_BACKUP_ACCESS_KEY_DEV") {
            self.s3.access_key_dev = v;
        }
        if let Some(v) = get("S3_BACKUP_SECRET_KEY_DEV") {
            self.s3.secret_key_dev = v;
        }
    }

    /// Check every setting a run in `env` depends on.
    pub fn validate(&self, env: Environment) -> Result<(), ConfigError> {
        let name = self.service.name.trim();
        if name.is_empty() {
            return Err(ConfigError::Missing("service name"));
        }
        if !name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        {
            return Err(ConfigError::Invalid {
                key: "service.name".to_string(),
                reason: "must contain only lowercase letters, digits and '-' to form a bucket name"
                    .to_string(),
            });
        }

        let (access_key, secret_key) = self.credentials(env);
        if access_key.is_empty() {
            return Err(ConfigError::Missing("S3 access key"));
        }
        if secret_key.is_empty() {
            return Err(ConfigError::Missing("S3 secret key"));
        }

        for (key, region) in [
            ("regions.primary", &self.regions.primary),
            ("regions.secondary", &self.regions.secondary),
        ] {
            if region.name.trim().is_empty() || region.endpoint.trim().is_empty() {
                return Err(ConfigError::Invalid {
                    key: key.to_string(),
                    reason: "region name and endpoint are required".to_string(),
                });
            }
        }

        let mut basenames = HashSet::new();
        for path in &self.backup.paths {
            let basename = path_basename(path).ok_or_else(|| ConfigError::Invalid {
                key: "backup.paths".to_string(),
                reason: format!("{} has no directory name", path.display()),
            })?;
            if !basenames.insert(basename.clone()) {
                return Err(ConfigError::Invalid {
                    key: "backup.paths".to_string(),
                    reason: format!("two paths share the directory name '{}'", basename),
                });
            }
        }

        let mut databases = HashSet::new();
        for db in &self.backup.databases {
            if db.trim().is_empty() || !databases.insert(db.as_str()) {
                return Err(ConfigError::Invalid {
                    key: "backup.databases".to_string(),
                    reason: format!("empty or duplicate database name '{}'", db),
                });
            }
        }

        if self.performance.max_parallel_jobs == 0 {
            return Err(ConfigError::Invalid {
                key: "performance.max_parallel_jobs".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if self.timeouts.storage_secs == 0
            || self.timeouts.subprocess_secs == 0
            || self.timeouts.hook_secs == 0
        {
            return Err(ConfigError::Invalid {
                key: "timeouts".to_string(),
                reason: "timeouts must be greater than zero".to_string(),
            });
        }

        Ok(())
    }

    /// S3 credentials of the given environment
    pub fn credentials(&self, env: Environment) -> (&str, &str) {
        match env {
            Environment::Dev => (&self.s3.access_key_dev, &self.s3.secret_key_dev),
            Environment::Prod => (&self.s3.access_key, &self.s3.secret_key),
        }
    }

    /// Bucket and credentials bound to one `(region, environment)` pair.
    pub fn storage_location(&self, region: Region, env: Environment) -> StorageLocation {
        let endpoint = match region {
            Region::Primary => &self.regions.primary,
            Region::Secondary => &self.regions.secondary,
        };
        let suffix = match env {
            Environment::Dev => "-dev",
            Environment::Prod => "",
        };
        let (access_key, secret_key) = self.credentials(env);

        StorageLocation {
            region,
            bucket_name: format!("{}-backup-{}{}", self.service.name, region.as_str(), suffix),
            region_name: endpoint.name.clone(),
            endpoint: endpoint.endpoint.clone(),
            access_key: access_key.to_string(),
            secret_key: secret_key.to_string(),
            force_path_style: self.s3.force_path_style,
        }
    }

    pub fn scratch_root(&self) -> PathBuf {
        self.backup
            .scratch_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from("temp"))
    }

    /// A database password is what enables dumps and discovery.
    pub fn databases_enabled(&self) -> bool {
        !self.database.password.is_empty()
    }

    pub fn storage_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.storage_secs)
    }

    pub fn subprocess_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.subprocess_secs)
    }

    pub fn hook_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.hook_secs)
    }
}

/// Last component of a source path, used in archive names.
pub fn path_basename(path: &Path) -> Option<String> {
    path.components()
        .next_back()
        .and_then(|c| match c {
            std::path::Component::Normal(name) => Some(name.to_string_lossy().to_string()),
            _ => None,
        })
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|item| item.trim().to_string())
        .filter(|item| !item.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const SAMPLE: &str = r#"
[service]
name = "wordpress"

[backup]
paths = ["/var/www/html/wp-content", "/srv/uploads/"]
databases = ["wordpress"]

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
endpoint = "https://s3.gra.io.cloud.ovh.net"

[regions.secondary]
name = "sbg"
endpoint = "https://s3.sbg.io.cloud.ovh.net"
"#;

    fn sample() -> Config {
        Config::from_toml_str(SAMPLE).unwrap()
    }

    #[test]
    fn test_defaults_applied() {
        let config = sample();
        assert_eq!(config.backup.retention_days, 30);
        assert_eq!(config.database.host, "localhost");
        assert_eq!(config.database.dump_command, "mariadb-dump");
        assert_eq!(config.performance.max_parallel_jobs, 4);
        assert!(config.s3.force_path_style);
        assert!(config.validate(Environment::Prod).is_ok());
    }

    #[test]
    fn test_bucket_naming() {
        let config = sample();
        let prod = config.storage_location(Region::Primary, Environment::Prod);
        assert_eq!(prod.bucket_name, "wordpress-backup-primary");
        assert_eq!(prod.access_key, "AK");

        let dev = config.storage_location(Region::Secondary, Environment::Dev);
        assert_eq!(dev.bucket_name, "wordpress-backup-secondary-dev");
        assert_eq!(dev.region_name, "sbg");
        assert_eq!(dev.secret_key, "SKD");
    }

    #[test]
    fn test_env_overrides_ignore_empty_values() {
        let mut config = sample();
        let vars: HashMap<&str, &str> = HashMap::from([
            ("S3_BACKUP_ACCESS_KEY", "FROM-ENV"),
            ("S3_BACKUP_SECRET_KEY", ""),
            ("PATH_LIST", "/data/a, /data/b"),
            ("DATABASE_NAME", "one,two"),
        ]);
        config.apply_env_overrides(|key| vars.get(key).map(|v| v.to_string()));

        assert_eq!(config.s3.access_key, "FROM-ENV");
        assert_eq!(config.s3.secret_key, "SK");
        assert_eq!(
            config.backup.paths,
            vec![PathBuf::from("/data/a"), PathBuf::from("/data/b")]
        );
        assert_eq!(config.backup.databases, vec!["one", "two"]);
    }

    #[test]
    fn test_missing_credentials_rejected() {
        let mut config = sample();
        config.s3.secret_key_dev.clear();
        assert!(config.validate(Environment::Prod).is_ok());
        assert!(matches!(
            config.validate(Environment::Dev),
            Err(ConfigError::Missing("S3 secret key"))
        ));
    }

    #[test]
    fn test_duplicate_basenames_rejected() {
        let mut config = sample();
        config.backup.paths = vec![PathBuf::from("/a/data"), PathBuf::from("/b/data")];
        assert!(matches!(
            config.validate(Environment::Prod),
            Err(ConfigError::Invalid { .. })
        ));
    }

    #[test]
    fn test_root_path_rejected() {
        let mut config = sample();
        config.backup.paths = vec![PathBuf::from("/")];
        assert!(config.validate(Environment::Prod).is_err());
    }

    #[test]
    fn test_path_basename() {
        assert_eq!(path_basename(Path::new("/srv/uploads/")).as_deref(), Some("uploads"));
        assert_eq!(path_basename(Path::new("/")), None);
    }

    #[test]
    fn test_scratch_defaults_next_to_config_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join(DEFAULT_CONFIG_FILE);
        std::fs::write(&path, SAMPLE).unwrap();

        let config = Config::from_file_with_env(&path, |_| None).unwrap();
        assert_eq!(config.scratch_root(), dir.path().join("temp"));
    }
}
