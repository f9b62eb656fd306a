//! Database dump and restore through the MariaDB client tools.
//!
//! Dumps are streamed from the dump tool's stdout through a zstd encoder
//! straight into the scratch file; restores stream the other way into the
//! client's stdin. The password travels in `MYSQL_PWD`, never in argv.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_compression::tokio::bufread::ZstdDecoder;
use async_compression::tokio::write::ZstdEncoder;
use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tracing::{debug, info};

use crate::config::DatabaseConfig;

/// Schemas that belong to the server and are never backed up.
pub const SYSTEM_SCHEMAS: [&str; 4] = ["mysql", "information_schema", "performance_schema", "sys"];

#[derive(Error, Debug)]
pub enum ToolError {
    #[error("failed to start {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{command} exited with {status}: {stderr}")]
    Exit {
        command: String,
        status: String,
        stderr: String,
    },

    #[error("{command} timed out after {secs}s")]
    Timeout { command: String, secs: u64 },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Dump and restore of whole databases.
#[async_trait]
pub trait DatabaseTool: Send + Sync {
    /// Every database visible to the configured user, system schemas included
    async fn list_databases(&self) -> Result<Vec<String>, ToolError>;

    /// Write a zstd-compressed dump of `db` to `dest`. Returns the number of
    /// uncompressed bytes the dump produced.
    async fn dump(&self, db: &str, dest: &Path) -> Result<u64, ToolError>;

    /// Drop, recreate and load `db` from the zstd-compressed dump at `source`
    async fn restore(&self, db: &str, source: &Path) -> Result<(), ToolError>;
}

/// Keep user databases only.
pub fn without_system_schemas(databases: Vec<String>) -> Vec<String> {
    databases
        .into_iter()
        .map(|db| db.trim().to_string())
        .filter(|db| !db.is_empty() && !SYSTEM_SCHEMAS.contains(&db.as_str()))
        .collect()
}

pub struct MariaDbTool {
    settings: DatabaseConfig,
    timeout: Duration,
}

impl MariaDbTool {
    pub fn new(settings: DatabaseConfig, timeout: Duration) -> Self {
        Self { settings, timeout }
    }

    fn command(&self, program: &str) -> Command {
        let mut cmd = Command::new(program);
        cmd.arg("-h").arg(&self.settings.host);
        if !self.settings.username.is_empty() {
            cmd.arg("-u").arg(&self.settings.username);
        }
        cmd.env("MYSQL_PWD", &self.settings.password)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    fn spawn(&self, program: &str, mut cmd: Command) -> Result<Child, ToolError> {
        cmd.spawn().map_err(|source| ToolError::Spawn {
            command: program.to_string(),
            source,
        })
    }

    /// Run to completion, returning stdout.
    async fn run(&self, program: &str, cmd: Command) -> Result<String, ToolError> {
        let child = self.spawn(program, cmd)?;
        let output = self
            .within_timeout(program, child.wait_with_output())
            .await??;

        if !output.status.success() {
            return Err(ToolError::Exit {
                command: program.to_string(),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    async fn within_timeout<F, T>(&self, program: &str, fut: F) -> Result<T, ToolError>
    where
        F: std::future::Future<Output = T>,
    {
        tokio::time::timeout(self.timeout, fut)
            .await
            .map_err(|_| ToolError::Timeout {
                command: program.to_string(),
                secs: self.timeout.as_secs(),
            })
    }

    /// Wait for `child` and turn a non-zero exit into [`ToolError::Exit`].
    async fn finish(&self, program: &str, mut child: Child, stderr: String) -> Result<(), ToolError> {
        let status = child.wait().await?;
        if !status.success() {
            return Err(ToolError::Exit {
                command: program.to_string(),
                status: status.to_string(),
                stderr: stderr.trim().to_string(),
            });
        }
        Ok(())
    }
}

/// Read a child's stderr to the end. Run alongside the stdio copy so a chatty
/// tool never blocks on a full pipe.
async fn drain(pipe: Option<ChildStderr>) -> std::io::Result<String> {
    let mut text = String::new();
    if let Some(mut pipe) = pipe {
        pipe.read_to_string(&mut text).await?;
    }
    Ok(text)
}

#[async_trait]
impl DatabaseTool for MariaDbTool {
    async fn list_databases(&self) -> Result<Vec<String>, ToolError> {
        let program = &self.settings.client_command;
        let mut cmd = self.command(program);
        cmd.args(["-sN", "-e", "show databases"]);

        let stdout = self.run(program, cmd).await?;
        Ok(stdout.lines().map(str::to_string).collect())
    }

    async fn dump(&self, db: &str, dest: &Path) -> Result<u64, ToolError> {
        let program = &self.settings.dump_command;
        let mut cmd = self.command(program);
        cmd.args([
            "--complete-insert",
            "--routines",
            "--triggers",
            "--single-transaction",
        ])
        .arg(db);

        debug!(db, file = %dest.display(), "Starting database dump");
        let mut child = self.spawn(program, cmd)?;
        let mut stdout = child.stdout.take().ok_or_else(|| {
            ToolError::Io(std::io::Error::other("dump stdout not captured"))
        })?;

        let stderr = child.stderr.take();

        let stream = async {
            let file = tokio::fs::File::create(dest).await?;
            let mut encoder = ZstdEncoder::new(file);
            let (copied, stderr) =
                tokio::join!(tokio::io::copy(&mut stdout, &mut encoder), drain(stderr));
            let raw_bytes = copied?;
            encoder.shutdown().await?;
            self.finish(program, child, stderr?).await?;
            Ok::<u64, ToolError>(raw_bytes)
        };

        let raw_bytes = self.within_timeout(program, stream).await??;
        info!(db, raw_bytes, "Database dumped");
        Ok(raw_bytes)
    }

    async fn restore(&self, db: &str, source: &Path) -> Result<(), ToolError> {
        let admin = &self.settings.admin_command;

        let mut drop_cmd = self.command(admin);
        drop_cmd.args(["-s", "-f", "drop", db]);
        // A missing database cannot be dropped; create below is what matters
        if let Err(e) = self.run(admin, drop_cmd).await {
            debug!(db, error = %e, "Drop before restore failed");
        }

        let mut create_cmd = self.command(admin);
        create_cmd.args(["-s", "-f", "create", db]);
        self.run(admin, create_cmd).await?;

        let program = &self.settings.client_command;
        let mut cmd = self.command(program);
        cmd.arg("-D").arg(db).stdin(Stdio::piped()).stdout(Stdio::null());

        let mut child = self.spawn(program, cmd)?;
        let mut stdin = child.stdin.take().ok_or_else(|| {
            ToolError::Io(std::io::Error::other("client stdin not captured"))
        })?;

        let stderr = child.stderr.take();

        let stream = async {
            let file = tokio::fs::File::open(source).await?;
            let mut decoder = ZstdDecoder::new(BufReader::new(file));
            let feed = async {
                tokio::io::copy(&mut decoder, &mut stdin).await?;
                stdin.shutdown().await?;
                drop(stdin);
                Ok::<(), std::io::Error>(())
            };
            let (fed, stderr) = tokio::join!(feed, drain(stderr));
            let stderr = stderr?;
            if let Err(e) = fed {
                // An early exit of the client is the real cause of a broken pipe
                self.finish(program, child, stderr).await?;
                return Err(ToolError::Io(e));
            }
            self.finish(program, child, stderr).await
        };

        self.within_timeout(program, stream).await??;
        info!(db, "Database restored");
        Ok(())
    }
}
