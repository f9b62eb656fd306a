//! Run summary printed at the end of every invocation.

use std::fmt;
use std::time::Duration;

use crate::config::Environment;
use crate::resolver::ShowEntry;
use crate::timestamp::BackupTimestamp;
use crate::utils::RestoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Backup,
    Restore,
    Show,
}

impl RunMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunMode::Backup => "backup",
            RunMode::Restore => "restore",
            RunMode::Show => "show",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Success,
    Partial,
    Failed,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Success => "success",
            Verdict::Partial => "partial failure",
            Verdict::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    PathArchive,
    DatabaseArchive,
    Manifest,
    Prune,
    PathRestore,
    DatabaseRestore,
    /// Reported but never changes the verdict
    Hook,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactStatus {
    Succeeded,
    Failed(String),
    Skipped(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactOutcome {
    pub kind: ArtifactKind,
    pub name: String,
    pub size_bytes: Option<u64>,
    pub status: ArtifactStatus,
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub mode: RunMode,
    pub env: Environment,
    pub timestamp: Option<BackupTimestamp>,
    pub artifacts: Vec<ArtifactOutcome>,
    pub restore_errors: Vec<RestoreError>,
    pub warnings: Vec<String>,
    /// Run-level failure (build error, rolled-back upload)
    pub fatal: Option<String>,
    pub degraded: bool,
    pub backups: Vec<ShowEntry>,
    pub selected: Option<BackupTimestamp>,
    pub duration: Duration,
}

impl RunReport {
    pub fn new(mode: RunMode, env: Environment) -> Self {
        Self {
            mode,
            env,
            timestamp: None,
            artifacts: Vec::new(),
            restore_errors: Vec::new(),
            warnings: Vec::new(),
            fatal: None,
            degraded: false,
            backups: Vec::new(),
            selected: None,
            duration: Duration::ZERO,
        }
    }

    pub fn succeeded(&mut self, kind: ArtifactKind, name: impl Into<String>, size_bytes: Option<u64>) {
        self.artifacts.push(ArtifactOutcome {
            kind,
            name: name.into(),
            size_bytes,
            status: ArtifactStatus::Succeeded,
        });
    }

    pub fn failed(&mut self, kind: ArtifactKind, name: impl Into<String>, reason: impl ToString) {
        self.artifacts.push(ArtifactOutcome {
            kind,
            name: name.into(),
            size_bytes: None,
            status: ArtifactStatus::Failed(reason.to_string()),
        });
    }

    pub fn skipped(&mut self, kind: ArtifactKind, name: impl Into<String>, reason: impl ToString) {
        self.artifacts.push(ArtifactOutcome {
            kind,
            name: name.into(),
            size_bytes: None,
            status: ArtifactStatus::Skipped(reason.to_string()),
        });
    }

    /// Record a per-artifact restore failure.
    pub fn restore_failed(&mut self, error: RestoreError) {
        let (kind, name) = match &error {
            RestoreError::PathRestoreFailed { path, .. } => {
                (ArtifactKind::PathRestore, path.display().to_string())
            }
            RestoreError::DatabaseRestoreFailed { db, .. } => {
                (ArtifactKind::DatabaseRestore, db.clone())
            }
        };
        self.failed(kind, name, &error);
        self.restore_errors.push(error);
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }

    pub fn verdict(&self) -> Verdict {
        if self.fatal.is_some() {
            return Verdict::Failed;
        }

        let counted = self.artifacts.iter().filter(|a| a.kind != ArtifactKind::Hook);
        let (mut ok, mut not_ok) = (0, 0);
        for artifact in counted {
            match artifact.status {
                ArtifactStatus::Succeeded => ok += 1,
                _ => not_ok += 1,
            }
        }

        match (ok, not_ok) {
            (_, 0) => Verdict::Success,
            (0, _) => Verdict::Failed,
            _ => Verdict::Partial,
        }
    }

    fn render_header(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.mode.as_str(), self.env)?;
        if let Some(ts) = &self.timestamp {
            write!(f, " {}", ts)?;
        }
        write!(
            f,
            ": {} in {}",
            self.verdict().as_str(),
            format_duration(self.duration.as_secs())
        )?;
        if self.degraded {
            write!(f, " [degraded]")?;
        }
        writeln!(f)
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.render_header(f)?;

        if let Some(reason) = &self.fatal {
            writeln!(f, "  error: {}", reason)?;
        }

        for artifact in &self.artifacts {
            match &artifact.status {
                ArtifactStatus::Succeeded => match artifact.size_bytes {
                    Some(size) => writeln!(f, "  [ok]      {} ({})", artifact.name, format_bytes(size))?,
                    None => writeln!(f, "  [ok]      {}", artifact.name)?,
                },
                ArtifactStatus::Failed(reason) => {
                    writeln!(f, "  [failed]  {}: {}", artifact.name, reason)?
                }
                ArtifactStatus::Skipped(reason) => {
                    writeln!(f, "  [skipped] {}: {}", artifact.name, reason)?
                }
            }
        }

        if self.mode == RunMode::Show {
            if self.backups.is_empty() {
                writeln!(f, "  no backups found")?;
            }
            for entry in &self.backups {
                let marker = if self.selected == Some(entry.timestamp) { "*" } else { " " };
                writeln!(f, "  {} {}  {}", marker, entry.timestamp, entry.status)?;
            }
        }

        for warning in &self.warnings {
            writeln!(f, "  warning: {}", warning)?;
        }

        Ok(())
    }
}

/// Format bytes as human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_index])
}

/// Format duration as human-readable string
pub fn format_duration(seconds: u64) -> String {
    if seconds < 60 {
        format!("{}s", seconds)
    } else if seconds < 3600 {
        format!("{}m {}s", seconds / 60, seconds % 60)
    } else {
        format!("{}h {}m", seconds / 3600, (seconds % 3600) / 60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::BackupStatus;
    use std::path::PathBuf;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512.00 B");
        assert_eq!(format_bytes(1024), "1.00 KB");
        assert_eq!(format_bytes(1_572_864), "1.50 MB");
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(45), "45s");
        assert_eq!(format_duration(125), "2m 5s");
        assert_eq!(format_duration(3725), "1h 2m");
    }

    #[test]
    fn test_verdicts() {
        let mut report = RunReport::new(RunMode::Restore, Environment::Prod);
        assert_eq!(report.verdict(), Verdict::Success);

        report.succeeded(ArtifactKind::PathRestore, "/srv/www", None);
        report.failed(ArtifactKind::Hook, "post-restore.sh", "exit status: 1");
        assert_eq!(report.verdict(), Verdict::Success);

        report.restore_failed(RestoreError::DatabaseRestoreFailed {
            db: "shop".to_string(),
            reason: "access denied".to_string(),
        });
        assert_eq!(report.verdict(), Verdict::Partial);
        assert_eq!(report.restore_errors.len(), 1);

        report.fatal = Some("rolled back".to_string());
        assert_eq!(report.verdict(), Verdict::Failed);
    }

    #[test]
    fn test_all_failed_is_failed() {
        let mut report = RunReport::new(RunMode::Restore, Environment::Dev);
        report.restore_failed(RestoreError::PathRestoreFailed {
            path: PathBuf::from("/srv/www"),
            reason: "download failed".to_string(),
        });
        report.skipped(ArtifactKind::DatabaseRestore, "shop", "aborted");
        assert_eq!(report.verdict(), Verdict::Failed);
    }

    #[test]
    fn test_show_rendering_marks_selection() {
        let ts = BackupTimestamp::parse("20240301-120000").unwrap();
        let mut report = RunReport::new(RunMode::Show, Environment::Prod);
        report.backups.push(ShowEntry {
            timestamp: ts,
            status: BackupStatus::Complete,
        });
        report.selected = Some(ts);
        report.warn("unrecognised prefix 'latest' in primary region");

        let rendered = report.to_string();
        assert!(rendered.starts_with("show (prod): success"));
        assert!(rendered.contains("* 20240301-120000  complete"));
        assert!(rendered.contains("warning: unrecognised prefix"));
    }
}
