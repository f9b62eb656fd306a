//! Source tree traversal for archiving.
//!
//! Produces every entry below a source root (directories included, so empty
//! directories survive a round trip) in a stable order, with excluded names
//! pruned together with their subtrees.

use std::path::{Path, PathBuf};
use walkdir::{DirEntry, WalkDir};

/// Options for directory walking
#[derive(Debug, Clone, Default)]
pub struct WalkOptions {
    /// Follow symbolic links
    pub follow_links: bool,

    /// File names containing any of these are skipped
    pub exclude_patterns: Vec<String>,
}

impl WalkOptions {
    pub fn excluding(patterns: &[String]) -> Self {
        Self {
            follow_links: false,
            exclude_patterns: patterns.to_vec(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Dir,
    Symlink,
}

/// An entry discovered under a source root
#[derive(Debug, Clone)]
pub struct SourceEntry {
    /// Full path to the entry
    pub path: PathBuf,

    /// Path relative to the root, used as the archive member name
    pub relative_path: PathBuf,

    pub kind: EntryKind,

    /// Size in bytes (0 for directories and links)
    pub size: u64,
}

impl SourceEntry {
    fn from_entry(entry: &DirEntry, root: &Path) -> walkdir::Result<Self> {
        let path = entry.path().to_path_buf();
        let relative_path = path.strip_prefix(root).unwrap_or(&path).to_path_buf();
        let file_type = entry.file_type();

        let (kind, size) = if file_type.is_symlink() {
            (EntryKind::Symlink, 0)
        } else if file_type.is_dir() {
            (EntryKind::Dir, 0)
        } else {
            (EntryKind::File, entry.metadata()?.len())
        };

        Ok(Self {
            path,
            relative_path,
            kind,
            size,
        })
    }
}

/// Walk `root` and collect every entry below it, sorted by name.
///
/// The root itself is not returned. Any unreadable entry fails the walk: an
/// archive that silently misses files is worse than no archive.
pub fn walk_source(root: &Path, options: &WalkOptions) -> walkdir::Result<Vec<SourceEntry>> {
    let mut entries = Vec::new();

    let walker = WalkDir::new(root)
        .follow_links(options.follow_links)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| !should_exclude(entry, &options.exclude_patterns));

    for entry in walker {
        let entry = entry?;
        entries.push(SourceEntry::from_entry(&entry, root)?);
    }

    Ok(entries)
}

/// Total size of the regular files in `entries`
pub fn total_size(entries: &[SourceEntry]) -> u64 {
    entries
        .iter()
        .filter(|e| e.kind == EntryKind::File)
        .map(|e| e.size)
        .sum()
}

/// Check if a directory entry should be excluded based on patterns
fn should_exclude(entry: &DirEntry, patterns: &[String]) -> bool {
    let file_name = entry.file_name().to_string_lossy();
    patterns.iter().any(|pattern| file_name.contains(pattern.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_walk_empty_directory() -> walkdir::Result<()> {
        let temp_dir = TempDir::new().unwrap();
        let entries = walk_source(temp_dir.path(), &WalkOptions::default())?;
        assert!(entries.is_empty());
        Ok(())
    }

    #[test]
    fn test_walk_includes_directories() -> walkdir::Result<()> {
        let temp_dir = TempDir::new().unwrap();

        fs::create_dir(temp_dir.path().join("empty")).unwrap();
        fs::create_dir(temp_dir.path().join("subdir")).unwrap();
        fs::write(temp_dir.path().join("file1.txt"), b"content1").unwrap();
        fs::write(temp_dir.path().join("subdir/file2.txt"), b"content2").unwrap();

        let entries = walk_source(temp_dir.path(), &WalkOptions::default())?;
        let names: Vec<_> = entries
            .iter()
            .map(|e| e.relative_path.to_string_lossy().to_string())
            .collect();

        assert_eq!(names, vec!["empty", "file1.txt", "subdir", "subdir/file2.txt"]);
        assert_eq!(entries[0].kind, EntryKind::Dir);
        assert_eq!(total_size(&entries), 16);

        Ok(())
    }

    #[test]
    fn test_exclude_prunes_subtree() -> walkdir::Result<()> {
        let temp_dir = TempDir::new().unwrap();

        fs::create_dir(temp_dir.path().join("cache")).unwrap();
        fs::write(temp_dir.path().join("cache/blob"), b"skip").unwrap();
        fs::write(temp_dir.path().join("file.txt"), b"keep").unwrap();

        let options = WalkOptions::excluding(&["cache".to_string()]);
        let entries = walk_source(temp_dir.path(), &options)?;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].relative_path, PathBuf::from("file.txt"));

        Ok(())
    }

    #[test]
    #[cfg(unix)]
    fn test_symlinks_are_not_followed() -> walkdir::Result<()> {
        let temp_dir = TempDir::new().unwrap();
        let outside = TempDir::new().unwrap();
        fs::write(outside.path().join("secret"), b"outside").unwrap();
        std::os::unix::fs::symlink(outside.path(), temp_dir.path().join("link")).unwrap();

        let entries = walk_source(temp_dir.path(), &WalkOptions::default())?;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].kind, EntryKind::Symlink);

        Ok(())
    }

    #[test]
    fn test_missing_root_is_an_error() {
        let temp_dir = TempDir::new().unwrap();
        assert!(walk_source(&temp_dir.path().join("nope"), &WalkOptions::default()).is_err());
    }
}
