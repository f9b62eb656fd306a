//! `.tar.zst` archives built in-process with the `tar` and `zstd` crates.

use std::fs::File;
use std::io;
use std::path::Path;

use tracing::debug;

use super::{ArchiveStats, Archiver};
use crate::fs::walker::{total_size, walk_source, EntryKind, WalkOptions};

pub const DEFAULT_LEVEL: i32 = 3;

#[derive(Debug, Clone)]
pub struct TarZstdArchiver {
    level: i32,
}

impl TarZstdArchiver {
    pub fn new(level: i32) -> Self {
        Self { level }
    }
}

impl Default for TarZstdArchiver {
    fn default() -> Self {
        Self::new(DEFAULT_LEVEL)
    }
}

impl Archiver for TarZstdArchiver {
    fn compress(&self, source: &Path, dest: &Path, exclude: &[String]) -> io::Result<ArchiveStats> {
        let metadata = std::fs::metadata(source)?;
        if !metadata.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} is not a directory", source.display()),
            ));
        }

        let entries = walk_source(source, &WalkOptions::excluding(exclude))?;

        let encoder = zstd::Encoder::new(File::create(dest)?, self.level)?;
        let mut builder = tar::Builder::new(encoder);
        builder.follow_symlinks(false);

        let mut file_count = 0;
        for entry in &entries {
            builder.append_path_with_name(&entry.path, &entry.relative_path)?;
            if entry.kind == EntryKind::File {
                file_count += 1;
            }
        }

        let file = builder.into_inner()?.finish()?;
        file.sync_all()?;
        let size_bytes = std::fs::metadata(dest)?.len();

        debug!(
            source = %source.display(),
            archive = %dest.display(),
            entries = entries.len(),
            source_bytes = total_size(&entries),
            size_bytes,
            "Archive written"
        );

        Ok(ArchiveStats {
            size_bytes,
            file_count,
        })
    }

    fn extract(&self, archive: &Path, dest: &Path) -> io::Result<()> {
        std::fs::create_dir_all(dest)?;

        let decoder = zstd::Decoder::new(File::open(archive)?)?;
        let mut tar = tar::Archive::new(decoder);
        tar.set_preserve_permissions(true);
        tar.set_preserve_mtime(true);
        tar.set_overwrite(true);
        tar.unpack(dest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_compress_then_extract_preserves_tree() -> io::Result<()> {
        let temp_dir = TempDir::new()?;
        let source = temp_dir.path().join("html");
        fs::create_dir_all(source.join("wp-content/uploads"))?;
        fs::create_dir_all(source.join("empty"))?;
        fs::write(source.join("index.php"), b"<?php echo 1;")?;
        fs::write(source.join("wp-content/uploads/img.bin"), vec![7u8; 4096])?;
        std::os::unix::fs::symlink("index.php", source.join("home.php"))?;

        let archive = temp_dir.path().join("html.tar.zst");
        let archiver = TarZstdArchiver::default();
        let stats = archiver.compress(&source, &archive, &[])?;
        assert_eq!(stats.file_count, 2);
        assert!(stats.size_bytes > 0);

        let out = temp_dir.path().join("out");
        archiver.extract(&archive, &out)?;

        assert_eq!(fs::read(out.join("index.php"))?, b"<?php echo 1;");
        assert_eq!(fs::read(out.join("wp-content/uploads/img.bin"))?, vec![7u8; 4096]);
        assert!(out.join("empty").is_dir());
        assert_eq!(fs::read_link(out.join("home.php"))?, Path::new("index.php"));
        Ok(())
    }

    #[test]
    fn test_exclude_patterns_skip_entries() -> io::Result<()> {
        let temp_dir = TempDir::new()?;
        let source = temp_dir.path().join("src");
        fs::create_dir_all(source.join("cache"))?;
        fs::write(source.join("cache/tmp"), b"x")?;
        fs::write(source.join("keep"), b"y")?;

        let archive = temp_dir.path().join("a.tar.zst");
        let archiver = TarZstdArchiver::default();
        archiver.compress(&source, &archive, &["cache".to_string()])?;

        let out = temp_dir.path().join("out");
        archiver.extract(&archive, &out)?;
        assert!(out.join("keep").exists());
        assert!(!out.join("cache").exists());
        Ok(())
    }

    #[test]
    fn test_missing_source_fails() {
        let temp_dir = TempDir::new().unwrap();
        let err = TarZstdArchiver::default()
            .compress(&temp_dir.path().join("nope"), &temp_dir.path().join("a"), &[])
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn test_extract_rejects_garbage() -> io::Result<()> {
        let temp_dir = TempDir::new()?;
        let bogus = temp_dir.path().join("bogus.tar.zst");
        fs::write(&bogus, b"not an archive")?;
        assert!(TarZstdArchiver::default()
            .extract(&bogus, &temp_dir.path().join("out"))
            .is_err());
        Ok(())
    }
}
