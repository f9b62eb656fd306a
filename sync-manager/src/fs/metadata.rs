//! Ownership capture and re-application for restored directories.
//!
//! Restored files are written by the user running the restore (usually root),
//! so the owner and group of the target directory are recorded before it is
//! cleared and applied back to the whole tree afterwards.

use std::os::unix::fs::MetadataExt;
use std::path::Path;

use nix::unistd::{chown, Gid, Uid};
use walkdir::WalkDir;

/// Owner and group of a filesystem entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ownership {
    pub uid: u32,
    pub gid: u32,
}

impl Ownership {
    /// Read the owner of `path` (symlinks are followed)
    pub fn of(path: &Path) -> std::io::Result<Self> {
        let metadata = std::fs::metadata(path)?;
        Ok(Self {
            uid: metadata.uid(),
            gid: metadata.gid(),
        })
    }

    /// Apply to `root` and everything below it. Returns the number of entries
    /// changed.
    pub fn apply_recursive(&self, root: &Path) -> std::io::Result<usize> {
        let uid = Uid::from_raw(self.uid);
        let gid = Gid::from_raw(self.gid);
        let mut changed = 0;

        for entry in WalkDir::new(root).follow_links(false) {
            let entry = entry?;

            // chown(2) would follow the link and touch its target
            if entry.file_type().is_symlink() {
                std::os::unix::fs::lchown(entry.path(), Some(self.uid), Some(self.gid))?;
            } else {
                chown(entry.path(), Some(uid), Some(gid)).map_err(std::io::Error::from)?;
            }
            changed += 1;
        }

        Ok(changed)
    }
}
