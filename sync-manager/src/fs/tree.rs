//! Directory replacement used by path restores.

use std::io;
use std::path::{Component, Path};

use tracing::debug;
use walkdir::WalkDir;

use super::metadata::Ownership;

/// Remove everything inside `dir`, keeping `dir` itself.
///
/// Refuses the filesystem root. A missing directory is created empty.
pub fn clear_directory(dir: &Path) -> io::Result<()> {
    if dir.components().all(|c| matches!(c, Component::RootDir | Component::CurDir)) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("refusing to clear {}", dir.display()),
        ));
    }

    if !dir.exists() {
        return std::fs::create_dir_all(dir);
    }

    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            std::fs::remove_dir_all(entry.path())?;
        } else {
            std::fs::remove_file(entry.path())?;
        }
    }

    Ok(())
}

/// Move every entry of `from` into `to`. Entries are renamed when both sides
/// share a filesystem and copied otherwise. Returns the number of top-level
/// entries moved.
pub fn move_contents(from: &Path, to: &Path) -> io::Result<usize> {
    std::fs::create_dir_all(to)?;
    let mut moved = 0;

    for entry in std::fs::read_dir(from)? {
        let entry = entry?;
        let target = to.join(entry.file_name());

        if let Err(e) = std::fs::rename(entry.path(), &target) {
            debug!(
                source = %entry.path().display(),
                error = %e,
                "Rename failed, copying instead"
            );
            copy_tree(&entry.path(), &target)?;
            if entry.file_type()?.is_dir() {
                std::fs::remove_dir_all(entry.path())?;
            } else {
                std::fs::remove_file(entry.path())?;
            }
        }
        moved += 1;
    }

    Ok(moved)
}

/// Replace the contents of `target` with those of `staging`.
///
/// The owner and group `target` had before are applied to the new tree; a
/// target that did not exist keeps whatever the restoring user creates.
pub fn replace_contents(staging: &Path, target: &Path) -> io::Result<usize> {
    let ownership = match Ownership::of(target) {
        Ok(ownership) => Some(ownership),
        Err(e) if e.kind() == io::ErrorKind::NotFound => None,
        Err(e) => return Err(e),
    };

    clear_directory(target)?;
    let moved = move_contents(staging, target)?;

    if let Some(ownership) = ownership {
        ownership.apply_recursive(target)?;
    }

    Ok(moved)
}

/// Copy `source` (file, link or directory) to `target`, preserving permissions
/// and link targets.
fn copy_tree(source: &Path, target: &Path) -> io::Result<()> {
    for entry in WalkDir::new(source).follow_links(false) {
        let entry = entry?;
        let relative = entry.path().strip_prefix(source).unwrap_or(Path::new(""));
        let destination = if relative.as_os_str().is_empty() {
            target.to_path_buf()
        } else {
            target.join(relative)
        };

        let file_type = entry.file_type();
        if file_type.is_symlink() {
            let link = std::fs::read_link(entry.path())?;
            std::os::unix::fs::symlink(link, &destination)?;
        } else if file_type.is_dir() {
            std::fs::create_dir_all(&destination)?;
            std::fs::set_permissions(&destination, entry.metadata()?.permissions())?;
        } else {
            std::fs::copy(entry.path(), &destination)?;
        }
    }

    Ok(())
}
