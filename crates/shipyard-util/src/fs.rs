//! Filesystem utilities for Shipyard.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use crate::error::UtilError;

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> UtilError + '_ {
    move |source| UtilError::Io {
        path: path.display().to_string(),
        source,
    }
}

/// Create a directory and all parent directories if they do not exist.
///
/// # Errors
/// Returns an error if the directory cannot be created.
pub fn ensure_dir(path: &Path) -> Result<(), UtilError> {
    std::fs::create_dir_all(path).map_err(io_err(path))
}

/// Remove a directory and all its contents. No error if the directory is absent.
///
/// # Errors
/// Returns an error if the directory exists but cannot be removed.
pub fn remove_dir_all_if_exists(path: &Path) -> Result<(), UtilError> {
    match std::fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(UtilError::Io {
            path: path.display().to_string(),
            source,
        }),
    }
}

/// Remove a file if it exists. No error if it is already gone.
///
/// # Errors
/// Returns an error if the file exists but cannot be removed.
pub fn remove_file_if_exists(path: &Path) -> Result<(), UtilError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(UtilError::Io {
            path: path.display().to_string(),
            source,
        }),
    }
}

/// Set mode `0777` on `path` so that it can be rewritten or removed by
/// any later step, whatever mode the container gave it.
///
/// Symlinks are left alone.
///
/// # Errors
/// Returns an error if the metadata cannot be read or the mode cannot be set.
pub fn make_permissive(path: &Path) -> Result<(), UtilError> {
    let meta = std::fs::symlink_metadata(path).map_err(io_err(path))?;
    if meta.file_type().is_symlink() {
        return Ok(());
    }
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o777)).map_err(io_err(path))
}

/// Force-remove `path`, whether it is a file, symlink or directory tree.
///
/// The entry is made permissive first. Absent paths are not an error.
///
/// # Errors
/// Returns an error if the entry exists but cannot be removed.
pub fn force_remove(path: &Path) -> Result<(), UtilError> {
    let meta = match std::fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(source) => {
            return Err(UtilError::Io {
                path: path.display().to_string(),
                source,
            })
        }
    };
    if meta.is_dir() {
        make_permissive(path)?;
        remove_dir_all_if_exists(path)
    } else {
        remove_file_if_exists(path)
    }
}

/// Recursively copy the tree rooted at `src` into `dest`.
///
/// Symlinks are recreated as symlinks (never followed), directories are
/// merged into existing ones and regular files overwrite existing files.
///
/// # Errors
/// Returns an error if any entry cannot be read or written.
pub fn copy_tree(src: &Path, dest: &Path) -> Result<(), UtilError> {
    ensure_dir(dest)?;
    let entries = std::fs::read_dir(src).map_err(io_err(src))?;

    for entry in entries {
        let entry = entry.map_err(io_err(src))?;
        let from = entry.path();
        let to = dest.join(entry.file_name());
        let file_type = entry.file_type().map_err(io_err(&from))?;

        if file_type.is_symlink() {
            let link = std::fs::read_link(&from).map_err(io_err(&from))?;
            remove_file_if_exists(&to)?;
            std::os::unix::fs::symlink(&link, &to).map_err(io_err(&to))?;
        } else if file_type.is_dir() {
            copy_tree(&from, &to)?;
        } else if file_type.is_file() {
            std::fs::copy(&from, &to).map_err(io_err(&to))?;
        } else {
            // Device nodes, fifos and sockets have no place in a package.
            log::debug!("skipping special file {}", from.display());
        }
    }

    Ok(())
}

/// Return the Shipyard home directory (`~/.shipyard`).
///
/// # Errors
/// Returns an error if `HOME` is not set.
pub fn shipyard_home() -> Result<PathBuf, UtilError> {
    home_dir().map(|home| home.join(".shipyard"))
}

/// Expand a leading `~/` in `path` to the user's home directory.
///
/// # Errors
/// Returns an error if the path needs expansion and `HOME` is not set.
pub fn expand_home(path: &Path) -> Result<PathBuf, UtilError> {
    match path.strip_prefix("~") {
        Ok(rest) => Ok(home_dir()?.join(rest)),
        Err(_) => Ok(path.to_path_buf()),
    }
}

fn home_dir() -> Result<PathBuf, UtilError> {
    std::env::var_os("HOME")
        .filter(|h| !h.is_empty())
        .map(PathBuf::from)
        .ok_or(UtilError::NoHomeDir)
}
