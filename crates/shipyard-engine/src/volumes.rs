//! Directories kept across builds of the same branch and job.

use std::path::{Path, PathBuf};

use shipyard_docker::VolumeBinding;
use shipyard_util::fs::ensure_dir;
use shipyard_util::hash::sha256_bytes;

use crate::container::CONTAINER_SHARED;
use crate::error::EngineError;

/// A persisted directory: where the build uses it, where it lives on the host,
/// and where the host copy is mounted in the container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistedVolume {
    /// Hex SHA-256 of the folder as written in the job settings.
    pub hash: String,
    /// The directory the build reads and writes, as configured.
    pub folder: String,
    pub host_path: PathBuf,
    pub container_path: String,
}

impl PersistedVolume {
    /// Describe the volume for `folder` under `shared_root`
    /// (`<project>/shared/<branch>/<job>`). Nothing is created yet.
    pub fn new(folder: &str, shared_root: &Path) -> Self {
        let hash = sha256_bytes(folder.as_bytes());
        Self {
            host_path: shared_root.join(&hash),
            container_path: format!("{CONTAINER_SHARED}/{hash}"),
            folder: folder.to_owned(),
            hash,
        }
    }

    /// Create the host directory on first use.
    ///
    /// # Errors
    /// Returns an error if the directory cannot be created.
    pub fn ensure(&self) -> Result<(), EngineError> {
        if !self.host_path.is_dir() {
            log::debug!("creating persisted volume for {} at {}", self.folder, self.host_path.display());
        }
        Ok(ensure_dir(&self.host_path)?)
    }

    pub fn binding(&self) -> VolumeBinding {
        VolumeBinding::new(&self.host_path, &self.container_path)
    }

    /// Shell command copying the persisted content into place before the build.
    pub fn restore_command(&self) -> String {
        format!("sync \"{}/\" \"{}\"", self.container_path, self.folder)
    }

    /// Shell command copying the folder back to the host after the build.
    pub fn save_command(&self) -> String {
        format!("sync \"{}/\" \"{}\"", self.folder, self.container_path)
    }
}

/// The volumes of a job, created on disk.
///
/// # Errors
/// Returns an error if a host directory cannot be created.
pub fn persisted_volumes(folders: &[String], shared_root: &Path) -> Result<Vec<PersistedVolume>, EngineError> {
    folders
        .iter()
        .map(|folder| {
            let volume = PersistedVolume::new(folder, shared_root);
            volume.ensure()?;
            Ok(volume)
        })
        .collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn paths_derive_from_folder_hash() {
        let volume = PersistedVolume::new("/root/.cache/pip", Path::new("/srv/shared/master/api"));
        assert_eq!(volume.hash.len(), 64);
        assert_eq!(volume.host_path, Path::new("/srv/shared/master/api").join(&volume.hash));
        assert_eq!(volume.container_path, format!("/.shipyard/shared/{}", volume.hash));
        assert_eq!(
            volume.binding().to_string(),
            format!("/srv/shared/master/api/{0}:/.shipyard/shared/{0}", volume.hash)
        );
    }

    #[test]
    fn sync_commands_go_both_ways() {
        let volume = PersistedVolume::new("/root/.m2", Path::new("/s"));
        assert_eq!(
            volume.restore_command(),
            format!("sync \"/.shipyard/shared/{}/\" \"/root/.m2\"", volume.hash)
        );
        assert_eq!(
            volume.save_command(),
            format!("sync \"/root/.m2/\" \"/.shipyard/shared/{}\"", volume.hash)
        );
    }

    #[test]
    fn volumes_are_created_lazily_and_kept() {
        let dir = tempfile::tempdir().unwrap();
        let folders = vec!["/root/.cache".to_owned()];
        let volumes = persisted_volumes(&folders, dir.path()).unwrap();
        let host = &volumes.first().unwrap().host_path;
        assert!(host.is_dir());
        std::fs::write(host.join("cached"), "x").unwrap();

        persisted_volumes(&folders, dir.path()).unwrap();
        assert!(host.join("cached").is_file());
    }
}
