//! The operations the engine needs from a container runtime.

use std::collections::BTreeMap;
use std::fmt;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::DockerError;

/// A host directory bound into a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeBinding {
    pub host: PathBuf,
    pub container: PathBuf,
}

impl VolumeBinding {
    pub fn new(host: impl Into<PathBuf>, container: impl Into<PathBuf>) -> Self {
        Self {
            host: host.into(),
            container: container.into(),
        }
    }

    /// Bind a host directory at the same path inside the container.
    pub fn same_path(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            host: path.clone(),
            container: path,
        }
    }
}

impl fmt::Display for VolumeBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host.display(), self.container.display())
    }
}

impl FromStr for VolumeBinding {
    type Err = DockerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split(':');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(host), Some(container), None) if !host.is_empty() && !container.is_empty() => {
                Ok(Self::new(host, container))
            }
            _ => Err(DockerError::InvalidBinding {
                binding: s.to_owned(),
            }),
        }
    }
}

/// Everything needed to create a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    /// Image id or `repository:tag`.
    pub image: String,
    pub command: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub volumes: Vec<VolumeBinding>,
    pub user: String,
    pub privileged: bool,
}

impl ContainerSpec {
    /// A privileged container running `command` as root.
    pub fn new(image: impl Into<String>, command: Vec<String>) -> Self {
        Self {
            image: image.into(),
            command,
            env: BTreeMap::new(),
            volumes: Vec::new(),
            user: "root".to_owned(),
            privileged: true,
        }
    }

    pub fn env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn volumes(mut self, volumes: Vec<VolumeBinding>) -> Self {
        self.volumes = volumes;
        self
    }

    pub fn user(mut self, user: &str) -> Self {
        self.user = user.to_owned();
        self
    }
}

/// How a path changed relative to the container's image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Added,
    Modified,
    Deleted,
}

/// One entry of a container's filesystem change list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    pub path: String,
    pub kind: ChangeKind,
}

impl Change {
    pub fn new(path: &str, kind: ChangeKind) -> Self {
        Self {
            path: path.to_owned(),
            kind,
        }
    }
}

/// A locally available image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageSummary {
    pub id: String,
    pub repository: String,
    pub tag: String,
}

/// A container runtime driven by the engine.
///
/// Implementations must be shareable across the diff-extraction workers.
pub trait ContainerRuntime: Send + Sync {
    /// Create (but do not start) a container; returns its id.
    ///
    /// # Errors
    /// Returns an error if the runtime rejects the spec.
    fn create(&self, spec: &ContainerSpec) -> Result<String, DockerError>;

    /// # Errors
    /// Returns an error if the container cannot be started.
    fn start(&self, id: &str) -> Result<(), DockerError>;

    /// Hand every output line of the container to `sink` until it exits.
    ///
    /// # Errors
    /// Returns an error if the log stream cannot be opened.
    fn follow_logs(&self, id: &str, sink: &mut dyn FnMut(&str)) -> Result<(), DockerError>;

    /// # Errors
    /// Returns an error if the runtime refuses the stop.
    fn stop(&self, id: &str) -> Result<(), DockerError>;

    /// # Errors
    /// Returns an error if the container is not running or cannot be killed.
    fn kill(&self, id: &str) -> Result<(), DockerError>;

    /// Exit status of a stopped container.
    ///
    /// # Errors
    /// Returns an error if the container cannot be inspected.
    fn exit_code(&self, id: &str) -> Result<i32, DockerError>;

    /// Remove a container, stopping it first if needed.
    ///
    /// # Errors
    /// Returns an error if the container cannot be removed.
    fn remove(&self, id: &str) -> Result<(), DockerError>;

    /// Snapshot a container into `repository:tag`; returns the image id.
    ///
    /// # Errors
    /// Returns an error if the commit fails.
    fn commit(&self, id: &str, repository: &str, tag: &str) -> Result<String, DockerError>;

    /// Filesystem changes of a container relative to its image.
    ///
    /// # Errors
    /// Returns an error if the change list cannot be read.
    fn diff(&self, id: &str) -> Result<Vec<Change>, DockerError>;

    /// A tar stream holding the single path `path` from the container.
    ///
    /// # Errors
    /// Returns an error if the copy cannot be started.
    fn copy_out(&self, id: &str, path: &str) -> Result<Box<dyn Read + Send>, DockerError>;

    /// The container's writable layer on the host, if the storage driver exposes one.
    ///
    /// # Errors
    /// Returns an error if the runtime cannot be queried.
    fn upper_dir(&self, id: &str) -> Result<Option<PathBuf>, DockerError>;

    /// Images whose repository is exactly `repository`.
    ///
    /// # Errors
    /// Returns an error if the image list cannot be read.
    fn images(&self, repository: &str) -> Result<Vec<ImageSummary>, DockerError>;

    /// # Errors
    /// Returns an error if the image cannot be removed (e.g. still in use).
    fn remove_image(&self, id: &str) -> Result<(), DockerError>;
}

/// The external tool that turns a build manifest directory into an image.
pub trait ImageBuilder: Send + Sync {
    /// Build `context_dir` and tag the result `repo_tag`, streaming tool output to `sink`.
    ///
    /// # Errors
    /// Returns [`DockerError::BuildFailed`] if the tool exits unsuccessfully.
    fn build(
        &self,
        context_dir: &Path,
        repo_tag: &str,
        sink: &mut dyn FnMut(&str),
    ) -> Result<(), DockerError>;
}
