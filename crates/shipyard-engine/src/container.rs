//! Container Engine: one container's lifecycle and the extraction of the files it produced.
//!
//! Two extraction strategies exist. When the runtime exposes the container's
//! writable layer as a host directory it is copied wholesale; otherwise the
//! runtime's change list is filtered down to the most specific changed paths
//! and each one is streamed out as a tar archive.

use std::collections::BTreeSet;
use std::io::Read;
use std::path::{Component, Path, PathBuf};

use rayon::prelude::{ParallelIterator, ParallelSlice};

use shipyard_docker::{Change, ChangeKind, ContainerRuntime, ContainerSpec};
use shipyard_util::fs::{copy_tree, ensure_dir, force_remove, make_permissive};

use crate::error::{io_err, EngineError};
use crate::image::Image;

/// Root of everything the orchestrator puts inside a container.
pub const CONTAINER_BASE_DIR: &str = "/.shipyard";
/// `$HOME` of the build.
pub const CONTAINER_HOME: &str = "/.shipyard/build";
/// Where the build works on its copy of the source.
pub const CONTAINER_SOURCE: &str = "/.shipyard/build/src";
/// Where the host checkout is mounted.
pub const CONTAINER_TEMP: &str = "/.shipyard/tmp";
/// Parent of the persisted volume mounts.
pub const CONTAINER_SHARED: &str = "/.shipyard/shared";
/// Where the helper scripts are mounted.
pub const CONTAINER_SCRIPTS_DIR: &str = "/scripts";

/// Top-level names owned by the runtime or the orchestrator, never build output.
pub const RESERVED_NAMES: &[&str] = &[
    "dev",
    ".shipyard",
    ".wh..wh.aufs",
    ".wh..wh.plnk",
    ".wh..wh.orph",
    "tmp",
];

/// Below this many paths per worker, extraction stays on the calling thread.
const PARALLEL_THRESHOLD_FACTOR: usize = 5;

/// Where a container is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    Created,
    Running,
    Exited(i32),
    Diffed,
    Removed,
}

/// A container owned by whoever created it. Dropping it removes it.
pub struct Container<'r> {
    runtime: &'r dyn ContainerRuntime,
    id: String,
    image: String,
    state: ContainerState,
    status: Option<i32>,
    diff_dir: Option<PathBuf>,
}

impl std::fmt::Debug for Container<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Container")
            .field("id", &self.id)
            .field("image", &self.image)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl<'r> Container<'r> {
    /// Create a container from `spec`. It is not started.
    ///
    /// # Errors
    /// Returns [`EngineError::ContainerCreate`] if the runtime rejects the spec.
    pub fn create(runtime: &'r dyn ContainerRuntime, spec: &ContainerSpec) -> Result<Self, EngineError> {
        let id = runtime
            .create(spec)
            .map_err(|e| EngineError::ContainerCreate {
                image: spec.image.clone(),
                message: e.to_string(),
            })?;
        log::debug!("created container {} from {}", short_id(&id), spec.image);
        Ok(Self {
            runtime,
            id,
            image: spec.image.clone(),
            state: ContainerState::Created,
            status: None,
            diff_dir: None,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> ContainerState {
        self.state
    }

    /// Exit status, once the container has run.
    pub fn status(&self) -> Option<i32> {
        self.status
    }

    /// Directory the diff was copied to by the direct strategy, if it was used.
    pub fn diff_dir(&self) -> Option<&Path> {
        self.diff_dir.as_deref()
    }

    /// Start the container, log its output until it exits and record the exit status.
    ///
    /// # Errors
    /// Returns an error if the runtime fails to start, follow or inspect the container.
    pub fn run(&mut self) -> Result<i32, EngineError> {
        let prefix = short_id(&self.id).to_owned();
        self.run_with(&mut |line| log::info!("[{prefix}] {line}"))
    }

    /// Like [`Container::run`], handing each output line to `sink` instead of the log.
    ///
    /// # Errors
    /// Returns an error if the runtime fails to start, follow or inspect the container.
    pub fn run_with(&mut self, sink: &mut dyn FnMut(&str)) -> Result<i32, EngineError> {
        self.runtime.start(&self.id)?;
        self.state = ContainerState::Running;
        self.runtime.follow_logs(&self.id, sink)?;
        self.stop();
        let status = self.runtime.exit_code(&self.id)?;
        self.status = Some(status);
        self.state = ContainerState::Exited(status);
        log::debug!("container {} exited with status {status}", short_id(&self.id));
        Ok(status)
    }

    /// Graceful stop followed by a kill. Failures (e.g. already stopped) are ignored.
    pub fn stop(&self) {
        if let Err(e) = self.runtime.stop(&self.id) {
            log::debug!("stop {}: {e}", short_id(&self.id));
        }
        if let Err(e) = self.runtime.kill(&self.id) {
            log::debug!("kill {}: {e}", short_id(&self.id));
        }
    }

    /// Copy every file the container added or changed into `dest`.
    ///
    /// `workers` bounds the parallelism of the per-file strategy.
    ///
    /// # Errors
    /// Returns an error if the diff cannot be read or a file cannot be copied.
    pub fn extract_diff(&mut self, dest: &Path, workers: usize) -> Result<(), EngineError> {
        ensure_dir(dest)?;
        match self.runtime.upper_dir(&self.id)? {
            Some(upper) if upper.is_dir() => {
                log::info!("copying build output from the container's writable layer...");
                copy_upper_dir(&upper, dest)?;
                self.diff_dir = Some(dest.to_path_buf());
            }
            _ => {
                log::info!("copying build output through the container runtime...");
                let changes = self.runtime.diff(&self.id)?;
                let paths = filter_diff(&changes);
                copy_paths(self.runtime, &self.id, &paths, dest, workers)?;
            }
        }
        self.state = ContainerState::Diffed;
        Ok(())
    }

    /// Snapshot the container into `repository:tag`. The container is kept.
    ///
    /// # Errors
    /// Returns an error if the runtime fails to commit.
    pub fn commit(&self, repository: &str, tag: &str) -> Result<Image, EngineError> {
        let id = self.runtime.commit(&self.id, repository, tag)?;
        log::info!("committed container {} as {repository}:{tag}", short_id(&self.id));
        Ok(Image::found(repository, tag, id))
    }

    /// Remove the container. Calling it again is a no-op.
    ///
    /// # Errors
    /// Returns an error if the runtime fails to remove it.
    pub fn remove(&mut self) -> Result<(), EngineError> {
        if self.state == ContainerState::Removed {
            return Ok(());
        }
        self.runtime.remove(&self.id)?;
        self.state = ContainerState::Removed;
        log::debug!("removed container {}", short_id(&self.id));
        Ok(())
    }
}

impl Drop for Container<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.remove() {
            log::warn!("failed to remove container {}: {e}", short_id(&self.id));
        }
    }
}

/// Create a container, run `f` with it and remove it on every exit path.
///
/// A removal failure is logged and never replaces the result of `f`.
///
/// # Errors
/// Returns an error if the container cannot be created, or whatever `f` returns.
pub fn with_container<T, F>(
    runtime: &dyn ContainerRuntime,
    spec: &ContainerSpec,
    f: F,
) -> Result<T, EngineError>
where
    F: FnOnce(&mut Container<'_>) -> Result<T, EngineError>,
{
    let mut container = Container::create(runtime, spec)?;
    let result = f(&mut container);
    if let Err(e) = container.remove() {
        log::warn!("failed to remove container {}: {e}", short_id(container.id()));
    }
    result
}

/// First 12 characters of a container id, as the runtime displays them.
pub fn short_id(id: &str) -> &str {
    id.get(..12).unwrap_or(id)
}

/// Reduce a change list to the paths worth copying.
///
/// Deletions and reserved top-level names are dropped, and a path is dropped
/// when a more specific changed path under it has already been kept.
/// Paths are visited in reverse lexicographic order, so the result is the same
/// whatever order the runtime reported the changes in.
pub fn filter_diff(changes: &[Change]) -> Vec<String> {
    let mut paths: Vec<&str> = changes
        .iter()
        .filter(|c| c.kind != ChangeKind::Deleted)
        .map(|c| c.path.as_str())
        .collect();
    paths.sort_unstable_by(|a, b| b.cmp(a));
    paths.dedup();

    let mut kept: BTreeSet<String> = BTreeSet::new();
    let mut out = Vec::new();
    for path in paths {
        let trimmed = trim_trailing_slash(path);
        if is_reserved(trimmed) || kept.contains(trimmed) {
            continue;
        }
        let dir = format!("{trimmed}/");
        let covered = kept
            .range(dir.clone()..)
            .next()
            .is_some_and(|k| k.starts_with(&dir));
        if covered {
            continue;
        }
        kept.insert(trimmed.to_owned());
        out.push(trimmed.to_owned());
    }
    out
}

fn trim_trailing_slash(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        "/"
    } else {
        trimmed
    }
}

fn is_reserved(path: &str) -> bool {
    path.trim_start_matches('/')
        .split('/')
        .next()
        .is_some_and(|first| RESERVED_NAMES.contains(&first))
}

fn copy_upper_dir(upper: &Path, dest: &Path) -> Result<(), EngineError> {
    copy_tree(upper, dest)?;
    for name in RESERVED_NAMES {
        force_remove(&dest.join(name))?;
    }
    Ok(())
}

fn copy_paths(
    runtime: &dyn ContainerRuntime,
    id: &str,
    paths: &[String],
    dest: &Path,
    workers: usize,
) -> Result<(), EngineError> {
    let workers = workers.max(1);
    if paths.len() < workers.saturating_mul(PARALLEL_THRESHOLD_FACTOR) {
        return paths
            .iter()
            .try_for_each(|path| copy_path(runtime, id, path, dest));
    }

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(workers)
        .build()
        .map_err(|e| EngineError::WorkerPool {
            message: e.to_string(),
        })?;
    let chunk = (paths.len() / workers).max(1);
    log::debug!(
        "copying {} paths on {workers} workers in chunks of {chunk}",
        paths.len()
    );
    pool.install(|| {
        paths.par_chunks(chunk).try_for_each(|chunk| {
            chunk
                .iter()
                .try_for_each(|path| copy_path(runtime, id, path, dest))
        })
    })
}

/// Stream one absolute container path out of the runtime into the same place under `dest`.
fn copy_path(
    runtime: &dyn ContainerRuntime,
    id: &str,
    path: &str,
    dest: &Path,
) -> Result<(), EngineError> {
    let relative = Path::new(path)
        .strip_prefix("/")
        .map_err(|_| EngineError::InvalidDiffPath {
            path: path.to_owned(),
        })?;
    let target = dest.join(relative);
    let parent = target.parent().unwrap_or(dest);
    ensure_dir(parent)?;

    let stream = runtime.copy_out(id, path)?;
    unpack_into(stream, parent, path)?;

    if target.symlink_metadata().is_ok() {
        make_permissive(&target)?;
    }
    Ok(())
}

/// Unpack a tar stream into `dir`, rejecting entries that escape it.
fn unpack_into(stream: Box<dyn Read + Send>, dir: &Path, source: &str) -> Result<(), EngineError> {
    let mut archive = tar::Archive::new(stream);
    archive.set_preserve_permissions(true);
    let archive_err = |e: std::io::Error| EngineError::Io {
        path: source.to_owned(),
        source: e,
    };

    for entry in archive.entries().map_err(archive_err)? {
        let mut entry = entry.map_err(archive_err)?;
        let entry_path = entry.path().map_err(archive_err)?.into_owned();
        let escapes = entry_path
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::RootDir | Component::Prefix(_)));
        if escapes {
            return Err(EngineError::InvalidDiffPath {
                path: format!("{source}: {}", entry_path.display()),
            });
        }
        let target = dir.join(&entry_path);
        if let Some(parent) = target.parent() {
            ensure_dir(parent)?;
        }
        entry.unpack(&target).map_err(io_err(&target))?;
    }
    Ok(())
}
