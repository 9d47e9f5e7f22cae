//! In-memory collaborators that count what the engine asks of them.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]

use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use shipyard_config::RepoConfig;
use shipyard_docker::{Change, ContainerRuntime, ContainerSpec, DockerError, ImageBuilder, ImageSummary};
use shipyard_engine::fpm::{FpmCommand, PackagingTool};
use shipyard_engine::publisher::{Channel, ManifestRecord, PackageRef, Publisher, PublisherProvider};
use shipyard_engine::source::{ChangeDetector, ChangedPaths, CommitFlags};
use shipyard_engine::EngineError;

/// A container runtime and image builder sharing one image store.
#[derive(Default)]
pub struct FakeDocker {
    pub created: AtomicUsize,
    pub removed: AtomicUsize,
    pub images_built: AtomicUsize,
    pub images_removed: Mutex<Vec<String>>,
    pub specs: Mutex<Vec<ContainerSpec>>,
    pub images: Mutex<Vec<ImageSummary>>,
    pub containers: Mutex<BTreeMap<String, ContainerSpec>>,
    /// Exit status of build containers.
    pub build_status: i32,
    /// Exit status of extraction containers.
    pub extract_status: i32,
    /// Change list and file contents reported for every container.
    pub changes: Vec<Change>,
    pub files: BTreeMap<String, Vec<u8>>,
    /// Writable layer reported for every container, if any.
    pub upper_dir: Option<PathBuf>,
}

impl FakeDocker {
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn removed(&self) -> usize {
        self.removed.load(Ordering::SeqCst)
    }

    pub fn built(&self) -> usize {
        self.images_built.load(Ordering::SeqCst)
    }

    fn is_extraction(spec: &ContainerSpec) -> bool {
        spec.command.iter().any(|c| c.ends_with("make-install"))
    }

    fn add_image(&self, repository: &str, tag: &str) -> String {
        let mut images = self.images.lock().unwrap();
        let id = format!("sha256:{:04}", images.len() + 1);
        images.push(ImageSummary {
            id: id.clone(),
            repository: repository.to_owned(),
            tag: tag.to_owned(),
        });
        id
    }
}

impl ContainerRuntime for FakeDocker {
    fn create(&self, spec: &ContainerSpec) -> Result<String, DockerError> {
        let n = self.created.fetch_add(1, Ordering::SeqCst) + 1;
        let id = format!("{n:012x}{:052}", 0);
        self.specs.lock().unwrap().push(spec.clone());
        self.containers.lock().unwrap().insert(id.clone(), spec.clone());
        Ok(id)
    }

    fn start(&self, _: &str) -> Result<(), DockerError> {
        Ok(())
    }

    fn follow_logs(&self, _: &str, sink: &mut dyn FnMut(&str)) -> Result<(), DockerError> {
        sink("working");
        Ok(())
    }

    fn stop(&self, _: &str) -> Result<(), DockerError> {
        Ok(())
    }

    fn kill(&self, _: &str) -> Result<(), DockerError> {
        Err(DockerError::Parse {
            subcommand: "kill".to_owned(),
            message: "container is not running".to_owned(),
        })
    }

    fn exit_code(&self, id: &str) -> Result<i32, DockerError> {
        let containers = self.containers.lock().unwrap();
        let spec = containers.get(id).unwrap();
        Ok(if Self::is_extraction(spec) {
            self.extract_status
        } else {
            self.build_status
        })
    }

    fn remove(&self, id: &str) -> Result<(), DockerError> {
        self.containers.lock().unwrap().remove(id);
        self.removed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn commit(&self, _: &str, repository: &str, tag: &str) -> Result<String, DockerError> {
        Ok(self.add_image(repository, tag))
    }

    fn diff(&self, _: &str) -> Result<Vec<Change>, DockerError> {
        Ok(self.changes.clone())
    }

    fn copy_out(&self, _: &str, path: &str) -> Result<Box<dyn Read + Send>, DockerError> {
        let name = path.rsplit('/').next().unwrap();
        let data = self.files.get(path).cloned().unwrap_or_default();
        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, name, data.as_slice()).unwrap();
        Ok(Box::new(std::io::Cursor::new(builder.into_inner().unwrap())))
    }

    fn upper_dir(&self, _: &str) -> Result<Option<PathBuf>, DockerError> {
        Ok(self.upper_dir.clone())
    }

    fn images(&self, repository: &str) -> Result<Vec<ImageSummary>, DockerError> {
        Ok(self
            .images
            .lock()
            .unwrap()
            .iter()
            .filter(|i| i.repository == repository)
            .cloned()
            .collect())
    }

    fn remove_image(&self, id: &str) -> Result<(), DockerError> {
        self.images.lock().unwrap().retain(|i| i.id != id);
        self.images_removed.lock().unwrap().push(id.to_owned());
        Ok(())
    }
}

impl ImageBuilder for FakeDocker {
    fn build(&self, _: &Path, repo_tag: &str, sink: &mut dyn FnMut(&str)) -> Result<(), DockerError> {
        sink("Step 1/2 : FROM debian:stable");
        let (repository, tag) = repo_tag.rsplit_once(':').unwrap();
        self.add_image(repository, tag);
        self.images_built.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Records packaging requests. Each artifact holds its version and commit
/// on two lines so the fake publisher can list what was uploaded.
#[derive(Default)]
pub struct FakeFpm {
    pub runs: Mutex<Vec<Vec<String>>>,
}

impl FakeFpm {
    pub fn count(&self) -> usize {
        self.runs.lock().unwrap().len()
    }
}

impl PackagingTool for FakeFpm {
    fn package(&self, command: &FpmCommand) -> Result<(), EngineError> {
        let args = command.build_args()?;
        let commit = args
            .iter()
            .find_map(|a| a.strip_prefix("Git-Commit-Id: "))
            .unwrap_or_default();
        let body = format!("{}\n{commit}\n", command.version());
        std::fs::write(command.output_path().unwrap(), body).unwrap();
        self.runs.lock().unwrap().push(args);
        Ok(())
    }
}

pub struct FakeSource {
    pub commit: String,
    pub changed: ChangedPaths,
    pub flags: CommitFlags,
    pub tagged: AtomicUsize,
}

impl FakeSource {
    pub fn new(commit: &str) -> Self {
        Self {
            commit: commit.to_owned(),
            changed: ChangedPaths::Everything,
            flags: CommitFlags::from_summaries(&["Add feature"]),
            tagged: AtomicUsize::new(0),
        }
    }

    pub fn tagged(&self) -> usize {
        self.tagged.load(Ordering::SeqCst)
    }
}

impl ChangeDetector for FakeSource {
    fn has_changes(&self, root: &str, include: &[String], exclude: &[String]) -> Result<bool, EngineError> {
        self.changed.touches(root, include, exclude)
    }

    fn current_commit_id(&self) -> &str {
        &self.commit
    }

    fn last_build_succeeded(&self) -> Option<&str> {
        None
    }

    fn commit_flags(&self) -> CommitFlags {
        self.flags
    }

    fn tag_success(&self) -> Result<(), EngineError> {
        self.tagged.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// A repository store: `(repo, codename) -> [(package, version, commit)]`.
#[derive(Default)]
pub struct FakePublisher {
    pub listings: Mutex<BTreeMap<(String, String), Vec<(String, String, String)>>>,
    pub lists: AtomicUsize,
    pub copies: Mutex<Vec<CopyCall>>,
    pub uploads: Mutex<Vec<(String, String, PathBuf)>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyCall {
    pub repo: String,
    pub package: String,
    pub from: String,
    pub to: String,
    pub versions: Vec<String>,
}

impl FakePublisher {
    pub fn publish(&self, repo: &str, codename: &str, package: &str, version: &str, commit: &str) {
        self.listings
            .lock()
            .unwrap()
            .entry((repo.to_owned(), codename.to_owned()))
            .or_default()
            .push((package.to_owned(), version.to_owned(), commit.to_owned()));
    }

    pub fn calls(&self) -> usize {
        self.lists.load(Ordering::SeqCst) + self.copies.lock().unwrap().len() + self.uploads.lock().unwrap().len()
    }
}

impl Publisher for FakePublisher {
    fn backend(&self) -> &str {
        "fake"
    }

    fn list(&self, repo: &RepoConfig, codename: &str, _: &str, _: &str) -> Result<Vec<ManifestRecord>, EngineError> {
        self.lists.fetch_add(1, Ordering::SeqCst);
        let listings = self.listings.lock().unwrap();
        let entries = listings
            .get(&(repo.name.clone(), codename.to_owned()))
            .cloned()
            .unwrap_or_default();
        Ok(entries
            .into_iter()
            .map(|(package, version, commit)| {
                ManifestRecord::from([
                    ("Package".to_owned(), package),
                    ("Version".to_owned(), version),
                    ("Git-Commit-Id".to_owned(), commit),
                ])
            })
            .collect())
    }

    fn copy(
        &self,
        repo: &RepoConfig,
        package: &PackageRef<'_>,
        from: Channel<'_>,
        to: Channel<'_>,
        versions: &[String],
    ) -> Result<(), EngineError> {
        self.copies.lock().unwrap().push(CopyCall {
            repo: repo.name.clone(),
            package: package.name.to_owned(),
            from: from.codename.to_owned(),
            to: to.codename.to_owned(),
            versions: versions.to_vec(),
        });
        Ok(())
    }

    fn upload(&self, repo: &RepoConfig, package: &PackageRef<'_>, to: Channel<'_>) -> Result<(), EngineError> {
        let body = std::fs::read_to_string(package.file).expect("artifact must exist while uploading");
        let mut lines = body.lines();
        let version = lines.next().unwrap_or_default();
        let commit = lines.next().unwrap_or_default();
        self.publish(&repo.name, to.codename, package.name, version, commit);
        self.uploads
            .lock()
            .unwrap()
            .push((repo.name.clone(), to.codename.to_owned(), package.file.to_path_buf()));
        Ok(())
    }
}

/// Hands the same publisher out for `debian` and rejects every other type.
pub struct FakeProvider(pub Arc<FakePublisher>);

impl PublisherProvider for FakeProvider {
    fn publisher(&self, package_type: &str) -> Result<Arc<dyn Publisher>, EngineError> {
        if package_type == "debian" {
            let publisher: Arc<dyn Publisher> = self.0.clone();
            Ok(publisher)
        } else {
            Err(EngineError::PublisherNotConfigured {
                package_type: package_type.to_owned(),
            })
        }
    }
}
