//! Turning a job's result image into release artifacts.
//!
//! A package is extracted by running its install target in a container from
//! the result image and copying what changed. The staged files are handed
//! to the packaging tool, and the artifact is uploaded to every repository
//! the package is released to.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use time::macros::format_description;
use time::OffsetDateTime;

use shipyard_config::{Config, JobConfig, PackageConfig, RepoConfig};
use shipyard_docker::{ContainerRuntime, ContainerSpec, VolumeBinding};
use shipyard_util::fs::{ensure_dir, remove_dir_all_if_exists, remove_file_if_exists};
use shipyard_util::hash::short;

use crate::container::{with_container, CONTAINER_HOME, CONTAINER_SCRIPTS_DIR, CONTAINER_SOURCE, CONTAINER_TEMP};
use crate::error::EngineError;
use crate::fpm::{top_level_entries, FpmCommand, PackagingTool};
use crate::image::Image;
use crate::project::Project;
use crate::publisher::{Channel, PackageRef, Publisher};
use crate::source::ChangeDetector;

/// Package type assumed when a package does not declare one.
pub const DEFAULT_PACKAGE_TYPE: &str = "debian";

/// Repository component packages are released to.
pub const COMPONENT: &str = "main";

/// Directory of a package's maintainer scripts, relative to the checkout.
pub const PACKAGE_SCRIPTS_DIR: &str = "shipyard/packages";

const SHORT_COMMIT_LEN: usize = 7;

/// Pause after wiping a staging directory before it is reused.
const SETTLE_DELAY: Duration = Duration::from_secs(2);

/// One package of a job run, with its repositories and version resolved.
#[derive(Debug, Clone)]
pub struct Packager<'a> {
    project: &'a Project,
    job: &'a JobConfig,
    config: &'a PackageConfig,
    package_type: String,
    repos: Vec<RepoConfig>,
    version: String,
    commit: String,
}

impl<'a> Packager<'a> {
    /// Resolve `package` for the commit being built.
    ///
    /// `repo_override` replaces the package's repository list with a single
    /// repository. `now` stamps the default version.
    ///
    /// # Errors
    /// Returns [`EngineError::RepoNotFound`] if a repository is not configured.
    pub fn new(
        project: &'a Project,
        job: &'a JobConfig,
        package: &'a PackageConfig,
        config: &Config,
        repo_override: Option<&str>,
        commit: &str,
        now: OffsetDateTime,
    ) -> Result<Self, EngineError> {
        let package_type = match &package.package_type {
            Some(t) => t.clone(),
            None => {
                log::warn!(
                    "package {} has no type, assuming {DEFAULT_PACKAGE_TYPE}",
                    package.name
                );
                DEFAULT_PACKAGE_TYPE.to_owned()
            }
        };

        let names: Vec<&str> = match repo_override {
            Some(name) => vec![name],
            None => package.repos.iter().map(String::as_str).collect(),
        };
        let repos = names
            .into_iter()
            .map(|name| {
                config
                    .repo(name)
                    .cloned()
                    .ok_or_else(|| EngineError::RepoNotFound { name: name.to_owned() })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let version = match &package.version {
            Some(v) => v.clone(),
            None => default_version(package.version_epoch, now, commit).map_err(|e| EngineError::InvalidPackage {
                package: package.name.clone(),
                message: format!("cannot format version timestamp: {e}"),
            })?,
        };

        Ok(Self {
            project,
            job,
            config: package,
            package_type,
            repos,
            version,
            commit: commit.to_owned(),
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn package_type(&self) -> &str {
        &self.package_type
    }

    pub fn repos(&self) -> &[RepoConfig] {
        &self.repos
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn architecture(&self) -> &str {
        &self.config.architecture
    }

    pub fn promote_through(&self) -> &[String] {
        &self.config.promote_through
    }

    /// The package's source selection as `(root, include, exclude)`.
    ///
    /// Root, include and exclude rules are resolved against the job's
    /// `start_in` unless they start with `/`. The package's maintainer-script
    /// directory is always included, relative to the checkout.
    pub fn file_selection(&self) -> Option<(String, Vec<String>, Vec<String>)> {
        let files = self.config.files.as_ref()?;
        let start_in = self.job.start_in.as_str();
        let root = match files.root.as_deref() {
            None => start_in.to_owned(),
            Some(root) => resolve_rule(start_in, root),
        };
        let mut include: Vec<String> = files.include.iter().map(|rule| resolve_rule(start_in, rule)).collect();
        include.push(format!("{PACKAGE_SCRIPTS_DIR}/{}/", self.config.name));
        let exclude = files.exclude.iter().map(|rule| resolve_rule(start_in, rule)).collect();
        Some((root, include, exclude))
    }

    /// Whether the package's sources changed since the last successful build.
    /// A package without a `files` section always needs packaging.
    ///
    /// # Errors
    /// Returns an error if a selection rule is invalid.
    pub fn needs_packaging(&self, detector: &dyn ChangeDetector) -> Result<bool, EngineError> {
        let Some((root, include, exclude)) = self.file_selection() else {
            return Ok(true);
        };
        detector.has_changes(&root, &include, &exclude)
    }

    /// `<packages>/<name>-<version>.deb`
    pub fn artifact_path(&self) -> PathBuf {
        self.project
            .packages_dir()
            .join(format!("{}-{}.deb", self.config.name, self.version))
    }

    /// Staging directory the extracted files land in.
    pub fn work_dir(&self) -> PathBuf {
        self.project.package_work_dir(&self.config.name)
    }

    /// Empty the staging directory.
    ///
    /// # Errors
    /// Returns an error if it cannot be removed or recreated.
    pub fn clean(&self) -> Result<(), EngineError> {
        let dir = self.work_dir();
        if dir.exists() {
            remove_dir_all_if_exists(&dir)?;
            std::thread::sleep(SETTLE_DELAY);
        }
        ensure_dir(&dir)?;
        Ok(())
    }

    /// Environment of the extraction container.
    pub fn extraction_env(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("HOME".to_owned(), CONTAINER_HOME.to_owned()),
            ("TARGET".to_owned(), self.config.target.clone().unwrap_or_default()),
            ("SOURCE_ROOT".to_owned(), CONTAINER_SOURCE.to_owned()),
            ("TEMP_ROOT".to_owned(), CONTAINER_TEMP.to_owned()),
            ("START_IN".to_owned(), self.job.start_in.clone()),
        ])
    }

    fn extraction_spec(&self, image: &Image, scripts_dir: &Path) -> ContainerSpec {
        ContainerSpec::new(
            image.run_reference(),
            vec![
                "/bin/bash".to_owned(),
                format!("{CONTAINER_SCRIPTS_DIR}/make-install"),
            ],
        )
        .env(self.extraction_env())
        .volumes(vec![
            VolumeBinding::new(scripts_dir, CONTAINER_SCRIPTS_DIR),
            VolumeBinding::new(self.project.source_path(), CONTAINER_TEMP),
        ])
    }

    /// Stage the package's files from `image` and build the artifact.
    ///
    /// # Errors
    /// Returns [`EngineError::ExtractionFailed`] if the install target fails,
    /// [`EngineError::PackagingFailed`] if the packaging tool fails, or an
    /// error from the runtime or filesystem.
    pub fn package(
        &self,
        runtime: &dyn ContainerRuntime,
        tool: &dyn PackagingTool,
        image: &Image,
        scripts_dir: &Path,
        workers: usize,
    ) -> Result<PathBuf, EngineError> {
        self.clean()?;
        let staging = self.work_dir();

        if self.config.copy_diff {
            log::info!("extracting files for {}", self.name());
            let spec = self.extraction_spec(image, scripts_dir);
            with_container(runtime, &spec, |container| {
                let status = container.run()?;
                if status != 0 {
                    return Err(EngineError::ExtractionFailed {
                        package: self.name().to_owned(),
                        status,
                    });
                }
                if self.config.target.is_some() {
                    container.extract_diff(&staging, workers)?;
                }
                Ok(())
            })?;
        }

        let artifact = self.artifact_path();
        ensure_dir(&self.project.packages_dir())?;
        let command = FpmCommand::new(self.name(), &self.version, self.architecture())
            .output(&artifact)
            .staging_dir(&staging)
            .entries(top_level_entries(&staging)?)
            .description(self.config.description.as_deref())
            .commit_id(&self.commit)
            .depends(&self.config.depends)
            .conflicts(&self.config.conflicts)
            .replaces(&self.config.replaces)
            .activates(&self.config.activates)
            .interests(&self.config.interests)
            .lifecycle_scripts_from(
                &self
                    .project
                    .source_path()
                    .join(PACKAGE_SCRIPTS_DIR)
                    .join(self.name()),
            );
        tool.package(&command)?;
        Ok(artifact)
    }

    /// Upload `artifact` to every repository under `codename`, then delete it.
    ///
    /// The artifact is removed whether or not the uploads succeed.
    ///
    /// # Errors
    /// Returns the first upload error.
    pub fn upload(&self, publisher: &dyn Publisher, artifact: &Path, codename: &str) -> Result<(), EngineError> {
        let package = PackageRef {
            name: self.name(),
            architecture: self.architecture(),
            file: artifact,
        };
        let result = self.repos.iter().try_for_each(|repo| {
            log::info!(
                "uploading {} {} to {}/{codename}",
                self.name(),
                self.version,
                repo.name
            );
            publisher.upload(repo, &package, Channel::new(codename, COMPONENT))
        });
        if let Err(e) = remove_file_if_exists(artifact) {
            log::warn!("couldn't delete {}: {e}", artifact.display());
        }
        result
    }
}

/// `[<epoch>:]<YYYYmmddHHMMSS>-<short commit>`
///
/// # Errors
/// Returns an error if the timestamp cannot be formatted.
pub fn default_version(epoch: Option<u32>, now: OffsetDateTime, commit: &str) -> Result<String, time::error::Format> {
    let stamp = now.format(format_description!("[year][month][day][hour][minute][second]"))?;
    let short_commit = short(commit, SHORT_COMMIT_LEN);
    Ok(match epoch {
        Some(epoch) => format!("{epoch}:{stamp}-{short_commit}"),
        None => format!("{stamp}-{short_commit}"),
    })
}

/// Current local time, falling back to UTC when the offset is unknown.
pub fn now() -> OffsetDateTime {
    OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc())
}

/// A files rule relative to the checkout: `/x` is taken as is, anything else
/// is joined onto `start_in`.
fn resolve_rule(start_in: &str, rule: &str) -> String {
    if let Some(absolute) = rule.strip_prefix('/') {
        return absolute.to_owned();
    }
    let base = start_in.trim_end_matches('/');
    if base.is_empty() {
        rule.to_owned()
    } else {
        format!("{base}/{rule}")
    }
}
