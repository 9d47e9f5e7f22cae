//! The build stage: a container from the build-dependency image runs the job's
//! builder over a copy of the source and is committed as the result image.

use std::collections::BTreeMap;
use std::path::Path;

use shipyard_config::JobConfig;
use shipyard_docker::{ContainerRuntime, ContainerSpec, VolumeBinding};

use crate::container::{with_container, CONTAINER_HOME, CONTAINER_SCRIPTS_DIR, CONTAINER_SOURCE, CONTAINER_TEMP};
use crate::dockerfile;
use crate::error::EngineError;
use crate::image::{sanitise_tag, tag_with_hash, Image, ImageCache};
use crate::project::Project;
use crate::volumes::{persisted_volumes, PersistedVolume};

/// Image stage names.
pub const DEPS_STAGE: &str = "build-deps";
pub const BUILD_STAGE: &str = "build";

/// Where the host's SSH directory is mounted.
const CONTAINER_SSH_DIR: &str = "/root/.ssh";

/// Everything the build stage needs about one job run.
#[derive(Debug, Clone, Copy)]
pub struct BuildRequest<'a> {
    pub project: &'a Project,
    pub job: &'a JobConfig,
    /// Host directory holding the helper and builder scripts.
    pub scripts_dir: &'a Path,
    /// Host directory mounted as the build's SSH directory.
    pub ssh_dir: &'a Path,
    pub skip_tests: bool,
}

/// Environment of the build container.
///
/// Orchestrator variables come first; job variables and then the branch's
/// overrides are layered on top.
pub fn build_env(job: &JobConfig, branch: &str, skip_tests: bool) -> BTreeMap<String, String> {
    let mut env = BTreeMap::from([
        ("SHIPYARD_HOME".to_owned(), CONTAINER_HOME.to_owned()),
        ("SOURCE_ROOT".to_owned(), CONTAINER_SOURCE.to_owned()),
        ("TEMP_ROOT".to_owned(), CONTAINER_TEMP.to_owned()),
        ("START_IN".to_owned(), job.start_in.clone()),
    ]);
    if skip_tests {
        env.insert("SKIP_TESTS".to_owned(), "true".to_owned());
    }
    if !job.tests.is_empty() {
        env.insert("TESTS".to_owned(), job.tests.join(" "));
    }
    env.extend(job.environment.for_branch(branch));
    env
}

/// The shell program run in the build container.
///
/// The build directories are created first. The mounted checkout is then synced
/// into the build's source directory, persisted folders are restored, the
/// builder runs, and persisted folders are saved.
pub fn build_command(builder: &str, volumes: &[PersistedVolume]) -> Vec<String> {
    let mut steps = vec![
        "set -e".to_owned(),
        format!("mkdir -p \"{CONTAINER_HOME}\" \"{CONTAINER_SOURCE}\" \"{CONTAINER_TEMP}\""),
        format!("source \"{CONTAINER_SCRIPTS_DIR}/persist\""),
        format!("sync \"{CONTAINER_TEMP}/\" \"{CONTAINER_SOURCE}\""),
    ];
    steps.extend(volumes.iter().map(PersistedVolume::restore_command));
    steps.push(format!("/bin/bash < \"{CONTAINER_SCRIPTS_DIR}/{builder}\""));
    steps.extend(volumes.iter().map(PersistedVolume::save_command));
    vec!["/bin/bash".to_owned(), "-c".to_owned(), steps.join("; ")]
}

/// Scripts, checkout, SSH directory and persisted folders.
pub fn build_volumes(
    scripts_dir: &Path,
    source_path: &Path,
    ssh_dir: &Path,
    volumes: &[PersistedVolume],
) -> Vec<VolumeBinding> {
    let mut bindings = vec![
        VolumeBinding::new(scripts_dir, CONTAINER_SCRIPTS_DIR),
        VolumeBinding::new(source_path, CONTAINER_TEMP),
        VolumeBinding::new(ssh_dir, CONTAINER_SSH_DIR),
    ];
    bindings.extend(volumes.iter().map(PersistedVolume::binding));
    bindings
}

/// Make sure the build-dependency image for the job exists.
///
/// # Errors
/// Returns an error if the manifest cannot be generated or the image build fails.
pub fn prepare_deps_image(cache: &mut ImageCache<'_>, request: &BuildRequest<'_>) -> Result<Image, EngineError> {
    let project = request.project;
    let manifest = dockerfile::generate(request.job, &project.source_path(), &project.manifest_dir())?;
    let repository = project.image_name(DEPS_STAGE);
    let tag = tag_with_hash(&project.branch, &manifest.hash);
    cache.ensure(&repository, &tag, &manifest.dir)
}

/// Run the job's builder on `deps_image` and commit the result image.
///
/// The build container is removed on every path.
///
/// # Errors
/// Returns [`EngineError::BuildFailure`] if the builder exits non-zero, or an
/// error from the runtime.
pub fn run_build(
    runtime: &dyn ContainerRuntime,
    request: &BuildRequest<'_>,
    deps_image: &Image,
) -> Result<Image, EngineError> {
    let project = request.project;
    let job = request.job;
    let volumes = persisted_volumes(&job.persist, &project.shared_root())?;
    let spec = ContainerSpec::new(&deps_image.run_reference(), build_command(&job.builder, &volumes))
        .env(build_env(job, &project.branch, request.skip_tests))
        .volumes(build_volumes(
            request.scripts_dir,
            &project.source_path(),
            request.ssh_dir,
            &volumes,
        ));

    log::info!(
        "building {} ({} on {}) with `{}`",
        project.name,
        project.job,
        project.branch,
        job.builder
    );
    with_container(runtime, &spec, |container| {
        let status = container.run()?;
        if status != 0 {
            log::error!("build of {} failed with status {status}", project.job);
            return Err(EngineError::BuildFailure {
                job: project.job.clone(),
                image: deps_image.reference(),
                status,
            });
        }
        container.commit(&project.image_name(BUILD_STAGE), &sanitise_tag(&project.branch))
    })
}

/// Remove an image, logging instead of failing.
pub fn discard_image(runtime: &dyn ContainerRuntime, image: &Image) {
    let reference = image.run_reference();
    match runtime.remove_image(&reference) {
        Ok(()) => log::debug!("removed image {}", image.reference()),
        Err(e) => log::warn!("couldn't delete image {}: {e}", image.reference()),
    }
}
