//! The `build` and `dist` flows.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use shipyard_config::{Config, JobConfig, ProjectSettings};
use shipyard_docker::{ContainerRuntime, ImageBuilder};

use crate::build::{discard_image, prepare_deps_image, run_build, BuildRequest};
use crate::error::EngineError;
use crate::fpm::PackagingTool;
use crate::image::{Image, ImageCache};
use crate::package::{now, Packager};
use crate::project::Project;
use crate::promote::{PackageManager, PromotionDecision};
use crate::publisher::{Publisher, PublisherProvider};
use crate::scripts::require_builder;
use crate::source::ChangeDetector;

const DEFAULT_SSH_DIR: &str = "/root/.ssh";

/// The external collaborators a flow talks to.
#[derive(Clone, Copy)]
pub struct Services<'a> {
    pub runtime: &'a dyn ContainerRuntime,
    pub image_builder: &'a dyn ImageBuilder,
    pub packaging: &'a dyn PackagingTool,
    pub publishers: &'a dyn PublisherProvider,
}

/// One job of one checked-out branch.
#[derive(Clone, Copy)]
pub struct JobRun<'a> {
    pub config: &'a Config,
    pub project: &'a Project,
    pub settings: &'a ProjectSettings,
    pub source: &'a dyn ChangeDetector,
    /// Host directory holding the materialised helper scripts.
    pub scripts_dir: &'a Path,
}

impl<'a> JobRun<'a> {
    /// # Errors
    /// Returns [`EngineError::JobNotFound`] if the job is not declared, or
    /// [`EngineError::BuilderNotFound`] if its builder has no script.
    fn job(&self) -> Result<&'a JobConfig, EngineError> {
        let job = self
            .settings
            .jobs
            .get(&self.project.job)
            .ok_or_else(|| EngineError::JobNotFound {
                job: self.project.job.clone(),
            })?;
        require_builder(self.scripts_dir, &job.builder)?;
        Ok(job)
    }

    fn ssh_dir(&self) -> PathBuf {
        self.config
            .defaults
            .ssh_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_SSH_DIR))
    }
}

/// Options of the `dist` flow.
#[derive(Debug, Clone, Default)]
pub struct DistOptions {
    /// Codename to release to; falls back to the branch's configured codename.
    pub codename: Option<String>,
    /// Without a codename, build anyway instead of failing.
    pub or_just_build: bool,
    pub skip_tests: bool,
    /// Restrict the run to one package.
    pub package: Option<String>,
    /// Release every package to this repository only.
    pub repo: Option<String>,
}

/// What a `dist` run did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DistOutcome {
    /// Every new commit asked to be skipped.
    Skipped,
    /// Built without packaging; the result image was discarded.
    Built,
    Released(ReleaseSummary),
}

/// Package names by what happened to them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReleaseSummary {
    pub already_published: Vec<String>,
    pub promoted: Vec<String>,
    pub packaged: Vec<String>,
    /// Needed a build but none of their files changed.
    pub unchanged: Vec<String>,
}

fn build_image(
    services: &Services<'_>,
    run: &JobRun<'_>,
    job: &JobConfig,
    skip_tests: bool,
) -> Result<Image, EngineError> {
    let ssh_dir = run.ssh_dir();
    let request = BuildRequest {
        project: run.project,
        job,
        scripts_dir: run.scripts_dir,
        ssh_dir: &ssh_dir,
        skip_tests,
    };
    let mut cache = ImageCache::new(services.runtime, services.image_builder);
    let deps = prepare_deps_image(&mut cache, &request)?;
    run_build(services.runtime, &request, &deps)
}

/// Build the job and return the committed result image.
///
/// # Errors
/// Returns an error if the job is unknown, the build-dependency image cannot
/// be built, or the build fails.
pub fn build(services: &Services<'_>, run: &JobRun<'_>, skip_tests: bool) -> Result<Image, EngineError> {
    let job = run.job()?;
    let skip_tests = skip_tests || job.skip_tests || run.source.commit_flags().skip_tests;
    let image = build_image(services, run, job, skip_tests)?;
    log::info!("build finished: {}", image.reference());
    Ok(image)
}

/// Promote, build, package and release the job's packages.
///
/// # Errors
/// Returns [`EngineError::NoPackagingConfig`] when there is no codename and
/// `or_just_build` is off, a configuration error for unknown jobs, builders,
/// repositories or publishers (before any build work), or the first failure
/// of a build, packaging or publish step.
pub fn dist(services: &Services<'_>, run: &JobRun<'_>, options: &DistOptions) -> Result<DistOutcome, EngineError> {
    let job = run.job()?;
    let flags = run.source.commit_flags();
    if flags.skip_all {
        if flags.commits == 0 {
            log::info!("No new commits, nothing to do");
        } else {
            log::info!("every new commit asks to be skipped, nothing to do");
        }
        return Ok(DistOutcome::Skipped);
    }
    let skip_tests = options.skip_tests || job.skip_tests || flags.skip_tests;

    let codename = options
        .codename
        .clone()
        .or_else(|| run.settings.codename_for(&run.project.branch).map(str::to_owned));

    let outcome = match codename {
        Some(codename) => DistOutcome::Released(release(services, run, job, options, &codename, skip_tests)?),
        None if options.or_just_build => {
            let image = build_image(services, run, job, skip_tests)?;
            discard_image(services.runtime, &image);
            DistOutcome::Built
        }
        None => {
            return Err(EngineError::NoPackagingConfig {
                branch: run.project.branch.clone(),
            });
        }
    };

    run.source.tag_success()?;
    Ok(outcome)
}

fn packagers<'a>(
    services: &Services<'_>,
    run: &JobRun<'a>,
    job: &'a JobConfig,
    options: &DistOptions,
) -> Result<Vec<(Packager<'a>, Arc<dyn Publisher>)>, EngineError> {
    let commit = run.source.current_commit_id();
    let stamp = now();
    let selected: Vec<_> = job
        .packages
        .iter()
        .filter(|p| options.package.as_deref().is_none_or(|name| p.name == name))
        .collect();
    if let Some(name) = &options.package {
        if selected.is_empty() {
            return Err(EngineError::InvalidPackage {
                package: name.clone(),
                message: format!("not declared by job `{}`", run.project.job),
            });
        }
    }
    selected
        .into_iter()
        .map(|package| {
            let packager = Packager::new(
                run.project,
                job,
                package,
                run.config,
                options.repo.as_deref(),
                commit,
                stamp,
            )?;
            let publisher = services.publishers.publisher(packager.package_type())?;
            Ok((packager, publisher))
        })
        .collect()
}

fn release(
    services: &Services<'_>,
    run: &JobRun<'_>,
    job: &JobConfig,
    options: &DistOptions,
    codename: &str,
    skip_tests: bool,
) -> Result<ReleaseSummary, EngineError> {
    let packagers = packagers(services, run, job, options)?;
    let mut manager = PackageManager::new(run.source.current_commit_id(), codename);
    let mut summary = ReleaseSummary::default();

    let mut to_package = Vec::new();
    for (packager, publisher) in &packagers {
        match manager.promote(publisher.as_ref(), packager)? {
            PromotionDecision::AlreadyPublished => summary.already_published.push(packager.name().to_owned()),
            PromotionDecision::Promoted { .. } => summary.promoted.push(packager.name().to_owned()),
            PromotionDecision::Build(_) => {
                if packager.needs_packaging(run.source)? {
                    to_package.push((packager, publisher));
                } else {
                    log::info!("no changes affect {}, not packaging it", packager.name());
                    summary.unchanged.push(packager.name().to_owned());
                }
            }
        }
    }

    if to_package.is_empty() {
        log::info!("no packaging required");
        return Ok(summary);
    }

    let image = build_image(services, run, job, skip_tests)?;
    let workers = run.config.defaults.copy_workers.max(1);
    let result = to_package.into_iter().try_for_each(|(packager, publisher)| {
        let artifact = packager.package(services.runtime, services.packaging, &image, run.scripts_dir, workers)?;
        packager.upload(publisher.as_ref(), &artifact, codename)?;
        summary.packaged.push(packager.name().to_owned());
        Ok(())
    });
    discard_image(services.runtime, &image);
    result.map(|()| summary)
}
