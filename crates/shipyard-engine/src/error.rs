//! Error types for shipyard-engine.

use shipyard_config::ConfigError;
use shipyard_docker::DockerError;
use shipyard_util::error::UtilError;

/// Errors produced by engine operations.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// A filesystem operation failed.
    #[error("cannot access {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    /// A utility operation failed.
    #[error("{0}")]
    Util(#[from] UtilError),

    /// Configuration could not be loaded.
    #[error("{0}")]
    Config(#[from] ConfigError),

    /// The container runtime or image build tool failed.
    #[error("{0}")]
    Docker(#[from] DockerError),

    /// The build container exited unsuccessfully.
    #[error("build of job `{job}` in image {image} exited with status {status}")]
    BuildFailure {
        job: String,
        image: String,
        status: i32,
    },

    /// The runtime reported a changed path that is not absolute.
    #[error("container diff path `{path}` is not absolute")]
    InvalidDiffPath { path: String },

    /// The runtime rejected a container spec.
    #[error("cannot create container from image {image}: {message}")]
    ContainerCreate { image: String, message: String },

    /// An image could not be found right after it was built.
    #[error("image {reference} is missing after a successful build")]
    ImageMissing { reference: String },

    /// The extraction worker pool could not be started.
    #[error("cannot start diff extraction workers: {message}")]
    WorkerPool { message: String },

    /// No publisher is configured for a package type.
    #[error("no publisher configured for {package_type} packages; expected exactly one backend under [publishers.{package_type}]")]
    PublisherNotConfigured { package_type: String },

    /// The configured publisher backend does not exist for the package type.
    #[error("no `{backend}` publisher exists for {package_type} packages")]
    PublisherNotFound {
        package_type: String,
        backend: String,
    },

    /// A publisher backend call failed.
    #[error("{backend} publisher: {message}")]
    Publish { backend: String, message: String },

    /// The extraction container for a package exited unsuccessfully.
    #[error("extracting build outputs for package `{package}` exited with status {status}")]
    ExtractionFailed { package: String, status: i32 },

    /// The packaging tool failed.
    #[error("packaging `{package}` failed with {}", status_text(.status))]
    PackagingFailed {
        package: String,
        status: Option<i32>,
    },

    /// A package names a release repository absent from the configuration.
    #[error("release repository `{name}` not found in configuration")]
    RepoNotFound { name: String },

    /// The job is not declared in the project settings.
    #[error("job `{job}` is not defined in shipyard.toml")]
    JobNotFound { job: String },

    /// The job names a builder that has no script.
    #[error("builder `{builder}` does not exist")]
    BuilderNotFound { builder: String },

    /// Neither a codename nor `--or-just-build` was given.
    #[error("no configuration found to package '{branch}' branch")]
    NoPackagingConfig { branch: String },

    /// The source URL is not a recognised SCM path.
    #[error("unrecognised SCM path: {url}")]
    UnsupportedScmPath { url: String },

    /// A package option is unusable.
    #[error("package `{package}`: {message}")]
    InvalidPackage { package: String, message: String },
}

fn status_text(status: &Option<i32>) -> String {
    match status {
        Some(code) => format!("status {code}"),
        None => "a signal".to_owned(),
    }
}

pub(crate) fn io_err(path: &std::path::Path) -> impl FnOnce(std::io::Error) -> EngineError + '_ {
    move |source| EngineError::Io {
        path: path.display().to_string(),
        source,
    }
}
