//! Publishers put built packages into release repositories.
//!
//! Backends are looked up in a fixed `(package type, backend name)` table;
//! the orchestrator configuration picks one backend per package type.

pub mod local_deb_s3;
pub mod tansit;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use shipyard_config::{Config, RepoConfig};

use crate::error::EngineError;

pub use local_deb_s3::LocalDebS3;
pub use tansit::{HttpRpc, RpcClient, Tansit};

/// `Cache-Control` applied to repository metadata on every mutation.
pub const DEFAULT_CACHE_CONTROL: &str = "max-age=0";

/// One package entry of a repository listing, as `field -> value`.
pub type ManifestRecord = BTreeMap<String, String>;

/// What a publisher needs to know about the package it moves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackageRef<'a> {
    pub name: &'a str,
    pub architecture: &'a str,
    /// The built artifact; only meaningful for uploads.
    pub file: &'a Path,
}

/// A codename and component within a release repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Channel<'a> {
    pub codename: &'a str,
    pub component: &'a str,
}

impl<'a> Channel<'a> {
    pub fn new(codename: &'a str, component: &'a str) -> Self {
        Self {
            codename,
            component,
        }
    }
}

/// Durable storage of released packages.
pub trait Publisher: Send + Sync {
    /// Backend name as written in the configuration.
    fn backend(&self) -> &str;

    /// Every package entry of `repo` under `codename`/`component` for `arch`.
    ///
    /// # Errors
    /// Returns an error if the listing cannot be fetched.
    fn list(
        &self,
        repo: &RepoConfig,
        codename: &str,
        component: &str,
        arch: &str,
    ) -> Result<Vec<ManifestRecord>, EngineError>;

    /// Copy exactly `versions` of a package between channels of `repo`.
    ///
    /// # Errors
    /// Returns an error if the copy fails.
    fn copy(
        &self,
        repo: &RepoConfig,
        package: &PackageRef<'_>,
        from: Channel<'_>,
        to: Channel<'_>,
        versions: &[String],
    ) -> Result<(), EngineError>;

    /// Add the package's artifact to `repo` under `to`.
    ///
    /// # Errors
    /// Returns an error if the upload fails.
    fn upload(&self, repo: &RepoConfig, package: &PackageRef<'_>, to: Channel<'_>) -> Result<(), EngineError>;
}

/// What a backend constructor receives.
#[derive(Debug, Clone, Copy)]
pub struct BackendContext<'a> {
    /// Orchestrator home directory (already expanded).
    pub home: &'a Path,
    /// The backend's option table from the configuration.
    pub options: &'a toml::Table,
}

pub type Constructor = fn(&BackendContext<'_>) -> Result<Arc<dyn Publisher>, EngineError>;

const REGISTRY: &[(&str, &str, Constructor)] = &[
    ("debian", local_deb_s3::BACKEND, local_deb_s3::from_context),
    ("debian", tansit::BACKEND, tansit::from_context),
];

/// The constructor registered for a package type and backend.
pub fn constructor(package_type: &str, backend: &str) -> Option<Constructor> {
    REGISTRY
        .iter()
        .find(|(t, b, _)| *t == package_type && *b == backend)
        .map(|(_, _, ctor)| *ctor)
}

/// Hands out the publisher for a package type.
pub trait PublisherProvider {
    /// # Errors
    /// Returns [`EngineError::PublisherNotConfigured`] or
    /// [`EngineError::PublisherNotFound`] when no usable backend is selected.
    fn publisher(&self, package_type: &str) -> Result<Arc<dyn Publisher>, EngineError>;
}

/// Publishers selected by the `[publishers]` section of the configuration.
#[derive(Debug)]
pub struct ConfiguredPublishers<'c> {
    config: &'c Config,
    home: PathBuf,
}

impl<'c> ConfiguredPublishers<'c> {
    pub fn new(config: &'c Config, home: &Path) -> Self {
        Self {
            config,
            home: home.to_path_buf(),
        }
    }
}

impl PublisherProvider for ConfiguredPublishers<'_> {
    fn publisher(&self, package_type: &str) -> Result<Arc<dyn Publisher>, EngineError> {
        let not_configured = || EngineError::PublisherNotConfigured {
            package_type: package_type.to_owned(),
        };
        let selection = self.config.publishers.get(package_type).ok_or_else(not_configured)?;
        let (backend, options) = selection.backend().ok_or_else(not_configured)?;
        let ctor = constructor(package_type, backend).ok_or_else(|| EngineError::PublisherNotFound {
            package_type: package_type.to_owned(),
            backend: backend.to_owned(),
        })?;
        log::debug!("using {backend} publisher for {package_type} packages");
        ctor(&BackendContext {
            home: &self.home,
            options: &options,
        })
    }
}
