//! The per-repository `shipyard.toml`: jobs, packages and branch codenames.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// File name of the job settings at the root of a source checkout.
pub const SETTINGS_FILE: &str = "shipyard.toml";

/// Everything a source repository declares about how it is built and released.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProjectSettings {
    #[serde(default)]
    pub jobs: BTreeMap<String, JobConfig>,
    #[serde(default)]
    pub packages: PackagesSection,
    #[serde(default)]
    pub github_base_url: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PackagesSection {
    /// Release codename to publish to for each branch.
    #[serde(default)]
    pub branch_codenames: BTreeMap<String, String>,
}

/// One build job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    /// Name of the builder script run inside the container.
    pub builder: String,
    /// Base image of the build-dependency image.
    #[serde(default = "default_base")]
    pub base: String,
    /// Subdirectory of the repository the job works in.
    #[serde(default)]
    pub start_in: String,
    #[serde(default)]
    pub apt_keys: Vec<String>,
    #[serde(default)]
    pub apt_repos: Vec<String>,
    #[serde(default)]
    pub build_depends: Vec<BuildDepend>,
    /// Make target run inside the image to install build dependencies.
    #[serde(default)]
    pub build_depends_target: Option<String>,
    /// Container directories kept across builds of the same branch and job.
    #[serde(default)]
    pub persist: Vec<String>,
    #[serde(default)]
    pub environment: JobEnvironment,
    #[serde(default)]
    pub packages: Vec<PackageConfig>,
    #[serde(default)]
    pub skip_tests: bool,
    #[serde(default)]
    pub tests: Vec<String>,
}

fn default_base() -> String {
    "debian:stable".to_owned()
}

/// A build dependency: a bare apt package name or a package with debconf selections.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BuildDepend {
    Name(String),
    WithSelections {
        name: String,
        #[serde(default)]
        selections: Vec<String>,
    },
}

impl BuildDepend {
    pub fn name(&self) -> &str {
        match self {
            Self::Name(name) | Self::WithSelections { name, .. } => name,
        }
    }
}

/// Job environment: plain variables plus per-branch overrides under `branches`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobEnvironment {
    #[serde(default)]
    pub branches: BTreeMap<String, BTreeMap<String, String>>,
    #[serde(flatten)]
    pub vars: BTreeMap<String, String>,
}

impl JobEnvironment {
    /// Job variables with the overrides of `branch` applied on top.
    pub fn for_branch(&self, branch: &str) -> BTreeMap<String, String> {
        let mut env = self.vars.clone();
        if let Some(overrides) = self.branches.get(branch) {
            env.extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        env
    }
}

/// One package produced by a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageConfig {
    pub name: String,
    #[serde(default, rename = "type")]
    pub package_type: Option<String>,
    #[serde(default)]
    pub repos: Vec<String>,
    /// Explicit version; overrides the timestamp-derived default.
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub version_epoch: Option<u32>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub files: Option<FilesConfig>,
    /// Codenames a package moves through, in promotion order.
    #[serde(default)]
    pub promote_through: Vec<String>,
    #[serde(default)]
    pub depends: Vec<String>,
    #[serde(default)]
    pub conflicts: Vec<String>,
    #[serde(default)]
    pub replaces: Vec<String>,
    #[serde(default)]
    pub activates: Vec<String>,
    #[serde(default)]
    pub interests: Vec<String>,
    /// Make target that installs the build outputs for packaging.
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default = "default_true")]
    pub copy_diff: bool,
    #[serde(default = "default_architecture")]
    pub architecture: String,
}

fn default_true() -> bool {
    true
}

fn default_architecture() -> String {
    "amd64".to_owned()
}

/// Which source paths are relevant to a package.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilesConfig {
    #[serde(default)]
    pub root: Option<String>,
    #[serde(default)]
    pub include: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
}

impl ProjectSettings {
    /// Parse settings from TOML text.
    ///
    /// # Errors
    /// Returns an error if the text is not valid settings.
    pub fn from_str_at(content: &str, path: &Path) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    /// Read `shipyard.toml` from the root of a source checkout.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or is invalid.
    pub fn from_source(source_root: &Path) -> Result<Self, ConfigError> {
        let path = source_root.join(SETTINGS_FILE);
        let content = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_str_at(&content, &path)
    }

    /// The codename configured for `branch`, if any.
    pub fn codename_for(&self, branch: &str) -> Option<&str> {
        self.packages.branch_codenames.get(branch).map(String::as_str)
    }
}
