//! Parse and validate the orchestrator `config.toml` and per-repository `shipyard.toml`.

pub mod config;
pub mod error;
pub mod settings;

pub use config::{Config, Defaults, PublisherSelection, RepoConfig};
pub use error::ConfigError;
pub use settings::{
    BuildDepend, FilesConfig, JobConfig, JobEnvironment, PackageConfig, PackagesSection,
    ProjectSettings, SETTINGS_FILE,
};
