//! The orchestrator configuration file.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Environment variable naming an explicit configuration file.
pub const CONFIG_ENV: &str = "SHIPYARD_CONFIG";

/// Default number of workers used for per-file diff extraction.
pub const DEFAULT_COPY_WORKERS: usize = 10;

/// Top-level orchestrator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub defaults: Defaults,
    /// Release repositories by name.
    #[serde(default)]
    pub repos: BTreeMap<String, RepoConfig>,
    /// Publisher backend per package type.
    #[serde(default = "default_publishers")]
    pub publishers: BTreeMap<String, PublisherSelection>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            defaults: Defaults::default(),
            repos: BTreeMap::new(),
            publishers: default_publishers(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Defaults {
    #[serde(default = "default_home")]
    pub home: PathBuf,
    /// Host directory mounted as `/root/.ssh` in build containers.
    #[serde(default)]
    pub ssh_dir: Option<PathBuf>,
    #[serde(default = "default_copy_workers")]
    pub copy_workers: usize,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            home: default_home(),
            ssh_dir: None,
            copy_workers: DEFAULT_COPY_WORKERS,
        }
    }
}

fn default_home() -> PathBuf {
    PathBuf::from("~/.shipyard")
}

fn default_copy_workers() -> usize {
    DEFAULT_COPY_WORKERS
}

fn default_publishers() -> BTreeMap<String, PublisherSelection> {
    BTreeMap::from([(
        "debian".to_owned(),
        PublisherSelection::Backend("local-deb-s3".to_owned()),
    )])
}

/// A release repository (an S3 bucket holding an apt repository).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoConfig {
    /// Name of the repository; filled from the table key when loading.
    #[serde(default)]
    pub name: String,
    pub bucket: String,
    #[serde(default)]
    pub region: Option<String>,
    /// GPG key used to sign the repository metadata.
    #[serde(default)]
    pub gpg_id: Option<String>,
}

/// Which publisher backend handles a package type.
///
/// Either just a backend name (`debian = "local-deb-s3"`) or a table keyed by
/// backend name holding that backend's options (`[publishers.debian.tansit]`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PublisherSelection {
    Backend(String),
    Configured(BTreeMap<String, toml::Value>),
}

impl PublisherSelection {
    /// The single selected backend and its options.
    ///
    /// Returns `None` when a table names zero or several backends. Options
    /// that are not a table are treated as empty.
    pub fn backend(&self) -> Option<(&str, toml::Table)> {
        match self {
            Self::Backend(name) => Some((name.as_str(), toml::Table::new())),
            Self::Configured(map) => {
                if map.len() != 1 {
                    return None;
                }
                let (name, options) = map.iter().next()?;
                let options = options.as_table().cloned().unwrap_or_default();
                Some((name.as_str(), options))
            }
        }
    }
}

impl Config {
    /// Parse configuration from TOML text.
    ///
    /// # Errors
    /// Returns an error if the text is not valid configuration.
    pub fn from_str_at(content: &str, path: &Path) -> Result<Self, ConfigError> {
        let mut config: Config = toml::from_str(content).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        for (name, repo) in &mut config.repos {
            repo.name.clone_from(name);
        }
        Ok(config)
    }

    /// Read and parse a configuration file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or is invalid.
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_str_at(&content, path)
    }

    /// Load configuration from `explicit` if given, otherwise from the first
    /// existing file among `$SHIPYARD_CONFIG`, `./shipyard-config.toml`,
    /// `~/.shipyard/config.toml` and `/etc/shipyard/config.toml`.
    ///
    /// # Errors
    /// Returns an error if no candidate exists or the chosen file is invalid.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = explicit {
            return Self::from_path(path);
        }

        let mut candidates: Vec<PathBuf> = Vec::new();
        if let Some(env_path) = std::env::var_os(CONFIG_ENV) {
            candidates.push(PathBuf::from(env_path));
        }
        candidates.push(PathBuf::from("shipyard-config.toml"));
        if let Ok(home) = shipyard_util::fs::shipyard_home() {
            candidates.push(home.join("config.toml"));
        }
        candidates.push(PathBuf::from("/etc/shipyard/config.toml"));

        match candidates.iter().find(|p| p.is_file()) {
            Some(path) => Self::from_path(path),
            None => Err(ConfigError::NotFound {
                searched: candidates.iter().map(|p| p.display().to_string()).collect(),
            }),
        }
    }

    /// The orchestrator home directory with `~` expanded.
    ///
    /// # Errors
    /// Returns an error if `~` cannot be expanded.
    pub fn home(&self) -> Result<PathBuf, ConfigError> {
        Ok(shipyard_util::fs::expand_home(&self.defaults.home)?)
    }

    /// Look up a release repository by name.
    pub fn repo(&self, name: &str) -> Option<&RepoConfig> {
        self.repos.get(name)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn parse(content: &str) -> Config {
        Config::from_str_at(content, Path::new("config.toml")).unwrap()
    }

    #[test]
    fn empty_config_uses_defaults() {
        let config = parse("");
        assert_eq!(config.defaults.copy_workers, 10);
        assert_eq!(config.defaults.home, PathBuf::from("~/.shipyard"));
        let (backend, options) = config.publishers.get("debian").unwrap().backend().unwrap();
        assert_eq!(backend, "local-deb-s3");
        assert!(options.is_empty());
    }

    #[test]
    fn repos_get_their_names() {
        let config = parse(
            r#"
[repos.internal]
bucket = "apt-internal"
region = "eu-west-1"
gpg_id = "ABCD1234"
"#,
        );
        let repo = config.repo("internal").unwrap();
        assert_eq!(repo.name, "internal");
        assert_eq!(repo.bucket, "apt-internal");
        assert_eq!(repo.region.as_deref(), Some("eu-west-1"));
    }

    #[test]
    fn publisher_table_with_options() {
        let config = parse(
            r#"
[publishers.debian.tansit]
endpoint = "https://tansit.internal:8080/rpc"
"#,
        );
        let (backend, options) = config.publishers.get("debian").unwrap().backend().unwrap();
        assert_eq!(backend, "tansit");
        assert_eq!(
            options.get("endpoint").and_then(toml::Value::as_str),
            Some("https://tansit.internal:8080/rpc")
        );
    }

    #[test]
    fn publisher_table_with_two_backends_is_ambiguous() {
        let config = parse(
            r#"
[publishers.debian]
tansit = { endpoint = "x" }
local-deb-s3 = {}
"#,
        );
        assert!(config.publishers.get("debian").unwrap().backend().is_none());
    }

    #[test]
    fn invalid_toml_is_parse_error() {
        let err = Config::from_str_at("[defaults\n", Path::new("bad.toml")).unwrap_err();
        assert!(err.to_string().contains("bad.toml"));
    }

    #[test]
    fn explicit_path_is_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[defaults]\nhome = \"/srv/shipyard\"\ncopy_workers = 4\n").unwrap();
        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.home().unwrap(), PathBuf::from("/srv/shipyard"));
        assert_eq!(config.defaults.copy_workers, 4);
    }

    #[test]
    fn explicit_missing_path_is_read_error() {
        let err = Config::load(Some(Path::new("/nonexistent/shipyard.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
