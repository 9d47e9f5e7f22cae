//! Error types for shipyard-config.

/// Errors produced while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("invalid configuration at {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },

    /// None of the candidate locations held a configuration file.
    #[error("no shipyard configuration found; looked in {}", .searched.join(", "))]
    NotFound { searched: Vec<String> },

    #[error("{0}")]
    Util(#[from] shipyard_util::error::UtilError),
}
