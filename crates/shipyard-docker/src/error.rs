//! Error types for shipyard-docker.

/// Errors produced at the container runtime boundary.
#[derive(Debug, thiserror::Error)]
pub enum DockerError {
    /// The runtime CLI could not be run or exited unsuccessfully.
    #[error("{0}")]
    Command(#[from] shipyard_util::error::UtilError),

    /// A volume binding is not of the form `host:container`.
    #[error("invalid volume binding \"{binding}\"; expected `host:container`")]
    InvalidBinding { binding: String },

    /// The runtime printed something we could not interpret.
    #[error("cannot parse `docker {subcommand}` output: {message}")]
    Parse { subcommand: String, message: String },

    /// The external image build exited unsuccessfully.
    #[error("building image {repo_tag} failed with status {}", .status.map_or_else(|| "unknown".to_owned(), |c| c.to_string()))]
    BuildFailed {
        repo_tag: String,
        status: Option<i32>,
    },
}
