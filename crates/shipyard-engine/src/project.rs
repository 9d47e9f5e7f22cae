//! A project checkout on the orchestrator host and the paths derived from it.

use std::path::{Path, PathBuf};

use crate::error::EngineError;
use crate::image::repository_name;

/// One `(repository, branch, job)` the orchestrator works on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Project {
    /// Repository name derived from the SCM URL.
    pub name: String,
    /// URL handed to `git clone`.
    pub clone_url: String,
    pub branch: String,
    pub job: String,
    /// Orchestrator home directory (already expanded).
    pub home: PathBuf,
}

impl Project {
    /// # Errors
    /// Returns [`EngineError::UnsupportedScmPath`] if `scm_url` is not a git URL.
    pub fn new(scm_url: &str, home: &Path, branch: &str, job: &str) -> Result<Self, EngineError> {
        let (name, clone_url) = parse_scm_path(scm_url)?;
        Ok(Self {
            name,
            clone_url,
            branch: branch.to_owned(),
            job: job.to_owned(),
            home: home.to_path_buf(),
        })
    }

    /// `<home>/projects/<name>`
    pub fn dir(&self) -> PathBuf {
        self.home.join("projects").join(&self.name)
    }

    /// Where the branch is checked out for this job.
    pub fn source_path(&self) -> PathBuf {
        self.dir().join("src").join(&self.branch).join(&self.job)
    }

    /// Parent of this job's persisted volumes.
    pub fn shared_root(&self) -> PathBuf {
        self.dir().join("shared").join(&self.branch).join(&self.job)
    }

    /// Where built artifacts are written before upload.
    pub fn packages_dir(&self) -> PathBuf {
        self.dir().join("packages")
    }

    /// Staging directory of one package.
    pub fn package_work_dir(&self, package: &str) -> PathBuf {
        self.packages_dir().join(&self.branch).join(package)
    }

    /// Where the build-dependency manifest is generated.
    pub fn manifest_dir(&self) -> PathBuf {
        self.dir().join("image").join(&self.branch).join(&self.job)
    }

    /// Image repository for a stage (`build-deps` or `build`).
    pub fn image_name(&self, stage: &str) -> String {
        repository_name(&self.name, &self.job, stage)
    }
}

/// Split an SCM URL into the project name and the URL to clone.
///
/// Accepted forms: `git+<proto>://…/name(.git)`, `git://…/name(.git)` and
/// `git@github.com:user/name(.git)`.
///
/// # Errors
/// Returns [`EngineError::UnsupportedScmPath`] for anything else.
pub fn parse_scm_path(url: &str) -> Result<(String, String), EngineError> {
    let unsupported = || EngineError::UnsupportedScmPath {
        url: url.to_owned(),
    };

    if let Some(rest) = url.strip_prefix("git") {
        if let Some(after) = rest.strip_prefix("://") {
            let name = repo_name(after).ok_or_else(unsupported)?;
            return Ok((name, url.to_owned()));
        }
        if let Some(after_plus) = rest.strip_prefix('+') {
            if let Some((proto, path)) = after_plus.split_once("://") {
                let valid_proto = !proto.is_empty()
                    && proto.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
                if valid_proto {
                    let name = repo_name(path).ok_or_else(unsupported)?;
                    return Ok((name, format!("{proto}://{path}")));
                }
            }
        }
    }

    if let Some(path) = url.strip_prefix("git@github.com:") {
        if let Some((user, repo)) = path.split_once('/') {
            let repo = repo.strip_suffix(".git").unwrap_or(repo);
            if !user.is_empty() && !repo.is_empty() && !repo.contains('/') {
                return Ok((repo.to_owned(), url.to_owned()));
            }
        }
    }

    Err(unsupported())
}

fn repo_name(path: &str) -> Option<String> {
    let base = path.trim_end_matches('/').rsplit('/').next()?;
    let name = base.strip_suffix(".git").unwrap_or(base);
    (!name.is_empty()).then(|| name.to_owned())
}
