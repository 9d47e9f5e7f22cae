//! Source checkout and change detection.

use std::path::{Path, PathBuf};
use std::process::Command;

use shipyard_config::SETTINGS_FILE;
use shipyard_util::fs::ensure_dir;
use shipyard_util::paths::PathSelection;
use shipyard_util::process::{run_checked, run_command};

use crate::error::EngineError;

/// The tree object of an empty repository, used when nothing was built yet.
const EMPTY_TREE_HASH: &str = "4b825dc642cb6eb9a060e54bf8d69288fbee4904";

/// What the orchestrator needs to know about the revision it is building.
pub trait ChangeDetector {
    /// Whether anything selected by `root`, `include` and `exclude` changed
    /// since the last successful build.
    ///
    /// # Errors
    /// Returns an error if a rule is not a valid pattern.
    fn has_changes(&self, root: &str, include: &[String], exclude: &[String]) -> Result<bool, EngineError>;

    /// Full id of the commit being built.
    fn current_commit_id(&self) -> &str;

    /// Commit of the last successful build, if one was recorded.
    fn last_build_succeeded(&self) -> Option<&str>;

    /// What the new commit messages ask for.
    fn commit_flags(&self) -> CommitFlags;

    /// Record the current commit as the last successful build.
    ///
    /// # Errors
    /// Returns an error if the marker cannot be written.
    fn tag_success(&self) -> Result<(), EngineError>;
}

/// Directives found in the summaries of the commits being built.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommitFlags {
    /// Number of commits since the last successful build.
    pub commits: usize,
    /// Every new commit says `[ci skip]`.
    pub skip_all: bool,
    /// Every new commit asks to skip tests.
    pub skip_tests: bool,
}

impl CommitFlags {
    /// Scan commit summaries. With no commits both flags hold.
    pub fn from_summaries(summaries: &[&str]) -> Self {
        Self {
            commits: summaries.len(),
            skip_all: summaries.iter().all(|s| asks_skip_all(s)),
            skip_tests: summaries.iter().all(|s| asks_skip_tests(s)),
        }
    }
}

/// `[ci skip]`, case-insensitive, not preceded by a backslash.
pub fn asks_skip_all(summary: &str) -> bool {
    has_directive(summary, &["[ci skip]"])
}

/// `[ci skip]` or `[ci skip tests]` with a space, `-` or `_` separator.
pub fn asks_skip_tests(summary: &str) -> bool {
    has_directive(
        summary,
        &["[ci skip]", "[ci skip tests]", "[ci skip-tests]", "[ci skip_tests]"],
    )
}

fn has_directive(summary: &str, directives: &[&str]) -> bool {
    let lower = summary.to_lowercase();
    directives.iter().any(|directive| {
        lower.match_indices(directive).any(|(at, _)| {
            let escaped = at > 0 && lower.as_bytes().get(at - 1) == Some(&b'\\');
            !escaped
        })
    })
}

/// Which paths changed since the last successful build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangedPaths {
    /// A fresh checkout: every path counts as changed.
    Everything,
    Paths(Vec<String>),
}

impl ChangedPaths {
    /// Whether the selection touches any changed path.
    ///
    /// A change to the settings file makes everything dirty.
    ///
    /// # Errors
    /// Returns an error if a rule is not a valid pattern.
    pub fn touches(&self, root: &str, include: &[String], exclude: &[String]) -> Result<bool, EngineError> {
        let paths = match self {
            Self::Everything => return Ok(true),
            Self::Paths(paths) => paths,
        };
        if paths.iter().any(|p| p == SETTINGS_FILE) {
            return Ok(true);
        }
        let selection = PathSelection::new(root, include, exclude)?;
        Ok(selection.selects_any(paths.iter().map(String::as_str)))
    }
}

/// A git checkout driven through the `git` command line.
#[derive(Debug)]
pub struct GitSource {
    path: PathBuf,
    branch: String,
    commit: String,
    last_success: Option<String>,
    changed: ChangedPaths,
    flags: CommitFlags,
}

impl GitSource {
    /// Clone `url` into `path`, or update an existing clone, and check out
    /// the tip of `origin/<branch>`.
    ///
    /// # Errors
    /// Returns an error if any git command fails.
    pub fn checkout(url: &str, path: &Path, branch: &str) -> Result<Self, EngineError> {
        let fresh = !path.join(".git").is_dir();
        if fresh {
            if let Some(parent) = path.parent() {
                ensure_dir(parent)?;
            }
            log::info!("cloning {url} into {}", path.display());
            run_checked(
                Command::new("git")
                    .args(["clone", "--recursive", "--branch", branch, url])
                    .arg(path),
            )?;
        } else {
            log::info!("updating {}", path.display());
            git(path, &["fetch", "origin"])?;
            git(path, &["checkout", "-B", branch, &format!("origin/{branch}")])?;
            git(path, &["reset", "--hard", &format!("origin/{branch}")])?;
            git(path, &["submodule", "update", "--init", "--recursive", "--force"])?;
        }

        let commit = git(path, &["rev-parse", "HEAD"])?;
        let tag = last_build_tag(branch);
        let last_success = tag_commit(path, &tag)?;
        let base = last_success.as_deref().unwrap_or(EMPTY_TREE_HASH);

        let changed = if fresh {
            ChangedPaths::Everything
        } else {
            let diff = git(path, &["diff", "--name-only", base, "HEAD"])?;
            ChangedPaths::Paths(diff.lines().map(str::to_owned).collect())
        };

        let range = match &last_success {
            Some(last) => format!("{last}..HEAD"),
            None => "HEAD".to_owned(),
        };
        let log = git(path, &["log", "--format=%s", &range])?;
        let summaries: Vec<&str> = log.lines().filter(|l| !l.is_empty()).collect();
        let flags = CommitFlags::from_summaries(&summaries);
        log::info!(
            "{} new commit(s) on {branch} since {}",
            flags.commits,
            last_success.as_deref().unwrap_or("the beginning")
        );

        Ok(Self {
            path: path.to_path_buf(),
            branch: branch.to_owned(),
            commit,
            last_success,
            changed,
            flags,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn changed(&self) -> &ChangedPaths {
        &self.changed
    }
}

impl ChangeDetector for GitSource {
    fn has_changes(&self, root: &str, include: &[String], exclude: &[String]) -> Result<bool, EngineError> {
        self.changed.touches(root, include, exclude)
    }

    fn current_commit_id(&self) -> &str {
        &self.commit
    }

    fn last_build_succeeded(&self) -> Option<&str> {
        self.last_success.as_deref()
    }

    fn commit_flags(&self) -> CommitFlags {
        self.flags
    }

    fn tag_success(&self) -> Result<(), EngineError> {
        let tag = last_build_tag(&self.branch);
        git(&self.path, &["tag", "--force", &tag, "HEAD"])?;
        log::info!("tagged {} as {tag}", self.commit);
        Ok(())
    }
}

/// Name of the tag marking the last successful build of `branch`.
pub fn last_build_tag(branch: &str) -> String {
    format!("shipyard.{branch}.last-successful-build")
}

fn git(path: &Path, args: &[&str]) -> Result<String, EngineError> {
    Ok(run_checked(Command::new("git").arg("-C").arg(path).args(args))?)
}

fn tag_commit(path: &Path, tag: &str) -> Result<Option<String>, EngineError> {
    let output = run_command(
        Command::new("git")
            .arg("-C")
            .arg(path)
            .args(["rev-parse", "--verify", "--quiet", &format!("refs/tags/{tag}^{{commit}}")]),
    )?;
    Ok(output
        .success
        .then(|| output.stdout.trim().to_owned())
        .filter(|c| !c.is_empty()))
}
