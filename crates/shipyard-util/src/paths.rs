//! Path rules used to decide whether a change touches a package.
//!
//! A rule ending in `/` is a literal directory prefix; any other rule is a
//! shell glob in which `*` also crosses `/`.

use glob::{MatchOptions, Pattern};

use crate::error::UtilError;

/// A compiled include or exclude rule.
#[derive(Debug, Clone)]
pub enum PathRule {
    /// Matches every path under this directory (the rule text ends in `/`).
    Prefix(String),
    /// Matches paths against a shell glob.
    Glob(Pattern),
}

impl PathRule {
    /// Compile a rule.
    ///
    /// # Errors
    /// Returns an error if a glob rule is not a valid pattern.
    pub fn parse(rule: &str) -> Result<Self, UtilError> {
        if rule.ends_with('/') {
            return Ok(Self::Prefix(rule.to_owned()));
        }
        Pattern::new(rule)
            .map(Self::Glob)
            .map_err(|e| UtilError::GlobPattern {
                pattern: rule.to_owned(),
                message: e.to_string(),
            })
    }

    /// Whether `path` (repository-relative, no leading `/`) falls under this rule.
    pub fn matches(&self, path: &str) -> bool {
        match self {
            Self::Prefix(prefix) => path.starts_with(prefix.as_str()),
            Self::Glob(pattern) => pattern.matches_with(path, FNMATCH),
        }
    }
}

const FNMATCH: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: false,
    require_literal_leading_dot: false,
};

/// A root directory plus include and exclude rules.
#[derive(Debug, Clone)]
pub struct PathSelection {
    root: PathRule,
    include: Vec<PathRule>,
    exclude: Vec<PathRule>,
}

impl PathSelection {
    /// Compile a selection. The root is always treated as a directory.
    ///
    /// # Errors
    /// Returns an error if any include or exclude rule is invalid.
    pub fn new(root: &str, include: &[String], exclude: &[String]) -> Result<Self, UtilError> {
        let root = if root.ends_with('/') || root.is_empty() {
            root.to_owned()
        } else {
            format!("{root}/")
        };
        Ok(Self {
            root: PathRule::Prefix(root),
            include: include
                .iter()
                .map(|r| PathRule::parse(r))
                .collect::<Result<_, _>>()?,
            exclude: exclude
                .iter()
                .map(|r| PathRule::parse(r))
                .collect::<Result<_, _>>()?,
        })
    }

    /// Whether `path` is selected: it is under the root or an include rule,
    /// and no exclude rule matches it.
    pub fn selects(&self, path: &str) -> bool {
        let included = self.root.matches(path) || self.include.iter().any(|r| r.matches(path));
        included && !self.exclude.iter().any(|r| r.matches(path))
    }

    /// Whether any of `paths` is selected.
    pub fn selects_any<'a, I>(&self, paths: I) -> bool
    where
        I: IntoIterator<Item = &'a str>,
    {
        paths.into_iter().any(|p| self.selects(p))
    }
}
