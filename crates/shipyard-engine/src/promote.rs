//! Promote-or-build decisions.
//!
//! A package built from the current commit may already sit in another
//! codename of its repositories. When every listing agrees on its version
//! it is copied into the current codename instead of being rebuilt.

use crate::error::EngineError;
use crate::package::{Packager, COMPONENT};
use crate::publisher::{Channel, PackageRef, Publisher};
use crate::repo_manifest::{published_version, ManifestCache};

/// Why a package has to be built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildReason {
    /// The current codename is not part of the package's promotion chain.
    NotInPromotionChain,
    /// No other codename of the chain holds a build of this commit.
    NotPublished,
    /// Listings disagree on the version built from this commit.
    InconsistentVersions,
}

/// Outcome of [`PackageManager::decide`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromotionDecision {
    /// Every repository already has this commit under the current codename.
    AlreadyPublished,
    /// Copy `version` from `from_codename` into the current codename.
    Promoted { from_codename: String, version: String },
    Build(BuildReason),
}

impl PromotionDecision {
    pub fn needs_build(&self) -> bool {
        matches!(self, Self::Build(_))
    }
}

/// Decides and performs promotions for one commit and target codename.
#[derive(Debug)]
pub struct PackageManager {
    commit: String,
    codename: String,
    manifests: ManifestCache,
}

impl PackageManager {
    pub fn new(commit: &str, codename: &str) -> Self {
        Self {
            commit: commit.to_owned(),
            codename: codename.to_owned(),
            manifests: ManifestCache::new(),
        }
    }

    pub fn codename(&self) -> &str {
        &self.codename
    }

    fn version_in(
        &mut self,
        publisher: &dyn Publisher,
        packager: &Packager<'_>,
        repo_index: usize,
        codename: &str,
    ) -> Result<Option<String>, EngineError> {
        let Some(repo) = packager.repos().get(repo_index) else {
            return Ok(None);
        };
        published_version(
            &mut self.manifests,
            publisher,
            repo,
            (codename, COMPONENT),
            packager.architecture(),
            packager.name(),
            &self.commit,
        )
    }

    /// Work out what to do with `packager` without changing any repository.
    ///
    /// # Errors
    /// Returns an error if a repository listing cannot be fetched.
    pub fn decide(&mut self, publisher: &dyn Publisher, packager: &Packager<'_>) -> Result<PromotionDecision, EngineError> {
        let repo_count = packager.repos().len();
        let current = self.codename.clone();

        let mut published_everywhere = true;
        for index in 0..repo_count {
            if self.version_in(publisher, packager, index, &current)?.is_none() {
                published_everywhere = false;
                break;
            }
        }
        if published_everywhere {
            return Ok(PromotionDecision::AlreadyPublished);
        }

        let chain = packager.promote_through();
        if !chain.iter().any(|c| *c == current) {
            return Ok(PromotionDecision::Build(BuildReason::NotInPromotionChain));
        }

        let mut hits: Vec<(String, String)> = Vec::new();
        for candidate in chain.iter().filter(|c| **c != current) {
            for index in 0..repo_count {
                if let Some(version) = self.version_in(publisher, packager, index, candidate)? {
                    hits.push((candidate.clone(), version));
                }
            }
        }

        let Some((from_codename, version)) = hits.first().cloned() else {
            return Ok(PromotionDecision::Build(BuildReason::NotPublished));
        };
        if hits.iter().any(|(_, v)| *v != version) {
            log::warn!(
                "{} has inconsistent versions for commit {} across repositories, rebuilding",
                packager.name(),
                self.commit
            );
            return Ok(PromotionDecision::Build(BuildReason::InconsistentVersions));
        }
        Ok(PromotionDecision::Promoted {
            from_codename,
            version,
        })
    }

    /// Decide for `packager` and carry out a promotion if one is possible.
    ///
    /// # Errors
    /// Returns an error if a listing or a copy fails.
    pub fn promote(&mut self, publisher: &dyn Publisher, packager: &Packager<'_>) -> Result<PromotionDecision, EngineError> {
        let decision = self.decide(publisher, packager)?;
        match &decision {
            PromotionDecision::AlreadyPublished => {
                log::info!("{} is already published in {}", packager.name(), self.codename);
            }
            PromotionDecision::Promoted {
                from_codename,
                version,
            } => {
                let package = PackageRef {
                    name: packager.name(),
                    architecture: packager.architecture(),
                    file: std::path::Path::new(""),
                };
                let versions = [version.clone()];
                for repo in packager.repos() {
                    log::info!(
                        "promoting {} {version} from {from_codename} to {} in {}",
                        packager.name(),
                        self.codename,
                        repo.name
                    );
                    publisher.copy(
                        repo,
                        &package,
                        Channel::new(from_codename, COMPONENT),
                        Channel::new(&self.codename, COMPONENT),
                        &versions,
                    )?;
                }
            }
            PromotionDecision::Build(reason) => {
                log::debug!("{} needs a build: {reason:?}", packager.name());
            }
        }
        Ok(decision)
    }
}
