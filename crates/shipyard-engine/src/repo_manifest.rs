//! Which package versions a release repository holds for which commits.

use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};

use shipyard_config::RepoConfig;

use crate::error::EngineError;
use crate::publisher::{ManifestRecord, Publisher};

/// Control field linking a published version to its source commit.
pub const COMMIT_FIELD: &str = "Git-Commit-Id";

/// Index of one `codename/component/arch` listing of a repository.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepoManifest {
    versions: BTreeMap<(String, String), String>,
}

impl RepoManifest {
    /// Records without a package name, version or commit id are ignored.
    pub fn from_records(records: &[ManifestRecord]) -> Self {
        let versions = records
            .iter()
            .filter_map(|record| {
                let package = record.get("Package")?;
                let version = record.get("Version")?;
                let commit = record.get(COMMIT_FIELD)?;
                Some(((package.clone(), commit.clone()), version.clone()))
            })
            .collect();
        Self { versions }
    }

    /// Version of `package` built from `commit`, if one is published.
    pub fn version(&self, package: &str, commit: &str) -> Option<&str> {
        self.versions
            .get(&(package.to_owned(), commit.to_owned()))
            .map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }
}

type ManifestKey = (String, String, String, String, String);

/// Listings fetched during one run, keyed by backend, repo, codename,
/// component and architecture. A listing is fetched once and kept for the
/// rest of the run.
#[derive(Debug, Default)]
pub struct ManifestCache {
    manifests: HashMap<ManifestKey, RepoManifest>,
}

impl ManifestCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// The manifest for a channel, listing it through `publisher` on first use.
    ///
    /// # Errors
    /// Returns the publisher's error if the listing fails.
    pub fn manifest(
        &mut self,
        publisher: &dyn Publisher,
        repo: &RepoConfig,
        codename: &str,
        component: &str,
        arch: &str,
    ) -> Result<&RepoManifest, EngineError> {
        let key = (
            publisher.backend().to_owned(),
            repo.name.clone(),
            codename.to_owned(),
            component.to_owned(),
            arch.to_owned(),
        );
        match self.manifests.entry(key) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                log::debug!("listing {}/{codename}/{component} ({arch})", repo.name);
                let records = publisher.list(repo, codename, component, arch)?;
                Ok(entry.insert(RepoManifest::from_records(&records)))
            }
        }
    }
}

/// Version of `package` built from `commit` in `repo`, or `None`.
///
/// # Errors
/// Returns the publisher's error if the listing fails.
pub fn published_version(
    cache: &mut ManifestCache,
    publisher: &dyn Publisher,
    repo: &RepoConfig,
    channel: (&str, &str),
    arch: &str,
    package: &str,
    commit: &str,
) -> Result<Option<String>, EngineError> {
    let (codename, component) = channel;
    let manifest = cache.manifest(publisher, repo, codename, component, arch)?;
    Ok(manifest
        .version(package, commit)
        .filter(|v| !v.is_empty())
        .map(str::to_owned))
}
