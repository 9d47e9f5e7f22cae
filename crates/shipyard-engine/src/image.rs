//! Image Cache: reuse an image when its `repository:tag` exists, build it otherwise.
//!
//! Tags embed a hash of the build manifest, so a manifest change is a cache miss.

use std::path::Path;

use shipyard_docker::{ContainerRuntime, ImageBuilder, ImageSummary};

use crate::error::EngineError;

/// An image identity and, when it exists locally, its runtime id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    pub repository: String,
    pub tag: String,
    /// `None` means the image does not exist and must be built.
    pub id: Option<String>,
}

impl Image {
    pub fn missing(repository: &str, tag: &str) -> Self {
        Self {
            repository: repository.to_owned(),
            tag: tag.to_owned(),
            id: None,
        }
    }

    pub fn found(repository: &str, tag: &str, id: String) -> Self {
        Self {
            repository: repository.to_owned(),
            tag: tag.to_owned(),
            id: Some(id),
        }
    }

    pub fn exists(&self) -> bool {
        self.id.as_deref().is_some_and(|id| !id.is_empty())
    }

    /// `repository:tag`, or just the repository for an untagged image.
    pub fn reference(&self) -> String {
        if self.tag.is_empty() {
            self.repository.clone()
        } else {
            format!("{}:{}", self.repository, self.tag)
        }
    }

    /// What to hand the runtime when creating a container: the id when known.
    pub fn run_reference(&self) -> String {
        self.id.clone().unwrap_or_else(|| self.reference())
    }
}

/// Resolves images and remembers outdated tags of the same repository for pruning.
pub struct ImageCache<'r> {
    runtime: &'r dyn ContainerRuntime,
    builder: &'r dyn ImageBuilder,
    stale: Vec<ImageSummary>,
}

impl<'r> ImageCache<'r> {
    pub fn new(runtime: &'r dyn ContainerRuntime, builder: &'r dyn ImageBuilder) -> Self {
        Self {
            runtime,
            builder,
            stale: Vec::new(),
        }
    }

    /// Look up `repository:tag`.
    ///
    /// On a miss every other tagged image of the repository is recorded as stale.
    ///
    /// # Errors
    /// Returns an error if the runtime cannot list images.
    pub fn resolve(&mut self, repository: &str, tag: &str) -> Result<Image, EngineError> {
        let images = self.runtime.images(repository)?;
        if let Some(hit) = images.iter().find(|i| i.tag == tag) {
            return Ok(Image::found(repository, tag, hit.id.clone()));
        }
        for image in images {
            if image.tag == "<none>" || self.stale.iter().any(|s| s.id == image.id) {
                continue;
            }
            log::debug!("{}:{} is stale", image.repository, image.tag);
            self.stale.push(image);
        }
        Ok(Image::missing(repository, tag))
    }

    /// Resolve `repository:tag`, building it from `manifest_dir` on a miss.
    ///
    /// After a build, stale images are pruned; a failed removal is only logged.
    ///
    /// # Errors
    /// Returns the build tool's error untouched if the build fails.
    pub fn ensure(&mut self, repository: &str, tag: &str, manifest_dir: &Path) -> Result<Image, EngineError> {
        let image = self.resolve(repository, tag)?;
        if image.exists() {
            log::info!("reusing image {}", image.reference());
            return Ok(image);
        }

        let reference = image.reference();
        log::info!("creating image {reference}");
        let prefix = repository.to_owned();
        self.builder
            .build(manifest_dir, &reference, &mut |line| log::info!("[{prefix}] {line}"))
            .inspect_err(|_| log::error!("failed creating image {reference}"))?;

        let image = self.resolve(repository, tag)?;
        if !image.exists() {
            return Err(EngineError::ImageMissing { reference });
        }
        self.prune_stale();
        Ok(image)
    }

    /// Images recorded as stale and not yet removed.
    pub fn stale(&self) -> &[ImageSummary] {
        &self.stale
    }

    /// Remove every recorded stale image, best effort.
    pub fn prune_stale(&mut self) {
        for image in self.stale.drain(..) {
            match self.runtime.remove_image(&image.id) {
                Ok(()) => log::info!("removed stale image {}:{}", image.repository, image.tag),
                Err(e) => log::warn!(
                    "couldn't delete image {}:{} ({}): {e}",
                    image.repository,
                    image.tag,
                    image.id
                ),
            }
        }
    }
}

/// Turn a branch name into something usable as an image tag.
pub fn sanitise_tag(name: &str) -> String {
    let tag: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect();
    let tag = tag.trim_start_matches(['.', '-']);
    if tag.is_empty() {
        "latest".to_owned()
    } else {
        tag.to_owned()
    }
}

/// Tag of a build-dependency image: the branch plus a short manifest hash.
pub fn tag_with_hash(branch: &str, manifest_hash: &str) -> String {
    format!(
        "{}-{}",
        sanitise_tag(branch),
        shipyard_util::hash::short(manifest_hash, 12)
    )
}

/// `<project>.<job>.<stage>`, lower-cased.
pub fn repository_name(project: &str, job: &str, stage: &str) -> String {
    format!("{project}.{job}.{stage}").to_lowercase()
}
