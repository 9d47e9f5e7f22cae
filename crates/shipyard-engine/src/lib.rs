//! Container builds, diff extraction, image caching, package promotion and
//! publishing for Shipyard.

pub mod build;
pub mod container;
pub mod dist;
pub mod dockerfile;
pub mod error;
pub mod fpm;
pub mod image;
pub mod package;
pub mod project;
pub mod promote;
pub mod publisher;
pub mod repo_manifest;
pub mod scripts;
pub mod source;
pub mod volumes;

pub use container::{with_container, Container, ContainerState};
pub use dist::{build, dist, DistOptions, DistOutcome, JobRun, ReleaseSummary, Services};
pub use error::EngineError;
pub use fpm::{FpmCli, FpmCommand, PackagingTool};
pub use image::{Image, ImageCache};
pub use package::Packager;
pub use project::Project;
pub use promote::{BuildReason, PackageManager, PromotionDecision};
pub use publisher::{ConfiguredPublishers, Publisher, PublisherProvider};
pub use repo_manifest::{ManifestCache, RepoManifest};
pub use source::{ChangeDetector, CommitFlags, GitSource};
