//! Build-dependency image manifests.
//!
//! Only the manifest's hash matters to the image cache; the text itself is
//! whatever the selected strategy produces for the job.

use std::path::{Path, PathBuf};

use shipyard_config::{BuildDepend, JobConfig};
use shipyard_util::fs::ensure_dir;
use shipyard_util::hash::sha256_bytes;

use crate::error::{io_err, EngineError};

/// File name of the generated manifest.
pub const MANIFEST_FILE: &str = "Dockerfile";

/// Where the job `Makefile` is copied inside the image for dependency installation.
const DEP_MAKEFILE_DIR: &str = "/tmp/shipyard/build_deps/";
const MAKEFILE_NAME: &str = "Makefile";

/// How the build-dependency image is produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManifestStrategy {
    /// Apt keys, repositories and packages only.
    Apt,
    /// Apt setup followed by `make <target>` from the job's `Makefile`.
    MakeDependency { target: String },
}

impl ManifestStrategy {
    pub fn for_job(job: &JobConfig) -> Self {
        match &job.build_depends_target {
            Some(target) if !target.is_empty() => Self::MakeDependency {
                target: target.clone(),
            },
            _ => Self::Apt,
        }
    }
}

/// A manifest directory ready for the image build tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildManifest {
    pub dir: PathBuf,
    /// Hex SHA-256 over everything that determines the image.
    pub hash: String,
}

/// Write the manifest for `job` into `out_dir`.
///
/// The manifest file is only rewritten when its content changed.
///
/// # Errors
/// Returns an error if the directory cannot be written or, for
/// [`ManifestStrategy::MakeDependency`], the job `Makefile` cannot be read.
pub fn generate(job: &JobConfig, source_path: &Path, out_dir: &Path) -> Result<BuildManifest, EngineError> {
    ensure_dir(out_dir)?;
    let strategy = ManifestStrategy::for_job(job);

    let mut text = apt_manifest(job);
    let mut hashed = text.clone();

    if let ManifestStrategy::MakeDependency { target } = &strategy {
        let makefile = source_path.join(&job.start_in).join(MAKEFILE_NAME);
        let content = std::fs::read(&makefile).map_err(io_err(&makefile))?;
        write_if_changed(&out_dir.join(MAKEFILE_NAME), &content)?;

        let copy = serde_json::json!([MAKEFILE_NAME, DEP_MAKEFILE_DIR]);
        text.push_str(&format!("COPY {copy}\n"));
        text.push_str(&format!("RUN cd '{DEP_MAKEFILE_DIR}' && make '{target}'\n"));

        hashed = text.clone();
        hashed.push_str(&String::from_utf8_lossy(&content));
    }

    let changed = write_if_changed(&out_dir.join(MANIFEST_FILE), text.as_bytes())?;
    if changed {
        log::debug!("wrote build manifest in {}", out_dir.display());
    }
    Ok(BuildManifest {
        dir: out_dir.to_path_buf(),
        hash: sha256_bytes(hashed.as_bytes()),
    })
}

/// The apt part of every manifest.
fn apt_manifest(job: &JobConfig) -> String {
    let mut text = format!("FROM {}\n", job.base);
    text.push_str("ENV DEBIAN_FRONTEND noninteractive\n");

    let mut commands: Vec<String> = Vec::new();
    for key in &job.apt_keys {
        commands.push(format!("curl '{key}' | apt-key add -"));
    }
    for repo in &job.apt_repos {
        if repo.contains("ppa:") {
            commands.push(format!("add-apt-repository -y \"{repo}\""));
        } else {
            commands.push(format!(
                "echo '{repo}' | tee -a /etc/apt/sources.list.d/{}.list",
                apt_list_name(repo)
            ));
        }
    }
    commands.extend(install_commands(&job.build_depends));

    if !commands.is_empty() {
        text.push_str(&format!("RUN {}\n", commands.join(" && ")));
    }
    text
}

fn install_commands(depends: &[BuildDepend]) -> Vec<String> {
    if depends.is_empty() {
        return Vec::new();
    }
    let mut commands = Vec::new();
    for depend in depends {
        if let BuildDepend::WithSelections { name, selections } = depend {
            for selection in selections {
                commands.push(format!("echo '{name} {selection}' | debconf-set-selections"));
            }
        }
    }
    let names: Vec<String> = depends.iter().map(|d| format!("'{}'", d.name())).collect();
    commands.push("apt-get update -qq".to_owned());
    commands.push(format!("apt-get install -qy {}", names.join(" ")));
    commands
}

/// `deb http://host/path suite main` becomes `host-suite-main`.
fn apt_list_name(repo: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    let mut found = false;
    for word in repo.split_whitespace() {
        if found {
            parts.push(word);
        } else if let Some(host) = url_host(word) {
            found = true;
            parts.push(host);
        }
    }
    parts.join("-")
}

fn url_host(word: &str) -> Option<&str> {
    let (_, rest) = word.split_once("://")?;
    let host = rest.split('/').next()?;
    (!host.is_empty()).then_some(host)
}

fn write_if_changed(path: &Path, content: &[u8]) -> Result<bool, EngineError> {
    if std::fs::read(path).is_ok_and(|current| current == content) {
        return Ok(false);
    }
    std::fs::write(path, content).map_err(io_err(path))?;
    Ok(true)
}
