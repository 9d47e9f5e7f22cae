//! Publishing through a local `deb-s3` installation.
//!
//! Mutating calls are serialised across orchestrator processes with an
//! exclusive lock on `<home>/deb-s3.lock`.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use fs2::FileExt;

use shipyard_config::RepoConfig;
use shipyard_util::process::run_command;

use super::{BackendContext, Channel, ManifestRecord, PackageRef, Publisher, DEFAULT_CACHE_CONTROL};
use crate::error::{io_err, EngineError};

pub const BACKEND: &str = "local-deb-s3";

/// File name of the publish lock inside the orchestrator home.
pub const LOCK_FILE: &str = "deb-s3.lock";

const S3_HOST: &str = "s3.amazonaws.com";

pub struct LocalDebS3 {
    program: String,
    lock_path: PathBuf,
}

/// Registry entry. Accepts an optional `command` naming the `deb-s3` binary.
///
/// # Errors
/// Never fails; the signature is shared by every backend.
pub fn from_context(ctx: &BackendContext<'_>) -> Result<Arc<dyn Publisher>, EngineError> {
    let mut publisher = LocalDebS3::new(ctx.home);
    if let Some(program) = ctx.options.get("command").and_then(toml::Value::as_str) {
        publisher.program = program.to_owned();
    }
    Ok(Arc::new(publisher))
}

impl LocalDebS3 {
    pub fn new(home: &Path) -> Self {
        Self {
            program: "deb-s3".to_owned(),
            lock_path: home.join(LOCK_FILE),
        }
    }

    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    /// Block until the publish lock is held.
    fn lock(&self) -> Result<PublishLock, EngineError> {
        let file = File::create(&self.lock_path).map_err(io_err(&self.lock_path))?;
        log::info!("trying to acquire deb-s3 lock...");
        file.lock_exclusive().map_err(io_err(&self.lock_path))?;
        log::info!("lock acquired");
        Ok(PublishLock { file })
    }

    fn run(&self, args: &[String]) -> Result<String, EngineError> {
        let output = run_command(Command::new(&self.program).args(args))?;
        if output.success {
            Ok(output.stdout)
        } else {
            Err(EngineError::Publish {
                backend: BACKEND.to_owned(),
                message: format!(
                    "`{} {}` exited with {}: {}",
                    self.program,
                    args.first().map_or("", String::as_str),
                    output.exit_code.map_or_else(|| "a signal".to_owned(), |c| format!("status {c}")),
                    output.stderr.trim()
                ),
            })
        }
    }
}

/// Held while a mutating `deb-s3` command runs; released on drop.
struct PublishLock {
    file: File,
}

impl Drop for PublishLock {
    fn drop(&mut self) {
        log::info!("releasing deb-s3 lock");
        if let Err(e) = FileExt::unlock(&self.file) {
            log::warn!("failed to release deb-s3 lock: {e}");
        }
    }
}

impl Publisher for LocalDebS3 {
    fn backend(&self) -> &str {
        BACKEND
    }

    fn list(
        &self,
        repo: &RepoConfig,
        codename: &str,
        component: &str,
        arch: &str,
    ) -> Result<Vec<ManifestRecord>, EngineError> {
        let args = list_args(repo, codename, component, arch);
        Ok(parse_long_list(&self.run(&args)?))
    }

    fn copy(
        &self,
        repo: &RepoConfig,
        package: &PackageRef<'_>,
        from: Channel<'_>,
        to: Channel<'_>,
        versions: &[String],
    ) -> Result<(), EngineError> {
        let args = copy_args(repo, package, from, to, versions);
        let _lock = self.lock()?;
        self.run(&args).map(drop)
    }

    fn upload(&self, repo: &RepoConfig, package: &PackageRef<'_>, to: Channel<'_>) -> Result<(), EngineError> {
        let args = upload_args(repo, package, to);
        let _lock = self.lock()?;
        self.run(&args).map(drop)
    }
}

/// S3 endpoint for a bucket region.
pub fn s3_host(region: Option<&str>) -> String {
    match region {
        Some(region) if !region.is_empty() && region != "us-east-1" => {
            format!("s3.{region}.amazonaws.com")
        }
        _ => S3_HOST.to_owned(),
    }
}

fn repo_args(repo: &RepoConfig, sign: bool) -> Vec<String> {
    let mut args = vec![
        format!("--bucket={}", repo.bucket),
        format!("--endpoint={}", s3_host(repo.region.as_deref())),
    ];
    if sign {
        if let Some(gpg_id) = &repo.gpg_id {
            args.push(format!("--sign={gpg_id}"));
        }
    }
    args
}

pub fn list_args(repo: &RepoConfig, codename: &str, component: &str, arch: &str) -> Vec<String> {
    let mut args = vec!["list".to_owned()];
    args.extend(repo_args(repo, false));
    args.push("--long".to_owned());
    args.push(format!("--codename={codename}"));
    args.push(format!("--component={component}"));
    args.push(format!("--arch={arch}"));
    args
}

pub fn copy_args(
    repo: &RepoConfig,
    package: &PackageRef<'_>,
    from: Channel<'_>,
    to: Channel<'_>,
    versions: &[String],
) -> Vec<String> {
    let mut args = vec![
        "copy".to_owned(),
        package.name.to_owned(),
        to.codename.to_owned(),
        to.component.to_owned(),
    ];
    args.extend(repo_args(repo, true));
    args.push("--preserve-versions".to_owned());
    args.push(format!("--versions={}", versions.join(" ")));
    args.push(format!("--arch={}", package.architecture));
    args.push(format!("--codename={}", from.codename));
    args.push(format!("--component={}", from.component));
    args.push(format!("--cache-control={DEFAULT_CACHE_CONTROL}"));
    args
}

pub fn upload_args(repo: &RepoConfig, package: &PackageRef<'_>, to: Channel<'_>) -> Vec<String> {
    let mut args = vec!["upload".to_owned(), package.file.display().to_string()];
    args.extend(repo_args(repo, true));
    args.push("--preserve-versions".to_owned());
    args.push(format!("--codename={}", to.codename));
    args.push(format!("--component={}", to.component));
    args.push(format!("--cache-control={DEFAULT_CACHE_CONTROL}"));
    args
}

/// Parse `deb-s3 list --long`: blank-line separated paragraphs of `Key: Value` lines.
pub fn parse_long_list(text: &str) -> Vec<ManifestRecord> {
    text.split("\n\n")
        .map(|paragraph| {
            paragraph
                .lines()
                .filter_map(|line| {
                    let (key, value) = line.split_once(": ")?;
                    let valid = !key.is_empty()
                        && !key.chars().any(char::is_whitespace)
                        && value.chars().next().is_some_and(|c| !c.is_whitespace());
                    valid.then(|| (key.to_owned(), value.to_owned()))
                })
                .collect::<ManifestRecord>()
        })
        .filter(|record| !record.is_empty())
        .collect()
}
