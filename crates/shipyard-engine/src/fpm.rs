//! Building `.deb` artifacts with `fpm`.

use std::path::{Path, PathBuf};
use std::process::Command;

use shipyard_util::process::run_streaming;

use crate::error::{io_err, EngineError};
use crate::repo_manifest::COMMIT_FIELD;

/// Maintainer scripts picked up from `shipyard/packages/<name>/`, with their fpm flags.
pub const LIFECYCLE_SCRIPTS: &[(&str, &str)] = &[
    ("preinst", "--pre-install"),
    ("postinst", "--post-install"),
    ("prerm", "--pre-uninstall"),
    ("postrm", "--post-uninstall"),
];

/// Builder for an `fpm` invocation packaging a staged directory.
#[derive(Debug, Clone, Default)]
pub struct FpmCommand {
    name: String,
    version: String,
    architecture: String,
    output: Option<PathBuf>,
    staging_dir: Option<PathBuf>,
    entries: Vec<String>,
    description: Option<String>,
    commit_id: Option<String>,
    depends: Vec<String>,
    conflicts: Vec<String>,
    replaces: Vec<String>,
    activates: Vec<String>,
    interests: Vec<String>,
    scripts: Vec<(String, PathBuf)>,
}

impl FpmCommand {
    pub fn new(name: &str, version: &str, architecture: &str) -> Self {
        Self {
            name: name.to_owned(),
            version: version.to_owned(),
            architecture: architecture.to_owned(),
            ..Self::default()
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// Path of the `.deb` to write.
    pub fn output(mut self, path: &Path) -> Self {
        self.output = Some(path.to_path_buf());
        self
    }

    pub fn output_path(&self) -> Option<&Path> {
        self.output.as_deref()
    }

    /// Directory whose content becomes the package's filesystem root.
    pub fn staging_dir(mut self, dir: &Path) -> Self {
        self.staging_dir = Some(dir.to_path_buf());
        self
    }

    /// Top-level entries of the staging directory to include.
    pub fn entries(mut self, entries: Vec<String>) -> Self {
        self.entries = entries;
        self
    }

    pub fn description(mut self, description: Option<&str>) -> Self {
        self.description = description.map(str::to_owned);
        self
    }

    /// Record the source commit as a control field.
    pub fn commit_id(mut self, commit: &str) -> Self {
        self.commit_id = Some(commit.to_owned());
        self
    }

    pub fn depends(mut self, items: &[String]) -> Self {
        self.depends = items.to_vec();
        self
    }

    pub fn conflicts(mut self, items: &[String]) -> Self {
        self.conflicts = items.to_vec();
        self
    }

    pub fn replaces(mut self, items: &[String]) -> Self {
        self.replaces = items.to_vec();
        self
    }

    /// dpkg triggers activated on install.
    pub fn activates(mut self, items: &[String]) -> Self {
        self.activates = items.to_vec();
        self
    }

    /// dpkg triggers the package is interested in.
    pub fn interests(mut self, items: &[String]) -> Self {
        self.interests = items.to_vec();
        self
    }

    /// Attach every maintainer script present in `dir`.
    pub fn lifecycle_scripts_from(mut self, dir: &Path) -> Self {
        for (file, flag) in LIFECYCLE_SCRIPTS {
            let path = dir.join(file);
            if path.is_file() {
                self.scripts.push(((*flag).to_owned(), path));
            }
        }
        self
    }

    /// Build the argument list without executing.
    ///
    /// # Errors
    /// Returns [`EngineError::InvalidPackage`] if the output path or staging
    /// directory is not set.
    pub fn build_args(&self) -> Result<Vec<String>, EngineError> {
        let invalid = |message: &str| EngineError::InvalidPackage {
            package: self.name.clone(),
            message: message.to_owned(),
        };
        let Some(output) = &self.output else {
            return Err(invalid("no output path for the artifact"));
        };
        let Some(staging) = &self.staging_dir else {
            return Err(invalid("no staging directory to package"));
        };

        let mut args = Vec::new();
        for dep in &self.depends {
            args.push("-d".to_owned());
            args.push(dep.clone());
        }
        for item in &self.conflicts {
            args.push("--conflicts".to_owned());
            args.push(item.clone());
        }
        for item in &self.replaces {
            args.push("--replaces".to_owned());
            args.push(item.clone());
        }
        for (flag, path) in &self.scripts {
            args.push(flag.clone());
            args.push(path.display().to_string());
        }
        for trigger in &self.activates {
            args.push("--deb-activate".to_owned());
            args.push(trigger.clone());
        }
        for trigger in &self.interests {
            args.push("--deb-interest".to_owned());
            args.push(trigger.clone());
        }
        if let Some(description) = &self.description {
            args.push("--description".to_owned());
            args.push(description.clone());
        }

        args.push("-C".to_owned());
        args.push(staging.display().to_string());
        if let Some(commit) = &self.commit_id {
            args.push("--deb-field".to_owned());
            args.push(format!("{COMMIT_FIELD}: {commit}"));
        }
        args.extend(
            [
                "-t",
                "deb",
                "-s",
                "dir",
                "--architecture",
                self.architecture.as_str(),
                "-n",
                self.name.as_str(),
                "-p",
            ]
            .map(str::to_owned),
        );
        args.push(output.display().to_string());
        args.push("-v".to_owned());
        args.push(self.version.clone());

        if self.entries.is_empty() {
            args.push(".".to_owned());
        } else {
            args.extend(self.entries.iter().cloned());
        }
        Ok(args)
    }
}

/// Sorted names of the top-level entries of `dir`.
///
/// # Errors
/// Returns an error if the directory cannot be read.
pub fn top_level_entries(dir: &Path) -> Result<Vec<String>, EngineError> {
    let mut names = Vec::new();
    for entry in std::fs::read_dir(dir).map_err(io_err(dir))? {
        let entry = entry.map_err(io_err(dir))?;
        names.push(entry.file_name().to_string_lossy().into_owned());
    }
    names.sort();
    Ok(names)
}

/// Turns a staged directory into a package artifact.
pub trait PackagingTool: Send + Sync {
    /// # Errors
    /// Returns [`EngineError::PackagingFailed`] if the tool exits unsuccessfully.
    fn package(&self, command: &FpmCommand) -> Result<(), EngineError>;
}

/// Runs the `fpm` binary.
#[derive(Debug, Clone)]
pub struct FpmCli {
    binary: String,
}

impl FpmCli {
    pub fn new() -> Self {
        Self {
            binary: "fpm".to_owned(),
        }
    }

    pub fn with_binary(binary: &str) -> Self {
        Self {
            binary: binary.to_owned(),
        }
    }
}

impl Default for FpmCli {
    fn default() -> Self {
        Self::new()
    }
}

impl PackagingTool for FpmCli {
    fn package(&self, command: &FpmCommand) -> Result<(), EngineError> {
        let args = command.build_args()?;
        log::info!("packaging {} {}", command.name(), command.version());
        log::debug!("{} {}", self.binary, args.join(" "));
        let prefix = command.name().to_owned();
        let status = run_streaming(
            Command::new(&self.binary).args(&args),
            &mut |line| log::info!("[fpm {prefix}] {line}"),
        )?;
        if status == Some(0) {
            Ok(())
        } else {
            Err(EngineError::PackagingFailed {
                package: command.name().to_owned(),
                status,
            })
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::os::unix::fs::PermissionsExt;

    use super::*;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| (*s).to_owned()).collect()
    }

    #[test]
    fn argument_order() {
        let args = FpmCommand::new("api-server", "1.0", "amd64")
            .output(Path::new("/pkgs/api-server-1.0.deb"))
            .staging_dir(Path::new("/stage"))
            .depends(&strings(&["libssl3"]))
            .conflicts(&strings(&["api-legacy"]))
            .activates(&strings(&["ldconfig"]))
            .commit_id("abc123")
            .entries(strings(&["etc", "usr"]))
            .build_args()
            .unwrap();
        assert_eq!(
            args,
            strings(&[
                "-d",
                "libssl3",
                "--conflicts",
                "api-legacy",
                "--deb-activate",
                "ldconfig",
                "-C",
                "/stage",
                "--deb-field",
                "Git-Commit-Id: abc123",
                "-t",
                "deb",
                "-s",
                "dir",
                "--architecture",
                "amd64",
                "-n",
                "api-server",
                "-p",
                "/pkgs/api-server-1.0.deb",
                "-v",
                "1.0",
                "etc",
                "usr",
            ])
        );
    }

    #[test]
    fn missing_output_is_rejected() {
        let err = FpmCommand::new("api", "1", "all")
            .staging_dir(Path::new("/stage"))
            .build_args()
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidPackage { .. }));
    }

    #[test]
    fn empty_staging_packages_the_directory_itself() {
        let args = FpmCommand::new("meta", "1", "all")
            .output(Path::new("/p/meta.deb"))
            .staging_dir(Path::new("/stage"))
            .build_args()
            .unwrap();
        assert_eq!(args.last().map(String::as_str), Some("."));
    }

    #[test]
    fn picks_up_present_lifecycle_scripts() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("postinst"), "#!/bin/sh\n").unwrap();
        std::fs::write(dir.path().join("prerm"), "#!/bin/sh\n").unwrap();
        let args = FpmCommand::new("api", "1", "amd64")
            .output(Path::new("/p/api.deb"))
            .staging_dir(Path::new("/stage"))
            .lifecycle_scripts_from(dir.path())
            .build_args()
            .unwrap();
        assert!(args.contains(&"--post-install".to_owned()));
        assert!(args.contains(&"--pre-uninstall".to_owned()));
        assert!(!args.contains(&"--pre-install".to_owned()));
    }

    #[test]
    fn entries_are_sorted() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("usr")).unwrap();
        std::fs::create_dir(dir.path().join("etc")).unwrap();
        assert_eq!(top_level_entries(dir.path()).unwrap(), strings(&["etc", "usr"]));
    }

    #[test]
    fn failing_tool_reports_status() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("fake-fpm");
        std::fs::write(&script, "#!/bin/sh\necho packaging\nexit 3\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let tool = FpmCli::with_binary(&script.display().to_string());
        let command = FpmCommand::new("api", "1", "amd64")
            .output(&dir.path().join("api.deb"))
            .staging_dir(dir.path());
        let err = tool.package(&command).unwrap_err();
        assert!(matches!(err, EngineError::PackagingFailed { status: Some(3), .. }));
    }
}
