//! [`ContainerRuntime`] and [`ImageBuilder`] backed by the `docker` command line.

use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdout, Command, Stdio};

use shipyard_util::error::UtilError;
use shipyard_util::process::{run_checked, run_streaming};

use crate::error::DockerError;
use crate::runtime::{
    Change, ChangeKind, ContainerRuntime, ContainerSpec, ImageBuilder, ImageSummary,
};

/// Drives a local Docker daemon through its CLI.
#[derive(Debug, Clone)]
pub struct DockerCli {
    binary: String,
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new()
    }
}

impl DockerCli {
    pub fn new() -> Self {
        Self {
            binary: "docker".to_owned(),
        }
    }

    /// Use a different client binary (e.g. `podman`).
    pub fn with_binary(binary: &str) -> Self {
        Self {
            binary: binary.to_owned(),
        }
    }

    fn command(&self) -> Command {
        Command::new(&self.binary)
    }

    fn checked(&self, args: &[&str]) -> Result<String, DockerError> {
        Ok(run_checked(self.command().args(args))?)
    }

    fn create_args(spec: &ContainerSpec) -> Vec<String> {
        let mut args = vec!["create".to_owned()];
        if spec.privileged {
            args.push("--privileged".to_owned());
        }
        args.push("--user".to_owned());
        args.push(spec.user.clone());
        for (key, value) in &spec.env {
            args.push("-e".to_owned());
            args.push(format!("{key}={value}"));
        }
        for volume in &spec.volumes {
            args.push("-v".to_owned());
            args.push(volume.to_string());
        }
        args.push(spec.image.clone());
        args.extend(spec.command.iter().cloned());
        args
    }
}

impl ContainerRuntime for DockerCli {
    fn create(&self, spec: &ContainerSpec) -> Result<String, DockerError> {
        let output = run_checked(self.command().args(Self::create_args(spec)))?;
        // Pull progress may precede the id; the id is always the last line.
        output
            .lines()
            .last()
            .map(|id| id.trim().to_owned())
            .filter(|id| !id.is_empty())
            .ok_or_else(|| DockerError::Parse {
                subcommand: "create".to_owned(),
                message: "no container id printed".to_owned(),
            })
    }

    fn start(&self, id: &str) -> Result<(), DockerError> {
        self.checked(&["start", id]).map(drop)
    }

    fn follow_logs(&self, id: &str, sink: &mut dyn FnMut(&str)) -> Result<(), DockerError> {
        let program = self.binary.clone();
        let code = run_streaming(self.command().args(["logs", "--follow", id]), sink)?;
        match code {
            Some(0) => Ok(()),
            code => Err(UtilError::CommandFailed {
                program,
                code,
                stderr: String::new(),
            }
            .into()),
        }
    }

    fn stop(&self, id: &str) -> Result<(), DockerError> {
        self.checked(&["stop", id]).map(drop)
    }

    fn kill(&self, id: &str) -> Result<(), DockerError> {
        self.checked(&["kill", id]).map(drop)
    }

    fn exit_code(&self, id: &str) -> Result<i32, DockerError> {
        let text = self.checked(&["inspect", "--format", "{{.State.ExitCode}}", id])?;
        text.trim().parse().map_err(|_| DockerError::Parse {
            subcommand: "inspect".to_owned(),
            message: format!("exit code `{text}` is not a number"),
        })
    }

    fn remove(&self, id: &str) -> Result<(), DockerError> {
        self.checked(&["rm", "--force", id]).map(drop)
    }

    fn commit(&self, id: &str, repository: &str, tag: &str) -> Result<String, DockerError> {
        let reference = format!("{repository}:{tag}");
        self.checked(&["commit", id, &reference])
    }

    fn diff(&self, id: &str) -> Result<Vec<Change>, DockerError> {
        parse_diff(&self.checked(&["diff", id])?)
    }

    fn copy_out(&self, id: &str, path: &str) -> Result<Box<dyn Read + Send>, DockerError> {
        let source = format!("{id}:{path}");
        let mut cmd = self.command();
        cmd.args(["cp", &source, "-"]);
        log::debug!("streaming {cmd:?}");
        let mut child = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|source| UtilError::CommandExec {
                program: self.binary.clone(),
                source,
            })?;
        let Some(stdout) = child.stdout.take() else {
            return Err(DockerError::Parse {
                subcommand: "cp".to_owned(),
                message: "no output stream".to_owned(),
            });
        };
        Ok(Box::new(CopyStream {
            child,
            stdout,
            source,
            finished: false,
        }))
    }

    fn upper_dir(&self, id: &str) -> Result<Option<PathBuf>, DockerError> {
        let data = self.checked(&["inspect", "--format", "{{json .GraphDriver.Data}}", id])?;
        if let Some(dir) = parse_upper_dir(&data)? {
            return Ok(Some(dir));
        }
        let info = self.checked(&["info"])?;
        Ok(parse_root_dir(&info).map(|root| root.join("diff").join(id)))
    }

    fn images(&self, repository: &str) -> Result<Vec<ImageSummary>, DockerError> {
        let text = self.checked(&["images", "--format", "{{json .}}", repository])?;
        let images = parse_images(&text)?;
        Ok(images
            .into_iter()
            .filter(|image| image.repository == repository)
            .collect())
    }

    fn remove_image(&self, id: &str) -> Result<(), DockerError> {
        self.checked(&["rmi", id]).map(drop)
    }
}

impl ImageBuilder for DockerCli {
    fn build(
        &self,
        context_dir: &Path,
        repo_tag: &str,
        sink: &mut dyn FnMut(&str),
    ) -> Result<(), DockerError> {
        let mut cmd = self.command();
        cmd.arg("build")
            .arg("--rm")
            .arg("-t")
            .arg(repo_tag)
            .arg(context_dir);
        match run_streaming(&mut cmd, sink)? {
            Some(0) => Ok(()),
            status => Err(DockerError::BuildFailed {
                repo_tag: repo_tag.to_owned(),
                status,
            }),
        }
    }
}

/// Stdout of a running `docker cp`; a failed copy surfaces as a read error at EOF.
struct CopyStream {
    child: Child,
    stdout: ChildStdout,
    source: String,
    finished: bool,
}

impl Read for CopyStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.stdout.read(buf)?;
        if n == 0 && !buf.is_empty() && !self.finished {
            self.finished = true;
            let status = self.child.wait()?;
            if !status.success() {
                return Err(io::Error::other(format!(
                    "docker cp {} exited with {status}",
                    self.source
                )));
            }
        }
        Ok(n)
    }
}

impl Drop for CopyStream {
    fn drop(&mut self) {
        if !self.finished {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

/// Parse `docker diff` output (`A /path`, `C /path`, `D /path`).
///
/// # Errors
/// Returns an error on a line with an unknown change marker.
pub fn parse_diff(text: &str) -> Result<Vec<Change>, DockerError> {
    text.lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            let (marker, path) = line.split_once(' ').ok_or_else(|| bad_diff_line(line))?;
            let kind = match marker {
                "A" => ChangeKind::Added,
                "C" => ChangeKind::Modified,
                "D" => ChangeKind::Deleted,
                _ => return Err(bad_diff_line(line)),
            };
            Ok(Change::new(path, kind))
        })
        .collect()
}

fn bad_diff_line(line: &str) -> DockerError {
    DockerError::Parse {
        subcommand: "diff".to_owned(),
        message: format!("unexpected line `{line}`"),
    }
}

/// Extract `UpperDir` from the JSON of `.GraphDriver.Data`.
///
/// # Errors
/// Returns an error if the text is not JSON.
pub fn parse_upper_dir(json: &str) -> Result<Option<PathBuf>, DockerError> {
    let value: serde_json::Value =
        serde_json::from_str(json.trim()).map_err(|e| DockerError::Parse {
            subcommand: "inspect".to_owned(),
            message: e.to_string(),
        })?;
    Ok(value
        .get("UpperDir")
        .and_then(serde_json::Value::as_str)
        .filter(|dir| !dir.is_empty())
        .map(PathBuf::from))
}

/// The storage driver's `Root Dir` line from `docker info`, if it reports one.
pub fn parse_root_dir(info: &str) -> Option<PathBuf> {
    info.lines()
        .filter_map(|line| line.trim().split_once(':'))
        .find(|(key, _)| key.trim() == "Root Dir")
        .map(|(_, value)| PathBuf::from(value.trim()))
        .filter(|dir| !dir.as_os_str().is_empty())
}

#[derive(serde::Deserialize)]
struct ImageLine {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "Repository")]
    repository: String,
    #[serde(rename = "Tag")]
    tag: String,
}

/// Parse `docker images --format '{{json .}}'`, one object per line.
///
/// # Errors
/// Returns an error if a line is not an image object.
pub fn parse_images(text: &str) -> Result<Vec<ImageSummary>, DockerError> {
    text.lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            let image: ImageLine = serde_json::from_str(line).map_err(|e| DockerError::Parse {
                subcommand: "images".to_owned(),
                message: e.to_string(),
            })?;
            Ok(ImageSummary {
                id: image.id,
                repository: image.repository,
                tag: image.tag,
            })
        })
        .collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::runtime::VolumeBinding;

    #[test]
    fn diff_lines_map_to_kinds() {
        let changes = parse_diff("C /etc\nA /etc/app.conf\nD /var/cache/old\n").unwrap();
        assert_eq!(
            changes,
            vec![
                Change::new("/etc", ChangeKind::Modified),
                Change::new("/etc/app.conf", ChangeKind::Added),
                Change::new("/var/cache/old", ChangeKind::Deleted),
            ]
        );
    }

    #[test]
    fn diff_keeps_spaces_in_paths() {
        let changes = parse_diff("A /srv/my file.txt\n").unwrap();
        assert_eq!(changes[0].path, "/srv/my file.txt");
    }

    #[test]
    fn unknown_diff_marker_is_rejected() {
        let err = parse_diff("X /etc\n").unwrap_err();
        assert!(err.to_string().contains("X /etc"));
    }

    #[test]
    fn upper_dir_from_overlay_data() {
        let json = r#"{"LowerDir":"/var/lib/docker/overlay2/a/diff","MergedDir":"/m","UpperDir":"/var/lib/docker/overlay2/b/diff","WorkDir":"/w"}"#;
        assert_eq!(
            parse_upper_dir(json).unwrap(),
            Some(PathBuf::from("/var/lib/docker/overlay2/b/diff"))
        );
    }

    #[test]
    fn upper_dir_missing_for_other_drivers() {
        assert_eq!(parse_upper_dir("null").unwrap(), None);
        assert_eq!(parse_upper_dir("{}").unwrap(), None);
        assert!(parse_upper_dir("not json").is_err());
    }

    #[test]
    fn root_dir_from_info() {
        let info = "Server Version: 1.12\nStorage Driver: aufs\n Root Dir: /var/lib/docker/aufs\n Backing Filesystem: extfs\n";
        assert_eq!(parse_root_dir(info), Some(PathBuf::from("/var/lib/docker/aufs")));
        assert_eq!(parse_root_dir("Storage Driver: overlay2\n"), None);
    }

    #[test]
    fn images_parse_json_lines() {
        let text = concat!(
            r#"{"Containers":"N/A","ID":"sha256:abc","Repository":"web.api.build-deps","Tag":"master-0123456789ab"}"#,
            "\n",
            r#"{"ID":"sha256:def","Repository":"web.api.build-deps","Tag":"<none>"}"#,
            "\n"
        );
        let images = parse_images(text).unwrap();
        assert_eq!(images.len(), 2);
        assert_eq!(images[0].id, "sha256:abc");
        assert_eq!(images[0].tag, "master-0123456789ab");
    }

    #[test]
    fn create_args_render_spec() {
        let command = vec!["/bin/bash".to_owned(), "-c".to_owned(), "true".to_owned()];
        let spec = ContainerSpec::new("img:tag", command)
            .env(BTreeMap::from([("A".to_owned(), "1".to_owned())]))
            .volumes(vec![VolumeBinding::new("/host", "/scripts")]);
        let args = DockerCli::create_args(&spec);
        assert_eq!(
            args,
            vec![
                "create", "--privileged", "--user", "root", "-e", "A=1", "-v", "/host:/scripts",
                "img:tag", "/bin/bash", "-c", "true",
            ]
        );
    }

    #[test]
    fn unprivileged_spec_omits_flag() {
        let mut spec = ContainerSpec::new("img", Vec::new()).user("builder");
        spec.privileged = false;
        let args = DockerCli::create_args(&spec);
        assert!(!args.contains(&"--privileged".to_owned()));
        assert_eq!(args[1..3], ["--user".to_owned(), "builder".to_owned()]);
    }
}
