//! Process execution helpers for Shipyard.

use std::io::{BufRead, BufReader, Read};
use std::process::{Command, Stdio};
use std::sync::mpsc;

use crate::error::UtilError;

/// Structured output from a command execution.
#[derive(Debug)]
pub struct CommandOutput {
    /// Standard output as a string.
    pub stdout: String,
    /// Standard error as a string.
    pub stderr: String,
    /// Whether the command exited successfully.
    pub success: bool,
    /// The exit code, if the process was not killed by a signal.
    pub exit_code: Option<i32>,
}

impl CommandOutput {
    /// Turn an unsuccessful run into [`UtilError::CommandFailed`].
    ///
    /// # Errors
    /// Returns an error if the command did not exit successfully.
    pub fn require_success(self, program: &str) -> Result<Self, UtilError> {
        if self.success {
            Ok(self)
        } else {
            Err(UtilError::CommandFailed {
                program: program.to_owned(),
                code: self.exit_code,
                stderr: self.stderr,
            })
        }
    }
}

fn program_name(cmd: &Command) -> String {
    cmd.get_program().to_string_lossy().into_owned()
}

/// Execute a command and capture its output.
///
/// # Errors
/// Returns an error if the command cannot be spawned (e.g. binary not found).
/// A non-zero exit code is **not** an error; check `CommandOutput::success` instead.
pub fn run_command(cmd: &mut Command) -> Result<CommandOutput, UtilError> {
    log::debug!("running {cmd:?}");
    let output = cmd.output().map_err(|source| UtilError::CommandExec {
        program: program_name(cmd),
        source,
    })?;

    Ok(CommandOutput {
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        success: output.status.success(),
        exit_code: output.status.code(),
    })
}

/// Execute a command, requiring success, and return its trimmed stdout.
///
/// # Errors
/// Returns an error if the command cannot be spawned or exits unsuccessfully.
pub fn run_checked(cmd: &mut Command) -> Result<String, UtilError> {
    let program = program_name(cmd);
    let output = run_command(cmd)?.require_success(&program)?;
    Ok(output.stdout.trim().to_owned())
}

/// Execute a command, handing every line of its combined stdout and stderr
/// to `sink` as soon as it is produced.
///
/// Returns the exit code (`None` if killed by a signal).
///
/// # Errors
/// Returns an error if the command cannot be spawned or waited on.
pub fn run_streaming(
    cmd: &mut Command,
    sink: &mut dyn FnMut(&str),
) -> Result<Option<i32>, UtilError> {
    log::debug!("streaming {cmd:?}");
    let program = program_name(cmd);
    let exec_err = |source| UtilError::CommandExec {
        program: program.clone(),
        source,
    };

    let mut child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(exec_err)?;

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let (tx, rx) = mpsc::channel::<String>();

    std::thread::scope(|scope| {
        if let Some(out) = stdout {
            let tx = tx.clone();
            scope.spawn(move || forward_lines(out, &tx));
        }
        if let Some(err) = stderr {
            let tx = tx.clone();
            scope.spawn(move || forward_lines(err, &tx));
        }
        // Only the reader threads hold senders now; the loop ends once both pipes close.
        drop(tx);
        for line in rx {
            sink(&line);
        }
    });

    let status = child.wait().map_err(exec_err)?;
    Ok(status.code())
}

fn forward_lines<R: Read>(reader: R, tx: &mpsc::Sender<String>) {
    for line in BufReader::new(reader).lines() {
        let Ok(line) = line else {
            break;
        };
        if tx.send(line).is_err() {
            break;
        }
    }
}
