//! Error types for shipyard-util.

/// Errors produced by utility functions.
#[derive(Debug, thiserror::Error)]
pub enum UtilError {
    /// An I/O operation failed.
    #[error("cannot access {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    /// A path rule could not be compiled into a glob pattern.
    #[error("invalid path rule `{pattern}`: {message}")]
    GlobPattern { pattern: String, message: String },

    /// A command could not be spawned.
    #[error("cannot execute `{program}`: {source}")]
    CommandExec {
        program: String,
        source: std::io::Error,
    },

    /// A command ran but exited unsuccessfully.
    #[error("`{program}` exited with {}{}", status_text(.code), stderr_suffix(.stderr))]
    CommandFailed {
        program: String,
        code: Option<i32>,
        stderr: String,
    },

    /// Cannot determine the user's home directory.
    #[error("cannot determine home directory; set the HOME environment variable")]
    NoHomeDir,
}

fn status_text(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("status {code}"),
        None => "a signal".to_owned(),
    }
}

fn stderr_suffix(stderr: &str) -> String {
    let trimmed = stderr.trim();
    if trimmed.is_empty() {
        String::new()
    } else {
        format!(": {trimmed}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_failed_includes_code_and_stderr() {
        let err = UtilError::CommandFailed {
            program: "deb-s3".to_owned(),
            code: Some(2),
            stderr: "bucket not found\n".to_owned(),
        };
        assert_eq!(
            err.to_string(),
            "`deb-s3` exited with status 2: bucket not found"
        );
    }

    #[test]
    fn command_failed_by_signal_without_stderr() {
        let err = UtilError::CommandFailed {
            program: "git".to_owned(),
            code: None,
            stderr: "  ".to_owned(),
        };
        assert_eq!(err.to_string(), "`git` exited with a signal");
    }
}
