//! Error types shared across the podmount crates.

/// Failure of one remote command execution.
#[derive(thiserror::Error, Debug)]
pub enum ExecError {
    /// The remote process ran and exited non-zero; `stderr` holds its
    /// diagnostic output.
    #[error("remote command error: {}", String::from_utf8_lossy(.stderr).trim_end())]
    Command { stderr: Vec<u8>, exit_code: i32 },

    /// The exec channel itself failed (connection, authentication, protocol).
    #[error("exec transport error: {0}")]
    Transport(String),

    /// The operation was cancelled before completion.
    #[error("operation cancelled")]
    Cancelled,
}

/// Filesystem-level error. The FUSE adapter is the sole place these are
/// mapped to errno values.
#[derive(thiserror::Error, Debug)]
pub enum PodFsError {
    #[error("no such file or directory")]
    NotFound,
    #[error("permission denied")]
    PermissionDenied,
    #[error("not a directory")]
    NotADirectory,
    #[error("unexpected stat output: {0}")]
    MalformedStat(String),
    #[error(transparent)]
    Exec(ExecError),
}

pub type PodFsResult<T> = Result<T, PodFsError>;

impl PodFsError {
    /// Classifies a remote command failure by its stderr diagnostic. `stat`,
    /// `ls`, `cat` and `readlink` all name the missing path followed by the
    /// strerror text, which is the only machine-visible signal the shell
    /// channel provides.
    pub fn from_exec(err: ExecError) -> PodFsError {
        if let ExecError::Command { stderr, .. } = &err {
            let text = String::from_utf8_lossy(stderr);
            if text.contains("No such file or directory") {
                return PodFsError::NotFound;
            }
            if text.contains("Permission denied") {
                return PodFsError::PermissionDenied;
            }
        }
        PodFsError::Exec(err)
    }
}
