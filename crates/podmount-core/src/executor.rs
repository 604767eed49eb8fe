//! The seam between the filesystem model and the exec channel.

use std::io::Read;

use tokio_util::sync::CancellationToken;

use crate::error::ExecError;

pub type ExecResult<T> = Result<T, ExecError>;

/// Runs single commands inside the target container.
///
/// Each call opens its own exec session; implementations hold no mutable
/// state between calls and are safe to invoke from many threads. Calls block
/// until the remote process exits (`run`) or until the stream is established
/// (`run_read`).
pub trait Executor: Send + Sync {
    /// Spawns `argv` with stdin disabled and stdout/stderr captured. Returns
    /// stdout on exit 0, [`ExecError::Command`] on non-zero exit and
    /// [`ExecError::Transport`] on channel failure. No retries.
    fn run(&self, cancel: &CancellationToken, argv: &[String]) -> ExecResult<Vec<u8>>;

    /// Spawns `argv` with stdin enabled and stdout streamed incrementally.
    /// Errors observed mid-stream surface on the next read.
    fn run_read(
        &self,
        cancel: &CancellationToken,
        argv: &[String],
    ) -> ExecResult<Box<dyn RemoteStream>>;
}

/// Streaming stdout of one running remote command.
///
/// `close` must interrupt the remote process (the channel has no out-of-band
/// signal, so the interrupt character goes down stdin), drain whatever stdout
/// is still in flight so the sender is never blocked, and tear the session
/// down. Closing twice is a no-op.
pub trait RemoteStream: Read + Send {
    fn close(&mut self) -> ExecResult<()>;
}
