//! Read-only filesystem model over a remote pod exec channel.
//!
//! The crate owns everything between the exec channel and the FUSE adapter:
//! the [`Executor`] seam a channel implementation plugs into, the parser that
//! rebuilds Linux stat attributes from `stat --format` output, and [`PodFs`],
//! which translates filesystem operations into remote invocations of `stat`,
//! `ls`, `cat` and `readlink`.

pub mod error;
pub mod executor;
pub mod fs;
pub mod stat;

pub use error::{ExecError, PodFsError, PodFsResult};
pub use executor::{ExecResult, Executor, RemoteStream};
pub use fs::{DirEntry, PodFile, PodFs};
pub use stat::{FileKind, StatRecord, STAT_FORMAT};
