//! `PodFs`: a read-only filesystem rooted at a remote directory.
//!
//! Every operation is one remote tool invocation; nothing is cached. A
//! mounted pod is a debugging surface, not a hot path, and the shell channel
//! offers no invalidation signal to build a coherent cache on.

use std::io::{self, Read};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{PodFsError, PodFsResult};
use crate::executor::{Executor, RemoteStream};
use crate::stat::{FileKind, StatRecord, STAT_FORMAT};

/// One directory entry, attributes taken from a `stat` of the entry itself.
#[derive(Clone, Debug)]
pub struct DirEntry {
    pub name: String,
    pub ino: u64,
    pub raw_mode: u32,
}

impl DirEntry {
    pub fn kind(&self) -> PodFsResult<FileKind> {
        FileKind::from_mode(self.raw_mode).ok_or_else(|| {
            PodFsError::MalformedStat(format!("unknown file type in mode {:x}", self.raw_mode))
        })
    }

    pub fn is_dir(&self) -> bool {
        matches!(FileKind::from_mode(self.raw_mode), Some(FileKind::Directory))
    }
}

/// Handle on a remote directory. Cheap to clone; `sub` re-roots without any
/// network traffic and the original stays valid.
#[derive(Clone)]
pub struct PodFs {
    executor: Arc<dyn Executor>,
    pwd: String,
}

impl PodFs {
    pub fn new(executor: Arc<dyn Executor>, pwd: impl Into<String>) -> PodFs {
        PodFs {
            executor,
            pwd: pwd.into(),
        }
    }

    /// Absolute remote directory this handle is rooted at.
    pub fn pwd(&self) -> &str {
        &self.pwd
    }

    /// Re-roots at a subdirectory. Pure path algebra; never fails.
    pub fn sub(&self, dir: &str) -> PodFs {
        PodFs {
            executor: Arc::clone(&self.executor),
            pwd: join(&self.pwd, dir),
        }
    }

    /// Remote attributes of `name`, resolved relative to `pwd`. The remote
    /// `stat` reports symlinks themselves; `read_link` exposes the target.
    pub fn stat(&self, cancel: &CancellationToken, name: &str) -> PodFsResult<StatRecord> {
        let path = join(&self.pwd, name);
        debug!(target: "podmount::fs", %path, "stat");
        let output = self
            .executor
            .run(
                cancel,
                &[
                    "stat".to_string(),
                    "--format".to_string(),
                    STAT_FORMAT.to_string(),
                    path,
                ],
            )
            .map_err(PodFsError::from_exec)?;
        StatRecord::parse(&output)
    }

    /// Lists `name` in remote `ls -A` order.
    pub fn read_dir(&self, cancel: &CancellationToken, name: &str) -> PodFsResult<Vec<DirEntry>> {
        let record = self.stat(cancel, name)?;
        if !record.is_dir() {
            return Err(PodFsError::NotADirectory);
        }

        let path = join(&self.pwd, name);
        debug!(target: "podmount::fs", %path, "read_dir");
        let output = self
            .executor
            .run(cancel, &["ls".to_string(), "-A".to_string(), path])
            .map_err(PodFsError::from_exec)?;

        // `ls` terminates the listing with a newline, so the final split
        // element is empty; an empty directory is a bare newline or nothing.
        let listing = String::from_utf8_lossy(&output);
        let trimmed = listing.strip_suffix('\n').unwrap_or(&listing);
        let names: Vec<&str> = if trimmed.is_empty() {
            Vec::new()
        } else {
            trimmed.split('\n').collect()
        };

        let subdir = self.sub(name);
        let mut entries = Vec::with_capacity(names.len());
        for entry_name in names {
            let record = subdir.stat(cancel, entry_name)?;
            entries.push(DirEntry {
                name: entry_name.to_string(),
                ino: record.ino,
                raw_mode: record.raw_mode,
            });
        }
        Ok(entries)
    }

    /// Target of the symlink `name`, trailing newline trimmed. No cycle
    /// detection; the kernel is the resolver.
    pub fn read_link(&self, cancel: &CancellationToken, name: &str) -> PodFsResult<String> {
        let path = join(&self.pwd, name);
        debug!(target: "podmount::fs", %path, "read_link");
        let output = self
            .executor
            .run(cancel, &["readlink".to_string(), path])
            .map_err(PodFsError::from_exec)?;
        let target = String::from_utf8_lossy(&output);
        Ok(target.strip_suffix('\n').unwrap_or(&target).to_string())
    }

    /// Opens `name` for streaming reads via remote `cat`.
    pub fn open(&self, cancel: &CancellationToken, name: &str) -> PodFsResult<PodFile> {
        let path = join(&self.pwd, name);
        debug!(target: "podmount::fs", %path, "open");
        let stream = self
            .executor
            .run_read(cancel, &["cat".to_string(), path])
            .map_err(PodFsError::from_exec)?;
        Ok(PodFile {
            name: name.to_string(),
            fsys: self.clone(),
            stream: Some(stream),
        })
    }
}

/// POSIX-style join relative to an absolute base. `""` and `"."` keep the
/// base; everything else appends one component group.
fn join(base: &str, name: &str) -> String {
    if name.is_empty() || name == "." {
        return base.to_string();
    }
    let name = name.strip_prefix("./").unwrap_or(name);
    format!("{}/{}", base.trim_end_matches('/'), name)
}

/// An open remote file backed by one streaming `cat` session.
///
/// The stream is non-seekable and exclusively owned; `close` releases the
/// remote session and a second close is a no-op.
pub struct PodFile {
    name: String,
    fsys: PodFs,
    stream: Option<Box<dyn RemoteStream>>,
}

impl PodFile {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Fresh attributes for this file; nothing is cached at open time.
    pub fn stat(&self, cancel: &CancellationToken) -> PodFsResult<StatRecord> {
        self.fsys.stat(cancel, &self.name)
    }

    pub fn close(&mut self) -> PodFsResult<()> {
        match self.stream.take() {
            Some(mut stream) => stream.close().map_err(PodFsError::from_exec),
            None => Ok(()),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.stream.is_none()
    }
}

impl Read for PodFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.stream.as_mut() {
            Some(stream) => stream.read(buf),
            None => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "file is closed",
            )),
        }
    }
}

impl Drop for PodFile {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ExecError, PodFsError};
    use crate::executor::ExecResult;
    use std::collections::HashMap;
    use std::io::Cursor;
    use std::sync::Mutex;

    /// Scripted executor: maps a full argv to canned stdout, everything else
    /// fails like a missing path would.
    #[derive(Default)]
    struct FakeExecutor {
        responses: HashMap<Vec<String>, Vec<u8>>,
        calls: Mutex<Vec<Vec<String>>>,
    }

    impl FakeExecutor {
        fn with(mut self, argv: &[&str], output: &[u8]) -> Self {
            self.responses.insert(
                argv.iter().map(|s| s.to_string()).collect(),
                output.to_vec(),
            );
            self
        }

        fn calls(&self) -> Vec<Vec<String>> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl Executor for FakeExecutor {
        fn run(&self, _cancel: &CancellationToken, argv: &[String]) -> ExecResult<Vec<u8>> {
            self.calls.lock().unwrap().push(argv.to_vec());
            match self.responses.get(argv) {
                Some(output) => Ok(output.clone()),
                None => Err(ExecError::Command {
                    stderr: format!(
                        "{}: cannot access '{}': No such file or directory\n",
                        argv[0],
                        argv.last().unwrap()
                    )
                    .into_bytes(),
                    exit_code: 1,
                }),
            }
        }

        fn run_read(
            &self,
            cancel: &CancellationToken,
            argv: &[String],
        ) -> ExecResult<Box<dyn RemoteStream>> {
            let content = self.run(cancel, argv)?;
            Ok(Box::new(FakeStream {
                content: Cursor::new(content),
                closed: false,
            }))
        }
    }

    struct FakeStream {
        content: Cursor<Vec<u8>>,
        closed: bool,
    }

    impl Read for FakeStream {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.content.read(buf)
        }
    }

    impl RemoteStream for FakeStream {
        fn close(&mut self) -> ExecResult<()> {
            self.closed = true;
            Ok(())
        }
    }

    fn stat_argv(path: &str) -> Vec<&str> {
        vec!["stat", "--format", STAT_FORMAT, path]
    }

    fn stat_line(name: &str, ino: u64, size: i64, mode: u32) -> Vec<u8> {
        format!("{name}\t{ino}\t{size}\t512\t8\t{mode:x}\t1700000000\t1690000000\t1690000001\t0\t0\n")
            .into_bytes()
    }

    fn etc_fs(executor: FakeExecutor) -> PodFs {
        PodFs::new(Arc::new(executor), "/etc")
    }

    #[test]
    fn sub_is_pure_path_algebra() {
        let fs = etc_fs(FakeExecutor::default());
        let nested = fs.sub("nginx").sub("conf.d");
        assert_eq!(nested.pwd(), "/etc/nginx/conf.d");
        assert_eq!(fs.pwd(), "/etc");
        assert_eq!(fs.sub(".").pwd(), "/etc");
        assert_eq!(PodFs::new(Arc::new(FakeExecutor::default()), "/").sub("etc").pwd(), "/etc");
    }

    #[test]
    fn stat_parses_remote_record() {
        let executor = FakeExecutor::default().with(
            &stat_argv("/etc/hostname"),
            &stat_line("/etc/hostname", 131845, 6, 0x81A4),
        );
        let fs = etc_fs(executor);
        let rec = fs.stat(&CancellationToken::new(), "hostname").unwrap();
        assert_eq!(rec.ino, 131845);
        assert_eq!(rec.size, 6);
        assert_eq!(rec.kind().unwrap(), FileKind::Regular);
    }

    #[test]
    fn stat_missing_path_is_not_found() {
        let fs = etc_fs(FakeExecutor::default());
        let err = fs.stat(&CancellationToken::new(), "nope").unwrap_err();
        assert!(matches!(err, PodFsError::NotFound));
    }

    #[test]
    fn read_dir_preserves_ls_order() {
        let executor = FakeExecutor::default()
            .with(&stat_argv("/etc"), &stat_line("/etc", 2, 4096, 0x41ED))
            .with(
                &["ls", "-A", "/etc"],
                b"hostname\nhosts\nresolv.conf\n",
            )
            .with(
                &stat_argv("/etc/hostname"),
                &stat_line("/etc/hostname", 10, 6, 0x81A4),
            )
            .with(
                &stat_argv("/etc/hosts"),
                &stat_line("/etc/hosts", 11, 170, 0x81A4),
            )
            .with(
                &stat_argv("/etc/resolv.conf"),
                &stat_line("/etc/resolv.conf", 12, 40, 0xA1FF),
            );
        let fs = etc_fs(executor);
        let entries = fs.read_dir(&CancellationToken::new(), ".").unwrap();
        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, ["hostname", "hosts", "resolv.conf"]);
        assert_eq!(entries[0].ino, 10);
        assert_eq!(entries[2].kind().unwrap(), FileKind::Symlink);
    }

    #[test]
    fn read_dir_of_empty_directory_is_empty() {
        let executor = FakeExecutor::default()
            .with(&stat_argv("/etc/empty"), &stat_line("/etc/empty", 20, 4096, 0x41ED))
            .with(&["ls", "-A", "/etc/empty"], b"\n");
        let fs = etc_fs(executor);
        let entries = fs.read_dir(&CancellationToken::new(), "empty").unwrap();
        assert!(entries.is_empty());
    }

    #[test]
    fn read_dir_of_file_fails_not_a_directory() {
        let executor = FakeExecutor::default().with(
            &stat_argv("/etc/hostname"),
            &stat_line("/etc/hostname", 10, 6, 0x81A4),
        );
        let fs = etc_fs(executor);
        let err = fs.read_dir(&CancellationToken::new(), "hostname").unwrap_err();
        assert!(matches!(err, PodFsError::NotADirectory));
    }

    #[test]
    fn read_dir_via_sub_matches_read_dir_of_name() {
        let seed = |executor: FakeExecutor| {
            executor
                .with(&stat_argv("/etc/nginx"), &stat_line("/etc/nginx", 30, 4096, 0x41ED))
                .with(&["ls", "-A", "/etc/nginx"], b"nginx.conf\n")
                .with(
                    &stat_argv("/etc/nginx/nginx.conf"),
                    &stat_line("/etc/nginx/nginx.conf", 31, 1024, 0x81A4),
                )
        };
        let cancel = CancellationToken::new();

        let from_parent = etc_fs(seed(FakeExecutor::default()))
            .read_dir(&cancel, "nginx")
            .unwrap();
        let from_sub = etc_fs(seed(FakeExecutor::default()))
            .sub("nginx")
            .read_dir(&cancel, ".")
            .unwrap();

        let names = |entries: &[DirEntry]| {
            entries.iter().map(|e| e.name.clone()).collect::<Vec<_>>()
        };
        assert_eq!(names(&from_parent), names(&from_sub));
    }

    #[test]
    fn read_link_trims_trailing_newline() {
        let executor = FakeExecutor::default().with(
            &["readlink", "/etc/resolv.conf"],
            b"../run/systemd/resolve/stub-resolv.conf\n",
        );
        let fs = etc_fs(executor);
        let target = fs.read_link(&CancellationToken::new(), "resolv.conf").unwrap();
        assert_eq!(target, "../run/systemd/resolve/stub-resolv.conf");
    }

    #[test]
    fn open_reads_streamed_content() {
        let executor = FakeExecutor::default().with(&["cat", "/etc/hostname"], b"nginx\n");
        let fs = etc_fs(executor);
        let mut file = fs.open(&CancellationToken::new(), "hostname").unwrap();
        let mut content = String::new();
        file.read_to_string(&mut content).unwrap();
        assert_eq!(content, "nginx\n");
    }

    #[test]
    fn open_zero_byte_file_reads_eof() {
        let executor = FakeExecutor::default().with(&["cat", "/etc/empty"], b"");
        let fs = etc_fs(executor);
        let mut file = fs.open(&CancellationToken::new(), "empty").unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(file.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn close_twice_is_a_no_op() {
        let executor = FakeExecutor::default().with(&["cat", "/etc/hostname"], b"nginx\n");
        let fs = etc_fs(executor);
        let mut file = fs.open(&CancellationToken::new(), "hostname").unwrap();
        file.close().unwrap();
        file.close().unwrap();
        assert!(file.is_closed());
        let mut buf = [0u8; 4];
        assert!(file.read(&mut buf).is_err());
    }

    #[test]
    fn file_stat_is_lazy_and_uncached() {
        let executor = FakeExecutor::default()
            .with(&["cat", "/etc/hostname"], b"nginx\n")
            .with(
                &stat_argv("/etc/hostname"),
                &stat_line("/etc/hostname", 10, 6, 0x81A4),
            );
        let fs = etc_fs(executor);
        let cancel = CancellationToken::new();
        let file = fs.open(&cancel, "hostname").unwrap();
        assert_eq!(file.stat(&cancel).unwrap().size, 6);
        assert_eq!(file.stat(&cancel).unwrap().size, 6);
    }

    #[test]
    fn permission_denied_surfaces_from_stderr() {
        struct DeniedExecutor;
        impl Executor for DeniedExecutor {
            fn run(&self, _: &CancellationToken, argv: &[String]) -> ExecResult<Vec<u8>> {
                Err(ExecError::Command {
                    stderr: format!("stat: cannot statx '{}': Permission denied\n", argv[3])
                        .into_bytes(),
                    exit_code: 1,
                })
            }
            fn run_read(
                &self,
                _: &CancellationToken,
                _: &[String],
            ) -> ExecResult<Box<dyn RemoteStream>> {
                unreachable!()
            }
        }
        let fs = PodFs::new(Arc::new(DeniedExecutor), "/root");
        let err = fs.stat(&CancellationToken::new(), "secret").unwrap_err();
        assert!(matches!(err, PodFsError::PermissionDenied));
    }

    #[test]
    fn stat_argv_shape_matches_remote_contract() {
        let executor = Arc::new(FakeExecutor::default().with(
            &stat_argv("/etc/hostname"),
            &stat_line("/etc/hostname", 10, 6, 0x81A4),
        ));
        let fs = PodFs::new(executor.clone(), "/etc");
        fs.stat(&CancellationToken::new(), "hostname").unwrap();
        assert_eq!(
            executor.calls(),
            vec![vec![
                "stat".to_string(),
                "--format".to_string(),
                STAT_FORMAT.to_string(),
                "/etc/hostname".to_string(),
            ]]
        );
    }
}
