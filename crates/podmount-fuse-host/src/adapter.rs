//! FUSE adapter: maps kernel VFS callbacks onto `PodFs` calls.
//!
//! This is the sole place podmount errors become errno values. Nodes are
//! addressed by the remote inode number; the kernel owns inode 1 for the
//! mount root, so any remote path reporting inode 1 is refused at lookup.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::io::{self, Read};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fuser::consts::FOPEN_NONSEEKABLE;
use fuser::{
    FileAttr, FileType, Filesystem, ReplyAttr, ReplyData, ReplyDirectory, ReplyEmpty, ReplyEntry,
    ReplyOpen, Request, FUSE_ROOT_ID,
};
use libc::{c_int, EACCES, EBADF, EINTR, EINVAL, EIO, EISDIR, ENOENT, ENOTDIR, EPERM};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use podmount_core::{ExecError, FileKind, PodFile, PodFs, PodFsError, StatRecord};

/// Attribute/entry validity handed to the kernel. Nothing is cached on our
/// side, so the kernel gets nothing to hold on to either.
const TTL: Duration = Duration::ZERO;

/// Scratch size for discarding stream bytes below the requested offset.
const SKIP_CHUNK: usize = 32 * 1024;

/// One kernel-visible node. A directory node's `fsys` is rooted at the
/// directory itself and `file` is empty; a leaf node shares the parent's
/// `fsys` and names the leaf.
struct Node {
    fsys: PodFs,
    file: String,
}

impl Node {
    fn is_dir(&self) -> bool {
        self.file.is_empty()
    }
}

#[derive(Debug)]
enum ReadFault {
    BackwardSeek,
    Io(io::Error),
}

/// An open file handle: the streaming reader plus how far into the stream
/// the kernel has read.
struct OpenFile {
    file: PodFile,
    consumed: u64,
}

impl OpenFile {
    fn new(file: PodFile) -> OpenFile {
        OpenFile { file, consumed: 0 }
    }

    /// Serves `read(offset, size)` from a non-seekable stream. The handle is
    /// opened `FOPEN_NONSEEKABLE`, so the kernel serializes reads and offsets
    /// never decrease; bytes between `consumed` and `offset` are discarded.
    fn read_at(&mut self, offset: u64, size: usize) -> Result<Vec<u8>, ReadFault> {
        if offset < self.consumed {
            return Err(ReadFault::BackwardSeek);
        }

        let mut skip = offset - self.consumed;
        let mut scratch = [0u8; SKIP_CHUNK];
        while skip > 0 {
            let want = skip.min(scratch.len() as u64) as usize;
            let n = self.file.read(&mut scratch[..want]).map_err(ReadFault::Io)?;
            if n == 0 {
                // Stream ended at or before the requested offset.
                return Ok(Vec::new());
            }
            self.consumed += n as u64;
            skip -= n as u64;
        }

        let mut data = vec![0u8; size];
        let mut filled = 0;
        while filled < size {
            let n = self.file.read(&mut data[filled..]).map_err(ReadFault::Io)?;
            if n == 0 {
                break;
            }
            filled += n;
            self.consumed += n as u64;
        }
        data.truncate(filled);
        Ok(data)
    }
}

pub struct PodMountFs {
    nodes: HashMap<u64, Node>,
    handles: HashMap<u64, OpenFile>,
    next_fh: u64,
    cancel: CancellationToken,
}

impl PodMountFs {
    pub fn new(root: PodFs, cancel: CancellationToken) -> PodMountFs {
        let mut nodes = HashMap::new();
        nodes.insert(
            FUSE_ROOT_ID,
            Node {
                fsys: root,
                file: String::new(),
            },
        );
        PodMountFs {
            nodes,
            handles: HashMap::new(),
            next_fh: 0,
            cancel,
        }
    }
}

fn errno_of(err: &PodFsError) -> c_int {
    match err {
        PodFsError::NotFound => ENOENT,
        PodFsError::PermissionDenied => EACCES,
        PodFsError::NotADirectory => ENOTDIR,
        PodFsError::MalformedStat(_) => EIO,
        PodFsError::Exec(ExecError::Cancelled) => EINTR,
        PodFsError::Exec(_) => EIO,
    }
}

fn kind_of(kind: FileKind) -> FileType {
    match kind {
        FileKind::Fifo => FileType::NamedPipe,
        FileKind::CharDev => FileType::CharDevice,
        FileKind::Directory => FileType::Directory,
        FileKind::BlockDev => FileType::BlockDevice,
        FileKind::Regular => FileType::RegularFile,
        FileKind::Symlink => FileType::Symlink,
        FileKind::Socket => FileType::Socket,
    }
}

fn timestamp(secs: i64) -> SystemTime {
    if secs >= 0 {
        UNIX_EPOCH + Duration::from_secs(secs as u64)
    } else {
        UNIX_EPOCH - Duration::from_secs(secs.unsigned_abs())
    }
}

fn attr_of(record: &StatRecord, kind: FileKind) -> FileAttr {
    FileAttr {
        ino: record.ino,
        size: record.size.max(0) as u64,
        blocks: record.blocks.max(0) as u64,
        atime: timestamp(record.atime),
        mtime: timestamp(record.mtime),
        ctime: timestamp(record.ctime),
        crtime: timestamp(record.ctime),
        kind: kind_of(kind),
        perm: (record.raw_mode & 0o7777) as u16,
        nlink: if kind == FileKind::Directory { 2 } else { 1 },
        uid: record.uid,
        gid: record.gid,
        rdev: 0,
        blksize: record.block_size.max(0) as u32,
        flags: 0,
    }
}

impl Filesystem for PodMountFs {
    fn lookup(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let name = match name.to_str() {
            Some(name) => name,
            None => {
                reply.error(ENOENT);
                return;
            }
        };
        let parent_node = match self.nodes.get(&parent) {
            Some(node) => node,
            None => {
                reply.error(ENOENT);
                return;
            }
        };

        let record = match parent_node.fsys.stat(&self.cancel, name) {
            Ok(record) => record,
            Err(err) => {
                reply.error(errno_of(&err));
                return;
            }
        };
        // The kernel addresses the mount root as inode 1; a remote path with
        // the same inode would be indistinguishable from it.
        if record.ino == FUSE_ROOT_ID {
            warn!(
                target: "podmount::fuse",
                name,
                "refusing lookup of remote path with reserved inode 1"
            );
            reply.error(EPERM);
            return;
        }
        let kind = match record.kind() {
            Ok(kind) => kind,
            Err(err) => {
                reply.error(errno_of(&err));
                return;
            }
        };

        let node = if kind == FileKind::Directory {
            Node {
                fsys: parent_node.fsys.sub(name),
                file: String::new(),
            }
        } else {
            Node {
                fsys: parent_node.fsys.clone(),
                file: name.to_string(),
            }
        };
        let attr = attr_of(&record, kind);
        self.nodes.insert(record.ino, node);
        reply.entry(&TTL, &attr, 0);
    }

    fn getattr(&mut self, _req: &Request, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        let node = match self.nodes.get(&ino) {
            Some(node) => node,
            None => {
                reply.error(ENOENT);
                return;
            }
        };
        let name = if node.is_dir() { "." } else { node.file.as_str() };
        match node.fsys.stat(&self.cancel, name) {
            Ok(record) => match record.kind() {
                Ok(kind) => {
                    let mut attr = attr_of(&record, kind);
                    // The node table, not the remote inode, is the kernel's
                    // identity; keep the two consistent for the root.
                    if ino == FUSE_ROOT_ID {
                        attr.ino = FUSE_ROOT_ID;
                    }
                    reply.attr(&TTL, &attr);
                }
                Err(err) => reply.error(errno_of(&err)),
            },
            Err(err) => reply.error(errno_of(&err)),
        }
    }

    fn readdir(&mut self, _req: &Request, ino: u64, _fh: u64, offset: i64, mut reply: ReplyDirectory) {
        let node = match self.nodes.get(&ino) {
            Some(node) => node,
            None => {
                reply.error(ENOENT);
                return;
            }
        };
        if !node.is_dir() {
            reply.error(ENOTDIR);
            return;
        }

        let entries = match node.fsys.read_dir(&self.cancel, ".") {
            Ok(entries) => entries,
            Err(err) => {
                reply.error(errno_of(&err));
                return;
            }
        };

        for (i, entry) in entries.iter().enumerate().skip(offset as usize) {
            let kind = match entry.kind() {
                Ok(kind) => kind_of(kind),
                Err(err) => {
                    reply.error(errno_of(&err));
                    return;
                }
            };
            if reply.add(entry.ino, (i + 1) as i64, kind, &entry.name) {
                break;
            }
        }
        reply.ok();
    }

    fn open(&mut self, _req: &Request, ino: u64, _flags: i32, reply: ReplyOpen) {
        let node = match self.nodes.get(&ino) {
            Some(node) => node,
            None => {
                reply.error(ENOENT);
                return;
            }
        };
        if node.is_dir() {
            reply.error(EISDIR);
            return;
        }

        match node.fsys.open(&self.cancel, &node.file) {
            Ok(file) => {
                self.next_fh += 1;
                let fh = self.next_fh;
                self.handles.insert(fh, OpenFile::new(file));
                debug!(target: "podmount::fuse", ino, fh, "opened streaming read");
                reply.opened(fh, FOPEN_NONSEEKABLE);
            }
            Err(err) => reply.error(errno_of(&err)),
        }
    }

    fn read(
        &mut self,
        _req: &Request,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        if offset < 0 {
            reply.error(EINVAL);
            return;
        }
        let open = match self.handles.get_mut(&fh) {
            Some(open) => open,
            None => {
                reply.error(EBADF);
                return;
            }
        };
        match open.read_at(offset as u64, size as usize) {
            Ok(data) => reply.data(&data),
            Err(ReadFault::BackwardSeek) => {
                warn!(
                    target: "podmount::fuse",
                    fh, offset,
                    consumed = open.consumed,
                    "backward read on a non-seekable handle"
                );
                reply.error(EIO);
            }
            Err(ReadFault::Io(err)) => {
                debug!(target: "podmount::fuse", fh, %err, "stream read failed");
                reply.error(EIO);
            }
        }
    }

    fn readlink(&mut self, _req: &Request, ino: u64, reply: ReplyData) {
        let node = match self.nodes.get(&ino) {
            Some(node) => node,
            None => {
                reply.error(ENOENT);
                return;
            }
        };
        if node.is_dir() {
            reply.error(EINVAL);
            return;
        }
        match node.fsys.read_link(&self.cancel, &node.file) {
            Ok(target) => reply.data(target.as_bytes()),
            Err(err) => reply.error(errno_of(&err)),
        }
    }

    fn release(
        &mut self,
        _req: &Request,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        match self.handles.remove(&fh) {
            Some(mut open) => match open.file.close() {
                Ok(()) => reply.ok(),
                Err(err) => reply.error(errno_of(&err)),
            },
            // Releasing an unknown handle is a no-op, matching double close.
            None => reply.ok(),
        }
    }

    fn forget(&mut self, _req: &Request, ino: u64, _nlookup: u64) {
        if ino != FUSE_ROOT_ID {
            self.nodes.remove(&ino);
        }
    }

    fn destroy(&mut self) {
        self.cancel.cancel();
        for (_, mut open) in self.handles.drain() {
            let _ = open.file.close();
        }
    }
}
