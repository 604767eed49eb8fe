//! Parser for remote `stat --format` output.

use std::fmt;

use crate::error::{PodFsError, PodFsResult};

/// Format string handed to the remote `stat`. Eleven tab-separated fields:
/// name, inode, size, block size, blocks, raw mode (hex), atime, mtime,
/// ctime, uid, gid.
pub const STAT_FORMAT: &str = "%n\t%i\t%s\t%B\t%b\t%f\t%X\t%Y\t%Z\t%u\t%g";

const S_IFMT: u32 = 0xF000;
const S_IFIFO: u32 = 0x1000;
const S_IFCHR: u32 = 0x2000;
const S_IFDIR: u32 = 0x4000;
const S_IFBLK: u32 = 0x6000;
const S_IFREG: u32 = 0x8000;
const S_IFLNK: u32 = 0xA000;
const S_IFSOCK: u32 = 0xC000;

/// Portable file type derived from the remote mode bits. The remote pod is
/// assumed to run Linux.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileKind {
    Fifo,
    CharDev,
    Directory,
    BlockDev,
    Regular,
    Symlink,
    Socket,
}

impl FileKind {
    pub fn from_mode(raw_mode: u32) -> Option<FileKind> {
        match raw_mode & S_IFMT {
            S_IFIFO => Some(FileKind::Fifo),
            S_IFCHR => Some(FileKind::CharDev),
            S_IFDIR => Some(FileKind::Directory),
            S_IFBLK => Some(FileKind::BlockDev),
            S_IFREG => Some(FileKind::Regular),
            S_IFLNK => Some(FileKind::Symlink),
            S_IFSOCK => Some(FileKind::Socket),
            _ => None,
        }
    }
}

/// Attributes of one remote path as reported by `stat`.
///
/// `name` is kept exactly as the remote tool printed it; callers that asked
/// for a path get the path back and should rely on [`StatRecord::basename`]
/// or their own name, never on this field, for the logical entry name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StatRecord {
    pub name: String,
    pub ino: u64,
    pub size: i64,
    pub block_size: i64,
    pub blocks: i64,
    pub raw_mode: u32,
    pub atime: i64,
    pub mtime: i64,
    pub ctime: i64,
    pub uid: u32,
    pub gid: u32,
}

impl StatRecord {
    /// Parses one line of `stat --format` output (trailing newline included).
    pub fn parse(output: &[u8]) -> PodFsResult<StatRecord> {
        let line = std::str::from_utf8(output)
            .map_err(|_| PodFsError::MalformedStat(String::from_utf8_lossy(output).into_owned()))?;
        let line = line.strip_suffix('\n').unwrap_or(line);

        let malformed = || PodFsError::MalformedStat(line.to_string());

        let parts: Vec<&str> = line.split('\t').collect();
        if parts.len() != 11 {
            return Err(malformed());
        }

        Ok(StatRecord {
            name: parts[0].to_string(),
            ino: parts[1].parse().map_err(|_| malformed())?,
            size: parts[2].parse().map_err(|_| malformed())?,
            block_size: parts[3].parse().map_err(|_| malformed())?,
            blocks: parts[4].parse().map_err(|_| malformed())?,
            raw_mode: u32::from_str_radix(parts[5], 16).map_err(|_| malformed())?,
            atime: parts[6].parse().map_err(|_| malformed())?,
            mtime: parts[7].parse().map_err(|_| malformed())?,
            ctime: parts[8].parse().map_err(|_| malformed())?,
            uid: parts[9].parse().map_err(|_| malformed())?,
            gid: parts[10].parse().map_err(|_| malformed())?,
        })
    }

    /// File type, failing on mode bits no Linux `stat` would report.
    pub fn kind(&self) -> PodFsResult<FileKind> {
        FileKind::from_mode(self.raw_mode).ok_or_else(|| {
            PodFsError::MalformedStat(format!("unknown file type in mode {:x}", self.raw_mode))
        })
    }

    pub fn perm(&self) -> u32 {
        self.raw_mode & 0o777
    }

    pub fn is_dir(&self) -> bool {
        self.raw_mode & S_IFMT == S_IFDIR
    }

    pub fn is_symlink(&self) -> bool {
        self.raw_mode & S_IFMT == S_IFLNK
    }

    /// Final path component of the name `stat` reported.
    pub fn basename(&self) -> &str {
        self.name.rsplit('/').next().unwrap_or(&self.name)
    }
}

/// Re-emits the canonical wire line; parsing and displaying round-trips.
impl fmt::Display for StatRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{}\t{}\t{}\t{}\t{}\t{:x}\t{}\t{}\t{}\t{}\t{}",
            self.name,
            self.ino,
            self.size,
            self.block_size,
            self.blocks,
            self.raw_mode,
            self.atime,
            self.mtime,
            self.ctime,
            self.uid,
            self.gid,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CANONICAL: &str = "/etc/hostname\t131845\t6\t512\t8\t81a4\t1700000000\t1690000000\t1690000001\t0\t0\n";

    #[test]
    fn parses_canonical_line() {
        let rec = StatRecord::parse(CANONICAL.as_bytes()).unwrap();
        assert_eq!(rec.name, "/etc/hostname");
        assert_eq!(rec.basename(), "hostname");
        assert_eq!(rec.ino, 131845);
        assert_eq!(rec.size, 6);
        assert_eq!(rec.block_size, 512);
        assert_eq!(rec.blocks, 8);
        assert_eq!(rec.raw_mode, 0x81A4);
        assert_eq!(rec.kind().unwrap(), FileKind::Regular);
        assert_eq!(rec.perm(), 0o644);
        assert_eq!(rec.atime, 1700000000);
        assert_eq!(rec.mtime, 1690000000);
        assert_eq!(rec.ctime, 1690000001);
        assert_eq!(rec.uid, 0);
        assert_eq!(rec.gid, 0);
    }

    #[test]
    fn round_trips_canonical_line() {
        let rec = StatRecord::parse(CANONICAL.as_bytes()).unwrap();
        assert_eq!(rec.to_string(), CANONICAL);
    }

    #[test]
    fn rejects_wrong_field_count() {
        let line = "/etc\t2\t4096\t512\t8\t41ed\t1\t2\t3\t0\n";
        assert!(matches!(
            StatRecord::parse(line.as_bytes()),
            Err(PodFsError::MalformedStat(_))
        ));
    }

    #[test]
    fn rejects_non_numeric_field() {
        let line = "/etc\tnope\t4096\t512\t8\t41ed\t1\t2\t3\t0\t0\n";
        assert!(matches!(
            StatRecord::parse(line.as_bytes()),
            Err(PodFsError::MalformedStat(_))
        ));
    }

    #[test]
    fn derives_every_file_kind() {
        let cases = [
            (0x1180, FileKind::Fifo),
            (0x21B6, FileKind::CharDev),
            (0x41ED, FileKind::Directory),
            (0x61B0, FileKind::BlockDev),
            (0x81A4, FileKind::Regular),
            (0xA1FF, FileKind::Symlink),
            (0xC1C0, FileKind::Socket),
        ];
        for (mode, kind) in cases {
            assert_eq!(FileKind::from_mode(mode), Some(kind), "mode {mode:x}");
        }
        assert_eq!(FileKind::from_mode(0x0123), None);
    }

    #[test]
    fn directory_and_symlink_predicates() {
        let dir = StatRecord::parse(b"/etc\t2\t4096\t512\t8\t41ed\t1\t2\t3\t0\t0\n").unwrap();
        assert!(dir.is_dir());
        assert!(!dir.is_symlink());
        assert_eq!(dir.kind().unwrap(), FileKind::Directory);

        let link =
            StatRecord::parse(b"/etc/rc\t99\t11\t512\t0\ta1ff\t1\t2\t3\t0\t0\n").unwrap();
        assert!(link.is_symlink());
        assert_eq!(link.perm(), 0o777);
    }
}
