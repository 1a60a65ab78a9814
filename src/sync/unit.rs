//! Per-entry metadata snapshots.
//!
//! A [`Unit`] captures one path at one instant: its kind, size, link target
//! and (lazily) its content hash. Two units are compared by content and
//! metadata, never by identity, producing a [`DiffFlags`] mask that tells the
//! engine what has to be done.

use filetime::{set_file_times, FileTime};
use std::cell::OnceCell;
use std::fmt;
use std::fs::{self, File, Metadata, Permissions};
use std::io;
use std::ops::{BitOr, BitOrAssign};
use std::os::unix::fs::{chown, lchown, MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

use rustix::fs::{access, Access};

use crate::sync::compression::{CompressionLevel, ContentReader, ContentWriter};
use crate::sync::error::{Result, SyncError};
use crate::sync::hash::{hash_reader, ContentHash};
use crate::sync::path_utils::resolve;

/// Kind of filesystem entry a unit represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnitKind {
    /// Nothing on disk (or an entry kind that is not mirrored).
    Virtual,
    Link,
    Directory,
    RegularFile,
}

impl UnitKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Virtual => "missing",
            Self::Link => "link",
            Self::Directory => "directory",
            Self::RegularFile => "file",
        }
    }
}

impl fmt::Display for UnitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Dimensions in which two units differ.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct DiffFlags(u8);

impl DiffFlags {
    pub const NONE: Self = Self(0);
    pub const TYPE: Self = Self(0b000001);
    pub const TARGET: Self = Self(0b000010);
    pub const HASH: Self = Self(0b000100);
    pub const MODE: Self = Self(0b001000);
    pub const MTIME: Self = Self(0b010000);
    pub const SIZE: Self = Self(0b100000);

    const NAMES: [(Self, &'static str); 6] = [
        (Self::TYPE, "TYPE"),
        (Self::TARGET, "TARGET"),
        (Self::HASH, "HASH"),
        (Self::MODE, "MODE"),
        (Self::MTIME, "MTIME"),
        (Self::SIZE, "SIZE"),
    ];

    pub fn bits(&self) -> u8 {
        self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// True if every flag in `other` is set.
    pub fn contains(&self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }
}

impl BitOr for DiffFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for DiffFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for DiffFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("NONE");
        }
        let names: Vec<&str> = Self::NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        f.write_str(&names.join("|"))
    }
}

/// Ownership, mode and times of an entry, read live from the OS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PermissionSnapshot {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub mtime: FileTime,
    pub atime: FileTime,
}

impl PermissionSnapshot {
    fn from_metadata(meta: &Metadata) -> Self {
        Self {
            mode: meta.mode(),
            uid: meta.uid(),
            gid: meta.gid(),
            mtime: FileTime::from_last_modification_time(meta),
            atime: FileTime::from_last_access_time(meta),
        }
    }
}

/// Whether the process runs with root privileges.
pub fn is_privileged() -> bool {
    rustix::process::geteuid().is_root()
}

fn current_uid() -> u32 {
    rustix::process::geteuid().as_raw()
}

/// Snapshot of one filesystem path.
#[derive(Debug)]
pub struct Unit {
    path: PathBuf,
    kind: UnitKind,
    size: u64,
    link_target: Option<PathBuf>,
    hash: OnceCell<ContentHash>,
}

impl Unit {
    /// Stat `path` (without following a final symlink) and classify it.
    ///
    /// A missing path is a `Virtual` unit. For regular files the content is
    /// sniffed for a container so the size is the decompressed size and an
    /// embedded hash is picked up without rehashing.
    pub fn probe(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let meta = match fs::symlink_metadata(&path) {
            Ok(meta) => Some(meta),
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::NotFound | io::ErrorKind::NotADirectory
                ) =>
            {
                None
            }
            Err(e) => return Err(SyncError::from_io_error(e, "reading metadata of", path)),
        };

        let kind = match &meta {
            None => UnitKind::Virtual,
            Some(m) if m.file_type().is_symlink() => UnitKind::Link,
            Some(m) if m.is_dir() => UnitKind::Directory,
            Some(m) if m.is_file() => UnitKind::RegularFile,
            Some(_) => {
                tracing::debug!("Treating special file '{}' as missing", path.display());
                UnitKind::Virtual
            }
        };

        let mut unit = Self {
            path,
            kind,
            size: 0,
            link_target: None,
            hash: OnceCell::new(),
        };

        match (kind, meta) {
            (UnitKind::Link, Some(meta)) => {
                unit.size = meta.len();
                unit.link_target = Some(
                    fs::read_link(&unit.path)
                        .map_err(|e| SyncError::from_io_error(e, "reading link", &unit.path))?,
                );
            }
            (UnitKind::RegularFile, Some(meta)) => {
                let reader = unit.open_reader()?;
                match reader.real_length() {
                    Some(length) => {
                        unit.size = length;
                        if let Some(hash) = reader.embedded_hash() {
                            let _ = unit.hash.set(hash);
                        }
                    }
                    None => unit.size = meta.len(),
                }
            }
            (UnitKind::Directory, Some(meta)) => unit.size = meta.len(),
            _ => {}
        }

        Ok(unit)
    }

    /// Probe `relative` below `root` without resolving through its ancestors.
    ///
    /// If any ancestor below `root` is not a real directory (a link, a file,
    /// or nothing) the unit is `Virtual`, so nothing outside the tree is ever
    /// looked at or written through.
    pub fn probe_in(root: &Path, relative: &str) -> Result<Self> {
        let path = resolve(root, relative);
        let parts: Vec<&str> = relative.split('/').filter(|p| !p.is_empty()).collect();
        let mut ancestor = root.to_path_buf();
        for part in parts.iter().take(parts.len().saturating_sub(1)) {
            ancestor.push(part);
            match fs::symlink_metadata(&ancestor) {
                Ok(meta) if meta.is_dir() => {}
                Ok(_) => return Ok(Self::missing(path)),
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::NotFound | io::ErrorKind::NotADirectory
                    ) =>
                {
                    return Ok(Self::missing(path))
                }
                Err(e) => return Err(SyncError::from_io_error(e, "reading metadata of", ancestor)),
            }
        }
        Self::probe(path)
    }

    fn missing(path: PathBuf) -> Self {
        Self {
            path,
            kind: UnitKind::Virtual,
            size: 0,
            link_target: None,
            hash: OnceCell::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn kind(&self) -> UnitKind {
        self.kind
    }

    pub fn exists(&self) -> bool {
        self.kind != UnitKind::Virtual
    }

    /// Content length; decompressed length for containers.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn link_target(&self) -> Option<&Path> {
        self.link_target.as_deref()
    }

    /// Content digest, computed on first access for regular files.
    pub fn hash(&self) -> Result<Option<ContentHash>> {
        if self.kind != UnitKind::RegularFile {
            return Ok(None);
        }
        if let Some(hash) = self.hash.get() {
            return Ok(Some(*hash));
        }

        let reader = self.open_reader()?;
        let (hash, _) =
            hash_reader(reader).map_err(|e| SyncError::from_io_error(e, "hashing", &self.path))?;
        Ok(Some(*self.hash.get_or_init(|| hash)))
    }

    /// Live ownership/mode/time state; `None` for virtual units or when stat fails.
    pub fn permissions(&self) -> Option<PermissionSnapshot> {
        let meta = match self.kind {
            UnitKind::Virtual => return None,
            UnitKind::Link => fs::symlink_metadata(&self.path),
            _ => fs::metadata(&self.path),
        };
        meta.ok().map(|m| PermissionSnapshot::from_metadata(&m))
    }

    pub fn is_readable(&self) -> bool {
        match self.kind {
            UnitKind::Virtual | UnitKind::Link => true,
            _ => access(self.path.as_path(), Access::READ_OK).is_ok(),
        }
    }

    /// Whether the entry can be written, or created/removed in its parent.
    pub fn is_writable(&self) -> bool {
        if !matches!(self.kind, UnitKind::Virtual | UnitKind::Link)
            && access(self.path.as_path(), Access::WRITE_OK).is_err()
        {
            return false;
        }
        match self.path.parent() {
            Some(parent) if parent.is_dir() => access(parent, Access::WRITE_OK).is_ok(),
            _ => true,
        }
    }

    pub fn is_owned_by_current_user(&self) -> bool {
        match self.kind {
            UnitKind::Virtual | UnitKind::Link => true,
            _ => {
                let uid = current_uid();
                uid == 0
                    || fs::metadata(&self.path)
                        .map(|m| m.uid() == uid)
                        .unwrap_or(true)
            }
        }
    }

    /// Open the content for reading, decompressing containers.
    pub fn open_reader(&self) -> Result<ContentReader<File>> {
        let file =
            File::open(&self.path).map_err(|e| SyncError::from_io_error(e, "opening", &self.path))?;
        ContentReader::open(file).map_err(|e| SyncError::from_io_error(e, "reading", &self.path))
    }

    /// Create or truncate the path for writing.
    ///
    /// With `compress` the content is written as a container whose header
    /// carries `known_hash` and `length`, so the next run can skip
    /// rehashing it.
    pub fn open_writer(
        &self,
        compress: bool,
        known_hash: Option<&ContentHash>,
        length: Option<u64>,
    ) -> Result<ContentWriter<File>> {
        let file = File::create(&self.path)
            .map_err(|e| SyncError::from_io_error(e, "creating", &self.path))?;
        if compress {
            ContentWriter::container(file, known_hash, length, CompressionLevel::default())
                .map_err(|e| SyncError::from_io_error(e, "writing header of", &self.path))
        } else {
            Ok(ContentWriter::raw(file))
        }
    }

    /// Compare this unit (the source side) against `other`.
    pub fn compare(&self, other: &Unit, compare_hash: bool) -> Result<DiffFlags> {
        let mut flags = DiffFlags::NONE;
        let both_files = self.kind == UnitKind::RegularFile && other.kind == UnitKind::RegularFile;

        if self.kind != other.kind {
            flags |= DiffFlags::TYPE;
        } else if self.kind == UnitKind::Link {
            if self.link_target != other.link_target {
                flags |= DiffFlags::TARGET;
            }
        } else if both_files {
            if self.size != other.size {
                flags |= DiffFlags::SIZE;
            }
            if compare_hash && self.hash()? != other.hash()? {
                flags |= DiffFlags::HASH;
            }
        }

        match (self.permissions(), other.permissions()) {
            (Some(mine), Some(theirs)) => {
                // Owner only has to match when running as root.
                if mine.mode != theirs.mode
                    || mine.gid != theirs.gid
                    || (is_privileged() && mine.uid != theirs.uid)
                {
                    flags |= DiffFlags::MODE;
                }
                if !compare_hash
                    && both_files
                    && mine.mtime.unix_seconds() != theirs.mtime.unix_seconds()
                {
                    flags |= DiffFlags::MTIME;
                }
            }
            (None, None) => {}
            _ => flags |= DiffFlags::MODE,
        }

        Ok(flags)
    }

    /// Copy ownership, mode and (for files) times from this unit onto `target`.
    ///
    /// Steps run in order and stop at the first failure; earlier steps are
    /// not rolled back.
    pub fn touch(&self, target: &Unit) -> Result<()> {
        if self.kind == UnitKind::Virtual || self.kind != target.kind {
            return Err(SyncError::PermissionPropagation {
                path: target.path.display().to_string(),
            });
        }

        let meta = match self.kind {
            UnitKind::Link => fs::symlink_metadata(&self.path),
            _ => fs::metadata(&self.path),
        }
        .map_err(|e| SyncError::from_io_error(e, "reading metadata of", &self.path))?;

        let privileged = is_privileged();
        let uid = if privileged { meta.uid() } else { current_uid() };
        let dest = target.path.as_path();
        let os_err = |operation: &str| {
            let operation = operation.to_string();
            move |e: io::Error| SyncError::from_io_error(e, &operation, dest)
        };

        if self.kind == UnitKind::Link {
            lchown(dest, Some(uid), None).map_err(os_err("changing owner of"))?;
            lchown(dest, None, Some(meta.gid())).map_err(os_err("changing group of"))?;
            return Ok(());
        }

        chown(dest, Some(uid), None).map_err(os_err("changing owner of"))?;
        chown(dest, None, Some(meta.gid())).map_err(os_err("changing group of"))?;

        if self.kind == UnitKind::RegularFile {
            set_file_times(
                dest,
                FileTime::from_last_access_time(&meta),
                FileTime::from_last_modification_time(&meta),
            )
            .map_err(os_err("setting times of"))?;
        }

        let mask = if privileged { 0o7777 } else { 0o777 };
        fs::set_permissions(dest, Permissions::from_mode(meta.mode() & mask))
            .map_err(os_err("changing mode of"))?;

        Ok(())
    }
}
