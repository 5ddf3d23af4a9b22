//! Virtual filesystem core.
//!
//! Backing stores plug in through records of function references chosen at
//! registration time: a named `FsType` produces superblocks, a `SuperOps`
//! manages the mount's inodes, and per-inode `InodeOps`/`FileOps` carry the
//! metadata and I/O entry points. The kernel only ever calls through these
//! records.

use zerocopy::{AsBytes, FromBytes};

use crate::{err::KResult, kernel::Kernel, param::DIRSIZ};

pub mod devfs;
pub mod file;
pub mod fstab;
pub mod inode;
pub mod path;
pub mod romfs;
pub mod stat;

pub use file::{FileTable, OpenFile};
pub use fstab::{FsTab, Mount};
pub use inode::{Inode, Itable};
pub use path::PathBuf;

/// Filesystem-local inode number.
pub type Ino = u32;

/// A slot in the superblock pool.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct SbId(pub(crate) usize);

/// A slot in the in-memory inode pool.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct InodeId(pub(crate) usize);

/// A slot in the system-wide open-file pool.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct FileId(pub(crate) usize);

/// File types.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum IType {
    Regular,
    Directory,
    Symlink,
    Device,
}

impl IType {
    /// The numeric type exposed in `stat` records.
    pub fn as_u16(self) -> u16 {
        match self {
            IType::Regular => 1,
            IType::Directory => 2,
            IType::Symlink => 3,
            IType::Device => 4,
        }
    }
}

bitflags! {
    /// Permission bits, the low nine bits of the classic mode word.
    pub struct FileMode: u16 {
        const IRUSR = 0o400;
        const IWUSR = 0o200;
        const IXUSR = 0o100;
        const IRGRP = 0o040;
        const IWGRP = 0o020;
        const IXGRP = 0o010;
        const IROTH = 0o004;
        const IWOTH = 0o002;
        const IXOTH = 0o001;
        const RWX_ALL = 0o777;
    }
}

/// Permission request bits, in "other" position.
pub const PERM_R: u16 = 0o4;
pub const PERM_W: u16 = 0o2;
pub const PERM_X: u16 = 0o1;

bitflags! {
    /// `open(2)` flags.
    pub struct OpenFlags: u32 {
        const RDONLY = 0;
        const WRONLY = 0o1;
        const RDWR = 0o2;
        const ACCMODE = 0o3;
        const CREATE = 0o100;
        const EXCLUSIVE = 0o200;
        const TRUNC = 0o1000;
        const APPEND = 0o2000;
        const NOFOLLOW = 0o400000;
        const CLOEXEC = 0o2000000;
    }
}

impl OpenFlags {
    pub fn readable(self) -> bool {
        (self & Self::ACCMODE) != Self::WRONLY
    }

    pub fn writable(self) -> bool {
        let acc = self & Self::ACCMODE;
        acc == Self::WRONLY || acc == Self::RDWR
    }
}

bitflags! {
    /// Mount flags handed to `FsType::get_sb`.
    pub struct MountFlags: u32 {
        const RDONLY = 0o1;
    }
}

/// Driver operations on opened files.
///
/// `read`/`write` receive the position by reference: it usually aliases the
/// open file's `pos`, but positional variants may pass a scratch offset, so
/// drivers must go through the parameter.
pub struct FileOps {
    pub open: Option<fn(&mut Kernel, InodeId, FileId) -> KResult<()>>,
    pub release: Option<fn(&mut Kernel, InodeId, FileId) -> KResult<()>>,
    pub read: fn(&mut Kernel, FileId, &mut [u8], &mut usize) -> KResult<usize>,
    pub write: fn(&mut Kernel, FileId, &[u8], &mut usize) -> KResult<usize>,
    pub readdir: fn(&mut Kernel, FileId, &mut Dirent) -> KResult<()>,
    pub ioctl: Option<fn(&mut Kernel, FileId, u32, usize) -> KResult<usize>>,
}

/// Driver operations on inode metadata. The mutating hooks are optional:
/// read-only drivers leave them unset and the VFS reports `NotPermitted`.
pub struct InodeOps {
    pub lookup: fn(&mut Kernel, InodeId, &[u8]) -> KResult<Ino>,
    pub readlink: fn(&mut Kernel, InodeId) -> KResult<PathBuf>,
    pub create: Option<fn(&mut Kernel, InodeId, &[u8], FileMode) -> KResult<Ino>>,
    pub link: Option<fn(&mut Kernel, InodeId, &[u8], InodeId) -> KResult<()>>,
    pub unlink: Option<fn(&mut Kernel, InodeId, &[u8]) -> KResult<()>>,
    pub symlink: Option<fn(&mut Kernel, InodeId, &[u8], &[u8]) -> KResult<()>>,
    pub mkdir: Option<fn(&mut Kernel, InodeId, &[u8], FileMode) -> KResult<Ino>>,
    pub rmdir: Option<fn(&mut Kernel, InodeId, &[u8]) -> KResult<()>>,
    pub rename: Option<fn(&mut Kernel, InodeId, &[u8], InodeId, &[u8]) -> KResult<()>>,
    pub truncate: Option<fn(&mut Kernel, InodeId, usize) -> KResult<()>>,
}

/// Superblock operations: allocation and management of the mount's inodes.
/// Inodes obtained from `alloc_inode`/`open_inode` must be returned through
/// `free_inode`.
pub struct SuperOps {
    pub alloc_inode: fn(&mut Kernel, SbId) -> KResult<InodeId>,
    pub open_inode: fn(&mut Kernel, SbId, Ino) -> KResult<InodeId>,
    pub free_inode: fn(&mut Kernel, InodeId) -> KResult<()>,
    pub read_inode: fn(&mut Kernel, InodeId) -> KResult<()>,
    pub write_inode: Option<fn(&mut Kernel, InodeId) -> KResult<()>>,
    pub drop_inode: Option<fn(&mut Kernel, InodeId) -> KResult<()>>,
}

/// A named filesystem driver, as registered in the fstab.
#[derive(Clone, Copy)]
pub struct FsType {
    pub name: &'static str,
    pub get_sb: fn(&mut Kernel, usize, MountFlags, usize, &[u8]) -> KResult<SbId>,
    pub kill_sb: fn(&mut Kernel, SbId) -> KResult<()>,
}

/// One mounted filesystem instance.
pub struct Superblock {
    /// Registry slot of the owning driver.
    pub fs: usize,
    pub s_op: &'static SuperOps,
    /// Root directory inode number.
    pub root: Ino,
    /// Live in-memory inodes of this mount.
    pub open_count: u32,
    /// Driver cookie (romfs keeps the image base address here).
    pub private: usize,
}

/// Directory entry record exchanged with user space by `getdents`. The
/// `index` field tracks iteration: -1 to start, then the driver's stable
/// index of the last entry returned.
#[derive(Clone, Copy, AsBytes, FromBytes)]
#[repr(C)]
pub struct Dirent {
    pub ino: u32,
    pub index: i32,
    pub name: [u8; DIRSIZ],
}

impl Dirent {
    pub fn new() -> Self {
        Self {
            ino: 0,
            index: -1,
            name: [0; DIRSIZ],
        }
    }

    /// Fill in name. A name shorter than `DIRSIZ` is NUL-terminated.
    pub fn set_name(&mut self, name: &[u8]) {
        let n = name.len().min(DIRSIZ);
        self.name[..n].copy_from_slice(&name[..n]);
        if n < DIRSIZ {
            self.name[n] = 0;
        }
    }

    /// Returns the slice which exactly contains the name.
    pub fn name(&self) -> &[u8] {
        let len = self.name.iter().position(|b| *b == 0).unwrap_or(DIRSIZ);
        &self.name[..len]
    }
}

impl Default for Dirent {
    fn default() -> Self {
        Self::new()
    }
}
