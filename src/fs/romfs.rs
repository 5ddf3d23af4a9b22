//! The read-only ROM-image filesystem.
//!
//! A romfs image is a flat byte blob the boot loader hands over as a module:
//! a header, an inode table, a dentry table forming a parent-linked tree,
//! then raw file content. Everything is little-endian and parsed in place;
//! the superblock keeps the image base address in its private field.
//!
//! Image layout:
//!
//! ```text
//! [RomSuper][RomInode * ninode][RomDentry * ndentry][content]
//! ```

use core::mem;

use static_assertions::const_assert_eq;
use zerocopy::{AsBytes, FromBytes};

use crate::{
    err::{Errno, KResult},
    fs::{
        Dirent, FileId, FileMode, FileOps, FsType, Ino, InodeId, InodeOps, IType, MountFlags,
        PathBuf, SbId, SuperOps, Superblock,
    },
    kernel::Kernel,
    param::DIRSIZ,
};

pub const ROMFS_MAGIC: u32 = 0x524f_4d31; // "ROM1"

/// On-image file types.
pub const ROM_FT_DIR: u16 = 1;
pub const ROM_FT_FILE: u16 = 2;
pub const ROM_FT_SYMLINK: u16 = 3;

/// Image header.
#[derive(Clone, Copy, Default, AsBytes, FromBytes)]
#[repr(C)]
pub struct RomSuper {
    /// Must be ROMFS_MAGIC.
    pub magic: u32,
    pub ninode: u32,
    pub ndentry: u32,
    /// Total image size in bytes.
    pub size: u32,
}

/// On-image index node. `offset` locates the content inside the image.
#[derive(Clone, Copy, Default, AsBytes, FromBytes)]
#[repr(C)]
pub struct RomInode {
    pub ftype: u16,
    pub mode: u16,
    pub uid: u32,
    pub gid: u32,
    pub size: u32,
    pub offset: u32,
}

/// On-image directory entry, linking a name under a parent directory.
#[derive(Clone, Copy, AsBytes, FromBytes)]
#[repr(C)]
pub struct RomDentry {
    pub name: [u8; DIRSIZ],
    pub ino: u32,
    pub parent: u32,
}

impl Default for RomDentry {
    fn default() -> Self {
        Self {
            name: [0; DIRSIZ],
            ino: 0,
            parent: 0,
        }
    }
}

const_assert_eq!(mem::size_of::<RomSuper>(), 16);
const_assert_eq!(mem::size_of::<RomInode>(), 20);
const_assert_eq!(mem::size_of::<RomDentry>(), 40);

const HDR_SIZE: usize = mem::size_of::<RomSuper>();
const INODE_SIZE: usize = mem::size_of::<RomInode>();
const DENTRY_SIZE: usize = mem::size_of::<RomDentry>();

/// Root directory i-number.
const ROOT_INO: Ino = 0;

pub const FS_TYPE: FsType = FsType {
    name: "romfs",
    get_sb,
    kill_sb,
};

/// Reads one in-image record at `off`.
fn read_rec<T: AsBytes + FromBytes + Default>(img: &[u8], off: usize) -> KResult<T> {
    let end = off.checked_add(mem::size_of::<T>()).ok_or(Errno::Io)?;
    if end > img.len() {
        return Err(Errno::Io);
    }
    let mut rec = T::default();
    rec.as_bytes_mut().copy_from_slice(&img[off..end]);
    Ok(rec)
}

/// The mounted image. `get_sb` validated the header, so the base address
/// and length stored in the superblock are trusted from here on.
fn image(k: &Kernel, sb: SbId) -> &'static [u8] {
    let base = k.fstab.sb(sb).private;
    // SAFETY: get_sb checked the header at `base` and recorded its size; the
    // boot module (or the leaked test image) outlives the kernel.
    unsafe {
        let hdr = core::slice::from_raw_parts(base as *const u8, HDR_SIZE);
        let mut sup = RomSuper::default();
        sup.as_bytes_mut().copy_from_slice(hdr);
        core::slice::from_raw_parts(base as *const u8, sup.size as usize)
    }
}

fn get_sb(
    k: &mut Kernel,
    fs: usize,
    _flags: MountFlags,
    source: usize,
    _opts: &[u8],
) -> KResult<SbId> {
    if source == 0 {
        return Err(Errno::BadArg);
    }
    // SAFETY: the caller passes the base of a loaded boot module.
    let hdr = unsafe { core::slice::from_raw_parts(source as *const u8, HDR_SIZE) };
    let sup: RomSuper = read_rec(hdr, 0)?;
    if sup.magic != ROMFS_MAGIC {
        return Err(Errno::Io);
    }
    let tables = HDR_SIZE
        + sup.ninode as usize * INODE_SIZE
        + sup.ndentry as usize * DENTRY_SIZE;
    if (sup.size as usize) < tables || sup.ninode == 0 {
        return Err(Errno::Io);
    }
    k.fstab.sb_alloc(Superblock {
        fs,
        s_op: &SUPER_OPS,
        root: ROOT_INO,
        open_count: 0,
        private: source,
    })
}

fn kill_sb(k: &mut Kernel, sb: SbId) -> KResult<()> {
    if k.itable.live_count(sb) != 0 {
        return Err(Errno::Busy);
    }
    k.fstab.sb_free(sb);
    Ok(())
}

static SUPER_OPS: SuperOps = SuperOps {
    alloc_inode: |_, _| Err(Errno::NotPermitted),
    open_inode,
    free_inode,
    read_inode,
    write_inode: None,
    drop_inode: None,
};

fn open_inode(k: &mut Kernel, sb: SbId, ino: Ino) -> KResult<InodeId> {
    k.icache_get(sb, ino, &FILE_OPS, &INODE_OPS)
}

fn free_inode(k: &mut Kernel, id: InodeId) -> KResult<()> {
    k.icache_release(id);
    Ok(())
}

fn rom_inode(k: &Kernel, sb: SbId, ino: Ino) -> KResult<RomInode> {
    let img = image(k, sb);
    let sup: RomSuper = read_rec(img, 0)?;
    if ino >= sup.ninode {
        return Err(Errno::NotFound);
    }
    read_rec(img, HDR_SIZE + ino as usize * INODE_SIZE)
}

fn read_inode(k: &mut Kernel, id: InodeId) -> KResult<()> {
    let (sb, ino) = {
        let inode = k.itable.get(id);
        (inode.sb, inode.ino)
    };
    let rec = rom_inode(k, sb, ino)?;
    let itype = match rec.ftype {
        ROM_FT_DIR => IType::Directory,
        ROM_FT_FILE => IType::Regular,
        ROM_FT_SYMLINK => IType::Symlink,
        _ => return Err(Errno::Io),
    };
    let inode = k.itable.get_mut(id);
    inode.itype = itype;
    inode.mode = FileMode::from_bits_truncate(rec.mode);
    inode.uid = rec.uid;
    inode.gid = rec.gid;
    inode.size = rec.size as usize;
    Ok(())
}

static INODE_OPS: InodeOps = InodeOps {
    lookup,
    readlink,
    create: None,
    link: None,
    unlink: None,
    symlink: None,
    mkdir: None,
    rmdir: None,
    rename: None,
    truncate: None,
};

fn name_matches(entry: &RomDentry, name: &[u8]) -> bool {
    if name.len() > DIRSIZ {
        return false;
    }
    let stored = {
        let len = entry.name.iter().position(|b| *b == 0).unwrap_or(DIRSIZ);
        &entry.name[..len]
    };
    stored == name
}

fn lookup(k: &mut Kernel, dir: InodeId, name: &[u8]) -> KResult<Ino> {
    let (sb, dir_ino) = {
        let inode = k.itable.get(dir);
        (inode.sb, inode.ino)
    };
    let img = image(k, sb);
    let sup: RomSuper = read_rec(img, 0)?;
    let base = HDR_SIZE + sup.ninode as usize * INODE_SIZE;
    for i in 0..sup.ndentry as usize {
        let entry: RomDentry = read_rec(img, base + i * DENTRY_SIZE)?;
        if entry.parent == dir_ino && name_matches(&entry, name) {
            return Ok(entry.ino);
        }
    }
    Err(Errno::NotFound)
}

fn readlink(k: &mut Kernel, id: InodeId) -> KResult<PathBuf> {
    let (sb, ino, size) = {
        let inode = k.itable.get(id);
        (inode.sb, inode.ino, inode.size)
    };
    let rec = rom_inode(k, sb, ino)?;
    let img = image(k, sb);
    let off = rec.offset as usize;
    let end = off.checked_add(size).ok_or(Errno::Io)?;
    if end > img.len() {
        return Err(Errno::Io);
    }
    PathBuf::from_bytes(&img[off..end])
}

static FILE_OPS: FileOps = FileOps {
    open: None,
    release: None,
    read,
    write,
    readdir,
    ioctl: None,
};

fn read(k: &mut Kernel, fid: FileId, buf: &mut [u8], pos: &mut usize) -> KResult<usize> {
    let (sb, ino, size) = {
        let inode = k.itable.get(k.ftable.get(fid).inode);
        (inode.sb, inode.ino, inode.size)
    };
    let rec = rom_inode(k, sb, ino)?;
    let img = image(k, sb);
    if *pos >= size {
        return Ok(0);
    }
    let n = buf.len().min(size - *pos);
    let start = rec.offset as usize + *pos;
    let end = start.checked_add(n).ok_or(Errno::Io)?;
    if end > img.len() {
        return Err(Errno::Io);
    }
    buf[..n].copy_from_slice(&img[start..end]);
    *pos += n;
    Ok(n)
}

fn write(_: &mut Kernel, _: FileId, _: &[u8], _: &mut usize) -> KResult<usize> {
    Err(Errno::NotPermitted)
}

/// Iterates the dentry table; the index is the dentry slot of the last
/// entry returned, which is stable across calls.
fn readdir(k: &mut Kernel, fid: FileId, dirent: &mut Dirent) -> KResult<()> {
    let (sb, dir_ino) = {
        let inode = k.itable.get(k.ftable.get(fid).inode);
        (inode.sb, inode.ino)
    };
    let img = image(k, sb);
    let sup: RomSuper = read_rec(img, 0)?;
    let base = HDR_SIZE + sup.ninode as usize * INODE_SIZE;
    let start = if dirent.index < 0 {
        0
    } else {
        dirent.index as usize + 1
    };
    for i in start..sup.ndentry as usize {
        let entry: RomDentry = read_rec(img, base + i * DENTRY_SIZE)?;
        if entry.parent == dir_ino {
            dirent.ino = entry.ino;
            dirent.index = i as i32;
            let name_len = entry.name.iter().position(|b| *b == 0).unwrap_or(DIRSIZ);
            dirent.set_name(&entry.name[..name_len]);
            return Ok(());
        }
    }
    Err(Errno::NotFound)
}

/// Builds romfs images in memory, for boot-image tools and tests.
#[cfg(any(test, feature = "std"))]
pub mod image {
    use super::*;

    pub struct ImageBuilder {
        inodes: Vec<RomInode>,
        dentries: Vec<RomDentry>,
        content: Vec<u8>,
    }

    impl ImageBuilder {
        /// Starts an image holding just the root directory (inode 0).
        pub fn new() -> Self {
            Self {
                inodes: vec![RomInode {
                    ftype: ROM_FT_DIR,
                    mode: 0o755,
                    uid: 0,
                    gid: 0,
                    size: 0,
                    offset: 0,
                }],
                dentries: Vec::new(),
                content: Vec::new(),
            }
        }

        fn add_inode(&mut self, inode: RomInode) -> Ino {
            self.inodes.push(inode);
            (self.inodes.len() - 1) as Ino
        }

        fn add_dentry(&mut self, parent: Ino, name: &[u8], ino: Ino) {
            assert!(name.len() <= DIRSIZ, "name too long for image");
            let mut d = RomDentry {
                name: [0; DIRSIZ],
                ino,
                parent,
            };
            d.name[..name.len()].copy_from_slice(name);
            self.dentries.push(d);
        }

        pub fn add_dir(&mut self, parent: Ino, name: &[u8], mode: u16) -> Ino {
            let ino = self.add_inode(RomInode {
                ftype: ROM_FT_DIR,
                mode,
                uid: 0,
                gid: 0,
                size: 0,
                offset: 0,
            });
            self.add_dentry(parent, name, ino);
            ino
        }

        pub fn add_file(&mut self, parent: Ino, name: &[u8], mode: u16, content: &[u8]) -> Ino {
            let offset = self.content.len() as u32;
            self.content.extend_from_slice(content);
            let ino = self.add_inode(RomInode {
                ftype: ROM_FT_FILE,
                mode,
                uid: 0,
                gid: 0,
                size: content.len() as u32,
                offset,
            });
            self.add_dentry(parent, name, ino);
            ino
        }

        pub fn add_file_owned(
            &mut self,
            parent: Ino,
            name: &[u8],
            mode: u16,
            uid: u32,
            gid: u32,
            content: &[u8],
        ) -> Ino {
            let ino = self.add_file(parent, name, mode, content);
            let rec = &mut self.inodes[ino as usize];
            rec.uid = uid;
            rec.gid = gid;
            ino
        }

        pub fn add_symlink(&mut self, parent: Ino, name: &[u8], target: &[u8]) -> Ino {
            let offset = self.content.len() as u32;
            self.content.extend_from_slice(target);
            let ino = self.add_inode(RomInode {
                ftype: ROM_FT_SYMLINK,
                mode: 0o777,
                uid: 0,
                gid: 0,
                size: target.len() as u32,
                offset,
            });
            self.add_dentry(parent, name, ino);
            ino
        }

        /// Serializes the image. Content offsets are fixed up to be
        /// image-relative.
        pub fn build(mut self) -> Vec<u8> {
            let tables = HDR_SIZE
                + self.inodes.len() * INODE_SIZE
                + self.dentries.len() * DENTRY_SIZE;
            for inode in self.inodes.iter_mut() {
                if inode.ftype != ROM_FT_DIR {
                    inode.offset += tables as u32;
                }
            }
            // Directory sizes report their entry counts.
            for i in 0..self.inodes.len() {
                if self.inodes[i].ftype == ROM_FT_DIR {
                    let n = self
                        .dentries
                        .iter()
                        .filter(|d| d.parent == i as u32)
                        .count();
                    self.inodes[i].size = n as u32;
                }
            }

            let size = tables + self.content.len();
            let sup = RomSuper {
                magic: ROMFS_MAGIC,
                ninode: self.inodes.len() as u32,
                ndentry: self.dentries.len() as u32,
                size: size as u32,
            };
            let mut out = Vec::with_capacity(size);
            out.extend_from_slice(sup.as_bytes());
            for inode in &self.inodes {
                out.extend_from_slice(inode.as_bytes());
            }
            for d in &self.dentries {
                out.extend_from_slice(d.as_bytes());
            }
            out.extend_from_slice(&self.content);
            out
        }
    }
}
