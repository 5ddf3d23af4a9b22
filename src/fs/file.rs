//! The system-wide open-file pool and the VFS open/read/write/close
//! pipeline.

use array_macro::array;

use crate::{
    err::{Errno, KResult},
    fs::{
        inode::check_permission, Dirent, FileId, FileOps, FileMode, InodeId, IType, OpenFlags,
        PathBuf, PERM_R, PERM_W,
    },
    kernel::Kernel,
    param::NFILE,
};

/// An open file: shared by every fd that `dup`ed it.
pub struct OpenFile {
    pub inode: InodeId,
    /// File descriptors referencing this slot.
    pub open_count: u32,
    pub flags: OpenFlags,
    pub pos: usize,
    /// Possibly driver-specialized at open time; defaults to the inode's.
    pub f_op: &'static FileOps,
    /// Driver cookie.
    pub private: usize,
}

/// The fixed pool of open files.
pub struct FileTable {
    slots: [Option<OpenFile>; NFILE],
}

impl FileTable {
    pub fn new() -> Self {
        Self {
            slots: array![_ => None; NFILE],
        }
    }

    pub fn get(&self, id: FileId) -> &OpenFile {
        self.slots[id.0].as_ref().expect("ftable: empty slot")
    }

    pub fn get_mut(&mut self, id: FileId) -> &mut OpenFile {
        self.slots[id.0].as_mut().expect("ftable: empty slot")
    }

    fn insert(&mut self, file: OpenFile) -> KResult<FileId> {
        let i = self
            .slots
            .iter()
            .position(|s| s.is_none())
            .ok_or(Errno::NoFiles)?;
        self.slots[i] = Some(file);
        Ok(FileId(i))
    }

    /// Populated slots, for the accounting invariants.
    pub fn live_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// Σ reference counts across all open files.
    pub fn total_refs(&self) -> usize {
        self.slots
            .iter()
            .flatten()
            .map(|f| f.open_count as usize)
            .sum()
    }
}

/// `lseek` whence values.
pub const SEEK_SET: usize = 0;
pub const SEEK_CUR: usize = 1;
pub const SEEK_END: usize = 2;

impl Kernel {
    /// Opens `path` for `(uid, gid)`. Returns a held open file; fd
    /// installation is the caller's business.
    pub fn file_open(
        &mut self,
        path: &PathBuf,
        flags: OpenFlags,
        mode: FileMode,
        uid: u32,
        gid: u32,
    ) -> KResult<FileId> {
        let ip = match self.namei(path, !flags.contains(OpenFlags::NOFOLLOW)) {
            Ok(ip) => {
                if flags.contains(OpenFlags::CREATE | OpenFlags::EXCLUSIVE) {
                    let _ = self.iput(ip);
                    return Err(Errno::Exists);
                }
                ip
            }
            Err(Errno::NotFound) if flags.contains(OpenFlags::CREATE) => {
                self.create_at(path, mode, uid, gid)?
            }
            Err(e) => return Err(e),
        };

        // Access checks against the open mode.
        let check = (|| {
            let inode = self.itable.get(ip);
            if inode.itype == IType::Symlink {
                // Only reachable with O_NOFOLLOW.
                return Err(Errno::Loop);
            }
            let mut want = 0;
            if flags.readable() {
                want |= PERM_R;
            }
            if flags.writable() {
                want |= PERM_W;
            }
            check_permission(inode, uid, gid, want)?;
            if inode.itype == IType::Directory && flags.writable() {
                return Err(Errno::IsDir);
            }
            Ok(())
        })();
        if let Err(e) = check {
            let _ = self.iput(ip);
            return Err(e);
        }

        if flags.contains(OpenFlags::TRUNC)
            && flags.writable()
            && self.itable.get(ip).itype == IType::Regular
        {
            let truncate = self.itable.get(ip).i_op.truncate;
            let res = match truncate {
                Some(t) => t(self, ip, 0),
                None => Err(Errno::NotPermitted),
            };
            if let Err(e) = res {
                let _ = self.iput(ip);
                return Err(e);
            }
        }

        self.file_open_inode(ip, flags)
    }

    /// Steps 2..5 of the open pipeline on an already-held inode. Consumes
    /// the hold: on success it backs the open file, on failure it is
    /// released.
    pub fn file_open_inode(&mut self, ip: InodeId, flags: OpenFlags) -> KResult<FileId> {
        let f_op = self.itable.get(ip).f_op;
        let fid = match self.ftable.insert(OpenFile {
            inode: ip,
            open_count: 1,
            flags,
            pos: 0,
            f_op,
            private: 0,
        }) {
            Ok(fid) => fid,
            Err(e) => {
                let _ = self.iput(ip);
                return Err(e);
            }
        };

        if let Some(open) = f_op.open {
            if let Err(e) = open(self, ip, fid) {
                self.ftable.slots[fid.0] = None;
                let _ = self.iput(ip);
                return Err(e);
            }
        }

        if let Some(m) = self.fstab.mount_of_sb(self.itable.get(ip).sb) {
            self.fstab.mount_mut(m).open_count += 1;
        }
        Ok(fid)
    }

    /// `O_CREATE` resolution miss: ask the parent directory's driver for a
    /// fresh inode. Read-only drivers carry no `create` hook.
    fn create_at(
        &mut self,
        path: &PathBuf,
        mode: FileMode,
        uid: u32,
        gid: u32,
    ) -> KResult<InodeId> {
        let name = match path.file_name() {
            Some(n) => n,
            None => return Err(Errno::BadArg),
        };
        let parent = self.namei(&path.parent(), true)?;
        let res = (|| {
            let dir = self.itable.get(parent);
            if dir.itype != IType::Directory {
                return Err(Errno::NotDir);
            }
            check_permission(dir, uid, gid, PERM_W)?;
            dir.i_op.create.ok_or(Errno::NotPermitted)
        })();
        let (create, sb) = match res {
            Ok(c) => (c, self.itable.get(parent).sb),
            Err(e) => {
                let _ = self.iput(parent);
                return Err(e);
            }
        };
        let ino = create(self, parent, name, mode);
        self.iput(parent)?;
        self.iget(sb, ino?)
    }

    /// Drops one fd reference; the last one releases the file and its inode.
    /// Driver errors propagate but never leak the slot.
    pub fn file_close(&mut self, fid: FileId) -> KResult<()> {
        let file = self.ftable.get_mut(fid);
        file.open_count -= 1;
        if file.open_count > 0 {
            return Ok(());
        }
        let ip = file.inode;
        let release = file.f_op.release;
        let mut result = Ok(());
        if let Some(release) = release {
            result = release(self, ip, fid);
        }
        self.ftable.slots[fid.0] = None;
        if let Some(m) = self.fstab.mount_of_sb(self.itable.get(ip).sb) {
            self.fstab.mount_mut(m).open_count -= 1;
        }
        match self.iput(ip) {
            Err(e) if result.is_ok() => result = Err(e),
            _ => {}
        }
        result
    }

    /// Reads at the file position, advancing it.
    pub fn file_read(&mut self, fid: FileId, buf: &mut [u8]) -> KResult<usize> {
        let (read, mut pos) = {
            let file = self.ftable.get(fid);
            if !file.flags.readable() {
                return Err(Errno::BadFd);
            }
            if self.itable.get(file.inode).itype == IType::Directory {
                return Err(Errno::IsDir);
            }
            (file.f_op.read, file.pos)
        };
        let n = read(self, fid, buf, &mut pos)?;
        self.ftable.get_mut(fid).pos = pos;
        Ok(n)
    }

    /// Positional read; the file position is untouched.
    pub fn file_pread(&mut self, fid: FileId, buf: &mut [u8], off: usize) -> KResult<usize> {
        let read = self.ftable.get(fid).f_op.read;
        let mut pos = off;
        read(self, fid, buf, &mut pos)
    }

    /// Writes at the file position, advancing it.
    pub fn file_write(&mut self, fid: FileId, buf: &[u8]) -> KResult<usize> {
        let (write, mut pos) = {
            let file = self.ftable.get(fid);
            if !file.flags.writable() {
                return Err(Errno::BadFd);
            }
            if self.itable.get(file.inode).itype == IType::Directory {
                return Err(Errno::IsDir);
            }
            let pos = if file.flags.contains(OpenFlags::APPEND) {
                self.itable.get(file.inode).size
            } else {
                file.pos
            };
            (file.f_op.write, pos)
        };
        let n = write(self, fid, buf, &mut pos)?;
        self.ftable.get_mut(fid).pos = pos;
        Ok(n)
    }

    /// One directory entry per call; `NotFound` ends the iteration.
    pub fn file_readdir(&mut self, fid: FileId, dirent: &mut Dirent) -> KResult<()> {
        let readdir = {
            let file = self.ftable.get(fid);
            if self.itable.get(file.inode).itype != IType::Directory {
                return Err(Errno::NotDir);
            }
            file.f_op.readdir
        };
        readdir(self, fid, dirent)
    }

    pub fn file_lseek(&mut self, fid: FileId, off: isize, whence: usize) -> KResult<usize> {
        let size = self.itable.get(self.ftable.get(fid).inode).size;
        let file = self.ftable.get_mut(fid);
        let base = match whence {
            SEEK_SET => 0,
            SEEK_CUR => file.pos as isize,
            SEEK_END => size as isize,
            _ => return Err(Errno::BadArg),
        };
        let newpos = base.checked_add(off).ok_or(Errno::BadArg)?;
        if newpos < 0 {
            return Err(Errno::BadArg);
        }
        file.pos = newpos as usize;
        Ok(file.pos)
    }

    pub fn file_ioctl(&mut self, fid: FileId, cmd: u32, arg: usize) -> KResult<usize> {
        let ioctl = self.ftable.get(fid).f_op.ioctl.ok_or(Errno::BadArg)?;
        ioctl(self, fid, cmd, arg)
    }
}
