//! File, directory and mount system calls.

use zerocopy::{AsBytes, FromBytes};

use crate::{
    err::{Errno, KResult},
    fs::{
        inode::check_permission, stat::Stat, Dirent, FileMode, InodeId, IType, MountFlags,
        OpenFlags, PathBuf, PERM_W, PERM_X,
    },
    kernel::Kernel,
    param::{FS_NAME_MAX, NOFILE, PATH_MAX},
    proc::FdEntry,
};

/// Kernel side of the libc `struct mount_opts` argument.
#[derive(Clone, Copy, Default, AsBytes, FromBytes)]
#[repr(C)]
struct MountArgs {
    source: u32,
    mountflags: u32,
    opts: u32,
}

/// I/O staging buffer between user memory and the drivers.
const IOBUF: usize = 512;

impl Kernel {
    fn ids(&self) -> (u32, u32) {
        let t = self.tasks.current();
        (t.uid, t.gid)
    }

    pub(super) fn sys_open(&mut self, patha: usize, flags: usize, mode: usize) -> KResult<usize> {
        let path = self.fetch_path(patha)?;
        let flags = OpenFlags::from_bits_truncate(flags as u32);
        let mode = FileMode::from_bits_truncate(mode as u16) & FileMode::RWX_ALL;
        let (uid, gid) = self.ids();
        let fid = self.file_open(&path, flags, mode, uid, gid)?;
        let entry = FdEntry {
            file: fid,
            cloexec: flags.contains(OpenFlags::CLOEXEC),
        };
        match self.tasks.current_mut().fd_install(entry) {
            Ok(fd) => Ok(fd),
            Err(e) => {
                let _ = self.file_close(fid);
                Err(e)
            }
        }
    }

    pub(super) fn sys_close(&mut self, fd: usize) -> KResult<usize> {
        let entry = self.tasks.current_mut().fd_take(fd)?;
        self.file_close(entry.file)?;
        Ok(0)
    }

    pub(super) fn sys_read(&mut self, fd: usize, bufp: usize, count: usize) -> KResult<usize> {
        let fid = self.tasks.current().fd_get(fd)?;
        let pid = self.tasks.current;
        let mut kbuf = [0u8; IOBUF];
        let mut done = 0;
        while done < count {
            let want = (count - done).min(IOBUF);
            let got = match self.file_read(fid, &mut kbuf[..want]) {
                Ok(n) => n,
                Err(e) if done == 0 => return Err(e),
                Err(_) => break,
            };
            if got == 0 {
                break;
            }
            match self.copy_out_bytes(pid, bufp + done, &kbuf[..got]) {
                Ok(()) => {}
                Err(e) if done == 0 => return Err(e),
                Err(_) => break,
            }
            done += got;
            if got < want {
                break;
            }
        }
        Ok(done)
    }

    pub(super) fn sys_write(&mut self, fd: usize, bufp: usize, count: usize) -> KResult<usize> {
        let fid = self.tasks.current().fd_get(fd)?;
        let pid = self.tasks.current;
        let mut kbuf = [0u8; IOBUF];
        let mut done = 0;
        while done < count {
            let want = (count - done).min(IOBUF);
            match self.copy_in_bytes(pid, &mut kbuf[..want], bufp + done) {
                Ok(()) => {}
                Err(e) if done == 0 => return Err(e),
                Err(_) => break,
            }
            let put = match self.file_write(fid, &kbuf[..want]) {
                Ok(n) => n,
                Err(e) if done == 0 => return Err(e),
                Err(_) => break,
            };
            if put == 0 {
                break;
            }
            done += put;
            if put < want {
                break;
            }
        }
        Ok(done)
    }

    pub(super) fn sys_lseek(&mut self, fd: usize, off: usize, whence: usize) -> KResult<usize> {
        let fid = self.tasks.current().fd_get(fd)?;
        self.file_lseek(fid, off as isize, whence)
    }

    pub(super) fn sys_getdents(&mut self, fd: usize, direntp: usize) -> KResult<usize> {
        let fid = self.tasks.current().fd_get(fd)?;
        let pid = self.tasks.current;
        let mut dirent: Dirent = self.copy_in(pid, direntp)?;
        self.file_readdir(fid, &mut dirent)?;
        self.copy_out(pid, direntp, &dirent)?;
        Ok(0)
    }

    pub(super) fn sys_ioctl(&mut self, fd: usize, cmd: usize, arg: usize) -> KResult<usize> {
        let fid = self.tasks.current().fd_get(fd)?;
        self.file_ioctl(fid, cmd as u32, arg)
    }

    pub(super) fn sys_dup(&mut self, fd: usize) -> KResult<usize> {
        let fid = self.tasks.current().fd_get(fd)?;
        let entry = FdEntry {
            file: fid,
            cloexec: false,
        };
        let newfd = self.tasks.current_mut().fd_install(entry)?;
        self.ftable.get_mut(fid).open_count += 1;
        Ok(newfd)
    }

    pub(super) fn sys_dup2(&mut self, fd: usize, newfd: usize) -> KResult<usize> {
        let fid = self.tasks.current().fd_get(fd)?;
        if newfd >= NOFILE {
            return Err(Errno::BadFd);
        }
        if newfd == fd {
            return Ok(newfd);
        }
        if let Ok(old) = self.tasks.current_mut().fd_take(newfd) {
            let _ = self.file_close(old.file);
        }
        self.tasks.current_mut().files[newfd] = Some(FdEntry {
            file: fid,
            cloexec: false,
        });
        self.ftable.get_mut(fid).open_count += 1;
        Ok(newfd)
    }

    pub(super) fn sys_mount(&mut self, typep: usize, targetp: usize, optsp: usize) -> KResult<usize> {
        let mut typebuf = [0u8; FS_NAME_MAX + 1];
        let typelen = self.fetch_str(typep, &mut typebuf)?.len();
        let target = self.fetch_path(targetp)?;
        let pid = self.tasks.current;
        let margs: MountArgs = if optsp != 0 {
            self.copy_in(pid, optsp)?
        } else {
            MountArgs::default()
        };
        let mut optbuf = [0u8; 64];
        let opts_len = if margs.opts != 0 {
            self.fetch_str(margs.opts as usize, &mut optbuf)?.len()
        } else {
            0
        };
        let (uid, gid) = self.ids();
        self.mount(
            &typebuf[..typelen],
            &target,
            MountFlags::from_bits_truncate(margs.mountflags),
            margs.source as usize,
            &optbuf[..opts_len],
            uid,
            gid,
        )?;
        Ok(0)
    }

    pub(super) fn sys_umount(&mut self, targetp: usize) -> KResult<usize> {
        let target = self.fetch_path(targetp)?;
        let (uid, gid) = self.ids();
        self.umount(&target, uid, gid)?;
        Ok(0)
    }

    fn stat_path(&mut self, patha: usize, bufp: usize, follow: bool) -> KResult<usize> {
        let path = self.fetch_path(patha)?;
        let ip = self.namei(&path, follow)?;
        let st = Stat::from_inode(self.itable.get(ip));
        self.iput(ip)?;
        let pid = self.tasks.current;
        self.copy_out(pid, bufp, &st)?;
        Ok(0)
    }

    pub(super) fn sys_stat(&mut self, patha: usize, bufp: usize) -> KResult<usize> {
        self.stat_path(patha, bufp, true)
    }

    pub(super) fn sys_lstat(&mut self, patha: usize, bufp: usize) -> KResult<usize> {
        self.stat_path(patha, bufp, false)
    }

    pub(super) fn sys_fstat(&mut self, fd: usize, bufp: usize) -> KResult<usize> {
        let fid = self.tasks.current().fd_get(fd)?;
        let st = Stat::from_inode(self.itable.get(self.ftable.get(fid).inode));
        let pid = self.tasks.current;
        self.copy_out(pid, bufp, &st)?;
        Ok(0)
    }

    /// Attribute change on a held inode: owner (or root) only, and the
    /// driver must be able to persist it.
    fn setattr(
        &mut self,
        ip: InodeId,
        f: impl FnOnce(&mut crate::fs::Inode),
        owner_only: bool,
    ) -> KResult<()> {
        let (uid, _) = self.ids();
        let inode = self.itable.get(ip);
        if owner_only && uid != 0 && uid != inode.uid {
            return Err(Errno::NotPermitted);
        }
        let write_inode = self
            .fstab
            .sb(inode.sb)
            .s_op
            .write_inode
            .ok_or(Errno::NotPermitted)?;
        f(self.itable.get_mut(ip));
        write_inode(self, ip)
    }

    pub(super) fn sys_chmod(&mut self, patha: usize, mode: usize) -> KResult<usize> {
        let path = self.fetch_path(patha)?;
        let ip = self.namei(&path, true)?;
        let mode = FileMode::from_bits_truncate(mode as u16) & FileMode::RWX_ALL;
        let res = self.setattr(ip, |i| i.mode = mode, true);
        self.iput(ip)?;
        res.map(|_| 0)
    }

    pub(super) fn sys_fchmod(&mut self, fd: usize, mode: usize) -> KResult<usize> {
        let fid = self.tasks.current().fd_get(fd)?;
        let ip = self.ftable.get(fid).inode;
        let mode = FileMode::from_bits_truncate(mode as u16) & FileMode::RWX_ALL;
        self.setattr(ip, |i| i.mode = mode, true).map(|_| 0)
    }

    pub(super) fn sys_chown(&mut self, patha: usize, uid: usize, gid: usize) -> KResult<usize> {
        if self.ids().0 != 0 {
            return Err(Errno::NotPermitted);
        }
        let path = self.fetch_path(patha)?;
        let ip = self.namei(&path, true)?;
        let res = self.setattr(
            ip,
            |i| {
                i.uid = uid as u32;
                i.gid = gid as u32;
            },
            false,
        );
        self.iput(ip)?;
        res.map(|_| 0)
    }

    pub(super) fn sys_fchown(&mut self, fd: usize, uid: usize, gid: usize) -> KResult<usize> {
        if self.ids().0 != 0 {
            return Err(Errno::NotPermitted);
        }
        let fid = self.tasks.current().fd_get(fd)?;
        let ip = self.ftable.get(fid).inode;
        self.setattr(
            ip,
            |i| {
                i.uid = uid as u32;
                i.gid = gid as u32;
            },
            false,
        )
        .map(|_| 0)
    }

    /// Resolves `path`'s parent directory, checks it is writable, and runs
    /// `f` with the held parent and the final name.
    fn dir_op<T>(
        &mut self,
        path: &PathBuf,
        f: impl FnOnce(&mut Self, InodeId, &[u8]) -> KResult<T>,
    ) -> KResult<T> {
        let mut namebuf = [0u8; PATH_MAX];
        let name_len = {
            let name = path.file_name().ok_or(Errno::BadArg)?;
            namebuf[..name.len()].copy_from_slice(name);
            name.len()
        };
        let parent = self.namei(&path.parent(), true)?;
        let check = (|| {
            let dir = self.itable.get(parent);
            if dir.itype != IType::Directory {
                return Err(Errno::NotDir);
            }
            let (uid, gid) = self.ids();
            check_permission(dir, uid, gid, PERM_W)
        })();
        let res = match check {
            Ok(()) => f(self, parent, &namebuf[..name_len]),
            Err(e) => Err(e),
        };
        self.iput(parent)?;
        res
    }

    pub(super) fn sys_unlink(&mut self, patha: usize) -> KResult<usize> {
        let path = self.fetch_path(patha)?;
        self.dir_op(&path, |k, dir, name| {
            let unlink = k.itable.get(dir).i_op.unlink.ok_or(Errno::NotPermitted)?;
            unlink(k, dir, name)
        })
        .map(|_| 0)
    }

    pub(super) fn sys_link(&mut self, oldp: usize, newp: usize) -> KResult<usize> {
        let old = self.fetch_path(oldp)?;
        let new = self.fetch_path(newp)?;
        let target = self.namei(&old, false)?;
        let res = self.dir_op(&new, |k, dir, name| {
            let link = k.itable.get(dir).i_op.link.ok_or(Errno::NotPermitted)?;
            link(k, dir, name, target)
        });
        self.iput(target)?;
        res.map(|_| 0)
    }

    pub(super) fn sys_symlink(&mut self, targetp: usize, linkp: usize) -> KResult<usize> {
        let mut targetbuf = [0u8; PATH_MAX + 1];
        let target_len = self.fetch_str(targetp, &mut targetbuf)?.len();
        let link = self.fetch_path(linkp)?;
        self.dir_op(&link, |k, dir, name| {
            let symlink = k.itable.get(dir).i_op.symlink.ok_or(Errno::NotPermitted)?;
            symlink(k, dir, name, &targetbuf[..target_len])
        })
        .map(|_| 0)
    }

    pub(super) fn sys_mkdir(&mut self, patha: usize, mode: usize) -> KResult<usize> {
        let path = self.fetch_path(patha)?;
        let mode = FileMode::from_bits_truncate(mode as u16) & FileMode::RWX_ALL;
        self.dir_op(&path, |k, dir, name| {
            let mkdir = k.itable.get(dir).i_op.mkdir.ok_or(Errno::NotPermitted)?;
            mkdir(k, dir, name, mode)
        })
        .map(|_| 0)
    }

    pub(super) fn sys_rmdir(&mut self, patha: usize) -> KResult<usize> {
        let path = self.fetch_path(patha)?;
        self.dir_op(&path, |k, dir, name| {
            let rmdir = k.itable.get(dir).i_op.rmdir.ok_or(Errno::NotPermitted)?;
            rmdir(k, dir, name)
        })
        .map(|_| 0)
    }

    pub(super) fn sys_rename(&mut self, oldp: usize, newp: usize) -> KResult<usize> {
        let old = self.fetch_path(oldp)?;
        let new = self.fetch_path(newp)?;
        let newdir = self.namei(&new.parent(), true)?;
        let res = self.dir_op(&old, |k, dir, name| {
            let rename = k.itable.get(dir).i_op.rename.ok_or(Errno::NotPermitted)?;
            let newname = new.file_name().ok_or(Errno::BadArg)?;
            rename(k, dir, name, newdir, newname)
        });
        self.iput(newdir)?;
        res.map(|_| 0)
    }

    pub(super) fn sys_truncate(&mut self, patha: usize, len: usize) -> KResult<usize> {
        let path = self.fetch_path(patha)?;
        let ip = self.namei(&path, true)?;
        let res = (|| {
            let inode = self.itable.get(ip);
            if inode.itype != IType::Regular {
                return Err(Errno::BadArg);
            }
            let (uid, gid) = self.ids();
            check_permission(inode, uid, gid, PERM_W)?;
            inode.i_op.truncate.ok_or(Errno::NotPermitted)
        })();
        let res = match res {
            Ok(truncate) => truncate(self, ip, len),
            Err(e) => Err(e),
        };
        self.iput(ip)?;
        res.map(|_| 0)
    }

    pub(super) fn sys_ftruncate(&mut self, fd: usize, len: usize) -> KResult<usize> {
        let fid = self.tasks.current().fd_get(fd)?;
        if !self.ftable.get(fid).flags.writable() {
            return Err(Errno::BadFd);
        }
        let ip = self.ftable.get(fid).inode;
        let truncate = self.itable.get(ip).i_op.truncate.ok_or(Errno::NotPermitted)?;
        truncate(self, ip, len)?;
        Ok(0)
    }

    pub(super) fn sys_readlink(&mut self, patha: usize, bufp: usize, size: usize) -> KResult<usize> {
        let path = self.fetch_path(patha)?;
        let ip = self.namei(&path, false)?;
        let res = (|| {
            if self.itable.get(ip).itype != IType::Symlink {
                return Err(Errno::BadArg);
            }
            let readlink = self.itable.get(ip).i_op.readlink;
            Ok(readlink)
        })();
        let res = match res {
            Ok(readlink) => readlink(self, ip),
            Err(e) => Err(e),
        };
        self.iput(ip)?;
        let target = res?;
        let n = target.len().min(size);
        let pid = self.tasks.current;
        self.copy_out_bytes(pid, bufp, &target.as_bytes()[..n])?;
        Ok(n)
    }

    pub(super) fn sys_getcwd(&mut self, bufp: usize, size: usize) -> KResult<usize> {
        let cwd = self.tasks.current().cwd.clone();
        let n = cwd.len();
        if n + 1 > size {
            return Err(Errno::NameTooLong);
        }
        let pid = self.tasks.current;
        self.copy_out_bytes(pid, bufp, cwd.as_bytes())?;
        self.copy_out_bytes(pid, bufp + n, &[0])?;
        Ok(n + 1)
    }

    pub(super) fn sys_chdir(&mut self, patha: usize) -> KResult<usize> {
        let path = self.fetch_path(patha)?;
        let ip = self.namei(&path, true)?;
        let check = (|| {
            let inode = self.itable.get(ip);
            if inode.itype != IType::Directory {
                return Err(Errno::NotDir);
            }
            let (uid, gid) = self.ids();
            check_permission(inode, uid, gid, PERM_X)
        })();
        self.iput(ip)?;
        check?;
        self.tasks.current_mut().cwd = path;
        Ok(0)
    }
}
