//! The device-node filesystem.
//!
//! Character drivers register a `DevOps` record in the kernel's device
//! switch; devfs then exposes each registered driver as an inode named after
//! it. Inode number 0 is the synthetic root directory, device n lives at
//! inode n + 1.

use array_macro::array;

use crate::{
    err::{Errno, KResult},
    fs::{
        Dirent, FileId, FileMode, FileOps, FsType, Ino, InodeId, InodeOps, IType, MountFlags,
        SbId, SuperOps, Superblock,
    },
    kernel::Kernel,
    param::NDEV,
    proc::SleepReason,
};

/// Operations of one character driver.
pub struct DevOps {
    pub name: &'static str,
    pub open: Option<fn(&mut Kernel, FileId) -> KResult<()>>,
    pub read: fn(&mut Kernel, FileId, &mut [u8]) -> KResult<usize>,
    pub write: fn(&mut Kernel, FileId, &[u8]) -> KResult<usize>,
    pub ioctl: Option<fn(&mut Kernel, FileId, u32, usize) -> KResult<usize>>,
}

/// A registered driver plus its mutable node attributes.
pub struct DevSlot {
    pub ops: &'static DevOps,
    pub mode: FileMode,
    pub uid: u32,
    pub gid: u32,
}

/// Map major device number to device functions.
pub struct DevSw {
    slots: [Option<DevSlot>; NDEV],
}

impl DevSw {
    pub fn new() -> Self {
        Self {
            slots: array![_ => None; NDEV],
        }
    }

    pub fn get(&self, major: usize) -> Option<&DevSlot> {
        self.slots.get(major).and_then(|s| s.as_ref())
    }

    pub fn get_mut(&mut self, major: usize) -> Option<&mut DevSlot> {
        self.slots.get_mut(major).and_then(|s| s.as_mut())
    }
}

impl Kernel {
    /// Registers a character driver and returns its major number.
    pub fn register_device(&mut self, ops: &'static DevOps, mode: FileMode) -> KResult<usize> {
        if self
            .devsw
            .slots
            .iter()
            .any(|s| matches!(s, Some(d) if d.ops.name == ops.name))
        {
            return Err(Errno::Exists);
        }
        let major = self
            .devsw
            .slots
            .iter()
            .position(|s| s.is_none())
            .ok_or(Errno::NoSpace)?;
        self.devsw.slots[major] = Some(DevSlot {
            ops,
            mode,
            uid: 0,
            gid: 0,
        });
        Ok(major)
    }
}

pub const FS_TYPE: FsType = FsType {
    name: "devfs",
    get_sb,
    kill_sb,
};

const ROOT_INO: Ino = 0;

fn get_sb(
    k: &mut Kernel,
    fs: usize,
    _flags: MountFlags,
    _source: usize,
    _opts: &[u8],
) -> KResult<SbId> {
    k.fstab.sb_alloc(Superblock {
        fs,
        s_op: &SUPER_OPS,
        root: ROOT_INO,
        open_count: 0,
        private: 0,
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
    write_inode: Some(write_inode),
    drop_inode: None,
};

fn open_inode(k: &mut Kernel, sb: SbId, ino: Ino) -> KResult<InodeId> {
    k.icache_get(sb, ino, &FILE_OPS, &INODE_OPS)
}

fn free_inode(k: &mut Kernel, id: InodeId) -> KResult<()> {
    k.icache_release(id);
    Ok(())
}

/// Populate an inode from the device switch.
fn read_inode(k: &mut Kernel, id: InodeId) -> KResult<()> {
    let ino = k.itable.get(id).ino;
    if ino == ROOT_INO {
        let inode = k.itable.get_mut(id);
        inode.itype = IType::Directory;
        inode.mode = FileMode::from_bits_truncate(0o755);
        return Ok(());
    }
    let major = (ino - 1) as usize;
    let (mode, uid, gid) = match k.devsw.get(major) {
        Some(d) => (d.mode, d.uid, d.gid),
        None => return Err(Errno::NoDevice),
    };
    let inode = k.itable.get_mut(id);
    inode.itype = IType::Device;
    inode.mode = mode;
    inode.uid = uid;
    inode.gid = gid;
    inode.private = major;
    Ok(())
}

/// Node attribute changes (chmod, chown) persist in the device switch.
fn write_inode(k: &mut Kernel, id: InodeId) -> KResult<()> {
    let (ino, mode, uid, gid) = {
        let inode = k.itable.get(id);
        (inode.ino, inode.mode, inode.uid, inode.gid)
    };
    if ino == ROOT_INO {
        return Ok(());
    }
    let slot = k
        .devsw
        .get_mut((ino - 1) as usize)
        .ok_or(Errno::NoDevice)?;
    slot.mode = mode;
    slot.uid = uid;
    slot.gid = gid;
    Ok(())
}

static INODE_OPS: InodeOps = InodeOps {
    lookup,
    readlink: |_, _| Err(Errno::BadArg),
    create: None,
    link: None,
    unlink: None,
    symlink: None,
    mkdir: None,
    rmdir: None,
    rename: None,
    truncate: None,
};

fn lookup(k: &mut Kernel, dir: InodeId, name: &[u8]) -> KResult<Ino> {
    if k.itable.get(dir).ino != ROOT_INO {
        return Err(Errno::NotDir);
    }
    for major in 0..NDEV {
        if let Some(d) = k.devsw.get(major) {
            if d.ops.name.as_bytes() == name {
                return Ok((major + 1) as Ino);
            }
        }
    }
    Err(Errno::NotFound)
}

static FILE_OPS: FileOps = FileOps {
    open: Some(dev_open),
    release: None,
    read,
    write,
    readdir,
    ioctl: Some(ioctl),
};

fn major_of(k: &Kernel, fid: FileId) -> KResult<usize> {
    let ip = k.ftable.get(fid).inode;
    let inode = k.itable.get(ip);
    if inode.itype != IType::Device {
        return Err(Errno::NoDevice);
    }
    Ok(inode.private)
}

fn dev_open(k: &mut Kernel, _ip: InodeId, fid: FileId) -> KResult<()> {
    let major = major_of(k, fid)?;
    let ops = k.devsw.get(major).ok_or(Errno::NoDevice)?.ops;
    if let Some(open) = ops.open {
        open(k, fid)?;
    }
    Ok(())
}

fn read(k: &mut Kernel, fid: FileId, buf: &mut [u8], _pos: &mut usize) -> KResult<usize> {
    let major = major_of(k, fid)?;
    let ops = k.devsw.get(major).ok_or(Errno::NoDevice)?.ops;
    (ops.read)(k, fid, buf)
}

fn write(k: &mut Kernel, fid: FileId, buf: &[u8], _pos: &mut usize) -> KResult<usize> {
    let major = major_of(k, fid)?;
    let ops = k.devsw.get(major).ok_or(Errno::NoDevice)?.ops;
    (ops.write)(k, fid, buf)
}

/// Enumerates the registered devices; the iteration index is the major
/// number of the last entry returned.
fn readdir(k: &mut Kernel, fid: FileId, dirent: &mut Dirent) -> KResult<()> {
    if k.itable.get(k.ftable.get(fid).inode).ino != ROOT_INO {
        return Err(Errno::NotDir);
    }
    let start = if dirent.index < 0 {
        0
    } else {
        dirent.index as usize + 1
    };
    for major in start..NDEV {
        if let Some(d) = k.devsw.get(major) {
            dirent.ino = (major + 1) as Ino;
            dirent.index = major as i32;
            dirent.set_name(d.ops.name.as_bytes());
            return Ok(());
        }
    }
    Err(Errno::NotFound)
}

fn ioctl(k: &mut Kernel, fid: FileId, cmd: u32, arg: usize) -> KResult<usize> {
    let major = major_of(k, fid)?;
    let ops = k.devsw.get(major).ok_or(Errno::NoDevice)?.ops;
    let ioctl = ops.ioctl.ok_or(Errno::BadArg)?;
    ioctl(k, fid, cmd, arg)
}

// In-tree character devices.

/// `/dev/null`: reads see EOF, writes are discarded.
pub static NULL_DEV: DevOps = DevOps {
    name: "null",
    open: None,
    read: |_, _, _| Ok(0),
    write: |_, _, buf| Ok(buf.len()),
    ioctl: None,
};

/// `/dev/zero`: an endless run of zero bytes.
pub static ZERO_DEV: DevOps = DevOps {
    name: "zero",
    open: None,
    read: |_, _, buf| {
        for b in buf.iter_mut() {
            *b = 0;
        }
        Ok(buf.len())
    },
    write: |_, _, buf| Ok(buf.len()),
    ioctl: None,
};

/// `/dev/rtc`: each read completes on the first timer tick after the last
/// one, blocking the caller until then.
pub static RTC_DEV: DevOps = DevOps {
    name: "rtc",
    open: Some(rtc_open),
    read: rtc_read,
    write: |_, _, _| Err(Errno::NotPermitted),
    ioctl: Some(rtc_ioctl),
};

fn rtc_open(k: &mut Kernel, fid: FileId) -> KResult<()> {
    k.ftable.get_mut(fid).private = k.ticks as usize;
    Ok(())
}

fn rtc_read(k: &mut Kernel, fid: FileId, buf: &mut [u8]) -> KResult<usize> {
    let last = k.ftable.get(fid).private as u64;
    if k.ticks <= last {
        k.sleep_current(SleepReason::Io);
        return Err(Errno::Restart);
    }
    k.ftable.get_mut(fid).private = k.ticks as usize;
    if buf.is_empty() {
        return Ok(0);
    }
    buf[0] = 0;
    Ok(1)
}

/// cmd 1: report the current tick counter.
fn rtc_ioctl(k: &mut Kernel, _fid: FileId, cmd: u32, _arg: usize) -> KResult<usize> {
    match cmd {
        1 => Ok(k.ticks as usize),
        _ => Err(Errno::BadArg),
    }
}

/// Registers devfs and the in-tree devices. Boot calls this once.
pub fn install(k: &mut Kernel) -> KResult<()> {
    k.fstab.register_fs(FS_TYPE)?;
    let _ = k.register_device(&NULL_DEV, FileMode::from_bits_truncate(0o666))?;
    let _ = k.register_device(&ZERO_DEV, FileMode::from_bits_truncate(0o666))?;
    let _ = k.register_device(&RTC_DEV, FileMode::from_bits_truncate(0o644))?;
    Ok(())
}
