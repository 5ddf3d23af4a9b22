//! Filesystem registry and mount table.

use array_macro::array;

use crate::{
    err::{Errno, KResult},
    fs::{inode, FsType, IType, MountFlags, PathBuf, SbId, Superblock, PERM_R, PERM_W, PERM_X},
    kernel::Kernel,
    param::{FS_NAME_MAX, NFS, NMOUNT},
};

/// One entry in the mount table. The mountpoint is kept in canonical form
/// with a trailing separator, so prefix matches always fall on component
/// boundaries.
pub struct Mount {
    pub mountpoint: PathBuf,
    pub sb: SbId,
    /// Open files backed by this mount.
    pub open_count: u32,
}

/// The filesystem registry, superblock pool and mount table.
pub struct FsTab {
    drivers: [Option<FsType>; NFS],
    sbs: [Option<Superblock>; NMOUNT],
    mounts: [Option<Mount>; NMOUNT],
}

impl FsTab {
    pub fn new() -> Self {
        Self {
            drivers: array![_ => None; NFS],
            sbs: array![_ => None; NMOUNT],
            mounts: array![_ => None; NMOUNT],
        }
    }

    /// Registers a driver. Names are unique and at most `FS_NAME_MAX` bytes.
    pub fn register_fs(&mut self, fs: FsType) -> KResult<()> {
        if fs.name.is_empty() || fs.name.len() > FS_NAME_MAX {
            return Err(Errno::BadArg);
        }
        let mut avail = None;
        for (i, slot) in self.drivers.iter().enumerate() {
            match slot {
                Some(d) if d.name == fs.name => return Err(Errno::Exists),
                None if avail.is_none() => avail = Some(i),
                _ => {}
            }
        }
        let i = avail.ok_or(Errno::NoFiles)?;
        self.drivers[i] = Some(fs);
        Ok(())
    }

    /// Unregisters a driver, refusing while any superblock still uses it.
    pub fn unregister_fs(&mut self, name: &str) -> KResult<()> {
        let idx = self.get_fs(name.as_bytes())?;
        if self.sbs.iter().flatten().any(|sb| sb.fs == idx) {
            return Err(Errno::Busy);
        }
        self.drivers[idx] = None;
        Ok(())
    }

    /// Linear lookup by name.
    pub fn get_fs(&self, name: &[u8]) -> KResult<usize> {
        self.drivers
            .iter()
            .position(|d| matches!(d, Some(d) if d.name.as_bytes() == name))
            .ok_or(Errno::NotFound)
    }

    pub fn driver(&self, idx: usize) -> &FsType {
        self.drivers[idx].as_ref().expect("fstab: empty driver slot")
    }

    /// Selects the mount whose mountpoint is the longest prefix of `path`,
    /// comparing whole components. Returns the mount slot and the offset of
    /// the suffix the backing filesystem should resolve.
    pub fn find_mount(&self, path: &PathBuf) -> KResult<(usize, usize)> {
        if !path.is_absolute() {
            return Err(Errno::BadArg);
        }
        let bytes = path.as_bytes();
        let mut best: Option<(usize, usize)> = None;
        for (i, m) in self.mounts.iter().enumerate() {
            let m = match m {
                Some(m) => m,
                None => continue,
            };
            let mp = m.mountpoint.as_bytes();
            // The mountpoint carries a trailing '/'; matching against the
            // path extended with a virtual trailing '/' keeps `/abc` from
            // matching a mount of `/abcdef`.
            let matched = if bytes.len() + 1 == mp.len() {
                mp[..bytes.len()] == *bytes
            } else {
                bytes.starts_with(mp)
            };
            if matched && best.map_or(true, |(_, len)| mp.len() > len) {
                best = Some((i, mp.len()));
            }
        }
        let (idx, len) = best.ok_or(Errno::NotFound)?;
        Ok((idx, len.min(bytes.len())))
    }

    pub fn mount(&self, idx: usize) -> &Mount {
        self.mounts[idx].as_ref().expect("fstab: empty mount slot")
    }

    pub fn mount_mut(&mut self, idx: usize) -> &mut Mount {
        self.mounts[idx].as_mut().expect("fstab: empty mount slot")
    }

    /// The mount slot owning `sb`, if it is mounted.
    pub fn mount_of_sb(&self, sb: SbId) -> Option<usize> {
        self.mounts
            .iter()
            .position(|m| matches!(m, Some(m) if m.sb == sb))
    }

    pub fn sb(&self, id: SbId) -> &Superblock {
        self.sbs[id.0].as_ref().expect("fstab: empty sb slot")
    }

    pub fn sb_mut(&mut self, id: SbId) -> &mut Superblock {
        self.sbs[id.0].as_mut().expect("fstab: empty sb slot")
    }

    /// Takes a superblock slot for a driver's `get_sb`.
    pub fn sb_alloc(&mut self, sb: Superblock) -> KResult<SbId> {
        let i = self
            .sbs
            .iter()
            .position(|s| s.is_none())
            .ok_or(Errno::NoFiles)?;
        self.sbs[i] = Some(sb);
        Ok(SbId(i))
    }

    pub fn sb_free(&mut self, id: SbId) {
        self.sbs[id.0] = None;
    }
}

impl Kernel {
    /// Mounts filesystem `fstype` at `target`. Kernel-side entry point of
    /// `sys_mount`; `source` and `opts` pass through to the driver.
    pub fn mount(
        &mut self,
        fstype: &[u8],
        target: &PathBuf,
        flags: MountFlags,
        source: usize,
        opts: &[u8],
        uid: u32,
        gid: u32,
    ) -> KResult<()> {
        if uid != 0 || gid != 0 {
            return Err(Errno::NotPermitted);
        }
        let fs_idx = self.fstab.get_fs(fstype).map_err(|_| Errno::NoDevice)?;
        let target = target.canonicalize()?;

        // Non-root mountpoints must be directories the caller fully owns.
        if target.as_bytes() != b"/" {
            let ip = self.namei(&target, true)?;
            let check = (|| {
                let inode = self.itable.get(ip);
                if inode.itype != IType::Directory {
                    return Err(Errno::NotDir);
                }
                inode::check_permission(inode, uid, gid, PERM_R | PERM_W | PERM_X)
            })();
            let put = self.iput(ip);
            check?;
            put?;
        }

        let mountpoint = target.to_mountpoint()?;
        if self
            .fstab
            .mounts
            .iter()
            .any(|m| matches!(m, Some(m) if m.mountpoint == mountpoint))
        {
            return Err(Errno::Exists);
        }
        let slot = self
            .fstab
            .mounts
            .iter()
            .position(|m| m.is_none())
            .ok_or(Errno::NoFiles)?;

        let get_sb = self.fstab.driver(fs_idx).get_sb;
        let sb = get_sb(self, fs_idx, flags, source, opts)?;
        self.fstab.mounts[slot] = Some(Mount {
            mountpoint,
            sb,
            open_count: 0,
        });
        Ok(())
    }

    /// Unmounts the filesystem at `target`. Refuses while files are open.
    pub fn umount(&mut self, target: &PathBuf, uid: u32, gid: u32) -> KResult<()> {
        if uid != 0 || gid != 0 {
            return Err(Errno::NotPermitted);
        }
        let mountpoint = target.to_mountpoint()?;
        let idx = self
            .fstab
            .mounts
            .iter()
            .position(|m| matches!(m, Some(m) if m.mountpoint == mountpoint))
            .ok_or(Errno::NotFound)?;
        let m = self.fstab.mount(idx);
        if m.open_count != 0 {
            return Err(Errno::Busy);
        }
        let sb = m.sb;
        let kill_sb = self.fstab.driver(self.fstab.sb(sb).fs).kill_sb;
        kill_sb(self, sb)?;
        self.fstab.mounts[idx] = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::err::Errno;

    fn path(s: &str) -> PathBuf {
        PathBuf::from_bytes(s.as_bytes()).unwrap()
    }

    fn dummy_fs(name: &'static str) -> FsType {
        fn get_sb(
            _: &mut Kernel,
            _: usize,
            _: MountFlags,
            _: usize,
            _: &[u8],
        ) -> KResult<SbId> {
            Err(Errno::NoDevice)
        }
        fn kill_sb(_: &mut Kernel, _: SbId) -> KResult<()> {
            Ok(())
        }
        FsType {
            name,
            get_sb,
            kill_sb,
        }
    }

    #[test]
    fn register_rejects_duplicates_and_bad_names() {
        let mut tab = FsTab::new();
        tab.register_fs(dummy_fs("alpha")).unwrap();
        assert_eq!(tab.register_fs(dummy_fs("alpha")).unwrap_err(), Errno::Exists);
        assert_eq!(tab.register_fs(dummy_fs("")).unwrap_err(), Errno::BadArg);
        assert_eq!(
            tab.register_fs(dummy_fs("averyveryverylongname")).unwrap_err(),
            Errno::BadArg
        );
        assert!(tab.get_fs(b"alpha").is_ok());
        assert_eq!(tab.get_fs(b"beta").unwrap_err(), Errno::NotFound);
    }

    #[test]
    fn registry_fills_up() {
        let mut tab = FsTab::new();
        let names: [&'static str; NFS] = [
            "f00", "f01", "f02", "f03", "f04", "f05", "f06", "f07", "f08", "f09", "f10",
            "f11", "f12", "f13", "f14", "f15",
        ];
        for name in names.iter() {
            tab.register_fs(dummy_fs(name)).unwrap();
        }
        assert_eq!(tab.register_fs(dummy_fs("extra")).unwrap_err(), Errno::NoFiles);
        tab.unregister_fs("f07").unwrap();
        tab.register_fs(dummy_fs("extra")).unwrap();
    }

    fn mount_at(tab: &mut FsTab, mp: &str) {
        let sb = tab
            .sb_alloc(Superblock {
                fs: 0,
                s_op: &DUMMY_SOPS,
                root: 0,
                open_count: 0,
                private: 0,
            })
            .unwrap();
        let slot = tab.mounts.iter().position(|m| m.is_none()).unwrap();
        tab.mounts[slot] = Some(Mount {
            mountpoint: path(mp).to_mountpoint().unwrap(),
            sb,
            open_count: 0,
        });
    }

    static DUMMY_SOPS: crate::fs::SuperOps = crate::fs::SuperOps {
        alloc_inode: |_, _| Err(Errno::NotPermitted),
        open_inode: |_, _, _| Err(Errno::NotPermitted),
        free_inode: |_, _| Ok(()),
        read_inode: |_, _| Ok(()),
        write_inode: None,
        drop_inode: None,
    };

    #[test]
    fn find_mount_picks_longest_prefix() {
        let mut tab = FsTab::new();
        mount_at(&mut tab, "/");
        mount_at(&mut tab, "/dev");
        mount_at(&mut tab, "/dev/block");

        let (root, off) = tab.find_mount(&path("/etc/rc")).unwrap();
        assert_eq!(tab.mount(root).mountpoint.as_bytes(), b"/");
        assert_eq!(off, 1);

        let (dev, off) = tab.find_mount(&path("/dev/rtc")).unwrap();
        assert_eq!(tab.mount(dev).mountpoint.as_bytes(), b"/dev/");
        assert_eq!(off, 5);

        let (blk, _) = tab.find_mount(&path("/dev/block/sda")).unwrap();
        assert_eq!(tab.mount(blk).mountpoint.as_bytes(), b"/dev/block/");
    }

    #[test]
    fn find_mount_matches_component_boundaries() {
        let mut tab = FsTab::new();
        mount_at(&mut tab, "/");
        mount_at(&mut tab, "/abc");

        // `/abcdef` must not be claimed by the `/abc` mount.
        let (idx, _) = tab.find_mount(&path("/abcdef")).unwrap();
        assert_eq!(tab.mount(idx).mountpoint.as_bytes(), b"/");

        // The mountpoint itself resolves to its own mount.
        let (idx, off) = tab.find_mount(&path("/abc")).unwrap();
        assert_eq!(tab.mount(idx).mountpoint.as_bytes(), b"/abc/");
        assert_eq!(off, 4);
    }

    #[test]
    fn find_mount_wants_absolute_paths() {
        let tab = FsTab::new();
        assert_eq!(tab.find_mount(&path("etc")).unwrap_err(), Errno::BadArg);
        assert_eq!(tab.find_mount(&path("/etc")).unwrap_err(), Errno::NotFound);
    }
}
