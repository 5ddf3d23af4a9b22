use zerocopy::{AsBytes, FromBytes};

use crate::fs::{Inode, SbId};

/// File metadata, as copied out by the `stat` family.
#[derive(Clone, Copy, Default, AsBytes, FromBytes)]
#[repr(C)]
pub struct Stat {
    /// Superblock slot standing in for a device id.
    pub dev: i32,

    /// Inode number
    pub ino: u32,

    /// Size of file in bytes
    pub size: u32,

    pub uid: u32,

    pub gid: u32,

    /// Type of file
    pub typ: u16,

    /// Permission bits
    pub mode: u16,

    /// Number of links to file
    pub nlink: u16,

    pad: u16,
}

impl Stat {
    pub fn from_inode(inode: &Inode) -> Self {
        let SbId(dev) = inode.sb;
        Self {
            dev: dev as i32,
            ino: inode.ino,
            size: inode.size as u32,
            uid: inode.uid,
            gid: inode.gid,
            typ: inode.itype.as_u16(),
            mode: inode.mode.bits(),
            nlink: inode.nlink,
            pad: 0,
        }
    }
}
