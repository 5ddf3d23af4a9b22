/// Maximum number of tasks.
pub const NPROC: usize = 32;

/// Open files per task.
pub const NOFILE: usize = 16;

/// System-wide open files limit.
pub const NFILE: usize = 256;

/// Maximum number of in-memory inodes.
pub const NINODE: usize = 64;

/// Maximum number of registered filesystem drivers.
pub const NFS: usize = 16;

/// Maximum number of mounted filesystems.
pub const NMOUNT: usize = 16;

/// Maximum number of registered character devices.
pub const NDEV: usize = 10;

/// Maximum file path name.
pub const PATH_MAX: usize = 128;

/// Maximum file name length.
pub const DIRSIZ: usize = 32;

/// Number of signals. Signal numbers are 1..NSIG.
pub const NSIG: usize = 32;

/// Maximum pages a task may map.
pub const TASK_NPAGE: usize = 16;

/// Physical frames in the user page pool.
pub const NFRAME: usize = 128;

/// Page size.
pub const PGSIZE: usize = 4096;

/// Max exec arguments.
pub const MAXARG: usize = 32;

/// Bytes of argv/envp strings execve will stage.
pub const ARG_MAX: usize = 1024;

/// Bound on symlink expansions during path resolution.
pub const SYMLOOP_MAX: usize = 8;

/// Command-line buffer kept per task.
pub const ARGBUF: usize = 128;

/// Timer ticks per second.
pub const HZ: u64 = 100;

/// Max ELF program headers accepted by execve.
pub const MAXPHNUM: usize = 8;

/// Maximum length of a filesystem driver name.
pub const FS_NAME_MAX: usize = 16;
