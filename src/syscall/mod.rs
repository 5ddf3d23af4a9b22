//! The system-call gate: stable numbers, argument fetching, dispatch.
//!
//! Three arguments arrive in registers; the result goes back in the
//! accumulator, negative values meaning `-errno`.

use cstr_core::CStr;

use crate::{
    err::{Errno, KResult},
    fs::PathBuf,
    kernel::Kernel,
    param::PATH_MAX,
    println,
};

mod file;
mod proc;

pub const NR_OPEN: u32 = 16;
pub const NR_CLOSE: u32 = 17;
pub const NR_READ: u32 = 18;
pub const NR_WRITE: u32 = 19;
pub const NR_MOUNT: u32 = 20;
pub const NR_UMOUNT: u32 = 21;
pub const NR_GETDENTS: u32 = 22;
pub const NR_FORK: u32 = 23;
pub const NR_EXIT: u32 = 24;
pub const NR_EXECVE: u32 = 25;
pub const NR_SIGACTION: u32 = 26;
pub const NR_KILL: u32 = 27;
pub const NR_SIGSUSPEND: u32 = 28;
pub const NR_SIGPROCMASK: u32 = 29;
pub const NR_WAITPID: u32 = 30;
pub const NR_STAT: u32 = 31;
pub const NR_FSTAT: u32 = 32;
pub const NR_LSTAT: u32 = 33;
pub const NR_GETPID: u32 = 34;
pub const NR_LSEEK: u32 = 35;
pub const NR_CHMOD: u32 = 36;
pub const NR_CHOWN: u32 = 37;
pub const NR_LINK: u32 = 38;
pub const NR_UNLINK: u32 = 39;
pub const NR_SYMLINK: u32 = 40;
pub const NR_READLINK: u32 = 41;
pub const NR_TRUNCATE: u32 = 42;
pub const NR_FTRUNCATE: u32 = 43;
pub const NR_RENAME: u32 = 44;
pub const NR_GETCWD: u32 = 45;
pub const NR_CHDIR: u32 = 46;
pub const NR_MKDIR: u32 = 47;
pub const NR_RMDIR: u32 = 48;
pub const NR_IOCTL: u32 = 49;
pub const NR_SIGRETURN: u32 = 50;
pub const NR_GETUID: u32 = 51;
pub const NR_SETUID: u32 = 52;
pub const NR_GETGID: u32 = 53;
pub const NR_SETGID: u32 = 54;
pub const NR_BRK: u32 = 55;
pub const NR_SBRK: u32 = 56;
pub const NR_FCHMOD: u32 = 57;
pub const NR_FCHOWN: u32 = 58;
pub const NR_DUP: u32 = 59;
pub const NR_DUP2: u32 = 60;
pub const NR_NANOSLEEP: u32 = 61;

impl Kernel {
    pub fn syscall(&mut self, num: u32, a: usize, b: usize, c: usize) -> KResult<usize> {
        match num {
            NR_OPEN => self.sys_open(a, b, c),
            NR_CLOSE => self.sys_close(a),
            NR_READ => self.sys_read(a, b, c),
            NR_WRITE => self.sys_write(a, b, c),
            NR_MOUNT => self.sys_mount(a, b, c),
            NR_UMOUNT => self.sys_umount(a),
            NR_GETDENTS => self.sys_getdents(a, b),
            NR_FORK => self.sys_fork(),
            NR_EXIT => self.sys_exit_gate(a),
            NR_EXECVE => self.sys_execve(a, b, c),
            NR_SIGACTION => self.sys_sigaction_gate(a, b, c),
            NR_KILL => self.sys_kill_gate(a, b),
            NR_SIGSUSPEND => self.sys_sigsuspend_gate(a),
            NR_SIGPROCMASK => self.sys_sigprocmask_gate(a, b, c),
            NR_WAITPID => self.sys_waitpid_gate(a, b, c),
            NR_STAT => self.sys_stat(a, b),
            NR_FSTAT => self.sys_fstat(a, b),
            NR_LSTAT => self.sys_lstat(a, b),
            NR_GETPID => self.sys_getpid(),
            NR_LSEEK => self.sys_lseek(a, b, c),
            NR_CHMOD => self.sys_chmod(a, b),
            NR_CHOWN => self.sys_chown(a, b, c),
            NR_LINK => self.sys_link(a, b),
            NR_UNLINK => self.sys_unlink(a),
            NR_SYMLINK => self.sys_symlink(a, b),
            NR_READLINK => self.sys_readlink(a, b, c),
            NR_TRUNCATE => self.sys_truncate(a, b),
            NR_FTRUNCATE => self.sys_ftruncate(a, b),
            NR_RENAME => self.sys_rename(a, b),
            NR_GETCWD => self.sys_getcwd(a, b),
            NR_CHDIR => self.sys_chdir(a),
            NR_MKDIR => self.sys_mkdir(a, b),
            NR_RMDIR => self.sys_rmdir(a),
            NR_IOCTL => self.sys_ioctl(a, b, c),
            NR_SIGRETURN => self.sys_sigreturn(),
            NR_GETUID => Ok(self.tasks.current().uid as usize),
            NR_SETUID => self.sys_setuid(a),
            NR_GETGID => Ok(self.tasks.current().gid as usize),
            NR_SETGID => self.sys_setgid(a),
            NR_BRK => self.sys_brk(a),
            NR_SBRK => self.sys_sbrk(a),
            NR_FCHMOD => self.sys_fchmod(a, b),
            NR_FCHOWN => self.sys_fchown(a, b, c),
            NR_DUP => self.sys_dup(a),
            NR_DUP2 => self.sys_dup2(a, b),
            NR_NANOSLEEP => self.sys_nanosleep(a, b),
            _ => {
                println!("pid {}: unknown sys call {}", self.tasks.current, num);
                Err(Errno::BadSyscall)
            }
        }
    }

    /// Fetches a NUL-terminated string from user memory into `buf`.
    pub fn fetch_str<'a>(&self, addr: usize, buf: &'a mut [u8]) -> KResult<&'a [u8]> {
        if addr == 0 {
            return Err(Errno::BadAddress);
        }
        let pid = self.tasks.current;
        let buf_len = buf.len();
        let n = self.copy_in_str(pid, &mut buf[..buf_len - 1], addr)?.len();
        buf[n] = 0;
        let cstr = CStr::from_bytes_with_nul(&buf[..n + 1]).map_err(|_| Errno::BadArg)?;
        Ok(cstr.to_bytes())
    }

    /// Fetches a path argument and resolves it against the task's cwd into
    /// canonical absolute form.
    pub fn fetch_path(&self, addr: usize) -> KResult<PathBuf> {
        let mut buf = [0u8; PATH_MAX + 1];
        let bytes = self.fetch_str(addr, &mut buf)?;
        if bytes.is_empty() {
            return Err(Errno::NotFound);
        }
        if bytes.first() == Some(&b'/') {
            PathBuf::from_bytes(bytes)?.canonicalize()
        } else {
            self.tasks.current().cwd.join(bytes)
        }
    }
}
