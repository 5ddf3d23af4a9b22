//! Process, identity, memory and signal system calls.

use crate::{
    err::{Errno, KResult},
    exec::StagedArgs,
    kernel::Kernel,
    memlayout::{pg_round_up, USTACK_PAGES, USTACK_TOP},
    param::{MAXARG, PGSIZE},
    proc::SigAction,
    vm::PteFlags,
};

/// Guard page between the heap and the user stack.
const HEAP_MAX_GAP: usize = PGSIZE;

impl Kernel {
    pub(super) fn sys_fork(&mut self) -> KResult<usize> {
        self.fork_current().map(|pid| pid as usize)
    }

    pub(super) fn sys_exit_gate(&mut self, status: usize) -> KResult<usize> {
        self.sys_exit(status as i32)
    }

    pub(super) fn sys_waitpid_gate(&mut self, pid: usize, statusp: usize, flags: usize) -> KResult<usize> {
        self.sys_waitpid(pid as i32, statusp, flags as u32)
    }

    pub(super) fn sys_kill_gate(&mut self, pid: usize, sig: usize) -> KResult<usize> {
        self.sys_kill(pid as i32, sig)
    }

    pub(super) fn sys_getpid(&mut self) -> KResult<usize> {
        Ok(self.tasks.current as usize)
    }

    pub(super) fn sys_setuid(&mut self, uid: usize) -> KResult<usize> {
        let task = self.tasks.current_mut();
        if task.uid != 0 && task.uid != uid as u32 {
            return Err(Errno::NotPermitted);
        }
        task.uid = uid as u32;
        Ok(0)
    }

    pub(super) fn sys_setgid(&mut self, gid: usize) -> KResult<usize> {
        let task = self.tasks.current_mut();
        if task.uid != 0 && task.gid != gid as u32 {
            return Err(Errno::NotPermitted);
        }
        task.gid = gid as u32;
        Ok(0)
    }

    pub(super) fn sys_execve(&mut self, patha: usize, argvp: usize, envpp: usize) -> KResult<usize> {
        let path = self.fetch_path(patha)?;
        let pid = self.tasks.current;

        let mut args = StagedArgs::new();
        let mut strbuf = [0u8; 256];
        for i in 0..=MAXARG {
            if argvp == 0 {
                break;
            }
            let ptr: u32 = self.copy_in(pid, argvp + 4 * i)?;
            if ptr == 0 {
                break;
            }
            if i == MAXARG {
                return Err(Errno::NoSpace);
            }
            let len = self.fetch_str(ptr as usize, &mut strbuf)?.len();
            args.push_arg(&strbuf[..len])?;
        }
        for i in 0..=MAXARG {
            if envpp == 0 {
                break;
            }
            let ptr: u32 = self.copy_in(pid, envpp + 4 * i)?;
            if ptr == 0 {
                break;
            }
            if i == MAXARG {
                return Err(Errno::NoSpace);
            }
            let len = self.fetch_str(ptr as usize, &mut strbuf)?.len();
            args.push_env(&strbuf[..len])?;
        }

        self.exec_task(pid, &path, &args)
    }

    /// `brk(0)` reports the current break; otherwise the break moves and
    /// pages are mapped or returned page-wise.
    pub(super) fn sys_brk(&mut self, addr: usize) -> KResult<usize> {
        let pid = self.tasks.current;
        let (heap_base, brk) = {
            let t = self.tasks.get(pid);
            (t.heap_base, t.brk)
        };
        if addr == 0 {
            return Ok(brk);
        }
        let limit = USTACK_TOP - USTACK_PAGES * PGSIZE - HEAP_MAX_GAP;
        if addr < heap_base || addr > limit {
            return Err(Errno::NoSpace);
        }
        let old_end = pg_round_up(brk);
        let new_end = pg_round_up(addr);
        if new_end > old_end {
            let mut va = old_end;
            while va < new_end {
                if let Err(e) = self.map_new_page(pid, va, PteFlags::WRITABLE) {
                    // Roll the partial growth back.
                    let mut undo = old_end;
                    while undo < va {
                        if let Some(entry) = self.tasks.get_mut(pid).pages.unmap(undo) {
                            self.frames.release(entry.paddr);
                        }
                        undo += PGSIZE;
                    }
                    return Err(e);
                }
                va += PGSIZE;
            }
        } else {
            let mut va = new_end;
            while va < old_end {
                if let Some(entry) = self.tasks.get_mut(pid).pages.unmap(va) {
                    self.frames.release(entry.paddr);
                }
                va += PGSIZE;
            }
        }
        self.tasks.get_mut(pid).brk = addr;
        Ok(addr)
    }

    pub(super) fn sys_sbrk(&mut self, incr: usize) -> KResult<usize> {
        let old = self.tasks.current().brk;
        let incr = incr as isize;
        let target = if incr >= 0 {
            old.checked_add(incr as usize).ok_or(Errno::NoSpace)?
        } else {
            old.checked_sub(incr.unsigned_abs()).ok_or(Errno::NoSpace)?
        };
        if incr != 0 {
            self.sys_brk(target)?;
        }
        Ok(old)
    }

    pub(super) fn sys_sigaction_gate(&mut self, sig: usize, actp: usize, oldp: usize) -> KResult<usize> {
        let pid = self.tasks.current;
        let new: Option<SigAction> = if actp != 0 {
            Some(self.copy_in(pid, actp)?)
        } else {
            None
        };
        let old = self.sigaction(sig, new)?;
        if oldp != 0 {
            self.copy_out(pid, oldp, &old)?;
        }
        Ok(0)
    }

    pub(super) fn sys_sigprocmask_gate(&mut self, how: usize, setp: usize, oldp: usize) -> KResult<usize> {
        let pid = self.tasks.current;
        let set: Option<u32> = if setp != 0 {
            Some(self.copy_in(pid, setp)?)
        } else {
            None
        };
        let old = self.sigprocmask(how, set)?;
        if oldp != 0 {
            self.copy_out(pid, oldp, &old)?;
        }
        Ok(0)
    }

    pub(super) fn sys_sigsuspend_gate(&mut self, maskp: usize) -> KResult<usize> {
        let pid = self.tasks.current;
        let mask: u32 = self.copy_in(pid, maskp)?;
        self.sys_sigsuspend(mask)
    }
}
