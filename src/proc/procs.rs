//! Task lifecycle: fork, exit, wait, kill.

use itertools::izip;

use crate::{
    err::{Errno, KResult},
    kernel::Kernel,
    param::{NOFILE, NPROC},
    proc::{
        signal::{status_of_exit, SIGCHLD},
        Pid, SigSet, SleepReason, TaskState,
    },
    vm::PteFlags,
};

/// `waitpid` flag: return immediately when no child is ready.
pub const WNOHANG: u32 = 1;

impl Kernel {
    /// Creates a child of the current task: same registers except a zero
    /// return value, shared open files, copy-on-write memory, inherited
    /// handlers and mask, cleared pending set.
    pub fn fork_current(&mut self) -> KResult<Pid> {
        let ppid = self.tasks.current;
        let child = self.tasks.alloc()?;

        let mut image = self.tasks.get(ppid).clone();
        image.pid = child;
        image.parent = ppid;
        image.state = TaskState::Runnable;
        image.pending = SigSet::empty();
        image.saved_mask = None;
        image.sleep = None;
        image.timer_until = None;
        image.xstate = 0;
        image.regs.eax = 0;
        *self.tasks.get_mut(child) = image;

        // The child's fds reference the same open files.
        for fd in 0..NOFILE {
            if let Some(entry) = self.tasks.get(child).files[fd] {
                self.ftable.get_mut(entry.file).open_count += 1;
            }
        }

        // Share the pages: every writable user mapping loses its write bit
        // in both tasks and turns copy-on-write.
        let (frames, tasks) = (&mut self.frames, &mut self.tasks);
        let (parent, childt) = tasks.pair_mut(ppid, child);
        for (pe, ce) in izip!(
            parent.pages.entries_mut(),
            childt.pages.entries_mut()
        ) {
            if pe.flags.contains(PteFlags::WRITABLE) {
                pe.flags.remove(PteFlags::WRITABLE);
                pe.cow = true;
                ce.flags.remove(PteFlags::WRITABLE);
                ce.cow = true;
            }
            frames.add_ref(ce.paddr);
        }

        Ok(child)
    }

    /// Terminates `pid`: fds released in ascending order, user pages freed,
    /// state moves to zombie holding `xstate`, the parent learns via
    /// SIGCHLD and a waitpid wakeup, children are given to init.
    pub fn do_exit(&mut self, pid: Pid, xstate: i32) {
        assert_ne!(pid, 1, "init exiting");

        for fd in 0..NOFILE {
            if let Some(entry) = self.tasks.get_mut(pid).files[fd].take() {
                let _ = self.file_close(entry.file);
            }
        }
        self.free_user_pages(pid);

        {
            let task = self.tasks.get_mut(pid);
            task.xstate = xstate;
            task.state = TaskState::Zombie;
            task.sleep = None;
            task.saved_mask = None;
            task.timer_until = None;
        }

        // Orphans go to init; init reaps zombies as they arrive.
        for i in 0..NPROC {
            let t = self.tasks.get_mut(i as Pid);
            if t.parent == pid && t.state != TaskState::Unused && t.pid != pid {
                t.parent = 1;
            }
        }

        let parent = self.tasks.get(pid).parent;
        if parent != pid {
            let _ = self.send_signal(parent, SIGCHLD);
            let pt = self.tasks.get_mut(parent);
            if pt.state == TaskState::Sleeping {
                if let Some(SleepReason::Child(target)) = pt.sleep {
                    if target == -1 || target == pid {
                        pt.state = TaskState::Runnable;
                        pt.sleep = None;
                    }
                }
            }
        }
    }

    /// `_exit`: the current task stops existing as far as user space is
    /// concerned; the zombie stays for the parent to reap.
    pub fn sys_exit(&mut self, status: i32) -> KResult<usize> {
        let pid = self.tasks.current;
        self.do_exit(pid, status_of_exit(status));
        // The gate schedules away; the value below is never observed.
        Ok(0)
    }

    /// `waitpid`: reap a zombie child, blocking unless `WNOHANG`.
    pub fn sys_waitpid(&mut self, pid: Pid, statusp: usize, flags: u32) -> KResult<usize> {
        if pid == 0 || pid < -1 {
            return Err(Errno::BadArg);
        }
        let me = self.tasks.current;

        let mut have_child = false;
        let mut zombie: Option<Pid> = None;
        for t in self.tasks.iter() {
            if t.parent != me || t.pid == me || t.state == TaskState::Unused {
                continue;
            }
            if pid > 0 && t.pid != pid {
                continue;
            }
            have_child = true;
            if t.state == TaskState::Zombie {
                zombie = Some(t.pid);
                break;
            }
        }

        if let Some(child) = zombie {
            let xstate = self.tasks.get(child).xstate;
            if statusp != 0 {
                self.copy_out(me, statusp, &xstate)?;
            }
            let slot = self.tasks.get_mut(child);
            slot.state = TaskState::Unused;
            slot.parent = 0;
            return Ok(child as usize);
        }
        if !have_child {
            return Err(Errno::NoChild);
        }
        if flags & WNOHANG != 0 {
            return Ok(0);
        }
        self.sleep_current(SleepReason::Child(pid));
        Err(Errno::Restart)
    }

    /// `kill`: signal 0 probes for existence, anything else is raised.
    pub fn sys_kill(&mut self, pid: Pid, sig: usize) -> KResult<usize> {
        if sig == 0 {
            self.tasks.find(pid)?;
            return Ok(0);
        }
        self.send_signal(pid, sig)?;
        Ok(0)
    }

    /// `nanosleep`, in whole ticks derived from the second/nanosecond pair.
    pub fn sys_nanosleep(&mut self, secs: usize, nanos: usize) -> KResult<usize> {
        let ticks = secs as u64 * crate::param::HZ
            + (nanos as u64 * crate::param::HZ) / 1_000_000_000;
        match self.tasks.current().timer_until {
            None => {
                let until = self.ticks + ticks.max(1);
                let task = self.tasks.current_mut();
                task.timer_until = Some(until);
                self.sleep_current(SleepReason::Timer);
                Err(Errno::Restart)
            }
            Some(until) if self.ticks >= until => {
                self.tasks.current_mut().timer_until = None;
                Ok(0)
            }
            Some(_) => {
                self.sleep_current(SleepReason::Timer);
                Err(Errno::Restart)
            }
        }
    }
}
