//! Tasks: the pid table, per-task state and the fd table operations.

use core::convert::TryFrom;

use array_macro::array;
use arrayvec::ArrayVec;

use crate::{
    arch::RegFrame,
    err::{Errno, KResult},
    fs::{FileId, PathBuf},
    kernel::Kernel,
    memlayout::UBASE,
    param::{ARGBUF, NOFILE, NPROC, NSIG},
    vm::PageMap,
};

mod procs;
mod scheduler;
pub(crate) mod signal;

pub use procs::WNOHANG;
pub use signal::{SigAction, SigSet, SIGCHLD, SIGCONT, SIGKILL, SIGSEGV, SIGSTOP, SIGUSR1};

pub type Pid = i32;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TaskState {
    Unused,
    Runnable,
    Running,
    Sleeping,
    Zombie,
    Dead,
}

/// Why a sleeping task sleeps; wakeup clears it.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SleepReason {
    /// Waiting for a child (`-1` for any) to exit.
    Child(Pid),
    /// `sigsuspend`.
    Signal,
    /// Stopped by a stop-signal; only SIGCONT or SIGKILL resume it.
    Stopped,
    /// `nanosleep`.
    Timer,
    /// Blocking device I/O.
    Io,
}

/// One slot in a task's fd table.
#[derive(Clone, Copy)]
pub struct FdEntry {
    pub file: FileId,
    pub cloexec: bool,
}

/// Per-task state.
#[derive(Clone)]
pub struct Task {
    pub state: TaskState,
    pub pid: Pid,
    pub parent: Pid,
    pub uid: u32,
    pub gid: u32,

    /// Register frame to IRET with when this task next runs.
    pub regs: RegFrame,
    /// Kernel stack base for the TSS.
    pub kstack: usize,

    pub files: [Option<FdEntry>; NOFILE],
    pub pages: PageMap,
    pub heap_base: usize,
    pub brk: usize,
    pub cwd: PathBuf,

    pub sigacts: [SigAction; NSIG],
    pub pending: SigSet,
    pub blocked: SigSet,
    /// Mask to restore when `sigsuspend` returns.
    pub saved_mask: Option<SigSet>,

    pub sleep: Option<SleepReason>,
    /// Tick deadline of an in-progress `nanosleep`.
    pub timer_until: Option<u64>,

    /// Wait status: exit code in the low byte, terminating signal above it.
    pub xstate: i32,

    /// Command line, for diagnostics.
    pub args: ArrayVec<u8, ARGBUF>,
}

impl Task {
    pub fn new(pid: Pid) -> Self {
        Self {
            state: TaskState::Unused,
            pid,
            parent: 0,
            uid: 0,
            gid: 0,
            regs: RegFrame::default(),
            kstack: 0,
            files: [None; NOFILE],
            pages: PageMap::new(),
            heap_base: UBASE,
            brk: UBASE,
            cwd: PathBuf::root(),
            sigacts: [SigAction::default(); NSIG],
            pending: SigSet::empty(),
            blocked: SigSet::empty(),
            saved_mask: None,
            sleep: None,
            timer_until: None,
            xstate: 0,
            args: ArrayVec::new(),
        }
    }

    /// Installs an open-file reference at the lowest free fd.
    pub fn fd_install(&mut self, entry: FdEntry) -> KResult<usize> {
        let fd = self
            .files
            .iter()
            .position(|f| f.is_none())
            .ok_or(Errno::NoFiles)?;
        self.files[fd] = Some(entry);
        Ok(fd)
    }

    pub fn fd_entry(&self, fd: usize) -> KResult<FdEntry> {
        self.files
            .get(fd)
            .and_then(|f| *f)
            .ok_or(Errno::BadFd)
    }

    pub fn fd_get(&self, fd: usize) -> KResult<FileId> {
        self.fd_entry(fd).map(|e| e.file)
    }

    pub fn fd_take(&mut self, fd: usize) -> KResult<FdEntry> {
        self.files
            .get_mut(fd)
            .and_then(|f| f.take())
            .ok_or(Errno::BadFd)
    }
}

/// The fixed pid table. Pids are slot indices; slot 0 is the idle task.
pub struct TaskTable {
    tasks: [Task; NPROC],
    pub current: Pid,
}

impl TaskTable {
    pub fn new() -> Self {
        Self {
            tasks: array![i => Task::new(i as Pid); NPROC],
            current: 0,
        }
    }

    pub fn get(&self, pid: Pid) -> &Task {
        &self.tasks[pid as usize]
    }

    pub fn get_mut(&mut self, pid: Pid) -> &mut Task {
        &mut self.tasks[pid as usize]
    }

    /// Untrusted pid lookup: live tasks only.
    pub fn find(&self, pid: Pid) -> KResult<&Task> {
        let task = self
            .tasks
            .get(usize::try_from(pid).map_err(|_| Errno::NotFound)?)
            .ok_or(Errno::NotFound)?;
        match task.state {
            TaskState::Unused | TaskState::Dead => Err(Errno::NotFound),
            _ => Ok(task),
        }
    }

    pub fn current(&self) -> &Task {
        self.get(self.current)
    }

    pub fn current_mut(&mut self) -> &mut Task {
        let pid = self.current;
        self.get_mut(pid)
    }

    /// Claims an unused slot. The slot comes back reset with its pid.
    pub fn alloc(&mut self) -> KResult<Pid> {
        for i in 1..NPROC {
            if self.tasks[i].state == TaskState::Unused {
                self.tasks[i] = Task::new(i as Pid);
                return Ok(i as Pid);
            }
        }
        Err(Errno::NoSpace)
    }

    /// Two distinct tasks, mutably.
    pub fn pair_mut(&mut self, a: Pid, b: Pid) -> (&mut Task, &mut Task) {
        let (a, b) = (a as usize, b as usize);
        assert_ne!(a, b, "task table: aliased pair");
        if a < b {
            let (lo, hi) = self.tasks.split_at_mut(b);
            (&mut lo[a], &mut hi[0])
        } else {
            let (lo, hi) = self.tasks.split_at_mut(a);
            (&mut hi[0], &mut lo[b])
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Task> {
        self.tasks.iter()
    }

    /// Pids in a given state.
    pub fn pids_in(&self, state: TaskState) -> impl Iterator<Item = Pid> + '_ {
        self.tasks
            .iter()
            .filter(move |t| t.state == state)
            .map(|t| t.pid)
    }
}

impl Kernel {
    /// Puts the current task to sleep; the gate turns the accompanying
    /// `Restart` into a re-issued syscall after wakeup.
    pub fn sleep_current(&mut self, reason: SleepReason) {
        let task = self.tasks.current_mut();
        task.state = TaskState::Sleeping;
        task.sleep = Some(reason);
    }
}
