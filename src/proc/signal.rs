//! Signals: per-task handler table, pending and blocked masks, the
//! user-stack trampoline and the default-action table.

use bitmaps::Bitmap;
use zerocopy::{AsBytes, FromBytes};

use crate::{
    arch::{RegFrame, FL_IF, USER_CS, USER_DS},
    err::{Errno, KResult},
    kernel::Kernel,
    param::NSIG,
    proc::{Pid, SleepReason, TaskState},
    syscall::NR_SIGRETURN,
};

pub const SIGHUP: usize = 1;
pub const SIGINT: usize = 2;
pub const SIGQUIT: usize = 3;
pub const SIGILL: usize = 4;
pub const SIGTRAP: usize = 5;
pub const SIGABRT: usize = 6;
pub const SIGBUS: usize = 7;
pub const SIGFPE: usize = 8;
pub const SIGKILL: usize = 9;
pub const SIGUSR1: usize = 10;
pub const SIGSEGV: usize = 11;
pub const SIGUSR2: usize = 12;
pub const SIGPIPE: usize = 13;
pub const SIGALRM: usize = 14;
pub const SIGTERM: usize = 15;
pub const SIGCHLD: usize = 17;
pub const SIGCONT: usize = 18;
pub const SIGSTOP: usize = 19;
pub const SIGTSTP: usize = 20;
pub const SIGTTIN: usize = 21;
pub const SIGTTOU: usize = 22;
pub const SIGURG: usize = 23;
pub const SIGWINCH: usize = 28;

/// `sa_handler` values with no handler function.
pub const SIG_DFL: u32 = 0;
pub const SIG_IGN: u32 = 1;

/// `sigprocmask` how values.
pub const SIG_BLOCK: usize = 0;
pub const SIG_UNBLOCK: usize = 1;
pub const SIG_SETMASK: usize = 2;

/// A set of signals. Bit n is signal n; bit 0 stays clear.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct SigSet(Bitmap<NSIG>);

impl SigSet {
    pub fn empty() -> Self {
        Self(Bitmap::new())
    }

    pub fn from_bits(bits: u32) -> Self {
        Self(Bitmap::from_value(bits & !1))
    }

    pub fn bits(self) -> u32 {
        self.0.into_value()
    }

    pub fn add(&mut self, sig: usize) {
        if sig > 0 && sig < NSIG {
            self.0.set(sig, true);
        }
    }

    pub fn remove(&mut self, sig: usize) {
        if sig < NSIG {
            self.0.set(sig, false);
        }
    }

    pub fn contains(self, sig: usize) -> bool {
        sig < NSIG && self.0.get(sig)
    }

    pub fn is_empty(self) -> bool {
        self.0.first_index().is_none()
    }

    /// Lowest signal in `self` and not in `mask`. SIGKILL and SIGSTOP
    /// ignore the mask.
    pub fn first_deliverable(self, mask: SigSet) -> Option<usize> {
        if self.contains(SIGKILL) {
            return Some(SIGKILL);
        }
        if self.contains(SIGSTOP) {
            return Some(SIGSTOP);
        }
        (self.0 & !mask.0).first_index()
    }
}

/// Per-signal disposition, in the user ABI layout.
#[derive(Clone, Copy, Default, AsBytes, FromBytes)]
#[repr(C)]
pub struct SigAction {
    /// SIG_DFL, SIG_IGN or the handler's address.
    pub handler: u32,
    /// Signals additionally blocked while the handler runs.
    pub mask: u32,
    pub flags: u32,
}

/// What a defaulted signal does.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum DefaultAction {
    Terminate,
    Ignore,
    Stop,
}

fn default_action(sig: usize) -> DefaultAction {
    match sig {
        SIGCHLD | SIGCONT | SIGURG | SIGWINCH => DefaultAction::Ignore,
        SIGSTOP | SIGTSTP | SIGTTIN | SIGTTOU => DefaultAction::Stop,
        _ => DefaultAction::Terminate,
    }
}

/// Machine code of the sigreturn stub pushed on the user stack:
/// `mov eax, NR_SIGRETURN; int 0x80`, padded to a word multiple.
const SIGRET_CODE: [u8; 8] = [
    0xb8,
    NR_SIGRETURN as u8,
    0,
    0,
    0,
    0xcd,
    0x80,
    0x90,
];

/// Builds the wait-status word for death by signal.
pub fn status_of_signal(sig: usize) -> i32 {
    ((sig as i32) & 0x7f) << 8
}

/// Builds the wait-status word for a plain exit.
pub fn status_of_exit(code: i32) -> i32 {
    code & 0xff
}

impl Kernel {
    /// `kill`: raise `sig` on `pid`.
    pub fn send_signal(&mut self, pid: Pid, sig: usize) -> KResult<()> {
        if sig == 0 || sig >= NSIG {
            return Err(Errno::BadArg);
        }
        self.tasks.find(pid)?;
        let task = self.tasks.get_mut(pid);
        task.pending.add(sig);

        // Wake interruptible sleepers; stopped tasks only resume on
        // SIGCONT or SIGKILL.
        if task.state == TaskState::Sleeping {
            let stopped = task.sleep == Some(SleepReason::Stopped);
            let wake = if stopped {
                sig == SIGCONT || sig == SIGKILL
            } else {
                sig == SIGKILL || !task.blocked.contains(sig)
            };
            if wake {
                task.state = TaskState::Runnable;
                task.sleep = None;
            }
        }
        Ok(())
    }

    /// True if `pid` has a signal the next return-to-user would act on
    /// (ignored signals do not count).
    pub fn has_deliverable(&self, pid: Pid) -> bool {
        let task = self.tasks.get(pid);
        match task.pending.first_deliverable(task.blocked) {
            None => false,
            Some(sig) if sig == SIGKILL || sig == SIGSTOP => true,
            Some(sig) => match task.sigacts[sig].handler {
                SIG_IGN => false,
                SIG_DFL => default_action(sig) != DefaultAction::Ignore,
                _ => true,
            },
        }
    }

    /// Acts on pending signals of `pid` before it returns to user mode:
    /// runs default actions, discards ignored signals, or builds the
    /// handler trampoline on the user stack.
    pub fn deliver_pending(&mut self, pid: Pid) {
        loop {
            let (sig, act) = {
                let task = self.tasks.get(pid);
                if task.state != TaskState::Running && task.state != TaskState::Runnable {
                    return;
                }
                match task.pending.first_deliverable(task.blocked) {
                    None => return,
                    Some(sig) => (sig, task.sigacts[sig]),
                }
            };
            self.tasks.get_mut(pid).pending.remove(sig);

            // SIGKILL and SIGSTOP always take the default route.
            let forced = sig == SIGKILL || sig == SIGSTOP;
            if !forced && act.handler == SIG_IGN {
                continue;
            }
            if forced || act.handler == SIG_DFL {
                match default_action(sig) {
                    DefaultAction::Ignore => continue,
                    DefaultAction::Stop => {
                        let task = self.tasks.get_mut(pid);
                        task.state = TaskState::Sleeping;
                        task.sleep = Some(SleepReason::Stopped);
                        return;
                    }
                    DefaultAction::Terminate => {
                        self.do_exit(pid, status_of_signal(sig));
                        return;
                    }
                }
            }
            if self.push_sigframe(pid, sig, act).is_err() {
                // No stack to deliver on; the task cannot continue.
                self.do_exit(pid, status_of_signal(SIGSEGV));
            }
            return;
        }
    }

    /// Builds the trampoline frame on the user stack:
    ///
    /// ```text
    /// high | sigreturn stub code | saved RegFrame | saved blocked mask |
    ///      | signal number | return address -> stub |  <- new esp
    /// ```
    fn push_sigframe(&mut self, pid: Pid, sig: usize, act: SigAction) -> KResult<()> {
        let (saved_regs, old_blocked) = {
            let task = self.tasks.get(pid);
            (task.regs, task.blocked)
        };
        let mut sp = saved_regs.esp as usize;

        sp -= SIGRET_CODE.len();
        let stub = sp;
        self.copy_out_bytes(pid, sp, &SIGRET_CODE)?;

        sp -= core::mem::size_of::<RegFrame>();
        self.copy_out(pid, sp, &saved_regs)?;

        sp -= 4;
        self.copy_out(pid, sp, &old_blocked.bits())?;

        sp -= 4;
        self.copy_out(pid, sp, &(sig as u32))?;

        sp -= 4;
        self.copy_out(pid, sp, &(stub as u32))?;

        let task = self.tasks.get_mut(pid);
        task.regs.eip = act.handler;
        task.regs.esp = sp as u32;
        task.blocked = SigSet::from_bits(old_blocked.bits() | act.mask);
        task.blocked.add(sig);
        task.blocked.remove(SIGKILL);
        task.blocked.remove(SIGSTOP);
        Ok(())
    }

    /// `sigreturn`: pops the frame `push_sigframe` built and resumes the
    /// interrupted context. Returns the restored eax so the gate writes it
    /// back unchanged.
    pub fn sys_sigreturn(&mut self) -> KResult<usize> {
        let pid = self.tasks.current;
        let sp = self.tasks.current().regs.esp as usize;

        // The handler's `ret` consumed the return address; esp now sits at
        // the signal number.
        let mask: u32 = self.copy_in(pid, sp + 4)?;
        let mut frame: RegFrame = self.copy_in(pid, sp + 8)?;
        if !frame.is_valid() {
            return Err(Errno::BadAddress);
        }
        // Never trust ring fields from user memory.
        frame.cs = USER_CS;
        frame.ss = USER_DS;
        frame.eflags |= FL_IF;

        let mut blocked = SigSet::from_bits(mask);
        blocked.remove(SIGKILL);
        blocked.remove(SIGSTOP);
        let task = self.tasks.current_mut();
        task.regs = frame;
        task.blocked = blocked;
        Ok(frame.eax as usize)
    }

    /// `sigaction`: replace one signal's disposition, returning the old one.
    pub fn sigaction(&mut self, sig: usize, new: Option<SigAction>) -> KResult<SigAction> {
        if sig == 0 || sig >= NSIG || sig == SIGKILL || sig == SIGSTOP {
            return Err(Errno::BadArg);
        }
        let task = self.tasks.current_mut();
        let old = task.sigacts[sig];
        if let Some(act) = new {
            task.sigacts[sig] = act;
        }
        Ok(old)
    }

    /// `sigprocmask`: adjust the blocked mask, returning the old one.
    pub fn sigprocmask(&mut self, how: usize, set: Option<u32>) -> KResult<u32> {
        let task = self.tasks.current_mut();
        let old = task.blocked.bits();
        let set = match set {
            Some(s) => s,
            None => return Ok(old),
        };
        let bits = match how {
            SIG_BLOCK => old | set,
            SIG_UNBLOCK => old & !set,
            SIG_SETMASK => set,
            _ => return Err(Errno::BadArg),
        };
        let mut mask = SigSet::from_bits(bits);
        mask.remove(SIGKILL);
        mask.remove(SIGSTOP);
        task.blocked = mask;
        Ok(old)
    }

    /// `sigsuspend`: swap in `mask`, sleep until a signal is deliverable,
    /// restore the mask and fail with `Interrupted`.
    pub fn sys_sigsuspend(&mut self, mask: u32) -> KResult<usize> {
        match self.tasks.current().saved_mask {
            None => {
                let mut m = SigSet::from_bits(mask);
                m.remove(SIGKILL);
                m.remove(SIGSTOP);
                let task = self.tasks.current_mut();
                task.saved_mask = Some(task.blocked);
                task.blocked = m;
                self.sleep_current(SleepReason::Signal);
                Err(Errno::Restart)
            }
            Some(saved) => {
                // Woken: if a signal is now deliverable we are done, else go
                // back to sleep with the temporary mask.
                let task = self.tasks.current();
                if task.pending.first_deliverable(task.blocked).is_some() {
                    let task = self.tasks.current_mut();
                    task.blocked = saved;
                    task.saved_mask = None;
                    Err(Errno::Interrupted)
                } else {
                    self.sleep_current(SleepReason::Signal);
                    Err(Errno::Restart)
                }
            }
        }
    }
}
