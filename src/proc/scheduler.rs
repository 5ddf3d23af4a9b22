//! The tick-driven scheduler and the return-to-user path.
//!
//! On every timer tick (and after every syscall) the kernel captures the
//! interrupted register frame, acts on pending signals, picks the next
//! runnable task round-robin, switches the address space and leaves through
//! IRET with the chosen task's frame.

use crate::{
    arch::{self, RegFrame, INT_INSN_LEN},
    err::Errno,
    kernel::Kernel,
    param::NPROC,
    proc::{Pid, SleepReason, TaskState},
};

impl Kernel {
    /// Timer interrupt: account the tick, wake expired sleepers, preempt
    /// the current task and leave through the next one.
    pub fn on_tick(&mut self, frame: &mut RegFrame) {
        if self.tasks.current().state == TaskState::Running {
            self.tasks.current_mut().regs = *frame;
        }
        self.ticks += 1;
        self.wake_sleepers();
        if self.tasks.current().state == TaskState::Running {
            self.tasks.current_mut().state = TaskState::Runnable;
        }
        self.schedule(frame);
    }

    /// System-call trap: capture the frame, dispatch, post-process the
    /// blocking protocol and return to user mode.
    pub fn on_syscall(&mut self, frame: &mut RegFrame) {
        self.tasks.current_mut().regs = *frame;
        let (num, a, b, c) = (
            frame.eax,
            frame.ebx as usize,
            frame.ecx as usize,
            frame.edx as usize,
        );
        let result = self.syscall(num, a, b, c);
        self.finish_syscall(result);
        self.return_to_user(frame);
    }

    /// Applies a syscall result to the current task: the return register,
    /// or the blocked-syscall restart protocol.
    pub fn finish_syscall(&mut self, result: Result<usize, Errno>) {
        let pid = self.tasks.current;
        match result {
            Err(Errno::Restart) => {
                if self.has_deliverable(pid) {
                    // A signal interrupted the wait before it began.
                    let task = self.tasks.get_mut(pid);
                    task.state = TaskState::Running;
                    task.sleep = None;
                    task.timer_until = None;
                    task.regs.eax = Errno::Interrupted.as_neg() as u32;
                } else {
                    // Rewind over `int 0x80` so wakeup re-issues the call.
                    self.tasks.get_mut(pid).regs.eip -= INT_INSN_LEN;
                }
            }
            result => {
                let task = self.tasks.get_mut(pid);
                if task.state == TaskState::Running {
                    task.regs.eax = match result {
                        Ok(v) => v as u32,
                        Err(e) => e.as_neg() as u32,
                    };
                }
            }
        }
    }

    /// Delivers signals to the current task and leaves either back into it
    /// or, if it blocked or died, through the next runnable task.
    pub fn return_to_user(&mut self, frame: &mut RegFrame) {
        let pid = self.tasks.current;
        if self.tasks.get(pid).state == TaskState::Running {
            self.deliver_pending(pid);
        }
        if self.tasks.current().state == TaskState::Running {
            *frame = self.tasks.current().regs;
            return;
        }
        self.schedule(frame);
    }

    /// Round-robin pick starting after the current slot, idle (pid 0) as
    /// the fallback. The chosen task gets its signals delivered before the
    /// frame is handed back; a task killed by that delivery is skipped.
    pub fn schedule(&mut self, frame: &mut RegFrame) {
        loop {
            let next = self.pick_next();
            self.tasks.current = next;
            self.tasks.get_mut(next).state = TaskState::Running;
            self.deliver_pending(next);
            if self.tasks.get(next).state == TaskState::Running {
                break;
            }
        }
        let current = self.tasks.current();
        *frame = current.regs;
        arch::switch_address_space(&current.pages, self.frames.base_addr());
    }

    fn pick_next(&self) -> Pid {
        let start = self.tasks.current as usize + 1;
        for i in 0..NPROC {
            let pid = ((start + i) % NPROC) as Pid;
            if pid == 0 {
                continue;
            }
            if self.tasks.get(pid).state == TaskState::Runnable {
                return pid;
            }
        }
        0
    }

    /// Returns expired timer sleeps and tick-driven I/O waits to the
    /// runnable pool.
    fn wake_sleepers(&mut self) {
        let now = self.ticks;
        for i in 0..NPROC {
            let task = self.tasks.get_mut(i as Pid);
            if task.state != TaskState::Sleeping {
                continue;
            }
            match task.sleep {
                Some(SleepReason::Io) => {
                    task.state = TaskState::Runnable;
                    task.sleep = None;
                }
                Some(SleepReason::Timer) => {
                    if task.timer_until.map_or(true, |until| now >= until) {
                        task.state = TaskState::Runnable;
                        task.sleep = None;
                    }
                }
                _ => {}
            }
        }
    }
}
