//! execve: load an ELF32 image over a task and enter it.

use arrayvec::ArrayVec;

use crate::{
    elf::{ElfHdr, ProgFlags, ProgHdr},
    err::{Errno, KResult},
    fs::{IType, OpenFlags, PathBuf, PERM_X},
    kernel::Kernel,
    memlayout::{is_user_addr, pg_round_up, USTACK_PAGES, USTACK_TOP},
    param::{ARG_MAX, MAXARG, MAXPHNUM, PGSIZE},
    proc::{signal::status_of_signal, Pid, SigAction, SIGKILL},
    vm::PteFlags,
};

use zerocopy::AsBytes;

/// argv/envp strings staged in kernel memory before the old address space
/// goes away.
pub struct StagedArgs {
    bytes: ArrayVec<u8, ARG_MAX>,
    argv: ArrayVec<(usize, usize), MAXARG>,
    envp: ArrayVec<(usize, usize), MAXARG>,
}

impl StagedArgs {
    pub fn new() -> Self {
        Self {
            bytes: ArrayVec::new(),
            argv: ArrayVec::new(),
            envp: ArrayVec::new(),
        }
    }

    fn push(&mut self, s: &[u8]) -> KResult<(usize, usize)> {
        let off = self.bytes.len();
        self.bytes
            .try_extend_from_slice(s)
            .map_err(|_| Errno::NoSpace)?;
        Ok((off, s.len()))
    }

    pub fn push_arg(&mut self, s: &[u8]) -> KResult<()> {
        let span = self.push(s)?;
        self.argv.try_push(span).map_err(|_| Errno::NoSpace)
    }

    pub fn push_env(&mut self, s: &[u8]) -> KResult<()> {
        let span = self.push(s)?;
        self.envp.try_push(span).map_err(|_| Errno::NoSpace)
    }

    pub fn argc(&self) -> usize {
        self.argv.len()
    }

    fn arg(&self, span: (usize, usize)) -> &[u8] {
        &self.bytes[span.0..span.0 + span.1]
    }
}

/// Highest user address an image may load at; the stack lives above it.
const IMAGE_TOP: usize = USTACK_TOP - USTACK_PAGES * PGSIZE;

impl Kernel {
    /// Replaces `pid`'s user image with the ELF at `path`.
    ///
    /// Failures before the commit point leave the task untouched. Once the
    /// old address space is gone a failure terminates the task instead.
    pub fn exec_task(&mut self, pid: Pid, path: &PathBuf, args: &StagedArgs) -> KResult<usize> {
        let (uid, gid) = {
            let t = self.tasks.get(pid);
            (t.uid, t.gid)
        };

        let ip = self.namei(path, true)?;
        let check = (|| {
            let inode = self.itable.get(ip);
            match inode.itype {
                IType::Directory => return Err(Errno::IsDir),
                IType::Regular => {}
                _ => return Err(Errno::NotExec),
            }
            crate::fs::inode::check_permission(inode, uid, gid, PERM_X)
        })();
        if let Err(e) = check {
            let _ = self.iput(ip);
            return Err(e);
        }
        let fid = self.file_open_inode(ip, OpenFlags::RDONLY)?;

        // Check ELF header.
        let result = self.load_image(pid, fid, args);
        let _ = self.file_close(fid);
        result
    }

    fn load_image(&mut self, pid: Pid, fid: crate::fs::FileId, args: &StagedArgs) -> KResult<usize> {
        let mut elf = ElfHdr::default();
        if self.file_pread(fid, elf.as_bytes_mut(), 0)? != core::mem::size_of::<ElfHdr>() {
            return Err(Errno::NotExec);
        }
        if !elf.is_valid() {
            return Err(Errno::NotExec);
        }
        if elf.phnum == 0 || elf.phentsize as usize != core::mem::size_of::<ProgHdr>() {
            return Err(Errno::NotExec);
        }
        if elf.phnum as usize > MAXPHNUM {
            return Err(Errno::NoSpace);
        }

        let mut loads: ArrayVec<ProgHdr, MAXPHNUM> = ArrayVec::new();
        for i in 0..elf.phnum as usize {
            let off = elf.phoff as usize + i * core::mem::size_of::<ProgHdr>();
            let mut ph = ProgHdr::default();
            if self.file_pread(fid, ph.as_bytes_mut(), off)? != core::mem::size_of::<ProgHdr>() {
                return Err(Errno::NotExec);
            }
            if !ph.is_prog_load() {
                continue;
            }
            let vaddr = ph.vaddr as usize;
            let end = vaddr.checked_add(ph.memsz as usize).ok_or(Errno::NotExec)?;
            if ph.memsz < ph.filesz
                || vaddr % PGSIZE != 0
                || !is_user_addr(vaddr)
                || end > IMAGE_TOP
            {
                return Err(Errno::NotExec);
            }
            loads.try_push(ph).map_err(|_| Errno::NoSpace)?;
        }
        if loads.is_empty() {
            return Err(Errno::NotExec);
        }

        // Commit point: tear down the old image. Any failure from here on
        // leaves no program to return to, so the task dies.
        self.free_user_pages(pid);
        {
            let t = self.tasks.get_mut(pid);
            t.heap_base = 0;
            t.brk = 0;
        }
        match self.build_image(pid, fid, &elf, &loads, args) {
            Ok(v) => Ok(v),
            Err(e) => {
                self.do_exit(pid, status_of_signal(SIGKILL));
                Err(e)
            }
        }
    }

    /// Load program segments and build the initial user stack.
    fn build_image(
        &mut self,
        pid: Pid,
        fid: crate::fs::FileId,
        elf: &ElfHdr,
        loads: &[ProgHdr],
        args: &StagedArgs,
    ) -> KResult<usize> {
        let mut heap_base = 0;
        let mut page = [0u8; PGSIZE];
        for ph in loads {
            let vaddr = ph.vaddr as usize;
            let filesz = ph.filesz as usize;
            let npages = pg_round_up(ph.memsz as usize) / PGSIZE;
            let flags = if ph.flags.contains(ProgFlags::WRITE) {
                PteFlags::WRITABLE
            } else {
                PteFlags::empty()
            };
            for j in 0..npages {
                let paddr = self.map_new_page(pid, vaddr + j * PGSIZE, flags)?;
                let want = filesz.saturating_sub(j * PGSIZE).min(PGSIZE);
                if want > 0 {
                    let off = ph.off as usize + j * PGSIZE;
                    if self.file_pread(fid, &mut page[..want], off)? != want {
                        return Err(Errno::Io);
                    }
                    self.frames.frame_mut(paddr)[..want].copy_from_slice(&page[..want]);
                }
            }
            heap_base = heap_base.max(pg_round_up(vaddr + ph.memsz as usize));
        }

        for k in 0..USTACK_PAGES {
            let va = USTACK_TOP - (k + 1) * PGSIZE;
            self.map_new_page(pid, va, PteFlags::WRITABLE)?;
        }

        // Marshal argv and envp onto the stack: string blobs first, then
        // the argc/argv/envp word block the entry code expects.
        let mut sp = USTACK_TOP;
        let mut argv_addrs: ArrayVec<u32, MAXARG> = ArrayVec::new();
        let mut envp_addrs: ArrayVec<u32, MAXARG> = ArrayVec::new();
        for &span in args.argv.iter() {
            sp -= span.1 + 1;
            self.copy_out_bytes(pid, sp, args.arg(span))?;
            self.copy_out_bytes(pid, sp + span.1, &[0])?;
            argv_addrs.push(sp as u32);
        }
        for &span in args.envp.iter() {
            sp -= span.1 + 1;
            self.copy_out_bytes(pid, sp, args.arg(span))?;
            self.copy_out_bytes(pid, sp + span.1, &[0])?;
            envp_addrs.push(sp as u32);
        }
        sp &= !3;

        let mut words: ArrayVec<u32, { 2 * MAXARG + 3 }> = ArrayVec::new();
        words.push(args.argc() as u32);
        words.extend(argv_addrs.iter().copied());
        words.push(0);
        words.extend(envp_addrs.iter().copied());
        words.push(0);
        sp -= words.len() * 4;
        for (i, w) in words.iter().enumerate() {
            self.copy_out(pid, sp + 4 * i, w)?;
        }

        let task = self.tasks.get_mut(pid);
        task.heap_base = heap_base;
        task.brk = heap_base;
        for act in task.sigacts.iter_mut() {
            *act = SigAction::default();
        }
        task.saved_mask = None;
        task.args.clear();
        for (i, &span) in args.argv.iter().enumerate() {
            if i > 0 && task.args.try_push(b' ').is_err() {
                break;
            }
            let _ = task.args.try_extend_from_slice(args.arg(span));
        }
        task.regs = crate::arch::RegFrame::user(elf.entry, sp as u32);

        // Close fds marked close-on-exec.
        for fd in 0..crate::param::NOFILE {
            let cloexec = matches!(self.tasks.get(pid).files[fd], Some(e) if e.cloexec);
            if cloexec {
                if let Some(entry) = self.tasks.get_mut(pid).files[fd].take() {
                    let _ = self.file_close(entry.file);
                }
            }
        }
        Ok(0)
    }

    /// Creates a task running `path` with `argv`; the boot path uses this
    /// for init.
    pub fn spawn(&mut self, path: &PathBuf, argv: &[&[u8]]) -> KResult<Pid> {
        let pid = self.tasks.alloc()?;
        {
            let parent = self.tasks.current;
            let t = self.tasks.get_mut(pid);
            t.parent = parent;
        }
        let mut args = StagedArgs::new();
        for a in argv {
            if let Err(e) = args.push_arg(a) {
                self.tasks.get_mut(pid).state = crate::proc::TaskState::Unused;
                return Err(e);
            }
        }
        match self.exec_task(pid, path, &args) {
            Ok(_) => {
                self.tasks.get_mut(pid).state = crate::proc::TaskState::Runnable;
                Ok(pid)
            }
            Err(e) => {
                let t = self.tasks.get_mut(pid);
                if t.state == crate::proc::TaskState::Unused
                    || t.state == crate::proc::TaskState::Zombie
                {
                    t.state = crate::proc::TaskState::Unused;
                }
                Err(e)
            }
        }
    }
}
