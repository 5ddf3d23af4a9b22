//! End-to-end scenarios: boot a kernel value, mount the boot image, and
//! drive it the way the trap path would.

use crate::{
    arch::RegFrame,
    elf::{ElfHdr, ProgFlags, ProgHdr},
    err::Errno,
    fs::{romfs::image::ImageBuilder, Dirent, FileMode, OpenFlags, PathBuf},
    kernel::Kernel,
    memlayout::{UBASE, USTACK_TOP},
    param::PGSIZE,
    proc::{
        FdEntry, Pid, SigAction, SleepReason, TaskState, SIGCHLD, SIGCONT, SIGSTOP, SIGUSR1,
        WNOHANG,
    },
    syscall::{NR_CLOSE, NR_OPEN, NR_READ, NR_WRITE},
    vm::PteFlags,
};

use zerocopy::AsBytes;

/// The kernel is a large value; run each test on a roomy stack.
fn with_kernel<F: FnOnce(&mut Kernel) + Send + 'static>(f: F) {
    std::thread::Builder::new()
        .stack_size(16 * 1024 * 1024)
        .spawn(move || {
            let mut k = Box::new(Kernel::new());
            f(&mut k);
        })
        .unwrap()
        .join()
        .unwrap();
}

fn path(s: &str) -> PathBuf {
    PathBuf::from_bytes(s.as_bytes()).unwrap()
}

/// A little ELF32 executable: one PT_LOAD page of nops at UBASE.
fn build_elf() -> Vec<u8> {
    let code = [0x90u8; 32];
    let hdr = ElfHdr {
        magic: crate::elf::ELF_MAGIC,
        class: 1,
        data: 1,
        ident_version: 1,
        osabi: 0,
        pad: [0; 8],
        typ: 2,
        machine: 3,
        version: 1,
        entry: UBASE as u32,
        phoff: 52,
        shoff: 0,
        flags: 0,
        ehsize: 52,
        phentsize: 32,
        phnum: 1,
        shentsize: 0,
        shnum: 0,
        shstrndx: 0,
    };
    let ph = ProgHdr {
        typ: crate::elf::ELF_PROG_LOAD,
        off: 84,
        vaddr: UBASE as u32,
        paddr: UBASE as u32,
        filesz: code.len() as u32,
        memsz: code.len() as u32,
        flags: ProgFlags::READ | ProgFlags::EXEC,
        align: PGSIZE as u32,
    };
    let mut out = Vec::new();
    out.extend_from_slice(hdr.as_bytes());
    out.extend_from_slice(ph.as_bytes());
    out.extend_from_slice(&code);
    out
}

/// The standard boot image used by the scenarios.
fn build_boot_image() -> Vec<u8> {
    let mut b = ImageBuilder::new();
    b.add_dir(0, b"dev", 0o755);
    b.add_dir(0, b"mnt", 0o755);
    let etc = b.add_dir(0, b"etc", 0o755);
    b.add_file(etc, b"motd", 0o644, b"hello world\n");
    let bin = b.add_dir(0, b"bin", 0o755);
    b.add_file_owned(bin, b"secret", 0o600, 5, 5, b"top secret");
    b.add_symlink(0, b"lnk", b"/etc/motd");
    b.add_symlink(0, b"loop1", b"/loop2");
    b.add_symlink(0, b"loop2", b"/loop1");
    let elf = build_elf();
    b.add_file(0, b"init", 0o755, &elf);
    b.build()
}

fn boot(k: &mut Kernel) {
    let image: &'static [u8] = Box::leak(build_boot_image().into_boxed_slice());
    k.bootstrap(image.as_ptr() as usize).unwrap();
}

/// A bare user task with a scratch page at UBASE and one stack page,
/// installed as the current task.
fn spawn_user(k: &mut Kernel) -> Pid {
    let pid = k.tasks.alloc().unwrap();
    k.map_new_page(pid, UBASE, PteFlags::WRITABLE).unwrap();
    k.map_new_page(pid, USTACK_TOP - PGSIZE, PteFlags::WRITABLE)
        .unwrap();
    let task = k.tasks.get_mut(pid);
    task.state = TaskState::Running;
    task.regs = RegFrame::user(UBASE as u32, USTACK_TOP as u32);
    k.tasks.current = pid;
    pid
}

fn put_cstr(k: &mut Kernel, pid: Pid, addr: usize, s: &[u8]) {
    k.copy_out_bytes(pid, addr, s).unwrap();
    k.copy_out_bytes(pid, addr + s.len(), &[0]).unwrap();
}

/// Σ fd-table entries across tasks must equal Σ open-file reference counts.
fn assert_fd_accounting(k: &Kernel) {
    let fd_entries: usize = k
        .tasks
        .iter()
        .filter(|t| t.state != TaskState::Unused)
        .map(|t| t.files.iter().filter(|f| f.is_some()).count())
        .sum();
    assert_eq!(fd_entries, k.ftable.total_refs());
}

#[test]
fn mount_and_open_through_the_gate() {
    with_kernel(|k| {
        boot(k);
        let pid = spawn_user(k);

        put_cstr(k, pid, UBASE, b"/etc/motd");
        let fd = k
            .syscall(NR_OPEN, UBASE, OpenFlags::RDONLY.bits() as usize, 0)
            .unwrap();

        let n = k.syscall(NR_READ, fd, UBASE + 256, 64).unwrap();
        assert_eq!(n, 12);
        let mut buf = [0u8; 12];
        k.copy_in_bytes(pid, &mut buf, UBASE + 256).unwrap();
        assert_eq!(&buf, b"hello world\n");

        assert_eq!(k.syscall(NR_CLOSE, fd, 0, 0).unwrap(), 0);
        assert_eq!(k.ftable.live_count(), 0);
    });
}

#[test]
fn rtc_read_blocks_until_next_tick() {
    with_kernel(|k| {
        boot(k);
        let pid = spawn_user(k);

        let fid = k
            .file_open(&path("/dev/rtc"), OpenFlags::RDWR, FileMode::empty(), 0, 0)
            .unwrap();
        let mut byte = [0u8; 1];

        // No tick yet: the read parks the task.
        assert_eq!(k.file_read(fid, &mut byte).unwrap_err(), Errno::Restart);
        assert_eq!(k.tasks.get(pid).state, TaskState::Sleeping);
        assert_eq!(k.tasks.get(pid).sleep, Some(SleepReason::Io));

        // The tick wakes it and the re-issued read completes.
        let mut frame = RegFrame::user(UBASE as u32, USTACK_TOP as u32);
        k.on_tick(&mut frame);
        assert_eq!(k.tasks.get(pid).state, TaskState::Running);
        assert_eq!(k.tasks.current, pid);
        assert_eq!(k.file_read(fid, &mut byte).unwrap(), 1);

        // And blocks again until the tick after.
        assert_eq!(k.file_read(fid, &mut byte).unwrap_err(), Errno::Restart);
        k.file_close(fid).unwrap();
    });
}

#[test]
fn fork_exit_waitpid_roundtrip() {
    with_kernel(|k| {
        boot(k);
        let parent = spawn_user(k);
        let child = k.fork_current().unwrap();
        assert_ne!(child, parent);

        // Child: fd table, handlers and cwd match; fork returns 0 there.
        assert_eq!(k.tasks.get(child).regs.eax, 0);
        assert_eq!(k.tasks.get(child).parent, parent);
        assert_eq!(k.tasks.get(child).cwd, k.tasks.get(parent).cwd);

        // Parent blocks first, then the child's exit wakes it.
        assert_eq!(
            k.sys_waitpid(child, 0, 0).unwrap_err(),
            Errno::Restart
        );
        assert_eq!(k.tasks.get(parent).state, TaskState::Sleeping);

        k.tasks.current = child;
        k.tasks.get_mut(child).state = TaskState::Running;
        k.sys_exit(7).unwrap();
        assert_eq!(k.tasks.get(child).state, TaskState::Zombie);
        assert_eq!(k.tasks.get(parent).state, TaskState::Runnable);

        // Parent reaps: status is the exit code, the slot is recycled.
        k.tasks.current = parent;
        k.tasks.get_mut(parent).state = TaskState::Running;
        let statusp = UBASE + 512;
        let got = k.sys_waitpid(child, statusp, 0).unwrap();
        assert_eq!(got, child as usize);
        let st: i32 = k.copy_in(parent, statusp).unwrap();
        assert_eq!(st, 7);
        assert_eq!(k.tasks.get(child).state, TaskState::Unused);

        // No more children.
        assert_eq!(k.sys_waitpid(-1, 0, 0).unwrap_err(), Errno::NoChild);
    });
}

#[test]
fn waitpid_nohang_returns_zero() {
    with_kernel(|k| {
        let _parent = spawn_user(k);
        let child = k.fork_current().unwrap();
        assert_eq!(k.sys_waitpid(child, 0, WNOHANG).unwrap(), 0);
        assert_fd_accounting(k);
    });
}

#[test]
fn cow_isolates_parent_and_child() {
    with_kernel(|k| {
        let parent = spawn_user(k);
        k.copy_out_bytes(parent, UBASE, b"A").unwrap();

        let child = k.fork_current().unwrap();

        // Both mappings lost the write bit and turned COW.
        for pid in [parent, child] {
            let (_, e) = k.tasks.get(pid).pages.find(UBASE).unwrap();
            assert!(e.cow);
            assert!(!e.flags.contains(PteFlags::WRITABLE));
        }

        // Child writes through the fault path; the parent keeps its byte.
        k.copy_out_bytes(child, UBASE, b"B").unwrap();
        let mut a = [0u8; 1];
        k.copy_in_bytes(parent, &mut a, UBASE).unwrap();
        assert_eq!(&a, b"A");
        let mut b = [0u8; 1];
        k.copy_in_bytes(child, &mut b, UBASE).unwrap();
        assert_eq!(&b, b"B");

        // The parent's next write clears its COW in place.
        k.copy_out_bytes(parent, UBASE, b"A").unwrap();
        for pid in [parent, child] {
            let (_, e) = k.tasks.get(pid).pages.find(UBASE).unwrap();
            assert!(!e.cow);
            assert!(e.flags.contains(PteFlags::WRITABLE));
        }
    });
}

#[test]
fn write_fault_on_sole_cow_page_restores_in_place() {
    with_kernel(|k| {
        let parent = spawn_user(k);
        let child = k.fork_current().unwrap();

        // Reap the child so the parent is the frame's only holder.
        k.tasks.current = child;
        k.tasks.get_mut(child).state = TaskState::Running;
        k.sys_exit(0).unwrap();
        k.tasks.current = parent;
        k.sys_waitpid(child, 0, 0).unwrap();

        let (_, before) = k.tasks.get(parent).pages.find(UBASE).unwrap();
        assert!(before.cow);

        // The hardware write fault clears COW without copying.
        k.page_fault(parent, UBASE + 5, true).unwrap();
        let (_, after) = k.tasks.get(parent).pages.find(UBASE).unwrap();
        assert!(!after.cow);
        assert!(after.flags.contains(PteFlags::WRITABLE));
        assert_eq!(after.paddr, before.paddr);

        // Faults on unmapped addresses are refused.
        assert_eq!(
            k.page_fault(parent, UBASE + 64 * PGSIZE, true).unwrap_err(),
            Errno::BadAddress
        );
    });
}

#[test]
fn signal_trampoline_roundtrip() {
    with_kernel(|k| {
        let target = spawn_user(k);
        let handler = 0x0804_1230u32;
        k.sigaction(
            SIGUSR1,
            Some(SigAction {
                handler,
                mask: 0,
                flags: 0,
            }),
        )
        .unwrap();

        let before = k.tasks.get(target).regs;
        let old_blocked = k.tasks.get(target).blocked;

        k.sys_kill(target, SIGUSR1).unwrap();
        k.deliver_pending(target);

        // The handler frame is in place.
        let regs = k.tasks.get(target).regs;
        assert_eq!(regs.eip, handler);
        let sig: u32 = k.copy_in(target, regs.esp as usize + 4).unwrap();
        assert_eq!(sig as usize, SIGUSR1);
        assert!(k.tasks.get(target).blocked.contains(SIGUSR1));
        assert!(!k.tasks.get(target).pending.contains(SIGUSR1));

        // Handler returns through the stub, which issues sigreturn.
        k.tasks.get_mut(target).regs.esp = regs.esp + 4;
        let restored_eax = k.sys_sigreturn().unwrap();
        let after = k.tasks.get(target).regs;
        assert_eq!(restored_eax as u32, before.eax);
        assert_eq!(after.eip, before.eip);
        assert_eq!(after.esp, before.esp);
        assert_eq!(k.tasks.get(target).blocked, old_blocked);

        // Delivery was exactly once.
        let eip = k.tasks.get(target).regs.eip;
        k.deliver_pending(target);
        assert_eq!(k.tasks.get(target).regs.eip, eip);
    });
}

#[test]
fn sigsuspend_wakes_on_signal_and_restores_mask() {
    with_kernel(|k| {
        let pid = spawn_user(k);
        let mut blocked = crate::proc::SigSet::empty();
        blocked.add(SIGUSR1);
        k.tasks.get_mut(pid).blocked = blocked;

        // Suspend with SIGUSR1 unblocked.
        assert_eq!(k.sys_sigsuspend(0).unwrap_err(), Errno::Restart);
        assert_eq!(k.tasks.get(pid).state, TaskState::Sleeping);
        assert!(!k.tasks.get(pid).blocked.contains(SIGUSR1));

        k.sys_kill(pid, SIGUSR1).unwrap();
        assert_eq!(k.tasks.get(pid).state, TaskState::Runnable);

        // The re-issued call reports the interruption and restores the mask.
        k.tasks.get_mut(pid).state = TaskState::Running;
        assert_eq!(k.sys_sigsuspend(0).unwrap_err(), Errno::Interrupted);
        assert!(k.tasks.get(pid).blocked.contains(SIGUSR1));
        assert!(k.tasks.get(pid).saved_mask.is_none());
    });
}

#[test]
fn stop_and_continue() {
    with_kernel(|k| {
        let pid = spawn_user(k);
        k.sys_kill(pid, SIGSTOP).unwrap();
        k.deliver_pending(pid);
        assert_eq!(k.tasks.get(pid).state, TaskState::Sleeping);
        assert_eq!(k.tasks.get(pid).sleep, Some(SleepReason::Stopped));

        // Ordinary signals do not resume a stopped task; SIGCONT does.
        k.sys_kill(pid, SIGUSR1).unwrap();
        assert_eq!(k.tasks.get(pid).state, TaskState::Sleeping);
        k.sys_kill(pid, SIGCONT).unwrap();
        assert_eq!(k.tasks.get(pid).state, TaskState::Runnable);
    });
}

#[test]
fn default_action_terminates_and_notifies_parent() {
    with_kernel(|k| {
        let parent = spawn_user(k);
        let child = k.fork_current().unwrap();

        k.sys_kill(child, crate::proc::SIGKILL).unwrap();
        k.tasks.current = child;
        k.tasks.get_mut(child).state = TaskState::Running;
        k.deliver_pending(child);
        assert_eq!(k.tasks.get(child).state, TaskState::Zombie);
        assert!(k.tasks.get(parent).pending.contains(SIGCHLD));

        k.tasks.current = parent;
        let statusp = UBASE + 512;
        let got = k.sys_waitpid(-1, statusp, 0).unwrap();
        assert_eq!(got, child as usize);
        let st: i32 = k.copy_in(parent, statusp).unwrap();
        assert_eq!((st >> 8) & 0x7f, crate::proc::SIGKILL as i32);
        assert_eq!(st & 0xff, 0);
    });
}

#[test]
fn readdir_enumerates_every_entry_exactly_once() {
    with_kernel(|k| {
        boot(k);
        let _pid = spawn_user(k);
        let fid = k
            .file_open(&path("/"), OpenFlags::RDONLY, FileMode::empty(), 0, 0)
            .unwrap();

        let mut seen: Vec<Vec<u8>> = Vec::new();
        let mut d = Dirent::new();
        loop {
            match k.file_readdir(fid, &mut d) {
                Ok(()) => seen.push(d.name().to_vec()),
                Err(Errno::NotFound) => break,
                Err(e) => panic!("readdir failed: {:?}", e),
            }
        }
        k.file_close(fid).unwrap();

        let mut names: Vec<&[u8]> = seen.iter().map(|n| n.as_slice()).collect();
        names.sort();
        assert_eq!(
            names,
            vec![
                b"bin".as_ref(),
                b"dev",
                b"etc",
                b"init",
                b"lnk",
                b"loop1",
                b"loop2",
                b"mnt",
            ]
        );
    });
}

#[test]
fn umount_busy_until_last_close() {
    with_kernel(|k| {
        boot(k);
        let _pid = spawn_user(k);

        // A second romfs instance mounted at /mnt.
        let sub: &'static [u8] = {
            let mut b = ImageBuilder::new();
            b.add_file(0, b"file", 0o644, b"x");
            Box::leak(b.build().into_boxed_slice())
        };
        k.mount(
            b"romfs",
            &path("/mnt"),
            crate::fs::MountFlags::RDONLY,
            sub.as_ptr() as usize,
            b"",
            0,
            0,
        )
        .unwrap();

        let fid = k
            .file_open(&path("/mnt/file"), OpenFlags::RDONLY, FileMode::empty(), 0, 0)
            .unwrap();
        assert_eq!(k.umount(&path("/mnt"), 0, 0).unwrap_err(), Errno::Busy);

        k.file_close(fid).unwrap();
        k.umount(&path("/mnt"), 0, 0).unwrap();
        assert_eq!(
            k.namei(&path("/mnt/file"), true).unwrap_err(),
            Errno::NotFound
        );
    });
}

#[test]
fn symlinks_follow_and_loop() {
    with_kernel(|k| {
        boot(k);
        let _pid = spawn_user(k);

        // /lnk -> /etc/motd reads the file through the link.
        let fid = k
            .file_open(&path("/lnk"), OpenFlags::RDONLY, FileMode::empty(), 0, 0)
            .unwrap();
        let mut buf = [0u8; 32];
        let n = k.file_read(fid, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello world\n");
        k.file_close(fid).unwrap();

        // lstat-style resolution sees the link itself.
        let ip = k.namei(&path("/lnk"), false).unwrap();
        assert_eq!(k.itable.get(ip).itype, crate::fs::IType::Symlink);
        k.iput(ip).unwrap();

        // A cycle is caught.
        assert_eq!(k.namei(&path("/loop1"), true).unwrap_err(), Errno::Loop);
    });
}

#[test]
fn permission_checks_owner_group_other() {
    with_kernel(|k| {
        boot(k);
        let _pid = spawn_user(k);
        let secret = path("/bin/secret");

        // Owner reads, others do not, root always does.
        assert!(k
            .file_open(&secret, OpenFlags::RDONLY, FileMode::empty(), 5, 5)
            .map(|f| k.file_close(f).unwrap())
            .is_ok());
        assert_eq!(
            k.file_open(&secret, OpenFlags::RDONLY, FileMode::empty(), 7, 7)
                .unwrap_err(),
            Errno::PermissionDenied
        );
        assert!(k
            .file_open(&secret, OpenFlags::RDONLY, FileMode::empty(), 0, 0)
            .map(|f| k.file_close(f).unwrap())
            .is_ok());

        // Writing a read-only fs is refused at the driver.
        let fid = k
            .file_open(&secret, OpenFlags::RDWR, FileMode::empty(), 5, 5)
            .unwrap();
        assert_eq!(k.file_write(fid, b"x").unwrap_err(), Errno::NotPermitted);
        k.file_close(fid).unwrap();
    });
}

#[test]
fn dup_shares_the_file_position() {
    with_kernel(|k| {
        boot(k);
        let pid = spawn_user(k);
        put_cstr(k, pid, UBASE, b"/etc/motd");
        let fd = k
            .syscall(NR_OPEN, UBASE, OpenFlags::RDONLY.bits() as usize, 0)
            .unwrap();
        let fd2 = k.syscall(crate::syscall::NR_DUP, fd, 0, 0).unwrap();
        assert_ne!(fd, fd2);

        let n = k.syscall(NR_READ, fd, UBASE + 256, 6).unwrap();
        assert_eq!(n, 6);
        let n = k.syscall(NR_READ, fd2, UBASE + 512, 6).unwrap();
        assert_eq!(n, 6);
        let mut buf = [0u8; 6];
        k.copy_in_bytes(pid, &mut buf, UBASE + 512).unwrap();
        assert_eq!(&buf, b"world\n");

        assert_eq!(k.syscall(NR_CLOSE, fd, 0, 0).unwrap(), 0);
        // The duplicate still works after the original closes.
        let n = k.syscall(NR_READ, fd2, UBASE + 512, 6).unwrap();
        assert_eq!(n, 0);
        assert_eq!(k.syscall(NR_CLOSE, fd2, 0, 0).unwrap(), 0);
        assert_eq!(k.ftable.live_count(), 0);
    });
}

#[test]
fn open_close_restores_counts() {
    with_kernel(|k| {
        boot(k);
        let _pid = spawn_user(k);
        let files_before = k.ftable.live_count();
        let frames_before = k.frames.live_count();

        let fid = k
            .file_open(&path("/etc/motd"), OpenFlags::RDONLY, FileMode::empty(), 0, 0)
            .unwrap();
        assert_eq!(k.ftable.live_count(), files_before + 1);
        k.file_close(fid).unwrap();

        assert_eq!(k.ftable.live_count(), files_before);
        assert_eq!(k.frames.live_count(), frames_before);
    });
}

#[test]
fn exit_releases_every_fd() {
    with_kernel(|k| {
        boot(k);
        let pid = spawn_user(k);
        for _ in 0..3 {
            let fid = k
                .file_open(&path("/etc/motd"), OpenFlags::RDONLY, FileMode::empty(), 0, 0)
                .unwrap();
            k.tasks
                .current_mut()
                .fd_install(FdEntry {
                    file: fid,
                    cloexec: false,
                })
                .unwrap();
        }
        assert_eq!(k.ftable.live_count(), 3);
        k.do_exit(pid, 0);
        assert_eq!(k.ftable.live_count(), 0);
        assert_eq!(k.tasks.get(pid).state, TaskState::Zombie);
        assert!(k.tasks.get(pid).pages.is_empty());
    });
}

#[test]
fn execve_loads_the_image_and_builds_the_stack() {
    with_kernel(|k| {
        boot(k);
        let init = path("/init");
        let pid = k.spawn(&init, &[&b"init"[..], &b"-s"[..]]).unwrap();

        let task = k.tasks.get(pid);
        assert_eq!(task.state, TaskState::Runnable);
        assert_eq!(task.regs.eip, UBASE as u32);
        assert_eq!(task.regs.cs, crate::arch::USER_CS);

        // Stack: argc, then the argv pointers, NUL-terminated strings above.
        let sp = task.regs.esp as usize;
        let argc: u32 = k.copy_in(pid, sp).unwrap();
        assert_eq!(argc, 2);
        let argv0: u32 = k.copy_in(pid, sp + 4).unwrap();
        let mut name = [0u8; 5];
        k.copy_in_bytes(pid, &mut name, argv0 as usize).unwrap();
        assert_eq!(&name, b"init\0");
        let null: u32 = k.copy_in(pid, sp + 12).unwrap();
        assert_eq!(null, 0);

        // The image page holds the nops from the file.
        let mut code = [0u8; 4];
        k.copy_in_bytes(pid, &mut code, UBASE).unwrap();
        assert_eq!(code, [0x90; 4]);
    });
}

#[test]
fn execve_rejects_non_elf() {
    with_kernel(|k| {
        boot(k);
        let pid = spawn_user(k);
        let args = crate::exec::StagedArgs::new();
        assert_eq!(
            k.exec_task(pid, &path("/etc/motd"), &args).unwrap_err(),
            Errno::NotExec
        );
        // Pre-commit failure: the old address space survives.
        assert_eq!(k.tasks.get(pid).pages.len(), 2);
    });
}

#[test]
fn execve_keeps_fds_except_close_on_exec() {
    with_kernel(|k| {
        boot(k);
        let pid = spawn_user(k);
        let keep = k
            .file_open(&path("/etc/motd"), OpenFlags::RDONLY, FileMode::empty(), 0, 0)
            .unwrap();
        let gone = k
            .file_open(&path("/etc/motd"), OpenFlags::RDONLY, FileMode::empty(), 0, 0)
            .unwrap();
        let kfd = k
            .tasks
            .current_mut()
            .fd_install(FdEntry {
                file: keep,
                cloexec: false,
            })
            .unwrap();
        let gfd = k
            .tasks
            .current_mut()
            .fd_install(FdEntry {
                file: gone,
                cloexec: true,
            })
            .unwrap();

        let args = crate::exec::StagedArgs::new();
        k.exec_task(pid, &path("/init"), &args).unwrap();

        assert!(k.tasks.get(pid).fd_get(kfd).is_ok());
        assert_eq!(k.tasks.get(pid).fd_get(gfd).unwrap_err(), Errno::BadFd);
        assert_eq!(k.ftable.live_count(), 1);
        let entry = k.tasks.get_mut(pid).fd_take(kfd).unwrap();
        k.file_close(entry.file).unwrap();
    });
}

#[test]
fn brk_grows_and_shrinks_the_heap() {
    with_kernel(|k| {
        let pid = spawn_user(k);
        // Keep the scratch mappings clear of the heap.
        {
            let t = k.tasks.get_mut(pid);
            t.heap_base = UBASE + 16 * PGSIZE;
            t.brk = UBASE + 16 * PGSIZE;
        }
        let base = UBASE + 16 * PGSIZE;
        let frames_before = k.frames.live_count();
        let brk = |k: &mut Kernel, addr: usize| k.syscall(crate::syscall::NR_BRK, addr, 0, 0);

        assert_eq!(brk(k, 0).unwrap(), base);
        assert_eq!(brk(k, base + 3 * PGSIZE).unwrap(), base + 3 * PGSIZE);
        assert_eq!(k.frames.live_count(), frames_before + 3);

        // The new pages are zeroed and writable.
        k.copy_out_bytes(pid, base + PGSIZE, b"heap").unwrap();

        assert_eq!(brk(k, base).unwrap(), base);
        assert_eq!(k.frames.live_count(), frames_before);

        // sbrk reports the old break.
        assert_eq!(
            k.syscall(crate::syscall::NR_SBRK, PGSIZE, 0, 0).unwrap(),
            base
        );
        assert_eq!(brk(k, 0).unwrap(), base + PGSIZE);
    });
}

#[test]
fn nanosleep_waits_for_the_deadline() {
    with_kernel(|k| {
        let pid = spawn_user(k);
        // 1/100 s == one tick.
        assert_eq!(k.sys_nanosleep(0, 10_000_000).unwrap_err(), Errno::Restart);
        assert_eq!(k.tasks.get(pid).state, TaskState::Sleeping);

        let mut frame = RegFrame::user(UBASE as u32, USTACK_TOP as u32);
        k.on_tick(&mut frame);
        assert_eq!(k.tasks.current, pid);
        assert_eq!(k.sys_nanosleep(0, 10_000_000).unwrap(), 0);
    });
}

#[test]
fn blocked_syscall_interrupted_by_signal() {
    with_kernel(|k| {
        boot(k);
        let pid = spawn_user(k);
        k.sigaction(
            SIGUSR1,
            Some(SigAction {
                handler: 0x0804_2000,
                mask: 0,
                flags: 0,
            }),
        )
        .unwrap();

        let fid = k
            .file_open(&path("/dev/rtc"), OpenFlags::RDONLY, FileMode::empty(), 0, 0)
            .unwrap();
        let mut byte = [0u8; 1];
        let res = k.file_read(fid, &mut byte);
        assert_eq!(res.unwrap_err(), Errno::Restart);

        // A signal lands while the task is parked; the gate converts the
        // restart into EINTR instead of re-sleeping.
        k.sys_kill(pid, SIGUSR1).unwrap();
        k.finish_syscall(Err(Errno::Restart));
        let task = k.tasks.get(pid);
        assert_eq!(task.state, TaskState::Running);
        assert_eq!(task.regs.eax as i32, Errno::Interrupted.as_neg() as i32);
        k.file_close(fid).unwrap();
    });
}

#[test]
fn scheduler_round_robin_skips_sleepers() {
    with_kernel(|k| {
        let a = spawn_user(k);
        let b = {
            let pid = k.tasks.alloc().unwrap();
            k.tasks.get_mut(pid).state = TaskState::Runnable;
            k.tasks.get_mut(pid).regs = RegFrame::user(UBASE as u32, USTACK_TOP as u32);
            pid
        };
        let c = {
            let pid = k.tasks.alloc().unwrap();
            k.tasks.get_mut(pid).state = TaskState::Sleeping;
            k.tasks.get_mut(pid).sleep = Some(SleepReason::Child(-1));
            pid
        };

        let mut frame = RegFrame::user(UBASE as u32, USTACK_TOP as u32);
        k.on_tick(&mut frame);
        assert_eq!(k.tasks.current, b);
        assert_eq!(k.tasks.get(b).state, TaskState::Running);
        assert_eq!(k.tasks.get(a).state, TaskState::Runnable);

        // The sleeper stays asleep; the next tick comes back to `a`.
        k.on_tick(&mut frame);
        assert_eq!(k.tasks.current, a);
        assert_eq!(k.tasks.get(c).state, TaskState::Sleeping);

        // Only one task runs at a time.
        let running = k
            .tasks
            .iter()
            .filter(|t| t.state == TaskState::Running)
            .count();
        assert_eq!(running, 1);
    });
}

#[test]
fn write_to_devnull_through_the_gate() {
    with_kernel(|k| {
        boot(k);
        let pid = spawn_user(k);
        put_cstr(k, pid, UBASE, b"/dev/null");
        let fd = k
            .syscall(NR_OPEN, UBASE, OpenFlags::WRONLY.bits() as usize, 0)
            .unwrap();
        k.copy_out_bytes(pid, UBASE + 256, b"discard").unwrap();
        assert_eq!(k.syscall(NR_WRITE, fd, UBASE + 256, 7).unwrap(), 7);
        assert_eq!(k.syscall(NR_CLOSE, fd, 0, 0).unwrap(), 0);
    });
}

#[test]
fn unknown_syscall_is_rejected() {
    with_kernel(|k| {
        let _pid = spawn_user(k);
        assert_eq!(k.syscall(9999, 0, 0, 0).unwrap_err(), Errno::BadSyscall);
    });
}

#[test]
fn relative_paths_resolve_against_cwd() {
    with_kernel(|k| {
        boot(k);
        let pid = spawn_user(k);
        k.tasks.current_mut().cwd = path("/etc");

        put_cstr(k, pid, UBASE, b"motd");
        let fd = k
            .syscall(NR_OPEN, UBASE, OpenFlags::RDONLY.bits() as usize, 0)
            .unwrap();
        assert_eq!(k.syscall(NR_READ, fd, UBASE + 256, 5).unwrap(), 5);
        assert_eq!(k.syscall(NR_CLOSE, fd, 0, 0).unwrap(), 0);

        // getdents walks the cwd through an opened ".".
        put_cstr(k, pid, UBASE, b".");
        let fd = k
            .syscall(NR_OPEN, UBASE, OpenFlags::RDONLY.bits() as usize, 0)
            .unwrap();
        let dirent = Dirent::new();
        k.copy_out(pid, UBASE + 1024, &dirent).unwrap();
        assert_eq!(
            k.syscall(crate::syscall::NR_GETDENTS, fd, UBASE + 1024, 0)
                .unwrap(),
            0
        );
        let d: Dirent = k.copy_in(pid, UBASE + 1024).unwrap();
        assert_eq!(d.name(), b"motd");
        assert_eq!(k.syscall(NR_CLOSE, fd, 0, 0).unwrap(), 0);
    });
}
