//! The kernel object: every global table in one place, plus boot-time
//! bring-up.
//!
//! Kernel code runs to completion between traps, so a single lock around
//! the one `Kernel` instance is the only synchronization the core needs;
//! syscalls and the scheduler are `&mut self` methods.

use spin::{Mutex, Once};

use crate::{
    err::KResult,
    fs::{devfs, romfs, FileTable, FsTab, Itable, MountFlags, PathBuf},
    proc::{TaskState, TaskTable},
    vm::FramePool,
};

pub struct Kernel {
    pub fstab: FsTab,
    pub devsw: devfs::DevSw,
    pub itable: Itable,
    pub ftable: FileTable,
    pub frames: FramePool,
    pub tasks: TaskTable,
    /// Timer ticks since boot.
    pub ticks: u64,
}

static KERNEL: Once<Mutex<Kernel>> = Once::new();

/// The kernel instance. Valid after `kernel_init`.
pub fn kernel() -> &'static Mutex<Kernel> {
    KERNEL.get().expect("kernel not initialized")
}

/// Creates the kernel instance at boot.
pub fn kernel_init() -> &'static Mutex<Kernel> {
    KERNEL.call_once(|| Mutex::new(Kernel::new()))
}

impl Kernel {
    pub fn new() -> Self {
        Self {
            fstab: FsTab::new(),
            devsw: devfs::DevSw::new(),
            itable: Itable::new(),
            ftable: FileTable::new(),
            frames: FramePool::new(),
            tasks: TaskTable::new(),
            ticks: 0,
        }
    }

    /// Registers the in-tree drivers and mounts the boot filesystems: the
    /// ROM image at `/`, devfs at `/dev`. The image must carry a `dev`
    /// directory to serve as the mountpoint.
    pub fn bootstrap(&mut self, image: usize) -> KResult<()> {
        self.fstab.register_fs(romfs::FS_TYPE)?;
        devfs::install(self)?;

        // The idle task owns the boot context.
        self.tasks.get_mut(0).state = TaskState::Runnable;
        self.tasks.current = 0;

        self.mount(b"romfs", &PathBuf::root(), MountFlags::RDONLY, image, b"", 0, 0)?;
        let dev = PathBuf::from_bytes(b"/dev")?;
        self.mount(b"devfs", &dev, MountFlags::empty(), 0, b"", 0, 0)?;
        Ok(())
    }
}

/// Boot entry for the protected-mode kernel proper: bring up paging, build
/// the kernel, mount the boot module and start init.
#[cfg(all(target_arch = "x86", target_os = "none"))]
pub fn kernel_main(boot_module: usize) -> ! {
    // SAFETY: called once, before interrupts are enabled.
    unsafe { crate::arch::paging_init() };
    let kernel = kernel_init();
    {
        let mut k = kernel.lock();
        k.bootstrap(boot_module).expect("bootstrap failed");
        let init = PathBuf::from_bytes(b"/init").expect("init path");
        k.spawn(&init, &[&b"init"[..]]).expect("spawning init failed");
    }
    crate::arch::intr_on();
    crate::arch::halt_forever()
}
