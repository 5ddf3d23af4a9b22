//! User address-space layout.
//!
//! The kernel itself is identity-mapped below `KERNEL_TOP` in every address
//! space; user mappings live in `[UBASE, UTOP)` and come from the frame pool.

use crate::param::PGSIZE;

/// Kernel identity-mapped cutoff (16 MiB).
pub const KERNEL_TOP: usize = 0x0100_0000;

/// Base of the user program image (128 MiB).
pub const UBASE: usize = 0x0800_0000;

/// End of the user region (132 MiB).
pub const UTOP: usize = 0x0840_0000;

/// The user stack grows down from here.
pub const USTACK_TOP: usize = UTOP;

/// Pages reserved for the user stack.
pub const USTACK_PAGES: usize = 2;

/// Round an address down to its page base.
pub const fn pg_round_down(addr: usize) -> usize {
    addr & !(PGSIZE - 1)
}

/// Round an address up to the next page boundary.
pub const fn pg_round_up(addr: usize) -> usize {
    (addr + PGSIZE - 1) & !(PGSIZE - 1)
}

/// True if `addr` lies in the user region.
pub const fn is_user_addr(addr: usize) -> bool {
    addr >= UBASE && addr < UTOP
}
