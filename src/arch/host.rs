//! Host stand-ins for the x86 glue, so the core builds and tests off-target.

use crate::vm::PageMap;

/// No hardware page tables on the host; translation goes through `vm`.
pub fn switch_address_space(_map: &PageMap, _frames_base: usize) {}

pub fn halt_forever() -> ! {
    loop {
        core::hint::spin_loop();
    }
}
