//! Architecture glue.
//!
//! `frame` is plain data shared by every target; the `x86` module holds the
//! real protected-mode entry stubs and is replaced by `host` when the core is
//! built for tests.

mod frame;

pub use frame::*;

cfg_if::cfg_if! {
    if #[cfg(all(target_arch = "x86", target_os = "none"))] {
        mod x86;
        pub use x86::*;
    } else {
        mod host;
        pub use host::*;
    }
}
