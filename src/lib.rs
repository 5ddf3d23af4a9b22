//! minos: a small x86 protected-mode teaching kernel.
//!
//! The core is architecture-independent and builds (and is unit-tested) on
//! the host; everything that touches rings, CR3 or the IDT lives behind
//! `cfg(target_arch = "x86")` in `arch/`.

#![cfg_attr(not(any(test, feature = "std")), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]
#![allow(dead_code)]

#[macro_use]
extern crate bitflags;

mod arch;
mod elf;
mod err;
mod exec;
mod fs;
mod kernel;
mod memlayout;
mod param;
mod printf;
mod proc;
mod syscall;
mod vm;

#[cfg(test)]
mod tests;

pub use err::{Errno, KResult};
pub use kernel::{kernel, Kernel};
