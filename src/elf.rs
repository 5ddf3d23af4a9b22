//! Format of an ELF32 executable file.

use core::mem;

use static_assertions::const_assert_eq;
use zerocopy::{AsBytes, FromBytes};

/// "\x7FELF" in little endian
pub const ELF_MAGIC: u32 = 0x464c_457f;

/// 32-bit object class.
const ELF_CLASS32: u8 = 1;

/// Executable file type.
const ELF_TYPE_EXEC: u16 = 2;

/// Intel 80386 machine.
const ELF_MACHINE_386: u16 = 3;

/// Values for ProgHdr type
pub const ELF_PROG_LOAD: u32 = 1;

/// File header
#[derive(Default, Clone)]
// In-file representation, so it follows the C layout.
#[repr(C)]
#[derive(AsBytes, FromBytes)]
pub struct ElfHdr {
    /// must equal ELF_MAGIC
    pub magic: u32,
    pub class: u8,
    pub data: u8,
    pub ident_version: u8,
    pub osabi: u8,
    pub pad: [u8; 8],
    pub typ: u16,
    pub machine: u16,
    pub version: u32,
    pub entry: u32,
    pub phoff: u32,
    pub shoff: u32,
    pub flags: u32,
    pub ehsize: u16,
    pub phentsize: u16,
    pub phnum: u16,
    pub shentsize: u16,
    pub shnum: u16,
    pub shstrndx: u16,
}

bitflags! {
    /// Flag bits for ProgHdr flags
    #[repr(C)]
    #[derive(AsBytes, FromBytes)]
    pub struct ProgFlags: u32 {
        const EXEC = 1;
        const WRITE = 2;
        const READ = 4;
    }
}

impl Default for ProgFlags {
    fn default() -> Self {
        Self::from_bits_truncate(0)
    }
}

/// Program section header
#[derive(Default, Clone)]
// In-file representation, so it follows the C layout.
#[repr(C)]
#[derive(AsBytes, FromBytes)]
pub struct ProgHdr {
    pub typ: u32,
    pub off: u32,
    pub vaddr: u32,
    pub paddr: u32,
    pub filesz: u32,
    pub memsz: u32,
    pub flags: ProgFlags,
    pub align: u32,
}

const_assert_eq!(mem::size_of::<ElfHdr>(), 52);
const_assert_eq!(mem::size_of::<ProgHdr>(), 32);

impl ElfHdr {
    pub fn is_valid(&self) -> bool {
        self.magic == ELF_MAGIC
            && self.class == ELF_CLASS32
            && self.typ == ELF_TYPE_EXEC
            && self.machine == ELF_MACHINE_386
    }
}

impl ProgHdr {
    pub fn is_prog_load(&self) -> bool {
        self.typ == ELF_PROG_LOAD
    }
}
