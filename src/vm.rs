//! User memory: the physical frame pool, per-task page maps with
//! copy-on-write, and the user-space access helpers.
//!
//! A "physical address" here is an offset into the frame pool; the x86 glue
//! adds the pool's identity-mapped base when it programs the page tables.

use arrayvec::ArrayVec;
use bitmaps::Bitmap;
use zerocopy::{AsBytes, FromBytes};

use crate::{
    err::{Errno, KResult},
    kernel::Kernel,
    memlayout::{is_user_addr, pg_round_down},
    param::{NFRAME, PGSIZE, TASK_NPAGE},
    proc::Pid,
};

bitflags! {
    /// Hardware page flags, in x86 PTE encoding.
    pub struct PteFlags: u32 {
        const PRESENT = 0x1;
        const WRITABLE = 0x2;
        const USER = 0x4;
    }
}

/// One mapped page: virtual address, frame-pool offset, hardware flags and
/// the private copy-on-write bit.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PtEntry {
    pub vaddr: usize,
    pub paddr: usize,
    pub flags: PteFlags,
    pub cow: bool,
}

/// A task's mapped pages, kept sorted by virtual address.
#[derive(Clone)]
pub struct PageMap {
    entries: ArrayVec<PtEntry, TASK_NPAGE>,
}

impl PageMap {
    pub fn new() -> Self {
        Self {
            entries: ArrayVec::new(),
        }
    }

    pub fn entries(&self) -> &[PtEntry] {
        &self.entries
    }

    pub fn entries_mut(&mut self) -> &mut [PtEntry] {
        &mut self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Finds the entry mapping the page containing `vaddr`.
    pub fn find(&self, vaddr: usize) -> Option<(usize, PtEntry)> {
        let page = pg_round_down(vaddr);
        self.entries
            .binary_search_by_key(&page, |e| e.vaddr)
            .ok()
            .map(|i| (i, self.entries[i]))
    }

    /// Inserts a mapping, keeping the list sorted.
    pub fn map(&mut self, entry: PtEntry) -> KResult<()> {
        debug_assert_eq!(entry.vaddr % PGSIZE, 0);
        match self.entries.binary_search_by_key(&entry.vaddr, |e| e.vaddr) {
            Ok(_) => Err(Errno::Exists),
            Err(i) => self
                .entries
                .try_insert(i, entry)
                .map_err(|_| Errno::NoSpace),
        }
    }

    /// Removes the mapping at `vaddr`, returning it.
    pub fn unmap(&mut self, vaddr: usize) -> Option<PtEntry> {
        self.entries
            .binary_search_by_key(&pg_round_down(vaddr), |e| e.vaddr)
            .ok()
            .map(|i| self.entries.remove(i))
    }
}

/// The fixed pool of user page frames, with per-frame share counts for
/// copy-on-write.
pub struct FramePool {
    frames: [[u8; PGSIZE]; NFRAME],
    used: Bitmap<NFRAME>,
    refs: [u16; NFRAME],
}

impl FramePool {
    pub fn new() -> Self {
        Self {
            frames: [[0; PGSIZE]; NFRAME],
            used: Bitmap::new(),
            refs: [0; NFRAME],
        }
    }

    /// Allocates a zeroed frame with one reference. Returns its pool offset.
    pub fn alloc(&mut self) -> KResult<usize> {
        let pfn = (0..NFRAME)
            .find(|i| !self.used.get(*i))
            .ok_or(Errno::NoSpace)?;
        self.used.set(pfn, true);
        self.refs[pfn] = 1;
        self.frames[pfn] = [0; PGSIZE];
        Ok(pfn * PGSIZE)
    }

    /// Adds a share to a live frame.
    pub fn add_ref(&mut self, paddr: usize) {
        let pfn = paddr / PGSIZE;
        assert!(self.used.get(pfn), "frame: ref of free frame");
        self.refs[pfn] += 1;
    }

    /// Drops a share, freeing the frame at zero.
    pub fn release(&mut self, paddr: usize) {
        let pfn = paddr / PGSIZE;
        assert!(self.used.get(pfn), "frame: free of free frame");
        self.refs[pfn] -= 1;
        if self.refs[pfn] == 0 {
            self.used.set(pfn, false);
        }
    }

    pub fn ref_count(&self, paddr: usize) -> u16 {
        self.refs[paddr / PGSIZE]
    }

    pub fn frame(&self, paddr: usize) -> &[u8; PGSIZE] {
        &self.frames[paddr / PGSIZE]
    }

    pub fn frame_mut(&mut self, paddr: usize) -> &mut [u8; PGSIZE] {
        &mut self.frames[paddr / PGSIZE]
    }

    /// Linear address of the pool, for the hardware page tables.
    pub fn base_addr(&self) -> usize {
        self.frames.as_ptr() as usize
    }

    /// Frames currently allocated.
    pub fn live_count(&self) -> usize {
        (0..NFRAME).filter(|i| self.used.get(*i)).count()
    }
}

impl Kernel {
    /// Maps a fresh zeroed frame at `vaddr` for `pid`.
    pub fn map_new_page(&mut self, pid: Pid, vaddr: usize, flags: PteFlags) -> KResult<usize> {
        if !is_user_addr(vaddr) {
            return Err(Errno::BadAddress);
        }
        let paddr = self.frames.alloc()?;
        let entry = PtEntry {
            vaddr: pg_round_down(vaddr),
            paddr,
            flags: flags | PteFlags::PRESENT | PteFlags::USER,
            cow: false,
        };
        if let Err(e) = self.tasks.get_mut(pid).pages.map(entry) {
            self.frames.release(paddr);
            return Err(e);
        }
        Ok(paddr)
    }

    /// Unmaps every user page of `pid` and returns the frames to the pool.
    pub fn free_user_pages(&mut self, pid: Pid) {
        let task = self.tasks.get_mut(pid);
        let mut pages = PageMap::new();
        core::mem::swap(&mut pages, &mut task.pages);
        for entry in pages.entries() {
            self.frames.release(entry.paddr);
        }
    }

    /// Resolves a write fault against a copy-on-write page: with other
    /// sharers a private copy replaces the mapping, the last sharer just
    /// gets its write bit back.
    pub fn cow_break(&mut self, pid: Pid, vaddr: usize) -> KResult<()> {
        let (idx, entry) = self
            .tasks
            .get(pid)
            .pages
            .find(vaddr)
            .ok_or(Errno::BadAddress)?;
        if !entry.cow {
            return Err(Errno::BadAddress);
        }
        if self.frames.ref_count(entry.paddr) == 1 {
            let e = &mut self.tasks.get_mut(pid).pages.entries_mut()[idx];
            e.flags |= PteFlags::WRITABLE;
            e.cow = false;
            return Ok(());
        }
        let new_paddr = self.frames.alloc()?;
        let copy = *self.frames.frame(entry.paddr);
        *self.frames.frame_mut(new_paddr) = copy;
        self.frames.release(entry.paddr);
        let e = &mut self.tasks.get_mut(pid).pages.entries_mut()[idx];
        e.paddr = new_paddr;
        e.flags |= PteFlags::WRITABLE;
        e.cow = false;
        Ok(())
    }

    /// A user write fault: break copy-on-write or fail.
    pub fn page_fault(&mut self, pid: Pid, vaddr: usize, write: bool) -> KResult<()> {
        let entry = self
            .tasks
            .get(pid)
            .pages
            .find(vaddr)
            .map(|(_, e)| e)
            .ok_or(Errno::BadAddress)?;
        if !entry.flags.contains(PteFlags::PRESENT | PteFlags::USER) {
            return Err(Errno::BadAddress);
        }
        if write && !entry.flags.contains(PteFlags::WRITABLE) {
            if entry.cow {
                return self.cow_break(pid, vaddr);
            }
            return Err(Errno::BadAddress);
        }
        Ok(())
    }

    /// Translates for reading. Returns the frame-pool offset of the page and
    /// the offset inside it.
    fn user_frame_for_read(&self, pid: Pid, vaddr: usize) -> KResult<(usize, usize)> {
        let entry = self
            .tasks
            .get(pid)
            .pages
            .find(vaddr)
            .map(|(_, e)| e)
            .ok_or(Errno::BadAddress)?;
        if !entry.flags.contains(PteFlags::PRESENT | PteFlags::USER) {
            return Err(Errno::BadAddress);
        }
        Ok((entry.paddr, vaddr - entry.vaddr))
    }

    /// Translates for writing, breaking copy-on-write exactly like the
    /// hardware fault path would.
    fn user_frame_for_write(&mut self, pid: Pid, vaddr: usize) -> KResult<(usize, usize)> {
        let entry = self
            .tasks
            .get(pid)
            .pages
            .find(vaddr)
            .map(|(_, e)| e)
            .ok_or(Errno::BadAddress)?;
        if !entry.flags.contains(PteFlags::PRESENT | PteFlags::USER) {
            return Err(Errno::BadAddress);
        }
        if !entry.flags.contains(PteFlags::WRITABLE) {
            if !entry.cow {
                return Err(Errno::BadAddress);
            }
            self.cow_break(pid, vaddr)?;
        }
        let entry = self
            .tasks
            .get(pid)
            .pages
            .find(vaddr)
            .ok_or(Errno::BadAddress)?
            .1;
        Ok((entry.paddr, vaddr - entry.vaddr))
    }

    /// Copies bytes into `pid`'s address space.
    pub fn copy_out_bytes(&mut self, pid: Pid, mut dst: usize, src: &[u8]) -> KResult<()> {
        let mut done = 0;
        while done < src.len() {
            let (paddr, off) = self.user_frame_for_write(pid, dst)?;
            let n = (PGSIZE - off).min(src.len() - done);
            self.frames.frame_mut(paddr)[off..off + n].copy_from_slice(&src[done..done + n]);
            done += n;
            dst += n;
        }
        Ok(())
    }

    /// Copies bytes out of `pid`'s address space.
    pub fn copy_in_bytes(&self, pid: Pid, dst: &mut [u8], mut src: usize) -> KResult<()> {
        let mut done = 0;
        while done < dst.len() {
            let (paddr, off) = self.user_frame_for_read(pid, src)?;
            let n = (PGSIZE - off).min(dst.len() - done);
            dst[done..done + n].copy_from_slice(&self.frames.frame(paddr)[off..off + n]);
            done += n;
            src += n;
        }
        Ok(())
    }

    /// Copies a typed record into user space.
    pub fn copy_out<T: AsBytes>(&mut self, pid: Pid, dst: usize, src: &T) -> KResult<()> {
        self.copy_out_bytes(pid, dst, src.as_bytes())
    }

    /// Copies a typed record from user space.
    pub fn copy_in<T: AsBytes + FromBytes>(&self, pid: Pid, src: usize) -> KResult<T> {
        let mut t = T::new_zeroed();
        self.copy_in_bytes(pid, t.as_bytes_mut(), src)?;
        Ok(t)
    }

    /// Copies a NUL-terminated string from user space into `buf`, returning
    /// the bytes before the terminator. `NameTooLong` if none fits.
    pub fn copy_in_str<'a>(
        &self,
        pid: Pid,
        buf: &'a mut [u8],
        mut src: usize,
    ) -> KResult<&'a [u8]> {
        for i in 0..buf.len() {
            let (paddr, off) = self.user_frame_for_read(pid, src)?;
            let b = self.frames.frame(paddr)[off];
            if b == 0 {
                return Ok(&buf[..i]);
            }
            buf[i] = b;
            src += 1;
        }
        Err(Errno::NameTooLong)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memlayout::UBASE;

    #[test]
    fn pagemap_stays_sorted() {
        let mut map = PageMap::new();
        for &va in &[UBASE + 3 * PGSIZE, UBASE, UBASE + PGSIZE] {
            map.map(PtEntry {
                vaddr: va,
                paddr: 0,
                flags: PteFlags::PRESENT | PteFlags::USER,
                cow: false,
            })
            .unwrap();
        }
        let addrs: Vec<usize> = map.entries().iter().map(|e| e.vaddr).collect();
        assert_eq!(addrs, vec![UBASE, UBASE + PGSIZE, UBASE + 3 * PGSIZE]);

        assert!(map.find(UBASE + PGSIZE + 7).is_some());
        assert!(map.find(UBASE + 2 * PGSIZE).is_none());

        assert!(map.unmap(UBASE + PGSIZE).is_some());
        assert!(map.find(UBASE + PGSIZE).is_none());
    }

    #[test]
    fn double_map_rejected() {
        let mut map = PageMap::new();
        let e = PtEntry {
            vaddr: UBASE,
            paddr: 0,
            flags: PteFlags::PRESENT,
            cow: false,
        };
        map.map(e).unwrap();
        assert_eq!(map.map(e).unwrap_err(), Errno::Exists);
    }

    #[test]
    fn frame_pool_refcounts() {
        let mut pool = Box::new(FramePool::new());
        let a = pool.alloc().unwrap();
        let b = pool.alloc().unwrap();
        assert_ne!(a, b);
        assert_eq!(pool.live_count(), 2);

        pool.add_ref(a);
        pool.release(a);
        assert_eq!(pool.live_count(), 2);
        pool.release(a);
        assert_eq!(pool.live_count(), 1);

        pool.frame_mut(b)[0] = 0xAB;
        pool.release(b);
        assert_eq!(pool.live_count(), 0);

        // A released frame comes back zeroed.
        let c = pool.alloc().unwrap();
        assert_eq!(pool.frame(c)[0], 0);
    }
}
