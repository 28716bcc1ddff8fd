// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Per-process Sv39 address spaces and ASID allocation.
//!
//! An address space owns its page table, its ASID and the frames backing its
//! private heap. Frames mapped through [`PageMapper`] (the shared-memory
//! window) are borrowed: the address space never frees them.

use alloc::vec::Vec;

use super::layout::{in_shm_window, SHM_WINDOW_BASE, SHM_WINDOW_SIZE, USER_HEAP_BASE};
use super::page_table::{MapError, PageFlags, PageTable};
use super::phys::{FrameAllocator, PhysPage};
use super::{PageMapper, PAGE_SIZE};

/// Maximum ASIDs made available by the allocator.
pub const MAX_ASIDS: usize = 256;
const WORD_BITS: usize = u64::BITS as usize;
const BITMAP_WORDS: usize = MAX_ASIDS.div_ceil(WORD_BITS);

const HEAP_FLAGS: PageFlags = PageFlags::VALID
    .union(PageFlags::READ)
    .union(PageFlags::WRITE)
    .union(PageFlags::USER);

/// Errors reported while managing address spaces.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddressSpaceError {
    /// No more ASIDs are available.
    AsidExhausted,
    /// Heap change would cross the heap base or enter the shared-memory window.
    HeapLimit,
    /// The frame allocator ran dry.
    OutOfMemory,
    /// A user access touched an unmapped page or lacked permission.
    Fault,
    /// Underlying map operation failed.
    Mapping(MapError),
}

impl From<MapError> for AddressSpaceError {
    fn from(value: MapError) -> Self {
        Self::Mapping(value)
    }
}

/// Translation state of one user process.
pub struct AddressSpace {
    page_table: PageTable,
    asid: u16,
    heap_end: usize,
    heap: Vec<PhysPage>,
}

impl AddressSpace {
    /// Creates an empty address space tagged with `asid`.
    pub fn new(asid: u16) -> Self {
        Self { page_table: PageTable::new(), asid, heap_end: USER_HEAP_BASE, heap: Vec::new() }
    }

    /// Returns the hardware ASID backing this address space.
    pub fn asid(&self) -> u16 {
        self.asid
    }

    /// Borrows the page table for read-only inspection.
    pub fn page_table(&self) -> &PageTable {
        &self.page_table
    }

    /// Current program break.
    pub fn heap_end(&self) -> usize {
        self.heap_end
    }

    /// Moves the break up to `new_end`, backing new pages with fresh frames.
    ///
    /// The break may never reach into the shared-memory window. On failure the
    /// heap is left exactly as it was.
    pub fn grow_heap(
        &mut self,
        frames: &dyn FrameAllocator,
        new_end: usize,
    ) -> Result<(), AddressSpaceError> {
        if new_end < self.heap_end || new_end > SHM_WINDOW_BASE {
            return Err(AddressSpaceError::HeapLimit);
        }
        let target = heap_pages(new_end);
        let before = self.heap.len();
        while self.heap.len() < target {
            let va = USER_HEAP_BASE + self.heap.len() * PAGE_SIZE;
            let Some(page) = frames.alloc_page() else {
                log_warn!(target: "mm", "asid {}: heap growth to 0x{:x} out of memory", self.asid, new_end);
                self.truncate_heap(frames, before);
                return Err(AddressSpaceError::OutOfMemory);
            };
            if let Err(err) = self.page_table.map(va, page.addr(), HEAP_FLAGS) {
                frames.free_page(page);
                self.truncate_heap(frames, before);
                return Err(err.into());
            }
            self.heap.push(page);
        }
        self.heap_end = new_end;
        Ok(())
    }

    /// Moves the break down to `new_end`, releasing pages no longer covered.
    pub fn shrink_heap(
        &mut self,
        frames: &dyn FrameAllocator,
        new_end: usize,
    ) -> Result<(), AddressSpaceError> {
        if new_end < USER_HEAP_BASE || new_end > self.heap_end {
            return Err(AddressSpaceError::HeapLimit);
        }
        self.truncate_heap(frames, heap_pages(new_end));
        self.heap_end = new_end;
        Ok(())
    }

    fn truncate_heap(&mut self, frames: &dyn FrameAllocator, pages: usize) {
        while self.heap.len() > pages {
            let va = USER_HEAP_BASE + (self.heap.len() - 1) * PAGE_SIZE;
            if let Some(page) = self.heap.pop() {
                self.page_table.unmap(va);
                flush_tlb(self.asid, va);
                frames.free_page(page);
            }
        }
    }

    /// Creates a child address space with a private copy of the heap.
    ///
    /// The shared-memory window is not copied; the caller re-installs it.
    pub fn duplicate(
        &self,
        frames: &dyn FrameAllocator,
        asid: u16,
    ) -> Result<AddressSpace, AddressSpaceError> {
        let mut child = AddressSpace::new(asid);
        for (index, src) in self.heap.iter().enumerate() {
            let Some(page) = frames.alloc_page() else {
                child.release(frames);
                return Err(AddressSpaceError::OutOfMemory);
            };
            // SAFETY: both frames are live, distinct and exactly one page long.
            unsafe {
                core::ptr::copy_nonoverlapping(src.as_mut_ptr(), page.as_mut_ptr(), PAGE_SIZE)
            };
            let va = USER_HEAP_BASE + index * PAGE_SIZE;
            if let Err(err) = child.page_table.map(va, page.addr(), HEAP_FLAGS) {
                frames.free_page(page);
                child.release(frames);
                return Err(err.into());
            }
            child.heap.push(page);
        }
        child.heap_end = self.heap_end;
        Ok(child)
    }

    /// Copies `buf.len()` bytes of user memory starting at `va`.
    pub fn user_read(&self, va: usize, buf: &mut [u8]) -> Result<(), AddressSpaceError> {
        let mut done = 0;
        while done < buf.len() {
            let cursor = va.checked_add(done).ok_or(AddressSpaceError::Fault)?;
            let pa = self.resolve(cursor, PageFlags::READ)?;
            let chunk = (PAGE_SIZE - cursor % PAGE_SIZE).min(buf.len() - done);
            // SAFETY: `pa..pa + chunk` stays within one mapped user frame.
            unsafe {
                core::ptr::copy_nonoverlapping(pa as *const u8, buf[done..].as_mut_ptr(), chunk)
            };
            done += chunk;
        }
        Ok(())
    }

    /// Copies `bytes` into user memory starting at `va`.
    pub fn user_write(&mut self, va: usize, bytes: &[u8]) -> Result<(), AddressSpaceError> {
        let mut done = 0;
        while done < bytes.len() {
            let cursor = va.checked_add(done).ok_or(AddressSpaceError::Fault)?;
            let pa = self.resolve(cursor, PageFlags::WRITE)?;
            let chunk = (PAGE_SIZE - cursor % PAGE_SIZE).min(bytes.len() - done);
            // SAFETY: `pa..pa + chunk` stays within one mapped, writable user frame.
            unsafe { core::ptr::copy_nonoverlapping(bytes[done..].as_ptr(), pa as *mut u8, chunk) };
            done += chunk;
        }
        Ok(())
    }

    fn resolve(&self, va: usize, access: PageFlags) -> Result<usize, AddressSpaceError> {
        let required = PageFlags::VALID | PageFlags::USER | access;
        match self.page_table.translate(va) {
            Some((pa, flags)) if flags.contains(required) => Ok(pa),
            _ => Err(AddressSpaceError::Fault),
        }
    }

    /// Frees the heap. Shared-memory mappings must already be torn down.
    pub fn release(&mut self, frames: &dyn FrameAllocator) {
        self.truncate_heap(frames, 0);
        self.heap_end = USER_HEAP_BASE;
        let mut va = SHM_WINDOW_BASE;
        while va < SHM_WINDOW_BASE + SHM_WINDOW_SIZE {
            if self.page_table.lookup(va).is_some() {
                log_error!(target: "mm", "asid {}: release with live window page 0x{:x}", self.asid, va);
                panic!("address space released with shared pages mapped");
            }
            va += PAGE_SIZE;
        }
    }
}

impl PageMapper for AddressSpace {
    fn map_page(&mut self, va: usize, page: PhysPage, flags: PageFlags) -> Result<(), MapError> {
        if !in_shm_window(va) {
            return Err(MapError::OutOfRange);
        }
        self.page_table.map(va, page.addr(), flags)
    }

    fn unmap_page(&mut self, va: usize) -> Option<PhysPage> {
        let pa = self.page_table.unmap(va)?;
        flush_tlb(self.asid, va);
        PhysPage::from_addr(pa)
    }
}

#[inline]
fn heap_pages(end: usize) -> usize {
    (end - USER_HEAP_BASE).div_ceil(PAGE_SIZE)
}

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
#[inline]
fn flush_tlb(asid: u16, va: usize) {
    #[allow(unused_unsafe)]
    // SAFETY: `sfence.vma` only invalidates cached translations.
    unsafe {
        riscv::asm::sfence_vma(asid as usize, va)
    };
}

#[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
#[inline]
fn flush_tlb(_asid: u16, _va: usize) {}

/// Bitmap allocator for hardware ASIDs; ASID 0 stays reserved for the kernel.
pub struct AsidAllocator {
    bitmap: [u64; BITMAP_WORDS],
    next: usize,
}

impl AsidAllocator {
    /// Creates an allocator with every user ASID free.
    pub const fn new() -> Self {
        let mut bitmap = [0u64; BITMAP_WORDS];
        bitmap[0] |= 1;
        Self { bitmap, next: 1 }
    }

    /// Claims the next free ASID.
    pub fn allocate(&mut self) -> Option<u16> {
        for _ in 0..MAX_ASIDS {
            let index = self.next % MAX_ASIDS;
            self.next = (index + 1) % MAX_ASIDS;
            let (word, bit) = (index / WORD_BITS, 1u64 << (index % WORD_BITS));
            if self.bitmap[word] & bit == 0 {
                self.bitmap[word] |= bit;
                return Some(index as u16);
            }
        }
        None
    }

    /// Returns `asid` to the pool. ASID 0 is never released.
    pub fn free(&mut self, asid: u16) {
        let index = asid as usize;
        if index != 0 && index < MAX_ASIDS {
            self.bitmap[index / WORD_BITS] &= !(1u64 << (index % WORD_BITS));
        }
    }
}

impl Default for AsidAllocator {
    fn default() -> Self {
        Self::new()
    }
}
