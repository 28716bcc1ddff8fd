// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Physical frame allocation.
//!
//! `FramePool` hands out 4 KiB frames from one contiguous, page-aligned region.
//! Bare-metal builds identity-map that region; host builds carve it out of the
//! global allocator, so a frame's physical address is also a valid pointer.

use alloc::{vec, vec::Vec};
use core::alloc::Layout;

use spin::Mutex;

use super::PAGE_SIZE;

/// Page-aligned physical address of one frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PhysPage(usize);

impl PhysPage {
    /// Wraps `addr` if it is non-null and page aligned.
    pub const fn from_addr(addr: usize) -> Option<Self> {
        if addr == 0 || addr % PAGE_SIZE != 0 {
            None
        } else {
            Some(Self(addr))
        }
    }

    /// Returns the physical address.
    #[inline]
    pub const fn addr(self) -> usize {
        self.0
    }

    /// Kernel pointer to the first byte of the frame.
    #[inline]
    pub fn as_mut_ptr(self) -> *mut u8 {
        self.0 as *mut u8
    }
}

/// Source of zero-filled physical frames.
pub trait FrameAllocator: Sync {
    /// Returns a zeroed frame, or `None` when memory is exhausted.
    fn alloc_page(&self) -> Option<PhysPage>;

    /// Returns `page` to the allocator. Freeing a frame twice is fatal.
    fn free_page(&self, page: PhysPage);

    /// Number of frames currently available.
    fn free_pages(&self) -> usize;
}

const WORD_BITS: usize = u64::BITS as usize;

struct PoolState {
    free: Vec<u32>,
    in_use: Vec<u64>,
}

/// Fixed-capacity frame pool with a free stack and an allocation bitmap.
pub struct FramePool {
    base: usize,
    frames: usize,
    layout: Layout,
    state: Mutex<PoolState>,
}

// SAFETY: the region is owned by the pool; bookkeeping is behind `state`.
unsafe impl Send for FramePool {}
// SAFETY: see above.
unsafe impl Sync for FramePool {}

impl FramePool {
    /// Creates a pool backing `frames` pages.
    pub fn new(frames: usize) -> Self {
        let frames = frames.max(1);
        let layout = match Layout::from_size_align(frames * PAGE_SIZE, PAGE_SIZE) {
            Ok(layout) => layout,
            Err(_) => panic!("frame pool of {frames} pages exceeds the address space"),
        };
        // SAFETY: `layout` has a non-zero size.
        let base = unsafe { alloc::alloc::alloc(layout) };
        if base.is_null() {
            alloc::alloc::handle_alloc_error(layout);
        }
        // Lowest frames are handed out first.
        let free = (0..frames as u32).rev().collect();
        let in_use = vec![0u64; frames.div_ceil(WORD_BITS)];
        log_info!(target: "mm", "frame pool: {} pages at 0x{:x}", frames, base as usize);
        Self { base: base as usize, frames, layout, state: Mutex::new(PoolState { free, in_use }) }
    }

    /// Total number of frames managed by the pool.
    pub fn capacity(&self) -> usize {
        self.frames
    }

    fn index_of(&self, page: PhysPage) -> Option<usize> {
        let offset = page.addr().checked_sub(self.base)?;
        let index = offset / PAGE_SIZE;
        (index < self.frames).then_some(index)
    }
}

impl FrameAllocator for FramePool {
    fn alloc_page(&self) -> Option<PhysPage> {
        let mut state = self.state.lock();
        let index = state.free.pop()? as usize;
        state.in_use[index / WORD_BITS] |= 1 << (index % WORD_BITS);
        drop(state);

        let page = PhysPage(self.base + index * PAGE_SIZE);
        // SAFETY: the frame lies inside the pool region and was just marked in use,
        // so no other owner can observe it.
        unsafe { core::ptr::write_bytes(page.as_mut_ptr(), 0, PAGE_SIZE) };
        Some(page)
    }

    fn free_page(&self, page: PhysPage) {
        let Some(index) = self.index_of(page) else {
            log_error!(target: "mm", "free of foreign frame 0x{:x}", page.addr());
            panic!("free of foreign frame");
        };
        let mut state = self.state.lock();
        let (word, bit) = (index / WORD_BITS, 1u64 << (index % WORD_BITS));
        if state.in_use[word] & bit == 0 {
            drop(state);
            log_error!(target: "mm", "double free of frame 0x{:x}", page.addr());
            panic!("double free of frame");
        }
        state.in_use[word] &= !bit;
        state.free.push(index as u32);
    }

    fn free_pages(&self) -> usize {
        self.state.lock().free.len()
    }
}

impl Drop for FramePool {
    fn drop(&mut self) {
        // SAFETY: `base` came from `alloc` with exactly this layout.
        unsafe { alloc::alloc::dealloc(self.base as *mut u8, self.layout) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_are_zeroed_and_counted() {
        let pool = FramePool::new(4);
        assert_eq!(pool.capacity(), 4);
        assert_eq!(pool.free_pages(), 4);
        let page = pool.alloc_page().unwrap();
        assert_eq!(page.addr() % PAGE_SIZE, 0);
        assert_eq!(pool.free_pages(), 3);
        unsafe { core::ptr::write_bytes(page.as_mut_ptr(), 0xAA, PAGE_SIZE) };
        pool.free_page(page);
        let again = pool.alloc_page().unwrap();
        assert_eq!(again, page);
        let bytes = unsafe { core::slice::from_raw_parts(again.as_mut_ptr(), PAGE_SIZE) };
        assert!(bytes.iter().all(|&b| b == 0));
    }

    #[test]
    fn exhaustion_returns_none() {
        let pool = FramePool::new(2);
        let a = pool.alloc_page().unwrap();
        let b = pool.alloc_page().unwrap();
        assert_ne!(a, b);
        assert!(pool.alloc_page().is_none());
        pool.free_page(a);
        pool.free_page(b);
        assert_eq!(pool.free_pages(), 2);
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn double_free_is_fatal() {
        let pool = FramePool::new(1);
        let page = pool.alloc_page().unwrap();
        pool.free_page(page);
        pool.free_page(page);
    }

    #[test]
    fn phys_page_rejects_unaligned() {
        assert!(PhysPage::from_addr(0).is_none());
        assert!(PhysPage::from_addr(PAGE_SIZE + 1).is_none());
        assert_eq!(PhysPage::from_addr(PAGE_SIZE).map(PhysPage::addr), Some(PAGE_SIZE));
    }
}
