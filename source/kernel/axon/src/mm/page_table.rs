// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Sv39 page table with lazily allocated interior levels.
//!
//! Interior table pages come from the kernel heap, not from the frame pool, so
//! building or dropping a table never changes the pool's free-page count.

use alloc::{boxed::Box, vec, vec::Vec};
use core::ptr::NonNull;

use bitflags::bitflags;

use super::PAGE_SIZE;

const PT_ENTRIES: usize = 512;
const LEVELS: usize = 3;

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    /// Flags stored in Sv39 page-table entries.
    pub struct PageFlags: usize {
        const VALID = 1 << 0;
        const READ = 1 << 1;
        const WRITE = 1 << 2;
        const EXECUTE = 1 << 3;
        const USER = 1 << 4;
        const GLOBAL = 1 << 5;
        const ACCESSED = 1 << 6;
        const DIRTY = 1 << 7;
    }
}

/// Error returned when manipulating page tables.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MapError {
    /// Virtual or physical address was not page aligned.
    Unaligned,
    /// Address lies outside the canonical Sv39 user range.
    OutOfRange,
    /// Mapping violates the W^X policy.
    PermissionDenied,
    /// A valid leaf already occupies the address.
    Overlap,
    /// Flags do not describe a valid leaf entry.
    InvalidFlags,
}

#[repr(align(4096))]
struct TablePage {
    entries: [usize; PT_ENTRIES],
}

/// Three-level Sv39 page table.
pub struct PageTable {
    root: NonNull<TablePage>,
    owned: Vec<NonNull<TablePage>>,
}

// SAFETY: the table exclusively owns every page in `owned`; no aliases escape.
unsafe impl Send for PageTable {}

impl PageTable {
    /// Creates an empty table with a fresh root page.
    pub fn new() -> Self {
        let root = Self::alloc_table_page();
        Self { root, owned: vec![root] }
    }

    /// Returns the raw leaf entry mapped at `va`.
    pub fn lookup(&self, va: usize) -> Option<usize> {
        if va % PAGE_SIZE != 0 || !is_canonical_sv39(va) {
            return None;
        }
        // SAFETY: `leaf_entry` only yields pointers into pages owned by `self`.
        self.leaf_entry(va).map(|entry| unsafe { *entry.as_ptr() })
    }

    /// Resolves `va` (any alignment) to its physical address and leaf flags.
    pub fn translate(&self, va: usize) -> Option<(usize, PageFlags)> {
        let entry = self.lookup(va & !(PAGE_SIZE - 1))?;
        Some((entry_address(entry) + va % PAGE_SIZE, PageFlags::from_bits_truncate(entry)))
    }

    /// Installs a 4 KiB mapping from `va` to `pa`.
    pub fn map(&mut self, va: usize, pa: usize, flags: PageFlags) -> Result<(), MapError> {
        if va % PAGE_SIZE != 0 || pa % PAGE_SIZE != 0 {
            return Err(MapError::Unaligned);
        }
        if !is_canonical_sv39(va) || va >= USER_VA_END {
            return Err(MapError::OutOfRange);
        }
        if flags.intersection(LEAF_PERMS).is_empty() || !flags.contains(PageFlags::VALID) {
            return Err(MapError::InvalidFlags);
        }
        if flags.contains(PageFlags::WRITE) && flags.contains(PageFlags::EXECUTE) {
            return Err(MapError::PermissionDenied);
        }

        let indices = vpn_indices(va);
        let mut table = self.root;
        for index in &indices[..LEVELS - 1] {
            // SAFETY: `table` is a page owned by `self` and `&mut self` is exclusive.
            let entry = unsafe { &mut (*table.as_ptr()).entries[*index] };
            if *entry & PageFlags::VALID.bits() != 0 {
                if *entry & LEAF_PERMS.bits() != 0 {
                    return Err(MapError::Overlap);
                }
                table = NonNull::new(entry_address(*entry) as *mut TablePage)
                    .ok_or(MapError::OutOfRange)?;
                continue;
            }
            let next = Self::alloc_table_page();
            self.owned.push(next);
            *entry = ((next.as_ptr() as usize / PAGE_SIZE) << 10) | PageFlags::VALID.bits();
            table = next;
        }

        // SAFETY: as above.
        let leaf = unsafe { &mut (*table.as_ptr()).entries[indices[LEVELS - 1]] };
        if *leaf & PageFlags::VALID.bits() != 0 {
            return Err(MapError::Overlap);
        }
        *leaf = ((pa / PAGE_SIZE) << 10) | flags.bits();
        Ok(())
    }

    /// Removes the leaf at `va`, returning the physical address it pointed to.
    ///
    /// Absent mappings are a no-op. Interior pages stay allocated until drop.
    pub fn unmap(&mut self, va: usize) -> Option<usize> {
        if va % PAGE_SIZE != 0 || !is_canonical_sv39(va) {
            return None;
        }
        let entry = self.leaf_entry(va)?;
        // SAFETY: pointer into a page owned by `self`; `&mut self` is exclusive.
        let old = unsafe { core::ptr::replace(entry.as_ptr(), 0) };
        Some(entry_address(old))
    }

    fn leaf_entry(&self, va: usize) -> Option<NonNull<usize>> {
        let indices = vpn_indices(va);
        let mut table = self.root;
        for (level, index) in indices.iter().enumerate() {
            // SAFETY: `table` is either the root or an interior page reached from it.
            let slot = unsafe { core::ptr::addr_of_mut!((*table.as_ptr()).entries[*index]) };
            // SAFETY: `slot` points into a live table page.
            let entry = unsafe { *slot };
            if entry & PageFlags::VALID.bits() == 0 {
                return None;
            }
            let is_leaf = entry & LEAF_PERMS.bits() != 0;
            if level == LEVELS - 1 {
                return if is_leaf { NonNull::new(slot) } else { None };
            }
            if is_leaf {
                return None;
            }
            table = NonNull::new(entry_address(entry) as *mut TablePage)?;
        }
        None
    }

    fn alloc_table_page() -> NonNull<TablePage> {
        let boxed = Box::new(TablePage { entries: [0; PT_ENTRIES] });
        // SAFETY: Box never yields a null pointer.
        unsafe { NonNull::new_unchecked(Box::into_raw(boxed)) }
    }
}

impl Default for PageTable {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for PageTable {
    fn drop(&mut self) {
        for page in self.owned.drain(..) {
            // SAFETY: every pointer originates from `alloc_table_page` and is unique.
            unsafe { drop(Box::from_raw(page.as_ptr())) };
        }
    }
}

const LEAF_PERMS: PageFlags = PageFlags::READ.union(PageFlags::WRITE).union(PageFlags::EXECUTE);
const USER_VA_END: usize = super::layout::USER_VA_LIMIT;

#[inline]
fn entry_address(entry: usize) -> usize {
    (entry >> 10) << 12
}

/// Table indices from root to leaf.
fn vpn_indices(va: usize) -> [usize; LEVELS] {
    [(va >> 30) & 0x1ff, (va >> 21) & 0x1ff, (va >> 12) & 0x1ff]
}

pub(crate) fn is_canonical_sv39(va: usize) -> bool {
    let sign = (va >> 38) & 1;
    let upper = va >> 39;
    if sign == 0 {
        upper == 0
    } else {
        upper == usize::MAX >> 39
    }
}
