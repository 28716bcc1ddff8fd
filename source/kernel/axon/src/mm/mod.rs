// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Memory management: physical frames, Sv39 tables, user address spaces
//! OWNERS: @kernel-team
//! PUBLIC API: FrameAllocator, FramePool, PhysPage, PageMapper, PageTable, AddressSpace
//! DEPENDS_ON: spin::Mutex, bitflags
//! INVARIANTS: Frames are zeroed on allocation; a frame is freed at most once

pub mod address_space;
pub mod layout;
pub mod page_table;
pub mod phys;

pub use address_space::{AddressSpace, AddressSpaceError, AsidAllocator};
pub use page_table::{MapError, PageFlags, PageTable};
pub use phys::{FrameAllocator, FramePool, PhysPage};

/// Size of a page in bytes.
pub const PAGE_SIZE: usize = 4096;

/// Installs and removes single-page user mappings.
///
/// The shared-memory core only talks to memory through this seam, which keeps
/// it independent of how a process's translation structures are laid out.
pub trait PageMapper {
    /// Maps `page` at `va`. Fails without side effects if `va` is occupied.
    fn map_page(&mut self, va: usize, page: PhysPage, flags: PageFlags) -> Result<(), MapError>;

    /// Removes the mapping at `va` and returns the page it pointed to.
    fn unmap_page(&mut self, va: usize) -> Option<PhysPage>;
}

#[cfg(test)]
mod tests;
