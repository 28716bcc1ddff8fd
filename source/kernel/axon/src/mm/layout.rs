// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! User virtual-address layout.
//!
//! ```text
//! 0x0000_0000_4000_0000  USER_HEAP_BASE   heap grows up (sbrk)
//!          ...
//! 0x0000_003F_FFE0_0000  SHM_WINDOW_BASE  slot 0, slot 1, ... slot 15
//! 0x0000_0040_0000_0000  USER_VA_LIMIT
//! ```

use static_assertions::const_assert;

use super::PAGE_SIZE;
use crate::shm::{LOCAL_SLOTS, MAX_PAGES_PER_OBJECT};

/// First address past the user half of Sv39.
pub const USER_VA_LIMIT: usize = 1 << 38;
/// Start of the process heap.
pub const USER_HEAP_BASE: usize = 0x4000_0000;
/// Virtual span reserved per descriptor slot.
pub const SLOT_STRIDE: usize = MAX_PAGES_PER_OBJECT * PAGE_SIZE;
/// Total size of the shared-memory window.
pub const SHM_WINDOW_SIZE: usize = LOCAL_SLOTS * SLOT_STRIDE;
/// Lowest address of the shared-memory window.
pub const SHM_WINDOW_BASE: usize = USER_VA_LIMIT - SHM_WINDOW_SIZE;

const_assert!(SHM_WINDOW_BASE % PAGE_SIZE == 0);
const_assert!(SLOT_STRIDE % PAGE_SIZE == 0);
const_assert!(USER_HEAP_BASE < SHM_WINDOW_BASE);
const_assert!(SHM_WINDOW_BASE + SHM_WINDOW_SIZE <= USER_VA_LIMIT);

/// Fixed virtual base of descriptor slot `slot`.
#[inline]
pub const fn shm_slot_base(slot: usize) -> usize {
    SHM_WINDOW_BASE + slot * SLOT_STRIDE
}

/// Returns true if `va` falls inside the shared-memory window.
#[inline]
pub const fn in_shm_window(va: usize) -> bool {
    va >= SHM_WINDOW_BASE && va < USER_VA_LIMIT
}
