// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Unit tests for Sv39 page table invariants
//! OWNERS: @kernel-mm-team
//! NOTE: Tests only; verify alignment, flags, W^X, overlap, range, lookup, unmap

use super::layout::{SHM_WINDOW_BASE, USER_VA_LIMIT};
use super::{MapError, PageFlags, PageTable, PAGE_SIZE};

const RO: PageFlags = PageFlags::VALID.union(PageFlags::READ);

#[test]
fn rejects_unaligned_addresses() {
    let mut table = PageTable::new();
    assert_eq!(table.map(1, PAGE_SIZE, RO), Err(MapError::Unaligned));
    assert_eq!(table.map(0, 1, RO), Err(MapError::Unaligned));
}

#[test]
fn rejects_invalid_flags() {
    let mut table = PageTable::new();
    assert_eq!(table.map(0, 0, PageFlags::empty()), Err(MapError::InvalidFlags));
    assert_eq!(table.map(0, 0, PageFlags::VALID), Err(MapError::InvalidFlags));
    assert_eq!(table.map(0, 0, PageFlags::READ), Err(MapError::InvalidFlags));
}

#[test]
fn enforces_w_xor_x() {
    let mut table = PageTable::new();
    let flags = PageFlags::VALID | PageFlags::WRITE | PageFlags::EXECUTE;
    assert_eq!(table.map(0, 0, flags), Err(MapError::PermissionDenied));
}

#[test]
fn detects_overlap() {
    let mut table = PageTable::new();
    table.map(SHM_WINDOW_BASE, PAGE_SIZE, RO).expect("first mapping");
    assert_eq!(table.map(SHM_WINDOW_BASE, 2 * PAGE_SIZE, RO), Err(MapError::Overlap));
}

#[test]
fn out_of_range_rejected() {
    let mut table = PageTable::new();
    assert_eq!(table.map(1usize << 50, 0, RO), Err(MapError::OutOfRange));
    assert_eq!(table.map(USER_VA_LIMIT, 0, RO), Err(MapError::OutOfRange));
}

#[test]
fn lookup_and_translate_observe_mapping() {
    let mut table = PageTable::new();
    table.map(SHM_WINDOW_BASE, 3 * PAGE_SIZE, RO).expect("map");
    assert_eq!(table.lookup(SHM_WINDOW_BASE), Some((3 << 10) | RO.bits()));
    assert_eq!(table.lookup(SHM_WINDOW_BASE + PAGE_SIZE), None);
    assert_eq!(table.translate(SHM_WINDOW_BASE + 0x10), Some((3 * PAGE_SIZE + 0x10, RO)));
}

#[test]
fn unmap_returns_target_and_clears_leaf() {
    let mut table = PageTable::new();
    table.map(SHM_WINDOW_BASE, 5 * PAGE_SIZE, RO).expect("map");
    assert_eq!(table.unmap(SHM_WINDOW_BASE), Some(5 * PAGE_SIZE));
    assert_eq!(table.lookup(SHM_WINDOW_BASE), None);
    assert_eq!(table.unmap(SHM_WINDOW_BASE), None);
    table.map(SHM_WINDOW_BASE, 6 * PAGE_SIZE, RO).expect("remap after unmap");
}
