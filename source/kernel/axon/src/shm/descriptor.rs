// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Per-process descriptor table.

use core::fmt;

use super::{ObjectId, ShmError, LOCAL_SLOTS};
use crate::mm::layout::shm_slot_base;
use crate::mm::PageFlags;

/// Shared-memory descriptor: an index into the caller's descriptor table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ShmFd(u8);

impl ShmFd {
    /// Accepts `raw` if it names a slot, occupied or not.
    pub const fn from_raw(raw: usize) -> Option<Self> {
        if raw < LOCAL_SLOTS {
            Some(Self(raw as u8))
        } else {
            None
        }
    }

    #[inline]
    pub const fn as_raw(self) -> usize {
        self.0 as usize
    }

    /// Virtual address this descriptor's object is mapped at.
    #[inline]
    pub const fn window_base(self) -> usize {
        shm_slot_base(self.0 as usize)
    }
}

impl fmt::Display for ShmFd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One occupied descriptor slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LocalDescriptor {
    object: ObjectId,
    virtual_address: usize,
    flags: PageFlags,
}

impl LocalDescriptor {
    pub fn object(&self) -> ObjectId {
        self.object
    }

    /// Mapping base, or `None` while unmapped.
    pub fn virtual_address(&self) -> Option<usize> {
        (self.virtual_address != 0).then_some(self.virtual_address)
    }

    /// Flags the mapping was installed with; empty while unmapped.
    pub fn flags(&self) -> PageFlags {
        self.flags
    }
}

/// Fixed table of [`LOCAL_SLOTS`] descriptor slots.
#[derive(Clone)]
pub struct DescriptorTable {
    slots: [Option<LocalDescriptor>; LOCAL_SLOTS],
}

impl DescriptorTable {
    pub const fn new() -> Self {
        Self { slots: [None; LOCAL_SLOTS] }
    }

    pub fn get(&self, fd: ShmFd) -> Option<&LocalDescriptor> {
        self.slots[fd.as_raw()].as_ref()
    }

    pub(crate) fn lookup(&self, fd: ShmFd) -> Result<LocalDescriptor, ShmError> {
        self.get(fd).copied().ok_or(ShmError::InvalidDescriptor)
    }

    pub(crate) fn free_slot(&self) -> Option<ShmFd> {
        self.slots.iter().position(Option::is_none).map(|index| ShmFd(index as u8))
    }

    pub(crate) fn bind(&mut self, fd: ShmFd, object: ObjectId) {
        self.slots[fd.as_raw()] =
            Some(LocalDescriptor { object, virtual_address: 0, flags: PageFlags::empty() });
    }

    pub(crate) fn bind_mapped(&mut self, fd: ShmFd, object: ObjectId, va: usize, flags: PageFlags) {
        self.slots[fd.as_raw()] = Some(LocalDescriptor { object, virtual_address: va, flags });
    }

    pub(crate) fn set_mapping(&mut self, fd: ShmFd, va: usize, flags: PageFlags) {
        if let Some(desc) = self.slots[fd.as_raw()].as_mut() {
            desc.virtual_address = va;
            desc.flags = flags;
        }
    }

    pub(crate) fn clear(&mut self, fd: ShmFd) {
        self.slots[fd.as_raw()] = None;
    }

    /// Occupied slots in ascending descriptor order.
    pub fn iter(&self) -> impl Iterator<Item = (ShmFd, LocalDescriptor)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| slot.map(|desc| (ShmFd(index as u8), desc)))
    }

    pub fn occupied(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.occupied() == 0
    }
}

impl Default for DescriptorTable {
    fn default() -> Self {
        Self::new()
    }
}
