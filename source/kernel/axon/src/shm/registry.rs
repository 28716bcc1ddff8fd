// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! System-wide table of shared-memory objects.

use core::fmt;

use spin::Mutex;

use super::{corrupted, ShmError, MAX_PAGES_PER_OBJECT, NAME_MAX, REGISTRY_CAPACITY};
use crate::mm::{FrameAllocator, PhysPage, PAGE_SIZE};

/// Index of an object in the registry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(u8);

impl ObjectId {
    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Object name: 1..=NAME_MAX bytes, compared byte-for-byte.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ObjectName {
    bytes: [u8; NAME_MAX],
    len: u8,
}

impl ObjectName {
    const EMPTY: Self = Self { bytes: [0; NAME_MAX], len: 0 };

    pub fn new(name: &[u8]) -> Result<Self, ShmError> {
        if name.is_empty() || name.len() > NAME_MAX {
            return Err(ShmError::InvalidName);
        }
        let mut bytes = [0; NAME_MAX];
        bytes[..name.len()].copy_from_slice(name);
        Ok(Self { bytes, len: name.len() as u8 })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }
}

impl fmt::Debug for ObjectName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match core::str::from_utf8(self.as_bytes()) {
            Ok(name) => write!(f, "{name:?}"),
            Err(_) => write!(f, "{:?}", self.as_bytes()),
        }
    }
}

/// Snapshot of one object for diagnostics and tests.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ObjectStat {
    pub name: ObjectName,
    pub ref_count: usize,
    pub committed_size: usize,
    pub pages: usize,
}

/// Frames backing a committed object, in window order.
#[derive(Clone, Copy)]
pub(crate) struct Backing {
    pages: [Option<PhysPage>; MAX_PAGES_PER_OBJECT],
    count: usize,
}

impl Backing {
    pub(crate) fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub(crate) fn len(&self) -> usize {
        self.count
    }

    pub(crate) fn pages(&self) -> impl Iterator<Item = PhysPage> + '_ {
        self.pages[..self.count].iter().flatten().copied()
    }
}

/// A slot is free exactly when `ref_count == 0`; a free slot has no name and no pages.
struct SharedObject {
    name: ObjectName,
    ref_count: usize,
    committed_size: usize,
    backing: Backing,
}

impl SharedObject {
    const FREE: Self = Self {
        name: ObjectName::EMPTY,
        ref_count: 0,
        committed_size: 0,
        backing: Backing { pages: [None; MAX_PAGES_PER_OBJECT], count: 0 },
    };

    fn is_free(&self) -> bool {
        self.ref_count == 0
    }
}

/// Fixed-capacity object registry.
///
/// Each slot has its own lock. The namespace lock serialises name lookup with
/// slot claiming so two racing opens of a new name cannot claim two slots.
pub struct Registry {
    namespace: Mutex<()>,
    slots: [Mutex<SharedObject>; REGISTRY_CAPACITY],
}

impl Registry {
    pub const fn new() -> Self {
        const FREE_SLOT: Mutex<SharedObject> = Mutex::new(SharedObject::FREE);
        Self { namespace: Mutex::new(()), slots: [FREE_SLOT; REGISTRY_CAPACITY] }
    }

    fn slot(&self, id: ObjectId) -> &Mutex<SharedObject> {
        &self.slots[id.index()]
    }

    /// Finds the live object called `name` or claims a free slot for it, and
    /// takes one reference either way.
    pub(crate) fn acquire(&self, name: &ObjectName) -> Result<ObjectId, ShmError> {
        let _namespace = self.namespace.lock();
        let mut vacant = None;
        for (index, slot) in self.slots.iter().enumerate() {
            let mut object = slot.lock();
            if object.is_free() {
                vacant.get_or_insert(index);
                continue;
            }
            if object.name == *name {
                object.ref_count += 1;
                return Ok(ObjectId(index as u8));
            }
        }
        let index = vacant.ok_or(ShmError::RegistryFull)?;
        let mut object = self.slots[index].lock();
        // Only `acquire` claims slots and it holds the namespace lock.
        if !object.is_free() {
            corrupted(format_args!("slot {index} claimed behind the namespace lock"));
        }
        object.name = *name;
        object.ref_count = 1;
        log_debug!(target: "shm", "registry: {:?} -> slot {}", name, index);
        Ok(ObjectId(index as u8))
    }

    /// Takes another reference on a live object.
    pub(crate) fn retain(&self, id: ObjectId) {
        let mut object = self.slot(id).lock();
        if object.is_free() {
            corrupted(format_args!("retain of free object {id}"));
        }
        object.ref_count += 1;
    }

    /// Drops one reference; the last one frees the backing frames and the slot.
    ///
    /// Returns true if the object was reclaimed.
    pub(crate) fn release(&self, id: ObjectId, frames: &dyn FrameAllocator) -> bool {
        let mut object = self.slot(id).lock();
        if object.is_free() {
            corrupted(format_args!("ref-count underflow on object {id}"));
        }
        object.ref_count -= 1;
        if object.ref_count > 0 {
            return false;
        }
        for page in object.backing.pages() {
            frames.free_page(page);
        }
        log_debug!(target: "shm", "registry: reclaimed {:?} ({} pages)", object.name, object.backing.len());
        *object = SharedObject::FREE;
        true
    }

    /// Allocates backing frames for `size` bytes. One-shot per object.
    pub(crate) fn commit(
        &self,
        id: ObjectId,
        size: usize,
        frames: &dyn FrameAllocator,
    ) -> Result<usize, ShmError> {
        let count = size.div_ceil(PAGE_SIZE);
        if count == 0 || count > MAX_PAGES_PER_OBJECT {
            return Err(ShmError::SizeInvalid);
        }
        let mut object = self.slot(id).lock();
        if object.committed_size != 0 {
            return Err(ShmError::AlreadyCommitted);
        }
        let mut backing = Backing { pages: [None; MAX_PAGES_PER_OBJECT], count: 0 };
        while backing.count < count {
            let Some(page) = frames.alloc_page() else {
                for page in backing.pages() {
                    frames.free_page(page);
                }
                log_warn!(target: "shm", "commit {:?}: out of frames after {} of {}", object.name, backing.count, count);
                return Err(ShmError::AllocationFailure);
            };
            backing.pages[backing.count] = Some(page);
            backing.count += 1;
        }
        object.backing = backing;
        object.committed_size = size;
        Ok(size)
    }

    /// Copy of the object's backing frames.
    pub(crate) fn backing(&self, id: ObjectId) -> Backing {
        self.slot(id).lock().backing
    }

    pub(crate) fn name_of(&self, id: ObjectId) -> ObjectName {
        self.slot(id).lock().name
    }

    /// Looks up a live object by name without taking a reference.
    pub fn find(&self, name: &[u8]) -> Option<ObjectId> {
        let name = ObjectName::new(name).ok()?;
        self.slots
            .iter()
            .position(|slot| {
                let object = slot.lock();
                !object.is_free() && object.name == name
            })
            .map(|index| ObjectId(index as u8))
    }

    pub fn stat(&self, id: ObjectId) -> Option<ObjectStat> {
        let object = self.slots.get(id.index())?.lock();
        (!object.is_free()).then(|| ObjectStat {
            name: object.name,
            ref_count: object.ref_count,
            committed_size: object.committed_size,
            pages: object.backing.len(),
        })
    }

    /// Number of live objects.
    pub fn live_objects(&self) -> usize {
        self.slots.iter().filter(|slot| !slot.lock().is_free()).count()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
