// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Named shared-memory objects
//! OWNERS: @kernel-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests + proptest (ref-count and frame-accounting invariants)
//! PUBLIC API: open, truncate, map, close, fork_duplicate, exit_teardown, Registry, DescriptorTable
//! DEPENDS_ON: mm::{FrameAllocator, PageMapper}, spin::Mutex
//! INVARIANTS:
//!   - An object's ref_count equals the number of live descriptors naming it
//!   - Backing frames are freed exactly once, when the last reference drops
//!   - A descriptor's mapping, when present, sits at the slot's fixed window base
//!
//! Lock order is process -> registry namespace -> one object. The frame pool
//! lock nests inside an object lock and never the other way round.

mod descriptor;
mod lifecycle;
mod ops;
mod registry;

use core::fmt;

pub use descriptor::{DescriptorTable, LocalDescriptor, ShmFd};
pub use lifecycle::{exit_teardown, fork_duplicate};
pub use ops::{close, map, open, truncate};
pub use registry::{ObjectId, ObjectName, ObjectStat, Registry};

/// Longest object name in bytes.
pub const NAME_MAX: usize = 14;
/// Number of objects the system can hold at once.
pub const REGISTRY_CAPACITY: usize = 64;
/// Descriptor slots per process.
pub const LOCAL_SLOTS: usize = 16;
/// Largest object, in pages.
pub const MAX_PAGES_PER_OBJECT: usize = 32;

/// Errors returned by shared-memory operations.
#[must_use]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShmError {
    /// Descriptor is out of range or its slot is empty.
    InvalidDescriptor,
    /// Every registry slot is in use.
    RegistryFull,
    /// Every descriptor slot of the caller is in use.
    LocalTableFull,
    /// The object already has backing memory.
    AlreadyCommitted,
    /// Requested size is zero, negative or above the per-object limit.
    SizeInvalid,
    /// Frames ran out while committing; nothing was kept.
    AllocationFailure,
    /// The descriptor is already mapped.
    AlreadyMapped,
    /// The object has no backing memory yet.
    NotCommitted,
    /// Installing a page mapping failed; nothing was kept.
    MapFailed,
    /// Name is empty or longer than [`NAME_MAX`].
    InvalidName,
}

impl fmt::Display for ShmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::InvalidDescriptor => "invalid descriptor",
            Self::RegistryFull => "registry full",
            Self::LocalTableFull => "descriptor table full",
            Self::AlreadyCommitted => "object already committed",
            Self::SizeInvalid => "invalid size",
            Self::AllocationFailure => "out of frames",
            Self::AlreadyMapped => "descriptor already mapped",
            Self::NotCommitted => "object not committed",
            Self::MapFailed => "mapping failed",
            Self::InvalidName => "invalid name",
        };
        f.write_str(msg)
    }
}

/// Reports a broken bookkeeping invariant and halts.
#[cold]
#[track_caller]
fn corrupted(args: fmt::Arguments<'_>) -> ! {
    log_error!(target: "shm", "{}", args);
    panic!("shm invariant violated: {}", args);
}

#[cfg(test)]
mod tests_prop;
