// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Process lifecycle hooks: descriptor inheritance on fork, teardown on exit.

use super::ops::{drop_descriptor, install};
use super::{corrupted, DescriptorTable, Registry, ShmError};
use crate::mm::{FrameAllocator, PageMapper};

/// Copies every descriptor of `parent` into the fresh `child` table.
///
/// Mapped descriptors are mapped into `child_mapper` at the same address with
/// the same flags, so parent and child share the frames. Each slot is copied
/// all or nothing. On failure the child keeps the slots copied so far and the
/// caller must discard it with [`exit_teardown`].
pub fn fork_duplicate<M: PageMapper + ?Sized>(
    parent: &DescriptorTable,
    child: &mut DescriptorTable,
    child_mapper: &mut M,
    registry: &Registry,
) -> Result<(), ShmError> {
    if !child.is_empty() {
        corrupted(format_args!("fork into a child with {} live descriptors", child.occupied()));
    }
    for (fd, desc) in parent.iter() {
        match desc.virtual_address() {
            Some(base) => {
                let backing = registry.backing(desc.object());
                install(child_mapper, base, &backing, desc.flags())?;
                registry.retain(desc.object());
                child.bind_mapped(fd, desc.object(), base, desc.flags());
            }
            None => {
                registry.retain(desc.object());
                child.bind(fd, desc.object());
            }
        }
    }
    Ok(())
}

/// Closes every descriptor in `table`. Idempotent.
///
/// Returns how many descriptors were dropped.
pub fn exit_teardown<M: PageMapper + ?Sized>(
    table: &mut DescriptorTable,
    mapper: &mut M,
    registry: &Registry,
    frames: &dyn FrameAllocator,
) -> usize {
    let live = table.occupied();
    loop {
        let Some((fd, _)) = table.iter().next() else {
            break;
        };
        drop_descriptor(table, mapper, registry, frames, fd);
    }
    if live > 0 {
        log_debug!(target: "shm", "teardown: dropped {} descriptors", live);
    }
    live
}
