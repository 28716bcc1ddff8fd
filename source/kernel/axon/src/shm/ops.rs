// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! The four user-facing shared-memory operations.
//!
//! Every function acts on the caller's own descriptor table, which the caller
//! holds exclusively (it sits behind the process lock).

use super::registry::Backing;
use super::{corrupted, DescriptorTable, ObjectName, Registry, ShmError, ShmFd};
use crate::mm::{FrameAllocator, PageFlags, PageMapper, PAGE_SIZE};

/// Permission bits a caller may request for a mapping.
const USER_PERMS: PageFlags = PageFlags::READ.union(PageFlags::WRITE).union(PageFlags::EXECUTE);

/// Returns a descriptor for the object called `name`, creating it if needed.
///
/// Reopening a name the caller already holds returns the existing descriptor
/// and takes no new reference.
pub fn open(table: &mut DescriptorTable, registry: &Registry, name: &[u8]) -> Result<ShmFd, ShmError> {
    let name = ObjectName::new(name)?;
    if let Some((fd, _)) = table.iter().find(|(_, desc)| registry.name_of(desc.object()) == name) {
        return Ok(fd);
    }
    let fd = table.free_slot().ok_or(ShmError::LocalTableFull)?;
    let object = registry.acquire(&name)?;
    table.bind(fd, object);
    log_debug!(target: "shm", "open {:?}: fd {} -> object {}", name, fd, object);
    Ok(fd)
}

/// Commits `size` bytes of zeroed backing memory to the object behind `fd`.
///
/// Sizing is one-shot: the first successful call fixes the size for the
/// lifetime of the object. Returns the committed size in bytes.
pub fn truncate(
    table: &DescriptorTable,
    registry: &Registry,
    frames: &dyn FrameAllocator,
    fd: ShmFd,
    size: isize,
) -> Result<usize, ShmError> {
    let desc = table.lookup(fd)?;
    let size = usize::try_from(size).map_err(|_| ShmError::SizeInvalid)?;
    registry.commit(desc.object(), size, frames)
}

/// Maps the object behind `fd` at the slot's fixed window address.
///
/// Only the R/W/X bits of `flags` are honoured; `USER | VALID` are always
/// added. Returns the base address.
pub fn map<M: PageMapper + ?Sized>(
    table: &mut DescriptorTable,
    mapper: &mut M,
    registry: &Registry,
    fd: ShmFd,
    flags: PageFlags,
) -> Result<usize, ShmError> {
    let desc = table.lookup(fd)?;
    let backing = registry.backing(desc.object());
    if backing.is_empty() {
        return Err(ShmError::NotCommitted);
    }
    if desc.virtual_address().is_some() {
        return Err(ShmError::AlreadyMapped);
    }
    let base = fd.window_base();
    let flags = (flags & USER_PERMS) | PageFlags::USER | PageFlags::VALID;
    install(mapper, base, &backing, flags)?;
    table.set_mapping(fd, base, flags);
    Ok(base)
}

/// Unmaps (if mapped) and releases the descriptor `fd`.
pub fn close<M: PageMapper + ?Sized>(
    table: &mut DescriptorTable,
    mapper: &mut M,
    registry: &Registry,
    frames: &dyn FrameAllocator,
    fd: ShmFd,
) -> Result<(), ShmError> {
    table.lookup(fd)?;
    drop_descriptor(table, mapper, registry, frames, fd);
    Ok(())
}

/// Maps every backing page at `base + i * PAGE_SIZE`; all or nothing.
pub(super) fn install<M: PageMapper + ?Sized>(
    mapper: &mut M,
    base: usize,
    backing: &Backing,
    flags: PageFlags,
) -> Result<(), ShmError> {
    for (index, page) in backing.pages().enumerate() {
        let va = base + index * PAGE_SIZE;
        if let Err(err) = mapper.map_page(va, page, flags) {
            log_warn!(target: "shm", "map 0x{:x} failed at page {}: {:?}", va, index, err);
            uninstall(mapper, base, backing, index);
            return Err(ShmError::MapFailed);
        }
    }
    Ok(())
}

/// Removes the first `count` pages installed by [`install`].
fn uninstall<M: PageMapper + ?Sized>(mapper: &mut M, base: usize, backing: &Backing, count: usize) {
    for (index, page) in backing.pages().take(count).enumerate() {
        let va = base + index * PAGE_SIZE;
        match mapper.unmap_page(va) {
            Some(mapped) if mapped == page => {}
            Some(mapped) => corrupted(format_args!(
                "0x{:x} maps 0x{:x}, expected 0x{:x}",
                va,
                mapped.addr(),
                page.addr()
            )),
            None => corrupted(format_args!("0x{:x} lost its shared mapping", va)),
        }
    }
}

/// Unmaps, drops the object reference and frees the slot. `fd` must be occupied.
pub(super) fn drop_descriptor<M: PageMapper + ?Sized>(
    table: &mut DescriptorTable,
    mapper: &mut M,
    registry: &Registry,
    frames: &dyn FrameAllocator,
    fd: ShmFd,
) {
    let Some(desc) = table.get(fd).copied() else {
        return;
    };
    if let Some(base) = desc.virtual_address() {
        let backing = registry.backing(desc.object());
        uninstall(mapper, base, &backing, backing.len());
    }
    let reclaimed = registry.release(desc.object(), frames);
    table.clear(fd);
    log_debug!(target: "shm", "close fd {}: object {} reclaimed={}", fd, desc.object(), reclaimed);
}
