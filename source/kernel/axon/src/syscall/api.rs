// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Syscall handlers exposed to the dispatcher
//! OWNERS: @kernel-team
//! PUBLIC API: install_handlers(table), Context
//! DEPENDS_ON: task::ProcessTable, shm, mm::FrameAllocator
//! INVARIANTS: Decode→Check→Execute; handlers only touch the caller's own process

use axon_abi::{nr, ShmProt};

use super::{Args, Error, SysResult, SyscallTable};
use crate::mm::{FrameAllocator, PageFlags};
use crate::shm::{self, Registry, ShmFd, NAME_MAX};
use crate::task::{Pid, ProcessTable};

/// Kernel state a handler may touch on behalf of `caller`.
pub struct Context<'a> {
    pub caller: Pid,
    pub tasks: &'a ProcessTable,
    pub registry: &'a Registry,
    pub frames: &'a dyn FrameAllocator,
}

// Typed decoders for Decode→Check→Execute

#[derive(Copy, Clone)]
struct ShmOpenArgsTyped {
    name_ptr: usize,
    name_len: usize,
}

impl ShmOpenArgsTyped {
    #[inline]
    fn decode(args: &Args) -> Self {
        Self { name_ptr: args.get(0), name_len: args.get(1) }
    }

    #[inline]
    fn check(&self) -> Result<(), Error> {
        if self.name_len == 0 || self.name_len > NAME_MAX {
            return Err(shm::ShmError::InvalidName.into());
        }
        Ok(())
    }
}

#[derive(Copy, Clone)]
struct ShmTruncArgsTyped {
    fd: ShmFd,
    size: isize,
}

impl ShmTruncArgsTyped {
    #[inline]
    fn decode(args: &Args) -> Result<Self, Error> {
        let fd = decode_fd(args.get(0))?;
        Ok(Self { fd, size: args.get(1) as isize })
    }
}

#[derive(Copy, Clone)]
struct ShmMapArgsTyped {
    fd: ShmFd,
    prot: ShmProt,
}

impl ShmMapArgsTyped {
    #[inline]
    fn decode(args: &Args) -> Result<Self, Error> {
        let fd = decode_fd(args.get(0))?;
        let prot = ShmProt::from_bits(args.get(1)).ok_or(Error::InvalidArgument)?;
        Ok(Self { fd, prot })
    }

    #[inline]
    fn check(&self) -> Result<(), Error> {
        if self.prot.is_empty() {
            return Err(Error::InvalidArgument);
        }
        Ok(())
    }

    fn page_flags(&self) -> PageFlags {
        let mut flags = PageFlags::empty();
        flags.set(PageFlags::READ, self.prot.contains(ShmProt::READ));
        flags.set(PageFlags::WRITE, self.prot.contains(ShmProt::WRITE));
        flags.set(PageFlags::EXECUTE, self.prot.contains(ShmProt::EXEC));
        flags
    }
}

#[inline]
fn decode_fd(raw: usize) -> Result<ShmFd, Error> {
    ShmFd::from_raw(raw).ok_or(shm::ShmError::InvalidDescriptor.into())
}

/// Registers every handler at its ABI number.
pub fn install_handlers(table: &mut SyscallTable) {
    table.register(nr::GETPID, sys_getpid);
    table.register(nr::FORK, sys_fork);
    table.register(nr::EXIT, sys_exit);
    table.register(nr::WAIT, sys_wait);
    table.register(nr::SBRK, sys_sbrk);
    table.register(nr::SHM_OPEN, sys_shm_open);
    table.register(nr::SHM_TRUNC, sys_shm_trunc);
    table.register(nr::SHM_MAP, sys_shm_map);
    table.register(nr::SHM_CLOSE, sys_shm_close);
}

fn sys_getpid(ctx: &mut Context<'_>, _args: &Args) -> SysResult<usize> {
    Ok(ctx.caller.as_index())
}

/// Returns the child's pid to the parent. Arranging a zero return in the child
/// belongs to the trap layer that builds its first frame.
fn sys_fork(ctx: &mut Context<'_>, _args: &Args) -> SysResult<usize> {
    let child = ctx.tasks.fork(ctx.caller, ctx.frames, ctx.registry)?;
    Ok(child.as_index())
}

fn sys_exit(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let status = args.get(0) as i32;
    ctx.tasks.exit(ctx.caller, status, ctx.frames, ctx.registry)?;
    Ok(0)
}

fn sys_wait(ctx: &mut Context<'_>, _args: &Args) -> SysResult<usize> {
    let (pid, _status) = ctx.tasks.wait(ctx.caller, ctx.frames, ctx.registry)?;
    Ok(pid.as_index())
}

fn sys_sbrk(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let delta = args.get(0) as isize;
    Ok(ctx.tasks.sbrk(ctx.caller, delta, ctx.frames)?)
}

fn sys_shm_open(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let typed = ShmOpenArgsTyped::decode(args);
    typed.check()?;
    let registry = ctx.registry;
    ctx.tasks.with_process(ctx.caller, |process| -> SysResult<usize> {
        let mut name = [0u8; NAME_MAX];
        let name = &mut name[..typed.name_len];
        let (table, space) = process.shm_context().ok_or(Error::InvalidArgument)?;
        space.user_read(typed.name_ptr, name).map_err(|_| Error::InvalidArgument)?;
        let fd = shm::open(table, registry, name)?;
        Ok(fd.as_raw())
    })?
}

fn sys_shm_trunc(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let typed = ShmTruncArgsTyped::decode(args)?;
    let (registry, frames) = (ctx.registry, ctx.frames);
    ctx.tasks.with_process(ctx.caller, |process| -> SysResult<usize> {
        Ok(shm::truncate(process.descriptors(), registry, frames, typed.fd, typed.size)?)
    })?
}

fn sys_shm_map(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let typed = ShmMapArgsTyped::decode(args)?;
    typed.check()?;
    let registry = ctx.registry;
    ctx.tasks.with_process(ctx.caller, |process| -> SysResult<usize> {
        let (table, space) = process.shm_context().ok_or(Error::InvalidArgument)?;
        Ok(shm::map(table, space, registry, typed.fd, typed.page_flags())?)
    })?
}

fn sys_shm_close(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let fd = decode_fd(args.get(0))?;
    let (registry, frames) = (ctx.registry, ctx.frames);
    ctx.tasks.with_process(ctx.caller, |process| -> SysResult<usize> {
        let (table, space) = process.shm_context().ok_or(Error::InvalidArgument)?;
        shm::close(table, space, registry, frames, fd)?;
        Ok(0)
    })?
}
