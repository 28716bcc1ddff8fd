// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Syscall dispatcher and errno encoding
//! OWNERS: @kernel-team
//! PUBLIC API: SyscallTable, Args, Error, Handler, encode_result
//! DEPENDS_ON: axon_abi::{nr, errno}, mm, shm, task, syscall::api
//! INVARIANTS: Fixed MAX_SYSCALL window; numbers come from axon-abi; decode/check/execute discipline

pub mod api;

use core::fmt;

use axon_abi::errno::*;
use axon_abi::encode_errno;

use crate::mm::AddressSpaceError;
use crate::shm::ShmError;
use crate::task::{ProcessError, SpawnError, WaitError};

/// Size of the dispatch window.
const MAX_SYSCALL: usize = 16;

/// Result type used by syscall handlers.
pub type SysResult<T> = Result<T, Error>;

/// Syscall arguments passed in registers a0-a5.
#[derive(Default, Clone, Copy)]
pub struct Args {
    regs: [usize; 6],
}

impl Args {
    pub const fn new(regs: [usize; 6]) -> Self {
        Self { regs }
    }

    #[inline]
    pub fn get(&self, index: usize) -> usize {
        self.regs[index]
    }
}

/// Error returned by the dispatcher and handler stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Syscall number not present in the dispatch table.
    InvalidSyscall,
    /// Argument failed decoding or a user pointer did not resolve.
    InvalidArgument,
    /// Shared-memory operation failed.
    Shm(ShmError),
    /// Process creation failed.
    Spawn(SpawnError),
    /// Wait found nothing to reap.
    Wait(WaitError),
    /// Operation on the calling process failed.
    Process(ProcessError),
}

impl From<ShmError> for Error {
    fn from(value: ShmError) -> Self {
        Self::Shm(value)
    }
}

impl From<SpawnError> for Error {
    fn from(value: SpawnError) -> Self {
        Self::Spawn(value)
    }
}

impl From<WaitError> for Error {
    fn from(value: WaitError) -> Self {
        Self::Wait(value)
    }
}

impl From<ProcessError> for Error {
    fn from(value: ProcessError) -> Self {
        Self::Process(value)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Type alias for a syscall handler.
pub type Handler = fn(&mut api::Context<'_>, &Args) -> SysResult<usize>;

/// Dispatch table storing handlers by syscall number.
pub struct SyscallTable {
    handlers: [Option<Handler>; MAX_SYSCALL],
}

impl SyscallTable {
    /// Creates an empty dispatch table.
    pub const fn new() -> Self {
        const NONE: Option<Handler> = None;
        Self { handlers: [NONE; MAX_SYSCALL] }
    }

    /// Registers a handler. Numbers outside the window are ignored.
    pub fn register(&mut self, number: usize, handler: Handler) {
        if number < MAX_SYSCALL {
            self.handlers[number] = Some(handler);
        }
    }

    /// Executes the handler referenced by `number`.
    #[must_use]
    pub fn dispatch(
        &self,
        number: usize,
        ctx: &mut api::Context<'_>,
        args: &Args,
    ) -> SysResult<usize> {
        self.handlers
            .get(number)
            .and_then(|entry| *entry)
            .ok_or(Error::InvalidSyscall)
            .and_then(|handler| handler(ctx, args))
    }
}

impl Default for SyscallTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Folds a handler result into the value returned in `a0`.
pub fn encode_result(result: SysResult<usize>) -> usize {
    match result {
        Ok(value) => value,
        Err(err) => encode_errno(errno_of(err)),
    }
}

fn errno_of(err: Error) -> usize {
    match err {
        Error::InvalidSyscall => ENOSYS,
        Error::InvalidArgument => EINVAL,
        Error::Shm(shm) => shm_errno(shm),
        Error::Spawn(SpawnError::NoSuchProcess) => EINVAL,
        Error::Spawn(SpawnError::TableFull) => EAGAIN,
        Error::Spawn(SpawnError::AddressSpace(as_err)) => address_space_errno(as_err),
        Error::Spawn(SpawnError::Shm(shm)) => shm_errno(shm),
        Error::Wait(WaitError::NoChildren) => ECHILD,
        Error::Wait(WaitError::WouldBlock) => EAGAIN,
        Error::Process(ProcessError::NoSuchProcess) => EINVAL,
        Error::Process(ProcessError::AddressSpace(as_err)) => address_space_errno(as_err),
    }
}

fn shm_errno(err: ShmError) -> usize {
    match err {
        ShmError::InvalidDescriptor => EBADF,
        ShmError::RegistryFull => ENFILE,
        ShmError::LocalTableFull => EMFILE,
        ShmError::AlreadyCommitted => EEXIST,
        ShmError::SizeInvalid => EINVAL,
        ShmError::AllocationFailure => ENOMEM,
        ShmError::AlreadyMapped => EBUSY,
        ShmError::NotCommitted => ENXIO,
        ShmError::MapFailed => EFAULT,
        ShmError::InvalidName => ENAMETOOLONG,
    }
}

fn address_space_errno(err: AddressSpaceError) -> usize {
    match err {
        AddressSpaceError::AsidExhausted => EAGAIN,
        AddressSpaceError::HeapLimit | AddressSpaceError::OutOfMemory => ENOMEM,
        AddressSpaceError::Fault => EFAULT,
        AddressSpaceError::Mapping(_) => EINVAL,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axon_abi::{decode_syscall, AbiError};

    #[test]
    fn shm_errors_decode_to_abi_errors() {
        let cases = [
            (ShmError::InvalidDescriptor, AbiError::InvalidDescriptor),
            (ShmError::RegistryFull, AbiError::RegistryFull),
            (ShmError::LocalTableFull, AbiError::LocalTableFull),
            (ShmError::AlreadyCommitted, AbiError::AlreadyCommitted),
            (ShmError::SizeInvalid, AbiError::InvalidArgument),
            (ShmError::AllocationFailure, AbiError::OutOfMemory),
            (ShmError::AlreadyMapped, AbiError::AlreadyMapped),
            (ShmError::NotCommitted, AbiError::NotCommitted),
            (ShmError::MapFailed, AbiError::MapFailed),
            (ShmError::InvalidName, AbiError::InvalidName),
        ];
        for (err, abi) in cases {
            assert_eq!(decode_syscall(encode_result(Err(err.into()))), Err(abi));
        }
    }

    #[test]
    fn unknown_numbers_are_enosys() {
        assert_eq!(
            decode_syscall(encode_result(Err(Error::InvalidSyscall))),
            Err(AbiError::InvalidSyscall)
        );
        assert_eq!(encode_result(Ok(0x3F_FFE0_0000)), 0x3F_FFE0_0000);
    }
}
