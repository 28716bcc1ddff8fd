// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), no_std)]
#![cfg_attr(not(all(target_arch = "riscv64", target_os = "none")), forbid(unsafe_code))]
#![deny(clippy::all, missing_docs)]

//! CONTEXT: Shared ABI definitions between the AXON kernel and userland
//! OWNERS: @runtime
//! PUBLIC API: nr::*, errno::*, ShmProt, AbiError, decode_syscall; OS-only wrappers: shm_*, fork, exit, wait, getpid, sbrk
//! DEPENDS_ON: no_std (OS), riscv ecall asm (OS), bitflags
//! INVARIANTS: Stable syscall IDs; failures are negative errno values; wrappers never panic

use bitflags::bitflags;

/// Result type returned by ABI helpers.
pub type SysResult<T> = core::result::Result<T, AbiError>;

/// Stable syscall numbers (register `a7`).
pub mod nr {
    /// Returns the caller's PID.
    pub const GETPID: usize = 0;
    /// Duplicates the caller; the child inherits its shared-memory descriptors.
    pub const FORK: usize = 1;
    /// Terminates the caller with a status code.
    pub const EXIT: usize = 2;
    /// Reaps one exited child.
    pub const WAIT: usize = 3;
    /// Grows or shrinks the caller's heap by a signed byte delta.
    pub const SBRK: usize = 4;
    /// Opens (or creates) a named shared-memory object.
    pub const SHM_OPEN: usize = 5;
    /// Commits a size to an opened shared-memory object (one shot).
    pub const SHM_TRUNC: usize = 6;
    /// Maps a committed object into the caller's shared-memory window.
    pub const SHM_MAP: usize = 7;
    /// Drops a shared-memory descriptor.
    pub const SHM_CLOSE: usize = 8;
}

/// Error numbers carried (negated) in the syscall return register.
pub mod errno {
    /// Unknown descriptor.
    pub const EBADF: usize = 9;
    /// No children to reap.
    pub const ECHILD: usize = 10;
    /// Children exist but none has exited yet.
    pub const EAGAIN: usize = 11;
    /// Physical memory exhausted.
    pub const ENOMEM: usize = 12;
    /// A user mapping could not be installed.
    pub const EFAULT: usize = 14;
    /// Descriptor already mapped.
    pub const EBUSY: usize = 16;
    /// Object already committed.
    pub const EEXIST: usize = 17;
    /// Object has no backing pages yet.
    pub const ENXIO: usize = 6;
    /// Malformed argument.
    pub const EINVAL: usize = 22;
    /// Global table full.
    pub const ENFILE: usize = 23;
    /// Per-process table full.
    pub const EMFILE: usize = 24;
    /// Object name empty or too long.
    pub const ENAMETOOLONG: usize = 36;
    /// Syscall number not implemented.
    pub const ENOSYS: usize = 38;
}

/// Encodes `code` the way the kernel writes it into the return register.
pub const fn encode_errno(code: usize) -> usize {
    (-(code as isize)) as usize
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    /// Permissions requested by `shm_map`.
    pub struct ShmProt: usize {
        /// Mapping is readable.
        const READ = 1 << 0;
        /// Mapping is writable.
        const WRITE = 1 << 1;
        /// Mapping is executable.
        const EXEC = 1 << 2;
    }
}

/// Errors decoded from a raw syscall return value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AbiError {
    /// Syscall number is not implemented by the kernel build.
    InvalidSyscall,
    /// Syscall arguments were invalid for the requested operation.
    InvalidArgument,
    /// Descriptor is out of range or not open.
    InvalidDescriptor,
    /// Every global shared-memory slot is in use.
    RegistryFull,
    /// Every descriptor slot of the caller is in use.
    LocalTableFull,
    /// The object was already committed by an earlier truncate.
    AlreadyCommitted,
    /// The object has not been committed yet.
    NotCommitted,
    /// The descriptor is already mapped in the caller.
    AlreadyMapped,
    /// The kernel ran out of physical pages.
    OutOfMemory,
    /// A page-table insertion failed.
    MapFailed,
    /// Object name is empty or exceeds the kernel limit.
    InvalidName,
    /// Caller has no children to wait on.
    NoChildren,
    /// Children exist but none has exited.
    WouldBlock,
    /// Return value did not match any known errno.
    Unknown(usize),
    /// Operation unsupported on the current build target.
    Unsupported,
}

impl AbiError {
    /// Maps a positive errno to the error it reports.
    pub const fn from_errno(code: usize) -> Self {
        match code {
            errno::ENOSYS => Self::InvalidSyscall,
            errno::EINVAL => Self::InvalidArgument,
            errno::EBADF => Self::InvalidDescriptor,
            errno::ENFILE => Self::RegistryFull,
            errno::EMFILE => Self::LocalTableFull,
            errno::EEXIST => Self::AlreadyCommitted,
            errno::ENXIO => Self::NotCommitted,
            errno::EBUSY => Self::AlreadyMapped,
            errno::ENOMEM => Self::OutOfMemory,
            errno::EFAULT => Self::MapFailed,
            errno::ENAMETOOLONG => Self::InvalidName,
            errno::ECHILD => Self::NoChildren,
            errno::EAGAIN => Self::WouldBlock,
            other => Self::Unknown(other),
        }
    }

    /// Returns the positive errno for this error, if it has one.
    pub const fn errno(self) -> Option<usize> {
        match self {
            Self::InvalidSyscall => Some(errno::ENOSYS),
            Self::InvalidArgument => Some(errno::EINVAL),
            Self::InvalidDescriptor => Some(errno::EBADF),
            Self::RegistryFull => Some(errno::ENFILE),
            Self::LocalTableFull => Some(errno::EMFILE),
            Self::AlreadyCommitted => Some(errno::EEXIST),
            Self::NotCommitted => Some(errno::ENXIO),
            Self::AlreadyMapped => Some(errno::EBUSY),
            Self::OutOfMemory => Some(errno::ENOMEM),
            Self::MapFailed => Some(errno::EFAULT),
            Self::InvalidName => Some(errno::ENAMETOOLONG),
            Self::NoChildren => Some(errno::ECHILD),
            Self::WouldBlock => Some(errno::EAGAIN),
            Self::Unknown(code) => Some(code),
            Self::Unsupported => None,
        }
    }
}

/// Largest errno the kernel ever reports; anything more negative is a value.
const MAX_ERRNO: usize = 4095;

/// Splits a raw return register into a value or a decoded error.
pub fn decode_syscall(raw: usize) -> SysResult<usize> {
    let signed = raw as isize;
    if signed < 0 && signed.unsigned_abs() <= MAX_ERRNO {
        Err(AbiError::from_errno(signed.unsigned_abs()))
    } else {
        Ok(raw)
    }
}

// ——— Syscall wrappers (OS build) ———

/// Opens the shared-memory object called `name`, creating it if needed.
pub fn shm_open(name: &str) -> SysResult<usize> {
    #[cfg(all(target_arch = "riscv64", target_os = "none"))]
    {
        let raw = unsafe {
            // SAFETY: the kernel copies `len` bytes from `ptr` out of our address space.
            ecall2(nr::SHM_OPEN, name.as_ptr() as usize, name.len())
        };
        decode_syscall(raw)
    }
    #[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
    {
        let _ = name;
        Err(AbiError::Unsupported)
    }
}

/// Commits `size` bytes to descriptor `desc`; returns the committed size.
pub fn shm_trunc(desc: usize, size: usize) -> SysResult<usize> {
    #[cfg(all(target_arch = "riscv64", target_os = "none"))]
    {
        let raw = unsafe { ecall2(nr::SHM_TRUNC, desc, size) };
        decode_syscall(raw)
    }
    #[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
    {
        let _ = (desc, size);
        Err(AbiError::Unsupported)
    }
}

/// Maps descriptor `desc` with `prot`; returns the base virtual address.
pub fn shm_map(desc: usize, prot: ShmProt) -> SysResult<usize> {
    #[cfg(all(target_arch = "riscv64", target_os = "none"))]
    {
        let raw = unsafe { ecall2(nr::SHM_MAP, desc, prot.bits()) };
        decode_syscall(raw)
    }
    #[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
    {
        let _ = (desc, prot);
        Err(AbiError::Unsupported)
    }
}

/// Closes descriptor `desc`, unmapping it first when mapped.
pub fn shm_close(desc: usize) -> SysResult<()> {
    #[cfg(all(target_arch = "riscv64", target_os = "none"))]
    {
        let raw = unsafe { ecall1(nr::SHM_CLOSE, desc) };
        decode_syscall(raw).map(|_| ())
    }
    #[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
    {
        let _ = desc;
        Err(AbiError::Unsupported)
    }
}

/// Returns the caller's PID.
pub fn getpid() -> SysResult<u32> {
    #[cfg(all(target_arch = "riscv64", target_os = "none"))]
    {
        let raw = unsafe { ecall1(nr::GETPID, 0) };
        decode_syscall(raw).map(|pid| pid as u32)
    }
    #[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
    {
        Err(AbiError::Unsupported)
    }
}

/// Forks the caller. Returns the child PID in the parent and 0 in the child.
pub fn fork() -> SysResult<u32> {
    #[cfg(all(target_arch = "riscv64", target_os = "none"))]
    {
        let raw = unsafe { ecall1(nr::FORK, 0) };
        decode_syscall(raw).map(|pid| pid as u32)
    }
    #[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
    {
        Err(AbiError::Unsupported)
    }
}

/// Terminates the caller.
pub fn exit(status: i32) -> SysResult<()> {
    #[cfg(all(target_arch = "riscv64", target_os = "none"))]
    {
        let raw = unsafe { ecall1(nr::EXIT, status as usize) };
        decode_syscall(raw).map(|_| ())
    }
    #[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
    {
        let _ = status;
        Err(AbiError::Unsupported)
    }
}

/// Reaps one exited child and returns its PID.
pub fn wait() -> SysResult<u32> {
    #[cfg(all(target_arch = "riscv64", target_os = "none"))]
    {
        let raw = unsafe { ecall1(nr::WAIT, 0) };
        decode_syscall(raw).map(|pid| pid as u32)
    }
    #[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
    {
        Err(AbiError::Unsupported)
    }
}

/// Moves the heap break by `delta` bytes and returns the previous break.
pub fn sbrk(delta: isize) -> SysResult<usize> {
    #[cfg(all(target_arch = "riscv64", target_os = "none"))]
    {
        let raw = unsafe { ecall1(nr::SBRK, delta as usize) };
        decode_syscall(raw)
    }
    #[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
    {
        let _ = delta;
        Err(AbiError::Unsupported)
    }
}

// ——— Architecture-specific ecall helpers (riscv64, OS) ———
#[cfg(all(target_arch = "riscv64", target_os = "none"))]
#[allow(unused_assignments)]
#[inline(always)]
unsafe fn ecall1(n: usize, a0: usize) -> usize {
    let mut r0 = a0;
    let mut r7 = n;
    core::arch::asm!(
        "ecall",
        inout("a0") r0,
        inout("a7") r7,
        clobber_abi("C"),
        options(nostack)
    );
    r0
}

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
#[allow(unused_assignments)]
#[inline(always)]
unsafe fn ecall2(n: usize, a0: usize, a1: usize) -> usize {
    let mut r0 = a0;
    let mut r1 = a1;
    let mut r7 = n;
    core::arch::asm!(
        "ecall",
        inout("a0") r0,
        inout("a1") r1,
        inout("a7") r7,
        clobber_abi("C"),
        options(nostack)
    );
    r0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_negative_values_decode_as_errors() {
        assert_eq!(decode_syscall(encode_errno(errno::EBADF)), Err(AbiError::InvalidDescriptor));
        assert_eq!(decode_syscall(encode_errno(999)), Err(AbiError::Unknown(999)));
    }

    #[test]
    fn window_addresses_are_values() {
        // Upper-half kernel-style addresses must not be mistaken for errno values.
        assert_eq!(decode_syscall(0x3f_ffe0_0000), Ok(0x3f_ffe0_0000));
        assert_eq!(decode_syscall(usize::MAX - MAX_ERRNO), Ok(usize::MAX - MAX_ERRNO));
    }

    #[test]
    fn host_wrappers_are_unsupported() {
        assert_eq!(shm_open("seg"), Err(AbiError::Unsupported));
        assert_eq!(shm_map(0, ShmProt::READ), Err(AbiError::Unsupported));
    }
}
