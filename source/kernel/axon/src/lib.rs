// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: AXON teaching kernel: named shared memory over per-process Sv39 address spaces
//! OWNERS: @kernel-team
//! PUBLIC API: Kernel, mm, shm, task, syscall
//! DEPENDS_ON: spin, bitflags, static_assertions, axon-abi
//! INVARIANTS: No physical page is mapped into a dead process or freed while mapped

#![cfg_attr(not(test), no_std)]
#![cfg_attr(not(test), forbid(clippy::unwrap_used))]

extern crate alloc;

#[macro_use]
pub mod diag;

mod kernel;
pub mod mm;
pub mod shm;
pub mod syscall;
pub mod task;
pub mod types;

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
mod uart;

#[cfg(all(feature = "panic_handler", target_arch = "riscv64", target_os = "none"))]
mod panic;

pub use kernel::Kernel;
