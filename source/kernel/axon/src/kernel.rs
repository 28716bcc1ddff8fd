// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Kernel state bundle and syscall entry
//! OWNERS: @kernel-team
//! PUBLIC API: Kernel::{new, with_allocator, spawn, syscall}
//! DEPENDS_ON: mm::FramePool, shm::Registry, task::ProcessTable, syscall
//! INVARIANTS: One registry and one frame source per kernel; every syscall runs as a known pid

use crate::mm::{FrameAllocator, FramePool};
use crate::shm::Registry;
use crate::syscall::{self, api, Args, SyscallTable};
use crate::task::{Pid, ProcessTable, SpawnError, MAX_PROCS};

/// Everything a trap needs to service a system call.
pub struct Kernel<F: FrameAllocator = FramePool> {
    frames: F,
    registry: Registry,
    tasks: ProcessTable,
    syscalls: SyscallTable,
}

impl Kernel<FramePool> {
    /// Builds a kernel over a fresh pool of `frames` physical pages.
    pub fn new(frames: usize) -> Self {
        Self::with_allocator(FramePool::new(frames), MAX_PROCS)
    }
}

impl<F: FrameAllocator> Kernel<F> {
    pub fn with_allocator(frames: F, max_procs: usize) -> Self {
        let mut syscalls = SyscallTable::new();
        api::install_handlers(&mut syscalls);
        Self { frames, registry: Registry::new(), tasks: ProcessTable::new(max_procs), syscalls }
    }

    pub fn frames(&self) -> &F {
        &self.frames
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn tasks(&self) -> &ProcessTable {
        &self.tasks
    }

    /// Creates a parentless process. The first one becomes `init`.
    pub fn spawn(&self) -> Result<Pid, SpawnError> {
        self.tasks.spawn(None)
    }

    /// Services system call `number` for `caller` and returns the `a0` value:
    /// the result on success, a negated errno on failure.
    pub fn syscall(&self, caller: Pid, number: usize, args: [usize; 6]) -> usize {
        let mut ctx = api::Context {
            caller,
            tasks: &self.tasks,
            registry: &self.registry,
            frames: &self.frames,
        };
        let result = self.syscalls.dispatch(number, &mut ctx, &Args::new(args));
        if let Err(err) = result {
            log_trace!(target: "syscall", "pid {} nr {} -> {}", caller, number, err);
        }
        syscall::encode_result(result)
    }
}
