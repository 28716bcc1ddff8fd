// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Process table and lifecycle (spawn/fork/exit/wait/sbrk)
//! OWNERS: @kernel-sched-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests (fork sharing, reaping, reparenting, concurrent fork)
//! PUBLIC API: ProcessTable, Process, ProcState, SpawnError, WaitError, ProcessError
//! DEPENDS_ON: mm::{AddressSpace, AsidAllocator, FrameAllocator}, shm, spin::Mutex
//! INVARIANTS:
//!   - Pid raw value == slot index
//!   - A process holding live descriptors or heap frames is Runnable or Zombie
//!   - Reaping runs shared-memory teardown before the address space is released
//!
//! Each slot has its own lock. Fork reserves the child slot before locking the
//! parent, then locks parent before child; no path holds two process locks in
//! the opposite order.

use alloc::vec::Vec;

use spin::Mutex;

use crate::mm::layout::USER_HEAP_BASE;
use crate::mm::{AddressSpace, AddressSpaceError, AsidAllocator, FrameAllocator};
use crate::shm::{self, DescriptorTable, Registry, ShmError};

pub use crate::types::Pid;

/// Upper bound on simultaneously live processes.
pub const MAX_PROCS: usize = 64;

/// Lifecycle state of a process slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcState {
    Unused,
    /// Reserved by an in-flight fork or spawn.
    Embryo,
    Runnable,
    Zombie,
}

/// Errors returned when creating processes.
#[must_use = "spawn errors must be handled explicitly"]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnError {
    /// Parent does not exist or is not runnable.
    NoSuchProcess,
    /// Every process slot is in use.
    TableFull,
    /// Address-space setup failed.
    AddressSpace(AddressSpaceError),
    /// Descriptor inheritance failed.
    Shm(ShmError),
}

impl From<AddressSpaceError> for SpawnError {
    fn from(value: AddressSpaceError) -> Self {
        Self::AddressSpace(value)
    }
}

impl From<ShmError> for SpawnError {
    fn from(value: ShmError) -> Self {
        Self::Shm(value)
    }
}

/// Errors returned when waiting for child processes.
#[must_use = "wait errors must be handled explicitly"]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitError {
    /// Caller has no children to reap.
    NoChildren,
    /// Children exist but none has exited yet.
    WouldBlock,
}

/// Errors returned by operations on a running process.
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessError {
    /// Pid does not name a runnable process.
    NoSuchProcess,
    /// Heap resize failed.
    AddressSpace(AddressSpaceError),
}

impl From<AddressSpaceError> for ProcessError {
    fn from(value: AddressSpaceError) -> Self {
        Self::AddressSpace(value)
    }
}

/// One process slot.
pub struct Process {
    pid: Pid,
    parent: Option<Pid>,
    state: ProcState,
    exit_code: Option<i32>,
    space: Option<AddressSpace>,
    shm: DescriptorTable,
}

impl Process {
    fn unused(pid: Pid) -> Self {
        Self {
            pid,
            parent: None,
            state: ProcState::Unused,
            exit_code: None,
            space: None,
            shm: DescriptorTable::new(),
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn parent(&self) -> Option<Pid> {
        self.parent
    }

    pub fn state(&self) -> ProcState {
        self.state
    }

    pub fn address_space(&self) -> Option<&AddressSpace> {
        self.space.as_ref()
    }

    pub fn address_space_mut(&mut self) -> Option<&mut AddressSpace> {
        self.space.as_mut()
    }

    pub fn descriptors(&self) -> &DescriptorTable {
        &self.shm
    }

    /// Splits the process into the two halves shared-memory calls need.
    pub fn shm_context(&mut self) -> Option<(&mut DescriptorTable, &mut AddressSpace)> {
        let space = self.space.as_mut()?;
        Some((&mut self.shm, space))
    }

    /// Drops every descriptor. Safe to call more than once.
    fn shm_teardown(&mut self, registry: &Registry, frames: &dyn FrameAllocator) {
        if let Some(space) = self.space.as_mut() {
            let dropped = shm::exit_teardown(&mut self.shm, space, registry, frames);
            if dropped > 0 {
                log_debug!(target: "task", "pid {}: released {} shm descriptors", self.pid, dropped);
            }
        }
    }
}

/// Fixed-size table of processes.
pub struct ProcessTable {
    slots: Vec<Mutex<Process>>,
    asids: Mutex<AsidAllocator>,
    init: Mutex<Option<Pid>>,
}

impl ProcessTable {
    /// Creates a table with room for `capacity` processes (at most [`MAX_PROCS`]).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.clamp(1, MAX_PROCS);
        let slots = (0..capacity).map(|i| Mutex::new(Process::unused(Pid::from_raw(i as u32)))).collect();
        Self { slots, asids: Mutex::new(AsidAllocator::new()), init: Mutex::new(None) }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn slot(&self, pid: Pid) -> Option<&Mutex<Process>> {
        self.slots.get(pid.as_index())
    }

    fn reserve_slot(&self) -> Option<Pid> {
        self.slots.iter().find_map(|slot| {
            let mut process = slot.lock();
            (process.state == ProcState::Unused).then(|| {
                process.state = ProcState::Embryo;
                process.pid
            })
        })
    }

    fn discard_embryo(&self, pid: Pid) {
        if let Some(slot) = self.slot(pid) {
            *slot.lock() = Process::unused(pid);
        }
    }

    /// Creates a process with an empty address space.
    ///
    /// The first process ever spawned becomes `init` and adopts orphans.
    pub fn spawn(&self, parent: Option<Pid>) -> Result<Pid, SpawnError> {
        let pid = self.reserve_slot().ok_or(SpawnError::TableFull)?;
        let Some(asid) = self.asids.lock().allocate() else {
            self.discard_embryo(pid);
            return Err(AddressSpaceError::AsidExhausted.into());
        };
        let mut init = self.init.lock();
        // Everyone but init has a reaper.
        let parent = parent.or(*init);
        if let Some(slot) = self.slot(pid) {
            let mut process = slot.lock();
            process.parent = parent;
            process.space = Some(AddressSpace::new(asid));
            process.state = ProcState::Runnable;
        }
        init.get_or_insert(pid);
        drop(init);
        log_info!(target: "task", "spawn pid {} (asid {}, parent {:?})", pid, asid, parent);
        Ok(pid)
    }

    /// Creates a child of `parent` with a private heap copy and every shared
    /// object descriptor inherited. On failure nothing of the child remains.
    pub fn fork(
        &self,
        parent: Pid,
        frames: &dyn FrameAllocator,
        registry: &Registry,
    ) -> Result<Pid, SpawnError> {
        let child = self.reserve_slot().ok_or(SpawnError::TableFull)?;
        match self.fork_into(parent, child, frames, registry) {
            Ok(()) => {
                log_debug!(target: "task", "fork {} -> {}", parent, child);
                Ok(child)
            }
            Err(err) => {
                self.discard_embryo(child);
                log_warn!(target: "task", "fork of {} failed: {:?}", parent, err);
                Err(err)
            }
        }
    }

    fn fork_into(
        &self,
        parent_pid: Pid,
        child_pid: Pid,
        frames: &dyn FrameAllocator,
        registry: &Registry,
    ) -> Result<(), SpawnError> {
        let parent = self.slot(parent_pid).ok_or(SpawnError::NoSuchProcess)?.lock();
        if parent.state != ProcState::Runnable {
            return Err(SpawnError::NoSuchProcess);
        }
        let parent_space = parent.space.as_ref().ok_or(SpawnError::NoSuchProcess)?;
        let mut child = self.slot(child_pid).ok_or(SpawnError::TableFull)?.lock();

        let asid = self.asids.lock().allocate().ok_or(AddressSpaceError::AsidExhausted)?;
        let mut space = match parent_space.duplicate(frames, asid) {
            Ok(space) => space,
            Err(err) => {
                self.asids.lock().free(asid);
                return Err(err.into());
            }
        };
        if let Err(err) = shm::fork_duplicate(&parent.shm, &mut child.shm, &mut space, registry) {
            shm::exit_teardown(&mut child.shm, &mut space, registry, frames);
            space.release(frames);
            self.asids.lock().free(asid);
            return Err(err.into());
        }
        child.space = Some(space);
        child.parent = Some(parent_pid);
        child.exit_code = None;
        child.state = ProcState::Runnable;
        Ok(())
    }

    /// Terminates `pid`: drops its shared memory now, keeps the slot as a
    /// zombie for the parent, and hands its children to `init`.
    ///
    /// A process nobody can wait for (init itself, or an orphan of an exited
    /// init) is reaped on the spot, as are zombie children left without a
    /// reaper.
    pub fn exit(
        &self,
        pid: Pid,
        status: i32,
        frames: &dyn FrameAllocator,
        registry: &Registry,
    ) -> Result<(), ProcessError> {
        let reaper = {
            let mut process = self.slot(pid).ok_or(ProcessError::NoSuchProcess)?.lock();
            if process.state != ProcState::Runnable {
                return Err(ProcessError::NoSuchProcess);
            }
            process.shm_teardown(registry, frames);
            process.state = ProcState::Zombie;
            process.exit_code = Some(status);
            process.parent
        };
        let heir = {
            let mut init = self.init.lock();
            if *init == Some(pid) {
                *init = None;
            }
            *init
        };
        for slot in &self.slots {
            let mut child = slot.lock();
            if child.parent != Some(pid) || child.state == ProcState::Unused {
                continue;
            }
            child.parent = heir;
            if heir.is_none() && child.state == ProcState::Zombie {
                self.reap(&mut child, frames, registry);
            }
        }
        if reaper.is_none() {
            if let Some(slot) = self.slot(pid) {
                let mut process = slot.lock();
                if process.state == ProcState::Zombie {
                    self.reap(&mut process, frames, registry);
                }
            }
        }
        log_info!(target: "task", "pid {} exited with {}", pid, status);
        Ok(())
    }

    /// Reaps one zombie child of `parent`, returning its pid and exit code.
    pub fn wait(
        &self,
        parent: Pid,
        frames: &dyn FrameAllocator,
        registry: &Registry,
    ) -> Result<(Pid, i32), WaitError> {
        let mut have_children = false;
        for slot in &self.slots {
            let mut child = slot.lock();
            if child.parent != Some(parent) || child.state == ProcState::Unused {
                continue;
            }
            have_children = true;
            if child.state != ProcState::Zombie {
                continue;
            }
            let pid = child.pid;
            let status = child.exit_code.unwrap_or(0);
            self.reap(&mut child, frames, registry);
            log_debug!(target: "task", "pid {} reaped {} (status {})", parent, pid, status);
            return Ok((pid, status));
        }
        Err(if have_children { WaitError::WouldBlock } else { WaitError::NoChildren })
    }

    fn reap(&self, child: &mut Process, frames: &dyn FrameAllocator, registry: &Registry) {
        child.shm_teardown(registry, frames);
        if let Some(mut space) = child.space.take() {
            space.release(frames);
            self.asids.lock().free(space.asid());
        }
        *child = Process::unused(child.pid);
    }

    /// Moves the break of `pid` by `delta` bytes and returns the old break.
    pub fn sbrk(
        &self,
        pid: Pid,
        delta: isize,
        frames: &dyn FrameAllocator,
    ) -> Result<usize, ProcessError> {
        self.with_process(pid, |process| -> Result<usize, ProcessError> {
            let space = process.space.as_mut().ok_or(ProcessError::NoSuchProcess)?;
            let old = space.heap_end();
            let new = old.checked_add_signed(delta).ok_or(AddressSpaceError::HeapLimit)?;
            if new >= old {
                space.grow_heap(frames, new)?;
            } else {
                if new < USER_HEAP_BASE {
                    return Err(AddressSpaceError::HeapLimit.into());
                }
                space.shrink_heap(frames, new)?;
            }
            Ok(old)
        })?
    }

    /// Runs `f` with exclusive access to the runnable process `pid`.
    pub fn with_process<R>(
        &self,
        pid: Pid,
        f: impl FnOnce(&mut Process) -> R,
    ) -> Result<R, ProcessError> {
        let mut process = self.slot(pid).ok_or(ProcessError::NoSuchProcess)?.lock();
        if process.state != ProcState::Runnable {
            return Err(ProcessError::NoSuchProcess);
        }
        Ok(f(&mut process))
    }

    pub fn state(&self, pid: Pid) -> Option<ProcState> {
        self.slot(pid).map(|slot| slot.lock().state)
    }

    pub fn parent_of(&self, pid: Pid) -> Option<Pid> {
        self.slot(pid).and_then(|slot| slot.lock().parent)
    }
}
