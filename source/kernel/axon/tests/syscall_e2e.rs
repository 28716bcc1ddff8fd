// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: End-to-end tests through the raw syscall interface
//! OWNERS: @kernel-team
//! STATUS: Functional
//!
//! TEST_SCOPE:
//!   - Register-level shm_open/shm_trunc/shm_map/shm_close with errno decoding
//!   - Sharing across fork, reclamation on close and exit
//!   - Heap guard below the shared-memory window
//!   - Concurrent open/close of one name from several processes
//!
//! TEST_SCENARIOS:
//!   - round_trip_between_processes(): 42 written by one process is read by another
//!   - fork_inherits_mappings(): 7 then 9 observed on both sides, ref_count 2
//!   - reclaim_returns_to_baseline(): last close frees every page
//!   - error_paths_map_to_errno(): every failure decodes to its AbiError
//!   - registry_and_table_exhaustion(): ENFILE past the registry, EMFILE past the table
//!   - concurrent_open_close_is_consistent(): racing threads leave no residue

use std::sync::Arc;
use std::thread;

use axon::mm::layout::{shm_slot_base, SHM_WINDOW_BASE, USER_HEAP_BASE};
use axon::mm::{FrameAllocator, PAGE_SIZE};
use axon::shm::{LOCAL_SLOTS, MAX_PAGES_PER_OBJECT, REGISTRY_CAPACITY};
use axon::task::Pid;
use axon::Kernel;
use axon_abi::{decode_syscall, nr, AbiError, ShmProt};

const RW: usize = ShmProt::READ.bits() | ShmProt::WRITE.bits();

fn call(kernel: &Kernel, pid: Pid, number: usize, args: &[usize]) -> Result<usize, AbiError> {
    let mut regs = [0usize; 6];
    regs[..args.len()].copy_from_slice(args);
    decode_syscall(kernel.syscall(pid, number, regs))
}

/// Places `name` at the bottom of the caller's heap and opens it.
fn shm_open(kernel: &Kernel, pid: Pid, name: &str) -> Result<usize, AbiError> {
    kernel
        .tasks()
        .with_process(pid, |p| p.address_space_mut().unwrap().user_write(USER_HEAP_BASE, name.as_bytes()))
        .unwrap()
        .unwrap();
    call(kernel, pid, nr::SHM_OPEN, &[USER_HEAP_BASE, name.len()])
}

fn poke(kernel: &Kernel, pid: Pid, va: usize, byte: u8) {
    kernel
        .tasks()
        .with_process(pid, |p| p.address_space_mut().unwrap().user_write(va, &[byte]))
        .unwrap()
        .unwrap();
}

fn peek(kernel: &Kernel, pid: Pid, va: usize) -> u8 {
    let mut byte = [0u8];
    kernel
        .tasks()
        .with_process(pid, |p| p.address_space().unwrap().user_read(va, &mut byte))
        .unwrap()
        .unwrap();
    byte[0]
}

/// New process with one heap page for passing names.
fn spawn(kernel: &Kernel) -> Pid {
    let pid = kernel.spawn().unwrap();
    assert_eq!(call(kernel, pid, nr::SBRK, &[PAGE_SIZE]), Ok(USER_HEAP_BASE));
    pid
}

#[test]
fn round_trip_between_processes() {
    let kernel = Kernel::new(64);
    let (a, b) = (spawn(&kernel), spawn(&kernel));

    let fd_a = shm_open(&kernel, a, "chan").unwrap();
    assert_eq!(shm_open(&kernel, a, "chan"), Ok(fd_a));
    assert_eq!(call(&kernel, a, nr::SHM_TRUNC, &[fd_a, 4096]), Ok(4096));
    assert_eq!(call(&kernel, a, nr::SHM_TRUNC, &[fd_a, 8192]), Err(AbiError::AlreadyCommitted));
    let va_a = call(&kernel, a, nr::SHM_MAP, &[fd_a, RW]).unwrap();
    assert_eq!(va_a, shm_slot_base(fd_a));
    poke(&kernel, a, va_a, 42);

    let fd_b = shm_open(&kernel, b, "chan").unwrap();
    let va_b = call(&kernel, b, nr::SHM_MAP, &[fd_b, ShmProt::READ.bits()]).unwrap();
    assert_eq!(peek(&kernel, b, va_b), 42);

    let id = kernel.registry().find(b"chan").unwrap();
    assert_eq!(kernel.registry().stat(id).unwrap().ref_count, 2);
}

#[test]
fn fork_inherits_mappings() {
    let kernel = Kernel::new(64);
    let parent = spawn(&kernel);
    let fd = shm_open(&kernel, parent, "fork").unwrap();
    call(&kernel, parent, nr::SHM_TRUNC, &[fd, 100]).unwrap();
    let va = call(&kernel, parent, nr::SHM_MAP, &[fd, RW]).unwrap();
    poke(&kernel, parent, va, 7);

    let child = Pid::from_raw(call(&kernel, parent, nr::FORK, &[]).unwrap() as u32);
    assert_eq!(call(&kernel, child, nr::GETPID, &[]), Ok(child.as_index()));
    assert_eq!(peek(&kernel, child, va), 7);
    poke(&kernel, child, va, 9);
    assert_eq!(peek(&kernel, parent, va), 9);
    let id = kernel.registry().find(b"fork").unwrap();
    assert_eq!(kernel.registry().stat(id).unwrap().ref_count, 2);

    assert_eq!(call(&kernel, child, nr::SHM_MAP, &[fd, RW]), Err(AbiError::AlreadyMapped));
    call(&kernel, child, nr::EXIT, &[0]).unwrap();
    assert_eq!(kernel.registry().stat(id).unwrap().ref_count, 1);
    assert_eq!(call(&kernel, parent, nr::WAIT, &[]), Ok(child.as_index()));
    assert_eq!(call(&kernel, parent, nr::WAIT, &[]), Err(AbiError::NoChildren));
}

#[test]
fn reclaim_returns_to_baseline() {
    let kernel = Kernel::new(64);
    let (a, b) = (spawn(&kernel), spawn(&kernel));
    let baseline = kernel.frames().free_pages();

    let fd_a = shm_open(&kernel, a, "tmp").unwrap();
    call(&kernel, a, nr::SHM_TRUNC, &[fd_a, 5 * PAGE_SIZE]).unwrap();
    call(&kernel, a, nr::SHM_MAP, &[fd_a, RW]).unwrap();
    let fd_b = shm_open(&kernel, b, "tmp").unwrap();
    call(&kernel, b, nr::SHM_MAP, &[fd_b, RW]).unwrap();
    assert_eq!(kernel.frames().free_pages(), baseline - 5);

    call(&kernel, a, nr::SHM_CLOSE, &[fd_a]).unwrap();
    assert_eq!(kernel.frames().free_pages(), baseline - 5);
    call(&kernel, b, nr::SHM_CLOSE, &[fd_b]).unwrap();
    assert_eq!(kernel.frames().free_pages(), baseline);
    assert_eq!(kernel.registry().find(b"tmp"), None);
    assert_eq!(call(&kernel, a, nr::SHM_CLOSE, &[fd_a]), Err(AbiError::InvalidDescriptor));
}

#[test]
fn error_paths_map_to_errno() {
    let kernel = Kernel::new(256);
    let pid = spawn(&kernel);

    assert_eq!(call(&kernel, pid, 15, &[]), Err(AbiError::InvalidSyscall));
    assert_eq!(call(&kernel, pid, 999, &[]), Err(AbiError::InvalidSyscall));
    assert_eq!(call(&kernel, pid, nr::SHM_OPEN, &[USER_HEAP_BASE, 0]), Err(AbiError::InvalidName));
    assert_eq!(call(&kernel, pid, nr::SHM_OPEN, &[USER_HEAP_BASE, 15]), Err(AbiError::InvalidName));
    assert_eq!(call(&kernel, pid, nr::SHM_OPEN, &[0x1000, 4]), Err(AbiError::InvalidArgument));
    assert_eq!(call(&kernel, pid, nr::SHM_TRUNC, &[LOCAL_SLOTS, 1]), Err(AbiError::InvalidDescriptor));
    assert_eq!(call(&kernel, pid, nr::SHM_MAP, &[3, RW]), Err(AbiError::InvalidDescriptor));

    let fd = shm_open(&kernel, pid, "edge").unwrap();
    assert_eq!(call(&kernel, pid, nr::SHM_MAP, &[fd, RW]), Err(AbiError::NotCommitted));
    assert_eq!(call(&kernel, pid, nr::SHM_MAP, &[fd, 0b1000]), Err(AbiError::InvalidArgument));
    let before = kernel.frames().free_pages();
    let too_big = (MAX_PAGES_PER_OBJECT + 1) * PAGE_SIZE;
    for size in [0, usize::MAX, too_big] {
        assert_eq!(call(&kernel, pid, nr::SHM_TRUNC, &[fd, size]), Err(AbiError::InvalidArgument));
    }
    assert_eq!(kernel.frames().free_pages(), before);

    assert_eq!(call(&kernel, pid, nr::SBRK, &[SHM_WINDOW_BASE]), Err(AbiError::OutOfMemory));
    assert_eq!(call(&kernel, pid, nr::WAIT, &[]), Err(AbiError::NoChildren));
}

#[test]
fn registry_and_table_exhaustion() {
    let kernel = Kernel::new(64);
    let procs: Vec<Pid> = (0..5).map(|_| spawn(&kernel)).collect();
    for i in 0..REGISTRY_CAPACITY {
        shm_open(&kernel, procs[i / LOCAL_SLOTS], &format!("r{i}")).unwrap();
    }
    assert_eq!(shm_open(&kernel, procs[4], "overflow"), Err(AbiError::RegistryFull));
    assert_eq!(shm_open(&kernel, procs[0], "r20"), Err(AbiError::LocalTableFull));
    assert_eq!(kernel.registry().live_objects(), REGISTRY_CAPACITY);
}

#[test]
fn concurrent_open_close_is_consistent() {
    let kernel = Arc::new(Kernel::new(512));
    let pids: Vec<Pid> = (0..4).map(|_| spawn(&kernel)).collect();
    let baseline = kernel.frames().free_pages();

    let workers: Vec<_> = pids
        .into_iter()
        .map(|pid| {
            let kernel = Arc::clone(&kernel);
            thread::spawn(move || {
                for _ in 0..50 {
                    let fd = shm_open(&kernel, pid, "race").unwrap();
                    match call(&kernel, pid, nr::SHM_TRUNC, &[fd, 2 * PAGE_SIZE]) {
                        Ok(_) | Err(AbiError::AlreadyCommitted) => {}
                        Err(err) => panic!("unexpected truncate error {err:?}"),
                    }
                    match call(&kernel, pid, nr::SHM_MAP, &[fd, RW]) {
                        Ok(va) => poke(&kernel, pid, va, 1),
                        Err(AbiError::NotCommitted) => {}
                        Err(err) => panic!("unexpected map error {err:?}"),
                    }
                    call(&kernel, pid, nr::SHM_CLOSE, &[fd]).unwrap();
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    assert_eq!(kernel.registry().find(b"race"), None);
    assert_eq!(kernel.registry().live_objects(), 0);
    assert_eq!(kernel.frames().free_pages(), baseline);
}
