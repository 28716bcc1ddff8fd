// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Property-based tests for shared-memory bookkeeping
//! OWNERS: @kernel-team
//! NOTE: Tests only; random operation sequences over three processes
//!
//! TEST_SCOPE:
//!   - ref_count always equals the number of descriptors naming an object
//!   - Frames in use always equal the pages held by live objects
//!
//! TEST_SCENARIOS:
//!   - refcounts_track_descriptors(): invariants hold after every step
//!   - teardown_restores_baseline(): tearing every process down frees everything

use super::*;
use crate::mm::{AddressSpace, FrameAllocator, FramePool, PageFlags, PAGE_SIZE};
use proptest::prelude::*;

const PROCS: usize = 3;
const NAMES: [&str; 4] = ["a", "b", "c", "d"];
const POOL: usize = 48;

#[derive(Clone, Debug)]
enum Op {
    Open(usize, usize),
    Truncate(usize, usize, isize),
    Map(usize, usize),
    Close(usize, usize),
    Fork(usize, usize),
}

fn arb_op() -> impl Strategy<Value = Op> {
    let who = 0..PROCS;
    let name = 0..NAMES.len();
    prop_oneof![
        (who.clone(), name.clone()).prop_map(|(p, n)| Op::Open(p, n)),
        (who.clone(), name.clone(), -1isize..(5 * PAGE_SIZE as isize))
            .prop_map(|(p, n, s)| Op::Truncate(p, n, s)),
        (who.clone(), name.clone()).prop_map(|(p, n)| Op::Map(p, n)),
        (who.clone(), name).prop_map(|(p, n)| Op::Close(p, n)),
        (who.clone(), who).prop_map(|(p, c)| Op::Fork(p, c)),
    ]
}

struct World {
    registry: Registry,
    frames: FramePool,
    procs: Vec<(DescriptorTable, AddressSpace)>,
}

impl World {
    fn new() -> Self {
        let procs = (0..PROCS).map(|i| (DescriptorTable::new(), AddressSpace::new(i as u16 + 1))).collect();
        Self { registry: Registry::new(), frames: FramePool::new(POOL), procs }
    }

    fn fd_for(&self, proc: usize, name: usize) -> Option<ShmFd> {
        let id = self.registry.find(NAMES[name].as_bytes())?;
        self.procs[proc].0.iter().find(|(_, d)| d.object() == id).map(|(fd, _)| fd)
    }

    fn apply(&mut self, op: &Op) {
        match *op {
            Op::Open(p, n) => {
                let _ = open(&mut self.procs[p].0, &self.registry, NAMES[n].as_bytes());
            }
            Op::Truncate(p, n, size) => {
                if let Some(fd) = self.fd_for(p, n) {
                    let _ = truncate(&self.procs[p].0, &self.registry, &self.frames, fd, size);
                }
            }
            Op::Map(p, n) => {
                if let Some(fd) = self.fd_for(p, n) {
                    let (table, space) = &mut self.procs[p];
                    let _ = map(table, space, &self.registry, fd, PageFlags::READ);
                }
            }
            Op::Close(p, n) => {
                if let Some(fd) = self.fd_for(p, n) {
                    let (table, space) = &mut self.procs[p];
                    close(table, space, &self.registry, &self.frames, fd).unwrap();
                }
            }
            Op::Fork(p, c) if p != c => {
                // The child slot is recycled: its old image exits first.
                self.teardown(c);
                let parent = self.procs[p].0.clone();
                let (table, space) = &mut self.procs[c];
                if fork_duplicate(&parent, table, space, &self.registry).is_err() {
                    exit_teardown(table, space, &self.registry, &self.frames);
                }
            }
            Op::Fork(..) => {}
        }
    }

    fn teardown(&mut self, proc: usize) {
        let (table, space) = &mut self.procs[proc];
        exit_teardown(table, space, &self.registry, &self.frames);
    }

    fn check(&self) -> Result<(), TestCaseError> {
        let mut held_pages = 0;
        for name in NAMES {
            let Some(id) = self.registry.find(name.as_bytes()) else {
                continue;
            };
            let stat = self.registry.stat(id).unwrap();
            let holders = self
                .procs
                .iter()
                .map(|(table, _)| table.iter().filter(|(_, d)| d.object() == id).count())
                .sum::<usize>();
            prop_assert_eq!(stat.ref_count, holders);
            held_pages += stat.pages;
        }
        prop_assert_eq!(self.frames.free_pages() + held_pages, POOL);
        Ok(())
    }
}

proptest! {
    #[test]
    fn refcounts_track_descriptors(ops in prop::collection::vec(arb_op(), 1..64)) {
        let mut world = World::new();
        for op in &ops {
            world.apply(op);
            world.check()?;
        }
    }

    #[test]
    fn teardown_restores_baseline(ops in prop::collection::vec(arb_op(), 1..64)) {
        let mut world = World::new();
        for op in &ops {
            world.apply(op);
        }
        for proc in 0..PROCS {
            world.teardown(proc);
        }
        prop_assert_eq!(world.frames.free_pages(), POOL);
        prop_assert_eq!(world.registry.live_objects(), 0);
    }
}
