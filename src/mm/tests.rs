//! Whole-process scenarios across the allocator, fork and the fault path.

use super::test_support::Machine;
use super::*;
use crate::config::PAGE_SIZE;
use crate::mm::cow::CowOutcome;
use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use proptest::prelude::*;

fn data_frame(ms: &MemorySet, va: usize) -> PhysPageNum {
    ms.translate(VirtAddr(va).floor()).unwrap().ppn()
}

#[test]
fn fork_write_exit_scenario() {
    let m = Machine::new(64);
    let fa = &m.allocator;
    let mut parent = MemorySet::new_initial(&m.kernel, &[0x73]).unwrap();

    // three lazy pages above the image, two of them touched
    let heap = parent.sbrk(3 * PAGE_SIZE as isize).unwrap();
    let used = fa.used_frames();
    for page in [0, 2] {
        let va = heap + page * PAGE_SIZE;
        assert_eq!(
            parent.handle_page_fault(va, AccessKind::Write),
            Ok(FaultResolution::LazyHeap)
        );
    }
    assert_eq!(fa.used_frames(), used + 2);
    let (p0, p2) = (data_frame(&parent, heap), data_frame(&parent, heap + 2 * PAGE_SIZE));

    // fork: no data frame is copied, only the child's tables appear
    let used = fa.used_frames();
    let mut child = parent.fork().unwrap();
    assert_eq!(fa.used_frames(), used + child.address_space().table_frames());
    assert_eq!(fa.refcount(p0), 2);
    assert_eq!(fa.refcount(p2), 2);
    assert!(child.translate(VirtAddr(heap + PAGE_SIZE).floor()).is_none());

    // the child's write gets it a private copy of page 0
    let used = fa.used_frames();
    assert_eq!(
        child.handle_page_fault(heap, AccessKind::Write),
        Ok(FaultResolution::CopyOnWrite(CowOutcome::Copied))
    );
    assert_eq!(fa.used_frames(), used + 1);
    assert_eq!(fa.refcount(p0), 1);
    let c0 = data_frame(&child, heap);
    assert_ne!(c0, p0);

    // the parent exits: both of its references go, only p0 was exclusively its own
    let used = fa.used_frames();
    let parent_tables = parent.address_space().table_frames();
    parent.recycle();
    assert_eq!(fa.used_frames(), used - parent_tables - 1);
    assert_eq!(fa.refcount(p0), 0);
    assert_eq!(fa.refcount(p2), 1);
    assert_eq!(fa.refcount(c0), 1);
    assert_eq!(data_frame(&child, heap + 2 * PAGE_SIZE), p2);

    // sole holder now: a write promotes in place
    assert_eq!(
        child.handle_page_fault(heap + 2 * PAGE_SIZE, AccessKind::Write),
        Ok(FaultResolution::CopyOnWrite(CowOutcome::Promoted))
    );
    child.recycle();
    assert_eq!(fa.used_frames(), m.kernel_frames);
}

#[test]
fn global_init_builds_kernel_space() {
    let memory = test_support::PhysMemory::new(16);
    assert!(kernel_space().is_none());
    let kernel = unsafe { init(memory.start(), memory.end()) };
    assert_eq!(FRAME_ALLOCATOR.total_frames(), 16);
    assert!(kernel_space().is_some());
    let ms = MemorySet::new_initial(kernel, b"boot").unwrap();
    assert_eq!(ms.size(), PAGE_SIZE);
    ms.recycle();
    assert_eq!(FRAME_ALLOCATOR.used_frames(), 4);
    // leaked on purpose: the global allocator outlives the test
    core::mem::forget(memory);
}

#[derive(Debug, Clone)]
enum Op {
    Touch { proc: usize, page: usize },
    Fork { proc: usize },
    Exit { proc: usize },
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (0usize..4, 0usize..6).prop_map(|(proc, page)| Op::Touch { proc, page }),
        1 => (0usize..4).prop_map(|proc| Op::Fork { proc }),
        1 => (0usize..4).prop_map(|proc| Op::Exit { proc }),
    ]
}

/// Every frame's count equals the number of user leaves naming it.
fn assert_conserved(m: &Machine, procs: &[MemorySet]) {
    let mut mapped: BTreeMap<PhysPageNum, usize> = BTreeMap::new();
    for ms in procs {
        let space = ms.address_space();
        for vpn in VPNRange::new(VirtPageNum(0), VirtAddr(ms.size()).ceil()) {
            if let Some(pte) = space.translate(vpn) {
                *mapped.entry(pte.ppn()).or_insert(0) += 1;
            }
            space.assert_synced(vpn);
        }
    }
    for (ppn, count) in &mapped {
        assert_eq!(m.allocator.refcount(*ppn), *count, "refcount of {:?}", ppn);
    }
    let tables: usize = procs.iter().map(|ms| ms.address_space().table_frames()).sum();
    assert_eq!(m.allocator.used_frames(), m.kernel_frames + tables + mapped.len());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn refcounts_are_conserved(ops in proptest::collection::vec(op(), 1..40)) {
        let m = Machine::new(256);
        let mut procs: Vec<MemorySet> = Vec::new();
        let mut init = MemorySet::new_initial(&m.kernel, &[]).unwrap();
        init.sbrk(6 * PAGE_SIZE as isize).unwrap();
        procs.push(init);
        for op in ops {
            match op {
                Op::Touch { proc, page } if !procs.is_empty() => {
                    let n = procs.len();
                    let ms = &mut procs[proc % n];
                    let va = (page + 1) * PAGE_SIZE + 8;
                    let _ = ms.copy_to_user(va, &[page as u8]);
                }
                Op::Fork { proc } if !procs.is_empty() && procs.len() < 6 => {
                    let idx = proc % procs.len();
                    let child = procs[idx].fork().unwrap();
                    procs.push(child);
                }
                Op::Exit { proc } if !procs.is_empty() => {
                    let idx = proc % procs.len();
                    procs.swap_remove(idx).recycle();
                }
                _ => {}
            }
            assert_conserved(&m, &procs);
        }
        for ms in procs {
            ms.recycle();
        }
        prop_assert_eq!(m.allocator.used_frames(), m.kernel_frames);
    }
}
