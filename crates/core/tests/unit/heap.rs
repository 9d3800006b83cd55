//! JIT heap properties: the free-list invariant under arbitrary
//! alloc/free interleavings, page-exact invalidation, and lookup-cache
//! coherence.

use proptest::prelude::*;

use psrec_core::heap::{EeBlockIndex, EeBlockRecord, JitHeap, VuBlockIndex, VuBlockKey};

fn record(pc: u32, heap: &mut JitHeap) -> EeBlockRecord {
    let mem = heap.alloc(64).expect("heap space");
    EeBlockRecord {
        literals_start: mem,
        code_start: mem,
        code_end: unsafe { mem.add(64) },
        pc,
    }
}

#[test]
fn invalidate_page_frees_exactly_that_page() {
    let mut heap = JitHeap::new("test", 1 << 20).unwrap();
    let mut index = EeBlockIndex::new();

    for pc in [0x8004_1000u32, 0x8004_1004, 0x8004_1FFC, 0x8004_2000, 0x8004_0FFC] {
        let rec = record(pc, &mut heap);
        let _ = index.insert_block(pc, rec);
    }
    let usage_before = heap.usage();

    index.invalidate_page(0x8004_1, &mut heap);
    heap.check_consistency();

    // Everything in page 0x80041 is gone; neighbors are untouched.
    assert!(index.find_block(0x8004_1000).is_null());
    assert!(index.find_block(0x8004_1004).is_null());
    assert!(index.find_block(0x8004_1FFC).is_null());
    assert!(!index.find_block(0x8004_2000).is_null());
    assert!(!index.find_block(0x8004_0FFC).is_null());
    assert!(heap.usage() < usage_before);
}

#[test]
fn lookup_cache_coherence_after_resolution() {
    let mut heap = JitHeap::new("test", 1 << 20).unwrap();
    let mut index = EeBlockIndex::new();

    let pc = 0x0010_0000u32;
    let rec = record(pc, &mut heap);
    let stored = index.insert_block(pc, rec);
    index.write_lookup(pc, stored);

    assert_eq!(index.lookup_cached(pc), stored);
    // A PC aliasing the same slot but in a different page must miss once
    // the record's stored PC is compared.
    let alias = pc + (0x8000 << 2);
    assert_eq!(EeBlockIndex::lookup_slot(alias), EeBlockIndex::lookup_slot(pc));
    let cached = index.lookup_cached(alias);
    assert!(!cached.is_null());
    assert_ne!(unsafe { (*cached).pc }, alias);
}

#[test]
fn invalidation_scrubs_lookup_cache() {
    let mut heap = JitHeap::new("test", 1 << 20).unwrap();
    let mut index = EeBlockIndex::new();

    let pc = 0x8004_1000u32;
    let rec = record(pc, &mut heap);
    let stored = index.insert_block(pc, rec);
    index.write_lookup(pc, stored);

    index.invalidate_page(pc >> 12, &mut heap);
    assert!(index.lookup_cached(pc).is_null());
}

#[test]
fn vu_index_keys_on_full_context() {
    let mut heap = JitHeap::new("test", 1 << 20).unwrap();
    let mut index = VuBlockIndex::new();

    let base = VuBlockKey {
        pc: 0x100,
        prev_pc: 0xFFFF_FFFF,
        program: 0xDEAD_BEEF,
        pipeline_state: [1, 2],
    };
    let mem = heap.alloc(64).unwrap();
    let rec = psrec_core::heap::VuBlockRecord {
        literals_start: mem,
        code_start: mem,
        code_end: unsafe { mem.add(64) },
    };
    index.insert_block(base, rec, &mut heap);

    assert!(index.find_block(&base).is_some());
    // Any differing context component selects a different block.
    for key in [
        VuBlockKey { prev_pc: 0x80, ..base },
        VuBlockKey { program: 0xBEEF_DEAD, ..base },
        VuBlockKey { pipeline_state: [1, 3], ..base },
        VuBlockKey { pc: 0x108, ..base },
    ] {
        assert!(index.find_block(&key).is_none());
    }
}

proptest! {
    /// For any interleaved alloc/free sequence, in-use bytes never exceed
    /// the heap size and the bin invariant holds after every operation.
    #[test]
    fn allocator_invariants_hold(ops in proptest::collection::vec((0usize..3, 16usize..8192), 1..120)) {
        let mut heap = JitHeap::new("test", 1 << 20).unwrap();
        let mut live: Vec<*mut u8> = Vec::new();

        for (kind, size) in ops {
            match kind {
                // Allocate.
                0 | 1 => {
                    if let Some(ptr) = heap.alloc(size) {
                        live.push(ptr);
                    }
                }
                // Free the oldest live allocation.
                _ => {
                    if !live.is_empty() {
                        heap.free(live.remove(0));
                    }
                }
            }
            prop_assert!(heap.usage() <= heap.capacity());
            heap.check_consistency();
        }

        for ptr in live {
            heap.free(ptr);
            heap.check_consistency();
        }
        prop_assert_eq!(heap.usage(), 0);
    }
}
