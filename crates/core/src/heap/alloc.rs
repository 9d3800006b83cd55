//! Binned free-list allocator over the RWX region.
//!
//! Free lists are binned by power-of-two size class to keep allocation
//! cheap and fragmentation low, with a single oversize bin at the end for
//! everything larger than the largest class. Power-of-two bins are
//! serviced by taking the head of the first sufficient class; the oversize
//! bin is serviced best-fit. Merging is done greedily on each free.
//!
//! Each heap object is framed by two `usize` headers:
//!
//! ```text
//! | size | payload ...                          | end mark |
//! ^-8    ^obj                                   ^obj+size
//! ```
//!
//! The end mark equals `size` while the object is free and zero while it
//! is in use, which is what lets `free` merge with both neighbors without
//! any global scan. Free objects additionally overlay a [`FreeNode`] at
//! the start of their payload.

use std::ptr;

use crate::common::CoreError;
use crate::heap::RwxRegion;

/// Minimum alignment of heap objects.
const ALIGN: usize = 16;

/// log2 of the smallest bin's lower bound (128 bytes).
const BIN_START: usize = 7;

/// Number of power-of-two bins; sizes `>= 1 << (BIN_START + BINS)` go to
/// the oversize bin.
const BINS: usize = 10;

/// Free-list node overlaid on a free object's payload.
#[repr(C)]
struct FreeNode {
    prev: *mut FreeNode,
    next: *mut FreeNode,
    bin: usize,
}

/// Rounds up to the allocator alignment.
const fn aligned_size(size: usize) -> usize {
    (size + ALIGN - 1) & !(ALIGN - 1)
}

/// The JIT code heap: an RWX region managed by the binned free lists.
#[derive(Debug)]
pub struct JitHeap {
    region: RwxRegion,
    bins: [*mut FreeNode; BINS + 1],
    usage: usize,
    tag: &'static str,
}

impl JitHeap {
    /// Maps the region and seeds the oversize bin with one object covering
    /// the whole heap.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::RegionMap`] when the mapping fails.
    pub fn new(tag: &'static str, size: usize) -> Result<Self, CoreError> {
        assert!(size >= 1 << (BIN_START + BINS), "[{tag} JIT] heap too small");
        let region = RwxRegion::new(tag, size)?;
        let mut heap = Self {
            region,
            bins: [ptr::null_mut(); BINS + 1],
            usage: 0,
            tag,
        };
        heap.init_allocator();
        Ok(heap)
    }

    /// Lower size bound of a power-of-two bin.
    fn min_bin_size(bin: usize) -> usize {
        1 << (BIN_START + bin)
    }

    /// Upper size bound (exclusive) of a power-of-two bin.
    fn max_bin_size(bin: usize) -> usize {
        1 << (BIN_START + bin + 1)
    }

    /// Seeds the free lists: every list empty except the oversize bin,
    /// which holds the entire heap as one object.
    fn init_allocator(&mut self) {
        self.bins = [ptr::null_mut(); BINS + 1];
        self.usage = 0;

        let base = self.region.base();
        let size = self.region.size();
        // SAFETY: the region is at least 2 headers + one min-bin object
        // large (asserted in new); the first object starts one header in.
        unsafe {
            let obj = base.add(std::mem::size_of::<usize>());
            *Self::size_ptr(obj) = size - 2 * std::mem::size_of::<usize>();
            *Self::end_ptr(obj) = 0; // marked in-use so add_to_bin accepts it
            self.add_to_bin(obj);
        }
    }

    /// Bytes currently handed out (aligned payload sizes).
    pub fn usage(&self) -> usize {
        self.usage
    }

    /// Total heap capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.region.size()
    }

    // --- header access ---------------------------------------------------

    /// Pointer to an object's leading size header.
    #[inline]
    unsafe fn size_ptr(obj: *mut u8) -> *mut usize {
        obj.cast::<usize>().sub(1)
    }

    /// Pointer to an object's trailing end mark.
    #[inline]
    unsafe fn end_ptr(obj: *mut u8) -> *mut usize {
        let size = *Self::size_ptr(obj);
        debug_assert!(size & (ALIGN - 1) == 0);
        obj.add(size).cast::<usize>()
    }

    /// The object that follows in memory.
    #[inline]
    unsafe fn next_object(obj: *mut u8) -> *mut u8 {
        obj.add(*Self::size_ptr(obj) + 2 * std::mem::size_of::<usize>())
    }

    // --- free-list maintenance -------------------------------------------

    /// Inserts a free object at the head of the bin its size selects, and
    /// marks it free via the end mark.
    unsafe fn add_to_bin(&mut self, obj: *mut u8) {
        let size = *Self::size_ptr(obj);
        assert!(
            size & (ALIGN - 1) == 0 && *Self::end_ptr(obj) == 0,
            "[{} JIT] heap corruption: freeing object with bad headers",
            self.tag
        );

        let mut bin = BINS;
        for i in 0..BINS {
            if size < Self::max_bin_size(i) {
                bin = i;
                break;
            }
        }

        let node = obj.cast::<FreeNode>();
        let head = self.bins[bin];
        debug_assert!(head.is_null() || (*head).prev.is_null());
        (*node).next = head;
        (*node).prev = ptr::null_mut();
        (*node).bin = bin;
        if !head.is_null() {
            (*head).prev = node;
        }
        self.bins[bin] = node;

        *Self::end_ptr(obj) = size;
    }

    /// Unlinks a free object from its bin and marks it in use.
    unsafe fn remove_from_bin(&mut self, obj: *mut u8) {
        assert!(
            *Self::end_ptr(obj) == *Self::size_ptr(obj),
            "[{} JIT] heap corruption: free mark does not match size",
            self.tag
        );

        let node = obj.cast::<FreeNode>();
        let bin = (*node).bin;
        if self.bins[bin] == node {
            self.bins[bin] = (*node).next;
        }
        if !(*node).next.is_null() {
            (*(*node).next).prev = (*node).prev;
        }
        if !(*node).prev.is_null() {
            (*(*node).prev).next = (*node).next;
        }

        *Self::end_ptr(obj) = 0;
    }

    /// Shrinks an in-use object to `size`, splitting the tail off as a new
    /// free object when the remainder is worth tracking.
    unsafe fn shrink_object(&mut self, obj: *mut u8, size: usize) {
        debug_assert!(*Self::end_ptr(obj) == 0);
        debug_assert!(*Self::size_ptr(obj) >= size);

        let tail = *Self::size_ptr(obj) as i64
            - size as i64
            - 2 * std::mem::size_of::<usize>() as i64;

        if tail > Self::min_bin_size(0) as i64 {
            *Self::size_ptr(obj) = size;
            *Self::end_ptr(obj) = 0;
            let next = Self::next_object(obj);
            *Self::size_ptr(next) = tail as usize;
            *Self::end_ptr(next) = 0;
            self.add_to_bin(next);
        }
    }

    /// Finds memory of at least `size` bytes, preferring the smallest
    /// sufficient power-of-two bin, then best-fit in the oversize bin.
    unsafe fn find_memory(&mut self, size: usize) -> Option<*mut u8> {
        let mut first_bin = BINS;
        for i in 0..BINS {
            if Self::min_bin_size(i) >= size {
                first_bin = i;
                break;
            }
        }

        for bin in first_bin..BINS {
            let head = self.bins[bin];
            if !head.is_null() {
                let obj = head.cast::<u8>();
                self.remove_from_bin(obj);
                self.shrink_object(obj, size);
                return Some(obj);
            }
        }

        // Best-fit pass over the oversize bin.
        let mut best: *mut FreeNode = ptr::null_mut();
        let mut best_size = usize::MAX;
        let mut node = self.bins[BINS];
        while !node.is_null() {
            let obj_size = *Self::size_ptr(node.cast::<u8>());
            if obj_size >= size && obj_size < best_size {
                best = node;
                best_size = obj_size;
            }
            node = (*node).next;
        }

        if best.is_null() {
            return None;
        }
        let obj = best.cast::<u8>();
        self.remove_from_bin(obj);
        self.shrink_object(obj, size);
        Some(obj)
    }

    /// Merges `obj` (free) with the following object while it is free.
    /// Returns true when a merge happened.
    unsafe fn merge_fwd(&mut self, obj: *mut u8) -> bool {
        let next = Self::next_object(obj);
        let heap_end = self.region.base().add(self.region.size());
        if next >= heap_end {
            return false;
        }

        if *Self::end_ptr(next) != 0 {
            debug_assert!(*Self::end_ptr(next) == *Self::size_ptr(next));
            let combined =
                *Self::size_ptr(obj) + *Self::size_ptr(next) + 2 * std::mem::size_of::<usize>();
            self.remove_from_bin(obj);
            self.remove_from_bin(next);
            *Self::size_ptr(obj) = combined;
            *Self::end_ptr(obj) = 0;
            self.add_to_bin(obj);
            return true;
        }
        false
    }

    /// Merges `obj` (free) with the preceding object while it is free.
    unsafe fn merge_bwd(&mut self, obj: *mut u8) -> bool {
        let own_size_ptr = Self::size_ptr(obj);
        let prev_end = own_size_ptr.sub(1);
        if prev_end.cast::<u8>() <= self.region.base() {
            return false;
        }

        let prev_size = *prev_end;
        if prev_size != 0 {
            let prev = obj
                .sub(2 * std::mem::size_of::<usize>())
                .sub(prev_size);
            debug_assert!(*Self::size_ptr(prev) == prev_size);
            let combined =
                prev_size + *Self::size_ptr(obj) + 2 * std::mem::size_of::<usize>();
            self.remove_from_bin(obj);
            self.remove_from_bin(prev);
            *Self::size_ptr(prev) = combined;
            *Self::end_ptr(prev) = 0;
            self.add_to_bin(prev);
            return true;
        }
        false
    }

    // --- public interface ------------------------------------------------

    /// Allocates `size` bytes, 16-byte aligned. Returns `None` when no
    /// free object is large enough (callers flush and retry per the
    /// recovery policy).
    pub fn alloc(&mut self, size: usize) -> Option<*mut u8> {
        let size = aligned_size(size)
            .max(Self::min_bin_size(0))
            .max(aligned_size(std::mem::size_of::<FreeNode>()));
        // SAFETY: all object pointers handled below stay inside the
        // region; headers are maintained by this allocator alone.
        let mem = unsafe { self.find_memory(size) };
        if let Some(obj) = mem {
            // SAFETY: obj was just returned in the in-use state.
            self.usage += unsafe { *Self::size_ptr(obj) };
        }
        mem
    }

    /// Frees an object previously returned by [`Self::alloc`], merging
    /// greedily with free neighbors.
    pub fn free(&mut self, obj: *mut u8) {
        if obj.is_null() {
            return;
        }
        // SAFETY: obj came from alloc on this heap; headers are intact or
        // the asserts below fire.
        unsafe {
            let size = *Self::size_ptr(obj);
            assert!(
                size <= self.usage,
                "[{} JIT] heap corruption: freed object larger than usage \
                 ({size} > {})",
                self.tag,
                self.usage
            );
            self.usage -= size;
            self.add_to_bin(obj);
            while self.merge_fwd(obj) {}
            while self.merge_bwd(obj) {}
        }
    }

    /// Reports whether no free object can satisfy a `hint`-byte
    /// allocation. Checked before compiling so the heap is never flushed
    /// mid-compile.
    pub fn is_full(&self, hint: usize) -> bool {
        // SAFETY: list traversal only touches free objects linked by this
        // allocator.
        unsafe {
            for bin in 0..=BINS {
                let mut node = self.bins[bin];
                while !node.is_null() {
                    if *Self::size_ptr(node.cast::<u8>()) >= hint {
                        return false;
                    }
                    node = (*node).next;
                }
            }
        }
        true
    }

    /// Walks every free list and checks the structural invariants:
    /// back-links invert forward links, free marks match sizes, and every
    /// power-of-two bin only holds sizes in its class. Used by tests and
    /// debug assertions; corruption is fatal.
    pub fn check_consistency(&self) {
        // SAFETY: traversal of allocator-owned lists, read-only.
        unsafe {
            for bin in 0..=BINS {
                let mut node = self.bins[bin];
                let mut prev: *mut FreeNode = ptr::null_mut();
                while !node.is_null() {
                    let obj = node.cast::<u8>();
                    let size = *Self::size_ptr(obj);
                    assert_eq!(
                        *Self::end_ptr(obj),
                        size,
                        "[{} JIT] free object end mark mismatch",
                        self.tag
                    );
                    assert_eq!((*node).bin, bin, "[{} JIT] node in wrong bin", self.tag);
                    if bin < BINS {
                        assert!(
                            size < Self::max_bin_size(bin),
                            "[{} JIT] oversize object in class bin",
                            self.tag
                        );
                    } else {
                        assert!(size >= Self::min_bin_size(0));
                    }
                    assert_eq!((*node).prev, prev, "[{} JIT] broken backlink", self.tag);
                    prev = node;
                    node = (*node).next;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whole_heap_starts_free() {
        let heap = JitHeap::new("test", 1 << 20).unwrap();
        assert_eq!(heap.usage(), 0);
        assert!(!heap.is_full(1 << 19));
        heap.check_consistency();
    }

    #[test]
    fn alloc_free_roundtrip_restores_capacity() {
        let mut heap = JitHeap::new("test", 1 << 20).unwrap();
        let a = heap.alloc(1000).unwrap();
        let b = heap.alloc(5000).unwrap();
        let c = heap.alloc(200).unwrap();
        heap.check_consistency();
        heap.free(b);
        heap.check_consistency();
        heap.free(a);
        heap.free(c);
        heap.check_consistency();
        assert_eq!(heap.usage(), 0);
        // After merging everything back, a huge allocation fits again.
        assert!(!heap.is_full((1 << 20) - 64));
    }

    #[test]
    fn allocations_are_aligned_and_disjoint() {
        let mut heap = JitHeap::new("test", 1 << 20).unwrap();
        let mut blocks = Vec::new();
        for i in 1..64usize {
            let p = heap.alloc(i * 48).unwrap();
            assert_eq!(p as usize % ALIGN, 0);
            blocks.push((p, aligned_size(i * 48)));
        }
        for (i, &(p, len)) in blocks.iter().enumerate() {
            for &(q, qlen) in &blocks[i + 1..] {
                let disjoint = (p as usize + len) <= q as usize
                    || (q as usize + qlen) <= p as usize;
                assert!(disjoint, "overlapping allocations");
            }
        }
        for &(p, _) in &blocks {
            heap.free(p);
            heap.check_consistency();
        }
        assert_eq!(heap.usage(), 0);
    }

    #[test]
    fn exhaustion_returns_none() {
        let mut heap = JitHeap::new("test", 1 << 18).unwrap();
        assert!(heap.alloc(1 << 19).is_none());
        // The headers eat 16 bytes, so only one half-heap object fits.
        let a = heap.alloc(1 << 17).unwrap();
        assert!(heap.alloc(1 << 17).is_none());
        heap.free(a);
        assert!(heap.alloc(1 << 17).is_some());
    }
}
