//! Compiled-block indices.
//!
//! EE blocks are keyed by guest PC alone, bucketed per 4 KiB guest page:
//! each mapped page owns a boxed array of 1024 record slots (one per
//! word-aligned PC), so invalidating a page is one array walk. A one-entry
//! page cache short-circuits the common case of consecutive lookups in the
//! same page, and a direct-mapped 32 K-entry pointer cache gives compiled
//! code a single-load fast path.
//!
//! VU blocks carry their pipeline context in the key: the same guest PC
//! reached with a different predecessor, program, or pipeline snapshot is
//! a different block.

use std::collections::HashMap;

use tracing::trace;

use crate::heap::JitHeap;

/// Number of block slots per EE guest page (4096 bytes / 4-byte words).
pub const EE_PAGE_SLOTS: usize = 1024;

/// Entries in the direct-mapped fast lookup cache.
pub const LOOKUP_CACHE_SLOTS: usize = 0x8000;

/// One compiled EE block.
///
/// `repr(C)`: the dispatcher reads `pc` and `code_start` by constant
/// offset. A slot with a null `literals_start` is empty.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct EeBlockRecord {
    /// Entry point of the generated code.
    pub code_start: *const u8,
    /// One past the last generated byte.
    pub code_end: *const u8,
    /// Start of the literal pool; also the heap pointer to free.
    pub literals_start: *mut u8,
    /// Guest PC this block was compiled for.
    pub pc: u32,
}

impl EeBlockRecord {
    const EMPTY: Self = Self {
        code_start: std::ptr::null(),
        code_end: std::ptr::null(),
        literals_start: std::ptr::null_mut(),
        pc: 0,
    };

    /// True when the slot holds a compiled block.
    pub fn present(&self) -> bool {
        !self.literals_start.is_null()
    }
}

/// EE block index: page map, page cache, and fast lookup cache.
#[derive(Debug)]
pub struct EeBlockIndex {
    pages: HashMap<u32, Box<[EeBlockRecord; EE_PAGE_SLOTS]>>,
    /// (page number, array base) of the most recent lookup. The pointer
    /// targets the boxed array, which does not move while the entry lives.
    page_cache: Option<(u32, *mut EeBlockRecord)>,
    /// Direct-mapped cache indexed by `(pc >> 2) & 0x7FFF`, holding
    /// pointers to records (or null). Read inline by generated code.
    lookup_cache: Box<[*const EeBlockRecord; LOOKUP_CACHE_SLOTS]>,
    page_lookups: u64,
    cached_page_lookups: u64,
}

impl Default for EeBlockIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl EeBlockIndex {
    /// Creates an empty index.
    pub fn new() -> Self {
        Self {
            pages: HashMap::new(),
            page_cache: None,
            lookup_cache: vec![std::ptr::null(); LOOKUP_CACHE_SLOTS]
                .into_boxed_slice()
                .try_into()
                .unwrap_or_else(|_| unreachable!()),
            page_lookups: 0,
            cached_page_lookups: 0,
        }
    }

    /// Base pointer of the fast lookup cache, loaded into a host register
    /// by the prologue block.
    pub fn lookup_cache_ptr(&mut self) -> *mut *const EeBlockRecord {
        self.lookup_cache.as_mut_ptr()
    }

    /// Fast-lookup slot index for a PC.
    pub fn lookup_slot(pc: u32) -> usize {
        ((pc >> 2) & 0x7FFF) as usize
    }

    /// Reads the fast lookup cache (slow-path verification and tests).
    pub fn lookup_cached(&self, pc: u32) -> *const EeBlockRecord {
        self.lookup_cache[Self::lookup_slot(pc)]
    }

    /// Writes a resolved record into the fast lookup cache.
    pub fn write_lookup(&mut self, pc: u32, record: *const EeBlockRecord) {
        self.lookup_cache[Self::lookup_slot(pc)] = record;
    }

    fn page_array(&mut self, page: u32) -> *mut EeBlockRecord {
        self.page_lookups += 1;
        if let Some((cached_page, base)) = self.page_cache {
            if cached_page == page {
                self.cached_page_lookups += 1;
                return base;
            }
        }
        let base = self
            .pages
            .entry(page)
            .or_insert_with(|| Box::new([EeBlockRecord::EMPTY; EE_PAGE_SLOTS]))
            .as_mut_ptr();
        self.page_cache = Some((page, base));
        base
    }

    /// Looks up the block starting at `pc`, or null when none exists.
    pub fn find_block(&mut self, pc: u32) -> *const EeBlockRecord {
        let page = pc >> 12;
        let idx = ((pc & 0xFFF) >> 2) as usize;
        if !self.pages.contains_key(&page) {
            return std::ptr::null();
        }
        let base = self.page_array(page);
        // SAFETY: idx < EE_PAGE_SLOTS and base points at a live array.
        let record = unsafe { base.add(idx) };
        // SAFETY: as above.
        if unsafe { (*record).present() } {
            record
        } else {
            std::ptr::null()
        }
    }

    /// Inserts a compiled block record, returning its stable address.
    pub fn insert_block(&mut self, pc: u32, record: EeBlockRecord) -> *const EeBlockRecord {
        let page = pc >> 12;
        let idx = ((pc & 0xFFF) >> 2) as usize;
        let base = self.page_array(page);
        // SAFETY: idx < EE_PAGE_SLOTS; the boxed array is live and stable.
        unsafe {
            let slot = base.add(idx);
            *slot = record;
            slot
        }
    }

    /// Frees every block whose starting PC lies in `page` and drops the
    /// page's array. Blocks in other pages are untouched.
    pub fn invalidate_page(&mut self, page: u32, heap: &mut JitHeap) {
        if let Some(array) = self.pages.remove(&page) {
            let mut freed = 0u32;
            for record in array.iter() {
                if record.present() {
                    heap.free(record.literals_start);
                    freed += 1;
                }
            }
            trace!(page = format_args!("{page:#x}"), freed, "invalidated EE page");
        }
        if matches!(self.page_cache, Some((cached, _)) if cached == page) {
            self.page_cache = None;
        }
        self.scrub_lookup_cache_for_page(page);
    }

    /// Removes lookup-cache entries whose guest PC falls in `page`.
    ///
    /// A stale non-null entry may only reference a still-live record; the
    /// records for this page were just freed, so their 1024 consecutive
    /// slots (mod the cache size) are cleared by position rather than by
    /// dereferencing anything.
    fn scrub_lookup_cache_for_page(&mut self, page: u32) {
        let first = Self::lookup_slot(page << 12);
        for i in 0..EE_PAGE_SLOTS {
            self.lookup_cache[(first + i) % LOOKUP_CACHE_SLOTS] = std::ptr::null();
        }
    }

    /// Frees every block and clears all indices and caches.
    pub fn flush_all(&mut self, heap: &mut JitHeap) {
        for (_, array) in self.pages.drain() {
            for record in array.iter() {
                if record.present() {
                    heap.free(record.literals_start);
                }
            }
        }
        self.page_cache = None;
        self.lookup_cache.fill(std::ptr::null());
        trace!(
            lookups = self.page_lookups,
            cached = self.cached_page_lookups,
            "flushed all EE blocks"
        );
    }
}

/// Key identifying one compiled VU block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VuBlockKey {
    /// Guest PC of the block entry.
    pub pc: u32,
    /// PC of the block that jumped here (`NO_PREV_PC` for a fresh start).
    pub prev_pc: u32,
    /// CRC-32C of the current microprogram.
    pub program: u32,
    /// Pipeline snapshot at entry.
    pub pipeline_state: [u64; 2],
}

/// One compiled VU block.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct VuBlockRecord {
    /// Entry point of the generated code.
    pub code_start: *const u8,
    /// One past the last generated byte.
    pub code_end: *const u8,
    /// Start of the literal pool; also the heap pointer to free.
    pub literals_start: *mut u8,
}

/// VU block index: a hash map over the full context key.
#[derive(Debug, Default)]
pub struct VuBlockIndex {
    blocks: HashMap<VuBlockKey, VuBlockRecord>,
}

impl VuBlockIndex {
    /// Creates an empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks up a block by full key.
    pub fn find_block(&self, key: &VuBlockKey) -> Option<VuBlockRecord> {
        self.blocks.get(key).copied()
    }

    /// Inserts a block record for `key`, freeing any record it replaces.
    pub fn insert_block(&mut self, key: VuBlockKey, record: VuBlockRecord, heap: &mut JitHeap) {
        if let Some(old) = self.blocks.insert(key, record) {
            heap.free(old.literals_start);
        }
    }

    /// Frees every block and clears the index.
    pub fn flush_all(&mut self, heap: &mut JitHeap) {
        for (_, record) in self.blocks.drain() {
            heap.free(record.literals_start);
        }
    }

    /// Number of live blocks (tests and diagnostics).
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// True when no blocks are compiled.
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}
