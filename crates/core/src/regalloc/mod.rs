//! Register allocation tables and policies.
//!
//! Both code generators map guest registers onto the sixteen host GPRs and
//! sixteen SIMD registers through the same table shape: per-entry age,
//! lock, and dirty tracking with oldest-first eviction. The tables here
//! are pure bookkeeping — the code generators own the actual load/spill
//! emission, because only they know where a guest register lives in state
//! memory. This keeps the allocator free of back-pointers into the
//! emitter; it only ever reads and mutates its own entries.

use crate::emitter::{Reg, Xmm};

/// How an allocation intends to use the register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegState {
    /// Value is read only; the entry must be loaded and stays clean.
    Read,
    /// Value is fully overwritten; the initial load is skipped.
    Write,
    /// Read-modify-write.
    ReadWrite,
    /// Transient host register with no guest binding; never written back.
    Scratchpad,
}

impl RegState {
    /// True when the guest value must be loaded before use.
    pub fn needs_load(self) -> bool {
        matches!(self, Self::Read | Self::ReadWrite)
    }

    /// True when the entry becomes dirty.
    pub fn modifies(self) -> bool {
        matches!(self, Self::Write | Self::ReadWrite)
    }
}

/// Which guest register file an entry is bound to.
///
/// The same host register array backs different guest files at different
/// times (an EE GPR held as a 64-bit integer vs. as a full 128-bit value),
/// so the binding must carry the file, not just the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegKind {
    /// No binding (scratchpad).
    Scratch,
    /// EE general purpose register, low 64 bits.
    EeGpr,
    /// EE general purpose register, full 128 bits (SIMD table).
    EeGprExtended,
    /// EE COP1 single-precision register.
    EeFpu,
    /// VU floating register (VF or special).
    VuVf,
    /// VU integer register.
    VuVi,
}

/// One host register's allocation state.
#[derive(Debug, Clone, Copy)]
pub struct AllocEntry {
    /// Entry currently maps a guest register or scratchpad.
    pub used: bool,
    /// Entry may not be evicted or reallocated.
    pub locked: bool,
    /// Host value differs from guest state and must be written back.
    pub modified: bool,
    /// Live value is parked in the stack spill slot, not the register
    /// (set across ABI calls for SIMD entries).
    pub stored: bool,
    /// Allocations since last use; eviction prefers the oldest.
    pub age: u16,
    /// Bound guest register index.
    pub guest: u16,
    /// Bound guest register file.
    pub kind: RegKind,
    /// Per-lane dirty mask for values that may exceed guest float limits.
    pub needs_clamping: u8,
}

impl AllocEntry {
    const FREE: Self = Self {
        used: false,
        locked: false,
        modified: false,
        stored: false,
        age: 0,
        guest: 0,
        kind: RegKind::Scratch,
        needs_clamping: 0,
    };

    /// True when this entry binds `guest` in file `kind`.
    pub fn binds(&self, guest: u16, kind: RegKind) -> bool {
        self.used && self.guest == guest && self.kind == kind
    }
}

/// The two sixteen-entry allocation tables.
#[derive(Debug)]
pub struct RegFile {
    /// GPR table, indexed by host register encoding.
    pub int: [AllocEntry; 16],
    /// SIMD table, indexed by host register encoding.
    pub xmm: [AllocEntry; 16],
}

impl Default for RegFile {
    fn default() -> Self {
        Self::new()
    }
}

impl RegFile {
    /// Creates a file with every entry free and unlocked.
    pub fn new() -> Self {
        Self {
            int: [AllocEntry::FREE; 16],
            xmm: [AllocEntry::FREE; 16],
        }
    }

    /// Frees every entry, keeping locks.
    pub fn clear_bindings(&mut self) {
        for entry in self.int.iter_mut().chain(self.xmm.iter_mut()) {
            entry.used = false;
            entry.modified = false;
            entry.stored = false;
            entry.age = 0;
            entry.needs_clamping = 0;
        }
    }

    /// Locks a set of host GPRs (reserved registers).
    pub fn lock_int(&mut self, regs: &[Reg]) {
        for &reg in regs {
            self.int[reg.idx() as usize].locked = true;
        }
    }

    /// Locks a set of host SIMD registers.
    pub fn lock_xmm(&mut self, regs: &[Xmm]) {
        for &reg in regs {
            self.xmm[reg.idx() as usize].locked = true;
        }
    }

    /// Finds the host GPR currently binding `guest`/`kind`.
    pub fn find_int(&self, guest: u16, kind: RegKind) -> Option<Reg> {
        self.int
            .iter()
            .position(|e| !e.locked && e.binds(guest, kind))
            .map(Reg::from_idx)
    }

    /// Finds the host SIMD register currently binding `guest`/`kind`.
    pub fn find_xmm(&self, guest: u16, kind: RegKind) -> Option<Xmm> {
        self.xmm
            .iter()
            .position(|e| !e.locked && e.binds(guest, kind))
            .map(Xmm::from_idx)
    }

    /// Ages every live entry by one allocation.
    pub fn age_int(&mut self) {
        for entry in &mut self.int {
            if entry.used {
                entry.age += 1;
            }
        }
    }

    /// Ages every live SIMD entry by one allocation.
    pub fn age_xmm(&mut self) {
        for entry in &mut self.xmm {
            if entry.used {
                entry.age += 1;
            }
        }
    }
}

/// Oldest-first victim search over a table, restricted to a preferred
/// order first. Returns the first free preferred register, then any free
/// register, then the oldest unlocked one.
fn search(table: &[AllocEntry; 16], preferred: &[usize]) -> usize {
    for &idx in preferred {
        if !table[idx].locked && !table[idx].used {
            return idx;
        }
    }
    let mut victim = usize::MAX;
    let mut age = 0;
    for (idx, entry) in table.iter().enumerate() {
        if entry.locked {
            continue;
        }
        if !entry.used {
            return idx;
        }
        if entry.age >= age {
            victim = idx;
            age = entry.age;
        }
    }
    assert!(
        victim != usize::MAX,
        "[regalloc] all host registers locked; a lock was leaked"
    );
    victim
}

/// Caller-saved GPRs in preference order for scratchpad allocations: a
/// scratchpad dies before the next ABI call, so burning a volatile
/// register costs nothing.
const SCRATCHPAD_ORDER: [usize; 9] = [0, 1, 2, 7, 6, 8, 9, 10, 11];

/// Callee-saved GPRs in preference order for guest-bound allocations:
/// values that live across ABI calls avoid the spill/reload pair.
const PRIORITY_ORDER: [usize; 6] = [3, 5, 12, 13, 14, 15];

/// Picks a host GPR for a scratchpad allocation.
pub fn search_int_scratchpad(table: &[AllocEntry; 16]) -> Reg {
    Reg::from_idx(search(table, &SCRATCHPAD_ORDER))
}

/// Picks a host GPR for a guest-bound allocation.
pub fn search_int_priority(table: &[AllocEntry; 16]) -> Reg {
    Reg::from_idx(search(table, &PRIORITY_ORDER))
}

/// Picks a host SIMD register (no preference classes; plain oldest-first).
pub fn search_xmm(table: &[AllocEntry; 16]) -> Xmm {
    Xmm::from_idx(search(table, &[]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn search_prefers_free_over_eviction() {
        let mut file = RegFile::new();
        for idx in 0..15 {
            file.int[idx].used = true;
            file.int[idx].age = 10;
        }
        assert_eq!(search_int_priority(&file.int), Reg::R15);
    }

    #[test]
    fn search_evicts_oldest() {
        let mut file = RegFile::new();
        for idx in 0..16 {
            file.int[idx].used = true;
            file.int[idx].age = idx as u16;
        }
        assert_eq!(search_int_priority(&file.int), Reg::R15);
        file.int[15].locked = true;
        assert_eq!(search_int_priority(&file.int), Reg::R14);
    }

    #[test]
    #[should_panic(expected = "all host registers locked")]
    fn fully_locked_table_is_fatal() {
        let mut file = RegFile::new();
        for idx in 0..16 {
            file.int[idx].locked = true;
        }
        let _ = search_int_priority(&file.int);
    }

    #[test]
    fn scratchpad_prefers_volatile() {
        let file = RegFile::new();
        assert_eq!(search_int_scratchpad(&file.int), Reg::Rax);
        let mut file = RegFile::new();
        file.int[0].locked = true;
        file.int[1].used = true;
        assert_eq!(search_int_scratchpad(&file.int), Reg::Rdx);
    }
}
