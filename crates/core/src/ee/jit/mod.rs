//! EE code generator and runtime core.
//!
//! Register conventions inside generated EE code:
//!
//! | register | role |
//! |----------|------|
//! | R15 | guest state base (`EeState`) |
//! | R14 | core base (`EeCore`) |
//! | R13 | fast lookup cache base |
//! | RAX | scratch / ABI results |
//! | RSP | host stack |
//!
//! Every other GPR and all sixteen SIMD registers are allocatable. Blocks
//! open a frame (`push rbp; sub rsp, FRAME_SIZE`) holding the ABI shadow
//! area, sixteen 8-byte integer spill slots, sixteen 16-byte SIMD spill
//! slots, and a 16-byte quadword staging slot; the allocator addresses
//! them by constant offset from RSP.
//!
//! The dispatcher loop is emitted inline at the tail of every block: check
//! the cycle budget, probe the direct-mapped lookup cache, verify the
//! record's PC, and tail-jump into the next block — falling back to the
//! slow path (`ee_exec_block`) that finds or compiles the block and
//! refreshes the cache.

mod alu;
mod branch;
mod cop;
mod fpu;
mod memory;
mod mmi;

use std::mem::offset_of;

use tracing::{debug, warn};

use crate::config::JitConfig;
use crate::emitter::{ConditionCode, Emitter, Reg, Xmm};
use crate::ee::translator::EeTranslator;
use crate::heap::{EeBlockIndex, EeBlockRecord, JitHeap};
use crate::ir::{Block, Instruction, Opcode};
use crate::regalloc::{
    search_int_priority, search_int_scratchpad, search_xmm, RegFile, RegKind, RegState,
};
use crate::state::{EeBus, EeState, EE_REG_HI, EE_REG_HI1, EE_REG_LO, EE_REG_LO1, EE_REG_SA};

/// Block stack frame size: 32 B ABI shadow + 16 integer spill slots +
/// 16 SIMD spill slots + quadword staging + alignment padding.
pub(crate) const FRAME_SIZE: u32 = 0x1B8;
/// Frame offset of the integer spill slots.
pub(crate) const INT_SPILL: i32 = 0x20;
/// Frame offset of the SIMD spill slots.
pub(crate) const XMM_SPILL: i32 = 0xA0;
/// Frame offset of the 128-bit load/store staging slot.
pub(crate) const QW_STAGING: i32 = 0x1A0;

/// Sentinel PC the prologue block is indexed under.
const PROLOGUE_PC: u32 = 0xFFFF_FFFF;

/// MXCSR for EE float semantics: denormals-as-zero, flush-to-zero,
/// round-toward-zero, all exceptions masked.
const EE_MXCSR: u32 = 0xFFC0;

/// Entry point of the prologue block.
type EePrologueFn =
    unsafe extern "C" fn(*mut EeCore, *mut EeState, *mut *const EeBlockRecord);

/// Run-scratch fields written by generated code through the core base
/// register.
#[repr(C)]
#[derive(Debug, Default)]
pub struct EeRunScratch {
    /// Cycles retired by the most recent block, returned by `run`.
    pub cycle_count: u16,
    _pad: u16,
    /// Host MXCSR saved around guest execution.
    pub saved_mxcsr: u32,
    /// Guest MXCSR loaded while guest code runs.
    pub ee_mxcsr: u32,
}

/// The EE recompiler core: JIT heap, block index, translator, code
/// generator state, and the host interface.
#[derive(Debug)]
pub struct EeCore {
    pub(crate) heap: JitHeap,
    pub(crate) index: EeBlockIndex,
    pub(crate) asm: Emitter,
    pub(crate) regs: RegFile,
    pub(crate) translator: EeTranslator,
    pub(crate) bus: EeBus,
    pub(crate) rt: EeRunScratch,
    config: JitConfig,
    prologue: Option<EePrologueFn>,
    pub(crate) likely_branch: bool,
    pub(crate) abi_int_count: usize,
    pub(crate) saved_int_regs: Vec<Reg>,
}

// --- guest state offsets -------------------------------------------------

pub(crate) fn off_pc() -> i32 {
    offset_of!(EeState, pc) as i32
}
pub(crate) fn off_cycles_to_run() -> i32 {
    offset_of!(EeState, cycles_to_run) as i32
}
pub(crate) fn off_cycle_count() -> i32 {
    offset_of!(EeState, cycle_count) as i32
}
pub(crate) fn off_branch_on() -> i32 {
    offset_of!(EeState, branch_on) as i32
}
pub(crate) fn off_fpu_condition() -> i32 {
    offset_of!(EeState, fpu_condition) as i32
}
pub(crate) fn off_fpu_flag_u() -> i32 {
    offset_of!(EeState, fpu_flag_u) as i32
}
pub(crate) fn off_fpu_flag_o() -> i32 {
    offset_of!(EeState, fpu_flag_o) as i32
}

/// Offset of a guest GPR (or LO/HI/SA special) inside `EeState`.
pub(crate) fn gpr_offset(reg: u16) -> i32 {
    if reg < 32 {
        return (offset_of!(EeState, gpr) + usize::from(reg) * 16) as i32;
    }
    let off = match reg {
        EE_REG_LO => offset_of!(EeState, lo),
        EE_REG_LO1 => offset_of!(EeState, lo1),
        EE_REG_HI => offset_of!(EeState, hi),
        EE_REG_HI1 => offset_of!(EeState, hi1),
        EE_REG_SA => offset_of!(EeState, sa),
        _ => panic!("[EE] gpr_offset: unrecognized register {reg}"),
    };
    off as i32
}

/// Offset of a COP1 register (or the accumulator) inside `EeState`.
pub(crate) fn fpu_offset(reg: u16) -> i32 {
    if reg < 32 {
        (offset_of!(EeState, fpu_gpr) + usize::from(reg) * 4) as i32
    } else {
        offset_of!(EeState, fpu_acc) as i32
    }
}

/// Slow-path block finder called from the dispatcher.
///
/// Tests (and clears) the guest page's TLB-modified flag, invalidating the
/// page's blocks if set; looks the block up; compiles it if missing; and
/// refreshes the fast lookup cache.
///
/// # Safety
///
/// Both pointers must be the live core/state pair the prologue was entered
/// with; called only from generated code on the owning thread.
pub(crate) unsafe extern "C" fn ee_exec_block(
    core: *mut EeCore,
    state: *mut EeState,
) -> *const u8 {
    (*core).exec_block(&mut *state)
}

impl EeCore {
    /// Creates an EE core over the given host interface.
    ///
    /// # Errors
    ///
    /// Fails when the RWX region cannot be mapped.
    pub fn new(bus: EeBus, config: JitConfig) -> Result<Self, crate::common::CoreError> {
        let mut core = Self {
            heap: JitHeap::new("EE", config.heap_size)?,
            index: EeBlockIndex::new(),
            asm: Emitter::new("EE"),
            regs: RegFile::new(),
            translator: EeTranslator::new(),
            bus,
            rt: EeRunScratch {
                ee_mxcsr: EE_MXCSR,
                ..EeRunScratch::default()
            },
            config,
            prologue: None,
            likely_branch: false,
            abi_int_count: 0,
            saved_int_regs: Vec::new(),
        };
        core.reset(true);
        Ok(core)
    }

    /// Resets allocator state; optionally flushes the JIT heap and forces
    /// a prologue rebuild.
    pub fn reset(&mut self, clear_cache: bool) {
        self.rt.ee_mxcsr = EE_MXCSR;
        self.abi_int_count = 0;
        self.saved_int_regs.clear();
        self.regs = RegFile::new();
        self.regs.lock_int(&[Reg::Rsp, Reg::Rax, Reg::R13, Reg::R14, Reg::R15]);

        if clear_cache {
            self.index.flush_all(&mut self.heap);
            self.prologue = None;
        }
    }

    /// Executes guest code until `cycles_to_run` is exhausted or a stall
    /// condition exits early. Returns the cycles retired by the last block.
    pub fn run(&mut self, state: &mut EeState) -> u16 {
        if self.heap.is_full(self.config.high_water) {
            warn!("EE JIT heap under high-water mark; flushing");
            self.index.flush_all(&mut self.heap);
            self.prologue = None;
        }
        if self.prologue.is_none() {
            self.prologue = Some(self.create_prologue_block());
        }
        let prologue = self.prologue.unwrap_or_else(|| unreachable!());
        let cache = self.index.lookup_cache_ptr();
        // SAFETY: the prologue block was generated for exactly this
        // core/state calling convention and the heap outlives the call.
        unsafe {
            prologue(self, state, cache);
        }
        self.rt.cycle_count
    }

    /// Slow-path find-or-compile for the state's current PC.
    ///
    /// Tests (and clears) the guest page's TLB-modified flag, invalidating
    /// the page's blocks if set; compiles the block when missing; and
    /// refreshes the fast lookup cache. Called by the dispatcher's slow
    /// path and usable directly by embedders that manage invalidation.
    pub fn exec_block(&mut self, state: &mut EeState) -> *const u8 {
        let page = state.pc >> 12;
        if state.tlb_modified(page) {
            self.index.invalidate_page(page, &mut self.heap);
            state.clear_tlb_modified(page);
        }

        let mut record = self.index.find_block(state.pc);
        if record.is_null() {
            debug!(pc = format_args!("{:#010x}", state.pc), "EE block miss; compiling");
            let block = {
                let mut translator = std::mem::take(&mut self.translator);
                let block = translator.translate(state, &self.bus);
                self.translator = translator;
                block
            };
            record = self.recompile_block(state.pc, block);
        }
        self.index.write_lookup(state.pc, record);
        // SAFETY: the record was just resolved and points at a live block.
        unsafe { (*record).code_start }
    }

    /// True when a compiled block exists for `pc` (diagnostics).
    pub fn has_block(&mut self, pc: u32) -> bool {
        !self.index.find_block(pc).is_null()
    }

    /// True when the fast lookup cache slot for `pc` holds a record whose
    /// guest PC matches (diagnostics).
    pub fn lookup_cache_hit(&mut self, pc: u32) -> bool {
        let record = self.index.lookup_cached(pc);
        // SAFETY: non-null cache entries reference live records.
        !record.is_null() && unsafe { (*record).pc } == pc
    }

    // --- prologue / dispatcher ------------------------------------------

    fn create_prologue_block(&mut self) -> EePrologueFn {
        self.asm.block.clear();

        // Callee-saved registers of the host ABI.
        self.asm.push(Reg::Rbx);
        self.asm.push(Reg::R12);
        self.asm.push(Reg::R13);
        self.asm.push(Reg::R14);
        self.asm.push(Reg::R15);

        // Pin the core, state, and lookup cache in R14/R15/R13.
        self.asm.mov64_reg(Reg::Rdi, Reg::R14);
        self.asm.mov64_reg(Reg::Rsi, Reg::R15);
        self.asm.mov64_reg(Reg::Rdx, Reg::R13);

        // Denormals-as-zero, flush-to-zero, round-toward-zero while guest
        // code runs.
        let saved = offset_of!(EeCore, rt) as i32 + offset_of!(EeRunScratch, saved_mxcsr) as i32;
        let guest = offset_of!(EeCore, rt) as i32 + offset_of!(EeRunScratch, ee_mxcsr) as i32;
        self.asm.stmxcsr(Reg::R14, saved);
        self.asm.ldmxcsr(Reg::R14, guest);

        self.emit_dispatcher();

        let record = self.insert_block(PROLOGUE_PC);
        // SAFETY: the bytes at code_start are the function emitted above.
        unsafe { std::mem::transmute::<*const u8, EePrologueFn>((*record).code_start) }
    }

    /// Emits the dispatcher: budget check, lookup-cache probe with PC
    /// guard, tail jump, slow-path call loop, and the exit epilogue.
    pub(crate) fn emit_dispatcher(&mut self) {
        self.asm.cmp32_imm_mem(0, Reg::R15, off_cycles_to_run());
        let exit = self.asm.jcc_near_deferred(ConditionCode::Le);

        // record = lookup_cache[(pc >> 2) & 0x7FFF]
        self.asm.mov32_from_mem(Reg::R15, Reg::Rcx, off_pc());
        self.asm.mov32_reg(Reg::Rcx, Reg::Rax);
        self.asm.and32_reg_imm(0x7FFF << 2, Reg::Rax);
        // Each cache entry is 8 bytes; (pc & 0x1FFFC) * 2 is the byte
        // offset of slot (pc >> 2) & 0x7FFF.
        self.asm.lea64_reg(Reg::R13, Reg::Rax, Reg::Rax, 0, 1);
        self.asm.mov64_from_mem(Reg::Rax, Reg::Rax, 0);

        self.asm.test64_reg(Reg::Rax, Reg::Rax);
        let slow1 = self.asm.jcc_near_deferred(ConditionCode::E);

        // Guard: the slot's record must be for the current PC.
        self.asm
            .mov32_from_mem(Reg::Rax, Reg::Rdx, offset_of!(EeBlockRecord, pc) as i32);
        self.asm.cmp32_reg(Reg::Rcx, Reg::Rdx);
        let slow2 = self.asm.jcc_near_deferred(ConditionCode::Ne);

        self.asm
            .mov64_from_mem(Reg::Rax, Reg::Rax, offset_of!(EeBlockRecord, code_start) as i32);
        self.asm.jmp_indir(Reg::Rax);

        // Slow path: find or compile, then tail-jump.
        self.asm.set_jump_dest(slow1);
        self.asm.set_jump_dest(slow2);
        self.asm.mov64_reg(Reg::R14, Reg::Rdi);
        self.asm.mov64_reg(Reg::R15, Reg::Rsi);
        self.asm.load_addr(ee_exec_block as usize as u64, Reg::Rax);
        self.asm.call_indir(Reg::Rax);
        self.asm.jmp_indir(Reg::Rax);

        self.asm.set_jump_dest(exit);
        self.emit_epilogue();
    }

    fn emit_epilogue(&mut self) {
        let saved = offset_of!(EeCore, rt) as i32 + offset_of!(EeRunScratch, saved_mxcsr) as i32;
        self.asm.ldmxcsr(Reg::R14, saved);
        self.asm.pop(Reg::R15);
        self.asm.pop(Reg::R14);
        self.asm.pop(Reg::R13);
        self.asm.pop(Reg::R12);
        self.asm.pop(Reg::Rbx);
        self.asm.ret();
    }

    // --- block assembly --------------------------------------------------

    /// Lowers an IR block and inserts the generated code into the heap.
    pub(crate) fn recompile_block(&mut self, pc: u32, mut block: Block) -> *const EeBlockRecord {
        self.likely_branch = false;
        self.abi_int_count = 0;
        self.saved_int_regs.clear();
        self.asm.block.clear();

        self.asm.push(Reg::Rbp);
        self.asm.mov64_reg(Reg::Rsp, Reg::Rbp);
        self.asm.sub64_reg_imm(FRAME_SIZE, Reg::Rsp);

        let cycles = u64::from(block.cycle_count());
        while let Some(instr) = block.next_instr() {
            self.emit_instruction(&instr);
            if self.likely_branch {
                break;
            }
        }

        if self.likely_branch {
            self.handle_branch_likely(&mut block, cycles);
        } else {
            self.cleanup_recompiler(true, true, cycles);
        }

        self.insert_block(pc)
    }

    /// Copies the scratch block into the heap and records it.
    ///
    /// On exhaustion: flush everything, rebuild the prologue (which, with
    /// an empty heap, lands byte-identical at its old address — required,
    /// because the dispatcher that called into the compiler will return
    /// into it), and retry once. A second failure means the block is
    /// larger than the whole heap, which is fatal.
    fn insert_block(&mut self, pc: u32) -> *const EeBlockRecord {
        let code_len = self.asm.block.code_len();
        let literals_len = self.asm.block.literals_len();
        let total = code_len + literals_len;
        assert!(total > 0, "[EE JIT] inserting empty block at {pc:#010x}");

        let mut dest = self.heap.alloc(total);
        if dest.is_none() {
            warn!("EE JIT heap full; flushing all blocks");
            let stashed: Vec<u8> = self.asm.block.occupied().to_vec();
            self.index.flush_all(&mut self.heap);
            if pc != PROLOGUE_PC {
                self.prologue = Some(self.create_prologue_block());
            }
            self.restore_scratch(&stashed, literals_len);
            dest = self.heap.alloc(total);
        }

        let Some(dest) = dest else {
            panic!(
                "[EE JIT] heap exhausted at {pc:#010x}: block of {total} bytes \
                 cannot fit ({}/{} bytes in use)",
                self.heap.usage(),
                self.heap.capacity()
            );
        };

        // SAFETY: dest points at `total` writable bytes inside the heap.
        unsafe {
            std::ptr::copy_nonoverlapping(self.asm.block.occupied().as_ptr(), dest, total);
        }

        let record = EeBlockRecord {
            literals_start: dest,
            // SAFETY: in-bounds offsets of the fresh allocation.
            code_start: unsafe { dest.add(literals_len) },
            code_end: unsafe { dest.add(total) },
            pc,
        };
        self.index.insert_block(pc, record)
    }

    /// Rebuilds the scratch buffer contents after a mid-insert flush.
    fn restore_scratch(&mut self, stashed: &[u8], literals_len: usize) {
        self.asm.block.clear();
        if literals_len > 0 {
            // Reserve the literal area byte-for-byte.
            let mut remaining = literals_len;
            while remaining > 0 {
                let chunk = remaining.min(16);
                let mut lit = [0u8; 16];
                lit[..chunk].copy_from_slice(&stashed[remaining - chunk..remaining]);
                let _ = self.asm.block.emit_literal(&lit);
                remaining -= chunk;
            }
        }
        for &byte in &stashed[literals_len..] {
            self.asm.block.write_u8(byte);
        }
    }

    /// Flushes registers, retires the block's cycles, tears the frame
    /// down, and either re-enters the dispatcher or exits to the host.
    pub(crate) fn cleanup_recompiler(&mut self, clear_regs: bool, dispatcher: bool, cycles: u64) {
        let cycles = cycles.max(1);
        self.flush_regs();
        if clear_regs {
            self.regs.clear_bindings();
        }

        self.asm
            .sub32_mem_imm(cycles as u32, Reg::R15, off_cycles_to_run());

        self.asm.mov64_from_mem(Reg::R15, Reg::Rax, off_cycle_count());
        self.asm.add64_reg_imm(cycles as u32, Reg::Rax);
        self.asm.mov64_to_mem(Reg::Rax, Reg::R15, off_cycle_count());

        let rt_cycles =
            offset_of!(EeCore, rt) as i32 + offset_of!(EeRunScratch, cycle_count) as i32;
        self.asm.mov16_imm_mem(cycles as u16, Reg::R14, rt_cycles);

        self.asm.add64_reg_imm(FRAME_SIZE, Reg::Rsp);
        self.asm.pop(Reg::Rbp);

        if dispatcher {
            self.emit_dispatcher();
        } else {
            self.emit_epilogue();
        }
    }

    /// Conditionally skips the delay slot of a likely branch: when the
    /// branch failed, the slot's side effects must not happen.
    fn handle_branch_likely(&mut self, block: &mut Block, cycles: u64) {
        self.asm.mov8_from_mem(Reg::R15, Reg::Rax, off_branch_on());
        self.asm.test8_reg(Reg::Rax, Reg::Rax);

        // Flushing emits only MOVs, which preserve the flags the TEST set.
        self.flush_regs();
        self.regs.clear_bindings();

        let taken = self.asm.jcc_near_deferred(ConditionCode::Ne);
        self.cleanup_recompiler(false, true, cycles);

        self.asm.set_jump_dest(taken);
        while let Some(instr) = block.next_instr() {
            self.emit_instruction(&instr);
        }
        self.cleanup_recompiler(true, true, cycles);
    }

    // --- register allocation ---------------------------------------------

    /// Allocates a host GPR for a guest register (or a scratchpad when
    /// `state` is `Scratchpad`).
    pub(crate) fn alloc_int(
        &mut self,
        guest: u16,
        kind: RegKind,
        state: RegState,
        want: Option<Reg>,
    ) -> Reg {
        if state == RegState::Scratchpad {
            let dest = want.unwrap_or_else(|| search_int_scratchpad(&self.regs.int));
            assert!(
                !self.regs.int[dest.idx() as usize].locked,
                "[EE JIT] alloc scratchpad: attempted to allocate locked register {dest:?}"
            );
            self.flush_int_reg(dest);
            let entry = &mut self.regs.int[dest.idx() as usize];
            entry.used = true;
            entry.modified = false;
            entry.stored = false;
            entry.age = 0;
            entry.guest = 0;
            entry.kind = RegKind::Scratch;
            return dest;
        }

        let is_zero = guest == 0 && kind == RegKind::EeGpr;

        // Already mapped?
        if let Some(found) = self.regs.find_int(guest, kind) {
            if want.is_none() || want == Some(found) {
                self.regs.age_int();
                let entry = &mut self.regs.int[found.idx() as usize];
                entry.age = 0;
                if state.modifies() && !is_zero {
                    entry.modified = true;
                }
                return found;
            }
        }

        let dest = want.unwrap_or_else(|| search_int_priority(&self.regs.int));
        assert!(
            !self.regs.int[dest.idx() as usize].locked,
            "[EE JIT] alloc int: attempted to allocate locked register {dest:?}"
        );
        self.regs.age_int();

        // The 64-bit and 128-bit views of a GPR must not alias two host
        // registers; retire the wide view first.
        if kind == RegKind::EeGpr {
            if let Some(wide) = self.regs.find_xmm(guest, RegKind::EeGprExtended) {
                self.flush_xmm_reg(wide);
                self.regs.xmm[wide.idx() as usize].used = false;
            }
        }

        self.flush_int_reg(dest);
        self.regs.int[dest.idx() as usize].used = false;

        if state.needs_load() {
            if is_zero {
                // The zero register is cheaper to synthesize than to load.
                self.asm.xor32_reg(dest, dest);
            } else if let Some(other) = self.regs.find_int(guest, kind) {
                self.asm.mov64_reg(other, dest);
            } else {
                self.asm.mov64_from_mem(Reg::R15, dest, gpr_offset(guest));
            }
        }

        let entry = &mut self.regs.int[dest.idx() as usize];
        entry.used = true;
        entry.stored = false;
        entry.modified = state.modifies() && !is_zero;
        entry.guest = guest;
        entry.kind = kind;
        entry.age = 0;
        dest
    }

    /// Allocates and locks a host GPR.
    pub(crate) fn lalloc_int(
        &mut self,
        guest: u16,
        kind: RegKind,
        state: RegState,
        want: Option<Reg>,
    ) -> Reg {
        let reg = self.alloc_int(guest, kind, state, want);
        self.regs.int[reg.idx() as usize].locked = true;
        reg
    }

    /// Unlocks, flushes, and frees a host GPR.
    pub(crate) fn free_int(&mut self, reg: Reg) {
        self.regs.int[reg.idx() as usize].locked = false;
        self.flush_int_reg(reg);
        let entry = &mut self.regs.int[reg.idx() as usize];
        entry.used = false;
        entry.stored = false;
    }

    /// Allocates a host SIMD register for a COP1 or 128-bit GPR value.
    pub(crate) fn alloc_xmm(
        &mut self,
        guest: u16,
        kind: RegKind,
        state: RegState,
        want: Option<Xmm>,
    ) -> Xmm {
        if state == RegState::Scratchpad {
            let dest = want.unwrap_or_else(|| search_xmm(&self.regs.xmm));
            self.flush_xmm_reg(dest);
            let entry = &mut self.regs.xmm[dest.idx() as usize];
            entry.used = true;
            entry.modified = false;
            entry.stored = false;
            entry.age = 0;
            entry.guest = 0;
            entry.kind = RegKind::Scratch;
            return dest;
        }

        let is_zero = guest == 0 && kind == RegKind::EeGprExtended;

        if let Some(found) = self.regs.find_xmm(guest, kind) {
            if want.is_none() || want == Some(found) {
                self.regs.age_xmm();
                if self.regs.xmm[found.idx() as usize].stored {
                    self.asm.movaps_from_mem(
                        Reg::Rsp,
                        found,
                        XMM_SPILL + i32::from(found.idx()) * 16,
                    );
                    self.regs.xmm[found.idx() as usize].stored = false;
                }
                let entry = &mut self.regs.xmm[found.idx() as usize];
                entry.age = 0;
                if state.modifies() && !is_zero {
                    entry.modified = true;
                }
                return found;
            }
        }

        let dest = want.unwrap_or_else(|| search_xmm(&self.regs.xmm));
        assert!(
            !self.regs.xmm[dest.idx() as usize].locked,
            "[EE JIT] alloc xmm: attempted to allocate locked register {dest:?}"
        );
        self.regs.age_xmm();

        if kind == RegKind::EeGprExtended {
            if let Some(narrow) = self.regs.find_int(guest, RegKind::EeGpr) {
                self.flush_int_reg(narrow);
                self.regs.int[narrow.idx() as usize].used = false;
            }
        }

        self.flush_xmm_reg(dest);
        self.regs.xmm[dest.idx() as usize].used = false;

        if state.needs_load() {
            match kind {
                RegKind::EeFpu => self.asm.movd_from_mem(Reg::R15, dest, fpu_offset(guest)),
                RegKind::EeGprExtended => {
                    self.asm.movaps_from_mem(Reg::R15, dest, gpr_offset(guest));
                }
                _ => panic!("[EE JIT] alloc xmm: invalid kind {kind:?}"),
            }
        }

        let entry = &mut self.regs.xmm[dest.idx() as usize];
        entry.used = true;
        entry.stored = false;
        entry.modified = state.modifies() && !is_zero;
        entry.guest = guest;
        entry.kind = kind;
        entry.age = 0;
        dest
    }

    /// Allocates and locks a host SIMD register.
    pub(crate) fn lalloc_xmm(
        &mut self,
        guest: u16,
        kind: RegKind,
        state: RegState,
        want: Option<Xmm>,
    ) -> Xmm {
        let reg = self.alloc_xmm(guest, kind, state, want);
        self.regs.xmm[reg.idx() as usize].locked = true;
        reg
    }

    /// Unlocks, flushes, and frees a host SIMD register.
    pub(crate) fn free_xmm(&mut self, reg: Xmm) {
        self.regs.xmm[reg.idx() as usize].locked = false;
        self.flush_xmm_reg(reg);
        let entry = &mut self.regs.xmm[reg.idx() as usize];
        entry.used = false;
        entry.stored = false;
    }

    /// Writes a dirty GPR entry back to guest state.
    pub(crate) fn flush_int_reg(&mut self, reg: Reg) {
        let entry = self.regs.int[reg.idx() as usize];
        if entry.used && entry.modified && entry.kind == RegKind::EeGpr && entry.guest != 0 {
            self.asm.mov64_to_mem(reg, Reg::R15, gpr_offset(entry.guest));
        }
    }

    /// Writes a dirty SIMD entry back to guest state, reloading it from
    /// the spill slot first when an ABI call parked it there.
    pub(crate) fn flush_xmm_reg(&mut self, reg: Xmm) {
        let entry = self.regs.xmm[reg.idx() as usize];
        if entry.used && entry.modified {
            if entry.stored {
                self.asm
                    .movaps_from_mem(Reg::Rsp, reg, XMM_SPILL + i32::from(reg.idx()) * 16);
                self.regs.xmm[reg.idx() as usize].stored = false;
            }
            match entry.kind {
                RegKind::EeFpu => {
                    self.asm.movd_to_mem(reg, Reg::R15, fpu_offset(entry.guest));
                }
                RegKind::EeGprExtended if entry.guest != 0 => {
                    self.asm
                        .movaps_to_mem(reg, Reg::R15, gpr_offset(entry.guest));
                }
                _ => {}
            }
        }
    }

    /// Writes back every dirty entry. Register bindings survive.
    pub(crate) fn flush_regs(&mut self) {
        for idx in 0..16 {
            self.flush_xmm_reg(Xmm::from_idx(idx));
            self.flush_int_reg(Reg::from_idx(idx));
        }
    }

    /// Flushes everything and clears the binding tables (used before
    /// nondeterministic control flow like interpreter calls).
    pub(crate) fn flush_and_clear(&mut self) {
        self.flush_regs();
        self.regs.clear_bindings();
    }

    // --- ABI calls --------------------------------------------------------

    pub(crate) const ABI_ARGS: [Reg; 6] =
        [Reg::Rdi, Reg::Rsi, Reg::Rdx, Reg::Rcx, Reg::R8, Reg::R9];
    const ABI_VOLATILE: [Reg; 8] = [
        Reg::Rdi,
        Reg::Rsi,
        Reg::Rcx,
        Reg::Rdx,
        Reg::R8,
        Reg::R9,
        Reg::R10,
        Reg::R11,
    ];

    fn abi_save_arg(&mut self, arg: Reg) {
        if self.regs.int[arg.idx() as usize].used {
            self.saved_int_regs.push(arg);
            self.asm
                .mov64_to_mem(arg, Reg::Rsp, INT_SPILL + i32::from(arg.idx()) * 8);
        }
        self.regs.int[arg.idx() as usize].used = false;
        self.regs.int[arg.idx() as usize].locked = true;
    }

    /// Stages an immediate (usually a pointer) as the next ABI argument.
    pub(crate) fn prepare_abi_imm(&mut self, value: u64) {
        let arg = Self::ABI_ARGS[self.abi_int_count];
        self.abi_save_arg(arg);
        self.asm.load_addr(value, arg);
        self.abi_int_count += 1;
    }

    /// Stages a register (plus optional address offset via LEA) as the
    /// next ABI argument.
    pub(crate) fn prepare_abi_reg(&mut self, reg: Reg, offset: i32) {
        let arg = Self::ABI_ARGS[self.abi_int_count];
        self.abi_save_arg(arg);
        if self.saved_int_regs.contains(&reg) {
            // The source register was itself parked by an earlier argument;
            // its live value is in the spill slot, not the register.
            self.asm
                .mov64_from_mem(Reg::Rsp, arg, INT_SPILL + i32::from(reg.idx()) * 8);
            if offset != 0 {
                self.asm.add64_reg_imm(offset as u32, arg);
            }
        } else if reg != arg {
            if offset != 0 {
                self.asm.lea64_m(reg, arg, offset);
            } else {
                self.asm.mov64_reg(reg, arg);
            }
        } else if offset != 0 {
            self.asm.add64_reg_imm(offset as u32, arg);
        }
        self.abi_int_count += 1;
    }

    /// Emits a call to a host function: parks live caller-saved registers
    /// in the frame's spill slots, calls, and restores.
    pub(crate) fn call_abi_func(&mut self, addr: u64) {
        for i in 0..self.abi_int_count {
            self.regs.int[Self::ABI_ARGS[i].idx() as usize].locked = false;
        }

        // Live SIMD values go to the stack; they are reloaded lazily on
        // next use (the `stored` flag).
        for idx in 0..16u8 {
            let entry = self.regs.xmm[idx as usize];
            if entry.used && !entry.stored {
                self.asm.movaps_to_mem(
                    Xmm::from_idx(idx as usize),
                    Reg::Rsp,
                    XMM_SPILL + i32::from(idx) * 16,
                );
                self.regs.xmm[idx as usize].stored = true;
            }
        }

        for reg in Self::ABI_VOLATILE {
            if self.regs.int[reg.idx() as usize].used {
                self.asm
                    .mov64_to_mem(reg, Reg::Rsp, INT_SPILL + i32::from(reg.idx()) * 8);
            }
        }

        self.asm.load_addr(addr, Reg::Rax);
        self.asm.call_indir(Reg::Rax);

        for reg in Self::ABI_VOLATILE {
            if self.regs.int[reg.idx() as usize].used {
                self.asm
                    .mov64_from_mem(Reg::Rsp, reg, INT_SPILL + i32::from(reg.idx()) * 8);
            }
        }
        let saved = std::mem::take(&mut self.saved_int_regs);
        for reg in saved {
            self.asm
                .mov64_from_mem(Reg::Rsp, reg, INT_SPILL + i32::from(reg.idx()) * 8);
            self.regs.int[reg.idx() as usize].used = true;
        }
        self.abi_int_count = 0;
    }

    // --- lowering dispatch -----------------------------------------------

    /// Lowers one IR instruction.
    pub(crate) fn emit_instruction(&mut self, instr: &Instruction) {
        use Opcode as Op;
        match instr.op {
            Op::LoadConst => self.load_const(instr),
            Op::AddWordImm => self.add_word_imm(instr),
            Op::AddWordReg => self.add_word_reg(instr),
            Op::AddDoublewordImm => self.add_doubleword_imm(instr),
            Op::AddDoublewordReg => self.add_doubleword_reg(instr),
            Op::SubWordReg => self.sub_word_reg(instr),
            Op::SubDoublewordReg => self.sub_doubleword_reg(instr),
            Op::AndImm => self.and_imm(instr),
            Op::AndReg => self.and_reg(instr),
            Op::OrImm => self.or_imm(instr),
            Op::OrReg => self.or_reg(instr),
            Op::XorImm => self.xor_imm(instr),
            Op::XorReg => self.xor_reg(instr),
            Op::NorReg => self.nor_reg(instr),
            Op::ClearWordReg | Op::ClearDoublewordReg => self.clear_reg(instr),
            Op::NegateWordReg => self.negate_word_reg(instr),
            Op::NegateDoublewordReg => self.negate_doubleword_reg(instr),
            Op::SetOnLessThan => self.set_on_less_than(instr, ConditionCode::L, false),
            Op::SetOnLessThanUnsigned => self.set_on_less_than(instr, ConditionCode::B, false),
            Op::SetOnLessThanImmediate => self.set_on_less_than(instr, ConditionCode::L, true),
            Op::SetOnLessThanImmediateUnsigned => {
                self.set_on_less_than(instr, ConditionCode::B, true);
            }
            Op::ShiftLeftLogical
            | Op::ShiftRightLogical
            | Op::ShiftRightArithmetic
            | Op::DoublewordShiftLeftLogical
            | Op::DoublewordShiftRightLogical
            | Op::DoublewordShiftRightArithmetic => self.shift_imm(instr),
            Op::ShiftLeftLogicalVariable
            | Op::ShiftRightLogicalVariable
            | Op::ShiftRightArithmeticVariable
            | Op::DoublewordShiftLeftLogicalVariable
            | Op::DoublewordShiftRightLogicalVariable
            | Op::DoublewordShiftRightArithmeticVariable => self.shift_variable(instr),
            Op::MoveConditionalOnZero => self.move_conditional(instr, ConditionCode::E),
            Op::MoveConditionalOnNotZero => self.move_conditional(instr, ConditionCode::Ne),
            Op::MoveFromLoHi | Op::MoveFromLoHi1 | Op::MoveFromSa => self.move_doubleword(instr),
            Op::MoveToLoHi | Op::MoveToLoHi1 | Op::MoveToSa => self.move_doubleword(instr),
            Op::MultiplyWord => self.multiply_word(instr, true, false),
            Op::MultiplyUnsignedWord => self.multiply_word(instr, false, false),
            Op::MultiplyWord1 => self.multiply_word(instr, true, true),
            Op::MultiplyUnsignedWord1 => self.multiply_word(instr, false, true),
            Op::DivideWord => self.divide_word(instr, false),
            Op::DivideWord1 => self.divide_word(instr, true),
            Op::DivideUnsignedWord => self.divide_unsigned_word(instr, false),
            Op::DivideUnsignedWord1 => self.divide_unsigned_word(instr, true),
            Op::BranchEqual => self.branch_compare(instr, ConditionCode::E),
            Op::BranchNotEqual => self.branch_compare(instr, ConditionCode::Ne),
            Op::BranchEqualZero => self.branch_zero(instr, ConditionCode::E),
            Op::BranchNotEqualZero => self.branch_zero(instr, ConditionCode::Ne),
            Op::BranchGreaterThanOrEqualZero => self.branch_zero(instr, ConditionCode::Ns),
            Op::BranchLessThanZero => self.branch_zero(instr, ConditionCode::S),
            Op::BranchGreaterThanZero => self.branch_zero(instr, ConditionCode::G),
            Op::BranchLessThanOrEqualZero => self.branch_zero(instr, ConditionCode::Le),
            Op::BranchCop1 => self.branch_cop1(instr),
            Op::Jump | Op::JumpAndLink => self.jump(instr),
            Op::JumpIndirect | Op::JumpAndLinkIndirect => self.jump_indirect(instr),
            Op::SystemCall => self.system_call(instr),
            Op::ExceptionReturn => self.exception_return(instr),
            Op::LoadByte => self.load_sized(instr, 1, true),
            Op::LoadByteUnsigned => self.load_sized(instr, 1, false),
            Op::LoadHalfword => self.load_sized(instr, 2, true),
            Op::LoadHalfwordUnsigned => self.load_sized(instr, 2, false),
            Op::LoadWord => self.load_sized(instr, 4, true),
            Op::LoadWordUnsigned => self.load_sized(instr, 4, false),
            Op::LoadDoubleword => self.load_sized(instr, 8, false),
            Op::LoadQuadword => self.load_quadword(instr),
            Op::LoadWordCop1 => self.load_word_cop1(instr),
            Op::LoadWordLeft => self.load_word_unaligned(instr, true),
            Op::LoadWordRight => self.load_word_unaligned(instr, false),
            Op::LoadDoublewordLeft => self.load_doubleword_unaligned(instr, true),
            Op::LoadDoublewordRight => self.load_doubleword_unaligned(instr, false),
            Op::StoreByte => self.store_sized(instr, 1),
            Op::StoreHalfword => self.store_sized(instr, 2),
            Op::StoreWord => self.store_sized(instr, 4),
            Op::StoreDoubleword => self.store_sized(instr, 8),
            Op::StoreQuadword => self.store_quadword(instr),
            Op::StoreWordCop1 => self.store_word_cop1(instr),
            Op::StoreWordLeft => self.store_word_unaligned(instr, true),
            Op::StoreWordRight => self.store_word_unaligned(instr, false),
            Op::StoreDoublewordLeft => self.store_doubleword_unaligned(instr, true),
            Op::StoreDoublewordRight => self.store_doubleword_unaligned(instr, false),
            Op::FloatingPointAdd
            | Op::FloatingPointSubtract
            | Op::FloatingPointMultiply
            | Op::FloatingPointDivide
            | Op::FloatingPointMinimum
            | Op::FloatingPointMaximum => self.fpu_arith(instr),
            Op::FloatingPointMultiplyAdd | Op::FloatingPointMultiplySubtract => {
                self.fpu_muladd(instr);
            }
            Op::FloatingPointSquareRoot => self.fpu_sqrt(instr),
            Op::FloatingPointReciprocalSquareRoot => self.fpu_rsqrt(instr),
            Op::FloatingPointAbsoluteValue => self.fpu_abs(instr),
            Op::FloatingPointNegate => self.fpu_negate(instr),
            Op::FloatingPointMove => self.fpu_move(instr),
            Op::FloatingPointClearControl => self.fpu_clear_condition(),
            Op::FloatingPointCompareEqual => self.fpu_compare(instr, ConditionCode::E),
            Op::FloatingPointCompareLessThan => self.fpu_compare(instr, ConditionCode::B),
            Op::FloatingPointCompareLessThanOrEqual => self.fpu_compare(instr, ConditionCode::Be),
            Op::FloatingPointConvertToFixedPoint => self.fpu_cvt_word(instr),
            Op::FixedPointConvertToFloatingPoint => self.fpu_cvt_float(instr),
            Op::MoveWordFromCop1 => self.move_from_cop1(instr),
            Op::MoveWordToCop1 => self.move_to_cop1(instr),
            Op::ParallelAddByte
            | Op::ParallelAddHalfword
            | Op::ParallelAddWord
            | Op::ParallelAddByteSaturation
            | Op::ParallelAddHalfwordSaturation
            | Op::ParallelAddByteUnsignedSaturation
            | Op::ParallelAddHalfwordUnsignedSaturation
            | Op::ParallelSubByte
            | Op::ParallelSubHalfword
            | Op::ParallelSubWord
            | Op::ParallelSubByteSaturation
            | Op::ParallelSubHalfwordSaturation
            | Op::ParallelSubByteUnsignedSaturation
            | Op::ParallelSubHalfwordUnsignedSaturation
            | Op::ParallelAnd
            | Op::ParallelOr
            | Op::ParallelXor
            | Op::ParallelNor
            | Op::ParallelCopyLowerDoubleword
            | Op::ParallelCopyUpperDoubleword => self.mmi_op(instr),
            Op::VCallMs => self.vcall_ms(instr),
            Op::VCallMsr => self.vcall_msr(instr),
            Op::WaitVU0 => self.wait_for_vu0(instr),
            Op::CheckInterlockVU0 => self.check_interlock_vu0(instr),
            Op::FallbackInterpreter => self.fallback_interpreter(instr),
            _ => panic!("[EE JIT] unknown IR instruction {:?}", instr.op),
        }
    }
}
