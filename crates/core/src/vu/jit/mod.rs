//! VU code generator and runtime core.
//!
//! Register conventions inside generated VU code:
//!
//! | register | role |
//! |----------|------|
//! | R15 | guest state base (`VuState`) |
//! | R14 | core base (`VuCore`) |
//! | RAX, RSI, RDI | scratch |
//! | RSP | host stack |
//! | XMM0, XMM1 | SIMD scratch |
//!
//! RBX, RBP, RCX, RDX and R8-R13 hold VI registers; XMM2-XMM15 hold VF
//! registers. Blocks are plain functions (`push rbp` ... `pop rbp; ret`)
//! invoked by the prologue, which finds (or compiles) the block for the
//! current `(PC, prev_pc, program, pipeline_state)` key and calls it.

mod int;
mod special;
mod vector;

use std::mem::offset_of;

use tracing::{debug, warn};

use crate::config::JitConfig;
use crate::emitter::{ConditionCode, Emitter, Reg, Xmm};
use crate::heap::{JitHeap, VuBlockIndex, VuBlockKey, VuBlockRecord};
use crate::ir::{Block, Instruction, Opcode};
use crate::regalloc::{search_xmm, AllocEntry, RegFile, RegKind, RegState};
use crate::state::{VuBus, VuState};
use crate::vu::pipeline::NO_PREV_PC;
use crate::vu::translator::VuTranslator;

/// MXCSR while VU code runs: denormals-as-zero, flush-to-zero,
/// round-toward-zero, exceptions masked.
const VU_MXCSR: u32 = 0xFFC0;

/// Positive float maximum in all lanes.
pub(crate) const MAX_FLT: [u8; 16] = splat(0x7F7F_FFFF);
/// Negative float maximum in all lanes.
pub(crate) const MIN_FLT: [u8; 16] = splat(0xFF7F_FFFF);
/// Sign-bit clear mask in all lanes.
pub(crate) const ABS_MASK: [u8; 16] = splat(0x7FFF_FFFF);

pub(crate) const fn splat(word: u32) -> [u8; 16] {
    let b = word.to_le_bytes();
    [
        b[0], b[1], b[2], b[3], b[0], b[1], b[2], b[3], b[0], b[1], b[2], b[3], b[0], b[1], b[2],
        b[3],
    ]
}

/// Converts an instruction XYZW field (X = bit 3) into a BLENDPS lane mask
/// (X = bit 0).
pub(crate) fn convert_field(value: u8) -> u8 {
    let mut result = 0;
    if value & 0x8 != 0 {
        result |= 0x1;
    }
    if value & 0x4 != 0 {
        result |= 0x2;
    }
    if value & 0x2 != 0 {
        result |= 0x4;
    }
    if value & 0x1 != 0 {
        result |= 0x8;
    }
    result
}

/// `2^n` scale tables for the fixed-point conversions, by table index.
pub(crate) fn ftoi_scale(entry: usize) -> [u8; 16] {
    let scale: f32 = match entry {
        1 => 16.0,
        2 => 4096.0,
        3 => 32768.0,
        _ => 1.0,
    };
    splat(scale.to_bits())
}

/// Reciprocal scale tables for ITOF.
pub(crate) fn itof_scale(entry: usize) -> [u8; 16] {
    let scale: f32 = match entry {
        1 => 1.0 / 16.0,
        2 => 1.0 / 4096.0,
        3 => 1.0 / 32768.0,
        _ => 1.0,
    };
    splat(scale.to_bits())
}

/// Entry point of the prologue block.
type VuPrologueFn = unsafe extern "C" fn(*mut VuCore, *mut VuState);

/// Slow-path entry: find or compile the block for the current key.
type VuExecFn = unsafe extern "C" fn(*mut VuCore, *mut VuState) -> *const u8;

/// Run-scratch fields written by generated code through the core base.
#[repr(C)]
#[derive(Debug)]
pub struct VuRunScratch {
    /// Cycles retired by the most recent block.
    pub cycle_count: u16,
    _pad: u16,
    /// Host MXCSR saved around guest execution.
    pub saved_mxcsr: u32,
    /// Guest MXCSR loaded while VU code runs.
    pub vu_mxcsr: u32,
    /// Resolved branch destination (after the delay slot retires).
    pub branch_dest: u16,
    /// Resolved fall-through destination.
    pub branch_fail_dest: u16,
    /// Pending branch destination (set in the branch's own block).
    pub branch_delay_dest: u16,
    /// Pending fall-through destination.
    pub branch_delay_fail_dest: u16,
    /// PC of the block the next lookup is jumped from.
    pub prev_pc: u32,
}

impl Default for VuRunScratch {
    fn default() -> Self {
        Self {
            cycle_count: 0,
            _pad: 0,
            saved_mxcsr: 0,
            vu_mxcsr: VU_MXCSR,
            branch_dest: 0,
            branch_fail_dest: 0,
            branch_delay_dest: 0,
            branch_delay_fail_dest: 0,
            prev_pc: NO_PREV_PC,
        }
    }
}

/// The VU recompiler core.
#[derive(Debug)]
pub struct VuCore {
    pub(crate) heap: JitHeap,
    pub(crate) index: VuBlockIndex,
    pub(crate) asm: Emitter,
    pub(crate) regs: RegFile,
    pub(crate) translator: VuTranslator,
    pub(crate) bus: VuBus,
    pub(crate) rt: VuRunScratch,
    config: JitConfig,
    prologue: Option<VuPrologueFn>,
    /// CRC-32C of the current microprogram; part of every block key.
    pub(crate) current_program: u32,
    /// Data-memory wrap mask captured from the state at entry.
    pub(crate) mem_mask: u16,
    pub(crate) should_update_mac: bool,
    pub(crate) vu_branch: bool,
    pub(crate) end_of_program: bool,
    pub(crate) block_cycles: u16,
    /// VI register whose pre-write backup services branch reads.
    pub(crate) backup_vi_id: u8,
    abi_int_count: usize,
}

pub(crate) fn off_rt(field: usize) -> i32 {
    offset_of!(VuCore, rt) as i32 + field as i32
}

/// Slow-path block finder: looks up (or compiles) the block for the
/// state's current PC under the full context key.
///
/// # Safety
///
/// Called only from the prologue block with the live core/state pair.
unsafe extern "C" fn vu_exec_block(core: *mut VuCore, state: *mut VuState) -> *const u8 {
    let core = &mut *core;
    let state = &mut *state;

    let key = VuBlockKey {
        pc: u32::from(state.pc),
        prev_pc: core.rt.prev_pc,
        program: core.current_program,
        pipeline_state: state.pipeline_state,
    };

    if let Some(record) = core.index.find_block(&key) {
        return record.code_start;
    }

    debug!(
        pc = format_args!("{:#06x}", state.pc),
        prev_pc = format_args!("{:#x}", core.rt.prev_pc),
        program = format_args!("{:#010x}", core.current_program),
        "VU block miss; compiling"
    );
    let (block, analysis) = {
        let mut translator = std::mem::take(&mut core.translator);
        let out = translator.translate(state, core.rt.prev_pc);
        core.translator = translator;
        out
    };
    core.mem_mask = state.mem_mask;
    core.backup_vi_id = analysis.backup_vi_rec;
    core.recompile_block(key, block)
}

impl VuCore {
    /// Creates a VU core over the given host interface.
    ///
    /// # Errors
    ///
    /// Fails when the RWX region cannot be mapped.
    pub fn new(bus: VuBus, config: JitConfig) -> Result<Self, crate::common::CoreError> {
        let mut core = Self {
            heap: JitHeap::new("VU", config.heap_size)?,
            index: VuBlockIndex::new(),
            asm: Emitter::new("VU"),
            regs: RegFile::new(),
            translator: VuTranslator::new(),
            bus,
            rt: VuRunScratch::default(),
            config,
            prologue: None,
            current_program: 0,
            mem_mask: 0x3FFF,
            should_update_mac: false,
            vu_branch: false,
            end_of_program: false,
            block_cycles: 0,
            backup_vi_id: 0,
            abi_int_count: 0,
        };
        core.reset(true);
        Ok(core)
    }

    /// Resets allocator state; optionally flushes the JIT heap.
    pub fn reset(&mut self, clear_cache: bool) {
        self.abi_int_count = 0;
        self.should_update_mac = false;
        self.rt.prev_pc = NO_PREV_PC;
        self.regs = RegFile::new();
        self.regs.lock_int(&[
            Reg::Rsp,
            Reg::Rax,
            Reg::Rsi,
            Reg::Rdi,
            Reg::R14,
            Reg::R15,
        ]);
        self.regs.lock_xmm(&[Xmm::Xmm0, Xmm::Xmm1]);

        if clear_cache {
            self.index.flush_all(&mut self.heap);
            self.prologue = None;
        }
    }

    /// Installs the CRC of a freshly uploaded microprogram. A change
    /// discards allocator state (but keeps compiled blocks: the CRC in the
    /// key already isolates them).
    pub fn set_current_program(&mut self, crc: u32) {
        self.reset(false);
        self.current_program = crc;
    }

    /// Number of live compiled blocks (diagnostics).
    pub fn block_count(&self) -> usize {
        self.index.len()
    }

    /// Executes VU code from the state's PC until the block chain exits.
    /// Returns the cycles retired by the last block.
    pub fn run(&mut self, state: &mut VuState) -> u16 {
        if self.heap.is_full(self.config.high_water) {
            warn!("VU JIT heap under high-water mark; flushing");
            self.index.flush_all(&mut self.heap);
            self.prologue = None;
        }
        self.mem_mask = state.mem_mask;
        if self.prologue.is_none() {
            self.prologue = Some(self.create_prologue_block());
        }
        let prologue = self.prologue.unwrap_or_else(|| unreachable!());
        // SAFETY: the prologue was generated for this calling convention;
        // core and state outlive the call.
        unsafe {
            prologue(self, state);
        }
        self.rt.cycle_count
    }

    // --- prologue -------------------------------------------------------

    fn create_prologue_block(&mut self) -> VuPrologueFn {
        self.asm.block.clear();

        self.asm.push(Reg::Rbp);
        self.asm.mov64_reg(Reg::Rsp, Reg::Rbp);
        self.asm.push(Reg::Rbx);
        self.asm.push(Reg::R12);
        self.asm.push(Reg::R13);
        self.asm.push(Reg::R14);
        self.asm.push(Reg::R15);

        self.asm.mov64_reg(Reg::Rdi, Reg::R14);
        self.asm.mov64_reg(Reg::Rsi, Reg::R15);

        self.asm
            .stmxcsr(Reg::R14, off_rt(offset_of!(VuRunScratch, saved_mxcsr)));
        self.asm
            .ldmxcsr(Reg::R14, off_rt(offset_of!(VuRunScratch, vu_mxcsr)));

        // Alignment: entry pushed the return address (8), plus six pushes
        // above leaves RSP 16-byte aligned for the calls below.
        self.asm.sub64_reg_imm(8, Reg::Rsp);

        // First call resolves the block; the second runs it.
        self.asm.mov64_reg(Reg::R14, Reg::Rdi);
        self.asm.mov64_reg(Reg::R15, Reg::Rsi);
        let exec: VuExecFn = vu_exec_block;
        self.asm.load_addr(exec as usize as u64, Reg::Rax);
        self.asm.call_indir(Reg::Rax);
        self.asm.call_indir(Reg::Rax);

        self.asm.add64_reg_imm(8, Reg::Rsp);

        self.asm
            .ldmxcsr(Reg::R14, off_rt(offset_of!(VuRunScratch, saved_mxcsr)));
        self.asm.pop(Reg::R15);
        self.asm.pop(Reg::R14);
        self.asm.pop(Reg::R13);
        self.asm.pop(Reg::R12);
        self.asm.pop(Reg::Rbx);
        self.asm.pop(Reg::Rbp);
        self.asm.ret();

        let key = VuBlockKey {
            pc: 0xFFFF,
            prev_pc: 0xFFFE,
            program: 0,
            pipeline_state: [0, 0],
        };
        let record = self.insert_block(key);
        // SAFETY: the bytes at code_start are the function just emitted.
        unsafe { std::mem::transmute::<*const u8, VuPrologueFn>(record.code_start) }
    }

    // --- block assembly --------------------------------------------------

    pub(crate) fn recompile_block(&mut self, key: VuBlockKey, mut block: Block) -> *const u8 {
        self.asm.block.clear();
        self.vu_branch = false;
        self.end_of_program = false;
        self.should_update_mac = false;
        self.block_cycles = block.cycle_count();

        self.asm.push(Reg::Rbp);
        self.asm.mov64_reg(Reg::Rsp, Reg::Rbp);

        while let Some(instr) = block.next_instr() {
            self.emit_instruction(&instr);
        }

        if self.vu_branch {
            self.handle_branch();
        } else {
            self.cleanup_recompiler(true);
        }

        let record = self.insert_block(key);
        record.code_start
    }

    /// Copies the scratch block into the heap under `key`.
    ///
    /// Exhaustion follows the same recovery as the EE side: flush, rebuild
    /// the (byte-identical, same-address) prologue, retry once, then die.
    fn insert_block(&mut self, key: VuBlockKey) -> VuBlockRecord {
        let code_len = self.asm.block.code_len();
        let literals_len = self.asm.block.literals_len();
        let total = code_len + literals_len;
        assert!(total > 0, "[VU JIT] inserting empty block");

        let mut dest = self.heap.alloc(total);
        if dest.is_none() {
            warn!("VU JIT heap full; flushing all blocks");
            let stashed: Vec<u8> = self.asm.block.occupied().to_vec();
            self.index.flush_all(&mut self.heap);
            if key.pc != 0xFFFF {
                self.prologue = Some(self.create_prologue_block());
            }
            self.restore_scratch(&stashed, literals_len);
            dest = self.heap.alloc(total);
        }

        let Some(dest) = dest else {
            panic!(
                "[VU JIT] heap exhausted at {:#06x}: block of {total} bytes cannot fit \
                 ({}/{} bytes in use)",
                key.pc,
                self.heap.usage(),
                self.heap.capacity()
            );
        };

        // SAFETY: dest points at `total` writable bytes inside the heap.
        unsafe {
            std::ptr::copy_nonoverlapping(self.asm.block.occupied().as_ptr(), dest, total);
        }

        let record = VuBlockRecord {
            literals_start: dest,
            // SAFETY: in-bounds offsets of the fresh allocation.
            code_start: unsafe { dest.add(literals_len) },
            code_end: unsafe { dest.add(total) },
        };
        self.index.insert_block(key, record, &mut self.heap);
        record
    }

    fn restore_scratch(&mut self, stashed: &[u8], literals_len: usize) {
        self.asm.block.clear();
        let mut remaining = literals_len;
        while remaining > 0 {
            let mut lit = [0u8; 16];
            lit.copy_from_slice(&stashed[remaining - 16..remaining]);
            let _ = self.asm.block.emit_literal(&lit);
            remaining -= 16;
        }
        for &byte in &stashed[literals_len..] {
            self.asm.block.write_u8(byte);
        }
    }

    /// Flushes registers, masks PC into data-memory range, stores the
    /// block's cycle count, and returns to the prologue.
    pub(crate) fn cleanup_recompiler(&mut self, clear_regs: bool) {
        self.flush_regs();
        if clear_regs {
            self.regs.clear_bindings();
        }

        // Programs branch outside micro memory; the wrap keeps lookups in
        // range.
        let off_pc = offset_of!(VuState, pc) as i32;
        self.asm.movzx16_from_mem(Reg::R15, Reg::Rax, off_pc);
        self.asm.and32_reg_imm(u32::from(self.mem_mask), Reg::Rax);
        self.asm.mov16_to_mem(Reg::Rax, Reg::R15, off_pc);

        self.asm.mov16_imm_mem(
            self.block_cycles,
            Reg::R14,
            off_rt(offset_of!(VuRunScratch, cycle_count)),
        );

        self.asm.pop(Reg::Rbp);
        self.asm.ret();
    }

    /// Branch epilogue: pick the taken or fall-through destination the
    /// delay slot resolved into `branch_on`.
    fn handle_branch(&mut self) {
        self.asm.mov8_from_mem(
            Reg::R15,
            Reg::Rax,
            offset_of!(VuState, branch_on) as i32,
        );
        self.asm.test8_reg(Reg::Rax, Reg::Rax);
        let fail = self.asm.jcc_near_deferred(ConditionCode::E);

        let off_pc = offset_of!(VuState, pc) as i32;
        self.asm.mov16_from_mem(
            Reg::R14,
            Reg::Rax,
            off_rt(offset_of!(VuRunScratch, branch_dest)),
        );
        self.asm.mov16_to_mem(Reg::Rax, Reg::R15, off_pc);
        let end = self.end_of_program;
        self.cleanup_recompiler(end);

        self.asm.set_jump_dest(fail);
        self.asm.mov16_from_mem(
            Reg::R14,
            Reg::Rax,
            off_rt(offset_of!(VuRunScratch, branch_fail_dest)),
        );
        self.asm.mov16_to_mem(Reg::Rax, Reg::R15, off_pc);
        self.cleanup_recompiler(true);
    }

    // --- register allocation ---------------------------------------------

    /// Allocates a host GPR for a VI register.
    pub(crate) fn alloc_int(&mut self, vi: u16, state: RegState) -> Reg {
        assert!(vi < 16, "[VU JIT] alloc int: vi{vi} out of range");

        if let Some(found) = self.regs.find_int(vi, RegKind::VuVi) {
            let entry = &mut self.regs.int[found.idx() as usize];
            if state != RegState::Read {
                entry.modified = true;
            }
            entry.age = 0;
            return found;
        }

        self.regs.age_int();
        let dest = Self::search_vi(&self.regs.int);

        self.flush_int_reg(dest);
        if state.needs_load() {
            self.asm
                .movzx16_from_mem(Reg::R15, dest, VuState::vi_offset(vi) as i32);
        }

        let entry = &mut self.regs.int[dest.idx() as usize];
        entry.used = true;
        entry.modified = state != RegState::Read;
        entry.guest = vi;
        entry.kind = RegKind::VuVi;
        entry.age = 0;
        dest
    }

    fn search_vi(table: &[AllocEntry; 16]) -> Reg {
        let mut victim = usize::MAX;
        let mut age = 0;
        for (idx, entry) in table.iter().enumerate() {
            if entry.locked {
                continue;
            }
            if !entry.used {
                return Reg::from_idx(idx);
            }
            if entry.age >= age {
                victim = idx;
                age = entry.age;
            }
        }
        assert!(victim != usize::MAX, "[VU JIT] all host GPRs locked");
        Reg::from_idx(victim)
    }

    /// Allocates a host SIMD register for a VF (or special) register.
    pub(crate) fn alloc_sse(&mut self, vf: u16, state: RegState) -> Xmm {
        if state == RegState::Scratchpad {
            return self.alloc_sse_scratchpad(vf);
        }

        if let Some(found) = self.regs.find_xmm(vf, RegKind::VuVf) {
            let entry = &mut self.regs.xmm[found.idx() as usize];
            if state.modifies() {
                entry.modified = true;
            }
            entry.age = 0;
            return found;
        }

        self.regs.age_xmm();
        let dest = search_xmm(&self.regs.xmm);

        self.flush_xmm_reg(dest);
        if state.needs_load() {
            self.asm
                .movaps_from_mem(Reg::R15, dest, VuState::vf_offset(vf) as i32);
        }

        let entry = &mut self.regs.xmm[dest.idx() as usize];
        entry.used = true;
        entry.modified = state != RegState::Read;
        entry.guest = vf;
        entry.kind = RegKind::VuVf;
        entry.age = 0;
        self.set_clamping_reg(dest, true, 0xF);
        dest
    }

    /// Allocates a SIMD scratch holding a copy of `vf` without binding it.
    fn alloc_sse_scratchpad(&mut self, vf: u16) -> Xmm {
        let dest = search_xmm(&self.regs.xmm);
        if self.regs.xmm[dest.idx() as usize].used {
            self.flush_xmm_reg(dest);
            self.regs.xmm[dest.idx() as usize].used = false;
        }

        if let Some(found) = self.regs.find_xmm(vf, RegKind::VuVf) {
            self.asm.movaps_reg(found, dest);
        } else {
            self.asm
                .movaps_from_mem(Reg::R15, dest, VuState::vf_offset(vf) as i32);
        }

        let entry = &mut self.regs.xmm[dest.idx() as usize];
        entry.used = true;
        entry.modified = false;
        entry.guest = vf;
        entry.kind = RegKind::Scratch;
        entry.age = 0;
        dest
    }

    /// Writes a dirty VI entry back to guest state.
    pub(crate) fn flush_int_reg(&mut self, reg: Reg) {
        let entry = self.regs.int[reg.idx() as usize];
        if entry.used && entry.modified && entry.kind == RegKind::VuVi && entry.guest != 0 {
            self.asm
                .mov16_to_mem(reg, Reg::R15, VuState::vi_offset(entry.guest) as i32);
        }
    }

    /// Writes a dirty VF entry back to guest state (vf00 never flushes).
    pub(crate) fn flush_xmm_reg(&mut self, reg: Xmm) {
        let entry = self.regs.xmm[reg.idx() as usize];
        if entry.used && entry.modified && entry.kind == RegKind::VuVf && entry.guest != 0 {
            self.asm
                .movaps_to_mem(reg, Reg::R15, VuState::vf_offset(entry.guest) as i32);
        }
    }

    /// Writes back every dirty entry; bindings survive.
    pub(crate) fn flush_regs(&mut self) {
        for idx in 0..16 {
            self.flush_xmm_reg(Xmm::from_idx(idx));
            self.flush_int_reg(Reg::from_idx(idx));
        }
    }

    /// Flushes and clears all bindings (before nondeterministic calls).
    pub(crate) fn flush_and_clear(&mut self) {
        self.flush_regs();
        self.regs.clear_bindings();
    }

    // --- clamping --------------------------------------------------------

    /// Marks (or clears) lanes of a SIMD register as possibly holding
    /// out-of-range values. vf00 is constant and never needs clamping.
    pub(crate) fn set_clamping_reg(&mut self, reg: Xmm, value: bool, field: u8) {
        let entry = &mut self.regs.xmm[reg.idx() as usize];
        if entry.kind == RegKind::VuVf && entry.guest == 0 {
            entry.needs_clamping = 0;
            return;
        }
        if value {
            entry.needs_clamping |= field;
        } else {
            entry.needs_clamping &= !field;
        }
    }

    pub(crate) fn needs_clamping(&self, reg: Xmm, field: u8) -> bool {
        self.regs.xmm[reg.idx() as usize].needs_clamping & field != 0
    }

    /// Clamps the marked lanes of `reg` to the guest float range.
    ///
    /// `field` is a BLENDPS lane mask.
    pub(crate) fn clamp_vfreg(&mut self, field: u8, reg: Xmm) {
        if !self.needs_clamping(reg, field) {
            return;
        }
        // Some ops compute into XMM1; pick whichever scratch is free.
        let temp = if reg == Xmm::Xmm1 { Xmm::Xmm0 } else { Xmm::Xmm1 };
        let max = self.asm.block.emit_literal(&MAX_FLT);
        let min = self.asm.block.emit_literal(&MIN_FLT);
        self.asm.movaps_reg(reg, temp);
        self.asm.pminsd_lit(max, temp);
        self.asm.pminud_lit(min, temp);
        self.asm.blendps(field, temp, reg);
        self.set_clamping_reg(reg, false, field);
    }

    /// `dest = |source|` via the sign mask.
    pub(crate) fn sse_abs(&mut self, source: Xmm, dest: Xmm) {
        let abs = self.asm.block.emit_literal(&ABS_MASK);
        if source != dest {
            self.asm.movaps_reg(source, dest);
        }
        self.asm.pand_lit(abs, dest);
    }

    // --- ABI calls --------------------------------------------------------

    const ABI_ARGS: [Reg; 6] = [Reg::Rdi, Reg::Rsi, Reg::Rdx, Reg::Rcx, Reg::R8, Reg::R9];
    const ABI_SAVED: [Reg; 6] = [Reg::Rcx, Reg::Rdx, Reg::R8, Reg::R9, Reg::R10, Reg::R11];

    fn abi_release_arg(&mut self, arg: Reg) {
        let entry = self.regs.int[arg.idx() as usize];
        if entry.used {
            if entry.modified && entry.kind == RegKind::VuVi && entry.guest != 0 {
                self.asm
                    .mov16_to_mem(arg, Reg::R15, VuState::vi_offset(entry.guest) as i32);
            }
            self.regs.int[arg.idx() as usize].used = false;
            self.regs.int[arg.idx() as usize].age = 0;
        }
    }

    /// Stages an immediate as the next ABI argument.
    pub(crate) fn prepare_abi_imm(&mut self, value: u64) {
        let arg = Self::ABI_ARGS[self.abi_int_count];
        self.abi_release_arg(arg);
        self.asm.load_addr(value, arg);
        self.abi_int_count += 1;
    }

    /// Stages a register value as the next ABI argument.
    pub(crate) fn prepare_abi_reg(&mut self, reg: Reg) {
        let arg = Self::ABI_ARGS[self.abi_int_count];
        self.abi_release_arg(arg);
        if reg != arg {
            self.asm.mov64_reg(reg, arg);
        }
        self.abi_int_count += 1;
    }

    /// Calls a host function. Live caller-saved GPRs are pushed around
    /// the call; live SIMD values are flushed to guest state and dropped
    /// (every XMM register is caller-saved in the host ABI).
    pub(crate) fn call_abi_func(&mut self, addr: u64) {
        for idx in 0..16 {
            let reg = Xmm::from_idx(idx);
            if self.regs.xmm[idx].used {
                self.flush_xmm_reg(reg);
                self.regs.xmm[idx].used = false;
                self.regs.xmm[idx].age = 0;
                self.regs.xmm[idx].needs_clamping = 0;
            }
        }

        let mut pushed = 0;
        for reg in Self::ABI_SAVED {
            if self.regs.int[reg.idx() as usize].used {
                self.asm.push(reg);
                pushed += 1;
            }
        }
        if pushed % 2 == 1 {
            self.asm.sub64_reg_imm(8, Reg::Rsp);
        }

        self.asm.load_addr(addr, Reg::Rax);
        self.asm.call_indir(Reg::Rax);

        if pushed % 2 == 1 {
            self.asm.add64_reg_imm(8, Reg::Rsp);
        }
        for reg in Self::ABI_SAVED.iter().rev() {
            if self.regs.int[reg.idx() as usize].used {
                self.asm.pop(*reg);
            }
        }
        self.abi_int_count = 0;
    }

    // --- lowering dispatch -----------------------------------------------

    pub(crate) fn emit_instruction(&mut self, instr: &Instruction) {
        use Opcode as Op;
        match instr.op {
            Op::LoadConst => self.load_const(instr),
            Op::LoadFloatConst => self.load_float_const(instr),
            Op::LoadInt => self.load_int(instr),
            Op::StoreInt => self.store_int(instr),
            Op::LoadQuad => self.load_quad(instr),
            Op::StoreQuad => self.store_quad(instr),
            Op::LoadQuadInc => self.load_quad_inc(instr),
            Op::StoreQuadInc => self.store_quad_inc(instr),
            Op::LoadQuadDec => self.load_quad_dec(instr),
            Op::StoreQuadDec => self.store_quad_dec(instr),
            Op::MoveIntReg => self.move_int_reg(instr),
            Op::Jump => self.jump(instr),
            Op::JumpAndLink => self.jump_and_link(instr),
            Op::JumpIndirect => self.jump_indirect(instr),
            Op::JumpAndLinkIndirect => self.jump_and_link_indirect(instr),
            Op::BranchEqual => self.branch_int(instr, ConditionCode::E, true),
            Op::BranchNotEqual => self.branch_int(instr, ConditionCode::Ne, true),
            Op::BranchLessThanZero => self.branch_int(instr, ConditionCode::S, false),
            Op::BranchGreaterThanZero => self.branch_int(instr, ConditionCode::G, false),
            Op::BranchLessThanOrEqualZero => self.branch_int(instr, ConditionCode::Le, false),
            Op::BranchGreaterThanOrEqualZero => self.branch_int(instr, ConditionCode::Ns, false),
            Op::VAbs => self.vabs(instr),
            Op::VMaxVectors => self.minmax_vectors(instr, true),
            Op::VMinVectors => self.minmax_vectors(instr, false),
            Op::VMaxVectorByScalar => self.minmax_by_scalar(instr, true),
            Op::VMinVectorByScalar => self.minmax_by_scalar(instr, false),
            Op::VAddVectors => self.arith_vectors(instr, VectorOp::Add),
            Op::VSubVectors => self.arith_vectors(instr, VectorOp::Sub),
            Op::VMulVectors => self.arith_vectors(instr, VectorOp::Mul),
            Op::VAddVectorByScalar => self.arith_by_scalar(instr, VectorOp::Add),
            Op::VSubVectorByScalar => self.arith_by_scalar(instr, VectorOp::Sub),
            Op::VMulVectorByScalar => self.arith_by_scalar(instr, VectorOp::Mul),
            Op::VMaddVectors => self.madd_vectors(instr),
            Op::VMaddAccAndVectors => self.madd_acc_and_vectors(instr),
            Op::VMaddVectorByScalar => self.madd_by_scalar(instr),
            Op::VMaddAccByScalar => self.madd_acc_by_scalar(instr),
            Op::VMsubVectors => self.msub_vectors(instr),
            Op::VMsubVectorByScalar => self.msub_by_scalar(instr),
            Op::VMsubAccByScalar => self.msub_acc_by_scalar(instr),
            Op::VOpMula => self.opmula(instr),
            Op::VOpMsub => self.opmsub(instr),
            Op::VClip => self.clip(instr),
            Op::VDiv => self.div(instr),
            Op::VRsqrt => self.rsqrt(instr),
            Op::VFixedToFloat0 => self.fixed_to_float(instr, 0),
            Op::VFixedToFloat4 => self.fixed_to_float(instr, 1),
            Op::VFixedToFloat12 => self.fixed_to_float(instr, 2),
            Op::VFixedToFloat15 => self.fixed_to_float(instr, 3),
            Op::VFloatToFixed0 => self.float_to_fixed(instr, 0),
            Op::VFloatToFixed4 => self.float_to_fixed(instr, 1),
            Op::VFloatToFixed12 => self.float_to_fixed(instr, 2),
            Op::VFloatToFixed15 => self.float_to_fixed(instr, 3),
            Op::AndInt => self.and_int(instr),
            Op::OrInt => self.or_int(instr),
            Op::AddIntReg => self.add_int_reg(instr),
            Op::SubIntReg => self.sub_int_reg(instr),
            Op::AddUnsignedImm => self.add_unsigned_imm(instr),
            Op::SubUnsignedImm => self.sub_unsigned_imm(instr),
            Op::VMoveToInt => self.move_to_int(instr),
            Op::VMoveFromInt => self.move_from_int(instr),
            Op::VMoveFloat => self.move_float(instr),
            Op::VMoveRotatedFloat => self.move_rotated_float(instr),
            Op::VMacEq => self.mac_eq(instr),
            Op::VMacAnd => self.mac_and(instr),
            Op::SetClipFlags => self.set_clip_flags(instr),
            Op::GetClipFlags => self.get_clip_flags(instr),
            Op::AndClipFlags => self.and_clip_flags(instr),
            Op::OrClipFlags => self.or_clip_flags(instr),
            Op::AndStatFlags => self.and_stat_flags(instr),
            Op::VEleng => self.eleng(instr),
            Op::VErleng => self.erleng(instr),
            Op::VESqrt => self.esqrt(instr),
            Op::VERsqrt => self.ersqrt(instr),
            Op::VRInit => self.rinit(instr),
            Op::VMoveFromP => self.move_from_p(instr),
            Op::BackupVF => self.backup_vf(instr),
            Op::RestoreVF => self.restore_vf(instr),
            Op::BackupVI => self.backup_vi(instr),
            Op::ClearIntDelay => self.clear_int_delay(),
            Op::UpdateQ => self.update_q(),
            Op::UpdateP => self.update_p(),
            Op::UpdateMacFlags => self.should_update_mac = true,
            Op::UpdateMacPipeline => self.update_mac_pipeline(instr),
            Op::MoveXTOP => self.move_xtop(instr),
            Op::MoveXITOP => self.move_xitop(instr),
            Op::Xgkick => self.xgkick(instr),
            Op::UpdateXgkick => self.update_xgkick(instr),
            Op::Stop => self.stop(instr, false),
            Op::StopTBit => self.stop(instr, true),
            Op::SavePC => self.save_pc(instr),
            Op::SavePipelineState => self.save_pipeline_state(instr),
            Op::MoveDelayedBranch => self.move_delayed_branch(),
            Op::FallbackInterpreter => self.fallback_interpreter(instr),
            _ => panic!("[VU JIT] unknown IR instruction {:?}", instr.op),
        }
    }
}

/// Elementwise FMAC operation selector shared by the arith lowerers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum VectorOp {
    /// `addps`
    Add,
    /// `subps`
    Sub,
    /// `mulps`
    Mul,
}
