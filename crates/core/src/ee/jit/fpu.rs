//! EE COP1 (scalar FPU) lowering.
//!
//! The guest FPU has no infinities or NaNs: results that overflow clamp to
//! the largest finite magnitude. Host arithmetic runs with the EE MXCSR
//! (flush-to-zero, denormals-as-zero, round-toward-zero); overflow results
//! are pulled back into range with the same min-signed/min-unsigned pair
//! the vector units use. The sticky u/o control flags are cleared the way
//! the reference implementation does on the recompiled path.

use crate::emitter::{ConditionCode, Reg, Xmm};
use crate::ir::{Instruction, Opcode};
use crate::regalloc::{RegKind, RegState};

use super::{off_fpu_condition, off_fpu_flag_o, off_fpu_flag_u, EeCore};

/// Positive float maximum (0x7F7FFFFF) in all four lanes.
const MAX_FLT: [u8; 16] = max_flt_bytes();
/// Negative float maximum (0xFF7FFFFF) in all four lanes.
const MIN_FLT: [u8; 16] = min_flt_bytes();
/// Sign-bit clear mask.
const ABS_MASK: [u8; 16] = splat(0x7FFF_FFFF);
/// Sign-bit toggle mask.
const NEG_MASK: [u8; 16] = splat(0x8000_0000);

const fn splat(word: u32) -> [u8; 16] {
    let b = word.to_le_bytes();
    [
        b[0], b[1], b[2], b[3], b[0], b[1], b[2], b[3], b[0], b[1], b[2], b[3], b[0], b[1], b[2],
        b[3],
    ]
}

const fn max_flt_bytes() -> [u8; 16] {
    splat(0x7F7F_FFFF)
}

const fn min_flt_bytes() -> [u8; 16] {
    splat(0xFF7F_FFFF)
}

impl EeCore {
    fn clear_uo_flags(&mut self) {
        self.asm.mov8_imm_mem(0, Reg::R15, off_fpu_flag_u());
        self.asm.mov8_imm_mem(0, Reg::R15, off_fpu_flag_o());
    }

    /// Clamps every lane of `reg` into the guest's finite range.
    fn clamp_freg(&mut self, reg: Xmm) {
        let max = self.asm.block.emit_literal(&MAX_FLT);
        let min = self.asm.block.emit_literal(&MIN_FLT);
        self.asm.pminsd_lit(max, reg);
        self.asm.pminud_lit(min, reg);
    }

    pub(crate) fn fpu_arith(&mut self, instr: &Instruction) {
        let source = self.alloc_xmm(instr.source_reg(), RegKind::EeFpu, RegState::Read, None);
        let source2 = self.alloc_xmm(instr.source2_reg(), RegKind::EeFpu, RegState::Read, None);
        let temp = self.lalloc_xmm(0, RegKind::Scratch, RegState::Scratchpad, None);
        self.clear_uo_flags();

        self.asm.movaps_reg(source, temp);
        match instr.op {
            Opcode::FloatingPointAdd => self.asm.addss(source2, temp),
            Opcode::FloatingPointSubtract => self.asm.subss(source2, temp),
            Opcode::FloatingPointMultiply => self.asm.mulss(source2, temp),
            Opcode::FloatingPointDivide => self.asm.divss(source2, temp),
            Opcode::FloatingPointMinimum => self.asm.minss(source2, temp),
            Opcode::FloatingPointMaximum => self.asm.maxss(source2, temp),
            _ => unreachable!(),
        }
        if !matches!(
            instr.op,
            Opcode::FloatingPointMinimum | Opcode::FloatingPointMaximum
        ) {
            self.clamp_freg(temp);
        }

        let dest = self.alloc_xmm(instr.dest_reg(), RegKind::EeFpu, RegState::Write, None);
        self.asm.movaps_reg(temp, dest);
        self.free_xmm(temp);
    }

    /// MADD/MSUB family: `dest = ACC ± fs * ft` (or into ACC itself).
    pub(crate) fn fpu_muladd(&mut self, instr: &Instruction) {
        let source = self.alloc_xmm(instr.source_reg(), RegKind::EeFpu, RegState::Read, None);
        let source2 = self.alloc_xmm(instr.source2_reg(), RegKind::EeFpu, RegState::Read, None);
        let acc = self.alloc_xmm(
            crate::state::EE_FPU_ACC,
            RegKind::EeFpu,
            RegState::Read,
            None,
        );
        let temp = self.lalloc_xmm(0, RegKind::Scratch, RegState::Scratchpad, None);
        self.clear_uo_flags();

        self.asm.movaps_reg(source, temp);
        self.asm.mulss(source2, temp);
        self.clamp_freg(temp);
        if instr.op == Opcode::FloatingPointMultiplyAdd {
            self.asm.addss(acc, temp);
        } else {
            // acc - product: compute in a second scratch to keep operand
            // order.
            let temp2 = self.lalloc_xmm(0, RegKind::Scratch, RegState::Scratchpad, None);
            self.asm.movaps_reg(acc, temp2);
            self.asm.subss(temp, temp2);
            self.asm.movaps_reg(temp2, temp);
            self.free_xmm(temp2);
        }
        self.clamp_freg(temp);

        let dest = self.alloc_xmm(instr.dest_reg(), RegKind::EeFpu, RegState::Write, None);
        self.asm.movaps_reg(temp, dest);
        self.free_xmm(temp);
    }

    pub(crate) fn fpu_sqrt(&mut self, instr: &Instruction) {
        let source = self.alloc_xmm(instr.source_reg(), RegKind::EeFpu, RegState::Read, None);
        let temp = self.lalloc_xmm(0, RegKind::Scratch, RegState::Scratchpad, None);
        self.clear_uo_flags();

        // Guest SQRT takes the magnitude; a negative input does not NaN.
        let abs = self.asm.block.emit_literal(&ABS_MASK);
        self.asm.movaps_reg(source, temp);
        self.asm.pand_lit(abs, temp);
        self.asm.sqrtss(temp, temp);

        let dest = self.alloc_xmm(instr.dest_reg(), RegKind::EeFpu, RegState::Write, None);
        self.asm.movaps_reg(temp, dest);
        self.free_xmm(temp);
    }

    pub(crate) fn fpu_rsqrt(&mut self, instr: &Instruction) {
        let source = self.alloc_xmm(instr.source_reg(), RegKind::EeFpu, RegState::Read, None);
        let source2 = self.alloc_xmm(instr.source2_reg(), RegKind::EeFpu, RegState::Read, None);
        let temp = self.lalloc_xmm(0, RegKind::Scratch, RegState::Scratchpad, None);
        let temp2 = self.lalloc_xmm(0, RegKind::Scratch, RegState::Scratchpad, None);
        self.clear_uo_flags();

        let abs = self.asm.block.emit_literal(&ABS_MASK);
        self.asm.movaps_reg(source2, temp2);
        self.asm.pand_lit(abs, temp2);
        self.asm.sqrtss(temp2, temp2);
        self.asm.movaps_reg(source, temp);
        self.asm.divss(temp2, temp);
        self.clamp_freg(temp);

        let dest = self.alloc_xmm(instr.dest_reg(), RegKind::EeFpu, RegState::Write, None);
        self.asm.movaps_reg(temp, dest);
        self.free_xmm(temp2);
        self.free_xmm(temp);
    }

    pub(crate) fn fpu_abs(&mut self, instr: &Instruction) {
        let source = self.alloc_xmm(instr.source_reg(), RegKind::EeFpu, RegState::Read, None);
        let dest = self.alloc_xmm(instr.dest_reg(), RegKind::EeFpu, RegState::Write, None);
        self.clear_uo_flags();
        if dest != source {
            self.asm.movaps_reg(source, dest);
        }
        let abs = self.asm.block.emit_literal(&ABS_MASK);
        self.asm.pand_lit(abs, dest);
    }

    pub(crate) fn fpu_negate(&mut self, instr: &Instruction) {
        let source = self.alloc_xmm(instr.source_reg(), RegKind::EeFpu, RegState::Read, None);
        let dest = self.alloc_xmm(instr.dest_reg(), RegKind::EeFpu, RegState::Write, None);
        self.clear_uo_flags();
        if dest != source {
            self.asm.movaps_reg(source, dest);
        }
        let neg = self.asm.block.emit_literal(&NEG_MASK);
        self.asm.pxor_lit(neg, dest);
    }

    pub(crate) fn fpu_move(&mut self, instr: &Instruction) {
        let source = self.alloc_xmm(instr.source_reg(), RegKind::EeFpu, RegState::Read, None);
        let dest = self.alloc_xmm(instr.dest_reg(), RegKind::EeFpu, RegState::Write, None);
        if dest != source {
            self.asm.movaps_reg(source, dest);
        }
    }

    pub(crate) fn fpu_clear_condition(&mut self) {
        self.asm.mov8_imm_mem(0, Reg::R15, off_fpu_condition());
    }

    pub(crate) fn fpu_compare(&mut self, instr: &Instruction, cc: ConditionCode) {
        let source = self.alloc_xmm(instr.source_reg(), RegKind::EeFpu, RegState::Read, None);
        let source2 = self.alloc_xmm(instr.source2_reg(), RegKind::EeFpu, RegState::Read, None);
        // ucomiss orders flags as dest ? source: CF for below, ZF for equal.
        self.asm.ucomiss(source2, source);
        self.asm.setcc_mem(cc, Reg::R15, off_fpu_condition());
    }

    /// CVT.W.S: truncate toward zero with guest-style saturation. The
    /// host's indefinite result (0x80000000) on positive overflow becomes
    /// `i32::MAX`.
    pub(crate) fn fpu_cvt_word(&mut self, instr: &Instruction) {
        let source = self.alloc_xmm(instr.source_reg(), RegKind::EeFpu, RegState::Read, None);
        let sign = self.lalloc_int(0, RegKind::Scratch, RegState::Scratchpad, None);
        self.asm.cvttss2si(source, Reg::Rax);
        self.asm.movd_from_xmm(source, sign);
        self.asm.cmp32_imm(0x8000_0000, Reg::Rax);
        let in_range = self.asm.jcc_near_deferred(ConditionCode::Ne);
        self.asm.test32_reg_imm(0x8000_0000, sign);
        let negative = self.asm.jcc_near_deferred(ConditionCode::Ne);
        self.asm.mov32_reg_imm(0x7FFF_FFFF, Reg::Rax);
        self.asm.set_jump_dest(negative);
        self.asm.set_jump_dest(in_range);

        let dest = self.alloc_xmm(instr.dest_reg(), RegKind::EeFpu, RegState::Write, None);
        self.asm.movd_to_xmm(Reg::Rax, dest);
        self.free_int(sign);
    }

    /// CVT.S.W: integer bits to float.
    pub(crate) fn fpu_cvt_float(&mut self, instr: &Instruction) {
        let source = self.alloc_xmm(instr.source_reg(), RegKind::EeFpu, RegState::Read, None);
        self.asm.movd_from_xmm(source, Reg::Rax);
        let dest = self.alloc_xmm(instr.dest_reg(), RegKind::EeFpu, RegState::Write, None);
        self.asm.cvtsi2ss(Reg::Rax, dest);
    }

    pub(crate) fn move_from_cop1(&mut self, instr: &Instruction) {
        let source = self.alloc_xmm(instr.source_reg(), RegKind::EeFpu, RegState::Read, None);
        let dest = self.alloc_int(instr.dest_reg(), RegKind::EeGpr, RegState::Write, None);
        self.asm.movd_from_xmm(source, dest);
        self.asm.movsx32_to_64(dest, dest);
    }

    pub(crate) fn move_to_cop1(&mut self, instr: &Instruction) {
        let source = self.alloc_int(instr.source_reg(), RegKind::EeGpr, RegState::Read, None);
        let dest = self.alloc_xmm(instr.dest_reg(), RegKind::EeFpu, RegState::Write, None);
        self.asm.movd_to_xmm(source, dest);
    }
}
