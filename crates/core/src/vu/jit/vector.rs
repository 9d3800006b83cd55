//! VU FMAC lowering: vector arithmetic, broadcasts, conversions, moves.
//!
//! Every VF write goes through a scratch register and a BLENDPS merge so
//! lanes outside the XYZW mask keep their old values. Broadcast forms
//! splat the chosen lane of the second source with a full shuffle first.
//! Operands are clamped on the way in and results on the way out, with
//! the per-lane dirty mask suppressing redundant clamps.

use std::mem::offset_of;

use crate::emitter::{Reg, Xmm};
use crate::ir::{Instruction, Operand};
use crate::regalloc::RegState;
use crate::state::{VuState, VU_REG_ACC};

use super::{convert_field, ftoi_scale, itof_scale, VectorOp, VuCore, ABS_MASK};

impl VuCore {
    /// Materializes the 4-lane sign and zero masks of `result` into
    /// `new_mac_flags`, honoring the write field.
    ///
    /// `field` is a BLENDPS lane mask; the MAC flag register keeps the
    /// instruction-order nibble (X at bit 3), so it is converted back.
    pub(crate) fn update_mac_flags(&mut self, result: Xmm, field: u8) {
        let field = convert_field(field);
        let temp = Xmm::Xmm0;
        let temp2 = Xmm::Xmm1;

        // Shuffle so the mask nibble reads XYZW from bit 3 down.
        if result != temp {
            self.asm.movaps_reg(result, temp);
        }
        self.asm.pshufd(0x1B, temp, temp);

        self.asm.movmskps(temp, Reg::Rax);
        self.asm.shl32_reg_imm(4, Reg::Rax);

        // Zero mask: strip signs, compare with zero.
        let abs = self.asm.block.emit_literal(&ABS_MASK);
        self.asm.movaps_from_lit(abs, temp2);
        self.asm.pand(temp2, temp);
        self.asm.xorps(temp2, temp2);
        self.asm.cmpeqps(temp2, temp);
        self.asm.movmskps(temp, Reg::Rsi);
        self.asm.or32_reg(Reg::Rsi, Reg::Rax);
        self.asm
            .and32_reg_imm(u32::from(field) << 4 | u32::from(field), Reg::Rax);

        self.asm.mov16_to_mem(
            Reg::Rax,
            Reg::R15,
            offset_of!(VuState, new_mac_flags) as i32,
        );
        self.should_update_mac = false;
    }

    /// Splats lane `bc` of `source` across the scratch register.
    fn broadcast(&mut self, source: Xmm, bc: u8, temp: Xmm) {
        let sel = bc | (bc << 2) | (bc << 4) | (bc << 6);
        self.asm.movaps_reg(source, temp);
        self.asm.shufps(sel, temp, temp);
    }

    /// Merges `temp` into the destination VF through the field mask and
    /// updates MAC flags when the translator asked for them.
    fn finish_result(&mut self, instr: &Instruction, field: u8, temp: Xmm) {
        if instr.dest != Operand::Reg(0) {
            let dest = self.alloc_sse(instr.dest_reg(), RegState::ReadWrite);
            self.set_clamping_reg(dest, false, field);
            self.asm.blendps(field, temp, dest);
        }
        if self.should_update_mac {
            self.update_mac_flags(temp, field);
        }
    }

    pub(crate) fn arith_vectors(&mut self, instr: &Instruction, op: VectorOp) {
        let field = convert_field(instr.field);
        let op1 = self.alloc_sse(instr.source_reg(), RegState::ReadWrite);
        let op2 = self.alloc_sse(instr.source2_reg(), RegState::ReadWrite);
        let temp = Xmm::Xmm0;

        self.clamp_vfreg(field, op1);
        self.clamp_vfreg(field, op2);

        self.asm.movaps_reg(op1, temp);
        match op {
            VectorOp::Add => self.asm.addps(op2, temp),
            VectorOp::Sub => self.asm.subps(op2, temp),
            VectorOp::Mul => self.asm.mulps(op2, temp),
        }
        self.set_clamping_reg(temp, true, field);
        self.clamp_vfreg(field, temp);
        self.finish_result(instr, field, temp);
    }

    pub(crate) fn arith_by_scalar(&mut self, instr: &Instruction, op: VectorOp) {
        let field = convert_field(instr.field);
        let source = self.alloc_sse(instr.source_reg(), RegState::ReadWrite);
        let bc_reg = self.alloc_sse(instr.source2_reg(), RegState::ReadWrite);
        let temp = Xmm::Xmm0;
        let temp2 = Xmm::Xmm1;

        self.clamp_vfreg(field, source);

        self.broadcast(bc_reg, instr.bc, temp);
        self.set_clamping_reg(temp, true, field);
        self.clamp_vfreg(field, temp);

        match op {
            VectorOp::Add => self.asm.addps(source, temp),
            VectorOp::Mul => self.asm.mulps(source, temp),
            VectorOp::Sub => {
                // source - broadcast, so the order flips through temp2.
                self.asm.movaps_reg(source, temp2);
                self.asm.subps(temp, temp2);
                self.asm.movaps_reg(temp2, temp);
            }
        }
        self.set_clamping_reg(temp, true, field);
        self.clamp_vfreg(field, temp);
        self.finish_result(instr, field, temp);
    }

    pub(crate) fn madd_vectors(&mut self, instr: &Instruction) {
        let field = convert_field(instr.field);
        let op1 = self.alloc_sse(instr.source_reg(), RegState::ReadWrite);
        let op2 = self.alloc_sse(instr.source2_reg(), RegState::ReadWrite);
        let acc = self.alloc_sse(VU_REG_ACC, RegState::ReadWrite);
        let temp = Xmm::Xmm0;

        self.clamp_vfreg(field, op1);
        self.clamp_vfreg(field, op2);
        self.clamp_vfreg(field, acc);

        self.asm.movaps_reg(op1, temp);
        self.asm.mulps(op2, temp);
        self.asm.addps(acc, temp);
        self.set_clamping_reg(temp, true, field);
        self.clamp_vfreg(field, temp);
        self.finish_result(instr, field, temp);
    }

    pub(crate) fn madd_acc_and_vectors(&mut self, instr: &Instruction) {
        let field = convert_field(instr.field);
        let op1 = self.alloc_sse(instr.source_reg(), RegState::ReadWrite);
        let op2 = self.alloc_sse(instr.source2_reg(), RegState::ReadWrite);
        let dest = self.alloc_sse(VU_REG_ACC, RegState::ReadWrite);
        let temp = Xmm::Xmm0;

        self.clamp_vfreg(field, op1);
        self.clamp_vfreg(field, op2);
        self.clamp_vfreg(field, dest);

        self.asm.movaps_reg(op1, temp);
        self.asm.mulps(op2, temp);
        if field == 0xF {
            self.asm.addps(temp, dest);
            self.set_clamping_reg(dest, true, field);
            self.clamp_vfreg(field, dest);
            if self.should_update_mac {
                self.update_mac_flags(dest, field);
            }
        } else {
            self.asm.addps(dest, temp);
            self.set_clamping_reg(temp, true, field);
            self.clamp_vfreg(field, temp);
            self.set_clamping_reg(dest, false, field);
            self.asm.blendps(field, temp, dest);
            if self.should_update_mac {
                self.update_mac_flags(temp, field);
            }
        }
    }

    pub(crate) fn madd_by_scalar(&mut self, instr: &Instruction) {
        let field = convert_field(instr.field);
        let temp = Xmm::Xmm0;
        let source = self.alloc_sse(instr.source_reg(), RegState::ReadWrite);
        let bc_reg = self.alloc_sse(instr.source2_reg(), RegState::ReadWrite);
        let acc = self.alloc_sse(VU_REG_ACC, RegState::Read);

        self.clamp_vfreg(field, source);
        self.clamp_vfreg(field, acc);

        self.broadcast(bc_reg, instr.bc, temp);
        self.set_clamping_reg(temp, true, field);
        self.clamp_vfreg(field, temp);

        self.asm.mulps(source, temp);
        self.asm.addps(acc, temp);
        self.set_clamping_reg(temp, true, field);
        self.clamp_vfreg(field, temp);
        self.finish_result(instr, field, temp);
    }

    pub(crate) fn madd_acc_by_scalar(&mut self, instr: &Instruction) {
        let field = convert_field(instr.field);
        let temp = Xmm::Xmm0;
        let bc_reg = self.alloc_sse(instr.source2_reg(), RegState::Read);
        let source = self.alloc_sse(instr.source_reg(), RegState::Read);
        let dest = self.alloc_sse(VU_REG_ACC, RegState::ReadWrite);

        self.clamp_vfreg(field, source);
        self.clamp_vfreg(field, dest);

        self.broadcast(bc_reg, instr.bc, temp);
        self.set_clamping_reg(temp, true, field);
        self.clamp_vfreg(field, temp);

        self.asm.mulps(source, temp);
        if field == 0xF {
            self.asm.addps(temp, dest);
            self.set_clamping_reg(dest, true, field);
            self.clamp_vfreg(field, dest);
        } else {
            self.asm.addps(dest, temp);
            self.set_clamping_reg(temp, true, field);
            self.clamp_vfreg(field, temp);
            self.set_clamping_reg(dest, false, field);
            self.asm.blendps(field, temp, dest);
        }
        if self.should_update_mac {
            self.update_mac_flags(dest, field);
        }
    }

    pub(crate) fn msub_vectors(&mut self, instr: &Instruction) {
        let field = convert_field(instr.field);
        let op1 = self.alloc_sse(instr.source_reg(), RegState::ReadWrite);
        let op2 = self.alloc_sse(instr.source2_reg(), RegState::ReadWrite);
        let acc = self.alloc_sse(VU_REG_ACC, RegState::ReadWrite);
        let temp = Xmm::Xmm0;
        let temp2 = Xmm::Xmm1;

        self.clamp_vfreg(field, op1);
        self.clamp_vfreg(field, op2);
        self.clamp_vfreg(field, acc);

        self.asm.movaps_reg(acc, temp2);
        self.asm.movaps_reg(op1, temp);
        self.asm.mulps(op2, temp);
        self.asm.subps(temp, temp2);
        self.set_clamping_reg(temp2, true, field);
        self.clamp_vfreg(field, temp2);
        self.finish_result(instr, field, temp2);
    }

    pub(crate) fn msub_by_scalar(&mut self, instr: &Instruction) {
        let field = convert_field(instr.field);
        let temp = Xmm::Xmm0;
        let temp2 = Xmm::Xmm1;
        let source = self.alloc_sse(instr.source_reg(), RegState::ReadWrite);
        let bc_reg = self.alloc_sse(instr.source2_reg(), RegState::ReadWrite);
        let acc = self.alloc_sse(VU_REG_ACC, RegState::Read);

        self.clamp_vfreg(field, source);
        self.clamp_vfreg(field, acc);

        self.broadcast(bc_reg, instr.bc, temp);
        self.asm.movaps_reg(acc, temp2);
        self.set_clamping_reg(temp, true, field);
        self.clamp_vfreg(field, temp);

        self.asm.mulps(source, temp);
        self.asm.subps(temp, temp2);
        self.set_clamping_reg(temp2, true, field);
        self.clamp_vfreg(field, temp2);
        self.finish_result(instr, field, temp2);
    }

    pub(crate) fn msub_acc_by_scalar(&mut self, instr: &Instruction) {
        let field = convert_field(instr.field);
        let temp = Xmm::Xmm0;
        let temp2 = Xmm::Xmm1;
        let bc_reg = self.alloc_sse(instr.source2_reg(), RegState::Read);
        let source = self.alloc_sse(instr.source_reg(), RegState::Read);
        let dest = self.alloc_sse(VU_REG_ACC, RegState::ReadWrite);

        self.clamp_vfreg(field, source);
        self.clamp_vfreg(field, dest);

        self.broadcast(bc_reg, instr.bc, temp);
        self.set_clamping_reg(temp, true, field);
        self.clamp_vfreg(field, temp);

        self.asm.mulps(source, temp);
        if field == 0xF {
            self.asm.subps(temp, dest);
            self.set_clamping_reg(dest, true, field);
            self.clamp_vfreg(field, dest);
        } else {
            self.asm.movaps_reg(dest, temp2);
            self.asm.subps(temp, temp2);
            self.set_clamping_reg(temp2, true, field);
            self.clamp_vfreg(field, temp2);
            self.set_clamping_reg(dest, false, field);
            self.asm.blendps(field, temp2, dest);
        }
        if self.should_update_mac {
            self.update_mac_flags(dest, field);
        }
    }

    /// OPMULA: ACC.xyz = fs.yzx * ft.zxy (the outer-product first half).
    pub(crate) fn opmula(&mut self, instr: &Instruction) {
        let reg1 = self.alloc_sse(instr.source_reg(), RegState::Read);
        let reg2 = self.alloc_sse(instr.source2_reg(), RegState::Read);
        let dest = self.alloc_sse(VU_REG_ACC, RegState::ReadWrite);
        let temp = Xmm::Xmm0;
        let temp2 = Xmm::Xmm1;

        self.clamp_vfreg(0x7, reg1);
        self.clamp_vfreg(0x7, reg2);
        self.clamp_vfreg(0x7, dest);

        // xyz -> yzx
        self.asm.pshufd(0x1 | (0x2 << 2), reg1, temp);
        // xyz -> zxy
        self.asm.pshufd(0x2 | (0x1 << 4), reg2, temp2);
        self.asm.mulps(temp2, temp);

        self.set_clamping_reg(temp, true, 0x7);
        self.clamp_vfreg(0x7, temp);
        self.set_clamping_reg(dest, false, 0x7);
        self.asm.blendps(0x7, temp, dest);

        if self.should_update_mac {
            self.update_mac_flags(temp, 0x7);
        }
    }

    /// OPMSUB: fd.xyz = ACC.xyz - fs.yzx * ft.zxy.
    pub(crate) fn opmsub(&mut self, instr: &Instruction) {
        let reg1 = self.alloc_sse(instr.source_reg(), RegState::Read);
        let reg2 = self.alloc_sse(instr.source2_reg(), RegState::Read);
        let acc = self.alloc_sse(VU_REG_ACC, RegState::Read);
        let temp = Xmm::Xmm0;
        let temp2 = Xmm::Xmm1;

        self.clamp_vfreg(0x7, reg1);
        self.clamp_vfreg(0x7, reg2);
        self.clamp_vfreg(0x7, acc);

        self.asm.pshufd(0x1 | (0x2 << 2), reg1, temp);
        self.asm.pshufd(0x2 | (0x1 << 4), reg2, temp2);
        self.asm.mulps(temp2, temp);
        self.asm.movaps_reg(acc, temp2);
        self.asm.subps(temp, temp2);

        self.set_clamping_reg(temp2, true, 0x7);
        self.clamp_vfreg(0x7, temp2);

        if instr.dest != Operand::Reg(0) {
            let dest = self.alloc_sse(instr.dest_reg(), RegState::ReadWrite);
            self.set_clamping_reg(dest, false, 0x7);
            self.asm.blendps(0x7, temp2, dest);
        }
        if self.should_update_mac {
            self.update_mac_flags(temp2, 0x7);
        }
    }

    pub(crate) fn vabs(&mut self, instr: &Instruction) {
        let field = convert_field(instr.field);
        let source = self.alloc_sse(instr.source_reg(), RegState::ReadWrite);
        let dest = self.alloc_sse(instr.dest_reg(), RegState::ReadWrite);
        let temp = Xmm::Xmm0;

        self.sse_abs(source, temp);
        self.asm.blendps(field, temp, dest);
    }

    pub(crate) fn minmax_vectors(&mut self, instr: &Instruction, is_max: bool) {
        let field = convert_field(instr.field);
        let op1 = self.alloc_sse(instr.source_reg(), RegState::ReadWrite);
        let op2 = self.alloc_sse(instr.source2_reg(), RegState::ReadWrite);
        let dest = self.alloc_sse(instr.dest_reg(), RegState::ReadWrite);
        let temp = Xmm::Xmm0;

        // Operand order matters on the host for equal-magnitude inputs.
        self.asm.movaps_reg(op2, temp);
        if is_max {
            self.asm.maxps(op1, temp);
        } else {
            self.asm.minps(op1, temp);
        }
        self.asm.blendps(field, temp, dest);
    }

    pub(crate) fn minmax_by_scalar(&mut self, instr: &Instruction, is_max: bool) {
        let field = convert_field(instr.field);
        let source = self.alloc_sse(instr.source_reg(), RegState::ReadWrite);
        let bc_reg = self.alloc_sse(instr.source2_reg(), RegState::ReadWrite);
        let dest = self.alloc_sse(instr.dest_reg(), RegState::ReadWrite);
        let temp = Xmm::Xmm0;

        self.broadcast(bc_reg, instr.bc, temp);
        if is_max {
            self.asm.maxps(source, temp);
        } else {
            self.asm.minps(source, temp);
        }
        self.asm.blendps(field, temp, dest);
    }

    pub(crate) fn fixed_to_float(&mut self, instr: &Instruction, table_entry: usize) {
        let field = convert_field(instr.field);
        let source = self.alloc_sse(instr.source_reg(), RegState::Read);
        let dest = self.alloc_sse(instr.dest_reg(), RegState::ReadWrite);
        let temp = Xmm::Xmm0;

        if field == 0xF {
            self.asm.cvtdq2ps(source, dest);
            if table_entry != 0 {
                let scale = itof_scale(table_entry);
                let lit = self.asm.block.emit_literal(&scale);
                self.asm.mulps_lit(lit, dest);
            }
            self.set_clamping_reg(dest, true, field);
        } else {
            self.asm.cvtdq2ps(source, temp);
            if table_entry != 0 {
                let scale = itof_scale(table_entry);
                let lit = self.asm.block.emit_literal(&scale);
                self.asm.mulps_lit(lit, temp);
            }
            self.asm.blendps(field, temp, dest);
            self.set_clamping_reg(dest, true, field);
        }
    }

    pub(crate) fn float_to_fixed(&mut self, instr: &Instruction, table_entry: usize) {
        let field = convert_field(instr.field);
        let source = self.alloc_sse(instr.source_reg(), RegState::ReadWrite);
        let dest = self.alloc_sse(instr.dest_reg(), RegState::ReadWrite);
        let temp = Xmm::Xmm0;

        self.clamp_vfreg(field, source);

        self.asm.movaps_reg(source, temp);
        if table_entry != 0 {
            let scale = ftoi_scale(table_entry);
            let lit = self.asm.block.emit_literal(&scale);
            self.asm.mulps_lit(lit, temp);
        }

        if field == 0xF {
            self.asm.cvttps2dq(temp, dest);
        } else {
            self.asm.cvttps2dq(temp, temp);
            self.asm.blendps(field, temp, dest);
        }
    }

    pub(crate) fn move_float(&mut self, instr: &Instruction) {
        let field = convert_field(instr.field);
        let source = self.alloc_sse(instr.source_reg(), RegState::Read);

        if field == 0xF {
            let carries = self.needs_clamping(source, field);
            let dest = self.alloc_sse(instr.dest_reg(), RegState::Write);
            self.asm.movaps_reg(source, dest);
            self.set_clamping_reg(dest, carries, field);
        } else {
            let dest = self.alloc_sse(instr.dest_reg(), RegState::ReadWrite);
            self.asm.blendps(field, source, dest);
            self.set_clamping_reg(dest, true, field);
        }
    }

    pub(crate) fn move_rotated_float(&mut self, instr: &Instruction) {
        let field = convert_field(instr.field);
        let source = self.alloc_sse(instr.source_reg(), RegState::ReadWrite);
        let dest = self.alloc_sse(instr.dest_reg(), RegState::ReadWrite);

        // xyzw <- yzwx
        let rot = 0x1 | (2 << 2) | (3 << 4);
        if field == 0xF {
            let carries = self.needs_clamping(source, 0xF);
            self.asm.pshufd(rot, source, dest);
            self.set_clamping_reg(dest, carries, field);
        } else {
            let temp = Xmm::Xmm0;
            self.asm.pshufd(rot, source, temp);
            self.asm.blendps(field, temp, dest);
            self.set_clamping_reg(dest, true, field);
        }
    }

    pub(crate) fn move_to_int(&mut self, instr: &Instruction) {
        let lane = instr.field;
        let source = self.alloc_sse(instr.source_reg(), RegState::Read);
        let dest = self.alloc_int(instr.dest_reg(), RegState::Write);

        if lane == 0 {
            self.asm.movd_from_xmm(source, dest);
        } else {
            let temp = Xmm::Xmm0;
            self.asm.insertps(lane, 0, 0, source, temp);
            self.asm.movd_from_xmm(temp, dest);
        }
        self.asm.and32_reg_imm(0xFFFF, dest);
    }

    pub(crate) fn move_from_int(&mut self, instr: &Instruction) {
        let field = convert_field(instr.field);
        let source = self.alloc_int(instr.source_reg(), RegState::Read);
        let dest = self.alloc_sse(instr.dest_reg(), RegState::ReadWrite);
        let temp = Xmm::Xmm0;

        // The 16-bit integer is sign extended across the lanes.
        self.asm.movsx16_to_64(source, Reg::Rax);
        self.asm.movd_to_xmm(Reg::Rax, temp);
        self.asm.shufps(0, temp, temp);
        self.asm.blendps(field, temp, dest);
        self.set_clamping_reg(dest, true, field);
    }

    pub(crate) fn move_from_p(&mut self, instr: &Instruction) {
        let field = convert_field(instr.field);
        let dest = self.alloc_sse(instr.dest_reg(), RegState::ReadWrite);
        let p_reg = self.alloc_sse(crate::state::VU_REG_P, RegState::Read);
        let temp = Xmm::Xmm0;

        self.asm.movaps_reg(p_reg, temp);
        self.asm.shufps(0, temp, temp);
        self.asm.blendps(field, temp, dest);
        self.set_clamping_reg(dest, true, field);
    }

    pub(crate) fn backup_vf(&mut self, instr: &Instruction) {
        let vf = self.alloc_sse(instr.source_reg(), RegState::ReadWrite);
        let off = if instr.dest == Operand::Imm(0) {
            offset_of!(VuState, backup_old_vf)
        } else {
            offset_of!(VuState, backup_new_vf)
        };
        self.asm.movaps_to_mem(vf, Reg::R15, off as i32);
    }

    pub(crate) fn restore_vf(&mut self, instr: &Instruction) {
        let vf = self.alloc_sse(instr.source_reg(), RegState::ReadWrite);
        let off = if instr.dest == Operand::Imm(0) {
            offset_of!(VuState, backup_old_vf)
        } else {
            offset_of!(VuState, backup_new_vf)
        };
        self.asm.movaps_from_mem(Reg::R15, vf, off as i32);
    }
}
