//! EE integer ALU lowering.
//!
//! Word-sized operations compute in 32 bits and sign-extend to 64 before
//! the result can be observed, matching the guest's 64-bit-extended
//! register file. Doubleword operations work directly in 64 bits.

use crate::emitter::{ConditionCode, Reg};
use crate::ir::{Instruction, Opcode};
use crate::regalloc::{RegKind, RegState};

use super::EeCore;

impl EeCore {
    pub(crate) fn load_const(&mut self, instr: &Instruction) {
        let dest = self.alloc_int(instr.dest_reg(), RegKind::EeGpr, RegState::Write, None);
        let value = instr.source_imm() as i64;
        if u32::try_from(value).is_ok() {
            self.asm.mov32_reg_imm(value as u32, dest);
        } else {
            self.asm.load_addr(value as u64, dest);
        }
    }

    pub(crate) fn add_word_imm(&mut self, instr: &Instruction) {
        let source = self.alloc_int(instr.source_reg(), RegKind::EeGpr, RegState::Read, None);
        let dest = self.alloc_int(instr.dest_reg(), RegKind::EeGpr, RegState::Write, None);
        self.asm.lea32_m(source, dest, instr.source2_imm() as i32);
        self.asm.movsx32_to_64(dest, dest);
    }

    pub(crate) fn add_word_reg(&mut self, instr: &Instruction) {
        let source = self.alloc_int(instr.source_reg(), RegKind::EeGpr, RegState::Read, None);
        let source2 = self.alloc_int(instr.source2_reg(), RegKind::EeGpr, RegState::Read, None);
        let dest = self.alloc_int(instr.dest_reg(), RegKind::EeGpr, RegState::Write, None);
        self.asm.lea32_reg(source, source2, dest, 0, 0);
        self.asm.movsx32_to_64(dest, dest);
    }

    pub(crate) fn add_doubleword_imm(&mut self, instr: &Instruction) {
        let source = self.alloc_int(instr.source_reg(), RegKind::EeGpr, RegState::Read, None);
        let dest = self.alloc_int(instr.dest_reg(), RegKind::EeGpr, RegState::Write, None);
        self.asm.lea64_m(source, dest, instr.source2_imm() as i32);
    }

    pub(crate) fn add_doubleword_reg(&mut self, instr: &Instruction) {
        let source = self.alloc_int(instr.source_reg(), RegKind::EeGpr, RegState::Read, None);
        let source2 = self.alloc_int(instr.source2_reg(), RegKind::EeGpr, RegState::Read, None);
        let dest = self.alloc_int(instr.dest_reg(), RegKind::EeGpr, RegState::Write, None);
        self.asm.lea64_reg(source, source2, dest, 0, 0);
    }

    pub(crate) fn sub_word_reg(&mut self, instr: &Instruction) {
        let source = self.alloc_int(instr.source_reg(), RegKind::EeGpr, RegState::Read, None);
        let source2 = self.alloc_int(instr.source2_reg(), RegKind::EeGpr, RegState::Read, None);
        let dest = self.alloc_int(instr.dest_reg(), RegKind::EeGpr, RegState::Write, None);
        if dest == source2 {
            // dest = source - dest without a temporary: negate then add.
            self.asm.neg32(dest);
            self.asm.add32_reg(source, dest);
        } else {
            if dest != source {
                self.asm.mov32_reg(source, dest);
            }
            self.asm.sub32_reg(source2, dest);
        }
        self.asm.movsx32_to_64(dest, dest);
    }

    pub(crate) fn sub_doubleword_reg(&mut self, instr: &Instruction) {
        let source = self.alloc_int(instr.source_reg(), RegKind::EeGpr, RegState::Read, None);
        let source2 = self.alloc_int(instr.source2_reg(), RegKind::EeGpr, RegState::Read, None);
        let dest = self.alloc_int(instr.dest_reg(), RegKind::EeGpr, RegState::Write, None);
        if dest == source2 {
            self.asm.neg64(dest);
            self.asm.add64_reg(source, dest);
        } else {
            if dest != source {
                self.asm.mov64_reg(source, dest);
            }
            self.asm.sub64_reg(source2, dest);
        }
    }

    fn logic_reg(&mut self, instr: &Instruction, op: fn(&mut crate::emitter::Emitter, Reg, Reg)) {
        let source = self.alloc_int(instr.source_reg(), RegKind::EeGpr, RegState::Read, None);
        let source2 = self.alloc_int(instr.source2_reg(), RegKind::EeGpr, RegState::Read, None);
        let dest = self.alloc_int(instr.dest_reg(), RegKind::EeGpr, RegState::Write, None);
        if dest == source {
            op(&mut self.asm, source2, dest);
        } else if dest == source2 {
            op(&mut self.asm, source, dest);
        } else {
            self.asm.mov64_reg(source, dest);
            op(&mut self.asm, source2, dest);
        }
    }

    pub(crate) fn and_reg(&mut self, instr: &Instruction) {
        self.logic_reg(instr, crate::emitter::Emitter::and64_reg);
    }

    pub(crate) fn or_reg(&mut self, instr: &Instruction) {
        self.logic_reg(instr, crate::emitter::Emitter::or64_reg);
    }

    pub(crate) fn xor_reg(&mut self, instr: &Instruction) {
        self.logic_reg(instr, crate::emitter::Emitter::xor64_reg);
    }

    pub(crate) fn nor_reg(&mut self, instr: &Instruction) {
        self.logic_reg(instr, crate::emitter::Emitter::or64_reg);
        let dest = self.alloc_int(instr.dest_reg(), RegKind::EeGpr, RegState::ReadWrite, None);
        self.asm.not64(dest);
    }

    fn logic_imm(
        &mut self,
        instr: &Instruction,
        op: fn(&mut crate::emitter::Emitter, u32, Reg),
    ) {
        let source = self.alloc_int(instr.source_reg(), RegKind::EeGpr, RegState::Read, None);
        let dest = self.alloc_int(instr.dest_reg(), RegKind::EeGpr, RegState::Write, None);
        if dest != source {
            self.asm.mov64_reg(source, dest);
        }
        op(&mut self.asm, instr.source2_imm() as u32, dest);
    }

    pub(crate) fn and_imm(&mut self, instr: &Instruction) {
        // The immediate is zero-extended 16 bits, so the AND also clears
        // bits 32-63; a 32-bit AND zero-extends for free.
        self.logic_imm(instr, crate::emitter::Emitter::and32_reg_imm);
    }

    pub(crate) fn or_imm(&mut self, instr: &Instruction) {
        // OR with a zero-extended immediate leaves the upper half intact,
        // so this one has to stay 64-bit clean: the 32-bit form would
        // clear bits 32-63.
        let source = self.alloc_int(instr.source_reg(), RegKind::EeGpr, RegState::Read, None);
        let dest = self.alloc_int(instr.dest_reg(), RegKind::EeGpr, RegState::Write, None);
        if dest != source {
            self.asm.mov64_reg(source, dest);
        }
        let scratch = self.lalloc_int(0, RegKind::Scratch, RegState::Scratchpad, None);
        self.asm.mov32_reg_imm(instr.source2_imm() as u32, scratch);
        self.asm.or64_reg(scratch, dest);
        self.free_int(scratch);
    }

    pub(crate) fn xor_imm(&mut self, instr: &Instruction) {
        let source = self.alloc_int(instr.source_reg(), RegKind::EeGpr, RegState::Read, None);
        let dest = self.alloc_int(instr.dest_reg(), RegKind::EeGpr, RegState::Write, None);
        if dest != source {
            self.asm.mov64_reg(source, dest);
        }
        let scratch = self.lalloc_int(0, RegKind::Scratch, RegState::Scratchpad, None);
        self.asm.mov32_reg_imm(instr.source2_imm() as u32, scratch);
        self.asm.xor64_reg(scratch, dest);
        self.free_int(scratch);
    }

    pub(crate) fn clear_reg(&mut self, instr: &Instruction) {
        let dest = self.alloc_int(instr.dest_reg(), RegKind::EeGpr, RegState::Write, None);
        self.asm.xor32_reg(dest, dest);
    }

    pub(crate) fn negate_word_reg(&mut self, instr: &Instruction) {
        let source = self.alloc_int(instr.source_reg(), RegKind::EeGpr, RegState::Read, None);
        let dest = self.alloc_int(instr.dest_reg(), RegKind::EeGpr, RegState::Write, None);
        if dest != source {
            self.asm.mov32_reg(source, dest);
        }
        self.asm.neg32(dest);
        self.asm.movsx32_to_64(dest, dest);
    }

    pub(crate) fn negate_doubleword_reg(&mut self, instr: &Instruction) {
        let source = self.alloc_int(instr.source_reg(), RegKind::EeGpr, RegState::Read, None);
        let dest = self.alloc_int(instr.dest_reg(), RegKind::EeGpr, RegState::Write, None);
        if dest != source {
            self.asm.mov64_reg(source, dest);
        }
        self.asm.neg64(dest);
    }

    pub(crate) fn set_on_less_than(
        &mut self,
        instr: &Instruction,
        cc: ConditionCode,
        imm_form: bool,
    ) {
        let op1 = self.alloc_int(instr.source_reg(), RegKind::EeGpr, RegState::Read, None);
        if imm_form {
            self.asm.cmp64_imm(instr.source2_imm() as u32, op1);
        } else {
            let op2 = self.alloc_int(instr.source2_reg(), RegKind::EeGpr, RegState::Read, None);
            self.asm.cmp64_reg(op2, op1);
        }
        let dest = self.alloc_int(instr.dest_reg(), RegKind::EeGpr, RegState::Write, None);
        self.asm.setcc_reg(cc, Reg::Rax);
        self.asm.movzx8_to_64(Reg::Rax, dest);
    }

    pub(crate) fn shift_imm(&mut self, instr: &Instruction) {
        let source = self.alloc_int(instr.source_reg(), RegKind::EeGpr, RegState::Read, None);
        let dest = self.alloc_int(instr.dest_reg(), RegKind::EeGpr, RegState::Write, None);
        let amount = instr.source2_imm() as u8;
        let word = matches!(
            instr.op,
            Opcode::ShiftLeftLogical | Opcode::ShiftRightLogical | Opcode::ShiftRightArithmetic
        );
        if dest != source {
            self.asm.mov64_reg(source, dest);
        }
        match instr.op {
            Opcode::ShiftLeftLogical => self.asm.shl32_reg_imm(amount, dest),
            Opcode::ShiftRightLogical => self.asm.shr32_reg_imm(amount, dest),
            Opcode::ShiftRightArithmetic => self.asm.sar32_reg_imm(amount, dest),
            Opcode::DoublewordShiftLeftLogical => self.asm.shl64_reg_imm(amount, dest),
            Opcode::DoublewordShiftRightLogical => self.asm.shr64_reg_imm(amount, dest),
            Opcode::DoublewordShiftRightArithmetic => self.asm.sar64_reg_imm(amount, dest),
            _ => unreachable!(),
        }
        if word {
            self.asm.movsx32_to_64(dest, dest);
        }
    }

    pub(crate) fn shift_variable(&mut self, instr: &Instruction) {
        // The shift count must end up in CL; reserve RCX before any other
        // allocation can take it.
        let rcx = self.lalloc_int(0, RegKind::Scratch, RegState::Scratchpad, Some(Reg::Rcx));
        let source = self.alloc_int(instr.source_reg(), RegKind::EeGpr, RegState::Read, None);
        let count = self.alloc_int(instr.source2_reg(), RegKind::EeGpr, RegState::Read, None);
        let dest = self.alloc_int(instr.dest_reg(), RegKind::EeGpr, RegState::Write, None);
        self.asm.mov32_reg(count, Reg::Rcx);
        let word = matches!(
            instr.op,
            Opcode::ShiftLeftLogicalVariable
                | Opcode::ShiftRightLogicalVariable
                | Opcode::ShiftRightArithmeticVariable
        );
        if dest != source {
            self.asm.mov64_reg(source, dest);
        }
        // Hardware masks the count (5 or 6 bits) exactly like the guest.
        match instr.op {
            Opcode::ShiftLeftLogicalVariable => self.asm.shl32_cl(dest),
            Opcode::ShiftRightLogicalVariable => self.asm.shr32_cl(dest),
            Opcode::ShiftRightArithmeticVariable => self.asm.sar32_cl(dest),
            Opcode::DoublewordShiftLeftLogicalVariable => self.asm.shl64_cl(dest),
            Opcode::DoublewordShiftRightLogicalVariable => self.asm.shr64_cl(dest),
            Opcode::DoublewordShiftRightArithmeticVariable => self.asm.sar64_cl(dest),
            _ => unreachable!(),
        }
        if word {
            self.asm.movsx32_to_64(dest, dest);
        }
        self.free_int(rcx);
    }

    pub(crate) fn move_conditional(&mut self, instr: &Instruction, cc: ConditionCode) {
        let source = self.alloc_int(instr.source_reg(), RegKind::EeGpr, RegState::Read, None);
        let cond = self.alloc_int(instr.source2_reg(), RegKind::EeGpr, RegState::Read, None);
        let dest = self.alloc_int(instr.dest_reg(), RegKind::EeGpr, RegState::ReadWrite, None);
        self.asm.test64_reg(cond, cond);
        self.asm.cmovcc64_reg(cc, source, dest);
    }

    pub(crate) fn move_doubleword(&mut self, instr: &Instruction) {
        let source = self.alloc_int(instr.source_reg(), RegKind::EeGpr, RegState::Read, None);
        let dest = self.alloc_int(instr.dest_reg(), RegKind::EeGpr, RegState::Write, None);
        if dest != source {
            self.asm.mov64_reg(source, dest);
        }
    }

    pub(crate) fn multiply_word(&mut self, instr: &Instruction, signed: bool, pipe1: bool) {
        let (lo, hi) = Self::lo_hi_regs(pipe1);
        let rdx = self.lalloc_int(0, RegKind::Scratch, RegState::Scratchpad, Some(Reg::Rdx));
        let source = self.alloc_int(instr.source_reg(), RegKind::EeGpr, RegState::Read, None);
        let source2 = self.alloc_int(instr.source2_reg(), RegKind::EeGpr, RegState::Read, None);
        let lo_reg = self.alloc_int(lo, RegKind::EeGpr, RegState::Write, None);
        let hi_reg = self.alloc_int(hi, RegKind::EeGpr, RegState::Write, None);

        self.asm.mov32_reg(source, Reg::Rax);
        if signed {
            self.asm.imul32(source2);
        } else {
            self.asm.mul32(source2);
        }
        self.asm.movsx32_to_64(Reg::Rax, Reg::Rax);
        self.asm.movsx32_to_64(Reg::Rdx, Reg::Rdx);
        self.asm.mov64_reg(Reg::Rax, lo_reg);
        self.asm.mov64_reg(Reg::Rdx, hi_reg);
        self.free_int(rdx);

        // The three-operand MULT writes LO into rd as well.
        if instr.dest_reg() != 0 {
            let dest = self.alloc_int(instr.dest_reg(), RegKind::EeGpr, RegState::Write, None);
            let lo_reg = self.alloc_int(lo, RegKind::EeGpr, RegState::Read, None);
            if dest != lo_reg {
                self.asm.mov64_reg(lo_reg, dest);
            }
        }
    }

    pub(crate) fn divide_word(&mut self, instr: &Instruction, pipe1: bool) {
        let (lo, hi) = Self::lo_hi_regs(pipe1);
        let rdx = self.lalloc_int(0, RegKind::Scratch, RegState::Scratchpad, Some(Reg::Rdx));
        let dividend = self.alloc_int(instr.source_reg(), RegKind::EeGpr, RegState::Read, None);
        let divisor = self.alloc_int(instr.source2_reg(), RegKind::EeGpr, RegState::Read, None);
        let lo_reg = self.alloc_int(lo, RegKind::EeGpr, RegState::Write, None);
        let hi_reg = self.alloc_int(hi, RegKind::EeGpr, RegState::Write, None);

        // Overflow case: INT_MIN / -1 is architecturally defined on the
        // guest (LO = 0x80000000, HI = 0) but faults on the host.
        self.asm.cmp32_imm(0x8000_0000, dividend);
        let not_min = self.asm.jcc_near_deferred(crate::emitter::ConditionCode::Ne);
        self.asm.cmp32_imm(0xFFFF_FFFF, divisor);
        let not_neg1 = self.asm.jcc_near_deferred(crate::emitter::ConditionCode::Ne);
        self.asm.load_addr(0x8000_0000u32 as i32 as i64 as u64, lo_reg);
        self.asm.xor32_reg(hi_reg, hi_reg);
        let done_overflow = self.asm.jmp_near_deferred();

        // Divide-by-zero case: LO = 1 or -1 by dividend sign, HI = dividend.
        self.asm.set_jump_dest(not_min);
        self.asm.set_jump_dest(not_neg1);
        self.asm.test32_reg(divisor, divisor);
        let nonzero = self.asm.jcc_near_deferred(crate::emitter::ConditionCode::Ne);
        self.asm.test32_reg(dividend, dividend);
        self.asm.setcc_reg(crate::emitter::ConditionCode::S, Reg::Rax);
        self.asm.shl8_reg_1(Reg::Rax);
        self.asm.dec8(Reg::Rax);
        self.asm.movsx8_to_64(Reg::Rax, lo_reg);
        self.asm.movsx32_to_64(dividend, hi_reg);
        let done_zero = self.asm.jmp_near_deferred();

        // Plain divide.
        self.asm.set_jump_dest(nonzero);
        self.asm.mov32_reg(dividend, Reg::Rax);
        self.asm.cdq();
        self.asm.idiv32(divisor);
        self.asm.movsx32_to_64(Reg::Rax, lo_reg);
        self.asm.movsx32_to_64(Reg::Rdx, hi_reg);

        self.asm.set_jump_dest(done_overflow);
        self.asm.set_jump_dest(done_zero);
        self.free_int(rdx);
    }

    pub(crate) fn divide_unsigned_word(&mut self, instr: &Instruction, pipe1: bool) {
        let (lo, hi) = Self::lo_hi_regs(pipe1);
        let rdx = self.lalloc_int(0, RegKind::Scratch, RegState::Scratchpad, Some(Reg::Rdx));
        let dividend = self.alloc_int(instr.source_reg(), RegKind::EeGpr, RegState::Read, None);
        let divisor = self.alloc_int(instr.source2_reg(), RegKind::EeGpr, RegState::Read, None);
        let lo_reg = self.alloc_int(lo, RegKind::EeGpr, RegState::Write, None);
        let hi_reg = self.alloc_int(hi, RegKind::EeGpr, RegState::Write, None);

        self.asm.test32_reg(divisor, divisor);
        let zero = self.asm.jcc_near_deferred(crate::emitter::ConditionCode::E);
        self.asm.mov32_reg(dividend, Reg::Rax);
        self.asm.xor32_reg(Reg::Rdx, Reg::Rdx);
        self.asm.div32(divisor);
        self.asm.movsx32_to_64(Reg::Rax, lo_reg);
        self.asm.movsx32_to_64(Reg::Rdx, hi_reg);
        let done = self.asm.jmp_near_deferred();

        self.asm.set_jump_dest(zero);
        self.asm.movsx32_to_64(dividend, hi_reg);
        self.asm.load_addr(u64::MAX, lo_reg);

        self.asm.set_jump_dest(done);
        self.free_int(rdx);
    }

    fn lo_hi_regs(pipe1: bool) -> (u16, u16) {
        use crate::state::{EE_REG_HI, EE_REG_HI1, EE_REG_LO, EE_REG_LO1};
        if pipe1 {
            (EE_REG_LO1, EE_REG_HI1)
        } else {
            (EE_REG_LO, EE_REG_HI)
        }
    }
}
