//! EE branch and jump lowering.
//!
//! Conditional branches select between the taken and fall-through PCs with
//! a single CMOV across the compare's flags, then store the winner into
//! guest PC. "Likely" variants additionally latch the compare result into
//! `branch_on` so the block tail can skip the delay slot when the branch
//! fails.

use crate::emitter::{ConditionCode, Reg};
use crate::ir::Instruction;
use crate::regalloc::{RegKind, RegState};

use super::{off_branch_on, off_fpu_condition, off_pc, EeCore};

impl EeCore {
    pub(crate) fn branch_compare(&mut self, instr: &Instruction, cc: ConditionCode) {
        let op1 = self.alloc_int(instr.source_reg(), RegKind::EeGpr, RegState::Read, None);
        let op2 = self.alloc_int(instr.source2_reg(), RegKind::EeGpr, RegState::Read, None);
        let scratch = self.lalloc_int(0, RegKind::Scratch, RegState::Scratchpad, None);

        // The link variants write RA before the compare result is
        // consumed; RA is never a branch operand.
        self.emit_link(instr);

        self.asm.mov32_reg_imm(instr.jump_fail_dest, Reg::Rax);
        self.asm.mov32_reg_imm(instr.jump_dest, scratch);
        self.asm.cmp64_reg(op2, op1);
        self.asm.cmovcc32_reg(cc, scratch, Reg::Rax);
        self.asm.mov32_to_mem(Reg::Rax, Reg::R15, off_pc());
        if instr.is_likely {
            self.likely_branch = true;
            self.asm.setcc_mem(cc, Reg::R15, off_branch_on());
        }
        self.free_int(scratch);
    }

    pub(crate) fn branch_zero(&mut self, instr: &Instruction, cc: ConditionCode) {
        let op1 = self.alloc_int(instr.source_reg(), RegKind::EeGpr, RegState::Read, None);
        let scratch = self.lalloc_int(0, RegKind::Scratch, RegState::Scratchpad, None);
        self.emit_link(instr);

        self.asm.mov32_reg_imm(instr.jump_fail_dest, Reg::Rax);
        self.asm.mov32_reg_imm(instr.jump_dest, scratch);
        // Compare against zero so the signed predicates (G/LE) are usable
        // alongside the plain sign tests.
        self.asm.cmp64_imm(0, op1);
        self.asm.cmovcc32_reg(cc, scratch, Reg::Rax);
        self.asm.mov32_to_mem(Reg::Rax, Reg::R15, off_pc());
        if instr.is_likely {
            self.likely_branch = true;
            self.asm.setcc_mem(cc, Reg::R15, off_branch_on());
        }
        self.free_int(scratch);
    }

    pub(crate) fn branch_cop1(&mut self, instr: &Instruction) {
        let scratch = self.lalloc_int(0, RegKind::Scratch, RegState::Scratchpad, None);
        let cond = self.lalloc_int(0, RegKind::Scratch, RegState::Scratchpad, None);
        self.asm.mov32_reg_imm(instr.jump_fail_dest, Reg::Rax);
        self.asm.mov32_reg_imm(instr.jump_dest, scratch);
        // Branch taken when the FPU condition flag matches the encoding's
        // true/false selector.
        self.asm.movzx8_from_mem(Reg::R15, cond, off_fpu_condition());
        self.asm.cmp32_imm(u32::from(instr.field), cond);
        self.asm.cmovcc32_reg(ConditionCode::E, scratch, Reg::Rax);
        self.asm.mov32_to_mem(Reg::Rax, Reg::R15, off_pc());
        if instr.is_likely {
            self.likely_branch = true;
            self.asm.setcc_mem(ConditionCode::E, Reg::R15, off_branch_on());
        }
        self.free_int(cond);
        self.free_int(scratch);
    }

    pub(crate) fn jump(&mut self, instr: &Instruction) {
        self.asm.mov32_imm_mem(instr.jump_dest, Reg::R15, off_pc());
        self.emit_link(instr);
    }

    pub(crate) fn jump_indirect(&mut self, instr: &Instruction) {
        let target = self.alloc_int(instr.source_reg(), RegKind::EeGpr, RegState::Read, None);
        self.asm.mov32_to_mem(target, Reg::R15, off_pc());
        self.emit_link(instr);
    }

    /// Writes the return address into the link register (RA for the plain
    /// link forms, `rd` for JALR). Link addresses sign-extend like every
    /// other word result.
    fn emit_link(&mut self, instr: &Instruction) {
        if !instr.is_link {
            return;
        }
        let link_reg = match instr.dest {
            crate::ir::Operand::Reg(rd) if rd != 0 => rd,
            _ => return,
        };
        let dest = self.alloc_int(link_reg, RegKind::EeGpr, RegState::Write, None);
        self.asm.mov32_reg_imm(instr.return_addr, dest);
        self.asm.movsx32_to_64(dest, dest);
    }
}
