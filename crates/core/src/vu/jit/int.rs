//! VU integer lowering: VI arithmetic, data-memory access, branches and
//! jumps.
//!
//! Data memory wraps at `mem_mask`; every address computation shifts the
//! quadword index left by four and masks. Branch targets are written to
//! the core's delay registers; the delay slot's block resolves them
//! through `MoveDelayedBranch` and the branch epilogue.

use std::mem::offset_of;

use crate::emitter::{ConditionCode, Reg, Xmm};
use crate::ir::Instruction;
use crate::regalloc::RegState;
use crate::state::VuState;

use super::{convert_field, off_rt, VuCore, VuRunScratch};

impl VuCore {
    pub(crate) fn load_const(&mut self, instr: &Instruction) {
        let dest = self.alloc_int(instr.dest_reg(), RegState::Write);
        self.asm
            .mov32_reg_imm(instr.source_imm() as u32 & 0xFFFF, dest);
    }

    pub(crate) fn load_float_const(&mut self, instr: &Instruction) {
        // Only the special registers (I in practice) take float immediates.
        assert!(
            instr.dest_reg() >= 33,
            "[VU JIT] unrecognized vf{} in load_float_const",
            instr.dest_reg()
        );
        let dest = self.alloc_sse(instr.dest_reg(), RegState::Write);
        self.asm.load_addr(instr.source_imm(), Reg::Rax);
        self.asm.movd_to_xmm(Reg::Rax, dest);
        self.set_clamping_reg(dest, true, 0xF);
        self.clamp_vfreg(0xF, dest);
    }

    /// Leaves the wrapped byte address of `(base << 4) + imm` in RAX and
    /// the data-memory pointer for it in RSI.
    fn data_addr(&mut self, base: u16, imm: i32, field_offset: i32) {
        let base_reg = self.alloc_int(base, RegState::Read);
        self.asm.movzx16_to_64(base_reg, Reg::Rax);
        self.asm.shl32_reg_imm(4, Reg::Rax);
        if imm != 0 {
            self.asm.add32_reg_imm(imm as u32, Reg::Rax);
        }
        self.asm.and32_reg_imm(u32::from(self.mem_mask), Reg::Rax);
        self.asm
            .mov64_from_mem(Reg::R15, Reg::Rsi, offset_of!(VuState, data_mem) as i32);
        self.asm.add64_reg(Reg::Rax, Reg::Rsi);
        if field_offset != 0 {
            self.asm.add64_reg_imm(field_offset as u32, Reg::Rsi);
        }
    }

    /// Data-memory pointer for a fixed offset, in RSI.
    fn data_addr_fixed(&mut self, offset: u16) {
        self.asm
            .mov64_from_mem(Reg::R15, Reg::Rsi, offset_of!(VuState, data_mem) as i32);
        if offset != 0 {
            self.asm.add64_reg_imm(u32::from(offset), Reg::Rsi);
        }
    }

    pub(crate) fn load_int(&mut self, instr: &Instruction) {
        let field = convert_field(instr.field);
        let field_offset = match field {
            f if f & 0x8 != 0 => 12,
            f if f & 0x4 != 0 => 8,
            f if f & 0x2 != 0 => 4,
            _ => 0,
        };

        if instr.base != 0 {
            // Base must load before the destination in case they alias.
            self.data_addr(instr.base, instr.source_imm() as i32, field_offset);
            let dest = self.alloc_int(instr.dest_reg(), RegState::Write);
            self.asm.movzx16_from_mem(Reg::Rsi, dest, 0);
        } else {
            let dest = self.alloc_int(instr.dest_reg(), RegState::Write);
            let offset =
                (instr.source_imm() as u16).wrapping_add(field_offset as u16) & self.mem_mask;
            self.data_addr_fixed(offset);
            self.asm.movzx16_from_mem(Reg::Rsi, dest, 0);
        }
    }

    pub(crate) fn store_int(&mut self, instr: &Instruction) {
        let field = convert_field(instr.field);
        let source = self.alloc_int(instr.source_reg(), RegState::Read);

        if instr.base != 0 {
            self.data_addr(instr.base, instr.source2_imm() as i32, 0);
        } else {
            let offset = instr.source2_imm() as u16 & self.mem_mask;
            self.data_addr_fixed(offset);
        }

        let temp = Xmm::Xmm0;
        let temp2 = Xmm::Xmm1;
        // Splat the zero-extended VI value into the enabled lanes of the
        // quadword in memory.
        self.asm.movaps_from_mem(Reg::Rsi, temp, 0);
        self.asm.movzx16_to_64(source, Reg::Rax);
        self.asm.movd_to_xmm(Reg::Rax, temp2);
        self.asm.shufps(0, temp2, temp2);
        self.asm.blendps(field, temp2, temp);
        self.asm.movaps_to_mem(temp, Reg::Rsi, 0);
    }

    fn load_quad_common(&mut self, instr: &Instruction, field: u8) {
        if field == 0xF {
            let dest = self.alloc_sse(instr.dest_reg(), RegState::Write);
            self.asm.movaps_from_mem(Reg::Rsi, dest, 0);
            self.set_clamping_reg(dest, true, 0xF);
        } else {
            let temp = Xmm::Xmm0;
            let dest = self.alloc_sse(instr.dest_reg(), RegState::ReadWrite);
            self.asm.movaps_from_mem(Reg::Rsi, temp, 0);
            self.asm.blendps(field, temp, dest);
            self.set_clamping_reg(dest, true, field);
        }
    }

    fn store_quad_common(&mut self, source: Xmm, field: u8) {
        if field == 0xF {
            self.asm.movaps_to_mem(source, Reg::Rsi, 0);
        } else {
            let temp = Xmm::Xmm0;
            self.asm.movaps_from_mem(Reg::Rsi, temp, 0);
            self.asm.blendps(field, source, temp);
            self.asm.movaps_to_mem(temp, Reg::Rsi, 0);
        }
    }

    pub(crate) fn load_quad(&mut self, instr: &Instruction) {
        let field = convert_field(instr.field);
        if instr.base != 0 {
            self.data_addr(instr.base, instr.source_imm() as i32, 0);
        } else {
            self.data_addr_fixed(instr.source_imm() as u16 & self.mem_mask);
        }
        self.load_quad_common(instr, field);
    }

    pub(crate) fn store_quad(&mut self, instr: &Instruction) {
        let field = convert_field(instr.field);
        let source = self.alloc_sse(instr.source_reg(), RegState::Read);
        if instr.base != 0 {
            self.data_addr(instr.base, instr.source2_imm() as i32, 0);
        } else {
            self.data_addr_fixed(instr.source2_imm() as u16 & self.mem_mask);
        }
        self.store_quad_common(source, field);
    }

    pub(crate) fn load_quad_inc(&mut self, instr: &Instruction) {
        let field = convert_field(instr.field);
        let base = self.alloc_int(instr.base, RegState::ReadWrite);
        self.data_addr(instr.base, 0, 0);
        self.load_quad_common(instr, field);
        if instr.base != 0 {
            self.asm.inc16(base);
        }
    }

    pub(crate) fn store_quad_inc(&mut self, instr: &Instruction) {
        let field = convert_field(instr.field);
        let source = self.alloc_sse(instr.source_reg(), RegState::Read);
        let base = self.alloc_int(instr.base, RegState::ReadWrite);
        self.data_addr(instr.base, 0, 0);
        self.store_quad_common(source, field);
        if instr.base != 0 {
            self.asm.inc16(base);
        }
    }

    pub(crate) fn load_quad_dec(&mut self, instr: &Instruction) {
        let field = convert_field(instr.field);
        let base = self.alloc_int(instr.base, RegState::ReadWrite);
        if instr.base != 0 {
            self.asm.dec16(base);
        }
        self.data_addr(instr.base, 0, 0);
        self.load_quad_common(instr, field);
    }

    pub(crate) fn store_quad_dec(&mut self, instr: &Instruction) {
        let field = convert_field(instr.field);
        let source = self.alloc_sse(instr.source_reg(), RegState::Read);
        let base = self.alloc_int(instr.base, RegState::ReadWrite);
        if instr.base != 0 {
            self.asm.dec16(base);
        }
        self.data_addr(instr.base, 0, 0);
        self.store_quad_common(source, field);
    }

    pub(crate) fn move_int_reg(&mut self, instr: &Instruction) {
        let dest = self.alloc_int(instr.dest_reg(), RegState::Write);
        let source = self.alloc_int(instr.source_reg(), RegState::Read);
        self.asm.mov16_reg(source, dest);
    }

    // --- VI ALU ---------------------------------------------------------

    fn int_binop(
        &mut self,
        instr: &Instruction,
        op: fn(&mut crate::emitter::Emitter, Reg, Reg),
    ) {
        let source = self.alloc_int(instr.source_reg(), RegState::Read);
        let source2 = self.alloc_int(instr.source2_reg(), RegState::Read);
        let dest = self.alloc_int(instr.dest_reg(), RegState::ReadWrite);
        if dest == source {
            op(&mut self.asm, source2, dest);
        } else if dest == source2 {
            op(&mut self.asm, source, dest);
        } else {
            self.asm.mov16_reg(source, dest);
            op(&mut self.asm, source2, dest);
        }
    }

    pub(crate) fn and_int(&mut self, instr: &Instruction) {
        self.int_binop(instr, crate::emitter::Emitter::and16_reg);
    }

    pub(crate) fn or_int(&mut self, instr: &Instruction) {
        self.int_binop(instr, crate::emitter::Emitter::or16_reg);
    }

    pub(crate) fn add_int_reg(&mut self, instr: &Instruction) {
        self.int_binop(instr, crate::emitter::Emitter::add16_reg);
    }

    pub(crate) fn sub_int_reg(&mut self, instr: &Instruction) {
        let source = self.alloc_int(instr.source_reg(), RegState::Read);
        let source2 = self.alloc_int(instr.source2_reg(), RegState::Read);
        let dest = self.alloc_int(instr.dest_reg(), RegState::ReadWrite);
        if dest == source2 && dest != source {
            // dest = source - dest
            self.asm.mov16_reg(source2, Reg::Rax);
            self.asm.mov16_reg(source, dest);
            self.asm.sub16_reg(Reg::Rax, dest);
        } else if dest == source && dest == source2 {
            self.asm.xor32_reg(dest, dest);
        } else {
            if dest != source {
                self.asm.mov16_reg(source, dest);
            }
            self.asm.sub16_reg(source2, dest);
        }
    }

    pub(crate) fn add_unsigned_imm(&mut self, instr: &Instruction) {
        let source = self.alloc_int(instr.source_reg(), RegState::Read);
        let dest = self.alloc_int(instr.dest_reg(), RegState::Write);
        if dest != source {
            self.asm.mov16_reg(source, dest);
        }
        self.asm
            .add16_reg_imm(instr.source2_imm() as u16, dest);
    }

    pub(crate) fn sub_unsigned_imm(&mut self, instr: &Instruction) {
        let source = self.alloc_int(instr.source_reg(), RegState::Read);
        let dest = self.alloc_int(instr.dest_reg(), RegState::Write);
        if dest != source {
            self.asm.mov16_reg(source, dest);
        }
        self.asm
            .sub16_reg_imm(instr.source2_imm() as u16, dest);
    }

    // --- jumps ----------------------------------------------------------

    pub(crate) fn jump(&mut self, instr: &Instruction) {
        self.asm.mov16_imm_mem(
            instr.jump_dest as u16,
            Reg::R14,
            off_rt(offset_of!(VuRunScratch, branch_delay_dest)),
        );
        self.asm.mov8_imm_mem(
            1,
            Reg::R15,
            offset_of!(VuState, branch_on_delay) as i32,
        );
        self.vu_branch = true;
    }

    /// Writes the link register. A jump in a branch delay slot (`bc` set)
    /// must link past the earlier branch's destination when that branch
    /// was taken.
    fn write_link(&mut self, instr: &Instruction) {
        let link = self.alloc_int(instr.dest_reg(), RegState::Write);
        if instr.bc != 0 {
            self.asm.mov8_from_mem(
                Reg::R15,
                Reg::Rax,
                offset_of!(VuState, branch_on) as i32,
            );
            self.asm.test8_reg(Reg::Rax, Reg::Rax);
            let not_taken = self.asm.jcc_near_deferred(ConditionCode::E);
            self.asm.mov16_from_mem(
                Reg::R14,
                link,
                off_rt(offset_of!(VuRunScratch, branch_dest)),
            );
            self.asm.add16_reg_imm(8, link);
            self.asm.shr16_reg_imm(3, link);
            let done = self.asm.jmp_near_deferred();
            self.asm.set_jump_dest(not_taken);
            self.asm.mov16_reg_imm(instr.return_addr as u16, link);
            self.asm.set_jump_dest(done);
        } else {
            self.asm.mov16_reg_imm(instr.return_addr as u16, link);
        }
    }

    pub(crate) fn jump_and_link(&mut self, instr: &Instruction) {
        self.asm.mov16_imm_mem(
            instr.jump_dest as u16,
            Reg::R14,
            off_rt(offset_of!(VuRunScratch, branch_delay_dest)),
        );
        self.asm.mov8_imm_mem(
            1,
            Reg::R15,
            offset_of!(VuState, branch_on_delay) as i32,
        );
        self.write_link(instr);
        self.vu_branch = true;
    }

    pub(crate) fn jump_indirect(&mut self, instr: &Instruction) {
        let target = self.alloc_int(instr.source_reg(), RegState::Read);
        self.asm.mov16_reg(target, Reg::Rax);
        // Instruction index to byte address, wrapped.
        self.asm.shl16_reg_imm(3, Reg::Rax);
        self.asm.and16_reg_imm(self.mem_mask, Reg::Rax);
        self.asm.mov16_to_mem(
            Reg::Rax,
            Reg::R14,
            off_rt(offset_of!(VuRunScratch, branch_delay_dest)),
        );
        self.asm.mov8_imm_mem(
            1,
            Reg::R15,
            offset_of!(VuState, branch_on_delay) as i32,
        );
        self.vu_branch = true;
    }

    pub(crate) fn jump_and_link_indirect(&mut self, instr: &Instruction) {
        let target = self.alloc_int(instr.source_reg(), RegState::Read);
        self.asm.mov16_reg(target, Reg::Rax);
        self.asm.shl16_reg_imm(3, Reg::Rax);
        self.asm.and16_reg_imm(self.mem_mask, Reg::Rax);
        self.asm.mov16_to_mem(
            Reg::Rax,
            Reg::R14,
            off_rt(offset_of!(VuRunScratch, branch_delay_dest)),
        );
        self.asm.mov8_imm_mem(
            1,
            Reg::R15,
            offset_of!(VuState, branch_on_delay) as i32,
        );
        self.write_link(instr);
        self.vu_branch = true;
    }

    // --- conditional branches -------------------------------------------

    /// Stores both destinations for the delay slot to resolve. A branch in
    /// a delay slot (`bc` set) inherits the earlier branch's resolved
    /// destination as its fall-through.
    fn handle_branch_destinations(&mut self, instr: &Instruction) {
        self.asm.mov16_imm_mem(
            instr.jump_dest as u16,
            Reg::R14,
            off_rt(offset_of!(VuRunScratch, branch_delay_dest)),
        );

        if instr.bc != 0 {
            self.asm.mov8_from_mem(
                Reg::R15,
                Reg::Rax,
                offset_of!(VuState, branch_on) as i32,
            );
            self.asm.test8_reg(Reg::Rax, Reg::Rax);
            let not_taken = self.asm.jcc_near_deferred(ConditionCode::E);
            self.asm.mov16_from_mem(
                Reg::R14,
                Reg::Rdi,
                off_rt(offset_of!(VuRunScratch, branch_dest)),
            );
            self.asm.add16_reg_imm(8, Reg::Rdi);
            self.asm.mov16_to_mem(
                Reg::Rdi,
                Reg::R14,
                off_rt(offset_of!(VuRunScratch, branch_delay_fail_dest)),
            );
            let done = self.asm.jmp_near_deferred();
            self.asm.set_jump_dest(not_taken);
            self.asm.mov16_imm_mem(
                instr.jump_fail_dest as u16,
                Reg::R14,
                off_rt(offset_of!(VuRunScratch, branch_delay_fail_dest)),
            );
            self.asm.set_jump_dest(done);
        } else {
            self.asm.mov16_imm_mem(
                instr.jump_fail_dest as u16,
                Reg::R14,
                off_rt(offset_of!(VuRunScratch, branch_delay_fail_dest)),
            );
        }
    }

    /// IBxx: evaluate the condition into `branch_on_delay`. When the
    /// analysis flagged `use_backup_vi` (`instr.field`), the compare reads
    /// the stashed pre-write value instead of the current register.
    pub(crate) fn branch_int(&mut self, instr: &Instruction, cc: ConditionCode, two_ops: bool) {
        let (op1, op2) = if instr.field == 0 {
            let op1 = self.alloc_int(instr.source_reg(), RegState::Read);
            let op2 = if two_ops {
                self.alloc_int(instr.source2_reg(), RegState::Read)
            } else {
                // Compare-to-zero forms synthesize a zero operand.
                self.asm.xor32_reg(Reg::Rdi, Reg::Rdi);
                Reg::Rdi
            };
            (op1, op2)
        } else {
            // Serve the flagged operand from the backup slot.
            self.asm.movzx16_from_mem(
                Reg::R15,
                Reg::Rdi,
                offset_of!(VuState, int_backup_reg) as i32,
            );
            self.asm.mov8_imm_mem(
                0,
                Reg::R15,
                offset_of!(VuState, int_backup_id) as i32,
            );
            self.clear_int_delay();
            // The analysis recorded which register was stashed; when both
            // operands alias the backup, source wins.
            let backup_is_source = instr.source_reg() == u16::from(self.backup_vi_id);
            if two_ops {
                if backup_is_source {
                    let op2 = self.alloc_int(instr.source2_reg(), RegState::Read);
                    (Reg::Rdi, op2)
                } else {
                    let op1 = self.alloc_int(instr.source_reg(), RegState::Read);
                    (op1, Reg::Rdi)
                }
            } else {
                self.asm.xor32_reg(Reg::Rsi, Reg::Rsi);
                (Reg::Rdi, Reg::Rsi)
            }
        };

        self.asm.cmp16_reg(op2, op1);
        self.asm.setcc_mem(
            cc,
            Reg::R15,
            offset_of!(VuState, branch_on_delay) as i32,
        );

        self.handle_branch_destinations(instr);
        self.vu_branch = true;
    }

    pub(crate) fn backup_vi(&mut self, instr: &Instruction) {
        let vi = instr.source_reg();
        let int_reg = self.alloc_int(vi, RegState::Read);
        self.asm.mov16_to_mem(
            int_reg,
            Reg::R15,
            offset_of!(VuState, int_backup_reg) as i32,
        );
        self.asm.mov8_imm_mem(
            vi as u8,
            Reg::R15,
            offset_of!(VuState, int_backup_id) as i32,
        );
        self.asm.mov8_imm_mem(
            1,
            Reg::R15,
            offset_of!(VuState, int_branch_delay) as i32,
        );
        self.backup_vi_id = vi as u8;
    }

    pub(crate) fn clear_int_delay(&mut self) {
        self.asm.mov8_imm_mem(
            0,
            Reg::R15,
            offset_of!(VuState, int_branch_delay) as i32,
        );
    }

    pub(crate) fn move_xtop(&mut self, instr: &Instruction) {
        let dest = self.alloc_int(instr.dest_reg(), RegState::Write);
        self.asm
            .movzx16_from_mem(Reg::R15, dest, offset_of!(VuState, vif_top) as i32);
    }

    pub(crate) fn move_xitop(&mut self, instr: &Instruction) {
        let dest = self.alloc_int(instr.dest_reg(), RegState::Write);
        self.asm
            .movzx16_from_mem(Reg::R15, dest, offset_of!(VuState, vif_itop) as i32);
    }
}
