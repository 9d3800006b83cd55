//! VU scalar-pipeline, flag, and transfer lowering: DIV/RSQRT, the EFU
//! family, CLIP and flag reads, XGKICK, and the pipeline bookkeeping ops.

use std::mem::offset_of;

use crate::emitter::{ConditionCode, Reg, Xmm};
use crate::ir::{Instruction, Operand};
use crate::regalloc::RegState;
use crate::state::{VuState, VU_REG_P, VU_REG_Q};

use super::{off_rt, VuCore, VuRunScratch, MAX_FLT, MIN_FLT};

/// 1.0f in lane 0.
const ONE: [u8; 16] = {
    let b = 0x3F80_0000u32.to_le_bytes();
    [b[0], b[1], b[2], b[3], 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]
};

/// Host helper: advances the MAC/CLIP write-back pipelines by `cycles`
/// and recomputes the status register each step.
///
/// # Safety
///
/// Called from generated code with the live state pointer.
pub(crate) unsafe extern "C" fn vu_update_mac_pipeline(state: *mut VuState, cycles: i32) {
    let state = &mut *state;
    for _ in 0..cycles {
        state.mac_pipeline[3] = state.mac_pipeline[2];
        state.mac_pipeline[2] = state.mac_pipeline[1];
        state.mac_pipeline[1] = state.mac_pipeline[0];
        state.mac_pipeline[0] = state.new_mac_flags;

        state.clip_pipeline[3] = state.clip_pipeline[2];
        state.clip_pipeline[2] = state.clip_pipeline[1];
        state.clip_pipeline[1] = state.clip_pipeline[0];
        state.clip_pipeline[0] = state.clip_flags;

        state.update_status();
    }
}

impl VuCore {
    /// Division edge cases: a +0 denominator produces `+MAX_FLT`, a -0
    /// denominator `-MAX_FLT`; anything else divides. The result lands in
    /// `new_q_instance` and surfaces when the FDIV pipe drains.
    fn sse_div_check(&mut self, num: Xmm, denom: Xmm) {
        let off_new_q = offset_of!(VuState, new_q_instance) as i32;

        self.asm.movd_from_xmm(denom, Reg::Rax);
        self.asm.test32_reg_imm(0x7FFF_FFFF, Reg::Rax);
        let normal_div = self.asm.jcc_near_deferred(ConditionCode::Ne);

        self.asm.test32_reg_imm(0x8000_0000, Reg::Rax);
        let load_min = self.asm.jcc_near_deferred(ConditionCode::Ne);

        let max = self.asm.block.emit_literal(&MAX_FLT);
        self.asm.movaps_from_lit(max, num);
        self.asm.movaps_to_mem(num, Reg::R15, off_new_q);
        let end1 = self.asm.jmp_near_deferred();

        self.asm.set_jump_dest(load_min);
        let min = self.asm.block.emit_literal(&MIN_FLT);
        self.asm.movaps_from_lit(min, num);
        self.asm.movaps_to_mem(num, Reg::R15, off_new_q);
        let end2 = self.asm.jmp_near_deferred();

        self.asm.set_jump_dest(normal_div);
        self.asm.divps(denom, num);
        self.asm.movaps_to_mem(num, Reg::R15, off_new_q);

        self.asm.set_jump_dest(end1);
        self.asm.set_jump_dest(end2);
    }

    pub(crate) fn div(&mut self, instr: &Instruction) {
        let num = self.alloc_sse(instr.source_reg(), RegState::Read);
        let denom = self.alloc_sse(instr.source2_reg(), RegState::Read);
        let temp = Xmm::Xmm0;
        let temp2 = Xmm::Xmm1;

        let num_field = instr.field;
        let denom_field = instr.field2;

        self.clamp_vfreg(1 << num_field, num);
        self.clamp_vfreg(1 << denom_field, denom);

        // Pull the chosen lanes into lane 0, zero the rest.
        self.asm.insertps(num_field, 0, 0b1110, num, temp);
        self.asm.insertps(denom_field, 0, 0b1110, denom, temp2);

        self.sse_div_check(temp, temp2);
    }

    pub(crate) fn rsqrt(&mut self, instr: &Instruction) {
        let num = self.alloc_sse(instr.source_reg(), RegState::Read);
        let denom = self.alloc_sse(instr.source2_reg(), RegState::Read);
        let temp = Xmm::Xmm0;
        let temp2 = Xmm::Xmm1;

        let num_field = instr.field;
        let denom_field = instr.field2;

        self.clamp_vfreg(1 << num_field, num);
        self.clamp_vfreg(1 << denom_field, denom);

        // |denom| first: the guest square root ignores the sign bit.
        self.sse_abs(denom, temp2);
        self.asm.insertps(num_field, 0, 0b1110, num, temp);
        self.asm.insertps(denom_field, 0, 0b1110, temp2, temp2);
        self.asm.sqrtps(temp2, temp2);

        self.sse_div_check(temp, temp2);
    }

    // --- EFU ------------------------------------------------------------

    pub(crate) fn eleng(&mut self, instr: &Instruction) {
        let source = self.alloc_sse(instr.source_reg(), RegState::Read);
        let temp = Xmm::Xmm0;

        self.clamp_vfreg(0xE, source);

        // P = sqrt(x^2 + y^2 + z^2)
        self.asm.movaps_reg(source, temp);
        self.asm.dpps(0x71, temp, temp);
        self.asm.sqrtps(temp, temp);
        self.asm.movaps_to_mem(
            temp,
            Reg::R15,
            offset_of!(VuState, new_p_instance) as i32,
        );
    }

    pub(crate) fn erleng(&mut self, instr: &Instruction) {
        let source = self.alloc_sse(instr.source_reg(), RegState::Read);
        let temp = Xmm::Xmm0;
        let temp2 = Xmm::Xmm1;

        self.clamp_vfreg(0xE, source);

        self.asm.movaps_reg(source, temp);
        self.asm.dpps(0x71, temp, temp);
        self.asm.sqrtps(temp, temp);

        let one = self.asm.block.emit_literal(&ONE);
        self.asm.movaps_from_lit(one, temp2);
        self.asm.divps(temp, temp2);
        self.asm.movaps_to_mem(
            temp2,
            Reg::R15,
            offset_of!(VuState, new_p_instance) as i32,
        );
    }

    pub(crate) fn esqrt(&mut self, instr: &Instruction) {
        let lane = instr.field;
        let source = self.alloc_sse(instr.source_reg(), RegState::Read);
        let temp = Xmm::Xmm0;

        self.clamp_vfreg(1 << lane, source);

        self.asm.sqrtps(source, temp);
        self.asm.insertps(lane, 0, 0, temp, temp);
        self.asm.movaps_to_mem(
            temp,
            Reg::R15,
            offset_of!(VuState, new_p_instance) as i32,
        );
    }

    pub(crate) fn ersqrt(&mut self, instr: &Instruction) {
        let lane = instr.field;
        let source = self.alloc_sse(instr.source_reg(), RegState::Read);
        let denom = Xmm::Xmm0;
        let num = Xmm::Xmm1;

        self.clamp_vfreg(1 << lane, source);

        self.asm.sqrtps(source, denom);
        self.asm.insertps(lane, 0, 0, denom, denom);

        let one = self.asm.block.emit_literal(&ONE);
        self.asm.movaps_from_lit(one, num);
        self.asm.divps(denom, num);
        self.asm.movaps_to_mem(
            num,
            Reg::R15,
            offset_of!(VuState, new_p_instance) as i32,
        );
    }

    pub(crate) fn rinit(&mut self, instr: &Instruction) {
        let lane = instr.field;
        let source = self.alloc_sse(instr.source_reg(), RegState::Read);
        let temp = Xmm::Xmm0;

        self.clamp_vfreg(1 << lane, source);

        // R = 0x3F800000 | (reg[lane] & 0x007FFFFF)
        self.asm.insertps(lane, 0, 0, source, temp);
        self.asm.movd_from_xmm(temp, Reg::Rax);
        self.asm.and32_reg_imm(0x007F_FFFF, Reg::Rax);
        self.asm.or32_reg_imm(0x3F80_0000, Reg::Rax);
        self.asm
            .mov32_to_mem(Reg::Rax, Reg::R15, offset_of!(VuState, r_reg) as i32);
    }

    // --- flags ----------------------------------------------------------

    pub(crate) fn mac_eq(&mut self, instr: &Instruction) {
        let source = self.alloc_int(instr.source_reg(), RegState::ReadWrite);
        let dest = self.alloc_int(instr.dest_reg(), RegState::ReadWrite);

        // dest = (mac == source)
        self.asm.mov32_from_mem(
            Reg::R15,
            Reg::Rax,
            offset_of!(VuState, mac_pipeline) as i32 + 12,
        );
        self.asm.and32_reg_imm(0xFFFF, Reg::Rax);
        self.asm.cmp16_reg(Reg::Rax, source);
        self.asm.setcc_reg(ConditionCode::E, Reg::Rax);
        self.asm.and32_reg_imm(0x1, Reg::Rax);
        self.asm.mov32_reg(Reg::Rax, dest);
    }

    pub(crate) fn mac_and(&mut self, instr: &Instruction) {
        self.asm.movzx16_from_mem(
            Reg::R15,
            Reg::Rsi,
            offset_of!(VuState, mac_pipeline) as i32 + 12,
        );

        if instr.dest == instr.source {
            let dest = self.alloc_int(instr.dest_reg(), RegState::ReadWrite);
            self.asm.and16_reg(Reg::Rsi, dest);
        } else {
            let source = self.alloc_int(instr.source_reg(), RegState::Read);
            let dest = self.alloc_int(instr.dest_reg(), RegState::Write);
            self.asm.and16_reg(source, Reg::Rsi);
            self.asm.mov16_reg(Reg::Rsi, dest);
        }
    }

    pub(crate) fn set_clip_flags(&mut self, instr: &Instruction) {
        self.asm.mov32_imm_mem(
            instr.source_imm() as u32,
            Reg::R15,
            offset_of!(VuState, clip_flags) as i32,
        );
    }

    pub(crate) fn get_clip_flags(&mut self, instr: &Instruction) {
        let dest = self.alloc_int(instr.dest_reg(), RegState::Write);
        self.asm.mov32_from_mem(
            Reg::R15,
            dest,
            offset_of!(VuState, clip_pipeline) as i32 + 12,
        );
        self.asm.and32_reg_imm(0xFFF, dest);
    }

    pub(crate) fn and_clip_flags(&mut self, instr: &Instruction) {
        // vi1 = (clip & imm) != 0
        let vi1 = self.alloc_int(1, RegState::Write);
        self.asm.mov32_from_mem(
            Reg::R15,
            Reg::Rax,
            offset_of!(VuState, clip_pipeline) as i32 + 12,
        );
        self.asm
            .test32_reg_imm(instr.source_imm() as u32, Reg::Rax);
        self.asm.setcc_reg(ConditionCode::Ne, Reg::Rax);
        self.asm.and32_reg_imm(0x1, Reg::Rax);
        self.asm.mov32_reg(Reg::Rax, vi1);
    }

    pub(crate) fn or_clip_flags(&mut self, instr: &Instruction) {
        // vi1 = (clip | imm) == 0xFFFFFF
        let vi1 = self.alloc_int(1, RegState::Write);
        self.asm.mov32_from_mem(
            Reg::R15,
            Reg::Rax,
            offset_of!(VuState, clip_pipeline) as i32 + 12,
        );
        self.asm.or32_reg_imm(instr.source_imm() as u32, Reg::Rax);
        self.asm.and32_reg_imm(0xFF_FFFF, Reg::Rax);
        self.asm.cmp32_imm(0xFF_FFFF, Reg::Rax);
        self.asm.setcc_reg(ConditionCode::E, Reg::Rax);
        self.asm.and32_reg_imm(0x1, Reg::Rax);
        self.asm.mov32_reg(Reg::Rax, vi1);
    }

    pub(crate) fn and_stat_flags(&mut self, instr: &Instruction) {
        let dest = self.alloc_int(instr.dest_reg(), RegState::Write);
        self.asm
            .mov32_from_mem(Reg::R15, Reg::Rax, offset_of!(VuState, status) as i32);
        self.asm
            .and32_reg_imm(instr.source_imm() as u32, Reg::Rax);
        self.asm.mov32_reg(Reg::Rax, dest);
    }

    /// CLIP judgement: runs on the host helper with the raw word.
    pub(crate) fn clip(&mut self, instr: &Instruction) {
        self.flush_and_clear();
        self.prepare_abi_reg(Reg::R15);
        self.prepare_abi_imm(u64::from(instr.opcode));
        self.call_abi_func(self.bus.clip as usize as u64);
    }

    // --- pipeline bookkeeping -------------------------------------------

    pub(crate) fn update_q(&mut self) {
        // Move the drained divide result into the program-visible Q.
        let q_reg = self.alloc_sse(VU_REG_Q, RegState::Write);
        self.asm.movaps_from_mem(
            Reg::R15,
            q_reg,
            offset_of!(VuState, new_q_instance) as i32,
        );
        self.set_clamping_reg(q_reg, true, 0xF);
    }

    pub(crate) fn update_p(&mut self) {
        let p_reg = self.alloc_sse(VU_REG_P, RegState::Write);
        self.asm.movaps_from_mem(
            Reg::R15,
            p_reg,
            offset_of!(VuState, new_p_instance) as i32,
        );
        self.set_clamping_reg(p_reg, true, 0xF);
    }

    pub(crate) fn update_mac_pipeline(&mut self, instr: &Instruction) {
        self.prepare_abi_reg(Reg::R15);
        self.prepare_abi_imm(instr.source_imm());
        self.call_abi_func(vu_update_mac_pipeline as usize as u64);
    }

    // --- XGKICK ---------------------------------------------------------

    /// XGKICK: if a GIF transfer is still active, latch the stall; when the
    /// kick is not in a delay slot, also save PC and the pipeline snapshot
    /// and exit so the host can drive the GIF forward.
    pub(crate) fn xgkick(&mut self, instr: &Instruction) {
        let base = self.alloc_int(instr.base, RegState::Read);

        self.asm.movzx8_from_mem(
            Reg::R15,
            Reg::Rax,
            offset_of!(VuState, transferring_gif) as i32,
        );
        self.asm.test32_reg_imm(0x1, Reg::Rax);
        let no_stall = self.asm.jcc_near_deferred(ConditionCode::E);

        // Stall: latch the requested address.
        self.asm.mov8_imm_mem(
            1,
            Reg::R15,
            offset_of!(VuState, xgkick_stall) as i32,
        );
        self.asm.mov32_reg(base, Reg::Rax);
        self.asm.shl32_reg_imm(4, Reg::Rax);
        self.asm.and32_reg_imm(u32::from(self.mem_mask), Reg::Rax);
        self.asm.mov16_to_mem(
            Reg::Rax,
            Reg::R15,
            offset_of!(VuState, stalled_gif_addr) as i32,
        );

        // Outside a delay slot there is nothing more this block may do:
        // save the resume point and bail to the host.
        if instr.dest == Operand::Imm(0) && instr.jump_dest == 0 {
            let off_pc = offset_of!(VuState, pc) as i32;
            self.asm
                .mov16_imm_mem(instr.return_addr as u16 + 8, Reg::R15, off_pc);
            self.asm.mov32_imm_mem(
                instr.return_addr,
                Reg::R14,
                off_rt(offset_of!(VuRunScratch, prev_pc)),
            );
            self.asm.load_addr(instr.source_imm(), Reg::Rax);
            self.asm.mov64_to_mem(
                Reg::Rax,
                Reg::R15,
                offset_of!(VuState, pipeline_state) as i32,
            );
            self.asm.load_addr(instr.source2_imm(), Reg::Rax);
            self.asm.mov64_to_mem(
                Reg::Rax,
                Reg::R15,
                offset_of!(VuState, pipeline_state) as i32 + 8,
            );
            self.cleanup_recompiler(false);
        }
        let done = self.asm.jmp_near_deferred();

        // No stall: start the transfer.
        self.asm.set_jump_dest(no_stall);
        self.asm.mov8_imm_mem(
            1,
            Reg::R15,
            offset_of!(VuState, transferring_gif) as i32,
        );
        self.asm.mov32_reg(base, Reg::Rax);
        self.asm.shl32_reg_imm(4, Reg::Rax);
        self.asm.and32_reg_imm(u32::from(self.mem_mask), Reg::Rax);
        self.asm.mov16_to_mem(
            Reg::Rax,
            Reg::R15,
            offset_of!(VuState, gif_addr) as i32,
        );

        self.asm.set_jump_dest(done);
    }

    pub(crate) fn update_xgkick(&mut self, instr: &Instruction) {
        self.flush_and_clear();
        self.prepare_abi_reg(Reg::R15);
        self.prepare_abi_imm(instr.source_imm());
        self.call_abi_func(self.bus.update_xgkick as usize as u64);
    }

    // --- block end ------------------------------------------------------

    pub(crate) fn stop(&mut self, instr: &Instruction, tbit: bool) {
        self.flush_and_clear();
        self.prepare_abi_reg(Reg::R15);
        let handler = if tbit {
            self.bus.stop_tbit as usize as u64
        } else {
            self.bus.stop as usize as u64
        };
        self.call_abi_func(handler);

        self.asm.mov16_imm_mem(
            instr.jump_dest as u16,
            Reg::R15,
            offset_of!(VuState, pc) as i32,
        );
        // The next program starts fresh; no predecessor context applies.
        self.asm.mov32_imm_mem(
            crate::vu::pipeline::NO_PREV_PC,
            Reg::R14,
            off_rt(offset_of!(VuRunScratch, prev_pc)),
        );
        self.end_of_program = true;
    }

    pub(crate) fn save_pc(&mut self, instr: &Instruction) {
        self.asm.mov32_imm_mem(
            instr.jump_dest,
            Reg::R14,
            off_rt(offset_of!(VuRunScratch, prev_pc)),
        );
    }

    pub(crate) fn save_pipeline_state(&mut self, instr: &Instruction) {
        self.asm.load_addr(instr.source_imm(), Reg::Rax);
        self.asm.mov64_to_mem(
            Reg::Rax,
            Reg::R15,
            offset_of!(VuState, pipeline_state) as i32,
        );
        self.asm.load_addr(instr.source2_imm(), Reg::Rax);
        self.asm.mov64_to_mem(
            Reg::Rax,
            Reg::R15,
            offset_of!(VuState, pipeline_state) as i32 + 8,
        );
    }

    /// Promotes the pending branch recorded by the previous block into the
    /// immediate branch state this block's epilogue consumes.
    pub(crate) fn move_delayed_branch(&mut self) {
        self.asm.mov16_from_mem(
            Reg::R14,
            Reg::Rax,
            off_rt(offset_of!(VuRunScratch, branch_delay_dest)),
        );
        self.asm.mov16_to_mem(
            Reg::Rax,
            Reg::R14,
            off_rt(offset_of!(VuRunScratch, branch_dest)),
        );
        self.asm.mov16_from_mem(
            Reg::R14,
            Reg::Rax,
            off_rt(offset_of!(VuRunScratch, branch_delay_fail_dest)),
        );
        self.asm.mov16_to_mem(
            Reg::Rax,
            Reg::R14,
            off_rt(offset_of!(VuRunScratch, branch_fail_dest)),
        );
        self.asm.mov8_from_mem(
            Reg::R15,
            Reg::Rax,
            offset_of!(VuState, branch_on_delay) as i32,
        );
        self.asm.mov8_to_mem(
            Reg::Rax,
            Reg::R15,
            offset_of!(VuState, branch_on) as i32,
        );
        self.vu_branch = true;
    }

    /// Unlowered instructions run on the reference interpreter.
    pub(crate) fn fallback_interpreter(&mut self, instr: &Instruction) {
        self.flush_and_clear();
        let word = instr.source_imm() as u32;
        let is_upper = instr.field != 0;
        self.prepare_abi_reg(Reg::R15);
        self.prepare_abi_imm(u64::from(word));
        let handler = if is_upper {
            self.bus.interpreter_upper as usize as u64
        } else {
            self.bus.interpreter_lower as usize as u64
        };
        self.call_abi_func(handler);
    }
}
