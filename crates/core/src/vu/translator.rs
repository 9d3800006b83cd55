//! VU decoder and translator.
//!
//! Each 64-bit slot holds an UPPER and a LOWER instruction decoded
//! independently. The analysis passes (`pipeline` module) run first; the
//! translator then emits IR per PC in a fixed order: pipeline bookkeeping,
//! VI backup, delayed-branch promotion, then UPPER before LOWER (wrapped
//! in the backup/restore choreography when they share a register), and
//! finally the block-end sequence (E-bit/T-bit drain or PC + pipeline
//! snapshot) plus an XGKICK tick.

use tracing::{trace, warn};

use crate::ir::{Block, Instruction, Opcode, Operand};
use crate::state::{VuState, VU_REG_ACC, VU_REG_I, VU_REG_Q};
use crate::vu::pipeline::{self, VuAnalysis};

/// The VU translator. Holds per-block scratch only.
#[derive(Debug, Default)]
pub struct VuTranslator {
    cycles_this_block: u16,
    cycles_since_xgkick: u16,
    branch_delay_slot: bool,
    ebit_delay_slot: bool,
}

impl VuTranslator {
    /// Creates a translator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Translates the block at the state's PC, given the predecessor PC
    /// recorded at the previous block's exit.
    ///
    /// Returns the IR block and the analysis (the code generator needs the
    /// per-PC records for XGKICK and branch lowering).
    pub fn translate(&mut self, state: &VuState, prev_pc: u32) -> (Block, VuAnalysis) {
        // SAFETY: the embedder wired instr_mem before running the VU.
        let analysis = unsafe { pipeline::analyze(state, prev_pc) };

        let mut block = Block::new();
        self.cycles_this_block = 0;
        self.cycles_since_xgkick = 0;
        self.branch_delay_slot = analysis.entry_branch_delay && prev_pc != pipeline::NO_PREV_PC;
        self.ebit_delay_slot = analysis.entry_ebit_delay && prev_pc != pipeline::NO_PREV_PC;

        block.add_instr(Instruction::new(Opcode::ClearIntDelay));

        let mut pc = state.pc;
        let mut block_end = false;
        while !block_end {
            let info = *analysis.at(pc);
            // SAFETY: as above.
            let upper = unsafe { pipeline::read_instr(state, pc.wrapping_add(4)) };
            let lower = unsafe { pipeline::read_instr(state, pc) };

            if info.branch_delay_slot || info.ebit_delay_slot || info.tbit_end {
                block_end = true;
                if info.branch_delay_slot {
                    self.branch_delay_slot = true;
                }
            }

            let issue = u16::from(info.stall_amount) + 1;
            self.cycles_this_block += issue;
            self.cycles_since_xgkick += issue;

            let mut upper_instrs = Vec::new();
            self.translate_upper(&mut upper_instrs, upper);

            if info.advance_mac_pipeline {
                let mut mac = Instruction::new(Opcode::UpdateMacPipeline);
                mac.source = Operand::Imm(u64::from(info.stall_amount) + 1);
                block.add_instr(mac);
            }
            if info.update_mac_pipeline {
                block.add_instr(Instruction::new(Opcode::UpdateMacFlags));
            }
            if info.update_q_pipeline {
                block.add_instr(Instruction::new(Opcode::UpdateQ));
            }
            if info.update_p_pipeline {
                block.add_instr(Instruction::new(Opcode::UpdateP));
            }
            if info.backup_vi != 0 {
                let mut backup = Instruction::new(Opcode::BackupVI);
                backup.source = Operand::Reg(u16::from(info.backup_vi));
                block.add_instr(backup);
            }
            if info.branch_delay_slot {
                block.add_instr(Instruction::new(Opcode::MoveDelayedBranch));
            }

            if upper & (1 << 31) != 0 {
                // LOI: the LOWER word loads the I register; UPPER first.
                for instr in upper_instrs {
                    block.add_instr(instr);
                }
                let mut loi = Instruction::new(Opcode::LoadFloatConst);
                loi.dest = Operand::Reg(VU_REG_I);
                loi.source = Operand::Imm(u64::from(lower));
                block.add_instr(loi);
            } else {
                let mut lower_instrs = Vec::new();
                self.translate_lower(&mut lower_instrs, lower, pc, &analysis);

                if info.swap_ops {
                    // LOWER must observe the shared register's pre-UPPER
                    // value: save it around the UPPER, swap back after.
                    let vf = u16::from(info.decoder_vf_write);
                    let backup_old = Self::vf_backup(Opcode::BackupVF, vf, 0);
                    block.add_instr(backup_old);
                    for instr in upper_instrs {
                        block.add_instr(instr);
                    }
                    block.add_instr(Self::vf_backup(Opcode::BackupVF, vf, 1));
                    block.add_instr(Self::vf_backup(Opcode::RestoreVF, vf, 0));
                    for instr in lower_instrs {
                        block.add_instr(instr);
                    }
                    block.add_instr(Self::vf_backup(Opcode::RestoreVF, vf, 1));
                } else {
                    for instr in upper_instrs {
                        block.add_instr(instr);
                    }
                    for instr in lower_instrs {
                        block.add_instr(instr);
                    }
                }
            }

            if upper & (1 << 30) != 0 && info.is_branch {
                warn!("[VU] E-bit set on a branch");
            }

            if info.ebit_delay_slot || info.tbit_end {
                let mut stop = Instruction::new(if info.tbit_end {
                    Opcode::StopTBit
                } else {
                    Opcode::Stop
                });
                stop.jump_dest = u32::from(pc.wrapping_add(8));
                block.add_instr(stop);

                // A new microprogram starts clean: empty snapshot, flush
                // the scalar pipes, drain the MAC queue.
                let mut snap = Instruction::new(Opcode::SavePipelineState);
                snap.source = Operand::Imm(0);
                snap.source2 = Operand::Imm(0);
                block.add_instr(snap);
                block.add_instr(Instruction::new(Opcode::UpdateQ));
                block.add_instr(Instruction::new(Opcode::UpdateP));
                block.add_instr(Instruction::new(Opcode::ClearIntDelay));

                if info.is_branch {
                    block.add_instr(Instruction::new(Opcode::MoveDelayedBranch));
                    warn!("[VU] branch in E-bit delay slot");
                }

                let mut drain = Instruction::new(Opcode::UpdateMacPipeline);
                drain.source = Operand::Imm(4);
                block.add_instr(drain);
            } else if block_end {
                // Remember where the next block is jumped from, and the
                // snapshot that selects the right successor compile.
                let mut savepc = Instruction::new(Opcode::SavePC);
                savepc.jump_dest = u32::from(pc);
                block.add_instr(savepc);

                let mut snap = Instruction::new(Opcode::SavePipelineState);
                snap.source = Operand::Imm(info.pipeline_state[0]);
                snap.source2 = Operand::Imm(info.pipeline_state[1]);
                block.add_instr(snap);
            }

            pc = pc.wrapping_add(8) & state.mem_mask;
        }

        let mut update = Instruction::new(Opcode::UpdateXgkick);
        update.source = Operand::Imm(u64::from(self.cycles_since_xgkick));
        block.add_instr(update);
        block.set_cycle_count(self.cycles_this_block);

        trace!(
            pc = format_args!("{:#06x}", state.pc),
            cycles = self.cycles_this_block,
            "translated VU block"
        );
        (block, analysis)
    }

    fn vf_backup(op: Opcode, vf: u16, slot: u64) -> Instruction {
        let mut instr = Instruction::new(op);
        instr.source = Operand::Reg(vf);
        instr.dest = Operand::Imm(slot);
        instr
    }

    /// Emits an `UpdateXgkick` tick before memory stores and kicks, so an
    /// in-flight GIF transfer observes writes in order.
    fn tick_xgkick(&mut self, instrs: &mut Vec<Instruction>) {
        let mut update = Instruction::new(Opcode::UpdateXgkick);
        update.source = Operand::Imm(u64::from(self.cycles_since_xgkick));
        self.cycles_since_xgkick = 0;
        instrs.push(update);
    }

    // --- UPPER ----------------------------------------------------------

    fn op_vectors(instr: &mut Instruction, upper: u32) {
        instr.dest = Operand::Reg(((upper >> 6) & 0x1F) as u16);
        instr.source = Operand::Reg(((upper >> 11) & 0x1F) as u16);
        instr.source2 = Operand::Reg(((upper >> 16) & 0x1F) as u16);
        instr.field = ((upper >> 21) & 0xF) as u8;
    }

    fn op_acc_and_vectors(instr: &mut Instruction, upper: u32) {
        Self::op_vectors(instr, upper);
        instr.dest = Operand::Reg(VU_REG_ACC);
    }

    fn op_vector_by_scalar(instr: &mut Instruction, upper: u32, scalar: Option<u16>) {
        instr.dest = Operand::Reg(((upper >> 6) & 0x1F) as u16);
        instr.source = Operand::Reg(((upper >> 11) & 0x1F) as u16);
        instr.field = ((upper >> 21) & 0xF) as u8;
        match scalar {
            None => {
                instr.source2 = Operand::Reg(((upper >> 16) & 0x1F) as u16);
                instr.bc = (upper & 0x3) as u8;
            }
            Some(special) => {
                instr.source2 = Operand::Reg(special);
                instr.bc = 0;
            }
        }
    }

    fn op_acc_by_scalar(instr: &mut Instruction, upper: u32, scalar: Option<u16>) {
        Self::op_vector_by_scalar(instr, upper, scalar);
        instr.dest = Operand::Reg(VU_REG_ACC);
    }

    fn op_conversion(instr: &mut Instruction, upper: u32) {
        instr.source = Operand::Reg(((upper >> 11) & 0x1F) as u16);
        instr.dest = Operand::Reg(((upper >> 16) & 0x1F) as u16);
        instr.field = ((upper >> 21) & 0xF) as u8;
    }

    fn translate_upper(&mut self, instrs: &mut Vec<Instruction>, upper: u32) {
        let op = upper & 0x3F;
        let mut instr = Instruction::default();
        match op {
            0x00..=0x03 => {
                instr.op = Opcode::VAddVectorByScalar;
                Self::op_vector_by_scalar(&mut instr, upper, None);
            }
            0x04..=0x07 => {
                instr.op = Opcode::VSubVectorByScalar;
                Self::op_vector_by_scalar(&mut instr, upper, None);
            }
            0x08..=0x0B => {
                instr.op = Opcode::VMaddVectorByScalar;
                Self::op_vector_by_scalar(&mut instr, upper, None);
            }
            0x0C..=0x0F => {
                instr.op = Opcode::VMsubVectorByScalar;
                Self::op_vector_by_scalar(&mut instr, upper, None);
            }
            0x10..=0x13 => {
                instr.op = Opcode::VMaxVectorByScalar;
                Self::op_vector_by_scalar(&mut instr, upper, None);
                if instr.dest == Operand::Reg(0) {
                    return;
                }
            }
            0x14..=0x17 => {
                instr.op = Opcode::VMinVectorByScalar;
                Self::op_vector_by_scalar(&mut instr, upper, None);
                if instr.dest == Operand::Reg(0) {
                    return;
                }
            }
            0x18..=0x1B => {
                instr.op = Opcode::VMulVectorByScalar;
                Self::op_vector_by_scalar(&mut instr, upper, None);
            }
            0x1C => {
                instr.op = Opcode::VMulVectorByScalar;
                Self::op_vector_by_scalar(&mut instr, upper, Some(VU_REG_Q));
            }
            0x1D => {
                instr.op = Opcode::VMaxVectorByScalar;
                Self::op_vector_by_scalar(&mut instr, upper, Some(VU_REG_I));
                if instr.dest == Operand::Reg(0) {
                    return;
                }
            }
            0x1E => {
                instr.op = Opcode::VMulVectorByScalar;
                Self::op_vector_by_scalar(&mut instr, upper, Some(VU_REG_I));
            }
            0x1F => {
                instr.op = Opcode::VMinVectorByScalar;
                Self::op_vector_by_scalar(&mut instr, upper, Some(VU_REG_I));
                if instr.dest == Operand::Reg(0) {
                    return;
                }
            }
            0x20 => {
                instr.op = Opcode::VAddVectorByScalar;
                Self::op_vector_by_scalar(&mut instr, upper, Some(VU_REG_Q));
            }
            0x21 => {
                instr.op = Opcode::VMaddVectorByScalar;
                Self::op_vector_by_scalar(&mut instr, upper, Some(VU_REG_Q));
            }
            0x22 => {
                instr.op = Opcode::VAddVectorByScalar;
                Self::op_vector_by_scalar(&mut instr, upper, Some(VU_REG_I));
            }
            0x23 => {
                instr.op = Opcode::VMaddVectorByScalar;
                Self::op_vector_by_scalar(&mut instr, upper, Some(VU_REG_I));
            }
            0x24 => {
                instr.op = Opcode::VSubVectorByScalar;
                Self::op_vector_by_scalar(&mut instr, upper, Some(VU_REG_Q));
            }
            0x25 => {
                instr.op = Opcode::VMsubVectorByScalar;
                Self::op_vector_by_scalar(&mut instr, upper, Some(VU_REG_Q));
            }
            0x26 => {
                instr.op = Opcode::VSubVectorByScalar;
                Self::op_vector_by_scalar(&mut instr, upper, Some(VU_REG_I));
            }
            0x27 => {
                instr.op = Opcode::VMsubVectorByScalar;
                Self::op_vector_by_scalar(&mut instr, upper, Some(VU_REG_I));
            }
            0x28 => {
                instr.op = Opcode::VAddVectors;
                Self::op_vectors(&mut instr, upper);
            }
            0x29 => {
                instr.op = Opcode::VMaddVectors;
                Self::op_vectors(&mut instr, upper);
            }
            0x2A => {
                instr.op = Opcode::VMulVectors;
                Self::op_vectors(&mut instr, upper);
            }
            0x2B => {
                instr.op = Opcode::VMaxVectors;
                Self::op_vectors(&mut instr, upper);
                if instr.dest == Operand::Reg(0) {
                    return;
                }
            }
            0x2C => {
                instr.op = Opcode::VSubVectors;
                Self::op_vectors(&mut instr, upper);
            }
            0x2D => {
                instr.op = Opcode::VMsubVectors;
                Self::op_vectors(&mut instr, upper);
            }
            0x2E => {
                instr.op = Opcode::VOpMsub;
                instr.dest = Operand::Reg(((upper >> 6) & 0x1F) as u16);
                instr.source = Operand::Reg(((upper >> 11) & 0x1F) as u16);
                instr.source2 = Operand::Reg(((upper >> 16) & 0x1F) as u16);
            }
            0x2F => {
                instr.op = Opcode::VMinVectors;
                Self::op_vectors(&mut instr, upper);
                if instr.dest == Operand::Reg(0) {
                    return;
                }
            }
            0x3C..=0x3F => {
                self.upper_special(instrs, upper);
                return;
            }
            _ => {
                warn!(op = format_args!("{op:#04x}"), "unrecognized VU upper op");
                Self::fallback(&mut instr, upper, true);
            }
        }
        instrs.push(instr);
    }

    fn upper_special(&mut self, instrs: &mut Vec<Instruction>, upper: u32) {
        let op = (upper & 0x3) | ((upper >> 4) & 0x7C);
        let mut instr = Instruction::default();
        match op {
            0x00..=0x03 => {
                instr.op = Opcode::VAddVectorByScalar;
                Self::op_acc_by_scalar(&mut instr, upper, None);
            }
            0x04..=0x07 => {
                instr.op = Opcode::VSubVectorByScalar;
                Self::op_acc_by_scalar(&mut instr, upper, None);
            }
            0x08..=0x0B => {
                instr.op = Opcode::VMaddAccByScalar;
                Self::op_acc_by_scalar(&mut instr, upper, None);
            }
            0x0C..=0x0F => {
                instr.op = Opcode::VMsubAccByScalar;
                Self::op_acc_by_scalar(&mut instr, upper, None);
            }
            0x10..=0x13 => {
                instr.op = match op {
                    0x10 => Opcode::VFixedToFloat0,
                    0x11 => Opcode::VFixedToFloat4,
                    0x12 => Opcode::VFixedToFloat12,
                    _ => Opcode::VFixedToFloat15,
                };
                Self::op_conversion(&mut instr, upper);
                if instr.dest == Operand::Reg(0) {
                    return;
                }
            }
            0x14..=0x17 => {
                instr.op = match op {
                    0x14 => Opcode::VFloatToFixed0,
                    0x15 => Opcode::VFloatToFixed4,
                    0x16 => Opcode::VFloatToFixed12,
                    _ => Opcode::VFloatToFixed15,
                };
                Self::op_conversion(&mut instr, upper);
                if instr.dest == Operand::Reg(0) {
                    return;
                }
            }
            0x18..=0x1B => {
                instr.op = Opcode::VMulVectorByScalar;
                Self::op_acc_by_scalar(&mut instr, upper, None);
            }
            0x1C => {
                instr.op = Opcode::VMulVectorByScalar;
                Self::op_acc_by_scalar(&mut instr, upper, Some(VU_REG_Q));
            }
            0x1D => {
                instr.op = Opcode::VAbs;
                Self::op_conversion(&mut instr, upper);
            }
            0x1E => {
                instr.op = Opcode::VMulVectorByScalar;
                Self::op_acc_by_scalar(&mut instr, upper, Some(VU_REG_I));
            }
            0x1F => {
                // CLIP: the judgement itself runs on the host helper.
                instr.op = Opcode::VClip;
                instr.source = Operand::Reg(((upper >> 11) & 0x1F) as u16);
                instr.source2 = Operand::Reg(((upper >> 16) & 0x1F) as u16);
                instr.opcode = upper;
            }
            0x20 => {
                instr.op = Opcode::VAddVectorByScalar;
                Self::op_acc_by_scalar(&mut instr, upper, Some(VU_REG_Q));
            }
            0x21 => {
                instr.op = Opcode::VMaddAccByScalar;
                Self::op_acc_by_scalar(&mut instr, upper, Some(VU_REG_Q));
            }
            0x22 => {
                instr.op = Opcode::VAddVectorByScalar;
                Self::op_acc_by_scalar(&mut instr, upper, Some(VU_REG_I));
            }
            0x23 => {
                instr.op = Opcode::VMaddAccByScalar;
                Self::op_acc_by_scalar(&mut instr, upper, Some(VU_REG_I));
            }
            0x24 => {
                instr.op = Opcode::VSubVectorByScalar;
                Self::op_acc_by_scalar(&mut instr, upper, Some(VU_REG_Q));
            }
            0x25 => {
                instr.op = Opcode::VMsubAccByScalar;
                Self::op_acc_by_scalar(&mut instr, upper, Some(VU_REG_Q));
            }
            0x26 => {
                instr.op = Opcode::VSubVectorByScalar;
                Self::op_acc_by_scalar(&mut instr, upper, Some(VU_REG_I));
            }
            0x27 => {
                instr.op = Opcode::VMsubAccByScalar;
                Self::op_acc_by_scalar(&mut instr, upper, Some(VU_REG_I));
            }
            0x28 => {
                instr.op = Opcode::VAddVectors;
                Self::op_acc_and_vectors(&mut instr, upper);
            }
            0x29 => {
                instr.op = Opcode::VMaddAccAndVectors;
                Self::op_acc_and_vectors(&mut instr, upper);
            }
            0x2A => {
                instr.op = Opcode::VMulVectors;
                Self::op_acc_and_vectors(&mut instr, upper);
            }
            0x2C => {
                instr.op = Opcode::VSubVectors;
                Self::op_acc_and_vectors(&mut instr, upper);
            }
            0x2E => {
                instr.op = Opcode::VOpMula;
                instr.source = Operand::Reg(((upper >> 11) & 0x1F) as u16);
                instr.source2 = Operand::Reg(((upper >> 16) & 0x1F) as u16);
            }
            // NOP
            0x2F | 0x30 => return,
            _ => {
                warn!(op = format_args!("{op:#04x}"), "unrecognized VU upper special op");
                Self::fallback(&mut instr, upper, true);
            }
        }
        instrs.push(instr);
    }

    // --- LOWER ----------------------------------------------------------

    fn branch_offset(lower: u32, pc: u16) -> u32 {
        // 11-bit signed word offset relative to the delay slot.
        let imm = if lower & 0x400 != 0 {
            (lower & 0x3FF) | 0xFC00
        } else {
            lower & 0x3FF
        };
        let offset = i32::from(imm as u16 as i16) * 8;
        (i32::from(pc) + 8 + offset) as u32 & 0x3FFF
    }

    fn translate_lower(
        &mut self,
        instrs: &mut Vec<Instruction>,
        lower: u32,
        pc: u16,
        analysis: &VuAnalysis,
    ) {
        if lower & (1 << 31) != 0 {
            // 0x8000033C encodes "move vf0, vf0", a canonical nop.
            if lower != 0x8000_033C {
                self.lower1(instrs, lower, pc, analysis);
            }
        } else {
            self.lower2(instrs, lower, pc, analysis);
        }
    }

    fn lower1(
        &mut self,
        instrs: &mut Vec<Instruction>,
        lower: u32,
        pc: u16,
        analysis: &VuAnalysis,
    ) {
        let op = lower & 0x3F;
        let mut instr = Instruction::default();
        match op {
            // IADD / ISUB
            0x30 | 0x31 => {
                instr.op = if op == 0x30 {
                    Opcode::AddIntReg
                } else {
                    Opcode::SubIntReg
                };
                instr.dest = Operand::Reg(((lower >> 6) & 0xF) as u16);
                instr.source = Operand::Reg(((lower >> 11) & 0xF) as u16);
                instr.source2 = Operand::Reg(((lower >> 16) & 0xF) as u16);
            }
            // IADDI (5-bit signed immediate)
            0x32 => {
                let imm = ((lower >> 6) & 0x1F) as i16;
                let imm = if imm & 0x10 != 0 { imm | !0xF } else { imm };
                instr.op = Opcode::AddUnsignedImm;
                instr.source = Operand::Reg(((lower >> 11) & 0xF) as u16);
                instr.dest = Operand::Reg(((lower >> 16) & 0xF) as u16);
                instr.source2 = Operand::Imm(imm as u64);
                if instr.source == Operand::Reg(0) {
                    instr.op = Opcode::LoadConst;
                    instr.source = Operand::Imm(imm as u64);
                }
            }
            // IAND / IOR
            0x34 | 0x35 => {
                instr.op = if op == 0x34 {
                    Opcode::AndInt
                } else {
                    Opcode::OrInt
                };
                instr.dest = Operand::Reg(((lower >> 6) & 0xF) as u16);
                instr.source = Operand::Reg(((lower >> 11) & 0xF) as u16);
                instr.source2 = Operand::Reg(((lower >> 16) & 0xF) as u16);
                if instr.dest == Operand::Reg(0)
                    || (instr.dest == instr.source && instr.dest == instr.source2)
                {
                    return;
                }
            }
            0x3C..=0x3F => {
                self.lower1_special(instrs, lower, pc, analysis);
                return;
            }
            _ => {
                warn!(op = format_args!("{op:#04x}"), "unrecognized VU lower1 op");
                Self::fallback(&mut instr, lower, false);
                instrs.push(instr);
                return;
            }
        }
        // Writes to vi0 are dropped.
        if instr.dest == Operand::Reg(0) {
            return;
        }
        instrs.push(instr);
    }

    fn lower1_special(
        &mut self,
        instrs: &mut Vec<Instruction>,
        lower: u32,
        pc: u16,
        analysis: &VuAnalysis,
    ) {
        let op = (lower & 0x3) | ((lower >> 4) & 0x7C);
        let mut instr = Instruction::default();
        match op {
            // MOVE
            0x30 => {
                instr.op = Opcode::VMoveFloat;
                instr.source = Operand::Reg(((lower >> 11) & 0x1F) as u16);
                instr.dest = Operand::Reg(((lower >> 16) & 0x1F) as u16);
                instr.field = ((lower >> 21) & 0xF) as u8;
                if instr.dest == Operand::Reg(0) && instr.source == Operand::Reg(0) {
                    return;
                }
            }
            // MR32
            0x31 => {
                instr.op = Opcode::VMoveRotatedFloat;
                instr.source = Operand::Reg(((lower >> 11) & 0x1F) as u16);
                instr.dest = Operand::Reg(((lower >> 16) & 0x1F) as u16);
                instr.field = ((lower >> 21) & 0xF) as u8;
                if instr.dest == Operand::Reg(0) {
                    return;
                }
            }
            // LQI / LQD
            0x34 | 0x36 => {
                instr.op = if op == 0x34 {
                    Opcode::LoadQuadInc
                } else {
                    Opcode::LoadQuadDec
                };
                instr.field = ((lower >> 21) & 0xF) as u8;
                instr.dest = Operand::Reg(((lower >> 16) & 0x1F) as u16);
                instr.base = ((lower >> 11) & 0xF) as u16;
                if instr.dest == Operand::Reg(0) {
                    return;
                }
            }
            // SQI / SQD
            0x35 | 0x37 => {
                self.tick_xgkick(instrs);
                instr.op = if op == 0x35 {
                    Opcode::StoreQuadInc
                } else {
                    Opcode::StoreQuadDec
                };
                instr.field = ((lower >> 21) & 0xF) as u8;
                instr.base = ((lower >> 16) & 0xF) as u16;
                instr.source = Operand::Reg(((lower >> 11) & 0x1F) as u16);
            }
            // DIV
            0x38 => {
                instr.op = Opcode::VDiv;
                instr.source = Operand::Reg(((lower >> 11) & 0x1F) as u16);
                instr.source2 = Operand::Reg(((lower >> 16) & 0x1F) as u16);
                instr.field = ((lower >> 21) & 0x3) as u8;
                instr.field2 = ((lower >> 23) & 0x3) as u8;
            }
            // SQRT: Q = sqrt(|ft.ftf|), numerator fixed at 1.0 divided out
            // by the common div path would be wrong; run it on the
            // interpreter like the reference recompiler does.
            0x39 => {
                warn!("VU SQRT on the interpreter path");
                Self::fallback(&mut instr, lower, false);
            }
            // RSQRT
            0x3A => {
                instr.op = Opcode::VRsqrt;
                instr.source = Operand::Reg(((lower >> 11) & 0x1F) as u16);
                instr.source2 = Operand::Reg(((lower >> 16) & 0x1F) as u16);
                instr.field = ((lower >> 21) & 0x3) as u8;
                instr.field2 = ((lower >> 23) & 0x3) as u8;
            }
            // WAITQ: the stall is handled by the analysis pass.
            0x3B => return,
            // MTIR
            0x3C => {
                instr.op = Opcode::VMoveToInt;
                instr.source = Operand::Reg(((lower >> 11) & 0x1F) as u16);
                instr.dest = Operand::Reg(((lower >> 16) & 0xF) as u16);
                instr.field = ((lower >> 21) & 0x3) as u8;
                if instr.dest == Operand::Reg(0) {
                    return;
                }
            }
            // MFIR
            0x3D => {
                instr.op = Opcode::VMoveFromInt;
                instr.source = Operand::Reg(((lower >> 11) & 0xF) as u16);
                instr.dest = Operand::Reg(((lower >> 16) & 0x1F) as u16);
                instr.field = ((lower >> 21) & 0xF) as u8;
                if instr.dest == Operand::Reg(0) {
                    return;
                }
            }
            // ILWR
            0x3E => {
                instr.op = Opcode::LoadInt;
                instr.base = ((lower >> 11) & 0xF) as u16;
                instr.dest = Operand::Reg(((lower >> 16) & 0xF) as u16);
                instr.field = ((lower >> 21) & 0xF) as u8;
                instr.source = Operand::Imm(0);
                if instr.dest == Operand::Reg(0) {
                    return;
                }
            }
            // ISWR
            0x3F => {
                self.tick_xgkick(instrs);
                instr.op = Opcode::StoreInt;
                instr.field = ((lower >> 21) & 0xF) as u8;
                instr.source = Operand::Reg(((lower >> 16) & 0xF) as u16);
                instr.base = ((lower >> 11) & 0xF) as u16;
                instr.source2 = Operand::Imm(0);
            }
            // RINIT
            0x42 => {
                instr.op = Opcode::VRInit;
                instr.source = Operand::Reg(((lower >> 11) & 0x1F) as u16);
                instr.field = ((lower >> 21) & 0x3) as u8;
            }
            // MFP
            0x64 => {
                instr.op = Opcode::VMoveFromP;
                instr.dest = Operand::Reg(((lower >> 16) & 0x1F) as u16);
                instr.field = ((lower >> 21) & 0xF) as u8;
                if instr.dest == Operand::Reg(0) {
                    return;
                }
            }
            // XTOP / XITOP
            0x68 | 0x69 => {
                instr.op = if op == 0x68 {
                    Opcode::MoveXTOP
                } else {
                    Opcode::MoveXITOP
                };
                instr.dest = Operand::Reg(((lower >> 16) & 0xF) as u16);
                if instr.dest == Operand::Reg(0) {
                    return;
                }
            }
            // XGKICK
            0x6C => {
                self.tick_xgkick(instrs);
                instr.op = Opcode::Xgkick;
                instr.base = ((lower >> 11) & 0xF) as u16;
                instr.return_addr = u32::from(pc);
                let info = analysis.at(pc);
                instr.source = Operand::Imm(info.pipeline_state[0]);
                instr.source2 = Operand::Imm(info.pipeline_state[1]);
                instr.dest = Operand::Imm(u64::from(self.branch_delay_slot));
                instr.jump_dest = u32::from(self.ebit_delay_slot);
            }
            // ELENG / ERLENG
            0x72 => {
                instr.op = Opcode::VEleng;
                instr.source = Operand::Reg(((lower >> 11) & 0x1F) as u16);
            }
            0x73 => {
                instr.op = Opcode::VErleng;
                instr.source = Operand::Reg(((lower >> 11) & 0x1F) as u16);
            }
            // ESQRT / ERSQRT
            0x78 => {
                instr.op = Opcode::VESqrt;
                instr.source = Operand::Reg(((lower >> 11) & 0x1F) as u16);
                instr.field = ((lower >> 21) & 0x3) as u8;
            }
            0x79 => {
                instr.op = Opcode::VERsqrt;
                instr.source = Operand::Reg(((lower >> 11) & 0x1F) as u16);
                instr.field = ((lower >> 21) & 0x3) as u8;
            }
            // WAITP: the stall is handled by the analysis pass.
            0x7B => return,
            // The remaining EFU transcendentals run on the interpreter.
            0x70 | 0x71 | 0x74 | 0x75 | 0x76 | 0x7A | 0x7C | 0x7D | 0x7E => {
                warn!(
                    op = format_args!("{op:#04x}"),
                    "VU EFU op on the interpreter path"
                );
                Self::fallback(&mut instr, lower, false);
            }
            _ => {
                warn!(
                    op = format_args!("{op:#04x}"),
                    "unrecognized VU lower1 special op"
                );
                Self::fallback(&mut instr, lower, false);
            }
        }
        instrs.push(instr);
    }

    fn lower2(
        &mut self,
        instrs: &mut Vec<Instruction>,
        lower: u32,
        pc: u16,
        analysis: &VuAnalysis,
    ) {
        let op = (lower >> 25) & 0x7F;
        let mut instr = Instruction::default();

        let imm11 = |lower: u32| -> i64 {
            let imm = if lower & 0x400 != 0 {
                (lower & 0x3FF) | 0xFC00
            } else {
                lower & 0x3FF
            };
            i64::from(imm as u16 as i16)
        };

        match op {
            // LQ
            0x00 => {
                instr.op = Opcode::LoadQuad;
                instr.field = ((lower >> 21) & 0xF) as u8;
                instr.dest = Operand::Reg(((lower >> 16) & 0x1F) as u16);
                instr.base = ((lower >> 11) & 0xF) as u16;
                instr.source = Operand::Imm((imm11(lower) * 16) as u64);
                if instr.dest == Operand::Reg(0) {
                    return;
                }
            }
            // SQ
            0x01 => {
                self.tick_xgkick(instrs);
                instr.op = Opcode::StoreQuad;
                instr.field = ((lower >> 21) & 0xF) as u8;
                instr.source = Operand::Reg(((lower >> 11) & 0x1F) as u16);
                instr.base = ((lower >> 16) & 0xF) as u16;
                instr.source2 = Operand::Imm((imm11(lower) * 16) as u64);
            }
            // ILW
            0x04 => {
                instr.op = Opcode::LoadInt;
                instr.field = ((lower >> 21) & 0xF) as u8;
                instr.dest = Operand::Reg(((lower >> 16) & 0xF) as u16);
                instr.base = ((lower >> 11) & 0xF) as u16;
                instr.source = Operand::Imm((imm11(lower) * 16) as u64);
                if instr.dest == Operand::Reg(0) {
                    return;
                }
            }
            // ISW
            0x05 => {
                self.tick_xgkick(instrs);
                instr.op = Opcode::StoreInt;
                instr.field = ((lower >> 21) & 0xF) as u8;
                instr.source = Operand::Reg(((lower >> 16) & 0xF) as u16);
                instr.base = ((lower >> 11) & 0xF) as u16;
                instr.source2 = Operand::Imm((imm11(lower) * 16) as u64);
            }
            // IADDIU / ISUBIU
            0x08 | 0x09 => {
                instr.op = if op == 0x08 {
                    Opcode::AddUnsignedImm
                } else {
                    Opcode::SubUnsignedImm
                };
                instr.dest = Operand::Reg(((lower >> 16) & 0xF) as u16);
                instr.source = Operand::Reg(((lower >> 11) & 0xF) as u16);
                let imm = (lower & 0x7FF) | (((lower >> 21) & 0xF) << 11);
                instr.source2 = Operand::Imm(u64::from(imm));
                if instr.source == Operand::Reg(0) && op == 0x08 {
                    instr.op = Opcode::LoadConst;
                    instr.source = Operand::Imm(u64::from(imm));
                }
                if instr.dest == Operand::Reg(0) {
                    return;
                }
            }
            // FCSET / FCAND / FCOR
            0x11 => {
                instr.op = Opcode::SetClipFlags;
                instr.source = Operand::Imm(u64::from(lower & 0xFF_FFFF));
            }
            0x12 => {
                instr.op = Opcode::AndClipFlags;
                instr.source = Operand::Imm(u64::from(lower & 0xFF_FFFF));
            }
            0x13 => {
                instr.op = Opcode::OrClipFlags;
                instr.source = Operand::Imm(u64::from(lower & 0xFF_FFFF));
            }
            // FSAND
            0x16 => {
                let imm = (((lower >> 21) & 0x1) << 11) | (lower & 0x7FF);
                instr.op = Opcode::AndStatFlags;
                instr.dest = Operand::Reg(((lower >> 16) & 0xF) as u16);
                instr.source = Operand::Imm(u64::from(imm));
                if instr.dest == Operand::Reg(0) {
                    return;
                }
            }
            // FMEQ / FMAND
            0x18 => {
                instr.op = Opcode::VMacEq;
                instr.source = Operand::Reg(((lower >> 11) & 0xF) as u16);
                instr.dest = Operand::Reg(((lower >> 16) & 0xF) as u16);
                if instr.dest == Operand::Reg(0) {
                    return;
                }
            }
            0x1A => {
                instr.op = Opcode::VMacAnd;
                instr.source = Operand::Reg(((lower >> 11) & 0xF) as u16);
                instr.dest = Operand::Reg(((lower >> 16) & 0xF) as u16);
                if instr.dest == Operand::Reg(0) {
                    return;
                }
            }
            // FCGET
            0x1C => {
                instr.op = Opcode::GetClipFlags;
                instr.dest = Operand::Reg(((lower >> 16) & 0xF) as u16);
                if instr.dest == Operand::Reg(0) {
                    return;
                }
            }
            // B / BAL
            0x20 => {
                instr.op = Opcode::Jump;
                instr.jump_dest = Self::branch_offset(lower, pc);
            }
            0x21 => {
                instr.op = Opcode::JumpAndLink;
                instr.jump_dest = Self::branch_offset(lower, pc);
                instr.return_addr = (u32::from(pc) + 16) / 8;
                instr.dest = Operand::Reg(((lower >> 16) & 0xF) as u16);
                instr.bc = u8::from(self.branch_delay_slot);
                if instr.dest == Operand::Reg(0) {
                    instr.op = Opcode::Jump;
                }
            }
            // JR / JALR
            0x24 => {
                instr.op = Opcode::JumpIndirect;
                instr.source = Operand::Reg(((lower >> 11) & 0xF) as u16);
            }
            0x25 => {
                instr.op = Opcode::JumpAndLinkIndirect;
                instr.source = Operand::Reg(((lower >> 11) & 0xF) as u16);
                instr.return_addr = (u32::from(pc) + 16) / 8;
                instr.dest = Operand::Reg(((lower >> 16) & 0xF) as u16);
                instr.bc = u8::from(self.branch_delay_slot);
                if instr.dest == Operand::Reg(0) {
                    instr.op = Opcode::JumpIndirect;
                }
            }
            // IBEQ / IBNE / IBLTZ / IBGTZ / IBLEZ / IBGEZ
            0x28 | 0x29 | 0x2C..=0x2F => {
                instr.op = match op {
                    0x28 => Opcode::BranchEqual,
                    0x29 => Opcode::BranchNotEqual,
                    0x2C => Opcode::BranchLessThanZero,
                    0x2D => Opcode::BranchGreaterThanZero,
                    0x2E => Opcode::BranchLessThanOrEqualZero,
                    _ => Opcode::BranchGreaterThanOrEqualZero,
                };
                instr.source = Operand::Reg(((lower >> 11) & 0xF) as u16);
                if matches!(op, 0x28 | 0x29) {
                    instr.source2 = Operand::Reg(((lower >> 16) & 0xF) as u16);
                }
                instr.jump_dest = Self::branch_offset(lower, pc);
                instr.jump_fail_dest = u32::from(pc) + 16;
                instr.bc = u8::from(self.branch_delay_slot);
                instr.field = u8::from(analysis.at(pc).use_backup_vi);
            }
            _ => {
                warn!(op = format_args!("{op:#04x}"), "unrecognized VU lower2 op");
                Self::fallback(&mut instr, lower, false);
            }
        }
        instrs.push(instr);
    }

    fn fallback(instr: &mut Instruction, word: u32, is_upper: bool) {
        instr.op = Opcode::FallbackInterpreter;
        instr.source = Operand::Imm(u64::from(word));
        instr.field = u8::from(is_upper);
    }
}
