//! EE decoder and translator.
//!
//! Scans guest code forward from the entry PC, producing one IR
//! instruction per 32-bit guest word (occasionally more, when an operation
//! needs COP2 synchronization prefixes). Alongside the IR it records
//! dependency information per instruction — read set, write set, issue
//! pipeline, latency — which drives the dual-issue cycle model that
//! produces the block's cycle count.
//!
//! A block ends one instruction after a branch (the delay slot), or
//! immediately after SYSCALL/ERET (whose handlers redirect PC themselves).
//! Unknown or unimplemented words become `FallbackInterpreter`
//! instructions carrying the raw word and the host's reference
//! interpreter entry point.

use tracing::trace;

use crate::ir::{Block, Instruction, Opcode, Operand};
use crate::state::{
    EeBus, EeState, EE_FPU_ACC, EE_REG_HI, EE_REG_HI1, EE_REG_LO, EE_REG_LO1, EE_REG_SA,
};

/// Issue pipelines of the EE's dual-issue integer core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EePipeline {
    /// Either integer pipe.
    IntGeneric,
    /// Integer pipe 0 only (shifts by SA, MFSA family).
    Int0,
    /// Integer pipe 1 only (LZC, MULT/DIV issue).
    Int1,
    /// Occupies both integer pipes (128-bit MMI).
    IntWide,
    /// Load/store pipe.
    LoadStore,
    /// Branch pipe.
    Branch,
    /// COP0 transfer.
    Cop0,
    /// COP1 (FPU) pipe.
    Cop1,
    /// COP2 (VU0 macro) pipe.
    Cop2,
    /// SA-register access.
    Sa,
    /// ERET; serializes the pipeline.
    Eret,
    /// SYNC; serializes the pipeline.
    Sync,
    /// Leading-zero count unit.
    Lzc,
    /// Multiply/accumulate pipe 0.
    Mac0,
    /// Multiply/accumulate pipe 1.
    Mac1,
}

/// Dependency and timing info for one decoded instruction.
#[derive(Debug, Clone, Copy)]
pub struct EeInstrInfo {
    /// Guest registers read; bits 0-31 GPRs, bits 32+ specials.
    pub read_set: u64,
    /// Guest registers written.
    pub write_set: u64,
    /// Issue pipeline.
    pub pipeline: EePipeline,
    /// Cycles until the result is usable.
    pub latency: u8,
    /// Cycles the pipeline stays busy.
    pub throughput: u8,
}

impl EeInstrInfo {
    fn new(pipeline: EePipeline) -> Self {
        Self {
            read_set: 0,
            write_set: 0,
            pipeline,
            latency: 1,
            throughput: 1,
        }
    }

    fn read(mut self, reg: u16) -> Self {
        if reg != 0 {
            self.read_set |= 1 << reg;
        }
        self
    }

    fn write(mut self, reg: u16) -> Self {
        if reg != 0 {
            self.write_set |= 1 << reg;
        }
        self
    }

    fn timing(mut self, latency: u8, throughput: u8) -> Self {
        self.latency = latency;
        self.throughput = throughput;
        self
    }
}

/// Field accessors for a MIPS instruction word.
trait MipsFields {
    fn rs(self) -> u16;
    fn rt(self) -> u16;
    fn rd(self) -> u16;
    fn sa_field(self) -> u8;
    fn imm16(self) -> u16;
    fn simm16(self) -> i64;
}

impl MipsFields for u32 {
    #[inline(always)]
    fn rs(self) -> u16 {
        ((self >> 21) & 0x1F) as u16
    }
    #[inline(always)]
    fn rt(self) -> u16 {
        ((self >> 16) & 0x1F) as u16
    }
    #[inline(always)]
    fn rd(self) -> u16 {
        ((self >> 11) & 0x1F) as u16
    }
    #[inline(always)]
    fn sa_field(self) -> u8 {
        ((self >> 6) & 0x1F) as u8
    }
    #[inline(always)]
    fn imm16(self) -> u16 {
        (self & 0xFFFF) as u16
    }
    #[inline(always)]
    fn simm16(self) -> i64 {
        i64::from(self as u16 as i16)
    }
}

/// One decoded guest word: zero or more IR instructions plus its
/// dependency info.
struct DecodedOp {
    instrs: Vec<Instruction>,
    info: EeInstrInfo,
    /// Ends the block after its delay slot.
    is_branch: bool,
    /// Ends the block immediately (no delay slot).
    is_serial: bool,
}

/// The EE translator. Stateless between blocks apart from scratch.
#[derive(Debug, Default)]
pub struct EeTranslator {
    cycles_this_block: u16,
}

impl EeTranslator {
    /// Creates a translator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Translates the block starting at the state's current PC.
    ///
    /// Guest words are fetched through the bus's `read32` accessor, so the
    /// translator observes exactly what the guest would.
    pub fn translate(&mut self, state: &mut EeState, bus: &EeBus) -> Block {
        let mut block = Block::new();
        let start_pc = state.pc;
        let mut pc = start_pc;
        let mut infos: Vec<EeInstrInfo> = Vec::new();
        self.cycles_this_block = 0;

        loop {
            // Rough running position, consumed by suspension-point ops
            // (SYSCALL, COP2 waits) that report partial progress.
            self.cycles_this_block = (infos.len() as u16).saturating_add(1);
            // SAFETY: the accessor contract takes the state pointer; the
            // state outlives this call.
            let word = unsafe { (bus.read32)(state as *mut EeState, pc) };
            let op = self.translate_op(word, pc, bus);
            infos.push(op.info);
            for instr in op.instrs {
                block.add_instr(instr);
            }

            if op.is_serial {
                pc = pc.wrapping_add(4);
                break;
            }
            if op.is_branch {
                // Delay slot, then end of block.
                pc = pc.wrapping_add(4);
                // SAFETY: as above.
                let slot_word = unsafe { (bus.read32)(state as *mut EeState, pc) };
                let slot = self.translate_op(slot_word, pc, bus);
                infos.push(slot.info);
                for instr in slot.instrs {
                    block.add_instr(instr);
                }
                pc = pc.wrapping_add(4);
                break;
            }
            pc = pc.wrapping_add(4);
        }

        let cycles = Self::count_cycles(&infos);
        block.set_cycle_count(cycles);
        trace!(
            pc = format_args!("{start_pc:#010x}"),
            words = infos.len(),
            cycles,
            "translated EE block"
        );
        block
    }

    /// Dual-issue cycle model: adjacent instructions pair when their
    /// pipelines are compatible and no register dependency links them;
    /// long-latency producers stall an immediately following consumer.
    fn count_cycles(infos: &[EeInstrInfo]) -> u16 {
        let mut cycles: u32 = 0;
        let mut i = 0;
        while i < infos.len() {
            let a = &infos[i];
            let paired = infos.get(i + 1).is_some_and(|b| Self::can_pair(a, b));
            cycles += u32::from(a.throughput.max(1));
            if let Some(b) = infos.get(i + 1) {
                // A consumer right behind a long-latency producer eats the
                // remaining latency even when it issues in the next slot.
                if a.latency > 1 && (a.write_set & (b.read_set | b.write_set)) != 0 {
                    cycles += u32::from(a.latency - 1);
                }
            }
            i += if paired { 2 } else { 1 };
        }
        cycles.max(1).min(u32::from(u16::MAX)) as u16
    }

    fn can_pair(a: &EeInstrInfo, b: &EeInstrInfo) -> bool {
        use EePipeline as P;
        if (a.write_set & (b.read_set | b.write_set)) != 0 {
            return false;
        }
        let serial = |p: P| {
            matches!(
                p,
                P::IntWide | P::Cop0 | P::Sa | P::Eret | P::Sync | P::Mac0 | P::Mac1
            )
        };
        if serial(a.pipeline) || serial(b.pipeline) {
            return false;
        }
        // Single-issue units cannot double up; the two generic ALU pipes can.
        if a.pipeline == b.pipeline {
            return a.pipeline == P::IntGeneric;
        }
        true
    }

    // --- decode ---------------------------------------------------------

    fn translate_op(&mut self, word: u32, pc: u32, bus: &EeBus) -> DecodedOp {
        let opcode = word >> 26;
        match opcode {
            0x00 => self.op_special(word, pc, bus),
            0x01 => self.op_regimm(word, pc, bus),
            // J / JAL
            0x02 | 0x03 => {
                let dest = ((pc.wrapping_add(4)) & 0xF000_0000) | ((word & 0x03FF_FFFF) << 2);
                let mut instr = Instruction::new(if opcode == 0x02 {
                    Opcode::Jump
                } else {
                    Opcode::JumpAndLink
                });
                instr.jump_dest = dest;
                instr.return_addr = pc.wrapping_add(8);
                instr.is_link = opcode == 0x03;
                let mut info = EeInstrInfo::new(EePipeline::Branch);
                if opcode == 0x03 {
                    instr.dest = Operand::Reg(31);
                    info = info.write(31);
                }
                Self::branch_op(instr, info)
            }
            // BEQ / BNE / BLEZ / BGTZ (+ likely variants at 0x14-0x17)
            0x04 | 0x05 | 0x14 | 0x15 => {
                let eq = opcode & 0xF == 0x4;
                let mut instr = if word.rs() == 0 || word.rt() == 0 {
                    // Compare-against-zero form; BEQ $zero, $zero is an
                    // unconditional branch the zero form also handles.
                    let mut i = Self::branch_instr(
                        if eq {
                            Opcode::BranchEqualZero
                        } else {
                            Opcode::BranchNotEqualZero
                        },
                        word,
                        pc,
                    );
                    i.source = Operand::Reg(word.rs().max(word.rt()));
                    i
                } else {
                    Self::branch_instr(
                        if eq {
                            Opcode::BranchEqual
                        } else {
                            Opcode::BranchNotEqual
                        },
                        word,
                        pc,
                    )
                };
                instr.is_likely = opcode >= 0x14;
                let info = EeInstrInfo::new(EePipeline::Branch)
                    .read(word.rs())
                    .read(word.rt());
                Self::branch_op(instr, info)
            }
            0x06 | 0x16 => {
                let mut instr = Self::branch_instr(Opcode::BranchLessThanOrEqualZero, word, pc);
                instr.is_likely = opcode == 0x16;
                let info = EeInstrInfo::new(EePipeline::Branch).read(word.rs());
                Self::branch_op(instr, info)
            }
            0x07 | 0x17 => {
                let mut instr = Self::branch_instr(Opcode::BranchGreaterThanZero, word, pc);
                instr.is_likely = opcode == 0x17;
                let info = EeInstrInfo::new(EePipeline::Branch).read(word.rs());
                Self::branch_op(instr, info)
            }
            // ADDI/ADDIU (identical here: the recompiler does not raise
            // integer overflow exceptions, matching the reference core)
            0x08 | 0x09 => {
                let mut instr = Instruction::new(Opcode::AddWordImm);
                instr.dest = Operand::Reg(word.rt());
                instr.source = Operand::Reg(word.rs());
                instr.source2 = Operand::Imm(word.simm16() as u64);
                Self::alu_op(
                    instr,
                    EeInstrInfo::new(EePipeline::IntGeneric)
                        .read(word.rs())
                        .write(word.rt()),
                )
            }
            // SLTI / SLTIU
            0x0A | 0x0B => {
                let op = if opcode == 0x0A {
                    Opcode::SetOnLessThanImmediate
                } else {
                    Opcode::SetOnLessThanImmediateUnsigned
                };
                let mut instr = Instruction::new(op);
                instr.dest = Operand::Reg(word.rt());
                instr.source = Operand::Reg(word.rs());
                instr.source2 = Operand::Imm(word.simm16() as u64);
                Self::alu_op(
                    instr,
                    EeInstrInfo::new(EePipeline::IntGeneric)
                        .read(word.rs())
                        .write(word.rt()),
                )
            }
            // ANDI / ORI / XORI (zero-extended immediates)
            0x0C | 0x0D | 0x0E => {
                let op = match opcode {
                    0x0C => Opcode::AndImm,
                    0x0D => Opcode::OrImm,
                    _ => Opcode::XorImm,
                };
                let mut instr = Instruction::new(op);
                instr.dest = Operand::Reg(word.rt());
                instr.source = Operand::Reg(word.rs());
                instr.source2 = Operand::Imm(u64::from(word.imm16()));
                Self::alu_op(
                    instr,
                    EeInstrInfo::new(EePipeline::IntGeneric)
                        .read(word.rs())
                        .write(word.rt()),
                )
            }
            // LUI
            0x0F => {
                let mut instr = Instruction::new(Opcode::LoadConst);
                instr.dest = Operand::Reg(word.rt());
                instr.source = Operand::Imm((word.simm16() << 16) as u64);
                Self::alu_op(
                    instr,
                    EeInstrInfo::new(EePipeline::IntGeneric).write(word.rt()),
                )
            }
            0x10 => self.op_cop0(word, pc, bus),
            0x11 => self.op_cop1(word, pc, bus),
            0x12 => self.op_cop2(word, pc, bus),
            // BEQL family handled above with their non-likely twins.
            // DADDI / DADDIU
            0x18 | 0x19 => {
                let mut instr = Instruction::new(Opcode::AddDoublewordImm);
                instr.dest = Operand::Reg(word.rt());
                instr.source = Operand::Reg(word.rs());
                instr.source2 = Operand::Imm(word.simm16() as u64);
                Self::alu_op(
                    instr,
                    EeInstrInfo::new(EePipeline::IntGeneric)
                        .read(word.rs())
                        .write(word.rt()),
                )
            }
            // LDL / LDR
            0x1A | 0x1B => {
                let op = if opcode == 0x1A {
                    Opcode::LoadDoublewordLeft
                } else {
                    Opcode::LoadDoublewordRight
                };
                Self::load_op(op, word, EeInstrInfo::new(EePipeline::LoadStore).timing(2, 1))
            }
            0x1C => self.op_mmi(word, pc, bus),
            // LQ / SQ
            0x1E => Self::load_op(
                Opcode::LoadQuadword,
                word,
                EeInstrInfo::new(EePipeline::LoadStore).timing(2, 1),
            ),
            0x1F => Self::store_op(Opcode::StoreQuadword, word),
            0x20 => Self::load_op(
                Opcode::LoadByte,
                word,
                EeInstrInfo::new(EePipeline::LoadStore).timing(2, 1),
            ),
            0x21 => Self::load_op(
                Opcode::LoadHalfword,
                word,
                EeInstrInfo::new(EePipeline::LoadStore).timing(2, 1),
            ),
            0x22 => Self::load_op(
                Opcode::LoadWordLeft,
                word,
                EeInstrInfo::new(EePipeline::LoadStore).timing(2, 1),
            ),
            0x23 => Self::load_op(
                Opcode::LoadWord,
                word,
                EeInstrInfo::new(EePipeline::LoadStore).timing(2, 1),
            ),
            0x24 => Self::load_op(
                Opcode::LoadByteUnsigned,
                word,
                EeInstrInfo::new(EePipeline::LoadStore).timing(2, 1),
            ),
            0x25 => Self::load_op(
                Opcode::LoadHalfwordUnsigned,
                word,
                EeInstrInfo::new(EePipeline::LoadStore).timing(2, 1),
            ),
            0x26 => Self::load_op(
                Opcode::LoadWordRight,
                word,
                EeInstrInfo::new(EePipeline::LoadStore).timing(2, 1),
            ),
            0x27 => Self::load_op(
                Opcode::LoadWordUnsigned,
                word,
                EeInstrInfo::new(EePipeline::LoadStore).timing(2, 1),
            ),
            0x28 => Self::store_op(Opcode::StoreByte, word),
            0x29 => Self::store_op(Opcode::StoreHalfword, word),
            0x2A => Self::store_op(Opcode::StoreWordLeft, word),
            0x2B => Self::store_op(Opcode::StoreWord, word),
            0x2C => Self::store_op(Opcode::StoreDoublewordLeft, word),
            0x2D => Self::store_op(Opcode::StoreDoublewordRight, word),
            0x2E => Self::store_op(Opcode::StoreWordRight, word),
            // CACHE: no architectural effect the recompiler models.
            0x2F => Self::nop_op(),
            // LWC1
            0x31 => {
                let mut instr = Instruction::new(Opcode::LoadWordCop1);
                instr.dest = Operand::Reg(word.rt());
                instr.source = Operand::Reg(word.rs());
                instr.source2 = Operand::Imm(word.simm16() as u64);
                DecodedOp {
                    instrs: vec![instr],
                    info: EeInstrInfo::new(EePipeline::LoadStore)
                        .read(word.rs())
                        .timing(2, 1),
                    is_branch: false,
                    is_serial: false,
                }
            }
            // PREF: hint only.
            0x33 => Self::nop_op(),
            0x37 => Self::load_op(
                Opcode::LoadDoubleword,
                word,
                EeInstrInfo::new(EePipeline::LoadStore).timing(2, 1),
            ),
            // SWC1
            0x39 => {
                let mut instr = Instruction::new(Opcode::StoreWordCop1);
                instr.source = Operand::Reg(word.rt());
                instr.dest = Operand::Reg(word.rs());
                instr.source2 = Operand::Imm(word.simm16() as u64);
                DecodedOp {
                    instrs: vec![instr],
                    info: EeInstrInfo::new(EePipeline::LoadStore).read(word.rs()),
                    is_branch: false,
                    is_serial: false,
                }
            }
            0x3F => Self::store_op(Opcode::StoreDoubleword, word),
            _ => self.fallback_op(word, pc, bus, false),
        }
    }

    fn op_special(&mut self, word: u32, pc: u32, bus: &EeBus) -> DecodedOp {
        let funct = word & 0x3F;
        match funct {
            // SLL (and NOP when the word is all zero)
            0x00 => {
                if word == 0 {
                    return Self::nop_op();
                }
                Self::shift_imm_op(Opcode::ShiftLeftLogical, word)
            }
            0x02 => Self::shift_imm_op(Opcode::ShiftRightLogical, word),
            0x03 => Self::shift_imm_op(Opcode::ShiftRightArithmetic, word),
            0x04 => Self::shift_var_op(Opcode::ShiftLeftLogicalVariable, word),
            0x06 => Self::shift_var_op(Opcode::ShiftRightLogicalVariable, word),
            0x07 => Self::shift_var_op(Opcode::ShiftRightArithmeticVariable, word),
            // JR / JALR
            0x08 | 0x09 => {
                let mut instr = Instruction::new(if funct == 0x08 {
                    Opcode::JumpIndirect
                } else {
                    Opcode::JumpAndLinkIndirect
                });
                instr.source = Operand::Reg(word.rs());
                instr.dest = Operand::Reg(word.rd());
                instr.return_addr = pc.wrapping_add(8);
                instr.is_link = funct == 0x09;
                let mut info = EeInstrInfo::new(EePipeline::Branch).read(word.rs());
                if funct == 0x09 {
                    info = info.write(word.rd());
                }
                Self::branch_op(instr, info)
            }
            // MOVZ / MOVN
            0x0A | 0x0B => {
                let op = if funct == 0x0A {
                    Opcode::MoveConditionalOnZero
                } else {
                    Opcode::MoveConditionalOnNotZero
                };
                let mut instr = Instruction::new(op);
                instr.dest = Operand::Reg(word.rd());
                instr.source = Operand::Reg(word.rs());
                instr.source2 = Operand::Reg(word.rt());
                Self::alu_op(
                    instr,
                    EeInstrInfo::new(EePipeline::IntGeneric)
                        .read(word.rs())
                        .read(word.rt())
                        .read(word.rd())
                        .write(word.rd()),
                )
            }
            // SYSCALL
            0x0C => {
                let mut instr = Instruction::new(Opcode::SystemCall);
                instr.return_addr = pc;
                instr.cycle_count = self.cycles_this_block;
                DecodedOp {
                    instrs: vec![instr],
                    info: EeInstrInfo::new(EePipeline::Eret),
                    is_branch: false,
                    is_serial: true,
                }
            }
            // BREAK and the trap family are exceptional control flow the
            // reference interpreter owns.
            0x0D | 0x30..=0x37 => self.fallback_op(word, pc, bus, false),
            // SYNC: ordering hint only.
            0x0F => Self::nop_op(),
            // MFHI / MTHI / MFLO / MTLO
            0x10 => Self::hilo_move(Opcode::MoveFromLoHi, word.rd(), EE_REG_HI),
            0x11 => Self::hilo_move(Opcode::MoveToLoHi, EE_REG_HI, word.rs()),
            0x12 => Self::hilo_move(Opcode::MoveFromLoHi, word.rd(), EE_REG_LO),
            0x13 => Self::hilo_move(Opcode::MoveToLoHi, EE_REG_LO, word.rs()),
            // DSLLV / DSRLV / DSRAV
            0x14 => Self::shift_var_op(Opcode::DoublewordShiftLeftLogicalVariable, word),
            0x16 => Self::shift_var_op(Opcode::DoublewordShiftRightLogicalVariable, word),
            0x17 => Self::shift_var_op(Opcode::DoublewordShiftRightArithmeticVariable, word),
            // MULT / MULTU
            0x18 | 0x19 => {
                let op = if funct == 0x18 {
                    Opcode::MultiplyWord
                } else {
                    Opcode::MultiplyUnsignedWord
                };
                Self::muldiv_op(op, word, EePipeline::Mac0, 4)
            }
            // DIV / DIVU
            0x1A | 0x1B => {
                let op = if funct == 0x1A {
                    Opcode::DivideWord
                } else {
                    Opcode::DivideUnsignedWord
                };
                Self::muldiv_op(op, word, EePipeline::Mac0, 37)
            }
            // ADD / ADDU
            0x20 | 0x21 => Self::rtype_op(
                Opcode::AddWordReg,
                word,
                EeInstrInfo::new(EePipeline::IntGeneric),
            ),
            // SUB / SUBU
            0x22 | 0x23 => Self::rtype_op(
                Opcode::SubWordReg,
                word,
                EeInstrInfo::new(EePipeline::IntGeneric),
            ),
            0x24 => Self::rtype_op(
                Opcode::AndReg,
                word,
                EeInstrInfo::new(EePipeline::IntGeneric),
            ),
            0x25 => Self::rtype_op(
                Opcode::OrReg,
                word,
                EeInstrInfo::new(EePipeline::IntGeneric),
            ),
            0x26 => Self::rtype_op(
                Opcode::XorReg,
                word,
                EeInstrInfo::new(EePipeline::IntGeneric),
            ),
            0x27 => Self::rtype_op(
                Opcode::NorReg,
                word,
                EeInstrInfo::new(EePipeline::IntGeneric),
            ),
            // MFSA / MTSA
            0x28 => Self::hilo_move(Opcode::MoveFromSa, word.rd(), EE_REG_SA),
            0x29 => Self::hilo_move(Opcode::MoveToSa, EE_REG_SA, word.rs()),
            0x2A => Self::rtype_op(
                Opcode::SetOnLessThan,
                word,
                EeInstrInfo::new(EePipeline::IntGeneric),
            ),
            0x2B => Self::rtype_op(
                Opcode::SetOnLessThanUnsigned,
                word,
                EeInstrInfo::new(EePipeline::IntGeneric),
            ),
            // DADD / DADDU / DSUB / DSUBU
            0x2C | 0x2D => Self::rtype_op(
                Opcode::AddDoublewordReg,
                word,
                EeInstrInfo::new(EePipeline::IntGeneric),
            ),
            0x2E | 0x2F => Self::rtype_op(
                Opcode::SubDoublewordReg,
                word,
                EeInstrInfo::new(EePipeline::IntGeneric),
            ),
            // DSLL / DSRL / DSRA / DSLL32 / DSRL32 / DSRA32
            0x38 => Self::shift_imm_op(Opcode::DoublewordShiftLeftLogical, word),
            0x3A => Self::shift_imm_op(Opcode::DoublewordShiftRightLogical, word),
            0x3B => Self::shift_imm_op(Opcode::DoublewordShiftRightArithmetic, word),
            0x3C => Self::shift_imm32_op(Opcode::DoublewordShiftLeftLogical, word),
            0x3E => Self::shift_imm32_op(Opcode::DoublewordShiftRightLogical, word),
            0x3F => Self::shift_imm32_op(Opcode::DoublewordShiftRightArithmetic, word),
            _ => self.fallback_op(word, pc, bus, false),
        }
    }

    fn op_regimm(&mut self, word: u32, pc: u32, bus: &EeBus) -> DecodedOp {
        let op = word.rt();
        match op {
            // BLTZ / BGEZ (+ likely, + and-link)
            0x00 | 0x02 | 0x10 | 0x12 => {
                let mut instr = Instruction::new(Opcode::BranchLessThanZero);
                instr.source = Operand::Reg(word.rs());
                instr.jump_dest = Self::branch_dest(word, pc);
                instr.jump_fail_dest = pc.wrapping_add(8);
                instr.is_likely = op == 0x02 || op == 0x12;
                instr.is_link = op >= 0x10;
                instr.return_addr = pc.wrapping_add(8);
                let mut info = EeInstrInfo::new(EePipeline::Branch).read(word.rs());
                if instr.is_link {
                    instr.dest = Operand::Reg(31);
                    info = info.write(31);
                }
                Self::branch_op(instr, info)
            }
            0x01 | 0x03 | 0x11 | 0x13 => {
                let mut instr = Instruction::new(Opcode::BranchGreaterThanOrEqualZero);
                instr.source = Operand::Reg(word.rs());
                instr.jump_dest = Self::branch_dest(word, pc);
                instr.jump_fail_dest = pc.wrapping_add(8);
                instr.is_likely = op == 0x03 || op == 0x13;
                instr.is_link = op >= 0x11;
                instr.return_addr = pc.wrapping_add(8);
                let mut info = EeInstrInfo::new(EePipeline::Branch).read(word.rs());
                if instr.is_link {
                    instr.dest = Operand::Reg(31);
                    info = info.write(31);
                }
                Self::branch_op(instr, info)
            }
            _ => self.fallback_op(word, pc, bus, false),
        }
    }

    fn op_cop0(&mut self, word: u32, pc: u32, bus: &EeBus) -> DecodedOp {
        let fmt = word.rs();
        match fmt {
            // ERET lives under the C0 format.
            0x10 if word & 0x3F == 0x18 => {
                let mut instr = Instruction::new(Opcode::ExceptionReturn);
                instr.return_addr = pc;
                instr.cycle_count = self.cycles_this_block;
                DecodedOp {
                    instrs: vec![instr],
                    info: EeInstrInfo::new(EePipeline::Eret),
                    is_branch: false,
                    is_serial: true,
                }
            }
            // BC0x is a branch through COP0 condition state the reference
            // interpreter owns; it redirects PC itself.
            0x08 => self.fallback_op(word, pc, bus, true),
            // MFC0/MTC0/EI/DI and the TLB ops stay on the interpreter.
            _ => self.fallback_op(word, pc, bus, false),
        }
    }

    fn op_cop1(&mut self, word: u32, pc: u32, bus: &EeBus) -> DecodedOp {
        let fmt = word.rs();
        let fd = u16::from(word.sa_field());
        let fs = word.rd();
        let ft = word.rt();
        let fpu = |op: Opcode| {
            let mut instr = Instruction::new(op);
            instr.dest = Operand::Reg(fd);
            instr.source = Operand::Reg(fs);
            instr.source2 = Operand::Reg(ft);
            DecodedOp {
                instrs: vec![instr],
                info: EeInstrInfo::new(EePipeline::Cop1).timing(4, 1),
                is_branch: false,
                is_serial: false,
            }
        };
        let fpu_acc_dest = |op: Opcode| {
            let mut d = fpu(op);
            for instr in &mut d.instrs {
                instr.dest = Operand::Reg(EE_FPU_ACC);
            }
            d
        };
        match fmt {
            // MFC1
            0x00 => {
                let mut instr = Instruction::new(Opcode::MoveWordFromCop1);
                instr.dest = Operand::Reg(word.rt());
                instr.source = Operand::Reg(fs);
                DecodedOp {
                    instrs: vec![instr],
                    info: EeInstrInfo::new(EePipeline::Cop1).write(word.rt()).timing(2, 1),
                    is_branch: false,
                    is_serial: false,
                }
            }
            // MTC1
            0x04 => {
                let mut instr = Instruction::new(Opcode::MoveWordToCop1);
                instr.dest = Operand::Reg(fs);
                instr.source = Operand::Reg(word.rt());
                DecodedOp {
                    instrs: vec![instr],
                    info: EeInstrInfo::new(EePipeline::Cop1).read(word.rt()),
                    is_branch: false,
                    is_serial: false,
                }
            }
            // BC1F/BC1T/BC1FL/BC1TL
            0x08 => {
                let nd_tf = word.rt();
                let mut instr = Instruction::new(Opcode::BranchCop1);
                instr.jump_dest = Self::branch_dest(word, pc);
                instr.jump_fail_dest = pc.wrapping_add(8);
                instr.field = (nd_tf & 1) as u8; // branch when condition == field
                instr.is_likely = nd_tf >= 2;
                Self::branch_op(instr, EeInstrInfo::new(EePipeline::Branch))
            }
            // S format
            0x10 => match word & 0x3F {
                0x00 => fpu(Opcode::FloatingPointAdd),
                0x01 => fpu(Opcode::FloatingPointSubtract),
                0x02 => fpu(Opcode::FloatingPointMultiply),
                0x03 => {
                    let mut d = fpu(Opcode::FloatingPointDivide);
                    d.info = d.info.timing(8, 8);
                    d
                }
                0x04 => {
                    // SQRT reads ft on the EE.
                    let mut instr = Instruction::new(Opcode::FloatingPointSquareRoot);
                    instr.dest = Operand::Reg(fd);
                    instr.source = Operand::Reg(ft);
                    DecodedOp {
                        instrs: vec![instr],
                        info: EeInstrInfo::new(EePipeline::Cop1).timing(8, 8),
                        is_branch: false,
                        is_serial: false,
                    }
                }
                0x05 => fpu(Opcode::FloatingPointAbsoluteValue),
                0x06 => fpu(Opcode::FloatingPointMove),
                0x07 => fpu(Opcode::FloatingPointNegate),
                0x16 => {
                    let mut d = fpu(Opcode::FloatingPointReciprocalSquareRoot);
                    d.info = d.info.timing(8, 8);
                    d
                }
                // The accumulator family: ADDA/SUBA/MULA write ACC, the
                // MADD/MSUB pair read it, MADDA/MSUBA do both.
                0x18 => fpu_acc_dest(Opcode::FloatingPointAdd),
                0x19 => fpu_acc_dest(Opcode::FloatingPointSubtract),
                0x1A => fpu_acc_dest(Opcode::FloatingPointMultiply),
                0x1C => fpu(Opcode::FloatingPointMultiplyAdd),
                0x1D => fpu(Opcode::FloatingPointMultiplySubtract),
                0x1E => fpu_acc_dest(Opcode::FloatingPointMultiplyAdd),
                0x1F => fpu_acc_dest(Opcode::FloatingPointMultiplySubtract),
                0x24 => fpu(Opcode::FloatingPointConvertToFixedPoint),
                0x28 => fpu(Opcode::FloatingPointMaximum),
                0x29 => fpu(Opcode::FloatingPointMinimum),
                // C.F.S always clears the condition flag.
                0x30 => fpu(Opcode::FloatingPointClearControl),
                0x32 => fpu(Opcode::FloatingPointCompareEqual),
                0x34 => fpu(Opcode::FloatingPointCompareLessThan),
                0x36 => fpu(Opcode::FloatingPointCompareLessThanOrEqual),
                _ => self.fallback_op(word, pc, bus, false),
            },
            // W format: CVT.S.W
            0x14 if word & 0x3F == 0x20 => fpu(Opcode::FixedPointConvertToFloatingPoint),
            _ => self.fallback_op(word, pc, bus, false),
        }
    }

    fn op_cop2(&mut self, word: u32, pc: u32, bus: &EeBus) -> DecodedOp {
        let fmt = word.rs();
        match fmt {
            // VCALLMS / VCALLMSR under the special2 format
            0x10..=0x1F if matches!(word & 0x3F, 0x38 | 0x39) => {
                let op = if word & 0x3F == 0x38 {
                    Opcode::VCallMs
                } else {
                    Opcode::VCallMsr
                };
                let mut wait = Instruction::new(Opcode::WaitVU0);
                wait.return_addr = pc;
                wait.cycle_count = self.cycles_this_block;
                let mut instr = Instruction::new(op);
                instr.source = Operand::Imm(u64::from((word >> 6) & 0x7FFF));
                instr.return_addr = pc;
                DecodedOp {
                    instrs: vec![wait, instr],
                    info: EeInstrInfo::new(EePipeline::Cop2),
                    is_branch: false,
                    is_serial: false,
                }
            }
            // Everything else COP2 (transfers and macro ops) goes to the
            // interpreter behind the interlock/wait protocol.
            _ => {
                let mut wait = Instruction::new(Opcode::WaitVU0);
                wait.return_addr = pc;
                wait.cycle_count = self.cycles_this_block;
                let check = {
                    let mut c = Instruction::new(Opcode::CheckInterlockVU0);
                    c.return_addr = pc;
                    c.cycle_count = self.cycles_this_block;
                    c
                };
                let mut fb = self.fallback_op(word, pc, bus, false);
                let mut instrs = vec![wait];
                // QMFC2/QMTC2/CFC2/CTC2 with the interlock bit honor it.
                if fmt <= 0x07 && word & 1 != 0 {
                    instrs.push(check);
                }
                instrs.append(&mut fb.instrs);
                DecodedOp {
                    instrs,
                    info: EeInstrInfo::new(EePipeline::Cop2),
                    is_branch: false,
                    is_serial: false,
                }
            }
        }
    }

    fn op_mmi(&mut self, word: u32, pc: u32, bus: &EeBus) -> DecodedOp {
        let funct = word & 0x3F;
        let sub = (word >> 6) & 0x1F;
        let wide =
            |op: Opcode| Self::rtype_op(op, word, EeInstrInfo::new(EePipeline::IntWide).timing(2, 1));
        match funct {
            // MULT1 / MULTU1 / DIV1 / DIVU1
            0x18 => Self::muldiv1_op(Opcode::MultiplyWord1, word, 4),
            0x19 => Self::muldiv1_op(Opcode::MultiplyUnsignedWord1, word, 4),
            0x1A => Self::muldiv1_op(Opcode::DivideWord1, word, 37),
            0x1B => Self::muldiv1_op(Opcode::DivideUnsignedWord1, word, 37),
            // MFHI1 / MTHI1 / MFLO1 / MTLO1
            0x10 => Self::hilo_move(Opcode::MoveFromLoHi1, word.rd(), EE_REG_HI1),
            0x11 => Self::hilo_move(Opcode::MoveToLoHi1, EE_REG_HI1, word.rs()),
            0x12 => Self::hilo_move(Opcode::MoveFromLoHi1, word.rd(), EE_REG_LO1),
            0x13 => Self::hilo_move(Opcode::MoveToLoHi1, EE_REG_LO1, word.rs()),
            // MMI0
            0x08 => match sub {
                0x00 => wide(Opcode::ParallelAddWord),
                0x01 => wide(Opcode::ParallelSubWord),
                0x04 => wide(Opcode::ParallelAddHalfword),
                0x05 => wide(Opcode::ParallelSubHalfword),
                0x08 => wide(Opcode::ParallelAddByte),
                0x09 => wide(Opcode::ParallelSubByte),
                0x14 => wide(Opcode::ParallelAddHalfwordSaturation),
                0x15 => wide(Opcode::ParallelSubHalfwordSaturation),
                0x18 => wide(Opcode::ParallelAddByteSaturation),
                0x19 => wide(Opcode::ParallelSubByteSaturation),
                _ => self.fallback_op(word, pc, bus, false),
            },
            // MMI1
            0x28 => match sub {
                0x14 => wide(Opcode::ParallelAddHalfwordUnsignedSaturation),
                0x15 => wide(Opcode::ParallelSubHalfwordUnsignedSaturation),
                0x18 => wide(Opcode::ParallelAddByteUnsignedSaturation),
                0x19 => wide(Opcode::ParallelSubByteUnsignedSaturation),
                _ => self.fallback_op(word, pc, bus, false),
            },
            // MMI2
            0x09 => match sub {
                0x0E => wide(Opcode::ParallelCopyLowerDoubleword),
                0x12 => wide(Opcode::ParallelAnd),
                0x13 => wide(Opcode::ParallelXor),
                _ => self.fallback_op(word, pc, bus, false),
            },
            // MMI3
            0x29 => match sub {
                0x0E => wide(Opcode::ParallelCopyUpperDoubleword),
                0x12 => wide(Opcode::ParallelOr),
                0x13 => wide(Opcode::ParallelNor),
                _ => self.fallback_op(word, pc, bus, false),
            },
            _ => self.fallback_op(word, pc, bus, false),
        }
    }

    // --- helpers --------------------------------------------------------

    fn branch_dest(word: u32, pc: u32) -> u32 {
        pc.wrapping_add(4).wrapping_add((word.simm16() << 2) as u32)
    }

    fn branch_instr(op: Opcode, word: u32, pc: u32) -> Instruction {
        let mut instr = Instruction::new(op);
        instr.source = Operand::Reg(word.rs());
        instr.source2 = Operand::Reg(word.rt());
        instr.jump_dest = Self::branch_dest(word, pc);
        instr.jump_fail_dest = pc.wrapping_add(8);
        instr
    }

    fn branch_op(instr: Instruction, info: EeInstrInfo) -> DecodedOp {
        DecodedOp {
            instrs: vec![instr],
            info,
            is_branch: true,
            is_serial: false,
        }
    }

    fn alu_op(instr: Instruction, info: EeInstrInfo) -> DecodedOp {
        // Writes to $zero vanish; the cycle model still sees the slot.
        let instrs = if matches!(instr.dest, Operand::Reg(0)) {
            Vec::new()
        } else {
            vec![instr]
        };
        DecodedOp {
            instrs,
            info,
            is_branch: false,
            is_serial: false,
        }
    }

    fn rtype_op(op: Opcode, word: u32, info: EeInstrInfo) -> DecodedOp {
        let mut instr = Instruction::new(op);
        instr.dest = Operand::Reg(word.rd());
        instr.source = Operand::Reg(word.rs());
        instr.source2 = Operand::Reg(word.rt());
        // Compiler-idiom peepholes: add/sub against $zero collapse into
        // clears and negates.
        match op {
            Opcode::AddWordReg if word.rs() == 0 && word.rt() == 0 => {
                instr.op = Opcode::ClearWordReg;
            }
            Opcode::AddDoublewordReg if word.rs() == 0 && word.rt() == 0 => {
                instr.op = Opcode::ClearDoublewordReg;
            }
            Opcode::SubWordReg if word.rs() == 0 && word.rt() != 0 => {
                instr.op = Opcode::NegateWordReg;
                instr.source = Operand::Reg(word.rt());
            }
            Opcode::SubDoublewordReg if word.rs() == 0 && word.rt() != 0 => {
                instr.op = Opcode::NegateDoublewordReg;
                instr.source = Operand::Reg(word.rt());
            }
            _ => {}
        }
        Self::alu_op(
            instr,
            info.read(word.rs()).read(word.rt()).write(word.rd()),
        )
    }

    fn shift_imm_op(op: Opcode, word: u32) -> DecodedOp {
        let mut instr = Instruction::new(op);
        instr.dest = Operand::Reg(word.rd());
        instr.source = Operand::Reg(word.rt());
        instr.source2 = Operand::Imm(u64::from(word.sa_field()));
        Self::alu_op(
            instr,
            EeInstrInfo::new(EePipeline::IntGeneric)
                .read(word.rt())
                .write(word.rd()),
        )
    }

    fn shift_imm32_op(op: Opcode, word: u32) -> DecodedOp {
        let mut instr = Instruction::new(op);
        instr.dest = Operand::Reg(word.rd());
        instr.source = Operand::Reg(word.rt());
        instr.source2 = Operand::Imm(u64::from(word.sa_field()) + 32);
        Self::alu_op(
            instr,
            EeInstrInfo::new(EePipeline::IntGeneric)
                .read(word.rt())
                .write(word.rd()),
        )
    }

    fn shift_var_op(op: Opcode, word: u32) -> DecodedOp {
        let mut instr = Instruction::new(op);
        instr.dest = Operand::Reg(word.rd());
        instr.source = Operand::Reg(word.rt());
        instr.source2 = Operand::Reg(word.rs());
        Self::alu_op(
            instr,
            EeInstrInfo::new(EePipeline::IntGeneric)
                .read(word.rt())
                .read(word.rs())
                .write(word.rd()),
        )
    }

    fn muldiv_op(op: Opcode, word: u32, pipeline: EePipeline, latency: u8) -> DecodedOp {
        let mut instr = Instruction::new(op);
        instr.dest = Operand::Reg(word.rd());
        instr.source = Operand::Reg(word.rs());
        instr.source2 = Operand::Reg(word.rt());
        DecodedOp {
            instrs: vec![instr],
            info: EeInstrInfo::new(pipeline)
                .read(word.rs())
                .read(word.rt())
                .write(word.rd())
                .write(EE_REG_LO)
                .write(EE_REG_HI)
                .timing(latency, latency),
            is_branch: false,
            is_serial: false,
        }
    }

    fn muldiv1_op(op: Opcode, word: u32, latency: u8) -> DecodedOp {
        let mut instr = Instruction::new(op);
        instr.dest = Operand::Reg(word.rd());
        instr.source = Operand::Reg(word.rs());
        instr.source2 = Operand::Reg(word.rt());
        DecodedOp {
            instrs: vec![instr],
            info: EeInstrInfo::new(EePipeline::Mac1)
                .read(word.rs())
                .read(word.rt())
                .write(word.rd())
                .write(EE_REG_LO1)
                .write(EE_REG_HI1)
                .timing(latency, latency),
            is_branch: false,
            is_serial: false,
        }
    }

    fn hilo_move(op: Opcode, dest: u16, source: u16) -> DecodedOp {
        let mut instr = Instruction::new(op);
        instr.dest = Operand::Reg(dest);
        instr.source = Operand::Reg(source);
        let pipeline = if matches!(op, Opcode::MoveFromSa | Opcode::MoveToSa) {
            EePipeline::Sa
        } else {
            EePipeline::IntGeneric
        };
        Self::alu_op(
            instr,
            EeInstrInfo::new(pipeline).read(source).write(dest),
        )
    }

    fn load_op(op: Opcode, word: u32, info: EeInstrInfo) -> DecodedOp {
        let mut instr = Instruction::new(op);
        instr.dest = Operand::Reg(word.rt());
        instr.source = Operand::Reg(word.rs());
        instr.source2 = Operand::Imm(word.simm16() as u64);
        let reads_dest = matches!(
            op,
            Opcode::LoadWordLeft
                | Opcode::LoadWordRight
                | Opcode::LoadDoublewordLeft
                | Opcode::LoadDoublewordRight
        );
        let mut info = info.read(word.rs()).write(word.rt());
        if reads_dest {
            info = info.read(word.rt());
        }
        let instrs = if word.rt() == 0 { Vec::new() } else { vec![instr] };
        DecodedOp {
            instrs,
            info,
            is_branch: false,
            is_serial: false,
        }
    }

    fn store_op(op: Opcode, word: u32) -> DecodedOp {
        let mut instr = Instruction::new(op);
        instr.source = Operand::Reg(word.rt());
        instr.dest = Operand::Reg(word.rs());
        instr.source2 = Operand::Imm(word.simm16() as u64);
        DecodedOp {
            instrs: vec![instr],
            info: EeInstrInfo::new(EePipeline::LoadStore)
                .read(word.rs())
                .read(word.rt()),
            is_branch: false,
            is_serial: false,
        }
    }

    fn nop_op() -> DecodedOp {
        DecodedOp {
            instrs: Vec::new(),
            info: EeInstrInfo::new(EePipeline::IntGeneric),
            is_branch: false,
            is_serial: false,
        }
    }

    fn fallback_op(&mut self, word: u32, pc: u32, bus: &EeBus, is_branch: bool) -> DecodedOp {
        let mut instr = Instruction::new(Opcode::FallbackInterpreter);
        instr.opcode = word;
        instr.return_addr = pc;
        instr.fallback = Some(bus.fallback);
        DecodedOp {
            instrs: vec![instr],
            info: EeInstrInfo::new(if is_branch {
                EePipeline::Branch
            } else {
                EePipeline::IntGeneric
            }),
            is_branch,
            is_serial: false,
        }
    }
}
