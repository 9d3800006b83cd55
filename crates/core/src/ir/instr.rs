//! IR instruction record.

use crate::ir::Opcode;
use crate::state::EeFallbackFn;

/// One operand slot: a guest register index or an immediate constant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    /// Guest register index. The meaning of the index space depends on the
    /// opcode (EE GPR + specials, VF + specials, VI, FPU).
    Reg(u16),
    /// Immediate value, already sign- or zero-extended per the guest
    /// instruction's field semantics.
    Imm(u64),
}

impl Default for Operand {
    fn default() -> Self {
        Self::Reg(0)
    }
}

impl Operand {
    /// The raw payload, whichever variant is stored.
    pub fn value(self) -> u64 {
        match self {
            Self::Reg(r) => u64::from(r),
            Self::Imm(v) => v,
        }
    }
}

/// One IR instruction.
///
/// Translators populate the subset of fields the opcode needs; the rest
/// stay at their defaults. Code generators read the same subset. Keeping
/// the record wide and flat avoids a per-opcode payload enum that both
/// lowerers would immediately have to destructure anyway.
#[derive(Debug, Clone, PartialEq)]
pub struct Instruction {
    /// Operation selector.
    pub op: Opcode,
    /// Destination operand.
    pub dest: Operand,
    /// First source operand.
    pub source: Operand,
    /// Second source operand.
    pub source2: Operand,
    /// Base register for memory operations (VI index or EE GPR index).
    pub base: u16,
    /// Branch/jump target (guest address).
    pub jump_dest: u32,
    /// Fall-through target for conditional branches.
    pub jump_fail_dest: u32,
    /// Link/return address for call-style instructions.
    pub return_addr: u32,
    /// Guest cycles attributed to this instruction (used by suspension
    /// points that report partial progress).
    pub cycle_count: u16,
    /// Broadcast lane (0-3) for `*ByScalar` vector ops.
    pub bc: u8,
    /// XYZW write mask or lane index, per opcode.
    pub field: u8,
    /// Second field (lane index) where an opcode needs two.
    pub field2: u8,
    /// Set on the "likely" EE branch variants.
    pub is_likely: bool,
    /// Set on linking jump variants.
    pub is_link: bool,
    /// Raw guest instruction word (fallback and diagnostics).
    pub opcode: u32,
    /// Interpreter entry point for `FallbackInterpreter` (EE side).
    pub fallback: Option<EeFallbackFn>,
}

impl Default for Instruction {
    fn default() -> Self {
        Self {
            op: Opcode::Null,
            dest: Operand::default(),
            source: Operand::default(),
            source2: Operand::default(),
            base: 0,
            jump_dest: 0,
            jump_fail_dest: 0,
            return_addr: 0,
            cycle_count: 0,
            bc: 0,
            field: 0,
            field2: 0,
            is_likely: false,
            is_link: false,
            opcode: 0,
            fallback: None,
        }
    }
}

impl Instruction {
    /// Creates an instruction of the given opcode with default fields.
    pub fn new(op: Opcode) -> Self {
        Self {
            op,
            ..Self::default()
        }
    }

    /// Destination register index.
    ///
    /// # Panics
    ///
    /// Panics if the destination is an immediate; that is a translator bug.
    pub fn dest_reg(&self) -> u16 {
        match self.dest {
            Operand::Reg(r) => r,
            Operand::Imm(v) => panic!("[IR] dest of {:?} is immediate {v:#x}", self.op),
        }
    }

    /// First source register index; panics on an immediate.
    pub fn source_reg(&self) -> u16 {
        match self.source {
            Operand::Reg(r) => r,
            Operand::Imm(v) => panic!("[IR] source of {:?} is immediate {v:#x}", self.op),
        }
    }

    /// Second source register index; panics on an immediate.
    pub fn source2_reg(&self) -> u16 {
        match self.source2 {
            Operand::Reg(r) => r,
            Operand::Imm(v) => panic!("[IR] source2 of {:?} is immediate {v:#x}", self.op),
        }
    }

    /// First source as an immediate, whichever variant is stored.
    pub fn source_imm(&self) -> u64 {
        self.source.value()
    }

    /// Second source as an immediate, whichever variant is stored.
    pub fn source2_imm(&self) -> u64 {
        self.source2.value()
    }

    /// True for block-terminating branch/jump ops.
    pub fn is_jump(&self) -> bool {
        self.op.is_jump()
    }
}
