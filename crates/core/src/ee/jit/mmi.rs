//! EE MMI (128-bit parallel) lowering.
//!
//! The saturating add/sub families map directly onto packed saturating
//! host ops, so their semantics match the reference interpreter exactly.
//! Operands live in the SIMD table as full 128-bit GPR views.

use crate::ir::{Instruction, Opcode};
use crate::regalloc::{RegKind, RegState};

use super::EeCore;

/// All-ones quadword used to complement PNOR results.
const ONES: [u8; 16] = [0xFF; 16];

impl EeCore {
    pub(crate) fn mmi_op(&mut self, instr: &Instruction) {
        let source = self.alloc_xmm(
            instr.source_reg(),
            RegKind::EeGprExtended,
            RegState::Read,
            None,
        );
        let source2 = self.alloc_xmm(
            instr.source2_reg(),
            RegKind::EeGprExtended,
            RegState::Read,
            None,
        );
        let temp = self.lalloc_xmm(0, RegKind::Scratch, RegState::Scratchpad, None);

        match instr.op {
            // The copy pair interleaves quadword halves; everything else
            // is elementwise with rs as the left operand.
            Opcode::ParallelCopyLowerDoubleword => {
                // rd.lo = rt.lo, rd.hi = rs.lo
                self.asm.movaps_reg(source2, temp);
                self.asm.punpcklqdq(source, temp);
            }
            Opcode::ParallelCopyUpperDoubleword => {
                // rd.lo = rs.hi, rd.hi = rt.hi
                self.asm.movaps_reg(source, temp);
                self.asm.punpckhqdq(source2, temp);
            }
            _ => {
                self.asm.movaps_reg(source, temp);
                match instr.op {
                    Opcode::ParallelAddByte => self.asm.paddb(source2, temp),
                    Opcode::ParallelAddHalfword => self.asm.paddw(source2, temp),
                    Opcode::ParallelAddWord => self.asm.paddd(source2, temp),
                    Opcode::ParallelSubByte => self.asm.psubb(source2, temp),
                    Opcode::ParallelSubHalfword => self.asm.psubw(source2, temp),
                    Opcode::ParallelSubWord => self.asm.psubd(source2, temp),
                    Opcode::ParallelAddByteSaturation => self.asm.paddsb(source2, temp),
                    Opcode::ParallelAddHalfwordSaturation => self.asm.paddsw(source2, temp),
                    Opcode::ParallelAddByteUnsignedSaturation => self.asm.paddusb(source2, temp),
                    Opcode::ParallelAddHalfwordUnsignedSaturation => {
                        self.asm.paddusw(source2, temp);
                    }
                    Opcode::ParallelSubByteSaturation => self.asm.psubsb(source2, temp),
                    Opcode::ParallelSubHalfwordSaturation => self.asm.psubsw(source2, temp),
                    Opcode::ParallelSubByteUnsignedSaturation => self.asm.psubusb(source2, temp),
                    Opcode::ParallelSubHalfwordUnsignedSaturation => {
                        self.asm.psubusw(source2, temp);
                    }
                    Opcode::ParallelAnd => self.asm.pand(source2, temp),
                    Opcode::ParallelOr => self.asm.por(source2, temp),
                    Opcode::ParallelXor => self.asm.pxor(source2, temp),
                    Opcode::ParallelNor => {
                        self.asm.por(source2, temp);
                        let ones = self.asm.block.emit_literal(&ONES);
                        self.asm.pxor_lit(ones, temp);
                    }
                    _ => unreachable!(),
                }
            }
        }

        let dest = self.alloc_xmm(
            instr.dest_reg(),
            RegKind::EeGprExtended,
            RegState::Write,
            None,
        );
        self.asm.movaps_reg(temp, dest);
        self.free_xmm(temp);
    }
}
