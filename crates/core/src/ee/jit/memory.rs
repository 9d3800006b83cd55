//! EE load/store lowering.
//!
//! All guest memory traffic goes through the host accessors via the ABI
//! path. Quadword transfers stage through the dedicated frame slot because
//! 128-bit values are not passed in registers uniformly across platforms.
//! The unaligned left/right family is lowered natively as read-merge (and
//! read-merge-write for stores), using the same mask algebra as the
//! reference interpreter.

use crate::emitter::{ConditionCode, Reg};
use crate::ir::Instruction;
use crate::regalloc::{RegKind, RegState};

use super::{EeCore, QW_STAGING};

impl EeCore {
    /// Computes the effective address `base + offset` into a locked
    /// scratchpad register.
    fn effective_addr(&mut self, base_guest: u16, offset: i32) -> Reg {
        let base = self.alloc_int(base_guest, RegKind::EeGpr, RegState::Read, None);
        let addr = self.lalloc_int(0, RegKind::Scratch, RegState::Scratchpad, None);
        if offset != 0 {
            self.asm.lea32_m(base, addr, offset);
        } else {
            self.asm.mov32_reg(base, addr);
        }
        addr
    }

    pub(crate) fn load_sized(&mut self, instr: &Instruction, size: u8, signed: bool) {
        let addr = self.effective_addr(instr.source_reg(), instr.source2_imm() as i32);
        self.prepare_abi_reg(Reg::R15, 0);
        self.prepare_abi_reg(addr, 0);
        self.free_int(addr);
        let accessor = match size {
            1 => self.bus.read8 as usize as u64,
            2 => self.bus.read16 as usize as u64,
            4 => self.bus.read32 as usize as u64,
            8 => self.bus.read64 as usize as u64,
            _ => unreachable!(),
        };
        self.call_abi_func(accessor);

        let dest = self.alloc_int(instr.dest_reg(), RegKind::EeGpr, RegState::Write, None);
        match (size, signed) {
            (1, true) => self.asm.movsx8_to_64(Reg::Rax, dest),
            (1, false) => self.asm.movzx8_to_64(Reg::Rax, dest),
            (2, true) => self.asm.movsx16_to_64(Reg::Rax, dest),
            (2, false) => self.asm.movzx16_to_64(Reg::Rax, dest),
            (4, true) => self.asm.movsx32_to_64(Reg::Rax, dest),
            // 32-bit moves zero-extend; 64-bit loads are full width.
            (4, false) => self.asm.mov32_reg(Reg::Rax, dest),
            (8, _) => self.asm.mov64_reg(Reg::Rax, dest),
            _ => unreachable!(),
        }
    }

    pub(crate) fn store_sized(&mut self, instr: &Instruction, size: u8) {
        let source = self.alloc_int(instr.source_reg(), RegKind::EeGpr, RegState::Read, None);
        let addr = self.effective_addr(instr.dest_reg(), instr.source2_imm() as i32);
        self.prepare_abi_reg(Reg::R15, 0);
        self.prepare_abi_reg(addr, 0);
        self.prepare_abi_reg(source, 0);
        self.free_int(addr);
        let accessor = match size {
            1 => self.bus.write8 as usize as u64,
            2 => self.bus.write16 as usize as u64,
            4 => self.bus.write32 as usize as u64,
            8 => self.bus.write64 as usize as u64,
            _ => unreachable!(),
        };
        self.call_abi_func(accessor);
    }

    pub(crate) fn load_quadword(&mut self, instr: &Instruction) {
        let addr = self.effective_addr(instr.source_reg(), instr.source2_imm() as i32);
        // LQ ignores the low four address bits.
        self.asm.and32_reg_imm(!0xF, addr);
        self.prepare_abi_reg(Reg::R15, 0);
        self.prepare_abi_reg(addr, 0);
        self.free_int(addr);
        self.prepare_abi_reg(Reg::Rsp, QW_STAGING);
        self.call_abi_func(self.bus.read128 as usize as u64);

        let dest = self.alloc_xmm(
            instr.dest_reg(),
            RegKind::EeGprExtended,
            RegState::Write,
            None,
        );
        self.asm.movaps_from_mem(Reg::Rsp, dest, QW_STAGING);
    }

    pub(crate) fn store_quadword(&mut self, instr: &Instruction) {
        let source = self.alloc_xmm(
            instr.source_reg(),
            RegKind::EeGprExtended,
            RegState::Read,
            None,
        );
        self.asm.movaps_to_mem(source, Reg::Rsp, QW_STAGING);

        let addr = self.effective_addr(instr.dest_reg(), instr.source2_imm() as i32);
        self.asm.and32_reg_imm(!0xF, addr);
        self.prepare_abi_reg(Reg::R15, 0);
        self.prepare_abi_reg(addr, 0);
        self.free_int(addr);
        self.prepare_abi_reg(Reg::Rsp, QW_STAGING);
        self.call_abi_func(self.bus.write128 as usize as u64);
    }

    pub(crate) fn load_word_cop1(&mut self, instr: &Instruction) {
        let addr = self.effective_addr(instr.source_reg(), instr.source2_imm() as i32);
        self.prepare_abi_reg(Reg::R15, 0);
        self.prepare_abi_reg(addr, 0);
        self.free_int(addr);
        self.call_abi_func(self.bus.read32 as usize as u64);

        let dest = self.alloc_xmm(instr.dest_reg(), RegKind::EeFpu, RegState::Write, None);
        self.asm.movd_to_xmm(Reg::Rax, dest);
    }

    pub(crate) fn store_word_cop1(&mut self, instr: &Instruction) {
        let source = self.alloc_xmm(instr.source_reg(), RegKind::EeFpu, RegState::Read, None);
        let value = self.lalloc_int(0, RegKind::Scratch, RegState::Scratchpad, None);
        self.asm.movd_from_xmm(source, value);
        let addr = self.effective_addr(instr.dest_reg(), instr.source2_imm() as i32);
        self.prepare_abi_reg(Reg::R15, 0);
        self.prepare_abi_reg(addr, 0);
        self.prepare_abi_reg(value, 0);
        self.free_int(addr);
        self.free_int(value);
        self.call_abi_func(self.bus.write32 as usize as u64);
    }

    /// LWL/LWR: load the aligned word and merge it into the register with
    /// shift-dependent masks, sign-extending per the guest rules.
    pub(crate) fn load_word_unaligned(&mut self, instr: &Instruction, left: bool) {
        let addr = self.effective_addr(instr.source_reg(), instr.source2_imm() as i32);
        // The shift survives the accessor call in the staging slot.
        self.asm.mov32_to_mem(addr, Reg::Rsp, QW_STAGING);
        self.asm.and32_reg_imm(!0x3, addr);
        self.prepare_abi_reg(Reg::R15, 0);
        self.prepare_abi_reg(addr, 0);
        self.free_int(addr);
        self.call_abi_func(self.bus.read32 as usize as u64);

        let rcx = self.lalloc_int(0, RegKind::Scratch, RegState::Scratchpad, Some(Reg::Rcx));
        let mask = self.lalloc_int(0, RegKind::Scratch, RegState::Scratchpad, None);
        let dest = self.alloc_int(instr.dest_reg(), RegKind::EeGpr, RegState::ReadWrite, None);

        // CL = 8 * (addr & 3)
        self.asm.mov32_from_mem(Reg::Rsp, Reg::Rcx, QW_STAGING);
        self.asm.and32_reg_imm(3, Reg::Rcx);
        self.asm.shl32_reg_imm(3, Reg::Rcx);

        if left {
            // reg = sext32((reg & (0x00FFFFFF >> n)) | (mem << (24 - n)))
            self.asm.mov32_reg_imm(0x00FF_FFFF, mask);
            self.asm.shr32_cl(mask);
            self.asm.and32_reg(mask, dest);
            // Flip the count: CL = 24 - n for the deposit shift.
            self.asm.neg32(Reg::Rcx);
            self.asm.add32_reg_imm(24, Reg::Rcx);
            self.asm.shl32_cl(Reg::Rax);
            self.asm.or32_reg(Reg::Rax, dest);
            self.asm.movsx32_to_64(dest, dest);
        } else {
            // reg = (reg & ~(0xFFFFFFFF >> n)) | (mem >> n); the merged
            // word only sign-extends when the access was aligned (n == 0).
            self.asm.shr32_cl(Reg::Rax);
            self.asm.mov32_reg_imm(0xFFFF_FFFF, mask);
            self.asm.shr32_cl(mask);
            self.asm.not64(mask);
            self.asm.and64_reg(mask, dest);
            self.asm.or64_reg(Reg::Rax, dest);
            self.asm.test32_reg(Reg::Rcx, Reg::Rcx);
            let unaligned = self.asm.jcc_near_deferred(ConditionCode::Ne);
            self.asm.movsx32_to_64(dest, dest);
            self.asm.set_jump_dest(unaligned);
        }
        self.free_int(mask);
        self.free_int(rcx);
    }

    /// LDL/LDR: the doubleword flavor of the merge, no sign rules.
    pub(crate) fn load_doubleword_unaligned(&mut self, instr: &Instruction, left: bool) {
        let addr = self.effective_addr(instr.source_reg(), instr.source2_imm() as i32);
        self.asm.mov32_to_mem(addr, Reg::Rsp, QW_STAGING);
        self.asm.and32_reg_imm(!0x7, addr);
        self.prepare_abi_reg(Reg::R15, 0);
        self.prepare_abi_reg(addr, 0);
        self.free_int(addr);
        self.call_abi_func(self.bus.read64 as usize as u64);

        let rcx = self.lalloc_int(0, RegKind::Scratch, RegState::Scratchpad, Some(Reg::Rcx));
        let mask = self.lalloc_int(0, RegKind::Scratch, RegState::Scratchpad, None);
        let dest = self.alloc_int(instr.dest_reg(), RegKind::EeGpr, RegState::ReadWrite, None);

        self.asm.mov32_from_mem(Reg::Rsp, Reg::Rcx, QW_STAGING);
        self.asm.and32_reg_imm(7, Reg::Rcx);
        self.asm.shl32_reg_imm(3, Reg::Rcx);

        if left {
            // reg = (reg & (0x00FFFFFF_FFFFFFFF >> n)) | (mem << (56 - n))
            self.asm.load_addr(0x00FF_FFFF_FFFF_FFFF, mask);
            self.asm.shr64_cl(mask);
            self.asm.and64_reg(mask, dest);
            self.asm.neg32(Reg::Rcx);
            self.asm.add32_reg_imm(56, Reg::Rcx);
            self.asm.shl64_cl(Reg::Rax);
            self.asm.or64_reg(Reg::Rax, dest);
        } else {
            // reg = (reg & ~(0xFFFFFFFF_FFFFFFFF >> n)) | (mem >> n)
            self.asm.shr64_cl(Reg::Rax);
            self.asm.load_addr(u64::MAX, mask);
            self.asm.shr64_cl(mask);
            self.asm.not64(mask);
            self.asm.and64_reg(mask, dest);
            self.asm.or64_reg(Reg::Rax, dest);
        }
        self.free_int(mask);
        self.free_int(rcx);
    }

    /// SWL/SWR: read the aligned word, merge the register into it, and
    /// write it back.
    pub(crate) fn store_word_unaligned(&mut self, instr: &Instruction, left: bool) {
        let addr = self.effective_addr(instr.dest_reg(), instr.source2_imm() as i32);
        self.asm.mov32_to_mem(addr, Reg::Rsp, QW_STAGING);
        self.asm.and32_reg_imm(!0x3, addr);
        self.prepare_abi_reg(Reg::R15, 0);
        self.prepare_abi_reg(addr, 0);
        self.free_int(addr);
        self.call_abi_func(self.bus.read32 as usize as u64);

        let rcx = self.lalloc_int(0, RegKind::Scratch, RegState::Scratchpad, Some(Reg::Rcx));
        let mask = self.lalloc_int(0, RegKind::Scratch, RegState::Scratchpad, None);
        let merged = self.lalloc_int(0, RegKind::Scratch, RegState::Scratchpad, None);
        let source = self.alloc_int(instr.source_reg(), RegKind::EeGpr, RegState::Read, None);

        self.asm.mov32_from_mem(Reg::Rsp, Reg::Rcx, QW_STAGING);
        self.asm.and32_reg_imm(3, Reg::Rcx);
        self.asm.shl32_reg_imm(3, Reg::Rcx);

        if left {
            // mem = (src >> (24 - n)) | (mem & ~(0xFFFFFFFF >> (24 - n)))
            // Rewrites in terms of m = 24 - n via a count flip.
            self.asm.neg32(Reg::Rcx);
            self.asm.add32_reg_imm(24, Reg::Rcx);
            self.asm.mov32_reg(source, merged);
            self.asm.shr32_cl(merged);
            self.asm.mov32_reg_imm(0xFFFF_FFFF, mask);
            self.asm.shr32_cl(mask);
            self.asm.not64(mask);
            self.asm.and32_reg(mask, Reg::Rax);
            self.asm.or32_reg(Reg::Rax, merged);
        } else {
            // mem = (src << n) | (mem & (0xFFFFFFFF >> (32 - n)))
            // ~(0xFFFFFFFF << n) is the same mask without the n = 0 hole.
            self.asm.mov32_reg(source, merged);
            self.asm.shl32_cl(merged);
            self.asm.mov32_reg_imm(0xFFFF_FFFF, mask);
            self.asm.shl32_cl(mask);
            self.asm.not64(mask);
            self.asm.and32_reg(mask, Reg::Rax);
            self.asm.or32_reg(Reg::Rax, merged);
        }

        // Rebuild the aligned address for the write-back.
        self.asm.mov32_from_mem(Reg::Rsp, Reg::Rcx, QW_STAGING);
        self.asm.and32_reg_imm(!0x3, Reg::Rcx);
        self.prepare_abi_reg(Reg::R15, 0);
        self.prepare_abi_reg(Reg::Rcx, 0);
        self.prepare_abi_reg(merged, 0);
        self.free_int(merged);
        self.free_int(mask);
        self.free_int(rcx);
        self.call_abi_func(self.bus.write32 as usize as u64);
    }

    /// SDL/SDR: doubleword read-merge-write.
    pub(crate) fn store_doubleword_unaligned(&mut self, instr: &Instruction, left: bool) {
        let addr = self.effective_addr(instr.dest_reg(), instr.source2_imm() as i32);
        self.asm.mov32_to_mem(addr, Reg::Rsp, QW_STAGING);
        self.asm.and32_reg_imm(!0x7, addr);
        self.prepare_abi_reg(Reg::R15, 0);
        self.prepare_abi_reg(addr, 0);
        self.free_int(addr);
        self.call_abi_func(self.bus.read64 as usize as u64);

        let rcx = self.lalloc_int(0, RegKind::Scratch, RegState::Scratchpad, Some(Reg::Rcx));
        let mask = self.lalloc_int(0, RegKind::Scratch, RegState::Scratchpad, None);
        let merged = self.lalloc_int(0, RegKind::Scratch, RegState::Scratchpad, None);
        let source = self.alloc_int(instr.source_reg(), RegKind::EeGpr, RegState::Read, None);

        self.asm.mov32_from_mem(Reg::Rsp, Reg::Rcx, QW_STAGING);
        self.asm.and32_reg_imm(7, Reg::Rcx);
        self.asm.shl32_reg_imm(3, Reg::Rcx);

        if left {
            self.asm.neg32(Reg::Rcx);
            self.asm.add32_reg_imm(56, Reg::Rcx);
            self.asm.mov64_reg(source, merged);
            self.asm.shr64_cl(merged);
            self.asm.load_addr(u64::MAX, mask);
            self.asm.shr64_cl(mask);
            self.asm.not64(mask);
            self.asm.and64_reg(mask, Reg::Rax);
            self.asm.or64_reg(Reg::Rax, merged);
        } else {
            self.asm.mov64_reg(source, merged);
            self.asm.shl64_cl(merged);
            self.asm.load_addr(u64::MAX, mask);
            self.asm.shl64_cl(mask);
            self.asm.not64(mask);
            self.asm.and64_reg(mask, Reg::Rax);
            self.asm.or64_reg(Reg::Rax, merged);
        }

        self.asm.mov32_from_mem(Reg::Rsp, Reg::Rcx, QW_STAGING);
        self.asm.and32_reg_imm(!0x7, Reg::Rcx);
        self.prepare_abi_reg(Reg::R15, 0);
        self.prepare_abi_reg(Reg::Rcx, 0);
        self.prepare_abi_reg(merged, 0);
        self.free_int(merged);
        self.free_int(mask);
        self.free_int(rcx);
        self.call_abi_func(self.bus.write64 as usize as u64);
    }
}
