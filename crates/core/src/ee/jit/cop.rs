//! EE exception, COP2 synchronization, and interpreter-fallback lowering.
//!
//! These all share a shape: flush guest state coherent, call the host
//! handler through the ABI, then either continue the block or exit the
//! dispatcher depending on whether the handler armed a stall.

use crate::emitter::{ConditionCode, Reg};
use crate::ir::Instruction;
use crate::state::EeState;
use std::mem::offset_of;

use super::{off_branch_on, off_pc, EeCore};

impl EeCore {
    /// SYSCALL: coherent state, then the host exception handler redirects
    /// PC to the vector. The translator ends the block here.
    pub(crate) fn system_call(&mut self, instr: &Instruction) {
        self.flush_and_clear();

        self.asm.mov32_imm_mem(instr.return_addr, Reg::R15, off_pc());
        // The handler expects no branch to be in flight.
        self.asm.mov8_imm_mem(0, Reg::R15, off_branch_on());

        self.prepare_abi_reg(Reg::R15, 0);
        self.call_abi_func(self.bus.syscall_exception as usize as u64);
    }

    /// ERET: the host handler restores PC from EPC/ErrorEPC.
    pub(crate) fn exception_return(&mut self, instr: &Instruction) {
        self.flush_and_clear();
        self.asm.mov32_imm_mem(instr.return_addr, Reg::R15, off_pc());
        self.asm.mov8_imm_mem(0, Reg::R15, off_branch_on());
        self.prepare_abi_reg(Reg::R15, 0);
        self.call_abi_func(self.bus.eret as usize as u64);
    }

    /// VCALLMS: kick a VU0 microprogram at a fixed address.
    pub(crate) fn vcall_ms(&mut self, instr: &Instruction) {
        self.flush_and_clear();
        self.prepare_abi_reg(Reg::R15, 0);
        self.prepare_abi_imm(instr.source_imm() << 3);
        self.call_abi_func(self.bus.vu0_start_program as usize as u64);
    }

    /// VCALLMSR: the start address comes from CMSAR0.
    pub(crate) fn vcall_msr(&mut self, _instr: &Instruction) {
        self.flush_and_clear();
        self.prepare_abi_reg(Reg::R15, 0);
        self.call_abi_func(self.bus.vu0_read_cmsar0 as usize as u64);
        self.prepare_abi_reg(Reg::R15, 0);
        self.prepare_abi_reg(Reg::Rax, 0);
        self.call_abi_func(self.bus.vu0_start_program as usize as u64);
    }

    /// COP2 wait: if VU0 is still running, rewind PC to this instruction,
    /// arm the wait flag, and exit so the host can drive VU0 forward.
    pub(crate) fn wait_for_vu0(&mut self, instr: &Instruction) {
        self.prepare_abi_reg(Reg::R15, 0);
        self.call_abi_func(self.bus.vu0_wait as usize as u64);
        self.asm.test8_reg(Reg::Rax, Reg::Rax);
        let proceed = self.asm.jcc_near_deferred(ConditionCode::E);

        self.asm.mov32_imm_mem(instr.return_addr, Reg::R15, off_pc());
        self.asm.mov8_imm_mem(
            1,
            Reg::R15,
            offset_of!(EeState, wait_for_vu0) as i32,
        );
        self.cleanup_recompiler(false, false, u64::from(instr.cycle_count));

        self.asm.set_jump_dest(proceed);
    }

    /// COP2 interlock check: same exit protocol as the VU0 wait, then the
    /// interlock is released on the continue path.
    pub(crate) fn check_interlock_vu0(&mut self, instr: &Instruction) {
        self.prepare_abi_reg(Reg::R15, 0);
        self.call_abi_func(self.bus.check_interlock as usize as u64);
        self.asm.test8_reg(Reg::Rax, Reg::Rax);
        let proceed = self.asm.jcc_near_deferred(ConditionCode::E);

        self.asm.mov32_imm_mem(instr.return_addr, Reg::R15, off_pc());
        self.asm.mov8_imm_mem(
            1,
            Reg::R15,
            offset_of!(EeState, wait_for_interlock) as i32,
        );
        self.cleanup_recompiler(false, false, u64::from(instr.cycle_count));

        self.asm.set_jump_dest(proceed);
        self.prepare_abi_reg(Reg::R15, 0);
        self.call_abi_func(self.bus.clear_interlock as usize as u64);
    }

    /// Everything the recompiler does not lower runs on the reference
    /// interpreter: PC is made current first so control-flow fallbacks can
    /// redirect it.
    pub(crate) fn fallback_interpreter(&mut self, instr: &Instruction) {
        self.flush_and_clear();
        self.asm.mov32_imm_mem(instr.return_addr, Reg::R15, off_pc());
        self.prepare_abi_reg(Reg::R15, 0);
        self.prepare_abi_imm(u64::from(instr.opcode));
        let fallback = instr
            .fallback
            .unwrap_or_else(|| panic!("[EE JIT] fallback without interpreter fn"));
        self.call_abi_func(fallback as usize as u64);
    }
}
