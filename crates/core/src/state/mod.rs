//! Guest architectural state and the host interface consumed by generated code.
//!
//! This module defines:
//! 1. **`EeState`:** the Emotion Engine register file, cycle counters, and
//!    TLB-modified bitset.
//! 2. **`VuState`:** the Vector Unit register files, scalar pipeline
//!    registers, flag pipelines, and GIF/XGKICK transfer state.
//! 3. **`EeBus` / `VuBus`:** tables of C-callable host functions invoked
//!    from compiled blocks through the platform ABI.
//!
//! Both state structs are `#[repr(C)]`: compiled blocks address their
//! fields by constant offset from a base register, so field layout is part
//! of the generated-code contract. The structs are owned by the embedder
//! and referenced by the recompiler cores.

use std::fmt;

/// One 128-bit VU floating-point register: four IEEE-754 single lanes.
///
/// Kept 16-byte aligned so compiled blocks can use aligned SIMD loads and
/// stores against it.
#[repr(C, align(16))]
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct VfReg {
    /// Raw lane bits in XYZW order (lane 0 = X).
    pub bits: [u32; 4],
}

impl VfReg {
    /// Builds a register from four lane floats in XYZW order.
    pub fn from_floats(x: f32, y: f32, z: f32, w: f32) -> Self {
        Self {
            bits: [x.to_bits(), y.to_bits(), z.to_bits(), w.to_bits()],
        }
    }

    /// Reads one lane as a float (lane 0 = X).
    pub fn lane(&self, idx: usize) -> f32 {
        f32::from_bits(self.bits[idx])
    }
}

impl fmt::Debug for VfReg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "VfReg({:e}, {:e}, {:e}, {:e})",
            self.lane(0),
            self.lane(1),
            self.lane(2),
            self.lane(3)
        )
    }
}

/// Number of 4 KiB guest pages covered by the TLB-modified bitset.
pub const TLB_PAGE_COUNT: usize = 1 << 20;

/// Guest register index of the EE `LO` special register (after the 32 GPRs).
pub const EE_REG_LO: u16 = 32;
/// Guest register index of `LO1` (upper 64 bits of the 128-bit LO).
pub const EE_REG_LO1: u16 = 33;
/// Guest register index of `HI`.
pub const EE_REG_HI: u16 = 34;
/// Guest register index of `HI1`.
pub const EE_REG_HI1: u16 = 35;
/// Guest register index of the shift-amount register `SA`.
pub const EE_REG_SA: u16 = 36;
/// Guest register index of the COP1 accumulator (after the 32 FPU regs).
pub const EE_FPU_ACC: u16 = 32;

/// Guest register index of the VU accumulator (after the 32 VF registers).
pub const VU_REG_ACC: u16 = 32;
/// Guest register index of the VU `I` immediate register.
pub const VU_REG_I: u16 = 33;
/// Guest register index of the VU `Q` divide-result register.
pub const VU_REG_Q: u16 = 34;
/// Guest register index of the VU `P` EFU-result register.
pub const VU_REG_P: u16 = 35;
/// Guest register index of the VU `R` pseudo-random register.
pub const VU_REG_R: u16 = 36;

/// Interpreter fallback entry point: executes one guest instruction on the
/// reference interpreter. Carried per IR instruction for unrecognized ops.
pub type EeFallbackFn = unsafe extern "C" fn(*mut EeState, u32);

/// Host memory and exception interface for the EE core.
///
/// Every function is called from generated code through the platform ABI
/// with the guest state pointer as its first argument. Reads and writes are
/// uncached from the core's point of view.
#[derive(Clone, Copy)]
#[repr(C)]
pub struct EeBus {
    /// Reads one byte of guest memory.
    pub read8: unsafe extern "C" fn(*mut EeState, u32) -> u8,
    /// Reads a halfword of guest memory.
    pub read16: unsafe extern "C" fn(*mut EeState, u32) -> u16,
    /// Reads a word of guest memory.
    pub read32: unsafe extern "C" fn(*mut EeState, u32) -> u32,
    /// Reads a doubleword of guest memory.
    pub read64: unsafe extern "C" fn(*mut EeState, u32) -> u64,
    /// Reads a quadword of guest memory into `*dest`. 128-bit values are
    /// passed indirectly because no supported ABI passes them in registers
    /// uniformly.
    pub read128: unsafe extern "C" fn(*mut EeState, u32, *mut u128),
    /// Writes one byte of guest memory.
    pub write8: unsafe extern "C" fn(*mut EeState, u32, u8),
    /// Writes a halfword of guest memory.
    pub write16: unsafe extern "C" fn(*mut EeState, u32, u16),
    /// Writes a word of guest memory.
    pub write32: unsafe extern "C" fn(*mut EeState, u32, u32),
    /// Writes a doubleword of guest memory.
    pub write64: unsafe extern "C" fn(*mut EeState, u32, u64),
    /// Writes the quadword at `*src` to guest memory.
    pub write128: unsafe extern "C" fn(*mut EeState, u32, *const u128),
    /// Raises the guest SYSCALL exception; updates PC.
    pub syscall_exception: unsafe extern "C" fn(*mut EeState),
    /// Executes ERET: restores PC from EPC/ErrorEPC and clears the
    /// exception level.
    pub eret: unsafe extern "C" fn(*mut EeState),
    /// Returns nonzero while COP2 requires the EE to wait for VU0.
    pub vu0_wait: unsafe extern "C" fn(*mut EeState) -> u8,
    /// Returns nonzero while the VU0 interlock is held against the EE.
    pub check_interlock: unsafe extern "C" fn(*mut EeState) -> u8,
    /// Releases the VU0 interlock.
    pub clear_interlock: unsafe extern "C" fn(*mut EeState),
    /// Starts a VU0 microprogram at the given address (VCALLMS family).
    pub vu0_start_program: unsafe extern "C" fn(*mut EeState, u32),
    /// Reads CMSAR0 shifted into a byte address (for VCALLMSR).
    pub vu0_read_cmsar0: unsafe extern "C" fn(*mut EeState) -> u32,
    /// Reference interpreter for opcodes the recompiler does not lower.
    pub fallback: EeFallbackFn,
}

impl fmt::Debug for EeBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EeBus { .. }")
    }
}

/// Emotion Engine architectural state.
///
/// Field order matters: compiled blocks read and write these fields by
/// constant offset from the state base register. Hot fields live at small
/// offsets; the TLB bitset sits at the end.
#[repr(C)]
pub struct EeState {
    /// The 32 128-bit general purpose registers, packed.
    pub gpr: [u128; 32],
    /// Low half of the multiply/divide LO register.
    pub lo: u64,
    /// High half of LO (the `LO1` pipeline-1 result).
    pub lo1: u64,
    /// Low half of HI.
    pub hi: u64,
    /// High half of HI (`HI1`).
    pub hi1: u64,
    /// Shift-amount register used by the funnel-shift instructions.
    pub sa: u64,
    /// Current program counter.
    pub pc: u32,
    /// PC of the instruction currently executing (COP2 sync).
    pub pc_now: u32,
    /// Cycle budget for the current `run` entry; the dispatcher exits when
    /// this reaches zero.
    pub cycles_to_run: i32,
    _pad0: u32,
    /// Total guest cycles retired.
    pub cycle_count: u64,
    /// Set by a taken likely-branch compare; consumed at block tail.
    pub branch_on: u8,
    /// Set when the EE must stall until VU0 finishes.
    pub wait_for_vu0: u8,
    /// Set when the EE must stall on the VU0 interlock.
    pub wait_for_interlock: u8,
    /// FPU sticky underflow flag.
    pub fpu_flag_u: u8,
    /// FPU sticky overflow flag.
    pub fpu_flag_o: u8,
    /// FPU condition flag (written by `C.cond.S`, read by `BC1T`/`BC1F`).
    pub fpu_condition: u8,
    _pad1: [u8; 2],
    /// COP1 single-precision register file (raw bits).
    pub fpu_gpr: [u32; 32],
    /// COP1 accumulator (raw bits).
    pub fpu_acc: u32,
    _pad2: u32,
    /// The VU0 state backing the COP2 register file.
    pub vu0: *mut VuState,
    /// One bit per 4 KiB guest page, set by the host when it writes into
    /// memory that may hold compiled code. Read and cleared on block lookup.
    pub tlb_modified: [u8; TLB_PAGE_COUNT / 8],
}

impl EeState {
    /// Allocates a zeroed state on the heap.
    ///
    /// The state is large (the TLB bitset alone is 128 KiB), so it is
    /// always boxed.
    pub fn new_boxed() -> Box<Self> {
        // SAFETY: EeState is repr(C) with no niches; the all-zero bit
        // pattern is a valid value for every field (the vu0 pointer is
        // null until the embedder installs one).
        unsafe {
            let layout = std::alloc::Layout::new::<Self>();
            let ptr = std::alloc::alloc_zeroed(layout).cast::<Self>();
            assert!(!ptr.is_null(), "[EE] state allocation failed");
            Box::from_raw(ptr)
        }
    }

    /// Reads the low 64 bits of a GPR.
    pub fn gpr64(&self, idx: usize) -> u64 {
        self.gpr[idx] as u64
    }

    /// Writes the low 64 bits of a GPR, preserving the upper half.
    pub fn set_gpr64(&mut self, idx: usize, value: u64) {
        self.gpr[idx] = (self.gpr[idx] & !(u128::from(u64::MAX))) | u128::from(value);
    }

    /// Tests the TLB-modified bit for a 4 KiB page.
    pub fn tlb_modified(&self, page: u32) -> bool {
        let page = page as usize;
        self.tlb_modified[page / 8] & (1 << (page % 8)) != 0
    }

    /// Sets the TLB-modified bit for a 4 KiB page.
    pub fn set_tlb_modified(&mut self, page: u32) {
        let page = page as usize;
        self.tlb_modified[page / 8] |= 1 << (page % 8);
    }

    /// Clears the TLB-modified bit for a 4 KiB page.
    pub fn clear_tlb_modified(&mut self, page: u32) {
        let page = page as usize;
        self.tlb_modified[page / 8] &= !(1 << (page % 8));
    }
}

impl fmt::Debug for EeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EeState")
            .field("pc", &format_args!("{:#010x}", self.pc))
            .field("cycles_to_run", &self.cycles_to_run)
            .field("cycle_count", &self.cycle_count)
            .finish_non_exhaustive()
    }
}

/// Host interface for a VU core.
#[derive(Clone, Copy)]
#[repr(C)]
pub struct VuBus {
    /// Called when the microprogram retires its E-bit: the VU goes idle.
    pub stop: unsafe extern "C" fn(*mut VuState),
    /// Called when a T-bit stop fires (stop + interrupt request).
    pub stop_tbit: unsafe extern "C" fn(*mut VuState),
    /// Drives a pending XGKICK transfer for the given number of VU cycles.
    pub update_xgkick: unsafe extern "C" fn(*mut VuState, i32),
    /// Performs the CLIP judgement against the immediate `w` encoding.
    pub clip: unsafe extern "C" fn(*mut VuState, u32),
    /// Reference interpreter for an UPPER instruction.
    pub interpreter_upper: unsafe extern "C" fn(*mut VuState, u32),
    /// Reference interpreter for a LOWER instruction.
    pub interpreter_lower: unsafe extern "C" fn(*mut VuState, u32),
}

impl fmt::Debug for VuBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("VuBus { .. }")
    }
}

/// Vector Unit architectural state.
///
/// Like [`EeState`], the layout is part of the generated-code contract.
/// All SIMD-accessed registers come first so they stay 16-byte aligned.
#[repr(C, align(16))]
pub struct VuState {
    /// The 32 128-bit floating point registers.
    pub gpr: [VfReg; 32],
    /// The accumulator written by MULA/MADDA/OPMULA.
    pub acc: VfReg,
    /// `I` immediate register (lane 0 holds the value, broadcast on use).
    pub i_reg: VfReg,
    /// Program-visible `Q` register.
    pub q_reg: VfReg,
    /// Program-visible `P` register.
    pub p_reg: VfReg,
    /// `R` pseudo-random register.
    pub r_reg: VfReg,
    /// In-flight divide result, moved to `Q` when the FDIV pipe drains.
    pub new_q_instance: VfReg,
    /// In-flight EFU result, moved to `P` when the EFU pipe drains.
    pub new_p_instance: VfReg,
    /// Pre-UPPER value of a shared VF register during operand swaps.
    pub backup_old_vf: VfReg,
    /// Post-UPPER value of a shared VF register during operand swaps.
    pub backup_new_vf: VfReg,
    /// The 16 16-bit integer registers.
    pub int_gpr: [u16; 16],
    /// Current program counter (byte address into micro memory).
    pub pc: u16,
    _pad0: u16,
    /// Status register (Z/S/U/O/I/D plus sticky bits).
    pub status: u32,
    /// MAC flag write-back pipeline; element 3 is program visible.
    pub mac_pipeline: [u32; 4],
    /// CLIP flag write-back pipeline; element 3 is program visible.
    pub clip_pipeline: [u32; 4],
    /// MAC flags produced by the most recent FMAC result.
    pub new_mac_flags: u32,
    /// CLIP flags produced by the most recent CLIP judgement.
    pub clip_flags: u32,
    /// Branch condition evaluated in the delay slot's block.
    pub branch_on: u8,
    /// Branch condition for a branch seen this block (pre delay slot).
    pub branch_on_delay: u8,
    /// Nonzero while an integer load-delay write is still in flight.
    pub int_branch_delay: u8,
    /// VI index whose pre-write value is stashed in `int_backup_reg`.
    pub int_backup_id: u8,
    /// Pre-write value of a VI register consumed by a following branch.
    pub int_backup_reg: u16,
    /// Nonzero while the GIF is consuming an XGKICK transfer.
    pub transferring_gif: u8,
    /// Set when an XGKICK had to stall on a busy GIF.
    pub xgkick_stall: u8,
    /// Quadword address of the active XGKICK transfer.
    pub gif_addr: u16,
    /// Quadword address latched by a stalled XGKICK.
    pub stalled_gif_addr: u16,
    /// VIF TOP register (double-buffering base), read by XTOP.
    pub vif_top: u16,
    /// VIF ITOP register, read by XITOP.
    pub vif_itop: u16,
    /// FBRST register; bit `3 + id*8` enables T-bit stops.
    pub fbrst: u32,
    /// Unit id: 0 for VU0, 1 for VU1.
    pub id: u32,
    /// Data memory wrap mask (power of two minus one): 0xFFF for VU0,
    /// 0x3FFF for VU1.
    pub mem_mask: u16,
    _pad1: [u16; 3],
    /// Pipeline snapshot captured at the previous block exit; part of the
    /// block key so re-entry resumes with the right stall model.
    pub pipeline_state: [u64; 2],
    /// Base of VU data memory (wrapped by `mem_mask`).
    pub data_mem: *mut u8,
    /// Base of VU instruction memory, read by the translator.
    pub instr_mem: *mut u8,
}

impl VuState {
    /// Allocates a zeroed state with the given memory mask on the heap.
    pub fn new_boxed(mem_mask: u16, id: u32) -> Box<Self> {
        // SAFETY: repr(C), no niches other than the two raw pointers for
        // which null is the intended initial value.
        let mut state = unsafe {
            let layout = std::alloc::Layout::new::<Self>();
            let ptr = std::alloc::alloc_zeroed(layout).cast::<Self>();
            assert!(!ptr.is_null(), "[VU] state allocation failed");
            Box::from_raw(ptr)
        };
        state.mem_mask = mem_mask;
        state.id = id;
        state
    }

    /// Byte offset of a VF register (regular or special) inside the state.
    ///
    /// # Panics
    ///
    /// Panics on an index that is neither a VF register nor a special
    /// register; that is a recompiler bug.
    pub fn vf_offset(index: u16) -> usize {
        if index < 32 {
            return std::mem::offset_of!(Self, gpr) + usize::from(index) * 16;
        }
        match index {
            VU_REG_ACC => std::mem::offset_of!(Self, acc),
            VU_REG_I => std::mem::offset_of!(Self, i_reg),
            VU_REG_Q => std::mem::offset_of!(Self, q_reg),
            VU_REG_P => std::mem::offset_of!(Self, p_reg),
            VU_REG_R => std::mem::offset_of!(Self, r_reg),
            _ => panic!("[VU] vf_offset: unrecognized register vf{index}"),
        }
    }

    /// Byte offset of a VI register inside the state.
    pub fn vi_offset(index: u16) -> usize {
        assert!(index < 16, "[VU] vi_offset: unrecognized register vi{index}");
        std::mem::offset_of!(Self, int_gpr) + usize::from(index) * 2
    }

    /// Recomputes the status register from the program-visible MAC and
    /// CLIP pipeline outputs. Sticky bits accumulate until FSSET clears
    /// them.
    pub fn update_status(&mut self) {
        let mac = self.mac_pipeline[3];
        let mut status = self.status & 0xFC0;
        status |= u32::from(mac & 0x000F != 0); // Z
        status |= u32::from(mac & 0x00F0 != 0) << 1; // S
        status |= u32::from(mac & 0x0F00 != 0) << 2; // U
        status |= u32::from(mac & 0xF000 != 0) << 3; // O
        status |= (status & 0x3F) << 6;
        self.status = status;
    }
}

impl fmt::Debug for VuState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VuState")
            .field("pc", &format_args!("{:#06x}", self.pc))
            .field("status", &format_args!("{:#05x}", self.status))
            .field("transferring_gif", &self.transferring_gif)
            .finish_non_exhaustive()
    }
}
