//! VU pipeline analysis.
//!
//! Two passes run over a block before any IR is emitted:
//!
//! 1. **Interpreter pass** — walks the block forward while modeling the
//!    pipelines software can observe: the 4-deep FMAC write-back queue,
//!    the FDIV/EFU latency counters, and the integer load delay. Per PC it
//!    records the stall amount, whether UPPER/LOWER must swap, which
//!    pipeline updates are due, block-end causes, and whether a branch
//!    must read a VI register's pre-write backup.
//! 2. **Flag pass** — walks backward marking which instructions must
//!    materialize MAC/CLIP flags into guest state: only producers a flag
//!    reader can observe within five cycles, plus block-boundary windows.
//!
//! The pipeline snapshot packed into `pipeline_state[2]` is part of the
//! block key; re-entering a PC with a different snapshot compiles a
//! different block.

use crate::state::VuState;

/// Sentinel "no predecessor" PC for a freshly started program.
pub const NO_PREV_PC: u32 = 0xFFFF_FFFF;

/// Flag-reader classification of a LOWER instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlagInstr {
    /// Not a flag reader.
    #[default]
    None,
    /// Reads the MAC flags (FMEQ/FMAND/FMOR/FSAND family).
    Mac,
    /// Reads the CLIP flags (FCEQ/FCAND/FCOR/FCGET).
    Clip,
}

/// Software-visible decoder state for one UPPER/LOWER pair.
///
/// Slot 0 describes the UPPER instruction, slot 1 the LOWER.
#[derive(Debug, Clone, Copy, Default)]
pub struct VuDecoder {
    /// VF register written per slot (0 = none).
    pub vf_write: [u8; 2],
    /// XYZW field written per slot.
    pub vf_write_field: [u8; 2],
    /// First VF register read per slot.
    pub vf_read0: [u8; 2],
    /// Field of the first read.
    pub vf_read0_field: [u8; 2],
    /// Second VF register read per slot.
    pub vf_read1: [u8; 2],
    /// Field of the second read.
    pub vf_read1_field: [u8; 2],
    /// First VI register read by the LOWER slot.
    pub vi_read0: u8,
    /// Second VI register read by the LOWER slot.
    pub vi_read1: u8,
    /// VI register written by the LOWER slot.
    pub vi_write: u8,
    /// VI register written by an integer load (subject to load delay).
    pub vi_write_from_load: u8,
}

impl VuDecoder {
    /// Clears all fields.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Records the UPPER instruction's reads and writes.
    pub fn decode_upper(&mut self, upper: u32) {
        let dest_field = ((upper >> 21) & 0xF) as u8;
        let fd = ((upper >> 6) & 0x1F) as u8;
        let fs = ((upper >> 11) & 0x1F) as u8;
        let ft = ((upper >> 16) & 0x1F) as u8;
        let op = upper & 0x3F;

        let bc_field = |u: u32| 8u8 >> (u & 3);

        match op {
            // bc-broadcast families read one lane of ft.
            0x00..=0x0F | 0x18..=0x1B => {
                self.set_upper(fd, dest_field, fs, dest_field, ft, bc_field(upper));
            }
            // MAXbc/MINIbc
            0x10..=0x17 => {
                self.set_upper(fd, dest_field, fs, dest_field, ft, bc_field(upper));
            }
            // q/i scalar forms read no second register.
            0x1C..=0x27 => self.set_upper(fd, dest_field, fs, dest_field, 0, 0),
            // Plain vector forms.
            0x28..=0x2D | 0x2F => {
                self.set_upper(fd, dest_field, fs, dest_field, ft, dest_field);
            }
            // OPMSUB writes fd over xyz.
            0x2E => self.set_upper(fd, 0xE, fs, 0xE, ft, 0xE),
            0x3C..=0x3F => {
                let sop = (upper & 0x3) | ((upper >> 4) & 0x7C);
                match sop {
                    // Accumulator broadcast forms.
                    0x00..=0x0F | 0x18..=0x1B | 0x1C | 0x1E | 0x20..=0x27 => {
                        let ft_read = if matches!(sop, 0x1C | 0x1E | 0x20..=0x27) {
                            (0, 0)
                        } else {
                            (ft, bc_field(upper))
                        };
                        self.set_upper(0, 0, fs, dest_field, ft_read.0, ft_read.1);
                    }
                    // ITOF/FTOI and ABS write ft from fs.
                    0x10..=0x17 | 0x1D => {
                        self.set_upper(ft, dest_field, fs, dest_field, 0, 0);
                    }
                    // CLIP reads fs.xyz and ft.w.
                    0x1F => self.set_upper(0, 0, fs, 0xE, ft, 0x1),
                    // ADDA/MADDA/MULA/SUBA/MSUBA vector forms.
                    0x28..=0x2D => {
                        self.set_upper(0, 0, fs, dest_field, ft, dest_field);
                    }
                    // OPMULA reads fs/ft over xyz, writes ACC.
                    0x2E => self.set_upper(0, 0, fs, 0xE, ft, 0xE),
                    _ => self.set_upper(0, 0, 0, 0, 0, 0),
                }
            }
            _ => self.set_upper(0, 0, 0, 0, 0, 0),
        }
    }

    fn set_upper(&mut self, w: u8, wf: u8, r0: u8, r0f: u8, r1: u8, r1f: u8) {
        self.vf_write[0] = w;
        self.vf_write_field[0] = wf;
        self.vf_read0[0] = r0;
        self.vf_read0_field[0] = r0f;
        self.vf_read1[0] = r1;
        self.vf_read1_field[0] = r1f;
    }

    fn set_lower_vf(&mut self, w: u8, wf: u8, r0: u8, r0f: u8, r1: u8, r1f: u8) {
        self.vf_write[1] = w;
        self.vf_write_field[1] = wf;
        self.vf_read0[1] = r0;
        self.vf_read0_field[1] = r0f;
        self.vf_read1[1] = r1;
        self.vf_read1_field[1] = r1f;
    }

    /// Records the LOWER instruction's reads and writes.
    pub fn decode_lower(&mut self, lower: u32) {
        let field = ((lower >> 21) & 0xF) as u8;
        let id = ((lower >> 6) & 0x1F) as u8;
        let is = ((lower >> 11) & 0x1F) as u8;
        let it = ((lower >> 16) & 0x1F) as u8;

        if lower & (1 << 31) != 0 {
            match lower & 0x3F {
                // IADD / ISUB
                0x30 | 0x31 => self.set_vi(is & 0xF, it & 0xF, id & 0xF, 0),
                // IADDI
                0x32 => self.set_vi(is & 0xF, 0, it & 0xF, 0),
                // IAND / IOR
                0x34 | 0x35 => self.set_vi(is & 0xF, it & 0xF, id & 0xF, 0),
                0x3C..=0x3F => {
                    let sop = (lower & 0x3) | ((lower >> 4) & 0x7C);
                    match sop {
                        // MOVE / MR32
                        0x30 | 0x31 => self.set_lower_vf(it, field, is, field, 0, 0),
                        // LQI / LQD: base is read and written back.
                        0x34 | 0x36 => {
                            self.set_lower_vf(it, field, 0, 0, 0, 0);
                            self.set_vi(is & 0xF, 0, is & 0xF, 0);
                        }
                        // SQI / SQD
                        0x35 | 0x37 => {
                            self.set_lower_vf(0, 0, is, field, 0, 0);
                            self.set_vi(it & 0xF, 0, it & 0xF, 0);
                        }
                        // DIV / RSQRT read one lane of each operand.
                        0x38 | 0x3A => {
                            let fsf = 8 >> ((lower >> 21) & 3);
                            let ftf = 8 >> ((lower >> 23) & 3);
                            self.set_lower_vf(0, 0, is, fsf, it, ftf);
                        }
                        // SQRT reads ft only.
                        0x39 => {
                            let ftf = 8 >> ((lower >> 23) & 3);
                            self.set_lower_vf(0, 0, it, ftf, 0, 0);
                        }
                        // MTIR
                        0x3C => {
                            let fsf = 8 >> ((lower >> 21) & 3);
                            self.set_lower_vf(0, 0, is, fsf, 0, 0);
                            self.set_vi(0, 0, it & 0xF, 0);
                        }
                        // MFIR
                        0x3D => {
                            self.set_lower_vf(it, field, 0, 0, 0, 0);
                            self.set_vi(is & 0xF, 0, 0, 0);
                        }
                        // ILWR: integer load with delay slot.
                        0x3E => self.set_vi(is & 0xF, 0, it & 0xF, it & 0xF),
                        // ISWR
                        0x3F => self.set_vi(is & 0xF, it & 0xF, 0, 0),
                        // RINIT / RXOR read a lane; RGET writes a VF.
                        0x42 | 0x43 => {
                            let fsf = 8 >> ((lower >> 21) & 3);
                            self.set_lower_vf(0, 0, is, fsf, 0, 0);
                        }
                        0x41 => self.set_lower_vf(it, field, 0, 0, 0, 0),
                        // MFP
                        0x64 => self.set_lower_vf(it, field, 0, 0, 0, 0),
                        // XTOP / XITOP
                        0x68 | 0x69 => self.set_vi(0, 0, it & 0xF, 0),
                        // XGKICK
                        0x6C => self.set_vi(is & 0xF, 0, 0, 0),
                        // EFU ops read fs.
                        0x70..=0x7E => {
                            let f = match sop {
                                // Single-lane EFU variants.
                                0x78 | 0x79 | 0x7A | 0x7C | 0x7D | 0x7E => {
                                    8 >> ((lower >> 21) & 3)
                                }
                                // Vector EFU variants use xyz(w).
                                _ => 0xF,
                            };
                            self.set_lower_vf(0, 0, is, f, 0, 0);
                        }
                        _ => {
                            self.set_lower_vf(0, 0, 0, 0, 0, 0);
                            self.set_vi(0, 0, 0, 0);
                        }
                    }
                }
                _ => self.set_vi(0, 0, 0, 0),
            }
        } else {
            match (lower >> 25) & 0x7F {
                // LQ
                0x00 => {
                    self.set_lower_vf(it, field, 0, 0, 0, 0);
                    self.set_vi(is & 0xF, 0, 0, 0);
                }
                // SQ
                0x01 => {
                    self.set_lower_vf(0, 0, is, field, 0, 0);
                    self.set_vi(it & 0xF, 0, 0, 0);
                }
                // ILW: load-delayed integer write.
                0x04 => self.set_vi(is & 0xF, 0, it & 0xF, it & 0xF),
                // ISW
                0x05 => self.set_vi(is & 0xF, it & 0xF, 0, 0),
                // IADDIU / ISUBIU
                0x08 | 0x09 => self.set_vi(is & 0xF, 0, it & 0xF, 0),
                // FCEQ/FCSET/FCAND/FCOR write vi1 (FCSET writes none).
                0x10 | 0x12 | 0x13 => self.set_vi(0, 0, 1, 0),
                0x11 => self.set_vi(0, 0, 0, 0),
                // FSAND / FSEQ / FSOR
                0x16 | 0x17 | 0x1D => self.set_vi(0, 0, it & 0xF, 0),
                // FMEQ / FMAND / FMOR
                0x18 | 0x1A | 0x1B => self.set_vi(is & 0xF, 0, it & 0xF, 0),
                // FCGET
                0x1C => self.set_vi(0, 0, it & 0xF, 0),
                // B / BAL
                0x20 => self.set_vi(0, 0, 0, 0),
                0x21 => self.set_vi(0, 0, it & 0xF, 0),
                // JR / JALR
                0x24 => self.set_vi(is & 0xF, 0, 0, 0),
                0x25 => self.set_vi(is & 0xF, 0, it & 0xF, 0),
                // IBEQ / IBNE
                0x28 | 0x29 => self.set_vi(is & 0xF, it & 0xF, 0, 0),
                // IBLTZ/IBGTZ/IBLEZ/IBGEZ
                0x2C..=0x2F => self.set_vi(is & 0xF, 0, 0, 0),
                _ => self.set_vi(0, 0, 0, 0),
            }
        }
    }

    fn set_vi(&mut self, r0: u8, r1: u8, w: u8, w_load: u8) {
        self.vi_read0 = r0;
        self.vi_read1 = r1;
        self.vi_write = w;
        self.vi_write_from_load = w_load;
    }
}

/// Per-PC analysis record consumed by the translator.
#[derive(Debug, Clone, Copy, Default)]
pub struct VuInstrInfo {
    /// This pair sits in a branch delay slot (block ends here).
    pub branch_delay_slot: bool,
    /// This pair sits in the E-bit delay slot.
    pub ebit_delay_slot: bool,
    /// UPPER carries the E-bit.
    pub is_ebit: bool,
    /// LOWER is a branch.
    pub is_branch: bool,
    /// T-bit stop fires here.
    pub tbit_end: bool,
    /// LOWER must execute before UPPER's result lands (shared register).
    pub swap_ops: bool,
    /// The Q pipeline drains before this pair executes.
    pub update_q_pipeline: bool,
    /// The P pipeline drains before this pair executes.
    pub update_p_pipeline: bool,
    /// LOWER starts a Q-pipe operation (DIV/SQRT/RSQRT/WAITQ).
    pub q_pipeline_instr: bool,
    /// LOWER starts a P-pipe operation (EFU/WAITP).
    pub p_pipeline_instr: bool,
    /// MAC flags must be materialized for this pair's result.
    pub update_mac_pipeline: bool,
    /// UPPER produces a MAC result.
    pub has_mac_result: bool,
    /// UPPER produces a CLIP result.
    pub has_clip_result: bool,
    /// LOWER reads MAC or CLIP flags.
    pub flag_instruction: FlagInstr,
    /// The MAC pipeline advances before this pair executes.
    pub advance_mac_pipeline: bool,
    /// FMAC/load-delay stall cycles before issue.
    pub stall_amount: u8,
    /// VI register to stash at this PC for a later branch (0 = none).
    pub backup_vi: u8,
    /// The branch at this PC reads the stashed pre-write VI value.
    pub use_backup_vi: bool,
    /// Pipeline snapshot if the block ends (or may end) here.
    pub pipeline_state: [u64; 2],
    /// Decoder VF write of the UPPER slot (for swap choreography).
    pub decoder_vf_write: u8,
    /// Decoder VI write of the LOWER slot (for branch backup analysis).
    pub decoder_vi_write: u8,
}

/// Result of both analysis passes over one block.
#[derive(Debug)]
pub struct VuAnalysis {
    info: Vec<VuInstrInfo>,
    /// PC of the last instruction pair in the block.
    pub end_pc: u16,
    /// VI register whose backup services branch reads (0 = none).
    pub backup_vi_rec: u8,
    /// Branch delay slot state carried in from the previous block.
    pub entry_branch_delay: bool,
    /// E-bit delay slot state carried in from the previous block.
    pub entry_ebit_delay: bool,
}

impl VuAnalysis {
    /// Analysis record for the pair at `pc`.
    pub fn at(&self, pc: u16) -> &VuInstrInfo {
        &self.info[usize::from(pc) / 8]
    }

    fn at_mut(&mut self, pc: u16) -> &mut VuInstrInfo {
        &mut self.info[usize::from(pc) / 8]
    }
}

/// Reads an instruction word from VU micro memory.
///
/// # Safety
///
/// `state.instr_mem` must point at micro memory of at least
/// `mem_mask + 1` bytes.
pub(crate) unsafe fn read_instr(state: &VuState, addr: u16) -> u32 {
    let addr = usize::from(addr & state.mem_mask);
    let ptr = state.instr_mem.add(addr).cast::<u32>();
    ptr.read_unaligned()
}

/// FDIV pipe latency for a LOWER word (DIV/SQRT 7, RSQRT 13).
pub fn fdiv_pipe_cycles(lower: u32) -> i32 {
    if lower & (1 << 31) != 0 {
        match ((lower >> 4) & 0x7C) | (lower & 0x3) {
            0x38 | 0x39 => 7,
            0x3A => 13,
            _ => 0,
        }
    } else {
        0
    }
}

/// EFU pipe latency for a LOWER word, per elementary-function variant.
pub fn efu_pipe_cycles(lower: u32) -> i32 {
    if lower & (1 << 31) != 0 {
        match ((lower >> 4) & 0x7C) | (lower & 0x3) {
            0x70 => 11,
            0x71 | 0x72 | 0x79 => 18,
            0x73 => 24,
            0x74 | 0x75 => 54,
            0x76 | 0x78 | 0x7A => 12,
            0x7C => 29,
            0x7D => 54,
            0x7E => 44,
            _ => 0,
        }
    } else {
        0
    }
}

/// True when the UPPER word updates MAC flags (MAX/MINI and the
/// conversions do not).
pub fn updates_mac_flags(upper: u32) -> bool {
    match upper & 0x3F {
        // MAXbc / MINIbc
        0x10..=0x17 => false,
        // MAXi / MINIi
        0x1D | 0x1F => false,
        // MAX / MINI
        0x2B | 0x2F => false,
        0x3C..=0x3F => match (upper & 0x3) | ((upper >> 4) & 0x7C) {
            // ITOF / FTOI
            0x10..=0x17 => false,
            // ABS
            0x1D => false,
            // CLIP
            0x1F => false,
            // NOP
            0x2F | 0x30 => false,
            _ => true,
        },
        _ => true,
    }
}

/// Flag-reader classification of a LOWER word.
pub fn flag_instruction(lower: u32) -> FlagInstr {
    if lower & (1 << 31) == 0 {
        match (lower >> 25) & 0x7F {
            0x10 | 0x11 | 0x12 | 0x13 | 0x1C => FlagInstr::Clip,
            0x16 | 0x18 | 0x1A | 0x1B => FlagInstr::Mac,
            _ => FlagInstr::None,
        }
    } else {
        FlagInstr::None
    }
}

/// Pipeline model scratch for the interpreter pass.
struct PipelineModel {
    /// FMAC write-back queue; slot 0 is the newest.
    stall_pipe: [u64; 4],
    decoder: VuDecoder,
}

impl PipelineModel {
    fn advance(&mut self, cycles: i32) {
        for _ in 0..cycles {
            self.stall_pipe[3] = self.stall_pipe[2];
            self.stall_pipe[2] = self.stall_pipe[1];
            self.stall_pipe[1] = self.stall_pipe[0];
            self.stall_pipe[0] = u64::from(self.decoder.vf_write[0] & 0x1F)
                | (u64::from(self.decoder.vf_write[1] & 0x1F) << 5)
                | (u64::from(self.decoder.vf_write_field[0] & 0xF) << 10)
                | (u64::from(self.decoder.vf_write_field[1] & 0xF) << 14)
                | (u64::from(self.decoder.vi_write_from_load & 0xF) << 18);
        }
    }

    /// Scans the write-back queue for a field-overlapping read of an
    /// in-flight result. Returns the stall in cycles.
    fn fmac_stall(&self) -> u8 {
        for (i, &slot) in self.stall_pipe.iter().enumerate().take(3) {
            let write0 = (slot & 0x1F) as u8;
            let write1 = ((slot >> 5) & 0x1F) as u8;
            let vi_write = ((slot >> 18) & 0xF) as u8;

            let mut stall_found = false;
            if write0 != 0 || write1 != 0 {
                let write0_field = ((slot >> 10) & 0xF) as u8;
                let write1_field = ((slot >> 14) & 0xF) as u8;

                for j in 0..2 {
                    for (read, read_field) in [
                        (self.decoder.vf_read0[j], self.decoder.vf_read0_field[j]),
                        (self.decoder.vf_read1[j], self.decoder.vf_read1_field[j]),
                    ] {
                        if read == 0 {
                            continue;
                        }
                        if read == write0 && read_field & write0_field != 0 {
                            stall_found = true;
                        } else if read == write1 && read_field & write1_field != 0 {
                            stall_found = true;
                        }
                    }
                }
            }
            // Integer load delay: a branch or ALU reading a just-loaded VI.
            if vi_write != 0
                && (vi_write == self.decoder.vi_read0 || vi_write == self.decoder.vi_read1)
            {
                stall_found = true;
            }

            if stall_found {
                return (3 - i) as u8;
            }
        }
        0
    }

    fn snapshot(&self, q_delay: i32, p_delay: i32, is_branch: bool, is_ebit: bool) -> [u64; 2] {
        let mut state0 = self.stall_pipe[0] & 0x7F_FFFF;
        state0 |= (self.stall_pipe[1] & 0x7F_FFFF) << 23;
        state0 |= (self.stall_pipe[2] & 0x7F_FFFF) << 46;

        let mut state1 = self.stall_pipe[3] & 0x7F_FFFF;
        state1 |= (q_delay as u64 & 0xF) << 23;
        state1 |= (p_delay as u64 & 0x3F) << 27;
        state1 |= u64::from(self.decoder.vf_write[0] & 0x1F) << 33;
        state1 |= u64::from(self.decoder.vf_write[1] & 0x1F) << 38;
        state1 |= u64::from(self.decoder.vf_write_field[0] & 0xF) << 43;
        state1 |= u64::from(self.decoder.vf_write_field[1] & 0xF) << 47;
        state1 |= u64::from(self.decoder.vi_write_from_load & 0xF) << 51;
        state1 |= u64::from(is_branch) << 55;
        state1 |= u64::from(is_ebit) << 56;
        [state0, state1]
    }
}

/// Runs both analysis passes over the block starting at the state's PC.
///
/// # Safety
///
/// Caller guarantees `state.instr_mem` points at valid micro memory.
pub(crate) unsafe fn analyze(state: &VuState, prev_pc: u32) -> VuAnalysis {
    let slots = (usize::from(state.mem_mask) + 1) / 8;
    let mut analysis = VuAnalysis {
        info: vec![VuInstrInfo::default(); slots.max(1)],
        end_pc: state.pc,
        backup_vi_rec: 0,
        entry_branch_delay: false,
        entry_ebit_delay: false,
    };

    let mut model = PipelineModel {
        stall_pipe: [0; 4],
        decoder: VuDecoder::default(),
    };
    let mut q_pipe_delay: i32 = 0;
    let mut p_pipe_delay: i32 = 0;
    let mut branch_delay_slot = false;
    let mut ebit_delay_slot = false;
    let mut int_branch_delay = state.int_branch_delay != 0;
    let mut int_backup_id = state.int_backup_id;

    // Restore the pipeline model from the block we jumped out of.
    if prev_pc != NO_PREV_PC {
        let s = state.pipeline_state;
        model.stall_pipe[0] = s[0] & 0x7F_FFFF;
        model.stall_pipe[1] = (s[0] >> 23) & 0x7F_FFFF;
        model.stall_pipe[2] = (s[0] >> 46) & 0x7F_FFFF;
        model.stall_pipe[3] = s[1] & 0x7F_FFFF;
        model.decoder.vf_write[0] = ((s[1] >> 33) & 0x1F) as u8;
        model.decoder.vf_write[1] = ((s[1] >> 38) & 0x1F) as u8;
        model.decoder.vf_write_field[0] = ((s[1] >> 43) & 0xF) as u8;
        model.decoder.vf_write_field[1] = ((s[1] >> 47) & 0xF) as u8;
        model.decoder.vi_write_from_load = ((s[1] >> 51) & 0xF) as u8;
        q_pipe_delay = ((s[1] >> 23) & 0xF) as i32;
        p_pipe_delay = ((s[1] >> 27) & 0x3F) as i32;
        branch_delay_slot = (s[1] >> 55) & 1 != 0;
        ebit_delay_slot = (s[1] >> 56) & 1 != 0;
    }
    analysis.entry_branch_delay = branch_delay_slot;
    analysis.entry_ebit_delay = ebit_delay_slot;

    let mut pc = state.pc;
    let mut block_end = false;
    while !block_end {
        let upper = read_instr(state, pc.wrapping_add(4));
        let lower = read_instr(state, pc);
        *analysis.at_mut(pc) = VuInstrInfo::default();

        if branch_delay_slot || ebit_delay_slot {
            block_end = true;
            analysis.at_mut(pc).branch_delay_slot = branch_delay_slot;
            analysis.at_mut(pc).ebit_delay_slot = ebit_delay_slot;
        }
        branch_delay_slot = false;
        ebit_delay_slot = false;

        model.advance(1);
        model.decoder.reset();

        analysis.at_mut(pc).has_mac_result = updates_mac_flags(upper);
        analysis.at_mut(pc).has_clip_result = upper & 0x7FF == 0x1FF;

        model.decoder.decode_upper(upper);

        if upper & (1 << 31) == 0 {
            // A real LOWER instruction accompanies the UPPER.
            model.decoder.decode_lower(lower);
            analysis.at_mut(pc).flag_instruction = flag_instruction(lower);
            analysis.at_mut(pc).decoder_vi_write = model.decoder.vi_write;

            // If the UPPER writes a register the LOWER reads (or both
            // write the same register), the LOWER must see the pre-UPPER
            // value: swap execution order.
            let write = model.decoder.vf_write[0];
            let write1 = model.decoder.vf_write[1];
            let read0 = model.decoder.vf_read0[1];
            let read1 = model.decoder.vf_read1[1];
            if write != 0 && (write == read0 || write == read1 || write == write1) {
                analysis.at_mut(pc).swap_ops = true;
                analysis.at_mut(pc).decoder_vf_write = write;
            }

            handle_stalls(
                &mut analysis,
                &model,
                pc,
                lower,
                &mut q_pipe_delay,
                &mut p_pipe_delay,
                int_branch_delay,
                int_backup_id,
                state.pc,
            );

            if lower & 0xC000_0000 == 0x4000_0000 {
                branch_delay_slot = true;
                analysis.at_mut(pc).is_branch = true;
            }
        } else {
            // LOI: the LOWER slot is an immediate, nothing to decode.
            let stall = model.fmac_stall();
            analysis.at_mut(pc).stall_amount = stall;
        }

        // Drain the scalar pipes with issue + stall cycles.
        let issue = i32::from(analysis.at(pc).stall_amount) + 1;
        if q_pipe_delay > 0 && !analysis.at(pc).q_pipeline_instr {
            q_pipe_delay -= issue;
            if q_pipe_delay <= 0 {
                analysis.at_mut(pc).update_q_pipeline = true;
                q_pipe_delay = 0;
            }
        }
        if p_pipe_delay > 0 && !analysis.at(pc).p_pipeline_instr {
            p_pipe_delay -= issue;
            if p_pipe_delay <= 0 {
                analysis.at_mut(pc).update_p_pipeline = true;
                p_pipe_delay = 0;
            }
        }

        let stall = i32::from(analysis.at(pc).stall_amount);
        if stall > 0 {
            model.advance(stall);
        }

        if upper & (1 << 30) != 0 {
            ebit_delay_slot = true;
            analysis.at_mut(pc).is_ebit = true;
        }

        // T-bit stops require the FBRST enable for this unit.
        if upper & (1 << 27) != 0 && state.fbrst & (1 << (3 + state.id * 8)) != 0 {
            block_end = true;
            analysis.at_mut(pc).tbit_end = true;
        }

        // XGKICK can stall mid-block; it needs a snapshot to exit with.
        if upper & (1 << 31) == 0 && lower & (1 << 31) != 0 && lower & 0x7FF == 0x6FC {
            let info = analysis.at(pc);
            let snap = model.snapshot(q_pipe_delay, p_pipe_delay, info.is_branch, info.is_ebit);
            analysis.at_mut(pc).pipeline_state = snap;
        }

        if analysis.at(pc).decoder_vi_write != int_backup_id {
            int_branch_delay = false;
            int_backup_id = 0;
        }

        pc = pc.wrapping_add(8) & state.mem_mask;
    }

    analysis.end_pc = pc.wrapping_sub(8) & state.mem_mask;
    let end_pc = analysis.end_pc;

    // The last writer of the block may feed a branch in the next block;
    // stash it unless the write is still in the load-delay slot.
    if !analysis.at(end_pc).ebit_delay_slot {
        let vi_write = analysis.at(end_pc).decoder_vi_write;
        if vi_write != 0 && model.decoder.vi_write_from_load == 0 {
            analysis.at_mut(end_pc).backup_vi = vi_write;
        }
    }

    {
        let info = analysis.at(end_pc);
        let snap = model.snapshot(q_pipe_delay, p_pipe_delay, info.is_branch, info.is_ebit);
        analysis.at_mut(end_pc).pipeline_state = snap;
    }

    flag_pass(&mut analysis, state.pc);
    analysis
}

/// Q/P pipe and branch-backup handling for one LOWER instruction.
#[allow(clippy::too_many_arguments)]
fn handle_stalls(
    analysis: &mut VuAnalysis,
    model: &PipelineModel,
    pc: u16,
    lower: u32,
    q_pipe_delay: &mut i32,
    p_pipe_delay: &mut i32,
    int_branch_delay: bool,
    int_backup_id: u8,
    start_pc: u16,
) {
    analysis.at_mut(pc).stall_amount = model.fmac_stall();

    // WAITQ, DIV, SQRT, RSQRT contend on the Q pipe.
    if lower & 0x8000_07FC == 0x8000_03BC {
        analysis.at_mut(pc).q_pipeline_instr = true;
        if *q_pipe_delay > 0 {
            if i32::from(analysis.at(pc).stall_amount) < *q_pipe_delay {
                analysis.at_mut(pc).stall_amount = *q_pipe_delay as u8;
            }
            analysis.at_mut(pc).update_q_pipeline = true;
        }
        *q_pipe_delay = fdiv_pipe_cycles(lower);
    }

    // WAITP and the EFU family contend on the P pipe.
    if lower & (1 << 31) != 0 && (lower >> 2) & 0x1CF == 0x1CF {
        analysis.at_mut(pc).p_pipeline_instr = true;
        if *p_pipe_delay > 0 {
            if i32::from(analysis.at(pc).stall_amount) < *p_pipe_delay - 1 {
                analysis.at_mut(pc).stall_amount = (*p_pipe_delay - 1) as u8;
            }
            analysis.at_mut(pc).update_p_pipeline = true;
        }
        *p_pipe_delay = efu_pipe_cycles(lower);
    }

    // Conditional branches may need the pre-write value of a VI register
    // whose write retires this very cycle.
    if lower & 0xC000_0000 == 0x4000_0000
        && (lower >> 25) & 0xF >= 0x4
        && analysis.at(pc).stall_amount == 0
    {
        analysis.at_mut(pc).use_backup_vi = false;
        if int_branch_delay {
            if int_backup_id == model.decoder.vi_read0 || int_backup_id == model.decoder.vi_read1
            {
                analysis.at_mut(pc).use_backup_vi = true;
                analysis.backup_vi_rec = int_backup_id;
            }
        } else if pc >= 8 {
            let prev_write = analysis.at(pc - 8).decoder_vi_write;
            if prev_write != 0 {
                if prev_write == model.decoder.vi_read0 {
                    analysis.backup_vi_rec = model.decoder.vi_read0;
                    analysis.at_mut(pc).use_backup_vi = true;
                }
                if prev_write == model.decoder.vi_read1 {
                    analysis.backup_vi_rec = model.decoder.vi_read1;
                    analysis.at_mut(pc).use_backup_vi = true;
                }
                if analysis.at(pc).use_backup_vi {
                    // Scan back for the earliest safe PC to stash the
                    // value. The look-back is hard-bounded at 32 bytes;
                    // stalls break the chain. Signed arithmetic so index 0
                    // is inspected like any other slot.
                    let mut backup_pc = i32::from(if pc < start_pc.saturating_add(32) {
                        start_pc
                    } else {
                        pc - 32
                    });
                    let mut i = i32::from(pc) - 8;
                    while i >= backup_pc {
                        if analysis.at(i as u16).stall_amount != 0 {
                            backup_pc = i;
                            break;
                        }
                        i -= 8;
                    }
                    let rec = analysis.backup_vi_rec;
                    analysis.at_mut(backup_pc as u16).backup_vi = rec;
                }
            }
        }
    }
}

/// Backward pass marking where MAC/CLIP flags must be materialized.
fn flag_pass(analysis: &mut VuAnalysis, start_pc: u16) {
    let end_pc = analysis.end_pc;
    let mut clip_found = false;
    let mut mac_found = false;
    let mut final_mac_found = false;
    let mut needs_update = false;
    let mut mac_cycles: i32 = 0;
    let mut clip_cycles: i32 = 0;

    let mut i = end_pc;
    while i >= start_pc && i <= end_pc {
        match analysis.at(i).flag_instruction {
            FlagInstr::Clip => {
                clip_found = true;
                clip_cycles = 5;
            }
            FlagInstr::Mac => {
                mac_found = true;
                mac_cycles = 5;
            }
            FlagInstr::None => {}
        }

        // Block-boundary windows always update: the next block (or a
        // subroutine) may read flags immediately.
        if i >= end_pc.saturating_sub(32) || !final_mac_found {
            needs_update = true;
        }
        if i <= start_pc.saturating_add(32) {
            needs_update = true;
        }

        if mac_found {
            needs_update = true;
            mac_cycles -= i32::from(analysis.at(i).stall_amount);
            if mac_cycles <= 0 {
                mac_found = false;
            }
        }
        if clip_found {
            needs_update = true;
            clip_cycles -= i32::from(analysis.at(i).stall_amount);
            if clip_cycles <= 0 {
                clip_found = false;
            }
        }
        if analysis.at(i).has_clip_result {
            needs_update = true;
        }

        if needs_update {
            analysis.at_mut(i).advance_mac_pipeline = true;
            if analysis.at(i).has_mac_result {
                final_mac_found = true;
                analysis.at_mut(i).update_mac_pipeline = true;
            }
            needs_update = false;
        }

        if i < 8 {
            break;
        }
        i -= 8;
    }
}
