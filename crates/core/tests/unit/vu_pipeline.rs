//! VU pipeline analysis tests: latency tables, FMAC stalls, operand
//! swapping, and snapshot keying.

use psrec_core::vu::pipeline::{efu_pipe_cycles, fdiv_pipe_cycles, updates_mac_flags};

use crate::common::{VuMemory, VU_EBIT, VU_LOWER_NOP, VU_UPPER_NOP};
use psrec_core::vu::VuTranslator;

/// DIV vf0x / vf0y with both lanes selected from vf0.
const DIV_WORD: u32 = 0x8000_03BC | (1 << 23);
/// RSQRT with the same operand shape.
const RSQRT_WORD: u32 = 0x8000_03BE | (1 << 23);

#[test]
fn fdiv_latencies() {
    assert_eq!(fdiv_pipe_cycles(DIV_WORD), 7);
    assert_eq!(fdiv_pipe_cycles(RSQRT_WORD), 13);
    assert_eq!(fdiv_pipe_cycles(VU_LOWER_NOP), 0);
    // LOWER immediates never touch the Q pipe.
    assert_eq!(fdiv_pipe_cycles(0x0000_03BC), 0);
}

#[rstest::rstest]
#[case::esadd(0x70, 11)]
#[case::ersadd(0x71, 18)]
#[case::eleng(0x72, 18)]
#[case::erleng(0x73, 24)]
#[case::eatanxy(0x74, 54)]
#[case::esum(0x76, 12)]
#[case::esqrt(0x78, 12)]
#[case::ersqrt(0x79, 18)]
#[case::ercpr(0x7A, 12)]
#[case::esin(0x7C, 29)]
#[case::eatan(0x7D, 54)]
#[case::eexp(0x7E, 44)]
fn efu_latency_table(#[case] op: u32, #[case] cycles: i32) {
    let word = 0x8000_0000 | ((op & 0x7C) << 4) | (op & 0x3);
    assert_eq!(efu_pipe_cycles(word), cycles);
}

#[test]
fn mac_flag_producers() {
    // ADD updates MAC flags.
    assert!(updates_mac_flags(0x0000_0028));
    // MAX does not.
    assert!(!updates_mac_flags(0x0000_002B));
    // FTOI4 does not (upper special 0x15).
    let ftoi4 = ((0x15u32 & 0x7C) << 4) | (0x15 & 0x3) | 0x3C;
    assert!(!updates_mac_flags(ftoi4));
}

/// MUL vf1, vf2, vf3 (xyz) followed immediately by a consumer of vf1 must
/// stall the consumer while the result sits in the write-back queue.
#[test]
fn fmac_read_after_write_stalls() {
    let mut mem = VuMemory::new();
    // MULx.xyz vf1, vf2, vf3
    let mul = (0xE << 21) | (3 << 16) | (2 << 11) | (1 << 6) | 0x18;
    // ADD.xyz vf4, vf1, vf2 (reads vf1 right away)
    let add = (0xE << 21) | (2 << 16) | (1 << 11) | (4 << 6) | 0x28;
    mem.poke_pair(0, mul, VU_LOWER_NOP);
    mem.poke_pair(8, add, VU_LOWER_NOP);
    mem.poke_pair(16, VU_UPPER_NOP | VU_EBIT, VU_LOWER_NOP);
    mem.poke_pair(24, VU_UPPER_NOP, VU_LOWER_NOP);

    let state = mem.state();
    let (_block, analysis) = VuTranslator::new().translate(&state, psrec_core::vu::NO_PREV_PC);
    assert_eq!(analysis.at(0).stall_amount, 0);
    // Three pipeline slots remain when the consumer issues next cycle.
    assert_eq!(analysis.at(8).stall_amount, 3);
}

/// UPPER writing a register LOWER reads forces the swap choreography.
#[test]
fn shared_register_swaps_ops() {
    let mut mem = VuMemory::new();
    // ADD.xyzw vf1, vf2, vf3
    let add = (0xF << 21) | (3 << 16) | (2 << 11) | (1 << 6) | 0x28;
    // SQ.xyzw vf1, 0(vi1): LOWER reads vf1
    let sq = (0x01 << 25) | (0xF << 21) | (1 << 16) | (1 << 11);
    mem.poke_pair(0, add, sq);
    mem.poke_pair(8, VU_UPPER_NOP | VU_EBIT, VU_LOWER_NOP);
    mem.poke_pair(16, VU_UPPER_NOP, VU_LOWER_NOP);

    let state = mem.state();
    let (_block, analysis) = VuTranslator::new().translate(&state, psrec_core::vu::NO_PREV_PC);
    assert!(analysis.at(0).swap_ops);
}

/// The branch-backup look-back must inspect slot 0 of its window: a block
/// starting at PC 0 whose only stall sits at offset 0 stashes the VI
/// backup at that stall, not anywhere earlier.
#[test]
fn backup_scan_inspects_window_start() {
    let mut mem = VuMemory::new();
    // ADD.xyzw vf3, vf2, vf2: stalls at PC 0 against the in-flight vf2
    // write carried in from the previous block's pipeline snapshot.
    let add = (0xF << 21) | (2 << 16) | (2 << 11) | (3 << 6) | 0x28;
    // IADDIU vi1, vi0, 5
    let iaddiu = (0x08 << 25) | (1 << 16) | 0x005;
    // IBNE vi0, vi1, +2: reads vi1 the cycle after its write retires.
    let ibne = (0x29 << 25) | (1 << 11) | 0x002;
    mem.poke_pair(0, add, VU_LOWER_NOP);
    mem.poke_pair(8, VU_UPPER_NOP, iaddiu);
    mem.poke_pair(16, VU_UPPER_NOP, ibne);
    mem.poke_pair(24, VU_UPPER_NOP, VU_LOWER_NOP); // delay slot
    mem.poke_pair(32, VU_UPPER_NOP, VU_LOWER_NOP);

    let mut state = mem.state();
    // In-flight FMAC write of vf2.xyzw in the newest write-back slot.
    state.pipeline_state = [2 | (0xF << 10), 0];
    let (_block, analysis) = VuTranslator::new().translate(&state, 0x100);

    assert!(analysis.at(0).stall_amount > 0, "carried write must stall PC 0");
    assert_eq!(analysis.at(8).stall_amount, 0);
    assert!(analysis.at(16).use_backup_vi);
    // The stall at offset 0 breaks the chain there, exactly at the
    // window's start.
    assert_eq!(analysis.at(0).backup_vi, 1);
    assert_eq!(analysis.at(8).backup_vi, 0);
}

/// The snapshot at a block exit encodes the Q-pipe delay left by a DIV.
#[test]
fn snapshot_carries_q_delay() {
    let mut mem = VuMemory::new();
    mem.poke_pair(0, VU_UPPER_NOP, DIV_WORD);
    mem.poke_pair(8, VU_UPPER_NOP | VU_EBIT, VU_LOWER_NOP);
    mem.poke_pair(16, VU_UPPER_NOP, VU_LOWER_NOP);

    let state = mem.state();
    let (_block, analysis) = VuTranslator::new().translate(&state, psrec_core::vu::NO_PREV_PC);
    let snap = analysis.at(16).pipeline_state;
    let q_delay = (snap[1] >> 23) & 0xF;
    // 7-cycle FDIV minus the two issue cycles after it.
    assert_eq!(q_delay, 5);
}
