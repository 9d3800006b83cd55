//! VU translator tests: IR ordering around pipeline bookkeeping, LOI, the
//! swap choreography, and block-end sequences.

use psrec_core::ir::{Block, Opcode, Operand};
use psrec_core::state::VU_REG_I;
use psrec_core::vu::{VuTranslator, NO_PREV_PC};

use crate::common::{VuMemory, VU_EBIT, VU_LOWER_NOP, VU_UPPER_NOP};

fn ops(block: &Block) -> Vec<Opcode> {
    block.iter().map(|i| i.op).collect()
}

/// MULx.xyz vf1, vf2, vf3
const MULX_XYZ: u32 = (0xE << 21) | (3 << 16) | (2 << 11) | (1 << 6) | 0x18;
/// FMAND vi1, vi1
const FMAND_VI1: u32 = (0x1A << 25) | (1 << 16) | (1 << 11);

/// Scenario: a MAC-flag producer followed by FMAND must have the MAC
/// pipeline advanced and the flags materialized before the FMAND lowers.
#[test]
fn fmand_sees_updated_mac_pipeline() {
    let mut mem = VuMemory::new();
    mem.poke_pair(0, MULX_XYZ, VU_LOWER_NOP);
    mem.poke_pair(8, VU_UPPER_NOP, FMAND_VI1);
    mem.poke_pair(16, VU_UPPER_NOP | VU_EBIT, VU_LOWER_NOP);
    mem.poke_pair(24, VU_UPPER_NOP, VU_LOWER_NOP);

    let state = mem.state();
    let (block, _) = VuTranslator::new().translate(&state, NO_PREV_PC);
    let sequence = ops(&block);

    let fmand_at = sequence
        .iter()
        .position(|&op| op == Opcode::VMacAnd)
        .expect("FMAND lowered");
    let before = &sequence[..fmand_at];
    assert!(
        before.contains(&Opcode::UpdateMacPipeline),
        "MAC pipeline not advanced before FMAND: {sequence:?}"
    );
    assert!(
        before.contains(&Opcode::UpdateMacFlags),
        "MAC flags not materialized before FMAND: {sequence:?}"
    );
}

/// LOI: the LOWER word becomes a float immediate for I, placed after the
/// UPPER instruction.
#[test]
fn loi_loads_i_after_upper() {
    let mut mem = VuMemory::new();
    // ADDi.x vf1, vf2, I with the LOI bit set; LOWER is the raw constant.
    let addi_upper = (1 << 31) | (0x8 << 21) | (2 << 11) | (1 << 6) | 0x22;
    mem.poke_pair(0, addi_upper, 0x3F80_0000);
    mem.poke_pair(8, VU_UPPER_NOP | VU_EBIT, VU_LOWER_NOP);
    mem.poke_pair(16, VU_UPPER_NOP, VU_LOWER_NOP);

    let state = mem.state();
    let (block, _) = VuTranslator::new().translate(&state, NO_PREV_PC);
    let instrs: Vec<_> = block.iter().cloned().collect();

    let add_at = instrs
        .iter()
        .position(|i| i.op == Opcode::VAddVectorByScalar)
        .expect("upper lowered");
    let loi_at = instrs
        .iter()
        .position(|i| i.op == Opcode::LoadFloatConst)
        .expect("LOI lowered");
    assert!(add_at < loi_at);
    assert_eq!(instrs[loi_at].dest, Operand::Reg(VU_REG_I));
    assert_eq!(instrs[loi_at].source, Operand::Imm(0x3F80_0000));
}

/// Swapped pairs wrap the UPPER in backup/restore so the LOWER observes
/// the pre-UPPER value of the shared register.
#[test]
fn swap_ops_choreography() {
    let mut mem = VuMemory::new();
    let add = (0xF << 21) | (3 << 16) | (2 << 11) | (1 << 6) | 0x28; // ADD vf1, vf2, vf3
    let sq = (0x01 << 25) | (0xF << 21) | (1 << 16) | (1 << 11); // SQ vf1, 0(vi1)
    mem.poke_pair(0, add, sq);
    mem.poke_pair(8, VU_UPPER_NOP | VU_EBIT, VU_LOWER_NOP);
    mem.poke_pair(16, VU_UPPER_NOP, VU_LOWER_NOP);

    let state = mem.state();
    let (block, _) = VuTranslator::new().translate(&state, NO_PREV_PC);
    let sequence = ops(&block);

    let backup_old = sequence.iter().position(|&op| op == Opcode::BackupVF).unwrap();
    let upper = sequence.iter().position(|&op| op == Opcode::VAddVectors).unwrap();
    let lower = sequence.iter().position(|&op| op == Opcode::StoreQuad).unwrap();
    let restores: Vec<usize> = sequence
        .iter()
        .enumerate()
        .filter(|(_, &op)| op == Opcode::RestoreVF)
        .map(|(at, _)| at)
        .collect();

    assert!(backup_old < upper);
    assert!(upper < lower);
    assert_eq!(restores.len(), 2);
    assert!(restores[0] < lower && lower < restores[1]);
}

/// E-bit termination drains the pipelines: Stop, empty snapshot, forced Q
/// and P updates, and a 4-cycle MAC drain, then the XGKICK tick.
#[test]
fn ebit_termination_sequence() {
    let mut mem = VuMemory::new();
    mem.poke_pair(0, VU_UPPER_NOP | VU_EBIT, VU_LOWER_NOP);
    mem.poke_pair(8, VU_UPPER_NOP, VU_LOWER_NOP);

    let state = mem.state();
    let (block, _) = VuTranslator::new().translate(&state, NO_PREV_PC);
    let instrs: Vec<_> = block.iter().cloned().collect();
    let sequence = ops(&block);

    let stop_at = sequence.iter().position(|&op| op == Opcode::Stop).unwrap();
    let tail = &sequence[stop_at..];
    assert!(tail.contains(&Opcode::SavePipelineState));
    assert!(tail.contains(&Opcode::UpdateQ));
    assert!(tail.contains(&Opcode::UpdateP));

    let drain = instrs
        .iter()
        .skip(stop_at)
        .find(|i| i.op == Opcode::UpdateMacPipeline)
        .expect("MAC drain after stop");
    assert_eq!(drain.source, Operand::Imm(4));

    assert_eq!(*sequence.last().unwrap(), Opcode::UpdateXgkick);
    // The stop resumes after the delay slot.
    assert_eq!(instrs[stop_at].jump_dest, 16);
}

/// A conditional branch block ends with SavePC and the pipeline snapshot.
#[test]
fn branch_exit_saves_pc_and_snapshot() {
    let mut mem = VuMemory::new();
    // IBNE vi1, vi2, +2
    let ibne = (0x29 << 25) | (2 << 16) | (1 << 11) | 0x002;
    mem.poke_pair(0, VU_UPPER_NOP, ibne);
    mem.poke_pair(8, VU_UPPER_NOP, VU_LOWER_NOP); // delay slot
    mem.poke_pair(16, VU_UPPER_NOP, VU_LOWER_NOP);

    let state = mem.state();
    let (block, _) = VuTranslator::new().translate(&state, NO_PREV_PC);
    let sequence = ops(&block);

    assert!(sequence.contains(&Opcode::BranchNotEqual));
    assert!(sequence.contains(&Opcode::MoveDelayedBranch));
    assert!(sequence.contains(&Opcode::SavePC));
    assert!(sequence.contains(&Opcode::SavePipelineState));
}

/// Translating the same memory twice produces structurally equal blocks.
#[test]
fn translation_is_deterministic() {
    let mut mem = VuMemory::new();
    mem.poke_pair(0, MULX_XYZ, VU_LOWER_NOP);
    mem.poke_pair(8, VU_UPPER_NOP, FMAND_VI1);
    mem.poke_pair(16, VU_UPPER_NOP | VU_EBIT, VU_LOWER_NOP);
    mem.poke_pair(24, VU_UPPER_NOP, VU_LOWER_NOP);

    let state = mem.state();
    let (first, _) = VuTranslator::new().translate(&state, NO_PREV_PC);
    let (second, _) = VuTranslator::new().translate(&state, NO_PREV_PC);
    assert_eq!(first, second);
}
