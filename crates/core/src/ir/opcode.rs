//! The IR opcode set.
//!
//! One enum covers both guest ISAs. EE integer and floating point families
//! sit first, the VU vector families after them, and the VU pipeline
//! bookkeeping ops at the end. The set is closed: translators map every
//! guest word either onto these ops or onto `FallbackInterpreter`.

/// Operation selector for one IR instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[allow(missing_docs)] // Variant names follow the guest operations they lower.
pub enum Opcode {
    /// Placeholder produced by `Instruction::default`; never emitted.
    #[default]
    Null,

    // --- EE and VU shared integer ops -----------------------------------
    LoadConst,
    LoadFloatConst,
    MoveIntReg,

    // --- EE integer ALU -------------------------------------------------
    AddDoublewordImm,
    AddDoublewordReg,
    AddWordImm,
    AddWordReg,
    SubDoublewordReg,
    SubWordReg,
    AndImm,
    AndReg,
    OrImm,
    OrReg,
    XorImm,
    XorReg,
    NorReg,
    SetOnLessThan,
    SetOnLessThanUnsigned,
    SetOnLessThanImmediate,
    SetOnLessThanImmediateUnsigned,
    ShiftLeftLogical,
    ShiftLeftLogicalVariable,
    ShiftRightLogical,
    ShiftRightLogicalVariable,
    ShiftRightArithmetic,
    ShiftRightArithmeticVariable,
    DoublewordShiftLeftLogical,
    DoublewordShiftLeftLogicalVariable,
    DoublewordShiftRightLogical,
    DoublewordShiftRightLogicalVariable,
    DoublewordShiftRightArithmetic,
    DoublewordShiftRightArithmeticVariable,
    ClearDoublewordReg,
    ClearWordReg,
    MoveConditionalOnZero,
    MoveConditionalOnNotZero,
    NegateDoublewordReg,
    NegateWordReg,
    MultiplyWord,
    MultiplyUnsignedWord,
    MultiplyWord1,
    MultiplyUnsignedWord1,
    DivideWord,
    DivideUnsignedWord,
    DivideWord1,
    DivideUnsignedWord1,
    MoveFromLoHi,
    MoveToLoHi,
    MoveFromLoHi1,
    MoveToLoHi1,
    MoveFromSa,
    MoveToSa,

    // --- EE branches and jumps ------------------------------------------
    BranchEqual,
    BranchNotEqual,
    BranchEqualZero,
    BranchNotEqualZero,
    BranchGreaterThanOrEqualZero,
    BranchGreaterThanZero,
    BranchLessThanOrEqualZero,
    BranchLessThanZero,
    BranchCop1,
    Jump,
    JumpAndLink,
    JumpIndirect,
    JumpAndLinkIndirect,
    SystemCall,
    ExceptionReturn,

    // --- EE loads/stores ------------------------------------------------
    LoadByte,
    LoadByteUnsigned,
    LoadHalfword,
    LoadHalfwordUnsigned,
    LoadWord,
    LoadWordUnsigned,
    LoadWordLeft,
    LoadWordRight,
    LoadDoubleword,
    LoadDoublewordLeft,
    LoadDoublewordRight,
    LoadQuadword,
    LoadWordCop1,
    StoreByte,
    StoreHalfword,
    StoreWord,
    StoreWordLeft,
    StoreWordRight,
    StoreDoubleword,
    StoreDoublewordLeft,
    StoreDoublewordRight,
    StoreQuadword,
    StoreWordCop1,

    // --- EE COP1 (scalar FPU) -------------------------------------------
    FloatingPointAdd,
    FloatingPointSubtract,
    FloatingPointMultiply,
    FloatingPointDivide,
    FloatingPointSquareRoot,
    FloatingPointReciprocalSquareRoot,
    FloatingPointMultiplyAdd,
    FloatingPointMultiplySubtract,
    FloatingPointMinimum,
    FloatingPointMaximum,
    FloatingPointAbsoluteValue,
    FloatingPointNegate,
    FloatingPointMove,
    FloatingPointCompareEqual,
    FloatingPointCompareLessThan,
    FloatingPointCompareLessThanOrEqual,
    FloatingPointConvertToFixedPoint,
    FixedPointConvertToFloatingPoint,
    FloatingPointClearControl,
    MoveWordFromCop1,
    MoveWordToCop1,

    // --- EE MMI (parallel) ----------------------------------------------
    ParallelAddByte,
    ParallelAddHalfword,
    ParallelAddWord,
    ParallelAddByteSaturation,
    ParallelAddHalfwordSaturation,
    ParallelAddByteUnsignedSaturation,
    ParallelAddHalfwordUnsignedSaturation,
    ParallelSubByte,
    ParallelSubHalfword,
    ParallelSubWord,
    ParallelSubByteSaturation,
    ParallelSubHalfwordSaturation,
    ParallelSubByteUnsignedSaturation,
    ParallelSubHalfwordUnsignedSaturation,
    ParallelAnd,
    ParallelOr,
    ParallelXor,
    ParallelNor,
    ParallelCopyLowerDoubleword,
    ParallelCopyUpperDoubleword,

    // --- EE COP2 glue ---------------------------------------------------
    VCallMs,
    VCallMsr,
    WaitVU0,
    CheckInterlockVU0,

    // --- VU integer ops -------------------------------------------------
    AndInt,
    OrInt,
    AddIntReg,
    SubIntReg,
    AddUnsignedImm,
    SubUnsignedImm,

    // --- VU loads/stores ------------------------------------------------
    LoadInt,
    StoreInt,
    LoadQuad,
    StoreQuad,
    LoadQuadInc,
    StoreQuadInc,
    LoadQuadDec,
    StoreQuadDec,

    // --- VU vector arithmetic -------------------------------------------
    VAddVectors,
    VAddVectorByScalar,
    VSubVectors,
    VSubVectorByScalar,
    VMulVectors,
    VMulVectorByScalar,
    VMaddVectors,
    VMaddAccAndVectors,
    VMaddVectorByScalar,
    VMaddAccByScalar,
    VMsubVectors,
    VMsubVectorByScalar,
    VMsubAccByScalar,
    VMaxVectors,
    VMaxVectorByScalar,
    VMinVectors,
    VMinVectorByScalar,
    VOpMula,
    VOpMsub,
    VAbs,
    VClip,
    VDiv,
    VRsqrt,
    VFixedToFloat0,
    VFixedToFloat4,
    VFixedToFloat12,
    VFixedToFloat15,
    VFloatToFixed0,
    VFloatToFixed4,
    VFloatToFixed12,
    VFloatToFixed15,
    VMoveFloat,
    VMoveRotatedFloat,
    VMoveToInt,
    VMoveFromInt,
    VMoveFromP,
    VEleng,
    VErleng,
    VESqrt,
    VERsqrt,
    VRInit,

    // --- VU flags -------------------------------------------------------
    VMacEq,
    VMacAnd,
    SetClipFlags,
    GetClipFlags,
    AndClipFlags,
    OrClipFlags,
    AndStatFlags,

    // --- VU pipeline bookkeeping ----------------------------------------
    UpdateQ,
    UpdateP,
    UpdateMacFlags,
    UpdateMacPipeline,
    SavePC,
    SavePipelineState,
    MoveDelayedBranch,
    BackupVF,
    RestoreVF,
    BackupVI,
    ClearIntDelay,
    MoveXTOP,
    MoveXITOP,
    Xgkick,
    UpdateXgkick,
    Stop,
    StopTBit,

    // --- shared ---------------------------------------------------------
    FallbackInterpreter,
}

impl Opcode {
    /// True for the branch/jump family: the ops after which a translator
    /// closes the block (modulo the delay slot).
    pub fn is_jump(self) -> bool {
        matches!(
            self,
            Self::BranchEqual
                | Self::BranchNotEqual
                | Self::BranchEqualZero
                | Self::BranchNotEqualZero
                | Self::BranchGreaterThanOrEqualZero
                | Self::BranchGreaterThanZero
                | Self::BranchLessThanOrEqualZero
                | Self::BranchLessThanZero
                | Self::BranchCop1
                | Self::Jump
                | Self::JumpAndLink
                | Self::JumpIndirect
                | Self::JumpAndLinkIndirect
                | Self::SystemCall
                | Self::ExceptionReturn
        )
    }
}
