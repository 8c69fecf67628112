//! Trace operations.
//!
//! A recorded trace is a linear list of [`Operation`]s over boxes and
//! constants. The opcode set is closed: the dispatch tables in the block
//! compiler match on [`Op`] and panic on entries they do not implement.

use crate::ir::{BoxVal, Descr, Kind, Operand};

/// Opcode of a trace operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    // ===== Control =====
    Label,
    Jump,
    Finish,

    // ===== Guards =====
    GuardTrue,
    GuardFalse,
    GuardValue,
    GuardClass,
    GuardNonnull,
    GuardIsnull,
    GuardNonnullClass,
    GuardException,
    GuardNoException,
    GuardNotInvalidated,
    GuardNotForced,
    GuardOverflow,
    GuardNoOverflow,

    // ===== Integer arithmetic =====
    IntAdd,
    IntSub,
    IntMul,
    IntFloordiv,
    IntMod,
    IntAnd,
    IntOr,
    IntXor,
    IntLshift,
    IntRshift,
    UintRshift,
    IntAddOvf,
    IntSubOvf,
    IntMulOvf,
    IntForceGeZero,

    // ===== Integer comparison =====
    IntLt,
    IntLe,
    IntEq,
    IntNe,
    IntGt,
    IntGe,
    UintLt,
    UintLe,
    UintGt,
    UintGe,
    UintFloordiv,
    IntIsZero,
    IntIsTrue,
    IntNeg,
    IntInvert,

    // ===== Pointer =====
    PtrEq,
    PtrNe,
    InstancePtrEq,
    InstancePtrNe,
    CastPtrToInt,
    CastIntToPtr,
    SameAs,

    // ===== Float arithmetic =====
    FloatAdd,
    FloatSub,
    FloatMul,
    FloatTruediv,
    FloatNeg,
    FloatAbs,
    FloatLt,
    FloatLe,
    FloatEq,
    FloatNe,
    FloatGt,
    FloatGe,
    CastFloatToInt,
    CastIntToFloat,
    ConvertFloatBytesToLongLong,
    ConvertLongLongBytesToFloat,

    // ===== Strings and unicode =====
    StrGetItem,
    StrSetItem,
    StrLen,
    CopyStrContent,
    UnicodeGetItem,
    UnicodeSetItem,
    UnicodeLen,
    CopyUnicodeContent,

    // ===== Heap access =====
    GetFieldGc,
    GetFieldRaw,
    GetFieldGcPure,
    GetFieldRawPure,
    SetFieldGc,
    SetFieldRaw,
    GetInteriorFieldGc,
    SetInteriorFieldGc,
    SetInteriorFieldRaw,
    ArrayLenGc,
    GetArrayItemGc,
    GetArrayItemGcPure,
    GetArrayItemRaw,
    GetArrayItemRawPure,
    SetArrayItemGc,
    SetArrayItemRaw,
    RawLoad,
    RawStore,

    // ===== Calls =====
    Call,
    CallMayForce,
    CallAssembler,
    CallReleaseGil,
    CallMallocGc,
    CondCall,
    CallMallocNursery,
    CallMallocNurseryVarsize,
    CallMallocNurseryVarsizeFrame,
    CondCallGcWb,
    CondCallGcWbArray,

    // ===== Misc =====
    ForceToken,
    ReadTimestamp,
    DebugMergePoint,
    JitDebug,
    Keepalive,
    /// Test-only: pin a box to the frame for the rest of the block.
    ForceSpill,
}

impl Op {
    pub fn is_guard(self) -> bool {
        matches!(
            self,
            Op::GuardTrue
                | Op::GuardFalse
                | Op::GuardValue
                | Op::GuardClass
                | Op::GuardNonnull
                | Op::GuardIsnull
                | Op::GuardNonnullClass
                | Op::GuardException
                | Op::GuardNoException
                | Op::GuardNotInvalidated
                | Op::GuardNotForced
                | Op::GuardOverflow
                | Op::GuardNoOverflow
        )
    }

    pub fn is_guard_overflow(self) -> bool {
        matches!(self, Op::GuardOverflow | Op::GuardNoOverflow)
    }

    pub fn is_ovf(self) -> bool {
        matches!(self, Op::IntAddOvf | Op::IntSubOvf | Op::IntMulOvf)
    }

    /// Ops that only make sense paired with the guard that follows them.
    pub fn needs_guard(self) -> bool {
        self.is_ovf()
            || matches!(self, Op::CallMayForce | Op::CallAssembler | Op::CallReleaseGil)
    }

    /// Free of observable side effects (loads included); such an op can be
    /// dropped entirely when its result is never read.
    pub fn has_no_side_effect(self) -> bool {
        if self.is_always_pure() {
            return true;
        }
        matches!(
            self,
            Op::GetFieldGc
                | Op::GetFieldRaw
                | Op::GetInteriorFieldGc
                | Op::GetArrayItemGc
                | Op::GetArrayItemRaw
                | Op::RawLoad
        )
    }

    /// Always-pure ops: value depends only on the arguments.
    pub fn is_always_pure(self) -> bool {
        matches!(
            self,
            Op::IntAdd
                | Op::IntSub
                | Op::IntMul
                | Op::IntFloordiv
                | Op::IntMod
                | Op::IntAnd
                | Op::IntOr
                | Op::IntXor
                | Op::IntLshift
                | Op::IntRshift
                | Op::UintRshift
                | Op::UintFloordiv
                | Op::IntForceGeZero
                | Op::IntLt
                | Op::IntLe
                | Op::IntEq
                | Op::IntNe
                | Op::IntGt
                | Op::IntGe
                | Op::UintLt
                | Op::UintLe
                | Op::UintGt
                | Op::UintGe
                | Op::IntIsZero
                | Op::IntIsTrue
                | Op::IntNeg
                | Op::IntInvert
                | Op::PtrEq
                | Op::PtrNe
                | Op::InstancePtrEq
                | Op::InstancePtrNe
                | Op::CastPtrToInt
                | Op::CastIntToPtr
                | Op::SameAs
                | Op::FloatAdd
                | Op::FloatSub
                | Op::FloatMul
                | Op::FloatTruediv
                | Op::FloatNeg
                | Op::FloatAbs
                | Op::FloatLt
                | Op::FloatLe
                | Op::FloatEq
                | Op::FloatNe
                | Op::FloatGt
                | Op::FloatGe
                | Op::CastFloatToInt
                | Op::CastIntToFloat
                | Op::ConvertFloatBytesToLongLong
                | Op::ConvertLongLongBytesToFloat
                | Op::StrGetItem
                | Op::StrLen
                | Op::UnicodeGetItem
                | Op::UnicodeLen
                | Op::ArrayLenGc
                | Op::GetFieldGcPure
                | Op::GetFieldRawPure
                | Op::GetArrayItemGcPure
                | Op::GetArrayItemRawPure
        )
    }
}

/// One recorded trace operation.
#[derive(Debug, Clone)]
pub struct Operation {
    pub op: Op,
    pub args: Vec<Operand>,
    pub result: Option<BoxVal>,
    pub descr: Option<Descr>,
    /// Live boxes to carry out through a guard's side exit.
    pub failargs: Option<Vec<Option<BoxVal>>>,
}

impl Operation {
    pub fn new(op: Op, args: Vec<Operand>) -> Self {
        Operation {
            op,
            args,
            result: None,
            descr: None,
            failargs: None,
        }
    }

    /// A statement-form op with no result.
    pub fn stmt(op: Op, args: Vec<Operand>) -> Self {
        Self::new(op, args)
    }

    /// An op producing `result`.
    pub fn expr(op: Op, args: Vec<Operand>, result: BoxVal) -> Self {
        let mut operation = Self::new(op, args);
        operation.result = Some(result);
        operation
    }

    pub fn with_descr(mut self, descr: Descr) -> Self {
        self.descr = Some(descr);
        self
    }

    pub fn with_failargs(mut self, failargs: Vec<Option<BoxVal>>) -> Self {
        self.failargs = Some(failargs);
        self
    }

    /// Can this op be emitted as a single expression assigned to its result?
    ///
    /// Statement-form exceptions: `INT_FORCE_GE_ZERO` and `FLOAT_ABS` need
    /// an if/else, and float-typed pure loads need a typed load statement.
    pub fn is_simple_expr(&self) -> bool {
        if !self.op.is_always_pure() {
            return false;
        }
        if matches!(self.op, Op::IntForceGeZero | Op::FloatAbs) {
            return false;
        }
        if self.result.map(|r| r.kind) == Some(Kind::Float) {
            if matches!(
                self.op,
                Op::GetFieldGcPure
                    | Op::GetFieldRawPure
                    | Op::GetArrayItemGcPure
                    | Op::GetArrayItemRawPure
            ) {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_needs_guard_classification() {
        assert!(Op::IntAddOvf.needs_guard());
        assert!(Op::CallMayForce.needs_guard());
        assert!(Op::CallReleaseGil.needs_guard());
        assert!(Op::CallAssembler.needs_guard());
        assert!(!Op::Call.needs_guard());
        assert!(!Op::IntAdd.needs_guard());
    }

    #[test]
    fn test_simple_expr_excludes_statement_forms() {
        let f = BoxVal::new(Kind::Float, 1);
        let i = BoxVal::new(Kind::Int, 2);
        assert!(!Operation::expr(Op::IntForceGeZero, vec![i.into()], i).is_simple_expr());
        assert!(!Operation::expr(Op::FloatAbs, vec![f.into()], f).is_simple_expr());
        assert!(Operation::expr(Op::IntAdd, vec![i.into(), i.into()], i).is_simple_expr());
        // Pure float loads stay statement-form; pure int loads do not.
        assert!(!Operation::expr(Op::GetFieldGcPure, vec![i.into()], f).is_simple_expr());
        assert!(Operation::expr(Op::GetFieldGcPure, vec![i.into()], i).is_simple_expr());
    }

    #[test]
    fn test_loads_have_no_side_effect() {
        assert!(Op::GetFieldGc.has_no_side_effect());
        assert!(!Op::SetFieldGc.has_no_side_effect());
        assert!(!Op::Call.has_no_side_effect());
        assert!(!Op::GuardTrue.has_no_side_effect());
    }
}
