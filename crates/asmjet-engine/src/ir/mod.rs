//! Trace IR: boxes, operations and descriptors.

mod boxes;
mod descr;
mod ops;

pub use boxes::{compute_longevity, BoxVal, Kind, Longevity, Operand};
pub use descr::{
    ArrayDescr, AssemblerLoopDescr, CallDescr, CallResult, Descr, FailDescr, FieldDescr,
    InteriorFieldDescr, OopSpec, TargetToken,
};
pub use ops::{Op, Operation};
