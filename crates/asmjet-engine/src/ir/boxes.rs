//! Symbolic operands of the trace IR.
//!
//! A box is an SSA-style operand of known kind. Identity is the id: the
//! frontend never reuses an id for a different value, and two boxes holding
//! equal runtime values are still distinct operands.

use rustc_hash::FxHashMap;

use crate::ir::Operation;

/// Kind of a box or frame slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    Int,
    Ref,
    Float,
    /// Unused slot in an argument or failarg list.
    Hole,
}

/// Symbolic operand produced by the tracing frontend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BoxVal {
    pub id: u32,
    pub kind: Kind,
}

impl BoxVal {
    pub fn new(kind: Kind, id: u32) -> Self {
        BoxVal { id, kind }
    }
}

impl std::fmt::Display for BoxVal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tag = match self.kind {
            Kind::Int => 'i',
            Kind::Ref => 'p',
            Kind::Float => 'f',
            Kind::Hole => '_',
        };
        write!(f, "{}{}", tag, self.id)
    }
}

/// An argument position in an operation: a box or an inline constant.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Operand {
    Box(BoxVal),
    ConstInt(i32),
    ConstFloat(f64),
    /// Address of a GC object kept alive by the owning loop token.
    ConstPtr(u32),
}

impl Operand {
    pub fn kind(&self) -> Kind {
        match self {
            Operand::Box(b) => b.kind,
            Operand::ConstInt(_) => Kind::Int,
            Operand::ConstFloat(_) => Kind::Float,
            Operand::ConstPtr(_) => Kind::Ref,
        }
    }

    pub fn as_box(&self) -> Option<BoxVal> {
        match self {
            Operand::Box(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_const_int(&self) -> Option<i32> {
        match self {
            Operand::ConstInt(v) => Some(*v),
            _ => None,
        }
    }
}

impl From<BoxVal> for Operand {
    fn from(b: BoxVal) -> Self {
        Operand::Box(b)
    }
}

/// `(first_use, last_use)` positions of every box that is read by some
/// operation. Boxes absent from the map are never read, so the op defining
/// them can be elided when it has no side effect.
pub type Longevity = FxHashMap<BoxVal, (usize, usize)>;

/// Compute box liveness over a block's operation list. Inputs count as
/// defined before position 0; failargs count as uses at the guard position.
pub fn compute_longevity(operations: &[Operation]) -> Longevity {
    let mut longevity: Longevity = FxHashMap::default();
    for (pos, op) in operations.iter().enumerate() {
        for arg in &op.args {
            if let Operand::Box(b) = arg {
                record_use(&mut longevity, *b, pos);
            }
        }
        if let Some(failargs) = &op.failargs {
            for b in failargs.iter().flatten() {
                record_use(&mut longevity, *b, pos);
            }
        }
    }
    longevity
}

fn record_use(longevity: &mut Longevity, b: BoxVal, pos: usize) {
    longevity
        .entry(b)
        .and_modify(|(_, last)| *last = pos)
        .or_insert((pos, pos));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Op, Operation};

    #[test]
    fn test_box_identity_is_id() {
        let a = BoxVal::new(Kind::Int, 1);
        let b = BoxVal::new(Kind::Int, 2);
        assert_ne!(a, b);
        assert_eq!(a, BoxVal::new(Kind::Int, 1));
    }

    #[test]
    fn test_longevity_tracks_first_and_last_use() {
        let i0 = BoxVal::new(Kind::Int, 0);
        let i1 = BoxVal::new(Kind::Int, 1);
        let ops = vec![
            Operation::expr(Op::IntAdd, vec![i0.into(), Operand::ConstInt(1)], i1),
            Operation::expr(Op::IntAdd, vec![i1.into(), i0.into()], BoxVal::new(Kind::Int, 2)),
        ];
        let longevity = compute_longevity(&ops);
        assert_eq!(longevity[&i0], (0, 1));
        assert_eq!(longevity[&i1], (1, 1));
        // The final result is never read.
        assert!(!longevity.contains_key(&BoxVal::new(Kind::Int, 2)));
    }

    #[test]
    fn test_longevity_counts_failargs() {
        let i0 = BoxVal::new(Kind::Int, 0);
        let mut guard = Operation::stmt(Op::GuardTrue, vec![i0.into()]);
        guard.failargs = Some(vec![Some(i0)]);
        let longevity = compute_longevity(&[guard]);
        assert_eq!(longevity[&i0], (0, 0));
    }
}
