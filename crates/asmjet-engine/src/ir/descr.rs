//! Operation descriptors.
//!
//! Descriptors carry the declarative metadata attached to an operation:
//! field and array layouts, call signatures, jump targets and guard exits.
//! The frontend creates them; the backend annotates the mutable placement
//! fields (funcid, label, guard token, fail locations) as code is placed.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::codegen::LoopTokenRef;
use crate::ir::Kind;

static NEXT_DESCR_ID: AtomicU32 = AtomicU32::new(1);

fn fresh_descr_id() -> u32 {
    NEXT_DESCR_ID.fetch_add(1, Ordering::Relaxed)
}

/// Layout of one field of a GC or raw structure.
#[derive(Debug, Clone, Copy)]
pub struct FieldDescr {
    pub offset: i32,
    pub size: i32,
    pub signed: bool,
}

/// Layout of an array type.
#[derive(Debug, Clone, Copy)]
pub struct ArrayDescr {
    pub basesize: i32,
    pub itemsize: i32,
    pub signed: bool,
    /// Offset of the length word.
    pub len_ofs: i32,
    /// Type id written into freshly allocated headers.
    pub tid: i32,
}

/// Layout of a field inside an array-of-structs item.
#[derive(Debug, Clone, Copy)]
pub struct InteriorFieldDescr {
    pub offset: i32,
    pub itemsize: i32,
    pub fieldsize: i32,
    pub signed: bool,
}

/// Result class of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallResult {
    Int,
    Ref,
    Float,
    Void,
}

/// Special-cased call targets recognized by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OopSpec {
    None,
    MathSqrt,
}

/// Signature and result metadata of a call target.
///
/// `arg_classes` is a string over `{i, r, f}`, one character per argument
/// after the callee address.
#[derive(Debug, Clone)]
pub struct CallDescr {
    pub arg_classes: String,
    pub result_type: CallResult,
    pub result_size: i32,
    pub result_signed: bool,
    pub oopspec: OopSpec,
}

impl CallDescr {
    pub fn new(arg_classes: &str, result_type: CallResult) -> Self {
        let result_size = match result_type {
            CallResult::Void => 0,
            CallResult::Float => 8,
            _ => crate::arch::WORD as i32,
        };
        CallDescr {
            arg_classes: arg_classes.to_owned(),
            result_type,
            result_size,
            result_signed: true,
            oopspec: OopSpec::None,
        }
    }

    /// Encode the dynamic-call tag: result class first, then one tag per
    /// argument, under the fixed mapping `{i, r -> i, f -> d, v -> v}`.
    pub fn dyncall_sig(&self) -> String {
        let mut sig = String::with_capacity(1 + self.arg_classes.len());
        sig.push(match self.result_type {
            CallResult::Int | CallResult::Ref => 'i',
            CallResult::Float => 'd',
            CallResult::Void => 'v',
        });
        for c in self.arg_classes.chars() {
            sig.push(match c {
                'i' | 'r' => 'i',
                'f' => 'd',
                other => panic!("bad arg class {:?}", other),
            });
        }
        sig
    }
}

/// Label descriptor: names a block entry point. Acquires its `(funcid,
/// label)` pair when its owning block is placed in a loop token.
pub struct TargetToken {
    raw_id: u32,
    funcid: Cell<u32>,
    label: Cell<u32>,
    assigned: Cell<bool>,
}

impl TargetToken {
    pub fn new() -> Rc<Self> {
        Rc::new(TargetToken {
            raw_id: fresh_descr_id(),
            funcid: Cell::new(0),
            label: Cell::new(0),
            assigned: Cell::new(false),
        })
    }

    pub fn raw_id(&self) -> u32 {
        self.raw_id
    }

    pub fn assign(&self, funcid: u32, label: u32) {
        self.funcid.set(funcid);
        self.label.set(label);
        self.assigned.set(true);
    }

    pub fn funcid(&self) -> u32 {
        debug_assert!(self.assigned.get(), "target token not placed yet");
        self.funcid.get()
    }

    pub fn label(&self) -> u32 {
        debug_assert!(self.assigned.get(), "target token not placed yet");
        self.label.get()
    }
}

/// Guard descriptor: the handle through which a side exit is reported and
/// later patched with a bridge.
///
/// The `gtoken` is the address of a 32-bit cell in the owning loop token's
/// data block; it stays 0 until a bridge is attached, and then holds the
/// label of the bridge's first block. It is the sole mutable patch point.
pub struct FailDescr {
    raw_id: u32,
    funcid: Cell<u32>,
    gtoken_addr: Cell<u32>,
    failkinds: RefCell<Vec<Kind>>,
    faillocs: RefCell<Vec<i32>>,
    /// GC map covering the faillocs as spilled (forced spills included).
    gcmap: Cell<u32>,
    /// GC map assuming no forced spills, used on the bridge re-entry path.
    gcmap0: Cell<u32>,
    hasexc: Cell<bool>,
}

impl FailDescr {
    pub fn new() -> Rc<Self> {
        Rc::new(FailDescr {
            raw_id: fresh_descr_id(),
            funcid: Cell::new(0),
            gtoken_addr: Cell::new(0),
            failkinds: RefCell::new(Vec::new()),
            faillocs: RefCell::new(Vec::new()),
            gcmap: Cell::new(0),
            gcmap0: Cell::new(0),
            hasexc: Cell::new(false),
        })
    }

    /// Identity stored into the frame's descr slot by emitted code.
    pub fn raw_id(&self) -> u32 {
        self.raw_id
    }

    pub fn attach(&self, funcid: u32, gtoken_addr: u32) {
        self.funcid.set(funcid);
        self.gtoken_addr.set(gtoken_addr);
    }

    pub fn funcid(&self) -> u32 {
        self.funcid.get()
    }

    pub fn gtoken_addr(&self) -> u32 {
        self.gtoken_addr.get()
    }

    pub fn set_fail_layout(&self, kinds: Vec<Kind>, locs: Vec<i32>, hasexc: bool) {
        *self.failkinds.borrow_mut() = kinds;
        *self.faillocs.borrow_mut() = locs;
        self.hasexc.set(hasexc);
    }

    pub fn failkinds(&self) -> Vec<Kind> {
        self.failkinds.borrow().clone()
    }

    pub fn faillocs(&self) -> Vec<i32> {
        self.faillocs.borrow().clone()
    }

    pub fn hasexc(&self) -> bool {
        self.hasexc.get()
    }

    pub fn set_gcmaps(&self, gcmap: u32, gcmap0: u32) {
        self.gcmap.set(gcmap);
        self.gcmap0.set(gcmap0);
    }

    pub fn gcmap(&self) -> u32 {
        self.gcmap.get()
    }

    pub fn gcmap0(&self) -> u32 {
        self.gcmap0.get()
    }
}

/// Descriptor for `CALL_ASSEMBLER`: the target loop plus the helper used
/// when the callee frame does not finish with the expected sentinel.
pub struct AssemblerLoopDescr {
    pub token: LoopTokenRef,
    pub assembler_helper_addr: u32,
    /// Offset of the vable token field in the virtualizable, if any.
    pub vable_field_offset: Option<i32>,
}

/// The descriptor attached to an operation.
#[derive(Clone)]
pub enum Descr {
    Field(Rc<FieldDescr>),
    Array(Rc<ArrayDescr>),
    InteriorField(Rc<InteriorFieldDescr>),
    Call(Rc<CallDescr>),
    Target(Rc<TargetToken>),
    Fail(Rc<FailDescr>),
    AssemblerLoop(Rc<AssemblerLoopDescr>),
}

impl Descr {
    pub fn as_field(&self) -> &FieldDescr {
        match self {
            Descr::Field(d) => d,
            _ => panic!("expected a field descr"),
        }
    }

    pub fn as_array(&self) -> &ArrayDescr {
        match self {
            Descr::Array(d) => d,
            _ => panic!("expected an array descr"),
        }
    }

    pub fn as_interior(&self) -> &InteriorFieldDescr {
        match self {
            Descr::InteriorField(d) => d,
            _ => panic!("expected an interior-field descr"),
        }
    }

    pub fn as_call(&self) -> &CallDescr {
        match self {
            Descr::Call(d) => d,
            _ => panic!("expected a call descr"),
        }
    }

    pub fn as_target(&self) -> &Rc<TargetToken> {
        match self {
            Descr::Target(d) => d,
            _ => panic!("expected a target token"),
        }
    }

    pub fn as_fail(&self) -> &Rc<FailDescr> {
        match self {
            Descr::Fail(d) => d,
            _ => panic!("expected a fail descr"),
        }
    }

    pub fn as_assembler_loop(&self) -> &Rc<AssemblerLoopDescr> {
        match self {
            Descr::AssemblerLoop(d) => d,
            _ => panic!("expected a call-assembler descr"),
        }
    }
}

impl std::fmt::Debug for Descr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Descr::Field(d) => write!(f, "Field({:?})", d),
            Descr::Array(d) => write!(f, "Array({:?})", d),
            Descr::InteriorField(d) => write!(f, "InteriorField({:?})", d),
            Descr::Call(d) => write!(f, "Call({:?})", d),
            Descr::Target(d) => write!(f, "Target(#{})", d.raw_id),
            Descr::Fail(d) => write!(f, "Fail(#{})", d.raw_id),
            Descr::AssemblerLoop(_) => write!(f, "AssemblerLoop"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dyncall_sig_mapping() {
        let d = CallDescr::new("irf", CallResult::Ref);
        assert_eq!(d.dyncall_sig(), "iiid");
        let d = CallDescr::new("", CallResult::Void);
        assert_eq!(d.dyncall_sig(), "v");
        let d = CallDescr::new("ff", CallResult::Float);
        assert_eq!(d.dyncall_sig(), "ddd");
    }

    #[test]
    fn test_fail_descr_starts_unbridged() {
        let d = FailDescr::new();
        assert_eq!(d.gtoken_addr(), 0);
        assert_ne!(d.raw_id(), 0);
    }

    #[test]
    fn test_descr_ids_are_unique() {
        assert_ne!(FailDescr::new().raw_id(), FailDescr::new().raw_id());
    }
}
