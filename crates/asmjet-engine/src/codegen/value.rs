//! Typed value expressions and their rendering into the target dialect.
//!
//! A [`Value`] is a small expression tree: constants, the two variable
//! pools, typed heap loads, arithmetic, calls and casts. Rendering is fully
//! parenthesized; type annotations (`|0`, `>>>0`, `+`) come from explicit
//! cast nodes, exactly where the emitters ask for them.

use crate::arch::WORD;
use crate::host::FrameLayout;
use crate::ir::{BoxVal, Kind};

/// Typed view into the linear heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeapType {
    Int8,
    UInt8,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Float32,
    Float64,
}

impl HeapType {
    pub fn size(self) -> i32 {
        match self {
            HeapType::Int8 | HeapType::UInt8 => 1,
            HeapType::Int16 | HeapType::UInt16 => 2,
            HeapType::Int32 | HeapType::UInt32 | HeapType::Float32 => 4,
            HeapType::Float64 => 8,
        }
    }

    pub fn signed(self) -> bool {
        matches!(
            self,
            HeapType::Int8 | HeapType::Int16 | HeapType::Int32 | HeapType::Float32 | HeapType::Float64
        )
    }

    pub fn is_float(self) -> bool {
        matches!(self, HeapType::Float32 | HeapType::Float64)
    }

    /// Name of the heap view indexing this type.
    pub fn view(self) -> &'static str {
        match self {
            HeapType::Int8 => "HEAP8",
            HeapType::UInt8 => "HEAPU8",
            HeapType::Int16 => "HEAP16",
            HeapType::UInt16 => "HEAPU16",
            HeapType::Int32 => "HEAP32",
            HeapType::UInt32 => "HEAPU32",
            HeapType::Float32 => "HEAPF32",
            HeapType::Float64 => "HEAPF64",
        }
    }

    /// Address shift of the view (log2 of the element size).
    pub fn shift(self) -> u32 {
        match self.size() {
            1 => 0,
            2 => 1,
            4 => 2,
            _ => 3,
        }
    }

    /// The dialect has no 64-bit integer type; an 8-byte slot can only be
    /// a double.
    pub fn from_size_and_sign(size: i32, signed: bool) -> Self {
        match (size, signed) {
            (1, true) => HeapType::Int8,
            (1, false) => HeapType::UInt8,
            (2, true) => HeapType::Int16,
            (2, false) => HeapType::UInt16,
            (4, true) => HeapType::Int32,
            (4, false) => HeapType::UInt32,
            (8, _) => HeapType::Float64,
            _ => panic!("no heap type of size {}", size),
        }
    }

    pub fn from_kind(kind: Kind) -> Self {
        match kind {
            Kind::Int | Kind::Ref => HeapType::Int32,
            Kind::Float => HeapType::Float64,
            Kind::Hole => panic!("hole has no heap type"),
        }
    }

    pub fn from_box(b: BoxVal) -> Self {
        Self::from_kind(b.kind)
    }
}

/// Binary operators of the dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    /// Double multiply; integer multiply goes through [`BinOp::IMul`].
    Mul,
    IMul,
    Div,
    Mod,
    And,
    Or,
    Xor,
    Shl,
    Shr,
    Ushr,
    Lt,
    Le,
    Eq,
    Ne,
    Gt,
    Ge,
}

impl BinOp {
    fn token(self) -> &'static str {
        match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::IMul => unreachable!("imul renders as a call"),
            BinOp::Div => "/",
            BinOp::Mod => "%",
            BinOp::And => "&",
            BinOp::Or => "|",
            BinOp::Xor => "^",
            BinOp::Shl => "<<",
            BinOp::Shr => ">>",
            BinOp::Ushr => ">>>",
            BinOp::Lt => "<",
            BinOp::Le => "<=",
            BinOp::Eq => "==",
            BinOp::Ne => "!=",
            BinOp::Gt => ">",
            BinOp::Ge => ">=",
        }
    }
}

/// Unary operators and casts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnOp {
    /// Logical not; yields 0 or 1.
    Not,
    Minus,
    BitNot,
    /// `(e|0)`: reinterpret as signed int.
    SignedCast,
    /// `(e>>>0)`: reinterpret as unsigned int.
    UnsignedCast,
    /// `(+e)`: to double.
    DoubleCast,
    /// `(e|0)`: annotate an int-valued expression.
    IntCast,
    /// `(e&255)`.
    UnsignedCharCast,
    /// `(~~e)`: truncate a double to int.
    TruncToInt,
    /// Host helper extracting the type id of a class pointer.
    ClassPtrTypeID,
}

/// A value expression.
#[derive(Debug, Clone)]
pub enum Value {
    ConstInt(i32),
    ConstFloat(f64),
    /// Address of a GC object; kept alive by the owning loop token.
    ConstPtr(u32),
    IntVar(u32),
    DoubleVar(u32),
    /// The jit frame pointer parameter.
    Frame,
    /// The block-dispatch parameter.
    Label,
    HeapData(HeapType, Box<Value>),
    Binary(BinOp, Box<Value>, Box<Value>),
    Unary(UnOp, Box<Value>),
    /// Direct call to a host library function.
    CallFunc(&'static str, Vec<Value>),
    /// Indirect call through the dynamic-call table, tagged with its sig.
    DynCallFunc(String, Box<Value>, Vec<Value>),
}

pub const ZERO: Value = Value::ConstInt(0);

pub fn word() -> Value {
    Value::ConstInt(WORD as i32)
}

impl Value {
    /// Whether assignments can target this value.
    pub fn is_variable(&self) -> bool {
        matches!(
            self,
            Value::IntVar(_) | Value::DoubleVar(_) | Value::Frame | Value::Label
        )
    }

    pub fn render(&self, out: &mut String) {
        use std::fmt::Write;
        match self {
            Value::ConstInt(v) => {
                if *v < 0 {
                    let _ = write!(out, "({})", v);
                } else {
                    let _ = write!(out, "{}", v);
                }
            }
            Value::ConstFloat(v) => {
                if *v < 0.0 {
                    let _ = write!(out, "({:?})", v);
                } else {
                    let _ = write!(out, "{:?}", v);
                }
            }
            Value::ConstPtr(v) => {
                let _ = write!(out, "{}", v);
            }
            Value::IntVar(n) => {
                let _ = write!(out, "i{}", n);
            }
            Value::DoubleVar(n) => {
                let _ = write!(out, "d{}", n);
            }
            Value::Frame => out.push_str("frame"),
            Value::Label => out.push_str("label"),
            Value::HeapData(ty, addr) => {
                let (open, close) = match ty {
                    t if t.is_float() => ("(+", ")"),
                    HeapType::UInt32 => ("(", " >>> 0)"),
                    _ => ("(", "|0)"),
                };
                out.push_str(open);
                let _ = write!(out, "{}[(", ty.view());
                addr.render(out);
                let _ = write!(out, ") >> {}]", ty.shift());
                out.push_str(close);
            }
            Value::Binary(BinOp::IMul, l, r) => {
                out.push_str("(imul(");
                l.render(out);
                out.push_str(", ");
                r.render(out);
                out.push_str(")|0)");
            }
            Value::Binary(op, l, r) => {
                out.push('(');
                l.render(out);
                let _ = write!(out, " {} ", op.token());
                r.render(out);
                out.push(')');
            }
            Value::Unary(op, e) => {
                let (open, close) = match op {
                    UnOp::Not => ("(!", ")"),
                    UnOp::Minus => ("(-", ")"),
                    UnOp::BitNot => ("(~", ")"),
                    UnOp::SignedCast | UnOp::IntCast => ("(", "|0)"),
                    UnOp::UnsignedCast => ("(", " >>> 0)"),
                    UnOp::DoubleCast => ("(+", ")"),
                    UnOp::UnsignedCharCast => ("(", "&255)"),
                    UnOp::TruncToInt => ("(~~", ")"),
                    UnOp::ClassPtrTypeID => ("(jitClassPtrTypeID(", ")|0)"),
                };
                out.push_str(open);
                e.render(out);
                out.push_str(close);
            }
            Value::CallFunc(name, args) => {
                out.push_str(name);
                out.push('(');
                for (i, a) in args.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    a.render(out);
                }
                out.push(')');
            }
            Value::DynCallFunc(sig, addr, args) => {
                let _ = write!(out, "dynCall_{}(", sig);
                addr.render(out);
                for a in args {
                    out.push_str(", ");
                    a.render(out);
                }
                out.push(')');
            }
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut s = String::new();
        self.render(&mut s);
        f.write_str(&s)
    }
}

// ----- constructors -----

fn bin(op: BinOp, l: Value, r: Value) -> Value {
    Value::Binary(op, Box::new(l), Box::new(r))
}

fn un(op: UnOp, e: Value) -> Value {
    Value::Unary(op, Box::new(e))
}

/// Integer/pointer/double addition, with constant folding.
pub fn plus(l: Value, r: Value) -> Value {
    match (&l, &r) {
        (Value::ConstInt(a), Value::ConstInt(b)) => Value::ConstInt(a.wrapping_add(*b)),
        (Value::ConstInt(0), _) => r,
        (_, Value::ConstInt(0)) => l,
        _ => bin(BinOp::Add, l, r),
    }
}

pub fn minus(l: Value, r: Value) -> Value {
    match (&l, &r) {
        (Value::ConstInt(a), Value::ConstInt(b)) => Value::ConstInt(a.wrapping_sub(*b)),
        (_, Value::ConstInt(0)) => l,
        _ => bin(BinOp::Sub, l, r),
    }
}

/// Double multiply.
pub fn mul(l: Value, r: Value) -> Value {
    bin(BinOp::Mul, l, r)
}

/// Exact 32-bit integer multiply, via the stdlib `imul`.
pub fn imul(l: Value, r: Value) -> Value {
    match (&l, &r) {
        (Value::ConstInt(a), Value::ConstInt(b)) => Value::ConstInt(a.wrapping_mul(*b)),
        _ => bin(BinOp::IMul, l, r),
    }
}

pub fn div(l: Value, r: Value) -> Value {
    bin(BinOp::Div, l, r)
}

pub fn modulo(l: Value, r: Value) -> Value {
    bin(BinOp::Mod, l, r)
}

pub fn and(l: Value, r: Value) -> Value {
    bin(BinOp::And, l, r)
}

pub fn or(l: Value, r: Value) -> Value {
    bin(BinOp::Or, l, r)
}

pub fn xor(l: Value, r: Value) -> Value {
    bin(BinOp::Xor, l, r)
}

pub fn lshift(l: Value, r: Value) -> Value {
    bin(BinOp::Shl, l, r)
}

pub fn rshift(l: Value, r: Value) -> Value {
    bin(BinOp::Shr, l, r)
}

pub fn urshift(l: Value, r: Value) -> Value {
    bin(BinOp::Ushr, l, r)
}

pub fn less_than(l: Value, r: Value) -> Value {
    bin(BinOp::Lt, l, r)
}

pub fn less_than_eq(l: Value, r: Value) -> Value {
    bin(BinOp::Le, l, r)
}

pub fn equal(l: Value, r: Value) -> Value {
    bin(BinOp::Eq, l, r)
}

pub fn not_equal(l: Value, r: Value) -> Value {
    bin(BinOp::Ne, l, r)
}

pub fn greater_than(l: Value, r: Value) -> Value {
    bin(BinOp::Gt, l, r)
}

pub fn greater_than_eq(l: Value, r: Value) -> Value {
    bin(BinOp::Ge, l, r)
}

pub fn unot(e: Value) -> Value {
    un(UnOp::Not, e)
}

pub fn uminus(e: Value) -> Value {
    un(UnOp::Minus, e)
}

pub fn uneg(e: Value) -> Value {
    un(UnOp::BitNot, e)
}

pub fn signed_cast(e: Value) -> Value {
    un(UnOp::SignedCast, e)
}

pub fn unsigned_cast(e: Value) -> Value {
    un(UnOp::UnsignedCast, e)
}

pub fn double_cast(e: Value) -> Value {
    un(UnOp::DoubleCast, e)
}

pub fn int_cast(e: Value) -> Value {
    un(UnOp::IntCast, e)
}

pub fn unsigned_char_cast(e: Value) -> Value {
    un(UnOp::UnsignedCharCast, e)
}

pub fn trunc_to_int(e: Value) -> Value {
    un(UnOp::TruncToInt, e)
}

pub fn class_ptr_type_id(e: Value) -> Value {
    un(UnOp::ClassPtrTypeID, e)
}

pub fn heap_data(ty: HeapType, addr: Value) -> Value {
    Value::HeapData(ty, Box::new(addr))
}

pub fn call_func(name: &'static str, args: Vec<Value>) -> Value {
    Value::CallFunc(name, args)
}

pub fn dyn_call(sig: &str, addr: Value, args: Vec<Value>) -> Value {
    Value::DynCallFunc(sig.to_owned(), Box::new(addr), args)
}

/// Mask or sign-extend an integer call result narrower than a word.
pub fn cast_integer(e: Value, size: i32, signed: bool) -> Value {
    if size >= WORD as i32 {
        return signed_cast(e);
    }
    let bits = (WORD as i32 - size) * 8;
    if signed {
        rshift(lshift(e, Value::ConstInt(bits)), Value::ConstInt(bits))
    } else {
        and(e, Value::ConstInt((1i64 << (size * 8)) as i32 - 1))
    }
}

// ----- well-known frame addresses -----

pub fn frame_slot_addr(layout: &FrameLayout, offset: i32) -> Value {
    plus(Value::Frame, Value::ConstInt(layout.base_ofs + offset))
}

pub fn frame_descr_addr(layout: &FrameLayout) -> Value {
    frame_descr_addr_in(layout, Value::Frame)
}

pub fn frame_descr_addr_in(layout: &FrameLayout, frame: Value) -> Value {
    plus(frame, Value::ConstInt(layout.descr_ofs))
}

pub fn frame_force_descr_addr(layout: &FrameLayout) -> Value {
    plus(Value::Frame, Value::ConstInt(layout.force_descr_ofs))
}

pub fn frame_guard_exc_addr(layout: &FrameLayout) -> Value {
    plus(Value::Frame, Value::ConstInt(layout.guard_exc_ofs))
}

pub fn frame_gcmap_addr(layout: &FrameLayout) -> Value {
    plus(Value::Frame, Value::ConstInt(layout.gcmap_ofs))
}

pub fn frame_size_addr(layout: &FrameLayout) -> Value {
    plus(Value::Frame, Value::ConstInt(layout.size_ofs))
}

pub fn frame_next_call_addr(layout: &FrameLayout, frame: Value) -> Value {
    plus(frame, Value::ConstInt(layout.next_call_ofs))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_heap_load() {
        let v = heap_data(HeapType::Int32, plus(Value::Frame, Value::ConstInt(8)));
        assert_eq!(v.to_string(), "(HEAP32[((frame + 8)) >> 2]|0)");
        let d = heap_data(HeapType::Float64, Value::IntVar(2));
        assert_eq!(d.to_string(), "(+HEAPF64[(i2) >> 3])");
        let u = heap_data(HeapType::UInt8, Value::IntVar(0));
        assert_eq!(u.to_string(), "(HEAPU8[(i0) >> 0]|0)");
    }

    #[test]
    fn test_render_casts() {
        assert_eq!(signed_cast(Value::IntVar(1)).to_string(), "(i1|0)");
        assert_eq!(unsigned_cast(Value::IntVar(1)).to_string(), "(i1 >>> 0)");
        assert_eq!(double_cast(Value::IntVar(1)).to_string(), "(+i1)");
        assert_eq!(trunc_to_int(Value::DoubleVar(0)).to_string(), "(~~d0)");
        assert_eq!(unsigned_char_cast(Value::ConstInt(3)).to_string(), "(3&255)");
    }

    #[test]
    fn test_render_imul_and_dyncall() {
        let v = imul(Value::IntVar(0), Value::IntVar(1));
        assert_eq!(v.to_string(), "(imul(i0, i1)|0)");
        let c = dyn_call("iii", Value::ConstInt(64), vec![Value::IntVar(0), Value::ConstInt(7)]);
        assert_eq!(c.to_string(), "dynCall_iii(64, i0, 7)");
    }

    #[test]
    fn test_constant_folding() {
        assert!(matches!(plus(Value::ConstInt(2), Value::ConstInt(3)), Value::ConstInt(5)));
        assert!(matches!(plus(Value::IntVar(0), Value::ConstInt(0)), Value::IntVar(0)));
        assert!(matches!(
            minus(Value::ConstInt(i32::MIN), Value::ConstInt(1)),
            Value::ConstInt(i32::MAX)
        ));
        assert!(matches!(imul(Value::ConstInt(6), Value::ConstInt(7)), Value::ConstInt(42)));
    }

    #[test]
    fn test_cast_integer_narrowing() {
        let v = cast_integer(Value::IntVar(0), 1, true);
        assert_eq!(v.to_string(), "((i0 << 24) >> 24)");
        let v = cast_integer(Value::IntVar(0), 2, false);
        assert_eq!(v.to_string(), "(i0 & 65535)");
        let v = cast_integer(Value::IntVar(0), 4, true);
        assert_eq!(v.to_string(), "(i0|0)");
    }

    #[test]
    fn test_heap_type_from_size_and_sign() {
        assert_eq!(HeapType::from_size_and_sign(1, false), HeapType::UInt8);
        assert_eq!(HeapType::from_size_and_sign(4, true), HeapType::Int32);
        assert_eq!(HeapType::from_size_and_sign(8, true), HeapType::Float64);
        assert_eq!(HeapType::from_kind(Kind::Ref), HeapType::Int32);
    }

    #[test]
    fn test_negative_constants_are_parenthesized() {
        assert_eq!(Value::ConstInt(-7).to_string(), "(-7)");
        assert_eq!(Value::ConstFloat(-1.5).to_string(), "(-1.5)");
    }
}
