//! Incremental source builder for the target dialect.
//!
//! Owns the statement buffer, the two variable pools, and the fragment
//! mechanism. A fragment is an immutable slab of already-rendered text plus
//! the variable high-water marks at capture time; replaying fragments and
//! splicing fresh guard-dispatch code between them is what makes bridge
//! reassembly cheap.
//!
//! Scoped constructs are opened and closed explicitly; the scope stack only
//! checks pairing. A fragment may legally capture mid-scope (guard bodies
//! do), so `capture_fragment` leaves the scope stack untouched.

use std::rc::Rc;

use crate::codegen::value::{HeapType, Value};

/// One pool of numbered variables of a single kind.
struct VarPool {
    high_water: u32,
    free: Vec<u32>,
}

impl VarPool {
    fn new() -> Self {
        VarPool {
            high_water: 0,
            free: Vec::new(),
        }
    }

    fn allocate(&mut self) -> u32 {
        if let Some(n) = self.free.pop() {
            return n;
        }
        let n = self.high_water;
        self.high_water += 1;
        n
    }

    /// Positional allocation: slot `n` maps to variable `n`. Used for input
    /// arguments and guard failarg shuffles, where the variable for slot k
    /// must be the same in every piece of code touching the block.
    fn allocate_at(&mut self, n: u32) -> u32 {
        if n < self.high_water {
            self.free.retain(|&v| v != n);
        } else {
            while self.high_water < n {
                let skipped = self.high_water;
                self.free.push(skipped);
                self.high_water += 1;
            }
            self.high_water = n + 1;
        }
        n
    }

    fn free_var(&mut self, n: u32) {
        debug_assert!(n < self.high_water);
        debug_assert!(!self.free.contains(&n), "double free of variable {}", n);
        self.free.push(n);
    }

    /// Raise the high-water mark to cover a replayed fragment. Names below
    /// the mark may be live inside the fragment, so they leave the pool.
    fn absorb(&mut self, hwm: u32) {
        if hwm > self.high_water {
            self.high_water = hwm;
        }
        self.free.retain(|&v| v >= hwm);
    }
}

/// Captured slab of rendered source.
#[derive(Clone)]
pub struct Fragment {
    code: Rc<str>,
    int_hwm: u32,
    dbl_hwm: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scope {
    If,
    Else,
    While,
    Switch,
    Case,
}

/// Builder accumulating one function's worth of statements.
pub struct JsBuilder {
    debug: bool,
    out: String,
    scopes: Vec<Scope>,
    ints: VarPool,
    dbls: VarPool,
}

impl JsBuilder {
    pub fn new(debug: bool) -> Self {
        JsBuilder {
            debug,
            out: String::new(),
            scopes: Vec::new(),
            ints: VarPool::new(),
            dbls: VarPool::new(),
        }
    }

    // ----- variables -----

    pub fn allocate_intvar(&mut self) -> Value {
        Value::IntVar(self.ints.allocate())
    }

    pub fn allocate_intvar_at(&mut self, n: u32) -> Value {
        Value::IntVar(self.ints.allocate_at(n))
    }

    pub fn allocate_doublevar(&mut self) -> Value {
        Value::DoubleVar(self.dbls.allocate())
    }

    pub fn allocate_doublevar_at(&mut self, n: u32) -> Value {
        Value::DoubleVar(self.dbls.allocate_at(n))
    }

    pub fn free_var(&mut self, var: &Value) {
        match var {
            Value::IntVar(n) => self.ints.free_var(*n),
            Value::DoubleVar(n) => self.dbls.free_var(*n),
            Value::Frame => {}
            other => panic!("cannot free non-variable {:?}", other),
        }
    }

    // ----- statements -----

    pub fn emit_assignment(&mut self, target: &Value, expr: &Value) {
        debug_assert!(target.is_variable());
        target.render(&mut self.out);
        self.out.push_str(" = ");
        expr.render(&mut self.out);
        self.out.push_str(";\n");
    }

    pub fn emit_expr(&mut self, expr: &Value) {
        expr.render(&mut self.out);
        self.out.push_str(";\n");
    }

    pub fn emit_load(&mut self, target: &Value, addr: Value, ty: HeapType) {
        let data = crate::codegen::value::heap_data(ty, addr);
        self.emit_assignment(target, &data);
    }

    pub fn emit_store(&mut self, value: &Value, addr: &Value, ty: HeapType) {
        use std::fmt::Write;
        let _ = write!(self.out, "{}[(", ty.view());
        addr.render(&mut self.out);
        let _ = write!(self.out, ") >> {}] = ", ty.shift());
        value.render(&mut self.out);
        self.out.push_str(";\n");
    }

    pub fn emit_comment(&mut self, text: &str) {
        if self.debug {
            self.out.push_str("// ");
            self.out.push_str(text);
            self.out.push('\n');
        }
    }

    pub fn emit_continue_loop(&mut self) {
        self.out.push_str("continue;\n");
    }

    /// Leave the jitted function, handing the frame back to the runner.
    pub fn emit_exit(&mut self) {
        self.out.push_str("return frame|0;\n");
    }

    // ----- scoped constructs -----

    pub fn begin_if(&mut self, cond: &Value) {
        self.out.push_str("if (");
        cond.render(&mut self.out);
        self.out.push_str(") {\n");
        self.scopes.push(Scope::If);
    }

    /// Open the else branch of the if that was just closed.
    pub fn begin_else(&mut self) {
        self.out.push_str("else {\n");
        self.scopes.push(Scope::Else);
    }

    pub fn begin_while(&mut self, cond: &Value) {
        self.out.push_str("while (");
        cond.render(&mut self.out);
        self.out.push_str(") {\n");
        self.scopes.push(Scope::While);
    }

    pub fn begin_switch(&mut self, selector: &Value) {
        self.out.push_str("switch (");
        selector.render(&mut self.out);
        self.out.push_str("|0) {\n");
        self.scopes.push(Scope::Switch);
    }

    pub fn begin_case(&mut self, value: &Value) {
        self.out.push_str("case ");
        value.render(&mut self.out);
        self.out.push_str(":\n");
        self.scopes.push(Scope::Case);
    }

    pub fn begin_default(&mut self) {
        self.out.push_str("default:\n");
        self.scopes.push(Scope::Case);
    }

    /// Close the innermost if/else/while/switch.
    pub fn end_block(&mut self) {
        let scope = self.scopes.pop().expect("unbalanced end_block");
        debug_assert_ne!(scope, Scope::Case, "cases close with end_case");
        self.out.push_str("}\n");
    }

    /// Close a case with the `break` that keeps fall-through out.
    pub fn end_case(&mut self) {
        let scope = self.scopes.pop().expect("unbalanced end_case");
        debug_assert_eq!(scope, Scope::Case);
        self.out.push_str("break;\n");
    }

    // ----- fragments -----

    /// Freeze everything buffered since the last capture. The scope stack is
    /// deliberately untouched: guard bodies capture inside an open `if`.
    pub fn capture_fragment(&mut self) -> Fragment {
        Fragment {
            code: Rc::from(std::mem::take(&mut self.out).as_str()),
            int_hwm: self.ints.high_water,
            dbl_hwm: self.dbls.high_water,
        }
    }

    /// Replay a captured fragment verbatim.
    pub fn emit_fragment(&mut self, fragment: &Fragment) {
        self.out.push_str(&fragment.code);
        self.ints.absorb(fragment.int_hwm);
        self.dbls.absorb(fragment.dbl_hwm);
    }

    /// Wrap the buffered statements into the final function text.
    pub fn finish(self) -> String {
        assert!(self.scopes.is_empty(), "unclosed scopes at finish");
        let mut src = String::with_capacity(self.out.len() + 256);
        src.push_str("function jitted(label, frame) {\n");
        src.push_str("label = label|0;\n");
        src.push_str("frame = frame|0;\n");
        if self.ints.high_water > 0 {
            src.push_str("var ");
            for n in 0..self.ints.high_water {
                if n > 0 {
                    src.push_str(", ");
                }
                src.push_str(&format!("i{} = 0", n));
            }
            src.push_str(";\n");
        }
        if self.dbls.high_water > 0 {
            src.push_str("var ");
            for n in 0..self.dbls.high_water {
                if n > 0 {
                    src.push_str(", ");
                }
                src.push_str(&format!("d{} = 0.0", n));
            }
            src.push_str(";\n");
        }
        src.push_str(&self.out);
        src.push_str("return frame|0;\n}\n");
        src
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::value::{self, Value};

    #[test]
    fn test_pool_recycles_freed_names() {
        let mut bldr = JsBuilder::new(false);
        let a = bldr.allocate_intvar();
        let b = bldr.allocate_intvar();
        assert_eq!(a.to_string(), "i0");
        assert_eq!(b.to_string(), "i1");
        bldr.free_var(&a);
        assert_eq!(bldr.allocate_intvar().to_string(), "i0");
        assert_eq!(bldr.allocate_intvar().to_string(), "i2");
    }

    #[test]
    fn test_positional_allocation() {
        let mut bldr = JsBuilder::new(false);
        assert_eq!(bldr.allocate_intvar_at(0).to_string(), "i0");
        assert_eq!(bldr.allocate_doublevar_at(0).to_string(), "d0");
        // Re-requesting a positional slot is idempotent.
        assert_eq!(bldr.allocate_intvar_at(0).to_string(), "i0");
        // A later fresh allocation does not collide with the positions.
        assert_eq!(bldr.allocate_intvar().to_string(), "i1");
    }

    #[test]
    fn test_scoped_blocks_render() {
        let mut bldr = JsBuilder::new(false);
        let cond = value::less_than(Value::IntVar(0), Value::ConstInt(10));
        bldr.begin_if(&cond);
        bldr.emit_continue_loop();
        bldr.end_block();
        bldr.begin_else();
        bldr.emit_exit();
        bldr.end_block();
        let src = bldr.finish();
        assert!(src.contains("if ((i0 < 10)) {\ncontinue;\n}\nelse {\nreturn frame|0;\n}\n"));
    }

    #[test]
    fn test_switch_cases_break() {
        let mut bldr = JsBuilder::new(false);
        bldr.begin_switch(&Value::Label);
        bldr.begin_case(&Value::ConstInt(0));
        bldr.emit_exit();
        bldr.end_case();
        bldr.begin_default();
        bldr.emit_exit();
        bldr.end_case();
        bldr.end_block();
        let src = bldr.finish();
        assert!(src.contains("switch (label|0) {\ncase 0:\nreturn frame|0;\nbreak;\ndefault:\nreturn frame|0;\nbreak;\n}\n"));
    }

    #[test]
    fn test_fragment_replay_and_var_highwater() {
        let mut bldr = JsBuilder::new(false);
        let v = bldr.allocate_intvar();
        bldr.emit_assignment(&v, &Value::ConstInt(1));
        let frag = bldr.capture_fragment();
        bldr.free_var(&v);

        let mut replay = JsBuilder::new(false);
        replay.emit_fragment(&frag);
        // The replayed fragment owns i0; fresh temps must not collide.
        assert_eq!(replay.allocate_intvar().to_string(), "i1");
        let src = replay.finish();
        assert!(src.contains("i0 = 1;\n"));
        assert!(src.contains("var i0 = 0, i1 = 0;"));
    }

    #[test]
    fn test_capture_mid_scope_keeps_scopes() {
        let mut bldr = JsBuilder::new(false);
        bldr.begin_if(&Value::IntVar(0));
        let first = bldr.capture_fragment();
        bldr.end_block();
        let second = bldr.capture_fragment();
        assert!(first.code.contains("if (i0) {"));
        assert_eq!(&*second.code, "}\n");
    }

    #[test]
    fn test_comments_follow_debug_flag() {
        let mut quiet = JsBuilder::new(false);
        quiet.emit_comment("hidden");
        assert!(!quiet.finish().contains("hidden"));
        let mut loud = JsBuilder::new(true);
        loud.emit_comment("visible");
        assert!(loud.finish().contains("// visible"));
    }

    #[test]
    fn test_store_renders_view_and_shift() {
        let mut bldr = JsBuilder::new(false);
        bldr.emit_store(&Value::ConstInt(7), &Value::IntVar(0), HeapType::Int32);
        bldr.emit_store(&Value::DoubleVar(0), &Value::IntVar(1), HeapType::Float64);
        let src = bldr.finish();
        assert!(src.contains("HEAP32[(i0) >> 2] = 7;\n"));
        assert!(src.contains("HEAPF64[(i1) >> 3] = d0;\n"));
    }
}
