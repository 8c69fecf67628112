//! Block compiler: lowers one straight-line slice of a trace into source
//! fragments.
//!
//! A block is the code between two labels. During `generate` the compiler
//! walks the operation list once, dispatching each op to a statement,
//! expression or op+guard emitter, tracking box liveness and the spill
//! state of the frame. Guards split the emitted code into fragments: the
//! static text is frozen, and the guard-dispatch code between fragments is
//! re-emitted at every reassembly so it can observe the current bridge
//! label in the guard's token cell.

use rustc_hash::FxHashMap;
use std::rc::Rc;
use tracing::warn;

use crate::arch::{alloc_flag, MAX_FUNCID, MAX_LABEL, WORD};
use crate::codegen::builder::{Fragment, JsBuilder};
use crate::codegen::frame::{frame_locations, gcmap_from_kinds, kind_size, GcMapRef, NULL_GCMAP};
use crate::codegen::loop_token::LoopInner;
use crate::codegen::value::{self as js, HeapType, Value};
use crate::host::HostEnv;
use crate::ir::{
    compute_longevity, BoxVal, CallDescr, FailDescr, Kind, Longevity, OopSpec, Op, Operand,
    Operation,
};

/// Render a 32-bit heap address as a constant expression.
pub(crate) fn const_addr(addr: u32) -> Value {
    Value::ConstInt(addr as i32)
}

/// Allocate the fixed positional variables for a kind list: slot k of each
/// kind gets variable k of the matching pool. Holes get a dummy zero.
pub(crate) fn positional_vars(bldr: &mut JsBuilder, kinds: &[Kind]) -> Vec<Value> {
    let mut n_int = 0;
    let mut n_dbl = 0;
    kinds
        .iter()
        .map(|&kind| match kind {
            Kind::Hole => js::ZERO,
            Kind::Float => {
                let var = bldr.allocate_doublevar_at(n_dbl);
                n_dbl += 1;
                var
            }
            _ => {
                let var = bldr.allocate_intvar_at(n_int);
                n_int += 1;
                var
            }
        })
        .collect()
}

/// Write `(funcid << 8) | label` into the frame's next-call word.
pub(crate) fn emit_set_frame_next_call(
    bldr: &mut JsBuilder,
    env: &HostEnv,
    framevar: Value,
    funcid: Value,
    label: Value,
) {
    if let Value::ConstInt(f) = funcid {
        debug_assert!((f as u32) < MAX_FUNCID);
    }
    if let Value::ConstInt(l) = label {
        debug_assert!((l as u32) <= MAX_LABEL);
    }
    let next_call = js::or(js::lshift(funcid, Value::ConstInt(8)), label);
    let addr = js::frame_next_call_addr(&env.frame, framevar);
    bldr.emit_store(&next_call, &addr, HeapType::Int32);
}

/// Store a GC map address into a frame's gcmap slot. Storing a non-null map
/// may plant young pointers in an old frame, so a write barrier follows.
pub(crate) fn emit_store_gcmap(
    bldr: &mut JsBuilder,
    env: &HostEnv,
    gcmap_addr: u32,
    frame: Value,
    writebarrier: bool,
) {
    bldr.emit_comment(&format!("store gcmap {}", gcmap_addr));
    let addr = js::plus(frame.clone(), Value::ConstInt(env.frame.gcmap_ofs));
    bldr.emit_store(&const_addr(gcmap_addr), &addr, HeapType::Int32);
    if writebarrier && gcmap_addr != 0 {
        emit_write_barrier(bldr, env, &[frame], false);
    }
}

/// Inline write-barrier check, with card marking for arrays.
pub(crate) fn emit_write_barrier(
    bldr: &mut JsBuilder,
    env: &HostEnv,
    arguments: &[Value],
    array: bool,
) {
    let Some(wb) = env.gc.write_barrier else {
        return;
    };
    let card_marking = array && wb.jit_wb_cards_set != 0;
    if card_marking {
        assert_eq!(wb.jit_wb_cards_set_byteofs, wb.jit_wb_if_flag_byteofs);
    }
    let wbfunc = if card_marking {
        wb.array_func_addr
    } else {
        wb.func_addr
    };
    if wbfunc == 0 {
        return;
    }
    bldr.emit_comment("write barrier");
    let obj = arguments[0].clone();
    let flagaddrvar = bldr.allocate_intvar();
    bldr.emit_assignment(
        &flagaddrvar,
        &js::plus(obj.clone(), Value::ConstInt(wb.jit_wb_if_flag_byteofs)),
    );
    let flagbyte = js::heap_data(HeapType::UInt8, flagaddrvar.clone());
    let flagbytevar = bldr.allocate_intvar();
    let chk_flag = js::unsigned_char_cast(Value::ConstInt(wb.jit_wb_if_flag_singlebyte));
    let (chk_card, flag_has_cards) = if card_marking {
        let chk = js::unsigned_char_cast(Value::ConstInt(wb.jit_wb_cards_set_singlebyte));
        (chk.clone(), js::and(flagbytevar.clone(), chk))
    } else {
        (js::ZERO, js::ZERO)
    };
    let flag_needs_wb = js::and(flagbytevar.clone(), js::or(chk_flag, chk_card));
    bldr.emit_assignment(&flagbytevar, &flagbyte);
    bldr.begin_if(&flag_needs_wb);
    let call = js::dyn_call("vi", const_addr(wbfunc), vec![obj.clone()]);
    if !card_marking {
        bldr.emit_expr(&call);
    } else {
        bldr.begin_if(&js::unot(flag_has_cards.clone()));
        // The barrier call may change the flag byte; reload it.
        bldr.emit_expr(&call);
        bldr.emit_assignment(&flagbytevar, &flagbyte);
        bldr.end_block();
        bldr.begin_if(&flag_has_cards);
        // Card bytes live below the object: addr = obj + ~(index >> 3).
        let which = arguments[1].clone();
        let byte_index = js::rshift(which, Value::ConstInt(wb.jit_wb_card_page_shift));
        let byte_ofs = js::uneg(js::rshift(byte_index.clone(), Value::ConstInt(3)));
        let byte_mask = js::lshift(Value::ConstInt(1), js::and(byte_index, Value::ConstInt(7)));
        let byte_addr = bldr.allocate_intvar();
        bldr.emit_assignment(&byte_addr, &js::plus(obj.clone(), byte_ofs));
        let old_byte = js::heap_data(HeapType::UInt8, byte_addr.clone());
        bldr.emit_store(&js::or(old_byte, byte_mask), &byte_addr, HeapType::UInt8);
        bldr.free_var(&byte_addr);
        bldr.end_block();
    }
    bldr.end_block();
    bldr.free_var(&flagbytevar);
    bldr.free_var(&flagaddrvar);
}

/// Save the pending host exception around `f` and restore it afterwards,
/// parking it in the frame's guard-exception slot meanwhile.
pub(crate) fn with_preserve_exception(
    bldr: &mut JsBuilder,
    env: &HostEnv,
    f: impl FnOnce(&mut JsBuilder),
) {
    let pos_exctyp = const_addr(env.exc.pos_exception);
    let pos_excval = const_addr(env.exc.pos_exc_value);
    let var_exctyp = bldr.allocate_intvar();
    bldr.emit_assignment(&var_exctyp, &js::heap_data(HeapType::Int32, pos_exctyp.clone()));
    bldr.begin_if(&var_exctyp);
    let excval = js::heap_data(HeapType::Int32, pos_excval.clone());
    bldr.emit_store(&excval, &js::frame_guard_exc_addr(&env.frame), HeapType::Int32);
    bldr.emit_store(&js::ZERO, &pos_exctyp, HeapType::Int32);
    bldr.emit_store(&js::ZERO, &pos_excval, HeapType::Int32);
    bldr.end_block();
    f(bldr);
    bldr.begin_if(&var_exctyp);
    let parked = js::heap_data(HeapType::Int32, js::frame_guard_exc_addr(&env.frame));
    bldr.emit_store(&var_exctyp, &pos_exctyp, HeapType::Int32);
    bldr.emit_store(&parked, &pos_excval, HeapType::Int32);
    bldr.emit_store(&js::ZERO, &js::frame_guard_exc_addr(&env.frame), HeapType::Int32);
    bldr.end_block();
    bldr.free_var(&var_exctyp);
}

/// A compiled block after code generation: only what reassembly needs.
pub struct CompiledBlock {
    label: u32,
    funcid: u32,
    inputlocs: Vec<i32>,
    inputkinds: Vec<Kind>,
    initial_gcmap: GcMapRef,
    fragments: Vec<Fragment>,
    faildescrs: Vec<Rc<FailDescr>>,
}

impl CompiledBlock {
    pub fn label(&self) -> u32 {
        self.label
    }

    pub fn inputlocs(&self) -> &[i32] {
        &self.inputlocs
    }

    pub fn inputkinds(&self) -> &[Kind] {
        &self.inputkinds
    }

    pub fn initial_gcmap(&self) -> GcMapRef {
        self.initial_gcmap
    }

    pub fn faildescrs(&self) -> &[Rc<FailDescr>] {
        &self.faildescrs
    }

    /// Load this block's input args from their frame slots into the fixed
    /// positional variables.
    pub fn emit_load_arguments(&self, bldr: &mut JsBuilder, env: &HostEnv) {
        bldr.emit_comment(&format!("load input args for block {}", self.label));
        let inputvars = positional_vars(bldr, &self.inputkinds);
        for (i, &kind) in self.inputkinds.iter().enumerate() {
            if kind == Kind::Hole {
                continue;
            }
            let addr = js::frame_slot_addr(&env.frame, self.inputlocs[i]);
            bldr.emit_load(&inputvars[i], addr, HeapType::from_kind(kind));
        }
    }

    /// Replay the block body: static fragments alternating with freshly
    /// emitted guard-dispatch code.
    pub fn emit_body(&self, bldr: &mut JsBuilder, env: &HostEnv) {
        assert_eq!(self.fragments.len(), self.faildescrs.len() + 1);
        for (fragment, descr) in self.fragments.iter().zip(&self.faildescrs) {
            bldr.emit_fragment(fragment);
            self.emit_guard_body(bldr, env, descr);
        }
        bldr.emit_fragment(self.fragments.last().expect("block has no fragments"));
    }

    /// Emit the dispatch code for one guard, observing the current value of
    /// its token cell.
    fn emit_guard_body(&self, bldr: &mut JsBuilder, env: &HostEnv, descr: &FailDescr) {
        let failkinds = descr.failkinds();
        let faillocs = descr.faillocs();
        let failvars = positional_vars(bldr, &failkinds);
        let bridge_label = env.heap.read_i32(descr.gtoken_addr());
        if bridge_label != 0 {
            // Already bridged: the guard body is a local jump.
            bldr.emit_comment("jump to bridged guard");
            bldr.emit_assignment(&Value::Label, &Value::ConstInt(bridge_label));
            bldr.emit_continue_loop();
            return;
        }
        // A bridge may have been compiled while this code was executing;
        // check the token cell at runtime and re-enter the new version of
        // this function at the bridge label. The trampoline can't be used
        // here because an active exception must survive into the guard.
        let label_val = js::heap_data(HeapType::Int32, const_addr(descr.gtoken_addr()));
        bldr.begin_if(&js::not_equal(label_val.clone(), js::ZERO));
        bldr.emit_comment("invoke newly-compiled bridge");
        // Spill the failargs as input args for the bridge entry; these are
        // the zero-base locations, which can differ from faillocs when
        // forced spills raised the watermark.
        let (arglocs, _) = frame_locations(&failkinds, 0);
        for (i, &kind) in failkinds.iter().enumerate() {
            if kind == Kind::Hole {
                continue;
            }
            let addr = js::frame_slot_addr(&env.frame, arglocs[i]);
            bldr.emit_store(&failvars[i], &addr, HeapType::from_kind(kind));
        }
        emit_store_gcmap(bldr, env, descr.gcmap0(), Value::Frame, true);
        let call = js::call_func(
            "jitInvoke",
            vec![Value::ConstInt(self.funcid as i32), label_val, Value::Frame],
        );
        bldr.emit_assignment(&Value::Frame, &call);
        bldr.emit_exit();
        bldr.end_block();
        // Not bridged: bail back to the interpreter. Capture a pending
        // exception into the frame first when the guard can see one.
        if descr.hasexc() {
            let pos_exctyp = const_addr(env.exc.pos_exception);
            let pos_excval = const_addr(env.exc.pos_exc_value);
            let exctyp = js::heap_data(HeapType::Int32, pos_exctyp.clone());
            let excval = js::heap_data(HeapType::Int32, pos_excval.clone());
            bldr.begin_if(&exctyp);
            bldr.emit_store(&excval, &js::frame_guard_exc_addr(&env.frame), HeapType::Int32);
            bldr.emit_store(&js::ZERO, &pos_exctyp, HeapType::Int32);
            bldr.emit_store(&js::ZERO, &pos_excval, HeapType::Int32);
            bldr.end_block();
        }
        bldr.emit_comment(&format!("spill {} failargs", faillocs.len()));
        for (i, &kind) in failkinds.iter().enumerate() {
            if kind == Kind::Hole {
                continue;
            }
            let addr = js::frame_slot_addr(&env.frame, faillocs[i]);
            bldr.emit_store(&failvars[i], &addr, HeapType::from_kind(kind));
        }
        emit_store_gcmap(bldr, env, descr.gcmap(), Value::Frame, true);
        let descr_id = Value::ConstInt(descr.raw_id() as i32);
        bldr.emit_store(&descr_id, &js::frame_descr_addr(&env.frame), HeapType::Int32);
        emit_set_frame_next_call(bldr, env, Value::Frame, js::ZERO, js::ZERO);
        bldr.emit_exit();
    }
}

/// Transient state that lowers one block's operations into fragments.
pub(crate) struct BlockCompiler<'a> {
    clt: &'a mut LoopInner,
    label: u32,
    initial_invalidation_counter: i32,
    inputlocs: Vec<i32>,
    inputkinds: Vec<Kind>,
    initial_gcmap: GcMapRef,
    bldr: JsBuilder,
    inputargs: Vec<Option<BoxVal>>,
    operations: Vec<Operation>,
    longevity: Longevity,
    spilled_frame_locations: FxHashMap<BoxVal, Vec<i32>>,
    spilled_frame_values: FxHashMap<i32, Operand>,
    spilled_frame_offset: i32,
    forced_spill_frame_offset: i32,
    box_to_val: FxHashMap<BoxVal, Value>,
    pos: usize,
    fragments: Vec<Fragment>,
    faildescrs: Vec<Rc<FailDescr>>,
}

impl<'a> BlockCompiler<'a> {
    pub(crate) fn new(
        clt: &'a mut LoopInner,
        label: u32,
        mut operations: Vec<Operation>,
        inputargs: Vec<Option<BoxVal>>,
        outtoken: Option<crate::ir::Descr>,
        outputargs: Vec<Operand>,
    ) -> Self {
        // Lay the input args out at the base of the frame and note which
        // slots hold refs, for the entry GC map.
        let mut inputlocs = vec![-1; inputargs.len()];
        let mut inputkinds = vec![Kind::Hole; inputargs.len()];
        let mut reflocs = Vec::new();
        let mut offset = 0i32;
        for (i, arg) in inputargs.iter().enumerate() {
            let kind = arg.map_or(Kind::Hole, |b| b.kind);
            let size = kind_size(if kind == Kind::Hole { Kind::Int } else { kind });
            let misalign = offset % size;
            if misalign != 0 {
                offset += size - misalign;
            }
            inputlocs[i] = offset;
            if let Some(b) = arg {
                inputkinds[i] = b.kind;
                if b.kind == Kind::Ref {
                    reflocs.push(offset);
                }
            }
            offset += size;
        }
        clt.ensure_frame_depth(offset);

        let initial_gcmap = if reflocs.is_empty() {
            NULL_GCMAP
        } else {
            let kinds = vec![Kind::Ref; reflocs.len()];
            gcmap_from_kinds(&mut clt.data, &kinds, &reflocs)
        };

        // Every block ends in an explicit jump or return; synthesize one if
        // the trace stopped short. This keeps longevity simple.
        let last = operations.last().map(|op| op.op);
        if !matches!(last, Some(Op::Jump) | Some(Op::Finish)) {
            match outtoken {
                Some(token) => {
                    operations.push(Operation::stmt(Op::Jump, outputargs).with_descr(token))
                }
                None => operations.push(Operation::stmt(Op::Finish, Vec::new())),
            }
        }

        let longevity = compute_longevity(&operations);
        let initial_invalidation_counter = clt.env.heap.read_i32(clt.invalidation_addr);
        let bldr = JsBuilder::new(clt.debug);
        BlockCompiler {
            clt,
            label,
            initial_invalidation_counter,
            inputlocs,
            inputkinds,
            initial_gcmap,
            bldr,
            inputargs,
            operations,
            longevity,
            spilled_frame_locations: FxHashMap::default(),
            spilled_frame_values: FxHashMap::default(),
            spilled_frame_offset: 0,
            forced_spill_frame_offset: 0,
            box_to_val: FxHashMap::default(),
            pos: 0,
            fragments: Vec::new(),
            faildescrs: Vec::new(),
        }
    }

    /// Walk the operation list, emitting code for each op, and freeze the
    /// result into a [`CompiledBlock`].
    pub(crate) fn generate(mut self) -> CompiledBlock {
        let inputvars = positional_vars(&mut self.bldr, &self.inputkinds);
        let inputargs = self.inputargs.clone();
        for (arg, var) in inputargs.into_iter().zip(inputvars) {
            if let Some(b) = arg {
                self.box_to_val.insert(b, var);
            }
        }

        while self.pos < self.operations.len() {
            let op = self.operations[self.pos].clone();
            let mut step = 1;
            if op.op == Op::ForceSpill {
                self.genop_force_spill(&op);
            } else if op.op.has_no_side_effect()
                && op.result.is_none_or(|r| !self.longevity.contains_key(&r))
            {
                self.bldr
                    .emit_comment(&format!("omitted useless op: {:?}", op.op));
            } else if op.op.needs_guard() {
                assert!(self.pos + 1 < self.operations.len(), "dangling {:?}", op.op);
                let guardop = self.operations[self.pos + 1].clone();
                assert!(guardop.op.is_guard());
                step = 2;
                self.bldr.emit_comment(&format!("begin op: {:?}", op.op));
                self.emit_withguard_op(&op, &guardop);
            } else if !op.is_simple_expr() {
                self.bldr.emit_comment(&format!("begin op: {:?}", op.op));
                self.emit_stmt_op(&op);
            } else {
                self.bldr.emit_comment(&format!("begin expr op: {:?}", op.op));
                let expr = self.emit_expr_op(&op);
                let resvar = self.result_var(&op);
                self.bldr.emit_assignment(&resvar, &expr);
            }
            for arg in op.args.clone() {
                self.maybe_free_box(&arg);
            }
            if let Some(result) = op.result {
                self.maybe_free_box(&Operand::Box(result));
            }
            self.pos += step;
        }

        let fragment = self.bldr.capture_fragment();
        self.fragments.push(fragment);

        CompiledBlock {
            label: self.label,
            funcid: self.clt.funcid,
            inputlocs: self.inputlocs,
            inputkinds: self.inputkinds,
            initial_gcmap: self.initial_gcmap,
            fragments: self.fragments,
            faildescrs: self.faildescrs,
        }
    }

    // ----- box and value plumbing -----

    fn env(&self) -> &HostEnv {
        &self.clt.env
    }

    /// The value currently bound to an operand, allocating a fresh variable
    /// for a box seen for the first time.
    fn box_val(&mut self, operand: &Operand) -> Value {
        match operand {
            Operand::Box(b) => {
                if let Some(v) = self.box_to_val.get(b) {
                    return v.clone();
                }
                let var = match b.kind {
                    Kind::Float => self.bldr.allocate_doublevar(),
                    _ => self.bldr.allocate_intvar(),
                };
                self.box_to_val.insert(*b, var.clone());
                var
            }
            Operand::ConstInt(v) => Value::ConstInt(*v),
            Operand::ConstFloat(v) => Value::ConstFloat(*v),
            Operand::ConstPtr(v) => Value::ConstPtr(*v),
        }
    }

    /// Force a box's value into a variable.
    fn realize_box(&mut self, operand: &Operand) -> Value {
        let val = self.box_val(operand);
        if val.is_variable() {
            return val;
        }
        match operand {
            Operand::Box(b) => {
                self.box_to_val.remove(b);
                let var = match b.kind {
                    Kind::Float => self.bldr.allocate_doublevar(),
                    _ => self.bldr.allocate_intvar(),
                };
                self.bldr.emit_assignment(&var, &val);
                self.box_to_val.insert(*b, var.clone());
                var
            }
            _ => val,
        }
    }

    fn result_var(&mut self, op: &Operation) -> Value {
        let result = op.result.expect("op has a result");
        self.box_val(&Operand::Box(result))
    }

    fn is_input(&self, b: BoxVal) -> bool {
        self.inputargs.iter().flatten().any(|&x| x == b)
    }

    fn is_final_use(&self, b: BoxVal, pos: usize) -> bool {
        self.longevity.get(&b).is_some_and(|&(_, last)| last == pos)
    }

    /// Release the variable of a box whose last use has passed. Input-arg
    /// variables are owned by the block's positional layout and stay put.
    fn maybe_free_box(&mut self, operand: &Operand) {
        let Some(b) = operand.as_box() else { return };
        if self.is_final_use(b, self.pos) || !self.longevity.contains_key(&b) {
            let val = self.box_to_val.remove(&b);
            if !self.is_input(b) {
                if let Some(var @ (Value::IntVar(_) | Value::DoubleVar(_))) = val {
                    self.bldr.free_var(&var);
                }
            }
        }
    }

    // ----- spill protocol -----

    fn is_spilled(&self, b: BoxVal) -> bool {
        self.spilled_frame_locations.contains_key(&b)
    }

    /// Store an operand into a frame slot, tracking it as spilled. Without
    /// an explicit offset the next naturally-aligned slot is used.
    fn spill_to_frame(&mut self, operand: &Operand, offset: Option<i32>) -> i32 {
        let kind = operand.kind();
        let size = kind_size(kind);
        let offset = offset.unwrap_or_else(|| {
            let mut o = self.spilled_frame_offset;
            let misalign = o % size;
            if misalign != 0 {
                o += size - misalign;
            }
            o
        });
        if offset + size > self.spilled_frame_offset {
            self.spilled_frame_offset = offset + size;
        }
        let addr = js::frame_slot_addr(&self.env().frame, offset);
        let val = match operand {
            Operand::Box(_) => self.realize_box(operand),
            _ => self.box_val(operand),
        };
        self.bldr.emit_store(&val, &addr, HeapType::from_kind(kind));
        if let Some(b) = operand.as_box() {
            self.spilled_frame_locations.entry(b).or_default().push(offset);
        }
        self.spilled_frame_values.insert(offset, *operand);
        offset
    }

    /// Run `f` in a spill scope: slots spilled inside are popped on exit,
    /// after recording the frame depth they reached.
    fn with_spill_scope<R>(&mut self, f: impl FnOnce(&mut Self) -> R) -> R {
        let orig_offset = self.spilled_frame_offset;
        let result = f(self);
        self.clt.ensure_frame_depth(self.spilled_frame_offset);
        let popped: Vec<i32> = self
            .spilled_frame_values
            .keys()
            .copied()
            .filter(|&p| p >= orig_offset)
            .collect();
        for p in popped {
            let operand = self.spilled_frame_values.remove(&p).unwrap();
            if let Some(b) = operand.as_box() {
                if let Some(locs) = self.spilled_frame_locations.get_mut(&b) {
                    locs.retain(|&x| x != p);
                    if locs.is_empty() {
                        self.spilled_frame_locations.remove(&b);
                    }
                }
            }
        }
        self.spilled_frame_offset = orig_offset;
        result
    }

    /// Store a GC map describing the currently spilled frame state.
    fn store_spill_gcmap(&mut self, writebarrier: bool) {
        let mut kinds = Vec::new();
        let mut locs = Vec::new();
        for (&pos, operand) in &self.spilled_frame_values {
            if operand.kind() == Kind::Ref {
                kinds.push(Kind::Ref);
                locs.push(pos);
            }
        }
        let gcmap = if kinds.is_empty() {
            NULL_GCMAP
        } else {
            gcmap_from_kinds(&mut self.clt.data, &kinds, &locs)
        };
        let env = self.env().clone();
        emit_store_gcmap(&mut self.bldr, &env, gcmap.addr, Value::Frame, writebarrier);
    }

    /// Run `f` with the frame in a GC-safe state: every live ref box is
    /// spilled and mapped, the frame sits on the shadow stack, and on exit
    /// the possibly-moved frame and refs are reloaded.
    fn with_allow_gc<R>(&mut self, exclude: &[BoxVal], f: impl FnOnce(&mut Self) -> R) -> R {
        self.with_spill_scope(|this| {
            let mut live: Vec<(BoxVal, Value)> =
                this.box_to_val.iter().map(|(b, v)| (*b, v.clone())).collect();
            live.sort_by_key(|(b, _)| b.id);
            for (b, val) in live {
                if b.kind != Kind::Ref || exclude.contains(&b) {
                    continue;
                }
                if matches!(val, Value::Frame) {
                    continue;
                }
                if this.is_final_use(b, this.pos) {
                    continue;
                }
                if !this.is_spilled(b) {
                    this.spill_to_frame(&Operand::Box(b), None);
                }
            }
            this.store_spill_gcmap(true);
            let env = this.env().clone();
            // Push the frame onto the shadow stack so the GC can find it:
            // write the frame at the stack top, then bump the top in place.
            if let Some(rst_addr) = env.gc.shadow_stack_top_addr {
                let rstaddr = const_addr(rst_addr);
                let rst = js::heap_data(HeapType::Int32, rstaddr.clone());
                this.bldr.emit_store(&Value::Frame, &rst, HeapType::Int32);
                let newrst = js::plus(rst.clone(), js::word());
                this.bldr.emit_store(&newrst, &rstaddr, HeapType::Int32);
            }

            let result = f(this);

            if let Some(rst_addr) = env.gc.shadow_stack_top_addr {
                let rstaddr = const_addr(rst_addr);
                let rst = js::heap_data(HeapType::Int32, rstaddr.clone());
                let newrst = js::minus(rst.clone(), js::word());
                this.bldr.emit_store(&newrst, &rstaddr, HeapType::Int32);
                // A moving GC may have relocated the frame; read the new
                // address back out of the stack slot.
                this.bldr
                    .emit_assignment(&Value::Frame, &js::heap_data(HeapType::Int32, rst));
            }
            // Reload spilled ref boxes; the GC may have moved them too.
            let mut spilled: Vec<(i32, Operand)> =
                this.spilled_frame_values.iter().map(|(&p, &o)| (p, o)).collect();
            spilled.sort_by_key(|&(p, _)| p);
            for (pos, operand) in spilled {
                let Some(b) = operand.as_box() else { continue };
                if b.kind != Kind::Ref || exclude.contains(&b) {
                    continue;
                }
                let target = this.box_val(&operand);
                let addr = js::frame_slot_addr(&env.frame, pos);
                this.bldr.emit_load(&target, addr, HeapType::Int32);
            }
            result
        })
    }

    /// Run a possibly-forcing call under `f`: the failargs are parked at
    /// their final frame locations and the force descr is published before
    /// the call, and a guard on the frame's descr slot follows it.
    fn with_guard_not_forced<R>(
        &mut self,
        guardop: &Operation,
        f: impl FnOnce(&mut Self) -> R,
    ) -> R {
        self.with_spill_scope(|this| {
            assert_eq!(
                this.spilled_frame_offset, this.forced_spill_frame_offset,
                "guard_not_forced must open with a clean spill area"
            );
            let env = this.env().clone();
            let descr = guardop.descr.as_ref().expect("guard has a descr").as_fail().clone();
            let descr_id = Value::ConstInt(descr.raw_id() as i32);
            this.bldr
                .emit_store(&descr_id, &js::frame_force_descr_addr(&env.frame), HeapType::Int32);
            // Park the failargs at their final locations now; forcing code
            // reads them from the frame while the call is still running.
            let failargs = guardop.failargs.clone().unwrap_or_default();
            let kinds: Vec<Kind> = failargs.iter().map(|a| a.map_or(Kind::Hole, |b| b.kind)).collect();
            let (faillocs, end) = frame_locations(&kinds, this.forced_spill_frame_offset);
            this.clt.ensure_frame_depth(end);
            for (i, arg) in failargs.iter().enumerate() {
                let Some(b) = arg else { continue };
                // Some failargs may not have a value yet (e.g. the result).
                if this.box_to_val.contains_key(b) {
                    this.spill_to_frame(&Operand::Box(*b), Some(faillocs[i]));
                }
            }
            let result = f(this);
            let forced = js::not_equal(
                js::heap_data(HeapType::Int32, js::frame_descr_addr(&env.frame)),
                js::ZERO,
            );
            this.guard_failure(forced, guardop);
            result
        })
    }

    // ----- guards -----

    fn guard_might_have_exception(op: Op) -> bool {
        matches!(op, Op::GuardException | Op::GuardNoException | Op::GuardNotForced)
    }

    /// Emit the failure path of a guard and freeze the fragment boundary.
    ///
    /// The captured fragment ends inside the `if (test) {` body; the code
    /// that actually reports the failure (or jumps to a bridge) is emitted
    /// fresh at every reassembly by `CompiledBlock::emit_guard_body`.
    fn guard_failure(&mut self, test: Value, guardop: &Operation) {
        let descr = guardop.descr.as_ref().expect("guard has a descr").as_fail().clone();
        let failargs = guardop.failargs.clone().unwrap_or_default();
        let failkinds: Vec<Kind> =
            failargs.iter().map(|a| a.map_or(Kind::Hole, |b| b.kind)).collect();
        let (faillocs, end) = frame_locations(&failkinds, self.forced_spill_frame_offset);
        self.clt.ensure_frame_depth(end);
        descr.set_fail_layout(
            failkinds.clone(),
            faillocs.clone(),
            Self::guard_might_have_exception(guardop.op),
        );
        self.bldr.begin_if(&test);
        // Move the failargs into the fixed positional variables, where the
        // reassembly-time dispatch code expects them.
        let inputvars = positional_vars(&mut self.bldr, &failkinds);
        let sources: Vec<Option<Operand>> =
            failargs.iter().map(|a| a.map(Operand::Box)).collect();
        self.assign_to_vars(&sources, &inputvars, &failkinds);
        // Two GC maps: one matching faillocs for the interpreter bail-out,
        // one assuming a clean spill area for the bridge re-entry path.
        let gcmap = gcmap_from_kinds(&mut self.clt.data, &failkinds, &faillocs);
        let gcmap0 = if self.forced_spill_frame_offset == 0 {
            gcmap
        } else {
            let (faillocs0, _) = frame_locations(&failkinds, 0);
            gcmap_from_kinds(&mut self.clt.data, &failkinds, &faillocs0)
        };
        descr.set_gcmaps(gcmap.addr, gcmap0.addr);
        let fragment = self.bldr.capture_fragment();
        self.bldr.end_block();
        self.fragments.push(fragment);
        self.faildescrs.push(descr);
    }

    /// Parallel-assign operand values into variables, going through
    /// temporaries so that swaps between live variables stay correct.
    fn assign_to_vars(&mut self, sources: &[Option<Operand>], vars: &[Value], kinds: &[Kind]) {
        assert_eq!(sources.len(), vars.len());
        let mut tempvars: Vec<Option<Value>> = vec![None; vars.len()];
        for (i, source) in sources.iter().enumerate() {
            if kinds[i] == Kind::Hole {
                continue;
            }
            let temp = match kinds[i] {
                Kind::Float => self.bldr.allocate_doublevar(),
                _ => self.bldr.allocate_intvar(),
            };
            let val = self.box_val(source.as_ref().expect("non-hole slot has a source"));
            self.bldr.emit_assignment(&temp, &val);
            tempvars[i] = Some(temp);
        }
        for (i, temp) in tempvars.into_iter().enumerate() {
            let Some(temp) = temp else { continue };
            self.bldr.emit_assignment(&vars[i], &temp);
            self.bldr.free_var(&temp);
        }
    }

    fn genop_guard_true(&mut self, op: &Operation) {
        let test = js::unot(self.box_val(&op.args[0]));
        self.guard_failure(test, op);
    }

    fn genop_guard_false(&mut self, op: &Operation) {
        let test = self.box_val(&op.args[0]);
        self.guard_failure(test, op);
    }

    fn genop_guard_nonnull(&mut self, op: &Operation) {
        let test = js::unot(self.box_val(&op.args[0]));
        self.guard_failure(test, op);
    }

    fn genop_guard_isnull(&mut self, op: &Operation) {
        let test = js::not_equal(self.box_val(&op.args[0]), js::ZERO);
        self.guard_failure(test, op);
    }

    fn genop_guard_value(&mut self, op: &Operation) {
        let test = js::not_equal(self.box_val(&op.args[0]), self.box_val(&op.args[1]));
        self.guard_failure(test, op);
    }

    /// Test that an object does *not* have the given class.
    fn expr_not_has_class(&mut self, objptr: Value, clsptr: Value) -> Value {
        match self.env().vtable_offset {
            Some(offset) => {
                let objcls =
                    js::heap_data(HeapType::Int32, js::plus(objptr, Value::ConstInt(offset)));
                js::not_equal(objcls, clsptr)
            }
            None => {
                // Without type pointers the typeid sits in the first
                // half-word of the object.
                let typeid =
                    js::and(js::heap_data(HeapType::Int32, objptr), Value::ConstInt(0xFFFF));
                js::not_equal(typeid, js::class_ptr_type_id(clsptr))
            }
        }
    }

    fn genop_guard_class(&mut self, op: &Operation) {
        let objptr = self.box_val(&op.args[0]);
        let clsptr = self.box_val(&op.args[1]);
        let test = self.expr_not_has_class(objptr, clsptr);
        self.guard_failure(test, op);
    }

    fn genop_guard_nonnull_class(&mut self, op: &Operation) {
        // Short-circuiting or, simulated with a temporary: fail when the
        // ref is null or has the wrong class.
        let objptr = self.box_val(&op.args[0]);
        let clsptr = self.box_val(&op.args[1]);
        let testvar = self.bldr.allocate_intvar();
        self.bldr.emit_assignment(&testvar, &objptr);
        self.bldr.begin_if(&testvar);
        let not_has_class = self.expr_not_has_class(objptr, clsptr);
        self.bldr.emit_assignment(&testvar, &not_has_class);
        self.bldr.end_block();
        self.bldr.begin_else();
        self.bldr.emit_assignment(&testvar, &js::unot(testvar.clone()));
        self.bldr.end_block();
        self.guard_failure(testvar.clone(), op);
        self.bldr.free_var(&testvar);
    }

    fn genop_guard_exception(&mut self, op: &Operation) {
        let env = self.env().clone();
        let pos_exctyp = const_addr(env.exc.pos_exception);
        let pos_excval = const_addr(env.exc.pos_exc_value);
        let exctyp = js::heap_data(HeapType::Int32, pos_exctyp.clone());
        let excval = js::heap_data(HeapType::Int32, pos_excval.clone());
        let test = js::not_equal(exctyp, self.box_val(&op.args[0]));
        self.guard_failure(test, op);
        if op.result.is_some() {
            let resvar = self.result_var(op);
            self.bldr.emit_assignment(&resvar, &excval);
        }
        self.bldr.emit_store(&js::ZERO, &pos_exctyp, HeapType::Int32);
        self.bldr.emit_store(&js::ZERO, &pos_excval, HeapType::Int32);
    }

    fn genop_guard_no_exception(&mut self, op: &Operation) {
        let exctyp = js::heap_data(HeapType::Int32, const_addr(self.env().exc.pos_exception));
        let test = js::not_equal(exctyp, js::ZERO);
        self.guard_failure(test, op);
    }

    fn genop_guard_not_invalidated(&mut self, op: &Operation) {
        let current = js::heap_data(HeapType::Int32, const_addr(self.clt.invalidation_addr));
        let original = Value::ConstInt(self.initial_invalidation_counter);
        let test = js::not_equal(current, original);
        self.guard_failure(test, op);
    }

    // ----- overflow arithmetic (op + guard pairs) -----

    fn ovf_guard(&mut self, did_overflow: Value, guardop: &Operation) {
        assert!(guardop.op.is_guard_overflow());
        if guardop.op == Op::GuardNoOverflow {
            self.guard_failure(did_overflow, guardop);
        } else {
            self.guard_failure(js::unot(did_overflow), guardop);
        }
    }

    /// Wrapped add; overflow iff the result moved the wrong side of rhs.
    fn genop_withguard_int_add_ovf(&mut self, op: &Operation, guardop: &Operation) {
        let lhs = self.box_val(&op.args[0]);
        let rhs = self.box_val(&op.args[1]);
        let res = self.result_var(op);
        self.bldr
            .emit_assignment(&res, &js::signed_cast(js::plus(lhs.clone(), rhs.clone())));
        let did_overflow = js::or(
            js::and(
                js::greater_than_eq(lhs.clone(), js::ZERO),
                js::less_than(res.clone(), rhs.clone()),
            ),
            js::and(js::less_than(lhs, js::ZERO), js::greater_than(res, rhs)),
        );
        self.ovf_guard(did_overflow, guardop);
    }

    fn genop_withguard_int_sub_ovf(&mut self, op: &Operation, guardop: &Operation) {
        let lhs = self.box_val(&op.args[0]);
        let rhs = self.box_val(&op.args[1]);
        let res = self.result_var(op);
        self.bldr
            .emit_assignment(&res, &js::signed_cast(js::minus(lhs.clone(), rhs.clone())));
        let did_overflow = js::or(
            js::and(
                js::greater_than_eq(rhs.clone(), js::ZERO),
                js::greater_than(res.clone(), lhs.clone()),
            ),
            js::and(js::less_than(rhs, js::ZERO), js::less_than(res, lhs)),
        );
        self.ovf_guard(did_overflow, guardop);
    }

    /// Wrapped multiply; overflow is detected by comparing against the
    /// exact product computed in double precision.
    fn genop_withguard_int_mul_ovf(&mut self, op: &Operation, guardop: &Operation) {
        assert!(guardop.op.is_guard_overflow());
        let lhs = self.box_val(&op.args[0]);
        let rhs = self.box_val(&op.args[1]);
        let res = self.result_var(op);
        self.bldr.emit_assignment(&res, &js::imul(lhs.clone(), rhs.clone()));
        let resdbl = self.bldr.allocate_doublevar();
        self.bldr
            .emit_assignment(&resdbl, &js::mul(js::double_cast(lhs), js::double_cast(rhs)));
        let test = if guardop.op == Op::GuardNoOverflow {
            js::not_equal(js::double_cast(res), resdbl.clone())
        } else {
            js::equal(js::double_cast(res), resdbl.clone())
        };
        self.guard_failure(test, guardop);
        self.bldr.free_var(&resdbl);
    }

    // ----- calls -----

    /// Indirect call with the GC allowed during it; integer results
    /// narrower than a word are masked or sign-extended.
    fn do_call(&mut self, op: &Operation, descr: &CallDescr, addr: Value, args: Vec<Value>) {
        assert_eq!(descr.arg_classes.len(), args.len());
        let sig = descr.dyncall_sig();
        let exclude: Vec<BoxVal> = op.result.into_iter().collect();
        self.with_allow_gc(&exclude, |this| {
            let mut call = js::dyn_call(&sig, addr, args);
            match op.result {
                None => this.bldr.emit_expr(&call),
                Some(_) => {
                    if matches!(descr.result_type, crate::ir::CallResult::Int)
                        && descr.result_size < WORD as i32
                    {
                        call = js::cast_integer(call, descr.result_size, descr.result_signed);
                    }
                    let resvar = this.result_var(op);
                    this.bldr.emit_assignment(&resvar, &call);
                }
            }
        });
    }

    fn genop_call(&mut self, op: &Operation) {
        let descr = op.descr.as_ref().expect("call has a descr").as_call().clone();
        assert_eq!(op.args.len(), descr.arg_classes.len() + 1);
        if descr.oopspec == OopSpec::MathSqrt {
            self.genop_math_sqrt(op);
            return;
        }
        let addr = self.box_val(&op.args[0]);
        let args: Vec<Value> = op.args[1..].iter().map(|a| self.box_val(a)).collect();
        self.do_call(op, &descr, addr, args);
    }

    fn genop_math_sqrt(&mut self, op: &Operation) {
        assert_eq!(op.args.len(), 2);
        let arg = js::double_cast(self.box_val(&op.args[1]));
        let res = self.result_var(op);
        self.bldr.emit_assignment(&res, &js::call_func("sqrt", vec![arg]));
    }

    fn genop_call_malloc_gc(&mut self, op: &Operation) {
        let descr = op.descr.as_ref().expect("call has a descr").as_call().clone();
        assert_eq!(op.args.len(), descr.arg_classes.len() + 1);
        let addr = self.box_val(&op.args[0]);
        let args: Vec<Value> = op.args[1..].iter().map(|a| self.box_val(a)).collect();
        self.do_call(op, &descr, addr, args);
        let resvar = self.result_var(op);
        self.bldr.begin_if(&js::equal(resvar, js::ZERO));
        self.propagate_exception();
        self.bldr.end_block();
    }

    fn genop_cond_call(&mut self, op: &Operation) {
        let descr = op.descr.as_ref().expect("call has a descr").as_call().clone();
        assert_eq!(op.args.len(), descr.arg_classes.len() + 2);
        let cond = self.box_val(&op.args[0]);
        let addr = self.box_val(&op.args[1]);
        let args: Vec<Value> = op.args[2..].iter().map(|a| self.box_val(a)).collect();
        self.bldr.begin_if(&cond);
        self.do_call(op, &descr, addr, args);
        self.bldr.end_block();
    }

    fn genop_withguard_call_may_force(&mut self, op: &Operation, guardop: &Operation) {
        let descr = op.descr.as_ref().expect("call has a descr").as_call().clone();
        assert_eq!(op.args.len(), descr.arg_classes.len() + 1);
        let addr = self.box_val(&op.args[0]);
        let args: Vec<Value> = op.args[1..].iter().map(|a| self.box_val(a)).collect();
        self.with_guard_not_forced(guardop, |this| {
            this.do_call(op, &descr, addr, args);
        });
    }

    /// Release the GIL, call, reacquire, all forceable and GC-safe.
    fn genop_withguard_call_release_gil(&mut self, op: &Operation, guardop: &Operation) {
        let descr = op.descr.as_ref().expect("call has a descr").as_call().clone();
        assert_eq!(op.args.len(), descr.arg_classes.len() + 1);
        let addr = self.box_val(&op.args[0]);
        let args: Vec<Value> = op.args[1..].iter().map(|a| self.box_val(a)).collect();
        let release = const_addr(self.env().addrs.release_gil);
        let reacquire = const_addr(self.env().addrs.reacquire_gil);
        self.with_guard_not_forced(guardop, |this| {
            this.with_allow_gc(&[], |this| {
                this.bldr.emit_expr(&js::dyn_call("v", release, Vec::new()));
                this.do_call(op, &descr, addr, args);
                this.bldr.emit_expr(&js::dyn_call("v", reacquire, Vec::new()));
            });
        });
    }

    /// Call another compiled loop through the execute trampoline, then
    /// either take its result off the finished frame or hand the frame to
    /// the assembler helper.
    fn genop_withguard_call_assembler(&mut self, op: &Operation, guardop: &Operation) {
        let descr = op.descr.as_ref().expect("call has a descr").as_assembler_loop().clone();
        let frame_arg = self.box_val(&op.args[0]);
        let virtref = if op.args.len() == 2 {
            self.box_val(&op.args[1])
        } else {
            js::ZERO
        };
        let env = self.env().clone();
        let exe_addr = env.addrs.execute_trampoline;
        self.with_guard_not_forced(guardop, |this| {
            let (target_funcid, entry_gcmap) = {
                let target = descr.token.borrow();
                (target.funcid(), target.entry_gcmap())
            };
            // The frame was allocated and populated upstream but carries no
            // GC map yet; the trampoline may collect, so install the
            // target's entry map.
            emit_store_gcmap(&mut this.bldr, &env, entry_gcmap.addr, frame_arg.clone(), true);
            emit_set_frame_next_call(
                &mut this.bldr,
                &env,
                frame_arg.clone(),
                Value::ConstInt(target_funcid as i32),
                js::ZERO,
            );
            let resvar = this.bldr.allocate_intvar();
            this.with_allow_gc(&[], |this| {
                let call = js::dyn_call("ii", const_addr(exe_addr), vec![frame_arg.clone()]);
                this.bldr.emit_assignment(&resvar, &call);
            });
            // Did the callee finish with the expected sentinel descr?
            let resdescr =
                js::heap_data(HeapType::Int32, js::frame_descr_addr_in(&env.frame, resvar.clone()));
            let result_kind = op.result.map(|r| r.kind);
            let dwtf = Value::ConstInt(env.done_with_this_frame(result_kind) as i32);
            this.bldr.begin_if(&js::equal(resdescr, dwtf));
            if let Some(vable_ofs) = descr.vable_field_offset {
                let fieldaddr = js::plus(virtref.clone(), Value::ConstInt(vable_ofs));
                this.bldr.emit_store(&js::ZERO, &fieldaddr, HeapType::Int32);
            }
            if let Some(result) = op.result {
                let addr = js::plus(resvar.clone(), Value::ConstInt(env.frame.base_ofs));
                let resbox = this.box_val(&Operand::Box(result));
                this.bldr.emit_load(&resbox, addr, HeapType::from_kind(result.kind));
            }
            this.bldr.end_block();
            this.bldr.begin_else();
            let callsig = match result_kind {
                None => "vii",
                Some(Kind::Float) => "dii",
                _ => "iii",
            };
            let helper = const_addr(descr.assembler_helper_addr);
            let exclude: Vec<BoxVal> = op.result.into_iter().collect();
            this.with_allow_gc(&exclude, |this| {
                let call = js::dyn_call(callsig, helper, vec![resvar.clone(), virtref.clone()]);
                match op.result {
                    None => this.bldr.emit_expr(&call),
                    Some(_) => {
                        let opres = this.result_var(op);
                        this.bldr.emit_assignment(&opres, &call);
                    }
                }
            });
            this.bldr.end_block();
            this.bldr.free_var(&resvar);
        });
    }

    // ----- exceptions -----

    fn check_and_propagate_exception(&mut self) {
        let exctyp = js::heap_data(HeapType::Int32, const_addr(self.env().exc.pos_exception));
        self.bldr.begin_if(&exctyp);
        self.propagate_exception();
        self.bldr.end_block();
    }

    /// Snapshot the pending exception into the frame, install the
    /// propagate-exception descr, and bail out.
    fn propagate_exception(&mut self) {
        let env = self.env().clone();
        self.bldr.emit_comment("propagate exception");
        let pos_exctyp = const_addr(env.exc.pos_exception);
        let pos_excval = const_addr(env.exc.pos_exc_value);
        let excval = js::heap_data(HeapType::Int32, pos_excval.clone());
        self.bldr
            .emit_store(&excval, &js::frame_guard_exc_addr(&env.frame), HeapType::Int32);
        self.bldr.emit_store(&js::ZERO, &pos_exctyp, HeapType::Int32);
        self.bldr.emit_store(&js::ZERO, &pos_excval, HeapType::Int32);
        let descr = Value::ConstInt(env.propagate_exception_descr as i32);
        self.bldr
            .emit_store(&descr, &js::frame_descr_addr(&env.frame), HeapType::Int32);
        self.store_spill_gcmap(true);
        emit_set_frame_next_call(&mut self.bldr, &env, Value::Frame, js::ZERO, js::ZERO);
        self.bldr.emit_exit();
    }

    // ----- jumps and exits -----

    /// Spill output args to their conventional frame slots.
    fn write_output_args(&mut self, outputargs: &[Operand]) -> Vec<i32> {
        let kinds: Vec<Kind> = outputargs.iter().map(|a| a.kind()).collect();
        let (locations, end) = frame_locations(&kinds, self.forced_spill_frame_offset);
        self.clt.ensure_frame_depth(end);
        self.bldr
            .emit_comment(&format!("write {} output args", outputargs.len()));
        self.with_spill_scope(|this| {
            for (i, operand) in outputargs.iter().enumerate() {
                match this.spilled_frame_values.get(&locations[i]) {
                    Some(current) => debug_assert_eq!(current, operand),
                    None => {
                        this.spill_to_frame(operand, Some(locations[i]));
                    }
                }
            }
            this.store_spill_gcmap(true);
        });
        locations
    }

    fn genop_jump(&mut self, op: &Operation) {
        let target = op.descr.as_ref().expect("jump has a descr").as_target().clone();
        let target_funcid = target.funcid();
        let target_label = target.label();
        let env = self.env().clone();
        if target_funcid != self.clt.funcid {
            // Jump into another function: pass args through the frame and
            // let the runner chain on the next-call word.
            self.bldr
                .emit_comment(&format!("jump to loop [{} {}]", target_funcid, target_label));
            self.write_output_args(&op.args);
            emit_set_frame_next_call(
                &mut self.bldr,
                &env,
                Value::Frame,
                Value::ConstInt(target_funcid as i32),
                Value::ConstInt(target_label as i32),
            );
            self.bldr.emit_exit();
        } else {
            self.bldr.emit_comment(&format!("jump local [{}]", target_label));
            let kinds: Vec<Kind> = op.args.iter().map(|a| a.kind()).collect();
            let inputvars = positional_vars(&mut self.bldr, &kinds);
            let sources: Vec<Option<Operand>> = op.args.iter().map(|a| Some(*a)).collect();
            self.assign_to_vars(&sources, &inputvars, &kinds);
            if target_label != self.label {
                self.bldr
                    .emit_assignment(&Value::Label, &Value::ConstInt(target_label as i32));
            }
            self.bldr.emit_continue_loop();
        }
    }

    fn genop_finish(&mut self, op: &Operation) {
        let env = self.env().clone();
        self.write_output_args(&op.args);
        let descr_id = match &op.descr {
            Some(d) => d.as_fail().raw_id() as i32,
            None => 0,
        };
        self.bldr.emit_store(
            &Value::ConstInt(descr_id),
            &js::frame_descr_addr(&env.frame),
            HeapType::Int32,
        );
        emit_set_frame_next_call(&mut self.bldr, &env, Value::Frame, js::ZERO, js::ZERO);
        self.bldr.emit_exit();
    }

    fn genop_force_token(&mut self, op: &Operation) {
        if let Some(result) = op.result {
            self.box_to_val.insert(result, Value::Frame);
        }
    }

    fn genop_force_spill(&mut self, op: &Operation) {
        self.spill_to_frame(&op.args[0], None);
        self.forced_spill_frame_offset = self.spilled_frame_offset;
    }

    // ----- GC allocation -----

    /// Bump-allocate from the nursery, falling into the GC slowpath when
    /// nursery_top is passed.
    fn malloc_nursery_fixed(&mut self, op: &Operation, size: &Operand) {
        let env = self.env().clone();
        let sizevar = match size {
            Operand::Box(_) => self.realize_box(size),
            _ => self.box_val(size),
        };
        let nfree_addr = const_addr(env.gc.nursery_free_addr);
        let ntop_addr = const_addr(env.gc.nursery_top_addr);
        let nfree = js::heap_data(HeapType::Int32, nfree_addr.clone());
        let ntop = js::heap_data(HeapType::Int32, ntop_addr);
        let resvar = self.result_var(op);
        self.bldr.emit_assignment(&resvar, &nfree);
        let new_nfree = self.bldr.allocate_intvar();
        self.bldr
            .emit_assignment(&new_nfree, &js::plus(resvar.clone(), sizevar.clone()));
        self.bldr.begin_if(&js::less_than_eq(new_nfree.clone(), ntop));
        self.bldr.emit_store(&new_nfree, &nfree_addr, HeapType::Int32);
        self.bldr.end_block();
        self.bldr.begin_else();
        let (sig, args) = if env.gc.passes_frame_to_malloc {
            ("iii", vec![sizevar, Value::Frame])
        } else {
            ("ii", vec![sizevar])
        };
        let mallocfn = const_addr(env.addrs.gc_malloc_nursery);
        let exclude: Vec<BoxVal> = op.result.into_iter().collect();
        self.with_allow_gc(&exclude, |this| {
            let call = js::dyn_call(sig, mallocfn, args);
            let resvar = this.result_var(op);
            this.bldr.emit_assignment(&resvar, &call);
        });
        self.check_and_propagate_exception();
        self.bldr.end_block();
        self.bldr.free_var(&new_nfree);
    }

    fn genop_call_malloc_nursery(&mut self, op: &Operation) {
        let size = op.args[0];
        let bytes = size.as_const_int().expect("fixed-size malloc takes a constant");
        assert_eq!(bytes & (WORD as i32 - 1), 0, "malloc size must be word-aligned");
        self.malloc_nursery_fixed(op, &size);
    }

    fn genop_call_malloc_nursery_varsize_frame(&mut self, op: &Operation) {
        let size = op.args[0];
        self.malloc_nursery_fixed(op, &size);
    }

    /// Variable-size nursery allocation: compute the padded total size,
    /// bump-allocate when it fits, else call the kind-specific slowpath.
    fn genop_call_malloc_nursery_varsize(&mut self, op: &Operation) {
        let env = self.env().clone();
        let arraydescr = *op.descr.as_ref().expect("varsize malloc has a descr").as_array();
        let kind_flag = op.args[0].as_const_int().expect("alloc kind is a constant");
        let itemsize = op.args[1].as_const_int().expect("itemsize is a constant");
        let lengthbox = op.args[2];
        let lengthvar = self.realize_box(&lengthbox);
        // total = header + basesize + length*itemsize, padded to a word.
        let constsize = env.gc.size_of_gc_header + arraydescr.basesize;
        let calc_totalsize = js::plus(
            Value::ConstInt(constsize),
            js::imul(lengthvar.clone(), Value::ConstInt(itemsize)),
        );
        let totalsize = self.bldr.allocate_intvar();
        self.bldr.emit_assignment(&totalsize, &calc_totalsize);
        if itemsize % WORD as i32 != 0 {
            let padsize = self.bldr.allocate_intvar();
            self.bldr
                .emit_assignment(&padsize, &js::modulo(totalsize.clone(), js::word()));
            self.bldr.begin_if(&js::not_equal(padsize.clone(), js::ZERO));
            let padded = js::plus(totalsize.clone(), js::minus(js::word(), padsize.clone()));
            self.bldr.emit_assignment(&totalsize, &padded);
            self.bldr.end_block();
            self.bldr.free_var(&padsize);
        }
        let nfree_addr = const_addr(env.gc.nursery_free_addr);
        let ntop_addr = const_addr(env.gc.nursery_top_addr);
        let nfree = js::heap_data(HeapType::Int32, nfree_addr.clone());
        let ntop = js::heap_data(HeapType::Int32, ntop_addr);
        let maxsize = Value::ConstInt(env.gc.max_size_of_young_obj - 2 * WORD as i32);
        let resvar = self.result_var(op);
        self.bldr.emit_assignment(&resvar, &nfree);
        let new_nfree = self.bldr.allocate_intvar();
        self.bldr
            .emit_assignment(&new_nfree, &js::plus(resvar.clone(), totalsize.clone()));
        let fits = js::and(
            js::less_than_eq(new_nfree.clone(), ntop),
            js::less_than(totalsize.clone(), maxsize),
        );
        self.bldr.begin_if(&fits);
        self.bldr.emit_store(&new_nfree, &nfree_addr, HeapType::Int32);
        self.bldr
            .emit_store(&Value::ConstInt(arraydescr.tid), &resvar, HeapType::Int32);
        self.bldr.end_block();
        self.bldr.begin_else();
        let (sig, mallocfn, args) = if kind_flag == alloc_flag::ARRAY {
            (
                "iiii",
                env.addrs.gc_malloc_array,
                vec![
                    Value::ConstInt(itemsize),
                    Value::ConstInt(arraydescr.tid),
                    lengthvar.clone(),
                ],
            )
        } else if kind_flag == alloc_flag::STR {
            ("ii", env.addrs.gc_malloc_str, vec![lengthvar.clone()])
        } else {
            assert_eq!(kind_flag, alloc_flag::UNICODE);
            ("ii", env.addrs.gc_malloc_unicode, vec![lengthvar.clone()])
        };
        let exclude: Vec<BoxVal> = op.result.into_iter().collect();
        self.with_allow_gc(&exclude, |this| {
            let call = js::dyn_call(sig, const_addr(mallocfn), args);
            let resvar = this.result_var(op);
            this.bldr.emit_assignment(&resvar, &call);
        });
        self.check_and_propagate_exception();
        self.bldr.end_block();
        self.bldr.free_var(&new_nfree);
        self.bldr.free_var(&totalsize);
    }

    fn genop_cond_call_gc_wb(&mut self, op: &Operation, array: bool) {
        assert!(op.result.is_none());
        let args: Vec<Value> = op.args.iter().map(|a| self.box_val(a)).collect();
        let env = self.env().clone();
        emit_write_barrier(&mut self.bldr, &env, &args, array);
    }

    // ----- strings, fields, arrays -----

    fn str_item_addr(&mut self, op: &Operation, token: crate::host::ArrayToken) -> Value {
        let base = self.box_val(&op.args[0]);
        let index = self.box_val(&op.args[1]);
        let itemofs = if token.itemsize == 1 {
            js::plus(Value::ConstInt(token.basesize), index)
        } else {
            js::plus(
                Value::ConstInt(token.basesize),
                js::imul(index, Value::ConstInt(token.itemsize)),
            )
        };
        js::plus(base, itemofs)
    }

    fn genop_expr_strgetitem(&mut self, op: &Operation) -> Value {
        let token = self.env().str_token;
        assert_eq!(token.itemsize, 1);
        let addr = self.str_item_addr(op, token);
        js::heap_data(HeapType::UInt8, addr)
    }

    fn genop_strsetitem(&mut self, op: &Operation) {
        let token = self.env().str_token;
        assert_eq!(token.itemsize, 1);
        let addr = self.str_item_addr(op, token);
        let value = self.box_val(&op.args[2]);
        self.bldr.emit_store(&value, &addr, HeapType::UInt8);
    }

    fn genop_expr_strlen(&mut self, op: &Operation) -> Value {
        let token = self.env().str_token;
        let base = self.box_val(&op.args[0]);
        js::heap_data(HeapType::Int32, js::plus(base, Value::ConstInt(token.len_ofs)))
    }

    fn genop_expr_unicodegetitem(&mut self, op: &Operation) -> Value {
        let token = self.env().unicode_token;
        let ty = HeapType::from_size_and_sign(token.itemsize, false);
        let addr = self.str_item_addr(op, token);
        js::heap_data(ty, addr)
    }

    fn genop_unicodesetitem(&mut self, op: &Operation) {
        let token = self.env().unicode_token;
        let ty = HeapType::from_size_and_sign(token.itemsize, false);
        let addr = self.str_item_addr(op, token);
        let value = self.box_val(&op.args[2]);
        self.bldr.emit_store(&value, &addr, ty);
    }

    fn genop_expr_unicodelen(&mut self, op: &Operation) -> Value {
        let token = self.env().unicode_token;
        let base = self.box_val(&op.args[0]);
        js::heap_data(HeapType::Int32, js::plus(base, Value::ConstInt(token.len_ofs)))
    }

    /// `memcpy` between two non-overlapping string-ish arrays.
    fn genop_copy_content(&mut self, op: &Operation, token: crate::host::ArrayToken) {
        let srcbase = self.box_val(&op.args[0]);
        let dstbase = self.box_val(&op.args[1]);
        let srcoffset = self.box_val(&op.args[2]);
        let dstoffset = self.box_val(&op.args[3]);
        let length = self.box_val(&op.args[4]);
        let basesize = Value::ConstInt(token.basesize);
        let itemsize = Value::ConstInt(token.itemsize);
        let srcaddr = js::plus(
            srcbase,
            js::plus(basesize.clone(), js::imul(srcoffset, itemsize.clone())),
        );
        let dstaddr = js::plus(dstbase, js::plus(basesize, js::imul(dstoffset, itemsize.clone())));
        let nbytes = js::imul(length, itemsize);
        self.bldr
            .emit_expr(&js::call_func("memcpy", vec![dstaddr, srcaddr, nbytes]));
    }

    fn field_addr_and_type(&mut self, op: &Operation) -> (Value, HeapType) {
        let field = *op.descr.as_ref().expect("field op has a descr").as_field();
        let base = self.box_val(&op.args[0]);
        let addr = js::plus(base, Value::ConstInt(field.offset));
        (addr, HeapType::from_size_and_sign(field.size, field.signed))
    }

    fn genop_getfield(&mut self, op: &Operation) {
        let (addr, ty) = self.field_addr_and_type(op);
        let resvar = self.result_var(op);
        self.bldr.emit_load(&resvar, addr, ty);
    }

    fn genop_expr_getfield_pure(&mut self, op: &Operation) -> Value {
        let (addr, ty) = self.field_addr_and_type(op);
        js::heap_data(ty, addr)
    }

    fn genop_setfield(&mut self, op: &Operation) {
        let (addr, ty) = self.field_addr_and_type(op);
        let value = self.box_val(&op.args[1]);
        self.bldr.emit_store(&value, &addr, ty);
    }

    fn interior_addr_and_type(&mut self, op: &Operation) -> (Value, HeapType) {
        let interior = *op.descr.as_ref().expect("interior op has a descr").as_interior();
        let base = self.box_val(&op.args[0]);
        let which = self.box_val(&op.args[1]);
        let addr = js::plus(
            base,
            js::plus(
                Value::ConstInt(interior.offset),
                js::imul(which, Value::ConstInt(interior.itemsize)),
            ),
        );
        (
            addr,
            HeapType::from_size_and_sign(interior.fieldsize, interior.signed),
        )
    }

    fn genop_getinteriorfield(&mut self, op: &Operation) {
        let (addr, ty) = self.interior_addr_and_type(op);
        let resvar = self.result_var(op);
        self.bldr.emit_load(&resvar, addr, ty);
    }

    fn genop_setinteriorfield(&mut self, op: &Operation) {
        let (addr, ty) = self.interior_addr_and_type(op);
        let value = self.box_val(&op.args[2]);
        self.bldr.emit_store(&value, &addr, ty);
    }

    fn genop_expr_arraylen(&mut self, op: &Operation) -> Value {
        let array = *op.descr.as_ref().expect("arraylen has a descr").as_array();
        let base = self.box_val(&op.args[0]);
        js::heap_data(HeapType::Int32, js::plus(base, Value::ConstInt(array.len_ofs)))
    }

    fn array_item_addr_and_type(&mut self, op: &Operation, scaled: bool) -> (Value, HeapType) {
        let array = *op.descr.as_ref().expect("array op has a descr").as_array();
        let base = self.box_val(&op.args[0]);
        let which = self.box_val(&op.args[1]);
        let item = if scaled {
            js::imul(which, Value::ConstInt(array.itemsize))
        } else {
            which
        };
        let addr = js::plus(base, js::plus(Value::ConstInt(array.basesize), item));
        (
            addr,
            HeapType::from_size_and_sign(array.itemsize, array.signed),
        )
    }

    fn genop_getarrayitem(&mut self, op: &Operation) {
        let (addr, ty) = self.array_item_addr_and_type(op, true);
        let resvar = self.result_var(op);
        self.bldr.emit_load(&resvar, addr, ty);
    }

    fn genop_expr_getarrayitem_pure(&mut self, op: &Operation) -> Value {
        let (addr, ty) = self.array_item_addr_and_type(op, true);
        js::heap_data(ty, addr)
    }

    fn genop_setarrayitem(&mut self, op: &Operation) {
        let (addr, ty) = self.array_item_addr_and_type(op, true);
        let value = self.box_val(&op.args[2]);
        self.bldr.emit_store(&value, &addr, ty);
    }

    /// Raw loads index by byte offset, not by element.
    fn genop_raw_load(&mut self, op: &Operation) {
        let (addr, ty) = self.array_item_addr_and_type(op, false);
        let resvar = self.result_var(op);
        self.bldr.emit_load(&resvar, addr, ty);
    }

    fn genop_raw_store(&mut self, op: &Operation) {
        let (addr, ty) = self.array_item_addr_and_type(op, false);
        let value = self.box_val(&op.args[2]);
        self.bldr.emit_store(&value, &addr, ty);
    }

    // ----- statement-form arithmetic -----

    fn genop_int_force_ge_zero(&mut self, op: &Operation) {
        let arg = self.realize_box(&op.args[0]);
        let resvar = self.result_var(op);
        self.bldr.begin_if(&js::less_than(arg.clone(), js::ZERO));
        self.bldr.emit_assignment(&resvar, &js::ZERO);
        self.bldr.end_block();
        self.bldr.begin_else();
        self.bldr.emit_assignment(&resvar, &arg);
        self.bldr.end_block();
    }

    fn genop_float_abs(&mut self, op: &Operation) {
        let arg = self.realize_box(&op.args[0]);
        let resvar = self.result_var(op);
        self.bldr
            .begin_if(&js::less_than(arg.clone(), Value::ConstFloat(0.0)));
        self.bldr.emit_assignment(&resvar, &js::uminus(arg.clone()));
        self.bldr.end_block();
        self.bldr.begin_else();
        self.bldr.emit_assignment(&resvar, &arg);
        self.bldr.end_block();
    }

    /// Timer stub: fills frame scratch via `gettimeofday` and folds the
    /// pieces into milliseconds.
    fn genop_read_timestamp(&mut self, op: &Operation) {
        warn!("read_timestamp lowers to a gettimeofday stub");
        let env = self.env().clone();
        self.clt.ensure_frame_depth(2 * WORD as i32);
        let addr = js::frame_slot_addr(&env.frame, 0);
        self.bldr.emit_expr(&js::call_func("gettimeofday", vec![addr.clone()]));
        let secs = js::heap_data(HeapType::Int32, addr);
        let micros = js::heap_data(HeapType::Int32, js::frame_slot_addr(&env.frame, WORD as i32));
        let millis = js::plus(
            js::div(micros, Value::ConstInt(1000)),
            js::imul(secs, Value::ConstInt(1000)),
        );
        let resvar = self.result_var(op);
        self.bldr.emit_assignment(&resvar, &millis);
    }

    // ----- dispatch tables -----

    fn emit_withguard_op(&mut self, op: &Operation, guardop: &Operation) {
        match op.op {
            Op::IntAddOvf => self.genop_withguard_int_add_ovf(op, guardop),
            Op::IntSubOvf => self.genop_withguard_int_sub_ovf(op, guardop),
            Op::IntMulOvf => self.genop_withguard_int_mul_ovf(op, guardop),
            Op::CallMayForce => self.genop_withguard_call_may_force(op, guardop),
            Op::CallReleaseGil => self.genop_withguard_call_release_gil(op, guardop),
            Op::CallAssembler => self.genop_withguard_call_assembler(op, guardop),
            other => panic!("unimplemented op+guard pair: {:?}", other),
        }
    }

    fn emit_stmt_op(&mut self, op: &Operation) {
        match op.op {
            Op::Label | Op::DebugMergePoint | Op::JitDebug | Op::Keepalive => {}
            Op::Jump => self.genop_jump(op),
            Op::Finish => self.genop_finish(op),
            Op::GuardTrue => self.genop_guard_true(op),
            Op::GuardFalse => self.genop_guard_false(op),
            Op::GuardValue => self.genop_guard_value(op),
            Op::GuardClass => self.genop_guard_class(op),
            Op::GuardNonnull => self.genop_guard_nonnull(op),
            Op::GuardIsnull => self.genop_guard_isnull(op),
            Op::GuardNonnullClass => self.genop_guard_nonnull_class(op),
            Op::GuardException => self.genop_guard_exception(op),
            Op::GuardNoException => self.genop_guard_no_exception(op),
            Op::GuardNotInvalidated => self.genop_guard_not_invalidated(op),
            Op::ForceToken => self.genop_force_token(op),
            Op::Call => self.genop_call(op),
            Op::CallMallocGc => self.genop_call_malloc_gc(op),
            Op::CondCall => self.genop_cond_call(op),
            Op::CallMallocNursery => self.genop_call_malloc_nursery(op),
            Op::CallMallocNurseryVarsize => self.genop_call_malloc_nursery_varsize(op),
            Op::CallMallocNurseryVarsizeFrame => self.genop_call_malloc_nursery_varsize_frame(op),
            Op::CondCallGcWb => self.genop_cond_call_gc_wb(op, false),
            Op::CondCallGcWbArray => self.genop_cond_call_gc_wb(op, true),
            Op::StrSetItem => self.genop_strsetitem(op),
            Op::UnicodeSetItem => self.genop_unicodesetitem(op),
            Op::CopyStrContent => {
                let token = self.env().str_token;
                self.genop_copy_content(op, token);
            }
            Op::CopyUnicodeContent => {
                let token = self.env().unicode_token;
                self.genop_copy_content(op, token);
            }
            Op::GetFieldGc | Op::GetFieldRaw | Op::GetFieldGcPure | Op::GetFieldRawPure => {
                self.genop_getfield(op)
            }
            Op::SetFieldGc | Op::SetFieldRaw => self.genop_setfield(op),
            Op::GetInteriorFieldGc => self.genop_getinteriorfield(op),
            Op::SetInteriorFieldGc | Op::SetInteriorFieldRaw => self.genop_setinteriorfield(op),
            Op::GetArrayItemGc
            | Op::GetArrayItemRaw
            | Op::GetArrayItemGcPure
            | Op::GetArrayItemRawPure => self.genop_getarrayitem(op),
            Op::SetArrayItemGc | Op::SetArrayItemRaw => self.genop_setarrayitem(op),
            Op::RawLoad => self.genop_raw_load(op),
            Op::RawStore => self.genop_raw_store(op),
            Op::IntForceGeZero => self.genop_int_force_ge_zero(op),
            Op::FloatAbs => self.genop_float_abs(op),
            Op::ReadTimestamp => self.genop_read_timestamp(op),
            other => panic!("unimplemented statement op: {:?}", other),
        }
    }

    fn emit_expr_op(&mut self, op: &Operation) -> Value {
        let a = |this: &mut Self, i: usize| this.box_val(&op.args[i]);
        match op.op {
            // Two's-complement 32-bit arithmetic; division truncates toward
            // zero and % takes the sign of the dividend, as the dialect's
            // operators do under |0 coercion.
            Op::IntAdd => js::int_cast(js::plus(a(self, 0), a(self, 1))),
            Op::IntSub => js::int_cast(js::minus(a(self, 0), a(self, 1))),
            Op::IntMul => js::imul(a(self, 0), a(self, 1)),
            Op::IntFloordiv => js::int_cast(js::div(a(self, 0), a(self, 1))),
            Op::IntMod => js::int_cast(js::modulo(a(self, 0), a(self, 1))),
            Op::IntAnd => js::int_cast(js::and(a(self, 0), a(self, 1))),
            Op::IntOr => js::int_cast(js::or(a(self, 0), a(self, 1))),
            Op::IntXor => js::int_cast(js::xor(a(self, 0), a(self, 1))),
            Op::IntLshift => js::int_cast(js::lshift(a(self, 0), a(self, 1))),
            Op::IntRshift => js::int_cast(js::rshift(a(self, 0), a(self, 1))),
            Op::UintRshift => js::int_cast(js::urshift(a(self, 0), a(self, 1))),
            Op::IntLt => js::int_cast(js::less_than(a(self, 0), a(self, 1))),
            Op::IntLe => js::int_cast(js::less_than_eq(a(self, 0), a(self, 1))),
            Op::IntEq => js::int_cast(js::equal(a(self, 0), a(self, 1))),
            Op::IntNe => js::int_cast(js::not_equal(a(self, 0), a(self, 1))),
            Op::IntGt => js::int_cast(js::greater_than(a(self, 0), a(self, 1))),
            Op::IntGe => js::int_cast(js::greater_than_eq(a(self, 0), a(self, 1))),
            Op::PtrEq | Op::InstancePtrEq => js::int_cast(js::equal(a(self, 0), a(self, 1))),
            Op::PtrNe | Op::InstancePtrNe => js::int_cast(js::not_equal(a(self, 0), a(self, 1))),
            Op::UintLt => {
                js::less_than(js::unsigned_cast(a(self, 0)), js::unsigned_cast(a(self, 1)))
            }
            Op::UintLe => {
                js::less_than_eq(js::unsigned_cast(a(self, 0)), js::unsigned_cast(a(self, 1)))
            }
            Op::UintGt => {
                js::greater_than(js::unsigned_cast(a(self, 0)), js::unsigned_cast(a(self, 1)))
            }
            Op::UintGe => {
                js::greater_than_eq(js::unsigned_cast(a(self, 0)), js::unsigned_cast(a(self, 1)))
            }
            Op::UintFloordiv => js::unsigned_cast(js::div(
                js::unsigned_cast(a(self, 0)),
                js::unsigned_cast(a(self, 1)),
            )),
            Op::IntIsZero => js::unot(a(self, 0)),
            Op::IntIsTrue => js::unot(js::unot(a(self, 0))),
            Op::IntNeg => js::uminus(a(self, 0)),
            Op::IntInvert => js::uneg(a(self, 0)),
            Op::SameAs | Op::CastPtrToInt | Op::CastIntToPtr => a(self, 0),
            Op::FloatAdd => js::double_cast(js::plus(a(self, 0), a(self, 1))),
            Op::FloatSub => js::double_cast(js::minus(a(self, 0), a(self, 1))),
            Op::FloatMul => js::double_cast(js::mul(a(self, 0), a(self, 1))),
            Op::FloatTruediv => js::double_cast(js::div(a(self, 0), a(self, 1))),
            Op::FloatNeg => js::uminus(a(self, 0)),
            Op::FloatLt => js::int_cast(js::less_than(a(self, 0), a(self, 1))),
            Op::FloatLe => js::int_cast(js::less_than_eq(a(self, 0), a(self, 1))),
            Op::FloatEq => js::int_cast(js::equal(a(self, 0), a(self, 1))),
            Op::FloatNe => js::int_cast(js::not_equal(a(self, 0), a(self, 1))),
            Op::FloatGt => js::int_cast(js::greater_than(a(self, 0), a(self, 1))),
            Op::FloatGe => js::int_cast(js::greater_than_eq(a(self, 0), a(self, 1))),
            Op::CastFloatToInt => js::trunc_to_int(a(self, 0)),
            Op::CastIntToFloat => js::double_cast(a(self, 0)),
            Op::ConvertFloatBytesToLongLong | Op::ConvertLongLongBytesToFloat => {
                // The dialect has no 64-bit integer type, so these are
                // identity casts. That is wrong for the general case.
                warn!("{:?} lowered as an identity cast", op.op);
                a(self, 0)
            }
            Op::StrGetItem => self.genop_expr_strgetitem(op),
            Op::StrLen => self.genop_expr_strlen(op),
            Op::UnicodeGetItem => self.genop_expr_unicodegetitem(op),
            Op::UnicodeLen => self.genop_expr_unicodelen(op),
            Op::ArrayLenGc => self.genop_expr_arraylen(op),
            Op::GetFieldGcPure | Op::GetFieldRawPure => self.genop_expr_getfield_pure(op),
            Op::GetArrayItemGcPure | Op::GetArrayItemRawPure => {
                self.genop_expr_getarrayitem_pure(op)
            }
            other => panic!("unimplemented expression op: {:?}", other),
        }
    }
}

#[cfg(test)]
mod tests {
    use quickcheck_macros::quickcheck;

    // The overflow tests validate the sign-analysis formulas that the
    // emitters encode into the generated source, against 64-bit reference
    // arithmetic.

    fn add_overflows(a: i32, b: i32) -> bool {
        let res = a.wrapping_add(b);
        (a >= 0 && res < b) || (a < 0 && res > b)
    }

    fn sub_overflows(a: i32, b: i32) -> bool {
        let res = a.wrapping_sub(b);
        (b >= 0 && res > a) || (b < 0 && res < a)
    }

    fn mul_overflows(a: i32, b: i32) -> bool {
        let res = a.wrapping_mul(b);
        res as f64 != a as f64 * b as f64
    }

    #[quickcheck]
    fn prop_add_overflow_detection(a: i32, b: i32) -> bool {
        let wide = a as i64 + b as i64;
        add_overflows(a, b) == (wide < i32::MIN as i64 || wide > i32::MAX as i64)
    }

    #[quickcheck]
    fn prop_sub_overflow_detection(a: i32, b: i32) -> bool {
        let wide = a as i64 - b as i64;
        sub_overflows(a, b) == (wide < i32::MIN as i64 || wide > i32::MAX as i64)
    }

    #[quickcheck]
    fn prop_mul_overflow_detection(a: i32, b: i32) -> bool {
        let wide = a as i64 * b as i64;
        mul_overflows(a, b) == (wide < i32::MIN as i64 || wide > i32::MAX as i64)
    }

    #[test]
    fn test_overflow_boundaries() {
        assert!(add_overflows(i32::MAX, 1));
        assert!(!add_overflows(i32::MAX, 0));
        assert!(add_overflows(i32::MIN, -1));
        assert!(sub_overflows(i32::MIN, 1));
        assert!(!sub_overflows(0, i32::MAX));
        assert!(sub_overflows(0, i32::MIN));
        assert!(mul_overflows(i32::MAX, 2));
        assert!(!mul_overflows(i32::MAX, 1));
        assert!(mul_overflows(i32::MIN, -1));
    }
}
