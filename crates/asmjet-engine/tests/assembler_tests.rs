//! End-to-end assembler scenarios: traces in, installed source out.
//!
//! There is no JS engine in the loop; the tests drive the assembler against
//! the in-memory host registry and data heap, and assert on the structure
//! of the emitted source and on registry/heap state.

use std::rc::Rc;

use asmjet_engine::codegen::LoopTokenRef;
use asmjet_engine::host::HostEnv;
use asmjet_engine::ir::{
    BoxVal, CallDescr, CallResult, Descr, FailDescr, FieldDescr, Kind, Op, Operand, Operation,
    TargetToken,
};
use asmjet_engine::{AssembleError, Assembler};

fn ibox(id: u32) -> BoxVal {
    BoxVal::new(Kind::Int, id)
}

fn rbox(id: u32) -> BoxVal {
    BoxVal::new(Kind::Ref, id)
}

fn assembler() -> Assembler {
    Assembler::new(HostEnv::for_tests())
}

fn source_of(asm: &Assembler, token: &LoopTokenRef) -> String {
    let funcid = token.borrow().funcid();
    asm.env().funcs.source(funcid).expect("loop is installed").to_string()
}

/// S1: counting loop with a guard and a back-edge.
fn counting_loop_ops(label: &Rc<TargetToken>, guard: &Rc<FailDescr>) -> (Vec<BoxVal>, Vec<Operation>) {
    let i0 = ibox(0);
    let i1 = ibox(1);
    let i2 = ibox(2);
    let ops = vec![
        Operation::stmt(Op::Label, vec![i0.into()]).with_descr(Descr::Target(label.clone())),
        Operation::expr(Op::IntAdd, vec![i0.into(), Operand::ConstInt(1)], i1),
        Operation::expr(Op::IntLt, vec![i1.into(), Operand::ConstInt(100)], i2),
        Operation::stmt(Op::GuardTrue, vec![i2.into()])
            .with_descr(Descr::Fail(guard.clone()))
            .with_failargs(vec![Some(i1)]),
        Operation::stmt(Op::Jump, vec![i1.into()]).with_descr(Descr::Target(label.clone())),
    ];
    (vec![i0], ops)
}

#[test]
fn test_assemble_counting_loop() {
    let asm = assembler();
    let label = TargetToken::new();
    let guard = FailDescr::new();
    let (inputs, ops) = counting_loop_ops(&label, &guard);
    let token = asm.assemble_loop("count", inputs, ops).unwrap();
    let src = source_of(&asm, &token);

    assert!(src.starts_with("function jitted(label, frame) {"));
    assert!(src.contains("while (1) {"));
    assert!(src.contains("switch (label|0) {"));
    assert!(src.contains("i1 = ((i0 + 1)|0);"));
    assert!(src.contains("i2 = ((i1 < 100)|0);"));
    assert!(src.contains("if ((!i2)) {"));
    assert!(src.contains("continue;"));
    // Entry frame-depth check calls realloc_frame through the dyn table.
    assert!(src.contains("dynCall_iii(8220, frame, "));
}

#[test]
fn test_leading_label_makes_empty_entry_block() {
    let asm = assembler();
    let label = TargetToken::new();
    let guard = FailDescr::new();
    let (inputs, ops) = counting_loop_ops(&label, &guard);
    let token = asm.assemble_loop("count", inputs, ops).unwrap();
    let src = source_of(&asm, &token);

    // The trace starts with LABEL, so block 0 only shuffles args into
    // block 1 and continues the dispatch loop.
    assert!(src.contains("case 0:"));
    assert!(src.contains("case 1:"));
    assert!(src.contains("label = 1;"));
    assert_eq!(token.borrow().blocks().len(), 2);
    // The label token was placed at block 1 of this function.
    assert_eq!(label.funcid(), token.borrow().funcid());
    assert_eq!(label.label(), 1);
}

#[test]
fn test_guard_descr_is_annotated_by_assembly() {
    let asm = assembler();
    let label = TargetToken::new();
    let guard = FailDescr::new();
    let (inputs, ops) = counting_loop_ops(&label, &guard);
    let token = asm.assemble_loop("count", inputs, ops).unwrap();

    assert_eq!(guard.funcid(), token.borrow().funcid());
    assert_ne!(guard.gtoken_addr(), 0);
    assert_eq!(asm.env().heap.read_i32(guard.gtoken_addr()), 0);
    assert_eq!(guard.failkinds(), vec![Kind::Int]);
    assert_eq!(guard.faillocs(), vec![0]);
    // No refs among the failargs: both maps are null.
    assert_eq!(guard.gcmap(), 0);
    assert_eq!(guard.gcmap0(), 0);
    assert!(!guard.hasexc());
}

#[test]
fn test_ref_failarg_gets_gcmap_bit() {
    let asm = assembler();
    let guard = FailDescr::new();
    let p0 = rbox(0);
    let i1 = ibox(1);
    let ops = vec![
        Operation::expr(Op::IntAdd, vec![i1.into(), Operand::ConstInt(1)], ibox(2)),
        Operation::stmt(Op::GuardTrue, vec![ibox(2).into()])
            .with_descr(Descr::Fail(guard.clone()))
            .with_failargs(vec![Some(p0), Some(i1)]),
    ];
    asm.assemble_loop("refguard", vec![p0, i1], ops).unwrap();

    assert_eq!(guard.failkinds(), vec![Kind::Ref, Kind::Int]);
    assert_eq!(guard.faillocs(), vec![0, 4]);
    assert_ne!(guard.gcmap(), 0);
    // Frame word 0 holds the ref, word 1 the int.
    let bits = asm.env().heap.read_u32(guard.gcmap());
    assert_eq!(bits, 0b1);
}

/// S2: overflow detection by sign analysis.
#[test]
fn test_add_ovf_guard_emission() {
    let asm = assembler();
    let guard = FailDescr::new();
    let i0 = ibox(0);
    let i1 = ibox(1);
    let ops = vec![
        Operation::expr(Op::IntAddOvf, vec![i0.into(), Operand::ConstInt(1)], i1),
        Operation::stmt(Op::GuardNoOverflow, vec![])
            .with_descr(Descr::Fail(guard.clone()))
            .with_failargs(vec![Some(i1)]),
    ];
    let token = asm.assemble_loop("ovf", vec![i0], ops).unwrap();
    let src = source_of(&asm, &token);

    // Wrapped result, then the sign test against rhs.
    assert!(src.contains("i1 = ((i0 + 1)|0);"));
    assert!(src.contains("(i0 >= 0) & (i1 < 1)"));
    assert!(src.contains("(i0 < 0) & (i1 > 1)"));
}

#[test]
fn test_mul_ovf_compares_double_product() {
    let asm = assembler();
    let guard = FailDescr::new();
    let i0 = ibox(0);
    let i1 = ibox(1);
    let i2 = ibox(2);
    let ops = vec![
        Operation::expr(Op::IntMulOvf, vec![i0.into(), i1.into()], i2),
        Operation::stmt(Op::GuardNoOverflow, vec![])
            .with_descr(Descr::Fail(guard.clone()))
            .with_failargs(vec![Some(i2)]),
    ];
    let token = asm.assemble_loop("mulovf", vec![i0, i1], ops).unwrap();
    let src = source_of(&asm, &token);

    assert!(src.contains("i2 = (imul(i0, i1)|0);"));
    assert!(src.contains("d0 = ((+i0) * (+i1));"));
    assert!(src.contains("((+i2) != d0)"));
}

/// S3: inline nursery allocation and the write-barrier flag test.
#[test]
fn test_malloc_nursery_and_write_barrier() {
    let asm = assembler();
    let q0 = rbox(0);
    let p1 = rbox(1);
    let field = Rc::new(FieldDescr {
        offset: 8,
        size: 4,
        signed: true,
    });
    let ops = vec![
        Operation::expr(Op::CallMallocNursery, vec![Operand::ConstInt(16)], p1),
        Operation::stmt(Op::CondCallGcWb, vec![p1.into()]),
        Operation::stmt(Op::SetFieldGc, vec![p1.into(), q0.into()])
            .with_descr(Descr::Field(field)),
    ];
    let token = asm.assemble_loop("alloc", vec![q0], ops).unwrap();
    let src = source_of(&asm, &token);

    // Bump allocation against nursery_free/nursery_top.
    assert!(src.contains("(HEAP32[(16384) >> 2]|0)"));
    assert!(src.contains("(HEAP32[(16388) >> 2]|0)"));
    assert!(src.contains("HEAP32[(16384) >> 2] = "));
    // The barrier tests the flag byte before calling the barrier function.
    assert!(src.contains("HEAPU8["));
    assert!(src.contains("dynCall_vi(12288, i1)"));
    // The store itself.
    assert!(src.contains("HEAP32[((i1 + 8)) >> 2] = i0;"));
}

/// S4: bridging a guard patches its token cell and the reassembled source.
#[test]
fn test_bridge_patches_guard_dispatch() {
    let asm = assembler();
    let guard = FailDescr::new();
    let finish_a = FailDescr::new();
    let i0 = ibox(0);
    let i1 = ibox(1);
    let ops = vec![
        Operation::expr(Op::IntAdd, vec![i0.into(), Operand::ConstInt(1)], i1),
        Operation::stmt(Op::GuardTrue, vec![i0.into()])
            .with_descr(Descr::Fail(guard.clone()))
            .with_failargs(vec![Some(i1)]),
        Operation::stmt(Op::Finish, vec![i1.into()]).with_descr(Descr::Fail(finish_a.clone())),
    ];
    let token = asm.assemble_loop("bridged", vec![i0], ops).unwrap();

    // Before bridging, the guard carries the runtime re-entry check.
    let before = source_of(&asm, &token);
    assert!(before.contains("jitInvoke("));
    assert!(before.contains(&format!("HEAP32[((frame + 8)) >> 2] = {};", guard.raw_id())));

    let finish_b = FailDescr::new();
    let b0 = ibox(10);
    let bridge_ops =
        vec![Operation::stmt(Op::Finish, vec![b0.into()]).with_descr(Descr::Fail(finish_b.clone()))];
    asm.assemble_bridge(&guard, vec![b0], bridge_ops, &token).unwrap();

    // The token cell now names the first bridge block.
    assert_eq!(asm.env().heap.read_i32(guard.gtoken_addr()), 1);
    assert_eq!(token.borrow().blocks().len(), 2);

    let after = source_of(&asm, &token);
    assert!(after.contains("case 1:"));
    // The guard site became a local jump; no host re-entry remains.
    assert!(after.contains("label = 1;"));
    assert!(!after.contains("jitInvoke("));
    // Failing into the bridge finishes with the bridge's descr.
    assert!(after.contains(&format!("HEAP32[((frame + 8)) >> 2] = {};", finish_b.raw_id())));
}

/// P5: reassembling with no new bridges reproduces the source bit for bit.
#[test]
fn test_reassembly_is_idempotent() {
    let asm = assembler();
    let label = TargetToken::new();
    let guard = FailDescr::new();
    let (inputs, ops) = counting_loop_ops(&label, &guard);
    let token = asm.assemble_loop("count", inputs, ops).unwrap();

    let first = source_of(&asm, &token);
    token.borrow_mut().reassemble().unwrap();
    let second = source_of(&asm, &token);
    assert_eq!(first, second);
}

/// S5: redirecting a loop aliases its funcid to the new code.
#[test]
fn test_redirect_loop_copies_code() {
    let asm = assembler();
    let guard_a = FailDescr::new();
    let guard_b = FailDescr::new();
    let label_a = TargetToken::new();
    let label_b = TargetToken::new();
    let (inputs_a, ops_a) = counting_loop_ops(&label_a, &guard_a);
    let (inputs_b, ops_b) = counting_loop_ops(&label_b, &guard_b);
    let token_a = asm.assemble_loop("a", inputs_a, ops_a).unwrap();
    let token_b = asm.assemble_loop("b", inputs_b, ops_b).unwrap();

    asm.redirect_call_assembler(&token_a, &token_b).unwrap();
    let fid_a = token_a.borrow().funcid();
    let fid_b = token_b.borrow().funcid();
    assert!(token_a.borrow().is_redirected());
    assert_eq!(
        asm.env().funcs.source(fid_a).as_deref(),
        asm.env().funcs.source(fid_b).as_deref()
    );

    // Recompiling the target propagates to the redirected id.
    token_b.borrow_mut().reassemble().unwrap();
    assert_eq!(
        asm.env().funcs.source(fid_a).as_deref(),
        asm.env().funcs.source(fid_b).as_deref()
    );
}

#[test]
fn test_redirected_loop_rejects_reassembly() {
    let asm = assembler();
    let guard_a = FailDescr::new();
    let guard_b = FailDescr::new();
    let label_a = TargetToken::new();
    let label_b = TargetToken::new();
    let (inputs_a, ops_a) = counting_loop_ops(&label_a, &guard_a);
    let (inputs_b, ops_b) = counting_loop_ops(&label_b, &guard_b);
    let token_a = asm.assemble_loop("a", inputs_a, ops_a).unwrap();
    let token_b = asm.assemble_loop("b", inputs_b, ops_b).unwrap();
    asm.redirect_call_assembler(&token_a, &token_b).unwrap();

    let fid_a = token_a.borrow().funcid();
    let result = token_a.borrow_mut().reassemble();
    match result {
        Err(AssembleError::RedirectedLoop(id)) => assert_eq!(id, fid_a),
        other => panic!("expected RedirectedLoop, got {:?}", other.err()),
    }
}

/// S6: invalidation flips the heap cell that the compiled guard compares.
#[test]
fn test_invalidate_loop() {
    let asm = assembler();
    let guard = FailDescr::new();
    let i0 = ibox(0);
    let ops = vec![
        Operation::stmt(Op::GuardNotInvalidated, vec![])
            .with_descr(Descr::Fail(guard.clone()))
            .with_failargs(vec![Some(i0)]),
        Operation::stmt(Op::Finish, vec![i0.into()]),
    ];
    let token = asm.assemble_loop("inval", vec![i0], ops).unwrap();
    let src = source_of(&asm, &token);

    // The guard compares the live counter cell against its initial value.
    assert!(src.contains(" != 0)"));
    assert_eq!(token.borrow().invalidation_counter(), 0);

    asm.invalidate_loop(&token);
    assert_eq!(token.borrow().invalidation_counter(), 1);
    // The compiled compare is frozen in a fragment; only the cell changed.
    token.borrow_mut().reassemble().unwrap();
    assert_eq!(source_of(&asm, &token), src);
}

#[test]
fn test_jump_to_another_loop_chains_through_frame() {
    let asm = assembler();
    let label_a = TargetToken::new();
    let guard_a = FailDescr::new();
    let (inputs_a, ops_a) = counting_loop_ops(&label_a, &guard_a);
    let token_a = asm.assemble_loop("a", inputs_a, ops_a).unwrap();
    let fid_a = token_a.borrow().funcid();

    let b0 = ibox(0);
    let ops_b = vec![Operation::stmt(Op::Jump, vec![b0.into()]).with_descr(Descr::Target(label_a))];
    let token_b = asm.assemble_loop("b", vec![b0], ops_b).unwrap();
    let src_b = source_of(&asm, &token_b);

    // Cross-function jumps spill the args and encode (funcid << 8) | label
    // into the next-call word for the runner.
    assert!(src_b.contains("HEAP32[((frame + 40)) >> 2] = i0;"));
    assert!(src_b.contains(&format!("(({} << 8) | 1)", fid_a)));
    assert!(src_b.contains("HEAP32[((frame + 28)) >> 2] = "));
}

#[test]
fn test_finish_writes_descr_and_clears_next_call() {
    let asm = assembler();
    let finish = FailDescr::new();
    let i0 = ibox(0);
    let ops = vec![Operation::stmt(Op::Finish, vec![i0.into()]).with_descr(Descr::Fail(finish.clone()))];
    let token = asm.assemble_loop("finish", vec![i0], ops).unwrap();
    let src = source_of(&asm, &token);

    assert!(src.contains("HEAP32[((frame + 40)) >> 2] = i0;"));
    assert!(src.contains(&format!("HEAP32[((frame + 8)) >> 2] = {};", finish.raw_id())));
    assert!(src.contains("HEAP32[((frame + 28)) >> 2] = ((0 << 8) | 0);"));
    assert!(src.contains("return frame|0;"));
}

#[test]
fn test_call_release_gil_wraps_call() {
    let asm = assembler();
    let guard = FailDescr::new();
    let descr = Rc::new(CallDescr::new("", CallResult::Void));
    let ops = vec![
        Operation::stmt(Op::CallReleaseGil, vec![Operand::ConstInt(9999)])
            .with_descr(Descr::Call(descr)),
        Operation::stmt(Op::GuardNotForced, vec![])
            .with_descr(Descr::Fail(guard.clone()))
            .with_failargs(vec![]),
    ];
    let token = asm.assemble_loop("gil", vec![], ops).unwrap();
    let src = source_of(&asm, &token);

    // Release, call, reacquire, in order.
    let release = src.find("dynCall_v(8196)").expect("release_gil call");
    let callee = src.find("dynCall_v(9999)").expect("callee call");
    let reacquire = src.find("dynCall_v(8200)").expect("reacquire_gil call");
    assert!(release < callee && callee < reacquire);
    // The force descr is published before the call...
    assert!(src.contains(&format!("HEAP32[((frame + 12)) >> 2] = {};", guard.raw_id())));
    // ...and the not-forced guard tests the frame's descr slot after it.
    assert!(src.contains("if (((HEAP32[((frame + 8)) >> 2]|0) != 0)) {"));
    // The frame rides the shadow stack across the call.
    assert!(src.contains("HEAP32[(16392) >> 2] = "));
}

#[test]
fn test_guard_exception_captures_pending_exception() {
    let asm = assembler();
    let guard = FailDescr::new();
    let ops = vec![Operation::stmt(Op::GuardException, vec![Operand::ConstInt(777)])
        .with_descr(Descr::Fail(guard.clone()))
        .with_failargs(vec![])];
    let token = asm.assemble_loop("exc", vec![], ops).unwrap();
    let src = source_of(&asm, &token);

    assert!(guard.hasexc());
    // Guard test against the host exception slot, then clearing stores.
    assert!(src.contains("(HEAP32[(4096) >> 2]|0)"));
    assert!(src.contains("HEAP32[(4096) >> 2] = 0;"));
    assert!(src.contains("HEAP32[(4100) >> 2] = 0;"));
    // The guard body parks the exception value in the frame.
    assert!(src.contains("HEAP32[((frame + 16)) >> 2] = (HEAP32[(4100) >> 2]|0);"));
}

#[test]
fn test_frame_depth_accounting() {
    let asm = assembler();
    let label = TargetToken::new();
    let guard = FailDescr::new();
    let (inputs, ops) = counting_loop_ops(&label, &guard);
    let token = asm.assemble_loop("depth", inputs, ops).unwrap();

    // base_ofs is 40 bytes = 10 words; one int input adds one word.
    assert_eq!(token.borrow().frame_depth(), 11);
    assert_eq!(token.borrow().orig_frame_depth(), 11);
    let src = source_of(&asm, &token);
    assert!(src.contains("if (((HEAP32[((frame + 24)) >> 2]|0) < 11)) {"));
}

#[test]
fn test_useless_pure_op_is_elided() {
    let asm = assembler();
    let i0 = ibox(0);
    // i1 is never read, so the add disappears from the emitted code.
    let ops = vec![
        Operation::expr(Op::IntAdd, vec![i0.into(), Operand::ConstInt(1)], ibox(1)),
        Operation::stmt(Op::Finish, vec![i0.into()]),
    ];
    let token = asm.assemble_loop("dead", vec![i0], ops).unwrap();
    let src = source_of(&asm, &token);
    assert!(!src.contains("(i0 + 1)"));
}

#[test]
fn test_float_ops_and_sqrt_oopspec() {
    use asmjet_engine::ir::OopSpec;
    let asm = assembler();
    let d0 = BoxVal::new(Kind::Float, 0);
    let d1 = BoxVal::new(Kind::Float, 1);
    let d2 = BoxVal::new(Kind::Float, 2);
    let sqrt_descr = Rc::new(CallDescr {
        arg_classes: "f".to_owned(),
        result_type: CallResult::Float,
        result_size: 8,
        result_signed: true,
        oopspec: OopSpec::MathSqrt,
    });
    let ops = vec![
        Operation::expr(Op::FloatAdd, vec![d0.into(), Operand::ConstFloat(1.5)], d1),
        Operation::expr(Op::Call, vec![Operand::ConstInt(5555), d1.into()], d2)
            .with_descr(Descr::Call(sqrt_descr)),
        Operation::stmt(Op::Finish, vec![d2.into()]),
    ];
    let token = asm.assemble_loop("sqrt", vec![d0], ops).unwrap();
    let src = source_of(&asm, &token);

    assert!(src.contains("d1 = (+(d0 + 1.5));"));
    // The sqrt oopspec bypasses the dynamic call entirely.
    assert!(src.contains("d2 = sqrt((+d1));"));
    assert!(!src.contains("dynCall_df"));
    assert!(src.contains("HEAPF64[((frame + 40)) >> 3] = d2;"));
}

#[test]
fn test_call_result_narrower_than_word_is_extended() {
    let asm = assembler();
    let i0 = ibox(0);
    let i1 = ibox(1);
    let descr = Rc::new(CallDescr {
        arg_classes: "i".to_owned(),
        result_type: CallResult::Int,
        result_size: 2,
        result_signed: true,
        oopspec: asmjet_engine::ir::OopSpec::None,
    });
    let ops = vec![
        Operation::expr(Op::Call, vec![Operand::ConstInt(5555), i0.into()], i1)
            .with_descr(Descr::Call(descr)),
        Operation::stmt(Op::Finish, vec![i1.into()]),
    ];
    let token = asm.assemble_loop("narrow", vec![i0], ops).unwrap();
    let src = source_of(&asm, &token);
    assert!(src.contains("i1 = ((dynCall_ii(5555, i0) << 16) >> 16);"));
}

#[test]
fn test_freed_loop_releases_funcid() {
    let asm = assembler();
    let i0 = ibox(0);
    let ops = vec![Operation::stmt(Op::Finish, vec![i0.into()])];
    let token = asm.assemble_loop("gone", vec![i0], ops).unwrap();
    let funcid = token.borrow().funcid();
    assert!(asm.env().funcs.source(funcid).is_some());

    asm.free_loop_and_bridges(token);
    assert!(asm.env().funcs.source(funcid).is_none());
}
