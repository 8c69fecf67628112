//! Compiled loop token: owns a function handle and reassembles its source.
//!
//! A token owns one reserved funcid, the ordered list of compiled blocks,
//! and the heap cells the emitted code addresses (invalidation counter,
//! frame-info header, guard tokens, GC maps). Any change (a new bridge, a
//! redirect target picking up new code) re-serializes the whole function
//! and reinstalls it through the host registry.

use std::cell::RefCell;
use std::rc::Rc;
use tracing::debug;

use crate::arch::WORD;
use crate::codegen::block::{with_preserve_exception, BlockCompiler, CompiledBlock};
use crate::codegen::builder::JsBuilder;
use crate::codegen::frame::GcMapRef;
use crate::codegen::value::{self as js, HeapType, Value};
use crate::host::{DataBlock, HostEnv};
use crate::ir::{BoxVal, Descr, FailDescr, Op, Operand, Operation};
use crate::AssembleError;

/// Shared handle to a compiled loop.
pub type LoopTokenRef = Rc<RefCell<CompiledLoop>>;

/// The part of a loop token that block compilation mutates.
pub(crate) struct LoopInner {
    pub(crate) env: HostEnv,
    pub(crate) funcid: u32,
    pub(crate) data: DataBlock,
    pub(crate) frame_info_addr: u32,
    pub(crate) invalidation_addr: u32,
    pub(crate) debug: bool,
}

impl LoopInner {
    /// Record that some block needs the frame to reach `required_offset`
    /// bytes of spill area. The depth cell is monotone.
    pub(crate) fn ensure_frame_depth(&mut self, required_offset: i32) {
        debug_assert!(required_offset >= 0);
        debug_assert_eq!(required_offset % WORD as i32, 0);
        let words = self.env.frame.base_ofs / WORD as i32 + required_offset / WORD as i32;
        if self.env.heap.read_i32(self.frame_info_addr) < words {
            self.env.heap.write_i32(self.frame_info_addr, words);
        }
    }
}

/// One straight-line slice of a trace, waiting to be compiled.
struct BlockPlan {
    label: u32,
    operations: Vec<Operation>,
    inputargs: Vec<Option<BoxVal>>,
    outtoken: Option<Descr>,
    outputargs: Vec<Operand>,
}

pub struct CompiledLoop {
    inner: LoopInner,
    blocks: Vec<CompiledBlock>,
    /// GC refs lowered into the code, kept alive with the token.
    inlined_gcrefs: Vec<u32>,
    redirected_to: u32,
    redirected_funcids: Vec<u32>,
    orig_frame_depth: i32,
}

impl CompiledLoop {
    pub(crate) fn new(env: HostEnv, debug: bool) -> Self {
        let funcid = env.funcs.reserve();
        let mut data = DataBlock::new(env.heap.clone());
        let invalidation_addr = data.malloc(WORD as u32);
        let frame_info_addr = data.malloc(WORD as u32);
        let mut inner = LoopInner {
            env,
            funcid,
            data,
            frame_info_addr,
            invalidation_addr,
            debug,
        };
        inner.ensure_frame_depth(0);
        CompiledLoop {
            inner,
            blocks: Vec::new(),
            inlined_gcrefs: Vec::new(),
            redirected_to: 0,
            redirected_funcids: Vec::new(),
            orig_frame_depth: -1,
        }
    }

    pub fn funcid(&self) -> u32 {
        self.inner.funcid
    }

    pub fn blocks(&self) -> &[CompiledBlock] {
        &self.blocks
    }

    /// Frame slot layout of the loop's entry block.
    pub fn initial_locs(&self) -> &[i32] {
        self.blocks[0].inputlocs()
    }

    /// Entry GC map of block 0, used by callers that hand us a fresh frame.
    pub fn entry_gcmap(&self) -> GcMapRef {
        self.blocks[0].initial_gcmap()
    }

    /// Required frame depth, in words, as the emitted entry check sees it.
    pub fn frame_depth(&self) -> i32 {
        self.inner.env.heap.read_i32(self.inner.frame_info_addr)
    }

    pub fn invalidation_counter(&self) -> i32 {
        self.inner.env.heap.read_i32(self.inner.invalidation_addr)
    }

    /// Frame depth recorded when the loop itself (no bridges) was compiled.
    pub fn orig_frame_depth(&self) -> i32 {
        self.orig_frame_depth
    }

    pub fn is_redirected(&self) -> bool {
        self.redirected_to != 0
    }

    /// GC refs the generated code keeps alive.
    pub fn inlined_gcrefs(&self) -> &[u32] {
        &self.inlined_gcrefs
    }

    /// Split new operations into labelled blocks, compile them, and
    /// reassemble the function. With `intoken` set this is a bridge: the
    /// guard's token cell is pointed at the first new block.
    pub fn add_code_to_loop(
        &mut self,
        operations: Vec<Operation>,
        inputargs: Vec<Option<BoxVal>>,
        intoken: Option<&Rc<FailDescr>>,
    ) -> Result<(), AssembleError> {
        for op in &operations {
            for arg in &op.args {
                if let Operand::ConstPtr(ptr) = arg {
                    self.inlined_gcrefs.push(*ptr);
                }
            }
        }
        if let Some(descr) = intoken {
            self.inner
                .env
                .heap
                .write_i32(descr.gtoken_addr(), self.blocks.len() as i32);
        }

        let first_new = self.blocks.len();
        let mut plans: Vec<BlockPlan> = Vec::new();
        let mut start_op = 0;
        let mut inputargs = inputargs;
        for i in 0..operations.len() {
            let op = &operations[i];
            if op.op.is_guard() {
                // Guards get a fresh token cell, initially unbridged, and
                // learn which function they belong to.
                let gtoken = self.inner.data.malloc(WORD as u32);
                let faildescr = op.descr.as_ref().expect("guard has a descr").as_fail();
                faildescr.attach(self.inner.funcid, gtoken);
            } else if op.op == Op::Label {
                let labeldescr = op.descr.as_ref().expect("label has a descr").as_target().clone();
                // The preceding operations become a block that falls
                // through to this label. If the trace starts with a label
                // this makes an empty block holding only the jump.
                let label = (first_new + plans.len()) as u32;
                plans.push(BlockPlan {
                    label,
                    operations: operations[start_op..i].to_vec(),
                    inputargs: inputargs.clone(),
                    outtoken: Some(Descr::Target(labeldescr.clone())),
                    outputargs: op.args.clone(),
                });
                labeldescr.assign(self.inner.funcid, label + 1);
                start_op = i;
                inputargs = op.args.iter().map(|a| a.as_box()).collect();
            }
        }
        if start_op < operations.len() {
            let label = (first_new + plans.len()) as u32;
            plans.push(BlockPlan {
                label,
                operations: operations[start_op..].to_vec(),
                inputargs,
                outtoken: None,
                outputargs: Vec::new(),
            });
        }

        for plan in plans {
            let block = BlockCompiler::new(
                &mut self.inner,
                plan.label,
                plan.operations,
                plan.inputargs,
                plan.outtoken,
                plan.outputargs,
            )
            .generate();
            self.blocks.push(block);
        }
        if first_new == 0 {
            self.orig_frame_depth = self.frame_depth();
        }
        self.reassemble()
    }

    /// Bump the invalidation counter; every `GUARD_NOT_INVALIDATED`
    /// compiled against the old value now fails.
    pub fn invalidate(&mut self) {
        let counter = self.inner.env.heap.read_i32(self.inner.invalidation_addr);
        self.inner
            .env
            .heap
            .write_i32(self.inner.invalidation_addr, counter + 1);
    }

    /// Make this loop's funcid execute `newclt`'s code from now on.
    pub fn redirect_to(&mut self, newclt: &mut CompiledLoop) -> Result<(), AssembleError> {
        self.redirected_to = newclt.funcid();
        newclt.redirected_funcids.push(self.inner.funcid);
        self.inner
            .env
            .funcs
            .copy(newclt.funcid(), self.inner.funcid)
    }

    /// Re-serialize the whole function and reinstall it.
    ///
    /// The code is a switch-in-a-loop dispatching between the blocks:
    ///
    /// ```text
    /// function jitted(label, frame) {
    ///   if (frame too small) { realloc, preserving any exception }
    ///   switch (label) { case K: load input args for block K }
    ///   while (1) {
    ///     switch (label) { case K: body of block K }
    ///   }
    /// }
    /// ```
    ///
    /// The construct is known to be inefficient; the host compiler is
    /// expected to do the heavy lifting.
    pub fn reassemble(&mut self) -> Result<(), AssembleError> {
        if self.redirected_to != 0 {
            return Err(AssembleError::RedirectedLoop(self.inner.funcid));
        }
        let env = self.inner.env.clone();
        let mut bldr = JsBuilder::new(self.inner.debug);

        // Entry check: grow the frame if some bridge deepened our needs.
        // The input args must survive a collection inside realloc, so the
        // entry GC map for the target label goes in first.
        bldr.emit_comment("check frame depth");
        let req_depth = Value::ConstInt(self.frame_depth());
        let cur_depth = js::heap_data(HeapType::Int32, js::frame_size_addr(&env.frame));
        bldr.begin_if(&js::less_than(cur_depth, req_depth.clone()));
        bldr.begin_switch(&Value::Label);
        for block in &self.blocks {
            bldr.begin_case(&Value::ConstInt(block.label() as i32));
            let gcmap = block.initial_gcmap();
            bldr.emit_store(
                &Value::ConstInt(gcmap.addr as i32),
                &js::frame_gcmap_addr(&env.frame),
                HeapType::Int32,
            );
            bldr.end_case();
        }
        bldr.end_block();
        let realloc = Value::ConstInt(env.addrs.realloc_frame as i32);
        with_preserve_exception(&mut bldr, &env, |bldr| {
            let newframe = js::dyn_call("iii", realloc, vec![Value::Frame, req_depth]);
            bldr.emit_assignment(&Value::Frame, &newframe);
        });
        bldr.end_block();

        // Load the input args for the block being entered.
        bldr.emit_comment("load input args");
        bldr.begin_switch(&Value::Label);
        for block in &self.blocks {
            bldr.begin_case(&Value::ConstInt(block.label() as i32));
            block.emit_load_arguments(&mut bldr, &env);
            bldr.end_case();
        }
        bldr.begin_default();
        bldr.emit_exit();
        bldr.end_case();
        bldr.end_block();

        // The dispatch loop, one case per block body.
        bldr.emit_comment("main dispatch loop");
        bldr.begin_while(&Value::ConstInt(1));
        bldr.begin_switch(&Value::Label);
        for block in &self.blocks {
            bldr.begin_case(&Value::ConstInt(block.label() as i32));
            block.emit_body(&mut bldr, &env);
            bldr.end_case();
        }
        bldr.begin_default();
        bldr.emit_exit();
        bldr.end_case();
        bldr.end_block();
        bldr.end_block();

        let source = bldr.finish();
        debug!(
            funcid = self.inner.funcid,
            blocks = self.blocks.len(),
            bytes = source.len(),
            "recompiling loop"
        );
        env.funcs.recompile(self.inner.funcid, &source);
        for &dst in &self.redirected_funcids {
            env.funcs.copy(self.inner.funcid, dst)?;
        }
        Ok(())
    }
}

impl Drop for CompiledLoop {
    fn drop(&mut self) {
        // The data block releases the heap cells; the funcid goes back to
        // the host pool.
        self.inner.env.funcs.free(self.inner.funcid);
    }
}
