//! Assembler facade: the entry points the meta-interpreter drives.
//!
//! Thin delegations to the loop token. The well-known runtime addresses
//! live in the [`HostEnv`] resolved once at construction.

use std::cell::RefCell;
use std::rc::Rc;
use tracing::debug;

use crate::codegen::loop_token::{CompiledLoop, LoopTokenRef};
use crate::host::HostEnv;
use crate::ir::{BoxVal, FailDescr, Operation};
use crate::AssembleError;

pub struct Assembler {
    env: HostEnv,
    debug: bool,
}

impl Assembler {
    pub fn new(env: HostEnv) -> Self {
        Assembler { env, debug: false }
    }

    /// Toggle comment emission in generated source.
    pub fn set_debug(&mut self, debug: bool) {
        self.debug = debug;
    }

    pub fn env(&self) -> &HostEnv {
        &self.env
    }

    /// Assemble and install a new loop function from a recorded trace.
    pub fn assemble_loop(
        &self,
        loopname: &str,
        inputargs: Vec<BoxVal>,
        operations: Vec<Operation>,
    ) -> Result<LoopTokenRef, AssembleError> {
        debug!(loopname, ops = operations.len(), "assembling loop");
        let mut clt = CompiledLoop::new(self.env.clone(), self.debug);
        let inputargs = inputargs.into_iter().map(Some).collect();
        clt.add_code_to_loop(operations, inputargs, None)?;
        Ok(Rc::new(RefCell::new(clt)))
    }

    /// Assemble, compile and link a bridge hanging off a failed guard.
    pub fn assemble_bridge(
        &self,
        faildescr: &Rc<FailDescr>,
        inputargs: Vec<BoxVal>,
        operations: Vec<Operation>,
        original_loop_token: &LoopTokenRef,
    ) -> Result<(), AssembleError> {
        debug!(
            funcid = faildescr.funcid(),
            ops = operations.len(),
            "assembling bridge"
        );
        let inputargs = inputargs.into_iter().map(Some).collect();
        original_loop_token
            .borrow_mut()
            .add_code_to_loop(operations, inputargs, Some(faildescr))
    }

    /// Route every future invocation of `oldlooptoken` to the new loop.
    pub fn redirect_call_assembler(
        &self,
        oldlooptoken: &LoopTokenRef,
        newlooptoken: &LoopTokenRef,
    ) -> Result<(), AssembleError> {
        let mut newclt = newlooptoken.borrow_mut();
        oldlooptoken.borrow_mut().redirect_to(&mut newclt)
    }

    /// Fail every `GUARD_NOT_INVALIDATED` compiled into the loop so far.
    pub fn invalidate_loop(&self, looptoken: &LoopTokenRef) {
        looptoken.borrow_mut().invalidate();
    }

    /// Dropping the token frees the funcid and the token's heap cells.
    pub fn free_loop_and_bridges(&self, looptoken: LoopTokenRef) {
        drop(looptoken);
    }
}
