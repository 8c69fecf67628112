//! asmjet: a tracing-JIT backend that emits a restricted, typed dialect of
//! JavaScript as its target machine code.
//!
//! Given a recorded linear trace, the backend lowers it into a callable
//! function installed behind an opaque numeric handle in the host's
//! function table. Guard side exits are left as patchable placeholders:
//! attaching a bridge rewires one heap cell and re-serializes the owning
//! function from its frozen fragments.

pub mod arch;
pub mod codegen;
pub mod host;
pub mod ir;

pub use codegen::{Assembler, CompiledLoop, LoopTokenRef};
pub use host::HostEnv;

/// Errors the backend surfaces to its caller. Guard failures, invalidation
/// and pending host exceptions are behaviours of the emitted code, not of
/// the emitter; dispatch-table misses are developer errors and panic.
#[derive(Debug, thiserror::Error)]
pub enum AssembleError {
    /// A redirected loop can never be reassembled; its funcid now runs
    /// someone else's code.
    #[error("cannot reassemble redirected loop (funcid {0})")]
    RedirectedLoop(u32),
    /// The host registry has no function at this handle.
    #[error("unknown function id {0}")]
    UnknownFuncId(u32),
}
