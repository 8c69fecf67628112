//! Host environment: everything the backend consumes from its collaborators.
//!
//! The tracing frontend, GC and runner live outside this crate; the backend
//! only sees a bundle of opaque constants (frame-field offsets, well-known
//! function addresses, GC descriptor data) plus the function table and the
//! data heap. All addresses are 32-bit offsets into the target linear heap.

use std::sync::Arc;

use crate::host::{DataHeap, FuncTable};
use crate::ir::Kind;

/// Offsets of the well-known fields of a jit frame.
///
/// Provided by the host; the backend treats them as opaque constants.
#[derive(Debug, Clone, Copy)]
pub struct FrameLayout {
    /// Offset of frame slot 0 (start of the spill area).
    pub base_ofs: i32,
    /// Fail/finish descr written on exit.
    pub descr_ofs: i32,
    /// Force-descr slot read by external forcing code.
    pub force_descr_ofs: i32,
    /// Pending guard exception value.
    pub guard_exc_ofs: i32,
    /// Current GC map pointer.
    pub gcmap_ofs: i32,
    /// Allocated depth of this frame, in words.
    pub size_ofs: i32,
    /// Next-call word: `(funcid << 8) | label` for cross-function chaining.
    pub next_call_ofs: i32,
}

/// Addresses of the host's pending-exception slots.
#[derive(Debug, Clone, Copy)]
pub struct ExceptionSlots {
    pub pos_exception: u32,
    pub pos_exc_value: u32,
}

/// Well-known runtime function addresses, resolved once at setup.
#[derive(Debug, Clone, Copy)]
pub struct RuntimeAddrs {
    pub execute_trampoline: u32,
    pub release_gil: u32,
    pub reacquire_gil: u32,
    pub gc_malloc_nursery: u32,
    pub gc_malloc_array: u32,
    pub gc_malloc_str: u32,
    pub gc_malloc_unicode: u32,
    pub realloc_frame: u32,
}

/// Write-barrier descriptor, decoded from the GC.
#[derive(Debug, Clone, Copy)]
pub struct WriteBarrierDescr {
    pub func_addr: u32,
    pub array_func_addr: u32,
    pub jit_wb_if_flag_byteofs: i32,
    pub jit_wb_if_flag_singlebyte: i32,
    /// Zero when the GC does no card marking.
    pub jit_wb_cards_set: i32,
    pub jit_wb_cards_set_byteofs: i32,
    pub jit_wb_cards_set_singlebyte: i32,
    pub jit_wb_card_page_shift: i32,
}

/// GC parameters consumed by the inline allocation fast paths.
#[derive(Debug, Clone, Copy)]
pub struct GcConfig {
    pub write_barrier: Option<WriteBarrierDescr>,
    pub nursery_free_addr: u32,
    pub nursery_top_addr: u32,
    pub max_size_of_young_obj: i32,
    pub size_of_gc_header: i32,
    /// Address of the shadow-stack top pointer, when the GC uses one.
    pub shadow_stack_top_addr: Option<u32>,
    /// Whether the nursery slowpath takes the jit frame as a second arg.
    pub passes_frame_to_malloc: bool,
}

/// `(basesize, itemsize, len_offset)` of the string and unicode array types.
#[derive(Debug, Clone, Copy)]
pub struct ArrayToken {
    pub basesize: i32,
    pub itemsize: i32,
    pub len_ofs: i32,
}

/// The complete environment handed to the assembler at construction.
#[derive(Clone)]
pub struct HostEnv {
    pub funcs: Arc<FuncTable>,
    pub heap: Arc<DataHeap>,
    pub frame: FrameLayout,
    pub exc: ExceptionSlots,
    pub addrs: RuntimeAddrs,
    pub gc: GcConfig,
    pub str_token: ArrayToken,
    pub unicode_token: ArrayToken,
    /// Descr id installed when propagating a host exception out of the jit.
    pub propagate_exception_descr: u32,
    /// Done-with-this-frame sentinels per result kind, `None` for void.
    pub done_with_this_frame_void: u32,
    pub done_with_this_frame_int: u32,
    pub done_with_this_frame_ref: u32,
    pub done_with_this_frame_float: u32,
    /// Offset of the vtable pointer in instances, when type pointers exist.
    pub vtable_offset: Option<i32>,
}

impl HostEnv {
    /// Done-with-this-frame sentinel for the given result kind.
    pub fn done_with_this_frame(&self, kind: Option<Kind>) -> u32 {
        match kind {
            None => self.done_with_this_frame_void,
            Some(Kind::Int) => self.done_with_this_frame_int,
            Some(Kind::Ref) => self.done_with_this_frame_ref,
            Some(Kind::Float) => self.done_with_this_frame_float,
            Some(Kind::Hole) => self.done_with_this_frame_void,
        }
    }

    /// An environment with plausible constants, for tests and demos.
    pub fn for_tests() -> Self {
        HostEnv {
            funcs: Arc::new(FuncTable::new()),
            heap: Arc::new(DataHeap::new()),
            frame: FrameLayout {
                base_ofs: 40,
                descr_ofs: 8,
                force_descr_ofs: 12,
                guard_exc_ofs: 16,
                gcmap_ofs: 20,
                size_ofs: 24,
                next_call_ofs: 28,
            },
            exc: ExceptionSlots {
                pos_exception: 0x1000,
                pos_exc_value: 0x1004,
            },
            addrs: RuntimeAddrs {
                execute_trampoline: 0x2000,
                release_gil: 0x2004,
                reacquire_gil: 0x2008,
                gc_malloc_nursery: 0x200C,
                gc_malloc_array: 0x2010,
                gc_malloc_str: 0x2014,
                gc_malloc_unicode: 0x2018,
                realloc_frame: 0x201C,
            },
            gc: GcConfig {
                write_barrier: Some(WriteBarrierDescr {
                    func_addr: 0x3000,
                    array_func_addr: 0x3004,
                    jit_wb_if_flag_byteofs: 2,
                    jit_wb_if_flag_singlebyte: 0x01,
                    jit_wb_cards_set: 0x08,
                    jit_wb_cards_set_byteofs: 2,
                    jit_wb_cards_set_singlebyte: 0x08,
                    jit_wb_card_page_shift: 7,
                }),
                nursery_free_addr: 0x4000,
                nursery_top_addr: 0x4004,
                max_size_of_young_obj: 1 << 16,
                size_of_gc_header: 4,
                shadow_stack_top_addr: Some(0x4008),
                passes_frame_to_malloc: false,
            },
            str_token: ArrayToken {
                basesize: 12,
                itemsize: 1,
                len_ofs: 8,
            },
            unicode_token: ArrayToken {
                basesize: 12,
                itemsize: 4,
                len_ofs: 8,
            },
            propagate_exception_descr: 0xE000,
            done_with_this_frame_void: 0xD000,
            done_with_this_frame_int: 0xD004,
            done_with_this_frame_ref: 0xD008,
            done_with_this_frame_float: 0xD00C,
            vtable_offset: Some(0),
        }
    }
}
