//! Host collaborators: the function-id registry, the data heap, and the
//! bundle of opaque constants the backend consumes from the embedding.

mod env;
mod functable;
mod heap;

pub use env::{
    ArrayToken, ExceptionSlots, FrameLayout, GcConfig, HostEnv, RuntimeAddrs, WriteBarrierDescr,
};
pub use functable::{FuncId, FuncTable};
pub use heap::DataHeap;

use std::sync::Arc;

/// A loop token's private allocator over the shared [`DataHeap`].
///
/// Tracks every block it hands out and releases them en bloc on drop, so a
/// token's guard cells, counters and GC maps disappear with the token.
pub struct DataBlock {
    heap: Arc<DataHeap>,
    blocks: Vec<(u32, u32)>,
}

impl DataBlock {
    pub fn new(heap: Arc<DataHeap>) -> Self {
        DataBlock {
            heap,
            blocks: Vec::new(),
        }
    }

    /// Allocate `size` zeroed bytes; the address stays valid until the
    /// owning token is dropped.
    pub fn malloc(&mut self, size: u32) -> u32 {
        let addr = self.heap.alloc(size);
        self.blocks.push((addr, size));
        addr
    }

    pub fn heap(&self) -> &DataHeap {
        &self.heap
    }
}

impl Drop for DataBlock {
    fn drop(&mut self) {
        for &(addr, size) in &self.blocks {
            self.heap.release(addr, size);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_datablock_releases_on_drop() {
        let heap = Arc::new(DataHeap::new());
        let addr;
        {
            let mut block = DataBlock::new(heap.clone());
            addr = block.malloc(8);
            heap.write_i32(addr, 7);
        }
        // The freed range is reused by the next allocation.
        assert_eq!(heap.alloc(8), addr);
    }
}
